//! Guarded reservation transitions.
//!
//! Each function checks the caller's role and the current lifecycle, then
//! mutates the reservation in place. Nothing here touches storage; the engine
//! runs these inside a store transaction so a failed guard leaves no trace.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    hhmm, Actor, DateRange, Extension, InspectionReport, PaymentStatus, PriceBreakdown, RateCard,
    Reservation, ReservationStatus, StatusChange, Substitution,
};
use crate::pricing::{self, checked_sum};

pub fn require_role(r: &Reservation, user_id: Uuid, role: Actor) -> Result<()> {
    let allowed = match role {
        Actor::Driver => r.is_driver(user_id),
        Actor::Host => r.is_host(user_id),
        Actor::System => true,
    };
    if allowed {
        Ok(())
    } else if r.is_party(user_id) {
        Err(AppError::Forbidden(format!(
            "only the {} of {} may do this",
            role.as_str(),
            r.code
        )))
    } else {
        // Unrelated users do not learn the reservation exists.
        Err(AppError::ReservationNotFound(r.id))
    }
}

pub fn require_party(r: &Reservation, user_id: Uuid) -> Result<Actor> {
    if r.is_driver(user_id) {
        Ok(Actor::Driver)
    } else if r.is_host(user_id) {
        Ok(Actor::Host)
    } else {
        Err(AppError::ReservationNotFound(r.id))
    }
}

fn move_to(
    r: &mut Reservation,
    to: ReservationStatus,
    actor: Actor,
    note: Option<String>,
    at: DateTime<Utc>,
) -> Result<()> {
    let from = r.status();
    r.lifecycle = r.lifecycle.with_status(to)?;
    r.history.push(StatusChange {
        from: Some(from),
        to,
        actor,
        note,
        at,
    });
    Ok(())
}

pub fn confirm(r: &mut Reservation, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
    require_role(r, user_id, Actor::Host)?;
    if r.status() != ReservationStatus::Pending {
        return Err(AppError::invalid_transition("confirm", r.status()));
    }
    move_to(r, ReservationStatus::Confirmed, Actor::Host, None, at)
}

pub fn decline(
    r: &mut Reservation,
    user_id: Uuid,
    reason: Option<String>,
    at: DateTime<Utc>,
) -> Result<()> {
    require_role(r, user_id, Actor::Host)?;
    if r.status() != ReservationStatus::Pending {
        return Err(AppError::invalid_transition("decline", r.status()));
    }
    move_to(r, ReservationStatus::Cancelled, Actor::Host, reason, at)?;
    r.cancelled_by = Some(Actor::Host);
    Ok(())
}

pub fn cancel_by_driver(
    r: &mut Reservation,
    user_id: Uuid,
    reason: Option<String>,
    at: DateTime<Utc>,
) -> Result<()> {
    require_role(r, user_id, Actor::Driver)?;
    if r.status() != ReservationStatus::Pending {
        return Err(AppError::invalid_transition("cancel", r.status()));
    }
    move_to(r, ReservationStatus::Cancelled, Actor::Driver, reason, at)?;
    r.cancelled_by = Some(Actor::Driver);
    Ok(())
}

/// Pickup. Needs a paid confirmation, a completed inspection and a start date
/// that has arrived.
pub fn start(
    r: &mut Reservation,
    user_id: Uuid,
    inspection: &InspectionReport,
    today: NaiveDate,
    at: DateTime<Utc>,
) -> Result<()> {
    require_role(r, user_id, Actor::Driver)?;
    if r.status() != ReservationStatus::Confirmed {
        return Err(AppError::invalid_transition("start", r.status()));
    }
    if !r.lifecycle.is_paid() {
        return Err(AppError::invalid_transition("start", "confirmed but unpaid"));
    }
    if today < r.start_date {
        return Err(AppError::invalid_transition(
            "start",
            format!("scheduled to begin on {}", r.start_date),
        ));
    }
    if !inspection.completed {
        return Err(AppError::InvalidInput(
            "pickup inspection is not complete".to_string(),
        ));
    }
    let note = (!inspection.photos.is_empty())
        .then(|| format!("pickup inspection: {} photos", inspection.photos.len()));
    move_to(r, ReservationStatus::Active, Actor::Driver, note, at)
}

/// Return. Either party may report the return inspection.
pub fn complete(
    r: &mut Reservation,
    user_id: Uuid,
    inspection: &InspectionReport,
    at: DateTime<Utc>,
) -> Result<()> {
    let actor = require_party(r, user_id)?;
    if r.status() != ReservationStatus::Active {
        return Err(AppError::invalid_transition("return", r.status()));
    }
    if !inspection.completed {
        return Err(AppError::InvalidInput(
            "return inspection is not complete".to_string(),
        ));
    }
    let note = (!inspection.photos.is_empty())
        .then(|| format!("return inspection: {} photos", inspection.photos.len()));
    move_to(r, ReservationStatus::Completed, actor, note, at)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCancelOutcome {
    Cancelled { refund_due: bool },
    AlreadyCancelled { refund_due: bool },
}

impl HostCancelOutcome {
    pub fn refund_due(&self) -> bool {
        match self {
            HostCancelOutcome::Cancelled { refund_due }
            | HostCancelOutcome::AlreadyCancelled { refund_due } => *refund_due,
        }
    }
}

/// Host cancellation of a confirmed or active booking. Repeating it after it
/// succeeded is not an error, so a retry can still finish an owed refund.
pub fn host_cancel(
    r: &mut Reservation,
    user_id: Uuid,
    reason: Option<String>,
    at: DateTime<Utc>,
) -> Result<HostCancelOutcome> {
    require_role(r, user_id, Actor::Host)?;
    match r.status() {
        ReservationStatus::Cancelled if r.cancelled_by == Some(Actor::Host) => {
            Ok(HostCancelOutcome::AlreadyCancelled {
                refund_due: refund_outstanding(r),
            })
        }
        ReservationStatus::Confirmed | ReservationStatus::Active => {
            move_to(r, ReservationStatus::Cancelled, Actor::Host, reason, at)?;
            r.cancelled_by = Some(Actor::Host);
            Ok(HostCancelOutcome::Cancelled {
                refund_due: refund_outstanding(r),
            })
        }
        other => Err(AppError::invalid_transition("host-cancel", other)),
    }
}

/// A cancelled reservation holding captured money without a refund reference.
pub fn refund_outstanding(r: &Reservation) -> bool {
    r.status() == ReservationStatus::Cancelled
        && r.lifecycle.is_paid()
        && r.captured_cents > 0
        && r.refund_ref.is_none()
}

/// Records a captured initial payment. Returns `false` when the reservation
/// was already paid.
pub fn mark_paid(r: &mut Reservation, amount_cents: i64) -> Result<bool> {
    if r.lifecycle.is_paid() {
        return Ok(false);
    }
    match r.status() {
        ReservationStatus::Confirmed | ReservationStatus::Cancelled => {}
        other => return Err(AppError::invalid_transition("pay for", other)),
    }
    r.lifecycle = r.lifecycle.with_payment(PaymentStatus::Paid)?;
    r.captured_cents = checked_sum(&[r.captured_cents, amount_cents])?;
    Ok(true)
}

/// A priced extension waiting for its payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionPlan {
    pub seq: u32,
    pub quantity: u32,
    pub previous_end_date: NaiveDate,
    pub new_end_date: NaiveDate,
    #[serde(with = "hhmm")]
    pub dropoff_time: NaiveTime,
    pub base_cents: i64,
    pub insurance_cents: i64,
    pub cost_cents: i64,
}

impl ExtensionPlan {
    /// The days the extension adds, which are the only ones that need a fresh
    /// availability check.
    pub fn delta_range(&self) -> Result<DateRange> {
        DateRange::new(self.previous_end_date, self.new_end_date)
    }
}

fn require_extendable(r: &Reservation) -> Result<()> {
    match r.status() {
        ReservationStatus::Confirmed | ReservationStatus::Active if r.lifecycle.is_paid() => Ok(()),
        ReservationStatus::Confirmed => Err(AppError::invalid_transition(
            "extend",
            "confirmed but unpaid",
        )),
        other => Err(AppError::invalid_transition("extend", other)),
    }
}

/// Prices an extension at the vehicle's current rates, in the reservation's
/// own quantum.
pub fn plan_extension(
    r: &Reservation,
    user_id: Uuid,
    card: &RateCard,
    quantity: u32,
    dropoff_time: Option<NaiveTime>,
) -> Result<ExtensionPlan> {
    require_role(r, user_id, Actor::Driver)?;
    require_extendable(r)?;

    let base_cents = pricing::price(card, r.quantum, quantity)?;
    let new_end_date = r.quantum.end_date(r.end_date, quantity)?;
    let delta = DateRange::new(r.end_date, new_end_date)?;
    let insurance_cents = if r.insurance {
        pricing::insurance(card, delta.days())?
    } else {
        0
    };

    Ok(ExtensionPlan {
        seq: r.extensions.len() as u32 + 1,
        quantity,
        previous_end_date: r.end_date,
        new_end_date,
        dropoff_time: dropoff_time.unwrap_or(r.dropoff_time),
        base_cents,
        insurance_cents,
        cost_cents: checked_sum(&[base_cents, insurance_cents])?,
    })
}

/// Appends a paid extension. Fails with `Conflict` when the plan no longer
/// matches the reservation, e.g. another extension landed first.
pub fn apply_extension(
    r: &mut Reservation,
    plan: &ExtensionPlan,
    payment_intent_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    require_extendable(r)?;
    if r.end_date != plan.previous_end_date || plan.seq as usize != r.extensions.len() + 1 {
        return Err(AppError::Conflict(format!(
            "extension #{} of {} no longer matches the reservation",
            plan.seq, r.code
        )));
    }

    let extension_cents = checked_sum(&[r.price.extension_cents, plan.cost_cents])?;
    let total_cents = checked_sum(&[r.price.total_cents, plan.cost_cents])?;
    let captured_cents = checked_sum(&[r.captured_cents, plan.cost_cents])?;

    r.extensions.push(Extension {
        seq: plan.seq,
        quantity: plan.quantity,
        base_cents: plan.base_cents,
        insurance_cents: plan.insurance_cents,
        cost_cents: plan.cost_cents,
        previous_end_date: plan.previous_end_date,
        new_end_date: plan.new_end_date,
        dropoff_time: plan.dropoff_time,
        payment_intent_id: payment_intent_id.to_string(),
        created_at: at,
    });
    r.end_date = plan.new_end_date;
    r.dropoff_time = plan.dropoff_time;
    r.price.extension_cents = extension_cents;
    r.price.total_cents = total_cents;
    r.captured_cents = captured_cents;
    Ok(())
}

/// Moves the reservation onto another vehicle at `new_price`, keeping dates
/// and status.
pub fn reassign_vehicle(
    r: &mut Reservation,
    user_id: Uuid,
    to_vehicle_id: Uuid,
    new_price: PriceBreakdown,
    at: DateTime<Utc>,
) -> Result<Substitution> {
    require_role(r, user_id, Actor::Host)?;
    require_substitutable(r)?;
    if to_vehicle_id == r.vehicle_id {
        return Err(AppError::InvalidInput(
            "replacement must be a different vehicle".to_string(),
        ));
    }

    let substitution = Substitution {
        from_vehicle_id: r.vehicle_id,
        to_vehicle_id,
        previous_total_cents: r.price.total_cents,
        new_total_cents: new_price.total_cents,
        price_difference_cents: new_price.total_cents - r.price.total_cents,
        at,
    };
    r.vehicle_id = to_vehicle_id;
    r.price = new_price;
    r.substitutions.push(substitution.clone());
    Ok(substitution)
}

pub fn require_substitutable(r: &Reservation) -> Result<()> {
    match r.status() {
        ReservationStatus::Pending | ReservationStatus::Confirmed => Ok(()),
        other => Err(AppError::invalid_transition("substitute the vehicle of", other)),
    }
}
