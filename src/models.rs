use chrono::{DateTime, Days, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Pickup time used when the booking request does not name one.
pub fn default_pickup_time() -> NaiveTime {
    NaiveTime::from_hms_opt(10, 0, 0).unwrap_or_default()
}

pub fn parse_hhmm(raw: &str) -> std::result::Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|_| format!("invalid time '{}', expected HH:MM", raw))
}

/// Serde adapter for wall-clock times written as `"HH:MM"`.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_hhmm(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::NaiveTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(time: &Option<NaiveTime>, s: S) -> Result<S::Ok, S::Error> {
            match time {
                Some(t) => s.serialize_str(&t.format("%H:%M").to_string()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveTime>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(raw) => super::super::parse_hhmm(&raw)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

// ── Lifecycle ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Active => "active",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ReservationStatus::Pending),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "active" => Some(ReservationStatus::Active),
            "completed" => Some(ReservationStatus::Completed),
            "cancelled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }

    /// Statuses that hold the vehicle for their date range.
    pub fn blocks_vehicle(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending | ReservationStatus::Confirmed | ReservationStatus::Active
        )
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "unpaid" => Some(PaymentStatus::Unpaid),
            "paid" => Some(PaymentStatus::Paid),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every `(status, payment)` pair a reservation may be in. Pending reservations are
/// never paid: payment opens only after the host confirms.
const ALLOWED_LIFECYCLES: [(ReservationStatus, PaymentStatus); 7] = [
    (ReservationStatus::Pending, PaymentStatus::Unpaid),
    (ReservationStatus::Confirmed, PaymentStatus::Unpaid),
    (ReservationStatus::Confirmed, PaymentStatus::Paid),
    (ReservationStatus::Active, PaymentStatus::Paid),
    (ReservationStatus::Completed, PaymentStatus::Paid),
    (ReservationStatus::Cancelled, PaymentStatus::Unpaid),
    (ReservationStatus::Cancelled, PaymentStatus::Paid),
];

/// The two orthogonal state axes of a reservation, only constructible from a
/// combination listed in the allowed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Lifecycle {
    status: ReservationStatus,
    payment_status: PaymentStatus,
}

impl Lifecycle {
    pub fn new(status: ReservationStatus, payment_status: PaymentStatus) -> Result<Self> {
        if ALLOWED_LIFECYCLES.contains(&(status, payment_status)) {
            Ok(Self {
                status,
                payment_status,
            })
        } else {
            Err(AppError::InvalidLifecycle(format!(
                "{} + {}",
                status, payment_status
            )))
        }
    }

    pub fn initial() -> Self {
        Self {
            status: ReservationStatus::Pending,
            payment_status: PaymentStatus::Unpaid,
        }
    }

    pub fn status(&self) -> ReservationStatus {
        self.status
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.payment_status
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status == PaymentStatus::Paid
    }

    pub fn with_status(self, status: ReservationStatus) -> Result<Self> {
        Self::new(status, self.payment_status)
    }

    pub fn with_payment(self, payment_status: PaymentStatus) -> Result<Self> {
        Self::new(self.status, payment_status)
    }
}

// ── Pricing inputs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantumType {
    Daily,
    Weekly,
    Monthly,
}

impl QuantumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantumType::Daily => "daily",
            QuantumType::Weekly => "weekly",
            QuantumType::Monthly => "monthly",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "daily" => Some(QuantumType::Daily),
            "weekly" => Some(QuantumType::Weekly),
            "monthly" => Some(QuantumType::Monthly),
            _ => None,
        }
    }

    /// Inclusive bounds on the quantity of one booking or extension.
    pub fn bounds(&self) -> (u32, u32) {
        match self {
            QuantumType::Daily => (1, 365),
            QuantumType::Weekly => (1, 52),
            QuantumType::Monthly => (1, 12),
        }
    }

    pub fn validate_quantity(&self, quantity: u32) -> Result<()> {
        let (min, max) = self.bounds();
        if quantity < min || quantity > max {
            return Err(AppError::invalid_range(format!(
                "{} quantity must be between {} and {}, got {}",
                self.as_str(),
                min,
                max,
                quantity
            )));
        }
        Ok(())
    }

    /// End date (exclusive) of `quantity` quanta starting at `start`.
    /// Months are calendar months.
    pub fn end_date(&self, start: NaiveDate, quantity: u32) -> Result<NaiveDate> {
        let end = match self {
            QuantumType::Daily => start.checked_add_days(Days::new(u64::from(quantity))),
            QuantumType::Weekly => start.checked_add_days(Days::new(7 * u64::from(quantity))),
            QuantumType::Monthly => start.checked_add_months(Months::new(quantity)),
        };
        end.ok_or_else(|| AppError::invalid_range("date range exceeds the supported calendar"))
    }
}

impl fmt::Display for QuantumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vehicle's prices in cents. Missing weekly or monthly tiers fall back to a
/// daily equivalent (see `pricing::unit_rate`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateCard {
    pub daily_rate_cents: i64,
    #[serde(default)]
    pub weekly_rate_cents: Option<i64>,
    #[serde(default)]
    pub monthly_rate_cents: Option<i64>,
    #[serde(default)]
    pub insurance_per_day_cents: Option<i64>,
}

impl RateCard {
    pub fn daily(daily_rate_cents: i64) -> Self {
        Self {
            daily_rate_cents,
            weekly_rate_cents: None,
            monthly_rate_cents: None,
            insurance_per_day_cents: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.daily_rate_cents <= 0 {
            return Err(AppError::InvalidInput(
                "daily_rate_cents must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("weekly_rate_cents", self.weekly_rate_cents),
            ("monthly_rate_cents", self.monthly_rate_cents),
            ("insurance_per_day_cents", self.insurance_per_day_cents),
        ] {
            if matches!(value, Some(v) if v <= 0) {
                return Err(AppError::InvalidInput(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

// ── Catalog ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Vehicle {
    pub id: Uuid,
    pub host_id: Uuid,
    pub name: String,
    pub available: bool,
    pub rate_card: RateCard,
    /// Offset of the vehicle's local time from UTC; `None` means UTC.
    pub utc_offset_minutes: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertVehicleRequest {
    pub host_id: Uuid,
    pub name: String,
    #[serde(default = "default_true")]
    pub available: bool,
    pub rate_card: RateCard,
    pub utc_offset_minutes: Option<i32>,
}

fn default_true() -> bool {
    true
}

// ── Date ranges ─────────────────────────────────────────────────────────

/// Half-open calendar range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end <= start {
            return Err(AppError::invalid_range(format!(
                "end date {} must be after start date {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

// ── Reservation ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Driver,
    Host,
    System,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::Driver => "driver",
            Actor::Host => "host",
            Actor::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "driver" => Some(Actor::Driver),
            "host" => Some(Actor::Host),
            "system" => Some(Actor::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusChange {
    pub from: Option<ReservationStatus>,
    pub to: ReservationStatus,
    pub actor: Actor,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// Immutable record of one paid extension.
#[derive(Debug, Clone, Serialize)]
pub struct Extension {
    pub seq: u32,
    pub quantity: u32,
    pub base_cents: i64,
    pub insurance_cents: i64,
    pub cost_cents: i64,
    pub previous_end_date: NaiveDate,
    pub new_end_date: NaiveDate,
    #[serde(with = "hhmm")]
    pub dropoff_time: NaiveTime,
    pub payment_intent_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Substitution {
    pub from_vehicle_id: Uuid,
    pub to_vehicle_id: Uuid,
    pub previous_total_cents: i64,
    pub new_total_cents: i64,
    pub price_difference_cents: i64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceBreakdown {
    pub base_cents: i64,
    pub insurance_cents: i64,
    pub extension_cents: i64,
    pub total_cents: i64,
}

impl PriceBreakdown {
    /// The amount owed before any extension: base plus insurance.
    pub fn initial_due(&self) -> i64 {
        self.base_cents + self.insurance_cents
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Reservation {
    pub id: Uuid,
    pub code: String,
    pub vehicle_id: Uuid,
    pub driver_id: Uuid,
    pub host_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(with = "hhmm")]
    pub pickup_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub dropoff_time: NaiveTime,
    pub quantum: QuantumType,
    pub quantity: u32,
    pub insurance: bool,
    pub price: PriceBreakdown,
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
    pub message: Option<String>,
    pub captured_cents: i64,
    pub refund_ref: Option<String>,
    pub cancelled_by: Option<Actor>,
    pub extensions: Vec<Extension>,
    pub history: Vec<StatusChange>,
    pub substitutions: Vec<Substitution>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn status(&self) -> ReservationStatus {
        self.lifecycle.status()
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.lifecycle.payment_status()
    }

    pub fn range(&self) -> DateRange {
        DateRange {
            start: self.start_date,
            end: self.end_date,
        }
    }

    pub fn is_driver(&self, user_id: Uuid) -> bool {
        self.driver_id == user_id
    }

    pub fn is_host(&self, user_id: Uuid) -> bool {
        self.host_id == user_id
    }

    pub fn is_party(&self, user_id: Uuid) -> bool {
        self.is_driver(user_id) || self.is_host(user_id)
    }
}

// ── Reservation requests ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CreateReservationRequest {
    pub vehicle_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    #[serde(default, with = "hhmm::option")]
    pub pickup_time: Option<NaiveTime>,
    pub quantum: QuantumType,
    pub quantity: u32,
    #[serde(default)]
    pub insurance: bool,
    pub message: Option<String>,
}

/// Optional body of decline and cancel calls.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransitionNote {
    pub reason: Option<String>,
}

/// Completion report from the inspection collaborator. Only `completed` guards
/// the transition; photos are evidence references kept by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct InspectionReport {
    pub completed: bool,
    #[serde(default)]
    pub photos: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtendRequest {
    pub quantity: u32,
    #[serde(default, with = "hhmm::option")]
    pub dropoff_time: Option<NaiveTime>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmPaymentRequest {
    pub intent_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub payment_method: String,
}

#[derive(Debug, Deserialize)]
pub struct SubstituteRequest {
    pub vehicle_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ListReservationsQuery {
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Serialize)]
pub struct AvailabilityResponse {
    pub vehicle_id: Uuid,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub flagged_available: bool,
    pub available: bool,
    pub blocking: Vec<String>,
}

// ── Upload relay models ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RelayedImage {
    pub seq: u32,
    pub image_ref: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: String,
    pub label: Option<String>,
    pub images: Vec<RelayedImage>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateUploadSessionRequest {
    pub label: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateUploadSessionResponse {
    pub session_id: String,
    pub consumer_url: String,
    pub label: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct UploadImageRequest {
    pub image_ref: String,
}

#[derive(Debug, Serialize)]
pub struct UploadImageResponse {
    pub count: usize,
    pub seq: u32,
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub since: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub session_id: String,
    pub label: Option<String>,
    pub images: Vec<RelayedImage>,
    pub count: usize,
    /// The newest image; consumers with "latest wins" semantics read only this.
    pub latest: Option<RelayedImage>,
    pub expires_at: DateTime<Utc>,
}
