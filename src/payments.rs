//! Payment reconciliation.
//!
//! The gateway is the source of truth for money; the `payment_intents` ledger
//! records which intents exist for which reservation and purpose and whether
//! their capture has been applied. Gateway calls never run while the
//! reservation row is locked: state is read, the gateway is asked, and the
//! outcome is applied in a fresh transaction that re-checks everything.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    availability,
    catalog::VehicleCatalog,
    clock::Clock,
    error::{AppError, Result},
    gateway::{bounded, CreateIntent, GatewayIntent, IntentStatus, PaymentGateway},
    metrics::{DomainEvent, Metrics},
    models::{Actor, ExtendRequest, Reservation, ReservationStatus},
    store::{lock_db, timestamp_col, uuid_col, ReservationStore},
    transitions::{self, ExtensionPlan},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Initial,
    Extension(u32),
}

impl Purpose {
    pub fn key(&self) -> String {
        match self {
            Purpose::Initial => "initial".to_string(),
            Purpose::Extension(seq) => format!("extension#{}", seq),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "initial" => Some(Purpose::Initial),
            _ => raw
                .strip_prefix("extension#")
                .and_then(|n| n.parse().ok())
                .filter(|n| *n > 0)
                .map(Purpose::Extension),
        }
    }
}

impl Serialize for Purpose {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.key())
    }
}

/// `(reservation, amount, purpose)`: a retried request for the same charge
/// maps to the same gateway intent.
pub fn idempotency_key(reservation_id: Uuid, amount_cents: i64, purpose: Purpose) -> String {
    format!("{}:{}:{}", reservation_id, amount_cents, purpose.key())
}

fn retry_key(base: &str, attempt: u32) -> String {
    format!("{}:retry{}", base, attempt)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Open,
    Applied,
    Void,
}

impl LedgerStatus {
    fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Open => "open",
            LedgerStatus::Applied => "applied",
            LedgerStatus::Void => "void",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(LedgerStatus::Open),
            "applied" => Some(LedgerStatus::Applied),
            "void" => Some(LedgerStatus::Void),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub intent_id: String,
    pub reservation_id: Uuid,
    pub purpose: Purpose,
    pub amount_cents: i64,
    pub idempotency_key: String,
    pub status: LedgerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<ExtensionPlan>,
    pub client_secret: Option<String>,
    pub refund_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Ledger persistence ──────────────────────────────────────────────────

fn create_ledger_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS payment_intents (
            intent_id TEXT PRIMARY KEY,
            reservation_id TEXT NOT NULL,
            purpose TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            extension_plan TEXT,
            client_secret TEXT,
            refund_ref TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_payment_intents_reservation
            ON payment_intents (reservation_id);
        "#,
    )?;
    Ok(())
}

const LEDGER_COLUMNS: &str = "intent_id, reservation_id, purpose, amount_cents, idempotency_key, \
    status, extension_plan, client_secret, refund_ref, created_at";

fn map_entry(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let purpose: String = row.get(2)?;
    let status: String = row.get(5)?;
    let plan: Option<String> = row.get(6)?;
    let invalid = |idx: usize, raw: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid ledger value: {}", raw).into(),
        )
    };

    Ok(LedgerEntry {
        intent_id: row.get(0)?,
        reservation_id: uuid_col(row, 1)?,
        purpose: Purpose::parse(&purpose).ok_or_else(|| invalid(2, &purpose))?,
        amount_cents: row.get(3)?,
        idempotency_key: row.get(4)?,
        status: LedgerStatus::parse(&status).ok_or_else(|| invalid(5, &status))?,
        extension: match plan {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
            })?),
            None => None,
        },
        client_secret: row.get(7)?,
        refund_ref: row.get(8)?,
        created_at: timestamp_col(row, 9)?,
    })
}

fn insert_entry(conn: &Connection, entry: &LedgerEntry) -> Result<()> {
    let plan = entry
        .extension
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO payment_intents ({}, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            LEDGER_COLUMNS
        ),
        params![
            entry.intent_id,
            entry.reservation_id.to_string(),
            entry.purpose.key(),
            entry.amount_cents,
            entry.idempotency_key,
            entry.status.as_str(),
            plan,
            entry.client_secret,
            entry.refund_ref,
            entry.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn entry_where(conn: &Connection, clause: &str, value: &str) -> Result<Option<LedgerEntry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {} FROM payment_intents WHERE {} = ?1", LEDGER_COLUMNS, clause),
            params![value],
            map_entry,
        )
        .optional()?;
    Ok(entry)
}

fn entry_by_intent(conn: &Connection, intent_id: &str) -> Result<Option<LedgerEntry>> {
    entry_where(conn, "intent_id", intent_id)
}

fn entry_by_key(conn: &Connection, key: &str) -> Result<Option<LedgerEntry>> {
    entry_where(conn, "idempotency_key", key)
}

pub fn entries_for(conn: &Connection, reservation_id: Uuid) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM payment_intents WHERE reservation_id = ?1 ORDER BY created_at",
        LEDGER_COLUMNS
    ))?;
    let rows = stmt.query_map(params![reservation_id.to_string()], map_entry)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn set_status(conn: &Connection, intent_id: &str, status: LedgerStatus) -> Result<()> {
    conn.execute(
        "UPDATE payment_intents SET status = ?1, updated_at = ?2 WHERE intent_id = ?3",
        params![status.as_str(), Utc::now().to_rfc3339(), intent_id],
    )?;
    Ok(())
}

/// Voids every open intent of a reservation whose price is about to change.
/// Runs inside the caller's transaction; the returned entries still need
/// [`PaymentReconciler::release_voided`] once it commits.
pub fn void_open_intents(conn: &Connection, reservation_id: Uuid) -> Result<Vec<LedgerEntry>> {
    let open: Vec<LedgerEntry> = entries_for(conn, reservation_id)?
        .into_iter()
        .filter(|e| e.status == LedgerStatus::Open)
        .collect();
    for entry in &open {
        set_status(conn, &entry.intent_id, LedgerStatus::Void)?;
    }
    Ok(open
        .into_iter()
        .map(|e| LedgerEntry {
            status: LedgerStatus::Void,
            ..e
        })
        .collect())
}

fn set_extension_plan(conn: &Connection, intent_id: &str, plan: &ExtensionPlan) -> Result<()> {
    conn.execute(
        "UPDATE payment_intents SET extension_plan = ?1, updated_at = ?2 \
         WHERE intent_id = ?3 AND status = 'open'",
        params![serde_json::to_string(plan)?, Utc::now().to_rfc3339(), intent_id],
    )?;
    Ok(())
}

fn set_refund_ref(conn: &Connection, intent_id: &str, refund_ref: &str) -> Result<()> {
    conn.execute(
        "UPDATE payment_intents SET refund_ref = ?1, updated_at = ?2 \
         WHERE intent_id = ?3 AND refund_ref IS NULL",
        params![refund_ref, Utc::now().to_rfc3339(), intent_id],
    )?;
    Ok(())
}

// ── Outcomes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntentResponse {
    pub intent_id: String,
    pub client_secret: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub purpose: Purpose,
    pub status: LedgerStatus,
}

#[derive(Debug, Serialize)]
pub struct ExtensionQuote {
    pub extension: ExtensionPlan,
    pub intent: PaymentIntentResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Paid,
    AlreadyApplied,
    ExtensionApplied { seq: u32 },
    /// The capture landed after the reservation was cancelled and was refunded.
    PaidAfterCancel { refund_ref: Option<String> },
}

#[derive(Debug, Serialize)]
pub struct PaymentReceipt {
    #[serde(flatten)]
    pub outcome: PaymentOutcome,
    pub reservation: Reservation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    AlreadyPaid,
    Recovered,
    NoPaymentOnFile,
    Processing,
}

#[derive(Debug, Serialize)]
pub struct ReconcileReport {
    pub outcome: ReconcileOutcome,
    pub recovered_extensions: Vec<u32>,
    pub reservation: Reservation,
}

#[derive(Debug, Serialize)]
pub struct RefundReport {
    pub refund_ref: Option<String>,
    pub refunded_cents: i64,
    pub reservation: Reservation,
}

enum Settlement {
    Already,
    Paid,
    PaidAfterCancel,
    Extended(u32),
    Unusable(AppError),
}

/// Errors that mean a captured charge can never be applied and must be given
/// back, as opposed to infrastructure failures that a retry may fix.
fn makes_capture_unusable(err: &AppError) -> bool {
    matches!(
        err,
        AppError::Conflict(_) | AppError::InvalidTransition { .. } | AppError::InvalidRange { .. }
    )
}

// ── Reconciler ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PaymentReconciler {
    store: ReservationStore,
    catalog: VehicleCatalog,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    currency: String,
    timeout: Duration,
}

impl PaymentReconciler {
    pub fn new(
        store: ReservationStore,
        catalog: VehicleCatalog,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        currency: &str,
        timeout: Duration,
    ) -> Result<Self> {
        create_ledger_table(&*lock_db(store.db())?)?;
        info!("Payment ledger initialized");

        Ok(Self {
            store,
            catalog,
            gateway,
            clock,
            metrics,
            currency: currency.to_string(),
            timeout,
        })
    }

    fn ledger<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = lock_db(self.store.db())?;
        f(&conn)
    }

    pub fn entries(&self, reservation_id: Uuid) -> Result<Vec<LedgerEntry>> {
        self.ledger(|c| entries_for(c, reservation_id))
    }

    fn pricing_incident(&self, message: String) {
        self.metrics.record(DomainEvent::PricingIncident);
        error!(target: "pricing_integrity", "{}", message);
    }

    /// Opens (or returns) the intent for the initial charge of a confirmed,
    /// unpaid reservation.
    pub async fn open_initial_intent(
        &self,
        user_id: Uuid,
        reservation_id: Uuid,
    ) -> Result<PaymentIntentResponse> {
        let r = self.store.get(reservation_id)?;
        transitions::require_role(&r, user_id, Actor::Driver)?;
        if r.lifecycle.is_paid() {
            return Err(AppError::invalid_transition("pay for", "already paid"));
        }
        if r.status() != ReservationStatus::Confirmed {
            return Err(AppError::invalid_transition("pay for", r.status()));
        }
        self.open_intent(&r, Purpose::Initial, r.price.initial_due(), None)
            .await
    }

    /// Quotes an extension at current rates and opens the intent that will
    /// fund it. The extension itself is appended when the payment is confirmed.
    pub async fn open_extension_intent(
        &self,
        user_id: Uuid,
        reservation_id: Uuid,
        req: &ExtendRequest,
    ) -> Result<ExtensionQuote> {
        let r = self.store.get(reservation_id)?;
        let vehicle = self.catalog.get(r.vehicle_id)?;
        let plan = transitions::plan_extension(
            &r,
            user_id,
            &vehicle.rate_card,
            req.quantity,
            req.dropoff_time,
        )?;

        let delta = plan.delta_range()?;
        let blocking = self.ledger(|c| {
            availability::blocking_reservations(c, r.vehicle_id, &delta, Some(r.id))
        })?;
        if let Some(first) = blocking.first() {
            return Err(AppError::Conflict(format!(
                "vehicle is booked from {} by {}",
                first.start_date, first.code
            )));
        }

        let intent = self
            .open_intent(
                &r,
                Purpose::Extension(plan.seq),
                plan.cost_cents,
                Some(plan.clone()),
            )
            .await?;
        Ok(ExtensionQuote {
            extension: plan,
            intent,
        })
    }

    async fn open_intent(
        &self,
        r: &Reservation,
        purpose: Purpose,
        amount_cents: i64,
        plan: Option<ExtensionPlan>,
    ) -> Result<PaymentIntentResponse> {
        let base = idempotency_key(r.id, amount_cents, purpose);
        let mut key = base.clone();
        let mut attempt = 0;

        // A void intent is dead; the same charge asked for again gets a fresh key.
        while let Some(existing) = self.ledger(|c| entry_by_key(c, &key))? {
            if existing.status == LedgerStatus::Void {
                attempt += 1;
                key = retry_key(&base, attempt);
                continue;
            }
            if let (LedgerStatus::Open, Some(plan)) = (existing.status, &plan) {
                if existing.extension.as_ref() != Some(plan) {
                    self.ledger(|c| set_extension_plan(c, &existing.intent_id, plan))?;
                }
            }
            return Ok(self.intent_response(existing));
        }

        let request = CreateIntent {
            reservation_id: r.id,
            amount_cents,
            currency: self.currency.clone(),
            purpose: purpose.key(),
            idempotency_key: key.clone(),
        };
        let intent = bounded(self.timeout, self.gateway.create_intent(&request)).await?;
        if intent.amount_cents != amount_cents || intent.reservation_id != r.id {
            self.pricing_incident(format!(
                "gateway intent {} for {} carries {} cents, expected {}",
                intent.id, r.code, intent.amount_cents, amount_cents
            ));
            return Err(AppError::AmountMismatch {
                expected: amount_cents,
                actual: intent.amount_cents,
            });
        }

        let entry = LedgerEntry {
            intent_id: intent.id.clone(),
            reservation_id: r.id,
            purpose,
            amount_cents,
            idempotency_key: key.clone(),
            status: LedgerStatus::Open,
            extension: plan,
            client_secret: intent.client_secret.clone(),
            refund_ref: None,
            created_at: self.clock.now(),
        };
        let stored = self.ledger(|c| {
            insert_entry(c, &entry)?;
            entry_by_key(c, &key)
        })?;

        info!(
            "Payment intent {} opened for {} ({}, {} cents)",
            intent.id,
            r.code,
            purpose.key(),
            amount_cents
        );
        Ok(self.intent_response(stored.unwrap_or(entry)))
    }

    fn intent_response(&self, entry: LedgerEntry) -> PaymentIntentResponse {
        PaymentIntentResponse {
            intent_id: entry.intent_id,
            client_secret: entry.client_secret,
            amount_cents: entry.amount_cents,
            currency: self.currency.clone(),
            purpose: entry.purpose,
            status: entry.status,
        }
    }

    fn entry_for(&self, reservation_id: Uuid, intent_id: &str) -> Result<LedgerEntry> {
        let entry = self
            .ledger(|c| entry_by_intent(c, intent_id))?
            .ok_or_else(|| AppError::IntentNotFound(intent_id.to_string()))?;
        if entry.reservation_id != reservation_id {
            self.pricing_incident(format!(
                "intent {} of reservation {} presented for reservation {}",
                intent_id, entry.reservation_id, reservation_id
            ));
            return Err(AppError::InvalidInput(format!(
                "intent {} does not belong to this reservation",
                intent_id
            )));
        }
        Ok(entry)
    }

    /// Compares the gateway's record against the ledger. The gateway wins on
    /// status; any disagreement on amount or owner is an integrity failure.
    fn verify_capture(&self, entry: &LedgerEntry, intent: &GatewayIntent) -> Result<()> {
        if intent.reservation_id != entry.reservation_id || intent.amount_cents != entry.amount_cents
        {
            self.pricing_incident(format!(
                "intent {} captured {} cents for {}, ledger expects {} cents for {}",
                intent.id,
                intent.amount_cents,
                intent.reservation_id,
                entry.amount_cents,
                entry.reservation_id
            ));
            return Err(AppError::AmountMismatch {
                expected: entry.amount_cents,
                actual: intent.amount_cents,
            });
        }
        match intent.status {
            IntentStatus::Succeeded => Ok(()),
            IntentStatus::Processing => Err(AppError::PaymentProcessing(format!(
                "intent {} is still processing",
                intent.id
            ))),
            IntentStatus::RequiresPayment => Err(AppError::PaymentDeclined(format!(
                "intent {} has not been paid",
                intent.id
            ))),
            IntentStatus::Failed | IntentStatus::Cancelled => Err(AppError::PaymentDeclined(
                format!("intent {} did not capture", intent.id),
            )),
        }
    }

    /// Applies a client-reported intent after re-fetching it from the gateway.
    pub async fn confirm(
        &self,
        user_id: Uuid,
        reservation_id: Uuid,
        intent_id: &str,
    ) -> Result<PaymentReceipt> {
        let r = self.store.get(reservation_id)?;
        transitions::require_role(&r, user_id, Actor::Driver)?;
        let entry = self.entry_for(reservation_id, intent_id)?;

        match entry.status {
            LedgerStatus::Applied => {
                return Ok(PaymentReceipt {
                    outcome: PaymentOutcome::AlreadyApplied,
                    reservation: r,
                })
            }
            LedgerStatus::Void => {
                match bounded(self.timeout, self.gateway.fetch_intent(intent_id)).await {
                    Ok(intent)
                        if intent.status == IntentStatus::Succeeded
                            && entry.refund_ref.is_none() =>
                    {
                        if let Err(e) = self.refund_voided(&entry).await {
                            warn!("Refund of void intent {} deferred: {}", intent_id, e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Could not check void intent {}: {}", intent_id, e),
                }
                return Err(AppError::Conflict(format!(
                    "intent {} is void; any capture on it is refunded",
                    intent_id
                )));
            }
            LedgerStatus::Open => {}
        }

        let intent = bounded(self.timeout, self.gateway.fetch_intent(intent_id)).await?;
        self.verify_capture(&entry, &intent)?;
        self.settle(entry).await
    }

    /// Server-side checkout: confirms the intent with the gateway using the
    /// given payment method, then applies it like [`PaymentReconciler::confirm`].
    pub async fn checkout(
        &self,
        user_id: Uuid,
        reservation_id: Uuid,
        intent_id: &str,
        payment_method: &str,
    ) -> Result<PaymentReceipt> {
        let r = self.store.get(reservation_id)?;
        transitions::require_role(&r, user_id, Actor::Driver)?;
        let entry = self.entry_for(reservation_id, intent_id)?;

        if entry.status == LedgerStatus::Open {
            let intent = bounded(
                self.timeout,
                self.gateway.confirm_intent(intent_id, payment_method),
            )
            .await?;
            if matches!(intent.status, IntentStatus::Failed | IntentStatus::Cancelled) {
                return Err(AppError::PaymentDeclined(format!(
                    "payment method was declined for intent {}",
                    intent_id
                )));
            }
        }
        self.confirm(user_id, reservation_id, intent_id).await
    }

    /// Applies a verified capture. Exactly one caller wins the ledger row; the
    /// rest see `AlreadyApplied`.
    async fn settle(&self, entry: LedgerEntry) -> Result<PaymentReceipt> {
        let now = self.clock.now();
        let (reservation, settlement) = self.store.mutate(entry.reservation_id, |tx, r| {
            match entry_by_intent(tx, &entry.intent_id)?.map(|e| e.status) {
                Some(LedgerStatus::Applied) => return Ok(Settlement::Already),
                Some(LedgerStatus::Void) => {
                    return Ok(Settlement::Unusable(AppError::Conflict(format!(
                        "intent {} was voided",
                        entry.intent_id
                    ))))
                }
                _ => {}
            }

            match entry.purpose {
                Purpose::Initial => {
                    let expected = r.price.initial_due();
                    if expected != entry.amount_cents {
                        warn!(
                            "Intent {} carries {} cents but {} now costs {}",
                            entry.intent_id, entry.amount_cents, r.code, expected
                        );
                        set_status(tx, &entry.intent_id, LedgerStatus::Void)?;
                        return Ok(Settlement::Unusable(AppError::Conflict(format!(
                            "{} was repriced to {} cents; open a new payment",
                            r.code, expected
                        ))));
                    }
                    if transitions::mark_paid(r, entry.amount_cents)? {
                        set_status(tx, &entry.intent_id, LedgerStatus::Applied)?;
                        if r.status() == ReservationStatus::Cancelled {
                            Ok(Settlement::PaidAfterCancel)
                        } else {
                            Ok(Settlement::Paid)
                        }
                    } else {
                        set_status(tx, &entry.intent_id, LedgerStatus::Void)?;
                        Ok(Settlement::Unusable(AppError::Conflict(format!(
                            "{} was already paid by another intent",
                            r.code
                        ))))
                    }
                }
                Purpose::Extension(seq) => {
                    let plan = entry.extension.clone().ok_or_else(|| {
                        AppError::Internal(anyhow::anyhow!(
                            "extension intent {} has no stored plan",
                            entry.intent_id
                        ))
                    })?;
                    let applied = plan.delta_range().and_then(|delta| {
                        if !availability::is_free(tx, r.vehicle_id, &delta, Some(r.id))? {
                            return Err(AppError::Conflict(format!(
                                "vehicle was booked from {} before extension #{} was paid",
                                delta.start, seq
                            )));
                        }
                        transitions::apply_extension(r, &plan, &entry.intent_id, now)
                    });
                    match applied {
                        Ok(()) => {
                            set_status(tx, &entry.intent_id, LedgerStatus::Applied)?;
                            Ok(Settlement::Extended(seq))
                        }
                        Err(e) if makes_capture_unusable(&e) => {
                            set_status(tx, &entry.intent_id, LedgerStatus::Void)?;
                            Ok(Settlement::Unusable(e))
                        }
                        Err(e) => Err(e),
                    }
                }
            }
        })?;

        let outcome = match settlement {
            Settlement::Already => PaymentOutcome::AlreadyApplied,
            Settlement::Paid => {
                self.metrics.record(DomainEvent::PaymentApplied);
                info!(
                    "Reservation {} paid by intent {} ({} cents)",
                    reservation.code, entry.intent_id, entry.amount_cents
                );
                PaymentOutcome::Paid
            }
            Settlement::Extended(seq) => {
                self.metrics.record(DomainEvent::PaymentApplied);
                info!(
                    "Reservation {} extended to {} by intent {} (extension #{})",
                    reservation.code, reservation.end_date, entry.intent_id, seq
                );
                PaymentOutcome::ExtensionApplied { seq }
            }
            Settlement::PaidAfterCancel => {
                self.metrics.record(DomainEvent::PaymentApplied);
                warn!(
                    "Capture {} arrived after {} was cancelled; refunding",
                    entry.intent_id, reservation.code
                );
                let refund_ref = match self.refund_reservation(reservation.id).await {
                    Ok(refund_ref) => refund_ref,
                    Err(e) => {
                        warn!("Refund for {} deferred: {}", reservation.code, e);
                        None
                    }
                };
                let reservation = self.store.get(reservation.id)?;
                return Ok(PaymentReceipt {
                    outcome: PaymentOutcome::PaidAfterCancel { refund_ref },
                    reservation,
                });
            }
            Settlement::Unusable(err) => {
                warn!(
                    "Capture {} for {} cannot be applied ({}); refunding it",
                    entry.intent_id, reservation.code, err
                );
                if let Err(e) = self.refund_voided(&entry).await {
                    warn!("Refund of void intent {} deferred: {}", entry.intent_id, e);
                }
                return Err(err);
            }
        };

        Ok(PaymentReceipt {
            outcome,
            reservation,
        })
    }

    async fn refund_voided(&self, entry: &LedgerEntry) -> Result<String> {
        if let Some(existing) = self
            .ledger(|c| entry_by_intent(c, &entry.intent_id))?
            .and_then(|e| e.refund_ref)
        {
            return Ok(existing);
        }
        let key = format!("{}:void", entry.intent_id);
        let refund = bounded(
            self.timeout,
            self.gateway
                .refund(entry.reservation_id, entry.amount_cents, &key),
        )
        .await?;
        self.ledger(|c| set_refund_ref(c, &entry.intent_id, &refund.id))?;
        self.metrics.record(DomainEvent::RefundIssued);
        info!(
            "Void intent {} refunded as {} ({} cents)",
            entry.intent_id, refund.id, entry.amount_cents
        );
        Ok(refund.id)
    }

    /// Cancels voided intents at the gateway. One that captured before the
    /// cancel reached it is refunded instead. Failures are left for
    /// [`PaymentReconciler::reconcile`], which refunds void captures it finds.
    pub async fn release_voided(&self, entries: &[LedgerEntry]) {
        for entry in entries {
            let cancelled =
                bounded(self.timeout, self.gateway.cancel_intent(&entry.intent_id)).await;
            let result = match cancelled {
                Ok(intent) if intent.status == IntentStatus::Succeeded => {
                    self.refund_voided(entry).await.map(|_| ())
                }
                Ok(_) => {
                    debug!("Intent {} cancelled at the gateway", entry.intent_id);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                warn!("Release of void intent {} deferred: {}", entry.intent_id, e);
            }
        }
    }

    /// Asks the gateway what was actually captured for a reservation and applies
    /// anything the server never heard about.
    pub async fn reconcile(&self, user_id: Uuid, reservation_id: Uuid) -> Result<ReconcileReport> {
        let r = self.store.get(reservation_id)?;
        transitions::require_party(&r, user_id)?;
        let was_paid = r.lifecycle.is_paid();

        let mut intents = match bounded(self.timeout, self.gateway.list_intents(reservation_id)).await
        {
            Ok(intents) => intents,
            Err(e) if was_paid => {
                warn!("Reconcile of paid {} skipped gateway: {}", r.code, e);
                return Ok(ReconcileReport {
                    outcome: ReconcileOutcome::AlreadyPaid,
                    recovered_extensions: Vec::new(),
                    reservation: r,
                });
            }
            Err(e) => return Err(e.into()),
        };
        intents.sort_by_key(|i| i.created_at);

        let mut recovered_initial = false;
        let mut processing = false;
        let mut recovered_extensions = Vec::new();

        for intent in intents {
            let entry = match self.ledger(|c| entry_by_intent(c, &intent.id))? {
                Some(entry) => entry,
                None => match self.adopt(&intent)? {
                    Some(entry) => entry,
                    None => continue,
                },
            };

            match entry.status {
                LedgerStatus::Applied => continue,
                LedgerStatus::Void => {
                    if entry.refund_ref.is_none() && intent.status == IntentStatus::Succeeded {
                        if let Err(e) = self.refund_voided(&entry).await {
                            warn!("Refund of void intent {} still pending: {}", entry.intent_id, e);
                        }
                    }
                    continue;
                }
                LedgerStatus::Open => {}
            }

            match intent.status {
                IntentStatus::Succeeded => {}
                IntentStatus::Processing => {
                    processing = true;
                    continue;
                }
                _ => continue,
            }
            if let Err(e) = self.verify_capture(&entry, &intent) {
                warn!("Skipping intent {} during reconcile: {}", intent.id, e);
                continue;
            }

            match self.settle(entry).await {
                Ok(receipt) => match receipt.outcome {
                    PaymentOutcome::Paid | PaymentOutcome::PaidAfterCancel { .. } => {
                        recovered_initial = true
                    }
                    PaymentOutcome::ExtensionApplied { seq } => recovered_extensions.push(seq),
                    PaymentOutcome::AlreadyApplied => {}
                },
                Err(e) => warn!("Captured intent {} not applied: {}", intent.id, e),
            }
        }

        let outcome = if was_paid {
            ReconcileOutcome::AlreadyPaid
        } else if recovered_initial {
            ReconcileOutcome::Recovered
        } else if processing {
            ReconcileOutcome::Processing
        } else {
            ReconcileOutcome::NoPaymentOnFile
        };

        let reservation = self.store.get(reservation_id)?;
        info!(
            "Reconciled {}: {:?}, {} extensions recovered",
            reservation.code,
            outcome,
            recovered_extensions.len()
        );
        Ok(ReconcileReport {
            outcome,
            recovered_extensions,
            reservation,
        })
    }

    /// Records a gateway intent the ledger lost track of. Only initial charges
    /// can be adopted; an extension is meaningless without its stored plan.
    fn adopt(&self, intent: &GatewayIntent) -> Result<Option<LedgerEntry>> {
        match Purpose::parse(&intent.purpose) {
            Some(Purpose::Initial) => {
                let entry = LedgerEntry {
                    intent_id: intent.id.clone(),
                    reservation_id: intent.reservation_id,
                    purpose: Purpose::Initial,
                    amount_cents: intent.amount_cents,
                    idempotency_key: idempotency_key(
                        intent.reservation_id,
                        intent.amount_cents,
                        Purpose::Initial,
                    ),
                    status: LedgerStatus::Open,
                    extension: None,
                    client_secret: intent.client_secret.clone(),
                    refund_ref: None,
                    created_at: intent.created_at,
                };
                self.ledger(|c| {
                    insert_entry(c, &entry)?;
                    entry_by_intent(c, &intent.id)
                })
            }
            _ => {
                warn!(
                    "Gateway intent {} ({}) has no ledger entry; leaving it alone",
                    intent.id, intent.purpose
                );
                Ok(None)
            }
        }
    }

    /// Refunds everything captured for a cancelled reservation. Safe to call
    /// any number of times: the gateway call is keyed per reservation and the
    /// reference is stored only once.
    pub async fn refund_reservation(&self, reservation_id: Uuid) -> Result<Option<String>> {
        let r = self.store.get(reservation_id)?;
        if let Some(existing) = r.refund_ref {
            return Ok(Some(existing));
        }
        if !transitions::refund_outstanding(&r) {
            return Ok(None);
        }

        let key = format!("{}:refund", reservation_id);
        let refund = bounded(
            self.timeout,
            self.gateway.refund(reservation_id, r.captured_cents, &key),
        )
        .await?;

        let (updated, newly_recorded) = self.store.mutate(reservation_id, |_, r| {
            if r.refund_ref.is_some() {
                return Ok(false);
            }
            r.refund_ref = Some(refund.id.clone());
            Ok(true)
        })?;

        if newly_recorded {
            self.metrics.record(DomainEvent::RefundIssued);
            info!(
                "Refund {} issued for {} ({} cents)",
                refund.id, updated.code, refund.amount_cents
            );
        }
        Ok(updated.refund_ref)
    }

    /// Host-facing retry of an outstanding refund.
    pub async fn retry_refund(&self, user_id: Uuid, reservation_id: Uuid) -> Result<RefundReport> {
        let r = self.store.get(reservation_id)?;
        transitions::require_role(&r, user_id, Actor::Host)?;
        if r.status() != ReservationStatus::Cancelled {
            return Err(AppError::invalid_transition("refund", r.status()));
        }

        let refund_ref = self.refund_reservation(reservation_id).await?;
        let reservation = self.store.get(reservation_id)?;
        Ok(RefundReport {
            refunded_cents: if refund_ref.is_some() {
                reservation.captured_cents
            } else {
                0
            },
            refund_ref,
            reservation,
        })
    }
}
