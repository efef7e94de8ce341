use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    catalog::VehicleCatalog,
    clock::Clock,
    error::{AppError, Result},
    metrics::{DomainEvent, Metrics},
    models::{
        default_pickup_time, Actor, CreateReservationRequest, InspectionReport, Reservation,
        ReservationStatus,
    },
    overdue::{self, OverdueStatus},
    payments::PaymentReconciler,
    pricing,
    store::{NewReservation, ReservationStore},
    transitions::{self, HostCancelOutcome},
};

/// A reservation as a party sees it, with the overdue classification computed
/// at read time.
#[derive(Debug, Serialize)]
pub struct ReservationView {
    #[serde(flatten)]
    pub reservation: Reservation,
    pub overdue: OverdueStatus,
}

#[derive(Debug, Serialize)]
pub struct HostCancelReport {
    pub reservation: Reservation,
    pub refund_ref: Option<String>,
    /// Money is still held and the refund has to be retried.
    pub refund_pending: bool,
}

#[derive(Clone)]
pub struct ReservationEngine {
    store: ReservationStore,
    catalog: VehicleCatalog,
    payments: PaymentReconciler,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl ReservationEngine {
    pub fn new(
        store: ReservationStore,
        catalog: VehicleCatalog,
        payments: PaymentReconciler,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            catalog,
            payments,
            clock,
            metrics,
        }
    }

    pub fn payments(&self) -> &PaymentReconciler {
        &self.payments
    }

    pub fn create(&self, driver_id: Uuid, req: CreateReservationRequest) -> Result<Reservation> {
        let vehicle = self.catalog.get(req.vehicle_id)?;
        if !vehicle.available {
            return Err(AppError::Conflict(format!(
                "vehicle {} is not available for booking",
                vehicle.name
            )));
        }
        if vehicle.host_id == driver_id {
            return Err(AppError::InvalidInput(
                "hosts cannot book their own vehicle".to_string(),
            ));
        }
        if let Some(message) = &req.message {
            if message.len() > 2000 {
                return Err(AppError::InvalidInput(
                    "message must be at most 2000 characters".to_string(),
                ));
            }
        }

        req.quantum.validate_quantity(req.quantity)?;
        let today = self.clock.today();
        if req.start_date < today {
            return Err(AppError::invalid_range(format!(
                "start date {} is in the past",
                req.start_date
            )));
        }

        let quote = pricing::quote(
            &vehicle.rate_card,
            req.quantum,
            req.quantity,
            req.start_date,
            req.insurance,
        )?;
        check_requested_end(req.start_date, req.end_date, quote.end_date)?;

        let reservation = self.store.create(NewReservation {
            vehicle_id: vehicle.id,
            driver_id,
            host_id: vehicle.host_id,
            quote,
            pickup_time: req.pickup_time.unwrap_or_else(default_pickup_time),
            insurance: req.insurance,
            message: req.message,
            created_at: self.clock.now(),
        })?;

        self.metrics.record(DomainEvent::ReservationCreated);
        info!(
            "Reservation {} created for {} ({} to {}, {} cents)",
            reservation.code,
            vehicle.name,
            reservation.start_date,
            reservation.end_date,
            reservation.price.total_cents
        );
        Ok(reservation)
    }

    fn transition<T, F>(&self, id: Uuid, action: &str, f: F) -> Result<(Reservation, T)>
    where
        F: FnOnce(&mut Reservation) -> Result<T>,
    {
        let mut from = None;
        let (reservation, outcome) = self.store.mutate(id, |_, r| {
            from = Some(r.status());
            f(r)
        })?;

        if from != Some(reservation.status()) {
            self.metrics.record(DomainEvent::Transition);
            let actor = reservation
                .history
                .last()
                .map(|h| h.actor.as_str())
                .unwrap_or("unknown");
            info!(
                "Reservation {} {}: {} -> {} by {}",
                reservation.code,
                action,
                from.map(|s| s.as_str()).unwrap_or("?"),
                reservation.status(),
                actor
            );
        }
        Ok((reservation, outcome))
    }

    pub fn confirm(&self, user_id: Uuid, id: Uuid) -> Result<Reservation> {
        let now = self.clock.now();
        let (r, ()) = self.transition(id, "confirmed", |r| transitions::confirm(r, user_id, now))?;
        Ok(r)
    }

    pub fn decline(&self, user_id: Uuid, id: Uuid, reason: Option<String>) -> Result<Reservation> {
        let now = self.clock.now();
        let (r, ()) = self.transition(id, "declined", |r| {
            transitions::decline(r, user_id, reason, now)
        })?;
        Ok(r)
    }

    pub fn cancel(&self, user_id: Uuid, id: Uuid, reason: Option<String>) -> Result<Reservation> {
        let now = self.clock.now();
        let (r, ()) = self.transition(id, "cancelled", |r| {
            transitions::cancel_by_driver(r, user_id, reason, now)
        })?;
        Ok(r)
    }

    pub fn start(
        &self,
        user_id: Uuid,
        id: Uuid,
        inspection: &InspectionReport,
    ) -> Result<Reservation> {
        let now = self.clock.now();
        let today = self.clock.today();
        let (r, ()) = self.transition(id, "started", |r| {
            transitions::start(r, user_id, inspection, today, now)
        })?;
        Ok(r)
    }

    pub fn complete(
        &self,
        user_id: Uuid,
        id: Uuid,
        inspection: &InspectionReport,
    ) -> Result<Reservation> {
        let now = self.clock.now();
        let (r, ()) = self.transition(id, "returned", |r| {
            transitions::complete(r, user_id, inspection, now)
        })?;
        Ok(r)
    }

    /// Cancels a confirmed or active reservation on the host's behalf and
    /// refunds whatever was captured. The cancellation commits before the
    /// gateway is called; a failed refund leaves `refund_pending` set and can be
    /// retried by cancelling again or through the refund endpoint.
    pub async fn host_cancel(
        &self,
        user_id: Uuid,
        id: Uuid,
        reason: Option<String>,
    ) -> Result<HostCancelReport> {
        let now = self.clock.now();
        let (reservation, outcome) = self.transition(id, "host-cancelled", |r| {
            transitions::host_cancel(r, user_id, reason, now)
        })?;
        if let HostCancelOutcome::AlreadyCancelled { .. } = outcome {
            info!("Reservation {} was already cancelled by its host", reservation.code);
        }

        if !outcome.refund_due() {
            return Ok(HostCancelReport {
                refund_ref: reservation.refund_ref.clone(),
                refund_pending: false,
                reservation,
            });
        }

        match self.payments.refund_reservation(id).await {
            Ok(refund_ref) => {
                let reservation = self.store.get(id)?;
                Ok(HostCancelReport {
                    refund_pending: refund_ref.is_none(),
                    refund_ref,
                    reservation,
                })
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "Refund for host-cancelled {} deferred: {}",
                    reservation.code, e
                );
                Ok(HostCancelReport {
                    refund_ref: None,
                    refund_pending: true,
                    reservation,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn view(&self, reservation: Reservation) -> ReservationView {
        let offset = self
            .catalog
            .get(reservation.vehicle_id)
            .ok()
            .and_then(|v| v.utc_offset_minutes);
        let overdue = overdue::classify(&reservation, offset, self.clock.now());
        ReservationView {
            reservation,
            overdue,
        }
    }

    pub fn get(&self, user_id: Uuid, id: Uuid) -> Result<ReservationView> {
        let reservation = self.store.get(id)?;
        transitions::require_party(&reservation, user_id)?;
        Ok(self.view(reservation))
    }

    pub fn list(&self, user_id: Uuid, role: Option<Actor>) -> Result<Vec<ReservationView>> {
        Ok(self
            .store
            .list_for_user(user_id, role)?
            .into_iter()
            .map(|r| self.view(r))
            .collect())
    }

    /// Live reservations that are past due, for either party.
    pub fn overdue_for(&self, user_id: Uuid) -> Result<Vec<ReservationView>> {
        Ok(self
            .list(user_id, None)?
            .into_iter()
            .filter(|v| {
                v.overdue.overdue
                    && matches!(
                        v.reservation.status(),
                        ReservationStatus::Confirmed | ReservationStatus::Active
                    )
            })
            .collect())
    }
}

/// A client may echo the end date; it has to agree with the quantum.
fn check_requested_end(
    start: NaiveDate,
    requested: Option<NaiveDate>,
    derived: NaiveDate,
) -> Result<()> {
    match requested {
        Some(end) if end <= start => Err(AppError::invalid_range(format!(
            "end date {} must be after start date {}",
            end, start
        ))),
        Some(end) if end != derived => Err(AppError::invalid_range(format!(
            "end date {} does not match the requested quantity (expected {})",
            end, derived
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::SandboxGateway;
    use crate::models::{PaymentStatus, QuantumType, RateCard, UpsertVehicleRequest};
    use crate::store::open_database;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    struct Fixture {
        engine: ReservationEngine,
        catalog: VehicleCatalog,
        gateway: SandboxGateway,
        clock: ManualClock,
        vehicle_id: Uuid,
        host: Uuid,
        driver: Uuid,
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn fixture_at(db_path: &str) -> Fixture {
        let db = open_database(db_path).unwrap();
        let store = ReservationStore::new(db.clone(), "RUFS").unwrap();
        let catalog = VehicleCatalog::new(db).unwrap();
        let host = Uuid::new_v4();
        let vehicle_id = Uuid::new_v4();
        catalog
            .upsert(
                vehicle_id,
                UpsertVehicleRequest {
                    host_id: host,
                    name: "Model 3".to_string(),
                    available: true,
                    rate_card: RateCard {
                        weekly_rate_cents: Some(30000),
                        insurance_per_day_cents: Some(1000),
                        ..RateCard::daily(5000)
                    },
                    utc_offset_minutes: None,
                },
            )
            .unwrap();

        let gateway = SandboxGateway::new();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
        let metrics = Metrics::new();
        let payments = PaymentReconciler::new(
            store.clone(),
            catalog.clone(),
            Arc::new(gateway.clone()),
            Arc::new(clock.clone()),
            metrics.clone(),
            "usd",
            Duration::from_secs(2),
        )
        .unwrap();
        let engine = ReservationEngine::new(
            store,
            catalog.clone(),
            payments,
            Arc::new(clock.clone()),
            metrics,
        );

        Fixture {
            engine,
            catalog,
            gateway,
            clock,
            vehicle_id,
            host,
            driver: Uuid::new_v4(),
        }
    }

    fn request(vehicle_id: Uuid, start: NaiveDate, days: u32) -> CreateReservationRequest {
        CreateReservationRequest {
            vehicle_id,
            start_date: start,
            end_date: None,
            pickup_time: None,
            quantum: QuantumType::Daily,
            quantity: days,
            insurance: false,
            message: None,
        }
    }

    fn inspection() -> InspectionReport {
        InspectionReport {
            completed: true,
            photos: vec!["https://files.example.com/odometer.jpg".to_string()],
        }
    }

    impl Fixture {
        fn book(&self, start: NaiveDate, days: u32) -> Result<Reservation> {
            self.engine
                .create(self.driver, request(self.vehicle_id, start, days))
        }

        async fn paid(&self, start: NaiveDate, days: u32) -> Reservation {
            let r = self.book(start, days).unwrap();
            self.engine.confirm(self.host, r.id).unwrap();
            let payments = self.engine.payments();
            let intent = payments.open_initial_intent(self.driver, r.id).await.unwrap();
            payments
                .checkout(self.driver, r.id, &intent.intent_id, "pm_card")
                .await
                .unwrap()
                .reservation
        }
    }

    #[test]
    fn test_create_prices_and_defaults() {
        let tmp = NamedTempFile::new().unwrap();
        let f = fixture_at(tmp.path().to_str().unwrap());

        let r = f.book(date(2024, 6, 1), 3).unwrap();
        assert_eq!(r.code, "RUFS-00001");
        assert_eq!(r.status(), ReservationStatus::Pending);
        assert_eq!(r.payment_status(), PaymentStatus::Unpaid);
        assert_eq!(r.end_date, date(2024, 6, 4));
        assert_eq!(r.price.total_cents, 15000);
        assert_eq!(r.pickup_time, default_pickup_time());
        assert_eq!(r.dropoff_time, r.pickup_time);
        assert_eq!(r.host_id, f.host);
    }

    #[test]
    fn test_create_with_insurance_itemizes() {
        let tmp = NamedTempFile::new().unwrap();
        let f = fixture_at(tmp.path().to_str().unwrap());
        let mut req = request(f.vehicle_id, date(2024, 6, 1), 1);
        req.quantum = QuantumType::Weekly;
        req.insurance = true;

        let r = f.engine.create(f.driver, req).unwrap();
        assert_eq!(r.price.base_cents, 30000);
        assert_eq!(r.price.insurance_cents, 7000);
        assert_eq!(r.price.total_cents, 37000);
    }

    #[test]
    fn test_create_validation() {
        let tmp = NamedTempFile::new().unwrap();
        let f = fixture_at(tmp.path().to_str().unwrap());

        assert!(matches!(
            f.book(date(2024, 5, 31), 2),
            Err(AppError::InvalidRange { .. })
        ));
        assert!(matches!(
            f.book(date(2024, 6, 1), 0),
            Err(AppError::InvalidRange { .. })
        ));
        assert!(matches!(
            f.book(date(2024, 6, 1), 366),
            Err(AppError::InvalidRange { .. })
        ));

        let mut mismatched = request(f.vehicle_id, date(2024, 6, 1), 3);
        mismatched.end_date = Some(date(2024, 6, 5));
        assert!(matches!(
            f.engine.create(f.driver, mismatched),
            Err(AppError::InvalidRange { .. })
        ));

        let mut backwards = request(f.vehicle_id, date(2024, 6, 3), 3);
        backwards.end_date = Some(date(2024, 6, 3));
        assert!(matches!(
            f.engine.create(f.driver, backwards),
            Err(AppError::InvalidRange { .. })
        ));

        assert!(matches!(
            f.engine.create(f.host, request(f.vehicle_id, date(2024, 6, 1), 1)),
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            f.engine.create(f.driver, request(Uuid::new_v4(), date(2024, 6, 1), 1)),
            Err(AppError::VehicleNotFound(_))
        ));
    }

    #[test]
    fn test_unavailable_vehicle_conflicts() {
        let tmp = NamedTempFile::new().unwrap();
        let f = fixture_at(tmp.path().to_str().unwrap());
        f.catalog.set_available(f.vehicle_id, false).unwrap();
        assert!(matches!(
            f.book(date(2024, 6, 1), 2),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn test_no_double_booking_but_cancelled_never_blocks() {
        let tmp = NamedTempFile::new().unwrap();
        let f = fixture_at(tmp.path().to_str().unwrap());

        let first = f.book(date(2024, 6, 1), 5).unwrap();
        assert!(matches!(
            f.book(date(2024, 6, 3), 1),
            Err(AppError::Conflict(_))
        ));
        // Back-to-back is fine with half-open ranges.
        assert!(f.book(date(2024, 6, 6), 2).is_ok());

        f.engine.cancel(f.driver, first.id, None).unwrap();
        let inside = f.book(date(2024, 6, 2), 2).unwrap();
        assert_eq!(inside.status(), ReservationStatus::Pending);
    }

    #[test]
    fn test_concurrent_creates_produce_one_booking() {
        let tmp = NamedTempFile::new().unwrap();
        let f = Arc::new(fixture_at(tmp.path().to_str().unwrap()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let f = f.clone();
                std::thread::spawn(move || f.book(date(2024, 6, 10), 3).is_ok())
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }

    #[test]
    fn test_confirm_racing_cancel_has_one_winner() {
        let tmp = NamedTempFile::new().unwrap();
        let f = Arc::new(fixture_at(tmp.path().to_str().unwrap()));
        let r = f.book(date(2024, 6, 1), 2).unwrap();

        let confirm = {
            let f = f.clone();
            std::thread::spawn(move || f.engine.confirm(f.host, r.id).is_ok())
        };
        let cancel = {
            let f = f.clone();
            std::thread::spawn(move || f.engine.cancel(f.driver, r.id, None).is_ok())
        };
        let confirmed = confirm.join().unwrap();
        let cancelled = cancel.join().unwrap();
        assert!(confirmed ^ cancelled);

        let after = f.engine.get(f.driver, r.id).unwrap().reservation;
        let expected = if confirmed {
            ReservationStatus::Confirmed
        } else {
            ReservationStatus::Cancelled
        };
        assert_eq!(after.status(), expected);
        assert_eq!(after.history.len(), 1);
    }

    #[test]
    fn test_role_guards() {
        let tmp = NamedTempFile::new().unwrap();
        let f = fixture_at(tmp.path().to_str().unwrap());
        let r = f.book(date(2024, 6, 1), 2).unwrap();

        assert!(matches!(
            f.engine.confirm(f.driver, r.id),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            f.engine.get(Uuid::new_v4(), r.id),
            Err(AppError::ReservationNotFound(_))
        ));
        assert!(f.engine.get(f.host, r.id).is_ok());
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let tmp = NamedTempFile::new().unwrap();
        let f = fixture_at(tmp.path().to_str().unwrap());
        let r = f.book(date(2024, 6, 2), 3).unwrap();
        f.engine.confirm(f.host, r.id).unwrap();

        // Unpaid confirmations cannot start.
        assert!(matches!(
            f.engine.start(f.driver, r.id, &inspection()),
            Err(AppError::InvalidTransition { .. })
        ));

        let payments = f.engine.payments();
        let intent = payments.open_initial_intent(f.driver, r.id).await.unwrap();
        payments
            .checkout(f.driver, r.id, &intent.intent_id, "pm_card")
            .await
            .unwrap();

        // Too early.
        assert!(matches!(
            f.engine.start(f.driver, r.id, &inspection()),
            Err(AppError::InvalidTransition { .. })
        ));
        f.clock.advance(chrono::Duration::days(1));

        let incomplete = InspectionReport {
            completed: false,
            photos: vec![],
        };
        assert!(f.engine.start(f.driver, r.id, &incomplete).is_err());

        let active = f.engine.start(f.driver, r.id, &inspection()).unwrap();
        assert_eq!(active.status(), ReservationStatus::Active);

        let done = f.engine.complete(f.host, r.id, &inspection()).unwrap();
        assert_eq!(done.status(), ReservationStatus::Completed);
        assert_eq!(done.history.len(), 3);

        assert!(matches!(
            f.engine.cancel(f.driver, r.id, None),
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_host_cancel_of_paid_active_refunds_once() {
        let tmp = NamedTempFile::new().unwrap();
        let f = fixture_at(tmp.path().to_str().unwrap());
        let r = f.paid(date(2024, 6, 1), 3).await;
        f.engine.start(f.driver, r.id, &inspection()).unwrap();

        let (a, b) = tokio::join!(
            f.engine.host_cancel(f.host, r.id, Some("engine light".to_string())),
            f.engine.host_cancel(f.host, r.id, None)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.refund_ref.is_some());
        assert_eq!(a.refund_ref, b.refund_ref);
        assert_eq!(f.gateway.refund_count(), 1);
        assert_eq!(f.gateway.refunded_cents(r.id), 15000);

        let after = f.engine.get(f.driver, r.id).unwrap().reservation;
        assert_eq!(after.status(), ReservationStatus::Cancelled);
        assert_eq!(after.cancelled_by, Some(Actor::Host));
        assert_eq!(after.refund_ref, a.refund_ref);
    }

    #[tokio::test]
    async fn test_host_cancel_with_gateway_down_defers_refund() {
        let tmp = NamedTempFile::new().unwrap();
        let f = fixture_at(tmp.path().to_str().unwrap());
        let r = f.paid(date(2024, 6, 1), 3).await;

        f.gateway.set_offline(true);
        let report = f.engine.host_cancel(f.host, r.id, None).await.unwrap();
        assert!(report.refund_pending);
        assert_eq!(report.reservation.status(), ReservationStatus::Cancelled);

        f.gateway.set_offline(false);
        let retried = f.engine.host_cancel(f.host, r.id, None).await.unwrap();
        assert!(!retried.refund_pending);
        assert!(retried.refund_ref.is_some());
        assert_eq!(f.gateway.refund_count(), 1);
    }

    #[tokio::test]
    async fn test_host_cancel_of_unpaid_confirmation_needs_no_refund() {
        let tmp = NamedTempFile::new().unwrap();
        let f = fixture_at(tmp.path().to_str().unwrap());
        let r = f.book(date(2024, 6, 1), 3).unwrap();
        assert!(matches!(
            f.engine.host_cancel(f.host, r.id, None).await,
            Err(AppError::InvalidTransition { .. })
        ));

        f.engine.confirm(f.host, r.id).unwrap();
        let report = f.engine.host_cancel(f.host, r.id, None).await.unwrap();
        assert!(!report.refund_pending);
        assert!(report.refund_ref.is_none());
        assert_eq!(f.gateway.refund_calls(), 0);
    }

    #[tokio::test]
    async fn test_overdue_on_read() {
        let tmp = NamedTempFile::new().unwrap();
        let f = fixture_at(tmp.path().to_str().unwrap());
        let r = f.paid(date(2024, 6, 7), 3).await;
        f.clock.set(Utc.with_ymd_and_hms(2024, 6, 7, 12, 0, 0).unwrap());
        f.engine.start(f.driver, r.id, &inspection()).unwrap();

        f.clock.set(Utc.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap());
        assert!(!f.engine.get(f.driver, r.id).unwrap().overdue.overdue);
        assert!(f.engine.overdue_for(f.host).unwrap().is_empty());

        f.clock.set(Utc.with_ymd_and_hms(2024, 6, 10, 11, 0, 0).unwrap());
        let view = f.engine.get(f.driver, r.id).unwrap();
        assert!(view.overdue.overdue);
        assert_eq!(view.overdue.overdue_hours, 1);
        assert_eq!(f.engine.overdue_for(f.host).unwrap().len(), 1);
    }

    #[test]
    fn test_list_by_role() {
        let tmp = NamedTempFile::new().unwrap();
        let f = fixture_at(tmp.path().to_str().unwrap());
        f.book(date(2024, 6, 1), 1).unwrap();
        f.book(date(2024, 6, 3), 1).unwrap();

        assert_eq!(f.engine.list(f.driver, Some(Actor::Driver)).unwrap().len(), 2);
        assert!(f.engine.list(f.driver, Some(Actor::Host)).unwrap().is_empty());
        assert_eq!(f.engine.list(f.host, None).unwrap().len(), 2);
    }
}
