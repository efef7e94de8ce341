//! Host-initiated vehicle swaps.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    availability,
    catalog::VehicleCatalog,
    clock::Clock,
    error::{AppError, Result},
    metrics::{DomainEvent, Metrics},
    models::{Actor, Reservation, Substitution},
    payments::{self, PaymentReconciler},
    pricing,
    store::{lock_db, ReservationStore},
    transitions,
};

#[derive(Debug, Clone, Serialize)]
pub struct SubstituteOption {
    pub vehicle_id: Uuid,
    pub name: String,
    pub total_cents: i64,
    /// New total minus current total; negative when the replacement is cheaper.
    pub price_difference_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct SubstitutionReceipt {
    pub substitution: Substitution,
    pub reservation: Reservation,
}

#[derive(Clone)]
pub struct SubstitutionResolver {
    store: ReservationStore,
    catalog: VehicleCatalog,
    payments: PaymentReconciler,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl SubstitutionResolver {
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

    /// Every other available vehicle of the same host that is free for the
    /// reservation's exact range, priced on its own rate card.
    pub fn options(&self, user_id: Uuid, reservation_id: Uuid) -> Result<Vec<SubstituteOption>> {
        let r = self.store.get(reservation_id)?;
        transitions::require_role(&r, user_id, Actor::Host)?;
        transitions::require_substitutable(&r)?;

        let range = r.range();
        let candidates: Vec<_> = self
            .catalog
            .by_host(r.host_id)
            .into_iter()
            .filter(|v| v.id != r.vehicle_id && v.available)
            .collect();

        let conn = lock_db(self.store.db())?;
        let mut options = Vec::new();
        for vehicle in candidates {
            if !availability::is_free(&conn, vehicle.id, &range, Some(r.id))? {
                continue;
            }
            let price = match pricing::reprice(&vehicle.rate_card, &r) {
                Ok(price) => price,
                Err(e) => {
                    debug!("Skipping {} as substitute for {}: {}", vehicle.id, r.code, e);
                    continue;
                }
            };
            options.push(SubstituteOption {
                vehicle_id: vehicle.id,
                name: vehicle.name,
                total_cents: price.total_cents,
                price_difference_cents: price.total_cents - r.price.total_cents,
            });
        }
        Ok(options)
    }

    /// Moves the reservation to `vehicle_id`. Availability is checked again in
    /// the same transaction as the reassignment, so a vehicle that was booked
    /// since the options were listed fails with `Conflict`. Intents opened at
    /// the old price are voided in that transaction and cancelled (or refunded,
    /// if they already captured) after it commits.
    pub async fn select(
        &self,
        user_id: Uuid,
        reservation_id: Uuid,
        vehicle_id: Uuid,
    ) -> Result<SubstitutionReceipt> {
        let current = self.store.get(reservation_id)?;
        transitions::require_role(&current, user_id, Actor::Host)?;

        let vehicle = self.catalog.get(vehicle_id)?;
        if vehicle.host_id != current.host_id {
            return Err(AppError::InvalidInput(format!(
                "vehicle {} does not belong to the host of {}",
                vehicle.name, current.code
            )));
        }
        if !vehicle.available {
            return Err(AppError::Conflict(format!(
                "vehicle {} is not available",
                vehicle.name
            )));
        }

        let now = self.clock.now();
        let (reservation, (substitution, voided)) = self.store.mutate(reservation_id, |tx, r| {
            transitions::require_substitutable(r)?;
            if !availability::is_free(tx, vehicle_id, &r.range(), Some(r.id))? {
                return Err(AppError::Conflict(format!(
                    "vehicle {} was booked for {} to {} in the meantime",
                    vehicle.name, r.start_date, r.end_date
                )));
            }
            let price = pricing::reprice(&vehicle.rate_card, r)?;
            let substitution = transitions::reassign_vehicle(r, user_id, vehicle_id, price, now)?;
            let voided = payments::void_open_intents(tx, r.id)?;
            Ok((substitution, voided))
        })?;

        if !voided.is_empty() {
            info!(
                "Voided {} intent(s) of {} opened at the old price",
                voided.len(),
                reservation.code
            );
            self.payments.release_voided(&voided).await;
        }

        self.metrics.record(DomainEvent::Transition);
        info!(
            "Reservation {} moved from vehicle {} to {} ({:+} cents)",
            reservation.code,
            substitution.from_vehicle_id,
            substitution.to_vehicle_id,
            substitution.price_difference_cents
        );
        Ok(SubstitutionReceipt {
            substitution,
            reservation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::SandboxGateway;
    use crate::models::{QuantumType, RateCard, ReservationStatus, UpsertVehicleRequest};
    use crate::payments::{LedgerStatus, PaymentOutcome, ReconcileOutcome};
    use crate::store::{open_database, NewReservation};
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
    use std::time::Duration;

    struct Fixture {
        store: ReservationStore,
        catalog: VehicleCatalog,
        gateway: SandboxGateway,
        payments: PaymentReconciler,
        resolver: SubstitutionResolver,
        host: Uuid,
        driver: Uuid,
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn fixture() -> Fixture {
        let db = open_database(":memory:").unwrap();
        let store = ReservationStore::new(db.clone(), "RUFS").unwrap();
        let catalog = VehicleCatalog::new(db).unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ));
        let metrics = Metrics::new();
        let gateway = SandboxGateway::new();
        let payments = PaymentReconciler::new(
            store.clone(),
            catalog.clone(),
            Arc::new(gateway.clone()),
            clock.clone(),
            metrics.clone(),
            "usd",
            Duration::from_millis(500),
        )
        .unwrap();
        let resolver = SubstitutionResolver::new(
            store.clone(),
            catalog.clone(),
            payments.clone(),
            clock,
            metrics,
        );
        Fixture {
            store,
            catalog,
            gateway,
            payments,
            resolver,
            host: Uuid::new_v4(),
            driver: Uuid::new_v4(),
        }
    }

    impl Fixture {
        fn vehicle(&self, host: Uuid, name: &str, daily: i64) -> Uuid {
            let id = Uuid::new_v4();
            self.catalog
                .upsert(
                    id,
                    UpsertVehicleRequest {
                        host_id: host,
                        name: name.to_string(),
                        available: true,
                        rate_card: RateCard::daily(daily),
                        utc_offset_minutes: None,
                    },
                )
                .unwrap();
            id
        }

        fn book(&self, vehicle_id: Uuid, start: NaiveDate, days: u32) -> Reservation {
            let card = self.catalog.get(vehicle_id).unwrap().rate_card;
            let quote = pricing::quote(&card, QuantumType::Daily, days, start, false).unwrap();
            self.store
                .create(NewReservation {
                    vehicle_id,
                    driver_id: self.driver,
                    host_id: self.host,
                    quote,
                    pickup_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                    insurance: false,
                    message: None,
                    created_at: Utc::now(),
                })
                .unwrap()
        }

        fn confirm(&self, id: Uuid) {
            let host = self.host;
            self.store
                .mutate(id, |_, r| transitions::confirm(r, host, Utc::now()))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_switch_to_cheaper_vehicle() {
        let f = fixture();
        let a = f.vehicle(f.host, "A", 5000);
        let b = f.vehicle(f.host, "B", 4500);
        let r = f.book(a, date(2024, 6, 1), 4);
        assert_eq!(r.price.total_cents, 20000);

        let options = f.resolver.options(f.host, r.id).unwrap();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].vehicle_id, b);
        assert_eq!(options[0].total_cents, 18000);
        assert_eq!(options[0].price_difference_cents, -2000);

        let receipt = f.resolver.select(f.host, r.id, b).await.unwrap();
        assert_eq!(receipt.substitution.price_difference_cents, -2000);
        assert_eq!(receipt.reservation.vehicle_id, b);
        assert_eq!(receipt.reservation.price.total_cents, 18000);
        assert_eq!(receipt.reservation.status(), ReservationStatus::Pending);

        let stored = f.store.get(r.id).unwrap();
        assert_eq!(stored.substitutions.len(), 1);
        assert_eq!(stored.start_date, r.start_date);
        assert_eq!(stored.end_date, r.end_date);
    }

    #[test]
    fn test_options_exclude_busy_unflagged_and_foreign_vehicles() {
        let f = fixture();
        let a = f.vehicle(f.host, "A", 5000);
        let busy = f.vehicle(f.host, "Busy", 5000);
        let parked = f.vehicle(f.host, "Parked", 5000);
        f.vehicle(Uuid::new_v4(), "Someone else's", 1000);
        f.catalog.set_available(parked, false).unwrap();

        let r = f.book(a, date(2024, 6, 1), 3);
        f.book(busy, date(2024, 6, 3), 2);

        assert!(f.resolver.options(f.host, r.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_select_revalidates_availability() {
        let f = fixture();
        let a = f.vehicle(f.host, "A", 5000);
        let b = f.vehicle(f.host, "B", 4500);
        let r = f.book(a, date(2024, 6, 1), 4);
        assert_eq!(f.resolver.options(f.host, r.id).unwrap().len(), 1);

        // Another booking takes B before the host picks it.
        f.book(b, date(2024, 6, 2), 1);
        assert!(matches!(
            f.resolver.select(f.host, r.id, b).await,
            Err(AppError::Conflict(_))
        ));

        let unchanged = f.store.get(r.id).unwrap();
        assert_eq!(unchanged.vehicle_id, a);
        assert_eq!(unchanged.price.total_cents, 20000);
        assert!(unchanged.substitutions.is_empty());
    }

    #[tokio::test]
    async fn test_substitution_guards() {
        let f = fixture();
        let a = f.vehicle(f.host, "A", 5000);
        let b = f.vehicle(f.host, "B", 4500);
        let foreign = f.vehicle(Uuid::new_v4(), "C", 4500);
        let r = f.book(a, date(2024, 6, 1), 2);

        assert!(matches!(
            f.resolver.options(f.driver, r.id),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            f.resolver.select(f.host, r.id, foreign).await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            f.resolver.select(f.host, r.id, a).await,
            Err(AppError::InvalidInput(_))
        ));

        let host = f.host;
        f.store
            .mutate(r.id, |_, r| transitions::decline(r, host, None, Utc::now()))
            .unwrap();
        assert!(matches!(
            f.resolver.select(f.host, r.id, b).await,
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_swap_cancels_intent_opened_at_old_price() {
        let f = fixture();
        let a = f.vehicle(f.host, "A", 5000);
        let b = f.vehicle(f.host, "B", 4500);
        let r = f.book(a, date(2024, 6, 1), 3);
        f.confirm(r.id);
        let stale = f.payments.open_initial_intent(f.driver, r.id).await.unwrap();
        assert_eq!(stale.amount_cents, 15000);

        let receipt = f.resolver.select(f.host, r.id, b).await.unwrap();
        assert_eq!(receipt.reservation.price.total_cents, 13500);
        let entries = f.payments.entries(r.id).unwrap();
        assert_eq!(entries[0].status, LedgerStatus::Void);

        // Paying the old intent now is refused and moves no money.
        let err = f
            .payments
            .checkout(f.driver, r.id, &stale.intent_id, "pm_card")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(f.gateway.refunded_cents(r.id), 0);

        let fresh = f.payments.open_initial_intent(f.driver, r.id).await.unwrap();
        assert_eq!(fresh.amount_cents, 13500);
        assert_ne!(fresh.intent_id, stale.intent_id);
        let paid = f
            .payments
            .checkout(f.driver, r.id, &fresh.intent_id, "pm_card")
            .await
            .unwrap();
        assert_eq!(paid.outcome, PaymentOutcome::Paid);
        assert_eq!(paid.reservation.captured_cents, 13500);
    }

    #[tokio::test]
    async fn test_swap_refunds_capture_at_old_price() {
        let f = fixture();
        let a = f.vehicle(f.host, "A", 5000);
        let b = f.vehicle(f.host, "B", 4500);
        let r = f.book(a, date(2024, 6, 1), 3);
        f.confirm(r.id);
        let stale = f.payments.open_initial_intent(f.driver, r.id).await.unwrap();
        // The driver pays, but the server has not heard about it yet.
        f.gateway.capture(&stale.intent_id);

        f.resolver.select(f.host, r.id, b).await.unwrap();
        assert_eq!(f.gateway.refunded_cents(r.id), 15000);

        let fresh = f.payments.open_initial_intent(f.driver, r.id).await.unwrap();
        f.payments
            .checkout(f.driver, r.id, &fresh.intent_id, "pm_card")
            .await
            .unwrap();

        let report = f.payments.reconcile(f.driver, r.id).await.unwrap();
        assert_eq!(report.outcome, ReconcileOutcome::AlreadyPaid);
        assert_eq!(report.reservation.captured_cents, 13500);
        assert_eq!(f.gateway.refunded_cents(r.id), 15000);
        assert_eq!(f.gateway.refund_count(), 1);
    }
}
