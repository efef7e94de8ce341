//! Read-time overdue classification.
//!
//! The deadline is `end_date` at `dropoff_time` in the vehicle's local time,
//! given as a fixed UTC offset. Vehicles without an offset use UTC.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

use crate::models::{Reservation, ReservationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OverdueStatus {
    pub overdue: bool,
    pub due_at: Option<DateTime<Utc>>,
    pub overdue_minutes: i64,
    pub overdue_hours: i64,
    pub overdue_days: i64,
}

impl OverdueStatus {
    fn not_overdue(due_at: Option<DateTime<Utc>>) -> Self {
        Self {
            overdue: false,
            due_at,
            overdue_minutes: 0,
            overdue_hours: 0,
            overdue_days: 0,
        }
    }
}

/// The instant the vehicle is due back.
pub fn due_at(r: &Reservation, utc_offset_minutes: Option<i32>) -> Option<DateTime<Utc>> {
    let local = NaiveDateTime::new(r.end_date, r.dropoff_time);
    let offset = FixedOffset::east_opt(utc_offset_minutes.unwrap_or(0) * 60)?;
    offset
        .from_local_datetime(&local)
        .single()
        .map(|t| t.with_timezone(&Utc))
}

pub fn classify(
    r: &Reservation,
    utc_offset_minutes: Option<i32>,
    now: DateTime<Utc>,
) -> OverdueStatus {
    let due = due_at(r, utc_offset_minutes);
    if !matches!(
        r.status(),
        ReservationStatus::Confirmed | ReservationStatus::Active
    ) {
        return OverdueStatus::not_overdue(due);
    }
    let Some(deadline) = due else {
        return OverdueStatus::not_overdue(None);
    };
    if now <= deadline {
        return OverdueStatus::not_overdue(due);
    }

    let minutes = (now - deadline).num_minutes();
    OverdueStatus {
        overdue: true,
        due_at: due,
        overdue_minutes: minutes,
        overdue_hours: minutes / 60,
        overdue_days: minutes / (60 * 24),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Lifecycle, PaymentStatus, PriceBreakdown, QuantumType};
    use chrono::{NaiveDate, NaiveTime};
    use uuid::Uuid;

    fn reservation(status: ReservationStatus) -> Reservation {
        let payment = if status == ReservationStatus::Pending {
            PaymentStatus::Unpaid
        } else {
            PaymentStatus::Paid
        };
        let ten = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        Reservation {
            id: Uuid::new_v4(),
            code: "RUFS-00001".to_string(),
            vehicle_id: Uuid::new_v4(),
            driver_id: Uuid::new_v4(),
            host_id: Uuid::new_v4(),
            start_date: NaiveDate::from_ymd_opt(2024, 6, 7).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            pickup_time: ten,
            dropoff_time: ten,
            quantum: QuantumType::Daily,
            quantity: 3,
            insurance: false,
            price: PriceBreakdown {
                base_cents: 15000,
                insurance_cents: 0,
                extension_cents: 0,
                total_cents: 15000,
            },
            lifecycle: Lifecycle::new(status, payment).unwrap(),
            message: None,
            captured_cents: 15000,
            refund_ref: None,
            cancelled_by: None,
            extensions: vec![],
            history: vec![],
            substitutions: vec![],
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_overdue_scenario() {
        let r = reservation(ReservationStatus::Active);

        let before = classify(&r, None, at("2024-06-10T09:00:00Z"));
        assert!(!before.overdue);

        let hour = classify(&r, None, at("2024-06-10T11:00:00Z"));
        assert!(hour.overdue);
        assert_eq!(hour.overdue_hours, 1);
        assert_eq!(hour.overdue_days, 0);

        let days = classify(&r, None, at("2024-06-12T11:00:00Z"));
        assert_eq!(days.overdue_days, 2);
        assert_eq!(days.overdue_hours, 49);
    }

    #[test]
    fn test_exact_deadline_is_not_overdue() {
        let r = reservation(ReservationStatus::Confirmed);
        assert!(!classify(&r, None, at("2024-06-10T10:00:00Z")).overdue);
        assert!(classify(&r, None, at("2024-06-10T10:01:00Z")).overdue);
    }

    #[test]
    fn test_vehicle_local_time_across_midnight() {
        let r = reservation(ReservationStatus::Active);
        // UTC-07:00: due at 17:00 UTC, which is still June 10 in UTC.
        let pacific = Some(-7 * 60);
        assert!(!classify(&r, pacific, at("2024-06-10T16:59:00Z")).overdue);
        assert!(classify(&r, pacific, at("2024-06-10T17:30:00Z")).overdue);

        // UTC+10:00: due at 00:00 UTC on June 10.
        let sydney = Some(10 * 60);
        let status = classify(&r, sydney, at("2024-06-09T23:59:00Z"));
        assert!(!status.overdue);
        assert_eq!(status.due_at, Some(at("2024-06-10T00:00:00Z")));
        assert!(classify(&r, sydney, at("2024-06-10T00:01:00Z")).overdue);
    }

    #[test]
    fn test_only_live_reservations_are_overdue() {
        let late = at("2024-07-01T00:00:00Z");
        assert!(!classify(&reservation(ReservationStatus::Completed), None, late).overdue);
        assert!(!classify(&reservation(ReservationStatus::Cancelled), None, late).overdue);
        assert!(!classify(&reservation(ReservationStatus::Pending), None, late).overdue);
    }
}
