use crate::{
    catalog::VehicleCatalog,
    error::{AppError, Result},
    models::{AvailabilityResponse, DateRange, ReservationStatus},
    store::{date_col, lock_db, uuid_col, DbConn},
};
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::Serialize;
use uuid::Uuid;

/// A live reservation holding a vehicle for part of a queried range.
#[derive(Debug, Clone, Serialize)]
pub struct BlockingReservation {
    pub id: Uuid,
    pub code: String,
    pub status: ReservationStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Reservations on `vehicle_id` in a blocking status whose range overlaps
/// `range`. Dates are stored as ISO strings, so string comparison is date order.
///
/// Callers that act on the answer must run this on the same transaction as
/// their write.
pub fn blocking_reservations(
    conn: &Connection,
    vehicle_id: Uuid,
    range: &DateRange,
    exclude: Option<Uuid>,
) -> Result<Vec<BlockingReservation>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT id, code, status, start_date, end_date FROM reservations
        WHERE vehicle_id = ?1
          AND status NOT IN ('completed', 'cancelled')
          AND start_date < ?3
          AND end_date > ?2
          AND id != ?4
        ORDER BY start_date
        "#,
    )?;
    let excluded = exclude.map(|id| id.to_string()).unwrap_or_default();
    let rows = stmt.query_map(
        params![
            vehicle_id.to_string(),
            range.start.to_string(),
            range.end.to_string(),
            excluded
        ],
        |row| {
            Ok((
                uuid_col(row, 0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                date_col(row, 3)?,
                date_col(row, 4)?,
            ))
        },
    )?;

    let mut blocking = Vec::new();
    for row in rows {
        let (id, code, raw, start_date, end_date) = row?;
        let status = ReservationStatus::parse(&raw)
            .filter(|s| s.blocks_vehicle())
            .ok_or_else(|| {
                AppError::InvalidLifecycle(format!("{} has unknown status '{}'", code, raw))
            })?;
        blocking.push(BlockingReservation {
            id,
            code,
            status,
            start_date,
            end_date,
        });
    }
    Ok(blocking)
}

pub fn is_free(
    conn: &Connection,
    vehicle_id: Uuid,
    range: &DateRange,
    exclude: Option<Uuid>,
) -> Result<bool> {
    Ok(blocking_reservations(conn, vehicle_id, range, exclude)?.is_empty())
}

/// Read-side answer to "can this vehicle be booked for this range", combining
/// the catalog flag with the reservation table.
#[derive(Clone)]
pub struct AvailabilityIndex {
    db: DbConn,
    catalog: VehicleCatalog,
}

impl AvailabilityIndex {
    pub fn new(db: DbConn, catalog: VehicleCatalog) -> Self {
        Self { db, catalog }
    }

    pub fn check(&self, vehicle_id: Uuid, range: DateRange) -> Result<AvailabilityResponse> {
        let vehicle = self.catalog.get(vehicle_id)?;
        let blocking = {
            let conn = lock_db(&self.db)?;
            blocking_reservations(&conn, vehicle_id, &range, None)?
        };

        Ok(AvailabilityResponse {
            vehicle_id,
            start: range.start,
            end: range.end,
            flagged_available: vehicle.available,
            available: vehicle.available && blocking.is_empty(),
            blocking: blocking.into_iter().map(|b| b.code).collect(),
        })
    }
}
