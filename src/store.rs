use crate::{
    availability,
    error::{AppError, Result},
    models::{
        Actor, DateRange, Extension, Lifecycle, PaymentStatus, PriceBreakdown, QuantumType,
        Reservation, ReservationStatus, StatusChange, Substitution,
    },
    pricing::Quote,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

pub type DbConn = Arc<Mutex<Connection>>;

const RESERVATION_CODE_COUNTER: &str = "reservation_code";

pub fn open_database(database_url: &str) -> Result<DbConn> {
    let conn = Connection::open(database_url)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(Arc::new(Mutex::new(conn)))
}

pub fn lock_db(db: &DbConn) -> Result<MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|_| AppError::Internal(anyhow::anyhow!("database mutex poisoned")))
}

/// Advances a named counter and returns the new value. Runs on whatever
/// connection or transaction it is handed, so the increment commits or rolls
/// back together with the caller's writes.
pub fn next_counter(conn: &Connection, name: &str) -> Result<u64> {
    conn.execute(
        "INSERT OR IGNORE INTO counters (name, value) VALUES (?1, 0)",
        params![name],
    )?;
    let value: i64 = conn.query_row(
        "UPDATE counters SET value = value + 1 WHERE name = ?1 RETURNING value",
        params![name],
        |row| row.get(0),
    )?;
    Ok(value as u64)
}

// ── Column helpers ──────────────────────────────────────────────────────

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn invalid_value(idx: usize, what: &str, raw: &str) -> rusqlite::Error {
    conversion_err(
        idx,
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid {}: {}", what, raw),
        ),
    )
}

pub(crate) fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_err(idx, e))
}

pub(crate) fn opt_uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

pub(crate) fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| conversion_err(idx, e))
}

pub(crate) fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveTime> {
    let raw: String = row.get(idx)?;
    NaiveTime::parse_from_str(&raw, "%H:%M").map_err(|e| conversion_err(idx, e))
}

pub(crate) fn timestamp_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

pub(crate) fn format_time(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

// ── Reservation store ───────────────────────────────────────────────────

/// Everything needed to insert a new reservation; the store allocates the id,
/// code and version.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub vehicle_id: Uuid,
    pub driver_id: Uuid,
    pub host_id: Uuid,
    pub quote: Quote,
    pub pickup_time: NaiveTime,
    pub insurance: bool,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ReservationStore {
    db: DbConn,
    code_prefix: String,
}

const RESERVATION_COLUMNS: &str = "id, code, vehicle_id, driver_id, host_id, start_date, end_date, \
    pickup_time, dropoff_time, quantum, quantity, insurance, base_cents, insurance_cents, \
    extension_cents, total_cents, status, payment_status, message, captured_cents, refund_ref, \
    cancelled_by, version, created_at, updated_at";

impl ReservationStore {
    pub fn new(db: DbConn, code_prefix: &str) -> Result<Self> {
        {
            let conn = lock_db(&db)?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS counters (
                    name TEXT PRIMARY KEY,
                    value INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS reservations (
                    id TEXT PRIMARY KEY,
                    code TEXT NOT NULL UNIQUE,
                    vehicle_id TEXT NOT NULL,
                    driver_id TEXT NOT NULL,
                    host_id TEXT NOT NULL,
                    start_date TEXT NOT NULL,
                    end_date TEXT NOT NULL,
                    pickup_time TEXT NOT NULL,
                    dropoff_time TEXT NOT NULL,
                    quantum TEXT NOT NULL,
                    quantity INTEGER NOT NULL,
                    insurance INTEGER NOT NULL,
                    base_cents INTEGER NOT NULL,
                    insurance_cents INTEGER NOT NULL,
                    extension_cents INTEGER NOT NULL,
                    total_cents INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    payment_status TEXT NOT NULL,
                    message TEXT,
                    captured_cents INTEGER NOT NULL DEFAULT 0,
                    refund_ref TEXT,
                    cancelled_by TEXT,
                    version INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_reservations_vehicle
                    ON reservations (vehicle_id, status, start_date, end_date);
                CREATE INDEX IF NOT EXISTS idx_reservations_driver ON reservations (driver_id);
                CREATE INDEX IF NOT EXISTS idx_reservations_host ON reservations (host_id);
                CREATE TABLE IF NOT EXISTS reservation_extensions (
                    reservation_id TEXT NOT NULL REFERENCES reservations (id),
                    seq INTEGER NOT NULL,
                    quantity INTEGER NOT NULL,
                    base_cents INTEGER NOT NULL,
                    insurance_cents INTEGER NOT NULL,
                    cost_cents INTEGER NOT NULL,
                    previous_end_date TEXT NOT NULL,
                    new_end_date TEXT NOT NULL,
                    dropoff_time TEXT NOT NULL,
                    payment_intent_id TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (reservation_id, seq)
                );
                CREATE TABLE IF NOT EXISTS reservation_history (
                    reservation_id TEXT NOT NULL REFERENCES reservations (id),
                    position INTEGER NOT NULL,
                    from_status TEXT,
                    to_status TEXT NOT NULL,
                    actor TEXT NOT NULL,
                    note TEXT,
                    at TEXT NOT NULL,
                    PRIMARY KEY (reservation_id, position)
                );
                CREATE TABLE IF NOT EXISTS reservation_substitutions (
                    reservation_id TEXT NOT NULL REFERENCES reservations (id),
                    position INTEGER NOT NULL,
                    from_vehicle_id TEXT NOT NULL,
                    to_vehicle_id TEXT NOT NULL,
                    previous_total_cents INTEGER NOT NULL,
                    new_total_cents INTEGER NOT NULL,
                    price_difference_cents INTEGER NOT NULL,
                    at TEXT NOT NULL,
                    PRIMARY KEY (reservation_id, position)
                );
                "#,
            )?;
        }

        info!("Reservation tables initialized");

        Ok(Self {
            db,
            code_prefix: code_prefix.to_string(),
        })
    }

    pub fn db(&self) -> &DbConn {
        &self.db
    }

    /// Inserts a pending reservation. The overlap check and the insert share one
    /// immediate transaction, so two overlapping requests cannot both commit.
    pub fn create(&self, new: NewReservation) -> Result<Reservation> {
        let mut conn = lock_db(&self.db)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let range = DateRange::new(new.quote.start_date, new.quote.end_date)?;
        let blocking = availability::blocking_reservations(&tx, new.vehicle_id, &range, None)?;
        if !blocking.is_empty() {
            let codes: Vec<&str> = blocking.iter().map(|b| b.code.as_str()).collect();
            return Err(AppError::Conflict(format!(
                "vehicle is already booked for an overlapping range ({})",
                codes.join(", ")
            )));
        }

        let seq = next_counter(&tx, RESERVATION_CODE_COUNTER)?;
        let total_cents = new.quote.total_cents;
        let mut reservation = Reservation {
            id: Uuid::new_v4(),
            code: format!("{}-{:05}", self.code_prefix, seq),
            vehicle_id: new.vehicle_id,
            driver_id: new.driver_id,
            host_id: new.host_id,
            start_date: new.quote.start_date,
            end_date: new.quote.end_date,
            pickup_time: new.pickup_time,
            dropoff_time: new.pickup_time,
            quantum: new.quote.quantum,
            quantity: new.quote.quantity,
            insurance: new.insurance,
            price: PriceBreakdown {
                base_cents: new.quote.base_cents,
                insurance_cents: new.quote.insurance_cents,
                extension_cents: 0,
                total_cents,
            },
            lifecycle: Lifecycle::initial(),
            message: new.message,
            captured_cents: 0,
            refund_ref: None,
            cancelled_by: None,
            extensions: Vec::new(),
            history: vec![StatusChange {
                from: None,
                to: ReservationStatus::Pending,
                actor: Actor::Driver,
                note: None,
                at: new.created_at,
            }],
            substitutions: Vec::new(),
            version: 1,
            created_at: new.created_at,
            updated_at: new.created_at,
        };

        insert_reservation_row(&tx, &reservation)?;
        write_children(&tx, &mut reservation, ChildCounts::default())?;
        tx.commit()?;

        debug!("Reservation {} inserted", reservation.code);
        Ok(reservation)
    }

    pub fn get(&self, id: Uuid) -> Result<Reservation> {
        let conn = lock_db(&self.db)?;
        load_reservation(&conn, id)
    }

    pub fn list_for_user(&self, user_id: Uuid, role: Option<Actor>) -> Result<Vec<Reservation>> {
        let conn = lock_db(&self.db)?;
        let sql = match role {
            Some(Actor::Driver) => {
                "SELECT id FROM reservations WHERE driver_id = ?1 ORDER BY created_at DESC"
            }
            Some(Actor::Host) => {
                "SELECT id FROM reservations WHERE host_id = ?1 ORDER BY created_at DESC"
            }
            _ => "SELECT id FROM reservations WHERE driver_id = ?1 OR host_id = ?1 ORDER BY created_at DESC",
        };
        let ids: Vec<Uuid> = {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![user_id.to_string()], |row| uuid_col(row, 0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        ids.into_iter()
            .map(|id| load_reservation(&conn, id))
            .collect()
    }

    /// Runs `f` against the freshly loaded reservation inside one immediate
    /// transaction and persists whatever it changed. An error from `f` rolls the
    /// whole transition back. The write is a compare-and-set on `version`.
    pub fn mutate<T, F>(&self, id: Uuid, f: F) -> Result<(Reservation, T)>
    where
        F: FnOnce(&Transaction<'_>, &mut Reservation) -> Result<T>,
    {
        let mut conn = lock_db(&self.db)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut reservation = load_reservation(&tx, id)?;
        let before = ChildCounts::of(&reservation);
        let expected_version = reservation.version;

        let outcome = f(&tx, &mut reservation)?;

        reservation.updated_at = Utc::now();
        update_reservation_row(&tx, &reservation, expected_version)?;
        reservation.version = expected_version + 1;
        write_children(&tx, &mut reservation, before)?;
        tx.commit()?;

        Ok((reservation, outcome))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ChildCounts {
    extensions: usize,
    history: usize,
    substitutions: usize,
}

impl ChildCounts {
    fn of(reservation: &Reservation) -> Self {
        Self {
            extensions: reservation.extensions.len(),
            history: reservation.history.len(),
            substitutions: reservation.substitutions.len(),
        }
    }
}

fn insert_reservation_row(conn: &Connection, r: &Reservation) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO reservations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, \
             ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
            RESERVATION_COLUMNS
        ),
        params![
            r.id.to_string(),
            r.code,
            r.vehicle_id.to_string(),
            r.driver_id.to_string(),
            r.host_id.to_string(),
            r.start_date.to_string(),
            r.end_date.to_string(),
            format_time(r.pickup_time),
            format_time(r.dropoff_time),
            r.quantum.as_str(),
            r.quantity,
            r.insurance,
            r.price.base_cents,
            r.price.insurance_cents,
            r.price.extension_cents,
            r.price.total_cents,
            r.status().as_str(),
            r.payment_status().as_str(),
            r.message,
            r.captured_cents,
            r.refund_ref,
            r.cancelled_by.map(|a| a.as_str()),
            r.version,
            r.created_at.to_rfc3339(),
            r.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn update_reservation_row(conn: &Connection, r: &Reservation, expected_version: i64) -> Result<()> {
    let updated = conn.execute(
        r#"
        UPDATE reservations SET
            vehicle_id = ?1, end_date = ?2, dropoff_time = ?3,
            base_cents = ?4, insurance_cents = ?5, extension_cents = ?6, total_cents = ?7,
            status = ?8, payment_status = ?9, captured_cents = ?10, refund_ref = ?11,
            cancelled_by = ?12, updated_at = ?13, version = version + 1
        WHERE id = ?14 AND version = ?15
        "#,
        params![
            r.vehicle_id.to_string(),
            r.end_date.to_string(),
            format_time(r.dropoff_time),
            r.price.base_cents,
            r.price.insurance_cents,
            r.price.extension_cents,
            r.price.total_cents,
            r.status().as_str(),
            r.payment_status().as_str(),
            r.captured_cents,
            r.refund_ref,
            r.cancelled_by.map(|a| a.as_str()),
            r.updated_at.to_rfc3339(),
            r.id.to_string(),
            expected_version,
        ],
    )?;
    if updated == 0 {
        return Err(AppError::Conflict(format!(
            "reservation {} was modified concurrently",
            r.code
        )));
    }
    Ok(())
}

fn write_children(conn: &Connection, r: &mut Reservation, before: ChildCounts) -> Result<()> {
    let id = r.id.to_string();

    for ext in r.extensions.iter().skip(before.extensions) {
        conn.execute(
            "INSERT INTO reservation_extensions (reservation_id, seq, quantity, base_cents, \
             insurance_cents, cost_cents, previous_end_date, new_end_date, dropoff_time, \
             payment_intent_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                ext.seq,
                ext.quantity,
                ext.base_cents,
                ext.insurance_cents,
                ext.cost_cents,
                ext.previous_end_date.to_string(),
                ext.new_end_date.to_string(),
                format_time(ext.dropoff_time),
                ext.payment_intent_id,
                ext.created_at.to_rfc3339(),
            ],
        )?;
    }

    for (position, change) in r.history.iter().enumerate().skip(before.history) {
        conn.execute(
            "INSERT INTO reservation_history (reservation_id, position, from_status, to_status, \
             actor, note, at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                position as i64,
                change.from.map(|s| s.as_str()),
                change.to.as_str(),
                change.actor.as_str(),
                change.note,
                change.at.to_rfc3339(),
            ],
        )?;
    }

    for (position, sub) in r.substitutions.iter().enumerate().skip(before.substitutions) {
        conn.execute(
            "INSERT INTO reservation_substitutions (reservation_id, position, from_vehicle_id, \
             to_vehicle_id, previous_total_cents, new_total_cents, price_difference_cents, at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                position as i64,
                sub.from_vehicle_id.to_string(),
                sub.to_vehicle_id.to_string(),
                sub.previous_total_cents,
                sub.new_total_cents,
                sub.price_difference_cents,
                sub.at.to_rfc3339(),
            ],
        )?;
    }

    Ok(())
}

pub(crate) fn load_reservation(conn: &Connection, id: Uuid) -> Result<Reservation> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM reservations WHERE id = ?1", RESERVATION_COLUMNS),
            params![id.to_string()],
            map_reservation_row,
        )
        .optional()?;
    let (mut reservation, status, payment_status) =
        row.ok_or(AppError::ReservationNotFound(id))?;

    // Reject any stored combination outside the lifecycle table.
    reservation.lifecycle = Lifecycle::new(status, payment_status)?;

    let key = id.to_string();
    {
        let mut stmt = conn.prepare(
            "SELECT seq, quantity, base_cents, insurance_cents, cost_cents, previous_end_date, \
             new_end_date, dropoff_time, payment_intent_id, created_at \
             FROM reservation_extensions WHERE reservation_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![key], |row| {
            Ok(Extension {
                seq: row.get(0)?,
                quantity: row.get(1)?,
                base_cents: row.get(2)?,
                insurance_cents: row.get(3)?,
                cost_cents: row.get(4)?,
                previous_end_date: date_col(row, 5)?,
                new_end_date: date_col(row, 6)?,
                dropoff_time: time_col(row, 7)?,
                payment_intent_id: row.get(8)?,
                created_at: timestamp_col(row, 9)?,
            })
        })?;
        reservation.extensions = rows.collect::<rusqlite::Result<_>>()?;
    }
    {
        let mut stmt = conn.prepare(
            "SELECT from_status, to_status, actor, note, at FROM reservation_history \
             WHERE reservation_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![key], |row| {
            let from: Option<String> = row.get(0)?;
            let to: String = row.get(1)?;
            let actor: String = row.get(2)?;
            Ok(StatusChange {
                from: match from {
                    Some(raw) => Some(
                        ReservationStatus::parse(&raw)
                            .ok_or_else(|| invalid_value(0, "status", &raw))?,
                    ),
                    None => None,
                },
                to: ReservationStatus::parse(&to).ok_or_else(|| invalid_value(1, "status", &to))?,
                actor: Actor::parse(&actor).ok_or_else(|| invalid_value(2, "actor", &actor))?,
                note: row.get(3)?,
                at: timestamp_col(row, 4)?,
            })
        })?;
        reservation.history = rows.collect::<rusqlite::Result<_>>()?;
    }
    {
        let mut stmt = conn.prepare(
            "SELECT from_vehicle_id, to_vehicle_id, previous_total_cents, new_total_cents, \
             price_difference_cents, at FROM reservation_substitutions \
             WHERE reservation_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![key], |row| {
            Ok(Substitution {
                from_vehicle_id: uuid_col(row, 0)?,
                to_vehicle_id: uuid_col(row, 1)?,
                previous_total_cents: row.get(2)?,
                new_total_cents: row.get(3)?,
                price_difference_cents: row.get(4)?,
                at: timestamp_col(row, 5)?,
            })
        })?;
        reservation.substitutions = rows.collect::<rusqlite::Result<_>>()?;
    }

    Ok(reservation)
}

fn map_reservation_row(
    row: &Row<'_>,
) -> rusqlite::Result<(Reservation, ReservationStatus, PaymentStatus)> {
    let quantum_raw: String = row.get(9)?;
    let status_raw: String = row.get(16)?;
    let payment_raw: String = row.get(17)?;
    let cancelled_raw: Option<String> = row.get(21)?;

    let quantum =
        QuantumType::parse(&quantum_raw).ok_or_else(|| invalid_value(9, "quantum", &quantum_raw))?;
    let status = ReservationStatus::parse(&status_raw)
        .ok_or_else(|| invalid_value(16, "status", &status_raw))?;
    let payment_status = PaymentStatus::parse(&payment_raw)
        .ok_or_else(|| invalid_value(17, "payment status", &payment_raw))?;
    let cancelled_by = match cancelled_raw {
        Some(raw) => Some(Actor::parse(&raw).ok_or_else(|| invalid_value(21, "actor", &raw))?),
        None => None,
    };

    let reservation = Reservation {
        id: uuid_col(row, 0)?,
        code: row.get(1)?,
        vehicle_id: uuid_col(row, 2)?,
        driver_id: uuid_col(row, 3)?,
        host_id: uuid_col(row, 4)?,
        start_date: date_col(row, 5)?,
        end_date: date_col(row, 6)?,
        pickup_time: time_col(row, 7)?,
        dropoff_time: time_col(row, 8)?,
        quantum,
        quantity: row.get(10)?,
        insurance: row.get(11)?,
        price: PriceBreakdown {
            base_cents: row.get(12)?,
            insurance_cents: row.get(13)?,
            extension_cents: row.get(14)?,
            total_cents: row.get(15)?,
        },
        lifecycle: Lifecycle::initial(),
        message: row.get(18)?,
        captured_cents: row.get(19)?,
        refund_ref: row.get(20)?,
        cancelled_by,
        extensions: Vec::new(),
        history: Vec::new(),
        substitutions: Vec::new(),
        version: row.get(22)?,
        created_at: timestamp_col(row, 23)?,
        updated_at: timestamp_col(row, 24)?,
    };

    Ok((reservation, status, payment_status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QuantumType, RateCard};
    use crate::pricing;
    use tempfile::NamedTempFile;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn create_test_store(path: &str) -> ReservationStore {
        let db = open_database(path).expect("Failed to open DB");
        ReservationStore::new(db, "RUFS").expect("Failed to create store")
    }

    fn draft(vehicle_id: Uuid, start: NaiveDate, days: u32) -> NewReservation {
        let quote = pricing::quote(&RateCard::daily(5000), QuantumType::Daily, days, start, false)
            .unwrap();
        NewReservation {
            vehicle_id,
            driver_id: Uuid::new_v4(),
            host_id: Uuid::new_v4(),
            quote,
            pickup_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            insurance: false,
            message: Some("see you soon".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_allocates_sequential_codes() {
        let tmp = NamedTempFile::new().unwrap();
        let store = create_test_store(tmp.path().to_str().unwrap());
        let vehicle = Uuid::new_v4();

        let first = store.create(draft(vehicle, date(2024, 6, 1), 3)).unwrap();
        let second = store.create(draft(vehicle, date(2024, 6, 10), 3)).unwrap();
        assert_eq!(first.code, "RUFS-00001");
        assert_eq!(second.code, "RUFS-00002");
        assert_eq!(first.dropoff_time, first.pickup_time);
        assert_eq!(first.status(), ReservationStatus::Pending);
        assert_eq!(first.payment_status(), PaymentStatus::Unpaid);
    }

    #[test]
    fn test_codes_survive_reopen() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        let vehicle = Uuid::new_v4();

        {
            let store = create_test_store(&path);
            store.create(draft(vehicle, date(2024, 6, 1), 3)).unwrap();
        }
        {
            let store = create_test_store(&path);
            let next = store.create(draft(vehicle, date(2024, 7, 1), 3)).unwrap();
            assert_eq!(next.code, "RUFS-00002");
        }
    }

    #[test]
    fn test_create_rejects_overlap_without_burning_state() {
        let tmp = NamedTempFile::new().unwrap();
        let store = create_test_store(tmp.path().to_str().unwrap());
        let vehicle = Uuid::new_v4();

        store.create(draft(vehicle, date(2024, 6, 1), 5)).unwrap();
        let result = store.create(draft(vehicle, date(2024, 6, 3), 2));
        assert!(matches!(result, Err(AppError::Conflict(_))));

        // Back-to-back ranges do not overlap.
        let adjacent = store.create(draft(vehicle, date(2024, 6, 6), 2)).unwrap();
        assert_eq!(adjacent.code, "RUFS-00002");
    }

    #[test]
    fn test_get_round_trips_children() {
        let tmp = NamedTempFile::new().unwrap();
        let store = create_test_store(tmp.path().to_str().unwrap());
        let created = store.create(draft(Uuid::new_v4(), date(2024, 6, 1), 3)).unwrap();

        let loaded = store.get(created.id).unwrap();
        assert_eq!(loaded.code, created.code);
        assert_eq!(loaded.price, created.price);
        assert_eq!(loaded.history.len(), 1);
        assert_eq!(loaded.history[0].to, ReservationStatus::Pending);
        assert_eq!(loaded.message.as_deref(), Some("see you soon"));
        assert_eq!(loaded.pickup_time, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let tmp = NamedTempFile::new().unwrap();
        let store = create_test_store(tmp.path().to_str().unwrap());
        let id = Uuid::new_v4();
        assert!(matches!(store.get(id), Err(AppError::ReservationNotFound(missing)) if missing == id));
    }

    #[test]
    fn test_mutate_error_rolls_back() {
        let tmp = NamedTempFile::new().unwrap();
        let store = create_test_store(tmp.path().to_str().unwrap());
        let created = store.create(draft(Uuid::new_v4(), date(2024, 6, 1), 3)).unwrap();

        let result: Result<(Reservation, ())> = store.mutate(created.id, |_, r| {
            r.price.total_cents = 1;
            r.lifecycle = r.lifecycle.with_status(ReservationStatus::Confirmed)?;
            Err(AppError::Conflict("simulated".to_string()))
        });
        assert!(result.is_err());

        let loaded = store.get(created.id).unwrap();
        assert_eq!(loaded.price.total_cents, 15000);
        assert_eq!(loaded.status(), ReservationStatus::Pending);
        assert_eq!(loaded.version, created.version);
    }

    #[test]
    fn test_mutate_persists_and_bumps_version() {
        let tmp = NamedTempFile::new().unwrap();
        let store = create_test_store(tmp.path().to_str().unwrap());
        let created = store.create(draft(Uuid::new_v4(), date(2024, 6, 1), 3)).unwrap();

        let (updated, ()) = store
            .mutate(created.id, |_, r| {
                r.lifecycle = r.lifecycle.with_status(ReservationStatus::Confirmed)?;
                r.history.push(StatusChange {
                    from: Some(ReservationStatus::Pending),
                    to: ReservationStatus::Confirmed,
                    actor: Actor::Host,
                    note: None,
                    at: Utc::now(),
                });
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.version, created.version + 1);

        let loaded = store.get(created.id).unwrap();
        assert_eq!(loaded.status(), ReservationStatus::Confirmed);
        assert_eq!(loaded.history.len(), 2);
        assert_eq!(loaded.history[1].actor, Actor::Host);
        assert_eq!(loaded.version, updated.version);
    }

    #[test]
    fn test_corrupted_lifecycle_is_rejected_on_load() {
        let tmp = NamedTempFile::new().unwrap();
        let store = create_test_store(tmp.path().to_str().unwrap());
        let created = store.create(draft(Uuid::new_v4(), date(2024, 6, 1), 3)).unwrap();

        {
            let conn = lock_db(store.db()).unwrap();
            conn.execute(
                "UPDATE reservations SET payment_status = 'paid' WHERE id = ?1",
                params![created.id.to_string()],
            )
            .unwrap();
        }
        assert!(matches!(
            store.get(created.id),
            Err(AppError::InvalidLifecycle(_))
        ));
    }

    #[test]
    fn test_list_for_user_by_role() {
        let tmp = NamedTempFile::new().unwrap();
        let store = create_test_store(tmp.path().to_str().unwrap());
        let first = draft(Uuid::new_v4(), date(2024, 6, 1), 3);
        let driver = first.driver_id;
        let host = first.host_id;
        store.create(first).unwrap();
        let mut second = draft(Uuid::new_v4(), date(2024, 6, 1), 3);
        second.driver_id = host;
        store.create(second).unwrap();

        assert_eq!(store.list_for_user(driver, Some(Actor::Driver)).unwrap().len(), 1);
        assert_eq!(store.list_for_user(host, Some(Actor::Host)).unwrap().len(), 1);
        assert_eq!(store.list_for_user(host, Some(Actor::Driver)).unwrap().len(), 1);
        assert_eq!(store.list_for_user(host, None).unwrap().len(), 2);
    }

    #[test]
    fn test_next_counter_is_monotonic() {
        let db = open_database(":memory:").unwrap();
        let _store = ReservationStore::new(db.clone(), "RUFS").unwrap();
        let conn = lock_db(&db).unwrap();
        let a = next_counter(&conn, "other").unwrap();
        let b = next_counter(&conn, "other").unwrap();
        assert_eq!((a, b), (1, 2));
    }
}
