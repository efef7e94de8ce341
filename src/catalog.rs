use crate::{
    error::{AppError, Result},
    models::{
        AvailabilityQuery, AvailabilityResponse, DateRange, RateCard, UpsertVehicleRequest,
        Vehicle,
    },
    store::{lock_db, timestamp_col, uuid_col, DbConn},
};
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::params;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};

/// Earliest and latest real-world UTC offsets.
const MIN_UTC_OFFSET_MINUTES: i32 = -12 * 60;
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// Vehicle records the engine reads: host, availability flag and rate card.
/// Served from memory, written through to SQLite.
#[derive(Clone)]
pub struct VehicleCatalog {
    vehicles: Arc<DashMap<Uuid, Vehicle>>,
    db: DbConn,
}

impl VehicleCatalog {
    pub fn new(db: DbConn) -> Result<Self> {
        {
            let conn = lock_db(&db)?;
            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS vehicles (
                    id TEXT PRIMARY KEY,
                    host_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    available INTEGER NOT NULL,
                    daily_rate_cents INTEGER NOT NULL,
                    weekly_rate_cents INTEGER,
                    monthly_rate_cents INTEGER,
                    insurance_per_day_cents INTEGER,
                    utc_offset_minutes INTEGER,
                    updated_at TEXT NOT NULL
                )
                "#,
                [],
            )?;
        }

        info!("Vehicles table initialized");

        let catalog = Self {
            vehicles: Arc::new(DashMap::new()),
            db,
        };
        catalog.load_from_database()?;
        Ok(catalog)
    }

    fn load_from_database(&self) -> Result<()> {
        let conn = lock_db(&self.db)?;
        let mut stmt = conn.prepare(
            "SELECT id, host_id, name, available, daily_rate_cents, weekly_rate_cents, \
             monthly_rate_cents, insurance_per_day_cents, utc_offset_minutes, updated_at \
             FROM vehicles",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Vehicle {
                id: uuid_col(row, 0)?,
                host_id: uuid_col(row, 1)?,
                name: row.get(2)?,
                available: row.get(3)?,
                rate_card: RateCard {
                    daily_rate_cents: row.get(4)?,
                    weekly_rate_cents: row.get(5)?,
                    monthly_rate_cents: row.get(6)?,
                    insurance_per_day_cents: row.get(7)?,
                },
                utc_offset_minutes: row.get(8)?,
                updated_at: timestamp_col(row, 9)?,
            })
        })?;

        let mut loaded = 0;
        for row in rows {
            let vehicle = row?;
            self.vehicles.insert(vehicle.id, vehicle);
            loaded += 1;
        }
        info!("Loaded {} vehicles", loaded);
        Ok(())
    }

    /// Creates or replaces a vehicle. Reservations keep the host they were
    /// booked under, so changing `host_id` here never rewrites history.
    pub fn upsert(&self, id: Uuid, req: UpsertVehicleRequest) -> Result<Vehicle> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("vehicle name is required".to_string()));
        }
        req.rate_card.validate()?;
        if let Some(offset) = req.utc_offset_minutes {
            if !(MIN_UTC_OFFSET_MINUTES..=MAX_UTC_OFFSET_MINUTES).contains(&offset) {
                return Err(AppError::InvalidInput(format!(
                    "utc_offset_minutes must be between {} and {}",
                    MIN_UTC_OFFSET_MINUTES, MAX_UTC_OFFSET_MINUTES
                )));
            }
        }

        let vehicle = Vehicle {
            id,
            host_id: req.host_id,
            name: name.to_string(),
            available: req.available,
            rate_card: req.rate_card,
            utc_offset_minutes: req.utc_offset_minutes,
            updated_at: Utc::now(),
        };

        self.save(&vehicle)?;
        if let Some(previous) = self.vehicles.insert(id, vehicle.clone()) {
            if previous.host_id != vehicle.host_id {
                info!(
                    "Vehicle {} transferred from host {} to {}",
                    id, previous.host_id, vehicle.host_id
                );
            }
        }

        debug!("Vehicle upserted: {} ({})", vehicle.name, id);
        Ok(vehicle)
    }

    pub fn set_available(&self, id: Uuid, available: bool) -> Result<Vehicle> {
        let mut entry = self
            .vehicles
            .get_mut(&id)
            .ok_or(AppError::VehicleNotFound(id))?;
        let mut updated = entry.value().clone();
        updated.available = available;
        updated.updated_at = Utc::now();
        self.save(&updated)?;
        *entry.value_mut() = updated.clone();
        Ok(updated)
    }

    pub fn get(&self, id: Uuid) -> Result<Vehicle> {
        self.vehicles
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(AppError::VehicleNotFound(id))
    }

    pub fn by_host(&self, host_id: Uuid) -> Vec<Vehicle> {
        let mut vehicles: Vec<Vehicle> = self
            .vehicles
            .iter()
            .filter(|entry| entry.value().host_id == host_id)
            .map(|entry| entry.value().clone())
            .collect();
        vehicles.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        vehicles
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    fn save(&self, vehicle: &Vehicle) -> Result<()> {
        let conn = lock_db(&self.db)?;
        conn.execute(
            "INSERT OR REPLACE INTO vehicles (id, host_id, name, available, daily_rate_cents, \
             weekly_rate_cents, monthly_rate_cents, insurance_per_day_cents, utc_offset_minutes, \
             updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                vehicle.id.to_string(),
                vehicle.host_id.to_string(),
                vehicle.name,
                vehicle.available,
                vehicle.rate_card.daily_rate_cents,
                vehicle.rate_card.weekly_rate_cents,
                vehicle.rate_card.monthly_rate_cents,
                vehicle.rate_card.insurance_per_day_cents,
                vehicle.utc_offset_minutes,
                vehicle.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

// ── Route handlers ──────────────────────────────────────────────────────

pub async fn upsert_vehicle(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    Json(req): Json<UpsertVehicleRequest>,
) -> Result<Json<Vehicle>> {
    state.auth_service.require_admin(&headers)?;
    let vehicle = state.catalog.upsert(id, req)?;
    Ok(Json(vehicle))
}

pub async fn get_vehicle(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
) -> Result<Json<Vehicle>> {
    state.auth_service.authenticate(&headers)?;
    Ok(Json(state.catalog.get(id)?))
}

pub async fn vehicle_availability(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityResponse>> {
    state.auth_service.authenticate(&headers)?;
    let range = DateRange::new(query.start, query.end)?;
    Ok(Json(state.availability.check(id, range)?))
}
