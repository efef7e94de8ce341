use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    auth::{self, AuthService},
    availability::AvailabilityIndex,
    catalog::{self, VehicleCatalog},
    clock::Clock,
    config::Config,
    engine::ReservationEngine,
    error::Result,
    gateway::{HttpPaymentGateway, PaymentGateway, SandboxGateway},
    metrics::{endpoint_from_path, Metrics},
    payments::PaymentReconciler,
    relay::{self, UploadRelay},
    reservations,
    store::{open_database, ReservationStore},
    substitution::SubstitutionResolver,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: ReservationEngine,
    pub substitutions: SubstitutionResolver,
    pub catalog: VehicleCatalog,
    pub availability: AvailabilityIndex,
    pub relay: UploadRelay,
    pub auth_service: AuthService,
    pub config: Config,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Opens the database and wires every component onto one connection.
    pub fn build(
        config: Config,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let db = open_database(&config.database_url)?;
        let metrics = Metrics::new();

        let auth_service = AuthService::new(config.clone(), db.clone())?;
        auth_service.seed_static_tokens()?;

        let catalog = VehicleCatalog::new(db.clone())?;
        let store = ReservationStore::new(db.clone(), &config.reservation_code_prefix)?;
        let availability = AvailabilityIndex::new(db, catalog.clone());
        let payments = PaymentReconciler::new(
            store.clone(),
            catalog.clone(),
            gateway,
            clock.clone(),
            metrics.clone(),
            &config.payment_currency,
            Duration::from_secs(config.payment_timeout_secs),
        )?;
        let substitutions = SubstitutionResolver::new(
            store.clone(),
            catalog.clone(),
            payments.clone(),
            clock.clone(),
            metrics.clone(),
        );
        let engine = ReservationEngine::new(
            store,
            catalog.clone(),
            payments,
            clock.clone(),
            metrics.clone(),
        );
        let relay = UploadRelay::new(&config, clock, metrics.clone());

        Ok(Self {
            engine,
            substitutions,
            catalog,
            availability,
            relay,
            auth_service,
            config,
            metrics,
        })
    }
}

/// The gateway named by the configuration, or the in-process sandbox.
pub fn gateway_from_config(config: &Config) -> anyhow::Result<Arc<dyn PaymentGateway>> {
    match &config.payment_gateway_url {
        Some(url) => {
            info!("Using payment gateway at {}", url);
            Ok(Arc::new(HttpPaymentGateway::new(
                url,
                config.payment_gateway_key.clone(),
                Duration::from_secs(config.payment_timeout_secs),
            )?))
        }
        None => {
            info!("PAYMENT_GATEWAY_URL not set, using the sandbox gateway");
            Ok(Arc::new(SandboxGateway::new()))
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Identity
        .route("/auth/register", post(auth::register))
        // Catalog
        .route(
            "/vehicles/:id",
            put(catalog::upsert_vehicle).get(catalog::get_vehicle),
        )
        .route("/vehicles/:id/availability", get(catalog::vehicle_availability))
        // Reservations
        .route(
            "/reservations",
            post(reservations::create_reservation).get(reservations::list_reservations),
        )
        .route("/reservations/overdue", get(reservations::list_overdue))
        .route("/reservations/:id", get(reservations::get_reservation))
        .route("/reservations/:id/confirm", post(reservations::confirm_reservation))
        .route("/reservations/:id/decline", post(reservations::decline_reservation))
        .route("/reservations/:id/cancel", post(reservations::cancel_reservation))
        .route(
            "/reservations/:id/host-cancel",
            post(reservations::host_cancel_reservation),
        )
        .route("/reservations/:id/start", post(reservations::start_reservation))
        .route("/reservations/:id/return", post(reservations::return_reservation))
        // Payments
        .route("/reservations/:id/extensions", post(reservations::request_extension))
        .route(
            "/reservations/:id/payments",
            post(reservations::open_payment).get(reservations::list_payments),
        )
        .route(
            "/reservations/:id/payments/confirm",
            post(reservations::confirm_payment),
        )
        .route(
            "/reservations/:id/payments/reconcile",
            post(reservations::reconcile_payment),
        )
        .route(
            "/reservations/:id/payments/:intent_id/checkout",
            post(reservations::checkout_payment),
        )
        .route("/reservations/:id/refund", post(reservations::retry_refund))
        // Substitution
        .route("/reservations/:id/substitutes", get(reservations::list_substitutes))
        .route("/reservations/:id/substitute", post(reservations::substitute_vehicle))
        // Upload relay
        .route("/relay/sessions", post(relay::create_session))
        .route(
            "/relay/sessions/:id",
            get(relay::poll_session).delete(relay::close_session),
        )
        .route("/relay/sessions/:id/images", post(relay::upload_image))
        // Operations
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_snapshot))
        .layer(middleware::from_fn_with_state(state.clone(), track_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn track_metrics(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let endpoint = endpoint_from_path(req.uri().path());
    let started = Instant::now();
    let response = next.run(req).await;

    if let Some(endpoint) = endpoint {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let is_error = response.status().is_server_error();
        state.metrics.record_request(endpoint, elapsed_ms, is_error);
    }
    response
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    state.auth_service.require_admin(&headers)?;
    let mut snapshot = state.metrics.snapshot();
    snapshot["vehicles"] = serde_json::json!(state.catalog.len());
    snapshot["relay"]["open_sessions"] = serde_json::json!(state.relay.len());
    Ok(Json(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use reqwest::{Method, StatusCode};
    use serde_json::json;
    use tempfile::NamedTempFile;

    struct TestServer {
        base: String,
        client: reqwest::Client,
        state: AppState,
    }

    async fn start_test_server(path: &str) -> TestServer {
        let mut config = Config::local(path);
        config.admin_key = Some("admin-secret".to_string());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ));
        let state = AppState::build(config, Arc::new(SandboxGateway::new()), clock).unwrap();
        let app = router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            state,
        }
    }

    impl TestServer {
        async fn send(
            &self,
            method: Method,
            path: &str,
            token: &str,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut req = self.client.request(method, format!("{}{}", self.base, path));
            if !token.is_empty() {
                req = req.bearer_auth(token);
            }
            if let Some(body) = body {
                req = req.json(&body);
            }
            let resp = req.send().await.unwrap();
            let status = resp.status();
            let text = resp.text().await.unwrap();
            let value = serde_json::from_str(&text).unwrap_or(Value::Null);
            (status, value)
        }
    }

    #[tokio::test]
    async fn test_booking_flow_over_http() {
        let tmp = NamedTempFile::new().unwrap();
        let server = start_test_server(tmp.path().to_str().unwrap()).await;

        let (_, host) = server
            .send(Method::POST, "/auth/register", "", Some(json!({"username": "host"})))
            .await;
        let (_, driver) = server
            .send(Method::POST, "/auth/register", "", Some(json!({"username": "driver"})))
            .await;
        let host_token = host["token"].as_str().unwrap().to_string();
        let driver_token = driver["token"].as_str().unwrap().to_string();

        let (status, taken) = server
            .send(Method::POST, "/auth/register", "", Some(json!({"username": "host"})))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(taken.get("token").is_none());

        let vehicle_id = uuid::Uuid::new_v4();
        let vehicle = json!({
            "host_id": host["user_id"],
            "name": "Corolla",
            "rate_card": {"daily_rate_cents": 5000, "weekly_rate_cents": 30000}
        });
        let (status, _) = server
            .send(Method::PUT, &format!("/vehicles/{}", vehicle_id), "admin-secret", Some(vehicle))
            .await;
        assert_eq!(status, StatusCode::OK);

        let booking = |start: &str, quantity: u32| {
            json!({
                "vehicle_id": vehicle_id,
                "start_date": start,
                "quantum": "daily",
                "quantity": quantity
            })
        };
        let (status, created) = server
            .send(Method::POST, "/reservations", &driver_token, Some(booking("2024-06-01", 3)))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["price"]["total_cents"], 15000);
        assert_eq!(created["status"], "pending");
        assert_eq!(created["payment_status"], "unpaid");
        assert_eq!(created["code"], "RUFS-00001");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, body) = server
            .send(Method::POST, "/reservations", &driver_token, Some(booking("2024-06-02", 1)))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "conflict");

        let confirm = format!("/reservations/{}/confirm", id);
        let (status, body) = server.send(Method::POST, &confirm, &driver_token, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "auth");
        let (status, _) = server.send(Method::POST, &confirm, &host_token, None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, intent) = server
            .send(Method::POST, &format!("/reservations/{}/payments", id), &driver_token, None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(intent["amount_cents"], 15000);
        assert_eq!(intent["purpose"], "initial");

        let checkout = format!(
            "/reservations/{}/payments/{}/checkout",
            id,
            intent["intent_id"].as_str().unwrap()
        );
        let (status, receipt) = server
            .send(
                Method::POST,
                &checkout,
                &driver_token,
                Some(json!({"payment_method": "pm_card_visa"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(receipt["outcome"], "paid");
        assert_eq!(receipt["reservation"]["payment_status"], "paid");

        let (status, report) = server
            .send(
                Method::POST,
                &format!("/reservations/{}/payments/reconcile", id),
                &host_token,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["outcome"], "already_paid");

        let (status, ledger) = server
            .send(Method::GET, &format!("/reservations/{}/payments", id), &host_token, None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ledger.as_array().unwrap().len(), 1);

        let (status, view) = server
            .send(Method::GET, &format!("/reservations/{}", id), &driver_token, None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["overdue"]["overdue"], false);

        let (status, overdue) = server
            .send(Method::GET, "/reservations/overdue", &host_token, None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(overdue.as_array().unwrap().is_empty());

        let (status, _) = server
            .send(Method::GET, &format!("/reservations/{}", id), "", None)
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, metrics) = server.send(Method::GET, "/metrics", "admin-secret", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(metrics["engine"]["payments_applied"], 1);
        assert_eq!(metrics["engine"]["reservations_created"], 1);
        assert_eq!(server.state.catalog.len(), 1);
    }

    #[tokio::test]
    async fn test_relay_over_http() {
        let tmp = NamedTempFile::new().unwrap();
        let server = start_test_server(tmp.path().to_str().unwrap()).await;

        let (status, session) = server
            .send(Method::POST, "/relay/sessions", "", Some(json!({"label": "selfie"})))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let path = format!("/relay/sessions/{}", session["session_id"].as_str().unwrap());

        let (status, uploaded) = server
            .send(
                Method::POST,
                &format!("{}/images", path),
                "",
                Some(json!({"image_ref": "https://files.example.com/a.jpg"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(uploaded["count"], 1);

        let (status, poll) = server.send(Method::GET, &path, "", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(poll["latest"]["image_ref"], "https://files.example.com/a.jpg");

        let (status, _) = server.send(Method::DELETE, &path, "", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = server.send(Method::DELETE, &path, "", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = server.send(Method::GET, &path, "", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_metrics_requires_admin() {
        let tmp = NamedTempFile::new().unwrap();
        let server = start_test_server(tmp.path().to_str().unwrap()).await;
        let (status, _) = server.send(Method::GET, "/metrics", "", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = server.send(Method::GET, "/health", "", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
