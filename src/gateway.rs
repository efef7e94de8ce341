use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPayment,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
}

/// The gateway's view of a charge intent. Always authoritative over anything a
/// client reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayIntent {
    pub id: String,
    pub reservation_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub purpose: String,
    pub status: IntentStatus,
    pub client_secret: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateIntent {
    pub reservation_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub purpose: String,
    #[serde(skip)]
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub id: String,
    pub reservation_id: Uuid,
    pub amount_cents: i64,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway unreachable: {0}")]
    Unreachable(String),

    #[error("payment gateway did not answer within {0:?}")]
    Timeout(Duration),

    #[error("payment gateway rejected the request: {0}")]
    Rejected(String),

    #[error("payment intent {0} is unknown to the gateway")]
    NotFound(String),
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unreachable(_) => AppError::PaymentUnavailable(err.to_string()),
            GatewayError::Timeout(_) => AppError::PaymentProcessing(err.to_string()),
            GatewayError::Rejected(_) => AppError::PaymentDeclined(err.to_string()),
            GatewayError::NotFound(id) => AppError::IntentNotFound(id),
        }
    }
}

/// Create, fetch, confirm, cancel and refund charges. Every write carries an
/// idempotency key derived from the reservation and purpose.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(&self, req: &CreateIntent) -> Result<GatewayIntent, GatewayError>;

    async fn fetch_intent(&self, intent_id: &str) -> Result<GatewayIntent, GatewayError>;

    async fn list_intents(&self, reservation_id: Uuid) -> Result<Vec<GatewayIntent>, GatewayError>;

    async fn confirm_intent(
        &self,
        intent_id: &str,
        payment_method: &str,
    ) -> Result<GatewayIntent, GatewayError>;

    /// Cancels an uncaptured intent. An intent that already captured is
    /// returned unchanged, so the caller can tell it needs a refund instead.
    async fn cancel_intent(&self, intent_id: &str) -> Result<GatewayIntent, GatewayError>;

    async fn refund(
        &self,
        reservation_id: Uuid,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> Result<GatewayRefund, GatewayError>;
}

/// Bounds a gateway call. An elapsed timeout means "outcome unknown".
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Payment gateway call exceeded {:?}", limit);
            Err(GatewayError::Timeout(limit))
        }
    }
}

// ── HTTP adapter ────────────────────────────────────────────────────────

pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Deserialize)]
struct IntentList {
    data: Vec<GatewayIntent>,
}

#[derive(Serialize)]
struct RefundBody {
    reservation_id: Uuid,
    amount_cents: i64,
}

#[derive(Serialize)]
struct ConfirmBody<'a> {
    payment_method: &'a str,
}

impl HttpPaymentGateway {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rufs/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn send_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Unreachable(e.to_string())
        }
    }

    async fn read<T: DeserializeOwned>(
        resp: reqwest::Response,
        subject: &str,
    ) -> Result<T, GatewayError> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(subject.to_string()));
        }
        if status.is_server_error() {
            return Err(GatewayError::Unreachable(format!("gateway returned {}", status)));
        }
        if status.is_client_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected(format!("{}: {}", status, body)));
        }
        resp.json::<T>()
            .await
            .map_err(|e| GatewayError::Unreachable(format!("malformed gateway response: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_intent(&self, req: &CreateIntent) -> Result<GatewayIntent, GatewayError> {
        let resp = self
            .request(reqwest::Method::POST, "/v1/payment_intents")
            .header("Idempotency-Key", &req.idempotency_key)
            .json(req)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        Self::read(resp, &req.idempotency_key).await
    }

    async fn fetch_intent(&self, intent_id: &str) -> Result<GatewayIntent, GatewayError> {
        let path = format!("/v1/payment_intents/{}", urlencoding::encode(intent_id));
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        Self::read(resp, intent_id).await
    }

    async fn list_intents(&self, reservation_id: Uuid) -> Result<Vec<GatewayIntent>, GatewayError> {
        let path = format!("/v1/payment_intents?reservation_id={}", reservation_id);
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let list: IntentList = Self::read(resp, &reservation_id.to_string()).await?;
        Ok(list.data)
    }

    async fn confirm_intent(
        &self,
        intent_id: &str,
        payment_method: &str,
    ) -> Result<GatewayIntent, GatewayError> {
        let path = format!("/v1/payment_intents/{}/confirm", urlencoding::encode(intent_id));
        let resp = self
            .request(reqwest::Method::POST, &path)
            .json(&ConfirmBody { payment_method })
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        Self::read(resp, intent_id).await
    }

    async fn cancel_intent(&self, intent_id: &str) -> Result<GatewayIntent, GatewayError> {
        let path = format!("/v1/payment_intents/{}/cancel", urlencoding::encode(intent_id));
        let resp = self
            .request(reqwest::Method::POST, &path)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        Self::read(resp, intent_id).await
    }

    async fn refund(
        &self,
        reservation_id: Uuid,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> Result<GatewayRefund, GatewayError> {
        let resp = self
            .request(reqwest::Method::POST, "/v1/refunds")
            .header("Idempotency-Key", idempotency_key)
            .json(&RefundBody {
                reservation_id,
                amount_cents,
            })
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        Self::read(resp, idempotency_key).await
    }
}

// ── Sandbox ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct SandboxState {
    intents: DashMap<String, GatewayIntent>,
    /// idempotency key -> intent id
    intent_keys: DashMap<String, String>,
    /// idempotency key -> refund
    refunds: DashMap<String, GatewayRefund>,
    offline: AtomicBool,
    hold_processing: AtomicBool,
    decline: AtomicBool,
    latency_ms: AtomicU64,
    refund_calls: AtomicUsize,
}

/// In-process gateway used when no gateway URL is configured. It honours
/// idempotency keys like a real gateway and can simulate outages, slow
/// answers, declines and captures the server was never told about.
#[derive(Clone, Default)]
pub struct SandboxGateway {
    state: Arc<SandboxState>,
}

fn random_id(prefix: &str) -> String {
    let bytes: [u8; 12] = rand::thread_rng().gen();
    format!("{}_{}", prefix, hex::encode(bytes))
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    /// Confirmed intents stay `processing` until [`SandboxGateway::settle`].
    pub fn hold_processing(&self, hold: bool) {
        self.state.hold_processing.store(hold, Ordering::SeqCst);
    }

    pub fn decline_payments(&self, decline: bool) {
        self.state.decline.store(decline, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Captures an intent directly, as if the payer finished checkout but the
    /// confirmation never reached the server.
    pub fn capture(&self, intent_id: &str) -> bool {
        self.set_status(intent_id, IntentStatus::Succeeded)
    }

    pub fn settle(&self, intent_id: &str) -> bool {
        self.set_status(intent_id, IntentStatus::Succeeded)
    }

    /// Rewrites the amount of an intent; only useful for simulating tampering.
    pub fn tamper_amount(&self, intent_id: &str, amount_cents: i64) -> bool {
        match self.state.intents.get_mut(intent_id) {
            Some(mut intent) => {
                intent.amount_cents = amount_cents;
                true
            }
            None => false,
        }
    }

    pub fn intent(&self, intent_id: &str) -> Option<GatewayIntent> {
        self.state.intents.get(intent_id).map(|i| i.value().clone())
    }

    /// Distinct refunds issued, ignoring replays of the same key.
    pub fn refund_count(&self) -> usize {
        self.state.refunds.len()
    }

    pub fn refund_calls(&self) -> usize {
        self.state.refund_calls.load(Ordering::SeqCst)
    }

    pub fn refunded_cents(&self, reservation_id: Uuid) -> i64 {
        self.state
            .refunds
            .iter()
            .filter(|r| r.reservation_id == reservation_id)
            .map(|r| r.amount_cents)
            .sum()
    }

    fn set_status(&self, intent_id: &str, status: IntentStatus) -> bool {
        match self.state.intents.get_mut(intent_id) {
            Some(mut intent) => {
                intent.status = status;
                true
            }
            None => false,
        }
    }

    async fn simulate_network(&self) -> Result<(), GatewayError> {
        let latency = self.state.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.state.offline.load(Ordering::SeqCst) {
            return Err(GatewayError::Unreachable("sandbox gateway is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_intent(&self, req: &CreateIntent) -> Result<GatewayIntent, GatewayError> {
        self.simulate_network().await?;
        if req.amount_cents <= 0 {
            return Err(GatewayError::Rejected("amount must be positive".to_string()));
        }

        let intent_id = self
            .state
            .intent_keys
            .entry(req.idempotency_key.clone())
            .or_insert_with(|| {
                let id = random_id("pi");
                let intent = GatewayIntent {
                    id: id.clone(),
                    reservation_id: req.reservation_id,
                    amount_cents: req.amount_cents,
                    currency: req.currency.clone(),
                    purpose: req.purpose.clone(),
                    status: IntentStatus::RequiresPayment,
                    client_secret: Some(random_id(&format!("{}_secret", id))),
                    created_at: Utc::now(),
                };
                self.state.intents.insert(id.clone(), intent);
                debug!("Sandbox intent {} created for {}", id, req.idempotency_key);
                id
            })
            .clone();

        self.state
            .intents
            .get(&intent_id)
            .map(|i| i.value().clone())
            .ok_or(GatewayError::NotFound(intent_id))
    }

    async fn fetch_intent(&self, intent_id: &str) -> Result<GatewayIntent, GatewayError> {
        self.simulate_network().await?;
        self.intent(intent_id)
            .ok_or_else(|| GatewayError::NotFound(intent_id.to_string()))
    }

    async fn list_intents(&self, reservation_id: Uuid) -> Result<Vec<GatewayIntent>, GatewayError> {
        self.simulate_network().await?;
        let mut intents: Vec<GatewayIntent> = self
            .state
            .intents
            .iter()
            .filter(|i| i.reservation_id == reservation_id)
            .map(|i| i.value().clone())
            .collect();
        intents.sort_by_key(|i| i.created_at);
        Ok(intents)
    }

    async fn confirm_intent(
        &self,
        intent_id: &str,
        payment_method: &str,
    ) -> Result<GatewayIntent, GatewayError> {
        self.simulate_network().await?;
        if payment_method.trim().is_empty() {
            return Err(GatewayError::Rejected("payment method required".to_string()));
        }
        let mut intent = self
            .state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| GatewayError::NotFound(intent_id.to_string()))?;

        if intent.status == IntentStatus::RequiresPayment {
            intent.status = if self.state.decline.load(Ordering::SeqCst) {
                IntentStatus::Failed
            } else if self.state.hold_processing.load(Ordering::SeqCst) {
                IntentStatus::Processing
            } else {
                IntentStatus::Succeeded
            };
        }
        Ok(intent.value().clone())
    }

    async fn cancel_intent(&self, intent_id: &str) -> Result<GatewayIntent, GatewayError> {
        self.simulate_network().await?;
        let mut intent = self
            .state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| GatewayError::NotFound(intent_id.to_string()))?;
        if matches!(
            intent.status,
            IntentStatus::RequiresPayment | IntentStatus::Processing
        ) {
            intent.status = IntentStatus::Cancelled;
        }
        Ok(intent.value().clone())
    }

    async fn refund(
        &self,
        reservation_id: Uuid,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> Result<GatewayRefund, GatewayError> {
        self.simulate_network().await?;
        self.state.refund_calls.fetch_add(1, Ordering::SeqCst);
        let refund = self
            .state
            .refunds
            .entry(idempotency_key.to_string())
            .or_insert_with(|| GatewayRefund {
                id: random_id("re"),
                reservation_id,
                amount_cents,
            })
            .clone();
        Ok(refund)
    }
}
