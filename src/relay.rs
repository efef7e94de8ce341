use chrono::Duration as ChronoDuration;
use dashmap::{mapref::one::RefMut, DashMap};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::{
    clock::Clock,
    config::Config,
    error::{AppError, Result},
    metrics::{DomainEvent, Metrics},
    models::{
        CreateUploadSessionRequest, CreateUploadSessionResponse, PollQuery, PollResponse,
        RelayedImage, UploadImageRequest, UploadImageResponse, UploadSession,
    },
};

const MAX_LABEL_LEN: usize = 64;
const MAX_IMAGE_REF_LEN: usize = 2048;

pub fn validate_label(label: &str) -> std::result::Result<(), String> {
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return Err(format!("label must be 1-{} characters", MAX_LABEL_LEN));
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("label may only contain letters, digits, '-' and '_'".to_string());
    }
    Ok(())
}

pub fn validate_image_ref(image_ref: &str) -> std::result::Result<(), String> {
    if image_ref.len() > MAX_IMAGE_REF_LEN {
        return Err(format!(
            "image reference must be at most {} characters",
            MAX_IMAGE_REF_LEN
        ));
    }
    let rest = image_ref
        .strip_prefix("https://")
        .or_else(|| image_ref.strip_prefix("http://"))
        .ok_or_else(|| "image reference must be an http(s) URL".to_string())?;
    if rest.is_empty() || rest.chars().any(char::is_whitespace) {
        return Err("image reference must be an http(s) URL".to_string());
    }
    Ok(())
}

/// 128 random bits as 32 lowercase hex characters.
fn generate_session_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

fn is_session_id(raw: &str) -> bool {
    raw.len() == 32 && raw.chars().all(|c| c.is_ascii_hexdigit())
}

/// Short-lived, unauthenticated image handoff channels. Possession of the id
/// is the only credential, so sessions live minutes and vanish completely.
#[derive(Clone)]
pub struct UploadRelay {
    sessions: Arc<DashMap<String, UploadSession>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    ttl: ChronoDuration,
    max_images: usize,
    public_base_url: String,
}

impl UploadRelay {
    pub fn new(config: &Config, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            clock,
            metrics,
            ttl: ChronoDuration::seconds(config.upload_session_ttl_secs as i64),
            max_images: config.upload_session_max_images,
            public_base_url: config.public_base_url.clone(),
        }
    }

    pub fn create(&self, label: Option<String>) -> Result<CreateUploadSessionResponse> {
        if let Some(label) = &label {
            validate_label(label).map_err(AppError::InvalidInput)?;
        }

        let now = self.clock.now();
        let session = UploadSession {
            id: generate_session_id(),
            label,
            images: Vec::new(),
            created_at: now,
            expires_at: now + self.ttl,
        };

        let mut consumer_url = format!("{}/relay/{}", self.public_base_url, session.id);
        if let Some(label) = &session.label {
            consumer_url.push_str(&format!("?slot={}", urlencoding::encode(label)));
        }
        let response = CreateUploadSessionResponse {
            session_id: session.id.clone(),
            consumer_url,
            label: session.label.clone(),
            expires_at: session.expires_at,
        };

        self.sessions.insert(session.id.clone(), session);
        self.metrics.record(DomainEvent::RelaySessionCreated);
        info!("Upload session created: {}", response.session_id);
        Ok(response)
    }

    /// Resolves a live session. Expired sessions are dropped on the spot and
    /// look exactly like sessions that never existed.
    fn live(&self, session_id: &str) -> Result<RefMut<'_, String, UploadSession>> {
        if !is_session_id(session_id) {
            return Err(AppError::SessionNotFound);
        }
        let now = self.clock.now();
        if self
            .sessions
            .remove_if(session_id, |_, s| s.is_expired_at(now))
            .is_some()
        {
            self.metrics.record(DomainEvent::RelaySessionExpired);
            debug!("Upload session expired on access: {}", session_id);
            return Err(AppError::SessionNotFound);
        }
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or(AppError::SessionNotFound)?;
        if session.is_expired_at(now) {
            return Err(AppError::SessionNotFound);
        }
        Ok(session)
    }

    pub fn upload(&self, session_id: &str, image_ref: &str) -> Result<UploadImageResponse> {
        let mut session = self.live(session_id)?;
        validate_image_ref(image_ref).map_err(AppError::InvalidInput)?;
        if session.images.len() >= self.max_images {
            return Err(AppError::InvalidInput(format!(
                "session already holds {} images",
                self.max_images
            )));
        }

        let seq = session.images.len() as u32 + 1;
        session.images.push(RelayedImage {
            seq,
            image_ref: image_ref.to_string(),
            received_at: self.clock.now(),
        });
        let count = session.images.len();
        drop(session);

        self.metrics.record(DomainEvent::RelayUpload);
        debug!("Upload session {} received image #{}", session_id, seq);
        Ok(UploadImageResponse { count, seq })
    }

    /// Images in arrival order, optionally only those after `since`.
    pub fn poll(&self, session_id: &str, since: Option<u32>) -> Result<PollResponse> {
        let session = self.live(session_id)?;
        let since = since.unwrap_or(0);
        let images: Vec<RelayedImage> = session
            .images
            .iter()
            .filter(|img| img.seq > since)
            .cloned()
            .collect();

        Ok(PollResponse {
            session_id: session.id.clone(),
            label: session.label.clone(),
            count: session.images.len(),
            latest: session.images.last().cloned(),
            images,
            expires_at: session.expires_at,
        })
    }

    /// Idempotent: closing an unknown or already closed session succeeds.
    pub fn close(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            info!("Upload session closed: {}", session_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn start_expiry_task(self) {
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(5));
            info!("Started upload session expiry task (5s interval)");

            loop {
                interval.tick().await;
                self.sweep();
            }
        });
    }

    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired_at(now));
        let expired = before.saturating_sub(self.sessions.len());
        if expired > 0 {
            self.metrics
                .record_n(DomainEvent::RelaySessionExpired, expired as u64);
            debug!("Swept {} expired upload sessions", expired);
        }
        expired
    }
}

// ── Route handlers ──────────────────────────────────────────────────────

pub async fn create_session(
    State(state): State<crate::AppState>,
    body: Option<Json<CreateUploadSessionRequest>>,
) -> Result<(StatusCode, Json<CreateUploadSessionResponse>)> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let session = state.relay.create(req.label)?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn upload_image(
    Path(id): Path<String>,
    State(state): State<crate::AppState>,
    Json(req): Json<UploadImageRequest>,
) -> Result<Json<UploadImageResponse>> {
    Ok(Json(state.relay.upload(&id, &req.image_ref)?))
}

pub async fn poll_session(
    Path(id): Path<String>,
    State(state): State<crate::AppState>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollResponse>> {
    Ok(Json(state.relay.poll(&id, query.since)?))
}

pub async fn close_session(
    Path(id): Path<String>,
    State(state): State<crate::AppState>,
) -> StatusCode {
    state.relay.close(&id);
    StatusCode::NO_CONTENT
}
