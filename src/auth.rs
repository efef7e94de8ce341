use crate::{
    config::Config,
    error::{AppError, Result},
    store::{lock_db, DbConn},
};
use axum::{extract::State, http::HeaderMap, Json};
use base64::Engine;
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The admin key authenticates as this id.
pub const ADMIN_USER_ID: Uuid = Uuid::nil();

/// Parse `"alice:tok1,bob:tok2"` or `"tok1,tok2"` (bare token means username = token).
/// Also handles newline-delimited input from a file (# = comment).
fn parse_token_list(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .flat_map(|line| line.split(','))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && !s.starts_with('#'))
        .map(|entry| {
            if let Some((user, tok)) = entry.split_once(':') {
                (user.trim().to_string(), tok.trim().to_string())
            } else {
                (entry.to_string(), entry.to_string())
            }
        })
        .collect()
}

fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() || username.len() > 64 {
        return Err(AppError::InvalidInput(
            "username must be 1-64 characters".to_string(),
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::InvalidInput(
            "username may only contain letters, digits, hyphens and underscores".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub created_at: chrono::DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub token: String,
    pub user_id: Uuid,
    pub username: String,
}

/// Bearer-token identity. Drivers and hosts are plain users; which role a user
/// plays is decided per reservation.
#[derive(Clone)]
pub struct AuthService {
    db: DbConn,
    config: Config,
    /// token -> user id, so most requests skip the database mutex.
    token_cache: Arc<DashMap<String, Uuid>>,
}

impl AuthService {
    pub fn new(config: Config, db: DbConn) -> Result<Self> {
        let token_cache = DashMap::new();
        {
            let conn = lock_db(&db)?;
            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    username TEXT NOT NULL UNIQUE,
                    token TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL
                )
                "#,
                [],
            )?;

            let mut stmt = conn.prepare("SELECT token, id FROM users")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for (token, id) in rows.flatten() {
                if let Ok(uuid) = Uuid::parse_str(&id) {
                    token_cache.insert(token, uuid);
                }
            }
            info!("Loaded {} tokens into auth cache", token_cache.len());
        }

        Ok(Self {
            db,
            config,
            token_cache: Arc::new(token_cache),
        })
    }

    /// Seed tokens from `STATIC_TOKENS` / `STATIC_TOKENS_FILE`. An existing
    /// username keeps its stored token.
    pub fn seed_static_tokens(&self) -> Result<()> {
        let mut pairs: Vec<(String, String)> = Vec::new();

        if let Some(raw) = &self.config.static_tokens {
            pairs.extend(parse_token_list(raw));
        }
        if let Some(path) = &self.config.static_tokens_file {
            match std::fs::read_to_string(path) {
                Ok(contents) => pairs.extend(parse_token_list(&contents)),
                Err(e) => warn!("Could not read STATIC_TOKENS_FILE {}: {}", path, e),
            }
        }

        for (username, token) in pairs {
            if let Err(e) = validate_username(&username) {
                warn!("Skipping static user '{}': {}", username, e);
                continue;
            }
            let (user, created) = self.insert_or_get(&username, Some(token.clone()))?;
            if created || user.token == token {
                info!("Static token seeded for user '{}'", username);
            } else {
                info!("User '{}' already exists; keeping existing token", username);
            }
        }
        Ok(())
    }

    /// Registers a new user. A taken username is a `Conflict`; its token is
    /// only ever handed out once, on creation.
    pub fn register(&self, username: &str) -> Result<User> {
        validate_username(username)?;
        match self.insert_or_get(username, None)? {
            (user, true) => Ok(user),
            (_, false) => Err(AppError::Conflict(format!(
                "username '{}' is already taken",
                username
            ))),
        }
    }

    /// The stored user for `username`, creating it if needed. The flag is true
    /// when this call created it.
    fn insert_or_get(&self, username: &str, token: Option<String>) -> Result<(User, bool)> {
        let conn = lock_db(&self.db)?;

        let existing = conn
            .query_row(
                "SELECT id, token, created_at FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        if let Some((id, token, created_at)) = existing {
            let user = User {
                id: Uuid::parse_str(&id)?,
                username: username.to_string(),
                token,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| AppError::Internal(e.into()))?
                    .with_timezone(&Utc),
            };
            self.token_cache.insert(user.token.clone(), user.id);
            debug!("Existing user: {}", user.username);
            return Ok((user, false));
        }

        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            token: token.unwrap_or_else(generate_token),
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO users (id, username, token, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                user.id.to_string(),
                user.username,
                user.token,
                user.created_at.to_rfc3339()
            ],
        )?;

        self.token_cache.insert(user.token.clone(), user.id);
        info!("New user created: {}", user.username);
        Ok((user, true))
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Uuid> {
        let bearer_token = headers
            .get("authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "));

        if let Some(admin_key) = &self.config.admin_key {
            let provided_key = headers
                .get("x-admin-key")
                .and_then(|v| v.to_str().ok())
                .or(bearer_token);
            if provided_key == Some(admin_key.as_str()) {
                return Ok(ADMIN_USER_ID);
            }
        }

        let token = bearer_token.ok_or(AppError::MissingAuth)?;

        if let Some(user_id) = self.token_cache.get(token) {
            return Ok(*user_id);
        }

        let conn = lock_db(&self.db)?;
        let user_id: String = conn
            .query_row(
                "SELECT id FROM users WHERE token = ?1",
                params![token],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(AppError::Unauthorized)?;

        let uuid = Uuid::parse_str(&user_id)?;
        self.token_cache.insert(token.to_string(), uuid);
        Ok(uuid)
    }

    pub fn require_admin(&self, headers: &HeaderMap) -> Result<()> {
        if self.authenticate(headers)? == ADMIN_USER_ID {
            Ok(())
        } else {
            Err(AppError::Forbidden("admin key required".to_string()))
        }
    }

    pub fn username_of(&self, user_id: Uuid) -> Result<Option<String>> {
        if user_id == ADMIN_USER_ID {
            return Ok(Some("admin".to_string()));
        }
        let conn = lock_db(&self.db)?;
        let username = conn
            .query_row(
                "SELECT username FROM users WHERE id = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(username)
    }
}

fn generate_token() -> String {
    let token_bytes: [u8; 32] = rand::thread_rng().gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(token_bytes)
}

// ── Route handlers ──────────────────────────────────────────────────────

/// `POST /auth/register`, body `{"username": "alice"}`.
pub async fn register(
    State(state): State<crate::AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>> {
    let user = state.auth_service.register(payload.username.trim())?;
    Ok(Json(RegisterResponse {
        token: user.token,
        user_id: user.id,
        username: user.username,
    }))
}
