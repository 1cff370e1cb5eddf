// =============================================================================
// Control Guard — token, two-man approval, and idempotency enforcement
// =============================================================================
//
// Every mutating control endpoint passes through some subset of:
//
//   1. Token check: `X-Ops-Token` against OPS_API_TOKEN / OPS_API_TOKEN_FILE.
//      The file is preferred and cached by (path, mtime) so rotation is a
//      file write away. Unconfigured secret → 503; bad token → 401.
//      Comparison is constant time.
//   2. Two-man approval: `X-Ops-Approver` must be in the configured
//      allow-list. Only enforced when a list is configured; missing → 403.
//   3. Idempotency: `Idempotency-Key` (or `X-Idempotency-Key`) required for
//      opted-in endpoints; the canonical response is stored per key and
//      replayed byte-equal on repeats. Same key + different body → 409.
//
// Rejections are structured `{code, message}` bodies.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{request::Parts, StatusCode};
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::OpsConfig;
use crate::engine_state::EngineState;
use crate::types::epoch_now;

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time (for equal lengths). A length
/// mismatch is observable, which is acceptable for token auth — the attacker
/// does not control the expected token length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// =============================================================================
// Rejections
// =============================================================================

pub struct GuardRejection {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
}

impl GuardRejection {
    pub const UNCONFIGURED: Self = Self {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "auth.unconfigured",
        message: "OPS_API_TOKEN or OPS_API_TOKEN_FILE must be configured",
    };
    pub const INVALID_TOKEN: Self = Self {
        status: StatusCode::UNAUTHORIZED,
        code: "auth.invalid_token",
        message: "Unauthorized control request",
    };
    pub const APPROVER_REQUIRED: Self = Self {
        status: StatusCode::FORBIDDEN,
        code: "auth.approver_required",
        message: "Secondary approver token required for this action",
    };
    pub const MISSING_IDEMPOTENCY_KEY: Self = Self {
        status: StatusCode::BAD_REQUEST,
        code: "idempotency.missing_header",
        message: "Missing Idempotency-Key header",
    };
}

impl IntoResponse for GuardRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "code": self.code,
            "message": self.message,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

// =============================================================================
// Token cache
// =============================================================================

/// Resolves the expected ops token, preferring the mounted secret file and
/// caching its contents by (path, mtime) so rotation needs no restart.
#[derive(Default)]
pub struct OpsTokenCache {
    inner: Mutex<Option<(PathBuf, SystemTime, String)>>,
}

impl OpsTokenCache {
    pub fn resolve(&self, cfg: &OpsConfig) -> Option<String> {
        if let Some(file) = &cfg.token_file {
            let path = PathBuf::from(file);
            match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(mtime) => {
                    {
                        let cached = self.inner.lock();
                        if let Some((cpath, cmtime, value)) = cached.as_ref() {
                            if cpath == &path && cmtime == &mtime && !value.is_empty() {
                                return Some(value.clone());
                            }
                        }
                    }
                    match std::fs::read_to_string(&path) {
                        Ok(raw) => {
                            let token = raw.trim().to_string();
                            if token.is_empty() {
                                warn!(path = %path.display(), "ops token file is empty");
                            } else {
                                *self.inner.lock() = Some((path, mtime, token.clone()));
                                return Some(token);
                            }
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "failed to read ops token file")
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to stat ops token file")
                }
            }
        }
        cfg.token.clone().filter(|t| !t.is_empty())
    }
}

// =============================================================================
// Extractors
// =============================================================================

/// Validates `X-Ops-Token`. 503 when no secret is configured, 401 on mismatch.
pub struct OpsToken;

#[async_trait]
impl FromRequestParts<Arc<EngineState>> for OpsToken {
    type Rejection = GuardRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<EngineState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.ops_token_cache.resolve(&state.config.ops) else {
            warn!("control request rejected — no ops token configured");
            return Err(GuardRejection::UNCONFIGURED);
        };
        let provided = parts
            .headers
            .get("X-Ops-Token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
            warn!("control request rejected — invalid ops token");
            return Err(GuardRejection::INVALID_TOKEN);
        }
        Ok(OpsToken)
    }
}

/// Two-man approval: `X-Ops-Approver` must be one of the configured approver
/// secrets. Pass-through (`None`) when no allow-list is configured.
pub struct Approver(pub Option<String>);

#[async_trait]
impl FromRequestParts<Arc<EngineState>> for Approver {
    type Rejection = GuardRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<EngineState>,
    ) -> Result<Self, Self::Rejection> {
        let allowed = &state.config.ops.approver_tokens;
        if allowed.is_empty() {
            return Ok(Approver(None));
        }
        let provided = parts
            .headers
            .get("X-Ops-Approver")
            .and_then(|v| v.to_str().ok());
        match provided {
            Some(token) if allowed.iter().any(|a| constant_time_eq(a.as_bytes(), token.as_bytes())) => {
                Ok(Approver(Some(token.to_string())))
            }
            _ => {
                warn!("control request rejected — approver missing or not allowed");
                Err(GuardRejection::APPROVER_REQUIRED)
            }
        }
    }
}

/// Optional idempotency key, read from `Idempotency-Key` with
/// `X-Idempotency-Key` as an accepted alias.
pub struct IdemKey(pub Option<String>);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for IdemKey {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let key = ["Idempotency-Key", "X-Idempotency-Key"]
            .iter()
            .find_map(|name| {
                parts
                    .headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string())
            })
            .filter(|s| !s.is_empty());
        Ok(IdemKey(key))
    }
}

// =============================================================================
// Idempotency store
// =============================================================================

pub fn body_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

struct IdemEntry {
    body_hash: String,
    status: u16,
    body: String,
    at: f64,
}

pub enum IdemCheck {
    /// No record — execute the handler and `record` the outcome.
    Fresh,
    /// Same key and body seen before — replay the stored response bytes.
    Replay { status: u16, body: String },
    /// Same key with a different body.
    Conflict,
}

pub struct IdempotencyStore {
    retention_sec: f64,
    entries: Mutex<HashMap<String, IdemEntry>>,
}

impl IdempotencyStore {
    pub fn new(retention_sec: f64) -> Self {
        Self {
            retention_sec,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str, body_hash: &str) -> IdemCheck {
        self.check_at(key, body_hash, epoch_now())
    }

    pub fn check_at(&self, key: &str, body_hash: &str, now: f64) -> IdemCheck {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if now - entry.at <= self.retention_sec => {
                if entry.body_hash == body_hash {
                    IdemCheck::Replay {
                        status: entry.status,
                        body: entry.body.clone(),
                    }
                } else {
                    IdemCheck::Conflict
                }
            }
            _ => IdemCheck::Fresh,
        }
    }

    pub fn record(&self, key: &str, body_hash: &str, status: u16, body: &str) {
        self.record_at(key, body_hash, status, body, epoch_now());
    }

    pub fn record_at(&self, key: &str, body_hash: &str, status: u16, body: &str, now: f64) {
        let mut entries = self.entries.lock();
        entries.retain(|_, e| now - e.at <= self.retention_sec);
        entries.insert(
            key.to_string(),
            IdemEntry {
                body_hash: body_hash.to_string(),
                status,
                body: body.to_string(),
                at: now,
            },
        );
    }
}
