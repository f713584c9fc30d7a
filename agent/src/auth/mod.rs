//! Per-run callback credentials.
//!
//! Before a job is dispatched the agent mints a random token for its run id.
//! The job presents `X-Run-Id` and `X-Runner-Token` on every callback; the
//! [`require_run_token`] middleware rejects anything that does not match the
//! current token for that run.

mod memory;
mod redis;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

pub use self::memory::MemoryTokenStore;
pub use self::redis::{DEFAULT_REDIS_TTL, RedisTokenStore};

pub const RUN_ID_HEADER: &str = "x-run-id";
pub const TOKEN_HEADER: &str = "x-runner-token";

/// Storage for the current token of each run.
///
/// `set` overwrites any previous token for the run. `get` returns `None` for
/// unknown or expired runs.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn set(&self, run_id: &str, token: &str) -> Result<()>;
    async fn get(&self, run_id: &str) -> Result<Option<String>>;
    async fn delete(&self, run_id: &str) -> Result<()>;
}

/// Run id a request was authorized for, attached to request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedRun(pub String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("invalid token for run {0}")]
    InvalidToken(String),
}

#[derive(Clone)]
pub struct Authorizer {
    store: Arc<dyn TokenStore>,
}

impl Authorizer {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    /// Authorizer backed by a non-expiring in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryTokenStore::new(None)))
    }

    /// Mint a fresh token for the run, replacing any earlier one.
    pub async fn generate_token(&self, run_id: &str) -> Result<String> {
        let token = new_token();
        self.store
            .set(run_id, &token)
            .await
            .with_context(|| format!("store token for run {run_id}"))?;
        debug!(run_id, "issued callback token");
        Ok(token)
    }

    /// True iff `token` is the live token for `run_id`. Store failures count as invalid.
    pub async fn validate(&self, run_id: &str, token: &str) -> bool {
        match self.store.get(run_id).await {
            Ok(Some(current)) => bool::from(current.as_bytes().ct_eq(token.as_bytes())),
            Ok(None) => false,
            Err(err) => {
                warn!(run_id, error = %format!("{err:#}"), "token lookup failed");
                false
            }
        }
    }

    pub async fn revoke(&self, run_id: &str) -> Result<()> {
        self.store
            .delete(run_id)
            .await
            .with_context(|| format!("revoke token for run {run_id}"))
    }

    /// Check the credential headers of an inbound callback.
    pub async fn authorize(&self, headers: &HeaderMap) -> Result<AuthorizedRun, AuthError> {
        let run_id = header_value(headers, RUN_ID_HEADER)?;
        let token = header_value(headers, TOKEN_HEADER)?;
        if self.validate(run_id, token).await {
            Ok(AuthorizedRun(run_id.to_string()))
        } else {
            Err(AuthError::InvalidToken(run_id.to_string()))
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, AuthError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(AuthError::MissingHeader(name))
}

/// 256 random bits, hex encoded.
fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Route layer that rejects callbacks without a valid run token.
///
/// On success the [`AuthorizedRun`] is inserted into request extensions for
/// handlers to compare against the body.
pub async fn require_run_token(
    State(authorizer): State<Authorizer>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    match authorizer.authorize(request.headers()).await {
        Ok(run) => {
            request.extensions_mut().insert(run);
            Ok(next.run(request).await)
        }
        Err(err) => {
            debug!(error = %err, path = %request.uri().path(), "rejected callback");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
