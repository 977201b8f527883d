//! In-memory bearer token with an explicit expiry.

use std::fmt;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tonic::metadata::{Ascii, MetadataValue};

use crate::error::{AgentError, Result};

#[derive(Clone)]
pub struct BearerToken {
    value: String,
    expires_at: Instant,
}

impl BearerToken {
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Value for the `authorization` request header.
    pub fn authorization(&self) -> Result<MetadataValue<Ascii>> {
        format!("Bearer {}", self.value)
            .parse()
            .map_err(|_| AgentError::auth("access token contains invalid characters"))
    }
}

// Never print the token itself.
impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The session's token slot. Cleared by `close()`.
#[derive(Debug)]
pub(crate) struct TokenSlot {
    inner: RwLock<Option<BearerToken>>,
}

impl TokenSlot {
    pub fn new(token: BearerToken) -> Self {
        Self {
            inner: RwLock::new(Some(token)),
        }
    }

    /// The token, if present and not expired.
    pub fn current(&self) -> Result<BearerToken> {
        let guard = self
            .inner
            .read()
            .map_err(|_| AgentError::auth("token lock poisoned"))?;
        match guard.as_ref() {
            None => Err(AgentError::auth("no access token (session closed)")),
            Some(t) if t.is_expired() => Err(AgentError::auth("access token expired")),
            Some(t) => Ok(t.clone()),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.inner.write() {
            guard.take();
        }
    }
}
