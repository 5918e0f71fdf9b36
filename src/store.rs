//! Redis-backed artifact storage.

use crate::converter::Persist;
use crate::error::ConversionError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::{debug, info};

/// Key prefix for stored artifacts.
const ARTIFACT_KEY_PREFIX: &str = "weaver:artifact";

/// Default artifact TTL in seconds (24 hours).
pub const DEFAULT_ARTIFACT_TTL_SECONDS: u64 = 86400;

/// Stores converted artifacts in Redis with an expiry.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, ttl_seconds: u64) -> Self {
        Self { conn, ttl_seconds }
    }

    /// Connects to Redis at `url`.
    pub async fn connect(url: &str, ttl_seconds: u64) -> Result<Self> {
        let client = redis::Client::open(url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        info!("Connected to Redis artifact store");
        Ok(Self::new(conn, ttl_seconds))
    }

    fn artifact_key(key: &str) -> String {
        format!("{}:{}", ARTIFACT_KEY_PREFIX, key)
    }

    /// Reads a stored artifact back.
    pub async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn
            .get(Self::artifact_key(key))
            .await
            .context("Failed to fetch artifact")?;
        Ok(bytes)
    }
}

#[async_trait]
impl Persist for RedisStore {
    async fn upload(&self, key: &str, payload: &[u8]) -> Result<bool, ConversionError> {
        if payload.is_empty() {
            debug!(key = %key, "Skipping upload of empty artifact");
            return Ok(false);
        }

        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::artifact_key(key), payload, self.ttl_seconds)
            .await
            .map_err(|e| ConversionError::UploadFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        debug!(key = %key, bytes = payload.len(), "Stored artifact");
        Ok(true)
    }
}
