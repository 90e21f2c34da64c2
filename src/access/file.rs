//! File-backed access manager
//!
//! One `<id>.token2` and one `<id>.usage` per token, both JSON. Every read
//! or write of a token's pair happens under that token's exclusive lock so
//! concurrent sessions on the same token cannot interleave updates. Legacy
//! `<id>.token` files are converted to `.token2` on first open.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::common::Traffic;
use crate::crypto::encrypt_client_id;
use crate::error::{Error, ErrorCode, Result};
use crate::wire::AccessUsage;

use super::token::{now_ms, AccessToken, AccessTokenUsage, LegacyAccessToken};
use super::{AccessManager, AdRequirement, SessionGrant, SessionRequest};

/// Grace period a rewarded-ad session gets before the ad must complete
const REWARDED_AD_GRACE_MS: u64 = 10 * 60 * 1000;

/// Keyed mutex map with weak-value semantics: idle entries are collected
/// the next time any lock is taken.
struct KeyedLocks {
    map: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.map.lock();
            map.retain(|_, weak| weak.strong_count() > 0);
            match map.get(key).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let created = Arc::new(AsyncMutex::new(()));
                    map.insert(key.to_string(), Arc::downgrade(&created));
                    created
                }
            }
        };
        entry.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.lock().len()
    }
}

struct FileSession {
    token_id: String,
    client_id: Uuid,
    /// Per-session hard stop; tighter than the token expiration for
    /// rewarded-ad sessions until the ad completes
    expiration: Option<u64>,
    ad_requirement: AdRequirement,
    max_client_count: Option<u32>,
}

pub struct FileAccessManager {
    storage_dir: PathBuf,
    locks: KeyedLocks,
    sessions: Mutex<HashMap<u64, FileSession>>,
    next_session_id: AtomicU64,
}

impl FileAccessManager {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Result<Self> {
        let storage_dir = storage_dir.into();
        std::fs::create_dir_all(&storage_dir)?;
        Ok(Self {
            storage_dir,
            locks: KeyedLocks::new(),
            sessions: Mutex::new(HashMap::new()),
            // Session ids must not collide across restarts
            next_session_id: AtomicU64::new(rand::random::<u64>() >> 16 | 1),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn token_path(&self, token_id: &str) -> Result<PathBuf> {
        Self::check_id(token_id)?;
        Ok(self.storage_dir.join(format!("{}.token2", token_id)))
    }

    fn legacy_token_path(&self, token_id: &str) -> PathBuf {
        self.storage_dir.join(format!("{}.token", token_id))
    }

    fn usage_path(&self, token_id: &str) -> PathBuf {
        self.storage_dir.join(format!("{}.usage", token_id))
    }

    fn check_id(token_id: &str) -> Result<()> {
        if token_id.is_empty()
            || token_id
                .chars()
                .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
        {
            return Err(Error::session(ErrorCode::AccessError, "malformed token id"));
        }
        Ok(())
    }

    /// Create and persist a new token; used by the CLI and tests.
    pub async fn create_token(&self, token: AccessToken) -> Result<AccessToken> {
        let _guard = self.locks.lock(&token.token_id).await;
        let path = self.token_path(&token.token_id)?;
        tokio::fs::write(&path, serde_json::to_vec_pretty(&token)?).await?;
        self.write_usage(&token.token_id, &AccessTokenUsage::new(now_ms()))
            .await?;
        info!("created token {} at {:?}", token.token_id, path);
        Ok(token)
    }

    /// Read a token, converting a legacy `.token` file if needed.
    /// Callers must hold the token lock.
    async fn load_token(&self, token_id: &str) -> Result<AccessToken> {
        let path = self.token_path(token_id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let legacy_path = self.legacy_token_path(token_id);
                let data = tokio::fs::read(&legacy_path).await.map_err(|_| {
                    Error::session(ErrorCode::AccessError, format!("unknown token {}", token_id))
                })?;
                let legacy: LegacyAccessToken = serde_json::from_slice(&data)?;
                let token: AccessToken = legacy.into();
                tokio::fs::write(&path, serde_json::to_vec_pretty(&token)?).await?;
                debug!("converted legacy token file for {}", token_id);
                Ok(token)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Public token read for the CLI; takes the token lock.
    pub async fn get_token(&self, token_id: &str) -> Result<AccessToken> {
        let _guard = self.locks.lock(token_id).await;
        self.load_token(token_id).await
    }

    async fn load_usage(&self, token_id: &str) -> Result<AccessTokenUsage> {
        match tokio::fs::read(self.usage_path(token_id)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(AccessTokenUsage::new(now_ms()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_usage(&self, token_id: &str, usage: &AccessTokenUsage) -> Result<()> {
        tokio::fs::write(self.usage_path(token_id), serde_json::to_vec_pretty(usage)?).await?;
        Ok(())
    }

    fn active_client_count(&self, token_id: &str) -> u32 {
        let sessions = self.sessions.lock();
        let mut clients: Vec<Uuid> = sessions
            .values()
            .filter(|s| s.token_id == token_id)
            .map(|s| s.client_id)
            .collect();
        clients.sort_unstable();
        clients.dedup();
        clients.len() as u32
    }

    fn check_limits(token: &AccessToken, usage: &AccessTokenUsage, now: u64) -> Result<()> {
        if token.is_expired(now) {
            return Err(Error::session(ErrorCode::AccessExpired, "token expired"));
        }
        if let Some(max) = token.max_traffic {
            if usage.total() > max {
                return Err(Error::session(
                    ErrorCode::AccessTrafficOverflow,
                    format!("traffic {} exceeds cap {}", usage.total(), max),
                ));
            }
        }
        Ok(())
    }

    fn access_usage(token: &AccessToken, usage: &AccessTokenUsage, active: u32) -> AccessUsage {
        AccessUsage {
            traffic: Traffic::new(usage.sent_bytes, usage.received_bytes),
            max_traffic: token.max_traffic,
            expiration: token.expiration,
            active_client_count: active,
        }
    }

    fn grant(&self, session_id: u64, usage: AccessUsage, session: &FileSession) -> SessionGrant {
        SessionGrant {
            session_id,
            usage,
            ad_requirement: session.ad_requirement,
            max_client_count: session.max_client_count,
            expiration: session.expiration,
        }
    }
}

#[async_trait]
impl AccessManager for FileAccessManager {
    async fn session_add(&self, request: SessionRequest) -> Result<SessionGrant> {
        let _guard = self.locks.lock(&request.token_id).await;
        let token = self.load_token(&request.token_id).await?;

        // Proof of token possession
        let expected = encrypt_client_id(&token.secret, request.client_id.as_bytes());
        if expected != request.encrypted_client_id {
            return Err(Error::session(
                ErrorCode::UnauthorizedAccess,
                "client id proof mismatch",
            ));
        }

        let now = now_ms();
        let mut usage = self.load_usage(&request.token_id).await?;
        Self::check_limits(&token, &usage, now)?;
        usage.last_used_time = now;
        self.write_usage(&request.token_id, &usage).await?;

        let expiration = match token.ad_requirement {
            AdRequirement::Rewarded => {
                let grace = now + REWARDED_AD_GRACE_MS;
                Some(token.expiration.map_or(grace, |e| e.min(grace)))
            }
            _ => token.expiration,
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = FileSession {
            token_id: request.token_id.clone(),
            client_id: request.client_id,
            expiration,
            ad_requirement: token.ad_requirement,
            max_client_count: token.max_client_count,
        };

        let mut grant = self.grant(session_id, Self::access_usage(&token, &usage, 0), &session);
        self.sessions.lock().insert(session_id, session);
        let active = self.active_client_count(&request.token_id);
        grant.usage.active_client_count = active;
        debug!(
            "session {} added for token {} from {} ({} active clients)",
            session_id, request.token_id, request.client_address, active
        );
        Ok(grant)
    }

    async fn session_get(&self, session_id: u64) -> Result<SessionGrant> {
        let token_id = {
            let sessions = self.sessions.lock();
            let session = sessions
                .get(&session_id)
                .ok_or_else(|| Error::session(ErrorCode::SessionClosed, "unknown session"))?;
            session.token_id.clone()
        };

        let _guard = self.locks.lock(&token_id).await;
        let token = self.load_token(&token_id).await?;
        let usage = self.load_usage(&token_id).await?;
        Self::check_limits(&token, &usage, now_ms())?;

        let active = self.active_client_count(&token_id);
        let sessions = self.sessions.lock();
        let session = sessions
            .get(&session_id)
            .ok_or_else(|| Error::session(ErrorCode::SessionClosed, "unknown session"))?;
        Ok(self.grant(session_id, Self::access_usage(&token, &usage, active), session))
    }

    async fn session_add_usage(
        &self,
        session_id: u64,
        traffic: Traffic,
        ad_data: Option<String>,
    ) -> Result<AccessUsage> {
        let (token_id, ad_requirement) = {
            let sessions = self.sessions.lock();
            let session = sessions
                .get(&session_id)
                .ok_or_else(|| Error::session(ErrorCode::SessionClosed, "unknown session"))?;
            (session.token_id.clone(), session.ad_requirement)
        };

        let _guard = self.locks.lock(&token_id).await;
        let token = self.load_token(&token_id).await?;
        let now = now_ms();
        let mut usage = self.load_usage(&token_id).await?;
        usage.sent_bytes += traffic.sent;
        usage.received_bytes += traffic.received;
        usage.last_used_time = now;
        self.write_usage(&token_id, &usage).await?;

        if let Some(ad_data) = ad_data {
            if ad_data.is_empty() {
                return Err(Error::session(
                    ErrorCode::RewardedAdRejected,
                    "empty ad completion data",
                ));
            }
            if ad_requirement == AdRequirement::Rewarded {
                // The ad completed: lift the grace window to the token's
                // own expiration
                if let Some(session) = self.sessions.lock().get_mut(&session_id) {
                    session.expiration = token.expiration;
                }
                debug!("rewarded ad accepted for session {}", session_id);
            }
        }

        Self::check_limits(&token, &usage, now)?;
        let active = self.active_client_count(&token_id);
        Ok(Self::access_usage(&token, &usage, active))
    }

    async fn session_close(&self, session_id: u64, traffic: Traffic) -> Result<()> {
        // Meter the final traffic before forgetting the session
        if traffic != Traffic::default() {
            let _ = self.session_add_usage(session_id, traffic, None).await;
        }
        self.sessions.lock().remove(&session_id);
        debug!("session {} closed", session_id);
        Ok(())
    }
}
