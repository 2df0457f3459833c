//! Persistence seams and the pairing session store
//!
//! The flow is written against abstract repositories rather than a concrete
//! database: a transactional [`SessionRepository`], an append-mostly
//! [`TokenRegistry`] for issued device tokens, and the external
//! [`DeviceRegistry`] collaborator. In-memory implementations back tests and
//! non-production runtimes.
//!
//! [`PairingSessionStore`] layers the pairing state machine on top of the
//! session repository: code generation, nonce idempotency, and the
//! transactional `authorize` transition.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use pairlock_dpop::DpopJwk;

use super::errors::{GrantError, Result};
use super::session::{
    canonical_user_code, generate_device_code, generate_user_code, truncate_requester_ip,
    PairingSession, SessionStatus,
};

/// Merge-write patch for the non-transactional session fields
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    /// New minimum polling interval
    pub poll_interval: Option<u32>,
    /// Last `token` poll timestamp
    pub last_poll_at: Option<DateTime<Utc>>,
    /// `jti` of the registration token now current for the session
    pub registration_token_jti: Option<String>,
    /// Expiry of that registration token
    pub registration_token_expires_at: Option<DateTime<Utc>>,
}

/// A read-modify-write step executed atomically against one session
pub type SessionMutation = Box<dyn FnOnce(&mut PairingSession) -> Result<()> + Send>;

/// Transactional storage for pairing sessions
///
/// `mutate` must re-read the session inside whatever transaction mechanism
/// the backend provides and apply the closure to that fresh copy; a closure
/// error aborts the write. This is the primitive `authorize` relies on to
/// keep two concurrent approvals from racing.
#[async_trait]
pub trait SessionRepository: Send + Sync + std::fmt::Debug {
    /// Insert a new session; the device code must be unused
    async fn insert(&self, session: PairingSession) -> Result<()>;

    /// Fetch by device code
    async fn get(&self, device_code: &str) -> Result<Option<PairingSession>>;

    /// Fetch by canonical user code
    async fn find_by_user_code(&self, canonical: &str) -> Result<Option<PairingSession>>;

    /// Fetch a non-redeemed session carrying this idempotency nonce and
    /// key thumbprint
    async fn find_by_nonce(&self, nonce: &str, thumbprint: &str)
        -> Result<Option<PairingSession>>;

    /// Merge-write the patch fields
    async fn merge(&self, device_code: &str, patch: SessionPatch) -> Result<PairingSession>;

    /// Transactional read-modify-write; returns the post-mutation session
    async fn mutate(&self, device_code: &str, mutation: SessionMutation)
        -> Result<PairingSession>;
}

/// Persisted record of one issued device-access token
///
/// Created at issuance, mutated only by revocation, never deleted - the
/// registry doubles as an audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTokenRecord {
    /// Token identifier (primary key)
    pub jti: String,
    /// Device the token was issued to
    pub device_id: String,
    /// Account owning the device at issuance time
    pub acc_id: String,
    /// Issuance timestamp
    pub issued_at: DateTime<Utc>,
    /// Token expiry
    pub expires_at: DateTime<Utc>,
    /// Monotonic: flips false to true, never back
    pub revoked: bool,
    /// Scopes carried by the token
    pub scope: Vec<String>,
    /// Thumbprint of the key the token is bound to
    pub cnf_jkt: String,
}

/// Persistence for issued device-access tokens
#[async_trait]
pub trait TokenRegistry: Send + Sync + std::fmt::Debug {
    /// Record a newly issued token
    async fn insert(&self, record: DeviceTokenRecord) -> Result<()>;

    /// Fetch a record by token id
    async fn get(&self, jti: &str) -> Result<Option<DeviceTokenRecord>>;

    /// Mark every token of a device revoked; returns the affected `jti`s
    async fn revoke_all(&self, device_id: &str) -> Result<Vec<String>>;
}

/// Registered device lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceLifecycle {
    /// Device may request access tokens
    Active,
    /// Device has been revoked by its owner or an operator
    Revoked,
}

/// Input for registering a device identity
#[derive(Debug, Clone)]
pub struct NewDevice {
    /// Account the device belongs to
    pub account_id: String,
    /// Device model string
    pub model: String,
    /// Device firmware version
    pub version: String,
    /// Long-term public key as a JWK
    pub public_key_jwk: DpopJwk,
    /// Thumbprint of the long-term key
    pub thumbprint: String,
}

/// A registered device identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Stable device identifier
    pub device_id: String,
    /// Owning account
    pub account_id: String,
    /// Device model string
    pub model: String,
    /// Device firmware version
    pub version: String,
    /// Long-term public key as a JWK
    pub public_key_jwk: DpopJwk,
    /// Thumbprint of the long-term key; access-token proofs must be signed
    /// with this key
    pub thumbprint: String,
    /// Lifecycle state
    pub status: DeviceLifecycle,
    /// Whether the owning account is disabled
    pub owner_disabled: bool,
    /// Registration timestamp
    pub registered_at: DateTime<Utc>,
}

impl DeviceRecord {
    /// Whether the device may be issued access tokens
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.status == DeviceLifecycle::Active && !self.owner_disabled
    }
}

/// External device identity collaborator
///
/// The pairing flow only registers identities and reads back their status;
/// everything else about device management lives outside this crate.
#[async_trait]
pub trait DeviceRegistry: Send + Sync + std::fmt::Debug {
    /// Persist a new device identity and mint its id
    async fn register(&self, device: NewDevice) -> Result<DeviceRecord>;

    /// Fetch a device by id
    async fn get(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    /// Flip a device to the revoked state
    async fn revoke(&self, device_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// In-memory session repository for tests and non-production runtimes
#[derive(Debug, Default)]
pub struct MemorySessionRepository {
    sessions: RwLock<HashMap<String, PairingSession>>,
}

impl MemorySessionRepository {
    /// Create an empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn insert(&self, session: PairingSession) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.device_code) {
            return Err(GrantError::Storage("device code collision".to_string()));
        }
        sessions.insert(session.device_code.clone(), session);
        Ok(())
    }

    async fn get(&self, device_code: &str) -> Result<Option<PairingSession>> {
        Ok(self.sessions.read().await.get(device_code).cloned())
    }

    async fn find_by_user_code(&self, canonical: &str) -> Result<Option<PairingSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.user_code_canonical == canonical)
            .cloned())
    }

    async fn find_by_nonce(
        &self,
        nonce: &str,
        thumbprint: &str,
    ) -> Result<Option<PairingSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| {
                s.nonce.as_deref() == Some(nonce)
                    && s.pub_ke_thumbprint == thumbprint
                    && s.status != SessionStatus::Redeemed
            })
            .cloned())
    }

    async fn merge(&self, device_code: &str, patch: SessionPatch) -> Result<PairingSession> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(device_code)
            .ok_or(GrantError::NotFound)?;
        if let Some(interval) = patch.poll_interval {
            session.poll_interval = interval;
        }
        if let Some(at) = patch.last_poll_at {
            session.last_poll_at = Some(at);
        }
        if let Some(jti) = patch.registration_token_jti {
            session.registration_token_jti = Some(jti);
        }
        if let Some(exp) = patch.registration_token_expires_at {
            session.registration_token_expires_at = Some(exp);
        }
        Ok(session.clone())
    }

    async fn mutate(
        &self,
        device_code: &str,
        mutation: SessionMutation,
    ) -> Result<PairingSession> {
        // The write lock spans read and write, which is exactly the
        // transactional contract a database backend provides
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(device_code)
            .ok_or(GrantError::NotFound)?;
        let mut candidate = session.clone();
        mutation(&mut candidate)?;
        *session = candidate.clone();
        Ok(candidate)
    }
}

/// In-memory token registry for tests and non-production runtimes
#[derive(Debug, Default)]
pub struct MemoryTokenRegistry {
    records: RwLock<HashMap<String, DeviceTokenRecord>>,
}

impl MemoryTokenRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenRegistry for MemoryTokenRegistry {
    async fn insert(&self, record: DeviceTokenRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.jti.clone(), record);
        Ok(())
    }

    async fn get(&self, jti: &str) -> Result<Option<DeviceTokenRecord>> {
        Ok(self.records.read().await.get(jti).cloned())
    }

    async fn revoke_all(&self, device_id: &str) -> Result<Vec<String>> {
        let mut records = self.records.write().await;
        let mut affected = Vec::new();
        for record in records.values_mut() {
            if record.device_id == device_id && !record.revoked {
                record.revoked = true;
                affected.push(record.jti.clone());
            }
        }
        Ok(affected)
    }
}

/// In-memory device registry standing in for the external collaborator
#[derive(Debug, Default)]
pub struct MemoryDeviceRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl MemoryDeviceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: disable or re-enable a device's owning account
    pub async fn set_owner_disabled(&self, device_id: &str, disabled: bool) {
        if let Some(device) = self.devices.write().await.get_mut(device_id) {
            device.owner_disabled = disabled;
        }
    }
}

#[async_trait]
impl DeviceRegistry for MemoryDeviceRegistry {
    async fn register(&self, device: NewDevice) -> Result<DeviceRecord> {
        let record = DeviceRecord {
            device_id: format!("dev_{}", Uuid::new_v4().simple()),
            account_id: device.account_id,
            model: device.model,
            version: device.version,
            public_key_jwk: device.public_key_jwk,
            thumbprint: device.thumbprint,
            status: DeviceLifecycle::Active,
            owner_disabled: false,
            registered_at: Utc::now(),
        };
        self.devices
            .write()
            .await
            .insert(record.device_id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn revoke(&self, device_id: &str) -> Result<()> {
        let mut devices = self.devices.write().await;
        let device = devices.get_mut(device_id).ok_or(GrantError::NotFound)?;
        device.status = DeviceLifecycle::Revoked;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pairing session store
// ---------------------------------------------------------------------------

/// Inputs for opening a pairing session
#[derive(Debug, Clone)]
pub struct StartSessionRequest {
    /// Device's ephemeral public key, base64url-encoded raw 32 bytes
    pub pub_ke: String,
    /// Device model string
    pub model: String,
    /// Device firmware version
    pub version: String,
    /// Optional idempotency nonce for retry-safe starts
    pub nonce: Option<String>,
    /// Device-requested polling interval, clamped to at least the default
    pub poll_interval: Option<u32>,
    /// Requester address; truncated before storage
    pub requester_ip: Option<IpAddr>,
    /// Requester autonomous system number
    pub requester_asn: Option<u32>,
}

/// State machine over pairing sessions
#[derive(Debug, Clone)]
pub struct PairingSessionStore {
    repo: Arc<dyn SessionRepository>,
    session_ttl: Duration,
    default_poll_interval: u32,
}

impl PairingSessionStore {
    /// Build a store over a session repository
    #[must_use]
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        session_ttl: Duration,
        default_poll_interval: u32,
    ) -> Self {
        Self {
            repo,
            session_ttl,
            default_poll_interval,
        }
    }

    /// Open a pairing session for a device-held key
    ///
    /// Retry-safe: a resubmitted `start` carrying the same nonce and the
    /// same key returns the existing unexpired session unchanged instead of
    /// minting a second device code.
    ///
    /// # Errors
    /// [`GrantError::InvalidRequest`] if the submitted key is not exactly
    /// 32 base64url-decoded bytes.
    pub async fn start(&self, request: StartSessionRequest) -> Result<PairingSession> {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

        let raw = URL_SAFE_NO_PAD
            .decode(&request.pub_ke)
            .map_err(|_| GrantError::InvalidRequest("pub_ke is not base64url".to_string()))?;
        let jwk = DpopJwk::from_ed25519_bytes(&raw).map_err(|_| {
            GrantError::InvalidRequest(format!(
                "pub_ke must decode to exactly 32 bytes, got {}",
                raw.len()
            ))
        })?;
        let thumbprint = jwk
            .thumbprint()
            .map_err(|e| GrantError::Storage(format!("thumbprint computation failed: {e}")))?;

        let now = Utc::now();

        // Idempotent retry: same nonce, same key, still-live session
        if let Some(nonce) = &request.nonce {
            if let Some(existing) = self.repo.find_by_nonce(nonce, &thumbprint).await? {
                if !existing.is_expired(now) {
                    debug!(device_code = %existing.device_code, "start deduplicated by nonce");
                    return Ok(existing);
                }
            }
        }

        let poll_interval = request
            .poll_interval
            .unwrap_or(self.default_poll_interval)
            .max(self.default_poll_interval);

        let session = PairingSession {
            device_code: generate_device_code(),
            user_code: generate_user_code(),
            user_code_canonical: String::new(),
            pub_ke_jwk: jwk,
            pub_ke_thumbprint: thumbprint,
            model: request.model,
            version: request.version,
            nonce: request.nonce,
            requester_ip: request.requester_ip.map(truncate_requester_ip),
            requester_asn: request.requester_asn,
            status: SessionStatus::Pending,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(self.session_ttl).unwrap_or_default(),
            poll_interval,
            last_poll_at: None,
            acc_id: None,
            authorized_at: None,
            authorized_by: None,
            registration_token_jti: None,
            registration_token_expires_at: None,
            device_id: None,
        };
        let session = PairingSession {
            user_code_canonical: canonical_user_code(&session.user_code),
            ..session
        };

        self.repo.insert(session.clone()).await?;
        debug!(device_code = %session.device_code, user_code = %session.user_code, "pairing session created");
        Ok(session)
    }

    /// Fetch by device code
    ///
    /// # Errors
    /// [`GrantError::NotFound`] for an unknown code.
    pub async fn find_by_device_code(&self, device_code: &str) -> Result<PairingSession> {
        self.repo
            .get(device_code)
            .await?
            .ok_or(GrantError::NotFound)
    }

    /// Fetch by user code (any entry form)
    ///
    /// # Errors
    /// [`GrantError::NotFound`] for an unknown code.
    pub async fn find_by_user_code(&self, user_code: &str) -> Result<PairingSession> {
        self.repo
            .find_by_user_code(&canonical_user_code(user_code))
            .await?
            .ok_or(GrantError::NotFound)
    }

    /// Approve a session on behalf of a human principal
    ///
    /// Runs as a transactional read-modify-write: the session state is
    /// re-read and re-validated inside the transaction so two concurrent
    /// approvals (double click, retried request) converge on one
    /// consistent `authorized` record.
    ///
    /// # Errors
    /// [`GrantError::Gone`] once the session has expired (the expiry is
    /// persisted as part of the same transaction), [`GrantError::Conflict`]
    /// for a redeemed session or one authorized by a different account.
    pub async fn authorize(&self, user_code: &str, account_id: &str) -> Result<PairingSession> {
        let session = self.find_by_user_code(user_code).await?;
        let account = account_id.to_string();
        let now = Utc::now();

        let updated = self
            .repo
            .mutate(
                &session.device_code,
                Box::new(move |s| {
                    if s.status == SessionStatus::Redeemed {
                        return Err(GrantError::Conflict);
                    }
                    if s.status == SessionStatus::Expired {
                        return Err(GrantError::Gone);
                    }
                    if s.is_expired(now) {
                        // Lazy expiry: persist the terminal state, then the
                        // caller reports Gone
                        s.status = SessionStatus::Expired;
                        return Ok(());
                    }
                    match s.status {
                        SessionStatus::Pending => {
                            s.status = SessionStatus::Authorized;
                            s.acc_id = Some(account.clone());
                            s.authorized_at = Some(now);
                            s.authorized_by = Some(account.clone());
                            Ok(())
                        }
                        // Idempotent re-authorize by the same account
                        SessionStatus::Authorized if s.acc_id.as_deref() == Some(&account) => {
                            Ok(())
                        }
                        _ => Err(GrantError::Conflict),
                    }
                }),
            )
            .await?;

        if updated.status == SessionStatus::Expired {
            return Err(GrantError::Gone);
        }
        debug!(device_code = %updated.device_code, account = %account_id, "session authorized");
        Ok(updated)
    }

    /// Merge-write polling metadata
    ///
    /// # Errors
    /// [`GrantError::NotFound`] for an unknown code.
    pub async fn update_poll_metadata(
        &self,
        device_code: &str,
        last_poll_at: DateTime<Utc>,
        poll_interval: u32,
    ) -> Result<PairingSession> {
        self.repo
            .merge(
                device_code,
                SessionPatch {
                    poll_interval: Some(poll_interval),
                    last_poll_at: Some(last_poll_at),
                    ..SessionPatch::default()
                },
            )
            .await
    }

    /// Record the registration token now current for the session,
    /// superseding any earlier one
    ///
    /// # Errors
    /// [`GrantError::NotFound`] for an unknown code.
    pub async fn record_registration_token(
        &self,
        device_code: &str,
        jti: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<PairingSession> {
        self.repo
            .merge(
                device_code,
                SessionPatch {
                    registration_token_jti: Some(jti.to_string()),
                    registration_token_expires_at: Some(expires_at),
                    ..SessionPatch::default()
                },
            )
            .await
    }

    /// Terminal transition: record the registered device and close the
    /// session
    ///
    /// # Errors
    /// [`GrantError::Conflict`] unless the session is currently
    /// `authorized`.
    pub async fn mark_redeemed(
        &self,
        device_code: &str,
        device_id: &str,
    ) -> Result<PairingSession> {
        let device_id = device_id.to_string();
        self.repo
            .mutate(
                device_code,
                Box::new(move |s| {
                    if s.status != SessionStatus::Authorized {
                        return Err(GrantError::Conflict);
                    }
                    s.status = SessionStatus::Redeemed;
                    s.device_id = Some(device_id);
                    Ok(())
                }),
            )
            .await
    }

    /// Lazily persist the expired state for a session past its TTL
    ///
    /// # Errors
    /// [`GrantError::NotFound`] for an unknown code.
    pub async fn mark_expired(&self, device_code: &str) -> Result<PairingSession> {
        self.repo
            .mutate(
                device_code,
                Box::new(|s| {
                    if !s.status.is_terminal() {
                        s.status = SessionStatus::Expired;
                    }
                    Ok(())
                }),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairlock_dpop::test_utils::TestKeyPair;
    use pretty_assertions::assert_eq;

    fn store() -> PairingSessionStore {
        PairingSessionStore::new(
            Arc::new(MemorySessionRepository::new()),
            Duration::from_secs(900),
            5,
        )
    }

    fn start_request(key: &TestKeyPair, nonce: Option<&str>) -> StartSessionRequest {
        StartSessionRequest {
            pub_ke: key.public_key_b64(),
            model: "sensor-1".to_string(),
            version: "1.0".to_string(),
            nonce: nonce.map(str::to_string),
            poll_interval: None,
            requester_ip: Some("203.0.113.77".parse().unwrap()),
            requester_asn: Some(64496),
        }
    }

    #[tokio::test]
    async fn start_creates_pending_session_with_fixed_ttl() {
        let store = store();
        let key = TestKeyPair::generate();
        let session = store.start(start_request(&key, None)).await.unwrap();

        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(
            session.expires_at - session.created_at,
            chrono::Duration::seconds(900)
        );
        assert_eq!(session.pub_ke_thumbprint, key.thumbprint());
        assert_eq!(session.requester_ip.as_deref(), Some("203.0.113.0"));
    }

    #[tokio::test]
    async fn start_rejects_short_keys() {
        let store = store();
        let mut request = start_request(&TestKeyPair::generate(), None);
        request.pub_ke = "AAAA".to_string();

        let err = store.start(request).await.unwrap_err();
        assert!(matches!(err, GrantError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn start_is_idempotent_per_nonce_and_key() {
        let store = store();
        let key = TestKeyPair::generate();

        let first = store.start(start_request(&key, Some("n-1"))).await.unwrap();
        let second = store.start(start_request(&key, Some("n-1"))).await.unwrap();
        assert_eq!(first.device_code, second.device_code);
        assert_eq!(first.user_code, second.user_code);

        // Same nonce but a different key is a different attempt
        let other_key = TestKeyPair::generate();
        let third = store
            .start(start_request(&other_key, Some("n-1")))
            .await
            .unwrap();
        assert_ne!(first.device_code, third.device_code);
    }

    #[tokio::test]
    async fn authorize_transitions_and_is_idempotent_for_same_account() {
        let store = store();
        let key = TestKeyPair::generate();
        let session = store.start(start_request(&key, None)).await.unwrap();

        let authorized = store.authorize(&session.user_code, "acc-1").await.unwrap();
        assert_eq!(authorized.status, SessionStatus::Authorized);
        assert_eq!(authorized.acc_id.as_deref(), Some("acc-1"));

        // Same account again converges without error
        let again = store.authorize(&session.user_code, "acc-1").await.unwrap();
        assert_eq!(again.acc_id.as_deref(), Some("acc-1"));

        // A different account conflicts
        let err = store
            .authorize(&session.user_code, "acc-2")
            .await
            .unwrap_err();
        assert_eq!(err, GrantError::Conflict);
    }

    #[tokio::test]
    async fn authorize_accepts_sloppy_user_code_entry() {
        let store = store();
        let key = TestKeyPair::generate();
        let session = store.start(start_request(&key, None)).await.unwrap();

        let sloppy = session.user_code.to_lowercase().replace('-', " ");
        assert!(store.authorize(&sloppy, "acc-1").await.is_ok());
    }

    #[tokio::test]
    async fn authorize_on_redeemed_session_conflicts_without_mutation() {
        let store = store();
        let key = TestKeyPair::generate();
        let session = store.start(start_request(&key, None)).await.unwrap();
        store.authorize(&session.user_code, "acc-1").await.unwrap();
        store
            .mark_redeemed(&session.device_code, "dev-1")
            .await
            .unwrap();

        let err = store
            .authorize(&session.user_code, "acc-1")
            .await
            .unwrap_err();
        assert_eq!(err, GrantError::Conflict);

        let unchanged = store.find_by_device_code(&session.device_code).await.unwrap();
        assert_eq!(unchanged.status, SessionStatus::Redeemed);
        assert_eq!(unchanged.device_id.as_deref(), Some("dev-1"));
    }

    #[tokio::test]
    async fn authorize_expired_session_persists_expiry_and_reports_gone() {
        let store = PairingSessionStore::new(
            Arc::new(MemorySessionRepository::new()),
            Duration::ZERO,
            5,
        );
        let key = TestKeyPair::generate();
        let session = store.start(start_request(&key, None)).await.unwrap();

        let err = store
            .authorize(&session.user_code, "acc-1")
            .await
            .unwrap_err();
        assert_eq!(err, GrantError::Gone);

        let stored = store.find_by_device_code(&session.device_code).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Expired);
    }

    #[tokio::test]
    async fn concurrent_authorize_by_same_account_converges() {
        let store = store();
        let key = TestKeyPair::generate();
        let session = store.start(start_request(&key, None)).await.unwrap();

        let store_a = store.clone();
        let store_b = store.clone();
        let code_a = session.user_code.clone();
        let code_b = session.user_code.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { store_a.authorize(&code_a, "acc-1").await }),
            tokio::spawn(async move { store_b.authorize(&code_b, "acc-1").await }),
        );
        assert!(a.unwrap().is_ok());
        assert!(b.unwrap().is_ok());

        let stored = store.find_by_device_code(&session.device_code).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Authorized);
        assert_eq!(stored.acc_id.as_deref(), Some("acc-1"));
    }

    #[tokio::test]
    async fn poll_metadata_and_registration_token_merge_writes_persist() {
        let store = store();
        let key = TestKeyPair::generate();
        let session = store.start(start_request(&key, None)).await.unwrap();

        let now = Utc::now();
        store
            .update_poll_metadata(&session.device_code, now, 10)
            .await
            .unwrap();
        let exp = now + chrono::Duration::seconds(60);
        let updated = store
            .record_registration_token(&session.device_code, "jti-1", exp)
            .await
            .unwrap();

        assert_eq!(updated.poll_interval, 10);
        assert_eq!(updated.last_poll_at, Some(now));
        assert_eq!(updated.registration_token_jti.as_deref(), Some("jti-1"));
        assert_eq!(updated.registration_token_expires_at, Some(exp));
        // Merge writes never touch lifecycle state
        assert_eq!(updated.status, SessionStatus::Pending);
    }

    #[tokio::test]
    async fn mark_redeemed_requires_authorized_state() {
        let store = store();
        let key = TestKeyPair::generate();
        let session = store.start(start_request(&key, None)).await.unwrap();

        let err = store
            .mark_redeemed(&session.device_code, "dev-1")
            .await
            .unwrap_err();
        assert_eq!(err, GrantError::Conflict);
    }
}
