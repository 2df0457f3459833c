//! Pairing flow orchestration
//!
//! [`PairingService`] wires the session store, proof verifier, token
//! issuer, revocation cache, and device registry into the five protocol
//! operations a transport binding exposes:
//!
//! 1. `start` - device opens a session and receives its codes
//! 2. `authorize` - a human approves the session by user code
//! 3. `token` - device polls, eventually exchanging its device code for a
//!    registration token
//! 4. `register` - device redeems the registration token for an identity
//! 5. `access_token` / `verify_data_access` - steady-state credentials for
//!    the data plane
//!
//! Every proof-carrying operation collapses verification failures into
//! [`GrantError::Unauthorized`] before they leave this module.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use pairlock_dpop::{access_token_hash, canonical_htu, DpopJwk, DpopVerifier, VerifyOptions};

use super::config::GrantConfig;
use super::errors::{GrantError, Result};
use super::keys::SigningKeyProvider;
use super::revocation::TokenRevocationCache;
use super::session::SessionStatus;
use super::store::{
    DeviceRegistry, NewDevice, PairingSessionStore, SessionRepository, StartSessionRequest,
    TokenRegistry,
};
use super::tokens::{DeviceAccessClaims, TokenIssuer};

/// Device-supplied inputs to `start`
#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    /// Ephemeral public key, base64url-encoded raw 32 bytes
    pub pub_ke: String,
    /// Device model string
    pub model: String,
    /// Device firmware version
    pub version: String,
    /// Optional idempotency nonce for retry-safe starts
    #[serde(default)]
    pub nonce: Option<String>,
    /// Requested polling interval in seconds
    #[serde(default)]
    pub poll_interval: Option<u32>,
}

/// Transport-level request metadata recorded for abuse analysis
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientInfo {
    /// Requester address; truncated before storage
    pub ip: Option<IpAddr>,
    /// Requester autonomous system number
    pub asn: Option<u32>,
}

/// Response to `start`
#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    /// High-entropy code the device polls with
    pub device_code: String,
    /// Code the human types on the verification page
    pub user_code: String,
    /// Verification page URL
    pub verification_uri: String,
    /// Verification page URL with the user code pre-filled
    pub verification_uri_complete: String,
    /// Minimum seconds between polls
    pub poll_interval: u32,
    /// Seconds until the session expires
    pub expires_in: u64,
}

/// What the approval page shows before the human decides
#[derive(Debug, Clone, Serialize)]
pub struct SessionPreview {
    /// Device model string
    pub model: String,
    /// Device firmware version
    pub version: String,
    /// Current lifecycle state
    pub status: SessionStatus,
    /// Seconds until the session expires
    pub expires_in: u64,
}

/// Response to a successful `token` poll
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    /// Single-use registration token
    pub registration_token: String,
    /// Seconds until the registration token expires
    pub expires_in: u64,
}

/// Device-supplied inputs to `register`
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    /// Long-term public key the identity will be bound to
    #[serde(default)]
    pub jwk: Option<DpopJwk>,
    /// Certificate signing request; explicitly unsupported
    #[serde(default)]
    pub csr: Option<String>,
}

/// Response to `register`
#[derive(Debug, Clone, Serialize)]
pub struct RegisterResponse {
    /// Newly minted device identity
    pub device_id: String,
    /// Key the identity is bound to, echoed back
    pub jwk: DpopJwk,
    /// Registration timestamp
    pub issued_at: chrono::DateTime<Utc>,
}

/// Response to `access_token`
#[derive(Debug, Clone, Serialize)]
pub struct AccessTokenResponse {
    /// Always `DPoP`: the token is useless without a matching proof
    pub token_type: &'static str,
    /// Compact key-bound access token
    pub access_token: String,
    /// Seconds until expiry
    pub expires_in: u64,
    /// Device the token was issued to
    pub device_id: String,
}

/// The pairing flow, wired over pluggable persistence
#[derive(Debug)]
pub struct PairingService {
    config: GrantConfig,
    verifier: DpopVerifier,
    sessions: PairingSessionStore,
    issuer: TokenIssuer,
    revocations: TokenRevocationCache,
    devices: Arc<dyn DeviceRegistry>,
}

impl PairingService {
    /// Wire the flow over its persistence seams
    ///
    /// Resolves the process signing key eagerly: a misconfigured key aborts
    /// construction rather than failing the first issuance.
    ///
    /// # Errors
    /// [`GrantError::Fatal`] if signing key resolution fails.
    pub fn new(
        config: GrantConfig,
        session_repo: Arc<dyn SessionRepository>,
        token_registry: Arc<dyn TokenRegistry>,
        devices: Arc<dyn DeviceRegistry>,
    ) -> Result<Self> {
        let keys = Arc::new(SigningKeyProvider::bootstrap(&config.signing_key)?);
        let verifier = DpopVerifier::new(config.proof_max_age, config.proof_clock_skew);
        let sessions = PairingSessionStore::new(
            session_repo,
            config.session_ttl,
            config.default_poll_interval,
        );
        let issuer = TokenIssuer::new(
            keys,
            token_registry.clone(),
            config.issuer.clone(),
            config.registration_token_ttl,
            config.access_token_ttl,
        );
        let revocations = TokenRevocationCache::new(token_registry, config.revocation_cache_ttl);

        Ok(Self {
            config,
            verifier,
            sessions,
            issuer,
            revocations,
            devices,
        })
    }

    /// Open a pairing session
    ///
    /// # Errors
    /// [`GrantError::InvalidRequest`] for a malformed key.
    pub async fn start(&self, request: StartRequest, client: ClientInfo) -> Result<StartResponse> {
        let session = self
            .sessions
            .start(StartSessionRequest {
                pub_ke: request.pub_ke,
                model: request.model,
                version: request.version,
                nonce: request.nonce,
                poll_interval: request.poll_interval,
                requester_ip: client.ip,
                requester_asn: client.asn,
            })
            .await?;

        let expires_in = (session.expires_at - Utc::now()).num_seconds().max(0) as u64;
        Ok(StartResponse {
            verification_uri_complete: format!(
                "{}?code={}",
                self.config.verification_uri, session.user_code
            ),
            verification_uri: self.config.verification_uri.clone(),
            device_code: session.device_code,
            user_code: session.user_code,
            poll_interval: session.poll_interval,
            expires_in,
        })
    }

    /// Look up what the approval page should display for a user code
    ///
    /// # Errors
    /// [`GrantError::NotFound`] for an unknown code, [`GrantError::Gone`]
    /// once expired.
    pub async fn preview(&self, user_code: &str) -> Result<SessionPreview> {
        let session = self.sessions.find_by_user_code(user_code).await?;
        let now = Utc::now();
        if session.status == SessionStatus::Expired || session.is_expired(now) {
            return Err(GrantError::Gone);
        }
        Ok(SessionPreview {
            model: session.model,
            version: session.version,
            status: session.status,
            expires_in: (session.expires_at - now).num_seconds().max(0) as u64,
        })
    }

    /// Approve a session on behalf of a human principal
    ///
    /// Idempotent for the same account; see
    /// [`PairingSessionStore::authorize`] for the state rules.
    ///
    /// # Errors
    /// [`GrantError::NotFound`], [`GrantError::Gone`], or
    /// [`GrantError::Conflict`] per the session state.
    pub async fn authorize(&self, user_code: &str, account_id: &str) -> Result<()> {
        self.sessions.authorize(user_code, account_id).await?;
        Ok(())
    }

    /// Device poll: exchange an authorized device code for a registration
    /// token
    ///
    /// The rate limit is evaluated before session state, so an abusive
    /// poller learns nothing about the session from a `slow_down`. Each
    /// successful state answer (including `authorization_pending`) records
    /// the poll; each early poll grows the interval by the configured
    /// increment.
    ///
    /// # Errors
    /// [`GrantError::AuthorizationPending`] and [`GrantError::SlowDown`]
    /// are the expected polling responses; [`GrantError::Gone`] after
    /// expiry, [`GrantError::Conflict`] once redeemed,
    /// [`GrantError::Unauthorized`] for a bad proof.
    pub async fn token(
        &self,
        device_code: &str,
        proof: &str,
        method: &str,
        url: &str,
    ) -> Result<TokenResponse> {
        let session = self.sessions.find_by_device_code(device_code).await?;
        let now = Utc::now();

        if session.status == SessionStatus::Expired {
            return Err(GrantError::Gone);
        }
        if session.is_expired(now) && !session.status.is_terminal() {
            self.sessions.mark_expired(device_code).await?;
            return Err(GrantError::Gone);
        }

        // Rate limit first: state is only revealed to polite pollers
        if let Some(last) = session.last_poll_at {
            let earliest = last + chrono::Duration::seconds(i64::from(session.poll_interval));
            if now < earliest {
                let interval = session.poll_interval + self.config.slow_down_increment;
                self.sessions
                    .update_poll_metadata(device_code, now, interval)
                    .await?;
                debug!(device_code, interval, "early poll, interval raised");
                return Err(GrantError::SlowDown { interval });
            }
        }
        self.sessions
            .update_poll_metadata(device_code, now, session.poll_interval)
            .await?;

        match session.status {
            SessionStatus::Pending => Err(GrantError::AuthorizationPending),
            SessionStatus::Redeemed => Err(GrantError::Conflict),
            SessionStatus::Expired => Err(GrantError::Gone),
            SessionStatus::Authorized => {
                let htu = canonical_htu(url)?;
                self.verifier.verify(
                    proof,
                    &VerifyOptions::new(method, &htu)
                        .with_thumbprint(&session.pub_ke_thumbprint),
                )?;

                let account = session.acc_id.as_deref().ok_or_else(|| {
                    GrantError::Storage("authorized session missing account".to_string())
                })?;
                let issued = self.issuer.issue_registration_token(
                    device_code,
                    account,
                    &session.pub_ke_thumbprint,
                )?;

                // Reissuing supersedes any earlier registration token
                let expires_at = now + chrono::Duration::seconds(issued.expires_in as i64);
                self.sessions
                    .record_registration_token(device_code, &issued.jti, expires_at)
                    .await?;

                info!(device_code, "registration token issued");
                Ok(TokenResponse {
                    registration_token: issued.token,
                    expires_in: issued.expires_in,
                })
            }
        }
    }

    /// Redeem a registration token for a device identity
    ///
    /// The accompanying proof must be signed with the *new long-term key*
    /// being registered, proving possession before the identity is bound
    /// to it. The registration token itself is bound to the session's
    /// ephemeral key via its `cnf` claim and to the session via its `jti`;
    /// a superseded token fails the `jti` cross-check.
    ///
    /// # Errors
    /// [`GrantError::UnsupportedGrantType`] for CSR enrollment,
    /// [`GrantError::InvalidRequest`] for a missing or malformed key,
    /// [`GrantError::Unauthorized`] for token or proof failures,
    /// [`GrantError::Gone`] / [`GrantError::Conflict`] per session state.
    pub async fn register(
        &self,
        registration_token: &str,
        proof: &str,
        method: &str,
        url: &str,
        request: RegisterRequest,
    ) -> Result<RegisterResponse> {
        if request.csr.is_some() {
            return Err(GrantError::UnsupportedGrantType);
        }
        let jwk = request
            .jwk
            .ok_or_else(|| GrantError::InvalidRequest("jwk is required".to_string()))?;
        jwk.ed25519_bytes()
            .map_err(|_| GrantError::InvalidRequest("jwk is not a valid Ed25519 key".to_string()))?;

        let claims = self.issuer.verify_registration_token(registration_token)?;
        let session = self.sessions.find_by_device_code(&claims.device_code).await?;
        let now = Utc::now();

        if session.status == SessionStatus::Expired || session.is_expired(now) {
            return Err(GrantError::Gone);
        }
        match session.status {
            SessionStatus::Authorized => {}
            SessionStatus::Redeemed => return Err(GrantError::Conflict),
            _ => return Err(GrantError::Conflict),
        }

        // Only the most recently issued registration token redeems
        if session.registration_token_jti.as_deref() != Some(claims.jti.as_str()) {
            debug!(device_code = %claims.device_code, "superseded registration token presented");
            return Err(GrantError::Unauthorized);
        }
        if let Some(token_exp) = session.registration_token_expires_at {
            if now >= token_exp {
                debug!(device_code = %claims.device_code, "registration token past session-recorded expiry");
                return Err(GrantError::Unauthorized);
            }
        }

        // Proof of possession of the key being registered
        let thumbprint = jwk
            .thumbprint()
            .map_err(|_| GrantError::InvalidRequest("jwk is not a valid Ed25519 key".to_string()))?;
        let htu = canonical_htu(url)?;
        self.verifier.verify(
            proof,
            &VerifyOptions::new(method, &htu).with_thumbprint(&thumbprint),
        )?;

        let device = self
            .devices
            .register(NewDevice {
                account_id: claims.acc_id,
                model: session.model,
                version: session.version,
                public_key_jwk: jwk,
                thumbprint,
            })
            .await?;
        self.sessions
            .mark_redeemed(&claims.device_code, &device.device_id)
            .await?;

        info!(device_id = %device.device_id, "device registered");
        Ok(RegisterResponse {
            device_id: device.device_id,
            jwk: device.public_key_jwk,
            issued_at: device.registered_at,
        })
    }

    /// Issue a device-access token to a registered device
    ///
    /// # Errors
    /// [`GrantError::NotFound`] for an unknown device,
    /// [`GrantError::Forbidden`] for a revoked device or disabled owner,
    /// [`GrantError::Unauthorized`] for a bad proof.
    pub async fn access_token(
        &self,
        device_id: &str,
        proof: &str,
        method: &str,
        url: &str,
        scope: Option<Vec<String>>,
    ) -> Result<AccessTokenResponse> {
        let device = self
            .devices
            .get(device_id)
            .await?
            .ok_or(GrantError::NotFound)?;
        if !device.is_eligible() {
            return Err(GrantError::Forbidden);
        }

        let htu = canonical_htu(url)?;
        self.verifier.verify(
            proof,
            &VerifyOptions::new(method, &htu).with_thumbprint(&device.thumbprint),
        )?;

        let issued = self
            .issuer
            .issue_device_access_token(device_id, &device.account_id, &device.thumbprint, scope)
            .await?;
        Ok(AccessTokenResponse {
            token_type: "DPoP",
            access_token: issued.token,
            expires_in: issued.expires_in,
            device_id: device.device_id,
        })
    }

    /// Authenticate a data-plane request: access token plus fresh proof
    ///
    /// The proof must be signed with the token's confirmed key and must
    /// commit to this exact token via its `ath` hash, so neither a stolen
    /// token nor a captured proof is usable alone.
    ///
    /// # Errors
    /// [`GrantError::Unauthorized`] for any token, revocation, or proof
    /// failure.
    pub async fn verify_data_access(
        &self,
        access_token: &str,
        proof: &str,
        method: &str,
        url: &str,
    ) -> Result<DeviceAccessClaims> {
        let claims = self.issuer.verify_device_access_token(access_token)?;

        if self.revocations.is_revoked(&claims.jti).await? {
            debug!(device_id = %claims.device_id, "revoked token presented");
            return Err(GrantError::Unauthorized);
        }

        let htu = canonical_htu(url)?;
        let hash = access_token_hash(access_token);
        self.verifier.verify(
            proof,
            &VerifyOptions::new(method, &htu)
                .with_thumbprint(&claims.cnf_jkt)
                .with_token_hash(&hash),
        )?;

        Ok(claims)
    }

    /// Revoke every outstanding token of a device, effective immediately
    /// for requests verified through this service
    ///
    /// # Errors
    /// Propagates registry failures.
    pub async fn revoke_device_tokens(&self, device_id: &str) -> Result<Vec<String>> {
        self.revocations.revoke_all(device_id).await
    }

    /// Session store handle, for administrative tooling
    #[must_use]
    pub fn sessions(&self) -> &PairingSessionStore {
        &self.sessions
    }
}
