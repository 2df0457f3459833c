//! Grant flow configuration types

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

/// Top-level configuration for the pairing flow
///
/// Every duration has a conservative default matching the protocol's
/// documented TTLs; deployments normally only set `issuer`,
/// `verification_uri`, and the signing key.
#[derive(Debug, Clone, Deserialize)]
pub struct GrantConfig {
    /// Token issuer identifier (`iss` claim on every minted token)
    pub issuer: String,

    /// Page where a human enters the user code
    pub verification_uri: String,

    /// Pairing session lifetime from creation (default: 15 minutes)
    #[serde(default = "default_session_ttl")]
    pub session_ttl: Duration,

    /// Registration token lifetime (default: 60 seconds)
    #[serde(default = "default_registration_token_ttl")]
    pub registration_token_ttl: Duration,

    /// Device-access token lifetime (default: 600 seconds)
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl: Duration,

    /// Minimum seconds between `token` polls for fresh sessions (default: 5)
    #[serde(default = "default_poll_interval")]
    pub default_poll_interval: u32,

    /// Seconds added to a session's poll interval on each early poll
    /// (default: 5)
    #[serde(default = "default_slow_down_increment")]
    pub slow_down_increment: u32,

    /// Maximum accepted proof age (default: 120 seconds)
    #[serde(default = "default_proof_max_age")]
    pub proof_max_age: Duration,

    /// Clock skew tolerance for proof freshness (default: 5 seconds)
    #[serde(default = "default_proof_clock_skew")]
    pub proof_clock_skew: Duration,

    /// Revocation cache entry lifetime (default: 60 seconds)
    #[serde(default = "default_revocation_cache_ttl")]
    pub revocation_cache_ttl: Duration,

    /// Process signing key resolution
    #[serde(default)]
    pub signing_key: SigningKeyConfig,
}

impl GrantConfig {
    /// Minimal configuration for an issuer and verification page
    #[must_use]
    pub fn new(issuer: impl Into<String>, verification_uri: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            verification_uri: verification_uri.into(),
            session_ttl: default_session_ttl(),
            registration_token_ttl: default_registration_token_ttl(),
            access_token_ttl: default_access_token_ttl(),
            default_poll_interval: default_poll_interval(),
            slow_down_increment: default_slow_down_increment(),
            proof_max_age: default_proof_max_age(),
            proof_clock_skew: default_proof_clock_skew(),
            revocation_cache_ttl: default_revocation_cache_ttl(),
            signing_key: SigningKeyConfig::default(),
        }
    }
}

/// Signing key resolution order: configured PEM, then (non-production only)
/// an ephemeral key persisted to a local file, else fail closed
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SigningKeyConfig {
    /// PKCS#8 private key PEM from the deployment's secret store; used
    /// verbatim when present
    #[serde(default)]
    pub private_key_pem: Option<SecretString>,

    /// Permit ephemeral key generation; must stay false in production so a
    /// missing key aborts instead of minting tokens nobody can account for
    #[serde(default)]
    pub allow_ephemeral: bool,

    /// Where to persist a generated ephemeral key for reuse across
    /// restarts (best-effort)
    #[serde(default)]
    pub ephemeral_key_path: Option<PathBuf>,
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_registration_token_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_access_token_ttl() -> Duration {
    Duration::from_secs(600)
}

fn default_poll_interval() -> u32 {
    5
}

fn default_slow_down_increment() -> u32 {
    5
}

fn default_proof_max_age() -> Duration {
    Duration::from_secs(120)
}

fn default_proof_clock_skew() -> Duration {
    Duration::from_secs(5)
}

fn default_revocation_cache_ttl() -> Duration {
    Duration::from_secs(60)
}
