//! Pairing session model and code generation
//!
//! One [`PairingSession`] per device pairing attempt, keyed by its
//! high-entropy `device_code`. The human-typeable `user_code` is stored
//! alongside a canonical form used for lookup so entry is forgiving about
//! case and separators.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, Rng, RngCore};
use serde::{Deserialize, Serialize};

use pairlock_dpop::DpopJwk;

/// User code alphabet: no vowels (avoids spelling words), no ambiguous
/// glyphs (0/O, 1/I/L)
const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKMNPQRSTVWXZ23456789";

/// Length of a device code before encoding, in bytes
const DEVICE_CODE_BYTES: usize = 32;

/// Pairing session lifecycle state
///
/// Transitions are monotone and one-directional along
/// `pending -> authorized -> redeemed`; `expired` is reachable from
/// `pending` or `authorized` once the expiry has passed. Nothing leaves
/// `redeemed` or `expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Waiting for a human to approve the pairing
    #[default]
    Pending,
    /// Approved; the device may exchange its code for a registration token
    Authorized,
    /// A device identity was registered; terminal
    Redeemed,
    /// Past its expiry without redemption; terminal
    Expired,
}

impl SessionStatus {
    /// Whether this state admits no further transitions
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Redeemed | Self::Expired)
    }
}

/// One device pairing attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingSession {
    /// High-entropy primary key, generated server-side
    pub device_code: String,

    /// Human-typeable code shown on the device
    pub user_code: String,

    /// Canonical form of the user code used for lookup
    pub user_code_canonical: String,

    /// Device's ephemeral public key as a JWK
    pub pub_ke_jwk: DpopJwk,

    /// Precomputed RFC 7638 thumbprint of `pub_ke_jwk`
    pub pub_ke_thumbprint: String,

    /// Device model string as reported by the device
    pub model: String,

    /// Device firmware version
    pub version: String,

    /// Idempotency nonce supplied by the device, if any
    pub nonce: Option<String>,

    /// Requester IP truncated to its network prefix (never the full client
    /// address)
    pub requester_ip: Option<String>,

    /// Autonomous system number of the requester, when known
    pub requester_asn: Option<u32>,

    /// Lifecycle state
    pub status: SessionStatus,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Fixed expiry computed at creation
    pub expires_at: DateTime<Utc>,

    /// Current minimum polling interval in seconds; grows under abuse
    pub poll_interval: u32,

    /// Last `token` poll, if any
    pub last_poll_at: Option<DateTime<Utc>>,

    /// Authorizing principal's account id
    pub acc_id: Option<String>,

    /// When the session was authorized
    pub authorized_at: Option<DateTime<Utc>>,

    /// Actor recorded at authorization time
    pub authorized_by: Option<String>,

    /// `jti` of the currently valid registration token; reissuing
    /// overwrites this, superseding any earlier token for this session
    pub registration_token_jti: Option<String>,

    /// Expiry of the currently valid registration token
    pub registration_token_expires_at: Option<DateTime<Utc>>,

    /// Registered device identity; set only on redemption
    pub device_id: Option<String>,
}

impl PairingSession {
    /// Whether the session's fixed TTL has elapsed at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Canonicalize a user code for lookup: uppercase, separators stripped
#[must_use]
pub fn canonical_user_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Generate a high-entropy device code (32 random bytes, base64url)
#[must_use]
pub fn generate_device_code() -> String {
    let mut bytes = [0u8; DEVICE_CODE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a human-typeable user code in `XXXX-XXXX` form
#[must_use]
pub fn generate_user_code() -> String {
    let mut code = String::with_capacity(9);
    for i in 0..8 {
        if i == 4 {
            code.push('-');
        }
        let idx = OsRng.gen_range(0..USER_CODE_ALPHABET.len());
        code.push(USER_CODE_ALPHABET[idx] as char);
    }
    code
}

/// Truncate a requester address to its network prefix before storage
///
/// IPv4 keeps the /24 network, IPv6 the /64, so stored metadata cannot
/// single out one host.
#[must_use]
pub fn truncate_requester_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            Ipv4Addr::new(a, b, c, 0).to_string()
        }
        IpAddr::V6(v6) => {
            let [s0, s1, s2, s3, ..] = v6.segments();
            Ipv6Addr::new(s0, s1, s2, s3, 0, 0, 0, 0).to_string()
        }
    }
}
