//! # pairlock-grant
//!
//! Device pairing grant flow with key-bound credentials.
//!
//! A headless device opens a pairing session, shows a short code to a
//! human, and polls while the human approves the session from a browser.
//! Approval yields a short-lived registration token bound to the device's
//! ephemeral key; redeeming it registers the device's long-term key as an
//! identity. Steady-state access then uses key-bound access tokens: every
//! request carries both a token and a fresh proof of possession, so a
//! stolen token or a captured proof is useless on its own.
//!
//! ## Architecture
//!
//! - [`service::PairingService`] - the flow's operations, wired over
//!   pluggable persistence
//! - [`store`] - session, token, and device persistence seams plus
//!   in-memory implementations
//! - [`tokens::TokenIssuer`] - EdDSA-signed registration and device-access
//!   tokens carrying `cnf.jkt` key confirmation
//! - [`keys::SigningKeyProvider`] - process signing key lifecycle,
//!   fail-closed in production
//! - [`revocation::TokenRevocationCache`] - bounded-staleness revocation
//!   checks with immediate effect on the revoking path
//!
//! Proof verification itself lives in the `pairlock-dpop` crate.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pairlock_grant::{
//!     ClientInfo, GrantConfig, MemoryDeviceRegistry, MemorySessionRepository,
//!     MemoryTokenRegistry, PairingService, SigningKeyConfig, StartRequest,
//! };
//!
//! # async fn demo() -> pairlock_grant::Result<()> {
//! let mut config = GrantConfig::new("https://pairing.example", "https://pairing.example/pair");
//! config.signing_key = SigningKeyConfig {
//!     allow_ephemeral: true,
//!     ..SigningKeyConfig::default()
//! };
//!
//! let service = PairingService::new(
//!     config,
//!     Arc::new(MemorySessionRepository::new()),
//!     Arc::new(MemoryTokenRegistry::new()),
//!     Arc::new(MemoryDeviceRegistry::new()),
//! )?;
//!
//! let response = service
//!     .start(
//!         StartRequest {
//!             pub_ke: "<base64url 32-byte key>".to_string(),
//!             model: "sensor-1".to_string(),
//!             version: "1.0".to_string(),
//!             nonce: None,
//!             poll_interval: None,
//!         },
//!         ClientInfo::default(),
//!     )
//!     .await?;
//! println!("show code {} at {}", response.user_code, response.verification_uri);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errors;
pub mod keys;
pub mod revocation;
pub mod service;
pub mod session;
pub mod store;
pub mod tokens;

pub use config::{GrantConfig, SigningKeyConfig};
pub use errors::{GrantError, Result};
pub use keys::SigningKeyProvider;
pub use revocation::TokenRevocationCache;
pub use service::{
    AccessTokenResponse, ClientInfo, PairingService, RegisterRequest, RegisterResponse,
    SessionPreview, StartRequest, StartResponse, TokenResponse,
};
pub use session::{PairingSession, SessionStatus};
pub use store::{
    DeviceLifecycle, DeviceRecord, DeviceRegistry, DeviceTokenRecord, MemoryDeviceRegistry,
    MemorySessionRepository, MemoryTokenRegistry, NewDevice, PairingSessionStore,
    SessionRepository, TokenRegistry,
};
pub use tokens::{DeviceAccessClaims, IssuedToken, RegistrationClaims, TokenIssuer};
