//! cookieguard - Source-address-spoofing mitigation cookie daemon
//!
//! A host-side mechanism that mitigates source-address spoofing
//! amplification for datagram protocols that trust the source of an
//! incoming packet. Two peers exchange a per-destination 96-bit opaque
//! cookie that the sender attaches to data packets; the receiver
//! validates it against a locally-computable function of the source
//! address and a rotating secret. When validation fails or a cookie is
//! missing/stale, the validator emits a control message to teach or
//! correct the sender.
//!
//! # Features
//!
//! - Stateless server-side cookie verification against a rotating
//!   current/previous secret pair
//! - Entry-scoped three-case timer state machine driving cookie
//!   renewal, fallback, and retry on the send path
//! - Bounded FIFO cookie cache shared between a daemon and one or more
//!   packet-path shims
//! - ICMPv6-family control channel for SET-COOKIE /
//!   SETCOOKIE-NOT-EXPECTED exchange, with spoof-attempt logging
//!
//! # Usage
//!
//! ```no_run
//! use cookieguard::config::CookieGuardConfig;
//! use cookieguard::shared::SharedRegion;
//!
//! #[tokio::main]
//! async fn main() -> cookieguard::error::Result<()> {
//!     let config = CookieGuardConfig::from_file("cookied.conf")?;
//!     let region = SharedRegion::create(
//!         config.shared_region_path.as_ref(),
//!         config.cache_capacity,
//!         config.rotation_period_secs,
//!         0,
//!     )?;
//!     let daemon = cookieguard::daemon::CookieDaemon::new(region.state.clone());
//!     let _ = daemon;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod cookie;
pub mod daemon;
pub mod entry;
pub mod error;
pub mod shared;
pub mod shim;
pub mod transport;
pub mod wire;

pub use config::CookieGuardConfig;
pub use daemon::CookieDaemon;
pub use error::CookieGuardError;
pub use shared::{FullState, SharedRegion};
