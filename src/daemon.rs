//! Cookie Daemon — spec §4.2.
//!
//! Owns the rotating secrets (via [`crate::shared::FullState`]) and
//! processes the two control messages. Runs no loop of its own here; the
//! async receive loop lives in `bin/cookied.rs` so this module stays a
//! pure, synchronously-testable state transition, matching how the
//! teacher keeps its session/handshake state machines free of I/O.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::cookie::{verify, Verdict};
use crate::entry::PeerAddr;
use crate::shared::FullState;
use crate::wire::{Code, ControlMessage};

/// Suppresses repeated warn-level logs for the same peer within a short
/// window, so a flood of malformed/spoofed control traffic from one
/// source can't blow out the log (spec §7's "rate-limited log").
pub struct RateLimiter {
    window: Duration,
    last_logged: Mutex<HashMap<PeerAddr, Instant>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_logged: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if an event for `peer` should be logged now.
    fn should_log(&self, peer: PeerAddr) -> bool {
        let mut map = self.last_logged.lock();
        let now = Instant::now();
        match map.get(&peer) {
            Some(&last) if now.duration_since(last) < self.window => false,
            _ => {
                map.insert(peer, now);
                true
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Outcome of processing a SET-COOKIE, for callers that want to react
/// (e.g. the demo driver printing what happened).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCookieOutcome {
    /// No entry existed for the peer; a SETCOOKIE-NOT-EXPECTED reply was
    /// produced for the caller to send back.
    UnknownPeer(ControlMessage),
    /// `echoed` matched the stored cookie; the entry was updated.
    Applied,
    /// `echoed` did not match; dropped, rate-limited log emitted.
    EchoMismatch,
}

pub struct CookieDaemon {
    pub state: std::sync::Arc<FullState>,
    limiter: RateLimiter,
    /// Count of inbound control packets dropped for being malformed —
    /// wrong length, unrecognized type/code, bad checksum, or nonzero
    /// reserved bits (spec §7 "Malformed inbound ... dropped, counter
    /// incremented").
    malformed_inbound: std::sync::atomic::AtomicU64,
}

impl CookieDaemon {
    pub fn new(state: std::sync::Arc<FullState>) -> Self {
        Self {
            state,
            limiter: RateLimiter::default(),
            malformed_inbound: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Record a malformed inbound control packet (spec §7). Called by the
    /// transport loop before a message ever reaches [`Self::handle`], since
    /// malformed packets never decode into a [`ControlMessage`] at all.
    pub fn record_malformed_inbound(&self) {
        self.malformed_inbound.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Total malformed-inbound count since this daemon was created.
    pub fn malformed_inbound_count(&self) -> u64 {
        self.malformed_inbound.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Dispatch an inbound control message from `peer` (spec §4.2).
    pub fn handle(&self, peer: PeerAddr, msg: &ControlMessage, now: u32) -> DaemonAction {
        match msg.code {
            Code::SetCookie => DaemonAction::SetCookie(self.handle_set_cookie(peer, msg, now)),
            Code::SetcookieNotExpected => {
                self.handle_setcookie_not_expected(peer, msg);
                DaemonAction::None
            }
        }
    }

    fn handle_set_cookie(&self, peer: PeerAddr, msg: &ControlMessage, now: u32) -> SetCookieOutcome {
        // Existence check and conditional mutation happen inside one
        // `update_existing` call, atomically with respect to a concurrent
        // eviction of this peer's entry: a separate `get` followed by a
        // separate `lookup_or_create` could observe "exists" but then
        // find it gone, and `lookup_or_create` would silently fabricate a
        // fresh all-zero entry for it — exactly what spec §4.2 forbids
        // ("if no entry for P ... create no entry").
        let applied = self.state.cache.update_existing(peer, |entry| {
            if entry.cookie() != msg.echoed_cookie {
                return false;
            }
            entry.set_cookie(msg.requested_cookie);
            entry.set_lifetime_log2(msg.lt_log2);
            entry.update_mtime(now);
            entry.set_expecting_setcookie(false);
            entry.set_disable_cookies(false);
            true
        });

        match applied {
            None => {
                // "Construct a SETCOOKIE-NOT-EXPECTED with echoed =
                // requested (the value P wanted us to use). Create no
                // entry."
                let reply = ControlMessage::setcookie_not_expected(msg.requested_cookie);
                SetCookieOutcome::UnknownPeer(reply)
            }
            Some(true) => SetCookieOutcome::Applied,
            Some(false) => {
                if self.limiter.should_log(peer) {
                    warn!(?peer, "SET-COOKIE echoed cookie mismatch, dropping");
                }
                SetCookieOutcome::EchoMismatch
            }
        }
    }

    fn handle_setcookie_not_expected(&self, peer: PeerAddr, msg: &ControlMessage) {
        let (current, previous) = self.state.server.secrets();
        match verify(peer, &msg.echoed_cookie, &current, &previous) {
            Verdict::Valid(_) => {
                // The data packet that provoked our SET-COOKIE carried a
                // forged source: the real owner of `peer` never sent it.
                info!(?peer, "confirmed spoofing attempt against this host");
            }
            Verdict::Invalid => {
                if self.limiter.should_log(peer) {
                    warn!(?peer, "forged SETCOOKIE-NOT-EXPECTED notification, dropping");
                }
            }
        }
    }

    /// Roll the secret pair if due. Intended to be called from a periodic
    /// task (spec §3: "rotation schedule is policy, not protocol").
    pub fn maybe_rotate_secrets(&self, now: u64) -> bool {
        self.state.server.maybe_rotate(now)
    }
}

/// What the caller (the async I/O loop) should do in response to a
/// dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonAction {
    SetCookie(SetCookieOutcome),
    None,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::shared::ServerState;
    use std::net::Ipv6Addr;
    use std::sync::Arc;

    fn peer(n: u16) -> PeerAddr {
        Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, n)
    }

    fn daemon_with_cache(cache: Cache) -> CookieDaemon {
        let server = ServerState::new([0x11; 32], [0x22; 32], u64::MAX, 3600);
        let state = Arc::new(FullState { server, cache });
        CookieDaemon::new(state)
    }

    #[test]
    fn set_cookie_from_unknown_peer_replies_not_expected_no_entry_created() {
        let daemon = daemon_with_cache(Cache::new(8));
        let p = peer(1);
        let msg = ControlMessage::set_cookie([0; 12], [0xAA; 12], 4);

        let outcome = daemon.handle_set_cookie(p, &msg, 0);
        match outcome {
            SetCookieOutcome::UnknownPeer(reply) => {
                assert_eq!(reply.echoed_cookie, [0xAA; 12]);
                assert_eq!(reply.code, Code::SetcookieNotExpected);
            }
            other => panic!("expected UnknownPeer, got {other:?}"),
        }
        assert!(daemon.state.cache.get(p).is_none());
    }

    #[test]
    fn set_cookie_with_matching_echo_updates_entry() {
        let cache = Cache::new(8);
        let p = peer(2);
        cache.lookup_or_create(p, |entry, _| {
            entry.set_peer(p);
            entry.set_cookie([0; 12]);
            entry.set_expecting_setcookie(true);
        });
        let daemon = daemon_with_cache(cache);

        let msg = ControlMessage::set_cookie([0; 12], [0xAA; 12], 4);
        let outcome = daemon.handle_set_cookie(p, &msg, 2);
        assert_eq!(outcome, SetCookieOutcome::Applied);

        let entry = daemon.state.cache.get(p).unwrap();
        assert_eq!(entry.cookie(), [0xAA; 12]);
        assert_eq!(entry.lifetime_log2(), 4);
        assert!(!entry.expecting_setcookie());
        assert!(!entry.disable_cookies());
        assert_eq!(entry.mtime(), 2);
    }

    #[test]
    fn set_cookie_with_mismatched_echo_never_mutates_entry() {
        let cache = Cache::new(8);
        let p = peer(3);
        cache.lookup_or_create(p, |entry, _| {
            entry.set_peer(p);
            entry.set_cookie([0x99; 12]);
        });
        let daemon = daemon_with_cache(cache);

        let msg = ControlMessage::set_cookie([0; 12], [0xAA; 12], 4);
        let outcome = daemon.handle_set_cookie(p, &msg, 2);
        assert_eq!(outcome, SetCookieOutcome::EchoMismatch);

        let entry = daemon.state.cache.get(p).unwrap();
        assert_eq!(entry.cookie(), [0x99; 12]); // unchanged
    }

    #[test]
    fn setcookie_not_expected_valid_is_confirmed_spoof() {
        let daemon = daemon_with_cache(Cache::new(8));
        let p = peer(4);
        let (current, _) = daemon.state.server.secrets();
        let echoed = crate::cookie::cookie_of(p, &current);
        let msg = ControlMessage::setcookie_not_expected(echoed);

        // Should not panic and should not create an entry.
        daemon.handle_setcookie_not_expected(p, &msg);
        assert!(daemon.state.cache.get(p).is_none());
    }

    #[test]
    fn setcookie_not_expected_invalid_is_dropped() {
        let daemon = daemon_with_cache(Cache::new(8));
        let p = peer(5);
        let msg = ControlMessage::setcookie_not_expected([0xFF; 12]);
        daemon.handle_setcookie_not_expected(p, &msg);
        assert!(daemon.state.cache.get(p).is_none());
    }

    #[test]
    fn rate_limiter_suppresses_rapid_repeats() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        let p = peer(6);
        assert!(limiter.should_log(p));
        assert!(!limiter.should_log(p));
    }

    #[test]
    fn malformed_inbound_counter_accumulates() {
        let daemon = daemon_with_cache(Cache::new(8));
        assert_eq!(daemon.malformed_inbound_count(), 0);
        daemon.record_malformed_inbound();
        daemon.record_malformed_inbound();
        assert_eq!(daemon.malformed_inbound_count(), 2);
    }
}
