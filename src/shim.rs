//! Shim send/receive paths — spec §4.3, §4.4. The core of the state machine.

use crate::cache::Cache;
use crate::cookie::{cookie_of, verify, Verdict};
use crate::entry::{ts_diff, CacheEntry, Cookie, PeerAddr};
use crate::shared::FullState;
use crate::wire::ControlMessage;

/// Timing constants from spec §6/§9. `T_RECOVER = 3`, `FALLBACK_LT2 = 8`
/// (2^8 = 256s), `TRY_LT2 = 3` (2^3 = 8s).
#[derive(Debug, Clone, Copy)]
pub struct TimerConstants {
    pub t_recover: u32,
    pub fallback_lt2: u8,
    pub try_lt2: u8,
}

impl Default for TimerConstants {
    fn default() -> Self {
        Self {
            t_recover: 3,
            fallback_lt2: 8,
            try_lt2: 3,
        }
    }
}

/// The three-case timer classification of spec §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Case {
    /// `t_now < t_exp` — still valid.
    StillValid,
    /// `t_exp <= t_now < t_exp + T_RECOVER` — renew window.
    RenewWindow,
    /// `t_now >= t_exp + T_RECOVER` — past renew.
    PastRenew,
}

fn classify(now: u32, entry: &CacheEntry, constants: &TimerConstants) -> Case {
    let t_exp = entry.mtime().wrapping_add(1u32 << entry.lifetime_log2());
    let since_exp = ts_diff(now, t_exp);
    if since_exp < 0 {
        Case::StillValid
    } else if (since_exp as u32) < constants.t_recover {
        Case::RenewWindow
    } else {
        Case::PastRenew
    }
}

/// Outcome of [`send`]: whether the caller should attach a cookie option,
/// and if so, which value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub cookie: Option<Cookie>,
}

/// Per-outbound-datagram send path (spec §4.4).
///
/// `cookies_active_default` governs the cold-create sub-case (local
/// policy on whether a never-seen peer starts in the cookie-seeking
/// state or with cookies disabled outright).
pub fn send(cache: &Cache, peer: PeerAddr, now: u32, cookies_active_default: bool, constants: &TimerConstants) -> SendOutcome {
    let cookie = cache.lookup_or_create(peer, |entry, was_created| {
        if was_created {
            cold_create(entry, now, cookies_active_default);
        } else {
            advance_timer(entry, now, constants);
        }
        if entry.disable_cookies() {
            None
        } else {
            Some(entry.cookie())
        }
    });

    SendOutcome { cookie }
}

/// `entry.peer` is already stamped by `Cache::lookup_or_create` before this
/// runs; this only fills in the rest of a freshly-allocated entry.
fn cold_create(entry: &mut CacheEntry, now: u32, cookies_active_default: bool) {
    entry.update_mtime(now);
    if cookies_active_default {
        entry.set_lifetime_log2(0);
        entry.set_disable_cookies(false);
        entry.set_expecting_setcookie(true);
        entry.set_cookie([0; 12]);
    } else {
        entry.set_disable_cookies(true);
        entry.set_expecting_setcookie(false);
        entry.set_lifetime_log2(crate::entry::LIFETIME_LOG2_INFINITE);
    }
}

/// Applies the Case-0/1/2 × DISABLE_COOKIES branch table of spec §4.4 to
/// an existing entry.
fn advance_timer(entry: &mut CacheEntry, now: u32, constants: &TimerConstants) {
    let case = classify(now, entry, constants);

    match (entry.disable_cookies(), case) {
        (true, Case::StillValid) => {}
        (true, Case::RenewWindow) => fallback_retry(entry, now, constants),
        (true, Case::PastRenew) => fallback_retry(entry, now, constants),

        (false, Case::StillValid) => {}
        (false, Case::RenewWindow) => {
            if !entry.expecting_setcookie() {
                enter_renew_window(entry, now);
            }
        }
        (false, Case::PastRenew) => {
            if entry.expecting_setcookie() {
                enter_fallback(entry, now, constants);
            } else {
                enter_renew_window(entry, now);
            }
        }
    }
}

/// `DISABLE_COOKIES` set, Case 1 or Case 2: clear it, update_mtime, and
/// retry with `TRY_LT2`.
fn fallback_retry(entry: &mut CacheEntry, now: u32, constants: &TimerConstants) {
    entry.set_disable_cookies(false);
    entry.update_mtime(now);
    entry.set_lifetime_log2(constants.try_lt2);
}

/// First entry into Case 1 while settled: set EXPECTING_SETCOOKIE and
/// backdate mtime so the renew window's `T_RECOVER` deadline is a full
/// window away, not however many milliseconds late this send happened to
/// land (spec §4.4 rationale).
fn enter_renew_window(entry: &mut CacheEntry, now: u32) {
    entry.set_expecting_setcookie(true);
    entry.backdate_by_lifetime_log2(now);
}

/// Entry stayed EXPECTING_SETCOOKIE all the way into Case 2: the peer
/// never replied with SET-COOKIE. Suppress cookies for `FALLBACK_LT2`.
fn enter_fallback(entry: &mut CacheEntry, now: u32, constants: &TimerConstants) {
    entry.set_disable_cookies(true);
    entry.update_mtime(now);
    entry.set_lifetime_log2(constants.fallback_lt2);
}

/// Outcome of [`recv`]: either deliver the datagram, or also emit a
/// SET-COOKIE control message to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvOutcome {
    pub deliver: bool,
    pub set_cookie: Option<ControlMessage>,
}

/// Per-inbound-datagram receive path (spec §4.3). `refresh_exponent` is
/// the host's advertised `H` (policy constant for the `lt_log2` sent back
/// in a corrective SET-COOKIE).
pub fn recv(state: &FullState, peer: PeerAddr, received: Cookie, refresh_exponent: u8) -> RecvOutcome {
    let (current, previous) = state.server.secrets();
    match verify(peer, &received, &current, &previous) {
        Verdict::Valid(_) => RecvOutcome {
            deliver: true,
            set_cookie: None,
        },
        Verdict::Invalid => {
            let requested = cookie_of(peer, &current);
            RecvOutcome {
                deliver: false,
                set_cookie: Some(ControlMessage::set_cookie(received, requested, refresh_exponent)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ServerState;
    use std::net::Ipv6Addr;

    fn peer(n: u16) -> PeerAddr {
        Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, n)
    }

    fn full_state(current: [u8; 32], previous: [u8; 32]) -> FullState {
        FullState::new(ServerState::new(current, previous, u64::MAX, 3600), 16)
    }

    // S1 — cold send -> ACTIVE-EXPECTING.
    #[test]
    fn s1_cold_send_creates_active_expecting() {
        let cache = Cache::new(8);
        let p = peer(1);
        let outcome = send(&cache, p, 0, true, &TimerConstants::default());
        assert_eq!(outcome.cookie, None, "cookie not yet learned");

        let entry = cache.get(p).unwrap();
        assert_eq!(entry.mtime(), 0);
        assert_eq!(entry.lifetime_log2(), 0);
        assert!(!entry.disable_cookies());
        assert!(entry.expecting_setcookie());
        assert_eq!(entry.cookie(), [0; 12]);
    }

    #[test]
    fn s1_set_cookie_installs_active_settled() {
        let cache = Cache::new(8);
        let p = peer(1);
        send(&cache, p, 0, true, &TimerConstants::default());

        // Daemon side, simulated directly on the entry per spec §4.2.
        cache.lookup_or_create(p, |entry, _| {
            assert_eq!(entry.cookie(), [0; 12]); // echoed must match
            entry.set_cookie([0xAA; 12]);
            entry.set_lifetime_log2(4);
            entry.update_mtime(2);
            entry.set_expecting_setcookie(false);
            entry.set_disable_cookies(false);
        });

        let entry = cache.get(p).unwrap();
        assert_eq!(entry.cookie(), [0xAA; 12]);
        assert_eq!(entry.lifetime_log2(), 4);
        assert!(!entry.expecting_setcookie());
        assert!(!entry.disable_cookies());
        assert_eq!(entry.mtime(), 2);
    }

    // S2 — case-1 backdate.
    #[test]
    fn s2_case1_backdates_mtime() {
        let cache = Cache::new(8);
        let p = peer(2);
        cache.lookup_or_create(p, |entry, _| {
            entry.set_peer(p);
            entry.update_mtime(0);
            entry.set_lifetime_log2(4); // 2^4 = 16
            entry.set_disable_cookies(false);
            entry.set_expecting_setcookie(false);
            entry.set_cookie([0xAA; 12]);
        });

        let outcome = send(&cache, p, 18, true, &TimerConstants::default());
        assert_eq!(outcome.cookie, Some([0xAA; 12]));

        let entry = cache.get(p).unwrap();
        assert!(entry.expecting_setcookie());
        assert!(!entry.disable_cookies());
        assert_eq!(entry.mtime(), 2); // 18 - 16
    }

    // S3 — case-2 fallback.
    #[test]
    fn s3_case2_enters_fallback() {
        let cache = Cache::new(8);
        let p = peer(3);
        cache.lookup_or_create(p, |entry, _| {
            entry.set_peer(p);
            entry.update_mtime(2);
            entry.set_lifetime_log2(4);
            entry.set_disable_cookies(false);
            entry.set_expecting_setcookie(true); // already renewing, per S2
            entry.set_cookie([0xAA; 12]);
        });

        let outcome = send(&cache, p, 22, true, &TimerConstants::default());
        assert_eq!(outcome.cookie, None);

        let entry = cache.get(p).unwrap();
        assert!(entry.disable_cookies());
        assert!(!entry.expecting_setcookie());
        assert_eq!(entry.mtime(), 22);
        assert_eq!(entry.lifetime_log2(), 8); // FALLBACK_LT2
    }

    // S4 — fallback retry.
    #[test]
    fn s4_fallback_retry_clears_disable_and_retries() {
        let cache = Cache::new(8);
        let p = peer(4);
        cache.lookup_or_create(p, |entry, _| {
            entry.set_peer(p);
            entry.update_mtime(22);
            entry.set_lifetime_log2(8); // FALLBACK_LT2, fallback deadline = 22+256=278
            entry.set_disable_cookies(true);
            entry.set_cookie([0xAA; 12]);
        });

        // t=280 is past 278 + T_RECOVER(3) = 281? No: 278 is t_exp, +3 = 281.
        // Spec's S4 example uses t=280 which falls in the renew window for
        // the fallback timer, but since DISABLE_COOKIES is set both Case 1
        // and Case 2 take the same retry branch (spec §4.4 table).
        let outcome = send(&cache, p, 280, true, &TimerConstants::default());

        let entry = cache.get(p).unwrap();
        assert!(!entry.disable_cookies());
        assert_eq!(entry.mtime(), 280);
        assert_eq!(entry.lifetime_log2(), 3); // TRY_LT2
        // D was just cleared in this path, so a cookie would attach; the
        // entry's last-known cookie is all we have until SET-COOKIE arrives.
        assert_eq!(outcome.cookie, Some([0xAA; 12]));
    }

    #[test]
    fn still_valid_case_leaves_entry_untouched() {
        let cache = Cache::new(8);
        let p = peer(5);
        cache.lookup_or_create(p, |entry, _| {
            entry.set_peer(p);
            entry.update_mtime(0);
            entry.set_lifetime_log2(10); // plenty of headroom
            entry.set_disable_cookies(false);
            entry.set_expecting_setcookie(false);
            entry.set_cookie([0x11; 12]);
        });

        send(&cache, p, 5, true, &TimerConstants::default());

        let entry = cache.get(p).unwrap();
        assert_eq!(entry.mtime(), 0);
        assert!(!entry.expecting_setcookie());
    }

    #[test]
    fn cold_create_with_cookies_inactive_sets_infinite_disable() {
        let cache = Cache::new(8);
        let p = peer(6);
        let outcome = send(&cache, p, 0, false, &TimerConstants::default());
        assert_eq!(outcome.cookie, None);

        let entry = cache.get(p).unwrap();
        assert!(entry.disable_cookies());
        assert!(!entry.expecting_setcookie());
        assert_eq!(entry.lifetime_log2(), crate::entry::LIFETIME_LOG2_INFINITE);
    }

    // S5 / S6-adjacent: recv path.
    #[test]
    fn recv_valid_cookie_delivers() {
        let current = [0x11; 32];
        let previous = [0x22; 32];
        let state = full_state(current, previous);
        let p = peer(7);
        let c = cookie_of(p, &current);

        let outcome = recv(&state, p, c, 4);
        assert!(outcome.deliver);
        assert!(outcome.set_cookie.is_none());
    }

    #[test]
    fn recv_invalid_cookie_emits_set_cookie() {
        let current = [0x11; 32];
        let previous = [0x22; 32];
        let state = full_state(current, previous);
        let p = peer(8);

        let outcome = recv(&state, p, [0xFF; 12], 4);
        assert!(!outcome.deliver);
        let msg = outcome.set_cookie.unwrap();
        assert_eq!(msg.echoed_cookie, [0xFF; 12]);
        assert_eq!(msg.requested_cookie, cookie_of(p, &current));
        assert_eq!(msg.lt_log2, 4);
    }

    #[test]
    fn recv_previous_valid_still_delivers() {
        let current = [0x11; 32];
        let previous = [0x22; 32];
        let state = full_state(current, previous);
        let p = peer(9);
        let c = cookie_of(p, &previous);

        let outcome = recv(&state, p, c, 4);
        assert!(outcome.deliver);
    }
}
