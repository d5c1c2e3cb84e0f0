//! Stateless Server Verifier (SSV) — spec §4.1.
//!
//! `cookie_of` is the keyed PRF mapping `(peer, secret) -> Cookie`. The
//! construction is intentionally unspecified by the protocol beyond two
//! requirements: preimage resistance under ordinary attacker capability,
//! and a uniform enough output that collisions stay around 2^-96 per
//! pair. A keyed BLAKE2s MAC truncated to 96 bits satisfies both, in the
//! same style this codebase already uses for its other keyed MACs.

use blake2::digest::consts::U12;
use blake2::digest::{FixedOutput, Mac as MacTrait, Update};
use blake2::Blake2sMac;
use subtle::ConstantTimeEq;

use crate::entry::{Cookie, PeerAddr};

/// 256-bit secret key for the cookie PRF.
pub type Secret = [u8; 32];

/// Outcome of [`verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Matches `cookie_of(peer, current)`.
    Valid(Which),
    Invalid,
}

/// Which secret a [`Verdict::Valid`] matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    Current,
    Previous,
}

/// Deterministic 96-bit derivation of a cookie for `peer`, keyed by `secret`.
pub fn cookie_of(peer: PeerAddr, secret: &Secret) -> Cookie {
    let mut mac = Blake2sMac::<U12>::new_from_slice(secret).expect("32-byte key is always valid");
    MacTrait::update(&mut mac, &peer.octets());
    mac.finalize_fixed().into()
}

/// `verify(peer, received) -> Valid(current) | Valid(previous) | Invalid`.
///
/// Pure function of the two secrets and the inputs; no state mutation.
pub fn verify(peer: PeerAddr, received: &Cookie, current: &Secret, previous: &Secret) -> Verdict {
    let against_current = cookie_of(peer, current);
    if bool::from(against_current.ct_eq(received)) {
        return Verdict::Valid(Which::Current);
    }
    let against_previous = cookie_of(peer, previous);
    if bool::from(against_previous.ct_eq(received)) {
        return Verdict::Valid(Which::Previous);
    }
    Verdict::Invalid
}
