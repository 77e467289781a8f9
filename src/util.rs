//! Secure-Connect Identifiers and Helpers
//!
//! Small stack-wide types used by every secure-connect component: the
//! 6-octet VMAC link-layer address, the 16-octet stable device UUID, and
//! the monotonically increasing BVLC message-id counter.

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

use rand::RngCore;

/// Size of a VMAC address in octets.
pub const VMAC_SIZE: usize = 6;

/// Size of a device UUID in octets.
pub const UUID_SIZE: usize = 16;

/// Virtual MAC address identifying a node on the secure-connect overlay.
///
/// VMACs must be unique among the nodes attached to a hub; a collision is
/// detected by the remote side during the connect handshake and recovered
/// by regenerating a random VMAC and restarting.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Vmac(pub [u8; VMAC_SIZE]);

impl Vmac {
    /// The broadcast VMAC (all octets 0xFF).
    pub const BROADCAST: Vmac = Vmac([0xFF; VMAC_SIZE]);

    /// Generate a Random-48 VMAC.
    ///
    /// The upper nibble of the first octet is forced to `0b0010` to mark
    /// the address as randomly assigned; the all-zero and broadcast
    /// patterns are never produced.
    pub fn random() -> Self {
        let mut octets = [0u8; VMAC_SIZE];
        rand::rng().fill_bytes(&mut octets);
        octets[0] = (octets[0] & 0x0F) | 0x20;
        Vmac(octets)
    }

    /// True for the all-FF broadcast address.
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; VMAC_SIZE]
    }
}

impl fmt::Display for Vmac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_str = hex::encode(self.0);
        let mut parts = Vec::with_capacity(VMAC_SIZE);
        for i in 0..VMAC_SIZE {
            parts.push(&hex_str[i * 2..i * 2 + 2]);
        }
        write!(f, "{}", parts.join(":"))
    }
}

// Reads better in logs as plain hex than as derived struct output.
impl fmt::Debug for Vmac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Stable 128-bit device identity, independent of the (possibly
/// regenerated) VMAC.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScUuid(pub [u8; UUID_SIZE]);

impl fmt::Display for ScUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ScUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

static MESSAGE_ID: AtomicU16 = AtomicU16::new(1);

/// Next BVLC message id, shared by all nodes in the process.
///
/// Message ids only need to be unlikely to collide within the originator's
/// outstanding requests, so a single wrapping counter is sufficient.
pub fn next_message_id() -> u16 {
    MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_vmac_marking() {
        for _ in 0..64 {
            let vmac = Vmac::random();
            assert_eq!(vmac.0[0] & 0xF0, 0x20);
            assert!(!vmac.is_broadcast());
            assert_ne!(vmac.0, [0u8; VMAC_SIZE]);
        }
    }

    #[test]
    fn test_random_vmac_changes() {
        // Two draws agreeing on all 44 random bits is effectively impossible.
        assert_ne!(Vmac::random(), Vmac::random());
    }

    #[test]
    fn test_vmac_display() {
        let vmac = Vmac([0x02, 0x1A, 0xFF, 0x00, 0x9C, 0x3E]);
        assert_eq!(vmac.to_string(), "02:1a:ff:00:9c:3e");
    }

    #[test]
    fn test_message_id_advances() {
        let a = next_message_id();
        let b = next_message_id();
        assert_ne!(a, b);
    }
}
