use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RingError;

/// A position on the ring: an unsigned integer in [0, 2^m).
///
/// Identifiers for nodes and keys live in the same space, so ordinary ring
/// comparisons decide which node is responsible for which key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(u64);

impl Id {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", hex::encode(self.0.to_be_bytes()))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

/// The m-bit circular identifier space.
///
/// All operations are pure modular arithmetic over [0, 2^m); `between` is
/// defined on the circular space, not linear integers. Every node in a ring
/// must be configured with the same width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeySpace {
    bits: u32,
}

impl KeySpace {
    pub fn new(bits: u32) -> Result<Self, RingError> {
        if bits == 0 || bits > 64 {
            return Err(RingError::InvalidIdentifier(format!(
                "bit width must be in 1..=64, got {bits}"
            )));
        }
        Ok(Self { bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    fn mask(&self) -> u64 {
        if self.bits == 64 {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        }
    }

    /// Hashes arbitrary bytes into the identifier space (SHA-256 truncated
    /// to the configured width).
    pub fn hash(&self, bytes: &[u8]) -> Id {
        let digest = Sha256::digest(bytes);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        Id(u64::from_be_bytes(head) & self.mask())
    }

    /// Validates a raw identifier from the wire against the configured width.
    pub fn check(&self, raw: u64) -> Result<Id, RingError> {
        if raw & !self.mask() != 0 {
            return Err(RingError::InvalidIdentifier(format!(
                "{raw:#x} does not fit a {}-bit ring",
                self.bits
            )));
        }
        Ok(Id(raw))
    }

    /// True iff `x` lies strictly on the clockwise arc from `a` to `b`.
    ///
    /// Convention: `a == b` denotes the whole ring, so any `x != a` is
    /// inside. This is what makes a single-node ring route every identifier
    /// to itself.
    pub fn between(&self, a: Id, x: Id, b: Id) -> bool {
        if a == b {
            return x != a;
        }
        if a < b {
            a < x && x < b
        } else {
            x > a || x < b
        }
    }

    /// Clockwise distance from `a` to `b`.
    pub fn distance(&self, a: Id, b: Id) -> Id {
        Id(b.0.wrapping_sub(a.0) & self.mask())
    }

    /// Start of finger interval `i` for a node at `n`: (n + 2^i) mod 2^m.
    pub fn finger_start(&self, n: Id, i: u32) -> Id {
        assert!(i < self.bits, "finger index {i} out of a {}-bit table", self.bits);
        Id(n.0.wrapping_add(1u64 << i) & self.mask())
    }

    /// Identifier immediately after `a` clockwise.
    pub fn next(&self, a: Id) -> Id {
        Id(a.0.wrapping_add(1) & self.mask())
    }
}

/// A node's identity on the ring: identifier plus reachable location.
///
/// Immutable once constructed. The identifier is derived by hashing
/// `host:port`, so every node in the ring computes the same identifier for
/// the same endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    id: Id,
    host: String,
    port: u16,
}

impl Address {
    pub fn new(space: &KeySpace, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let id = space.hash(format!("{host}:{port}").as_bytes());
        Self { id, host, port }
    }

    /// Rebuilds an address from wire parts, validating the identifier width.
    pub fn from_parts(
        space: &KeySpace,
        raw_id: u64,
        host: impl Into<String>,
        port: u16,
    ) -> Result<Self, RingError> {
        let id = space.check(raw_id)?;
        Ok(Self {
            id,
            host: host.into(),
            port,
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, the form transports dial.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}
