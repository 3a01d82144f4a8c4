//! 256-bit identifier used for ring addresses, lookup targets and content hashes.
use std::fmt::{self, Debug, Formatter};

use rand::Rng;
use sha2::{Digest as _, Sha256};

use crate::{Error, Result};

/// The size of identifiers in bytes.
pub const ID_SIZE: usize = 32;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// A point on the 256-bit identifier ring.
///
/// The same type addresses routing-table entries (hash of a peer's wallet
/// address), lookup targets, and content-addressed merkle nodes; all three
/// live in the one hash space.
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp = [0u8; ID_SIZE];
        tmp[..ID_SIZE].copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Bit `index` of this Id, MSB first: bit 0 is the high bit of byte 0.
    pub fn bit(&self, index: usize) -> bool {
        (self.0[index / 8] >> (7 - (index % 8))) & 1 == 1
    }

    /// Ring distance between this Id and another.
    ///
    /// Ids are unsigned integers on a ring of size `2^256`, so the distance
    /// is the shorter way around: `min(|a-b|, 2^256 - |a-b|)`.
    ///
    /// Distance to self is 0, the maximum possible distance is `2^255`.
    pub fn distance(&self, other: &Id) -> Distance {
        let forward = sub_wrapping(&self.0, &other.0);
        let backward = sub_wrapping(&other.0, &self.0);

        Distance(forward.min(backward))
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id(")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Ring distance between two [Id]s, a 256-bit magnitude.
///
/// Big-endian byte order, so the derived `Ord` compares numerically.
pub struct Distance(pub [u8; ID_SIZE]);

impl Distance {
    pub const ZERO: Distance = Distance([0; ID_SIZE]);
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Print the magnitude instead of 64 hex chars.
        match self.0.iter().position(|b| *b != 0) {
            Some(i) => write!(f, "Distance(~2^{})", (ID_SIZE - i) * 8),
            None => write!(f, "Distance(0)"),
        }
    }
}

/// `(a - b) mod 2^256` over big-endian byte arrays.
fn sub_wrapping(a: &[u8; ID_SIZE], b: &[u8; ID_SIZE]) -> [u8; ID_SIZE] {
    let mut out = [0u8; ID_SIZE];
    let mut borrow = 0u16;

    for i in (0..ID_SIZE).rev() {
        let lhs = a[i] as i16;
        let rhs = b[i] as i16 + borrow as i16;

        if lhs >= rhs {
            out[i] = (lhs - rhs) as u8;
            borrow = 0;
        } else {
            out[i] = (lhs + 256 - rhs) as u8;
            borrow = 1;
        }
    }

    out
}

/// The collaborator hash function: sha256 over raw bytes.
///
/// Every derived quantity in the crate (item keys, slot hashes, store keys,
/// merkle signatures) goes through this one function.
pub fn hash(bytes: &[u8]) -> Id {
    let digest: [u8; ID_SIZE] = Sha256::digest(bytes).into();
    Id(digest)
}
