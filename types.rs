//! Cursor result and seek-mode types shared by the B-tree and FI-tree.
//!
//! Trimmed from the teacher's `types.rs` down to the parts that are about
//! *storage*, not SQL value typing (`OwnedValue`/`Record` and friends stay
//! with the out-of-scope SQL layer).

/// The outcome of a step of work that may need to suspend on I/O.
///
/// Mirrors the teacher's `CursorResult<T>`: callers loop calling
/// `io.run_once()` and retrying the same operation while they observe
/// `IO`, rather than blocking inside the call.
#[derive(Debug)]
pub enum CursorResult<T> {
    Ok(T),
    IO,
}

impl<T> CursorResult<T> {
    pub fn is_io(&self) -> bool {
        matches!(self, CursorResult::IO)
    }

    /// Panics if still pending I/O; for use once the caller has drained
    /// `io.run_once()` to completion (tests, synchronous call sites).
    pub fn unwrap(self) -> T {
        match self {
            CursorResult::Ok(v) => v,
            CursorResult::IO => panic!("CursorResult still pending I/O"),
        }
    }
}

/// Seek comparison mode, per spec.md §4.5: `seek(cursor, key, mode)`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SeekOp {
    /// Exact match only.
    EQ,
    /// Greatest key less than or equal to the target.
    LE,
    /// `LE`, but the caller accepts landing one cell early (cheaper, used
    /// by range scans that will call `next()` regardless).
    LEFast,
    /// Smallest key greater than or equal to the target.
    GE,
}

/// Whether a seek landed exactly on the requested key.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SeekResult {
    Found,
    NotFound,
}

/// Keys and values in this engine are opaque byte strings; all ordering
/// is byte-lexicographic (spec.md §9: "preserve ordering of multi-column
/// keys" is a caller concern, encoded into the bytes before they reach
/// here).
pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

/// Age/level addressing into the FI-tree's meta-tree (spec.md §3).
#[derive(Clone, Copy, PartialEq, Eq, Debug, PartialOrd, Ord)]
pub struct AgeLevel {
    pub age: u32,
    pub level: u32,
}

impl AgeLevel {
    pub fn new(age: u32, level: u32) -> Self {
        Self { age, level }
    }

    /// Encodes as the meta-tree key prefix `{age: u32 BE, ~level: u32 BE}`
    /// so that younger ages sort first and, within an age, larger levels
    /// (older sub-trees) sort first.
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.age.to_be_bytes());
        buf[4..8].copy_from_slice(&(!self.level).to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        let age = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let level = !u32::from_be_bytes(buf[4..8].try_into().unwrap());
        Self { age, level }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_level_ordering_younger_first() {
        let young = AgeLevel::new(0, 3).encode();
        let old = AgeLevel::new(1, 0).encode();
        assert!(young < old, "age 0 must sort before age 1");
    }

    #[test]
    fn age_level_ordering_larger_level_first_within_age() {
        let hi = AgeLevel::new(2, 9).encode();
        let lo = AgeLevel::new(2, 1).encode();
        assert!(hi < lo, "within an age, larger level must sort first");
    }

    #[test]
    fn age_level_roundtrip() {
        let al = AgeLevel::new(7, 42);
        let encoded = al.encode();
        assert_eq!(AgeLevel::decode(&encoded), al);
    }

    #[quickcheck_macros::quickcheck]
    fn age_level_encode_decode_roundtrip(age: u32, level: u32) -> bool {
        let al = AgeLevel::new(age, level);
        AgeLevel::decode(&al.encode()) == al
    }

    #[quickcheck_macros::quickcheck]
    fn age_level_encode_preserves_age_then_level_order(
        a_age: u32,
        a_level: u32,
        b_age: u32,
        b_level: u32,
    ) -> bool {
        let a = AgeLevel::new(a_age, a_level);
        let b = AgeLevel::new(b_age, b_level);
        let expect_key_order = if a_age != b_age {
            a_age.cmp(&b_age)
        } else {
            b_level.cmp(&a_level)
        };
        a.encode().cmp(&b.encode()) == expect_key_order
    }
}
