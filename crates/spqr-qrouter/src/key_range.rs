//! Key range - a half-open byte interval owned by a single shard.
//!
//! Bounds are raw bytes compared lexicographically. Ranges are kept
//! disjoint and non-empty by the routing map.

use serde::{Deserialize, Serialize};
use spqr_common::{Result, SpqrError};

/// Ownership of the interval `[lower, upper)` by one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Key range identifier, stable across split/merge where possible
    pub id: String,
    /// Owning shard
    pub shard_id: String,
    /// Inclusive lower bound
    pub lower: Vec<u8>,
    /// Exclusive upper bound
    pub upper: Vec<u8>,
    /// While locked, ownership and bounds are frozen
    pub locked: bool,
}

impl KeyRange {
    /// Create an unlocked range, rejecting empty intervals.
    pub fn new(id: String, shard_id: String, lower: Vec<u8>, upper: Vec<u8>) -> Result<Self> {
        if lower >= upper {
            return Err(SpqrError::BadBound(id));
        }
        Ok(Self {
            id,
            shard_id,
            lower,
            upper,
            locked: false,
        })
    }

    /// True if this range owns `key`.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.lower.as_slice() <= key && key < self.upper.as_slice()
    }

    /// True if the two intervals intersect.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.lower < other.upper && other.lower < self.upper
    }

    /// Split at `bound`, keeping the id on the lower half.
    ///
    /// The upper half receives `new_id`. Fails unless
    /// `lower < bound < upper`.
    pub fn split_at(&self, bound: &[u8], new_id: String) -> Result<(KeyRange, KeyRange)> {
        if bound <= self.lower.as_slice() || bound >= self.upper.as_slice() {
            return Err(SpqrError::BadBound(self.id.clone()));
        }

        let left = KeyRange {
            id: self.id.clone(),
            shard_id: self.shard_id.clone(),
            lower: self.lower.clone(),
            upper: bound.to_vec(),
            locked: self.locked,
        };
        let right = KeyRange {
            id: new_id,
            shard_id: self.shard_id.clone(),
            lower: bound.to_vec(),
            upper: self.upper.clone(),
            locked: self.locked,
        };

        Ok((left, right))
    }
}

/// Byte-wise midpoint of `[lower, upper)` for balancer splits.
///
/// Both bounds are treated as big-endian fractions; the result always
/// satisfies `lower < mid < upper` when the interval admits any interior
/// point at the produced width.
pub fn midpoint(lower: &[u8], upper: &[u8]) -> Vec<u8> {
    let width = lower.len().max(upper.len());

    let at = |bytes: &[u8], i: usize| -> u16 { bytes.get(i).copied().unwrap_or(0) as u16 };

    // Sum the two bounds digit by digit, then halve with a carried shift.
    let mut sum = Vec::with_capacity(width + 1);
    let mut carry = 0u16;
    for i in (0..width).rev() {
        let s = at(lower, i) + at(upper, i) + carry;
        sum.push((s & 0xff) as u8);
        carry = s >> 8;
    }
    sum.push(carry as u8);
    sum.reverse();

    let mut mid = Vec::with_capacity(width);
    let mut rem = 0u16;
    for b in &sum {
        let v = (rem << 8) | *b as u16;
        mid.push((v >> 1) as u8);
        rem = v & 1;
    }
    // Drop the leading overflow digit added above.
    mid.remove(0);

    if mid.as_slice() <= lower {
        // Adjacent bounds at this width; descend one level.
        mid.push(0x80);
    }
    mid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let kr = KeyRange::new("kr1".into(), "sh1".into(), vec![0x00], vec![0x80]).unwrap();
        assert!(kr.contains(&[0x00]));
        assert!(kr.contains(&[0x40]));
        assert!(kr.contains(&[0x7f, 0xff]));
        assert!(!kr.contains(&[0x80]));
        assert!(!kr.contains(&[0x90]));
    }

    #[test]
    fn test_empty_interval_rejected() {
        assert!(KeyRange::new("kr1".into(), "sh1".into(), vec![0x40], vec![0x40]).is_err());
        assert!(KeyRange::new("kr1".into(), "sh1".into(), vec![0x41], vec![0x40]).is_err());
    }

    #[test]
    fn test_split_at() {
        let kr = KeyRange::new("kr1".into(), "sh1".into(), vec![0x00], vec![0x80]).unwrap();
        let (left, right) = kr.split_at(&[0x40], "kr2".into()).unwrap();

        assert_eq!(left.id, "kr1");
        assert_eq!(left.lower, vec![0x00]);
        assert_eq!(left.upper, vec![0x40]);
        assert_eq!(right.id, "kr2");
        assert_eq!(right.lower, vec![0x40]);
        assert_eq!(right.upper, vec![0x80]);
        assert_eq!(left.shard_id, right.shard_id);
    }

    #[test]
    fn test_split_bound_out_of_range() {
        let kr = KeyRange::new("kr1".into(), "sh1".into(), vec![0x10], vec![0x80]).unwrap();
        assert!(kr.split_at(&[0x10], "x".into()).is_err());
        assert!(kr.split_at(&[0x80], "x".into()).is_err());
        assert!(kr.split_at(&[0x90], "x".into()).is_err());
    }

    #[test]
    fn test_overlaps() {
        let a = KeyRange::new("a".into(), "sh1".into(), vec![0x00], vec![0x40]).unwrap();
        let b = KeyRange::new("b".into(), "sh1".into(), vec![0x40], vec![0x80]).unwrap();
        let c = KeyRange::new("c".into(), "sh1".into(), vec![0x30], vec![0x50]).unwrap();

        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn test_midpoint() {
        let mid = midpoint(&[0x00], &[0x80]);
        assert_eq!(mid, vec![0x40]);

        let mid = midpoint(&[0x40], &[0x41]);
        assert!(mid.as_slice() > &[0x40][..]);
        assert!(mid.as_slice() < &[0x41][..]);

        let mid = midpoint(&[0x00, 0x10], &[0x00, 0x20]);
        assert_eq!(mid, vec![0x00, 0x18]);
    }
}
