//! Core types for Manifold
//!
//! Defines the value types every other crate speaks in: keys, version stamps,
//! wrap-around counters, key ranges, node handles and manifold scopes.

use crate::error::ManifoldError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Immutable, non-empty byte key with dictionary ordering.
///
/// Bytes compare as unsigned values, index by index. When one key is a strict
/// prefix of the other, the shorter key sorts first.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct ByteKey(Vec<u8>);

impl ByteKey {
    /// Build a key from a copy of `bytes`. Empty input is rejected.
    pub fn new(bytes: &[u8]) -> Result<Self, ManifoldError> {
        if bytes.is_empty() {
            return Err(ManifoldError::InvalidKey);
        }
        Ok(ByteKey(bytes.to_vec()))
    }

    /// Build a key from a string's UTF-8 bytes.
    pub fn from_str_key(s: &str) -> Result<Self, ManifoldError> {
        Self::new(s.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Copy of the key's bytes; the key itself never changes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false: keys have at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn byte_at(&self, index: usize) -> Option<u8> {
        self.0.get(index).copied()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl TryFrom<Vec<u8>> for ByteKey {
    type Error = ManifoldError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if bytes.is_empty() {
            return Err(ManifoldError::InvalidKey);
        }
        Ok(ByteKey(bytes))
    }
}

impl From<ByteKey> for Vec<u8> {
    fn from(key: ByteKey) -> Self {
        key.0
    }
}

impl fmt::Display for ByteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{}", s),
            _ => write!(f, "0x{}", self.to_hex()),
        }
    }
}

impl fmt::Debug for ByteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteKey({})", self)
    }
}

/// 16-byte, totally ordered commit version.
///
/// The first eight bytes hold a big-endian logical counter and the last eight
/// a big-endian node tag, so byte order equals (counter, node) order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionStamp([u8; 16]);

impl VersionStamp {
    pub const LEN: usize = 16;
    pub const ZERO: VersionStamp = VersionStamp([0u8; 16]);

    /// Build a stamp from exactly 16 bytes.
    pub fn new(bytes: &[u8]) -> Result<Self, ManifoldError> {
        if bytes.len() != Self::LEN {
            return Err(ManifoldError::InvalidStamp { len: bytes.len() });
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(bytes);
        Ok(VersionStamp(arr))
    }

    pub fn from_parts(counter: u64, node_tag: u64) -> Self {
        let mut arr = [0u8; 16];
        arr[..8].copy_from_slice(&counter.to_be_bytes());
        arr[8..].copy_from_slice(&node_tag.to_be_bytes());
        VersionStamp(arr)
    }

    pub fn counter(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(buf)
    }

    pub fn node_tag(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[8..]);
        u64::from_be_bytes(buf)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}.{:x}", self.counter(), self.node_tag())
    }
}

impl fmt::Debug for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionStamp(0x{})", self.to_hex())
    }
}

/// 64-bit counter that wraps around.
///
/// Comparison is the signed difference of the two values, taken with wrapping
/// arithmetic, so counters on either side of the integer boundary compare as
/// neighbours. This is not a total order and is deliberately not `Ord`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct SequenceCounter(u64);

impl SequenceCounter {
    pub const MIN: SequenceCounter = SequenceCounter(u64::MIN);
    pub const MAX: SequenceCounter = SequenceCounter(u64::MAX);

    pub fn new(value: u64) -> Self {
        SequenceCounter(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Next counter, wrapping to zero after `u64::MAX`.
    pub fn inc(self) -> Self {
        SequenceCounter(self.0.wrapping_add(1))
    }

    /// Big-endian encoding.
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// `self - other` as a signed, wrapping difference. `MAX.compare(&MIN)`
    /// is `-1`: `MAX` is the counter just before `MIN`.
    pub fn compare(&self, other: &SequenceCounter) -> i64 {
        self.0.wrapping_sub(other.0) as i64
    }

    /// Same as [`compare`](Self::compare), mapped onto `Ordering`.
    pub fn wrapping_cmp(&self, other: &SequenceCounter) -> Ordering {
        self.compare(other).cmp(&0)
    }

    /// True if `self` is behind `other` by less than half the ring.
    pub fn circle_lt(self, other: SequenceCounter) -> bool {
        other.0.wrapping_sub(self.0).wrapping_sub(1) < u64::MAX / 2 - 1
    }

    pub fn circle_lt_eq(self, other: SequenceCounter) -> bool {
        other.0.wrapping_sub(self.0) < u64::MAX / 2
    }
}

impl fmt::Display for SequenceCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Debug for SequenceCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SequenceCounter({})", self.0)
    }
}

/// Closed interval of keys, `start <= end`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    start: ByteKey,
    end: ByteKey,
}

impl KeyRange {
    pub fn new(start: ByteKey, end: ByteKey) -> Result<Self, ManifoldError> {
        if start > end {
            return Err(ManifoldError::InvalidState(format!(
                "range start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Range holding exactly one key.
    pub fn point(key: ByteKey) -> Self {
        Self {
            start: key.clone(),
            end: key,
        }
    }

    pub fn start(&self) -> &ByteKey {
        &self.start
    }

    pub fn end(&self) -> &ByteKey {
        &self.end
    }

    pub fn contains(&self, key: &ByteKey) -> bool {
        &self.start <= key && key <= &self.end
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyRange{}", self)
    }
}

/// Address of a node on the message fabric.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeHandle(pub u64);

impl NodeHandle {
    pub fn new(id: u64) -> Self {
        NodeHandle(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{:016x}", self.0)
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHandle({:016x})", self.0)
    }
}

/// Operational scope a component instance runs at, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifoldClass {
    /// The entire deployment. Not really supported at this time.
    Multisite,
    /// A deployment site, with low-latency inter-machine communication.
    Site,
    Machine,
    Thread,
}

impl ManifoldClass {
    /// Only thread-scoped components may share memory by reference.
    pub fn shares_memory(&self) -> bool {
        matches!(self, ManifoldClass::Thread)
    }

    pub fn requires_message_passing(&self) -> bool {
        !self.shares_memory()
    }

    /// True if `self` is the same scope as `inner` or encloses it.
    pub fn contains(&self, inner: ManifoldClass) -> bool {
        *self <= inner
    }

    /// Next scope inward, `None` at thread level.
    pub fn inner(&self) -> Option<ManifoldClass> {
        match self {
            ManifoldClass::Multisite => Some(ManifoldClass::Site),
            ManifoldClass::Site => Some(ManifoldClass::Machine),
            ManifoldClass::Machine => Some(ManifoldClass::Thread),
            ManifoldClass::Thread => None,
        }
    }
}

impl fmt::Display for ManifoldClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManifoldClass::Multisite => "multisite",
            ManifoldClass::Site => "site",
            ManifoldClass::Machine => "machine",
            ManifoldClass::Thread => "thread",
        };
        write!(f, "{}", name)
    }
}

/// Transaction priority. Ordering is the signed difference of the two values.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Priority(pub i16);

impl Priority {
    pub const NORMAL: Priority = Priority(0);

    pub fn new(priority: i16) -> Self {
        Priority(priority)
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.0 as i32 - other.0 as i32).cmp(&0)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Priority({})", self.0)
    }
}

/// Timestamp in milliseconds since Unix epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp_millis() as u64)
    }

    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Stored value bytes.
pub type Value = Vec<u8>;

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ByteKey {
        ByteKey::from_str_key(s).unwrap()
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(ByteKey::new(b""), Err(ManifoldError::InvalidKey)));
        assert!(ByteKey::try_from(Vec::new()).is_err());
    }

    #[test]
    fn test_key_ordering() {
        assert!(key("ab") < key("abc"));
        assert!(key("abc") > key("ab"));
        assert!(key("abd") > key("abc"));
        assert_eq!(key("abc").cmp(&key("abc")), Ordering::Equal);
        assert_eq!(key("abc"), ByteKey::new(b"abc").unwrap());

        // unsigned byte comparison: 0xff sorts after 0x01
        let high = ByteKey::new(&[0xff]).unwrap();
        let low = ByteKey::new(&[0x01]).unwrap();
        assert!(low < high);
    }

    #[test]
    fn test_key_ordering_is_transitive() {
        let keys = [key("a"), key("aa"), key("ab"), key("b"), key("ba")];
        for a in &keys {
            for b in &keys {
                assert_eq!(a.cmp(b) == Ordering::Equal, a == b);
                assert_eq!(a.cmp(b), b.cmp(a).reverse());
                for c in &keys {
                    if a < b && b < c {
                        assert!(a < c);
                    }
                }
            }
        }
    }

    #[test]
    fn test_key_bytes_are_copied() {
        let k = key("abc");
        let mut bytes = k.to_bytes();
        bytes[0] = b'z';
        assert_eq!(k.as_bytes(), b"abc");
    }

    #[test]
    fn test_key_deserialize_rejects_empty() {
        let bytes = bincode::serialize(&Vec::<u8>::new()).unwrap();
        assert!(bincode::deserialize::<ByteKey>(&bytes).is_err());
    }

    #[test]
    fn test_stamp_length() {
        for len in 0..40 {
            let bytes = vec![7u8; len];
            let result = VersionStamp::new(&bytes);
            if len == 16 {
                assert_eq!(result.unwrap(), VersionStamp::new(&bytes).unwrap());
            } else {
                assert!(matches!(result, Err(ManifoldError::InvalidStamp { len: l }) if l == len));
            }
        }
    }

    #[test]
    fn test_stamp_parts_order() {
        let a = VersionStamp::from_parts(1, 9);
        let b = VersionStamp::from_parts(2, 1);
        let c = VersionStamp::from_parts(2, 3);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(c.counter(), 2);
        assert_eq!(c.node_tag(), 3);
        assert!(VersionStamp::ZERO < a);
    }

    #[test]
    fn test_counter_wraparound() {
        // MAX is directly behind MIN on the ring: they are neighbours, not
        // maximally distant.
        assert_eq!(SequenceCounter::MAX.compare(&SequenceCounter::MIN), -1);
        assert_eq!(SequenceCounter::MIN.compare(&SequenceCounter::MAX), 1);
        assert_eq!(SequenceCounter::MAX.inc(), SequenceCounter::MIN);
        assert!(SequenceCounter::MAX.circle_lt(SequenceCounter::MIN));
        assert!(!SequenceCounter::MIN.circle_lt(SequenceCounter::MAX));
    }

    #[test]
    fn test_counter_compare() {
        let a = SequenceCounter::new(10);
        let b = SequenceCounter::new(12);
        assert_eq!(a.compare(&b), -2);
        assert_eq!(b.wrapping_cmp(&a), Ordering::Greater);
        assert!(a.circle_lt(b));
        assert!(a.circle_lt_eq(a));
        assert!(!a.circle_lt(a));
        assert_eq!(SequenceCounter::new(1).to_bytes(), [0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_key_range() {
        let range = KeyRange::new(key("k1"), key("k5")).unwrap();
        assert!(range.contains(&key("k3")));
        assert!(range.contains(&key("k5")));
        assert!(!range.contains(&key("k6")));
        assert!(range.overlaps(&KeyRange::point(key("k3"))));
        assert!(!range.overlaps(&KeyRange::point(key("k6"))));
        assert!(KeyRange::new(key("b"), key("a")).is_err());
    }

    #[test]
    fn test_manifold_scopes() {
        assert!(ManifoldClass::Thread.shares_memory());
        assert!(ManifoldClass::Machine.requires_message_passing());
        assert!(ManifoldClass::Site.contains(ManifoldClass::Thread));
        assert!(!ManifoldClass::Thread.contains(ManifoldClass::Machine));
        assert_eq!(ManifoldClass::Machine.inner(), Some(ManifoldClass::Thread));
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::new(-3) < Priority::new(2));
        assert!(Priority::new(i16::MAX) > Priority::new(i16::MIN));
    }
}
