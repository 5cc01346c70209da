//! Globally unique identifier generation for derived objects.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::{NodeError, Result};

pub const MAX_UID_LEN: usize = 64;

/// How many issued and observed UIDs are remembered for the collision check
pub const SEEN_UID_CAPACITY: usize = 65_536;

/// Issues DICOM UIDs that are unique for the life of the process.
///
/// With a root the layout is `<root>.<session millis>.<entropy>.<counter>`: the counter makes
/// every UID of this generator distinct, session time plus 32 random bits separate generators.
/// Without a root, `2.25.<uuid>` UIDs are issued. The most recent issued and observed UIDs are
/// remembered so a repeat is caught before it leaves the process; the oldest are forgotten once
/// the memory is full.
#[derive(Debug)]
pub struct UidGenerator {
    root: Option<String>,
    session: u64,
    entropy: u32,
    counter: AtomicU64,
    seen: Mutex<RecentUids>,
}

impl UidGenerator {
    pub fn new(root: Option<&str>) -> Self {
        Self::with_memory(root, SEEN_UID_CAPACITY)
    }

    /// Generator remembering at most `capacity` UIDs
    pub fn with_memory(root: Option<&str>, capacity: usize) -> Self {
        let session = chrono::Utc::now().timestamp_millis().max(1) as u64;
        let entropy = (Uuid::new_v4().as_u128() >> 96) as u32;
        Self {
            root: root
                .map(|r| r.trim_end_matches('.').to_string())
                .filter(|r| !r.is_empty()),
            session,
            entropy,
            counter: AtomicU64::new(1),
            seen: Mutex::new(RecentUids::new(capacity)),
        }
    }

    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// Record a UID that arrived from elsewhere so it is never issued.
    pub fn observe(&self, uid: &str) {
        self.seen_set().insert(uid);
    }

    pub fn is_known(&self, uid: &str) -> bool {
        self.seen_set().contains(uid)
    }

    /// Number of UIDs currently remembered
    pub fn remembered(&self) -> usize {
        self.seen_set().len()
    }

    /// Issue a fresh UID. A candidate that was already seen is regenerated once;
    /// a second hit means the generator itself is broken.
    pub fn generate(&self) -> Result<String> {
        let first = self.candidate()?;
        if self.claim(&first) {
            return Ok(first);
        }
        warn!("Generated UID {} was already known, regenerating", first);

        let second = self.candidate()?;
        if self.claim(&second) {
            return Ok(second);
        }
        Err(NodeError::IdentifierCollision(format!(
            "generated UID {} collided twice in a row",
            second
        )))
    }

    fn claim(&self, uid: &str) -> bool {
        self.seen_set().insert(uid)
    }

    fn candidate(&self) -> Result<String> {
        match &self.root {
            Some(root) => {
                let counter = self.counter.fetch_add(1, Ordering::Relaxed);
                self.rooted(root, counter)
            }
            None => Ok(format!("2.25.{}", Uuid::new_v4().as_u128())),
        }
    }

    fn rooted(&self, root: &str, counter: u64) -> Result<String> {
        let uid = format!("{}.{}.{}.{}", root, self.session, self.entropy, counter);
        if uid.len() > MAX_UID_LEN {
            return Err(NodeError::IdentifierCollision(format!(
                "UID space of root {} exhausted",
                root
            )));
        }
        Ok(uid)
    }

    fn seen_set(&self) -> std::sync::MutexGuard<'_, RecentUids> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Set of UIDs that forgets the oldest entry once full
#[derive(Debug)]
struct RecentUids {
    capacity: usize,
    members: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentUids {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            members: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// False when the UID is already remembered
    fn insert(&mut self, uid: &str) -> bool {
        if self.members.contains(uid) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(uid.to_string());
        self.order.push_back(uid.to_string());
        true
    }

    fn contains(&self, uid: &str) -> bool {
        self.members.contains(uid)
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Syntax check for a DICOM UID
pub fn is_valid_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= MAX_UID_LEN
        && uid.split('.').all(|c| {
            !c.is_empty() && c.chars().all(|d| d.is_ascii_digit()) && (c == "0" || !c.starts_with('0'))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "1.2.826.0.1.3680043.8.498";

    #[test]
    fn generated_uids_are_distinct_and_valid() {
        let generator = UidGenerator::new(Some(ROOT));
        let mut all = HashSet::new();
        for _ in 0..10_000 {
            let uid = generator.generate().unwrap();
            assert!(uid.starts_with(ROOT));
            assert!(is_valid_uid(&uid), "invalid uid {}", uid);
            assert!(all.insert(uid));
        }
    }

    #[test]
    fn uuid_uids_without_root() {
        let generator = UidGenerator::new(None);
        let a = generator.generate().unwrap();
        let b = generator.generate().unwrap();
        assert!(a.starts_with("2.25."));
        assert!(is_valid_uid(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn trailing_dot_in_root_is_ignored() {
        let generator = UidGenerator::new(Some("1.2.3."));
        let uid = generator.generate().unwrap();
        assert!(uid.starts_with("1.2.3."));
        assert!(!uid.contains(".."));
    }

    #[test]
    fn separate_generators_do_not_overlap() {
        let a = UidGenerator::new(Some(ROOT));
        let b = UidGenerator::new(Some(ROOT));
        let from_a: HashSet<_> = (0..100).map(|_| a.generate().unwrap()).collect();
        assert!((0..100).all(|_| !from_a.contains(&b.generate().unwrap())));
    }

    #[test]
    fn observed_uid_is_skipped() {
        let generator = UidGenerator::new(Some(ROOT));
        let next = generator.rooted(ROOT, 1).unwrap();
        generator.observe(&next);

        let uid = generator.generate().unwrap();
        assert_ne!(uid, next);
        assert_eq!(uid, generator.rooted(ROOT, 2).unwrap());
    }

    #[test]
    fn repeated_collision_is_fatal() {
        let generator = UidGenerator::new(Some(ROOT));
        generator.observe(&generator.rooted(ROOT, 1).unwrap());
        generator.observe(&generator.rooted(ROOT, 2).unwrap());

        let err = generator.generate().unwrap_err();
        assert!(matches!(err, NodeError::IdentifierCollision(_)));

        // the generator moves on afterwards
        assert_eq!(generator.generate().unwrap(), generator.rooted(ROOT, 3).unwrap());
    }

    #[test]
    fn memory_stays_bounded() {
        let generator = UidGenerator::with_memory(Some(ROOT), 100);
        for i in 0..1_000 {
            generator.observe(&format!("1.2.3.{}", i));
            generator.generate().unwrap();
        }
        assert_eq!(generator.remembered(), 100);
        assert!(generator.is_known("1.2.3.999"));
        assert!(!generator.is_known("1.2.3.0"));

        // a recently observed UID is still skipped
        let next = generator.rooted(ROOT, 1_001).unwrap();
        generator.observe(&next);
        assert_eq!(generator.generate().unwrap(), generator.rooted(ROOT, 1_002).unwrap());
    }

    #[test]
    fn uid_syntax() {
        assert!(is_valid_uid("1.2.840.10008.1.1"));
        assert!(is_valid_uid("1.2.0.3"));
        assert!(!is_valid_uid("1.2.03"));
        assert!(!is_valid_uid("1..2"));
        assert!(!is_valid_uid("1.2.a"));
        assert!(!is_valid_uid(""));
    }
}
