//! Message identifiers.

use std::num::NonZeroU32;

/// Unique identifier for a message.
///
/// UIDs are persistent identifiers that don't change when messages are expunged,
/// and they grow with every message delivered to the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(pub NonZeroU32);

impl Uid {
    /// Creates a new UID.
    ///
    /// Returns `None` if the value is 0.
    #[must_use]
    pub fn new(n: u32) -> Option<Self> {
        NonZeroU32::new(n).map(Self)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// Returns the next UID, or `None` at `u32::MAX`.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of UIDs, written on the wire as compact ranges (`1:3,7,9:10`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UidSet {
    uids: Vec<Uid>,
}

impl UidSet {
    /// Builds a set from any collection of UIDs. Duplicates are removed.
    #[must_use]
    pub fn new(uids: impl IntoIterator<Item = Uid>) -> Self {
        let mut uids: Vec<Uid> = uids.into_iter().collect();
        uids.sort_unstable();
        uids.dedup();
        Self { uids }
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    /// Number of UIDs in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.uids.len()
    }

    /// Returns true if the set contains `uid`.
    #[must_use]
    pub fn contains(&self, uid: Uid) -> bool {
        self.uids.binary_search(&uid).is_ok()
    }

    /// Iterates over the UIDs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Uid> + '_ {
        self.uids.iter().copied()
    }
}

impl std::fmt::Display for UidSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut iter = self.uids.iter().map(|uid| uid.get()).peekable();
        let mut first = true;
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}:{end}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn uids(values: &[u32]) -> Vec<Uid> {
        values.iter().map(|&n| Uid::new(n).unwrap()).collect()
    }

    #[test]
    fn uid_rejects_zero() {
        assert!(Uid::new(0).is_none());
        assert_eq!(Uid::new(42).unwrap().get(), 42);
        assert_eq!(Uid::new(42).unwrap().next(), Uid::new(43));
        assert_eq!(Uid::new(u32::MAX).unwrap().next(), None);
    }

    #[test]
    fn set_compresses_ranges() {
        let set = UidSet::new(uids(&[9, 1, 2, 3, 7, 10, 2]));
        assert_eq!(set.to_string(), "1:3,7,9:10");
        assert_eq!(set.len(), 6);
        assert!(set.contains(Uid::new(7).unwrap()));
        assert!(!set.contains(Uid::new(8).unwrap()));
    }

    #[test]
    fn single_uid() {
        let set = UidSet::new(uids(&[101]));
        assert_eq!(set.to_string(), "101");
    }
}
