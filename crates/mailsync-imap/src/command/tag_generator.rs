//! IMAP command tag generator.

/// Tag generator for IMAP commands.
///
/// Produces `A0001`, `A0002`, ... and wraps around after `A9999`
/// back to `A0001`; a tag only has to be unique among commands in flight,
/// and a session never has more than one.
#[derive(Debug, Clone)]
pub struct TagGenerator {
    counter: u32,
    prefix: char,
}

const TAG_WRAP: u32 = 10_000;

impl TagGenerator {
    /// Creates a new tag generator with the given prefix.
    #[must_use]
    pub const fn new(prefix: char) -> Self {
        Self { counter: 0, prefix }
    }

    /// Generates the next tag.
    pub fn next_tag(&mut self) -> String {
        self.counter = self.counter % (TAG_WRAP - 1) + 1;
        format!("{}{:04}", self.prefix, self.counter)
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new('A')
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

    #[test]
    fn sequential_tags() {
        let mut tags = TagGenerator::default();
        assert_eq!(tags.next_tag(), "A0001");
        assert_eq!(tags.next_tag(), "A0002");
    }

    #[test]
    fn wraps_without_zero() {
        let mut tags = TagGenerator::new('T');
        let mut last = String::new();
        for _ in 0..9999 {
            last = tags.next_tag();
        }
        assert_eq!(last, "T9999");
        assert_eq!(tags.next_tag(), "T0001");
    }
}
