//! Append-only version chains.
//!
//! A [`Versioned`] value holds the currently effective version plus every
//! version it replaced. [`Versioned::supersede`] is the only way to change
//! it: the current version is retired (stamped with its end time and the id
//! of its successor) and moved into history, and the new version becomes
//! current. History entries are only ever handed out by shared reference.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A record that can take part in a supersession chain.
pub trait Supersedable {
    fn version_id(&self) -> &str;

    /// Stamp this version as replaced by `successor_id` at `at`.
    fn retire(&mut self, at: DateTime<Utc>, successor_id: &str);

    fn superseded_by(&self) -> Option<&str>;

    fn is_retired(&self) -> bool;
}

/// Current value plus retired history, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct Versioned<T> {
    current: T,
    history: Vec<T>,
}

/// Why a chain failed [`Versioned::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainDefect {
    /// The current version is marked as retired.
    CurrentRetired,
    /// A history entry is still marked active.
    ActiveInHistory { id: String },
    /// A history entry does not point at the version that follows it.
    BrokenLink { id: String, expected: String },
    /// The same id appears twice.
    Repeated { id: String },
}

impl<T: Supersedable> Versioned<T> {
    /// Start a chain from its first version.
    pub fn new(initial: T) -> Self {
        Self {
            current: initial,
            history: Vec::new(),
        }
    }

    /// Rebuild a chain from stored versions ordered oldest → newest.
    ///
    /// Returns `None` for an empty list. The result is not checked; call
    /// [`Versioned::verify`] when the source is untrusted.
    pub fn from_ordered(mut versions: Vec<T>) -> Option<Self> {
        let current = versions.pop()?;
        Some(Self {
            current,
            history: versions,
        })
    }

    pub fn current(&self) -> &T {
        &self.current
    }

    /// Retired versions, oldest first.
    pub fn history(&self) -> &[T] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Replace the current version. Returns the new current version and the
    /// retired one.
    pub fn supersede(&mut self, next: T, at: DateTime<Utc>) -> (&T, &T) {
        let mut previous = std::mem::replace(&mut self.current, next);
        previous.retire(at, self.current.version_id());
        self.history.push(previous);
        let retired = self.history.last().unwrap_or(&self.current);
        (&self.current, retired)
    }

    /// Iterate every version, oldest first, ending with the current one.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.history.iter().chain(std::iter::once(&self.current))
    }

    /// Check the chain is a single path: each retired version points at the
    /// next one, only the last is active, and no id repeats.
    pub fn verify(&self) -> Result<(), ChainDefect> {
        let mut seen = std::collections::HashSet::new();
        for v in self.iter() {
            if !seen.insert(v.version_id().to_string()) {
                return Err(ChainDefect::Repeated {
                    id: v.version_id().to_string(),
                });
            }
        }

        if self.current.is_retired() {
            return Err(ChainDefect::CurrentRetired);
        }

        let versions: Vec<&T> = self.iter().collect();
        for pair in versions.windows(2) {
            let (older, newer) = (pair[0], pair[1]);
            if !older.is_retired() {
                return Err(ChainDefect::ActiveInHistory {
                    id: older.version_id().to_string(),
                });
            }
            if older.superseded_by() != Some(newer.version_id()) {
                return Err(ChainDefect::BrokenLink {
                    id: older.version_id().to_string(),
                    expected: newer.version_id().to_string(),
                });
            }
        }
        Ok(())
    }
}

impl<T> Versioned<T> {
    pub fn into_parts(self) -> (T, Vec<T>) {
        (self.current, self.history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Note {
        id: String,
        until: Option<DateTime<Utc>>,
        next: Option<String>,
    }

    impl Note {
        fn new(id: &str) -> Self {
            Self {
                id: id.into(),
                until: None,
                next: None,
            }
        }
    }

    impl Supersedable for Note {
        fn version_id(&self) -> &str {
            &self.id
        }
        fn retire(&mut self, at: DateTime<Utc>, successor_id: &str) {
            self.until = Some(at);
            self.next = Some(successor_id.to_string());
        }
        fn superseded_by(&self) -> Option<&str> {
            self.next.as_deref()
        }
        fn is_retired(&self) -> bool {
            self.until.is_some()
        }
    }

    #[test]
    fn supersede_moves_current_into_history() {
        let mut chain = Versioned::new(Note::new("a"));
        let now = Utc::now();
        let (current, retired) = chain.supersede(Note::new("b"), now);
        assert_eq!(current.id, "b");
        assert_eq!(retired.id, "a");
        assert_eq!(retired.next.as_deref(), Some("b"));
        assert_eq!(retired.until, Some(now));

        chain.supersede(Note::new("c"), now);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.current().id, "c");
        let ids: Vec<_> = chain.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(chain.verify().is_ok());
    }

    #[test]
    fn verify_detects_fork() {
        let mut a = Note::new("a");
        a.retire(Utc::now(), "c");
        let mut b = Note::new("b");
        b.retire(Utc::now(), "c");
        let chain = Versioned::from_ordered(vec![a, b, Note::new("c")]).unwrap();
        assert!(matches!(chain.verify(), Err(ChainDefect::BrokenLink { id, .. }) if id == "a"));
    }

    #[test]
    fn verify_detects_two_active() {
        let chain = Versioned::from_ordered(vec![Note::new("a"), Note::new("b")]).unwrap();
        assert!(matches!(chain.verify(), Err(ChainDefect::ActiveInHistory { .. })));
    }

    #[test]
    fn from_ordered_empty_is_none() {
        assert!(Versioned::<Note>::from_ordered(vec![]).is_none());
    }
}
