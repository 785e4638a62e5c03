// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use rand::seq::IteratorRandom;

///
/// Tracks how many times each outstanding task tag has been duplicated, and
/// picks the least-replicated tag when the engine has idle workers to feed.
///
/// Tags live in buckets keyed by their replication count: submitting a tag
/// moves it up one bucket, accepting its result discards it from wherever it
/// is. `maxreps` caps speculative duplication; `None` disables the cap, and
/// `Some(0)` disables duplication entirely.
///
#[derive(Clone, Debug)]
pub struct TagSet {
    tags: BTreeMap<u32, HashSet<String>>,
    maxreps: Option<u32>,
}

impl TagSet {
    pub fn new(maxreps: Option<u32>) -> TagSet {
        TagSet {
            tags: BTreeMap::new(),
            maxreps,
        }
    }

    /// True iff some tag sits below the replication cap.
    pub fn can_duplicate(&self) -> bool {
        match self.maxreps {
            Some(maxreps) => self
                .tags
                .iter()
                .any(|(&count, tags)| count < maxreps && !tags.is_empty()),
            None => self.tags.values().any(|tags| !tags.is_empty()),
        }
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }

    /// Drop any buckets left empty by `discard`.
    pub fn clean(&mut self) {
        self.tags.retain(|_, tags| !tags.is_empty());
    }

    fn find_tag_group(&self, tag: &str) -> Option<u32> {
        self.tags
            .iter()
            .find(|(_, tags)| tags.contains(tag))
            .map(|(&count, _)| count)
    }

    ///
    /// Record one submission of `tag`: move it up one bucket if it is already
    /// tracked, otherwise insert it at `start_count`.
    ///
    pub fn add(&mut self, tag: &str, start_count: u32) {
        match self.find_tag_group(tag) {
            None => {
                self.tags.entry(start_count).or_default().insert(tag.to_owned());
            }
            Some(count) => {
                self.tags.entry(count + 1).or_default().insert(tag.to_owned());
                let emptied = {
                    let bucket = self.tags.get_mut(&count).unwrap();
                    bucket.remove(tag);
                    bucket.is_empty()
                };
                if emptied {
                    self.tags.remove(&count);
                }
            }
        }
    }

    ///
    /// A uniformly random tag from the lowest-count nonempty bucket, or None
    /// if no tags are tracked.
    ///
    pub fn select(&self) -> Option<String> {
        self.tags
            .iter()
            .find(|(_, tags)| !tags.is_empty())
            .and_then(|(_, tags)| tags.iter().choose(&mut rand::thread_rng()).cloned())
    }

    /// Remove the tag from whichever bucket holds it.
    pub fn discard(&mut self, tag: &str) {
        if let Some(count) = self.find_tag_group(tag) {
            self.tags.get_mut(&count).unwrap().remove(tag);
        }
    }

    pub fn len(&self) -> usize {
        self.tags.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sizes: Vec<String> = self
            .tags
            .iter()
            .map(|(count, tags)| format!("{}: {}", count, tags.len()))
            .collect();
        write!(
            f,
            "<TagSet(maxreps={:?}): {{{}}}>",
            self.maxreps,
            sizes.join(", ")
        )
    }
}

#[cfg(test)]
mod tests;
