// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::TagSet;

#[test]
fn add_moves_tags_up_one_bucket() {
    let mut tags = TagSet::new(Some(5));
    tags.add("a", 0);
    tags.add("b", 0);
    assert_eq!(2, tags.len());

    // Duplicating "a" leaves "b" as the only least-replicated tag.
    tags.add("a", 0);
    assert_eq!(2, tags.len());
    for _ in 0..10 {
        assert_eq!(Some("b".to_owned()), tags.select());
    }
}

#[test]
fn select_on_empty_returns_none() {
    let tags = TagSet::new(Some(5));
    assert_eq!(None, tags.select());
}

#[test]
fn select_prefers_the_lowest_bucket() {
    let mut tags = TagSet::new(Some(5));
    tags.add("hot", 0);
    tags.add("hot", 0);
    tags.add("hot", 0);
    tags.add("cold", 0);
    assert_eq!(Some("cold".to_owned()), tags.select());
}

#[test]
fn discard_removes_from_any_bucket() {
    let mut tags = TagSet::new(Some(5));
    tags.add("a", 0);
    tags.add("a", 0);
    tags.add("b", 0);
    tags.discard("a");
    assert_eq!(1, tags.len());
    tags.discard("missing");
    assert_eq!(1, tags.len());
    tags.clean();
    assert_eq!(Some("b".to_owned()), tags.select());
}

#[test]
fn can_duplicate_respects_maxreps() {
    let mut tags = TagSet::new(Some(2));
    assert!(!tags.can_duplicate());

    tags.add("a", 0);
    assert!(tags.can_duplicate());
    tags.add("a", 0);
    assert!(tags.can_duplicate());
    tags.add("a", 0);
    // "a" now sits in bucket 2 == maxreps.
    assert!(!tags.can_duplicate());
}

#[test]
fn maxreps_zero_disables_duplication() {
    let mut tags = TagSet::new(Some(0));
    tags.add("a", 0);
    assert!(!tags.can_duplicate());
}

#[test]
fn maxreps_none_is_unbounded() {
    let mut tags = TagSet::new(None);
    tags.add("a", 0);
    for _ in 0..100 {
        assert!(tags.can_duplicate());
        tags.add("a", 0);
    }
}

#[test]
fn clear_empties_everything() {
    let mut tags = TagSet::new(Some(5));
    tags.add("a", 0);
    tags.add("b", 1);
    tags.clear();
    assert!(tags.is_empty());
    assert!(!tags.can_duplicate());
}
