//! Follow-list merging.
//!
//! A follow list travels as an ordered array of tags. [`FollowSet`] keys the
//! `p` tags by target identity so each profile appears once, and turns back
//! into a tag array only when a replacement event is built.

use std::collections::HashMap;

use crate::{
    error::FollowError,
    event::{Event, Identity, Tag},
};

/// Keyed view of a follow-list event's tags.
///
/// Follow tags are unique by target identity; any other tag is kept verbatim,
/// once. Output order is first-seen order with new targets appended.
#[derive(Debug, Clone, Default)]
pub struct FollowSet {
    follows: HashMap<Identity, (usize, Tag)>,
    others: Vec<(usize, Tag)>,
    next_seq: usize,
}

impl FollowSet {
    pub fn from_tags(tags: &[Tag]) -> Self {
        let mut set = FollowSet::default();
        for tag in tags {
            let seq = set.next_seq;
            match tag.follow_target() {
                Some(target) => {
                    // First occurrence wins so relay hints and petnames survive.
                    set.follows
                        .entry(target.to_string())
                        .or_insert_with(|| (seq, tag.clone()));
                }
                None => {
                    if !set.others.iter().any(|(_, t)| t == tag) {
                        set.others.push((seq, tag.clone()));
                    }
                }
            }
            set.next_seq += 1;
        }
        set
    }

    pub fn contains(&self, target: &str) -> bool {
        self.follows.contains_key(target)
    }

    /// Add `target`; returns `false` if it was already followed.
    pub fn insert(&mut self, target: &str) -> bool {
        if self.contains(target) {
            return false;
        }
        self.follows
            .insert(target.to_string(), (self.next_seq, Tag::follow(target)));
        self.next_seq += 1;
        true
    }

    /// Remove `target`; returns `false` if it was not followed.
    pub fn remove(&mut self, target: &str) -> bool {
        self.follows.remove(target).is_some()
    }

    pub fn len(&self) -> usize {
        self.follows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.follows.is_empty()
    }

    /// Followed identities in list order.
    pub fn identities(&self) -> Vec<Identity> {
        let mut entries: Vec<(usize, &Identity)> =
            self.follows.iter().map(|(id, (seq, _))| (*seq, id)).collect();
        entries.sort_unstable_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn into_tags(self) -> Vec<Tag> {
        let mut entries: Vec<(usize, Tag)> = self.follows.into_values().collect();
        entries.extend(self.others);
        entries.sort_unstable_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, tag)| tag).collect()
    }
}

/// Tags for a follow list that additionally follows `target`.
///
/// Adding a target that is already present leaves the set unchanged. Fails with
/// [`FollowError::NotReady`] until a baseline list has been retrieved.
pub fn compute_add_tags(current: Option<&Event>, target: &str) -> Result<Vec<Tag>, FollowError> {
    let event = current.ok_or(FollowError::NotReady)?;
    let mut set = FollowSet::from_tags(&event.tags);
    set.insert(target);
    Ok(set.into_tags())
}

/// Tags for a follow list with every `p` entry for `target` dropped.
pub fn compute_remove_tags(
    current: Option<&Event>,
    target: &str,
) -> Result<Vec<Tag>, FollowError> {
    let event = current.ok_or(FollowError::NotReady)?;
    let mut set = FollowSet::from_tags(&event.tags);
    set.remove(target);
    Ok(set.into_tags())
}

/// De-duplicated identities followed by `event`.
pub fn followed_identities(event: &Event) -> Vec<Identity> {
    FollowSet::from_tags(&event.tags).identities()
}
