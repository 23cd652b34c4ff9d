//! Membership diff: reduces a requested change to the additions and
//! removals that actually alter the user's state.

use std::collections::HashSet;

/// Effective change for one user, in first-occurrence order of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl MembershipDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Compute the effective diff of a request against the active set.
///
/// Additions keep only segments the user is not in; removals keep only
/// segments the user is in. Both sides are judged against the state
/// before the change, so a slug requested on both sides is removed when
/// active and added when not.
pub fn diff(
    requested_add: &[String],
    requested_remove: &[String],
    active: &[String],
) -> MembershipDiff {
    let active: HashSet<&str> = active.iter().map(String::as_str).collect();

    MembershipDiff {
        add: select(requested_add, |slug| !active.contains(slug)),
        remove: select(requested_remove, |slug| active.contains(slug)),
    }
}

fn select(requested: &[String], keep: impl Fn(&str) -> bool) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(requested.len());
    let mut selected = Vec::new();
    for slug in requested {
        if keep(slug.as_str()) && seen.insert(slug.as_str()) {
            selected.push(slug.clone());
        }
    }
    selected
}
