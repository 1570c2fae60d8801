use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::codec::with_id_suffix;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameOrigin {
    /// Written by a download of a remote item.
    Remote,
    /// Found locally and pushed (or being pushed) to the remote folder.
    Local { linked_at: Option<Instant> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameClaim {
    pub item_id: Option<String>,
    pub origin: NameOrigin,
}

/// Which remote item (or local upload) owns each file name in the download directory.
#[derive(Debug, Default)]
pub struct NameRegistry {
    claims: Mutex<HashMap<String, NameClaim>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn claims(&self) -> MutexGuard<'_, HashMap<String, NameClaim>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Picks the local name for `item_id` and claims it. A name owned by another item gets the
    /// id suffix; an item keeps whichever name it was given first.
    pub fn claim_remote(&self, canonical: &str, item_id: &str) -> String {
        let mut claims = self.claims();
        if let Some((name, _)) = claims.iter().find(|(name, claim)| {
            claim.origin == NameOrigin::Remote
                && claim.item_id.as_deref() == Some(item_id)
                && (name.as_str() == canonical || **name == with_id_suffix(canonical, item_id))
        }) {
            return name.clone();
        }

        let name = match claims.get(canonical) {
            Some(claim) if claim.item_id.as_deref() != Some(item_id) => {
                with_id_suffix(canonical, item_id)
            }
            _ => canonical.to_string(),
        };
        claims.insert(
            name.clone(),
            NameClaim {
                item_id: Some(item_id.to_string()),
                origin: NameOrigin::Remote,
            },
        );
        name
    }

    pub fn claim_local(&self, name: &str) {
        self.claims().insert(
            name.to_string(),
            NameClaim {
                item_id: None,
                origin: NameOrigin::Local { linked_at: None },
            },
        );
    }

    pub fn assign_item(&self, name: &str, item_id: &str) {
        if let Some(claim) = self.claims().get_mut(name) {
            claim.item_id = Some(item_id.to_string());
        }
    }

    pub fn mark_linked(&self, name: &str, at: Instant) {
        if let Some(claim) = self.claims().get_mut(name) {
            if let NameOrigin::Local { linked_at } = &mut claim.origin {
                *linked_at = Some(at);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<NameClaim> {
        self.claims().get(name).cloned()
    }

    pub fn is_remote(&self, name: &str) -> bool {
        self.claims()
            .get(name)
            .is_some_and(|claim| claim.origin == NameOrigin::Remote)
    }

    pub fn linked_since(&self, name: &str, since: Instant) -> bool {
        self.claims().get(name).is_some_and(|claim| {
            matches!(claim.origin, NameOrigin::Local { linked_at: Some(at) } if at >= since)
        })
    }

    pub fn release(&self, name: &str) {
        self.claims().remove(name);
    }

    /// Drops claims of items no longer listed remotely, and local claims the listing has caught
    /// up with.
    pub fn retain_listed(&self, listed: &HashSet<String>, expected: &HashSet<String>) {
        self.claims().retain(|name, claim| match claim.origin {
            NameOrigin::Remote => claim
                .item_id
                .as_ref()
                .is_some_and(|id| listed.contains(id)),
            NameOrigin::Local { .. } => !expected.contains(name),
        });
    }
}
