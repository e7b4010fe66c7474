//! Rendezvous groups
//!
//! A group is the session two paired connections share; content sent by one
//! member is relayed to every other member. Groups are addressed by a
//! process-unique [`GroupId`] and looked up through the [`GroupIndex`], while
//! endpoints only hold the id of the group they belong to.
//!
//! Lifecycle: `Forming` (created, not yet indexed) → `Active` (two or more
//! members, indexed) → `Dissolved` (terminal). A group that drops to a single
//! member is dissolved and the survivor is disposed as well, so a pairing
//! always tears down completely once either side leaves.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use linkshare_core::Token;

use crate::messages::ServerMessage;
use crate::registry::Endpoint;

/// Process-unique group identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// Where a group is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupState {
    Forming,
    Active,
    Dissolved,
}

#[derive(Default)]
struct Members {
    by_token: HashMap<Token, Arc<Endpoint>>,
    dissolved: bool,
}

/// A pairing session
pub struct Group {
    id: GroupId,
    created_at: Instant,
    members: Mutex<Members>,
}

impl Group {
    fn new(id: GroupId) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            members: Mutex::new(Members::default()),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Add a member, replacing any previous member with the same token.
    ///
    /// The caller updates the endpoint's back-reference. Returns `false` if
    /// the group has already dissolved.
    pub fn add(&self, endpoint: Arc<Endpoint>) -> bool {
        let mut members = self.members.lock();
        if members.dissolved {
            return false;
        }
        members
            .by_token
            .insert(endpoint.token().to_string(), endpoint);
        info!("{} has {} members", self.id, members.by_token.len());
        true
    }

    /// Remove a member.
    ///
    /// Returns the remaining members, or `None` if `token` was not a member.
    /// Dropping to one member or fewer dissolves the group.
    pub fn remove(&self, token: &str) -> Option<Vec<Arc<Endpoint>>> {
        let mut members = self.members.lock();
        members.by_token.remove(token)?;

        if members.by_token.len() <= 1 {
            members.dissolved = true;
        }
        Some(members.by_token.values().cloned().collect())
    }

    /// Every member except `token`
    pub fn others(&self, token: &str) -> Vec<Arc<Endpoint>> {
        self.members
            .lock()
            .by_token
            .iter()
            .filter(|(t, _)| t.as_str() != token)
            .map(|(_, e)| Arc::clone(e))
            .collect()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.members.lock().by_token.contains_key(token)
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().by_token.len()
    }

    pub fn state(&self) -> GroupState {
        let members = self.members.lock();
        if members.dissolved {
            GroupState::Dissolved
        } else if members.by_token.len() >= 2 {
            GroupState::Active
        } else {
            GroupState::Forming
        }
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("members", &self.member_count())
            .finish()
    }
}

/// Index of every active group
#[derive(Debug, Default)]
pub struct GroupIndex {
    groups: DashMap<GroupId, Arc<Group>>,
    next_id: AtomicU64,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new, unindexed group
    pub fn create(&self) -> Arc<Group> {
        let id = GroupId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        Arc::new(Group::new(id))
    }

    /// Make a formed group discoverable
    pub fn publish(&self, group: Arc<Group>) {
        self.groups.insert(group.id(), group);
    }

    pub fn get(&self, id: GroupId) -> Option<Arc<Group>> {
        self.groups.get(&id).map(|g| Arc::clone(g.value()))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Remove `endpoint` from `group`, notify and close its connection, and
    /// cascade to the survivor if only one member is left.
    ///
    /// Never fails. If the endpoint has meanwhile moved on to another group,
    /// it is only dropped from this group's member list.
    pub fn dispose(&self, group: &Arc<Group>, endpoint: &Arc<Endpoint>) {
        let mut pending = vec![Arc::clone(endpoint)];

        while let Some(endpoint) = pending.pop() {
            let owned = endpoint.leave(group.id());
            let survivors = group.remove(endpoint.token());

            if let Some(survivors) = &survivors {
                if survivors.is_empty() {
                    self.groups.remove(&group.id());
                    info!(
                        "{} dissolved after {:?}",
                        group.id(),
                        group.created_at.elapsed()
                    );
                } else {
                    info!("{} has {} members", group.id(), survivors.len());
                }
            }

            if owned {
                endpoint.disconnect();
            }

            if let Some(survivors) = survivors {
                if survivors.len() == 1 {
                    debug!(
                        "{}: cascading disposal to {}",
                        group.id(),
                        survivors[0].token()
                    );
                    pending.extend(survivors);
                }
            }
        }
    }

    /// Deliver `msg` to every member except `sender`.
    ///
    /// A member that cannot be reached is disposed; the failure is not
    /// reported to the sender. Returns the number of successful deliveries.
    pub fn broadcast(&self, group: &Arc<Group>, sender: &str, msg: &ServerMessage) -> usize {
        let mut delivered = 0;

        for member in group.others(sender) {
            match member.send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!("Disposing unreachable member {}: {}", member.token(), e);
                    self.dispose(group, &member);
                }
            }
        }

        delivered
    }
}
