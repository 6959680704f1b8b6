//! Tracks the single active conversation.
//!
//! Direct and group selection are mutually exclusive: the active target is
//! one `Target` value, so choosing a peer necessarily drops the group and
//! vice versa. Every call publishes a new [`Selection`] with a fresh
//! generation, even when the same id is selected again, so subscribers
//! can treat each one as a switch.

use std::fmt;

use serde::Serialize;
use tokio::sync::watch;

use crate::models::{GroupId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum Target {
    Direct(UserId),
    Group(GroupId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Direct(id) => write!(f, "user {id}"),
            Target::Group(id) => write!(f, "group {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub target: Option<Target>,
    pub generation: u64,
}

pub struct ConversationSelector {
    tx: watch::Sender<Selection>,
}

impl ConversationSelector {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Selection {
            target: None,
            generation: 0,
        });
        Self { tx }
    }

    pub fn select_direct(&self, peer: UserId) -> Selection {
        self.transition(Some(Target::Direct(peer)))
    }

    pub fn select_group(&self, group: GroupId) -> Selection {
        self.transition(Some(Target::Group(group)))
    }

    pub fn select(&self, target: Target) -> Selection {
        self.transition(Some(target))
    }

    pub fn clear(&self) -> Selection {
        self.transition(None)
    }

    pub fn current(&self) -> Selection {
        *self.tx.borrow()
    }

    pub fn active(&self) -> Option<Target> {
        self.tx.borrow().target
    }

    pub fn subscribe(&self) -> watch::Receiver<Selection> {
        self.tx.subscribe()
    }

    fn transition(&self, target: Option<Target>) -> Selection {
        let mut next = self.current();
        self.tx.send_modify(|selection| {
            selection.target = target;
            selection.generation += 1;
            next = *selection;
        });
        tracing::debug!(conversation = ?next.target, generation = next.generation, "conversation selected");
        next
    }
}

impl Default for ConversationSelector {
    fn default() -> Self {
        Self::new()
    }
}
