//! Subscriber registry and the broadcast-and-prune sweep.
//!
//! The registry keeps subscribers in registration order and removes one only
//! when a delivery to it fails. Records live in index-stable slots: a sweep
//! empties a failed slot in place and compacts the slots once at the end, so
//! pruning any number of subscribers costs a single pass. Locking is the
//! caller's job: the hub wraps the whole registry in a single mutex and holds
//! it for an entire sweep.

use std::{fmt, future::Future};

use tracing::{debug, warn};

use crate::message::Message;

/// One outbound connection able to hand a message to a subscriber.
pub trait Deliver: Send {
    /// Returns `false` on any transport error or non-OK reply.
    fn deliver(&mut self, message: &Message) -> impl Future<Output = bool> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct Subscriber<L> {
    id: SubscriberId,
    endpoint: String,
    link: L,
}

impl<L> Subscriber<L> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: Vec<SubscriberId>,
}

pub struct Registry<L> {
    /// `None` marks a record pruned by a sweep that has not compacted yet.
    slots: Vec<Option<Subscriber<L>>>,
    live: usize,
    next_id: u64,
}

impl<L> Default for Registry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> Registry<L> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            live: 0,
            next_id: 1,
        }
    }

    /// Appends a subscriber. Duplicate endpoints are kept as separate records.
    pub fn register(&mut self, endpoint: impl Into<String>, link: L) -> SubscriberId {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.slots.push(Some(Subscriber {
            id,
            endpoint: endpoint.into(),
            link,
        }));
        self.live += 1;
        id
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.iter().any(|subscriber| subscriber.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscriber<L>> {
        self.slots.iter().flatten()
    }

    /// Empties the slot at `position`, dropping its link.
    fn prune(&mut self, position: usize) -> Option<Subscriber<L>> {
        let removed = self.slots.get_mut(position)?.take()?;
        self.live -= 1;
        Some(removed)
    }

    fn compact(&mut self) {
        if self.slots.len() != self.live {
            self.slots.retain(Option::is_some);
        }
    }
}

impl<L: Deliver> Registry<L> {
    /// Delivers `message` to every subscriber in order, dropping the ones
    /// whose delivery fails.
    ///
    /// Positions stay fixed for the whole sweep, so the successor of a pruned
    /// entry is visited next and no entry is visited twice. Dropping the
    /// returned future midway leaves every unvisited subscriber registered;
    /// slots it already emptied are compacted by the next sweep.
    pub async fn broadcast(&mut self, message: &Message) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for position in 0..self.slots.len() {
            let Some(subscriber) = self.slots[position].as_mut() else {
                continue;
            };
            if subscriber.link.deliver(message).await {
                debug!(subscriber = %subscriber.id, endpoint = %subscriber.endpoint, "delivered");
                report.delivered += 1;
            } else if let Some(removed) = self.prune(position) {
                warn!(
                    subscriber = %removed.id,
                    endpoint = %removed.endpoint,
                    "delivery failed, removing subscriber"
                );
                report.pruned.push(removed.id);
            }
        }

        self.compact();
        report
    }
}
