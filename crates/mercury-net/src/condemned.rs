//! Holding pen for channels that are going away but still have packets in
//! flight. A condemned channel is deleted once its unacked map drains, its
//! peer is known dead, or it sits idle past the age limit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mercury_core::packet::ChannelId;

use crate::channel::Channel;
use crate::lock;

pub struct CondemnedChannels {
    channels: Vec<Arc<Mutex<Channel>>>,
    /// Indexed channels stay findable by id so late packets can still
    /// deliver their acks.
    indexed: HashMap<ChannelId, Arc<Mutex<Channel>>>,
    age_limit: Duration,
}

impl CondemnedChannels {
    pub fn new(age_limit: Duration) -> Self {
        CondemnedChannels {
            channels: Vec::new(),
            indexed: HashMap::new(),
            age_limit,
        }
    }

    /// Take ownership of a condemned channel. Channels with nothing in
    /// flight are dropped on the spot.
    pub fn add(&mut self, channel: Arc<Mutex<Channel>>) {
        let (deletable, id) = {
            let ch = lock(&channel);
            debug_assert!(ch.is_condemned());
            (Self::should_delete(&ch), ch.id())
        };

        if deletable {
            tracing::debug!(id, "condemned channel deleted immediately");
            return;
        }

        if id != mercury_core::packet::CHANNEL_ID_NULL {
            self.indexed.insert(id, channel);
        } else {
            self.channels.push(channel);
        }
    }

    fn should_delete(channel: &Channel) -> bool {
        !channel.has_unacked_packets() || channel.has_remote_failed()
    }

    /// Sweep both collections, deleting every channel that has finished or
    /// timed out. Returns how many were deleted.
    pub fn delete_finished_channels(&mut self, now: Instant) -> usize {
        let age_limit = self.age_limit;
        let mut deleted = 0;

        let mut sweep = |channel: &Arc<Mutex<Channel>>| -> bool {
            let ch = lock(channel);
            if Self::should_delete(&ch) {
                deleted += 1;
                return false;
            }
            if ch.age(now) > age_limit {
                tracing::warn!(
                    channel = %ch,
                    age_ms = ch.age(now).as_millis() as u64,
                    "condemned channel timed out with unacked packets"
                );
                deleted += 1;
                return false;
            }
            true
        };

        self.channels.retain(|c| sweep(c));
        self.indexed.retain(|_, c| sweep(c));

        deleted
    }

    /// Late packets to an indexed condemned channel still find it here.
    pub fn find(&self, id: ChannelId) -> Option<Arc<Mutex<Channel>>> {
        self.indexed.get(&id).cloned()
    }

    /// Channels that must not be abandoned at shutdown.
    pub fn num_critical_channels(&self) -> usize {
        self.channels
            .iter()
            .chain(self.indexed.values())
            .filter(|c| lock(c).has_unacked_criticals())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.indexed.is_empty()
    }
}
