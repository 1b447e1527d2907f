//! Off-channel ("once-off") reliability.
//!
//! A reliable packet sent outside any channel is retransmitted on a fixed
//! period until the peer acks it or the retry budget runs out. The receiving
//! side acks every copy and suppresses duplicates with a two-generation
//! receipt set: a receipt lives through at least one full generation and at
//! most two, which bounds memory without ever forgetting a seq faster than
//! the sender can retry it.
//!
//! Fragment reassembly for off-channel bundles also lives here, keyed by
//! peer address; channels carry their own chain slot.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mercury_core::packet::{seq_mask, Packet, SeqNum};

struct OnceOffPacket {
    packet: Arc<Packet>,
    retries: u32,
    next_resend: Instant,
}

/// Unacked once-off reliable packets, keyed by destination and sequence.
pub struct OnceOffSender {
    packets: HashMap<(SocketAddr, SeqNum), OnceOffPacket>,
    resend_period: Duration,
    max_resends: u32,
}

impl OnceOffSender {
    pub fn new(resend_period: Duration, max_resends: u32) -> Self {
        OnceOffSender {
            packets: HashMap::new(),
            resend_period,
            max_resends,
        }
    }

    pub fn add_once_off_resend_timer(
        &mut self,
        addr: SocketAddr,
        seq: SeqNum,
        packet: Arc<Packet>,
        now: Instant,
    ) {
        self.packets.insert(
            (addr, seq),
            OnceOffPacket {
                packet,
                retries: 0,
                next_resend: now + self.resend_period,
            },
        );
    }

    /// Ack arrived; stop resending. False if the seq was not pending, which
    /// happens legitimately when the ack itself was duplicated.
    pub fn del_once_off_resend_timer(&mut self, addr: SocketAddr, seq: SeqNum) -> bool {
        self.packets.remove(&(addr, seq)).is_some()
    }

    /// Collect packets due for retransmission, dropping any that have
    /// exhausted their retries. The caller transmits the returned packets.
    pub fn process_resends(&mut self, now: Instant) -> Vec<(SocketAddr, Arc<Packet>)> {
        let mut due = Vec::new();

        self.packets.retain(|(addr, seq), entry| {
            if entry.next_resend > now {
                return true;
            }
            if entry.retries >= self.max_resends {
                tracing::warn!(
                    addr = %addr,
                    seq,
                    retries = entry.retries,
                    "once-off reliable packet abandoned"
                );
                return false;
            }
            entry.retries += 1;
            entry.next_resend = now + self.resend_period;
            due.push((*addr, entry.packet.clone()));
            true
        });

        due
    }

    /// The peer is gone; nothing it owes us will ever be acked.
    pub fn on_address_dead(&mut self, addr: SocketAddr) {
        let before = self.packets.len();
        self.packets.retain(|(a, _), _| *a != addr);
        let dropped = before - self.packets.len();
        if dropped > 0 {
            tracing::warn!(addr = %addr, dropped, "dropped unacked once-off packets for dead address");
        }
    }

    pub fn has_unacked_packets(&self) -> bool {
        !self.packets.is_empty()
    }

    pub fn num_unacked_packets(&self) -> usize {
        self.packets.len()
    }
}

/// A partially reassembled fragmented bundle.
pub struct FragmentedBundle {
    chain: Vec<Packet>,
    touched: Instant,
}

impl FragmentedBundle {
    pub fn new(packet: Packet, now: Instant) -> Self {
        FragmentedBundle {
            chain: vec![packet],
            touched: now,
        }
    }

    /// The sequence number the next fragment must carry.
    pub fn expected_seq(&self) -> SeqNum {
        let last = self.chain.last().map(|p| p.seq()).unwrap_or_default();
        seq_mask(last.wrapping_add(1))
    }

    /// Append the next in-order fragment. Some(chain) once complete.
    pub fn add(&mut self, packet: Packet, now: Instant) -> Option<Vec<Packet>> {
        debug_assert_eq!(packet.seq(), self.expected_seq());
        let (_, frag_end) = packet.fragment_range();
        let complete = packet.seq() == frag_end;
        self.chain.push(packet);
        self.touched = now;
        complete.then(|| std::mem::take(&mut self.chain))
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.touched)
    }
}

/// Receive-side once-off state: duplicate suppression and off-channel
/// fragment reassembly.
pub struct OnceOffReceiver {
    curr_receipts: HashSet<(SocketAddr, SeqNum)>,
    prev_receipts: HashSet<(SocketAddr, SeqNum)>,
    fragments: HashMap<SocketAddr, FragmentedBundle>,
}

impl OnceOffReceiver {
    pub fn new() -> Self {
        OnceOffReceiver {
            curr_receipts: HashSet::new(),
            prev_receipts: HashSet::new(),
            fragments: HashMap::new(),
        }
    }

    /// Record a once-off reliable arrival. True if it is a duplicate.
    pub fn on_reliable_received(&mut self, addr: SocketAddr, seq: SeqNum) -> bool {
        let key = (addr, seq);
        if self.curr_receipts.contains(&key) || self.prev_receipts.contains(&key) {
            return true;
        }
        self.curr_receipts.insert(key);
        false
    }

    /// Age the receipt sets one generation: current becomes previous,
    /// previous is forgotten.
    pub fn tick_receipts(&mut self) {
        self.prev_receipts = std::mem::take(&mut self.curr_receipts);
    }

    pub fn fragments_mut(&mut self) -> &mut HashMap<SocketAddr, FragmentedBundle> {
        &mut self.fragments
    }

    /// Throw away half-assembled bundles whose sender went quiet.
    pub fn tick_fragments(&mut self, now: Instant, max_age: Duration) {
        self.fragments.retain(|addr, frag| {
            let keep = frag.age(now) <= max_age;
            if !keep {
                tracing::warn!(
                    addr = %addr,
                    packets = frag.chain.len(),
                    "discarding stale fragmented bundle"
                );
            }
            keep
        });
    }

    pub fn on_address_dead(&mut self, addr: SocketAddr) {
        self.fragments.remove(&addr);
        self.curr_receipts.retain(|(a, _)| *a != addr);
        self.prev_receipts.retain(|(a, _)| *a != addr);
    }
}

impl Default for OnceOffReceiver {
    fn default() -> Self {
        OnceOffReceiver::new()
    }
}
