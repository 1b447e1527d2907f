//! Channel — the per-peer conversation the send path and teardown logic
//! rely on.
//!
//! The full windowed resend engine lives above this crate; what is here is
//! the contract the interface and `CondemnedChannels` need: an owned
//! outgoing bundle, per-channel sequence numbers, the unacked-packet map
//! that decides when a condemned channel may finally be deleted, and the
//! piggyback path that lets a dropped packet's reliable data ride out on
//! the next bundle instead of being resent whole.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mercury_core::bundle::{Bundle, ReliableOrder};
use mercury_core::packet::{seq_mask, ChannelId, Packet, SeqNum, CHANNEL_ID_NULL};
use mercury_core::reason::MessageFilter;

use crate::once_off::FragmentedBundle;

/// Internal channels link trusted processes and keep everything reliable;
/// external ones face untrusted peers and get selective reliability plus
/// piggybacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTraits {
    Internal,
    External,
}

/// A packet awaiting acknowledgement, frozen at send time.
pub struct UnackedPacket {
    pub packet: Arc<Packet>,
    pub orders: Vec<ReliableOrder>,
    pub critical: bool,
    pub sent_at: Instant,
}

pub struct Channel {
    addr: SocketAddr,
    id: ChannelId,
    traits: ChannelTraits,
    bundle: Bundle,
    condemned: bool,
    remote_failed: bool,
    anonymous: bool,
    last_received: Instant,
    next_seq: SeqNum,
    unacked: HashMap<SeqNum, UnackedPacket>,
    fragments: Option<FragmentedBundle>,
    filter: Option<Arc<dyn MessageFilter>>,
}

impl Channel {
    pub fn new(addr: SocketAddr, traits: ChannelTraits) -> Self {
        Channel {
            addr,
            id: CHANNEL_ID_NULL,
            traits,
            bundle: Bundle::for_channel(traits == ChannelTraits::External),
            condemned: false,
            remote_failed: false,
            anonymous: false,
            last_received: Instant::now(),
            next_seq: 0,
            unacked: HashMap::new(),
            fragments: None,
            filter: None,
        }
    }

    /// A channel created implicitly for an unknown sender on an external
    /// interface.
    pub fn new_anonymous(addr: SocketAddr) -> Self {
        let mut channel = Channel::new(addr, ChannelTraits::External);
        channel.anonymous = true;
        channel
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn set_id(&mut self, id: ChannelId) {
        self.id = id;
    }

    pub fn is_indexed(&self) -> bool {
        self.id != CHANNEL_ID_NULL
    }

    pub fn is_external(&self) -> bool {
        self.traits == ChannelTraits::External
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn bundle_mut(&mut self) -> &mut Bundle {
        &mut self.bundle
    }

    /// Take the pending bundle for sending, leaving a fresh one in place.
    pub fn take_bundle(&mut self) -> Bundle {
        let external = self.is_external();
        std::mem::replace(&mut self.bundle, Bundle::for_channel(external))
    }

    pub fn filter(&self) -> Option<Arc<dyn MessageFilter>> {
        self.filter.clone()
    }

    pub fn set_filter(&mut self, filter: Arc<dyn MessageFilter>) {
        self.filter = Some(filter);
    }

    /// Allocate the next outgoing sequence number, wrapping in the masked
    /// sequence space.
    pub fn next_sequence_id(&mut self) -> SeqNum {
        let seq = self.next_seq;
        self.next_seq = seq_mask(seq.wrapping_add(1));
        seq
    }

    // ── Reliability bookkeeping ──────────────────────────────────────────

    /// Retain a sent packet until the peer acks its sequence number.
    pub fn add_resend_timer(
        &mut self,
        seq: SeqNum,
        packet: Arc<Packet>,
        orders: Vec<ReliableOrder>,
        critical: bool,
        now: Instant,
    ) {
        self.unacked.insert(
            seq,
            UnackedPacket {
                packet,
                orders,
                critical,
                sent_at: now,
            },
        );
    }

    /// An ack for `seq` arrived. Unknown seqs are tolerated; acks
    /// themselves can be duplicated.
    pub fn handle_ack(&mut self, seq: SeqNum) {
        if self.unacked.remove(&seq).is_none() {
            tracing::debug!(addr = %self.addr, seq, "ack for unknown or already-acked seq");
        }
    }

    pub fn has_unacked_packets(&self) -> bool {
        !self.unacked.is_empty()
    }

    pub fn has_unacked_criticals(&self) -> bool {
        self.unacked.values().any(|u| u.critical)
    }

    pub fn unacked(&self, seq: SeqNum) -> Option<&UnackedPacket> {
        self.unacked.get(&seq)
    }

    /// Try to fold a dropped packet's reliable data into the pending
    /// bundle as a piggyback instead of resending the whole packet. False
    /// when it does not fit or carries a request; the caller falls back to
    /// a plain resend.
    pub fn piggyback_unacked(&mut self, seq: SeqNum) -> bool {
        let Some(entry) = self.unacked.get(&seq) else {
            return false;
        };
        if entry.orders.is_empty() {
            return false;
        }
        let orders = entry.orders.clone();
        let packet = entry.packet.clone();
        self.bundle.piggyback(seq, &orders, packet)
    }

    // ── Receive-side state ───────────────────────────────────────────────

    pub fn on_packet_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    pub fn fragments_mut(&mut self) -> &mut Option<FragmentedBundle> {
        &mut self.fragments
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    pub fn is_condemned(&self) -> bool {
        self.condemned
    }

    /// Mark the channel as going away. Done by the interface, which also
    /// cancels the channel's outstanding requests and files it with
    /// `CondemnedChannels`.
    pub fn set_condemned(&mut self) {
        debug_assert!(!self.condemned);
        self.condemned = true;
    }

    pub fn has_remote_failed(&self) -> bool {
        self.remote_failed
    }

    /// The peer is known dead; stop waiting for acks from it.
    pub fn set_remote_failed(&mut self) {
        self.remote_failed = true;
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_received)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_indexed() {
            write!(f, "{} (id {})", self.addr, self.id)
        } else {
            write!(f, "{}", self.addr)
        }
    }
}
