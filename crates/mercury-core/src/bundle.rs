//! Bundle — an ordered set of messages spanning one or more packets.
//!
//! Outgoing: the bundle exclusively owns its packet chain while messages are
//! streamed onto it, then `finalise` closes it and the sending interface
//! writes per-packet footers and takes the chain. Incoming: a received chain
//! is wrapped with [`Bundle::from_chain`] and walked message by message with
//! [`BundleIter`], which resolves each message's element, unpacks its
//! header, and hands the payload to the registered handler.
//!
//! Requests put two extra fields after the message header: a 4-byte ReplyID
//! (assigned at send time) and a 2-byte next-request-offset threading all
//! requests in a packet into a list the receiver can follow without
//! scanning. Replies are ordinary messages of the reserved REPLY element
//! whose first 4 body bytes are the ReplyID being answered.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::interface::{InterfaceElement, InterfaceTable, REQUEST_EXTRA};
use crate::packet::{
    ChainCursor, MessageId, Packet, ReplyId, SeqNum, REPLY_MESSAGE_IDENTIFIER,
};
use crate::reason::{MessageFilter, Reason, ReplyMessageHandler};

/// How a message is tracked for retransmission.
///
/// A driver gives the bundle a reason of its own to be resent; passengers
/// ride along only if some driver does. A critical message additionally
/// marks the bundle as non-droppable for shutdown accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliableType {
    Unreliable,
    Driver,
    Passenger,
    Critical,
}

impl ReliableType {
    pub fn is_reliable(self) -> bool {
        !matches!(self, ReliableType::Unreliable)
    }

    pub fn is_driver(self) -> bool {
        matches!(self, ReliableType::Driver | ReliableType::Critical)
    }
}

/// A byte range within one packet that must be retained for retransmission
/// or piggybacking. Must exactly bound one message's contribution to one
/// packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableOrder {
    pub offset: usize,
    pub len: usize,
    pub is_request: bool,
}

/// An outstanding request: who handles the reply, how long to wait for it,
/// and where the ReplyID gets written at send time.
pub struct ReplyOrder {
    pub handler: Arc<dyn ReplyMessageHandler>,
    pub timeout: Option<Duration>,
    id_slot: ChainCursor,
}

/// A dropped packet's reliable data staged to ride out as a footer block on
/// the current packet.
pub struct BundlePiggyback {
    pub packet: Arc<Packet>,
    pub flags: u16,
    pub seq: SeqNum,
    /// Block length on the wire, excluding the 2-byte length suffix.
    pub len: u16,
    pub orders: Vec<ReliableOrder>,
}

/// The header of a received message, broken out for handlers.
#[derive(Debug, Clone, Default)]
pub struct UnpackedMessageHeader {
    pub identifier: MessageId,
    pub length: usize,
    /// `FLAG_HAS_REQUESTS` when the message is a request. A corrupted
    /// header is marked with `FLAG_IS_FRAGMENT`, which no legitimate
    /// message header carries.
    pub flags: u16,
    pub reply_id: ReplyId,
}

impl UnpackedMessageHeader {
    pub fn is_request(&self) -> bool {
        self.flags & Packet::FLAG_HAS_REQUESTS != 0
    }
}

pub struct Bundle {
    packets: Vec<Packet>,
    finalised: bool,
    reliable_driver: bool,
    reply_orders: Vec<ReplyOrder>,
    /// Segments to retain, with `None` gap markers separating packets.
    reliable_orders: Vec<Option<ReliableOrder>>,
    reliable_orders_extracted: usize,
    is_critical: bool,
    piggybacks: Vec<BundlePiggyback>,
    on_channel: bool,
    on_external_channel: bool,
    ack: Option<SeqNum>,

    // Cursor over the message currently being written.
    cur_ie: Option<InterfaceElement>,
    msg_len: usize,
    msg_extra: usize,
    msg_beg: Option<ChainCursor>,
    msg_chunk_offset: usize,
    msg_is_reliable: bool,
    msg_is_request: bool,

    num_messages: usize,
    num_reliable_messages: usize,
}

impl Bundle {
    /// Footer bytes held back on every packet while messages are streamed,
    /// so the send path can always pack the footers its flags imply:
    /// first-request offset (2), fragment range (8), ack block (5) and
    /// sequence number (4). [`Bundle::write_flags`] releases the hold and
    /// re-reserves exactly what the packet's flags need.
    const SEND_FOOTER_RESERVE: usize = 2 + 8 + 5 + 4;

    /// An empty bundle for writing, not owned by any channel.
    pub fn new() -> Self {
        Self::with_channel_kind(false, false)
    }

    /// An empty bundle owned by a channel. External channels record
    /// reliable orders so their packets can be piggybacked on loss.
    pub fn for_channel(external: bool) -> Self {
        Self::with_channel_kind(true, external)
    }

    fn with_channel_kind(on_channel: bool, external: bool) -> Self {
        let mut bundle = Bundle {
            packets: Vec::new(),
            finalised: false,
            reliable_driver: false,
            reply_orders: Vec::new(),
            reliable_orders: Vec::new(),
            reliable_orders_extracted: 0,
            is_critical: false,
            piggybacks: Vec::new(),
            on_channel,
            on_external_channel: external,
            ack: None,
            cur_ie: None,
            msg_len: 0,
            msg_extra: 0,
            msg_beg: None,
            msg_chunk_offset: Packet::HEADER_SIZE,
            msg_is_reliable: false,
            msg_is_request: false,
            num_messages: 0,
            num_reliable_messages: 0,
        };
        bundle.clear();
        bundle
    }

    /// Wrap a received packet chain for iteration and dispatch. Packets
    /// must already have had their footers stripped and be in fragment
    /// order.
    pub fn from_chain(packets: Vec<Packet>) -> Self {
        assert!(!packets.is_empty(), "received bundle with no packets");
        let mut bundle = Self::with_channel_kind(false, false);
        bundle.packets = packets;
        bundle.finalised = true;
        bundle
    }

    /// Flush all messages, leaving an empty one-packet bundle for reuse.
    pub fn clear(&mut self) {
        self.packets.clear();
        self.finalised = false;
        self.reliable_driver = false;
        self.reply_orders.clear();
        self.reliable_orders.clear();
        self.reliable_orders_extracted = 0;
        self.is_critical = false;
        self.piggybacks.clear();
        self.ack = None;
        self.cur_ie = None;
        self.msg_len = 0;
        self.msg_extra = 0;
        self.msg_beg = None;
        self.msg_is_reliable = false;
        self.msg_is_request = false;
        self.num_messages = 0;
        self.num_reliable_messages = 0;

        let mut p = Packet::new();
        p.reserve_footer(Self::SEND_FOOTER_RESERVE);
        self.packets.push(p);
        self.msg_chunk_offset = Packet::HEADER_SIZE;
    }

    fn cur(&self) -> &Packet {
        self.packets.last().expect("bundle packet chain empty")
    }

    fn cur_mut(&mut self) -> &mut Packet {
        self.packets.last_mut().expect("bundle packet chain empty")
    }

    fn cur_index(&self) -> usize {
        self.packets.len() - 1
    }

    // ── Inspection ───────────────────────────────────────────────────────

    /// True when the bundle carries no messages and no data footers.
    pub fn is_empty(&self) -> bool {
        let has_data = self.num_messages > 0
            || self.is_multi_packet()
            || self.is_reliable()
            || !self.piggybacks.is_empty()
            || self.ack.is_some();
        !has_data
    }

    pub fn is_reliable(&self) -> bool {
        !self.reliable_orders.is_empty() || self.msg_is_reliable || self.num_reliable_messages > 0
    }

    pub fn is_critical(&self) -> bool {
        self.is_critical
    }

    pub fn is_multi_packet(&self) -> bool {
        self.packets.len() > 1
    }

    pub fn on_external_channel(&self) -> bool {
        self.on_external_channel
    }

    /// Accumulated wire size of all packets, including reserved footers.
    pub fn size(&self) -> usize {
        self.packets.iter().map(|p| p.total_size()).sum()
    }

    pub fn size_in_packets(&self) -> usize {
        self.packets.len()
    }

    pub fn num_messages(&self) -> usize {
        self.num_messages
    }

    pub fn num_reliable_messages(&self) -> usize {
        self.num_reliable_messages
    }

    pub fn packet(&self, index: usize) -> &Packet {
        &self.packets[index]
    }

    pub fn packet_mut(&mut self, index: usize) -> &mut Packet {
        &mut self.packets[index]
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub(crate) fn packets_mut(&mut self) -> &mut [Packet] {
        &mut self.packets
    }

    /// Take the packet chain for transmission. The bundle must be cleared
    /// before reuse.
    pub fn take_packets(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.packets)
    }

    /// Split borrow for the sending interface: it writes piggyback blocks
    /// into the packets while reading the staged piggybacks.
    pub fn packets_and_piggybacks_mut(&mut self) -> (&mut [Packet], &[BundlePiggyback]) {
        (&mut self.packets, &self.piggybacks)
    }

    // ── Construction ─────────────────────────────────────────────────────

    /// Start a new message, closing any open one.
    pub fn start_message(&mut self, ie: &InterfaceElement, reliable: ReliableType) {
        // Piggybacks are staged immediately before sending; no messages
        // may follow them.
        assert!(
            !self.cur().has_flags(Packet::FLAG_HAS_PIGGYBACKS),
            "message started after piggybacks were staged"
        );

        self.end_message();
        self.cur_ie = Some(*ie);
        self.msg_is_reliable = reliable.is_reliable();
        self.msg_is_request = false;
        self.is_critical = reliable == ReliableType::Critical;
        self.new_message(*ie, 0);

        self.reliable_driver |= reliable.is_driver();
    }

    /// Start a request message. `handler` receives the reply, or an
    /// exception when the timeout expires or the channel dies. `None`
    /// means never time out; channel requests always use `None` since a
    /// channel either delivers or dies.
    pub fn start_request(
        &mut self,
        ie: &InterfaceElement,
        handler: Arc<dyn ReplyMessageHandler>,
        timeout: Option<Duration>,
        reliable: ReliableType,
    ) {
        if self.on_channel && timeout.is_some() {
            tracing::warn!(
                message = ie.name,
                "non-default timeout set on a channel bundle; requests never time out on channels"
            );
        }

        self.end_message();
        self.cur_ie = Some(*ie);
        self.msg_is_reliable = reliable.is_reliable();
        self.msg_is_request = true;
        self.is_critical = reliable == ReliableType::Critical;

        // Reserve the ReplyID and next-request-offset after the header.
        // The ReplyID itself is written at send time.
        let id_slot = self.new_message(*ie, REQUEST_EXTRA);

        let msg_end = self.cur().msg_end();
        let message_start = msg_end - (ie.header_size() + REQUEST_EXTRA);
        let link_slot = msg_end - 2;
        let cur = self.cur_mut();
        cur.add_request(message_start as u16, link_slot);
        cur.enable_flags(Packet::FLAG_HAS_REQUESTS);

        self.reply_orders.push(ReplyOrder {
            handler,
            timeout,
            id_slot,
        });

        self.reliable_driver |= reliable.is_driver();
    }

    /// Start a reply to a request, identified by the ReplyID from the
    /// request's unpacked header. The id is streamed as the first 4 body
    /// bytes and counts toward the length.
    pub fn start_reply(&mut self, id: ReplyId, reliable: ReliableType) {
        self.end_message();
        self.cur_ie = Some(InterfaceElement::REPLY);
        self.msg_is_reliable = reliable.is_reliable();
        self.msg_is_request = false;
        self.is_critical = reliable == ReliableType::Critical;
        self.new_message(InterfaceElement::REPLY, 0);

        self.reliable_driver |= reliable.is_driver();

        self.write_u32(id);
    }

    /// Begin a message of type `ie` with `extra` header bytes, spilling to
    /// a new packet if the current one lacks room. Returns the position of
    /// the extra bytes.
    fn new_message(&mut self, ie: InterfaceElement, extra: usize) -> ChainCursor {
        let header_len = ie.header_size();

        self.num_messages += 1;
        if self.msg_is_reliable {
            self.num_reliable_messages += 1;
        }

        let header = self.reserve(header_len + extra);
        self.msg_beg = Some(header);
        self.msg_chunk_offset = self.cur().msg_end();

        self.packets[header.packet].write_u8_at(header.offset, ie.id);

        self.msg_len = 0;
        self.msg_extra = extra;

        ChainCursor::new(header.packet, header.offset + header_len)
    }

    /// Close the open message: record its reliable order and fix up its
    /// length field.
    fn end_message(&mut self) {
        let Some(msg_beg) = self.msg_beg else {
            debug_assert_eq!(self.cur().msg_end(), Packet::HEADER_SIZE);
            return;
        };

        if self.msg_is_reliable {
            if self.on_external_channel {
                self.add_reliable_order();
            }
            self.msg_is_reliable = false;
        }

        self.msg_len += self.cur().msg_end() - self.msg_chunk_offset;
        self.msg_chunk_offset = self.cur().msg_end();

        let ie = self.cur_ie.expect("open message without an element");
        let length = self.msg_len;
        let is_request = self.msg_is_request;
        ie.compress_length(self, msg_beg, length, is_request);

        self.msg_beg = None;
        self.msg_is_request = false;
    }

    /// Record the open reliable message's contribution to the current
    /// packet. If the message began on this packet the segment starts at
    /// its header; otherwise only the bytes on this packet are covered.
    fn add_reliable_order(&mut self) {
        debug_assert!(self.on_external_channel);

        let cur_index = self.cur_index();
        let ie = self.cur_ie.expect("reliable order without an open message");
        let beg_in_cur = self.msg_chunk_offset;
        let beg_with_header =
            beg_in_cur as i64 - self.msg_extra as i64 - ie.header_size() as i64;

        let start = match self.msg_beg {
            Some(mb) if mb.packet == cur_index && mb.offset as i64 == beg_with_header => {
                beg_with_header as usize
            }
            _ => beg_in_cur,
        };

        self.reliable_orders.push(Some(ReliableOrder {
            offset: start,
            len: self.cur().msg_end() - start,
            is_request: self.msg_is_request,
        }));
    }

    fn start_packet(&mut self) {
        let mut p = Packet::new();
        p.reserve_footer(Self::SEND_FOOTER_RESERVE);
        self.packets.push(p);
        self.msg_chunk_offset = Packet::HEADER_SIZE;
    }

    /// Close out the current packet. When extending into a further packet,
    /// a partial reliable order covers any open message and a gap marker
    /// separates this packet's orders from the next one's.
    fn end_packet(&mut self, extending: bool) {
        if extending && self.on_external_channel {
            if self.msg_beg.is_some() && self.msg_is_reliable {
                self.add_reliable_order();
            }
            self.reliable_orders.push(None);
        }

        self.msg_len += self.cur().msg_end() - self.msg_chunk_offset;
        self.msg_chunk_offset = self.cur().msg_end();
    }

    /// Reserve `n` contiguous body bytes, spilling to a new packet when the
    /// current one lacks room.
    pub(crate) fn reserve(&mut self, n: usize) -> ChainCursor {
        if self.cur().free_space() < n {
            self.end_packet(true);
            self.start_packet();
        }
        let index = self.cur_index();
        let at = self.packets[index].grow(n);
        ChainCursor::new(index, at)
    }

    fn write_scalar(&mut self, bytes: &[u8]) {
        let at = self.reserve(bytes.len());
        self.packets[at.packet].write_at(at.offset, bytes);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_scalar(&[value]);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_scalar(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_scalar(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_scalar(&value.to_be_bytes());
    }

    /// Stream raw payload bytes, chunking across packet boundaries.
    pub fn write_bytes(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let room = self.cur().free_space();
            if room == 0 {
                self.end_packet(true);
                self.start_packet();
                continue;
            }
            let take = room.min(bytes.len());
            let index = self.cur_index();
            let at = self.packets[index].grow(take);
            self.packets[index].write_at(at, &bytes[..take]);
            bytes = &bytes[take..];
        }
    }

    /// Mark this bundle as acknowledging a once-off reliable packet.
    pub fn add_ack(&mut self, seq: SeqNum) {
        debug_assert!(self.ack.is_none());
        self.ack = Some(seq);
    }

    pub fn ack(&self) -> Option<SeqNum> {
        self.ack
    }

    // ── Finalisation & sending support ───────────────────────────────────

    /// Close the bundle before sending. Stray bytes outside any message
    /// are a framing bug in the caller.
    pub fn finalise(&mut self) {
        if self.finalised {
            return;
        }
        self.finalised = true;

        if self.msg_beg.is_none() && self.cur().msg_end() != self.msg_chunk_offset {
            tracing::error!("data not part of any message found at end of bundle");
            panic!("bundle finalised with stray data");
        }

        self.end_message();
        self.end_packet(false);

        // Without a driver, any reliable orders are passengers riding on a
        // bundle that will never be resent; drop them.
        if !self.reliable_driver && self.on_external_channel {
            self.reliable_orders.clear();
        }
    }

    /// Set a packet's flags from the bundle state and reserve the footer
    /// space those flags imply. Called once per packet at send time.
    pub fn write_flags(&mut self, index: usize) {
        let reliable = self.is_reliable();
        let multi = self.is_multi_packet();
        let has_ack = self.ack.is_some();

        let p = &mut self.packets[index];
        p.release_footer(Self::SEND_FOOTER_RESERVE);
        if reliable {
            p.enable_flags(Packet::FLAG_IS_RELIABLE);
        }
        if p.has_flags(Packet::FLAG_HAS_REQUESTS) {
            p.reserve_footer(2);
        }
        if multi {
            p.enable_flags(Packet::FLAG_IS_FRAGMENT);
            p.reserve_footer(4 + 4);
        }
        if has_ack {
            p.enable_flags(Packet::FLAG_HAS_ACKS);
            p.reserve_footer(1 + 4);
        }
    }

    /// Hand each pending request's handler to `assign`, writing the
    /// ReplyID it returns into the reserved header slot.
    pub fn register_reply_orders<F>(&mut self, mut assign: F)
    where
        F: FnMut(&Arc<dyn ReplyMessageHandler>, Option<Duration>) -> ReplyId,
    {
        let orders = std::mem::take(&mut self.reply_orders);
        for order in orders {
            let id = assign(&order.handler, order.timeout);
            let slot = order.id_slot;
            self.packets[slot.packet].write_at(slot.offset, &id.to_be_bytes());
        }
    }

    pub fn has_reply_orders(&self) -> bool {
        !self.reply_orders.is_empty()
    }

    /// Fail every pending request on this bundle with a synthetic network
    /// exception. Used when the owning channel is torn down unsent.
    pub fn cancel_requests(&mut self) {
        for order in self.reply_orders.drain(..) {
            order.handler.handle_exception(Reason::GeneralNetwork);
        }
    }

    /// The reliable orders referencing the packet at `index`, in chain
    /// order. Extraction is stateful across calls: each call consumes one
    /// packet's worth of orders up to the gap marker, resetting when asked
    /// about the first packet again.
    pub fn reliable_orders_for(&mut self, index: usize) -> Vec<ReliableOrder> {
        if self.reliable_orders.is_empty() {
            return Vec::new();
        }

        if self.packets.len() == 1 {
            debug_assert_eq!(index, 0);
            return self.reliable_orders.iter().flatten().copied().collect();
        }

        if index == 0 {
            self.reliable_orders_extracted = 0;
        }

        let beg = self.reliable_orders_extracted;
        let mut end = beg;
        while end < self.reliable_orders.len() && self.reliable_orders[end].is_some() {
            end += 1;
        }
        self.reliable_orders_extracted = end + 1;

        self.reliable_orders[beg..end]
            .iter()
            .flatten()
            .copied()
            .collect()
    }

    /// Stage a dropped packet's reliable data to ride out on the current
    /// packet. Returns false without mutating anything if the data cannot
    /// fit, or if any of it is a request (unsupported), so the caller can
    /// fall back to a normal resend.
    pub fn piggyback(
        &mut self,
        seq: SeqNum,
        orders: &[ReliableOrder],
        packet: Arc<Packet>,
    ) -> bool {
        let mut flags = Packet::FLAG_HAS_SEQUENCE_NUMBER
            | Packet::FLAG_IS_RELIABLE
            | Packet::FLAG_ON_CHANNEL;

        // Flags word, sequence number footer, and the 2-byte length suffix.
        let mut total = 2 + 4 + 2;

        for order in orders {
            total += order.len;
            if order.is_request {
                tracing::warn!(
                    id = packet.read_u8_at(order.offset),
                    seq,
                    "refused to piggyback a request"
                );
                return false;
            }
        }

        // A dropped packet that itself carried piggybacks keeps them: the
        // piggyback gets piggybacks.
        if packet.has_flags(Packet::FLAG_HAS_PIGGYBACKS) {
            if let Some((_, len)) = packet.piggy_footers() {
                flags |= Packet::FLAG_HAS_PIGGYBACKS;
                total += len;
            }
        }

        if total > self.cur().free_space() {
            return false;
        }

        self.cur_mut().enable_flags(
            Packet::FLAG_HAS_PIGGYBACKS
                | Packet::FLAG_IS_RELIABLE
                | Packet::FLAG_HAS_SEQUENCE_NUMBER,
        );

        self.piggybacks.push(BundlePiggyback {
            packet,
            flags,
            seq,
            len: (total - 2) as u16,
            orders: orders.to_vec(),
        });

        // Safe to reserve late: the fit check above already passed.
        self.cur_mut().reserve_footer(total);

        true
    }

    // ── Receive side ─────────────────────────────────────────────────────

    pub fn iter_messages(&mut self) -> BundleIter<'_> {
        BundleIter::new(&mut self.packets)
    }

    /// Walk every message and hand it to its registered handler, aborting
    /// the whole bundle on the first unknown id or corrupt header.
    pub fn dispatch_messages(
        &mut self,
        table: &InterfaceTable,
        source: SocketAddr,
        filter: Option<&dyn MessageFilter>,
    ) -> Result<(), Reason> {
        let mut iter = BundleIter::new(&mut self.packets);

        while !iter.at_end() {
            let id = iter.msg_id();

            let Some(element) = table.element(id).copied() else {
                tracing::error!(
                    addr = %source,
                    id,
                    "discarding bundle after hitting unknown message id"
                );
                return Err(Reason::NonexistentEntry);
            };
            let Some(handler) = table.handler(id).cloned() else {
                tracing::error!(
                    addr = %source,
                    id,
                    message = element.name,
                    "discarding bundle after hitting unhandled message id"
                );
                return Err(Reason::NonexistentEntry);
            };

            let header = iter.unpack(&element);
            if header.flags & Packet::FLAG_IS_FRAGMENT != 0 {
                tracing::error!(
                    addr = %source,
                    id,
                    "discarding bundle due to corrupted header"
                );
                return Err(Reason::CorruptedPacket);
            }

            let Some(data) = iter.data() else {
                tracing::error!(
                    addr = %source,
                    id,
                    length = header.length,
                    "discarding rest of bundle; chain too short for message data"
                );
                return Err(Reason::CorruptedPacket);
            };

            let mut payload = Payload::new(&data[..header.length]);

            let result = match filter {
                Some(f) => f.filter_message(source, &header, &mut payload, handler.as_ref()),
                None => handler.handle_message(source, &header, &mut payload),
            };
            if let Err(e) = result {
                tracing::warn!(addr = %source, id, error = %e, "message handler failed");
            }

            let remaining = payload.remaining();
            iter.advance();

            if remaining != 0 {
                if header.identifier == REPLY_MESSAGE_IDENTIFIER {
                    tracing::warn!(addr = %source, remaining, "handler for reply left bytes");
                } else {
                    tracing::warn!(
                        addr = %source,
                        message = element.name,
                        id = header.identifier,
                        remaining,
                        "handler left bytes unread"
                    );
                }
            }
        }

        Ok(())
    }

    /// Diagnostic walk of a received bundle, logging each message.
    pub fn dump_messages(&mut self, table: &InterfaceTable) {
        let mut iter = BundleIter::new(&mut self.packets);
        let mut count = 0;

        // A corrupt chain can fail to advance; cap the walk.
        while !iter.at_end() && count < 1000 {
            let id = iter.msg_id();
            if let Some(element) = table.element(id).copied() {
                let header = iter.unpack(&element);
                tracing::warn!(
                    index = count,
                    id = header.identifier,
                    length = header.length,
                    "bundle message"
                );
            }
            iter.advance();
            count += 1;
        }
    }
}

impl Default for Bundle {
    fn default() -> Self {
        Bundle::new()
    }
}

// ── Iterator ─────────────────────────────────────────────────────────────

/// Walks a received packet chain message by message. Call `msg_id`, then
/// `unpack` with the resolved element, then `data`, then `advance`; the
/// borrow rules keep the order honest.
pub struct BundleIter<'a> {
    packets: &'a mut Vec<Packet>,
    done: bool,
    cursor: usize,
    body_end: usize,
    offset: usize,
    next_request_offset: usize,
    data_offset: usize,
    data_len: usize,
    data_buffer: Option<Vec<u8>>,
    header: UnpackedMessageHeader,
}

impl<'a> BundleIter<'a> {
    fn new(packets: &'a mut Vec<Packet>) -> Self {
        let mut iter = BundleIter {
            packets,
            done: false,
            cursor: 0,
            body_end: 0,
            offset: 0,
            next_request_offset: 0,
            data_offset: 0,
            data_len: 0,
            data_buffer: None,
            header: UnpackedMessageHeader::default(),
        };

        // Find the first packet with body data; a packet can be all
        // footers.
        loop {
            if iter.cursor >= iter.packets.len() {
                iter.done = true;
                break;
            }
            iter.next_packet();
            if iter.offset < iter.body_end {
                break;
            }
            iter.cursor += 1;
        }

        iter
    }

    fn next_packet(&mut self) {
        let p = &self.packets[self.cursor];
        self.next_request_offset = p.first_request_offset() as usize;
        self.body_end = p.msg_end();
        self.offset = Packet::HEADER_SIZE;
    }

    pub fn at_end(&self) -> bool {
        self.done
    }

    pub fn msg_id(&self) -> MessageId {
        self.packets[self.cursor].read_u8_at(self.offset)
    }

    /// Unpack the current message's header. A corrupted header is flagged
    /// with `FLAG_IS_FRAGMENT` rather than an error so the dispatch loop
    /// owns the abort.
    pub fn unpack(&mut self, ie: &InterfaceElement) -> UnpackedMessageHeader {
        let mut msg_beg = self.offset;
        let is_request = self.next_request_offset == self.offset;

        if self.offset + ie.header_size() > self.body_end {
            tracing::error!(
                message = ie.name,
                offset = self.offset,
                available = self.body_end - self.offset,
                needed = ie.header_size(),
                "not enough data for message header"
            );
            return self.corrupt_header();
        }

        self.header.identifier = self.msg_id();
        let header_pos = ChainCursor::new(self.cursor, msg_beg);
        match ie.expand_length(self.packets, header_pos, is_request) {
            Ok(length) => self.header.length = length,
            Err(_) => {
                tracing::error!(
                    message = ie.name,
                    offset = self.offset,
                    "error unpacking header length"
                );
                return self.corrupt_header();
            }
        }

        msg_beg += ie.header_size();

        if !is_request {
            self.header.flags = 0;
            self.header.reply_id = 0;
        } else {
            if msg_beg + REQUEST_EXTRA > self.body_end {
                tracing::error!(
                    message = ie.name,
                    offset = self.offset,
                    "not enough data for request id and offset"
                );
                return self.corrupt_header();
            }

            let p = &self.packets[self.cursor];
            let id = p.bytes_at(msg_beg, 4);
            self.header.reply_id = u32::from_be_bytes([id[0], id[1], id[2], id[3]]);
            msg_beg += 4;

            let nro = p.bytes_at(msg_beg, 2);
            self.next_request_offset = u16::from_be_bytes([nro[0], nro[1]]) as usize;
            msg_beg += 2;

            self.header.flags = Packet::FLAG_HAS_REQUESTS;
        }

        // The payload may continue on the next packet, but only if there
        // is one.
        if msg_beg + self.header.length > self.body_end && self.cursor + 1 >= self.packets.len()
        {
            tracing::error!(
                message = ie.name,
                offset = self.offset,
                available = self.body_end - msg_beg,
                needed = self.header.length,
                "not enough data for message payload"
            );
            return self.corrupt_header();
        }

        self.data_offset = msg_beg;
        self.data_len = self.header.length;

        // The escape format leaves 4 relocated bytes after the payload;
        // skip them when advancing.
        if !ie.can_handle_length(self.data_len) {
            self.data_len += 4;
        }

        self.header.clone()
    }

    fn corrupt_header(&mut self) -> UnpackedMessageHeader {
        self.header.flags = Packet::FLAG_IS_FRAGMENT;
        self.header.clone()
    }

    /// The current message's data: borrowed straight from the packet when
    /// contiguous, otherwise materialized into a spanning buffer that
    /// lives until the next `advance`. None if the chain is too short.
    pub fn data(&mut self) -> Option<&[u8]> {
        if self.data_offset + self.data_len <= self.body_end {
            return Some(self.packets[self.cursor].bytes_at(self.data_offset, self.data_len));
        }

        // unpack() would have flagged a missing next packet.
        if self.cursor + 1 >= self.packets.len() || self.data_offset > self.body_end {
            return None;
        }

        // Entirely on the next packet?
        if self.data_offset == self.body_end
            && Packet::HEADER_SIZE + self.data_len <= self.packets[self.cursor + 1].msg_end()
        {
            return Some(self.packets[self.cursor + 1].bytes_at(Packet::HEADER_SIZE, self.data_len));
        }

        // Half here, half there: build a temporary contiguous copy.
        if self.data_buffer.is_none() {
            let mut buf = vec![0u8; self.data_len];
            let mut packet = self.cursor;
            let mut offset = self.data_offset;
            let mut filled = 0;

            while filled < self.data_len {
                if packet >= self.packets.len() {
                    tracing::debug!(
                        filled,
                        needed = self.data_len,
                        "ran out of packets materializing message data"
                    );
                    return None;
                }
                let avail = self.packets[packet].msg_end().saturating_sub(offset);
                let take = avail.min(self.data_len - filled);
                buf[filled..filled + take]
                    .copy_from_slice(self.packets[packet].bytes_at(offset, take));
                filled += take;
                packet += 1;
                offset = Packet::HEADER_SIZE;
            }

            self.data_buffer = Some(buf);
        }

        self.data_buffer.as_deref()
    }

    /// Advance to the next message, crossing packet boundaries and
    /// resetting per-packet state.
    pub fn advance(&mut self) {
        self.data_buffer = None;

        let mut bigger = self.data_offset + self.data_len;
        while bigger >= self.body_end {
            bigger -= self.body_end;

            self.cursor += 1;
            if self.cursor >= self.packets.len() {
                self.done = true;
                return;
            }

            self.next_packet();
            bigger += self.offset;
        }
        self.offset = bigger;
    }
}

// ── Payload reader ───────────────────────────────────────────────────────

/// A bounds-checked reader over one message's payload. Values are read in
/// network byte order, mirroring the bundle's write helpers.
pub struct Payload<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Payload<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Payload { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], Reason> {
        if self.remaining() < n {
            return Err(Reason::CorruptedPacket);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Everything not yet read.
    pub fn get_rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    pub fn get_u8(&mut self) -> Result<u8, Reason> {
        Ok(self.get_bytes(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, Reason> {
        let b = self.get_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, Reason> {
        let b = self.get_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, Reason> {
        let b = self.get_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::LengthStyle;
    use crate::reason::MessageHandler;
    use std::sync::Mutex;

    const MSG: InterfaceElement = InterfaceElement::new("msg", 5, LengthStyle::Variable, 1);
    const WIDE: InterfaceElement = InterfaceElement::new("wide", 6, LengthStyle::Variable, 2);
    const PING: InterfaceElement = InterfaceElement::new("ping", 7, LengthStyle::Variable, 2);

    fn addr() -> SocketAddr {
        "127.0.0.1:20013".parse().unwrap()
    }

    /// Collects (id, reply_id, payload bytes) per dispatched message.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(MessageId, ReplyId, Vec<u8>)>>,
    }

    impl MessageHandler for Recorder {
        fn handle_message(
            &self,
            _source: SocketAddr,
            header: &UnpackedMessageHeader,
            payload: &mut Payload<'_>,
        ) -> Result<(), Reason> {
            let body = payload.get_rest().to_vec();
            self.seen
                .lock()
                .unwrap()
                .push((header.identifier, header.reply_id, body));
            Ok(())
        }
    }

    fn round_trip(mut bundle: Bundle) -> Bundle {
        bundle.finalise();
        Bundle::from_chain(bundle.take_packets())
    }

    #[test]
    fn length_byte_at_exact_fit_is_fe() {
        let mut bundle = Bundle::new();
        bundle.start_message(&MSG, ReliableType::Unreliable);
        bundle.write_bytes(&[7u8; 254]);
        bundle.finalise();

        let p = bundle.packet(0);
        assert_eq!(p.read_u8_at(Packet::HEADER_SIZE), 5);
        assert_eq!(p.read_u8_at(Packet::HEADER_SIZE + 1), 0xFE);
    }

    #[test]
    fn oversize_payload_uses_escape_and_restores_on_read() {
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();

        let mut bundle = Bundle::new();
        bundle.start_message(&MSG, ReliableType::Unreliable);
        bundle.write_bytes(&payload);
        bundle.finalise();

        // Sentinel length byte, true length appended at the tail.
        let p = bundle.packet(0);
        assert_eq!(p.read_u8_at(Packet::HEADER_SIZE + 1), 0xFF);

        let mut rx = Bundle::from_chain(bundle.take_packets());
        let mut iter = rx.iter_messages();
        assert!(!iter.at_end());
        assert_eq!(iter.msg_id(), 5);
        let header = iter.unpack(&MSG);
        assert_eq!(header.length, 300);
        assert_eq!(header.flags & Packet::FLAG_IS_FRAGMENT, 0);
        let data = iter.data().unwrap();
        assert_eq!(&data[..300], &payload[..]);
        iter.advance();
        assert!(iter.at_end());
    }

    #[test]
    fn starting_a_second_message_never_loses_the_first() {
        let mut bundle = Bundle::new();
        bundle.start_message(&MSG, ReliableType::Unreliable);
        bundle.write_bytes(b"one");
        bundle.start_message(&WIDE, ReliableType::Unreliable);
        bundle.write_bytes(b"second");

        let mut rx = round_trip(bundle);
        let mut iter = rx.iter_messages();
        let h1 = iter.unpack(&MSG);
        assert_eq!(h1.identifier, 5);
        assert_eq!(h1.length, 3);
        assert_eq!(iter.data().unwrap(), b"one");
        iter.advance();
        let h2 = iter.unpack(&WIDE);
        assert_eq!(h2.identifier, 6);
        assert_eq!(h2.length, 6);
        assert_eq!(iter.data().unwrap(), b"second");
        iter.advance();
        assert!(iter.at_end());
    }

    #[test]
    #[should_panic(expected = "stray data")]
    fn finalise_rejects_bytes_outside_any_message() {
        let mut bundle = Bundle::new();
        bundle.write_bytes(b"oops");
        bundle.finalise();
    }

    #[test]
    fn large_message_spans_packets_and_materializes() {
        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 241) as u8).collect();

        let mut bundle = Bundle::new();
        bundle.start_message(&WIDE, ReliableType::Unreliable);
        bundle.write_bytes(&payload);

        let mut rx = round_trip(bundle);
        assert!(rx.is_multi_packet());

        let mut iter = rx.iter_messages();
        let header = iter.unpack(&WIDE);
        assert_eq!(header.length, 4000);
        let data = iter.data().unwrap();
        assert_eq!(data, &payload[..]);
        iter.advance();
        assert!(iter.at_end());
    }

    /// Packets filled to the brim while streaming must still have room for
    /// the per-packet send footers: flags reservation plus the sequence
    /// number may not push any packet past the datagram limit.
    #[test]
    fn multi_packet_send_keeps_footer_room() {
        let mut bundle = Bundle::new();
        bundle.start_message(&WIDE, ReliableType::Driver);
        bundle.write_bytes(&vec![1u8; 4000]);
        bundle.finalise();
        assert!(bundle.is_multi_packet());

        for i in 0..bundle.size_in_packets() {
            bundle.write_flags(i);
            let p = bundle.packet_mut(i);
            p.reserve_footer(4); // sequence number
            assert!(p.has_flags(Packet::FLAG_IS_FRAGMENT));
            assert!(p.total_size() <= Packet::MAX_SIZE);
        }
    }

    /// A payload far beyond the 2-byte length field: the escape format and
    /// the spanning reader together must hand back every byte.
    #[test]
    fn multi_megabyte_payload_round_trips() {
        let payload: Vec<u8> = (0..2_000_000u32).map(|i| (i % 249) as u8).collect();

        let mut bundle = Bundle::new();
        bundle.start_message(&WIDE, ReliableType::Unreliable);
        bundle.write_bytes(&payload);

        let mut rx = round_trip(bundle);
        assert!(rx.is_multi_packet());

        let mut iter = rx.iter_messages();
        let header = iter.unpack(&WIDE);
        assert_eq!(header.length, payload.len());
        assert_eq!(header.flags & Packet::FLAG_IS_FRAGMENT, 0);
        let data = iter.data().unwrap();
        assert_eq!(&data[..payload.len()], &payload[..]);
        iter.advance();
        assert!(iter.at_end());
    }

    #[test]
    fn reliable_segmentation_across_packets() {
        let payload = vec![3u8; 4000];

        let mut bundle = Bundle::for_channel(true);
        bundle.start_message(&WIDE, ReliableType::Driver);
        bundle.write_bytes(&payload);
        bundle.finalise();

        assert_eq!(bundle.size_in_packets(), 3);

        // One segment per packet; the first starts at the message header.
        let first = bundle.reliable_orders_for(0);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].offset, Packet::HEADER_SIZE);
        assert!(!first[0].is_request);

        let second = bundle.reliable_orders_for(1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].offset, Packet::HEADER_SIZE);

        let third = bundle.reliable_orders_for(2);
        assert_eq!(third.len(), 1);

        // Asking about the first packet again resets extraction.
        let again = bundle.reliable_orders_for(0);
        assert_eq!(again, first);
    }

    #[test]
    fn passenger_orders_dropped_without_a_driver() {
        let mut bundle = Bundle::for_channel(true);
        bundle.start_message(&MSG, ReliableType::Passenger);
        bundle.write_bytes(b"tagalong");
        bundle.finalise();

        assert!(bundle.reliable_orders_for(0).is_empty());
    }

    struct FailingReply;
    impl ReplyMessageHandler for FailingReply {
        fn handle_reply(
            &self,
            _source: SocketAddr,
            _header: &UnpackedMessageHeader,
            _payload: &mut Payload<'_>,
        ) {
            panic!("no reply expected");
        }
        fn handle_exception(&self, _reason: Reason) {}
    }

    #[test]
    fn request_carries_assigned_reply_id() {
        let mut bundle = Bundle::new();
        bundle.start_request(&PING, Arc::new(FailingReply), None, ReliableType::Unreliable);
        bundle.write_bytes(b"payload");
        bundle.finalise();
        bundle.register_reply_orders(|_, _| 42);

        let recorder = Arc::new(Recorder::default());
        let mut table = InterfaceTable::new();
        table.serve(PING, recorder.clone());

        let mut rx = Bundle::from_chain(bundle.take_packets());
        rx.dispatch_messages(&table, addr(), None).unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 7);
        assert_eq!(seen[0].1, 42);
        assert_eq!(seen[0].2, b"payload");
    }

    #[test]
    fn reply_streams_the_reply_id_first() {
        let mut bundle = Bundle::new();
        bundle.start_reply(99, ReliableType::Unreliable);
        bundle.write_bytes(b"answer");

        let mut rx = round_trip(bundle);
        let mut iter = rx.iter_messages();
        assert_eq!(iter.msg_id(), REPLY_MESSAGE_IDENTIFIER);
        let header = iter.unpack(&InterfaceElement::REPLY);
        assert_eq!(header.length, 4 + 6);
        let data = iter.data().unwrap();
        assert_eq!(&data[..4], &99u32.to_be_bytes());
        assert_eq!(&data[4..10], b"answer");
    }

    #[test]
    fn dispatch_aborts_on_unknown_id() {
        let mut bundle = Bundle::new();
        bundle.start_message(&MSG, ReliableType::Unreliable);
        bundle.write_bytes(b"first");
        bundle.start_message(&WIDE, ReliableType::Unreliable); // not served
        bundle.write_bytes(b"hidden");
        bundle.start_message(&MSG, ReliableType::Unreliable);
        bundle.write_bytes(b"never");

        let recorder = Arc::new(Recorder::default());
        let mut table = InterfaceTable::new();
        table.serve(MSG, recorder.clone());

        let mut rx = round_trip(bundle);
        assert_eq!(
            rx.dispatch_messages(&table, addr(), None),
            Err(Reason::NonexistentEntry)
        );

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].2, b"first");
    }

    #[test]
    fn cancel_requests_raises_exceptions() {
        struct Counting(Mutex<Vec<Reason>>);
        impl ReplyMessageHandler for Counting {
            fn handle_reply(
                &self,
                _source: SocketAddr,
                _header: &UnpackedMessageHeader,
                _payload: &mut Payload<'_>,
            ) {
            }
            fn handle_exception(&self, reason: Reason) {
                self.0.lock().unwrap().push(reason);
            }
        }

        let handler = Arc::new(Counting(Mutex::new(Vec::new())));
        let mut bundle = Bundle::new();
        bundle.start_request(&PING, handler.clone(), None, ReliableType::Unreliable);
        bundle.cancel_requests();

        assert_eq!(&*handler.0.lock().unwrap(), &[Reason::GeneralNetwork]);
        assert!(!bundle.has_reply_orders());
    }

    #[test]
    fn piggyback_refuses_requests_and_oversize() {
        let mut source = Packet::new();
        let at = source.grow(20);
        source.write_at(at, &[9u8; 20]);
        let source = Arc::new(source);

        let mut bundle = Bundle::for_channel(true);

        // Request segments are unsupported.
        let orders = vec![ReliableOrder {
            offset: Packet::HEADER_SIZE,
            len: 20,
            is_request: true,
        }];
        assert!(!bundle.piggyback(1, &orders, source.clone()));
        assert!(bundle.piggybacks.is_empty());

        // A segment bigger than the free space does not fit.
        let orders = vec![ReliableOrder {
            offset: Packet::HEADER_SIZE,
            len: Packet::MAX_SIZE,
            is_request: false,
        }];
        assert!(!bundle.piggyback(1, &orders, source.clone()));

        // A small one fits and reserves its footer space.
        let orders = vec![ReliableOrder {
            offset: Packet::HEADER_SIZE,
            len: 20,
            is_request: false,
        }];
        assert!(bundle.piggyback(1, &orders, source));
        assert_eq!(bundle.piggybacks.len(), 1);
        assert_eq!(bundle.piggybacks[0].len as usize, 2 + 20 + 4);
        assert!(bundle.packet(0).has_flags(Packet::FLAG_HAS_PIGGYBACKS));
    }

    #[test]
    fn empty_bundle_is_empty_until_written() {
        let mut bundle = Bundle::new();
        assert!(bundle.is_empty());
        bundle.start_message(&MSG, ReliableType::Unreliable);
        assert!(!bundle.is_empty());
        bundle.clear();
        assert!(bundle.is_empty());
    }
}
