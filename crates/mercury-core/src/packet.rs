//! Mercury packet — one UDP-datagram-sized buffer.
//!
//! A packet has three regions: a fixed 2-byte header (the big-endian flags
//! word, written at send time), a body that grows forward as messages are
//! streamed, and footer space reserved from the tail. Footers are packed
//! backwards from the end of the datagram on send and stripped from the end
//! on receive, so the strip order equals the pack order.
//!
//! The flags word is the wire contract. A received packet carrying any bit
//! outside [`Packet::KNOWN_FLAGS`] is rejected as corrupt.

use static_assertions::const_assert;

use crate::reason::Reason;

pub type SeqNum = u32;
pub type ChannelId = u32;
pub type MessageId = u8;
pub type ReplyId = u32;

/// Sentinel for "no sequence number". Real sequence numbers are masked to
/// 28 bits and can never collide with it.
pub const SEQ_NULL: SeqNum = 0xFFFF_FFFF;
pub const SEQ_MASK: SeqNum = 0x0FFF_FFFF;

pub const CHANNEL_ID_NULL: ChannelId = 0;

/// Message id reserved for replies to requests.
pub const REPLY_MESSAGE_IDENTIFIER: MessageId = 0xFF;

/// Advance `seq` by one, wrapping within the masked sequence space.
pub fn seq_mask(seq: SeqNum) -> SeqNum {
    seq & SEQ_MASK
}

/// True if `a` precedes `b` in the wrapping sequence space.
pub fn seq_less_than(a: SeqNum, b: SeqNum) -> bool {
    a != b && seq_mask(b.wrapping_sub(a)) < (SEQ_MASK >> 1)
}

#[derive(Debug, Clone)]
pub struct Packet {
    data: Box<[u8; Packet::MAX_SIZE]>,
    /// End of valid data. While building, the body write position; during
    /// footer packing it walks out to the datagram end and back; on receive
    /// it is the strip position, ending at the body end once all footers
    /// are off.
    msg_end: usize,
    /// Footer bytes reserved from the tail but not yet written.
    footer_size: usize,
    flags: u16,

    // Request threading while building: offset of the first request's
    // message start, and the offset of the previous request's
    // next-request-offset slot so it can be patched to point at the next.
    first_request_offset: u16,
    last_request_link: Option<usize>,

    // Wire metadata, assigned on send or stripped on receive.
    seq: SeqNum,
    channel_id: ChannelId,
    frag_begin: SeqNum,
    frag_end: SeqNum,
    n_acks: u8,

    /// Region of this packet's own piggyback footers, recorded at send time
    /// so that if this packet is dropped and later piggybacked itself, its
    /// piggybacks ride along.
    piggy_footers: Option<(usize, usize)>,
}

impl Packet {
    /// Largest datagram we will emit: typical 1500-byte ethernet MTU minus
    /// IP and UDP headers.
    pub const MAX_SIZE: usize = 1472;
    /// The flags word.
    pub const HEADER_SIZE: usize = 2;
    /// Most acks one packet can carry (the count is streamed as one byte).
    pub const MAX_ACKS: usize = 255;

    pub const FLAG_HAS_REQUESTS: u16 = 0x0001;
    pub const FLAG_HAS_PIGGYBACKS: u16 = 0x0002;
    pub const FLAG_HAS_ACKS: u16 = 0x0004;
    pub const FLAG_ON_CHANNEL: u16 = 0x0008;
    pub const FLAG_IS_RELIABLE: u16 = 0x0010;
    pub const FLAG_IS_FRAGMENT: u16 = 0x0020;
    pub const FLAG_HAS_SEQUENCE_NUMBER: u16 = 0x0040;
    pub const FLAG_INDEXED_CHANNEL: u16 = 0x0080;
    pub const FLAG_CREATE_CHANNEL: u16 = 0x0100;

    pub const KNOWN_FLAGS: u16 = Self::FLAG_HAS_REQUESTS
        | Self::FLAG_HAS_PIGGYBACKS
        | Self::FLAG_HAS_ACKS
        | Self::FLAG_ON_CHANNEL
        | Self::FLAG_IS_RELIABLE
        | Self::FLAG_IS_FRAGMENT
        | Self::FLAG_HAS_SEQUENCE_NUMBER
        | Self::FLAG_INDEXED_CHANNEL
        | Self::FLAG_CREATE_CHANNEL;

    pub fn new() -> Self {
        Packet {
            data: Box::new([0u8; Packet::MAX_SIZE]),
            msg_end: Packet::HEADER_SIZE,
            footer_size: 0,
            flags: 0,
            first_request_offset: 0,
            last_request_link: None,
            seq: SEQ_NULL,
            channel_id: CHANNEL_ID_NULL,
            frag_begin: SEQ_NULL,
            frag_end: SEQ_NULL,
            n_acks: 0,
            piggy_footers: None,
        }
    }

    /// Wrap a received datagram. The caller strips footers off the tail
    /// until only the body remains.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Reason> {
        if bytes.len() > Packet::MAX_SIZE {
            return Err(Reason::CorruptedPacket);
        }
        let mut p = Packet::new();
        p.data[..bytes.len()].copy_from_slice(bytes);
        p.msg_end = bytes.len();
        Ok(p)
    }

    // ── Regions ──────────────────────────────────────────────────────────

    pub fn msg_end(&self) -> usize {
        self.msg_end
    }

    pub fn set_msg_end(&mut self, offset: usize) {
        assert!(offset <= Packet::MAX_SIZE);
        self.msg_end = offset;
    }

    /// The body region: everything between the header and the current end.
    pub fn body(&self) -> &[u8] {
        &self.data[Packet::HEADER_SIZE..self.msg_end]
    }

    pub fn body_size(&self) -> usize {
        self.msg_end - Packet::HEADER_SIZE
    }

    /// Bytes still available between the body end and the reserved footers.
    pub fn free_space(&self) -> usize {
        Packet::MAX_SIZE - self.msg_end - self.footer_size
    }

    /// Extend the body by `n` bytes and return the offset written at.
    /// Overrunning the free space is a framing bug, not a wire error.
    pub fn grow(&mut self, n: usize) -> usize {
        assert!(
            n <= self.free_space(),
            "packet overflow: grow({}) with {} free",
            n,
            self.free_space()
        );
        let at = self.msg_end;
        self.msg_end += n;
        at
    }

    /// Reserve `n` footer bytes off the tail.
    pub fn reserve_footer(&mut self, n: usize) {
        assert!(
            n <= self.free_space(),
            "packet overflow: reserve_footer({}) with {} free",
            n,
            self.free_space()
        );
        self.footer_size += n;
    }

    /// Release `n` reserved footer bytes that will not be packed after all.
    pub fn release_footer(&mut self, n: usize) {
        assert!(
            n <= self.footer_size,
            "release_footer({}) with only {} reserved",
            n,
            self.footer_size
        );
        self.footer_size -= n;
    }

    pub fn footer_size(&self) -> usize {
        self.footer_size
    }

    /// Total bytes this packet occupies on the wire.
    pub fn total_size(&self) -> usize {
        self.msg_end + self.footer_size
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.total_size()]
    }

    pub fn bytes_at(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_u8_at(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn write_u8_at(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    // ── Flags ────────────────────────────────────────────────────────────

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.flags = flags;
    }

    pub fn enable_flags(&mut self, flags: u16) {
        self.flags |= flags;
    }

    pub fn has_flags(&self, flags: u16) -> bool {
        self.flags & flags == flags
    }

    /// Write the flags word into the header bytes. Send side only.
    pub fn write_header(&mut self) {
        let flags = self.flags.to_be_bytes();
        self.data[..Packet::HEADER_SIZE].copy_from_slice(&flags);
    }

    /// Parse the flags word from the header bytes of a received datagram.
    pub fn read_header(&mut self) -> u16 {
        self.flags = u16::from_be_bytes([self.data[0], self.data[1]]);
        self.flags
    }

    // ── Footer packing (send) ────────────────────────────────────────────

    /// Move the write position out to the datagram end so footers can be
    /// packed backwards toward the body. Call once, after all reservations.
    pub fn grow_footers(&mut self) {
        assert!(self.msg_end + self.footer_size <= Packet::MAX_SIZE);
        self.msg_end += self.footer_size;
    }

    pub fn pack_footer(&mut self, bytes: &[u8]) {
        assert!(self.msg_end >= Packet::HEADER_SIZE + bytes.len());
        self.msg_end -= bytes.len();
        let at = self.msg_end;
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    pub fn pack_footer_u8(&mut self, value: u8) {
        self.pack_footer(&[value]);
    }

    pub fn pack_footer_u16(&mut self, value: u16) {
        self.pack_footer(&value.to_be_bytes());
    }

    pub fn pack_footer_i16(&mut self, value: i16) {
        self.pack_footer(&value.to_be_bytes());
    }

    pub fn pack_footer_u32(&mut self, value: u32) {
        self.pack_footer(&value.to_be_bytes());
    }

    /// Step the pack position back over `n` bytes and return the offset of
    /// the region, for footers written forwards (piggyback records).
    pub fn pack_footer_region(&mut self, n: usize) -> usize {
        assert!(self.msg_end >= Packet::HEADER_SIZE + n);
        self.msg_end -= n;
        self.msg_end
    }

    // ── Footer stripping (receive) ───────────────────────────────────────

    pub fn strip_footer(&mut self, n: usize) -> Result<&[u8], Reason> {
        if self.body_size() < n {
            return Err(Reason::CorruptedPacket);
        }
        self.msg_end -= n;
        Ok(&self.data[self.msg_end..self.msg_end + n])
    }

    pub fn strip_footer_u8(&mut self) -> Result<u8, Reason> {
        Ok(self.strip_footer(1)?[0])
    }

    pub fn strip_footer_u16(&mut self) -> Result<u16, Reason> {
        let b = self.strip_footer(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn strip_footer_i16(&mut self) -> Result<i16, Reason> {
        let b = self.strip_footer(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn strip_footer_u32(&mut self) -> Result<u32, Reason> {
        let b = self.strip_footer(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    // ── Piggyback block walk ─────────────────────────────────────────────

    /// Strip the trailing piggyback records off this packet, yielding each
    /// as a standalone packet image in the order they were packed. The last
    /// record's length is one's-complemented to mark the end of the block.
    pub fn unpack_piggybacks(&mut self) -> Result<Vec<Packet>, Reason> {
        let mut piggies = Vec::new();
        let mut last = false;

        while !last {
            let mut len = self.strip_footer_i16()?;
            if len < 0 {
                len = !len;
                last = true;
            }
            let region = self.strip_footer(len as usize)?;
            let mut piggy = Packet::from_bytes(region)?;
            if piggy.body_size() == 0 {
                return Err(Reason::CorruptedPacket);
            }
            piggy.read_header();
            piggies.push(piggy);
        }

        Ok(piggies)
    }

    // ── Request threading ────────────────────────────────────────────────

    /// Record a request that starts at `message_start`, whose
    /// next-request-offset slot lives at `link_slot`. Threads the packet's
    /// requests into a zero-terminated list the receiver can follow.
    pub fn add_request(&mut self, message_start: u16, link_slot: usize) {
        if self.first_request_offset == 0 {
            self.first_request_offset = message_start;
        } else if let Some(prev_slot) = self.last_request_link {
            self.write_at(prev_slot, &message_start.to_be_bytes());
        }
        // Terminate the list at this request until a later one extends it.
        self.write_at(link_slot, &0u16.to_be_bytes());
        self.last_request_link = Some(link_slot);
    }

    pub fn first_request_offset(&self) -> u16 {
        self.first_request_offset
    }

    pub fn set_first_request_offset(&mut self, offset: u16) {
        self.first_request_offset = offset;
    }

    // ── Wire metadata ────────────────────────────────────────────────────

    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    pub fn set_seq(&mut self, seq: SeqNum) {
        self.seq = seq;
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn set_channel_id(&mut self, id: ChannelId) {
        self.channel_id = id;
    }

    pub fn fragment_range(&self) -> (SeqNum, SeqNum) {
        (self.frag_begin, self.frag_end)
    }

    pub fn set_fragment_range(&mut self, begin: SeqNum, end: SeqNum) {
        self.frag_begin = begin;
        self.frag_end = end;
    }

    pub fn n_acks(&self) -> u8 {
        self.n_acks
    }

    pub fn set_n_acks(&mut self, n: u8) {
        self.n_acks = n;
    }

    pub fn piggy_footers(&self) -> Option<(usize, usize)> {
        self.piggy_footers
    }

    pub fn set_piggy_footers(&mut self, offset: usize, len: usize) {
        self.piggy_footers = Some((offset, len));
    }
}

impl Default for Packet {
    fn default() -> Self {
        Packet::new()
    }
}

/// A byte position within a chain of packets, as (packet index, offset).
/// The only primitives are single-byte reads/writes and advancing; crossing
/// a packet boundary transparently continues at the next packet's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChainCursor {
    pub packet: usize,
    pub offset: usize,
}

impl ChainCursor {
    pub fn new(packet: usize, offset: usize) -> Self {
        ChainCursor { packet, offset }
    }

    fn resolve(&mut self, packets: &[Packet]) {
        while self.packet + 1 < packets.len() && self.offset >= packets[self.packet].msg_end() {
            self.offset = Packet::HEADER_SIZE + (self.offset - packets[self.packet].msg_end());
            self.packet += 1;
        }
    }

    pub fn advance(&mut self, packets: &[Packet], n: usize) {
        self.offset += n;
        self.resolve(packets);
    }

    /// None when the position is past the end of the chain.
    pub fn read_u8(&self, packets: &[Packet]) -> Option<u8> {
        let mut c = *self;
        c.resolve(packets);
        (c.offset < packets[c.packet].msg_end()).then(|| packets[c.packet].read_u8_at(c.offset))
    }

    /// False when the position is past the end of the chain.
    pub fn write_u8(&self, packets: &mut [Packet], value: u8) -> bool {
        let mut c = *self;
        c.resolve(packets);
        if c.offset < packets[c.packet].msg_end() {
            packets[c.packet].write_u8_at(c.offset, value);
            true
        } else {
            false
        }
    }
}

// A packet must always be able to hold its header plus at least one
// maximal variable-length message header and the largest footer set.
const_assert!(Packet::MAX_SIZE > 64);
