//! Message-type metadata and the id → handler registry.
//!
//! Every message on the wire starts with a one-byte id followed by a length
//! field whose encoding is described by that id's [`InterfaceElement`]:
//! either a fixed body size (no length bytes at all) or a variable length
//! carried in 1–4 bytes. Variable lengths that do not fit their field use an
//! escape format: the field is filled with 0xFF sentinel bytes, the true
//! length is appended at the end of the bundle as 4 bytes, and the first 4
//! body bytes are relocated into that tail slot so the true length can sit
//! at the body head where the receiver looks for it.

use std::fmt;
use std::sync::Arc;

use crate::bundle::Bundle;
use crate::packet::{ChainCursor, MessageId, Packet, REPLY_MESSAGE_IDENTIFIER};
use crate::reason::{MessageHandler, Reason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthStyle {
    /// The body is always exactly `length_param` bytes; no length field.
    Fixed,
    /// The length is carried in `length_param` (1–4) bytes, network order.
    Variable,
}

/// Metadata for one message type. Stateless after construction.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceElement {
    pub name: &'static str,
    pub id: MessageId,
    pub length_style: LengthStyle,
    pub length_param: usize,
}

/// Bytes of ReplyID plus next-request-offset inserted after a request's
/// header.
pub(crate) const REQUEST_EXTRA: usize = 4 + 2;

impl InterfaceElement {
    /// The reserved reply element. All replies are 4-byte variable size;
    /// the ReplyID being answered is streamed as the first 4 body bytes and
    /// counts toward the length.
    pub const REPLY: InterfaceElement = InterfaceElement {
        name: "reply",
        id: REPLY_MESSAGE_IDENTIFIER,
        length_style: LengthStyle::Variable,
        length_param: 4,
    };

    pub const fn new(
        name: &'static str,
        id: MessageId,
        length_style: LengthStyle,
        length_param: usize,
    ) -> Self {
        InterfaceElement {
            name,
            id,
            length_style,
            length_param,
        }
    }

    /// Bytes of header this element puts on the wire: the id plus the
    /// length field for variable styles.
    pub fn header_size(&self) -> usize {
        match self.length_style {
            LengthStyle::Fixed => 1,
            LengthStyle::Variable => 1 + self.length_param,
        }
    }

    /// All length-field bytes set: the escape sentinel for this field width.
    fn sentinel(&self) -> usize {
        (1usize << (8 * self.length_param)) - 1
    }

    /// Whether `length` is expressible without the escape format.
    pub fn can_handle_length(&self, length: usize) -> bool {
        match self.length_style {
            LengthStyle::Fixed => length == self.length_param,
            LengthStyle::Variable => self.length_param >= 4 || length < self.sentinel(),
        }
    }

    /// Write the length field for a message whose header starts at `header`.
    /// Called once the full body length is known, at end-of-message time.
    pub(crate) fn compress_length(
        &self,
        bundle: &mut Bundle,
        header: ChainCursor,
        length: usize,
        is_request: bool,
    ) {
        match self.length_style {
            LengthStyle::Fixed => {
                if length != self.length_param {
                    tracing::error!(
                        name = self.name,
                        id = self.id,
                        length,
                        expected = self.length_param,
                        "fixed-length message streamed a mismatched body"
                    );
                    panic!("fixed-length mismatch for message {}", self.name);
                }
            }
            LengthStyle::Variable => {
                if !(1..=4).contains(&self.length_param) {
                    tracing::error!(
                        name = self.name,
                        id = self.id,
                        length_param = self.length_param,
                        "unknown length format"
                    );
                    panic!("unknown length format for message {}", self.name);
                }

                if self.length_param == 4 && length > i32::MAX as usize {
                    tracing::error!(
                        name = self.name,
                        length,
                        "message too long for a 4-byte length field"
                    );
                    panic!("oversize message {}", self.name);
                }

                if length < self.sentinel() || self.length_param == 4 {
                    self.write_length_field(bundle.packets_mut(), header, length);
                } else {
                    self.special_compress_length(bundle, header, length, is_request);
                }
            }
        }
    }

    fn write_length_field(&self, packets: &mut [Packet], header: ChainCursor, length: usize) {
        let n = self.length_param;
        let p = &mut packets[header.packet];
        for k in 0..n {
            let byte = (length >> (8 * (n - 1 - k))) as u8;
            p.write_u8_at(header.offset + 1 + k, byte);
        }
    }

    /// The escape path: sentinel-fill the length field, append the true
    /// length at the end of the bundle, and swap it with the first 4 body
    /// bytes. The walk is done one byte at a time so packet boundaries are
    /// transparent.
    fn special_compress_length(
        &self,
        bundle: &mut Bundle,
        header: ChainCursor,
        length: usize,
        is_request: bool,
    ) {
        {
            let p = &mut bundle.packets_mut()[header.packet];
            for k in 0..self.length_param {
                p.write_u8_at(header.offset + 1 + k, 0xFF);
            }
        }

        // Tail slot for the relocated head bytes, at the very end of the
        // bundle (possibly on a fresh packet).
        let tail = bundle.reserve(4);

        let extra = if is_request { REQUEST_EXTRA } else { 0 };
        let body = ChainCursor::new(header.packet, header.offset + self.header_size() + extra);

        let packets = bundle.packets_mut();
        let mut head = [0u8; 4];
        if !chain_read(packets, body, &mut head) {
            tracing::error!(name = self.name, "message body vanished while escaping length");
            panic!("length escape walked off the packet chain");
        }
        if !chain_write(packets, tail, &head)
            || !chain_write(packets, body, &(length as u32).to_be_bytes())
        {
            tracing::error!(name = self.name, "length escape tail slot out of range");
            panic!("length escape walked off the packet chain");
        }
    }

    /// Read the length field of a received message whose header starts at
    /// `header`, undoing the escape format if present.
    pub(crate) fn expand_length(
        &self,
        packets: &mut [Packet],
        header: ChainCursor,
        is_request: bool,
    ) -> Result<usize, Reason> {
        match self.length_style {
            LengthStyle::Fixed => Ok(self.length_param),
            LengthStyle::Variable => {
                let n = self.length_param;
                let p = &packets[header.packet];
                let mut length = 0usize;
                let mut all_set = true;
                for k in 0..n {
                    let byte = p.read_u8_at(header.offset + 1 + k);
                    all_set &= byte == 0xFF;
                    length = (length << 8) | byte as usize;
                }

                if all_set && n < 4 {
                    return self.special_expand_length(packets, header, is_request);
                }

                if n == 4 && length > i32::MAX as usize {
                    return Err(Reason::CorruptedPacket);
                }

                Ok(length)
            }
        }
    }

    fn special_expand_length(
        &self,
        packets: &mut [Packet],
        header: ChainCursor,
        is_request: bool,
    ) -> Result<usize, Reason> {
        let extra = if is_request { REQUEST_EXTRA } else { 0 };
        let body = ChainCursor::new(header.packet, header.offset + self.header_size() + extra);

        // True length, written over the first 4 body bytes by the sender.
        let mut len_bytes = [0u8; 4];
        if !chain_read(packets, body, &mut len_bytes) {
            return Err(Reason::CorruptedPacket);
        }
        let length = u32::from_be_bytes(len_bytes);
        if length > i32::MAX as u32 {
            return Err(Reason::CorruptedPacket);
        }

        // The relocated head bytes sit right after the body; restore them.
        let mut tail = body;
        tail.advance(packets, length as usize);
        let mut head = [0u8; 4];
        if !chain_read(packets, tail, &mut head) {
            return Err(Reason::CorruptedPacket);
        }
        if !chain_write(packets, body, &head) {
            return Err(Reason::CorruptedPacket);
        }

        Ok(length as usize)
    }
}

impl fmt::Display for InterfaceElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(id {})", self.name, self.id)
    }
}

fn chain_read(packets: &[Packet], base: ChainCursor, buf: &mut [u8]) -> bool {
    let mut c = base;
    for slot in buf.iter_mut() {
        match c.read_u8(packets) {
            Some(b) => *slot = b,
            None => return false,
        }
        c.advance(packets, 1);
    }
    true
}

fn chain_write(packets: &mut [Packet], base: ChainCursor, buf: &[u8]) -> bool {
    let mut c = base;
    for byte in buf {
        if !c.write_u8(packets, *byte) {
            return false;
        }
        c.advance(packets, 1);
    }
    true
}

// ── Registry ─────────────────────────────────────────────────────────────

struct TableEntry {
    element: InterfaceElement,
    handler: Option<Arc<dyn MessageHandler>>,
}

/// Maps message ids to their element and handler. An owned object passed by
/// reference into dispatch, never a process-wide singleton, so independent
/// interfaces (and tests) each get their own.
pub struct InterfaceTable {
    entries: Vec<Option<TableEntry>>,
}

impl InterfaceTable {
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(256);
        entries.resize_with(256, || None);
        let mut table = InterfaceTable { entries };
        table.register(InterfaceElement::REPLY);
        table
    }

    /// Register an element without a handler. Messages of this type can be
    /// sent but arriving ones are rejected until `serve` is called.
    pub fn register(&mut self, element: InterfaceElement) {
        self.entries[element.id as usize] = Some(TableEntry {
            element,
            handler: None,
        });
    }

    /// Register an element together with the handler that receives it.
    pub fn serve(&mut self, element: InterfaceElement, handler: Arc<dyn MessageHandler>) {
        self.entries[element.id as usize] = Some(TableEntry {
            element,
            handler: Some(handler),
        });
    }

    pub fn element(&self, id: MessageId) -> Option<&InterfaceElement> {
        self.entries[id as usize].as_ref().map(|e| &e.element)
    }

    pub fn handler(&self, id: MessageId) -> Option<&Arc<dyn MessageHandler>> {
        self.entries[id as usize]
            .as_ref()
            .and_then(|e| e.handler.as_ref())
    }
}

impl Default for InterfaceTable {
    fn default() -> Self {
        InterfaceTable::new()
    }
}
