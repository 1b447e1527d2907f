//! mercury-core — packet framing, message encoding, and bundle
//! construction/dispatch. No sockets, no timers; mercury-net owns those.

pub mod bundle;
pub mod interface;
pub mod packet;
pub mod reason;

pub use bundle::{
    Bundle, BundleIter, BundlePiggyback, Payload, ReliableOrder, ReliableType, ReplyOrder,
    UnpackedMessageHeader,
};
pub use interface::{InterfaceElement, InterfaceTable, LengthStyle};
pub use packet::{ChannelId, MessageId, Packet, ReplyId, SeqNum, CHANNEL_ID_NULL, SEQ_NULL};
pub use reason::{MessageFilter, MessageHandler, Reason, ReplyMessageHandler};
