//! Failure reasons and the handler traits the dispatcher calls into.

use std::net::SocketAddr;

use crate::bundle::{Payload, UnpackedMessageHeader};

/// Why a receive, send, or request failed. Wire corruption and transport
/// conditions are reported with these rather than panics; contract misuse
/// inside the library panics instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Reason {
    #[error("general network failure")]
    GeneralNetwork,
    #[error("corrupted packet")]
    CorruptedPacket,
    #[error("no such entry")]
    NonexistentEntry,
    #[error("timer expired")]
    TimerExpired,
    #[error("no such port")]
    NoSuchPort,
    #[error("resource unavailable")]
    ResourceUnavailable,
    #[error("transmit queue full")]
    TransmitQueueFull,
    #[error("window overflow")]
    WindowOverflow,
    #[error("channel lost")]
    ChannelLost,
}

/// Receives dispatched messages for one registered message id.
///
/// Handlers read their payload from the [`Payload`] reader; anything left
/// unread when the handler returns is logged by the dispatcher. A handler
/// that needs to reply captures whatever collaborators it needs (typically
/// the sending interface) at registration time and uses `header.reply_id`.
pub trait MessageHandler: Send + Sync {
    fn handle_message(
        &self,
        source: SocketAddr,
        header: &UnpackedMessageHeader,
        payload: &mut Payload<'_>,
    ) -> Result<(), Reason>;
}

/// Receives the reply to a request sent with `Bundle::start_request`, or the
/// exception that tells it no reply is coming.
pub trait ReplyMessageHandler: Send + Sync {
    fn handle_reply(
        &self,
        source: SocketAddr,
        header: &UnpackedMessageHeader,
        payload: &mut Payload<'_>,
    );

    /// Called instead of `handle_reply` when the request fails: the channel
    /// was torn down, the timeout expired, or the interface was dropped.
    fn handle_exception(&self, reason: Reason);
}

/// Channel-level interception point. When a channel carries a filter, every
/// message dispatched from that channel goes through it instead of straight
/// to the handler.
pub trait MessageFilter: Send + Sync {
    fn filter_message(
        &self,
        source: SocketAddr,
        header: &UnpackedMessageHeader,
        payload: &mut Payload<'_>,
        handler: &dyn MessageHandler,
    ) -> Result<(), Reason>;
}
