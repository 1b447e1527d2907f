//! Outstanding request tracking and reply correlation.
//!
//! ReplyIDs are allocated at send time and written into the reserved slot
//! in each request's header. The manager is registered as the handler for
//! the REPLY element: when a reply arrives it looks up the id streamed as
//! the first 4 payload bytes and forwards to the stored handler. Requests
//! that will never be answered are failed through `handle_exception`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mercury_core::bundle::{Payload, UnpackedMessageHeader};
use mercury_core::packet::ReplyId;
use mercury_core::reason::{MessageHandler, Reason, ReplyMessageHandler};

use crate::lock;

struct PendingRequest {
    handler: Arc<dyn ReplyMessageHandler>,
    addr: SocketAddr,
    deadline: Option<Instant>,
}

struct Inner {
    next_id: ReplyId,
    pending: HashMap<ReplyId, PendingRequest>,
}

pub struct RequestManager {
    inner: Mutex<Inner>,
}

impl RequestManager {
    pub fn new() -> Self {
        RequestManager {
            inner: Mutex::new(Inner {
                next_id: 1,
                pending: HashMap::new(),
            }),
        }
    }

    /// Allocate a ReplyID for a request headed to `addr`. `timeout` of
    /// None means wait forever (the channel case: a channel either
    /// delivers or dies and cancels).
    pub fn assign(
        &self,
        handler: Arc<dyn ReplyMessageHandler>,
        timeout: Option<Duration>,
        addr: SocketAddr,
        now: Instant,
    ) -> ReplyId {
        let mut inner = lock(&self.inner);

        // Skip 0 and ids still in flight on wrap.
        let mut id = inner.next_id;
        while id == 0 || inner.pending.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);

        inner.pending.insert(
            id,
            PendingRequest {
                handler,
                addr,
                deadline: timeout.map(|t| now + t),
            },
        );

        id
    }

    pub fn num_pending(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    /// Expire requests whose deadline has passed.
    pub fn check_timeouts(&self, now: Instant) {
        let expired: Vec<(ReplyId, PendingRequest)> = {
            let mut inner = lock(&self.inner);
            let ids: Vec<ReplyId> = inner
                .pending
                .iter()
                .filter(|(_, r)| r.deadline.is_some_and(|d| d <= now))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.pending.remove(&id).map(|r| (id, r)))
                .collect()
        };

        for (id, request) in expired {
            tracing::warn!(reply_id = id, addr = %request.addr, "request timed out");
            request.handler.handle_exception(Reason::TimerExpired);
        }
    }

    /// Fail every request bound for `addr`; its channel is gone.
    pub fn cancel_requests_for(&self, addr: SocketAddr) {
        let cancelled: Vec<PendingRequest> = {
            let mut inner = lock(&self.inner);
            let ids: Vec<ReplyId> = inner
                .pending
                .iter()
                .filter(|(_, r)| r.addr == addr)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.pending.remove(&id))
                .collect()
        };

        if !cancelled.is_empty() {
            tracing::warn!(addr = %addr, count = cancelled.len(), "cancelling requests for lost channel");
        }
        for request in cancelled {
            request.handler.handle_exception(Reason::ChannelLost);
        }
    }

    /// Fail everything. Interface teardown.
    pub fn fail_all(&self, reason: Reason) {
        let pending: Vec<PendingRequest> = {
            let mut inner = lock(&self.inner);
            inner.pending.drain().map(|(_, r)| r).collect()
        };
        for request in pending {
            request.handler.handle_exception(reason);
        }
    }
}

impl Default for RequestManager {
    fn default() -> Self {
        RequestManager::new()
    }
}

/// Replies are dispatched here via the REPLY element registration.
impl MessageHandler for RequestManager {
    fn handle_message(
        &self,
        source: SocketAddr,
        header: &UnpackedMessageHeader,
        payload: &mut Payload<'_>,
    ) -> Result<(), Reason> {
        let id = payload.get_u32()?;

        let Some(request) = lock(&self.inner).pending.remove(&id) else {
            tracing::warn!(addr = %source, reply_id = id, "reply for unknown request discarded");
            let _ = payload.get_rest();
            return Ok(());
        };

        let mut header = header.clone();
        header.reply_id = id;
        request.handler.handle_reply(source, &header, payload);
        Ok(())
    }
}
