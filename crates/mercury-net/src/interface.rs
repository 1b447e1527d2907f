//! NetworkInterface — the socket, the channel map, and the send path.
//!
//! Sending is two-phase: a synchronous prepare step finalises the bundle,
//! assigns sequence numbers, packs every per-packet footer in wire order
//! (piggybacks, acks, sequence, first-request-offset, fragment range),
//! freezes the packets, and registers them for retransmission; then the
//! frozen images are transmitted without any lock held.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use mercury_core::bundle::{Bundle, BundlePiggyback, ReliableOrder};
use mercury_core::interface::{InterfaceElement, InterfaceTable};
use mercury_core::packet::{seq_mask, Packet, SeqNum};
use mercury_core::reason::{MessageHandler, Reason};

use crate::channel::Channel;
use crate::condemned::CondemnedChannels;
use crate::config::MercuryConfig;
use crate::lock;
use crate::once_off::{OnceOffReceiver, OnceOffSender};
use crate::request::RequestManager;

/// How long a dead peer's address keeps being ignored before any straggling
/// packets from it are assumed to have drained from the network.
const RECENTLY_DEAD_RETENTION: Duration = Duration::from_secs(60);

/// Counters, all monotonic. Read with `Ordering::Relaxed`.
#[derive(Default)]
pub struct InterfaceStats {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bundles_sent: AtomicU64,
    pub resends: AtomicU64,
    pub piggybacks_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub corrupted_packets: AtomicU64,
    pub duplicate_packets: AtomicU64,
}

pub struct NetworkInterface {
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) config: MercuryConfig,
    pub(crate) table: RwLock<InterfaceTable>,
    pub(crate) channels: DashMap<SocketAddr, Arc<Mutex<Channel>>>,
    pub(crate) once_off_sender: Mutex<OnceOffSender>,
    pub(crate) once_off_receiver: Mutex<OnceOffReceiver>,
    pub(crate) condemned: Mutex<CondemnedChannels>,
    pub(crate) requests: Arc<RequestManager>,
    pub(crate) next_seq: Mutex<SeqNum>,
    /// Addresses recently declared dead; packets from them are ignored so
    /// an in-flight straggler cannot resurrect an anonymous channel.
    pub(crate) recently_dead: Mutex<HashMap<SocketAddr, Instant>>,
    /// Acks owed for once-off reliable arrivals, flushed by the receive
    /// loop after each datagram is processed.
    pub(crate) pending_acks: Mutex<Vec<(SocketAddr, SeqNum)>>,
    pub(crate) stats: InterfaceStats,
    shutdown: broadcast::Sender<()>,
}

impl NetworkInterface {
    /// Bind a socket per the config and register the reply handler.
    pub async fn bind(
        config: MercuryConfig,
        mut table: InterfaceTable,
    ) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(&config.network.listen_addr).await?;
        let local = socket.local_addr()?;

        let requests = Arc::new(RequestManager::new());
        table.serve(
            InterfaceElement::REPLY,
            requests.clone() as Arc<dyn MessageHandler>,
        );

        let age_limit = config.reliability.condemned_age_limit();
        let resend_period = config.reliability.once_off_resend_period();
        let max_resends = config.reliability.once_off_max_resends;
        let (shutdown, _) = broadcast::channel(1);

        tracing::info!(addr = %local, "network interface bound");

        Ok(Arc::new(NetworkInterface {
            socket: Arc::new(socket),
            config,
            table: RwLock::new(table),
            channels: DashMap::new(),
            once_off_sender: Mutex::new(OnceOffSender::new(resend_period, max_resends)),
            once_off_receiver: Mutex::new(OnceOffReceiver::new()),
            condemned: Mutex::new(CondemnedChannels::new(age_limit)),
            requests,
            next_seq: Mutex::new(0),
            recently_dead: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(Vec::new()),
            stats: InterfaceStats::default(),
            shutdown,
        }))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn stats(&self) -> &InterfaceStats {
        &self.stats
    }

    /// Register a handler after binding.
    pub fn serve(&self, element: InterfaceElement, handler: Arc<dyn MessageHandler>) {
        self.table
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .serve(element, handler);
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Send an off-channel bundle. The bundle is consumed and reset.
    pub async fn send(&self, addr: SocketAddr, bundle: &mut Bundle) -> Result<(), Reason> {
        let packets = self.prepare_bundle(addr, bundle, None)?;
        bundle.clear();
        self.transmit(addr, &packets).await
    }

    /// Send a channel's pending bundle, leaving it with a fresh one.
    pub async fn send_on_channel(
        &self,
        channel: &Arc<Mutex<Channel>>,
    ) -> Result<(), Reason> {
        let (addr, packets) = {
            let mut ch = lock(channel);
            let addr = ch.addr();
            let mut bundle = ch.take_bundle();
            let packets = self.prepare_bundle(addr, &mut bundle, Some(&mut ch))?;
            (addr, packets)
        };
        self.transmit(addr, &packets).await
    }

    /// The synchronous half of sending: footers, sequence numbers, resend
    /// registration. Returns the frozen packet images to transmit.
    fn prepare_bundle(
        &self,
        addr: SocketAddr,
        bundle: &mut Bundle,
        mut channel: Option<&mut Channel>,
    ) -> Result<Vec<Arc<Packet>>, Reason> {
        bundle.finalise();

        let now = Instant::now();
        let on_channel = channel.is_some();

        // Requests sent on a channel never time out on their own: the
        // channel either delivers or dies and cancels them.
        let default_timeout = self.config.reliability.request_timeout();
        bundle.register_reply_orders(|handler, timeout| {
            let timeout = if on_channel {
                None
            } else {
                timeout.or(default_timeout)
            };
            self.requests.assign(handler.clone(), timeout, addr, now)
        });

        let reliable = bundle.is_reliable();
        let n = bundle.size_in_packets();
        let needs_seq = reliable || n > 1 || on_channel;

        let seqs: Vec<SeqNum> = if needs_seq {
            (0..n)
                .map(|_| match channel.as_mut() {
                    Some(ch) => ch.next_sequence_id(),
                    None => self.next_sequence_id(),
                })
                .collect()
        } else {
            Vec::new()
        };

        for i in 0..n {
            bundle.write_flags(i);
            let p = bundle.packet_mut(i);
            if needs_seq {
                p.enable_flags(Packet::FLAG_HAS_SEQUENCE_NUMBER);
                p.reserve_footer(4);
            }
            if on_channel {
                p.enable_flags(Packet::FLAG_ON_CHANNEL);
            }
        }

        let ack = bundle.ack();
        for i in 0..n {
            let seq = seqs.get(i).copied();
            let frag = (n > 1).then(|| (seqs[0], seqs[n - 1]));

            let (packets, piggies) = bundle.packets_and_piggybacks_mut();
            let p = &mut packets[i];
            let body_end = p.msg_end();
            p.grow_footers();

            if p.has_flags(Packet::FLAG_HAS_PIGGYBACKS) {
                pack_piggybacks(p, piggies);
                self.stats
                    .piggybacks_sent
                    .fetch_add(piggies.len() as u64, Ordering::Relaxed);
            }
            if p.has_flags(Packet::FLAG_HAS_ACKS) {
                if let Some(ack) = ack {
                    p.pack_footer_u8(1);
                    p.pack_footer_u32(ack);
                }
            }
            if let Some(seq) = seq {
                p.set_seq(seq);
                p.pack_footer_u32(seq);
            }
            if p.has_flags(Packet::FLAG_HAS_REQUESTS) {
                p.pack_footer_u16(p.first_request_offset());
            }
            if p.has_flags(Packet::FLAG_IS_FRAGMENT) {
                let (first, last) = frag.unwrap_or((0, 0));
                p.set_fragment_range(first, last);
                p.pack_footer_u32(last);
                p.pack_footer_u32(first);
            }
            debug_assert_eq!(p.msg_end(), body_end);

            p.write_header();
        }

        // Reliable orders must come off before the chain is taken; the
        // extraction walks the gap markers per packet.
        let per_packet_orders: Vec<Vec<ReliableOrder>> = if reliable && on_channel {
            (0..n).map(|i| bundle.reliable_orders_for(i)).collect()
        } else {
            Vec::new()
        };
        let critical = bundle.is_critical();

        let frozen: Vec<Arc<Packet>> =
            bundle.take_packets().into_iter().map(Arc::new).collect();

        if reliable {
            match channel {
                Some(ch) => {
                    for (i, packet) in frozen.iter().enumerate() {
                        ch.add_resend_timer(
                            packet.seq(),
                            packet.clone(),
                            per_packet_orders.get(i).cloned().unwrap_or_default(),
                            critical,
                            now,
                        );
                    }
                }
                None => {
                    let mut sender = lock(&self.once_off_sender);
                    for packet in &frozen {
                        sender.add_once_off_resend_timer(addr, packet.seq(), packet.clone(), now);
                    }
                }
            }
        }

        self.stats.bundles_sent.fetch_add(1, Ordering::Relaxed);
        Ok(frozen)
    }

    fn next_sequence_id(&self) -> SeqNum {
        let mut next = lock(&self.next_seq);
        let seq = *next;
        *next = seq_mask(seq.wrapping_add(1));
        seq
    }

    async fn transmit(&self, addr: SocketAddr, packets: &[Arc<Packet>]) -> Result<(), Reason> {
        for packet in packets {
            self.send_packet(addr, packet.clone()).await?;
        }
        Ok(())
    }

    /// Transmit one packet, honoring the artificial drop/latency settings.
    pub(crate) async fn send_packet(
        &self,
        addr: SocketAddr,
        packet: Arc<Packet>,
    ) -> Result<(), Reason> {
        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_sent
            .fetch_add(packet.total_size() as u64, Ordering::Relaxed);

        let drop_per_million = self.config.debug.artificial_drop_per_million;
        if drop_per_million > 0
            && rand::thread_rng().gen_range(0..1_000_000u32) < drop_per_million
        {
            tracing::debug!(addr = %addr, seq = packet.seq(), "artificially dropping packet");
            return Ok(());
        }

        let max_latency = self.config.debug.artificial_latency_max_ms;
        if max_latency > 0 {
            let min_latency = self.config.debug.artificial_latency_min_ms.min(max_latency);
            let delay =
                Duration::from_millis(rand::thread_rng().gen_range(min_latency..=max_latency));
            let socket = self.socket.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = socket.send_to(packet.as_bytes(), addr).await {
                    tracing::warn!(addr = %addr, error = %e, "delayed send failed");
                }
            });
            return Ok(());
        }

        self.basic_send(addr, packet.as_bytes()).await
    }

    /// One datagram out, with a bounded retry on transient conditions.
    async fn basic_send(&self, addr: SocketAddr, bytes: &[u8]) -> Result<(), Reason> {
        let mut attempts = 0;
        loop {
            match self.socket.send_to(bytes, addr).await {
                Ok(_) => return Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) && attempts < 3 =>
                {
                    attempts += 1;
                    tokio::task::yield_now().await;
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    tracing::warn!(addr = %addr, "send refused; no such port");
                    return Err(Reason::NoSuchPort);
                }
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "send failed");
                    return Err(Reason::GeneralNetwork);
                }
            }
        }
    }

    /// Send any acks queued by the receive pipeline.
    pub async fn flush_acks(&self) {
        let pending: Vec<(SocketAddr, SeqNum)> =
            lock(&self.pending_acks).drain(..).collect();
        for (addr, seq) in pending {
            let mut bundle = Bundle::new();
            bundle.add_ack(seq);
            if let Err(reason) = self.send(addr, &mut bundle).await {
                tracing::warn!(addr = %addr, seq, %reason, "failed to send ack");
            }
        }
    }

    // ── Channel management ───────────────────────────────────────────────

    /// Look up the channel for `addr`, creating an anonymous external one
    /// when asked and the address is not recently dead.
    pub fn find_channel(
        &self,
        addr: SocketAddr,
        create_anonymous: bool,
    ) -> Option<Arc<Mutex<Channel>>> {
        if let Some(entry) = self.channels.get(&addr) {
            return Some(entry.clone());
        }
        if !create_anonymous {
            return None;
        }
        if lock(&self.recently_dead).contains_key(&addr) {
            tracing::debug!(addr = %addr, "ignoring packet from recently dead address");
            return None;
        }

        tracing::debug!(addr = %addr, "creating anonymous channel");
        let channel = Arc::new(Mutex::new(Channel::new_anonymous(addr)));
        self.channels.insert(addr, channel.clone());
        Some(channel)
    }

    pub fn register_channel(&self, channel: Arc<Mutex<Channel>>) {
        let addr = lock(&channel).addr();
        if self.channels.insert(addr, channel).is_some() {
            tracing::warn!(addr = %addr, "replaced an existing channel");
        }
    }

    /// Remove a channel from service and file it with the condemned set;
    /// its outstanding requests fail with `ChannelLost`.
    pub fn condemn_channel(&self, addr: SocketAddr) {
        let Some((_, channel)) = self.channels.remove(&addr) else {
            return;
        };
        {
            let mut ch = lock(&channel);
            ch.set_condemned();
            ch.bundle_mut().cancel_requests();
        }
        self.requests.cancel_requests_for(addr);
        lock(&self.condemned).add(channel);
    }

    /// The peer at `addr` is gone: fail its requests, drop its unacked
    /// once-off packets, condemn its channel, and remember the address so
    /// stragglers cannot resurrect it.
    pub fn on_address_dead(&self, addr: SocketAddr) {
        tracing::warn!(addr = %addr, "address declared dead");

        lock(&self.once_off_sender).on_address_dead(addr);
        lock(&self.once_off_receiver).on_address_dead(addr);
        self.requests.cancel_requests_for(addr);

        if let Some((_, channel)) = self.channels.remove(&addr) {
            let mut ch = lock(&channel);
            ch.set_remote_failed();
            ch.set_condemned();
            ch.bundle_mut().cancel_requests();
            drop(ch);
            lock(&self.condemned).add(channel);
        }

        lock(&self.recently_dead).insert(addr, Instant::now());
    }

    /// Drop dead-address records old enough that no straggler can still be
    /// in flight, so the map does not grow without bound.
    fn forget_dead_addresses(&self, now: Instant) {
        lock(&self.recently_dead)
            .retain(|_, at| now.saturating_duration_since(*at) < RECENTLY_DEAD_RETENTION);
    }

    pub fn has_unacked_packets(&self) -> bool {
        lock(&self.once_off_sender).has_unacked_packets()
            || !lock(&self.condemned).is_empty()
            || self
                .channels
                .iter()
                .any(|entry| lock(entry.value()).has_unacked_packets())
    }

    pub fn delete_finished_channels(&self) -> usize {
        lock(&self.condemned).delete_finished_channels(Instant::now())
    }

    pub fn requests(&self) -> &Arc<RequestManager> {
        &self.requests
    }

    /// Drive resends and the condemned sweep until nothing is in flight,
    /// or give up after `timeout`. Shutdown helper.
    pub async fn process_until_channels_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.has_unacked_packets() {
            if Instant::now() >= deadline {
                tracing::warn!("gave up waiting for in-flight packets to drain");
                return false;
            }
            self.delete_finished_channels();
            self.process_once_off_resends().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    async fn process_once_off_resends(&self) {
        let due = lock(&self.once_off_sender).process_resends(Instant::now());
        for (addr, packet) in due {
            self.stats.resends.fetch_add(1, Ordering::Relaxed);
            if let Err(reason) = self.send_packet(addr, packet).await {
                tracing::warn!(addr = %addr, %reason, "resend failed");
            }
        }
    }

    // ── Background tasks ─────────────────────────────────────────────────

    /// Spawn the receive loop and the maintenance timers. They run until
    /// `shutdown` is called.
    pub fn start(self: &Arc<Self>) {
        let iface = self.clone();
        let mut rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; Packet::MAX_SIZE];
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    result = iface.socket.recv_from(&mut buf) => match result {
                        Ok((n, addr)) => {
                            if let Err(reason) = iface.process_packet_from_stream(addr, &buf[..n]) {
                                tracing::warn!(addr = %addr, %reason, "dropped incoming packet");
                            }
                            iface.flush_acks().await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "recv failed");
                        }
                    }
                }
            }
            tracing::debug!("receive loop stopped");
        });

        let iface = self.clone();
        let mut rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let cfg = &iface.config.reliability;
            let mut resend_tick = tokio::time::interval(cfg.once_off_resend_period());
            let mut receipt_tick = tokio::time::interval(cfg.receipt_tick());
            let mut fragment_tick = tokio::time::interval(cfg.fragment_max_age());
            let mut sweep_tick = tokio::time::interval(Duration::from_secs(1));
            let fragment_max_age = cfg.fragment_max_age();

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = resend_tick.tick() => {
                        iface.process_once_off_resends().await;
                    }
                    _ = receipt_tick.tick() => {
                        lock(&iface.once_off_receiver).tick_receipts();
                    }
                    _ = fragment_tick.tick() => {
                        lock(&iface.once_off_receiver)
                            .tick_fragments(Instant::now(), fragment_max_age);
                    }
                    _ = sweep_tick.tick() => {
                        let now = Instant::now();
                        iface.delete_finished_channels();
                        iface.requests.check_timeouts(now);
                        iface.forget_dead_addresses(now);
                    }
                }
            }
            tracing::debug!("maintenance loop stopped");
        });
    }

    /// Stop the background tasks and fail every outstanding request.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.requests.fail_all(Reason::GeneralNetwork);
        for entry in self.channels.iter() {
            lock(entry.value()).bundle_mut().cancel_requests();
        }
    }
}

/// Write the staged piggyback blocks into `p`'s footer region, last block
/// marked by a one's-complemented length.
fn pack_piggybacks(p: &mut Packet, piggies: &[BundlePiggyback]) {
    let block_end = p.msg_end();

    for (k, pb) in piggies.iter().enumerate() {
        let len = pb.len as i16;
        let last = k + 1 == piggies.len();
        p.pack_footer_i16(if last { !len } else { len });

        let at = p.pack_footer_region(pb.len as usize);
        let mut w = at;
        p.write_at(w, &pb.flags.to_be_bytes());
        w += 2;
        for order in &pb.orders {
            let segment = pb.packet.bytes_at(order.offset, order.len).to_vec();
            p.write_at(w, &segment);
            w += order.len;
        }
        p.write_at(w, &pb.seq.to_be_bytes());
        w += 4;
        if pb.flags & Packet::FLAG_HAS_PIGGYBACKS != 0 {
            if let Some((offset, len)) = pb.packet.piggy_footers() {
                let sub = pb.packet.bytes_at(offset, len).to_vec();
                p.write_at(w, &sub);
                w += len;
            }
        }
        debug_assert_eq!(w, at + pb.len as usize);
    }

    // Remember where this packet's own piggy block lives so it can ride
    // along if the packet itself is ever piggybacked.
    p.set_piggy_footers(p.msg_end(), block_end - p.msg_end());
}
