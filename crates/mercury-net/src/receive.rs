//! Incoming datagram pipeline.
//!
//! Footers come off in the order they were packed: piggybacks, channel id,
//! acks, sequence number, first-request-offset, fragment range. What
//! remains is pure message body, which is either dispatched immediately or
//! parked in a fragment chain until its bundle completes. Every corruption
//! path rejects the whole datagram; a bad footer means nothing after it can
//! be trusted.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use mercury_core::bundle::Bundle;
use mercury_core::packet::{seq_less_than, Packet};
use mercury_core::reason::Reason;

use crate::channel::Channel;
use crate::interface::NetworkInterface;
use crate::lock;
use crate::once_off::FragmentedBundle;

impl NetworkInterface {
    /// Entry point for one received datagram.
    pub fn process_packet_from_stream(
        &self,
        addr: SocketAddr,
        bytes: &[u8],
    ) -> Result<(), Reason> {
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);

        if bytes.len() < Packet::HEADER_SIZE {
            self.stats.corrupted_packets.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(addr = %addr, len = bytes.len(), "undersized datagram");
            return Err(Reason::CorruptedPacket);
        }

        let mut packet = Packet::from_bytes(bytes)?;
        let flags = packet.read_header();
        if flags & !Packet::KNOWN_FLAGS != 0 {
            self.stats.corrupted_packets.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(addr = %addr, flags, "datagram with unknown flags");
            return Err(Reason::CorruptedPacket);
        }

        self.process_packet(addr, packet, false)
    }

    pub(crate) fn process_packet(
        &self,
        addr: SocketAddr,
        mut packet: Packet,
        from_piggyback: bool,
    ) -> Result<(), Reason> {
        let flags = packet.flags();

        // Piggybacks carry older data than their carrier; deliver them
        // first so messages arrive in something closer to send order.
        if flags & Packet::FLAG_HAS_PIGGYBACKS != 0 {
            let piggies = packet.unpack_piggybacks().map_err(|e| {
                self.stats.corrupted_packets.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(addr = %addr, "corrupt piggyback block");
                e
            })?;
            for piggy in piggies {
                if piggy.flags() & !Packet::KNOWN_FLAGS != 0 {
                    self.stats.corrupted_packets.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(addr = %addr, flags = piggy.flags(), "piggyback with unknown flags");
                    return Err(Reason::CorruptedPacket);
                }
                self.process_packet(addr, piggy, true)?;
            }
        }

        let mut channel: Option<Arc<Mutex<Channel>>> = None;
        if flags & Packet::FLAG_INDEXED_CHANNEL != 0 {
            let id = packet.strip_footer_u32()?;
            packet.set_channel_id(id);
            // Live indexed routing happens above this crate; only
            // condemned channels remain findable by id here, so late
            // packets can still deliver their acks.
            channel = lock(&self.condemned).find(id);
            if channel.is_none() {
                tracing::warn!(addr = %addr, id, "packet for unknown indexed channel");
                return Err(Reason::NonexistentEntry);
            }
        } else if flags & Packet::FLAG_ON_CHANNEL != 0 {
            channel = self.find_channel(addr, true);
            if channel.is_none() {
                // Recently dead address; silently drop.
                return Ok(());
            }
        }

        if let Some(ch) = &channel {
            lock(ch).on_packet_received(Instant::now());
        }

        if flags & Packet::FLAG_HAS_ACKS != 0 {
            let count = packet.strip_footer_u8()?;
            if count == 0 {
                self.stats.corrupted_packets.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(addr = %addr, "ack footer with zero count");
                return Err(Reason::CorruptedPacket);
            }
            for _ in 0..count {
                let seq = packet.strip_footer_u32()?;
                match &channel {
                    Some(ch) => lock(ch).handle_ack(seq),
                    None => {
                        if !lock(&self.once_off_sender).del_once_off_resend_timer(addr, seq) {
                            tracing::debug!(addr = %addr, seq, "ack for unknown once-off packet");
                        }
                    }
                }
            }
        }

        if flags & Packet::FLAG_HAS_SEQUENCE_NUMBER != 0 {
            let seq = packet.strip_footer_u32()?;
            packet.set_seq(seq);
        } else if flags & Packet::FLAG_IS_RELIABLE != 0 {
            self.stats.corrupted_packets.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(addr = %addr, "reliable packet without a sequence number");
            return Err(Reason::CorruptedPacket);
        }

        if flags & Packet::FLAG_IS_RELIABLE != 0 && channel.is_none() {
            // Once-off: ack every copy so the sender stops resending, but
            // deliver only the first.
            lock(&self.pending_acks).push((addr, packet.seq()));
            if lock(&self.once_off_receiver).on_reliable_received(addr, packet.seq()) {
                self.stats.duplicate_packets.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    addr = %addr,
                    seq = packet.seq(),
                    from_piggyback,
                    "duplicate once-off reliable packet"
                );
                return Ok(());
            }
        }

        if flags & Packet::FLAG_HAS_REQUESTS != 0 {
            let offset = packet.strip_footer_u16()?;
            packet.set_first_request_offset(offset);
        }

        if flags & Packet::FLAG_IS_FRAGMENT != 0 {
            let last = packet.strip_footer_u32()?;
            let first = packet.strip_footer_u32()?;
            let seq = packet.seq();
            if seq_less_than(seq, first) || seq_less_than(last, seq) {
                self.stats.corrupted_packets.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(addr = %addr, seq, first, last, "fragment outside its advertised range");
                return Err(Reason::CorruptedPacket);
            }
            packet.set_fragment_range(first, last);
            return self.process_fragment(addr, packet, channel);
        }

        self.dispatch_bundle(addr, vec![packet], channel)
    }

    fn process_fragment(
        &self,
        addr: SocketAddr,
        packet: Packet,
        channel: Option<Arc<Mutex<Channel>>>,
    ) -> Result<(), Reason> {
        let now = Instant::now();

        let complete = match &channel {
            Some(ch) => {
                let mut guard = lock(ch);
                join_fragment(guard.fragments_mut(), addr, packet, now)
            }
            None => {
                let mut rx = lock(&self.once_off_receiver);
                let mut slot = rx.fragments_mut().remove(&addr);
                let complete = join_fragment(&mut slot, addr, packet, now);
                if let Some(frag) = slot {
                    rx.fragments_mut().insert(addr, frag);
                }
                complete
            }
        };

        match complete {
            Some(chain) => self.dispatch_bundle(addr, chain, channel),
            None => Ok(()),
        }
    }

    fn dispatch_bundle(
        &self,
        addr: SocketAddr,
        chain: Vec<Packet>,
        channel: Option<Arc<Mutex<Channel>>>,
    ) -> Result<(), Reason> {
        let filter = channel.as_ref().and_then(|ch| lock(ch).filter());
        let mut bundle = Bundle::from_chain(chain);

        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        let result = bundle.dispatch_messages(&table, addr, filter.as_deref());
        if result.is_err() {
            self.stats.corrupted_packets.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

/// Fold the next fragment into the chain. Some(chain) once the bundle is
/// complete. Out-of-order fragments discard the chain; there is no
/// reordering buffer at this layer.
fn join_fragment(
    slot: &mut Option<FragmentedBundle>,
    addr: SocketAddr,
    packet: Packet,
    now: Instant,
) -> Option<Vec<Packet>> {
    let (first, _) = packet.fragment_range();
    let seq = packet.seq();

    match slot {
        None => {
            if seq == first {
                *slot = Some(FragmentedBundle::new(packet, now));
            } else {
                tracing::warn!(addr = %addr, seq, first, "fragment with no chain in progress");
            }
            None
        }
        Some(frag) => {
            if seq == frag.expected_seq() {
                let complete = frag.add(packet, now);
                if complete.is_some() {
                    *slot = None;
                }
                complete
            } else if seq == first {
                tracing::warn!(addr = %addr, seq, "restarting fragment chain");
                *slot = Some(FragmentedBundle::new(packet, now));
                None
            } else {
                tracing::warn!(addr = %addr, seq, "out-of-order fragment; discarding chain");
                *slot = None;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mercury_core::bundle::{Payload, UnpackedMessageHeader};
    use mercury_core::interface::{InterfaceElement, InterfaceTable, LengthStyle};
    use mercury_core::packet::SeqNum;
    use mercury_core::reason::MessageHandler;
    use std::sync::Mutex as StdMutex;

    use crate::config::MercuryConfig;

    const MSG: InterfaceElement = InterfaceElement::new("msg", 5, LengthStyle::Variable, 1);

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<Vec<u8>>>,
    }

    impl MessageHandler for Recorder {
        fn handle_message(
            &self,
            _source: SocketAddr,
            _header: &UnpackedMessageHeader,
            payload: &mut Payload<'_>,
        ) -> Result<(), Reason> {
            self.seen.lock().unwrap().push(payload.get_rest().to_vec());
            Ok(())
        }
    }

    async fn test_interface(recorder: Arc<Recorder>) -> Arc<NetworkInterface> {
        let mut config = MercuryConfig::default();
        config.network.listen_addr = "127.0.0.1:0".to_string();
        let mut table = InterfaceTable::new();
        table.serve(MSG, recorder);
        NetworkInterface::bind(config, table).await.unwrap()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:39999".parse().unwrap()
    }

    /// One var1 message of `payload`, reliable off-channel with `seq`.
    fn wire_reliable(seq: SeqNum, payload: &[u8]) -> Vec<u8> {
        let mut p = Packet::new();
        let at = p.grow(2 + payload.len());
        p.write_at(at, &[5, payload.len() as u8]);
        p.write_at(at + 2, payload);
        p.enable_flags(Packet::FLAG_IS_RELIABLE | Packet::FLAG_HAS_SEQUENCE_NUMBER);
        p.reserve_footer(4);
        p.grow_footers();
        p.pack_footer_u32(seq);
        p.write_header();
        p.as_bytes().to_vec()
    }

    /// One fragment of a reliable off-channel bundle.
    fn wire_fragment(seq: SeqNum, first: SeqNum, last: SeqNum, payload: &[u8]) -> Vec<u8> {
        let mut p = Packet::new();
        let at = p.grow(2 + payload.len());
        p.write_at(at, &[5, payload.len() as u8]);
        p.write_at(at + 2, payload);
        p.enable_flags(
            Packet::FLAG_IS_RELIABLE
                | Packet::FLAG_HAS_SEQUENCE_NUMBER
                | Packet::FLAG_IS_FRAGMENT,
        );
        p.reserve_footer(4 + 8);
        p.grow_footers();
        p.pack_footer_u32(seq);
        p.pack_footer_u32(last);
        p.pack_footer_u32(first);
        p.write_header();
        p.as_bytes().to_vec()
    }

    #[tokio::test]
    async fn reliable_packet_is_acked_and_deduplicated() {
        let recorder = Arc::new(Recorder::default());
        let iface = test_interface(recorder.clone()).await;

        let bytes = wire_reliable(7, b"hello");
        iface.process_packet_from_stream(peer(), &bytes).unwrap();
        iface.process_packet_from_stream(peer(), &bytes).unwrap();

        // Delivered once, acked twice.
        assert_eq!(&*recorder.seen.lock().unwrap(), &[b"hello".to_vec()]);
        assert_eq!(&*lock(&iface.pending_acks), &[(peer(), 7), (peer(), 7)]);
        assert_eq!(iface.stats.duplicate_packets.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unknown_flags_are_rejected() {
        let recorder = Arc::new(Recorder::default());
        let iface = test_interface(recorder).await;

        assert_eq!(
            iface.process_packet_from_stream(peer(), &[0xFF, 0xFF, 1, 2]),
            Err(Reason::CorruptedPacket)
        );
        assert_eq!(
            iface.process_packet_from_stream(peer(), &[0x01]),
            Err(Reason::CorruptedPacket)
        );
        assert_eq!(iface.stats.corrupted_packets.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn fragments_dispatch_only_when_complete() {
        let recorder = Arc::new(Recorder::default());
        let iface = test_interface(recorder.clone()).await;

        let f1 = wire_fragment(10, 10, 11, b"first");
        let f2 = wire_fragment(11, 10, 11, b"second");

        iface.process_packet_from_stream(peer(), &f1).unwrap();
        assert!(recorder.seen.lock().unwrap().is_empty());

        iface.process_packet_from_stream(peer(), &f2).unwrap();
        assert_eq!(
            &*recorder.seen.lock().unwrap(),
            &[b"first".to_vec(), b"second".to_vec()]
        );
    }

    #[tokio::test]
    async fn out_of_order_fragment_discards_chain() {
        let recorder = Arc::new(Recorder::default());
        let iface = test_interface(recorder.clone()).await;

        let f1 = wire_fragment(20, 20, 22, b"a");
        let f3 = wire_fragment(22, 20, 22, b"c");

        iface.process_packet_from_stream(peer(), &f1).unwrap();
        iface.process_packet_from_stream(peer(), &f3).unwrap();
        assert!(recorder.seen.lock().unwrap().is_empty());
        assert!(lock(&iface.once_off_receiver)
            .fragments_mut()
            .get(&peer())
            .is_none());
    }

    #[tokio::test]
    async fn acks_clear_once_off_resends() {
        let recorder = Arc::new(Recorder::default());
        let iface = test_interface(recorder).await;

        lock(&iface.once_off_sender).add_once_off_resend_timer(
            peer(),
            3,
            Arc::new(Packet::new()),
            Instant::now(),
        );
        assert!(iface.has_unacked_packets());

        // Hand-built ack-only packet.
        let mut p = Packet::new();
        p.enable_flags(Packet::FLAG_HAS_ACKS);
        p.reserve_footer(1 + 4);
        p.grow_footers();
        p.pack_footer_u8(1);
        p.pack_footer_u32(3);
        p.write_header();

        iface
            .process_packet_from_stream(peer(), p.as_bytes())
            .unwrap();
        assert!(!iface.has_unacked_packets());
    }
}
