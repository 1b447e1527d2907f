//! Multi-packet bundles over loopback: reassembly and ack draining.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mercury_core::bundle::{Bundle, ReliableType};
use mercury_core::interface::InterfaceTable;

use crate::{bind_interface, wait_until, Collector, BULK};

#[tokio::test]
async fn fragmented_reliable_bundle_reassembles() -> Result<()> {
    let collector = Arc::new(Collector::default());
    let mut table = InterfaceTable::new();
    table.serve(BULK, collector.clone());
    let b = bind_interface(table).await?;
    let a = bind_interface(InterfaceTable::new()).await?;

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let mut bundle = Bundle::new();
    bundle.start_message(&BULK, ReliableType::Driver);
    bundle.write_bytes(&payload);
    assert!(bundle.is_multi_packet());
    a.send(b.local_addr()?, &mut bundle).await?;

    assert!(wait_until(|| collector.count() == 1, Duration::from_secs(5)).await);
    assert_eq!(collector.payloads()[0], payload);

    // Each fragment travelled with once-off reliability, so the receiver
    // acks every packet and the sender's resend queue drains on its own.
    assert!(wait_until(|| !a.has_unacked_packets(), Duration::from_secs(5)).await);

    a.shutdown();
    b.shutdown();
    Ok(())
}

#[tokio::test]
async fn oversize_length_message_round_trips_over_the_wire() -> Result<()> {
    let collector = Arc::new(Collector::default());
    let mut table = InterfaceTable::new();
    table.serve(BULK, collector.clone());
    let b = bind_interface(table).await?;
    let a = bind_interface(InterfaceTable::new()).await?;

    // Too long for the 2-byte length field: the escape encoding has to
    // carry the true length through the whole fragment chain.
    let payload: Vec<u8> = (0..80_000u32).map(|i| (i % 253) as u8).collect();
    let mut bundle = Bundle::new();
    bundle.start_message(&BULK, ReliableType::Driver);
    bundle.write_bytes(&payload);
    a.send(b.local_addr()?, &mut bundle).await?;

    assert!(wait_until(|| collector.count() == 1, Duration::from_secs(10)).await);
    assert_eq!(collector.payloads()[0], payload);
    assert!(wait_until(|| !a.has_unacked_packets(), Duration::from_secs(10)).await);

    a.shutdown();
    b.shutdown();
    Ok(())
}

#[tokio::test]
async fn unreliable_multi_packet_bundle_reassembles() -> Result<()> {
    let collector = Arc::new(Collector::default());
    let mut table = InterfaceTable::new();
    table.serve(BULK, collector.clone());
    let b = bind_interface(table).await?;
    let a = bind_interface(InterfaceTable::new()).await?;

    // Spans packets without being reliable; fragment footers alone must
    // carry it through reassembly.
    let payload = vec![0xA5u8; 4000];
    let mut bundle = Bundle::new();
    bundle.start_message(&BULK, ReliableType::Unreliable);
    bundle.write_bytes(&payload);
    a.send(b.local_addr()?, &mut bundle).await?;

    assert!(wait_until(|| collector.count() == 1, Duration::from_secs(5)).await);
    assert_eq!(collector.payloads()[0], payload);
    assert!(!a.has_unacked_packets());

    a.shutdown();
    b.shutdown();
    Ok(())
}
