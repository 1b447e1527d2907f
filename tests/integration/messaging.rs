//! Plain messages and request/reply between two interfaces.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mercury_core::bundle::{Bundle, ReliableType};
use mercury_core::interface::InterfaceTable;
use mercury_core::reason::Reason;
use mercury_net::MercuryConfig;

use crate::{
    bind_interface, bind_with, wait_until, Collector, ReplyWaiter, RequestSink, ECHO,
};

#[tokio::test]
async fn plain_messages_arrive() -> Result<()> {
    let collector = Arc::new(Collector::default());
    let mut table = InterfaceTable::new();
    table.serve(ECHO, collector.clone());
    let b = bind_interface(table).await?;
    let a = bind_interface(InterfaceTable::new()).await?;

    let mut bundle = Bundle::new();
    bundle.start_message(&ECHO, ReliableType::Unreliable);
    bundle.write_bytes(b"hello");
    bundle.start_message(&ECHO, ReliableType::Unreliable);
    bundle.write_bytes(b"world");
    a.send(b.local_addr()?, &mut bundle).await?;

    assert!(wait_until(|| collector.count() == 2, Duration::from_secs(5)).await);
    assert_eq!(collector.payloads(), vec![b"hello".to_vec(), b"world".to_vec()]);

    a.shutdown();
    b.shutdown();
    Ok(())
}

#[tokio::test]
async fn request_reply_round_trip() -> Result<()> {
    let (sink, mut requests) = RequestSink::new();
    let mut table = InterfaceTable::new();
    table.serve(ECHO, Arc::new(sink));
    let b = bind_interface(table).await?;
    let a = bind_interface(InterfaceTable::new()).await?;

    // The serving side answers each request with the payload reversed.
    let server = b.clone();
    tokio::spawn(async move {
        while let Some((source, reply_id, payload)) = requests.recv().await {
            let reversed: Vec<u8> = payload.iter().rev().copied().collect();
            let mut bundle = Bundle::new();
            bundle.start_reply(reply_id, ReliableType::Unreliable);
            bundle.write_bytes(&reversed);
            if let Err(reason) = server.send(source, &mut bundle).await {
                tracing::warn!(%reason, "failed to send test reply");
            }
        }
    });

    let (waiter, mut replies) = ReplyWaiter::new();
    let mut bundle = Bundle::new();
    bundle.start_request(&ECHO, waiter, None, ReliableType::Unreliable);
    bundle.write_bytes(b"palindrome");
    a.send(b.local_addr()?, &mut bundle).await?;

    let reply = tokio::time::timeout(Duration::from_secs(5), replies.recv())
        .await?
        .expect("reply channel closed");
    assert_eq!(reply.unwrap(), b"emordnilap".to_vec());

    a.shutdown();
    b.shutdown();
    Ok(())
}

#[tokio::test]
async fn unanswered_request_times_out() -> Result<()> {
    // A collector never replies, so the request must fail once the
    // maintenance sweep notices the deadline has passed.
    let collector = Arc::new(Collector::default());
    let mut table = InterfaceTable::new();
    table.serve(ECHO, collector.clone());
    let b = bind_interface(table).await?;

    let mut config = MercuryConfig::default();
    config.network.listen_addr = "127.0.0.1:0".to_string();
    config.reliability.request_timeout_ms = 300;
    let a = bind_with(config, InterfaceTable::new()).await?;

    let (waiter, mut replies) = ReplyWaiter::new();
    let mut bundle = Bundle::new();
    bundle.start_request(&ECHO, waiter, None, ReliableType::Unreliable);
    bundle.write_bytes(b"anyone there?");
    a.send(b.local_addr()?, &mut bundle).await?;

    assert!(wait_until(|| collector.count() == 1, Duration::from_secs(5)).await);

    let outcome = tokio::time::timeout(Duration::from_secs(5), replies.recv())
        .await?
        .expect("reply channel closed");
    assert!(matches!(outcome, Err(Reason::TimerExpired)));
    assert_eq!(a.requests().num_pending(), 0);

    a.shutdown();
    b.shutdown();
    Ok(())
}
