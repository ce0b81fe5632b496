use std::net::IpAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;

use crate::protocol::PtpMessageType;
use crate::server::subscription::SubscriptionClient;
use crate::server::worker::SendWorker;
use crate::timestamping::enable_dscp;

use super::{client_port, test_server_config, test_stats};

fn make_subscription(
    worker: &SendWorker,
    msg_type: PtpMessageType,
    clock: u64,
    stats: Arc<crate::stats::AtomicStats>,
) -> Arc<SubscriptionClient> {
    let addr = "127.0.0.1:12345".parse().unwrap();
    Arc::new(SubscriptionClient::new(
        worker.queue(),
        addr,
        addr,
        msg_type,
        client_port(clock, 1),
        stats,
        Duration::from_millis(10),
        SystemTime::now() + Duration::from_secs(60),
    ))
}

// ===== Queue processing =====

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_drains_queue_of_all_kinds() {
    let config = test_server_config(1);
    let stats = test_stats();
    let worker = Arc::new(SendWorker::new(0, config, stats.clone()));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&worker).run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    for msg_type in [
        PtpMessageType::Announce,
        PtpMessageType::Sync,
        PtpMessageType::DelayResp,
        PtpMessageType::Signaling,
    ] {
        let sub = make_subscription(&worker, msg_type, 1234, stats.clone());
        for _ in 0..10 {
            sub.enqueue_once();
            // Yield so the single consumer keeps up with a queue of 100.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    let snap = stats.snapshot();

    // Announce and Sync ticks produce sends.
    assert_eq!(snap.tx_for(PtpMessageType::Announce), 10);
    assert_eq!(snap.tx_for(PtpMessageType::Sync), 10);
    // Every Sync either produced a Follow_Up or counted a missing
    // timestamp; nothing is silently lost.
    assert_eq!(snap.tx_for(PtpMessageType::FollowUp) + snap.tx_ts_missing, 10);
    // DelayResp and Signaling items without a pending payload are
    // consumed without sending.
    assert_eq!(snap.tx_for(PtpMessageType::DelayResp), 0);
    assert_eq!(snap.tx_for(PtpMessageType::Signaling), 0);
    assert_eq!(snap.queue_full, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_sends_pending_delay_resp() {
    let config = test_server_config(1);
    let stats = test_stats();
    let worker = Arc::new(SendWorker::new(0, config, stats.clone()));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&worker).run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A client socket to actually receive the response.
    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client.local_addr().unwrap();

    let sub = Arc::new(SubscriptionClient::new(
        worker.queue(),
        client_addr,
        client_addr,
        PtpMessageType::DelayResp,
        client_port(1234, 1),
        stats.clone(),
        Duration::from_secs(1),
        SystemTime::now() + Duration::from_secs(60),
    ));
    sub.set_delay_resp(crate::server::DelayRespPayload {
        sequence_id: 99,
        correction_field: 7,
        receive_timestamp: crate::protocol::PtpTimestamp::new(1_000, 2_000),
        requesting_port: client_port(1234, 1),
    });
    sub.enqueue_once();

    let mut buf = [0u8; 128];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("delay_resp within deadline")
        .unwrap();
    let message = crate::protocol::PtpMessage::decode(&buf[..len]).unwrap();
    assert_eq!(message.header.message_type, PtpMessageType::DelayResp);
    assert_eq!(message.header.sequence_id, 99);
    assert_eq!(message.header.correction_field, 7);
    assert_eq!(stats.snapshot().tx_for(PtpMessageType::DelayResp), 1);
}

// ===== Inventory =====

#[test]
fn test_register_and_find_subscription() {
    let config = test_server_config(1);
    let stats = test_stats();
    let worker = SendWorker::new(0, config, stats.clone());

    let sub = make_subscription(&worker, PtpMessageType::Announce, 1234, stats);
    worker.register_subscription(client_port(1234, 1), PtpMessageType::Announce, sub);

    assert!(worker
        .find_subscription(&client_port(1234, 1), PtpMessageType::Announce)
        .is_some());
    assert!(worker
        .find_subscription(&client_port(1234, 2), PtpMessageType::Announce)
        .is_none());
    assert!(worker
        .find_subscription(&client_port(1234, 1), PtpMessageType::Sync)
        .is_none());
}

#[test]
fn test_find_or_register_reuses_instance() {
    let config = test_server_config(1);
    let stats = test_stats();
    let worker = SendWorker::new(0, config, stats.clone());

    let first = worker.find_or_register(client_port(1, 1), PtpMessageType::Sync, || {
        make_subscription(&worker, PtpMessageType::Sync, 1, stats.clone())
    });
    let second = worker.find_or_register(client_port(1, 1), PtpMessageType::Sync, || {
        panic!("existing subscription must be reused")
    });
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_inventory_sweep() {
    let clipi1 = client_port(1234, 1);
    let clipi2 = client_port(5678, 1);
    let config = test_server_config(1);
    let stats = test_stats();
    let worker = SendWorker::new(0, config, stats.clone());
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let sync1 = make_subscription(&worker, PtpMessageType::Sync, 1234, stats.clone());
    worker.register_subscription(clipi1, PtpMessageType::Sync, Arc::clone(&sync1));
    tokio::spawn(Arc::clone(&sync1).run(cancel_rx.clone()));

    let ann1 = make_subscription(&worker, PtpMessageType::Announce, 1234, stats.clone());
    worker.register_subscription(clipi1, PtpMessageType::Announce, Arc::clone(&ann1));
    tokio::spawn(Arc::clone(&ann1).run(cancel_rx.clone()));

    let sync2 = make_subscription(&worker, PtpMessageType::Sync, 5678, stats.clone());
    worker.register_subscription(clipi2, PtpMessageType::Sync, Arc::clone(&sync2));
    tokio::spawn(Arc::clone(&sync2).run(cancel_rx.clone()));

    tokio::time::sleep(Duration::from_millis(20)).await;
    worker.inventory_clients();
    assert_eq!(worker.subscription_count(PtpMessageType::Sync), 2);
    assert_eq!(worker.subscription_count(PtpMessageType::Announce), 1);

    sync1.set_expire(SystemTime::now());
    tokio::time::sleep(Duration::from_millis(50)).await;
    worker.inventory_clients();
    assert_eq!(worker.subscription_count(PtpMessageType::Sync), 1);
    assert_eq!(worker.subscription_count(PtpMessageType::Announce), 1);

    ann1.set_expire(SystemTime::now());
    tokio::time::sleep(Duration::from_millis(50)).await;
    worker.inventory_clients();
    assert_eq!(worker.subscription_count(PtpMessageType::Sync), 1);
    assert_eq!(worker.subscription_count(PtpMessageType::Announce), 0);

    sync2.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    worker.inventory_clients();
    assert_eq!(worker.subscription_count(PtpMessageType::Sync), 0);
    assert_eq!(worker.subscription_count(PtpMessageType::Announce), 0);

    // Gauges reflect the final state.
    let snap = stats.snapshot();
    assert_eq!(snap.subscriptions_for(PtpMessageType::Sync), 0);
    assert_eq!(snap.subscriptions_for(PtpMessageType::Announce), 0);
}

// ===== Degraded sends =====

#[tokio::test(flavor = "multi_thread")]
async fn test_persistent_send_failure_marks_degraded() {
    let config = test_server_config(1);
    let stats = test_stats();
    let worker = Arc::new(SendWorker::new(0, config, stats.clone()));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&worker).run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Port 0 is not a sendable destination; every attempt fails.
    let bad_addr = "127.0.0.1:0".parse().unwrap();
    let sub = Arc::new(SubscriptionClient::new(
        worker.queue(),
        bad_addr,
        bad_addr,
        PtpMessageType::Announce,
        client_port(1234, 1),
        stats.clone(),
        Duration::from_millis(10),
        SystemTime::now() + Duration::from_secs(60),
    ));
    assert!(!sub.is_degraded());
    sub.enqueue_once();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sub.is_degraded());
    assert!(stats.snapshot().send_errors >= 1);
    assert_eq!(stats.snapshot().tx_for(PtpMessageType::Announce), 0);
}

// ===== Socket options =====

#[test]
fn test_enable_dscp_both_families() {
    let sock4 = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    enable_dscp(
        sock4.as_raw_fd(),
        IpAddr::from([127, 0, 0, 1]),
        42,
    )
    .unwrap();

    let sock6 = std::net::UdpSocket::bind("[::1]:0").unwrap();
    enable_dscp(
        sock6.as_raw_fd(),
        "::".parse().unwrap(),
        42,
    )
    .unwrap();
}
