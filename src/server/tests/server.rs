use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::{DynamicConfig, StaticConfig};
use crate::protocol::{
    ClockIdentity, PtpMessageType, SignalingMessage, SignalingTlv,
};
use crate::server::{negotiate_grant, worker_index, Server, ServerConfig};

use super::{client_port, test_server_config, test_stats};

fn test_server(send_workers: usize) -> Server {
    let config = test_server_config(send_workers);
    Server::new(
        ServerConfig::new(config.static_config.clone(), config.clock_identity),
        test_stats(),
    )
}

// ===== Worker routing =====

#[test]
fn test_find_worker_is_deterministic() {
    let server = test_server(10);

    let clipi1 = client_port(1234, 1);
    let clipi2 = client_port(1234, 2);
    let clipi3 = client_port(5678, 1);

    // Consistent across multiple calls.
    assert_eq!(server.find_worker(&clipi1).id(), 0);
    assert_eq!(server.find_worker(&clipi1).id(), 0);
    assert_eq!(server.find_worker(&clipi1).id(), 0);

    assert_eq!(server.find_worker(&clipi2).id(), 3);
    assert_eq!(server.find_worker(&clipi3).id(), 6);
}

#[test]
fn test_worker_index_stability() {
    for clock in [1u64, 0xFFFF, 0xDEAD_BEEF, u64::MAX] {
        for port in [1u16, 2, 1000] {
            let identity = client_port(clock, port);
            let first = worker_index(&identity, 10);
            assert!(first < 10);
            for _ in 0..100 {
                assert_eq!(worker_index(&identity, 10), first);
            }
        }
    }
}

#[test]
fn test_worker_index_single_worker() {
    assert_eq!(worker_index(&client_port(1234, 1), 1), 0);
}

// ===== Negotiation clamping =====

#[test]
fn test_negotiation_clamps_to_bounds() {
    let dynamic = DynamicConfig {
        min_sub_interval: Duration::from_secs(5),
        max_sub_duration: Duration::from_secs(3 * 3600),
        ..Default::default()
    };

    // Too fast: raised to the floor.
    let fast = negotiate_grant(-7, 60, &dynamic);
    assert_eq!(fast.interval, Duration::from_secs(5));
    assert_eq!(fast.duration_secs, 60);

    // Too long: capped.
    let long = negotiate_grant(0, u32::MAX, &dynamic);
    assert_eq!(long.duration, Duration::from_secs(3 * 3600));
    assert_eq!(long.duration_secs, 3 * 3600);

    // In bounds: granted verbatim.
    let ok = negotiate_grant(3, 600, &dynamic);
    assert_eq!(ok.interval, Duration::from_secs(8));
    assert_eq!(ok.granted_log, 3);
    assert_eq!(ok.duration_secs, 600);
}

proptest::proptest! {
    // For every conceivable request the grant stays inside the
    // configured bounds and never panics.
    #[test]
    fn prop_grants_respect_bounds(
        log in proptest::num::i8::ANY,
        duration in proptest::num::u32::ANY,
    ) {
        let dynamic = DynamicConfig::default();
        let grant = negotiate_grant(log, duration, &dynamic);
        proptest::prop_assert!(grant.interval >= dynamic.min_sub_interval);
        proptest::prop_assert!(grant.duration <= dynamic.max_sub_duration);
        proptest::prop_assert!(
            u64::from(grant.duration_secs) <= dynamic.max_sub_duration.as_secs()
        );
    }
}

// ===== Drain / Undrain =====

#[test]
fn test_drain_undrain() {
    let server = test_server(2);

    assert!(!server.is_drained());
    server.drain();
    assert!(server.is_drained());
    // Idempotent.
    server.drain();
    assert!(server.is_drained());

    server.undrain();
    assert!(!server.is_drained());
}

#[test]
fn test_drain_cancels_current_context_only() {
    let server = test_server(2);

    let old_context = server.drain_receiver();
    server.drain();
    assert!(*old_context.borrow());

    server.undrain();
    let fresh_context = server.drain_receiver();
    assert!(!*fresh_context.borrow());
    // The old context stays cancelled.
    assert!(*old_context.borrow());
}

// ===== Grants ride the worker queue =====

#[tokio::test(flavor = "multi_thread")]
async fn test_send_grant_reaches_client() {
    let server = Arc::new(test_server(1));

    let client_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_socket.local_addr().unwrap();
    let client = client_port(1234, 1);

    // Run the owning worker so the queue is consumed.
    let worker = Arc::clone(server.find_worker(&client));
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(Arc::clone(&worker).run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.send_signaling_reply(
        &worker,
        client,
        client_addr,
        42,
        SignalingTlv::Grant(crate::protocol::GrantUnicastTransmission {
            msg_nibble: PtpMessageType::Announce as u8,
            log_inter_message_period: 0,
            duration_field: 300,
            renewal_invited: true,
        }),
    );

    let mut buf = [0u8; 256];
    let (len, _) = tokio::time::timeout(
        Duration::from_secs(2),
        client_socket.recv_from(&mut buf),
    )
    .await
    .expect("grant within deadline")
    .unwrap();

    let message = SignalingMessage::decode(&buf[..len]).unwrap();
    assert_eq!(message.header.sequence_id, 42);
    assert_eq!(message.target_port_identity, client);
    match &message.tlvs[0] {
        SignalingTlv::Grant(grant) => {
            assert_eq!(grant.msg_nibble, PtpMessageType::Announce as u8);
            assert_eq!(grant.duration_field, 300);
            assert!(grant.renewal_invited);
        }
        other => panic!("expected Grant, got {other:?}"),
    }
}

// ===== SIGHUP reload =====

#[tokio::test]
async fn test_handle_sighup_reloads_dynamic_config() {
    let expected = DynamicConfig {
        clock_accuracy: 0,
        clock_class: 1,
        drain_interval: Duration::from_secs(2),
        max_sub_duration: Duration::from_secs(3 * 3600),
        metric_interval: Duration::from_secs(4 * 60),
        min_sub_interval: Duration::from_secs(5),
        utc_offset: Duration::from_secs(37),
    };

    let mut config_file = tempfile::NamedTempFile::new().unwrap();
    write!(
        config_file,
        "clockaccuracy: 0\nclockclass: 1\ndraininterval: \"2s\"\n\
         maxsubduration: \"3h\"\nmetricinterval: \"4m\"\n\
         minsubinterval: \"5s\"\nutcoffset: \"37s\"\n"
    )
    .unwrap();

    let static_config = StaticConfig {
        config_file: config_file.path().to_path_buf(),
        ..test_server_config(1).static_config.clone()
    };
    let server = Arc::new(Server::new(
        ServerConfig::new(static_config, ClockIdentity(1234)),
        test_stats(),
    ));

    let handler = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = handler.handle_sighup().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    kill(Pid::this(), Signal::SIGHUP).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.config().dynamic(), expected);
}

#[tokio::test]
async fn test_sighup_with_bad_config_keeps_previous() {
    let mut config_file = tempfile::NamedTempFile::new().unwrap();
    write!(config_file, "clockaccuracy: [oops\n").unwrap();

    let static_config = StaticConfig {
        config_file: config_file.path().to_path_buf(),
        ..test_server_config(1).static_config.clone()
    };
    let server = Arc::new(Server::new(
        ServerConfig::new(static_config, ClockIdentity(1234)),
        test_stats(),
    ));
    let before = server.config().dynamic();

    let handler = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = handler.handle_sighup().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    kill(Pid::this(), Signal::SIGHUP).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.config().dynamic(), before);
}

// ===== SIGTERM cleanup =====

#[tokio::test]
async fn test_handle_sigterm_removes_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("ptpserve.pid");

    let static_config = StaticConfig {
        pid_file: pid_file.clone(),
        ..test_server_config(1).static_config.clone()
    };
    let server = Server::new(
        ServerConfig::new(static_config, ClockIdentity(1234)),
        test_stats(),
    );

    server.config().static_config.create_pid_file().unwrap();
    assert!(pid_file.exists());

    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        kill(Pid::this(), Signal::SIGTERM).unwrap();
    });

    // Must return once the signal is delivered.
    tokio::time::timeout(Duration::from_secs(2), server.handle_sigterm())
        .await
        .expect("sigterm handled within deadline")
        .unwrap();
    assert!(!pid_file.exists());
}

// ===== Listener smoke =====

#[tokio::test(flavor = "multi_thread")]
async fn test_run_binds_listeners_on_ephemeral_ports() {
    let dir = tempfile::tempdir().unwrap();
    let static_config = StaticConfig {
        pid_file: dir.path().join("pid"),
        send_workers: 2,
        ..test_server_config(2).static_config.clone()
    };
    let server = Arc::new(Server::new(
        ServerConfig::new(static_config, ClockIdentity(1234)),
        test_stats(),
    ));

    tokio::spawn(Arc::clone(&server).run());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let event = server.bound_event_addr().expect("event listener bound");
    let general = server.bound_general_addr().expect("general listener bound");
    assert_ne!(event.port(), 0);
    assert_ne!(general.port(), 0);
}
