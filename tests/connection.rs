use std::net::SocketAddr;
use std::time::{Duration, Instant};

use udpcp::{
    build_payload_from_fragments, Connection, ConnectionError, ConnectionOptions, StatusCause,
    StatusEvent, StatusKind,
};

fn fast_opts() -> ConnectionOptions {
    ConnectionOptions {
        timeout: Duration::from_millis(5),
        ..Default::default()
    }
}

/// Two connections on loopback, pointed at each other. The listener is
/// created first against a placeholder peer, then redirected once the
/// sender's ephemeral port is known.
fn connected_pair(sender_opts: ConnectionOptions, listener_opts: ConnectionOptions) -> (Connection, Connection) {
    let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut listener = Connection::new("127.0.0.1:9", Some(local), listener_opts).unwrap();
    let sender = Connection::new(listener.local_addr(), Some(local), sender_opts).unwrap();
    listener.set_peer(sender.local_addr());
    (sender, listener)
}

fn sent_event(message_id: u16) -> StatusEvent {
    StatusEvent {
        kind: StatusKind::Sent,
        cause: StatusCause::Ack,
        message_id,
    }
}

#[test]
fn sync_handshake() {
    let (mut sender, mut listener) = connected_pair(fast_opts(), fast_opts());
    sender.synchronize();
    assert!(!sender.is_synced());

    listener.tick().unwrap();
    // the sync message is an ordinary empty DATA message: the listener
    // delivers it too
    let delivered = listener.poll().expect("sync message delivered");
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].payload.is_empty());
    assert_eq!(delivered[0].header.message_id, 0);

    sender.tick().unwrap();
    assert!(sender.is_synced());
    assert_eq!(sender.status(), Some(sent_event(0)));
    assert!(sender.status().is_none());
}

#[test]
fn single_fragment_round_trip() {
    let (mut sender, mut listener) = connected_pair(fast_opts(), fast_opts());
    sender.send(b"<xml></xml>").unwrap();

    sender.tick().unwrap(); // starts the handshake; the payload stays queued
    listener.tick().unwrap(); // delivers and acks the sync message
    sender.tick().unwrap(); // synced; transmits the payload
    listener.tick().unwrap(); // delivers and acks the payload
    sender.tick().unwrap(); // applies the ack

    let _sync = listener.poll().expect("sync message");
    let delivered = listener.poll().expect("payload delivered");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].header.message_id, 1);
    assert_eq!(
        build_payload_from_fragments(&delivered).unwrap().as_ref(),
        b"<xml></xml>"
    );

    assert_eq!(sender.status(), Some(sent_event(0)));
    assert_eq!(sender.status(), Some(sent_event(1)));
    assert!(sender.status().is_none());
}

#[test]
fn three_fragments_single_ack() {
    let opts = ConnectionOptions {
        max_payload_size: 4,
        ..fast_opts()
    };
    let (mut sender, mut listener) = connected_pair(opts, fast_opts());
    sender.send(b"111122223333").unwrap();

    sender.tick().unwrap();
    listener.tick().unwrap();
    sender.tick().unwrap();
    listener.tick().unwrap();
    sender.tick().unwrap();

    let _sync = listener.poll().expect("sync message");
    let delivered = listener.poll().expect("payload delivered");
    assert_eq!(delivered.len(), 3);
    assert!(delivered.iter().all(|m| m.header.message_id == 1));
    assert_eq!(
        build_payload_from_fragments(&delivered).unwrap().as_ref(),
        b"111122223333"
    );

    // one ack released all three fragments
    assert_eq!(sender.status(), Some(sent_event(0)));
    assert_eq!(sender.status(), Some(sent_event(1)));
    assert!(sender.status().is_none());
}

#[test]
fn three_fragments_acked_individually() {
    let opts = ConnectionOptions {
        max_payload_size: 4,
        single_ack: false,
        ..fast_opts()
    };
    let (mut sender, mut listener) = connected_pair(opts, fast_opts());
    sender.send(b"111122223333").unwrap();

    sender.tick().unwrap();
    listener.tick().unwrap();
    sender.tick().unwrap();
    listener.tick().unwrap();
    sender.tick().unwrap();

    let _sync = listener.poll().expect("sync message");
    let delivered = listener.poll().expect("payload delivered");
    assert_eq!(delivered.len(), 3);
    assert_eq!(
        build_payload_from_fragments(&delivered).unwrap().as_ref(),
        b"111122223333"
    );

    // three acks arrived, but the message is reported sent exactly once,
    // when the last fragment was released
    assert_eq!(sender.status(), Some(sent_event(0)));
    assert_eq!(sender.status(), Some(sent_event(1)));
    assert!(sender.status().is_none());
}

#[test]
fn single_fragment_per_fragment_mode_is_acked_on_delivery() {
    let opts = ConnectionOptions {
        no_sync: true,
        single_ack: false,
        ..fast_opts()
    };
    let (mut sender, mut listener) = connected_pair(opts, fast_opts());
    sender.send(b"lone fragment").unwrap();

    sender.tick().unwrap();
    listener.tick().unwrap();
    sender.tick().unwrap();

    let delivered = listener.poll().expect("payload delivered");
    assert_eq!(delivered.len(), 1);
    assert_eq!(
        build_payload_from_fragments(&delivered).unwrap().as_ref(),
        b"lone fragment"
    );
    // the delivering fragment was acked right away, well inside the ack delay
    assert_eq!(sender.status(), Some(sent_event(1)));
    assert!(sender.status().is_none());
}

#[test]
fn unacked_sync_is_retransmitted_and_deduplicated() {
    let opts = ConnectionOptions {
        ack_delay: Duration::from_millis(100),
        ..fast_opts()
    };
    let (mut sender, mut listener) = connected_pair(opts, fast_opts());
    sender.synchronize();

    // the listener stays silent past the ack delay, forcing a retransmit
    std::thread::sleep(Duration::from_millis(120));
    sender.tick().unwrap();

    // both copies arrive in one tick: one delivery, two acks
    listener.tick().unwrap();
    assert!(listener.poll().is_some());
    assert!(listener.poll().is_none());

    sender.tick().unwrap();
    assert!(sender.is_synced());
    assert_eq!(sender.status(), Some(sent_event(0)));
    assert!(sender.status().is_none());
}

#[test]
fn sync_retry_exhaustion_is_fatal() {
    let opts = ConnectionOptions {
        ack_delay: Duration::from_millis(10),
        max_retries: 4,
        ..fast_opts()
    };
    // the listener never ticks, so no ack ever comes back
    let (mut sender, _listener) = connected_pair(opts, fast_opts());
    sender.synchronize();

    let mut failure = None;
    for _ in 0..20 {
        std::thread::sleep(Duration::from_millis(15));
        if let Err(err) = sender.tick() {
            failure = Some(err);
            break;
        }
    }
    assert!(matches!(failure, Some(ConnectionError::SyncFailed)));
    assert_eq!(
        sender.status(),
        Some(StatusEvent {
            kind: StatusKind::Failed,
            cause: StatusCause::Ack,
            message_id: 0,
        })
    );
}

#[test]
fn data_retry_exhaustion_is_reported_but_not_fatal() {
    let opts = ConnectionOptions {
        no_sync: true,
        ack_delay: Duration::from_millis(10),
        max_retries: 2,
        ..fast_opts()
    };
    let (mut sender, _listener) = connected_pair(opts, fast_opts());
    sender.send(b"into the void").unwrap();
    sender.tick().unwrap();

    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(15));
        sender.tick().unwrap();
    }
    assert_eq!(
        sender.status(),
        Some(StatusEvent {
            kind: StatusKind::Failed,
            cause: StatusCause::Ack,
            message_id: 1,
        })
    );
}

#[test]
fn empty_payload_round_trip() {
    let opts = ConnectionOptions {
        no_sync: true,
        ..fast_opts()
    };
    let (mut sender, mut listener) = connected_pair(opts, fast_opts());
    sender.send(b"").unwrap();

    sender.tick().unwrap();
    listener.tick().unwrap();
    sender.tick().unwrap();

    let delivered = listener.poll().expect("empty message delivered");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].header.fragment_amount, 1);
    assert_eq!(delivered[0].header.data_length, 0);
    assert!(delivered[0].payload.is_empty());
    assert_eq!(build_payload_from_fragments(&delivered).unwrap().as_ref(), b"");

    assert_eq!(sender.status(), Some(sent_event(1)));
}

#[test]
fn no_ack_messages_are_reported_sent_immediately() {
    let opts = ConnectionOptions {
        no_sync: true,
        no_ack: true,
        ..fast_opts()
    };
    let (mut sender, mut listener) = connected_pair(opts, fast_opts());
    sender.send(b"fire and forget").unwrap();
    sender.tick().unwrap();

    assert_eq!(
        sender.status(),
        Some(StatusEvent {
            kind: StatusKind::Sent,
            cause: StatusCause::NoAck,
            message_id: 1,
        })
    );

    listener.tick().unwrap();
    let delivered = listener.poll().expect("payload delivered");
    assert_eq!(
        build_payload_from_fragments(&delivered).unwrap().as_ref(),
        b"fire and forget"
    );

    // nothing came back, and nothing else is owed
    sender.tick().unwrap();
    assert!(sender.status().is_none());
}

#[test]
fn threaded_driver_round_trip() {
    let (sender, mut listener) = connected_pair(fast_opts(), fast_opts());
    let handle = sender.start();
    handle.send(b"hello over threads").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut delivered = None;
    while Instant::now() < deadline && delivered.is_none() {
        listener.tick().unwrap();
        while let Some(fragments) = listener.poll() {
            // skip the handshake delivery, keep the payload
            if !fragments[0].payload.is_empty() {
                delivered = Some(fragments);
            }
        }
    }
    let fragments = delivered.expect("payload delivered within the deadline");
    assert_eq!(
        build_payload_from_fragments(&fragments).unwrap().as_ref(),
        b"hello over threads"
    );
    handle.stop().unwrap();
}
