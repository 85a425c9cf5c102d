use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use crate::connection::{StatusCause, StatusEvent, StatusKind};
use crate::message::Header;

/// One fragment awaiting its ack: the encoded datagram ready for
/// retransmission, the ack policy it was sent under, and the retry clock.
#[derive(Debug)]
struct PendingFragment {
    encoded: Arc<[u8]>,
    single_ack: bool,
    next_retry: Instant,
    retries: u32,
}

/// What one retry tick asks the engine to do: put these datagrams back on
/// the wire, and report these outcomes on the status queue.
#[derive(Debug, Default)]
pub (crate) struct RetryTick {
    pub (crate) resend: Vec<Arc<[u8]>>,
    pub (crate) events: Vec<StatusEvent>,
}

/// Tracks every transmitted fragment until its ack arrives or its retries
/// run out. Keyed by (message_id, fragment_number).
#[derive(Debug)]
pub (crate) struct TransmissionTable {
    pending: HashMap<(u16, u8), PendingFragment>,
    ack_delay: Duration,
    max_retries: u32,
}

impl TransmissionTable {
    pub (crate) fn new(ack_delay: Duration, max_retries: u32) -> TransmissionTable {
        TransmissionTable {
            pending: HashMap::default(),
            ack_delay,
            max_retries,
        }
    }

    /// Records a just-transmitted fragment. `no_ack` fragments are not
    /// recorded at all; their message is reported sent right away.
    pub (crate) fn register(&mut self, header: &Header, encoded: Arc<[u8]>, now: Instant) -> Option<StatusEvent> {
        if header.no_ack {
            return Some(StatusEvent {
                kind: StatusKind::Sent,
                cause: StatusCause::NoAck,
                message_id: header.message_id,
            });
        }
        log::debug!(
            "fragment awaiting ack registered (id: {}, fragment: {})",
            header.message_id,
            header.fragment_number
        );
        self.pending.insert(
            (header.message_id, header.fragment_number),
            PendingFragment {
                encoded,
                single_ack: header.single_ack,
                next_retry: now + self.ack_delay,
                retries: 0,
            },
        );
        None
    }

    /// Retransmits every overdue fragment; a fragment that already used up
    /// its retries is dropped and reported as failed.
    pub (crate) fn on_tick(&mut self, now: Instant) -> RetryTick {
        let mut tick = RetryTick::default();
        let mut exhausted: Vec<(u16, u8)> = Vec::new();
        for (&key, entry) in self.pending.iter_mut() {
            if entry.next_retry > now {
                continue;
            }
            if entry.retries < self.max_retries {
                entry.retries += 1;
                entry.next_retry = now + self.ack_delay;
                tick.resend.push(Arc::clone(&entry.encoded));
                continue;
            }
            exhausted.push(key);
        }
        for key in exhausted {
            self.pending.remove(&key);
            log::info!("message id:{} discarded, fragment {} exceeded {} retries", key.0, key.1, self.max_retries);
            tick.events.push(StatusEvent {
                kind: StatusKind::Failed,
                cause: StatusCause::Ack,
                message_id: key.0,
            });
        }
        tick
    }

    /// Applies a received ack. The *stored* entry's ack policy decides
    /// whether this ack covers the whole message or just one fragment; the
    /// "message sent" status fires once, when the last fragment is released.
    /// Acks for unknown fragments are stale or duplicated and are ignored.
    pub (crate) fn on_ack(&mut self, ack: &Header) -> Option<StatusEvent> {
        let key = (ack.message_id, ack.fragment_number);
        let single_ack = self.pending.get(&key)?.single_ack;
        if single_ack {
            for n in 0..ack.fragment_amount {
                self.pending.remove(&(ack.message_id, n));
            }
            log::debug!("message id:{} acked (single ack)", ack.message_id);
        } else {
            self.pending.remove(&key);
            if (0..ack.fragment_amount).any(|n| self.pending.contains_key(&(ack.message_id, n))) {
                return None;
            }
            log::debug!("message id:{} acked (per-fragment ack)", ack.message_id);
        }
        Some(StatusEvent {
            kind: StatusKind::Sent,
            cause: StatusCause::Ack,
            message_id: ack.message_id,
        })
    }

    #[inline]
    pub (crate) fn contains(&self, message_id: u16, fragment_number: u8) -> bool {
        self.pending.contains_key(&(message_id, fragment_number))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
fn pending_headers(message_id: u16, fragment_amount: u8, single_ack: bool) -> Vec<Header> {
    (0..fragment_amount)
        .map(|fragment_number| Header {
            message_id,
            fragment_amount,
            fragment_number,
            single_ack,
            ..Header::default()
        })
        .collect()
}

#[cfg(test)]
fn register_all(table: &mut TransmissionTable, headers: &[Header], now: Instant) {
    for header in headers {
        let registered = table.register(header, Arc::from(&b"frame"[..]), now);
        assert!(registered.is_none());
    }
}

#[test]
fn ack_releases_whole_message_in_single_ack_mode() {
    let now = Instant::now();
    let mut table = TransmissionTable::new(Duration::from_secs(2), 8);
    let headers = pending_headers(5, 3, true);
    register_all(&mut table, &headers, now);
    assert_eq!(table.len(), 3);

    // one ack, for any fragment, clears all three
    let event = table.on_ack(&headers[1].create_ack(false).header).unwrap();
    assert_eq!(event.kind, StatusKind::Sent);
    assert_eq!(event.cause, StatusCause::Ack);
    assert_eq!(event.message_id, 5);
    assert_eq!(table.len(), 0);
}

#[test]
fn acks_release_one_fragment_each_in_per_fragment_mode() {
    let now = Instant::now();
    let mut table = TransmissionTable::new(Duration::from_secs(2), 8);
    let headers = pending_headers(6, 3, false);
    register_all(&mut table, &headers, now);

    assert!(table.on_ack(&headers[0].create_ack(false).header).is_none());
    assert_eq!(table.len(), 2);
    assert!(table.on_ack(&headers[1].create_ack(false).header).is_none());
    assert_eq!(table.len(), 1);
    let event = table.on_ack(&headers[2].create_ack(false).header).unwrap();
    assert_eq!(event.kind, StatusKind::Sent);
    assert_eq!(table.len(), 0);
}

#[test]
fn ack_order_does_not_matter() {
    let now = Instant::now();
    let mut table = TransmissionTable::new(Duration::from_secs(2), 8);
    let headers = pending_headers(7, 2, false);
    register_all(&mut table, &headers, now);

    // acks arriving in reverse fragment order end in the same state
    assert!(table.on_ack(&headers[1].create_ack(false).header).is_none());
    assert!(table.on_ack(&headers[0].create_ack(false).header).is_some());
    assert_eq!(table.len(), 0);
}

#[test]
fn unknown_ack_is_ignored() {
    let mut table = TransmissionTable::new(Duration::from_secs(2), 8);
    let stale = pending_headers(9, 1, true);
    assert!(table.on_ack(&stale[0].create_ack(false).header).is_none());
}

#[test]
fn no_ack_fragment_is_not_recorded() {
    let mut table = TransmissionTable::new(Duration::from_secs(2), 8);
    let header = Header { message_id: 3, no_ack: true, ..Header::default() };
    let event = table.register(&header, Arc::from(&b"frame"[..]), Instant::now()).unwrap();
    assert_eq!(event.kind, StatusKind::Sent);
    assert_eq!(event.cause, StatusCause::NoAck);
    assert_eq!(event.message_id, 3);
    assert_eq!(table.len(), 0);
}

#[test]
fn overdue_fragment_is_retransmitted_then_dropped() {
    let now = Instant::now();
    let mut table = TransmissionTable::new(Duration::from_secs(0), 2);
    let headers = pending_headers(8, 1, true);
    register_all(&mut table, &headers, now);

    // zero ack delay makes the entry due on every tick
    let tick = table.on_tick(now);
    assert_eq!(tick.resend.len(), 1);
    assert_eq!(tick.resend[0].as_ref(), b"frame");
    assert!(tick.events.is_empty());

    let tick = table.on_tick(now);
    assert_eq!(tick.resend.len(), 1);

    // retries exhausted: dropped with a failure event
    let tick = table.on_tick(now);
    assert!(tick.resend.is_empty());
    assert_eq!(tick.events.len(), 1);
    assert_eq!(tick.events[0].kind, StatusKind::Failed);
    assert_eq!(tick.events[0].cause, StatusCause::Ack);
    assert_eq!(tick.events[0].message_id, 8);
    assert_eq!(table.len(), 0);
}

#[test]
fn fragment_is_not_retransmitted_before_its_deadline() {
    let now = Instant::now();
    let mut table = TransmissionTable::new(Duration::from_secs(3600), 8);
    let headers = pending_headers(10, 1, true);
    register_all(&mut table, &headers, now);

    let tick = table.on_tick(now);
    assert!(tick.resend.is_empty());
    assert!(tick.events.is_empty());
    assert_eq!(table.len(), 1);
}
