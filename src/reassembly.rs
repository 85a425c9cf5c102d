use hashbrown::{HashMap, HashSet};

use crate::message::{Header, Message};

/// What the engine must do with the DATA fragment it just fed in.
#[derive(Debug)]
pub (crate) enum FragmentOutcome {
    /// Already delivered, or its slot was already filled: ack it again,
    /// flagged as a duplicate, and drop it.
    Duplicate,
    /// The fragment does not fit the entry its message id opened (a peer
    /// changed fragment_amount mid-message): drop it.
    Inconsistent,
    /// Stored. `ack_now` is set when the fragment asked for per-fragment
    /// acks.
    Stored { ack_now: bool },
    /// Last missing fragment arrived: deliver the ordered list. In
    /// single-ack mode one ack for fragment 0 stands in for the whole
    /// message; in per-fragment mode the completing fragment is owed its
    /// individual ack like every other stored fragment. `completing` is
    /// that fragment's header.
    Complete {
        fragments: Vec<Message>,
        completing: Header,
        single_ack: bool,
    },
}

/// Accumulates the fragments of incoming messages, keyed by message id, and
/// remembers the ids already delivered so duplicates are suppressed.
#[derive(Debug, Default)]
pub (crate) struct ReassemblyTable {
    pending: HashMap<u16, Vec<Option<Message>>>,
    history: HashSet<u16>,
}

impl ReassemblyTable {
    pub (crate) fn new() -> ReassemblyTable {
        ReassemblyTable::default()
    }

    pub (crate) fn on_fragment(&mut self, msg: Message) -> FragmentOutcome {
        let id = msg.header.message_id;
        if self.history.contains(&id) {
            log::info!("duplicate fragment for already delivered message id:{}", id);
            return FragmentOutcome::Duplicate;
        }
        let header = msg.header;
        let amount = usize::from(header.fragment_amount);
        let number = usize::from(header.fragment_number);
        let single_ack = header.single_ack;
        let slots = self.pending.entry(id).or_insert_with(|| {
            log::info!("new {}-fragment message id:{}", amount, id);
            (0..amount).map(|_| None).collect()
        });
        if number >= slots.len() {
            log::warn!(
                "fragment {}/{} does not fit the {}-slot entry for message id:{}",
                number,
                amount,
                slots.len(),
                id
            );
            return FragmentOutcome::Inconsistent;
        }
        if slots[number].is_some() {
            log::info!("duplicate fragment {} for message id:{}", number, id);
            return FragmentOutcome::Duplicate;
        }
        log::info!("fragment {}/{} of message id:{} received", number + 1, slots.len(), id);
        slots[number] = Some(msg);
        if slots.iter().any(Option::is_none) {
            return FragmentOutcome::Stored { ack_now: !single_ack };
        }
        let fragments: Vec<Message> = match self.pending.remove(&id) {
            Some(slots) => slots.into_iter().flatten().collect(),
            None => unreachable!("entry for message id:{} vanished mid-reassembly", id),
        };
        self.history.insert(id);
        log::info!("message id:{} complete ({} fragments)", id, fragments.len());
        FragmentOutcome::Complete { fragments, completing: header, single_ack }
    }

    /// Forgets every delivered id. Called when the peer's sequence space
    /// restarts: on sync completion and on message-id rollover.
    pub (crate) fn clear_history(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
fn data_fragment(message_id: u16, fragment_number: u8, fragment_amount: u8, single_ack: bool, payload: &[u8]) -> Message {
    Message {
        header: Header {
            message_id,
            fragment_number,
            fragment_amount,
            single_ack,
            ..Header::default()
        },
        payload: Box::from(payload),
    }
}

#[test]
fn single_fragment_completes_immediately() {
    let mut table = ReassemblyTable::new();
    match table.on_fragment(data_fragment(1, 0, 1, true, b"<xml></xml>")) {
        FragmentOutcome::Complete { fragments, completing, single_ack } => {
            assert_eq!(fragments.len(), 1);
            assert_eq!(fragments[0].payload.as_ref(), b"<xml></xml>");
            assert_eq!(completing.fragment_number, 0);
            assert!(single_ack);
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[test]
fn fragments_reassemble_out_of_order() {
    let mut table = ReassemblyTable::new();
    assert!(matches!(
        table.on_fragment(data_fragment(2, 2, 3, true, b"3333")),
        FragmentOutcome::Stored { ack_now: false }
    ));
    assert!(matches!(
        table.on_fragment(data_fragment(2, 0, 3, true, b"1111")),
        FragmentOutcome::Stored { ack_now: false }
    ));
    match table.on_fragment(data_fragment(2, 1, 3, true, b"2222")) {
        FragmentOutcome::Complete { fragments, .. } => {
            // delivery preserves fragment order, not arrival order
            let slices: Vec<&[u8]> = fragments.iter().map(|m| m.payload.as_ref()).collect();
            assert_eq!(slices, vec![&b"1111"[..], b"2222", b"3333"]);
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[test]
fn per_fragment_ack_mode_acks_every_stored_fragment() {
    let mut table = ReassemblyTable::new();
    assert!(matches!(
        table.on_fragment(data_fragment(3, 0, 2, false, b"aa")),
        FragmentOutcome::Stored { ack_now: true }
    ));
    // the completing fragment is owed its own ack too
    match table.on_fragment(data_fragment(3, 1, 2, false, b"bb")) {
        FragmentOutcome::Complete { completing, single_ack, .. } => {
            assert!(!single_ack);
            assert_eq!(completing.message_id, 3);
            assert_eq!(completing.fragment_number, 1);
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[test]
fn completing_fragment_is_reported_even_out_of_order() {
    let mut table = ReassemblyTable::new();
    table.on_fragment(data_fragment(8, 2, 3, false, b"33"));
    table.on_fragment(data_fragment(8, 1, 3, false, b"22"));
    // fragment 0 arrives last and is the one completing the message
    match table.on_fragment(data_fragment(8, 0, 3, false, b"11")) {
        FragmentOutcome::Complete { completing, .. } => {
            assert_eq!(completing.fragment_number, 0);
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[test]
fn refilled_slot_is_a_duplicate() {
    let mut table = ReassemblyTable::new();
    table.on_fragment(data_fragment(4, 0, 2, true, b"aa"));
    assert!(matches!(
        table.on_fragment(data_fragment(4, 0, 2, true, b"aa")),
        FragmentOutcome::Duplicate
    ));
    // the entry is still only half full
    assert!(matches!(
        table.on_fragment(data_fragment(4, 1, 2, true, b"bb")),
        FragmentOutcome::Complete { .. }
    ));
}

#[test]
fn replay_after_delivery_is_a_duplicate() {
    let mut table = ReassemblyTable::new();
    assert!(matches!(
        table.on_fragment(data_fragment(5, 0, 1, true, b"x")),
        FragmentOutcome::Complete { .. }
    ));
    assert!(matches!(
        table.on_fragment(data_fragment(5, 0, 1, true, b"x")),
        FragmentOutcome::Duplicate
    ));
}

#[test]
fn clearing_history_allows_redelivery() {
    let mut table = ReassemblyTable::new();
    table.on_fragment(data_fragment(6, 0, 1, true, b"x"));
    table.clear_history();
    assert!(matches!(
        table.on_fragment(data_fragment(6, 0, 1, true, b"x")),
        FragmentOutcome::Complete { .. }
    ));
}

#[test]
fn mismatched_fragment_amount_is_dropped() {
    let mut table = ReassemblyTable::new();
    table.on_fragment(data_fragment(7, 0, 2, true, b"aa"));
    // same id, but the peer now claims 4 fragments
    assert!(matches!(
        table.on_fragment(data_fragment(7, 3, 4, true, b"dd")),
        FragmentOutcome::Inconsistent
    ));
}
