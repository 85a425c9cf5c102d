use itertools::Itertools;

use crate::consts::*;
use crate::message::{Header, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    /// The payload needs more than 255 fragments at this fragment size.
    #[error("payload of {0} bytes does not fit in 255 fragments")]
    TooManyFragments(usize),
    /// data_length is a 16-bit field.
    #[error("payload of {0} bytes does not fit the 16-bit data_length field")]
    PayloadTooLong(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReassembleError {
    #[error("no fragments to reassemble")]
    Empty,
    /// All fragments of one message must agree on the total payload length.
    #[error("fragments disagree on data_length")]
    DataLengthMismatch,
}

/// Splits a payload into the DATA messages that will carry it, at most
/// `max_payload_size` octets each. Every message reports the *whole* payload
/// length as data_length; the message id and the per-connection header flags
/// are stamped by the engine at transmit time.
///
/// An empty payload still produces one message, with an empty slice.
///
/// Panics if `max_payload_size` is 0.
pub (crate) fn build_messages_from_payload(
    payload: &[u8],
    max_payload_size: usize,
) -> Result<Vec<Message>, FragmentError> {
    assert!(max_payload_size > 0, "cannot fragment a payload into empty slices");
    if payload.len() > usize::from(u16::max_value()) {
        return Err(FragmentError::PayloadTooLong(payload.len()));
    }
    let mut count = payload.len() / max_payload_size;
    if payload.len() % max_payload_size != 0 || payload.is_empty() {
        count += 1;
    }
    if count > MAX_FRAGMENTS_IN_MESSAGE {
        return Err(FragmentError::TooManyFragments(payload.len()));
    }
    let data_length = payload.len() as u16;
    let header = |number: u8| Header {
        fragment_amount: count as u8,
        fragment_number: number,
        data_length,
        ..Header::default()
    };
    if payload.is_empty() {
        return Ok(vec![Message { header: header(0), payload: Box::default() }]);
    }
    Ok(payload
        .chunks(max_payload_size)
        .enumerate()
        .map(|(number, slice)| Message {
            header: header(number as u8),
            payload: Box::from(slice),
        })
        .collect())
}

/// Restores the payload from a delivered fragment list by concatenating the
/// slices in fragment order.
///
/// Fails if the list is empty, if the fragments disagree on data_length, or
/// if the slices do not add up to the advertised length.
pub fn build_payload_from_fragments(fragments: &[Message]) -> Result<Box<[u8]>, ReassembleError> {
    if fragments.is_empty() {
        return Err(ReassembleError::Empty);
    }
    if !fragments.iter().map(|m| m.header.data_length).all_equal() {
        return Err(ReassembleError::DataLengthMismatch);
    }
    let data_length = usize::from(fragments[0].header.data_length);
    let mut payload: Vec<u8> = Vec::with_capacity(data_length);
    for fragment in fragments {
        payload.extend_from_slice(&fragment.payload);
    }
    if payload.len() != data_length {
        return Err(ReassembleError::DataLengthMismatch);
    }
    Ok(payload.into_boxed_slice())
}

#[test]
fn build_empty_payload() {
    let msgs = build_messages_from_payload(b"", 2048).unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].header.fragment_amount, 1);
    assert_eq!(msgs[0].header.fragment_number, 0);
    assert_eq!(msgs[0].header.data_length, 0);
    assert!(msgs[0].payload.is_empty());
}

#[test]
fn build_one_fragment_exact_fit() {
    let payload = vec![7u8; 16];
    let msgs = build_messages_from_payload(&payload, 16).unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].header.fragment_amount, 1);
    assert_eq!(msgs[0].payload.len(), 16);
}

#[test]
fn build_two_fragments_one_byte_over() {
    let payload = vec![7u8; 17];
    let msgs = build_messages_from_payload(&payload, 16).unwrap();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].payload.len(), 16);
    assert_eq!(msgs[1].payload.len(), 1);
    assert_eq!(msgs[0].header.fragment_number, 0);
    assert_eq!(msgs[1].header.fragment_number, 1);
    // data_length reports the whole payload on both fragments
    assert_eq!(msgs[0].header.data_length, 17);
    assert_eq!(msgs[1].header.data_length, 17);
}

#[test]
fn build_three_fragments() {
    let msgs = build_messages_from_payload(b"111122223333", 4).unwrap();
    assert_eq!(msgs.len(), 3);
    assert!(msgs.iter().all(|m| m.header.fragment_amount == 3));
    assert_eq!(msgs[1].payload.as_ref(), b"2222");
}

#[test]
fn build_fail_too_many_fragments() {
    let payload = vec![0u8; 2 * MAX_FRAGMENTS_IN_MESSAGE + 1];
    assert_eq!(
        build_messages_from_payload(&payload, 2).unwrap_err(),
        FragmentError::TooManyFragments(payload.len())
    );
}

#[test]
fn build_fail_payload_too_long() {
    let payload = vec![0u8; 0x1_0000];
    assert_eq!(
        build_messages_from_payload(&payload, 2048).unwrap_err(),
        FragmentError::PayloadTooLong(0x1_0000)
    );
}

#[test]
fn fragment_then_reassemble() {
    let payload = b"111122223333";
    let msgs = build_messages_from_payload(payload, 4).unwrap();
    let restored = build_payload_from_fragments(&msgs).unwrap();
    assert_eq!(restored.as_ref(), payload);
}

#[test]
fn reassemble_fail_empty() {
    assert_eq!(build_payload_from_fragments(&[]).unwrap_err(), ReassembleError::Empty);
}

#[test]
fn reassemble_fail_length_disagreement() {
    let mut msgs = build_messages_from_payload(b"111122223333", 4).unwrap();
    msgs[2].header.data_length = 8;
    assert_eq!(
        build_payload_from_fragments(&msgs).unwrap_err(),
        ReassembleError::DataLengthMismatch
    );
}
