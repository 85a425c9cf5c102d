use adler32::RollingAdler32;
use byteorder::{BigEndian, ByteOrder};

use crate::consts::*;

/// The 2-bit message type field.
///
/// The protocol only knows two kinds of datagrams: DATA carries (a fragment
/// of) an application payload, ACK acknowledges one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Data,
    Ack,
}

impl MessageKind {
    #[inline]
    fn bits(self) -> u8 {
        match self {
            MessageKind::Data => 0b01,
            MessageKind::Ack => 0b10,
        }
    }
}

/// A UDPCP datagram starts with a fixed header of exactly 12 octets,
/// big-endian. The layout is:
///
/// ```text
/// [0-3]: Adler-32 over the whole datagram, with this field read as zero.
///        0 when use_checksum is off.
/// [4]:   type (2b) | version (3b, fixed 010) | no_ack | use_checksum | single_ack
/// [5]:   duplicate (1b) | reserved (7b, zero)
/// [6]:   fragment_amount (1 for unfragmented messages)
/// [7]:   fragment_number (0-based)
/// [8-9]: message_id (0 is reserved for the sync handshake)
/// [10-11]: data_length, the length of the *whole* logical payload --
///          every fragment of one message carries the same value
/// ```
///
/// The rest of the datagram is the fragment's payload slice, which may be
/// empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub checksum: u32,
    pub kind: MessageKind,
    /// Sender requests no acknowledgement for this message.
    pub no_ack: bool,
    /// When off, the checksum field must be zero and is not verified.
    pub use_checksum: bool,
    /// One ack for the last fragment acknowledges the whole message.
    pub single_ack: bool,
    /// Set by a receiver when acking a fragment it had already seen.
    pub duplicate: bool,
    pub fragment_amount: u8,
    pub fragment_number: u8,
    pub message_id: u16,
    pub data_length: u16,
}

impl Default for Header {
    fn default() -> Header {
        Header {
            checksum: 0,
            kind: MessageKind::Data,
            no_ack: false,
            use_checksum: true,
            single_ack: true,
            duplicate: false,
            fragment_amount: 1,
            fragment_number: 0,
            message_id: SYNC_MESSAGE_ID,
            data_length: 0,
        }
    }
}

impl Header {
    /// Builds the ack answering a received DATA message: same message id and
    /// fragment coordinates, empty payload, `no_ack` so the ack itself is
    /// never acked back.
    pub (crate) fn create_ack(&self, duplicate: bool) -> Message {
        Message {
            header: Header {
                kind: MessageKind::Ack,
                no_ack: true,
                duplicate,
                fragment_amount: self.fragment_amount,
                fragment_number: self.fragment_number,
                message_id: self.message_id,
                ..Header::default()
            },
            payload: Box::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Received data was too short to hold the 12-octet header.
    #[error("datagram shorter than the 12-octet header")]
    TooShort,
    /// The checksum field disagrees with the datagram contents.
    #[error("checksum mismatch: field says {found:#010x}, computed {computed:#010x}")]
    InvalidChecksum { found: u32, computed: u32 },
    /// The 3-bit version field is not 2.
    #[error("unsupported protocol version {0}")]
    InvalidVersion(u8),
    /// The 2-bit type field holds neither DATA nor ACK.
    #[error("invalid message type bits {0:#04b}")]
    InvalidType(u8),
    /// (fragment_number, fragment_amount) is impossible.
    #[error("invalid fragment layout: number {0} of {1}")]
    InvalidFragmentLayout(u8, u8),
}

/// Adler-32 of a datagram whose checksum field is already zero, normalized
/// so the wire value is never 0: an encoded 0 means `use_checksum` was off.
pub (crate) fn datagram_checksum(data: &[u8]) -> u32 {
    let cs = RollingAdler32::from_buffer(data).hash();
    if cs % 0xFFFF_FFFF != cs {
        (cs % 0xFFFF_FFFF) + 1
    } else {
        cs
    }
}

/// Same as `datagram_checksum`, but reads the checksum field as zero
/// without touching the buffer.
fn received_checksum(buffer: &[u8]) -> u32 {
    let mut adler = RollingAdler32::new();
    adler.update_buffer(&[0u8; CHECKSUM_SIZE]);
    adler.update_buffer(&buffer[CHECKSUM_SIZE..]);
    let cs = adler.hash();
    if cs % 0xFFFF_FFFF != cs {
        (cs % 0xFFFF_FFFF) + 1
    } else {
        cs
    }
}

/// One UDPCP datagram: a header plus this fragment's slice of the payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Box<[u8]>,
}

impl ::std::fmt::Debug for Message {
    #[cfg(feature = "extended_debug")]
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "Message {{ header: {:?}, payload: [hex 0x{}] }}", self.header, hex::encode(&self.payload))
    }

    #[cfg(not(feature = "extended_debug"))]
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "Message {{ header: {:?}, payload: {} bytes }}", self.header, self.payload.len())
    }
}

impl Message {
    /// The synchronization handshake message: default header, message id 0,
    /// no payload.
    pub (crate) fn sync() -> Message {
        Message {
            header: Header::default(),
            payload: Box::default(),
        }
    }

    /// Serializes the message, computing the checksum last.
    pub fn encode(&self) -> Box<[u8]> {
        let h = &self.header;
        let mut bytes = vec![0u8; HEADER_SIZE + self.payload.len()];
        bytes[FLAGS_OFFSET] = (h.kind.bits() << 6)
            | (PROTOCOL_VERSION << 3)
            | ((h.no_ack as u8) << 2)
            | ((h.use_checksum as u8) << 1)
            | h.single_ack as u8;
        bytes[DUPLICATE_OFFSET] = (h.duplicate as u8) << 7;
        bytes[FRAGMENT_AMOUNT_OFFSET] = h.fragment_amount;
        bytes[FRAGMENT_NUMBER_OFFSET] = h.fragment_number;
        BigEndian::write_u16(&mut bytes[MESSAGE_ID_OFFSET..MESSAGE_ID_OFFSET + 2], h.message_id);
        BigEndian::write_u16(&mut bytes[DATA_LENGTH_OFFSET..DATA_LENGTH_OFFSET + 2], h.data_length);
        bytes[HEADER_SIZE..].copy_from_slice(&self.payload);
        if h.use_checksum {
            let cs = datagram_checksum(&bytes);
            BigEndian::write_u32(&mut bytes[0..CHECKSUM_SIZE], cs);
        }
        bytes.into_boxed_slice()
    }

    /// Parses one datagram. The checksum comparison tolerates a difference
    /// of 1, because the never-zero normalization can shift the sum by one.
    pub fn decode(buffer: &[u8]) -> Result<Message, DecodeError> {
        if buffer.len() < HEADER_SIZE {
            return Err(DecodeError::TooShort);
        }
        let flags = buffer[FLAGS_OFFSET];
        let version = (flags >> 3) & 0b111;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::InvalidVersion(version));
        }
        let kind = match flags >> 6 {
            0b01 => MessageKind::Data,
            0b10 => MessageKind::Ack,
            bits => return Err(DecodeError::InvalidType(bits)),
        };
        let fragment_amount = buffer[FRAGMENT_AMOUNT_OFFSET];
        let fragment_number = buffer[FRAGMENT_NUMBER_OFFSET];
        if fragment_amount == 0 || fragment_number >= fragment_amount {
            return Err(DecodeError::InvalidFragmentLayout(fragment_number, fragment_amount));
        }
        let checksum = BigEndian::read_u32(&buffer[0..CHECKSUM_SIZE]);
        let use_checksum = (flags >> 1) & 1 == 1;
        if use_checksum {
            let computed = received_checksum(buffer);
            let diff = if checksum > computed { checksum - computed } else { computed - checksum };
            if diff > 1 {
                return Err(DecodeError::InvalidChecksum { found: checksum, computed });
            }
        }
        Ok(Message {
            header: Header {
                checksum,
                kind,
                no_ack: (flags >> 2) & 1 == 1,
                use_checksum,
                single_ack: flags & 1 == 1,
                duplicate: buffer[DUPLICATE_OFFSET] >> 7 == 1,
                fragment_amount,
                fragment_number,
                message_id: BigEndian::read_u16(&buffer[MESSAGE_ID_OFFSET..MESSAGE_ID_OFFSET + 2]),
                data_length: BigEndian::read_u16(&buffer[DATA_LENGTH_OFFSET..DATA_LENGTH_OFFSET + 2]),
            },
            payload: Box::from(&buffer[HEADER_SIZE..]),
        })
    }
}

#[test]
fn sync_message_bytes_exact() {
    // the canonical sync datagram; 0x02AA0055 is the Adler-32 of the other
    // 8 header bytes with the checksum field zeroed
    let expected: &'static [u8] = &[0x02, 0xAA, 0x00, 0x55, 0x53, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
    assert_eq!(Message::sync().encode().as_ref(), expected);
}

#[test]
fn decode_sync_message() {
    let raw: &'static [u8] = &[0x02, 0xAA, 0x00, 0x55, 0x53, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
    let m = Message::decode(raw).unwrap();
    assert_eq!(m.header.kind, MessageKind::Data);
    assert!(!m.header.no_ack);
    assert!(m.header.use_checksum);
    assert!(m.header.single_ack);
    assert!(!m.header.duplicate);
    assert_eq!(m.header.fragment_amount, 1);
    assert_eq!(m.header.fragment_number, 0);
    assert_eq!(m.header.message_id, 0);
    assert_eq!(m.header.data_length, 0);
    assert!(m.payload.is_empty());
}

#[test]
fn encode_decode_roundtrip_with_payload() {
    let sent = Message {
        header: Header {
            message_id: 0x1234,
            fragment_amount: 3,
            fragment_number: 2,
            data_length: 11,
            single_ack: false,
            ..Header::default()
        },
        payload: Box::from(&b"<xml></xml>"[..]),
    };
    let received = Message::decode(&sent.encode()).unwrap();
    assert_eq!(received.header.kind, MessageKind::Data);
    assert_eq!(received.header.message_id, 0x1234);
    assert_eq!(received.header.fragment_amount, 3);
    assert_eq!(received.header.fragment_number, 2);
    assert_eq!(received.header.data_length, 11);
    assert!(!received.header.single_ack);
    assert_eq!(received.payload, sent.payload);
}

#[test]
fn decode_fail_too_short() {
    let raw: &'static [u8] = &[0u8, 0, 0, 0, 0x53, 0, 1];
    assert_eq!(Message::decode(raw).unwrap_err(), DecodeError::TooShort);
}

#[test]
fn decode_fail_corrupted_payload() {
    let mut raw = Message {
        header: Header::default(),
        payload: Box::from(&b"1234"[..]),
    }
    .encode()
    .into_vec();
    raw[HEADER_SIZE] ^= 0xFF;
    match Message::decode(&raw) {
        Err(DecodeError::InvalidChecksum { .. }) => {}
        other => panic!("corrupted datagram decoded as {:?}", other),
    }
}

#[test]
fn decode_tolerates_off_by_one_checksum() {
    // a peer normalizing an unlucky sum lands one above the raw Adler-32
    let mut raw = Message::sync().encode().into_vec();
    raw[3] += 1;
    assert!(Message::decode(&raw).is_ok());
}

#[test]
fn decode_skips_checksum_when_disabled() {
    let mut m = Message::sync();
    m.header.use_checksum = false;
    let raw = m.encode();
    assert_eq!(&raw[0..4], &[0, 0, 0, 0]);
    let received = Message::decode(&raw).unwrap();
    assert!(!received.header.use_checksum);
    assert_eq!(received.header.checksum, 0);
}

#[test]
fn decode_fail_bad_version() {
    let mut raw = Message::sync().encode().into_vec();
    raw[FLAGS_OFFSET] = (raw[FLAGS_OFFSET] & !0b0011_1000) | (0b011 << 3);
    // keep the checksum honest so the version check is what trips
    let cs = {
        let mut scratch = raw.clone();
        scratch[0..CHECKSUM_SIZE].iter_mut().for_each(|b| *b = 0);
        datagram_checksum(&scratch)
    };
    BigEndian::write_u32(&mut raw[0..CHECKSUM_SIZE], cs);
    assert_eq!(Message::decode(&raw).unwrap_err(), DecodeError::InvalidVersion(0b011));
}

#[test]
fn decode_fail_bad_type() {
    let mut m = Message::sync();
    m.header.use_checksum = false;
    let mut raw = m.encode().into_vec();
    raw[FLAGS_OFFSET] |= 0b11 << 6;
    assert_eq!(Message::decode(&raw).unwrap_err(), DecodeError::InvalidType(0b11));
}

#[test]
fn decode_fail_bad_fragment_layout() {
    let mut m = Message::sync();
    m.header.use_checksum = false;
    m.header.fragment_amount = 2;
    m.header.fragment_number = 2;
    let raw = m.encode();
    assert_eq!(
        Message::decode(&raw).unwrap_err(),
        DecodeError::InvalidFragmentLayout(2, 2)
    );
}

#[test]
fn ack_construction() {
    let data = Message {
        header: Header {
            message_id: 77,
            fragment_amount: 3,
            fragment_number: 1,
            data_length: 12,
            ..Header::default()
        },
        payload: Box::from(&b"2222"[..]),
    };
    let ack = data.header.create_ack(false);
    assert_eq!(ack.header.kind, MessageKind::Ack);
    assert!(ack.header.no_ack);
    assert!(ack.header.single_ack);
    assert!(!ack.header.duplicate);
    assert_eq!(ack.header.message_id, 77);
    assert_eq!(ack.header.fragment_number, 1);
    assert_eq!(ack.header.fragment_amount, 3);
    assert_eq!(ack.header.data_length, 0);
    assert!(ack.payload.is_empty());

    // acks survive the wire
    let received = Message::decode(&ack.encode()).unwrap();
    assert_eq!(received.header.kind, MessageKind::Ack);
    assert_eq!(received.header.message_id, 77);

    let dup_ack = data.header.create_ack(true);
    assert!(Message::decode(&dup_ack.encode()).unwrap().header.duplicate);
}
