use std::time::Duration;

// Adler-32 checksum = u32 = 4 bytes
pub (crate) const CHECKSUM_SIZE: usize = 4;

// checksum, type/version/flag bits, duplicate/reserved bits, fragment_amount,
// fragment_number, message_id (u16), data_length (u16)
pub (crate) const HEADER_SIZE: usize = CHECKSUM_SIZE + 1 + 1 + 1 + 1 + 2 + 2;

pub (crate) const FLAGS_OFFSET: usize = 4;
pub (crate) const DUPLICATE_OFFSET: usize = 5;
pub (crate) const FRAGMENT_AMOUNT_OFFSET: usize = 6;
pub (crate) const FRAGMENT_NUMBER_OFFSET: usize = 7;
pub (crate) const MESSAGE_ID_OFFSET: usize = 8;
pub (crate) const DATA_LENGTH_OFFSET: usize = 10;

// the 3-bit version field is fixed for this revision of the protocol
pub (crate) const PROTOCOL_VERSION: u8 = 0b010;

// message id 0 is reserved for the synchronization handshake;
// regular ids wrap inside [1, 0xFFFE]
pub (crate) const SYNC_MESSAGE_ID: u16 = 0;
pub (crate) const MESSAGE_ID_MODULUS: u16 = 0xFFFF;

// a one-byte fragment_amount caps a message at 255 fragments
pub (crate) const MAX_FRAGMENTS_IN_MESSAGE: usize = 255;

// receive buffer; covers the default fragment size of 2048 plus the header
// with plenty of slack
pub (crate) const RECV_BUFFER_SIZE: usize = 4096;

pub (crate) const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_millis(50);
pub (crate) const DEFAULT_ACK_DELAY: Duration = Duration::from_secs(2);
pub (crate) const DEFAULT_MAX_RETRIES: u32 = 8;
pub (crate) const DEFAULT_MAX_PAYLOAD_SIZE: usize = 2048;
