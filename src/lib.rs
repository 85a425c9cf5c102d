//! UDPCP: a reliable, fragmented datagram protocol layered over UDP.
//!
//! A [`Connection`] exchanges application payloads with a single peer. Every
//! message gets a 16-bit id, payloads larger than the configured fragment
//! size are split and reassembled transparently, and each fragment is
//! retransmitted until the peer acknowledges it (or its retries run out,
//! which is reported on the status queue). An initial handshake on message
//! id 0 aligns both endpoints' sequence spaces.
//!
//! # Examples
//!
//! ## Sending endpoint, driven on its own thread
//!
//! ```rust,no_run
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conn = udpcp::Connection::new("127.0.0.1:13001", None, Default::default())?;
//!     let handle = conn.start();
//!
//!     handle.send(b"<SOAP-ENV:Envelope />")?;
//!     loop {
//!         if let Some(status) = handle.status() {
//!             println!("outcome: {:?}", status);
//!             break;
//!         }
//!         std::thread::sleep(std::time::Duration::from_millis(5));
//!     }
//!     handle.stop()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Receiving endpoint, driven cooperatively
//!
//! ```rust,no_run
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let local = "127.0.0.1:13002".parse()?;
//!     let mut conn = udpcp::Connection::new("127.0.0.1:13001", Some(local), Default::default())?;
//!     loop {
//!         conn.tick()?;
//!         while let Some(fragments) = conn.poll() {
//!             let payload = udpcp::build_payload_from_fragments(&fragments)?;
//!             println!("received {} bytes", payload.len());
//!         }
//!     }
//! }
//! ```

mod consts;
mod message;
mod fragment;
mod transmission;
mod reassembly;
mod connection;

pub use connection::*;
pub use fragment::{build_payload_from_fragments, FragmentError, ReassembleError};
pub use message::{DecodeError, Header, Message, MessageKind};
