use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::consts::*;
use crate::fragment::{build_messages_from_payload, FragmentError};
use crate::message::{Header, Message, MessageKind};
use crate::reassembly::{FragmentOutcome, ReassemblyTable};
use crate::transmission::TransmissionTable;

/// Everything that can be tuned on a connection. The defaults are the
/// protocol's canonical values.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Socket read timeout; bounds how long one drive iteration blocks on
    /// empty input.
    pub timeout: Duration,
    /// How long to wait for an ack before retransmitting a fragment.
    pub ack_delay: Duration,
    /// How many retransmissions a fragment gets before it is given up on.
    pub max_retries: u32,
    /// Largest payload slice carried by a single fragment.
    pub max_payload_size: usize,
    /// Skip the synchronization handshake and start the sequence space at 0.
    pub no_sync: bool,
    /// Ask the peer not to acknowledge our messages.
    pub no_ack: bool,
    /// One ack for the last fragment acknowledges the whole message; when
    /// off, the peer acks every fragment individually.
    pub single_ack: bool,
}

impl Default for ConnectionOptions {
    fn default() -> ConnectionOptions {
        ConnectionOptions {
            timeout: DEFAULT_SOCKET_TIMEOUT,
            ack_delay: DEFAULT_ACK_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            no_sync: false,
            no_ack: false,
            single_ack: true,
        }
    }
}

/// Per-message delivery outcome, as reported on the status queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvent {
    pub kind: StatusKind,
    pub cause: StatusCause,
    pub message_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCause {
    /// The peer acknowledged (or failed to acknowledge) the message.
    Ack,
    /// The message was sent without requesting an acknowledgement.
    NoAck,
}

/// Fatal conditions. Everything else the engine recovers from locally and
/// reports, if at all, through the status queue.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The synchronization handshake exhausted its retries.
    #[error("synchronization with the peer failed")]
    SyncFailed,
    #[error("socket error: {0}")]
    Io(#[from] IoError),
}

/// The engine's UDP socket together with the peer it talks to.
///
/// Send errors and transient receive errors are logged and survived; only
/// the read timeout is treated as "no input".
#[derive(Debug)]
struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpTransport {
    fn send_datagram(&self, bytes: &[u8]) {
        match self.socket.send_to(bytes, self.peer) {
            Ok(sent) => debug_assert_eq!(sent, bytes.len(), "datagram truncated on send"),
            Err(err) => log::warn!("error on send to {}: {}", self.peer, err),
        }
    }

    /// One datagram, or `None` when the socket has nothing for us within
    /// its read timeout.
    fn recv_datagram(&self, buf: &mut [u8]) -> Option<usize> {
        match self.socket.recv(buf) {
            Ok(received) => Some(received),
            Err(ref err) if err.kind() == IoErrorKind::WouldBlock || err.kind() == IoErrorKind::TimedOut => {
                log::trace!("no data");
                None
            }
            Err(err) => {
                log::warn!("error on receive: {}", err);
                None
            }
        }
    }
}

/// A UDPCP connection to a single peer.
///
/// The engine owns the socket, the transmission and reassembly tables and
/// the sequence counter; applications talk to it through the outbound,
/// delivered and status queues. Drive it either by spawning the built-in
/// driver thread with [`Connection::start`], or cooperatively by calling
/// [`Connection::tick`] yourself.
#[derive(Debug)]
pub struct Connection {
    transport: UdpTransport,
    local_addr: SocketAddr,
    opts: ConnectionOptions,

    transmission: TransmissionTable,
    reassembly: ReassemblyTable,

    /// Last message id this endpoint assigned; `None` until the
    /// synchronization handshake completes.
    last_id: Option<u16>,

    outbound_tx: Sender<Vec<Message>>,
    outbound_rx: Receiver<Vec<Message>>,
    delivered_tx: Sender<Vec<Message>>,
    delivered_rx: Receiver<Vec<Message>>,
    status_tx: Sender<StatusEvent>,
    status_rx: Receiver<StatusEvent>,

    alive: Arc<AtomicBool>,
}

impl Connection {
    /// Creates a connection talking to `target`, bound to `local` (an
    /// ephemeral port when `None`). No traffic is exchanged yet; the
    /// handshake runs once the connection is driven.
    pub fn new<A: ToSocketAddrs>(
        target: A,
        local: Option<SocketAddr>,
        opts: ConnectionOptions,
    ) -> Result<Connection, ConnectionError> {
        let peer = target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| IoError::new(IoErrorKind::InvalidInput, "target resolved to no address"))?;
        let socket = match local {
            Some(addr) => UdpSocket::bind(addr)?,
            None => UdpSocket::bind("0.0.0.0:0")?,
        };
        socket.set_read_timeout(Some(opts.timeout))?;
        let local_addr = socket.local_addr()?;
        log::info!("udpcp connection {} -> {}", local_addr, peer);

        let (outbound_tx, outbound_rx) = unbounded();
        let (delivered_tx, delivered_rx) = unbounded();
        let (status_tx, status_rx) = unbounded();
        Ok(Connection {
            transport: UdpTransport { socket, peer },
            local_addr,
            transmission: TransmissionTable::new(opts.ack_delay, opts.max_retries),
            reassembly: ReassemblyTable::new(),
            last_id: None,
            opts,
            outbound_tx,
            outbound_rx,
            delivered_tx,
            delivered_rx,
            status_tx,
            status_rx,
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.transport.peer
    }

    /// Redirects the connection to another peer. Messages already in flight
    /// are retransmitted to the new address.
    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.transport.peer = peer;
    }

    /// Whether the sequence spaces of both endpoints are aligned.
    #[inline]
    pub fn is_synced(&self) -> bool {
        self.last_id.is_some()
    }

    /// Fragments `payload` and enqueues the fragment list atomically. The
    /// message id and the connection's header flags are assigned when the
    /// driver pops the list for transmission.
    pub fn send(&self, payload: &[u8]) -> Result<(), FragmentError> {
        let messages = build_messages_from_payload(payload, self.opts.max_payload_size)?;
        let _r = self.outbound_tx.send(messages);
        Ok(())
    }

    /// A cloneable handle other threads can enqueue payloads with.
    pub fn sender(&self) -> OutboundSender {
        OutboundSender {
            tx: self.outbound_tx.clone(),
            max_payload_size: self.opts.max_payload_size,
        }
    }

    /// Non-blocking pop of the next delivered message: the ordered fragment
    /// list, ready for [`build_payload_from_fragments`].
    ///
    /// [`build_payload_from_fragments`]: crate::build_payload_from_fragments
    pub fn poll(&self) -> Option<Vec<Message>> {
        self.delivered_rx.try_recv().ok()
    }

    /// Non-blocking pop of the next status event.
    pub fn status(&self) -> Option<StatusEvent> {
        self.status_rx.try_recv().ok()
    }

    /// Asks a running driver to exit after its current iteration.
    pub fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Transmits the synchronization message if the sequence space is not
    /// aligned yet and no sync is already in flight. The driver does this
    /// on its own; it is only needed when driving the engine by hand.
    pub fn synchronize(&mut self) {
        self.ensure_sync_started(Instant::now());
    }

    /// One drive iteration: drain inbound datagrams, drain the outbound
    /// queue (completing synchronization first), then run the retry tick.
    ///
    /// The only fatal outcome is a failed synchronization handshake.
    pub fn tick(&mut self) -> Result<(), ConnectionError> {
        while self.receive_one() {}
        self.flush_outbound();
        self.check_retries(Instant::now())
    }

    /// Runs the engine until [`Connection::stop`] is observed. Each
    /// iteration is one [`Connection::tick`]; the socket read timeout
    /// bounds how long an idle iteration blocks.
    pub fn drive(&mut self) -> Result<(), ConnectionError> {
        log::info!("listening on {}", self.local_addr);
        self.ensure_sync_started(Instant::now());
        while self.alive.load(Ordering::SeqCst) {
            self.tick()?;
        }
        log::info!("listening on {} stopped", self.local_addr);
        Ok(())
    }

    /// Spawns a thread running [`Connection::drive`] and hands back the
    /// application's side of the queues.
    pub fn start(self) -> ConnectionHandle {
        let outbound = self.sender();
        let delivered_rx = self.delivered_rx.clone();
        let status_rx = self.status_rx.clone();
        let alive = Arc::clone(&self.alive);
        let mut engine = self;
        let driver = ::std::thread::spawn(move || engine.drive());
        ConnectionHandle {
            outbound,
            delivered_rx,
            status_rx,
            alive,
            driver,
        }
    }

    /// Receives and dispatches one datagram. Returns false once the socket
    /// reports empty input, handing control to the next drive step.
    fn receive_one(&mut self) -> bool {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let received = match self.transport.recv_datagram(&mut buf) {
            Some(received) => received,
            None => return false,
        };
        let msg = match Message::decode(&buf[..received]) {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!("corrupted datagram discarded: {}", err);
                return true;
            }
        };
        log::trace!("received {:?}", msg);
        match msg.header.kind {
            MessageKind::Data => self.handle_data(msg),
            MessageKind::Ack => self.handle_ack(&msg.header),
        }
        true
    }

    fn handle_data(&mut self, msg: Message) {
        let header = msg.header;
        match self.reassembly.on_fragment(msg) {
            FragmentOutcome::Duplicate => self.send_ack(&header, true),
            FragmentOutcome::Inconsistent => {}
            FragmentOutcome::Stored { ack_now } => {
                if ack_now {
                    self.send_ack(&header, false);
                }
            }
            FragmentOutcome::Complete { fragments, completing, single_ack } => {
                if single_ack {
                    // fragment 0 stands in for the whole message
                    let first = fragments[0].header;
                    self.send_ack(&first, false);
                } else {
                    // the completing fragment gets its individual ack,
                    // like every fragment stored before it
                    self.send_ack(&completing, false);
                }
                let _r = self.delivered_tx.send(fragments);
            }
        }
    }

    fn handle_ack(&mut self, ack: &Header) {
        if ack.message_id == SYNC_MESSAGE_ID && self.last_id.is_none() {
            log::info!("ack on sync request received, synchronization finished");
            self.last_id = Some(0);
            self.reassembly.clear_history();
        }
        if let Some(event) = self.transmission.on_ack(ack) {
            let _r = self.status_tx.send(event);
        }
    }

    /// Answers a DATA message, unless the sender asked for no acks.
    fn send_ack(&self, data_header: &Header, duplicate: bool) {
        if data_header.no_ack {
            return;
        }
        log::debug!(
            "ack for message id:{} fragment:{} created",
            data_header.message_id,
            data_header.fragment_number
        );
        self.transport.send_datagram(&data_header.create_ack(duplicate).encode());
    }

    fn ensure_sync_started(&mut self, now: Instant) {
        if self.last_id.is_some() {
            return;
        }
        if self.opts.no_sync {
            log::info!("synchronization skipped by configuration");
            self.last_id = Some(0);
            return;
        }
        if self.transmission.contains(SYNC_MESSAGE_ID, 0) {
            // handshake already in flight
            return;
        }
        log::info!("synchronization started");
        let sync = Message::sync();
        let encoded: Arc<[u8]> = Arc::from(sync.encode());
        self.transport.send_datagram(&encoded);
        if let Some(event) = self.transmission.register(&sync.header, encoded, now) {
            let _r = self.status_tx.send(event);
        }
    }

    /// Drains the outbound queue, transmitting and registering each
    /// fragment list. Nothing is popped until synchronization completes.
    fn flush_outbound(&mut self) {
        if self.outbound_rx.is_empty() {
            return;
        }
        let now = Instant::now();
        self.ensure_sync_started(now);
        if self.last_id.is_none() {
            return;
        }
        while let Ok(fragments) = self.outbound_rx.try_recv() {
            self.transmit_message(fragments, now);
        }
    }

    fn transmit_message(&mut self, mut fragments: Vec<Message>, now: Instant) {
        let id = self.next_message_id();
        for msg in &mut fragments {
            msg.header.message_id = id;
            msg.header.no_ack = self.opts.no_ack;
            msg.header.single_ack = self.opts.single_ack;
            log::debug!(
                "message {} fragment {}/{} ready for sending",
                id,
                msg.header.fragment_number + 1,
                msg.header.fragment_amount
            );
        }
        for msg in fragments {
            let encoded: Arc<[u8]> = Arc::from(msg.encode());
            self.transport.send_datagram(&encoded);
            if let Some(event) = self.transmission.register(&msg.header, encoded, now) {
                let _r = self.status_tx.send(event);
            }
        }
    }

    /// Advances the sequence counter. Id 0 stays reserved for the sync
    /// handshake: the id after 0xFFFE is 1, and the rollover forgets the
    /// delivered-message history.
    fn next_message_id(&mut self) -> u16 {
        let mut id = (self.last_id.unwrap_or(0) + 1) % MESSAGE_ID_MODULUS;
        if id == 0 {
            log::debug!("roll-over of message id");
            id = 1;
            self.reassembly.clear_history();
        }
        self.last_id = Some(id);
        id
    }

    fn check_retries(&mut self, now: Instant) -> Result<(), ConnectionError> {
        let tick = self.transmission.on_tick(now);
        for datagram in tick.resend {
            self.transport.send_datagram(&datagram);
        }
        for event in tick.events {
            let sync_failed = self.last_id.is_none()
                && event.message_id == SYNC_MESSAGE_ID
                && event.kind == StatusKind::Failed;
            let _r = self.status_tx.send(event);
            if sync_failed {
                log::error!("synchronization failed");
                return Err(ConnectionError::SyncFailed);
            }
        }
        Ok(())
    }
}

/// A cloneable handle for enqueueing payloads from any thread.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: Sender<Vec<Message>>,
    max_payload_size: usize,
}

impl OutboundSender {
    pub fn send(&self, payload: &[u8]) -> Result<(), FragmentError> {
        let messages = build_messages_from_payload(payload, self.max_payload_size)?;
        let _r = self.tx.send(messages);
        Ok(())
    }
}

/// The application's side of a connection whose engine runs on its own
/// driver thread (see [`Connection::start`]).
#[derive(Debug)]
pub struct ConnectionHandle {
    outbound: OutboundSender,
    delivered_rx: Receiver<Vec<Message>>,
    status_rx: Receiver<StatusEvent>,
    alive: Arc<AtomicBool>,
    driver: JoinHandle<Result<(), ConnectionError>>,
}

impl ConnectionHandle {
    /// See [`Connection::send`].
    pub fn send(&self, payload: &[u8]) -> Result<(), FragmentError> {
        self.outbound.send(payload)
    }

    /// See [`Connection::sender`].
    pub fn sender(&self) -> OutboundSender {
        self.outbound.clone()
    }

    /// See [`Connection::poll`].
    pub fn poll(&self) -> Option<Vec<Message>> {
        self.delivered_rx.try_recv().ok()
    }

    /// See [`Connection::status`].
    pub fn status(&self) -> Option<StatusEvent> {
        self.status_rx.try_recv().ok()
    }

    /// Stops the driver and waits for it to exit; surfaces the engine's
    /// fatal error if the handshake had failed.
    pub fn stop(self) -> Result<(), ConnectionError> {
        self.alive.store(false, Ordering::SeqCst);
        match self.driver.join() {
            Ok(result) => result,
            Err(panic) => ::std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
fn loopback_connection(opts: ConnectionOptions) -> Connection {
    // the discard port; replaced with set_peer before any traffic
    Connection::new("127.0.0.1:9", Some("127.0.0.1:0".parse().unwrap()), opts).unwrap()
}

#[test]
fn id_rollover_skips_zero_and_clears_history() {
    let mut conn = loopback_connection(ConnectionOptions::default());
    let inbound = Message {
        header: Header { message_id: 9, ..Header::default() },
        payload: Box::default(),
    };
    assert!(matches!(
        conn.reassembly.on_fragment(inbound.clone()),
        FragmentOutcome::Complete { .. }
    ));

    conn.last_id = Some(0xFFFE);
    assert_eq!(conn.next_message_id(), 1);
    assert_eq!(conn.last_id, Some(1));

    // the rollover forgot the delivered ids: a replay is a fresh delivery
    assert!(matches!(
        conn.reassembly.on_fragment(inbound),
        FragmentOutcome::Complete { .. }
    ));
}

#[test]
fn ids_are_sequential_after_sync() {
    let mut conn = loopback_connection(ConnectionOptions::default());
    conn.last_id = Some(0);
    assert_eq!(conn.next_message_id(), 1);
    assert_eq!(conn.next_message_id(), 2);
}

#[test]
fn no_sync_aligns_the_sequence_space_immediately() {
    let mut conn = loopback_connection(ConnectionOptions { no_sync: true, ..Default::default() });
    assert!(!conn.is_synced());
    conn.synchronize();
    assert!(conn.is_synced());
    assert_eq!(conn.last_id, Some(0));
}

#[test]
fn sync_is_registered_only_once() {
    let opts = ConnectionOptions { timeout: Duration::from_millis(5), ..Default::default() };
    let mut conn = loopback_connection(opts);
    conn.synchronize();
    conn.synchronize();
    assert!(!conn.is_synced());
    assert!(conn.transmission.contains(SYNC_MESSAGE_ID, 0));
}
