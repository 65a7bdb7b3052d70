// Shared harness: a console model driving the adapter byte by byte, a clock the
// tests move by hand and an in-memory backend.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use mobile_adapter::adapter::{Adapter, AdapterConfig, AdapterError};
use mobile_adapter::board::{
    AddressFamily, Backend, BackendError, Board, ConfigStore, Network, SocketKind, Timer,
    CONFIG_SIZE,
};
use mobile_adapter::commands::MAX_CONNECTIONS;
use mobile_adapter::serial::packet::{checksum, encode_frame, padded_len};
use mobile_adapter::serial::{Command, Packet, IDLE_BYTE, PREAMBLE};

/// Byte a console clocks out while it waits for the adapter
pub const CONSOLE_IDLE: u8 = 0x4B;
pub const CONSOLE_DEVICE: u8 = 0x80;

/// Board whose time only moves when a test says so
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: u64,
    latches: [u64; Timer::COUNT],
}

impl ManualClock {
    pub fn advance(&mut self, ms: u64) {
        self.now_ms += ms;
    }
}

impl Board for ManualClock {
    fn time_latch(&mut self, timer: Timer) {
        self.latches[timer.index()] = self.now_ms;
    }

    fn time_check_ms(&self, timer: Timer, ms: u32) -> bool {
        self.now_ms - self.latches[timer.index()] > ms as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSocket {
    pub kind: SocketKind,
    pub bind_port: u16,
    pub peer: Option<SocketAddr>,
    pub listening: bool,
}

/// Configuration store and network held entirely in memory
#[derive(Debug)]
pub struct MockBackend {
    pub config: Vec<u8>,
    pub fail_config: bool,
    pub fail_open: bool,
    /// Addresses that accept connections
    pub reachable: HashSet<SocketAddr>,
    pub sockets: HashMap<usize, MockSocket>,
    /// Data waiting to be received, per slot
    pub inbound: HashMap<usize, VecDeque<Vec<u8>>>,
    pub sent: Vec<(usize, Vec<u8>)>,
    /// Slots whose remote end hung up
    pub hung_up: HashSet<usize>,
    pub closed: Vec<usize>,
    pub dns: HashMap<String, IpAddr>,
    pub lookups: Vec<(String, Ipv4Addr, Ipv4Addr)>,
    /// Callers that will connect on the next accept
    pub callers: usize,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            config: vec![0; CONFIG_SIZE],
            fail_config: false,
            fail_open: false,
            reachable: HashSet::new(),
            sockets: HashMap::new(),
            inbound: HashMap::new(),
            sent: Vec::new(),
            hung_up: HashSet::new(),
            closed: Vec::new(),
            dns: HashMap::new(),
            lookups: Vec::new(),
            callers: 0,
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_inbound(&mut self, conn: usize, data: &[u8]) {
        self.inbound.entry(conn).or_default().push_back(data.to_vec());
    }

    pub fn is_open(&self, conn: usize) -> bool {
        self.sockets.contains_key(&conn)
    }

    fn socket(&mut self, conn: usize) -> Result<&mut MockSocket, BackendError> {
        self.sockets.get_mut(&conn).ok_or(BackendError::NotOpen(conn))
    }
}

impl ConfigStore for MockBackend {
    fn config_read(&mut self, offset: usize, dest: &mut [u8]) -> Result<(), BackendError> {
        if self.fail_config {
            return Err(io::Error::new(io::ErrorKind::Other, "flash unavailable").into());
        }
        dest.copy_from_slice(&self.config[offset..offset + dest.len()]);
        Ok(())
    }

    fn config_write(&mut self, offset: usize, src: &[u8]) -> Result<(), BackendError> {
        if self.fail_config {
            return Err(io::Error::new(io::ErrorKind::Other, "flash unavailable").into());
        }
        self.config[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

impl Network for MockBackend {
    fn open(
        &mut self,
        conn: usize,
        kind: SocketKind,
        _family: AddressFamily,
        bind_port: u16,
    ) -> Result<(), BackendError> {
        if conn >= MAX_CONNECTIONS {
            return Err(BackendError::InvalidSlot(conn));
        }
        if self.fail_open {
            return Err(BackendError::Unsupported("no sockets left".into()));
        }
        self.hung_up.remove(&conn);
        self.sockets.insert(
            conn,
            MockSocket {
                kind,
                bind_port,
                peer: None,
                listening: false,
            },
        );
        Ok(())
    }

    fn close(&mut self, conn: usize) {
        if self.sockets.remove(&conn).is_some() {
            self.closed.push(conn);
        }
        self.inbound.remove(&conn);
    }

    fn connect(&mut self, conn: usize, addr: SocketAddr) -> Result<(), BackendError> {
        let reachable = self.reachable.contains(&addr);
        let socket = self.socket(conn)?;
        if !reachable {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }
        socket.peer = Some(addr);
        Ok(())
    }

    fn listen(&mut self, conn: usize) -> Result<(), BackendError> {
        self.socket(conn)?.listening = true;
        Ok(())
    }

    fn accept(&mut self, conn: usize) -> Result<bool, BackendError> {
        let callers = self.callers;
        let socket = self.socket(conn)?;
        if !socket.listening {
            return Err(BackendError::NotOpen(conn));
        }
        if callers == 0 {
            return Ok(false);
        }
        socket.listening = false;
        socket.peer = Some(SocketAddr::from(([10, 0, 0, 2], 40000)));
        self.callers -= 1;
        Ok(true)
    }

    fn send(
        &mut self,
        conn: usize,
        data: &[u8],
        _addr: Option<SocketAddr>,
    ) -> Result<usize, BackendError> {
        let hung_up = self.hung_up.contains(&conn);
        let socket = self.socket(conn)?;
        if socket.peer.is_none() && socket.kind == SocketKind::Tcp {
            return Err(BackendError::NotOpen(conn));
        }
        if hung_up {
            return Err(BackendError::Closed);
        }
        self.sent.push((conn, data.to_vec()));
        Ok(data.len())
    }

    fn receive(
        &mut self,
        conn: usize,
        buf: &mut [u8],
        _addr: Option<&mut SocketAddr>,
    ) -> Result<usize, BackendError> {
        self.socket(conn)?;
        if let Some(chunk) = self.inbound.get_mut(&conn).and_then(VecDeque::pop_front) {
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            return Ok(n);
        }
        if self.hung_up.contains(&conn) {
            return Err(BackendError::Closed);
        }
        Ok(0)
    }

    fn resolve(
        &mut self,
        host: &str,
        dns1: Ipv4Addr,
        dns2: Ipv4Addr,
    ) -> Result<IpAddr, BackendError> {
        self.lookups.push((host.to_string(), dns1, dns2));
        self.dns
            .get(host)
            .copied()
            .ok_or_else(|| BackendError::Resolve(format!("unknown host {}", host)))
    }
}

/// Plays the console's side of the link.
///
/// Models the serial shift register: the byte the adapter returns from one
/// exchange is what the console receives on the next.
pub struct Console<K = MockBackend> {
    pub adapter: Adapter<ManualClock>,
    pub backend: K,
    pub device_byte: u8,
    pub mode_32bit: bool,
    /// Run pending actions between exchanges
    pub run_actions: bool,
    pub action_errors: Vec<AdapterError>,
    shifted: u8,
}

impl Console<MockBackend> {
    pub fn new() -> Self {
        Self::with_config(AdapterConfig::default())
    }

    pub fn with_config(config: AdapterConfig) -> Self {
        Console::with_backend(config, MockBackend::new())
    }
}

impl<K: Backend> Console<K> {
    pub fn with_backend(config: AdapterConfig, backend: K) -> Self {
        Self {
            adapter: Adapter::new(ManualClock::default(), config),
            backend,
            device_byte: CONSOLE_DEVICE,
            mode_32bit: false,
            run_actions: true,
            action_errors: Vec::new(),
            shifted: IDLE_BYTE,
        }
    }

    pub fn exchange(&mut self, byte: u8) -> u8 {
        let received = self.shifted;
        self.shifted = self.adapter.transfer(byte);
        received
    }

    pub fn advance(&mut self, ms: u64) {
        self.adapter.board_mut().advance(ms);
    }

    /// Run whatever the adapter asks for until it is idle
    pub fn run_actions(&mut self) {
        for _ in 0..16 {
            let Some(kind) = self.adapter.pending_action() else {
                return;
            };
            if let Err(e) = self.adapter.process_action(kind, &mut self.backend) {
                self.action_errors.push(e);
            }
        }
    }

    /// Clock out a request frame and its trailer; returns the acknowledge byte
    pub fn send_raw(&mut self, command_byte: u8, data: &[u8]) -> u8 {
        let frame = encode_frame(command_byte, data, self.mode_32bit);
        self.send_frame(&frame)
    }

    /// Clock out pre-encoded frame bytes followed by the trailer
    pub fn send_frame(&mut self, frame: &[u8]) -> u8 {
        for &byte in frame {
            self.exchange(byte);
        }
        self.exchange(self.device_byte);
        let ack = self.exchange(0x00);
        if self.mode_32bit {
            self.exchange(0x00);
            self.exchange(0x00);
        }
        ack
    }

    pub fn send(&mut self, command: Command, data: &[u8]) -> u8 {
        self.send_raw(command.byte(), data)
    }

    /// Poll for a reply packet, acknowledging it with `ack` (the proper
    /// acknowledge byte when `None`). Gives up after `max_polls` idle bytes.
    pub fn receive_with_ack(&mut self, max_polls: usize, ack: Option<u8>) -> Option<Packet> {
        let mut previous = 0x00;
        let mut polls = 0;
        loop {
            if polls == max_polls {
                return None;
            }
            if self.run_actions {
                self.run_actions();
            }
            let byte = self.exchange(CONSOLE_IDLE);
            polls += 1;
            if previous == PREAMBLE[0] && byte == PREAMBLE[1] {
                break;
            }
            previous = byte;
        }

        let mut header = [0u8; 4];
        for byte in header.iter_mut() {
            *byte = self.exchange(CONSOLE_IDLE);
        }
        assert_ne!(header[0] & 0x80, 0, "reply without the reply flag");
        assert_eq!(header[2], 0x00);
        let len = header[3] as usize;

        let mut body = Vec::from(header);
        for _ in 0..padded_len(len, self.mode_32bit) {
            body.push(self.exchange(CONSOLE_IDLE));
        }
        let sum = u16::from_be_bytes([self.exchange(CONSOLE_IDLE), self.exchange(CONSOLE_IDLE)]);
        assert_eq!(sum, checksum(&body), "reply checksum");

        let adapter_device = self.exchange(self.device_byte);
        assert_eq!(adapter_device, self.adapter.config().device.id() | 0x80);
        self.exchange(ack.unwrap_or(header[0] ^ 0x80));
        if self.mode_32bit {
            self.exchange(0x00);
            self.exchange(0x00);
        }

        let command = Command::from_byte(header[0]).expect("known reply command");
        Some(Packet::new(command, &body[4..4 + len]))
    }

    pub fn receive(&mut self) -> Option<Packet> {
        self.receive_with_ack(64, None)
    }

    /// Full request/reply round. `Err` carries a link error acknowledge.
    pub fn request(&mut self, command: Command, data: &[u8]) -> Result<Packet, u8> {
        let ack = self.send(command, data);
        if ack != command.byte() ^ 0x80 {
            return Err(ack);
        }
        let reply = self.receive().expect("reply to an acknowledged request");
        match (command, reply.command, reply.data()) {
            (Command::Sio32Mode, Command::Sio32Mode, [mode]) => self.mode_32bit = *mode == 1,
            (Command::Reset, Command::Reset, _) => self.mode_32bit = false,
            _ => {}
        }
        Ok(reply)
    }

    pub fn begin_session(&mut self) {
        let reply = self.request(Command::BeginSession, b"NINTENDO").unwrap();
        assert_eq!(reply, Packet::new(Command::BeginSession, b"NINTENDO"));
    }

    /// Dial the provider and log in with the given DNS servers
    pub fn login(&mut self, dns1: [u8; 4], dns2: [u8; 4]) {
        self.begin_session();
        let mut dial = vec![0x00];
        dial.extend_from_slice(b"#9677");
        let reply = self.request(Command::DialTelephone, &dial).unwrap();
        assert_eq!(reply, Packet::empty(Command::DialTelephone));

        let mut login = vec![4];
        login.extend_from_slice(b"user");
        login.push(4);
        login.extend_from_slice(b"pass");
        login.extend_from_slice(&dns1);
        login.extend_from_slice(&dns2);
        let reply = self.request(Command::IspLogin, &login).unwrap();
        assert_eq!(reply.command, Command::IspLogin);
    }
}

/// Error reply the adapter sends for `command`
pub fn error_reply(command: Command, code: u8) -> Packet {
    Packet::error(command, code)
}
