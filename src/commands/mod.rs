//! Session and connection state, and the handlers for every protocol command.

mod processor;

use std::net::Ipv4Addr;

use crate::action::{ActionKind, Operation};
use crate::board::SocketKind;
use crate::serial::Command;

/// Number of simultaneous connections the adapter offers
pub const MAX_CONNECTIONS: usize = 2;

/// Slot used for telephone calls between consoles
pub const PEER_SLOT: usize = 0;

/// Connection id reported for data on a telephone call
pub const CALL_CONNECTION_ID: u8 = 0xFF;

/// Transfers at the start of a call that only send, while the line settles
pub const CALL_HANDSHAKE_PACKETS: u32 = 2;

/// Numbers that reach the provider's access point instead of another console
pub const ISP_NUMBERS: [&str; 3] = ["#9677", "0077487751", "0755311973"];

/// Contents a console may send with BEGIN_SESSION
pub const SESSION_MAGIC: &[u8] = b"NINTENDO";

/// Address handed to the console at ISP login
pub const ISP_LOCAL_ADDRESS: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Largest configuration chunk moved by one command
pub const CONFIG_TRANSFER_MAX: usize = 0x80;

/// Second byte of the TELEPHONE_STATUS reply
pub const STATUS_SERVICE: u8 = 0x4D;
pub const STATUS_UNMETERED: u8 = 0xF0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Telephone line up, either to the provider or to another console
    Call,
    /// At least one TCP/UDP connection open
    Internet,
}

impl ConnectionState {
    /// Value reported by TELEPHONE_STATUS
    pub fn status_byte(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0x00,
            ConnectionState::Call => 0x04,
            ConnectionState::Internet => 0x05,
        }
    }
}

/// What is on the other end of the telephone line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Idle,
    Isp,
    IspLoggedIn,
    Peer,
}

/// Logical state of one connection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Free,
    /// Reserved while a deferred open or dial runs
    Opening,
    /// Waiting for a console to call in
    Listening,
    Open(SocketKind),
}

/// Error codes carried by the ERROR reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(u8)]
pub enum CommandError {
    #[error("No call received")]
    NoCall = 0,

    #[error("Invalid in the current state")]
    InvalidState = 1,

    #[error("Invalid request contents")]
    InvalidContents = 2,

    #[error("Operation failed")]
    Unavailable = 3,

    #[error("Internal failure")]
    Internal = 4,
}

impl CommandError {
    pub fn code(self) -> u8 {
        self as u8
    }
}

pub type Result<T> = std::result::Result<T, CommandError>;

#[derive(Debug, Clone, Copy)]
struct Queued {
    command: Command,
    op: Operation,
}

/// Everything the command layer remembers between packets
#[derive(Debug, Clone)]
pub struct CommandState {
    session_begun: bool,
    state: ConnectionState,
    line: Line,
    internet_from: ConnectionState,
    slots: [Slot; MAX_CONNECTIONS],
    call_packets_sent: u32,
    dns1: Ipv4Addr,
    dns2: Ipv4Addr,
    queued: Option<Queued>,
    generation: u64,
}

impl CommandState {
    pub fn new() -> Self {
        Self {
            session_begun: false,
            state: ConnectionState::Disconnected,
            line: Line::Idle,
            internet_from: ConnectionState::Disconnected,
            slots: [Slot::Free; MAX_CONNECTIONS],
            call_packets_sent: 0,
            dns1: Ipv4Addr::UNSPECIFIED,
            dns2: Ipv4Addr::UNSPECIFIED,
            queued: None,
            generation: 0,
        }
    }

    pub fn session_begun(&self) -> bool {
        self.session_begun
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn line(&self) -> Line {
        self.line
    }

    pub fn slot(&self, conn: usize) -> Option<Slot> {
        self.slots.get(conn).copied()
    }

    pub fn dns_servers(&self) -> (Ipv4Addr, Ipv4Addr) {
        (self.dns1, self.dns2)
    }

    pub fn call_packets_sent(&self) -> u32 {
        self.call_packets_sent
    }

    /// Bumped whenever outstanding work must be forgotten
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn queued_kind(&self) -> Option<ActionKind> {
        self.queued.map(|q| q.op.kind())
    }

    pub(crate) fn take_queued(&mut self) -> Option<(Command, Operation)> {
        self.queued.take().map(|q| (q.command, q.op))
    }

    /// The console stopped waiting for the reply to the queued command
    pub(crate) fn abandon(&mut self) {
        if let Some(queued) = self.queued.take() {
            log::debug!("Abandoning queued {}", queued.command);
        }
        for slot in self.slots.iter_mut() {
            if *slot == Slot::Opening {
                *slot = Slot::Free;
            }
        }
        self.generation += 1;
    }

    /// Forget the session and every connection
    pub(crate) fn end_session(&mut self) {
        self.clear();
        self.session_begun = false;
    }

    fn clear(&mut self) {
        self.close_all();
        self.state = ConnectionState::Disconnected;
        self.line = Line::Idle;
        self.internet_from = ConnectionState::Disconnected;
        self.dns1 = Ipv4Addr::UNSPECIFIED;
        self.dns2 = Ipv4Addr::UNSPECIFIED;
        self.queued = None;
        self.generation += 1;
    }

    fn close_all(&mut self) {
        self.slots = [Slot::Free; MAX_CONNECTIONS];
        self.call_packets_sent = 0;
    }

    /// Release one internet connection, leaving internet mode with the last one
    fn close_slot(&mut self, conn: usize) {
        self.slots[conn] = Slot::Free;
        let any_open = self.slots.iter().any(|s| matches!(s, Slot::Open(_)));
        if self.state == ConnectionState::Internet && !any_open {
            self.state = self.internet_from;
        }
    }

    fn defer(&mut self, command: Command, op: Operation) {
        if let Some(previous) = self.queued.replace(Queued { command, op }) {
            log::warn!("Replacing unclaimed {} action", previous.command);
            self.generation += 1;
        }
    }
}

impl Default for CommandState {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a console number of the form `AAABBBCCCDDD` into an address
pub fn parse_peer_number(number: &[u8]) -> Option<Ipv4Addr> {
    if number.len() != 12 || !number.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let mut octets = [0u8; 4];
    for (octet, digits) in octets.iter_mut().zip(number.chunks(3)) {
        let value = digits
            .iter()
            .fold(0u16, |acc, d| acc * 10 + (d - b'0') as u16);
        *octet = u8::try_from(value).ok()?;
    }
    Some(Ipv4Addr::from(octets))
}
