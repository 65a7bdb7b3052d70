//! Deferred work: everything that may block runs here, outside the transfer context.
//!
//! A [`Job`] is a snapshot of one queued operation. Running it borrows only the
//! backend, so threaded hosts can release the adapter while it blocks and hand the
//! resulting [`Completion`] back afterwards.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::board::{AddressFamily, Backend, BackendError, SocketKind};
use crate::commands::{MAX_CONNECTIONS, PEER_SLOT};
use crate::serial::{Command, Payload, MAX_DATA_SIZE};

/// Link silence after which a half-received packet is abandoned
pub const SERIAL_TIMEOUT_MS: u32 = 500;

/// Link silence after which an open session is torn down
pub const SESSION_TIMEOUT_MS: u32 = 3000;

/// What the driving loop should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Re-latch the serial interface and wait for a new packet
    ResetSerial,
    /// End the session and close every socket
    DropConnection,
    /// Close sockets whose connection slot was released
    CloseConnection,
    Dial,
    WaitForCall,
    OpenConnection,
    Transfer,
    Resolve,
    ReadConfig,
    WriteConfig,
}

/// Parameters of one deferred operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Close {
        conns: [bool; MAX_CONNECTIONS],
    },
    Dial {
        addr: SocketAddrV4,
    },
    WaitForCall {
        port: u16,
        listening: bool,
    },
    Open {
        conn: usize,
        kind: SocketKind,
        addr: SocketAddrV4,
    },
    Transfer {
        conn: usize,
        outbound: Payload,
        receive: bool,
    },
    Resolve {
        host: Payload,
        dns1: Ipv4Addr,
        dns2: Ipv4Addr,
    },
    ReadConfig {
        offset: usize,
        size: usize,
    },
    WriteConfig {
        offset: usize,
        data: Payload,
    },
}

impl Operation {
    pub fn kind(&self) -> ActionKind {
        match self {
            Operation::Close { .. } => ActionKind::CloseConnection,
            Operation::Dial { .. } => ActionKind::Dial,
            Operation::WaitForCall { .. } => ActionKind::WaitForCall,
            Operation::Open { .. } => ActionKind::OpenConnection,
            Operation::Transfer { .. } => ActionKind::Transfer,
            Operation::Resolve { .. } => ActionKind::Resolve,
            Operation::ReadConfig { .. } => ActionKind::ReadConfig,
            Operation::WriteConfig { .. } => ActionKind::WriteConfig,
        }
    }
}

/// Result of running an operation against the backend
#[derive(Debug)]
pub enum Outcome {
    Closed { conns: [bool; MAX_CONNECTIONS] },
    Connected { conn: usize },
    ConnectFailed { conn: usize, error: BackendError },
    /// The backend could not even create the socket
    OpenFailed { conn: usize, error: BackendError },
    /// Nobody called; the listener stays open for the next wait
    NoCaller,
    Accepted,
    ListenFailed { error: BackendError },
    Transferred { conn: usize, received: Payload },
    PeerClosed { conn: usize },
    Resolved(Ipv4Addr),
    NotResolved,
    ConfigRead { offset: usize, data: Payload },
    ConfigWritten { offset: usize, size: usize },
    StorageFailed(BackendError),
}

/// A deferred operation taken out of the adapter, ready to run
#[derive(Debug, Clone, Copy)]
pub struct Job {
    generation: u64,
    command: Option<Command>,
    op: Operation,
}

/// Finished job, to be handed back with `Adapter::finish_action`
#[derive(Debug)]
pub struct Completion {
    pub(crate) generation: u64,
    pub(crate) command: Option<Command>,
    pub(crate) outcome: Outcome,
}

impl Completion {
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }
}

impl Job {
    pub(crate) fn new(generation: u64, command: Option<Command>, op: Operation) -> Self {
        Self {
            generation,
            command,
            op,
        }
    }

    pub(crate) fn close(generation: u64, conns: [bool; MAX_CONNECTIONS]) -> Self {
        Self::new(generation, None, Operation::Close { conns })
    }

    pub fn kind(&self) -> ActionKind {
        self.op.kind()
    }

    /// Execute against the backend. This is the only place that blocks.
    pub fn run<K: Backend + ?Sized>(self, backend: &mut K) -> Completion {
        log::trace!("Running {:?}", self.op);
        let outcome = match self.op {
            Operation::Close { conns } => {
                for (conn, _) in conns.iter().enumerate().filter(|(_, close)| **close) {
                    backend.close(conn);
                }
                Outcome::Closed { conns }
            }
            Operation::Dial { addr } => connect(backend, PEER_SLOT, SocketKind::Tcp, addr),
            Operation::Open { conn, kind, addr } => connect(backend, conn, kind, addr),
            Operation::WaitForCall { port, listening } => wait_for_call(backend, port, listening),
            Operation::Transfer {
                conn,
                outbound,
                receive,
            } => transfer(backend, conn, &outbound, receive),
            Operation::Resolve { host, dns1, dns2 } => resolve(backend, &host, dns1, dns2),
            Operation::ReadConfig { offset, size } => {
                let mut data = Payload::zeroed(size);
                match backend.config_read(offset, data.as_mut_slice()) {
                    Ok(()) => Outcome::ConfigRead { offset, data },
                    Err(e) => Outcome::StorageFailed(e),
                }
            }
            Operation::WriteConfig { offset, data } => {
                match backend.config_write(offset, data.as_slice()) {
                    Ok(()) => Outcome::ConfigWritten {
                        offset,
                        size: data.len(),
                    },
                    Err(e) => Outcome::StorageFailed(e),
                }
            }
        };

        Completion {
            generation: self.generation,
            command: self.command,
            outcome,
        }
    }
}

fn connect<K: Backend + ?Sized>(
    backend: &mut K,
    conn: usize,
    kind: SocketKind,
    addr: SocketAddrV4,
) -> Outcome {
    if let Err(error) = backend.open(conn, kind, AddressFamily::Ipv4, 0) {
        log::warn!("Could not open socket for slot {}: {}", conn, error);
        return Outcome::OpenFailed { conn, error };
    }
    match backend.connect(conn, SocketAddr::V4(addr)) {
        Ok(()) => Outcome::Connected { conn },
        Err(error) => {
            log::info!("Connection to {} failed: {}", addr, error);
            backend.close(conn);
            Outcome::ConnectFailed { conn, error }
        }
    }
}

fn wait_for_call<K: Backend + ?Sized>(backend: &mut K, port: u16, listening: bool) -> Outcome {
    if !listening {
        let opened = backend
            .open(PEER_SLOT, SocketKind::Tcp, AddressFamily::Ipv4, port)
            .and_then(|()| backend.listen(PEER_SLOT));
        if let Err(error) = opened {
            log::warn!("Could not listen on port {}: {}", port, error);
            backend.close(PEER_SLOT);
            return Outcome::ListenFailed { error };
        }
    }

    match backend.accept(PEER_SLOT) {
        Ok(true) => Outcome::Accepted,
        Ok(false) => Outcome::NoCaller,
        Err(error) => {
            backend.close(PEER_SLOT);
            Outcome::ListenFailed { error }
        }
    }
}

fn transfer<K: Backend + ?Sized>(
    backend: &mut K,
    conn: usize,
    outbound: &Payload,
    receive: bool,
) -> Outcome {
    if !outbound.is_empty() {
        if let Err(e) = backend.send(conn, outbound.as_slice(), None) {
            log::info!("Send on slot {} failed: {}", conn, e);
            backend.close(conn);
            return Outcome::PeerClosed { conn };
        }
    }

    let mut received = Payload::new();
    if receive {
        // one byte of the reply is taken by the connection id
        let mut buf = [0u8; MAX_DATA_SIZE - 1];
        match backend.receive(conn, &mut buf, None) {
            Ok(n) => {
                received.extend(&buf[..n]);
            }
            Err(BackendError::Closed) => {
                log::info!("Peer closed slot {}", conn);
                backend.close(conn);
                return Outcome::PeerClosed { conn };
            }
            Err(e) => {
                log::info!("Receive on slot {} failed: {}", conn, e);
                backend.close(conn);
                return Outcome::PeerClosed { conn };
            }
        }
    }

    Outcome::Transferred { conn, received }
}

fn resolve<K: Backend + ?Sized>(
    backend: &mut K,
    host: &Payload,
    dns1: Ipv4Addr,
    dns2: Ipv4Addr,
) -> Outcome {
    let Ok(name) = std::str::from_utf8(host.as_slice()) else {
        return Outcome::NotResolved;
    };
    match backend.resolve(name, dns1, dns2) {
        Ok(std::net::IpAddr::V4(ip)) => Outcome::Resolved(ip),
        Ok(other) => {
            log::debug!("{} only resolved to {}", name, other);
            Outcome::NotResolved
        }
        Err(e) => {
            log::debug!("Lookup of {} failed: {}", name, e);
            Outcome::NotResolved
        }
    }
}
