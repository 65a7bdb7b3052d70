//! Capabilities the adapter needs from the machine it runs on.
//!
//! The capability set is split by execution context. [`Board`] is owned by the
//! adapter and used from the transfer context, so every method must return
//! promptly. [`ConfigStore`] and [`Network`] are only touched from the action
//! context and may block.

pub mod clock;
pub mod host;
pub mod net;
pub mod storage;

pub use clock::StdClock;
pub use host::HostBackend;
pub use net::{NetworkTimeouts, StdNetwork};
pub use storage::{FileConfig, MemoryConfig};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::serial::Packet;

/// Size of the adapter configuration region
pub const CONFIG_SIZE: usize = 0x100;

/// Independent elapsed-time slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Latched on every serial byte
    Serial,
}

impl Timer {
    pub const COUNT: usize = 1;

    pub fn index(self) -> usize {
        match self {
            Timer::Serial => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Console to adapter
    Request,
    /// Adapter to console
    Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Connection closed by peer")]
    Closed,

    #[error("Operation timed out")]
    Timeout,

    #[error("Connection slot {0} is not open")]
    NotOpen(usize),

    #[error("Connection slot {0} is out of range")]
    InvalidSlot(usize),

    #[error("Configuration access out of bounds: offset {offset}, size {size}")]
    OutOfBounds { offset: usize, size: usize },

    #[error("Name resolution failed: {0}")]
    Resolve(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Transfer-context services
pub trait Board {
    /// Stop the serial interface from delivering bytes
    fn serial_disable(&mut self) {}

    /// Resume delivering bytes, resynchronising the interface if needed
    fn serial_enable(&mut self) {}

    /// Record "now" in the given timer slot
    fn time_latch(&mut self, timer: Timer);

    /// Whether more than `ms` milliseconds passed since the slot was latched
    fn time_check_ms(&self, timer: Timer, ms: u32) -> bool;

    /// Observe every packet crossing the link
    fn debug_packet(&mut self, direction: Direction, packet: &Packet) {
        if log::log_enabled!(log::Level::Debug) {
            let arrow = match direction {
                Direction::Request => ">>>",
                Direction::Reply => "<<<",
            };
            log::debug!(
                "{} {} [{}] {}",
                arrow,
                packet.command,
                packet.len(),
                hex::encode(packet.data())
            );
        }
    }
}

/// Persistent adapter configuration region
pub trait ConfigStore {
    /// Fill `dest` from the region starting at `offset`
    fn config_read(&mut self, offset: usize, dest: &mut [u8]) -> Result<()>;

    /// Store `src` into the region starting at `offset`
    fn config_write(&mut self, offset: usize, src: &[u8]) -> Result<()>;
}

/// Socket operations addressed by connection slot
pub trait Network {
    /// Create a socket in `conn`, replacing any socket still held there
    fn open(&mut self, conn: usize, kind: SocketKind, family: AddressFamily, bind_port: u16)
        -> Result<()>;

    /// Release the socket in `conn`; closing an empty slot is a no-op
    fn close(&mut self, conn: usize);

    /// Connect the socket, blocking up to the backend's connect timeout
    fn connect(&mut self, conn: usize, addr: SocketAddr) -> Result<()>;

    /// Start accepting calls on the socket's bound port
    fn listen(&mut self, conn: usize) -> Result<()>;

    /// Wait up to the accept timeout for a caller. On success the slot holds the
    /// accepted stream instead of the listener.
    fn accept(&mut self, conn: usize) -> Result<bool>;

    /// Send on the socket, to `addr` for unconnected datagram sockets
    fn send(&mut self, conn: usize, data: &[u8], addr: Option<SocketAddr>) -> Result<usize>;

    /// Read whatever is available without waiting.
    ///
    /// `Ok(0)` means no data yet; `Err(BackendError::Closed)` means the peer hung up.
    fn receive(
        &mut self,
        conn: usize,
        buf: &mut [u8],
        addr: Option<&mut SocketAddr>,
    ) -> Result<usize>;

    /// Resolve `host`, preferring the given servers when they are set
    fn resolve(&mut self, host: &str, dns1: Ipv4Addr, dns2: Ipv4Addr) -> Result<IpAddr>;
}

/// Everything the action context needs
pub trait Backend: ConfigStore + Network {}

impl<T: ConfigStore + Network + ?Sized> Backend for T {}

pub(crate) fn check_bounds(offset: usize, size: usize) -> Result<()> {
    if offset.checked_add(size).map_or(true, |end| end > CONFIG_SIZE) {
        return Err(BackendError::OutOfBounds { offset, size });
    }
    Ok(())
}
