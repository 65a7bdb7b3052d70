//! Bridge to the BGB emulator link protocol (version 1.4).
//!
//! The emulator connects a Game Boy's serial port over TCP and exchanges fixed
//! 8-byte packets. The adapter plays the slave side of every transfer.

pub mod bridge;
pub mod link;

pub use bridge::{BgbBridge, BgbClock, EmulatorTime};
pub use link::{BgbLink, LinkHandler};

pub const PACKET_SIZE: usize = 8;

pub const CMD_VERSION: u8 = 1;
pub const CMD_JOYPAD: u8 = 101;
pub const CMD_SYNC1: u8 = 104;
pub const CMD_SYNC2: u8 = 105;
pub const CMD_SYNC3: u8 = 106;
pub const CMD_STATUS: u8 = 108;
pub const CMD_WANTDISCONNECT: u8 = 109;

pub const STATUS_RUNNING: u8 = 0x01;
pub const STATUS_PAUSED: u8 = 0x02;

/// Control byte sent with every SYNC2 reply
pub const SYNC2_CONTROL: u8 = 0x80;

pub const PROTOCOL_VERSION: (u8, u8, u8) = (1, 4, 0);

/// Emulator clock rate in ticks per second
pub const CLOCK_HZ: u64 = 1 << 21;

/// Default address BGB listens on for link cable connections
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8765;

#[derive(Debug, thiserror::Error)]
pub enum BgbError {
    #[error("Link closed by emulator")]
    Disconnected,

    #[error("Unsupported link protocol version {0}.{1}.{2}")]
    VersionMismatch(u8, u8, u8),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BgbError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BgbPacket {
    pub cmd: u8,
    pub b2: u8,
    pub b3: u8,
    pub b4: u8,
    pub timestamp: u32,
}

impl BgbPacket {
    pub fn to_bytes(self) -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];
        buf[0] = self.cmd;
        buf[1] = self.b2;
        buf[2] = self.b3;
        buf[3] = self.b4;
        buf[4..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; PACKET_SIZE]) -> Self {
        Self {
            cmd: buf[0],
            b2: buf[1],
            b3: buf[2],
            b4: buf[3],
            timestamp: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    pub fn version() -> Self {
        let (major, minor, patch) = PROTOCOL_VERSION;
        Self {
            cmd: CMD_VERSION,
            b2: major,
            b3: minor,
            b4: patch,
            timestamp: 0,
        }
    }

    pub fn status(flags: u8) -> Self {
        Self {
            cmd: CMD_STATUS,
            b2: flags,
            ..Self::default()
        }
    }

    /// Slave reply to a SYNC1 transfer
    pub fn sync2(data: u8) -> Self {
        Self {
            cmd: CMD_SYNC2,
            b2: data,
            b3: SYNC2_CONTROL,
            ..Self::default()
        }
    }

    pub fn sync3_timestamp(timestamp: u32) -> Self {
        Self {
            cmd: CMD_SYNC3,
            timestamp: timestamp & 0x7FFF_FFFF,
            ..Self::default()
        }
    }

    pub fn want_disconnect() -> Self {
        Self {
            cmd: CMD_WANTDISCONNECT,
            ..Self::default()
        }
    }
}
