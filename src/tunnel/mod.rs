//! PC side of the serial socket tunnel.
//!
//! A microcontroller running the adapter has no network of its own. It forwards
//! every socket operation over its UART, and this end executes them:
//!
//! ```text
//! board -> pc:  0xCD len 0xCD cmd data[len]
//! pc -> board:  0xCE reply...        (success)
//!               0xCF                 (failure)
//! ```

pub mod port;
pub mod server;

pub use port::{list_ports, open_port, PortInfo};
pub use server::TunnelServer;

pub const FRAME_MAGIC: u8 = 0xCD;
pub const REPLY_MAGIC: u8 = 0xCE;
pub const ERROR_MAGIC: u8 = 0xCF;

pub const DEFAULT_BAUD_RATE: u32 = 115200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelCommand {
    /// `[conn]`, no reply
    Disconnect = 0,
    /// `[conn ip[4] port_be[2]]`, replies one status byte
    Connect = 1,
    /// `[conn size data]`, replies one status byte
    Send = 2,
    /// `[conn]`, replies `len data[len]`
    Receive = 3,
}

impl TunnelCommand {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Disconnect),
            1 => Some(Self::Connect),
            2 => Some(Self::Send),
            3 => Some(Self::Receive),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;

/// A decoded board request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub command: u8,
    pub data: Vec<u8>,
}

impl TunnelRequest {
    /// Frame a request the way the board sends it
    pub fn encode(command: u8, data: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(4 + data.len());
        frame.extend_from_slice(&[FRAME_MAGIC, data.len() as u8, FRAME_MAGIC, command]);
        frame.extend_from_slice(data);
        frame
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Magic,
    Length,
    SecondMagic,
    Command,
    Data,
}

/// Incremental frame decoder; bytes outside a frame are skipped
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    len: usize,
    command: u8,
    data: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Magic,
            len: 0,
            command: 0,
            data: Vec::new(),
        }
    }

    pub fn push(&mut self, byte: u8) -> Option<TunnelRequest> {
        match self.state {
            DecodeState::Magic => {
                if byte == FRAME_MAGIC {
                    self.state = DecodeState::Length;
                } else {
                    log::trace!("Skipping stray byte 0x{:02X}", byte);
                }
            }
            DecodeState::Length => {
                self.len = byte as usize;
                self.state = DecodeState::SecondMagic;
            }
            DecodeState::SecondMagic => {
                if byte == FRAME_MAGIC {
                    self.state = DecodeState::Command;
                } else {
                    log::warn!("Malformed tunnel frame header");
                    self.state = DecodeState::Magic;
                }
            }
            DecodeState::Command => {
                self.command = byte;
                self.data.clear();
                if self.len == 0 {
                    return Some(self.finish());
                }
                self.state = DecodeState::Data;
            }
            DecodeState::Data => {
                self.data.push(byte);
                if self.data.len() == self.len {
                    return Some(self.finish());
                }
            }
        }
        None
    }

    fn finish(&mut self) -> TunnelRequest {
        self.state = DecodeState::Magic;
        TunnelRequest {
            command: self.command,
            data: std::mem::take(&mut self.data),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
