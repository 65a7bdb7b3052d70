pub mod packet;
pub mod transfer;

pub use packet::{Command, Packet, Payload, MAX_DATA_SIZE};
pub use transfer::{Handled, PacketHandler, SerialPhase, SerialState};

/// Bytes that start every packet
pub const PREAMBLE: [u8; 2] = [0x99, 0x66];

/// Emitted by the adapter whenever it has nothing to say
pub const IDLE_BYTE: u8 = 0xD2;

/// Command, unused, length high, length low
pub const HEADER_SIZE: usize = 4;
pub const CHECKSUM_SIZE: usize = 2;

/// Header, largest payload, checksum and room for 32-bit padding
pub const BUFFER_SIZE: usize = HEADER_SIZE + MAX_DATA_SIZE + CHECKSUM_SIZE + 3;

/// Device byte flag; the low bits carry the device id
pub const DEVICE_FLAG: u8 = 0x80;

/// Device ids the consoles announce in the acknowledge slot
pub const CONSOLE_GAMEBOY: u8 = 0x00;
pub const CONSOLE_GAMEBOY_ADVANCE: u8 = 0x01;

/// Link-level failures, sent back in place of the acknowledge byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(u8)]
pub enum SerialError {
    #[error("Unknown command")]
    UnknownCommand = 0xF0,

    #[error("Checksum mismatch")]
    Checksum = 0xF1,

    #[error("Adapter busy with a previous command")]
    Internal = 0xF2,
}

impl SerialError {
    pub fn code(self) -> u8 {
        self as u8
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;
