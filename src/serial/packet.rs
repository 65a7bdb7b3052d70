use std::fmt;

/// Largest payload a single packet can carry
pub const MAX_DATA_SIZE: usize = 0xFF;

/// Command byte flag set on every packet sent by the adapter
pub const REPLY_FLAG: u8 = 0x80;

/// Commands understood by the adapter. The discriminant is the wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    BeginSession = 0x10,
    EndSession = 0x11,
    DialTelephone = 0x12,
    HangUpTelephone = 0x13,
    WaitForTelephoneCall = 0x14,
    TransferData = 0x15,
    Reset = 0x16,
    TelephoneStatus = 0x17,
    Sio32Mode = 0x18,
    ReadConfigurationData = 0x19,
    WriteConfigurationData = 0x1A,
    TransferDataEnd = 0x1F,
    IspLogin = 0x21,
    IspLogout = 0x22,
    OpenTcpConnection = 0x23,
    CloseTcpConnection = 0x24,
    OpenUdpConnection = 0x25,
    CloseUdpConnection = 0x26,
    DnsQuery = 0x28,
    FirmwareVersion = 0x3F,
    Error = 0x6E,
}

impl Command {
    /// Look up a command from its wire byte, ignoring the reply flag
    pub fn from_byte(byte: u8) -> Option<Self> {
        let command = match byte & !REPLY_FLAG {
            0x10 => Self::BeginSession,
            0x11 => Self::EndSession,
            0x12 => Self::DialTelephone,
            0x13 => Self::HangUpTelephone,
            0x14 => Self::WaitForTelephoneCall,
            0x15 => Self::TransferData,
            0x16 => Self::Reset,
            0x17 => Self::TelephoneStatus,
            0x18 => Self::Sio32Mode,
            0x19 => Self::ReadConfigurationData,
            0x1A => Self::WriteConfigurationData,
            0x1F => Self::TransferDataEnd,
            0x21 => Self::IspLogin,
            0x22 => Self::IspLogout,
            0x23 => Self::OpenTcpConnection,
            0x24 => Self::CloseTcpConnection,
            0x25 => Self::OpenUdpConnection,
            0x26 => Self::CloseUdpConnection,
            0x28 => Self::DnsQuery,
            0x3F => Self::FirmwareVersion,
            0x6E => Self::Error,
            _ => return None,
        };
        Some(command)
    }

    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Whether handling this command can occupy the action slot
    pub fn may_defer(self) -> bool {
        matches!(
            self,
            Self::DialTelephone
                | Self::WaitForTelephoneCall
                | Self::TransferData
                | Self::ReadConfigurationData
                | Self::WriteConfigurationData
                | Self::OpenTcpConnection
                | Self::OpenUdpConnection
                | Self::DnsQuery
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, self.byte())
    }
}

/// Fixed-capacity byte buffer used for packet data and socket payloads.
///
/// Lives on the stack so the transfer path never allocates.
#[derive(Clone, Copy)]
pub struct Payload {
    len: usize,
    bytes: [u8; MAX_DATA_SIZE],
}

impl Payload {
    pub const fn new() -> Self {
        Self {
            len: 0,
            bytes: [0; MAX_DATA_SIZE],
        }
    }

    /// Copy `data`, truncating anything beyond `MAX_DATA_SIZE`
    pub fn from_slice(data: &[u8]) -> Self {
        let mut payload = Self::new();
        payload.extend(data);
        payload
    }

    /// A zero-filled payload of `len` bytes, ready to be read into
    pub fn zeroed(len: usize) -> Self {
        let mut payload = Self::new();
        payload.len = len.min(MAX_DATA_SIZE);
        payload
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        MAX_DATA_SIZE - self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len]
    }

    /// Append as much of `data` as fits, returning the number of bytes taken
    pub fn extend(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.remaining());
        self.bytes[self.len..self.len + take].copy_from_slice(&data[..take]);
        self.len += take;
        take
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Payload {}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload[{}]", hex::encode(self.as_slice()))
    }
}

/// A decoded protocol packet.
///
/// `command` is always the logical command; the reply flag only exists on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub command: Command,
    pub data: Payload,
}

impl Packet {
    pub fn new(command: Command, data: &[u8]) -> Self {
        Self {
            command,
            data: Payload::from_slice(data),
        }
    }

    pub fn empty(command: Command) -> Self {
        Self {
            command,
            data: Payload::new(),
        }
    }

    /// Error reply for `command` carrying a command error code
    pub fn error(command: Command, code: u8) -> Self {
        Self::new(Command::Error, &[command.byte(), code])
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }
}

/// 16-bit wrapping sum used by the packet trailer
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |sum, &b| sum.wrapping_add(b as u16))
}

/// Payload size once padded for the given transfer width
pub fn padded_len(len: usize, mode_32bit: bool) -> usize {
    if mode_32bit {
        (len + 3) & !3
    } else {
        len
    }
}

/// Encode a complete console-side frame: preamble, header, data, padding and checksum.
///
/// The trailer bytes are not included; they are exchanged one at a time.
pub fn encode_frame(command_byte: u8, data: &[u8], mode_32bit: bool) -> Vec<u8> {
    let len = data.len().min(MAX_DATA_SIZE);
    let padded = padded_len(len, mode_32bit);

    let mut body = Vec::with_capacity(4 + padded + 2);
    body.extend_from_slice(&[command_byte, 0x00, 0x00, len as u8]);
    body.extend_from_slice(&data[..len]);
    body.resize(4 + padded, 0x00);
    let sum = checksum(&body);
    body.extend_from_slice(&sum.to_be_bytes());

    let mut frame = Vec::with_capacity(2 + body.len());
    frame.extend_from_slice(&super::PREAMBLE);
    frame.extend_from_slice(&body);
    frame
}
