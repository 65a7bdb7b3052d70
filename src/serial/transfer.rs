use super::packet::{checksum, padded_len, Command, Packet, REPLY_FLAG};
use super::{
    SerialError, BUFFER_SIZE, CHECKSUM_SIZE, CONSOLE_GAMEBOY, CONSOLE_GAMEBOY_ADVANCE,
    DEVICE_FLAG, HEADER_SIZE, IDLE_BYTE, PREAMBLE,
};
use crate::adapter::AdapterDevice;

/// Where the byte-level state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialPhase {
    Waiting,
    Data,
    Checksum,
    Acknowledge,
    ResponseWaiting,
    ResponseStart,
    ResponseData,
    ResponseAcknowledge,
}

/// Outcome of handing a complete packet to the command layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handled {
    /// Immediate reply, or `None` when the reply comes from a deferred action
    pub reply: Option<Packet>,
    /// Requested transfer width for the next packet
    pub mode_32bit: Option<bool>,
}

impl Handled {
    pub fn reply(packet: Packet) -> Self {
        Self {
            reply: Some(packet),
            mode_32bit: None,
        }
    }

    pub fn deferred() -> Self {
        Self {
            reply: None,
            mode_32bit: None,
        }
    }
}

/// Receives packets from the serial state machine.
///
/// Called from the transfer context, so implementations must not block.
pub trait PacketHandler {
    fn handle(&mut self, packet: &Packet) -> super::Result<Handled>;

    /// The console gave up waiting for a reply and started a new packet
    fn abandon(&mut self);
}

/// Byte-at-a-time framing state for one serial link
pub struct SerialState {
    phase: SerialPhase,
    mode_32bit: bool,
    mode_32bit_cur: bool,
    current: usize,
    buffer: [u8; BUFFER_SIZE],
    data_size: usize,
    response_size: usize,
    checksum: u16,
    error: Option<SerialError>,
    after_ack: SerialPhase,
    console_ack: u8,
}

impl SerialState {
    pub fn new() -> Self {
        Self {
            phase: SerialPhase::Waiting,
            mode_32bit: false,
            mode_32bit_cur: false,
            current: 0,
            buffer: [0; BUFFER_SIZE],
            data_size: 0,
            response_size: 0,
            checksum: 0,
            error: None,
            after_ack: SerialPhase::Waiting,
            console_ack: 0,
        }
    }

    pub fn phase(&self) -> SerialPhase {
        self.phase
    }

    /// Transfer width of the packet currently on the wire
    pub fn mode_32bit(&self) -> bool {
        self.mode_32bit_cur
    }

    /// Transfer width requested for the next packet
    pub fn mode_32bit_pending(&self) -> bool {
        self.mode_32bit
    }

    /// Drop whatever was in progress and wait for the next preamble.
    ///
    /// A reply that was still being sent is lost; the console retransmits.
    pub fn reset(&mut self) {
        self.phase = SerialPhase::Waiting;
        self.current = 0;
        self.error = None;
    }

    /// True while a packet is partially received or sent
    pub fn mid_packet(&self) -> bool {
        !matches!(
            self.phase,
            SerialPhase::Waiting | SerialPhase::ResponseWaiting
        )
    }

    /// True while the state machine has no reply loaded for the current packet
    pub fn awaiting_reply(&self) -> bool {
        match self.phase {
            SerialPhase::ResponseWaiting => true,
            SerialPhase::Acknowledge => self.after_ack == SerialPhase::ResponseWaiting,
            _ => false,
        }
    }

    /// Load a deferred reply. Ignored unless a reply is being waited for.
    pub fn deliver(&mut self, reply: &Packet) -> bool {
        if !self.awaiting_reply() {
            return false;
        }
        self.load_reply(reply);
        if self.phase == SerialPhase::Acknowledge {
            self.after_ack = SerialPhase::ResponseStart;
        } else {
            self.enter(SerialPhase::ResponseStart);
        }
        true
    }

    /// Exchange one byte with the console.
    ///
    /// Bounded work per call: no allocation and no blocking. A complete packet is
    /// handed to `handler` at the acknowledge step.
    pub fn exchange<H: PacketHandler>(
        &mut self,
        byte: u8,
        device: AdapterDevice,
        handler: &mut H,
    ) -> u8 {
        match self.phase {
            SerialPhase::Waiting => {
                if self.scan_preamble(byte) {
                    self.begin_request();
                }
                IDLE_BYTE
            }

            SerialPhase::Data => {
                self.buffer[self.current] = byte;
                self.current += 1;
                self.checksum = self.checksum.wrapping_add(byte as u16);

                if self.current == HEADER_SIZE {
                    if self.buffer[2] != 0 {
                        log::warn!(
                            "Dropping packet 0x{:02X}: length exceeds one byte",
                            self.buffer[0]
                        );
                        self.reset();
                        return IDLE_BYTE;
                    }
                    self.data_size = padded_len(self.buffer[3] as usize, self.mode_32bit_cur);
                }
                if self.current >= HEADER_SIZE && self.current == HEADER_SIZE + self.data_size {
                    self.phase = SerialPhase::Checksum;
                }
                IDLE_BYTE
            }

            SerialPhase::Checksum => {
                self.buffer[self.current] = byte;
                self.current += 1;

                let end = HEADER_SIZE + self.data_size + CHECKSUM_SIZE;
                if self.current < end {
                    return IDLE_BYTE;
                }

                let received = u16::from_be_bytes([self.buffer[end - 2], self.buffer[end - 1]]);
                if received != self.checksum {
                    self.error = Some(SerialError::Checksum);
                }
                self.current = 0;
                self.phase = SerialPhase::Acknowledge;
                device.id() | DEVICE_FLAG
            }

            SerialPhase::Acknowledge => {
                if self.current == 0 {
                    let (out, next) = self.acknowledge(byte, device, handler);
                    self.after_ack = next;
                    // Error acknowledgements are padded too
                    if self.mode_32bit_cur {
                        self.current = 1;
                    } else {
                        self.enter(next);
                    }
                    return out;
                }

                // 32-bit trailer padding
                self.current += 1;
                if self.current >= 3 {
                    self.enter(self.after_ack);
                }
                0x00
            }

            SerialPhase::ResponseWaiting => {
                if self.scan_preamble(byte) {
                    log::debug!("Console restarted before the reply was ready");
                    handler.abandon();
                    self.begin_request();
                }
                IDLE_BYTE
            }

            SerialPhase::ResponseStart => {
                if self.current == 0 {
                    self.current = 1;
                    PREAMBLE[0]
                } else {
                    self.current = 0;
                    self.phase = SerialPhase::ResponseData;
                    PREAMBLE[1]
                }
            }

            SerialPhase::ResponseData => {
                let out = self.buffer[self.current];
                self.current += 1;
                if self.current >= self.response_size {
                    self.current = 0;
                    self.console_ack = 0;
                    self.phase = SerialPhase::ResponseAcknowledge;
                }
                out
            }

            SerialPhase::ResponseAcknowledge => {
                let step = self.current;
                self.current += 1;
                if step == 2 {
                    self.console_ack = byte;
                }

                let trailer = if self.mode_32bit_cur { 4 } else { 2 };
                if step < trailer {
                    return if step == 0 {
                        device.id() | DEVICE_FLAG
                    } else {
                        0x00
                    };
                }

                if self.console_ack == SerialError::Checksum.code() {
                    log::warn!("Console rejected reply checksum, resending");
                    self.enter(SerialPhase::ResponseStart);
                } else {
                    let expected = self.buffer[0] ^ REPLY_FLAG;
                    if self.console_ack != expected {
                        log::debug!(
                            "Unexpected reply acknowledge 0x{:02X} (expected 0x{:02X})",
                            self.console_ack,
                            expected
                        );
                    }
                    self.enter(SerialPhase::Waiting);
                }
                IDLE_BYTE
            }
        }
    }

    /// Validate the finished packet and decide the acknowledge byte
    fn acknowledge<H: PacketHandler>(
        &mut self,
        byte: u8,
        device: AdapterDevice,
        handler: &mut H,
    ) -> (u8, SerialPhase) {
        if device.checks_console()
            && !self.mode_32bit_cur
            && byte != (CONSOLE_GAMEBOY | DEVICE_FLAG)
            && byte != (CONSOLE_GAMEBOY_ADVANCE | DEVICE_FLAG)
        {
            log::warn!("Unexpected console device byte 0x{:02X}", byte);
            return (IDLE_BYTE, SerialPhase::Waiting);
        }

        if let Some(error) = self.error.take() {
            log::debug!("Rejecting packet 0x{:02X}: {}", self.buffer[0], error);
            return (error.code(), SerialPhase::Waiting);
        }

        let command_byte = self.buffer[0];
        let Some(command) = Command::from_byte(command_byte) else {
            log::debug!("Rejecting unknown command 0x{:02X}", command_byte);
            return (SerialError::UnknownCommand.code(), SerialPhase::Waiting);
        };

        let len = self.buffer[3] as usize;
        let packet = Packet::new(command, &self.buffer[HEADER_SIZE..HEADER_SIZE + len]);

        match handler.handle(&packet) {
            Err(error) => (error.code(), SerialPhase::Waiting),
            Ok(handled) => {
                if let Some(mode) = handled.mode_32bit {
                    self.mode_32bit = mode;
                }
                let next = match handled.reply {
                    Some(reply) => {
                        self.load_reply(&reply);
                        SerialPhase::ResponseStart
                    }
                    None => SerialPhase::ResponseWaiting,
                };
                (command_byte ^ REPLY_FLAG, next)
            }
        }
    }

    fn scan_preamble(&mut self, byte: u8) -> bool {
        if byte == PREAMBLE[0] {
            self.current = 1;
        } else if byte == PREAMBLE[1] && self.current == 1 {
            return true;
        } else {
            self.current = 0;
        }
        false
    }

    fn begin_request(&mut self) {
        self.mode_32bit_cur = self.mode_32bit;
        self.phase = SerialPhase::Data;
        self.current = 0;
        self.checksum = 0;
        self.data_size = 0;
        self.error = None;
    }

    fn enter(&mut self, phase: SerialPhase) {
        self.phase = phase;
        self.current = 0;
    }

    fn load_reply(&mut self, reply: &Packet) {
        let len = reply.len();
        let padded = padded_len(len, self.mode_32bit_cur);

        self.buffer[0] = reply.command.byte() | REPLY_FLAG;
        self.buffer[1] = 0x00;
        self.buffer[2] = 0x00;
        self.buffer[3] = len as u8;
        self.buffer[HEADER_SIZE..HEADER_SIZE + len].copy_from_slice(reply.data());
        self.buffer[HEADER_SIZE + len..HEADER_SIZE + padded].fill(0x00);

        let end = HEADER_SIZE + padded;
        let sum = checksum(&self.buffer[..end]);
        self.buffer[end..end + CHECKSUM_SIZE].copy_from_slice(&sum.to_be_bytes());
        self.response_size = end + CHECKSUM_SIZE;
    }
}

impl Default for SerialState {
    fn default() -> Self {
        Self::new()
    }
}
