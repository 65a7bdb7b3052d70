use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    BgbError, BgbPacket, Result, CMD_JOYPAD, CMD_STATUS, CMD_SYNC1, CMD_SYNC3, CMD_VERSION,
    CMD_WANTDISCONNECT, PACKET_SIZE, PROTOCOL_VERSION, STATUS_PAUSED, STATUS_RUNNING,
};
use crate::serial::IDLE_BYTE;

/// Receives what the emulator sends over the link. Called inline from the
/// link task, so it must return promptly.
pub trait LinkHandler {
    /// One serial byte from the console; returns the adapter's byte
    fn transfer(&mut self, byte: u8, timestamp: u32) -> u8;

    /// The emulator's clock advanced
    fn sync_time(&mut self, timestamp: u32);
}

enum Step {
    Continue(Option<BgbPacket>),
    Stop,
}

/// Slave end of one BGB link connection
pub struct BgbLink<S> {
    stream: S,
    transfer_last: u8,
    handshake_done: bool,
    status_sent: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> BgbLink<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            transfer_last: IDLE_BYTE,
            handshake_done: false,
            status_sent: false,
        }
    }

    /// Drive the link until the emulator disconnects
    pub async fn run<H: LinkHandler>(&mut self, handler: &mut H) -> Result<()> {
        self.send(BgbPacket::version()).await?;

        loop {
            let packet = match self.recv().await {
                Ok(packet) => packet,
                Err(BgbError::Disconnected) => {
                    log::info!("Emulator closed the link");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match self.on_packet(packet, handler)? {
                Step::Continue(Some(reply)) => self.send(reply).await?,
                Step::Continue(None) => {}
                Step::Stop => {
                    log::info!("Emulator requested disconnect");
                    return Ok(());
                }
            }
        }
    }

    fn on_packet<H: LinkHandler>(&mut self, packet: BgbPacket, handler: &mut H) -> Result<Step> {
        let step = match packet.cmd {
            CMD_VERSION => {
                if self.handshake_done {
                    log::warn!("Ignoring repeated version packet");
                    return Ok(Step::Continue(None));
                }
                let version = (packet.b2, packet.b3, packet.b4);
                if version != PROTOCOL_VERSION {
                    return Err(BgbError::VersionMismatch(packet.b2, packet.b3, packet.b4));
                }
                self.handshake_done = true;
                log::info!("Link handshake complete");
                // Announced paused until the first STATUS exchange
                Step::Continue(Some(BgbPacket::status(STATUS_RUNNING | STATUS_PAUSED)))
            }

            CMD_JOYPAD => Step::Continue(None),

            CMD_SYNC1 => {
                // The reply carries the byte shifted out during the previous transfer
                let out = handler.transfer(packet.b2, packet.timestamp);
                let reply = BgbPacket::sync2(self.transfer_last);
                self.transfer_last = out;
                Step::Continue(Some(reply))
            }

            CMD_SYNC3 => {
                if packet.b2 != 0 {
                    return Ok(Step::Continue(None));
                }
                handler.sync_time(packet.timestamp);
                Step::Continue(Some(packet))
            }

            CMD_STATUS => {
                if self.status_sent {
                    Step::Continue(None)
                } else {
                    self.status_sent = true;
                    Step::Continue(Some(BgbPacket::status(STATUS_RUNNING)))
                }
            }

            CMD_WANTDISCONNECT => Step::Stop,

            other => {
                log::warn!(
                    "Unknown link command {} ({:02X} {:02X} {:02X})",
                    other,
                    packet.b2,
                    packet.b3,
                    packet.b4
                );
                Step::Continue(None)
            }
        };
        Ok(step)
    }

    async fn send(&mut self, packet: BgbPacket) -> Result<()> {
        self.stream.write_all(&packet.to_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<BgbPacket> {
        let mut buf = [0u8; PACKET_SIZE];
        match self.stream.read_exact(&mut buf).await {
            Ok(_) => Ok(BgbPacket::from_bytes(&buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(BgbError::Disconnected),
            Err(e) => Err(e.into()),
        }
    }
}
