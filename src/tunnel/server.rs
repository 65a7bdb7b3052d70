use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{FrameDecoder, Result, TunnelCommand, TunnelRequest, ERROR_MAGIC, REPLY_MAGIC};
use crate::board::{AddressFamily, BackendError, Network, SocketKind};

const STATUS_OK: u8 = 0x01;
const STATUS_FAILED: u8 = 0x00;

/// Executes socket requests arriving from a tunnel board
pub struct TunnelServer<N: Network> {
    net: N,
    decoder: FrameDecoder,
}

impl<N: Network> TunnelServer<N> {
    pub fn new(net: N) -> Self {
        Self {
            net,
            decoder: FrameDecoder::new(),
        }
    }

    pub fn network(&self) -> &N {
        &self.net
    }

    /// Execute one request, returning the bytes to send back (if any)
    pub fn handle(&mut self, request: &TunnelRequest) -> Option<Vec<u8>> {
        let Some(command) = TunnelCommand::from_byte(request.command) else {
            log::warn!("Unknown tunnel command {}", request.command);
            return Some(vec![ERROR_MAGIC]);
        };
        let data = request.data.as_slice();

        match (command, data) {
            (TunnelCommand::Disconnect, &[conn]) => {
                log::debug!("Tunnel: close slot {}", conn);
                self.net.close(conn as usize);
                None
            }

            (TunnelCommand::Connect, &[conn, a, b, c, d, port_hi, port_lo]) => {
                let addr = SocketAddrV4::new(
                    Ipv4Addr::new(a, b, c, d),
                    u16::from_be_bytes([port_hi, port_lo]),
                );
                let status = match self.connect(conn as usize, SocketAddr::V4(addr)) {
                    Ok(()) => STATUS_OK,
                    Err(e) => {
                        log::info!("Tunnel: connect to {} failed: {}", addr, e);
                        STATUS_FAILED
                    }
                };
                Some(vec![REPLY_MAGIC, status])
            }

            (TunnelCommand::Send, &[conn, size, ref payload @ ..]) => {
                let payload = &payload[..payload.len().min(size as usize)];
                let status = match self.net.send(conn as usize, payload, None) {
                    Ok(_) => STATUS_OK,
                    Err(e) => {
                        log::info!("Tunnel: send on slot {} failed: {}", conn, e);
                        STATUS_FAILED
                    }
                };
                Some(vec![REPLY_MAGIC, status])
            }

            (TunnelCommand::Receive, &[conn]) => {
                let mut buf = [0u8; u8::MAX as usize];
                match self.net.receive(conn as usize, &mut buf, None) {
                    Ok(n) => {
                        let mut reply = Vec::with_capacity(2 + n);
                        reply.push(REPLY_MAGIC);
                        reply.push(n as u8);
                        reply.extend_from_slice(&buf[..n]);
                        Some(reply)
                    }
                    Err(BackendError::Closed) => {
                        log::info!("Tunnel: slot {} closed by peer", conn);
                        self.net.close(conn as usize);
                        Some(vec![ERROR_MAGIC])
                    }
                    Err(e) => {
                        log::info!("Tunnel: receive on slot {} failed: {}", conn, e);
                        Some(vec![ERROR_MAGIC])
                    }
                }
            }

            _ => {
                log::warn!(
                    "Malformed tunnel request {:?}: {}",
                    command,
                    hex::encode(data)
                );
                Some(vec![ERROR_MAGIC])
            }
        }
    }

    fn connect(&mut self, conn: usize, addr: SocketAddr) -> crate::board::Result<()> {
        self.net.open(conn, SocketKind::Tcp, AddressFamily::Ipv4, 0)?;
        if let Err(e) = self.net.connect(conn, addr) {
            self.net.close(conn);
            return Err(e);
        }
        Ok(())
    }

    /// Feed raw bytes from the link, writing replies as requests complete
    pub fn feed<W: Write>(&mut self, bytes: &[u8], out: &mut W) -> Result<usize> {
        let mut handled = 0;
        for &byte in bytes {
            let Some(request) = self.decoder.push(byte) else {
                continue;
            };
            handled += 1;
            if let Some(reply) = self.handle(&request) {
                out.write_all(&reply)?;
                out.flush()?;
            }
        }
        Ok(handled)
    }

    /// Serve the link until `stop` is set or the link fails
    pub fn run<P: Read + Write>(&mut self, link: &mut P, stop: &AtomicBool) -> Result<()> {
        let mut buf = [0u8; 512];
        log::info!("Tunnel server running");
        while !stop.load(Ordering::Acquire) {
            let n = match link.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    continue
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.feed(&buf[..n], link)?;
        }
        log::info!("Tunnel server stopped");
        Ok(())
    }
}
