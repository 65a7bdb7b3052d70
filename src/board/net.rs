use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::Resolver;

use super::{AddressFamily, BackendError, Network, Result, SocketKind};

const DNS_PORT: u16 = 53;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bounds for the blocking socket operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkTimeouts {
    pub connect_ms: u64,
    pub accept_ms: u64,
    pub send_ms: u64,
}

impl Default for NetworkTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: 5000,
            accept_ms: 1000,
            send_ms: 1000,
        }
    }
}

#[derive(Debug)]
enum Socket {
    /// Opened but not yet connected or listening
    Unbound {
        kind: SocketKind,
        family: AddressFamily,
        bind_port: u16,
    },
    Stream(TcpStream),
    Listener(TcpListener),
    Datagram(UdpSocket),
}

/// Network backend on top of `std::net`.
///
/// Sockets are switched to non-blocking mode once established, so `receive`
/// never waits. DNS goes through `trust-dns-resolver`.
#[derive(Debug)]
pub struct StdNetwork {
    slots: Vec<Option<Socket>>,
    timeouts: NetworkTimeouts,
}

impl StdNetwork {
    pub fn new(slots: usize, timeouts: NetworkTimeouts) -> Self {
        Self {
            slots: (0..slots).map(|_| None).collect(),
            timeouts,
        }
    }

    pub fn is_open(&self, conn: usize) -> bool {
        matches!(self.slots.get(conn), Some(Some(_)))
    }

    /// Local address of the socket in `conn`, mostly useful once listening
    pub fn local_addr(&self, conn: usize) -> Option<SocketAddr> {
        match self.slots.get(conn)? {
            Some(Socket::Stream(s)) => s.local_addr().ok(),
            Some(Socket::Listener(l)) => l.local_addr().ok(),
            Some(Socket::Datagram(u)) => u.local_addr().ok(),
            _ => None,
        }
    }

    fn slot(&mut self, conn: usize) -> Result<&mut Option<Socket>> {
        self.slots
            .get_mut(conn)
            .ok_or(BackendError::InvalidSlot(conn))
    }

    fn socket(&mut self, conn: usize) -> Result<&mut Socket> {
        self.slot(conn)?.as_mut().ok_or(BackendError::NotOpen(conn))
    }
}

fn unspecified(family: AddressFamily) -> IpAddr {
    match family {
        AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn write_all_within(stream: &mut TcpStream, mut data: &[u8], limit: Duration) -> Result<usize> {
    let total = data.len();
    let deadline = Instant::now() + limit;
    while !data.is_empty() {
        match stream.write(data) {
            Ok(0) => return Err(BackendError::Closed),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(BackendError::Timeout);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}

/// Repeat a non-blocking socket call until it stops reporting `WouldBlock`
fn retry_within<T>(limit: Duration, mut op: impl FnMut() -> std::io::Result<T>) -> Result<T> {
    let deadline = Instant::now() + limit;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(BackendError::Timeout);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

fn closed_on_reset(e: std::io::Error) -> BackendError {
    match e.kind() {
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            BackendError::Closed
        }
        _ => e.into(),
    }
}

impl Network for StdNetwork {
    fn open(
        &mut self,
        conn: usize,
        kind: SocketKind,
        family: AddressFamily,
        bind_port: u16,
    ) -> Result<()> {
        let slot = self.slot(conn)?;
        if slot.take().is_some() {
            log::debug!("Replacing socket still held in slot {}", conn);
        }

        *slot = Some(match kind {
            SocketKind::Tcp => Socket::Unbound {
                kind,
                family,
                bind_port,
            },
            SocketKind::Udp => {
                let socket = UdpSocket::bind(SocketAddr::new(unspecified(family), bind_port))?;
                socket.set_nonblocking(true)?;
                Socket::Datagram(socket)
            }
        });
        Ok(())
    }

    fn close(&mut self, conn: usize) {
        if let Some(slot) = self.slots.get_mut(conn) {
            if slot.take().is_some() {
                log::trace!("Closed socket in slot {}", conn);
            }
        }
    }

    fn connect(&mut self, conn: usize, addr: SocketAddr) -> Result<()> {
        let timeout = Duration::from_millis(self.timeouts.connect_ms);
        let slot = self.slot(conn)?;
        match slot {
            Some(Socket::Unbound {
                kind: SocketKind::Tcp,
                bind_port,
                ..
            }) => {
                if *bind_port != 0 {
                    log::debug!("Ignoring bind port {} for outgoing stream", bind_port);
                }
                let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
                    if e.kind() == ErrorKind::TimedOut {
                        BackendError::Timeout
                    } else {
                        e.into()
                    }
                })?;
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                log::info!("Connected slot {} to {}", conn, addr);
                *slot = Some(Socket::Stream(stream));
                Ok(())
            }
            Some(Socket::Datagram(socket)) => {
                socket.connect(addr)?;
                Ok(())
            }
            Some(_) => Err(BackendError::Unsupported(format!(
                "slot {} cannot connect in its current state",
                conn
            ))),
            None => Err(BackendError::NotOpen(conn)),
        }
    }

    fn listen(&mut self, conn: usize) -> Result<()> {
        let slot = self.slot(conn)?;
        match slot {
            Some(Socket::Listener(_)) => Ok(()),
            Some(Socket::Unbound {
                kind: SocketKind::Tcp,
                family,
                bind_port,
            }) => {
                let listener = TcpListener::bind(SocketAddr::new(unspecified(*family), *bind_port))?;
                listener.set_nonblocking(true)?;
                log::info!("Listening for calls on {}", listener.local_addr()?);
                *slot = Some(Socket::Listener(listener));
                Ok(())
            }
            Some(_) => Err(BackendError::Unsupported(format!(
                "slot {} cannot listen in its current state",
                conn
            ))),
            None => Err(BackendError::NotOpen(conn)),
        }
    }

    fn accept(&mut self, conn: usize) -> Result<bool> {
        let deadline = Instant::now() + Duration::from_millis(self.timeouts.accept_ms);
        let slot = self.slot(conn)?;
        let Some(Socket::Listener(listener)) = slot else {
            return Err(BackendError::NotOpen(conn));
        };

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(true)?;
                    stream.set_nodelay(true)?;
                    log::info!("Accepted call from {}", peer);
                    *slot = Some(Socket::Stream(stream));
                    return Ok(true);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn send(&mut self, conn: usize, data: &[u8], addr: Option<SocketAddr>) -> Result<usize> {
        let limit = Duration::from_millis(self.timeouts.send_ms);
        match self.socket(conn)? {
            Socket::Stream(stream) => write_all_within(stream, data, limit).map_err(|e| match e {
                BackendError::IoError(io) => closed_on_reset(io),
                other => other,
            }),
            Socket::Datagram(socket) => {
                let sent = retry_within(limit, || match addr {
                    Some(addr) => socket.send_to(data, addr),
                    None => socket.send(data),
                });
                if let Err(BackendError::Timeout) = sent {
                    log::warn!(
                        "Dropping {} byte datagram on connection {}: send buffer full",
                        data.len(),
                        conn
                    );
                }
                sent
            }
            _ => Err(BackendError::NotOpen(conn)),
        }
    }

    fn receive(
        &mut self,
        conn: usize,
        buf: &mut [u8],
        addr: Option<&mut SocketAddr>,
    ) -> Result<usize> {
        match self.socket(conn)? {
            Socket::Stream(stream) => match stream.read(buf) {
                Ok(0) if !buf.is_empty() => Err(BackendError::Closed),
                Ok(n) => Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(closed_on_reset(e)),
            },
            Socket::Datagram(socket) => match socket.recv_from(buf) {
                Ok((n, from)) => {
                    if let Some(addr) = addr {
                        *addr = from;
                    }
                    Ok(n)
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(e.into()),
            },
            _ => Err(BackendError::NotOpen(conn)),
        }
    }

    fn resolve(&mut self, host: &str, dns1: Ipv4Addr, dns2: Ipv4Addr) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let servers: Vec<IpAddr> = [dns1, dns2]
            .into_iter()
            .filter(|ip| !ip.is_unspecified())
            .map(IpAddr::V4)
            .collect();

        let resolver = if servers.is_empty() {
            Resolver::from_system_conf()?
        } else {
            let group = NameServerConfigGroup::from_ips_clear(&servers, DNS_PORT, true);
            Resolver::new(
                ResolverConfig::from_parts(None, vec![], group),
                ResolverOpts::default(),
            )?
        };

        let lookup = resolver
            .lookup_ip(host)
            .map_err(|e| BackendError::Resolve(e.to_string()))?;
        let found = lookup
            .iter()
            .find(IpAddr::is_ipv4)
            .or_else(|| lookup.iter().next());
        match found {
            Some(ip) => {
                log::debug!("Resolved {} to {}", host, ip);
                Ok(ip)
            }
            None => Err(BackendError::Resolve(format!("no addresses for {}", host))),
        }
    }
}
