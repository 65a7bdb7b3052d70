use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::{AddressFamily, ConfigStore, Network, Result, SocketKind};

/// Pairs a configuration store with a network into one action-context backend
#[derive(Debug)]
pub struct HostBackend<C, N> {
    pub config: C,
    pub net: N,
}

impl<C: ConfigStore, N: Network> HostBackend<C, N> {
    pub fn new(config: C, net: N) -> Self {
        Self { config, net }
    }
}

impl<C: ConfigStore, N> ConfigStore for HostBackend<C, N> {
    fn config_read(&mut self, offset: usize, dest: &mut [u8]) -> Result<()> {
        self.config.config_read(offset, dest)
    }

    fn config_write(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        self.config.config_write(offset, src)
    }
}

impl<C, N: Network> Network for HostBackend<C, N> {
    fn open(
        &mut self,
        conn: usize,
        kind: SocketKind,
        family: AddressFamily,
        bind_port: u16,
    ) -> Result<()> {
        self.net.open(conn, kind, family, bind_port)
    }

    fn close(&mut self, conn: usize) {
        self.net.close(conn)
    }

    fn connect(&mut self, conn: usize, addr: SocketAddr) -> Result<()> {
        self.net.connect(conn, addr)
    }

    fn listen(&mut self, conn: usize) -> Result<()> {
        self.net.listen(conn)
    }

    fn accept(&mut self, conn: usize) -> Result<bool> {
        self.net.accept(conn)
    }

    fn send(&mut self, conn: usize, data: &[u8], addr: Option<SocketAddr>) -> Result<usize> {
        self.net.send(conn, data, addr)
    }

    fn receive(
        &mut self,
        conn: usize,
        buf: &mut [u8],
        addr: Option<&mut SocketAddr>,
    ) -> Result<usize> {
        self.net.receive(conn, buf, addr)
    }

    fn resolve(&mut self, host: &str, dns1: Ipv4Addr, dns2: Ipv4Addr) -> Result<IpAddr> {
        self.net.resolve(host, dns1, dns2)
    }
}
