use std::net::{Ipv4Addr, SocketAddrV4};

use super::{
    parse_peer_number, CommandError, CommandState, ConnectionState, Line, Result, Slot,
    CALL_CONNECTION_ID, CALL_HANDSHAKE_PACKETS, CONFIG_TRANSFER_MAX, ISP_LOCAL_ADDRESS,
    ISP_NUMBERS, MAX_CONNECTIONS, PEER_SLOT, SESSION_MAGIC, STATUS_SERVICE, STATUS_UNMETERED,
};
use crate::action::{Operation, Outcome};
use crate::adapter::AdapterConfig;
use crate::board::{SocketKind, CONFIG_SIZE};
use crate::serial::{self, Command, Handled, Packet, Payload, SerialError};

impl CommandState {
    /// Handle one request packet from the console.
    ///
    /// Runs in the transfer context: state changes happen immediately, anything
    /// that could block is queued and answered later by [`CommandState::complete`].
    /// Fails only when the command needs the action slot while `busy`.
    pub(crate) fn handle(
        &mut self,
        packet: &Packet,
        config: &AdapterConfig,
        busy: bool,
    ) -> serial::Result<Handled> {
        let command = packet.command;
        if busy && command.may_defer() {
            log::debug!("Refusing {} while an action is running", command);
            return Err(SerialError::Internal);
        }

        if !self.session_begun && command != Command::BeginSession {
            log::debug!("{} outside of a session", command);
            return Ok(Handled::reply(Packet::error(
                command,
                CommandError::InvalidState.code(),
            )));
        }

        let data = packet.data();
        let result = match command {
            Command::BeginSession => self.begin_session(packet),
            Command::EndSession => {
                log::info!("Session ended by console");
                self.end_session();
                Ok(Handled::reply(Packet::empty(command)))
            }
            Command::DialTelephone => self.dial(data, config),
            Command::HangUpTelephone => self.hang_up(),
            Command::WaitForTelephoneCall => self.wait_for_call(config),
            Command::TransferData => self.transfer_data(data),
            Command::TransferDataEnd => self.transfer_data_end(packet),
            Command::Reset => {
                log::info!("Adapter reset by console");
                self.end_session();
                Ok(Handled {
                    reply: Some(Packet::empty(command)),
                    mode_32bit: Some(false),
                })
            }
            Command::TelephoneStatus => {
                let flags = if config.unmetered { STATUS_UNMETERED } else { 0x00 };
                Ok(Handled::reply(Packet::new(
                    command,
                    &[self.state.status_byte(), STATUS_SERVICE, flags],
                )))
            }
            Command::Sio32Mode => match data {
                [mode @ (0 | 1)] => Ok(Handled {
                    reply: Some(*packet),
                    mode_32bit: Some(*mode == 1),
                }),
                _ => Err(CommandError::InvalidContents),
            },
            Command::ReadConfigurationData => self.read_config(data),
            Command::WriteConfigurationData => self.write_config(data),
            Command::IspLogin => self.isp_login(data),
            Command::IspLogout => self.isp_logout(packet),
            Command::OpenTcpConnection => self.open_connection(command, SocketKind::Tcp, data),
            Command::OpenUdpConnection => self.open_connection(command, SocketKind::Udp, data),
            Command::CloseTcpConnection => self.close_connection(packet, SocketKind::Tcp),
            Command::CloseUdpConnection => self.close_connection(packet, SocketKind::Udp),
            Command::DnsQuery => self.dns_query(data),
            Command::FirmwareVersion => Ok(Handled::reply(Packet::new(
                command,
                env!("CARGO_PKG_VERSION").as_bytes(),
            ))),
            Command::Error => Err(CommandError::InvalidContents),
        };

        Ok(result.unwrap_or_else(|e| {
            log::debug!("{} rejected: {}", command, e);
            Handled::reply(Packet::error(command, e.code()))
        }))
    }

    /// Fold the result of a deferred operation into the state and build its reply
    pub(crate) fn complete(&mut self, command: Command, outcome: &Outcome) -> Option<Packet> {
        let reply = match *outcome {
            Outcome::Closed { .. } => return None,

            Outcome::Connected { conn } => match command {
                Command::DialTelephone => {
                    log::info!("Call connected");
                    self.slots[conn] = Slot::Open(SocketKind::Tcp);
                    self.start_call(Line::Peer);
                    Packet::empty(command)
                }
                Command::OpenTcpConnection | Command::OpenUdpConnection => {
                    let kind = if command == Command::OpenTcpConnection {
                        SocketKind::Tcp
                    } else {
                        SocketKind::Udp
                    };
                    self.slots[conn] = Slot::Open(kind);
                    if self.state != ConnectionState::Internet {
                        self.internet_from = self.state;
                        self.state = ConnectionState::Internet;
                    }
                    Packet::new(command, &[conn as u8])
                }
                _ => return None,
            },

            Outcome::ConnectFailed { conn, .. } | Outcome::OpenFailed { conn, .. } => {
                if self.slots[conn] == Slot::Opening {
                    self.slots[conn] = Slot::Free;
                }
                Packet::error(command, CommandError::Unavailable.code())
            }

            Outcome::NoCaller => {
                self.slots[PEER_SLOT] = Slot::Listening;
                Packet::error(command, CommandError::NoCall.code())
            }

            Outcome::Accepted => {
                log::info!("Incoming call connected");
                self.slots[PEER_SLOT] = Slot::Open(SocketKind::Tcp);
                self.start_call(Line::Peer);
                Packet::empty(command)
            }

            Outcome::ListenFailed { .. } => {
                self.slots[PEER_SLOT] = Slot::Free;
                Packet::error(command, CommandError::Unavailable.code())
            }

            Outcome::Transferred { conn, ref received } => {
                let id = if self.state == ConnectionState::Call {
                    self.call_packets_sent = self.call_packets_sent.saturating_add(1);
                    CALL_CONNECTION_ID
                } else {
                    conn as u8
                };
                let mut reply = Packet::new(command, &[id]);
                reply.data.extend(received.as_slice());
                reply
            }

            Outcome::PeerClosed { conn } => {
                let id = if self.state == ConnectionState::Call {
                    log::info!("Call ended by peer");
                    self.close_all();
                    self.state = ConnectionState::Disconnected;
                    self.line = Line::Idle;
                    CALL_CONNECTION_ID
                } else {
                    self.close_slot(conn);
                    conn as u8
                };
                Packet::new(Command::TransferDataEnd, &[id])
            }

            Outcome::Resolved(ip) => Packet::new(command, &ip.octets()),
            Outcome::NotResolved => Packet::error(command, CommandError::InvalidContents.code()),

            Outcome::ConfigRead { offset, ref data } => {
                let mut reply = Packet::new(command, &[offset as u8]);
                reply.data.extend(data.as_slice());
                reply
            }
            Outcome::ConfigWritten { offset, size } => {
                Packet::new(command, &[offset as u8, size as u8])
            }
            Outcome::StorageFailed(_) => Packet::error(command, CommandError::Internal.code()),
        };
        Some(reply)
    }

    fn begin_session(&mut self, packet: &Packet) -> Result<Handled> {
        if self.session_begun {
            return Err(CommandError::InvalidState);
        }
        let data = packet.data();
        if !data.is_empty() && data != SESSION_MAGIC {
            return Err(CommandError::InvalidContents);
        }
        self.clear();
        self.session_begun = true;
        log::info!("Session started");
        Ok(Handled::reply(*packet))
    }

    fn start_call(&mut self, line: Line) {
        self.state = ConnectionState::Call;
        self.line = line;
        self.call_packets_sent = 0;
    }

    fn dial(&mut self, data: &[u8], config: &AdapterConfig) -> Result<Handled> {
        if self.state != ConnectionState::Disconnected {
            return Err(CommandError::InvalidState);
        }
        // protocol byte, then at least one digit
        let Some((_protocol, number)) = data.split_first().filter(|(_, n)| !n.is_empty()) else {
            return Err(CommandError::InvalidContents);
        };

        if ISP_NUMBERS.iter().any(|isp| isp.as_bytes() == number) {
            log::info!("Dialed provider {}", String::from_utf8_lossy(number));
            self.start_call(Line::Isp);
            return Ok(Handled::reply(Packet::empty(Command::DialTelephone)));
        }

        let ip = parse_peer_number(number).ok_or(CommandError::Unavailable)?;
        let addr = SocketAddrV4::new(ip, config.p2p_port);
        log::info!("Dialing {}", addr);
        self.slots[PEER_SLOT] = Slot::Opening;
        self.defer(Command::DialTelephone, Operation::Dial { addr });
        Ok(Handled::deferred())
    }

    fn hang_up(&mut self) -> Result<Handled> {
        if self.state == ConnectionState::Disconnected {
            return Err(CommandError::InvalidState);
        }
        log::info!("Hung up");
        self.close_all();
        self.state = ConnectionState::Disconnected;
        self.line = Line::Idle;
        Ok(Handled::reply(Packet::empty(Command::HangUpTelephone)))
    }

    fn wait_for_call(&mut self, config: &AdapterConfig) -> Result<Handled> {
        if self.state != ConnectionState::Disconnected {
            return Err(CommandError::InvalidState);
        }
        let listening = self.slots[PEER_SLOT] == Slot::Listening;
        if !listening {
            self.slots[PEER_SLOT] = Slot::Opening;
        }
        self.defer(
            Command::WaitForTelephoneCall,
            Operation::WaitForCall {
                port: config.p2p_port,
                listening,
            },
        );
        Ok(Handled::deferred())
    }

    fn transfer_data(&mut self, data: &[u8]) -> Result<Handled> {
        let Some((&id, outbound)) = data.split_first() else {
            return Err(CommandError::InvalidContents);
        };
        let outbound = Payload::from_slice(outbound);

        let (conn, receive) = match self.state {
            ConnectionState::Call if self.line == Line::Peer => {
                (PEER_SLOT, self.call_packets_sent >= CALL_HANDSHAKE_PACKETS)
            }
            ConnectionState::Internet => {
                let conn = id as usize;
                if !matches!(self.slots.get(conn), Some(Slot::Open(_))) {
                    return Err(CommandError::InvalidState);
                }
                (conn, true)
            }
            _ => return Err(CommandError::InvalidState),
        };

        if outbound.is_empty() && !receive {
            self.call_packets_sent += 1;
            return Ok(Handled::reply(Packet::new(
                Command::TransferData,
                &[CALL_CONNECTION_ID],
            )));
        }

        self.defer(
            Command::TransferData,
            Operation::Transfer {
                conn,
                outbound,
                receive,
            },
        );
        Ok(Handled::deferred())
    }

    fn transfer_data_end(&mut self, packet: &Packet) -> Result<Handled> {
        let [id] = packet.data() else {
            return Err(CommandError::InvalidContents);
        };
        match self.state {
            ConnectionState::Call if self.line == Line::Peer && *id == CALL_CONNECTION_ID => {
                self.close_all();
                self.state = ConnectionState::Disconnected;
                self.line = Line::Idle;
            }
            ConnectionState::Internet
                if matches!(self.slots.get(*id as usize), Some(Slot::Open(_))) =>
            {
                self.close_slot(*id as usize);
            }
            _ => return Err(CommandError::InvalidState),
        }
        Ok(Handled::reply(*packet))
    }

    fn read_config(&mut self, data: &[u8]) -> Result<Handled> {
        let &[offset, size] = data else {
            return Err(CommandError::InvalidContents);
        };
        let (offset, size) = (offset as usize, size as usize);
        if size > CONFIG_TRANSFER_MAX || offset + size > CONFIG_SIZE {
            return Err(CommandError::InvalidContents);
        }
        self.defer(
            Command::ReadConfigurationData,
            Operation::ReadConfig { offset, size },
        );
        Ok(Handled::deferred())
    }

    fn write_config(&mut self, data: &[u8]) -> Result<Handled> {
        let Some((&offset, bytes)) = data.split_first() else {
            return Err(CommandError::InvalidContents);
        };
        let offset = offset as usize;
        if bytes.len() > CONFIG_TRANSFER_MAX || offset + bytes.len() > CONFIG_SIZE {
            return Err(CommandError::InvalidContents);
        }
        self.defer(
            Command::WriteConfigurationData,
            Operation::WriteConfig {
                offset,
                data: Payload::from_slice(bytes),
            },
        );
        Ok(Handled::deferred())
    }

    fn isp_login(&mut self, data: &[u8]) -> Result<Handled> {
        if self.state != ConnectionState::Call || self.line != Line::Isp {
            return Err(CommandError::InvalidState);
        }
        let (dns1, dns2) = parse_login(data).ok_or(CommandError::InvalidContents)?;
        if !dns1.is_unspecified() {
            self.dns1 = dns1;
        }
        if !dns2.is_unspecified() {
            self.dns2 = dns2;
        }
        self.line = Line::IspLoggedIn;
        log::info!("Logged in to provider (dns {} / {})", self.dns1, self.dns2);

        let mut reply = Packet::new(Command::IspLogin, &ISP_LOCAL_ADDRESS.octets());
        reply.data.extend(&self.dns1.octets());
        reply.data.extend(&self.dns2.octets());
        Ok(Handled::reply(reply))
    }

    fn isp_logout(&mut self, packet: &Packet) -> Result<Handled> {
        if self.line != Line::IspLoggedIn {
            return Err(CommandError::InvalidState);
        }
        for slot in self.slots.iter_mut() {
            if matches!(slot, Slot::Open(_) | Slot::Opening) {
                *slot = Slot::Free;
            }
        }
        self.state = ConnectionState::Call;
        self.line = Line::Isp;
        log::info!("Logged out from provider");
        Ok(Handled::reply(*packet))
    }

    fn open_connection(
        &mut self,
        command: Command,
        kind: SocketKind,
        data: &[u8],
    ) -> Result<Handled> {
        if self.state == ConnectionState::Call && self.line != Line::IspLoggedIn {
            return Err(CommandError::InvalidState);
        }
        let &[a, b, c, d, port_hi, port_lo] = data else {
            return Err(CommandError::InvalidContents);
        };
        let addr = SocketAddrV4::new(
            Ipv4Addr::new(a, b, c, d),
            u16::from_be_bytes([port_hi, port_lo]),
        );

        let conn = self
            .slots
            .iter()
            .position(|s| *s == Slot::Free)
            .ok_or(CommandError::Unavailable)?;
        log::info!("Opening {:?} connection {} to {}", kind, conn, addr);
        self.slots[conn] = Slot::Opening;
        self.defer(command, Operation::Open { conn, kind, addr });
        Ok(Handled::deferred())
    }

    fn close_connection(&mut self, packet: &Packet, kind: SocketKind) -> Result<Handled> {
        let [id] = packet.data() else {
            return Err(CommandError::InvalidContents);
        };
        let conn = *id as usize;
        if self.state != ConnectionState::Internet
            || conn >= MAX_CONNECTIONS
            || self.slots[conn] != Slot::Open(kind)
        {
            return Err(CommandError::InvalidState);
        }
        log::info!("Closing connection {}", conn);
        self.close_slot(conn);
        Ok(Handled::reply(*packet))
    }

    fn dns_query(&mut self, data: &[u8]) -> Result<Handled> {
        if data.is_empty() {
            return Err(CommandError::InvalidContents);
        }
        self.defer(
            Command::DnsQuery,
            Operation::Resolve {
                host: Payload::from_slice(data),
                dns1: self.dns1,
                dns2: self.dns2,
            },
        );
        Ok(Handled::deferred())
    }
}

/// `id_len id pass_len pass dns1[4] dns2[4]`
fn parse_login(data: &[u8]) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let (&id_len, rest) = data.split_first()?;
    let rest = rest.get(id_len as usize..)?;
    let (&pass_len, rest) = rest.split_first()?;
    let rest = rest.get(pass_len as usize..)?;
    let dns: [u8; 8] = rest.try_into().ok()?;
    Some((
        Ipv4Addr::new(dns[0], dns[1], dns[2], dns[3]),
        Ipv4Addr::new(dns[4], dns[5], dns[6], dns[7]),
    ))
}
