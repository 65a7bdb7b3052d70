use serde::{Deserialize, Serialize};

use crate::action::{
    ActionKind, Completion, Job, Outcome, SERIAL_TIMEOUT_MS, SESSION_TIMEOUT_MS,
};
use crate::board::{Backend, BackendError, Board, Direction, Timer};
use crate::commands::{CommandState, ConnectionState, Slot, MAX_CONNECTIONS};
use crate::serial::{self, Handled, Packet, PacketHandler, SerialPhase, SerialState};

/// Default TCP port for console-to-console calls
pub const DEFAULT_P2P_PORT: u16 = 2415;

/// Which adapter model is emulated. Only the id byte differs on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdapterDevice {
    #[default]
    Blue,
    Yellow,
    Green,
    Red,
}

impl AdapterDevice {
    pub fn id(self) -> u8 {
        match self {
            AdapterDevice::Blue => 8,
            AdapterDevice::Yellow => 9,
            AdapterDevice::Green => 10,
            AdapterDevice::Red => 11,
        }
    }

    /// Every model but the Blue one validates the console's device byte
    pub fn checks_console(self) -> bool {
        self != AdapterDevice::Blue
    }
}

impl std::str::FromStr for AdapterDevice {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blue" => Ok(AdapterDevice::Blue),
            "yellow" => Ok(AdapterDevice::Yellow),
            "green" => Ok(AdapterDevice::Green),
            "red" => Ok(AdapterDevice::Red),
            other => Err(format!("unknown adapter device: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub device: AdapterDevice,
    pub p2p_port: u16,
    pub unmetered: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            device: AdapterDevice::Blue,
            p2p_port: DEFAULT_P2P_PORT,
            unmetered: false,
        }
    }
}

/// Backend failures the host has to hear about
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Configuration storage failed: {0}")]
    Storage(#[source] BackendError),

    #[error("Could not allocate socket for connection {conn}: {source}")]
    Socket {
        conn: usize,
        #[source]
        source: BackendError,
    },
}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// One emulated adapter.
///
/// Two entry points drive it. [`Adapter::transfer`] runs for every serial byte and
/// never blocks. [`Adapter::process_action`] (or the split
/// `begin_action`/`finish_action` pair) runs deferred work from a separate
/// context.
pub struct Adapter<B: Board> {
    board: B,
    config: AdapterConfig,
    serial: SerialState,
    commands: CommandState,
    live: [bool; MAX_CONNECTIONS],
    in_flight: bool,
}

/// Routes complete packets from the serial layer into the command layer
struct Dispatch<'a, B: Board> {
    commands: &'a mut CommandState,
    config: &'a AdapterConfig,
    board: &'a mut B,
    busy: bool,
}

impl<B: Board> PacketHandler for Dispatch<'_, B> {
    fn handle(&mut self, packet: &Packet) -> serial::Result<Handled> {
        self.board.debug_packet(Direction::Request, packet);
        let handled = self.commands.handle(packet, self.config, self.busy)?;
        if let Some(reply) = &handled.reply {
            self.board.debug_packet(Direction::Reply, reply);
        }
        Ok(handled)
    }

    fn abandon(&mut self) {
        self.commands.abandon();
    }
}

impl<B: Board> Adapter<B> {
    pub fn new(board: B, config: AdapterConfig) -> Self {
        log::info!(
            "Adapter {:?} ready (p2p port {}, unmetered {})",
            config.device,
            config.p2p_port,
            config.unmetered
        );
        Self {
            board,
            config,
            serial: SerialState::new(),
            commands: CommandState::new(),
            live: [false; MAX_CONNECTIONS],
            in_flight: false,
        }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn session_begun(&self) -> bool {
        self.commands.session_begun()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.commands.connection_state()
    }

    pub fn commands(&self) -> &CommandState {
        &self.commands
    }

    pub fn serial_phase(&self) -> SerialPhase {
        self.serial.phase()
    }

    pub fn mode_32bit(&self) -> bool {
        self.serial.mode_32bit()
    }

    /// Whether the backend still holds a socket for `conn`
    pub fn socket_live(&self, conn: usize) -> bool {
        self.live.get(conn).copied().unwrap_or(false)
    }

    /// Return to power-on state. Sockets still open get closed by a later action.
    pub fn reset(&mut self) {
        self.board.serial_disable();
        self.serial.reset();
        self.board.serial_enable();
        self.commands.end_session();
    }

    /// Exchange one byte with the console
    pub fn transfer(&mut self, byte: u8) -> u8 {
        self.board.time_latch(Timer::Serial);
        let device = self.config.device;
        let mut dispatch = Dispatch {
            commands: &mut self.commands,
            config: &self.config,
            board: &mut self.board,
            busy: self.in_flight,
        };
        self.serial.exchange(byte, device, &mut dispatch)
    }

    /// Next thing the action context should do, if anything. Only inspects state.
    pub fn pending_action(&self) -> Option<ActionKind> {
        if self.in_flight {
            return None;
        }
        if self.stale_sockets().iter().any(|&s| s) {
            return Some(ActionKind::CloseConnection);
        }
        if let Some(kind) = self.commands.queued_kind() {
            return Some(kind);
        }
        if self.commands.session_begun()
            && self.board.time_check_ms(Timer::Serial, SESSION_TIMEOUT_MS)
        {
            return Some(ActionKind::DropConnection);
        }
        if self.serial.mid_packet() && self.board.time_check_ms(Timer::Serial, SERIAL_TIMEOUT_MS) {
            return Some(ActionKind::ResetSerial);
        }
        None
    }

    /// Run one action to completion against `backend`
    pub fn process_action<K: Backend + ?Sized>(
        &mut self,
        kind: ActionKind,
        backend: &mut K,
    ) -> Result<()> {
        match self.begin_action(kind) {
            Some(job) => {
                let done = job.run(backend);
                self.finish_action(done)
            }
            None => Ok(()),
        }
    }

    /// Take the work for `kind` out of the adapter.
    ///
    /// State-only actions are applied here and return `None`. Otherwise the
    /// returned job must be run and its completion handed to `finish_action`;
    /// until then the adapter refuses new deferred commands.
    pub fn begin_action(&mut self, kind: ActionKind) -> Option<Job> {
        if self.in_flight {
            log::warn!("{:?} requested while another action is running", kind);
            return None;
        }

        let job = match kind {
            ActionKind::ResetSerial => {
                log::warn!("Serial link stalled mid-packet, resynchronising");
                self.board.serial_disable();
                self.serial.reset();
                self.board.serial_enable();
                return None;
            }
            ActionKind::DropConnection => {
                log::info!("Console went quiet, ending session");
                self.board.serial_disable();
                self.serial.reset();
                self.board.serial_enable();
                self.commands.end_session();
                Job::close(self.commands.generation(), self.live)
            }
            ActionKind::CloseConnection => {
                Job::close(self.commands.generation(), self.stale_sockets())
            }
            _ => {
                if self.commands.queued_kind() != Some(kind) {
                    return None;
                }
                let (command, op) = self.commands.take_queued()?;
                Job::new(self.commands.generation(), Some(command), op)
            }
        };

        self.in_flight = true;
        Some(job)
    }

    /// Hand back a finished job.
    ///
    /// Results of work abandoned in the meantime are dropped. Storage and socket
    /// allocation failures are reported after the console got its error reply.
    pub fn finish_action(&mut self, done: Completion) -> Result<()> {
        self.in_flight = false;
        self.track_sockets(&done.outcome);

        let Completion {
            generation,
            command,
            outcome,
        } = done;

        if let Some(command) = command {
            if generation != self.commands.generation() {
                log::debug!("Discarding stale {} result", command);
            } else if let Some(reply) = self.commands.complete(command, &outcome) {
                self.board.debug_packet(Direction::Reply, &reply);
                self.board.serial_disable();
                let delivered = self.serial.deliver(&reply);
                self.board.serial_enable();
                if !delivered {
                    log::debug!("Console no longer waiting for {} reply", command);
                }
            }
        }

        match outcome {
            Outcome::StorageFailed(source) => Err(AdapterError::Storage(source)),
            Outcome::OpenFailed { conn, error } => Err(AdapterError::Socket {
                conn,
                source: error,
            }),
            _ => Ok(()),
        }
    }

    /// Sockets the backend holds for slots the console already released
    fn stale_sockets(&self) -> [bool; MAX_CONNECTIONS] {
        let mut stale = [false; MAX_CONNECTIONS];
        for (conn, flag) in stale.iter_mut().enumerate() {
            *flag = self.live[conn] && self.commands.slot(conn) == Some(Slot::Free);
        }
        stale
    }

    fn track_sockets(&mut self, outcome: &Outcome) {
        match *outcome {
            Outcome::Closed { conns } => {
                for (live, closed) in self.live.iter_mut().zip(conns) {
                    if closed {
                        *live = false;
                    }
                }
            }
            Outcome::Connected { conn } => self.live[conn] = true,
            Outcome::ConnectFailed { conn, .. }
            | Outcome::OpenFailed { conn, .. }
            | Outcome::PeerClosed { conn } => self.live[conn] = false,
            Outcome::NoCaller | Outcome::Accepted => {
                self.live[crate::commands::PEER_SLOT] = true
            }
            Outcome::ListenFailed { .. } => self.live[crate::commands::PEER_SLOT] = false,
            _ => {}
        }
    }
}
