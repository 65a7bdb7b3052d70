use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::link::{BgbLink, LinkHandler};
use super::{BgbError, Result, CLOCK_HZ};
use crate::action::{ActionKind, Job};
use crate::adapter::{Adapter, AdapterConfig};
use crate::board::{Backend, Board, Timer};

/// How often the worker looks for timeouts when nothing wakes it
const WORKER_POLL: Duration = Duration::from_millis(100);

/// Emulator timestamp shared between the link task and the adapter's board
#[derive(Debug, Clone, Default)]
pub struct EmulatorTime(Arc<AtomicU32>);

impl EmulatorTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, timestamp: u32) {
        self.0.store(timestamp, Ordering::Release);
    }

    pub fn now(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// Board whose clock is the emulated console's, so pausing the emulator pauses
/// every adapter timeout with it
#[derive(Debug, Clone)]
pub struct BgbClock {
    time: EmulatorTime,
    latches: [u32; Timer::COUNT],
}

impl BgbClock {
    pub fn new(time: EmulatorTime) -> Self {
        Self {
            time,
            latches: [0; Timer::COUNT],
        }
    }
}

impl Board for BgbClock {
    fn time_latch(&mut self, timer: Timer) {
        self.latches[timer.index()] = self.time.now();
    }

    fn time_check_ms(&self, timer: Timer, ms: u32) -> bool {
        let elapsed = self.time.now().wrapping_sub(self.latches[timer.index()]) & 0x7FFF_FFFF;
        elapsed as u64 > ms as u64 * CLOCK_HZ / 1000
    }
}

pub type SharedAdapter = Arc<Mutex<Adapter<BgbClock>>>;

fn lock(adapter: &SharedAdapter) -> MutexGuard<'_, Adapter<BgbClock>> {
    adapter.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Emulator-facing half: runs inside the link task
struct LinkSide {
    adapter: SharedAdapter,
    time: EmulatorTime,
    wake: SyncSender<()>,
}

impl LinkSide {
    fn wake_if_pending(&self, adapter: &Adapter<BgbClock>) {
        // Framing over the emulator link cannot drift, so serial resets are never needed
        let pending = adapter
            .pending_action()
            .is_some_and(|kind| kind != ActionKind::ResetSerial);
        if pending {
            let _ = self.wake.try_send(());
        }
    }
}

impl LinkHandler for LinkSide {
    fn transfer(&mut self, byte: u8, timestamp: u32) -> u8 {
        self.time.set(timestamp);
        let mut adapter = lock(&self.adapter);
        let out = adapter.transfer(byte);
        self.wake_if_pending(&adapter);
        out
    }

    fn sync_time(&mut self, timestamp: u32) {
        self.time.set(timestamp);
        let adapter = lock(&self.adapter);
        self.wake_if_pending(&adapter);
    }
}

/// Adapter attached to an emulator, with its own thread for blocking actions
pub struct BgbBridge {
    adapter: SharedAdapter,
    time: EmulatorTime,
    wake: SyncSender<()>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl BgbBridge {
    /// Create the adapter and start its action worker
    pub fn start<K>(config: AdapterConfig, backend: K) -> Result<Self>
    where
        K: Backend + Send + 'static,
    {
        let time = EmulatorTime::new();
        let adapter = Arc::new(Mutex::new(Adapter::new(BgbClock::new(time.clone()), config)));
        let (wake, wake_rx) = mpsc::sync_channel(1);
        let stop = Arc::new(AtomicBool::new(false));

        let worker = std::thread::Builder::new()
            .name("adapter-actions".into())
            .spawn({
                let adapter = adapter.clone();
                let stop = stop.clone();
                move || action_worker(adapter, backend, wake_rx, stop)
            })?;

        Ok(Self {
            adapter,
            time,
            wake,
            stop,
            worker: Some(worker),
        })
    }

    pub fn adapter(&self) -> SharedAdapter {
        self.adapter.clone()
    }

    pub fn time(&self) -> &EmulatorTime {
        &self.time
    }

    /// Connect to an emulator listening for link cables and serve it
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| BgbError::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?;
        stream.set_nodelay(true)?;
        log::info!("Connected to emulator at {}:{}", host, port);
        self.serve(stream).await
    }

    /// Serve one link connection until the emulator leaves
    pub async fn serve<S>(&mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut side = LinkSide {
            adapter: self.adapter.clone(),
            time: self.time.clone(),
            wake: self.wake.clone(),
        };
        BgbLink::new(stream).run(&mut side).await
    }

    /// Stop the worker and wait for it. Unfinished actions are dropped.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.wake.try_send(());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Action worker panicked");
            }
        }
    }
}

impl Drop for BgbBridge {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn action_worker<K: Backend>(
    adapter: SharedAdapter,
    mut backend: K,
    wake: Receiver<()>,
    stop: Arc<AtomicBool>,
) {
    log::debug!("Action worker started");
    while !stop.load(Ordering::Acquire) {
        match wake.recv_timeout(WORKER_POLL) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        while let Some(job) = next_job(&adapter) {
            let kind = job.kind();
            let done = job.run(&mut backend);
            if let Err(e) = lock(&adapter).finish_action(done) {
                log::error!("{:?} failed: {}", kind, e);
            }
            if stop.load(Ordering::Acquire) {
                break;
            }
        }
    }
    log::debug!("Action worker stopped");
}

/// Claim the next runnable job, holding the adapter only briefly
fn next_job(adapter: &SharedAdapter) -> Option<Job> {
    let mut adapter = lock(adapter);
    let kind = adapter.pending_action()?;
    if kind == ActionKind::ResetSerial {
        return None;
    }
    adapter.begin_action(kind)
}
