//! DoCAN transport: command execution over ISO 15765-2.
//!
//! One `UdsTransport` owns a logical diagnostic session for a (SA, TA)
//! address pair on a shared channel. Commands run either synchronously on
//! the caller thread (`execute_wait`) or through a bounded FIFO queue
//! drained by a dedicated tx worker. Reception is fed by the channel's
//! receive loop through a bounded per-session queue registered under the
//! session's own source address.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::channel::CanChannel;
use crate::config::DiagConfig;
use crate::error::{DiagError, DiagResult};
use crate::frame::{self, CanFrame};
use crate::isotp::{self, FcStatus, Reassembler, RxState};
use crate::uds::{SharedCommand, UdsCommand};

/// Per-frame write timeout.
const WRITE_TIMEOUT_MS: u32 = 100;
/// First wait for a flow control frame after writing an FF.
const FC_INITIAL_WAIT: Duration = Duration::from_millis(100);
/// Re-armed wait when the target signalled it will issue another FC.
const FC_REARM_WAIT: Duration = Duration::from_secs(1);
/// Depth of the inbound frame queue and the outbound command queue.
const QUEUE_DEPTH: usize = 16;
/// Poll interval of the tx worker between queue checks.
const WORKER_POLL: Duration = Duration::from_millis(200);

/// Counts commands handed to the worker; `wait_idle` is the join barrier
/// behind `wait_queue_complete`.
struct TaskGauge {
    pending: Mutex<usize>,
    idle: Condvar,
}

impl TaskGauge {
    fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn add(&self) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }

    fn done(&self) {
        let mut n = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *n = n.saturating_sub(1);
        if *n == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut n = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        while *n > 0 {
            n = self.idle.wait(n).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Send/receive engine shared between the caller thread and the tx worker.
struct SessionCore {
    sa: u8,
    ta: u8,
    channel: Arc<CanChannel>,
    rx: Mutex<Receiver<CanFrame>>,
}

impl SessionCore {
    fn request_id(&self) -> u32 {
        frame::encode_id(self.ta, self.sa)
    }

    fn run_command(&self, cmd: &SharedCommand) -> DiagResult<()> {
        let mut cmd = cmd.lock().unwrap_or_else(|e| e.into_inner());
        self.run_locked(&mut *cmd)
    }

    fn run_locked(&self, cmd: &mut dyn UdsCommand) -> DiagResult<()> {
        cmd.prepare()?;
        let frames = isotp::packetize(cmd.tx_data(), self.channel.is_fd())?;

        // Holding the inbound queue across send and receive keeps one
        // command's FC rendezvous from consuming another command's frames.
        let rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());

        self.send_frames(&rx, &frames)?;

        if cmd.timeout().is_zero() {
            debug!("{} expects no response", cmd.describe());
            return Ok(());
        }

        self.receive_into(&rx, cmd)?;
        cmd.validate()?;
        cmd.dispatch()
    }

    /// Write the ordered frames of one request. A single frame completes
    /// immediately; a first frame blocks on the FC rendezvous before the
    /// consecutive frames go out, paced by the received STmin.
    fn send_frames(&self, rx: &Receiver<CanFrame>, frames: &[Vec<u8>]) -> DiagResult<()> {
        let fd = self.channel.is_fd();
        let mut stmin: u8 = 0;
        for data in frames {
            let pci = data[0] & 0xF0;
            if pci == 0x20 && (1..0x80).contains(&stmin) {
                // STmin is advisory at millisecond granularity; the
                // microsecond encodings (0xF1..0xF9) are not honored.
                std::thread::sleep(Duration::from_millis(stmin as u64));
            }
            let can = CanFrame::new(self.request_id(), data.clone(), fd);
            self.channel.write(&can, WRITE_TIMEOUT_MS)?;
            match pci {
                0x00 => break,
                0x10 => stmin = self.wait_flow_control(rx)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Block until the target answers the FF with a usable flow control.
    /// An STmin of zero means the target will issue another FC when ready,
    /// as does an explicit Wait flag; both re-arm with a longer timeout.
    fn wait_flow_control(&self, rx: &Receiver<CanFrame>) -> DiagResult<u8> {
        let mut wait = FC_INITIAL_WAIT;
        loop {
            let frame = rx
                .recv_timeout(wait)
                .map_err(|_| DiagError::protocol("FC wait timeout"))?;
            match isotp::parse_flow_control(&frame.data)? {
                FcStatus::ContinueToSend(stmin) => {
                    if frame.data[1] != 0 {
                        // Known limitation: BlockSize tracking is not
                        // implemented, all CFs are sent in one run.
                        warn!("FC BlockSize {} ignored", frame.data[1]);
                    }
                    if stmin == 0 {
                        wait = FC_REARM_WAIT;
                        continue;
                    }
                    return Ok(stmin);
                }
                FcStatus::Wait => {
                    wait = FC_REARM_WAIT;
                    continue;
                }
                FcStatus::Overflow => return Err(DiagError::TargetOverflow),
            }
        }
    }

    /// Drive the reassembly machine until the response is complete. Every
    /// queue wait uses the command budget; mid-reassembly the cumulative
    /// clock is re-checked after each consecutive frame, and a Wait from
    /// the sender restarts it.
    fn receive_into(&self, rx: &Receiver<CanFrame>, cmd: &mut dyn UdsCommand) -> DiagResult<()> {
        let budget = cmd.timeout();
        let mut start = Instant::now();
        let mut machine = Reassembler::new();
        loop {
            let frame = rx.recv_timeout(budget).map_err(|_| {
                error!("SA:0x{:02X} rx timeout {:?}", self.sa, budget);
                DiagError::RxTimeout(budget)
            })?;
            if frame.data.is_empty() {
                continue;
            }
            let (state, chunk) = machine.absorb(&frame.data)?;
            cmd.extend_rx(&chunk);
            match state {
                RxState::Done => return Ok(()),
                RxState::First => self.send_flow_control()?,
                RxState::Overflow => {
                    error!("target rx overflow");
                    return Err(DiagError::TargetOverflow);
                }
                RxState::Wait => start = Instant::now(),
                RxState::Consecutive | RxState::Idle => {
                    if start.elapsed() > budget {
                        error!("SA:0x{:02X} rx timeout during CF", self.sa);
                        return Err(DiagError::RxTimeout(budget));
                    }
                }
            }
        }
    }

    /// Answer a first frame: ContinueToSend, no BlockSize restriction,
    /// STmin 2 ms.
    fn send_flow_control(&self) -> DiagResult<()> {
        let fc = CanFrame::new(
            self.request_id(),
            isotp::flow_control_frame(),
            self.channel.is_fd(),
        );
        self.channel.write(&fc, WRITE_TIMEOUT_MS)
    }

    /// Headerless request/response for callers that bypass command
    /// objects: send raw UDS bytes, return whatever reassembles.
    fn send_receive(&self, payload: &[u8], timeout: Duration) -> DiagResult<Vec<u8>> {
        let frames = isotp::packetize(payload, self.channel.is_fd())?;
        let rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        self.send_frames(&rx, &frames)?;
        if timeout.is_zero() {
            return Ok(Vec::new());
        }

        let mut start = Instant::now();
        let mut machine = Reassembler::new();
        let mut out = Vec::new();
        loop {
            let frame = rx
                .recv_timeout(timeout)
                .map_err(|_| DiagError::RxTimeout(timeout))?;
            if frame.data.is_empty() {
                continue;
            }
            let (state, chunk) = machine.absorb(&frame.data)?;
            out.extend_from_slice(&chunk);
            match state {
                RxState::Done => return Ok(out),
                RxState::First => self.send_flow_control()?,
                RxState::Overflow => return Err(DiagError::TargetOverflow),
                RxState::Wait => start = Instant::now(),
                RxState::Consecutive | RxState::Idle => {
                    if start.elapsed() > timeout {
                        return Err(DiagError::RxTimeout(timeout));
                    }
                }
            }
        }
    }
}

struct Worker {
    queue: SyncSender<SharedCommand>,
    gauge: Arc<TaskGauge>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// UDS-over-CAN command processor for one (source, target) address pair.
pub struct UdsTransport {
    core: Arc<SessionCore>,
    commands: Mutex<Vec<(String, SharedCommand)>>,
    worker: Option<Worker>,
}

impl UdsTransport {
    /// Synchronous transport: commands run on the caller thread.
    pub fn new(cfg: &DiagConfig, channel: Arc<CanChannel>) -> Self {
        Self::build(cfg, channel, false)
    }

    /// Asynchronous transport: commands are queued and drained FIFO by a
    /// dedicated tx worker thread.
    pub fn with_worker(cfg: &DiagConfig, channel: Arc<CanChannel>) -> Self {
        Self::build(cfg, channel, true)
    }

    fn build(cfg: &DiagConfig, channel: Arc<CanChannel>, spawn_worker: bool) -> Self {
        let (sink, rx) = mpsc::sync_channel(QUEUE_DEPTH);
        // Responses from the target arrive with our SA in the TA byte
        channel.register_rx(cfg.source_address, sink);

        let core = Arc::new(SessionCore {
            sa: cfg.source_address,
            ta: cfg.target_address,
            channel,
            rx: Mutex::new(rx),
        });

        let worker = spawn_worker.then(|| Self::spawn_worker(Arc::clone(&core)));
        Self {
            core,
            commands: Mutex::new(Vec::new()),
            worker,
        }
    }

    fn spawn_worker(core: Arc<SessionCore>) -> Worker {
        let (queue, jobs) = mpsc::sync_channel::<SharedCommand>(QUEUE_DEPTH);
        let gauge = Arc::new(TaskGauge::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_gauge = Arc::clone(&gauge);
        let worker_stop = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name("uds-tx-worker".into())
            .spawn(move || {
                loop {
                    if worker_stop.load(Ordering::SeqCst) {
                        // Drain without executing so waiters unblock
                        while jobs.try_recv().is_ok() {
                            worker_gauge.done();
                        }
                        debug!("tx worker terminated");
                        break;
                    }
                    match jobs.recv_timeout(WORKER_POLL) {
                        Ok(cmd) => {
                            if !worker_stop.load(Ordering::SeqCst) {
                                if let Err(e) = core.run_command(&cmd) {
                                    let label =
                                        cmd.lock().unwrap_or_else(|p| p.into_inner()).describe();
                                    error!("{} failed: {}", label, e);
                                }
                            }
                            worker_gauge.done();
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("tx worker spawn");

        Worker {
            queue,
            gauge,
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn source_address(&self) -> u8 {
        self.core.sa
    }

    pub fn target_address(&self) -> u8 {
        self.core.ta
    }

    /// Register a command under a caller-chosen key. Keys are unique and
    /// iteration order is insertion order.
    pub fn add_command(&self, key: impl Into<String>, cmd: SharedCommand) -> DiagResult<()> {
        let key = key.into();
        let mut commands = self.commands.lock().unwrap_or_else(|e| e.into_inner());
        if commands.iter().any(|(k, _)| *k == key) {
            return Err(DiagError::invalid(format!(
                "command key '{}' already assigned",
                key
            )));
        }
        commands.push((key, cmd));
        Ok(())
    }

    pub fn clear_commands(&self) {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Registered keys in insertion order.
    pub fn command_keys(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Execute a dictionary entry by key: queued in async mode, run to
    /// completion in sync mode.
    pub fn execute_key(&self, key: &str) -> DiagResult<bool> {
        let cmd = {
            let commands = self.commands.lock().unwrap_or_else(|e| e.into_inner());
            commands
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, c)| Arc::clone(c))
                .ok_or_else(|| DiagError::invalid(format!("unknown command key '{}'", key)))?
        };
        self.execute(&cmd)
    }

    /// Execute a command object. In async mode the command is enqueued and
    /// `Ok(true)` means accepted; saturation surfaces as `QueueFull`
    /// without losing the command already queued.
    pub fn execute(&self, cmd: &SharedCommand) -> DiagResult<bool> {
        match &self.worker {
            Some(worker) => {
                worker.gauge.add();
                match worker.queue.try_send(Arc::clone(cmd)) {
                    Ok(()) => Ok(true),
                    Err(TrySendError::Full(_)) => {
                        worker.gauge.done();
                        Err(DiagError::QueueFull)
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        worker.gauge.done();
                        Err(DiagError::ChannelIo("tx worker gone".into()))
                    }
                }
            }
            None => Ok(self.execute_wait(cmd)),
        }
    }

    /// Synchronous execution: send, receive, validate, dispatch. Returns
    /// true only when validation succeeded and the callback (if any)
    /// completed cleanly; every failure is logged against the command.
    pub fn execute_wait(&self, cmd: &SharedCommand) -> bool {
        match self.core.run_command(cmd) {
            Ok(()) => true,
            Err(e) => {
                let label = cmd.lock().unwrap_or_else(|p| p.into_inner()).describe();
                match e {
                    DiagError::Callback(msg) => error!("{} callback error: {}", label, msg),
                    other => error!("{} failed: {}", label, other),
                }
                false
            }
        }
    }

    /// Block until the tx worker has drained every queued command.
    pub fn wait_queue_complete(&self) {
        if let Some(worker) = &self.worker {
            worker.gauge.wait_idle();
        }
    }

    /// Raw request/response without a command object.
    pub fn send_receive(&self, payload: &[u8], timeout: Duration) -> DiagResult<Vec<u8>> {
        self.core.send_receive(payload, timeout)
    }

    /// Fire a frame at an arbitrary 29-bit identifier, outside the DoCAN
    /// session addressing.
    pub fn send_raw_id(&self, can_id: u32, data: Vec<u8>) -> DiagResult<()> {
        let frame = CanFrame::new(can_id, data, self.core.channel.is_fd());
        self.core.channel.write(&frame, WRITE_TIMEOUT_MS)
    }

    /// Wait for the next raw frame addressed to this session.
    pub fn peek_frame(&self, timeout: Duration) -> DiagResult<CanFrame> {
        let rx = self.core.rx.lock().unwrap_or_else(|e| e.into_inner());
        rx.recv_timeout(timeout)
            .map_err(|_| DiagError::RxTimeout(timeout))
    }

    /// Global cancellation: abort the channel receive loop, stop the tx
    /// worker and forget the command dictionary. In-flight work is not
    /// interrupted mid-frame; queued work is discarded.
    pub fn dispose(&self) {
        self.core.channel.abort();
        if let Some(worker) = &self.worker {
            worker.shutdown.store(true, Ordering::SeqCst);
        }
        self.clear_commands();
        debug!("transport SA:0x{:02X} disposed", self.core.sa);
    }
}

impl Drop for UdsTransport {
    fn drop(&mut self) {
        if let Some(worker) = &mut self.worker {
            worker.shutdown.store(true, Ordering::SeqCst);
            if let Some(handle) = worker.thread.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_gauge_barrier() {
        let gauge = Arc::new(TaskGauge::new());
        gauge.add();
        gauge.add();

        let g = Arc::clone(&gauge);
        let done = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            g.done();
            g.done();
        });

        gauge.wait_idle();
        done.join().unwrap();
        assert_eq!(*gauge.pending.lock().unwrap(), 0);
    }

    #[test]
    fn test_task_gauge_idle_without_work() {
        // Must not block when nothing was ever queued
        TaskGauge::new().wait_idle();
    }
}
