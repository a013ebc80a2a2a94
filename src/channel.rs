//! CAN channel adapter.
//!
//! Abstracts the vendor CAN interface behind the [`CanBus`] trait and runs
//! the asynchronous receive loop: frames are read on a dedicated thread and
//! demultiplexed to per-address sinks by the Target Address byte of the
//! 29-bit identifier. Transmission is synchronous under a channel-wide
//! exclusive lock, so only one write is ever in flight per channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::error::{DiagError, DiagResult};
use crate::frame::{self, CanFrame};

/// Read timeout used by the receive loop while the bus is quiet.
const IDLE_READ_TIMEOUT_MS: u32 = 2000;

/// Seam to the concrete CAN hardware (Kvaser, SocketCAN, simulator).
///
/// Implementations acquire the physical channel in their constructor and
/// surface [`DiagError::HardwareNotFound`] when no adapter is present.
/// `read` and `write` take `&self`; drivers that need internal state use
/// interior mutability so reception never contends with transmission.
pub trait CanBus: Send + Sync {
    /// True when the channel was opened in CAN-FD mode.
    fn is_fd(&self) -> bool;

    /// Blocking read. Returns `Ok(None)` when the timeout elapses without
    /// traffic.
    fn read(&self, timeout_ms: u32) -> DiagResult<Option<CanFrame>>;

    /// Blocking write with timeout.
    fn write(&self, frame: &CanFrame, timeout_ms: u32) -> DiagResult<()>;

    /// Install a hardware acceptance filter on the 29-bit id space.
    fn set_acceptance_filter(&self, code: u32, mask: u32) -> DiagResult<()>;

    /// Discard anything pending in the driver's rx/tx buffers.
    fn flush(&self) -> DiagResult<()>;
}

/// Channel adapter: write serialization plus the rx demultiplexer.
pub struct CanChannel {
    bus: Arc<dyn CanBus>,
    tx_lock: Mutex<()>,
    sinks: Mutex<HashMap<u8, SyncSender<CanFrame>>>,
    running: AtomicBool,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl CanChannel {
    /// Wrap a driver and install the DoCAN acceptance filter
    /// (`0x18DA_0000 / 0x1FFF_0000`, extended).
    pub fn new(bus: Arc<dyn CanBus>) -> DiagResult<Self> {
        bus.set_acceptance_filter(frame::FILTER_CODE, frame::FILTER_MASK)?;
        Ok(Self {
            bus,
            tx_lock: Mutex::new(()),
            sinks: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            rx_thread: Mutex::new(None),
        })
    }

    pub fn is_fd(&self) -> bool {
        self.bus.is_fd()
    }

    /// Bind a bounded sink to an 8-bit TA. The receive loop pushes every
    /// incoming frame whose `(id >> 8) & 0xFF` matches. First registration
    /// wins; re-registration of the same TA is ignored.
    pub fn register_rx(&self, ta: u8, sink: SyncSender<CanFrame>) {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks.entry(ta).or_insert(sink);
        debug!("rx sink registered for TA 0x{:02X}", ta);
    }

    /// Spawn the receive thread. Idempotent.
    pub fn start(self: &Arc<Self>) -> DiagResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let chan = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("can-rx".into())
            .spawn(move || chan.rx_loop())
            .map_err(|e| DiagError::ChannelIo(format!("rx thread spawn: {}", e)))?;
        *self.rx_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Transmit one frame. Serialized channel-wide so concurrent commands
    /// never interleave their writes.
    pub fn write(&self, frame: &CanFrame, timeout_ms: u32) -> DiagResult<()> {
        let _guard = self.tx_lock.lock().unwrap_or_else(|e| e.into_inner());
        debug!("TX 0x{:08X}: {:02X?}", frame.id, frame.data);
        self.bus.write(frame, timeout_ms)
    }

    /// Stop the receive loop and flush the driver buffers.
    pub fn abort(&self) {
        debug!("channel abort");
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.bus.flush() {
            warn!("flush on abort failed: {}", e);
        }
    }

    /// Join the receive thread after an abort. Used on orderly shutdown.
    pub fn join(&self) {
        let handle = self
            .rx_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn rx_loop(&self) {
        let mut timeout = IDLE_READ_TIMEOUT_MS;
        while self.running.load(Ordering::SeqCst) {
            match self.bus.read(timeout) {
                Ok(Some(mut frame)) => {
                    if frame.is_error() {
                        error!("rx error frame, flags 0x{:X}", frame.flags);
                        self.abort();
                        continue;
                    }
                    frame.timestamp = Some(Utc::now());
                    debug!("RX 0x{:08X}: {:02X?}", frame.id, frame.data);
                    self.route(frame);
                    // Drain any backlog before sleeping on the bus again
                    timeout = 0;
                }
                Ok(None) => timeout = IDLE_READ_TIMEOUT_MS,
                Err(e) => {
                    error!("rx loop read failure: {}", e);
                    self.running.store(false, Ordering::SeqCst);
                }
            }
        }
        debug!("can rx thread terminated");
    }

    fn route(&self, frame: CanFrame) {
        let ta = frame::target_of(frame.id);
        let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        match sinks.get(&ta) {
            Some(sink) => match sink.try_send(frame) {
                Ok(()) => {}
                // A full sink drops the frame; the receive loop must stay
                // live for the other registered addresses.
                Err(TrySendError::Full(f)) => {
                    error!("rx queue full for TA 0x{:02X}, frame 0x{:08X} dropped", ta, f.id);
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!("rx sink for TA 0x{:02X} disconnected", ta);
                }
            },
            None => {
                error!(
                    "unroutable rx frame id 0x{:08X} dlc {} data {:02X?}",
                    frame.id,
                    frame.data.len(),
                    frame.data
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::flags;
    use std::collections::VecDeque;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Minimal scripted bus: hands out queued frames, records writes.
    struct ScriptedBus {
        rx: Mutex<VecDeque<CanFrame>>,
        written: Mutex<Vec<CanFrame>>,
    }

    impl ScriptedBus {
        fn with_frames(frames: Vec<CanFrame>) -> Arc<Self> {
            Arc::new(Self {
                rx: Mutex::new(frames.into()),
                written: Mutex::new(Vec::new()),
            })
        }
    }

    impl CanBus for ScriptedBus {
        fn is_fd(&self) -> bool {
            false
        }

        fn read(&self, _timeout_ms: u32) -> DiagResult<Option<CanFrame>> {
            Ok(self.rx.lock().unwrap().pop_front())
        }

        fn write(&self, frame: &CanFrame, _timeout_ms: u32) -> DiagResult<()> {
            self.written.lock().unwrap().push(frame.clone());
            Ok(())
        }

        fn set_acceptance_filter(&self, _code: u32, _mask: u32) -> DiagResult<()> {
            Ok(())
        }

        fn flush(&self) -> DiagResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_demux_by_target_address() {
        let to_us = CanFrame::new(frame::encode_id(0x0A, 0x0B), vec![0x01], false);
        let to_other = CanFrame::new(frame::encode_id(0x55, 0x0B), vec![0x02], false);
        let bus = ScriptedBus::with_frames(vec![to_other, to_us]);
        let chan = Arc::new(CanChannel::new(bus).unwrap());

        let (tx, rx) = mpsc::sync_channel(16);
        chan.register_rx(0x0A, tx);
        chan.start().unwrap();

        let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.data, vec![0x01]);
        assert!(frame.timestamp.is_some());

        chan.abort();
        chan.join();
    }

    #[test]
    fn test_error_frame_aborts_loop() {
        let mut bad = CanFrame::new(frame::encode_id(0x0A, 0x0B), vec![], false);
        bad.flags |= flags::ERROR_FRAME;
        let good = CanFrame::new(frame::encode_id(0x0A, 0x0B), vec![0x01], false);
        let bus = ScriptedBus::with_frames(vec![bad, good]);
        let chan = Arc::new(CanChannel::new(bus).unwrap());

        let (tx, rx) = mpsc::sync_channel(16);
        chan.register_rx(0x0A, tx);
        chan.start().unwrap();
        chan.join();

        // The error frame killed the loop before the good frame was routed
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_sink_overflow_drops() {
        let frames: Vec<CanFrame> = (0..4)
            .map(|i| CanFrame::new(frame::encode_id(0x0A, 0x0B), vec![i], false))
            .collect();
        let bus = ScriptedBus::with_frames(frames);
        let chan = Arc::new(CanChannel::new(bus).unwrap());

        // Capacity 2: the last two frames must be dropped, not block the loop
        let (tx, rx) = mpsc::sync_channel(2);
        chan.register_rx(0x0A, tx);
        chan.start().unwrap();

        std::thread::sleep(Duration::from_millis(100));
        chan.abort();
        chan.join();

        let mut received = Vec::new();
        while let Ok(f) = rx.try_recv() {
            received.push(f.data[0]);
        }
        assert_eq!(received, vec![0, 1]);
    }
}
