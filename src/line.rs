// SPDX-FileCopyrightText: 2025-2026 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! The PPM line driver.
//!
//! Owns the physical pulse channel and splits the work between two
//! contexts:
//!
//! - the foreground ([`PpmLine`]), which encodes and transmits frames and
//!   consumes decoded responses from a bounded queue, and
//! - the line-completion context ([`LineShared`]), invoked by the platform
//!   backend when a transmit or receive window finishes. It only signals
//!   the foreground, rotates the preallocated symbol buffers, and decodes
//!   into the queue. It never allocates and never logs on the happy path.
//!
//! The line is half duplex: a transmit tears down any armed receive, and
//! the transmit-done completion re-arms reception before anything else, so
//! the slave's reply (which starts on the slave's own schedule) is not
//! missed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;

use crate::codec::{
    encode_frame, words_to_bytes, EnterPattern, FrameTag, LineTiming, Pulse, RawFrame,
    SYMBOLS_PER_BYTE,
};
use crate::error::{Error, Result};

/// Capacity of the decoded-frame queue.
pub const RX_QUEUE_DEPTH: usize = 4;
/// Longest frame the receiver is sized for, in bytes. Acknowledge frames
/// are at most a leading pulse plus four words.
pub const DEFAULT_RX_DATA_LEN: usize = 10;
/// Capacity of one receive symbol buffer.
pub const RX_SYMBOL_CAPACITY: usize = DEFAULT_RX_DATA_LEN * SYMBOLS_PER_BYTE;

/// A preallocated capture buffer for received pulse symbols.
///
/// Exactly two of these exist per line; ownership moves between the spare
/// pool and the platform backend with every re-arm, so the buffer being
/// filled by the hardware is never touched by anyone else.
#[derive(Debug, Default)]
pub struct SymbolBuffer {
    symbols: heapless::Vec<Pulse, RX_SYMBOL_CAPACITY>,
}

impl SymbolBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.symbols.clear();
    }

    /// Appends a captured pulse; returns it back when the buffer is full.
    pub fn push(&mut self, pulse: Pulse) -> core::result::Result<(), Pulse> {
        self.symbols.push(pulse)
    }

    pub fn as_slice(&self) -> &[Pulse] {
        self.symbols.as_slice()
    }

    pub fn is_full(&self) -> bool {
        self.symbols.is_full()
    }
}

/// Directive returned to the platform backend: re-arm reception with this
/// buffer and acceptance window.
#[derive(Debug)]
pub struct RearmRx {
    pub buffer: SymbolBuffer,
    pub min_pulse_ns: u32,
    pub max_pulse_ns: u32,
}

/// The completion-context half of the line driver.
///
/// Platform backends receive an `Arc<LineShared>` through
/// [`PulseChannel::connect`] and call into it from their completion
/// handlers. All methods are non-blocking and allocation-free.
#[derive(Debug)]
pub struct LineShared {
    frames: SyncSender<RawFrame>,
    tx_done: SyncSender<()>,
    timing: Mutex<LineTiming>,
    spares: Mutex<heapless::Vec<SymbolBuffer, 2>>,
    dropped: AtomicU32,
}

impl LineShared {
    fn new(frames: SyncSender<RawFrame>, tx_done: SyncSender<()>) -> Self {
        let mut spares = heapless::Vec::new();
        let _ = spares.push(SymbolBuffer::new());
        let _ = spares.push(SymbolBuffer::new());
        LineShared {
            frames,
            tx_done,
            timing: Mutex::new(LineTiming::DEFAULT),
            spares: Mutex::new(spares),
            dropped: AtomicU32::new(0),
        }
    }

    /// Called by the backend when a transmit finishes.
    ///
    /// Wakes the foreground and hands out the receive re-arm directive,
    /// which the backend must apply before returning to other work.
    pub fn transmit_complete(&self) -> Option<RearmRx> {
        let _ = self.tx_done.try_send(());
        self.take_rearm()
    }

    /// Called by the backend when a receive window closes.
    ///
    /// `is_last` is set when the window closed on the idle timeout; only
    /// then is reception re-armed (partial captures keep the current
    /// buffer armed). The filled buffer is decoded and, on success, the
    /// frame is queued; a full queue drops the newest frame. Undecodable
    /// captures are discarded without note, the peer retries on its own
    /// cadence.
    pub fn receive_complete(&self, filled: SymbolBuffer, is_last: bool) -> Option<RearmRx> {
        let rearm = if is_last { self.take_rearm() } else { None };

        if let Ok(frame) = crate::codec::decode_symbols(filled.as_slice()) {
            if self.frames.try_send(frame).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.reclaim(filled);
        rearm
    }

    /// Returns a buffer to the spare pool, e.g. when a transmit cancels an
    /// armed receive.
    pub fn reclaim(&self, mut buffer: SymbolBuffer) {
        buffer.clear();
        let _ = self.spares.lock().unwrap().push(buffer);
    }

    /// Number of decoded frames dropped because the queue was full.
    pub fn dropped_frames(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn take_rearm(&self) -> Option<RearmRx> {
        let timing = *self.timing.lock().unwrap();
        self.spares.lock().unwrap().pop().map(|buffer| RearmRx {
            buffer,
            min_pulse_ns: timing.rx_min_ns,
            max_pulse_ns: timing.rx_max_ns,
        })
    }

    fn set_timing(&self, timing: LineTiming) {
        *self.timing.lock().unwrap() = timing;
    }
}

/// Platform pulse peripheral bound to the configured GPIO pins.
///
/// Implementations own the transmit and receive hardware channels; when
/// both directions share one pin they are expected to run the output in
/// open-drain mode. Completions are reported by calling into the
/// [`LineShared`] handed over through [`connect`](PulseChannel::connect),
/// and the returned [`RearmRx`] directives must be applied immediately.
pub trait PulseChannel {
    /// Binds the channel to the line's completion interface. Called once
    /// before any other operation.
    fn connect(&mut self, events: Arc<LineShared>);

    /// Tears down and reconfigures both directions for new line timing.
    /// Any armed receive is lost; the next transmit completion re-arms.
    fn set_timing(&mut self, timing: &LineTiming) -> Result<()>;

    /// Starts sending `pulses`, repeated `repeat` times by the hardware
    /// (0 means a single pass). Must first cancel an armed receive and
    /// return its buffer through [`LineShared::reclaim`].
    fn transmit(&mut self, pulses: &[Pulse], repeat: u32) -> Result<()>;
}

/// Foreground handle to the PPM line.
pub struct PpmLine<C: PulseChannel> {
    channel: C,
    shared: Arc<LineShared>,
    frames: Receiver<RawFrame>,
    tx_done: Receiver<()>,
    pattern: EnterPattern,
}

impl<C: PulseChannel> PpmLine<C> {
    /// Takes ownership of the platform channel and applies the default
    /// line timing.
    pub fn new(mut channel: C) -> Result<Self> {
        let (frames_tx, frames_rx) = sync_channel(RX_QUEUE_DEPTH);
        let (done_tx, done_rx) = sync_channel(1);
        let shared = Arc::new(LineShared::new(frames_tx, done_tx));
        channel.connect(Arc::clone(&shared));
        channel.set_timing(&LineTiming::DEFAULT)?;
        Ok(PpmLine {
            channel,
            shared,
            frames: frames_rx,
            tx_done: done_rx,
            pattern: EnterPattern::DEFAULT,
        })
    }

    /// Applies a new average bitrate to both wire directions.
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<()> {
        let timing = LineTiming::from_bitrate(bitrate)?;
        self.channel.set_timing(&timing)?;
        self.shared.set_timing(timing);
        debug!(
            "line timing: {} Hz, rx window {}..{} ns",
            timing.resolution_hz, timing.rx_min_ns, timing.rx_max_ns
        );
        Ok(())
    }

    /// Keeps the enter-programming pattern on the wire for
    /// `pattern_time_us`. `while_active` runs right after transmission
    /// starts; the orchestrator uses it to power the chip up while the
    /// pattern is already present.
    pub fn send_enter_pattern(
        &mut self,
        pattern_time_us: u32,
        while_active: impl FnOnce(),
    ) -> Result<()> {
        if pattern_time_us == 0 {
            return Err(Error::InvalidArg("pattern time must be non-zero"));
        }
        let pulses = self.pattern.pulses();
        let repeats = self.pattern.repeats(pattern_time_us);
        debug!("tx enter pattern, {repeats} repetitions");
        self.channel.transmit(&pulses, repeats)?;
        while_active();
        self.wait_transmit_done()
    }

    /// Emits the bare calibration pulse the slave measures its timing
    /// against.
    pub fn send_calibration(&mut self) -> Result<()> {
        let pulses = encode_frame(FrameTag::Calibration, &[])?;
        self.channel.transmit(&pulses, 0)?;
        self.wait_transmit_done()
    }

    /// Encodes and transmits one frame, blocking until the transmit
    /// completes (and reception is re-armed).
    pub fn send_frame(&mut self, tag: FrameTag, words: &[u16]) -> Result<()> {
        if words.is_empty() {
            return Err(Error::InvalidArg("frame payload must not be empty"));
        }
        let bytes = words_to_bytes(words);
        let pulses = encode_frame(tag, &bytes)?;
        debug!("tx {:?} frame, {} words", tag, words.len());
        self.channel.transmit(&pulses, 0)?;
        self.wait_transmit_done()
    }

    /// Waits up to `timeout_ms` for the next decoded frame.
    pub fn wait_response(&mut self, timeout_ms: u16) -> Option<(FrameTag, Vec<u16>)> {
        match self
            .frames
            .recv_timeout(Duration::from_millis(timeout_ms.into()))
        {
            Ok(frame) => Some((frame.tag, frame.words())),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Number of decoded frames lost to receive-queue overflow.
    pub fn dropped_frames(&self) -> u32 {
        self.shared.dropped_frames()
    }

    fn wait_transmit_done(&mut self) -> Result<()> {
        self.tx_done
            .recv()
            .map_err(|_| Error::Line("transmit completion signal lost".to_string()))
    }
}
