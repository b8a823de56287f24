//! Voice-activity detection over RTP loops.
//!
//! Each conference loop gets its own multicast ingest; frames are decoded
//! on the worker pool through a private codec registry, reduced to VAD
//! parameters and fed into a per-SSRC hysteresis state machine. A loop is
//! "on" while at least one of its SSRCs is active; the subscriber callback
//! fires on every 0 ↔ ≥1 transition. Periodic sweeps force loops off when
//! their traffic stops and evict idle decoders and counters.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::codec::CodecRegistry;
use crate::dsp::{self, VadThresholds};
use crate::rtp::frame::RtpFrame;
use crate::rtp::receiver::{FrameSink, RtpReceiver};
use crate::rtp::socket::multicast_socket;
use crate::runtime::{Ticker, WorkerPool, DEFAULT_QUEUE_CAPACITY};
use crate::Error;

/// An SSRC not seen for this long is forced inactive.
const SSRC_ACTIVE_TIMEOUT: Duration = Duration::from_millis(200);

/// Cadence of the forced loop re-aggregation sweep.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Cadence of decoder/counter garbage collection.
const CODEC_GC_INTERVAL: Duration = Duration::from_secs(5);

/// Decoders and counters idle longer than this are evicted.
const CODEC_STALE_AFTER: Duration = Duration::from_secs(5);

/// Largest decodable frame: 120 ms at 48 kHz.
const MAX_DECODED_SAMPLES: usize = 5760;

/// Decision thresholds, shared with the `dsp` primitives.
pub type VadConfig = VadThresholds;

/// Full VAD subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadCoreConfig {
    /// Classification thresholds.
    pub vad: VadConfig,
    /// Consecutive voiced frames to turn an SSRC on.
    pub frames_activate: u32,
    /// Consecutive unvoiced frames to turn an SSRC off.
    pub frames_deactivate: u32,
    /// Decode rate for loop traffic.
    pub sample_rate_hertz: u32,
    /// Worker threads (0 = one per online CPU).
    pub threads: usize,
    /// Bound on queued decode jobs.
    pub message_queue_capacity: usize,
    /// Bounded wait for per-loop and registry locks.
    pub lock_timeout_ms: u64,
}

impl Default for VadCoreConfig {
    fn default() -> Self {
        Self {
            vad: VadThresholds::default(),
            frames_activate: 3,
            frames_deactivate: 25,
            sample_rate_hertz: crate::DEFAULT_SAMPLE_RATE_HZ,
            threads: 0,
            message_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            lock_timeout_ms: crate::DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

/// Subscriber callback: `(loop_name, on)`.
pub type VadCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

struct SsrcCounter {
    on: u32,
    off: u32,
    last_seen: Instant,
    active: bool,
}

impl SsrcCounter {
    fn new() -> Self {
        Self {
            on: 0,
            off: 0,
            last_seen: Instant::now(),
            active: false,
        }
    }
}

struct LoopState {
    emitting: bool,
    counters: HashMap<u32, SsrcCounter>,
}

struct VadLoop {
    name: String,
    state: Mutex<LoopState>,
}

struct Shared {
    config: VadCoreConfig,
    codecs: CodecRegistry,
    loops: Mutex<HashMap<String, Arc<VadLoop>>>,
    callback: VadCallback,
    lock_timeout: Duration,
}

impl Shared {
    /// Hysteresis update for one frame's decision, then loop-level
    /// re-aggregation. Callbacks fire while the loop lock is held, so they
    /// are serialised per loop.
    fn apply_decision(&self, vad_loop: &VadLoop, ssrc: u32, detected: bool) {
        let Some(mut state) = vad_loop.state.try_lock_for(self.lock_timeout) else {
            return;
        };
        let state = &mut *state;

        let counter = state
            .counters
            .entry(ssrc)
            .or_insert_with(SsrcCounter::new);
        counter.last_seen = Instant::now();

        let mut switch_on = false;

        if detected {
            counter.off = 0;
            if !counter.active {
                counter.on += 1;
                if counter.on >= self.config.frames_activate {
                    debug!("VAD on {} SSRC {ssrc}", vad_loop.name);
                    counter.active = true;
                    counter.on = 0;
                    switch_on = true;
                }
            }
        } else if counter.active {
            counter.off += 1;
            if counter.off >= self.config.frames_deactivate {
                debug!("VAD off {} SSRC {ssrc}", vad_loop.name);
                counter.off = 0;
                counter.active = false;
            }
        }

        if switch_on && !state.emitting {
            state.emitting = true;
            (self.callback)(&vad_loop.name, true);
        }

        if Self::all_inactive(&mut state.counters) && state.emitting {
            state.emitting = false;
            (self.callback)(&vad_loop.name, false);
        }
    }

    /// Force stale counters inactive, then report whether any SSRC is
    /// still active.
    fn all_inactive(counters: &mut HashMap<u32, SsrcCounter>) -> bool {
        let now = Instant::now();
        let mut all_off = true;
        for counter in counters.values_mut() {
            if now.duration_since(counter.last_seen) > SSRC_ACTIVE_TIMEOUT {
                counter.active = false;
            }
            if counter.active {
                all_off = false;
            }
        }
        all_off
    }

    /// The 500 ms sweep: loops whose traffic stopped without an explicit
    /// unvoiced transition are still reported off.
    fn sweep_idle_loops(&self) {
        let loops: Vec<Arc<VadLoop>> = self.loops.lock().values().cloned().collect();
        for vad_loop in loops {
            let Some(mut state) = vad_loop.state.try_lock() else {
                continue;
            };
            let state = &mut *state;
            if Self::all_inactive(&mut state.counters) && state.emitting {
                state.emitting = false;
                (self.callback)(&vad_loop.name, false);
            }
        }
    }

    /// The 5 s sweep: drop idle decoders and reap counters not seen for
    /// the same staleness window.
    fn collect_garbage(&self) {
        self.codecs.garbage_collect(CODEC_STALE_AFTER);

        let loops: Vec<Arc<VadLoop>> = self.loops.lock().values().cloned().collect();
        let now = Instant::now();
        for vad_loop in loops {
            let Some(mut state) = vad_loop.state.try_lock() else {
                continue;
            };
            state
                .counters
                .retain(|_, c| now.duration_since(c.last_seen) <= CODEC_STALE_AFTER);
        }
    }

    /// Decode + DSP for one frame; runs on the worker pool.
    fn analyse(&self, vad_loop: &VadLoop, frame: RtpFrame) {
        let mut pcm = [0i16; MAX_DECODED_SAMPLES];

        let decoded = self
            .codecs
            .with_decoder(frame.ssrc(), |decoder| decoder.decode(frame.payload(), &mut pcm));

        let samples = match decoded {
            Some(Ok(n)) => n,
            Some(Err(err)) => {
                debug!("VAD decode failed for SSRC {}: {err}", frame.ssrc());
                return;
            }
            None => return,
        };

        let params = dsp::vad_parameters(&pcm[..samples]);
        let detected = dsp::vad_detected(self.config.sample_rate_hertz, params, &self.config.vad);

        self.apply_decision(vad_loop, frame.ssrc(), detected);
    }
}

/// Sink attached to one loop's ingest socket: every frame becomes a
/// decode job.
struct LoopSink {
    shared: Arc<Shared>,
    vad_loop: Arc<VadLoop>,
    pool: Arc<WorkerPool>,
}

impl FrameSink for LoopSink {
    fn deliver(&self, frame: RtpFrame) {
        let shared = self.shared.clone();
        let vad_loop = self.vad_loop.clone();
        self.pool.submit(Box::new(move || {
            shared.analyse(&vad_loop, frame);
        }));
    }
}

/// The VAD subsystem: loops, worker pool and sweep timers.
pub struct VadCore {
    receivers: Mutex<HashMap<String, RtpReceiver>>,
    pool: Arc<WorkerPool>,
    _idle_ticker: Ticker,
    _gc_ticker: Ticker,
    shared: Arc<Shared>,
}

impl VadCore {
    /// Build the subsystem and start its worker pool and sweep timers.
    pub fn new(
        config: VadCoreConfig,
        callback: impl Fn(&str, bool) + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        let lock_timeout = Duration::from_millis(config.lock_timeout_ms);
        let codecs = CodecRegistry::new(config.sample_rate_hertz, lock_timeout)?;

        let pool = Arc::new(WorkerPool::new(
            config.threads,
            config.message_queue_capacity,
        )?);

        let shared = Arc::new(Shared {
            config,
            codecs,
            loops: Mutex::new(HashMap::new()),
            callback: Arc::new(callback),
            lock_timeout,
        });

        let idle_shared = shared.clone();
        let idle_ticker = Ticker::spawn("vad-idle", IDLE_SWEEP_INTERVAL, move || {
            idle_shared.sweep_idle_loops();
        })?;

        let gc_shared = shared.clone();
        let gc_ticker = Ticker::spawn("vad-gc", CODEC_GC_INTERVAL, move || {
            gc_shared.collect_garbage();
        })?;

        Ok(Self {
            receivers: Mutex::new(HashMap::new()),
            pool,
            _idle_ticker: idle_ticker,
            _gc_ticker: gc_ticker,
            shared,
        })
    }

    /// Register a loop and start listening on its multicast group.
    pub fn add_loop(
        &self,
        name: &str,
        group: Ipv4Addr,
        port: u16,
        interface: Option<Ipv4Addr>,
    ) -> Result<(), Error> {
        let socket = multicast_socket(group, port, interface)?;
        let vad_loop = self.register_loop(name)?;

        let sink = Arc::new(LoopSink {
            shared: self.shared.clone(),
            vad_loop,
            pool: self.pool.clone(),
        });
        let receiver = match RtpReceiver::spawn(name, socket, sink) {
            Ok(receiver) => receiver,
            Err(err) => {
                self.shared.loops.lock().remove(name);
                return Err(err.into());
            }
        };

        self.receivers.lock().insert(name.to_string(), receiver);
        debug!("VAD added loop {name}");
        Ok(())
    }

    /// Register a loop without a socket; frames arrive through
    /// [`deliver_frame`](Self::deliver_frame). Used by embedders that run
    /// their own ingest.
    pub fn add_local_loop(&self, name: &str) -> Result<(), Error> {
        self.register_loop(name).map(|_| ())
    }

    fn register_loop(&self, name: &str) -> Result<Arc<VadLoop>, Error> {
        let mut loops = self.shared.loops.lock();
        if loops.contains_key(name) {
            return Err(Error::Config(format!("loop {name} already registered")));
        }

        let vad_loop = Arc::new(VadLoop {
            name: name.to_string(),
            state: Mutex::new(LoopState {
                emitting: false,
                counters: HashMap::new(),
            }),
        });
        loops.insert(name.to_string(), vad_loop.clone());
        Ok(vad_loop)
    }

    /// Drop a loop, its counters and its ingest socket.
    pub fn remove_loop(&self, name: &str) {
        self.receivers.lock().remove(name);
        self.shared.loops.lock().remove(name);
    }

    /// Feed a frame into a registered loop's analysis path (worker pool).
    /// Returns false if the loop is unknown or the queue is full.
    pub fn deliver_frame(&self, loop_name: &str, frame: RtpFrame) -> bool {
        let Some(vad_loop) = self.shared.loops.lock().get(loop_name).cloned() else {
            warn!("VAD frame for unknown loop {loop_name}");
            return false;
        };

        let shared = self.shared.clone();
        self.pool.submit(Box::new(move || {
            shared.analyse(&vad_loop, frame);
        }))
    }

    /// Whether a loop is currently reported "on".
    pub fn is_emitting(&self, loop_name: &str) -> bool {
        self.shared
            .loops
            .lock()
            .get(loop_name)
            .map(|l| l.state.lock().emitting)
            .unwrap_or(false)
    }
}
