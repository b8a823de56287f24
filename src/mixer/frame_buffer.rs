//! Per-SSRC ordered RTP frame queues.
//!
//! Producers add frames keyed by SSRC; the mixer drains the oldest frame
//! per stream once per tick. Queues are bounded: when full, an incoming
//! frame that is strictly older than the newest queued one displaces it,
//! anything newer is dropped. Sequence numbers order by serial-number
//! arithmetic, so the queue stays correct across the 16-bit wrap.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use log::warn;
use parking_lot::Mutex;

use crate::rtp::frame::{sequence_older, RtpFrame};

/// Streams tracked at most; frames for further SSRCs are dropped.
pub const DEFAULT_MAX_STREAMS: usize = 255;

#[derive(Debug, Clone)]
pub struct FrameBufferConfig {
    /// Per-SSRC queue capacity.
    pub max_frames_per_stream: usize,
    /// Global cap on concurrently tracked SSRCs.
    pub max_streams: usize,
    /// Bounded wait for the buffer lock.
    pub lock_timeout: Duration,
}

impl Default for FrameBufferConfig {
    fn default() -> Self {
        Self {
            max_frames_per_stream: crate::DEFAULT_MAX_FRAMES_PER_STREAM,
            max_streams: DEFAULT_MAX_STREAMS,
            lock_timeout: Duration::from_millis(crate::DEFAULT_LOCK_TIMEOUT_MS),
        }
    }
}

/// Bounded, per-SSRC ordered RTP queue shared between producers and the
/// mixer tick.
pub struct FrameBuffer {
    config: FrameBufferConfig,
    streams: Mutex<HashMap<u32, VecDeque<RtpFrame>>>,
}

impl FrameBuffer {
    pub fn new(config: FrameBufferConfig) -> Self {
        Self {
            config,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a frame for its SSRC.
    ///
    /// Returns the frame that did not make it into the buffer: the
    /// displaced newest frame, the incoming frame itself (duplicate, queue
    /// full of older frames, stream cap reached, or lock contention), or
    /// `None` when the frame was queued without displacement. The caller
    /// owns whatever comes back.
    pub fn add(&self, frame: RtpFrame) -> Option<RtpFrame> {
        let Some(mut streams) = self.streams.try_lock_for(self.config.lock_timeout) else {
            return Some(frame);
        };

        if !streams.contains_key(&frame.ssrc()) && streams.len() >= self.config.max_streams {
            warn!("stream cap {} reached, dropping SSRC {}", self.config.max_streams, frame.ssrc());
            return Some(frame);
        }

        let queue = streams.entry(frame.ssrc()).or_default();

        // Insertion point, scanning from the newest end; arrivals are
        // mostly in order so this is O(1) in the common case.
        let mut idx = queue.len();
        while idx > 0 && sequence_older(frame.sequence(), queue[idx - 1].sequence()) {
            idx -= 1;
        }

        if idx > 0 && queue[idx - 1].sequence() == frame.sequence() {
            return Some(frame); // duplicate
        }

        if queue.len() >= self.config.max_frames_per_stream {
            let newest = queue.back().expect("capacity is non-zero");
            if sequence_older(frame.sequence(), newest.sequence()) {
                let displaced = queue.pop_back();
                queue.insert(idx, frame);
                return displaced;
            }
            return Some(frame);
        }

        queue.insert(idx, frame);
        None
    }

    /// Remove and return the oldest frame of every non-empty stream.
    ///
    /// Returns `None` when the buffer lock is contended; the tick is then
    /// skipped. Streams that become empty stay registered until
    /// [`garbage_collect`](Self::garbage_collect).
    pub fn drain_oldest(&self) -> Option<Vec<RtpFrame>> {
        let mut streams = self.streams.try_lock_for(self.config.lock_timeout)?;

        let mut drained = Vec::with_capacity(streams.len());
        for queue in streams.values_mut() {
            if let Some(frame) = queue.pop_front() {
                drained.push(frame);
            }
        }

        Some(drained)
    }

    /// Drop streams whose queues are currently empty. Returns the number
    /// removed; a contended lock skips the sweep.
    pub fn garbage_collect(&self) -> usize {
        let Some(mut streams) = self.streams.try_lock() else {
            return 0;
        };

        let before = streams.len();
        streams.retain(|_, queue| !queue.is_empty());
        before - streams.len()
    }

    /// Number of SSRCs currently tracked (including drained-empty ones).
    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Total queued frames across all streams.
    pub fn frame_count(&self) -> usize {
        self.streams.lock().values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::frame::RtpFrameBuilder;

    fn frame(ssrc: u32, sequence: u16) -> RtpFrame {
        let mut builder = RtpFrameBuilder::new(ssrc, 96);
        builder.set_sequence(sequence);
        builder.build_frame(&[0u8; 8], 960)
    }

    fn buffer(cap: usize) -> FrameBuffer {
        FrameBuffer::new(FrameBufferConfig {
            max_frames_per_stream: cap,
            ..Default::default()
        })
    }

    fn sequences(buf: &FrameBuffer, ssrc: u32) -> Vec<u16> {
        let mut out = Vec::new();
        loop {
            let drained = buf.drain_oldest().unwrap();
            let mut got = false;
            for f in drained {
                if f.ssrc() == ssrc {
                    out.push(f.sequence());
                    got = true;
                }
            }
            if !got {
                return out;
            }
        }
    }

    #[test]
    fn test_ordered_extraction_after_reordered_add() {
        let buf = buffer(10);
        for seq in [5u16, 4, 3, 2, 1] {
            assert!(buf.add(frame(100, seq)).is_none());
        }
        assert_eq!(sequences(&buf, 100), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_ordering_across_wrap() {
        let buf = buffer(10);
        for seq in [1u16, 65534, 0, 65535] {
            assert!(buf.add(frame(9, seq)).is_none());
        }
        assert_eq!(sequences(&buf, 9), vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn test_duplicate_dropped() {
        let buf = buffer(10);
        assert!(buf.add(frame(7, 3)).is_none());
        let rejected = buf.add(frame(7, 3)).expect("duplicate comes back");
        assert_eq!(rejected.sequence(), 3);
        assert_eq!(buf.frame_count(), 1);
    }

    #[test]
    fn test_full_queue_drops_newer() {
        // Capacity 2, adds 1,2,3: queue keeps the two oldest
        let buf = buffer(2);
        assert!(buf.add(frame(1, 1)).is_none());
        assert!(buf.add(frame(1, 2)).is_none());
        let rejected = buf.add(frame(1, 3)).expect("newest beyond capacity");
        assert_eq!(rejected.sequence(), 3);
        assert_eq!(sequences(&buf, 1), vec![1, 2]);
    }

    #[test]
    fn test_full_queue_older_displaces_newest() {
        let buf = buffer(2);
        assert!(buf.add(frame(1, 10)).is_none());
        assert!(buf.add(frame(1, 11)).is_none());
        let displaced = buf.add(frame(1, 9)).expect("newest frame displaced");
        assert_eq!(displaced.sequence(), 11);
        assert_eq!(sequences(&buf, 1), vec![9, 10]);
    }

    #[test]
    fn test_one_frame_per_ssrc_per_drain() {
        let buf = buffer(10);
        for seq in 0..3u16 {
            buf.add(frame(100, seq));
            buf.add(frame(200, seq));
        }

        let first = buf.drain_oldest().unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|f| f.sequence() == 0));

        let second = buf.drain_oldest().unwrap();
        assert!(second.iter().all(|f| f.sequence() == 1));
    }

    #[test]
    fn test_stream_cap() {
        let buf = FrameBuffer::new(FrameBufferConfig {
            max_streams: 2,
            ..Default::default()
        });
        assert!(buf.add(frame(1, 0)).is_none());
        assert!(buf.add(frame(2, 0)).is_none());
        assert!(buf.add(frame(3, 0)).is_some());
        // Known streams still accept frames at the cap
        assert!(buf.add(frame(1, 1)).is_none());
    }

    #[test]
    fn test_gc_reaps_only_empty_streams() {
        let buf = buffer(10);
        buf.add(frame(1, 0));
        buf.add(frame(2, 0));
        buf.add(frame(2, 1));

        buf.drain_oldest().unwrap();
        // Stream 1 is now empty but still tracked
        assert_eq!(buf.stream_count(), 2);

        assert_eq!(buf.garbage_collect(), 1);
        assert_eq!(buf.stream_count(), 1);
    }

    #[test]
    fn test_contended_add_returns_frame() {
        let buf = FrameBuffer::new(FrameBufferConfig {
            lock_timeout: Duration::from_millis(5),
            ..Default::default()
        });

        let guard = buf.streams.lock();
        let returned = buf.add(frame(1, 0)).expect("contended add hands frame back");
        assert_eq!(returned.ssrc(), 1);
        drop(guard);

        assert!(buf.add(frame(1, 0)).is_none());
    }
}
