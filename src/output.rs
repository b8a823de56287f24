//! PCM sinks for mixed output.
//!
//! The mixer writes to any `io::Write`. For hand-off to a consumer on
//! another thread (playback callback, encoder, recorder) a lock-free byte
//! ring is provided: the mixer side implements `Write`, the consumer side
//! implements `Read`.

use std::io::{self, Read, Write};

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};

/// Create a lock-free PCM byte ring of `capacity` bytes.
///
/// Size the ring for the consumer's cadence; a full ring makes the
/// producer side report short writes.
pub fn pcm_ring(capacity: usize) -> (RingSink, RingSource) {
    let rb = HeapRb::<u8>::new(capacity);
    let (prod, cons) = rb.split();
    (RingSink { prod }, RingSource { cons })
}

/// Producer half of the PCM ring; hand this to the mixer as its sink.
pub struct RingSink {
    prod: HeapProd<u8>,
}

impl RingSink {
    /// Free space in bytes.
    pub fn vacant(&self) -> usize {
        self.prod.vacant_len()
    }
}

impl Write for RingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.prod.push_slice(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Consumer half of the PCM ring.
pub struct RingSource {
    cons: HeapCons<u8>,
}

impl RingSource {
    /// Buffered bytes.
    pub fn available(&self) -> usize {
        self.cons.occupied_len()
    }

    /// Pop whole 16-bit samples (host byte order) into `out`, returning
    /// the number of samples written.
    pub fn read_samples(&mut self, out: &mut [i16]) -> usize {
        let mut bytes = [0u8; 2];
        let mut written = 0;
        while written < out.len() && self.cons.occupied_len() >= 2 {
            self.cons.pop_slice(&mut bytes);
            out[written] = i16::from_ne_bytes(bytes);
            written += 1;
        }
        written
    }
}

impl Read for RingSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.cons.pop_slice(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_samples() {
        let (mut sink, mut source) = pcm_ring(64);

        let samples: [i16; 3] = [100, -200, 300];
        for s in samples {
            sink.write_all(&s.to_ne_bytes()).unwrap();
        }
        assert_eq!(source.available(), 6);

        let mut out = [0i16; 3];
        assert_eq!(source.read_samples(&mut out), 3);
        assert_eq!(out, samples);
        assert_eq!(source.available(), 0);
    }

    #[test]
    fn test_full_ring_short_write() {
        let (mut sink, _source) = pcm_ring(4);
        assert_eq!(sink.write(&[0u8; 8]).unwrap(), 4);
        assert_eq!(sink.vacant(), 0);
        assert_eq!(sink.write(&[0u8; 2]).unwrap(), 0);
    }
}
