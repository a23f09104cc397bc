//! Audio frame types and channel plumbing.
//!
//! The canonical interchange format is 16 kHz mono f32 in [-1.0, 1.0],
//! carried in fixed 10 ms frames of 160 samples. Timestamps are monotonic
//! microseconds measured at transport ingress.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Frame stride in milliseconds.
pub const FRAME_MS: u32 = 10;
/// Samples per frame at 16 kHz.
pub const FRAME_SAMPLES: usize = 160;

/// Supported sample rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleRate {
    /// Telephony
    Hz8000,
    /// Canonical pipeline rate
    #[default]
    Hz16000,
    /// Some TTS models
    Hz24000,
    /// Opus / WebRTC
    Hz48000,
}

impl SampleRate {
    pub fn as_u32(&self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz16000 => 16000,
            SampleRate::Hz24000 => 24000,
            SampleRate::Hz48000 => 48000,
        }
    }

    /// Samples in one 10 ms frame at this rate.
    pub fn frame_samples(&self) -> usize {
        (self.as_u32() as usize * FRAME_MS as usize) / 1000
    }
}

/// Immutable batch of mono PCM samples.
///
/// Frames are shared by reference between the VAD, STT, and any taps;
/// no consumer ever mutates the sample data.
#[derive(Clone)]
pub struct AudioFrame {
    /// Samples, f32 normalized to [-1.0, 1.0]
    pub samples: Arc<[f32]>,
    /// Sample rate
    pub sample_rate: SampleRate,
    /// Frame sequence number in capture order
    pub sequence: u64,
    /// Monotonic capture timestamp in microseconds, stamped at ingress
    pub capture_ts_us: u64,
    /// RMS energy in dB, computed once at construction
    pub energy_db: f32,
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("samples_len", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .field("sequence", &self.sequence)
            .field("capture_ts_us", &self.capture_ts_us)
            .field("energy_db", &self.energy_db)
            .finish()
    }
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: SampleRate, sequence: u64, capture_ts_us: u64) -> Self {
        let energy_db = rms_db(&samples);
        Self {
            samples: samples.into(),
            sample_rate,
            sequence,
            capture_ts_us,
            energy_db,
        }
    }

    /// Decode PCM16 little-endian bytes into a frame.
    pub fn from_pcm16(bytes: &[u8], sample_rate: SampleRate, sequence: u64, capture_ts_us: u64) -> Self {
        const PCM16_NORMALIZE: f32 = 32768.0;
        let samples: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / PCM16_NORMALIZE)
            .collect();
        Self::new(samples, sample_rate, sequence, capture_ts_us)
    }

    /// Encode to PCM16 little-endian bytes.
    pub fn to_pcm16(&self) -> Vec<u8> {
        const PCM16_SCALE: f32 = 32767.0;
        self.samples
            .iter()
            .flat_map(|&s| ((s.clamp(-1.0, 1.0) * PCM16_SCALE) as i16).to_le_bytes())
            .collect()
    }

    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as u64 * 1000) / self.sample_rate.as_u32() as u64
    }

    /// Resample to the target rate.
    ///
    /// Uses rubato's FFT resampler for frames long enough to window; short
    /// frames fall back to linear interpolation, which the pipeline accepts
    /// for demo-quality output.
    pub fn resample(&self, target: SampleRate) -> Self {
        use rubato::{FftFixedIn, Resampler};

        if self.sample_rate == target {
            return self.clone();
        }
        if self.samples.len() < 64 {
            return self.resample_linear(target);
        }

        let chunk = self.samples.len().min(1024);
        match FftFixedIn::<f64>::new(
            self.sample_rate.as_u32() as usize,
            target.as_u32() as usize,
            chunk,
            2,
            1,
        ) {
            Ok(mut resampler) => {
                let input = vec![self.samples.iter().map(|&s| s as f64).collect::<Vec<f64>>()];
                match resampler.process(&input, None) {
                    Ok(output) => {
                        let samples: Vec<f32> = output[0].iter().map(|&s| s as f32).collect();
                        Self::new(samples, target, self.sequence, self.capture_ts_us)
                    }
                    Err(e) => {
                        tracing::warn!("resampler process failed, linear fallback: {}", e);
                        self.resample_linear(target)
                    }
                }
            }
            Err(e) => {
                tracing::warn!("resampler init failed, linear fallback: {}", e);
                self.resample_linear(target)
            }
        }
    }

    fn resample_linear(&self, target: SampleRate) -> Self {
        let ratio = target.as_u32() as f64 / self.sample_rate.as_u32() as f64;
        let new_len = (self.samples.len() as f64 * ratio) as usize;
        let mut out = Vec::with_capacity(new_len);
        for i in 0..new_len {
            let src = i as f64 / ratio;
            let lo = src.floor() as usize;
            let hi = (lo + 1).min(self.samples.len().saturating_sub(1));
            let frac = (src - lo as f64) as f32;
            out.push(self.samples[lo] * (1.0 - frac) + self.samples[hi] * frac);
        }
        Self::new(out, target, self.sequence, self.capture_ts_us)
    }

    /// Split into fixed-size sub-frames, renumbering sequences.
    pub fn split(&self, chunk_samples: usize) -> Vec<AudioFrame> {
        let mut seq = self.sequence;
        let mut ts = self.capture_ts_us;
        let us_per_sample = 1_000_000 / self.sample_rate.as_u32() as u64;
        self.samples
            .chunks(chunk_samples)
            .map(|chunk| {
                let frame = AudioFrame::new(chunk.to_vec(), self.sample_rate, seq, ts);
                seq += 1;
                ts += chunk.len() as u64 * us_per_sample;
                frame
            })
            .collect()
    }
}

fn rms_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return -96.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum_sq / samples.len() as f32).sqrt();
    if rms > 0.0 {
        20.0 * rms.log10()
    } else {
        -96.0
    }
}

/// Bounded frame channel used between pipeline components.
///
/// Backpressure is explicit: a full channel makes the producer await, never
/// drop or reorder. Per-session frame delivery is FIFO.
pub type FrameSender = tokio::sync::mpsc::Sender<AudioFrame>;
pub type FrameReceiver = tokio::sync::mpsc::Receiver<AudioFrame>;

pub fn frame_channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    tokio::sync::mpsc::channel(capacity)
}

/// Lock-free single-producer single-consumer sample ring.
///
/// One writer task and one reader task; indices only ever advance, so
/// Acquire/Release pairs on head and tail are sufficient. Capacity is
/// rounded up to a power of two.
pub struct SpscRing {
    buf: Box<[UnsafeCell<f32>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

unsafe impl Sync for SpscRing {}

pub struct RingProducer {
    ring: Arc<SpscRing>,
}

pub struct RingConsumer {
    ring: Arc<SpscRing>,
}

/// Create a ring with room for at least `capacity` samples.
pub fn spsc_ring(capacity: usize) -> (RingProducer, RingConsumer) {
    let cap = capacity.next_power_of_two();
    let buf: Vec<UnsafeCell<f32>> = (0..cap).map(|_| UnsafeCell::new(0.0)).collect();
    let ring = Arc::new(SpscRing {
        buf: buf.into_boxed_slice(),
        mask: cap - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        RingProducer { ring: ring.clone() },
        RingConsumer { ring },
    )
}

impl RingProducer {
    /// Push samples; returns the number actually written (the rest would
    /// overwrite unread data and are rejected).
    pub fn push(&self, samples: &[f32]) -> usize {
        let ring = &self.ring;
        let head = ring.head.load(Ordering::Acquire);
        let tail = ring.tail.load(Ordering::Relaxed);
        let free = ring.buf.len() - (tail.wrapping_sub(head));
        let n = samples.len().min(free);
        for (i, &s) in samples[..n].iter().enumerate() {
            let idx = (tail.wrapping_add(i)) & ring.mask;
            // Safety: slots in [tail, tail+n) are not visible to the consumer
            // until the tail store below.
            unsafe { *ring.buf[idx].get() = s };
        }
        ring.tail.store(tail.wrapping_add(n), Ordering::Release);
        n
    }
}

impl RingConsumer {
    /// Number of samples available to read.
    pub fn len(&self) -> usize {
        let head = self.ring.head.load(Ordering::Relaxed);
        let tail = self.ring.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop up to `out.len()` samples; returns the count read.
    pub fn pop(&self, out: &mut [f32]) -> usize {
        let ring = &self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Acquire);
        let avail = tail.wrapping_sub(head);
        let n = out.len().min(avail);
        for (i, slot) in out[..n].iter_mut().enumerate() {
            let idx = (head.wrapping_add(i)) & ring.mask;
            // Safety: slots in [head, head+n) were published by the producer.
            *slot = unsafe { *ring.buf[idx].get() };
        }
        ring.head.store(head.wrapping_add(n), Ordering::Release);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_constants() {
        assert_eq!(SampleRate::Hz16000.frame_samples(), FRAME_SAMPLES);
        assert_eq!(SampleRate::Hz48000.frame_samples(), 480);
    }

    #[test]
    fn pcm16_roundtrip() {
        let frame = AudioFrame::new(vec![0.5, -0.5, 0.0], SampleRate::Hz16000, 0, 0);
        let bytes = frame.to_pcm16();
        let back = AudioFrame::from_pcm16(&bytes, SampleRate::Hz16000, 0, 0);
        for (a, b) in frame.samples.iter().zip(back.samples.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn energy_of_silence_is_floor() {
        let silent = AudioFrame::new(vec![0.0; FRAME_SAMPLES], SampleRate::Hz16000, 0, 0);
        assert!(silent.energy_db < -90.0);
        let loud = AudioFrame::new(vec![0.5; FRAME_SAMPLES], SampleRate::Hz16000, 0, 0);
        assert!(loud.energy_db > -10.0);
    }

    #[test]
    fn resample_halves_length() {
        let frame = AudioFrame::new(vec![0.0; 160], SampleRate::Hz16000, 0, 0);
        let down = frame.resample(SampleRate::Hz8000);
        assert_eq!(down.samples.len(), 80);
    }

    #[test]
    fn split_renumbers_sequences() {
        let frame = AudioFrame::new(vec![0.1; 480], SampleRate::Hz16000, 7, 1_000);
        let parts = frame.split(160);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].sequence, 7);
        assert_eq!(parts[2].sequence, 9);
        assert!(parts[1].capture_ts_us > parts[0].capture_ts_us);
    }

    #[test]
    fn spsc_ring_fifo() {
        let (tx, rx) = spsc_ring(8);
        assert_eq!(tx.push(&[1.0, 2.0, 3.0]), 3);
        let mut out = [0.0; 2];
        assert_eq!(rx.pop(&mut out), 2);
        assert_eq!(out, [1.0, 2.0]);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn spsc_ring_rejects_overflow() {
        let (tx, rx) = spsc_ring(4);
        assert_eq!(tx.push(&[0.0; 10]), 4);
        assert_eq!(rx.len(), 4);
    }
}
