//! Opus codec adapters.
//!
//! The wire runs Opus at 48 kHz mono; the pipeline runs 16 kHz f32. These
//! adapters own the rate conversion on both directions. The underlying
//! coder state is not `Sync`, so each adapter serializes access through a
//! non-awaiting mutex.

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, SampleRate as OpusRate};
use parking_lot::Mutex;

use dhwani_core::{AudioFrame, SampleRate};

use crate::TransportError;

/// Samples per 20 ms Opus frame at 48 kHz mono.
const OPUS_FRAME_SAMPLES: usize = 960;
const MAX_PACKET_BYTES: usize = 1500;

pub struct OpusEncoder {
    encoder: Mutex<Encoder>,
    /// Carry-over samples shorter than one Opus frame
    pending: Mutex<Vec<f32>>,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, TransportError> {
        let encoder = Encoder::new(OpusRate::Hz48000, Channels::Mono, Application::Voip)
            .map_err(|e| TransportError::Codec(format!("opus encoder: {}", e)))?;
        Ok(Self {
            encoder: Mutex::new(encoder),
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Encode a pipeline frame into zero or more Opus packets.
    pub fn encode(&self, frame: &AudioFrame) -> Result<Vec<Vec<u8>>, TransportError> {
        let at_wire_rate = frame.resample(SampleRate::Hz48000);

        let mut pending = self.pending.lock();
        pending.extend_from_slice(&at_wire_rate.samples);

        let mut packets = Vec::new();
        let mut encoder = self.encoder.lock();
        while pending.len() >= OPUS_FRAME_SAMPLES {
            let chunk: Vec<f32> = pending.drain(..OPUS_FRAME_SAMPLES).collect();
            let mut out = vec![0u8; MAX_PACKET_BYTES];
            let written = encoder
                .encode_float(&chunk, &mut out)
                .map_err(|e| TransportError::Codec(format!("opus encode: {}", e)))?;
            out.truncate(written);
            packets.push(out);
        }
        Ok(packets)
    }
}

pub struct OpusDecoder {
    decoder: Mutex<Decoder>,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, TransportError> {
        let decoder = Decoder::new(OpusRate::Hz48000, Channels::Mono)
            .map_err(|e| TransportError::Codec(format!("opus decoder: {}", e)))?;
        Ok(Self {
            decoder: Mutex::new(decoder),
        })
    }

    /// Decode one Opus packet to 16 kHz pipeline samples.
    pub fn decode(&self, packet: &[u8], sequence: u64, capture_ts_us: u64) -> Result<AudioFrame, TransportError> {
        let mut wire = vec![0f32; OPUS_FRAME_SAMPLES * 2];
        let decoded = {
            let mut decoder = self.decoder.lock();
            decoder
                .decode_float(Some(packet), &mut wire, false)
                .map_err(|e| TransportError::Codec(format!("opus decode: {}", e)))?
        };
        wire.truncate(decoded);

        let frame = AudioFrame::new(wire, SampleRate::Hz48000, sequence, capture_ts_us);
        Ok(frame.resample(SampleRate::Hz16000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone_frame(samples: usize) -> AudioFrame {
        let data: Vec<f32> = (0..samples)
            .map(|i| (i as f32 * 0.1).sin() * 0.4)
            .collect();
        AudioFrame::new(data, SampleRate::Hz16000, 0, 0)
    }

    #[test]
    fn encode_produces_packets_for_full_frames() {
        let encoder = OpusEncoder::new().unwrap();
        // 20 ms at 16 kHz resamples to exactly one Opus frame.
        let packets = encoder.encode(&tone_frame(320)).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].is_empty());
    }

    #[test]
    fn short_input_is_buffered() {
        let encoder = OpusEncoder::new().unwrap();
        // 10 ms is half an Opus frame: no packet yet.
        let packets = encoder.encode(&tone_frame(160)).unwrap();
        assert!(packets.is_empty());
        // The second half completes the frame.
        let packets = encoder.encode(&tone_frame(160)).unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn roundtrip_preserves_duration() {
        let encoder = OpusEncoder::new().unwrap();
        let decoder = OpusDecoder::new().unwrap();

        let packets = encoder.encode(&tone_frame(320)).unwrap();
        let decoded = decoder.decode(&packets[0], 0, 0).unwrap();
        assert_eq!(decoded.sample_rate, SampleRate::Hz16000);
        // 20 ms at 16 kHz, within resampler tolerance.
        let expected = 320;
        assert!((decoded.samples.len() as i64 - expected).unsigned_abs() < 32);
    }
}
