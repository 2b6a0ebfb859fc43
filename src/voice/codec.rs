//! PCM codec between captured samples and the agent wire format
//!
//! The wire format is base64-encoded little-endian PCM16. Continuous capture
//! goes through `StreamResampler`/`WireEncoder`, which carry filter state
//! between chunks; the free functions handle complete clips.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Sample rate for outbound microphone audio (16kHz for speech)
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized and agent audio
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// MIME type announced for outbound microphone chunks
pub const INPUT_PCM_MIME: &str = "audio/pcm;rate=16000";

/// Bytes per PCM16 sample
const BYTES_PER_SAMPLE: usize = 2;

/// Resampler chunk size in frames
const RESAMPLE_CHUNK: usize = 1024;

/// Raw captured audio, ephemeral between capture and codec
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved f32 samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Samples per second per channel
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
}

impl AudioFrame {
    /// Create a frame from interleaved samples
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Whether the frame carries no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Resampler for one continuous mono stream
///
/// Input that does not fill a resampler chunk is held for the next call and
/// the filter delay is trimmed once at the start, so feeding a stream in
/// pieces yields exactly what feeding it at once would.
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    from_rate: u32,
    to_rate: u32,
    pending: Vec<f32>,
    /// Leading delay samples still to drop
    skip: usize,
    consumed: u64,
    produced: u64,
}

impl StreamResampler {
    /// Create a resampler from `from_rate` to `to_rate`
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the rates are unusable
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let inner = if from_rate == to_rate {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 2, 1)
                    .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?,
            )
        };
        let skip = inner.as_ref().map_or(0, |r| r.output_delay());
        Ok(Self {
            inner,
            from_rate,
            to_rate,
            pending: Vec::new(),
            skip,
            consumed: 0,
            produced: 0,
        })
    }

    /// Input rate
    #[must_use]
    pub const fn from_rate(&self) -> u32 {
        self.from_rate
    }

    /// Resample the next piece of the stream
    ///
    /// Output lags input by less than one resampler chunk; `finish` drains it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the resampler fails
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        self.consumed += samples.len() as u64;
        let Some(resampler) = self.inner.as_mut() else {
            self.produced += samples.len() as u64;
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);
        let mut output = Vec::new();
        let mut position = 0;
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() - position < needed {
                break;
            }
            let chunk = resampler
                .process(&[&self.pending[position..position + needed]], None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            push_trimmed(&mut self.skip, &chunk[0], &mut output);
            position += needed;
        }
        self.pending.drain(..position);

        self.produced += output.len() as u64;
        Ok(output)
    }

    /// Drain held input and the filter tail, then start over
    ///
    /// After `finish` the total output is exactly the input length scaled by
    /// the rate ratio.
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the resampler fails
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        let target = self.expected_len();
        let mut output = Vec::new();

        if let Some(resampler) = self.inner.as_mut() {
            // Pad with silence until every real sample has come out
            while self.produced + (output.len() as u64) < target {
                let needed = resampler.input_frames_next();
                let mut input = std::mem::take(&mut self.pending);
                input.resize(needed, 0.0);
                let chunk = resampler
                    .process(&[input.as_slice()], None)
                    .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
                push_trimmed(&mut self.skip, &chunk[0], &mut output);
            }
            resampler.reset();
        }

        #[allow(clippy::cast_possible_truncation)]
        output.truncate(target.saturating_sub(self.produced) as usize);
        self.pending.clear();
        self.skip = self.inner.as_ref().map_or(0, |r| r.output_delay());
        self.consumed = 0;
        self.produced = 0;
        Ok(output)
    }

    /// Output length owed for the input consumed so far
    fn expected_len(&self) -> u64 {
        let from = u64::from(self.from_rate);
        (self.consumed * u64::from(self.to_rate) + from / 2) / from
    }
}

/// Append `chunk` to `output`, dropping the first `skip` samples overall
fn push_trimmed(skip: &mut usize, chunk: &[f32], output: &mut Vec<f32>) {
    let dropped = (*skip).min(chunk.len());
    *skip -= dropped;
    output.extend_from_slice(&chunk[dropped..]);
}

/// Encodes a continuous capture stream into wire chunks (mono, 16kHz, base64)
#[derive(Default)]
pub struct WireEncoder {
    resampler: Option<StreamResampler>,
}

impl WireEncoder {
    /// Create an encoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode the next captured frame; may be empty while the resampler fills
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn encode(&mut self, frame: &AudioFrame) -> Result<String> {
        let mono = downmix(&frame.samples, frame.channels);
        let resampler = match self.resampler.take() {
            Some(resampler) if resampler.from_rate() == frame.sample_rate => resampler,
            _ => StreamResampler::new(frame.sample_rate, INPUT_SAMPLE_RATE)?,
        };
        let pcm = self.resampler.insert(resampler).process(&mono)?;
        if pcm.is_empty() {
            return Ok(String::new());
        }
        Ok(encode(&encode_pcm16(&pcm)))
    }

    /// Forget the stream, e.g. when the microphone changes
    pub fn reset(&mut self) {
        self.resampler = None;
    }
}

/// Decoded audio ready to hand to an output device
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl PlayableBuffer {
    /// Wrap interleaved f32 samples
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` for a zero sample rate or channel count
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(Error::Format(format!(
                "invalid stream shape: {sample_rate} Hz, {channels} channels"
            )));
        }
        Ok(Self {
            samples: samples.into(),
            sample_rate,
            channels,
        })
    }

    /// Interleaved samples
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Shared handle to the samples
    #[must_use]
    pub fn shared_samples(&self) -> Arc<[f32]> {
        Arc::clone(&self.samples)
    }

    /// Samples per second per channel
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel count
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames
    #[must_use]
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    /// Playback duration in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Playback duration
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs())
    }
}

/// Encode raw bytes into the wire format
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode the wire format back into raw bytes
///
/// # Errors
///
/// Returns `Error::Format` if the payload is not valid base64
pub fn decode(wire: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(wire.trim())
        .map_err(|e| Error::Format(format!("invalid base64 payload: {e}")))
}

/// Convert PCM16 little-endian bytes into a playable float buffer
///
/// # Errors
///
/// Returns `Error::Format` if the byte length is not a whole number of frames
pub fn decode_audio_data(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<PlayableBuffer> {
    let frame_size = BYTES_PER_SAMPLE * usize::from(channels);
    if frame_size == 0 || bytes.len() % frame_size != 0 {
        return Err(Error::Format(format!(
            "{} bytes is not aligned to {channels}-channel PCM16 frames",
            bytes.len()
        )));
    }

    let samples = bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect();

    PlayableBuffer::new(samples, sample_rate, channels)
}

/// Convert f32 samples into PCM16 little-endian bytes
#[must_use]
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| {
            #[allow(clippy::cast_possible_truncation)]
            let value = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
            value.to_le_bytes()
        })
        .collect()
}

/// Average interleaved channels down to mono
#[must_use]
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let width = usize::from(channels);
    #[allow(clippy::cast_precision_loss)]
    let scale = 1.0 / width as f32;
    samples
        .chunks(width)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

/// Resample a complete mono clip between rates
///
/// The result is delay-free and exactly `len * to_rate / from_rate` long
/// (rounded), so its duration matches the source.
///
/// # Errors
///
/// Returns `Error::Audio` if the resampler cannot be built or fails
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let mut resampler = StreamResampler::new(from_rate, to_rate)?;
    let mut output = resampler.process(samples)?;
    output.extend(resampler.finish()?);
    Ok(output)
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_audio_data_converts_linearly() {
        let bytes = [0x00, 0x00, 0x00, 0x40, 0x00, 0x80];
        let buffer = decode_audio_data(&bytes, OUTPUT_SAMPLE_RATE, 1).unwrap();

        assert_eq!(buffer.samples(), &[0.0, 0.5, -1.0]);
        assert_eq!(buffer.frames(), 3);
    }

    #[test]
    fn misaligned_payload_is_a_format_error() {
        let err = decode_audio_data(&[0x01, 0x02, 0x03], OUTPUT_SAMPLE_RATE, 1).unwrap_err();
        assert!(matches!(err, Error::Format(_)));

        // Aligned to samples but not to stereo frames
        let err = decode_audio_data(&[0, 0, 0, 0, 0, 0], OUTPUT_SAMPLE_RATE, 2).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn stereo_frames_count_per_channel_pair() {
        let buffer = decode_audio_data(&[0; 8], 8_000, 2).unwrap();
        assert_eq!(buffer.frames(), 2);
        assert!((buffer.duration_secs() - 0.000_25).abs() < 1e-9);
    }

    #[test]
    fn wire_roundtrip_preserves_bytes() {
        let bytes = encode_pcm16(&[0.25, -0.25, 0.99]);
        let wire = encode(&bytes);
        assert_eq!(decode(&wire).unwrap(), bytes);
    }

    #[test]
    fn invalid_base64_is_a_format_error() {
        assert!(matches!(decode("not base64!"), Err(Error::Format(_))));
    }

    #[test]
    fn pcm16_encoding_clamps() {
        let bytes = encode_pcm16(&[2.0, -2.0]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), i16::MIN);
    }

    #[test]
    fn downmix_averages_channels() {
        assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
    }

    fn tone(len: usize, rate: u32) -> Vec<f32> {
        #[allow(clippy::cast_precision_loss)]
        (0..len)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn resample_length_is_exact() {
        assert_eq!(resample(&tone(48_000, 48_000), 48_000, 16_000).unwrap().len(), 16_000);
        assert_eq!(resample(&tone(4_800, 48_000), 48_000, 16_000).unwrap().len(), 1_600);
        assert_eq!(resample(&tone(12_000, 48_000), 48_000, 16_000).unwrap().len(), 4_000);
        assert_eq!(resample(&tone(2_400, 24_000), 24_000, 48_000).unwrap().len(), 4_800);
    }

    #[test]
    fn resample_has_no_leading_delay() {
        let out = resample(&vec![0.5f32; 4_800], 48_000, 16_000).unwrap();
        // Only the filter's own ramp-in, not a block of delay silence
        let quiet = out.iter().take_while(|s| s.abs() < 0.05).count();
        assert!(quiet < 8, "{quiet} leading near-zero samples");
        assert!((out[800] - 0.5).abs() < 0.01);
    }

    #[test]
    fn chunked_stream_matches_one_pass() {
        let input = tone(48_000, 48_000);

        let mut whole = StreamResampler::new(48_000, 16_000).unwrap();
        let mut expected = whole.process(&input).unwrap();
        expected.extend(whole.finish().unwrap());

        // 100ms capture ticks
        let mut chunked = StreamResampler::new(48_000, 16_000).unwrap();
        let mut actual = Vec::new();
        for piece in input.chunks(4_800) {
            actual.extend(chunked.process(piece).unwrap());
        }
        actual.extend(chunked.finish().unwrap());

        assert_eq!(actual.len(), 16_000);
        assert_eq!(actual, expected);
    }

    #[test]
    fn equal_rates_pass_through() {
        let mut resampler = StreamResampler::new(16_000, 16_000).unwrap();
        assert_eq!(resampler.process(&[0.1, 0.2]).unwrap(), vec![0.1, 0.2]);
        assert!(resampler.finish().unwrap().is_empty());
    }

    #[test]
    fn wire_encoder_keeps_stream_length() {
        let mut encoder = WireEncoder::new();
        let mut bytes = 0;
        for piece in tone(48_000, 48_000).chunks(4_800) {
            let wire = encoder.encode(&AudioFrame::new(piece.to_vec(), 48_000, 1)).unwrap();
            bytes += decode(&wire).unwrap().len();
        }
        // Everything but the last partial chunk has been sent
        let samples = bytes / BYTES_PER_SAMPLE;
        assert!(samples <= 16_000 && samples > 16_000 - RESAMPLE_CHUNK, "{samples}");
    }

    #[test]
    fn zero_shape_buffers_are_rejected() {
        assert!(PlayableBuffer::new(vec![0.0], 0, 1).is_err());
        assert!(PlayableBuffer::new(vec![0.0], 16_000, 0).is_err());
    }
}
