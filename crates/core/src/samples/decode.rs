use std::io::Cursor;

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::{BridgeError, Result};

/// Decodes an encoded asset into mono samples at `target_rate`.
///
/// `url` only serves as a format hint and for error reporting. Channels are
/// averaged per packet; the result is resampled when the source rate differs
/// from the target by more than 1 Hz.
pub fn decode_mono(bytes: Vec<u8>, url: &str, target_rate: u32) -> Result<Vec<f32>> {
    let decode_err = |reason: String| BridgeError::Decode {
        url: url.to_string(),
        reason,
    };

    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = extension(url) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| decode_err(format!("failed to probe format: {e}")))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| decode_err("no audio track found".into()))?;

    let track_id = track.id;
    let source_rate = track.codec_params.sample_rate.unwrap_or(44_100);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| decode_err(format!("failed to create decoder: {e}")))?;

    let mut mono = Vec::new();
    let mut sample_buf: Option<(SignalSpec, SampleBuffer<f32>)> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(decode_err(format!("failed to read packet: {e}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(decode_err(e.to_string())),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let frames = decoded.capacity();
        let reusable = matches!(
            &sample_buf,
            Some((buf_spec, buf)) if *buf_spec == spec && buf.capacity() >= frames * channels
        );
        if !reusable {
            sample_buf = Some((spec, SampleBuffer::new(frames as u64, spec)));
        }
        let Some((_, buf)) = sample_buf.as_mut() else {
            continue;
        };
        buf.copy_interleaved_ref(decoded);

        mono.extend(
            buf.samples()
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );
    }

    if mono.is_empty() {
        return Err(decode_err("no samples decoded".into()));
    }

    if (source_rate as f64 - target_rate as f64).abs() > 1.0 {
        resample(&mono, source_rate, target_rate).map_err(decode_err)
    } else {
        Ok(mono)
    }
}

/// Resamples a mono buffer in a single pass.
fn resample(input: &[f32], source_rate: u32, target_rate: u32) -> std::result::Result<Vec<f32>, String> {
    let mut resampler = FastFixedIn::<f32>::new(
        target_rate as f64 / source_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        input.len(),
        1,
    )
    .map_err(|e| format!("failed to create resampler: {e}"))?;

    let mut planar = resampler
        .process(&[input], None)
        .map_err(|e| format!("resampling failed: {e}"))?;
    Ok(planar.pop().unwrap_or_default())
}

fn extension(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    (!ext.is_empty()).then_some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(sample_rate: u32, channels: u16, frames: &[[i16; 2]]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for frame in frames {
                for sample in &frame[..channels as usize] {
                    writer.write_sample(*sample).unwrap();
                }
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn downmixes_stereo_by_averaging() {
        let frames = vec![[16_384i16, 0i16]; 64];
        let bytes = wav_bytes(48_000, 2, &frames);

        let mono = decode_mono(bytes, "https://s.org/kick.wav", 48_000).unwrap();

        assert_eq!(mono.len(), 64);
        assert!(mono.iter().all(|s| (s - 0.25).abs() < 1e-3));
    }

    #[test]
    fn resamples_to_the_engine_rate() {
        let frames = vec![[8_192i16, 0i16]; 100];
        let bytes = wav_bytes(44_100, 1, &frames);

        let mono = decode_mono(bytes, "snare.wav", 22_050).unwrap();

        assert!((45..=55).contains(&mono.len()), "got {} frames", mono.len());
        assert!((mono[25] - 0.25).abs() < 1e-2);
    }

    #[test]
    fn rejects_bytes_that_are_not_audio() {
        let err = decode_mono(b"definitely not audio".to_vec(), "x.wav", 48_000).unwrap_err();
        assert!(matches!(err, BridgeError::Decode { .. }));
    }

    #[test]
    fn extension_ignores_query_and_directories() {
        assert_eq!(extension("https://a.org/d.ir/kick.WAV?x=1"), Some("WAV"));
        assert_eq!(extension("https://a.org/d.ir/kick"), None);
    }

    #[test]
    fn packets_are_downmixed_by_their_own_channel_count() {
        let frames: Vec<[i16; 2]> = (0..32).map(|_| [8_192i16, -8_192i16]).collect();
        let bytes = wav_bytes(48_000, 2, &frames);

        let mono = decode_mono(bytes, "pair.wav", 48_000).unwrap();

        assert_eq!(mono.len(), 32);
        assert!(mono.iter().all(|s| s.abs() < 1e-3));
    }
}
