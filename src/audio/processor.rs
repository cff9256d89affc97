use crate::audio::buffer::PCM_SCALE;
use crate::error::{AppError, Result};
use rubato::{FftFixedInOut, Resampler};
use std::path::Path;
use tracing::{debug, info};

/// Convert float samples to 16-bit PCM.
///
/// Values are scaled by 32768 and clamped to the i16 range before the cast,
/// so loud model output saturates instead of wrapping.
pub fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * PCM_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Convert 16-bit PCM to normalized float samples
pub fn from_pcm16(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / PCM_SCALE).collect()
}

/// Resample mono audio between two rates
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    if source_rate == target_rate {
        return Ok(samples.to_vec());
    }

    debug!("Resampling from {}Hz to {}Hz", source_rate, target_rate);

    let mut resampler =
        FftFixedInOut::<f32>::new(source_rate as usize, target_rate as usize, 1024, 1)
            .map_err(|e| AppError::Audio(format!("Failed to create resampler: {}", e)))?;

    let chunk_size = resampler.input_frames_next();
    let mut output = Vec::new();

    for chunk in samples.chunks(chunk_size) {
        let mut input_chunk = chunk.to_vec();

        // Pad last chunk if needed
        if input_chunk.len() < chunk_size {
            input_chunk.resize(chunk_size, 0.0);
        }

        let result = resampler
            .process(&[input_chunk], None)
            .map_err(|e| AppError::Audio(format!("Resampling failed: {}", e)))?;

        if !result.is_empty() {
            output.extend(&result[0]);
        }
    }

    // Drop the padding added to the last chunk
    let expected = (samples.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    output.truncate(expected);

    Ok(output)
}

/// Load a WAV file as mono f32 samples
pub fn load_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let reader = hound::WavReader::open(path).map_err(|e| AppError::Audio(e.to_string()))?;

    let spec = reader.spec();
    let sample_rate = spec.sample_rate;
    let channels = spec.channels as usize;

    info!(
        "Loading WAV: {}Hz, {} channels, {:?}",
        sample_rate, channels, spec.sample_format
    );

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Audio(e.to_string()))?,
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            let max_val = (1i64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| AppError::Audio(e.to_string()))?
        }
    };

    // Convert to mono by averaging channels
    let mono_samples: Vec<f32> = if channels > 1 {
        samples
            .chunks(channels)
            .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        samples
    };

    Ok((mono_samples, sample_rate))
}

/// Write mono 16-bit PCM to a WAV file
pub fn write_wav(samples: &[i16], sample_rate: u32, path: &Path) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer =
        hound::WavWriter::create(path, spec).map_err(|e| AppError::Audio(e.to_string()))?;
    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| AppError::Audio(e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| AppError::Audio(e.to_string()))?;
    Ok(())
}

/// Calculate the duration in milliseconds
pub fn duration_ms(sample_count: usize, sample_rate: u32) -> i64 {
    ((sample_count as f64 / sample_rate as f64) * 1000.0) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_conversion_clamps() {
        assert_eq!(to_pcm16(&[0.0, 0.5, -0.5]), vec![0, 16384, -16384]);
        // Out-of-range values saturate rather than wrap
        assert_eq!(to_pcm16(&[1.0, 2.5, -1.0, -3.0]), vec![32767, 32767, -32768, -32768]);
    }

    #[test]
    fn test_pcm_round_trip_is_exact() {
        let pcm = vec![-32768i16, -1, 0, 1, 12345, 32767];
        assert_eq!(to_pcm16(&from_pcm16(&pcm)), pcm);
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples = vec![0.1f32, 0.2, 0.3];
        assert_eq!(resample(&samples, 44100, 44100).unwrap(), samples);
    }

    #[test]
    fn test_resample_length() {
        let samples = vec![0.0f32; 48000];
        let out = resample(&samples, 48000, 16000).unwrap();
        assert!(out.len() <= 16000);
        assert!(out.len() > 15000);
    }

    #[test]
    fn test_duration() {
        assert_eq!(duration_ms(44100, 44100), 1000);
        assert_eq!(duration_ms(22050, 44100), 500);
    }
}
