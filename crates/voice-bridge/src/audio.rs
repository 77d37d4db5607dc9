//! PCM helpers shared by the VAD and the engine

/// Decode little-endian 16-bit PCM; a trailing odd byte is ignored
pub fn pcm16_le_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode samples as little-endian 16-bit PCM
pub fn samples_to_pcm16_le(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// RMS energy normalized to 0.0-1.0 (16-bit full scale)
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples.iter().map(|&sample| (sample as f64).powi(2)).sum();
    let rms = (sum_squares / samples.len() as f64).sqrt();

    (rms / 32768.0) as f32
}

/// Fraction of adjacent sample pairs that change sign
pub fn zero_crossing_rate(samples: &[i16]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }

    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0) != (pair[1] >= 0))
        .count();

    crossings as f32 / (samples.len() - 1) as f32
}

/// Samples in a frame of `duration_ms` at `sample_rate`
pub fn frame_len(sample_rate: u32, duration_ms: u32) -> usize {
    (sample_rate as usize * duration_ms as usize) / 1000
}
