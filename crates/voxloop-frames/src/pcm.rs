//! 16-bit little-endian PCM conversions used at stage boundaries.

/// Interpret a PCM16LE byte buffer as samples. A trailing odd byte is
/// ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Duration of a PCM16 mono byte buffer in milliseconds.
pub fn byte_len_to_ms(len: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    (len as u64 / 2) * 1000 / sample_rate as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_samples() {
        let samples = vec![0i16, -1, 32767, -32768, 1234];
        assert_eq!(bytes_to_samples(&samples_to_bytes(&samples)), samples);
    }

    #[test]
    fn odd_trailing_byte_ignored() {
        assert_eq!(bytes_to_samples(&[0x34, 0x12, 0xff]), vec![0x1234]);
    }

    #[test]
    fn duration_at_16k() {
        // 16000 samples/s mono -> 32000 bytes/s
        assert_eq!(byte_len_to_ms(32_000, 16_000), 1000);
        assert_eq!(byte_len_to_ms(16_000, 16_000), 500);
    }
}
