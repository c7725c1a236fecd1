//! RMS level metering for captured audio blocks.
//!
//! Maps block energy onto a 0-100 scale used both for UI feedback and
//! as the VAD decision signal.

/// Bottom of the metered dynamic range in dBFS. Levels at or below this
/// map to 0, full scale maps to 100.
const DB_FLOOR: f64 = -60.0;

/// Compute the normalized loudness of one block of mono S16LE samples.
///
/// RMS over the block, converted to dB relative to full scale, then
/// linearly rescaled so the 60 dB window covers 0..=100. A zero-length
/// block reads as silence.
pub fn level(samples: &[i16]) -> u8 {
    if samples.is_empty() {
        return 0;
    }
    let energy: f64 = samples
        .iter()
        .map(|&s| {
            let f = f64::from(s) / 32768.0;
            f * f
        })
        .sum::<f64>()
        / samples.len() as f64;
    // Epsilon floor avoids log(0) on digital silence
    let rms = energy.sqrt().max(1e-10);
    let db = 20.0 * rms.log10();
    let scaled = (db - DB_FLOOR) / -DB_FLOOR * 100.0;
    scaled.clamp(0.0, 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_reads_zero() {
        let block = vec![0i16; 480];
        assert_eq!(level(&block), 0);
    }

    #[test]
    fn empty_block_reads_zero() {
        assert_eq!(level(&[]), 0);
    }

    #[test]
    fn full_scale_reads_hundred() {
        let block = vec![i16::MAX; 480];
        assert_eq!(level(&block), 100);
    }

    #[test]
    fn louder_blocks_read_higher() {
        let quiet = vec![100i16; 480];
        let loud = vec![10_000i16; 480];
        assert!(level(&loud) > level(&quiet));
    }

    #[test]
    fn level_is_amplitude_not_sign() {
        let pos = vec![5000i16; 480];
        let neg = vec![-5000i16; 480];
        assert_eq!(level(&pos), level(&neg));
    }
}
