//! Window energy measurement.

const DBFS_FLOOR: f32 = -100.0;

/// Root-mean-square of a PCM16 window, normalized to [0, 1].
pub fn rms(window: &[i16]) -> f32 {
    if window.is_empty() {
        return 0.0;
    }
    let sum_squares: i64 = window
        .iter()
        .map(|&s| {
            let s = s as i64;
            s * s
        })
        .sum();
    let mean_square = sum_squares as f64 / window.len() as f64;
    (mean_square.sqrt() / f64::from(i16::MAX) as f64) as f32
}

/// Window level in dBFS, clamped at -100 for digital silence.
pub fn dbfs(window: &[i16]) -> f32 {
    let r = rms(window);
    if r <= 1e-10 {
        return DBFS_FLOOR;
    }
    (20.0 * r.log10()).max(DBFS_FLOOR)
}
