//! Boundary blending between consecutive converted chunks
//!
//! Each converted segment overlaps the tail of the previous one by the
//! crossfade size. Blending the overlap with a linear ramp keeps both seams
//! continuous so no click is audible between chunks.

/// Blend the previous tail into a new segment.
///
/// * `out[..idx]` is `tail[..idx]` unchanged
/// * the next `tail.len() - idx` samples ramp linearly from the tail to the
///   start of `segment` (ramp endpoints 0 and 1 included)
/// * the rest is `segment` after the overlap, unchanged
///
/// The result has `idx + segment.len()` samples. `segment` must be at least as
/// long as the overlap; a shorter segment is treated as zero-extended.
pub fn blend(tail: &[f32], segment: &[f32], idx: usize) -> Vec<f32> {
    let idx = idx.min(tail.len());
    let fade_len = tail.len() - idx;
    let mut out = Vec::with_capacity(idx + segment.len().max(fade_len));

    out.extend_from_slice(&tail[..idx]);
    for i in 0..fade_len {
        let k = ramp(i, fade_len);
        let next = segment.get(i).copied().unwrap_or(0.0);
        out.push((1.0 - k) * tail[idx + i] + k * next);
    }
    if segment.len() > fade_len {
        out.extend_from_slice(&segment[fade_len..]);
    }
    out
}

/// Position `i` of an inclusive 0..=1 linear ramp of `len` points
fn ramp(i: usize, len: usize) -> f32 {
    if len <= 1 {
        0.0
    } else {
        i as f32 / (len - 1) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_and_untouched_regions() {
        let tail = vec![0.8f32; 6];
        let segment: Vec<f32> = (0..10).map(|v| v as f32 * 0.01).collect();
        let idx = 2;
        let out = blend(&tail, &segment, idx);

        assert_eq!(out.len(), idx + segment.len());
        assert_eq!(&out[..idx], &tail[..idx]);
        let fade_len = tail.len() - idx;
        assert_eq!(&out[idx + fade_len..], &segment[fade_len..]);
    }

    #[test]
    fn test_ramp_endpoints() {
        let tail = vec![1.0f32; 5];
        let segment = vec![0.0f32; 8];
        let out = blend(&tail, &segment, 0);

        // k = 0 at the first overlap sample, k = 1 at the last
        assert_eq!(out[0], 1.0);
        assert_eq!(out[4], 0.0);
        assert!((out[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_overlap_is_monotonic() {
        let tail = vec![-0.5f32; 64];
        let segment = vec![0.5f32; 128];
        let out = blend(&tail, &segment, 16);

        for pair in out[16..64].windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn test_seams_are_continuous() {
        // Tail and segment agree at the boundaries; the blend must not jump by
        // more than one interpolation step anywhere
        let tail: Vec<f32> = (0..32).map(|i| i as f32 / 100.0).collect();
        let segment: Vec<f32> = (0..96).map(|i| 0.32 + i as f32 / 100.0).collect();
        let out = blend(&tail, &segment, 0);

        let step = 0.32 / 31.0 + 0.01;
        for pair in out.windows(2) {
            assert!((pair[1] - pair[0]).abs() <= step + 1e-4);
        }
    }

    #[test]
    fn test_empty_tail_passes_segment_through() {
        let segment = vec![0.25f32; 4];
        assert_eq!(blend(&[], &segment, 0), segment);
    }
}
