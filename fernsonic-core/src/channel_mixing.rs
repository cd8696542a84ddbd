//! Channel up/down-mixing between nodes with different channel counts.

/// Mixes `frames` frames from `src` (with `src_channels`) into `dst` (with
/// `dst_channels`), adding to whatever `dst` already holds.
///
/// Mono fans out to every destination channel; multichannel folds down to
/// mono by averaging. Otherwise the leading `min(src, dst)` channels are
/// mixed through and the remainder dropped or left untouched.
pub fn mix_channels(
    frames: usize,
    src: &[f32],
    src_channels: usize,
    dst: &mut [f32],
    dst_channels: usize,
) {
    debug_assert!(src.len() >= frames * src_channels);
    debug_assert!(dst.len() >= frames * dst_channels);

    if src_channels == dst_channels {
        for i in 0..frames * src_channels {
            dst[i] += src[i];
        }
    } else if src_channels == 1 {
        for frame in 0..frames {
            let sample = src[frame];
            for ch in 0..dst_channels {
                dst[frame * dst_channels + ch] += sample;
            }
        }
    } else if dst_channels == 1 {
        let scale = 1.0 / src_channels as f32;
        for frame in 0..frames {
            let mut acc = 0.0;
            for ch in 0..src_channels {
                acc += src[frame * src_channels + ch];
            }
            dst[frame] += acc * scale;
        }
    } else {
        let shared = src_channels.min(dst_channels);
        for frame in 0..frames {
            for ch in 0..shared {
                dst[frame * dst_channels + ch] += src[frame * src_channels + ch];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_upmix_duplicates() {
        let src = [0.25f32, 0.5];
        let mut dst = [0.0f32; 4];
        mix_channels(2, &src, 1, &mut dst, 2);
        assert_eq!(dst, [0.25, 0.25, 0.5, 0.5]);
    }

    #[test]
    fn test_stereo_downmix_averages() {
        let src = [1.0f32, 0.0, 0.5, 0.5];
        let mut dst = [0.0f32; 2];
        mix_channels(2, &src, 2, &mut dst, 1);
        assert_eq!(dst, [0.5, 0.5]);
    }

    #[test]
    fn test_matching_channels_add() {
        let src = [0.1f32, 0.2];
        let mut dst = [1.0f32, 1.0];
        mix_channels(1, &src, 2, &mut dst, 2);
        assert!((dst[0] - 1.1).abs() < 1e-6);
        assert!((dst[1] - 1.2).abs() < 1e-6);
    }

    #[test]
    fn test_truncating_mix_keeps_leading_channels() {
        let src = [1.0f32, 2.0, 3.0, 4.0];
        let mut dst = [0.0f32; 2];
        mix_channels(1, &src, 4, &mut dst, 2);
        assert_eq!(dst, [1.0, 2.0]);
    }
}
