//! The audio-callback half of playback: a shared cursor and the block filler
//! run from the device thread. Nothing here allocates, locks or logs.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Continue,
    Complete,
}

/// Position in interleaved stereo samples, shared between the control thread
/// and the audio callback. The control thread writes only while no stream runs.
#[derive(Debug, Default)]
pub struct PlaybackCursor {
    current: AtomicUsize,
    max: AtomicUsize,
    finished: AtomicBool,
}

impl PlaybackCursor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn max(&self) -> usize {
        self.max.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Rewinds to `current` (clamped into the buffer) and clears completion.
    pub fn reset(&self, current: usize, max: usize) {
        self.max.store(max, Ordering::Release);
        self.current
            .store(current.min(max.saturating_sub(1)), Ordering::Release);
        self.finished.store(false, Ordering::Release);
    }

    pub fn seek(&self, current: usize) {
        let max = self.max();
        self.current
            .store(current.min(max.saturating_sub(1)), Ordering::Release);
        self.finished.store(false, Ordering::Release);
    }

    fn advance(&self, next: usize, max: usize) -> BlockStatus {
        if next >= max {
            self.current.store(max.saturating_sub(1), Ordering::Release);
            self.finished.store(true, Ordering::Release);
            BlockStatus::Complete
        } else {
            self.current.store(next, Ordering::Release);
            BlockStatus::Continue
        }
    }
}

/// Fills one device block of `channels`-wide frames from the rendered tracks,
/// starting at the cursor. Stereo goes to the first two channels, a mono
/// device receives the average and any further channels stay silent.
pub fn fill_block<T>(
    data: &mut [T],
    channels: usize,
    tracks: &[Arc<[f32]>],
    cursor: &PlaybackCursor,
) -> BlockStatus
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    if cursor.is_finished() {
        output_silence(data);
        return BlockStatus::Complete;
    }

    let channels = channels.max(1);
    let start = cursor.current();
    let max = cursor.max();
    let mut frames = 0;

    for (frame, out) in data.chunks_mut(channels).enumerate() {
        let index = start + frame * 2;
        let (mut left, mut right) = (0.0_f32, 0.0_f32);
        for track in tracks {
            if let (Some(l), Some(r)) = (track.get(index), track.get(index + 1)) {
                left += l;
                right += r;
            }
        }

        if channels == 1 {
            out[0] = T::from_sample((left + right) * 0.5);
        } else {
            for (channel, sample) in out.iter_mut().enumerate() {
                let value = match channel {
                    0 => left,
                    1 => right,
                    _ => 0.0,
                };
                *sample = T::from_sample(value);
            }
        }
        frames += 1;
    }

    cursor.advance(start + frames * 2, max)
}

fn output_silence<T>(data: &mut [T])
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    for sample in data.iter_mut() {
        *sample = T::from_sample(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Arc<[f32]> {
        (0..len).map(|index| index as f32).collect::<Vec<_>>().into()
    }

    #[test]
    fn tracks_are_summed_and_short_tracks_go_silent() {
        let tracks = [ramp(8), Arc::from(vec![1.0_f32; 4])];
        let cursor = PlaybackCursor::new();
        cursor.reset(0, 8);

        let mut out = [0.0_f32; 8];
        assert_eq!(
            fill_block(&mut out, 2, &tracks, &cursor),
            BlockStatus::Complete
        );
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn extra_device_channels_are_zeroed() {
        let tracks = [ramp(4)];
        let cursor = PlaybackCursor::new();
        cursor.reset(0, 4);

        let mut out = [9.0_f32; 8];
        fill_block(&mut out, 4, &tracks, &cursor);
        assert_eq!(out, [0.0, 1.0, 0.0, 0.0, 2.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn mono_device_receives_average() {
        let tracks = [Arc::from(vec![1.0_f32, 3.0, 5.0, 7.0])];
        let cursor = PlaybackCursor::new();
        cursor.reset(0, 4);

        let mut out = [0.0_f32; 2];
        fill_block(&mut out, 1, &tracks, &cursor);
        assert_eq!(out, [2.0, 6.0]);
    }

    #[test]
    fn integer_samples_are_converted() {
        let tracks = [Arc::from(vec![1.0_f32, -1.0])];
        let cursor = PlaybackCursor::new();
        cursor.reset(0, 2);

        let mut out = [0_i16; 2];
        fill_block(&mut out, 2, &tracks, &cursor);
        assert!(out[0] > 32_000);
        assert!(out[1] < -32_000);
    }

    #[test]
    fn finished_cursor_outputs_silence_without_moving() {
        let tracks = [ramp(16)];
        let cursor = PlaybackCursor::new();
        cursor.reset(0, 16);

        let mut out = [0.0_f32; 4];
        let mut pulls = 0;
        while fill_block(&mut out, 2, &tracks, &cursor) == BlockStatus::Continue {
            pulls += 1;
        }
        assert_eq!(pulls, 3);
        assert!(cursor.is_finished());
        assert_eq!(cursor.current(), 15);

        out = [1.0; 4];
        assert_eq!(
            fill_block(&mut out, 2, &tracks, &cursor),
            BlockStatus::Complete
        );
        assert_eq!(out, [0.0; 4]);
        assert_eq!(cursor.current(), 15);
    }

    #[test]
    fn seek_is_clamped_and_rearms() {
        let cursor = PlaybackCursor::new();
        cursor.reset(0, 10);
        cursor.advance(10, 10);
        assert!(cursor.is_finished());

        cursor.seek(50);
        assert_eq!(cursor.current(), 9);
        assert!(!cursor.is_finished());
    }
}
