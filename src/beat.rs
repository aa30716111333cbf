//! Frame-position to bar/beat/tick arithmetic.
//!
//! Both the timebase generator and the reconciler preview positions through
//! these functions, so the two call sites always agree on bar numbering.

use crate::transport::Position;

/// Default tick resolution when the incoming position carries no
/// bar/beat/tick metadata.
pub const TICKS_PER_BEAT: f64 = 960.0;

/// Default meter denominator used alongside [`TICKS_PER_BEAT`].
pub const BEAT_TYPE: f32 = 4.0;

/// 1-based bar/beat plus tick offset within the beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarBeatTick {
    pub bar: i32,
    pub beat: i32,
    pub tick: i32,
}

/// Maps a raw frame count onto bar/beat/tick at the given tempo and meter.
///
/// Elapsed beats are `tempo * frame / (60 * frame_rate)`; bars count groups
/// of `beats_per_bar` beats. Bar and beat come out 1-based, the way JACK
/// position records (and humans) count them.
pub fn bar_beat_tick(
    frame: u32,
    frame_rate: u32,
    tempo: f64,
    beats_per_bar: f64,
    ticks_per_beat: f64,
) -> BarBeatTick {
    let beats_per_bar = beats_per_bar.max(1.0);
    let beats = elapsed_beats(frame, frame_rate, tempo);
    let bar = (beats / beats_per_bar).floor();
    let beat = beats - bar * beats_per_bar;
    BarBeatTick {
        bar: bar as i32 + 1,
        beat: beat as i32 + 1,
        tick: (ticks_per_beat * beat.fract()) as i32,
    }
}

/// Total beats elapsed at `frame` for the given tempo.
pub fn elapsed_beats(frame: u32, frame_rate: u32, tempo: f64) -> f64 {
    tempo * f64::from(frame) / (60.0 * f64::from(frame_rate))
}

/// Beat offset of a transport position relative to the start of its *next*
/// bar, i.e. always negative-biased.
///
/// Handing this value to the session's `force_beat_at_time` makes the
/// aligned beat fall exactly on the next bar line instead of mid-bar. When
/// the position carries no valid bar/beat/tick data the beat is derived
/// from the raw frame and folded modulo the quantum.
pub fn signed_beat(pos: &Position, tempo: f64, quantum: f64) -> f64 {
    if pos.valid_bbt {
        f64::from(pos.beat - 1) + f64::from(pos.tick) / pos.ticks_per_beat
            - f64::from(pos.beats_per_bar)
    } else {
        let quantum = quantum.max(1.0);
        elapsed_beats(pos.frame, pos.frame_rate, tempo) % quantum - quantum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn frame_zero_is_bar_one_beat_one() {
        let bbt = bar_beat_tick(0, 48_000, 120.0, 4.0, TICKS_PER_BEAT);
        assert_eq!(bbt, BarBeatTick { bar: 1, beat: 1, tick: 0 });
    }

    #[test]
    fn one_second_at_120_is_beat_three() {
        // 120 bpm = 2 beats per second
        let bbt = bar_beat_tick(48_000, 48_000, 120.0, 4.0, TICKS_PER_BEAT);
        assert_eq!(bbt, BarBeatTick { bar: 1, beat: 3, tick: 0 });
    }

    #[test]
    fn bar_rolls_over_after_quantum_beats() {
        // 4 beats at 120 bpm = 2 seconds
        let bbt = bar_beat_tick(96_000, 48_000, 120.0, 4.0, TICKS_PER_BEAT);
        assert_eq!(bbt, BarBeatTick { bar: 2, beat: 1, tick: 0 });
    }

    #[test]
    fn quantum_below_one_is_clamped() {
        let a = bar_beat_tick(48_000, 48_000, 120.0, 0.0, TICKS_PER_BEAT);
        let b = bar_beat_tick(48_000, 48_000, 120.0, 1.0, TICKS_PER_BEAT);
        assert_eq!(a, b);
        assert_eq!(a.bar, 3);
        assert_eq!(a.beat, 1);
    }

    #[test]
    fn round_trip_reconstructs_elapsed_beats() {
        let (frame_rate, tempo, quantum) = (44_100, 133.7, 7.0);
        for frame in [0_u32, 1, 4_410, 44_100, 123_456, 1_000_000] {
            let beats = elapsed_beats(frame, frame_rate, tempo);
            let bbt = bar_beat_tick(frame, frame_rate, tempo, quantum, TICKS_PER_BEAT);
            let rebuilt = f64::from(bbt.bar - 1) * quantum
                + f64::from(bbt.beat - 1)
                + f64::from(bbt.tick) / TICKS_PER_BEAT;
            // tick truncation loses less than one tick of resolution
            assert_abs_diff_eq!(rebuilt, beats, epsilon = 1.0 / TICKS_PER_BEAT);
        }
    }

    #[test]
    fn signed_beat_is_negative_biased_to_next_bar() {
        let mut pos = Position::default();
        pos.valid_bbt = true;
        pos.bar = 3;
        pos.beat = 2;
        pos.tick = 480;
        pos.beats_per_bar = 4.0;
        pos.ticks_per_beat = TICKS_PER_BEAT;
        // 1.5 beats into the bar, 4 beats per bar
        assert_abs_diff_eq!(signed_beat(&pos, 120.0, 4.0), -2.5);
    }

    #[test]
    fn signed_beat_on_a_bar_line_has_zero_phase() {
        let mut pos = Position::default();
        pos.valid_bbt = true;
        pos.bar = 2;
        pos.beat = 1;
        pos.tick = 0;
        pos.beats_per_bar = 4.0;
        pos.ticks_per_beat = TICKS_PER_BEAT;
        let beat = signed_beat(&pos, 120.0, 4.0);
        assert_abs_diff_eq!(beat, -4.0);
        assert_abs_diff_eq!(beat.rem_euclid(4.0), 0.0);
    }

    #[test]
    fn signed_beat_falls_back_to_frame_arithmetic() {
        let mut pos = Position::default();
        pos.frame = 48_000;
        pos.frame_rate = 48_000;
        // 2 beats elapsed at 120 bpm, quantum 4 -> 2 - 4
        assert_abs_diff_eq!(signed_beat(&pos, 120.0, 4.0), -2.0);
        // quantum floor applies on the fallback path too
        assert_abs_diff_eq!(signed_beat(&pos, 120.0, 0.5), -1.0);
    }
}
