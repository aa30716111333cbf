//! Distributed-timeline capability over Ableton Link.
//!
//! The engine only ever captures a session snapshot, mutates tempo /
//! play-state / beat-alignment on it and commits it back, so that is the
//! whole trait surface. `LinkTimeline` is the production implementation on
//! top of `rusty_link`; the engine tests substitute an in-process fake.

use rusty_link::{AblLink, SessionState};

/// A captured, mutable, committable view of the shared timeline.
pub trait TimelineSnapshot {
    fn tempo(&self) -> f64;

    fn is_playing(&self) -> bool;

    fn set_tempo(&mut self, bpm: f64, at_micros: i64);

    fn set_is_playing(&mut self, playing: bool, at_micros: u64);

    /// Forcibly re-align the timeline so `beat` falls at `at_micros`,
    /// phase-locked to `quantum`.
    fn force_beat_at_time(&mut self, beat: f64, at_micros: u64, quantum: f64);
}

/// The shared timeline session itself.
pub trait Timeline {
    type Snapshot: TimelineSnapshot;

    /// Capture from an application thread (may block briefly).
    fn capture_app(&self) -> Self::Snapshot;

    fn commit_app(&self, snapshot: &Self::Snapshot);

    /// Lower-latency capture variant safe from a real-time context.
    fn capture_audio(&self) -> Self::Snapshot;

    fn commit_audio(&self, snapshot: &Self::Snapshot);

    /// Monotonic session clock in microseconds.
    fn micros(&self) -> i64;
}

/// Ableton Link implementation.
pub struct LinkTimeline {
    link: AblLink,
}

impl LinkTimeline {
    pub fn new(link: AblLink) -> Self {
        Self { link }
    }

    pub fn enable(&self, enable: bool) {
        self.link.enable(enable);
    }

    pub fn num_peers(&self) -> u64 {
        self.link.num_peers()
    }
}

pub struct LinkSnapshot(SessionState);

impl TimelineSnapshot for LinkSnapshot {
    fn tempo(&self) -> f64 {
        self.0.tempo()
    }

    fn is_playing(&self) -> bool {
        self.0.is_playing()
    }

    fn set_tempo(&mut self, bpm: f64, at_micros: i64) {
        self.0.set_tempo(bpm, at_micros);
    }

    fn set_is_playing(&mut self, playing: bool, at_micros: u64) {
        self.0.set_is_playing(playing, at_micros as i64);
    }

    fn force_beat_at_time(&mut self, beat: f64, at_micros: u64, quantum: f64) {
        self.0.force_beat_at_time(beat, at_micros as i64, quantum);
    }
}

impl Timeline for LinkTimeline {
    type Snapshot = LinkSnapshot;

    fn capture_app(&self) -> LinkSnapshot {
        let mut state = SessionState::new();
        self.link.capture_app_session_state(&mut state);
        LinkSnapshot(state)
    }

    fn commit_app(&self, snapshot: &LinkSnapshot) {
        self.link.commit_app_session_state(&snapshot.0);
    }

    fn capture_audio(&self) -> LinkSnapshot {
        let mut state = SessionState::new();
        self.link.capture_audio_session_state(&mut state);
        LinkSnapshot(state)
    }

    fn commit_audio(&self, snapshot: &LinkSnapshot) {
        self.link.commit_audio_session_state(&snapshot.0);
    }

    fn micros(&self) -> i64 {
        self.link.clock_micros()
    }
}
