//! The transport synchronization engine.
//!
//! Bridges two transport authorities that can each originate changes: the
//! local JACK transport and the shared Link timeline. Local edits are
//! forwarded onto the timeline by the background reconciler, timeline
//! edits arrive through the Link callbacks, and the `playing_req` flag
//! fences the two directions so a forwarded change is not reapplied when
//! it echoes back.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_utils::atomic::AtomicCell;
use log::{debug, info};

use crate::beat::{self, BEAT_TYPE, TICKS_PER_BEAT};
use crate::timeline::{Timeline, TimelineSnapshot as _};
use crate::transport::{Position, Transport, TransportState};


/// Tempo/quantum differences below this are floating-point noise, not a
/// correction worth committing.
pub const EPSILON: f64 = 0.01;

/// The reconciler wakes at least this often even without a callback, so
/// transport edits made behind our back still converge.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Last-known agreement between the two transports, all behind one lock.
#[derive(Debug)]
pub struct ReconcileState {
    pub tempo: f64,
    /// Single-slot mailbox, latest wins. Drained by the timebase hook.
    pub tempo_req: Option<f64>,
    /// Bar length in beats, >= 1.
    pub quantum: f64,
    pub npeers: u64,
    pub playing: bool,
    /// Feedback fence: a play/stop change we forwarded is still in flight.
    /// Guards one request at a time; a second local request before the
    /// first echo arrives clears it early. Known race, the periodic pass
    /// reconverges.
    pub playing_req: bool,
    pub running: bool,
}

pub struct Engine<T, P> {
    timeline: T,
    transport: P,
    state: Mutex<ReconcileState>,
    cond: Condvar,
    // Lock-free mirrors of `state.tempo` / `state.quantum` for the
    // real-time timebase hook. Written only while the state lock is held.
    tempo: AtomicCell<f64>,
    quantum: AtomicCell<f64>,
}

impl<T: Timeline, P: Transport> Engine<T, P> {
    pub fn new(timeline: T, transport: P, tempo: f64, quantum: f64) -> Self {
        let quantum = quantum.max(1.0);
        Self {
            timeline,
            transport,
            state: Mutex::new(ReconcileState {
                tempo,
                tempo_req: None,
                quantum,
                npeers: 0,
                playing: false,
                playing_req: false,
                running: true,
            }),
            cond: Condvar::new(),
            tempo: AtomicCell::new(tempo),
            quantum: AtomicCell::new(quantum),
        }
    }

    pub fn timeline(&self) -> &T {
        &self.timeline
    }

    pub fn transport(&self) -> &P {
        &self.transport
    }

    pub fn tempo(&self) -> f64 {
        self.tempo.load()
    }

    pub fn quantum(&self) -> f64 {
        self.quantum.load()
    }

    pub fn num_peers(&self) -> u64 {
        self.lock().npeers
    }

    pub fn playing(&self) -> bool {
        self.lock().playing
    }

    fn lock(&self) -> MutexGuard<'_, ReconcileState> {
        self.state.lock().expect("reconcile state poisoned")
    }

    // --- Link callbacks (invoked on the Link notification thread) ---

    pub fn peers_changed(&self, npeers: u64) {
        let mut st = self.lock();
        info!("peers: {npeers}");
        st.npeers = npeers;
        self.transport.reset_timebase();
        self.cond.notify_one();
    }

    pub fn tempo_changed(&self, tempo: f64) {
        let mut st = self.lock();
        info!("tempo: {tempo:.2}");
        // Not applied here: an in-flight local edit may still be draining.
        // The timebase hook or the next reconciler pass picks it up.
        st.tempo_req = Some(tempo);
        self.transport.reset_timebase();
        self.cond.notify_one();
    }

    pub fn playing_changed(&self, playing: bool) {
        let mut st = self.lock();
        if st.playing_req {
            // Echo of a change this side forwarded; consume the fence.
            debug!("playing: {playing} (echo)");
            st.playing_req = false;
            return;
        }
        info!("playing: {playing}");
        st.playing_req = true;
        st.playing = playing;
        self.transport_reset(&st);
        self.cond.notify_one();
    }

    /// Start or stop the local transport to match `st.playing`,
    /// pre-aligning the timeline to the local bar position when a
    /// peer-visible start is pending.
    fn transport_reset(&self, st: &ReconcileState) {
        if st.playing_req && st.playing && st.npeers > 0 {
            if let Some((state, pos)) = self.transport.query() {
                if state == TransportState::Stopped {
                    let beat = beat::signed_beat(&pos, st.tempo, st.quantum);
                    let mut snapshot = self.timeline.capture_app();
                    snapshot.force_beat_at_time(beat, self.timeline.micros() as u64, st.quantum);
                    self.timeline.commit_app(&snapshot);
                }
            }
        }
        if st.playing {
            self.transport.start();
        } else {
            self.transport.stop();
        }
    }

    // --- Public control surface ---

    /// Request a new tempo. With peers present the timeline is the
    /// authority and the change goes straight there; without peers it is
    /// parked in the mailbox for the next timebase hook invocation.
    pub fn request_tempo(&self, tempo: f64) {
        let mut st = self.lock();
        if st.npeers > 0 {
            drop(st);
            let mut snapshot = self.timeline.capture_app();
            snapshot.set_tempo(tempo, self.timeline.micros());
            self.timeline.commit_app(&snapshot);
        } else {
            st.tempo_req = Some(tempo);
            self.transport.reset_timebase();
            self.cond.notify_one();
        }
    }

    /// Request play or stop, with the same peer-presence branch as
    /// [`request_tempo`](Self::request_tempo).
    pub fn request_playing(&self, playing: bool) {
        let mut st = self.lock();
        if st.npeers > 0 {
            drop(st);
            let mut snapshot = self.timeline.capture_app();
            snapshot.set_is_playing(playing, self.timeline.micros() as u64);
            self.timeline.commit_app(&snapshot);
        } else {
            st.playing_req = true;
            st.playing = playing;
            self.transport_reset(&st);
            self.cond.notify_one();
        }
    }

    // --- Real-time hooks (invoked from the audio server threads) ---

    /// Timebase generator: stamp `pos` with bar/beat/tick and tempo.
    ///
    /// Runs once per process cycle and must not block. The pending-tempo
    /// mailbox is drained opportunistically; when the lock is contested
    /// the stamp uses the previous tempo and the next cycle retries.
    pub fn timebase(&self, pos: &mut Position) {
        if let Ok(mut st) = self.state.try_lock() {
            if let Some(bpm) = st.tempo_req.take() {
                st.tempo = bpm;
                self.tempo.store(bpm);
            }
        }

        let bpm = self.tempo.load();
        let beats_per_bar = self.quantum.load().max(1.0);
        let (ticks_per_beat, beat_type) = if pos.valid_bbt {
            (pos.ticks_per_beat, pos.beat_type)
        } else {
            (TICKS_PER_BEAT, BEAT_TYPE)
        };

        let bbt = beat::bar_beat_tick(pos.frame, pos.frame_rate, bpm, beats_per_bar, ticks_per_beat);
        pos.valid_bbt = true;
        pos.bar = bbt.bar;
        pos.beat = bbt.beat;
        pos.tick = bbt.tick;
        pos.beats_per_bar = beats_per_bar as f32;
        pos.beat_type = beat_type;
        pos.ticks_per_beat = ticks_per_beat;
        pos.beats_per_minute = bpm;
    }

    /// Transport-start sync: the local transport is about to roll, align
    /// the timeline to its current quantum position. Real-time context,
    /// so a contested lock skips the alignment rather than waiting.
    pub fn sync_starting(&self, pos: &Position) {
        let Ok(st) = self.state.try_lock() else { return };
        if !st.playing || st.playing_req {
            return;
        }
        let beat = beat::signed_beat(pos, st.tempo, st.quantum);
        let quantum = st.quantum;
        drop(st);

        let mut snapshot = self.timeline.capture_audio();
        snapshot.force_beat_at_time(beat, self.timeline.micros() as u64, quantum);
        self.timeline.commit_audio(&snapshot);
    }

    // --- Background reconciler ---

    /// One comparison pass: forward local transport edits onto the
    /// timeline. At most one commit per pass, batching every correction
    /// onto a single captured snapshot.
    pub fn reconcile(&self) {
        let Some((state, pos)) = self.transport.query() else { return };

        let mut st = self.lock();
        if st.npeers == 0 {
            return;
        }

        let rolling = state.is_rolling();
        let mut tempo = None;
        let mut quantum = None;
        let mut playing = None;

        if rolling != st.playing {
            if st.playing_req {
                // Our own start/stop coming back around.
                st.playing_req = false;
            } else {
                playing = Some(rolling);
            }
        }
        if pos.valid_bbt {
            if (st.tempo - pos.beats_per_minute).abs() > EPSILON {
                tempo = Some(pos.beats_per_minute);
            }
            if (st.quantum - f64::from(pos.beats_per_bar)).abs() > EPSILON {
                quantum = Some(f64::from(pos.beats_per_bar).max(1.0));
            }
        }
        if tempo.is_none() && quantum.is_none() && playing.is_none() {
            return;
        }

        // Record the corrections while still holding the lock...
        if let Some(bpm) = tempo {
            st.tempo = bpm;
            self.tempo.store(bpm);
        }
        if let Some(q) = quantum {
            st.quantum = q;
            self.quantum.store(q);
        }
        if let Some(p) = playing {
            st.playing_req = true;
            st.playing = p;
        }
        let (bpm_now, quantum_now, playing_now) = (st.tempo, st.quantum, st.playing);
        drop(st);

        // ...then commit outside it, the commit can stall on the session.
        debug!(
            "reconcile: tempo {tempo:?} quantum {quantum:?} playing {playing:?}"
        );
        let host_time = self.timeline.micros();
        let mut snapshot = self.timeline.capture_app();
        if let Some(bpm) = tempo {
            snapshot.set_tempo(bpm, host_time);
        }
        if quantum.is_some() && playing.is_none() && playing_now {
            // Bar length changed mid-play: re-anchor the phase.
            let beat = beat::signed_beat(&pos, bpm_now, quantum_now);
            snapshot.force_beat_at_time(beat, host_time as u64, quantum_now);
        }
        if let Some(p) = playing {
            if p {
                let beat = beat::signed_beat(&pos, bpm_now, quantum_now);
                snapshot.force_beat_at_time(beat, host_time as u64, quantum_now);
            }
            snapshot.set_is_playing(p, host_time as u64);
        }
        self.timeline.commit_app(&snapshot);
    }

    /// Reconciler loop: one pass per wakeup, woken by any callback or by
    /// the poll timeout.
    pub fn run(&self) {
        info!("reconciler: started");
        loop {
            self.reconcile();
            let st = self.lock();
            if !st.running {
                break;
            }
            let (st, _) = self
                .cond
                .wait_timeout(st, POLL_INTERVAL)
                .expect("reconcile state poisoned");
            if !st.running {
                break;
            }
        }
        info!("reconciler: stopped");
    }

    /// Stop the reconciler loop. Safe to call more than once.
    pub fn stop(&self) {
        let mut st = self.lock();
        st.running = false;
        self.cond.notify_all();
    }
}
