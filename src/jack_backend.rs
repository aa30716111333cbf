//! JACK adapter: client lifecycle, the real-time callbacks, and the
//! [`Transport`] implementation over the raw client handle.
//!
//! The `jack` crate covers client open/activate and the shutdown
//! notification; the timebase-master and sync callbacks and the transport
//! control calls go through `jack-sys`, since rust-jack does not wrap
//! that part of the API.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use jack::{AsyncClient, Client, ClientOptions, Control, ProcessScope};
use log::{info, warn};
use rusty_link::AblLink;
use thread_priority::{ThreadBuilder, ThreadPriority};

use crate::engine::Engine;
use crate::timeline::LinkTimeline;
use crate::transport::{Position, Transport, TransportState};

/// The engine specialization deployed against JACK and Link.
pub type LinkEngine = Engine<LinkTimeline, JackTransport>;

/// [`Transport`] over a raw JACK client handle.
///
/// The handle is null until a client is opened and nulled again on close
/// or server shutdown; every operation no-ops on a null handle.
pub struct JackTransport {
    client: AtomicPtr<jack_sys::jack_client_t>,
    /// Callback argument (the engine pointer) for re-registering the
    /// timebase callback from `reset_timebase`.
    arg: AtomicPtr<c_void>,
    /// Timebase invocations seen with a new position. Nonzero means the
    /// timebase role is held and must be released before re-acquiring.
    generation: AtomicU64,
}

impl JackTransport {
    pub fn closed() -> Self {
        Self {
            client: AtomicPtr::new(ptr::null_mut()),
            arg: AtomicPtr::new(ptr::null_mut()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.client.load(Ordering::Acquire).is_null()
    }

    fn client(&self) -> Option<*mut jack_sys::jack_client_t> {
        let client = self.client.load(Ordering::Acquire);
        (!client.is_null()).then_some(client)
    }

    fn open(&self, client: *mut jack_sys::jack_client_t, arg: *mut c_void) {
        self.arg.store(arg, Ordering::Release);
        self.client.store(client, Ordering::Release);
    }

    /// Graceful close: give the timebase role back while the client is
    /// still alive, then forget the handle.
    fn close(&self) {
        if let Some(client) = self.client() {
            self.client.store(ptr::null_mut(), Ordering::Release);
            if self.generation.swap(0, Ordering::AcqRel) > 0 {
                unsafe { jack_sys::jack_release_timebase(client) };
            }
        }
    }

    /// Server-initiated shutdown: the client is already gone, just forget
    /// the handle so everything degrades to no-ops.
    fn shutdown(&self) {
        self.client.store(ptr::null_mut(), Ordering::Release);
    }
}

impl Transport for JackTransport {
    fn query(&self) -> Option<(TransportState, Position)> {
        let client = self.client()?;
        let mut pos: jack_sys::jack_position_t = unsafe { std::mem::zeroed() };
        let state = unsafe { jack_sys::jack_transport_query(client, &mut pos) };
        Some((state_from_raw(state), position_from_raw(&pos)))
    }

    fn start(&self) {
        if let Some(client) = self.client() {
            unsafe { jack_sys::jack_transport_start(client) };
        }
    }

    fn stop(&self) {
        if let Some(client) = self.client() {
            unsafe { jack_sys::jack_transport_stop(client) };
        }
    }

    fn reset_timebase(&self) {
        let Some(client) = self.client() else { return };
        if self.generation.swap(0, Ordering::AcqRel) > 0 {
            unsafe { jack_sys::jack_release_timebase(client) };
        }
        let arg = self.arg.load(Ordering::Acquire);
        unsafe {
            jack_sys::jack_set_timebase_callback(client, 0, Some(timebase_callback), arg);
        }
    }
}

fn state_from_raw(state: jack_sys::jack_transport_state_t) -> TransportState {
    match state {
        jack_sys::JackTransportRolling => TransportState::Rolling,
        jack_sys::JackTransportLooping => TransportState::Looping,
        jack_sys::JackTransportStarting => TransportState::Starting,
        _ => TransportState::Stopped,
    }
}

fn position_from_raw(pos: &jack_sys::jack_position_t) -> Position {
    Position {
        frame: pos.frame,
        frame_rate: pos.frame_rate,
        valid_bbt: pos.valid & jack_sys::JackPositionBBT != 0,
        bar: pos.bar,
        beat: pos.beat,
        tick: pos.tick,
        bar_start_tick: pos.bar_start_tick,
        beats_per_bar: pos.beats_per_bar,
        beat_type: pos.beat_type,
        ticks_per_beat: pos.ticks_per_beat,
        beats_per_minute: pos.beats_per_minute,
    }
}

/// Timebase master: stamp every position query with bar/beat/tick.
/// `arg` is the engine pointer handed out in [`JackLink::start`], kept
/// alive until after the client is deactivated.
unsafe extern "C" fn timebase_callback(
    _state: jack_sys::jack_transport_state_t,
    _nframes: jack_sys::jack_nframes_t,
    pos: *mut jack_sys::jack_position_t,
    new_pos: c_int,
    arg: *mut c_void,
) {
    let engine = &*(arg as *const LinkEngine);
    let raw = &mut *pos;

    let mut position = position_from_raw(raw);
    engine.timebase(&mut position);

    raw.valid = jack_sys::JackPositionBBT;
    raw.bar = position.bar;
    raw.beat = position.beat;
    raw.tick = position.tick;
    raw.beats_per_bar = position.beats_per_bar;
    raw.beat_type = position.beat_type;
    raw.ticks_per_beat = position.ticks_per_beat;
    raw.beats_per_minute = position.beats_per_minute;

    if new_pos != 0 {
        engine.transport().generation.fetch_add(1, Ordering::Relaxed);
    }
}

/// Slow-sync callback: fires while the transport is starting; aligns the
/// Link timeline to the local quantum position, then reports ready.
unsafe extern "C" fn sync_callback(
    state: jack_sys::jack_transport_state_t,
    pos: *mut jack_sys::jack_position_t,
    arg: *mut c_void,
) -> c_int {
    if state == jack_sys::JackTransportStarting {
        let engine = &*(arg as *const LinkEngine);
        engine.sync_starting(&position_from_raw(&*pos));
    }
    1
}

struct Process;

impl jack::ProcessHandler for Process {
    // The audio path is untouched, this client only owns the timebase.
    fn process(&mut self, _: &Client, _: &ProcessScope) -> Control {
        Control::Continue
    }
}

struct Notifications {
    engine: Arc<LinkEngine>,
}

impl jack::NotificationHandler for Notifications {
    unsafe fn shutdown(&mut self, status: jack::ClientStatus, reason: &str) {
        warn!("JACK shutdown: {reason} ({status:?})");
        self.engine.transport().shutdown();
        self.engine.stop();
    }
}

/// The running bridge: Link session, JACK client, reconciler thread.
pub struct JackLink {
    engine: Arc<LinkEngine>,
    /// Strong reference handed to the C callbacks; reclaimed in `close`.
    callback_arg: *const LinkEngine,
    client: Option<AsyncClient<Notifications, Process>>,
    worker: Option<JoinHandle<()>>,
}

impl JackLink {
    /// Open the JACK client, enable Link and start the reconciler.
    ///
    /// A rejected client open is terminal for this instance; nothing is
    /// left running.
    pub fn start(name: &str, tempo: f64, quantum: f64) -> Result<Self, jack::Error> {
        let engine = Arc::new_cyclic(|weak: &Weak<LinkEngine>| {
            let mut link = AblLink::new(tempo);
            let cb = weak.clone();
            link.set_num_peers_callback(move |npeers| {
                if let Some(engine) = cb.upgrade() {
                    engine.peers_changed(npeers);
                }
            });
            let cb = weak.clone();
            link.set_tempo_callback(move |tempo| {
                if let Some(engine) = cb.upgrade() {
                    engine.tempo_changed(tempo);
                }
            });
            let cb = weak.clone();
            link.set_start_stop_callback(move |playing| {
                if let Some(engine) = cb.upgrade() {
                    engine.playing_changed(playing);
                }
            });
            link.enable_start_stop_sync(true);
            Engine::new(LinkTimeline::new(link), JackTransport::closed(), tempo, quantum)
        });

        let (client, _status) = Client::new(name, ClientOptions::NO_START_SERVER)?;
        info!("{name}: client open, sample rate {} Hz", client.sample_rate());

        let callback_arg = Arc::into_raw(Arc::clone(&engine));
        let raw_client = client.raw() as *mut jack_sys::jack_client_t;
        engine.transport().open(raw_client, callback_arg as *mut c_void);
        unsafe {
            jack_sys::jack_set_sync_callback(
                raw_client,
                Some(sync_callback),
                callback_arg as *mut c_void,
            );
        }

        let client = match client.activate_async(
            Notifications { engine: Arc::clone(&engine) },
            Process,
        ) {
            Ok(client) => client,
            Err(err) => {
                engine.transport().shutdown();
                unsafe { drop(Arc::from_raw(callback_arg)) };
                return Err(err);
            }
        };

        engine.timeline().enable(true);
        engine.transport().reset_timebase();

        let worker = {
            let engine = Arc::clone(&engine);
            ThreadBuilder::default()
                .name("jack-link-reconcile")
                .priority(ThreadPriority::Min)
                .spawn(move |_| engine.run())
                .expect("unable to start reconciler thread")
        };

        Ok(Self {
            engine,
            callback_arg,
            client: Some(client),
            worker: Some(worker),
        })
    }

    pub fn engine(&self) -> &LinkEngine {
        &self.engine
    }

    /// Whether the JACK client is still open.
    pub fn active(&self) -> bool {
        self.engine.transport().is_open()
    }

    /// Stop the reconciler, disable Link and close the JACK client.
    /// Callbacks landing mid-teardown observe a closed transport and
    /// no-op.
    pub fn close(&mut self) {
        self.engine.stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        self.engine.timeline().enable(false);
        self.engine.transport().close();

        if let Some(client) = self.client.take() {
            let _ = client.deactivate();
            // The callbacks are gone with the client; reclaim their
            // engine reference.
            unsafe { drop(Arc::from_raw(self.callback_arg)) };
        }
    }
}

impl Drop for JackLink {
    fn drop(&mut self) {
        self.close();
    }
}
