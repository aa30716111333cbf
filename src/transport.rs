//! Local-transport capability: the few things the engine needs from the
//! audio server that owns the transport.

/// Transport position record, mirroring the JACK position struct field for
/// field. Queried fresh on every hook invocation, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub frame: u32,
    pub frame_rate: u32,
    /// Whether the bar/beat/tick fields below carry meaningful data.
    pub valid_bbt: bool,
    pub bar: i32,
    pub beat: i32,
    pub tick: i32,
    pub bar_start_tick: f64,
    pub beats_per_bar: f32,
    pub beat_type: f32,
    pub ticks_per_beat: f64,
    pub beats_per_minute: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Rolling,
    Looping,
    Starting,
}

impl TransportState {
    pub fn is_rolling(self) -> bool {
        matches!(self, Self::Rolling | Self::Looping)
    }
}

/// What the engine is allowed to do with the local transport.
///
/// All operations degrade to no-ops (`query` to `None`) once the client is
/// gone; the engine checks nothing beyond that.
pub trait Transport {
    /// Current transport state and position, or `None` when no client is
    /// open.
    fn query(&self) -> Option<(TransportState, Position)>;

    fn start(&self);

    fn stop(&self);

    /// Drop and re-acquire the timebase-master role so the next generator
    /// invocation stamps positions from fresh values.
    fn reset_timebase(&self);
}
