pub mod beat;
pub mod engine;
pub mod jack_backend;
pub mod timeline;
pub mod transport;

pub use engine::{Engine, ReconcileState};
pub use jack_backend::JackLink;

pub const NAME: &str = "jack_link";
pub const DEFAULT_TEMPO: f64 = 120.0;
pub const DEFAULT_QUANTUM: f64 = 4.0;

/// Identity string reported on startup and by the `status` command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
