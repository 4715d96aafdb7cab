#![allow(dead_code)]

pub mod entities;
pub mod probes;
pub mod repositories;

pub use entities::{Order, User};
pub use probes::{PhaseRecorder, RecordingTransport};
pub use repositories::{OrderRepository, UserRepository};

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
