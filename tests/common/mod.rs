//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};

use arcana::{Cancellation, ManualDispatcher};

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Runs both dispatchers until neither has work left.
pub fn drain2(first: &ManualDispatcher, second: &ManualDispatcher) {
    while first.tick(Cancellation::none()) || second.tick(Cancellation::none()) {}
}

/// A shared append-only text buffer for ordering assertions.
#[derive(Clone, Default)]
pub struct TraceLog {
    buffer: Arc<Mutex<String>>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, text: &str) {
        self.buffer.lock().unwrap().push_str(text);
    }

    pub fn contents(&self) -> String {
        self.buffer.lock().unwrap().clone()
    }
}
