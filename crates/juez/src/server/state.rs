//! Application state shared across all handlers.

use std::sync::Arc;

use crate::cancel::CancelSignal;
use crate::grader::Grader;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Grading pipeline and its exercise registry
    pub grader: Arc<Grader>,
    /// Fires when the server begins shutting down
    pub shutdown: CancelSignal,
}

impl AppState {
    pub fn new(grader: Arc<Grader>, shutdown: CancelSignal) -> Self {
        Self { grader, shutdown }
    }
}
