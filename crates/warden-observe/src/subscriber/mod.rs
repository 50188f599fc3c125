mod view;
pub use view::{View, log_event, message_for};

use warden_model::{Subscribe, TaskEvent};

/// Writes every scheduler event to `tracing` at a level matching its severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSubscriber;

impl LogSubscriber {
    pub fn new() -> Self {
        Self
    }
}

impl Subscribe for LogSubscriber {
    fn on_event(&self, event: &TaskEvent) {
        log_event(event);
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
