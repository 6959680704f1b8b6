use std::io::Write;

use crate::selector::Target;

/// Raised when a poll observes more messages than the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthEvent {
    pub target: Target,
    pub previous: usize,
    pub current: usize,
}

impl GrowthEvent {
    pub fn new_messages(&self) -> usize {
        self.current.saturating_sub(self.previous)
    }
}

/// One-shot side effect fired by the sync engine. Implementations must not
/// block; they run while the engine commits a poll.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &GrowthEvent);
}

/// Rings the terminal bell on stderr.
pub struct TerminalBell {
    enabled: bool,
}

impl TerminalBell {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Notifier for TerminalBell {
    fn notify(&self, event: &GrowthEvent) {
        tracing::info!(
            conversation = %event.target,
            new_messages = event.new_messages(),
            "new messages"
        );
        if !self.enabled {
            return;
        }
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(b"\x07");
        let _ = stderr.flush();
    }
}
