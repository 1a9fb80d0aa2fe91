//! Notifications emitted during a flashing run
//!
//! The worker reports through a bounded channel; events arrive in the
//! order they were emitted.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

/// A single notification from the flashing worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Total bytes handled so far; monotonically increasing.
    Progress(usize),
    /// A status line. Unimportant messages may be overwritten in place by
    /// interactive frontends.
    Status { text: String, important: bool },
    /// The run finished, successfully or not. Always the last event.
    Done { text: String, ok: bool },
}

/// Sending half of the notification channel held by the worker.
#[derive(Clone)]
pub struct Notifier {
    tx: Option<SyncSender<Event>>,
}

impl Notifier {
    /// Create a notifier and its receiving end with the given bound.
    pub fn channel(bound: usize) -> (Self, Receiver<Event>) {
        let (tx, rx) = sync_channel(bound);
        (Notifier { tx: Some(tx) }, rx)
    }

    /// A notifier that drops every event.
    pub fn disabled() -> Self {
        Notifier { tx: None }
    }

    pub fn progress(&self, bytes: usize) {
        self.send(Event::Progress(bytes));
    }

    pub fn status(&self, text: impl Into<String>, important: bool) {
        self.send(Event::Status {
            text: text.into(),
            important,
        });
    }

    pub fn done(&self, text: impl Into<String>, ok: bool) {
        self.send(Event::Done {
            text: text.into(),
            ok,
        });
    }

    fn send(&self, event: Event) {
        if let Some(tx) = &self.tx {
            // A dropped receiver means nobody is listening anymore; the
            // run itself should not fail because of that.
            let _ = tx.send(event);
        }
    }
}

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_order() {
        let (notifier, rx) = Notifier::channel(8);
        notifier.progress(0);
        notifier.status("Writing...", true);
        notifier.progress(4096);
        notifier.done("All done!", true);
        drop(notifier);

        let events: Vec<Event> = rx.iter().collect();
        assert_eq!(events[0], Event::Progress(0));
        assert_eq!(events[2], Event::Progress(4096));
        assert!(matches!(events[3], Event::Done { ok: true, .. }));
    }

    #[test]
    fn disabled_notifier_is_silent() {
        let notifier = Notifier::disabled();
        notifier.progress(1);
        notifier.done("x", false);
    }
}
