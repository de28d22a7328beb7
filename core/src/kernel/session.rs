//! Session & stream layer (spec §4.10). A [`Session`] buffers the events
//! from one `executeStream` call and fans them out to any number of
//! subscribers, replaying the backlog to late joiners before switching
//! them onto the live feed — the same backlog-then-live shape as
//! `ExecCommandSession`'s broadcast channel, generalized to a richer event
//! type and an explicit terminal flag instead of raw PTY bytes.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use engine_protocol::Event;
use parking_lot::Mutex;
use tokio::sync::broadcast;

const BACKLOG_CAPACITY: usize = 1024;

pub struct Session {
    pub id: String,
    pub resource_id: String,
    pub code: String,
    backlog: Mutex<Vec<Event>>,
    sender: broadcast::Sender<Event>,
    terminal: AtomicBool,
    listeners: Mutex<HashSet<String>>,
}

impl Session {
    pub fn new(id: impl Into<String>, resource_id: impl Into<String>, code: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(BACKLOG_CAPACITY);
        Self {
            id: id.into(),
            resource_id: resource_id.into(),
            code: code.into(),
            backlog: Mutex::new(Vec::new()),
            sender,
            terminal: AtomicBool::new(false),
            listeners: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    /// Records `event` in the backlog and broadcasts it to current live
    /// subscribers. Once a terminal event is pushed, further pushes are
    /// rejected (a session has exactly one terminator).
    pub fn push(&self, event: Event) {
        if self.is_terminal() {
            return;
        }
        if event.is_terminal() {
            self.terminal.store(true, Ordering::SeqCst);
        }
        self.backlog.lock().push(event.clone());
        let _ = self.sender.send(event);
    }

    /// Idempotent: subscribing the same `listener_id` twice just returns a
    /// fresh backlog snapshot plus the live receiver again.
    pub fn subscribe(&self, listener_id: impl Into<String>) -> Subscription {
        self.listeners.lock().insert(listener_id.into());
        Subscription {
            backlog: self.backlog.lock().clone().into(),
            live: self.sender.subscribe(),
            finished: self.is_terminal(),
        }
    }

    pub fn unsubscribe(&self, listener_id: &str) {
        self.listeners.lock().remove(listener_id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn transcript(&self) -> Vec<Event> {
        self.backlog.lock().clone()
    }
}

pub struct Subscription {
    backlog: std::collections::VecDeque<Event>,
    live: broadcast::Receiver<Event>,
    finished: bool,
}

impl Subscription {
    /// Returns the next event: backlog first, then live. `None` once the
    /// session has delivered its terminator and the backlog is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.backlog.pop_front() {
            if event.is_terminal() {
                self.finished = true;
            }
            return Some(event);
        }
        if self.finished {
            return None;
        }
        loop {
            match self.live.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[tokio::test]
    async fn late_subscriber_gets_backlog_then_live() {
        let session = Session::new("s1", "ns:k1", "1 + 1");
        session.push(Event::Stream {
            name: engine_protocol::event::StreamName::Stdout,
            text: "2\n".to_string(),
        });

        let mut sub = session.subscribe("listener-a");
        assert!(matches!(sub.recv().await, Some(Event::Stream { .. })));

        session.push(Event::StreamComplete {
            message: "done".to_string(),
            output_count: 1,
        });
        assert!(matches!(sub.recv().await, Some(Event::StreamComplete { .. })));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn push_after_terminal_is_ignored() {
        let session = Session::new("s1", "ns:k1", "code");
        session.push(Event::error("Err", "boom"));
        session.push(Event::StreamComplete {
            message: "should not land".to_string(),
            output_count: 99,
        });
        assert_eq!(session.transcript().len(), 1);
    }

    #[test]
    fn subscribe_is_idempotent_for_same_listener() {
        let session = Session::new("s1", "ns:k1", "code");
        session.subscribe("listener-a");
        session.subscribe("listener-a");
        assert_eq!(session.listener_count(), 1);
    }
}
