//! Level-triggered events for the main/worker slot handoff.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut s = self.state.lock().unwrap();
        *s = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.state.lock().unwrap() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    pub fn wait(&self) {
        let mut s = self.state.lock().unwrap();
        while !*s {
            s = self.cond.wait(s).unwrap();
        }
    }

    /// Waits until the event is set or `timeout` elapses; true when set.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let s = self.state.lock().unwrap();
        let (s, _) = self
            .cond
            .wait_timeout_while(s, timeout, |set| !*set)
            .unwrap();
        *s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_reset_isset() {
        let ev = Event::new();
        assert!(!ev.is_set());
        ev.set();
        assert!(ev.is_set());
        ev.reset();
        assert!(!ev.is_set());
    }

    #[test]
    fn timed_wait_times_out_when_unset() {
        let ev = Event::new();
        assert!(!ev.timed_wait(Duration::from_millis(10)));
    }

    #[test]
    fn timed_wait_returns_immediately_when_set() {
        let ev = Event::new();
        ev.set();
        assert!(ev.timed_wait(Duration::from_millis(0)));
    }

    #[test]
    fn wait_wakes_on_cross_thread_set() {
        let ev = Arc::new(Event::new());
        let ev2 = Arc::clone(&ev);
        let waiter = thread::spawn(move || {
            ev2.wait();
        });
        thread::sleep(Duration::from_millis(5));
        ev.set();
        waiter.join().unwrap();
        assert!(ev.is_set());
    }
}
