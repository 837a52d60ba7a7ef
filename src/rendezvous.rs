//! Single-slot rendezvous between a parked caller and the stack thread.

use std::sync::{Arc, Condvar, Mutex};

use crate::endpoint::InetAddr;
use crate::error::Error;

/// Outcome of one blocking socket call, produced on the stack thread.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Completion {
    pub res: Result<usize, Error>,
    pub remote: Option<InetAddr>,
}

impl Completion {
    pub fn ok(n: usize) -> Self {
        Self {
            res: Ok(n),
            remote: None,
        }
    }

    pub fn err(e: Error) -> Self {
        Self {
            res: Err(e),
            remote: None,
        }
    }
}

/// One-shot baton. The resumer may post before the waiter parks; the
/// result is kept until `wait` observes it.
#[derive(Debug, Default)]
pub(crate) struct Rendezvous {
    slot: Mutex<Option<Completion>>,
    cond: Condvar,
}

impl Rendezvous {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Parks the calling thread until a completion is posted, then takes
    /// it.
    pub fn wait(&self) -> Completion {
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(done) = slot.take() {
                return done;
            }
            slot = self.cond.wait(slot).unwrap();
        }
    }

    /// Posts `done` and wakes the waiter. Returns `false` if a
    /// completion was already pending; the slot keeps the first result.
    /// Only the poll-waiter path may legitimately lose this race.
    pub fn post(&self, done: Completion) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(done);
        self.cond.notify_one();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn post_before_wait_is_observed() {
        let r = Rendezvous::new();
        assert!(r.post(Completion::ok(7)));
        assert_eq!(r.wait().res, Ok(7));
    }

    #[test]
    fn wait_parks_until_posted() {
        let r = Rendezvous::new();
        let resumer = r.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            assert!(resumer.post(Completion::err(Error::Protocol)));
        });
        assert_eq!(r.wait().res, Err(Error::Protocol));
        handle.join().unwrap();
    }

    #[test]
    fn second_post_is_dropped() {
        let r = Rendezvous::new();
        assert!(r.post(Completion::ok(1)));
        assert!(!r.post(Completion::ok(2)));
        assert_eq!(r.wait().res, Ok(1));
    }
}
