use std::sync::{Arc, Condvar, Mutex};

/// Why a launch did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Failure {
    /// Label of the launch that failed first.
    pub label: String,
    pub msg: String,
    pub fatal: bool,
}

type Outcome = std::result::Result<(), Failure>;

/// Completion marker of one launch, shared between the dispatching thread, the lane
/// running it and every later launch that depends on it.
#[derive(Clone, Default)]
pub(crate) struct Event {
    inner: Arc<(Mutex<Option<Outcome>>, Condvar)>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("done", &self.is_done())
            .finish()
    }
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self, outcome: Outcome) {
        let (lock, cvar) = &*self.inner;
        let mut slot = match lock.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(outcome);
        cvar.notify_all();
    }

    /// Block until the launch finished.
    pub fn wait(&self) -> Outcome {
        let (lock, cvar) = &*self.inner;
        let mut slot = match lock.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = match cvar.wait(slot) {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn is_done(&self) -> bool {
        self.peek().is_some()
    }

    /// Finished without error.
    pub fn succeeded(&self) -> bool {
        matches!(self.peek(), Some(Ok(())))
    }

    fn peek(&self) -> Option<Outcome> {
        match self.inner.0.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_across_threads() {
        let e = Event::new();
        assert!(!e.is_done());
        let remote = e.clone();
        let handle = std::thread::spawn(move || {
            remote.complete(Err(Failure {
                label: "exp#n0".to_string(),
                msg: "boom".to_string(),
                fatal: false,
            }))
        });
        let outcome = e.wait();
        handle.join().unwrap();
        assert_eq!(outcome.unwrap_err().msg, "boom");
        assert!(e.is_done() && !e.succeeded());
    }
}
