//! Completion callbacks for journal appends.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::ErrorCode;
use crate::{Error, Result};

/// Notified once an appended record is durable, or once the append failed.
///
/// Callbacks run on the journal flusher thread (or inline when sync is disabled
/// for the record class). They must not block on other journal appends.
pub trait IoCompletion: Send {
    fn done(self: Box<Self>);

    fn on_error(self: Box<Self>, code: ErrorCode, message: String);
}

/// Adapter turning a closure into an [`IoCompletion`].
pub struct FnCompletion<F>(pub F)
where
    F: FnOnce(Result<()>) + Send;

impl<F> IoCompletion for FnCompletion<F>
where
    F: FnOnce(Result<()>) + Send,
{
    fn done(self: Box<Self>) {
        (self.0)(Ok(()))
    }

    fn on_error(self: Box<Self>, code: ErrorCode, message: String) {
        (self.0)(Err(Error::from_remote(code.as_i32(), message)))
    }
}

#[derive(Debug)]
enum SyncState {
    Pending,
    Done,
    Failed(ErrorCode, String),
}

/// A latch that blocking appends park on until the flusher signals them.
#[derive(Debug)]
pub struct SyncCompletion {
    state: Mutex<SyncState>,
    cond: Condvar,
}

impl Default for SyncCompletion {
    fn default() -> Self {
        Self {
            state: Mutex::new(SyncState::Pending),
            cond: Condvar::new(),
        }
    }
}

impl SyncCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, next: SyncState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = next;
        self.cond.notify_all();
    }

    /// Blocks until the record is durable. Times out as a journal error so a
    /// wedged flusher cannot hang a caller forever.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (state, result) = self
            .cond
            .wait_timeout_while(state, timeout, |s| matches!(s, SyncState::Pending))
            .unwrap_or_else(|e| e.into_inner());
        if result.timed_out() {
            return Err(Error::JournalIo("timed out waiting for journal sync".into()));
        }
        match &*state {
            SyncState::Done => Ok(()),
            SyncState::Failed(_, message) => Err(Error::JournalIo(message.clone())),
            SyncState::Pending => Err(Error::JournalIo("journal sync did not complete".into())),
        }
    }
}

/// Boxed handle for a shared [`SyncCompletion`].
pub(crate) struct SyncSignal(pub std::sync::Arc<SyncCompletion>);

impl IoCompletion for SyncSignal {
    fn done(self: Box<Self>) {
        self.0.set(SyncState::Done);
    }

    fn on_error(self: Box<Self>, code: ErrorCode, message: String) {
        self.0.set(SyncState::Failed(code, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sync_completion_releases_waiter() {
        let latch = Arc::new(SyncCompletion::new());
        let signal: Box<dyn IoCompletion> = Box::new(SyncSignal(Arc::clone(&latch)));
        let handle = std::thread::spawn(move || signal.done());
        latch.wait(Duration::from_secs(5)).expect("completed");
        handle.join().unwrap();
    }

    #[test]
    fn sync_completion_reports_failure() {
        let latch = Arc::new(SyncCompletion::new());
        Box::new(SyncSignal(Arc::clone(&latch)))
            .on_error(ErrorCode::JournalIoError, "disk full".into());
        let err = latch.wait(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::JournalIo(ref m) if m == "disk full"));
    }

    #[test]
    fn sync_completion_times_out() {
        let latch = SyncCompletion::new();
        assert!(latch.wait(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn closure_completion_sees_result() {
        let (tx, rx) = std::sync::mpsc::channel();
        let cb: Box<dyn IoCompletion> = Box::new(FnCompletion(move |r: Result<()>| {
            tx.send(r.is_ok()).unwrap();
        }));
        cb.done();
        assert!(rx.recv().unwrap());
    }
}
