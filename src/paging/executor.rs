use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;

use crate::{Error, Result};

type Task = Box<dyn FnOnce() + Send>;

/// Runs submitted tasks one at a time, in order, on a dedicated thread.
pub struct SerialExecutor {
    tx: Mutex<Option<Sender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SerialExecutor {
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for task in rx {
                    task();
                }
            })
            .map_err(Error::Io)?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queues `task`. Returns false once the executor has shut down.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> bool {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match tx.as_ref() {
            Some(tx) => tx.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Waits until every task queued before this call has run.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        if !self.execute(move || {
            let _ = done_tx.send(());
        }) {
            return true;
        }
        done_rx.recv_timeout(timeout).is_ok()
    }

    /// Runs the queued tasks, then stops the thread.
    pub fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                debug!("executor shut down from its own thread");
                return;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn tasks_run_in_submission_order() {
        let executor = SerialExecutor::spawn("test-executor").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let seen = Arc::clone(&seen);
            assert!(executor.execute(move || seen.lock().unwrap().push(i)));
        }
        assert!(executor.flush(Duration::from_secs(5)));
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());

        executor.shutdown();
        assert!(!executor.execute(|| {}));
    }
}
