//! Background durability thread.
//!
//! Appends hand the flusher a handle to the file they wrote and their
//! completion. The flusher drains everything queued, syncs each distinct file
//! once, then fires the batch's callbacks in order. Reclamation runs after a
//! batch that contained deletes or transaction ends.

use std::fs::File;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error};

use crate::error::ErrorCode;
use crate::journal::completion::IoCompletion;
use crate::{Error, Result};

pub(crate) enum FlushRequest {
    Sync {
        file: Arc<File>,
        completion: Box<dyn IoCompletion>,
    },
    Reclaim,
    Shutdown,
}

pub(crate) struct Flusher {
    tx: Sender<FlushRequest>,
    handle: Option<JoinHandle<()>>,
}

impl Flusher {
    pub fn spawn<F>(name: &str, reclaim: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("{name}-flusher"))
            .spawn(move || run(rx, reclaim))
            .map_err(Error::Io)?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> Sender<FlushRequest> {
        self.tx.clone()
    }

    pub fn shutdown(&mut self) {
        let _ = self.tx.send(FlushRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<F: Fn()>(rx: Receiver<FlushRequest>, reclaim: F) {
    let mut files: Vec<Arc<File>> = Vec::new();
    let mut completions: Vec<Box<dyn IoCompletion>> = Vec::new();
    loop {
        let first = match rx.recv() {
            Ok(request) => request,
            Err(_) => break,
        };
        let mut shutdown = false;
        let mut wants_reclaim = false;
        for request in std::iter::once(first).chain(rx.try_iter()) {
            match request {
                FlushRequest::Sync { file, completion } => {
                    if !files.iter().any(|f| Arc::ptr_eq(f, &file)) {
                        files.push(file);
                    }
                    completions.push(completion);
                }
                FlushRequest::Reclaim => wants_reclaim = true,
                FlushRequest::Shutdown => shutdown = true,
            }
        }

        let synced = files.iter().try_for_each(|f| f.sync_data());
        debug!(
            "journal flush: {} files, {} completions",
            files.len(),
            completions.len()
        );
        files.clear();
        match synced {
            Ok(()) => completions.drain(..).for_each(|c| c.done()),
            Err(err) => {
                error!("journal sync failed: {err}");
                let message = err.to_string();
                for completion in completions.drain(..) {
                    completion.on_error(ErrorCode::JournalIoError, message.clone());
                }
            }
        }

        if wants_reclaim {
            reclaim();
        }
        if shutdown {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::completion::FnCompletion;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn batches_fire_callbacks_and_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(File::create(dir.path().join("f")).unwrap());
        let reclaims = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reclaims);
        let mut flusher = Flusher::spawn("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            flusher
                .sender()
                .send(FlushRequest::Sync {
                    file: Arc::clone(&file),
                    completion: Box::new(FnCompletion(move |r: Result<()>| {
                        tx.send((i, r.is_ok())).unwrap();
                    })),
                })
                .unwrap();
        }
        flusher.sender().send(FlushRequest::Reclaim).unwrap();

        let mut seen: Vec<_> = (0..4).map(|_| rx.recv().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec![(0, true), (1, true), (2, true), (3, true)]);

        flusher.shutdown();
        assert!(reclaims.load(Ordering::SeqCst) >= 1);
    }
}
