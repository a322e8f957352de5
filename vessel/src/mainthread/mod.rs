//! Dedicated OS-thread executor.
//!
//! Syscalls that carry per-thread state (setresuid, capset, chdir, umask)
//! must all land on one thread, or transitions made by one component would
//! be invisible to the next. A single worker thread is pinned at startup and
//! closures are dispatched to it over a channel; `run` blocks the caller
//! until the closure finishes and hands back its result.

use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send>;

/// Handle to the pinned worker thread.
pub struct MainThread {
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MainThread {
    /// Spawns the worker. Call once, early, before any privileged work.
    pub fn spawn() -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = std::thread::Builder::new()
            .name("vessel-mainthread".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .expect("failed to spawn mainthread worker");

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Runs `f` on the pinned thread and returns its result.
    pub fn run<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            // The receiver only disappears if the caller panicked; nothing
            // to do with the result then.
            let _ = tx.send(f());
        });

        let sender = self.sender.lock();
        sender
            .as_ref()
            .expect("mainthread already shut down")
            .send(job)
            .expect("mainthread worker gone");
        drop(sender);

        rx.recv().expect("mainthread worker dropped the job")
    }

    /// Stops the worker and waits for it.
    pub fn shutdown(&self) {
        if let Some(sender) = self.sender.lock().take() {
            drop(sender);
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for MainThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
