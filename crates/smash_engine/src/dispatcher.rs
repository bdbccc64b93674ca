//! Executors that serialize table mutations.
//!
//! Tables are mutated on one logical execution context so observers never
//! see concurrent structural changes. Any single-threaded queue satisfies
//! the contract.

use crate::error::SmashResult;
use parking_lot::Mutex;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use tracing::warn;

/// A unit of work submitted to a dispatcher.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs one at a time, in submission order.
pub trait Dispatcher: Send + Sync {
    /// Submits a job.
    fn dispatch(&self, job: Job);

    /// Blocks until every job submitted so far has run.
    fn flush(&self) {}
}

/// Runs each job inline on the submitting thread, one at a time.
#[derive(Debug, Default)]
pub struct ImmediateDispatcher {
    gate: Mutex<()>,
}

impl ImmediateDispatcher {
    /// Creates an inline dispatcher.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dispatcher for ImmediateDispatcher {
    fn dispatch(&self, job: Job) {
        let _gate = self.gate.lock();
        job();
    }
}

enum Message {
    Run(Job),
    Flush(Sender<()>),
}

/// Runs jobs on a dedicated executor thread.
pub struct ThreadDispatcher {
    sender: Mutex<Option<Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadDispatcher {
    /// Starts the executor thread.
    pub fn new(name: impl Into<String>) -> SmashResult<Self> {
        let (sender, receiver) = mpsc::channel::<Message>();
        let worker = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        Message::Run(job) => job(),
                        Message::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn send(&self, message: Message) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Stops accepting jobs and waits for queued jobs to finish.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            // Dropped from one of its own jobs; the loop exits on its own.
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                warn!("dispatcher thread panicked");
            }
        }
    }
}

impl Dispatcher for ThreadDispatcher {
    fn dispatch(&self, job: Job) {
        if !self.send(Message::Run(job)) {
            warn!("dispatcher is shut down; dropping job");
        }
    }

    fn flush(&self) {
        let (done, wait) = mpsc::channel();
        if self.send(Message::Flush(done)) {
            let _ = wait.recv();
        }
    }
}

impl Drop for ThreadDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
