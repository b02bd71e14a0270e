//! Fixed-size worker pool fed by a crossbeam channel.
//!
//! Used per device for host-side staging copies, error processing and command-sent callbacks.
//! A panicking task is logged and does not take its worker down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

use crossbeam::channel::{self, SendError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(name: impl Into<String>, threads: usize) -> std::io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = channel::unbounded::<Task>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let receiver = receiver.clone();
            let thread_name = format!("{name}-{i}");
            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        if catch_unwind(AssertUnwindSafe(task)).is_err() {
                            error!(worker = %thread_name, "pool task panicked");
                        }
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue `task`. Returns `false` once the pool is shut down.
    pub fn push_task<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Queue `task`, or run it on the calling thread if the pool no longer accepts work.
    pub fn push_or_run<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => {
                if let Err(SendError(task)) = sender.send(Box::new(task)) {
                    task();
                }
            }
            None => task(),
        }
    }

    pub fn threads(&self) -> usize {
        self.workers.lock().len()
    }

    /// Run every queued task, then stop the workers.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = std::thread::current().id();
        for handle in workers {
            // A task may drop the last handle to its own pool.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name, "pool worker panicked");
            }
        }
        debug!(pool = %self.name, "thread pool stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("threads", &self.threads())
            .finish()
    }
}
