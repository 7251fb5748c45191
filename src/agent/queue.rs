//! The serialized onboarding queue: every client registration,
//! deregistration and retransform-on-connect runs as a task on one
//! dedicated worker, strictly one at a time in submission order. That
//! single consumer is what keeps the transformer registry free of
//! concurrent mutation without a lock around it.

use log::warn;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

struct Job {
    task: Task,
    done: mpsc::SyncSender<anyhow::Result<()>>,
}

/// Completion handle of one submitted task.
pub struct TaskHandle {
    done: mpsc::Receiver<anyhow::Result<()>>,
}

impl TaskHandle {
    /// Block the caller until the task finished on the worker.
    pub fn wait(self) -> anyhow::Result<()> {
        self.done
            .recv()
            .unwrap_or_else(|_| Err(anyhow::anyhow!("onboarding worker is gone")))
    }
}

pub struct SerializedQueue {
    jobs: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl SerializedQueue {
    pub fn new() -> Self {
        let (jobs, incoming) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name("twr-onboarding".to_string())
            .spawn(move || {
                while let Ok(job) = incoming.recv() {
                    let result = (job.task)();
                    if let Err(e) = &result {
                        warn!(target: "agent", "onboarding task failed: {e:#}");
                    }
                    _ = job.done.send(result);
                }
            })
            .expect("onboarding worker must start");
        Self {
            jobs: Some(jobs),
            worker: Some(worker),
        }
    }

    pub fn submit(
        &self,
        task: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) -> TaskHandle {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        let job = Job {
            task: Box::new(task),
            done: done_tx,
        };
        _ = self
            .jobs
            .as_ref()
            .expect("queue is alive until dropped")
            .send(job);
        TaskHandle { done: done_rx }
    }
}

impl Default for SerializedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SerializedQueue {
    fn drop(&mut self) {
        // hang up the job channel so the worker drains and exits
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            _ = worker.join();
        }
    }
}
