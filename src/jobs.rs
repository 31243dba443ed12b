//! Global job queue feeding the worker threads. Reactors enqueue one job per
//! complete message; workers block on the condition variable until a job or a
//! termination sentinel arrives.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::handler::{ConnContext, Direction, Handler, Tuner, Verdict};
use crate::logging::{self, Logger};

/// One complete message bound for a worker. Holds a reference to the
/// connection context so the channel identity stays valid even if the
/// connection dies before the job runs.
pub(crate) struct Job {
    context: Arc<ConnContext>,
    handler: Arc<dyn Handler>,
    payload: Vec<u8>,
}

impl Job {
    #[inline]
    pub(crate) fn new(context: Arc<ConnContext>, handler: Arc<dyn Handler>, payload: Vec<u8>) -> Job {
        Job {
            context,
            handler,
            payload,
        }
    }

    /// Runs the message handler and mirrors the reactor's verdict handling:
    /// abort drops the connection at once, finish closes it gracefully.
    pub(crate) fn run(&self) {
        match self.handler.on_message(&self.context, &self.payload) {
            Verdict::Continue => {}
            Verdict::Abort => {
                let error = io::Error::new(io::ErrorKind::Other, "message handler aborted");
                self.handler.on_error(&self.context, Direction::Read, &error);
                let _ = self.context.disconnect(false);
            }
            Verdict::Finish => {
                let _ = self.context.disconnect(true);
            }
        }
    }
}

/// FIFO of jobs; `None` entries are termination sentinels, one per worker.
pub(crate) struct JobQueue {
    jobs: Mutex<VecDeque<Option<Job>>>,
    ready: Condvar,
}

impl JobQueue {
    pub(crate) fn new() -> JobQueue {
        JobQueue {
            jobs: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, job: Option<Job>) {
        let mut jobs = self.jobs.lock();
        jobs.push_back(job);
        self.ready.notify_one();
    }

    /// Blocks until a job or a sentinel is available. `None` means the worker
    /// must terminate.
    pub(crate) fn get(&self) -> Option<Job> {
        let mut jobs = self.jobs.lock();
        loop {
            match jobs.pop_front() {
                Some(entry) => return entry,
                None => self.ready.wait(&mut jobs),
            }
        }
    }

    /// Drops every queued job, sentinels included. Used during shutdown.
    pub(crate) fn dump(&self) {
        self.jobs.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.jobs.lock().len()
    }
}

/// Worker thread body: consume jobs until the sentinel arrives.
pub(crate) fn worker_loop(queue: &JobQueue, tuner: Option<&Arc<dyn Tuner>>, log: &Logger) {
    if let Some(tuner) = tuner {
        if !tuner.on_job_thread_initialize() {
            logging::error!(log, "job thread initialization failed");
            return;
        }
    }

    while let Some(job) = queue.get() {
        job.run();
    }

    if let Some(tuner) = tuner {
        tuner.on_job_thread_shutdown();
    }

    logging::debug!(log, "job worker exiting");
}
