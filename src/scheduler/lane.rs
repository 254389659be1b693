use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single dedicated worker thread draining a FIFO queue of jobs.
///
/// Everything submitted to one lane runs strictly one after another, which is
/// what makes it safe to share a single-threaded engine through a lane. The
/// worker exits once the lane is dropped and its queue has drained.
pub(crate) struct Lane {
    sender: Sender<Job>,
    _worker: JoinHandle<()>,
}

impl Lane {
    pub(crate) fn spawn(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();

        let worker = thread::Builder::new()
            .name(format!("lane-{name}"))
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })?;

        Ok(Self {
            sender,
            _worker: worker,
        })
    }

    /// Queues a job, handing it back if the worker is gone.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Job> {
        self.sender.send(job).map_err(|err| err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_jobs_run_in_order() {
        let lane = Lane::spawn("order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = mpsc::channel();

        for i in 0..10 {
            let seen = seen.clone();
            lane.submit(Box::new(move || seen.lock().unwrap().push(i)))
                .ok()
                .unwrap();
        }

        lane.submit(Box::new(move || done_tx.send(()).unwrap()))
            .ok()
            .unwrap();
        done_rx.recv().unwrap();

        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_thread_is_named() {
        let lane = Lane::spawn("javac").unwrap();
        let (tx, rx) = mpsc::channel();

        lane.submit(Box::new(move || {
            let name = thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        }))
        .ok()
        .unwrap();

        assert_eq!(rx.recv().unwrap().as_deref(), Some("lane-javac"));
    }
}
