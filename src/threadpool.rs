//! Fixed-size worker pool for per-virtqueue jobs (spec §2.15).
//!
//! kvmtool's `threadpool__do_job` coalesces repeat signals on an
//! already-queued job so a burst of kicks degenerates to one run instead of
//! a pile-up (`thread_pool__handle_job`'s `signalcount` loop). The same
//! behavior here: a job carries its own `pending` flag, and submitting a
//! job that's already queued just marks it pending-again instead of
//! enqueuing a second run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// One schedulable unit of work. `pending` prevents the same job from being
/// queued twice; a worker re-checks it after running and requeues itself if
/// another kick arrived mid-run.
pub struct Job {
    pending: AtomicBool,
    run: Box<dyn Fn() + Send + Sync>,
}

impl Job {
    pub fn new(run: impl Fn() + Send + Sync + 'static) -> Arc<Job> {
        Arc::new(Job {
            pending: AtomicBool::new(false),
            run: Box::new(run),
        })
    }
}

pub struct ThreadPool {
    workers: Vec<JoinHandle<()>>,
    sender: Sender<Arc<Job>>,
}

impl ThreadPool {
    /// Spawn `thread_count` workers pulling from a shared job queue.
    pub fn new(thread_count: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Arc<Job>>();
        let receiver = Arc::new(std::sync::Mutex::new(receiver));

        let workers = (0..thread_count.max(1))
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("vmm-worker-{id}"))
                    .spawn(move || Self::worker_loop(&receiver))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { workers, sender }
    }

    fn worker_loop(receiver: &Arc<std::sync::Mutex<Receiver<Arc<Job>>>>) {
        loop {
            let job = {
                let rx = receiver.lock().unwrap();
                rx.recv()
            };
            let Ok(job) = job else { return };

            // Clear `pending` before running so a kick arriving mid-run is
            // distinguishable from the kick that got us here; if one
            // arrives, loop and run once more instead of requeueing.
            loop {
                job.pending.store(false, Ordering::Release);
                (job.run)();
                if !job.pending.load(Ordering::Acquire) {
                    break;
                }
            }
        }
    }

    /// Queue `job` for execution. If it is already queued or running, this
    /// only marks it pending again rather than enqueuing a duplicate run.
    /// A kick landing in the brief window between a worker finishing its
    /// last iteration and observing `pending == false` can cause one
    /// redundant extra run; harmless since queue-draining jobs are
    /// idempotent.
    pub fn submit(&self, job: Arc<Job>) {
        if job.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(job);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for worker in self.workers.drain(..) {
            // Workers block on `recv`, which returns Err once every Sender
            // is dropped (including `self.sender` here); join afterwards.
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn submitted_job_runs() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let job = Job::new(move || {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        pool.submit(job);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resubmitting_a_running_job_does_not_duplicate_queue_entries() {
        let pool = ThreadPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let job = Job::new(move || {
            counter2.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
        });
        pool.submit(job.clone());
        pool.submit(job.clone());
        pool.submit(job.clone());
        std::thread::sleep(Duration::from_millis(100));
        // At least one run, and no panic from a corrupted queue; repeated
        // submissions while already pending must not each enqueue a run.
        assert!(counter.load(Ordering::SeqCst) >= 1);
    }
}
