//! # umbra-cron
//!
//! The cooperative scheduler driving all periodic work in an Umbra node:
//! hello refresh, DHT maintenance, reassembly garbage collection, request
//! re-issue and operation deadlines.
//!
//! One logical priority queue of jobs ordered by next fire time, executed by
//! a single runner thread. Exactly one job runs at a time; any blocking I/O
//! inside a job blocks all other jobs, so callers must offload long waits to
//! worker threads.
//!
//! Jobs are identified by a [`JobId`] returned from [`Cron::add`]; a job
//! carries its argument inside its closure. [`Cron::remove`] cancels future
//! runs but never interrupts an in-flight execution; [`Cron::advance`] pulls
//! a future fire time to now, which is how operation deadlines are fired
//! early on completion.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Error types for scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    /// The job id is unknown (already fired, removed, or never added).
    #[error("unknown job")]
    UnknownJob,

    /// The scheduler has been stopped.
    #[error("scheduler stopped")]
    Stopped,
}

/// Convenience result type for scheduler operations.
pub type Result<T> = std::result::Result<T, CronError>;

/// Identifies a scheduled job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

/// A scheduled callback.
pub type JobFn = Box<dyn FnMut() + Send + 'static>;

struct Job {
    /// Callback; taken out of the entry while the job is running.
    callback: Option<JobFn>,
    /// Re-fire period; zero means one-shot.
    period: Duration,
    /// Next fire time. Heap entries with a different time are stale.
    next_fire: Instant,
}

struct CronState {
    jobs: HashMap<JobId, Job>,
    /// Min-heap of (fire time, job id). May contain stale entries; each is
    /// validated against `jobs` on pop.
    queue: BinaryHeap<Reverse<(Instant, JobId)>>,
    running: Option<JobId>,
    suspended: u32,
    shutdown: bool,
    next_id: u64,
}

struct CronInner {
    state: Mutex<CronState>,
    wake: Condvar,
}

/// The cooperative cron scheduler.
///
/// Dropping the handle stops the runner thread after the current job (if
/// any) finishes.
pub struct Cron {
    inner: Arc<CronInner>,
    runner: Option<std::thread::JoinHandle<()>>,
}

impl Cron {
    /// Start the scheduler with its runner thread.
    pub fn start() -> Self {
        let inner = Arc::new(CronInner {
            state: Mutex::new(CronState {
                jobs: HashMap::new(),
                queue: BinaryHeap::new(),
                running: None,
                suspended: 0,
                shutdown: false,
                next_id: 1,
            }),
            wake: Condvar::new(),
        });
        let thread_inner = Arc::clone(&inner);
        let runner = std::thread::Builder::new()
            .name("umbra-cron".to_string())
            .spawn(move || run_loop(&thread_inner))
            .ok();
        Self { inner, runner }
    }

    /// Schedule a job.
    ///
    /// The first run happens `delay` from now; a non-zero `period` re-fires
    /// the job that long after each completed run. A job that reschedules
    /// itself does not recurse: the next run starts only after the current
    /// one returned.
    pub fn add(&self, delay: Duration, period: Duration, callback: JobFn) -> JobId {
        let mut state = self.lock();
        let id = JobId(state.next_id);
        state.next_id += 1;
        let fire = Instant::now() + delay;
        state.jobs.insert(
            id,
            Job {
                callback: Some(callback),
                period,
                next_fire: fire,
            },
        );
        state.queue.push(Reverse((fire, id)));
        self.inner.wake.notify_all();
        id
    }

    /// Cancel future runs of a job.
    ///
    /// A no-op for an execution already in flight; a caller that must wait
    /// for a running instance has to coordinate through a separate signal.
    pub fn remove(&self, id: JobId) {
        let mut state = self.lock();
        state.jobs.remove(&id);
    }

    /// Pull a job's next fire time to now.
    ///
    /// Used to fire deadline jobs early once an operation completed. A no-op
    /// if the job is unknown or currently running.
    ///
    /// # Errors
    ///
    /// Returns [`CronError::UnknownJob`] if no pending run exists.
    pub fn advance(&self, id: JobId) -> Result<()> {
        let mut state = self.lock();
        match state.jobs.get_mut(&id) {
            Some(job) if job.callback.is_some() => {
                let now = Instant::now();
                job.next_fire = now;
                state.queue.push(Reverse((now, id)));
                self.inner.wake.notify_all();
                Ok(())
            }
            _ => Err(CronError::UnknownJob),
        }
    }

    /// Suspend job execution.
    ///
    /// Blocks until the currently running job (if any) has finished, then
    /// keeps the runner idle until a matching [`resume`](Self::resume).
    /// Nested suspends are counted. Must not be called from inside a job.
    pub fn suspend(&self) {
        let mut state = self.lock();
        state.suspended += 1;
        while state.running.is_some() {
            state = match self.inner.wake.wait(state) {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Resume job execution after [`suspend`](Self::suspend).
    pub fn resume(&self) {
        let mut state = self.lock();
        state.suspended = state.suspended.saturating_sub(1);
        if state.suspended == 0 {
            self.inner.wake.notify_all();
        }
    }

    /// Number of jobs with a pending run.
    pub fn pending(&self) -> usize {
        self.lock().jobs.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CronState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for Cron {
    fn drop(&mut self) {
        {
            let mut state = self.lock();
            state.shutdown = true;
            self.inner.wake.notify_all();
        }
        if let Some(handle) = self.runner.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(inner: &CronInner) {
    let mut state = match inner.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    loop {
        if state.shutdown {
            return;
        }
        if state.suspended > 0 {
            state = match inner.wake.wait(state) {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            continue;
        }
        let now = Instant::now();
        let head = state.queue.peek().map(|Reverse((fire, id))| (*fire, *id));
        let (fire, id) = match head {
            None => {
                state = match inner.wake.wait(state) {
                    Ok(s) => s,
                    Err(poisoned) => poisoned.into_inner(),
                };
                continue;
            }
            Some((fire, _)) if fire > now => {
                let timeout = fire - now;
                state = match inner.wake.wait_timeout(state, timeout) {
                    Ok((s, _)) => s,
                    Err(poisoned) => poisoned.into_inner().0,
                };
                continue;
            }
            Some((fire, id)) => {
                state.queue.pop();
                (fire, id)
            }
        };

        // Validate against the job table; removed or rescheduled entries
        // leave stale heap nodes behind.
        let mut callback = match state.jobs.get_mut(&id) {
            Some(job) if job.next_fire == fire && job.callback.is_some() => {
                match job.callback.take() {
                    Some(cb) => cb,
                    None => continue,
                }
            }
            _ => continue,
        };

        state.running = Some(id);
        drop(state);
        callback();
        state = match inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.running = None;

        // Reschedule periodic jobs unless removed while running.
        match state.jobs.get_mut(&id) {
            Some(job) => {
                if job.period > Duration::ZERO {
                    job.callback = Some(callback);
                    job.next_fire = Instant::now() + job.period;
                    let fire = job.next_fire;
                    state.queue.push(Reverse((fire, id)));
                } else {
                    state.jobs.remove(&id);
                }
            }
            None => {
                tracing::trace!(?id, "job removed while running");
            }
        }
        inner.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_one_shot_fires_once() {
        let cron = Cron::start();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        cron.add(
            Duration::from_millis(10),
            Duration::ZERO,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(cron.pending(), 0);
    }

    #[test]
    fn test_periodic_fires_repeatedly() {
        let cron = Cron::start();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = cron.add(
            Duration::from_millis(5),
            Duration::from_millis(10),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        std::thread::sleep(Duration::from_millis(100));
        cron.remove(id);
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 3, "periodic job fired only {fired} times");
    }

    #[test]
    fn test_remove_cancels_future_runs() {
        let cron = Cron::start();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = cron.add(
            Duration::from_millis(50),
            Duration::ZERO,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cron.remove(id);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_advance_fires_early() {
        let cron = Cron::start();
        let (tx, rx) = mpsc::channel();
        let id = cron.add(
            Duration::from_secs(3600),
            Duration::ZERO,
            Box::new(move || {
                let _ = tx.send(Instant::now());
            }),
        );
        let before = Instant::now();
        cron.advance(id).expect("advance");
        let fired_at = rx.recv_timeout(Duration::from_secs(2)).expect("job fired");
        assert!(fired_at.duration_since(before) < Duration::from_secs(1));
    }

    #[test]
    fn test_advance_unknown_job() {
        let cron = Cron::start();
        assert!(matches!(
            cron.advance(JobId(999)),
            Err(CronError::UnknownJob)
        ));
    }

    #[test]
    fn test_suspend_resume() {
        let cron = Cron::start();
        let count = Arc::new(AtomicUsize::new(0));
        cron.suspend();
        let c = Arc::clone(&count);
        cron.add(
            Duration::from_millis(5),
            Duration::ZERO,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 0, "fired while suspended");
        cron.resume();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jobs_run_serially() {
        let cron = Cron::start();
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let a = Arc::clone(&active);
            let o = Arc::clone(&overlap);
            cron.add(
                Duration::from_millis(1),
                Duration::ZERO,
                Box::new(move || {
                    if a.fetch_add(1, Ordering::SeqCst) > 0 {
                        o.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                    a.fetch_sub(1, Ordering::SeqCst);
                }),
            );
        }
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(overlap.load(Ordering::SeqCst), 0, "jobs overlapped");
    }

    #[test]
    fn test_same_fire_time_all_run() {
        let cron = Cron::start();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let c = Arc::clone(&count);
            cron.add(
                Duration::from_millis(10),
                Duration::ZERO,
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::SeqCst), 8);
    }
}
