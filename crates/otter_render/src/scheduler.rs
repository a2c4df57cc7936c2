//! Task scheduler for parallel command recording
//!
//! A fixed pool of worker threads fed from a single mutex-protected queue.
//! The scheduler is an explicitly constructed context object: whoever owns
//! the [`TaskScheduler`] owns the worker threads, and dropping it shuts the
//! pool down.
//!
//! Each worker runs at most one task at a time. A task receives the index
//! of the worker executing it, which callers use to pick per-thread
//! resources (the renderer keeps one command pool and one descriptor pool
//! per worker so recording needs no locks on the hot path).

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::config::SchedulerConfig;

/// A unit of work runnable on a worker thread
pub trait Task: Send {
    /// Run the task on the worker with the given index
    fn run(self: Box<Self>, worker: usize);
}

impl<F> Task for F
where
    F: FnOnce(usize) + Send,
{
    fn run(self: Box<Self>, worker: usize) {
        (*self)(worker);
    }
}

struct Completion<R> {
    state: Mutex<CompletionState<R>>,
    done: Condvar,
}

enum CompletionState<R> {
    Pending,
    Finished(Option<R>),
    Taken,
}

impl<R> Completion<R> {
    fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState::Pending),
            done: Condvar::new(),
        }
    }

    fn finish(&self, result: Option<R>) {
        let mut state = self.state.lock();
        *state = CompletionState::Finished(result);
        self.done.notify_all();
    }
}

/// Completion handle returned by [`TaskScheduler::enqueue`]
///
/// Dropping the handle does not cancel the task.
pub struct TaskHandle<R> {
    completion: Arc<Completion<R>>,
}

impl<R> TaskHandle<R> {
    /// Whether the task has finished (successfully or not)
    pub fn is_complete(&self) -> bool {
        !matches!(*self.completion.state.lock(), CompletionState::Pending)
    }

    /// Wait up to `timeout` for the task; returns true once it is complete
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.completion.state.lock();
        while matches!(*state, CompletionState::Pending) {
            if self.completion.done.wait_until(&mut state, deadline).timed_out() {
                return !matches!(*state, CompletionState::Pending);
            }
        }
        true
    }

    /// Block until the task finishes and take its result
    ///
    /// Returns `None` when the task panicked or was dropped at shutdown.
    pub fn wait(self) -> Option<R> {
        let mut state = self.completion.state.lock();
        while matches!(*state, CompletionState::Pending) {
            self.completion.done.wait(&mut state);
        }
        match std::mem::replace(&mut *state, CompletionState::Taken) {
            CompletionState::Finished(result) => result,
            _ => None,
        }
    }
}

struct Job {
    task: Box<dyn Task>,
    // Reports `None` if the job is discarded before it runs
    abandon: Box<dyn FnOnce() + Send>,
}

struct QueueState {
    jobs: VecDeque<Job>,
    shutting_down: bool,
    live_workers: usize,
}

struct Shared {
    queue: Mutex<QueueState>,
    work_ready: Condvar,
    worker_exited: Condvar,
}

/// Fixed-size worker pool
pub struct TaskScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl TaskScheduler {
    /// Spawn the worker threads described by `config`
    pub fn new(config: &SchedulerConfig) -> std::io::Result<Self> {
        let thread_count = config.worker_threads.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                shutting_down: false,
                live_workers: 0,
            }),
            work_ready: Condvar::new(),
            worker_exited: Condvar::new(),
        });

        let mut scheduler = Self {
            shared,
            workers: Vec::with_capacity(thread_count),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        };

        for worker in 0..thread_count {
            let shared = Arc::clone(&scheduler.shared);
            shared.queue.lock().live_workers += 1;
            let spawned = thread::Builder::new()
                .name(format!("otter-worker-{worker}"))
                .spawn(move || worker_loop(&shared, worker));
            match spawned {
                Ok(handle) => scheduler.workers.push(handle),
                Err(e) => {
                    scheduler.shared.queue.lock().live_workers -= 1;
                    log::error!("Failed to spawn scheduler worker {worker}: {e}");
                    return Err(e);
                }
            }
        }

        log::debug!("Task scheduler started with {thread_count} workers");
        Ok(scheduler)
    }

    /// Number of worker threads
    pub fn number_of_threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task and return its completion handle
    pub fn enqueue<F, R>(&self, task: F) -> TaskHandle<R>
    where
        F: FnOnce(usize) -> R + Send + 'static,
        R: Send + 'static,
    {
        let completion = Arc::new(Completion::new());
        let on_run = Arc::clone(&completion);
        let on_abandon = Arc::clone(&completion);

        let job = Job {
            task: Box::new(move |worker: usize| {
                let result = panic::catch_unwind(AssertUnwindSafe(|| task(worker)));
                if result.is_err() {
                    log::error!("Task panicked on worker {worker}");
                }
                on_run.finish(result.ok());
            }),
            abandon: Box::new(move || on_abandon.finish(None)),
        };

        let mut queue = self.shared.queue.lock();
        if queue.shutting_down {
            drop(queue);
            log::warn!("Task enqueued after scheduler shutdown; discarding");
            (job.abandon)();
        } else {
            queue.jobs.push_back(job);
            drop(queue);
            self.shared.work_ready.notify_one();
        }

        TaskHandle { completion }
    }

    /// Stop accepting work, wake the workers and wait for them to exit
    ///
    /// Queued tasks that have not started are discarded. Workers still busy
    /// after the shutdown timeout are detached.
    pub fn shutdown(&mut self) {
        let abandoned: Vec<Job> = {
            let mut queue = self.shared.queue.lock();
            if queue.shutting_down && self.workers.is_empty() {
                return;
            }
            queue.shutting_down = true;
            queue.jobs.drain(..).collect()
        };
        for job in abandoned {
            (job.abandon)();
        }
        self.shared.work_ready.notify_all();

        let deadline = Instant::now() + self.shutdown_timeout;
        {
            let mut queue = self.shared.queue.lock();
            while queue.live_workers > 0 {
                if self.shared.worker_exited.wait_until(&mut queue, deadline).timed_out() {
                    break;
                }
            }
            if queue.live_workers > 0 {
                log::warn!(
                    "{} scheduler workers did not exit within {:?}; detaching",
                    queue.live_workers,
                    self.shutdown_timeout
                );
            }
        }

        for handle in self.workers.drain(..) {
            if handle.is_finished() && handle.join().is_err() {
                log::error!("Scheduler worker terminated abnormally");
            }
        }
        log::debug!("Task scheduler shut down");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared, worker: usize) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if queue.shutting_down {
                    break None;
                }
                shared.work_ready.wait(&mut queue);
            }
        };

        match job {
            Some(job) => job.task.run(worker),
            None => break,
        }
    }

    let mut queue = shared.queue.lock();
    queue.live_workers -= 1;
    shared.worker_exited.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(threads: usize) -> SchedulerConfig {
        SchedulerConfig {
            worker_threads: threads,
            shutdown_timeout_secs: 5,
        }
    }

    #[test]
    fn test_reports_thread_count() {
        let scheduler = TaskScheduler::new(&config(4)).unwrap();
        assert_eq!(scheduler.number_of_threads(), 4);
    }

    #[test]
    fn test_zero_threads_still_gets_one_worker() {
        let scheduler = TaskScheduler::new(&config(0)).unwrap();
        assert_eq!(scheduler.number_of_threads(), 1);
        assert_eq!(scheduler.enqueue(|_| 7).wait(), Some(7));
    }

    #[test]
    fn test_results_come_back_through_handles() {
        let scheduler = TaskScheduler::new(&config(3)).unwrap();
        let handles: Vec<_> = (0..32u64).map(|i| scheduler.enqueue(move |_| i * i)).collect();
        let results: Vec<u64> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, (0..32u64).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_index_is_in_range() {
        let scheduler = TaskScheduler::new(&config(4)).unwrap();
        let handles: Vec<_> = (0..64).map(|_| scheduler.enqueue(|worker| worker)).collect();
        for handle in handles {
            assert!(handle.wait().unwrap() < 4);
        }
    }

    #[test]
    fn test_worker_runs_one_task_at_a_time() {
        let scheduler = TaskScheduler::new(&config(4)).unwrap();
        let busy: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
        let overlaps = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let busy = Arc::clone(&busy);
                let overlaps = Arc::clone(&overlaps);
                scheduler.enqueue(move |worker| {
                    if busy[worker].fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(1));
                    busy[worker].fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.wait();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tasks_spread_over_workers() {
        let scheduler = TaskScheduler::new(&config(4)).unwrap();
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let seen = Arc::clone(&seen);
                scheduler.enqueue(move |worker| {
                    seen.lock().insert(worker);
                    thread::sleep(Duration::from_millis(20));
                })
            })
            .collect();
        for handle in handles {
            handle.wait();
        }
        assert!(seen.lock().len() > 1);
    }

    #[test]
    fn test_panicking_task_yields_none_and_worker_survives() {
        let scheduler = TaskScheduler::new(&config(1)).unwrap();
        let failed = scheduler.enqueue(|_| -> u32 { panic!("boom") });
        assert_eq!(failed.wait(), None);
        assert_eq!(scheduler.enqueue(|_| 5u32).wait(), Some(5));
    }

    #[test]
    fn test_wait_timeout_and_is_complete() {
        let scheduler = TaskScheduler::new(&config(1)).unwrap();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let task_gate = Arc::clone(&gate);
        let handle = scheduler.enqueue(move |_| {
            let (lock, cvar) = &*task_gate;
            let mut open = lock.lock();
            while !*open {
                cvar.wait(&mut open);
            }
        });

        assert!(!handle.wait_timeout(Duration::from_millis(20)));
        assert!(!handle.is_complete());

        *gate.0.lock() = true;
        gate.1.notify_all();
        assert!(handle.wait_timeout(Duration::from_secs(5)));
        assert!(handle.is_complete());
    }

    #[test]
    fn test_shutdown_discards_queued_work() {
        let mut scheduler = TaskScheduler::new(&config(1)).unwrap();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let task_gate = Arc::clone(&gate);
        let blocker = scheduler.enqueue(move |_| {
            let (lock, cvar) = &*task_gate;
            let mut open = lock.lock();
            while !*open {
                cvar.wait(&mut open);
            }
            1
        });
        // Give the worker time to pick up the blocking task
        while scheduler.shared.queue.lock().jobs.len() > 0 {
            thread::yield_now();
        }
        let queued = scheduler.enqueue(|_| 2);

        let opener = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                *gate.0.lock() = true;
                gate.1.notify_all();
            })
        };
        scheduler.shutdown();
        opener.join().unwrap();

        assert_eq!(blocker.wait(), Some(1));
        assert_eq!(queued.wait(), None);
        assert_eq!(scheduler.enqueue(|_| 3).wait(), None);
    }
}
