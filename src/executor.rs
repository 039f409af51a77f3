use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake};
use std::thread::{self, Thread};
use std::time::Duration;
use crate::config::ServerConfig;
use crate::error::{ExecutorError, ExecutorResult};

/// Blocks the current thread until a future completes.
///
/// Worker threads use one parker each to drive connection tasks; anything
/// that wakes the task unparks the thread.
pub struct Parker {
    thread: Thread,
    parked: AtomicBool,
}

impl Parker {
    /// A parker for the calling thread.
    pub fn new() -> Arc<Self> {
        Arc::new(Parker {
            thread: thread::current(),
            // start off as parked to ensure wakeups are seen in between polling and parking
            parked: AtomicBool::new(true),
        })
    }
}

impl Wake for Parker {
    fn wake(self: Arc<Self>) {
        if self.parked.swap(false, Ordering::Release) {
            self.thread.unpark();
        }
    }
}

impl Parker {
    pub fn block_on<F>(self: &Arc<Self>, fut: F) -> F::Output
    where
        F: Future,
    {
        self.parked.store(true, Ordering::Relaxed);

        let waker = self.clone().into();
        let mut cx = Context::from_waker(&waker);

        let mut fut = Box::pin(fut);
        loop {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(res) => break res,
                Poll::Pending => {
                    while self.parked.swap(true, Ordering::Acquire) {
                        thread::park();
                    }
                }
            }
        }
    }
}

/// Dynamic pool of worker threads.
///
/// A task is handed to an idle worker, or a new worker is started while the
/// pool is below `max_workers`; otherwise it waits in the queue. Each worker
/// blocks on one task at a time, so connection tasks may run synchronous
/// handlers directly. Idle workers exit after `keep_alive`.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

/// Internal state shared between the executor and its worker threads
struct Inner {
    /// Duration a worker thread will wait for new tasks before shutting down
    keep_alive: Duration,
    /// Shared state protected by a mutex
    shared: Mutex<Shared>,
    /// Maximum number of worker threads allowed
    max_workers: usize,
    /// Condition variable for worker thread synchronization
    condvar: Condvar,
}

/// Shared state for the thread pool
struct Shared {
    /// Queue of pending tasks
    queue: VecDeque<Pin<Box<dyn Future<Output = ()> + Send>>>,
    /// Current number of worker threads
    workers: usize,
    /// Number of idle worker threads
    idle: usize,
    /// Number of workers that have been notified of new work
    notified: usize,
}

impl Executor {
    /// `max_workers` defaults to 15 per CPU, `keep_alive` to 6 seconds.
    pub fn new(max_workers: Option<usize>, keep_alive: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    notified: 0,
                }),
                condvar: Condvar::new(),
                keep_alive: keep_alive.unwrap_or_else(|| Duration::from_secs(6)),
                max_workers: max_workers.unwrap_or_else(|| num_cpus::get() * 15),
            }),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(Some(config.max_workers), Some(config.worker_keep_alive()))
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Queues `task` for a worker.
    pub fn spawn<F>(&self, task: F) -> ExecutorResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut shared = self
            .inner
            .shared
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?;

        shared.queue.push_back(Box::pin(task));

        if shared.idle == 0 && shared.workers != self.inner.max_workers {
            shared.workers += 1;
            if let Err(err) = self.spawn_worker(self.inner.clone()) {
                shared.workers -= 1;
                return Err(err);
            }
        } else if shared.idle > 0 {
            shared.idle -= 1;
            shared.notified += 1;
            self.inner.condvar.notify_one();
        }
        Ok(())
    }

    fn spawn_worker(&self, inner: Arc<Inner>) -> ExecutorResult<()> {
        std::thread::Builder::new()
            .name("muxlet-worker".to_owned())
            .spawn(move || {
                if let Err(e) = inner.run() {
                    log::error!("worker thread failed: {}", e);
                }
            })
            .map_err(ExecutorError::ThreadSpawn)?;
        Ok(())
    }
}

impl<F> hyper::rt::Executor<F> for Executor
where
    F: Future<Output = ()> + Send + 'static,
{
    fn execute(&self, fut: F) {
        if let Err(e) = self.spawn(fut) {
            log::error!("failed to execute task: {}", e);
        }
    }
}

impl Inner {
    /// Drains the queue, then waits for work until `keep_alive` passes
    /// without any.
    fn run(&self) -> ExecutorResult<()> {
        let parker = Parker::new();
        let mut shared = self.shared
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?;

        'alive: loop {
            while let Some(task) = shared.queue.pop_front() {
                drop(shared);
                parker.block_on(task);
                shared = self.shared
                    .lock()
                    .map_err(|_| ExecutorError::LockPoisoned)?;
            }

            shared.idle += 1;

            loop {
                let result = self.condvar
                    .wait_timeout(shared, self.keep_alive)
                    .map_err(|_| ExecutorError::LockPoisoned)?;
                    
                shared = result.0;
                let timeout = result.1;

                if shared.notified != 0 {
                    shared.notified -= 1;
                    continue 'alive;
                }

                if timeout.timed_out() {
                    break 'alive;
                }
            }
        }

        shared.workers -= 1;
        shared.idle -= 1;
        Ok(())
    }
}
