//! Cooperative M:N scheduler
//!
//! A scheduler owns a FIFO task queue and a pool of worker threads, each
//! running the dispatch loop. Tasks are fibers or plain callbacks,
//! optionally pinned to one worker. With `use_caller` the constructing
//! thread embeds itself as worker 0: a root fiber over the dispatch loop is
//! built up front and resumed during `stop` to drain the caller's share.
//!
//! The wake path ("tickle") and the idle behaviour are extension points: a
//! `Reactor` installed after construction supplies them, the defaults are a
//! log line and a yield loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use weft_core::error::{Error, Result};
use weft_core::FiberState;

use crate::fiber::Fiber;
use crate::tls;

/// Capability set a scheduler requires from its concrete realization
///
/// The IO manager realizes this over epoll; another backend (kqueue, ...)
/// could too. Installed as a weak reference so the realization, which owns
/// the scheduler, is not kept alive by it.
pub trait Reactor: Send + Sync {
    /// Wake a worker that may be blocked waiting for work
    fn tickle(&self);

    /// Run while the queue is empty; must yield regularly and return once
    /// `stopping` holds
    fn idle(&self);

    /// Whether the scheduler as a whole may shut down
    fn stopping(&self) -> bool;
}

enum TaskKind {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

/// One queue entry: a fiber or a callback, optionally pinned to a worker
pub struct Task {
    kind: TaskKind,
    worker: Option<usize>,
}

impl Task {
    /// Run an existing fiber on any worker
    pub fn fiber(f: Arc<Fiber>) -> Task {
        Task {
            kind: TaskKind::Fiber(f),
            worker: None,
        }
    }

    /// Run an existing fiber on the given worker only
    pub fn fiber_pinned(f: Arc<Fiber>, worker: usize) -> Task {
        Task {
            kind: TaskKind::Fiber(f),
            worker: Some(worker),
        }
    }

    /// Run a callback on any worker
    pub fn call<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            kind: TaskKind::Call(Box::new(f)),
            worker: None,
        }
    }

    /// Run a callback on the given worker only
    pub fn call_pinned<F>(f: F, worker: usize) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            kind: TaskKind::Call(Box::new(f)),
            worker: Some(worker),
        }
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(f: Arc<Fiber>) -> Task {
        Task::fiber(f)
    }
}

struct Inner {
    tasks: VecDeque<Task>,
    threads: Vec<JoinHandle<()>>,
}

/// Fiber scheduler with an embedded-caller option
pub struct Scheduler {
    name: String,
    /// Total workers, the embedded caller included
    worker_count: usize,
    use_caller: bool,
    inner: Mutex<Inner>,
    /// Dispatch fiber for the embedded caller thread
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    started: AtomicBool,
    stop_requested: AtomicBool,
    active_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    reactor: RwLock<Option<Weak<dyn Reactor>>>,
}

impl Scheduler {
    /// Create a scheduler with `worker_count >= 1` workers
    ///
    /// With `use_caller` the calling thread becomes worker 0 and one fewer
    /// thread is spawned; its share of the queue is drained when that same
    /// thread calls `stop`.
    pub fn new(worker_count: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(worker_count >= 1, "scheduler needs at least one worker");

        let sched = Arc::new(Scheduler {
            name: name.to_string(),
            worker_count,
            use_caller,
            inner: Mutex::new(Inner {
                tasks: VecDeque::new(),
                threads: Vec::new(),
            }),
            root_fiber: Mutex::new(None),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            reactor: RwLock::new(None),
        });

        if use_caller {
            // Materialize the caller's main fiber before anything can yield
            let _ = Fiber::current();
            debug_assert!(
                Scheduler::current().is_none(),
                "caller thread already embedded in a scheduler"
            );
            tls::set_current_scheduler(Arc::downgrade(&sched));
            tls::set_worker_id(0);

            // The root fiber runs the dispatch loop but is itself driven by
            // the caller's main fiber, not by a scheduler.
            let weak = Arc::downgrade(&sched);
            let root = Fiber::new(
                move || {
                    if let Some(s) = weak.upgrade() {
                        s.run(0);
                    }
                },
                0,
                false,
            );
            *sched.root_fiber.lock().unwrap() = Some(root);
        }

        sched
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn idle_workers(&self) -> usize {
        self.idle_workers.load(Ordering::SeqCst)
    }

    pub fn has_idle_workers(&self) -> bool {
        self.idle_workers() > 0
    }

    /// The scheduler the current thread works for
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::current_scheduler()
    }

    /// The current thread's worker index within its scheduler
    pub fn current_worker() -> Option<usize> {
        tls::worker_id()
    }

    /// Install the realization supplying tickle/idle/stopping
    pub fn install_reactor(&self, reactor: Weak<dyn Reactor>) {
        *self.reactor.write().unwrap() = Some(reactor);
    }

    fn reactor(&self) -> Option<Arc<dyn Reactor>> {
        self.reactor.read().unwrap().as_ref()?.upgrade()
    }

    /// Spawn the worker threads; idempotent once started
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.stop_requested.load(Ordering::SeqCst) {
            error!(target: "system", name = %self.name, "start refused, scheduler is stopping");
            return Err(Error::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(target: "system", name = %self.name, workers = self.worker_count, "scheduler start");

        let spawn_base = self.use_caller as usize;
        let mut inner = self.inner.lock().unwrap();
        for i in spawn_base..self.worker_count {
            let sched = self.clone();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.name, i))
                .spawn(move || sched.run(i))
                .expect("failed to spawn worker thread");
            inner.threads.push(handle);
        }
        Ok(())
    }

    /// Enqueue a task; wakes a worker when the queue was empty
    pub fn schedule(&self, task: Task) {
        let need_tickle = {
            let mut inner = self.inner.lock().unwrap();
            let was_empty = inner.tasks.is_empty();
            inner.tasks.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Enqueue a batch with at most one wake for the lot
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let need_tickle = {
            let mut inner = self.inner.lock().unwrap();
            let was_empty = inner.tasks.is_empty();
            inner.tasks.extend(tasks);
            was_empty && !inner.tasks.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Request shutdown and wait for all workers to drain and exit
    ///
    /// With `use_caller` this must run on the embedding thread: the root
    /// fiber is resumed here to drain the caller's share of the queue.
    /// Blocks until the realization agrees the scheduler may stop (for an
    /// IO manager: no pending events, no timers).
    pub fn stop(&self) {
        info!(target: "system", name = %self.name, "scheduler stop");
        if self.stopping() {
            return;
        }
        self.stop_requested.store(true, Ordering::SeqCst);

        if self.use_caller {
            debug_assert!(
                Scheduler::current().map_or(false, |s| std::ptr::eq(Arc::as_ptr(&s), self)),
                "stop of an embedded scheduler from a foreign thread"
            );
        }

        // One wake per worker, so every one of them re-checks stopping
        for _ in 0..self.worker_count {
            self.tickle();
        }

        let root = self.root_fiber.lock().unwrap().clone();
        if let Some(root) = root {
            self.tickle();
            if root.state() != FiberState::Term {
                root.resume();
                debug!(target: "system", name = %self.name, "root fiber end");
            }
        }

        let threads = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.threads)
        };
        for t in threads {
            let _ = t.join();
        }
    }

    /// Wake one worker; the default realization only logs
    pub fn tickle(&self) {
        match self.reactor() {
            Some(r) => r.tickle(),
            None => debug!(target: "system", name = %self.name, "tickle"),
        }
    }

    /// Whether the scheduler may shut down
    pub fn stopping(&self) -> bool {
        match self.reactor() {
            Some(r) => r.stopping(),
            None => self.base_stopping(),
        }
    }

    /// The scheduler-level part of the shutdown condition: stop requested,
    /// queue empty, nobody mid-task
    pub fn base_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
            && self.active_workers.load(Ordering::SeqCst) == 0
            && self.inner.lock().unwrap().tasks.is_empty()
    }

    fn idle(&self) {
        debug!(target: "system", name = %self.name, "idle");
        match self.reactor() {
            Some(r) => r.idle(),
            None => {
                while !self.stopping() {
                    Fiber::yield_now();
                }
            }
        }
    }

    /// The dispatch loop; runs on every worker thread, and on the root
    /// fiber of an embedded caller
    fn run(self: &Arc<Self>, worker_id: usize) {
        debug!(target: "system", name = %self.name, worker_id, "worker start");
        tls::set_current_scheduler(Arc::downgrade(self));
        tls::set_worker_id(worker_id);

        // The fiber running this loop is the thread's dispatch fiber: the
        // main fiber on spawned workers, the root fiber on the caller.
        let dispatch = Fiber::current();
        tls::set_dispatch_fiber(Arc::as_ptr(&dispatch));

        let idle_sched = self.clone();
        let idle_fiber = Fiber::new(move || idle_sched.idle(), 0, true);
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task: Option<TaskKind> = None;
            let mut tickle_me = false;
            {
                let mut inner = self.inner.lock().unwrap();
                let mut i = 0;
                while i < inner.tasks.len() {
                    // Pinned elsewhere: leave it and wake its worker
                    if let Some(w) = inner.tasks[i].worker {
                        if w != worker_id {
                            tickle_me = true;
                            i += 1;
                            continue;
                        }
                    }
                    // A fiber still running on another worker cannot be
                    // resumed until its switch-out completes
                    if let TaskKind::Fiber(f) = &inner.tasks[i].kind {
                        if f.state() == FiberState::Running {
                            i += 1;
                            continue;
                        }
                    }
                    task = inner.tasks.remove(i).map(|t| t.kind);
                    self.active_workers.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me |= i < inner.tasks.len();
            }

            if tickle_me {
                self.tickle();
            }

            match task {
                Some(TaskKind::Fiber(f)) => {
                    f.resume();
                    self.active_workers.fetch_sub(1, Ordering::SeqCst);
                }
                Some(TaskKind::Call(cb)) => {
                    let f = match cb_fiber.take() {
                        Some(f) => {
                            f.reset(cb);
                            f
                        }
                        None => Fiber::new(cb, 0, true),
                    };
                    f.resume();
                    self.active_workers.fetch_sub(1, Ordering::SeqCst);
                    if f.state() == FiberState::Ready {
                        // Yielded mid-callback: back into the queue, and a
                        // fresh fiber for the next callback
                        self.schedule(Task::fiber(f));
                    } else {
                        cb_fiber = Some(f);
                    }
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        debug!(target: "system", name = %self.name, "idle fiber term");
                        break;
                    }
                    self.idle_workers.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_workers.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        tls::set_dispatch_fiber(std::ptr::null());
        debug!(target: "system", name = %self.name, worker_id, "worker exit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn test_single_worker_runs_fifo() {
        let sched = Scheduler::new(1, false, "fifo");
        let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = order.clone();
            sched.schedule(Task::call(move || order.lock().unwrap().push(i)));
        }
        sched.start().unwrap();
        sched.stop();

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(sched.active_workers(), 0);
    }

    #[test]
    fn test_two_workers_run_all_callbacks() {
        let sched = Scheduler::new(2, false, "pair");
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

        sched.start().unwrap();
        for i in 0..10 {
            let seen = seen.clone();
            sched.schedule(Task::call(move || {
                seen.lock().unwrap().push(i);
                Fiber::yield_now();
            }));
        }
        sched.stop();

        let mut got = seen.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
        assert_eq!(sched.active_workers(), 0);
        assert!(sched.base_stopping());
    }

    #[test]
    fn test_pinned_task_runs_on_its_worker() {
        let sched = Scheduler::new(2, false, "pin");
        let seen: Arc<Mutex<Option<usize>>> = Arc::new(Mutex::new(None));

        let seen2 = seen.clone();
        sched.schedule(Task::call_pinned(
            move || {
                *seen2.lock().unwrap() = Scheduler::current_worker();
            },
            1,
        ));
        sched.start().unwrap();
        sched.stop();

        assert_eq!(*seen.lock().unwrap(), Some(1));
    }

    #[test]
    fn test_pinned_task_waits_for_busy_worker() {
        // Worker 0 is held by a non-yielding callback; a task pinned to it
        // must wait even though worker 1 sits idle. Documented liveness
        // limitation of pinning without work stealing.
        let sched = Scheduler::new(2, false, "busy");
        let busy_done = Arc::new(AtomicBool::new(false));
        let victim_saw_done = Arc::new(AtomicBool::new(false));
        let bystander_ran = Arc::new(AtomicBool::new(false));

        let d = busy_done.clone();
        sched.schedule(Task::call_pinned(
            move || {
                thread::sleep(Duration::from_millis(150));
                d.store(true, Ordering::SeqCst);
            },
            0,
        ));
        let d = busy_done.clone();
        let v = victim_saw_done.clone();
        sched.schedule(Task::call_pinned(
            move || {
                v.store(d.load(Ordering::SeqCst), Ordering::SeqCst);
            },
            0,
        ));
        let b = bystander_ran.clone();
        sched.schedule(Task::call(move || b.store(true, Ordering::SeqCst)));

        sched.start().unwrap();
        sched.stop();

        assert!(victim_saw_done.load(Ordering::SeqCst));
        assert!(bystander_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        let sched = Scheduler::new(1, true, "embedded");
        let hits = Arc::new(AtomicUsize::new(0));

        sched.start().unwrap();
        for _ in 0..3 {
            let hits = hits.clone();
            sched.schedule(Task::call(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        // No spawned workers: everything runs here, inside stop
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(sched.base_stopping());
    }

    #[test]
    fn test_scheduled_fiber_task_runs() {
        let sched = Scheduler::new(1, false, "fib");
        let ran = Arc::new(AtomicBool::new(false));

        let r = ran.clone();
        let f = Fiber::new(move || r.store(true, Ordering::SeqCst), 0, true);
        sched.schedule(Task::fiber(f));
        sched.start().unwrap();
        sched.stop();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_start_after_stop_is_refused() {
        let sched = Scheduler::new(1, false, "dead");
        sched.start().unwrap();
        sched.stop();
        assert_eq!(sched.start(), Err(Error::Stopped));
    }

    #[test]
    fn test_schedule_during_run_completes_before_stop_returns() {
        let sched = Scheduler::new(2, false, "late");
        sched.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let hits = hits.clone();
            sched.schedule(Task::call(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }
}
