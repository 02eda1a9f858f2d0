//! Restartable repeating background task.
//!
//! A [`PollingTask`] runs its callables in registration order once per
//! interval on a dedicated named thread. The worker ticks first, then sleeps
//! on a channel so that [`PollingTask::stop`] interrupts the sleep instead of
//! waiting it out.
//!
//! Lifecycle:
//!
//! ```text
//! Fresh --start--> Running --stop / TickFlow::Stop--> Stopped
//!                     ^                                  |
//!                     +------------ restart -------------+
//! ```
//!
//! A finished thread cannot be started again, so `restart` spawns a fresh
//! worker over the same callables and interval. `save_start` picks whichever
//! of `start`/`restart` applies.

use crate::error::{Result, SarathiError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Shortest interval accepted; avoids a spinning worker
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// What a callable asks the task to do after the current tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFlow {
    Continue,
    /// Stop the task once the tick completes (fires observers)
    Stop,
}

/// Result of one callable in the most recent tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    NotRun,
    Continued,
    Stopped,
    Failed(String),
}

pub type Callable = Box<dyn FnMut() -> Result<TickFlow> + Send>;

pub type Observer = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`PollingTask::add_observer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fresh,
    Running,
    Stopped,
}

struct Control {
    phase: Phase,
    /// Dropping the sender wakes and stops the worker
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
    /// A start request arrived while running; cancels a pending self-stop
    rearm: bool,
    /// Bumped on every spawn so a stale worker cannot stop its successor
    generation: u64,
}

struct TaskInner {
    name: String,
    interval: Mutex<Duration>,
    callables: Mutex<Vec<Callable>>,
    results: Mutex<Vec<CallOutcome>>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
    next_observer: AtomicU64,
    control: Mutex<Control>,
}

/// Owner of the worker; dropping it stops and joins the worker
struct Handle {
    inner: Arc<TaskInner>,
}

/// Repeating background executor. Clones share the same task.
#[derive(Clone)]
pub struct PollingTask {
    handle: Arc<Handle>,
}

/// Non-owning reference to a [`PollingTask`], for use inside observers and
/// callables of other tasks
#[derive(Clone)]
pub struct WeakPollingTask {
    handle: Weak<Handle>,
}

impl WeakPollingTask {
    pub fn upgrade(&self) -> Option<PollingTask> {
        self.handle.upgrade().map(|handle| PollingTask { handle })
    }
}

impl PollingTask {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        let inner = TaskInner {
            name: name.into(),
            interval: Mutex::new(interval.max(MIN_INTERVAL)),
            callables: Mutex::new(Vec::new()),
            results: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(0),
            control: Mutex::new(Control {
                phase: Phase::Fresh,
                stop_tx: None,
                worker: None,
                rearm: false,
                generation: 0,
            }),
        };
        Self {
            handle: Arc::new(Handle {
                inner: Arc::new(inner),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner().name
    }

    pub fn interval(&self) -> Duration {
        *self.inner().interval.lock()
    }

    /// Takes effect from the next sleep
    pub fn set_interval(&self, interval: Duration) {
        *self.inner().interval.lock() = interval.max(MIN_INTERVAL);
    }

    pub fn is_running(&self) -> bool {
        self.inner().control.lock().phase == Phase::Running
    }

    /// Register a callable for every tick. Blocks while a tick is running.
    pub fn add_callable<F>(&self, callable: F)
    where
        F: FnMut() -> Result<TickFlow> + Send + 'static,
    {
        let inner = self.inner();
        let mut callables = inner.callables.lock();
        callables.push(Box::new(callable));
        inner.results.lock().push(CallOutcome::NotRun);
    }

    /// Outcome of each callable in the last tick, in registration order
    pub fn last_results(&self) -> Vec<CallOutcome> {
        self.inner().results.lock().clone()
    }

    /// Observers run once per stop, in registration order, on the thread
    /// that stopped the task
    pub fn add_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let inner = self.inner();
        let id = ObserverId(inner.next_observer.fetch_add(1, Ordering::Relaxed));
        inner.observers.lock().push((id, Arc::new(observer)));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.inner().observers.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn downgrade(&self) -> WeakPollingTask {
        WeakPollingTask {
            handle: Arc::downgrade(&self.handle),
        }
    }

    /// Start a fresh task. While running this only cancels a `TickFlow::Stop`
    /// the current tick may be about to return; a stopped task needs
    /// [`restart`](Self::restart).
    pub fn start(&self) -> Result<()> {
        let inner = self.inner();
        let mut control = inner.control.lock();
        match control.phase {
            Phase::Running => {
                control.rearm = true;
                Ok(())
            }
            Phase::Stopped => Err(SarathiError::TaskFinished(inner.name.clone())),
            Phase::Fresh => TaskInner::spawn(inner, &mut control),
        }
    }

    /// Replace the worker with a new one over the same callables and
    /// interval. Does not wait for the previous worker: it leaves after the
    /// callable it is executing, and the new worker's first tick waits for
    /// that callable. Observers are not notified.
    pub fn restart(&self) -> Result<()> {
        let inner = self.inner();
        let mut control = inner.control.lock();
        control.stop_tx = None;
        // detached; it holds its own reference to the task
        drop(control.worker.take());
        TaskInner::spawn(inner, &mut control)
    }

    /// Start, restart or keep running, whichever applies
    pub fn save_start(&self) -> Result<()> {
        let phase = self.inner().control.lock().phase;
        match phase {
            Phase::Fresh | Phase::Running => self.start(),
            Phase::Stopped => self.restart(),
        }
    }

    /// Ask the worker to exit and notify observers. Does not wait: a
    /// callable already executing finishes, later ones in the tick are skipped.
    pub fn stop(&self) {
        self.inner().stop(None);
    }

    fn inner(&self) -> &Arc<TaskInner> {
        &self.handle.inner
    }
}

impl fmt::Debug for PollingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingTask")
            .field("name", &self.name())
            .field("interval", &self.interval())
            .field("running", &self.is_running())
            .finish()
    }
}

impl TaskInner {
    fn spawn(inner: &Arc<TaskInner>, control: &mut Control) -> Result<()> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        control.generation += 1;
        let generation = control.generation;
        let worker_inner = Arc::clone(inner);

        let worker = thread::Builder::new()
            .name(inner.name.clone())
            .spawn(move || worker_inner.run(stop_rx, generation))?;

        control.phase = Phase::Running;
        control.rearm = false;
        control.stop_tx = Some(stop_tx);
        control.worker = Some(worker);
        tracing::debug!("Task '{}' started", inner.name);
        Ok(())
    }

    fn run(&self, stop_rx: Receiver<()>, generation: u64) {
        loop {
            if stop_requested(&stop_rx) {
                break;
            }
            // only start requests made during this tick count
            self.control.lock().rearm = false;
            if self.tick(&stop_rx) == TickFlow::Stop && self.stop(Some(generation)) {
                break;
            }

            let interval = *self.interval.lock();
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::trace!("Task '{}' worker exited", self.name);
    }

    fn tick(&self, stop_rx: &Receiver<()>) -> TickFlow {
        let mut callables = self.callables.lock();
        let mut flow = TickFlow::Continue;

        for (index, callable) in callables.iter_mut().enumerate() {
            if stop_requested(stop_rx) {
                return TickFlow::Continue;
            }
            let outcome = match callable() {
                Ok(TickFlow::Continue) => CallOutcome::Continued,
                Ok(TickFlow::Stop) => {
                    flow = TickFlow::Stop;
                    CallOutcome::Stopped
                }
                Err(e) => {
                    tracing::warn!("Task '{}' callable {} failed: {}", self.name, index, e);
                    CallOutcome::Failed(e.to_string())
                }
            };
            if let Some(slot) = self.results.lock().get_mut(index) {
                *slot = outcome;
            }
        }
        flow
    }

    /// `from_worker` carries the generation of a worker stopping itself;
    /// a stale generation or a pending rearm keeps the task running.
    /// Returns whether the task stopped.
    fn stop(&self, from_worker: Option<u64>) -> bool {
        {
            let mut control = self.control.lock();
            if control.phase != Phase::Running {
                return false;
            }
            if let Some(generation) = from_worker {
                if generation != control.generation {
                    return false;
                }
                if control.rearm {
                    control.rearm = false;
                    return false;
                }
                // our own handle; dropping it detaches the exiting thread
                control.worker = None;
            }
            control.phase = Phase::Stopped;
            control.rearm = false;
            control.stop_tx = None;
        }
        tracing::debug!("Task '{}' stopped", self.name);

        let observers: Vec<Observer> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer();
        }
        true
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let worker = {
            let mut control = self.inner.control.lock();
            if control.phase == Phase::Running {
                control.phase = Phase::Stopped;
            }
            control.stop_tx = None;
            control.worker.take()
        };
        join_worker(worker, &self.inner.name);
    }
}

fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
}

fn join_worker(worker: Option<JoinHandle<()>>, name: &str) {
    let Some(worker) = worker else {
        return;
    };
    if worker.thread().id() == thread::current().id() {
        return;
    }
    if worker.join().is_err() {
        tracing::error!("Task '{}' worker panicked", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn counting_task(interval: Duration) -> (PollingTask, Arc<AtomicUsize>) {
        let task = PollingTask::new("test-task", interval);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        task.add_callable(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(TickFlow::Continue)
        });
        (task, count)
    }

    #[test]
    fn test_tick_count_within_interval_bounds() {
        let interval = Duration::from_millis(50);
        let (task, count) = counting_task(interval);

        let started = Instant::now();
        task.start().unwrap();
        thread::sleep(Duration::from_millis(275));
        task.stop();
        let elapsed = started.elapsed().as_secs_f64();
        let calls = count.load(Ordering::SeqCst);

        let ratio = elapsed / interval.as_secs_f64();
        assert!(calls >= ratio.floor() as usize, "{} calls in {:.3}s", calls, elapsed);
        assert!(calls <= ratio.ceil() as usize + 1, "{} calls in {:.3}s", calls, elapsed);
    }

    #[test]
    fn test_no_calls_after_stop_until_restart() {
        let (task, count) = counting_task(Duration::from_millis(10));
        task.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        task.stop();
        assert!(!task.is_running());

        thread::sleep(Duration::from_millis(20));
        let after_stop = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);

        assert!(matches!(task.start(), Err(SarathiError::TaskFinished(_))));
        task.restart().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(count.load(Ordering::SeqCst) > after_stop);
        task.stop();
    }

    #[test]
    fn test_save_start_handles_every_phase() {
        let (task, count) = counting_task(Duration::from_millis(10));
        task.save_start().unwrap();
        task.save_start().unwrap();
        assert!(task.is_running());
        task.stop();
        task.save_start().unwrap();
        assert!(task.is_running());
        thread::sleep(Duration::from_millis(30));
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_observers_fire_once_per_stop_in_order() {
        let (task, _) = counting_task(Duration::from_millis(10));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        task.add_observer(move || first.lock().push("first"));
        let second = Arc::clone(&order);
        let removed = task.add_observer(move || second.lock().push("removed"));
        let third = Arc::clone(&order);
        task.add_observer(move || third.lock().push("third"));
        assert!(task.remove_observer(removed));

        task.start().unwrap();
        task.stop();
        task.stop();
        assert_eq!(*order.lock(), vec!["first", "third"]);

        // restart itself does not notify
        task.restart().unwrap();
        assert_eq!(order.lock().len(), 2);
        task.stop();
        assert_eq!(order.lock().len(), 4);
    }

    #[test]
    fn test_failing_callable_does_not_kill_loop() {
        let task = PollingTask::new("flaky", Duration::from_millis(10));
        task.add_callable(|| Err(SarathiError::TransportUnavailable("down".into())));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        task.add_callable(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(TickFlow::Continue)
        });

        task.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        task.stop();

        assert!(count.load(Ordering::SeqCst) >= 3);
        let results = task.last_results();
        assert!(matches!(results[0], CallOutcome::Failed(_)));
        assert_eq!(results[1], CallOutcome::Continued);
    }

    #[test]
    fn test_tick_flow_stop_ends_task_and_notifies() {
        let task = PollingTask::new("once", Duration::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        task.add_callable(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(TickFlow::Stop)
        });
        let (tx, rx) = crossbeam_channel::bounded(1);
        task.add_observer(move || {
            let _ = tx.try_send(());
        });

        task.start().unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        thread::sleep(Duration::from_millis(30));

        assert!(!task.is_running());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.last_results(), vec![CallOutcome::Stopped]);
    }

    #[test]
    fn test_start_request_during_tick_cancels_self_stop() {
        let task = PollingTask::new("rearmed", Duration::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let weak = task.downgrade();
        task.add_callable(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0
                && let Some(task) = weak.upgrade()
            {
                task.save_start()?;
            }
            Ok(TickFlow::Stop)
        });

        task.start().unwrap();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!task.is_running());
    }

    #[test]
    fn test_observer_restarts_other_task_through_weak_handle() {
        let (first, _) = counting_task(Duration::from_millis(10));
        let (second, second_count) = counting_task(Duration::from_millis(10));

        let weak = second.downgrade();
        first.add_observer(move || {
            if let Some(task) = weak.upgrade() {
                let _ = task.save_start();
            }
        });

        first.start().unwrap();
        first.stop();
        thread::sleep(Duration::from_millis(40));
        assert!(second.is_running());
        assert!(second_count.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_set_interval_while_running() {
        let (task, count) = counting_task(Duration::from_secs(10));
        task.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // the pending long sleep is cut short by restart with the new interval
        task.set_interval(Duration::from_millis(10));
        task.restart().unwrap();
        thread::sleep(Duration::from_millis(60));
        assert!(count.load(Ordering::SeqCst) >= 3);
        assert_eq!(task.interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_restart_does_not_wait_for_blocked_callable() {
        let task = PollingTask::new("blocked", Duration::from_millis(10));
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        task.add_callable(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = entered_tx.send(());
                let _ = release_rx.recv();
            }
            Ok(TickFlow::Continue)
        });

        task.start().unwrap();
        entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        task.stop();
        let started = Instant::now();
        task.restart().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(task.is_running());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(release_tx);
        thread::sleep(Duration::from_millis(60));
        assert!(calls.load(Ordering::SeqCst) >= 2);
        task.stop();
    }

    #[test]
    fn test_drop_joins_worker() {
        let (task, count) = counting_task(Duration::from_millis(10));
        task.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        drop(task);
        let after_drop = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(count.load(Ordering::SeqCst), after_drop);
    }
}
