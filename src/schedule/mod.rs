//! Fork-join task scheduler with block-column dependencies
//!
//! Data dependencies are expressed against a per-matrix vector of
//! block-column slots: a task declares `In`, `Out`, or `InOut` on column
//! indices, tasks touching disjoint columns run in parallel, and tasks
//! with conflicting accesses to the same column serialise in submission
//! order. Dependency resolution is entirely local to a process.
//!
//! Two priorities exist; priority-1 tasks are preferred at dispatch
//! (best-effort, no preemption of running work). Panel factorizations
//! run nested parallelism on a dedicated pool sized by
//! `max_panel_threads`, so the outer graph and the inner region coexist
//! without per-panel thread creation.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A data dependency on one block-column slot
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dep {
    /// Read the column; serialises after the last writer
    In(usize),
    /// Overwrite the column; serialises after readers and writers
    Out(usize),
    /// Read-modify-write; serialises after readers and writers
    InOut(usize),
}

/// Scheduler sizing
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Worker threads executing graph tasks
    pub workers: usize,
    /// Threads available to one nested panel region
    pub max_panel_threads: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let avail = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            workers: avail,
            max_panel_threads: (avail / 2).max(1),
        }
    }
}

type TaskBody = Box<dyn FnOnce() -> Result<()> + Send>;

struct Task {
    body: Option<TaskBody>,
    pending: usize,
    priority: usize,
    group: u64,
    dependents: Vec<u64>,
}

#[derive(Default)]
struct ColumnState {
    last_writer: Option<u64>,
    readers: Vec<u64>,
}

struct GroupState {
    remaining: usize,
    error: Option<Error>,
}

struct GraphState {
    next_task: u64,
    next_group: u64,
    tasks: HashMap<u64, Task>,
    ready: [VecDeque<u64>; 2],
    columns: HashMap<usize, ColumnState>,
    groups: HashMap<u64, GroupState>,
}

impl Default for GraphState {
    fn default() -> Self {
        Self {
            next_task: 0,
            next_group: 0,
            tasks: HashMap::new(),
            ready: [VecDeque::new(), VecDeque::new()],
            columns: HashMap::new(),
            groups: HashMap::new(),
        }
    }
}

struct Inner {
    state: Mutex<GraphState>,
    work_cv: Condvar,
    done_cv: Condvar,
    shutdown: AtomicBool,
}

/// Task runtime owning a worker pool and a nested panel pool
pub struct Scheduler {
    inner: Arc<Inner>,
    panel_pool: Arc<rayon::ThreadPool>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler with the given sizing
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(GraphState::default()),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let panel_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_panel_threads.max(1))
            .thread_name(|i| format!("tilr-panel-{}", i))
            .build()
            .map_err(|e| Error::invariant(format!("panel pool: {}", e)))?;

        let workers = (0..config.workers.max(1))
            .map(|w| {
                let inner = inner.clone();
                std::thread::Builder::new()
                    .name(format!("tilr-worker-{}", w))
                    .spawn(move || worker_loop(&inner))
                    .map_err(|e| Error::invariant(format!("worker spawn: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            inner,
            panel_pool: Arc::new(panel_pool),
            workers,
        })
    }

    /// Scheduler with default sizing
    pub fn with_defaults() -> Result<Self> {
        Self::new(SchedulerConfig::default())
    }

    /// The nested-parallel pool for panel work
    pub fn panel_pool(&self) -> &Arc<rayon::ThreadPool> {
        &self.panel_pool
    }

    /// Open a task group; tasks spawned into it complete before
    /// [`TaskGroup::wait`] returns.
    pub fn group(&self) -> TaskGroup {
        let mut state = self.inner.state.lock();
        let id = state.next_group;
        state.next_group += 1;
        state.groups.insert(
            id,
            GroupState {
                remaining: 0,
                error: None,
            },
        );
        TaskGroup {
            inner: self.inner.clone(),
            id,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.work_cv.notify_all();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

/// Handle to a set of tasks that complete together
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<Inner>,
    id: u64,
}

impl TaskGroup {
    /// Enqueue a task with the given dependencies and priority (0 or 1).
    ///
    /// The body runs once all its column dependencies are satisfied. If
    /// the group has already captured a failure, later bodies are
    /// skipped as they come up.
    pub fn spawn<F>(&self, deps: &[Dep], priority: usize, body: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        debug_assert!(priority <= 1);
        let mut state = self.inner.state.lock();
        let id = state.next_task;
        state.next_task += 1;

        let mut sources: Vec<u64> = Vec::new();
        for dep in deps {
            match *dep {
                Dep::In(c) => {
                    let col = state.columns.entry(c).or_default();
                    if let Some(w) = col.last_writer {
                        sources.push(w);
                    }
                    col.readers.push(id);
                }
                Dep::Out(c) | Dep::InOut(c) => {
                    let col = state.columns.entry(c).or_default();
                    if let Some(w) = col.last_writer {
                        sources.push(w);
                    }
                    sources.extend(col.readers.iter().copied());
                    col.readers.clear();
                    col.last_writer = Some(id);
                }
            }
        }
        sources.sort_unstable();
        sources.dedup();
        sources.retain(|s| *s != id);

        let mut pending = 0;
        for s in &sources {
            if let Some(src) = state.tasks.get_mut(s) {
                src.dependents.push(id);
                pending += 1;
            }
        }

        state.tasks.insert(
            id,
            Task {
                body: Some(Box::new(body)),
                pending,
                priority,
                group: self.id,
                dependents: Vec::new(),
            },
        );
        state
            .groups
            .get_mut(&self.id)
            .expect("group outlives its tasks")
            .remaining += 1;

        if pending == 0 {
            state.ready[priority].push_back(id);
            drop(state);
            self.inner.work_cv.notify_one();
        }
    }

    /// Block until every task in the group has completed; surfaces the
    /// first captured failure.
    pub fn wait(self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while state.groups.get(&self.id).map(|g| g.remaining) != Some(0) {
            self.inner.done_cv.wait(&mut state);
        }
        let group = state.groups.remove(&self.id).expect("group present");
        match group.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let (id, body) = {
            let mut state = inner.state.lock();
            let id = loop {
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(id) = state.ready[1].pop_front() {
                    break id;
                }
                if let Some(id) = state.ready[0].pop_front() {
                    break id;
                }
                inner.work_cv.wait(&mut state);
            };
            let group_id = state.tasks.get(&id).expect("ready task exists").group;
            let poisoned = state
                .groups
                .get(&group_id)
                .map(|g| g.error.is_some())
                .unwrap_or(false);
            let body = if poisoned {
                None
            } else {
                state.tasks.get_mut(&id).unwrap().body.take()
            };
            (id, body)
        };

        let outcome = match body {
            Some(body) => match catch_unwind(AssertUnwindSafe(body)) {
                Ok(res) => res,
                Err(_) => Err(Error::invariant("task panicked")),
            },
            None => Ok(()), // skipped: group already failed
        };

        let mut state = inner.state.lock();
        let task = state.tasks.remove(&id).expect("task completes once");
        for dep in task.dependents {
            if let Some(t) = state.tasks.get_mut(&dep) {
                t.pending -= 1;
                if t.pending == 0 {
                    let p = t.priority;
                    state.ready[p].push_back(dep);
                    inner.work_cv.notify_one();
                }
            }
        }
        if let Some(group) = state.groups.get_mut(&task.group) {
            if let Err(e) = outcome {
                log::debug!("task failed, poisoning group: {}", e);
                group.error.get_or_insert(e);
            }
            group.remaining -= 1;
            if group.remaining == 0 {
                inner.done_cv.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn small() -> Scheduler {
        Scheduler::new(SchedulerConfig {
            workers: 3,
            max_panel_threads: 2,
        })
        .unwrap()
    }

    #[test]
    fn test_same_column_serialises() {
        let sched = small();
        let group = sched.group();
        let log = Arc::new(Mutex::new(Vec::new()));

        for n in 0..8 {
            let log = log.clone();
            group.spawn(&[Dep::InOut(0)], 0, move || {
                log.lock().push(n);
                Ok(())
            });
        }
        group.wait().unwrap();
        assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_disjoint_columns_run_concurrently() {
        let sched = small();
        let group = sched.group();
        let peak = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));

        for c in 0..3 {
            let peak = peak.clone();
            let live = live.clone();
            group.spawn(&[Dep::InOut(c)], 0, move || {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(30));
                live.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        group.wait().unwrap();
        assert!(peak.load(Ordering::SeqCst) >= 2, "no overlap observed");
    }

    #[test]
    fn test_reader_writer_ordering() {
        let sched = small();
        let group = sched.group();
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        group.spawn(&[Dep::InOut(5)], 0, move || {
            l.lock().push("write1");
            Ok(())
        });
        for _ in 0..2 {
            let l = log.clone();
            group.spawn(&[Dep::In(5)], 0, move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                l.lock().push("read");
                Ok(())
            });
        }
        let l = log.clone();
        group.spawn(&[Dep::InOut(5)], 0, move || {
            l.lock().push("write2");
            Ok(())
        });
        group.wait().unwrap();

        let order = log.lock();
        assert_eq!(order[0], "write1");
        assert_eq!(order[3], "write2");
    }

    #[test]
    fn test_lookahead_chain_shape() {
        // the canonical pattern: step-k trailing task takes InOut on the
        // last column, forcing step k+1's panel to wait for it
        let sched = small();
        let group = sched.group();
        let log = Arc::new(Mutex::new(Vec::new()));
        let nt = 4;

        for k in 0..2usize {
            let l = log.clone();
            group.spawn(&[Dep::InOut(k)], 1, move || {
                l.lock().push(format!("panel{}", k));
                Ok(())
            });
            let l = log.clone();
            group.spawn(
                &[Dep::In(k), Dep::InOut(k + 1), Dep::InOut(nt - 1)],
                0,
                move || {
                    l.lock().push(format!("trail{}", k));
                    Ok(())
                },
            );
        }
        group.wait().unwrap();

        let order = log.lock();
        let pos = |s: &str| order.iter().position(|x| x == s).unwrap();
        assert!(pos("panel0") < pos("trail0"));
        assert!(pos("trail0") < pos("trail1"));
        assert!(pos("panel1") < pos("trail1"));
    }

    #[test]
    fn test_first_error_surfaces() {
        let sched = small();
        let group = sched.group();

        group.spawn(&[Dep::InOut(0)], 0, || {
            Err(Error::Numerical { info: 7 })
        });
        // serialised after the failure; skipped once the group poisons
        group.spawn(&[Dep::InOut(0)], 0, || Ok(()));

        let err = group.wait().unwrap_err();
        assert!(matches!(err, Error::Numerical { info: 7 }));
    }

    #[test]
    fn test_panic_becomes_error() {
        let sched = small();
        let group = sched.group();
        group.spawn(&[], 0, || panic!("kernel blew up"));
        assert!(group.wait().is_err());
    }

    #[test]
    fn test_panel_pool_nested_region() {
        let sched = small();
        let group = sched.group();
        let pool = sched.panel_pool().clone();
        let sum = Arc::new(AtomicUsize::new(0));

        let s = sum.clone();
        group.spawn(&[Dep::InOut(0)], 1, move || {
            pool.install(|| {
                use rayon::prelude::*;
                let total: usize = (0..100usize).into_par_iter().sum();
                s.store(total, Ordering::SeqCst);
            });
            Ok(())
        });
        group.wait().unwrap();
        assert_eq!(sum.load(Ordering::SeqCst), 4950);
    }
}
