//! Multi-threaded tree construction with work stealing
//!
//! A task is one subdivision: evaluate the 2^N children of an ambiguous
//! cell under its specialized tape.  Finished children land in write-once
//! slots on the task; the last-arriving sibling (tracked by an atomic
//! `pending` counter) performs the bottom-up merge on its own worker and
//! recurses the result upward through the task chain.  Earlier siblings
//! return immediately; no lock is ever contended on the hot path.
use crate::{
    error::Error,
    simplex::{
        pool::{Pools, WorkerPools},
        region::Region,
        subspace::corner_count,
        tree::{CellBuilder, CellEval, SimplexTree},
        BuildSettings,
    },
    tape::{Subtape, Tape},
};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Stores data used to synchronize sleep and collective exit in a pool
pub(crate) struct ThreadPool {
    threads: std::sync::RwLock<Vec<std::thread::Thread>>,
    /// Low bits count registered threads; bits 8+ count sleepers
    counter: AtomicUsize,
}

impl ThreadPool {
    /// Builds thread pool storage for `n` threads
    pub fn new(n: usize) -> Self {
        Self {
            threads: std::sync::RwLock::new(vec![std::thread::current(); n]),
            counter: AtomicUsize::new(0),
        }
    }

    /// Builds a [`ThreadContext`] for the given thread
    ///
    /// Must be called from the worker thread itself (not the thread that
    /// constructed the pool); blocks until every worker has registered.
    pub fn start(&self, index: usize) -> ThreadContext {
        let mut w = self.threads.write().unwrap();
        let thread_count = w.len();
        assert!(index < thread_count);
        let my_thread = std::thread::current();
        assert_ne!(my_thread.id(), w[index].id());
        w[index] = my_thread;
        self.counter.fetch_add(1, Ordering::Release);

        // Wake the others; once everyone has registered, the counter hits
        // thread_count and they all proceed
        for (i, t) in w.iter().enumerate() {
            if i != index {
                t.unpark();
            }
        }
        drop(w);

        while self.counter.load(Ordering::Acquire) & 0xFF < thread_count {
            std::thread::park();
        }

        let threads = self.threads.read().unwrap();
        ThreadContext {
            threads,
            counter: &self.counter,
            index,
        }
    }
}

/// Local context for a thread operating within a pool
pub(crate) struct ThreadContext<'a> {
    threads: std::sync::RwLockReadGuard<'a, Vec<std::thread::Thread>>,
    counter: &'a AtomicUsize,
    index: usize,
}

impl ThreadContext<'_> {
    /// If some threads in the pool are sleeping, wakes them up
    ///
    /// Call when new work lands in a queue.
    pub fn wake(&self) {
        if self.counter.load(Ordering::Acquire) >> 8 != 0 {
            for (i, t) in self.threads.iter().enumerate() {
                if i != self.index {
                    t.unpark();
                }
            }
        }
    }

    /// Sends the given thread to sleep
    ///
    /// Returns `true` on success; `false` if every thread is asleep,
    /// meaning all work is done and the caller should exit.
    pub fn sleep(&self) -> bool {
        let c = 1 + (self.counter.fetch_add(256, Ordering::Release) >> 8);
        if c == self.threads.len() {
            // We're the last one awake; wake the others so they notice
            for (i, t) in self.threads.iter().enumerate() {
                if i != self.index {
                    t.unpark();
                }
            }
            return false;
        }
        std::thread::park();
        if self.counter.load(Ordering::Acquire) >> 8 == self.threads.len() {
            return false;
        }
        // Back to the grind
        self.counter.fetch_sub(256, Ordering::Release);
        true
    }
}

/// A work-stealing task queue
///
/// Each worker owns one queue and holds stealers for everyone else's, so
/// an idle worker can take over pending subdivisions.
pub(crate) struct QueuePool<T> {
    queue: crossbeam_deque::Worker<T>,
    friends: Vec<crossbeam_deque::Stealer<T>>,
    changed: bool,
    index: usize,
}

impl<T> QueuePool<T> {
    /// Builds a matched set of queues for `n` threads
    pub fn new(n: usize) -> Vec<Self> {
        let queues = (0..n)
            .map(|_| crossbeam_deque::Worker::<T>::new_lifo())
            .collect::<Vec<_>>();
        let stealers =
            queues.iter().map(|q| q.stealer()).collect::<Vec<_>>();
        queues
            .into_iter()
            .enumerate()
            .map(|(index, queue)| Self {
                queue,
                friends: stealers.clone(),
                changed: false,
                index,
            })
            .collect()
    }

    /// Pops an item from this queue, or steals one from a sibling
    pub fn pop(&mut self) -> Option<T> {
        self.changed = false;
        self.queue.pop().or_else(|| {
            use crossbeam_deque::Steal;
            for i in 1..self.friends.len() {
                let q = &self.friends[(i + self.index) % self.friends.len()];
                loop {
                    match q.steal() {
                        Steal::Success(v) => return Some(v),
                        Steal::Empty => break,
                        Steal::Retry => continue,
                    }
                }
            }
            None
        })
    }

    /// Pushes an item, marking the queue as changed
    pub fn push(&mut self, t: T) {
        self.queue.push(t);
        self.changed = true;
    }

    /// Checks whether items were pushed since the last `pop`
    pub fn changed(&self) -> bool {
        self.changed
    }
}

////////////////////////////////////////////////////////////////////////////

/// A pending subdivision, shared between the workers completing it
struct TaskData<const N: usize> {
    /// The ambiguous cell being subdivided
    region: Region<N>,

    /// Tape specialization under which the cell was discovered
    sub: Arc<Subtape>,

    /// Chain upward; `None` at the root
    parent: Option<Arc<TaskData<N>>>,

    /// This cell's slot in its parent's children
    child_index: usize,

    /// Outstanding children; the worker that decrements this to zero owns
    /// the merge
    pending: AtomicUsize,

    /// Write-once result slots, one per child
    slots: Vec<Mutex<Option<SimplexTree<N>>>>,
}

#[derive(Clone)]
struct Task<const N: usize> {
    data: Arc<TaskData<N>>,
}

impl<const N: usize> std::ops::Deref for Task<N> {
    type Target = TaskData<N>;
    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<const N: usize> Task<N> {
    fn new(
        region: Region<N>,
        sub: Arc<Subtape>,
        parent: Option<Arc<TaskData<N>>>,
        child_index: usize,
    ) -> Self {
        Self {
            data: Arc::new(TaskData {
                region,
                sub,
                parent,
                child_index,
                pending: AtomicUsize::new(corner_count(N)),
                slots: (0..corner_count(N))
                    .map(|_| Mutex::new(None))
                    .collect(),
            }),
        }
    }
}

struct Worker<const N: usize> {
    thread_index: usize,
    queue: QueuePool<Task<N>>,
    tape: Tape,
    builder: CellBuilder<N>,
    root: Arc<Mutex<Option<SimplexTree<N>>>>,
}

impl<const N: usize> Worker<N> {
    /// Runs this worker to completion as part of a worker group
    fn run(mut self, threads: &ThreadPool) -> WorkerPools<N> {
        let ctx = threads.start(self.thread_index);
        loop {
            if let Some(task) = self.queue.pop() {
                self.process(&task);
                if self.queue.changed() {
                    ctx.wake();
                }
                continue;
            }
            if !ctx.sleep() {
                break;
            }
        }
        self.builder.pools
    }

    /// Evaluates the 2^N children of a task's cell
    ///
    /// Finished children are recorded; ambiguous ones become new tasks
    /// carrying their own specialized tape snapshot.
    fn process(&mut self, task: &Task<N>) {
        self.tape.install(task.sub.clone());
        for (i, child) in task.region.subdivide().into_iter().enumerate() {
            let outcome = match self.builder.eval_cell(&mut self.tape, &child) {
                CellEval::Done(t) => Ok(t),
                CellEval::Recurse(h) => Err(h.snapshot()),
            };
            match outcome {
                Ok(t) => self.record(&task.data, i, t),
                Err(sub) => {
                    self.queue.push(Task::new(
                        child,
                        sub,
                        Some(task.data.clone()),
                        i,
                    ));
                }
            }
        }
    }

    /// Stores a finished child; the last sibling to arrive merges
    fn record(
        &mut self,
        task: &Arc<TaskData<N>>,
        i: usize,
        cell: SimplexTree<N>,
    ) {
        *task.slots[i].lock().unwrap() = Some(cell);
        if task.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let children: Vec<SimplexTree<N>> = task
                .slots
                .iter()
                .map(|s| s.lock().unwrap().take().unwrap())
                .collect();
            self.tape.install(task.sub.clone());
            let parent = self.builder.collect_children(
                &mut self.tape,
                &task.region,
                children,
            );
            match &task.parent {
                Some(p) => {
                    let p = p.clone();
                    let index = task.child_index;
                    self.record(&p, index, parent);
                }
                None => {
                    *self.root.lock().unwrap() = Some(parent);
                }
            }
        }
    }
}

/// Builds a tree across a fixed-size worker pool
///
/// The root cell is evaluated on the calling thread; if it must subdivide,
/// the recursion is handed to the pool as a single task and stolen from
/// there.  Always returns a structurally complete tree (placeholder cells
/// under cancellation); the caller inspects the error and cancel state.
pub(crate) fn build_parallel<const N: usize>(
    tape: &Tape,
    region: &Region<N>,
    settings: &BuildSettings,
    cancel: &Arc<AtomicBool>,
    err: &Arc<Mutex<Option<Error>>>,
    pools: &mut Pools<N>,
) -> Result<SimplexTree<N>, Error> {
    let threads = settings.threads;
    debug_assert!(threads > 0);
    let root_slot = Arc::new(Mutex::new(None));

    let mut workers = QueuePool::new(threads)
        .into_iter()
        .enumerate()
        .map(|(thread_index, queue)| {
            Ok(Worker {
                thread_index,
                queue,
                tape: tape.fork(),
                builder: CellBuilder::new(
                    tape,
                    settings,
                    cancel.clone(),
                    err.clone(),
                    std::mem::take(&mut pools.workers[thread_index]),
                )?,
                root: root_slot.clone(),
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let done = {
        let w0 = &mut workers[0];
        match w0.builder.eval_cell(&mut w0.tape, region) {
            CellEval::Done(t) => Some(t),
            CellEval::Recurse(h) => {
                let sub = h.snapshot();
                drop(h);
                w0.queue.push(Task::new(*region, sub, None, 0));
                None
            }
        }
    };

    let out = match done {
        Some(t) => {
            for (i, w) in workers.into_iter().enumerate() {
                pools.workers[i] = w.builder.pools;
            }
            t
        }
        None => {
            let pool = &ThreadPool::new(threads);
            let returned: Vec<WorkerPools<N>> = std::thread::scope(|s| {
                let mut handles = vec![];
                for w in workers {
                    handles.push(s.spawn(move || w.run(pool)));
                }
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            for (i, p) in returned.into_iter().enumerate() {
                pools.workers[i] = p;
            }
            root_slot
                .lock()
                .unwrap()
                .take()
                .expect("root task must complete")
        }
    };
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_queue_pool_stealing() {
        let mut queues = QueuePool::new(2);
        let mut counters = [0i32; 2];
        const DEPTH: usize = 5;
        queues[0].push(DEPTH);

        // Stealing shares a binary fan-out between two threads
        std::thread::scope(|s| {
            for (q, c) in queues.iter_mut().zip(counters.iter_mut()) {
                s.spawn(move || {
                    while let Some(i) = q.pop() {
                        *c += 1;
                        if i != 0 {
                            q.push(i - 1);
                            q.push(i - 1);
                        }
                        std::thread::sleep(
                            std::time::Duration::from_millis(1),
                        );
                    }
                });
            }
        });
        assert_eq!(
            counters[0] + counters[1],
            (1 << (DEPTH + 1)) - 1,
            "threads did not complete all work"
        );
    }

    #[test]
    fn test_thread_pool_sleep_exit() {
        const N: usize = 4;
        let pool = &ThreadPool::new(N);
        let done = &AtomicUsize::new(0);
        std::thread::scope(|s| {
            for i in 0..N {
                s.spawn(move || {
                    let ctx = pool.start(i);
                    for _ in 0..i {
                        std::thread::sleep(
                            std::time::Duration::from_millis(1),
                        );
                        ctx.wake();
                    }
                    while ctx.sleep() {
                        // spurious wakeup; go back to sleep
                    }
                    done.fetch_add(1, Ordering::Release);
                });
            }
        });
        assert_eq!(done.load(Ordering::Acquire), N);
    }
}
