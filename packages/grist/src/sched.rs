//! The concurrent job scheduler.
//!
//! Workers are tokio tasks spawned on demand, bounded by the parallelism
//! limit and the machine's load average. Non-serial jobs drain from a
//! priority-ordered ready queue; serial jobs drain from their own queue
//! behind a counting semaphore so at most `n_serial` of them are ever in
//! flight together.

use std::{
    collections::{BinaryHeap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use color_eyre::{Report, Result, eyre::eyre};
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::{Instant, sleep, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{
    fresh::Freshness,
    graph::Graph,
    registry::Build,
    rule::Job,
    sync::{Gauge, lock},
    uri::Uri,
};

/// How long an idle worker waits for new work before exiting.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Back-off between load-average probes while throttled.
const LOAD_PROBE: Duration = Duration::from_secs(1);

/// Scheduler knobs taken from the invocation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PoolOptions {
    pub jobs: usize,
    pub n_serial: usize,
    pub load_average: f64,
    pub keep_going: bool,
    pub dry_run: bool,
}

/// Queue entry ordered by `(priority, insertion)`; the monotonic sequence
/// number keeps ties stable.
struct Entry {
    priority: i64,
    seq: u64,
    job: Arc<Job>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        (self.priority, self.seq) == (other.priority, other.seq)
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the lowest (priority, seq) first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

/// Priority queue with an async bounded-wait pop.
#[derive(Default)]
struct JobQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    ready: Notify,
    seq: AtomicU64,
}

impl JobQueue {
    fn push(&self, job: Arc<Job>) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        lock(&self.heap).push(Entry {
            priority: job.priority(),
            seq,
            job,
        });
        self.ready.notify_one();
    }

    fn try_pop(&self) -> Option<Arc<Job>> {
        lock(&self.heap).pop().map(|entry| entry.job)
    }

    fn is_empty(&self) -> bool {
        lock(&self.heap).is_empty()
    }

    /// Pop, waiting up to `wait` for something to arrive.
    async fn pop_within(&self, wait: Duration) -> Option<Arc<Job>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(job) = self.try_pop() {
                return Some(job);
            }
            if timeout_at(deadline, self.ready.notified()).await.is_err() {
                // Final look, so a push racing the deadline is not stranded.
                return self.try_pop();
            }
        }
    }
}

struct WorkerSet {
    alive: usize,
    handles: Vec<JoinHandle<()>>,
}

struct Shared {
    build: Build,
    fresh: Freshness,
    dependents: HashMap<Uri, Vec<Arc<Job>>>,
    opts: PoolOptions,
    ready: JobQueue,
    serial: JobQueue,
    serial_slots: Arc<Semaphore>,
    running: Gauge,
    workers: Mutex<WorkerSet>,
    deferred_tx: flume::Sender<(Arc<Job>, Report)>,
    deferred_rx: flume::Receiver<(Arc<Job>, Report)>,
    fatal: Mutex<Option<Report>>,
    cancel: CancellationToken,
}

/// The worker pool for one execution.
#[derive(Clone)]
pub(crate) struct Pool {
    shared: Arc<Shared>,
}

impl Pool {
    pub(crate) fn new(build: Build, graph: &mut Graph, opts: PoolOptions) -> Self {
        let (deferred_tx, deferred_rx) = flume::unbounded();
        Self {
            shared: Arc::new(Shared {
                fresh: Freshness::new(build.clone()),
                build,
                dependents: std::mem::take(&mut graph.dependents),
                ready: JobQueue::default(),
                serial: JobQueue::default(),
                serial_slots: Arc::new(Semaphore::new(opts.n_serial)),
                running: Gauge::default(),
                workers: Mutex::new(WorkerSet {
                    alive: 0,
                    handles: Vec::new(),
                }),
                deferred_tx,
                deferred_rx,
                fatal: Mutex::new(None),
                cancel: CancellationToken::new(),
                opts,
            }),
        }
    }

    /// Drive the frontier to completion.
    ///
    /// Returns the deferred errors accumulated under keep-going; a fatal
    /// failure (a rule without keep-going, or an engine bug) is the `Err`.
    pub(crate) async fn run(&self, leaves: Vec<Arc<Job>>) -> Result<Vec<(Arc<Job>, Report)>> {
        self.seed(leaves);
        self.join_workers().await;
        if let Some(fatal) = lock(&self.shared.fatal).take() {
            return Err(fatal);
        }
        Ok(self.shared.deferred_rx.try_iter().collect())
    }

    /// Seed the frontier. Jobs beyond the worker limit are enqueued without
    /// a spawn check; the workers spawned for the remainder drain them.
    fn seed(&self, jobs: Vec<Arc<Job>>) {
        let spill = jobs.len().saturating_sub(self.shared.opts.jobs);
        for (index, job) in jobs.into_iter().enumerate() {
            if index < spill {
                self.enqueue(job);
            } else {
                self.push(job);
            }
        }
    }

    fn enqueue(&self, job: Arc<Job>) {
        trace!(%job, serial = job.serial(), "enqueue");
        if job.serial() {
            self.shared.serial.push(job);
        } else {
            self.shared.ready.push(job);
        }
    }

    fn push(&self, job: Arc<Job>) {
        self.enqueue(job);
        self.spawn_if_useful();
    }

    /// Spawn a worker if under the limit and the machine has headroom.
    /// One worker is always allowed, so enqueued work cannot strand.
    fn spawn_if_useful(&self) {
        let mut workers = lock(&self.shared.workers);
        let allowed = workers.alive < 1
            || (workers.alive < self.shared.opts.jobs
                && load_average() <= self.shared.opts.load_average);
        if !allowed {
            return;
        }
        workers.alive += 1;
        let pool = self.clone();
        workers
            .handles
            .push(tokio::spawn(async move { pool.work().await }));
    }

    async fn join_workers(&self) {
        loop {
            let handle = lock(&self.shared.workers).handles.pop();
            let Some(handle) = handle else { break };
            if let Err(err) = handle.await {
                // Workers never unwind on their own; this is an engine bug.
                self.fail_fast(eyre!("engine bug: worker panicked: {err}"));
            }
        }
    }

    /// Record a fatal error and stop handing out work. The first error
    /// wins; in-flight actions finish naturally.
    fn fail_fast(&self, err: Report) {
        error!("fatal: {err:?}");
        let mut fatal = lock(&self.shared.fatal);
        if fatal.is_none() {
            *fatal = Some(err);
        }
        self.shared.cancel.cancel();
    }

    async fn work(&self) {
        while !self.shared.cancel.is_cancelled() {
            let Some((job, slot)) = self.next_job().await else {
                break;
            };
            if let Err(err) = self.run_job(&job, slot).await {
                self.fail_fast(err);
                break;
            }
        }
        lock(&self.shared.workers).alive -= 1;
        // Work pushed while this worker was deciding to exit must not
        // strand; a waiting serial job whose slot is busy is served by the
        // slot holder when it releases.
        let serial_waiting = !self.shared.serial.is_empty()
            && self.shared.serial_slots.available_permits() > 0;
        if !self.shared.cancel.is_cancelled()
            && (!self.shared.ready.is_empty() || serial_waiting)
        {
            self.spawn_if_useful();
        }
    }

    /// Pick the next job: a serial slot first, then the ready queue.
    async fn next_job(&self) -> Option<(Arc<Job>, Option<OwnedSemaphorePermit>)> {
        if let Ok(slot) = Arc::clone(&self.shared.serial_slots).try_acquire_owned() {
            if let Some(job) = self.shared.serial.try_pop() {
                debug_assert!(job.serial());
                return Some((job, Some(slot)));
            }
            // Nothing serial to do; the slot frees on drop.
        }
        self.shared
            .ready
            .pop_within(IDLE_WAIT)
            .await
            .map(|job| (job, None))
    }

    /// Execute one picked job. `Err` means an engine bug or a fatal rule
    /// failure; deferred rule failures are absorbed here.
    async fn run_job(&self, job: &Arc<Job>, slot: Option<OwnedSemaphorePermit>) -> Result<()> {
        if job.remaining.remaining() != 0 {
            return Err(eyre!(
                "engine bug: {job} scheduled with {} unfinished dependencies",
                job.remaining.remaining()
            ));
        }

        let mut updated = false;
        let mut failed = false;
        match self.shared.fresh.is_stale(job).await {
            Err(err) => {
                failed = true;
                self.rule_failed(job, err.into()).await?;
            }
            Ok(false) => {
                debug!(%job, "up to date");
            }
            Ok(true) => {
                updated = true;
                self.throttle().await;
                self.shared.running.increment();
                if self.shared.opts.dry_run {
                    let mut out = String::new();
                    job.render(&mut out);
                    out.push('\n');
                    print!("{out}");
                } else {
                    debug!(%job, "executing");
                    if let Err(err) = Arc::clone(job).invoke().await {
                        failed = true;
                        self.rule_failed(job, err).await?;
                    }
                }
                self.shared.running.decrement();
            }
        }

        drop(slot);
        job.remaining.finish();
        if !failed {
            self.propagate(job, updated);
        }
        Ok(())
    }

    /// A rule failed: clean its targets, then defer or abort.
    async fn rule_failed(&self, job: &Arc<Job>, err: Report) -> Result<()> {
        error!(%job, "rule failed");
        error!("{err:?}");
        self.shared.build.rm_targets(job).await;
        if self.shared.opts.keep_going {
            let _ = self.shared.deferred_tx.send((Arc::clone(job), err));
            Ok(())
        } else {
            Err(err.wrap_err(format!("rule failed: {job}")))
        }
    }

    /// While other actions are running and the machine is above the load
    /// threshold, hold off starting another one.
    async fn throttle(&self) {
        if !self.shared.opts.load_average.is_finite() {
            return;
        }
        while self.shared.running.get() > 0 && load_average() > self.shared.opts.load_average {
            sleep(LOAD_PROBE).await;
        }
    }

    /// Tell everything waiting on this job's targets that they are done.
    fn propagate(&self, job: &Arc<Job>, updated: bool) {
        for target in job.targets() {
            // Requested top-level targets have no dependents.
            let Some(dependents) = self.shared.dependents.get(target) else {
                continue;
            };
            for dependent in dependents {
                let ready = dependent.remaining.count_down();
                dependent
                    .dry_run
                    .raise_if(updated && self.shared.opts.dry_run);
                if ready {
                    self.push(Arc::clone(dependent));
                }
            }
        }
    }
}

/// 1-minute load average; platforms without the notion report zero.
fn load_average() -> f64 {
    sysinfo::System::load_average().one
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq as pretty_assert_eq;

    use super::*;
    use crate::rule::no_op;

    fn job(name: &str, priority: i64) -> Arc<Job> {
        Job::file(
            vec![crate::uri::Uri::parse(name).unwrap()],
            Vec::new(),
            Vec::new(),
            false,
            false,
            priority,
            no_op(),
        )
    }

    fn popped_names(queue: &JobQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.try_pop())
            .map(|job| job.targets()[0].to_string())
            .collect()
    }

    #[test]
    fn queue_orders_by_priority_then_insertion() {
        let queue = JobQueue::default();
        queue.push(job("b", 1));
        queue.push(job("c", 2));
        queue.push(job("a", -1));
        queue.push(job("b2", 1));
        pretty_assert_eq!(popped_names(&queue), ["a", "b", "b2", "c"]);
    }

    #[test]
    fn queue_ties_stay_in_insertion_order() {
        let queue = JobQueue::default();
        for i in 0..16 {
            queue.push(job(&format!("j{i:02}"), 0));
        }
        let expected = (0..16).map(|i| format!("j{i:02}")).collect::<Vec<_>>();
        pretty_assert_eq!(popped_names(&queue), expected);
    }

    #[tokio::test]
    async fn bounded_pop_times_out_empty() {
        let queue = JobQueue::default();
        assert!(queue.pop_within(Duration::from_millis(5)).await.is_none());
    }

    #[tokio::test]
    async fn bounded_pop_wakes_on_push() {
        let queue = Arc::new(JobQueue::default());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop_within(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(job("x", 0));
        let popped = waiter.await.unwrap();
        assert!(popped.is_some());
    }
}
