//! Shared-state primitives for the scheduler and the freshness cache.

use std::{
    future::Future,
    hash::Hash,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
    },
};

use dashmap::DashMap;
use tokio::sync::OnceCell;

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-way boolean flag.
///
/// Used for dry-run inheritance: once a job learns that a dependency would
/// have been rebuilt, that fact never un-happens within the run.
#[derive(Debug, Default)]
pub struct Flag(AtomicBool);

impl Flag {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Raise the flag if `value` is true; lowering is not possible.
    pub fn raise_if(&self, value: bool) {
        self.0.fetch_or(value, Ordering::SeqCst);
    }
}

/// Remaining-dependency countdown with a `-1` completion sentinel.
#[derive(Debug)]
pub struct Countdown(AtomicI64);

impl Countdown {
    pub fn new(count: usize) -> Self {
        Self(AtomicI64::new(count as i64))
    }

    pub fn remaining(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Decrement by one. True for exactly the call that reaches zero, so
    /// concurrent completions elect a single worker to enqueue the job.
    pub fn count_down(&self) -> bool {
        self.0.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Mark the countdown finished.
    pub fn finish(&self) {
        self.0.store(-1, Ordering::SeqCst);
    }
}

/// Counter for jobs currently inside their action body.
#[derive(Debug, Default)]
pub struct Gauge(AtomicUsize);

impl Gauge {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keyed memoising cache.
///
/// Each key's value is computed at most once for the lifetime of the cache.
/// Concurrent callers for the same key wait on that key's cell while other
/// keys proceed independently; a failed computation leaves the cell empty.
#[derive(Debug)]
pub struct Memo<K: Eq + Hash, V> {
    cells: DashMap<K, Arc<OnceCell<V>>>,
}

impl<K, V> Memo<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
        }
    }

    /// The memoised value for `key`, computing it with `init` on first use.
    pub async fn get_or_try<E, F, Fut>(&self, key: &K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let entry = self.cells.entry(key.clone()).or_default();
            Arc::clone(entry.value())
        };
        cell.get_or_try_init(init).await.cloned()
    }

    /// The value already memoised for `key`, if any.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.cells.get(key).and_then(|cell| cell.get().cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq as pretty_assert_eq;

    use super::*;

    #[test]
    fn flag_raises_and_stays() {
        let flag = Flag::default();
        assert!(!flag.get());
        flag.raise_if(false);
        assert!(!flag.get());
        flag.raise_if(true);
        flag.raise_if(false);
        assert!(flag.get());
    }

    #[test]
    fn countdown_elects_one_winner() {
        let countdown = Arc::new(Countdown::new(64));
        let zeroed = Arc::new(AtomicUsize::new(0));
        let handles = (0..64)
            .map(|_| {
                let countdown = Arc::clone(&countdown);
                let zeroed = Arc::clone(&zeroed);
                std::thread::spawn(move || {
                    if countdown.count_down() {
                        zeroed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        pretty_assert_eq!(zeroed.load(Ordering::SeqCst), 1);
        pretty_assert_eq!(countdown.remaining(), 0);
        countdown.finish();
        pretty_assert_eq!(countdown.remaining(), -1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn memo_computes_each_key_once() {
        let memo = Arc::new(Memo::<String, f64>::new());
        let computed = Arc::new(AtomicUsize::new(0));

        let tasks = (0..32)
            .map(|i| {
                let memo = Arc::clone(&memo);
                let computed = Arc::clone(&computed);
                tokio::spawn(async move {
                    let key = format!("k{}", i % 4);
                    memo.get_or_try::<std::convert::Infallible, _, _>(&key, || async {
                        computed.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(1.0)
                    })
                    .await
                    .unwrap()
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            pretty_assert_eq!(task.await.unwrap(), 1.0);
        }
        pretty_assert_eq!(computed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn memo_peek_sees_only_successes() {
        let memo = Memo::<&'static str, f64>::new();
        let missing = memo
            .get_or_try::<&'static str, _, _>(&"a", || async { Err("nope") })
            .await;
        assert!(missing.is_err());
        pretty_assert_eq!(memo.peek(&"a"), None);

        memo.get_or_try::<&'static str, _, _>(&"a", || async { Ok(2.5) })
            .await
            .unwrap();
        pretty_assert_eq!(memo.peek(&"a"), Some(2.5));
    }
}
