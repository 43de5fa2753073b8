use crate::core::error::{EngineError, Result};
use once_cell::sync::OnceCell;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// A yes/no flag with a third "let the callee decide" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tristate {
    False,
    True,
    #[default]
    Default,
}

impl FromStr for Tristate {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "on" | "true" | "yes" => Ok(Tristate::True),
            "0" | "off" | "false" | "no" => Ok(Tristate::False),
            "" | "auto" | "default" => Ok(Tristate::Default),
            other => Err(EngineError::Config(format!("expected on/off/auto, got {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Block,
    Spin,
}

impl fmt::Display for WaitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitMode::Block => f.write_str("block"),
            WaitMode::Spin => f.write_str("spin"),
        }
    }
}

const BLOCK: u8 = 0;
const SPIN: u8 = 1;

/// Cluster-of-clusters thread pool.
///
/// One outer pool thread per cluster hands a contiguous index range to that
/// cluster's inner pool. The wait mode is advisory state shared with the
/// compute kernels; rayon still parks idle workers on its own schedule.
///
/// Spin requests are counted rather than snapshotted, so generation calls
/// that overlap on a shared instance cannot leave it spinning.
pub struct NestedPools {
    outer: ThreadPool,
    inner: Vec<ThreadPool>,
    threads_per_cluster: usize,
    base_mode: AtomicU8,
    spinners: AtomicUsize,
}

impl NestedPools {
    pub fn new(clusters: usize, threads_per_cluster: usize) -> Result<Self> {
        let clusters = clusters.max(1);
        let threads_per_cluster = threads_per_cluster.max(1);

        let outer = ThreadPoolBuilder::new()
            .num_threads(clusters)
            .thread_name(|i| format!("localgen-cluster-{i}"))
            .build()
            .map_err(|e| EngineError::Pool(e.to_string()))?;

        let inner = (0..clusters)
            .map(|c| {
                ThreadPoolBuilder::new()
                    .num_threads(threads_per_cluster)
                    .thread_name(move |i| format!("localgen-{c}-{i}"))
                    .build()
                    .map_err(|e| EngineError::Pool(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(clusters, threads_per_cluster, "created nested thread pools");

        Ok(Self {
            outer,
            inner,
            threads_per_cluster,
            base_mode: AtomicU8::new(BLOCK),
            spinners: AtomicUsize::new(0),
        })
    }

    pub fn num_clusters(&self) -> usize {
        self.inner.len()
    }

    pub fn num_workers(&self) -> usize {
        self.inner.len() * self.threads_per_cluster
    }

    pub fn inner(&self, cluster: usize) -> &ThreadPool {
        &self.inner[cluster]
    }

    /// Runs `f(i, cluster)` for every `i` in `0..n`.
    pub fn parallel_for<F>(&self, n: usize, f: F)
    where
        F: Fn(usize, usize) + Sync,
    {
        if n == 0 {
            return;
        }
        let clusters = self.inner.len().min(n);
        let per_cluster = n.div_ceil(clusters);
        self.outer.install(|| {
            (0..clusters).into_par_iter().for_each(|c| {
                let begin = (c * per_cluster).min(n);
                let end = ((c + 1) * per_cluster).min(n);
                self.inner[c].install(|| (begin..end).into_par_iter().for_each(|i| f(i, c)));
            })
        });
    }

    /// Runs `f(row_index, row)` over `data` split into rows of `row_len`.
    pub fn for_each_row_mut<T, F>(&self, data: &mut [T], row_len: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Sync,
    {
        if data.is_empty() || row_len == 0 {
            return;
        }
        let rows = data.len().div_ceil(row_len);
        let clusters = self.inner.len().min(rows);
        let rows_per_cluster = rows.div_ceil(clusters);
        self.outer.install(|| {
            data.par_chunks_mut(rows_per_cluster * row_len)
                .enumerate()
                .for_each(|(c, block)| {
                    self.inner[c].install(|| {
                        block
                            .par_chunks_mut(row_len)
                            .enumerate()
                            .for_each(|(j, row)| f(c * rows_per_cluster + j, row))
                    })
                })
        });
    }

    /// Runs `f(i, &mut items[i])` for every item.
    pub fn for_each_mut<T, F>(&self, items: &mut [T], f: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Sync,
    {
        self.for_each_row_mut(items, 1, |i, row| f(i, &mut row[0]));
    }

    /// Effective wait mode: `Spin` while any `SpinGuard` asks for it or the
    /// base mode is `Spin`.
    ///
    /// Meant for kernels that keep their own workers between per-token
    /// steps and must choose between busy-waiting and parking. The rayon
    /// kernels in `crate::kernel` do not consult it; rayon parks on its own.
    pub fn wait_mode(&self) -> WaitMode {
        if self.spinners.load(Ordering::Acquire) > 0 {
            return WaitMode::Spin;
        }
        match self.base_mode.load(Ordering::Acquire) {
            SPIN => WaitMode::Spin,
            _ => WaitMode::Block,
        }
    }

    /// Sets the mode in effect when no guard requests spinning.
    pub fn set_wait_mode(&self, mode: WaitMode) {
        let value = match mode {
            WaitMode::Block => BLOCK,
            WaitMode::Spin => SPIN,
        };
        self.base_mode.store(value, Ordering::Release);
    }

    /// Spinning only pays off when every worker can own a core.
    fn auto_spin(&self) -> bool {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.num_clusters() + self.num_workers() <= cores
    }

    /// Requests spin-wait for the lifetime of the returned guard if
    /// `use_spinning` asks for it; dropping the guard withdraws the request,
    /// also while unwinding.
    pub fn spin_guard(&self, use_spinning: Tristate) -> SpinGuard<'_> {
        let spinning = match use_spinning {
            Tristate::True => true,
            Tristate::False => false,
            Tristate::Default => self.auto_spin(),
        };
        if spinning {
            self.spinners.fetch_add(1, Ordering::AcqRel);
        }
        SpinGuard {
            pools: self,
            spinning,
        }
    }
}

impl fmt::Debug for NestedPools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NestedPools")
            .field("clusters", &self.inner.len())
            .field("threads_per_cluster", &self.threads_per_cluster)
            .field("wait_mode", &self.wait_mode())
            .finish()
    }
}

#[must_use = "the spin request is withdrawn when the guard drops"]
pub struct SpinGuard<'a> {
    pools: &'a NestedPools,
    spinning: bool,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        if self.spinning {
            self.pools.spinners.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

static GLOBAL_POOLS: OnceCell<Arc<NestedPools>> = OnceCell::new();

/// Creates the process-wide pools on first call; later calls return the
/// existing instance and ignore the arguments.
pub fn init_global(clusters: usize, threads_per_cluster: usize) -> Result<Arc<NestedPools>> {
    GLOBAL_POOLS
        .get_or_try_init(|| NestedPools::new(clusters, threads_per_cluster).map(Arc::new))
        .cloned()
}

pub fn global() -> Option<Arc<NestedPools>> {
    GLOBAL_POOLS.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_parallel_for_visits_every_index_once() {
        let pools = NestedPools::new(3, 2).unwrap();
        let hits: Vec<AtomicUsize> = (0..101).map(|_| AtomicUsize::new(0)).collect();
        pools.parallel_for(hits.len(), |i, cluster| {
            assert!(cluster < 3);
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_for_each_row_mut_indices() {
        let pools = NestedPools::new(2, 2).unwrap();
        let mut data = vec![0usize; 7 * 3];
        pools.for_each_row_mut(&mut data, 3, |row, values| {
            for v in values.iter_mut() {
                *v = row;
            }
        });
        for (i, v) in data.iter().enumerate() {
            assert_eq!(*v, i / 3);
        }
    }

    #[test]
    fn test_spin_guard_restores_mode() {
        let pools = NestedPools::new(1, 1).unwrap();
        assert_eq!(pools.wait_mode(), WaitMode::Block);
        {
            let _guard = pools.spin_guard(Tristate::True);
            assert_eq!(pools.wait_mode(), WaitMode::Spin);
        }
        assert_eq!(pools.wait_mode(), WaitMode::Block);

        {
            let _guard = pools.spin_guard(Tristate::False);
            assert_eq!(pools.wait_mode(), WaitMode::Block);
        }

        pools.set_wait_mode(WaitMode::Spin);
        {
            let _guard = pools.spin_guard(Tristate::True);
        }
        assert_eq!(pools.wait_mode(), WaitMode::Spin);
    }

    #[test]
    fn test_overlapping_spin_guards() {
        let pools = NestedPools::new(1, 1).unwrap();
        let first = pools.spin_guard(Tristate::True);
        let second = pools.spin_guard(Tristate::True);
        drop(first);
        assert_eq!(pools.wait_mode(), WaitMode::Spin);
        drop(second);
        assert_eq!(pools.wait_mode(), WaitMode::Block);
    }

    #[test]
    fn test_spin_guards_across_threads() {
        let pools = NestedPools::new(1, 1).unwrap();
        let barrier = std::sync::Barrier::new(4);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let _guard = pools.spin_guard(Tristate::True);
                    barrier.wait();
                    assert_eq!(pools.wait_mode(), WaitMode::Spin);
                });
            }
        });
        assert_eq!(pools.wait_mode(), WaitMode::Block);
    }

    #[test]
    fn test_tristate_parse() {
        assert_eq!("on".parse::<Tristate>().unwrap(), Tristate::True);
        assert_eq!("OFF".parse::<Tristate>().unwrap(), Tristate::False);
        assert_eq!("auto".parse::<Tristate>().unwrap(), Tristate::Default);
        assert!("sometimes".parse::<Tristate>().is_err());
    }
}
