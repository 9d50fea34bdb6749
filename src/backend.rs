//! Execution backends.
//!
//! The data parallel building blocks of the decomposition (index maps,
//! stable key sorts, gathers and reductions) are provided by a [Backend]
//! selected as a type parameter. [HostBackend] runs serially on the calling
//! thread, [ThreadPoolBackend] runs on the rayon thread pool. Both produce
//! bitwise identical results.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Identifier of a backend, used in configuration files and for the
/// collective check that all ranks run the same backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Serial execution on the calling thread.
    #[default]
    Host,
    /// Data parallel execution on the rayon thread pool.
    ThreadPool,
}

impl BackendKind {
    /// Numeric identifier exchanged between ranks.
    pub fn id(self) -> u64 {
        match self {
            BackendKind::Host => 1,
            BackendKind::ThreadPool => 2,
        }
    }

    /// Gather `source[order[i]]` with the backend of this kind.
    pub fn gather<T: Copy + Send + Sync>(self, source: &[T], order: &[usize]) -> Vec<T> {
        match self {
            BackendKind::Host => HostBackend::gather(source, order),
            BackendKind::ThreadPool => ThreadPoolBackend::gather(source, order),
        }
    }
}

/// Capability set shared by all execution backends.
pub trait Backend: Send + Sync + 'static {
    /// Kind tag of the backend.
    const KIND: BackendKind;

    /// Evaluate `f` for every index in `0..n`.
    fn map_indices<T, F>(n: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Send + Sync;

    /// Stable argsort of `keys`.
    fn sort_permutation<K: Ord + Copy + Send + Sync>(keys: &[K]) -> Vec<usize>;

    /// Smallest and largest value, `None` for empty input.
    fn min_max(values: &[f64]) -> Option<(f64, f64)>;

    /// Gather `source[order[i]]`.
    fn gather<T: Copy + Send + Sync>(source: &[T], order: &[usize]) -> Vec<T> {
        Self::map_indices(order.len(), |index| source[order[index]])
    }
}

/// Serial execution on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostBackend;

/// Execution on the rayon thread pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPoolBackend;

impl Backend for HostBackend {
    const KIND: BackendKind = BackendKind::Host;

    fn map_indices<T, F>(n: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        (0..n).map(f).collect()
    }

    fn sort_permutation<K: Ord + Copy + Send + Sync>(keys: &[K]) -> Vec<usize> {
        let mut order = (0..keys.len()).collect::<Vec<_>>();
        order.sort_by_key(|&index| keys[index]);
        order
    }

    fn min_max(values: &[f64]) -> Option<(f64, f64)> {
        values.iter().fold(None, |acc, &value| match acc {
            None => Some((value, value)),
            Some((lo, hi)) => Some((f64::min(lo, value), f64::max(hi, value))),
        })
    }
}

impl Backend for ThreadPoolBackend {
    const KIND: BackendKind = BackendKind::ThreadPool;

    fn map_indices<T, F>(n: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        (0..n).into_par_iter().map(f).collect()
    }

    fn sort_permutation<K: Ord + Copy + Send + Sync>(keys: &[K]) -> Vec<usize> {
        let mut order = (0..keys.len()).collect::<Vec<_>>();
        order.par_sort_by_key(|&index| keys[index]);
        order
    }

    fn min_max(values: &[f64]) -> Option<(f64, f64)> {
        if values.is_empty() {
            return None;
        }
        let (lo, hi) = values
            .par_iter()
            .fold(
                || (f64::MAX, f64::MIN),
                |(lo, hi), &value| (f64::min(lo, value), f64::max(hi, value)),
            )
            .reduce(
                || (f64::MAX, f64::MIN),
                |a, b| (f64::min(a.0, b.0), f64::max(a.1, b.1)),
            );
        Some((lo, hi))
    }
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use super::{Backend, BackendKind, HostBackend, ThreadPoolBackend};
    use crate::tools::seeded_rng;

    #[test]
    fn test_backends_agree() {
        let mut rng = seeded_rng(4);
        // Few distinct values so that stability matters.
        let keys = (0..10_000).map(|_| rng.gen_range(0..50u32)).collect::<Vec<_>>();
        let values = (0..10_000).map(|_| rng.gen::<f64>()).collect::<Vec<_>>();

        let host = HostBackend::sort_permutation(&keys);
        let pool = ThreadPoolBackend::sort_permutation(&keys);
        assert_eq!(host, pool);

        for window in host.windows(2) {
            let (a, b) = (window[0], window[1]);
            assert!(keys[a] < keys[b] || (keys[a] == keys[b] && a < b));
        }

        assert_eq!(HostBackend::min_max(&values), ThreadPoolBackend::min_max(&values));
        assert_eq!(
            BackendKind::Host.gather(&values, &host),
            BackendKind::ThreadPool.gather(&values, &host)
        );
        assert_eq!(HostBackend::min_max(&[]), None);
        assert_eq!(ThreadPoolBackend::min_max(&[]), None);
    }
}
