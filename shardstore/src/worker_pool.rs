//! Parallel execution of independent work groups.

use rayon::prelude::*;

/// A pool of workers that each process one group at a time.
///
/// A pool with a parallelism of 0 or 1 runs groups sequentially on the calling thread.
/// Otherwise, groups are run on a dedicated [`rayon`] thread pool sized at construction.
#[derive(Debug)]
pub struct WorkerPool {
    pool: Option<rayon::ThreadPool>,
}

impl WorkerPool {
    /// Create a worker pool with `parallelism` workers.
    ///
    /// If the thread pool cannot be built, a warning is logged and the pool runs sequentially.
    #[must_use]
    pub fn new(parallelism: usize) -> Self {
        if parallelism <= 1 {
            return Self::sequential();
        }
        match rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|index| format!("shardstore-worker-{index}"))
            .build()
        {
            Ok(pool) => Self { pool: Some(pool) },
            Err(err) => {
                log::warn!(
                    "failed to build a pool of {parallelism} workers, running sequentially: {err}"
                );
                Self::sequential()
            }
        }
    }

    /// Create a worker pool that runs groups sequentially on the calling thread.
    #[must_use]
    pub fn sequential() -> Self {
        Self { pool: None }
    }

    /// The number of groups that can run concurrently.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.pool
            .as_ref()
            .map_or(1, rayon::ThreadPool::current_num_threads)
    }

    /// Run `f` once for each of `groups`, returning the results in the order of `groups`.
    ///
    /// A failing group does not stop the remaining groups.
    pub fn try_for_each_group<G, T, E, F>(&self, groups: Vec<G>, f: F) -> Vec<Result<T, E>>
    where
        G: Send,
        T: Send,
        E: Send,
        F: Fn(G) -> Result<T, E> + Send + Sync,
    {
        match &self.pool {
            Some(pool) => pool.install(|| groups.into_par_iter().map(&f).collect()),
            None => groups.into_iter().map(f).collect(),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(rayon::current_num_threads())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn worker_pool_sequential() {
        for parallelism in [0, 1] {
            let pool = WorkerPool::new(parallelism);
            assert_eq!(pool.parallelism(), 1);
            let caller = std::thread::current().id();
            let results = pool.try_for_each_group(vec![1, 2, 3], |group| {
                assert_eq!(std::thread::current().id(), caller);
                if group == 2 {
                    Err(group)
                } else {
                    Ok(group * 10)
                }
            });
            assert_eq!(results, [Ok(10), Err(2), Ok(30)]);
        }
    }

    #[test]
    fn worker_pool_parallel() {
        let pool = WorkerPool::new(3);
        assert_eq!(pool.parallelism(), 3);
        let threads = Mutex::new(HashSet::new());
        let results = pool.try_for_each_group((0..64).collect(), |group: u32| {
            threads.lock().unwrap().insert(std::thread::current().id());
            Ok::<_, ()>(group)
        });
        assert_eq!(results, (0..64).map(Ok).collect::<Vec<_>>());
        assert!(!threads
            .lock()
            .unwrap()
            .contains(&std::thread::current().id()));
    }
}
