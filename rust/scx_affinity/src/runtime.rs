// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Parallel runtime
//!
//! The affinity policy only needs two things from a fork-join runtime: a knob
//! for the number of worker threads and a way to run a closure once on every
//! worker, with each worker told its index. [`RayonRuntime`] provides both on
//! top of a rayon thread pool.

use anyhow::anyhow;
use anyhow::Result;
use log::debug;
use rayon::ThreadPool;
use rayon::ThreadPoolBuilder;
use std::sync::Arc;
use std::sync::Mutex;

pub trait ParallelRuntime: Send + Sync {
    /// Number of workers the next parallel region will run on.
    fn num_threads(&self) -> usize;

    /// Limit the runtime to `nr_threads` workers.
    fn set_num_threads(&self, nr_threads: usize) -> Result<()>;

    /// Run `op` once on every worker and wait for all of them. The argument
    /// is the worker's 0-based index.
    fn parallel_region(&self, op: &(dyn Fn(usize) + Sync)) -> Result<()>;

    /// Run `op` on one of the workers and wait for it. Work `op` forks stays
    /// inside the runtime.
    fn install(&self, op: Box<dyn FnOnce() + Send + '_>) -> Result<()>;
}

pub struct RayonRuntime {
    name_prefix: String,
    pool: Mutex<Option<Arc<ThreadPool>>>,
}

impl RayonRuntime {
    /// Create a runtime whose workers are named `<name_prefix>-<index>`. The
    /// pool itself is built on first use with rayon's default size.
    pub fn new(name_prefix: &str) -> RayonRuntime {
        RayonRuntime {
            name_prefix: name_prefix.to_string(),
            pool: Mutex::new(None),
        }
    }

    fn build_pool(&self, nr_threads: usize) -> Result<Arc<ThreadPool>> {
        let prefix = self.name_prefix.clone();
        let pool = ThreadPoolBuilder::new()
            .num_threads(nr_threads)
            .thread_name(move |i| format!("{}-{}", prefix, i))
            .build()
            .map_err(|e| anyhow!("Failed to create thread pool: {}", e))?;
        debug!(
            "Created thread pool {} with {} threads",
            self.name_prefix,
            pool.current_num_threads()
        );
        Ok(Arc::new(pool))
    }

    /// The current pool. Work run through [`ThreadPool::install`] on it lands
    /// on the same workers a parallel region was run on.
    pub fn pool(&self) -> Result<Arc<ThreadPool>> {
        let mut pool = self.pool.lock().map_err(|_| anyhow!("pool lock poisoned"))?;
        match pool.as_ref() {
            Some(pool) => Ok(pool.clone()),
            None => {
                let new = self.build_pool(0)?;
                *pool = Some(new.clone());
                Ok(new)
            }
        }
    }
}

impl ParallelRuntime for RayonRuntime {
    fn num_threads(&self) -> usize {
        match self.pool() {
            Ok(pool) => pool.current_num_threads(),
            Err(_) => rayon::current_num_threads(),
        }
    }

    fn set_num_threads(&self, nr_threads: usize) -> Result<()> {
        let mut pool = self.pool.lock().map_err(|_| anyhow!("pool lock poisoned"))?;
        if let Some(current) = pool.as_ref() {
            if current.current_num_threads() == nr_threads {
                return Ok(());
            }
        }
        *pool = Some(self.build_pool(nr_threads)?);
        Ok(())
    }

    fn parallel_region(&self, op: &(dyn Fn(usize) + Sync)) -> Result<()> {
        let pool = self.pool()?;
        pool.broadcast(|ctx| op(ctx.index()));
        Ok(())
    }

    fn install(&self, op: Box<dyn FnOnce() + Send + '_>) -> Result<()> {
        self.pool()?.install(op);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_set_num_threads() {
        let rt = RayonRuntime::new("test-worker");
        rt.set_num_threads(3).unwrap();
        assert_eq!(rt.num_threads(), 3);
        rt.set_num_threads(2).unwrap();
        assert_eq!(rt.num_threads(), 2);
        assert_eq!(rt.pool().unwrap().current_num_threads(), 2);
    }

    #[test]
    fn test_region_runs_on_every_worker() {
        let rt = RayonRuntime::new("test-worker");
        rt.set_num_threads(4).unwrap();

        let seen = Mutex::new(Vec::new());
        rt.parallel_region(&|index: usize| {
            let name = std::thread::current().name().map(str::to_string);
            seen.lock().unwrap().push((index, name));
        })
        .unwrap();

        let seen = seen.into_inner().unwrap();
        let indices: BTreeSet<usize> = seen.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, (0..4).collect::<BTreeSet<_>>());
        for (index, name) in seen {
            assert_eq!(name, Some(format!("test-worker-{}", index)));
        }
    }

    #[test]
    fn test_install_runs_on_worker() {
        let rt = RayonRuntime::new("install-worker");
        rt.set_num_threads(2).unwrap();

        let mut name = None;
        rt.install(Box::new(|| {
            name = std::thread::current().name().map(str::to_string);
        }))
        .unwrap();
        assert!(name.unwrap().starts_with("install-worker-"));
    }
}
