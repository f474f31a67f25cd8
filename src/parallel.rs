//! Thread-index capability for the reducers.
//!
//! The reducers only need "run `f(ithr, nthr)` for every `ithr < nthr`" with
//! the end of the parallel region acting as a barrier. `ThreadTeam` owns a
//! dedicated rayon pool whose workers each run exactly one index;
//! `parallel_nd` is the same on the global pool.

use rayon::prelude::*;

use crate::types::{JitError, JitResult};

/// Run `f(ithr, nthr)` for every thread index; returns once all calls finished.
pub fn parallel_nd<F>(nthr: usize, f: F)
where
    F: Fn(usize, usize) + Sync,
{
    assert!(nthr > 0, "parallel region needs at least one thread");
    if nthr == 1 {
        f(0, 1);
        return;
    }
    (0..nthr).into_par_iter().for_each(|ithr| f(ithr, nthr));
}

/// A fixed-size pool where every worker runs one thread index.
#[derive(Debug)]
pub struct ThreadTeam {
    pool: rayon::ThreadPool,
}

impl ThreadTeam {
    pub fn new(nthr: usize) -> JitResult<Self> {
        if nthr == 0 {
            return Err(JitError::InvalidConfig("thread team of size 0".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(nthr)
            .thread_name(|idx| format!("jitkern-worker{idx}"))
            .build()
            .map_err(|e| JitError::InvalidConfig(format!("failed to build thread pool: {e}")))?;
        Ok(ThreadTeam { pool })
    }

    pub fn nthr(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `f(ithr, nthr)` once on each worker, concurrently.
    pub fn parallel<F>(&self, f: F)
    where
        F: Fn(usize, usize) + Sync,
    {
        self.pool.broadcast(|ctx| f(ctx.index(), ctx.num_threads()));
    }
}
