//! Multi-threaded partial-result reduction.
//!
//! A primitive whose threads each produce a partial result for the same
//! output jobs balances the work with a `ReduceBalancer`, books scratch for
//! the partial buffers, and after a barrier calls `reduce_nolock` on every
//! thread:
//!
//! ```text
//! configure:  CpuReducer::new(conf) ─▶ init_scratchpad(&mut registry)
//! per call:   registry.book() ─▶ parallel: compute into get_local_ptr(ithr)
//!             barrier ─▶ parallel: reduce_nolock(ithr) ─▶ barrier
//! ```
//!
//! `CpuReducer` sums 1-D job runs into the leader's slot, which is the final
//! destination. `CpuReducer2D` keeps every thread's partial tiles in scratch
//! and writes the sum into a 2-D destination tile by tile.

pub mod balancer;
pub mod driver;
pub mod scratchpad;

pub use balancer::{balance211, BalancerInputs, ReduceBalancer};
pub use driver::{DriverParams, ReductionDriver};
pub use scratchpad::{Scratchpad, ScratchpadRegistry};

use std::mem::size_of;

use balancer::div_up;
use scratchpad::{KEY_REDUCER_SPACE, KEY_REDUCER_SPACE_2D, PAGE_ALIGN};

use crate::dispatch::{best_isa, IsaLevel};
use crate::types::{JitResult, ReduceElem};

/// Cache line in bytes; the 1-D reducer splits work in whole lines.
const CACHE_LINE: usize = 64;

/// Configuration for `CpuReducer`. The element type is the reducer's type
/// parameter.
#[derive(Debug, Clone)]
pub struct ReducerConfig {
    pub inputs: BalancerInputs,
    /// Code generation target for the driver.
    pub isa: IsaLevel,
}

impl ReducerConfig {
    pub fn new(inputs: BalancerInputs) -> Self {
        ReducerConfig {
            inputs,
            isa: best_isa(),
        }
    }

    pub fn isa(mut self, isa: IsaLevel) -> Self {
        self.isa = isa;
        self
    }
}

/// 1-D reducer: group leaders compute straight into the destination,
/// followers into scratch.
#[derive(Debug)]
pub struct CpuReducer<T: ReduceElem> {
    balancer: ReduceBalancer,
    drv: Option<ReductionDriver<T>>,
}

impl<T: ReduceElem> CpuReducer<T> {
    /// Balance and generate the driver (only needed when groups share jobs).
    pub fn new(conf: ReducerConfig) -> JitResult<Self> {
        let balancer = ReduceBalancer::new(conf.inputs);
        let drv = if balancer.nthr_per_group > 1 {
            Some(ReductionDriver::new(
                conf.isa,
                balancer.nthr_per_group - 1,
                balancer.space_per_thread(),
                0,
                0,
                false,
            )?)
        } else {
            None
        };
        Ok(CpuReducer { balancer, drv })
    }

    pub fn balancer(&self) -> &ReduceBalancer {
        &self.balancer
    }

    /// Scratch elements for every follower slot.
    pub fn space_size(&self) -> usize {
        let b = &self.balancer;
        b.ngroups * (b.nthr_per_group - 1) * b.space_per_thread()
    }

    pub fn init_scratchpad(&self, registry: &mut ScratchpadRegistry) -> JitResult<()> {
        if self.balancer.nthr_per_group == 1 {
            return Ok(());
        }
        registry.reserve(KEY_REDUCER_SPACE, self.space_size() * size_of::<T>(), PAGE_ALIGN)
    }

    /// Where thread `ithr` writes its partial result for its group's jobs.
    ///
    /// `dst` is the full destination; leaders get their slice of it.
    pub fn get_local_ptr(&self, ithr: usize, dst: *mut T, scratchpad: &Scratchpad) -> JitResult<*mut T> {
        let b = &self.balancer;
        let id = b.id_in_group(ithr);
        if id == 0 {
            // SAFETY: job offsets stay inside the njobs*job_size destination.
            return Ok(unsafe { dst.add(b.ithr_job_off(ithr) * b.job_size) });
        }
        let space = scratchpad.get::<T>(KEY_REDUCER_SPACE, self.space_size())?;
        let slot = b.group_id(ithr) * (b.nthr_per_group - 1) + id - 1;
        // SAFETY: slot < ngroups*(nthr_per_group-1).
        Ok(unsafe { space.add(slot * b.space_per_thread()) })
    }

    /// Sum this thread's share of its group's partial buffers into the leader slot.
    ///
    /// # Safety
    /// Every thread of the group must have finished writing its partial
    /// result, and nobody may read the destination until all threads return.
    /// `dst` must hold `njobs * job_size` elements.
    pub unsafe fn reduce_nolock(&self, ithr: usize, dst: *mut T, scratchpad: &Scratchpad) -> JitResult<()> {
        let b = &self.balancer;
        let Some(drv) = &self.drv else {
            return Ok(());
        };
        if b.idle(ithr) {
            return Ok(());
        }

        let id = b.id_in_group(ithr);
        let cl = CACHE_LINE / size_of::<T>();
        let reduction_size = b.ithr_njobs(ithr) * b.job_size;
        let (start, end) = balance211(div_up(reduction_size, cl), b.nthr_per_group, id);
        if start == end {
            return Ok(());
        }

        let d = self.get_local_ptr(ithr - id, dst, scratchpad)?.add(start * cl);
        let space = self.get_local_ptr(ithr - id + 1, dst, scratchpad)?.add(start * cl);
        let len = (end * cl).min(reduction_size) - start * cl;
        drv.invoke(d, space, 1, len);
        Ok(())
    }
}

/// Configuration for `CpuReducer2D`.
///
/// The destination is a `dst_y × dst_x` row-major tile grid of
/// `job_size_y × job_size_x` jobs; edge jobs may be ragged.
#[derive(Debug, Clone)]
pub struct Reducer2DConfig {
    pub inputs: BalancerInputs,
    pub job_size_x: usize,
    pub job_size_y: usize,
    /// Granularity of the X split inside a job.
    pub x_block: usize,
    pub dst_x: usize,
    pub dst_y: usize,
    pub isa: IsaLevel,
}

impl Reducer2DConfig {
    pub fn new(
        nthr: usize,
        reduction_size: usize,
        (dst_y, dst_x): (usize, usize),
        (job_size_y, job_size_x): (usize, usize),
        x_block: usize,
    ) -> Self {
        assert!(job_size_x > 0 && job_size_y > 0 && x_block > 0, "2-D job shape must be positive");
        let njobs = div_up(dst_x, job_size_x) * div_up(dst_y, job_size_y);
        Reducer2DConfig {
            inputs: BalancerInputs::new(nthr, njobs, job_size_x * job_size_y, reduction_size),
            job_size_x,
            job_size_y,
            x_block,
            dst_x,
            dst_y,
            isa: best_isa(),
        }
    }

    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.inputs.max_buffer_size = size;
        self
    }

    pub fn isa(mut self, isa: IsaLevel) -> Self {
        self.isa = isa;
        self
    }
}

/// 2-D reducer: every thread computes into scratch; the sum lands in the
/// destination tiles.
#[derive(Debug)]
pub struct CpuReducer2D<T: ReduceElem> {
    conf: Reducer2DConfig,
    balancer: ReduceBalancer,
    drv: Option<ReductionDriver<T>>,
}

impl<T: ReduceElem> CpuReducer2D<T> {
    pub fn new(conf: Reducer2DConfig) -> JitResult<Self> {
        assert_eq!(conf.inputs.job_size, conf.job_size_x * conf.job_size_y);
        let balancer = ReduceBalancer::new(conf.inputs);
        let drv = if balancer.nthr_per_group > 1 {
            Some(ReductionDriver::new(
                conf.isa,
                balancer.nthr_per_group,
                balancer.space_per_thread(),
                conf.job_size_x,
                conf.dst_x,
                true,
            )?)
        } else {
            None
        };
        Ok(CpuReducer2D { conf, balancer, drv })
    }

    pub fn balancer(&self) -> &ReduceBalancer {
        &self.balancer
    }

    pub fn config(&self) -> &Reducer2DConfig {
        &self.conf
    }

    /// Scratch elements for every thread slot.
    pub fn space_size(&self) -> usize {
        let b = &self.balancer;
        b.ngroups * b.nthr_per_group * b.space_per_thread()
    }

    pub fn init_scratchpad(&self, registry: &mut ScratchpadRegistry) -> JitResult<()> {
        if self.balancer.nthr_per_group == 1 {
            return Ok(());
        }
        registry.reserve(KEY_REDUCER_SPACE_2D, self.space_size() * size_of::<T>(), PAGE_ALIGN)
    }

    /// Thread `ithr`'s scratch slot. Job `j` of its group sits at
    /// `j * job_size`, rows `job_size_x` apart.
    ///
    /// With one thread per group nothing is booked and threads compute
    /// straight into the destination.
    pub fn get_local_ptr(&self, ithr: usize, scratchpad: &Scratchpad) -> JitResult<*mut T> {
        let b = &self.balancer;
        let space = scratchpad.get::<T>(KEY_REDUCER_SPACE_2D, self.space_size())?;
        let slot = b.group_id(ithr) * b.nthr_per_group + b.id_in_group(ithr);
        // SAFETY: slot < ngroups*nthr_per_group for non-idle threads.
        Ok(unsafe { space.add(slot * b.space_per_thread()) })
    }

    /// X chunk (in elements) threads split a job's rows into.
    ///
    /// Shrinks `nx / x_block` by halves and thirds while every one of
    /// `nthr_per_grp` threads would still get a chunk. Rows that are not a
    /// whole number of blocks are split in whole rows.
    pub fn choose_x_blocking(&self, nx: usize, ny: usize, nthr_per_grp: usize) -> usize {
        let x_block = self.conf.x_block;
        if nx < x_block || nx % x_block != 0 {
            return nx;
        }
        let mut x_blocking = nx / x_block;
        let min_x_blocking = div_up(x_blocking, (nthr_per_grp / ny.max(1)).max(1));
        loop {
            if x_blocking % 2 == 0 && x_blocking >= min_x_blocking * 2 {
                x_blocking /= 2;
            } else if x_blocking % 3 == 0 && x_blocking >= min_x_blocking * 3 {
                x_blocking /= 3;
            } else {
                break;
            }
        }
        if x_blocking >= min_x_blocking * 4 {
            x_blocking = 1;
        }
        x_blocking * x_block
    }

    /// Reduce a `ny_step × nx_step` window of group job `job`.
    ///
    /// # Safety
    /// The window must lie inside the job and `dst`.
    pub unsafe fn reduce_block(
        &self,
        space_base: *const T,
        dst: *mut T,
        job: usize,
        (start_y, start_x): (usize, usize),
        (ny_start, nx_start): (usize, usize),
        (ny_step, nx_step): (usize, usize),
    ) {
        let Some(drv) = &self.drv else {
            return;
        };
        let d = dst.add((start_y + ny_start) * self.conf.dst_x + start_x + nx_start);
        let space = space_base.add(job * self.balancer.job_size + ny_start * self.conf.job_size_x + nx_start);
        drv.invoke(d, space, ny_step, nx_step);
    }

    /// Sum every thread's partial tiles of this thread's share into `dst`.
    ///
    /// # Safety
    /// As for `CpuReducer::reduce_nolock`; `dst` must hold `dst_y * dst_x`
    /// elements.
    pub unsafe fn reduce_nolock(&self, ithr: usize, dst: *mut T, scratchpad: &Scratchpad) -> JitResult<()> {
        let b = &self.balancer;
        if b.nthr_per_group == 1 || b.idle(ithr) {
            return Ok(());
        }
        let c = &self.conf;

        let id_in_grp = b.id_in_group(ithr);
        let njobs_in_grp = b.ithr_njobs(ithr);
        let njobs_x = div_up(c.dst_x, c.job_size_x);
        let global_job_start = b.ithr_job_off(ithr);
        let space_base = self.get_local_ptr(ithr - id_in_grp, scratchpad)?.cast_const();

        // threads of a group split its jobs, then each job's rows
        let pr_grps = njobs_in_grp.min(b.nthr_per_group);
        if pr_grps == 0 {
            return Ok(());
        }
        let pr_nthr_per_grp = b.nthr_per_group / pr_grps;
        if id_in_grp >= pr_grps * pr_nthr_per_grp {
            return Ok(());
        }
        let pr_my_grp = id_in_grp / pr_nthr_per_grp;
        let pr_my_id = id_in_grp % pr_nthr_per_grp;
        let (pr_job_start, pr_job_end) = balance211(njobs_in_grp, pr_grps, pr_my_grp);

        for j in pr_job_start..pr_job_end {
            let global_job = global_job_start + j;
            let start = (global_job / njobs_x * c.job_size_y, global_job % njobs_x * c.job_size_x);
            let ny = (c.dst_y - start.0).min(c.job_size_y);
            let nx = (c.dst_x - start.1).min(c.job_size_x);
            let x_blocking = self.choose_x_blocking(nx, ny, pr_nthr_per_grp);

            let (s, e) = balance211(ny * nx / x_blocking, pr_nthr_per_grp, pr_my_id);
            if s == e {
                continue;
            }
            let (mut nxy, nxy_end) = (s * x_blocking, e * x_blocking);

            if nxy % nx != 0 {
                let nx_step = (nx - nxy % nx).min(nxy_end - nxy);
                self.reduce_block(space_base, dst, j, start, (nxy / nx, nxy % nx), (1, nx_step));
                nxy += nx_step;
            }
            if nxy_end - nxy > nx {
                let ny_step = (nxy_end - nxy) / nx;
                self.reduce_block(space_base, dst, j, start, (nxy / nx, nxy % nx), (ny_step, nx));
                nxy += nx * ny_step;
            }
            if nxy_end > nxy {
                self.reduce_block(space_base, dst, j, start, (nxy / nx, nxy % nx), (1, nxy_end - nxy));
            }
        }
        Ok(())
    }
}

/// One-shot `dst += src`.
#[derive(Debug)]
pub struct CpuAccumulator1D<T: ReduceElem> {
    drv: ReductionDriver<T>,
}

impl<T: ReduceElem> CpuAccumulator1D<T> {
    pub fn new(isa: IsaLevel) -> JitResult<Self> {
        Ok(CpuAccumulator1D {
            drv: ReductionDriver::new(isa, 1, 0, 0, 0, false)?,
        })
    }

    /// # Safety
    /// `dst` and `src` must be valid for `size` elements; `dst` for writes.
    #[inline]
    pub unsafe fn accumulate(&self, dst: *mut T, src: *const T, size: usize) {
        self.drv.invoke(dst, src, 1, size);
    }

    /// `dst[i] += src[i]` over the common length.
    pub fn accumulate_slice(&self, dst: &mut [T], src: &[T]) {
        let n = dst.len().min(src.len());
        if n > 0 {
            // SAFETY: both slices hold at least n elements.
            unsafe { self.accumulate(dst.as_mut_ptr(), src.as_ptr(), n) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_for<T: ReduceElem>(r: &CpuReducer<T>) -> Scratchpad {
        let mut reg = ScratchpadRegistry::new();
        r.init_scratchpad(&mut reg).unwrap();
        reg.book().unwrap()
    }

    /// Runs both phases sequentially, thread by thread.
    fn reduce_1d(nthr: usize, njobs: usize, job_size: usize) -> (Vec<f32>, Vec<f32>) {
        let conf = ReducerConfig::new(BalancerInputs::new(nthr, njobs, job_size, nthr)).isa(IsaLevel::Portable);
        let r = CpuReducer::<f32>::new(conf).unwrap();
        let b = *r.balancer();
        let sp = registry_for(&r);
        let mut dst = vec![0.0f32; njobs * job_size];
        let mut want = vec![0.0f32; njobs * job_size];

        for ithr in 0..nthr {
            if b.idle(ithr) {
                continue;
            }
            let p = r.get_local_ptr(ithr, dst.as_mut_ptr(), &sp).unwrap();
            let n = b.ithr_njobs(ithr) * b.job_size;
            let off = b.ithr_job_off(ithr) * b.job_size;
            for i in 0..n {
                let v = (ithr * 1000 + i) as f32;
                unsafe { *p.add(i) = v };
                want[off + i] += v;
            }
        }
        for ithr in 0..nthr {
            unsafe { r.reduce_nolock(ithr, dst.as_mut_ptr(), &sp).unwrap() };
        }
        (dst, want)
    }

    #[test]
    fn test_reducer_1d_single_job() {
        let (got, want) = reduce_1d(4, 1, 100);
        assert_eq!(got, want);
    }

    #[test]
    fn test_reducer_1d_several_groups() {
        let (got, want) = reduce_1d(6, 3, 40);
        assert_eq!(got, want);
    }

    #[test]
    fn test_no_scratch_without_reduction() {
        let conf = ReducerConfig::new(BalancerInputs::new(2, 64, 8, 2)).isa(IsaLevel::Portable);
        let r = CpuReducer::<i32>::new(conf).unwrap();
        assert_eq!(r.balancer().nthr_per_group, 1);
        let mut reg = ScratchpadRegistry::new();
        r.init_scratchpad(&mut reg).unwrap();
        assert_eq!(reg.size(), 0);
    }

    #[test]
    fn test_choose_x_blocking() {
        let conf = Reducer2DConfig::new(4, 4, (8, 64), (8, 64), 8).isa(IsaLevel::Portable);
        let r = CpuReducer2D::<f32>::new(conf).unwrap();
        // enough rows for every thread: whole rows
        assert_eq!(r.choose_x_blocking(64, 8, 4), 64);
        // one row, 4 threads: min chunk of 2 blocks
        assert_eq!(r.choose_x_blocking(64, 1, 4), 16);
        assert_eq!(r.choose_x_blocking(12, 1, 4), 12);
        assert_eq!(r.choose_x_blocking(8, 1, 4), 8);
    }

    #[test]
    fn test_reducer_2d() {
        let (nthr, dst_y, dst_x) = (4, 5, 21);
        let conf = Reducer2DConfig::new(nthr, nthr, (dst_y, dst_x), (dst_y, dst_x), 4).isa(IsaLevel::Portable);
        let r = CpuReducer2D::<i32>::new(conf).unwrap();
        let b = *r.balancer();
        assert!(b.nthr_per_group > 1);
        let mut reg = ScratchpadRegistry::new();
        r.init_scratchpad(&mut reg).unwrap();
        let sp = reg.book().unwrap();

        let mut want = vec![0i32; dst_y * dst_x];
        for ithr in 0..nthr {
            if b.idle(ithr) {
                continue;
            }
            let p = r.get_local_ptr(ithr, &sp).unwrap();
            for i in 0..dst_y * dst_x {
                let v = (ithr * 100 + i) as i32;
                unsafe { *p.add(i) = v };
                want[i] += v;
            }
        }
        let mut dst = vec![-1i32; dst_y * dst_x];
        for ithr in 0..nthr {
            unsafe { r.reduce_nolock(ithr, dst.as_mut_ptr(), &sp).unwrap() };
        }
        assert_eq!(dst, want);
    }

    #[test]
    fn test_accumulator() {
        let acc = CpuAccumulator1D::<f32>::new(IsaLevel::Portable).unwrap();
        let mut dst = vec![1.0f32; 33];
        let src: Vec<f32> = (0..33).map(|i| i as f32).collect();
        acc.accumulate_slice(&mut dst, &src);
        assert!(dst.iter().enumerate().all(|(i, &v)| v == i as f32 + 1.0));
    }
}
