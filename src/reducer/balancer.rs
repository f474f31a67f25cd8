//! Reduction balancer: splits `njobs` jobs of depth `reduction_size` over
//! `nthr` threads.
//!
//! Threads are arranged into `ngroups` groups of `nthr_per_group`. A group
//! owns a contiguous run of jobs; inside a group every thread computes a
//! share of the reduction depth into its own buffer and the buffers are then
//! summed into the leader's slot (the final destination).
//!
//! ```text
//! thread:  0 1 2 | 3 4 5 | 6 7 8 | 9      nthr = 10, nthr_per_group = 3
//! group:     0   |   1   |   2   | idle
//! jobs:   [0, 4) | [4, 7)| [7,10)
//! ```
//!
//! Sizes (`job_size`, `max_buffer_size`) share one unit; the reducers use
//! elements.

/// Inputs to the balancing search. All counts must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BalancerInputs {
    pub nthr: usize,
    pub njobs: usize,
    pub job_size: usize,
    pub reduction_size: usize,
    /// Upper bound on `nthr * njobs_per_group_ub * job_size` when groups
    /// hold more than one thread.
    pub max_buffer_size: usize,
    /// When false every group is a single thread and no reduction happens.
    pub allow_nthr_in_group: bool,
}

impl BalancerInputs {
    pub fn new(nthr: usize, njobs: usize, job_size: usize, reduction_size: usize) -> Self {
        BalancerInputs {
            nthr,
            njobs,
            job_size,
            reduction_size,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            allow_nthr_in_group: true,
        }
    }

    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    pub fn allow_nthr_in_group(mut self, allow: bool) -> Self {
        self.allow_nthr_in_group = allow;
        self
    }
}

/// Default scratch bound: 256 KiB of 4-byte elements per thread at 64 threads.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64 * 64 * 1024;

/// Result of the balancing search plus the per-thread job queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReduceBalancer {
    pub nthr: usize,
    pub njobs: usize,
    pub job_size: usize,
    pub reduction_size: usize,
    pub max_buffer_size: usize,
    pub allow_nthr_in_group: bool,

    pub ngroups: usize,
    pub nthr_per_group: usize,
    pub njobs_per_group_ub: usize,
}

#[inline]
pub(crate) fn div_up(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

impl ReduceBalancer {
    /// Run the search.
    ///
    /// # Panics
    /// If any count in `inputs` is zero.
    pub fn new(inputs: BalancerInputs) -> Self {
        let BalancerInputs {
            nthr,
            njobs,
            job_size,
            reduction_size,
            max_buffer_size,
            allow_nthr_in_group,
        } = inputs;
        assert!(
            nthr > 0 && njobs > 0 && job_size > 0 && reduction_size > 0,
            "balancer counts must be positive: {inputs:?}"
        );

        let fits = |nthr_per_group: usize, ub: usize| {
            nthr_per_group == 1 || ub * job_size * nthr <= max_buffer_size
        };
        let threads_in_group = |ngroups: usize| {
            if allow_nthr_in_group {
                (nthr / ngroups).min(reduction_size)
            } else {
                1
            }
        };

        let min_njobs_per_group = (njobs / nthr).max(1);

        // initial guess
        let mut ngroups = (njobs / min_njobs_per_group).min(nthr);
        let mut nthr_per_group = threads_in_group(ngroups);
        let mut njobs_per_group_ub = div_up(njobs, ngroups);
        if !fits(nthr_per_group, njobs_per_group_ub) {
            nthr_per_group = 1;
        }

        // rough upper bound, replaced by the first candidate
        let mut complexity_ub = njobs * job_size * reduction_size;

        for c_njobs_per_group in min_njobs_per_group..njobs {
            let c_ngroups = (njobs / c_njobs_per_group).min(nthr);
            let c_nthr_per_group = threads_in_group(c_ngroups);
            let c_njobs_per_group_ub = div_up(njobs, c_ngroups);

            if !fits(c_nthr_per_group, c_njobs_per_group_ub) {
                continue;
            }

            let c_complexity = job_size
                * c_njobs_per_group_ub
                * (div_up(reduction_size, c_nthr_per_group) + usize::from(c_nthr_per_group != 1));

            if c_complexity < complexity_ub {
                ngroups = c_ngroups;
                nthr_per_group = c_nthr_per_group;
                njobs_per_group_ub = c_njobs_per_group_ub;
                complexity_ub = c_complexity;
            }
        }

        assert!(ngroups * nthr_per_group <= nthr);
        assert!(fits(nthr_per_group, njobs_per_group_ub), "reduction buffer overflow");
        assert!(allow_nthr_in_group || nthr_per_group == 1);

        let b = ReduceBalancer {
            nthr,
            njobs,
            job_size,
            reduction_size,
            max_buffer_size,
            allow_nthr_in_group,
            ngroups,
            nthr_per_group,
            njobs_per_group_ub,
        };
        log::debug!(
            "reduce balancer: nthr={nthr} njobs={njobs} job_size={job_size} \
             reduction_size={reduction_size} -> ngroups={ngroups} \
             nthr_per_group={nthr_per_group} njobs_per_group_ub={njobs_per_group_ub}"
        );
        b
    }

    pub fn inputs(&self) -> BalancerInputs {
        BalancerInputs {
            nthr: self.nthr,
            njobs: self.njobs,
            job_size: self.job_size,
            reduction_size: self.reduction_size,
            max_buffer_size: self.max_buffer_size,
            allow_nthr_in_group: self.allow_nthr_in_group,
        }
    }

    #[inline]
    pub fn group_id(&self, ithr: usize) -> usize {
        ithr / self.nthr_per_group
    }

    #[inline]
    pub fn id_in_group(&self, ithr: usize) -> usize {
        ithr % self.nthr_per_group
    }

    /// Threads past the last full group get no work.
    #[inline]
    pub fn idle(&self, ithr: usize) -> bool {
        ithr >= self.nthr_per_group * self.ngroups
    }

    pub fn grp_njobs(&self, grp: usize) -> usize {
        if grp >= self.ngroups {
            return 0;
        }
        self.njobs / self.ngroups + usize::from(grp < self.njobs % self.ngroups)
    }

    pub fn grp_job_off(&self, grp: usize) -> usize {
        if grp >= self.ngroups {
            return self.njobs;
        }
        self.njobs / self.ngroups * grp + grp.min(self.njobs % self.ngroups)
    }

    #[inline]
    pub fn ithr_njobs(&self, ithr: usize) -> usize {
        self.grp_njobs(self.group_id(ithr))
    }

    #[inline]
    pub fn ithr_job_off(&self, ithr: usize) -> usize {
        self.grp_job_off(self.group_id(ithr))
    }

    #[inline]
    pub fn ithr_id_in_group(&self, ithr: usize) -> usize {
        self.id_in_group(ithr)
    }

    /// Scratch elements one thread's partial buffer needs.
    #[inline]
    pub fn space_per_thread(&self) -> usize {
        self.njobs_per_group_ub * self.job_size
    }

    /// Largest group job count the scratch bound allows with several threads.
    pub fn max_njobs_per_group(&self) -> usize {
        (self.max_buffer_size / (self.nthr * self.job_size)).max(1)
    }
}

/// Contiguous balanced split of `[0, n)` over `team` workers: the first
/// `n % team` workers get one extra item.
pub fn balance211(n: usize, team: usize, tid: usize) -> (usize, usize) {
    assert!(team > 0 && tid < team, "worker {tid} outside team of {team}");
    if team == 1 || n == 0 {
        return if tid == 0 { (0, n) } else { (n, n) };
    }
    let n1 = div_up(n, team);
    let n2 = n1 - 1;
    let t1 = n - n2 * team;
    let count = if tid < t1 { n1 } else { n2 };
    let start = if tid <= t1 {
        tid * n1
    } else {
        t1 * n1 + (tid - t1) * n2
    };
    (start, start + count)
}
