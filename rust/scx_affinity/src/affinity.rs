// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # OS affinity backends
//!
//! [`AffinityOps`] is the only place the crate talks to the OS about CPU
//! affinity. [`SchedAffinity`] uses `sched_getaffinity(2)` and
//! `sched_setaffinity(2)`; [`NoAffinity`] is used where those are missing
//! and never binds anything. [`host_affinity`] picks the right one for the
//! build target.

use crate::Cpumask;
use anyhow::bail;
use anyhow::Result;
use std::sync::Arc;

pub trait AffinityOps: Send + Sync {
    /// The set of logical processors the calling process may currently run
    /// on, truncated to `nr_cpus`.
    fn process_mask(&self, nr_cpus: usize) -> Result<Cpumask>;

    /// Restrict the calling thread to `mask`.
    fn set_thread_mask(&self, mask: &Cpumask) -> Result<()>;
}

/// Backend for platforms without thread affinity support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAffinity;

impl AffinityOps for NoAffinity {
    fn process_mask(&self, _nr_cpus: usize) -> Result<Cpumask> {
        bail!("CPU affinity is not supported on this platform");
    }

    fn set_thread_mask(&self, _mask: &Cpumask) -> Result<()> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use linux::SchedAffinity;

#[cfg(target_os = "linux")]
mod linux {
    use super::AffinityOps;
    use crate::Cpumask;
    use anyhow::bail;
    use anyhow::Result;
    use std::mem;

    const CPU_SETSIZE: usize = libc::CPU_SETSIZE as usize;

    /// Linux backend, pid 0 in both calls refers to the calling thread.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SchedAffinity;

    impl AffinityOps for SchedAffinity {
        fn process_mask(&self, nr_cpus: usize) -> Result<Cpumask> {
            let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
            let ret =
                unsafe { libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) };
            if ret != 0 {
                bail!(
                    "sched_getaffinity failed: {}",
                    std::io::Error::last_os_error()
                );
            }

            let mut mask = Cpumask::new(nr_cpus);
            for cpu in 0..nr_cpus.min(CPU_SETSIZE) {
                if unsafe { libc::CPU_ISSET(cpu, &set) } {
                    mask.set_cpu(cpu)?;
                }
            }
            Ok(mask)
        }

        fn set_thread_mask(&self, mask: &Cpumask) -> Result<()> {
            let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
            for cpu in mask.iter() {
                if cpu >= CPU_SETSIZE {
                    bail!("CPU {} exceeds CPU_SETSIZE ({})", cpu, CPU_SETSIZE);
                }
                unsafe { libc::CPU_SET(cpu, &mut set) };
            }

            let ret =
                unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) };
            if ret != 0 {
                bail!(
                    "sched_setaffinity({}) failed: {}",
                    mask,
                    std::io::Error::last_os_error()
                );
            }
            Ok(())
        }
    }
}

/// The affinity backend for the build target.
#[cfg(target_os = "linux")]
pub fn host_affinity() -> Arc<dyn AffinityOps> {
    Arc::new(SchedAffinity)
}

/// The affinity backend for the build target.
#[cfg(not(target_os = "linux"))]
pub fn host_affinity() -> Arc<dyn AffinityOps> {
    Arc::new(NoAffinity)
}
