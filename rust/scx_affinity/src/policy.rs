// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Affinity Policy
//!
//! Decides which CPUs the workers of a fork-join runtime are pinned to.
//!
//! The set of CPUs the process is allowed to run on is reduced to one
//! representative logical processor per physical core. Worker `n` of a
//! parallel region is pinned to the `n`-th representative, so every worker
//! owns a physical core. A single auxiliary thread can be given the second
//! core, including all of its SMT siblings, to keep it off the first worker's
//! core.
//!
//! Physical cores are identified with `cpu % nr_cores`, which matches the way
//! Linux enumerates SMT siblings on x86: the first thread of every core comes
//! first, followed by the second threads in the same order.
//!
//! Binding is skipped altogether while an accelerator is in use or when the
//! environment already carries thread placement settings for another
//! parallel runtime, in which case the user's placement wins.
//!
//! All of this is computed once when the policy is built. Only the
//! accelerator flag can change afterwards.

use crate::affinity::host_affinity;
use crate::AffinityConfig;
use crate::AffinityOps;
use crate::CpuInfo;
use crate::Cpumask;
use crate::ParallelRuntime;
use crate::RayonRuntime;
use crate::Topology;
use anyhow::anyhow;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;

/// Environment variables through which users tune thread count and placement
/// of OpenMP, GNU OpenMP, Intel OpenMP (including MIC/Xeon Phi offload) and
/// MKL. The presence of any of them disables binding.
pub const OVERRIDE_ENV_VARS: [&str; 30] = [
    "OMP_CANCELLATION",
    "OMP_DISPLAY_ENV",
    "OMP_DEFAULT_DEVICE",
    "OMP_DYNAMIC",
    "OMP_MAX_ACTIVE_LEVELS",
    "OMP_MAX_TASK_PRIORITY",
    "OMP_NESTED",
    "OMP_NUM_THREADS",
    "OMP_PROC_BIND",
    "OMP_PLACES",
    "OMP_STACKSIZE",
    "OMP_SCHEDULE",
    "OMP_THREAD_LIMIT",
    "OMP_WAIT_POLICY",
    "GOMP_CPU_AFFINITY",
    "GOMP_DEBUG",
    "GOMP_STACKSIZE",
    "GOMP_SPINCOUNT",
    "GOMP_RTEMS_THREAD_POOLS",
    "KMP_AFFINITY",
    "KMP_NUM_THREADS",
    "MIC_KMP_AFFINITY",
    "MIC_OMP_NUM_THREADS",
    "MIC_OMP_PROC_BIND",
    "PHI_KMP_AFFINITY",
    "PHI_OMP_NUM_THREADS",
    "PHI_KMP_PLACE_THREADS",
    "MKL_NUM_THREADS",
    "MKL_DYNAMIC",
    "MKL_DOMAIN_NUM_THREADS",
];

/// Return true if `is_set` reports any of [`OVERRIDE_ENV_VARS`] as present.
pub fn env_override_present(is_set: impl Fn(&str) -> bool) -> bool {
    OVERRIDE_ENV_VARS.iter().any(|name| is_set(name))
}

fn process_env_is_set(name: &str) -> bool {
    std::env::var_os(name).is_some()
}

/// Reduce `allowed` to the lowest allowed logical processor of every
/// physical core.
fn reduce_to_cores(allowed: &Cpumask, nr_cores: usize) -> Cpumask {
    if nr_cores == 0 {
        return Cpumask::new(allowed.len());
    }

    let mut seen = vec![false; nr_cores];
    let representatives = allowed
        .iter()
        .filter(|&cpu| !std::mem::replace(&mut seen[cpu % nr_cores], true));
    Cpumask::from_cpus(allowed.len(), representatives)
}

pub struct PolicyBuilder {
    topology: Topology,
    ops: Arc<dyn AffinityOps>,
    runtime: Arc<dyn ParallelRuntime>,
    env_override: bool,
}

impl PolicyBuilder {
    /// Use `ops` instead of the host's affinity syscalls.
    pub fn affinity_ops(mut self, ops: Arc<dyn AffinityOps>) -> Self {
        self.ops = ops;
        self
    }

    /// Run worker binding on `runtime`.
    pub fn runtime(mut self, runtime: Arc<dyn ParallelRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    /// Check for override variables with `is_set` instead of the process
    /// environment.
    pub fn env_lookup(mut self, is_set: impl Fn(&str) -> bool) -> Self {
        self.env_override = env_override_present(is_set);
        self
    }

    /// Ignore override variables altogether.
    pub fn ignore_env_overrides(mut self) -> Self {
        self.env_override = false;
        self
    }

    pub fn build(self) -> AffinityPolicy {
        let topology = self.topology;
        let nr_cpus = topology.nr_processors();

        // Only CPUs that also appear in cpuinfo can be bound.
        let allowed_mask = match self.ops.process_mask(nr_cpus) {
            Ok(mask) => mask.and(&topology.span()),
            Err(e) => {
                warn!("{:#}, assuming all {} processors are allowed", e, nr_cpus);
                topology.span()
            }
        };

        if topology.nr_cores() == 0 {
            warn!("No physical cores found in cpuinfo, thread binding disabled");
        }
        let core_mask = reduce_to_cores(&allowed_mask, topology.nr_cores());

        let policy = AffinityPolicy {
            topology,
            allowed_mask,
            core_mask,
            env_override: self.env_override,
            accelerator: AtomicBool::new(false),
            ops: self.ops,
            runtime: self.runtime,
        };
        policy.log_summary();
        policy
    }
}

pub struct AffinityPolicy {
    topology: Topology,
    allowed_mask: Cpumask,
    core_mask: Cpumask,
    env_override: bool,
    accelerator: AtomicBool,
    ops: Arc<dyn AffinityOps>,
    runtime: Arc<dyn ParallelRuntime>,
}

impl AffinityPolicy {
    /// Start building a policy for `topology`. By default the host's affinity
    /// syscalls, a fresh rayon runtime and the process environment are used.
    pub fn builder(topology: Topology) -> PolicyBuilder {
        PolicyBuilder {
            topology,
            ops: host_affinity(),
            runtime: Arc::new(RayonRuntime::new(
                &AffinityConfig::default().worker_name_prefix,
            )),
            env_override: env_override_present(process_env_is_set),
        }
    }

    /// Build the policy for the host as described by `config`.
    pub fn from_config(config: &AffinityConfig) -> AffinityPolicy {
        let cpuinfo = CpuInfo::from_file_or_empty(&config.cpuinfo_path);
        let topology = Topology::from_cpuinfo(&cpuinfo);
        let builder = Self::builder(topology)
            .runtime(Arc::new(RayonRuntime::new(&config.worker_name_prefix)));

        if config.honor_env_overrides {
            builder.build()
        } else {
            builder.ignore_env_overrides().build()
        }
    }

    fn log_summary(&self) {
        let top = &self.topology;
        info!(
            "CPU topology: {} sockets, {} cores, {} processors @ {}MHz",
            top.nr_sockets(),
            top.nr_cores(),
            top.nr_processors(),
            top.processor_speed_mhz()
        );
        info!(
            "Allowed CPUs: {:x}, one per core: {:x} ({} cores)",
            self.allowed_mask,
            self.core_mask,
            self.available_core_count()
        );
        if self.env_override {
            info!("Thread placement set through the environment, not binding threads");
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// CPUs the process was allowed to run on when the policy was built.
    pub fn allowed_mask(&self) -> &Cpumask {
        &self.allowed_mask
    }

    /// One representative CPU per physical core.
    pub fn reduced_core_mask(&self) -> &Cpumask {
        &self.core_mask
    }

    pub fn env_override_detected(&self) -> bool {
        self.env_override
    }

    pub fn enable_accelerator(&self) {
        self.accelerator.store(true, Ordering::Release);
    }

    pub fn disable_accelerator(&self) {
        self.accelerator.store(false, Ordering::Release);
    }

    pub fn accelerator_enabled(&self) -> bool {
        self.accelerator.load(Ordering::Acquire)
    }

    pub fn is_binding_allowed(&self) -> bool {
        !self.env_override && !self.accelerator_enabled()
    }

    /// Number of physical cores available to the process.
    pub fn available_core_count(&self) -> usize {
        self.core_mask.weight()
    }

    /// The representative CPU of the `core_index`-th available core.
    ///
    /// # Panics
    ///
    /// If `core_index` is not below [`AffinityPolicy::available_core_count`].
    pub fn representative_cpu(&self, core_index: usize) -> usize {
        match self.core_mask.nth_cpu(core_index) {
            Some(cpu) => cpu,
            None => panic!(
                "core index {} out of range, only {} cores available",
                core_index,
                self.available_core_count()
            ),
        }
    }

    /// All allowed SMT siblings of the `core_index`-th available core.
    pub fn core_siblings(&self, core_index: usize) -> Cpumask {
        let nr_cores = self.topology.nr_cores();
        let first = self.representative_cpu(core_index) % nr_cores;
        let siblings = (first..self.allowed_mask.len())
            .step_by(nr_cores)
            .filter(|&cpu| self.allowed_mask.test_cpu(cpu));
        Cpumask::from_cpus(self.allowed_mask.len(), siblings)
    }

    fn bind_current_thread(&self, mask: &Cpumask) {
        match self.ops.set_thread_mask(mask) {
            Ok(()) => debug!(
                "Bound {:?} to CPUs {:x}",
                std::thread::current().name(),
                mask
            ),
            Err(e) => debug!("{:#}, leaving thread unbound", e),
        }
    }

    /// Pin the calling thread to the second available core, or to the only
    /// one if there is just one. The thread may use every SMT sibling of that
    /// core.
    pub fn bind_current_thread_to_secondary_core(&self) {
        if !self.is_binding_allowed() || self.core_mask.is_empty() {
            return;
        }

        let core_index = if self.available_core_count() > 1 { 1 } else { 0 };
        let siblings = self.core_siblings(core_index);
        self.bind_current_thread(&siblings);
    }

    /// Pin every worker of the parallel runtime to its own physical core.
    ///
    /// With `nr_threads == 0` the runtime is first resized to one worker per
    /// available core. Otherwise the caller has chosen the thread count and
    /// the runtime's current size is kept. Workers beyond the number of
    /// available cores are left unbound.
    pub fn bind_parallel_workers(&self, nr_threads: usize) {
        if !self.is_binding_allowed() || self.core_mask.is_empty() {
            return;
        }

        let nr_cores = self.available_core_count();
        if nr_threads == 0 {
            if let Err(e) = self.runtime.set_num_threads(nr_cores) {
                warn!("{:#}, keeping the current number of workers", e);
            }
        }

        let nr_workers = self.runtime.num_threads();
        if nr_workers > nr_cores {
            debug!(
                "{} workers for {} cores, workers {}.. stay unbound",
                nr_workers, nr_cores, nr_cores
            );
        }

        let ret = self.runtime.parallel_region(&|worker: usize| {
            if worker < nr_cores {
                let cpu = self.representative_cpu(worker);
                self.bind_current_thread(&Cpumask::from_cpus(self.core_mask.len(), [cpu]));
            }
        });
        if let Err(e) = ret {
            warn!("{:#}, workers left unbound", e);
        }
    }

    /// Run `op` on one of the workers of the parallel runtime, the same
    /// workers [`AffinityPolicy::bind_parallel_workers`] pins. Parallel
    /// iterators started from `op` stay on those workers.
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> Result<R> {
        let mut ret = None;
        self.runtime.install(Box::new(|| ret = Some(op())))?;
        ret.ok_or_else(|| anyhow!("Parallel runtime did not run the operation"))
    }
}

/// Owns the process's [`AffinityPolicy`], building it the first time a
/// handle is requested. Concurrent first callers all wait for the same
/// policy.
pub struct AffinityContext {
    init: Box<dyn Fn() -> AffinityPolicy + Send + Sync>,
    policy: OnceLock<Arc<AffinityPolicy>>,
}

impl AffinityContext {
    /// Context for the host, configured by `config`.
    pub fn new(config: AffinityConfig) -> AffinityContext {
        Self::with_init(move || AffinityPolicy::from_config(&config))
    }

    /// Context whose policy is built by `init`.
    pub fn with_init(
        init: impl Fn() -> AffinityPolicy + Send + Sync + 'static,
    ) -> AffinityContext {
        AffinityContext {
            init: Box::new(init),
            policy: OnceLock::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.policy.get().is_some()
    }

    pub fn handle(&self) -> AffinityHandle {
        let policy = self.policy.get_or_init(|| Arc::new((self.init)()));
        AffinityHandle {
            policy: policy.clone(),
        }
    }
}

/// What consumers of the policy get to do with it: toggle the accelerator
/// flag, ask how many cores there are, bind their threads and run work on
/// the bound workers.
#[derive(Clone)]
pub struct AffinityHandle {
    policy: Arc<AffinityPolicy>,
}

impl AffinityHandle {
    pub fn enable_accelerator(&self) {
        self.policy.enable_accelerator();
    }

    pub fn disable_accelerator(&self) {
        self.policy.disable_accelerator();
    }

    pub fn is_binding_allowed(&self) -> bool {
        self.policy.is_binding_allowed()
    }

    pub fn available_core_count(&self) -> usize {
        self.policy.available_core_count()
    }

    pub fn processor_speed_mhz(&self) -> u32 {
        self.policy.topology().processor_speed_mhz()
    }

    pub fn bind_current_thread_to_secondary_core(&self) {
        self.policy.bind_current_thread_to_secondary_core();
    }

    pub fn bind_parallel_workers(&self, nr_threads: usize) {
        self.policy.bind_parallel_workers(nr_threads);
    }

    /// See [`AffinityPolicy::install`].
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> Result<R> {
        self.policy.install(op)
    }
}
