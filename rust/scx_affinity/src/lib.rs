// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CPU topology and worker thread affinity
//!
//! Compute-heavy inference code runs best with one worker thread per
//! physical core, each worker pinned to its own core. This crate works out
//! that placement and applies it.
//!
//! ## Topology
//!
//! [`CpuInfo`] holds the text of `/proc/cpuinfo` (or any text in the same
//! format), the parser turns it into one [`ProcessorRecord`] per logical
//! processor and [`Topology`] summarizes those into sockets, physical cores
//! and clock speed.
//!
//! ## Affinity
//!
//! [`AffinityPolicy`] combines the topology with the CPUs the process is
//! allowed to run on and with the environment, and pins the workers of a
//! [`ParallelRuntime`] to one physical core each. The OS side goes through
//! [`AffinityOps`] so that platforms without thread affinity simply never
//! bind. [`AffinityContext`] builds the policy once, on first use, and hands
//! out [`AffinityHandle`]s to the code that needs to bind threads. Work
//! passed to [`AffinityHandle::install`] runs on the pinned workers.
//!
//!```no_run
//!     use scx_affinity::{AffinityConfig, AffinityContext};
//!     let ctx = AffinityContext::new(AffinityConfig::default());
//!     let handle = ctx.handle();
//!     handle.bind_parallel_workers(0);
//!     let sum: u64 = handle.install(|| (0..1000u64).sum()).unwrap();
//!     println!("{} cores, sum {}", handle.available_core_count(), sum);
//!```

mod cpumask;
pub use cpumask::Cpumask;
pub use cpumask::CpumaskIterator;

mod cpuinfo;
pub use cpuinfo::CpuInfo;
pub use cpuinfo::Lines;
pub use cpuinfo::HOST_CPUINFO_PATH;

pub mod parse;
pub use parse::Parsed;
pub use parse::ProcessorRecord;

mod topology;
pub use topology::Topology;

mod affinity;
pub use affinity::host_affinity;
pub use affinity::AffinityOps;
pub use affinity::NoAffinity;
#[cfg(target_os = "linux")]
pub use affinity::SchedAffinity;

mod runtime;
pub use runtime::ParallelRuntime;
pub use runtime::RayonRuntime;

mod config;
pub use config::AffinityConfig;

mod policy;
pub use policy::env_override_present;
pub use policy::AffinityContext;
pub use policy::AffinityHandle;
pub use policy::AffinityPolicy;
pub use policy::PolicyBuilder;
pub use policy::OVERRIDE_ENV_VARS;
