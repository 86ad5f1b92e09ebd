// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use rayon::prelude::*;
use scx_affinity::{
    AffinityConfig, AffinityContext, AffinityOps, AffinityPolicy, CpuInfo, Cpumask,
    ParallelRuntime, RayonRuntime, Topology,
};

// cpuinfo for SOCKETS x CORES x THREADS, enumerated the way Linux does on
// x86: first thread of every core, then the second threads.
fn cpuinfo_text(sockets: u32, cores: u32, threads: u32, model: &str) -> String {
    let nr_primary = sockets * cores;
    let mut text = String::new();
    for cpu in 0..nr_primary * threads {
        let primary = cpu % nr_primary;
        text.push_str(&format!(
            concat!(
                "processor\t: {}\n",
                "vendor_id\t: GenuineIntel\n",
                "model name\t: {}\n",
                "cpu MHz\t\t: 1000.000\n",
                "physical id\t: {}\n",
                "siblings\t: {}\n",
                "core id\t\t: {}\n",
                "cpu cores\t: {}\n",
                "flags\t\t: fpu vme de pse\n",
                "\n",
            ),
            cpu,
            model,
            primary / cores,
            cores * threads,
            primary % cores,
            cores,
        ));
    }
    text
}

fn xeon_2x4x2() -> Topology {
    Topology::from_cpuinfo(&CpuInfo::from_str(&cpuinfo_text(
        2,
        4,
        2,
        "Intel(R) Xeon(R) CPU E5-2620 v4 @ 2.10GHz",
    )))
}

#[derive(Default)]
struct Recorder {
    allowed: Option<Cpumask>,
    // (thread name, bound CPUs)
    bound: Mutex<Vec<(Option<String>, Vec<usize>)>>,
}

impl AffinityOps for Recorder {
    fn process_mask(&self, _nr_cpus: usize) -> Result<Cpumask> {
        match &self.allowed {
            Some(mask) => Ok(mask.clone()),
            None => anyhow::bail!("query not supported"),
        }
    }

    fn set_thread_mask(&self, mask: &Cpumask) -> Result<()> {
        let name = std::thread::current().name().map(str::to_string);
        self.bound.lock().unwrap().push((name, mask.iter().collect()));
        Ok(())
    }
}

#[test]
fn topology_from_cpuinfo() {
    let top = xeon_2x4x2();
    assert_eq!(top.nr_processors(), 16);
    assert_eq!(top.nr_sockets(), 2);
    assert_eq!(top.nr_cores(), 8);
    assert_eq!(top.processor_speed_mhz(), 2100);

    let p = top.processor(13).unwrap();
    assert_eq!(p.socket_id, 1);
    assert_eq!(p.core_id, 1);
    assert_eq!(p.siblings, 8);
}

#[test]
fn topology_survives_invalid_utf8() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"processor\t: 0\nmodel name\t: CPU\xff @ 2.00GHz\n")
        .unwrap();
    file.write_all(b"physical id\t: 0\ncpu cores\t: 4\n\n").unwrap();

    let top = Topology::from_cpuinfo(&CpuInfo::from_file_or_empty(file.path()));
    assert_eq!(top.nr_processors(), 1);
    assert_eq!(top.nr_sockets(), 1);
    assert_eq!(top.nr_cores(), 4);
    assert_eq!(top.processor_speed_mhz(), 2000);
}

#[test]
fn allowed_mask_limited_to_cpuinfo() {
    // The OS reports CPUs that cpuinfo does not list.
    let rec = Arc::new(Recorder {
        allowed: Some(Cpumask::from_cpus(16, [2, 3])),
        ..Default::default()
    });
    let text = cpuinfo_text(1, 2, 1, "CPU @ 2.00GHz");
    let pol = AffinityPolicy::builder(Topology::from_cpuinfo(&CpuInfo::from_str(&text)))
        .affinity_ops(rec)
        .env_lookup(|_| false)
        .build();

    assert_eq!(pol.allowed_mask().len(), 2);
    assert!(pol.allowed_mask().is_empty());
    assert_eq!(pol.available_core_count(), 0);
}

#[test]
fn reduced_mask_with_restricted_cpus() {
    // As if started under `taskset -c 1-7,9,10,12-15`.
    let allowed = Cpumask::from_cpus(16, (1..8).chain([9, 10]).chain(12..16));
    let rec = Arc::new(Recorder {
        allowed: Some(allowed.clone()),
        ..Default::default()
    });
    let pol = AffinityPolicy::builder(xeon_2x4x2())
        .affinity_ops(rec)
        .env_lookup(|_| false)
        .build();

    assert_eq!(pol.allowed_mask(), &allowed);
    // Core 0 is out (CPUs 0 and 8), core 3 is still there through CPU 3.
    assert_eq!(pol.available_core_count(), 7);
    assert_eq!(
        pol.reduced_core_mask().iter().collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5, 6, 7]
    );
}

#[test]
fn mask_query_failure_allows_everything() {
    let pol = AffinityPolicy::builder(xeon_2x4x2())
        .affinity_ops(Arc::new(Recorder::default()))
        .env_lookup(|_| false)
        .build();
    assert_eq!(pol.allowed_mask().weight(), 16);
    assert_eq!(pol.allowed_mask().len(), 16);
    assert_eq!(pol.available_core_count(), 8);
}

#[test]
fn bind_workers_one_per_core() {
    let rec = Arc::new(Recorder {
        allowed: Some(Cpumask::new_full(16)),
        ..Default::default()
    });
    let rt = Arc::new(RayonRuntime::new("e2e-worker"));
    let pol = AffinityPolicy::builder(xeon_2x4x2())
        .affinity_ops(rec.clone())
        .runtime(rt.clone())
        .env_lookup(|_| false)
        .build();

    assert_eq!(pol.available_core_count(), 8);
    pol.bind_parallel_workers(0);
    assert_eq!(rt.num_threads(), 8);

    let bound = rec.bound.lock().unwrap();
    assert_eq!(bound.len(), 8);

    let mut cpus = BTreeSet::new();
    for (name, mask) in bound.iter() {
        assert_eq!(mask.len(), 1);
        let worker: usize = name
            .as_deref()
            .and_then(|n| n.strip_prefix("e2e-worker-"))
            .and_then(|i| i.parse().ok())
            .unwrap();
        assert_eq!(mask[0], pol.representative_cpu(worker));
        cpus.insert(mask[0]);
    }
    assert_eq!(cpus, pol.reduced_core_mask().iter().collect::<BTreeSet<_>>());
}

#[test]
fn work_runs_on_bound_workers() {
    let rec = Arc::new(Recorder::default());
    let rt = Arc::new(RayonRuntime::new("ctx-worker"));
    let ops = rec.clone();
    let ctx = AffinityContext::with_init(move || {
        AffinityPolicy::builder(xeon_2x4x2())
            .affinity_ops(ops.clone())
            .runtime(rt.clone())
            .env_lookup(|_| false)
            .build()
    });
    let handle = ctx.handle();
    handle.bind_parallel_workers(0);

    let bound: BTreeSet<String> = rec
        .bound
        .lock()
        .unwrap()
        .iter()
        .filter_map(|(name, _)| name.clone())
        .collect();
    assert_eq!(bound.len(), 8);

    let names = handle
        .install(|| {
            (0..64)
                .into_par_iter()
                .map(|_| std::thread::current().name().map(str::to_string))
                .collect::<Vec<_>>()
        })
        .unwrap();
    for name in names {
        assert!(bound.contains(&name.unwrap()));
    }
}

#[test]
fn context_workers_reachable_from_handle() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(cpuinfo_text(1, 2, 1, "CPU @ 2.00GHz").as_bytes())
        .unwrap();

    let config = AffinityConfig {
        cpuinfo_path: file.path().to_path_buf(),
        honor_env_overrides: false,
        worker_name_prefix: "host-worker".to_string(),
    };
    let handle = AffinityContext::new(config).handle();
    handle.bind_parallel_workers(0);

    let name = handle
        .install(|| std::thread::current().name().map(str::to_string))
        .unwrap();
    assert!(name.unwrap().starts_with("host-worker-"));
}

#[test]
fn bind_workers_keeps_requested_thread_count() {
    let rec = Arc::new(Recorder::default());
    let rt = Arc::new(RayonRuntime::new("sized-worker"));
    rt.set_num_threads(3).unwrap();
    let pol = AffinityPolicy::builder(xeon_2x4x2())
        .affinity_ops(rec.clone())
        .runtime(rt.clone())
        .env_lookup(|_| false)
        .build();

    pol.bind_parallel_workers(3);
    assert_eq!(rt.num_threads(), 3);

    let cpus: BTreeSet<usize> = rec
        .bound
        .lock()
        .unwrap()
        .iter()
        .map(|(_, mask)| mask[0])
        .collect();
    assert_eq!(cpus, BTreeSet::from([0, 1, 2]));
}

#[test]
fn more_workers_than_cores() {
    let rec = Arc::new(Recorder::default());
    let rt = Arc::new(RayonRuntime::new("wide-worker"));
    rt.set_num_threads(12).unwrap();
    let pol = AffinityPolicy::builder(xeon_2x4x2())
        .affinity_ops(rec.clone())
        .runtime(rt.clone())
        .env_lookup(|_| false)
        .build();

    pol.bind_parallel_workers(12);
    assert_eq!(rec.bound.lock().unwrap().len(), 8);
}

#[test]
fn env_override_suppresses_binding() {
    let rec = Arc::new(Recorder::default());
    let rt = Arc::new(RayonRuntime::new("env-worker"));
    rt.set_num_threads(2).unwrap();
    let pol = AffinityPolicy::builder(xeon_2x4x2())
        .affinity_ops(rec.clone())
        .runtime(rt.clone())
        .env_lookup(|name| name == "OMP_NUM_THREADS")
        .build();

    assert!(!pol.is_binding_allowed());
    pol.bind_parallel_workers(0);
    pol.bind_current_thread_to_secondary_core();
    assert!(rec.bound.lock().unwrap().is_empty());
    assert_eq!(rt.num_threads(), 2);
}

#[test]
fn accelerator_toggle() {
    let rec = Arc::new(Recorder::default());
    let pol = AffinityPolicy::builder(xeon_2x4x2())
        .affinity_ops(rec.clone())
        .env_lookup(|_| false)
        .build();

    pol.enable_accelerator();
    pol.bind_current_thread_to_secondary_core();
    assert!(rec.bound.lock().unwrap().is_empty());

    pol.disable_accelerator();
    pol.bind_current_thread_to_secondary_core();
    let bound = rec.bound.lock().unwrap();
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].1, vec![1, 9]);
}

#[test]
fn single_core_secondary_binding() {
    let text = cpuinfo_text(1, 1, 1, "Some CPU @ 800MHz");
    let rec = Arc::new(Recorder::default());
    let pol = AffinityPolicy::builder(Topology::from_cpuinfo(&CpuInfo::from_str(&text)))
        .affinity_ops(rec.clone())
        .env_lookup(|_| false)
        .build();

    assert_eq!(pol.topology().processor_speed_mhz(), 800);
    assert_eq!(pol.available_core_count(), 1);
    pol.bind_current_thread_to_secondary_core();
    assert_eq!(rec.bound.lock().unwrap()[0].1, vec![0]);
}

#[test]
fn context_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(cpuinfo_text(1, 2, 2, "CPU @ 3.5GHz").as_bytes())
        .unwrap();

    let config = AffinityConfig {
        cpuinfo_path: file.path().to_path_buf(),
        honor_env_overrides: false,
        worker_name_prefix: "cfg-worker".to_string(),
    };
    let ctx = AffinityContext::new(config);
    let handle = ctx.handle();

    assert!(handle.is_binding_allowed());
    assert_eq!(handle.processor_speed_mhz(), 3500);
    assert!(handle.available_core_count() <= 2);
}

#[test]
fn context_with_missing_cpuinfo() {
    let dir = tempfile::tempdir().unwrap();
    let config = AffinityConfig {
        cpuinfo_path: dir.path().join("cpuinfo"),
        honor_env_overrides: false,
        ..Default::default()
    };
    let handle = AffinityContext::new(config).handle();

    assert_eq!(handle.available_core_count(), 0);
    assert_eq!(handle.processor_speed_mhz(), 0);
    handle.bind_parallel_workers(0);
    handle.bind_current_thread_to_secondary_core();
}
