// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Topology
//!
//! A read-only summary of the host's processors built from cpuinfo: the
//! ordered list of logical processors together with the number of sockets,
//! the number of physical cores and a representative clock speed.
//!
//! Creating Topology
//! -----------------
//!
//!```
//!     use scx_affinity::{CpuInfo, Topology};
//!     let cpuinfo = CpuInfo::from_str("processor\t: 0\nphysical id\t: 0\ncpu cores\t: 1\n");
//!     let top = Topology::from_cpuinfo(&cpuinfo);
//!     assert_eq!(top.nr_sockets(), 1);
//!     assert_eq!(top.nr_cores(), 1);
//!```
//!
//! If the host topology were to change (due to e.g. hotplug), a new Topology
//! object should be created.

use crate::parse::parse_processors;
use crate::CpuInfo;
use crate::Cpumask;
use crate::ProcessorRecord;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    processors: Vec<ProcessorRecord>,
    nr_sockets: usize,
    nr_cores: usize,
    speed_mhz: u32,
}

impl Topology {
    /// Build the topology of the host from `/proc/cpuinfo`.
    pub fn host() -> Topology {
        Self::from_cpuinfo(&CpuInfo::host())
    }

    /// Parse and summarize a cpuinfo source.
    pub fn from_cpuinfo(cpuinfo: &CpuInfo) -> Topology {
        Self::from_processors(parse_processors(cpuinfo))
    }

    /// Summarize an already parsed list of processors.
    ///
    /// Cores are counted per socket from the "cpu cores" value of the first
    /// processor seen in that socket. Values reported by later processors of
    /// an already counted socket are ignored, even if they differ.
    pub fn from_processors(processors: Vec<ProcessorRecord>) -> Topology {
        let mut sockets = BTreeSet::new();
        let mut nr_sockets = 0;
        let mut nr_cores = 0;

        for processor in processors.iter() {
            sockets.insert(processor.socket_id);
            if sockets.len() != nr_sockets {
                nr_sockets = sockets.len();
                nr_cores += processor.cores_per_socket as usize;
            }
        }

        let speed_mhz = processors.first().map_or(0, |p| p.speed_mhz);

        Topology {
            processors,
            nr_sockets,
            nr_cores,
            speed_mhz,
        }
    }

    /// Get a slice of all processors, in enumeration order.
    pub fn processors(&self) -> &[ProcessorRecord] {
        &self.processors
    }

    /// Look up a processor by its "processor" id.
    pub fn processor(&self, logical_id: u32) -> Option<&ProcessorRecord> {
        self.processors.iter().find(|p| p.logical_id == logical_id)
    }

    /// Get the number of logical processors.
    pub fn nr_processors(&self) -> usize {
        self.processors.len()
    }

    /// Get the number of sockets.
    pub fn nr_sockets(&self) -> usize {
        self.nr_sockets
    }

    /// Get the total number of physical cores across all sockets.
    pub fn nr_cores(&self) -> usize {
        self.nr_cores
    }

    /// Clock speed of the first processor in MHz, 0 if unknown.
    pub fn processor_speed_mhz(&self) -> u32 {
        self.speed_mhz
    }

    /// Get a cpumask with every logical processor set.
    pub fn span(&self) -> Cpumask {
        Cpumask::new_full(self.nr_processors())
    }
}
