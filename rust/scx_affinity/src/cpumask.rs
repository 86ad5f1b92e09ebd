// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A set of logical processor ids, stored as a BitVec of u64's. Unlike the
//! kernel's cpumask, a Cpumask here is sized to the number of logical
//! processors described by the topology it was built for, so two masks built
//! from the same topology always have the same width.
//!
//!```
//!     use scx_affinity::Cpumask;
//!     let mut mask = Cpumask::new(8);
//!     assert!(!mask.test_cpu(3));
//!     mask.set_cpu(3).unwrap();
//!     assert!(mask.test_cpu(3));
//!     assert_eq!(mask.weight(), 1);
//!
//!     let list = Cpumask::from_cpus(8, [0, 1, 2, 6, 9]);
//!     assert_eq!(list.iter().collect::<Vec<_>>(), vec![0, 1, 2, 6]);
//!```

use anyhow::bail;
use anyhow::Result;
use bitvec::prelude::*;
use std::fmt;
use std::ops::BitAndAssign;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask covering `nr_cpus` logical processors.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a Cpumask with every one of the `nr_cpus` bits set.
    pub fn new_full(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpus],
        }
    }

    /// Build a Cpumask from the set bits of an iterator of CPU ids, dropping
    /// ids that fall outside of `nr_cpus`.
    pub fn from_cpus<I: IntoIterator<Item = usize>>(nr_cpus: usize, cpus: I) -> Cpumask {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu in cpus.into_iter().filter(|&cpu| cpu < nr_cpus) {
            mask.mask.set(cpu, true);
        }
        mask
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the specified CPU bit is set in the Cpumask. If the CPU
    /// exceeds the width of the mask, false is returned.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// The total width of the cpumask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new &= other;
        new
    }

    /// Return the `n`-th lowest set CPU, if there is one.
    pub fn nth_cpu(&self, n: usize) -> Option<usize> {
        self.iter().nth(n)
    }

    /// Iterate over the CPU ids with bits set, in ascending order.
    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }

    fn fmt_hex(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mask.is_empty() {
            return write!(f, "0");
        }

        let mut masks: Vec<u32> = self
            .mask
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Throw out possible stray from u64 -> u32.
        masks.truncate(self.len().div_ceil(32));

        // Print the highest 32bit. Trim digits beyond the mask width.
        let width = match self.len().div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        let top = masks.pop().unwrap_or(0);
        write!(f, "{:0width$x}", top, width = width)?;

        // The rest in descending order.
        for submask in masks.iter().rev() {
            write!(f, ",{submask:08x}")?;
        }
        Ok(())
    }
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.mask.len() {
            let index = self.index;
            self.index += 1;
            if self.mask.test_cpu(index) {
                return Some(index);
            }
        }

        None
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_hex(f)
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_hex(f)
    }
}

impl BitAndAssign<&Self> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Self) {
        self.mask &= &rhs.mask;
    }
}
