// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpuinfo Source
//!
//! Owns the raw text of a `/proc/cpuinfo` style topology description and
//! hands out its lines as borrowed views. The buffer is never modified; lines
//! are located by scanning for '\n' from a byte offset, so a [`Lines`]
//! iterator is lazy and a fresh one can be started at any time.

use anyhow::Context;
use anyhow::Result;
use log::warn;
use std::path::Path;

pub const HOST_CPUINFO_PATH: &str = "/proc/cpuinfo";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuInfo {
    content: Box<str>,
}

impl CpuInfo {
    /// Read the host's `/proc/cpuinfo`. An unreadable file produces an empty
    /// source, which parses to zero processors.
    pub fn host() -> CpuInfo {
        Self::from_file_or_empty(Path::new(HOST_CPUINFO_PATH))
    }

    /// Read the topology description from `path`. Bytes that are not valid
    /// UTF-8 are replaced with U+FFFD, which only affects the value they
    /// appear in.
    pub fn from_file(path: &Path) -> Result<CpuInfo> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to open or read file {:?}", path))?;
        Ok(Self::from_str(&String::from_utf8_lossy(&bytes)))
    }

    /// Like [`CpuInfo::from_file`] but degrades to empty content on failure.
    pub fn from_file_or_empty(path: &Path) -> CpuInfo {
        match Self::from_file(path) {
            Ok(cpuinfo) => cpuinfo,
            Err(e) => {
                warn!("{:#}, assuming no processors", e);
                CpuInfo::default()
            }
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> CpuInfo {
        CpuInfo {
            content: content.into(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Iterate over the lines of the buffer, first to last. A trailing
    /// newline does not produce an extra empty line.
    pub fn lines(&self) -> Lines<'_> {
        Lines {
            content: &self.content,
            pos: 0,
        }
    }
}

/// Forward-only cursor over the lines of a [`CpuInfo`] buffer.
#[derive(Debug, Clone)]
pub struct Lines<'a> {
    content: &'a str,
    pos: usize,
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.pos >= self.content.len() {
            return None;
        }

        let rest = &self.content[self.pos..];
        let (line, advance) = match rest.find('\n') {
            Some(end) => (&rest[..end], end + 1),
            None => (rest, rest.len()),
        };
        self.pos += advance;
        Some(line)
    }
}
