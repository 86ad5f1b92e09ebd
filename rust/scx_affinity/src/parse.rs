// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpuinfo Parser
//!
//! Turns the lines of a [`CpuInfo`] into an ordered list of
//! [`ProcessorRecord`]s. Each processor is described by a run of
//! `<field><whitespace>: <value>` lines and closed by a line without a ':'
//! delimiter, usually the blank line separating processors.
//!
//! Parsing is best-effort and never fails: unknown fields are skipped and
//! numbers which can't be read are taken as 0. [`Parsed`] keeps track of
//! whether a value was actually read or defaulted.

use crate::CpuInfo;

/// Outcome of a best-effort numeric parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed<T> {
    Value(T),
    Defaulted,
}

impl<T: Default> Parsed<T> {
    /// The parsed value, or the type's default if nothing could be read.
    pub fn value(self) -> T {
        match self {
            Parsed::Value(v) => v,
            Parsed::Defaulted => T::default(),
        }
    }

    pub fn is_defaulted(&self) -> bool {
        matches!(self, Parsed::Defaulted)
    }
}

/// One logical processor as described by cpuinfo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorRecord {
    /// "processor"
    pub logical_id: u32,
    /// "physical id"
    pub socket_id: u32,
    /// "siblings"
    pub siblings: u32,
    /// "core id"
    pub core_id: u32,
    /// "cpu cores"
    pub cores_per_socket: u32,
    /// Derived from the "@ <speed><unit>" suffix of "model name".
    pub speed_mhz: u32,
}

/// Parse an unsigned base-10 integer the way `atol()` would: leading
/// whitespace and an optional '+' are skipped and the longest run of digits
/// is used, trailing garbage is ignored. No digits, a negative number or an
/// overflow yield [`Parsed::Defaulted`].
pub fn parse_integer(text: &str) -> Parsed<u32> {
    let text = text.trim_start();
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return Parsed::Defaulted;
    }

    match digits[..end].parse::<u32>() {
        Ok(0) => Parsed::Value(0),
        Ok(_) if negative => Parsed::Defaulted,
        Ok(v) => Parsed::Value(v),
        Err(_) => Parsed::Defaulted,
    }
}

/// Length of the longest prefix of `text` that reads as a decimal float:
/// `[+-]?digits[.digits][(e|E)[+-]?digits]` with at least one mantissa digit.
fn float_prefix_len(text: &str) -> usize {
    let bytes = text.as_bytes();
    let digits_from = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    let mut i = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        i += 1;
    }
    let int_end = digits_from(i);
    let mut nr_digits = int_end - i;
    i = int_end;
    if bytes.get(i) == Some(&b'.') {
        let frac_end = digits_from(i + 1);
        nr_digits += frac_end - (i + 1);
        i = frac_end;
    }
    if nr_digits == 0 {
        return 0;
    }

    if matches!(bytes.get(i), Some(b'e' | b'E')) {
        let mut j = i + 1;
        if matches!(bytes.get(j), Some(b'+' | b'-')) {
            j += 1;
        }
        let exp_end = digits_from(j);
        if exp_end > j {
            i = exp_end;
        }
    }
    i
}

/// Extract the clock speed in MHz from a "model name" value such as
/// "Intel(R) Xeon(R) CPU E5-2699 v4 @ 2.20GHz".
///
/// Without an explicit "MHz"/"GHz" unit, speeds below 100 are taken as GHz
/// and anything else as MHz. Returns 0 if there is no '@'.
pub fn extract_speed_mhz(model_name: &str) -> u32 {
    let after_at = match model_name.find('@') {
        Some(pos) => &model_name[pos + 1..],
        None => return 0,
    };

    let number = after_at.trim_start();
    let len = float_prefix_len(number);
    let (speed, unit) = if len == 0 {
        (0.0, after_at)
    } else {
        (number[..len].parse::<f64>().unwrap_or(0.0), &number[len..])
    };
    let unit = unit.trim_start();

    let is_mhz = unit.starts_with("MHz");
    let is_ghz = unit.starts_with("GHz");

    if is_ghz || (speed < 100.0 && !is_mhz) {
        (1000.0 * speed + 0.5) as u32
    } else {
        (speed + 0.5) as u32
    }
}

fn begins_with(line: &str, field: &str) -> bool {
    line.starts_with(field)
}

fn parse_value(record: &mut ProcessorRecord, line: &str, value: &str) {
    if begins_with(line, "processor") {
        record.logical_id = parse_integer(value).value();
    }
    if begins_with(line, "physical id") {
        record.socket_id = parse_integer(value).value();
    }
    if begins_with(line, "siblings") {
        record.siblings = parse_integer(value).value();
    }
    if begins_with(line, "core id") {
        record.core_id = parse_integer(value).value();
    }
    if begins_with(line, "cpu cores") {
        record.cores_per_socket = parse_integer(value).value();
    }
    if begins_with(line, "model name") {
        record.speed_mhz = extract_speed_mhz(value);
    }
}

/// Parse every processor described by `cpuinfo`, in file order.
pub fn parse_processors(cpuinfo: &CpuInfo) -> Vec<ProcessorRecord> {
    let mut processors = Vec::new();
    let mut current: Option<ProcessorRecord> = None;

    for line in cpuinfo.lines() {
        let Some(delim) = line.find(':') else {
            processors.extend(current.take());
            continue;
        };

        // The value starts after ": ".
        let value = line.get(delim + 2..).unwrap_or("");
        let record = current.get_or_insert_with(ProcessorRecord::default);
        parse_value(record, line, value);
    }
    processors.extend(current);

    processors
}
