// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::ops::RangeInclusive;

use serde::Deserialize;
use serde::Serialize;

/// An inclusive span of addresses `start..=end`.
///
/// Placements inside the allocator are tracked as half-open `[start, end)` so that `end` can be
/// compared directly against neighbouring starts. `AddressRange` is the inclusive view used for
/// request bounds, error reports and diagnostics, where a window ending at `u64::MAX` must stay
/// representable.
#[derive(Copy, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    /// Creates a new `AddressRange` from `start` and `end` (inclusive) addresses.
    pub const fn from_start_and_end(start: u64, end: u64) -> Self {
        AddressRange { start, end }
    }

    /// Converts a half-open placement `[start, end)` into an inclusive range.
    pub const fn from_half_open(start: u64, end: u64) -> Self {
        if end <= start {
            AddressRange::empty()
        } else {
            AddressRange {
                start,
                end: end - 1,
            }
        }
    }

    /// The whole 64-bit address space.
    pub const fn full() -> Self {
        AddressRange {
            start: 0,
            end: u64::MAX,
        }
    }

    /// Returns an empty range.
    pub const fn empty() -> Self {
        AddressRange { start: 1, end: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    fn log(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_empty() {
            f.write_str("empty")
        } else {
            f.write_fmt(format_args!("{:#x}..={:#x}", self.start, self.end))
        }
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.log(f)
    }
}

impl std::fmt::Debug for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.log(f)
    }
}

impl From<RangeInclusive<u64>> for AddressRange {
    fn from(range: RangeInclusive<u64>) -> AddressRange {
        AddressRange {
            start: *range.start(),
            end: *range.end(),
        }
    }
}

/// Every empty range is equal to every other empty range.
impl PartialEq for AddressRange {
    fn eq(&self, other: &Self) -> bool {
        match (self.is_empty(), other.is_empty()) {
            (true, true) => true,
            (false, false) => self.start == other.start && self.end == other.end,
            _ => false,
        }
    }
}

impl Eq for AddressRange {}
