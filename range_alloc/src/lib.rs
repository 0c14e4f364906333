// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Allocates PCI address-space windows (memory, prefetchable memory, I/O ports and bus numbers)
//! out of ordered lists of free ranges.
//!
//! A `RangeAllocator` keeps one list of top-level free ranges per `ResourceKind`. Requests for
//! BARs and bridge windows are placed into the gaps between the occupants of those ranges, and a
//! placed bridge window can in turn host the windows of the devices behind it.

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub use crate::address_range::AddressRange;
pub use crate::range::Range;
pub use crate::range::RangeFlags;
pub use crate::range::RangeId;
pub use crate::range_allocator::Pool;
pub use crate::range_allocator::RangeAllocator;
pub use crate::range_allocator::RangeTree;
pub use crate::request::FairShare;
pub use crate::request::Request;

mod address_range;
mod placement;
mod range;
mod range_allocator;
mod request;

/// Resource type a range describes. The allocator never interprets it beyond keeping one free
/// list per kind.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Non-prefetchable memory space.
    Memory,
    /// Prefetchable memory space.
    PrefetchableMemory,
    /// I/O port space.
    Io,
    /// Bus number space.
    BusNumber,
    /// A device BAR identified by its index.
    Bar(u8),
}

#[sorted]
#[derive(Error, Debug, Eq, PartialEq)]
pub enum Error {
    #[error("Allocation cannot have size of 0")]
    AllocSizeZero,
    #[error("Alignment must be a power of 2")]
    BadAlignment,
    #[error("Range {0:?} does not exist")]
    InvalidRange(RangeId),
    #[error("Range {0:?} is not an occupant of the pool")]
    NotLinked(RangeId),
    #[error("Request bounds are inverted")]
    OutOfBounds,
    #[error("Out of space")]
    OutOfSpace,
    #[error("base={base} + size={size} overflows")]
    PoolOverflow { base: u64, size: u64 },
    #[error("Range {0:?} still hosts occupants or is linked into a container")]
    RangeInUse(RangeId),
    #[error("Overlapping region {0}")]
    RegionOverlap(AddressRange),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Rounds `value` up to a multiple of `alignment`, saturating at the highest aligned value.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    match value.checked_add(mask) {
        Some(v) => v & !mask,
        None => u64::MAX & !mask,
    }
}

/// Rounds `value` down to a multiple of `alignment`.
pub(crate) fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(7, 1), 7);
        assert_eq!(align_up(u64::MAX, 0x10), u64::MAX & !0xf);
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(align_down(5, 1), 5);
    }

    #[test]
    fn kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ResourceKind::PrefetchableMemory).unwrap(),
            "\"prefetchable_memory\""
        );
        assert_eq!(
            serde_json::from_str::<ResourceKind>("{\"bar\":2}").unwrap(),
            ResourceKind::Bar(2)
        );
    }
}
