// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;

use bitflags::bitflags;
use serde::Deserialize;
use serde::Serialize;

use crate::AddressRange;
use crate::FairShare;
use crate::ResourceKind;

/// Handle to a range owned by a `RangeAllocator`.
///
/// Handles are never reused, so a handle to a released range stays invalid.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Copy, Clone, Serialize, Deserialize)]
pub struct RangeId(pub(crate) usize);

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Placement policy bits of a range.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RangeFlags: u32 {
        /// Grow the placement up to the fair-share quota of the container. Both ends of the
        /// placement are aligned.
        const MAXIMIZE_SIZE = 1 << 0;
        /// `collapse` leaves this range's bounds alone.
        const NO_COLLAPSE = 1 << 1;
        /// Centre the placement in the largest gap instead of packing it.
        const SPLAY = 1 << 2;
        /// A placed range may be moved to a different start when it is re-allocated.
        const RELOCATABLE = 1 << 3;
    }
}

/// A node of the allocator. Depending on where it is linked, a range is a top-level free range, an
/// occupant of a container, or both at once (a bridge window hosting its devices' windows).
///
/// Placements are half-open: a placed range covers `[start, end)` with `end == start + size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub(crate) kind: ResourceKind,
    pub(crate) start: u64,
    pub(crate) size: u64,
    pub(crate) end: u64,
    pub(crate) proposed_size: u64,
    pub(crate) alignment: u64,
    pub(crate) min_address: u64,
    pub(crate) max_address: u64,
    pub(crate) flags: RangeFlags,
    pub(crate) fair_share: Option<FairShare>,
    /// Container this range is an occupant of.
    pub(crate) container: Option<RangeId>,
    /// Occupants of this range, ascending by `start`.
    pub(crate) occupants: Vec<RangeId>,
}

impl Range {
    /// A range that already covers `[start, start + size)`, reporting its whole capacity as
    /// proposed.
    pub(crate) fn placed(kind: ResourceKind, start: u64, size: u64, alignment: u64) -> Self {
        Range {
            kind,
            start,
            size,
            end: start + size,
            proposed_size: size,
            alignment,
            min_address: 0,
            max_address: u64::MAX,
            flags: RangeFlags::empty(),
            fair_share: None,
            container: None,
            occupants: Vec::new(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Exclusive end of the placement.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// The size the caller asked for. Maximize-size placements raise it to the size they got.
    pub fn proposed_size(&self) -> u64 {
        self.proposed_size
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn flags(&self) -> RangeFlags {
        self.flags
    }

    pub fn fair_share(&self) -> Option<FairShare> {
        self.fair_share
    }

    /// Inclusive address bounds a placement must respect.
    pub fn bounds(&self) -> AddressRange {
        AddressRange::from_start_and_end(self.min_address, self.max_address)
    }

    /// The addresses currently covered by this range.
    pub fn span(&self) -> AddressRange {
        AddressRange::from_half_open(self.start, self.end)
    }

    /// Returns `true` if the range covers any addresses.
    ///
    /// A deallocated range keeps its `start` and `size` as a hint for re-attaching at the same
    /// location but is not placed.
    pub fn is_placed(&self) -> bool {
        self.end > self.start
    }

    /// The container this range occupies, if it is linked into one.
    pub fn container(&self) -> Option<RangeId> {
        self.container
    }

    /// Occupants of this range in ascending address order.
    pub fn occupants(&self) -> &[RangeId] {
        &self.occupants
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} {} size {:#x} proposed {:#x} align {:#x}",
            self.kind,
            self.span(),
            self.size,
            self.proposed_size,
            self.alignment
        )?;
        if !self.flags.is_empty() {
            write!(f, " flags {:?}", self.flags)?;
        }
        Ok(())
    }
}
