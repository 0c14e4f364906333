// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use serde::Deserialize;
use serde::Serialize;

use crate::AddressRange;
use crate::RangeFlags;
use crate::ResourceKind;

/// Fair-share hint for maximize-size requests: the request may grow up to
/// `container_size * priority / count`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FairShare {
    pub priority: u64,
    pub count: u64,
}

impl FairShare {
    /// The quota this share grants out of a container of `container_size` bytes.
    pub fn quota(&self, container_size: u64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let quota = u128::from(container_size) * u128::from(self.priority) / u128::from(self.count);
        u64::try_from(quota).unwrap_or(u64::MAX)
    }
}

/// Describes a window that needs address space. Turned into an unplaced range by
/// `RangeAllocator::new_request`.
///
/// ```
/// # use range_alloc::{AddressRange, RangeFlags, Request, ResourceKind};
/// let request = Request::new(ResourceKind::Memory, 0x4000)
///     .align(0x4000)
///     .bounds(AddressRange::from(0..=0xffff_ffff))
///     .flags(RangeFlags::SPLAY)
///     .clone();
/// assert_eq!(request.alignment, 0x4000);
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub kind: ResourceKind,
    /// Proposed size in bytes (or bus numbers).
    pub size: u64,
    #[serde(default = "default_alignment")]
    pub alignment: u64,
    #[serde(default = "AddressRange::full")]
    pub bounds: AddressRange,
    #[serde(default)]
    pub flags: RangeFlags,
    #[serde(default)]
    pub fair_share: Option<FairShare>,
}

fn default_alignment() -> u64 {
    1
}

impl Request {
    pub fn new(kind: ResourceKind, size: u64) -> Self {
        Request {
            kind,
            size,
            alignment: default_alignment(),
            bounds: AddressRange::full(),
            flags: RangeFlags::empty(),
            fair_share: None,
        }
    }

    /// Sets the required alignment of the placement start.
    pub fn align(&mut self, alignment: u64) -> &mut Self {
        self.alignment = alignment;
        self
    }

    /// Restricts the placement to `bounds` (inclusive).
    pub fn bounds(&mut self, bounds: AddressRange) -> &mut Self {
        self.bounds = bounds;
        self
    }

    pub fn flags(&mut self, flags: RangeFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Sets the fair-share hint used when `RangeFlags::MAXIMIZE_SIZE` is set.
    pub fn fair_share(&mut self, priority: u64, count: u64) -> &mut Self {
        self.fair_share = Some(FairShare { priority, count });
        self
    }
}
