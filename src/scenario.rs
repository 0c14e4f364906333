// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Canned walkthroughs of the allocator, each checking its own results.

use std::str::FromStr;

use anyhow::ensure;
use anyhow::Result;
use log::info;
use range_alloc::Pool;
use range_alloc::RangeAllocator;
use range_alloc::RangeFlags;
use range_alloc::RangeId;
use range_alloc::Request;
use range_alloc::ResourceKind;

const MEM: ResourceKind = ResourceKind::Memory;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Scenario {
    /// Fixed and splayed one-byte placements in a tiny range.
    SmallRange,
    /// Ranges added next to each other merge into one.
    Merge,
    /// A free range shrinks to its occupants.
    Collapse,
    /// A bridge with devices behind it is torn down in one call.
    Nested,
    /// Maximize-size windows split a prefetchable aperture evenly.
    FairShare,
}

impl Scenario {
    pub const ALL: [Scenario; 5] = [
        Scenario::SmallRange,
        Scenario::Merge,
        Scenario::Collapse,
        Scenario::Nested,
        Scenario::FairShare,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::SmallRange => "small-range",
            Scenario::Merge => "merge",
            Scenario::Collapse => "collapse",
            Scenario::Nested => "nested",
            Scenario::FairShare => "fair-share",
        }
    }

    /// Runs the walkthrough and prints the resulting trees.
    pub fn run(&self) -> Result<()> {
        info!("running scenario {}", self.name());
        let (allocator, roots) = match self {
            Scenario::SmallRange => small_range()?,
            Scenario::Merge => merge()?,
            Scenario::Collapse => collapse()?,
            Scenario::Nested => nested()?,
            Scenario::FairShare => fair_share()?,
        };
        for id in roots {
            allocator.dump(id);
            print!("{}", allocator.display(id));
        }
        Ok(())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Scenario::ALL
            .iter()
            .find(|scenario| scenario.name() == s)
            .copied()
            .ok_or_else(|| {
                let names: Vec<&str> = Scenario::ALL.iter().map(Scenario::name).collect();
                format!("unknown scenario {}, expected one of {}", s, names.join(", "))
            })
    }
}

fn span(allocator: &RangeAllocator, id: RangeId) -> Result<(u64, u64)> {
    let range = allocator.get(id)?;
    Ok((range.start(), range.end()))
}

fn small_range() -> Result<(RangeAllocator, Vec<RangeId>)> {
    let mut a = RangeAllocator::new();
    let head = a.add_range(MEM, 0x6, 0xfa, 1)?;
    for start in [0x6, 0x7] {
        let id = a.new_request(&Request::new(MEM, 1))?;
        a.allocate_subrange(Pool::Kind(MEM), id, Some(start))?;
        ensure!(span(&a, id)? == (start, start + 1), "fixed placement moved");
    }
    let splay = a.new_request(Request::new(MEM, 3).flags(RangeFlags::SPLAY))?;
    a.allocate_subrange(Pool::Kind(MEM), splay, None)?;
    let (start, end) = span(&a, splay)?;
    ensure!(
        (start - 0x8).abs_diff(0x100 - end) <= 1,
        "splay placement at {:#x} is not centred",
        start
    );
    Ok((a, vec![head]))
}

fn merge() -> Result<(RangeAllocator, Vec<RangeId>)> {
    let mut a = RangeAllocator::new();
    let id = a.add_range(MEM, 0xa000_0000, 0x50_0000, 1)?;
    ensure!(a.add_range(MEM, 0x9800_0000, 0x800_0000, 1)? == id, "range below did not merge");
    ensure!(a.add_range(MEM, 0xa050_0000, 0x10_0000, 1)? == id, "range above did not merge");
    let separate = a.add_range(MEM, 0xb000_0000, 0x1000, 1)?;
    ensure!(separate != id, "disjoint range merged");
    ensure!(span(&a, id)? == (0x9800_0000, 0xa060_0000), "merged span is wrong");
    let roots = a.free_ranges(MEM).to_vec();
    Ok((a, roots))
}

fn collapse() -> Result<(RangeAllocator, Vec<RangeId>)> {
    let mut a = RangeAllocator::new();
    let head = a.add_range(MEM, 0x8000_0000, 0x100_0000, 1)?;
    for (size, alignment) in [(0x4_0000, 0x4_0000), (0x40_0000, 0x10_0000)] {
        let id = a.new_request(Request::new(MEM, size).align(alignment))?;
        a.allocate_subrange(Pool::Kind(MEM), id, None)?;
    }
    let reclaimed = a.collapse(head, 0x10_0000)?;
    info!("collapse reclaimed {:#x}", reclaimed);
    ensure!(reclaimed == 0xb0_0000, "reclaimed {:#x}", reclaimed);
    ensure!(a.collapse(head, 0x10_0000)? == 0, "collapse is not idempotent");
    Ok((a, vec![head]))
}

fn nested() -> Result<(RangeAllocator, Vec<RangeId>)> {
    let mut a = RangeAllocator::new();
    let head = a.add_range(MEM, 0, 0x10_0000, 1)?;
    let bridge = a.new_request(Request::new(MEM, 0x1_0000).align(0x1_0000))?;
    a.allocate_subrange(Pool::Kind(MEM), bridge, None)?;
    let mut devices = Vec::new();
    for _ in 0..3 {
        let bar = a.new_request(Request::new(MEM, 0x1000).align(0x1000))?;
        a.allocate_subrange(Pool::Range(bridge), bar, None)?;
        devices.push(bar);
    }
    a.dump(head);
    a.deallocate_subrange(Pool::Kind(MEM), bridge)?;
    for id in devices.iter().chain([&bridge]) {
        ensure!(!a.get(*id)?.is_placed(), "{} is still placed", id);
    }
    ensure!(a.last_free(head, 1)? == 0x10_0000, "bridge space was not returned");
    Ok((a, vec![head]))
}

fn fair_share() -> Result<(RangeAllocator, Vec<RangeId>)> {
    let kind = ResourceKind::PrefetchableMemory;
    let mut a = RangeAllocator::new();
    let window = a.new_placed_range(kind, 0x4000_0000, 0x400_0000, 0x10_0000)?;
    for _ in 0..2 {
        let id = a.new_request(
            Request::new(kind, 0x10_0000)
                .align(0x10_0000)
                .flags(RangeFlags::MAXIMIZE_SIZE)
                .fair_share(1, 2),
        )?;
        a.allocate_subrange(Pool::Range(window), id, None)?;
        ensure!(a.get(id)?.size() == 0x200_0000, "window did not get its share");
    }
    ensure!(a.last_free(window, 1)? == 0, "aperture was not used up");
    Ok((a, vec![window]))
}
