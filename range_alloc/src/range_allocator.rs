// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;

use crate::align_down;
use crate::align_up;
use crate::placement::Candidate;
use crate::placement::Constraints;
use crate::placement::Gap;
use crate::AddressRange;
use crate::Error;
use crate::Range;
use crate::RangeFlags;
use crate::RangeId;
use crate::Request;
use crate::ResourceKind;
use crate::Result;

/// Where `allocate_subrange` and `deallocate_subrange` look for containers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Pool {
    /// Every top-level free range of a resource kind, in ascending order.
    Kind(ResourceKind),
    /// A single range, typically a placed bridge window hosting its devices' windows.
    Range(RangeId),
}

/// Owns every range and keeps one ordered list of top-level free ranges per resource kind.
///
/// # Example
///
/// ```
/// # use range_alloc::{Pool, RangeAllocator, Request, ResourceKind};
/// let mut allocator = RangeAllocator::new();
/// allocator.add_range(ResourceKind::Memory, 0x8000_0000, 0x1000_0000, 1).unwrap();
/// let bar = allocator
///     .new_request(Request::new(ResourceKind::Memory, 0x4000).align(0x4000))
///     .unwrap();
/// allocator.allocate_subrange(Pool::Kind(ResourceKind::Memory), bar, None).unwrap();
/// assert_eq!(allocator.get(bar).unwrap().start(), 0x8000_0000);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeAllocator {
    /// Arena indexed by `RangeId`. Released slots stay `None`.
    ranges: Vec<Option<Range>>,
    free_lists: BTreeMap<ResourceKind, Vec<RangeId>>,
}

fn check_alignment(alignment: u64) -> Result<()> {
    if alignment.is_power_of_two() {
        Ok(())
    } else {
        Err(Error::BadAlignment)
    }
}

impl RangeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the range behind `id`.
    pub fn get(&self, id: RangeId) -> Result<&Range> {
        self.ranges
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidRange(id))
    }

    fn get_mut(&mut self, id: RangeId) -> Result<&mut Range> {
        self.ranges
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidRange(id))
    }

    fn insert(&mut self, range: Range) -> RangeId {
        self.ranges.push(Some(range));
        RangeId(self.ranges.len() - 1)
    }

    /// Top-level free ranges of `kind` in ascending order.
    pub fn free_ranges(&self, kind: ResourceKind) -> &[RangeId] {
        self.free_lists.get(&kind).map_or(&[], Vec::as_slice)
    }

    /// Resource kinds that have at least one free range.
    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.free_lists
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(kind, _)| *kind)
    }

    pub fn occupants(&self, id: RangeId) -> Result<&[RangeId]> {
        Ok(self.get(id)?.occupants())
    }

    pub fn container_of(&self, id: RangeId) -> Result<Option<RangeId>> {
        Ok(self.get(id)?.container())
    }

    /// Creates an unplaced range for `request`.
    pub fn new_request(&mut self, request: &Request) -> Result<RangeId> {
        check_alignment(request.alignment)?;
        if request.size == 0 {
            return Err(Error::AllocSizeZero);
        }
        if request.bounds.is_empty() {
            return Err(Error::OutOfBounds);
        }
        Ok(self.insert(Range {
            kind: request.kind,
            start: 0,
            size: 0,
            end: 0,
            proposed_size: request.size,
            alignment: request.alignment,
            min_address: request.bounds.start,
            max_address: request.bounds.end,
            flags: request.flags,
            fair_share: request.fair_share,
            container: None,
            occupants: Vec::new(),
        }))
    }

    /// Creates a standalone range already covering `[start, start + size)`. It belongs to no free
    /// list and can be used directly as a `Pool::Range` container.
    pub fn new_placed_range(
        &mut self,
        kind: ResourceKind,
        start: u64,
        size: u64,
        alignment: u64,
    ) -> Result<RangeId> {
        check_alignment(alignment)?;
        if size == 0 {
            return Err(Error::AllocSizeZero);
        }
        if start.checked_add(size).is_none() {
            return Err(Error::PoolOverflow { base: start, size });
        }
        Ok(self.insert(Range::placed(kind, start, size, alignment)))
    }

    /// Drops an unlinked range. Ranges hosting occupants or linked into a container are refused;
    /// an empty top-level free range is removed from its list.
    pub fn release(&mut self, id: RangeId) -> Result<Range> {
        let range = self.get(id)?;
        if range.container.is_some() || !range.occupants.is_empty() {
            return Err(Error::RangeInUse(id));
        }
        let kind = range.kind;
        if let Some(list) = self.free_lists.get_mut(&kind) {
            list.retain(|r| *r != id);
        }
        self.ranges
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(Error::InvalidRange(id))
    }

    /// Changes the size a range asks for. A placed range grows towards or shrinks to the new size
    /// the next time it is passed to `allocate_subrange`.
    pub fn propose_size(&mut self, id: RangeId, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::AllocSizeZero);
        }
        self.get_mut(id)?.proposed_size = size;
        Ok(())
    }

    /// Adds `[start, start + size)` to the free ranges of `kind`, merging it into a touching
    /// neighbour. Returns the free range now covering it.
    pub fn add_range(
        &mut self,
        kind: ResourceKind,
        start: u64,
        size: u64,
        alignment: u64,
    ) -> Result<RangeId> {
        check_alignment(alignment)?;
        if size == 0 {
            return Err(Error::AllocSizeZero);
        }
        let end = start
            .checked_add(size)
            .ok_or(Error::PoolOverflow { base: start, size })?;
        let added = AddressRange::from_half_open(start, end);

        let list = self.free_lists.get(&kind).cloned().unwrap_or_default();
        let mut index = list.len();
        for (i, &id) in list.iter().enumerate() {
            let range = self.get(id)?;
            if start < range.end && end > range.start {
                return Err(Error::RegionOverlap(added));
            }
            if end == range.start {
                let range = self.get_mut(id)?;
                range.start = start;
                range.size = range.end - start;
                range.proposed_size = range.size;
                debug!("{:?}: extended free range {} down to {:#x}", kind, id, start);
                return Ok(id);
            }
            if start == range.end {
                let next = match list.get(i + 1) {
                    Some(&next_id) => Some((next_id, self.get(next_id)?.start)),
                    None => None,
                };
                match next {
                    Some((_, next_start)) if end > next_start => {
                        return Err(Error::RegionOverlap(added));
                    }
                    Some((next_id, next_start)) if end == next_start => {
                        self.merge_free_ranges(kind, id, next_id)?;
                    }
                    _ => {
                        let range = self.get_mut(id)?;
                        range.end = end;
                        range.size = end - range.start;
                        range.proposed_size = range.size;
                    }
                }
                debug!("{:?}: extended free range {} up to {:#x}", kind, id, end);
                return Ok(id);
            }
            if range.start > end {
                index = i;
                break;
            }
        }

        let id = self.insert(Range::placed(kind, start, size, alignment));
        self.free_lists.entry(kind).or_default().insert(index, id);
        debug!("{:?}: new free range {} {}", kind, id, added);
        Ok(id)
    }

    /// Joins `upper` onto the end of `lower` across the gap that was just filled. The occupants of
    /// `upper` move to `lower` and `upper` is dropped.
    fn merge_free_ranges(
        &mut self,
        kind: ResourceKind,
        lower: RangeId,
        upper: RangeId,
    ) -> Result<()> {
        let upper_range = self
            .ranges
            .get_mut(upper.0)
            .and_then(Option::take)
            .ok_or(Error::InvalidRange(upper))?;
        for occupant in &upper_range.occupants {
            self.get_mut(*occupant)?.container = Some(lower);
        }
        let range = self.get_mut(lower)?;
        range.end = upper_range.end;
        range.size = range.end - range.start;
        range.proposed_size = range.size;
        range.occupants.extend(upper_range.occupants);
        if let Some(list) = self.free_lists.get_mut(&kind) {
            list.retain(|r| *r != upper);
        }
        Ok(())
    }

    fn pool_ranges(&self, pool: Pool) -> Result<Vec<RangeId>> {
        match pool {
            Pool::Kind(kind) => Ok(self.free_ranges(kind).to_vec()),
            Pool::Range(id) => {
                self.get(id)?;
                Ok(vec![id])
            }
        }
    }

    /// Returns `true` if `id` is `ancestor` or one of its nested occupants.
    fn is_within(&self, mut id: RangeId, ancestor: RangeId) -> Result<bool> {
        loop {
            if id == ancestor {
                return Ok(true);
            }
            match self.get(id)?.container {
                Some(container) => id = container,
                None => return Ok(false),
            }
        }
    }

    /// Gaps between the occupants of `container`, treating `skip` as free space.
    fn gaps(&self, container: RangeId, skip: RangeId) -> Result<Vec<Gap>> {
        let range = self.get(container)?;
        let mut gaps = Vec::new();
        let mut pos = range.start;
        for &occupant in range.occupants.iter().filter(|o| **o != skip) {
            let occupant = self.get(occupant)?;
            if occupant.start > pos {
                gaps.push(Gap {
                    start: pos,
                    end: occupant.start,
                });
            }
            pos = pos.max(occupant.end);
        }
        if range.end > pos {
            gaps.push(Gap {
                start: pos,
                end: range.end,
            });
        }
        Ok(gaps)
    }

    /// Places range `id` into a gap of one of the containers of `pool`.
    ///
    /// A range already linked into a container of the pool may be resized or, if it is
    /// `RELOCATABLE`, moved; its current slot counts as free space. `fixed_start` pins the
    /// placement to an exact address, typically the start a deallocated range remembers.
    ///
    /// A top-level free range cannot be placed; it fails with `RangeInUse`. On failure nothing is
    /// modified.
    pub fn allocate_subrange(
        &mut self,
        pool: Pool,
        id: RangeId,
        fixed_start: Option<u64>,
    ) -> Result<()> {
        let heads = self.pool_ranges(pool)?;
        let request = self.get(id)?;
        if self.free_ranges(request.kind).contains(&id) {
            return Err(Error::RangeInUse(id));
        }
        let maximize = request.flags.contains(RangeFlags::MAXIMIZE_SIZE);

        // A range that was placed before keeps its size unless it now proposes less.
        let mut min_size = if request.size != 0 {
            request.size.min(request.proposed_size)
        } else {
            request.proposed_size
        };
        if min_size == 0 {
            return Err(Error::AllocSizeZero);
        }
        if maximize {
            min_size = align_up(min_size, request.alignment);
        }
        if let Some(fixed) = fixed_start {
            if fixed % request.alignment != 0 {
                return Err(Error::BadAlignment);
            }
        }
        let relocatable = request.flags.contains(RangeFlags::RELOCATABLE);
        let fixed_start = match fixed_start {
            Some(fixed) => Some(fixed),
            None if request.container.is_some() && !relocatable => Some(request.start),
            None => None,
        };
        let tenants = match (request.occupants.first(), request.occupants.last()) {
            (Some(&first), Some(&last)) => Some((self.get(first)?.start, self.get(last)?.end)),
            _ => None,
        };

        let constraints = Constraints {
            min_size,
            proposed_size: request.proposed_size,
            alignment: request.alignment,
            bounds: request.bounds(),
            fixed_start,
            maximize,
            splay: request.flags.contains(RangeFlags::SPLAY),
            fair_share: request.fair_share,
            tenants,
        };

        let mut candidates = Vec::with_capacity(heads.len());
        for head in heads {
            if self.is_within(head, id)? {
                return Err(Error::InvalidRange(head));
            }
            candidates.push(Candidate {
                container: head,
                size: self.get(head)?.size,
                gaps: self.gaps(head, id)?,
            });
        }

        let placement = constraints
            .best_size(&candidates)
            .and_then(|size| constraints.place(&candidates, size));
        let placement = match placement {
            Some(p) => p,
            None => {
                debug!("no space for range {} of {:#x} bytes in {:?}", id, min_size, pool);
                return Err(Error::OutOfSpace);
            }
        };

        self.unlink(id)?;
        let request = self.get_mut(id)?;
        request.start = placement.start;
        request.size = placement.size;
        request.end = placement.start + placement.size;
        if maximize {
            request.proposed_size = request.proposed_size.max(placement.size);
        }
        self.link(placement.container, id)?;
        debug!(
            "placed range {} at {} in {}",
            id,
            AddressRange::from_half_open(placement.start, placement.start + placement.size),
            placement.container
        );
        Ok(())
    }

    /// Inserts `id` into the occupants of `container` keeping them ordered by start.
    fn link(&mut self, container: RangeId, id: RangeId) -> Result<()> {
        let start = self.get(id)?.start;
        let mut index = 0;
        for &occupant in self.get(container)?.occupants.iter() {
            if self.get(occupant)?.start > start {
                break;
            }
            index += 1;
        }
        self.get_mut(container)?.occupants.insert(index, id);
        self.get_mut(id)?.container = Some(container);
        Ok(())
    }

    /// Removes `id` from the occupants of its container, if any.
    fn unlink(&mut self, id: RangeId) -> Result<()> {
        if let Some(container) = self.get_mut(id)?.container.take() {
            self.get_mut(container)?.occupants.retain(|o| *o != id);
        }
        Ok(())
    }

    /// Releases range `id` from the container of `pool` it occupies, after releasing everything
    /// nested inside it.
    ///
    /// Every released range keeps its `start` and `size` so it can be re-attached with
    /// `allocate_subrange(pool, id, Some(start))`.
    pub fn deallocate_subrange(&mut self, pool: Pool, id: RangeId) -> Result<()> {
        let heads = self.pool_ranges(pool)?;
        match self.get(id)?.container {
            Some(container) if heads.contains(&container) => (),
            _ => return Err(Error::NotLinked(id)),
        }

        // Pre-order walk of the nested occupants; released in reverse so children go first.
        let mut worklist = vec![id];
        let mut order = Vec::new();
        while let Some(next) = worklist.pop() {
            order.push(next);
            worklist.extend(self.get(next)?.occupants.iter().copied());
        }
        for released in order.into_iter().rev() {
            self.unlink(released)?;
            let range = self.get_mut(released)?;
            range.end = range.start;
        }
        debug!("released range {} from {:?}", id, pool);
        Ok(())
    }

    /// Shrinks range `id` to the span of its occupants, rounded out to `alignment` (or the
    /// range's own alignment if larger). Returns the number of bytes given back.
    ///
    /// A range without occupants keeps its bounds but proposes a size of 0. Ranges flagged
    /// `NO_COLLAPSE` are left untouched.
    pub fn collapse(&mut self, id: RangeId, alignment: u64) -> Result<u64> {
        check_alignment(alignment)?;
        let range = self.get(id)?;
        if range.flags.contains(RangeFlags::NO_COLLAPSE) {
            return Ok(0);
        }
        let (first, last) = match (range.occupants.first(), range.occupants.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => {
                self.get_mut(id)?.proposed_size = 0;
                return Ok(0);
            }
        };
        let alignment = alignment.max(range.alignment);
        let start = align_down(self.get(first)?.start, alignment).max(range.start);
        let end = align_up(self.get(last)?.end, alignment).min(range.end);
        let old_size = range.size;

        let range = self.get_mut(id)?;
        range.start = start;
        range.end = end;
        range.size = end - start;
        range.proposed_size = range.size;
        Ok(old_size - range.size)
    }

    /// Collapses every free range of `kind`. Returns the total number of bytes given back.
    pub fn collapse_list(&mut self, kind: ResourceKind, alignment: u64) -> Result<u64> {
        let mut saved = 0;
        for id in self.free_ranges(kind).to_vec() {
            saved += self.collapse(id, alignment)?;
        }
        Ok(saved)
    }

    /// Free space at the tail of range `id` past its last occupant, with the occupant's end
    /// rounded up to `alignment`.
    pub fn last_free(&self, id: RangeId, alignment: u64) -> Result<u64> {
        check_alignment(alignment)?;
        let range = self.get(id)?;
        let last = match range.occupants.last() {
            Some(&occupant) => self.get(occupant)?.end,
            None => range.start,
        };
        Ok(range.end.saturating_sub(align_up(last, alignment)))
    }

    /// `last_free` of the highest free range of `kind`, or 0 if there is none.
    pub fn last_free_list(&self, kind: ResourceKind, alignment: u64) -> Result<u64> {
        match self.free_ranges(kind).last() {
            Some(&id) => self.last_free(id, alignment),
            None => Ok(0),
        }
    }

    /// Formats range `id` and everything nested inside it as an indented tree.
    pub fn display(&self, id: RangeId) -> RangeTree<'_> {
        RangeTree {
            allocator: self,
            root: id,
        }
    }

    /// Logs the tree of range `id` at debug level.
    pub fn dump(&self, id: RangeId) {
        for line in self.display(id).to_string().lines() {
            debug!("{}", line);
        }
    }
}

/// `Display` adapter returned by `RangeAllocator::display`.
pub struct RangeTree<'a> {
    allocator: &'a RangeAllocator,
    root: RangeId,
}

impl fmt::Display for RangeTree<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut stack = vec![(self.root, 0)];
        while let Some((id, depth)) = stack.pop() {
            match self.allocator.get(id) {
                Ok(range) => {
                    writeln!(f, "{:indent$}{} {}", "", id, range, indent = depth * 2)?;
                    stack.extend(range.occupants.iter().rev().map(|o| (*o, depth + 1)));
                }
                Err(e) => writeln!(f, "{:indent$}{}", "", e, indent = depth * 2)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEM: ResourceKind = ResourceKind::Memory;

    fn spans(allocator: &RangeAllocator, ids: &[RangeId]) -> Vec<(u64, u64)> {
        ids.iter()
            .map(|id| {
                let r = allocator.get(*id).unwrap();
                (r.start(), r.end())
            })
            .collect()
    }

    fn request(allocator: &mut RangeAllocator, size: u64, alignment: u64) -> RangeId {
        allocator
            .new_request(Request::new(MEM, size).align(alignment))
            .unwrap()
    }

    #[test]
    fn add_range_creates_sorted_nodes() {
        let mut a = RangeAllocator::new();
        a.add_range(MEM, 0x3000, 0x1000, 1).unwrap();
        a.add_range(MEM, 0x1000, 0x1000, 1).unwrap();
        a.add_range(MEM, 0x5000, 0x1000, 1).unwrap();
        assert_eq!(
            spans(&a, a.free_ranges(MEM)),
            vec![(0x1000, 0x2000), (0x3000, 0x4000), (0x5000, 0x6000)]
        );
    }

    #[test]
    fn add_range_extends_down_and_up() {
        let mut a = RangeAllocator::new();
        let id = a.add_range(MEM, 0xa000_0000, 0x50_0000, 1).unwrap();
        assert_eq!(a.add_range(MEM, 0x9800_0000, 0x800_0000, 1), Ok(id));
        assert_eq!(spans(&a, a.free_ranges(MEM)), vec![(0x9800_0000, 0xa050_0000)]);
        assert_eq!(a.add_range(MEM, 0xa050_0000, 0x10_0000, 1), Ok(id));
        let r = a.get(id).unwrap();
        assert_eq!((r.start(), r.end()), (0x9800_0000, 0xa060_0000));
        assert_eq!(r.size(), 0x860_0000);
        assert_eq!(r.proposed_size(), 0x860_0000);
    }

    #[test]
    fn add_range_merges_across_filled_gap() {
        let mut a = RangeAllocator::new();
        let low = a.add_range(MEM, 0x0, 0x1000, 1).unwrap();
        let high = a.add_range(MEM, 0x2000, 0x1000, 1).unwrap();
        let occupant = request(&mut a, 0x100, 1);
        a.allocate_subrange(Pool::Range(high), occupant, None).unwrap();

        assert_eq!(a.add_range(MEM, 0x1000, 0x1000, 1), Ok(low));
        assert_eq!(a.free_ranges(MEM), &[low]);
        assert_eq!(spans(&a, &[low]), vec![(0x0, 0x3000)]);
        assert_eq!(a.get(high), Err(Error::InvalidRange(high)));
        assert_eq!(a.occupants(low).unwrap(), &[occupant]);
        assert_eq!(a.container_of(occupant), Ok(Some(low)));
    }

    #[test]
    fn add_range_rejects_overlap() {
        let mut a = RangeAllocator::new();
        a.add_range(MEM, 0x1000, 0x1000, 1).unwrap();
        a.add_range(MEM, 0x4000, 0x1000, 1).unwrap();
        let before = a.clone();
        let overlapping = [
            (0x1800, 0x1000),
            (0x800, 0x1000),
            (0x1200, 0x100),
            (0x800, 0x5000),
            // Touches the first range but runs into the second.
            (0x2000, 0x2800),
        ];
        for (start, size) in overlapping {
            assert!(matches!(
                a.add_range(MEM, start, size, 1),
                Err(Error::RegionOverlap(_))
            ));
        }
        assert_eq!(a, before);
    }

    #[test]
    fn add_range_rejects_bad_arguments() {
        let mut a = RangeAllocator::new();
        assert_eq!(a.add_range(MEM, 0, 0, 1), Err(Error::AllocSizeZero));
        assert_eq!(a.add_range(MEM, 0, 0x10, 3), Err(Error::BadAlignment));
        assert_eq!(
            a.add_range(MEM, u64::MAX, 2, 1),
            Err(Error::PoolOverflow {
                base: u64::MAX,
                size: 2
            })
        );
        assert!(a.free_ranges(MEM).is_empty());
        assert_eq!(a.kinds().count(), 0);
    }

    #[test]
    fn kinds_keep_separate_lists() {
        let mut a = RangeAllocator::new();
        a.add_range(ResourceKind::Io, 0x1000, 0x1000, 1).unwrap();
        a.add_range(MEM, 0x1000, 0x1000, 1).unwrap();
        assert_eq!(
            a.kinds().collect::<Vec<_>>(),
            vec![MEM, ResourceKind::Io]
        );
        assert_eq!(a.free_ranges(ResourceKind::Io).len(), 1);
        assert!(a.free_ranges(ResourceKind::BusNumber).is_empty());
    }

    #[test]
    fn fixed_allocations() {
        let mut a = RangeAllocator::new();
        let head = a.add_range(MEM, 0x6, 0xfa, 1).unwrap();
        let first = request(&mut a, 1, 1);
        let second = request(&mut a, 1, 1);
        a.allocate_subrange(Pool::Kind(MEM), first, Some(0x6)).unwrap();
        a.allocate_subrange(Pool::Kind(MEM), second, Some(0x7)).unwrap();
        assert_eq!(spans(&a, a.occupants(head).unwrap()), vec![(0x6, 0x7), (0x7, 0x8)]);

        let third = request(&mut a, 1, 1);
        assert_eq!(
            a.allocate_subrange(Pool::Kind(MEM), third, Some(0x7)),
            Err(Error::OutOfSpace)
        );
        assert!(!a.get(third).unwrap().is_placed());
    }

    #[test]
    fn occupants_stay_sorted() {
        let mut a = RangeAllocator::new();
        let head = a.add_range(MEM, 0, 0x10000, 1).unwrap();
        for start in [0x8000, 0x2000, 0xc000, 0x0] {
            let r = request(&mut a, 0x1000, 0x1000);
            a.allocate_subrange(Pool::Range(head), r, Some(start)).unwrap();
        }
        let starts: Vec<u64> = spans(&a, a.occupants(head).unwrap())
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(starts, vec![0x0, 0x2000, 0x8000, 0xc000]);
    }

    #[test]
    fn best_fit_prefers_tight_gap() {
        let mut a = RangeAllocator::new();
        let head = a.add_range(MEM, 0, 0x10000, 1).unwrap();
        for start in [0x1000, 0x3000] {
            let r = request(&mut a, 0x1000, 0x1000);
            a.allocate_subrange(Pool::Range(head), r, Some(start)).unwrap();
        }
        // Gaps: [0, 0x1000), [0x2000, 0x3000), [0x4000, 0x10000).
        let r = request(&mut a, 0x800, 0x800);
        a.allocate_subrange(Pool::Range(head), r, None).unwrap();
        assert_eq!(a.get(r).unwrap().start(), 0x0);
        let r = request(&mut a, 0x1000, 0x1000);
        a.allocate_subrange(Pool::Range(head), r, None).unwrap();
        assert_eq!(a.get(r).unwrap().start(), 0x2000);
    }

    #[test]
    fn unaligned_fixed_start_is_rejected() {
        let mut a = RangeAllocator::new();
        a.add_range(MEM, 0, 0x10000, 1).unwrap();
        let r = request(&mut a, 0x1000, 0x1000);
        assert_eq!(
            a.allocate_subrange(Pool::Kind(MEM), r, Some(0x800)),
            Err(Error::BadAlignment)
        );
    }

    #[test]
    fn request_validation() {
        let mut a = RangeAllocator::new();
        assert_eq!(
            a.new_request(Request::new(MEM, 0x10).align(0)),
            Err(Error::BadAlignment)
        );
        assert_eq!(a.new_request(&Request::new(MEM, 0)), Err(Error::AllocSizeZero));
        assert_eq!(
            a.new_request(Request::new(MEM, 0x10).bounds(AddressRange::empty())),
            Err(Error::OutOfBounds)
        );
    }

    #[test]
    fn bounds_are_respected() {
        let mut a = RangeAllocator::new();
        a.add_range(MEM, 0, 0x10_0000, 1).unwrap();
        let r = a
            .new_request(
                Request::new(MEM, 0x1000)
                    .align(0x1000)
                    .bounds(AddressRange::from(0x8_0000..=0x8_0fff)),
            )
            .unwrap();
        a.allocate_subrange(Pool::Kind(MEM), r, None).unwrap();
        assert_eq!(a.get(r).unwrap().span(), AddressRange::from(0x8_0000..=0x8_0fff));

        let r = a
            .new_request(
                Request::new(MEM, 0x2000)
                    .align(0x1000)
                    .bounds(AddressRange::from(0x8_0000..=0x8_1fff)),
            )
            .unwrap();
        assert_eq!(a.allocate_subrange(Pool::Kind(MEM), r, None), Err(Error::OutOfSpace));
    }

    #[test]
    fn allocation_spills_into_next_free_range() {
        let mut a = RangeAllocator::new();
        let low = a.add_range(MEM, 0x0, 0x1000, 1).unwrap();
        let high = a.add_range(MEM, 0x10000, 0x4000, 1).unwrap();
        let r = request(&mut a, 0x2000, 0x1000);
        a.allocate_subrange(Pool::Kind(MEM), r, None).unwrap();
        assert_eq!(a.container_of(r), Ok(Some(high)));
        assert!(a.occupants(low).unwrap().is_empty());
    }

    #[test]
    fn grow_in_place() {
        let mut a = RangeAllocator::new();
        let head = a.add_range(MEM, 0, 0x10000, 1).unwrap();
        let r = request(&mut a, 0x1000, 0x1000);
        let neighbour = request(&mut a, 0x1000, 0x1000);
        a.allocate_subrange(Pool::Range(head), r, Some(0x4000)).unwrap();
        a.allocate_subrange(Pool::Range(head), neighbour, Some(0x7000)).unwrap();

        a.propose_size(r, 0x8000).unwrap();
        a.allocate_subrange(Pool::Range(head), r, None).unwrap();
        let range = a.get(r).unwrap();
        // Stays at its start and grows as far as the neighbour allows.
        assert_eq!((range.start(), range.end()), (0x4000, 0x7000));
        assert_eq!(range.proposed_size(), 0x8000);
        assert_eq!(a.occupants(head).unwrap(), &[r, neighbour]);
    }

    #[test]
    fn shrink_in_place() {
        let mut a = RangeAllocator::new();
        let head = a.add_range(MEM, 0, 0x10000, 1).unwrap();
        let r = request(&mut a, 0x4000, 0x1000);
        a.allocate_subrange(Pool::Range(head), r, Some(0x4000)).unwrap();

        a.propose_size(r, 0x1000).unwrap();
        a.allocate_subrange(Pool::Range(head), r, None).unwrap();
        let range = a.get(r).unwrap();
        assert_eq!((range.start(), range.end()), (0x4000, 0x5000));
        assert_eq!(range.size(), 0x1000);
        assert_eq!(range.proposed_size(), 0x1000);
        assert_eq!(a.last_free(head, 1), Ok(0xb000));
    }

    #[test]
    fn free_range_cannot_be_placed() {
        let mut a = RangeAllocator::new();
        let low = a.add_range(MEM, 0x1000, 0x1000, 1).unwrap();
        let high = a.add_range(MEM, 0x10000, 0x10000, 1).unwrap();
        let before = a.clone();
        assert_eq!(
            a.allocate_subrange(Pool::Range(high), low, None),
            Err(Error::RangeInUse(low))
        );
        assert_eq!(
            a.allocate_subrange(Pool::Kind(MEM), low, Some(0x10000)),
            Err(Error::RangeInUse(low))
        );
        assert_eq!(a, before);
        assert_eq!(a.free_ranges(MEM), &[low, high]);
        assert!(a.occupants(high).unwrap().is_empty());
    }

    #[test]
    fn relocatable_range_moves_to_fit() {
        let mut a = RangeAllocator::new();
        let head = a.add_range(MEM, 0, 0x10000, 1).unwrap();
        let r = a
            .new_request(
                Request::new(MEM, 0x1000)
                    .align(0x1000)
                    .flags(RangeFlags::RELOCATABLE),
            )
            .unwrap();
        let neighbour = request(&mut a, 0x1000, 0x1000);
        a.allocate_subrange(Pool::Range(head), r, Some(0x4000)).unwrap();
        a.allocate_subrange(Pool::Range(head), neighbour, Some(0x5000)).unwrap();

        a.propose_size(r, 0x8000).unwrap();
        a.allocate_subrange(Pool::Range(head), r, None).unwrap();
        let range = a.get(r).unwrap();
        assert_eq!((range.start(), range.end()), (0x6000, 0xe000));
        assert_eq!(range.proposed_size(), 0x8000);
        assert_eq!(a.occupants(head).unwrap(), &[neighbour, r]);
    }

    #[test]
    fn maximize_size_raises_proposed_size() {
        let mut a = RangeAllocator::new();
        let head = a.add_range(MEM, 0x10_0000, 0x40_0000, 1).unwrap();
        let r = a
            .new_request(
                Request::new(MEM, 0x1000)
                    .align(0x10_0000)
                    .flags(RangeFlags::MAXIMIZE_SIZE)
                    .fair_share(1, 2),
            )
            .unwrap();
        a.allocate_subrange(Pool::Range(head), r, None).unwrap();
        let range = a.get(r).unwrap();
        assert_eq!(range.start(), 0x10_0000);
        assert_eq!(range.size(), 0x20_0000);
        assert_eq!(range.proposed_size(), 0x20_0000);
        assert_eq!(range.end() % 0x10_0000, 0);
    }

    #[test]
    fn nested_containers() {
        let mut a = RangeAllocator::new();
        let head = a.add_range(MEM, 0x8000_0000, 0x100_0000, 1).unwrap();
        let bridge = request(&mut a, 0x40_0000, 0x10_0000);
        a.allocate_subrange(Pool::Kind(MEM), bridge, None).unwrap();
        let bar = request(&mut a, 0x1000, 0x1000);
        a.allocate_subrange(Pool::Range(bridge), bar, None).unwrap();
        assert_eq!(a.container_of(bar), Ok(Some(bridge)));
        assert_eq!(a.get(bar).unwrap().start(), 0x8000_0000);

        // A bridge cannot be placed inside itself or its own tenants.
        assert_eq!(
            a.allocate_subrange(Pool::Range(bar), bridge, None),
            Err(Error::InvalidRange(bar))
        );
        // Deallocating against the wrong pool fails.
        assert_eq!(
            a.deallocate_subrange(Pool::Range(head), bar),
            Err(Error::NotLinked(bar))
        );
    }

    #[test]
    fn container_resize_keeps_tenants_covered() {
        let mut a = RangeAllocator::new();
        let head = a.add_range(MEM, 0, 0x100_0000, 1).unwrap();
        let bridge = a
            .new_request(
                Request::new(MEM, 0x40_0000)
                    .align(0x10_0000)
                    .flags(RangeFlags::RELOCATABLE),
            )
            .unwrap();
        a.allocate_subrange(Pool::Range(head), bridge, Some(0x40_0000)).unwrap();
        let bar = request(&mut a, 0x1000, 0x1000);
        a.allocate_subrange(Pool::Range(bridge), bar, Some(0x60_0000)).unwrap();

        let blocker = request(&mut a, 0x10_0000, 0x10_0000);
        a.allocate_subrange(Pool::Range(head), blocker, Some(0x80_0000)).unwrap();

        a.propose_size(bridge, 0x60_0000).unwrap();
        a.allocate_subrange(Pool::Range(head), bridge, None).unwrap();
        let range = a.get(bridge).unwrap();
        assert!(range.start() <= 0x60_0000 && range.end() >= 0x60_1000);
        assert_eq!(range.size(), 0x60_0000);
    }

    #[test]
    fn deallocate_keeps_placement_hint() {
        let mut a = RangeAllocator::new();
        let head = a.add_range(MEM, 0, 0x10000, 1).unwrap();
        let r = request(&mut a, 0x1000, 0x1000);
        a.allocate_subrange(Pool::Kind(MEM), r, Some(0x3000)).unwrap();
        a.deallocate_subrange(Pool::Kind(MEM), r).unwrap();

        let range = a.get(r).unwrap();
        assert!(!range.is_placed());
        assert_eq!((range.start(), range.size()), (0x3000, 0x1000));
        assert!(a.occupants(head).unwrap().is_empty());
        assert_eq!(a.deallocate_subrange(Pool::Kind(MEM), r), Err(Error::NotLinked(r)));

        let hint = a.get(r).unwrap().start();
        a.allocate_subrange(Pool::Kind(MEM), r, Some(hint)).unwrap();
        assert_eq!(spans(&a, &[r]), vec![(0x3000, 0x4000)]);
    }

    #[test]
    fn collapse_and_last_free() {
        let mut a = RangeAllocator::new();
        let head = a.add_range(MEM, 0x8000_0000, 0x100_0000, 1).unwrap();
        assert_eq!(a.last_free(head, 1), Ok(0x100_0000));
        let r = request(&mut a, 0x1000, 0x1000);
        a.allocate_subrange(Pool::Range(head), r, Some(0x8010_0000)).unwrap();
        assert_eq!(a.last_free(head, 0x10_0000), Ok(0xe0_0000));

        assert_eq!(a.collapse(head, 0x10_0000), Ok(0xf0_0000));
        let range = a.get(head).unwrap();
        assert_eq!((range.start(), range.end()), (0x8010_0000, 0x8020_0000));
        assert_eq!(range.proposed_size(), 0x10_0000);
        assert_eq!(a.collapse(head, 0x10_0000), Ok(0));
    }

    #[test]
    fn collapse_empty_and_no_collapse() {
        let mut a = RangeAllocator::new();
        let head = a.add_range(MEM, 0, 0x10000, 1).unwrap();
        assert_eq!(a.collapse(head, 1), Ok(0));
        assert_eq!(a.get(head).unwrap().proposed_size(), 0);
        assert_eq!(a.get(head).unwrap().size(), 0x10000);

        let pinned = a
            .new_request(Request::new(MEM, 0x4000).flags(RangeFlags::NO_COLLAPSE))
            .unwrap();
        a.propose_size(head, 0x10000).unwrap();
        a.allocate_subrange(Pool::Range(head), pinned, None).unwrap();
        let bar = request(&mut a, 0x10, 0x10);
        a.allocate_subrange(Pool::Range(pinned), bar, None).unwrap();
        assert_eq!(a.collapse(pinned, 1), Ok(0));
        assert_eq!(a.get(pinned).unwrap().size(), 0x4000);
        assert_eq!(a.collapse(head, 1), Ok(0xc000));
    }

    #[test]
    fn list_variants() {
        let mut a = RangeAllocator::new();
        assert_eq!(a.last_free_list(MEM, 1), Ok(0));
        assert_eq!(a.collapse_list(MEM, 1), Ok(0));
        let low = a.add_range(MEM, 0x0, 0x1000, 1).unwrap();
        let high = a.add_range(MEM, 0x10000, 0x10000, 1).unwrap();
        for (head, start) in [(low, 0x0), (high, 0x10000)] {
            let r = request(&mut a, 0x100, 0x100);
            a.allocate_subrange(Pool::Range(head), r, Some(start)).unwrap();
        }
        assert_eq!(a.last_free_list(MEM, 0x1000), Ok(0xf000));
        assert_eq!(a.collapse_list(MEM, 0x100), Ok(0xf00 + 0xff00));
    }

    #[test]
    fn release() {
        let mut a = RangeAllocator::new();
        let head = a.add_range(MEM, 0, 0x1000, 1).unwrap();
        let r = request(&mut a, 0x10, 1);
        a.allocate_subrange(Pool::Range(head), r, None).unwrap();
        assert_eq!(a.release(r), Err(Error::RangeInUse(r)));
        assert_eq!(a.release(head), Err(Error::RangeInUse(head)));
        a.deallocate_subrange(Pool::Range(head), r).unwrap();
        assert_eq!(a.release(r).map(|range| range.size()), Ok(0x10));
        assert_eq!(a.get(r), Err(Error::InvalidRange(r)));
        a.release(head).unwrap();
        assert!(a.free_ranges(MEM).is_empty());
    }

    #[test]
    fn display_tree() {
        let mut a = RangeAllocator::new();
        let head = a.add_range(ResourceKind::Io, 0x1000, 0x1000, 1).unwrap();
        let bridge = a
            .new_request(Request::new(ResourceKind::Io, 0x100).align(0x100))
            .unwrap();
        a.allocate_subrange(Pool::Range(head), bridge, None).unwrap();
        let bar = a
            .new_request(Request::new(ResourceKind::Io, 0x10).align(0x10))
            .unwrap();
        a.allocate_subrange(Pool::Range(bridge), bar, None).unwrap();
        assert_eq!(
            a.display(head).to_string(),
            "#0 Io 0x1000..=0x1fff size 0x1000 proposed 0x1000 align 0x1\n\
             \x20 #1 Io 0x1000..=0x10ff size 0x100 proposed 0x100 align 0x100\n\
             \x20   #2 Io 0x1000..=0x100f size 0x10 proposed 0x10 align 0x10\n"
        );
        a.dump(head);
    }
}
