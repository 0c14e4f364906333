// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Gap search behind `RangeAllocator::allocate_subrange`.
//!
//! The search runs in two passes over the gaps of every candidate container. The first pass finds
//! the largest size that can be placed anywhere, bounded by the request's maximum. The second pass
//! places exactly that size, picking a gap by the request's policy:
//!
//! 1. a fixed start, or a maximize-size request, takes the first gap that fits;
//! 2. a splay request takes the gap leaving the most waste and centres itself in it;
//! 3. anything else takes the gap with the least waste, stopping at the first exact fit.

use crate::align_down;
use crate::align_up;
use crate::AddressRange;
use crate::FairShare;
use crate::RangeId;

/// Free span `[start, end)` between occupants of a container.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Gap {
    pub start: u64,
    pub end: u64,
}

/// A container considered for a placement, with the gaps between its occupants.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub container: RangeId,
    pub size: u64,
    pub gaps: Vec<Gap>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Placement {
    pub container: RangeId,
    pub start: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct Constraints {
    pub min_size: u64,
    pub proposed_size: u64,
    pub alignment: u64,
    pub bounds: AddressRange,
    pub fixed_start: Option<u64>,
    pub maximize: bool,
    pub splay: bool,
    pub fair_share: Option<FairShare>,
    /// Span `[lo, hi)` of the request's own occupants, which every placement must keep covering.
    pub tenants: Option<(u64, u64)>,
}

impl Constraints {
    /// Largest size the request may take inside a container of `container_size` bytes.
    fn max_size(&self, container_size: u64) -> u64 {
        let mut max_size = self.proposed_size;
        if self.maximize {
            if let Some(share) = self.fair_share {
                max_size = max_size.max(share.quota(container_size));
            }
            max_size = align_down(max_size, self.alignment);
        }
        max_size.max(self.min_size)
    }

    /// Clips `gap` to the bounds, alignment and fixed start. Returns the usable `[pos, end_pos)`.
    fn window(&self, gap: Gap) -> Option<(u64, u64)> {
        let mut pos = gap.start.max(self.bounds.start);
        let mut end_pos = gap.end.min(self.bounds.end.saturating_add(1));
        match self.fixed_start {
            Some(fixed) => {
                if fixed < pos || fixed >= end_pos {
                    return None;
                }
                pos = fixed;
            }
            None => pos = align_up(pos, self.alignment),
        }
        if self.maximize {
            end_pos = align_down(end_pos, self.alignment);
        }
        if let Some((lo, hi)) = self.tenants {
            if pos > lo || end_pos < hi {
                return None;
            }
        }
        (end_pos > pos).then_some((pos, end_pos))
    }

    /// Start of a `size` byte placement inside the window `[pos, end_pos)`, if it fits. With
    /// tenants the start is pushed up just far enough for the placement to still cover them.
    fn fit(&self, pos: u64, end_pos: u64, size: u64) -> Option<u64> {
        if end_pos - pos < size {
            return None;
        }
        let (lo, hi) = match self.tenants {
            Some(span) => span,
            None => return Some(pos),
        };
        let start = match self.fixed_start {
            Some(_) => pos,
            None => pos.max(align_up(hi.saturating_sub(size), self.alignment)),
        };
        let fits = end_pos.checked_sub(start).map_or(false, |len| len >= size);
        (fits && start <= lo && start + size >= hi).then_some(start)
    }

    /// First pass: the largest size placeable in any gap of any candidate.
    pub fn best_size(&self, candidates: &[Candidate]) -> Option<u64> {
        let mut best = None;
        for candidate in candidates.iter().filter(|c| c.size != 0) {
            let max_size = self.max_size(candidate.size);
            for (pos, end_pos) in candidate.gaps.iter().filter_map(|g| self.window(*g)) {
                let len = (end_pos - pos).min(max_size);
                if len < self.min_size || self.fit(pos, end_pos, len).is_none() {
                    continue;
                }
                best = best.max(Some(len));
            }
        }
        best
    }

    /// Second pass: chooses where `size` bytes go.
    pub fn place(&self, candidates: &[Candidate], size: u64) -> Option<Placement> {
        let mut best: Option<(Placement, u64)> = None;
        for candidate in candidates.iter().filter(|c| c.size != 0) {
            if size > self.max_size(candidate.size) {
                continue;
            }
            for (pos, end_pos) in candidate.gaps.iter().filter_map(|g| self.window(*g)) {
                let start = match self.fit(pos, end_pos, size) {
                    Some(start) => start,
                    None => continue,
                };
                let waste = end_pos - pos - size;
                let mut placement = Placement {
                    container: candidate.container,
                    start,
                    size,
                };
                if self.fixed_start.is_some() || self.maximize {
                    return Some(placement);
                }
                if self.splay {
                    if self.tenants.is_none() {
                        placement.start += align_down(waste / 2, self.alignment);
                    }
                    if best.map_or(true, |(_, best_waste)| waste > best_waste) {
                        best = Some((placement, waste));
                    }
                } else {
                    if waste == 0 {
                        return Some(placement);
                    }
                    if best.map_or(true, |(_, best_waste)| waste < best_waste) {
                        best = Some((placement, waste));
                    }
                }
            }
        }
        best.map(|(placement, _)| placement)
    }
}
