// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! JSON description of an address map: the apertures handed to the allocator and the windows and
//! BARs placed into them.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::info;
use log::warn;
use range_alloc::Pool;
use range_alloc::RangeAllocator;
use range_alloc::RangeId;
use range_alloc::Request;
use range_alloc::ResourceKind;
use serde::Deserialize;
use serde::Serialize;

/// A span of address space added to the free list of `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Aperture {
    pub kind: ResourceKind,
    pub start: u64,
    pub size: u64,
    #[serde(default = "default_alignment")]
    pub alignment: u64,
}

/// A named placement. With a `parent` it goes inside that earlier placement, otherwise into the
/// free list of its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementConfig {
    pub name: String,
    pub request: Request,
    #[serde(default)]
    pub fixed_start: Option<u64>,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub apertures: Vec<Aperture>,
    #[serde(default)]
    pub placements: Vec<PlacementConfig>,
    /// When set, every free list is collapsed to this alignment once all placements are done.
    #[serde(default)]
    pub collapse_alignment: Option<u64>,
}

fn default_alignment() -> u64 {
    1
}

impl ScenarioConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Builds the address map. A placement that does not fit is logged and skipped, like a BAR
    /// left unassigned during enumeration; its children are skipped with it.
    pub fn build(&self) -> Result<ScenarioOutcome> {
        let mut allocator = RangeAllocator::new();
        for aperture in &self.apertures {
            allocator
                .add_range(
                    aperture.kind,
                    aperture.start,
                    aperture.size,
                    aperture.alignment,
                )
                .with_context(|| {
                    format!(
                        "failed to add {:?} aperture at {:#x}",
                        aperture.kind, aperture.start
                    )
                })?;
        }

        let mut placed = BTreeMap::new();
        let mut skipped = Vec::new();
        for placement in &self.placements {
            if placed.contains_key(&placement.name) || skipped.contains(&placement.name) {
                bail!("placement {} is defined twice", placement.name);
            }
            let pool = match &placement.parent {
                Some(parent) if skipped.contains(parent) => {
                    warn!("skipping {}: {} was not placed", placement.name, parent);
                    skipped.push(placement.name.clone());
                    continue;
                }
                Some(parent) => match placed.get(parent) {
                    Some(&id) => Pool::Range(id),
                    None => bail!("{} names unknown parent {}", placement.name, parent),
                },
                None => Pool::Kind(placement.request.kind),
            };
            let id = allocator
                .new_request(&placement.request)
                .with_context(|| format!("invalid request for {}", placement.name))?;
            match allocator.allocate_subrange(pool, id, placement.fixed_start) {
                Ok(()) => {
                    info!("placed {} at {}", placement.name, allocator.get(id)?.span());
                    placed.insert(placement.name.clone(), id);
                }
                Err(e) => {
                    warn!("failed to place {}: {}", placement.name, e);
                    allocator.release(id)?;
                    skipped.push(placement.name.clone());
                }
            }
        }

        if let Some(alignment) = self.collapse_alignment {
            let kinds: Vec<ResourceKind> = allocator.kinds().collect();
            for kind in kinds {
                let reclaimed = allocator.collapse_list(kind, alignment)?;
                info!("collapsed {:?} free ranges, reclaimed {:#x}", kind, reclaimed);
            }
        }

        Ok(ScenarioOutcome {
            allocator,
            placed,
            skipped,
        })
    }
}

/// Result of building a `ScenarioConfig`.
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub allocator: RangeAllocator,
    pub placed: BTreeMap<String, RangeId>,
    pub skipped: Vec<String>,
}

impl ScenarioOutcome {
    /// Prints every free range of every kind as a tree.
    pub fn print(&self) {
        for kind in self.allocator.kinds() {
            println!("{:?}:", kind);
            for &id in self.allocator.free_ranges(kind) {
                print!("{}", self.allocator.display(id));
            }
        }
        for name in &self.skipped {
            println!("unplaced: {}", name);
        }
    }
}
