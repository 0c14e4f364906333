// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs canned or JSON-described address maps through the PCI range allocator and prints the
//! resulting trees.

mod config;
mod scenario;

use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use argh::FromArgs;
use log::error;
use log::LevelFilter;

use crate::config::ScenarioConfig;
use crate::scenario::Scenario;

#[derive(FromArgs)]
/// Exercise the PCI range allocator
struct Args {
    /// built-in walkthrough to run, or "all"
    #[argh(option, arg_name = "NAME")]
    scenario: Option<String>,

    /// JSON file describing apertures and placements
    #[argh(option, arg_name = "PATH")]
    cfg: Option<PathBuf>,

    /// log level filter (off, error, warn, info, debug, trace)
    #[argh(option, default = "LevelFilter::Info")]
    log_level: LevelFilter,
}

fn init_logging(level: LevelFilter) -> Result<()> {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .try_init()
        .context("failed to initialize logging")
}

fn run(args: Args) -> Result<()> {
    init_logging(args.log_level)?;

    if args.scenario.is_none() && args.cfg.is_none() {
        bail!("nothing to do: pass --scenario or --cfg");
    }
    match args.scenario.as_deref() {
        Some("all") => {
            for scenario in Scenario::ALL {
                scenario.run()?;
            }
        }
        Some(name) => name
            .parse::<Scenario>()
            .map_err(anyhow::Error::msg)?
            .run()?,
        None => {}
    }
    if let Some(path) = args.cfg {
        let config = ScenarioConfig::from_file(&path)?;
        config.build()?.print();
    }
    Ok(())
}

fn main() {
    let args: Args = argh::from_env();
    if let Err(e) = run(args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
