//! `threadlet run` — Simulate a workload and print a scheduling report.

use crate::output::{resolve_color_choice, StyledOutput};
use crate::simulate::Simulation;
use crate::workload::Workload;
use crate::Format;
use std::path::Path;

pub struct RunOptions<'a> {
    pub format: Format,
    pub trace: bool,
    pub seed: Option<u64>,
    pub max_dispatches: Option<u64>,
    pub color: Option<&'a str>,
}

pub fn execute(file: &Path, options: RunOptions<'_>) -> anyhow::Result<()> {
    let workload = Workload::from_file(file)?;
    let report = Simulation::new(&workload, options.seed, options.max_dispatches)?.run(options.trace)?;

    match options.format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => StyledOutput::new(resolve_color_choice(options.color)).report(&report),
    }

    if report.rejected() > 0 {
        std::process::exit(1);
    }
    Ok(())
}
