//! `threadlet check` — Validate a workload without running it.

use crate::output::{resolve_color_choice, StyledOutput};
use crate::workload::Workload;
use std::path::Path;

pub fn execute(file: &Path, color: Option<&str>) -> anyhow::Result<()> {
    let workload = Workload::from_file(file)?;
    let defaults = workload.default_controls()?;

    let mut out = StyledOutput::new(resolve_color_choice(color));
    out.success("ok");
    out.plain(&format!(
        " {}: {} threadlet(s), {} task(s)",
        file.display(),
        workload.threadlets.len(),
        workload.task_count()
    ));
    out.newline();
    for t in &workload.threadlets {
        let c = t.controls(defaults)?;
        out.plain(&format!(
            "  {} [{}] timeslice {:?}, yield interval {:?}",
            t.name, c.priority, c.timeslice, c.yield_interval
        ));
        out.newline();
    }
    out.flush();
    Ok(())
}
