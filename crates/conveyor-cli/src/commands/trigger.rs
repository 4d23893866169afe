//! Trigger rule check.

use anyhow::Result;
use conveyor_core::trigger::{evaluate, first_match};
use std::path::Path;

use crate::EventArgs;

/// Report whether an event would start a run, without running anything.
pub fn check(path: &Path, args: &EventArgs) -> Result<()> {
    let pipeline = super::read_pipeline(path)?;
    let event = super::build_event(args);

    if evaluate(&event, &pipeline.trigger) {
        let pattern = first_match(&event, &pipeline.trigger).unwrap_or_default();
        println!(
            "✓ {} '{}' would start pipeline '{}' (matched '{}')",
            event.ref_kind, event.ref_name, pipeline.name, pattern
        );
    } else {
        println!(
            "⊘ {} '{}' would not start pipeline '{}'",
            event.ref_kind, event.ref_name, pipeline.name
        );
    }
    Ok(())
}
