//! CLI command implementations.

pub mod run;
pub mod trigger;

use anyhow::{Context, Result};
use conveyor_config::load_pipeline;
use conveyor_core::pipeline::{PipelineDefinition, StepAction};
use conveyor_core::trigger::TriggerEvent;
use std::path::Path;

use crate::EventArgs;

pub fn validate(path: &Path) -> Result<()> {
    let pipeline = read_pipeline(path)?;

    println!("Configuration is valid");
    println!("  pipeline: {}", pipeline.name);
    println!(
        "  trigger:  {} {:?} ({:?})",
        pipeline
            .trigger
            .ref_kinds
            .iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join("/"),
        pipeline.trigger.patterns,
        pipeline.trigger.policy,
    );
    for (index, step) in pipeline.steps.iter().enumerate() {
        let action = match &step.action {
            StepAction::Run { .. } => "run".to_string(),
            StepAction::Uses { action } => format!("uses {}", action),
        };
        println!("  {}. {} ({})", index + 1, step.name, action);
    }
    let secrets = pipeline.required_secrets();
    if !secrets.is_empty() {
        println!(
            "  secrets:  {}",
            secrets.into_iter().collect::<Vec<_>>().join(", ")
        );
    }
    Ok(())
}

pub(crate) fn read_pipeline(path: &Path) -> Result<PipelineDefinition> {
    load_pipeline(path)
        .with_context(|| format!("Failed to load pipeline config: {}", path.display()))
}

pub(crate) fn build_event(args: &EventArgs) -> TriggerEvent {
    let event = match (&args.branch, &args.tag) {
        (_, Some(tag)) => TriggerEvent::tag(tag.clone()),
        (Some(branch), None) => TriggerEvent::from_git_ref(branch),
        (None, None) => TriggerEvent::branch(String::new()),
    };
    if args.changed.is_empty() {
        event
    } else {
        event.with_changed_paths(args.changed.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::trigger::RefKind;

    fn args(branch: Option<&str>, tag: Option<&str>, changed: &[&str]) -> EventArgs {
        EventArgs {
            branch: branch.map(String::from),
            tag: tag.map(String::from),
            changed: changed.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_build_event_from_branch() {
        let event = build_event(&args(Some("refs/heads/main"), None, &[]));
        assert_eq!(event.ref_name, "main");
        assert_eq!(event.ref_kind, RefKind::Branch);
        assert!(event.changed_paths.is_none());
    }

    #[test]
    fn test_build_event_from_tag_with_paths() {
        let event = build_event(&args(None, Some("v1.2.0"), &["site/index.html"]));
        assert_eq!(event.ref_name, "v1.2.0");
        assert_eq!(event.ref_kind, RefKind::Tag);
        assert_eq!(event.changed_paths, Some(vec!["site/index.html".to_string()]));
    }
}
