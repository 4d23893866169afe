//! Trigger rules and their evaluation.
//!
//! Evaluation is a pure function of the event and the rule: it performs no
//! I/O and is always run before anything is provisioned for a run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::snapshot::{EmptySnapshot, RepositorySnapshot};

/// Kind of git ref an event points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Branch,
    Tag,
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefKind::Branch => f.write_str("branch"),
            RefKind::Tag => f.write_str("tag"),
        }
    }
}

/// How ref patterns in a [`TriggerRule`] are compared against an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// String equality only. `*` has no special meaning.
    #[default]
    Exact,
    /// Equality, plus a trailing `*` matches any ref starting with the text
    /// before it. A lone `*` matches every ref.
    Prefix,
}

/// Predicate deciding whether an event starts a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRule {
    /// Allow-list of ref patterns. Empty means nothing matches.
    pub patterns: Vec<String>,
    pub policy: MatchPolicy,
    /// Ref kinds this rule reacts to.
    pub ref_kinds: Vec<RefKind>,
    /// Path prefixes; when non-empty, at least one changed path must fall under one.
    pub paths: Vec<String>,
}

impl TriggerRule {
    /// Rule matching pushes to exactly the given branches.
    pub fn branches<I, S>(branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: branches.into_iter().map(Into::into).collect(),
            policy: MatchPolicy::Exact,
            ref_kinds: vec![RefKind::Branch],
            paths: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: MatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for TriggerRule {
    fn default() -> Self {
        Self::branches(["main"])
    }
}

/// An incoming event, e.g. a push delivered by a source-control webhook.
#[derive(Clone)]
pub struct TriggerEvent {
    pub ref_name: String,
    pub ref_kind: RefKind,
    /// Paths touched by the event, when the source reports them.
    pub changed_paths: Option<Vec<String>>,
    /// Accessor for the repository contents at this event.
    pub snapshot: Arc<dyn RepositorySnapshot>,
}

impl TriggerEvent {
    pub fn branch(name: impl Into<String>) -> Self {
        Self {
            ref_name: name.into(),
            ref_kind: RefKind::Branch,
            changed_paths: None,
            snapshot: Arc::new(EmptySnapshot),
        }
    }

    pub fn tag(name: impl Into<String>) -> Self {
        Self {
            ref_kind: RefKind::Tag,
            ..Self::branch(name)
        }
    }

    /// Build an event from a full git ref such as `refs/heads/main` or
    /// `refs/tags/v1.0`. Anything else is treated as a bare branch name.
    pub fn from_git_ref(git_ref: &str) -> Self {
        if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
            Self::tag(tag)
        } else {
            Self::branch(git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref))
        }
    }

    pub fn with_changed_paths(mut self, paths: Vec<String>) -> Self {
        self.changed_paths = Some(paths);
        self
    }

    pub fn with_snapshot(mut self, snapshot: Arc<dyn RepositorySnapshot>) -> Self {
        self.snapshot = snapshot;
        self
    }
}

impl fmt::Debug for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerEvent")
            .field("ref_name", &self.ref_name)
            .field("ref_kind", &self.ref_kind)
            .field("changed_paths", &self.changed_paths)
            .field("snapshot", &self.snapshot.describe())
            .finish()
    }
}

/// Decide whether `event` should start a run under `rule`.
pub fn evaluate(event: &TriggerEvent, rule: &TriggerRule) -> bool {
    first_match(event, rule).is_some() && paths_match(event, rule)
}

/// The first pattern of `rule` matching the event's ref, if any.
///
/// Only the ref is considered here; path filters are applied by [`evaluate`].
pub fn first_match<'r>(event: &TriggerEvent, rule: &'r TriggerRule) -> Option<&'r str> {
    if !rule.ref_kinds.contains(&event.ref_kind) {
        return None;
    }

    rule.patterns
        .iter()
        .map(String::as_str)
        .find(|pattern| pattern_matches(pattern, &event.ref_name, rule.policy))
}

fn pattern_matches(pattern: &str, ref_name: &str, policy: MatchPolicy) -> bool {
    match policy {
        MatchPolicy::Exact => pattern == ref_name,
        MatchPolicy::Prefix => match pattern.strip_suffix('*') {
            Some(prefix) => ref_name.starts_with(prefix),
            None => pattern == ref_name,
        },
    }
}

fn paths_match(event: &TriggerEvent, rule: &TriggerRule) -> bool {
    if rule.paths.is_empty() {
        return true;
    }

    match &event.changed_paths {
        // No path information: filters cannot exclude the event.
        None => true,
        Some(changed) => changed.iter().any(|path| {
            rule.paths
                .iter()
                .any(|filter| path.starts_with(filter.as_str()))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_branch_matches() {
        let rule = TriggerRule::branches(["main"]);
        assert!(evaluate(&TriggerEvent::branch("main"), &rule));
    }

    #[test]
    fn test_other_branch_is_denied() {
        let rule = TriggerRule::branches(["main"]);
        assert!(!evaluate(&TriggerEvent::branch("feature/x"), &rule));
        assert!(!evaluate(&TriggerEvent::branch("main2"), &rule));
        assert!(!evaluate(&TriggerEvent::branch("mai"), &rule));
    }

    #[test]
    fn test_empty_allow_list_denies_everything() {
        let rule = TriggerRule::branches(Vec::<String>::new());
        assert!(!evaluate(&TriggerEvent::branch("main"), &rule));
    }

    #[test]
    fn test_exact_policy_treats_star_literally() {
        let rule = TriggerRule::branches(["release/*"]);
        assert!(!evaluate(&TriggerEvent::branch("release/1.0"), &rule));
        assert!(evaluate(&TriggerEvent::branch("release/*"), &rule));
    }

    #[test]
    fn test_prefix_policy() {
        let rule = TriggerRule::branches(["release/*", "main"]).with_policy(MatchPolicy::Prefix);
        assert!(evaluate(&TriggerEvent::branch("release/1.0"), &rule));
        assert!(evaluate(&TriggerEvent::branch("main"), &rule));
        assert!(!evaluate(&TriggerEvent::branch("feature/release"), &rule));

        let any = TriggerRule::branches(["*"]).with_policy(MatchPolicy::Prefix);
        assert!(evaluate(&TriggerEvent::branch("anything"), &any));
    }

    #[test]
    fn test_first_match_wins() {
        let rule =
            TriggerRule::branches(["release/*", "release/1.0"]).with_policy(MatchPolicy::Prefix);
        let event = TriggerEvent::branch("release/1.0");
        assert_eq!(first_match(&event, &rule), Some("release/*"));
    }

    #[test]
    fn test_tags_require_tag_ref_kind() {
        let rule = TriggerRule::branches(["v1.0"]);
        assert!(!evaluate(&TriggerEvent::tag("v1.0"), &rule));

        let mut rule = rule;
        rule.ref_kinds.push(RefKind::Tag);
        assert!(evaluate(&TriggerEvent::tag("v1.0"), &rule));
    }

    #[test]
    fn test_path_filters() {
        let rule = TriggerRule::branches(["main"]).with_paths(["web/"]);

        let touching = TriggerEvent::branch("main").with_changed_paths(vec!["web/index.html".into()]);
        assert!(evaluate(&touching, &rule));

        let elsewhere = TriggerEvent::branch("main").with_changed_paths(vec!["docs/README.md".into()]);
        assert!(!evaluate(&elsewhere, &rule));

        assert!(evaluate(&TriggerEvent::branch("main"), &rule));
    }

    #[test]
    fn test_from_git_ref() {
        let event = TriggerEvent::from_git_ref("refs/heads/main");
        assert_eq!(event.ref_name, "main");
        assert_eq!(event.ref_kind, RefKind::Branch);

        let event = TriggerEvent::from_git_ref("refs/tags/v2.1.0");
        assert_eq!(event.ref_name, "v2.1.0");
        assert_eq!(event.ref_kind, RefKind::Tag);

        let event = TriggerEvent::from_git_ref("develop");
        assert_eq!(event.ref_name, "develop");
    }
}
