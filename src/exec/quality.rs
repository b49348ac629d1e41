// src/exec/quality.rs

//! Quality-gate output analysis: failure categories and metrics.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use tracing::warn;

use crate::exec::stages::StageResult;
use crate::report::QualityMetrics;
use crate::types::FailureCategory;

const BUILTIN_RULES: &[(FailureCategory, &str)] = &[
    (
        FailureCategory::TypeCheck,
        r"(?i)(type ?error|type-check|typecheck|mismatched types|error\[E\d{4}\]|\bmypy\b|\btsc\b|incompatible types?)",
    ),
    (
        FailureCategory::Coverage,
        r"(?i)(coverage .*(below|under|less than|fail)|insufficient coverage|coverage threshold)",
    ),
    (
        FailureCategory::Format,
        r"(?i)(rustfmt|cargo fmt|\bprettier\b|\bblack\b|would reformat|not formatted|formatting)",
    ),
    (
        FailureCategory::Lint,
        r"(?i)(\blint\b|clippy|eslint|flake8|pylint|ruff|^warning:|^\s*warning\[)",
    ),
];

/// Maps quality output lines to [`FailureCategory`]s.
///
/// Configured rules from `[stages.categories]` are tried before the built-in
/// ones. Output matching no rule is categorized as `Other`.
#[derive(Debug, Clone)]
pub struct QualityClassifier {
    rules: Vec<(FailureCategory, Regex)>,
}

impl Default for QualityClassifier {
    fn default() -> Self {
        Self {
            rules: compile_rules(
                BUILTIN_RULES
                    .iter()
                    .map(|(category, pattern)| (*category, (*pattern).to_string())),
            ),
        }
    }
}

impl QualityClassifier {
    /// Built-in rules with `extra` (category name → regex) tried first.
    /// Unknown category names and invalid patterns are logged and skipped.
    pub fn with_extra(extra: &BTreeMap<String, String>) -> Self {
        let configured = extra.iter().filter_map(|(name, pattern)| match name.parse() {
            Ok(category) => Some((category, pattern.clone())),
            Err(e) => {
                warn!(category = %name, error = %e, "ignoring quality rule");
                None
            }
        });

        let mut rules = compile_rules(configured);
        rules.extend(Self::default().rules);
        Self { rules }
    }

    /// Sorted, deduplicated categories for a failed quality run.
    ///
    /// Structured failures supplied by the runner win over output matching.
    pub fn categorize(&self, result: &StageResult) -> Vec<FailureCategory> {
        let mut found: BTreeSet<FailureCategory> =
            result.failures.iter().map(|f| f.category).collect();

        if found.is_empty() {
            for line in result.output.lines() {
                if let Some((category, _)) = self.rules.iter().find(|(_, re)| re.is_match(line)) {
                    found.insert(*category);
                }
            }
        }

        if found.is_empty() {
            found.insert(FailureCategory::Other);
        }
        found.into_iter().collect()
    }
}

fn compile_rules(
    rules: impl IntoIterator<Item = (FailureCategory, String)>,
) -> Vec<(FailureCategory, Regex)> {
    rules
        .into_iter()
        .filter_map(|(category, pattern)| match Regex::new(&pattern) {
            Ok(re) => Some((category, re)),
            Err(e) => {
                warn!(%category, pattern = %pattern, error = %e, "invalid quality regex; ignoring");
                None
            }
        })
        .collect()
}

/// Parses coverage, lint score and type error counts out of tool output.
#[derive(Debug, Clone)]
pub struct MetricsParser {
    coverage: Option<Regex>,
    lint_score: Option<Regex>,
    type_errors: Option<Regex>,
}

impl Default for MetricsParser {
    fn default() -> Self {
        Self {
            coverage: compile(r"(?i)coverage[^0-9\n]*?(\d+(?:\.\d+)?)\s*%"),
            lint_score: compile(r"(?i)(?:lint score|rated at)\s*:?\s*(-?\d+(?:\.\d+)?)"),
            type_errors: compile(
                r"(?i)(?:found\s+)?(\d+)\s+(?:type[- ]?check\s+|type\s+)?errors?\b",
            ),
        }
    }
}

impl MetricsParser {
    /// Metrics found in `output`. The last match of each wins, since tools
    /// usually print their totals at the end.
    pub fn parse(&self, output: &str) -> QualityMetrics {
        QualityMetrics {
            coverage_percent: last_capture(self.coverage.as_ref(), output)
                .and_then(|s| s.parse().ok()),
            lint_score: last_capture(self.lint_score.as_ref(), output).and_then(|s| s.parse().ok()),
            type_errors: last_capture(self.type_errors.as_ref(), output)
                .and_then(|s| s.parse().ok()),
        }
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "invalid metrics regex; ignoring");
            None
        }
    }
}

fn last_capture<'a>(re: Option<&Regex>, text: &'a str) -> Option<&'a str> {
    re?.captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}
