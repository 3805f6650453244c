//! Statistics extraction from embedding output
//!
//! The embedding engine prints one block of labelled values per model. Each
//! line is classified independently; the last label of a block closes the
//! current record.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};
use crate::invoker::TOOL_ERROR_MARKER;

/// Labelled fields of one statistics block, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatField {
    FinalError,
    NumUpperBoundViolations,
    NumLowerBoundViolations,
    MaxUpperBoundViolation,
    MaxLowerBoundViolation,
    RmsBoundDeviation,
    NumUpperRestraintViolations,
    NumLowerRestraintViolations,
    MaxUpperRestraintViolation,
    MaxLowerRestraintViolation,
    RmsRestraintDeviation,
}

impl StatField {
    pub const ALL: [StatField; 11] = [
        StatField::FinalError,
        StatField::NumUpperBoundViolations,
        StatField::NumLowerBoundViolations,
        StatField::MaxUpperBoundViolation,
        StatField::MaxLowerBoundViolation,
        StatField::RmsBoundDeviation,
        StatField::NumUpperRestraintViolations,
        StatField::NumLowerRestraintViolations,
        StatField::MaxUpperRestraintViolation,
        StatField::MaxLowerRestraintViolation,
        StatField::RmsRestraintDeviation,
    ];

    /// Label as printed by the engine.
    pub fn label(&self) -> &'static str {
        match self {
            StatField::FinalError => "Final Error Function Value",
            StatField::NumUpperBoundViolations => "Num Upper Bound Violations",
            StatField::NumLowerBoundViolations => "Num Lower Bound Violations",
            StatField::MaxUpperBoundViolation => "Max Upper Bound Violation",
            StatField::MaxLowerBoundViolation => "Max Lower Bound Violation",
            StatField::RmsBoundDeviation => "RMS Deviation from Bounds",
            StatField::NumUpperRestraintViolations => "Num Upper Restraint Violations",
            StatField::NumLowerRestraintViolations => "Num Lower Restraint Violations",
            StatField::MaxUpperRestraintViolation => "Max Upper Restraint Violation",
            StatField::MaxLowerRestraintViolation => "Max Lower Restraint Violation",
            StatField::RmsRestraintDeviation => "RMS Restraint Dist Violation",
        }
    }

    fn from_label(label: &str) -> Option<StatField> {
        Self::ALL.into_iter().find(|f| f.label() == label)
    }

    /// Whether this field ends a block.
    pub fn closes_record(&self) -> bool {
        matches!(self, StatField::RmsRestraintDeviation)
    }
}

/// Violation statistics of one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStatistics {
    /// 1-based model number.
    pub model: usize,
    pub final_error: f64,
    pub num_upper_bound_violations: u32,
    pub num_lower_bound_violations: u32,
    pub max_upper_bound_violation: f64,
    pub max_lower_bound_violation: f64,
    pub rms_bound_deviation: f64,
    pub num_upper_restraint_violations: u32,
    pub num_lower_restraint_violations: u32,
    pub max_upper_restraint_violation: f64,
    pub max_lower_restraint_violation: f64,
    pub rms_restraint_deviation: f64,
}

impl ModelStatistics {
    /// Upper plus lower bound violations, saturating at `u32::MAX`.
    pub fn bound_violations(&self) -> u32 {
        self.num_upper_bound_violations
            .saturating_add(self.num_lower_bound_violations)
    }

    fn set(&mut self, field: StatField, value: f64) {
        let count = value as u32;
        match field {
            StatField::FinalError => self.final_error = value,
            StatField::NumUpperBoundViolations => self.num_upper_bound_violations = count,
            StatField::NumLowerBoundViolations => self.num_lower_bound_violations = count,
            StatField::MaxUpperBoundViolation => self.max_upper_bound_violation = value,
            StatField::MaxLowerBoundViolation => self.max_lower_bound_violation = value,
            StatField::RmsBoundDeviation => self.rms_bound_deviation = value,
            StatField::NumUpperRestraintViolations => self.num_upper_restraint_violations = count,
            StatField::NumLowerRestraintViolations => self.num_lower_restraint_violations = count,
            StatField::MaxUpperRestraintViolation => self.max_upper_restraint_violation = value,
            StatField::MaxLowerRestraintViolation => self.max_lower_restraint_violation = value,
            StatField::RmsRestraintDeviation => self.rms_restraint_deviation = value,
        }
    }
}

fn stat_line_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        let labels = StatField::ALL
            .iter()
            .map(|f| regex::escape(f.label()))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = format!(r"^ ({}) :\s+([-+]?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)", labels);
        Regex::new(&pattern).ok()
    })
    .as_ref()
}

/// Classify one output line as a statistics field.
pub fn classify_line(line: &str) -> Option<(StatField, f64)> {
    let caps = stat_line_regex()?.captures(line)?;
    let field = StatField::from_label(caps.get(1)?.as_str())?;
    let value = caps.get(2)?.as_str().parse::<f64>().ok()?;
    Some((field, value))
}

/// Result of parsing one engine run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRun {
    pub statistics: Vec<ModelStatistics>,
    /// Whether the engine's fatal-error marker appeared.
    pub tool_error_seen: bool,
}

/// Parse `model_count` statistics blocks.
///
/// Blocks beyond `model_count` are ignored; fewer is an error.
pub fn parse_statistics<S: AsRef<str>>(lines: &[S], model_count: usize) -> ParseResult<ParsedRun> {
    let mut run = ParsedRun::default();
    let mut current = ModelStatistics::default();

    for line in lines.iter().map(AsRef::as_ref) {
        if line.starts_with(TOOL_ERROR_MARKER) {
            run.tool_error_seen = true;
            continue;
        }
        let Some((field, value)) = classify_line(line) else {
            continue;
        };
        if run.statistics.len() >= model_count {
            continue;
        }
        current.set(field, value);
        if field.closes_record() {
            current.model = run.statistics.len() + 1;
            run.statistics.push(std::mem::take(&mut current));
        }
    }

    if run.statistics.len() < model_count {
        return Err(ParseError::ShortOutput {
            expected: model_count,
            found: run.statistics.len(),
        });
    }
    Ok(run)
}

/// Last `^ <label> :  <number>` value in the output.
pub fn find_value<S: AsRef<str>>(lines: &[S], label: &str) -> ParseResult<f64> {
    let pattern = format!(r"^ {} :\s+([-+]?\d+(?:\.\d+)?)", regex::escape(label));
    let re = Regex::new(&pattern).map_err(|_| ParseError::MissingValue {
        label: label.to_string(),
    })?;
    lines
        .iter()
        .filter_map(|l| re.captures(l.as_ref()))
        .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
        .last()
        .ok_or_else(|| ParseError::MissingValue {
            label: label.to_string(),
        })
}
