//! Experiment records and the on-disk formats they are built from.
//!
//! An experiment directory may contain:
//!
//! - `progress`: a fraction (`0.73`), a percentage (`73%`) or a sentinel
//!   (`done`, `complete`, `finished`).
//! - `scalars/<series>.<ext>`: one point per line, `name,value` or
//!   `value[,extra...]` (the series is then named after the file stem).
//! - `log.txt` or `ailab.log`: JSON lines with progress events
//!   (`{"progress": 0.5, "eta": 120}`) and value events
//!   (`{"name": "loss", "value": 0.1, "primary": true}`).
//! - `images/`: image artifacts.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// File names that mark a directory as an experiment.
pub const PROGRESS_FILE: &str = "progress";
pub const SCALARS_DIR: &str = "scalars";
pub const IMAGES_DIR: &str = "images";
pub const EVENT_LOGS: [&str; 2] = ["log.txt", "ailab.log"];

/// Latest value of one scalar series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    pub value: f64,
    /// Number of points seen so far.
    pub points: u64,
}

/// Derived state of one experiment directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub project: String,
    /// Path relative to the project's experiment tree.
    pub name: String,
    pub path: PathBuf,
    pub last_modified: Option<DateTime<Local>>,
    /// Fraction in `[0, 1]`.
    pub progress: Option<f64>,
    pub eta_secs: Option<u64>,
    /// Name of the primary series.
    pub primary: Option<String>,
    pub scalars: BTreeMap<String, Scalar>,
    pub images: Vec<String>,
    pub stale: bool,
}

impl ExperimentRecord {
    #[must_use]
    pub fn new(project: impl Into<String>, name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
            path,
            last_modified: None,
            progress: None,
            eta_secs: None,
            primary: None,
            scalars: BTreeMap::new(),
            images: Vec::new(),
            stale: false,
        }
    }

    /// `project/name`, unique across projects.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.project, self.name)
    }

    pub fn push_scalar(&mut self, name: &str, value: f64) {
        let scalar = self.scalars.entry(name.to_string()).or_insert(Scalar {
            value,
            points: 0,
        });
        scalar.value = value;
        scalar.points += 1;
    }

    /// Latest value of the primary series.
    #[must_use]
    pub fn primary_value(&self) -> Option<f64> {
        let name = self.primary.as_ref()?;
        self.scalars.get(name).map(|s| s.value)
    }

    /// Series other than the primary one.
    pub fn secondary(&self) -> impl Iterator<Item = (&String, &Scalar)> {
        self.scalars
            .iter()
            .filter(|(name, _)| self.primary.as_ref() != Some(*name))
    }
}

/// Whether `dir` holds any experiment marker.
#[must_use]
pub fn is_experiment_dir(dir: &Path) -> bool {
    dir.join(PROGRESS_FILE).is_file()
        || dir.join(SCALARS_DIR).is_dir()
        || EVENT_LOGS.iter().any(|f| dir.join(f).is_file())
}

/// Parse the body of a `progress` file.
#[must_use]
pub fn parse_progress(body: &str) -> Option<f64> {
    let body = body.trim();
    if ["done", "complete", "finished"]
        .iter()
        .any(|s| body.eq_ignore_ascii_case(s))
    {
        return Some(1.0);
    }

    let (number, scale) = match body.strip_suffix('%') {
        Some(percent) => (percent.trim(), 100.0),
        None => (body, 1.0),
    };
    // A number still being written, like `0.`, is not a value yet.
    if number.ends_with('.') {
        return None;
    }
    let value = number.parse::<f64>().ok()? / scale;
    value.is_finite().then(|| value.clamp(0.0, 1.0))
}

/// Parse one scalar line into `(series, value)`.
#[must_use]
pub fn parse_scalar_line(line: &str, stem: &str) -> Option<(String, f64)> {
    let mut fields = line.split(',').map(str::trim);
    let first = fields.next()?;

    let (name, value) = match first.parse::<f64>() {
        Ok(value) => (stem, value),
        Err(_) => (first, fields.next()?.parse::<f64>().ok()?),
    };
    (!name.is_empty() && value.is_finite()).then(|| (name.to_string(), value))
}

/// One line of an event log.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LogEvent {
    Value {
        name: String,
        value: serde_json::Value,
        #[serde(default)]
        primary: bool,
    },
    Progress {
        progress: f64,
        #[serde(default)]
        eta: Option<f64>,
    },
}

impl LogEvent {
    /// Apply this event to `record`. Non-numeric values are ignored.
    pub fn apply(&self, record: &mut ExperimentRecord) {
        match self {
            Self::Value {
                name,
                value,
                primary,
            } => {
                let Some(value) = value.as_f64().filter(|v| v.is_finite()) else {
                    tracing::debug!(%name, "ignoring non-numeric value");
                    return;
                };
                record.push_scalar(name, value);
                if *primary {
                    record.primary = Some(name.clone());
                }
            }
            Self::Progress { progress, eta } => {
                if progress.is_finite() {
                    record.progress = Some(progress.clamp(0.0, 1.0));
                }
                record.eta_secs = eta
                    .filter(|e| e.is_finite() && *e >= 0.0)
                    .map(|e| e.round() as u64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("0.73", Some(0.73) ; "fraction")]
    #[test_case("73%", Some(0.73) ; "percentage")]
    #[test_case(" 100 %\n", Some(1.0) ; "padded percentage")]
    #[test_case("DONE", Some(1.0) ; "sentinel")]
    #[test_case("finished\n", Some(1.0) ; "finished sentinel")]
    #[test_case("1.7", Some(1.0) ; "clamped")]
    #[test_case("", None ; "empty mid-write")]
    #[test_case("0.", None ; "truncated number")]
    #[test_case("45.%", None ; "truncated percentage")]
    #[test_case("abc", None ; "garbage")]
    #[test_case("NaN", None ; "not a number")]
    fn test_parse_progress(body: &str, expected: Option<f64>) {
        let parsed = parse_progress(body);
        match (parsed, expected) {
            (Some(a), Some(b)) => assert!((a - b).abs() < 1e-9, "{a} != {b}"),
            _ => assert_eq!(parsed, expected),
        }
    }

    #[test_case("loss,0.042", "x", Some(("loss", 0.042)) ; "named")]
    #[test_case("0.5", "loss", Some(("loss", 0.5)) ; "bare value")]
    #[test_case("0.5,120,extra", "acc", Some(("acc", 0.5)) ; "value with extras")]
    #[test_case("loss,", "x", None ; "missing value")]
    #[test_case("loss,abc", "x", None ; "bad value")]
    #[test_case("inf", "x", None ; "infinite")]
    fn test_parse_scalar_line(line: &str, stem: &str, expected: Option<(&str, f64)>) {
        assert_eq!(
            parse_scalar_line(line, stem),
            expected.map(|(n, v)| (n.to_string(), v))
        );
    }

    #[test]
    fn test_log_events() {
        let mut record = ExperimentRecord::new("p", "e", PathBuf::from("/tmp/e"));
        let lines = [
            r#"{"timestamp": "2019-01-01 10:00:00", "eta": 120, "progress": 0.25}"#,
            r#"{"timestamp": "2019-01-01 10:00:00", "name": "loss", "value": 0.9, "primary": true}"#,
            r#"{"timestamp": "2019-01-01 10:00:01", "name": "loss", "value": 0.7, "primary": true}"#,
            r#"{"timestamp": "2019-01-01 10:00:01", "name": "note", "value": "hello"}"#,
            r#"{"timestamp": "2019-01-01 10:00:01", "name": "acc", "value": 0.6}"#,
        ];
        for line in lines {
            serde_json::from_str::<LogEvent>(line)
                .unwrap()
                .apply(&mut record);
        }

        assert_eq!(record.progress, Some(0.25));
        assert_eq!(record.eta_secs, Some(120));
        assert_eq!(record.primary.as_deref(), Some("loss"));
        assert_eq!(record.primary_value(), Some(0.7));
        assert_eq!(record.scalars["loss"].points, 2);
        assert!(!record.scalars.contains_key("note"));
        let secondary: Vec<&String> = record.secondary().map(|(n, _)| n).collect();
        assert_eq!(secondary, vec!["acc"]);
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        assert!(serde_json::from_str::<LogEvent>(r#"{"goal": "x"}"#).is_err());
    }
}
