//! Output line classification.
//!
//! Two ordered pattern sets, fatal and recoverable, compiled from
//! configuration as case-insensitive regular expressions and searched
//! anywhere in the line. Fatal patterns win when both match.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use stagehand_core::config::HealthConfig;
use stagehand_core::{Result, StagehandError};
use std::fmt;

/// Result of classifying one output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineClass {
    /// Unrecoverable failure, restart immediately
    Fatal,
    /// Transient failure, counts toward the threshold
    Recoverable,
    /// Nothing of interest
    Normal,
}

impl fmt::Display for LineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::Recoverable => write!(f, "recoverable"),
            Self::Normal => write!(f, "normal"),
        }
    }
}

/// Compiled error signatures.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    fatal: Vec<Regex>,
    recoverable: Vec<Regex>,
}

impl ErrorClassifier {
    /// Compile both pattern sets.
    pub fn new(recoverable: &[String], fatal: &[String]) -> Result<Self> {
        Ok(Self {
            fatal: compile("fatal", fatal)?,
            recoverable: compile("recoverable", recoverable)?,
        })
    }

    /// Compile the pattern sets of a health configuration.
    pub fn from_config(config: &HealthConfig) -> Result<Self> {
        Self::new(&config.recoverable_patterns, &config.fatal_patterns)
    }

    /// True if any fatal pattern matches.
    pub fn is_fatal(&self, line: &str) -> bool {
        self.fatal.iter().any(|re| re.is_match(line))
    }

    /// True if any recoverable pattern matches.
    pub fn is_recoverable(&self, line: &str) -> bool {
        self.recoverable.iter().any(|re| re.is_match(line))
    }

    /// Classify a line, fatal first.
    pub fn classify(&self, line: &str) -> LineClass {
        if self.is_fatal(line) {
            LineClass::Fatal
        } else if self.is_recoverable(line) {
            LineClass::Recoverable
        } else {
            LineClass::Normal
        }
    }
}

fn compile(set: &'static str, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| StagehandError::InvalidPattern {
                    set,
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })
        })
        .collect()
}
