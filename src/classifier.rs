//! First-match-wins classification of log lines.

use chrono::TimeDelta;
use regex::Regex;

use crate::config::{ConfigError, PatternConfig};

/// A compiled pattern with its optional cooldown override.
#[derive(Debug, Clone)]
pub struct PatternRule {
    regex: Regex,
    cooldown: Option<TimeDelta>,
}

impl PatternRule {
    /// Compile a rule from its source text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Pattern`] if the expression does not compile.
    pub fn new(pattern: &str, cooldown: Option<TimeDelta>) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|source| ConfigError::Pattern {
            pattern: pattern.to_owned(),
            source,
        })?;
        Ok(Self { regex, cooldown })
    }

    /// Pattern source text, also the key for alert bookkeeping.
    pub fn key(&self) -> &str {
        self.regex.as_str()
    }

    /// Per-pattern cooldown, if configured.
    pub fn cooldown(&self) -> Option<TimeDelta> {
        self.cooldown
    }

    /// Whether the pattern occurs anywhere in `line`.
    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }
}

/// Ordered set of rules; earlier rules take precedence.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    rules: Vec<PatternRule>,
}

impl Classifier {
    /// Build a classifier from rules in priority order.
    pub fn new(rules: Vec<PatternRule>) -> Self {
        Self { rules }
    }

    /// Compile every configured pattern, keeping configuration order.
    ///
    /// # Errors
    ///
    /// Returns the first compilation failure.
    pub fn from_config(patterns: &[PatternConfig]) -> Result<Self, ConfigError> {
        let rules = patterns
            .iter()
            .map(|p| PatternRule::new(p.pattern(), p.cooldown()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules))
    }

    /// Return the first rule matching `line`, or `None`.
    pub fn classify(&self, line: &str) -> Option<&PatternRule> {
        self.rules.iter().find(|rule| rule.is_match(line))
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }
}
