//! Command matching for conditioned plugins.
//!
//! Literal triggers are checked first against the first token of the text
//! (after a prefix character when a prefix set applies). Exact equality wins
//! over the startswith fallback. Pattern triggers run only when no literal
//! matched, against the full original text, first declared pattern wins.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use tether_core::context::MatchResult;

use crate::error::PluginError;

/// One declared trigger.
#[derive(Clone, Debug)]
pub enum Trigger {
    Literal(String),
    Pattern(Regex),
}

impl Trigger {
    /// Compile a pattern with JS-style flags (`i`, `m`, `s`, `x`; others ignored).
    pub fn pattern(source: &str, flags: &str) -> Result<Self, PluginError> {
        let mut builder = RegexBuilder::new(source);
        for flag in flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                'x' => {
                    builder.ignore_whitespace(true);
                }
                _ => {}
            }
        }
        builder
            .build()
            .map(Self::Pattern)
            .map_err(|e| PluginError::Pattern {
                pattern: source.to_string(),
                reason: e.to_string(),
            })
    }

    /// Parse a string trigger: `/source/flags` is a pattern, anything else a literal.
    pub fn parse(raw: &str) -> Result<Self, PluginError> {
        if let Some(body) = raw.strip_prefix('/') {
            if let Some((source, flags)) = body.rsplit_once('/') {
                if !source.is_empty() && flags.chars().all(|c| c.is_ascii_alphabetic()) {
                    return Self::pattern(source, flags);
                }
            }
        }
        Ok(Self::Literal(raw.to_string()))
    }
}

/// Which prefix characters a literal command requires.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PrefixPolicy {
    /// Use the configured default prefix set.
    #[default]
    Default,
    /// No prefix; the first token of the text is the command.
    None,
    Explicit(Vec<char>),
}

impl PrefixPolicy {
    fn resolve(&self, defaults: &[char]) -> Option<Vec<char>> {
        let set = match self {
            Self::Default => defaults.to_vec(),
            Self::None => return None,
            Self::Explicit(chars) => chars.clone(),
        };
        (!set.is_empty()).then_some(set)
    }
}

/// Compiled, immutable matcher.
#[derive(Clone, Debug)]
pub struct Matcher {
    exact: HashSet<String>,
    literals: Vec<String>,
    lowered: Vec<String>,
    patterns: Vec<Regex>,
    prefixes: Option<Vec<char>>,
}

impl Matcher {
    /// `None` when there are no (non-empty) triggers: such plugins are unconditional.
    pub fn compile(
        triggers: Vec<Trigger>,
        policy: &PrefixPolicy,
        default_prefixes: &[char],
    ) -> Option<Self> {
        let mut literals = Vec::new();
        let mut patterns = Vec::new();
        for trigger in triggers {
            match trigger {
                Trigger::Literal(s) if s.is_empty() => {}
                Trigger::Literal(s) => literals.push(s),
                Trigger::Pattern(re) => patterns.push(re),
            }
        }
        if literals.is_empty() && patterns.is_empty() {
            return None;
        }
        let lowered: Vec<String> = literals.iter().map(|l| l.to_lowercase()).collect();
        Some(Self {
            exact: lowered.iter().cloned().collect(),
            literals,
            lowered,
            patterns,
            prefixes: policy.resolve(default_prefixes),
        })
    }

    pub fn literals(&self) -> &[String] {
        &self.literals
    }

    pub fn patterns(&self) -> &[Regex] {
        &self.patterns
    }

    pub fn prefixes(&self) -> Option<&[char]> {
        self.prefixes.as_deref()
    }

    pub fn matches(&self, text: &str) -> Option<MatchResult> {
        self.match_literal(text)
            .or_else(|| self.match_pattern(text))
    }

    fn match_literal(&self, text: &str) -> Option<MatchResult> {
        if self.exact.is_empty() {
            return None;
        }
        let lower = text.to_lowercase();
        let (rest, prefix) = match &self.prefixes {
            Some(set) => {
                let first = lower.chars().next()?;
                if !set.contains(&first) {
                    return None;
                }
                (&lower[first.len_utf8()..], Some(first))
            }
            None => (lower.as_str(), None),
        };
        let token = rest.split(char::is_whitespace).next().unwrap_or_default();
        if token.is_empty() {
            return None;
        }

        if self.exact.contains(token) {
            let idx = self.lowered.iter().position(|l| l == token)?;
            return Some(MatchResult::literal(self.literals[idx].clone(), prefix));
        }
        self.lowered
            .iter()
            .position(|l| token.len() > l.len() && token.starts_with(l.as_str()))
            .map(|idx| MatchResult::literal(self.literals[idx].clone(), prefix))
    }

    fn match_pattern(&self, text: &str) -> Option<MatchResult> {
        self.patterns.iter().find_map(|re| {
            re.captures(text).map(|caps| {
                MatchResult::pattern(
                    caps.iter()
                        .map(|m| m.map(|m| m.as_str().to_string()))
                        .collect(),
                )
            })
        })
    }
}
