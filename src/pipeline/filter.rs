//! Filter predicates for forwarding rules.
//!
//! A rule's `filters` is a JSON object whose keys are predicates over the
//! message. All present keys must hold. `{}` (or `null`) matches every
//! message, which is how catch-all "general log" rules are written.
//!
//! Supported keys:
//! - `contains`: case-sensitive substring of `body`
//! - `equals`: exact `body`
//! - `from_number_prefix`: prefix of `from_number`
//! - `regex`: regex over `body`
//!
//! Unknown keys are skipped with a warning so rules authored against a newer
//! key set keep working.

use regex::Regex;
use tracing::warn;

use crate::pipeline::types::IncomingMessage;

/// Decides whether a message satisfies a rule's filters.
///
/// `compile` runs once per rule when a routing snapshot is built; `matches`
/// runs per message and must not perform I/O.
pub trait FilterEvaluator: Send + Sync {
    type Compiled: Send + Sync;

    fn compile(&self, filters: &serde_json::Value) -> Self::Compiled;

    fn matches(&self, compiled: &Self::Compiled, message: &IncomingMessage) -> bool;
}

/// The built-in predicate set.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardFilter;

impl FilterEvaluator for StandardFilter {
    type Compiled = CompiledFilter;

    fn compile(&self, filters: &serde_json::Value) -> CompiledFilter {
        CompiledFilter::compile(filters)
    }

    fn matches(&self, compiled: &CompiledFilter, message: &IncomingMessage) -> bool {
        compiled.matches(message)
    }
}

#[derive(Debug, Clone)]
enum Predicate {
    Contains(String),
    Equals(String),
    FromNumberPrefix(String),
    Regex(Regex),
    /// Malformed predicate; the rule can never match.
    Never,
}

/// A rule's filters with every regex compiled up front.
#[derive(Debug, Clone, Default)]
pub struct CompiledFilter {
    predicates: Vec<Predicate>,
}

impl CompiledFilter {
    pub fn compile(filters: &serde_json::Value) -> Self {
        let map = match filters {
            serde_json::Value::Null => return Self::default(),
            serde_json::Value::Object(map) => map,
            other => {
                warn!(filters = %other, "Filter is not an object; treating as no match");
                return Self {
                    predicates: vec![Predicate::Never],
                };
            }
        };

        let mut predicates = Vec::with_capacity(map.len());
        for (key, value) in map {
            let predicate = match key.as_str() {
                "contains" => with_str(key, value, |s| Predicate::Contains(s.to_string())),
                "equals" => with_str(key, value, |s| Predicate::Equals(s.to_string())),
                "from_number_prefix" => {
                    with_str(key, value, |s| Predicate::FromNumberPrefix(s.to_string()))
                }
                "regex" => with_str(key, value, |pattern| match Regex::new(pattern) {
                    Ok(re) => Predicate::Regex(re),
                    Err(e) => {
                        warn!(pattern = pattern, error = %e, "Invalid filter regex");
                        Predicate::Never
                    }
                }),
                unknown => {
                    warn!(key = unknown, "Unknown filter key ignored");
                    continue;
                }
            };
            predicates.push(predicate);
        }
        Self { predicates }
    }

    /// True when every predicate holds. No predicates matches everything.
    pub fn matches(&self, message: &IncomingMessage) -> bool {
        self.predicates.iter().all(|predicate| match predicate {
            Predicate::Contains(needle) => message.body.contains(needle.as_str()),
            Predicate::Equals(expected) => message.body == *expected,
            Predicate::FromNumberPrefix(prefix) => message.from_number.starts_with(prefix.as_str()),
            Predicate::Regex(re) => re.is_match(&message.body),
            Predicate::Never => false,
        })
    }
}

/// Build a predicate from a string value; malformed values never match.
fn with_str(
    key: &str,
    value: &serde_json::Value,
    build: impl FnOnce(&str) -> Predicate,
) -> Predicate {
    match value.as_str() {
        Some(s) => build(s),
        None => {
            warn!(key = key, value = %value, "Filter value must be a string");
            Predicate::Never
        }
    }
}
