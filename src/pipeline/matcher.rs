//! Rule matcher: priority-ordered rule selection with stop-processing.

use tracing::debug;

use crate::pipeline::filter::{FilterEvaluator, StandardFilter};
use crate::pipeline::types::{ForwardRule, IncomingMessage};

/// Selects the rules that apply to a message.
///
/// Holds enabled rules pre-sorted by `(priority, id)`, each with its filters
/// compiled once. Evaluation is strictly sequential: a matching
/// `stop_processing` rule ends the scan, and the rules after it are never
/// handed to the evaluator.
pub struct RuleMatcher<F: FilterEvaluator = StandardFilter> {
    rules: Vec<ForwardRule>,
    compiled: Vec<F::Compiled>,
    evaluator: F,
}

impl RuleMatcher<StandardFilter> {
    pub fn new(rules: Vec<ForwardRule>) -> Self {
        Self::with_evaluator(rules, StandardFilter)
    }
}

impl<F: FilterEvaluator> RuleMatcher<F> {
    /// Build a matcher; disabled rules are dropped and the rest ordered.
    pub fn with_evaluator(rules: Vec<ForwardRule>, evaluator: F) -> Self {
        let mut rules: Vec<ForwardRule> = rules.into_iter().filter(|r| r.is_enabled).collect();
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        let compiled = rules.iter().map(|r| evaluator.compile(&r.filters)).collect();
        Self {
            rules,
            compiled,
            evaluator,
        }
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[ForwardRule] {
        &self.rules
    }

    /// Every matching rule, in priority order, up to the first matching
    /// `stop_processing` rule (inclusive).
    pub fn select_rules(&self, message: &IncomingMessage) -> Vec<ForwardRule> {
        let mut selected = Vec::new();
        for (rule, compiled) in self.rules.iter().zip(&self.compiled) {
            if !self.evaluator.matches(compiled, message) {
                continue;
            }
            debug!(message_id = %message.id, rule = %rule.name, "Rule matched");
            selected.push(rule.clone());
            if rule.stop_processing {
                debug!(message_id = %message.id, rule = %rule.name, "Stop-processing rule matched");
                break;
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::pipeline::filter::CompiledFilter;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use serde_json::json;

    fn message(body: &str) -> IncomingMessage {
        IncomingMessage {
            id: "m1".into(),
            endpoint_id: "sim-1".into(),
            from_number: "+989121234567".into(),
            to_number: "+989120001122".into(),
            body: body.into(),
            received_at: Utc::now(),
            raw_payload: json!({}),
            processed: false,
        }
    }

    fn rule(id: &str, priority: i64, filters: serde_json::Value, stop: bool) -> ForwardRule {
        ForwardRule {
            id: id.into(),
            name: format!("rule {id}"),
            is_enabled: true,
            priority,
            filters,
            stop_processing: stop,
        }
    }

    /// Records which rules' filters were evaluated.
    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    impl FilterEvaluator for &Recording {
        type Compiled = (String, CompiledFilter);

        fn compile(&self, filters: &serde_json::Value) -> Self::Compiled {
            let tag = filters["tag"].as_str().unwrap_or_default().to_string();
            (tag, CompiledFilter::compile(&json!({"contains": filters["contains"]})))
        }

        fn matches(&self, compiled: &Self::Compiled, message: &IncomingMessage) -> bool {
            self.seen.lock().unwrap().push(compiled.0.clone());
            compiled.1.matches(message)
        }
    }

    /// Counts compilations.
    struct Counting {
        compiled: AtomicUsize,
    }

    impl FilterEvaluator for &Counting {
        type Compiled = CompiledFilter;

        fn compile(&self, filters: &serde_json::Value) -> CompiledFilter {
            self.compiled.fetch_add(1, Ordering::SeqCst);
            CompiledFilter::compile(filters)
        }

        fn matches(&self, compiled: &CompiledFilter, message: &IncomingMessage) -> bool {
            compiled.matches(message)
        }
    }

    #[test]
    fn filters_compile_once_per_rule() {
        let counter = Counting {
            compiled: AtomicUsize::new(0),
        };
        let matcher = RuleMatcher::with_evaluator(
            vec![
                rule("r1", 1, json!({"regex": r"temp \d+C"}), false),
                rule("r2", 2, json!({}), false),
            ],
            &counter,
        );
        assert_eq!(counter.compiled.load(Ordering::SeqCst), 2);

        for body in ["ALERT: temp 46C", "temp 12C", "nominal"] {
            matcher.select_rules(&message(body));
        }
        assert_eq!(counter.compiled.load(Ordering::SeqCst), 2);
        assert_eq!(matcher.select_rules(&message("temp 46C")).len(), 2);
    }

    #[test]
    fn stop_processing_skips_lower_priority_evaluation() {
        let recorder = Recording {
            seen: Mutex::new(Vec::new()),
        };
        let matcher = RuleMatcher::with_evaluator(
            vec![
                rule("r2", 2, json!({"tag": "r2", "contains": "ALERT"}), false),
                rule("r1", 1, json!({"tag": "r1", "contains": "ALERT"}), true),
            ],
            &recorder,
        );

        let selected = matcher.select_rules(&message("ALERT: temp 46C"));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "r1");
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["r1".to_string()]);
    }

    #[test]
    fn non_matching_stop_rule_does_not_stop() {
        let matcher = RuleMatcher::new(vec![
            rule("r1", 1, json!({"contains": "FIRE"}), true),
            rule("r2", 2, json!({}), false),
        ]);
        let selected = matcher.select_rules(&message("ALERT"));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "r2");
    }

    #[test]
    fn accumulates_all_matches_in_priority_order() {
        let matcher = RuleMatcher::new(vec![
            rule("general", 100, json!({}), false),
            rule("alerts", 10, json!({"contains": "ALERT"}), false),
        ]);
        let ids: Vec<String> = matcher
            .select_rules(&message("ALERT: temp 46C"))
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["alerts", "general"]);
    }

    #[test]
    fn ties_broken_by_id() {
        let matcher = RuleMatcher::new(vec![
            rule("b", 5, json!({}), false),
            rule("a", 5, json!({}), false),
            rule("c", 5, json!({}), false),
        ]);
        let ids: Vec<&str> = matcher.rules().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut disabled = rule("r1", 1, json!({}), true);
        disabled.is_enabled = false;
        let matcher = RuleMatcher::new(vec![disabled, rule("r2", 2, json!({}), false)]);
        let selected = matcher.select_rules(&message("x"));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "r2");
    }

    #[test]
    fn no_rules_no_matches() {
        let matcher = RuleMatcher::new(vec![rule("r1", 1, json!({"contains": "ALERT"}), false)]);
        assert!(matcher.select_rules(&message("Status Report: nominal")).is_empty());
    }
}
