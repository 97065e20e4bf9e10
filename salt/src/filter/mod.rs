//! # Filter Engine
//!
//! Decides which correlated events are shown (and, when recording, kept).
//! Two rule shapes exist:
//!
//! - **Simple**: a process set and a cache set combined with OR (either set
//!   matches) or AND (both match).
//! - **Expression**: a compiled `cache-group AND process-group` rule, see
//!   [`expression`].
//!
//! Filtering is off by default; a disabled engine accepts everything.
//! Events without a cache (zero-size kmalloc) can only pass when filtering is
//! off or through the process half of a Simple OR rule.

pub mod expression;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::domain::{FilterError, FilterTarget};
pub use expression::{compile_expression, tokenize, CompiledExpression};

/// How the two Simple sets combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Relation {
    #[default]
    Or,
    And,
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Relation::Or => f.write_str("OR"),
            Relation::And => f.write_str("AND"),
        }
    }
}

impl FromStr for Relation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "or" => Ok(Relation::Or),
            "and" => Ok(Relation::And),
            _ => Err("Invalid option. Valid arguments are: OR, AND.".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterRule {
    Simple { processes: BTreeSet<String>, caches: BTreeSet<String>, relation: Relation },
    Expression(CompiledExpression),
}

impl Default for FilterRule {
    fn default() -> Self {
        FilterRule::Simple {
            processes: BTreeSet::new(),
            caches: BTreeSet::new(),
            relation: Relation::Or,
        }
    }
}

impl FilterRule {
    #[must_use]
    pub fn matches(&self, process: &str, cache: Option<&str>) -> bool {
        match self {
            FilterRule::Simple { processes, caches, relation } => {
                simple_matches(processes, caches, *relation, process, cache)
            }
            FilterRule::Expression(expr) => expr.matches(process, cache),
        }
    }
}

/// A cache-less event can only pass through the process half of an OR
fn simple_matches(
    processes: &BTreeSet<String>,
    caches: &BTreeSet<String>,
    relation: Relation,
    process: &str,
    cache: Option<&str>,
) -> bool {
    let by_process = processes.contains(process);
    let by_cache = cache.is_some_and(|c| caches.contains(c));
    match relation {
        Relation::Or => by_process || by_cache,
        Relation::And => by_process && by_cache,
    }
}

/// Filter state; the Simple sets are kept while an expression is active so
/// `current_filter` always reflects exactly one rule
#[derive(Debug, Clone, Default)]
pub struct FilterEngine {
    enabled: bool,
    processes: BTreeSet<String>,
    caches: BTreeSet<String>,
    relation: Relation,
    expression: Option<CompiledExpression>,
}

impl FilterEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn current_filter(&self) -> FilterRule {
        match &self.expression {
            Some(expr) => FilterRule::Expression(expr.clone()),
            None => FilterRule::Simple {
                processes: self.processes.clone(),
                caches: self.caches.clone(),
                relation: self.relation,
            },
        }
    }

    /// Replace the rule; the enabled switch is left as is
    pub fn set_filter(&mut self, rule: FilterRule) {
        match rule {
            FilterRule::Simple { processes, caches, relation } => {
                self.processes = processes;
                self.caches = caches;
                self.relation = relation;
                self.expression = None;
            }
            FilterRule::Expression(expr) => self.expression = Some(expr),
        }
    }

    pub fn set_simple(
        &mut self,
        processes: impl IntoIterator<Item = String>,
        caches: impl IntoIterator<Item = String>,
        relation: Relation,
    ) {
        self.set_filter(FilterRule::Simple {
            processes: processes.into_iter().collect(),
            caches: caches.into_iter().collect(),
            relation,
        });
    }

    /// Compile `tokens` and install the result; the old rule survives errors
    ///
    /// # Errors
    /// `MalformedExpression`
    pub fn set_expression<S: AsRef<str>>(&mut self, tokens: &[S]) -> Result<(), FilterError> {
        let compiled = compile_expression(tokens)?;
        self.expression = Some(compiled);
        Ok(())
    }

    /// Switch back to the Simple sets when an expression is active
    fn use_simple(&mut self) {
        if let Some(expr) = self.expression.take() {
            log::info!("dropping filter expression {expr} for simple filter sets");
        }
    }

    fn set_for(&mut self, target: FilterTarget) -> &mut BTreeSet<String> {
        match target {
            FilterTarget::Process => &mut self.processes,
            FilterTarget::Cache => &mut self.caches,
        }
    }

    pub fn add(&mut self, target: FilterTarget, names: &[String]) {
        self.use_simple();
        self.set_for(target).extend(names.iter().cloned());
    }

    /// Remove every name or none of them
    ///
    /// # Errors
    /// `UnknownFilterTarget` for the first name not in the set
    pub fn remove(&mut self, target: FilterTarget, names: &[String]) -> Result<(), FilterError> {
        let set = self.set_for(target);
        if let Some(name) = names.iter().find(|n| !set.contains(*n)) {
            return Err(FilterError::UnknownFilterTarget { target, name: name.clone() });
        }
        for name in names {
            set.remove(name);
        }
        self.use_simple();
        Ok(())
    }

    pub fn add_process(&mut self, name: &str) {
        self.add(FilterTarget::Process, &[name.to_string()]);
    }

    pub fn add_cache(&mut self, name: &str) {
        self.add(FilterTarget::Cache, &[name.to_string()]);
    }

    /// # Errors
    /// `UnknownFilterTarget`
    pub fn remove_process(&mut self, name: &str) -> Result<(), FilterError> {
        self.remove(FilterTarget::Process, &[name.to_string()])
    }

    /// # Errors
    /// `UnknownFilterTarget`
    pub fn remove_cache(&mut self, name: &str) -> Result<(), FilterError> {
        self.remove(FilterTarget::Cache, &[name.to_string()])
    }

    pub fn set_relation(&mut self, relation: Relation) {
        self.use_simple();
        self.relation = relation;
    }

    /// Empty sets, OR relation, no expression; the enabled switch is kept
    pub fn reset(&mut self) {
        self.set_filter(FilterRule::default());
    }

    /// Accept or reject an event
    #[must_use]
    pub fn evaluate(&self, process: &str, cache: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        match &self.expression {
            Some(expr) => expr.matches(process, cache),
            None => simple_matches(&self.processes, &self.caches, self.relation, process, cache),
        }
    }

    /// The `filter status` report
    #[must_use]
    pub fn status_lines(&self) -> Vec<String> {
        if !self.enabled {
            return vec!["Filtering is off.".to_string()];
        }
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(", ");
        let mut lines = vec!["Filtering is on.".to_string()];
        match self.current_filter() {
            FilterRule::Simple { processes, caches, relation } => {
                lines.push(format!(
                    "Tracing information will be displayed for the following processes: {}",
                    join(&processes)
                ));
                lines.push(format!(
                    "Tracing information will be displayed for the following caches: {}",
                    join(&caches)
                ));
                lines.push(format!("Subfilter relation is set to {relation}."));
            }
            FilterRule::Expression(expr) => {
                lines.push(format!("Filter expression: {expr}"));
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_disabled_accepts_everything() {
        let mut engine = FilterEngine::new();
        engine.set_simple(names(&["a"]), names(&["b"]), Relation::And);
        assert!(engine.evaluate("x", None));
    }

    #[test]
    fn test_cacheless_event_only_passes_simple_or() {
        let mut engine = FilterEngine::new();
        engine.enable();
        engine.set_simple(names(&["a"]), names(&["b"]), Relation::Or);
        assert!(engine.evaluate("a", None));
        engine.set_relation(Relation::And);
        assert!(!engine.evaluate("a", None));
        engine.set_expression(&["b", "and", "a"]).unwrap();
        assert!(!engine.evaluate("a", None));
    }

    #[test]
    fn test_rule_matches_agrees_with_engine() {
        let mut engine = FilterEngine::new();
        engine.enable();
        engine.set_simple(names(&["bash"]), names(&["dentry"]), Relation::And);
        let cases = [("bash", Some("dentry")), ("bash", None), ("cron", Some("dentry"))];
        for relation in [Relation::And, Relation::Or] {
            engine.set_relation(relation);
            let rule = engine.current_filter();
            for (process, cache) in cases {
                assert_eq!(rule.matches(process, cache), engine.evaluate(process, cache));
            }
        }
        engine.set_expression(&["dentry", "and", "bash"]).unwrap();
        let rule = engine.current_filter();
        for (process, cache) in cases {
            assert_eq!(rule.matches(process, cache), engine.evaluate(process, cache));
        }
    }

    #[test]
    fn test_remove_is_all_or_nothing() {
        let mut engine = FilterEngine::new();
        engine.add(FilterTarget::Process, &names(&["bash", "sshd"]));
        let err = engine.remove(FilterTarget::Process, &names(&["bash", "cron"])).unwrap_err();
        assert_eq!(
            err,
            FilterError::UnknownFilterTarget { target: FilterTarget::Process, name: "cron".into() }
        );
        let FilterRule::Simple { processes, .. } = engine.current_filter() else {
            panic!("expected simple rule");
        };
        assert_eq!(processes.len(), 2);
        engine.remove(FilterTarget::Process, &names(&["bash", "sshd"])).unwrap();
    }

    #[test]
    fn test_malformed_expression_keeps_rule() {
        let mut engine = FilterEngine::new();
        engine.add_cache("dentry");
        let before = engine.current_filter();
        assert!(engine.set_expression(&["dentry", "or", "bash"]).is_err());
        assert_eq!(engine.current_filter(), before);
    }

    #[test]
    fn test_add_replaces_expression() {
        let mut engine = FilterEngine::new();
        engine.set_expression(&["c", "and", "p"]).unwrap();
        engine.add_process("bash");
        assert!(matches!(engine.current_filter(), FilterRule::Simple { .. }));
    }

    #[test]
    fn test_status_lines() {
        let mut engine = FilterEngine::new();
        assert_eq!(engine.status_lines(), vec!["Filtering is off."]);
        engine.enable();
        engine.add_process("bash");
        engine.set_relation(Relation::And);
        let lines = engine.status_lines();
        assert_eq!(lines[1], "Tracing information will be displayed for the following processes: bash");
        assert_eq!(lines[3], "Subfilter relation is set to AND.");
    }

    #[test]
    fn test_relation_parse() {
        assert_eq!("AND".parse::<Relation>().unwrap(), Relation::And);
        assert!("xor".parse::<Relation>().is_err());
    }
}
