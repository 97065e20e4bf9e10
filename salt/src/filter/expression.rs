//! Filter expression compiler
//!
//! The grammar is deliberately two-level and nothing more:
//!
//! ```text
//! expression := cache-group AND process-group
//! group      := name (OR name)*
//! ```
//!
//! Parentheses, quotes and commas are accepted and ignored, so
//! `("kmalloc-64" or dentry) and (bash)` and `kmalloc-64 | dentry && bash`
//! compile to the same rule. There is no nesting and no NOT.

use std::collections::BTreeSet;
use std::fmt;

use crate::domain::FilterError;

const AND_TOKENS: [&str; 3] = ["and", "&&", "&"];
const OR_TOKENS: [&str; 3] = ["or", "||", "|"];
const PUNCTUATION: [char; 5] = ['(', ')', '"', '\'', ','];

/// `(cache ∈ caches) AND (process ∈ processes)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledExpression {
    pub caches: BTreeSet<String>,
    pub processes: BTreeSet<String>,
}

impl CompiledExpression {
    /// Events without a cache never match
    #[must_use]
    pub fn matches(&self, process: &str, cache: Option<&str>) -> bool {
        cache.is_some_and(|c| self.caches.contains(c)) && self.processes.contains(process)
    }
}

impl fmt::Display for CompiledExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(" OR ");
        write!(f, "({}) AND ({})", join(&self.caches), join(&self.processes))
    }
}

/// Split raw command text into expression tokens; parentheses and commas
/// become tokens of their own
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_whitespace() || matches!(ch, '(' | ')' | ',') {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            if !ch.is_whitespace() {
                tokens.push(ch.to_string());
            }
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn is_and(token: &str) -> bool {
    AND_TOKENS.iter().any(|t| t.eq_ignore_ascii_case(token))
}

fn is_or(token: &str) -> bool {
    OR_TOKENS.iter().any(|t| t.eq_ignore_ascii_case(token))
}

fn strip(token: &str) -> &str {
    token.trim_matches(|c| PUNCTUATION.contains(&c))
}

fn group<S: AsRef<str>>(tokens: &[S], what: &str) -> Result<BTreeSet<String>, FilterError> {
    let names: BTreeSet<String> = tokens
        .iter()
        .map(AsRef::as_ref)
        .filter(|t| !is_or(t))
        .map(strip)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        Err(FilterError::MalformedExpression(format!("empty {what} group")))
    } else {
        Ok(names)
    }
}

/// Compile tokens into a cache-group AND process-group rule
///
/// # Errors
/// `MalformedExpression` when there is no AND, more than one AND, or either
/// side names nothing
pub fn compile_expression<S: AsRef<str>>(tokens: &[S]) -> Result<CompiledExpression, FilterError> {
    let mut ands = tokens.iter().enumerate().filter(|(_, t)| is_and(t.as_ref())).map(|(i, _)| i);
    let split = ands
        .next()
        .ok_or_else(|| FilterError::MalformedExpression("no AND found".into()))?;
    if ands.next().is_some() {
        return Err(FilterError::MalformedExpression(
            "only one AND is supported (cache group AND process group)".into(),
        ));
    }
    Ok(CompiledExpression {
        caches: group(&tokens[..split], "cache")?,
        processes: group(&tokens[split + 1..], "process")?,
    })
}
