//! Expression evaluator (C3 — spec.md §4.3).
//!
//! DESIGN NOTES §9 prescribes the dispatch mechanism directly: the source
//! resolves `Evaluable.Eval(key)` by reflection, which this crate replaces
//! with the capability trait `Evaluable::eval_string(key) -> (value, present)`
//! implemented by a small, enumerated switch on each concrete type (pods and
//! containers, defined in `crm-policy`, implement it there to avoid this
//! crate depending on the cache's data model).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Implemented by anything an [`Expression`] can be evaluated against. A
/// `/`-delimited `key` is resolved to its string value; `present` is `false`
/// when the key does not resolve to anything (a field absent, e.g. a label
/// that isn't set).
pub trait Evaluable {
    fn eval_string(&self, key: &str) -> (String, bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Equals,
    NotEqual,
    In,
    NotIn,
    Exists,
    NotExist,
    Matches,
    MatchesNot,
    MatchesAny,
    MatchesNone,
    AlwaysTrue,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("operator {op} requires exactly one value, got {got}")]
    WantsOne { op: Op, got: usize },
    #[error("operator {op} requires at least one value, got {got}")]
    WantsAtLeastOne { op: Op, got: usize },
    #[error("operator {op} requires zero values, got {got}")]
    WantsZero { op: Op, got: usize },
    #[error("invalid glob pattern {0:?}")]
    BadGlob(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expression {
    pub key: String,
    pub op: Op,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Expression {
    pub fn new(key: impl Into<String>, op: Op, values: Vec<String>) -> Self {
        Self {
            key: key.into(),
            op,
            values,
        }
    }

    /// Validates operand arity before the expression is ever evaluated, per
    /// spec.md §4.3 ("Validation rejects operand-arity mismatches before
    /// first use").
    pub fn validate(&self) -> Result<(), ExprError> {
        let n = self.values.len();
        match self.op {
            Op::Equals | Op::NotEqual | Op::Matches | Op::MatchesNot => {
                if n != 1 {
                    return Err(ExprError::WantsOne { op: self.op, got: n });
                }
            }
            Op::In | Op::NotIn | Op::MatchesAny | Op::MatchesNone => {
                if n == 0 {
                    return Err(ExprError::WantsAtLeastOne { op: self.op, got: n });
                }
            }
            Op::Exists | Op::NotExist | Op::AlwaysTrue => {
                if n != 0 {
                    return Err(ExprError::WantsZero { op: self.op, got: n });
                }
            }
        }
        if matches!(self.op, Op::Matches | Op::MatchesNot | Op::MatchesAny | Op::MatchesNone) {
            for v in &self.values {
                if !glob_is_valid(v) {
                    return Err(ExprError::BadGlob(v.clone()));
                }
            }
        }
        Ok(())
    }

    /// Evaluation is total: an unresolved key yields the empty value and a
    /// `false` presence, which every operator below handles without panicking.
    pub fn eval(&self, target: &dyn Evaluable) -> bool {
        if self.op == Op::AlwaysTrue {
            return true;
        }
        let (value, present) = resolve(target, &self.key);
        match self.op {
            Op::Equals => present && value == self.values[0],
            Op::NotEqual => !(present && value == self.values[0]),
            Op::In => present && self.values.iter().any(|v| v == &value),
            Op::NotIn => !(present && self.values.iter().any(|v| v == &value)),
            Op::Exists => present,
            Op::NotExist => !present,
            Op::Matches => present && glob_match(&self.values[0], &value),
            Op::MatchesNot => !(present && glob_match(&self.values[0], &value)),
            Op::MatchesAny => present && self.values.iter().any(|p| glob_match(p, &value)),
            Op::MatchesNone => !(present && self.values.iter().any(|p| glob_match(p, &value))),
            Op::AlwaysTrue => unreachable!(),
        }
    }
}

/// Resolves `key` against `target`, transparently handling the joint-key
/// form `:<ksep><vsep><key1><ksep><key2>...`, e.g.
/// `":,-pod/qosclass,pod/namespace,pod/name,name"` resolves each sub-key and
/// joins successful resolutions with `vsep`.
fn resolve(target: &dyn Evaluable, key: &str) -> (String, bool) {
    if let Some(parts) = parse_joint_key(key) {
        let (ksep, vsep, subkeys) = parts;
        let _ = ksep;
        let mut resolved = Vec::new();
        let mut any_present = false;
        for sk in subkeys {
            let (v, present) = target.eval_string(&sk);
            if present {
                any_present = true;
                resolved.push(v);
            }
        }
        (resolved.join(&vsep.to_string()), any_present)
    } else {
        target.eval_string(key)
    }
}

fn parse_joint_key(key: &str) -> Option<(char, char, Vec<String>)> {
    let rest = key.strip_prefix(':')?;
    let mut chars = rest.chars();
    let ksep = chars.next()?;
    let vsep = chars.next()?;
    let body: String = chars.collect();
    if body.is_empty() {
        return None;
    }
    let subkeys: Vec<String> = body.split(ksep).map(|s| s.to_string()).collect();
    Some((ksep, vsep, subkeys))
}

fn glob_is_valid(_pattern: &str) -> bool {
    // Single shell-glob class (`*`, `?`, literals); every input string is a
    // syntactically valid glob under this reduced grammar.
    true
}

/// Minimal shell-glob matcher supporting `*` (any run, including empty) and
/// `?` (exactly one character). This is the "single shell glob" class
/// spec.md's `Matches`/`MatchesNot` operators require; a full glob crate
/// would be overkill for two wildcard classes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_rec(&p, &t)
}

fn glob_match_rec(p: &[char], t: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('*') => glob_match_rec(&p[1..], t) || (!t.is_empty() && glob_match_rec(p, &t[1..])),
        Some('?') => !t.is_empty() && glob_match_rec(&p[1..], &t[1..]),
        Some(c) => t.first() == Some(c) && glob_match_rec(&p[1..], &t[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture;
    impl Evaluable for Fixture {
        fn eval_string(&self, key: &str) -> (String, bool) {
            match key {
                "pod/qosclass" => ("Guaranteed".into(), true),
                "pod/namespace" => ("kube-system".into(), true),
                "pod/name" => ("P1".into(), true),
                "name" => ("C1".into(), true),
                "pod/labels/foo" => ("bar".into(), true),
                _ => (String::new(), false),
            }
        }
    }

    #[test]
    fn joint_key_resolves_and_joins() {
        let expr = Expression::new(
            ":,-pod/qosclass,pod/namespace,pod/name,name",
            Op::Equals,
            vec!["Guaranteed-kube-system-P1-C1".to_string()],
        );
        expr.validate().unwrap();
        assert!(expr.eval(&Fixture));
    }

    #[test]
    fn unresolved_key_is_total_and_false() {
        let expr = Expression::new("nope/nope", Op::Equals, vec!["x".to_string()]);
        assert!(!expr.eval(&Fixture));
        let exists = Expression::new("nope/nope", Op::NotExist, vec![]);
        assert!(exists.eval(&Fixture));
    }

    #[test]
    fn glob_operators() {
        let e = Expression::new("pod/name", Op::Matches, vec!["P?".to_string()]);
        assert!(e.eval(&Fixture));
        let e2 = Expression::new("pod/name", Op::MatchesNone, vec!["Q*".to_string(), "R*".to_string()]);
        assert!(e2.eval(&Fixture));
    }

    #[test]
    fn arity_validation_rejects_mismatches() {
        let bad = Expression::new("x", Op::Equals, vec![]);
        assert!(bad.validate().is_err());
        let bad2 = Expression::new("x", Op::Exists, vec!["y".into()]);
        assert!(bad2.validate().is_err());
        let bad3 = Expression::new("x", Op::In, vec![]);
        assert!(bad3.validate().is_err());
    }

    #[test]
    fn in_and_not_in() {
        let e = Expression::new("pod/namespace", Op::In, vec!["kube-system".into(), "default".into()]);
        assert!(e.eval(&Fixture));
        let e2 = Expression::new("pod/namespace", Op::NotIn, vec!["default".into()]);
        assert!(e2.eval(&Fixture));
    }

    proptest::proptest! {
        #[test]
        fn glob_literal_matches_itself(s in "[a-zA-Z0-9]{0,12}") {
            proptest::prop_assert!(glob_match(&s, &s));
        }

        #[test]
        fn glob_star_matches_any_suffix(prefix in "[a-z]{1,6}", suffix in "[a-z]{0,6}") {
            let pattern = format!("{prefix}*");
            let text = format!("{prefix}{suffix}");
            proptest::prop_assert!(glob_match(&pattern, &text));
        }
    }
}
