//! Opaque constraint capabilities handed to the network.
//!
//! Constraints are supplied by the caller as closures. The network never looks
//! inside them: it hands them the bindings of a candidate pair and gets back a
//! verdict or an [`EvaluationFailure`], which propagation turns into a fatal
//! [`ReteError`] carrying the constraint's description.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{ReteError, Result};

/// Failure signalled by an injected predicate or function.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationFailure {
    pub message: String,
}

impl EvaluationFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for EvaluationFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub type Verdict = std::result::Result<bool, EvaluationFailure>;

// ------------- Bindings -------------
/// Fact values of one side of a candidate pair, ordered by pattern index.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bindings(Vec<Value>);

impl Bindings {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }
    pub fn last(&self) -> Option<&Value> {
        self.0.last()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn values(&self) -> &[Value] {
        &self.0
    }
    /// The field of the value bound at `index`, if both exist.
    pub fn field(&self, index: usize, field: &str) -> Option<&Value> {
        self.get(index).and_then(|value| value.get(field))
    }
}

impl fmt::Display for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, "]")
    }
}

/// A named reference to the fact bound by an earlier pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub name: String,
    pub index: usize,
}

impl Declaration {
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

// ------------- AlphaConstraint -------------
type AlphaFn = dyn Fn(&Value) -> Verdict + Send + Sync;

/// A filter over a single fact, evaluated before the fact reaches any beta
/// node. Alpha nodes are shared only between identical (same `Arc`) filters.
pub struct AlphaConstraint {
    description: String,
    filter: Box<AlphaFn>,
}

impl AlphaConstraint {
    pub fn new<F>(description: impl Into<String>, filter: F) -> Arc<Self>
    where
        F: Fn(&Value) -> Verdict + Send + Sync + 'static,
    {
        Arc::new(Self {
            description: description.into(),
            filter: Box::new(filter),
        })
    }
    pub fn field_equals(field: &str, expected: Value) -> Arc<Self> {
        let name = field.to_owned();
        Self::new(format!("{field} == {expected}"), move |value| {
            Ok(value.get(&name) == Some(&expected))
        })
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn evaluate(&self, value: &Value) -> Result<bool> {
        (self.filter)(value).map_err(|failure| ReteError::ConstraintEvaluation {
            constraint: self.description.clone(),
            message: failure.message,
        })
    }
}

impl fmt::Debug for AlphaConstraint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AlphaConstraint({})", self.description)
    }
}

// ------------- BetaConstraint -------------
pub trait BetaConstraint: Send + Sync {
    fn description(&self) -> &str;
    /// Left-hand facts the constraint reads.
    fn declarations(&self) -> &[Declaration];
    fn is_allowed(&self, left: &Bindings, right: &Bindings) -> Verdict;
}

impl fmt::Debug for dyn BetaConstraint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BetaConstraint({})", self.description())
    }
}

pub type Constraints = Vec<Arc<dyn BetaConstraint>>;

type PredicateFn = dyn Fn(&Bindings, &Bindings) -> Verdict + Send + Sync;

pub struct PredicateConstraint {
    description: String,
    declarations: Vec<Declaration>,
    predicate: Box<PredicateFn>,
}

impl PredicateConstraint {
    pub fn new<F>(description: impl Into<String>, declarations: Vec<Declaration>, predicate: F) -> Arc<dyn BetaConstraint>
    where
        F: Fn(&Bindings, &Bindings) -> Verdict + Send + Sync + 'static,
    {
        Arc::new(Self {
            description: description.into(),
            declarations,
            predicate: Box::new(predicate),
        })
    }

    /// `left[declaration].left_field == right.right_field`, where the right
    /// side is the last bound value. A missing left fact is an evaluation
    /// failure; a missing field simply does not match.
    pub fn field_equals(declaration: Declaration, left_field: &str, right_field: &str) -> Arc<dyn BetaConstraint> {
        let description = format!("{}.{left_field} == {right_field}", declaration.name);
        let index = declaration.index;
        let (left_field, right_field) = (left_field.to_owned(), right_field.to_owned());
        Self::new(description, vec![declaration], move |left, right| {
            let bound = left
                .get(index)
                .ok_or_else(|| EvaluationFailure::new(format!("no fact bound at index {index}")))?;
            let theirs = right.last().and_then(|value| value.get(&right_field));
            Ok(bound.get(&left_field).is_some() && bound.get(&left_field) == theirs)
        })
    }
}

impl BetaConstraint for PredicateConstraint {
    fn description(&self) -> &str {
        &self.description
    }
    fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }
    fn is_allowed(&self, left: &Bindings, right: &Bindings) -> Verdict {
        (self.predicate)(left, right)
    }
}

/// Every constraint must allow the pair. The first failure aborts.
pub fn all_allowed(constraints: &[Arc<dyn BetaConstraint>], left: &Bindings, right: &Bindings) -> Result<bool> {
    for constraint in constraints {
        let allowed = constraint
            .is_allowed(left, right)
            .map_err(|failure| ReteError::ConstraintEvaluation {
                constraint: constraint.description().to_owned(),
                message: failure.message,
            })?;
        if !allowed {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn same_constraints(a: &[Arc<dyn BetaConstraint>], b: &[Arc<dyn BetaConstraint>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| Arc::ptr_eq(x, y))
}

// ------------- TupleFunction -------------
type TupleFn = dyn Fn(&Bindings, &Bindings) -> std::result::Result<Value, EvaluationFailure> + Send + Sync;

/// A pure function of a candidate pair, used for grouping keys and for the
/// values fed into an accumulator.
pub struct TupleFunction {
    description: String,
    function: Box<TupleFn>,
}

pub type GroupingFunction = TupleFunction;
pub type ValueExtractor = TupleFunction;

impl TupleFunction {
    pub fn new<F>(description: impl Into<String>, function: F) -> Arc<Self>
    where
        F: Fn(&Bindings, &Bindings) -> std::result::Result<Value, EvaluationFailure> + Send + Sync + 'static,
    {
        Arc::new(Self {
            description: description.into(),
            function: Box::new(function),
        })
    }
    /// Reads `field` of the right-hand fact, `null` when absent.
    pub fn right_field(field: &str) -> Arc<Self> {
        let name = field.to_owned();
        Self::new(format!("right.{field}"), move |_, right| {
            Ok(right
                .last()
                .and_then(|value| value.get(&name))
                .cloned()
                .unwrap_or(Value::Null))
        })
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn apply(&self, left: &Bindings, right: &Bindings) -> Result<Value> {
        (self.function)(left, right).map_err(|failure| ReteError::FunctionEvaluation {
            function: self.description.clone(),
            tuple: format!("{left} / {right}"),
            message: failure.message,
        })
    }
}

impl fmt::Debug for TupleFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TupleFunction({})", self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failures_carry_the_description() {
        let failing = PredicateConstraint::new("boom", vec![], |_, _| Err(EvaluationFailure::new("divide by zero")));
        let err = all_allowed(&[failing], &Bindings::default(), &Bindings::default()).unwrap_err();
        assert_eq!(
            err,
            ReteError::ConstraintEvaluation {
                constraint: "boom".into(),
                message: "divide by zero".into()
            }
        );
    }

    #[test]
    fn field_equality_reads_the_declared_fact() {
        let same_owner = PredicateConstraint::field_equals(Declaration::new("p", 0), "id", "owner");
        let left = Bindings::new(vec![json!({"id": 7})]);
        assert!(same_owner.is_allowed(&left, &Bindings::new(vec![json!({"owner": 7})])).unwrap());
        assert!(!same_owner.is_allowed(&left, &Bindings::new(vec![json!({"owner": 8})])).unwrap());
        assert!(same_owner.is_allowed(&Bindings::default(), &Bindings::default()).is_err());
    }
}
