//! Aggregation support for accumulate nodes.
//!
//! Each left tuple that reaches an accumulate node owns an
//! [`AccumulationContext`]. The context indexes groups by the stringified
//! grouping key; every group holds the running accumulator state, the member
//! right tuples and the result tuple currently propagated for it. Without a
//! grouping function a single implicit group lives as long as the left tuple.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use roaring::RoaringTreemap;
use serde_json::{Number, Value, json};

use crate::constraint::{AlphaConstraint, BetaConstraint, Constraints, EvaluationFailure, GroupingFunction, ValueExtractor};
use crate::error::{ReteError, Result};
use crate::tuple::TupleId;

pub type Outcome<T> = std::result::Result<T, EvaluationFailure>;

pub trait Accumulator: Send + Sync {
    fn name(&self) -> &str;
    fn init(&self) -> Value;
    fn accumulate(&self, state: &mut Value, input: &Value) -> Outcome<()>;
    fn supports_reverse(&self) -> bool {
        false
    }
    fn reverse(&self, _state: &mut Value, _input: &Value) -> Outcome<()> {
        Err(EvaluationFailure::new(format!("{} cannot be reversed", self.name())))
    }
    /// `None` means there is nothing to report, which downstream nodes treat
    /// as no match.
    fn result(&self, state: &Value) -> Outcome<Option<Value>>;
}

fn numeric(value: &Value) -> Outcome<f64> {
    value
        .as_f64()
        .ok_or_else(|| EvaluationFailure::new(format!("{value} is not a number")))
}

/// Adds `sign * b` to `a`, staying integral while both sides are integers.
fn add_numbers(a: &Value, b: &Value, sign: i64) -> Outcome<Value> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = y.checked_mul(sign).and_then(|y| x.checked_add(y)) {
            return Ok(Value::from(sum));
        }
    }
    let sum = numeric(a)? + sign as f64 * numeric(b)?;
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| EvaluationFailure::new(format!("{sum} cannot be represented")))
}

// ------------- built-in accumulators -------------
pub struct Count;

impl Accumulator for Count {
    fn name(&self) -> &str {
        "count"
    }
    fn init(&self) -> Value {
        json!(0)
    }
    fn accumulate(&self, state: &mut Value, _input: &Value) -> Outcome<()> {
        *state = add_numbers(state, &json!(1), 1)?;
        Ok(())
    }
    fn supports_reverse(&self) -> bool {
        true
    }
    fn reverse(&self, state: &mut Value, _input: &Value) -> Outcome<()> {
        *state = add_numbers(state, &json!(1), -1)?;
        Ok(())
    }
    fn result(&self, state: &Value) -> Outcome<Option<Value>> {
        Ok(Some(state.clone()))
    }
}

pub struct Sum;

impl Accumulator for Sum {
    fn name(&self) -> &str {
        "sum"
    }
    fn init(&self) -> Value {
        json!(0)
    }
    fn accumulate(&self, state: &mut Value, input: &Value) -> Outcome<()> {
        *state = add_numbers(state, input, 1)?;
        Ok(())
    }
    fn supports_reverse(&self) -> bool {
        true
    }
    fn reverse(&self, state: &mut Value, input: &Value) -> Outcome<()> {
        *state = add_numbers(state, input, -1)?;
        Ok(())
    }
    fn result(&self, state: &Value) -> Outcome<Option<Value>> {
        Ok(Some(state.clone()))
    }
}

pub struct Average;

impl Accumulator for Average {
    fn name(&self) -> &str {
        "average"
    }
    fn init(&self) -> Value {
        json!({"sum": 0, "count": 0})
    }
    fn accumulate(&self, state: &mut Value, input: &Value) -> Outcome<()> {
        numeric(input)?;
        state["sum"] = add_numbers(&state["sum"], input, 1)?;
        state["count"] = add_numbers(&state["count"], &json!(1), 1)?;
        Ok(())
    }
    fn supports_reverse(&self) -> bool {
        true
    }
    fn reverse(&self, state: &mut Value, input: &Value) -> Outcome<()> {
        state["sum"] = add_numbers(&state["sum"], input, -1)?;
        state["count"] = add_numbers(&state["count"], &json!(1), -1)?;
        Ok(())
    }
    fn result(&self, state: &Value) -> Outcome<Option<Value>> {
        let count = numeric(&state["count"])?;
        if count == 0.0 {
            return Ok(None);
        }
        Ok(Number::from_f64(numeric(&state["sum"])? / count).map(Value::Number))
    }
}

fn keep_extremum(state: &mut Value, input: &Value, keep_smaller: bool) -> Outcome<()> {
    let candidate = numeric(input)?;
    let replace = if state.is_null() {
        true
    } else {
        let current = numeric(state)?;
        if keep_smaller { candidate < current } else { candidate > current }
    };
    if replace {
        *state = input.clone();
    }
    Ok(())
}

// Neither extremum can be reversed, so a retraction recomputes the group
// from its remaining members.
pub struct Min;

impl Accumulator for Min {
    fn name(&self) -> &str {
        "min"
    }
    fn init(&self) -> Value {
        Value::Null
    }
    fn accumulate(&self, state: &mut Value, input: &Value) -> Outcome<()> {
        keep_extremum(state, input, true)
    }
    fn result(&self, state: &Value) -> Outcome<Option<Value>> {
        Ok((!state.is_null()).then(|| state.clone()))
    }
}

pub struct Max;

impl Accumulator for Max {
    fn name(&self) -> &str {
        "max"
    }
    fn init(&self) -> Value {
        Value::Null
    }
    fn accumulate(&self, state: &mut Value, input: &Value) -> Outcome<()> {
        keep_extremum(state, input, false)
    }
    fn result(&self, state: &Value) -> Outcome<Option<Value>> {
        Ok((!state.is_null()).then(|| state.clone()))
    }
}

pub struct CollectList;

impl Accumulator for CollectList {
    fn name(&self) -> &str {
        "collectList"
    }
    fn init(&self) -> Value {
        json!([])
    }
    fn accumulate(&self, state: &mut Value, input: &Value) -> Outcome<()> {
        match state {
            Value::Array(items) => {
                items.push(input.clone());
                Ok(())
            }
            other => Err(EvaluationFailure::new(format!("corrupt list state {other}"))),
        }
    }
    fn supports_reverse(&self) -> bool {
        true
    }
    fn reverse(&self, state: &mut Value, input: &Value) -> Outcome<()> {
        let items = match state {
            Value::Array(items) => items,
            other => return Err(EvaluationFailure::new(format!("corrupt list state {other}"))),
        };
        match items.iter().position(|item| item == input) {
            Some(pos) => {
                items.remove(pos);
                Ok(())
            }
            None => Err(EvaluationFailure::new(format!("{input} was never collected"))),
        }
    }
    fn result(&self, state: &Value) -> Outcome<Option<Value>> {
        Ok(Some(state.clone()))
    }
}

// ------------- AccumulateSpec -------------
/// Everything an accumulate node needs besides its inputs.
pub struct AccumulateSpec {
    pub function: Arc<dyn Accumulator>,
    pub constraints: Constraints,
    /// Feeds the accumulator; defaults to the right-hand fact itself.
    pub extractor: Option<Arc<ValueExtractor>>,
    pub grouping: Option<Arc<GroupingFunction>>,
    /// Applied to the accumulated result; a rejected result is no match.
    pub result_filter: Option<Arc<AlphaConstraint>>,
}

impl AccumulateSpec {
    pub fn new(function: Arc<dyn Accumulator>) -> Self {
        Self {
            function,
            constraints: Vec::new(),
            extractor: None,
            grouping: None,
            result_filter: None,
        }
    }
    pub fn with_constraint(mut self, constraint: Arc<dyn BetaConstraint>) -> Self {
        self.constraints.push(constraint);
        self
    }
    pub fn extracting(mut self, extractor: Arc<ValueExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }
    pub fn grouped_by(mut self, grouping: Arc<GroupingFunction>) -> Self {
        self.grouping = Some(grouping);
        self
    }
    pub fn filtered(mut self, filter: Arc<AlphaConstraint>) -> Self {
        self.result_filter = Some(filter);
        self
    }
    pub fn is_grouped(&self) -> bool {
        self.grouping.is_some()
    }
    fn failure(&self, tuple: TupleId, failure: EvaluationFailure) -> ReteError {
        ReteError::FunctionEvaluation {
            function: self.function.name().to_owned(),
            tuple: tuple.to_string(),
            message: failure.message,
        }
    }
}

impl fmt::Debug for AccumulateSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AccumulateSpec({}", self.function.name())?;
        if let Some(grouping) = &self.grouping {
            write!(f, " by {}", grouping.description())?;
        }
        write!(f, ")")
    }
}

// ------------- GroupIndex -------------
#[derive(Debug, Clone)]
pub struct GroupContext {
    key: String,
    key_value: Value,
    state: Value,
    members: RoaringTreemap,
    serial: u64,
    dirty: bool,
    pub(crate) result_tuple: Option<TupleId>,
}

impl GroupContext {
    pub fn key(&self) -> &str {
        &self.key
    }
    pub fn key_value(&self) -> &Value {
        &self.key_value
    }
    pub fn state(&self) -> &Value {
        &self.state
    }
    pub fn members(&self) -> &RoaringTreemap {
        &self.members
    }
    /// Creation number within the index, distinguishing a recreated group
    /// from the one it replaces.
    pub fn serial(&self) -> u64 {
        self.serial
    }
    pub fn result_tuple(&self) -> Option<TupleId> {
        self.result_tuple
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupIndex {
    groups: BTreeMap<String, GroupContext>,
    created: u64,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get_or_create(&mut self, key: &str, key_value: &Value, init: Value) -> &mut GroupContext {
        let created = &mut self.created;
        self.groups.entry(key.to_owned()).or_insert_with(|| {
            *created += 1;
            GroupContext {
                key: key.to_owned(),
                key_value: key_value.clone(),
                state: init,
                members: RoaringTreemap::new(),
                serial: *created,
                dirty: true,
                result_tuple: None,
            }
        })
    }
    pub fn get(&self, key: &str) -> Option<&GroupContext> {
        self.groups.get(key)
    }
    pub fn get_mut(&mut self, key: &str) -> Option<&mut GroupContext> {
        self.groups.get_mut(key)
    }
    pub fn remove(&mut self, key: &str) -> Option<GroupContext> {
        self.groups.remove(key)
    }
    pub fn len(&self) -> usize {
        self.groups.len()
    }
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = &GroupContext> {
        self.groups.values()
    }
}

// ------------- AccumulationContext -------------
#[derive(Debug, Clone)]
struct Contribution {
    key: String,
    input: Value,
}

/// Accumulation state of one left tuple.
#[derive(Debug, Clone)]
pub struct AccumulationContext {
    grouped: bool,
    groups: GroupIndex,
    matches: BTreeMap<u64, Contribution>,
}

const IMPLICIT_GROUP: &str = "";

impl AccumulationContext {
    pub fn new(spec: &AccumulateSpec) -> Self {
        let mut groups = GroupIndex::new();
        if !spec.is_grouped() {
            groups.get_or_create(IMPLICIT_GROUP, &Value::Null, spec.function.init());
        }
        Self {
            grouped: spec.is_grouped(),
            groups,
            matches: BTreeMap::new(),
        }
    }

    pub fn groups(&self) -> &GroupIndex {
        &self.groups
    }

    pub fn contains(&self, right: TupleId) -> bool {
        self.matches.contains_key(&right.raw())
    }

    pub fn matched(&self) -> impl Iterator<Item = TupleId> + '_ {
        self.matches.keys().map(|raw| TupleId::from_raw(*raw))
    }

    pub fn add(&mut self, spec: &AccumulateSpec, right: TupleId, key: Value, input: Value) -> Result<()> {
        let key_text = if self.grouped { key.to_string() } else { IMPLICIT_GROUP.to_owned() };
        let group = self.groups.get_or_create(&key_text, &key, spec.function.init());
        spec.function
            .accumulate(&mut group.state, &input)
            .map_err(|failure| spec.failure(right, failure))?;
        group.members.insert(right.raw());
        group.dirty = true;
        self.matches.insert(right.raw(), Contribution { key: key_text, input });
        Ok(())
    }

    /// Withdraws a right tuple's contribution. A grouped group left without
    /// members is dropped from the index and handed back, so its result tuple
    /// can be retracted.
    pub fn remove(&mut self, spec: &AccumulateSpec, right: TupleId) -> Result<Option<GroupContext>> {
        let Some(contribution) = self.matches.remove(&right.raw()) else {
            return Ok(None);
        };
        let group = self
            .groups
            .get_mut(&contribution.key)
            .ok_or_else(|| ReteError::Invariant(format!("no group {} for {right}", contribution.key)))?;
        group.members.remove(right.raw());
        group.dirty = true;
        if self.grouped && group.members.is_empty() {
            return Ok(self.groups.remove(&contribution.key));
        }
        if spec.function.supports_reverse() {
            spec.function
                .reverse(&mut group.state, &contribution.input)
                .map_err(|failure| spec.failure(right, failure))?;
        } else {
            let mut state = spec.function.init();
            for member in group.members.iter() {
                if let Some(kept) = self.matches.get(&member) {
                    spec.function
                        .accumulate(&mut state, &kept.input)
                        .map_err(|failure| spec.failure(TupleId::from_raw(member), failure))?;
                }
            }
            group.state = state;
        }
        Ok(None)
    }

    /// Keys of groups changed since the last call, clearing their marks.
    pub fn take_dirty(&mut self) -> Vec<String> {
        let mut dirty = Vec::new();
        for group in self.groups.groups.values_mut() {
            if group.dirty {
                group.dirty = false;
                dirty.push(group.key.clone());
            }
        }
        dirty
    }

    pub fn set_result_tuple(&mut self, key: &str, tuple: Option<TupleId>) {
        if let Some(group) = self.groups.get_mut(key) {
            group.result_tuple = tuple;
        }
    }

    /// The value propagated for a group: `{"key", "result"}` when grouped,
    /// the bare result otherwise.
    pub fn output(&self, spec: &AccumulateSpec, key: &str, left: TupleId) -> Result<Option<Value>> {
        let Some(group) = self.groups.get(key) else {
            return Ok(None);
        };
        if self.grouped && group.members.is_empty() {
            return Ok(None);
        }
        let Some(result) = spec
            .function
            .result(&group.state)
            .map_err(|failure| spec.failure(left, failure))?
        else {
            return Ok(None);
        };
        if let Some(filter) = &spec.result_filter {
            if !filter.evaluate(&result)? {
                return Ok(None);
            }
        }
        Ok(Some(if self.grouped {
            json!({"key": group.key_value, "result": result})
        } else {
            result
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{OpKind, PropagationContext, TupleKeeper, TupleValue};
    use crate::fact::FactId;
    use crate::node::NodeId;

    fn right_ids(n: usize) -> Vec<TupleId> {
        let mut keeper = TupleKeeper::new();
        let ctx = PropagationContext::new(1, FactId(1), OpKind::Insert);
        (0..n)
            .map(|_| keeper.create_right(TupleValue::Empty, NodeId(1), ctx))
            .collect()
    }

    #[test]
    fn reversal_matches_direct_accumulation() {
        let sum = AccumulateSpec::new(Arc::new(Sum));
        let ids = right_ids(3);
        let mut reversed = AccumulationContext::new(&sum);
        for (id, v) in ids.iter().zip([3, 5, 7]) {
            reversed.add(&sum, *id, Value::Null, json!(v)).unwrap();
        }
        reversed.remove(&sum, ids[1]).unwrap();
        let mut direct = AccumulationContext::new(&sum);
        direct.add(&sum, ids[0], Value::Null, json!(3)).unwrap();
        direct.add(&sum, ids[2], Value::Null, json!(7)).unwrap();
        let left = ids[0];
        assert_eq!(reversed.output(&sum, "", left).unwrap(), Some(json!(10)));
        assert_eq!(
            reversed.output(&sum, "", left).unwrap(),
            direct.output(&sum, "", left).unwrap()
        );
    }

    #[test]
    fn irreversible_accumulators_recompute() {
        let min = AccumulateSpec::new(Arc::new(Min));
        let ids = right_ids(3);
        let mut context = AccumulationContext::new(&min);
        for (id, v) in ids.iter().zip([4, 2, 9]) {
            context.add(&min, *id, Value::Null, json!(v)).unwrap();
        }
        context.remove(&min, ids[1]).unwrap();
        assert_eq!(context.output(&min, "", ids[0]).unwrap(), Some(json!(4)));
    }

    #[test]
    fn emptied_group_is_dropped_and_recreated_fresh() {
        let count = AccumulateSpec::new(Arc::new(Count)).grouped_by(GroupingFunction::right_field("city"));
        let ids = right_ids(2);
        let mut context = AccumulationContext::new(&count);
        assert!(context.groups().is_empty());
        context.add(&count, ids[0], json!("Oslo"), json!({})).unwrap();
        let first = context.groups().get("\"Oslo\"").unwrap().serial();
        let removed = context.remove(&count, ids[0]).unwrap().expect("group dropped");
        assert_eq!(removed.serial(), first);
        assert!(context.groups().get("\"Oslo\"").is_none());
        assert_eq!(context.output(&count, "\"Oslo\"", ids[0]).unwrap(), None);
        context.add(&count, ids[1], json!("Oslo"), json!({})).unwrap();
        let fresh = context.groups().get("\"Oslo\"").unwrap();
        assert_ne!(fresh.serial(), first);
        assert_eq!(fresh.state(), &json!(1));
        assert_eq!(
            context.output(&count, "\"Oslo\"", ids[1]).unwrap(),
            Some(json!({"key": "Oslo", "result": 1}))
        );
    }

    #[test]
    fn empty_average_has_no_result() {
        let average = Average;
        let mut state = average.init();
        assert_eq!(average.result(&state).unwrap(), None);
        average.accumulate(&mut state, &json!(2)).unwrap();
        average.accumulate(&mut state, &json!(4)).unwrap();
        assert_eq!(average.result(&state).unwrap(), Some(json!(3.0)));
        assert!(average.accumulate(&mut state, &json!("x")).is_err());
    }
}
