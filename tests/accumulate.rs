use std::sync::Arc;

use reteclad::node::{NodeId, NodeKind};
use reteclad::prelude::*;
use serde_json::{Value, json};

fn bag_total() -> RuleDefinition {
    let spec = AccumulateSpec::new(Arc::new(Sum))
        .with_constraint(PredicateConstraint::field_equals(Declaration::new("bag", 0), "id", "bag"))
        .extracting(TupleFunction::right_field("n"));
    RuleDefinition::new("total")
        .when(Condition::pattern(Pattern::new("Bag")))
        .when(Condition::accumulate(Pattern::new("Item"), Arc::new(spec)))
}

fn per_color() -> RuleDefinition {
    let spec = AccumulateSpec::new(Arc::new(Count)).grouped_by(TupleFunction::right_field("color"));
    RuleDefinition::new("per-color")
        .when(Condition::pattern(Pattern::new("Bag")))
        .when(Condition::accumulate(Pattern::new("Item"), Arc::new(spec)))
}

fn knowledge(rule: RuleDefinition) -> KnowledgeBase {
    let kb = KnowledgeBase::new(EngineConfig::default());
    kb.add_rule(rule).unwrap();
    kb
}

fn accumulate_node(kb: &KnowledgeBase, rule: &str) -> NodeId {
    let nodes = kb.nodes_of_rule(rule).unwrap();
    let network = kb.network().unwrap();
    nodes
        .into_iter()
        .find(|id| matches!(network.node(*id).unwrap().kind, NodeKind::Accumulate(_)))
        .expect("rule has an accumulate node")
}

fn result_of(session: &Session, rule: &str) -> Vec<Value> {
    session
        .scheduler()
        .activations(rule)
        .iter()
        .map(|activation| activation.values[1].clone())
        .collect()
}

#[test]
fn reversal_gives_the_same_result_as_accumulating_from_scratch() {
    let kb = knowledge(bag_total());
    let mut reversed = kb.new_session().unwrap();
    reversed.insert("Bag", json!({"id": 1})).unwrap();
    let mut items = Vec::new();
    for n in [3, 5, 7] {
        items.push(reversed.insert("Item", json!({"bag": 1, "n": n})).unwrap());
    }
    reversed.evaluate_all().unwrap();
    assert_eq!(result_of(&reversed, "total"), vec![json!(15)]);
    reversed.delete(items[1]).unwrap();
    reversed.evaluate_all().unwrap();

    let mut direct = kb.new_session().unwrap();
    direct.insert("Bag", json!({"id": 1})).unwrap();
    for n in [3, 7] {
        direct.insert("Item", json!({"bag": 1, "n": n})).unwrap();
    }
    direct.evaluate_all().unwrap();

    assert_eq!(result_of(&reversed, "total"), vec![json!(10)]);
    assert_eq!(result_of(&reversed, "total"), result_of(&direct, "total"));
}

#[test]
fn updates_move_contributions_between_left_tuples() {
    let kb = knowledge(bag_total());
    let mut session = kb.new_session().unwrap();
    session.insert("Bag", json!({"id": 1})).unwrap();
    session.insert("Bag", json!({"id": 2})).unwrap();
    let item = session.insert("Item", json!({"bag": 1, "n": 4})).unwrap();
    session.insert("Item", json!({"bag": 2, "n": 1})).unwrap();
    session.evaluate_all().unwrap();
    let mut totals = result_of(&session, "total");
    totals.sort_by_key(|v| v.as_i64());
    assert_eq!(totals, vec![json!(1), json!(4)]);

    session.update(item, json!({"bag": 2, "n": 4})).unwrap();
    session.evaluate_all().unwrap();
    let mut totals = result_of(&session, "total");
    totals.sort_by_key(|v| v.as_i64());
    assert_eq!(totals, vec![json!(0), json!(5)]);
}

#[test]
fn emptied_group_is_removed_and_recreated_fresh() {
    let kb = knowledge(per_color());
    let node = accumulate_node(&kb, "per-color");
    let mut session = kb.new_session().unwrap();
    session.insert("Bag", json!({"id": 1})).unwrap();
    session.insert("Item", json!({"color": "red"})).unwrap();
    session.insert("Item", json!({"color": "red"})).unwrap();
    let blue = session.insert("Item", json!({"color": "blue"})).unwrap();
    session.evaluate_all().unwrap();
    assert_eq!(session.groups(node).unwrap().len(), 2);
    assert_eq!(session.scheduler().activations("per-color").len(), 2);
    let blue_key = json!("blue").to_string();
    let stale = session
        .groups(node)
        .unwrap()
        .into_iter()
        .find(|group| group.key == blue_key)
        .unwrap();

    session.delete(blue).unwrap();
    session.evaluate_all().unwrap();
    let groups = session.groups(node).unwrap();
    assert_eq!(groups.len(), 1);
    assert!(groups.iter().all(|group| group.key != blue_key));
    assert_eq!(
        result_of(&session, "per-color"),
        vec![json!({"key": "red", "result": 2})],
        "no zero-count result for the dropped group"
    );

    session.insert("Item", json!({"color": "blue"})).unwrap();
    session.evaluate_all().unwrap();
    let fresh = session
        .groups(node)
        .unwrap()
        .into_iter()
        .find(|group| group.key == blue_key)
        .unwrap();
    assert_ne!(fresh.serial, stale.serial);
    assert_eq!(fresh.members, 1);
    assert_eq!(fresh.state, json!(1));
}

#[test]
fn empty_group_without_reversal_reports_no_match() {
    let spec = AccumulateSpec::new(Arc::new(Min)).extracting(TupleFunction::right_field("price"));
    let kb = knowledge(
        RuleDefinition::new("cheapest")
            .when(Condition::pattern(Pattern::new("Shop")))
            .when(Condition::accumulate(Pattern::new("Offer"), Arc::new(spec))),
    );
    let mut session = kb.new_session().unwrap();
    session.insert("Shop", json!({})).unwrap();
    assert!(session.evaluate_rule("cheapest").unwrap().is_empty(), "min of nothing is no result");

    let cheap = session.insert("Offer", json!({"price": 3})).unwrap();
    session.insert("Offer", json!({"price": 8})).unwrap();
    session.evaluate_all().unwrap();
    assert_eq!(result_of(&session, "cheapest"), vec![json!(3)]);

    // min cannot be reversed, the group is recomputed from what is left
    session.delete(cheap).unwrap();
    session.evaluate_all().unwrap();
    assert_eq!(result_of(&session, "cheapest"), vec![json!(8)]);
}

#[test]
fn result_filter_turns_results_into_no_match() {
    let spec = AccumulateSpec::new(Arc::new(Count)).filtered(AlphaConstraint::new("count >= 2", |value| {
        Ok(value.as_i64().is_some_and(|n| n >= 2))
    }));
    let kb = knowledge(
        RuleDefinition::new("busy")
            .when(Condition::pattern(Pattern::new("Desk")))
            .when(Condition::accumulate(Pattern::new("Ticket"), Arc::new(spec))),
    );
    let mut session = kb.new_session().unwrap();
    session.insert("Desk", json!({})).unwrap();
    let first = session.insert("Ticket", json!({})).unwrap();
    assert!(session.evaluate_rule("busy").unwrap().is_empty());
    session.insert("Ticket", json!({})).unwrap();
    assert_eq!(session.evaluate_rule("busy").unwrap().len(), 1);
    session.delete(first).unwrap();
    assert!(session.evaluate_rule("busy").unwrap().is_empty());
}

#[test]
fn subnetwork_results_are_correlated_with_their_own_left_tuple() {
    let in_room = PredicateConstraint::field_equals(Declaration::new("room", 0), "id", "room");
    let spec = AccumulateSpec::new(Arc::new(Count));
    let kb = knowledge(
        RuleDefinition::new("occupancy")
            .when(Condition::pattern(Pattern::new("Room")))
            .when(Condition::accumulate(
                Source::Subnetwork(vec![Condition::join(Pattern::new("Person"), vec![in_room])]),
                Arc::new(spec),
            )),
    );
    let mut session = kb.new_session().unwrap();
    session.insert("Room", json!({"id": 1})).unwrap();
    session.insert("Room", json!({"id": 2})).unwrap();
    session.insert("Person", json!({"room": 1})).unwrap();
    let leaving = session.insert("Person", json!({"room": 1})).unwrap();
    session.evaluate_all().unwrap();

    let mut counts: Vec<(Value, Value)> = session
        .scheduler()
        .activations("occupancy")
        .iter()
        .map(|activation| (activation.values[0]["id"].clone(), activation.values[1].clone()))
        .collect();
    counts.sort_by_key(|(room, _)| room.as_i64());
    assert_eq!(counts, vec![(json!(1), json!(2)), (json!(2), json!(0))]);

    session.delete(leaving).unwrap();
    let matches = session.evaluate_rule("occupancy").unwrap();
    let room_one = matches.iter().find(|activation| activation.values[0]["id"] == json!(1)).unwrap();
    assert_eq!(room_one.values[1], json!(1));
}

#[test]
fn failing_extractor_names_the_function() {
    let spec = AccumulateSpec::new(Arc::new(Sum)).extracting(TupleFunction::new("strict n", |_, right| {
        right
            .last()
            .and_then(|value| value.get("n"))
            .cloned()
            .ok_or_else(|| EvaluationFailure::new("missing n"))
    }));
    let kb = knowledge(
        RuleDefinition::new("strict")
            .when(Condition::pattern(Pattern::new("Bag")))
            .when(Condition::accumulate(Pattern::new("Item"), Arc::new(spec))),
    );
    let mut session = kb.new_session().unwrap();
    session.insert("Bag", json!({})).unwrap();
    session.insert("Item", json!({"weight": 2})).unwrap();
    match session.evaluate_all() {
        Err(ReteError::FunctionEvaluation { function, message, .. }) => {
            assert_eq!(function, "strict n");
            assert_eq!(message, "missing n");
        }
        other => panic!("expected a function failure, got {other:?}"),
    }
    assert!(session.is_poisoned());
}
