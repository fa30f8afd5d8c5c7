use reteclad::prelude::*;
use serde_json::json;

fn owners() -> KnowledgeBase {
    let kb = KnowledgeBase::new(EngineConfig::default());
    kb.add_rule(
        RuleDefinition::new("owners")
            .when(Condition::pattern(Pattern::new("Person")))
            .when(Condition::join(
                Pattern::new("Pet"),
                vec![PredicateConstraint::field_equals(Declaration::new("p", 0), "id", "owner")],
            )),
    )
    .unwrap();
    kb
}

#[test]
fn insert_then_delete_restores_the_segment_mask() {
    let kb = owners();
    let mut session = kb.new_session().unwrap();
    session.insert("Person", json!({"id": 1})).unwrap();
    let before = session.segment_mask("owners", 0).unwrap();
    assert_ne!(before, 0, "the adapter links on its first fact");

    let pet = session.insert("Pet", json!({"owner": 1})).unwrap();
    let linked = session.segment_mask("owners", 0).unwrap();
    assert_ne!(linked, before, "the join links on its first right fact");

    session.delete(pet).unwrap();
    assert_eq!(session.segment_mask("owners", 0).unwrap(), before);

    // a second round trip lands in the same place
    let pet = session.insert("Pet", json!({"owner": 7})).unwrap();
    assert_eq!(session.segment_mask("owners", 0).unwrap(), linked);
    session.delete(pet).unwrap();
    assert_eq!(session.segment_mask("owners", 0).unwrap(), before);
}

#[test]
fn linked_bit_follows_live_count_not_constraint_matches() {
    let kb = owners();
    let mut session = kb.new_session().unwrap();
    session.insert("Person", json!({"id": 1})).unwrap();
    // neither pet belongs to person 1, yet the join has right input
    let a = session.insert("Pet", json!({"owner": 2})).unwrap();
    let b = session.insert("Pet", json!({"owner": 3})).unwrap();
    assert!(session.path_linked("owners").unwrap());
    session.delete(a).unwrap();
    assert!(session.path_linked("owners").unwrap(), "one pet is still live");
    session.delete(b).unwrap();
    assert!(!session.path_linked("owners").unwrap());
}

#[test]
fn path_is_eligible_exactly_when_every_input_is_present() {
    let kb = owners();
    let mut session = kb.new_session().unwrap();
    assert!(!session.path_linked("owners").unwrap());
    session.insert("Pet", json!({"owner": 1})).unwrap();
    assert!(!session.path_linked("owners").unwrap(), "no person yet");
    assert!(!session.scheduler().is_eligible("owners"));

    let person = session.insert("Person", json!({"id": 1})).unwrap();
    assert!(session.path_linked("owners").unwrap());
    assert!(session.scheduler().is_eligible("owners"));

    // eligibility drops on the delete itself, before any evaluation
    session.delete(person).unwrap();
    assert!(!session.path_linked("owners").unwrap());
    assert!(!session.scheduler().is_eligible("owners"));
}

#[test]
fn path_mask_has_one_bit_per_segment() {
    let kb = KnowledgeBase::new(EngineConfig::default());
    kb.add_rule(
        RuleDefinition::new("ab")
            .when(Condition::pattern(Pattern::new("A")))
            .when(Condition::pattern(Pattern::new("B"))),
    )
    .unwrap();
    kb.add_rule(
        RuleDefinition::new("ac")
            .when(Condition::pattern(Pattern::new("A")))
            .when(Condition::pattern(Pattern::new("C"))),
    )
    .unwrap();
    // the shared adapter sits in a segment of its own
    assert_eq!(kb.segments_of_rule("ab").unwrap().len(), 2);

    let mut session = kb.new_session().unwrap();
    session.insert("A", json!({})).unwrap();
    assert_eq!(session.path_mask("ab").unwrap(), 0b01);
    session.insert("B", json!({})).unwrap();
    assert_eq!(session.path_mask("ab").unwrap(), 0b11);
    assert_eq!(session.path_mask("ac").unwrap(), 0b01);
    assert!(session.path_linked("ab").unwrap());
    assert!(!session.path_linked("ac").unwrap());
}

#[test]
fn staged_changes_wait_for_evaluation() {
    let kb = owners();
    let mut session = kb.new_session().unwrap();
    session.insert("Person", json!({"id": 1})).unwrap();
    session.insert("Pet", json!({"owner": 1})).unwrap();
    assert!(session.scheduler().is_dirty("owners"));
    assert_eq!(session.scheduler().total_activations(), 0);
    assert_eq!(session.staged_left("owners", 0).unwrap().len(), 1);

    let matches = session.evaluate_rule("owners").unwrap();
    assert_eq!(matches.len(), 1);
    assert!(!session.scheduler().is_dirty("owners"));
    assert!(session.staged_left("owners", 0).unwrap().is_empty());
    assert_eq!(session.scheduler().activations("owners").len(), 1);
}

#[test]
fn data_driven_rules_are_flushed_by_the_triggering_change() {
    let kb = KnowledgeBase::new(EngineConfig::default());
    kb.add_rule(
        RuleDefinition::new("eager")
            .when(Condition::pattern(Pattern::new("A")))
            .when(Condition::pattern(Pattern::new("B")))
            .data_driven(),
    )
    .unwrap();
    let mut session = kb.new_session().unwrap();
    session.insert("A", json!({"n": 1})).unwrap();
    assert_eq!(session.scheduler().activations("eager").len(), 0);
    let b = session.insert("B", json!({"n": 2})).unwrap();
    assert_eq!(session.scheduler().activations("eager").len(), 1, "no explicit evaluation needed");
    session.delete(b).unwrap();
    assert_eq!(session.scheduler().activations("eager").len(), 0);
}

#[test]
fn unknown_rules_are_reported() {
    let kb = owners();
    let mut session = kb.new_session().unwrap();
    assert!(matches!(session.evaluate_rule("nope"), Err(ReteError::UnknownRule(_))));
    assert!(matches!(session.path_linked("nope"), Err(ReteError::UnknownRule(_))));
    assert!(!session.is_poisoned());
}
