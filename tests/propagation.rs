use reteclad::prelude::*;
use reteclad::tuple::StagedType;
use serde_json::json;

fn fan_out() -> KnowledgeBase {
    let kb = KnowledgeBase::new(EngineConfig::default());
    for (name, other) in [("ab", "B"), ("ac", "C")] {
        kb.add_rule(
            RuleDefinition::new(name)
                .when(Condition::pattern(Pattern::new("A")))
                .when(Condition::pattern(Pattern::new(other))),
        )
        .unwrap();
    }
    kb
}

fn shared_join() -> KnowledgeBase {
    let kb = KnowledgeBase::new(EngineConfig::default());
    for (name, last) in [("abc", "C"), ("abd", "D")] {
        kb.add_rule(
            RuleDefinition::new(name)
                .when(Condition::pattern(Pattern::new("A")))
                .when(Condition::pattern(Pattern::new("B")))
                .when(Condition::pattern(Pattern::new(last))),
        )
        .unwrap();
    }
    kb
}

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
fn fan_out_stages_one_peer_per_sibling_path() {
    let kb = fan_out();
    let mut session = kb.new_session().unwrap();
    let a = session.insert("A", json!({"n": 1})).unwrap();
    let left = session.staged_left("ab", 1).unwrap();
    let right = session.staged_left("ac", 1).unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(right.len(), 1);
    assert_eq!(left[0].facts, vec![a]);
    assert_eq!(right[0].facts, vec![a]);
    assert_eq!(left[0].context, right[0].context, "peers share the propagation stamp");
    assert_ne!(left[0].sink, right[0].sink);
}

#[test]
fn deleting_the_original_retracts_every_peer() {
    let kb = fan_out();
    let mut session = kb.new_session().unwrap();
    session.insert("B", json!({})).unwrap();
    session.insert("C", json!({})).unwrap();
    let a = session.insert("A", json!({})).unwrap();
    session.evaluate_all().unwrap();
    assert_eq!(session.scheduler().activations("ab").len(), 1);
    assert_eq!(session.scheduler().activations("ac").len(), 1);

    session.delete(a).unwrap();
    let left = session.staged_left("ab", 1).unwrap();
    let right = session.staged_left("ac", 1).unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(right.len(), 1);
    assert_eq!(left[0].staged, StagedType::Delete);
    assert_eq!(right[0].staged, StagedType::Delete);
    assert_eq!(left[0].context, right[0].context);

    session.evaluate_all().unwrap();
    assert!(session.scheduler().activations("ab").is_empty());
    assert!(session.scheduler().activations("ac").is_empty());
    assert_eq!(session.tuples_derived_from(a), 0);
}

#[test]
fn updates_reach_every_peer() {
    let kb = fan_out();
    let mut session = kb.new_session().unwrap();
    session.insert("B", json!({})).unwrap();
    session.insert("C", json!({})).unwrap();
    let a = session.insert("A", json!({"n": 1})).unwrap();
    session.evaluate_all().unwrap();
    session.update(a, json!({"n": 2})).unwrap();
    session.evaluate_all().unwrap();
    for rule in ["ab", "ac"] {
        let activations = session.scheduler().activations(rule);
        assert_eq!(activations.len(), 1);
        assert_eq!(activations[0].values[0], json!({"n": 2}), "{rule} sees the new value");
    }
}

#[test]
fn insert_update_delete_leaves_nothing_behind() {
    let kb = owners();
    let mut session = kb.new_session().unwrap();
    session.insert("Person", json!({"id": 1})).unwrap();
    session.insert("Pet", json!({"owner": 1, "name": "Rex"})).unwrap();
    session.evaluate_all().unwrap();
    let baseline = session.live_tuples();

    // staged only
    let pet = session.insert("Pet", json!({"owner": 1, "name": "Fido"})).unwrap();
    session.update(pet, json!({"owner": 1, "name": "Fido II"})).unwrap();
    session.delete(pet).unwrap();
    assert_eq!(session.tuples_derived_from(pet), 0);
    session.evaluate_all().unwrap();
    assert_eq!(session.tuples_derived_from(pet), 0);

    // evaluated between every step
    let person = session.insert("Person", json!({"id": 1})).unwrap();
    session.evaluate_all().unwrap();
    session.update(person, json!({"id": 2})).unwrap();
    session.evaluate_all().unwrap();
    session.delete(person).unwrap();
    session.evaluate_all().unwrap();
    assert_eq!(session.tuples_derived_from(person), 0);

    assert_eq!(session.live_tuples(), baseline);
    assert_eq!(session.scheduler().activations("owners").len(), 1);
}

#[test]
fn left_update_is_reported_as_an_updated_match() {
    let kb = owners();
    let mut session = kb.new_session().unwrap();
    let person = session.insert("Person", json!({"id": 1, "name": "Ada"})).unwrap();
    session.insert("Pet", json!({"owner": 1})).unwrap();
    session.evaluate_all().unwrap();
    let id = session.scheduler().activations("owners")[0].id;
    session.scheduler_mut().drain_log();

    session.update(person, json!({"id": 1, "name": "Ada L."})).unwrap();
    session.evaluate_all().unwrap();
    let activations = session.scheduler().activations("owners");
    assert_eq!(activations.len(), 1);
    assert_eq!(activations[0].id, id);
    assert_eq!(activations[0].values[0]["name"], json!("Ada L."));
    let kinds: Vec<MatchKind> = session
        .scheduler()
        .log()
        .iter()
        .filter_map(|notification| match notification {
            Notification::Match(event) => Some(event.kind),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec![MatchKind::Updated]);
}

#[test]
fn right_update_moves_a_match() {
    let kb = owners();
    let mut session = kb.new_session().unwrap();
    let ada = session.insert("Person", json!({"id": 1})).unwrap();
    let bob = session.insert("Person", json!({"id": 2})).unwrap();
    let pet = session.insert("Pet", json!({"owner": 1})).unwrap();
    let matches = session.evaluate_rule("owners").unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].facts, vec![ada, pet]);

    session.update(pet, json!({"owner": 2})).unwrap();
    let matches = session.evaluate_rule("owners").unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].facts, vec![bob, pet]);
}

#[test]
fn alpha_filters_decide_where_updates_go() {
    let kb = KnowledgeBase::new(EngineConfig::default());
    kb.add_rule(
        RuleDefinition::new("cats")
            .when(Condition::pattern(
                Pattern::new("Pet").filter(AlphaConstraint::field_equals("kind", json!("cat"))),
            ))
            .data_driven(),
    )
    .unwrap();
    let mut session = kb.new_session().unwrap();
    let pet = session.insert("Pet", json!({"kind": "dog"})).unwrap();
    assert!(session.scheduler().activations("cats").is_empty());
    session.update(pet, json!({"kind": "cat"})).unwrap();
    assert_eq!(session.scheduler().activations("cats").len(), 1);
    session.update(pet, json!({"kind": "dog"})).unwrap();
    assert!(session.scheduler().activations("cats").is_empty());
    assert_eq!(session.fact(pet).unwrap().version(), 2);
}

#[test]
fn join_tip_fans_out_and_retractions_follow_the_peers() {
    let kb = shared_join();
    let mut session = kb.new_session().unwrap();
    let a = session.insert("A", json!({})).unwrap();
    let b = session.insert("B", json!({"n": 1})).unwrap();
    session.insert("C", json!({})).unwrap();
    session.insert("D", json!({})).unwrap();

    // only one sibling is pulled, the other keeps its peer staged
    assert_eq!(session.evaluate_rule("abc").unwrap().len(), 1);
    assert!(session.scheduler().activations("abd").is_empty());
    let staged = session.staged_left("abd", 1).unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].facts, vec![a, b]);
    assert_eq!(staged[0].staged, StagedType::Insert);

    let pair = |session: &Session| -> Vec<TupleInfo> {
        session
            .left_tuples()
            .unwrap()
            .into_iter()
            .filter(|info| info.facts == vec![a, b])
            .collect()
    };
    let joined = pair(&session);
    assert_eq!(joined.len(), 2, "the join output and its peer");
    assert_eq!(joined[0].context, joined[1].context);
    assert_eq!(joined[0].origin, joined[1].origin);
    assert_ne!(joined[0].sink, joined[1].sink);

    session.update(b, json!({"n": 2})).unwrap();
    let matches = session.evaluate_rule("abc").unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].values[1], json!({"n": 2}));
    let joined = pair(&session);
    assert_eq!(joined.len(), 2);
    assert_eq!(joined[0].context, joined[1].context, "the update restamps every peer");
    let matches = session.evaluate_rule("abd").unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].values[1], json!({"n": 2}));

    session.delete(b).unwrap();
    assert!(session.evaluate_rule("abc").unwrap().is_empty());
    assert!(session.tuples_derived_from(b) > 0, "the other sibling still holds its peer");
    session.evaluate_all().unwrap();
    assert!(session.scheduler().activations("abd").is_empty());
    assert_eq!(session.tuples_derived_from(b), 0);
    assert!(pair(&session).is_empty());
}

#[test]
fn left_chains_carry_one_link_per_bound_fact() {
    let kb = KnowledgeBase::new(EngineConfig::default());
    let by_customer = || PredicateConstraint::field_equals(Declaration::new("c", 0), "id", "customer");
    kb.add_rule(
        RuleDefinition::new("unblocked-orders")
            .when(Condition::pattern(Pattern::new("Customer")))
            .when(Condition::not(Pattern::new("Block"), vec![by_customer()]))
            .when(Condition::join(Pattern::new("Order"), vec![by_customer()])),
    )
    .unwrap();
    let mut session = kb.new_session().unwrap();
    session.insert("Customer", json!({"id": 1})).unwrap();
    session.insert("Customer", json!({"id": 2})).unwrap();
    session.insert("Block", json!({"customer": 2})).unwrap();
    session.insert("Order", json!({"customer": 1})).unwrap();
    session.insert("Order", json!({"customer": 2})).unwrap();
    let matches = session.evaluate_rule("unblocked-orders").unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].values.len(), 2, "the not link binds nothing");

    let tuples = session.left_tuples().unwrap();
    let network = kb.network().unwrap();
    for info in &tuples {
        let node = network.node(info.origin).unwrap();
        assert_eq!(info.objects, node.object_count, "tuple from {} node", node.kind.label());
        assert_eq!(info.objects, info.facts.len());
    }
    let mut lengths: Vec<usize> = tuples.iter().map(|info| info.objects).collect();
    lengths.sort();
    // two roots, one tuple past the not node, one joined pair
    assert_eq!(lengths, vec![1, 1, 1, 2]);
}
