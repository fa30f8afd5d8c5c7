//! Small demonstration of the matching network.
//!
//! Loads settings from `reteclad.*` (if present) and `RETECLAD_*`, builds a
//! few rules over orders and customers, feeds some facts through a session
//! and prints the resulting matches as JSON lines.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reteclad::prelude::*;

fn rules() -> Vec<RuleDefinition> {
    let customer = Declaration::new("customer", 0);
    let owns = PredicateConstraint::field_equals(customer.clone(), "id", "customer");
    let vip = AlphaConstraint::field_equals("tier", json!("vip"));
    let revenue = Arc::new(
        AccumulateSpec::new(Arc::new(Sum))
            .with_constraint(Arc::clone(&owns))
            .extracting(TupleFunction::right_field("amount")),
    );
    let per_status = Arc::new(
        AccumulateSpec::new(Arc::new(Count))
            .with_constraint(Arc::clone(&owns))
            .grouped_by(TupleFunction::right_field("status")),
    );
    vec![
        RuleDefinition::new("vip-with-orders")
            .when(Condition::pattern(Pattern::new("Customer").filter(Arc::clone(&vip))))
            .when(Condition::exists(Pattern::new("Order"), vec![Arc::clone(&owns)])),
        RuleDefinition::new("customer-without-orders")
            .when(Condition::pattern(Pattern::new("Customer")))
            .when(Condition::not(Pattern::new("Order"), vec![Arc::clone(&owns)])),
        RuleDefinition::new("revenue-per-customer")
            .when(Condition::pattern(Pattern::new("Customer")))
            .when(Condition::accumulate(Pattern::new("Order"), revenue)),
        RuleDefinition::new("orders-per-status")
            .when(Condition::pattern(Pattern::new("Customer")))
            .when(Condition::accumulate(Pattern::new("Order"), per_status))
            .data_driven(),
    ]
}

fn run(config: EngineConfig) -> Result<()> {
    let kb = KnowledgeBase::new(config);
    for rule in rules() {
        kb.add_rule(rule)?;
    }
    let mut session = kb.new_session()?;
    let ada = session.insert("Customer", json!({"id": 1, "name": "Ada", "tier": "vip"}))?;
    session.insert("Customer", json!({"id": 2, "name": "Brendan", "tier": "basic"}))?;
    let first = session.insert("Order", json!({"customer": 1, "amount": 120, "status": "open"}))?;
    session.insert("Order", json!({"customer": 1, "amount": 80, "status": "shipped"}))?;
    session.insert("Order", json!({"customer": 2, "amount": 15, "status": "open"}))?;
    session.update(first, json!({"customer": 1, "amount": 150, "status": "shipped"}))?;

    let evaluated = session.evaluate_all()?;
    info!(evaluated, facts = session.fact_count(), "initial facts evaluated");
    report(&session);

    session.delete(ada)?;
    session.evaluate_all()?;
    info!(facts = session.fact_count(), "after deleting {ada}");
    report(&session);

    session.dispose();
    Ok(())
}

fn report(session: &Session) {
    for rule in ["vip-with-orders", "customer-without-orders", "revenue-per-customer", "orders-per-status"] {
        for activation in session.scheduler().activations(rule) {
            println!("{}", json!({ "rule": rule, "activation": activation }));
        }
    }
}

fn main() {
    let config = match EngineConfig::load(Some("reteclad")) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("falling back to default settings: {e}");
            EngineConfig::default()
        }
    };
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    if let Err(e) = run(config) {
        warn!(error = %e, "demo aborted");
        std::process::exit(1);
    }
}
