//! Reteclad – an incremental production-rule matching network in the Rete/Phreak family.
//!
//! Rules are compiled into a shared network of nodes:
//! * object type and alpha nodes filter facts by type and by single-fact constraints,
//! * join, not, exists and accumulate nodes combine a left chain of tuples with a right input,
//! * terminal nodes hold the complete matches of a rule,
//! * subnetwork adapters feed a nested group of conditions into an outer node.
//!
//! The network is cut into *segments* (runs of nodes shared by the same set of rules)
//! and every rule owns one *path* of segments from a root to its terminal. Each segment
//! memory carries a bitmask with one bit per node that currently has input, and each path
//! memory a bitmask with one bit per fully linked segment. A rule can only match when its
//! path mask is all ones, so rules whose inputs are missing cost nothing.
//!
//! Fact changes are propagated lazily: inserts, updates and deletes stage tuples at the
//! entrance of segments and mark them dirty. Evaluation pulls the staged tuples through a
//! path in segment order, delete first, then update, then insert.
//!
//! ## Modules
//! * [`builder`] – rule definitions and how they are compiled into nodes.
//! * [`network`] – the shared node graph, its segment/path layout and the [`network::KnowledgeBase`].
//! * [`session`] – a working memory over a knowledge base.
//! * [`memory`], [`propagation`], [`evaluator`] – per-partition memories and the algorithms moving tuples through them.
//! * [`accumulate`] – accumulator functions and group bookkeeping.
//! * [`agenda`] – the notifications a session emits and the bundled [`agenda::Agenda`].
//!
//! ## Quick Start
//! ```
//! use reteclad::prelude::*;
//! use serde_json::json;
//!
//! let kb = KnowledgeBase::new(EngineConfig::default());
//! kb.add_rule(
//!     RuleDefinition::new("adult-with-account")
//!         .when(Condition::pattern(Pattern::new("Person")))
//!         .when(Condition::join(
//!             Pattern::new("Account"),
//!             vec![PredicateConstraint::field_equals(Declaration::new("p", 0), "id", "owner")],
//!         )),
//! )
//! .unwrap();
//! let mut session = kb.new_session().unwrap();
//! session.insert("Person", json!({"id": 1})).unwrap();
//! session.insert("Account", json!({"owner": 1})).unwrap();
//! let matches = session.evaluate_rule("adult-with-account").unwrap();
//! assert_eq!(matches.len(), 1);
//! ```

pub mod accumulate;
pub mod agenda;
pub mod builder;
pub mod config;
pub mod constraint;
pub mod error;
pub mod evaluator;
pub mod fact;
pub mod memory;
pub mod network;
pub mod node;
pub mod propagation;
pub mod segment;
pub mod session;
pub mod tuple;

pub mod prelude {
    pub use crate::accumulate::{Accumulator, AccumulateSpec, Average, CollectList, Count, Max, Min, Sum};
    pub use crate::agenda::{Activation, Agenda, MatchEvent, MatchKind, Notification, OperationBoundary, OperationKind, OperationListener, Scheduler};
    pub use crate::builder::{Condition, Pattern, RuleDefinition, Source};
    pub use crate::config::EngineConfig;
    pub use crate::constraint::{AlphaConstraint, BetaConstraint, Bindings, Declaration, EvaluationFailure, PredicateConstraint, TupleFunction};
    pub use crate::error::{ReteError, Result};
    pub use crate::fact::FactId;
    pub use crate::network::KnowledgeBase;
    pub use crate::session::{GroupInfo, Session, TupleInfo};
}
