//! Policy model for the Argus authorization search index.
//!
//! # Purpose
//! Defines the wire types shared between the authority client, the index
//! engines and the HTTP surface: subjects, actions, policies, search
//! requests, and the boolean expression language policies carry. Also hosts
//! the expression classifier that decides which engine a policy lands in.
pub mod classify;
pub mod eval;
pub mod expression;
pub mod instance;
pub mod path;
pub mod policy;
pub mod request;

pub use classify::{PolicyClass, classify, split_policies};
pub use expression::{ExprCell, Operator};
pub use instance::InstanceKind;
pub use policy::{Action, Policy, SnapshotRecord, Subject};
pub use request::{Resource, ResourceNode, SearchRequest, SUBJECT_TYPE_ALL};
