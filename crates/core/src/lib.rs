//! `leadflow-core`: lead follow-up domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! leads and their follow-up stages, the stage policy table, contact windows,
//! and the `StatusUpdate` contract emitted once per lead per cycle.

pub mod action;
pub mod error;
pub mod id;
pub mod lead;
pub mod policy;
pub mod update;
pub mod window;

pub use action::{Action, ActionKind, ActionPlan};
pub use error::{DomainError, DomainResult};
pub use id::{BatchId, CycleId, LeadId};
pub use lead::{Channel, Lead, Stage};
pub use policy::{FailureTransition, StagePolicy, StageRule, SuccessTransition};
pub use update::{Outcome, StatusUpdate, UpdateKey};
pub use window::ContactWindow;
