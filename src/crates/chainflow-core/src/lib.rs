//! # chainflow-core - Deterministic workflow execution for blockchain operations
//!
//! A declarative workflow - a DAG of read and write nodes targeting EVM and
//! Solana chains - goes in; a reproducible, checkpointable event stream
//! comes out. Every node's inputs are lazy [`ValueRef`] expressions resolved
//! against a mutable [`RuntimeTree`]; writes are gated through policy before
//! they reach an executor; all arithmetic is exact big-integer / terminating
//! decimal, so the same plan over the same inputs always produces the same
//! stream.
//!
//! ## Pipeline
//!
//! ```text
//!              ┌──────────────────────────────────────────┐
//!              │           Engine (scheduler)             │
//!              │  declared-order scan · concurrency caps  │
//!              │  until/retry · pause/resume · checkpoint │
//!              └───────┬──────────────┬───────────────┬───┘
//!                      │              │               │
//!              ┌───────▼────┐  ┌──────▼──────┐  ┌─────▼─────┐
//!              │ Readiness  │  │  Compilers  │  │  Policy   │
//!              │ + Solver   │  │  EVM/Solana │  │  gate     │
//!              └───────┬────┘  └──────┬──────┘  └─────┬─────┘
//!                      │              │               │
//!              ┌───────▼──────────────▼───────────────▼───┐
//!              │   ValueRef resolver · CEL evaluator      │
//!              │   RuntimeTree + guarded patches          │
//!              └──────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use chainflow_core::{Engine, EngineConfig, ExecutionPlan, RuntimeTree};
//! use futures::StreamExt;
//!
//! let engine = Engine::new(plan, RuntimeTree::new(), EngineConfig::default())
//!     .with_executor(my_executor)
//!     .with_solver(my_solver)
//!     .with_checkpoint_store(store);
//!
//! let stream = engine.run();
//! futures::pin_mut!(stream);
//! while let Some(event) = stream.next().await {
//!     println!("{}", event.kind());
//! }
//! ```
//!
//! ## Module map
//!
//! - [`value`] - the closed runtime value sum type (no floats, ever)
//! - [`cel`] - the typed expression subset with token-amount builtins
//! - [`valueref`] - lazy references (`lit`/`ref`/`object`/`array`/`cel`/`detect`)
//! - [`runtime`] - the state tree and guarded `set`/`merge`/`delete` patches
//! - [`plan`] / [`catalog`] - the plan data model and action arena
//! - [`readiness`] / [`solver`] - blocked-node diagnosis and repair
//! - [`compile`] - pure plan-node to chain-request transforms
//! - [`policy`] - the write gate and hashable confirmation summaries
//! - [`engine`] / [`events`] - the scheduler and its event stream
//! - [`executor`] / [`trace`] - the external collaborator seams
//!
//! Checkpoint persistence and the tagged JSON codec live in
//! [`chainflow_checkpoint`]; exact decimal arithmetic lives in
//! [`chainflow_decimal`].

pub mod catalog;
pub mod cel;
pub mod compile;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod plan;
pub mod policy;
pub mod readiness;
pub mod runtime;
pub mod solver;
pub mod trace;
pub mod value;
pub mod valueref;

pub use catalog::{ActionCatalog, ActionDef, CalculatedField};
pub use engine::{Engine, EngineConfig, RunOutcome};
pub use error::{CompileError, EngineError, EvalError, EvalErrorKind, ExecutorError, Result};
pub use events::{EngineEvent, PausedNode};
pub use executor::{Executor, ExecutorContext, ExecutorOutcome};
pub use plan::{
    AccountSpec, EvmCallTarget, ExecutionPlan, ExecutionSpec, NodeSource, PlanNode, PlanNodeKind,
    RetrySpec, WriteMode, WriteSpec,
};
pub use policy::{GateDecision, GateInput, PolicyPack, RiskLevel, WritePreview};
pub use readiness::{compute_readiness, compute_readiness_async, Readiness, ReadyState};
pub use runtime::{Patch, PatchGuard, PatchOp, PatchOutcome, RuntimeTree};
pub use solver::{CalculatedFieldSolver, CannotSolve, NeedUserConfirm, SolveContext, SolveOutcome, Solver};
pub use trace::{NoopTraceSink, TraceKind, TraceRecord, TraceSink};
pub use value::Value;
pub use valueref::{
    evaluate_value_ref, evaluate_value_ref_async, DetectResolver, DetectSpec, EvalContext,
    ValueRef,
};

// Re-export the sibling crates so embedders need only one dependency.
pub use chainflow_checkpoint;
pub use chainflow_decimal;
