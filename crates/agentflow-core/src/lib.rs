//! Pure data model, declaration-tree AST, and interpreter for AgentFlow.
//!
//! This crate performs no I/O: no database, no network, no clock reads
//! beyond what callers pass in. Every type here is unit-testable on its own,
//! which is what makes the interpreter's determinism guarantee checkable
//! without standing up a Postgres instance.

pub mod ast;
pub mod error;
pub mod interpreter;
pub mod model;
pub mod normalize;

pub use ast::{
    Declaration, EventFacetDecl, Expr, FacetDecl, FacetKind, ImplicitDecl, Namespace, Program,
    SchemaDecl, Statement, WorkflowDecl,
};
pub use error::{AflError, ErrorKind};
pub use interpreter::{eval, find_facet, step, Action, ChildOutcome, Cursor, Scope};
pub use model::{
    Event, EventPurpose, Flow, Lock, LockStatus, Log, LogOriginator, LogSeverity, RecordState,
    Runner, RunnerState, Server, ServerStatus, Step, StepState, Task, Workflow,
};
pub use normalize::normalize;
