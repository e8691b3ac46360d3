//! Reconstructs the [`agentflow_core::Scope`] a persisted step needs to
//! re-enter the interpreter, by walking its `container_id` ancestry.
//!
//! The interpreter itself never sees this module: `step()` is pure and takes
//! whatever scope it's handed. Building that scope from storage is the
//! engine's job (interpreter.rs module doc, §4.2), because only the engine
//! knows how to load ancestors and siblings.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use agentflow_core::{eval, FacetKind, ImplicitDecl, Scope, Statement, Step, StepState};
use agentflow_store::Store;
use serde_json::Value;

use crate::error::EngineError;

/// An owned equivalent of [`agentflow_core::Scope`]. The interpreter's
/// `Scope` borrows its `params`/`implicits`; this crate resolves those
/// values from storage first, then borrows from locals just long enough to
/// call `step()`.
pub struct ResolvedScope {
    pub params: Value,
    pub bindings: HashMap<String, Value>,
}

impl ResolvedScope {
    pub fn as_interpreter_scope<'a>(&'a self, implicits: &'a [ImplicitDecl]) -> Scope<'a> {
        let mut scope = Scope::new(&self.params, implicits);
        scope.bindings = self.bindings.clone();
        scope
    }
}

/// A `VariableAssignment` or `Facet` statement binds its own name into the
/// enclosing scope; every other statement kind is anonymous.
fn binding_name(stmt: &Statement) -> Option<&str> {
    match stmt {
        Statement::VariableAssignment { name, .. } => Some(name),
        Statement::Facet { name, .. } => Some(name),
        _ => None,
    }
}

/// Resolve the scope visible to `step` when it is (re-)evaluated.
///
/// Recurses up `container_id` to the root, accumulating named bindings from
/// each ancestor's completed children. Crossing into a `Facet` invocation's
/// own body resets the scope: the callee sees its own evaluated params
/// (`step.params`) and none of the caller's local variables. Crossing an
/// `AndMap` boundary additionally injects `$item`, re-deriving it from the
/// map's `source` expression rather than persisting it separately, since
/// `source` already evaluated successfully once to produce this child.
pub fn resolve_scope<'a, S: Store>(
    store: &'a S,
    step: &'a Step,
    implicits: &'a [ImplicitDecl],
) -> Pin<Box<dyn Future<Output = Result<ResolvedScope, EngineError>> + Send + 'a>> {
    Box::pin(async move {
        let Some(container_id) = step.container_id else {
            return Ok(ResolvedScope {
                params: step.params.clone(),
                bindings: HashMap::new(),
            });
        };

        let parent = store.get_step(container_id).await?;

        let mut resolved = if matches!(parent.statement, Statement::Facet { kind: FacetKind::Facet, .. }) {
            ResolvedScope {
                params: step.params.clone(),
                bindings: HashMap::new(),
            }
        } else {
            resolve_scope(store, &parent, implicits).await?
        };

        if let Statement::AndMap { source, .. } = &parent.statement {
            let source_scope = resolved.as_interpreter_scope(implicits);
            if let Ok(Value::Array(items)) = eval(source, &source_scope) {
                let index: usize = step.statement_id.parse().unwrap_or(0);
                if let Some(item) = items.get(index) {
                    resolved.bindings.insert("$item".to_string(), item.clone());
                }
            }
        }

        let siblings = store.list_steps_for_container(parent.uuid).await?;
        for sibling in &siblings {
            if sibling.uuid == step.uuid || sibling.state != StepState::Completed {
                continue;
            }
            if let Some(name) = binding_name(&sibling.statement) {
                resolved
                    .bindings
                    .insert(name.to_string(), sibling.returns.clone().unwrap_or(Value::Null));
            }
        }

        Ok(resolved)
    })
}
