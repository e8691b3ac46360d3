//! The pure interpreter: `step(cursor, snapshot) -> Vec<Action>`
//!
//! This module owns no mutable state and performs no I/O. The caller (the
//! step state machine in `agentflow-engine`) is responsible for building the
//! [`Scope`] from completed sibling steps, applying the returned [`Action`]s
//! through the persistence layer, and calling `step` again once a child's
//! outcome is recorded. Given the same declaration tree, the same runner
//! parameters, and the same recorded step outputs, `step` always returns the
//! same actions — this is what makes crash recovery safe (§4.2).

use std::collections::HashMap;

use serde_json::Value;

use crate::ast::{Expr, FacetKind, ImplicitDecl, Program, Statement};
use crate::error::AflError;

/// The four binding scopes an [`Expr`] resolves against, in lookup order:
/// step-local variables, runner parameters (`$`), sibling step outputs
/// reachable by path, and implicit defaults.
#[derive(Debug, Clone, Default)]
pub struct Scope<'a> {
    /// Step-local variables and completed sibling outputs, keyed by the
    /// bound name (a `VariableAssignment`'s `name`, or a `Facet`'s `name`).
    pub bindings: HashMap<String, Value>,
    /// The runner's own parameters, resolved via `$`.
    pub params: &'a Value,
    /// Implicit defaults supplied when a path is otherwise unbound.
    pub implicits: &'a [ImplicitDecl],
}

impl<'a> Scope<'a> {
    pub fn new(params: &'a Value, implicits: &'a [ImplicitDecl]) -> Self {
        Self {
            bindings: HashMap::new(),
            params,
            implicits,
        }
    }

    pub fn with_binding(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }

    fn lookup_path(&self, segments: &[String]) -> Option<Value> {
        let (head, rest) = segments.split_first()?;
        let mut current = self.bindings.get(head)?.clone();
        for segment in rest {
            current = current.get(segment)?.clone();
        }
        Some(current)
    }

    fn lookup_implicit(&self, segments: &[String]) -> Option<Value> {
        self.implicits
            .iter()
            .find(|i| i.path == segments)
            .map(|i| i.default.clone())
    }
}

/// Evaluate an expression against a [`Scope`].
///
/// An unbound path fails with `Error(kind = reference)` (spec §4.2).
pub fn eval(expr: &Expr, scope: &Scope) -> Result<Value, AflError> {
    match expr {
        Expr::Literal { value } => Ok(value.clone()),
        Expr::Name { name } => scope
            .lookup_path(std::slice::from_ref(name))
            .or_else(|| scope.lookup_implicit(std::slice::from_ref(name)))
            .ok_or_else(|| AflError::reference(format!("unbound name: {name}"))),
        Expr::Path { segments } => scope
            .lookup_path(segments)
            .or_else(|| scope.lookup_implicit(segments))
            .ok_or_else(|| AflError::reference(format!("unbound path: {}", segments.join(".")))),
        Expr::Param { segments } => {
            let mut current = scope.params.clone();
            for segment in segments {
                current = current
                    .get(segment)
                    .cloned()
                    .ok_or_else(|| AflError::reference(format!("unbound param: $.{}", segments.join("."))))?;
            }
            Ok(current)
        }
    }
}

/// Evaluate a facet's parameter expressions into a single params object.
fn eval_params(params: &[(String, Expr)], scope: &Scope) -> Result<Value, AflError> {
    let mut out = serde_json::Map::new();
    for (name, expr) in params {
        out.insert(name.clone(), eval(expr, scope)?);
    }
    Ok(Value::Object(out))
}

/// The outcome of a single already-materialized child step, as observed by
/// the interpreter when re-evaluating its container.
#[derive(Debug, Clone)]
pub struct ChildOutcome {
    /// The child's position among its container's children, in source order.
    pub index: usize,
    pub completed: bool,
    pub failed: bool,
    pub cancelled: bool,
    pub returns: Option<Value>,
    pub error: Option<AflError>,
}

impl ChildOutcome {
    pub fn is_terminal(&self) -> bool {
        self.completed || self.failed || self.cancelled
    }
}

/// One action the caller must apply through the persistence layer.
///
/// There is deliberately no fifth "advance" action distinct from these: the
/// interpreter's entire vocabulary is create-child-step, emit-event,
/// mark-complete, yield-outputs, fail (spec §4.2).
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Materialize a new child step at `index` with the given evaluated
    /// parameters.
    CreateChildStep {
        index: usize,
        statement: Statement,
        params: Value,
    },
    /// Hand an event-facet step off to the dispatcher.
    EmitEvent {
        topic: String,
        handler: String,
        params: Value,
    },
    /// The current step is done; record `returns` and let the parent
    /// container re-evaluate.
    MarkComplete { returns: Value },
    /// The current step is the runner's starting step and has completed:
    /// `returns` becomes the runner's final output.
    YieldOutputs { outputs: Value },
    /// The current step has failed.
    Fail { error: AflError },
}

/// A cursor into the declaration tree: the statement currently being
/// evaluated, plus the program it was found in (so `Facet` invocations can
/// resolve the callee's body).
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    pub program: &'a Program,
    pub statement: &'a Statement,
    /// True when `statement` is the runner's starting step; its completion
    /// yields the runner's final outputs rather than merely completing.
    pub is_root: bool,
}

/// Find a facet declaration by name anywhere in the program (top-level or
/// nested in a namespace).
pub fn find_facet<'a>(program: &'a Program, name: &str) -> Option<&'a crate::ast::FacetDecl> {
    use crate::ast::Declaration;

    fn search<'a>(decls: &'a [Declaration], name: &str) -> Option<&'a crate::ast::FacetDecl> {
        for decl in decls {
            match decl {
                Declaration::FacetDecl(f) if f.name == name => return Some(f),
                Declaration::Namespace(ns) => {
                    if let Some(found) = search(&ns.declarations, name) {
                        return Some(found);
                    }
                }
                _ => {}
            }
        }
        None
    }
    search(&program.declarations, name)
}

fn complete_or_yield(is_root: bool, returns: Value) -> Action {
    if is_root {
        Action::YieldOutputs { outputs: returns }
    } else {
        Action::MarkComplete { returns }
    }
}

/// The pure step function: given the current statement and the outcomes of
/// its already-created children, produce the next actions.
///
/// `children` must be supplied in source order and reflect every child
/// created so far for this statement; an empty slice means no children have
/// been created yet.
pub fn step(cursor: Cursor<'_>, scope: &Scope<'_>, children: &[ChildOutcome]) -> Vec<Action> {
    match cursor.statement {
        Statement::VariableAssignment { expr, .. } => match eval(expr, scope) {
            Ok(value) => vec![complete_or_yield(cursor.is_root, value)],
            Err(error) => vec![Action::Fail { error }],
        },

        Statement::Facet {
            name,
            kind,
            topic,
            params,
        } => {
            let evaluated = match eval_params(params, scope) {
                Ok(v) => v,
                Err(error) => return vec![Action::Fail { error }],
            };

            match kind {
                FacetKind::EventFacet => {
                    let topic = topic.clone().unwrap_or_else(|| name.clone());
                    vec![Action::EmitEvent {
                        topic,
                        handler: name.clone(),
                        params: evaluated,
                    }]
                }
                FacetKind::Facet => {
                    if let Some(outcome) = children.first() {
                        if outcome.completed {
                            vec![complete_or_yield(
                                cursor.is_root,
                                outcome.returns.clone().unwrap_or(Value::Null),
                            )]
                        } else if outcome.failed {
                            vec![Action::Fail {
                                error: outcome
                                    .error
                                    .clone()
                                    .unwrap_or_else(|| AflError::internal("facet child failed without error")),
                            }]
                        } else {
                            Vec::new()
                        }
                    } else {
                        match find_facet(cursor.program, name) {
                            Some(facet) => vec![Action::CreateChildStep {
                                index: 0,
                                statement: facet.body.clone(),
                                params: evaluated,
                            }],
                            None => vec![Action::Fail {
                                error: AflError::reference(format!("unknown facet: {name}")),
                            }],
                        }
                    }
                }
            }
        }

        Statement::AndThen { children: decls } => {
            if decls.is_empty() {
                return vec![complete_or_yield(cursor.is_root, Value::Null)];
            }

            if let Some(last) = children.last() {
                if last.failed {
                    return vec![Action::Fail {
                        error: last
                            .error
                            .clone()
                            .unwrap_or_else(|| AflError::internal("and_then child failed without error")),
                    }];
                }
                if !last.completed {
                    // still waiting on the in-flight child
                    return Vec::new();
                }
            }

            let next_index = children.len();
            if next_index < decls.len() {
                vec![Action::CreateChildStep {
                    index: next_index,
                    statement: decls[next_index].clone(),
                    params: Value::Null,
                }]
            } else {
                let returns = children
                    .last()
                    .and_then(|c| c.returns.clone())
                    .unwrap_or(Value::Null);
                vec![complete_or_yield(cursor.is_root, returns)]
            }
        }

        Statement::AndMap { source, child } => {
            let items = match eval(source, scope) {
                Ok(Value::Array(items)) => items,
                Ok(other) => {
                    return vec![Action::Fail {
                        error: AflError::validation(format!(
                            "and_map source must evaluate to an array, got {other}"
                        )),
                    }]
                }
                Err(error) => return vec![Action::Fail { error }],
            };

            if items.is_empty() {
                return vec![complete_or_yield(cursor.is_root, Value::Array(vec![]))];
            }

            // fail-fast: the first failed child fails the whole AndMap
            if let Some(failed) = children.iter().find(|c| c.failed) {
                return vec![Action::Fail {
                    error: failed
                        .error
                        .clone()
                        .unwrap_or_else(|| AflError::internal("and_map child failed without error")),
                }];
            }

            if children.len() < items.len() {
                let mut actions = Vec::new();
                for (index, item) in items.iter().enumerate().skip(children.len()) {
                    let mut item_scope = scope.clone();
                    item_scope.bindings.insert("$item".to_string(), item.clone());
                    let params = match child.as_ref() {
                        Statement::Facet { params, .. } => eval_params(params, &item_scope),
                        _ => Ok(Value::Null),
                    };
                    match params {
                        Ok(params) => actions.push(Action::CreateChildStep {
                            index,
                            statement: (**child).clone(),
                            params,
                        }),
                        Err(error) => return vec![Action::Fail { error }],
                    }
                }
                return actions;
            }

            if children.iter().all(|c| c.completed) {
                let mut ordered: Vec<&ChildOutcome> = children.iter().collect();
                ordered.sort_by_key(|c| c.index);
                let results: Vec<Value> = ordered
                    .into_iter()
                    .map(|c| c.returns.clone().unwrap_or(Value::Null))
                    .collect();
                vec![complete_or_yield(cursor.is_root, Value::Array(results))]
            } else {
                Vec::new()
            }
        }

        Statement::AndMatch { discriminant, arms } => {
            let value = match eval(discriminant, scope) {
                Ok(v) => v,
                Err(error) => return vec![Action::Fail { error }],
            };

            let arm = arms.iter().find(|(pattern, _)| *pattern == value);
            let (_, statement) = match arm {
                Some(a) => a,
                None => {
                    return vec![Action::Fail {
                        error: AflError::reference(format!("no and_match arm for {value}")),
                    }]
                }
            };

            if let Some(outcome) = children.first() {
                if outcome.completed {
                    vec![complete_or_yield(
                        cursor.is_root,
                        outcome.returns.clone().unwrap_or(Value::Null),
                    )]
                } else if outcome.failed {
                    vec![Action::Fail {
                        error: outcome
                            .error
                            .clone()
                            .unwrap_or_else(|| AflError::internal("and_match child failed without error")),
                    }]
                } else {
                    Vec::new()
                }
            } else {
                vec![Action::CreateChildStep {
                    index: 0,
                    statement: statement.clone(),
                    params: Value::Null,
                }]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Declaration;
    use serde_json::json;

    fn empty_program() -> Program {
        Program { declarations: vec![] }
    }

    #[test]
    fn test_eval_param_path() {
        let params = json!({"n": 41});
        let scope = Scope::new(&params, &[]);
        let value = eval(
            &Expr::Param {
                segments: vec!["n".to_string()],
            },
            &scope,
        )
        .unwrap();
        assert_eq!(value, json!(41));
    }

    #[test]
    fn test_eval_unbound_name_is_reference_error() {
        let params = json!({});
        let scope = Scope::new(&params, &[]);
        let err = eval(&Expr::name("missing"), &scope).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Reference);
    }

    #[test]
    fn test_eval_sibling_path() {
        let params = json!({});
        let scope = Scope::new(&params, &[])
            .with_binding("research", json!({"report": "ok"}));
        let value = eval(&Expr::path(["research", "report"]), &scope).unwrap();
        assert_eq!(value, json!("ok"));
    }

    #[test]
    fn test_eval_implicit_default() {
        let params = json!({});
        let implicits = vec![ImplicitDecl {
            path: vec!["persona".to_string()],
            default: json!("assistant"),
        }];
        let scope = Scope::new(&params, &implicits);
        let value = eval(&Expr::name("persona"), &scope).unwrap();
        assert_eq!(value, json!("assistant"));
    }

    #[test]
    fn test_variable_assignment_completes_immediately() {
        let program = empty_program();
        let stmt = Statement::VariableAssignment {
            name: "x".into(),
            expr: Expr::literal(json!(42)),
        };
        let params = json!({});
        let scope = Scope::new(&params, &[]);
        let cursor = Cursor {
            program: &program,
            statement: &stmt,
            is_root: false,
        };
        let actions = step(cursor, &scope, &[]);
        assert_eq!(actions, vec![Action::MarkComplete { returns: json!(42) }]);
    }

    #[test]
    fn test_event_facet_emits_event() {
        let program = empty_program();
        let stmt = Statement::Facet {
            name: "IncrementEvent".into(),
            kind: FacetKind::EventFacet,
            topic: Some("increment".into()),
            params: vec![(
                "n".into(),
                Expr::Param {
                    segments: vec!["n".to_string()],
                },
            )],
        };
        let params = json!({"n": 41});
        let scope = Scope::new(&params, &[]);
        let cursor = Cursor {
            program: &program,
            statement: &stmt,
            is_root: false,
        };
        let actions = step(cursor, &scope, &[]);
        assert_eq!(
            actions,
            vec![Action::EmitEvent {
                topic: "increment".into(),
                handler: "IncrementEvent".into(),
                params: json!({"n": 41}),
            }]
        );
    }

    #[test]
    fn test_and_then_advances_one_child_at_a_time() {
        let program = empty_program();
        let decls = vec![
            Statement::VariableAssignment {
                name: "a".into(),
                expr: Expr::literal(json!(1)),
            },
            Statement::VariableAssignment {
                name: "b".into(),
                expr: Expr::literal(json!(2)),
            },
        ];
        let stmt = Statement::AndThen {
            children: decls.clone(),
        };
        let params = json!({});
        let scope = Scope::new(&params, &[]);
        let cursor = Cursor {
            program: &program,
            statement: &stmt,
            is_root: false,
        };

        // No children yet: create the first one.
        let actions = step(cursor, &scope, &[]);
        assert_eq!(
            actions,
            vec![Action::CreateChildStep {
                index: 0,
                statement: decls[0].clone(),
                params: Value::Null,
            }]
        );

        // First child completed: create the second one.
        let children = vec![ChildOutcome {
            index: 0,
            completed: true,
            failed: false,
            cancelled: false,
            returns: Some(json!(1)),
            error: None,
        }];
        let actions = step(cursor, &scope, &children);
        assert_eq!(
            actions,
            vec![Action::CreateChildStep {
                index: 1,
                statement: decls[1].clone(),
                params: Value::Null,
            }]
        );

        // Both children completed: mark the container complete with the
        // last child's output.
        let children = vec![
            ChildOutcome {
                index: 0,
                completed: true,
                failed: false,
                cancelled: false,
                returns: Some(json!(1)),
                error: None,
            },
            ChildOutcome {
                index: 1,
                completed: true,
                failed: false,
                cancelled: false,
                returns: Some(json!(2)),
                error: None,
            },
        ];
        let actions = step(cursor, &scope, &children);
        assert_eq!(actions, vec![Action::MarkComplete { returns: json!(2) }]);
    }

    #[test]
    fn test_and_then_propagates_child_failure() {
        let program = empty_program();
        let decls = vec![Statement::VariableAssignment {
            name: "a".into(),
            expr: Expr::literal(json!(1)),
        }];
        let stmt = Statement::AndThen { children: decls };
        let params = json!({});
        let scope = Scope::new(&params, &[]);
        let cursor = Cursor {
            program: &program,
            statement: &stmt,
            is_root: false,
        };
        let children = vec![ChildOutcome {
            index: 0,
            completed: false,
            failed: true,
            cancelled: false,
            returns: None,
            error: Some(AflError::agent("boom")),
        }];
        let actions = step(cursor, &scope, &children);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::Fail { .. }));
    }

    #[test]
    fn test_and_then_root_yields_outputs() {
        let program = empty_program();
        let decls = vec![Statement::VariableAssignment {
            name: "a".into(),
            expr: Expr::literal(json!(42)),
        }];
        let stmt = Statement::AndThen {
            children: decls.clone(),
        };
        let params = json!({});
        let scope = Scope::new(&params, &[]);
        let cursor = Cursor {
            program: &program,
            statement: &stmt,
            is_root: true,
        };
        let children = vec![ChildOutcome {
            index: 0,
            completed: true,
            failed: false,
            cancelled: false,
            returns: Some(json!(42)),
            error: None,
        }];
        let actions = step(cursor, &scope, &children);
        assert_eq!(
            actions,
            vec![Action::YieldOutputs {
                outputs: json!(42)
            }]
        );
    }

    #[test]
    fn test_and_map_empty_collection_completes_immediately() {
        let program = empty_program();
        let stmt = Statement::AndMap {
            source: Expr::literal(json!([])),
            child: Box::new(Statement::VariableAssignment {
                name: "x".into(),
                expr: Expr::name("$item"),
            }),
        };
        let params = json!({});
        let scope = Scope::new(&params, &[]);
        let cursor = Cursor {
            program: &program,
            statement: &stmt,
            is_root: false,
        };
        let actions = step(cursor, &scope, &[]);
        assert_eq!(
            actions,
            vec![Action::MarkComplete {
                returns: Value::Array(vec![])
            }]
        );
    }

    #[test]
    fn test_and_map_fans_out_then_preserves_order() {
        let program = empty_program();
        let stmt = Statement::AndMap {
            source: Expr::literal(json!(["A", "B", "C"])),
            child: Box::new(Statement::Facet {
                name: "Review".into(),
                kind: FacetKind::EventFacet,
                topic: Some("review".into()),
                params: vec![("persona".into(), Expr::name("$item"))],
            }),
        };
        let params = json!({});
        let scope = Scope::new(&params, &[]);
        let cursor = Cursor {
            program: &program,
            statement: &stmt,
            is_root: false,
        };

        let actions = step(cursor, &scope, &[]);
        assert_eq!(actions.len(), 3);

        // Agents reply out of order (B, C, A); the assembled result
        // preserves source order.
        let children = vec![
            ChildOutcome {
                index: 1,
                completed: true,
                failed: false,
                cancelled: false,
                returns: Some(json!("B-review")),
                error: None,
            },
            ChildOutcome {
                index: 2,
                completed: true,
                failed: false,
                cancelled: false,
                returns: Some(json!("C-review")),
                error: None,
            },
            ChildOutcome {
                index: 0,
                completed: true,
                failed: false,
                cancelled: false,
                returns: Some(json!("A-review")),
                error: None,
            },
        ];
        let actions = step(cursor, &scope, &children);
        assert_eq!(
            actions,
            vec![Action::MarkComplete {
                returns: json!(["A-review", "B-review", "C-review"])
            }]
        );
    }

    #[test]
    fn test_and_map_fail_fast() {
        let program = empty_program();
        let stmt = Statement::AndMap {
            source: Expr::literal(json!(["A", "B"])),
            child: Box::new(Statement::Facet {
                name: "Review".into(),
                kind: FacetKind::EventFacet,
                topic: None,
                params: vec![],
            }),
        };
        let params = json!({});
        let scope = Scope::new(&params, &[]);
        let cursor = Cursor {
            program: &program,
            statement: &stmt,
            is_root: false,
        };
        let children = vec![
            ChildOutcome {
                index: 0,
                completed: false,
                failed: true,
                cancelled: false,
                returns: None,
                error: Some(AflError::agent("refused")),
            },
            ChildOutcome {
                index: 1,
                completed: false,
                failed: false,
                cancelled: false,
                returns: None,
                error: None,
            },
        ];
        let actions = step(cursor, &scope, &children);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::Fail { .. }));
    }

    #[test]
    fn test_and_match_selects_arm_and_descends() {
        let program = empty_program();
        let stmt = Statement::AndMatch {
            discriminant: Expr::literal(json!("B")),
            arms: vec![
                (
                    json!("A"),
                    Statement::VariableAssignment {
                        name: "out".into(),
                        expr: Expr::literal(json!("chose-a")),
                    },
                ),
                (
                    json!("B"),
                    Statement::VariableAssignment {
                        name: "out".into(),
                        expr: Expr::literal(json!("chose-b")),
                    },
                ),
            ],
        };
        let params = json!({});
        let scope = Scope::new(&params, &[]);
        let cursor = Cursor {
            program: &program,
            statement: &stmt,
            is_root: false,
        };
        let actions = step(cursor, &scope, &[]);
        assert_eq!(
            actions,
            vec![Action::CreateChildStep {
                index: 0,
                statement: Statement::VariableAssignment {
                    name: "out".into(),
                    expr: Expr::literal(json!("chose-b")),
                },
                params: Value::Null,
            }]
        );
    }

    #[test]
    fn test_and_match_no_arm_fails_with_reference_error() {
        let program = empty_program();
        let stmt = Statement::AndMatch {
            discriminant: Expr::literal(json!("Z")),
            arms: vec![(
                json!("A"),
                Statement::VariableAssignment {
                    name: "out".into(),
                    expr: Expr::literal(json!(1)),
                },
            )],
        };
        let params = json!({});
        let scope = Scope::new(&params, &[]);
        let cursor = Cursor {
            program: &program,
            statement: &stmt,
            is_root: false,
        };
        let actions = step(cursor, &scope, &[]);
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            Action::Fail { error } if error.kind == crate::error::ErrorKind::Reference
        ));
    }

    #[test]
    fn test_facet_resolves_body_from_program() {
        let inner_body = Statement::VariableAssignment {
            name: "m".into(),
            expr: Expr::literal(json!(1)),
        };
        let program = Program {
            declarations: vec![Declaration::FacetDecl(crate::ast::FacetDecl {
                name: "Inner".into(),
                params: vec![],
                returns: vec!["m".into()],
                body: inner_body.clone(),
            })],
        };
        let stmt = Statement::Facet {
            name: "Inner".into(),
            kind: FacetKind::Facet,
            topic: None,
            params: vec![],
        };
        let params = json!({});
        let scope = Scope::new(&params, &[]);
        let cursor = Cursor {
            program: &program,
            statement: &stmt,
            is_root: false,
        };
        let actions = step(cursor, &scope, &[]);
        assert_eq!(
            actions,
            vec![Action::CreateChildStep {
                index: 0,
                statement: inner_body,
                params: json!({}),
            }]
        );
    }
}
