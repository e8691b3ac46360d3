//! The compiled declaration tree consumed by the interpreter
//!
//! The engine never parses AFL source. It consumes a JSON declaration tree
//! shaped as `{type:"Program", declarations:[...]}`; see [`crate::normalize`]
//! for acceptance of the legacy categorized-keys shape.

use serde::{Deserialize, Serialize};

/// An expression evaluated against the four binding scopes: step-local
/// variables, runner parameters (`$`), sibling step outputs reachable by
/// path, and implicit defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    /// A literal JSON value
    Literal { value: serde_json::Value },

    /// A bare name reference, resolved against step-local variables first
    Name { name: String },

    /// A dotted path reference, e.g. `research.report`
    Path { segments: Vec<String> },

    /// Reference into the runner's own parameters (`$.field`)
    Param { segments: Vec<String> },
}

impl Expr {
    pub fn literal(value: serde_json::Value) -> Self {
        Expr::Literal { value }
    }

    pub fn name(name: impl Into<String>) -> Self {
        Expr::Name { name: name.into() }
    }

    pub fn path(segments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Expr::Path {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }
}

/// The kind of a `Facet` statement: synchronous (in-process) or delegated
/// to an external agent via the task queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FacetKind {
    Facet,
    EventFacet,
}

/// One statement instance in the declaration tree.
///
/// This is a single tagged-variant enum: there is no per-container Rust
/// type and no inheritance chain. The interpreter's `step` function matches
/// over this enum directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Statement {
    /// Bind a name to an expression value in the step's scope
    VariableAssignment { name: String, expr: Expr },

    /// Invoke a facet or event facet
    Facet {
        name: String,
        kind: FacetKind,
        topic: Option<String>,
        params: Vec<(String, Expr)>,
    },

    /// Ordered sequence; advances one child at a time
    AndThen { children: Vec<Statement> },

    /// Fan-out over a collection expression; children run concurrently
    AndMap { source: Expr, child: Box<Statement> },

    /// Conditional branching over a discriminator expression
    AndMatch {
        discriminant: Expr,
        arms: Vec<(serde_json::Value, Statement)>,
    },
}

impl Statement {
    /// A stable key identifying this statement within its containing block,
    /// used to correlate persisted steps back to declaration-tree nodes.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Statement::VariableAssignment { .. } => "variable_assignment",
            Statement::Facet { .. } => "facet",
            Statement::AndThen { .. } => "and_then",
            Statement::AndMap { .. } => "and_map",
            Statement::AndMatch { .. } => "and_match",
        }
    }
}

/// A facet declaration: a typed structure of parameters and returns,
/// synchronously computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacetDecl {
    pub name: String,
    pub params: Vec<String>,
    pub returns: Vec<String>,
    pub body: Statement,
}

/// An event facet declaration: a facet whose execution is delegated to an
/// external agent via the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFacetDecl {
    pub name: String,
    pub topic: String,
    pub params: Vec<String>,
    pub returns: Vec<String>,
}

/// A facet marked as a workflow entry point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDecl {
    pub name: String,
    pub facet: String,
}

/// A default value supplied when a parameter path is otherwise unbound
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplicitDecl {
    pub path: Vec<String>,
    pub default: serde_json::Value,
}

/// A named type shape, used only for parameter/return validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDecl {
    pub name: String,
    pub fields: Vec<(String, String)>,
}

/// One top-level (or namespace-nested) declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Declaration {
    Namespace(Namespace),
    FacetDecl(FacetDecl),
    EventFacetDecl(EventFacetDecl),
    WorkflowDecl(WorkflowDecl),
    ImplicitDecl(ImplicitDecl),
    SchemaDecl(SchemaDecl),
}

/// A namespace recursively containing its own declarations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub declarations: Vec<Declaration>,
}

/// The root of a compiled declaration tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub declarations: Vec<Declaration>,
}

impl Program {
    /// Find a workflow's starting facet by name, searching namespaces
    /// recursively.
    pub fn find_workflow(&self, name: &str) -> Option<(&WorkflowDecl, &FacetDecl)> {
        fn search<'a>(
            decls: &'a [Declaration],
            name: &str,
        ) -> Option<(&'a WorkflowDecl, &'a FacetDecl)> {
            let mut workflow = None;
            let mut facets = Vec::new();
            for decl in decls {
                match decl {
                    Declaration::WorkflowDecl(w) if w.name == name => workflow = Some(w),
                    Declaration::FacetDecl(f) => facets.push(f),
                    Declaration::Namespace(ns) => {
                        if let Some(found) = search(&ns.declarations, name) {
                            return Some(found);
                        }
                    }
                    _ => {}
                }
            }
            let workflow = workflow?;
            facets
                .into_iter()
                .find(|f| f.name == workflow.facet)
                .map(|f| (workflow, f))
        }
        search(&self.declarations, name)
    }

    /// Collect every `ImplicitDecl` in the program, searching namespaces
    /// recursively.
    pub fn implicits(&self) -> Vec<&ImplicitDecl> {
        fn collect<'a>(decls: &'a [Declaration], out: &mut Vec<&'a ImplicitDecl>) {
            for decl in decls {
                match decl {
                    Declaration::ImplicitDecl(i) => out.push(i),
                    Declaration::Namespace(ns) => collect(&ns.declarations, out),
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.declarations, &mut out);
        out
    }
}
