//! Abstract syntax of the policy language.
//!
//! Every node carries the [`Span`] of its source extent; compile errors and
//! violation provenance both lean on it.

use std::fmt;

use crate::token::Span;

/// A parsed policy file: imports, predicate definitions, rules.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PolicyAst {
    pub imports: Vec<Import>,
    pub predicates: Vec<PredicateDef>,
    pub rules: Vec<RuleDecl>,
}

/// `from <module> import <name>, <name>`
#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: String,
    pub names: Vec<(String, Span)>,
    pub span: Span,
}

/// `name(param: Type, ...) := <expr>`
#[derive(Debug, Clone, PartialEq)]
pub struct PredicateDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: TypeName,
    pub span: Span,
}

/// `raise <ctor> if: <atoms>`
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDecl {
    pub ctor: ErrorCtor,
    /// One atom per body line (or per `;`-separated segment inline).
    pub body: Vec<Expr>,
    pub span: Span,
}

/// The error a rule raises on a satisfying binding.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCtor {
    /// Bare string literal: the built-in `PolicyViolation` kind.
    Message { message: String, span: Span },
    /// `Name("msg", key=expr, ...)`
    Call {
        name: String,
        message: Box<Expr>,
        kwargs: Vec<(String, Expr)>,
        span: Span,
    },
}

impl ErrorCtor {
    #[must_use]
    pub fn span(&self) -> Span {
        match self {
            Self::Message { span, .. } | Self::Call { span, .. } => *span,
        }
    }
}

/// Declared type of a quantified variable or predicate parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeName {
    Event,
    Message,
    ToolCall,
    ToolOutput,
    Str,
    Number,
    Bool,
    Dict,
    List,
    /// Propagated through dict/list dereferences; unifies with anything.
    Unknown,
}

impl TypeName {
    /// Resolve a surface type name; `None` for unknown names.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "Event" => Self::Event,
            "Message" => Self::Message,
            "ToolCall" => Self::ToolCall,
            "ToolOutput" => Self::ToolOutput,
            "str" => Self::Str,
            "int" | "float" | "number" => Self::Number,
            "bool" => Self::Bool,
            "dict" => Self::Dict,
            "list" => Self::List,
            _ => return None,
        })
    }

    /// True for the event kinds a top-of-body declaration quantifies over.
    #[must_use]
    pub fn is_event(self) -> bool {
        matches!(
            self,
            Self::Event | Self::Message | Self::ToolCall | Self::ToolOutput
        )
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Event => "Event",
            Self::Message => "Message",
            Self::ToolCall => "ToolCall",
            Self::ToolOutput => "ToolOutput",
            Self::Str => "str",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Dict => "dict",
            Self::List => "list",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    /// `x in collection` / substring test.
    In,
    /// `a -> b` direct-flow assertion.
    Flow,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::And => "and",
            Self::Or => "or",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::In => "in",
            Self::Flow => "->",
        };
        f.write_str(op)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    #[must_use]
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Str(String),
    Number(f64),
    Bool(bool),
    Null,
    /// Raw regex text; anchoring is applied where it is used.
    Regex(String),
    Var(String),
    /// `(name: Type)` - introduces a quantified variable.
    Decl { name: String, ty: TypeName },
    /// `not <expr>`
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `<subject> is tool:<name>(<pattern>)`
    Is {
        subject: Box<Expr>,
        pattern: ToolPattern,
    },
    /// `name(arg, ..., key=expr, ...)` - predicate, builtin, or detector.
    Call {
        name: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    /// `<object>.<field>`
    Member { object: Box<Expr>, field: String },
    /// `<object>[<index>]`
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    /// `[a, b, c]` literal list, e.g. the right side of `in`.
    List(Vec<Expr>),
    /// `{key: expr, ...}` literal dict.
    Dict(Vec<(String, Expr)>),
}

/// The pattern side of an `is` assertion.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPattern {
    /// `tool:NAME`; `None` matches any tool call.
    pub name: Option<String>,
    /// Argument pattern; `None` places no constraint on arguments.
    pub args: Option<Pattern>,
    pub span: Span,
}

/// Semantic-match pattern language.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Str(String),
    Number(f64),
    Bool(bool),
    Null,
    /// Fully-anchored regex over string values.
    Regex(String, Span),
    /// `<EMAIL_ADDRESS>` and friends - detector-backed value classifiers.
    Classifier(String, Span),
    /// `*` - any value, including an absent key.
    Wildcard,
    /// Partial object match: each listed key must match, extras are ignored.
    Object(Vec<(String, Pattern)>),
    /// Positional prefix match over lists.
    List(Vec<Pattern>),
}

/// Walk an expression tree top-down, visiting every node.
pub fn walk_expr<'a>(expr: &'a Expr, visit: &mut impl FnMut(&'a Expr)) {
    visit(expr);
    match &expr.kind {
        ExprKind::Not(inner) => walk_expr(inner, visit),
        ExprKind::Binary { lhs, rhs, .. } => {
            walk_expr(lhs, visit);
            walk_expr(rhs, visit);
        }
        ExprKind::Is { subject, .. } => walk_expr(subject, visit),
        ExprKind::Call { args, kwargs, .. } => {
            for arg in args {
                walk_expr(arg, visit);
            }
            for (_, value) in kwargs {
                walk_expr(value, visit);
            }
        }
        ExprKind::Member { object, .. } => walk_expr(object, visit),
        ExprKind::Index { object, index } => {
            walk_expr(object, visit);
            walk_expr(index, visit);
        }
        ExprKind::List(items) => {
            for item in items {
                walk_expr(item, visit);
            }
        }
        ExprKind::Dict(entries) => {
            for (_, value) in entries {
                walk_expr(value, visit);
            }
        }
        ExprKind::Str(_)
        | ExprKind::Number(_)
        | ExprKind::Bool(_)
        | ExprKind::Null
        | ExprKind::Regex(_)
        | ExprKind::Var(_)
        | ExprKind::Decl { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_name_parses_aliases() {
        assert_eq!(TypeName::parse("int"), Some(TypeName::Number));
        assert_eq!(TypeName::parse("float"), Some(TypeName::Number));
        assert_eq!(TypeName::parse("ToolCall"), Some(TypeName::ToolCall));
        assert_eq!(TypeName::parse("Widget"), None);
    }

    #[test]
    fn event_kinds_are_event_types() {
        assert!(TypeName::ToolOutput.is_event());
        assert!(!TypeName::Dict.is_event());
    }
}
