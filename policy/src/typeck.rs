//! Type checking of parsed policies.
//!
//! Declared variable types seed the environment and propagate through member
//! access; dict and list dereferences yield `unknown`, which unifies with
//! anything (string contents may be parsed lazily at evaluation time).
//! Negation is range-restricted as in Datalog: an atom under `not` may not
//! introduce a fresh variable. All errors are collected, not short-circuited.

use std::collections::{HashMap, HashSet};

use crate::ast::{
    BinaryOp, ErrorCtor, Expr, ExprKind, Pattern, PolicyAst, PredicateDef, RuleDecl, ToolPattern,
    TypeName, walk_expr,
};
use crate::error::TypeError;
use crate::token::Span;

/// Value classifiers the pattern language understands.
pub const CLASSIFIERS: &[&str] = &[
    "EMAIL_ADDRESS",
    "LOCATION",
    "PHONE_NUMBER",
    "PERSON",
    "MODERATED",
];

/// Built-in functions callable from rule bodies, with their arities.
const BUILTINS: &[(&str, usize)] = &[("len", 1), ("text", 1), ("json", 1), ("match", 2)];

/// How a call site resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Builtin,
    Predicate,
    Detector,
}

/// Symbols visible to rule bodies: imported detectors and defined predicates.
#[derive(Debug, Default)]
pub struct SymbolTable {
    detectors: HashSet<String>,
    predicates: HashMap<String, usize>,
}

impl SymbolTable {
    fn from_ast(ast: &PolicyAst) -> Self {
        let mut table = Self::default();
        for import in &ast.imports {
            for (name, _) in &import.names {
                table.detectors.insert(name.clone());
            }
        }
        for predicate in &ast.predicates {
            table
                .predicates
                .insert(predicate.name.clone(), predicate.params.len());
        }
        table
    }

    /// Resolve a call-site name. Predicates shadow detectors, builtins bind
    /// tightest.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<CallTarget> {
        if BUILTINS.iter().any(|(builtin, _)| *builtin == name) {
            return Some(CallTarget::Builtin);
        }
        if self.predicates.contains_key(name) {
            return Some(CallTarget::Predicate);
        }
        if self.detectors.contains(name) {
            return Some(CallTarget::Detector);
        }
        None
    }
}

/// Check a parsed policy; returns the symbol table the compiler needs.
pub fn check(ast: &PolicyAst) -> Result<SymbolTable, Vec<TypeError>> {
    let symbols = SymbolTable::from_ast(ast);
    let mut errors = Vec::new();

    check_predicate_recursion(ast, &mut errors);
    for predicate in &ast.predicates {
        check_predicate(predicate, &symbols, &mut errors);
    }
    for rule in &ast.rules {
        check_rule(rule, &symbols, &mut errors);
    }

    if errors.is_empty() {
        Ok(symbols)
    } else {
        Err(errors)
    }
}

fn check_predicate(predicate: &PredicateDef, symbols: &SymbolTable, errors: &mut Vec<TypeError>) {
    let mut env: HashMap<String, TypeName> = predicate
        .params
        .iter()
        .map(|param| (param.name.clone(), param.ty))
        .collect();
    env.insert("input".to_string(), TypeName::Dict);

    let mut checker = Checker {
        symbols,
        env,
        errors,
    };
    // Predicate bodies are plain boolean expressions: no fresh quantifiers.
    let mut found_decl = None;
    walk_expr(&predicate.body, &mut |expr| {
        if matches!(expr.kind, ExprKind::Decl { .. }) && found_decl.is_none() {
            found_decl = Some(expr.span);
        }
    });
    if let Some(span) = found_decl {
        checker.error(span, "predicate bodies may not declare new variables");
    }
    checker.type_of(&predicate.body);
}

fn check_rule(rule: &RuleDecl, symbols: &SymbolTable, errors: &mut Vec<TypeError>) {
    let mut env: HashMap<String, TypeName> = HashMap::new();
    env.insert("input".to_string(), TypeName::Dict);

    // Pass 1: collect declarations anywhere in the body (quantifiers are
    // hoisted to the top of the conjunction by the compiler).
    for atom in &rule.body {
        collect_decls(atom, &mut env, errors);
    }

    let mut checker = Checker {
        symbols,
        env,
        errors,
    };

    for atom in &rule.body {
        check_membership_position(atom, checker.errors);
        checker.check_negation_restriction(atom, false);
        checker.type_of(atom);
    }

    match &rule.ctor {
        ErrorCtor::Message { .. } => {}
        ErrorCtor::Call {
            name,
            message,
            kwargs,
            span,
        } => {
            if name != "PolicyViolation" && name != "AccessControlViolation" {
                checker.error(
                    *span,
                    format!("unknown error constructor `{name}`"),
                );
            }
            checker.type_of(message);
            for (_, value) in kwargs {
                checker.type_of(value);
            }
        }
    }
}

fn collect_decls(
    expr: &Expr,
    env: &mut HashMap<String, TypeName>,
    errors: &mut Vec<TypeError>,
) {
    walk_expr(expr, &mut |node| {
        if let ExprKind::Decl { name, ty } = &node.kind {
            if name == "input" {
                errors.push(TypeError::at(node.span, "`input` is a reserved name"));
            } else if env.insert(name.clone(), *ty).is_some() {
                errors.push(TypeError::at(
                    node.span,
                    format!("variable `{name}` is declared twice"),
                ));
            }
        }
    });
}

/// Membership bindings `(x: T) in expr` must stand as their own atom; the
/// compiler cannot hoist an iteration out of a disjunction soundly.
fn check_membership_position(atom: &Expr, errors: &mut Vec<TypeError>) {
    fn scan(expr: &Expr, top_level: bool, errors: &mut Vec<TypeError>) {
        if let ExprKind::Binary {
            op: BinaryOp::In,
            lhs,
            rhs,
        } = &expr.kind
        {
            if matches!(lhs.kind, ExprKind::Decl { .. }) {
                if !top_level {
                    errors.push(TypeError::at(
                        expr.span,
                        "membership bindings must be top-level atoms",
                    ));
                }
                scan(rhs, false, errors);
                return;
            }
        }
        match &expr.kind {
            ExprKind::Not(inner) => scan(inner, false, errors),
            ExprKind::Binary { lhs, rhs, .. } => {
                scan(lhs, false, errors);
                scan(rhs, false, errors);
            }
            ExprKind::Is { subject, .. } => scan(subject, false, errors),
            ExprKind::Call { args, kwargs, .. } => {
                for arg in args {
                    scan(arg, false, errors);
                }
                for (_, value) in kwargs {
                    scan(value, false, errors);
                }
            }
            ExprKind::Member { object, .. } => scan(object, false, errors),
            ExprKind::Index { object, index } => {
                scan(object, false, errors);
                scan(index, false, errors);
            }
            ExprKind::List(items) => {
                for item in items {
                    scan(item, false, errors);
                }
            }
            ExprKind::Dict(entries) => {
                for (_, value) in entries {
                    scan(value, false, errors);
                }
            }
            _ => {}
        }
    }
    scan(atom, true, errors);
}

fn check_predicate_recursion(ast: &PolicyAst, errors: &mut Vec<TypeError>) {
    let names: HashSet<&str> = ast.predicates.iter().map(|p| p.name.as_str()).collect();
    let mut calls: HashMap<&str, Vec<&str>> = HashMap::new();
    for predicate in &ast.predicates {
        let mut callees = Vec::new();
        walk_expr(&predicate.body, &mut |expr| {
            if let ExprKind::Call { name, .. } = &expr.kind {
                if names.contains(name.as_str()) {
                    callees.push(name.as_str());
                }
            }
        });
        calls.insert(predicate.name.as_str(), callees);
    }

    // DFS cycle detection over the predicate call graph.
    fn cyclic<'a>(
        node: &'a str,
        calls: &HashMap<&'a str, Vec<&'a str>>,
        visiting: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> bool {
        if done.contains(node) {
            return false;
        }
        if !visiting.insert(node) {
            return true;
        }
        let found = calls
            .get(node)
            .is_some_and(|callees| callees.iter().any(|c| cyclic(c, calls, visiting, done)));
        visiting.remove(node);
        done.insert(node);
        found
    }

    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    for predicate in &ast.predicates {
        if cyclic(predicate.name.as_str(), &calls, &mut visiting, &mut done) {
            errors.push(TypeError::at(
                predicate.span,
                format!("predicate `{}` is recursive", predicate.name),
            ));
        }
    }
}

struct Checker<'a> {
    symbols: &'a SymbolTable,
    env: HashMap<String, TypeName>,
    errors: &'a mut Vec<TypeError>,
}

impl Checker<'_> {
    fn error(&mut self, span: Span, message: impl Into<String>) {
        self.errors.push(TypeError::at(span, message));
    }

    /// Spec invariant: compilation rejects any rule in which a negated atom
    /// introduces a fresh variable.
    fn check_negation_restriction(&mut self, expr: &Expr, negative: bool) {
        match &expr.kind {
            ExprKind::Decl { name, .. } if negative => {
                self.error(
                    expr.span,
                    format!("variable `{name}` may not be introduced under `not`"),
                );
            }
            ExprKind::Not(inner) => self.check_negation_restriction(inner, true),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.check_negation_restriction(lhs, negative);
                self.check_negation_restriction(rhs, negative);
            }
            ExprKind::Is { subject, .. } => self.check_negation_restriction(subject, negative),
            ExprKind::Call { args, kwargs, .. } => {
                for arg in args {
                    self.check_negation_restriction(arg, negative);
                }
                for (_, value) in kwargs {
                    self.check_negation_restriction(value, negative);
                }
            }
            ExprKind::Member { object, .. } => self.check_negation_restriction(object, negative),
            ExprKind::Index { object, index } => {
                self.check_negation_restriction(object, negative);
                self.check_negation_restriction(index, negative);
            }
            ExprKind::List(items) => {
                for item in items {
                    self.check_negation_restriction(item, negative);
                }
            }
            ExprKind::Dict(entries) => {
                for (_, value) in entries {
                    self.check_negation_restriction(value, negative);
                }
            }
            _ => {}
        }
    }

    fn type_of(&mut self, expr: &Expr) -> TypeName {
        match &expr.kind {
            ExprKind::Str(_) => TypeName::Str,
            ExprKind::Number(_) => TypeName::Number,
            ExprKind::Bool(_) => TypeName::Bool,
            ExprKind::Null => TypeName::Unknown,
            ExprKind::Regex(pattern) => {
                self.check_regex(pattern, expr.span);
                TypeName::Str
            }
            ExprKind::Var(name) => match self.env.get(name) {
                Some(ty) => *ty,
                None => {
                    self.error(expr.span, format!("undefined variable `{name}`"));
                    TypeName::Unknown
                }
            },
            // Bare event quantifier or membership target; the value type is
            // the declared type. Whether the declaration is allowed in this
            // position is the compiler's call (generators vs filters).
            ExprKind::Decl { ty, .. } => *ty,
            ExprKind::Not(inner) => {
                self.type_of(inner);
                TypeName::Bool
            }
            ExprKind::Binary { op, lhs, rhs } => self.type_of_binary(*op, lhs, rhs),
            ExprKind::Is { subject, pattern } => {
                let subject_ty = self.type_of(subject);
                if !matches!(
                    subject_ty,
                    TypeName::ToolCall | TypeName::Event | TypeName::Unknown
                ) {
                    self.error(
                        subject.span,
                        format!("`is tool` requires a ToolCall, found `{subject_ty}`"),
                    );
                }
                self.check_tool_pattern(pattern);
                TypeName::Bool
            }
            ExprKind::Call { name, args, kwargs } => {
                self.type_of_call(name, args, kwargs, expr.span)
            }
            ExprKind::Member { object, field } => self.type_of_member(object, field, expr.span),
            ExprKind::Index { object, index } => {
                let object_ty = self.type_of(object);
                let index_ty = self.type_of(index);
                if !matches!(
                    object_ty,
                    TypeName::Dict | TypeName::List | TypeName::Unknown
                ) {
                    self.error(
                        object.span,
                        format!("type `{object_ty}` cannot be indexed"),
                    );
                }
                if !matches!(
                    index_ty,
                    TypeName::Str | TypeName::Number | TypeName::Unknown
                ) {
                    self.error(
                        index.span,
                        format!("index must be a string or number, found `{index_ty}`"),
                    );
                }
                TypeName::Unknown
            }
            ExprKind::List(items) => {
                for item in items {
                    self.type_of(item);
                }
                TypeName::List
            }
            ExprKind::Dict(entries) => {
                for (_, value) in entries {
                    self.type_of(value);
                }
                TypeName::Dict
            }
        }
    }

    fn type_of_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> TypeName {
        let lhs_ty = self.type_of(lhs);
        let rhs_ty = self.type_of(rhs);
        match op {
            BinaryOp::And | BinaryOp::Or | BinaryOp::Eq | BinaryOp::NotEq => {}
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                for (operand, ty) in [(lhs, lhs_ty), (rhs, rhs_ty)] {
                    if !matches!(
                        ty,
                        TypeName::Number | TypeName::Str | TypeName::Unknown
                    ) {
                        self.error(
                            operand.span,
                            format!("`{op}` cannot order type `{ty}`"),
                        );
                    }
                }
            }
            BinaryOp::In => {
                if !matches!(
                    rhs_ty,
                    TypeName::Str | TypeName::List | TypeName::Dict | TypeName::Unknown
                ) {
                    self.error(
                        rhs.span,
                        format!("`in` requires a string, list, or dict, found `{rhs_ty}`"),
                    );
                }
            }
            BinaryOp::Flow => {
                for (operand, ty) in [(lhs, lhs_ty), (rhs, rhs_ty)] {
                    if !ty.is_event() {
                        self.error(
                            operand.span,
                            format!("`->` relates events, found `{ty}`"),
                        );
                    }
                }
            }
        }
        TypeName::Bool
    }

    fn type_of_call(
        &mut self,
        name: &str,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        span: Span,
    ) -> TypeName {
        for arg in args {
            self.type_of(arg);
        }
        for (_, value) in kwargs {
            self.type_of(value);
        }
        match self.symbols.resolve(name) {
            Some(CallTarget::Builtin) => {
                let arity = BUILTINS
                    .iter()
                    .find(|(builtin, _)| *builtin == name)
                    .map_or(0, |(_, arity)| *arity);
                if args.len() != arity {
                    self.error(
                        span,
                        format!("`{name}` takes {arity} argument(s), found {}", args.len()),
                    );
                }
                if !kwargs.is_empty() {
                    self.error(span, format!("`{name}` takes no keyword arguments"));
                }
                match name {
                    "len" => TypeName::Number,
                    "text" => TypeName::Str,
                    "json" => TypeName::Unknown,
                    _ => TypeName::Bool,
                }
            }
            Some(CallTarget::Predicate) => {
                let arity = self.symbols.predicates[name];
                if args.len() != arity {
                    self.error(
                        span,
                        format!(
                            "predicate `{name}` takes {arity} argument(s), found {}",
                            args.len()
                        ),
                    );
                }
                if !kwargs.is_empty() {
                    self.error(
                        span,
                        format!("predicate `{name}` takes no keyword arguments"),
                    );
                }
                TypeName::Bool
            }
            Some(CallTarget::Detector) => {
                if args.is_empty() {
                    self.error(
                        span,
                        format!("detector `{name}` requires a value argument"),
                    );
                }
                TypeName::Bool
            }
            None => {
                self.error(span, format!("undefined symbol `{name}`"));
                TypeName::Unknown
            }
        }
    }

    fn type_of_member(&mut self, object: &Expr, field: &str, span: Span) -> TypeName {
        let object_ty = self.type_of(object);
        let allowed: &[(&str, TypeName)] = match object_ty {
            TypeName::Message => &[
                ("role", TypeName::Str),
                ("content", TypeName::Unknown),
                ("tool_calls", TypeName::List),
            ],
            TypeName::ToolCall => &[
                ("id", TypeName::Str),
                ("type", TypeName::Str),
                ("function", TypeName::Dict),
            ],
            TypeName::ToolOutput => &[
                ("tool_call_id", TypeName::Str),
                ("content", TypeName::Unknown),
                ("role", TypeName::Str),
            ],
            // An Event could be any variant; allow the union of fields.
            TypeName::Event => &[
                ("role", TypeName::Str),
                ("content", TypeName::Unknown),
                ("tool_calls", TypeName::List),
                ("id", TypeName::Str),
                ("type", TypeName::Str),
                ("function", TypeName::Dict),
                ("tool_call_id", TypeName::Str),
            ],
            TypeName::Dict | TypeName::List | TypeName::Unknown => {
                return TypeName::Unknown;
            }
            other => {
                self.error(
                    span,
                    format!("type `{other}` has no attribute `{field}`"),
                );
                return TypeName::Unknown;
            }
        };
        match allowed.iter().find(|(name, _)| *name == field) {
            Some((_, ty)) => *ty,
            None => {
                self.error(
                    span,
                    format!("type `{object_ty}` has no attribute `{field}`"),
                );
                TypeName::Unknown
            }
        }
    }

    fn check_tool_pattern(&mut self, pattern: &ToolPattern) {
        if let Some(args) = &pattern.args {
            self.check_pattern(args, pattern.span);
        }
    }

    fn check_pattern(&mut self, pattern: &Pattern, enclosing: Span) {
        match pattern {
            Pattern::Regex(text, span) => self.check_regex(text, *span),
            Pattern::Classifier(name, span) => {
                if !CLASSIFIERS.contains(&name.as_str()) {
                    self.error(*span, format!("unknown classifier `<{name}>`"));
                }
            }
            Pattern::Object(fields) => {
                for (_, value) in fields {
                    self.check_pattern(value, enclosing);
                }
            }
            Pattern::List(items) => {
                for item in items {
                    self.check_pattern(item, enclosing);
                }
            }
            Pattern::Str(_)
            | Pattern::Number(_)
            | Pattern::Bool(_)
            | Pattern::Null
            | Pattern::Wildcard => {}
        }
    }

    fn check_regex(&mut self, pattern: &str, span: Span) {
        if let Err(error) = fancy_regex::Regex::new(pattern) {
            self.error(span, format!("invalid regex: {error}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn errors_of(source: &str) -> Vec<TypeError> {
        let ast = parse(source).unwrap();
        match check(&ast) {
            Ok(_) => Vec::new(),
            Err(errors) => errors,
        }
    }

    #[test]
    fn accepts_flow_rule() {
        let source = "raise \"X\" if:\n    (a: ToolCall) -> (b: ToolCall)\n    a is tool:get_inbox\n";
        assert!(errors_of(source).is_empty());
    }

    #[test]
    fn flow_requires_event_operands() {
        let source = "raise \"X\" if:\n    (d: dict) in input.rows\n    (a: ToolCall)\n    d -> a\n";
        let errors = errors_of(source);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("relates events"));
    }

    #[test]
    fn rejects_undefined_symbol() {
        let source = "raise \"X\" if:\n    (out: ToolOutput)\n    prompt_injection(out.content)\n";
        let errors = errors_of(source);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("undefined symbol"));
    }

    #[test]
    fn import_brings_detector_into_scope() {
        let source = "from warden.detectors import prompt_injection\n\nraise \"X\" if:\n    (out: ToolOutput)\n    prompt_injection(out.content, threshold=0.7)\n";
        assert!(errors_of(source).is_empty());
    }

    #[test]
    fn rejects_fresh_variable_under_not() {
        let source = "raise \"X\" if:\n    (a: ToolCall)\n    not ((b: ToolOutput) -> a)\n";
        let errors = errors_of(source);
        assert!(
            errors
                .iter()
                .any(|e| e.message.contains("introduced under `not`"))
        );
    }

    #[test]
    fn allows_bound_variable_under_not() {
        let source =
            "raise \"X\" if:\n    (a: ToolCall)\n    (b: ToolOutput)\n    not (b -> a)\n";
        assert!(errors_of(source).is_empty());
    }

    #[test]
    fn rejects_duplicate_declaration() {
        let source = "raise \"X\" if:\n    (a: ToolCall)\n    (a: Message)\n";
        let errors = errors_of(source);
        assert!(errors[0].message.contains("declared twice"));
    }

    #[test]
    fn rejects_unknown_classifier() {
        let source = "raise \"X\" if:\n    (b: ToolCall)\n    b is tool:send({to: <SOCIAL_SECURITY>})\n";
        let errors = errors_of(source);
        assert!(errors[0].message.contains("unknown classifier"));
    }

    #[test]
    fn rejects_invalid_regex() {
        let source = "raise \"X\" if:\n    (b: ToolCall)\n    b is tool:send({to: r\"(unclosed\"})\n";
        let errors = errors_of(source);
        assert!(errors[0].message.contains("invalid regex"));
    }

    #[test]
    fn rejects_recursive_predicate() {
        let source = "bad(x: str) := bad(x)\n";
        let errors = errors_of(source);
        assert!(errors.iter().any(|e| e.message.contains("recursive")));
    }

    #[test]
    fn rejects_unknown_attribute_on_message() {
        let source = "raise \"X\" if:\n    (m: Message)\n    m.payload == \"x\"\n";
        let errors = errors_of(source);
        assert!(errors[0].message.contains("no attribute"));
    }

    #[test]
    fn dict_display_values_are_checked() {
        let source =
            "raise \"X\" if:\n    (c: ToolCall)\n    c.function.arguments == {to: ghost}\n";
        let errors = errors_of(source);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("undefined variable `ghost`"));
    }

    #[test]
    fn resolves_predicate_arity() {
        let source = "from warden.detectors import prompt_injection\n\nuntrusted(out: ToolOutput) := prompt_injection(out.content)\n\nraise \"X\" if:\n    (out: ToolOutput)\n    untrusted(out, 3)\n";
        let errors = errors_of(source);
        assert!(errors[0].message.contains("takes 1 argument"));
    }
}
