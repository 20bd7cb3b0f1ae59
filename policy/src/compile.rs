//! Lowering of type-checked policies into executable plans.
//!
//! Each rule body becomes a normalized step sequence: generators (event
//! quantifiers and membership iterations) ordered by their dependencies,
//! with every filter attached at the earliest point all of its variables
//! are bound, so the evaluator cuts branches as soon as a filter fails.
//! Predicate calls are expanded inline (the call graph is acyclic after
//! type checking) and regex literals are validated and precompiled.

use std::collections::{HashMap, HashSet};

use fancy_regex::Regex;

use warden_types::RuleId;

use crate::ast::{
    BinaryOp, ErrorCtor, Expr, ExprKind, Pattern, PolicyAst, PredicateDef, ToolPattern, TypeName,
    walk_expr,
};
use crate::error::TypeError;
use crate::token::Span;

/// One element of a rule's normalized plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Quantify `var` over all trace events of `kind`.
    Generate { var: String, kind: TypeName },
    /// Bind `var` to each element of the evaluated `source` collection.
    Iterate {
        var: String,
        kind: TypeName,
        source: Expr,
    },
    /// Boolean atom over already-bound variables.
    Filter(Expr),
}

/// A rule compiled to its executable plan.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub id: RuleId,
    pub ctor: ErrorCtor,
    pub steps: Vec<Step>,
    pub span: Span,
}

/// A whole policy: compiled once, reused across evaluations and threads.
#[derive(Debug)]
pub struct CompiledPolicy {
    pub rules: Vec<CompiledRule>,
    /// Regex literals, precompiled fully-anchored (`^(?:pat)$`): the pattern
    /// language and the `match` builtin both match whole strings.
    pub regexes: HashMap<String, Regex>,
}

impl CompiledPolicy {
    #[must_use]
    pub fn regex(&self, pattern: &str) -> Option<&Regex> {
        self.regexes.get(pattern)
    }
}

/// Lower a checked AST. The only errors still possible here are scheduling
/// failures (a filter over variables nothing generates).
pub fn lower(ast: PolicyAst) -> Result<CompiledPolicy, Vec<TypeError>> {
    let predicates: HashMap<String, PredicateDef> = ast
        .predicates
        .into_iter()
        .map(|p| (p.name.clone(), p))
        .collect();

    let mut errors = Vec::new();
    let mut rules = Vec::new();
    let mut regexes = HashMap::new();

    for (index, rule) in ast.rules.into_iter().enumerate() {
        let id = RuleId::new(index as u32);
        let body: Vec<Expr> = rule
            .body
            .iter()
            .map(|atom| expand_predicates(atom, &predicates))
            .collect();

        for atom in &body {
            collect_regexes(atom, &mut regexes);
        }
        if let ErrorCtor::Call {
            message, kwargs, ..
        } = &rule.ctor
        {
            collect_regexes(message, &mut regexes);
            for (_, value) in kwargs {
                collect_regexes(value, &mut regexes);
            }
        }

        match normalize(&body) {
            Ok(steps) => rules.push(CompiledRule {
                id,
                ctor: rule.ctor,
                steps,
                span: rule.span,
            }),
            Err(mut rule_errors) => errors.append(&mut rule_errors),
        }
    }

    if errors.is_empty() {
        tracing::debug!(rule_count = rules.len(), "policy compiled");
        Ok(CompiledPolicy { rules, regexes })
    } else {
        Err(errors)
    }
}

// ----------------------------------------------------------------------
// Predicate expansion
// ----------------------------------------------------------------------

/// Replace predicate calls by their bodies with parameters substituted.
/// Recursion was rejected during type checking, so expansion terminates.
fn expand_predicates(expr: &Expr, predicates: &HashMap<String, PredicateDef>) -> Expr {
    let kind = match &expr.kind {
        ExprKind::Call { name, args, kwargs } => {
            if let Some(predicate) = predicates.get(name) {
                let substitution: HashMap<&str, &Expr> = predicate
                    .params
                    .iter()
                    .map(|param| param.name.as_str())
                    .zip(args.iter())
                    .collect();
                let body = substitute(&predicate.body, &substitution);
                return expand_predicates(&body, predicates);
            }
            ExprKind::Call {
                name: name.clone(),
                args: args
                    .iter()
                    .map(|arg| expand_predicates(arg, predicates))
                    .collect(),
                kwargs: kwargs
                    .iter()
                    .map(|(key, value)| (key.clone(), expand_predicates(value, predicates)))
                    .collect(),
            }
        }
        ExprKind::Not(inner) => ExprKind::Not(Box::new(expand_predicates(inner, predicates))),
        ExprKind::Binary { op, lhs, rhs } => ExprKind::Binary {
            op: *op,
            lhs: Box::new(expand_predicates(lhs, predicates)),
            rhs: Box::new(expand_predicates(rhs, predicates)),
        },
        ExprKind::Is { subject, pattern } => ExprKind::Is {
            subject: Box::new(expand_predicates(subject, predicates)),
            pattern: pattern.clone(),
        },
        ExprKind::Member { object, field } => ExprKind::Member {
            object: Box::new(expand_predicates(object, predicates)),
            field: field.clone(),
        },
        ExprKind::Index { object, index } => ExprKind::Index {
            object: Box::new(expand_predicates(object, predicates)),
            index: Box::new(expand_predicates(index, predicates)),
        },
        ExprKind::List(items) => ExprKind::List(
            items
                .iter()
                .map(|item| expand_predicates(item, predicates))
                .collect(),
        ),
        ExprKind::Dict(entries) => ExprKind::Dict(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), expand_predicates(value, predicates)))
                .collect(),
        ),
        other => other.clone(),
    };
    Expr::new(kind, expr.span)
}

fn substitute(expr: &Expr, substitution: &HashMap<&str, &Expr>) -> Expr {
    match &expr.kind {
        ExprKind::Var(name) => substitution
            .get(name.as_str())
            .map_or_else(|| expr.clone(), |replacement| (*replacement).clone()),
        ExprKind::Not(inner) => Expr::new(
            ExprKind::Not(Box::new(substitute(inner, substitution))),
            expr.span,
        ),
        ExprKind::Binary { op, lhs, rhs } => Expr::new(
            ExprKind::Binary {
                op: *op,
                lhs: Box::new(substitute(lhs, substitution)),
                rhs: Box::new(substitute(rhs, substitution)),
            },
            expr.span,
        ),
        ExprKind::Is { subject, pattern } => Expr::new(
            ExprKind::Is {
                subject: Box::new(substitute(subject, substitution)),
                pattern: pattern.clone(),
            },
            expr.span,
        ),
        ExprKind::Call { name, args, kwargs } => Expr::new(
            ExprKind::Call {
                name: name.clone(),
                args: args
                    .iter()
                    .map(|arg| substitute(arg, substitution))
                    .collect(),
                kwargs: kwargs
                    .iter()
                    .map(|(key, value)| (key.clone(), substitute(value, substitution)))
                    .collect(),
            },
            expr.span,
        ),
        ExprKind::Member { object, field } => Expr::new(
            ExprKind::Member {
                object: Box::new(substitute(object, substitution)),
                field: field.clone(),
            },
            expr.span,
        ),
        ExprKind::Index { object, index } => Expr::new(
            ExprKind::Index {
                object: Box::new(substitute(object, substitution)),
                index: Box::new(substitute(index, substitution)),
            },
            expr.span,
        ),
        ExprKind::List(items) => Expr::new(
            ExprKind::List(
                items
                    .iter()
                    .map(|item| substitute(item, substitution))
                    .collect(),
            ),
            expr.span,
        ),
        ExprKind::Dict(entries) => Expr::new(
            ExprKind::Dict(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), substitute(value, substitution)))
                    .collect(),
            ),
            expr.span,
        ),
        _ => expr.clone(),
    }
}

// ----------------------------------------------------------------------
// Normalization
// ----------------------------------------------------------------------

struct PendingGenerator {
    var: String,
    kind: TypeName,
    /// `None` for trace quantifiers; the collection expression for
    /// membership bindings.
    source: Option<Expr>,
    span: Span,
}

fn normalize(body: &[Expr]) -> Result<Vec<Step>, Vec<TypeError>> {
    let mut errors = Vec::new();
    let mut generators: Vec<PendingGenerator> = Vec::new();
    let mut filters: Vec<Expr> = Vec::new();

    for atom in body {
        match &atom.kind {
            // Bare quantifier: `(a: ToolCall)`
            ExprKind::Decl { name, ty } => {
                if ty.is_event() {
                    generators.push(PendingGenerator {
                        var: name.clone(),
                        kind: *ty,
                        source: None,
                        span: atom.span,
                    });
                } else {
                    errors.push(TypeError::at(
                        atom.span,
                        format!("only event types quantify over the trace, not `{ty}`"),
                    ));
                }
            }
            // Membership binding: `(x: T) in expr`
            ExprKind::Binary {
                op: BinaryOp::In,
                lhs,
                rhs,
            } if matches!(lhs.kind, ExprKind::Decl { .. }) => {
                let ExprKind::Decl { name, ty } = &lhs.kind else {
                    unreachable!("guarded by matches!");
                };
                let (rewritten, mut hoisted) = hoist_decls(rhs, &mut errors);
                generators.append(&mut hoisted);
                generators.push(PendingGenerator {
                    var: name.clone(),
                    kind: *ty,
                    source: Some(rewritten),
                    span: atom.span,
                });
            }
            // Anything else is a filter; inline declarations hoist out.
            _ => {
                let (rewritten, mut hoisted) = hoist_decls(atom, &mut errors);
                generators.append(&mut hoisted);
                filters.push(rewritten);
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    schedule(generators, filters)
}

/// Rewrite inline `(x: Type)` declarations into plain variable references,
/// returning the trace quantifiers they imply.
fn hoist_decls(
    expr: &Expr,
    errors: &mut Vec<TypeError>,
) -> (Expr, Vec<PendingGenerator>) {
    let mut hoisted = Vec::new();
    let rewritten = rewrite_decls(expr, &mut hoisted, errors);
    (rewritten, hoisted)
}

fn rewrite_decls(
    expr: &Expr,
    hoisted: &mut Vec<PendingGenerator>,
    errors: &mut Vec<TypeError>,
) -> Expr {
    match &expr.kind {
        ExprKind::Decl { name, ty } => {
            if ty.is_event() {
                hoisted.push(PendingGenerator {
                    var: name.clone(),
                    kind: *ty,
                    source: None,
                    span: expr.span,
                });
            } else {
                errors.push(TypeError::at(
                    expr.span,
                    format!("variable `{name}` of type `{ty}` must be bound by membership"),
                ));
            }
            Expr::new(ExprKind::Var(name.clone()), expr.span)
        }
        ExprKind::Not(inner) => Expr::new(
            ExprKind::Not(Box::new(rewrite_decls(inner, hoisted, errors))),
            expr.span,
        ),
        ExprKind::Binary { op, lhs, rhs } => Expr::new(
            ExprKind::Binary {
                op: *op,
                lhs: Box::new(rewrite_decls(lhs, hoisted, errors)),
                rhs: Box::new(rewrite_decls(rhs, hoisted, errors)),
            },
            expr.span,
        ),
        ExprKind::Is { subject, pattern } => Expr::new(
            ExprKind::Is {
                subject: Box::new(rewrite_decls(subject, hoisted, errors)),
                pattern: pattern.clone(),
            },
            expr.span,
        ),
        ExprKind::Call { name, args, kwargs } => Expr::new(
            ExprKind::Call {
                name: name.clone(),
                args: args
                    .iter()
                    .map(|arg| rewrite_decls(arg, hoisted, errors))
                    .collect(),
                kwargs: kwargs
                    .iter()
                    .map(|(key, value)| (key.clone(), rewrite_decls(value, hoisted, errors)))
                    .collect(),
            },
            expr.span,
        ),
        ExprKind::Member { object, field } => Expr::new(
            ExprKind::Member {
                object: Box::new(rewrite_decls(object, hoisted, errors)),
                field: field.clone(),
            },
            expr.span,
        ),
        ExprKind::Index { object, index } => Expr::new(
            ExprKind::Index {
                object: Box::new(rewrite_decls(object, hoisted, errors)),
                index: Box::new(rewrite_decls(index, hoisted, errors)),
            },
            expr.span,
        ),
        ExprKind::List(items) => Expr::new(
            ExprKind::List(
                items
                    .iter()
                    .map(|item| rewrite_decls(item, hoisted, errors))
                    .collect(),
            ),
            expr.span,
        ),
        ExprKind::Dict(entries) => Expr::new(
            ExprKind::Dict(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), rewrite_decls(value, hoisted, errors)))
                    .collect(),
            ),
            expr.span,
        ),
        _ => expr.clone(),
    }
}

/// Order generators by dependency and attach each filter at the earliest
/// point all of its variables are bound.
fn schedule(
    mut generators: Vec<PendingGenerator>,
    mut filters: Vec<Expr>,
) -> Result<Vec<Step>, Vec<TypeError>> {
    let mut steps = Vec::new();
    let mut bound: HashSet<String> = HashSet::new();
    bound.insert("input".to_string());

    loop {
        // Flush every filter that became evaluable.
        let mut index = 0;
        while index < filters.len() {
            if free_vars(&filters[index]).is_subset(&bound) {
                steps.push(Step::Filter(filters.remove(index)));
            } else {
                index += 1;
            }
        }

        // Admit the first generator whose dependencies are satisfied,
        // preserving declaration order otherwise.
        let position = generators.iter().position(|generator| {
            generator
                .source
                .as_ref()
                .is_none_or(|source| free_vars(source).is_subset(&bound))
        });
        match position {
            Some(position) => {
                let generator = generators.remove(position);
                bound.insert(generator.var.clone());
                steps.push(match generator.source {
                    None => Step::Generate {
                        var: generator.var,
                        kind: generator.kind,
                    },
                    Some(source) => Step::Iterate {
                        var: generator.var,
                        kind: generator.kind,
                        source,
                    },
                });
            }
            None if generators.is_empty() => break,
            None => {
                return Err(generators
                    .iter()
                    .map(|generator| {
                        TypeError::at(
                            generator.span,
                            format!(
                                "cannot order binding of `{}`: its source depends on unbound variables",
                                generator.var
                            ),
                        )
                    })
                    .collect());
            }
        }
    }

    if !filters.is_empty() {
        return Err(filters
            .iter()
            .map(|filter| {
                let unbound: Vec<String> =
                    free_vars(filter).difference(&bound).cloned().collect();
                TypeError::at(
                    filter.span,
                    format!("atom references unbound variable(s): {}", unbound.join(", ")),
                )
            })
            .collect());
    }
    Ok(steps)
}

fn free_vars(expr: &Expr) -> HashSet<String> {
    let mut vars = HashSet::new();
    walk_expr(expr, &mut |node| {
        if let ExprKind::Var(name) = &node.kind {
            vars.insert(name.clone());
        }
    });
    vars.remove("input");
    vars
}

// ----------------------------------------------------------------------
// Regex precompilation
// ----------------------------------------------------------------------

fn collect_regexes(expr: &Expr, regexes: &mut HashMap<String, Regex>) {
    walk_expr(expr, &mut |node| match &node.kind {
        ExprKind::Regex(pattern) => {
            intern_regex(pattern, regexes);
        }
        ExprKind::Is { pattern, .. } => collect_pattern_regexes(pattern, regexes),
        _ => {}
    });
}

fn collect_pattern_regexes(pattern: &ToolPattern, regexes: &mut HashMap<String, Regex>) {
    fn visit(pattern: &Pattern, regexes: &mut HashMap<String, Regex>) {
        match pattern {
            Pattern::Regex(text, _) => intern_regex(text, regexes),
            Pattern::Object(fields) => {
                for (_, value) in fields {
                    visit(value, regexes);
                }
            }
            Pattern::List(items) => {
                for item in items {
                    visit(item, regexes);
                }
            }
            _ => {}
        }
    }
    if let Some(args) = &pattern.args {
        visit(args, regexes);
    }
}

fn intern_regex(pattern: &str, regexes: &mut HashMap<String, Regex>) {
    if regexes.contains_key(pattern) {
        return;
    }
    // Validity was checked during type checking; an unexpected failure here
    // leaves the pattern unmatched rather than aborting compilation.
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(compiled) => {
            regexes.insert(pattern.to_string(), compiled);
        }
        Err(error) => {
            tracing::warn!("regex `{pattern}` failed to compile after checking: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::typeck::check;

    fn compile(source: &str) -> Result<CompiledPolicy, Vec<TypeError>> {
        let ast = parse(source).unwrap();
        check(&ast)?;
        lower(ast)
    }

    #[test]
    fn generators_precede_filters() {
        let source = "raise \"X\" if:\n    (a: ToolCall) -> (b: ToolCall)\n    a is tool:get_inbox\n";
        let policy = compile(source).unwrap();
        let steps = &policy.rules[0].steps;
        assert!(matches!(steps[0], Step::Generate { ref var, .. } if var == "a"));
        assert!(matches!(steps[1], Step::Filter(_))); // a is tool:get_inbox
        assert!(matches!(steps[2], Step::Generate { ref var, .. } if var == "b"));
        assert!(matches!(steps[3], Step::Filter(_))); // a -> b
    }

    #[test]
    fn membership_waits_for_its_source() {
        let source = "raise \"X\" if:\n    (c: ToolCall) in m.tool_calls\n    (m: Message)\n";
        let policy = compile(source).unwrap();
        let steps = &policy.rules[0].steps;
        assert!(matches!(steps[0], Step::Generate { ref var, .. } if var == "m"));
        assert!(matches!(steps[1], Step::Iterate { ref var, .. } if var == "c"));
    }

    #[test]
    fn predicate_call_expands_inline() {
        let source = "from warden.detectors import prompt_injection\n\nuntrusted(out: ToolOutput) := prompt_injection(out.content, threshold=0.9)\n\nraise \"X\" if:\n    (o: ToolOutput)\n    untrusted(o)\n";
        let policy = compile(source).unwrap();
        let Step::Filter(filter) = &policy.rules[0].steps[1] else {
            panic!("expected filter");
        };
        match &filter.kind {
            ExprKind::Call { name, args, .. } => {
                assert_eq!(name, "prompt_injection");
                // `out.content` became `o.content`.
                match &args[0].kind {
                    ExprKind::Member { object, field } => {
                        assert_eq!(field, "content");
                        assert!(matches!(&object.kind, ExprKind::Var(v) if v == "o"));
                    }
                    other => panic!("expected member access, got {other:?}"),
                }
            }
            other => panic!("expected detector call, got {other:?}"),
        }
    }

    #[test]
    fn pattern_regexes_precompile_with_lookaround() {
        let source = "raise \"X\" if:\n    (b: ToolCall)\n    b is tool:send_email({to: r\"^(?!Peter$).*$\"})\n";
        let policy = compile(source).unwrap();
        let regex = policy.regex("^(?!Peter$).*$").expect("precompiled");
        assert!(regex.is_match("Attacker").unwrap());
        assert!(!regex.is_match("Peter").unwrap());
    }

    #[test]
    fn non_event_inline_declaration_is_rejected() {
        let source = "raise \"X\" if:\n    (s: str) == \"hello\"\n";
        let errors = compile(source).unwrap_err();
        assert!(errors[0].message.contains("bound by membership"));
    }
}
