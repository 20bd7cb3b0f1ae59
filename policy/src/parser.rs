//! Recursive-descent parser for policy files.
//!
//! A file is a sequence of `from ... import ...` lines, predicate
//! definitions (`name(x: Type) := expr`), and rules. A rule body is either a
//! block (`raise ... if:` followed by lines indented past the `raise`) or
//! inline (`raise ... if atom; atom`). Newlines are significant except
//! inside brackets, which join lines implicitly.

use crate::ast::{
    BinaryOp, ErrorCtor, Expr, ExprKind, Import, Param, Pattern, PolicyAst, PredicateDef,
    RuleDecl, ToolPattern, TypeName,
};
use crate::error::ParseError;
use crate::token::{Span, Token, TokenKind, tokenize};

/// Parse a policy source into its AST. The first syntax error aborts.
pub fn parse(source: &str) -> Result<PolicyAst, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    parser.parse_file()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Bracket nesting depth; newlines are transparent inside brackets.
    depth: u32,
}

impl Parser {
    fn parse_file(&mut self) -> Result<PolicyAst, ParseError> {
        let mut ast = PolicyAst::default();
        loop {
            self.skip_newlines();
            match self.peek_kind() {
                TokenKind::Eof => break,
                TokenKind::From => ast.imports.push(self.parse_import()?),
                TokenKind::Raise => ast.rules.push(self.parse_rule()?),
                TokenKind::Ident(_) => ast.predicates.push(self.parse_predicate()?),
                _ => {
                    return Err(self.unexpected("`from`, `raise`, or a predicate definition"));
                }
            }
        }
        Ok(ast)
    }

    // ------------------------------------------------------------------
    // Top-level items
    // ------------------------------------------------------------------

    fn parse_import(&mut self) -> Result<Import, ParseError> {
        let start = self.expect(&TokenKind::From)?.span;
        let mut module = self.expect_ident()?.0;
        while self.eat(&TokenKind::Dot) {
            let (segment, _) = self.expect_ident()?;
            module.push('.');
            module.push_str(&segment);
        }
        self.expect(&TokenKind::Import)?;
        let mut names = Vec::new();
        loop {
            let (name, span) = self.expect_ident()?;
            names.push((name, span));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        let end = names.last().map_or(start, |(_, span)| *span);
        self.end_line()?;
        Ok(Import {
            module,
            names,
            span: start.merge(end),
        })
    }

    fn parse_predicate(&mut self) -> Result<PredicateDef, ParseError> {
        let (name, start) = self.expect_ident()?;
        self.expect(&TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                let (param_name, param_span) = self.expect_ident()?;
                self.expect(&TokenKind::Colon)?;
                let (ty_name, ty_span) = self.expect_ident()?;
                let ty = TypeName::parse(&ty_name).ok_or_else(|| {
                    ParseError::at(ty_span, format!("unknown type `{ty_name}`"))
                })?;
                params.push(Param {
                    name: param_name,
                    ty,
                    span: param_span.merge(ty_span),
                });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen)?;
        self.expect(&TokenKind::Define)?;
        let body = self.parse_expr()?;
        let span = start.merge(body.span);
        self.end_line()?;
        Ok(PredicateDef {
            name,
            params,
            body,
            span,
        })
    }

    fn parse_rule(&mut self) -> Result<RuleDecl, ParseError> {
        let raise_token = self.expect(&TokenKind::Raise)?;
        let base_indent = raise_token.indent;
        let start = raise_token.span;
        let ctor = self.parse_error_ctor()?;
        self.expect(&TokenKind::If)?;

        let mut body = Vec::new();
        if self.eat(&TokenKind::Colon) {
            // Block form: atoms on following lines, indented past `raise`.
            self.end_line()?;
            loop {
                self.skip_newlines();
                let token = self.peek();
                if matches!(token.kind, TokenKind::Eof) || token.indent <= base_indent {
                    break;
                }
                body.push(self.parse_expr()?);
                self.end_line()?;
            }
        } else {
            // Inline form: `if atom; atom; atom`.
            loop {
                body.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Semicolon) {
                    break;
                }
            }
            self.end_line()?;
        }

        if body.is_empty() {
            return Err(ParseError::at(start, "rule body must contain at least one atom"));
        }
        let span = start.merge(body.last().map_or(start, |expr| expr.span));
        Ok(RuleDecl { ctor, body, span })
    }

    fn parse_error_ctor(&mut self) -> Result<ErrorCtor, ParseError> {
        match self.peek_kind().clone() {
            TokenKind::Str(message) => {
                let span = self.advance().span;
                Ok(ErrorCtor::Message { message, span })
            }
            TokenKind::Ident(name) => {
                let start = self.advance().span;
                self.expect(&TokenKind::LParen)?;
                let message = Box::new(self.parse_expr()?);
                let mut kwargs = Vec::new();
                while self.eat(&TokenKind::Comma) {
                    let (key, _) = self.expect_ident()?;
                    self.expect(&TokenKind::Assign)?;
                    kwargs.push((key, self.parse_expr()?));
                }
                let end = self.expect(&TokenKind::RParen)?.span;
                Ok(ErrorCtor::Call {
                    name,
                    message,
                    kwargs,
                    span: start.merge(end),
                })
            }
            _ => Err(self.unexpected("an error message or constructor after `raise`")),
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&TokenKind::Or) {
            let rhs = self.parse_and()?;
            let span = lhs.span.merge(rhs.span);
            lhs = Expr::new(
                ExprKind::Binary {
                    op: BinaryOp::Or,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_not()?;
        while self.eat(&TokenKind::And) {
            let rhs = self.parse_not()?;
            let span = lhs.span.merge(rhs.span);
            lhs = Expr::new(
                ExprKind::Binary {
                    op: BinaryOp::And,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.check(&TokenKind::Not) {
            let start = self.advance().span;
            let operand = self.parse_not()?;
            let span = start.merge(operand.span);
            return Ok(Expr::new(ExprKind::Not(Box::new(operand)), span));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_postfix()?;
        if self.check(&TokenKind::Is) {
            self.advance();
            let pattern = self.parse_tool_pattern()?;
            let span = lhs.span.merge(pattern.span);
            return Ok(Expr::new(
                ExprKind::Is {
                    subject: Box::new(lhs),
                    pattern,
                },
                span,
            ));
        }
        let op = match self.peek_kind() {
            TokenKind::Eq => BinaryOp::Eq,
            TokenKind::NotEq => BinaryOp::NotEq,
            TokenKind::Lt => BinaryOp::Lt,
            TokenKind::LtEq => BinaryOp::LtEq,
            TokenKind::Gt => BinaryOp::Gt,
            TokenKind::GtEq => BinaryOp::GtEq,
            TokenKind::In => BinaryOp::In,
            TokenKind::Arrow => BinaryOp::Flow,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_postfix()?;
        let span = lhs.span.merge(rhs.span);
        Ok(Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            span,
        ))
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                let (field, field_span) = self.expect_ident()?;
                let span = expr.span.merge(field_span);
                expr = Expr::new(
                    ExprKind::Member {
                        object: Box::new(expr),
                        field,
                    },
                    span,
                );
            } else if self.check(&TokenKind::LBracket) {
                self.open_bracket();
                let index = self.parse_expr()?;
                let end = self.close_bracket(&TokenKind::RBracket)?;
                let span = expr.span.merge(end);
                expr = Expr::new(
                    ExprKind::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    },
                    span,
                );
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek_kind().clone() {
            TokenKind::Str(value) => {
                let span = self.advance().span;
                Ok(Expr::new(ExprKind::Str(value), span))
            }
            TokenKind::Number(value) => {
                let span = self.advance().span;
                Ok(Expr::new(ExprKind::Number(value), span))
            }
            TokenKind::Regex(value) => {
                let span = self.advance().span;
                Ok(Expr::new(ExprKind::Regex(value), span))
            }
            TokenKind::True => {
                let span = self.advance().span;
                Ok(Expr::new(ExprKind::Bool(true), span))
            }
            TokenKind::False => {
                let span = self.advance().span;
                Ok(Expr::new(ExprKind::Bool(false), span))
            }
            TokenKind::Null => {
                let span = self.advance().span;
                Ok(Expr::new(ExprKind::Null, span))
            }
            TokenKind::Ident(name) => {
                let span = self.advance().span;
                if self.check(&TokenKind::LParen) {
                    self.parse_call(name, span)
                } else {
                    Ok(Expr::new(ExprKind::Var(name), span))
                }
            }
            TokenKind::LParen => self.parse_paren(),
            TokenKind::LBracket => {
                let start = self.peek().span;
                self.open_bracket();
                let mut items = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                let end = self.close_bracket(&TokenKind::RBracket)?;
                Ok(Expr::new(ExprKind::List(items), start.merge(end)))
            }
            TokenKind::LBrace => {
                let start = self.peek().span;
                self.open_bracket();
                let mut entries = Vec::new();
                if !self.check(&TokenKind::RBrace) {
                    loop {
                        let key = match self.peek_kind().clone() {
                            TokenKind::Ident(name) => {
                                self.advance();
                                name
                            }
                            TokenKind::Str(name) => {
                                self.advance();
                                name
                            }
                            _ => return Err(self.unexpected("a dict key")),
                        };
                        self.expect(&TokenKind::Colon)?;
                        entries.push((key, self.parse_expr()?));
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                        // Tolerate a trailing comma before the brace.
                        if self.check(&TokenKind::RBrace) {
                            break;
                        }
                    }
                }
                let end = self.close_bracket(&TokenKind::RBrace)?;
                Ok(Expr::new(ExprKind::Dict(entries), start.merge(end)))
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    /// `(` opens either a variable declaration `(x: Type)` or a grouping.
    fn parse_paren(&mut self) -> Result<Expr, ParseError> {
        if let (TokenKind::Ident(_), TokenKind::Colon) = (self.kind_at(1), self.kind_at(2)) {
            let start = self.peek().span;
            self.open_bracket(); // (
            let (name, _) = self.expect_ident()?;
            self.expect(&TokenKind::Colon)?;
            let (ty_name, ty_span) = self.expect_ident()?;
            let ty = TypeName::parse(&ty_name)
                .ok_or_else(|| ParseError::at(ty_span, format!("unknown type `{ty_name}`")))?;
            let end = self.close_bracket(&TokenKind::RParen)?;
            return Ok(Expr::new(ExprKind::Decl { name, ty }, start.merge(end)));
        }
        self.open_bracket();
        let inner = self.parse_expr()?;
        self.close_bracket(&TokenKind::RParen)?;
        Ok(inner)
    }

    fn parse_call(&mut self, name: String, start: Span) -> Result<Expr, ParseError> {
        self.open_bracket(); // (
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                if let (TokenKind::Ident(_), TokenKind::Assign) = (self.kind_at(0), self.kind_at(1))
                {
                    let (key, _) = self.expect_ident()?;
                    self.expect(&TokenKind::Assign)?;
                    kwargs.push((key, self.parse_expr()?));
                } else {
                    if !kwargs.is_empty() {
                        return Err(ParseError::at(
                            self.peek().span,
                            "positional argument after a keyword argument",
                        ));
                    }
                    args.push(self.parse_expr()?);
                }
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        let end = self.close_bracket(&TokenKind::RParen)?;
        Ok(Expr::new(
            ExprKind::Call { name, args, kwargs },
            start.merge(end),
        ))
    }

    // ------------------------------------------------------------------
    // Patterns
    // ------------------------------------------------------------------

    fn parse_tool_pattern(&mut self) -> Result<ToolPattern, ParseError> {
        let (keyword, start) = self.expect_ident()?;
        if keyword != "tool" {
            return Err(ParseError::at(
                start,
                format!("expected `tool` after `is`, found `{keyword}`"),
            ));
        }
        let mut name = None;
        let mut span = start;
        if self.eat(&TokenKind::Colon) {
            let (tool_name, name_span) = self.expect_ident()?;
            span = span.merge(name_span);
            name = Some(tool_name);
        }
        let mut args = None;
        if self.check(&TokenKind::LParen) {
            self.open_bracket();
            args = Some(self.parse_pattern()?);
            let end = self.close_bracket(&TokenKind::RParen)?;
            span = span.merge(end);
        }
        Ok(ToolPattern { name, args, span })
    }

    fn parse_pattern(&mut self) -> Result<Pattern, ParseError> {
        match self.peek_kind().clone() {
            TokenKind::Str(value) => {
                self.advance();
                Ok(Pattern::Str(value))
            }
            TokenKind::Number(value) => {
                self.advance();
                Ok(Pattern::Number(value))
            }
            TokenKind::True => {
                self.advance();
                Ok(Pattern::Bool(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(Pattern::Bool(false))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Pattern::Null)
            }
            TokenKind::Regex(value) => {
                let span = self.advance().span;
                Ok(Pattern::Regex(value, span))
            }
            TokenKind::Classifier(name) => {
                let span = self.advance().span;
                Ok(Pattern::Classifier(name, span))
            }
            TokenKind::Star => {
                self.advance();
                Ok(Pattern::Wildcard)
            }
            TokenKind::LBrace => {
                self.open_bracket();
                let mut fields = Vec::new();
                if !self.check(&TokenKind::RBrace) {
                    loop {
                        let key = match self.peek_kind().clone() {
                            TokenKind::Ident(name) => {
                                self.advance();
                                name
                            }
                            TokenKind::Str(name) => {
                                self.advance();
                                name
                            }
                            _ => return Err(self.unexpected("an object pattern key")),
                        };
                        self.expect(&TokenKind::Colon)?;
                        fields.push((key, self.parse_pattern()?));
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                        // Tolerate a trailing comma before the brace.
                        if self.check(&TokenKind::RBrace) {
                            break;
                        }
                    }
                }
                self.close_bracket(&TokenKind::RBrace)?;
                Ok(Pattern::Object(fields))
            }
            TokenKind::LBracket => {
                self.open_bracket();
                let mut items = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    loop {
                        items.push(self.parse_pattern()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.close_bracket(&TokenKind::RBracket)?;
                Ok(Pattern::List(items))
            }
            _ => Err(self.unexpected("a pattern")),
        }
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.effective_pos(self.pos)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn kind_at(&self, ahead: usize) -> &TokenKind {
        let mut pos = self.effective_pos(self.pos);
        for _ in 0..ahead {
            pos = self.effective_pos(pos + 1);
        }
        &self.tokens[pos].kind
    }

    /// Skip newline tokens while inside brackets (implicit line joining).
    fn effective_pos(&self, mut pos: usize) -> usize {
        if self.depth > 0 {
            while matches!(self.tokens[pos].kind, TokenKind::Newline) {
                pos += 1;
            }
        }
        pos.min(self.tokens.len() - 1)
    }

    fn advance(&mut self) -> Token {
        let pos = self.effective_pos(self.pos);
        let token = self.tokens[pos].clone();
        if !matches!(token.kind, TokenKind::Eof) {
            self.pos = pos + 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            return true;
        }
        false
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<Token, ParseError> {
        if self.check(kind) {
            return Ok(self.advance());
        }
        Err(self.unexpected(&kind.describe()))
    }

    fn expect_ident(&mut self) -> Result<(String, Span), ParseError> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                let span = self.advance().span;
                Ok((name, span))
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    fn open_bracket(&mut self) {
        self.advance();
        self.depth += 1;
    }

    fn close_bracket(&mut self, kind: &TokenKind) -> Result<Span, ParseError> {
        let token = self.expect(kind)?;
        self.depth = self.depth.saturating_sub(1);
        Ok(token.span)
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline) {
            self.advance();
        }
    }

    /// Consume the end of the current logical line.
    fn end_line(&mut self) -> Result<(), ParseError> {
        match self.peek_kind() {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof => Ok(()),
            _ => Err(self.unexpected("end of line")),
        }
    }

    fn unexpected(&self, wanted: &str) -> ParseError {
        let token = self.peek();
        ParseError::at(
            token.span,
            format!("expected {wanted}, found {}", token.kind.describe()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_import_line() {
        let ast = parse("from warden.detectors import prompt_injection, pii\n").unwrap();
        assert_eq!(ast.imports.len(), 1);
        assert_eq!(ast.imports[0].module, "warden.detectors");
        assert_eq!(ast.imports[0].names.len(), 2);
    }

    #[test]
    fn parses_block_rule_with_pattern() {
        let source = "raise \"no exfiltration\" if:\n    (a: ToolCall) -> (b: ToolCall)\n    a is tool:get_inbox\n    b is tool:send_email({to: r\"^(?!Peter$).*$\"})\n";
        let ast = parse(source).unwrap();
        assert_eq!(ast.rules.len(), 1);
        let rule = &ast.rules[0];
        assert_eq!(rule.body.len(), 3);
        assert!(matches!(
            rule.ctor,
            ErrorCtor::Message { ref message, .. } if message == "no exfiltration"
        ));
        match &rule.body[2].kind {
            ExprKind::Is { pattern, .. } => {
                assert_eq!(pattern.name.as_deref(), Some("send_email"));
                assert!(matches!(pattern.args, Some(Pattern::Object(_))));
            }
            other => panic!("expected is-pattern, got {other:?}"),
        }
    }

    #[test]
    fn parses_inline_rule_with_semicolons() {
        let source = "raise \"X\" if (a: ToolCall)->(b: ToolCall); a is tool:get_inbox; b is tool:send_email({to: \"Attacker\"})\n";
        let ast = parse(source).unwrap();
        assert_eq!(ast.rules[0].body.len(), 3);
    }

    #[test]
    fn parses_predicate_definition() {
        let source = "untrusted(out: ToolOutput) := prompt_injection(out.content, threshold=0.7)\n";
        let ast = parse(source).unwrap();
        assert_eq!(ast.predicates.len(), 1);
        let pred = &ast.predicates[0];
        assert_eq!(pred.name, "untrusted");
        assert_eq!(pred.params[0].ty, TypeName::ToolOutput);
        match &pred.body.kind {
            ExprKind::Call { name, args, kwargs } => {
                assert_eq!(name, "prompt_injection");
                assert_eq!(args.len(), 1);
                assert_eq!(kwargs[0].0, "threshold");
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn parses_ctor_with_kwargs() {
        let source = "raise AccessControlViolation(\"denied\", user=input.username, resource=b) if:\n    (b: ToolCall)\n";
        let ast = parse(source).unwrap();
        match &ast.rules[0].ctor {
            ErrorCtor::Call { name, kwargs, .. } => {
                assert_eq!(name, "AccessControlViolation");
                assert_eq!(kwargs.len(), 2);
            }
            other => panic!("expected ctor call, got {other:?}"),
        }
    }

    #[test]
    fn multiline_pattern_joins_lines() {
        let source = "raise \"X\" if:\n    b is tool:send_email({\n        to: <EMAIL_ADDRESS>,\n    })\n";
        let ast = parse(source).unwrap();
        match &ast.rules[0].body[0].kind {
            ExprKind::Is { pattern, .. } => match pattern.args.as_ref().unwrap() {
                Pattern::Object(fields) => {
                    assert!(matches!(fields[0].1, Pattern::Classifier(ref c, _) if c == "EMAIL_ADDRESS"));
                }
                other => panic!("expected object pattern, got {other:?}"),
            },
            other => panic!("expected is-pattern, got {other:?}"),
        }
    }

    #[test]
    fn membership_generator_parses_as_in() {
        let source = "raise \"X\" if:\n    (m: Message)\n    (c: ToolCall) in m.tool_calls\n";
        let ast = parse(source).unwrap();
        match &ast.rules[0].body[1].kind {
            ExprKind::Binary { op: BinaryOp::In, lhs, .. } => {
                assert!(matches!(lhs.kind, ExprKind::Decl { .. }));
            }
            other => panic!("expected in-binding, got {other:?}"),
        }
    }

    #[test]
    fn dict_display_parses_in_expressions() {
        let source =
            "raise \"X\" if:\n    (c: ToolCall)\n    c.function.arguments == {to: \"Eve\", \"subject\": \"hi\"}\n";
        let ast = parse(source).unwrap();
        match &ast.rules[0].body[1].kind {
            ExprKind::Binary { op: BinaryOp::Eq, rhs, .. } => match &rhs.kind {
                ExprKind::Dict(entries) => {
                    assert_eq!(entries.len(), 2);
                    assert_eq!(entries[0].0, "to");
                    assert_eq!(entries[1].0, "subject");
                }
                other => panic!("expected dict display, got {other:?}"),
            },
            other => panic!("expected equality, got {other:?}"),
        }
    }

    #[test]
    fn empty_dict_display_parses() {
        let ast = parse("raise \"X\" if:\n    (c: ToolCall)\n    c.function.arguments == {}\n")
            .unwrap();
        match &ast.rules[0].body[1].kind {
            ExprKind::Binary { rhs, .. } => {
                assert!(matches!(&rhs.kind, ExprKind::Dict(entries) if entries.is_empty()));
            }
            other => panic!("expected equality, got {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_rule_body() {
        let err = parse("raise \"X\" if:\n").unwrap_err();
        assert!(err.message.contains("at least one atom"));
    }

    #[test]
    fn reports_unknown_type() {
        let err = parse("raise \"X\" if (z: Widget)\n").unwrap_err();
        assert!(err.message.contains("unknown type"));
    }

    #[test]
    fn grouping_still_works() {
        let ast = parse("raise \"X\" if:\n    (m: Message)\n    (m.role == \"user\" or m.role == \"system\")\n").unwrap();
        assert!(matches!(
            ast.rules[0].body[1].kind,
            ExprKind::Binary { op: BinaryOp::Or, .. }
        ));
    }
}
