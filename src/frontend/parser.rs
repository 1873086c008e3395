use crate::{
    diagnostics::{Diagnostic, Stage},
    frontend::{
        ast::{
            Expr, ExprKind, FuncDecl, OpSeqItem, OperatorDecl, Parameter, Stmt, StmtKind,
            TypeAnnotation,
        },
        intern::InternedSymbol,
        lexer::{Keyword, SourceLocation, Token, TokenKind},
    },
    middle::operators::{Associativity, OpPosition},
};

/// Recursive-descent parser over the token stream.
///
/// Expressions are parsed as flat operator sequences (no precedence here);
/// the operator resolver reshapes them after the symbol tables exist. On a
/// syntax error the parser records a diagnostic and synchronizes to the next
/// statement boundary, so one bad statement does not hide later errors.
#[derive(Debug)]
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    errors: Vec<Diagnostic>,
}

impl Parser {
    pub fn parse_program(tokens: Vec<Token>) -> (Vec<Stmt>, Vec<Diagnostic>) {
        debug_assert!(matches!(
            tokens.last(),
            Some(Token {
                kind: TokenKind::EndOfFile,
                ..
            })
        ));

        let mut parser = Self {
            tokens,
            current: 0,
            errors: Vec::new(),
        };

        let mut stmts = Vec::new();
        while !parser.at_end() {
            match parser.parse_stmt() {
                Some(stmt) => stmts.push(stmt),
                None => parser.synchronize(),
            }
        }

        (stmts, parser.errors)
    }

    /* ===== Statements ===== */

    fn parse_stmt(&mut self) -> Option<Stmt> {
        if let TokenKind::Keyword(keyword) = self.peek().kind {
            match keyword {
                Keyword::Let => return self.parse_let_stmt(),
                Keyword::Func => return self.parse_func_stmt(),
                Keyword::Operator => return self.parse_operator_decl(),
                Keyword::If => return self.parse_if_stmt(),
                Keyword::Return => return self.parse_return_stmt(),
                Keyword::While => return self.parse_while_stmt(),
                _ => {}
            }
        }

        if self.check_punct("{") {
            return self.parse_block_stmt();
        }

        self.parse_expr_stmt()
    }

    fn parse_let_stmt(&mut self) -> Option<Stmt> {
        let loc = self.peek().location;
        self.advance(); // consume 'let'

        if !self.check(TokenKind::Identifier) {
            self.error("Expected identifier after 'let'");
            return None;
        }
        let name = InternedSymbol::new(&self.advance().text);

        let ty = if self.check_punct(":") {
            self.advance();
            Some(self.parse_type_annotation()?)
        } else {
            None
        };

        if !self.check_operator("=") {
            self.error("Expected '=' in let statement");
            return None;
        }
        self.advance();

        let init = self.parse_expr()?;

        if !self.expect_punct(";", "Expected ';' after let statement") {
            return None;
        }

        Some(Stmt {
            kind: StmtKind::Let { name, ty, init },
            loc,
        })
    }

    fn parse_func_stmt(&mut self) -> Option<Stmt> {
        let loc = self.peek().location;
        self.advance(); // consume 'func'

        if !self.check(TokenKind::Identifier) {
            self.error("Expected function name after 'func'");
            return None;
        }
        let name = InternedSymbol::new(&self.advance().text);

        if !self.check_punct("(") {
            self.error("Expected '(' after function name");
            return None;
        }
        self.advance();

        let params = self.parse_parameter_list(false)?;

        if !self.check_punct(")") {
            self.error("Expected ')' after parameters");
            return None;
        }
        self.advance();

        let return_type = if self.check_punct(":") {
            self.advance();
            Some(self.parse_type_annotation()?)
        } else {
            None
        };

        let body = if self.check_punct("{") {
            Some(Box::new(self.parse_block_stmt()?))
        } else if self.check_punct(";") {
            self.advance();
            None
        } else {
            self.error("Expected '{' or ';' after function signature");
            return None;
        };

        Some(Stmt {
            kind: StmtKind::Func(FuncDecl {
                name,
                params,
                return_type,
                body,
            }),
            loc,
        })
    }

    fn parse_operator_decl(&mut self) -> Option<Stmt> {
        let loc = self.peek().location;
        self.advance(); // consume 'operator'

        let position = match self.peek().kind {
            TokenKind::Keyword(Keyword::Prefix) => OpPosition::Prefix,
            TokenKind::Keyword(Keyword::Infix) => OpPosition::Infix,
            TokenKind::Keyword(Keyword::Postfix) => OpPosition::Postfix,
            _ => {
                self.error("Expected operator position ('prefix', 'infix', or 'postfix')");
                return None;
            }
        };
        self.advance();

        if !self.check(TokenKind::Operator) {
            self.error("Expected operator symbol");
            return None;
        }
        let symbol = InternedSymbol::new(&self.advance().text);

        if !self.check_punct("(") {
            self.error("Expected '(' after operator symbol");
            return None;
        }
        self.advance();

        let params = self.parse_parameter_list(true)?;

        // Arity is fixed by the position and checked here, not deferred
        match position {
            OpPosition::Prefix if params.len() != 1 => {
                self.error("Prefix operator must have exactly 1 parameter");
                return None;
            }
            OpPosition::Infix if params.len() != 2 => {
                self.error("Infix operator must have exactly 2 parameters");
                return None;
            }
            OpPosition::Postfix if params.len() != 1 => {
                self.error("Postfix operator must have exactly 1 parameter");
                return None;
            }
            _ => {}
        }

        if !self.check_punct(")") {
            self.error("Expected ')' after parameters");
            return None;
        }
        self.advance();

        if !self.check_punct(":") {
            self.error("Expected ':' and return type after operator parameters");
            return None;
        }
        self.advance();

        let return_type = Some(self.parse_type_annotation()?);

        let mut precedence = 0;
        let mut assoc = Associativity::Left;

        if position == OpPosition::Infix {
            if !self.check(TokenKind::Keyword(Keyword::Prec)) {
                self.error("Expected 'prec' keyword for infix operator");
                return None;
            }
            self.advance();

            if !self.check(TokenKind::Integer) {
                self.error("Expected integer precedence value");
                return None;
            }
            precedence = self.advance().text.parse().unwrap_or(0);

            match self.peek().kind {
                TokenKind::Keyword(Keyword::AssocLeft) => {
                    self.advance();
                    assoc = Associativity::Left;
                }
                TokenKind::Keyword(Keyword::AssocRight) => {
                    self.advance();
                    assoc = Associativity::Right;
                }
                _ => {}
            }
        }

        let body = if self.check_punct("{") {
            Some(Box::new(self.parse_block_stmt()?))
        } else {
            if !self.expect_punct(";", "Expected ';' after operator declaration") {
                return None;
            }
            None
        };

        Some(Stmt {
            kind: StmtKind::OperatorDecl(OperatorDecl {
                symbol,
                position,
                params,
                return_type,
                precedence,
                assoc,
                body,
            }),
            loc,
        })
    }

    fn parse_if_stmt(&mut self) -> Option<Stmt> {
        let loc = self.peek().location;
        self.advance(); // consume 'if'

        let condition = self.parse_expr()?;
        let then_branch = Box::new(self.parse_block_stmt()?);

        let else_branch = if self.check(TokenKind::Keyword(Keyword::Else)) {
            self.advance();

            let branch = if self.check(TokenKind::Keyword(Keyword::If)) {
                self.parse_if_stmt()?
            } else {
                self.parse_block_stmt()?
            };

            Some(Box::new(branch))
        } else {
            None
        };

        Some(Stmt {
            kind: StmtKind::If {
                condition,
                then_branch,
                else_branch,
            },
            loc,
        })
    }

    fn parse_return_stmt(&mut self) -> Option<Stmt> {
        let loc = self.peek().location;
        self.advance(); // consume 'return'

        let value = if self.check_punct(";") {
            None
        } else {
            Some(self.parse_expr()?)
        };

        if !self.expect_punct(";", "Expected ';' after return statement") {
            return None;
        }

        Some(Stmt {
            kind: StmtKind::Return(value),
            loc,
        })
    }

    fn parse_while_stmt(&mut self) -> Option<Stmt> {
        let loc = self.peek().location;
        self.advance(); // consume 'while'

        let condition = self.parse_expr()?;
        let body = Box::new(self.parse_block_stmt()?);

        Some(Stmt {
            kind: StmtKind::While { condition, body },
            loc,
        })
    }

    fn parse_block_stmt(&mut self) -> Option<Stmt> {
        if !self.check_punct("{") {
            self.error("Expected '{'");
            return None;
        }
        let loc = self.peek().location;
        self.advance();

        let mut stmts = Vec::new();
        while !self.at_end() && !self.check_punct("}") {
            match self.parse_stmt() {
                Some(stmt) => stmts.push(stmt),
                None => self.synchronize(),
            }
        }

        if !self.check_punct("}") {
            self.error("Expected '}'");
            return None;
        }
        self.advance();

        Some(Stmt {
            kind: StmtKind::Block(stmts),
            loc,
        })
    }

    fn parse_expr_stmt(&mut self) -> Option<Stmt> {
        let expr = self.parse_expr()?;
        let loc = expr.loc;

        if !self.expect_punct(";", "Expected ';' after expression") {
            return None;
        }

        Some(Stmt {
            kind: StmtKind::Expr(expr),
            loc,
        })
    }

    fn parse_parameter_list(&mut self, require_types: bool) -> Option<Vec<Parameter>> {
        let mut params = Vec::new();

        while !self.check_punct(")") {
            if !params.is_empty() {
                if !self.check_punct(",") {
                    self.error("Expected ',' between parameters");
                    return None;
                }
                self.advance();
            }

            if !self.check(TokenKind::Identifier) {
                self.error("Expected parameter name");
                return None;
            }
            let token = self.advance();
            let name = InternedSymbol::new(&token.text);
            let loc = token.location;

            let ty = if self.check_punct(":") {
                self.advance();
                Some(self.parse_type_annotation()?)
            } else if require_types {
                self.error("Expected ':' after operator parameter name");
                return None;
            } else {
                // Function parameters may omit the annotation syntactically;
                // the symbol-table builder rejects the omission with a proper
                // location.
                None
            };

            params.push(Parameter { name, ty, loc });
        }

        Some(params)
    }

    fn parse_type_annotation(&mut self) -> Option<TypeAnnotation> {
        if !self.check(TokenKind::Identifier) {
            self.error("Expected type name");
            return None;
        }

        let token = self.advance();
        Some(TypeAnnotation {
            name: InternedSymbol::new(&token.text),
            loc: token.location,
        })
    }

    /* ===== Expressions ===== */

    /// Parses one expression as a flat alternation of operands and operator
    /// symbols. Operators may be consecutive (prefix/postfix disambiguation
    /// happens in the resolver); two adjacent operands end the expression.
    fn parse_expr(&mut self) -> Option<Expr> {
        let loc = self.peek().location;

        let mut items = Vec::new();
        let mut last_was_operand = false;

        while !self.at_end() {
            if self.check(TokenKind::Operator) {
                let token = self.advance();
                items.push(OpSeqItem::Operator {
                    symbol: InternedSymbol::new(&token.text),
                    loc: token.location,
                });
                last_was_operand = false;
            } else if self.can_start_primary() {
                if last_was_operand {
                    // Two operands in a row terminate the expression
                    break;
                }

                let operand = self.parse_primary_expr()?;
                items.push(OpSeqItem::Operand(operand));
                last_was_operand = true;
            } else {
                break;
            }
        }

        if items.is_empty() {
            self.error("Expected expression");
            return None;
        }

        if items.len() == 1 {
            if let Some(OpSeqItem::Operand(_)) = items.first() {
                let Some(OpSeqItem::Operand(operand)) = items.pop() else {
                    unreachable!()
                };
                return Some(operand);
            }
        }

        Some(Expr::new(ExprKind::OpSequence(items), loc))
    }

    fn parse_primary_expr(&mut self) -> Option<Expr> {
        let token = self.peek().clone();

        match token.kind {
            TokenKind::Integer => {
                self.advance();
                Some(Expr::new(
                    ExprKind::IntLiteral(InternedSymbol::new(&token.text)),
                    token.location,
                ))
            }
            TokenKind::Float => {
                self.advance();
                Some(Expr::new(
                    ExprKind::FloatLiteral(InternedSymbol::new(&token.text)),
                    token.location,
                ))
            }
            TokenKind::String => {
                self.advance();
                Some(Expr::new(
                    ExprKind::StringLiteral(InternedSymbol::new(&token.text)),
                    token.location,
                ))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Some(Expr::new(ExprKind::BoolLiteral(true), token.location))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Some(Expr::new(ExprKind::BoolLiteral(false), token.location))
            }
            TokenKind::Identifier => {
                self.advance();
                let identifier = Expr::new(
                    ExprKind::Identifier(InternedSymbol::new(&token.text)),
                    token.location,
                );

                if self.check_punct("(") {
                    return self.parse_call_expr(identifier);
                }

                Some(identifier)
            }
            TokenKind::Punctuation if token.text == "(" => {
                self.advance();
                let expr = self.parse_expr()?;

                if !self.check_punct(")") {
                    self.error("Expected ')' after expression");
                    return None;
                }
                self.advance();

                Some(expr)
            }
            _ => {
                self.error(&format!("Unexpected token in expression: {}", token.text));
                None
            }
        }
    }

    fn parse_call_expr(&mut self, callee: Expr) -> Option<Expr> {
        let loc = self.peek().location;
        self.advance(); // consume '('

        let mut args = Vec::new();
        while !self.check_punct(")") {
            if !args.is_empty() {
                if !self.check_punct(",") {
                    self.error("Expected ',' between arguments");
                    return None;
                }
                self.advance();
            }

            args.push(self.parse_expr()?);
        }

        if !self.check_punct(")") {
            self.error("Expected ')' after arguments");
            return None;
        }
        self.advance();

        Some(Expr::new(
            ExprKind::Call {
                callee: Box::new(callee),
                args,
            },
            loc,
        ))
    }

    fn can_start_primary(&self) -> bool {
        let token = self.peek();

        match token.kind {
            TokenKind::Integer | TokenKind::Float | TokenKind::String | TokenKind::Identifier => {
                true
            }
            TokenKind::Keyword(Keyword::True) | TokenKind::Keyword(Keyword::False) => true,
            TokenKind::Punctuation => token.text == "(",
            _ => false,
        }
    }

    /* ===== Helpers ===== */

    /// Current token with comments skipped; the stream's trailing EndOfFile
    /// token makes this total.
    fn peek(&self) -> &Token {
        let mut idx = self.current;
        while idx < self.tokens.len() && self.tokens[idx].kind == TokenKind::Comment {
            idx += 1;
        }

        self.tokens.get(idx).unwrap_or_else(|| {
            self.tokens
                .last()
                .expect("token stream always contains EndOfFile")
        })
    }

    fn advance(&mut self) -> Token {
        while self.current < self.tokens.len()
            && self.tokens[self.current].kind == TokenKind::Comment
        {
            self.current += 1;
        }

        let token = self
            .tokens
            .get(self.current)
            .unwrap_or_else(|| {
                self.tokens
                    .last()
                    .expect("token stream always contains EndOfFile")
            })
            .clone();

        if self.current < self.tokens.len() {
            self.current += 1;
        }

        token
    }

    fn at_end(&self) -> bool {
        self.peek().kind == TokenKind::EndOfFile
    }

    fn check(&self, kind: TokenKind) -> bool {
        !self.at_end() && self.peek().kind == kind
    }

    fn check_punct(&self, text: &str) -> bool {
        let token = self.peek();
        token.kind == TokenKind::Punctuation && token.text == text
    }

    fn check_operator(&self, text: &str) -> bool {
        let token = self.peek();
        token.kind == TokenKind::Operator && token.text == text
    }

    fn expect_punct(&mut self, text: &str, message: &str) -> bool {
        if self.check_punct(text) {
            self.advance();
            return true;
        }

        // The token is missing; point at where it should have been inserted
        // (the end of the previous token), not at whatever follows.
        self.error_at_previous_end(message);
        false
    }

    fn error(&mut self, message: &str) {
        let location = self.peek().location;
        self.errors
            .push(Diagnostic::new(Stage::Parser, message, location));
    }

    fn error_at_previous_end(&mut self, message: &str) {
        if self.current == 0 {
            self.error(message);
            return;
        }

        let mut idx = self.current - 1;
        while idx > 0 && self.tokens[idx].kind == TokenKind::Comment {
            idx -= 1;
        }

        let previous = &self.tokens[idx];
        let location = SourceLocation::new(
            previous.location.line,
            previous.location.end_column,
            previous.location.end_column + 1,
        );
        self.errors
            .push(Diagnostic::new(Stage::Parser, message, location));
    }

    /// Panic-mode recovery: skip to a `;` (consumed), a `}` (left for the
    /// enclosing block), or a statement-starter keyword.
    fn synchronize(&mut self) {
        while !self.at_end() {
            if self.check_punct(";") {
                self.advance();
                return;
            }

            if self.check_punct("}") {
                return;
            }

            if let TokenKind::Keyword(keyword) = self.peek().kind {
                if matches!(
                    keyword,
                    Keyword::Let | Keyword::Func | Keyword::If | Keyword::Return | Keyword::While
                ) {
                    return;
                }
            }

            self.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::frontend::{lexer::Lexer, SourceFile};

    fn parse(source: &str) -> (Vec<Stmt>, Vec<Diagnostic>) {
        let file = SourceFile::from_string(source);
        Parser::parse_program(Lexer::tokenize_all(&file))
    }

    fn parse_ok(source: &str) -> Vec<Stmt> {
        let (stmts, errors) = parse(source);
        assert_eq!(errors, vec![], "unexpected parse errors");
        stmts
    }

    fn dump(stmts: &[Stmt]) -> String {
        let mut out = String::new();
        for stmt in stmts {
            stmt.dump(&mut out, 0);
        }
        out
    }

    #[test]
    fn expression_stays_flat() {
        let stmts = parse_ok("let x = 1 + 2 * 3;");

        assert_eq!(
            dump(&stmts),
            "Let(x = OperatorSeq(IntLiteral(1) + IntLiteral(2) * IntLiteral(3)))\n"
        );
    }

    #[test]
    fn single_operand_collapses() {
        let stmts = parse_ok("let x = 42;");

        assert_eq!(dump(&stmts), "Let(x = IntLiteral(42))\n");
    }

    #[test]
    fn consecutive_operators_are_collected() {
        let stmts = parse_ok("let x = - - 5 + 1;");

        assert_eq!(
            dump(&stmts),
            "Let(x = OperatorSeq(- - IntLiteral(5) + IntLiteral(1)))\n"
        );
    }

    #[test]
    fn parenthesized_subexpressions_nest() {
        let stmts = parse_ok("let x = (1 + 2) * 3;");

        assert_eq!(
            dump(&stmts),
            "Let(x = OperatorSeq(OperatorSeq(IntLiteral(1) + IntLiteral(2)) * IntLiteral(3)))\n"
        );
    }

    #[test]
    fn calls_with_arguments() {
        let stmts = parse_ok("f(1, g(x), 2 + 3);");

        assert_eq!(
            dump(&stmts),
            "Expr(Call(Identifier(f), [IntLiteral(1), Call(Identifier(g), [Identifier(x)]), \
             OperatorSeq(IntLiteral(2) + IntLiteral(3))]))\n"
        );
    }

    #[test]
    fn func_declaration_and_definition() {
        let stmts = parse_ok(indoc::indoc! {"
            func ext(a: i32): i32;
            func add(a: i32, b: i32): i32 {
                return a + b;
            }
        "});

        assert_eq!(
            dump(&stmts),
            indoc::indoc! {"
                Func(ext(a : i32) : i32)
                Func(add(a : i32, b : i32) : i32)
                  Block
                    Return(OperatorSeq(Identifier(a) + Identifier(b)))
            "}
        );
    }

    #[test]
    fn operator_declaration_forms() {
        let stmts = parse_ok(indoc::indoc! {"
            operator infix ** (a: f64, b: f64): f64 prec 90 assoc_right;
            operator prefix ! (x: bool): bool;
            operator postfix ++ (x: i32): i32 { return x + 1; }
        "});

        assert_eq!(
            dump(&stmts),
            indoc::indoc! {"
                OperatorDecl(infix **(a : f64, b : f64) : f64 prec 90 assoc_right)
                OperatorDecl(prefix !(x : bool) : bool)
                OperatorDecl(postfix ++(x : i32) : i32)
                  Block
                    Return(OperatorSeq(Identifier(x) + IntLiteral(1)))
            "}
        );
    }

    #[test]
    fn infix_operator_requires_prec() {
        let (_, errors) = parse("operator infix <> (a: i32, b: i32): bool;");

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Expected 'prec' keyword for infix operator");
    }

    #[test]
    fn operator_arity_is_checked_at_parse_time() {
        let (_, errors) = parse("operator prefix - (a: i32, b: i32): i32;");

        assert!(errors
            .iter()
            .any(|e| e.message == "Prefix operator must have exactly 1 parameter"));
    }

    #[test]
    fn if_else_chains() {
        let stmts = parse_ok(indoc::indoc! {"
            if a < b {
                return a;
            } else if a == b {
                return 0;
            } else {
                return b;
            }
        "});

        assert_eq!(
            dump(&stmts),
            indoc::indoc! {"
                If(OperatorSeq(Identifier(a) < Identifier(b)))
                  Block
                    Return(Identifier(a))
                Else
                  If(OperatorSeq(Identifier(a) == Identifier(b)))
                    Block
                      Return(IntLiteral(0))
                  Else
                    Block
                      Return(Identifier(b))
            "}
        );
    }

    #[test]
    fn while_and_blocks() {
        let stmts = parse_ok("while x < 10 { x += 1; }");

        assert_eq!(
            dump(&stmts),
            indoc::indoc! {"
                While(OperatorSeq(Identifier(x) < IntLiteral(10)))
                  Block
                    Expr(OperatorSeq(Identifier(x) += IntLiteral(1)))
            "}
        );
    }

    #[test]
    fn missing_semicolon_anchors_at_previous_token_end() {
        let (_, errors) = parse("let x = 1\nlet y = 2;");

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Expected ';' after let statement");
        // `1` ends at line 1, column 10
        assert_eq!(errors[0].location, SourceLocation::new(1, 10, 11));
    }

    #[test]
    fn recovery_continues_after_errors() {
        let (stmts, errors) = parse(indoc::indoc! {"
            let = 1;
            let y = 2;
            let = 3;
            let z = 4;
        "});

        assert_eq!(errors.len(), 2);
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn recovery_preserves_closing_brace() {
        let (stmts, errors) = parse(indoc::indoc! {"
            func f(): i32 {
                let = 1;
            }
            let ok = 5;
        "});

        assert_eq!(errors.len(), 1);
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn comments_are_transparent() {
        let stmts = parse_ok(indoc::indoc! {"
            # leading comment
            let x = 1 # inline comment
                + 2;
        "});

        assert_eq!(
            dump(&stmts),
            "Let(x = OperatorSeq(IntLiteral(1) + IntLiteral(2)))\n"
        );
    }

    #[test]
    fn two_adjacent_operands_end_the_expression() {
        // `return fib` parses, then `(n)` would be a call; but a bare
        // identifier followed by another primary stops the sequence and the
        // missing semicolon is reported.
        let (_, errors) = parse("let x = 1 2;");

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Expected ';' after let statement");
    }
}
