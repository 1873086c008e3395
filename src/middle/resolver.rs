use crate::{
    diagnostics::{Diagnostic, Stage},
    frontend::{
        ast::{Expr, ExprKind, OpSeqItem, Stmt, StmtKind},
        intern::InternedSymbol,
        lexer::SourceLocation,
    },
    middle::{
        operators::{Associativity, OpPosition},
        symbols::ScopedSymbolTable,
    },
};

/// One infix operator collected during the folding pass, with everything the
/// tree builder needs to pick split points.
#[derive(Debug)]
struct InfixEntry {
    symbol: InternedSymbol,
    precedence: i32,
    assoc: Associativity,
    loc: SourceLocation,
}

/// Rewrites every operator sequence in the AST into binary/unary form.
///
/// The algorithm has two steps. A greedy left-to-right pass folds prefix and
/// postfix operators around each operand, leaving `operand (infix operand)*`.
/// A recursive pass then splits on the lowest-precedence operator, breaking
/// ties towards the rightmost occurrence for left-associative operators and
/// the leftmost for right-associative ones; operators of equal precedence
/// with disagreeing associativity are a hard error rather than an implicit
/// tie-break.
#[derive(Debug)]
pub struct OperatorResolver<'symbols> {
    symbols: &'symbols ScopedSymbolTable,
    errors: Vec<Diagnostic>,
}

impl<'symbols> OperatorResolver<'symbols> {
    pub fn resolve_program(stmts: &mut [Stmt], symbols: &'symbols ScopedSymbolTable) -> Vec<Diagnostic> {
        let mut resolver = Self {
            symbols,
            errors: Vec::new(),
        };

        for stmt in stmts {
            resolver.resolve_stmt(stmt);
        }

        resolver.errors
    }

    fn error(&mut self, message: impl Into<String>, loc: SourceLocation) {
        self.errors
            .push(Diagnostic::new(Stage::Semantic, message, loc));
    }

    fn resolve_stmt(&mut self, stmt: &mut Stmt) {
        match &mut stmt.kind {
            StmtKind::Let { init, .. } => self.resolve_in_place(init),
            StmtKind::Func(func) => {
                if let Some(body) = &mut func.body {
                    self.resolve_stmt(body);
                }
            }
            StmtKind::OperatorDecl(op) => {
                if let Some(body) = &mut op.body {
                    self.resolve_stmt(body);
                }
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.resolve_in_place(condition);
                self.resolve_stmt(then_branch);
                if let Some(else_branch) = else_branch {
                    self.resolve_stmt(else_branch);
                }
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.resolve_in_place(value);
                }
            }
            StmtKind::While { condition, body } => {
                self.resolve_in_place(condition);
                self.resolve_stmt(body);
            }
            StmtKind::Expr(expr) => self.resolve_in_place(expr),
            StmtKind::Block(stmts) => {
                for stmt in stmts {
                    self.resolve_stmt(stmt);
                }
            }
        }
    }

    fn resolve_in_place(&mut self, expr: &mut Expr) {
        let loc = expr.loc;
        let owned = std::mem::replace(expr, Expr::new(ExprKind::BoolLiteral(false), loc));

        if let Some(resolved) = self.resolve_expr(owned) {
            *expr = resolved;
        }
        // On error the placeholder stays behind; the recorded diagnostics
        // halt the pipeline before anything reads it.
    }

    fn resolve_expr(&mut self, expr: Expr) -> Option<Expr> {
        match expr.kind {
            ExprKind::OpSequence(items) => self.resolve_sequence(items, expr.loc),
            ExprKind::Call { callee, args } => {
                let callee = self.resolve_expr(*callee)?;

                let mut resolved_args = Vec::with_capacity(args.len());
                for arg in args {
                    resolved_args.push(self.resolve_expr(arg)?);
                }

                Some(Expr::new(
                    ExprKind::Call {
                        callee: Box::new(callee),
                        args: resolved_args,
                    },
                    expr.loc,
                ))
            }
            // Literals, identifiers, and already-resolved nodes pass through,
            // which also makes a second resolver run a no-op
            _ => Some(expr),
        }
    }

    fn resolve_sequence(&mut self, items: Vec<OpSeqItem>, loc: SourceLocation) -> Option<Expr> {
        let mut operands: Vec<Expr> = Vec::new();
        let mut infix_ops: Vec<InfixEntry> = Vec::new();

        let mut items = items.into_iter().peekable();

        loop {
            // Run of prefix operators before the next operand. Every operator
            // in this run must be declared prefix.
            let mut prefix_ops: Vec<(InternedSymbol, SourceLocation)> = Vec::new();
            while matches!(items.peek(), Some(OpSeqItem::Operator { .. })) {
                let Some(OpSeqItem::Operator { symbol, loc: op_loc }) = items.next() else {
                    unreachable!()
                };

                if !self.symbols.has_operator(symbol, OpPosition::Prefix) {
                    self.error(
                        format!("Operator '{symbol}' cannot be used as prefix operator here"),
                        op_loc,
                    );
                    return None;
                }

                prefix_ops.push((symbol, op_loc));
            }

            let mut current = match items.next() {
                Some(OpSeqItem::Operand(operand)) => self.resolve_expr(operand)?,
                _ => {
                    self.error("Expected operand after prefix operators", loc);
                    return None;
                }
            };

            // Innermost prefix applies first
            for (symbol, op_loc) in prefix_ops.into_iter().rev() {
                current = Expr::new(
                    ExprKind::Unary {
                        op: symbol,
                        operand: Box::new(current),
                        position: OpPosition::Prefix,
                    },
                    op_loc,
                );
            }

            // Greedily take postfix operators; the first operator without a
            // postfix declaration becomes the infix candidate, even if it
            // also has one.
            loop {
                let Some(OpSeqItem::Operator { symbol, .. }) = items.peek() else {
                    break;
                };
                if !self.symbols.has_operator(*symbol, OpPosition::Postfix) {
                    break;
                }

                let Some(OpSeqItem::Operator { symbol, loc: op_loc }) = items.next() else {
                    unreachable!()
                };
                current = Expr::new(
                    ExprKind::Unary {
                        op: symbol,
                        operand: Box::new(current),
                        position: OpPosition::Postfix,
                    },
                    op_loc,
                );
            }

            operands.push(current);

            match items.next() {
                None => break,
                Some(OpSeqItem::Operator { symbol, loc: op_loc }) => {
                    let Some(info) = self.symbols.find_operator(symbol, OpPosition::Infix) else {
                        self.error(
                            format!("Operator '{symbol}' cannot be used as infix operator"),
                            op_loc,
                        );
                        return None;
                    };

                    infix_ops.push(InfixEntry {
                        symbol,
                        precedence: info.precedence,
                        assoc: info.assoc,
                        loc: op_loc,
                    });
                }
                Some(OpSeqItem::Operand(_)) => {
                    self.error("Expected infix operator between operands", loc);
                    return None;
                }
            }
        }

        if infix_ops.len() + 1 != operands.len() {
            self.error(
                format!(
                    "Operator sequence structure error: {} infix operators for {} operands",
                    infix_ops.len(),
                    operands.len()
                ),
                loc,
            );
            return None;
        }

        if operands.len() == 1 {
            return operands.pop();
        }

        let end = operands.len() - 1;
        let mut operands: Vec<Option<Expr>> = operands.into_iter().map(Some).collect();
        self.build_infix_tree(&mut operands, &infix_ops, 0, end)
    }

    /// Recursive precedence-directed split over `operands[start..=end]`;
    /// operator `i` sits between operands `i` and `i + 1`.
    fn build_infix_tree(
        &mut self,
        operands: &mut [Option<Expr>],
        ops: &[InfixEntry],
        start: usize,
        end: usize,
    ) -> Option<Expr> {
        if start == end {
            return operands[start].take();
        }

        let mut lowest_prec = i32::MAX;
        let mut split = start;
        let mut split_assoc = Associativity::Left;

        for (i, entry) in ops.iter().enumerate().take(end).skip(start) {
            if entry.precedence < lowest_prec {
                lowest_prec = entry.precedence;
                split = i;
                split_assoc = entry.assoc;
            } else if entry.precedence == lowest_prec {
                if entry.assoc != split_assoc {
                    self.error(
                        format!(
                            "Mixed associativity at same precedence level: operator '{}' ({}) \
                             conflicts with operator '{}' ({}) at precedence {}",
                            entry.symbol,
                            entry.assoc.keyword(),
                            ops[split].symbol,
                            split_assoc.keyword(),
                            entry.precedence
                        ),
                        entry.loc,
                    );
                    return None;
                }

                // Left-associative operators prefer the rightmost split so
                // the left subtree grows; right-associative keep the leftmost
                if entry.assoc == Associativity::Left {
                    split = i;
                }
            }
        }

        let symbol = ops[split].symbol;
        let op_loc = ops[split].loc;

        let lhs = self.build_infix_tree(operands, ops, start, split)?;
        let rhs = self.build_infix_tree(operands, ops, split + 1, end)?;

        Some(Expr::new(
            ExprKind::Binary {
                op: symbol,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            op_loc,
        ))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        frontend::{lexer::Lexer, parser::Parser, SourceFile},
        middle::builder::SymbolTableBuilder,
    };

    /// Prelude plus optional extra declarations, ready for resolution tests.
    fn setup(extra_decls: &str) -> ScopedSymbolTable {
        let mut symbols = ScopedSymbolTable::new();
        let mut builder = SymbolTableBuilder::new();
        assert!(builder.load_prelude(&mut symbols));

        if !extra_decls.is_empty() {
            let file = SourceFile::from_string(extra_decls);
            let (stmts, errors) = Parser::parse_program(Lexer::tokenize_all(&file));
            assert_eq!(errors, vec![], "declaration parse errors");
            assert!(builder.collect(&stmts, &mut symbols), "{:?}", builder.errors());
        }

        symbols
    }

    fn resolve_with(symbols: &ScopedSymbolTable, source: &str) -> (String, Vec<Diagnostic>) {
        let file = SourceFile::from_string(source);
        let (mut stmts, errors) = Parser::parse_program(Lexer::tokenize_all(&file));
        assert_eq!(errors, vec![], "source parse errors");

        let resolve_errors = OperatorResolver::resolve_program(&mut stmts, symbols);

        let mut dump = String::new();
        for stmt in &stmts {
            stmt.dump(&mut dump, 0);
        }

        (dump, resolve_errors)
    }

    fn resolve(source: &str) -> (String, Vec<Diagnostic>) {
        resolve_with(&setup(""), source)
    }

    #[test]
    fn simple_binary() {
        let (dump, errors) = resolve("let x = 1 + 2;");

        assert_eq!(errors, vec![]);
        assert_eq!(dump, "Let(x = Binary(+, IntLiteral(1), IntLiteral(2)))\n");
    }

    #[test]
    fn precedence_shapes_the_tree() {
        let (dump, errors) = resolve("let x = 1 + 2 * 3;");

        assert_eq!(errors, vec![]);
        assert_eq!(
            dump,
            "Let(x = Binary(+, IntLiteral(1), Binary(*, IntLiteral(2), IntLiteral(3))))\n"
        );
    }

    #[test]
    fn left_associativity_prefers_rightmost_split() {
        let (dump, errors) = resolve("let x = 10 - 5 - 2;");

        assert_eq!(errors, vec![]);
        assert_eq!(
            dump,
            "Let(x = Binary(-, Binary(-, IntLiteral(10), IntLiteral(5)), IntLiteral(2)))\n"
        );
    }

    #[test]
    fn right_associativity_prefers_leftmost_split() {
        let (dump, errors) = resolve("let x = 2.0 ** 3.0 ** 2.0;");

        assert_eq!(errors, vec![]);
        assert_eq!(
            dump,
            "Let(x = Binary(**, FloatLiteral(2.0), Binary(**, FloatLiteral(3.0), FloatLiteral(2.0))))\n"
        );
    }

    #[test]
    fn prefix_operators_fold_right_to_left() {
        let (dump, errors) = resolve("let x = - - 5;");

        assert_eq!(errors, vec![]);
        assert_eq!(
            dump,
            "Let(x = Unary(-, Unary(-, IntLiteral(5), Prefix), Prefix))\n"
        );
    }

    #[test]
    fn postfix_wraps_outside_prefix() {
        let symbols = setup("operator postfix ++ (x: i32): i32;");
        let (dump, errors) = resolve_with(&symbols, "let y = -x ++;");

        assert_eq!(errors, vec![]);
        assert_eq!(
            dump,
            "Let(y = Unary(++, Unary(-, Identifier(x), Prefix), Postfix))\n"
        );
    }

    #[test]
    fn parenthesized_sequences_resolve_recursively() {
        let (dump, errors) = resolve("let x = (1 + 2) * 3;");

        assert_eq!(errors, vec![]);
        assert_eq!(
            dump,
            "Let(x = Binary(*, Binary(+, IntLiteral(1), IntLiteral(2)), IntLiteral(3)))\n"
        );
    }

    #[test]
    fn call_arguments_are_resolved() {
        let (dump, errors) = resolve("f(1 + 2, g(3 * 4));");

        assert_eq!(errors, vec![]);
        assert_eq!(
            dump,
            "Expr(Call(Identifier(f), [Binary(+, IntLiteral(1), IntLiteral(2)), \
             Call(Identifier(g), [Binary(*, IntLiteral(3), IntLiteral(4))])]))\n"
        );
        assert!(!dump.contains("OperatorSeq"));
    }

    #[test]
    fn custom_precedence_between_builtins() {
        // * (80) > +* (75) > + (70), so 1 + 2 +* 3 * 4 = 1 + (2 +* (3 * 4))
        let symbols = setup("operator infix +* (a: i32, b: i32): i32 prec 75;");
        let (dump, errors) = resolve_with(&symbols, "let x = 1 + 2 +* 3 * 4;");

        assert_eq!(errors, vec![]);
        assert_eq!(
            dump,
            "Let(x = Binary(+, IntLiteral(1), Binary(+*, IntLiteral(2), \
             Binary(*, IntLiteral(3), IntLiteral(4)))))\n"
        );
    }

    #[test]
    fn assignment_chains_are_right_associative() {
        let (dump, errors) = resolve("x = y = 3;");

        assert_eq!(errors, vec![]);
        assert_eq!(
            dump,
            "Expr(Binary(=, Identifier(x), Binary(=, Identifier(y), IntLiteral(3))))\n"
        );
    }

    #[test]
    fn mixed_associativity_is_rejected() {
        let symbols = setup(indoc::indoc! {"
            operator infix +< (a: i32, b: i32): i32 prec 70 assoc_left;
            operator infix +> (a: i32, b: i32): i32 prec 70 assoc_right;
        "});
        let (_, errors) = resolve_with(&symbols, "let x = a +< b +> c;");

        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("Mixed associativity"));
        assert!(errors[0].message.contains("'+>'"));
        // The error points at the second operator's token: `+>` starts at
        // column 16 of `let x = a +< b +> c;`
        assert_eq!(errors[0].location.line, 1);
        assert_eq!(errors[0].location.column, 16);
    }

    #[test]
    fn invalid_prefix_is_rejected() {
        let (_, errors) = resolve("let x = * 5;");

        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "Operator '*' cannot be used as prefix operator here"
        );
    }

    #[test]
    fn invalid_infix_is_rejected() {
        // `!` is prefix-only: after the operand it can be neither postfix
        // nor infix
        let (_, errors) = resolve("let x = 5 ! 3;");

        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "Operator '!' cannot be used as infix operator"
        );
    }

    #[test]
    fn postfix_wins_over_infix_reading() {
        // `++` is declared both postfix and infix; the greedy fold commits to
        // postfix and the leftover operand becomes a structure error. This
        // choice is deliberate and stable.
        let symbols = setup(indoc::indoc! {"
            operator postfix ++ (x: i32): i32;
            operator infix ++ (a: i32, b: i32): i32 prec 70;
        "});
        let (_, errors) = resolve_with(&symbols, "let x = a ++ b;");

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Expected infix operator between operands");
    }

    #[test]
    fn resolver_is_idempotent() {
        let file = SourceFile::from_string("let x = 1 + 2 * -3; f(x + 1);");
        let (mut stmts, errors) = Parser::parse_program(Lexer::tokenize_all(&file));
        assert_eq!(errors, vec![]);

        let symbols = setup("");
        assert_eq!(OperatorResolver::resolve_program(&mut stmts, &symbols), vec![]);

        let mut first = String::new();
        for stmt in &stmts {
            stmt.dump(&mut first, 0);
        }

        assert_eq!(OperatorResolver::resolve_program(&mut stmts, &symbols), vec![]);

        let mut second = String::new();
        for stmt in &stmts {
            stmt.dump(&mut second, 0);
        }

        assert_eq!(first, second);
    }

    #[test]
    fn statements_are_resolved_everywhere() {
        let symbols = setup("");
        let (dump, errors) = resolve_with(
            &symbols,
            indoc::indoc! {"
                func f(n: i32): i32 {
                    if n <= 1 {
                        return n;
                    }
                    while n > 0 {
                        n -= 1;
                    }
                    return f(n - 1) + f(n - 2);
                }
            "},
        );

        assert_eq!(errors, vec![]);
        assert!(!dump.contains("OperatorSeq"), "{dump}");
    }
}
