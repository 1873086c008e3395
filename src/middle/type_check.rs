use std::collections::BTreeMap;

use crate::{
    diagnostics::{Diagnostic, Stage},
    frontend::{
        ast::{Expr, ExprKind, Stmt, StmtKind},
        intern::InternedSymbol,
        lexer::SourceLocation,
    },
    middle::{operators::OpPosition, symbols::ScopedSymbolTable},
};

/// Bottom-up type inference and checking over the resolved AST.
///
/// The checker keeps its own scope stack mirroring the traversal rather than
/// reusing the symbol table's scope tree; variable types flow from literals
/// and declared annotations only. Unknown types are deliberately tolerated
/// (an identifier may name a function rather than a variable) and behave as
/// wildcards during overload matching.
#[derive(Debug)]
pub struct TypeChecker<'symbols> {
    symbols: &'symbols ScopedSymbolTable,
    scopes: Vec<BTreeMap<InternedSymbol, InternedSymbol>>,
    errors: Vec<Diagnostic>,
}

impl<'symbols> TypeChecker<'symbols> {
    pub fn check_program(stmts: &mut [Stmt], symbols: &'symbols ScopedSymbolTable) -> Vec<Diagnostic> {
        let mut checker = Self {
            symbols,
            scopes: vec![BTreeMap::new()],
            errors: Vec::new(),
        };

        for stmt in stmts {
            checker.check_stmt(stmt);
        }

        checker.errors
    }

    fn error(&mut self, message: impl Into<String>, loc: SourceLocation) {
        self.errors.push(Diagnostic::new(Stage::Type, message, loc));
    }

    fn push_scope(&mut self) {
        self.scopes.push(BTreeMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn record_variable(&mut self, name: InternedSymbol, ty: InternedSymbol) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name, ty);
        }
    }

    fn lookup_variable(&self, name: InternedSymbol) -> Option<InternedSymbol> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(&name).copied())
    }

    fn check_stmt(&mut self, stmt: &mut Stmt) {
        match &mut stmt.kind {
            StmtKind::Let { name, ty, init } => {
                let name = *name;
                let declared = ty.as_ref().map(|annotation| annotation.name);
                let init_loc = init.loc;
                let init_type = self.check_expr(init);

                if let Some(declared) = declared {
                    if let Some(actual) = init_type {
                        if actual != declared {
                            self.error(
                                format!(
                                    "Type mismatch: variable '{name}' declared as '{declared}' \
                                     but initialized with '{actual}'"
                                ),
                                init_loc,
                            );
                        }
                    }
                    // The declared type wins either way
                    self.record_variable(name, declared);
                } else if let Some(actual) = init_type {
                    self.record_variable(name, actual);
                }
            }
            StmtKind::Func(func) => {
                if let Some(body) = &mut func.body {
                    self.push_scope();
                    for param in &func.params {
                        if let Some(ty) = &param.ty {
                            self.record_variable(param.name, ty.name);
                        }
                    }
                    self.check_stmt(body);
                    self.pop_scope();
                }
            }
            StmtKind::OperatorDecl(op) => {
                if let Some(body) = &mut op.body {
                    self.push_scope();
                    for param in &op.params {
                        if let Some(ty) = &param.ty {
                            self.record_variable(param.name, ty.name);
                        }
                    }
                    self.check_stmt(body);
                    self.pop_scope();
                }
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.check_expr(value);
                }
            }
            StmtKind::Expr(expr) => {
                self.check_expr(expr);
            }
            StmtKind::Block(stmts) => {
                self.push_scope();
                for stmt in stmts {
                    self.check_stmt(stmt);
                }
                self.pop_scope();
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let loc = condition.loc;
                if let Some(cond_type) = self.check_expr(condition) {
                    if cond_type.value() != "bool" {
                        self.error(
                            format!("If condition must be 'bool', got '{cond_type}'"),
                            loc,
                        );
                    }
                }

                self.check_stmt(then_branch);
                if let Some(else_branch) = else_branch {
                    self.check_stmt(else_branch);
                }
            }
            StmtKind::While { condition, body } => {
                let loc = condition.loc;
                if let Some(cond_type) = self.check_expr(condition) {
                    if cond_type.value() != "bool" {
                        self.error(
                            format!("While condition must be 'bool', got '{cond_type}'"),
                            loc,
                        );
                    }
                }

                self.check_stmt(body);
            }
        }
    }

    /// Infers and records the type of an expression. `None` means unknown;
    /// the annotation is written exactly once.
    fn check_expr(&mut self, expr: &mut Expr) -> Option<InternedSymbol> {
        if let Some(ty) = expr.inferred_type {
            return Some(ty);
        }

        let loc = expr.loc;
        let symbols = self.symbols;

        let ty = match &mut expr.kind {
            ExprKind::IntLiteral(_) => Some(InternedSymbol::new("i32")),
            ExprKind::FloatLiteral(_) => Some(InternedSymbol::new("f64")),
            ExprKind::StringLiteral(_) => Some(InternedSymbol::new("string")),
            ExprKind::BoolLiteral(_) => Some(InternedSymbol::new("bool")),
            ExprKind::Identifier(name) => {
                // Unknown names are tolerated; they may refer to functions
                // or operators rather than variables
                self.lookup_variable(*name)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let op = *op;
                let lhs_type = self.check_expr(lhs);
                let rhs_type = self.check_expr(rhs);

                let overloads = symbols.find_operators(op, OpPosition::Infix);
                if overloads.is_empty() {
                    self.error(format!("No infix operator '{op}' found"), loc);
                    None
                } else {
                    let matched = overloads.iter().find(|info| {
                        info.signature.param_types.len() == 2
                            && lhs_type.is_none_or(|t| t == info.signature.param_types[0])
                            && rhs_type.is_none_or(|t| t == info.signature.param_types[1])
                    });

                    match matched {
                        Some(info) => Some(info.signature.return_type),
                        None => {
                            if let (Some(lhs_type), Some(rhs_type)) = (lhs_type, rhs_type) {
                                self.error(
                                    format!(
                                        "No matching overload for infix operator '{op}' with \
                                         operand types '{lhs_type}' and '{rhs_type}'"
                                    ),
                                    loc,
                                );
                            }
                            // Partially unknown operands fall back to the
                            // first overload's return type
                            Some(overloads[0].signature.return_type)
                        }
                    }
                }
            }
            ExprKind::Unary {
                op,
                operand,
                position,
            } => {
                let op = *op;
                let position = *position;
                let operand_type = self.check_expr(operand);

                let overloads = symbols.find_operators(op, position);
                if overloads.is_empty() {
                    self.error(format!("No {position} operator '{op}' found"), loc);
                    None
                } else {
                    let matched = overloads.iter().find(|info| {
                        info.signature.param_types.len() == 1
                            && operand_type.is_none_or(|t| t == info.signature.param_types[0])
                    });

                    match matched {
                        Some(info) => Some(info.signature.return_type),
                        None => {
                            if let Some(operand_type) = operand_type {
                                self.error(
                                    format!(
                                        "No matching overload for {position} operator '{op}' \
                                         with operand type '{operand_type}'"
                                    ),
                                    loc,
                                );
                            }
                            Some(overloads[0].signature.return_type)
                        }
                    }
                }
            }
            ExprKind::Call { callee, args } => {
                let mut arg_types = Vec::with_capacity(args.len());
                for arg in args.iter_mut() {
                    arg_types.push(self.check_expr(arg));
                }

                let ExprKind::Identifier(name) = &callee.kind else {
                    self.error("Function call callee must be an identifier", loc);
                    expr.inferred_type = None;
                    return None;
                };

                let overloads = symbols.find_functions(*name);
                let name = *name;
                if overloads.is_empty() {
                    self.error(format!("Unknown function '{name}'"), loc);
                    None
                } else {
                    let matched = overloads.iter().find(|func| {
                        func.param_types.len() == arg_types.len()
                            && func
                                .param_types
                                .iter()
                                .zip(&arg_types)
                                .all(|(expected, actual)| {
                                    actual.is_none_or(|t| t == *expected)
                                })
                    });

                    match matched {
                        Some(func) => func.return_type,
                        None => overloads[0].return_type,
                    }
                }
            }
            ExprKind::OpSequence(_) => {
                self.error(
                    "OperatorSeq should have been resolved before type checking",
                    loc,
                );
                None
            }
        };

        expr.inferred_type = ty;
        ty
    }
}
