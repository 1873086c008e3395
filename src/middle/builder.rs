use crate::{
    diagnostics::{Diagnostic, Stage},
    frontend::{
        ast::{FuncDecl, OperatorDecl, Stmt, StmtKind},
        intern::InternedSymbol,
        lexer::{Lexer, SourceLocation, TokenKind},
        parser::Parser,
        SourceFile,
    },
    middle::{
        operators::{OperatorInfo, OperatorSignature},
        symbols::{FunctionSignature, ScopeKind, ScopedSymbolTable, SymbolOrigin, VariableBinding},
    },
};

/// The prelude is written in the language itself and compiled into the
/// binary; see `load_prelude`.
const PRELUDE_SOURCE: &str = include_str!("../../stdlib/prelude.bk");

/// Walks the AST and produces the hierarchical symbol table.
///
/// Function and operator declarations are collected at global scope only;
/// let-bindings land in whatever scope is current. The same builder runs
/// twice: once over the prelude (origin = Prelude), then over user code.
#[derive(Debug, Default)]
pub struct SymbolTableBuilder {
    errors: Vec<Diagnostic>,
    collecting_prelude: bool,
    next_block_num: usize,
}

impl SymbolTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> &[Diagnostic] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Parses the built-in prelude and collects its symbols with
    /// origin = Prelude. A prelude that fails to compile is a build defect,
    /// not a user error, so the diagnostics are labeled accordingly.
    pub fn load_prelude(&mut self, symbols: &mut ScopedSymbolTable) -> bool {
        let source = SourceFile::from_string(PRELUDE_SOURCE);
        let tokens = Lexer::tokenize_all(&source);

        let mut lex_failed = false;
        for token in &tokens {
            if token.kind == TokenKind::Error {
                self.error(
                    format!("Lexer error in prelude: {}", token.text),
                    token.location,
                );
                lex_failed = true;
            }
        }
        if lex_failed {
            return false;
        }

        let (stmts, parse_errors) = Parser::parse_program(tokens);
        if !parse_errors.is_empty() {
            for error in parse_errors {
                self.error(
                    format!("Parse error in prelude: {}", error.message),
                    error.location,
                );
            }
            return false;
        }

        self.collecting_prelude = true;
        let ok = self.collect(&stmts, symbols);
        self.collecting_prelude = false;

        ok
    }

    pub fn collect(&mut self, stmts: &[Stmt], symbols: &mut ScopedSymbolTable) -> bool {
        self.next_block_num = 0;

        for stmt in stmts {
            self.process_stmt(stmt, symbols);
        }

        !self.has_errors()
    }

    fn origin(&self) -> SymbolOrigin {
        if self.collecting_prelude {
            SymbolOrigin::Prelude
        } else {
            SymbolOrigin::User
        }
    }

    fn error(&mut self, message: impl Into<String>, loc: SourceLocation) {
        self.errors
            .push(Diagnostic::new(Stage::Semantic, message, loc));
    }

    fn process_stmt(&mut self, stmt: &Stmt, symbols: &mut ScopedSymbolTable) {
        match &stmt.kind {
            StmtKind::Func(func) => self.process_func_decl(func, stmt.loc, symbols),
            StmtKind::OperatorDecl(op) => self.process_operator_decl(op, stmt.loc, symbols),
            StmtKind::Let { name, ty, .. } => {
                self.process_let(*name, ty.as_ref().map(|t| t.name), stmt.loc, symbols)
            }
            StmtKind::Block(stmts) => {
                let block_num = self.next_block_num;
                self.next_block_num += 1;

                symbols.push_scope(
                    ScopeKind::Block,
                    format!("block #{} at line {}", block_num, stmt.loc.line),
                );
                for stmt in stmts {
                    self.process_stmt(stmt, symbols);
                }
                symbols.pop_scope();
            }
            StmtKind::If {
                then_branch,
                else_branch,
                ..
            } => {
                self.process_stmt(then_branch, symbols);
                if let Some(else_branch) = else_branch {
                    self.process_stmt(else_branch, symbols);
                }
            }
            StmtKind::While { body, .. } => self.process_stmt(body, symbols),
            // Return and expression statements declare nothing
            StmtKind::Return(_) | StmtKind::Expr(_) => {}
        }
    }

    fn process_func_decl(
        &mut self,
        func: &FuncDecl,
        loc: SourceLocation,
        symbols: &mut ScopedSymbolTable,
    ) {
        let origin = self.origin();

        if symbols.current_scope().kind != ScopeKind::Global {
            self.error(
                "Nested function definitions are not yet supported (closures unimplemented)",
                loc,
            );
            return;
        }

        let mut param_types = Vec::with_capacity(func.params.len());
        for param in &func.params {
            match &param.ty {
                Some(ty) => param_types.push(ty.name),
                None => {
                    self.error(
                        format!(
                            "Function parameter '{}' requires explicit type (generics unimplemented)",
                            param.name
                        ),
                        param.loc,
                    );
                    return;
                }
            }
        }

        symbols.add_function(FunctionSignature {
            name: func.name,
            param_types,
            return_type: func.return_type.as_ref().map(|ty| ty.name),
            is_declaration_only: func.body.is_none(),
            origin,
        });

        if let Some(body) = &func.body {
            symbols.push_scope(ScopeKind::Function, format!("function {}", func.name));

            for param in &func.params {
                symbols.add_variable(VariableBinding {
                    name: param.name,
                    type_name: param.ty.as_ref().map(|ty| ty.name),
                    loc: param.loc,
                    origin,
                });
            }

            self.process_stmt(body, symbols);
            symbols.pop_scope();
        }
    }

    fn process_operator_decl(
        &mut self,
        op: &OperatorDecl,
        loc: SourceLocation,
        symbols: &mut ScopedSymbolTable,
    ) {
        let origin = self.origin();

        if symbols.current_scope().kind != ScopeKind::Global {
            self.error(
                "Nested operator definitions are not yet supported (closures unimplemented)",
                loc,
            );
            return;
        }

        let mut param_types = Vec::with_capacity(op.params.len());
        for param in &op.params {
            match &param.ty {
                Some(ty) => param_types.push(ty.name),
                None => {
                    self.error(
                        "Operator parameter requires explicit type (generics unimplemented)",
                        param.loc,
                    );
                    return;
                }
            }
        }

        let Some(return_type) = op.return_type.as_ref().map(|ty| ty.name) else {
            self.error("Operator must have explicit return type", loc);
            return;
        };

        symbols.add_operator(OperatorInfo {
            symbol: op.symbol,
            position: op.position,
            precedence: op.precedence,
            assoc: op.assoc,
            signature: OperatorSignature {
                param_types,
                return_type,
            },
            origin,
        });

        if let Some(body) = &op.body {
            symbols.push_scope(ScopeKind::Function, format!("operator {}", op.symbol));

            for param in &op.params {
                symbols.add_variable(VariableBinding {
                    name: param.name,
                    type_name: param.ty.as_ref().map(|ty| ty.name),
                    loc: param.loc,
                    origin,
                });
            }

            self.process_stmt(body, symbols);
            symbols.pop_scope();
        }
    }

    fn process_let(
        &mut self,
        name: InternedSymbol,
        type_name: Option<InternedSymbol>,
        loc: SourceLocation,
        symbols: &mut ScopedSymbolTable,
    ) {
        if symbols.current_scope().has_variable_local(name) {
            self.error(
                format!("Variable '{name}' already defined in current scope"),
                loc,
            );
            return;
        }

        symbols.add_variable(VariableBinding {
            name,
            type_name,
            loc,
            origin: self.origin(),
        });
    }
}
