//! Lowers the resolved, typed AST into the SSA IR module.
//!
//! Every function and operator in the symbol table is declared up front with
//! external linkage (operators under their mangled names), a synthetic entry
//! function collects the non-declaration top-level statements, and bodies
//! are filled in as their definitions are encountered. All variables live in
//! stack slots; reads load and writes store.

use hashbrown::HashMap;

use crate::{
    backend::ir::{
        self, BinaryOp, Block, BlockId, FloatPredicate, FunctionBody, Immediate, Instruction,
        IntPredicate, Operand, Ty, UnaryOp, ValueId,
    },
    diagnostics::{Diagnostic, Stage},
    frontend::{
        ast::{Expr, ExprKind, FuncDecl, OperatorDecl, Parameter, Stmt, StmtKind, TypeAnnotation},
        intern::InternedSymbol,
        lexer::SourceLocation,
    },
    index::{Index, IndexVec},
    middle::{operators::OpPosition, symbols::ScopedSymbolTable},
};

/// Symbol of the synthetic program entry; the backend wraps it in a
/// conventional `main` for linkage.
pub const ENTRY_SYMBOL: &str = "__brook_entry";

/// Deterministic external name for an operator overload:
/// `SYMBOL$PARAM1$PARAM2...`. Overloads disambiguate by this suffix alone.
pub fn mangled_name(symbol: InternedSymbol, param_types: &[InternedSymbol]) -> InternedSymbol {
    let mut name = symbol.value().to_owned();
    for ty in param_types {
        name.push('$');
        name.push_str(ty.value());
    }

    InternedSymbol::new(&name)
}

/// A variable's stack slot and the type stored in it.
#[derive(Debug, Clone, Copy)]
struct Slot {
    pointer: ValueId,
    ty: Ty,
}

/// Construction state for the function currently being emitted.
#[derive(Debug)]
struct FunctionCtx {
    values: IndexVec<ValueId, Ty>,
    blocks: IndexVec<BlockId, Block>,
    param_values: Vec<ValueId>,
    current: BlockId,
    return_type: Ty,
}

impl FunctionCtx {
    fn new(return_type: Ty) -> Self {
        let mut blocks = IndexVec::new();
        let entry = blocks.push(Block {
            id: BlockId::new(0),
            instructions: Vec::new(),
        });

        Self {
            values: IndexVec::new(),
            blocks,
            param_values: Vec::new(),
            current: entry,
            return_type,
        }
    }

    fn new_value(&mut self, ty: Ty) -> ValueId {
        self.values.push(ty)
    }

    fn new_block(&mut self) -> BlockId {
        let id = self.blocks.next_index();
        self.blocks.push(Block {
            id,
            instructions: Vec::new(),
        })
    }

    fn set_current(&mut self, block: BlockId) {
        self.current = block;
    }

    fn is_terminated(&self) -> bool {
        self.blocks[self.current].is_terminated()
    }

    /// Appends to the current block; anything after a terminator is
    /// unreachable and silently dropped.
    fn push(&mut self, instruction: Instruction) {
        if self.is_terminated() {
            return;
        }

        self.blocks[self.current].instructions.push(instruction);
    }

    fn into_body(self) -> FunctionBody {
        FunctionBody {
            values: self.values,
            blocks: self.blocks,
            param_values: self.param_values,
        }
    }
}

pub struct CodeGen<'symbols> {
    symbols: &'symbols ScopedSymbolTable,
    module: ir::Module,
    /// Maps every declared symbol (source names, mangled operator names) to
    /// its index in the module's function list
    function_indices: HashMap<InternedSymbol, usize>,
    entry_index: usize,
    ctx: FunctionCtx,
    scopes: Vec<HashMap<InternedSymbol, Slot>>,
    errors: Vec<Diagnostic>,
}

impl<'symbols> CodeGen<'symbols> {
    pub fn generate(
        stmts: &[Stmt],
        symbols: &'symbols ScopedSymbolTable,
        module_name: &str,
    ) -> Result<ir::Module, Vec<Diagnostic>> {
        let mut generator = Self {
            symbols,
            module: ir::Module {
                name: module_name.to_owned(),
                strings: IndexVec::new(),
                functions: Vec::new(),
            },
            function_indices: HashMap::new(),
            entry_index: 0,
            ctx: FunctionCtx::new(Ty::I32),
            scopes: vec![HashMap::new()],
            errors: Vec::new(),
        };

        if !generator.declare_symbols() {
            return Err(generator.errors);
        }

        for stmt in stmts {
            match &stmt.kind {
                StmtKind::Func(func) => {
                    if func.body.is_some() {
                        generator.gen_function(func, stmt.loc);
                    }
                }
                StmtKind::OperatorDecl(op) => {
                    if op.body.is_some() {
                        generator.gen_operator(op, stmt.loc);
                    }
                }
                // Top-level statements run in the entry function
                _ => {
                    if !generator.ctx.is_terminated() {
                        generator.gen_stmt(stmt);
                    }
                }
            }
        }

        // The entry function returns zero if it falls off the end
        if !generator.ctx.is_terminated() {
            generator.ctx.push(Instruction::Return {
                value: Some(Operand::Immediate(Immediate::Int(0))),
            });
        }

        let entry_index = generator.entry_index;
        let entry_ctx = std::mem::replace(&mut generator.ctx, FunctionCtx::new(Ty::I32));
        generator.module.functions[entry_index].body = Some(entry_ctx.into_body());

        for message in ir::verify::verify_module(&generator.module) {
            generator.errors.push(Diagnostic::internal(format!(
                "IR module verification failed: {message}"
            )));
        }

        if generator.errors.is_empty() {
            Ok(generator.module)
        } else {
            Err(generator.errors)
        }
    }

    fn error(&mut self, message: impl Into<String>, loc: SourceLocation) {
        self.errors
            .push(Diagnostic::new(Stage::Codegen, message, loc));
    }

    fn map_type(name: InternedSymbol) -> Option<Ty> {
        match name.value() {
            "i32" => Some(Ty::I32),
            "f64" => Some(Ty::F64),
            "bool" => Some(Ty::I1),
            "string" => Some(Ty::Ptr),
            "void" => Some(Ty::Void),
            _ => None,
        }
    }

    /// The source-level type a generated value has, used to pick operator
    /// overloads during lowering.
    fn type_name_of(ty: Ty) -> Option<&'static str> {
        match ty {
            Ty::I32 => Some("i32"),
            Ty::F64 => Some("f64"),
            Ty::I1 => Some("bool"),
            Ty::Ptr => Some("string"),
            Ty::Void => None,
        }
    }

    /// Declares every function and operator from the symbol table plus the
    /// synthetic entry. Returns false (with diagnostics) on unknown types.
    fn declare_symbols(&mut self) -> bool {
        let symbols = self.symbols;

        for name in symbols.function_names() {
            for signature in symbols.find_functions(name) {
                if self.function_indices.contains_key(&name) {
                    // Overloads share one external symbol; the first
                    // signature declares it
                    continue;
                }

                let mut params = Vec::with_capacity(signature.param_types.len());
                for param_type in &signature.param_types {
                    let Some(ty) = Self::map_type(*param_type) else {
                        self.error(
                            format!("Unknown type: {param_type}"),
                            SourceLocation::UNKNOWN,
                        );
                        return false;
                    };
                    params.push(ty);
                }

                let return_type = match signature.return_type {
                    Some(name) => match Self::map_type(name) {
                        Some(ty) => ty,
                        None => {
                            self.error(
                                format!("Unknown return type: {name}"),
                                SourceLocation::UNKNOWN,
                            );
                            return false;
                        }
                    },
                    None => Ty::Void,
                };

                let index = self.module.functions.len();
                self.module.functions.push(ir::Function {
                    name,
                    params,
                    return_type,
                    body: None,
                });
                self.function_indices.insert(name, index);
            }
        }

        for info in symbols.all_operators() {
            let mangled = mangled_name(info.symbol, &info.signature.param_types);
            if self.function_indices.contains_key(&mangled) {
                continue;
            }

            let mut params = Vec::with_capacity(info.signature.param_types.len());
            for param_type in &info.signature.param_types {
                let Some(ty) = Self::map_type(*param_type) else {
                    self.error(
                        format!("Unknown type: {param_type}"),
                        SourceLocation::UNKNOWN,
                    );
                    return false;
                };
                params.push(ty);
            }

            let return_type = match Self::map_type(info.signature.return_type) {
                Some(ty) => ty,
                None => {
                    self.error(
                        format!("Unknown return type: {}", info.signature.return_type),
                        SourceLocation::UNKNOWN,
                    );
                    return false;
                }
            };

            let index = self.module.functions.len();
            self.module.functions.push(ir::Function {
                name: mangled,
                params,
                return_type,
                body: None,
            });
            self.function_indices.insert(mangled, index);
        }

        self.entry_index = self.module.functions.len();
        self.module.functions.push(ir::Function {
            name: InternedSymbol::new(ENTRY_SYMBOL),
            params: Vec::new(),
            return_type: Ty::I32,
            body: None,
        });

        true
    }

    fn lookup_variable(&self, name: InternedSymbol) -> Option<Slot> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(&name).copied())
    }

    /* ===== Definitions ===== */

    fn gen_function(&mut self, func: &FuncDecl, loc: SourceLocation) {
        let Some(&index) = self.function_indices.get(&func.name) else {
            self.error(format!("Function not found: {}", func.name), loc);
            return;
        };

        let body = func.body.as_deref().expect("caller checked for a body");
        self.gen_body(index, &func.params, body);
    }

    fn gen_operator(&mut self, op: &OperatorDecl, loc: SourceLocation) {
        let param_types: Vec<_> = op
            .params
            .iter()
            .filter_map(|param| param.ty.as_ref().map(|ty| ty.name))
            .collect();
        let mangled = mangled_name(op.symbol, &param_types);

        let Some(&index) = self.function_indices.get(&mangled) else {
            self.error(format!("Operator function not found: {}", op.symbol), loc);
            return;
        };

        let body = op.body.as_deref().expect("caller checked for a body");
        self.gen_body(index, &op.params, body);
    }

    /// Emits one function body: an entry block that spills every parameter
    /// into a stack slot, then the lowered statements, then a default return
    /// if control falls off the end.
    fn gen_body(&mut self, index: usize, params: &[Parameter], body: &Stmt) {
        let function = &self.module.functions[index];
        let param_types = function.params.clone();
        let return_type = function.return_type;

        // Function bodies do not see the entry function's locals; they get a
        // fresh scope stack of their own.
        let saved_ctx = std::mem::replace(&mut self.ctx, FunctionCtx::new(return_type));
        let saved_scopes = std::mem::replace(&mut self.scopes, vec![HashMap::new()]);

        for ty in &param_types {
            let value = self.ctx.new_value(*ty);
            self.ctx.param_values.push(value);
        }

        for (i, (param, ty)) in params.iter().zip(&param_types).enumerate() {
            let incoming = self.ctx.param_values[i];
            let slot = self.ctx.new_value(Ty::Ptr);
            self.ctx.push(Instruction::Alloc { dest: slot, ty: *ty });
            self.ctx.push(Instruction::Store {
                ty: *ty,
                slot,
                value: Operand::Value(incoming),
            });

            self.scopes
                .last_mut()
                .expect("scope stack is never empty")
                .insert(
                    param.name,
                    Slot {
                        pointer: slot,
                        ty: *ty,
                    },
                );
        }

        self.gen_stmt(body);

        if !self.ctx.is_terminated() {
            let value = match self.ctx.return_type {
                Ty::Void => None,
                Ty::I32 => Some(Operand::Immediate(Immediate::Int(0))),
                Ty::F64 => Some(Operand::Immediate(Immediate::Float(0.0))),
                Ty::I1 => Some(Operand::Immediate(Immediate::Bool(false))),
                Ty::Ptr => Some(Operand::Immediate(Immediate::Null)),
            };
            self.ctx.push(Instruction::Return { value });
        }

        let ctx = std::mem::replace(&mut self.ctx, saved_ctx);
        self.scopes = saved_scopes;
        self.module.functions[index].body = Some(ctx.into_body());
    }

    /* ===== Statements ===== */

    fn gen_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let { name, ty, init } => self.gen_let(*name, ty.as_ref(), init, stmt.loc),
            StmtKind::Return(value) => self.gen_return(value.as_ref()),
            StmtKind::Expr(expr) => {
                self.gen_expr(expr);
            }
            StmtKind::Block(stmts) => {
                self.scopes.push(HashMap::new());
                for stmt in stmts {
                    if self.ctx.is_terminated() {
                        break;
                    }
                    self.gen_stmt(stmt);
                }
                self.scopes.pop();
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => self.gen_if(condition, then_branch, else_branch.as_deref()),
            StmtKind::While { condition, body } => self.gen_while(condition, body),
            // Definitions are handled at the top level; nested declarations
            // were already rejected by the symbol-table builder
            StmtKind::Func(_) | StmtKind::OperatorDecl(_) => {}
        }
    }

    fn gen_let(
        &mut self,
        name: InternedSymbol,
        annotation: Option<&TypeAnnotation>,
        init: &Expr,
        loc: SourceLocation,
    ) {
        let Some((value, value_ty)) = self.gen_expr(init) else {
            return;
        };

        let var_ty = match annotation {
            Some(annotation) => match Self::map_type(annotation.name) {
                Some(ty) => ty,
                None => {
                    self.error(format!("Unknown type: {}", annotation.name), annotation.loc);
                    return;
                }
            },
            None => value_ty,
        };

        if var_ty == Ty::Void {
            self.error(format!("Cannot determine type for variable: {name}"), loc);
            return;
        }

        let slot = self.ctx.new_value(Ty::Ptr);
        self.ctx.push(Instruction::Alloc {
            dest: slot,
            ty: var_ty,
        });
        self.ctx.push(Instruction::Store {
            ty: var_ty,
            slot,
            value,
        });

        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(
                name,
                Slot {
                    pointer: slot,
                    ty: var_ty,
                },
            );
    }

    fn gen_return(&mut self, value: Option<&Expr>) {
        match value {
            Some(expr) => {
                if let Some((operand, _)) = self.gen_expr(expr) {
                    self.ctx.push(Instruction::Return {
                        value: Some(operand),
                    });
                }
            }
            None => self.ctx.push(Instruction::Return { value: None }),
        }
    }

    fn gen_if(&mut self, condition: &Expr, then_branch: &Stmt, else_branch: Option<&Stmt>) {
        let Some((cond, _)) = self.gen_expr(condition) else {
            return;
        };

        let then_block = self.ctx.new_block();
        let else_block = else_branch.map(|_| self.ctx.new_block());
        let merge_block = self.ctx.new_block();

        self.ctx.push(Instruction::Branch {
            condition: cond,
            positive: then_block,
            negative: else_block.unwrap_or(merge_block),
        });

        self.ctx.set_current(then_block);
        self.gen_stmt(then_branch);
        if !self.ctx.is_terminated() {
            self.ctx.push(Instruction::Jump {
                destination: merge_block,
            });
        }

        if let (Some(else_block), Some(else_branch)) = (else_block, else_branch) {
            self.ctx.set_current(else_block);
            self.gen_stmt(else_branch);
            if !self.ctx.is_terminated() {
                self.ctx.push(Instruction::Jump {
                    destination: merge_block,
                });
            }
        }

        self.ctx.set_current(merge_block);
    }

    fn gen_while(&mut self, condition: &Expr, body: &Stmt) {
        let cond_block = self.ctx.new_block();
        let body_block = self.ctx.new_block();
        let end_block = self.ctx.new_block();

        self.ctx.push(Instruction::Jump {
            destination: cond_block,
        });

        self.ctx.set_current(cond_block);
        let Some((cond, _)) = self.gen_expr(condition) else {
            return;
        };
        self.ctx.push(Instruction::Branch {
            condition: cond,
            positive: body_block,
            negative: end_block,
        });

        self.ctx.set_current(body_block);
        self.gen_stmt(body);
        if !self.ctx.is_terminated() {
            self.ctx.push(Instruction::Jump {
                destination: cond_block,
            });
        }

        self.ctx.set_current(end_block);
    }

    /* ===== Expressions ===== */

    fn gen_expr(&mut self, expr: &Expr) -> Option<(Operand, Ty)> {
        match &expr.kind {
            ExprKind::IntLiteral(text) => match text.value().parse::<i64>() {
                // Integer literals are 32-bit; out-of-range digits wrap the
                // way a 32-bit constant would
                Ok(v) => Some((Operand::Immediate(Immediate::Int(v as i32 as i64)), Ty::I32)),
                Err(_) => {
                    self.error(format!("Invalid integer literal: {text}"), expr.loc);
                    None
                }
            },
            ExprKind::FloatLiteral(text) => match text.value().parse::<f64>() {
                Ok(v) => Some((Operand::Immediate(Immediate::Float(v)), Ty::F64)),
                Err(_) => {
                    self.error(format!("Invalid float literal: {text}"), expr.loc);
                    None
                }
            },
            ExprKind::StringLiteral(text) => {
                let id = self.module.strings.push(text.value().to_owned());
                Some((Operand::Immediate(Immediate::Str(id)), Ty::Ptr))
            }
            ExprKind::BoolLiteral(value) => {
                Some((Operand::Immediate(Immediate::Bool(*value)), Ty::I1))
            }
            ExprKind::Identifier(name) => {
                let Some(slot) = self.lookup_variable(*name) else {
                    self.error(format!("Undefined variable: {name}"), expr.loc);
                    return None;
                };

                let dest = self.ctx.new_value(slot.ty);
                self.ctx.push(Instruction::Load {
                    dest,
                    ty: slot.ty,
                    slot: slot.pointer,
                });

                Some((Operand::Value(dest), slot.ty))
            }
            ExprKind::Binary { op, lhs, rhs } => self.gen_binary(*op, lhs, rhs, expr.loc),
            ExprKind::Unary {
                op,
                operand,
                position,
            } => self.gen_unary(*op, operand, *position, expr.loc),
            ExprKind::Call { callee, args } => self.gen_call(callee, args, expr.loc),
            ExprKind::OpSequence(_) => {
                self.error(
                    "OperatorSeq should have been resolved before code generation",
                    expr.loc,
                );
                None
            }
        }
    }

    fn gen_binary(
        &mut self,
        op: InternedSymbol,
        lhs: &Expr,
        rhs: &Expr,
        loc: SourceLocation,
    ) -> Option<(Operand, Ty)> {
        if matches!(op.value(), "=" | "+=" | "-=" | "*=" | "/=" | "%=") {
            return self.gen_assignment(op, lhs, rhs, loc);
        }

        let (lhs_op, lhs_ty) = self.gen_expr(lhs)?;
        let (rhs_op, rhs_ty) = self.gen_expr(rhs)?;

        if let Some(result) = self.gen_builtin_binary(op.value(), lhs_op, lhs_ty, rhs_op, rhs_ty) {
            return Some(result);
        }

        // Not built-in: look for a declared overload and call its mangled
        // symbol
        if let (Some(lhs_name), Some(rhs_name)) =
            (Self::type_name_of(lhs_ty), Self::type_name_of(rhs_ty))
        {
            let matched = self
                .symbols
                .find_operators(op, OpPosition::Infix)
                .iter()
                .find(|info| {
                    info.signature.param_types.len() == 2
                        && info.signature.param_types[0].value() == lhs_name
                        && info.signature.param_types[1].value() == rhs_name
                })
                .map(|info| {
                    (
                        mangled_name(op, &info.signature.param_types),
                        info.signature.return_type,
                    )
                });

            if let Some((mangled, return_type_name)) = matched {
                let return_type = Self::map_type(return_type_name).unwrap_or(Ty::Void);
                return Some(self.emit_call(mangled, vec![lhs_op, rhs_op], return_type));
            }
        }

        self.error(format!("Unknown binary operator: {op}"), loc);
        None
    }

    /// Native lowering for operators on built-in operand-type combinations.
    /// Returns `None` when the combination is not built-in.
    fn gen_builtin_binary(
        &mut self,
        op: &str,
        lhs: Operand,
        lhs_ty: Ty,
        rhs: Operand,
        rhs_ty: Ty,
    ) -> Option<(Operand, Ty)> {
        use Ty::{F64, I1, I32};

        let tys = (lhs_ty, rhs_ty);

        let result = match op {
            "+" => match tys {
                (I32, I32) => self.emit_binary(BinaryOp::Add, I32, lhs, rhs),
                (F64, F64) => self.emit_binary(BinaryOp::FAdd, F64, lhs, rhs),
                _ => return None,
            },
            "-" => match tys {
                (I32, I32) => self.emit_binary(BinaryOp::Sub, I32, lhs, rhs),
                (F64, F64) => self.emit_binary(BinaryOp::FSub, F64, lhs, rhs),
                _ => return None,
            },
            "*" => match tys {
                (I32, I32) => self.emit_binary(BinaryOp::Mul, I32, lhs, rhs),
                (F64, F64) => self.emit_binary(BinaryOp::FMul, F64, lhs, rhs),
                _ => return None,
            },
            "/" => match tys {
                (I32, I32) => self.emit_binary(BinaryOp::SDiv, I32, lhs, rhs),
                (F64, F64) => self.emit_binary(BinaryOp::FDiv, F64, lhs, rhs),
                _ => return None,
            },
            "%" => match tys {
                (I32, I32) => self.emit_binary(BinaryOp::SRem, I32, lhs, rhs),
                _ => return None,
            },
            // Integer power is not built-in; float power is the generic
            // power intrinsic
            "**" => match tys {
                (F64, F64) => self.emit_binary(BinaryOp::FPow, F64, lhs, rhs),
                _ => return None,
            },
            "&" => match tys {
                (I32, I32) => self.emit_binary(BinaryOp::And, I32, lhs, rhs),
                _ => return None,
            },
            "|" => match tys {
                (I32, I32) => self.emit_binary(BinaryOp::Or, I32, lhs, rhs),
                _ => return None,
            },
            "^" => match tys {
                (I32, I32) => self.emit_binary(BinaryOp::Xor, I32, lhs, rhs),
                _ => return None,
            },
            "<<" => match tys {
                (I32, I32) => self.emit_binary(BinaryOp::Shl, I32, lhs, rhs),
                _ => return None,
            },
            ">>" => match tys {
                (I32, I32) => self.emit_binary(BinaryOp::AShr, I32, lhs, rhs),
                _ => return None,
            },
            "==" => match tys {
                (I32, I32) | (I1, I1) => self.emit_icmp(IntPredicate::Eq, lhs, rhs),
                (F64, F64) => self.emit_fcmp(FloatPredicate::Oeq, lhs, rhs),
                _ => return None,
            },
            "!=" => match tys {
                (I32, I32) | (I1, I1) => self.emit_icmp(IntPredicate::Ne, lhs, rhs),
                (F64, F64) => self.emit_fcmp(FloatPredicate::One, lhs, rhs),
                _ => return None,
            },
            "<" => match tys {
                (I32, I32) => self.emit_icmp(IntPredicate::Slt, lhs, rhs),
                (F64, F64) => self.emit_fcmp(FloatPredicate::Olt, lhs, rhs),
                _ => return None,
            },
            "<=" => match tys {
                (I32, I32) => self.emit_icmp(IntPredicate::Sle, lhs, rhs),
                (F64, F64) => self.emit_fcmp(FloatPredicate::Ole, lhs, rhs),
                _ => return None,
            },
            ">" => match tys {
                (I32, I32) => self.emit_icmp(IntPredicate::Sgt, lhs, rhs),
                (F64, F64) => self.emit_fcmp(FloatPredicate::Ogt, lhs, rhs),
                _ => return None,
            },
            ">=" => match tys {
                (I32, I32) => self.emit_icmp(IntPredicate::Sge, lhs, rhs),
                (F64, F64) => self.emit_fcmp(FloatPredicate::Oge, lhs, rhs),
                _ => return None,
            },
            // Logical operators evaluate both operands and combine the
            // 1-bit results
            "&&" => match tys {
                (I1, I1) => self.emit_binary(BinaryOp::And, I1, lhs, rhs),
                _ => return None,
            },
            "||" => match tys {
                (I1, I1) => self.emit_binary(BinaryOp::Or, I1, lhs, rhs),
                _ => return None,
            },
            _ => return None,
        };

        Some(result)
    }

    /// Assignment and compound assignment. The left operand must be an
    /// identifier; the expression yields the stored value.
    fn gen_assignment(
        &mut self,
        op: InternedSymbol,
        lhs: &Expr,
        rhs: &Expr,
        loc: SourceLocation,
    ) -> Option<(Operand, Ty)> {
        let ExprKind::Identifier(name) = &lhs.kind else {
            self.error("Left side of assignment must be a variable", loc);
            return None;
        };

        let Some(slot) = self.lookup_variable(*name) else {
            self.error(format!("Undefined variable: {name}"), loc);
            return None;
        };

        let (mut value, _) = self.gen_expr(rhs)?;

        if op.value() != "=" {
            let current = self.ctx.new_value(slot.ty);
            self.ctx.push(Instruction::Load {
                dest: current,
                ty: slot.ty,
                slot: slot.pointer,
            });

            let binop = match (op.value(), slot.ty) {
                ("+=", Ty::I32) => BinaryOp::Add,
                ("-=", Ty::I32) => BinaryOp::Sub,
                ("*=", Ty::I32) => BinaryOp::Mul,
                ("/=", Ty::I32) => BinaryOp::SDiv,
                ("%=", Ty::I32) => BinaryOp::SRem,
                ("+=", Ty::F64) => BinaryOp::FAdd,
                ("-=", Ty::F64) => BinaryOp::FSub,
                ("*=", Ty::F64) => BinaryOp::FMul,
                ("/=", Ty::F64) => BinaryOp::FDiv,
                _ => {
                    self.error(format!("Unknown binary operator: {op}"), loc);
                    return None;
                }
            };

            let dest = self.ctx.new_value(slot.ty);
            self.ctx.push(Instruction::Binary {
                op: binop,
                dest,
                lhs: Operand::Value(current),
                rhs: value,
            });
            value = Operand::Value(dest);
        }

        self.ctx.push(Instruction::Store {
            ty: slot.ty,
            slot: slot.pointer,
            value,
        });

        Some((value, slot.ty))
    }

    fn gen_unary(
        &mut self,
        op: InternedSymbol,
        operand: &Expr,
        position: OpPosition,
        loc: SourceLocation,
    ) -> Option<(Operand, Ty)> {
        let (operand_op, operand_ty) = self.gen_expr(operand)?;

        if position == OpPosition::Prefix {
            match (op.value(), operand_ty) {
                ("-", Ty::I32) => return Some(self.emit_unary(UnaryOp::Neg, Ty::I32, operand_op)),
                ("-", Ty::F64) => return Some(self.emit_unary(UnaryOp::FNeg, Ty::F64, operand_op)),
                ("!", Ty::I1) => return Some(self.emit_unary(UnaryOp::Not, Ty::I1, operand_op)),
                _ => {}
            }
        }

        if let Some(type_name) = Self::type_name_of(operand_ty) {
            let matched = self
                .symbols
                .find_operators(op, position)
                .iter()
                .find(|info| {
                    info.signature.param_types.len() == 1
                        && info.signature.param_types[0].value() == type_name
                })
                .map(|info| {
                    (
                        mangled_name(op, &info.signature.param_types),
                        info.signature.return_type,
                    )
                });

            if let Some((mangled, return_type_name)) = matched {
                let return_type = Self::map_type(return_type_name).unwrap_or(Ty::Void);
                return Some(self.emit_call(mangled, vec![operand_op], return_type));
            }
        }

        self.error(format!("Unknown unary operator: {op}"), loc);
        None
    }

    fn gen_call(&mut self, callee: &Expr, args: &[Expr], loc: SourceLocation) -> Option<(Operand, Ty)> {
        let ExprKind::Identifier(name) = &callee.kind else {
            self.error("Function call callee must be an identifier", loc);
            return None;
        };
        let name = *name;

        let Some(&index) = self.function_indices.get(&name) else {
            self.error(format!("Unknown function: {name}"), loc);
            return None;
        };

        let declared = &self.module.functions[index];
        let param_count = declared.params.len();
        let return_type = declared.return_type;

        if param_count != args.len() {
            self.error(
                format!("Incorrect number of arguments for function {name}"),
                loc,
            );
            return None;
        }

        let mut arg_ops = Vec::with_capacity(args.len());
        for arg in args {
            let (operand, _) = self.gen_expr(arg)?;
            arg_ops.push(operand);
        }

        Some(self.emit_call(name, arg_ops, return_type))
    }

    /* ===== Instruction helpers ===== */

    fn emit_binary(&mut self, op: BinaryOp, ty: Ty, lhs: Operand, rhs: Operand) -> (Operand, Ty) {
        let dest = self.ctx.new_value(ty);
        self.ctx.push(Instruction::Binary { op, dest, lhs, rhs });
        (Operand::Value(dest), ty)
    }

    fn emit_unary(&mut self, op: UnaryOp, ty: Ty, operand: Operand) -> (Operand, Ty) {
        let dest = self.ctx.new_value(ty);
        self.ctx.push(Instruction::Unary { op, dest, operand });
        (Operand::Value(dest), ty)
    }

    fn emit_icmp(&mut self, pred: IntPredicate, lhs: Operand, rhs: Operand) -> (Operand, Ty) {
        let dest = self.ctx.new_value(Ty::I1);
        self.ctx.push(Instruction::ICmp {
            pred,
            dest,
            lhs,
            rhs,
        });
        (Operand::Value(dest), Ty::I1)
    }

    fn emit_fcmp(&mut self, pred: FloatPredicate, lhs: Operand, rhs: Operand) -> (Operand, Ty) {
        let dest = self.ctx.new_value(Ty::I1);
        self.ctx.push(Instruction::FCmp {
            pred,
            dest,
            lhs,
            rhs,
        });
        (Operand::Value(dest), Ty::I1)
    }

    /// Void-returning calls bind no result; their operand is a dummy that
    /// nothing downstream reads.
    fn emit_call(
        &mut self,
        callee: InternedSymbol,
        args: Vec<Operand>,
        return_type: Ty,
    ) -> (Operand, Ty) {
        let dest = if return_type == Ty::Void {
            None
        } else {
            Some(self.ctx.new_value(return_type))
        };

        self.ctx.push(Instruction::Call { dest, callee, args });

        match dest {
            Some(dest) => (Operand::Value(dest), return_type),
            None => (Operand::Immediate(Immediate::Int(0)), Ty::Void),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        backend::ir::print::print_module,
        frontend::{lexer::Lexer, parser::Parser, SourceFile},
        middle::{
            builder::SymbolTableBuilder, resolver::OperatorResolver, type_check::TypeChecker,
        },
    };

    fn compile_to_ir(source: &str) -> Result<String, Vec<Diagnostic>> {
        let file = SourceFile::from_string(source);
        let (mut stmts, errors) = Parser::parse_program(Lexer::tokenize_all(&file));
        assert_eq!(errors, vec![], "parse errors");

        let mut symbols = ScopedSymbolTable::new();
        let mut builder = SymbolTableBuilder::new();
        assert!(builder.load_prelude(&mut symbols));
        assert!(builder.collect(&stmts, &mut symbols), "{:?}", builder.errors());

        let resolve_errors = OperatorResolver::resolve_program(&mut stmts, &symbols);
        assert_eq!(resolve_errors, vec![], "resolve errors");

        let type_errors = TypeChecker::check_program(&mut stmts, &symbols);
        assert_eq!(type_errors, vec![], "type errors");

        CodeGen::generate(&stmts, &symbols, "test_module").map(|module| print_module(&module))
    }

    fn errors_of(source: &str) -> Vec<Diagnostic> {
        compile_to_ir(source).expect_err("expected code generation to fail")
    }

    #[test]
    fn literals_store_into_slots() {
        let ir = compile_to_ir("let x = 42;").unwrap();

        assert!(ir.contains("define i32 @__brook_entry()"), "{ir}");
        assert!(ir.contains("alloc i32"), "{ir}");
        assert!(ir.contains("store i32 42"), "{ir}");
        assert!(ir.contains("ret i32 0"), "{ir}");
    }

    #[test]
    fn float_and_bool_literals() {
        let ir = compile_to_ir("let a = 3.14; let b = true;").unwrap();

        assert!(ir.contains("alloc f64"), "{ir}");
        assert!(ir.contains("store f64 3.14"), "{ir}");
        assert!(ir.contains("alloc i1"), "{ir}");
        assert!(ir.contains("store i1 true"), "{ir}");
    }

    #[test]
    fn string_literals_become_module_constants() {
        let ir = compile_to_ir(r#"let msg = "Hello, World!";"#).unwrap();

        assert!(ir.contains("@str.0 = constant \"Hello, World!\""), "{ir}");
        assert!(ir.contains("store ptr @str.0"), "{ir}");
    }

    #[test]
    fn builtin_integer_binary_is_one_native_instruction() {
        let ir = compile_to_ir("let x = 3 + 4;").unwrap();

        let entry = ir.split("@__brook_entry").nth(1).unwrap();
        assert_eq!(entry.matches("add i32").count(), 1, "{ir}");
        assert!(!entry.contains("call"), "{ir}");
    }

    #[test]
    fn arithmetic_picks_types_from_operands() {
        let ir = compile_to_ir(indoc::indoc! {"
            let a = 10 / 3;
            let b = 10 % 3;
            let c = 1.5 * 2.0;
        "})
        .unwrap();

        assert!(ir.contains("sdiv i32"), "{ir}");
        assert!(ir.contains("srem i32"), "{ir}");
        assert!(ir.contains("fmul f64"), "{ir}");
    }

    #[test]
    fn comparisons_use_signed_and_ordered_predicates() {
        let ir = compile_to_ir(indoc::indoc! {"
            let a = 1 <= 2;
            let b = 1.5 < 2.5;
            let c = true == false;
        "})
        .unwrap();

        assert!(ir.contains("icmp sle i32"), "{ir}");
        assert!(ir.contains("fcmp olt f64"), "{ir}");
        assert!(ir.contains("icmp eq i1"), "{ir}");
    }

    #[test]
    fn bitwise_and_shift_operators() {
        let ir = compile_to_ir(indoc::indoc! {"
            let a = 12 & 10;
            let b = 12 | 10;
            let c = 12 ^ 10;
            let d = 1 << 4;
            let e = 16 >> 2;
        "})
        .unwrap();

        for mnemonic in ["and i32", "or i32", "xor i32", "shl i32", "ashr i32"] {
            assert!(ir.contains(mnemonic), "missing {mnemonic} in {ir}");
        }
    }

    #[test]
    fn float_power_uses_the_intrinsic() {
        let ir = compile_to_ir("let x = 2.0 ** 10.0;").unwrap();

        assert!(ir.contains("fpow f64"), "{ir}");
    }

    #[test]
    fn logical_operators_stay_on_one_bit() {
        let ir = compile_to_ir("let x = true && false || true;").unwrap();

        assert!(ir.contains("and i1"), "{ir}");
        assert!(ir.contains("or i1"), "{ir}");
    }

    #[test]
    fn prefix_negation_and_not() {
        let ir = compile_to_ir(indoc::indoc! {"
            let a = -5;
            let b = -2.5;
            let c = !true;
        "})
        .unwrap();

        assert!(ir.contains("neg i32"), "{ir}");
        assert!(ir.contains("fneg f64"), "{ir}");
        assert!(ir.contains("not i1"), "{ir}");
    }

    #[test]
    fn identifiers_load_from_their_slots() {
        let ir = compile_to_ir("let x = 1; let y = x + 2;").unwrap();

        assert!(ir.contains("load i32"), "{ir}");
    }

    #[test]
    fn assignment_requires_identifier_target() {
        let errors = errors_of(indoc::indoc! {"
            let x = 1;
            (x + 1) = 5;
        "});

        assert!(errors
            .iter()
            .any(|e| e.message == "Left side of assignment must be a variable"));
    }

    #[test]
    fn compound_assignment_reads_modifies_writes() {
        let ir = compile_to_ir(indoc::indoc! {"
            let x = 1;
            x += 2;
        "})
        .unwrap();

        // load x, add, store back
        let entry = ir.split("@__brook_entry").nth(1).unwrap();
        assert!(entry.contains("add i32"), "{ir}");
        assert!(entry.matches("store i32").count() >= 2, "{ir}");
    }

    #[test]
    fn assignment_yields_the_stored_value() {
        let ir = compile_to_ir(indoc::indoc! {"
            let x = 1;
            let y = (x = 5);
        "})
        .unwrap();

        // y's initializer is the same operand that was stored into x
        assert!(ir.contains("store i32 5"), "{ir}");
    }

    #[test]
    fn functions_define_with_spilled_parameters() {
        let ir = compile_to_ir(indoc::indoc! {"
            func add(a: i32, b: i32): i32 {
                return a + b;
            }
        "})
        .unwrap();

        assert!(ir.contains("define i32 @add(i32 %0, i32 %1)"), "{ir}");
        // Each parameter gets a slot and a store
        let body = ir.split("@add").nth(1).unwrap();
        assert!(body.matches("alloc i32").count() >= 2, "{ir}");
    }

    #[test]
    fn declaration_only_functions_stay_declarations() {
        let ir = compile_to_ir("func ext(x: i32): i32;").unwrap();

        assert!(ir.contains("declare i32 @ext(i32)"), "{ir}");
    }

    #[test]
    fn prelude_functions_are_declared() {
        let ir = compile_to_ir("exit(42);").unwrap();

        assert!(ir.contains("declare void @exit(i32)"), "{ir}");
        assert!(ir.contains("call void @exit(i32 42)"), "{ir}");
    }

    #[test]
    fn if_else_builds_branching_blocks() {
        let ir = compile_to_ir(indoc::indoc! {"
            func max(a: i32, b: i32): i32 {
                if a > b {
                    return a;
                } else {
                    return b;
                }
            }
        "})
        .unwrap();

        assert!(ir.contains("icmp sgt i32"), "{ir}");
        assert!(ir.contains("br i1"), "{ir}");
    }

    #[test]
    fn branch_with_return_gets_no_fallthrough_jump() {
        let ir = compile_to_ir(indoc::indoc! {"
            func check(n: i32): i32 {
                if n > 0 {
                    return 1;
                }
                return 0;
            }
        "})
        .unwrap();

        // The then-block ends in ret, not jmp
        let body = ir.split("@check").nth(1).unwrap();
        let then_block: Vec<&str> = body
            .lines()
            .skip_while(|l| !l.starts_with("bb1"))
            .take_while(|l| !l.starts_with("bb2"))
            .collect();
        assert_eq!(then_block.last().map(|l| l.trim()), Some("ret i32 1"), "{ir}");
    }

    #[test]
    fn while_loops_have_cond_body_end_blocks() {
        let ir = compile_to_ir(indoc::indoc! {"
            func sum(n: i32): i32 {
                let total = 0;
                let i = 0;
                while i < n {
                    total += i;
                    i += 1;
                }
                return total;
            }
        "})
        .unwrap();

        let body = ir.split("@sum").nth(1).unwrap();
        assert!(body.contains("jmp bb1"), "{ir}");
        assert!(body.contains("br i1"), "{ir}");
    }

    #[test]
    fn user_operator_overloads_get_distinct_mangled_symbols() {
        let ir = compile_to_ir(indoc::indoc! {"
            operator infix *** (a: i32, b: i32): i32 prec 85 {
                return a * b * b;
            }
            operator infix *** (a: f64, b: f64): f64 prec 85 {
                return a * b;
            }
            let x = 3 *** 4;
            let y = 2.0 *** 3.0;
        "})
        .unwrap();

        assert!(ir.contains("define i32 @\"***$i32$i32\""), "{ir}");
        assert!(ir.contains("define f64 @\"***$f64$f64\""), "{ir}");
        assert!(ir.contains("call i32 @\"***$i32$i32\""), "{ir}");
        assert!(ir.contains("call f64 @\"***$f64$f64\""), "{ir}");
    }

    #[test]
    fn prefix_operator_overload_calls_mangled_symbol() {
        let ir = compile_to_ir(indoc::indoc! {"
            operator prefix ?? (x: i32): i32 {
                return 0 - x;
            }
            let y = ??5;
        "})
        .unwrap();

        assert!(ir.contains("define i32 @\"??$i32\""), "{ir}");
        assert!(ir.contains("call i32 @\"??$i32\""), "{ir}");
    }

    #[test]
    fn integer_power_is_not_built_in() {
        let file = SourceFile::from_string("let x = 2 ** 3;");
        let (mut stmts, errors) = Parser::parse_program(Lexer::tokenize_all(&file));
        assert_eq!(errors, vec![]);

        let mut symbols = ScopedSymbolTable::new();
        let mut builder = SymbolTableBuilder::new();
        assert!(builder.load_prelude(&mut symbols));
        assert!(builder.collect(&stmts, &mut symbols));
        assert_eq!(OperatorResolver::resolve_program(&mut stmts, &symbols), vec![]);
        // The type checker flags the operand mismatch; codegen then reports
        // the missing lowering
        let _ = TypeChecker::check_program(&mut stmts, &symbols);

        let errors = CodeGen::generate(&stmts, &symbols, "t").expect_err("no int power");
        assert!(errors
            .iter()
            .any(|e| e.message == "Unknown binary operator: **"));
    }

    #[test]
    fn undefined_variable_is_reported() {
        let errors = errors_of("let x = missing + 1;");

        assert!(errors
            .iter()
            .any(|e| e.message == "Undefined variable: missing"), "{errors:?}");
    }

    #[test]
    fn argument_count_mismatch_is_reported() {
        let errors = errors_of(indoc::indoc! {"
            func f(a: i32): i32 { return a; }
            f(1, 2);
        "});

        assert!(errors
            .iter()
            .any(|e| e.message == "Incorrect number of arguments for function f"));
    }

    #[test]
    fn entry_collects_top_level_statements_in_order() {
        let ir = compile_to_ir(indoc::indoc! {"
            let a = 1;
            func f(x: i32): i32 { return x; }
            let b = f(2);
            exit(b);
        "})
        .unwrap();

        let entry = ir.split("@__brook_entry").nth(1).unwrap();
        let call_pos = entry.find("call i32 @f").expect("call to f");
        let exit_pos = entry.find("call void @exit").expect("call to exit");
        assert!(call_pos < exit_pos, "{ir}");
    }

    #[test]
    fn generated_modules_pass_verification() {
        // A program exercising every control-flow shape at once
        compile_to_ir(indoc::indoc! {"
            func fib(n: i32): i32 {
                if n <= 1 {
                    return n;
                }
                return fib(n - 1) + fib(n - 2);
            }
            func collatz(n: i32): i32 {
                let steps = 0;
                while n != 1 {
                    if n % 2 == 0 {
                        n /= 2;
                    } else {
                        n = 3 * n + 1;
                    }
                    steps += 1;
                }
                return steps;
            }
            exit(fib(10) + collatz(27));
        "})
        .unwrap();
    }
}
