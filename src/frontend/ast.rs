use std::fmt::Write as _;

use crate::{
    frontend::{intern::InternedSymbol, lexer::SourceLocation},
    middle::operators::{Associativity, OpPosition},
};

/// A written type annotation. Types are plain names from a closed set; the
/// location is kept for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeAnnotation {
    pub name: InternedSymbol,
    pub loc: SourceLocation,
}

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub loc: SourceLocation,
    /// Written exactly once by the type checker; `None` means unknown.
    pub inferred_type: Option<InternedSymbol>,
}

impl Expr {
    pub fn new(kind: ExprKind, loc: SourceLocation) -> Self {
        Self {
            kind,
            loc,
            inferred_type: None,
        }
    }
}

#[derive(Debug)]
pub enum ExprKind {
    /// Raw digit text; the numeric parse is deferred to code generation
    IntLiteral(InternedSymbol),
    FloatLiteral(InternedSymbol),
    /// Decoded contents, escapes already resolved
    StringLiteral(InternedSymbol),
    BoolLiteral(bool),
    Identifier(InternedSymbol),
    Binary {
        op: InternedSymbol,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: InternedSymbol,
        operand: Box<Expr>,
        position: OpPosition,
    },
    /// The parser's flat expression form; eliminated by the operator resolver
    OpSequence(Vec<OpSeqItem>),
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
}

/// One item of an operator sequence: an operand expression or an operator
/// symbol with its own span.
#[derive(Debug)]
pub enum OpSeqItem {
    Operator {
        symbol: InternedSymbol,
        loc: SourceLocation,
    },
    Operand(Expr),
}

#[derive(Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: SourceLocation,
}

#[derive(Debug)]
pub enum StmtKind {
    Let {
        name: InternedSymbol,
        ty: Option<TypeAnnotation>,
        init: Expr,
    },
    Func(FuncDecl),
    OperatorDecl(OperatorDecl),
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        /// A nested `If` statement or a `Block`
        else_branch: Option<Box<Stmt>>,
    },
    Return(Option<Expr>),
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    Expr(Expr),
    Block(Vec<Stmt>),
}

#[derive(Debug)]
pub struct FuncDecl {
    pub name: InternedSymbol,
    pub params: Vec<Parameter>,
    pub return_type: Option<TypeAnnotation>,
    /// `None` for bodyless declarations (externals)
    pub body: Option<Box<Stmt>>,
}

#[derive(Debug)]
pub struct OperatorDecl {
    pub symbol: InternedSymbol,
    pub position: OpPosition,
    pub params: Vec<Parameter>,
    pub return_type: Option<TypeAnnotation>,
    /// Meaningful only for infix operators
    pub precedence: i32,
    pub assoc: Associativity,
    pub body: Option<Box<Stmt>>,
}

#[derive(Debug)]
pub struct Parameter {
    pub name: InternedSymbol,
    pub ty: Option<TypeAnnotation>,
    pub loc: SourceLocation,
}

impl core::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ExprKind::IntLiteral(value) => write!(f, "IntLiteral({value})"),
            ExprKind::FloatLiteral(value) => write!(f, "FloatLiteral({value})"),
            ExprKind::StringLiteral(value) => write!(f, "StringLiteral(\"{value}\")"),
            ExprKind::BoolLiteral(value) => write!(f, "BoolLiteral({value})"),
            ExprKind::Identifier(name) => write!(f, "Identifier({name})"),
            ExprKind::Binary { op, lhs, rhs } => write!(f, "Binary({op}, {lhs}, {rhs})"),
            ExprKind::Unary {
                op,
                operand,
                position,
            } => {
                let position = match position {
                    OpPosition::Prefix => "Prefix",
                    OpPosition::Infix => "Infix",
                    OpPosition::Postfix => "Postfix",
                };
                write!(f, "Unary({op}, {operand}, {position})")
            }
            ExprKind::OpSequence(items) => {
                f.write_str("OperatorSeq(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    match item {
                        OpSeqItem::Operator { symbol, .. } => write!(f, "{symbol}")?,
                        OpSeqItem::Operand(expr) => write!(f, "{expr}")?,
                    }
                }
                f.write_str(")")
            }
            ExprKind::Call { callee, args } => {
                write!(f, "Call({callee}, [")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str("])")
            }
        }
    }
}

impl Stmt {
    /// Renders the statement tree in the dump format used by `--parse` and
    /// `--dump-ast`.
    pub fn dump(&self, out: &mut String, indent: usize) {
        let pad = "  ".repeat(indent);

        match &self.kind {
            StmtKind::Let { name, ty, init } => {
                let _ = write!(out, "{pad}Let({name}");
                if let Some(ty) = ty {
                    let _ = write!(out, " : {}", ty.name);
                }
                let _ = writeln!(out, " = {init})");
            }
            StmtKind::Func(func) => {
                let _ = write!(out, "{pad}Func({}(", func.name);
                dump_params(out, &func.params);
                let _ = write!(out, ")");
                if let Some(ret) = &func.return_type {
                    let _ = write!(out, " : {}", ret.name);
                }
                let _ = writeln!(out, ")");
                if let Some(body) = &func.body {
                    body.dump(out, indent + 1);
                }
            }
            StmtKind::OperatorDecl(op) => {
                let position = match op.position {
                    OpPosition::Prefix => "prefix",
                    OpPosition::Infix => "infix",
                    OpPosition::Postfix => "postfix",
                };
                let _ = write!(out, "{pad}OperatorDecl({position} {}(", op.symbol);
                dump_params(out, &op.params);
                let _ = write!(out, ")");
                if let Some(ret) = &op.return_type {
                    let _ = write!(out, " : {}", ret.name);
                }
                if op.position == OpPosition::Infix {
                    let _ = write!(out, " prec {}", op.precedence);
                    if op.assoc == Associativity::Right {
                        let _ = write!(out, " assoc_right");
                    }
                }
                let _ = writeln!(out, ")");
                if let Some(body) = &op.body {
                    body.dump(out, indent + 1);
                }
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let _ = writeln!(out, "{pad}If({condition})");
                then_branch.dump(out, indent + 1);
                if let Some(else_branch) = else_branch {
                    let _ = writeln!(out, "{pad}Else");
                    else_branch.dump(out, indent + 1);
                }
            }
            StmtKind::Return(value) => {
                let _ = write!(out, "{pad}Return(");
                if let Some(value) = value {
                    let _ = write!(out, "{value}");
                }
                let _ = writeln!(out, ")");
            }
            StmtKind::While { condition, body } => {
                let _ = writeln!(out, "{pad}While({condition})");
                body.dump(out, indent + 1);
            }
            StmtKind::Expr(expr) => {
                let _ = writeln!(out, "{pad}Expr({expr})");
            }
            StmtKind::Block(stmts) => {
                let _ = writeln!(out, "{pad}Block");
                for stmt in stmts {
                    stmt.dump(out, indent + 1);
                }
            }
        }
    }
}

fn dump_params(out: &mut String, params: &[Parameter]) {
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            let _ = write!(out, ", ");
        }
        let _ = write!(out, "{}", param.name);
        if let Some(ty) = &param.ty {
            let _ = write!(out, " : {}", ty.name);
        }
    }
}
