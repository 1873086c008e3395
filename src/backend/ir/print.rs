//! Textual rendering of IR modules, in an LLVM-flavored syntax. This is the
//! `--emit-ir` output and what the IR tests assert against.

use std::fmt::Write as _;

use crate::index::Index;

use super::{Function, FunctionBody, Immediate, Instruction, Module, Operand, Ty};

pub fn print_module(module: &Module) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "; module {}", module.name);

    if !module.strings.is_empty() {
        out.push('\n');
        for (id, string) in module.strings.enumerate() {
            let _ = writeln!(
                out,
                "@str.{} = constant \"{}\"",
                id.index(),
                escape_string(string)
            );
        }
    }

    for function in &module.functions {
        out.push('\n');
        print_function(&mut out, function);
    }

    out
}

fn print_function(out: &mut String, function: &Function) {
    let name = format_symbol(function.name.value());

    match &function.body {
        None => {
            let params = function
                .params
                .iter()
                .map(|ty| ty.name())
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(out, "declare {} {name}({params})", function.return_type);
        }
        Some(body) => {
            let params = body
                .param_values
                .iter()
                .zip(&function.params)
                .map(|(value, ty)| format!("{ty} %{}", value.index()))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(out, "define {} {name}({params}) {{", function.return_type);

            for block in body.blocks.iter() {
                let _ = writeln!(out, "bb{}:", block.id.index());
                for instruction in &block.instructions {
                    let _ = writeln!(out, "  {}", format_instruction(body, instruction));
                }
            }

            let _ = writeln!(out, "}}");
        }
    }
}

fn format_instruction(body: &FunctionBody, instruction: &Instruction) -> String {
    match instruction {
        Instruction::Alloc { dest, ty } => format!("%{} = alloc {ty}", dest.index()),
        Instruction::Load { dest, ty, slot } => {
            format!("%{} = load {ty}, %{}", dest.index(), slot.index())
        }
        Instruction::Store { ty, slot, value } => {
            format!("store {ty} {}, %{}", format_operand(value), slot.index())
        }
        Instruction::Binary { op, dest, lhs, rhs } => format!(
            "%{} = {} {} {}, {}",
            dest.index(),
            op.mnemonic(),
            body.values[*dest],
            format_operand(lhs),
            format_operand(rhs)
        ),
        Instruction::Unary { op, dest, operand } => format!(
            "%{} = {} {} {}",
            dest.index(),
            op.mnemonic(),
            body.values[*dest],
            format_operand(operand)
        ),
        Instruction::ICmp {
            pred,
            dest,
            lhs,
            rhs,
        } => format!(
            "%{} = icmp {} {} {}, {}",
            dest.index(),
            pred.mnemonic(),
            operand_type(body, lhs),
            format_operand(lhs),
            format_operand(rhs)
        ),
        Instruction::FCmp {
            pred,
            dest,
            lhs,
            rhs,
        } => format!(
            "%{} = fcmp {} {} {}, {}",
            dest.index(),
            pred.mnemonic(),
            operand_type(body, lhs),
            format_operand(lhs),
            format_operand(rhs)
        ),
        Instruction::Call { dest, callee, args } => {
            let args = args
                .iter()
                .map(|arg| format!("{} {}", operand_type(body, arg), format_operand(arg)))
                .collect::<Vec<_>>()
                .join(", ");

            match dest {
                Some(dest) => format!(
                    "%{} = call {} {}({args})",
                    dest.index(),
                    body.values[*dest],
                    format_symbol(callee.value()),
                ),
                None => format!("call void {}({args})", format_symbol(callee.value())),
            }
        }
        Instruction::Branch {
            condition,
            positive,
            negative,
        } => format!(
            "br i1 {}, bb{}, bb{}",
            format_operand(condition),
            positive.index(),
            negative.index()
        ),
        Instruction::Jump { destination } => format!("jmp bb{}", destination.index()),
        Instruction::Return { value } => match value {
            Some(value) => format!(
                "ret {} {}",
                operand_type(body, value),
                format_operand(value)
            ),
            None => "ret void".to_owned(),
        },
    }
}

fn format_operand(operand: &Operand) -> String {
    match operand {
        Operand::Immediate(Immediate::Int(v)) => v.to_string(),
        Operand::Immediate(Immediate::Float(v)) => format!("{v:?}"),
        Operand::Immediate(Immediate::Bool(v)) => v.to_string(),
        Operand::Immediate(Immediate::Str(id)) => format!("@str.{}", id.index()),
        Operand::Immediate(Immediate::Null) => "null".to_owned(),
        Operand::Value(id) => format!("%{}", id.index()),
    }
}

fn operand_type(body: &FunctionBody, operand: &Operand) -> Ty {
    body.operand_type(operand)
}

/// Symbols that are not plain identifiers (mangled operator names) are
/// quoted, the way LLVM quotes unusual global names.
fn format_symbol(name: &str) -> String {
    let plain = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.'));

    if plain {
        format!("@{name}")
    } else {
        format!("@\"{name}\"")
    }
}

fn escape_string(string: &str) -> String {
    let mut out = String::with_capacity(string.len());

    for byte in string.bytes() {
        match byte {
            b'"' => out.push_str("\\22"),
            b'\\' => out.push_str("\\5C"),
            0x20..=0x7e => out.push(byte as char),
            _ => {
                let _ = write!(out, "\\{byte:02X}");
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        backend::ir::{Block, BlockId, Module},
        frontend::intern::InternedSymbol,
        index::{Index as _, IndexVec},
    };

    #[test]
    fn prints_declarations_and_definitions() {
        let mut strings = IndexVec::new();
        strings.push("hi\n".to_owned());

        let mut body = FunctionBody::default();
        let param = body.values.push(Ty::I32);
        let slot = body.values.push(Ty::Ptr);
        let loaded = body.values.push(Ty::I32);
        body.param_values.push(param);
        body.blocks.push(Block {
            id: BlockId::new(0),
            instructions: vec![
                Instruction::Alloc {
                    dest: slot,
                    ty: Ty::I32,
                },
                Instruction::Store {
                    ty: Ty::I32,
                    slot,
                    value: Operand::Value(param),
                },
                Instruction::Load {
                    dest: loaded,
                    ty: Ty::I32,
                    slot,
                },
                Instruction::Return {
                    value: Some(Operand::Value(loaded)),
                },
            ],
        });

        let module = Module {
            name: "demo".into(),
            strings,
            functions: vec![
                Function {
                    name: InternedSymbol::new("exit"),
                    params: vec![Ty::I32],
                    return_type: Ty::Void,
                    body: None,
                },
                Function {
                    name: InternedSymbol::new("+$i32$i32"),
                    params: vec![Ty::I32, Ty::I32],
                    return_type: Ty::I32,
                    body: None,
                },
                Function {
                    name: InternedSymbol::new("id"),
                    params: vec![Ty::I32],
                    return_type: Ty::I32,
                    body: Some(body),
                },
            ],
        };

        assert_eq!(
            print_module(&module),
            indoc::indoc! {r#"
                ; module demo

                @str.0 = constant "hi\0A"

                declare void @exit(i32)

                declare i32 @"+$i32$i32"(i32, i32)

                define i32 @id(i32 %0) {
                bb0:
                  %1 = alloc i32
                  store i32 %0, %1
                  %2 = load i32, %1
                  ret i32 %2
                }
            "#}
        );
    }
}
