//! Translates a verified IR module to x86-64 (System V) assembly in AT&T
//! syntax, ready for the system C compiler to assemble.
//!
//! The translation is deliberately naive: every virtual register is spilled
//! to a fixed rbp-relative slot, `alloc` bumps rsp in 16-byte steps, and
//! instructions work through rax/rcx (or xmm0/xmm1) scratch registers. A
//! conventional `main` wrapper tail-calls the synthetic entry function so
//! libc startup and exit-code handling come for free.

use std::fmt::Write as _;

use hashbrown::HashMap;

use crate::{
    backend::{
        codegen::ENTRY_SYMBOL,
        ir::{
            BinaryOp, FloatPredicate, Function, FunctionBody, Immediate, Instruction,
            IntPredicate, Module, Operand, Ty, UnaryOp, ValueId,
        },
    },
    index::Index,
};

const INT_ARG_REGS: &[&str] = &["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];
const FLOAT_ARG_REGS: &[&str] = &[
    "%xmm0", "%xmm1", "%xmm2", "%xmm3", "%xmm4", "%xmm5", "%xmm6", "%xmm7",
];

pub fn translate_module(module: &Module) -> String {
    let mut assembler = Assembler {
        out: String::new(),
        float_constants: Vec::new(),
        float_indices: HashMap::new(),
        needs_sign_mask: false,
    };

    assembler.raw(".text");

    for (index, function) in module.functions.iter().enumerate() {
        if let Some(body) = &function.body {
            assembler.translate_function(index, function, body);
        }
    }

    /* Conventional main wrapper around the program entry */

    assembler.raw("");
    assembler.raw(".globl main");
    assembler.raw("main:");
    assembler.emit("pushq %rbp");
    assembler.emit("movq %rsp, %rbp");
    assembler.emit(format!("call {ENTRY_SYMBOL}"));
    assembler.emit("popq %rbp");
    assembler.emit("ret");

    /* Static data */

    if !module.strings.is_empty() || !assembler.float_constants.is_empty() {
        assembler.raw("");
        assembler.raw(".section .rodata");
    }

    for (id, string) in module.strings.enumerate() {
        assembler.raw(format!(".Lstr{}:", id.index()));
        assembler.emit(format!(".asciz \"{}\"", escape_asm_string(string)));
    }

    for (i, bits) in assembler.float_constants.clone().into_iter().enumerate() {
        assembler.raw(format!(".LCf{i}:"));
        assembler.emit(format!(".quad 0x{bits:016X}"));
    }

    if assembler.needs_sign_mask {
        assembler.raw(".p2align 4");
        assembler.raw(".LCsign:");
        assembler.emit(".quad 0x8000000000000000");
        assembler.emit(".quad 0");
    }

    assembler.out
}

struct Assembler {
    out: String,
    /// Bit patterns of f64 constants, emitted into .rodata at the end
    float_constants: Vec<u64>,
    float_indices: HashMap<u64, usize>,
    needs_sign_mask: bool,
}

impl Assembler {
    fn raw(&mut self, line: impl AsRef<str>) {
        self.out.push_str(line.as_ref());
        self.out.push('\n');
    }

    fn emit(&mut self, line: impl AsRef<str>) {
        self.out.push_str("    ");
        self.out.push_str(line.as_ref());
        self.out.push('\n');
    }

    fn float_constant(&mut self, value: f64) -> usize {
        let bits = value.to_bits();
        if let Some(&index) = self.float_indices.get(&bits) {
            return index;
        }

        let index = self.float_constants.len();
        self.float_constants.push(bits);
        self.float_indices.insert(bits, index);
        index
    }

    fn translate_function(&mut self, index: usize, function: &Function, body: &FunctionBody) {
        let symbol = asm_symbol(function.name.value());

        // One 8-byte spill slot per virtual register, rbp-relative
        let frame_size = align_to(8 * body.values.len(), 16);

        self.raw("");
        self.raw(format!(".globl {symbol}"));
        self.raw(format!("{symbol}:"));
        self.emit("pushq %rbp");
        self.emit("movq %rsp, %rbp");
        if frame_size > 0 {
            self.emit(format!("subq ${frame_size}, %rsp"));
        }

        /* Spill incoming arguments into their value slots */

        let mut int_used = 0;
        let mut float_used = 0;
        let mut stack_used = 0;

        for (i, param) in body.param_values.iter().enumerate() {
            let ty = function.params[i];
            let offset = slot_offset(*param);

            if ty.is_float() {
                if float_used < FLOAT_ARG_REGS.len() {
                    self.emit(format!("movsd {}, {offset}(%rbp)", FLOAT_ARG_REGS[float_used]));
                    float_used += 1;
                } else {
                    let incoming = 16 + 8 * stack_used;
                    self.emit(format!("movsd {incoming}(%rbp), %xmm0"));
                    self.emit(format!("movsd %xmm0, {offset}(%rbp)"));
                    stack_used += 1;
                }
            } else if int_used < INT_ARG_REGS.len() {
                self.emit(format!("movq {}, {offset}(%rbp)", INT_ARG_REGS[int_used]));
                int_used += 1;
            } else {
                let incoming = 16 + 8 * stack_used;
                self.emit(format!("movq {incoming}(%rbp), %rax"));
                self.emit(format!("movq %rax, {offset}(%rbp)"));
                stack_used += 1;
            }
        }

        for block in body.blocks.iter() {
            self.raw(format!("{}:", block_label(index, block.id.index())));
            for instruction in &block.instructions {
                self.translate_instruction(index, function, body, instruction);
            }
        }

        self.raw(format!("{}:", epilogue_label(index)));
        self.emit("movq %rbp, %rsp");
        self.emit("popq %rbp");
        self.emit("ret");
    }

    fn translate_instruction(
        &mut self,
        fn_index: usize,
        function: &Function,
        body: &FunctionBody,
        instruction: &Instruction,
    ) {
        match instruction {
            Instruction::Alloc { dest, .. } => {
                // 16 bytes covers every storable type and keeps rsp aligned
                self.emit("subq $16, %rsp");
                self.emit(format!("movq %rsp, {}(%rbp)", slot_offset(*dest)));
            }
            Instruction::Load { dest, ty, slot } => {
                self.emit(format!("movq {}(%rbp), %rax", slot_offset(*slot)));
                match ty {
                    Ty::I32 => self.emit("movl (%rax), %ecx"),
                    Ty::I1 => self.emit("movzbl (%rax), %ecx"),
                    Ty::Ptr => self.emit("movq (%rax), %rcx"),
                    Ty::F64 => {
                        self.emit("movsd (%rax), %xmm0");
                        self.emit(format!("movsd %xmm0, {}(%rbp)", slot_offset(*dest)));
                        return;
                    }
                    Ty::Void => unreachable!("void values are never loaded"),
                }
                self.emit(format!("movq %rcx, {}(%rbp)", slot_offset(*dest)));
            }
            Instruction::Store { ty, slot, value } => {
                if ty.is_float() {
                    self.load_float_operand(body, value, "%xmm0");
                } else {
                    self.load_int_operand(value, "%rax");
                }
                self.emit(format!("movq {}(%rbp), %rcx", slot_offset(*slot)));
                match ty {
                    Ty::I32 => self.emit("movl %eax, (%rcx)"),
                    Ty::I1 => self.emit("movb %al, (%rcx)"),
                    Ty::Ptr => self.emit("movq %rax, (%rcx)"),
                    Ty::F64 => self.emit("movsd %xmm0, (%rcx)"),
                    Ty::Void => unreachable!("void values are never stored"),
                }
            }
            Instruction::Binary { op, dest, lhs, rhs } => match op {
                BinaryOp::FAdd | BinaryOp::FSub | BinaryOp::FMul | BinaryOp::FDiv => {
                    self.load_float_operand(body, lhs, "%xmm0");
                    self.load_float_operand(body, rhs, "%xmm1");
                    let mnemonic = match op {
                        BinaryOp::FAdd => "addsd",
                        BinaryOp::FSub => "subsd",
                        BinaryOp::FMul => "mulsd",
                        BinaryOp::FDiv => "divsd",
                        _ => unreachable!(),
                    };
                    self.emit(format!("{mnemonic} %xmm1, %xmm0"));
                    self.emit(format!("movsd %xmm0, {}(%rbp)", slot_offset(*dest)));
                }
                BinaryOp::FPow => {
                    // The generic power intrinsic maps to libm pow
                    self.load_float_operand(body, lhs, "%xmm0");
                    self.load_float_operand(body, rhs, "%xmm1");
                    self.emit("call pow");
                    self.emit(format!("movsd %xmm0, {}(%rbp)", slot_offset(*dest)));
                }
                _ => {
                    self.load_int_operand(lhs, "%rax");
                    self.load_int_operand(rhs, "%rcx");
                    match op {
                        BinaryOp::Add => self.emit("addl %ecx, %eax"),
                        BinaryOp::Sub => self.emit("subl %ecx, %eax"),
                        BinaryOp::Mul => self.emit("imull %ecx, %eax"),
                        BinaryOp::SDiv => {
                            self.emit("cltd");
                            self.emit("idivl %ecx");
                        }
                        BinaryOp::SRem => {
                            self.emit("cltd");
                            self.emit("idivl %ecx");
                            self.emit("movl %edx, %eax");
                        }
                        BinaryOp::And => self.emit("andl %ecx, %eax"),
                        BinaryOp::Or => self.emit("orl %ecx, %eax"),
                        BinaryOp::Xor => self.emit("xorl %ecx, %eax"),
                        BinaryOp::Shl => self.emit("shll %cl, %eax"),
                        BinaryOp::AShr => self.emit("sarl %cl, %eax"),
                        _ => unreachable!(),
                    }
                    self.emit(format!("movq %rax, {}(%rbp)", slot_offset(*dest)));
                }
            },
            Instruction::Unary { op, dest, operand } => match op {
                UnaryOp::Neg => {
                    self.load_int_operand(operand, "%rax");
                    self.emit("negl %eax");
                    self.emit(format!("movq %rax, {}(%rbp)", slot_offset(*dest)));
                }
                UnaryOp::Not => {
                    self.load_int_operand(operand, "%rax");
                    self.emit("xorl $1, %eax");
                    self.emit(format!("movq %rax, {}(%rbp)", slot_offset(*dest)));
                }
                UnaryOp::FNeg => {
                    self.needs_sign_mask = true;
                    self.load_float_operand(body, operand, "%xmm0");
                    self.emit("xorpd .LCsign(%rip), %xmm0");
                    self.emit(format!("movsd %xmm0, {}(%rbp)", slot_offset(*dest)));
                }
            },
            Instruction::ICmp {
                pred,
                dest,
                lhs,
                rhs,
            } => {
                self.load_int_operand(lhs, "%rax");
                self.load_int_operand(rhs, "%rcx");
                self.emit("cmpl %ecx, %eax");
                let setcc = match pred {
                    IntPredicate::Eq => "sete",
                    IntPredicate::Ne => "setne",
                    IntPredicate::Slt => "setl",
                    IntPredicate::Sle => "setle",
                    IntPredicate::Sgt => "setg",
                    IntPredicate::Sge => "setge",
                };
                self.emit(format!("{setcc} %al"));
                self.emit("movzbl %al, %eax");
                self.emit(format!("movq %rax, {}(%rbp)", slot_offset(*dest)));
            }
            Instruction::FCmp {
                pred,
                dest,
                lhs,
                rhs,
            } => {
                self.load_float_operand(body, lhs, "%xmm0");
                self.load_float_operand(body, rhs, "%xmm1");
                self.emit("ucomisd %xmm1, %xmm0");
                let setcc = match pred {
                    FloatPredicate::Oeq => "sete",
                    FloatPredicate::One => "setne",
                    FloatPredicate::Olt => "setb",
                    FloatPredicate::Ole => "setbe",
                    FloatPredicate::Ogt => "seta",
                    FloatPredicate::Oge => "setae",
                };
                self.emit(format!("{setcc} %al"));
                self.emit("movzbl %al, %eax");
                self.emit(format!("movq %rax, {}(%rbp)", slot_offset(*dest)));
            }
            Instruction::Call { dest, callee, args } => {
                self.translate_call(body, *dest, callee.value(), args);
            }
            Instruction::Branch {
                condition,
                positive,
                negative,
            } => {
                self.load_int_operand(condition, "%rax");
                self.emit("testb %al, %al");
                self.emit(format!("jnz {}", block_label(fn_index, positive.index())));
                self.emit(format!("jmp {}", block_label(fn_index, negative.index())));
            }
            Instruction::Jump { destination } => {
                self.emit(format!("jmp {}", block_label(fn_index, destination.index())));
            }
            Instruction::Return { value } => {
                if let Some(value) = value {
                    if function.return_type.is_float() {
                        self.load_float_operand(body, value, "%xmm0");
                    } else {
                        self.load_int_operand(value, "%rax");
                    }
                }
                self.emit(format!("jmp {}", epilogue_label(fn_index)));
            }
        }
    }

    fn translate_call(
        &mut self,
        body: &FunctionBody,
        dest: Option<ValueId>,
        callee: &str,
        args: &[Operand],
    ) {
        let mut int_args: Vec<(&'static str, Operand)> = Vec::new();
        let mut float_args: Vec<(&'static str, Operand)> = Vec::new();
        let mut stack_args: Vec<Operand> = Vec::new();

        for arg in args {
            if body.operand_type(arg).is_float() {
                if float_args.len() < FLOAT_ARG_REGS.len() {
                    float_args.push((FLOAT_ARG_REGS[float_args.len()], *arg));
                } else {
                    stack_args.push(*arg);
                }
            } else if int_args.len() < INT_ARG_REGS.len() {
                int_args.push((INT_ARG_REGS[int_args.len()], *arg));
            } else {
                stack_args.push(*arg);
            }
        }

        // Overflow arguments go on the stack, kept 16-byte aligned
        let padding = if stack_args.len() % 2 == 1 { 8 } else { 0 };
        let stack_bytes = 8 * stack_args.len() + padding;
        if stack_bytes > 0 {
            self.emit(format!("subq ${stack_bytes}, %rsp"));
        }
        for (i, arg) in stack_args.iter().enumerate() {
            if body.operand_type(arg).is_float() {
                self.load_float_operand(body, arg, "%xmm0");
                self.emit(format!("movsd %xmm0, {}(%rsp)", 8 * i));
            } else {
                self.load_int_operand(arg, "%rax");
                self.emit(format!("movq %rax, {}(%rsp)", 8 * i));
            }
        }

        for (register, arg) in &int_args {
            self.load_int_operand(arg, register);
        }
        for (register, arg) in &float_args {
            self.load_float_operand(body, arg, register);
        }

        self.emit(format!("call {}", asm_symbol(callee)));

        if stack_bytes > 0 {
            self.emit(format!("addq ${stack_bytes}, %rsp"));
        }

        if let Some(dest) = dest {
            if body.values[dest].is_float() {
                self.emit(format!("movsd %xmm0, {}(%rbp)", slot_offset(dest)));
            } else {
                self.emit(format!("movq %rax, {}(%rbp)", slot_offset(dest)));
            }
        }
    }

    fn load_int_operand(&mut self, operand: &Operand, register: &str) {
        match operand {
            Operand::Immediate(Immediate::Int(v)) => self.emit(format!("movq ${v}, {register}")),
            Operand::Immediate(Immediate::Bool(b)) => {
                self.emit(format!("movq ${}, {register}", *b as i32))
            }
            Operand::Immediate(Immediate::Str(id)) => {
                self.emit(format!("leaq .Lstr{}(%rip), {register}", id.index()))
            }
            Operand::Immediate(Immediate::Null) => self.emit(format!("movq $0, {register}")),
            Operand::Value(id) => {
                self.emit(format!("movq {}(%rbp), {register}", slot_offset(*id)))
            }
            Operand::Immediate(Immediate::Float(_)) => {
                unreachable!("float operand in integer position")
            }
        }
    }

    fn load_float_operand(&mut self, body: &FunctionBody, operand: &Operand, register: &str) {
        match operand {
            Operand::Immediate(Immediate::Float(v)) => {
                let index = self.float_constant(*v);
                self.emit(format!("movsd .LCf{index}(%rip), {register}"));
            }
            Operand::Value(id) => {
                debug_assert!(body.values[*id].is_float());
                self.emit(format!("movsd {}(%rbp), {register}", slot_offset(*id)));
            }
            _ => unreachable!("integer operand in float position"),
        }
    }
}

fn slot_offset(value: ValueId) -> i64 {
    -(8 * (value.index() as i64 + 1))
}

fn block_label(fn_index: usize, block_index: usize) -> String {
    format!(".L{fn_index}_{block_index}")
}

fn epilogue_label(fn_index: usize) -> String {
    format!(".L{fn_index}_ret")
}

fn align_to(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Assembler-safe spelling of an IR symbol. Characters outside the set the
/// assembler accepts in names are escaped as `$xHH`, applied identically at
/// definition and call sites so linkage stays consistent. Escaped names are
/// given a letter prefix since symbols must not start with `$`.
fn asm_symbol(name: &str) -> String {
    let mut out = String::with_capacity(name.len());

    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'$' | b'.' => {
                out.push(byte as char)
            }
            _ => {
                let _ = write!(out, "$x{byte:02X}");
            }
        }
    }

    let starts_plain = out
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '.');
    if starts_plain {
        out
    } else {
        format!("brook.{out}")
    }
}

fn escape_asm_string(string: &str) -> String {
    let mut out = String::with_capacity(string.len());

    for byte in string.bytes() {
        match byte {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(byte as char),
            _ => {
                let _ = write!(out, "\\{byte:03o}");
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn symbols_escape_operator_characters() {
        assert_eq!(asm_symbol("fib"), "fib");
        assert_eq!(asm_symbol("***$i32$i32"), "brook.$x2A$x2A$x2A$i32$i32");
        assert_eq!(asm_symbol("+$f64$f64"), "brook.$x2B$f64$f64");
        assert_eq!(asm_symbol("__brook_entry"), "__brook_entry");
    }

    #[test]
    fn strings_escape_for_asciz() {
        assert_eq!(escape_asm_string("hi"), "hi");
        assert_eq!(escape_asm_string("a\"b\\c"), "a\\\"b\\\\c");
        assert_eq!(escape_asm_string("line\n"), "line\\012");
    }

    #[test]
    fn frame_sizes_are_aligned() {
        assert_eq!(align_to(0, 16), 0);
        assert_eq!(align_to(8, 16), 16);
        assert_eq!(align_to(16, 16), 16);
        assert_eq!(align_to(24, 16), 32);
    }
}
