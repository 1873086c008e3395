//! Module well-formedness verification, run after code generation. Checks
//! the terminator discipline (exactly one, at the end of every block) and
//! that every value use is dominated by its definition. A verification
//! failure is an internal error: it means the generator emitted a malformed
//! function, not that the user's program is wrong.

use std::collections::BTreeSet;

use crate::index::Index;

use super::{Function, FunctionBody, Instruction, Module, Operand, ValueId};

pub fn verify_module(module: &Module) -> Vec<String> {
    let mut errors = Vec::new();

    for function in &module.functions {
        verify_function(function, &mut errors);
    }

    errors
}

fn verify_function(function: &Function, errors: &mut Vec<String>) {
    let Some(body) = &function.body else {
        return;
    };
    let name = function.name.value();

    if body.blocks.is_empty() {
        errors.push(format!("function @{name} has a body with no blocks"));
        return;
    }

    /* Terminator discipline */

    for block in body.blocks.iter() {
        let id = block.id.index();

        if block.instructions.is_empty() {
            errors.push(format!("bb{id} of @{name} is empty"));
            continue;
        }

        for (i, instruction) in block.instructions.iter().enumerate() {
            let is_last = i + 1 == block.instructions.len();

            if instruction.is_terminator() && !is_last {
                errors.push(format!(
                    "terminator in the middle of bb{id} of @{name}"
                ));
            }
            if is_last && !instruction.is_terminator() {
                errors.push(format!("bb{id} of @{name} has no terminator"));
            }

            for successor in instruction.successors() {
                if successor.index() >= body.blocks.len() {
                    errors.push(format!(
                        "bb{id} of @{name} branches to nonexistent bb{}",
                        successor.index()
                    ));
                }
            }
        }
    }

    if !errors.is_empty() {
        // Dominance analysis needs a structurally sound CFG
        return;
    }

    /* Def-dominates-use */

    let block_count = body.blocks.len();

    let mut predecessors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); block_count];
    for block in body.blocks.iter() {
        for successor in block.instructions.last().unwrap().successors() {
            predecessors[successor.index()].insert(block.id.index());
        }
    }

    let dominators = compute_dominators(block_count, &predecessors);

    // Definition position of every value: parameters exist on entry to the
    // entry block; the instruction at index i defines at position i + 1.
    let mut def_site: Vec<Option<(usize, usize)>> = vec![None; body.values.len()];
    for param in &body.param_values {
        def_site[param.index()] = Some((0, 0));
    }
    for block in body.blocks.iter() {
        for (i, instruction) in block.instructions.iter().enumerate() {
            if let Some(dest) = defined_value(instruction) {
                def_site[dest.index()] = Some((block.id.index(), i + 1));
            }
        }
    }

    for block in body.blocks.iter() {
        let block_id = block.id.index();

        for (i, instruction) in block.instructions.iter().enumerate() {
            for used in used_values(instruction) {
                let Some((def_block, def_pos)) = def_site[used.index()] else {
                    errors.push(format!(
                        "use of undefined value %{} in bb{block_id} of @{name}",
                        used.index()
                    ));
                    continue;
                };

                let dominated = if def_block == block_id {
                    def_pos <= i
                } else {
                    dominators[block_id].contains(&def_block)
                };

                if !dominated {
                    errors.push(format!(
                        "use of %{} in bb{block_id} of @{name} is not dominated by its definition",
                        used.index()
                    ));
                }
            }
        }
    }
}

/// Iterative dominator-set computation over block predecessors. Block 0 is
/// the entry; unreachable blocks keep the full set, which leaves their uses
/// vacuously dominated.
fn compute_dominators(block_count: usize, predecessors: &[BTreeSet<usize>]) -> Vec<BTreeSet<usize>> {
    let all: BTreeSet<usize> = (0..block_count).collect();

    let mut dominators: Vec<BTreeSet<usize>> = vec![all; block_count];
    dominators[0] = BTreeSet::from([0]);

    let mut changed = true;
    while changed {
        changed = false;

        for block in 1..block_count {
            let preds = &predecessors[block];
            if preds.is_empty() {
                continue;
            }

            let mut new: Option<BTreeSet<usize>> = None;
            for pred in preds {
                new = Some(match new {
                    None => dominators[*pred].clone(),
                    Some(acc) => acc.intersection(&dominators[*pred]).copied().collect(),
                });
            }

            let mut new = new.unwrap_or_default();
            new.insert(block);

            if new != dominators[block] {
                dominators[block] = new;
                changed = true;
            }
        }
    }

    dominators
}

fn defined_value(instruction: &Instruction) -> Option<ValueId> {
    match instruction {
        Instruction::Alloc { dest, .. }
        | Instruction::Load { dest, .. }
        | Instruction::Binary { dest, .. }
        | Instruction::Unary { dest, .. }
        | Instruction::ICmp { dest, .. }
        | Instruction::FCmp { dest, .. } => Some(*dest),
        Instruction::Call { dest, .. } => *dest,
        _ => None,
    }
}

fn used_values(instruction: &Instruction) -> Vec<ValueId> {
    fn operand(used: &mut Vec<ValueId>, op: &Operand) {
        if let Operand::Value(id) = op {
            used.push(*id);
        }
    }

    let mut used = Vec::new();

    match instruction {
        Instruction::Alloc { .. } => {}
        Instruction::Load { slot, .. } => used.push(*slot),
        Instruction::Store { slot, value, .. } => {
            used.push(*slot);
            operand(&mut used, value);
        }
        Instruction::Binary { lhs, rhs, .. }
        | Instruction::ICmp { lhs, rhs, .. }
        | Instruction::FCmp { lhs, rhs, .. } => {
            operand(&mut used, lhs);
            operand(&mut used, rhs);
        }
        Instruction::Unary { operand: op, .. } => operand(&mut used, op),
        Instruction::Call { args, .. } => {
            for arg in args {
                operand(&mut used, arg);
            }
        }
        Instruction::Branch { condition, .. } => operand(&mut used, condition),
        Instruction::Jump { .. } => {}
        Instruction::Return { value } => {
            if let Some(value) = value {
                operand(&mut used, value);
            }
        }
    }

    used
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        backend::ir::{BinaryOp, Block, BlockId, Immediate, Ty},
        frontend::intern::InternedSymbol,
        index::IndexVec,
    };

    fn function_with_blocks(blocks: Vec<Vec<Instruction>>, values: Vec<Ty>) -> Function {
        let mut body = FunctionBody::default();
        for ty in values {
            body.values.push(ty);
        }
        for (i, instructions) in blocks.into_iter().enumerate() {
            body.blocks.push(Block {
                id: BlockId::new(i),
                instructions,
            });
        }

        Function {
            name: InternedSymbol::new("test_fn"),
            params: Vec::new(),
            return_type: Ty::I32,
            body: Some(body),
        }
    }

    fn verify_one(function: Function) -> Vec<String> {
        let module = Module {
            name: "test".into(),
            strings: IndexVec::new(),
            functions: vec![function],
        };
        verify_module(&module)
    }

    #[test]
    fn accepts_well_formed_functions() {
        let function = function_with_blocks(
            vec![
                vec![
                    Instruction::Binary {
                        op: BinaryOp::Add,
                        dest: ValueId::new(0),
                        lhs: Operand::Immediate(Immediate::Int(1)),
                        rhs: Operand::Immediate(Immediate::Int(2)),
                    },
                    Instruction::Jump {
                        destination: BlockId::new(1),
                    },
                ],
                vec![Instruction::Return {
                    value: Some(Operand::Value(ValueId::new(0))),
                }],
            ],
            vec![Ty::I32],
        );

        assert_eq!(verify_one(function), Vec::<String>::new());
    }

    #[test]
    fn rejects_missing_terminator() {
        let function = function_with_blocks(
            vec![vec![Instruction::Binary {
                op: BinaryOp::Add,
                dest: ValueId::new(0),
                lhs: Operand::Immediate(Immediate::Int(1)),
                rhs: Operand::Immediate(Immediate::Int(2)),
            }]],
            vec![Ty::I32],
        );

        let errors = verify_one(function);
        assert_eq!(errors, vec!["bb0 of @test_fn has no terminator".to_owned()]);
    }

    #[test]
    fn rejects_mid_block_terminator() {
        let function = function_with_blocks(
            vec![vec![
                Instruction::Return { value: None },
                Instruction::Return { value: None },
            ]],
            vec![],
        );

        let errors = verify_one(function);
        assert_eq!(
            errors,
            vec!["terminator in the middle of bb0 of @test_fn".to_owned()]
        );
    }

    #[test]
    fn rejects_use_not_dominated_by_definition() {
        // bb0 branches to bb1 and bb2; the value defined in bb1 is used in
        // bb2, which bb1 does not dominate.
        let function = function_with_blocks(
            vec![
                vec![Instruction::Branch {
                    condition: Operand::Immediate(Immediate::Bool(true)),
                    positive: BlockId::new(1),
                    negative: BlockId::new(2),
                }],
                vec![
                    Instruction::Binary {
                        op: BinaryOp::Add,
                        dest: ValueId::new(0),
                        lhs: Operand::Immediate(Immediate::Int(1)),
                        rhs: Operand::Immediate(Immediate::Int(2)),
                    },
                    Instruction::Jump {
                        destination: BlockId::new(2),
                    },
                ],
                vec![Instruction::Return {
                    value: Some(Operand::Value(ValueId::new(0))),
                }],
            ],
            vec![Ty::I32],
        );

        let errors = verify_one(function);
        assert_eq!(
            errors,
            vec!["use of %0 in bb2 of @test_fn is not dominated by its definition".to_owned()]
        );
    }

    #[test]
    fn values_flow_through_dominating_blocks() {
        // bb0 defines, bb1 and bb2 both use; bb0 dominates both.
        let function = function_with_blocks(
            vec![
                vec![
                    Instruction::Binary {
                        op: BinaryOp::Add,
                        dest: ValueId::new(0),
                        lhs: Operand::Immediate(Immediate::Int(1)),
                        rhs: Operand::Immediate(Immediate::Int(2)),
                    },
                    Instruction::Branch {
                        condition: Operand::Immediate(Immediate::Bool(true)),
                        positive: BlockId::new(1),
                        negative: BlockId::new(2),
                    },
                ],
                vec![Instruction::Return {
                    value: Some(Operand::Value(ValueId::new(0))),
                }],
                vec![Instruction::Return {
                    value: Some(Operand::Value(ValueId::new(0))),
                }],
            ],
            vec![Ty::I32],
        );

        assert_eq!(verify_one(function), Vec::<String>::new());
    }
}
