//! Chunk disassembler, feeding execution traces and tests.

use std::fmt::Write;

use crate::chunk::{Chunk, OpCode};

pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = format!("==== {} ====\n", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(chunk, offset);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}

/// Render one instruction, returning the text and the next offset.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut out = String::new();
    if offset > 0 && chunk.line_at(offset - 1) == chunk.line_at(offset) {
        let _ = write!(out, "{:04}    | ", offset);
    } else {
        let _ = write!(out, "{:04} {:4} ", offset, chunk.line_at(offset));
    }

    let Some(op) = OpCode::from_byte(chunk.code[offset]) else {
        let _ = write!(out, "unknown opcode {}", chunk.code[offset]);
        return (out, offset + 1);
    };

    match op {
        OpCode::Pop
        | OpCode::True
        | OpCode::False
        | OpCode::Nil
        | OpCode::Eq
        | OpCode::Neq
        | OpCode::Not
        | OpCode::Assert
        | OpCode::CloseUpvalue
        | OpCode::Object
        | OpCode::ObjLitSet
        | OpCode::Return => {
            let _ = write!(out, "{:?}", op);
            (out, offset + 1)
        }
        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue => {
            let slot = chunk.code[offset + 1];
            let _ = write!(out, "{:?} {}", op, slot);
            (out, offset + 2)
        }
        OpCode::Jump | OpCode::JumpIfTrue | OpCode::JumpIfFalse | OpCode::Loop => {
            let operand = read_u16(chunk, offset + 1) as usize;
            let target = if op == OpCode::Loop {
                offset + 3 - operand
            } else {
                offset + 3 + operand
            };
            let _ = write!(out, "{:?} {} -> {:04}", op, operand, target);
            (out, offset + 3)
        }
        OpCode::Constant
        | OpCode::DefGlobal
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::ObjectSet => {
            let index = read_u16(chunk, offset + 1) as usize;
            let _ = write!(out, "{:?} {} '{}'", op, index, chunk.constants[index]);
            (out, offset + 3)
        }
        OpCode::Invoke => {
            let index = read_u16(chunk, offset + 1) as usize;
            let argc = chunk.code[offset + 3];
            let _ = write!(
                out,
                "{:?} '{}' ({} args)",
                op, chunk.constants[index], argc
            );
            (out, offset + 4)
        }
        OpCode::Closure => {
            let index = read_u16(chunk, offset + 1) as usize;
            let _ = write!(out, "{:?} {} '{}'", op, index, chunk.constants[index]);
            let mut next = offset + 3;
            // Safety: closure operands name a live function constant.
            let count = match chunk.constants[index] {
                crate::value::Value::Obj(r) => unsafe { r.function() }.upvalue_count,
                _ => 0,
            };
            for _ in 0..count {
                let is_local = chunk.code[next];
                let slot = chunk.code[next + 1];
                let _ = write!(
                    out,
                    "\n        | {} {}",
                    if is_local != 0 { "local" } else { "upvalue" },
                    slot
                );
                next += 2;
            }
            (out, next)
        }
    }
}

fn read_u16(chunk: &Chunk, offset: usize) -> u16 {
    ((chunk.code[offset] as u16) << 8) | chunk.code[offset + 1] as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn simple_and_constant_instructions() {
        let mut chunk = Chunk::new();
        let index = chunk.add_constant(Value::Number(7.0)) as u16;
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_u16(index, 1);
        chunk.write_op(OpCode::Return, 2);

        let text = disassemble_chunk(&chunk, "test");
        assert!(text.contains("Constant 0 '7'"));
        assert!(text.contains("Return"));
    }

    #[test]
    fn jump_targets_are_resolved() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write_u16(2, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Pop, 1);
        let (text, next) = disassemble_instruction(&chunk, 0);
        assert!(text.contains("-> 0005"));
        assert_eq!(next, 3);
    }

    #[test]
    fn repeated_lines_collapse() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 3);
        chunk.write_op(OpCode::Pop, 3);
        let (first, _) = disassemble_instruction(&chunk, 0);
        let (second, _) = disassemble_instruction(&chunk, 1);
        assert!(first.contains("   3 "));
        assert!(second.contains("    | "));
    }
}
