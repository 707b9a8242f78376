// File: src/debug.rs
//
// Bytecode disassembler, backing `ember disassemble <FILE>`. Walks a
// `Chunk` byte by byte the same way `Vm::run`'s dispatch loop does,
// printing each instruction's mnemonic, operand, and originating source
// line. Debug-only tooling, never reached by `run`/`repl`.

use crate::chunk::{Chunk, OpCode};
use crate::value::{ObjFunction, Value};

pub fn disassemble_function(function: &ObjFunction) {
    let label = if function.name.is_empty() { "<script>" } else { function.name.as_ref() };
    println!("== {label} ==");
    disassemble_chunk(&function.chunk);

    for constant in &function.chunk.constants {
        if let Value::Function(nested) = constant {
            println!();
            disassemble_function(nested);
        }
    }
}

fn disassemble_chunk(chunk: &Chunk) {
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{offset:04} ");
    let line = chunk.line_at(offset);
    if offset > 0 && line == chunk.line_at(offset - 1) {
        print!("   | ");
    } else {
        print!("{line:4} ");
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_u8(byte) else {
        println!("Unknown opcode {byte}");
        return offset + 1;
    };

    use OpCode::*;
    match op {
        Constant => constant_instruction("OP_CONSTANT", chunk, offset),
        ConstantLong => constant_long_instruction("OP_CONSTANT_LONG", chunk, offset),
        Nil => simple_instruction("OP_NIL", offset),
        True => simple_instruction("OP_TRUE", offset),
        False => simple_instruction("OP_FALSE", offset),
        Pop => simple_instruction("OP_POP", offset),
        GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset),
        SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset),
        GetGlobal => constant_instruction("OP_GET_GLOBAL", chunk, offset),
        DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", chunk, offset),
        SetGlobal => constant_instruction("OP_SET_GLOBAL", chunk, offset),
        GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset),
        SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset),
        GetProperty => constant_instruction("OP_GET_PROPERTY", chunk, offset),
        SetProperty => constant_instruction("OP_SET_PROPERTY", chunk, offset),
        GetSuper => constant_instruction("OP_GET_SUPER", chunk, offset),
        Equal => simple_instruction("OP_EQUAL", offset),
        Greater => simple_instruction("OP_GREATER", offset),
        Less => simple_instruction("OP_LESS", offset),
        Add => simple_instruction("OP_ADD", offset),
        Subtract => simple_instruction("OP_SUBTRACT", offset),
        Multiply => simple_instruction("OP_MULTIPLY", offset),
        Divide => simple_instruction("OP_DIVIDE", offset),
        Modulo => simple_instruction("OP_MODULO", offset),
        BitwiseAnd => simple_instruction("OP_BITWISE_AND", offset),
        BitwiseOr => simple_instruction("OP_BITWISE_OR", offset),
        BitwiseXor => simple_instruction("OP_BITWISE_XOR", offset),
        BitwiseNot => simple_instruction("OP_BITWISE_NOT", offset),
        BitwiseLShift => simple_instruction("OP_BITWISE_LSHIFT", offset),
        BitwiseRShift => simple_instruction("OP_BITWISE_RSHIFT", offset),
        Not => simple_instruction("OP_NOT", offset),
        Negate => simple_instruction("OP_NEGATE", offset),
        Out => simple_instruction("OP_OUT", offset),
        Jump => jump_instruction("OP_JUMP", 1, chunk, offset),
        JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset),
        Loop => jump_instruction("OP_LOOP", -1, chunk, offset),
        Call => byte_instruction("OP_CALL", chunk, offset),
        Invoke => invoke_instruction("OP_INVOKE", chunk, offset),
        SuperInvoke => invoke_instruction("OP_SUPER_INVOKE", chunk, offset),
        Closure => closure_instruction(chunk, offset),
        CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset),
        Return => simple_instruction("OP_RETURN", offset),
        Class => constant_instruction("OP_CLASS", chunk, offset),
        Inherit => simple_instruction("OP_INHERIT", offset),
        Method => constant_instruction("OP_METHOD", chunk, offset),
        Array => byte_instruction("OP_ARRAY", chunk, offset),
        Dict => byte_instruction("OP_DICT", chunk, offset),
        ObjectGet => simple_instruction("OP_OBJECT_GET", offset),
        ObjectSet => simple_instruction("OP_OBJECT_SET", offset),
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{name}");
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{name:<18} {slot:4}");
    offset + 2
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let hi = chunk.code[offset + 1] as u16;
    let lo = chunk.code[offset + 2] as u16;
    let jump = (hi << 8) | lo;
    let target = offset as i32 + 3 + sign * jump as i32;
    println!("{name:<18} {offset:4} -> {target}");
    offset + 3
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    println!("{name:<18} {index:4} '{}'", chunk.constants[index]);
    offset + 2
}

fn constant_long_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.read_constant_long_index(offset + 1);
    println!("{name:<18} {index:4} '{}'", chunk.constants[index]);
    offset + 3
}

fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    let arg_count = chunk.code[offset + 2];
    println!("{name:<18} ({arg_count} args) {index:4} '{}'", chunk.constants[index]);
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    println!("OP_CLOSURE         {index:4} '{}'", chunk.constants[index]);
    let mut offset = offset + 2;

    if let Value::Function(function) = &chunk.constants[index] {
        for _ in 0..function.upvalue_count {
            let is_local = chunk.code[offset];
            let upvalue_index = chunk.code[offset + 1];
            let kind = if is_local == 1 { "local" } else { "upvalue" };
            println!("{offset:04}      |                     {kind} {upvalue_index}");
            offset += 2;
        }
    }

    offset
}
