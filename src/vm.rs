// File: src/vm.rs
//
// Stack-based bytecode interpreter for Ember. Owns the value stack, the
// call-frame array, the open-upvalue list, the global-variable table, and
// the string interner the compiler consumes while compiling. There is no
// garbage collector: everything heap-shaped is `Rc`/`Rc<RefCell<_>>` and is
// freed the moment its last reference drops.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use crate::builtins;
use crate::chunk::OpCode;
use crate::compiler;
use crate::errors::{self, Frame};
use crate::module;
use crate::table::{StringInterner, Table};
use crate::value::{
    BoundMethod, Closure, NativeFn, NativeImpl, ObjClass, ObjFunction, ObjInstance, Upvalue, Value,
};

const STACK_INITIAL_CAPACITY: usize = 256;
const FRAMES_INITIAL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    /// Index into `Vm::stack` where this frame's slot window begins. Slot 0
    /// of the frame is the callee itself (or `this` for a bound method).
    slot_base: usize,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Open upvalues, kept sorted by descending stack index so the first
    /// entry whose index is `<=` a given slot is the one to reuse or split
    /// at, mirroring the original's descending-address linked list without
    /// needing raw pointers.
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    strings: StringInterner,
    init_string: Rc<str>,
    out: Box<dyn Write>,
    err: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_writers(Box::new(io::stdout()), Box::new(io::stderr()))
    }

    /// Used by tests that want to assert exact program output without it
    /// landing on the process's real stdout. Diagnostics still go to the
    /// real stderr; use `with_writers` to capture those too.
    pub fn with_writer(writer: Box<dyn Write>) -> Self {
        Self::with_writers(writer, Box::new(io::stderr()))
    }

    /// Used by tests that want to assert exact program output and/or exact
    /// diagnostic text without either landing on the process's real stdout
    /// or stderr.
    pub fn with_writers(writer: Box<dyn Write>, err_writer: Box<dyn Write>) -> Self {
        let mut vm = Vm {
            stack: Vec::with_capacity(STACK_INITIAL_CAPACITY),
            frames: Vec::with_capacity(FRAMES_INITIAL_CAPACITY),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            strings: StringInterner::new(),
            init_string: Rc::from("init"),
            out: writer,
            err: err_writer,
        };
        builtins::register_natives(&mut vm);
        vm
    }

    /// A `Vm` used only to drive compilation (string interning, nested
    /// imports) in contexts that never execute bytecode, such as
    /// `compiler.rs`'s own unit tests. Output is discarded.
    pub fn new_headless() -> Self {
        Self::with_writers(Box::new(io::sink()), Box::new(io::sink()))
    }

    pub fn intern(&mut self, text: &str) -> Rc<str> {
        self.strings.intern(text)
    }

    pub fn define_native(&mut self, name: &'static str, function: NativeImpl) {
        let key = self.intern(name);
        self.globals.set(key, Value::NativeFn(Rc::new(NativeFn { name, function })));
    }

    pub fn write_out(&mut self, text: &str) {
        let _ = writeln!(self.out, "{text}");
    }

    /// Formats and writes one compile-error diagnostic through this VM's
    /// error sink. Called by the compiler, which owns the line/location/
    /// message but not the sink itself.
    pub fn report_compile_error(&mut self, line: u32, location: errors::ErrorLocation, message: &str) {
        errors::write_compile_error(&mut self.err, line, location, message);
    }

    // ---- top level ----------------------------------------------------

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let Some(function) = compiler::compile(source, self) else {
            return InterpretResult::CompileError;
        };
        let closure = Rc::new(Closure { function, upvalues: Vec::new() });
        self.stack.push(Value::Closure(Rc::clone(&closure)));
        self.frames.push(CallFrame { closure, ip: 0, slot_base: 0 });
        self.run()
    }

    /// Drives `import NAME;`: resolve, read, normalize, and synchronously
    /// compile-and-run the imported source against this same `Vm` (so its
    /// top-level declarations land in the shared globals table), exactly as
    /// the original interpreter's compile-time import does. A failure here
    /// exits the whole process, matching `loadFile`/`parseImport`.
    pub fn run_import(&mut self, name: &str) {
        let path = match module::resolve(name) {
            Some(path) => path,
            None => {
                eprintln!("Failed to open file: {name}.mbr");
                return;
            }
        };
        let source = match module::read_normalized(&path) {
            Ok(source) => source,
            Err(err) => {
                eprintln!("Failed to open file: {} ({err})", path.display());
                return;
            }
        };
        match self.interpret(&source) {
            InterpretResult::Ok => {}
            InterpretResult::CompileError => std::process::exit(65),
            InterpretResult::RuntimeError => std::process::exit(70),
        }
    }

    // ---- stack helpers --------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> &Value {
        let index = self.stack.len() - 1 - distance;
        &self.stack[index]
    }

    fn runtime_error(&mut self, message: &str) -> InterpretResult {
        let full = format!("SKILL ISSUE: {message}");

        let mut frames = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let line = frame.closure.function.chunk.line_at(frame.ip.saturating_sub(1));
            let name = if frame.closure.function.name.is_empty() {
                "script".to_string()
            } else {
                frame.closure.function.name.to_string()
            };
            frames.push(Frame { line, name });
        }
        errors::report_runtime_error(&full, &frames);

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        InterpretResult::RuntimeError
    }

    // ---- calling convention --------------------------------------------

    fn call(&mut self, closure: Rc<Closure>, arg_count: u8) -> Result<(), String> {
        if arg_count != closure.function.arity {
            return Err(format!(
                "Expected {} arguments but got {}.",
                closure.function.arity, arg_count
            ));
        }
        if self.frames.len() == FRAMES_INITIAL_CAPACITY * 4 {
            return Err("Stack overflow.".to_string());
        }
        let slot_base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame { closure, ip: 0, slot_base });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), String> {
        match callee {
            Value::Closure(closure) => self.call(closure, arg_count),
            Value::NativeFn(native) => {
                let args_start = self.stack.len() - arg_count as usize;
                let args: Vec<Value> = self.stack[args_start..].to_vec();
                let result = (native.function)(self, &args)?;
                self.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            Value::Class(class) => {
                let instance = Value::Instance(Rc::new(RefCell::new(ObjInstance {
                    class_name: class.borrow().name.clone(),
                    class: Rc::clone(&class),
                    fields: Table::new(),
                })));
                let receiver_slot = self.stack.len() - arg_count as usize - 1;
                self.stack[receiver_slot] = instance;

                let initializer = class.borrow().methods.get(&self.init_string);
                if let Some(Value::Closure(init)) = initializer {
                    self.call(init, arg_count)
                } else if arg_count != 0 {
                    Err(format!("Expected 0 arguments but got {arg_count}."))
                } else {
                    Ok(())
                }
            }
            Value::BoundMethod(bound) => {
                let receiver_slot = self.stack.len() - arg_count as usize - 1;
                self.stack[receiver_slot] = bound.receiver.clone();
                self.call(Rc::clone(&bound.method), arg_count)
            }
            _ => Err("Can only call functions and classes.".to_string()),
        }
    }

    fn invoke_from_class(&mut self, class: &Rc<RefCell<ObjClass>>, name: &str, arg_count: u8) -> Result<(), String> {
        match class.borrow().methods.get(name) {
            Some(Value::Closure(method)) => self.call(method, arg_count),
            Some(_) | None => Err(format!("Undefined property '{name}'.")),
        }
    }

    fn invoke(&mut self, name: &str, arg_count: u8) -> Result<(), String> {
        let receiver = self.peek(arg_count as usize).clone();
        let Value::Instance(instance) = receiver else {
            return Err("Only instances have methods.".to_string());
        };

        if let Some(field) = instance.borrow().fields.get(name) {
            let slot = self.stack.len() - arg_count as usize - 1;
            self.stack[slot] = field.clone();
            return self.call_value(field, arg_count);
        }

        let class = Rc::clone(&instance.borrow().class);
        self.invoke_from_class(&class, name, arg_count)
    }

    fn bind_method(&mut self, class: &Rc<RefCell<ObjClass>>, name: &str) -> Result<(), String> {
        match class.borrow().methods.get(name) {
            Some(Value::Closure(method)) => {
                let receiver = self.pop();
                self.push(Value::BoundMethod(Rc::new(BoundMethod { receiver, method })));
                Ok(())
            }
            _ => Err(format!("Undefined property '{name}'.")),
        }
    }

    // ---- upvalues -------------------------------------------------------

    fn capture_upvalue(&mut self, stack_index: usize) -> Rc<RefCell<Upvalue>> {
        if let Some(existing) = self.open_upvalues.iter().find(|up| match &*up.borrow() {
            Upvalue::Open(index) => *index == stack_index,
            _ => false,
        }) {
            return Rc::clone(existing);
        }
        let created = Rc::new(RefCell::new(Upvalue::Open(stack_index)));
        let position = self
            .open_upvalues
            .iter()
            .position(|up| match &*up.borrow() {
                Upvalue::Open(index) => *index < stack_index,
                _ => false,
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(position, Rc::clone(&created));
        created
    }

    fn close_upvalues(&mut self, from: usize) {
        let mut remaining = Vec::with_capacity(self.open_upvalues.len());
        for upvalue in self.open_upvalues.drain(..) {
            let should_close = matches!(&*upvalue.borrow(), Upvalue::Open(index) if *index >= from);
            if should_close {
                let index = match &*upvalue.borrow() {
                    Upvalue::Open(index) => *index,
                    Upvalue::Closed(_) => unreachable!(),
                };
                let value = self.stack[index].clone();
                *upvalue.borrow_mut() = Upvalue::Closed(value);
            } else {
                remaining.push(upvalue);
            }
        }
        self.open_upvalues = remaining;
    }

    fn read_upvalue(&self, upvalue: &Rc<RefCell<Upvalue>>) -> Value {
        match &*upvalue.borrow() {
            Upvalue::Open(index) => self.stack[*index].clone(),
            Upvalue::Closed(value) => value.clone(),
        }
    }

    fn write_upvalue(&mut self, upvalue: &Rc<RefCell<Upvalue>>, value: Value) {
        let index = match &*upvalue.borrow() {
            Upvalue::Open(index) => Some(*index),
            Upvalue::Closed(_) => None,
        };
        match index {
            Some(index) => self.stack[index] = value,
            None => *upvalue.borrow_mut() = Upvalue::Closed(value),
        }
    }

    // ---- the dispatch loop ------------------------------------------------

    fn run(&mut self) -> InterpretResult {
        loop {
            let instruction = self.read_byte();
            let Some(op) = OpCode::from_u8(instruction) else {
                return self.runtime_error("Invalid instruction.");
            };

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::ConstantLong => {
                    let value = self.read_constant_long();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slot_base;
                    self.push(self.stack[base + slot].clone());
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slot_base;
                    self.stack[base + slot] = self.peek(0).clone();
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant();
                    match self.globals.get(&name) {
                        Some(value) => self.push(value),
                        None => return self.runtime_error(&format!("Undefined variable '{name}'.")),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant_rc();
                    let value = self.pop();
                    self.globals.set(name, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant_rc();
                    let value = self.peek(0).clone();
                    if self.globals.set(Rc::clone(&name), value) {
                        self.globals.delete(&name);
                        return self.runtime_error(&format!("Undefined variable '{name}'."));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = Rc::clone(&self.current_frame().closure.upvalues[slot]);
                    self.push(self.read_upvalue(&upvalue));
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = Rc::clone(&self.current_frame().closure.upvalues[slot]);
                    let value = self.peek(0).clone();
                    self.write_upvalue(&upvalue, value);
                }
                OpCode::GetProperty => {
                    let name = self.read_string_constant();
                    match self.peek(0).clone() {
                        Value::Instance(instance) => {
                            if let Some(value) = instance.borrow().fields.get(&name) {
                                self.pop();
                                self.push(value);
                            } else {
                                let class = Rc::clone(&instance.borrow().class);
                                if let Err(message) = self.bind_method(&class, &name) {
                                    return self.runtime_error(&message);
                                }
                            }
                        }
                        Value::Dict(dict) => {
                            let value = dict.borrow().get(&name).unwrap_or(Value::Nil);
                            self.pop();
                            self.push(value);
                        }
                        _ => return self.runtime_error("Only instances and dictionaries have properties."),
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string_constant_rc();
                    match self.peek(1).clone() {
                        Value::Instance(instance) => {
                            let value = self.peek(0).clone();
                            instance.borrow_mut().fields.set(name, value.clone());
                            self.pop();
                            self.pop();
                            self.push(value);
                        }
                        Value::Dict(dict) => {
                            let value = self.peek(0).clone();
                            dict.borrow_mut().set(name, value.clone());
                            self.pop();
                            self.pop();
                            self.push(value);
                        }
                        _ => return self.runtime_error("Only instances and dictionaries have fields."),
                    }
                }
                OpCode::GetSuper => {
                    let name = self.read_string_constant();
                    let Value::Class(superclass) = self.pop() else {
                        return self.runtime_error("Superclass must be a class.");
                    };
                    if let Err(message) = self.bind_method(&superclass, &name) {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => {
                    if let Err(message) = self.numeric_binary(|a, b| Value::Bool(a > b)) {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::Less => {
                    if let Err(message) = self.numeric_binary(|a, b| Value::Bool(a < b)) {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::Add => {
                    if let Err(message) = self.add() {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::Subtract => {
                    if let Err(message) = self.numeric_binary(|a, b| Value::Number(a - b)) {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::Multiply => {
                    if let Err(message) = self.numeric_binary(|a, b| Value::Number(a * b)) {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::Divide => {
                    if let Err(message) = self.numeric_binary(|a, b| Value::Number(a / b)) {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::Modulo => {
                    if let Err(message) = self.modulo() {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::BitwiseAnd => {
                    if let Err(message) = self.bitwise_binary(|a, b| a & b) {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::BitwiseOr => {
                    if let Err(message) = self.bitwise_binary(|a, b| a | b) {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::BitwiseXor => {
                    if let Err(message) = self.bitwise_binary(|a, b| a ^ b) {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::BitwiseLShift => {
                    if let Err(message) = self.bitwise_binary(|a, b| a << (b & 31)) {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::BitwiseRShift => {
                    if let Err(message) = self.bitwise_binary(|a, b| a >> (b & 31)) {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::BitwiseNot => {
                    let Value::Number(n) = self.pop() else {
                        return self.runtime_error("Operand must be a number.");
                    };
                    self.push(Value::Number(!(n as i32) as f64));
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return self.runtime_error("Operand must be a number.");
                    };
                    let n = *n;
                    self.pop();
                    self.push(Value::Number(-n));
                }
                OpCode::Out => {
                    let value = self.pop();
                    let text = value.to_string();
                    self.write_out(&text);
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.current_frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip -= offset as usize;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize).clone();
                    if let Err(message) = self.call_value(callee, arg_count) {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte();
                    if let Err(message) = self.invoke(&name, arg_count) {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte();
                    let Value::Class(superclass) = self.pop() else {
                        return self.runtime_error("Superclass must be a class.");
                    };
                    if let Err(message) = self.invoke_from_class(&superclass, &name, arg_count) {
                        return self.runtime_error(&message);
                    }
                }
                OpCode::Closure => {
                    let value = self.read_constant();
                    let Value::Function(function) = value else {
                        return self.runtime_error("Expected function constant.");
                    };
                    let mut upvalues = Vec::with_capacity(function.upvalue_count);
                    for _ in 0..function.upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.current_frame().slot_base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            upvalues.push(Rc::clone(&self.current_frame().closure.upvalues[index]));
                        }
                    }
                    self.push(Value::Closure(Rc::new(Closure { function, upvalues })));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.slot_base);
                    if self.frames.is_empty() {
                        self.pop();
                        return InterpretResult::Ok;
                    }
                    if let Some(return_type) = frame.closure.function.return_type {
                        if !Self::check_return_type(return_type, &result) {
                            return self.runtime_error("Invalid return type.");
                        }
                    }
                    self.stack.truncate(frame.slot_base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string_constant_rc();
                    self.push(Value::Class(Rc::new(RefCell::new(ObjClass { name, methods: Table::new() }))));
                }
                OpCode::Inherit => {
                    let Value::Class(superclass) = self.peek(1).clone() else {
                        return self.runtime_error("Superclass must be a class.");
                    };
                    let Value::Class(subclass) = self.peek(0).clone() else {
                        return self.runtime_error("Superclass must be a class.");
                    };
                    let methods = superclass.borrow().methods.iter().map(|(k, v)| (Rc::clone(k), v.clone())).collect::<Vec<_>>();
                    for (key, value) in methods {
                        subclass.borrow_mut().methods.set(key, value);
                    }
                    self.pop(); // subclass duplicate
                }
                OpCode::Method => {
                    let name = self.read_string_constant_rc();
                    let method = self.pop();
                    let Value::Class(class) = self.peek(0).clone() else {
                        return self.runtime_error("Only classes can have methods.");
                    };
                    class.borrow_mut().methods.set(name, method);
                }
                OpCode::Array => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    let elements: Vec<Value> = self.stack.drain(start..).collect();
                    self.push(Value::Array(Rc::new(RefCell::new(elements))));
                }
                OpCode::Dict => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count * 2;
                    let pairs: Vec<Value> = self.stack.drain(start..).collect();
                    let mut table = Table::new();
                    // Entries were pushed in parse order; pop value-then-key from the
                    // top down (last pair first) so an earlier duplicate key's entry
                    // is the one written last, and therefore the one that survives.
                    for chunk in pairs.chunks_exact(2).rev() {
                        let Value::String(key) = &chunk[0] else {
                            return self.runtime_error("Dictionary keys must be strings.");
                        };
                        table.set(Rc::clone(key), chunk[1].clone());
                    }
                    self.push(Value::Dict(Rc::new(RefCell::new(table))));
                }
                OpCode::ObjectGet => {
                    let index = self.pop();
                    let object = self.pop();
                    match self.object_get(&object, &index) {
                        Ok(value) => self.push(value),
                        Err(message) => return self.runtime_error(&message),
                    }
                }
                OpCode::ObjectSet => {
                    let value = self.pop();
                    let index = self.pop();
                    let object = self.pop();
                    match self.object_set(&object, &index, value) {
                        Ok(()) => self.push(Value::Nil),
                        Err(message) => return self.runtime_error(&message),
                    }
                }
            }
        }
    }

    fn object_get(&self, object: &Value, index: &Value) -> Result<Value, String> {
        match object {
            Value::Array(array) => {
                let Value::Number(n) = index else {
                    return Err("Array access requires a number.".to_string());
                };
                let array = array.borrow();
                let idx = *n as i64;
                if idx < 0 || idx as usize >= array.len() {
                    return Err("Array index out of bounds.".to_string());
                }
                Ok(array[idx as usize].clone())
            }
            Value::Dict(dict) => {
                let Value::String(key) = index else {
                    return Err("Dictionary keys must be strings.".to_string());
                };
                Ok(dict.borrow().get(key).unwrap_or(Value::Nil))
            }
            _ => Err("Only arrays and dictionaries support get set operations.".to_string()),
        }
    }

    fn object_set(&self, object: &Value, index: &Value, value: Value) -> Result<(), String> {
        match object {
            Value::Array(array) => {
                let Value::Number(n) = index else {
                    return Err("Array access requires a number.".to_string());
                };
                let mut array = array.borrow_mut();
                let idx = *n as i64;
                if idx < 0 || idx as usize >= array.len() {
                    return Err("Array index out of bounds.".to_string());
                }
                array[idx as usize] = value;
                Ok(())
            }
            Value::Dict(dict) => {
                let Value::String(key) = index else {
                    return Err("Dictionary keys must be strings.".to_string());
                };
                dict.borrow_mut().set(Rc::clone(key), value);
                Ok(())
            }
            _ => Err("Only arrays and dictionaries support set operations.".to_string()),
        }
    }

    fn numeric_binary(&mut self, op: impl Fn(f64, f64) -> Value) -> Result<(), String> {
        let (Value::Number(b), Value::Number(a)) = (self.peek(0).clone(), self.peek(1).clone()) else {
            return Err("Operands must be numbers.".to_string());
        };
        self.pop();
        self.pop();
        self.push(op(a, b));
        Ok(())
    }

    fn modulo(&mut self) -> Result<(), String> {
        let (Value::Number(b), Value::Number(a)) = (self.peek(0).clone(), self.peek(1).clone()) else {
            return Err("Operands must be numbers.".to_string());
        };
        if b == 0.0 {
            return Err("Division by zero.".to_string());
        }
        self.pop();
        self.pop();
        self.push(Value::Number(a % b));
        Ok(())
    }

    fn bitwise_binary(&mut self, op: impl Fn(i32, i32) -> i32) -> Result<(), String> {
        let (Value::Number(b), Value::Number(a)) = (self.peek(0).clone(), self.peek(1).clone()) else {
            return Err("Operands must be numbers.".to_string());
        };
        self.pop();
        self.pop();
        self.push(Value::Number(op(a as i32, b as i32) as f64));
        Ok(())
    }

    /// Authoritative dynamic return-type check run at `OP_RETURN`, mirroring
    /// `checkReturnType` in the original VM. The compiler's own check (see
    /// `compiler.rs`) is a shallow, best-effort static approximation; this
    /// is the one testable behavior per spec.md §9.
    fn check_return_type(return_type: crate::value::ReturnType, value: &Value) -> bool {
        use crate::value::ReturnType;
        match return_type {
            ReturnType::Void => matches!(value, Value::Nil),
            ReturnType::Int | ReturnType::Float => matches!(value, Value::Number(_)),
            ReturnType::Str => matches!(value, Value::String(_)),
            ReturnType::Bool => matches!(value, Value::Bool(_)),
        }
    }

    fn add(&mut self) -> Result<(), String> {
        match (self.peek(0).clone(), self.peek(1).clone()) {
            (Value::Number(b), Value::Number(a)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
                Ok(())
            }
            (Value::String(b), Value::String(a)) => {
                self.pop();
                self.pop();
                let concatenated = format!("{a}{b}");
                let interned = self.intern(&concatenated);
                self.push(Value::String(interned));
                Ok(())
            }
            _ => Err("Operands must be two numbers or two strings.".to_string()),
        }
    }

    // ---- frame/bytecode reading ------------------------------------------

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.current_frame_mut();
        let byte = frame.closure.function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        ((hi as u16) << 8) | lo as u16
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.current_frame().closure.function.chunk.constants[index].clone()
    }

    fn read_constant_long(&mut self) -> Value {
        let frame = self.current_frame();
        let index = frame.closure.function.chunk.read_constant_long_index(frame.ip);
        self.current_frame_mut().ip += 2;
        self.current_frame().closure.function.chunk.constants[index].clone()
    }

    fn read_string_constant(&mut self) -> Rc<str> {
        match self.read_constant() {
            Value::String(s) => s,
            _ => unreachable!("identifier constant must be a string"),
        }
    }

    fn read_string_constant_rc(&mut self) -> Rc<str> {
        self.read_string_constant()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_and_capture(source: &str) -> String {
        let buffer: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        struct SharedWriter(Rc<RefCell<Vec<u8>>>);
        impl Write for SharedWriter {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.borrow_mut().write(buf)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut vm = Vm::with_writer(Box::new(SharedWriter(Rc::clone(&buffer))));
        let result = vm.interpret(source);
        assert_eq!(result, InterpretResult::Ok, "program should run to completion");
        let bytes = buffer.borrow().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn runs_arithmetic_and_prints() {
        assert_eq!(run_and_capture("out 1 + 2 * 3;"), "7\n");
    }

    #[test]
    fn closures_capture_by_reference() {
        let source = r#"
            fn makeCounter() {
                var count = 0;
                fn counter() {
                    count = count + 1;
                    return count;
                }
                return counter;
            }
            var c = makeCounter();
            out c();
            out c();
        "#;
        assert_eq!(run_and_capture(source), "1\n2\n");
    }

    #[test]
    fn classes_and_inheritance() {
        let source = r#"
            class Animal {
                speak() {
                    return "...";
                }
            }
            class Dog < Animal {
                speak() {
                    return "Woof";
                }
            }
            var d = Dog();
            out d.speak();
        "#;
        assert_eq!(run_and_capture(source), "Woof\n");
    }

    #[test]
    fn bitwise_and_truncates_to_i32() {
        assert_eq!(run_and_capture("out 6 & 3;"), "2\n");
    }

    #[test]
    fn string_concatenation_via_add() {
        assert_eq!(run_and_capture(r#"out "foo" + "bar";"#), "foobar\n");
    }

    #[test]
    fn undefined_variable_is_a_runtime_error() {
        let mut vm = Vm::new_headless();
        let result = vm.interpret("out undefinedThing;");
        assert_eq!(result, InterpretResult::RuntimeError);
    }
}
