// File: src/builtins.rs
//
// Native functions for Ember: `clock`, `time`, `term`, `length`, `prepend`,
// `append`, `head`, `tail`, `rest`, `remove`. Each mirrors the behavior and
// the "SKILL ISSUE: " error voice of the original VM's natives exactly --
// see `lengthNative`/`clockNative`/`termNative`/`arrayPrepend`/`arrayAppend`/
// `arrayHead`/`arrayTail`/`arrayRest`/`dictRemove` in the original `vm.c`.

use std::process::Command;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;

use crate::value::Value;
use crate::vm::Vm;

static PROCESS_START: OnceCell<Instant> = OnceCell::new();

pub fn register_natives(vm: &mut Vm) {
    vm.define_native("clock", clock_native);
    vm.define_native("time", time_native);
    vm.define_native("term", term_native);
    vm.define_native("prepend", prepend_native);
    vm.define_native("append", append_native);
    vm.define_native("head", head_native);
    vm.define_native("tail", tail_native);
    vm.define_native("rest", rest_native);
    vm.define_native("remove", remove_native);
    vm.define_native("length", length_native);
}

/// Seconds elapsed since this process started, the closest portable stand-in
/// for the original's `clock() / CLOCKS_PER_SEC`.
fn clock_native(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let _ = args;
    let start = PROCESS_START.get_or_init(Instant::now);
    Ok(Value::Number(start.elapsed().as_secs_f64()))
}

fn time_native(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| format!("SKILL ISSUE: system clock is before the epoch: {e}"))?;
    Ok(Value::Number(now.as_secs_f64()))
}

fn term_native(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(Value::String(command)) = args.first() else {
        return Err("SKILL ISSUE: term() takes exactly 1 string argument.".to_string());
    };
    if args.len() != 1 {
        return Err("SKILL ISSUE: term() takes exactly 1 string argument.".to_string());
    }

    let status = Command::new("sh").arg("-c").arg(command.as_ref()).status();
    match status {
        Ok(status) => Ok(Value::Number(status.code().unwrap_or(-1) as f64)),
        Err(_) => Ok(Value::Number(-1.0)),
    }
}

fn length_native(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.len() != 1 {
        return Err("SKILL ISSUE: length() takes exactly 1 argument.".to_string());
    }

    match &args[0] {
        Value::String(s) => Ok(Value::Number(s.len() as f64)),
        Value::Array(arr) => Ok(Value::Number(arr.borrow().len() as f64)),
        _ => Err("SKILL ISSUE: Argument to length() must be a string or an array.".to_string()),
    }
}

fn prepend_native(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (Some(Value::Array(array)), Some(value)) = (args.first(), args.get(1)) else {
        return Err(
            "SKILL ISSUE: prepend() takes exactly 2 arguments: array and value.".to_string()
        );
    };
    if args.len() != 2 {
        return Err(
            "SKILL ISSUE: prepend() takes exactly 2 arguments: array and value.".to_string()
        );
    }

    array.borrow_mut().insert(0, value.clone());
    Ok(Value::Nil)
}

fn append_native(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (Some(Value::Array(array)), Some(value)) = (args.first(), args.get(1)) else {
        return Err(
            "SKILL ISSUE: append() takes exactly 2 arguments: array and value.".to_string()
        );
    };
    if args.len() != 2 {
        return Err(
            "SKILL ISSUE: append() takes exactly 2 arguments: array and value.".to_string()
        );
    }

    array.borrow_mut().push(value.clone());
    Ok(Value::Nil)
}

fn head_native(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.len() != 1 {
        return Err("SKILL ISSUE: head() takes exactly 1 argument: array.".to_string());
    }
    let Value::Array(array) = &args[0] else {
        return Err("SKILL ISSUE: head() takes exactly 1 argument: array.".to_string());
    };

    let mut array = array.borrow_mut();
    if array.is_empty() {
        return Err("SKILL ISSUE: head() called on an empty array.".to_string());
    }
    Ok(array.remove(0))
}

fn tail_native(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.len() != 1 {
        return Err("SKILL ISSUE: tail() takes exactly 1 argument: array.".to_string());
    }
    let Value::Array(array) = &args[0] else {
        return Err("SKILL ISSUE: tail() takes exactly 1 argument: array.".to_string());
    };

    let mut array = array.borrow_mut();
    array
        .pop()
        .ok_or_else(|| "SKILL ISSUE: tail() called on an empty array.".to_string())
}

fn rest_native(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.len() != 1 {
        return Err("SKILL ISSUE: rest() takes exactly 1 argument: array.".to_string());
    }
    let Value::Array(array) = &args[0] else {
        return Err("SKILL ISSUE: rest() takes exactly 1 argument: array.".to_string());
    };

    let array = array.borrow();
    if array.is_empty() {
        return Err("SKILL ISSUE: rest() called on an empty array.".to_string());
    }
    let rest: Vec<Value> = array[1..].to_vec();
    Ok(Value::Array(std::rc::Rc::new(std::cell::RefCell::new(rest))))
}

fn remove_native(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (Some(Value::Dict(dict)), Some(Value::String(key))) = (args.first(), args.get(1)) else {
        return Err(
            "SKILL ISSUE: delete() takes exactly 2 arguments: dictionary and key.".to_string()
        );
    };
    if args.len() != 2 {
        return Err(
            "SKILL ISSUE: delete() takes exactly 2 arguments: dictionary and key.".to_string()
        );
    }

    dict.borrow_mut().delete(key);
    Ok(Value::Nil)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Table;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn array_of(values: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(values)))
    }

    #[test]
    fn length_reports_string_byte_length_and_array_len() {
        let mut vm = Vm::new_headless();
        let s = vm.intern("hello");
        assert_eq!(length_native(&mut vm, &[Value::String(s)]), Ok(Value::Number(5.0)));
        assert_eq!(
            length_native(&mut vm, &[array_of(vec![Value::Nil, Value::Nil])]),
            Ok(Value::Number(2.0))
        );
    }

    #[test]
    fn head_shifts_first_element_out() {
        let mut vm = Vm::new_headless();
        let arr = array_of(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]);
        let value = head_native(&mut vm, &[arr.clone()]).unwrap();
        assert_eq!(value, Value::Number(1.0));
        let Value::Array(remaining) = arr else { unreachable!() };
        assert_eq!(*remaining.borrow(), vec![Value::Number(2.0), Value::Number(3.0)]);
    }

    #[test]
    fn tail_pops_last_element() {
        let mut vm = Vm::new_headless();
        let arr = array_of(vec![Value::Number(1.0), Value::Number(2.0)]);
        let value = tail_native(&mut vm, &[arr.clone()]).unwrap();
        assert_eq!(value, Value::Number(2.0));
        let Value::Array(remaining) = arr else { unreachable!() };
        assert_eq!(*remaining.borrow(), vec![Value::Number(1.0)]);
    }

    #[test]
    fn rest_returns_new_array_without_first_element() {
        let mut vm = Vm::new_headless();
        let arr = array_of(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]);
        let value = rest_native(&mut vm, &[arr]).unwrap();
        let Value::Array(rest) = value else { unreachable!() };
        assert_eq!(*rest.borrow(), vec![Value::Number(2.0), Value::Number(3.0)]);
    }

    #[test]
    fn head_on_empty_array_is_an_error() {
        let mut vm = Vm::new_headless();
        assert!(head_native(&mut vm, &[array_of(vec![])]).is_err());
    }

    #[test]
    fn remove_deletes_dict_entry() {
        let mut vm = Vm::new_headless();
        let mut table = Table::new();
        let key = vm.intern("x");
        table.set(Rc::clone(&key), Value::Number(1.0));
        let dict = Value::Dict(Rc::new(RefCell::new(table)));

        let result = remove_native(&mut vm, &[dict.clone(), Value::String(key.clone())]).unwrap();
        assert_eq!(result, Value::Nil);
        let Value::Dict(table) = dict else { unreachable!() };
        assert_eq!(table.borrow().get("x"), None);
    }
}
