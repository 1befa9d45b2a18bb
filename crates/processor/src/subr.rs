// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

// the core primitive procedures, bound into the base module.

use lyra_context::{
    heap::{ConditionKind, HeapObj, Subr},
    value::Value,
    vm::{SubrFn, Vm},
    VmResult,
};

use crate::{
    control::{
        cont::{call_cc, call_pc},
        dynwind::dynamic_wind,
        exception::{throw_exception, with_error_handler, with_exception_handler},
    },
    raise_condition,
};

pub fn make_subr(
    vm: &mut Vm,
    name: &str,
    required: u16,
    optional: bool,
    func: SubrFn,
    data: Value,
) -> Value {
    Value::Obj(vm.heap.alloc(HeapObj::Subr(Subr {
        name: name.to_owned(),
        func,
        required,
        optional,
        data,
    })))
}

fn define_subr(vm: &mut Vm, name: &str, required: u16, optional: bool, func: SubrFn) {
    let subr = make_subr(vm, name, required, optional, func, Value::False);
    let symbol = vm.heap.intern(name);
    vm.define_global(0, symbol, subr);
}

pub fn install_core_subrs(vm: &mut Vm) {
    define_subr(vm, "call/cc", 1, false, callcc_subr);
    define_subr(vm, "call-with-current-continuation", 1, false, callcc_subr);
    define_subr(vm, "call/pc", 1, false, callpc_subr);
    define_subr(vm, "dynamic-wind", 3, false, dynamic_wind_subr);
    define_subr(vm, "with-error-handler", 2, false, with_error_handler_subr);
    define_subr(vm, "with-guard-handler", 2, false, with_guard_handler_subr);
    define_subr(
        vm,
        "with-exception-handler",
        2,
        false,
        with_exception_handler_subr,
    );
    define_subr(vm, "raise", 1, false, raise_subr);
    define_subr(vm, "values", 0, true, values_subr);
    define_subr(vm, "error", 1, true, error_subr);
    define_subr(vm, "cons", 2, false, cons_subr);
    define_subr(vm, "car", 1, false, car_subr);
    define_subr(vm, "cdr", 1, false, cdr_subr);
    define_subr(vm, "list", 0, true, list_subr);
}

fn callcc_subr(vm: &mut Vm, args: &[Value], _data: Value) -> VmResult<Value> {
    call_cc(vm, args[0])
}

fn callpc_subr(vm: &mut Vm, args: &[Value], _data: Value) -> VmResult<Value> {
    call_pc(vm, args[0])
}

fn dynamic_wind_subr(vm: &mut Vm, args: &[Value], _data: Value) -> VmResult<Value> {
    dynamic_wind(vm, args[0], args[1], args[2])
}

fn with_error_handler_subr(vm: &mut Vm, args: &[Value], _data: Value) -> VmResult<Value> {
    with_error_handler(vm, args[0], args[1], false)
}

fn with_guard_handler_subr(vm: &mut Vm, args: &[Value], _data: Value) -> VmResult<Value> {
    // the guard form rewinds the dynamic handlers before running the
    // handler body
    with_error_handler(vm, args[0], args[1], true)
}

fn with_exception_handler_subr(vm: &mut Vm, args: &[Value], _data: Value) -> VmResult<Value> {
    with_exception_handler(vm, args[0], args[1])
}

fn raise_subr(vm: &mut Vm, args: &[Value], _data: Value) -> VmResult<Value> {
    throw_exception(vm, args[0])
}

fn values_subr(vm: &mut Vm, args: &[Value], _data: Value) -> VmResult<Value> {
    let values = match vm.heap.list_to_vec(args[0]) {
        Ok(values) => values,
        Err(_) => unreachable!("The argument folder builds proper lists."),
    };
    match vm.set_values(&values) {
        Ok(()) => Ok(vm.val0),
        Err(_) => raise_condition(
            vm,
            ConditionKind::TooManyValues,
            format!("too many values: {}", values.len()),
            vec![],
        ),
    }
}

fn error_subr(vm: &mut Vm, args: &[Value], _data: Value) -> VmResult<Value> {
    let message = match args[0].as_obj().map(|r| vm.heap.get(r)) {
        Some(HeapObj::String(text)) => text.clone(),
        _ => vm.heap.format_value(args[0]),
    };
    let irritants = vm
        .heap
        .list_to_vec(args[1])
        .unwrap_or_default();
    raise_condition(vm, ConditionKind::Error, message, irritants)
}

fn cons_subr(vm: &mut Vm, args: &[Value], _data: Value) -> VmResult<Value> {
    Ok(vm.heap.cons(args[0], args[1]))
}

fn car_subr(vm: &mut Vm, args: &[Value], _data: Value) -> VmResult<Value> {
    match vm.heap.car(args[0]) {
        Some(value) => Ok(value),
        None => {
            let rendered = vm.heap.format_value(args[0]);
            raise_condition(
                vm,
                ConditionKind::WrongType,
                format!("pair required, but got {}", rendered),
                vec![args[0]],
            )
        }
    }
}

fn cdr_subr(vm: &mut Vm, args: &[Value], _data: Value) -> VmResult<Value> {
    match vm.heap.cdr(args[0]) {
        Some(value) => Ok(value),
        None => {
            let rendered = vm.heap.format_value(args[0]);
            raise_condition(
                vm,
                ConditionKind::WrongType,
                format!("pair required, but got {}", rendered),
                vec![args[0]],
            )
        }
    }
}

fn list_subr(_vm: &mut Vm, args: &[Value], _data: Value) -> VmResult<Value> {
    // the argument folder already built the list
    Ok(args[0])
}
