// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

use lyra_context::{heap::ConditionKind, value::Value, vm::Vm};
use lyra_isa::{decode_c, InstructionWord};

use crate::raise_condition;

use super::HandleResult;

fn wrong_type(vm: &mut Vm, expected: &str, value: Value) -> HandleResult {
    let rendered = vm.heap.format_value(value);
    match raise_condition(
        vm,
        ConditionKind::WrongType,
        format!("{} required, but got {}", expected, rendered),
        vec![value],
    ) {
        Ok(value) => {
            vm.val0 = value;
            HandleResult::Next
        }
        Err(signal) => HandleResult::Escape(signal),
    }
}

pub fn cons(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    // (operand obj, obj) -> pair
    let left = vm.take_args(1)[0];
    let right = vm.val0;
    vm.val0 = vm.heap.cons(left, right);
    vm.num_vals = 1;
    HandleResult::Next
}

pub fn car(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    match vm.heap.car(vm.val0) {
        Some(value) => {
            vm.val0 = value;
            vm.num_vals = 1;
            HandleResult::Next
        }
        None => wrong_type(vm, "pair", vm.val0),
    }
}

pub fn cdr(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    match vm.heap.cdr(vm.val0) {
        Some(value) => {
            vm.val0 = value;
            vm.num_vals = 1;
            HandleResult::Next
        }
        None => wrong_type(vm, "pair", vm.val0),
    }
}

pub fn list(vm: &mut Vm, word: InstructionWord) -> HandleResult {
    // (c: element_count) (operand elements...) -> list
    let count = decode_c(word) as usize;
    let elements = vm.take_args(count);
    vm.val0 = vm.heap.list(&elements);
    vm.num_vals = 1;
    HandleResult::Next
}

pub fn null_p(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    vm.val0 = Value::bool(matches!(vm.val0, Value::Nil));
    vm.num_vals = 1;
    HandleResult::Next
}

pub fn pair_p(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    vm.val0 = Value::bool(vm.heap.is_pair(vm.val0));
    vm.num_vals = 1;
    HandleResult::Next
}
