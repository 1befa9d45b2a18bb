// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

// binary numeric instructions take the left operand from the stack and
// the right operand from the accumulator. fixnum arithmetic stays exact;
// any flonum operand promotes the operation to flonum.

use lyra_context::{heap::ConditionKind, value::Value, vm::Vm};
use lyra_isa::{decode_c_signed, InstructionWord};

use crate::raise_condition;

use super::HandleResult;

enum NumPair {
    Ints(i64, i64),
    Floats(f64, f64),
}

fn number_pair(left: Value, right: Value) -> Option<NumPair> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(NumPair::Ints(a, b)),
        (Value::Int(a), Value::Float(b)) => Some(NumPair::Floats(a as f64, b)),
        (Value::Float(a), Value::Int(b)) => Some(NumPair::Floats(a, b as f64)),
        (Value::Float(a), Value::Float(b)) => Some(NumPair::Floats(a, b)),
        _ => None,
    }
}

fn not_a_number(vm: &mut Vm, left: Value, right: Value) -> HandleResult {
    let value = if number_pair(left, Value::Int(0)).is_none() {
        left
    } else {
        right
    };
    let rendered = vm.heap.format_value(value);
    match raise_condition(
        vm,
        ConditionKind::WrongType,
        format!("number required, but got {}", rendered),
        vec![value],
    ) {
        Ok(value) => {
            vm.val0 = value;
            HandleResult::Next
        }
        Err(signal) => HandleResult::Escape(signal),
    }
}

fn arith(
    vm: &mut Vm,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> HandleResult {
    let left = vm.take_args(1)[0];
    let right = vm.val0;
    match number_pair(left, right) {
        Some(NumPair::Ints(a, b)) => {
            vm.val0 = Value::Int(int_op(a, b));
            vm.num_vals = 1;
            HandleResult::Next
        }
        Some(NumPair::Floats(a, b)) => {
            vm.val0 = Value::Float(float_op(a, b));
            vm.num_vals = 1;
            HandleResult::Next
        }
        None => not_a_number(vm, left, right),
    }
}

fn compare(vm: &mut Vm, int_op: fn(&i64, &i64) -> bool, float_op: fn(&f64, &f64) -> bool) -> HandleResult {
    let left = vm.take_args(1)[0];
    let right = vm.val0;
    match number_pair(left, right) {
        Some(NumPair::Ints(a, b)) => {
            vm.val0 = Value::bool(int_op(&a, &b));
            vm.num_vals = 1;
            HandleResult::Next
        }
        Some(NumPair::Floats(a, b)) => {
            vm.val0 = Value::bool(float_op(&a, &b));
            vm.num_vals = 1;
            HandleResult::Next
        }
        None => not_a_number(vm, left, right),
    }
}

pub fn num_add(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    arith(vm, i64::wrapping_add, |a, b| a + b)
}

pub fn num_sub(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    arith(vm, i64::wrapping_sub, |a, b| a - b)
}

pub fn num_mul(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    arith(vm, i64::wrapping_mul, |a, b| a * b)
}

pub fn num_div(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    // division leaves the exact world; the result is always a flonum
    let left = vm.take_args(1)[0];
    let right = vm.val0;
    match number_pair(left, right) {
        Some(pair) => {
            let (a, b) = match pair {
                NumPair::Ints(a, b) => (a as f64, b as f64),
                NumPair::Floats(a, b) => (a, b),
            };
            if b == 0.0 {
                return match raise_condition(
                    vm,
                    ConditionKind::Error,
                    "attempt to divide by zero",
                    vec![left, right],
                ) {
                    Ok(value) => {
                        vm.val0 = value;
                        HandleResult::Next
                    }
                    Err(signal) => HandleResult::Escape(signal),
                };
            }
            vm.val0 = Value::Float(a / b);
            vm.num_vals = 1;
            HandleResult::Next
        }
        None => not_a_number(vm, left, right),
    }
}

pub fn num_add_imm(vm: &mut Vm, word: InstructionWord) -> HandleResult {
    // (c: immediate:i16) (operand number) -> number
    let imm = decode_c_signed(word) as i64;
    match vm.val0 {
        Value::Int(a) => {
            vm.val0 = Value::Int(a.wrapping_add(imm));
            vm.num_vals = 1;
            HandleResult::Next
        }
        Value::Float(a) => {
            vm.val0 = Value::Float(a + imm as f64);
            vm.num_vals = 1;
            HandleResult::Next
        }
        other => not_a_number(vm, other, Value::Int(imm)),
    }
}

pub fn num_eq(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    compare(vm, |a, b| a == b, |a, b| a == b)
}

pub fn num_lt(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    compare(vm, |a, b| a < b, |a, b| a < b)
}

pub fn num_le(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    compare(vm, |a, b| a <= b, |a, b| a <= b)
}

pub fn num_gt(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    compare(vm, |a, b| a > b, |a, b| a > b)
}

pub fn num_ge(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    compare(vm, |a, b| a >= b, |a, b| a >= b)
}

pub fn not(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    vm.val0 = Value::bool(!vm.val0.is_true());
    vm.num_vals = 1;
    HandleResult::Next
}

pub fn eq(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    let left = vm.take_args(1)[0];
    vm.val0 = Value::bool(left.eq_value(&vm.val0));
    vm.num_vals = 1;
    HandleResult::Next
}

pub fn eqv(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    let left = vm.take_args(1)[0];
    let right = vm.val0;
    vm.val0 = Value::bool(vm.heap.eqv(left, right));
    vm.num_vals = 1;
    HandleResult::Next
}
