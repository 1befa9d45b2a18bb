// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

use lyra_context::{
    heap::ConditionKind,
    stack::ENV_HEADER_WORDS,
    vm::Vm,
};
use lyra_isa::{decode_b, decode_c, InstructionWord};

use crate::raise_condition;

use super::HandleResult;

pub fn jump(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    // (param target_ip:u32) -> ()
    let target = vm.fetch_word() as usize;
    HandleResult::Jump(target)
}

pub fn branch_false(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    // (param target_ip:u32) (operand test) -> ()
    let target = vm.fetch_word() as usize;
    if vm.val0.is_true() {
        HandleResult::Next
    } else {
        HandleResult::Jump(target)
    }
}

pub fn values(vm: &mut Vm, word: InstructionWord) -> HandleResult {
    // (c: value_count) (operand values...) -> (values)
    let count = decode_c(word) as usize;
    let produced = vm.take_args(count);
    match vm.set_values(&produced) {
        Ok(()) => HandleResult::Next,
        Err(_) => match raise_condition(
            vm,
            ConditionKind::TooManyValues,
            format!("too many values: {}", count),
            vec![],
        ) {
            Ok(value) => {
                vm.val0 = value;
                HandleResult::Next
            }
            Err(signal) => HandleResult::Escape(signal),
        },
    }
}

pub fn receive(vm: &mut Vm, word: InstructionWord) -> HandleResult {
    // (b: required_count, c: rest_flag) -> ()
    //
    // moves the current values into a fresh argument block; usually
    // followed by `local_env` to bind them. a single-value receiver is
    // just an ordinary instruction reading the accumulator, so this
    // handler only serves multi-value binding sites, which check their
    // arity strictly.
    let required = decode_b(word) as usize;
    let has_rest = decode_c(word) == 1;
    let produced = vm.num_vals;

    if produced < required || (!has_rest && produced > required) {
        return match raise_condition(
            vm,
            ConditionKind::Arity,
            format!(
                "received {} values where {}{} expected",
                produced,
                required,
                if has_rest { " or more were" } else { " were" }
            ),
            vec![],
        ) {
            Ok(value) => {
                vm.val0 = value;
                HandleResult::Next
            }
            Err(signal) => HandleResult::Escape(signal),
        };
    }

    vm.check_stack(required + 1 + ENV_HEADER_WORDS);
    for i in 0..required {
        let value = vm.get_result(i);
        vm.push_arg(value);
    }
    if has_rest {
        let mut extras = Vec::new();
        for i in required..produced {
            extras.push(vm.get_result(i));
        }
        let rest = vm.heap.list(&extras);
        vm.push_arg(rest);
    }
    HandleResult::Next
}
