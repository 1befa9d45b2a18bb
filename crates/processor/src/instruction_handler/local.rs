// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

use lyra_context::{
    stack::{EnvPtr, ENV_HEADER_WORDS},
    value::Value,
    vm::Vm,
};
use lyra_isa::{decode_b, decode_c, InstructionWord};

use super::HandleResult;

pub fn local_ref(vm: &mut Vm, word: InstructionWord) -> HandleResult {
    // (b: depth, c: index) -> value
    vm.val0 = vm.env_ref(decode_b(word) as usize, decode_c(word) as usize);
    vm.num_vals = 1;
    HandleResult::Next
}

pub fn local_ref_push(vm: &mut Vm, word: InstructionWord) -> HandleResult {
    let value = vm.env_ref(decode_b(word) as usize, decode_c(word) as usize);
    vm.check_stack(1);
    vm.push_arg(value);
    vm.val0 = value;
    vm.num_vals = 1;
    HandleResult::Next
}

pub fn local_set(vm: &mut Vm, word: InstructionWord) -> HandleResult {
    // (b: depth, c: index) (operand value) -> #<unspecified>
    let value = vm.val0;
    vm.env_set(decode_b(word) as usize, decode_c(word) as usize, value);
    vm.val0 = Value::Unspecified;
    vm.num_vals = 1;
    HandleResult::Next
}

pub fn local_env(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    // (c: binding_count) -> ()
    //
    // the binding count always equals the current argument block; the
    // operand documents the compiler's intent.
    vm.check_stack(ENV_HEADER_WORDS);
    let up = vm.env;
    vm.finish_env(Value::False, up);
    HandleResult::Next
}

pub fn pop_local_env(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    vm.env = match vm.env {
        EnvPtr::Null => panic!("No environment frame to discard."),
        EnvPtr::Stack(h) => vm.stack.env_up(h),
        EnvPtr::Heap(obj_ref) => vm.heap.env_frame(obj_ref).up,
    };
    HandleResult::Next
}
