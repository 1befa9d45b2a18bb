// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

pub mod attention;
pub mod control;
pub mod instruction_handler;
pub mod machine;
pub mod process;
pub mod subr;

use lyra_context::{
    heap::ConditionKind,
    value::Value,
    vm::Vm,
    VmResult,
};

/// construct a condition and raise it through the exception protocol.
/// returns `Ok` only when a user exception handler continued a
/// continuable condition; serious conditions always escape.
pub fn raise_condition(
    vm: &mut Vm,
    kind: ConditionKind,
    message: impl Into<String>,
    irritants: Vec<Value>,
) -> VmResult<Value> {
    let condition = vm.heap.alloc_condition(kind, message, irritants);
    control::exception::throw_exception(vm, condition)
}

/// "wrong number of arguments" report. the original carries a disabled
/// auto-currying branch here; arity mismatch is always an error.
pub fn wna(vm: &mut Vm, proc: Value, required: u16, given: usize) -> VmResult<Value> {
    let rendered = vm.heap.format_value(proc);
    raise_condition(
        vm,
        ConditionKind::Arity,
        format!(
            "wrong number of arguments for {} (required {}, got {})",
            rendered, required, given
        ),
        vec![proc],
    )
}
