// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

use lyra_context::{
    heap::{ConditionKind, HeapObj, ObjRef},
    value::Value,
    vm::Vm,
    VmResult,
};
use lyra_isa::InstructionWord;

use crate::{process::apply_rec, raise_condition};

use super::HandleResult;

/// resolve the global slot to a binding object, memoizing the result in
/// the slot, and triggering an autoload if the binding holds an
/// autoload marker.
fn resolve_global(vm: &mut Vm, slot_index: usize) -> VmResult<ObjRef> {
    let code_ref = vm.pc.code;
    let (cached, name, module) = {
        let code = vm.heap.code(code_ref);
        let slot = &code.globals[slot_index];
        (slot.cached, slot.name, code.module)
    };

    let binding_ref = match cached {
        Some(binding_ref) => binding_ref,
        None => match vm.lookup_global(module, name) {
            Some(binding_ref) => {
                vm.heap.code_mut(code_ref).globals[slot_index].cached = Some(binding_ref);
                binding_ref
            }
            None => {
                unbound_error(vm, name, module)?;
                unreachable!("Unbound-variable conditions do not continue.");
            }
        },
    };

    // autoload marker: run the loader thunk once, then look again
    let autoload = match vm.heap.get(binding_ref) {
        HeapObj::Binding(binding) => match binding.value.as_obj().map(|r| (r, vm.heap.get(r))) {
            Some((autoload_ref, HeapObj::Autoload(autoload))) => {
                Some((autoload_ref, autoload.thunk, autoload.in_progress))
            }
            _ => None,
        },
        _ => panic!("Global slot resolved to a non-binding object."),
    };

    if let Some((autoload_ref, thunk, in_progress)) = autoload {
        if in_progress {
            unbound_error(vm, name, module)?;
            unreachable!("Unbound-variable conditions do not continue.");
        }
        match vm.heap.get_mut(autoload_ref) {
            HeapObj::Autoload(autoload) => autoload.in_progress = true,
            _ => unreachable!(),
        }
        apply_rec(vm, thunk, &[])?;

        // the loader must have replaced the marker
        let still_autoload = match vm.heap.get(binding_ref) {
            HeapObj::Binding(binding) => matches!(
                binding.value.as_obj().map(|r| vm.heap.get(r)),
                Some(HeapObj::Autoload(_))
            ),
            _ => false,
        };
        if still_autoload {
            unbound_error(vm, name, module)?;
            unreachable!("Unbound-variable conditions do not continue.");
        }
    }

    Ok(binding_ref)
}

fn binding_value(vm: &Vm, binding_ref: ObjRef) -> Value {
    match vm.heap.get(binding_ref) {
        HeapObj::Binding(binding) => binding.value,
        _ => panic!("Global slot resolved to a non-binding object."),
    }
}

fn unbound_error(vm: &mut Vm, name: ObjRef, module: usize) -> VmResult<Value> {
    let rendered = vm.heap.format_value(Value::Obj(name));
    let module_name = vm.module_name(module).to_owned();
    raise_condition(
        vm,
        ConditionKind::UnboundVariable,
        format!("unbound variable: {} in module {}", rendered, module_name),
        vec![Value::Obj(name)],
    )
}

fn fetch_global_value(vm: &mut Vm, slot_index: usize) -> VmResult<Value> {
    let binding_ref = resolve_global(vm, slot_index)?;
    let value = binding_value(vm, binding_ref);
    match value {
        Value::Unbound => {
            let (name, module) = {
                let code = vm.heap.code(vm.pc.code);
                (code.globals[slot_index].name, code.module)
            };
            unbound_error(vm, name, module)
        }
        _ => Ok(value),
    }
}

pub fn global_ref(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    // (param global_slot_index:u32) -> value
    let slot_index = vm.fetch_word() as usize;
    match fetch_global_value(vm, slot_index) {
        Ok(value) => {
            vm.val0 = value;
            vm.num_vals = 1;
            HandleResult::Next
        }
        Err(signal) => HandleResult::Escape(signal),
    }
}

pub fn global_ref_push(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    let slot_index = vm.fetch_word() as usize;
    match fetch_global_value(vm, slot_index) {
        Ok(value) => {
            vm.check_stack(1);
            vm.push_arg(value);
            vm.val0 = value;
            vm.num_vals = 1;
            HandleResult::Next
        }
        Err(signal) => HandleResult::Escape(signal),
    }
}

pub fn global_set(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    // (param global_slot_index:u32) (operand value) -> #<unspecified>
    let slot_index = vm.fetch_word() as usize;
    let binding_ref = match resolve_global(vm, slot_index) {
        Ok(binding_ref) => binding_ref,
        Err(signal) => return HandleResult::Escape(signal),
    };
    let value = vm.val0;
    match vm.heap.get_mut(binding_ref) {
        HeapObj::Binding(binding) => binding.value = value,
        _ => panic!("Global slot resolved to a non-binding object."),
    }
    vm.val0 = Value::Unspecified;
    vm.num_vals = 1;
    HandleResult::Next
}

pub fn define(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    // (param global_slot_index:u32) (operand value) -> symbol
    let slot_index = vm.fetch_word() as usize;
    let code_ref = vm.pc.code;
    let (name, module) = {
        let code = vm.heap.code(code_ref);
        (code.globals[slot_index].name, code.module)
    };
    let value = vm.val0;
    let binding_ref = vm.define_global(module, name, value);
    vm.heap.code_mut(code_ref).globals[slot_index].cached = Some(binding_ref);
    vm.val0 = Value::Obj(name);
    vm.num_vals = 1;
    HandleResult::Next
}
