// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

// dynamic-wind
// ------------
//
// three host continuations chain the steps together:
//
// 1. apply `before`; its host continuation prepends (before . after) to
//    the dynamic-handler list and applies `body`.
// 2. `body`'s host continuation restores the previous handler list,
//    stashes the body's values, and applies `after`.
// 3. `after`'s host continuation restores the stashed values, so the
//    whole form yields what the body produced.

use lyra_context::{value::Value, vm::Vm, VmResult};

/// install (before, body, after). the result values are the values the
/// body produced, preserved across the after thunk.
pub fn dynamic_wind(vm: &mut Vm, before: Value, body: Value, after: Value) -> VmResult<Value> {
    let data = [before, body, after];
    vm.push_cc(dynwind_before_cc, &data);
    vm.arrange_apply(before, &[])
}

fn dynwind_before_cc(vm: &mut Vm, _result: Value, data: &[Value]) -> VmResult<Value> {
    let before = data[0];
    let body = data[1];
    let after = data[2];

    let prev = vm.handlers;
    let handler_pair = vm.heap.cons(before, after);
    vm.handlers = vm.heap.cons(handler_pair, prev);

    vm.push_cc(dynwind_body_cc, &[after, prev]);
    vm.arrange_apply(body, &[])
}

fn dynwind_body_cc(vm: &mut Vm, result: Value, data: &[Value]) -> VmResult<Value> {
    let after = data[0];
    let prev = data[1];

    vm.handlers = prev;

    // stash the body's values across the after thunk
    let num_vals = vm.num_vals;
    let extra = if num_vals > 1 {
        let mut values = Vec::with_capacity(num_vals - 1);
        for i in 1..num_vals {
            values.push(vm.get_result(i));
        }
        vm.heap.list(&values)
    } else {
        Value::Nil
    };

    vm.push_cc(
        dynwind_after_cc,
        &[result, Value::Int(num_vals as i64), extra],
    );
    vm.arrange_apply(after, &[])
}

fn dynwind_after_cc(vm: &mut Vm, _result: Value, data: &[Value]) -> VmResult<Value> {
    let Value::Int(num_vals) = data[1] else {
        panic!("Corrupt dynamic-wind restore frame.");
    };
    let num_vals = num_vals as usize;

    vm.num_vals = num_vals;
    if num_vals > 1 {
        let mut rest = data[2];
        for i in 0..num_vals - 1 {
            let Some((car, cdr)) = vm.heap.pair(rest).map(|p| (p.car, p.cdr)) else {
                panic!("Corrupt dynamic-wind restore frame.");
            };
            vm.vals[i] = car;
            rest = cdr;
        }
    }
    Ok(data[0])
}

#[cfg(test)]
mod tests {
    use lyra_context::{
        code::{CompiledCode, GlobalSlot},
        heap::{HeapObj, ObjRef},
        settings::VmSettings,
        value::Value,
        vm::Vm,
    };
    use lyra_isa::{bytecode_writer::BytecodeWriter, opcode::Opcode};

    use crate::{process::eval_rec, subr::install_core_subrs};

    fn new_vm() -> Vm {
        let mut vm = Vm::new(VmSettings::default());
        install_core_subrs(&mut vm);
        vm
    }

    fn alloc_code(vm: &mut Vm, code: CompiledCode) -> ObjRef {
        vm.heap.alloc(HeapObj::Code(code))
    }

    fn global_slot(vm: &mut Vm, name: &str) -> GlobalSlot {
        GlobalSlot {
            name: vm.heap.intern(name),
            cached: None,
        }
    }

    fn global_value(vm: &Vm, name: ObjRef) -> Value {
        let binding_ref = vm.lookup_global(0, name).unwrap();
        match vm.heap.get(binding_ref) {
            HeapObj::Binding(binding) => binding.value,
            _ => unreachable!(),
        }
    }

    /// (set! trace (cons 'tag trace))
    fn trace_pusher(vm: &mut Vm, tag: &str) -> ObjRef {
        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i32(Opcode::load_const_push, 0);
        writer.write_opcode_i32(Opcode::global_ref, 0);
        writer.write_opcode(Opcode::cons);
        writer.write_opcode_i32(Opcode::global_set, 0);
        writer.write_opcode(Opcode::ret);
        let tag = vm.heap.symbol(tag);
        let slot = global_slot(vm, "trace");
        let mut code = CompiledCode::new("trace-push", writer.to_words());
        code.consts = vec![tag];
        code.globals = vec![slot];
        alloc_code(vm, code)
    }

    #[test]
    fn test_before_body_after_ordering() {
        // pesudo code:
        //
        // (define trace '())
        // (dynamic-wind
        //     (lambda () (set! trace (cons 'b trace)))
        //     (lambda () 'body)
        //     (lambda () (set! trace (cons 'a trace))))
        //
        // expect: result 'body, trace ends as (a b)
        let mut vm = new_vm();

        let before_ref = trace_pusher(&mut vm, "b");
        let after_ref = trace_pusher(&mut vm, "a");

        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i32(Opcode::load_const, 0); // 'body
        writer.write_opcode(Opcode::ret);
        let body_sym = vm.heap.symbol("body");
        let mut body_code = CompiledCode::new("body", writer.to_words());
        body_code.consts = vec![body_sym];
        let body_ref = alloc_code(&mut vm, body_code);

        let mut writer = BytecodeWriter::new();
        writer.write_opcode(Opcode::imm_nil);
        writer.write_opcode_i32(Opcode::define, 0); // trace
        let pre = writer.write_opcode_i32(Opcode::pre_call, 0);
        writer.write_opcode_i32(Opcode::make_closure, 0);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::make_closure, 1);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::make_closure, 2);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::global_ref, 1); // dynamic-wind
        writer.write_opcode_c(Opcode::call, 3);
        let resume = writer.write_opcode(Opcode::ret);
        writer.patch_extension(pre, resume as u32);

        let trace_slot = global_slot(&mut vm, "trace");
        let dw_slot = global_slot(&mut vm, "dynamic-wind");
        let mut main = CompiledCode::new("main", writer.to_words());
        main.consts = vec![
            Value::Obj(before_ref),
            Value::Obj(body_ref),
            Value::Obj(after_ref),
        ];
        main.globals = vec![trace_slot, dw_slot];
        let program = alloc_code(&mut vm, main);

        let result = eval_rec(&mut vm, program).unwrap();
        assert_eq!(result, body_sym);

        let trace_name = vm.heap.intern("trace");
        let trace = global_value(&vm, trace_name);
        let tags = vm.heap.list_to_vec(trace).unwrap();
        let a = vm.heap.symbol("a");
        let b = vm.heap.symbol("b");
        assert_eq!(tags, vec![a, b]);
    }

    #[test]
    fn test_body_values_preserved_across_after() {
        // pesudo code:
        //
        // (dynamic-wind
        //     (lambda () 'ignored)
        //     (lambda () (values 1 2))
        //     (lambda () 99))
        //
        // expect: the two body values survive the after thunk
        let mut vm = new_vm();

        let mut writer = BytecodeWriter::new();
        writer.write_opcode(Opcode::imm_unspec);
        writer.write_opcode(Opcode::ret);
        let noop_ref = alloc_code(&mut vm, CompiledCode::new("noop", writer.to_words()));

        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i16(Opcode::imm_int_push, 1);
        writer.write_opcode_i16(Opcode::imm_int_push, 2);
        writer.write_opcode_c(Opcode::values, 2);
        writer.write_opcode(Opcode::ret);
        let body_ref = alloc_code(&mut vm, CompiledCode::new("two-values", writer.to_words()));

        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i16(Opcode::imm_int, 99);
        writer.write_opcode(Opcode::ret);
        let after_ref = alloc_code(&mut vm, CompiledCode::new("after", writer.to_words()));

        let mut writer = BytecodeWriter::new();
        let pre = writer.write_opcode_i32(Opcode::pre_call, 0);
        writer.write_opcode_i32(Opcode::make_closure, 0);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::make_closure, 1);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::make_closure, 2);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::global_ref, 0);
        writer.write_opcode_c(Opcode::call, 3);
        let resume = writer.write_opcode(Opcode::ret);
        writer.patch_extension(pre, resume as u32);

        let dw_slot = global_slot(&mut vm, "dynamic-wind");
        let mut main = CompiledCode::new("main", writer.to_words());
        main.consts = vec![
            Value::Obj(noop_ref),
            Value::Obj(body_ref),
            Value::Obj(after_ref),
        ];
        main.globals = vec![dw_slot];
        let program = alloc_code(&mut vm, main);

        let result = eval_rec(&mut vm, program).unwrap();
        assert_eq!(result, Value::Int(1));
        assert_eq!(vm.get_num_results(), 2);
        assert_eq!(vm.get_result(1), Value::Int(2));
    }
}
