// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

// first-class continuations
// -------------------------
//
// capture promotes the whole continuation chain to the heap and wraps an
// escape point in a subr. reinstatement has three cases:
//
// 1. the captured host-stack record is an outer record of the current
//    chain: escape outward (the boundary entry at that record consumes
//    the signal and restarts its loop).
// 2. the captured record no longer exists ("ghost"): run the scheme part
//    right here; an eventual attempt to return to the vanished host
//    frame is caught at the boundary and reported.
// 3. same record: adjust the dynamic-handler lists and install the
//    target continuation directly.
//
// the handler adjustment threads each after/before thunk through a host
// continuation so every thunk runs with the dynamic context it expects.

use lyra_context::{
    heap::{ConditionKind, EscapePoint, HeapObj, ObjRef, Subr},
    stack::ContPtr,
    value::Value,
    vm::Vm,
    EscapeSignal, VmResult,
};

use crate::raise_condition;

/// capture the full continuation and apply `proc` to it.
pub fn call_cc(vm: &mut Vm, proc: Value) -> VmResult<Value> {
    vm.save_cont();
    let ep_ref = vm.heap.alloc(HeapObj::EscapePoint(EscapePoint {
        prev: None,
        floating: None,
        ehandler: Value::False,
        xhandler: Value::False,
        handlers: vm.handlers,
        cont: vm.cont,
        cstack: vm.current_cstack_id(),
        error_reporting: false,
        rewind_before: false,
    }));
    let cont_proc = make_continuation(vm, ep_ref, "continuation");
    vm.arrange_apply(proc, &[cont_proc])
}

/// capture the partial continuation delimited by the nearest boundary
/// frame and apply `proc` to it. the captured chain is severed below the
/// boundary, and the escape point carries no host-stack record so the
/// continuation can be applied under any host-stack state.
pub fn call_pc(vm: &mut Vm, proc: Value) -> VmResult<Value> {
    vm.save_cont();

    // find the latest boundary frame; after save_cont the chain lives in
    // the heap
    let mut cursor = vm.cont;
    let mut below_boundary: Option<ObjRef> = None;
    while !matches!(cursor, ContPtr::Null) && !vm.is_boundary_frame(cursor) {
        let ContPtr::Heap(frame_ref) = cursor else {
            panic!("Continuation frame left in the stack after promotion.");
        };
        below_boundary = Some(frame_ref);
        cursor = vm.cont_prev_of(cursor);
    }

    // sever the chain at the boundary
    if let Some(frame_ref) = below_boundary {
        vm.heap.cont_frame_mut(frame_ref).prev = ContPtr::Null;
    }

    let ep_ref = vm.heap.alloc(HeapObj::EscapePoint(EscapePoint {
        prev: None,
        floating: None,
        ehandler: Value::False,
        xhandler: Value::False,
        handlers: vm.handlers,
        cont: vm.cont,
        cstack: None,
        error_reporting: false,
        rewind_before: false,
    }));
    let cont_proc = make_continuation(vm, ep_ref, "partial continuation");

    // the suspended rest of the computation below the boundary is
    // restored by the boundary entry when the severed chain runs out
    vm.cont = cursor;
    vm.arrange_apply(proc, &[cont_proc])
}

fn make_continuation(vm: &mut Vm, ep_ref: ObjRef, name: &str) -> Value {
    Value::Obj(vm.heap.alloc(HeapObj::Subr(Subr {
        name: name.to_owned(),
        func: throw_continuation,
        required: 0,
        optional: true,
        data: Value::Obj(ep_ref),
    })))
}

/// body of a continuation procedure. `data` holds the escape point, the
/// folded argument list carries the values to deliver.
pub fn throw_continuation(vm: &mut Vm, args: &[Value], data: Value) -> VmResult<Value> {
    let Some(ep_ref) = data.as_obj() else {
        panic!("Continuation subr without an escape point.");
    };
    let args_list = args[0];
    let ep = vm.heap.escape_point(ep_ref);

    if let Some(target_record) = ep.cstack {
        if vm.current_cstack_id() != Some(target_record) {
            if vm.has_cstack(target_record) {
                // the capture lives below the current host frames:
                // unwind outward to its record
                return Err(EscapeSignal::Continuation {
                    ep: ep_ref,
                    args: args_list,
                });
            }
            // ghost continuation: the host frames it would return to no
            // longer exist. run the scheme part here; the boundary entry
            // reports an eventual attempt to return to the host.
        }
    }

    let handlers_to_call = calculate_handlers(vm, ep_ref);
    throw_cont_body(vm, handlers_to_call, ep_ref, args_list)
}

/// figure out which after/before thunks must run to move from the
/// current dynamic context to the target one. returns a list of
/// (thunk . handler-chain) pairs; each thunk runs with its chain
/// installed.
pub fn calculate_handlers(vm: &mut Vm, ep_ref: ObjRef) -> Value {
    let ep = vm.heap.escape_point(ep_ref);
    let target = vm.heap.reverse(ep.handlers);
    let current = vm.handlers;
    let mut result = Vec::new();

    // leaving the source context: after thunks of handlers not present
    // in the target, innermost first
    let mut p = current;
    while let Some((entry, rest)) = vm.heap.pair(p).map(|pair| (pair.car, pair.cdr)) {
        if vm.heap.memq(entry, target).is_true() {
            break;
        }
        let after = vm.heap.cdr(entry).unwrap_or(Value::False);
        let item = vm.heap.cons(after, rest);
        result.push(item);
        p = rest;
    }

    // entering the target context: before thunks of handlers not present
    // in the source, outermost first
    let mut p = target;
    while let Some((entry, rest)) = vm.heap.pair(p).map(|pair| (pair.car, pair.cdr)) {
        if !vm.heap.memq(entry, current).is_true() {
            let chain = vm.heap.memq(entry, ep.handlers);
            let before = vm.heap.car(entry).unwrap_or(Value::False);
            let tail = vm.heap.cdr(chain).unwrap_or(Value::Nil);
            let item = vm.heap.cons(before, tail);
            result.push(item);
        }
        p = rest;
    }

    vm.heap.list(&result)
}

/// run the pending handler thunks one at a time (each threaded through a
/// host continuation), then install the target continuation and deliver
/// the arguments.
pub fn throw_cont_body(
    vm: &mut Vm,
    handlers: Value,
    ep_ref: ObjRef,
    args: Value,
) -> VmResult<Value> {
    if let Some((entry, rest)) = vm.heap.pair(handlers).map(|pair| (pair.car, pair.cdr)) {
        let thunk = vm.heap.car(entry).unwrap_or(Value::False);
        let chain = vm.heap.cdr(entry).unwrap_or(Value::Nil);

        vm.push_cc(throw_cont_cc, &[rest, Value::Obj(ep_ref), args]);
        vm.handlers = chain;
        return vm.arrange_apply(thunk, &[]);
    }

    let ep = vm.heap.escape_point(ep_ref);

    // a partial continuation returns to the current continuation when it
    // runs out; make sure the current chain survives its execution
    if ep.cstack.is_none() {
        vm.save_cont();
    }

    vm.pc = vm.return_pos();
    vm.cont = ep.cont;
    vm.handlers = ep.handlers;

    let values = match vm.heap.list_to_vec(args) {
        Ok(values) => values,
        Err(_) => {
            return raise_condition(
                vm,
                ConditionKind::ImproperList,
                "improper list passed to a continuation",
                vec![args],
            )
        }
    };
    match vm.set_values(&values) {
        Ok(()) => Ok(vm.val0),
        Err(_) => raise_condition(
            vm,
            ConditionKind::TooManyValues,
            "too many values passed to the continuation",
            vec![],
        ),
    }
}

fn throw_cont_cc(vm: &mut Vm, _result: Value, data: &[Value]) -> VmResult<Value> {
    let handlers = data[0];
    let Some(ep_ref) = data[1].as_obj() else {
        panic!("Corrupt continuation-throw frame.");
    };
    let args = data[2];
    throw_cont_body(vm, handlers, ep_ref, args)
}

#[cfg(test)]
mod tests {
    use lyra_context::{
        code::{CompiledCode, GlobalSlot},
        heap::{ConditionKind, HeapObj, ObjRef},
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

    #[test]
    fn test_escaping_continuation_abandons_pending_computation() {
        // pesudo code:
        //
        // (call/cc (lambda (k) (+ 1 (k 10))))
        //
        // expect: 10 — the pending addition is abandoned
        let mut vm = new_vm();

        // fn (k) -> (+ 1 (k 10))
        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i16(Opcode::imm_int_push, 1);
        let pre = writer.write_opcode_i32(Opcode::pre_call, 0);
        writer.write_opcode_i16(Opcode::imm_int_push, 10);
        writer.write_opcode_b_c(Opcode::local_ref, 0, 0);
        writer.write_opcode_c(Opcode::call, 1);
        let resume = writer.write_opcode(Opcode::num_add);
        writer.write_opcode(Opcode::ret);
        writer.patch_extension(pre, resume as u32);
        let mut receiver = CompiledCode::new("receiver", writer.to_words());
        receiver.required = 1;
        let receiver_ref = alloc_code(&mut vm, receiver);

        let mut writer = BytecodeWriter::new();
        let pre = writer.write_opcode_i32(Opcode::pre_call, 0);
        writer.write_opcode_i32(Opcode::make_closure, 0);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::global_ref, 0);
        writer.write_opcode_c(Opcode::call, 1);
        let resume = writer.write_opcode(Opcode::ret);
        writer.patch_extension(pre, resume as u32);

        let callcc_slot = global_slot(&mut vm, "call/cc");
        let mut main = CompiledCode::new("main", writer.to_words());
        main.consts = vec![Value::Obj(receiver_ref)];
        main.globals = vec![callcc_slot];
        let program = alloc_code(&mut vm, main);

        let result = eval_rec(&mut vm, program).unwrap();
        assert_eq!(result, Value::Int(10));
    }

    #[test]
    fn test_capture_and_immediately_invoke_is_identity() {
        // pesudo code:
        //
        // (call/cc (lambda (k) (k 42)))
        //
        // expect: 42, with the dynamic context unchanged
        let mut vm = new_vm();

        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i16(Opcode::imm_int_push, 42);
        writer.write_opcode_b_c(Opcode::local_ref, 0, 0);
        writer.write_opcode_c(Opcode::tail_call, 1);
        writer.write_opcode(Opcode::ret);
        let mut receiver = CompiledCode::new("receiver", writer.to_words());
        receiver.required = 1;
        let receiver_ref = alloc_code(&mut vm, receiver);

        let mut writer = BytecodeWriter::new();
        let pre = writer.write_opcode_i32(Opcode::pre_call, 0);
        writer.write_opcode_i32(Opcode::make_closure, 0);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::global_ref, 0);
        writer.write_opcode_c(Opcode::call, 1);
        let resume = writer.write_opcode(Opcode::ret);
        writer.patch_extension(pre, resume as u32);

        let callcc_slot = global_slot(&mut vm, "call/cc");
        let mut main = CompiledCode::new("main", writer.to_words());
        main.consts = vec![Value::Obj(receiver_ref)];
        main.globals = vec![callcc_slot];
        let program = alloc_code(&mut vm, main);

        let result = eval_rec(&mut vm, program).unwrap();
        assert_eq!(result, Value::Int(42));
        assert_eq!(vm.num_vals, 1);
        assert_eq!(vm.handlers, Value::Nil);
    }

    #[test]
    fn test_partial_continuation_returns_to_its_caller() {
        // pesudo code:
        //
        // (+ 1 (call/pc (lambda (k) (k 10))))
        //
        // the captured partial continuation is delimited by the boundary
        // frame; running it out resumes the suspended addition.
        let mut vm = new_vm();

        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i16(Opcode::imm_int_push, 10);
        writer.write_opcode_b_c(Opcode::local_ref, 0, 0);
        writer.write_opcode_c(Opcode::tail_call, 1);
        writer.write_opcode(Opcode::ret);
        let mut receiver = CompiledCode::new("receiver", writer.to_words());
        receiver.required = 1;
        let receiver_ref = alloc_code(&mut vm, receiver);

        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i16(Opcode::imm_int_push, 1);
        let pre = writer.write_opcode_i32(Opcode::pre_call, 0);
        writer.write_opcode_i32(Opcode::make_closure, 0);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::global_ref, 0);
        writer.write_opcode_c(Opcode::call, 1);
        let resume = writer.write_opcode(Opcode::num_add);
        writer.write_opcode(Opcode::ret);
        writer.patch_extension(pre, resume as u32);

        let callpc_slot = global_slot(&mut vm, "call/pc");
        let mut main = CompiledCode::new("main", writer.to_words());
        main.consts = vec![Value::Obj(receiver_ref)];
        main.globals = vec![callpc_slot];
        let program = alloc_code(&mut vm, main);

        let result = eval_rec(&mut vm, program).unwrap();
        assert_eq!(result, Value::Int(11));
    }

    #[test]
    fn test_ghost_continuation_runs_on_current_host_stack() {
        // capture k in one evaluation; its host-stack record is gone by
        // the time a later evaluation invokes it. the scheme part of the
        // ghost must run on the current host stack — observable through
        // the witness global — and may escape to a live continuation
        // instead of returning to the vanished host frame.
        let mut vm = new_vm();

        // fn (c) -> (set! k c)
        let mut writer = BytecodeWriter::new();
        writer.write_opcode_b_c(Opcode::local_ref, 0, 0);
        writer.write_opcode_i32(Opcode::global_set, 0);
        writer.write_opcode(Opcode::ret);
        let k_slot = global_slot(&mut vm, "k");
        let mut keeper = CompiledCode::new("keeper", writer.to_words());
        keeper.required = 1;
        keeper.globals = vec![k_slot];
        let keeper_ref = alloc_code(&mut vm, keeper);

        // main1:
        //   (define k #f) (define k2 #f) (define witness #f)
        //   (set! witness (call/cc keeper))
        //   (if k2 (k2 witness) witness)
        let mut writer = BytecodeWriter::new();
        writer.write_opcode(Opcode::imm_false);
        writer.write_opcode_i32(Opcode::define, 0); // k
        writer.write_opcode(Opcode::imm_false);
        writer.write_opcode_i32(Opcode::define, 1); // k2
        writer.write_opcode(Opcode::imm_false);
        writer.write_opcode_i32(Opcode::define, 2); // witness
        let pre = writer.write_opcode_i32(Opcode::pre_call, 0);
        writer.write_opcode_i32(Opcode::make_closure, 0);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::global_ref, 3); // call/cc
        writer.write_opcode_c(Opcode::call, 1);
        let resume = writer.write_opcode_i32(Opcode::global_set, 2); // witness
        writer.write_opcode_i32(Opcode::global_ref, 1); // k2
        let branch = writer.write_opcode_i32(Opcode::branch_false, 0);
        writer.write_opcode_i32(Opcode::global_ref_push, 2); // witness
        writer.write_opcode_i32(Opcode::global_ref, 1); // k2
        writer.write_opcode_c(Opcode::tail_call, 1);
        writer.write_opcode(Opcode::ret);
        let end_addr = writer.write_opcode_i32(Opcode::global_ref, 2);
        writer.write_opcode(Opcode::ret);
        writer.patch_extension(pre, resume as u32);
        writer.patch_extension(branch, end_addr as u32);

        let k_slot = global_slot(&mut vm, "k");
        let k2_slot = global_slot(&mut vm, "k2");
        let witness_slot = global_slot(&mut vm, "witness");
        let callcc_slot = global_slot(&mut vm, "call/cc");
        let mut main1 = CompiledCode::new("main1", writer.to_words());
        main1.consts = vec![Value::Obj(keeper_ref)];
        main1.globals = vec![k_slot, k2_slot, witness_slot, callcc_slot];
        let program1 = alloc_code(&mut vm, main1);
        eval_rec(&mut vm, program1).unwrap();

        let k_name = vm.heap.intern("k");
        assert!(global_value(&vm, k_name).is_true());

        // fn (c) -> (set! k2 c)
        let mut writer = BytecodeWriter::new();
        writer.write_opcode_b_c(Opcode::local_ref, 0, 0);
        writer.write_opcode_i32(Opcode::global_set, 0);
        writer.write_opcode(Opcode::ret);
        let k2_slot = global_slot(&mut vm, "k2");
        let mut keeper2 = CompiledCode::new("keeper2", writer.to_words());
        keeper2.required = 1;
        keeper2.globals = vec![k2_slot];
        let keeper2_ref = alloc_code(&mut vm, keeper2);

        // main2:
        //   (define tmp #f)
        //   (set! tmp (call/cc keeper2))
        //   (if (eq? tmp 'from-ghost) tmp (k 'from-ghost))
        let mut writer = BytecodeWriter::new();
        writer.write_opcode(Opcode::imm_false);
        writer.write_opcode_i32(Opcode::define, 0); // tmp
        let pre = writer.write_opcode_i32(Opcode::pre_call, 0);
        writer.write_opcode_i32(Opcode::make_closure, 0);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::global_ref, 1); // call/cc
        writer.write_opcode_c(Opcode::call, 1);
        let resume = writer.write_opcode_i32(Opcode::global_set, 0); // tmp
        writer.write_opcode_i32(Opcode::global_ref_push, 0);
        writer.write_opcode_i32(Opcode::load_const, 1); // 'from-ghost
        writer.write_opcode(Opcode::eq);
        let branch = writer.write_opcode_i32(Opcode::branch_false, 0);
        writer.write_opcode_i32(Opcode::global_ref, 0);
        writer.write_opcode(Opcode::ret);
        let else_addr = writer.write_opcode_i32(Opcode::load_const_push, 1);
        writer.write_opcode_i32(Opcode::global_ref, 2); // k
        writer.write_opcode_c(Opcode::tail_call, 1);
        writer.write_opcode(Opcode::ret);
        writer.patch_extension(pre, resume as u32);
        writer.patch_extension(branch, else_addr as u32);

        let from_ghost_sym = vm.heap.symbol("from-ghost");
        let tmp_slot = global_slot(&mut vm, "tmp");
        let callcc_slot = global_slot(&mut vm, "call/cc");
        let k_slot = global_slot(&mut vm, "k");
        let mut main2 = CompiledCode::new("main2", writer.to_words());
        main2.consts = vec![Value::Obj(keeper2_ref), from_ghost_sym];
        main2.globals = vec![tmp_slot, callcc_slot, k_slot];
        let program2 = alloc_code(&mut vm, main2);

        let result = eval_rec(&mut vm, program2).unwrap();
        assert_eq!(result, from_ghost_sym);

        // the ghost's scheme part really ran here
        let witness_name = vm.heap.intern("witness");
        assert_eq!(global_value(&vm, witness_name), from_ghost_sym);
    }

    fn install_stale_boundary(
        vm: &mut Vm,
        _args: &[Value],
        _data: Value,
    ) -> lyra_context::VmResult<Value> {
        // stands in for a ghost continuation whose chain bottoms out at
        // the boundary frame of a vanished host entry
        let stale = vm
            .heap
            .alloc(HeapObj::ContFrame(lyra_context::heap::HeapContFrame {
                prev: lyra_context::stack::ContPtr::Null,
                env: lyra_context::stack::EnvPtr::Null,
                resume: lyra_context::stack::ResumePoint::Boundary,
                base: None,
                host: false,
                data: Vec::new(),
            }));
        vm.cont = lyra_context::stack::ContPtr::Heap(stale);
        Ok(Value::Unspecified)
    }

    #[test]
    fn test_ghost_return_to_host_is_an_error() {
        // returning through a boundary frame that belongs to no live
        // host-stack record raises the ghost-continuation error.
        let mut vm = new_vm();

        let thunk = crate::subr::make_subr(
            &mut vm,
            "%install-stale-boundary",
            0,
            false,
            install_stale_boundary,
            Value::False,
        );
        let packet = crate::process::safe_apply(&mut vm, thunk, &[]);

        let exception = packet.exception.expect("the ghost return is an error");
        let condition = vm.heap.condition(exception).unwrap();
        assert_eq!(condition.kind, ConditionKind::GhostContinuation);
    }

    #[test]
    fn test_reentering_dynamic_wind_reruns_before_thunk() {
        // pesudo code:
        //
        // (define k #f)
        // (define trace '())
        // (define n 0)
        // (dynamic-wind
        //     (lambda ()
        //         (set! n (+ n 1))
        //         (set! trace (cons 'b trace)))
        //     (lambda () (call/cc (lambda (c) (set! k c))))
        //     (lambda () (set! trace (cons 'a trace))))
        // (if (= n 2) 'finished (k #f))
        //
        // reinstating k from outside the wind runs the before thunk
        // again on the way in and the after thunk again on the way out:
        // trace ends as (a b a b).
        let mut vm = new_vm();

        // before: bump n, push 'b
        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i32(Opcode::global_ref, 0); // n
        writer.write_opcode_i16(Opcode::num_add_imm, 1);
        writer.write_opcode_i32(Opcode::global_set, 0);
        writer.write_opcode_i32(Opcode::load_const_push, 0); // 'b
        writer.write_opcode_i32(Opcode::global_ref, 1); // trace
        writer.write_opcode(Opcode::cons);
        writer.write_opcode_i32(Opcode::global_set, 1);
        writer.write_opcode(Opcode::ret);
        let b_sym = vm.heap.symbol("b");
        let n_slot = global_slot(&mut vm, "n");
        let trace_slot = global_slot(&mut vm, "trace");
        let mut before = CompiledCode::new("before", writer.to_words());
        before.consts = vec![b_sym];
        before.globals = vec![n_slot, trace_slot];
        let before_ref = alloc_code(&mut vm, before);

        // after: push 'a
        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i32(Opcode::load_const_push, 0); // 'a
        writer.write_opcode_i32(Opcode::global_ref, 0); // trace
        writer.write_opcode(Opcode::cons);
        writer.write_opcode_i32(Opcode::global_set, 0);
        writer.write_opcode(Opcode::ret);
        let a_sym = vm.heap.symbol("a");
        let trace_slot = global_slot(&mut vm, "trace");
        let mut after = CompiledCode::new("after", writer.to_words());
        after.consts = vec![a_sym];
        after.globals = vec![trace_slot];
        let after_ref = alloc_code(&mut vm, after);

        // fn (c) -> (set! k c)
        let mut writer = BytecodeWriter::new();
        writer.write_opcode_b_c(Opcode::local_ref, 0, 0);
        writer.write_opcode_i32(Opcode::global_set, 0);
        writer.write_opcode(Opcode::ret);
        let k_slot = global_slot(&mut vm, "k");
        let mut keeper = CompiledCode::new("keeper", writer.to_words());
        keeper.required = 1;
        keeper.globals = vec![k_slot];
        let keeper_ref = alloc_code(&mut vm, keeper);

        // body: (call/cc keeper)
        let mut writer = BytecodeWriter::new();
        let pre = writer.write_opcode_i32(Opcode::pre_call, 0);
        writer.write_opcode_i32(Opcode::make_closure, 0);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::global_ref, 0);
        writer.write_opcode_c(Opcode::call, 1);
        let resume = writer.write_opcode(Opcode::ret);
        writer.patch_extension(pre, resume as u32);
        let callcc_slot = global_slot(&mut vm, "call/cc");
        let mut body = CompiledCode::new("body", writer.to_words());
        body.consts = vec![Value::Obj(keeper_ref)];
        body.globals = vec![callcc_slot];
        let body_ref = alloc_code(&mut vm, body);

        // main
        let mut writer = BytecodeWriter::new();
        writer.write_opcode(Opcode::imm_false);
        writer.write_opcode_i32(Opcode::define, 0); // k
        writer.write_opcode(Opcode::imm_nil);
        writer.write_opcode_i32(Opcode::define, 1); // trace
        writer.write_opcode_i16(Opcode::imm_int, 0);
        writer.write_opcode_i32(Opcode::define, 2); // n
        let pre = writer.write_opcode_i32(Opcode::pre_call, 0);
        writer.write_opcode_i32(Opcode::make_closure, 0);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::make_closure, 1);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::make_closure, 2);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::global_ref, 3); // dynamic-wind
        writer.write_opcode_c(Opcode::call, 3);
        let resume = writer.write_opcode_i32(Opcode::global_ref_push, 2); // n
        writer.write_opcode_i16(Opcode::imm_int, 2);
        writer.write_opcode(Opcode::num_eq);
        let branch = writer.write_opcode_i32(Opcode::branch_false, 0);
        writer.write_opcode_i32(Opcode::load_const, 3); // 'finished
        writer.write_opcode(Opcode::ret);
        let else_addr = writer.write_opcode(Opcode::imm_false);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::global_ref, 0); // k
        writer.write_opcode_c(Opcode::tail_call, 1);
        writer.write_opcode(Opcode::ret);
        writer.patch_extension(pre, resume as u32);
        writer.patch_extension(branch, else_addr as u32);

        let finished_sym = vm.heap.symbol("finished");
        let k_slot = global_slot(&mut vm, "k");
        let trace_slot = global_slot(&mut vm, "trace");
        let n_slot = global_slot(&mut vm, "n");
        let dw_slot = global_slot(&mut vm, "dynamic-wind");
        let mut main = CompiledCode::new("main", writer.to_words());
        main.consts = vec![
            Value::Obj(before_ref),
            Value::Obj(body_ref),
            Value::Obj(after_ref),
            finished_sym,
        ];
        main.globals = vec![k_slot, trace_slot, n_slot, dw_slot];
        let program = alloc_code(&mut vm, main);

        let result = eval_rec(&mut vm, program).unwrap();
        assert_eq!(result, finished_sym);

        let trace_name = vm.heap.intern("trace");
        let trace = global_value(&vm, trace_name);
        let tags = vm.heap.list_to_vec(trace).unwrap();
        assert_eq!(tags, vec![a_sym, b_sym, a_sym, b_sym]);
    }
}
