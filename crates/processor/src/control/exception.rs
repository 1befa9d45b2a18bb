// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

// the exception protocol
// ----------------------
//
// two layers sit on top of the continuation machinery:
//
// - `with-exception-handler` swaps the exception handler register for
//   the extent of a thunk (a plain dynamic-wind).
// - `with-error-handler` / `with-guard-handler` install an escape point:
//   a record of the error handler plus the dynamic context to restore.
//   the two differ only in whether the dynamic-wind after thunks run
//   before or after the handler body.
//
// raising consults the exception-handler register first; the default
// handler searches the escape-point chain. while an error handler runs,
// its escape point moves from the main chain to the floating chain, so
// errors inside the handler reach the outer escape point while stack
// promotion still updates the record.

use lyra_context::{
    heap::{ConditionKind, EscapePoint, HeapObj, Subr},
    value::Value,
    vm::Vm,
    EscapeSignal, VmResult,
};

use crate::{
    control::dynwind::dynamic_wind,
    process::apply_rec,
    raise_condition,
};

/// entry point of raising. may return normally when a user exception
/// handler continues a continuable condition.
pub fn throw_exception(vm: &mut Vm, exception: Value) -> VmResult<Value> {
    if !matches!(vm.exception_handler, Value::False) {
        // srfi-18 style: the running handler stays current
        let handler = vm.exception_handler;
        let result = apply_rec(vm, handler, &[exception])?;
        if vm.heap.is_serious_condition(exception) {
            // prevent a loop: pop the erroneous handler before reporting
            vm.exception_handler = Value::False;
            return raise_condition(
                vm,
                ConditionKind::NonContinuableReturn,
                format!(
                    "user-defined exception handler returned on non-continuable exception {}",
                    vm.heap.format_value(exception)
                ),
                vec![exception],
            );
        }
        return Ok(result);
    }

    if !vm.heap.is_serious_condition(exception) {
        // the default handler ignores continuable conditions; give the
        // nearest user exception handler a chance
        let mut ep = vm.escape_point;
        while let Some(ep_ref) = ep {
            let escape_point = vm.heap.escape_point(ep_ref);
            if !matches!(escape_point.xhandler, Value::False) {
                let xhandler = escape_point.xhandler;
                return apply_rec(vm, xhandler, &[exception]);
            }
            ep = escape_point.prev;
        }
    }

    default_error_handler(vm, exception)
}

/// the system default handler. locates the innermost escape point, runs
/// the dynamic-handler rewind and the user error handler, installs the
/// target continuation, and escapes. never returns normally.
pub fn default_error_handler(vm: &mut Vm, exception: Value) -> VmResult<Value> {
    if let Some(ep_ref) = vm.escape_point {
        let ep = vm.heap.escape_point(ep_ref);

        if ep.rewind_before {
            unwind_handlers_to(vm, ep.handlers)?;
        }

        // pop the escape point and float it: an error inside the handler
        // is caught by the outer escape point, and stack promotion keeps
        // updating the record through the floating chain
        vm.escape_point = ep.prev;
        let old_floating = vm.floating_ep;
        vm.heap.escape_point_mut(ep_ref).floating = old_floating;
        vm.floating_ep = Some(ep_ref);

        let protected = (|| -> VmResult<(Value, usize, Vec<Value>)> {
            let result = apply_rec(vm, ep.ehandler, &[exception])?;
            let num_vals = vm.num_vals;
            let mut extra = Vec::new();
            for i in 1..num_vals {
                extra.push(vm.get_result(i));
            }
            if !ep.rewind_before {
                unwind_handlers_to(vm, ep.handlers)?;
            }
            Ok((result, num_vals, extra))
        })();

        match protected {
            Err(signal) => {
                // the floating pointer must not survive a failed handler
                vm.floating_ep = old_floating;
                Err(signal)
            }
            Ok((result, num_vals, extra)) => {
                vm.val0 = result;
                vm.num_vals = num_vals;
                for (i, value) in extra.iter().enumerate() {
                    vm.vals[i] = *value;
                }
                vm.cont = vm.heap.escape_point(ep_ref).cont;
                vm.floating_ep = old_floating;
                if vm.heap.escape_point(ep_ref).error_reporting {
                    vm.error_being_reported = true;
                }
                Err(EscapeSignal::Error {
                    ep: Some(ep_ref),
                    condition: exception,
                })
            }
        }
    } else {
        // no active error handler: report, rewind every dynamic handler,
        // and unwind to the host (or give up the process)
        report_error(vm, exception);
        loop {
            let Some((entry, rest)) = vm
                .heap
                .pair(vm.handlers)
                .map(|pair| (pair.car, pair.cdr))
            else {
                break;
            };
            let after = vm.heap.cdr(entry).unwrap_or(Value::False);
            vm.handlers = rest;
            apply_rec(vm, after, &[])?;
        }

        if !vm.cstacks.is_empty() {
            Err(EscapeSignal::Error {
                ep: None,
                condition: exception,
            })
        } else {
            // the dynamic context is already rewound; nothing is left to
            // unwind to
            std::process::exit(70);
        }
    }
}

/// call the after thunks of the dynamic handlers between the current
/// list and `target`, innermost first, each with the remaining list
/// installed.
fn unwind_handlers_to(vm: &mut Vm, target: Value) -> VmResult<()> {
    loop {
        if vm.handlers.eq_value(&target) {
            return Ok(());
        }
        let Some((entry, rest)) = vm
            .heap
            .pair(vm.handlers)
            .map(|pair| (pair.car, pair.cdr))
        else {
            return Ok(());
        };
        let after = vm.heap.cdr(entry).unwrap_or(Value::False);
        vm.handlers = rest;
        apply_rec(vm, after, &[])?;
    }
}

/// report a condition to the current error port, guarding against a
/// reporting loop.
fn report_error(vm: &mut Vm, exception: Value) {
    if vm.error_being_reported || !vm.settings.error_reporting {
        return;
    }
    vm.error_being_reported = true;

    let mut text = String::new();
    match vm.heap.condition(exception) {
        Some(condition) => {
            text.push_str("*** ERROR: ");
            text.push_str(&condition.message);
            text.push('\n');
        }
        None => {
            text.push_str("*** ERROR: unhandled object: ");
            text.push_str(&vm.heap.format_value(exception));
            text.push('\n');
        }
    }
    for (i, source) in vm.stack_trace_lite().iter().enumerate() {
        text.push_str(&format!("  {}: {}\n", i, source));
    }

    if let Some(port) = vm.heap.port(vm.cur_err) {
        let _ = port.puts(vm.id, &text);
        let _ = port.flush(vm.id);
    }

    vm.error_being_reported = false;
}

/// install an escape point around `thunk`, expressed as a dynamic-wind
/// whose before/after subrs swap the escape point in and out.
pub fn with_error_handler(
    vm: &mut Vm,
    handler: Value,
    thunk: Value,
    rewind_before: bool,
) -> VmResult<Value> {
    let ep_ref = vm.heap.alloc(HeapObj::EscapePoint(EscapePoint {
        prev: vm.escape_point,
        floating: vm.floating_ep,
        ehandler: handler,
        xhandler: vm.exception_handler,
        handlers: vm.handlers,
        cont: vm.cont,
        cstack: vm.current_cstack_id(),
        error_reporting: vm.error_being_reported,
        rewind_before,
    }));

    // make the escape point visible to stack promotion right away, so
    // its continuation is redirected if a promotion happens before the
    // before thunk runs
    vm.escape_point = Some(ep_ref);

    let before = Value::Obj(vm.heap.alloc(HeapObj::Subr(Subr {
        name: "%install-error-handler".to_owned(),
        func: install_ehandler,
        required: 0,
        optional: false,
        data: Value::Obj(ep_ref),
    })));
    let after = Value::Obj(vm.heap.alloc(HeapObj::Subr(Subr {
        name: "%discard-error-handler".to_owned(),
        func: discard_ehandler,
        required: 0,
        optional: false,
        data: Value::Obj(ep_ref),
    })));

    dynamic_wind(vm, before, thunk, after)
}

fn install_ehandler(vm: &mut Vm, _args: &[Value], data: Value) -> VmResult<Value> {
    let Some(ep_ref) = data.as_obj() else {
        panic!("Error-handler installer without an escape point.");
    };
    vm.exception_handler = Value::False;
    vm.escape_point = Some(ep_ref);
    vm.error_being_reported = false;
    Ok(Value::Unspecified)
}

fn discard_ehandler(vm: &mut Vm, _args: &[Value], data: Value) -> VmResult<Value> {
    let Some(ep_ref) = data.as_obj() else {
        panic!("Error-handler installer without an escape point.");
    };
    let ep = vm.heap.escape_point(ep_ref);
    vm.escape_point = ep.prev;
    vm.exception_handler = ep.xhandler;
    if ep.error_reporting {
        vm.error_being_reported = true;
    }
    Ok(Value::Unspecified)
}

/// swap the exception handler for the extent of `thunk`.
pub fn with_exception_handler(vm: &mut Vm, handler: Value, thunk: Value) -> VmResult<Value> {
    let current = vm.exception_handler;
    let before = Value::Obj(vm.heap.alloc(HeapObj::Subr(Subr {
        name: "%install-exception-handler".to_owned(),
        func: install_xhandler,
        required: 0,
        optional: false,
        data: handler,
    })));
    let after = Value::Obj(vm.heap.alloc(HeapObj::Subr(Subr {
        name: "%install-exception-handler".to_owned(),
        func: install_xhandler,
        required: 0,
        optional: false,
        data: current,
    })));
    dynamic_wind(vm, before, thunk, after)
}

fn install_xhandler(vm: &mut Vm, _args: &[Value], data: Value) -> VmResult<Value> {
    vm.exception_handler = data;
    Ok(Value::Unspecified)
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

    use crate::{
        process::{eval_rec, safe_eval},
        subr::install_core_subrs,
    };

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
    fn test_guard_catches_raise_without_unwinding_outer_handlers() {
        // pesudo code:
        //
        // (define trace '())
        // (dynamic-wind
        //     (lambda () (set! trace (cons 'b trace)))
        //     (lambda ()
        //         (with-guard-handler
        //             (lambda (e) (list 'caught e))
        //             (lambda () (raise 'x))))
        //     (lambda () (set! trace (cons 'a trace))))
        //
        // expect: (caught x); the outer after thunk runs exactly once,
        // at the normal exit, so trace ends as (a b).
        let mut vm = new_vm();

        // before/after thunks pushing a tag onto trace
        let make_trace_pusher = |vm: &mut Vm, tag: &str| {
            let mut writer = BytecodeWriter::new();
            writer.write_opcode_i32(Opcode::load_const_push, 0);
            writer.write_opcode_i32(Opcode::global_ref, 0);
            writer.write_opcode(Opcode::cons);
            writer.write_opcode_i32(Opcode::global_set, 0);
            writer.write_opcode(Opcode::ret);
            let tag = vm.heap.symbol(tag);
            let slot = GlobalSlot {
                name: vm.heap.intern("trace"),
                cached: None,
            };
            let mut code = CompiledCode::new("trace-push", writer.to_words());
            code.consts = vec![tag];
            code.globals = vec![slot];
            vm.heap.alloc(HeapObj::Code(code))
        };
        let before_ref = make_trace_pusher(&mut vm, "b");
        let after_ref = make_trace_pusher(&mut vm, "a");

        // fn (e) -> (list 'caught e)
        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i32(Opcode::load_const_push, 0);
        writer.write_opcode_b_c(Opcode::local_ref_push, 0, 0);
        writer.write_opcode_c(Opcode::list, 2);
        writer.write_opcode(Opcode::ret);
        let caught_sym = vm.heap.symbol("caught");
        let mut handler = CompiledCode::new("guard-handler", writer.to_words());
        handler.consts = vec![caught_sym];
        handler.required = 1;
        let handler_ref = alloc_code(&mut vm, handler);

        // fn () -> (raise 'x)
        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i32(Opcode::load_const_push, 0);
        writer.write_opcode_i32(Opcode::global_ref, 0);
        writer.write_opcode_c(Opcode::tail_call, 1);
        writer.write_opcode(Opcode::ret);
        let x_sym = vm.heap.symbol("x");
        let raise_slot = global_slot(&mut vm, "raise");
        let mut raiser = CompiledCode::new("raiser", writer.to_words());
        raiser.consts = vec![x_sym];
        raiser.globals = vec![raise_slot];
        let raiser_ref = alloc_code(&mut vm, raiser);

        // fn () -> (with-guard-handler handler raiser)
        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i32(Opcode::make_closure, 0);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::make_closure, 1);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::global_ref, 0);
        writer.write_opcode_c(Opcode::tail_call, 2);
        writer.write_opcode(Opcode::ret);
        let guard_slot = global_slot(&mut vm, "with-guard-handler");
        let mut body = CompiledCode::new("guard-body", writer.to_words());
        body.consts = vec![Value::Obj(handler_ref), Value::Obj(raiser_ref)];
        body.globals = vec![guard_slot];
        let body_ref = alloc_code(&mut vm, body);

        // main
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
        let elements = vm.heap.list_to_vec(result).unwrap();
        assert_eq!(elements, vec![caught_sym, x_sym]);

        let trace_name = vm.heap.intern("trace");
        let trace = global_value(&vm, trace_name);
        let a_sym = vm.heap.symbol("a");
        let b_sym = vm.heap.symbol("b");
        assert_eq!(vm.heap.list_to_vec(trace).unwrap(), vec![a_sym, b_sym]);
    }

    #[test]
    fn test_exception_handler_continues_a_continuable_raise() {
        // pesudo code:
        //
        // (with-exception-handler
        //     (lambda (e) 'handled)
        //     (lambda () (raise 'x)))
        //
        // 'x is not a serious condition, so the handler's value becomes
        // the value of the raise form.
        let mut vm = new_vm();

        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i32(Opcode::load_const, 0);
        writer.write_opcode(Opcode::ret);
        let handled_sym = vm.heap.symbol("handled");
        let mut handler = CompiledCode::new("handler", writer.to_words());
        handler.consts = vec![handled_sym];
        handler.required = 1;
        let handler_ref = alloc_code(&mut vm, handler);

        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i32(Opcode::load_const_push, 0);
        writer.write_opcode_i32(Opcode::global_ref, 0);
        writer.write_opcode_c(Opcode::tail_call, 1);
        writer.write_opcode(Opcode::ret);
        let x_sym = vm.heap.symbol("x");
        let raise_slot = global_slot(&mut vm, "raise");
        let mut raiser = CompiledCode::new("raiser", writer.to_words());
        raiser.consts = vec![x_sym];
        raiser.globals = vec![raise_slot];
        let raiser_ref = alloc_code(&mut vm, raiser);

        let mut writer = BytecodeWriter::new();
        let pre = writer.write_opcode_i32(Opcode::pre_call, 0);
        writer.write_opcode_i32(Opcode::make_closure, 0);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::make_closure, 1);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::global_ref, 0);
        writer.write_opcode_c(Opcode::call, 2);
        let resume = writer.write_opcode(Opcode::ret);
        writer.patch_extension(pre, resume as u32);

        let weh_slot = global_slot(&mut vm, "with-exception-handler");
        let mut main = CompiledCode::new("main", writer.to_words());
        main.consts = vec![Value::Obj(handler_ref), Value::Obj(raiser_ref)];
        main.globals = vec![weh_slot];
        let program = alloc_code(&mut vm, main);

        let result = eval_rec(&mut vm, program).unwrap();
        assert_eq!(result, handled_sym);
        // the handler swap was wound back
        assert_eq!(vm.exception_handler, Value::False);
    }

    #[test]
    fn test_handler_returning_on_serious_condition_is_an_error() {
        // pesudo code:
        //
        // (with-exception-handler
        //     (lambda (e) 'ignored)
        //     (lambda () (error "boom")))
        //
        // error conditions are not continuable; a handler that returns
        // anyway raises a fresh error.
        let mut vm = new_vm();

        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i32(Opcode::load_const, 0);
        writer.write_opcode(Opcode::ret);
        let ignored_sym = vm.heap.symbol("ignored");
        let mut handler = CompiledCode::new("handler", writer.to_words());
        handler.consts = vec![ignored_sym];
        handler.required = 1;
        let handler_ref = alloc_code(&mut vm, handler);

        let mut writer = BytecodeWriter::new();
        writer.write_opcode_i32(Opcode::load_const_push, 0);
        writer.write_opcode_i32(Opcode::global_ref, 0);
        writer.write_opcode_c(Opcode::tail_call, 1);
        writer.write_opcode(Opcode::ret);
        let boom = vm.heap.alloc_string("boom");
        let error_slot = global_slot(&mut vm, "error");
        let mut raiser = CompiledCode::new("raiser", writer.to_words());
        raiser.consts = vec![boom];
        raiser.globals = vec![error_slot];
        let raiser_ref = alloc_code(&mut vm, raiser);

        let mut writer = BytecodeWriter::new();
        let pre = writer.write_opcode_i32(Opcode::pre_call, 0);
        writer.write_opcode_i32(Opcode::make_closure, 0);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::make_closure, 1);
        writer.write_opcode(Opcode::push);
        writer.write_opcode_i32(Opcode::global_ref, 0);
        writer.write_opcode_c(Opcode::call, 2);
        let resume = writer.write_opcode(Opcode::ret);
        writer.patch_extension(pre, resume as u32);

        let weh_slot = global_slot(&mut vm, "with-exception-handler");
        let mut main = CompiledCode::new("main", writer.to_words());
        main.consts = vec![Value::Obj(handler_ref), Value::Obj(raiser_ref)];
        main.globals = vec![weh_slot];
        let program = alloc_code(&mut vm, main);

        let packet = safe_eval(&mut vm, program);
        let exception = packet.exception.expect("the returning handler is an error");
        let condition = vm.heap.condition(exception).unwrap();
        assert_eq!(condition.kind, ConditionKind::NonContinuableReturn);
    }
}
