// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

use lyra_context::{
    heap::{ConditionKind, HeapObj},
    stack::{ContPtr, ResumePoint, ENV_HEADER_WORDS, CONT_FRAME_WORDS},
    value::Value,
    vm::{CodePos, Vm},
};
use lyra_isa::{decode_c, InstructionWord, MAX_VALUES};

use crate::{raise_condition, wna};

use super::HandleResult;

pub fn make_closure(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    // (param const_index:u32) -> closure
    //
    // the environment chain is promoted first: the closure may outlive
    // the stack frames it closes over.
    let const_index = vm.fetch_word() as usize;
    let code_value = vm.heap.code(vm.pc.code).consts[const_index];
    let Some(code_ref) = code_value.as_obj() else {
        panic!("Closure constant is not a compiled-code object.");
    };
    let env = vm.get_env();
    let closure_ref = vm.heap.alloc(HeapObj::Closure(lyra_context::heap::Closure {
        code: code_ref,
        env,
    }));
    vm.val0 = Value::Obj(closure_ref);
    vm.num_vals = 1;
    HandleResult::Next
}

pub fn pre_call(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    // (param resume_ip:u32) -> ()
    let resume_ip = vm.fetch_word() as usize;
    vm.check_stack(CONT_FRAME_WORDS);
    let resume = ResumePoint::Code(CodePos {
        code: vm.pc.code,
        ip: resume_ip,
    });
    vm.push_cont(resume);
    HandleResult::Next
}

pub fn call(vm: &mut Vm, word: InstructionWord) -> HandleResult {
    // (c: argument_count) (operand proc) -> (values)
    do_call(vm, decode_c(word) as usize)
}

pub fn tail_call(vm: &mut Vm, word: InstructionWord) -> HandleResult {
    // like `call`, after shifting the argument block down over the
    // abandoned frame. the shift bounds tail-recursive storage.
    let nargs = decode_c(word) as usize;
    vm.tail_shift(nargs);
    do_call(vm, nargs)
}

pub fn ret(vm: &mut Vm, _word: InstructionWord) -> HandleResult {
    // return control to the host at a boundary frame or when the
    // continuation chain is spent.
    if matches!(vm.cont, ContPtr::Null) || vm.is_boundary_frame(vm.cont) {
        return HandleResult::End;
    }
    match vm.pop_cont() {
        Ok(()) => HandleResult::Resume,
        Err(signal) => HandleResult::Escape(signal),
    }
}

pub fn values_apply(vm: &mut Vm, word: InstructionWord) -> HandleResult {
    // (c: argument_count) (operand proc) -> (values)
    //
    // the recursive-apply entry: the arguments were pre-placed in the
    // value registers by host code. when the count reaches the register
    // limit the last register holds a list of the remaining arguments.
    let nargs = decode_c(word) as usize;
    let mut pushed = 0;

    for i in 0..nargs {
        if i == MAX_VALUES - 1 {
            let mut rest = vm.vals[i];
            loop {
                match rest {
                    Value::Nil => break,
                    _ => match vm.heap.pair(rest).map(|p| (p.car, p.cdr)) {
                        Some((car, cdr)) => {
                            vm.check_stack(1);
                            vm.push_arg(car);
                            pushed += 1;
                            rest = cdr;
                        }
                        None => {
                            return match raise_condition(
                                vm,
                                ConditionKind::ImproperList,
                                "improper list not allowed in apply",
                                vec![vm.vals[i]],
                            ) {
                                Ok(_) => HandleResult::Resume,
                                Err(signal) => HandleResult::Escape(signal),
                            };
                        }
                    },
                }
            }
            break;
        }
        vm.check_stack(1);
        let value = vm.vals[i];
        vm.push_arg(value);
        pushed += 1;
    }

    do_call(vm, pushed)
}

/// apply the procedure in the accumulator to the topmost `nargs`
/// argument-block values.
///
/// a closure gets an environment frame built from the block and the pc
/// jumps to its code. a subr runs at once: the pc is parked at the
/// return fragment first, so a subr that arranges a follow-up
/// application (`arrange_apply`) overrides it and the loop performs the
/// call as the subr's tail.
fn do_call(vm: &mut Vm, nargs: usize) -> HandleResult {
    let proc = vm.val0;

    let callable = proc
        .as_obj()
        .map(|obj_ref| match vm.heap.get(obj_ref) {
            HeapObj::Closure(closure) => {
                let code = vm.heap.code(closure.code);
                Some(Callable::Closure {
                    code: closure.code,
                    env: closure.env,
                    required: code.required,
                    optional: code.optional,
                    max_stack: code.max_stack,
                })
            }
            HeapObj::Subr(subr) => Some(Callable::Subr {
                func: subr.func,
                required: subr.required,
                optional: subr.optional,
                data: subr.data,
            }),
            _ => None,
        })
        .flatten();

    let Some(callable) = callable else {
        let rendered = vm.heap.format_value(proc);
        return match raise_condition(
            vm,
            ConditionKind::WrongType,
            format!("attempt to apply a non-procedure: {}", rendered),
            vec![proc],
        ) {
            Ok(value) => {
                vm.val0 = value;
                HandleResult::Next
            }
            Err(signal) => HandleResult::Escape(signal),
        };
    };

    match callable {
        Callable::Closure {
            code,
            env,
            required,
            optional,
            max_stack,
        } => {
            if let Some(result) = check_arity(vm, proc, nargs, required, optional) {
                return result;
            }

            if optional {
                // fold the excess arguments into a rest list
                let rest_count = nargs - required as usize;
                let rest = {
                    let start = vm.stack.sp - rest_count;
                    let extras = vm.stack.values(start, vm.stack.sp);
                    vm.stack.sp = start;
                    vm.heap.list(&extras)
                };
                vm.check_stack(1);
                vm.push_arg(rest);
            }

            vm.check_stack(max_stack + ENV_HEADER_WORDS);
            vm.finish_env(proc, env);
            vm.base = Some(code);
            vm.pc = CodePos { code, ip: 0 };
            HandleResult::Resume
        }
        Callable::Subr {
            func,
            required,
            optional,
            data,
        } => {
            if let Some(result) = check_arity(vm, proc, nargs, required, optional) {
                return result;
            }

            let mut args = vm.take_args(nargs);
            if optional {
                let extras = args.split_off(required as usize);
                let rest = vm.heap.list(&extras);
                args.push(rest);
            }

            vm.pc = vm.return_pos();
            vm.num_vals = 1;
            match func(vm, &args, data) {
                Ok(value) => {
                    vm.val0 = value;
                    HandleResult::Resume
                }
                Err(signal) => HandleResult::Escape(signal),
            }
        }
    }
}

enum Callable {
    Closure {
        code: lyra_context::heap::ObjRef,
        env: lyra_context::stack::EnvPtr,
        required: u16,
        optional: bool,
        max_stack: usize,
    },
    Subr {
        func: lyra_context::vm::SubrFn,
        required: u16,
        optional: bool,
        data: Value,
    },
}

fn check_arity(
    vm: &mut Vm,
    proc: Value,
    given: usize,
    required: u16,
    optional: bool,
) -> Option<HandleResult> {
    let mismatch = if optional {
        given < required as usize
    } else {
        given != required as usize
    };
    if mismatch {
        Some(match wna(vm, proc, required, given) {
            Ok(value) => {
                vm.val0 = value;
                HandleResult::Next
            }
            Err(signal) => HandleResult::Escape(signal),
        })
    } else {
        None
    }
}
