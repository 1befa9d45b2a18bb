// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

// the interpreter loop and the host boundary
// ------------------------------------------
//
// `run_loop` fetches and dispatches packed instruction words until the
// current continuation is exhausted or a boundary frame is reached.
// between any two instructions it honors the attention flags.
//
// `eval_inner` is the border gate: every host-to-interpreter call goes
// through it. it pushes a boundary continuation frame, installs the
// program, pushes a host-stack record (with the thread's signal mask),
// and runs the loop. escape signals — reinstated continuations and
// raised errors — unwind to the record that can consume them; a record
// that cannot pops itself and re-raises outward, which is the rendition
// of the original longjmp chain.

use lyra_context::{
    heap::{ConditionKind, HeapObj, ObjRef},
    stack::{ContPtr, ResumePoint, CONT_FRAME_WORDS},
    value::Value,
    vm::{CodePos, Vm},
    EscapeSignal, VmResult,
};
use lyra_isa::{
    bytecode_writer::BytecodeWriter, decode_opcode_num, opcode::Opcode, MAX_VALUES,
};

use crate::{
    attention::process_queued_requests,
    control::{self, exception::with_error_handler},
    instruction_handler::{get_instruction_handler, HandleResult},
    raise_condition,
    subr::make_subr,
};

/// the outcome of a guarded evaluation: either the produced values or
/// the condition that escaped.
#[derive(Debug)]
pub struct EvalPacket {
    pub results: Vec<Value>,
    pub exception: Option<Value>,
}

pub fn run_loop(vm: &mut Vm) -> VmResult<()> {
    use std::sync::atomic::Ordering;

    loop {
        if vm.attention.attention.load(Ordering::Relaxed) {
            // synthesize a continuation at the current pc, process the
            // queue, and pop: the restore continuation parks the pc at
            // the return fragment, so the pending `ret` pops the
            // synthesized frame and execution resumes seamlessly
            vm.check_stack(CONT_FRAME_WORDS);
            vm.push_cont(ResumePoint::Code(vm.pc));
            process_queued_requests(vm)?;
            vm.pop_cont()?;
            continue;
        }

        let word = vm.fetch_word();
        let handler = get_instruction_handler(decode_opcode_num(word));
        match handler(vm, word) {
            HandleResult::Next => {}
            HandleResult::Jump(target) => vm.pc.ip = target,
            HandleResult::Resume => {}
            HandleResult::End => break Ok(()),
            HandleResult::Escape(signal) => break Err(signal),
        }
    }
}

/// the border gate. `program` becomes the base compiled code; `codevec`
/// optionally overrides the executed vector (used by recursive apply,
/// whose fragment runs against the caller's base).
pub fn eval_inner(vm: &mut Vm, program: ObjRef, codevec: Option<ObjRef>) -> VmResult<Value> {
    let prev_pc = vm.pc;

    vm.check_stack(CONT_FRAME_WORDS);
    vm.push_cont(ResumePoint::Boundary);
    vm.base = Some(program);
    match codevec {
        Some(code) => {
            vm.pc = CodePos { code, ip: 0 };
        }
        None => {
            vm.pc = CodePos {
                code: program,
                ip: 0,
            };
            let max_stack = vm.heap.code(program).max_stack;
            vm.check_stack(max_stack);
        }
    }

    let record_id = vm.push_cstack();
    let record_index = vm.cstacks.len() - 1;

    let mut pending: Option<EscapeSignal> = None;
    loop {
        let outcome = match pending.take() {
            Some(signal) => Err(signal),
            None => run_loop(vm),
        };

        match outcome {
            Ok(()) => {
                let record_cont = vm.cstacks[record_index].cont;
                if vm.cont == record_cont || matches!(vm.cont, ContPtr::Null) {
                    if matches!(vm.cont, ContPtr::Null) {
                        // a partial continuation ran out; the suspended
                        // rest of the computation is the record's
                        // boundary continuation
                        vm.cont = record_cont;
                    }
                    vm.pop_boundary_frame();
                    vm.pc = prev_pc;
                    vm.cstacks.pop();
                    return Ok(vm.val0);
                }

                // a ghost continuation tried to return to host frames
                // that no longer exist
                match raise_condition(
                    vm,
                    ConditionKind::GhostContinuation,
                    "attempt to return from a ghost continuation",
                    vec![],
                ) {
                    Ok(_) => unreachable!("Ghost-continuation conditions do not continue."),
                    Err(signal) => {
                        pending = Some(signal);
                        continue;
                    }
                }
            }
            Err(signal) => {
                vm.cstacks[record_index].sig_mask.restore();
                match signal {
                    EscapeSignal::Continuation { ep, args } => {
                        if vm.heap.escape_point(ep).cstack == Some(record_id) {
                            let handlers = control::cont::calculate_handlers(vm, ep);
                            // force popping the continuation on restart
                            vm.pc = vm.return_pos();
                            match control::cont::throw_cont_body(vm, handlers, ep, args) {
                                Ok(value) => {
                                    vm.val0 = value;
                                    continue;
                                }
                                Err(inner) => {
                                    pending = Some(inner);
                                    continue;
                                }
                            }
                        }
                        // not ours: pop this record and re-raise outward
                        vm.cont = vm.cstacks[record_index].cont;
                        vm.pop_boundary_frame();
                        vm.cstacks.pop();
                        return Err(signal);
                    }
                    EscapeSignal::Error { ep, condition } => {
                        let at_this_level = match ep {
                            Some(ep_ref) => {
                                vm.heap.escape_point(ep_ref).cstack == Some(record_id)
                            }
                            None => false,
                        };
                        if at_this_level {
                            if let Some(ep_ref) = ep {
                                // the default handler already delivered
                                // the handler's values; resume at the
                                // escape point's continuation
                                vm.cont = vm.heap.escape_point(ep_ref).cont;
                            }
                            vm.pc = vm.return_pos();
                            continue;
                        }
                        if vm.cstacks.len() == 1 {
                            // the outermost record: nobody can capture
                            // this error, and the dynamic context is
                            // already rewound
                            std::process::exit(70);
                        }
                        vm.cont = vm.cstacks[record_index].cont;
                        vm.pop_boundary_frame();
                        vm.cstacks.pop();
                        return Err(EscapeSignal::Error { ep, condition });
                    }
                }
            }
        }
    }
}

/// recursive evaluation of a compiled program. exceptions are not
/// captured; further results stay in the value registers.
pub fn eval_rec(vm: &mut Vm, program: ObjRef) -> VmResult<Value> {
    vm.num_vals = 1;
    eval_inner(vm, program, None)
}

/// recursive application: the procedure and arguments are pre-placed in
/// the value registers and a two-word `values_apply` fragment performs
/// the call. returns the primary result.
pub fn apply_rec(vm: &mut Vm, proc: Value, args: &[Value]) -> VmResult<Value> {
    let nargs = args.len();
    for (i, arg) in args.iter().enumerate() {
        if i == MAX_VALUES - 1 {
            // fold the remaining arguments into the last register
            let rest = vm.heap.list(&args[i..]);
            vm.vals[i] = rest;
            break;
        }
        vm.vals[i] = *arg;
    }
    vm.val0 = proc;

    let fragment = {
        let mut writer = BytecodeWriter::new();
        writer.write_opcode_c(Opcode::values_apply, nargs as u16);
        writer.write_opcode(Opcode::ret);
        vm.heap.alloc(HeapObj::Code(lyra_context::code::CompiledCode::new(
            "%apply-rec",
            writer.to_words(),
        )))
    };

    let program = vm.base.unwrap_or(vm.internal_apply_code);
    eval_inner(vm, program, Some(fragment))
}

fn packet_from_registers(vm: &mut Vm) -> EvalPacket {
    let mut results = Vec::with_capacity(vm.num_vals);
    for i in 0..vm.num_vals {
        results.push(vm.get_result(i));
    }
    EvalPacket {
        results,
        exception: None,
    }
}

fn safe_apply_thunk(vm: &mut Vm, _args: &[Value], data: Value) -> VmResult<Value> {
    let Some(data_ref) = data.as_obj() else {
        panic!("Corrupt safe-apply thunk.");
    };
    let (proc, args_list) = match vm.heap.get(data_ref) {
        HeapObj::Vector(elements) => (elements[0], elements[1]),
        _ => panic!("Corrupt safe-apply thunk."),
    };
    let args = match vm.heap.list_to_vec(args_list) {
        Ok(args) => args,
        Err(_) => {
            return raise_condition(
                vm,
                ConditionKind::ImproperList,
                "improper list not allowed",
                vec![args_list],
            )
        }
    };
    vm.arrange_apply(proc, &args)
}

fn safe_apply_handler(vm: &mut Vm, args: &[Value], data: Value) -> VmResult<Value> {
    let Some(cell_ref) = data.as_obj() else {
        panic!("Corrupt safe-apply handler.");
    };
    match vm.heap.get_mut(cell_ref) {
        HeapObj::Vector(elements) => {
            elements[0] = Value::True;
            elements[1] = args[0];
        }
        _ => panic!("Corrupt safe-apply handler."),
    }
    Ok(Value::Unspecified)
}

fn safe_run(vm: &mut Vm, args: &[Value], _data: Value) -> VmResult<Value> {
    with_error_handler(vm, args[0], args[1], false)
}

/// apply with exceptions captured: the packet carries either the values
/// or the condition.
pub fn safe_apply(vm: &mut Vm, proc: Value, args: &[Value]) -> EvalPacket {
    let args_list = vm.heap.list(args);
    let cell_ref = vm
        .heap
        .alloc(HeapObj::Vector(vec![Value::False, Value::False]));
    let thunk_data = vm.heap.alloc(HeapObj::Vector(vec![proc, args_list]));

    let thunk = make_subr(
        vm,
        "%safe-apply-thunk",
        0,
        false,
        safe_apply_thunk,
        Value::Obj(thunk_data),
    );
    let handler = make_subr(
        vm,
        "%safe-apply-handler",
        1,
        false,
        safe_apply_handler,
        Value::Obj(cell_ref),
    );
    let runner = make_subr(vm, "%safe-run", 2, false, safe_run, Value::False);

    match apply_rec(vm, runner, &[handler, thunk]) {
        Ok(_) => {
            let caught = match vm.heap.get(cell_ref) {
                HeapObj::Vector(elements) => {
                    if elements[0].is_true() {
                        Some(elements[1])
                    } else {
                        None
                    }
                }
                _ => None,
            };
            match caught {
                Some(condition) => EvalPacket {
                    results: Vec::new(),
                    exception: Some(condition),
                },
                None => packet_from_registers(vm),
            }
        }
        Err(EscapeSignal::Error { condition, .. }) => EvalPacket {
            results: Vec::new(),
            exception: Some(condition),
        },
        Err(EscapeSignal::Continuation { .. }) => {
            let condition = vm.heap.alloc_condition(
                ConditionKind::Error,
                "a continuation escaped through a guarded application",
                vec![],
            );
            EvalPacket {
                results: Vec::new(),
                exception: Some(condition),
            }
        }
    }
}

/// evaluate a compiled program with exceptions captured.
pub fn safe_eval(vm: &mut Vm, program: ObjRef) -> EvalPacket {
    let env = vm.get_env();
    let closure_ref = vm.heap.alloc(HeapObj::Closure(lyra_context::heap::Closure {
        code: program,
        env,
    }));
    safe_apply(vm, Value::Obj(closure_ref), &[])
}
