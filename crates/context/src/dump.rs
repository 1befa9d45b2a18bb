// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

use std::fmt::Write;

use lyra_isa::bytecode_reader::format_bytecode_as_text;

use crate::{
    stack::{ContPtr, EnvPtr},
    vm::Vm,
};

/// dump the full interpreter state: registers, environment chain,
/// continuation chain, host-stack records, escape points, and the
/// dynamic-handler list. intended for diagnostics, not for parsing.
pub fn dump_vm(vm: &Vm, out: &mut dyn Write) -> std::fmt::Result {
    writeln!(out, "VM {} ({})", vm.id, vm.name)?;
    writeln!(
        out,
        "   pc: {}+0x{:04x}",
        vm.heap.code(vm.pc.code).name,
        vm.pc.ip
    )?;
    writeln!(
        out,
        "   sp: {}  argp: {}  [0-{}]",
        vm.stack.sp,
        vm.stack.argp,
        vm.stack.capacity()
    )?;
    writeln!(out, " val0: {}  num_vals: {}", vm.heap.format_value(vm.val0), vm.num_vals)?;

    writeln!(out, " envs:")?;
    let mut env = vm.env;
    loop {
        match env {
            EnvPtr::Null => break,
            EnvPtr::Stack(h) => {
                let size = vm.stack.env_size(h);
                writeln!(out, "   stack:0x{:04x} size={}", h, size)?;
                write!(out, "       [")?;
                for i in 0..size as usize {
                    write!(out, " {}", vm.heap.format_value(vm.stack.env_data(h, i)))?;
                }
                writeln!(out, " ]")?;
                env = vm.stack.env_up(h);
            }
            EnvPtr::Heap(obj_ref) => {
                let frame = vm.heap.env_frame(obj_ref);
                writeln!(out, "   heap:0x{:04x} size={}", obj_ref.0, frame.data.len())?;
                write!(out, "       [")?;
                for value in &frame.data {
                    write!(out, " {}", vm.heap.format_value(*value))?;
                }
                writeln!(out, " ]")?;
                env = frame.up;
            }
        }
    }

    writeln!(out, "conts:")?;
    let mut cont = vm.cont;
    loop {
        match cont {
            ContPtr::Null => break,
            ContPtr::Stack(h) => {
                writeln!(
                    out,
                    "   stack:0x{:04x} argp={:?} size={} resume={:?}",
                    h,
                    vm.stack.cont_argp(h),
                    vm.stack.cont_size(h),
                    vm.stack.cont_resume(h)
                )?;
                cont = vm.stack.cont_prev(h);
            }
            ContPtr::Heap(obj_ref) => {
                let frame = vm.heap.cont_frame(obj_ref);
                writeln!(
                    out,
                    "   heap:0x{:04x} host={} size={} resume={:?}",
                    obj_ref.0,
                    frame.host,
                    frame.data.len(),
                    frame.resume
                )?;
                cont = frame.prev;
            }
        }
    }

    writeln!(out, "host-stack records:")?;
    for record in &vm.cstacks {
        writeln!(out, "   id={} cont={:?}", record.id, record.cont)?;
    }

    writeln!(out, "escape points:")?;
    let mut ep = vm.escape_point;
    while let Some(ep_ref) = ep {
        let escape_point = vm.heap.escape_point(ep_ref);
        writeln!(
            out,
            "   0x{:04x}: cstack={:?} handler={}",
            ep_ref.0,
            escape_point.cstack,
            vm.heap.format_value(escape_point.ehandler)
        )?;
        ep = escape_point.prev;
    }

    writeln!(out, "dynamic handlers: {}", vm.heap.format_value(vm.handlers))?;

    if let Some(base) = vm.base {
        let code = vm.heap.code(base);
        writeln!(out, "code ({}):", code.name)?;
        out.write_str(&format_bytecode_as_text(&code.words))?;
    }

    Ok(())
}
