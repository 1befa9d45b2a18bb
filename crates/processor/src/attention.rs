// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

// queued-request processing
// -------------------------
//
// requests (signals, finalizers, stop) are posted by other threads as
// attention flags and processed between two instructions, when the
// interpreter state is consistent. conceptually the processing is
// inserted before the current continuation: the value registers are
// saved into a host continuation first, so any scheme code the
// collaborator hooks invoke sees a normal continuation environment and
// the interrupted computation resumes with its values intact.

use std::sync::atomic::Ordering;

use lyra_context::{
    value::Value,
    vm::{Vm, VmState},
    VmResult,
};

pub fn process_queued_requests(vm: &mut Vm) -> VmResult<()> {
    // preserve the current values
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
    let val0 = vm.val0;
    vm.push_cc(restore_values_cc, &[Value::Int(num_vals as i64), val0, extra]);

    // turning the request flag off first is safe: a request posted from
    // here on is observed at the next inter-instruction check
    vm.attention.attention.store(false, Ordering::SeqCst);

    if vm.attention.signal_pending.swap(false, Ordering::SeqCst) {
        if let Some(hook) = vm.hooks.sig_check {
            hook(vm)?;
        }
    }
    if vm.attention.finalizer_pending.swap(false, Ordering::SeqCst) {
        if let Some(hook) = vm.hooks.finalizer_run {
            hook(vm)?;
        }
    }

    // a stop request parks the instance under its lock until a
    // controller resumes it
    if vm.attention.stop_request.load(Ordering::SeqCst) {
        let cell = vm.state.clone();
        let mut state = cell.state.lock().unwrap();
        // double check: the request may have been withdrawn
        if vm.attention.stop_request.swap(false, Ordering::SeqCst) {
            *state = VmState::Stopped;
            cell.cond.notify_all();
            while *state == VmState::Stopped {
                // here the inspector thread examines the instance
                state = cell.cond.wait(state).unwrap();
            }
        }
    }

    Ok(())
}

fn restore_values_cc(vm: &mut Vm, _val0: Value, data: &[Value]) -> VmResult<Value> {
    let Value::Int(num_vals) = data[0] else {
        panic!("Corrupt attention restore frame.");
    };
    let num_vals = num_vals as usize;

    vm.num_vals = num_vals;
    if num_vals > 1 {
        let mut rest = data[2];
        for i in 0..num_vals - 1 {
            let Some((car, cdr)) = vm.heap.pair(rest).map(|p| (p.car, p.cdr)) else {
                panic!("Corrupt attention restore frame.");
            };
            vm.vals[i] = car;
            rest = cdr;
        }
    }
    Ok(data[1])
}

#[cfg(test)]
mod tests {
    use lyra_context::{settings::VmSettings, value::Value, vm::Vm, VmResult};

    use crate::attention::process_queued_requests;

    fn clobber_values(vm: &mut Vm) -> VmResult<()> {
        vm.val0 = Value::Int(999);
        vm.num_vals = 1;
        Ok(())
    }

    #[test]
    fn test_values_survive_attention_processing() {
        let mut vm = Vm::new(VmSettings::default());
        vm.hooks.sig_check = Some(clobber_values);

        vm.set_values(&[Value::Int(1), Value::Int(2), Value::Int(3)])
            .unwrap();

        vm.attention.request_signal();
        assert!(vm.attention.attention.load(std::sync::atomic::Ordering::SeqCst));

        process_queued_requests(&mut vm).unwrap();

        // the hook ran and clobbered the registers
        assert_eq!(vm.val0, Value::Int(999));

        // popping the restore continuation brings the values back
        vm.pop_cont().unwrap();
        assert_eq!(vm.val0, Value::Int(1));
        assert_eq!(vm.num_vals, 3);
        assert_eq!(vm.get_result(1), Value::Int(2));
        assert_eq!(vm.get_result(2), Value::Int(3));

        // the request flags are spent
        assert!(!vm.attention.attention.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!vm
            .attention
            .signal_pending
            .load(std::sync::atomic::Ordering::SeqCst));
    }
}
