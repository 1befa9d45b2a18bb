// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

// instances on OS threads
// -----------------------
//
// each interpreter instance is bound to exactly one OS thread for its
// whole life. a controller on another thread reaches the instance only
// through the shared attention flags and the state condition variable;
// the single-word request stores are observed at the instance's next
// inter-instruction check.

use std::{
    cell::Cell,
    sync::Arc,
    thread::JoinHandle,
};

use lyra_context::{
    settings::VmSettings,
    vm::{AttentionFlags, Vm, VmState, VmStateCell},
};

use crate::{process::EvalPacket, subr::install_core_subrs};

thread_local! {
    // the instance bound to this thread; 0 outside any instance. looked
    // up only at the outermost host entry, never inside primitives.
    static CURRENT_VM_ID: Cell<u64> = const { Cell::new(0) };
}

pub fn current_vm_id() -> u64 {
    CURRENT_VM_ID.with(|cell| cell.get())
}

/// the controller half of a spawned instance.
pub struct VmController {
    pub attention: Arc<AttentionFlags>,
    pub state: Arc<VmStateCell>,
}

impl VmController {
    /// ask the instance to pause cooperatively. the instance observes
    /// the request at its next inter-instruction check.
    pub fn request_stop(&self) {
        self.attention.request_stop();
    }

    pub fn request_signal(&self) {
        self.attention.request_signal();
    }

    pub fn request_finalizer(&self) {
        self.attention.request_finalizer();
    }

    /// wait until the instance parks (or finishes). returns the state
    /// that ended the wait.
    pub fn wait_stopped(&self) -> VmState {
        let mut state = self.state.state.lock().unwrap();
        while matches!(*state, VmState::New | VmState::Runnable) {
            state = self.state.cond.wait(state).unwrap();
        }
        *state
    }

    /// release a stopped instance.
    pub fn resume(&self) {
        let mut state = self.state.state.lock().unwrap();
        if *state == VmState::Stopped {
            *state = VmState::Runnable;
            self.state.cond.notify_all();
        }
    }
}

pub struct VmHandle {
    pub controller: VmController,
    join_handle: JoinHandle<EvalPacket>,
}

impl VmHandle {
    pub fn join(self) -> EvalPacket {
        match self.join_handle.join() {
            Ok(packet) => packet,
            Err(_) => panic!("Instance thread panicked."),
        }
    }
}

/// start a fresh instance on its own OS thread with the core primitives
/// installed, run `body` against it, and report the packet through the
/// handle.
pub fn spawn_instance<F>(settings: VmSettings, body: F) -> VmHandle
where
    F: FnOnce(&mut Vm) -> EvalPacket + Send + 'static,
{
    let attention = Arc::new(AttentionFlags::default());
    let state = Arc::new(VmStateCell::new(VmState::New));
    let controller = VmController {
        attention: attention.clone(),
        state: state.clone(),
    };

    let join_handle = std::thread::spawn(move || {
        let mut vm = Vm::with_control(settings, attention, state);
        install_core_subrs(&mut vm);
        CURRENT_VM_ID.with(|cell| cell.set(vm.id));

        vm.state.set(VmState::Runnable);
        let packet = body(&mut vm);
        vm.state.set(VmState::Terminated);
        CURRENT_VM_ID.with(|cell| cell.set(0));
        packet
    });

    VmHandle {
        controller,
        join_handle,
    }
}
