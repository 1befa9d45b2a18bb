// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

use lyra_isa::InstructionWord;

use crate::{heap::ObjRef, value::Value};

/// a slot in the global-reference table of a compiled-code object.
///
/// the original implementation memoizes a resolved global by overwriting
/// the operand word in the instruction stream. code vectors here are
/// immutable and shared, so the global operand names a slot instead and
/// the slot caches the resolved binding after the first lookup — the
/// same O(1) steady state.
pub struct GlobalSlot {
    /// symbol
    pub name: ObjRef,
    /// the resolved binding, memoized on first execution
    pub cached: Option<ObjRef>,
}

/// one entry of the debug-info table: source text for the instructions
/// from `ip` onward (until the next entry).
pub struct DebugEntry {
    pub ip: usize,
    pub source: String,
}

/// an immutable unit of compiled bytecode.
pub struct CompiledCode {
    pub name: String,
    pub words: Vec<InstructionWord>,
    /// literal constants referenced by `load_const` and `make_closure`
    pub consts: Vec<Value>,
    /// global-reference slots (see `GlobalSlot`)
    pub globals: Vec<GlobalSlot>,
    /// the module the code was compiled in; global references resolve
    /// here
    pub module: usize,
    /// the stack headroom the interpreter guarantees before entering
    /// this code
    pub max_stack: usize,
    pub required: u16,
    pub optional: bool,
    /// instruction offsets mapped to source locations, innermost last
    pub debug_info: Vec<DebugEntry>,
}

impl CompiledCode {
    pub fn new(name: impl Into<String>, words: Vec<InstructionWord>) -> Self {
        Self {
            name: name.into(),
            words,
            consts: Vec::new(),
            globals: Vec::new(),
            module: 0,
            max_stack: 32,
            required: 0,
            optional: false,
            debug_info: Vec::new(),
        }
    }

    /// the debug entry in force at `ip`. the program counter has already
    /// been stepped past the instruction when this is consulted, so the
    /// entry at or before `ip - 1` wins.
    pub fn source_info(&self, ip: usize) -> Option<&str> {
        let target = ip.saturating_sub(1);
        self.debug_info
            .iter()
            .rev()
            .find(|entry| entry.ip <= target)
            .map(|entry| entry.source.as_str())
    }
}
