// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

// the per-instance interpreter state
// ----------------------------------
//
// one `Vm` is bound to one OS thread. other threads communicate with it
// only through the attention flags (single-word stores), the port locks,
// and the state condition variable.
//
// the register set:
//
// - `pc`    the next instruction (compiled code + word offset)
// - `base`  the compiled code of the current procedure; `pc` may point
//           into a detached fragment (apply, return) while `base` keeps
//           the procedure for debug information and global resolution
// - `val0`  the accumulator: primary result of the last instruction
// - `vals`  auxiliary registers for values 2..N, `num_vals` the count
// - `env`   the current environment frame
// - `cont`  the current continuation frame
// - the argument pointer and stack pointer live in the value stack
//
// stack discipline: whenever headroom may run out, `check_stack` promotes
// every live frame to the heap (`save_stack`) and compacts, leaving only
// the argument block under construction. the promotion passes leave
// forwarding frames behind and patch every external collection of frame
// pointers (the registers, the host-stack records, and both escape-point
// chains) before the next instruction runs.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use lyra_isa::{bytecode_writer::BytecodeWriter, opcode::Opcode, InstructionWord, MAX_VALUES};

use crate::{
    code::CompiledCode,
    heap::{Heap, HeapContFrame, HeapEnvFrame, HeapObj, ObjRef},
    port::Port,
    settings::VmSettings,
    stack::{ContPtr, EnvPtr, ResumePoint, ValueStack, Word, CONT_FRAME_WORDS},
    value::Value,
    ContextError, VmResult,
};

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// a bytecode position: which compiled code, and the word offset within
/// its vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodePos {
    pub code: ObjRef,
    pub ip: usize,
}

/// a primitive procedure. `data` is the closed-over datum stored in the
/// subr object (e.g. the escape point of a continuation procedure).
pub type SubrFn = fn(vm: &mut Vm, args: &[Value], data: Value) -> VmResult<Value>;

/// a host continuation callback: receives the accumulator and the opaque
/// data words saved in the frame.
pub type CContFn = fn(vm: &mut Vm, val0: Value, data: &[Value]) -> VmResult<Value>;

/// collaborator hooks invoked by the queued-request processor.
pub type HookFn = fn(vm: &mut Vm) -> VmResult<()>;

#[derive(Default)]
pub struct VmHooks {
    pub sig_check: Option<HookFn>,
    pub finalizer_run: Option<HookFn>,
}

/// the cross-thread request flags. setting a request flag and then
/// `attention` is all another thread ever writes; the instance observes
/// the flags at its next inter-instruction check.
#[derive(Default)]
pub struct AttentionFlags {
    pub attention: AtomicBool,
    pub signal_pending: AtomicBool,
    pub finalizer_pending: AtomicBool,
    pub stop_request: AtomicBool,
}

impl AttentionFlags {
    pub fn request_signal(&self) {
        self.signal_pending.store(true, Ordering::SeqCst);
        self.attention.store(true, Ordering::SeqCst);
    }

    pub fn request_finalizer(&self) {
        self.finalizer_pending.store(true, Ordering::SeqCst);
        self.attention.store(true, Ordering::SeqCst);
    }

    pub fn request_stop(&self) {
        self.stop_request.store(true, Ordering::SeqCst);
        self.attention.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    New,
    Runnable,
    Stopped,
    Terminated,
}

/// the instance state guarded by the instance lock, plus the condition
/// variable other threads wait on (e.g. an inspector waiting for the
/// instance to stop).
pub struct VmStateCell {
    pub state: Mutex<VmState>,
    pub cond: Condvar,
}

impl VmStateCell {
    pub fn new(state: VmState) -> Self {
        Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self, new_state: VmState) {
        let mut state = self.state.lock().unwrap();
        *state = new_state;
        self.cond.notify_all();
    }

    pub fn get(&self) -> VmState {
        *self.state.lock().unwrap()
    }
}

/// the saved signal mask of a host-stack record.
#[derive(Clone, Copy)]
pub struct SigMask {
    #[cfg(unix)]
    mask: libc::sigset_t,
}

impl SigMask {
    pub fn capture() -> Self {
        #[cfg(unix)]
        {
            let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
            unsafe {
                libc::pthread_sigmask(libc::SIG_SETMASK, std::ptr::null(), &mut mask);
            }
            Self { mask }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    pub fn restore(&self) {
        #[cfg(unix)]
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.mask, std::ptr::null_mut());
        }
    }
}

/// mirror of one nested host-to-interpreter entry. the record chain is
/// what escapes (captured continuations, errors) unwind across.
pub struct HostStackRecord {
    pub id: u64,
    /// the boundary continuation frame in force when the record was
    /// pushed; updated by stack promotion.
    pub cont: ContPtr,
    pub sig_mask: SigMask,
}

pub struct Module {
    pub name: String,
    /// symbol -> binding
    pub table: HashMap<ObjRef, ObjRef>,
}

#[derive(Default)]
pub struct VmStat {
    pub save_stack_count: u64,
    pub save_stack_time: Duration,
}

pub struct Vm {
    pub id: u64,
    pub name: String,

    pub stack: ValueStack,
    pub env: EnvPtr,
    pub cont: ContPtr,
    pub pc: CodePos,
    pub base: Option<ObjRef>,
    pub val0: Value,
    /// values 2..N travel here; the last slot doubles as the rest-list
    /// slot when recursive apply folds excess arguments
    pub vals: [Value; MAX_VALUES],
    pub num_vals: usize,

    pub heap: Heap,
    pub modules: Vec<Module>,

    /// the dynamic-handler list: (before . after) pairs, innermost first
    pub handlers: Value,
    /// `#f` means the default exception handler
    pub exception_handler: Value,
    pub escape_point: Option<ObjRef>,
    pub floating_ep: Option<ObjRef>,
    pub error_being_reported: bool,

    pub cstacks: Vec<HostStackRecord>,
    next_cstack_id: u64,

    pub attention: Arc<AttentionFlags>,
    pub state: Arc<VmStateCell>,
    pub hooks: VmHooks,

    pub cur_out: Value,
    pub cur_err: Value,

    pub settings: VmSettings,
    pub stat: VmStat,

    /// the one-word `ret` fragment installed as pc when a host
    /// continuation or a subr is about to return
    pub return_code: ObjRef,
    /// per-arity `tail_call n; ret` fragments for tail-arranged apply
    apply_fragments: Vec<ObjRef>,
    /// stands in as `base` when recursive apply is entered without one
    pub internal_apply_code: ObjRef,
}

impl Vm {
    pub fn new(settings: VmSettings) -> Self {
        Self::with_control(
            settings,
            Arc::new(AttentionFlags::default()),
            Arc::new(VmStateCell::new(VmState::Runnable)),
        )
    }

    /// construct an instance sharing externally created control cells,
    /// so a controller on another thread can reach them.
    pub fn with_control(
        settings: VmSettings,
        attention: Arc<AttentionFlags>,
        state: Arc<VmStateCell>,
    ) -> Self {
        let mut heap = Heap::new();

        let return_code = {
            let mut writer = BytecodeWriter::new();
            writer.write_opcode(Opcode::ret);
            heap.alloc(HeapObj::Code(CompiledCode::new("%return", writer.to_words())))
        };

        let apply_fragments = (0..=4)
            .map(|nargs| {
                let mut writer = BytecodeWriter::new();
                writer.write_opcode_c(Opcode::tail_call, nargs as u16);
                writer.write_opcode(Opcode::ret);
                heap.alloc(HeapObj::Code(CompiledCode::new("%apply", writer.to_words())))
            })
            .collect::<Vec<_>>();

        let internal_apply_code = {
            let mut writer = BytecodeWriter::new();
            writer.write_opcode(Opcode::ret);
            heap.alloc(HeapObj::Code(CompiledCode::new(
                "%internal-apply",
                writer.to_words(),
            )))
        };

        let cur_out = Value::Obj(heap.alloc(HeapObj::Port(Arc::new(Port::stdout()))));
        let cur_err = Value::Obj(heap.alloc(HeapObj::Port(Arc::new(Port::stderr()))));

        let modules = vec![Module {
            name: "user".to_owned(),
            table: HashMap::new(),
        }];

        Self {
            id: NEXT_VM_ID.fetch_add(1, Ordering::SeqCst),
            name: settings.name.clone(),
            stack: ValueStack::new(settings.stack_size_in_words),
            env: EnvPtr::Null,
            cont: ContPtr::Null,
            pc: CodePos {
                code: return_code,
                ip: 0,
            },
            base: None,
            val0: Value::Unspecified,
            vals: [Value::Unspecified; MAX_VALUES],
            num_vals: 1,
            heap,
            modules,
            handlers: Value::Nil,
            exception_handler: Value::False,
            escape_point: None,
            floating_ep: None,
            error_being_reported: false,
            cstacks: Vec::new(),
            next_cstack_id: 1,
            attention,
            state,
            hooks: VmHooks::default(),
            cur_out,
            cur_err,
            settings,
            stat: VmStat::default(),
            return_code,
            apply_fragments,
            internal_apply_code,
        }
    }

    // instruction stream

    #[inline]
    pub fn fetch_word(&mut self) -> InstructionWord {
        let word = self.heap.code(self.pc.code).words[self.pc.ip];
        self.pc.ip += 1;
        word
    }

    #[inline]
    pub fn return_pos(&self) -> CodePos {
        CodePos {
            code: self.return_code,
            ip: 0,
        }
    }

    /// true when the next instruction is `ret`, i.e. we are in tail
    /// position.
    pub fn in_tail_position(&self) -> bool {
        let code = self.heap.code(self.pc.code);
        code.words
            .get(self.pc.ip)
            .map(|w| lyra_isa::decode_opcode_num(*w) == Opcode::ret as u8)
            .unwrap_or(false)
    }

    // value registers

    pub fn set_values(&mut self, values: &[Value]) -> Result<(), ContextError> {
        if values.len() > MAX_VALUES {
            return Err(ContextError::new(format!(
                "too many values: {} (limit {})",
                values.len(),
                MAX_VALUES
            )));
        }
        match values.split_first() {
            None => {
                self.val0 = Value::Unspecified;
                self.num_vals = 0;
            }
            Some((first, rest)) => {
                self.val0 = *first;
                for (i, value) in rest.iter().enumerate() {
                    self.vals[i] = *value;
                }
                self.num_vals = values.len();
            }
        }
        Ok(())
    }

    pub fn values2(&mut self, val0: Value, val1: Value) -> Value {
        self.num_vals = 2;
        self.vals[0] = val1;
        val0
    }

    pub fn values3(&mut self, val0: Value, val1: Value, val2: Value) -> Value {
        self.num_vals = 3;
        self.vals[0] = val1;
        self.vals[1] = val2;
        val0
    }

    pub fn values4(&mut self, val0: Value, val1: Value, val2: Value, val3: Value) -> Value {
        self.num_vals = 4;
        self.vals[0] = val1;
        self.vals[1] = val2;
        self.vals[2] = val3;
        val0
    }

    pub fn get_num_results(&self) -> usize {
        self.num_vals
    }

    pub fn get_result(&self, index: usize) -> Value {
        if index == 0 {
            self.val0
        } else {
            self.vals[index - 1]
        }
    }

    pub fn set_result(&mut self, value: Value) {
        self.val0 = value;
        self.num_vals = 1;
    }

    /// the current results collected into a list.
    pub fn result_values(&mut self) -> Value {
        let mut results = Vec::with_capacity(self.num_vals);
        for i in 0..self.num_vals {
            results.push(self.get_result(i));
        }
        self.heap.list(&results)
    }

    // stack discipline

    /// ensure `margin` free slots, promoting and compacting if the stack
    /// is short. a stack exactly at capacity triggers the promotion on
    /// the next push.
    pub fn check_stack(&mut self, margin: usize) {
        if self.stack.sp + margin >= self.stack.capacity() {
            self.save_stack();
        }
    }

    #[inline]
    pub fn push_arg(&mut self, value: Value) {
        self.stack.push_value(value);
    }

    /// pop the current argument block into a vector, emptying it.
    pub fn take_args(&mut self, count: usize) -> Vec<Value> {
        let start = self.stack.sp - count;
        let args = self.stack.values(start, self.stack.sp);
        self.stack.sp = start;
        args
    }

    /// finish the argument block into an environment frame with the
    /// given parent.
    pub fn finish_env(&mut self, info: Value, up: EnvPtr) {
        let size = self.stack.sp - self.stack.argp;
        let h = self.stack.push_env_header(up, info, size);
        self.env = EnvPtr::Stack(h);
        self.stack.argp = self.stack.sp;
    }

    /// push a scheme continuation frame capturing the argument block
    /// under construction, then start a fresh block.
    pub fn push_cont(&mut self, resume: ResumePoint) {
        let argp = self.stack.argp;
        let size = self.stack.sp - argp;
        let h = self
            .stack
            .push_cont_header(self.cont, self.env, Some(argp), size, resume, self.base);
        self.cont = ContPtr::Stack(h);
        self.stack.argp = self.stack.sp;
    }

    /// push a host continuation: `callback` will receive the accumulator
    /// plus the opaque `data` words when the next return reaches it.
    pub fn push_cc(&mut self, callback: CContFn, data: &[Value]) {
        self.check_stack(CONT_FRAME_WORDS + data.len());
        let h = self.stack.push_cont_header(
            self.cont,
            self.env,
            None,
            data.len(),
            ResumePoint::Host(callback),
            self.base,
        );
        for value in data {
            self.stack.push_value(*value);
        }
        self.cont = ContPtr::Stack(h);
        self.stack.argp = self.stack.sp;
    }

    /// pop the topmost continuation frame and restore the registers from
    /// it. a host frame invokes its callback (which may escape); a heap
    /// scheme frame copies its saved arguments back to the stack base.
    pub fn pop_cont(&mut self) -> VmResult<()> {
        match self.cont {
            ContPtr::Null => panic!("Attempt to pop an empty continuation chain."),
            ContPtr::Stack(h) => {
                match self.stack.cont_argp(h) {
                    None => {
                        // in-stack host frame
                        let size = self.stack.cont_size(h) as usize;
                        let data = self
                            .stack
                            .values(h + CONT_FRAME_WORDS, h + CONT_FRAME_WORDS + size);
                        let callback = match self.stack.cont_resume(h) {
                            ResumePoint::Host(callback) => callback,
                            _ => panic!("Host continuation frame without a host callback."),
                        };
                        self.env = self.stack.cont_env(h);
                        self.base = self.stack.cont_base(h);
                        self.cont = self.stack.cont_prev(h);
                        self.stack.sp = h;
                        self.stack.argp = self.stack.sp;
                        self.pc = self.return_pos();
                        let value = self.val0;
                        self.val0 = callback(self, value, &data)?;
                    }
                    Some(argp) => {
                        let size = self.stack.cont_size(h) as usize;
                        self.env = self.stack.cont_env(h);
                        self.base = self.stack.cont_base(h);
                        match self.stack.cont_resume(h) {
                            ResumePoint::Code(pos) => self.pc = pos,
                            // the boundary entry restores the true pc
                            ResumePoint::Boundary => self.pc = self.return_pos(),
                            ResumePoint::Host(_) => {
                                panic!("Scheme continuation frame with a host callback.")
                            }
                        }
                        self.cont = self.stack.cont_prev(h);
                        self.stack.sp = argp + size;
                        self.stack.argp = argp;
                    }
                }
            }
            ContPtr::Heap(obj_ref) => {
                let (host, size, resume, env, base, prev) = {
                    let frame = self.heap.cont_frame(obj_ref);
                    (
                        frame.host,
                        frame.data.len(),
                        frame.resume,
                        frame.env,
                        frame.base,
                        frame.prev,
                    )
                };
                if host {
                    let data = self.heap.cont_frame(obj_ref).data.clone();
                    let callback = match resume {
                        ResumePoint::Host(callback) => callback,
                        _ => panic!("Host continuation frame without a host callback."),
                    };
                    self.env = env;
                    self.base = base;
                    self.cont = prev;
                    self.stack.argp = self.stack.sp;
                    self.pc = self.return_pos();
                    let value = self.val0;
                    self.val0 = callback(self, value, &data)?;
                } else {
                    // the saved arguments return to the stack base
                    self.stack.argp = 0;
                    self.stack.sp = 0;
                    for i in 0..size {
                        let value = self.heap.cont_frame(obj_ref).data[i];
                        self.stack.push_value(value);
                    }
                    self.env = env;
                    self.base = base;
                    match resume {
                        ResumePoint::Code(pos) => self.pc = pos,
                        ResumePoint::Boundary => self.pc = self.return_pos(),
                        ResumePoint::Host(_) => {
                            panic!("Scheme continuation frame with a host callback.")
                        }
                    }
                    self.cont = prev;
                }
            }
        }
        Ok(())
    }

    /// pop a frame during a host-boundary transition. boundary frames
    /// are plain scheme frames, so no host callback can fire here.
    pub fn pop_boundary_frame(&mut self) {
        if self.pop_cont().is_err() {
            panic!("A host callback fired while popping a boundary frame.");
        }
    }

    pub fn is_boundary_frame(&self, cont: ContPtr) -> bool {
        match cont {
            ContPtr::Null => false,
            ContPtr::Stack(h) => matches!(self.stack.cont_resume(h), ResumePoint::Boundary),
            ContPtr::Heap(obj_ref) => {
                matches!(self.heap.cont_frame(obj_ref).resume, ResumePoint::Boundary)
            }
        }
    }

    pub fn cont_prev_of(&self, cont: ContPtr) -> ContPtr {
        match cont {
            ContPtr::Null => ContPtr::Null,
            ContPtr::Stack(h) => self.stack.cont_prev(h),
            ContPtr::Heap(obj_ref) => self.heap.cont_frame(obj_ref).prev,
        }
    }

    /// shift the argument block down over the abandoned frame: to the
    /// end of the topmost in-stack continuation frame, or the stack
    /// base. this bounds tail-recursive storage.
    pub fn tail_shift(&mut self, nargs: usize) {
        let dest = match self.cont {
            ContPtr::Stack(h) => self.stack.cont_frame_end(h),
            _ => 0,
        };
        if dest != self.stack.argp {
            let argp = self.stack.argp;
            self.stack.words.copy_within(argp..argp + nargs, dest);
            self.stack.argp = dest;
            self.stack.sp = dest + nargs;
        }
    }

    // environment access

    fn env_up_of(&self, env: EnvPtr) -> EnvPtr {
        match env {
            EnvPtr::Null => panic!("Environment chain ended early."),
            EnvPtr::Stack(h) => self.stack.env_up(h),
            EnvPtr::Heap(obj_ref) => self.heap.env_frame(obj_ref).up,
        }
    }

    fn env_at_depth(&self, depth: usize) -> EnvPtr {
        let mut env = self.env;
        for _ in 0..depth {
            env = self.env_up_of(env);
        }
        env
    }

    pub fn env_ref(&self, depth: usize, index: usize) -> Value {
        match self.env_at_depth(depth) {
            EnvPtr::Null => panic!("Environment chain ended early."),
            EnvPtr::Stack(h) => self.stack.env_data(h, index),
            EnvPtr::Heap(obj_ref) => self.heap.env_frame(obj_ref).data[index],
        }
    }

    pub fn env_set(&mut self, depth: usize, index: usize, value: Value) {
        match self.env_at_depth(depth) {
            EnvPtr::Null => panic!("Environment chain ended early."),
            EnvPtr::Stack(h) => self.stack.set_env_data(h, index, value),
            EnvPtr::Heap(obj_ref) => self.heap.env_frame_mut(obj_ref).data[index] = value,
        }
    }

    // frame promotion

    /// move the chain of environment frames starting at `env_begin` from
    /// the stack to the heap, leaving forwarding frames behind. pointers
    /// into the moved frames held by in-stack continuation frames are
    /// NOT updated here; that is the caller's responsibility (see
    /// `save_cont` and `get_env`).
    pub fn save_env(&mut self, env_begin: EnvPtr) -> EnvPtr {
        let EnvPtr::Stack(mut h) = env_begin else {
            return env_begin;
        };

        let mut head: Option<ObjRef> = None;
        let mut prev: Option<ObjRef> = None;
        loop {
            if let Some(forwarded) = self.stack.env_forwarded(h) {
                if let Some(prev_ref) = prev {
                    self.heap.env_frame_mut(prev_ref).up = EnvPtr::Heap(forwarded);
                }
                return EnvPtr::Heap(head.unwrap_or(forwarded));
            }

            let size = self.stack.env_size(h) as usize;
            let info = self.stack.env_info(h);
            let up = self.stack.env_up(h);
            let data = self.stack.values(h - size, h);

            let saved = self
                .heap
                .alloc(HeapObj::EnvFrame(HeapEnvFrame { up, info, data }));
            if let Some(prev_ref) = prev {
                self.heap.env_frame_mut(prev_ref).up = EnvPtr::Heap(saved);
            }
            if head.is_none() {
                head = Some(saved);
            }
            self.stack.forward_env(h, saved);
            prev = Some(saved);

            match up {
                EnvPtr::Stack(next) => h = next,
                _ => return EnvPtr::Heap(head.unwrap()),
            }
        }
    }

    fn resolve_cont(&self, cont: ContPtr) -> ContPtr {
        match cont {
            ContPtr::Stack(h) => match self.stack.cont_forwarded(h) {
                Some(forwarded) => ContPtr::Heap(forwarded),
                None => cont,
            },
            _ => cont,
        }
    }

    /// copy the continuation chain to the heap. pass 1 walks the chain
    /// promoting each frame (and its environment); pass 2 replaces every
    /// externally held pointer to a forwarded frame — the `cont`
    /// register, the host-stack records, and both escape-point chains —
    /// with the heap copy.
    pub fn save_cont(&mut self) {
        self.env = self.save_env(self.env);

        if matches!(self.cont, ContPtr::Stack(_)) {
            // pass 1
            let mut cont = self.cont;
            let mut prev_saved: Option<ObjRef> = None;
            while let ContPtr::Stack(h) = cont {
                if let Some(forwarded) = self.stack.cont_forwarded(h) {
                    if let Some(prev_ref) = prev_saved {
                        self.heap.cont_frame_mut(prev_ref).prev = ContPtr::Heap(forwarded);
                    }
                    break;
                }

                let env_field = self.stack.cont_env(h);
                let env = match env_field {
                    EnvPtr::Stack(eh) => match self.stack.env_forwarded(eh) {
                        Some(forwarded) => EnvPtr::Heap(forwarded),
                        None => self.save_env(env_field),
                    },
                    other => other,
                };

                let size = self.stack.cont_size(h) as usize;
                let resume = self.stack.cont_resume(h);
                let base = self.stack.cont_base(h);
                let prev_field = self.stack.cont_prev(h);
                let (host, data) = match self.stack.cont_argp(h) {
                    Some(argp) => (false, self.stack.values(argp, argp + size)),
                    None => (
                        true,
                        self.stack
                            .values(h + CONT_FRAME_WORDS, h + CONT_FRAME_WORDS + size),
                    ),
                };

                let saved = self.heap.alloc(HeapObj::ContFrame(HeapContFrame {
                    prev: prev_field,
                    env,
                    resume,
                    base,
                    host,
                    data,
                }));
                if let Some(prev_ref) = prev_saved {
                    self.heap.cont_frame_mut(prev_ref).prev = ContPtr::Heap(saved);
                }
                self.stack.forward_cont(h, saved);
                prev_saved = Some(saved);
                cont = prev_field;
            }

            // pass 2
            self.cont = self.resolve_cont(self.cont);
            for i in 0..self.cstacks.len() {
                self.cstacks[i].cont = self.resolve_cont(self.cstacks[i].cont);
            }
            let mut ep = self.escape_point;
            while let Some(ep_ref) = ep {
                let resolved = self.resolve_cont(self.heap.escape_point(ep_ref).cont);
                self.heap.escape_point_mut(ep_ref).cont = resolved;
                ep = self.heap.escape_point(ep_ref).prev;
            }
            let mut ep = self.floating_ep;
            while let Some(ep_ref) = ep {
                let resolved = self.resolve_cont(self.heap.escape_point(ep_ref).cont);
                self.heap.escape_point_mut(ep_ref).cont = resolved;
                ep = self.heap.escape_point(ep_ref).floating;
            }
        }
    }

    /// promote every live frame and compact: the argument block under
    /// construction moves to the stack base and everything above it is
    /// cleared. afterwards no frame lives on the stack.
    pub fn save_stack(&mut self) {
        let started = self.settings.collect_stats.then(Instant::now);

        self.save_cont();

        let argp = self.stack.argp;
        let sp = self.stack.sp;
        self.stack.words.copy_within(argp..sp, 0);
        self.stack.sp = sp - argp;
        self.stack.argp = 0;
        for i in self.stack.sp..self.stack.capacity() {
            self.stack.words[i] = Word::Val(Value::Nil);
        }

        if let Some(started) = started {
            self.stat.save_stack_count += 1;
            self.stat.save_stack_time += started.elapsed();
        }
    }

    /// promote the current environment chain (e.g. before making a
    /// closure) and patch the environment pointers of in-stack
    /// continuation frames.
    pub fn get_env(&mut self) -> EnvPtr {
        let promoted = self.save_env(self.env);
        if promoted != self.env {
            self.env = promoted;
            let mut cont = self.cont;
            while let ContPtr::Stack(h) = cont {
                if let EnvPtr::Stack(eh) = self.stack.cont_env(h) {
                    if let Some(forwarded) = self.stack.env_forwarded(eh) {
                        self.stack.set_cont_env(h, EnvPtr::Heap(forwarded));
                    }
                }
                cont = self.stack.cont_prev(h);
            }
        }
        promoted
    }

    // application arranged for the interpreter loop
    //
    // a subr that wants to call a procedure does not re-enter the
    // interpreter. it pushes the arguments, points the pc at a tiny
    // `tail_call n; ret` fragment and returns the procedure value; the
    // loop then performs the call as the subr's tail.

    pub fn arrange_apply(&mut self, proc: Value, args: &[Value]) -> VmResult<Value> {
        debug_assert!(self.in_tail_position());
        self.check_stack(args.len() + 1);
        for arg in args {
            self.stack.push_value(*arg);
        }
        let fragment = if args.len() < self.apply_fragments.len() {
            self.apply_fragments[args.len()]
        } else {
            let mut writer = BytecodeWriter::new();
            writer.write_opcode_c(Opcode::tail_call, args.len() as u16);
            writer.write_opcode(Opcode::ret);
            self.heap
                .alloc(HeapObj::Code(CompiledCode::new("%apply", writer.to_words())))
        };
        self.pc = CodePos {
            code: fragment,
            ip: 0,
        };
        Ok(proc)
    }

    // host-stack records

    pub fn push_cstack(&mut self) -> u64 {
        let id = self.next_cstack_id;
        self.next_cstack_id += 1;
        self.cstacks.push(HostStackRecord {
            id,
            cont: self.cont,
            sig_mask: SigMask::capture(),
        });
        id
    }

    pub fn current_cstack_id(&self) -> Option<u64> {
        self.cstacks.last().map(|record| record.id)
    }

    pub fn has_cstack(&self, id: u64) -> bool {
        self.cstacks.iter().any(|record| record.id == id)
    }

    // modules and globals

    pub fn define_global(&mut self, module: usize, name: ObjRef, value: Value) -> ObjRef {
        if let Some(binding_ref) = self.modules[module].table.get(&name).copied() {
            match self.heap.get_mut(binding_ref) {
                HeapObj::Binding(binding) => binding.value = value,
                _ => panic!("Module table entry is not a binding."),
            }
            binding_ref
        } else {
            let binding_ref = self.heap.alloc(HeapObj::Binding(crate::heap::Binding {
                name,
                value,
            }));
            self.modules[module].table.insert(name, binding_ref);
            binding_ref
        }
    }

    pub fn lookup_global(&self, module: usize, name: ObjRef) -> Option<ObjRef> {
        self.modules[module].table.get(&name).copied()
    }

    pub fn module_name(&self, module: usize) -> &str {
        &self.modules[module].name
    }

    // stack trace

    /// source locations of the current pc and each continuation frame,
    /// innermost first. host-callback frames contribute nothing.
    pub fn stack_trace_lite(&self) -> Vec<String> {
        let mut trace = Vec::new();

        if let Some(source) = self.heap.code(self.pc.code).source_info(self.pc.ip) {
            trace.push(source.to_owned());
        }

        let mut cont = self.cont;
        loop {
            let resume = match cont {
                ContPtr::Null => break,
                ContPtr::Stack(h) => self.stack.cont_resume(h),
                ContPtr::Heap(obj_ref) => self.heap.cont_frame(obj_ref).resume,
            };
            if let ResumePoint::Code(pos) = resume {
                if let Some(source) = self.heap.code(pos.code).source_info(pos.ip) {
                    trace.push(source.to_owned());
                }
            }
            cont = self.cont_prev_of(cont);
        }

        trace
    }
}
