// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

// port locking
// ------------
//
// the lock state of a port is a single word, the owner slot: it holds
// the id of the owning instance, or 0 when unlocked. releasing is one
// atomic store, so it never needs the internal lock.
//
// to acquire, an instance first checks whether it already owns the port
// (recursive acquisition just bumps the count). otherwise it takes the
// internal mutex, checks the owner slot, claims it if free, releases the
// mutex, and retries after yielding if the port was held. the owner slot
// may become 0 while a contender holds the internal mutex, since release
// bypasses it; the contender simply observes that on the next round.
//
// a port marked private belongs to one instance and bypasses the locking
// entirely.

use std::{
    io::Write,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Mutex,
    },
};

use crate::ContextError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// what the port reads from / writes to.
pub enum PortKind {
    /// an in-memory byte buffer with a read cursor and a one-byte
    /// pushback slot
    Bytes {
        data: Vec<u8>,
        pos: usize,
        ungot: Option<u8>,
    },
    Stdout,
    Stderr,
}

pub struct PortState {
    pub kind: PortKind,
    /// bytes are staged here until `flush` for buffered ports
    pub buffer: Vec<u8>,
    pub buffered: bool,
    pub closed: bool,
}

pub struct Port {
    pub name: String,
    pub direction: PortDirection,
    pub private: bool,
    owner: AtomicU64,
    count: AtomicU32,
    state: Mutex<PortState>,
    /// the internal lock guarding the owner slot on the contended path
    lock: Mutex<()>,
}

/// scoped release: the port unlocks when the guard drops, including on
/// error paths out of `with_port_locking`.
pub struct PortLockGuard<'a> {
    port: &'a Port,
}

impl Drop for PortLockGuard<'_> {
    fn drop(&mut self) {
        self.port.unlock();
    }
}

impl Port {
    fn new(name: impl Into<String>, direction: PortDirection, kind: PortKind, buffered: bool) -> Self {
        Self {
            name: name.into(),
            direction,
            private: false,
            owner: AtomicU64::new(0),
            count: AtomicU32::new(0),
            state: Mutex::new(PortState {
                kind,
                buffer: Vec::new(),
                buffered,
                closed: false,
            }),
            lock: Mutex::new(()),
        }
    }

    pub fn stdout() -> Self {
        Self::new("stdout", PortDirection::Output, PortKind::Stdout, true)
    }

    pub fn stderr() -> Self {
        Self::new("stderr", PortDirection::Output, PortKind::Stderr, false)
    }

    pub fn input_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(
            name,
            PortDirection::Input,
            PortKind::Bytes {
                data,
                pos: 0,
                ungot: None,
            },
            false,
        )
    }

    pub fn output_bytes(name: impl Into<String>) -> Self {
        Self::new(
            name,
            PortDirection::Output,
            PortKind::Bytes {
                data: Vec::new(),
                pos: 0,
                ungot: None,
            },
            true,
        )
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    // locking

    pub fn lock(&self, vm_id: u64) -> PortLockGuard<'_> {
        if !self.private {
            if self.owner.load(Ordering::Acquire) == vm_id {
                // recursive acquisition by the owner
                self.count.fetch_add(1, Ordering::Relaxed);
            } else {
                loop {
                    {
                        let _internal = self.lock.lock().unwrap();
                        if self.owner.load(Ordering::Acquire) == 0 {
                            self.owner.store(vm_id, Ordering::Release);
                            self.count.store(1, Ordering::Relaxed);
                        }
                    }
                    if self.owner.load(Ordering::Acquire) == vm_id {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        }
        PortLockGuard { port: self }
    }

    fn unlock(&self) {
        if !self.private && self.count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(0, Ordering::Release);
        }
    }

    pub fn lock_owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    /// run `thunk` with the port locked by `vm_id`. the lock is released
    /// on every path out, early `Err` returns included.
    pub fn with_port_locking<T>(
        &self,
        vm_id: u64,
        thunk: impl FnOnce(&mut PortState) -> Result<T, ContextError>,
    ) -> Result<T, ContextError> {
        let _guard = self.lock(vm_id);
        let mut state = self.state.lock().unwrap();
        thunk(&mut state)
    }

    // I/O operations. each locks for the duration of the operation.

    pub fn putb(&self, vm_id: u64, byte: u8) -> Result<(), ContextError> {
        self.with_port_locking(vm_id, |state| state.putb(byte))
    }

    pub fn putc(&self, vm_id: u64, ch: char) -> Result<(), ContextError> {
        self.with_port_locking(vm_id, |state| state.putc(ch))
    }

    /// write a NUL-terminated byte string, stopping before the NUL.
    pub fn putz(&self, vm_id: u64, bytes: &[u8]) -> Result<(), ContextError> {
        self.with_port_locking(vm_id, |state| {
            let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
            for byte in &bytes[..end] {
                state.putb(*byte)?;
            }
            Ok(())
        })
    }

    pub fn puts(&self, vm_id: u64, text: &str) -> Result<(), ContextError> {
        self.with_port_locking(vm_id, |state| state.puts(text))
    }

    pub fn flush(&self, vm_id: u64) -> Result<(), ContextError> {
        self.with_port_locking(vm_id, |state| state.flush())
    }

    pub fn getb(&self, vm_id: u64) -> Result<Option<u8>, ContextError> {
        self.with_port_locking(vm_id, |state| state.getb())
    }

    pub fn getc(&self, vm_id: u64) -> Result<Option<char>, ContextError> {
        self.with_port_locking(vm_id, |state| {
            Ok(state.getb()?.map(|byte| byte as char))
        })
    }

    pub fn peekc(&self, vm_id: u64) -> Result<Option<char>, ContextError> {
        self.with_port_locking(vm_id, |state| {
            let byte = state.getb()?;
            if let Some(byte) = byte {
                state.ungetb(byte)?;
            }
            Ok(byte.map(|b| b as char))
        })
    }

    pub fn ungetc(&self, vm_id: u64, ch: char) -> Result<(), ContextError> {
        self.with_port_locking(vm_id, |state| state.ungetb(ch as u8))
    }

    /// whether a read would succeed without blocking. byte ports are
    /// always ready; at end of input they are ready to deliver EOF.
    pub fn ready(&self, vm_id: u64) -> Result<bool, ContextError> {
        self.with_port_locking(vm_id, |state| {
            state.check_open()?;
            Ok(true)
        })
    }

    pub fn seek(&self, vm_id: u64, pos: usize) -> Result<(), ContextError> {
        self.with_port_locking(vm_id, |state| state.seek(pos))
    }

    pub fn close(&self, vm_id: u64) -> Result<(), ContextError> {
        self.with_port_locking(vm_id, |state| {
            state.flush()?;
            state.closed = true;
            Ok(())
        })
    }

    /// the accumulated bytes of an output byte port.
    pub fn output_data(&self, vm_id: u64) -> Result<Vec<u8>, ContextError> {
        self.with_port_locking(vm_id, |state| {
            state.flush()?;
            match &state.kind {
                PortKind::Bytes { data, .. } => Ok(data.clone()),
                _ => Err(ContextError::new("not a byte port")),
            }
        })
    }
}

impl PortState {
    fn check_open(&self) -> Result<(), ContextError> {
        if self.closed {
            Err(ContextError::new("port is closed"))
        } else {
            Ok(())
        }
    }

    pub fn putb(&mut self, byte: u8) -> Result<(), ContextError> {
        self.check_open()?;
        if self.buffered {
            self.buffer.push(byte);
            Ok(())
        } else {
            self.write_out(&[byte])
        }
    }

    pub fn putc(&mut self, ch: char) -> Result<(), ContextError> {
        let mut encoded = [0u8; 4];
        let text = ch.encode_utf8(&mut encoded);
        self.puts(text)
    }

    pub fn puts(&mut self, text: &str) -> Result<(), ContextError> {
        self.check_open()?;
        if self.buffered {
            self.buffer.extend_from_slice(text.as_bytes());
            Ok(())
        } else {
            self.write_out(text.as_bytes())
        }
    }

    pub fn flush(&mut self) -> Result<(), ContextError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.buffer);
        self.write_out(&pending)
    }

    fn write_out(&mut self, bytes: &[u8]) -> Result<(), ContextError> {
        match &mut self.kind {
            PortKind::Bytes { data, .. } => {
                data.extend_from_slice(bytes);
                Ok(())
            }
            PortKind::Stdout => std::io::stdout()
                .write_all(bytes)
                .map_err(|e| ContextError::new(e.to_string())),
            PortKind::Stderr => std::io::stderr()
                .write_all(bytes)
                .map_err(|e| ContextError::new(e.to_string())),
        }
    }

    pub fn getb(&mut self) -> Result<Option<u8>, ContextError> {
        self.check_open()?;
        match &mut self.kind {
            PortKind::Bytes { data, pos, ungot } => {
                if let Some(byte) = ungot.take() {
                    return Ok(Some(byte));
                }
                if *pos < data.len() {
                    let byte = data[*pos];
                    *pos += 1;
                    Ok(Some(byte))
                } else {
                    Ok(None)
                }
            }
            _ => Err(ContextError::new("port is not readable")),
        }
    }

    pub fn ungetb(&mut self, byte: u8) -> Result<(), ContextError> {
        self.check_open()?;
        match &mut self.kind {
            PortKind::Bytes { ungot, .. } => {
                *ungot = Some(byte);
                Ok(())
            }
            _ => Err(ContextError::new("port is not readable")),
        }
    }

    pub fn seek(&mut self, new_pos: usize) -> Result<(), ContextError> {
        self.check_open()?;
        match &mut self.kind {
            PortKind::Bytes { pos, ungot, .. } => {
                *pos = new_pos;
                *ungot = None;
                Ok(())
            }
            _ => Err(ContextError::new("port is not seekable")),
        }
    }
}
