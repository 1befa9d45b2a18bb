// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

use std::fmt::Write;

use crate::{decode_b, decode_c, decode_opcode_num, opcode::Opcode, InstructionWord};

/// format a code vector as readable text, one instruction per line:
///
/// ```text
/// 0x0000  imm_int          c=10
/// 0x0001  push
/// 0x0002  local_ref        b=0 c=0
/// 0x0003  call             c=1
/// 0x0004  ret
/// ```
///
/// word addresses are shown in hex. unknown opcodes are rendered as raw
/// words so a partially corrupt vector still dumps.
pub fn format_bytecode_as_text(words: &[InstructionWord]) -> String {
    let mut text = String::new();
    let mut addr = 0;

    while addr < words.len() {
        let word = words[addr];
        let opcode_num = decode_opcode_num(word);

        match Opcode::from_opcode_num(opcode_num) {
            Some(opcode) => {
                let mut line = format!("0x{:04x}  {}", addr, opcode.get_name());

                let b = decode_b(word);
                let c = decode_c(word);
                if b != 0 {
                    write!(line, " b={}", b).unwrap();
                }
                if c != 0 {
                    write!(line, " c={}", c).unwrap();
                }

                for i in 0..opcode.extension_words() {
                    let ext = words.get(addr + 1 + i).copied().unwrap_or(0);
                    write!(line, " 0x{:x}", ext).unwrap();
                }

                text.push_str(line.trim_end());
                text.push('\n');
                addr += 1 + opcode.extension_words();
            }
            None => {
                writeln!(text, "0x{:04x}  (raw 0x{:08x})", addr, word).unwrap();
                addr += 1;
            }
        }
    }

    text
}
