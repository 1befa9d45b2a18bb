// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

use serde::{Deserialize, Serialize};

use crate::{ContextError, DEFAULT_STACK_SIZE_IN_WORDS};

/// construction-time configuration of one interpreter instance.
///
/// settings can be declared in ASON text, e.g.:
///
/// ```text
/// {
///     name: "worker"
///     stack_size_in_words: 4000
///     collect_stats: true
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSettings {
    pub name: String,
    /// capacity of the value stack. the stack does not grow; promotion
    /// to the heap keeps execution within this bound.
    pub stack_size_in_words: usize,
    /// report conditions that reach the default handler to the current
    /// error port
    pub error_reporting: bool,
    /// record save-stack count and accumulated duration
    pub collect_stats: bool,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            name: "lyra".to_owned(),
            stack_size_in_words: DEFAULT_STACK_SIZE_IN_WORDS,
            error_reporting: true,
            collect_stats: false,
        }
    }
}

impl VmSettings {
    pub fn from_ason_text(text: &str) -> Result<VmSettings, ContextError> {
        ason::from_str::<VmSettings>(text).map_err(|e| ContextError::new(e.to_string()))
    }
}
