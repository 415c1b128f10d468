// SPDX-License-Identifier: Apache-2.0

//! Symbol description collaborator (§1, §4.12). The deep implementation
//! (driving an external `llvm-symbolizer`) is out of scope; this module
//! defines the call boundary `centipede analyze` consumes and a
//! no-frills default that keeps it runnable without a symbolizer on hand.

use std::path::PathBuf;

use crate::command::{CommandRunner, CommandSpec, ExecStatus};
use crate::error::Result;

/// Resolves a PC index (or raw address) to a human-readable description.
pub trait SymbolTable {
    fn describe(&mut self, pc: u64) -> String;
}

/// Always returns a hex address; used when no symbolizer is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSymbolTable;

impl SymbolTable for NoopSymbolTable {
    fn describe(&mut self, pc: u64) -> String {
        format!("0x{pc:x}")
    }
}

/// Shells out to a configurable `llvm-symbolizer`-compatible binary via the
/// subshell Command/Fork-Server abstraction (§4.7), one address at a time.
/// Falls back to the hex address if the symbolizer is missing or fails.
pub struct LlvmSymbolTable {
    symbolizer_path: PathBuf,
    binary_path: PathBuf,
}

impl LlvmSymbolTable {
    pub fn new(symbolizer_path: impl Into<PathBuf>, binary_path: impl Into<PathBuf>) -> Self {
        Self {
            symbolizer_path: symbolizer_path.into(),
            binary_path: binary_path.into(),
        }
    }
}

impl SymbolTable for LlvmSymbolTable {
    fn describe(&mut self, pc: u64) -> String {
        self.describe_fallible(pc)
            .unwrap_or_else(|_| format!("0x{pc:x}"))
    }
}

impl LlvmSymbolTable {
    fn describe_fallible(&mut self, pc: u64) -> Result<String> {
        let mut spec = CommandSpec::new(&self.symbolizer_path);
        spec.args = vec![
            "--obj".to_string(),
            self.binary_path.to_string_lossy().into_owned(),
            format!("0x{pc:x}"),
        ];
        spec.use_forkserver = false;
        let stdout_path = std::env::temp_dir().join(format!("centipede-symbolize-{pc:x}.txt"));
        spec.stdout_path = Some(stdout_path.clone());
        let mut runner = CommandRunner::new(spec)?;
        let status = runner.execute(&stdout_path)?;
        let output = std::fs::read_to_string(&stdout_path).unwrap_or_default();
        let _ = std::fs::remove_file(&stdout_path);
        match status {
            ExecStatus::Exited(0) => Ok(output
                .lines()
                .next()
                .unwrap_or_default()
                .trim()
                .to_string()),
            _ => Ok(format!("0x{pc:x}")),
        }
    }
}
