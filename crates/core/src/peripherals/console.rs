// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::device::{Device, DeviceContext};
use crate::signals::{SignalData, SignalKind};
use crate::SimResult;
use std::any::Any;

/// Debug console on a single I/O register.
///
/// Every byte written is appended to the current line. A `\n` completes the
/// line, which is logged and published as a `ConsoleLine` signal. Reads
/// return 0 (always ready).
#[derive(Debug)]
pub struct Console {
    addr: u16,
    line: Vec<u8>,
    lines: Vec<String>,
}

impl Console {
    pub fn new(addr: u16) -> Self {
        Self {
            addr,
            line: Vec::new(),
            lines: Vec::new(),
        }
    }

    pub fn addr(&self) -> u16 {
        self.addr
    }

    /// Completed lines, oldest first.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Everything printed so far, including an unterminated last line.
    pub fn output(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&String::from_utf8_lossy(&self.line));
        out
    }

    fn flush_line(&mut self, ctx: &DeviceContext) {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        tracing::info!("[{}] {}", ctx.cycle(), line);
        ctx.emit(SignalKind::ConsoleLine, SignalData::Text(line.clone()));
        self.lines.push(line);
    }
}

impl Device for Console {
    fn name(&self) -> &str {
        "console"
    }

    fn reset(&mut self) {
        if !self.line.is_empty() {
            tracing::warn!(
                "Console reset drops unterminated output: {:?}",
                String::from_utf8_lossy(&self.line)
            );
            self.line.clear();
        }
    }

    fn read_io(&mut self, _ctx: &mut DeviceContext, _addr: u16) -> SimResult<u8> {
        Ok(0)
    }

    fn write_io(&mut self, ctx: &mut DeviceContext, _addr: u16, value: u8) -> SimResult<()> {
        match value {
            b'\n' => self.flush_line(ctx),
            b'\r' => {}
            _ => self.line.push(value),
        }
        Ok(())
    }

    fn peek_io(&self, _addr: u16) -> Option<u8> {
        Some(0)
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "addr": self.addr,
            "lines": self.lines.len(),
            "pending": String::from_utf8_lossy(&self.line),
        })
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}
