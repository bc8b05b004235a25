// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::device::{Device, DeviceContext};
use crate::SimResult;
use std::any::Any;

pub const CTRL: u16 = 0;
pub const PERIOD_L: u16 = 1;
pub const PERIOD_H: u16 = 2;
pub const FLAG: u16 = 3;

pub const CTRL_EN: u8 = 1 << 0;
pub const CTRL_IE: u8 = 1 << 1;
pub const FLAG_OVF: u8 = 1 << 0;

/// Periodic overflow timer occupying four consecutive I/O registers.
///
/// | offset | register |
/// |--------|----------|
/// | 0 | CTRL: EN (bit 0), IE (bit 1) |
/// | 1 | PERIOD low byte |
/// | 2 | PERIOD high byte |
/// | 3 | FLAG: OVF (bit 0), write one to clear |
///
/// Writing CTRL or PERIOD while enabled restarts the count. The flag is
/// also cleared when the CPU enters the overflow vector.
#[derive(Debug)]
pub struct TickTimer {
    base: u16,
    vector: u8,
    ctrl: u8,
    period: u16,
    flag: u8,
    next_overflow: Option<u64>,
    overflows: u64,
}

impl TickTimer {
    pub fn new(base: u16, vector: u8) -> Self {
        Self {
            base,
            vector,
            ctrl: 0,
            period: 0,
            flag: 0,
            next_overflow: None,
            overflows: 0,
        }
    }

    pub fn io_addresses(&self) -> Vec<u16> {
        (self.base..self.base + 4).collect()
    }

    pub fn vector(&self) -> u8 {
        self.vector
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    fn enabled(&self) -> bool {
        self.ctrl & CTRL_EN != 0
    }

    fn restart(&mut self, ctx: &mut DeviceContext) {
        if self.enabled() && self.period > 0 {
            let period = self.period as u64;
            self.next_overflow = Some(ctx.cycle() + period);
            ctx.wake_in(period);
        } else {
            self.next_overflow = None;
        }
    }

    fn update_request(&mut self, ctx: &mut DeviceContext) -> SimResult<()> {
        if self.flag & FLAG_OVF != 0 && self.ctrl & CTRL_IE != 0 {
            ctx.raise(self.vector)?;
        } else {
            ctx.clear(self.vector)?;
        }
        Ok(())
    }

    fn read_reg(&self, offset: u16) -> u8 {
        match offset {
            CTRL => self.ctrl,
            PERIOD_L => self.period as u8,
            PERIOD_H => (self.period >> 8) as u8,
            FLAG => self.flag,
            _ => 0,
        }
    }
}

impl Device for TickTimer {
    fn name(&self) -> &str {
        "tick_timer"
    }

    fn reset(&mut self) {
        self.ctrl = 0;
        self.period = 0;
        self.flag = 0;
        self.next_overflow = None;
    }

    fn advance(&mut self, ctx: &mut DeviceContext, _elapsed: u64) -> SimResult<Option<u64>> {
        let Some(at) = self.next_overflow else {
            return Ok(None);
        };
        let now = ctx.cycle();
        if now < at {
            return Ok(Some(at - now));
        }

        let period = self.period as u64;
        let missed = (now - at) / period;
        self.overflows += missed + 1;
        self.flag |= FLAG_OVF;
        self.update_request(ctx)?;

        let next = at + (missed + 1) * period;
        self.next_overflow = Some(next);
        Ok(Some(next - now))
    }

    fn read_io(&mut self, _ctx: &mut DeviceContext, addr: u16) -> SimResult<u8> {
        Ok(self.read_reg(addr - self.base))
    }

    fn write_io(&mut self, ctx: &mut DeviceContext, addr: u16, value: u8) -> SimResult<()> {
        match addr - self.base {
            CTRL => {
                self.ctrl = value & (CTRL_EN | CTRL_IE);
                self.restart(ctx);
                self.update_request(ctx)?;
            }
            PERIOD_L => {
                self.period = (self.period & 0xFF00) | value as u16;
                self.restart(ctx);
            }
            PERIOD_H => {
                self.period = (self.period & 0x00FF) | ((value as u16) << 8);
                self.restart(ctx);
            }
            FLAG => {
                self.flag &= !(value & FLAG_OVF);
                self.update_request(ctx)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn peek_io(&self, addr: u16) -> Option<u8> {
        addr.checked_sub(self.base).map(|offset| self.read_reg(offset))
    }

    fn interrupt_acknowledged(&mut self, _ctx: &mut DeviceContext, vector: u8) -> SimResult<()> {
        if vector == self.vector {
            self.flag &= !FLAG_OVF;
        }
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "ctrl": self.ctrl,
            "period": self.period,
            "flag": self.flag,
            "next_overflow": self.next_overflow,
            "overflows": self.overflows,
        })
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}
