// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

/// Pointer register pair used by indirect addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pointer {
    X,
    Y,
    Z,
}

impl Pointer {
    /// Index of the low byte in the register file.
    pub fn base(self) -> usize {
        match self {
            Pointer::X => 26,
            Pointer::Y => 28,
            Pointer::Z => 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrMode {
    Plain,
    PostInc,
    PreDec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    Movw { d: u8, r: u8 },
    Muls { d: u8, r: u8 },
    Mulsu { d: u8, r: u8 },
    Fmul { d: u8, r: u8 },
    Fmuls { d: u8, r: u8 },
    Fmulsu { d: u8, r: u8 },
    Mul { d: u8, r: u8 },

    Cpc { d: u8, r: u8 },
    Sbc { d: u8, r: u8 },
    Add { d: u8, r: u8 },
    Cpse { d: u8, r: u8 },
    Cp { d: u8, r: u8 },
    Sub { d: u8, r: u8 },
    Adc { d: u8, r: u8 },
    And { d: u8, r: u8 },
    Eor { d: u8, r: u8 },
    Or { d: u8, r: u8 },
    Mov { d: u8, r: u8 },

    Cpi { d: u8, k: u8 },
    Sbci { d: u8, k: u8 },
    Subi { d: u8, k: u8 },
    Ori { d: u8, k: u8 },
    Andi { d: u8, k: u8 },
    Ldi { d: u8, k: u8 },

    Ldd { d: u8, ptr: Pointer, q: u8 },
    Std { r: u8, ptr: Pointer, q: u8 },
    Ld { d: u8, ptr: Pointer, mode: PtrMode },
    St { r: u8, ptr: Pointer, mode: PtrMode },
    Lds { d: u8, k: u16 },
    Sts { k: u16, r: u8 },
    Lpm { d: u8, post_inc: bool },
    Elpm { d: u8, post_inc: bool },
    Spm,
    Push { r: u8 },
    Pop { d: u8 },

    Com { d: u8 },
    Neg { d: u8 },
    Swap { d: u8 },
    Inc { d: u8 },
    Asr { d: u8 },
    Lsr { d: u8 },
    Ror { d: u8 },
    Dec { d: u8 },

    Adiw { d: u8, k: u8 },
    Sbiw { d: u8, k: u8 },

    Bset { s: u8 },
    Bclr { s: u8 },
    Bld { d: u8, b: u8 },
    Bst { d: u8, b: u8 },

    Cbi { a: u8, b: u8 },
    Sbi { a: u8, b: u8 },
    Sbic { a: u8, b: u8 },
    Sbis { a: u8, b: u8 },
    Sbrc { r: u8, b: u8 },
    Sbrs { r: u8, b: u8 },
    In { d: u8, a: u8 },
    Out { a: u8, r: u8 },

    Rjmp { k: i16 },
    Rcall { k: i16 },
    Jmp { k: u32 },
    Call { k: u32 },
    Ijmp,
    Eijmp,
    Icall,
    Eicall,
    Ret,
    Reti,
    Brbs { s: u8, k: i8 },
    Brbc { s: u8, k: i8 },

    Sleep,
    Break,
    Wdr,
    Unknown(u16),
}

impl Instruction {
    /// Length in flash words.
    pub fn words(&self) -> u32 {
        match self {
            Instruction::Lds { .. }
            | Instruction::Sts { .. }
            | Instruction::Jmp { .. }
            | Instruction::Call { .. } => 2,
            _ => 1,
        }
    }
}

/// True if `opcode` is the first word of a two-word instruction.
pub fn is_two_word(opcode: u16) -> bool {
    matches!(opcode & 0xFE0F, 0x9000 | 0x9200) || matches!(opcode & 0xFE0E, 0x940C | 0x940E)
}

fn rd5(op: u16) -> u8 {
    ((op >> 4) & 0x1F) as u8
}

fn rr5(op: u16) -> u8 {
    ((op & 0x0F) | ((op >> 5) & 0x10)) as u8
}

fn rd_hi(op: u16) -> u8 {
    16 + ((op >> 4) & 0x0F) as u8
}

fn k8(op: u16) -> u8 {
    (((op >> 4) & 0xF0) | (op & 0x0F)) as u8
}

/// Decodes one instruction. `next` is the following flash word, only
/// consulted for two-word instructions.
pub fn decode(op: u16, next: u16) -> Instruction {
    match op >> 12 {
        0x0 => decode_0(op),
        0x1 => {
            let (d, r) = (rd5(op), rr5(op));
            match (op >> 10) & 3 {
                0 => Instruction::Cpse { d, r },
                1 => Instruction::Cp { d, r },
                2 => Instruction::Sub { d, r },
                _ => Instruction::Adc { d, r },
            }
        }
        0x2 => {
            let (d, r) = (rd5(op), rr5(op));
            match (op >> 10) & 3 {
                0 => Instruction::And { d, r },
                1 => Instruction::Eor { d, r },
                2 => Instruction::Or { d, r },
                _ => Instruction::Mov { d, r },
            }
        }
        0x3 => Instruction::Cpi { d: rd_hi(op), k: k8(op) },
        0x4 => Instruction::Sbci { d: rd_hi(op), k: k8(op) },
        0x5 => Instruction::Subi { d: rd_hi(op), k: k8(op) },
        0x6 => Instruction::Ori { d: rd_hi(op), k: k8(op) },
        0x7 => Instruction::Andi { d: rd_hi(op), k: k8(op) },
        0x8 | 0xA => {
            let q = ((op & 0x7) | ((op >> 7) & 0x18) | ((op >> 8) & 0x20)) as u8;
            let ptr = if op & 0x8 != 0 { Pointer::Y } else { Pointer::Z };
            let reg = rd5(op);
            if op & 0x0200 != 0 {
                Instruction::Std { r: reg, ptr, q }
            } else {
                Instruction::Ldd { d: reg, ptr, q }
            }
        }
        0x9 => decode_9(op, next),
        0xB => {
            let a = (((op >> 5) & 0x30) | (op & 0x0F)) as u8;
            if op & 0x0800 != 0 {
                Instruction::Out { a, r: rd5(op) }
            } else {
                Instruction::In { d: rd5(op), a }
            }
        }
        0xC => Instruction::Rjmp { k: sign_extend_12(op) },
        0xD => Instruction::Rcall { k: sign_extend_12(op) },
        0xE => Instruction::Ldi { d: rd_hi(op), k: k8(op) },
        _ => decode_f(op),
    }
}

fn sign_extend_12(op: u16) -> i16 {
    ((op << 4) as i16) >> 4
}

fn decode_0(op: u16) -> Instruction {
    match (op >> 8) & 0x0F {
        0x0 if op == 0 => Instruction::Nop,
        0x1 => Instruction::Movw {
            d: (((op >> 4) & 0xF) * 2) as u8,
            r: ((op & 0xF) * 2) as u8,
        },
        0x2 => Instruction::Muls {
            d: rd_hi(op),
            r: 16 + (op & 0xF) as u8,
        },
        0x3 => {
            let d = 16 + ((op >> 4) & 0x7) as u8;
            let r = 16 + (op & 0x7) as u8;
            match op & 0x88 {
                0x00 => Instruction::Mulsu { d, r },
                0x08 => Instruction::Fmul { d, r },
                0x80 => Instruction::Fmuls { d, r },
                _ => Instruction::Fmulsu { d, r },
            }
        }
        0x4..=0x7 => Instruction::Cpc { d: rd5(op), r: rr5(op) },
        0x8..=0xB => Instruction::Sbc { d: rd5(op), r: rr5(op) },
        0xC..=0xF => Instruction::Add { d: rd5(op), r: rr5(op) },
        _ => Instruction::Unknown(op),
    }
}

fn decode_9(op: u16, next: u16) -> Instruction {
    let d = rd5(op);
    match (op >> 8) & 0x0F {
        0x0 | 0x1 => match op & 0xF {
            0x0 => Instruction::Lds { d, k: next },
            0x1 => Instruction::Ld { d, ptr: Pointer::Z, mode: PtrMode::PostInc },
            0x2 => Instruction::Ld { d, ptr: Pointer::Z, mode: PtrMode::PreDec },
            0x4 => Instruction::Lpm { d, post_inc: false },
            0x5 => Instruction::Lpm { d, post_inc: true },
            0x6 => Instruction::Elpm { d, post_inc: false },
            0x7 => Instruction::Elpm { d, post_inc: true },
            0x9 => Instruction::Ld { d, ptr: Pointer::Y, mode: PtrMode::PostInc },
            0xA => Instruction::Ld { d, ptr: Pointer::Y, mode: PtrMode::PreDec },
            0xC => Instruction::Ld { d, ptr: Pointer::X, mode: PtrMode::Plain },
            0xD => Instruction::Ld { d, ptr: Pointer::X, mode: PtrMode::PostInc },
            0xE => Instruction::Ld { d, ptr: Pointer::X, mode: PtrMode::PreDec },
            0xF => Instruction::Pop { d },
            _ => Instruction::Unknown(op),
        },
        0x2 | 0x3 => {
            let r = d;
            match op & 0xF {
                0x0 => Instruction::Sts { k: next, r },
                0x1 => Instruction::St { r, ptr: Pointer::Z, mode: PtrMode::PostInc },
                0x2 => Instruction::St { r, ptr: Pointer::Z, mode: PtrMode::PreDec },
                0x9 => Instruction::St { r, ptr: Pointer::Y, mode: PtrMode::PostInc },
                0xA => Instruction::St { r, ptr: Pointer::Y, mode: PtrMode::PreDec },
                0xC => Instruction::St { r, ptr: Pointer::X, mode: PtrMode::Plain },
                0xD => Instruction::St { r, ptr: Pointer::X, mode: PtrMode::PostInc },
                0xE => Instruction::St { r, ptr: Pointer::X, mode: PtrMode::PreDec },
                0xF => Instruction::Push { r },
                _ => Instruction::Unknown(op),
            }
        }
        0x4 | 0x5 => decode_94(op, next),
        0x6 => Instruction::Adiw {
            d: 24 + ((op >> 4) & 0x3) as u8 * 2,
            k: (((op >> 2) & 0x30) | (op & 0xF)) as u8,
        },
        0x7 => Instruction::Sbiw {
            d: 24 + ((op >> 4) & 0x3) as u8 * 2,
            k: (((op >> 2) & 0x30) | (op & 0xF)) as u8,
        },
        0x8..=0xB => {
            let a = ((op >> 3) & 0x1F) as u8;
            let b = (op & 0x7) as u8;
            match (op >> 8) & 0x3 {
                0 => Instruction::Cbi { a, b },
                1 => Instruction::Sbic { a, b },
                2 => Instruction::Sbi { a, b },
                _ => Instruction::Sbis { a, b },
            }
        }
        _ => Instruction::Mul { d, r: rr5(op) },
    }
}

fn decode_94(op: u16, next: u16) -> Instruction {
    let d = rd5(op);
    match op & 0xF {
        0x0 => Instruction::Com { d },
        0x1 => Instruction::Neg { d },
        0x2 => Instruction::Swap { d },
        0x3 => Instruction::Inc { d },
        0x5 => Instruction::Asr { d },
        0x6 => Instruction::Lsr { d },
        0x7 => Instruction::Ror { d },
        0xA => Instruction::Dec { d },
        0xC | 0xD => Instruction::Jmp {
            k: long_address(op, next),
        },
        0xE | 0xF => Instruction::Call {
            k: long_address(op, next),
        },
        0x8 => match op {
            0x9408..=0x94F8 if op & 0x0100 == 0 && op & 0x80 == 0 => {
                Instruction::Bset { s: ((op >> 4) & 0x7) as u8 }
            }
            0x9488..=0x94F8 if op & 0x0100 == 0 => Instruction::Bclr { s: ((op >> 4) & 0x7) as u8 },
            0x9508 => Instruction::Ret,
            0x9518 => Instruction::Reti,
            0x9588 => Instruction::Sleep,
            0x9598 => Instruction::Break,
            0x95A8 => Instruction::Wdr,
            0x95C8 => Instruction::Lpm { d: 0, post_inc: false },
            0x95D8 => Instruction::Elpm { d: 0, post_inc: false },
            0x95E8 => Instruction::Spm,
            _ => Instruction::Unknown(op),
        },
        0x9 => match op {
            0x9409 => Instruction::Ijmp,
            0x9419 => Instruction::Eijmp,
            0x9509 => Instruction::Icall,
            0x9519 => Instruction::Eicall,
            _ => Instruction::Unknown(op),
        },
        _ => Instruction::Unknown(op),
    }
}

fn long_address(op: u16, next: u16) -> u32 {
    let hi = (((op >> 3) & 0x3E) | (op & 1)) as u32;
    (hi << 16) | next as u32
}

fn decode_f(op: u16) -> Instruction {
    let b = (op & 0x7) as u8;
    match (op >> 9) & 0x7 {
        0 | 1 => Instruction::Brbs {
            s: b,
            k: branch_offset(op),
        },
        2 | 3 => Instruction::Brbc {
            s: b,
            k: branch_offset(op),
        },
        _ if op & 0x8 != 0 => Instruction::Unknown(op),
        4 => Instruction::Bld { d: rd5(op), b },
        5 => Instruction::Bst { d: rd5(op), b },
        6 => Instruction::Sbrc { r: rd5(op), b },
        _ => Instruction::Sbrs { r: rd5(op), b },
    }
}

fn branch_offset(op: u16) -> i8 {
    (((op >> 3) & 0x7F) as i8) << 1 >> 1
}
