//! RAR 3.x filter virtual machine.
//!
//! RAR 3.x declares filters as small programs for a 32-bit register machine
//! with 256 KiB of memory. Archivers in practice emit a handful of standard
//! programs, recognised by CRC and run natively; anything else goes through
//! the interpreter.
//!
//! A parsed program is an immutable [`ProgramTemplate`] shared by every run
//! of its filter slot. Each declaration in the stream produces a
//! [`VmInvocation`] with its own registers and global data. Data a program
//! asks to keep is copied back into its slot after the run.

use std::sync::Arc;

use log::{debug, warn};

use super::filter::{convert_e8_address, FilterKind, PendingFilter};
use super::{BitReader, DecompressError, Result};
use crate::crc32::crc32;

/// VM memory size (256KB)
pub const VM_MEMSIZE: usize = 0x40000;
pub const VM_MEMMASK: u32 = (VM_MEMSIZE - 1) as u32;
/// Start of the global data area.
pub const VM_GLOBALADDR: usize = 0x3C000;
pub const VM_GLOBALSIZE: usize = 0x2000;
/// Part of the global area filled in before every run.
pub const VM_FIXEDGLOBALSIZE: usize = 0x40;

/// Instruction budget for one run.
const MAX_OPS: u32 = 25_000_000;

/// Maximum channels for the delta program
const MAX_UNPACK_CHANNELS: usize = 1024;

const E8_FILE_SIZE: u32 = 0x1000000;

const FLAG_C: u32 = 1;
const FLAG_Z: u32 = 2;
const FLAG_S: u32 = 0x8000_0000;

/// Standard filter types (identified by CRC, not bytecode)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardFilter {
    /// x86 CALL (E8) address conversion
    E8,
    /// x86 CALL/JMP (E8/E9) address conversion
    E8E9,
    /// IA-64 Itanium preprocessing
    Itanium,
    /// Byte delta encoding (audio/images)
    Delta,
    /// RGB predictive filter
    Rgb,
    /// Audio sample predictor
    Audio,
    /// Legacy text filter whose output is shorter than its input
    Upcase,
}

/// Known filter signatures: (length, crc, filter)
const FILTER_SIGNATURES: [(usize, u32, StandardFilter); 7] = [
    (53, 0xad576887, StandardFilter::E8),
    (57, 0x3cd7e57e, StandardFilter::E8E9),
    (120, 0x3769893f, StandardFilter::Itanium),
    (29, 0x0e06077d, StandardFilter::Delta),
    (149, 0x1c2c5dc8, StandardFilter::Rgb),
    (216, 0xbc85e701, StandardFilter::Audio),
    (40, 0x46b9c560, StandardFilter::Upcase),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    Mov,
    Cmp,
    Add,
    Sub,
    Jz,
    Jnz,
    Inc,
    Dec,
    Jmp,
    Xor,
    And,
    Or,
    Test,
    Js,
    Jns,
    Jb,
    Jbe,
    Ja,
    Jae,
    Push,
    Pop,
    Call,
    Ret,
    Not,
    Shl,
    Shr,
    Sar,
    Neg,
    Pusha,
    Popa,
    Pushf,
    Popf,
    Movzx,
    Movsx,
    Xchg,
    Mul,
    Div,
    Adc,
    Sbb,
    Print,
}

/// Opcodes in encoding order.
const OPCODES: [Opcode; 40] = [
    Opcode::Mov,
    Opcode::Cmp,
    Opcode::Add,
    Opcode::Sub,
    Opcode::Jz,
    Opcode::Jnz,
    Opcode::Inc,
    Opcode::Dec,
    Opcode::Jmp,
    Opcode::Xor,
    Opcode::And,
    Opcode::Or,
    Opcode::Test,
    Opcode::Js,
    Opcode::Jns,
    Opcode::Jb,
    Opcode::Jbe,
    Opcode::Ja,
    Opcode::Jae,
    Opcode::Push,
    Opcode::Pop,
    Opcode::Call,
    Opcode::Ret,
    Opcode::Not,
    Opcode::Shl,
    Opcode::Shr,
    Opcode::Sar,
    Opcode::Neg,
    Opcode::Pusha,
    Opcode::Popa,
    Opcode::Pushf,
    Opcode::Popf,
    Opcode::Movzx,
    Opcode::Movsx,
    Opcode::Xchg,
    Opcode::Mul,
    Opcode::Div,
    Opcode::Adc,
    Opcode::Sbb,
    Opcode::Print,
];

impl Opcode {
    fn operands(self) -> usize {
        use Opcode::*;
        match self {
            Ret | Pusha | Popa | Pushf | Popf | Print => 0,
            Jz | Jnz | Inc | Dec | Jmp | Js | Jns | Jb | Jbe | Ja | Jae | Push | Pop | Call
            | Not | Neg => 1,
            _ => 2,
        }
    }

    /// Encoding carries a byte-mode bit.
    fn has_byte_mode(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Mov | Cmp | Add | Sub | Inc | Dec | Xor | And | Or | Test | Not | Shl | Shr | Sar
                | Neg | Xchg | Mul | Div | Adc | Sbb
        )
    }

    /// Immediate operand is a command index.
    fn is_branch(self) -> bool {
        use Opcode::*;
        matches!(self, Jz | Jnz | Jmp | Js | Jns | Jb | Jbe | Ja | Jae | Call)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    None,
    Reg(usize),
    Imm(u32),
    /// `[reg + base]`, or `[base]` without a register.
    Mem { reg: Option<usize>, base: u32 },
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Op {
        op: Opcode,
        byte_mode: bool,
        op1: Operand,
        op2: Operand,
    },
    Standard(StandardFilter),
}

const RET: Command = Command::Op {
    op: Opcode::Ret,
    byte_mode: false,
    op1: Operand::None,
    op2: Operand::None,
};

/// Read a variable-length value from VM code.
fn read_data(reader: &mut BitReader) -> u32 {
    let data = reader.getbits();
    match data & 0xc000 {
        0 => {
            reader.addbits(6);
            (data >> 10) & 0xf
        }
        0x4000 => {
            if data & 0x3c00 == 0 {
                reader.addbits(14);
                0xffff_ff00 | ((data >> 2) & 0xff)
            } else {
                reader.addbits(10);
                (data >> 6) & 0xff
            }
        }
        0x8000 => {
            reader.addbits(2);
            let value = reader.getbits();
            reader.addbits(16);
            value
        }
        _ => {
            reader.addbits(2);
            let high = reader.getbits() << 16;
            reader.addbits(16);
            let low = reader.getbits();
            reader.addbits(16);
            high | low
        }
    }
}

fn decode_operand(reader: &mut BitReader, byte_mode: bool) -> Operand {
    let data = reader.getbits();
    if data & 0x8000 != 0 {
        reader.addbits(4);
        Operand::Reg(((data >> 12) & 7) as usize)
    } else if data & 0xc000 == 0 {
        if byte_mode {
            reader.addbits(10);
            Operand::Imm((data >> 6) & 0xff)
        } else {
            reader.addbits(2);
            Operand::Imm(read_data(reader))
        }
    } else if data & 0x2000 == 0 {
        reader.addbits(6);
        Operand::Mem {
            reg: Some(((data >> 10) & 7) as usize),
            base: 0,
        }
    } else {
        let reg = if data & 0x1000 == 0 {
            reader.addbits(7);
            Some(((data >> 9) & 7) as usize)
        } else {
            reader.addbits(4);
            None
        };
        Operand::Mem {
            reg,
            base: read_data(reader),
        }
    }
}

/// Branch immediates below 256 are relative to the current command.
fn branch_target(distance: u32, current: usize) -> u32 {
    if distance >= 256 {
        return distance - 256;
    }
    let relative = match distance {
        136.. => distance as i64 - 264,
        16.. => distance as i64 - 8,
        8.. => distance as i64 - 16,
        _ => distance as i64,
    };
    (relative + current as i64) as u32
}

/// A parsed program, shared by every run of its filter slot.
#[derive(Debug)]
pub struct ProgramTemplate {
    commands: Vec<Command>,
    static_data: Vec<u8>,
    standard: Option<StandardFilter>,
}

impl ProgramTemplate {
    /// Parse program bytes. Code failing its XOR checksum becomes a program
    /// that returns at once, leaving its block unchanged.
    pub fn parse(code: &[u8]) -> Self {
        let mut program = Self {
            commands: Vec::new(),
            static_data: Vec::new(),
            standard: None,
        };
        let Some((&checksum, body)) = code.split_first() else {
            program.commands.push(RET);
            return program;
        };
        if body.iter().fold(0u8, |acc, &b| acc ^ b) != checksum {
            warn!("VM code checksum mismatch, filter disabled");
            program.commands.push(RET);
            return program;
        }

        let crc = crc32(code);
        if let Some(&(_, _, kind)) = FILTER_SIGNATURES
            .iter()
            .find(|(len, sig, _)| *len == code.len() && *sig == crc)
        {
            debug!("standard VM filter {:?}", kind);
            program.standard = Some(kind);
            program.commands.push(Command::Standard(kind));
            program.commands.push(RET);
            return program;
        }

        let mut reader = BitReader::from_bytes(code);
        reader.addbits(8);
        let has_static = reader.read_bits(1) != 0;
        if has_static {
            let size = read_data(&mut reader).wrapping_add(1) as usize;
            while program.static_data.len() < size && reader.byte_pos() < code.len() {
                program.static_data.push(reader.read_byte());
            }
        }

        while reader.byte_pos() < code.len() {
            let data = reader.getbits();
            let index = if data & 0x8000 == 0 {
                reader.addbits(4);
                (data >> 12) as usize
            } else {
                reader.addbits(6);
                ((data >> 10) as usize).saturating_sub(24)
            };
            let op = OPCODES[index.min(OPCODES.len() - 1)];
            let byte_mode = op.has_byte_mode() && reader.read_bits(1) != 0;
            let mut op1 = Operand::None;
            let mut op2 = Operand::None;
            if op.operands() > 0 {
                op1 = decode_operand(&mut reader, byte_mode);
            }
            if op.operands() > 1 {
                op2 = decode_operand(&mut reader, byte_mode);
            } else if let (true, Operand::Imm(distance)) = (op.is_branch(), op1) {
                op1 = Operand::Imm(branch_target(distance, program.commands.len()));
            }
            program.commands.push(Command::Op {
                op,
                byte_mode,
                op1,
                op2,
            });
        }
        program.commands.push(RET);
        debug!(
            "parsed VM program: {} commands, {} static bytes",
            program.commands.len(),
            program.static_data.len()
        );
        program
    }

    pub fn standard(&self) -> Option<StandardFilter> {
        self.standard
    }
}

/// One scheduled run of a program.
#[derive(Debug, Clone)]
pub struct VmInvocation {
    program: Arc<ProgramTemplate>,
    init_r: [u32; 7],
    /// Fixed globals followed by any user data.
    global_data: Vec<u8>,
    slot: usize,
}

impl VmInvocation {
    pub fn block_length(&self) -> u32 {
        self.init_r[4]
    }
}

/// Filter slot state that outlives single runs.
#[derive(Debug)]
struct FilterSlot {
    program: Arc<ProgramTemplate>,
    exec_count: u32,
    last_length: u32,
    persisted: Vec<u8>,
}

/// Registers, flags and memory.
struct Machine {
    mem: Vec<u8>,
    r: [u32; 8],
    flags: u32,
}

impl Machine {
    fn new() -> Self {
        Self {
            mem: vec![0u8; VM_MEMSIZE + 4],
            r: [0; 8],
            flags: 0,
        }
    }

    #[inline]
    fn read_u32(&self, addr: usize) -> u32 {
        u32::from_le_bytes([self.mem[addr], self.mem[addr + 1], self.mem[addr + 2], self.mem[addr + 3]])
    }

    #[inline]
    fn write_u32(&mut self, addr: usize, value: u32) {
        self.mem[addr..addr + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn set_global(&mut self, offset: usize, value: u32) {
        self.write_u32(VM_GLOBALADDR + offset, value);
    }

    fn address(&self, reg: Option<usize>, base: u32) -> usize {
        (base.wrapping_add(reg.map_or(0, |n| self.r[n])) & VM_MEMMASK) as usize
    }

    fn get(&self, op: Operand, byte_mode: bool) -> u32 {
        match op {
            Operand::None => 0,
            Operand::Reg(n) if byte_mode => self.r[n] & 0xff,
            Operand::Reg(n) => self.r[n],
            Operand::Imm(v) if byte_mode => v & 0xff,
            Operand::Imm(v) => v,
            Operand::Mem { reg, base } => {
                let addr = self.address(reg, base);
                if byte_mode {
                    self.mem[addr] as u32
                } else {
                    self.read_u32(addr)
                }
            }
        }
    }

    /// Byte-mode writes touch only the low byte. Writes to immediates are
    /// dropped.
    fn set(&mut self, op: Operand, byte_mode: bool, value: u32) {
        match op {
            Operand::Reg(n) if byte_mode => self.r[n] = (self.r[n] & !0xff) | (value & 0xff),
            Operand::Reg(n) => self.r[n] = value,
            Operand::Mem { reg, base } => {
                let addr = self.address(reg, base);
                if byte_mode {
                    self.mem[addr] = value as u8;
                } else {
                    self.write_u32(addr, value);
                }
            }
            Operand::None | Operand::Imm(_) => {}
        }
    }

    fn push(&mut self, value: u32) {
        self.r[7] = self.r[7].wrapping_sub(4);
        self.write_u32((self.r[7] & VM_MEMMASK) as usize, value);
    }

    fn pop(&mut self) -> u32 {
        let value = self.read_u32((self.r[7] & VM_MEMMASK) as usize);
        self.r[7] = self.r[7].wrapping_add(4);
        value
    }

    #[inline]
    fn zero_sign(result: u32) -> u32 {
        if result == 0 {
            FLAG_Z
        } else {
            result & FLAG_S
        }
    }

    /// Interpret `commands`. Returns false when the instruction budget runs
    /// out.
    fn run(&mut self, commands: &[Command]) -> bool {
        let mut ip = 0usize;
        let mut budget = MAX_OPS;

        macro_rules! jump {
            ($target:expr) => {{
                let target = $target as usize;
                if target >= commands.len() {
                    return true;
                }
                budget -= 1;
                if budget == 0 {
                    return false;
                }
                ip = target;
                continue;
            }};
        }

        loop {
            let Some(&command) = commands.get(ip) else {
                return true;
            };
            let (op, bm, op1, op2) = match command {
                Command::Standard(kind) => {
                    self.run_standard(kind);
                    ip += 1;
                    continue;
                }
                Command::Op {
                    op,
                    byte_mode,
                    op1,
                    op2,
                } => (op, byte_mode, op1, op2),
            };

            match op {
                Opcode::Mov => {
                    let v = self.get(op2, bm);
                    self.set(op1, bm, v);
                }
                Opcode::Cmp | Opcode::Sub => {
                    let v1 = self.get(op1, bm);
                    let result = v1.wrapping_sub(self.get(op2, bm));
                    self.flags = if result == 0 {
                        FLAG_Z
                    } else {
                        u32::from(result > v1) | (result & FLAG_S)
                    };
                    if op == Opcode::Sub {
                        self.set(op1, bm, result);
                    }
                }
                Opcode::Add => {
                    let v1 = self.get(op1, bm);
                    let mut result = v1.wrapping_add(self.get(op2, bm));
                    if bm {
                        result &= 0xff;
                        let sign = if result & 0x80 != 0 { FLAG_S } else { 0 };
                        self.flags = u32::from(result < v1) | if result == 0 { FLAG_Z } else { sign };
                    } else {
                        self.flags = u32::from(result < v1) | Self::zero_sign(result);
                    }
                    self.set(op1, bm, result);
                }
                Opcode::Jz if self.flags & FLAG_Z != 0 => jump!(self.get(op1, false)),
                Opcode::Jnz if self.flags & FLAG_Z == 0 => jump!(self.get(op1, false)),
                Opcode::Js if self.flags & FLAG_S != 0 => jump!(self.get(op1, false)),
                Opcode::Jns if self.flags & FLAG_S == 0 => jump!(self.get(op1, false)),
                Opcode::Jb if self.flags & FLAG_C != 0 => jump!(self.get(op1, false)),
                Opcode::Jbe if self.flags & (FLAG_C | FLAG_Z) != 0 => jump!(self.get(op1, false)),
                Opcode::Ja if self.flags & (FLAG_C | FLAG_Z) == 0 => jump!(self.get(op1, false)),
                Opcode::Jae if self.flags & FLAG_C == 0 => jump!(self.get(op1, false)),
                Opcode::Jz
                | Opcode::Jnz
                | Opcode::Js
                | Opcode::Jns
                | Opcode::Jb
                | Opcode::Jbe
                | Opcode::Ja
                | Opcode::Jae => {}
                Opcode::Jmp => jump!(self.get(op1, false)),
                Opcode::Inc => {
                    let mut result = self.get(op1, bm).wrapping_add(1);
                    if bm {
                        result &= 0xff;
                    }
                    self.set(op1, bm, result);
                    self.flags = Self::zero_sign(result);
                }
                Opcode::Dec => {
                    let result = self.get(op1, bm).wrapping_sub(1);
                    self.set(op1, bm, result);
                    self.flags = Self::zero_sign(result);
                }
                Opcode::Xor | Opcode::And | Opcode::Or => {
                    let (a, b) = (self.get(op1, bm), self.get(op2, bm));
                    let result = match op {
                        Opcode::Xor => a ^ b,
                        Opcode::And => a & b,
                        _ => a | b,
                    };
                    self.flags = Self::zero_sign(result);
                    self.set(op1, bm, result);
                }
                Opcode::Test => {
                    let result = self.get(op1, bm) & self.get(op2, bm);
                    self.flags = Self::zero_sign(result);
                }
                Opcode::Push => {
                    let v = self.get(op1, false);
                    self.push(v);
                }
                Opcode::Pop => {
                    let v = self.pop();
                    self.set(op1, false, v);
                }
                Opcode::Call => {
                    self.push(ip as u32 + 1);
                    jump!(self.get(op1, false));
                }
                Opcode::Ret => {
                    if self.r[7] as usize >= VM_MEMSIZE {
                        return true;
                    }
                    let target = self.pop();
                    jump!(target);
                }
                Opcode::Not => {
                    let v = !self.get(op1, bm);
                    self.set(op1, bm, v);
                }
                Opcode::Shl | Opcode::Shr | Opcode::Sar => {
                    let v1 = self.get(op1, bm);
                    let v2 = self.get(op2, bm);
                    let shift = v2 & 31;
                    let prev = v2.wrapping_sub(1) & 31;
                    let (result, carry) = match op {
                        Opcode::Shl => (v1 << shift, u32::from((v1 << prev) & FLAG_S != 0)),
                        Opcode::Shr => (v1 >> shift, (v1 >> prev) & FLAG_C),
                        _ => (((v1 as i32) >> shift) as u32, (v1 >> prev) & FLAG_C),
                    };
                    self.flags = Self::zero_sign(result) | carry;
                    self.set(op1, bm, result);
                }
                Opcode::Neg => {
                    let result = self.get(op1, bm).wrapping_neg();
                    self.flags = if result == 0 {
                        FLAG_Z
                    } else {
                        FLAG_C | (result & FLAG_S)
                    };
                    self.set(op1, bm, result);
                }
                Opcode::Pusha => {
                    let mut sp = self.r[7].wrapping_sub(4);
                    for i in 0..8 {
                        let v = self.r[i];
                        self.write_u32((sp & VM_MEMMASK) as usize, v);
                        sp = sp.wrapping_sub(4);
                    }
                    self.r[7] = self.r[7].wrapping_sub(32);
                }
                Opcode::Popa => {
                    let mut sp = self.r[7];
                    for i in 0..8 {
                        self.r[7 - i] = self.read_u32((sp & VM_MEMMASK) as usize);
                        sp = sp.wrapping_add(4);
                    }
                }
                Opcode::Pushf => {
                    let f = self.flags;
                    self.push(f);
                }
                Opcode::Popf => self.flags = self.pop(),
                Opcode::Movzx => {
                    let v = self.get(op2, true);
                    self.set(op1, false, v);
                }
                Opcode::Movsx => {
                    let v = self.get(op2, true) as u8 as i8 as i32 as u32;
                    self.set(op1, false, v);
                }
                Opcode::Xchg => {
                    let v1 = self.get(op1, bm);
                    let v2 = self.get(op2, bm);
                    self.set(op1, bm, v2);
                    self.set(op2, bm, v1);
                }
                Opcode::Mul => {
                    let v = self.get(op1, bm).wrapping_mul(self.get(op2, bm));
                    self.set(op1, bm, v);
                }
                Opcode::Div => {
                    let divider = self.get(op2, bm);
                    if divider != 0 {
                        let v = self.get(op1, bm) / divider;
                        self.set(op1, bm, v);
                    }
                }
                Opcode::Adc => {
                    let v1 = self.get(op1, bm);
                    let carry = self.flags & FLAG_C;
                    let mut result = v1.wrapping_add(self.get(op2, bm)).wrapping_add(carry);
                    if bm {
                        result &= 0xff;
                    }
                    self.flags =
                        u32::from(result < v1 || (result == v1 && carry != 0)) | Self::zero_sign(result);
                    self.set(op1, bm, result);
                }
                Opcode::Sbb => {
                    let v1 = self.get(op1, bm);
                    let carry = self.flags & FLAG_C;
                    let result = v1.wrapping_sub(self.get(op2, bm)).wrapping_sub(carry);
                    self.flags =
                        u32::from(result > v1 || (result == v1 && carry != 0)) | Self::zero_sign(result);
                    self.set(op1, bm, result);
                }
                Opcode::Print => {}
            }
            ip += 1;
            budget -= 1;
            if budget == 0 {
                return false;
            }
        }
    }

    /// Native versions of the standard programs. Output location and size
    /// go to the globals at 0x20 and 0x1c just like the bytecode would.
    fn run_standard(&mut self, kind: StandardFilter) {
        let data_size = self.r[4] as usize;
        let file_offset = self.r[6];
        match kind {
            StandardFilter::E8 | StandardFilter::E8E9 => {
                self.filter_e8e9(data_size, file_offset, kind == StandardFilter::E8E9)
            }
            StandardFilter::Itanium => self.filter_itanium(data_size, file_offset),
            StandardFilter::Delta => self.filter_delta(data_size, self.r[0] as usize),
            StandardFilter::Rgb => {
                self.filter_rgb(data_size, (self.r[0] as usize).wrapping_sub(3), self.r[1] as usize)
            }
            StandardFilter::Audio => self.filter_audio(data_size, self.r[0] as usize),
            StandardFilter::Upcase => self.filter_upcase(data_size),
        }
    }

    fn filter_e8e9(&mut self, data_size: usize, file_offset: u32, include_e9: bool) {
        if !(4..=VM_MEMSIZE).contains(&data_size) {
            return;
        }
        let search_end = data_size - 4;
        let mut pos = 0usize;
        while pos < search_end {
            let found = if include_e9 {
                memchr::memchr2(0xe8, 0xe9, &self.mem[pos..search_end])
            } else {
                memchr::memchr(0xe8, &self.mem[pos..search_end])
            };
            let Some(skip) = found else { break };
            let addr_pos = pos + skip + 1;
            let offset = (addr_pos as u32).wrapping_add(file_offset);
            let mut field = [
                self.mem[addr_pos],
                self.mem[addr_pos + 1],
                self.mem[addr_pos + 2],
                self.mem[addr_pos + 3],
            ];
            convert_e8_address(&mut field, offset, E8_FILE_SIZE);
            self.mem[addr_pos..addr_pos + 4].copy_from_slice(&field);
            pos = addr_pos + 4;
        }
    }

    fn filter_itanium(&mut self, data_size: usize, file_offset: u32) {
        const MASKS: [u8; 16] = [4, 4, 6, 6, 0, 0, 7, 7, 4, 4, 0, 0, 4, 4, 0, 0];
        if !(21..=VM_MEMSIZE).contains(&data_size) {
            return;
        }
        let mut pos = 0usize;
        let mut file_off = file_offset >> 4;
        while pos < data_size - 21 {
            let template = (self.mem[pos] & 0x1f) as i32 - 0x10;
            if template >= 0 {
                let cmd_mask = MASKS[template as usize];
                for slot in 0..3 {
                    if cmd_mask & (1 << slot) == 0 {
                        continue;
                    }
                    let start = slot * 41 + 5;
                    if self.bundle_bits(pos, start + 37, 4) == 5 {
                        let offset = self.bundle_bits(pos, start + 13, 20);
                        self.set_bundle_bits(pos, offset.wrapping_sub(file_off) & 0xfffff, start + 13, 20);
                    }
                }
            }
            pos += 16;
            file_off = file_off.wrapping_add(1);
        }
    }

    fn bundle_bits(&self, base: usize, bit_pos: usize, count: usize) -> u32 {
        (self.read_u32(base + bit_pos / 8) >> (bit_pos & 7)) & (u32::MAX >> (32 - count))
    }

    fn set_bundle_bits(&mut self, base: usize, value: u32, bit_pos: usize, count: usize) {
        let addr = base + bit_pos / 8;
        let shift = bit_pos & 7;
        let and_mask = !(((1u32 << count) - 1) << shift);
        let value = value << shift;
        for i in 0..4 {
            self.mem[addr + i] &= (and_mask >> (i * 8)) as u8;
            self.mem[addr + i] |= (value >> (i * 8)) as u8;
        }
    }

    fn filter_delta(&mut self, data_size: usize, channels: usize) {
        if data_size > VM_MEMSIZE / 2 || channels > MAX_UNPACK_CHANNELS || channels == 0 {
            return;
        }
        self.set_global(0x20, data_size as u32);
        let mut src = 0usize;
        for channel in 0..channels {
            let mut prev = 0u8;
            let mut dst = data_size + channel;
            while dst < data_size * 2 {
                prev = prev.wrapping_sub(self.mem[src]);
                self.mem[dst] = prev;
                src += 1;
                dst += channels;
            }
        }
    }

    fn filter_rgb(&mut self, data_size: usize, width: usize, pos_r: usize) {
        const CHANNELS: usize = 3;
        if !(3..=VM_MEMSIZE / 2).contains(&data_size) || width > data_size || pos_r > 2 {
            return;
        }
        self.set_global(0x20, data_size as u32);
        let mut src = 0usize;
        for channel in 0..CHANNELS {
            let mut prev: u32 = 0;
            let mut i = channel;
            while i < data_size {
                let predicted = if i >= width + 3 {
                    let upper_at = data_size + i - width;
                    let upper = self.mem[upper_at] as u32;
                    let upper_left = self.mem[upper_at - 3] as u32;
                    let guess = prev.wrapping_add(upper).wrapping_sub(upper_left);
                    let pa = (guess as i32 - prev as i32).unsigned_abs();
                    let pb = (guess as i32 - upper as i32).unsigned_abs();
                    let pc = (guess as i32 - upper_left as i32).unsigned_abs();
                    if pa <= pb && pa <= pc {
                        prev
                    } else if pb <= pc {
                        upper
                    } else {
                        upper_left
                    }
                } else {
                    prev
                };
                prev = predicted.wrapping_sub(self.mem[src] as u32) & 0xff;
                self.mem[data_size + i] = prev as u8;
                src += 1;
                i += CHANNELS;
            }
        }
        let mut i = pos_r;
        while i + 2 < data_size {
            let g = self.mem[data_size + i + 1];
            self.mem[data_size + i] = self.mem[data_size + i].wrapping_add(g);
            self.mem[data_size + i + 2] = self.mem[data_size + i + 2].wrapping_add(g);
            i += 3;
        }
    }

    fn filter_audio(&mut self, data_size: usize, channels: usize) {
        if data_size > VM_MEMSIZE / 2 || channels > 128 || channels == 0 {
            return;
        }
        self.set_global(0x20, data_size as u32);
        let mut src = 0usize;
        for channel in 0..channels {
            let mut prev_byte: u32 = 0;
            let mut prev_delta: i32 = 0;
            let mut dif = [0u32; 7];
            let (mut d1, mut d2) = (0i32, 0i32);
            let mut k = [0i32; 3];
            let mut i = channel;
            let mut count = 0u32;
            while i < data_size {
                let d3 = d2;
                d2 = prev_delta - d1;
                d1 = prev_delta;

                let predicted = (8 * prev_byte as i32 + k[0] * d1 + k[1] * d2 + k[2] * d3) >> 3;
                let predicted = (predicted as u32) & 0xff;
                let cur = self.mem[src] as u32;
                src += 1;
                let result = predicted.wrapping_sub(cur) & 0xff;
                self.mem[data_size + i] = result as u8;
                prev_delta = result.wrapping_sub(prev_byte) as u8 as i8 as i32;
                prev_byte = result;

                let d = ((cur as u8 as i8) as i32) << 3;
                let terms = [d, d - d1, d + d1, d - d2, d + d2, d - d3, d + d3];
                for (acc, t) in dif.iter_mut().zip(terms) {
                    *acc = acc.wrapping_add(t.unsigned_abs());
                }

                if count & 0x1f == 0 {
                    let mut best = 0;
                    for j in 1..7 {
                        if dif[j] < dif[best] {
                            best = j;
                        }
                    }
                    dif = [0; 7];
                    if best > 0 {
                        // Odd slots lower a weight, even slots raise it.
                        let weight = &mut k[(best - 1) / 2];
                        if best % 2 == 1 {
                            if *weight >= -16 {
                                *weight -= 1;
                            }
                        } else if *weight < 16 {
                            *weight += 1;
                        }
                    }
                }
                i += channels;
                count += 1;
            }
        }
    }

    fn filter_upcase(&mut self, data_size: usize) {
        if data_size >= VM_GLOBALADDR / 2 {
            return;
        }
        let mut src = 0usize;
        let mut dst = data_size;
        while src < data_size {
            let mut byte = self.mem[src];
            src += 1;
            if byte == 2 {
                byte = self.mem[src];
                src += 1;
                if byte != 2 {
                    byte = byte.wrapping_sub(32);
                }
            }
            self.mem[dst] = byte;
            dst += 1;
        }
        self.set_global(0x1c, (dst - data_size) as u32);
        self.set_global(0x20, data_size as u32);
    }
}

/// RAR 3.x filter state: program slots, scheduled runs and the machine.
pub struct VmFilters {
    slots: Vec<FilterSlot>,
    last_filter: usize,
    pub queue: Vec<PendingFilter>,
    machine: Option<Box<Machine>>,
    max_filters: usize,
}

impl VmFilters {
    pub fn new(max_filters: usize) -> Self {
        Self {
            slots: Vec::new(),
            last_filter: 0,
            queue: Vec::new(),
            machine: None,
            max_filters,
        }
    }

    /// Forget every slot and every scheduled run.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.last_filter = 0;
        self.queue.clear();
    }

    /// Register one filter declaration. `code` holds the bytes following
    /// the declaration's flag byte `first_byte`.
    pub fn add_code(
        &mut self,
        first_byte: u8,
        code: &[u8],
        unp_ptr: usize,
        wr_ptr: usize,
        mask: usize,
    ) -> Result<()> {
        let mut reader = BitReader::from_bytes(code);

        let slot_index = if first_byte & 0x80 != 0 {
            match read_data(&mut reader) {
                0 => {
                    self.reset();
                    0
                }
                pos => pos as usize - 1,
            }
        } else {
            self.last_filter
        };
        if slot_index > self.slots.len() {
            return Err(DecompressError::InvalidFilter("filter slot out of range"));
        }
        let new_filter = slot_index == self.slots.len();
        if (new_filter && slot_index >= self.max_filters) || self.queue.len() >= self.max_filters {
            warn!("VM filter limit reached ({} slots, {} queued)", self.slots.len(), self.queue.len());
            return Err(DecompressError::FilterOverflow);
        }
        self.last_filter = slot_index;

        let (exec_count, previous_length) = match self.slots.get_mut(slot_index) {
            Some(slot) => {
                slot.exec_count = slot.exec_count.wrapping_add(1);
                (slot.exec_count, slot.last_length)
            }
            None => (0, 0),
        };

        let mut block_start = read_data(&mut reader) as usize;
        if first_byte & 0x40 != 0 {
            block_start += 258;
        }
        let block_length = if first_byte & 0x20 != 0 {
            read_data(&mut reader)
        } else {
            previous_length
        };

        let mut init_r = [0u32; 7];
        init_r[3] = VM_GLOBALADDR as u32;
        init_r[4] = block_length;
        init_r[5] = exec_count;
        if first_byte & 0x10 != 0 {
            let init_mask = reader.read_bits(7);
            for (i, reg) in init_r.iter_mut().enumerate() {
                if init_mask & (1 << i) != 0 {
                    *reg = read_data(&mut reader);
                }
            }
        }

        if new_filter {
            let code_size = read_data(&mut reader) as usize;
            if code_size == 0 || code_size >= 0x10000 || reader.byte_pos() + code_size > code.len() {
                return Err(DecompressError::InvalidFilter("bad VM code size"));
            }
            let bytecode: Vec<u8> = (0..code_size).map(|_| reader.read_byte()).collect();
            self.slots.push(FilterSlot {
                program: Arc::new(ProgramTemplate::parse(&bytecode)),
                exec_count: 0,
                last_length: 0,
                persisted: Vec::new(),
            });
        }
        let slot = &mut self.slots[slot_index];
        slot.last_length = block_length;

        let mut global_data = vec![0u8; VM_FIXEDGLOBALSIZE];
        if first_byte & 0x08 != 0 {
            let size = read_data(&mut reader) as usize;
            if size > VM_GLOBALSIZE - VM_FIXEDGLOBALSIZE {
                return Err(DecompressError::InvalidFilter("VM global data too large"));
            }
            if global_data.len() < VM_FIXEDGLOBALSIZE + size {
                global_data.resize(VM_FIXEDGLOBALSIZE + size, 0);
            }
            for byte in &mut global_data[VM_FIXEDGLOBALSIZE..VM_FIXEDGLOBALSIZE + size] {
                *byte = reader.read_byte();
            }
        }
        for (i, reg) in init_r.iter().enumerate() {
            global_data[i * 4..i * 4 + 4].copy_from_slice(&reg.to_le_bytes());
        }
        global_data[0x1c..0x20].copy_from_slice(&block_length.to_le_bytes());
        global_data[0x20..0x24].fill(0);
        global_data[0x2c..0x30].copy_from_slice(&exec_count.to_le_bytes());
        global_data[0x30..0x40].fill(0);

        debug!(
            "VM filter slot {} scheduled at +{} for {} bytes",
            slot_index, block_start, block_length
        );
        let invocation = VmInvocation {
            program: Arc::clone(&slot.program),
            init_r,
            global_data,
            slot: slot_index,
        };
        self.queue.push(PendingFilter::new(
            FilterKind::Bytecode(Box::new(invocation)),
            block_start,
            block_length as usize,
            unp_ptr,
            wr_ptr,
            mask,
        ));
        Ok(())
    }

    fn machine(&mut self) -> &mut Machine {
        self.machine.get_or_insert_with(|| Box::new(Machine::new()))
    }

    /// Copy a block into VM memory at address 0.
    pub fn load(&mut self, data: &[u8]) {
        let n = data.len().min(VM_MEMSIZE);
        self.machine().mem[..n].copy_from_slice(&data[..n]);
    }

    /// Move a previous result to address 0 as input for a chained run.
    pub fn reload(&mut self, pos: usize, len: usize) {
        let len = len.min(VM_MEMSIZE - pos.min(VM_MEMSIZE));
        self.machine().mem.copy_within(pos..pos + len, 0);
    }

    /// Run `invocation` on the loaded block. Returns the position and
    /// length of the filtered data in VM memory.
    pub fn execute(&mut self, invocation: &VmInvocation, file_offset: u64) -> (usize, usize) {
        let machine = self.machine.get_or_insert_with(|| Box::new(Machine::new()));
        machine.r[..7].copy_from_slice(&invocation.init_r);
        machine.r[6] = file_offset as u32;
        machine.r[7] = VM_MEMSIZE as u32;
        machine.flags = 0;

        // Data kept by the slot's previous run replaces any declared user data.
        let persisted = self
            .slots
            .get(invocation.slot)
            .map_or(&[][..], |slot| slot.persisted.as_slice());
        let global_len = if persisted.len() > VM_FIXEDGLOBALSIZE {
            let fixed = invocation.global_data.len().min(VM_FIXEDGLOBALSIZE);
            machine.mem[VM_GLOBALADDR..VM_GLOBALADDR + fixed]
                .copy_from_slice(&invocation.global_data[..fixed]);
            let len = persisted.len().min(VM_GLOBALSIZE);
            machine.mem[VM_GLOBALADDR + VM_FIXEDGLOBALSIZE..VM_GLOBALADDR + len]
                .copy_from_slice(&persisted[VM_FIXEDGLOBALSIZE..len]);
            len
        } else {
            let len = invocation.global_data.len().min(VM_GLOBALSIZE);
            machine.mem[VM_GLOBALADDR..VM_GLOBALADDR + len]
                .copy_from_slice(&invocation.global_data[..len]);
            len
        };
        machine.set_global(0x24, file_offset as u32);
        machine.set_global(0x28, (file_offset >> 32) as u32);
        let program = &invocation.program;
        let static_len = program.static_data.len().min(VM_GLOBALSIZE - global_len);
        let static_at = VM_GLOBALADDR + global_len;
        machine.mem[static_at..static_at + static_len].copy_from_slice(&program.static_data[..static_len]);

        if !machine.run(&program.commands) {
            warn!("VM program exceeded its instruction budget");
        }

        let mut pos = machine.read_u32(VM_GLOBALADDR + 0x20) & VM_MEMMASK;
        let mut size = machine.read_u32(VM_GLOBALADDR + 0x1c) & VM_MEMMASK;
        if pos + size >= VM_MEMSIZE as u32 {
            pos = 0;
            size = 0;
        }

        let keep = (machine.read_u32(VM_GLOBALADDR + 0x30) as usize).min(VM_GLOBALSIZE - VM_FIXEDGLOBALSIZE);
        if let Some(slot) = self.slots.get_mut(invocation.slot) {
            slot.persisted.clear();
            if keep != 0 {
                slot.persisted
                    .extend_from_slice(&machine.mem[VM_GLOBALADDR..VM_GLOBALADDR + VM_FIXEDGLOBALSIZE + keep]);
            }
        }
        (pos as usize, size as usize)
    }

    /// Filtered bytes left in VM memory by [`VmFilters::execute`].
    pub fn output(&mut self, pos: usize, len: usize) -> &[u8] {
        &self.machine().mem[pos..pos + len]
    }
}
