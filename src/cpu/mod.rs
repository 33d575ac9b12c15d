pub mod assembler;
pub mod spec;
pub mod trace;

use bitflags::bitflags;
use log::{trace, warn};

use crate::bus::Memory;
use spec::{AluOp, Cond, ImmOp, Instruction, MemOp, Reg, RelOp};

pub const IRQ_VECTOR: u16 = 0xfffa;
pub const NMI_VECTOR: u16 = 0xfffc;
pub const RESET_VECTOR: u16 = 0xfffe;

// instructions, including the one that wrote the flags, during which
// register writes leave Z/N alone and IRQs are held off
const FLAG_SHADOW_LEN: u8 = 2;

bitflags! {
    pub struct Flags: u16 {
        const ZERO       = 0b0_0001;
        const NEGATIVE   = 0b0_0010;
        const CARRY      = 0b0_0100;
        const INTERRUPTS = 0b0_1000;
        const FAULT      = 0b1_0000;
    }
}

pub struct Processor {
    registers: [u16; 16],
    flags: Flags,

    // address of the instruction that was running when the last interrupt hit
    saved_return: u16,
    flag_shadow: u8,

    steps: u64, // Number of instructions executed since reset
}

impl Processor {
    pub fn new() -> Processor {
        Processor {
            registers: [0; 16],
            flags: Flags::empty(),
            saved_return: 0,
            flag_shadow: 0,
            steps: 0,
        }
    }

    pub fn reset<M: Memory>(&mut self, mem: &mut M) {
        self.registers = [0; 16];
        self.flags = Flags::empty();
        self.saved_return = 0;
        self.flag_shadow = 0;
        self.steps = 0;
        self.registers[Reg::PC.index()] = mem.read_u16(RESET_VECTOR);
    }

    pub fn pc(&self) -> u16 {
        self.registers[Reg::PC.index()]
    }

    pub fn reg(&self, r: Reg) -> u16 {
        if r == Reg::ZERO {
            0
        } else {
            self.registers[r.index()]
        }
    }

    // test and debugger hook, bypasses the flag logic
    pub fn set_reg(&mut self, r: Reg, value: u16) {
        self.write_reg_no_flags(r, value);
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn saved_return(&self) -> u16 {
        self.saved_return
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.flags.contains(Flags::INTERRUPTS)
    }

    fn set_pc(&mut self, value: u16) {
        self.registers[Reg::PC.index()] = value;
    }

    // the fetch increment is applied after every instruction, so jumps land
    // one word short of their target
    fn jump_to(&mut self, target: u16) {
        self.set_pc(target.wrapping_sub(2));
    }

    fn set_flags(&mut self, bits: u16) {
        self.flags = Flags::from_bits_truncate(bits);
        self.flag_shadow = FLAG_SHADOW_LEN;
    }

    fn write_reg(&mut self, r: Reg, value: u16) {
        self.write_reg_no_flags(r, value);
        if self.flag_shadow == 0 {
            self.flags.set(Flags::ZERO, value == 0);
            self.flags.set(Flags::NEGATIVE, (value as i16) < 0);
        }
    }

    fn write_reg_no_flags(&mut self, r: Reg, value: u16) {
        if r != Reg::ZERO {
            self.registers[r.index()] = value;
        }
    }

    pub fn fetch<M: Memory>(&self, mem: &mut M) -> u16 {
        // instructions are stored big-endian, data little-endian
        mem.read_u16(self.pc()).swap_bytes()
    }

    // the word at pc as a trace would show it, leaving devices untouched
    pub fn peek<M: Memory>(&self, mem: &mut M) -> u16 {
        mem.peek_u16(self.pc()).swap_bytes()
    }

    // execute one instruction
    pub fn step<M: Memory>(&mut self, mem: &mut M) {
        let word = self.fetch(mem);
        let inst = Instruction::decode(word);
        trace!(
            "{:04x}: {:04x}  {}",
            self.pc(),
            word,
            inst.disassemble(self.pc())
        );

        self.flag_shadow = self.flag_shadow.saturating_sub(1);
        self.execute(inst, mem);

        self.set_pc(self.pc().wrapping_add(2));
        self.steps += 1;
    }

    fn execute<M: Memory>(&mut self, inst: Instruction, mem: &mut M) {
        use Instruction::*;

        match inst {
            Imm { op, rd, imm } => self.immediate(op, rd, imm),
            Mem { op, rd, ra, ro } => self.load_store(op, rd, ra, ro, mem),
            Rel { op, offset } => {
                let (taken, link) = match op {
                    RelOp::Rjmp => (true, false),
                    RelOp::Rcall => (true, true),
                    RelOp::Rjz => (self.flags.contains(Flags::ZERO), false),
                    RelOp::Rjn => (self.flags.contains(Flags::NEGATIVE), false),
                };
                if taken {
                    let here = self.pc();
                    if link {
                        self.write_reg_no_flags(Reg::LR, here.wrapping_add(2));
                    }
                    self.jump_to(here.wrapping_add(offset as u16));
                }
            }
            Jump { cond, ra, rl } => {
                let taken = match cond {
                    Cond::Always => true,
                    Cond::Zero => self.flags.contains(Flags::ZERO),
                    Cond::NotZero => !self.flags.contains(Flags::ZERO),
                    Cond::Negative => self.flags.contains(Flags::NEGATIVE),
                };
                if taken {
                    // the link lands before the target is read, so `jmp lr, lr` falls through
                    let link = self.pc().wrapping_add(2);
                    self.write_reg(rl, link);
                    self.jump_to(self.reg(ra));
                }
            }
            Psr { rs } => {
                let saved = self.saved_return;
                self.push(rs, saved, mem);
            }
            Iret { rs } => {
                let addr = self.pop(rs, mem);
                self.set_pc(addr);
                self.flags.insert(Flags::INTERRUPTS);
            }
            Gfl { rd } => self.write_reg(rd, self.flags.bits()),
            Sfl { rs } => self.set_flags(self.reg(rs)),
            Push { rs, rv } => self.push(rs, self.reg(rv), mem),
            Pop { rs, rd } => {
                let value = self.pop(rs, mem);
                self.write_reg(rd, value);
            }
            Mov { rs, rd } => self.write_reg(rd, self.reg(rs)),
            Msx { rs, rd } => self.write_reg(rd, self.reg(rs) as u8 as i8 as i16 as u16),
            Int => self.nmi(mem),
            Nop => {}
            Alu { op, rs, rd } => self.arithmetic(op, rs, rd),
            Undefined(word) => warn!("undefined instruction {:04x} at {:04x}", word, self.pc()),
        }
    }

    fn immediate(&mut self, op: ImmOp, rd: Reg, imm: u8) {
        let value = match op {
            ImmOp::Ldi => imm as i8 as i16 as u16,
            ImmOp::Ldh => (self.reg(rd) & 0x00ff) | (imm as u16) << 8,
            ImmOp::Adi => {
                let (value, carry) = add_with_carry(self.reg(rd), imm as u16, false);
                self.flags.set(Flags::CARRY, carry);
                value
            }
            ImmOp::Sbi => {
                let (value, carry) = sub_with_carry(self.reg(rd), imm as u16, true);
                self.flags.set(Flags::CARRY, carry);
                value
            }
        };
        self.write_reg(rd, value);
    }

    fn load_store<M: Memory>(&mut self, op: MemOp, rd: Reg, ra: Reg, ro: Reg, mem: &mut M) {
        let addr = self.reg(ra).wrapping_add(self.reg(ro));
        match op {
            MemOp::Ldw => {
                let value = mem.read_u16(addr);
                self.write_reg(rd, value);
            }
            MemOp::Stw => mem.write_u16(addr, self.reg(rd)),
            MemOp::Ldb => {
                let value = mem.read_u8(addr) as u16;
                self.write_reg(rd, value);
            }
            MemOp::Stb => mem.write_u8(addr, self.reg(rd) as u8),
        }
    }

    fn arithmetic(&mut self, op: AluOp, rs: Reg, rd: Reg) {
        let src = self.reg(rs);
        let dest = self.reg(rd);
        let carry_in = self.flags.contains(Flags::CARRY);
        let shift = src as u32;

        let result = match op {
            AluOp::Add | AluOp::Adc | AluOp::Sub | AluOp::Sbc => {
                // subtraction runs source minus destination, and plain sub borrows
                let (value, carry) = match op {
                    AluOp::Add => add_with_carry(src, dest, false),
                    AluOp::Adc => add_with_carry(src, dest, carry_in),
                    AluOp::Sub => sub_with_carry(src, dest, false),
                    _ => sub_with_carry(src, dest, carry_in),
                };
                self.flags.set(Flags::CARRY, carry);
                value
            }
            AluOp::And => dest & src,
            AluOp::Not => !dest,
            AluOp::Or => dest | src,
            AluOp::Xor => dest ^ src,
            AluOp::Shl | AluOp::Asl | AluOp::Lsl => dest.wrapping_shl(shift),
            AluOp::Shr | AluOp::Lsr => dest.wrapping_shr(shift),
            AluOp::Asr => (dest as i16).wrapping_shr(shift) as u16,
            AluOp::Rdf => self.flags.bits(),
            AluOp::Wrf => {
                self.set_flags(src);
                dest
            }
        };
        self.write_reg(rd, result);
    }

    // stacks grow down; the pointer addresses the next free word
    fn push<M: Memory>(&mut self, rs: Reg, value: u16, mem: &mut M) {
        let ptr = self.reg(rs);
        mem.write_u16(ptr, value);
        self.write_reg_no_flags(rs, ptr.wrapping_sub(2));
    }

    fn pop<M: Memory>(&mut self, rs: Reg, mem: &mut M) -> u16 {
        let ptr = self.reg(rs).wrapping_add(2);
        let value = mem.read_u16(ptr);
        self.write_reg_no_flags(rs, ptr);
        value
    }

    // software interrupt, taken unconditionally
    fn nmi<M: Memory>(&mut self, mem: &mut M) {
        self.saved_return = self.pc();
        let handler = mem.read_u16(NMI_VECTOR);
        self.jump_to(handler);
        self.flags.remove(Flags::INTERRUPTS);
    }

    // returns whether the interrupt was taken
    pub fn irq<M: Memory>(&mut self, mem: &mut M) -> bool {
        if !self.interrupts_enabled() || self.flag_shadow != 0 {
            return false;
        }
        // pc already points at the next instruction; iret adds the word back
        self.saved_return = self.pc().wrapping_sub(2);
        let handler = mem.read_u16(IRQ_VECTOR);
        trace!("irq taken at {:04x}, handler {:04x}", self.saved_return, handler);
        self.set_pc(handler);
        self.flags.remove(Flags::INTERRUPTS);
        true
    }
}

impl Default for Processor {
    fn default() -> Self {
        Processor::new()
    }
}

fn add_with_carry(lhs: u16, rhs: u16, carry: bool) -> (u16, bool) {
    let sum = lhs as u32 + rhs as u32 + carry as u32;
    (sum as u16, sum > 0xffff)
}

// carry in and out both mean "no borrow"
fn sub_with_carry(lhs: u16, rhs: u16, carry: bool) -> (u16, bool) {
    let (value, borrow_a) = lhs.overflowing_sub(rhs);
    let (value, borrow_b) = value.overflowing_sub(!carry as u16);
    (value, !(borrow_a || borrow_b))
}
