use std::fmt;

/*
  Instruction word layout (16 bits, stored big-endian in memory)

   15    12 11     8 7      4 3      0
  +--------+--------+--------+--------+
  |  imm8           |   rd   | 00 op  |  ldi ldh adi sbi
  |   ra   |   ro   |   rd   | 01 op  |  ldw stw ldb stb
  |   r1   |   r2   | group  |  1000  |  jumps, misc, moves, int/nop
  |   rs   |   rd   |  alu   |  1001  |  arithmetic and logic
  |   r1   |   r2   |  ----  |  101x  |  undefined
  |  offset field (12 bits)  | 11 cc  |  relative jumps
  +--------+--------+--------+--------+
*/

pub const LONG_GROUP_MASK: u16 = 0b1100_0000;

const REL_OFFSET_BIAS: i32 = 1 << 12;
pub const REL_OFFSET_MIN: i32 = -REL_OFFSET_BIAS;
pub const REL_OFFSET_MAX: i32 = REL_OFFSET_BIAS - 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Reg(pub u8);

impl Reg {
    pub const ZERO: Reg = Reg(0);
    pub const SP: Reg = Reg(13);
    pub const LR: Reg = Reg(14);
    pub const PC: Reg = Reg(15);

    pub fn index(self) -> usize {
        (self.0 & 0xf) as usize
    }

    fn field(word: u16, shift: u16) -> Reg {
        Reg(((word >> shift) & 0xf) as u8)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            13 => write!(f, "sp"),
            14 => write!(f, "lr"),
            15 => write!(f, "pc"),
            n => write!(f, "r{}", n),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImmOp {
    Ldi,
    Ldh,
    Adi,
    Sbi,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemOp {
    Ldw,
    Stw,
    Ldb,
    Stb,
}

impl MemOp {
    pub fn is_store(self) -> bool {
        matches!(self, MemOp::Stw | MemOp::Stb)
    }

    pub fn is_byte(self) -> bool {
        matches!(self, MemOp::Ldb | MemOp::Stb)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelOp {
    Rjmp,
    Rcall,
    Rjz,
    Rjn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Always,
    Zero,
    NotZero,
    Negative,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Adc,
    Sub,
    Sbc,
    And,
    Not,
    Or,
    Xor,
    Shl,
    Shr,
    Asl,
    Asr,
    Lsl,
    Lsr,
    Rdf,
    Wrf,
}

// (alu op, mnemonic), indexed by the op field
const ALU_TABLE: [(AluOp, &str); 16] = {
    use AluOp::*;
    [
        (Add, "add"),
        (Adc, "adc"),
        (Sub, "sub"),
        (Sbc, "sbc"),
        (And, "and"),
        (Not, "not"),
        (Or, "or"),
        (Xor, "xor"),
        (Shl, "shl"),
        (Shr, "shr"),
        (Asl, "asl"),
        (Asr, "asr"),
        (Lsl, "lsl"),
        (Lsr, "lsr"),
        (Rdf, "rdf"),
        (Wrf, "wrf"),
    ]
};

impl AluOp {
    fn from_field(field: u16) -> AluOp {
        ALU_TABLE[(field & 0xf) as usize].0
    }

    fn field(self) -> u16 {
        ALU_TABLE.iter().position(|(op, _)| *op == self).unwrap_or(0) as u16
    }

    pub fn mnemonic(self) -> &'static str {
        ALU_TABLE[self.field() as usize].1
    }

    pub fn from_mnemonic(s: &str) -> Option<AluOp> {
        ALU_TABLE
            .iter()
            .find(|(_, m)| m.eq_ignore_ascii_case(s))
            .map(|(op, _)| *op)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction {
    Imm { op: ImmOp, rd: Reg, imm: u8 },
    Mem { op: MemOp, rd: Reg, ra: Reg, ro: Reg },
    Rel { op: RelOp, offset: i16 },
    Jump { cond: Cond, ra: Reg, rl: Reg },
    Psr { rs: Reg },
    Iret { rs: Reg },
    Gfl { rd: Reg },
    Sfl { rs: Reg },
    Push { rs: Reg, rv: Reg },
    Pop { rs: Reg, rd: Reg },
    Mov { rs: Reg, rd: Reg },
    Msx { rs: Reg, rd: Reg },
    Int,
    Nop,
    Alu { op: AluOp, rs: Reg, rd: Reg },
    Undefined(u16),
}

impl Instruction {
    pub fn decode(word: u16) -> Instruction {
        use Instruction::*;

        let r1 = Reg::field(word, 12);
        let r2 = Reg::field(word, 8);
        let rd = Reg::field(word, 4);

        match word & 0xf {
            0x0..=0x3 => {
                let op = match word & 0b11 {
                    0 => ImmOp::Ldi,
                    1 => ImmOp::Ldh,
                    2 => ImmOp::Adi,
                    _ => ImmOp::Sbi,
                };
                Imm {
                    op,
                    rd,
                    imm: (word >> 8) as u8,
                }
            }
            0x4..=0x7 => {
                let op = match word & 0b11 {
                    0 => MemOp::Ldw,
                    1 => MemOp::Stw,
                    2 => MemOp::Ldb,
                    _ => MemOp::Stb,
                };
                Mem {
                    op,
                    rd,
                    ra: r1,
                    ro: r2,
                }
            }
            0xc..=0xf => {
                let op = match word & 0b11 {
                    0 => RelOp::Rjmp,
                    1 => RelOp::Rcall,
                    2 => RelOp::Rjz,
                    _ => RelOp::Rjn,
                };
                let field = ((word & 0xfff0) >> 3) as i32;
                Rel {
                    op,
                    offset: (field - REL_OFFSET_BIAS) as i16,
                }
            }
            0x8 => {
                let sub = (word & 0b0011_0000) >> 4;
                match (word & LONG_GROUP_MASK) >> 6 {
                    0 => {
                        let cond = match sub {
                            0 => Cond::Always,
                            1 => Cond::Zero,
                            2 => Cond::NotZero,
                            _ => Cond::Negative,
                        };
                        Jump { cond, ra: r1, rl: r2 }
                    }
                    1 => match sub {
                        0 => Psr { rs: r1 },
                        1 => Iret { rs: r1 },
                        2 => Gfl { rd: r2 },
                        _ => Sfl { rs: r1 },
                    },
                    2 => match sub {
                        0 => Push { rs: r1, rv: r2 },
                        1 => Pop { rs: r1, rd: r2 },
                        2 => Mov { rs: r1, rd: r2 },
                        _ => Msx { rs: r1, rd: r2 },
                    },
                    _ => {
                        if word & 0xf0 == 0xc0 {
                            Int
                        } else {
                            Nop
                        }
                    }
                }
            }
            0x9 => Alu {
                op: AluOp::from_field(word >> 4),
                rs: r1,
                rd: r2,
            },
            _ => Undefined(word),
        }
    }

    pub fn encode(&self) -> u16 {
        use Instruction::*;

        fn long(r1: Reg, r2: Reg, low: u16) -> u16 {
            (r1.index() as u16) << 12 | (r2.index() as u16) << 8 | low
        }

        match *self {
            Imm { op, rd, imm } => {
                let low = match op {
                    ImmOp::Ldi => 0,
                    ImmOp::Ldh => 1,
                    ImmOp::Adi => 2,
                    ImmOp::Sbi => 3,
                };
                (imm as u16) << 8 | (rd.index() as u16) << 4 | low
            }
            Mem { op, rd, ra, ro } => {
                let low = match op {
                    MemOp::Ldw => 0x4,
                    MemOp::Stw => 0x5,
                    MemOp::Ldb => 0x6,
                    MemOp::Stb => 0x7,
                };
                long(ra, ro, (rd.index() as u16) << 4 | low)
            }
            Rel { op, offset } => {
                let low = match op {
                    RelOp::Rjmp => 0xc,
                    RelOp::Rcall => 0xd,
                    RelOp::Rjz => 0xe,
                    RelOp::Rjn => 0xf,
                };
                let field = ((offset as i32 + REL_OFFSET_BIAS) >> 1) as u16 & 0x0fff;
                field << 4 | low
            }
            Jump { cond, ra, rl } => {
                let cc = match cond {
                    Cond::Always => 0x08,
                    Cond::Zero => 0x18,
                    Cond::NotZero => 0x28,
                    Cond::Negative => 0x38,
                };
                long(ra, rl, cc)
            }
            Psr { rs } => long(rs, Reg::ZERO, 0x48),
            Iret { rs } => long(rs, Reg::ZERO, 0x58),
            Gfl { rd } => long(Reg::ZERO, rd, 0x68),
            Sfl { rs } => long(rs, Reg::ZERO, 0x78),
            Push { rs, rv } => long(rs, rv, 0x88),
            Pop { rs, rd } => long(rs, rd, 0x98),
            Mov { rs, rd } => long(rs, rd, 0xa8),
            Msx { rs, rd } => long(rs, rd, 0xb8),
            Int => 0x00c8,
            Nop => 0x00f8,
            Alu { op, rs, rd } => long(rs, rd, op.field() << 4 | 0x9),
            Undefined(word) => word,
        }
    }

    // `addr` is where the instruction lives; relative targets are shown absolute
    pub fn disassemble(&self, addr: u16) -> String {
        use Instruction::*;

        match *self {
            Imm { op, rd, imm } => {
                let mnemonic = match op {
                    ImmOp::Ldi => "ldi",
                    ImmOp::Ldh => "ldh",
                    ImmOp::Adi => "adi",
                    ImmOp::Sbi => "sbi",
                };
                format!("{} {}, 0x{:02x}", mnemonic, rd, imm)
            }
            Mem { op, rd, ra, ro } => {
                let mnemonic = match op {
                    MemOp::Ldw => "ldw",
                    MemOp::Stw => "stw",
                    MemOp::Ldb => "ldb",
                    MemOp::Stb => "stb",
                };
                if ro == Reg::ZERO {
                    format!("{} {}, {}", mnemonic, rd, ra)
                } else {
                    format!("{} {}, {}, {}", mnemonic, rd, ra, ro)
                }
            }
            Rel { op, offset } => {
                let mnemonic = match op {
                    RelOp::Rjmp => "rjmp",
                    RelOp::Rcall => "rcall",
                    RelOp::Rjz => "rjz",
                    RelOp::Rjn => "rjn",
                };
                format!("{} 0x{:04x}", mnemonic, addr.wrapping_add(offset as u16))
            }
            Jump { cond, ra, rl } => {
                let mnemonic = match cond {
                    Cond::Always => "jmp",
                    Cond::Zero => "jz",
                    Cond::NotZero => "jnz",
                    Cond::Negative => "jn",
                };
                if rl == Reg::ZERO {
                    format!("{} {}", mnemonic, ra)
                } else {
                    format!("{} {}, {}", mnemonic, ra, rl)
                }
            }
            Psr { rs } => format!("psr {}", rs),
            Iret { rs } => format!("iret {}", rs),
            Gfl { rd } => format!("gfl {}", rd),
            Sfl { rs } => format!("sfl {}", rs),
            Push { rs, rv } => format!("push {}, {}", rs, rv),
            Pop { rs, rd } => format!("pop {}, {}", rs, rd),
            Mov { rs, rd } => format!("mov {}, {}", rs, rd),
            Msx { rs, rd } => format!("msx {}, {}", rs, rd),
            Int => "int".to_string(),
            Nop => "nop".to_string(),
            Alu { op, rs, rd } => match op {
                AluOp::Not | AluOp::Rdf => format!("{} {}", op.mnemonic(), rd),
                AluOp::Wrf => format!("{} {}", op.mnemonic(), rs),
                _ => format!("{} {}, {}", op.mnemonic(), rs, rd),
            },
            Undefined(word) => format!(".data 0x{:04x}", word),
        }
    }
}
