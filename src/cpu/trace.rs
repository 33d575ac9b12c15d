use itertools::Itertools;

use super::spec::{Instruction, Reg};
use super::{Flags, Processor};
use crate::bus::Memory;

const FLAG_LETTERS: [(Flags, char); 5] = [
    (Flags::FAULT, 'F'),
    (Flags::INTERRUPTS, 'I'),
    (Flags::CARRY, 'C'),
    (Flags::NEGATIVE, 'N'),
    (Flags::ZERO, 'Z'),
];

impl Processor {
    pub fn trace<M: Memory>(&self, mem: &mut M) -> String {
        let pc = self.pc();
        let word = self.peek(mem);
        let asm = Instruction::decode(word).disassemble(pc);
        let regs = (1..15)
            .map(|i| format!("{}:{:04X}", Reg(i), self.reg(Reg(i))))
            .join(" ");
        format!(
            "{:04X}  {:04X}  {:22} {} P:{} STEP:{}",
            pc,
            word,
            asm,
            regs,
            flags_str(self.flags()),
            self.steps()
        )
    }
}

fn flags_str(flags: Flags) -> String {
    FLAG_LETTERS
        .iter()
        .map(|(f, c)| if flags.contains(*f) { *c } else { '-' })
        .collect()
}
