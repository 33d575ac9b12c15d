use log::debug;

use crate::bus::Memory;
use crate::cpu::Processor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The program wrote to the exit port (or the memory asked to stop).
    Requested,
    /// The step budget ran out first.
    StepLimit,
}

pub struct Machine<M: Memory> {
    pub cpu: Processor,
    pub mem: M,
}

impl<M: Memory> Machine<M> {
    pub fn new(mut mem: M) -> Machine<M> {
        let mut cpu = Processor::new();
        cpu.reset(&mut mem);
        debug!("reset, pc = {:04x}", cpu.pc());
        Machine { cpu, mem }
    }

    pub fn step(&mut self) {
        self.cpu.step(&mut self.mem);
        if self.mem.clock() {
            self.cpu.irq(&mut self.mem);
        }
    }

    pub fn run(&mut self, max_steps: Option<u64>) -> Exit {
        self.run_with_callback(max_steps, |_| {})
    }

    pub fn run_with_callback<F>(&mut self, max_steps: Option<u64>, mut callback: F) -> Exit
    where
        F: FnMut(&mut Machine<M>),
    {
        let mut steps: u64 = 0;
        loop {
            if self.mem.should_exit() {
                debug!("exit requested after {} steps", steps);
                return Exit::Requested;
            }
            if max_steps.map_or(false, |max| steps >= max) {
                debug!("step limit of {} reached at {:04x}", steps, self.cpu.pc());
                return Exit::StepLimit;
            }
            callback(self);
            self.step();
            steps += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::Bus;
    use crate::cpu::assembler::assemble;
    use crate::serial::Serial;

    fn new_machine(body: &str) -> Machine<Bus<Vec<u8>>> {
        let code = format!(
            ".org 0xf000\n{}\n.spaceto 0xfffa\n.data irq, irq, reset\n",
            body
        );
        let rom = assemble(&code).unwrap().to_rom().unwrap();
        Machine::new(Bus::new(rom, Serial::new(Vec::new())))
    }

    #[test]
    fn test_exit_requested() {
        let mut machine = new_machine(
            r"
        reset:
            li r1, 0xe100
            stb r0, r1
        halt:
            rjmp halt
        irq:
            rjmp irq
        ",
        );
        assert_eq!(machine.run(Some(100)), Exit::Requested);
        assert_eq!(machine.cpu.steps(), 3);
    }

    #[test]
    fn test_step_limit() {
        let mut machine = new_machine(
            r"
        reset:
        irq:
            rjmp reset
        ",
        );
        assert_eq!(machine.run(Some(50)), Exit::StepLimit);
        assert_eq!(machine.cpu.steps(), 50);
        assert_eq!(machine.cpu.pc(), 0xf000);
    }

    #[test]
    fn test_irq_from_serial() {
        let mut machine = new_machine(
            r"
        reset:
            ldi r1, 0b1000      ; interrupts on
            sfl r1
        wait:
            rjmp wait
        irq:
            li r1, 0xe002
            ldw r2, r1
            li r1, 0xe000
            stb r2, r1
            li r1, 0xe100
            stb r0, r1
        ",
        );
        assert_eq!(machine.run(Some(20)), Exit::StepLimit);
        assert!(machine.cpu.interrupts_enabled());

        machine.mem.serial_mut().push_rx(b'x');
        assert_eq!(machine.run(Some(100)), Exit::Requested);
        assert_eq!(machine.mem.serial().tx(), b"x");
        assert!(!machine.cpu.interrupts_enabled());
    }

    #[test]
    fn test_callback_before_each_step() {
        let mut machine = new_machine(
            r"
        reset:
            nop
            nop
            li r1, 0xe100
            stw r0, r1
        irq:
            rjmp irq
        ",
        );
        let mut lines = vec![];
        let exit = machine.run_with_callback(None, |m| {
            lines.push(m.cpu.trace(&mut m.mem));
        });
        assert_eq!(exit, Exit::Requested);
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("F000  00F8  nop"));
        assert!(lines[4].starts_with("F008  1005  stw r0, r1"));
    }
}
