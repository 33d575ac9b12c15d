use std::io::{BufRead, Write};

use log::warn;

use crate::bus::Memory;

/// A `Memory` backed by a person at a terminal.
///
/// Every read is answered with a hex word typed on the input, every write is
/// echoed and acknowledged with an empty line. Words are typed as they sit in
/// memory, high byte first, so a fetch takes the instruction word as written
/// and a vector typed `0001` points at 0x0100. A byte read takes the low byte
/// of what was typed. End of input answers 0 and asks the machine to stop.
pub struct MemShell<R: BufRead, W: Write> {
    input: R,
    output: W,
    eof: bool,
}

impl<R: BufRead, W: Write> MemShell<R, W> {
    pub fn new(input: R, output: W) -> Self {
        MemShell {
            input,
            output,
            eof: false,
        }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    fn prompt(&mut self, msg: String) {
        if let Err(e) = writeln!(self.output, "{}", msg).and_then(|_| self.output.flush()) {
            warn!("shell output failed: {}", e);
        }
    }

    fn read_line(&mut self) -> Option<String> {
        if self.eof {
            return None;
        }
        let mut buf = String::new();
        match self.input.read_line(&mut buf) {
            Ok(0) => {
                warn!("shell input closed");
                self.eof = true;
                None
            }
            Ok(_) => Some(buf),
            Err(e) => {
                warn!("shell input failed: {}", e);
                self.eof = true;
                None
            }
        }
    }

    fn answer_read(&mut self, addr: u16) -> u16 {
        self.prompt(format!("read from {:04x}", addr));
        let line = match self.read_line() {
            Some(line) => line,
            None => return 0,
        };
        u16::from_str_radix(line.trim(), 16).unwrap_or_else(|_| {
            warn!("`{}` is not a hex word, reading 0", line.trim());
            0
        })
    }

    fn acknowledge_write(&mut self, addr: u16, value: u16) {
        self.prompt(format!("wrote {:04x} to {:04x}", value, addr));
        self.read_line();
    }
}

impl<R: BufRead, W: Write> Memory for MemShell<R, W> {
    fn read_u8(&mut self, addr: u16) -> u8 {
        self.answer_read(addr) as u8
    }

    fn write_u8(&mut self, addr: u16, value: u8) {
        self.acknowledge_write(addr, value as u16);
    }

    fn read_u16(&mut self, addr: u16) -> u16 {
        self.answer_read(addr).swap_bytes()
    }

    fn write_u16(&mut self, addr: u16, value: u16) {
        self.acknowledge_write(addr, value.swap_bytes());
    }

    // nobody is asked, so nothing is consumed from the input
    fn peek_u16(&mut self, _addr: u16) -> u16 {
        0
    }

    fn should_exit(&self) -> bool {
        self.eof
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cpu::spec::Reg;
    use crate::cpu::Processor;
    use std::io::Cursor;

    fn new_shell(input: &str) -> MemShell<Cursor<Vec<u8>>, Vec<u8>> {
        MemShell::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    #[test]
    fn test_read_parses_hex_word() {
        let mut shell = new_shell("f000\n  1a \n");
        assert_eq!(shell.read_u16(0xfffe), 0x00f0);
        assert_eq!(shell.read_u8(0x0010), 0x1a);
        assert!(!shell.should_exit());
        let output = String::from_utf8(shell.into_output()).unwrap();
        assert_eq!(output, "read from fffe\nread from 0010\n");
    }

    #[test]
    fn test_write_waits_for_line() {
        let mut shell = new_shell("\n\n1234\n");
        shell.write_u16(0x7ffe, 0xbeef);
        shell.write_u8(0xe000, b'A');
        assert_eq!(shell.read_u16(0x0000), 0x3412);
        let output = String::from_utf8(shell.into_output()).unwrap();
        assert_eq!(
            output,
            "wrote efbe to 7ffe\nwrote 0041 to e000\nread from 0000\n"
        );
    }

    #[test]
    fn test_processor_reads_words_as_typed() {
        // reset vector, then ldi r1, 0x41
        let mut shell = new_shell("0001\n4110\n");
        let mut cpu = Processor::new();
        cpu.reset(&mut shell);
        assert_eq!(cpu.pc(), 0x0100);

        assert_eq!(cpu.peek(&mut shell), 0);
        cpu.step(&mut shell);
        assert_eq!(cpu.reg(Reg(1)), 0x41);
        let output = String::from_utf8(shell.into_output()).unwrap();
        assert_eq!(output, "read from fffe\nread from 0100\n");
    }

    #[test]
    fn test_bad_input_reads_zero() {
        let mut shell = new_shell("zzzz\n");
        assert_eq!(shell.read_u16(0x0000), 0);
        assert!(!shell.should_exit());
    }

    #[test]
    fn test_eof_requests_exit() {
        let mut shell = new_shell("");
        assert_eq!(shell.read_u16(0xfffe), 0);
        assert!(shell.should_exit());
        // no further prompts block once input is gone
        shell.write_u16(0x0000, 1);
        assert_eq!(shell.read_u16(0x0000), 0);
    }
}
