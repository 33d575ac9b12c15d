use std::io::Write;

use log::debug;

use crate::rom::{Rom, ROM_START};
use crate::serial::Serial;

/*
  _______________ $10000
 | ROM (4 KiB)   |        vectors at $FFFA (irq), $FFFC (nmi), $FFFE (reset)
 |_______________| $F000
 | unmapped      |
 |_ _ _ _ _ _ _ _| $E102
 | EXIT          |        any write stops the machine
 |_ _ _ _ _ _ _ _| $E100
 | unmapped      |
 |_ _ _ _ _ _ _ _| $E004
 | SERIAL RX     |        read pops one byte, $FFFF when empty
 |_ _ _ _ _ _ _ _| $E002
 | SERIAL TX     |        write sends the low byte
 |_______________| $E000
 | unmapped      |
 |_______________| $8000
 | RAM (32 KiB)  |
 |_______________| $0000
*/

pub const RAM_SIZE: usize = 0x8000;

pub const SERIAL_TX: u16 = 0xe000;
pub const SERIAL_RX: u16 = 0xe002;
pub const EXIT: u16 = 0xe100;

/// Everything the processor can see through its address lines.
///
/// Word accesses are little-endian. Reads take `&mut self` because device
/// registers (the serial receive port) change state when read.
pub trait Memory {
    fn read_u8(&mut self, addr: u16) -> u8;
    fn write_u8(&mut self, addr: u16, value: u8);

    fn read_u16(&mut self, addr: u16) -> u16 {
        let lo = self.read_u8(addr);
        let hi = self.read_u8(addr.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    fn write_u16(&mut self, addr: u16, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.write_u8(addr, lo);
        self.write_u8(addr.wrapping_add(1), hi);
    }

    /// A read that leaves device state alone, for tracing.
    fn peek_u16(&mut self, addr: u16) -> u16 {
        self.read_u16(addr)
    }

    /// Advance devices by one step; the return value is the irq line.
    fn clock(&mut self) -> bool {
        false
    }

    fn should_exit(&self) -> bool {
        false
    }
}

pub struct Bus<W: Write> {
    ram: Vec<u8>,
    rom: Rom,
    serial: Serial<W>,
    exit_requested: bool,
}

impl<W: Write> Bus<W> {
    pub fn new(rom: Rom, serial: Serial<W>) -> Bus<W> {
        Bus {
            ram: vec![0; RAM_SIZE],
            rom,
            serial,
            exit_requested: false,
        }
    }

    pub fn serial(&self) -> &Serial<W> {
        &self.serial
    }

    pub fn serial_mut(&mut self) -> &mut Serial<W> {
        &mut self.serial
    }

    pub fn into_serial(self) -> Serial<W> {
        self.serial
    }

    pub fn write_batch(&mut self, start_addr: u16, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.write_u8(start_addr.wrapping_add(i as u16), *b);
        }
    }
}

impl<W: Write> Memory for Bus<W> {
    fn read_u8(&mut self, addr: u16) -> u8 {
        match addr {
            a if (a as usize) < RAM_SIZE => self.ram[a as usize],
            a if a >= ROM_START => self.rom.read(a - ROM_START),
            SERIAL_RX => self.serial.read() as u8,
            _ => 0,
        }
    }

    fn write_u8(&mut self, addr: u16, value: u8) {
        match addr {
            a if (a as usize) < RAM_SIZE => self.ram[a as usize] = value,
            SERIAL_TX => self.serial.write(value),
            EXIT => self.exit_requested = true,
            a if a >= ROM_START => debug!("ignoring write of {:02x} to rom at {:04x}", value, a),
            _ => {}
        }
    }

    // word accesses must not touch the neighbouring port or wrap the ROM
    fn read_u16(&mut self, addr: u16) -> u16 {
        match addr {
            a if (a as usize) < RAM_SIZE => {
                let lo = self.ram[a as usize];
                let hi = self.ram.get(a as usize + 1).copied().unwrap_or(0);
                u16::from_le_bytes([lo, hi])
            }
            a if a >= ROM_START => {
                let offset = a - ROM_START;
                u16::from_le_bytes([self.rom.read(offset), self.rom.read(offset + 1)])
            }
            SERIAL_RX => self.serial.read(),
            _ => 0,
        }
    }

    fn write_u16(&mut self, addr: u16, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        match addr {
            a if (a as usize) < RAM_SIZE => {
                self.ram[a as usize] = lo;
                if let Some(b) = self.ram.get_mut(a as usize + 1) {
                    *b = hi;
                }
            }
            _ => self.write_u8(addr, lo),
        }
    }

    fn peek_u16(&mut self, addr: u16) -> u16 {
        match addr {
            SERIAL_RX => self.serial.peek(),
            _ => self.read_u16(addr),
        }
    }

    fn clock(&mut self) -> bool {
        self.serial.clock()
    }

    fn should_exit(&self) -> bool {
        self.exit_requested
    }
}
