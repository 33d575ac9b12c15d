use std::collections::VecDeque;
use std::io::Write;

use crossbeam_channel::Receiver;
use log::{error, trace};

pub const RX_FIFO_DEPTH: usize = 16;
// the receive interrupt fires once this many bytes are waiting...
const IRQ_FILL_LEVEL: usize = 4;
// ...or once the oldest byte has waited this many clocks
const IRQ_TIMEOUT: usize = 16;

pub const RX_EMPTY: u16 = 0xffff;

pub struct Serial<W: Write> {
    rx: VecDeque<u8>,
    host: Option<Receiver<u8>>,
    tx: W,
    cycles_since_first_byte: usize,
}

impl<W: Write> Serial<W> {
    pub fn new(tx: W) -> Self {
        Serial {
            rx: VecDeque::with_capacity(RX_FIFO_DEPTH),
            host: None,
            tx,
            cycles_since_first_byte: 0,
        }
    }

    pub fn with_host_input(tx: W, host: Receiver<u8>) -> Self {
        let mut serial = Serial::new(tx);
        serial.host = Some(host);
        serial
    }

    // returns false when the fifo is full and the byte was dropped
    pub fn push_rx(&mut self, byte: u8) -> bool {
        if self.rx.len() >= RX_FIFO_DEPTH {
            return false;
        }
        self.rx.push_back(byte);
        true
    }

    pub fn rx_len(&self) -> usize {
        self.rx.len()
    }

    // returned value is the irq line
    pub fn clock(&mut self) -> bool {
        if let Some(host) = &self.host {
            while self.rx.len() < RX_FIFO_DEPTH {
                match host.try_recv() {
                    Ok(b) => self.rx.push_back(b),
                    Err(_) => break,
                }
            }
        }
        if !self.rx.is_empty() {
            self.cycles_since_first_byte += 1;
        }
        self.rx.len() >= IRQ_FILL_LEVEL || self.cycles_since_first_byte >= IRQ_TIMEOUT
    }

    pub fn read(&mut self) -> u16 {
        let value = self.rx.pop_front().map(|b| b as u16).unwrap_or(RX_EMPTY);
        if self.rx.is_empty() {
            self.cycles_since_first_byte = 0;
        }
        trace!("serial read {:04x}", value);
        value
    }

    // what the next read would return, without popping it
    pub fn peek(&self) -> u16 {
        self.rx.front().map(|b| *b as u16).unwrap_or(RX_EMPTY)
    }

    pub fn write(&mut self, byte: u8) {
        trace!("serial write {:02x}", byte);
        if let Err(e) = self.tx.write_all(&[byte]).and_then(|_| self.tx.flush()) {
            error!("serial transmit failed: {}", e);
        }
    }

    pub fn tx(&self) -> &W {
        &self.tx
    }

    pub fn into_tx(self) -> W {
        self.tx
    }
}
