//! Simulated STM32 bootloader behind the embedded-hal serial traits

#![allow(dead_code)]

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use stm32_uart_flasher::progress::Observer;
use stm32_uart_flasher::protocol::{checksum, UART_ACK, UART_NACK};
use stm32_uart_flasher::{Error, SerialPort, State};

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum MockError {
    Closed,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Line {
    Dtr(bool),
    Rts(bool),
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum Expect {
    Sync,
    Command,
    EraseData,
    WriteAddress,
    WriteData,
}

/// Bootloader state machine, responds to frames as they are written
#[derive(Debug)]
pub struct Device {
    pub chip_id: u16,
    /// Reply to the auto-baud character
    pub sync_reply: u8,
    /// Stop responding once this command is received
    pub silent_on: Option<u8>,
    /// NACK this command
    pub nack_on: Option<u8>,
    /// NACK the erase page list
    pub nack_erase_pages: bool,
    /// Reply to Get-ID with this payload instead of the chip ID
    pub id_payload: Option<Vec<u8>>,

    pub erases: Vec<Vec<u8>>,
    pub global_erases: usize,
    pub writes: Vec<(u32, Vec<u8>)>,

    expect: Expect,
    pending: Vec<u8>,
    address: u32,
    silent: bool,
}

impl Device {
    pub fn new(chip_id: u16) -> Self {
        Self {
            chip_id,
            sync_reply: UART_ACK,
            silent_on: None,
            nack_on: None,
            nack_erase_pages: false,
            id_payload: None,
            erases: Vec::new(),
            global_erases: 0,
            writes: Vec::new(),
            expect: Expect::Sync,
            pending: Vec::new(),
            address: 0,
            silent: false,
        }
    }

    fn feed(&mut self, b: u8) -> Vec<u8> {
        if self.silent {
            return vec![];
        }

        match self.expect {
            Expect::Sync => {
                if b == 0x7F {
                    self.expect = Expect::Command;
                    vec![self.sync_reply]
                } else {
                    vec![]
                }
            }
            Expect::Command => {
                self.pending.push(b);
                if self.pending.len() < 2 {
                    return vec![];
                }
                let (cmd, inv) = (self.pending[0], self.pending[1]);
                self.pending.clear();

                if inv != !cmd || self.nack_on == Some(cmd) {
                    return vec![UART_NACK];
                }
                if self.silent_on == Some(cmd) {
                    self.silent = true;
                    return vec![];
                }

                match cmd {
                    0x01 => vec![UART_ACK, 0x22, 0x00, 0x00, UART_ACK],
                    0x02 => {
                        let id = self.chip_id.to_be_bytes();
                        let payload = self
                            .id_payload
                            .clone()
                            .unwrap_or_else(|| vec![0x01, id[0], id[1]]);

                        let mut reply = vec![UART_ACK];
                        reply.extend(payload);
                        reply.push(UART_ACK);
                        reply
                    }
                    0x43 => {
                        self.expect = Expect::EraseData;
                        vec![UART_ACK]
                    }
                    0x31 => {
                        self.expect = Expect::WriteAddress;
                        vec![UART_ACK]
                    }
                    _ => vec![UART_NACK],
                }
            }
            Expect::EraseData => {
                self.pending.push(b);
                if self.pending == [0xFF, 0x00] {
                    self.pending.clear();
                    self.global_erases += 1;
                    self.expect = Expect::Command;
                    return vec![UART_ACK];
                }
                if self.pending.len() < self.pending[0] as usize + 3 {
                    return vec![];
                }
                self.expect = Expect::Command;
                if self.nack_erase_pages {
                    self.pending.clear();
                    return vec![UART_NACK];
                }
                self.finish_frame(|d, payload| d.erases.push(payload))
            }
            Expect::WriteAddress => {
                self.pending.push(b);
                if self.pending.len() < 5 {
                    return vec![];
                }
                let frame: Vec<u8> = self.pending.drain(..).collect();
                if checksum(&frame[..4]) != frame[4] {
                    self.expect = Expect::Command;
                    return vec![UART_NACK];
                }
                self.address = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
                self.expect = Expect::WriteData;
                vec![UART_ACK]
            }
            Expect::WriteData => {
                self.pending.push(b);
                if self.pending.len() < self.pending[0] as usize + 3 {
                    return vec![];
                }
                self.expect = Expect::Command;
                let address = self.address;
                self.finish_frame(|d, payload| d.writes.push((address, payload)))
            }
        }
    }

    fn finish_frame<F: FnOnce(&mut Self, Vec<u8>)>(&mut self, record: F) -> Vec<u8> {
        let frame: Vec<u8> = self.pending.drain(..).collect();
        let (body, sum) = frame.split_at(frame.len() - 1);
        if checksum(body) != sum[0] {
            return vec![UART_NACK];
        }
        record(self, body[1..].to_vec());
        vec![UART_ACK]
    }
}

/// Serial port stub, either wired to a [`Device`] or fed raw bytes
#[derive(Debug, Default)]
pub struct MockPort {
    pub device: Option<Device>,
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub lines: Vec<Line>,
    pub flushes: usize,
    pub closed: bool,
    /// Fail every write once this many bytes have been sent
    pub close_after_writes: Option<usize>,
    /// Byte returned by every read, a line that never goes quiet
    pub noise: Option<u8>,
}

impl MockPort {
    pub fn with_device(device: Device) -> Self {
        Self {
            device: Some(device),
            ..Self::default()
        }
    }

    pub fn with_rx(rx: &[u8]) -> Self {
        Self {
            rx: rx.iter().cloned().collect(),
            ..Self::default()
        }
    }

    pub fn device(&self) -> &Device {
        self.device.as_ref().unwrap()
    }
}

impl Read<u8> for MockPort {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, MockError> {
        if self.closed {
            return Err(nb::Error::Other(MockError::Closed));
        }
        if let Some(v) = self.noise {
            return Ok(v);
        }
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for MockPort {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), MockError> {
        if Some(self.tx.len()) == self.close_after_writes {
            self.closed = true;
        }
        if self.closed {
            return Err(nb::Error::Other(MockError::Closed));
        }
        self.tx.push(word);
        if let Some(d) = self.device.as_mut() {
            let reply = d.feed(word);
            self.rx.extend(reply);
        }
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), MockError> {
        if self.closed {
            return Err(nb::Error::Other(MockError::Closed));
        }
        self.flushes += 1;
        Ok(())
    }
}

impl SerialPort<MockError> for MockPort {
    fn set_rts(&mut self, level: bool) -> Result<(), MockError> {
        self.lines.push(Line::Rts(level));
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), MockError> {
        self.lines.push(Line::Dtr(level));
        Ok(())
    }

    fn close(&mut self) -> Result<(), MockError> {
        self.closed = true;
        Ok(())
    }
}

/// Delay that only counts elapsed time
#[derive(Debug, Default)]
pub struct MockDelay {
    pub elapsed_ms: u64,
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += ms as u64;
    }
}

/// Observer recording everything it is told
#[derive(Debug, Default)]
pub struct Recorder {
    pub started: usize,
    pub states: Vec<State>,
    pub progress: Vec<u8>,
    pub finished: Vec<Result<(), Error<MockError>>>,
}

impl Observer<MockError> for Recorder {
    fn on_start(&mut self) {
        self.started += 1;
    }

    fn on_state(&mut self, state: State) {
        self.states.push(state);
    }

    fn on_progress(&mut self, value: u8) {
        self.progress.push(value);
    }

    fn on_finished(&mut self, outcome: &Result<(), Error<MockError>>) {
        self.finished.push(outcome.clone());
    }
}

/// Control line sequence for one reset pulse into or out of the bootloader
pub fn enter_lines() -> Vec<Line> {
    vec![Line::Dtr(true), Line::Rts(true), Line::Rts(false)]
}

pub fn exit_lines() -> Vec<Line> {
    vec![Line::Dtr(false), Line::Rts(true), Line::Rts(false)]
}
