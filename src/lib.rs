//! STM32 Serial Bootloader flasher.
//!
//! Base on AN3155
//!
//! A [`Programmer`] owns a serial port for the duration of a session and runs a
//! full program cycle: reset into the bootloader, auto-baud, version and chip
//! ID queries, erase, then the write loop. Any protocol failure ends the
//! session, but the reset lines are always restored on the way out.

use core::fmt;
use core::marker::PhantomData;
use std::convert::TryFrom;
use std::time::{Duration, Instant};

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod device;
pub mod image;
pub mod progress;
pub mod protocol;
pub mod task;

use device::ChipIdentity;
use image::{FlashImage, ImageSource};
use progress::Observer;
use protocol::*;

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;

    /// Called once the session is finished with the port
    fn close(&mut self) -> Result<(), E> {
        Ok(())
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Idle,
    EnteringBootMode,
    AutoBauding,
    QueryingVersion,
    QueryingId,
    Erasing,
    Programming { offset: usize },
    Exiting,
    Completed,
    Failed,
}

/// Protocol exchange that was waiting on an acknowledgment
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Stage {
    GetVersion,
    GetId,
    EraseCommand,
    ErasePages,
    WriteCommand { address: u32 },
    WriteAddress { address: u32 },
    WriteData { address: u32 },
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::GetVersion => write!(f, "get version"),
            Stage::GetId => write!(f, "get ID"),
            Stage::EraseCommand => write!(f, "erase command"),
            Stage::ErasePages => write!(f, "erase pages"),
            Stage::WriteCommand { address } => write!(f, "write command at 0x{:08x}", address),
            Stage::WriteAddress { address } => write!(f, "write address 0x{:08x}", address),
            Stage::WriteData { address } => write!(f, "write data at 0x{:08x}", address),
        }
    }
}

/// Outcome of waiting for an acknowledgment.
///
/// Bytes received that were neither ACK nor NACK are kept in the
/// programmer's diagnostic buffer and copied into the failure variants.
#[derive(Clone, PartialEq, Debug)]
pub enum AckResult {
    Acked,
    Nacked(Vec<u8>),
    TimedOut(Vec<u8>),
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("failed to open serial port: {0}")]
    TransportOpen(String),

    #[error("auto-baud failed (response: {response:02x?})")]
    AutoBaudFailed { response: Vec<u8> },

    #[error("NACK received for {stage} (buffer: {diagnostics:02x?})")]
    Nack { stage: Stage, diagnostics: Vec<u8> },

    #[error("timeout awaiting ACK for {stage} (buffer: {diagnostics:02x?})")]
    AckTimeout { stage: Stage, diagnostics: Vec<u8> },

    #[error("invalid response for {stage} (buffer: {diagnostics:02x?})")]
    InvalidResponse { stage: Stage, diagnostics: Vec<u8> },

    #[error("unknown chip ID 0x{0:03x}")]
    UnknownChip(u16),

    #[error("failed to load image: {0:?}")]
    ImageLoad(std::io::ErrorKind),

    #[error("image is empty")]
    EmptyImage,

    #[error("image spans {pages} pages, too many to erase by page list")]
    ImageTooLarge { pages: usize },

    #[error("{0}")]
    Frame(InvalidLength),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl<SerialError> Error<SerialError> {
    /// Unexpected bytes received before the failure, if any
    pub fn diagnostics(&self) -> &[u8] {
        match self {
            Error::AutoBaudFailed { response } => response.as_slice(),
            Error::Nack { diagnostics, .. }
            | Error::AckTimeout { diagnostics, .. }
            | Error::InvalidResponse { diagnostics, .. } => diagnostics.as_slice(),
            _ => &[],
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to hold the reset lines when entering or leaving the bootloader
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub reset_delay_ms: u32,

    /// Period to wait for bootloader init before sending init character
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub init_delay_ms: u32,

    /// Timeout to wait for the auto-baud response
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5"))]
    pub autobaud_timeout_ms: u32,

    /// Timeout to wait for an erase to complete
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2000"))]
    pub erase_timeout_ms: u32,

    /// Timeout to wait for a block write to complete
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2000"))]
    pub write_timeout_ms: u32,

    /// Erase the whole flash instead of only the pages covered by the image
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub erase_all: bool,

    /// Flash address the image is written to
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "0x08000000", parse(try_from_str = parse_u32))
    )]
    pub flash_base: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 10,
            poll_delay_ms: 1,
            reset_delay_ms: 100,
            init_delay_ms: 10,
            autobaud_timeout_ms: 5,
            erase_timeout_ms: 2000,
            write_timeout_ms: 2000,
            erase_all: false,
            flash_base: FLASH_BASE,
        }
    }
}

#[cfg(feature = "structopt")]
fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Upper bound on bytes kept while waiting for an acknowledgment
pub const MAX_DIAGNOSTICS: usize = 256;

/// Response deadline counted in poll periods and bounded by wall clock time,
/// so a line that never goes quiet still times out
struct Deadline {
    polled_ms: u32,
    timeout_ms: u32,
    started: Instant,
}

impl Deadline {
    fn new(timeout_ms: u32) -> Self {
        Self {
            polled_ms: 0,
            timeout_ms,
            started: Instant::now(),
        }
    }

    fn expired(&self) -> bool {
        self.polled_ms >= self.timeout_ms
            || self.started.elapsed() >= Duration::from_millis(self.timeout_ms.into())
    }

    fn wait<D: DelayMs<u32>>(&mut self, delay: &mut D, poll: u32) {
        delay.delay_ms(poll);
        self.polled_ms = self.polled_ms.saturating_add(poll);
    }
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    buffer: Vec<u8>,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Idle,
            options,
            port,
            delay,
            buffer: Vec::new(),
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    /// Bytes collected by the most recent acknowledgment wait
    pub fn diagnostics(&self) -> &[u8] {
        &self.buffer
    }

    /// Hand the port and delay back to the caller
    pub fn release(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Execute a full program cycle with the provided image.
    ///
    /// The boot mode exit sequence runs whether or not programming succeeded,
    /// and the outcome is reported to the observer before being returned.
    pub fn run<S, O>(&mut self, image: S, mut observer: O) -> Result<(), Error<E>>
    where
        S: ImageSource,
        O: Observer<E>,
    {
        observer.on_start();
        observer.on_progress(0);

        let mut outcome = self.session(image, &mut observer);

        self.transition(State::Exiting, &mut observer);
        if let Err(e) = self.exit_boot_mode() {
            if outcome.is_ok() {
                outcome = Err(e);
            } else {
                warn!("Error leaving boot mode after failure: {}", e);
            }
        }

        match &outcome {
            Ok(()) => {
                info!("Programming complete");
                self.transition(State::Completed, &mut observer);
            }
            Err(e) => {
                error!("Programming failed: {}", e);
                self.transition(State::Failed, &mut observer);
            }
        }

        observer.on_finished(&outcome);
        outcome
    }

    fn session<S, O>(&mut self, source: S, observer: &mut O) -> Result<(), Error<E>>
    where
        S: ImageSource,
        O: Observer<E>,
    {
        self.transition(State::EnteringBootMode, observer);
        self.enter_boot_mode()?;

        self.transition(State::AutoBauding, observer);
        self.auto_baud()?;

        self.transition(State::QueryingVersion, observer);
        let version = self.get_version()?;
        if let Some(v) = version.first() {
            info!("Bootloader version {}.{}", v >> 4, v & 0x0F);
        }
        observer.on_progress(5);

        self.transition(State::QueryingId, observer);
        let chip = self.identify()?;
        observer.on_progress(10);

        let image = source.load().map_err(|e| Error::ImageLoad(e.kind()))?;
        if image.is_empty() {
            return Err(Error::EmptyImage);
        }
        info!("Loaded {} byte image", image.len());
        observer.on_progress(15);

        self.transition(State::Erasing, observer);
        if self.options.erase_all {
            self.erase_all()?;
        } else {
            let pages = image::erase_pages(image.len(), chip.page_size)
                .map_err(|pages| Error::ImageTooLarge { pages })?;
            self.erase_pages(&pages)?;
        }
        observer.on_progress(20);

        self.program(&image, chip, observer)
    }

    fn program<O: Observer<E>>(
        &mut self,
        image: &FlashImage,
        chip: ChipIdentity,
        observer: &mut O,
    ) -> Result<(), Error<E>> {
        let base = self.options.flash_base;
        let mut offset = 0;

        while offset < image.len() {
            self.transition(State::Programming { offset }, observer);

            let address = u32::try_from(offset)
                .ok()
                .and_then(|o| base.checked_add(o))
                .ok_or_else(|| Error::ImageTooLarge {
                    pages: image.page_count(chip.page_size),
                })?;

            let chunk = image.chunk(offset);
            self.write_memory(address, &chunk.data)?;

            offset += chunk.len;
            debug!("Wrote 0x{:08x}, offset {}/{}", address, offset, image.len());
            observer.on_progress(image::write_progress(offset, image.len()));
        }

        Ok(())
    }

    fn transition<O: Observer<E>>(&mut self, state: State, observer: &mut O) {
        trace!("State {:?} -> {:?}", self.state, state);
        self.state = state;
        observer.on_state(state);
    }

    /// Hold DTR and pulse RTS to reset the target into its bootloader
    pub fn enter_boot_mode(&mut self) -> Result<(), Error<E>> {
        block!(self.port.flush())?;

        if self.options.no_reset {
            return Ok(());
        }

        debug!("Resetting device into bootloader");

        self.port.set_dtr(true)?;
        self.port.set_rts(true)?;

        self.delay.delay_ms(self.options.reset_delay_ms);
        self.discard_input()?;

        self.port.set_rts(false)?;
        self.delay.delay_ms(self.options.init_delay_ms);

        Ok(())
    }

    /// Release DTR and pulse RTS to restart the application, then close the port
    pub fn exit_boot_mode(&mut self) -> Result<(), Error<E>> {
        let restored = self.restore_lines();
        let closed = self.port.close().map_err(Error::from);

        restored.and(closed)
    }

    fn restore_lines(&mut self) -> Result<(), Error<E>> {
        // The lines are restored even if the port has already failed
        let flushed = block!(self.port.flush()).map_err(Error::from);

        if self.options.no_reset {
            return flushed;
        }

        debug!("Resetting device into application");

        let released = self.port.set_dtr(false).and(self.port.set_rts(true));

        self.delay.delay_ms(self.options.reset_delay_ms);
        let discarded = self.discard_input().map(|_| ());

        let reset = self.port.set_rts(false);
        self.delay.delay_ms(self.options.init_delay_ms);

        flushed
            .and(released.map_err(Error::from))
            .and(discarded)
            .and(reset.map_err(Error::from))
    }

    /// Send the discovery character and check the bootloader replies with an ACK
    pub fn auto_baud(&mut self) -> Result<(), Error<E>> {
        debug!("Sending discovery character");
        self.write_bytes(&[UART_DISC])?;

        debug!("Awaiting bootloader response");
        let timeout = self.options.autobaud_timeout_ms;
        match self.poll_byte(timeout)? {
            Some(UART_ACK) => {
                self.discard_input()?;
                debug!("Bootloader synchronised");
                Ok(())
            }
            Some(v) => {
                let mut response = vec![v];
                response.extend(self.discard_input()?);
                error!("Auto-baud failed, response: {:02x?}", response);
                Err(Error::AutoBaudFailed { response })
            }
            None => {
                error!("Auto-baud timeout");
                Err(Error::AutoBaudFailed { response: Vec::new() })
            }
        }
    }

    /// Fetch the raw bootloader version response
    pub fn get_version(&mut self) -> Result<Vec<u8>, Error<E>> {
        let version = self.query(Command::GetVersionReadStatus, Stage::GetVersion)?;
        debug!("Version response: {:02x?}", version);
        Ok(version)
    }

    /// Fetch the chip ID
    pub fn chip_id(&mut self) -> Result<u16, Error<E>> {
        let response = self.query(Command::GetId, Stage::GetId)?;
        debug!("ID response: {:02x?}", response);

        // First byte is the count of ID bytes that follow
        match response.get(1..3) {
            Some(&[hi, lo]) => Ok(u16::from_be_bytes([hi, lo])),
            _ => Err(Error::InvalidResponse {
                stage: Stage::GetId,
                diagnostics: response,
            }),
        }
    }

    /// Fetch the chip ID and resolve its flash page size
    pub fn identify(&mut self) -> Result<ChipIdentity, Error<E>> {
        let chip_id = self.chip_id()?;

        let chip = match ChipIdentity::resolve(chip_id) {
            Some(c) => c,
            None => {
                error!("Cannot find density for chip ID 0x{:03x}", chip_id);
                return Err(Error::UnknownChip(chip_id));
            }
        };

        info!(
            "Chip ID: 0x{:03x} ({}), page size: {}",
            chip.chip_id, chip.name, chip.page_size
        );

        Ok(chip)
    }

    /// Erase the listed flash pages.
    ///
    /// At most 255 pages fit in one list, larger images need
    /// [`Options::erase_all`] (`--erase-all` on the command line).
    pub fn erase_pages(&mut self, pages: &[u8]) -> Result<(), Error<E>> {
        debug!("Erasing {} pages", pages.len());

        let frame = data_frame(pages).map_err(Error::Frame)?;
        self.erase(&frame)?;

        info!("Erased {} pages", pages.len());
        Ok(())
    }

    /// Erase the whole flash
    pub fn erase_all(&mut self) -> Result<(), Error<E>> {
        debug!("Erasing all pages");

        self.erase(&erase_all_frame())?;

        info!("Erased all pages");
        Ok(())
    }

    fn erase(&mut self, frame: &[u8]) -> Result<(), Error<E>> {
        self.write_bytes(&Command::Erase.frame())?;
        self.expect_ack(Stage::EraseCommand, self.options.response_timeout_ms)?;

        self.write_bytes(frame)?;
        self.expect_ack(Stage::ErasePages, self.options.erase_timeout_ms)
    }

    /// Write a block of up to 256 bytes to memory at the provided address
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        let frame = data_frame(data).map_err(Error::Frame)?;

        self.write_bytes(&Command::WriteMemory.frame())?;
        self.expect_ack(Stage::WriteCommand { address }, self.options.response_timeout_ms)?;

        self.write_bytes(&address_frame(address))?;
        self.expect_ack(Stage::WriteAddress { address }, self.options.response_timeout_ms)?;

        self.write_bytes(&frame)?;
        self.expect_ack(Stage::WriteData { address }, self.options.write_timeout_ms)
    }

    /// Issue a command that returns data.
    ///
    /// The bootloader acknowledges the command, sends the payload, then
    /// terminates it with a second ACK, so the payload is whatever the
    /// second wait collected.
    fn query(&mut self, command: Command, stage: Stage) -> Result<Vec<u8>, Error<E>> {
        self.write_bytes(&command.frame())?;

        let timeout = self.options.response_timeout_ms;
        self.expect_ack(stage, timeout)?;
        self.expect_ack(stage, timeout)?;

        Ok(self.buffer.clone())
    }

    fn expect_ack(&mut self, stage: Stage, timeout_ms: u32) -> Result<(), Error<E>> {
        match self.await_ack(timeout_ms)? {
            AckResult::Acked => Ok(()),
            AckResult::Nacked(diagnostics) => {
                error!("{} failed, NACK (buffer: {:02x?})", stage, diagnostics);
                Err(Error::Nack { stage, diagnostics })
            }
            AckResult::TimedOut(diagnostics) => {
                error!("{} failed, timeout (buffer: {:02x?})", stage, diagnostics);
                Err(Error::AckTimeout { stage, diagnostics })
            }
        }
    }

    /// Read from the port until an ACK or NACK arrives or the timeout expires.
    ///
    /// Other bytes are collected into the diagnostic buffer, which is cleared
    /// at the start of each call and keeps at most [`MAX_DIAGNOSTICS`] bytes.
    pub fn await_ack(&mut self, timeout_ms: u32) -> Result<AckResult, Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let mut deadline = Deadline::new(timeout_ms);

        self.buffer.clear();

        loop {
            // Attempt to read from serial port
            let idle = match self.port.read() {
                Err(nb::Error::WouldBlock) => true,
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(UART_ACK) => {
                    debug!("Received bootloader ack");
                    return Ok(AckResult::Acked);
                }
                Ok(UART_NACK) => {
                    debug!("Received bootloader nack");
                    return Ok(AckResult::Nacked(self.buffer.clone()));
                }
                Ok(v) => {
                    trace!("Received 0x{:02x}", v);
                    if self.buffer.len() < MAX_DIAGNOSTICS {
                        self.buffer.push(v);
                    }
                    false
                }
            };

            if deadline.expired() {
                debug!("Receive timeout");
                return Ok(AckResult::TimedOut(self.buffer.clone()));
            }

            // Wait for delay period
            if idle {
                deadline.wait(&mut self.delay, poll);
            }
        }
    }

    /// Wait for a single byte
    fn poll_byte(&mut self, timeout_ms: u32) -> Result<Option<u8>, Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let mut deadline = Deadline::new(timeout_ms);

        loop {
            match self.port.read() {
                Ok(v) => return Ok(Some(v)),
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }

            if deadline.expired() {
                return Ok(None);
            }

            deadline.wait(&mut self.delay, poll);
        }
    }

    /// Read and drop anything pending on the port
    fn discard_input(&mut self) -> Result<Vec<u8>, Error<E>> {
        let mut discarded = Vec::new();

        while discarded.len() < MAX_DIAGNOSTICS {
            match self.port.read() {
                Ok(v) => discarded.push(v),
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }

        if !discarded.is_empty() {
            debug!("Discarded {:02x?}", discarded);
        }

        Ok(discarded)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        Ok(())
    }
}
