use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind as SerialErrorKind, FlowControl, Parity,
    SerialDevice as _, SerialPortSettings as _, StopBits,
};

use crate::{Error, Options, Programmer, SerialPort};

/// Read timeout of the tty, reads that time out are reported as `WouldBlock`
const READ_TIMEOUT: Duration = Duration::from_millis(1);

fn io_kind(e: SerialError) -> IoErrorKind {
    match e.kind() {
        SerialErrorKind::Io(kind) => kind,
        SerialErrorKind::InvalidInput => IoErrorKind::InvalidInput,
        SerialErrorKind::NoDevice => IoErrorKind::NotFound,
    }
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(io_kind)
    }
}

/// Open a serial port configured for the bootloader (8 data bits, even parity, 1 stop bit)
pub fn open<P: AsRef<Path>>(port: P, baud: usize) -> Result<Serial, Error<IoErrorKind>> {
    let path = port.as_ref();
    let opened = configure(path, baud);

    opened.map_err(|e| Error::TransportOpen(format!("{}: {}", path.display(), e)))
}

fn configure(path: &Path, baud: usize) -> Result<Serial, SerialError> {
    // Open port
    let mut port = Serial::open(path)?;

    // Apply settings
    let mut settings = port.0.read_settings()?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(baud))?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityEven);

    port.0.write_settings(&settings)?;
    port.0.set_timeout(READ_TIMEOUT)?;

    Ok(port)
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, Error<IoErrorKind>> {
        let port = open(port, baud)?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
