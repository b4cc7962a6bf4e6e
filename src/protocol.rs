//! Wire constants and frame encoding for the STM32 USART bootloader (AN3155).

/// Auto-baud synchronisation character
pub const UART_DISC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Maximum payload of a single data frame
pub const MAX_CHUNK: usize = 256;

/// Value of erased flash, used to pad partial write windows
pub const ERASED_BYTE: u8 = 0xFF;

/// Global erase marker for the Erase command
pub const ERASE_ALL: u8 = 0xFF;

/// Start of the internal flash on STM32 parts
pub const FLASH_BASE: u32 = 0x0800_0000;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersionReadStatus = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,
}

impl Command {
    /// Encode the command as a `[cmd, !cmd]` frame
    pub fn frame(self) -> [u8; 2] {
        command_frame(self as u8)
    }
}

/// Data frame payload was empty or longer than [`MAX_CHUNK`]
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("invalid data frame length {0} (expected 1..={})", MAX_CHUNK)]
pub struct InvalidLength(pub usize);

/// Bootloader checksum.
///
/// Empty input yields zero and a single byte yields its complement, otherwise
/// the bytes are XORed together. The single byte case is what makes
/// `[0xFF, 0x00]` (global erase) and `[cmd, !cmd]` share this routine.
pub fn checksum(data: &[u8]) -> u8 {
    match data {
        [] => 0,
        [b] => !b,
        _ => data.iter().fold(0, |acc, b| acc ^ b),
    }
}

pub fn command_frame(cmd: u8) -> [u8; 2] {
    [cmd, !cmd]
}

/// Big-endian address followed by its checksum
pub fn address_frame(addr: u32) -> [u8; 5] {
    let a = addr.to_be_bytes();
    [a[0], a[1], a[2], a[3], checksum(&a)]
}

/// Length prefixed data frame, `[len - 1, payload.., checksum]`.
///
/// The payload is sent as-is, any padding must be applied by the caller.
pub fn data_frame(payload: &[u8]) -> Result<Vec<u8>, InvalidLength> {
    if payload.is_empty() || payload.len() > MAX_CHUNK {
        return Err(InvalidLength(payload.len()));
    }

    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push((payload.len() - 1) as u8);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));

    Ok(frame)
}

/// Erase frame requesting a global (mass) erase
pub fn erase_all_frame() -> [u8; 2] {
    [ERASE_ALL, checksum(&[ERASE_ALL])]
}
