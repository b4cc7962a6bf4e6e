//! Firmware images and how they are split into erase pages and write windows

use std::io;
use std::path::{Path, PathBuf};

use crate::protocol::{ERASED_BYTE, MAX_CHUNK};

/// Largest page list the Erase command accepts, a count byte of 0xFF
/// selects a global erase instead
pub const MAX_ERASE_PAGES: usize = 255;

/// Program word size, write windows are rounded up to this
pub const WORD_SIZE: usize = 4;

/// Raw firmware image, loaded once and never modified
#[derive(Clone, PartialEq, Debug)]
pub struct FlashImage {
    data: Vec<u8>,
}

impl FlashImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        std::fs::read(path).map(Self::new)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of flash pages covered by the image
    pub fn page_count(&self, page_size: u32) -> usize {
        let page_size = page_size as usize;
        (self.data.len() + page_size - 1) / page_size
    }

    /// Build the write window starting at `offset`.
    ///
    /// The window always spans [`MAX_CHUNK`] bytes. The image bytes are rounded
    /// up to a whole number of words (zero extended past the end of the image)
    /// and the rest of the window is left erased.
    pub fn chunk(&self, offset: usize) -> Chunk {
        let remaining = self.data.len().saturating_sub(offset);
        let len = round_to_word(remaining.min(MAX_CHUNK));

        let mut data = [ERASED_BYTE; MAX_CHUNK];
        let end = self.data.len().min(offset + len);
        let tail = &self.data[offset.min(end)..end];

        data[..len].iter_mut().for_each(|b| *b = 0);
        data[..tail.len()].copy_from_slice(tail);

        Chunk { len, data }
    }
}

/// One write window of the programming loop
#[derive(Clone, PartialEq, Debug)]
pub struct Chunk {
    /// Word aligned count of image bytes in the window, the write offset advances by this
    pub len: usize,
    pub data: [u8; MAX_CHUNK],
}

fn round_to_word(n: usize) -> usize {
    (n + WORD_SIZE - 1) / WORD_SIZE * WORD_SIZE
}

/// Page indices to erase for an image of `image_len` bytes.
///
/// Returns `Err` with the required page count if it cannot be expressed in
/// a single Erase page list.
pub fn erase_pages(image_len: usize, page_size: u32) -> Result<Vec<u8>, usize> {
    let page_size = page_size as usize;
    let pages = (image_len + page_size - 1) / page_size;

    if pages > MAX_ERASE_PAGES {
        return Err(pages);
    }

    Ok((0..pages).map(|p| p as u8).collect())
}

/// Progress across the programming phase, scaled to 20..=100
pub fn write_progress(offset: usize, image_len: usize) -> u8 {
    if image_len == 0 {
        return 100;
    }
    let done = offset.min(image_len) as u64;
    (20 + 80 * done / image_len as u64) as u8
}

/// Source of the firmware image for a session
pub trait ImageSource {
    fn load(self) -> io::Result<FlashImage>;
}

impl ImageSource for FlashImage {
    fn load(self) -> io::Result<FlashImage> {
        Ok(self)
    }
}

impl ImageSource for Vec<u8> {
    fn load(self) -> io::Result<FlashImage> {
        Ok(FlashImage::new(self))
    }
}

impl ImageSource for &Path {
    fn load(self) -> io::Result<FlashImage> {
        FlashImage::from_file(self)
    }
}

impl ImageSource for PathBuf {
    fn load(self) -> io::Result<FlashImage> {
        FlashImage::from_file(self)
    }
}
