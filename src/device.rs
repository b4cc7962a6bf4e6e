//! Known STM32 parts and their flash page sizes

/// Chip ID and flash page size resolved from the bootloader
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct ChipIdentity {
    pub chip_id: u16,
    pub page_size: u32,
    pub name: &'static str,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Density {
    pub chip_id: u16,
    pub page_size: u32,
    pub name: &'static str,
}

/// Page sizes for the parts this tool knows how to erase
#[rustfmt::skip]
pub const DENSITIES: [Density; 9] = [
    Density { chip_id: 0x410, page_size: 1024, name: "STM32F10x medium-density" },
    Density { chip_id: 0x412, page_size: 1024, name: "STM32F10x low-density" },
    Density { chip_id: 0x414, page_size: 2048, name: "STM32F10x high-density" },
    Density { chip_id: 0x416, page_size: 256, name: "STM32L1xx medium-density" },
    Density { chip_id: 0x418, page_size: 2048, name: "STM32F105/107 connectivity line" },
    Density { chip_id: 0x420, page_size: 1024, name: "STM32F10x medium-density value line" },
    Density { chip_id: 0x428, page_size: 2048, name: "STM32F10x high-density value line" },
    Density { chip_id: 0x430, page_size: 2048, name: "STM32F10x XL-density" },
    Density { chip_id: 0x436, page_size: 256, name: "STM32L1xx high-density" },
];

impl ChipIdentity {
    /// Resolve the page size for a chip ID, `None` if the part is unknown
    pub fn resolve(chip_id: u16) -> Option<Self> {
        DENSITIES
            .iter()
            .find(|d| d.chip_id == chip_id)
            .map(|d| Self {
                chip_id,
                page_size: d.page_size,
                name: d.name,
            })
    }
}
