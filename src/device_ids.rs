use std::fmt::Display;

/// Focusrite's USB vendor ID. Firmware files for any other vendor are ignored.
pub const VENDOR_ID: u16 = 0x1235;

/// Every product this tool knows how to update. Order here is the order products are listed in
/// and the primary sort key of the firmware catalog.
pub const SUPPORTED_PRODUCTS: &[SupportedProduct] = &[
    product(0x8203, "Scarlett 2nd Gen 6i6"),
    product(0x8204, "Scarlett 2nd Gen 18i8"),
    product(0x8201, "Scarlett 2nd Gen 18i20"),
    product(0x8211, "Scarlett 3rd Gen Solo"),
    product(0x8210, "Scarlett 3rd Gen 2i2"),
    product(0x8212, "Scarlett 3rd Gen 4i4"),
    product(0x8213, "Scarlett 3rd Gen 8i6"),
    product(0x8214, "Scarlett 3rd Gen 18i8"),
    product(0x8215, "Scarlett 3rd Gen 18i20"),
    product(0x8218, "Scarlett 4th Gen Solo"),
    product(0x8219, "Scarlett 4th Gen 2i2"),
    product(0x821a, "Scarlett 4th Gen 4i4"),
    product(0x8206, "Clarett USB 2Pre"),
    product(0x8207, "Clarett USB 4Pre"),
    product(0x8208, "Clarett USB 8Pre"),
    product(0x820a, "Clarett+ 2Pre"),
    product(0x820b, "Clarett+ 4Pre"),
    product(0x820c, "Clarett+ 8Pre"),
];

const fn product(pid: u16, name: &'static str) -> SupportedProduct {
    SupportedProduct { pid, name }
}

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// An entry in [SUPPORTED_PRODUCTS].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SupportedProduct {
    pub pid: u16,
    pub name: &'static str,
}

impl Display for SupportedProduct {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x} {}", self.pid, self.name)
    }
}

/// Look up a product ID in [SUPPORTED_PRODUCTS].
pub fn product_for_pid(pid: u16) -> Option<&'static SupportedProduct> {
    SUPPORTED_PRODUCTS.iter().find(|p| p.pid == pid)
}

/// Position of a product ID in [SUPPORTED_PRODUCTS], or [None] if we don't know it.
pub fn product_position(pid: u16) -> Option<usize> {
    SUPPORTED_PRODUCTS.iter().position(|p| p.pid == pid)
}

/// Find the supported product for a full USB ID. Anything not from our vendor is never supported,
/// whatever its product ID.
pub fn identify_device(id: UsbId) -> Option<&'static SupportedProduct> {
    if id.vid != VENDOR_ID {
        return None;
    }
    product_for_pid(id.pid)
}
