use crate::device_ids::{SupportedProduct, UsbId, identify_device};
use log::debug;
use std::fmt::Display;
use thiserror::Error;

/// A sound card as reported by whatever enumerates the system's devices, before we've decided
/// whether we support it.
#[derive(Clone, Debug)]
pub struct DiscoveredCard {
    pub card_num: u32,
    pub usb_id: UsbId,
    pub firmware_version: Option<u32>,
}

/// A connected device we know how to update.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectedDevice {
    pub card_num: u32,
    pub product: &'static SupportedProduct,
    /// Version of the firmware it's running, if the driver exposes it.
    pub firmware_version: Option<u32>,
}

impl ConnectedDevice {
    pub fn product_id(&self) -> u16 {
        self.product.pid
    }

    pub fn name(&self) -> &'static str {
        self.product.name
    }

    /// ALSA name used to address the card, e.g. `hw:1`.
    pub fn alsa_name(&self) -> String {
        format!("hw:{}", self.card_num)
    }
}

impl Display for ConnectedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "card{}: {}", self.card_num, self.product.name)
    }
}

/// Every supported device found on the system.
#[derive(Debug, Default)]
pub struct DeviceCatalog {
    devices: Vec<ConnectedDevice>,
}

impl DeviceCatalog {
    /// Keep only the cards whose USB IDs belong to a supported product.
    pub fn from_discovered(cards: impl IntoIterator<Item = DiscoveredCard>) -> Self {
        let devices = cards
            .into_iter()
            .filter_map(|card| match identify_device(card.usb_id) {
                Some(product) => Some(ConnectedDevice {
                    card_num: card.card_num,
                    product,
                    firmware_version: card.firmware_version,
                }),
                None => {
                    debug!("Ignoring card{} ({})", card.card_num, card.usb_id);
                    None
                }
            })
            .collect();
        Self { devices }
    }

    pub fn devices(&self) -> &[ConnectedDevice] {
        &self.devices
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Whether any connected device is the given product.
    pub fn is_connected(&self, pid: u16) -> bool {
        self.devices.iter().any(|d| d.product_id() == pid)
    }

    /// Pick the device to operate on. With no card number, there must be exactly one supported
    /// device connected.
    pub fn select(&self, card_num: Option<u32>) -> Result<&ConnectedDevice, MatchError> {
        match card_num {
            Some(num) => self
                .devices
                .iter()
                .find(|d| d.card_num == num)
                .ok_or(MatchError::CardNotFound(num)),
            None => {
                let mut candidates = self.devices.iter();
                match candidates.next() {
                    None => Err(MatchError::NoDevices),
                    Some(dev) => {
                        if candidates.next().is_some() {
                            Err(MatchError::MultipleDevices)
                        } else {
                            Ok(dev)
                        }
                    }
                }
            }
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MatchError {
    #[error("no supported devices found")]
    NoDevices,

    #[error("more than one supported device found; select one with --card")]
    MultipleDevices,

    #[error("selected card {0} not found or not supported")]
    CardNotFound(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_ids::VENDOR_ID;

    fn card(card_num: u32, vid: u16, pid: u16, version: Option<u32>) -> DiscoveredCard {
        DiscoveredCard {
            card_num,
            usb_id: UsbId { vid, pid },
            firmware_version: version,
        }
    }

    #[test]
    fn unsupported_cards_are_dropped() {
        let catalog = DeviceCatalog::from_discovered([
            card(0, 0x8086, 0x1234, None),
            card(1, VENDOR_ID, 0x8211, Some(1535)),
            card(2, VENDOR_ID, 0x0001, Some(1)),
        ]);
        assert_eq!(catalog.devices().len(), 1);
        let dev = &catalog.devices()[0];
        assert_eq!(dev.card_num, 1);
        assert_eq!(dev.name(), "Scarlett 3rd Gen Solo");
        assert_eq!(dev.alsa_name(), "hw:1");
        assert!(catalog.is_connected(0x8211));
        assert!(!catalog.is_connected(0x8210));
    }

    #[test]
    fn select_single_device_without_card_number() {
        let catalog = DeviceCatalog::from_discovered([card(3, VENDOR_ID, 0x8210, Some(1))]);
        assert_eq!(catalog.select(None).unwrap().card_num, 3);
    }

    #[test]
    fn select_errors() {
        let empty = DeviceCatalog::default();
        assert!(matches!(empty.select(None), Err(MatchError::NoDevices)));

        let two = DeviceCatalog::from_discovered([
            card(0, VENDOR_ID, 0x8210, Some(1)),
            card(1, VENDOR_ID, 0x8211, Some(1)),
        ]);
        assert!(matches!(two.select(None), Err(MatchError::MultipleDevices)));
        assert_eq!(two.select(Some(1)).unwrap().product_id(), 0x8211);
        assert!(matches!(two.select(Some(7)), Err(MatchError::CardNotFound(7))));
    }
}
