//! Fixed-capacity result records handed to completion callbacks.
//!
//! Records don't allocate, so a callback can receive a slice of them without
//! taking ownership of anything; receivers copy out whatever they want to
//! keep once the callback returns.

use arrayvec::{ArrayString, ArrayVec};
use log::debug;
use uuid::Uuid;

use crate::transport::{Advertisement, RemoteService};
use crate::DeviceAddress;

/// Maximum length, in bytes of UTF-8, of an advertised local name
pub const NAME_CAPACITY: usize = 100;

/// Maximum length, in bytes of UTF-8, of a characteristic user description
pub const DESCRIPTION_CAPACITY: usize = 100;

/// The maximum length of an ATT attribute value
pub const VALUE_CAPACITY: usize = 512;

pub type ValueBuffer = ArrayVec<u8, VALUE_CAPACITY>;

// Keeps as much of `s` as fits, cutting on a char boundary
fn truncated<const CAP: usize>(what: &str, s: &str) -> ArrayString<CAP> {
    let mut end = s.len().min(CAP);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    if end < s.len() {
        debug!("Truncating {} from {} to {} bytes", what, s.len(), end);
    }

    let mut out = ArrayString::new();
    // Can't fail, `end <= CAP`
    let _ = out.try_push_str(&s[..end]);
    out
}

/// Copies a value into a fixed-capacity buffer, truncating anything past
/// [`VALUE_CAPACITY`]
pub fn value_buffer(value: &[u8]) -> ValueBuffer {
    let len = value.len().min(VALUE_CAPACITY);
    if len < value.len() {
        debug!("Truncating value from {} to {} bytes", value.len(), len);
    }
    value[..len].iter().copied().collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceRecord {
    pub uuid: Uuid,
}

impl From<&RemoteService> for ServiceRecord {
    fn from(service: &RemoteService) -> Self {
        ServiceRecord { uuid: service.uuid }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacteristicRecord {
    pub uuid: Uuid,
    pub description: ArrayString<DESCRIPTION_CAPACITY>,
}

impl CharacteristicRecord {
    pub fn new(uuid: Uuid, description: &str) -> Self {
        CharacteristicRecord {
            uuid,
            description: truncated("characteristic description", description),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdvertisementRecord {
    pub address: DeviceAddress,
    pub rssi: i16,

    /// Zero when the advertisement didn't carry a TX power level
    pub tx_power: i16,
    pub name: ArrayString<NAME_CAPACITY>,
}

impl From<&Advertisement> for AdvertisementRecord {
    fn from(advertisement: &Advertisement) -> Self {
        AdvertisementRecord {
            address: advertisement.address,
            rssi: advertisement.rssi,
            tx_power: advertisement.tx_power.unwrap_or(0),
            name: truncated("local name", advertisement.local_name.as_deref().unwrap_or("")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(DESCRIPTION_CAPACITY);
        let record = CharacteristicRecord::new(Uuid::nil(), &long);
        assert_eq!(record.description.len(), DESCRIPTION_CAPACITY);
        assert!(record.description.chars().all(|c| c == 'é'));

        let odd = format!("x{}", long);
        let record = CharacteristicRecord::new(Uuid::nil(), &odd);
        assert_eq!(record.description.len(), DESCRIPTION_CAPACITY - 1);
    }

    #[test]
    fn value_is_capped() {
        assert_eq!(value_buffer(&[1, 2, 3]).as_slice(), &[1, 2, 3]);
        assert!(value_buffer(&[]).is_empty());
        assert_eq!(value_buffer(&[0xAA; 600]).len(), VALUE_CAPACITY);
    }

    #[test]
    fn advertisement_without_tx_power() {
        let advertisement = Advertisement {
            address: DeviceAddress::new(0xAABBCCDDEEFF),
            rssi: -70,
            tx_power: None,
            local_name: Some("Thermometer".to_string()),
        };
        let record = AdvertisementRecord::from(&advertisement);
        assert_eq!(record.tx_power, 0);
        assert_eq!(record.name.as_str(), "Thermometer");
    }
}
