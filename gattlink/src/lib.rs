//! Connection/handle caching and an asynchronous GATT operation pipeline on
//! top of an abstract Bluetooth LE transport.
//!
//! A [`Session`] owns a [`cache::HandleCache`] of device, service and
//! characteristic handles, a [`resolver::Resolver`] that fetches handles from
//! the cache or establishes them against the [`transport::Transport`], and a
//! [`subscription::SubscriptionRegistry`] of active notification
//! subscriptions. Every operation is launched as a tracked task and completes
//! by invoking its callback exactly once, even when it fails or when the
//! session is shut down underneath it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use arrayvec::ArrayVec;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

pub mod uuid;

pub mod transport;

pub mod cache;

pub mod cancel;

pub mod resolver;

pub mod subscription;

pub mod pipeline;

pub mod tasks;

pub mod completion;

pub mod records;

pub mod session;
pub use session::{Session, SessionConfig};

#[cfg(any(test, feature = "fake"))]
pub mod fake;

#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The address of a Bluetooth device as reported by the platform stack.
///
/// Platforms report a 48-bit MAC address packed into the low bits of a
/// `u64`. An address of zero never identifies a real device and is used as
/// the failure marker for connect/disconnect completions.
#[derive(Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    /// The failure marker delivered in place of an address
    pub const NONE: DeviceAddress = DeviceAddress(0);

    pub const fn new(raw: u64) -> Self {
        DeviceAddress(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for DeviceAddress {
    fn from(raw: u64) -> Self {
        DeviceAddress(raw)
    }
}

impl From<DeviceAddress> for u64 {
    fn from(address: DeviceAddress) -> Self {
        address.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_be_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7])
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeviceAddress({})", self)
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = ArrayVec::<&str, 6>::new();
        for part in s.split(':') {
            if parts.try_push(part).is_err() {
                return Err(Error::Other(anyhow!("Too many octets in device address {:?}", s)));
            }
        }
        if parts.len() != 6 {
            return Err(Error::Other(anyhow!("Expected six octets in device address {:?}", s)));
        }

        let mut raw = 0u64;
        for part in parts {
            let octet = u8::from_str_radix(part, 16)
                .map_err(|err| Error::Other(anyhow!("Invalid octet {:?} in device address: {}", part, err)))?;
            raw = (raw << 8) | octet as u64;
        }
        Ok(DeviceAddress(raw))
    }
}

#[test]
fn address_two_way() {
    let address = DeviceAddress::from_str("F1:E2:D3:C4:B5:A6").unwrap();
    assert_eq!(address.as_u64(), 0xF1E2D3C4B5A6);
    // Octets are always formatted uppercase, most significant first
    assert_eq!(address.to_string(), "F1:E2:D3:C4:B5:A6");

    assert!(DeviceAddress::from_str("F1:E2:D3:C4:B5").is_err());
    assert!(DeviceAddress::from_str("F1:E2:D3:C4:B5:A6:97").is_err());
    assert!(DeviceAddress::from_str("18c2a267-a539-4423-aecc-edeeb2784bcc").is_err());
    assert!(DeviceAddress::NONE.is_none());
}

/// Whether a GATT query may be answered from the platform's cache of a
/// peripheral's earlier responses or must go to the device
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheMode {
    Cached,
    Uncached,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Insufficient Authentication")]
    InsufficientAuthentication,

    #[error("Insufficient Authorization")]
    InsufficientAuthorization,

    #[error("Insufficient Encryption")]
    InsufficientEncryption,

    #[error("Read Not Permitted")]
    ReadNotPermitted,

    #[error("Write Not Permitted")]
    WriteNotPermitted,

    #[error("Invalid Handle")]
    InvalidHandle,

    #[error("Attribute Not Found")]
    AttributeNotFound,

    #[error("Unsupported request")]
    Unsupported,

    #[error("General Failure: {0}")]
    GeneralFailure(String),
}

lazy_static! {
    // ATT error codes, Bluetooth Core Vol 3, Part F, 3.4.1.1
    static ref GATT_PROTOCOL_ERRORS: HashMap<u8, GattError> = {
        let mut map = HashMap::new();
        map.insert(0x01, GattError::InvalidHandle);
        map.insert(0x02, GattError::ReadNotPermitted);
        map.insert(0x03, GattError::WriteNotPermitted);
        map.insert(0x05, GattError::InsufficientAuthentication);
        map.insert(0x06, GattError::Unsupported);
        map.insert(0x08, GattError::InsufficientAuthorization);
        map.insert(0x0A, GattError::AttributeNotFound);
        map.insert(0x0F, GattError::InsufficientEncryption);

        map.insert(0x04, GattError::GeneralFailure("InvalidPdu".to_string()));
        map.insert(0x07, GattError::GeneralFailure("InvalidOffset".to_string()));
        map.insert(0x09, GattError::GeneralFailure("PrepareQueueFull".to_string()));
        map.insert(0x0B, GattError::GeneralFailure("AttributeNotLong".to_string()));
        map.insert(0x0C, GattError::GeneralFailure("InsufficientEncryptionKeySize".to_string()));
        map.insert(0x0D, GattError::GeneralFailure("InvalidAttributeValueLength".to_string()));
        map.insert(0x0E, GattError::GeneralFailure("UnlikelyError".to_string()));
        map.insert(0x10, GattError::GeneralFailure("UnsupportedGroupType".to_string()));
        map.insert(0x11, GattError::GeneralFailure("InsufficientResources".to_string()));

        map
    };
}

impl GattError {
    /// Maps a raw ATT protocol error code, as reported by a transport, to a
    /// `GattError`
    pub fn from_att_code(code: u8) -> GattError {
        GATT_PROTOCOL_ERRORS
            .get(&code)
            .cloned()
            .unwrap_or_else(|| GattError::GeneralFailure(format!("ATT error 0x{:02X}", code)))
    }
}

#[test]
fn att_codes() {
    assert_eq!(GattError::from_att_code(0x02), GattError::ReadNotPermitted);
    assert_eq!(GattError::from_att_code(0x0F), GattError::InsufficientEncryption);
    assert_eq!(GattError::from_att_code(0x0E),
               GattError::GeneralFailure("UnlikelyError".to_string()));
    assert_eq!(GattError::from_att_code(0x80),
               GattError::GeneralFailure("ATT error 0x80".to_string()));
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("The system is unable to communicate with this peripheral currently")]
    PeripheralUnreachable,

    #[error("There was a GATT communication protocol error")]
    PeripheralGattProtocolError(#[from] GattError),

    #[error("Access Denied")]
    PeripheralAccessDenied,

    #[error("The device, service or characteristic could not be resolved")]
    NotFound,

    #[error("Invalid State Reference")]
    InvalidStateReference,

    #[error("The session is shutting down")]
    Cancelled,

    #[error("The system doesn't support this request / operation")]
    Unsupported,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The coarse failure categories that decide how an operation reacts to an
/// error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient; the resolver retries a cached request uncached
    Unreachable,
    /// Terminal for the current operation
    CommunicationFailure,
    /// The identity could not be resolved at all
    NotFound,
    /// The transport itself raised an error
    TransportException,
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::PeripheralUnreachable => FailureKind::Unreachable,
            Error::NotFound => FailureKind::NotFound,
            Error::Other(_) => FailureKind::TransportException,
            Error::PeripheralGattProtocolError(_)
            | Error::PeripheralAccessDenied
            | Error::InvalidStateReference
            | Error::Cancelled
            | Error::Unsupported => FailureKind::CommunicationFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
