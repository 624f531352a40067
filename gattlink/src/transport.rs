use std::collections::HashSet;
use std::pin::Pin;

use async_trait::async_trait;
use bitflags::bitflags;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{CacheMode, DeviceAddress, Result};

// Handles are opaque, transport-assigned values. A transport should hand out
// a new DeviceHandle each time a device is opened so that stale handles
// from an earlier connection can be told apart from live ones.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicHandle(pub u32);

/// Identifies one notification registration so it can later be revoked
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotifyToken(pub u64);

// Requests into the transport always carry the full hierarchy of handles so
// a transport doesn't need to track the relationships between them itself.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ServicePath {
    pub device: DeviceHandle,
    pub service: ServiceHandle,
}

impl ServicePath {
    pub fn characteristic(self, characteristic: CharacteristicHandle) -> CharacteristicPath {
        CharacteristicPath {
            device: self.device,
            service: self.service,
            characteristic,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CharacteristicPath {
    pub device: DeviceHandle,
    pub service: ServiceHandle,
    pub characteristic: CharacteristicHandle,
}

bitflags! {
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteService {
    pub handle: ServiceHandle,
    pub uuid: Uuid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteCharacteristic {
    pub handle: CharacteristicHandle,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// A single received advertisement. Advertisements aren't cached; each one
/// is handed to the application as it arrives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub rssi: i16,
    pub tx_power: Option<i16>,
    pub local_name: Option<String>,
}

pub type AdvertisementStream = Pin<Box<dyn Stream<Item = Advertisement> + Send>>;

/// Advertisement filter, passed through to the transport as-is
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    pub(crate) local_name: Option<String>,
    pub(crate) service_uuids: HashSet<Uuid>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_local_name(&mut self, name: &str) -> &mut Self {
        if !name.is_empty() {
            self.local_name = Some(name.to_string());
        }
        self
    }

    pub fn add_service(&mut self, uuid: Uuid) -> &mut Self {
        if !uuid.is_nil() {
            self.service_uuids.insert(uuid);
        }
        self
    }

    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    pub fn service_uuids(&self) -> impl Iterator<Item = &Uuid> {
        self.service_uuids.iter()
    }
}

/// The radio stack as seen by a [`Session`](crate::Session).
///
/// Implementations report non-success GATT communication statuses as
/// `Error::PeripheralUnreachable`, `Error::PeripheralAccessDenied` or
/// `Error::PeripheralGattProtocolError`, and any lower-level failure of the
/// platform API as `Error::Other`.
///
/// Every async method is a suspension point. The session never cancels a
/// call that is already in flight, so implementations are expected to bound
/// each call with the platform's own timeouts.
#[async_trait]
pub trait Transport: Send + Sync {
    fn start_scanning(&self, filter: &Filter) -> Result<AdvertisementStream>;

    /// Stops any scan started by `start_scanning`, which should also end the
    /// advertisement stream. Stopping when not scanning isn't an error.
    fn stop_scanning(&self) -> Result<()>;

    async fn open_device(&self, address: DeviceAddress) -> Result<DeviceHandle>;

    /// Whether a previously opened device is still usable. Cached handles for
    /// devices that are no longer reachable get re-established.
    fn is_reachable(&self, device: DeviceHandle) -> bool;

    async fn get_services(&self, device: DeviceHandle, cache_mode: CacheMode)
                          -> Result<Vec<RemoteService>>;

    async fn get_characteristics(&self, service: ServicePath, cache_mode: CacheMode)
                                 -> Result<Vec<RemoteCharacteristic>>;

    /// Reads the first descriptor with the given `uuid`, or returns `None`
    /// if the characteristic has no such descriptor
    async fn read_descriptor(&self, characteristic: CharacteristicPath, uuid: Uuid,
                             cache_mode: CacheMode)
                             -> Result<Option<Vec<u8>>>;

    /// Enables value notifications for a characteristic. Values are sent to
    /// `values` until the returned token is passed to `disable_notify`; send
    /// errors (nobody listening) should be ignored.
    async fn enable_notify(&self, characteristic: CharacteristicPath,
                           values: mpsc::UnboundedSender<Vec<u8>>)
                           -> Result<NotifyToken>;

    async fn disable_notify(&self, token: NotifyToken) -> Result<()>;

    async fn read_value(&self, characteristic: CharacteristicPath, cache_mode: CacheMode)
                        -> Result<Vec<u8>>;

    async fn write_value(&self, characteristic: CharacteristicPath, write_type: WriteType,
                         data: &[u8])
                         -> Result<()>;
}
