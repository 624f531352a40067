//! An in-memory [`Transport`] for tests and demos.
//!
//! Devices are declared up front with [`FakeTransport::add_device`]. Every
//! request is recorded (see [`FakeTransport::calls`]) and failures can be
//! injected per kind of call. Writes are echoed into the characteristic's
//! value so a later read returns what was written.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::trace;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::transport::{Advertisement, AdvertisementStream, CharacteristicHandle,
                       CharacteristicPath, CharacteristicProperties, DeviceHandle, Filter,
                       NotifyToken, RemoteCharacteristic, RemoteService, ServiceHandle,
                       ServicePath, Transport, WriteType};
use crate::{CacheMode, DeviceAddress, Error, GattError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeDescription {
    Absent,
    Text(String),
    /// The descriptor exists but reading it fails with `ReadNotPermitted`
    Unreadable,
}

#[derive(Clone, Debug)]
pub struct FakeCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub description: FakeDescription,
    pub value: Vec<u8>,
}

impl FakeCharacteristic {
    /// A readable, writable, notifying characteristic without a description
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            properties: CharacteristicProperties::READ
                        | CharacteristicProperties::WRITE
                        | CharacteristicProperties::NOTIFY,
            description: FakeDescription::Absent,
            value: vec![],
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = FakeDescription::Text(description.to_string());
        self
    }

    pub fn with_unreadable_description(mut self) -> Self {
        self.description = FakeDescription::Unreadable;
        self
    }

    pub fn with_properties(mut self, properties: CharacteristicProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_value(mut self, value: &[u8]) -> Self {
        self.value = value.to_vec();
        self
    }
}

#[derive(Clone, Debug)]
pub struct FakeService {
    pub uuid: Uuid,
    pub characteristics: Vec<FakeCharacteristic>,
}

impl FakeService {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: vec![],
        }
    }

    pub fn with_characteristic(mut self, characteristic: FakeCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

#[derive(Clone, Debug)]
pub struct FakeDevice {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub services: Vec<FakeService>,
}

impl FakeDevice {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            name: None,
            services: vec![],
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_service(mut self, service: FakeService) -> Self {
        self.services.push(service);
        self
    }
}

/// A failure to inject into the next call of some kind
#[derive(Clone, Debug)]
pub enum FakeFailure {
    Unreachable,
    AccessDenied,
    Protocol(GattError),
    /// Reported as `Error::Other`, like an error raised by the platform API
    Exception(String),
}

impl From<FakeFailure> for Error {
    fn from(failure: FakeFailure) -> Error {
        match failure {
            FakeFailure::Unreachable => Error::PeripheralUnreachable,
            FakeFailure::AccessDenied => Error::PeripheralAccessDenied,
            FakeFailure::Protocol(err) => Error::PeripheralGattProtocolError(err),
            FakeFailure::Exception(msg) => Error::Other(anyhow::anyhow!(msg)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallKind {
    StartScanning,
    StopScanning,
    OpenDevice,
    GetServices,
    GetCharacteristics,
    ReadDescriptor,
    EnableNotify,
    DisableNotify,
    ReadValue,
    WriteValue,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCall {
    StartScanning,
    StopScanning,
    OpenDevice(DeviceAddress),
    GetServices(DeviceHandle, CacheMode),
    GetCharacteristics(ServiceHandle, CacheMode),
    ReadDescriptor(CharacteristicHandle, Uuid),
    EnableNotify(CharacteristicHandle),
    DisableNotify(NotifyToken),
    ReadValue(CharacteristicHandle),
    WriteValue(CharacteristicHandle, WriteType, Vec<u8>),
}

impl TransportCall {
    pub fn kind(&self) -> CallKind {
        match self {
            TransportCall::StartScanning => CallKind::StartScanning,
            TransportCall::StopScanning => CallKind::StopScanning,
            TransportCall::OpenDevice(_) => CallKind::OpenDevice,
            TransportCall::GetServices(..) => CallKind::GetServices,
            TransportCall::GetCharacteristics(..) => CallKind::GetCharacteristics,
            TransportCall::ReadDescriptor(..) => CallKind::ReadDescriptor,
            TransportCall::EnableNotify(_) => CallKind::EnableNotify,
            TransportCall::DisableNotify(_) => CallKind::DisableNotify,
            TransportCall::ReadValue(_) => CallKind::ReadValue,
            TransportCall::WriteValue(..) => CallKind::WriteValue,
        }
    }
}

type CallHook = Arc<dyn Fn() + Send + Sync>;

// What a handle handed out for an open connection points at in the model
#[derive(Clone, Copy, Debug)]
struct CharacteristicSlot {
    address: DeviceAddress,
    service: usize,
    characteristic: usize,
}

#[derive(Debug)]
struct OpenService {
    handle: ServiceHandle,
    characteristics: Vec<CharacteristicHandle>,
}

#[derive(Debug)]
struct OpenDevice {
    address: DeviceAddress,
    services: Vec<OpenService>,
}

#[derive(Default)]
struct FakeState {
    devices: HashMap<DeviceAddress, FakeDevice>,
    next_handle: u32,
    next_token: u64,

    open_devices: HashMap<DeviceHandle, OpenDevice>,
    unreachable: HashSet<DeviceHandle>,
    characteristics: HashMap<CharacteristicHandle, CharacteristicSlot>,
    notifications: HashMap<NotifyToken, (CharacteristicHandle, mpsc::UnboundedSender<Vec<u8>>)>,
    advertisements: Option<mpsc::UnboundedSender<Advertisement>>,

    cached_unreachable: bool,
    failures: HashMap<CallKind, VecDeque<FakeFailure>>,
    stalled: HashSet<CallKind>,
    hooks: Vec<(CallKind, usize, CallHook)>,
    calls: Vec<TransportCall>,
}

impl FakeState {
    fn allocate_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn count(&self, kind: CallKind) -> usize {
        self.calls.iter().filter(|call| call.kind() == kind).count()
    }

    fn open_device(&self, device: DeviceHandle) -> Result<&OpenDevice> {
        match self.open_devices.get(&device) {
            Some(open) if !self.unreachable.contains(&device) => Ok(open),
            _ => Err(Error::PeripheralUnreachable),
        }
    }

    fn open_service(&self, path: ServicePath) -> Result<(usize, &OpenService)> {
        self.open_device(path.device)?
            .services
            .iter()
            .enumerate()
            .find(|(_, service)| service.handle == path.service)
            .ok_or(Error::PeripheralGattProtocolError(GattError::InvalidHandle))
    }

    fn characteristic_mut(&mut self, path: CharacteristicPath) -> Result<&mut FakeCharacteristic> {
        let (_, service) = self.open_service(ServicePath {
                                                 device: path.device,
                                                 service: path.service,
                                             })?;
        if !service.characteristics.contains(&path.characteristic) {
            return Err(Error::PeripheralGattProtocolError(GattError::InvalidHandle));
        }
        let slot = *self.characteristics
                        .get(&path.characteristic)
                        .ok_or(Error::PeripheralGattProtocolError(GattError::InvalidHandle))?;
        self.devices
            .get_mut(&slot.address)
            .and_then(|device| device.services.get_mut(slot.service))
            .and_then(|service| service.characteristics.get_mut(slot.characteristic))
            .ok_or(Error::PeripheralGattProtocolError(GattError::InvalidHandle))
    }
}

/// See the [module documentation](self)
#[derive(Default)]
pub struct FakeTransport {
    state: StdMutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_device(&self, device: FakeDevice) {
        self.state().devices.insert(device.address, device);
    }

    /// Makes the currently open handle of a device unreachable, as if the
    /// peripheral had reset or gone out of range. Opening it again works.
    pub fn set_unreachable(&self, address: DeviceAddress) {
        let mut state = self.state();
        let handles: Vec<DeviceHandle> = state.open_devices
                                              .iter()
                                              .filter(|(_, open)| open.address == address)
                                              .map(|(handle, _)| *handle)
                                              .collect();
        state.unreachable.extend(handles);
    }

    /// Makes every `CacheMode::Cached` service/characteristic query report
    /// the peripheral as unreachable
    pub fn set_cached_unreachable(&self, unreachable: bool) {
        self.state().cached_unreachable = unreachable;
    }

    pub fn fail_next(&self, kind: CallKind, failure: FakeFailure) {
        self.state().failures.entry(kind).or_default().push_back(failure);
    }

    /// Calls of this kind never complete
    pub fn stall(&self, kind: CallKind) {
        self.state().stalled.insert(kind);
    }

    /// Runs `hook` right after the `count`th call of this kind is made
    pub fn after_calls<F>(&self, kind: CallKind, count: usize, hook: F)
        where F: Fn() + Send + Sync + 'static
    {
        self.state().hooks.push((kind, count, Arc::new(hook)));
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.state().count(kind)
    }

    /// The number of notification registrations that haven't been disabled
    pub fn active_notifications(&self) -> usize {
        self.state().notifications.len()
    }

    pub fn value(&self, address: DeviceAddress, service: Uuid, characteristic: Uuid)
                 -> Option<Vec<u8>> {
        let state = self.state();
        state.devices
             .get(&address)?
             .services
             .iter()
             .find(|s| s.uuid == service)?
             .characteristics
             .iter()
             .find(|c| c.uuid == characteristic)
             .map(|c| c.value.clone())
    }

    /// Delivers an advertisement to the current scan, if any
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        match &self.state().advertisements {
            Some(tx) => tx.send(advertisement).is_ok(),
            None => false,
        }
    }

    /// Advertises a declared device under its name, if it has one
    pub fn advertise_device(&self, address: DeviceAddress, rssi: i16) -> bool {
        let local_name = match self.state().devices.get(&address) {
            Some(device) => device.name.clone(),
            None => return false,
        };
        self.advertise(Advertisement { address,
                                       rssi,
                                       tx_power: None,
                                       local_name })
    }

    /// Pushes a value to every registration for a characteristic, returning
    /// how many registrations it was sent to
    pub fn notify(&self, address: DeviceAddress, service: Uuid, characteristic: Uuid,
                  value: &[u8])
                  -> usize {
        let state = self.state();
        let model = match state.devices.get(&address) {
            Some(device) => device,
            None => return 0,
        };
        let handles: HashSet<CharacteristicHandle> = state.characteristics
            .iter()
            .filter(|(_, slot)| {
                slot.address == address
                && model.services.get(slot.service).map_or(false, |s| {
                    s.uuid == service
                    && s.characteristics
                        .get(slot.characteristic)
                        .map_or(false, |c| c.uuid == characteristic)
                })
            })
            .map(|(handle, _)| *handle)
            .collect();

        state.notifications
             .values()
             .filter(|(handle, _)| handles.contains(handle))
             .filter(|(_, tx)| tx.send(value.to_vec()).is_ok())
             .count()
    }

    // Records a call and returns whether it should fail, stall, or proceed.
    // Hooks run without the state lock held.
    async fn begin(&self, call: TransportCall, cache_mode: Option<CacheMode>) -> Result<()> {
        let kind = call.kind();
        let (failure, stalled, hooks) = {
            let mut state = self.state();
            trace!("fake transport: {:?}", call);
            state.calls.push(call);
            let count = state.count(kind);

            let mut failure = state.failures
                                   .get_mut(&kind)
                                   .and_then(|queue| queue.pop_front())
                                   .map(Error::from);
            if failure.is_none() && state.cached_unreachable && cache_mode == Some(CacheMode::Cached) {
                failure = Some(Error::PeripheralUnreachable);
            }

            let hooks: Vec<CallHook> = state.hooks
                                            .iter()
                                            .filter(|(k, n, _)| *k == kind && *n == count)
                                            .map(|(_, _, hook)| hook.clone())
                                            .collect();
            (failure, state.stalled.contains(&kind), hooks)
        };

        for hook in hooks {
            hook();
        }
        if stalled {
            futures::future::pending::<()>().await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn start_scanning(&self, _filter: &Filter) -> Result<AdvertisementStream> {
        let mut state = self.state();
        state.calls.push(TransportCall::StartScanning);
        let (tx, rx) = mpsc::unbounded_channel();
        state.advertisements = Some(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    fn stop_scanning(&self) -> Result<()> {
        let mut state = self.state();
        state.calls.push(TransportCall::StopScanning);
        // Dropping the sender ends the advertisement stream
        state.advertisements = None;
        Ok(())
    }

    async fn open_device(&self, address: DeviceAddress) -> Result<DeviceHandle> {
        self.begin(TransportCall::OpenDevice(address), None).await?;

        let mut state = self.state();
        let layout: Vec<usize> = match state.devices.get(&address) {
            Some(device) => device.services.iter().map(|s| s.characteristics.len()).collect(),
            None => return Err(Error::PeripheralUnreachable),
        };

        // Each connection gets fresh handles for the whole hierarchy
        let device = DeviceHandle(state.allocate_handle());
        let mut services = Vec::with_capacity(layout.len());
        for (service, characteristic_count) in layout.into_iter().enumerate() {
            let handle = ServiceHandle(state.allocate_handle());
            let mut characteristics = Vec::with_capacity(characteristic_count);
            for characteristic in 0..characteristic_count {
                let handle = CharacteristicHandle(state.allocate_handle());
                state.characteristics.insert(handle, CharacteristicSlot {
                    address,
                    service,
                    characteristic,
                });
                characteristics.push(handle);
            }
            services.push(OpenService {
                handle,
                characteristics,
            });
        }
        state.open_devices.insert(device, OpenDevice { address, services });
        Ok(device)
    }

    fn is_reachable(&self, device: DeviceHandle) -> bool {
        self.state().open_device(device).is_ok()
    }

    async fn get_services(&self, device: DeviceHandle, cache_mode: CacheMode)
                          -> Result<Vec<RemoteService>> {
        self.begin(TransportCall::GetServices(device, cache_mode), Some(cache_mode)).await?;

        let state = self.state();
        let open = state.open_device(device)?;
        let model = state.devices.get(&open.address).ok_or(Error::PeripheralUnreachable)?;
        Ok(open.services
               .iter()
               .zip(model.services.iter())
               .map(|(open, model)| RemoteService {
                   handle: open.handle,
                   uuid: model.uuid,
               })
               .collect())
    }

    async fn get_characteristics(&self, service: ServicePath, cache_mode: CacheMode)
                                 -> Result<Vec<RemoteCharacteristic>> {
        self.begin(TransportCall::GetCharacteristics(service.service, cache_mode),
                   Some(cache_mode)).await?;

        let state = self.state();
        let address = state.open_device(service.device)?.address;
        let (index, open) = state.open_service(service)?;
        let model = state.devices
                         .get(&address)
                         .and_then(|device| device.services.get(index))
                         .ok_or(Error::PeripheralUnreachable)?;

        Ok(open.characteristics
               .iter()
               .zip(model.characteristics.iter())
               .map(|(handle, model)| RemoteCharacteristic {
                   handle: *handle,
                   uuid: model.uuid,
                   properties: model.properties,
               })
               .collect())
    }

    async fn read_descriptor(&self, characteristic: CharacteristicPath, uuid: Uuid,
                             _cache_mode: CacheMode)
                             -> Result<Option<Vec<u8>>> {
        self.begin(TransportCall::ReadDescriptor(characteristic.characteristic, uuid), None)
            .await?;

        let mut state = self.state();
        let model = state.characteristic_mut(characteristic)?;
        if uuid != crate::uuid::USER_DESCRIPTION_UUID {
            return Ok(None);
        }
        match &model.description {
            FakeDescription::Absent => Ok(None),
            FakeDescription::Text(text) => Ok(Some(text.as_bytes().to_vec())),
            FakeDescription::Unreadable => {
                Err(Error::PeripheralGattProtocolError(GattError::ReadNotPermitted))
            }
        }
    }

    async fn enable_notify(&self, characteristic: CharacteristicPath,
                           values: mpsc::UnboundedSender<Vec<u8>>)
                           -> Result<NotifyToken> {
        self.begin(TransportCall::EnableNotify(characteristic.characteristic), None).await?;

        let mut state = self.state();
        let model = state.characteristic_mut(characteristic)?;
        let notifiable = CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE;
        if !model.properties.intersects(notifiable) {
            return Err(Error::PeripheralGattProtocolError(GattError::Unsupported));
        }

        state.next_token += 1;
        let token = NotifyToken(state.next_token);
        state.notifications.insert(token, (characteristic.characteristic, values));
        Ok(token)
    }

    async fn disable_notify(&self, token: NotifyToken) -> Result<()> {
        self.begin(TransportCall::DisableNotify(token), None).await?;

        match self.state().notifications.remove(&token) {
            Some(_) => Ok(()),
            None => Err(Error::Other(anyhow::anyhow!("Unknown notification token {:?}", token))),
        }
    }

    async fn read_value(&self, characteristic: CharacteristicPath, _cache_mode: CacheMode)
                        -> Result<Vec<u8>> {
        self.begin(TransportCall::ReadValue(characteristic.characteristic), None).await?;

        let mut state = self.state();
        let model = state.characteristic_mut(characteristic)?;
        if !model.properties.contains(CharacteristicProperties::READ) {
            return Err(Error::PeripheralGattProtocolError(GattError::ReadNotPermitted));
        }
        Ok(model.value.clone())
    }

    async fn write_value(&self, characteristic: CharacteristicPath, write_type: WriteType,
                         data: &[u8])
                         -> Result<()> {
        self.begin(TransportCall::WriteValue(characteristic.characteristic, write_type,
                                             data.to_vec()),
                   None).await?;

        let mut state = self.state();
        let model = state.characteristic_mut(characteristic)?;
        let writable = match write_type {
            WriteType::WithResponse => CharacteristicProperties::WRITE,
            WriteType::WithoutResponse => CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        };
        if !model.properties.contains(writable) {
            return Err(Error::PeripheralGattProtocolError(GattError::WriteNotPermitted));
        }
        model.value = data.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn declared_devices_advertise_their_name() {
        crate::init_test_logging();
        let fake = FakeTransport::new();
        let named = DeviceAddress::new(0x0000_C0FF_EE00_0001);
        let unnamed = DeviceAddress::new(0x0000_C0FF_EE00_0002);
        fake.add_device(FakeDevice::new(named).with_name("HRM"));
        fake.add_device(FakeDevice::new(unnamed));

        assert!(!fake.advertise_device(named, -60));

        let mut stream = fake.start_scanning(&Filter::new()).unwrap();
        assert!(fake.advertise_device(named, -60));
        assert!(fake.advertise_device(unnamed, -70));
        assert!(!fake.advertise_device(DeviceAddress::new(0xBAD), -80));

        let first = stream.next().await.unwrap();
        assert_eq!(first.address, named);
        assert_eq!(first.rssi, -60);
        assert_eq!(first.local_name.as_deref(), Some("HRM"));
        let second = stream.next().await.unwrap();
        assert_eq!(second.local_name, None);
    }
}
