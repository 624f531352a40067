use std::future::Future;
use std::sync::Arc;

use log::{debug, trace, warn};
use uuid::Uuid;

use crate::cache::{CacheEpoch, CachedCharacteristic, CharacteristicKey, HandleCache, ServiceKey};
use crate::subscription::SubscriptionRegistry;
use crate::transport::{CharacteristicPath, DeviceHandle, RemoteCharacteristic, RemoteService,
                       ServicePath, Transport};
use crate::uuid::BluetoothUuid;
use crate::{CacheMode, DeviceAddress, Error, Result};

/// Runs a query against the platform cache first and, only if that reports
/// the peripheral as unreachable, once more forcing a live round trip.
///
/// Platform caches can go stale when a peripheral resets without the
/// application hearing about it, which shows up as an unreachable status for
/// the cached query.
pub(crate) async fn with_cache_fallback<T, F, Fut>(what: &str, query: F) -> Result<T>
    where F: Fn(CacheMode) -> Fut,
          Fut: Future<Output = Result<T>>
{
    match query(CacheMode::Cached).await {
        Err(Error::PeripheralUnreachable) => {
            debug!("Cached {} query reported unreachable, retrying uncached", what);
            query(CacheMode::Uncached).await
        }
        result => result,
    }
}

/// Hands out ready-to-use handles for devices, services and characteristics,
/// either from the [`HandleCache`] or by establishing them with the
/// transport and caching the result.
///
/// A failed resolve never touches the cache and there's no retry beyond the
/// single cached to uncached fallback; callers decide whether to try again.
pub struct Resolver {
    transport: Arc<dyn Transport>,
    cache: Arc<HandleCache>,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl Resolver {
    pub fn new(transport: Arc<dyn Transport>, cache: Arc<HandleCache>,
               subscriptions: Arc<SubscriptionRegistry>)
               -> Self {
        Self {
            transport,
            cache,
            subscriptions,
        }
    }

    // Collapses any failure into NotFound, keeping the cause in the log
    fn not_found<T>(what: &str, result: Result<T>) -> Result<T> {
        result.map_err(|err| {
            match err {
                Error::Other(_) => warn!("Failed to resolve {}: {:?}", what, err),
                _ => debug!("Failed to resolve {}: {}", what, err),
            }
            Error::NotFound
        })
    }

    pub async fn device(&self, address: DeviceAddress) -> Result<DeviceHandle> {
        Self::not_found(&format!("device {}", address), self.establish_device(address).await)
    }

    pub async fn service(&self, address: DeviceAddress, service: Uuid) -> Result<ServicePath> {
        let result = self.establish_service(address, service).await;
        Self::not_found(&format!("service {} of {}", service.short(), address), result)
    }

    pub async fn characteristic(&self, address: DeviceAddress, service: Uuid, characteristic: Uuid)
                                -> Result<CharacteristicPath> {
        let key = CharacteristicKey {
            address,
            service,
            characteristic,
        };
        let result = self.establish_characteristic(key).await;
        Self::not_found(&format!("characteristic {} of service {} of {}",
                                 characteristic.short(),
                                 service.short(),
                                 address),
                        result)
    }

    /// Resolves a device and fetches all of its services (cached first),
    /// caching each of them
    pub async fn services(&self, address: DeviceAddress)
                          -> Result<(DeviceHandle, Vec<RemoteService>)> {
        let device = self.device(address).await?;
        let epoch = self.cache.epoch(address);
        let services = self.fetch_services(device).await?;
        self.index_services(epoch, address, device, &services)?;
        Ok((device, services))
    }

    async fn invalidate(&self, address: DeviceAddress) -> Result<()> {
        self.cache.remove_device(address)?;
        let revoked = self.subscriptions.revoke_device(address).await;
        if revoked > 0 {
            debug!("Revoked {} subscription(s) of unreachable device {}", revoked, address);
        }
        Ok(())
    }

    async fn establish_device(&self, address: DeviceAddress) -> Result<DeviceHandle> {
        if let Some(device) = self.cache.device(address)? {
            if self.transport.is_reachable(device) {
                trace!("Reusing cached device {} ({:?})", address, device);
                return Ok(device);
            }
            debug!("Cached device {} ({:?}) is no longer reachable", address, device);
            self.invalidate(address).await?;
        }

        let epoch = self.cache.epoch(address);
        let device = self.transport.open_device(address).await?;
        match self.cache.put_device(epoch, address, device)? {
            Some(canonical) => {
                if canonical != device {
                    debug!("Device {} was opened concurrently, using {:?}", address, canonical);
                }
                Ok(canonical)
            }
            None => {
                debug!("Device {} was invalidated while {:?} was being opened", address, device);
                Err(Error::InvalidStateReference)
            }
        }
    }

    async fn fetch_services(&self, device: DeviceHandle) -> Result<Vec<RemoteService>> {
        with_cache_fallback("services",
                            |cache_mode| self.transport.get_services(device, cache_mode)).await
    }

    fn index_services(&self, epoch: CacheEpoch, address: DeviceAddress, device: DeviceHandle,
                      services: &[RemoteService])
                      -> Result<()> {
        for service in services {
            let key = ServiceKey {
                address,
                service: service.uuid,
            };
            let path = ServicePath {
                device,
                service: service.handle,
            };
            self.cache.put_service(epoch, key, path)?;
        }
        Ok(())
    }

    async fn establish_service(&self, address: DeviceAddress, service: Uuid) -> Result<ServicePath> {
        let key = ServiceKey { address, service };
        if let Some(path) = self.cache.service(&key)? {
            if self.transport.is_reachable(path.device) {
                trace!("Reusing cached service {} of {}", service.short(), address);
                return Ok(path);
            }
        }

        let device = self.establish_device(address).await?;
        let epoch = self.cache.epoch(address);
        let services = self.fetch_services(device).await?;
        self.index_services(epoch, address, device, &services)?;

        let found = services.iter().find(|s| s.uuid == service).ok_or(Error::NotFound)?;
        let path = ServicePath {
            device,
            service: found.handle,
        };
        // Only hand out what made it into the cache
        if self.cache.service(&key)? != Some(path) {
            debug!("Service {} of {} was invalidated while being resolved", service.short(),
                   address);
            return Err(Error::InvalidStateReference);
        }
        Ok(path)
    }

    /// Caches the characteristics fetched for a service
    pub fn index_characteristics(&self, epoch: CacheEpoch, key: ServiceKey, service: ServicePath,
                                 characteristics: &[RemoteCharacteristic])
                                 -> Result<()> {
        for characteristic in characteristics {
            let characteristic_key = CharacteristicKey {
                address: key.address,
                service: key.service,
                characteristic: characteristic.uuid,
            };
            let entry = CachedCharacteristic {
                path: service.characteristic(characteristic.handle),
                properties: characteristic.properties,
                description: None,
            };
            self.cache.put_characteristic(epoch, characteristic_key, entry)?;
        }
        Ok(())
    }

    async fn establish_characteristic(&self, key: CharacteristicKey) -> Result<CharacteristicPath> {
        if let Some(cached) = self.cache.characteristic(&key)? {
            if self.transport.is_reachable(cached.path.device) {
                trace!("Reusing cached characteristic {} of {}", key.characteristic.short(),
                       key.address);
                return Ok(cached.path);
            }
        }

        let service = self.establish_service(key.address, key.service).await?;
        let epoch = self.cache.epoch(key.address);
        let characteristics =
            with_cache_fallback("characteristics", |cache_mode| {
                self.transport.get_characteristics(service, cache_mode)
            }).await?;
        self.index_characteristics(epoch, key.service_key(), service, &characteristics)?;

        let found = characteristics.iter()
                                   .find(|c| c.uuid == key.characteristic)
                                   .ok_or(Error::NotFound)?;
        let path = service.characteristic(found.handle);
        if self.cache.characteristic(&key)?.map(|cached| cached.path) != Some(path) {
            debug!("Characteristic {} of {} was invalidated while being resolved",
                   key.characteristic.short(), key.address);
            return Err(Error::InvalidStateReference);
        }
        Ok(path)
    }
}
