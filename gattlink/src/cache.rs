use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock as StdRwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use log::{debug, trace};
use uuid::Uuid;

use crate::transport::{CharacteristicPath, CharacteristicProperties, DeviceHandle, ServicePath};
use crate::{DeviceAddress, Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub address: DeviceAddress,
    pub service: Uuid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CharacteristicKey {
    pub address: DeviceAddress,
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicKey {
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey {
            address: self.address,
            service: self.service,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedCharacteristic {
    pub path: CharacteristicPath,
    pub properties: CharacteristicProperties,

    // Fetched lazily, at most once per characteristic handle
    pub description: Option<String>,
}

/// A snapshot of the cache generation for one device address, taken before
/// starting the transport requests whose results are going to be inserted.
///
/// `clear()` advances the generation of every address and `remove_device()`
/// that of its own address. Inserts made with an older snapshot are refused,
/// so a resolve that straddles a teardown can't repopulate the cache with
/// handles from before it, while resolves of other devices carry on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheEpoch {
    global: u64,
    device: u64,
}

/// Maps logical identities to live, reusable transport handles.
///
/// Services are keyed under their device and characteristics under their
/// service, and an entry is only accepted while its parent entry still refers
/// to the same handle, so a service or characteristic entry never outlives
/// the device entry it was established through.
///
/// Handles returned before a `clear()` must be treated as unusable afterwards;
/// the cache can't enforce that on its callers.
#[derive(Debug, Default)]
pub struct HandleCache {
    // Lookups and inserts take this shared; `clear()` and cascading removal
    // take it exclusively so nothing reads a half-cleared cache.
    gate: StdRwLock<()>,
    epoch: AtomicU64,
    device_epochs: DashMap<DeviceAddress, u64>,

    devices: DashMap<DeviceAddress, DeviceHandle>,
    services: DashMap<ServiceKey, ServicePath>,
    characteristics: DashMap<CharacteristicKey, CachedCharacteristic>,
}

impl HandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn shared(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.gate.read().map_err(|_| Error::InvalidStateReference)
    }

    fn exclusive(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        self.gate.write().map_err(|_| Error::InvalidStateReference)
    }

    pub fn epoch(&self, address: DeviceAddress) -> CacheEpoch {
        CacheEpoch {
            global: self.epoch.load(Ordering::SeqCst),
            device: self.device_epochs.get(&address).map_or(0, |r| *r),
        }
    }

    fn is_current(&self, address: DeviceAddress, epoch: CacheEpoch) -> bool {
        self.epoch(address) == epoch
    }

    pub fn device(&self, address: DeviceAddress) -> Result<Option<DeviceHandle>> {
        let _gate = self.shared()?;
        Ok(self.devices.get(&address).map(|r| *r))
    }

    /// Caches a newly opened device, returning the handle callers should use.
    ///
    /// If another resolve already cached a handle for the same address then
    /// that one wins and is returned, so there's never more than one live
    /// handle per address. Returns `None` if `epoch` is stale and nothing
    /// was cached.
    pub fn put_device(&self, epoch: CacheEpoch, address: DeviceAddress, device: DeviceHandle)
                      -> Result<Option<DeviceHandle>> {
        let _gate = self.shared()?;
        if !self.is_current(address, epoch) {
            debug!("Not caching device {} opened across a cache invalidation", address);
            return Ok(None);
        }
        let canonical = *self.devices.entry(address).or_insert(device);
        Ok(Some(canonical))
    }

    pub fn service(&self, key: &ServiceKey) -> Result<Option<ServicePath>> {
        let _gate = self.shared()?;
        Ok(self.services.get(key).map(|r| *r))
    }

    pub fn put_service(&self, epoch: CacheEpoch, key: ServiceKey, path: ServicePath) -> Result<bool> {
        let _gate = self.shared()?;
        if !self.is_current(key.address, epoch) {
            return Ok(false);
        }
        let owner = self.devices.get(&key.address).map(|r| *r);
        if owner != Some(path.device) {
            trace!("Not caching service {} of a device handle that's no longer cached", key.service);
            return Ok(false);
        }
        self.services.insert(key, path);
        Ok(true)
    }

    pub fn characteristic(&self, key: &CharacteristicKey) -> Result<Option<CachedCharacteristic>> {
        let _gate = self.shared()?;
        Ok(self.characteristics.get(key).map(|r| r.clone()))
    }

    /// Caches a characteristic. Re-caching the same handle keeps any
    /// description that was already fetched for it.
    pub fn put_characteristic(&self, epoch: CacheEpoch, key: CharacteristicKey,
                              entry: CachedCharacteristic)
                              -> Result<bool> {
        let _gate = self.shared()?;
        if !self.is_current(key.address, epoch) {
            return Ok(false);
        }
        let owner = self.services.get(&key.service_key()).map(|r| *r);
        let expected = ServicePath {
            device: entry.path.device,
            service: entry.path.service,
        };
        if owner != Some(expected) {
            trace!("Not caching characteristic {} of a service that's no longer cached",
                   key.characteristic);
            return Ok(false);
        }

        if let Some(mut current) = self.characteristics.get_mut(&key) {
            if current.path == entry.path {
                current.properties = entry.properties;
                if entry.description.is_some() {
                    current.description = entry.description;
                }
            } else {
                *current = entry;
            }
            return Ok(true);
        }
        self.characteristics.insert(key, entry);
        Ok(true)
    }

    /// Records the user description of a cached characteristic, as long as
    /// the entry still refers to `path`
    pub fn set_description(&self, key: &CharacteristicKey, path: CharacteristicPath,
                           description: &str)
                           -> Result<bool> {
        let _gate = self.shared()?;
        match self.characteristics.get_mut(key) {
            Some(mut entry) if entry.path == path => {
                entry.description = Some(description.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Removes a device along with every service and characteristic entry
    /// keyed under it. Returns whether the device itself was cached.
    pub fn remove_device(&self, address: DeviceAddress) -> Result<bool> {
        let _gate = self.exclusive()?;
        *self.device_epochs.entry(address).or_insert(0) += 1;

        let removed = self.devices.remove(&address).is_some();
        self.services.retain(|key, _| key.address != address);
        self.characteristics.retain(|key, _| key.address != address);

        trace!("Removed cached state for {} (was cached = {})", address, removed);
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        let _gate = self.exclusive()?;
        self.epoch.fetch_add(1, Ordering::SeqCst);

        self.characteristics.clear();
        self.services.clear();
        self.devices.clear();

        debug!("Cleared handle cache");
        Ok(())
    }

    /// The total number of cached device, service and characteristic entries
    pub fn len(&self) -> usize {
        self.devices.len() + self.services.len() + self.characteristics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CharacteristicHandle, ServiceHandle};
    use crate::uuid::uuid_from_u16;

    const ADDRESS: DeviceAddress = DeviceAddress::new(0x0000_AABB_CCDD_EEFF);
    const OTHER: DeviceAddress = DeviceAddress::new(0x0000_1122_3344_5566);
    const SERVICE: Uuid = uuid_from_u16(0x180D);
    const CHARACTERISTIC: Uuid = uuid_from_u16(0x2A37);

    fn populate(cache: &HandleCache, address: DeviceAddress, device: u32) -> CharacteristicPath {
        let epoch = cache.epoch(address);
        let device = DeviceHandle(device);
        cache.put_device(epoch, address, device).unwrap();

        let service = ServicePath { device, service: ServiceHandle(device.0 * 10) };
        let key = ServiceKey { address, service: SERVICE };
        assert!(cache.put_service(epoch, key, service).unwrap());

        let path = service.characteristic(CharacteristicHandle(device.0 * 100));
        let key = CharacteristicKey { address, service: SERVICE, characteristic: CHARACTERISTIC };
        let entry = CachedCharacteristic {
            path,
            properties: CharacteristicProperties::READ,
            description: None,
        };
        assert!(cache.put_characteristic(epoch, key, entry).unwrap());
        path
    }

    #[test]
    fn first_device_handle_wins() {
        let cache = HandleCache::new();
        let epoch = cache.epoch(ADDRESS);
        assert_eq!(cache.put_device(epoch, ADDRESS, DeviceHandle(1)).unwrap(),
                   Some(DeviceHandle(1)));
        assert_eq!(cache.put_device(epoch, ADDRESS, DeviceHandle(2)).unwrap(),
                   Some(DeviceHandle(1)));
        assert_eq!(cache.device(ADDRESS).unwrap(), Some(DeviceHandle(1)));
    }

    #[test]
    fn remove_cascades_to_one_device_only() {
        let cache = HandleCache::new();
        populate(&cache, ADDRESS, 1);
        populate(&cache, OTHER, 2);
        assert_eq!(cache.len(), 6);

        assert!(cache.remove_device(ADDRESS).unwrap());
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.device(ADDRESS).unwrap(), None);
        assert_eq!(cache.service(&ServiceKey { address: ADDRESS, service: SERVICE }).unwrap(),
                   None);
        assert!(cache.device(OTHER).unwrap().is_some());

        assert!(!cache.remove_device(ADDRESS).unwrap());
    }

    #[test]
    fn stale_epoch_is_refused() {
        crate::init_test_logging();
        let cache = HandleCache::new();
        let epoch = cache.epoch(ADDRESS);
        cache.clear().unwrap();
        assert_eq!(cache.put_device(epoch, ADDRESS, DeviceHandle(1)).unwrap(), None);

        let epoch = cache.epoch(ADDRESS);
        cache.remove_device(ADDRESS).unwrap();
        assert_eq!(cache.put_device(epoch, ADDRESS, DeviceHandle(2)).unwrap(), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn removing_one_device_keeps_other_epochs() {
        let cache = HandleCache::new();
        let epoch = cache.epoch(OTHER);
        cache.remove_device(ADDRESS).unwrap();

        assert_eq!(cache.put_device(epoch, OTHER, DeviceHandle(3)).unwrap(),
                   Some(DeviceHandle(3)));
        assert_eq!(cache.device(OTHER).unwrap(), Some(DeviceHandle(3)));
    }

    #[test]
    fn orphans_are_refused() {
        let cache = HandleCache::new();
        let epoch = cache.epoch(ADDRESS);
        let path = ServicePath { device: DeviceHandle(7), service: ServiceHandle(70) };
        let key = ServiceKey { address: ADDRESS, service: SERVICE };
        assert!(!cache.put_service(epoch, key, path).unwrap());

        cache.put_device(epoch, ADDRESS, DeviceHandle(8)).unwrap();
        assert!(!cache.put_service(epoch, key, path).unwrap());
        assert!(cache.service(&key).unwrap().is_none());
    }

    #[test]
    fn description_survives_recaching_same_handle() {
        let cache = HandleCache::new();
        let path = populate(&cache, ADDRESS, 1);
        let key = CharacteristicKey { address: ADDRESS, service: SERVICE, characteristic: CHARACTERISTIC };
        assert!(cache.set_description(&key, path, "Heart Rate").unwrap());

        let entry = CachedCharacteristic {
            path,
            properties: CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            description: None,
        };
        assert!(cache.put_characteristic(cache.epoch(ADDRESS), key, entry).unwrap());

        let cached = cache.characteristic(&key).unwrap().unwrap();
        assert_eq!(cached.description.as_deref(), Some("Heart Rate"));
        assert!(cached.properties.contains(CharacteristicProperties::NOTIFY));
    }

    #[test]
    fn clear_empties_everything() {
        let cache = HandleCache::new();
        populate(&cache, ADDRESS, 1);
        populate(&cache, OTHER, 2);
        let before = cache.epoch(OTHER);

        cache.clear().unwrap();
        assert!(cache.is_empty());
        assert_ne!(cache.epoch(OTHER), before);

        cache.clear().unwrap();
        assert!(cache.is_empty());
    }
}
