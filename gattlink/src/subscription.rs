use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::{CharacteristicKey, HandleCache};
use crate::cancel::CancellationToken;
use crate::transport::{CharacteristicPath, NotifyToken, Transport};
use crate::uuid::BluetoothUuid;
use crate::{DeviceAddress, Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub address: DeviceAddress,
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl From<SubscriptionKey> for CharacteristicKey {
    fn from(key: SubscriptionKey) -> Self {
        CharacteristicKey {
            address: key.address,
            service: key.service,
            characteristic: key.characteristic,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.address, self.service.short(), self.characteristic.short())
    }
}

/// A characteristic value pushed by a peripheral for an active subscription
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub address: DeviceAddress,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

pub type NotificationSink = Arc<dyn Fn(&Notification) + Send + Sync>;

/// An active notification registration.
///
/// The registry owns these by value; releasing one (see
/// [`SubscriptionRegistry::revoke`]) stops its forwarder and disables
/// notifications with the transport.
#[derive(Debug)]
pub struct Subscription {
    key: SubscriptionKey,
    characteristic: CharacteristicPath,
    token: NotifyToken,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(key: SubscriptionKey, characteristic: CharacteristicPath,
                      token: NotifyToken, forwarder: Option<JoinHandle<()>>)
                      -> Self {
        Self {
            key,
            characteristic,
            token,
            forwarder,
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        self.key
    }

    pub fn characteristic(&self) -> CharacteristicPath {
        self.characteristic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Delivers notified values to the application until the channel closes or
/// the session starts shutting down
pub(crate) async fn forward_notifications(key: SubscriptionKey,
                                          mut values: mpsc::UnboundedReceiver<Vec<u8>>,
                                          cancel: CancellationToken, sink: NotificationSink) {
    while let Some(value) = values.recv().await {
        if cancel.is_cancelled() {
            trace!("Dropping notification for {} during shutdown", key);
            break;
        }
        sink(&Notification {
            address: key.address,
            service: key.service,
            characteristic: key.characteristic,
            value,
        });
    }
    trace!("Notification forwarder for {} finished", key);
}

/// Tracks active subscriptions so they can be revoked individually, per
/// device or all at once.
///
/// Every mutation holds the registry lock for its whole duration, including
/// the transport calls that release registrations, so removing an entry and
/// disabling its notifications happen as one step from the point of view of
/// any other registry user.
///
/// Entries are only admitted for characteristic handles that are still in
/// the [`HandleCache`], checked under the registry lock. Whoever removes a
/// device from the cache and then calls [`revoke_device`] can't miss a
/// registration racing with it.
///
/// [`revoke_device`]: SubscriptionRegistry::revoke_device
pub struct SubscriptionRegistry {
    transport: Arc<dyn Transport>,
    cache: Arc<HandleCache>,
    cancel: CancellationToken,
    entries: Mutex<HashMap<SubscriptionKey, Subscription>>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new(transport: Arc<dyn Transport>, cache: Arc<HandleCache>,
               cancel: CancellationToken)
               -> Self {
        Self {
            transport,
            cache,
            cancel,
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn release(&self, subscription: Subscription) {
        let key = subscription.key;
        let token = subscription.token;

        // Stop forwarding before the registration goes away
        drop(subscription);

        match self.transport.disable_notify(token).await {
            Ok(()) => trace!("Disabled notifications for {}", key),
            Err(err) => warn!("Failed to disable notifications for {}: {}", key, err),
        }
    }

    /// Adds a subscription, replacing (and releasing) any existing one for the
    /// same characteristic.
    ///
    /// Fails with `Error::Cancelled`, releasing `subscription`, once the
    /// session has started shutting down so that nothing can be registered
    /// after `revoke_all()`. Fails with `Error::InvalidStateReference`, also
    /// releasing it, when its characteristic handle is no longer the cached
    /// one.
    pub async fn register(&self, subscription: Subscription) -> Result<()> {
        let mut entries = self.entries.lock().await;

        if self.cancel.is_cancelled() {
            debug!("Refusing to register subscription for {} during shutdown", subscription.key);
            self.release(subscription).await;
            return Err(Error::Cancelled);
        }

        let cached = match self.cache.characteristic(&subscription.key.into()) {
            Ok(cached) => cached.map(|cached| cached.path),
            Err(err) => {
                self.release(subscription).await;
                return Err(err);
            }
        };
        if cached != Some(subscription.characteristic()) {
            debug!("Refusing to register subscription for {}, its handle was invalidated",
                   subscription.key);
            self.release(subscription).await;
            return Err(Error::InvalidStateReference);
        }

        let key = subscription.key;
        if let Some(previous) = entries.insert(key, subscription) {
            debug!("Replacing existing subscription for {}", key);
            self.release(previous).await;
        }
        Ok(())
    }

    /// Revokes a single subscription, returning whether there was one
    pub async fn revoke(&self, key: &SubscriptionKey) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some(subscription) => {
                self.release(subscription).await;
                true
            }
            None => false,
        }
    }

    /// Revokes every subscription for characteristics of one device
    pub async fn revoke_device(&self, address: DeviceAddress) -> usize {
        let mut entries = self.entries.lock().await;
        let keys: Vec<SubscriptionKey> = entries.keys()
                                                .filter(|key| key.address == address)
                                                .copied()
                                                .collect();
        for key in &keys {
            if let Some(subscription) = entries.remove(key) {
                self.release(subscription).await;
            }
        }
        keys.len()
    }

    /// Revokes every subscription, leaving the registry empty
    pub async fn revoke_all(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        for (_, subscription) in entries.drain().collect::<Vec<_>>() {
            self.release(subscription).await;
        }
        if count > 0 {
            debug!("Revoked {} subscription(s)", count);
        }
        count
    }

    pub async fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachedCharacteristic, ServiceKey};
    use crate::fake::{CallKind, FakeCharacteristic, FakeDevice, FakeService, FakeTransport};
    use crate::transport::ServicePath;
    use crate::uuid::uuid_from_u16;
    use crate::CacheMode;

    const FIRST: DeviceAddress = DeviceAddress::new(0x0000_0000_0000_0001);
    const SECOND: DeviceAddress = DeviceAddress::new(0x0000_0000_0000_0002);
    const SERVICE: Uuid = uuid_from_u16(0x180D);
    const CHARACTERISTIC: Uuid = uuid_from_u16(0x2A37);

    struct Fixture {
        fake: Arc<FakeTransport>,
        cache: Arc<HandleCache>,
        cancel: CancellationToken,
        registry: SubscriptionRegistry,
    }

    fn setup() -> Fixture {
        crate::init_test_logging();
        let fake = Arc::new(FakeTransport::new());
        for address in [FIRST, SECOND] {
            fake.add_device(FakeDevice::new(address).with_service(
                FakeService::new(SERVICE).with_characteristic(FakeCharacteristic::new(CHARACTERISTIC))));
        }
        let cache = Arc::new(HandleCache::new());
        let cancel = CancellationToken::new();
        let registry = SubscriptionRegistry::new(fake.clone(), cache.clone(), cancel.clone());
        Fixture {
            fake,
            cache,
            cancel,
            registry,
        }
    }

    // Opens the characteristic, caches its handles and enables notifications
    async fn subscription(fixture: &Fixture, address: DeviceAddress) -> Subscription {
        let Fixture { fake, cache, .. } = fixture;
        let epoch = cache.epoch(address);
        let device = fake.open_device(address).await.unwrap();
        let service = fake.get_services(device, CacheMode::Uncached).await.unwrap()[0];
        let service = ServicePath { device, service: service.handle };
        let characteristic = fake.get_characteristics(service, CacheMode::Uncached).await.unwrap()[0];
        let path = service.characteristic(characteristic.handle);

        let key = SubscriptionKey { address, service: SERVICE, characteristic: CHARACTERISTIC };
        cache.put_device(epoch, address, device).unwrap();
        cache.put_service(epoch, ServiceKey { address, service: SERVICE }, service).unwrap();
        cache.put_characteristic(epoch, key.into(), CachedCharacteristic {
                 path,
                 properties: characteristic.properties,
                 description: None,
             })
             .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let token = fake.enable_notify(path, tx).await.unwrap();
        Subscription::new(key, path, token, None)
    }

    #[tokio::test]
    async fn revoke_releases_once() {
        let fixture = setup();
        let subscription = subscription(&fixture, FIRST).await;
        let key = subscription.key();
        fixture.registry.register(subscription).await.unwrap();
        assert!(fixture.registry.contains(&key).await);

        assert!(fixture.registry.revoke(&key).await);
        assert!(!fixture.registry.revoke(&key).await);
        assert_eq!(fixture.fake.count(CallKind::DisableNotify), 1);
        assert_eq!(fixture.fake.active_notifications(), 0);
    }

    #[tokio::test]
    async fn revoke_device_leaves_other_devices() {
        let fixture = setup();
        let registry = &fixture.registry;
        registry.register(subscription(&fixture, FIRST).await).await.unwrap();
        registry.register(subscription(&fixture, SECOND).await).await.unwrap();

        assert_eq!(registry.revoke_device(FIRST).await, 1);
        assert_eq!(registry.len().await, 1);
        assert_eq!(fixture.fake.active_notifications(), 1);

        assert_eq!(registry.revoke_all().await, 1);
        assert_eq!(registry.revoke_all().await, 0);
        assert!(registry.is_empty().await);
        assert_eq!(fixture.fake.active_notifications(), 0);
    }

    #[tokio::test]
    async fn register_is_refused_once_cancelled() {
        let fixture = setup();
        fixture.cancel.cancel();

        let result = fixture.registry.register(subscription(&fixture, FIRST).await).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(fixture.registry.is_empty().await);
        // The refused registration is still released
        assert_eq!(fixture.fake.active_notifications(), 0);
    }

    #[tokio::test]
    async fn register_is_refused_for_uncached_handles() {
        let fixture = setup();
        let subscription = subscription(&fixture, FIRST).await;
        fixture.cache.remove_device(FIRST).unwrap();

        let result = fixture.registry.register(subscription).await;
        assert!(matches!(result, Err(Error::InvalidStateReference)));
        assert!(fixture.registry.is_empty().await);
        assert_eq!(fixture.fake.count(CallKind::DisableNotify), 1);
        assert_eq!(fixture.fake.active_notifications(), 0);
    }

    #[tokio::test]
    async fn register_is_refused_for_replaced_handles() {
        let fixture = setup();
        let stale = subscription(&fixture, FIRST).await;
        fixture.cache.remove_device(FIRST).unwrap();
        let current = subscription(&fixture, FIRST).await;

        assert!(matches!(fixture.registry.register(stale).await,
                         Err(Error::InvalidStateReference)));
        fixture.registry.register(current).await.unwrap();
        assert_eq!(fixture.registry.len().await, 1);
        assert_eq!(fixture.fake.active_notifications(), 1);
    }
}
