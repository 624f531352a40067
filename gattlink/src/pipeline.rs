use std::fmt;
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache::{CharacteristicKey, HandleCache, ServiceKey};
use crate::cancel::CancellationToken;
use crate::records::{CharacteristicRecord, ServiceRecord};
use crate::resolver::Resolver;
use crate::subscription::{forward_notifications, NotificationSink, Subscription, SubscriptionKey,
                          SubscriptionRegistry};
use crate::transport::{CharacteristicPath, CharacteristicProperties, DeviceHandle, Transport,
                       WriteType};
use crate::uuid::{BluetoothUuid, USER_DESCRIPTION_UUID};
use crate::{CacheMode, DeviceAddress, Error, Result};

/// Reported for characteristics that have no user description descriptor
pub const NO_DESCRIPTION: &str = "no description available";

/// The GATT operations of a session as plain `async` functions.
///
/// These are what the callback entry points of [`Session`](crate::Session)
/// run; an application that's async itself can call them directly instead.
/// Failures are returned as errors here and only converted into sentinel
/// results at the callback boundary.
#[derive(Clone)]
pub struct Pipeline {
    transport: Arc<dyn Transport>,
    cache: Arc<HandleCache>,
    resolver: Arc<Resolver>,
    subscriptions: Arc<SubscriptionRegistry>,
    cancel: CancellationToken,
    runtime: Handle,
    notification_sink: Option<NotificationSink>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("cache", &self.cache)
            .field("subscriptions", &self.subscriptions)
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl Pipeline {
    pub fn new(transport: Arc<dyn Transport>, cancel: CancellationToken, runtime: Handle,
               notification_sink: Option<NotificationSink>)
               -> Self {
        let cache = Arc::new(HandleCache::new());
        let subscriptions = Arc::new(SubscriptionRegistry::new(transport.clone(), cache.clone(),
                                                               cancel.clone()));
        let resolver = Arc::new(Resolver::new(transport.clone(), cache.clone(),
                                              subscriptions.clone()));
        Pipeline {
            transport,
            cache,
            resolver,
            subscriptions,
            cancel,
            runtime,
            notification_sink,
        }
    }

    pub fn cache(&self) -> &Arc<HandleCache> {
        &self.cache
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn connect(&self, address: DeviceAddress) -> Result<DeviceHandle> {
        self.resolver.device(address).await
    }

    /// Removes the device from the cache and revokes its subscriptions.
    /// Returns whether the device was cached.
    ///
    /// The cache goes first: a subscribe racing with this either registers
    /// before the revoke or is refused by the registry.
    pub async fn disconnect(&self, address: DeviceAddress) -> Result<bool> {
        let removed = self.cache.remove_device(address);
        let revoked = self.subscriptions.revoke_device(address).await;
        if revoked > 0 {
            debug!("Revoked {} subscription(s) while disconnecting {}", revoked, address);
        }
        removed
    }

    /// Lists the services of a device.
    ///
    /// If the session starts shutting down part way through, the services
    /// listed so far are returned.
    pub async fn services(&self, address: DeviceAddress) -> Result<Vec<ServiceRecord>> {
        let (_, services) = self.resolver.services(address).await?;

        let mut records = Vec::with_capacity(services.len());
        for service in &services {
            records.push(ServiceRecord::from(service));

            if self.cancel.is_cancelled() {
                debug!("Stopped listing services of {} after {} of {}", address, records.len(),
                       services.len());
                break;
            }
        }
        Ok(records)
    }

    /// Lists the characteristics of a service along with their user
    /// descriptions.
    ///
    /// A characteristic whose description can't be read is left out of the
    /// result. If the session starts shutting down part way through, the
    /// characteristics listed so far are returned.
    pub async fn characteristics(&self, address: DeviceAddress, service: Uuid)
                                 -> Result<Vec<CharacteristicRecord>> {
        let key = ServiceKey { address, service };
        let path = self.resolver.service(address, service).await?;

        // Always a live query; the per-service result isn't worth trusting
        // from the platform cache
        let epoch = self.cache.epoch(address);
        let characteristics = self.transport.get_characteristics(path, CacheMode::Uncached).await?;
        self.resolver.index_characteristics(epoch, key, path, &characteristics)?;

        let mut records = Vec::with_capacity(characteristics.len());
        for characteristic in &characteristics {
            let characteristic_key = CharacteristicKey {
                address,
                service,
                characteristic: characteristic.uuid,
            };
            let characteristic_path = path.characteristic(characteristic.handle);
            match self.description(&characteristic_key, characteristic_path).await {
                Ok(description) => {
                    records.push(CharacteristicRecord::new(characteristic.uuid, &description))
                }
                Err(err) => {
                    warn!("Skipping characteristic {} of {}: couldn't read its user description: {}",
                          characteristic.uuid.short(),
                          address,
                          err);
                }
            }

            if self.cancel.is_cancelled() {
                debug!("Stopped listing characteristics of {} after {} of {}", service.short(),
                       records.len(), characteristics.len());
                break;
            }
        }
        Ok(records)
    }

    async fn description(&self, key: &CharacteristicKey, path: CharacteristicPath)
                         -> Result<String> {
        if let Some(cached) = self.cache.characteristic(key)? {
            if cached.path == path {
                if let Some(description) = cached.description {
                    trace!("Using cached description of {}", key.characteristic.short());
                    return Ok(description);
                }
            }
        }

        let description = match self.transport
                                    .read_descriptor(path, USER_DESCRIPTION_UUID,
                                                     CacheMode::Uncached)
                                    .await?
        {
            Some(value) => String::from_utf8_lossy(&value).into_owned(),
            None => NO_DESCRIPTION.to_string(),
        };
        self.cache.set_description(key, path, &description)?;
        Ok(description)
    }

    /// Enables notifications for a characteristic and registers the
    /// subscription. Values are delivered to the session's notification sink,
    /// if one was configured.
    pub async fn subscribe(&self, address: DeviceAddress, service: Uuid, characteristic: Uuid)
                           -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let path = self.resolver.characteristic(address, service, characteristic).await?;
        let key = SubscriptionKey {
            address,
            service,
            characteristic,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.transport.enable_notify(path, tx).await?;
        let forwarder = self.notification_sink.as_ref().map(|sink| {
            self.runtime.spawn(forward_notifications(key, rx, self.cancel.clone(), sink.clone()))
        });

        self.subscriptions.register(Subscription::new(key, path, token, forwarder)).await?;
        debug!("Subscribed to {}", key);
        Ok(())
    }

    /// Revokes a single subscription, returning whether there was one
    pub async fn unsubscribe(&self, address: DeviceAddress, service: Uuid, characteristic: Uuid)
                             -> bool {
        let key = SubscriptionKey {
            address,
            service,
            characteristic,
        };
        self.subscriptions.revoke(&key).await
    }

    pub async fn read(&self, address: DeviceAddress, service: Uuid, characteristic: Uuid)
                      -> Result<Vec<u8>> {
        let path = self.resolver.characteristic(address, service, characteristic).await?;
        self.transport.read_value(path, CacheMode::Uncached).await
    }

    /// Writes a value, with a response unless the characteristic only
    /// supports writes without one
    pub async fn write(&self, address: DeviceAddress, service: Uuid, characteristic: Uuid,
                       data: &[u8])
                       -> Result<()> {
        let key = CharacteristicKey {
            address,
            service,
            characteristic,
        };
        let path = self.resolver.characteristic(address, service, characteristic).await?;
        let properties = self.cache
                             .characteristic(&key)?
                             .filter(|cached| cached.path == path)
                             .map_or(CharacteristicProperties::empty(), |cached| cached.properties);
        self.transport.write_value(path, write_type(properties), data).await
    }
}

fn write_type(properties: CharacteristicProperties) -> WriteType {
    if !properties.contains(CharacteristicProperties::WRITE)
       && properties.contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE)
    {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    }
}
