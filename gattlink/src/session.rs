use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use function_name::named;
use futures::StreamExt;
use log::{debug, error, info, trace, warn};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cache::HandleCache;
use crate::cancel::CancellationToken;
use crate::completion::Completion;
use crate::pipeline::Pipeline;
use crate::records::{self, AdvertisementRecord, CharacteristicRecord, ServiceRecord, ValueBuffer};
use crate::subscription::{Notification, NotificationSink, SubscriptionRegistry};
use crate::tasks::{TaskId, TaskRegistry};
use crate::transport::{Filter, Transport};
use crate::{DeviceAddress, Error, FailureKind, Result};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl PartialEq for Session {
    fn eq(&self, other: &Session) -> bool {
        Arc::<SessionInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}
impl Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<SessionInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

// public for the sake of implementing Deref for ergonomics but since
// no members are public and there's no public API for SessionInner
// we don't really leak anything
pub struct SessionInner {
    transport: Arc<dyn Transport>,
    pipeline: Pipeline,

    // Raised by shutdown(), lowered again by start_scan()
    cancel: CancellationToken,

    // Every operation runs as a tracked task so shutdown can settle them
    tasks: TaskRegistry,
    shutdown_grace: Option<Duration>,

    // Note: a (tokio) mutex because it's held while starting/stopping the
    // scan, not just to maintain the scan task id itself
    scan: Mutex<Option<TaskId>>,
}

impl fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInner")
            .field("pipeline", &self.pipeline)
            .field("tasks", &self.tasks)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

pub struct SessionConfig {
    transport: Arc<dyn Transport>,
    runtime: Option<Handle>,
    shutdown_grace: Option<Duration>,
    notification_sink: Option<NotificationSink>,
}

impl SessionConfig {
    pub fn new(transport: Arc<dyn Transport>) -> SessionConfig {
        SessionConfig {
            transport,
            runtime: None,
            shutdown_grace: Some(DEFAULT_SHUTDOWN_GRACE),
            notification_sink: None,
        }
    }

    /// The runtime to spawn operation tasks on. By default, the runtime that
    /// `start()` is called from.
    pub fn set_runtime(&mut self, runtime: Handle) -> &mut Self {
        self.runtime = Some(runtime);
        self
    }

    /// How long `shutdown()` waits for in-flight operations before
    /// abandoning them. `None` abandons them immediately.
    pub fn set_shutdown_grace(&mut self, grace: Option<Duration>) -> &mut Self {
        self.shutdown_grace = grace;
        self
    }

    /// Called with every characteristic value notified for an active
    /// subscription, on an arbitrary runtime thread
    pub fn on_notification<F>(&mut self, sink: F) -> &mut Self
        where F: Fn(&Notification) + Send + Sync + 'static
    {
        self.notification_sink = Some(Arc::new(sink));
        self
    }

    pub async fn start(self) -> Result<Session> {
        Session::start(self).await
    }
}

fn log_failure(operation: &str, err: &Error) {
    match err.kind() {
        FailureKind::TransportException => error!("{}: transport error: {:?}", operation, err),
        kind => warn!("{}: {:?}: {}", operation, kind, err),
    }
}

impl Session {
    async fn start(config: SessionConfig) -> Result<Self> {
        let runtime = match config.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| Error::Unsupported)?,
        };

        let cancel = CancellationToken::new();
        let pipeline = Pipeline::new(config.transport.clone(), cancel.clone(), runtime.clone(),
                                     config.notification_sink);
        let session =
            Session { inner: Arc::new(SessionInner { transport: config.transport,
                                                     pipeline,
                                                     cancel,
                                                     tasks: TaskRegistry::new(runtime),
                                                     shutdown_grace: config.shutdown_grace,
                                                     scan: Mutex::new(None) }) };
        trace!("Started session");
        Ok(session)
    }

    /// The async API that the callback entry points are built on
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn cache(&self) -> &Arc<HandleCache> {
        self.pipeline.cache()
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        self.pipeline.subscriptions()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The number of launched operations that haven't completed yet
    pub fn in_flight(&self) -> usize {
        self.tasks.in_flight()
    }

    /// Starts listening for advertisements, handing each one to
    /// `on_advertisement` until the scan is stopped or the session shuts
    /// down, and then calls `on_stopped` once.
    ///
    /// Starting a scan lowers the cancellation flag, so a session that was
    /// shut down can be used again.
    ///
    /// Note: It's an error to start a scan while another one is running.
    pub async fn start_scan<A, S>(&self, filter: Filter, on_advertisement: A, on_stopped: S)
                                  -> Result<TaskId>
        where A: Fn(&AdvertisementRecord) + Send + Sync + 'static,
              S: FnOnce() + Send + 'static
    {
        let mut scan = self.scan.lock().await;
        self.cancel.reset();

        if let Some(id) = *scan {
            if self.tasks.is_running(id) {
                return Err(Error::Other(anyhow!("Already scanning")));
            }
        }

        let mut advertisements = self.transport.start_scanning(&filter)?;
        let cancel = self.cancel.clone();
        let stopped = Completion::new("scan", move |()| on_stopped());
        let id = self.tasks.spawn("scan", async move {
            while let Some(advertisement) = advertisements.next().await {
                if cancel.is_cancelled() {
                    break;
                }
                on_advertisement(&AdvertisementRecord::from(&advertisement));
            }
            debug!("Advertisement scan finished");
            stopped.complete(());
        });
        *scan = Some(id);

        info!("Started scanning");
        Ok(id)
    }

    pub async fn stop_scan(&self) -> Result<()> {
        let mut scan = self.scan.lock().await;
        if scan.is_none() {
            return Err(Error::Other(anyhow!("Not currently scanning")));
        }

        self.transport.stop_scanning()?;
        *scan = None;

        info!("Stopped scanning");
        Ok(())
    }

    /// Tears everything down: raises the cancellation flag, stops scanning,
    /// revokes every subscription, clears the cache and finally settles the
    /// operations still in flight (see [`SessionConfig::set_shutdown_grace`]).
    ///
    /// Each step runs regardless of how the previous one went, and calling
    /// this again is harmless. Must not be awaited from within an operation
    /// task of this session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        {
            let mut scan = self.scan.lock().await;
            if let Err(err) = self.transport.stop_scanning() {
                warn!("Failed to stop scanning during shutdown: {}", err);
            }
            *scan = None;
        }

        let revoked = self.pipeline.subscriptions().revoke_all().await;

        if let Err(err) = self.pipeline.cache().clear() {
            error!("Failed to clear handle cache during shutdown: {}", err);
        }

        let abandoned = self.tasks.settle(self.shutdown_grace).await;
        info!("Session shut down ({} subscription(s) revoked, {} operation(s) abandoned)",
              revoked, abandoned);
    }

    /// Connects to (or reuses the connection to) a device. `callback`
    /// receives the address, or zero on failure.
    #[named]
    pub fn connect<F>(&self, address: u64, callback: F) -> TaskId
        where F: FnOnce(u64) + Send + 'static
    {
        let address = DeviceAddress::from(address);
        let completion =
            Completion::new(function_name!(), move |address: DeviceAddress| callback(address.into()));
        let pipeline = self.pipeline.clone();
        self.tasks.spawn(function_name!(), async move {
            match pipeline.connect(address).await {
                Ok(_) => completion.complete(address),
                Err(err) => {
                    log_failure(function_name!(), &err);
                    completion.complete(DeviceAddress::NONE);
                }
            }
        })
    }

    /// Forgets a device along with its services, characteristics and
    /// subscriptions. `callback` receives the address, or zero on failure.
    #[named]
    pub fn disconnect<F>(&self, address: u64, callback: F) -> TaskId
        where F: FnOnce(u64) + Send + 'static
    {
        let address = DeviceAddress::from(address);
        let completion =
            Completion::new(function_name!(), move |address: DeviceAddress| callback(address.into()));
        let pipeline = self.pipeline.clone();
        self.tasks.spawn(function_name!(), async move {
            match pipeline.disconnect(address).await {
                Ok(_) => completion.complete(address),
                Err(err) => {
                    log_failure(function_name!(), &err);
                    completion.complete(DeviceAddress::NONE);
                }
            }
        })
    }

    /// Lists the services of a device. Failures give an empty list.
    #[named]
    pub fn enumerate_services<F>(&self, address: u64, callback: F) -> TaskId
        where F: FnOnce(&[ServiceRecord]) + Send + 'static
    {
        let address = DeviceAddress::from(address);
        let completion = Completion::new(function_name!(),
                                         move |services: Vec<ServiceRecord>| callback(&services));
        let pipeline = self.pipeline.clone();
        self.tasks.spawn(function_name!(), async move {
            match pipeline.services(address).await {
                Ok(services) => completion.complete(services),
                Err(err) => {
                    log_failure(function_name!(), &err);
                    completion.complete(vec![]);
                }
            }
        })
    }

    /// Lists the characteristics of a service with their user descriptions.
    /// Failures give an empty list.
    #[named]
    pub fn enumerate_characteristics<F>(&self, address: u64, service: Uuid, callback: F) -> TaskId
        where F: FnOnce(&[CharacteristicRecord]) + Send + 'static
    {
        let address = DeviceAddress::from(address);
        let completion =
            Completion::new(function_name!(),
                            move |characteristics: Vec<CharacteristicRecord>| {
                                callback(&characteristics)
                            });
        let pipeline = self.pipeline.clone();
        self.tasks.spawn(function_name!(), async move {
            match pipeline.characteristics(address, service).await {
                Ok(characteristics) => completion.complete(characteristics),
                Err(err) => {
                    log_failure(function_name!(), &err);
                    completion.complete(vec![]);
                }
            }
        })
    }

    #[named]
    pub fn subscribe<F>(&self, address: u64, service: Uuid, characteristic: Uuid, callback: F)
                        -> TaskId
        where F: FnOnce(bool) + Send + 'static
    {
        let address = DeviceAddress::from(address);
        let completion = Completion::new(function_name!(), callback);
        let pipeline = self.pipeline.clone();
        self.tasks.spawn(function_name!(), async move {
            match pipeline.subscribe(address, service, characteristic).await {
                Ok(()) => completion.complete(true),
                Err(err) => {
                    log_failure(function_name!(), &err);
                    completion.complete(false);
                }
            }
        })
    }

    /// `callback` receives whether there was a subscription to revoke
    #[named]
    pub fn unsubscribe<F>(&self, address: u64, service: Uuid, characteristic: Uuid, callback: F)
                          -> TaskId
        where F: FnOnce(bool) + Send + 'static
    {
        let address = DeviceAddress::from(address);
        let completion = Completion::new(function_name!(), callback);
        let pipeline = self.pipeline.clone();
        self.tasks.spawn(function_name!(), async move {
            let revoked = pipeline.unsubscribe(address, service, characteristic).await;
            completion.complete(revoked);
        })
    }

    /// Reads a characteristic value. `callback` receives `None` if the read
    /// failed; a successful read may still give an empty value.
    #[named]
    pub fn read_bytes<F>(&self, address: u64, service: Uuid, characteristic: Uuid, callback: F)
                         -> TaskId
        where F: FnOnce(Option<&[u8]>) + Send + 'static
    {
        let address = DeviceAddress::from(address);
        let completion = Completion::new(function_name!(),
                                         move |value: Option<ValueBuffer>| {
                                             callback(value.as_deref())
                                         });
        let pipeline = self.pipeline.clone();
        self.tasks.spawn(function_name!(), async move {
            match pipeline.read(address, service, characteristic).await {
                Ok(value) => completion.complete(Some(records::value_buffer(&value))),
                Err(err) => {
                    log_failure(function_name!(), &err);
                    completion.complete(None);
                }
            }
        })
    }

    /// Writes a characteristic value (with response). `callback` receives
    /// whether the write succeeded.
    #[named]
    pub fn write_bytes<F>(&self, address: u64, service: Uuid, characteristic: Uuid, data: &[u8],
                          callback: F)
                          -> TaskId
        where F: FnOnce(bool) + Send + 'static
    {
        let address = DeviceAddress::from(address);
        let data = data.to_vec();
        let completion = Completion::new(function_name!(), callback);
        let pipeline = self.pipeline.clone();
        self.tasks.spawn(function_name!(), async move {
            match pipeline.write(address, service, characteristic, &data).await {
                Ok(()) => completion.complete(true),
                Err(err) => {
                    log_failure(function_name!(), &err);
                    completion.complete(false);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{CallKind, FakeCharacteristic, FakeDevice, FakeFailure, FakeService,
                      FakeTransport};
    use crate::transport::Advertisement;
    use crate::uuid::uuid_from_u16;
    use tokio::sync::mpsc;

    const ADDRESS: u64 = 0x0000_F00D_0000_0007;
    const UNKNOWN: u64 = 0x0000_0000_0BAD_0BAD;
    const ENVIRONMENT: Uuid = uuid_from_u16(0x181A);
    const TEMPERATURE: Uuid = uuid_from_u16(0x2A6E);
    const HUMIDITY: Uuid = uuid_from_u16(0x2A6F);

    fn fake() -> Arc<FakeTransport> {
        crate::init_test_logging();
        let fake = Arc::new(FakeTransport::new());
        let environment = FakeService::new(ENVIRONMENT)
            .with_characteristic(FakeCharacteristic::new(TEMPERATURE).with_value(&[0x2C, 0x08]))
            .with_characteristic(FakeCharacteristic::new(HUMIDITY).with_description("Humidity"));
        fake.add_device(FakeDevice::new(DeviceAddress::new(ADDRESS)).with_service(environment));
        fake
    }

    async fn start(fake: &Arc<FakeTransport>) -> Session {
        let mut config = SessionConfig::new(fake.clone());
        config.set_shutdown_grace(Some(Duration::from_millis(50)));
        config.start().await.unwrap()
    }

    // Collects every completion so tests can check there was exactly one
    fn completions<T: Send + 'static>() -> (mpsc::UnboundedSender<T>, mpsc::UnboundedReceiver<T>) {
        mpsc::unbounded_channel()
    }

    async fn only<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        let value = rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err(), "completed more than once");
        value
    }

    #[tokio::test]
    async fn session_eq() {
        let fake = fake();
        let session0 = start(&fake).await;
        let session1 = start(&fake).await;
        assert_ne!(session0, session1);
        assert_eq!(session0, session0.clone());
    }

    #[test]
    fn start_needs_a_runtime() {
        let config = SessionConfig::new(fake());
        let result = futures::executor::block_on(config.start());
        assert!(matches!(result, Err(Error::Unsupported)));
    }

    #[tokio::test]
    async fn connect_reports_address_or_zero() {
        let fake = fake();
        let session = start(&fake).await;
        let (tx, mut rx) = completions();

        let ok = tx.clone();
        session.connect(ADDRESS, move |address| ok.send(address).unwrap());
        assert_eq!(only(&mut rx).await, ADDRESS);

        session.connect(UNKNOWN, move |address| tx.send(address).unwrap());
        assert_eq!(only(&mut rx).await, 0);
    }

    #[tokio::test]
    async fn write_to_unresolvable_device_fails_once() {
        let fake = fake();
        let session = start(&fake).await;
        let (tx, mut rx) = completions();

        session.write_bytes(UNKNOWN, ENVIRONMENT, TEMPERATURE, &[1, 2], move |ok| {
                   tx.send(ok).unwrap()
               });
        assert!(!only(&mut rx).await);

        session.shutdown().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(fake.count(CallKind::WriteValue), 0);
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let fake = fake();
        let session = start(&fake).await;
        let value: Vec<u8> = (0..=255).collect();

        let (tx, mut rx) = completions();
        session.write_bytes(ADDRESS, ENVIRONMENT, TEMPERATURE, &value, move |ok| {
                   tx.send(ok).unwrap()
               });
        assert!(only(&mut rx).await);

        let (tx, mut rx) = completions();
        session.read_bytes(ADDRESS, ENVIRONMENT, TEMPERATURE, move |value| {
                   tx.send(value.map(|v| v.to_vec())).unwrap()
               });
        assert_eq!(only(&mut rx).await, Some(value));
    }

    #[tokio::test]
    async fn failed_read_completes_with_none() {
        let fake = fake();
        let session = start(&fake).await;
        fake.fail_next(CallKind::ReadValue, FakeFailure::Exception("device error".to_string()));

        let (tx, mut rx) = completions();
        session.read_bytes(ADDRESS, ENVIRONMENT, TEMPERATURE, move |value| {
                   tx.send(value.map(|v| v.to_vec())).unwrap()
               });
        assert_eq!(only(&mut rx).await, None);
    }

    #[tokio::test]
    async fn failed_write_reports_false() {
        let fake = fake();
        let session = start(&fake).await;
        fake.fail_next(CallKind::WriteValue, FakeFailure::AccessDenied);

        let (tx, mut rx) = completions();
        session.write_bytes(ADDRESS, ENVIRONMENT, TEMPERATURE, &[1], move |ok| {
                   tx.send(ok).unwrap()
               });
        assert!(!only(&mut rx).await);
    }

    #[tokio::test]
    async fn enumerations_deliver_records() {
        let fake = fake();
        let session = start(&fake).await;

        let (tx, mut rx) = completions();
        session.enumerate_services(ADDRESS, move |services| tx.send(services.to_vec()).unwrap());
        assert_eq!(only(&mut rx).await, vec![ServiceRecord { uuid: ENVIRONMENT }]);

        let (tx, mut rx) = completions();
        session.enumerate_characteristics(ADDRESS, ENVIRONMENT, move |characteristics| {
                   tx.send(characteristics.to_vec()).unwrap()
               });
        let characteristics = only(&mut rx).await;
        let descriptions: Vec<&str> =
            characteristics.iter().map(|c| c.description.as_str()).collect();
        assert_eq!(descriptions, vec![crate::pipeline::NO_DESCRIPTION, "Humidity"]);

        let (tx, mut rx) = completions();
        session.enumerate_services(UNKNOWN, move |services| tx.send(services.len()).unwrap());
        assert_eq!(only(&mut rx).await, 0);
    }

    #[tokio::test]
    async fn shutdown_revokes_subscriptions_once() {
        let fake = fake();
        let session = start(&fake).await;

        let (tx, mut rx) = completions();
        session.subscribe(ADDRESS, ENVIRONMENT, HUMIDITY, move |ok| tx.send(ok).unwrap());
        assert!(only(&mut rx).await);
        assert_eq!(session.subscriptions().len().await, 1);

        session.shutdown().await;
        assert!(session.subscriptions().is_empty().await);
        assert!(session.cache().is_empty());
        assert_eq!(fake.count(CallKind::DisableNotify), 1);

        session.shutdown().await;
        assert!(session.subscriptions().is_empty().await);
        assert!(session.cache().is_empty());
        assert_eq!(fake.count(CallKind::DisableNotify), 1);
        assert_eq!(fake.count(CallKind::StopScanning), 2);
    }

    #[tokio::test]
    async fn subscribe_after_shutdown_fails() {
        let fake = fake();
        let session = start(&fake).await;
        session.shutdown().await;

        let (tx, mut rx) = completions();
        session.subscribe(ADDRESS, ENVIRONMENT, HUMIDITY, move |ok| tx.send(ok).unwrap());
        assert!(!only(&mut rx).await);
        assert!(session.subscriptions().is_empty().await);
    }

    #[tokio::test]
    async fn abandoned_operation_still_completes() {
        let fake = fake();
        let session = start(&fake).await;
        fake.stall(CallKind::ReadValue);

        let (tx, mut rx) = completions();
        let id = session.read_bytes(ADDRESS, ENVIRONMENT, TEMPERATURE, move |value| {
                            tx.send(value.map(|v| v.to_vec())).unwrap()
                        });
        session.shutdown().await;

        assert_eq!(only(&mut rx).await, None);
        assert!(!session.tasks.is_running(id));
    }

    #[tokio::test]
    async fn scan_forwards_advertisements_until_stopped() {
        let fake = fake();
        let session = start(&fake).await;
        session.cancellation().cancel();

        let (tx, mut rx) = completions();
        let (stopped_tx, mut stopped_rx) = completions();
        session.start_scan(Filter::new(),
                           move |advertisement| tx.send(advertisement.clone()).unwrap(),
                           move || stopped_tx.send(()).unwrap())
               .await
               .unwrap();
        assert!(!session.cancellation().is_cancelled());

        let again = session.start_scan(Filter::new(), |_| {}, || {}).await;
        assert!(again.is_err());

        assert!(fake.advertise(Advertisement {
                    address: DeviceAddress::new(ADDRESS),
                    rssi: -58,
                    tx_power: Some(4),
                    local_name: Some("Weather".to_string()),
                }));
        let record = rx.recv().await.unwrap();
        assert_eq!(record.address, DeviceAddress::new(ADDRESS));
        assert_eq!(record.tx_power, 4);
        assert_eq!(record.name.as_str(), "Weather");

        session.stop_scan().await.unwrap();
        only(&mut stopped_rx).await;
        assert!(session.stop_scan().await.is_err());
    }
}
