// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Driver: owns the device table and both schedulers, and routes transport
//! events back to the devices they concern.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::address::DeviceAddress;
use crate::device::Device;
use crate::events::{DriverEventEmitter, DriverListener, ListenerId};
use crate::feature::{DeviceFeature, QueryStatus};
use crate::message::Msg;
use crate::scheduler::{PollScheduler, RequestScheduler};
use crate::transport::{Transport, TransportEvent};

type DeviceMap = RwLock<HashMap<DeviceAddress, Arc<Device>>>;

pub struct Driver {
    devices: Arc<DeviceMap>,
    requests: RequestScheduler,
    poller: PollScheduler,
    emitter: Arc<RwLock<DriverEventEmitter>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Driver {
    pub fn new(min_poll_spacing: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            requests: RequestScheduler::new(),
            poller: PollScheduler::new(min_poll_spacing),
            emitter: Arc::new(RwLock::new(DriverEventEmitter::new())),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the request worker, the poll worker and the event dispatcher.
    pub fn start(
        &self,
        transport: Box<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut tasks = self.tasks.lock().expect("driver task mutex poisoned");
        tasks.push(self.requests.start(transport));
        tasks.push(self.poller.start());
        tasks.push(tokio::spawn(run_dispatcher(
            self.devices.clone(),
            self.emitter.clone(),
            events,
            self.shutdown_tx.subscribe(),
        )));
        info!("driver started");
    }

    /// Signal every task to exit and wait for them.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.poller.stop();
        self.requests.stop();
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("driver task mutex poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("driver task ended abnormally: {}", e);
            }
        }
        info!("driver stopped");
    }

    fn devices_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<DeviceAddress, Arc<Device>>> {
        self.devices.read().expect("device table lock poisoned")
    }

    /// Register a device, replacing any previous one at the same address.
    pub fn add_device(
        &self,
        address: DeviceAddress,
        features: Vec<DeviceFeature>,
        battery_powered: bool,
    ) -> Arc<Device> {
        let device = Arc::new(Device::new(
            address,
            features,
            battery_powered,
            self.requests.clone(),
        ));
        let previous = self
            .devices
            .write()
            .expect("device table lock poisoned")
            .insert(address, device.clone());
        if let Some(previous) = previous {
            debug!("replacing device {}", address);
            self.retire(&previous);
        }
        info!("added device {} with {} features", address, device.features().len());
        device
    }

    /// Stop polling a device and forget it.
    pub fn remove_device(&self, address: DeviceAddress) -> bool {
        let removed = self
            .devices
            .write()
            .expect("device table lock poisoned")
            .remove(&address);
        match removed {
            Some(device) => {
                self.retire(&device);
                info!("removed device {}", address);
                true
            }
            None => false,
        }
    }

    fn retire(&self, device: &Device) {
        self.poller.stop_polling(device.address());
        device.clear_queues();
        self.requests.unschedule(device.address());
    }

    pub fn device(&self, address: DeviceAddress) -> Option<Arc<Device>> {
        self.devices_read().get(&address).cloned()
    }

    pub fn device_count(&self) -> usize {
        self.devices_read().len()
    }

    /// Queue a message on behalf of a named feature.
    pub fn enqueue(&self, address: DeviceAddress, msg: Msg, feature: &str, delay: Duration) -> bool {
        let Some(device) = self.device(address) else {
            warn!("enqueue for unknown device {}", address);
            return false;
        };
        let Some(id) = device.feature_id(feature) else {
            warn!("{}: enqueue for unknown feature {}", address, feature);
            return false;
        };
        device.enqueue(msg, id, delay);
        true
    }

    pub fn trigger_poll(&self, address: DeviceAddress, delay: Duration) -> bool {
        match self.device(address) {
            Some(device) => {
                device.do_poll(delay);
                true
            }
            None => {
                warn!("poll for unknown device {}", address);
                false
            }
        }
    }

    pub fn start_polling(&self, address: DeviceAddress, interval: Duration) -> bool {
        let Some(device) = self.device(address) else {
            warn!("cannot poll unknown device {}", address);
            return false;
        };
        if !device.is_pollable() {
            debug!("{} is battery powered or has no features, not polling", address);
            return false;
        }
        let device_count = self.device_count();
        self.poller
            .start_polling(device, interval, device_count)
            .is_some()
    }

    /// Stop polling a device and drop everything it had queued.
    pub fn stop_polling(&self, address: DeviceAddress) -> bool {
        let was_polling = self.poller.stop_polling(address);
        if let Some(device) = self.device(address) {
            device.clear_queues();
        }
        self.requests.unschedule(address);
        was_polling
    }

    /// Hold all channel writes, e.g. while linking a device.
    pub fn pause(&self) {
        self.requests.pause();
    }

    pub fn resume(&self) {
        self.requests.resume();
    }

    pub fn poll_queue_size(&self) -> usize {
        self.poller.queue_size()
    }

    pub fn request_queue_size(&self) -> usize {
        self.requests.len()
    }

    pub fn query_status(&self, address: DeviceAddress, feature: &str) -> Option<QueryStatus> {
        let device = self.device(address)?;
        device.query_status(device.feature_id(feature)?)
    }

    pub fn feature_queried(&self, address: DeviceAddress) -> Option<String> {
        self.device(address)?.feature_queried().map(str::to_string)
    }

    pub fn register_listener(&self, listener: Arc<dyn DriverListener>) -> ListenerId {
        self.emitter
            .write()
            .expect("listener lock poisoned")
            .register(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) {
        self.emitter
            .write()
            .expect("listener lock poisoned")
            .unregister(id);
    }
}

async fn run_dispatcher(
    devices: Arc<DeviceMap>,
    emitter: Arc<RwLock<DriverEventEmitter>>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => dispatch_event(&devices, &emitter, event),
                None => {
                    debug!("transport event channel closed");
                    break;
                }
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn lookup(devices: &DeviceMap, address: DeviceAddress) -> Option<Arc<Device>> {
    devices
        .read()
        .expect("device table lock poisoned")
        .get(&address)
        .cloned()
}

fn dispatch_event(devices: &DeviceMap, emitter: &RwLock<DriverEventEmitter>, event: TransportEvent) {
    match event {
        TransportEvent::Sent { msg, at } => {
            if msg.is_broadcast() {
                trace!("broadcast sent: {}", msg);
                return;
            }
            match lookup(devices, msg.to) {
                Some(device) => device.on_sent(&msg, at),
                None => trace!("sent to unknown device: {}", msg),
            }
        }
        TransportEvent::Received(msg) => {
            let Some(device) = lookup(devices, msg.from) else {
                debug!("ignoring message from unknown device: {}", msg);
                return;
            };
            let incoming = device.handle_message(&msg, Instant::now());
            let emitter = emitter.read().expect("listener lock poisoned");
            if incoming.publish {
                emitter.notify_message_published(device.address(), &msg);
            }
            if let Some(feature) = incoming.answered.and_then(|id| device.feature(id)) {
                emitter.notify_query_answered(device.address(), feature.name());
            }
        }
        TransportEvent::Malformed(reason) => warn!("dropping malformed input: {}", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{AnswerHandler, PollHandler};
    use crate::message::MsgType;
    use crate::scheduler::MIN_POLL_SPACING;
    use crate::test_support::EchoTransport;

    const DIMMER: DeviceAddress = DeviceAddress::new(0x1a, 0x00, 0x01);
    const SENSOR: DeviceAddress = DeviceAddress::new(0x1a, 0x00, 0x02);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[derive(Default)]
    struct Recorder {
        answered: Mutex<Vec<String>>,
        published: Mutex<Vec<(DeviceAddress, u8)>>,
    }

    impl DriverListener for Recorder {
        fn on_message_published(&self, device: DeviceAddress, msg: &Msg) {
            self.published.lock().unwrap().push((device, msg.cmd1));
        }

        fn on_query_answered(&self, _device: DeviceAddress, feature: &str) {
            self.answered.lock().unwrap().push(feature.to_string());
        }
    }

    fn dimmer_features() -> Vec<DeviceFeature> {
        vec![
            DeviceFeature::new("dimmer", PollHandler::Status { cmd2: 0 }, AnswerHandler::Ack),
            DeviceFeature::new("ping", PollHandler::Ping, AnswerHandler::Ack).poll_once(),
        ]
    }

    fn started_driver() -> (Driver, mpsc::UnboundedSender<TransportEvent>) {
        let driver = Driver::new(MIN_POLL_SPACING);
        let (tx, rx) = mpsc::unbounded_channel();
        driver.start(Box::new(EchoTransport::new(tx.clone())), rx);
        (driver, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_cycle_reaches_answered() {
        let (driver, _tx) = started_driver();
        driver.add_device(DIMMER, dimmer_features(), false);
        let recorder = Arc::new(Recorder::default());
        driver.register_listener(recorder.clone());

        assert!(driver.trigger_poll(DIMMER, Duration::ZERO));
        assert_eq!(driver.query_status(DIMMER, "dimmer"), Some(QueryStatus::Scheduled));

        tokio::time::sleep(ms(5_000)).await;
        assert_eq!(driver.query_status(DIMMER, "dimmer"), Some(QueryStatus::Answered));
        assert_eq!(driver.query_status(DIMMER, "ping"), Some(QueryStatus::Answered));
        assert_eq!(driver.feature_queried(DIMMER), None);
        assert_eq!(*recorder.answered.lock().unwrap(), vec!["dimmer", "ping"]);
        assert_eq!(recorder.published.lock().unwrap().len(), 2);
        assert_eq!(driver.request_queue_size(), 0);

        driver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_broadcasts_published_once() {
        let (driver, tx) = started_driver();
        driver.add_device(SENSOR, Vec::new(), true);
        let recorder = Arc::new(Recorder::default());
        let id = driver.register_listener(recorder.clone());

        let mut bcast = Msg::group_broadcast(1, 0x11, 0x00);
        bcast.from = SENSOR;
        tx.send(TransportEvent::Received(bcast.clone())).unwrap();
        tx.send(TransportEvent::Received(bcast)).unwrap();
        tx.send(TransportEvent::Malformed("bad checksum".to_string()))
            .unwrap();
        let mut stranger = Msg::group_broadcast(1, 0x13, 0x00);
        stranger.from = DeviceAddress::new(0x99, 0x99, 0x99);
        tx.send(TransportEvent::Received(stranger)).unwrap();

        tokio::time::sleep(ms(100)).await;
        assert_eq!(*recorder.published.lock().unwrap(), vec![(SENSOR, 0x11)]);

        driver.unregister_listener(id);
        let mut next = Msg::group_broadcast(2, 0x11, 0x00);
        next.from = SENSOR;
        tx.send(TransportEvent::Received(next)).unwrap();
        tokio::time::sleep(ms(100)).await;
        assert_eq!(recorder.published.lock().unwrap().len(), 1);

        driver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_registration_and_stop() {
        let driver = Driver::new(MIN_POLL_SPACING);
        for n in 1..=3 {
            driver.add_device(DeviceAddress::new(0x30, 0x00, n), dimmer_features(), false);
        }
        for n in 1..=3 {
            assert!(driver.start_polling(DeviceAddress::new(0x30, 0x00, n), ms(60_000)));
        }
        assert_eq!(driver.poll_queue_size(), 3);
        assert!(!driver.start_polling(SENSOR, ms(60_000)));

        let first = DeviceAddress::new(0x30, 0x00, 1);
        let device = driver.device(first).unwrap();
        assert!(driver.enqueue(first, Msg::direct(first, 0x19, 0x00), "dimmer", ms(10_000)));
        assert!(!driver.enqueue(first, Msg::direct(first, 0x19, 0x00), "fan", ms(0)));
        assert_eq!(device.pending_requests(), 1);

        assert!(driver.stop_polling(first));
        assert_eq!(driver.poll_queue_size(), 2);
        assert_eq!(device.pending_requests(), 0);
        assert_eq!(driver.request_queue_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_devices_not_polled() {
        let driver = Driver::new(MIN_POLL_SPACING);
        driver.add_device(SENSOR, dimmer_features(), true);
        driver.add_device(DIMMER, Vec::new(), false);

        assert!(!driver.start_polling(SENSOR, ms(60_000)));
        assert!(!driver.start_polling(DIMMER, ms(60_000)));
        assert_eq!(driver.poll_queue_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_device() {
        let (driver, tx) = started_driver();
        driver.add_device(DIMMER, dimmer_features(), false);
        driver.start_polling(DIMMER, ms(60_000));
        driver.enqueue(DIMMER, Msg::direct(DIMMER, 0x19, 0x00), "dimmer", ms(5_000));
        assert_eq!(driver.device_count(), 1);

        assert!(driver.remove_device(DIMMER));
        assert!(!driver.remove_device(DIMMER));
        assert_eq!(driver.device_count(), 0);
        assert_eq!(driver.poll_queue_size(), 0);
        assert_eq!(driver.request_queue_size(), 0);
        assert!(!driver.trigger_poll(DIMMER, Duration::ZERO));

        // Replies for a forgotten device are dropped quietly.
        let ack = Msg::new(DIMMER, DeviceAddress::default(), MsgType::AckOfDirect, 0x19, 0, None);
        tx.send(TransportEvent::Received(ack)).unwrap();
        tokio::time::sleep(ms(100)).await;

        driver.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_writes() {
        let (driver, _tx) = started_driver();
        driver.add_device(DIMMER, dimmer_features(), false);
        driver.pause();
        driver.trigger_poll(DIMMER, Duration::ZERO);

        tokio::time::sleep(ms(3_000)).await;
        assert_eq!(driver.query_status(DIMMER, "dimmer"), Some(QueryStatus::Scheduled));
        assert_eq!(driver.request_queue_size(), 1);

        driver.resume();
        tokio::time::sleep(ms(3_000)).await;
        assert_eq!(driver.query_status(DIMMER, "dimmer"), Some(QueryStatus::Answered));

        driver.stop().await;
    }
}
