use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use orcon_mvs_tools::gateway::{Callbacks, DeviceAddressSet, Error, RamsesGateway};
use orcon_mvs_tools::mqtt::{Topics, Transport};
use orcon_mvs_tools::payloads::{Code, Payload};
use orcon_mvs_tools::presets::Preset;

#[derive(Debug, thiserror::Error)]
#[error("fake transport failure")]
struct FakeError;

#[derive(Default)]
struct FakeTransport {
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeTransport {
    fn publishes(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

impl Transport for FakeTransport {
    type Error = FakeError;

    async fn subscribe(&self, _topic: &str) -> Result<(), FakeError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unsubscribe(&self, _topic: &str) -> Result<(), FakeError> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), FakeError> {
        self.published.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }
}

fn addresses() -> DeviceAddressSet {
    DeviceAddressSet {
        gateway: "18:013393".parse().unwrap(),
        remote: "29:162275".parse().unwrap(),
        fan: "32:155617".parse().unwrap(),
        co2_sensor: "37:168270".parse().unwrap(),
    }
}

fn topics() -> Topics {
    Topics::new("RAMSES/GATEWAY", "18:013393".parse().unwrap())
}

fn gateway(
    callbacks: Callbacks,
) -> (Arc<FakeTransport>, RamsesGateway<Arc<FakeTransport>>) {
    let transport = Arc::new(FakeTransport::default());
    let gateway = RamsesGateway::new(
        addresses(),
        topics(),
        Arc::clone(&transport),
        callbacks,
        Duration::from_millis(1),
    );
    (transport, gateway)
}

fn rx_message(frame: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "msg": frame })).unwrap()
}

const CO2_FRAME: &str = "045  I --- 37:168270 32:155617 --:------ 1298 003 000316";
const FAN_STATE_FRAME: &str = "069  I --- 32:155617 --:------ 32:155617 31D9 003 000001";

#[tokio::test]
async fn start_is_idempotent() {
    let (transport, gateway) = gateway(Callbacks::new());
    gateway.start().await.unwrap();
    gateway.start().await.unwrap();
    assert_eq!(transport.subscribes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stop_releases_the_subscription_once() {
    let (transport, gateway) = gateway(Callbacks::new());
    gateway.stop().await.unwrap();
    assert_eq!(transport.unsubscribes.load(Ordering::SeqCst), 0);
    gateway.start().await.unwrap();
    gateway.stop().await.unwrap();
    gateway.stop().await.unwrap();
    assert_eq!(transport.unsubscribes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn start_returns_promptly_once_the_unit_identified_itself() {
    let transport = Arc::new(FakeTransport::default());
    let gateway = RamsesGateway::new(
        addresses(),
        topics(),
        Arc::clone(&transport),
        Callbacks::new(),
        Duration::from_secs(60),
    );
    let device_info = format!(
        "RP --- 32:155617 18:013393 --:------ 10E0 025 {}{}",
        "00".repeat(19),
        hex::encode_upper(b"MVS-15"),
    );
    gateway.handle_message(&rx_message(&device_info));
    let started = tokio::time::timeout(Duration::from_secs(5), gateway.start()).await;
    started.expect("start must not wait out the full handshake timeout").unwrap();
}

#[tokio::test]
async fn unknown_preset_is_rejected_without_touching_the_transport() {
    let (transport, gateway) = gateway(Callbacks::new());
    let result = gateway.set_preset_mode("NotARealPreset").await;
    assert!(matches!(result, Err(Error::UnknownPreset(_))));
    assert_eq!(transport.publishes(), 0);
}

#[tokio::test]
async fn preset_command_round_trips_through_the_wire_format() {
    let (transport, sender) = gateway(Callbacks::new());
    sender.set_preset_mode("Low").await.unwrap();
    let (topic, published) = transport.published.lock().unwrap().pop().unwrap();
    assert_eq!(topic, topics().tx);

    let decoded = Arc::new(Mutex::new(Vec::new()));
    let mut callbacks = Callbacks::new();
    let sink = Arc::clone(&decoded);
    callbacks.insert(
        Code::FanMode,
        Box::new(move |payload| sink.lock().unwrap().push(payload)),
    );
    let (_, receiver) = gateway(callbacks);
    // The tx envelope and the rx envelope share the `msg` shape.
    receiver.handle_message(&published);
    assert_eq!(
        decoded.lock().unwrap().as_slice(),
        [Payload::FanMode { preset: Some(Preset::Low) }],
    );
    assert_eq!(receiver.dropped_frames(), 0);
}

#[tokio::test]
async fn panicking_callback_does_not_suppress_later_dispatch() {
    let fired = Arc::new(AtomicUsize::new(0));
    let mut callbacks = Callbacks::new();
    callbacks.insert(
        Code::FanState,
        Box::new(|_| panic!("this callback is broken")),
    );
    let sink = Arc::clone(&fired);
    callbacks.insert(
        Code::Co2Level,
        Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let (_, gateway) = gateway(callbacks);
    gateway.handle_message(&rx_message(FAN_STATE_FRAME));
    gateway.handle_message(&rx_message(CO2_FRAME));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.dropped_frames(), 0);
}

#[test]
fn concurrent_dispatch_is_consistent() {
    let dispatched = Arc::new(AtomicUsize::new(0));
    let mut callbacks = Callbacks::new();
    let sink = Arc::clone(&dispatched);
    callbacks.insert(
        Code::Co2Level,
        Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let (_, gateway) = gateway(callbacks);
    let good = rx_message(CO2_FRAME);
    let garbled = b"not an envelope at all".to_vec();
    std::thread::scope(|scope| {
        for _ in 0..10 {
            scope.spawn(|| {
                for round in 0..10 {
                    if round % 2 == 0 {
                        gateway.handle_message(&good);
                    } else {
                        gateway.handle_message(&garbled);
                    }
                }
            });
        }
    });
    assert_eq!(dispatched.load(Ordering::SeqCst), 50);
    assert_eq!(gateway.dropped_frames(), 50);
}

#[test]
fn frames_without_a_registered_callback_are_not_an_error() {
    let (_, gateway) = gateway(Callbacks::new());
    gateway.handle_message(&rx_message(CO2_FRAME));
    assert_eq!(gateway.dropped_frames(), 0);
}

#[test]
fn foreign_and_unknown_telegrams_are_ignored() {
    let fired = Arc::new(AtomicUsize::new(0));
    let mut callbacks = Callbacks::new();
    let sink = Arc::clone(&fired);
    callbacks.insert(
        Code::Co2Level,
        Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let (_, gateway) = gateway(callbacks);
    // A neighbour's sensor: valid telegram, unknown device.
    gateway.handle_message(&rx_message(
        "045  I --- 37:000001 32:000002 --:------ 1298 003 000316",
    ));
    // A code this crate does not understand.
    gateway.handle_message(&rx_message(
        "045  I --- 32:155617 --:------ 32:155617 4E0D 002 0102",
    ));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(gateway.dropped_frames(), 0);
}
