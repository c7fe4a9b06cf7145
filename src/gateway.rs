//! The stateful orchestrator binding addressing, transport, codec and
//! consumer callbacks.
//!
//! One gateway instance serves one RAMSES ESP installation. Inbound
//! telegrams arrive through [`RamsesGateway::handle_message`], get decoded
//! and routed by code to the callback registered for it; outbound preset
//! commands go out through [`RamsesGateway::set_preset_mode`]. The only
//! shared mutable state is a handful of atomics, so inbound dispatch may run
//! concurrently and commands never contend with it.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use crate::frame::{DeviceId, Frame, Verb};
use crate::mqtt::{Topics, Transport};
use crate::payloads::{self, Code, CommandIntent, Payload};
use crate::presets::{Preset, UnknownPreset};

#[derive(thiserror::Error, Debug)]
pub enum Error<E: std::error::Error + 'static> {
    #[error("could not subscribe to the receive topic")]
    Subscribe(#[source] E),
    #[error("could not release the receive subscription")]
    Unsubscribe(#[source] E),
    #[error("could not hand the command to the transport")]
    Publish(#[source] E),
    #[error(transparent)]
    UnknownPreset(#[from] UnknownPreset),
    #[error(transparent)]
    Encode(#[from] payloads::Error),
}

/// The four per-installation device addresses. Built once from
/// configuration, immutable afterwards; stamps outbound telegrams and
/// attributes inbound ones.
#[derive(Clone, Copy, Debug)]
pub struct DeviceAddressSet {
    pub gateway: DeviceId,
    pub remote: DeviceId,
    pub fan: DeviceId,
    pub co2_sensor: DeviceId,
}

impl DeviceAddressSet {
    pub fn contains(&self, id: DeviceId) -> bool {
        [self.gateway, self.remote, self.fan, self.co2_sensor].contains(&id)
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "gateway::Args")]
pub struct Args {
    /// Device address of the RAMSES ESP gateway, e.g. `18:013393`.
    #[arg(long)]
    gateway_id: DeviceId,

    /// Device address of the unit's paired remote. Preset commands are sent
    /// impersonating it.
    #[arg(long)]
    remote_id: DeviceId,

    /// Device address of the ventilation unit itself.
    #[arg(long)]
    fan_id: DeviceId,

    /// Device address of the CO2 sensor unit.
    #[arg(long)]
    co2_id: DeviceId,

    /// Topic prefix the RAMSES ESP publishes under.
    #[arg(long, default_value = "RAMSES/GATEWAY")]
    topic_base: String,

    /// How long to wait for the unit to answer the identification request
    /// sent at startup. Expiry is logged and the gateway stays up
    /// receive-capable.
    #[arg(long, default_value = "5s")]
    setup_timeout: humantime::Duration,
}

impl Args {
    pub fn addresses(&self) -> DeviceAddressSet {
        DeviceAddressSet {
            gateway: self.gateway_id,
            remote: self.remote_id,
            fan: self.fan_id,
            co2_sensor: self.co2_id,
        }
    }

    pub fn topics(&self) -> Topics {
        Topics::new(&self.topic_base, self.gateway_id)
    }

    pub fn setup_timeout(&self) -> Duration {
        *self.setup_timeout
    }
}

/// JSON envelope the RAMSES ESP wraps received telegrams in.
#[derive(serde::Deserialize, Debug)]
pub struct RxEnvelope {
    pub msg: String,
    #[serde(default)]
    pub ts: Option<String>,
}

#[derive(serde::Serialize)]
struct TxEnvelope {
    msg: String,
}

/// One-shot acknowledgement latch for the setup handshake.
#[derive(Default)]
struct SetupTracker {
    acked: AtomicBool,
    change_notify: Notify,
}

impl SetupTracker {
    fn mark_acked(&self) {
        if !self.acked.swap(true, Ordering::Release) {
            self.change_notify.notify_waiters();
        }
    }

    async fn acknowledged(&self) {
        loop {
            let notified = self.change_notify.notified();
            tokio::pin!(notified);
            // Register with the notifier before checking the flag so an
            // acknowledgement arriving in between cannot be missed.
            notified.as_mut().enable();
            if self.acked.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

pub type Callback = Box<dyn Fn(Payload) + Send + Sync>;
pub type Callbacks = BTreeMap<Code, Callback>;

pub struct RamsesGateway<T: Transport> {
    addresses: DeviceAddressSet,
    topics: Topics,
    transport: T,
    callbacks: Callbacks,
    setup_timeout: Duration,
    started: AtomicBool,
    dropped_frames: AtomicU64,
    setup: SetupTracker,
}

impl<T: Transport> RamsesGateway<T> {
    pub fn new(
        addresses: DeviceAddressSet,
        topics: Topics,
        transport: T,
        callbacks: Callbacks,
        setup_timeout: Duration,
    ) -> Self {
        Self {
            addresses,
            topics,
            transport,
            callbacks,
            setup_timeout,
            started: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
            setup: SetupTracker::default(),
        }
    }

    /// Subscribe to the receive topic and run the one-time setup handshake.
    ///
    /// Idempotent: a second call is a no-op. The handshake is best-effort;
    /// when the unit does not answer within the configured timeout the
    /// gateway stays up and keeps receiving. Only subscription and publish
    /// failures surface to the caller.
    pub async fn start(&self) -> Result<(), Error<T::Error>> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("gateway already started");
            return Ok(());
        }
        if let Err(e) = self.transport.subscribe(&self.topics.rx).await {
            self.started.store(false, Ordering::SeqCst);
            return Err(Error::Subscribe(e));
        }
        info!(topic = self.topics.rx.as_str(), "listening for telegrams");
        let frame =
            payloads::encode_command(Code::DeviceInfo, CommandIntent::Identify, &self.addresses)?;
        self.publish_frame(&frame).await?;
        match tokio::time::timeout(self.setup_timeout, self.setup.acknowledged()).await {
            Ok(()) => debug!("setup handshake acknowledged"),
            Err(_) => warn!(
                timeout = %humantime::Duration::from(self.setup_timeout),
                "setup handshake was not acknowledged, continuing receive-only"
            ),
        }
        Ok(())
    }

    /// Release the transport subscription. Safe to call from any state.
    pub async fn stop(&self) -> Result<(), Error<T::Error>> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.transport.unsubscribe(&self.topics.rx).await.map_err(Error::Unsubscribe)
    }

    /// Look the preset up, encode the command and hand it to the transport.
    ///
    /// Fire-and-forget: success means the command was handed to the
    /// transport, not that the unit changed state. Confirmation, if any,
    /// arrives asynchronously as a later fan-state report.
    pub async fn set_preset_mode(&self, name: &str) -> Result<(), Error<T::Error>> {
        let preset = Preset::from_name(name)?;
        let frame = payloads::encode_command(
            Code::FanMode,
            CommandIntent::SetPreset(preset),
            &self.addresses,
        )?;
        self.publish_frame(&frame).await?;
        info!(preset = %preset, "preset command sent");
        Ok(())
    }

    /// Telegrams dropped because they failed envelope or payload decoding.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    async fn publish_frame(&self, frame: &Frame) -> Result<(), Error<T::Error>> {
        let envelope = TxEnvelope { msg: frame.to_string() };
        debug!(frame = envelope.msg.as_str(), "transmitting");
        let payload = serde_json::to_vec(&envelope).unwrap();
        self.transport.publish(&self.topics.tx, payload).await.map_err(Error::Publish)
    }

    /// Decode one message from the receive topic and dispatch it.
    ///
    /// Invoked by the composition root for every inbound message; safe to
    /// call concurrently. Never returns an error: garbled input lands in the
    /// dropped-frame counter and callback failures are isolated per frame so
    /// one bad handler cannot take the subscription down.
    pub fn handle_message(&self, raw: &[u8]) {
        let envelope = match serde_json::from_slice::<RxEnvelope>(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                debug!(
                    message = "undecodable envelope",
                    error = (&e as &dyn std::error::Error)
                );
                return;
            }
        };
        let frame = match Frame::parse(&envelope.msg) {
            Ok(frame) => frame,
            Err(e) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                debug!(
                    message = "undecodable telegram",
                    telegram = envelope.msg.as_str(),
                    error = (&e as &dyn std::error::Error)
                );
                return;
            }
        };
        let Some(src) = frame.src() else {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            debug!(telegram = envelope.msg.as_str(), "telegram without a source address");
            return;
        };
        if !self.addresses.contains(src) {
            // The ESP relays everything it hears, neighbours included.
            trace!(src = %src, "telegram from a foreign device");
            return;
        }
        let Some(code) = Code::from_raw(frame.code) else {
            trace!(code = %format_args!("{:04X}", frame.code), "code not understood");
            return;
        };
        if !matches!(frame.verb, Verb::Inform | Verb::Reply) {
            // Requests and writes on the air include our own transmissions
            // echoed back by the ESP.
            trace!(verb = %frame.verb, %code, "not a report");
            return;
        }
        let payload = match payloads::decode(code, &frame.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                debug!(
                    message = "undecodable payload",
                    telegram = envelope.msg.as_str(),
                    error = (&e as &dyn std::error::Error)
                );
                return;
            }
        };
        if let Payload::DeviceInfo { description } = &payload {
            if src == self.addresses.fan {
                info!(device = description.as_str(), "ventilation unit identified");
                self.setup.mark_acked();
            }
        }
        let Some(callback) = self.callbacks.get(&code) else {
            trace!(%code, "no callback registered");
            return;
        };
        trace!(%code, %payload, "dispatching");
        if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
            error!(%code, "callback panicked; continuing with the next telegram");
        }
    }
}
