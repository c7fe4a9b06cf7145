pub mod presets {
    use strum::IntoEnumIterator as _;

    use crate::output;
    use crate::presets::Preset;

    /// List the selectable ventilation presets and their wire encoding.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct PresetRecord {
        name: String,
        mode_byte: u8,
        command_payload: String,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output()?;
        output.headers(&["Name", "Mode byte", "22F1 payload"])?;
        for preset in Preset::iter() {
            let payload = hex::encode_upper(preset.command_payload());
            output.row(
                || {
                    vec![
                        preset.to_string(),
                        format!("{:#04X}", preset.mode_byte()),
                        payload.clone(),
                    ]
                },
                || PresetRecord {
                    name: preset.to_string(),
                    mode_byte: preset.mode_byte(),
                    command_payload: payload.clone(),
                },
            )?;
        }
        Ok(output.commit()?)
    }
}

pub mod listen {
    use std::sync::Arc;

    use futures::StreamExt as _;
    use tokio_stream::wrappers::BroadcastStream;
    use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
    use tokio_util::task::AbortOnDropHandle;
    use tracing::{info, warn};

    use crate::gateway::{Callbacks, RamsesGateway};
    use crate::mqtt::MqttTransport;
    use crate::payloads::{Code, Payload};
    use crate::state::FanStateTracker;
    use crate::{gateway, mqtt, output};

    /// Listen for telegrams from the installation and stream the decoded
    /// reports.
    ///
    /// Table output renders once listening ends, so it is most useful
    /// together with `--count` or an interrupt.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        mqtt: mqtt::Args,

        #[clap(flatten)]
        gateway: gateway::Args,

        #[clap(flatten)]
        output: output::Args,

        /// Stop after this many decoded reports.
        #[arg(long, short = 'n')]
        count: Option<u64>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not build the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        Gateway(#[from] gateway::Error<mqtt::Error>),
        #[error(transparent)]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct ReportRecord<'a> {
        time: &'a str,
        code: Code,
        summary: String,
        report: &'a Payload,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        runtime.block_on(run_async(args))
    }

    async fn run_async(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output()?;
        output.headers(&["Time", "Code", "Report"])?;

        let (transport, mut inbound) = MqttTransport::connect(&args.mqtt);
        let (event_sender, event_receiver) = tokio::sync::broadcast::channel::<Payload>(1024);
        let tracker = Arc::new(FanStateTracker::new());
        let mut callbacks = Callbacks::new();
        let reported =
            [Code::Co2Level, Code::RelativeHumidity, Code::FanState, Code::VentDemand];
        for code in reported {
            let events = event_sender.clone();
            let tracker = Arc::clone(&tracker);
            callbacks.insert(
                code,
                Box::new(move |payload: Payload| {
                    tracker.record(&payload);
                    let _ = events.send(payload);
                }),
            );
        }
        drop(event_sender);

        let gateway = Arc::new(RamsesGateway::new(
            args.gateway.addresses(),
            args.gateway.topics(),
            transport,
            callbacks,
            args.gateway.setup_timeout(),
        ));
        let pump_gateway = Arc::clone(&gateway);
        let _pump = AbortOnDropHandle::new(tokio::task::spawn(async move {
            while let Some(message) = inbound.recv().await {
                pump_gateway.handle_message(&message.payload);
            }
        }));
        gateway.start().await?;

        let mut events = BroadcastStream::new(event_receiver);
        let mut seen = 0u64;
        while args.count.is_none_or(|count| seen < count) {
            let event = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    break;
                }
                event = events.next() => event,
            };
            let payload = match event {
                None => break,
                Some(Ok(payload)) => payload,
                Some(Err(BroadcastStreamRecvError::Lagged(count))) => {
                    warn!(count, "reports dropped while formatting output");
                    continue;
                }
            };
            seen += 1;
            let time = jiff::Timestamp::now().to_string();
            output.row(
                || vec![time.clone(), payload.code().to_string(), payload.to_string()],
                || ReportRecord {
                    time: &time,
                    code: payload.code(),
                    summary: payload.to_string(),
                    report: &payload,
                },
            )?;
        }

        gateway.stop().await?;
        info!(
            reports = seen,
            dropped_frames = gateway.dropped_frames(),
            state = ?tracker.snapshot(),
            "finished listening"
        );
        Ok(output.commit()?)
    }
}

pub mod set_mode {
    use std::sync::Arc;

    use tokio_util::task::AbortOnDropHandle;
    use tracing::info;

    use crate::gateway::{Callbacks, RamsesGateway};
    use crate::mqtt::MqttTransport;
    use crate::payloads::{Code, Payload};
    use crate::presets::Preset;
    use crate::{gateway, mqtt};

    /// Switch the ventilation unit to a preset mode.
    ///
    /// The command returns once it has been handed to the transport. Pass
    /// `--confirm` to also wait for the unit to report the new mode back.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        mqtt: mqtt::Args,

        #[clap(flatten)]
        gateway: gateway::Args,

        /// The preset to select; see the `presets` command for the catalog.
        preset: String,

        /// Wait this long for a fan-state report confirming the new mode.
        #[arg(long)]
        confirm: Option<humantime::Duration>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not build the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        Gateway(#[from] gateway::Error<mqtt::Error>),
        #[error("the unit did not report `{preset}` within {waited}")]
        NotConfirmed { preset: String, waited: humantime::Duration },
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        runtime.block_on(run_async(args))
    }

    async fn run_async(args: Args) -> Result<(), Error> {
        // Reject bogus names before we so much as connect.
        let requested = Preset::from_name(&args.preset)
            .map_err(|e| Error::Gateway(gateway::Error::UnknownPreset(e)))?;

        let (transport, mut inbound) = MqttTransport::connect(&args.mqtt);
        let (reports, mut fan_states) = tokio::sync::mpsc::unbounded_channel();
        let mut callbacks = Callbacks::new();
        callbacks.insert(
            Code::FanState,
            Box::new(move |payload: Payload| {
                if let Payload::FanState { preset, .. } = payload {
                    let _ = reports.send(preset);
                }
            }),
        );

        let gateway = Arc::new(RamsesGateway::new(
            args.gateway.addresses(),
            args.gateway.topics(),
            transport,
            callbacks,
            args.gateway.setup_timeout(),
        ));
        let pump_gateway = Arc::clone(&gateway);
        let _pump = AbortOnDropHandle::new(tokio::task::spawn(async move {
            while let Some(message) = inbound.recv().await {
                pump_gateway.handle_message(&message.payload);
            }
        }));
        gateway.start().await?;
        gateway.set_preset_mode(&args.preset).await?;

        if let Some(waited) = args.confirm {
            let confirmation = async {
                while let Some(reported) = fan_states.recv().await {
                    if reported == Some(requested) {
                        return true;
                    }
                }
                false
            };
            let confirmed =
                tokio::time::timeout(*waited, confirmation).await.unwrap_or(false);
            if !confirmed {
                gateway.stop().await?;
                return Err(Error::NotConfirmed { preset: args.preset, waited });
            }
            info!(preset = %requested, "the unit confirmed the new mode");
        }
        gateway.stop().await?;
        Ok(())
    }
}
