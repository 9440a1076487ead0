use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task;
use tokio::time::Duration;
use tracing::*;
use tracing_subscriber::FmtSubscriber;

use e502_link::acquisition::run_acquisition;
use e502_link::device::{ChannelMode, ChannelSettings, VoltageRange};
use e502_link::messages::{AcquisitionMessage, AcquisitionPlan};
use e502_link::{DeviceConfig, DeviceController};

/// Samples per channel in each portion
const PORTION_SIZE: i64 = 100;
const RUN_DURATION: Duration = Duration::from_secs(2);

/// Acquire a short burst from the module at the address given as the first
/// argument, or from the simulated module when none is given
#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default tracing subscriber failed")?;

    let config = match std::env::args().nth(1) {
        Some(address) => DeviceConfig::tcp(address),
        None => DeviceConfig::sim(),
    };

    let mut device = DeviceController::connect(&config)
        .await
        .with_context(|| format!("unable to connect to E-502 at {}", config.address))?;

    let (hardware, code) = device.hardware().await?;
    code.into_result().context("reading hardware info")?;
    info!("Connected to {hardware}");

    let channels = (0..2)
        .map(|channel| {
            ChannelSettings::with(
                VoltageRange::Bipolar10V,
                channel,
                ChannelMode::CommonGroundLow,
                1,
            )
        })
        .collect::<e502_link::Result<Vec<_>>>()?;
    let mut plan = AcquisitionPlan::new(channels, PORTION_SIZE);
    plan.duration = Some(RUN_DURATION);

    let (_command_sender, command_receiver) = mpsc::channel(16);
    let (sample_sender, mut sample_receiver) = mpsc::channel(100);

    // Delegate all device communication to a separate tokio task
    let handle = task::spawn(run_acquisition(
        device,
        plan,
        command_receiver,
        sample_sender,
    ));

    while let Some(message) = sample_receiver.recv().await {
        match message {
            AcquisitionMessage::Samples(samples) => {
                let means = samples.mean_axis(ndarray::Axis(0));
                info!("portion of {} samples, channel means {:?}", samples.nrows(), means);
            }
            AcquisitionMessage::Stopped { reason, portions } => {
                info!("stopped ({reason:?}) after {portions} portions");
                break;
            }
            AcquisitionMessage::Failed(reason) => {
                error!("acquisition failed: {reason}");
                break;
            }
        }
    }

    handle.await?;
    Ok(())
}
