use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{self, Instant};
use tracing::*;

use crate::device::controller::DeviceController;
use crate::error::Result;
use crate::messages::{AcquisitionCommand, AcquisitionMessage, AcquisitionPlan, StopReason};
use crate::protocol::stream::StreamDirection;

/// Configure the module, stream portions into `sink` until told to stop and
/// leave the module idle again.
///
/// The device is handed back once the module is stopped and the data
/// connection has been reset, whatever the outcome of the run.
///
/// Send [`AcquisitionCommand::Stop`] or drop the command sender to end the
/// run; both interrupt a portion that is still being read. Aborting the task
/// instead skips the stop sequence and leaves the module streaming.
pub async fn run_acquisition(
    mut device: DeviceController,
    plan: AcquisitionPlan,
    mut commands: mpsc::Receiver<AcquisitionCommand>,
    sink: mpsc::Sender<AcquisitionMessage>,
) -> DeviceController {
    let outcome = match start(&mut device, &plan).await {
        Ok(()) => stream_portions(&mut device, &plan, &mut commands, &sink).await,
        Err(err) => Err(err),
    };

    // Stop the module before telling anyone, a restarted run must find it idle
    match device.terminate().await {
        Ok(code) if !code.is_ok() => warn!("terminating acquisition: device code {code}"),
        Ok(_) => {}
        Err(err) => error!("terminating acquisition: {err}"),
    }
    match device.reset_data_socket().await {
        Ok(code) if !code.is_ok() => warn!("resetting data socket: device code {code}"),
        Ok(_) => {}
        Err(err) => error!("resetting data socket: {err}"),
    }

    let message = match outcome {
        Ok((reason, portions)) => {
            info!("acquisition stopped ({reason:?}) after {portions} portions");
            AcquisitionMessage::Stopped { reason, portions }
        }
        Err(err) => {
            error!("acquisition failed: {err}");
            AcquisitionMessage::Failed(err.to_string())
        }
    };
    // The consumer may be gone already
    let _ = sink.send(message).await;

    device
}

async fn start(device: &mut DeviceController, plan: &AcquisitionPlan) -> Result<()> {
    device.write_channel_table(&plan.channels).await?.into_result()?;
    device
        .set_adc_frequency_divider(plan.adc_frequency_divider)
        .await?
        .into_result()?;
    if let Some(divider) = plan.digital_frequency_divider {
        device
            .set_digital_frequency_divider(divider)
            .await?
            .into_result()?;
    }

    for (line, &on) in plan.digital_lines.iter().enumerate() {
        device.write_digital(line, on).await?.into_result()?;
    }

    device.enable_in_stream(true, false).await?.into_result()?;
    device
        .start_data_stream(StreamDirection::Input)
        .await?
        .into_result()?;
    device.preload_adc().await?.into_result()?;
    device.set_sync_io(true).await?.into_result()?;

    info!(
        "acquisition started: {} channels, {} samples per portion",
        plan.channels.len(),
        plan.portion_size
    );
    Ok(())
}

async fn stream_portions(
    device: &mut DeviceController,
    plan: &AcquisitionPlan,
    commands: &mut mpsc::Receiver<AcquisitionCommand>,
    sink: &mpsc::Sender<AcquisitionMessage>,
) -> Result<(StopReason, usize)> {
    let deadline = plan.duration.map(|duration| Instant::now() + duration);
    let mut deferred = Vec::new();
    let mut portions = 0;

    loop {
        // Output commands only touch the control connection between portions
        for command in deferred.drain(..) {
            apply(device, command).await?;
        }
        loop {
            match commands.try_recv() {
                Ok(AcquisitionCommand::Stop) => return Ok((StopReason::Requested, portions)),
                Ok(command) => apply(device, command).await?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Ok((StopReason::CommandsClosed, portions)),
            }
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Ok((StopReason::DurationElapsed, portions));
        }

        // Stopping may abandon a half-read portion, the exit path resets the
        // data connection before the next run.
        let samples = {
            let read = device.read_portion(plan.portion_size);
            tokio::pin!(read);
            loop {
                tokio::select! {
                    samples = &mut read => break samples?,
                    command = commands.recv() => match command {
                        Some(AcquisitionCommand::Stop) => {
                            return Ok((StopReason::Requested, portions));
                        }
                        Some(command) => deferred.push(command),
                        None => return Ok((StopReason::CommandsClosed, portions)),
                    },
                    _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        return Ok((StopReason::DurationElapsed, portions));
                    }
                }
            }
        };

        trace!("portion {portions}: {:?}", samples.dim());
        if sink.send(AcquisitionMessage::Samples(samples)).await.is_err() {
            return Ok((StopReason::SinkClosed, portions));
        }
        portions += 1;
    }
}

/// Device codes from output commands are logged, only transport errors end the run
async fn apply(device: &mut DeviceController, command: AcquisitionCommand) -> Result<()> {
    let code = match command {
        AcquisitionCommand::WriteDigital { line, on } => device.write_digital(line, on).await,
        AcquisitionCommand::WriteAnalog { channel, voltage } => {
            device.write_analog(channel, voltage).await
        }
        AcquisitionCommand::Stop => return Ok(()),
    };

    match code {
        Ok(code) if !code.is_ok() => {
            warn!("{command:?} rejected by the module with code {code}");
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(err) if err.is_transport() => Err(err),
        Err(err) => {
            warn!("ignoring {command:?}: {err}");
            Ok(())
        }
    }
}
