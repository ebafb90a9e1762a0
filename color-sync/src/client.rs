use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::{
    io::{self, AsyncWriteExt},
    select,
    time::timeout,
};
use tracing::{info, warn};

use crate::{
    channel::{Channel, ChannelConfig, ChannelStatus, Subscription},
    cli::{SetArgs, WatchArgs},
    color::ColorState,
};

const SET_TIMEOUT: Duration = Duration::from_secs(10);

/// Prints every color the hub publishes until ctrl-c.
pub async fn watch(args: WatchArgs) -> Result<()> {
    let config = ChannelConfig::new(args.endpoint)
        .with_reconnect(true)
        .with_reconnect_interval(Duration::from_millis(args.reconnect_interval_ms));
    let channel = Channel::new(config);
    let mut subscription = channel.subscribe();
    channel.connect()?;

    loop {
        select! {
            color = subscription.recv_color() => match color {
                Some(color) => write_stdout(&color.to_string()).await?,
                None => break,
            },
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    channel.close();
    Ok(())
}

/// Sends one update and waits until the hub echoes the resulting state.
pub async fn set(args: SetArgs) -> Result<()> {
    let channel = Channel::new(ChannelConfig::new(args.endpoint.clone()));
    let mut subscription = channel.subscribe();
    channel.connect()?;

    let result = timeout(SET_TIMEOUT, request_color(&channel, &mut subscription, &args))
        .await
        .map_err(|_| anyhow!("timed out waiting for {} to confirm", args.endpoint))
        .and_then(|confirmed| confirmed);
    channel.close();

    let color = result?;
    write_stdout(&color.to_string()).await?;
    Ok(())
}

async fn request_color(
    channel: &Channel,
    subscription: &mut Subscription,
    args: &SetArgs,
) -> Result<ColorState> {
    let mut status = channel.watch_status();
    let settled = *status
        .wait_for(|status| *status != ChannelStatus::Connecting)
        .await
        .context("channel stopped before connecting")?;
    if settled != ChannelStatus::Connected {
        bail!("could not connect to {} ({settled})", args.endpoint);
    }

    let snapshot = subscription
        .recv_color()
        .await
        .context("hub closed before sending a snapshot")?;
    info!(%snapshot, "current color");

    channel.send(args.color.encode())?;

    loop {
        let color = subscription
            .recv_color()
            .await
            .context("hub closed before confirming the update")?;
        if (color.red, color.green, color.blue) == (args.color.red, args.color.green, args.color.blue)
        {
            return Ok(color);
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
