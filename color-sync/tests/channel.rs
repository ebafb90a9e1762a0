use std::time::Duration;

use anyhow::{Result, anyhow};
use color_sync::{
    channel::{Channel, ChannelConfig, ChannelError, ChannelStatus},
    color::ColorState,
    hub::{Endpoint, EndpointListener, Hub, HubConfig},
};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpListener,
    select,
    sync::{mpsc, oneshot, watch},
    time::{Instant, sleep, timeout},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(3);
const RECONNECT_INTERVAL: Duration = Duration::from_millis(200);

/// Accepts connections one at a time; each gets `snapshot`, then is dropped
/// once the test signals through the returned sender. Inbound frames are
/// read meanwhile, which also answers pings.
async fn scripted_server(
    snapshots: Vec<&'static str>,
) -> Result<(String, mpsc::UnboundedSender<()>, mpsc::UnboundedReceiver<usize>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);
    let (drop_tx, mut drop_rx) = mpsc::unbounded_channel::<()>();
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel::<usize>();

    tokio::spawn(async move {
        for (index, snapshot) in snapshots.into_iter().enumerate() {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut socket) = accept_async(stream).await else {
                return;
            };
            let _ = accepted_tx.send(index);
            let _ = socket.send(Message::Text(snapshot.to_string())).await;
            let mut reading = true;
            loop {
                select! {
                    signal = drop_rx.recv() => {
                        if signal.is_none() {
                            return;
                        }
                        break;
                    }
                    frame = socket.next(), if reading => {
                        reading = matches!(frame, Some(Ok(_)));
                    }
                }
            }
            drop(socket);
        }
        // Keep the listener open so late reconnects are observable.
        while let Ok((_stream, _)) = listener.accept().await {
            let _ = accepted_tx.send(usize::MAX);
        }
    });

    Ok((url, drop_tx, accepted_rx))
}

/// Completes handshakes and sends `snapshot`, then never reads again.
async fn silent_server(snapshot: &'static str) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(mut socket) = accept_async(stream).await else {
                continue;
            };
            let _ = socket.send(Message::Text(snapshot.to_string())).await;
            held.push(socket);
        }
    });

    Ok(url)
}

async fn wait_for_status(
    status: &mut watch::Receiver<ChannelStatus>,
    expected: ChannelStatus,
) -> Result<()> {
    timeout(WAIT, status.wait_for(|status| *status == expected))
        .await
        .map_err(|_| anyhow!("timed out waiting for {expected}"))??;
    Ok(())
}

#[tokio::test]
async fn reconnects_after_forced_close_and_keeps_the_same_stream() -> Result<()> {
    let (url, drop_tx, mut accepted) =
        scripted_server(vec!["\"1,2,3,0.1\"", "\"4,5,6,0.1\""]).await?;
    let channel = Channel::new(ChannelConfig::new(url).with_reconnect_interval(RECONNECT_INTERVAL));
    let mut subscription = channel.subscribe();
    let mut status = channel.watch_status();

    channel.connect()?;
    assert_eq!(timeout(WAIT, subscription.recv()).await?.as_deref(), Some("\"1,2,3,0.1\""));
    assert_eq!(channel.status(), ChannelStatus::Connected);

    let dropped_at = Instant::now();
    drop_tx.send(())?;
    wait_for_status(&mut status, ChannelStatus::Reconnecting).await?;
    assert!(matches!(channel.send("7,8,9"), Err(ChannelError::NotConnected)));

    assert_eq!(timeout(WAIT, subscription.recv()).await?.as_deref(), Some("\"4,5,6,0.1\""));
    assert_eq!(channel.status(), ChannelStatus::Connected);
    assert!(dropped_at.elapsed() >= RECONNECT_INTERVAL);
    assert_eq!(timeout(WAIT, accepted.recv()).await?, Some(0));
    assert_eq!(timeout(WAIT, accepted.recv()).await?, Some(1));

    channel.close();
    assert_eq!(timeout(WAIT, subscription.recv()).await?, None);
    Ok(())
}

#[tokio::test]
async fn close_during_reconnect_delay_cancels_the_retry() -> Result<()> {
    let (url, drop_tx, mut accepted) = scripted_server(vec!["\"1,2,3,0.1\""]).await?;
    let channel = Channel::new(ChannelConfig::new(url).with_reconnect_interval(RECONNECT_INTERVAL));
    let mut subscription = channel.subscribe();
    let mut status = channel.watch_status();

    channel.connect()?;
    timeout(WAIT, subscription.recv()).await?;
    assert_eq!(timeout(WAIT, accepted.recv()).await?, Some(0));

    drop_tx.send(())?;
    wait_for_status(&mut status, ChannelStatus::Reconnecting).await?;
    channel.close();

    sleep(RECONNECT_INTERVAL * 3).await;
    assert!(accepted.try_recv().is_err(), "no reconnect after close");
    assert_eq!(channel.status(), ChannelStatus::Closed);
    assert_eq!(timeout(WAIT, subscription.recv()).await?, None);
    Ok(())
}

#[tokio::test]
async fn channel_round_trips_updates_through_a_hub() -> Result<()> {
    let secure = EndpointListener::new(Endpoint::Secure, TcpListener::bind("127.0.0.1:0").await?);
    let plain = EndpointListener::new(Endpoint::Plain, TcpListener::bind("127.0.0.1:0").await?);
    let hub = Hub::new(secure, plain, HubConfig::default());
    let secure_url = format!("ws://{}", hub.secure_addr()?);
    let plain_url = format!("ws://{}", hub.plain_addr()?);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(hub.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    let publisher = Channel::new(ChannelConfig::new(secure_url));
    let follower = Channel::new(ChannelConfig::new(plain_url));
    let mut published = publisher.subscribe();
    let mut followed = follower.subscribe();
    let mut publisher_status = publisher.watch_status();

    publisher.connect()?;
    follower.connect()?;
    assert_eq!(
        timeout(WAIT, followed.recv_color()).await?,
        Some(ColorState::default())
    );
    wait_for_status(&mut publisher_status, ChannelStatus::Connected).await?;
    assert_eq!(
        timeout(WAIT, published.recv_color()).await?,
        Some(ColorState::default())
    );

    publisher.send("\"10,20,30\"")?;

    let expected = Some(ColorState::new(10, 20, 30, 0.1));
    assert_eq!(timeout(WAIT, followed.recv_color()).await?, expected);
    assert_eq!(timeout(WAIT, published.recv_color()).await?, expected);

    publisher.close();
    follower.close();
    let _ = shutdown_tx.send(());
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn connect_is_inert_while_connected() -> Result<()> {
    let (url, _drop_tx, mut accepted) = scripted_server(vec!["\"1,2,3,0.1\""]).await?;
    let channel = Channel::new(ChannelConfig::new(url));
    let mut status = channel.watch_status();

    channel.connect()?;
    channel.connect()?;
    wait_for_status(&mut status, ChannelStatus::Connected).await?;
    channel.connect()?;

    assert_eq!(timeout(WAIT, accepted.recv()).await?, Some(0));
    sleep(Duration::from_millis(100)).await;
    assert!(accepted.try_recv().is_err(), "only one transport is opened");

    channel.close();
    Ok(())
}

#[tokio::test]
async fn keepalive_pings_keep_the_stream_flowing() -> Result<()> {
    let (url, _drop_tx, mut accepted) = scripted_server(vec!["\"1,2,3,0.1\""]).await?;
    let channel =
        Channel::new(ChannelConfig::new(url).with_keepalive(Duration::from_millis(50)));
    let stream = channel.subscribe().into_stream();
    tokio::pin!(stream);

    channel.connect()?;
    assert_eq!(timeout(WAIT, stream.next()).await?.as_deref(), Some("\"1,2,3,0.1\""));
    sleep(Duration::from_millis(300)).await;
    assert_eq!(channel.status(), ChannelStatus::Connected);
    assert_eq!(accepted.try_recv()?, 0);
    assert!(accepted.try_recv().is_err(), "answered pings keep the transport");

    channel.close();
    assert_eq!(timeout(WAIT, stream.next()).await?, None);
    Ok(())
}

#[tokio::test]
async fn unanswered_pings_drop_the_transport() -> Result<()> {
    let url = silent_server("\"1,2,3,0.1\"").await?;
    let channel = Channel::new(
        ChannelConfig::new(url)
            .with_keepalive(Duration::from_millis(50))
            .with_reconnect_interval(Duration::from_secs(10)),
    );
    let mut subscription = channel.subscribe();
    let mut status = channel.watch_status();

    channel.connect()?;
    assert_eq!(timeout(WAIT, subscription.recv()).await?.as_deref(), Some("\"1,2,3,0.1\""));
    wait_for_status(&mut status, ChannelStatus::Reconnecting).await?;

    channel.close();
    assert_eq!(timeout(WAIT, subscription.recv()).await?, None);
    Ok(())
}

#[tokio::test]
async fn close_ends_the_stream_while_the_peer_stops_reading() -> Result<()> {
    let url = silent_server("\"1,2,3,0.1\"").await?;
    let channel = Channel::new(ChannelConfig::new(url));
    let mut subscription = channel.subscribe();

    channel.connect()?;
    assert_eq!(timeout(WAIT, subscription.recv()).await?.as_deref(), Some("\"1,2,3,0.1\""));

    // Far more than the socket buffers hold, so the session blocks mid-write.
    let payload = "0".repeat(64 * 1024);
    for _ in 0..400 {
        channel.send(payload.clone())?;
    }
    sleep(Duration::from_millis(200)).await;

    channel.close();
    assert_eq!(timeout(WAIT, subscription.recv()).await?, None);
    assert_eq!(channel.status(), ChannelStatus::Closed);
    Ok(())
}

#[tokio::test]
async fn connect_while_reconnecting_skips_only_the_pending_delay() -> Result<()> {
    let long_interval = Duration::from_secs(10);
    let (url, drop_tx, mut accepted) =
        scripted_server(vec!["\"1,2,3,0.1\"", "\"4,5,6,0.1\"", "\"7,8,9,0.1\""]).await?;
    let channel = Channel::new(ChannelConfig::new(url).with_reconnect_interval(long_interval));
    let mut subscription = channel.subscribe();
    let mut status = channel.watch_status();

    channel.connect()?;
    assert_eq!(timeout(WAIT, subscription.recv()).await?.as_deref(), Some("\"1,2,3,0.1\""));
    assert_eq!(timeout(WAIT, accepted.recv()).await?, Some(0));

    drop_tx.send(())?;
    wait_for_status(&mut status, ChannelStatus::Reconnecting).await?;
    let skipped_at = Instant::now();
    // A repeated call must not leave a wakeup behind for a later delay.
    channel.connect()?;
    channel.connect()?;

    assert_eq!(timeout(WAIT, subscription.recv()).await?.as_deref(), Some("\"4,5,6,0.1\""));
    assert!(skipped_at.elapsed() < long_interval);
    assert_eq!(timeout(WAIT, accepted.recv()).await?, Some(1));

    drop_tx.send(())?;
    wait_for_status(&mut status, ChannelStatus::Reconnecting).await?;
    sleep(Duration::from_millis(500)).await;
    assert!(accepted.try_recv().is_err(), "next delay runs in full");
    assert_eq!(channel.status(), ChannelStatus::Reconnecting);

    channel.close();
    Ok(())
}
