use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::color::{ColorUpdate, DEFAULT_BRIGHTNESS};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the hub, serving the shared color on a secure and a plain endpoint.
    Hub(HubArgs),
    /// Follow the shared color and print every change.
    Watch(WatchArgs),
    /// Request a new shared color and wait for the hub to confirm it.
    Set(SetArgs),
}

#[derive(Args, Debug, Clone)]
pub struct HubArgs {
    /// Address of the endpoint intended for TLS clients. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8443")]
    pub secure_listen: SocketAddr,

    /// Address of the plain endpoint, for devices that cannot speak TLS.
    #[arg(long, default_value = "0.0.0.0:8880")]
    pub plain_listen: SocketAddr,

    /// PEM certificate chain for the secure endpoint.
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for the secure endpoint.
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Brightness attached to every broadcast color (0.0 - 1.0).
    #[arg(long, default_value_t = DEFAULT_BRIGHTNESS)]
    pub brightness: f64,

    /// Color served before any client has sent an update.
    #[arg(long, default_value = "255,255,255")]
    pub initial_color: ColorUpdate,
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    /// WebSocket URL of the hub.
    #[arg(long, default_value = "ws://127.0.0.1:8880")]
    pub endpoint: String,

    /// Delay before reopening a dropped connection.
    #[arg(long, default_value_t = 5000)]
    pub reconnect_interval_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct SetArgs {
    /// WebSocket URL of the hub.
    #[arg(long, default_value = "ws://127.0.0.1:8880")]
    pub endpoint: String,

    /// Requested color as `red,green,blue`.
    pub color: ColorUpdate,
}
