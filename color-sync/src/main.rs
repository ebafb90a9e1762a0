use anyhow::{Result, bail};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use color_sync::{
    cli::{Cli, Command, HubArgs},
    client,
    hub::{Endpoint, EndpointListener, Hub, HubConfig},
    tls,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Hub(args) => run_hub(args).await?,
        Command::Watch(args) => client::watch(args).await?,
        Command::Set(args) => client::set(args).await?,
    }

    Ok(())
}

async fn run_hub(args: HubArgs) -> Result<()> {
    if !(0.0..=1.0).contains(&args.brightness) {
        bail!("brightness must be between 0.0 and 1.0, got {}", args.brightness);
    }

    let mut secure = EndpointListener::new(
        Endpoint::Secure,
        TcpListener::bind(args.secure_listen).await?,
    );
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => secure = secure.with_tls(tls::load_acceptor(cert, key)?),
        _ => warn!("no certificate configured; secure endpoint is serving plain websockets"),
    }
    let plain = EndpointListener::new(Endpoint::Plain, TcpListener::bind(args.plain_listen).await?);

    let hub = Hub::new(
        secure,
        plain,
        HubConfig {
            initial: args.initial_color,
            brightness: args.brightness,
        },
    );
    info!("secure endpoint listening on {}", hub.secure_addr()?);
    info!("plain endpoint listening on {}", hub.plain_addr()?);

    if let Err(err) = hub.run_until_ctrl_c().await {
        warn!("hub exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
