use clap::{Parser, Subcommand};
use client::{ControllerClient, ControllerEvent};
use log::{debug, info, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bridge server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:9998")]
    server: String,

    /// Seconds to wait between connection attempts
    #[arg(short = 'r', long, default_value = "5")]
    retry_delay: u64,

    /// Give up after this many connection attempts (retries forever if unset)
    #[arg(short = 'm', long)]
    max_attempts: Option<u32>,

    /// Seconds to wait for the start signal to be acknowledged
    #[arg(long, default_value = "5")]
    handshake_timeout: u64,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Send a start signal and wait for the acknowledgement
    Start,
    /// Send a subtitle line
    Subtitle { text: String },
    /// Confirm the current selection
    Confirm,
    /// Handshake, then log everything the server sends, reconnecting whenever it goes away
    Monitor,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let handshake_timeout = Duration::from_secs(args.handshake_timeout);
    let retry_delay = Duration::from_secs(args.retry_delay);

    info!("Connecting to: {}", args.server);
    let mut controller = ControllerClient::connect_with_retry(
        &args.server,
        retry_delay,
        args.max_attempts,
    )
    .await?;

    match args.action {
        Action::Start => controller.handshake(handshake_timeout).await?,
        Action::Subtitle { text } => controller.send_subtitle(&text).await?,
        Action::Confirm => controller.send_selection_confirmed().await?,
        Action::Monitor => {
            controller.handshake(handshake_timeout).await?;
            monitor(&mut controller, retry_delay).await;
        }
    }

    if let Err(e) = controller.shutdown().await {
        debug!("Closing the connection failed: {}", e);
    }
    Ok(())
}

/// Logs server events until Ctrl+C is pressed, redialing after the server
/// goes away.
async fn monitor(controller: &mut ControllerClient, retry_delay: Duration) {
    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, disconnecting...");
            ctrl_c.cancel();
        }
    });

    let result = controller
        .run(&token, retry_delay, |event| match event {
            ControllerEvent::Ack(id) => info!("Ack: {}", id),
            ControllerEvent::Command(command) => info!("Command: {}", command),
            ControllerEvent::Gaze(point) => info!("Gaze: ({}, {})", point.x, point.y),
            ControllerEvent::Unknown { kind, payload } => {
                warn!("Unhandled message '{}': {}", kind, payload)
            }
        })
        .await;

    if let Err(e) = result {
        warn!("Monitoring stopped: {}", e);
    }
}
