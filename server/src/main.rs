use clap::Parser;
use log::{error, info, warn};
use server::{BridgeServer, ServerConfig};
use shared::{Command, GazePoint, InboundKind, START_SIGNAL_ACK};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Something the host loop has to act on between ticks.
#[derive(Debug, Clone, PartialEq)]
enum HostEvent {
    StartSignal,
    Console(ConsoleCommand),
}

/// A line typed on the host console.
#[derive(Debug, Clone, PartialEq)]
enum ConsoleCommand {
    Command(Command),
    Gaze(GazePoint),
}

/// Main-method of the demo host.
/// Starts the bridge, then drains it once per tick and reacts to console input.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Port to listen on
        #[clap(short, long, default_value = "9998")]
        port: u16,
        /// Drain rate (ticks per second)
        #[clap(short, long, default_value = "30")]
        tick_rate: u32,
    }

    env_logger::init();
    let args = Args::parse();

    let server = Arc::new(BridgeServer::new(
        ServerConfig::default().with_port(args.port),
    ));
    server.start()?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<HostEvent>();

    // Callbacks run inside drain() on the host loop; replies go through the event channel.
    let start_tx = event_tx.clone();
    let _start = server.subscribe(InboundKind::StartSignal, move |_| {
        let _ = start_tx.send(HostEvent::StartSignal);
    });
    let _subtitle = server.subscribe(InboundKind::Subtitle, |text| {
        info!("Subtitle: {}", text);
    });
    let _confirmed = server.subscribe(InboundKind::SelectionConfirmed, |_| {
        info!("Selection confirmed by controller");
    });

    let console_handle = tokio::spawn(read_console(event_tx));

    let mut interval_timer = interval(Duration::from_secs_f32(1.0 / args.tick_rate.max(1) as f32));
    interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                server.drain();

                let mut events = Vec::new();
                while let Ok(event) = event_rx.try_recv() {
                    events.push(event);
                }
                for event in events {
                    handle_event(&server, event).await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    console_handle.abort();
    let stopping = Arc::clone(&server);
    tokio::task::spawn_blocking(move || stopping.stop()).await?;

    Ok(())
}

/// Performs the sends an event calls for. Sends block, so they run off the async workers.
async fn handle_event(server: &Arc<BridgeServer>, event: HostEvent) {
    let server = Arc::clone(server);
    let result = tokio::task::spawn_blocking(move || match event {
        HostEvent::StartSignal => {
            info!("Start signal received, acknowledging");
            server.send_ack(START_SIGNAL_ACK)
        }
        HostEvent::Console(ConsoleCommand::Command(command)) => server.send_command(command),
        HostEvent::Console(ConsoleCommand::Gaze(point)) => server.send_gaze(point),
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Send failed: {}", e),
        Err(e) => error!("Send task panicked: {}", e),
    }
}

/// Forwards parsed console lines to the host loop until stdin closes.
async fn read_console(events: mpsc::UnboundedSender<HostEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_console_line(&line) {
                    Ok(command) => {
                        if events.send(HostEvent::Console(command)).is_err() {
                            break;
                        }
                    }
                    Err(message) => warn!("{}", message),
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read console: {}", e);
                break;
            }
        }
    }
}

/// Parses `eat`, `grub`, `door`, `plate` or `gaze <x> <y>`.
fn parse_console_line(line: &str) -> Result<ConsoleCommand, String> {
    let mut words = line.split_whitespace();

    match words.next() {
        Some("gaze") => {
            let mut coordinate = |axis: &str| -> Result<i32, String> {
                let word = words
                    .next()
                    .ok_or_else(|| format!("Missing {} coordinate, usage: gaze <x> <y>", axis))?;
                word.parse()
                    .map_err(|_| format!("Invalid {} coordinate '{}'", axis, word))
            };
            let x = coordinate("x")?;
            let y = coordinate("y")?;
            Ok(ConsoleCommand::Gaze(GazePoint::new(x, y)))
        }
        Some(word) => word
            .parse::<Command>()
            .map(ConsoleCommand::Command)
            .map_err(|_| {
                format!(
                    "Unknown input '{}', expected eat, grub, door, plate or gaze <x> <y>",
                    word
                )
            }),
        None => Err("Empty input".to_string()),
    }
}
