//! huddle command line: run a relay or join a voice channel

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use huddle::{
    controller_from_settings, ConfigManager, Relay, SessionEvent, SessionSnapshot,
    VoiceSessionController,
};
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;

/// huddle - voice channels with screen sharing
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a signaling relay
    Relay {
        /// Address to listen on
        #[clap(long, default_value = "127.0.0.1:3001")]
        bind: String,
    },
    /// Join a voice channel
    Join {
        channel: String,

        /// Display name (overrides config)
        #[clap(short, long)]
        username: Option<String>,

        /// Relay address (overrides config)
        #[clap(short, long)]
        relay: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ConfigManager::new().context("Failed to load config")?;
    let level = if args.debug {
        "debug".to_string()
    } else {
        config.settings().log_level.clone()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    debug!("Using config at {:?}", config.path());

    match args.command {
        Command::Relay { bind } => run_relay(&bind).await,
        Command::Join {
            channel,
            username,
            relay,
        } => {
            if let Some(username) = username {
                config.settings_mut().username = username;
            }
            if let Some(relay) = relay {
                config.settings_mut().relay_url = relay;
            }
            run_join(&config, channel).await
        }
    }
}

async fn run_relay(bind: &str) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Relay listening on {}", bind);
    println!("relay listening on ws://{}", bind);

    tokio::select! {
        result = signaling::serve(listener, Relay::new()) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down relay"),
    }
    Ok(())
}

async fn run_join(config: &ConfigManager, channel: String) -> Result<()> {
    let controller = controller_from_settings(config.settings())?;
    let mut events = controller.events();

    println!(
        "joining {} as {} via {}",
        channel,
        config.settings().username,
        config.settings().relay_url
    );
    controller
        .connect(channel.as_str())
        .await
        .with_context(|| format!("Could not join {}", channel))?;
    print_roster(&controller.snapshot());
    println!("commands: mute, share, who, leave");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_command(&controller, line.trim()).await {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if !report(&controller, event) {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} session events", n);
                }
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.disconnect().await;
    println!("left {}", channel);
    Ok(())
}

/// Run one stdin command. Returns false when the user asked to leave.
async fn handle_command(controller: &VoiceSessionController, command: &str) -> bool {
    match command {
        "" => {}
        "mute" => match controller.toggle_mute().await {
            Ok(true) => println!("microphone muted"),
            Ok(false) => println!("microphone live"),
            Err(e) => error!("Mute failed: {}", e),
        },
        "share" => match controller.toggle_screen_share().await {
            Ok(true) => println!("sharing screen"),
            Ok(false) => println!("screen share stopped"),
            Err(e) if e.is_user_visible() => println!("screen share unavailable: {}", e),
            Err(e) => error!("Screen share failed: {}", e),
        },
        "who" => print_roster(&controller.snapshot()),
        "leave" | "quit" => return false,
        other => println!("unknown command: {}", other),
    }
    true
}

/// Print a session event. Returns false once the session is over.
fn report(controller: &VoiceSessionController, event: SessionEvent) -> bool {
    let name = |id: &huddle::ParticipantId| {
        controller
            .snapshot()
            .participants
            .iter()
            .find(|p| &p.id == id)
            .map(|p| p.username.clone())
            .unwrap_or_else(|| id.to_string())
    };
    match event {
        SessionEvent::ParticipantJoined(id) => println!("+ {} joined", name(&id)),
        SessionEvent::ParticipantLeft(id) => println!("- {} left", id),
        SessionEvent::LinkConnected(id) => println!("~ connected to {}", name(&id)),
        SessionEvent::LinkFailed {
            participant,
            reason,
        } => println!("! lost {}: {}", participant, reason),
        SessionEvent::SignalingLost => {
            println!("! relay connection lost");
            return false;
        }
        other => debug!("{:?}", other),
    }
    true
}

fn print_roster(snapshot: &SessionSnapshot) {
    if snapshot.participants.is_empty() {
        println!("nobody else here");
        return;
    }
    for p in &snapshot.participants {
        let mut flags = Vec::new();
        if p.is_muted {
            flags.push("muted");
        }
        if p.is_screen_sharing {
            flags.push("sharing");
        }
        println!("  {} [{:?}] {}", p.username, p.link_state, flags.join(" "));
    }
}
