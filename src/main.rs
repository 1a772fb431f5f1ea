use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use roomrelay_lib::config::load_config;
use roomrelay_lib::relay;
use roomrelay_lib::{build_state, RelayState, SessionClient, SessionEvent, SessionState, WsConnector};

/// Resilient chat-room relay.
#[derive(Parser, Debug)]
#[command(name = "roomrelay", version, about = "Relay a chat room to browser viewers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP relay server.
    Serve {
        /// Address override.
        #[arg(long)]
        host: Option<String>,
        /// Port override.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Watch a room in the terminal.
    Watch {
        /// Room to join.
        #[arg(long)]
        room: String,
        /// Display name; a random guest name when omitted.
        #[arg(long)]
        name: Option<String>,
    },
}

/// Commands accepted on stdin while watching
#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchCommand {
    Start,
    Stop,
    Restart,
    Clear,
    Status,
    Quit,
    Say(String),
    Unknown(String),
}

impl WatchCommand {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let command = match line {
            "/start" => Self::Start,
            "/stop" => Self::Stop,
            "/restart" => Self::Restart,
            "/clear" => Self::Clear,
            "/status" => Self::Status,
            "/quit" | "/exit" => Self::Quit,
            other if other.starts_with('/') => Self::Unknown(other.to_string()),
            other => Self::Say(other.to_string()),
        };
        Some(command)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    let env_file_path = dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "roomrelay_lib=debug,roomrelay=debug,warn".into()
            } else {
                "roomrelay_lib=info,roomrelay=info,warn".into()
            }
        }))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    match env_file_path {
        Some(path) => info!("Loaded environment variables from {}", path.display()),
        None => debug!("No .env file found. Using existing environment variables."),
    };

    let cli = Cli::parse();
    let mut config = load_config().await.context("Failed to load configuration")?;

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            let ip: IpAddr = config
                .server
                .host
                .parse()
                .map_err(|e| anyhow!("Invalid host '{}': {}", config.server.host, e))?;
            let addr = SocketAddr::new(ip, config.server.port);

            let state = build_state(&config, Arc::new(WsConnector::new())).await?;
            relay::serve(state, addr, config.server.cors_enabled).await
        }
        Command::Watch { room, name } => {
            if name.is_some() {
                config.session.display_name = name;
            }
            let state = build_state(&config, Arc::new(WsConnector::new())).await?;
            watch(state, room).await
        }
    }
}

/// A started session and its event feed
struct Watched {
    session: Arc<SessionClient>,
    events: broadcast::Receiver<SessionEvent>,
}

async fn start_watching(state: &RelayState, room: &str) -> Result<Watched> {
    let entry = state.registry.start(room, "terminal").await?;
    let events = entry.session.subscribe();
    entry.session.connect();
    println!("* joining {} as {}", room, entry.session.display_name());
    Ok(Watched {
        session: entry.session,
        events,
    })
}

async fn next_event(watched: Option<&mut Watched>) -> Option<Result<SessionEvent, broadcast::error::RecvError>> {
    match watched {
        Some(watched) => Some(watched.events.recv().await),
        None => std::future::pending().await,
    }
}

async fn watch(state: RelayState, room: String) -> Result<()> {
    let mut watched = Some(start_watching(&state, &room).await?);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let Some(command) = WatchCommand::parse(&line) else { continue };
                match command {
                    WatchCommand::Start => {
                        match watched.as_ref().map(|current| current.session.state()) {
                            None => watched = Some(start_watching(&state, &room).await?),
                            // Gave up reconnecting; the same session can try again
                            Some(SessionState::Disconnected) => {
                                if let Some(current) = &watched {
                                    current.session.connect();
                                }
                                println!("* reconnecting to {}", room);
                            }
                            Some(_) => println!("* already running, use /restart"),
                        }
                    }
                    WatchCommand::Stop => {
                        state.registry.stop_room(&room).await;
                        watched = None;
                        println!("* stopped");
                    }
                    WatchCommand::Restart => {
                        watched = Some(start_watching(&state, &room).await?);
                    }
                    WatchCommand::Clear => {
                        if let Some(watched) = &watched {
                            watched.session.clear_messages();
                        }
                        let cleared = state.log_book.clear();
                        print!("\x1B[2J\x1B[1;1H");
                        println!("* cleared {} log lines", cleared);
                    }
                    WatchCommand::Status => match &watched {
                        Some(watched) => {
                            let info = watched.session.connection_info();
                            println!("{}", serde_json::to_string_pretty(&info)?);
                        }
                        None => println!("* not running"),
                    },
                    WatchCommand::Quit => break,
                    WatchCommand::Say(text) => match relay::route_chat_message(&state.registry, &room, &text).await {
                        Ok(()) => {}
                        Err(e) => println!("! {}", e),
                    },
                    WatchCommand::Unknown(command) => {
                        println!("! unknown command {} (try /start /stop /restart /clear /status /quit)", command);
                    }
                }
            }
            event = next_event(watched.as_mut()) => {
                match event {
                    Some(Ok(event)) => {
                        if let (SessionEvent::Message(message), Some(plays)) = (&event, &state.plays) {
                            plays.offer(message);
                        }
                        println!("{}", render(&event));
                    }
                    Some(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        warn!(skipped, "Terminal fell behind");
                    }
                    Some(Err(broadcast::error::RecvError::Closed)) | None => {
                        watched = None;
                    }
                }
            }
        }
    }

    state.registry.shutdown().await;
    Ok(())
}

fn render(event: &SessionEvent) -> String {
    let now = chrono::Local::now().format("%H:%M:%S");
    match event {
        SessionEvent::Connected { session_id } => {
            format!("{} * connected ({})", now, session_id.as_deref().unwrap_or("-"))
        }
        SessionEvent::Disconnected { reason } => format!("{} * disconnected: {}", now, reason),
        SessionEvent::Error { category, message } => format!("{} ! [{}] {}", now, category, message),
        SessionEvent::Message(message) => format!("{} <{}> {}", now, message.username, message.message),
        SessionEvent::MessageHistory(messages) => {
            let mut out = format!("{} * {} messages of history", now, messages.len());
            for message in messages {
                out.push_str(&format!("\n  <{}> {}", message.username, message.message));
            }
            out
        }
        SessionEvent::UserJoined { username, .. } => format!("{} * {} joined", now, username),
        SessionEvent::UserLeft { user_address } => format!("{} * {} left", now, user_address),
        SessionEvent::ServerError { reason } => format!("{} ! server: {}", now, reason),
        SessionEvent::MaxReconnectsReached { attempts } => {
            format!("{} ! gave up after {} attempts, /start to retry", now, attempts)
        }
    }
}
