use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use pixame::config::ConfigError;
use pixame::sync::{RemoteAppend, RemoteApply};
use pixame::{
    ApiError, ErrorCode, Feed, HttpApi, Session, SessionEvent, SnapshotLoader, SyncApi, SyncConfig, SyncError,
    ValidationError,
};

/// How long `draw` and `say` wait for the feed to echo the write.
const ECHO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("[{}] {}", .0.error_code(), .0)]
    Sync(#[from] SyncError),
    #[error("[{}] {}", .0.error_code(), .0)]
    Api(#[from] ApiError),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server is not healthy")]
    Unhealthy,
    #[error("timed out waiting for the {0} feed to echo the write")]
    EchoTimeout(Feed),
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("session ended before the write was confirmed")]
    SessionEnded,
}

#[derive(Parser, Debug)]
#[command(name = "pixame", about = "Shared pixel canvas and chat client")]
struct Cli {
    #[arg(long, env = "PIXAME_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "PIXAME_AUTHOR")]
    author: Option<String>,

    #[arg(long, env = "PIXAME_CANVAS_WIDTH")]
    width: Option<u32>,

    #[arg(long, env = "PIXAME_CANVAS_HEIGHT")]
    height: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the server health endpoint.
    Ping,
    /// Print the current canvas snapshot as JSON.
    Canvas,
    /// Print the chat history as JSON.
    History,
    /// Print one pixel as JSON.
    Pixel { x: u32, y: u32 },
    /// Paint one pixel and wait for the canvas feed to confirm it.
    Draw {
        x: i64,
        y: i64,
        #[arg(default_value = "#000000")]
        color: String,
    },
    /// Send a chat message and wait for the chat feed to echo it.
    Say { message: String },
    /// Stream canvas and chat changes until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let api: Arc<dyn SyncApi> = Arc::new(HttpApi::new(&config)?);

    match cli.command {
        Command::Ping => run_ping(api.as_ref()).await,
        Command::Canvas => print_json(&SnapshotLoader::new(api).fetch_canvas_snapshot().await?),
        Command::History => print_json(&SnapshotLoader::new(api).fetch_chat_snapshot().await?),
        Command::Pixel { x, y } => print_json(&api.fetch_pixel(x, y).await?),
        Command::Draw { x, y, color } => run_draw(config, api, x, y, &color).await,
        Command::Say { message } => run_say(config, api, &message).await,
        Command::Watch => run_watch(config, api).await,
    }
}

fn build_config(cli: &Cli) -> Result<SyncConfig, CliError> {
    let mut config = SyncConfig::from_env()?;
    if let Some(base_url) = &cli.base_url {
        config = config.with_base_url(base_url);
    }
    if let Some(author) = &cli.author {
        config = config.with_author(author)?;
    }
    if cli.width.is_some() || cli.height.is_some() {
        let width = cli.width.unwrap_or(config.canvas_width);
        let height = cli.height.unwrap_or(config.canvas_height);
        config = config.with_canvas_size(width, height);
    }
    Ok(config)
}

async fn run_ping(api: &dyn SyncApi) -> Result<(), CliError> {
    if !api.health().await {
        return Err(CliError::Unhealthy);
    }
    println!("ok");
    Ok(())
}

async fn run_draw(config: SyncConfig, api: Arc<dyn SyncApi>, x: i64, y: i64, color: &str) -> Result<(), CliError> {
    let mut session = Session::start(config, api).await;
    let write = match session.draw_pixel(x, y, color) {
        Ok(write) => write,
        Err(e) => {
            session.shutdown().await;
            return Err(e.into());
        }
    };
    let key = write.pixel().key();

    let outcome = await_echo(&mut session, Feed::Canvas, |event| match event {
        SessionEvent::PixelApplied { pixel, outcome: RemoteApply::Confirmed } if pixel.key() == key => {
            Some(Ok(()))
        }
        _ => None,
    })
    .await;
    session.shutdown().await;
    outcome?;
    print_json(write.pixel())
}

async fn run_say(config: SyncConfig, api: Arc<dyn SyncApi>, body: &str) -> Result<(), CliError> {
    let mut session = Session::start(config, api).await;
    let sent = session.send_message(body);
    if let Err(e) = sent {
        session.shutdown().await;
        return Err(e.into());
    }

    let outcome = await_echo(&mut session, Feed::Chat, |event| match event {
        SessionEvent::MessageAppended { message, outcome: RemoteAppend::Confirmed } => Some(Ok(message.clone())),
        _ => None,
    })
    .await;
    session.shutdown().await;
    print_json(&outcome?)
}

/// Pump session events until `check` resolves the write, it is rejected, or
/// the echo timeout passes.
async fn await_echo<T>(
    session: &mut Session,
    feed: Feed,
    mut check: impl FnMut(&SessionEvent) -> Option<Result<T, CliError>>,
) -> Result<T, CliError> {
    let pump = async {
        while let Some(event) = session.next_event().await {
            if let SessionEvent::WriteRejected { feed: f, reason } = &event {
                if *f == feed {
                    return Err(CliError::Rejected(reason.clone()));
                }
            }
            if let Some(result) = check(&event) {
                return result;
            }
        }
        Err(CliError::SessionEnded)
    };
    tokio::time::timeout(ECHO_TIMEOUT, pump)
        .await
        .unwrap_or(Err(CliError::EchoTimeout(feed)))
}

async fn run_watch(config: SyncConfig, api: Arc<dyn SyncApi>) -> Result<(), CliError> {
    let mut session = Session::start(config, api).await;
    info!(author = %session.author_id(), "watch: streaming, ctrl-c to stop");

    loop {
        tokio::select! {
            event = session.next_event() => {
                let Some(event) = event else { break };
                println!("{}", describe(&event, &session));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    session.shutdown().await;
    Ok(())
}

fn describe(event: &SessionEvent, session: &Session) -> String {
    match event {
        SessionEvent::PixelApplied { pixel, outcome } => {
            format!("pixel ({}, {}) {} by {} [{outcome:?}]", pixel.x, pixel.y, pixel.color, pixel.author_id)
        }
        SessionEvent::MessageAppended { message, .. } => format!("<{}> {}", message.author_id, message.body),
        SessionEvent::FeedStatus { feed, state } => format!("{feed}: {state}"),
        SessionEvent::Resynchronized { feed: Feed::Canvas } => {
            format!("canvas: synchronized, {} painted cells", session.canvas().snapshot().len())
        }
        SessionEvent::Resynchronized { feed: Feed::Chat } => {
            format!("chat: synchronized, {} messages", session.chat().log().len())
        }
        SessionEvent::WriteRejected { feed, reason } => format!("{feed}: write rejected: {reason}"),
        SessionEvent::FeedError { feed, error } => format!("{feed}: [{}] {error}", error.error_code()),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
