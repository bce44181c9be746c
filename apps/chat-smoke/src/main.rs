mod logging;

use std::{env, time::Duration};

use chat_core::{
    ChatEngine, ChatError, ConfigError, EngineConfig, EngineEvent,
    config::{optional_trimmed, parse_or},
};
use chat_http::{HttpBackend, HttpBackendConfig, SsePushSource};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
enum SmokeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Chat(#[from] ChatError),
}

/// Values that only the smoke run reads.
struct SmokeOptions {
    user_id: String,
    contact_id: Option<String>,
    send_text: Option<String>,
    listen: Duration,
}

impl SmokeOptions {
    fn from_env() -> Result<Self, ConfigError> {
        let mut lookup = |key: &str| env::var(key).ok();
        let user_id = optional_trimmed("CHAT_SYNC_USER", &mut lookup).ok_or(ConfigError::Missing {
            key: "CHAT_SYNC_USER",
        })?;
        let contact_id = optional_trimmed("CHAT_SYNC_CONTACT", &mut lookup);
        let send_text = optional_trimmed("CHAT_SYNC_SEND_TEXT", &mut lookup);
        let listen_secs = parse_or("CHAT_SYNC_LISTEN_SECS", 0u64, &mut lookup)?;
        Ok(Self {
            user_id,
            contact_id,
            send_text,
            listen: Duration::from_secs(listen_secs),
        })
    }
}

#[tokio::main]
async fn main() {
    logging::init();

    if let Err(err) = run().await {
        error!(error = %err, "chat smoke run failed");
        eprintln!("chat smoke run failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), SmokeError> {
    let options = SmokeOptions::from_env()?;
    let engine_config = EngineConfig::from_env()?;
    let http_config = HttpBackendConfig::from_env()?;
    info!(base_url = %http_config.base_url, user_id = %options.user_id, "starting chat smoke run");

    let backend = HttpBackend::new(&http_config)?;
    let push = SsePushSource::new(&http_config)?;
    let engine = ChatEngine::new(backend, push, engine_config, options.user_id.clone())?;

    let rooms = engine.load_rooms(false).await?;
    info!(
        rooms = rooms.len(),
        unread = engine.total_unread()?,
        has_more = engine.has_more_rooms()?,
        "room directory loaded"
    );
    for room in &rooms {
        println!(
            "{}\t{}\tunread={}",
            room.id,
            engine.display_name_for(room),
            room.unread_count
        );
    }

    let target = match &options.contact_id {
        Some(contact_id) => {
            let room = engine
                .resolve_contact(contact_id, &CancellationToken::new())
                .await?;
            if room.connection_timed_out {
                warn!(contact_id, "directory was not ready; using a provisional room");
            }
            Some(room.id)
        }
        None => rooms.first().map(|room| room.id.clone()),
    };
    let Some(room_id) = target else {
        info!("no rooms to open");
        return Ok(());
    };

    engine.open_room(&room_id).await?;
    let messages = engine.messages(&room_id)?;
    info!(
        room_id,
        messages = messages.len(),
        read_boundary = ?engine.read_boundary()?,
        "room opened"
    );
    for message in &messages {
        println!("[{}] {}: {}", message.created_at, message.sender_id, message.content);
    }
    engine.mark_read(&room_id)?;

    if let Some(text) = &options.send_text {
        let sent = engine.send_message(&room_id, text).await?;
        info!(room_id = %sent.room_id, message_id = %sent.id, "message delivered");
    }

    if !options.listen.is_zero() {
        listen(&engine, options.listen).await?;
    }

    engine.clear()?;
    Ok(())
}

async fn listen(
    engine: &ChatEngine<HttpBackend, SsePushSource>,
    window: Duration,
) -> Result<(), SmokeError> {
    let Some(room_id) = engine.active_room()? else {
        return Ok(());
    };
    let mut events = engine.events();
    engine.subscribe(&room_id).await?;
    info!(room_id, seconds = window.as_secs(), "listening for pushed messages");

    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(EngineEvent::TimelineChanged { room_id }) => {
                    if let Some(last) = engine.messages(&room_id)?.last() {
                        println!("[{}] {}: {}", last.created_at, last.sender_id, last.content);
                    }
                }
                Ok(EngineEvent::SubscriptionError { error, .. }) => {
                    warn!(error = %error, "push stream ended");
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "engine events lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.unsubscribe().await?;
    Ok(())
}
