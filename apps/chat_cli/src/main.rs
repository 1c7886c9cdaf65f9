use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use conversation_core::{
    load_settings,
    memory::InMemoryBackend,
    transport::HttpBackendService,
    BackendDataService, ConversationEvent, ConversationHandle, ConversationSession,
    ConversationSnapshot, TypingUpdate,
};
use futures::StreamExt;
use shared::{
    domain::{ConversationId, Message, MessageId, Participant, TypingSignal, UserId},
    protocol::{RealtimeEntity, RealtimeOp, SendMessageRequest},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Backend base url; falls back to `conversation.toml` / `APP__SERVER_URL`.
    /// Without one the CLI runs against an in-process backend with an echo bot.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, default_value = "general")]
    conversation: String,
    #[arg(long, default_value = "me")]
    user: String,
    #[arg(long)]
    name: Option<String>,
}

const HELP: &str = "commands: <text> | /reply <id> <text> | /edit <id> <text> | /react <id> <emoji> \
| /delete <id> | /select <id> | /toggle <id> | /confirm | /cancel | /older | /reload | /list | /quit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if args.server_url.is_some() {
        settings.server_url = args.server_url.clone();
    }

    let me = Participant {
        user_id: UserId::new(args.user.clone()),
        display_name: args.name.clone().unwrap_or_else(|| args.user.clone()),
        avatar_ref: None,
    };
    let conversation_id = ConversationId::new(args.conversation.clone());

    let backend: Arc<dyn BackendDataService> = match &settings.server_url {
        Some(server_url) => {
            info!(%server_url, "connecting to backend");
            Arc::new(HttpBackendService::new(server_url.clone(), me.user_id.clone()))
        }
        None => {
            println!("no server configured; running offline with an echo bot");
            let hub = InMemoryBackend::new();
            spawn_echo_bot(&hub, conversation_id.clone()).await?;
            hub.client_for(me.clone())
        }
    };

    let handle = ConversationSession::spawn(settings, backend, me, conversation_id);
    let printer = tokio::spawn(print_events(handle.clone()));
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = run_command(&handle, line).await {
            println!("! {err}");
        }
    }

    handle.shutdown().await;
    printer.abort();
    Ok(())
}

async fn run_command(handle: &ConversationHandle, line: &str) -> Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let (target, text) = rest.split_once(' ').unwrap_or((rest, ""));
    let target = MessageId::new(target);

    match command {
        "/reply" => send_in_background(handle, text.to_string(), Some(target)),
        "/edit" => handle.edit(target, text).await?,
        "/react" => {
            let added = handle.toggle_reaction(target, text).await?;
            println!("reaction {}", if added { "added" } else { "removed" });
        }
        "/delete" => handle.delete_single(target).await?,
        "/select" => handle.enter_selection(target).await?,
        "/toggle" => {
            handle.toggle_selection(target).await?;
        }
        "/confirm" => handle.confirm_delete().await?,
        "/cancel" => handle.cancel_selection().await?,
        "/older" => {
            let merged = handle.load_older().await?;
            println!("loaded {merged} older messages");
        }
        "/reload" => {
            handle.reload().await?;
        }
        "/list" => print_snapshot(&handle.snapshot().await?),
        _ if command.starts_with('/') => println!("{HELP}"),
        _ => {
            handle.typing_keystroke().await?;
            send_in_background(handle, line.to_string(), None);
        }
    }
    Ok(())
}

/// Sends resolve only once confirmed; keep the prompt responsive meanwhile.
fn send_in_background(handle: &ConversationHandle, body: String, reply_to_id: Option<MessageId>) {
    let handle = handle.clone();
    tokio::spawn(async move {
        if let Err(err) = handle.send_text(body, reply_to_id).await {
            println!("! {err}");
        }
    });
}

fn format_message(message: &Message) -> String {
    let edited = if message.is_edited { " (edited)" } else { "" };
    format!(
        "[{}] {} {}: {}{edited}",
        message.id,
        message.created_at.format("%H:%M:%S"),
        message.sender_display_name,
        message.body
    )
}

fn print_snapshot(snapshot: &ConversationSnapshot) {
    if snapshot.window.has_more_older {
        println!("  ... (/older for more)");
    }
    for message in &snapshot.messages {
        println!("  {}", format_message(message));
        if let Some(reactions) = snapshot.reactions.get(&message.id) {
            let summary: Vec<String> = reactions
                .iter()
                .map(|(emoji, r)| format!("{emoji}{}{}", r.count, if r.self_reacted { "*" } else { "" }))
                .collect();
            println!("      {}", summary.join(" "));
        }
    }
    if snapshot.selection_active {
        let selected: Vec<String> = snapshot.selected.iter().map(ToString::to_string).collect();
        println!("  selected: {}", selected.join(", "));
    }
}

async fn print_events(handle: ConversationHandle) {
    let mut events = handle.subscribe_events();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };
        match event {
            ConversationEvent::NewestChanged => {
                if let Ok(snapshot) = handle.snapshot().await {
                    if let Some(newest) = snapshot.messages.last() {
                        println!("{}", format_message(newest));
                    }
                }
            }
            ConversationEvent::HistoryPrepended { count } => {
                println!("-- {count} older messages merged");
            }
            ConversationEvent::TypingChanged {
                description: Some(description),
            } => println!("   {description}"),
            ConversationEvent::SelectionChanged { active, selected } if active => {
                println!("-- {} selected", selected.len());
            }
            ConversationEvent::Notice(notice) => println!("! {}", notice.message),
            _ => {}
        }
    }
}

/// Offline companion: answers every message from someone else.
async fn spawn_echo_bot(hub: &InMemoryBackend, conversation_id: ConversationId) -> Result<()> {
    let bot_participant = Participant {
        user_id: UserId::from("echo-bot"),
        display_name: "Echo Bot".into(),
        avatar_ref: None,
    };
    let bot = hub.client_for(bot_participant.clone());
    let mut feed = bot.subscribe(&conversation_id).await?;

    tokio::spawn(async move {
        while let Some(event) = feed.next().await {
            let RealtimeEntity::Message(message) = event.entity else {
                continue;
            };
            if event.op != RealtimeOp::Insert || message.sender_id == bot_participant.user_id {
                continue;
            }

            let typing = TypingUpdate::Started(TypingSignal {
                user_id: bot_participant.user_id.clone(),
                display_name: bot_participant.display_name.clone(),
                expires_at: Utc::now() + chrono::Duration::seconds(5),
            });
            let _ = bot.broadcast_typing(&conversation_id, typing).await;
            tokio::time::sleep(Duration::from_millis(800)).await;

            let reply = SendMessageRequest {
                sender_id: bot_participant.user_id.clone(),
                body: format!("echo: {}", message.body),
                reply_to_id: Some(message.id.clone()),
                attachment: None,
                client_token: None,
            };
            if let Err(err) = bot.send_message(&conversation_id, reply).await {
                warn!("echo bot failed to reply: {err}");
            }
            let stopped = TypingUpdate::Stopped(bot_participant.user_id.clone());
            let _ = bot.broadcast_typing(&conversation_id, stopped).await;
        }
    });
    Ok(())
}
