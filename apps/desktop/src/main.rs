use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    http::DEFAULT_REQUEST_TIMEOUT, ChangeFeedChannel, ChatSession, ClientEvent, DualChannel,
    HttpLedger, ReconnectPolicy, SessionOptions, ViewEntry, WsPushChannel,
};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::OutgoingMessage,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Terminal chat client for one conversation.
///
/// Lines typed on stdin are sent. `/hide <id>`, `/retract <id>` and
/// `/quit` are commands.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    conversation_id: i64,
    /// Resume the change-feed after this sequence number.
    #[arg(long)]
    since: Option<i64>,
}

enum Input {
    Send(String),
    Hide(MessageId),
    Retract(MessageId),
    Quit,
    Unknown(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Send(line.to_string()));
    };
    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let id = parts.next().and_then(|raw| raw.parse::<i64>().ok()).map(MessageId);
    Some(match (name, id) {
        ("quit", _) => Input::Quit,
        ("hide", Some(id)) => Input::Hide(id),
        ("retract", Some(id)) => Input::Retract(id),
        _ => Input::Unknown(line.to_string()),
    })
}

fn print_entry(entry: &ViewEntry) {
    let id = entry
        .message_id()
        .map(|id| id.0.to_string())
        .unwrap_or_else(|| "pending".to_string());
    let content = if entry.is_retracted() {
        "<retracted>"
    } else {
        entry.content()
    };
    println!(
        "[{id}] {}: {content} ({})",
        entry.sender_id().0,
        entry.status().label()
    );
}

async fn print_events(session: Arc<ChatSession>, conversation_id: ConversationId) {
    let mut events = session.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event printer lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        match event {
            ClientEvent::MessageInserted { message_id, .. } => {
                let view = session.view(conversation_id).await;
                if let Some(entry) = view.iter().find(|e| e.message_id() == Some(message_id)) {
                    print_entry(entry);
                    if entry.sender_id() != session.user_id() {
                        // A terminal has no viewport; an arrival is on screen.
                        if let Err(err) = session.on_visible(message_id, 1.0).await {
                            tracing::warn!(%err, "could not mark seen");
                        }
                    }
                }
            }
            ClientEvent::MessageReplaced { message_id, .. } => {
                println!("  sent as #{}", message_id.0);
            }
            ClientEvent::ProvisionalRolledBack { draft, error, .. } => {
                println!("  not sent ({error}): {}", draft.content);
            }
            ClientEvent::DraftSuperseded { message_id, .. } => {
                println!("  actually delivered as #{}", message_id.0);
            }
            ClientEvent::StatusChanged {
                message_id, status, ..
            } => println!("  #{} {}", message_id.0, status.label()),
            ClientEvent::MessageRetracted { message_id, .. } => {
                println!("  #{} was unsent", message_id.0)
            }
            ClientEvent::MessageHidden { message_id, .. } => {
                println!("  #{} hidden", message_id.0)
            }
            ClientEvent::TypingChanged {
                conversation_id: typing_in,
                user_id,
                is_typing,
            } if typing_in == conversation_id => {
                if is_typing {
                    println!("  {} is typing...", user_id.0);
                }
            }
            ClientEvent::UnreadChanged {
                conversation_id,
                unread_count,
            } => tracing::debug!(conversation_id = conversation_id.0, unread_count, "unread"),
            ClientEvent::ConversationDeactivated { conversation_id: gone }
                if gone == conversation_id =>
            {
                println!("  conversation closed by the other side");
            }
            ClientEvent::TransportDegraded { via } => {
                tracing::warn!(transport = via.as_str(), "connection lost")
            }
            ClientEvent::TransportRestored { via } => {
                tracing::info!(transport = via.as_str(), "connection restored")
            }
            ClientEvent::Error(message) => println!("  error: {message}"),
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    let args = Args::parse();
    let user_id = UserId(args.user_id);
    let conversation_id = ConversationId(args.conversation_id);

    let ledger = HttpLedger::new(&args.server_url, user_id, DEFAULT_REQUEST_TIMEOUT)
        .context("invalid server url")?;
    let push = WsPushChannel::connect(&args.server_url, user_id, ReconnectPolicy::default())
        .context("push channel")?;
    let feed = ChangeFeedChannel::connect(
        &args.server_url,
        user_id,
        args.since,
        ReconnectPolicy::default(),
    )
    .context("change-feed channel")?;

    let session = ChatSession::new(
        user_id,
        Arc::new(ledger),
        DualChannel { push, feed },
        SessionOptions::default(),
    );
    session.start().await;

    let history = session
        .open_conversation(conversation_id)
        .await
        .context("open conversation")?;
    for entry in &history {
        print_entry(entry);
        if let Some(message_id) = entry.message_id() {
            if entry.sender_id() != user_id {
                if let Err(err) = session.on_visible(message_id, 1.0).await {
                    tracing::warn!(%err, "could not mark seen");
                }
            }
        }
    }
    println!(
        "-- conversation {} ({} unread) --",
        conversation_id.0,
        session.unread(conversation_id).await
    );

    let printer = tokio::spawn(print_events(session.clone(), conversation_id));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(input) = parse_input(&line) else {
            continue;
        };
        match input {
            Input::Send(content) => {
                session.typing_keystroke(conversation_id).await;
                let draft = OutgoingMessage {
                    content,
                    ..OutgoingMessage::default()
                };
                if let Err(err) = session.send_message(conversation_id, draft).await {
                    tracing::debug!(%err, "send failed");
                }
            }
            Input::Hide(message_id) => {
                if let Err(err) = session.hide_message(message_id).await {
                    println!("  hide failed: {err}");
                }
            }
            Input::Retract(message_id) => {
                if let Err(err) = session.retract_message(message_id).await {
                    println!("  unsend failed: {err}");
                }
            }
            Input::Quit => break,
            Input::Unknown(line) => println!("  unknown command: {line}"),
        }
    }

    printer.abort();
    session.close_conversation(conversation_id).await;
    session.shutdown().await;
    Ok(())
}
