use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::domain::{ConversationId, UserId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Opens (or returns the existing) conversation between two users.
    CreateConversation { first_user_id: i64, second_user_id: i64 },
    /// Prints the active conversation between two users, if any.
    FindConversation { first_user_id: i64, second_user_id: i64 },
    /// Marks a conversation inactive on behalf of one participant.
    Deactivate {
        conversation_id: i64,
        actor_user_id: i64,
    },
    ListConversations {
        user_id: i64,
    },
    ListMessages {
        conversation_id: i64,
        viewer_user_id: i64,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateConversation {
            first_user_id,
            second_user_id,
        } => {
            let conversation_id = storage
                .create_conversation(UserId(first_user_id), UserId(second_user_id))
                .await?;
            println!("conversation_id={}", conversation_id.0);
        }
        Command::FindConversation {
            first_user_id,
            second_user_id,
        } => {
            match storage
                .active_conversation_between(UserId(first_user_id), UserId(second_user_id))
                .await?
            {
                Some(conversation_id) => println!("conversation_id={}", conversation_id.0),
                None => println!("no active conversation"),
            }
        }
        Command::Deactivate {
            conversation_id,
            actor_user_id,
        } => {
            let changed = storage
                .deactivate_conversation(ConversationId(conversation_id), UserId(actor_user_id))
                .await?;
            if changed {
                println!("deactivated conversation_id={conversation_id}");
            } else {
                println!("conversation_id={conversation_id} was already inactive");
            }
        }
        Command::ListConversations { user_id } => {
            let user_id = UserId(user_id);
            for entry in storage.list_conversations_for_user(user_id).await? {
                let peer = entry
                    .conversation
                    .peer_of(user_id)
                    .map(|peer| peer.0.to_string())
                    .unwrap_or_default();
                println!(
                    "{}\tpeer={}\tactive={}\tunread={}\tlast={}",
                    entry.conversation.conversation_id.0,
                    peer,
                    entry.conversation.is_active,
                    entry.unread_count,
                    entry.last_activity.to_rfc3339(),
                );
            }
            println!("total unread: {}", storage.unread_total(user_id).await?);
        }
        Command::ListMessages {
            conversation_id,
            viewer_user_id,
            limit,
        } => {
            let messages = storage
                .list_messages(
                    ConversationId(conversation_id),
                    UserId(viewer_user_id),
                    limit,
                    None,
                )
                .await?;
            for message in messages {
                let content = if message.is_retracted() {
                    "<retracted>"
                } else {
                    message.content.as_str()
                };
                println!(
                    "{}\t{} -> {}\t{}\t{}",
                    message.message_id.0,
                    message.sender_id.0,
                    message.receiver_id.0,
                    message.status().label(),
                    content,
                );
            }
        }
    }

    Ok(())
}
