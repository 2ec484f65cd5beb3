/**
 * Campus Chat CLI
 *
 * Opens one project conversation, prints its history and tails new
 * messages. The bearer token is read from CAMPUS_TOKEN.
 *
 *   campus-chat <project-id> [message to send]
 */
use campus_chat::client::{ConversationReconciler, HttpApi, Ingested, RealtimeClient, TokenStore};
use campus_chat::shared::{AppConfig, ConnectionEvent, Message};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

const ENV_TOKEN: &str = "CAMPUS_TOKEN";

fn print_message(message: &Message) {
    let time = message
        .created_at_utc()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "--".to_string());
    println!("[{}] {}: {}", time, message.sender_display_name(), message.content);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let project_id: i64 = match args.next().map(|raw| raw.parse()) {
        Some(Ok(id)) => id,
        _ => {
            eprintln!("Usage: campus-chat <project-id> [message to send]");
            std::process::exit(2);
        }
    };
    let outgoing: Vec<String> = args.collect();

    let config = AppConfig::load_layered()?;
    let tokens = Arc::new(match std::env::var(ENV_TOKEN) {
        Ok(token) if !token.trim().is_empty() => TokenStore::with_token(token.trim()),
        _ => TokenStore::new(),
    });

    let client = RealtimeClient::spawn_with_rotations(&config, tokens.clone(), tokens.rotations())?;
    let mut events = client.events();
    client.connect().await?;

    let api = HttpApi::new(config.clone(), tokens);
    let mut reconciler =
        ConversationReconciler::new(api, client.clone(), config.topic_prefix.clone());

    if let Err(e) = reconciler.load_conversations().await {
        tracing::warn!("[CLI] Could not list projects: {}", e);
    }
    reconciler.select(project_id).await?;

    if let Some(conversation) = reconciler.conversation(project_id) {
        println!("== {} ==", conversation.title);
        for message in &conversation.messages {
            print_message(message);
        }
    }

    if !outgoing.is_empty() {
        reconciler.send_message(&outgoing.join(" ")).await?;
    }

    loop {
        tokio::select! {
            frame = reconciler.recv_frame() => {
                let Some(frame) = frame else { break };
                match reconciler.ingest(&frame).await {
                    Ingested::Appended { conversation_id, message_id, .. } => {
                        let message = reconciler
                            .conversation(conversation_id)
                            .and_then(|c| c.messages.iter().find(|m| m.id == message_id));
                        if conversation_id == project_id {
                            if let Some(message) = message {
                                print_message(message);
                            }
                        } else if let Some(conversation) = reconciler.conversation(conversation_id) {
                            println!("({} unread in {})", conversation.unread_count, conversation.title);
                        }
                    }
                    _ => {}
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) if event.is_terminal_error() => {
                        if let ConnectionEvent::Error(error) = event {
                            eprintln!("{}", error);
                        }
                        break;
                    }
                    Ok(ConnectionEvent::Reconnecting { attempt, delay_ms }) => {
                        eprintln!("connection lost, retry {} in {}ms", attempt, delay_ms);
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    reconciler.close().await;
    client.shutdown().await;
    Ok(())
}
