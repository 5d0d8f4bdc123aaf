#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod utils;

use leasechat::config::{load_config, set_config_path_override};
use leasechat::conversation::LocalCollaborators;
use leasechat::transport::WebSocketConnector;
use leasechat::{
    Conversation, ConversationStore, FileUpload, TabKey, TransportConnection, TransportEvent,
};

/// Command line arguments for leasechat
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "leasechat: terminal client for the leasing app's real-time messaging.",
    long_about = "leasechat connects to the messaging server as one user and drives conversations \
    from the terminal.\n\n\
    Type /help once running to list the commands; any other line is sent to the open conversation."
)]
struct Args {
    /// Config file to use instead of the default location
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// WebSocket URL of the messaging server
    #[arg(long, value_name = "URL")]
    server_url: Option<String>,

    /// User id to connect as
    #[arg(long, value_name = "ID")]
    user: Option<String>,

    /// JSON file with the initial conversation list
    #[arg(long, value_name = "PATH")]
    conversations: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn load_conversations(path: &Path) -> Result<Vec<Conversation>> {
    let contents = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let conversations: Vec<Conversation> =
        serde_json::from_str(&contents).with_context(|| format!("Parsing {}", path.display()))?;
    info!("Loaded {} conversations from {}", conversations.len(), path.display());
    Ok(conversations)
}

fn print_help() {
    println!("Commands:");
    println!("  /list                 conversations under the current tab");
    println!("  /tab all|host|tenant  switch tab");
    println!("  /open <id>            open a conversation and show its messages");
    println!("  /typing on|off        send a typing indicator");
    println!("  /new <user>           start a conversation with a user");
    println!("  /delete <id>          delete a conversation");
    println!("  /delete-all           delete every conversation");
    println!("  /file <url> [name]    send a file");
    println!("  /retry                retry the connection now");
    println!("  /reset                close the circuit breaker");
    println!("  /status               connection status and unread counters");
    println!("  /quit                 exit");
    println!("Anything else is sent as a message to the open conversation.");
}

async fn print_conversations(store: &ConversationStore, me: &str) {
    let snapshot = store.snapshot().await;
    let visible = store.visible_conversations().await;
    if visible.is_empty() {
        println!("No conversations under tab {:?}", snapshot.tab);
        return;
    }
    for conversation in visible {
        let marker = if snapshot.active_conversation.as_deref() == Some(conversation.id.as_str()) {
            ">"
        } else {
            " "
        };
        let counterpart = conversation
            .counterpart(me)
            .map(|p| p.profile.first_name.clone().unwrap_or_else(|| p.user_id.clone()))
            .unwrap_or_else(|| "?".to_string());
        let role = conversation.role_of(me).map(|r| r.as_str()).unwrap_or("-");
        let unread = if conversation.is_unread { " (unread)" } else { "" };
        println!(
            "{} {} with {} as {}, {} messages{}",
            marker,
            conversation.id,
            counterpart,
            role,
            conversation.messages.len(),
            unread
        );
    }
}

async fn print_messages(store: &ConversationStore, conversation_id: &str) {
    let Some(conversation) = store.conversation(conversation_id).await else {
        println!("No conversation {}", conversation_id);
        return;
    };
    for message in &conversation.messages {
        let attachment = message
            .img_url
            .as_deref()
            .map(|url| format!(" [{}]", message.file_name.as_deref().unwrap_or(url)))
            .unwrap_or_default();
        println!(
            "  {} {}: {}{} ({:?})",
            message.created_at.format("%H:%M"),
            message.sender_id,
            message.content,
            attachment,
            message.delivery_status
        );
    }
}

fn announce(event: &TransportEvent, me: &str) {
    match event {
        TransportEvent::StatusChanged(status) => println!(
            "[connection] {:?} (failures {}, retry {})",
            status.state, status.failure_count, status.retry_count
        ),
        TransportEvent::Message(message) if message.sender_id != me => {
            println!("[{}] {}: {}", message.conversation_id, message.sender_id, message.content)
        }
        TransportEvent::Typing(typing) if typing.sender_id != me => {
            if typing.is_typing == Some(true) {
                println!("[{}] {} is typing...", typing.conversation_id, typing.sender_id);
            }
        }
        TransportEvent::ReadReceipt(receipt) if receipt.sender_id != me => {
            let count = receipt.message_ids.as_ref().map_or(0, |ids| ids.len());
            println!("[{}] {} read {} messages", receipt.conversation_id, receipt.sender_id, count);
        }
        _ => {}
    }
}

/// Handle one input line. Returns false when the user asked to quit.
async fn handle_line(store: &ConversationStore, transport: &TransportConnection, me: &str, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let Some((command, args)) = utils::parse_command(line) else {
        match store.send_message(line, None).await {
            Some(id) => info!("Queued message {}", id),
            None => println!("Open a conversation first (/open <id>)"),
        }
        return true;
    };

    match command {
        "quit" | "exit" => return false,
        "help" => print_help(),
        "list" => print_conversations(store, me).await,
        "tab" => match args.parse::<TabKey>() {
            Ok(tab) => {
                store.change_tab(tab).await;
                print_conversations(store, me).await;
            }
            Err(e) => println!("{}", e),
        },
        "open" => {
            store.select_conversation(args).await;
            print_messages(store, args).await;
        }
        "typing" => match args {
            "on" => store.send_typing(true).await,
            "off" => store.send_typing(false).await,
            _ => println!("Usage: /typing on|off"),
        },
        "new" => match store.create_conversation(args).await {
            Some(conversation) => println!("Created {}", conversation.id),
            None => println!("Could not create a conversation with {:?}", args),
        },
        "delete" => {
            if store.delete_conversation(args).await {
                println!("Deleted {}", args);
            } else {
                println!("Could not delete {}", args);
            }
        }
        "delete-all" => {
            let deleted = store.delete_all_conversations().await;
            println!("Deleted {} conversations", deleted.len());
        }
        "file" => {
            let mut parts = args.split_whitespace();
            match parts.next() {
                Some(url) => {
                    let name = parts.next().map(str::to_string);
                    let upload = FileUpload {
                        url: Some(url.to_string()),
                        name: name.clone(),
                        ..Default::default()
                    };
                    let caption = name.unwrap_or_else(|| url.to_string());
                    if store.send_message(&caption, Some(upload)).await.is_none() {
                        println!("Open a conversation first (/open <id>)");
                    }
                }
                None => println!("Usage: /file <url> [name]"),
            }
        }
        "retry" => transport.retry_connection(),
        "reset" => transport.reset_circuit(),
        "status" => {
            let status = transport.status();
            let unread = store.unread_counts().await;
            println!(
                "{:?}, failures {}, retry {}; unread host {}, tenant {}",
                status.state, status.failure_count, status.retry_count, unread.host, unread.tenant
            );
        }
        other => println!("Unknown command /{}, try /help", other),
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { LevelFilter::Debug } else { LevelFilter::Info };
    utils::setup_logging(args.log_file.as_deref(), level)?;

    if let Some(path) = &args.config {
        set_config_path_override(path.clone());
    }
    let mut config = load_config()?.apply_env();
    if let Some(url) = args.server_url {
        config.server_url = url;
    }
    if let Some(user) = args.user {
        config.user_id = Some(user);
    }
    let user = config
        .user_id
        .clone()
        .ok_or_else(|| anyhow!("No user id: pass --user or set LEASECHAT_USER_ID"))?;

    let conversations = match &args.conversations {
        Some(path) => load_conversations(path)?,
        None => Vec::new(),
    };

    let connector = Arc::new(WebSocketConnector::new(&config.server_url, &config.transport)?);
    let (transport, events) = TransportConnection::new(config.transport.clone(), connector);
    let store = ConversationStore::new(
        Some(user.clone()),
        conversations,
        Arc::new(transport.clone()),
        LocalCollaborators::new(&user).into_collaborators(),
    );

    // Events are applied on their own task so a send waiting for its ack
    // never stalls the transport's event queue
    let me = user.clone();
    let event_loop = store.spawn_observed_event_loop(events, move |event| announce(event, &me));

    info!("Connecting to {} as {}", config.server_url, user);
    transport.connect(&user);
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !handle_line(&store, &transport, &user, line.trim()).await {
            break;
        }
    }

    info!("Shutting down");
    transport.teardown();
    store.shutdown().await;
    event_loop.abort();
    Ok(())
}
