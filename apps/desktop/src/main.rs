use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    ClientConfig, ClientError, ClientEvent, ClientHandle, FileSessionStore, RealtimeClient,
};
use shared::{
    domain::ChannelId,
    protocol::{MessagePayload, UserProfile},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Terminal chat client.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    server_url: String,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Create the account before logging in.
    #[arg(long)]
    register: bool,
    /// Where the bearer token is kept between runs.
    #[arg(long)]
    session_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let store = Arc::new(FileSessionStore::new(session_path(&args)?));
    let client = RealtimeClient::new(ClientConfig::new(args.server_url.clone()), store)?;

    let restored = if args.register {
        None
    } else {
        match client.restore().await {
            Ok(user) => user,
            Err(ClientError::AuthFailure(_)) => None,
            Err(err) => return Err(err.into()),
        }
    };
    let user = match restored {
        Some(user) => user,
        None => sign_in(&client, &args).await?,
    };
    println!("signed in as {} (id {})", user.username, user.user_id);

    let printer = tokio::spawn(print_events(client.subscribe_events()));
    open_home(&client).await?;
    run_repl(&client).await?;
    printer.abort();
    Ok(())
}

fn session_path(args: &Args) -> Result<PathBuf> {
    if let Some(path) = &args.session_file {
        return Ok(path.clone());
    }
    let base = dirs::data_local_dir().context("unable to resolve local app data dir")?;
    Ok(base.join("quicklink").join("session.json"))
}

async fn sign_in(client: &dyn ClientHandle, args: &Args) -> Result<UserProfile> {
    let username = args
        .username
        .as_deref()
        .context("--username is required when there is no saved session")?;
    let password = args
        .password
        .as_deref()
        .context("--password is required when there is no saved session")?;
    let user = if args.register {
        client.register(username, password).await?
    } else {
        client.login(username, password).await?
    };
    Ok(user)
}

/// Selects the first server, creating one when the user has none.
async fn open_home(client: &dyn ClientHandle) -> Result<()> {
    let servers = client.list_servers().await?;
    let server = match servers.into_iter().next() {
        Some(server) => server,
        None => client.create_server("Home").await?,
    };
    let channels = client.select_server(server.server_id).await?;
    println!("server {} ({})", server.name, server.server_id);
    if let Some(invite) = &server.invite_code {
        println!("  invite code: {invite}");
    }
    for channel in channels {
        println!("  #{} (id {})", channel.name, channel.channel_id);
    }
    Ok(())
}

async fn run_repl(client: &dyn ClientHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let outcome = match command {
            "/quit" => return Ok(()),
            "/logout" => {
                client.logout().await?;
                println!("logged out");
                return Ok(());
            }
            "/servers" => list_servers(client).await,
            "/channel" => match rest.parse::<i64>() {
                Ok(id) => client.select_channel(ChannelId(id)).await,
                Err(_) => {
                    println!("usage: /channel <id>");
                    Ok(())
                }
            },
            "/join" if !rest.is_empty() => match client.join_with_invite(rest).await {
                Ok(server) => {
                    client.select_server(server.server_id).await.map(|_| ())
                }
                Err(err) => Err(err),
            },
            "/join" => {
                println!("usage: /join <invite code>");
                Ok(())
            }
            _ => client.send_message(line).await.map(|_| ()),
        };
        match outcome {
            Ok(()) => {}
            Err(ClientError::AuthFailure(message)) => {
                eprintln!("signed out by the server: {message}");
                return Ok(());
            }
            Err(err) => eprintln!("error: {err}"),
        }
    }
    Ok(())
}

async fn list_servers(client: &dyn ClientHandle) -> Result<(), ClientError> {
    for server in client.list_servers().await? {
        println!("{} (id {})", server.name, server.server_id);
        for channel in client.list_channels(server.server_id).await? {
            println!("  #{} (id {})", channel.name, channel.channel_id);
        }
    }
    Ok(())
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::ViewReset(view)) => {
                println!("--- channel {} ---", view.channel_id);
                view.messages.iter().for_each(print_message);
            }
            Ok(ClientEvent::MessagesAppended { messages, .. }) => {
                messages.iter().for_each(print_message);
            }
            Ok(ClientEvent::SessionStateChanged { state, reason }) => match reason {
                Some(reason) => eprintln!("[session {state:?}: {reason:?}]"),
                None => eprintln!("[session {state:?}]"),
            },
            Ok(ClientEvent::SessionInvalidated) => {
                eprintln!("[session expired; restart to log in again]");
            }
            Ok(ClientEvent::ViewStale { .. }) => {}
            Ok(ClientEvent::Error(message)) => eprintln!("[error] {message}"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}

fn print_message(message: &MessagePayload) {
    println!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M:%S"),
        message.sender.username,
        message.content
    );
}
