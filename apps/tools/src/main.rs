use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::domain::{ChannelId, ServerId, UserId};
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
    CreateServer {
        owner_user_id: i64,
        name: String,
    },
    CreateChannel {
        server_id: i64,
        name: String,
    },
    ListMessages {
        channel_id: i64,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// Only messages with a lower channel sequence number.
        #[arg(long)]
        before: Option<i64>,
    },
    DeleteServer {
        server_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateServer {
            owner_user_id,
            name,
        } => {
            if storage.user_by_id(UserId(owner_user_id)).await?.is_none() {
                bail!("no user with id {owner_user_id}");
            }
            let server = storage.create_server(&name, UserId(owner_user_id)).await?;
            println!(
                "created server_id={} invite_code={}",
                server.server_id.0, server.invite_code
            );
        }
        Command::CreateChannel { server_id, name } => {
            if storage.server_by_id(ServerId(server_id)).await?.is_none() {
                bail!("no server with id {server_id}");
            }
            let channel = storage.create_channel(ServerId(server_id), &name).await?;
            println!(
                "created channel_id={} position={}",
                channel.channel_id.0, channel.position
            );
        }
        Command::ListMessages {
            channel_id,
            limit,
            before,
        } => {
            let messages = storage
                .list_channel_messages(ChannelId(channel_id), limit, before)
                .await?;
            for message in messages.iter().rev() {
                println!(
                    "#{} [{}] {}: {}",
                    message.seq,
                    message.created_at.format("%Y-%m-%d %H:%M:%S"),
                    message.sender_username,
                    message.content
                );
            }
        }
        Command::DeleteServer { server_id } => {
            if storage.delete_server(ServerId(server_id)).await? {
                println!("deleted server_id={server_id}");
            } else {
                bail!("no server with id {server_id}");
            }
        }
    }

    Ok(())
}
