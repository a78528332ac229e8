use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::{
    chat_line::{format_line, format_timestamp},
    domain::canonical_email,
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    ListUsers,
    RevokeSessions {
        email: String,
    },
    History {
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::ListUsers => {
            for user in storage.list_users().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    user.user_id.0,
                    user.user_name,
                    user.email,
                    user.profile_pic.as_deref().unwrap_or("-")
                );
            }
        }
        Command::RevokeSessions { email } => {
            let email = canonical_email(&email);
            let user = storage
                .user_by_email(&email)
                .await?
                .with_context(|| format!("no user with email '{email}'"))?;
            let revoked = storage.delete_sessions_for_user(user.user_id).await?;
            println!("revoked {revoked} session(s) for user_id={}", user.user_id.0);
        }
        Command::History { limit } => {
            for message in storage.list_messages(limit).await? {
                println!(
                    "{}",
                    format_line(
                        &format_timestamp(message.created_at),
                        &message.user_name,
                        &message.body
                    )
                );
            }
        }
    }

    Ok(())
}
