use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{ChatClient, ChatHandle, ClientError, ClientEvent, SessionStore};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for the group chat server")]
struct Cli {
    #[arg(long, env = "CHAT_SERVER_URL", default_value = "http://127.0.0.1:8000")]
    server_url: String,
    /// Where the login session is kept between runs.
    #[arg(long, env = "CHAT_SESSION_FILE")]
    session_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Register {
        #[arg(long)]
        user_name: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "CHAT_PASSWORD")]
        password: String,
    },
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "CHAT_PASSWORD")]
        password: String,
    },
    Logout,
    Passwd {
        old_password: String,
        new_password: String,
    },
    Avatar {
        file: PathBuf,
    },
    Chat,
}

enum Flow {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let session_file = cli
        .session_file
        .unwrap_or_else(SessionStore::default_path);
    let store = SessionStore::open(&session_file)?;
    let client = Arc::new(ChatClient::new(&cli.server_url, store)?);

    match cli.command.unwrap_or(Command::Chat) {
        Command::Register {
            user_name,
            email,
            password,
        } => {
            let message = client.register(&user_name, &email, &password).await?;
            println!("{message}");
        }
        Command::Login { email, password } => {
            let session = client.login(&email, &password).await?;
            println!(
                "Logged in as {}",
                session.username.as_deref().unwrap_or(&session.email)
            );
        }
        Command::Logout => {
            client.logout().await?;
            println!("Logged out");
        }
        Command::Passwd {
            old_password,
            new_password,
        } => {
            require_session(client.as_ref()).await?;
            let message = client.change_password(&old_password, &new_password).await?;
            println!("{message}");
        }
        Command::Avatar { file } => {
            require_session(client.as_ref()).await?;
            let url = client.upload_profile_pic(&file).await?;
            println!("Profile picture set to {url}");
        }
        Command::Chat => run_chat(client).await?,
    }
    Ok(())
}

async fn require_session(client: &ChatClient) -> Result<()> {
    if let Err(err) = client.restore().await {
        if matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::NotAuthenticated)
        ) {
            anyhow::bail!("not logged in; run `desktop login --email <email>` first");
        }
        return Err(err);
    }
    Ok(())
}

async fn run_chat(client: Arc<ChatClient>) -> Result<()> {
    require_session(client.as_ref()).await?;
    print_account(client.as_ref()).await;

    match client.load_history().await {
        Ok(history) => history.iter().for_each(|msg| println!("{msg}")),
        Err(err) => eprintln!("could not load history: {err}"),
    }

    let mut events = client.subscribe_events();
    client.connect(false).await?;
    println!("Type a message and press enter. /menu for account actions, /quit to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ClientEvent::Connected) => println!("-- connected --"),
                Ok(ClientEvent::Message(msg)) => println!("{msg}"),
                Ok(ClientEvent::SessionRejected) => {
                    println!("Session expired. Please log in again.");
                    client.logout().await?;
                    break;
                }
                Ok(ClientEvent::Disconnected) => {
                    println!("-- disconnected --");
                    break;
                }
                Ok(ClientEvent::Error(err)) => eprintln!("connection error: {err}"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "chat output fell behind"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if let Flow::Quit = handle_input(client.as_ref(), &line).await {
                    break;
                }
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

async fn handle_input(client: &ChatClient, line: &str) -> Flow {
    let line = line.trim();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let result = match command {
        "/quit" => return Flow::Quit,
        "/logout" => match client.logout().await {
            Ok(()) => {
                println!("Logged out");
                return Flow::Quit;
            }
            Err(err) => Err(err),
        },
        "/menu" => {
            print_account(client).await;
            println!("/avatar <file>  /passwd <old> <new>  /history  /logout  /quit");
            Ok(())
        }
        "/history" => client.load_history().await.map(|history| {
            history.iter().for_each(|msg| println!("{msg}"));
        }),
        "/avatar" => match rest.trim() {
            "" => {
                println!("usage: /avatar <file>");
                Ok(())
            }
            file => client
                .upload_profile_pic(Path::new(file))
                .await
                .map(|url| println!("Profile picture set to {url}")),
        },
        "/passwd" => {
            let mut words = rest.split_whitespace();
            let old_password = words.next().unwrap_or_default();
            let new_password = words.next().unwrap_or_default();
            client
                .change_password(old_password, new_password)
                .await
                .map(|message| println!("{message}"))
        }
        _ if command.starts_with('/') => {
            println!("unknown command {command}; try /menu");
            Ok(())
        }
        _ => client.send_message(line).await.map(|sent| {
            if !sent && !line.is_empty() {
                println!("not connected; message not sent");
            }
        }),
    };
    if let Err(err) = result {
        eprintln!("{err}");
    }
    Flow::Continue
}

async fn print_account(client: &ChatClient) {
    match client.account().await {
        Ok(account) => {
            println!(
                "Signed in as {} <{}>",
                account.username.as_deref().unwrap_or("?"),
                account.email
            );
            println!(
                "Profile picture: {}",
                account.profile_pic.as_deref().unwrap_or("none")
            );
        }
        Err(err) => eprintln!("{err}"),
    }
}
