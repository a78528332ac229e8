use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{multipart, Client, Response, StatusCode};
use serde::Deserialize;
use shared::{
    domain::SessionToken,
    protocol::{
        ChangePasswordRequest, HistoryEntry, LoginRequest, LoginResponse, ProfilePicResponse,
        RegisterRequest, StatusMessage,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::frame::coding::CloseCode, Message},
};
use tracing::{error, info, warn};
use url::Url;

pub mod error;
pub mod render;
pub mod session_store;

pub use error::ClientError;
pub use render::{ChatView, RenderedMessage, Side};
pub use session_store::{Session, SessionStore};

const SOCKET_CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Message(RenderedMessage),
    Disconnected,
    /// The server refused the stored token; the user has to log in again.
    SessionRejected,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub username: Option<String>,
    pub email: String,
    pub profile_pic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<String>,
}

#[async_trait]
pub trait ChatHandle: Send + Sync {
    async fn register(&self, user_name: &str, email: &str, password: &str) -> Result<String>;
    async fn login(&self, email: &str, password: &str) -> Result<Session>;
    async fn restore(&self) -> Result<Session>;
    async fn account(&self) -> Result<AccountInfo>;
    async fn load_history(&self) -> Result<Vec<RenderedMessage>>;
    async fn connect(&self, replay_history: bool) -> Result<()>;
    async fn send_message(&self, text: &str) -> Result<bool>;
    async fn upload_profile_pic(&self, path: &Path) -> Result<String>;
    async fn fetch_profile_pic(&self) -> Result<Option<String>>;
    async fn change_password(&self, old_password: &str, new_password: &str) -> Result<String>;
    async fn logout(&self) -> Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

pub struct ChatClient {
    http: Client,
    server_url: Url,
    store: Mutex<SessionStore>,
    view: Arc<Mutex<ChatView>>,
    socket: Mutex<Option<ActiveSocket>>,
    events: broadcast::Sender<ClientEvent>,
}

struct ActiveSocket {
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl ChatClient {
    pub fn new(server_url: &str, store: SessionStore) -> Result<Self> {
        let server_url = Url::parse(server_url)
            .with_context(|| format!("invalid server url '{server_url}'"))?;
        if !matches!(server_url.scheme(), "http" | "https") {
            return Err(anyhow!("server url must start with http:// or https://"));
        }
        let username = store
            .get_item("username")
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            http: Client::new(),
            server_url,
            store: Mutex::new(store),
            view: Arc::new(Mutex::new(ChatView::new(username))),
            socket: Mutex::new(None),
            events,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.server_url
            .join(path)
            .with_context(|| format!("invalid endpoint path '{path}'"))
    }

    fn socket_url(&self, token: &SessionToken, replay_history: bool) -> Result<Url> {
        let mut url = self.endpoint(&format!("ws/{token}"))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket url from '{}'", self.server_url))?;
        if !replay_history {
            url.query_pairs_mut().append_pair("history", "false");
        }
        Ok(url)
    }

    async fn session(&self) -> Result<Session> {
        Ok(self.store.lock().await.authenticated()?)
    }

    pub async fn is_connected(&self) -> bool {
        self.socket
            .lock()
            .await
            .as_ref()
            .is_some_and(|socket| socket.open.load(Ordering::SeqCst))
    }

    /// Closes the live socket, if any, and waits briefly for the reader to finish.
    pub async fn disconnect(&self) {
        let Some(socket) = self.socket.lock().await.take() else {
            return;
        };
        let _ = socket.outbound.send(Message::Close(None));
        drop(socket.outbound);

        let mut reader_task = socket.reader_task;
        if tokio::time::timeout(SOCKET_CLOSE_GRACE, &mut reader_task)
            .await
            .is_err()
        {
            reader_task.abort();
        }
        socket.writer_task.abort();
    }
}

async fn server_error(res: Response) -> ClientError {
    let status = res.status().as_u16();
    let detail = res
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|body| body.detail)
        .unwrap_or_else(|| format!("request failed with status {status}"));
    ClientError::Server { status, detail }
}

/// Like `server_error`, but a 401 on a token route means the stored session is gone.
async fn token_route_error(res: Response) -> ClientError {
    if res.status() == StatusCode::UNAUTHORIZED {
        warn!("server rejected the session token");
        return ClientError::SessionRejected;
    }
    server_error(res).await
}

fn spawn_reader<S>(
    mut reader: S,
    view: Arc<Mutex<ChatView>>,
    events: broadcast::Sender<ClientEvent>,
    open: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = reader.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let rendered = view.lock().await.render(&text);
                    let _ = events.send(ClientEvent::Message(rendered));
                }
                Ok(Message::Close(frame)) => {
                    if frame.is_some_and(|frame| frame.code == CloseCode::Policy) {
                        warn!("server rejected the session token");
                        let _ = events.send(ClientEvent::SessionRejected);
                    }
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    error!(%err, "WebSocket error");
                    let _ = events.send(ClientEvent::Error(err.to_string()));
                    break;
                }
            }
        }
        open.store(false, Ordering::SeqCst);
        info!("Disconnected from server");
        let _ = events.send(ClientEvent::Disconnected);
    })
}

#[async_trait]
impl ChatHandle for ChatClient {
    async fn register(&self, user_name: &str, email: &str, password: &str) -> Result<String> {
        if user_name.trim().is_empty() || email.trim().is_empty() || password.is_empty() {
            return Err(ClientError::MissingFields.into());
        }
        let res = self
            .http
            .post(self.endpoint("register")?)
            .json(&RegisterRequest {
                user_name: user_name.trim().to_string(),
                email: email.trim().to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(server_error(res).await.into());
        }
        let body: StatusMessage = res.json().await?;
        Ok(body.message)
    }

    async fn login(&self, email: &str, password: &str) -> Result<Session> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(ClientError::MissingFields.into());
        }
        let res = self
            .http
            .post(self.endpoint("login")?)
            .json(&LoginRequest {
                email: email.trim().to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(server_error(res).await.into());
        }
        let body: LoginResponse = res.json().await?;

        let session = {
            let mut store = self.store.lock().await;
            store.save_login(
                &body.token,
                &body.user_name,
                &body.email,
                body.profile_pic.as_deref(),
            )?;
            store.authenticated()?
        };
        self.view
            .lock()
            .await
            .set_username(Some(body.user_name.clone()));
        info!(user_name = %body.user_name, "logged in");
        Ok(session)
    }

    async fn restore(&self) -> Result<Session> {
        let session = self.session().await?;
        self.view
            .lock()
            .await
            .set_username(session.username.clone());
        Ok(session)
    }

    async fn account(&self) -> Result<AccountInfo> {
        let store = self.store.lock().await;
        let session = store.authenticated()?;
        Ok(AccountInfo {
            profile_pic: store.profile_pic(&session.email).map(str::to_string),
            username: session.username,
            email: session.email,
        })
    }

    async fn load_history(&self) -> Result<Vec<RenderedMessage>> {
        let res = match self.http.get(self.endpoint("messages")?).send().await {
            Ok(res) => res,
            Err(err) => {
                error!(%err, "History load failed");
                return Err(err.into());
            }
        };
        if !res.status().is_success() {
            warn!(status = %res.status(), "history unavailable");
            return Ok(Vec::new());
        }
        let entries: Vec<HistoryEntry> = res.json().await.map_err(|err| {
            error!(%err, "History load failed");
            err
        })?;

        let mut view = self.view.lock().await;
        view.reset();
        Ok(entries
            .iter()
            .map(|entry| view.render(&entry.to_line()))
            .collect())
    }

    async fn connect(&self, replay_history: bool) -> Result<()> {
        let session = self.session().await?;
        let mut guard = self.socket.lock().await;
        if guard
            .as_ref()
            .is_some_and(|socket| socket.open.load(Ordering::SeqCst))
        {
            return Ok(());
        }

        let url = self.socket_url(&session.token, replay_history)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .context("failed to connect websocket")?;
        let (mut ws_writer, ws_reader) = ws_stream.split();
        info!("Connected to server");

        let open = Arc::new(AtomicBool::new(true));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });
        let reader_task = spawn_reader(
            ws_reader,
            Arc::clone(&self.view),
            self.events.clone(),
            Arc::clone(&open),
        );

        if let Some(previous) = guard.replace(ActiveSocket {
            outbound,
            open,
            reader_task,
            writer_task,
        }) {
            previous.reader_task.abort();
            previous.writer_task.abort();
        }
        let _ = self.events.send(ClientEvent::Connected);
        Ok(())
    }

    async fn send_message(&self, text: &str) -> Result<bool> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(false);
        }
        let guard = self.socket.lock().await;
        let Some(socket) = guard
            .as_ref()
            .filter(|socket| socket.open.load(Ordering::SeqCst))
        else {
            return Ok(false);
        };
        socket
            .outbound
            .send(Message::Text(text.to_string()))
            .map_err(|_| ClientError::NotConnected)?;
        Ok(true)
    }

    async fn upload_profile_pic(&self, path: &Path) -> Result<String> {
        let session = self.session().await?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "profile.jpg".to_string());
        let form = multipart::Form::new().part("file", multipart::Part::bytes(bytes).file_name(filename));

        let res = match self
            .http
            .post(self.endpoint(&format!("upload-profile-pic/{}", session.token))?)
            .multipart(form)
            .send()
            .await
        {
            Ok(res) => res,
            Err(err) => {
                error!(%err, "Upload error");
                return Err(err.into());
            }
        };
        if !res.status().is_success() {
            return Err(ClientError::UploadFailed {
                status: res.status().as_u16(),
            }
            .into());
        }
        let body: ProfilePicResponse = res.json().await?;
        let url = body
            .profile_pic
            .ok_or_else(|| anyhow!("server did not return a profile picture url"))?;

        self.store
            .lock()
            .await
            .set_profile_pic(&session.email, &url)?;
        info!(%url, "profile picture updated");
        Ok(url)
    }

    async fn fetch_profile_pic(&self) -> Result<Option<String>> {
        let session = self.session().await?;
        let res = self
            .http
            .get(self.endpoint(&format!("profile-pic/{}", session.token))?)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(token_route_error(res).await.into());
        }
        let body: ProfilePicResponse = res.json().await?;
        if let Some(url) = &body.profile_pic {
            self.store
                .lock()
                .await
                .set_profile_pic(&session.email, url)?;
        }
        Ok(body.profile_pic)
    }

    async fn change_password(&self, old_password: &str, new_password: &str) -> Result<String> {
        if old_password.is_empty() || new_password.is_empty() {
            return Err(ClientError::MissingFields.into());
        }
        let session = self.session().await?;
        let res = self
            .http
            .post(self.endpoint(&format!("change-password/{}", session.token))?)
            .json(&ChangePasswordRequest {
                old_password: old_password.to_string(),
                new_password: new_password.to_string(),
            })
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(token_route_error(res).await.into());
        }
        Ok("Password updated successfully".to_string())
    }

    async fn logout(&self) -> Result<()> {
        self.disconnect().await;
        self.store.lock().await.clear_session()?;
        let mut view = self.view.lock().await;
        view.set_username(None);
        view.reset();
        info!("logged out");
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
