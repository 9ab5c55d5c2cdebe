//! Realtime device-state channel.
//!
//! The dealer is a WebSocket pushing player and device state changes to the
//! web player. A channel goes through these states:
//!
//! ```text
//! Connecting -> AwaitingInitPacket -> Connected -> Registered -> Streaming
//! ```
//!
//! The first frame announces the connection id. It is required to register
//! this client as a (hidden) device and to subscribe to connect-state,
//! after which state updates are pushed over the socket.
//!
//! # Concurrency
//!
//! The socket is shared between the keep-alive task, the receive loop of an
//! [`EventManager`](crate::events::EventManager) and [`Channel::close`]. A
//! single lock serialises all socket access and is held for one send or for
//! one bounded receive attempt only. Background tasks stop on
//! [`Channel::close`] or when the channel is dropped.
//!
//! # Example
//!
//! ```rust
//! use spotweb::dealer::Channel;
//!
//! let channel = Channel::connect(&login, &config).await?;
//! channel.register_device().await?;
//! let cluster = channel.connect_device().await?;
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use reqwest::{
    header::{HeaderValue, USER_AGENT},
    Method,
};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    auth::login::Login,
    config::{Config, Endpoints},
    error::{Error, ErrorKind, Result},
    http,
    protocol::{
        self,
        connect_state::{self, Cluster, Device, PlayerState, RegisterDevice, Track},
        dealer::{Frame, PING},
    },
    session::Session,
    util,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Header addressing connect-state calls to a dealer connection.
const CONNECTION_ID_HEADER: &str = "x-spotify-connection-id";

/// Lifecycle of a realtime channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelState {
    Connecting,
    AwaitingInitPacket,
    Connected,
    Registered,
    Streaming,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

pub struct Channel {
    socket: Arc<Mutex<Socket>>,
    session: Mutex<Session>,
    http: Arc<http::Client>,
    endpoints: Endpoints,

    device_id: String,
    device_name: String,
    connection_id: String,

    state: std::sync::Mutex<ChannelState>,
    snapshot: std::sync::Mutex<Option<Cluster>>,

    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Channel {
    /// Interval between keep-alive pings.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

    /// Longest time a single receive attempt holds the socket.
    const RECEIVE_SLICE: Duration = Duration::from_secs(1);

    /// Opens a channel for an authenticated login with a random device id.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::FailedPrecondition`] if `login` is not
    /// authenticated, and error if tokens cannot be acquired or the socket
    /// does not announce a connection id.
    pub async fn connect(login: &Login, config: &Config) -> Result<Self> {
        Self::connect_as(login, config, &util::random_hex(32)).await
    }

    /// Opens a channel presenting this client as `device_id`.
    ///
    /// # Errors
    ///
    /// As [`connect`](Self::connect).
    pub async fn connect_as(login: &Login, config: &Config, device_id: &str) -> Result<Self> {
        if !login.is_authenticated() {
            return Err(Error::failed_precondition(
                "realtime channel requires an authenticated login",
            ));
        }

        let session =
            Session::with_secrets(Arc::clone(login.http()), config, Arc::clone(login.secrets()));
        Self::open(session, config, device_id).await
    }

    /// Opens a channel with a session that already holds its tokens.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::RealtimeChannel`] if the socket cannot be opened
    /// or closes early, and [`ErrorKind::Validation`] if the first frame
    /// lacks the connection id.
    pub async fn open(mut session: Session, config: &Config, device_id: &str) -> Result<Self> {
        session.acquire_client_token().await?;
        let access_token = session
            .access_token()
            .map(|token| token.token.clone())
            .ok_or_else(|| Error::session("no access token for realtime channel"))?;

        let mut url = config.endpoints.dealer.clone();
        url.query_pairs_mut()
            .append_pair("access_token", &access_token);

        let mut request = url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_str(&config.user_agent)?);

        debug!("connecting to {}", redacted(&url));
        let (mut socket, _) = tokio_tungstenite::connect_async(request).await?;

        let connection_id = Self::await_init_packet(&mut socket).await?;
        info!("realtime channel connected");
        trace!("connection id: {connection_id}");

        let channel = Self {
            socket: Arc::new(Mutex::new(socket)),
            http: Arc::clone(session.http()),
            endpoints: config.endpoints.clone(),
            session: Mutex::new(session),

            device_id: device_id.to_owned(),
            device_name: config.device_name.clone(),
            connection_id,

            state: std::sync::Mutex::new(ChannelState::Connected),
            snapshot: std::sync::Mutex::new(None),

            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        };
        channel.start_keepalive();

        Ok(channel)
    }

    async fn await_init_packet(socket: &mut Socket) -> Result<String> {
        loop {
            let message = socket
                .next()
                .await
                .ok_or_else(|| Error::realtime("connection closed before init packet"))??;

            match message {
                Message::Text(text) => {
                    let frame: Frame = protocol::json(&text, "dealer init")?;
                    return frame
                        .connection_id()
                        .map(ToOwned::to_owned)
                        .ok_or_else(|| {
                            Error::validation("init packet lacks a connection id")
                                .with_upstream(text.as_str())
                        });
                }
                Message::Close(payload) => {
                    return Err(Error::realtime(format!(
                        "connection closed before init packet: {payload:?}"
                    )));
                }
                _ => trace!("skipping non-text frame before init packet"),
            }
        }
    }

    fn start_keepalive(&self) {
        let socket = Arc::clone(&self.socket);
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(Self::KEEPALIVE_INTERVAL) => {
                        let mut socket = socket.lock().await;
                        if let Err(e) = socket.send(Message::text(PING)).await {
                            debug!("keep-alive stopped: {e}");
                            break;
                        }
                        trace!("keep-alive ping sent");
                    }
                }
            }
        });
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    #[must_use]
    pub fn http(&self) -> &Arc<http::Client> {
        &self.http
    }

    /// Token cancelled when the channel closes.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns error if the state lock is poisoned.
    pub fn channel_state(&self) -> Result<ChannelState> {
        Ok(*self.state.lock()?)
    }

    fn advance(&self, next: ChannelState) -> Result<()> {
        let mut state = self.state.lock()?;
        if *state < next {
            debug!("realtime channel: {} -> {next}", *state);
            *state = next;
        }
        Ok(())
    }

    /// Authorizes and executes `request` with the channel's session.
    ///
    /// # Errors
    ///
    /// Returns error if the tokens are rejected or the status is not a
    /// success; other failures are classified as `kind`.
    pub async fn send_authorized(
        &self,
        request: reqwest::Request,
        kind: ErrorKind,
    ) -> Result<reqwest::Response> {
        self.session
            .lock()
            .await
            .send_authorized(request, kind)
            .await
    }

    /// Registers this client as a device for the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::RealtimeChannel`] if registration is rejected.
    pub async fn register_device(&self) -> Result<()> {
        let url = self.endpoints.spclient.join("track-playback/v1/devices")?;
        let body = RegisterDevice::new(&self.device_id, &self.device_name, &self.connection_id);
        let request = self.http.json(Method::POST, url, &body)?;

        self.send_authorized(request, ErrorKind::RealtimeChannel)
            .await?;
        self.advance(ChannelState::Registered)?;
        info!("registered device {}", self.device_name);
        Ok(())
    }

    /// Subscribes to connect-state and returns the current cluster.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::RealtimeChannel`] if the request is rejected and
    /// [`ErrorKind::Validation`] if the cluster cannot be parsed.
    pub async fn connect_device(&self) -> Result<Cluster> {
        let url = self
            .endpoints
            .spclient
            .join(&format!("connect-state/v1/devices/hobs_{}", self.device_id))?;
        let mut request =
            self.http
                .json(Method::PUT, url, &connect_state::connect_request())?;
        request
            .headers_mut()
            .insert(CONNECTION_ID_HEADER, HeaderValue::from_str(&self.connection_id)?);

        let response = self
            .send_authorized(request, ErrorKind::RealtimeChannel)
            .await?;
        let body = response.text().await?;
        let cluster: Cluster = protocol::json(&body, "connect-state")?;

        self.advance(ChannelState::Streaming)?;
        Ok(cluster)
    }

    /// Pulls a fresh cluster and replaces the saved snapshot.
    ///
    /// # Errors
    ///
    /// As [`connect_device`](Self::connect_device).
    pub async fn renew_state(&self) -> Result<Cluster> {
        let cluster = self.connect_device().await?;
        *self.snapshot.lock()? = Some(cluster.clone());
        Ok(cluster)
    }

    /// Replaces the saved snapshot with the last cluster pushed in `frame`.
    /// Returns whether the frame carried one.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Validation`] if a pushed cluster is malformed.
    pub fn absorb(&self, frame: &Frame) -> Result<bool> {
        let Some(pushed) = frame
            .updates()
            .filter_map(|(_, payload)| payload.get("cluster"))
            .last()
        else {
            return Ok(false);
        };

        let cluster: Cluster = serde_json::from_value(pushed.clone())?;
        *self.snapshot.lock()? = Some(cluster);
        Ok(true)
    }

    /// Last pulled or pushed cluster, without network access.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot lock is poisoned.
    pub fn saved_state(&self) -> Result<Option<Cluster>> {
        Ok(self.snapshot.lock()?.clone())
    }

    /// Devices of the saved cluster, without network access.
    ///
    /// # Errors
    ///
    /// As [`saved_state`](Self::saved_state).
    pub fn saved_devices(&self) -> Result<HashMap<String, Device>> {
        Ok(self
            .saved_state()?
            .map(|cluster| cluster.devices)
            .unwrap_or_default())
    }

    /// Pulls the current player state.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::RealtimeChannel`] if no player is active.
    pub async fn state(&self) -> Result<PlayerState> {
        self.renew_state()
            .await?
            .player_state
            .ok_or_else(|| Error::realtime("no player state available"))
    }

    /// Pulls the current devices.
    ///
    /// # Errors
    ///
    /// As [`renew_state`](Self::renew_state).
    pub async fn devices(&self) -> Result<HashMap<String, Device>> {
        Ok(self.renew_state().await?.devices)
    }

    /// Pulls the id of the device currently playing, if any.
    ///
    /// # Errors
    ///
    /// As [`renew_state`](Self::renew_state).
    pub async fn active_device_id(&self) -> Result<Option<String>> {
        Ok(self.renew_state().await?.active_device_id)
    }

    /// Pulls the queue of upcoming tracks.
    ///
    /// # Errors
    ///
    /// As [`state`](Self::state).
    pub async fn next_tracks(&self) -> Result<Vec<Track>> {
        Ok(self.state().await?.next_tracks)
    }

    /// Pulls the next track in the queue.
    ///
    /// # Errors
    ///
    /// As [`state`](Self::state).
    pub async fn next_track(&self) -> Result<Option<Track>> {
        Ok(self.next_tracks().await?.into_iter().next())
    }

    /// Pulls the recently played tracks, oldest first.
    ///
    /// # Errors
    ///
    /// As [`state`](Self::state).
    pub async fn previous_tracks(&self) -> Result<Vec<Track>> {
        Ok(self.state().await?.prev_tracks)
    }

    /// Pulls the most recently played track.
    ///
    /// # Errors
    ///
    /// As [`state`](Self::state).
    pub async fn last_played(&self) -> Result<Option<Track>> {
        Ok(self.previous_tracks().await?.pop())
    }

    /// Receives the next frame.
    ///
    /// Holds the socket for at most a short slice; returns `None` if nothing
    /// arrived in that time or a non-text frame was read.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::RealtimeChannel`] when the connection is closed
    /// and [`ErrorKind::Validation`] for undecodable frames.
    pub async fn receive(&self) -> Result<Option<Frame>> {
        let next = {
            let mut socket = self.socket.lock().await;
            match tokio::time::timeout(Self::RECEIVE_SLICE, socket.next()).await {
                Ok(next) => next,
                Err(_) => return Ok(None),
            }
        };

        match next {
            Some(Ok(Message::Text(text))) => protocol::json(&text, "dealer").map(Some),
            Some(Ok(Message::Close(payload))) => Err(Error::realtime(format!(
                "connection closed by server: {payload:?}"
            ))),
            Some(Ok(_)) => Ok(None),
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::realtime("connection closed")),
        }
    }

    /// Stops the background tasks and closes the socket.
    ///
    /// Only the first call has an effect.
    ///
    /// # Errors
    ///
    /// Returns error if the close handshake cannot be sent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.cancel.cancel();
        if let Ok(mut state) = self.state.lock() {
            *state = ChannelState::Closed;
        }

        let mut socket = self.socket.lock().await;
        match socket.close(None).await {
            Ok(())
            | Err(
                tokio_tungstenite::tungstenite::Error::ConnectionClosed
                | tokio_tungstenite::tungstenite::Error::AlreadyClosed,
            ) => {
                info!("realtime channel closed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Strips the access token from a dealer URL for logging.
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}
