//! Device side of the controller connection.
//!
//! A session registers the device identity, learns its detector id and then
//! answers commands until the controller goes away. Any active stream is
//! stopped before the session is dropped.

use crate::{
    camera::{EncodedImage, Encoding, FrameSource},
    protocol::{Command, DetectorId},
    stream::{StreamConfig, Streamer},
};

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_tungstenite::{
    connect_async_tls_with_config, tungstenite, tungstenite::Message, Connector, MaybeTlsStream,
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub(crate) enum SessionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("tls error: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("controller closed the connection before assigning an id")]
    Closed,
    #[error("invalid detector id {0:?}")]
    InvalidDetectorId(String),
    #[error("snapshot failed: {0}")]
    Snapshot(#[source] BoxError),
}

fn snapshot_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> SessionError {
    SessionError::Snapshot(Box::new(err))
}

#[derive(Clone, Debug)]
pub(crate) struct SessionConfig {
    pub identity: String,
    /// Accept a new detector id sent as a bare number mid-session.
    pub follow_reassignment: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity: "121212121212".into(),
            follow_reassignment: false,
        }
    }
}

/// Open the control connection. `insecure` skips certificate verification.
pub(crate) async fn connect(
    url: &str,
    insecure: bool,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, SessionError> {
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(insecure)
        .danger_accept_invalid_hostnames(insecure)
        .build()?;

    let (ws, response) =
        connect_async_tls_with_config(url, None, false, Some(Connector::NativeTls(tls))).await?;
    info!("connected to controller at {url} ({})", response.status());
    Ok(ws)
}

/// Next textual message, or `None` once the peer has closed.
///
/// Binary messages holding UTF-8 are read as text; control frames are skipped.
async fn next_text<S>(ws: &mut WebSocketStream<S>) -> Result<Option<String>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = ws.next().await {
        match message? {
            Message::Text(text) => return Ok(Some(text)),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => return Ok(Some(text)),
                Err(e) => warn!("ignoring {} byte binary message", e.as_bytes().len()),
            },
            Message::Close(frame) => {
                debug!(?frame, "received close frame");
                return Ok(None);
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    Ok(None)
}

pub(crate) struct ControlSession<S, F> {
    ws: WebSocketStream<S>,
    detector_id: DetectorId,
    camera: Arc<F>,
    streamer: Streamer<F>,
    follow_reassignment: bool,
}

impl<S, F> ControlSession<S, F>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FrameSource + 'static,
{
    /// Send the identity and wait for the controller to assign a detector id.
    pub async fn register(
        mut ws: WebSocketStream<S>,
        config: &SessionConfig,
        camera: Arc<F>,
        stream: StreamConfig,
    ) -> Result<Self, SessionError> {
        ws.send(Message::Text(config.identity.clone())).await?;

        let reply = next_text(&mut ws).await?.ok_or(SessionError::Closed)?;
        let detector_id = reply
            .parse::<DetectorId>()
            .map_err(|_| SessionError::InvalidDetectorId(reply))?;
        info!(identity = %config.identity, %detector_id, "registered with controller");

        Ok(Self {
            ws,
            detector_id,
            streamer: Streamer::new(Arc::clone(&camera), stream),
            camera,
            follow_reassignment: config.follow_reassignment,
        })
    }

    pub fn detector_id(&self) -> DetectorId {
        self.detector_id
    }

    /// Answer commands until the controller leaves, a fatal error occurs or
    /// `shutdown` fires. Streaming is always stopped before returning.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), SessionError> {
        let result = self.command_loop(&shutdown).await;

        if self.streamer.stop().await.is_some() {
            info!("stopped streaming on session teardown");
        }
        if shutdown.is_cancelled() {
            if let Err(e) = self.ws.close(None).await {
                debug!("failed to close control connection: {e}");
            }
        }

        info!(detector_id = %self.detector_id, "control session closed");
        result
    }

    async fn command_loop(&mut self, shutdown: &CancellationToken) -> Result<(), SessionError> {
        loop {
            let token = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                token = next_text(&mut self.ws) => token?,
            };

            let Some(token) = token else {
                info!("controller closed the connection");
                return Ok(());
            };
            self.handle(&token).await?;
        }
    }

    async fn handle(&mut self, token: &str) -> Result<(), SessionError> {
        let command = Command::parse(token);
        let ack = command.ack();
        info!(%command, token, ack, "handling command");
        self.ws.send(Message::Text(ack.to_owned())).await?;

        match command {
            Command::Ping => {}
            Command::TakeSnapshot => {
                let image = self.snapshot().await?;
                self.ws.send(Message::Binary(image.as_ref().to_vec())).await?;
            }
            Command::StartStreaming => {
                self.streamer.start(self.detector_id).await;
            }
            Command::StopStreaming => {
                if self.streamer.stop().await.is_none() {
                    debug!("nothing to stop");
                }
            }
            Command::Unknown => self.reassign(token).await,
        }

        Ok(())
    }

    async fn snapshot(&self) -> Result<EncodedImage, SessionError> {
        self.camera.start().map_err(snapshot_error)?;

        let encoded = match self.camera.acquire().await {
            Ok(capture) => {
                let (width, height) = capture.dimensions();
                debug!(width, height, captured_at = ?capture.captured_at(), "captured snapshot");
                capture.encode(Encoding::Bmp).map_err(snapshot_error)
            }
            Err(e) => Err(snapshot_error(e)),
        };
        let released = self.camera.stop().map_err(snapshot_error);

        let image = encoded?;
        released?;
        debug!(bytes = image.len(), "encoded snapshot");
        Ok(image)
    }

    async fn reassign(&mut self, token: &str) {
        if !self.follow_reassignment {
            return;
        }
        let Ok(detector_id) = token.parse::<DetectorId>() else {
            return;
        };
        if detector_id == self.detector_id {
            return;
        }

        info!(old = %self.detector_id, new = %detector_id, "controller reassigned detector id");
        self.detector_id = detector_id;
        self.streamer.retarget(detector_id).await;
    }
}
