use futures_util::{SinkExt, StreamExt};
use protocol::ServerEnvelope;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A thin WebSocket driver used by integration tests to exercise the
/// gateway's `/api/ws` endpoint as a real client would.
pub struct MockGatewayClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockGatewayClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Connects with the token as the `?token=` query parameter -- the
    /// gateway's handshake only reads the `session` cookie and that query
    /// parameter (§6), never an `Authorization` header.
    pub async fn connect_with_token(
        url: &str,
        token: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let separator = if url.contains('?') { '&' } else { '?' };
        let url_with_token = format!("{url}{separator}token={token}");
        Self::connect(&url_with_token).await
    }

    /// Connects with an explicit `x-device-id` header, used to exercise
    /// handler logic keyed on the device id (§6's handshake inputs).
    pub async fn connect_with_device_id(
        url: &str,
        device_id: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        use tokio_tungstenite::tungstenite::handshake::client::generate_key;
        let uri: tokio_tungstenite::tungstenite::http::Uri = url.parse()?;
        let host = uri.host().unwrap_or("localhost").to_owned();
        let port = uri.port_u16();
        let host_header = match port {
            Some(p) => format!("{host}:{p}"),
            None => host,
        };
        let request = Request::builder()
            .uri(url)
            .header("Host", host_header)
            .header("x-device-id", device_id)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .body(())?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Send a raw JSON text frame, bypassing envelope construction -- used
    /// to exercise codec rejection paths with deliberately malformed input.
    pub async fn send_text(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    pub async fn send_json(
        &mut self,
        value: &serde_json::Value,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.send_text(&value.to_string()).await
    }

    pub async fn recv_envelope(&mut self) -> Result<ServerEnvelope, Box<dyn std::error::Error>> {
        let value = self.recv_json().await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Same as [`Self::recv_envelope`] but returns the raw JSON value, useful
    /// when a test wants to assert on fields the typed [`ServerEnvelope`]
    /// doesn't expose (e.g. absence of a key).
    pub async fn recv_json(&mut self) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn recv_with_timeout(
        &mut self,
        timeout: std::time::Duration,
    ) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
        match tokio::time::timeout(timeout, self.recv_json()).await {
            Ok(result) => result,
            Err(_) => Err("timed out waiting for a server envelope".into()),
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
