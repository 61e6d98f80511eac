use crate::error::MqttError;
use bytes::Bytes;
use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::warn;

/// A reliable byte-stream transport carrying MQTT frames (TCP or
/// WebSocket). Reads surface raw chunks with no packet alignment; framing
/// is the reader's job.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// The next chunk of bytes from the peer, or `None` once the stream
    /// has closed.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, MqttError>;
    async fn write_all(&mut self, data: &[u8]) -> Result<(), MqttError>;
    async fn flush(&mut self) -> Result<(), MqttError>;
    async fn close(&mut self) -> Result<(), MqttError>;
}

#[async_trait::async_trait]
impl Transport for TcpStream {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, MqttError> {
        let mut buf = vec![0u8; 4096];
        let n = AsyncReadExt::read(self, &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), MqttError> {
        AsyncWriteExt::write_all(self, data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), MqttError> {
        AsyncWriteExt::flush(self).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MqttError> {
        AsyncWriteExt::shutdown(self).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketStream<MaybeTlsStream<TcpStream>> {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, MqttError> {
        loop {
            match self.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(other)) => {
                    warn!("ignoring non-binary WebSocket message: {:?}", other);
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), MqttError> {
        self.send(Message::Binary(data.to_vec())).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), MqttError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MqttError> {
        WebSocketStream::close(self, None).await?;
        Ok(())
    }
}
