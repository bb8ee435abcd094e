use futures::future::BoxFuture;
use log::{error, info, warn};
use rustls::pki_types::ServerName;
use serde::Serialize;
use shared::models::command::{CommandAck, HubCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

/// Each message is one whole JSON object read into a single buffer of this
/// size. Anything larger is a protocol violation.
pub const MAX_FRAME_BYTES: usize = 4096;

const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("not connected to hub")]
    NotConnected,
    #[error("invalid hub address: {0}")]
    BadAddress(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub type CommandHandler =
    Arc<dyn Fn(HubCommand) -> BoxFuture<'static, CommandAck> + Send + Sync>;

type ChannelReader = ReadHalf<TlsStream<TcpStream>>;
type ChannelWriter = WriteHalf<TlsStream<TcpStream>>;

/// Persistent mTLS duplex link to the Hub.
///
/// Inbound commands are dispatched one at a time: the handler runs to
/// completion before the next frame is read. Outbound acks and heartbeats go
/// through a mutex-guarded writer, so a heartbeat can never interleave with
/// an ack's bytes. Any read or write error tears the connection down and the
/// run loop reconnects with exponential backoff.
pub struct HubChannel {
    hub_addr: String,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    writer: Mutex<Option<ChannelWriter>>,
    handler: CommandHandler,
    on_reconnected: Option<Arc<dyn Fn() + Send + Sync>>,
    shutdown: CancellationToken,
}

impl HubChannel {
    /// `tls_config` must already pin TLS 1.3 and carry the client
    /// certificate; every (re)connection applies it unchanged.
    pub fn new(
        hub_addr: impl Into<String>,
        tls_config: Arc<rustls::ClientConfig>,
        handler: CommandHandler,
        shutdown: CancellationToken,
    ) -> Result<Self, ChannelError> {
        let hub_addr = hub_addr.into();
        let host = hub_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(hub_addr.as_str())
            .to_string();
        let server_name = ServerName::try_from(host)
            .map_err(|e| ChannelError::BadAddress(e.to_string()))?;

        Ok(Self {
            hub_addr,
            connector: TlsConnector::from(tls_config),
            server_name,
            writer: Mutex::new(None),
            handler,
            on_reconnected: None,
            shutdown,
        })
    }

    pub fn with_on_reconnected(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_reconnected = Some(Arc::new(hook));
        self
    }

    /// Dials the Hub and completes the TLS handshake. The caller decides
    /// whether a failure is fatal (first connect) or retried (run loop).
    pub async fn connect(&self) -> Result<ChannelReader, ChannelError> {
        let tcp = TcpStream::connect(&self.hub_addr)
            .await
            .map_err(|e| ChannelError::Network(e.to_string()))?;

        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| ChannelError::Network(format!("TLS handshake failed: {e}")))?;

        let (reader, writer) = tokio::io::split(tls);
        *self.writer.lock().await = Some(writer);

        info!("Connected to Hub via mTLS at {}", self.hub_addr);
        Ok(reader)
    }

    /// Serves the connection until shutdown: reads frames, reconnects with
    /// backoff when the link drops. Commands received during an outage are
    /// lost by design; the Hub re-sends idempotent commands.
    pub async fn run(self: Arc<Self>, reader: ChannelReader) {
        let mut reader = reader;
        loop {
            self.read_loop(&mut reader).await;
            // Drop both halves so the socket actually closes before the
            // backoff sleep
            drop(reader);
            *self.writer.lock().await = None;

            if self.shutdown.is_cancelled() {
                return;
            }

            warn!("Connection to Hub lost, reconnecting...");
            let mut backoff = RECONNECT_BACKOFF_INITIAL;
            reader = loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }

                match self.connect().await {
                    Ok(reader) => break reader,
                    Err(e) => {
                        warn!("Reconnect failed: {e} (retry in {backoff:?})");
                        backoff = next_backoff(backoff);
                    }
                }
            };

            info!("Reconnected to Hub");
            if let Some(hook) = &self.on_reconnected {
                hook();
            }
        }
    }

    /// Reads and handles frames until the connection breaks or shutdown.
    async fn read_loop(&self, reader: &mut ChannelReader) {
        let mut buf = vec![0u8; MAX_FRAME_BYTES];

        loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                read = reader.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => {
                    info!("Hub closed the connection");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("Read error: {e}");
                    return;
                }
            };

            if n == MAX_FRAME_BYTES {
                error!("Inbound frame exceeds {MAX_FRAME_BYTES} bytes, closing connection");
                return;
            }

            let cmd: HubCommand = match serde_json::from_slice(&buf[..n]) {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!("Failed to parse command: {e}");
                    continue;
                }
            };

            let ack = self.dispatch(cmd).await;
            if let Err(e) = self.send(&ack).await {
                warn!("Failed to send ack: {e}");
                return;
            }
        }
    }

    /// Runs the handler in its own task so a panic becomes an error ack
    /// instead of taking the daemon down.
    async fn dispatch(&self, cmd: HubCommand) -> CommandAck {
        let command_id = cmd.id.clone();
        match tokio::spawn((self.handler)(cmd)).await {
            Ok(ack) => ack,
            Err(e) => {
                error!("Command handler panicked: {e}");
                CommandAck::error(command_id, "command handler failed")
            }
        }
    }

    /// Writes one outbound frame (ack or heartbeat). The writer lock is held
    /// for the duration of the write so frames never interleave.
    pub async fn send<T: Serialize>(&self, frame: &T) -> Result<(), ChannelError> {
        let data = serde_json::to_vec(frame).map_err(|e| ChannelError::Protocol(e.to_string()))?;

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ChannelError::NotConnected)?;

        writer
            .write_all(&data)
            .await
            .map_err(|e| ChannelError::Network(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| ChannelError::Network(e.to_string()))
    }

    /// Tears the channel down; the run loop exits at the next await point.
    pub async fn close(&self) {
        self.shutdown.cancel();
        *self.writer.lock().await = None;
    }
}

fn next_backoff(backoff: Duration) -> Duration {
    (backoff * 2).min(RECONNECT_BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        let mut observed = Vec::new();
        for _ in 0..6 {
            observed.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(observed, vec![5, 10, 20, 40, 60, 60]);
    }

    fn ensure_crypto_provider() {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        });
    }

    #[test]
    fn test_server_name_from_hub_addr() {
        ensure_crypto_provider();
        let handler: CommandHandler =
            Arc::new(|cmd| Box::pin(async move { CommandAck::ok(cmd.id) }));
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();

        let channel = HubChannel::new(
            "hub.example.com:8443",
            Arc::new(config),
            handler,
            CancellationToken::new(),
        );
        assert!(channel.is_ok());
    }

    #[test]
    fn test_rejects_unparseable_host() {
        ensure_crypto_provider();
        let handler: CommandHandler =
            Arc::new(|cmd| Box::pin(async move { CommandAck::ok(cmd.id) }));
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();

        let channel = HubChannel::new(
            "not a host:8443",
            Arc::new(config),
            handler,
            CancellationToken::new(),
        );
        assert!(matches!(channel, Err(ChannelError::BadAddress(_))));
    }
}
