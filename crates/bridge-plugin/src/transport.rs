//! Transport address allocation and gRPC channel construction.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hyper_util::rt::TokioIo;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use uuid::Uuid;

use crate::config::Protocol;
use crate::error::{PluginError, PluginResult};

/// Where a plugin listens.
#[derive(Debug, Clone)]
pub(crate) enum PluginAddress {
    /// Socket path under `/tmp`.
    Unix(PathBuf),
    /// Loopback TCP address.
    Tcp(std::net::SocketAddr),
}

impl PluginAddress {
    /// The string the child reads from `PLUGIN_ADDRESS`.
    pub(crate) fn env_value(&self) -> String {
        match self {
            Self::Unix(path) => path.to_string_lossy().into_owned(),
            Self::Tcp(addr) => addr.to_string(),
        }
    }
}

/// Allocate a fresh address for a plugin instance.
pub(crate) fn allocate(protocol: Protocol, id: &Uuid) -> PluginResult<PluginAddress> {
    match protocol {
        Protocol::Unix => {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default();
            Ok(PluginAddress::Unix(PathBuf::from(format!(
                "/tmp/{id}_{millis}.sock"
            ))))
        },
        Protocol::Tcp => {
            // Reserve an ephemeral loopback port; the child binds it after
            // the listener is dropped.
            let listener = std::net::TcpListener::bind("127.0.0.1:0")
                .map_err(|e| PluginError::Connect(format!("port reservation failed: {e}")))?;
            let addr = listener
                .local_addr()
                .map_err(|e| PluginError::Connect(e.to_string()))?;
            Ok(PluginAddress::Tcp(addr))
        },
    }
}

/// Dial an insecure channel to the plugin.
pub(crate) async fn connect(
    address: &PluginAddress,
    timeout: Duration,
) -> PluginResult<Channel> {
    match address {
        PluginAddress::Unix(path) => {
            let path = path.clone();
            // The endpoint URI is ignored; the connector supplies the
            // actual socket.
            Endpoint::try_from("http://localhost")
                .map_err(|e| PluginError::Connect(e.to_string()))?
                .connect_timeout(timeout)
                .connect_with_connector(service_fn(move |_: Uri| {
                    let path = path.clone();
                    async move {
                        let stream = tokio::net::UnixStream::connect(path).await?;
                        Ok::<_, std::io::Error>(TokioIo::new(stream))
                    }
                }))
                .await
                .map_err(|e| PluginError::Connect(e.to_string()))
        },
        PluginAddress::Tcp(addr) => Endpoint::try_from(format!("http://{addr}"))
            .map_err(|e| PluginError::Connect(e.to_string()))?
            .connect_timeout(timeout)
            .connect()
            .await
            .map_err(|e| PluginError::Connect(e.to_string())),
    }
}
