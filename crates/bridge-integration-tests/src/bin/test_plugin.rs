//! Reference plugin used by the end-to-end tests.
//!
//! Reads `PLUGIN_PROTOCOL` and `PLUGIN_ADDRESS` from the environment,
//! binds a `PluginService` server there, and reports `READY`. The runner
//! RPC prepends `plugged:` to the payload and tags the metadata; the
//! source RPC streams three numbered events.

use std::pin::Pin;

use bridge_plugin::proto::plugin_service_server::{PluginService, PluginServiceServer};
use bridge_plugin::proto::{
    PluginMessage, PluginStatus, ShutdownRequest, ShutdownResponse, SourceRequest, StatusRequest,
    StatusResponse, TargetResponse,
};
use futures::Stream;
use tonic::{Request, Response, Status};

struct TestPlugin;

type SourceStream = Pin<Box<dyn Stream<Item = Result<PluginMessage, Status>> + Send>>;

#[tonic::async_trait]
impl PluginService for TestPlugin {
    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        Ok(Response::new(StatusResponse {
            status: PluginStatus::Ready as i32,
            error: String::new(),
        }))
    }

    async fn shutdown(
        &self,
        _request: Request<ShutdownRequest>,
    ) -> Result<Response<ShutdownResponse>, Status> {
        tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            std::process::exit(0);
        });
        Ok(Response::new(ShutdownResponse {}))
    }

    type SourceStream = SourceStream;

    async fn source(
        &self,
        _request: Request<SourceRequest>,
    ) -> Result<Response<Self::SourceStream>, Status> {
        let events = (0..3).map(|seq| {
            Ok(PluginMessage {
                uuid: format!("event-{seq}").into_bytes(),
                metadata: [("seq".to_string(), seq.to_string())].into(),
                data: format!("event-{seq}").into_bytes(),
            })
        });
        Ok(Response::new(Box::pin(futures::stream::iter(events))))
    }

    async fn runner(
        &self,
        request: Request<PluginMessage>,
    ) -> Result<Response<PluginMessage>, Status> {
        let mut message = request.into_inner();
        let mut data = b"plugged:".to_vec();
        data.extend_from_slice(&message.data);
        message.data = data;
        message
            .metadata
            .insert("plugin".to_string(), "test".to_string());
        Ok(Response::new(message))
    }

    async fn target(
        &self,
        _request: Request<PluginMessage>,
    ) -> Result<Response<TargetResponse>, Status> {
        Ok(Response::new(TargetResponse {}))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protocol = std::env::var("PLUGIN_PROTOCOL")?;
    let address = std::env::var("PLUGIN_ADDRESS")?;
    let service = PluginServiceServer::new(TestPlugin);

    match protocol.as_str() {
        "unix" => {
            let listener = tokio::net::UnixListener::bind(&address)?;
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming(tokio_stream::wrappers::UnixListenerStream::new(listener))
                .await?;
        },
        "tcp" => {
            let addr: std::net::SocketAddr = address.parse()?;
            tonic::transport::Server::builder()
                .add_service(service)
                .serve(addr)
                .await?;
        },
        other => return Err(format!("unsupported protocol {other:?}").into()),
    }
    Ok(())
}
