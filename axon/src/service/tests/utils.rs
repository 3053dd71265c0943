use std::sync::Arc;

use hyper_util::rt::TokioIo;
use tonic::transport::{Endpoint, Server, Uri};

use crate::perms::AllowAll;
use crate::proto::axon_service_client::AxonServiceClient;
use crate::proto::axon_service_server::AxonServiceServer;
use crate::proto::GRPCAxonServiceWrapper;
use crate::service::{AxonService, GRPCAxonService, RedbAxonService};

/// Constructs and returns a gRPC AxonService.
/// The server part is a temporary [RedbAxonService], exposed via the
/// [GRPCAxonServiceWrapper] with a permissive authorizer, and connected
/// through a DuplexStream.
pub async fn make_grpc_axon_service_client() -> Arc<dyn AxonService> {
    let (left, right) = tokio::io::duplex(64);

    // spin up a server, which will only connect once, to the left side.
    tokio::spawn(async {
        let axon: Arc<dyn AxonService> =
            Arc::new(RedbAxonService::new_temporary().expect("must succeed"));

        let mut server = Server::builder();
        let router = server.add_service(AxonServiceServer::new(GRPCAxonServiceWrapper::new(
            axon,
            Arc::new(AllowAll),
        )));

        router
            .serve_with_incoming(tokio_stream::once(Ok::<_, std::io::Error>(left)))
            .await
    });

    // Create a client, connecting to the right side. The URI is unused.
    let mut maybe_right = Some(right);

    Arc::new(GRPCAxonService::from_client(AxonServiceClient::new(
        Endpoint::try_from("http://[::]:50051")
            .unwrap()
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let right = maybe_right.take().unwrap();
                async move { Ok::<_, std::io::Error>(TokioIo::new(right)) }
            }))
            .await
            .unwrap(),
    )))
}
