use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};

/// Turn a [url::Url] into a lazily-connecting [Channel].
///
/// Supports `grpc+unix:///path/to/socket` for unix domain sockets, and the
/// regular schemes supported by tonic prefixed with `grpc+`, for example
/// `grpc+http://[::1]:8080`.
pub fn from_url(url: &url::Url) -> Result<Channel, Error> {
    let rest = url
        .scheme()
        .strip_prefix("grpc+")
        .ok_or(Error::MissingGRPCPrefix)?;

    if rest == "unix" {
        if url.host_str().is_some() {
            return Err(Error::HostSetForUnixSocket);
        }

        let path = url.path().to_string();
        // The endpoint address is required but never dialed.
        return Ok(Endpoint::from_static("http://[::]:50051")
            .connect_with_connector_lazy(tower::service_fn(move |_: Uri| {
                let path = path.clone();
                async move { UnixStream::connect(path).await.map(TokioIo::new) }
            })));
    }

    // ensure path is empty, not supported with gRPC.
    if !url.path().is_empty() {
        return Err(Error::PathMayNotBeSet);
    }

    // Stringify the URL and remove the grpc+ prefix.
    // We can't use `url.set_scheme(rest)`, as it disallows
    // setting something http(s) that previously wasn't.
    let url = url.to_string().strip_prefix("grpc+").unwrap().to_owned();

    Ok(Endpoint::try_from(url)?.connect_lazy())
}

/// Errors occuring when trying to connect to a backend
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("grpc+ prefix is missing from Url")]
    MissingGRPCPrefix,

    #[error("host may not be set for unix domain sockets")]
    HostSetForUnixSocket,

    #[error("path may not be set")]
    PathMayNotBeSet,

    #[error("transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),
}
