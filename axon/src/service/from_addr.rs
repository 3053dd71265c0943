use std::sync::Arc;

use url::Url;

use super::{AxonService, GRPCAxonService, RedbAxonService};
use crate::proto::axon_service_client::AxonServiceClient;
use crate::Error;

/// Constructs a new instance of an [AxonService] from an URI.
///
/// The following schemes are supported by the following services:
/// - `redb://` ([RedbAxonService], temporary, in-memory)
/// - `redb:///path/to/datadir` ([RedbAxonService], persistent)
/// - `grpc+*://` ([GRPCAxonService]; `grpc+unix` for unix sockets,
///   `grpc+http(s)` for the HTTP counterparts)
pub async fn from_addr(uri: &str) -> Result<Arc<dyn AxonService>, Error> {
    let url =
        Url::parse(uri).map_err(|e| Error::StorageError(format!("unable to parse url: {}", e)))?;

    Ok(if url.scheme() == "redb" {
        // redb doesn't support a host; a path can be provided (otherwise
        // it'll live in memory only).
        if url.has_host() {
            return Err(Error::StorageError("no host allowed".to_string()));
        }

        if url.path().is_empty() {
            Arc::new(RedbAxonService::new_temporary()?)
        } else {
            Arc::new(RedbAxonService::new(url.path().into()).await?)
        }
    } else if url.scheme().starts_with("grpc+") {
        // schemes starting with grpc+ connect to a remote daemon.
        //   That's normally grpc+unix for unix sockets, and grpc+http(s) for
        //   the HTTP counterparts. Constructing the channel is handled by
        //   crate::channel::from_url.
        let client = AxonServiceClient::new(crate::channel::from_url(&url)?);
        Arc::new(GRPCAxonService::from_client(client))
    } else {
        Err(Error::StorageError(format!(
            "unknown scheme: {}",
            url.scheme()
        )))?
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::from_addr;

    /// This uses an unsupported scheme.
    #[rstest]
    #[case::unsupported_scheme("http://foo.example/test", false)]
    /// This configures redb in temporary mode.
    #[case::redb_valid_temporary("redb://", true)]
    /// This configures redb with /, which should fail.
    #[case::redb_invalid_root("redb:///", false)]
    /// This configures redb with a host, which should fail.
    #[case::redb_invalid_host("redb://foo.example", false)]
    /// Correct scheme to connect to a unix socket.
    #[case::grpc_valid_unix_socket("grpc+unix:///path/to/somewhere", true)]
    /// Correct scheme for unix socket, but setting a host too, which is invalid.
    #[case::grpc_invalid_unix_socket_and_host("grpc+unix://host.example/path/to/somewhere", false)]
    /// Correct scheme to connect to localhost, with port 8080.
    #[case::grpc_valid_ipv6_localhost_port("grpc+http://[::1]:8080", true)]
    /// Correct scheme to connect to localhost over http, without specifying a port.
    #[case::grpc_valid_http_host_without_port("grpc+http://localhost", true)]
    /// Correct scheme to connect to localhost over http, but with additional path, which is invalid.
    #[case::grpc_invalid_host_and_path("grpc+http://localhost/some-path", false)]
    #[tokio::test]
    async fn test_from_addr(#[case] uri_str: &str, #[case] exp_ok: bool) {
        assert_eq!(from_addr(uri_str).await.is_ok(), exp_ok, "{}", uri_str);
    }

    #[tokio::test]
    async fn test_from_addr_redb_path() {
        let tmpdir = tempfile::TempDir::new().expect("must succeed");
        let uri = format!("redb://{}", tmpdir.path().join("data").display());
        assert!(from_addr(&uri).await.is_ok(), "{}", uri);
    }
}
