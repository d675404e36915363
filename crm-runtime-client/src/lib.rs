//! Client side of the CRI connection to the underlying container runtime.
//!
//! Grounded on `zerovisor-sdk`'s `Client` (a thin wrapper around a
//! transport handle exposing a handful of typed calls) generalized from
//! HTTP+JSON over `reqwest` to gRPC-over-UDS via `tonic`.

use std::future::Future;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::{debug, info, warn};

use crm_proto::runtime::image_service_client::ImageServiceClient;
use crm_proto::runtime::runtime_service_client::RuntimeServiceClient;
use crm_proto::runtime::VersionRequest;

/// Ownership and permission bits of the dialed socket, reported to the CRI
/// server so it can mirror them on its own listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketMeta {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

#[derive(Debug, Error)]
pub enum RuntimeClientError {
    #[error("runtime socket {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("connecting to runtime socket {0}: {1}")]
    Connect(PathBuf, String),
    #[error("runtime does not implement any supported CRI version")]
    NoSupportedVersion,
}

const CRI_VERSION_V1: &str = "v1";
const CRI_VERSION_V1ALPHA2: &str = "v1alpha2";

/// Polls for the runtime socket to appear, connecting as soon as it does.
///
/// `notify` is invoked exactly once, right after the socket is found, with
/// its ownership and mode so the caller can mirror them on the server's own
/// listening socket before any CRI traffic flows.
pub async fn connect<F>(
    path: impl AsRef<Path>,
    poll_interval: Duration,
    notify: F,
) -> Result<RuntimeClient, RuntimeClientError>
where
    F: FnOnce(SocketMeta) + Send,
{
    let path = path.as_ref().to_path_buf();
    let meta = wait_forever(&path, poll_interval).await?;
    notify(meta);

    let channel = dial(&path).await?;
    let mut runtime = RuntimeServiceClient::new(channel.clone());
    let image = ImageServiceClient::new(channel);

    let negotiated = negotiate_version(&mut runtime).await?;
    info!(version = negotiated, runtime_socket = %path.display(), "connected to container runtime");

    Ok(RuntimeClient {
        runtime,
        image,
        negotiated_version: negotiated,
    })
}

/// Blocks (without busy-spinning) until `path` exists and is readable,
/// retrying every `poll_interval`. There is deliberately no timeout here:
/// the runtime may start well after this process does.
async fn wait_forever(path: &Path, poll_interval: Duration) -> Result<SocketMeta, RuntimeClientError> {
    loop {
        match std::fs::metadata(path) {
            Ok(meta) => {
                return Ok(SocketMeta {
                    uid: meta.uid(),
                    gid: meta.gid(),
                    mode: meta.mode(),
                });
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "runtime socket not present yet, waiting");
                tokio::time::sleep(poll_interval).await;
            }
            Err(err) => {
                return Err(RuntimeClientError::Io {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        }
    }
}

async fn dial(path: &Path) -> Result<Channel, RuntimeClientError> {
    let path = path.to_path_buf();
    Endpoint::try_from("http://[::]:50051")
        .expect("static placeholder URI is always valid")
        .connect_with_connector(tower::service_fn(move |_: Uri| {
            let path = path.clone();
            async move { tokio::net::UnixStream::connect(path).await }
        }))
        .await
        .map_err(|err| RuntimeClientError::Connect(path.clone(), err.to_string()))
}

async fn negotiate_version(
    runtime: &mut RuntimeServiceClient<Channel>,
) -> Result<&'static str, RuntimeClientError> {
    match runtime
        .version(VersionRequest {
            version: CRI_VERSION_V1.to_string(),
        })
        .await
    {
        Ok(_) => Ok(CRI_VERSION_V1),
        Err(status) if status.code() == tonic::Code::Unimplemented => {
            warn!("runtime does not implement CRI v1, falling back to v1alpha2 semantics");
            Ok(CRI_VERSION_V1ALPHA2)
        }
        Err(status) => Err(RuntimeClientError::Connect(PathBuf::new(), status.to_string())),
    }
}

/// A connected handle to the underlying runtime's Runtime and Image
/// services. Both client stubs are cheap to clone (they share one
/// `Channel`), so callers can hand out copies per in-flight request.
#[derive(Clone)]
pub struct RuntimeClient {
    runtime: RuntimeServiceClient<Channel>,
    image: ImageServiceClient<Channel>,
    negotiated_version: &'static str,
}

impl RuntimeClient {
    pub fn runtime(&self) -> RuntimeServiceClient<Channel> {
        self.runtime.clone()
    }

    pub fn image(&self) -> ImageServiceClient<Channel> {
        self.image.clone()
    }

    /// `"v1"` unless the runtime rejected `Version` under that name, in
    /// which case `"v1alpha2"`. This crate only generates `v1` message
    /// types; the v1alpha2 fallback is a logged degraded mode rather than a
    /// second compiled schema, since the two are wire-compatible for the
    /// subset of fields this manager touches.
    pub fn negotiated_version(&self) -> &'static str {
        self.negotiated_version
    }
}

/// Test seam: lets unit tests exercise `wait_forever` without spinning up a
/// real gRPC server.
pub async fn wait_for_socket_path(
    path: impl AsRef<Path>,
    poll_interval: Duration,
) -> Result<SocketMeta, RuntimeClientError> {
    wait_forever(path.as_ref(), poll_interval).await
}

pub fn retry_forever<F, Fut, T, E>(mut attempt: F) -> impl Future<Output = T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    async move {
        loop {
            match attempt().await {
                Ok(value) => return value,
                Err(err) => {
                    warn!(error = %err, "retrying after transient failure");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn wait_forever_resolves_once_socket_file_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.sock");

        let waiter = tokio::spawn({
            let path = path.clone();
            async move { wait_for_socket_path(&path, Duration::from_millis(10)).await }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::write(&path, b"").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o660);
        std::fs::set_permissions(&path, perms).unwrap();

        let meta = waiter.await.unwrap().unwrap();
        assert_eq!(meta.mode & 0o777, 0o660);
    }

    #[tokio::test]
    async fn wait_forever_propagates_non_not_found_errors() {
        // A path under a component that isn't a directory yields a
        // `NotADirectory`-class error distinct from `NotFound`, which
        // should short-circuit the poll loop instead of waiting forever.
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"").unwrap();
        let bogus = file.join("runtime.sock");

        let result = wait_for_socket_path(&bogus, Duration::from_millis(10)).await;
        assert!(result.is_err());
    }
}
