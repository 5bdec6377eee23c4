use anyhow::{Context, Result};
use log::{error, info, warn};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::config::{ERROR_MARKER, SEGMENT_SIZE};
use crate::networking::index::FileIndex;

const NOT_FOUND_RESPONSE: &[u8] = b"ERROR: File not found";

/// Progress and outcome of a file request, reported via the status callback.
#[derive(Debug, Clone)]
pub enum TransferStatus {
    /// The name resolved and a connection is being opened.
    Started { name: String, owner: IpAddr },
    /// The name is not in the file index; no connection was attempted.
    NotIndexed { name: String },
    /// The owning peer answered with an error instead of file data.
    RemoteError { name: String, message: String },
    /// The file was fully received and saved.
    Completed {
        name: String,
        path: PathBuf,
        bytes: u64,
    },
    /// The transfer broke down (transport or local I/O).
    Failed { name: String, error: String },
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Started { name, owner } => {
                write!(f, "requesting '{}' from {}...", name, owner)
            }
            TransferStatus::NotIndexed { name } => {
                write!(f, "'{}' is not in the file index", name)
            }
            TransferStatus::RemoteError { name, message } => {
                write!(f, "peer rejected '{}': {}", name, message)
            }
            TransferStatus::Completed { name, path, bytes } => {
                write!(
                    f,
                    "downloaded '{}' ({} bytes) to {}",
                    name,
                    bytes,
                    path.display()
                )
            }
            TransferStatus::Failed { name, error } => {
                write!(f, "transfer of '{}' failed: {}", name, error)
            }
        }
    }
}

/// Type of status callback for file requests.
pub type StatusCallback = Arc<dyn Fn(TransferStatus) + Send + Sync>;

/// Serves files out of the shared directory to any peer that names one.
///
/// Each accepted connection is handled on its own task; a handler error is
/// logged and closes that connection without touching the accept loop.
pub struct TransferServer {
    shared_dir: PathBuf,
    port: u16,
    shutdown_sender: Option<mpsc::Sender<()>>,
}

impl TransferServer {
    pub fn new(shared_dir: PathBuf, port: u16) -> Self {
        Self {
            shared_dir,
            port,
            shutdown_sender: None,
        }
    }

    /// Bind the transfer port and start accepting requests.
    /// Returns the bound address (useful when the port was 0).
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let (tx, mut rx) = mpsc::channel(1);
        self.shutdown_sender = Some(tx);

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind transfer port {}", self.port))?;
        let server_addr = listener.local_addr()?;
        info!("transfer server listening on {}", server_addr);

        let shared_dir = self.shared_dir.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    conn = listener.accept() => {
                        match conn {
                            Ok((socket, peer)) => {
                                let dir = shared_dir.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_request(socket, peer, &dir).await {
                                        error!("error handling request from {}: {}", peer, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("error accepting connection: {}", e);
                            }
                        }
                    }
                    _ = rx.recv() => {
                        info!("shutting down transfer server");
                        break;
                    }
                }
            }
        });

        Ok(server_addr)
    }

    /// Stop the accept loop.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_sender.take() {
            let _ = tx.send(()).await;
        }
    }
}

/// Serve one request: the peer sends a file name and half-closes, we answer
/// with the file bytes in fixed-size segments or the error marker.
async fn handle_request(mut socket: TcpStream, peer: SocketAddr, shared_dir: &Path) -> Result<()> {
    let mut raw = Vec::new();
    socket
        .read_to_end(&mut raw)
        .await
        .context("failed to read request")?;
    let name = String::from_utf8_lossy(&raw).into_owned();

    let path = shared_dir.join(&name);
    if path.is_file() {
        let mut file = File::open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut segment = vec![0u8; SEGMENT_SIZE];
        let mut sent: u64 = 0;
        loop {
            let n = file.read(&mut segment).await?;
            if n == 0 {
                break;
            }
            socket.write_all(&segment[..n]).await?;
            sent += n as u64;
        }
        info!("sent '{}' ({} bytes) to {}", name, sent, peer);
    } else {
        socket.write_all(NOT_FOUND_RESPONSE).await?;
        warn!("{} requested '{}', not in the shared directory", peer, name);
    }

    socket.shutdown().await?;
    Ok(())
}

/// Retrieve a named file from whichever peer the index associates with it,
/// reporting progress and outcome through the callback. Never returns an
/// error: every failure mode ends up in the callback as a status.
pub async fn fetch_file(
    name: String,
    index: FileIndex,
    transfer_port: u16,
    download_prefix: String,
    callback: StatusCallback,
) {
    let entry = match index.lookup(&name) {
        Some(entry) => entry,
        None => {
            info!("'{}' not indexed, skipping request", name);
            callback(TransferStatus::NotIndexed { name });
            return;
        }
    };

    callback(TransferStatus::Started {
        name: name.clone(),
        owner: entry.owner,
    });

    let result = pull_from_owner(
        &name,
        entry.owner,
        transfer_port,
        index.shared_dir(),
        &download_prefix,
    )
    .await;

    match result {
        Ok(PullOutcome::Saved { path, bytes }) => {
            info!("downloaded '{}' ({} bytes) to {}", name, bytes, path.display());
            // the download landed in the shared directory, pick it up
            if let Err(e) = index.refresh() {
                warn!("index refresh after download failed: {}", e);
            }
            callback(TransferStatus::Completed { name, path, bytes });
        }
        Ok(PullOutcome::Rejected(message)) => {
            warn!("peer rejected '{}': {}", name, message);
            callback(TransferStatus::RemoteError { name, message });
        }
        Err(e) => {
            error!("transfer of '{}' failed: {:#}", name, e);
            callback(TransferStatus::Failed {
                name,
                error: format!("{:#}", e),
            });
        }
    }
}

enum PullOutcome {
    Saved { path: PathBuf, bytes: u64 },
    Rejected(String),
}

async fn pull_from_owner(
    name: &str,
    owner: IpAddr,
    transfer_port: u16,
    shared_dir: &Path,
    download_prefix: &str,
) -> Result<PullOutcome> {
    let mut socket = TcpStream::connect((owner, transfer_port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", owner, transfer_port))?;
    socket.write_all(name.as_bytes()).await?;
    // half-close tells the server the request is complete
    socket.shutdown().await?;

    let out_path = shared_dir.join(format!("{}{}", download_prefix, name));
    let mut out = File::create(&out_path)
        .await
        .with_context(|| format!("failed to create {}", out_path.display()))?;

    let mut segment = vec![0u8; SEGMENT_SIZE];
    let mut bytes: u64 = 0;
    let mut first = true;
    loop {
        let n = socket.read(&mut segment).await?;
        if n == 0 {
            break;
        }
        if first && segment[..n].starts_with(ERROR_MARKER) {
            let message = String::from_utf8_lossy(&segment[..n]).into_owned();
            drop(out);
            tokio::fs::remove_file(&out_path)
                .await
                .with_context(|| format!("failed to remove {}", out_path.display()))?;
            return Ok(PullOutcome::Rejected(message));
        }
        first = false;
        out.write_all(&segment[..n]).await?;
        bytes += n as u64;
    }
    out.flush().await?;

    Ok(PullOutcome::Saved {
        path: out_path,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    fn capture() -> (StatusCallback, Arc<Mutex<Vec<TransferStatus>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: StatusCallback = Arc::new(move |status| sink.lock().unwrap().push(status));
        (callback, seen)
    }

    fn local_index(dir: &Path) -> FileIndex {
        let index = FileIndex::new(dir.to_path_buf(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        index.refresh().unwrap();
        index
    }

    #[tokio::test]
    async fn fetch_round_trip_preserves_bytes() {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempdir().unwrap();
        let payload = b"quarterly numbers: 1, 2, 3\n".repeat(512);
        fs::write(dir.path().join("report.txt"), &payload).unwrap();

        let mut server = TransferServer::new(dir.path().to_path_buf(), 0);
        let addr = server.start().await.unwrap();
        let index = local_index(dir.path());
        let (callback, seen) = capture();

        fetch_file(
            "report.txt".into(),
            index.clone(),
            addr.port(),
            "downloaded-".into(),
            callback,
        )
        .await;

        let out = dir.path().join("downloaded-report.txt");
        assert_eq!(fs::read(&out).unwrap(), payload);

        let statuses = seen.lock().unwrap();
        assert!(matches!(
            statuses.last(),
            Some(TransferStatus::Completed { bytes, .. }) if *bytes == payload.len() as u64
        ));
        drop(statuses);

        // success refreshes the index, so the download itself is now indexed
        assert!(index.lookup("downloaded-report.txt").is_some());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn fetch_of_vanished_file_reports_remote_error() {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempdir().unwrap();
        fs::write(dir.path().join("missing.bin"), b"soon gone").unwrap();
        let index = local_index(dir.path());
        // indexed, but no longer on disk when the request arrives
        fs::remove_file(dir.path().join("missing.bin")).unwrap();

        let mut server = TransferServer::new(dir.path().to_path_buf(), 0);
        let addr = server.start().await.unwrap();
        let (callback, seen) = capture();

        fetch_file(
            "missing.bin".into(),
            index,
            addr.port(),
            "downloaded-".into(),
            callback,
        )
        .await;

        assert!(!dir.path().join("downloaded-missing.bin").exists());
        let statuses = seen.lock().unwrap();
        assert!(matches!(
            statuses.last(),
            Some(TransferStatus::RemoteError { .. })
        ));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn unindexed_name_opens_no_connection() {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempdir().unwrap();
        let index = local_index(dir.path());

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((_socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let (callback, seen) = capture();
        fetch_file(
            "ghost.txt".into(),
            index,
            port,
            "downloaded-".into(),
            callback,
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            seen.lock().unwrap().last(),
            Some(TransferStatus::NotIndexed { .. })
        ));
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_fetches_complete_independently() {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempdir().unwrap();
        let first = vec![0xABu8; 96 * 1024];
        let second: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
        fs::write(dir.path().join("first.bin"), &first).unwrap();
        fs::write(dir.path().join("second.bin"), &second).unwrap();

        let mut server = TransferServer::new(dir.path().to_path_buf(), 0);
        let addr = server.start().await.unwrap();
        let index = local_index(dir.path());
        let (callback_a, _) = capture();
        let (callback_b, _) = capture();

        tokio::join!(
            fetch_file(
                "first.bin".into(),
                index.clone(),
                addr.port(),
                "downloaded-".into(),
                callback_a,
            ),
            fetch_file(
                "second.bin".into(),
                index.clone(),
                addr.port(),
                "downloaded-".into(),
                callback_b,
            ),
        );

        assert_eq!(fs::read(dir.path().join("downloaded-first.bin")).unwrap(), first);
        assert_eq!(
            fs::read(dir.path().join("downloaded-second.bin")).unwrap(),
            second
        );

        server.shutdown().await;
    }

    #[tokio::test]
    async fn server_keeps_serving_after_malformed_request() {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempdir().unwrap();
        fs::write(dir.path().join("report.txt"), b"still here").unwrap();
        let mut server = TransferServer::new(dir.path().to_path_buf(), 0);
        let addr = server.start().await.unwrap();

        // a requester that names nothing gets the error marker back
        {
            let mut socket = TcpStream::connect((Ipv4Addr::LOCALHOST, addr.port()))
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
            let mut reply = Vec::new();
            socket.read_to_end(&mut reply).await.unwrap();
            assert!(reply.starts_with(ERROR_MARKER));
        }

        let index = local_index(dir.path());
        let (callback, seen) = capture();
        fetch_file(
            "report.txt".into(),
            index,
            addr.port(),
            "downloaded-".into(),
            callback,
        )
        .await;

        assert!(matches!(
            seen.lock().unwrap().last(),
            Some(TransferStatus::Completed { .. })
        ));

        server.shutdown().await;
    }
}
