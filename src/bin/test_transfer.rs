use anyhow::Result;
use p2p_share_rust::config::DOWNLOAD_PREFIX;
use p2p_share_rust::networking::{fetch_file, FileIndex, TransferServer, TransferStatus};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    println!("=== Transfer Loopback Test Utility ===");
    println!("Serves a generated file from a scratch directory and fetches it back.");
    println!();

    let scratch = tempfile::tempdir()?;
    let shared_dir = scratch.path().join("shared");
    std::fs::create_dir_all(&shared_dir)?;
    std::fs::write(
        shared_dir.join("sample.txt"),
        b"loopback transfer sample payload\n",
    )?;

    let mut server = TransferServer::new(shared_dir.clone(), 0);
    let addr = server.start().await?;
    println!("Transfer server listening on {}", addr);

    let index = FileIndex::new(shared_dir, IpAddr::V4(Ipv4Addr::LOCALHOST));
    index.refresh()?;
    println!("Indexed {} file(s)", index.len());
    println!();

    let callback = Arc::new(|status: TransferStatus| println!("  status: {}", status));

    println!("Fetching an indexed file:");
    fetch_file(
        "sample.txt".to_string(),
        index.clone(),
        addr.port(),
        DOWNLOAD_PREFIX.to_string(),
        callback.clone(),
    )
    .await;

    println!("Fetching a name that was never indexed:");
    fetch_file(
        "missing.bin".to_string(),
        index,
        addr.port(),
        DOWNLOAD_PREFIX.to_string(),
        callback,
    )
    .await;

    server.shutdown().await;
    println!();
    println!("Done.");
    Ok(())
}
