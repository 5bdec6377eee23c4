use anyhow::Result;
use log::info;
use std::net::IpAddr;

use crate::config::ShareConfig;
use crate::networking::discovery::{self, Discovery, PeerObserver, PeerRegistry};
use crate::networking::index::FileIndex;
use crate::networking::transfer::{fetch_file, StatusCallback, TransferServer};

/// The share node core: owns the peer registry, the file index, and the
/// background services, and exposes the three operations the presentation
/// layer (CLI menu, GUI) consumes.
pub struct ShareNode {
    config: ShareConfig,
    peers: PeerRegistry,
    index: FileIndex,
    discovery: Discovery,
    server: TransferServer,
}

impl ShareNode {
    /// Set up a node: create the shared directory if missing and resolve the
    /// address peers will find this node's files under.
    pub fn new(config: ShareConfig) -> Result<Self> {
        config.ensure_shared_dir()?;
        let local_addr = discovery::local_address()?;

        let peers = PeerRegistry::new();
        let index = FileIndex::new(config.shared_dir.clone(), local_addr);
        let discovery = Discovery::new(
            config.discovery_port,
            config.beacon_interval,
            peers.clone(),
        );
        let server = TransferServer::new(config.shared_dir.clone(), config.transfer_port);

        Ok(Self {
            config,
            peers,
            index,
            discovery,
            server,
        })
    }

    /// Index the shared directory and start the transfer server, discovery
    /// listener, and beacon. The observer is invoked for every newly
    /// discovered peer.
    pub async fn start(&mut self, observer: Option<PeerObserver>) -> Result<()> {
        let indexed = self.index.refresh()?;
        info!(
            "sharing {} file(s) from {} as {}",
            indexed,
            self.config.shared_dir.display(),
            self.index.local_addr()
        );

        self.server.start().await?;
        self.discovery.start_listener(observer).await?;
        self.discovery.start_beacon().await?;
        Ok(())
    }

    /// Addresses heard announcing presence so far.
    pub fn known_peers(&self) -> Vec<IpAddr> {
        self.peers.snapshot()
    }

    /// Refresh the file index from the shared directory and return the
    /// indexed names.
    pub fn shared_files(&self) -> Result<Vec<String>> {
        self.index.refresh()?;
        Ok(self.index.file_names())
    }

    /// Request a file by name on its own task; progress and outcome arrive
    /// through the callback, so the caller never blocks on network I/O.
    pub fn request_file(&self, name: &str, callback: StatusCallback) {
        tokio::spawn(fetch_file(
            name.to_string(),
            self.index.clone(),
            self.config.transfer_port,
            self.config.download_prefix.clone(),
            callback,
        ));
    }

    /// The address this node advertises its files under.
    pub fn local_addr(&self) -> IpAddr {
        self.index.local_addr()
    }

    /// Stop all background services.
    pub async fn shutdown(&mut self) {
        self.discovery.shutdown().await;
        self.server.shutdown().await;
    }
}
