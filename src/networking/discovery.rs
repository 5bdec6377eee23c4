use anyhow::{anyhow, Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use local_ip_address::local_ip;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::DISCOVERY_TOKEN;

/// Called with the address of every newly discovered peer, so the
/// presentation layer can refresh its view.
pub type PeerObserver = Arc<dyn Fn(IpAddr) + Send + Sync>;

/// Addresses heard announcing presence. Peers are kept for the life of the
/// process; there is no expiry.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<Mutex<HashSet<IpAddr>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an address. Returns true if it was not known before.
    pub fn insert(&self, addr: IpAddr) -> bool {
        self.peers.lock().unwrap().insert(addr)
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.peers.lock().unwrap().contains(addr)
    }

    /// Sorted copy of the currently known peers.
    pub fn snapshot(&self) -> Vec<IpAddr> {
        let mut peers: Vec<IpAddr> = self.peers.lock().unwrap().iter().copied().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().unwrap().is_empty()
    }
}

/// Presence announcement service: a beacon that periodically broadcasts the
/// discovery token and a listener that records every address the token is
/// heard from.
///
/// Socket failures inside the running tasks are logged and end that task
/// only; the rest of the node keeps running.
pub struct Discovery {
    discovery_port: u16,
    beacon_interval: Duration,
    peers: PeerRegistry,
    beacon_shutdown: Option<mpsc::Sender<()>>,
    listener_shutdown: Option<mpsc::Sender<()>>,
}

impl Discovery {
    pub fn new(discovery_port: u16, beacon_interval: Duration, peers: PeerRegistry) -> Self {
        Self {
            discovery_port,
            beacon_interval,
            peers,
            beacon_shutdown: None,
            listener_shutdown: None,
        }
    }

    /// Start announcing this node to every broadcast domain it is attached to.
    pub async fn start_beacon(&mut self) -> Result<()> {
        let targets = broadcast_targets(self.discovery_port);
        self.start_beacon_with_targets(targets).await
    }

    /// Start the beacon against an explicit target list.
    pub async fn start_beacon_with_targets(&mut self, targets: Vec<SocketAddr>) -> Result<()> {
        if targets.is_empty() {
            return Err(anyhow!("no beacon targets"));
        }

        let (tx, mut rx) = mpsc::channel(1);
        self.beacon_shutdown = Some(tx);

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("failed to bind beacon socket")?;
        socket
            .set_broadcast(true)
            .context("failed to enable broadcast on beacon socket")?;

        let interval_period = self.beacon_interval;
        info!(
            "beacon announcing every {:?} to {} target(s)",
            interval_period,
            targets.len()
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval_period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for target in &targets {
                            if let Err(e) = socket.send_to(DISCOVERY_TOKEN, target).await {
                                error!("beacon send to {} failed, stopping beacon: {}", target, e);
                                return;
                            }
                        }
                    }
                    _ = rx.recv() => {
                        debug!("beacon stopped");
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    /// Bind the discovery port and start recording announcing peers.
    /// Returns the bound address (useful when the port was 0).
    pub async fn start_listener(&mut self, observer: Option<PeerObserver>) -> Result<SocketAddr> {
        let (tx, mut rx) = mpsc::channel(1);
        self.listener_shutdown = Some(tx);

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.discovery_port))
            .await
            .with_context(|| format!("failed to bind discovery port {}", self.discovery_port))?;
        let local = socket.local_addr()?;
        info!("discovery listener bound on {}", local);

        let peers = self.peers.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, from)) => {
                            // Anything but the exact token is not an announcement.
                            if &buf[..len] != DISCOVERY_TOKEN {
                                continue;
                            }
                            let addr = from.ip();
                            if peers.insert(addr) {
                                info!("new peer discovered: {}", addr);
                                if let Some(observer) = &observer {
                                    observer(addr);
                                }
                            }
                        }
                        Err(e) => {
                            error!("discovery receive failed, stopping listener: {}", e);
                            return;
                        }
                    },
                    _ = rx.recv() => {
                        debug!("discovery listener stopped");
                        return;
                    }
                }
            }
        });

        Ok(local)
    }

    /// Stop the beacon and listener tasks.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.beacon_shutdown.take() {
            let _ = tx.send(()).await;
        }
        if let Some(tx) = self.listener_shutdown.take() {
            let _ = tx.send(()).await;
        }
    }
}

/// Broadcast address of every usable IPv4 interface, falling back to the
/// limited broadcast address when none can be determined.
pub fn broadcast_targets(port: u16) -> Vec<SocketAddr> {
    let mut targets = Vec::new();

    match get_if_addrs() {
        Ok(interfaces) => {
            for interface in interfaces {
                if let IfAddr::V4(v4) = interface.addr {
                    if v4.ip.is_loopback() {
                        continue;
                    }
                    if let Some(broadcast) = v4.broadcast {
                        debug!(
                            "broadcast target {} via interface {}",
                            broadcast, interface.name
                        );
                        targets.push(SocketAddr::from((broadcast, port)));
                    }
                }
            }
        }
        Err(e) => warn!("failed to enumerate network interfaces: {}", e),
    }

    targets.sort();
    targets.dedup();
    if targets.is_empty() {
        targets.push(SocketAddr::from((Ipv4Addr::BROADCAST, port)));
    }
    targets
}

/// The address this node is reachable at on the local network.
pub fn local_address() -> Result<IpAddr> {
    local_ip().map_err(|e| {
        error!("failed to determine local IP: {}", e);
        anyhow!("failed to determine local IP: {}", e)
    })
}
