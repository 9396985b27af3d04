//! UDP front end: binds the IKE port, feeds inbound datagrams into the
//! `Dispatcher`, and drives its timers on a fixed tick, mirroring the
//! original's single-threaded `select()` loop over one UDP socket
//! (`examples/original_source/protocol.py`'s `IkeSaController`).

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::network::ike::config::PeerConfigurations;
use crate::network::ike::dispatcher::{Dispatcher, Outbound};
use crate::network::ike::kernel::KernelInterface;
use crate::network::ike::IKEError;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 4096;

/// Commands the CLI front end can push into a running daemon.
pub enum DaemonCommand {
    Connect(Ipv4Addr),
    Disconnect(Ipv4Addr),
}

pub struct IkeDaemon<K: KernelInterface> {
    socket: Arc<UdpSocket>,
    port: u16,
    dispatcher: Dispatcher<K>,
}

impl<K: KernelInterface> IkeDaemon<K> {
    pub async fn bind(listen_addr: Ipv4Addr, listen_port: u16, configurations: PeerConfigurations, kernel: K) -> Result<Self, IKEError> {
        let socket = UdpSocket::bind((listen_addr, listen_port)).await?;
        tracing::info!(%listen_addr, listen_port, "ike daemon listening");
        Ok(IkeDaemon {
            socket: Arc::new(socket),
            port: listen_port,
            dispatcher: Dispatcher::new(listen_addr, Arc::new(configurations), kernel),
        })
    }

    /// Runs forever: receives datagrams, drives the dispatcher, and drains an
    /// operator command channel for "connect" requests.
    pub async fn run(mut self, mut commands: mpsc::Receiver<DaemonCommand>) -> Result<(), IKEError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut ticker = tokio::time::interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = result?;
                    let peer = match from.ip() {
                        IpAddr::V4(addr) => addr,
                        IpAddr::V6(_) => {
                            tracing::warn!(%from, "dropping non-IPv4 datagram");
                            continue;
                        }
                    };
                    if let Some(outbound) = self.dispatcher.handle_datagram(peer, &buf[..len]) {
                        self.send(outbound).await;
                    }
                }
                _ = ticker.tick() => {
                    for outbound in self.dispatcher.tick() {
                        self.send(outbound).await;
                    }
                }
                Some(cmd) = commands.recv() => {
                    match cmd {
                        DaemonCommand::Connect(peer) => {
                            if let Some(outbound) = self.dispatcher.initiate(peer) {
                                self.send(outbound).await;
                            } else {
                                tracing::warn!(%peer, "connect requested but no configuration/state for peer");
                            }
                        }
                        DaemonCommand::Disconnect(peer) => {
                            if let Some(outbound) = self.dispatcher.disconnect(peer) {
                                self.send(outbound).await;
                            } else {
                                tracing::warn!(%peer, "disconnect requested but no established session for peer");
                            }
                        }
                    }
                }
            }
        }
    }

    async fn send(&self, outbound: Outbound) {
        if let Err(e) = self.socket.send_to(&outbound.bytes, (outbound.to, self.port)).await {
            tracing::warn!(to = %outbound.to, error = %e, "failed to send IKE datagram");
        }
    }
}
