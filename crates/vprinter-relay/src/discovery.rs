//! Cross-interface discovery rebroadcast.
//!
//! Used when the printer and the slicers sit on different interfaces of the
//! relay host. Announcements from the real printer are picked up on the
//! printer side, their `Location` header is pointed at the relay's
//! slicer-side address, and the result is broadcast on the slicer side. The
//! last relayed packet is repeated every announce interval so the device
//! stays visible even when the printer's own announcements are missed.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vprinter_core::ssdp::{self, ANNOUNCE_INTERVAL_SECS, DISCOVERY_MULTICAST};

use crate::error::RelayError;

const MAX_DATAGRAM: usize = 4096;

/// Filter and rewrite one datagram received on the printer side.
///
/// Only packets sent by `target` that name the printer device type are
/// relayed; everything else yields `None`.
pub fn relay_packet(
    target: IpAddr,
    advertise: IpAddr,
    source: IpAddr,
    payload: &[u8],
) -> Option<String> {
    if vprinter_core::net::canonical_ip(source) != target {
        return None;
    }
    let text = std::str::from_utf8(payload).ok()?;
    if !ssdp::names_device_type(text) {
        return None;
    }
    ssdp::rewrite_location(text, advertise)
}

/// A bound discovery relay, ready to run.
pub struct DiscoveryRelay {
    target: IpAddr,
    advertise: IpAddr,
    listen: UdpSocket,
    broadcast: UdpSocket,
    destination: SocketAddr,
}

impl DiscoveryRelay {
    /// Bind the printer-side listener on `port` and a broadcast socket on
    /// `slicer_side`.
    ///
    /// `printer_side` selects the interface used for the multicast group
    /// membership; the listener itself is bound to the wildcard address so
    /// it also sees broadcasts.
    pub async fn bind(
        target: IpAddr,
        printer_side: IpAddr,
        slicer_side: IpAddr,
        port: u16,
    ) -> Result<Self, RelayError> {
        let listen_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listen = UdpSocket::bind(listen_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: listen_addr,
                source,
            })?;
        listen.set_broadcast(true)?;
        let iface = match printer_side {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        if let Err(e) = listen.join_multicast_v4(DISCOVERY_MULTICAST, iface) {
            warn!(error = %e, iface = %iface, "Failed to join discovery multicast group");
        }

        let broadcast_addr = SocketAddr::from((slicer_side, 0));
        let broadcast = UdpSocket::bind(broadcast_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: broadcast_addr,
                source,
            })?;
        broadcast.set_broadcast(true)?;

        let port = listen.local_addr()?.port();
        Ok(Self {
            target,
            advertise: slicer_side,
            listen,
            broadcast,
            destination: SocketAddr::from((Ipv4Addr::BROADCAST, port)),
        })
    }

    /// Send relayed packets to `destination` instead of the limited broadcast
    /// address.
    #[must_use]
    pub const fn with_destination(mut self, destination: SocketAddr) -> Self {
        self.destination = destination;
        self
    }

    /// Address the printer-side listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listen.local_addr()
    }

    /// Relay until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            target = %self.target,
            advertise = %self.advertise,
            destination = %self.destination,
            "Discovery relay running"
        );

        let mut cached: Option<String> = None;
        let mut timer = tokio::time::interval(Duration::from_secs(ANNOUNCE_INTERVAL_SECS));
        timer.tick().await; // Skip first immediate tick
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                received = self.listen.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        if let Some(packet) =
                            relay_packet(self.target, self.advertise, from.ip(), &buf[..len])
                        {
                            debug!(from = %from, "Relaying printer announcement");
                            self.send(&packet).await;
                            cached = Some(packet);
                        }
                    }
                    Err(e) => warn!(error = %e, "Discovery relay receive failed"),
                },
                _ = timer.tick() => {
                    if let Some(packet) = &cached {
                        self.send(packet).await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Discovery relay stopped");
    }

    async fn send(&self, packet: &str) {
        if let Err(e) = self.broadcast.send_to(packet.as_bytes(), self.destination).await {
            warn!(error = %e, destination = %self.destination, "Discovery rebroadcast failed");
        }
    }
}
