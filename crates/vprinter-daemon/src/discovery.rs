//! Discovery responder.
//!
//! Announces the virtual printer on the discovery port and answers
//! `M-SEARCH` requests. A bind failure is the caller's to log; the rest of
//! the stack starts without discovery in that case.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vprinter_core::DeviceIdentity;
use vprinter_core::identity::FIRMWARE_VERSION;
use vprinter_core::ssdp::{self, ANNOUNCE_INTERVAL_SECS, Advertisement, DISCOVERY_MULTICAST};

const MAX_DATAGRAM: usize = 2048;

/// Signal strength advertised for the emulated Wi-Fi link.
pub const ADVERTISED_SIGNAL_DBM: i32 = -44;

/// Build the advertisement for an identity reachable at `location`.
pub fn advertisement(identity: &DeviceIdentity, location: IpAddr) -> Advertisement {
    Advertisement {
        serial: identity.serial.clone(),
        model_code: identity.model_code.clone(),
        name: identity.display_name.clone(),
        location,
        signal_dbm: ADVERTISED_SIGNAL_DBM,
        firmware: FIRMWARE_VERSION.to_string(),
    }
}

/// A bound discovery responder.
///
/// Searches arrive on a wildcard socket so broadcast and multicast datagrams
/// reach it. Replies and announcements leave from the configured address.
pub struct DiscoveryResponder {
    socket: UdpSocket,
    sender: Option<UdpSocket>,
    advert: Advertisement,
    announce_to: SocketAddr,
}

impl DiscoveryResponder {
    /// Listen on the discovery port of every interface, join the discovery
    /// multicast group on `bind`, and send from `bind` unless it is itself a
    /// wildcard address.
    pub async fn bind(bind: IpAddr, port: u16, advert: Advertisement) -> std::io::Result<Self> {
        let wildcard = match bind {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind((wildcard, port)).await?;
        socket.set_broadcast(true)?;
        let iface = match bind {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        if let Err(e) = socket.join_multicast_v4(DISCOVERY_MULTICAST, iface) {
            warn!(error = %e, "Failed to join discovery multicast group");
        }

        let sender = if bind.is_unspecified() {
            None
        } else {
            let sender = UdpSocket::bind((bind, 0)).await?;
            sender.set_broadcast(true)?;
            Some(sender)
        };

        let port = socket.local_addr()?.port();
        Ok(Self {
            socket,
            sender,
            advert,
            announce_to: SocketAddr::from((Ipv4Addr::BROADCAST, port)),
        })
    }

    /// Send announcements to `addr` instead of the limited broadcast address.
    #[must_use]
    pub const fn with_announce_target(mut self, addr: SocketAddr) -> Self {
        self.announce_to = addr;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn outbound(&self) -> &UdpSocket {
        self.sender.as_ref().unwrap_or(&self.socket)
    }

    /// Reply owed to a received datagram, if any.
    pub fn reply_for(&self, payload: &[u8]) -> Option<String> {
        let text = std::str::from_utf8(payload).ok()?;
        ssdp::is_search_request(text).then(|| self.advert.search_response())
    }

    /// Announce, answer searches and re-announce until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            addr = ?self.socket.local_addr().ok(),
            source = ?self.outbound().local_addr().ok(),
            serial = %self.advert.serial,
            location = %self.advert.location,
            "Discovery responder running"
        );

        // interval's first tick is immediate and doubles as the startup announcement
        let mut timer = tokio::time::interval(Duration::from_secs(ANNOUNCE_INTERVAL_SECS));
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = timer.tick() => self.announce(&self.advert.notify()).await,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        if let Some(reply) = self.reply_for(&buf[..len]) {
                            debug!(from = %from, "Answering discovery search");
                            if let Err(e) = self.outbound().send_to(reply.as_bytes(), from).await {
                                warn!(error = %e, to = %from, "Discovery reply failed");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Discovery receive failed"),
                },
                _ = shutdown.changed() => break,
            }
        }

        self.announce(&self.advert.byebye()).await;
        info!("Discovery responder stopped");
    }

    async fn announce(&self, packet: &str) {
        if let Err(e) = self.outbound().send_to(packet.as_bytes(), self.announce_to).await {
            warn!(error = %e, to = %self.announce_to, "Discovery announcement failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::derive("C12", Some("TestPrinter"))
            .unwrap()
            .with_serial("TEST123")
    }

    async fn recv_from(socket: &UdpSocket) -> (String, SocketAddr) {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("nothing received")
            .unwrap();
        (String::from_utf8(buf[..len].to_vec()).unwrap(), from)
    }

    async fn recv_text(socket: &UdpSocket) -> String {
        recv_from(socket).await.0
    }

    fn search() -> String {
        format!(
            "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1990\r\nMAN: \"ssdp:discover\"\r\nST: {}\r\n\r\n",
            ssdp::DEVICE_URN
        )
    }

    #[tokio::test]
    async fn announces_answers_and_says_goodbye() {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let observer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder = DiscoveryResponder::bind(loopback, 0, advertisement(&identity(), loopback))
            .await
            .unwrap()
            .with_announce_target(observer.local_addr().unwrap());
        let port = responder.local_addr().unwrap().port();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(responder.run(rx));

        let notify = recv_text(&observer).await;
        assert!(notify.starts_with("NOTIFY"));
        assert!(notify.contains("DevName.bambu.com: TestPrinter"));
        assert!(notify.contains("USN: TEST123"));

        let slicer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        slicer.send_to(search().as_bytes(), (loopback, port)).await.unwrap();
        let response = recv_text(&slicer).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("DevName.bambu.com: TestPrinter"));
        assert!(response.contains("USN: TEST123"));

        tx.send(true).unwrap();
        task.await.unwrap();
        let goodbye = recv_text(&observer).await;
        assert!(goodbye.contains("NTS: ssdp:byebye"));
    }

    #[tokio::test]
    async fn listens_on_every_address_and_replies_from_the_configured_one() {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let observer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder = DiscoveryResponder::bind(loopback, 0, advertisement(&identity(), loopback))
            .await
            .unwrap()
            .with_announce_target(observer.local_addr().unwrap());
        let listening = responder.local_addr().unwrap();
        assert!(listening.ip().is_unspecified());

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(responder.run(rx));
        let (_, announced_from) = recv_from(&observer).await;
        assert_eq!(announced_from.ip(), loopback);

        // Linux routes all of 127.0.0.0/8 to lo, so this address is local but
        // not the configured one.
        let other = Ipv4Addr::new(127, 0, 0, 2);
        let slicer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        slicer.send_to(search().as_bytes(), (other, listening.port())).await.unwrap();
        let (response, from) = recv_from(&slicer).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(from.ip(), loopback);

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn ignores_unrelated_datagrams() {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let responder = DiscoveryResponder::bind(loopback, 0, advertisement(&identity(), loopback))
            .await
            .unwrap();
        assert!(responder.reply_for(b"M-SEARCH * HTTP/1.1\r\nST: ssdp:all\r\n\r\n").is_none());
        assert!(responder.reply_for(&[0xff, 0x00]).is_none());
    }

    #[tokio::test]
    async fn bind_conflict_is_an_error() {
        let taken = UdpSocket::bind("0.0.0.0:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let result =
            DiscoveryResponder::bind(loopback, port, advertisement(&identity(), loopback)).await;
        assert!(result.is_err());
    }
}
