//! Discovery packet formats.
//!
//! Printers announce themselves with SSDP-style text frames carrying a set of
//! vendor-namespaced headers. Announcements (`NOTIFY`) are broadcast; replies
//! to an `M-SEARCH` go unicast to the requester as an HTTP-style `200 OK`.
//! Header order and spelling follow what real devices emit, since some
//! slicer builds parse these frames positionally.

use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};

/// Device-type URN used in `NT`/`ST` headers and searched for by slicers.
pub const DEVICE_URN: &str = "urn:bambulab-com:device:3dprinter:1";

/// Multicast group slicers send `M-SEARCH` requests to.
pub const DISCOVERY_MULTICAST: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// Literal marker identifying a discovery request.
pub const SEARCH_MARKER: &str = "M-SEARCH";

/// Interval between unsolicited announcements.
pub const ANNOUNCE_INTERVAL_SECS: u64 = 30;

const CACHE_CONTROL: &str = "max-age=1800";

/// Everything a discovery frame says about the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub serial: String,
    pub model_code: String,
    pub name: String,
    /// Address slicers should connect to (the `Location` header).
    pub location: IpAddr,
    pub signal_dbm: i32,
    pub firmware: String,
}

#[derive(Clone, Copy)]
enum Kind {
    Alive,
    ByeBye,
    SearchResponse,
}

impl Advertisement {
    /// Periodic `NOTIFY ... ssdp:alive` announcement.
    pub fn notify(&self) -> String {
        self.render(Kind::Alive)
    }

    /// `NOTIFY ... ssdp:byebye` sent once when the responder stops.
    pub fn byebye(&self) -> String {
        self.render(Kind::ByeBye)
    }

    /// Unicast `200 OK` reply to an `M-SEARCH`.
    pub fn search_response(&self) -> String {
        self.render(Kind::SearchResponse)
    }

    fn render(&self, kind: Kind) -> String {
        let mut out = String::with_capacity(512);
        match kind {
            Kind::Alive | Kind::ByeBye => {
                out.push_str("NOTIFY * HTTP/1.1\r\n");
                let _ = write!(out, "HOST: {DISCOVERY_MULTICAST}:1900\r\n");
            }
            Kind::SearchResponse => {
                out.push_str("HTTP/1.1 200 OK\r\n");
            }
        }
        out.push_str("Server: UPnP/1.0\r\n");
        let _ = write!(out, "Location: {}\r\n", self.location);
        match kind {
            Kind::Alive => {
                let _ = write!(out, "NT: {DEVICE_URN}\r\nNTS: ssdp:alive\r\n");
            }
            Kind::ByeBye => {
                let _ = write!(out, "NT: {DEVICE_URN}\r\nNTS: ssdp:byebye\r\n");
            }
            Kind::SearchResponse => {
                let _ = write!(out, "ST: {DEVICE_URN}\r\nEXT:\r\n");
            }
        }
        let _ = write!(out, "USN: {}\r\n", self.serial);
        let _ = write!(out, "Cache-Control: {CACHE_CONTROL}\r\n");
        let _ = write!(out, "DevModel.bambu.com: {}\r\n", self.model_code);
        let _ = write!(out, "DevName.bambu.com: {}\r\n", self.name);
        let _ = write!(out, "DevSignal.bambu.com: {}\r\n", self.signal_dbm);
        out.push_str("DevConnect.bambu.com: lan\r\n");
        out.push_str("DevBind.bambu.com: free\r\n");
        out.push_str("Devseclink.bambu.com: secure\r\n");
        out.push_str("DevInf.bambu.com: wlan0\r\n");
        let _ = write!(out, "DevVersion.bambu.com: {}\r\n", self.firmware);
        out.push_str("DevCap.bambu.com: 1\r\n");
        out.push_str("\r\n");
        out
    }
}

/// Whether a datagram is an `M-SEARCH` for our device type.
pub fn is_search_request(payload: &str) -> bool {
    payload.contains(SEARCH_MARKER) && names_device_type(payload)
}

/// Whether a datagram mentions our device-type URN anywhere.
pub fn names_device_type(payload: &str) -> bool {
    payload.contains(DEVICE_URN)
}

/// Value of the first header named `name` (case-insensitive), trimmed.
pub fn header_value<'a>(packet: &'a str, name: &str) -> Option<&'a str> {
    packet.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

/// Rewrite the `Location` header to `addr`, leaving every other byte intact.
///
/// Returns `None` when the packet has no `Location` header.
pub fn rewrite_location(packet: &str, addr: IpAddr) -> Option<String> {
    let mut out = String::with_capacity(packet.len() + 16);
    let mut rewritten = false;

    for line in packet.split_inclusive('\n') {
        let body = line.trim_end_matches(['\r', '\n']);
        let ending = &line[body.len()..];
        match body.split_once(':') {
            Some((key, _)) if !rewritten && key.trim().eq_ignore_ascii_case("location") => {
                let _ = write!(out, "{key}: {addr}{ending}");
                rewritten = true;
            }
            _ => out.push_str(line),
        }
    }

    rewritten.then_some(out)
}
