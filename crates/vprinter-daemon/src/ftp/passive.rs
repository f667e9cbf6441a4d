//! Passive data port pool.
//!
//! Ports cannot be reserved ahead of the OS, so the pool is just a range:
//! pick a random port, try to bind it, and retry on collision.

use std::io;
use std::net::{IpAddr, SocketAddr};

use rand::Rng;
use tokio::net::TcpListener;
use tracing::debug;

/// Bind attempts before giving up.
pub const BIND_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassivePorts {
    start: u16,
    end: u16,
}

impl PassivePorts {
    /// Inclusive range `start..=end`. A reversed range is normalised.
    pub const fn new(start: u16, end: u16) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub const fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    fn pick(&self) -> u16 {
        rand::thread_rng().gen_range(self.start..=self.end)
    }

    /// Bind a listener on `ip` at some free port of the pool.
    pub async fn bind(&self, ip: IpAddr) -> io::Result<TcpListener> {
        let mut last_err = None;
        for attempt in 1..=BIND_ATTEMPTS {
            let port = self.pick();
            match TcpListener::bind(SocketAddr::new(ip, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!(port, attempt, "Passive port in use, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no passive port")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_inside_the_range() {
        let pool = PassivePorts::new(52_100, 52_199);
        let listener = pool.bind("127.0.0.1".parse().unwrap()).await.unwrap();
        assert!(pool.contains(listener.local_addr().unwrap().port()));
    }

    #[tokio::test]
    async fn exhausted_single_port_pool_fails() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let pool = PassivePorts::new(port, port);

        let err = pool.bind("127.0.0.1".parse().unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn reversed_range_is_normalised() {
        let pool = PassivePorts::new(50_100, 50_000);
        assert!(pool.contains(50_000) && pool.contains(50_100));
        assert!(!pool.contains(50_101));
    }
}
