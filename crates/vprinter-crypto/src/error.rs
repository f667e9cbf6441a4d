//! Certificate and TLS error types.

/// Errors from certificate issuance, persistence and TLS setup.
///
/// All of these are fatal to starting the emulation mode that asked for a
/// certificate chain; callers surface them rather than retrying.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("Certificate generation error: {0}")]
    Generation(String),

    #[error("Certificate parse error: {0}")]
    Parse(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CertError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl From<rcgen::Error> for CertError {
    fn from(e: rcgen::Error) -> Self {
        Self::Generation(e.to_string())
    }
}

impl From<rustls::Error> for CertError {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}
