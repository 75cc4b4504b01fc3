//! URL parser for the zixi:// scheme.
//! Format: zixi://host[:port]/channel

use thiserror::Error;

/// Default broadcaster port when the URL carries none.
pub const DEFAULT_PORT: u16 = 2088;

const SCHEME: &str = "zixi://";

/// Reasons a zixi:// URL fails to parse.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlError {
    #[error("URL must start with zixi://")]
    Scheme,
    #[error("URL host is empty")]
    EmptyHost,
    #[error("URL has no channel component")]
    MissingChannel,
    #[error("URL channel is empty")]
    EmptyChannel,
    #[error("URL port is not a valid 16-bit number")]
    Port,
}

/// Parsed zixi:// URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZixiUrl {
    pub host: String,
    pub port: u16,
    pub channel: String,
}

impl ZixiUrl {
    /// Parse a zixi:// URL.
    ///
    /// The host and channel must be non-empty; the port is decimal and
    /// defaults to 2088 when absent. Anything after the first `/` belongs
    /// to the channel, including further separators.
    pub fn parse(url: &str) -> Result<Self, UrlError> {
        let rest = url.strip_prefix(SCHEME).ok_or(UrlError::Scheme)?;

        let slash = rest.find('/').ok_or(UrlError::MissingChannel)?;
        let (host_port, channel) = (&rest[..slash], &rest[slash + 1..]);

        let (host, port) = match host_port.find(':') {
            Some(colon) => {
                let port = host_port[colon + 1..]
                    .parse::<u16>()
                    .map_err(|_| UrlError::Port)?;
                (&host_port[..colon], port)
            }
            None => (host_port, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(UrlError::EmptyHost);
        }
        if channel.is_empty() {
            return Err(UrlError::EmptyChannel);
        }

        Ok(Self {
            host: host.to_string(),
            port,
            channel: channel.to_string(),
        })
    }
}

impl std::fmt::Display for ZixiUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "zixi://{}:{}/{}", self.host, self.port, self.channel)
    }
}
