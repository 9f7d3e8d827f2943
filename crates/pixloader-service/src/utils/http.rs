use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use once_cell::sync::Lazy;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header;

use crate::config::Config;

static RESERVED_IP_BLOCKS: Lazy<Vec<Ipv4Network>> = Lazy::new(|| {
    [
        // https://en.wikipedia.org/wiki/Reserved_IP_addresses#IPv4
        "0.0.0.0/8",
        "10.0.0.0/8",
        "100.64.0.0/10",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.0.0.0/29",
        "192.0.2.0/24",
        "192.88.99.0/24",
        "192.168.0.0/16",
        "198.18.0.0/15",
        "198.51.100.0/24",
        "224.0.0.0/4",
        "240.0.0.0/4",
        "255.255.255.255/32",
    ]
    .into_iter()
    .filter_map(|x| x.parse().ok())
    .collect()
});

/// Whether `ip` is allowed when connections to reserved IPs are disabled.
pub fn is_external_ip(ip: IpAddr) -> bool {
    let IpAddr::V4(addr) = ip else {
        // We don't know what is an internal service in IPv6 and what is not. Just
        // bail out. This effectively means that we don't support IPv6.
        return false;
    };

    for network in &*RESERVED_IP_BLOCKS {
        if network.contains(addr) {
            metric!(counter("http.blocked_ip") += 1);
            tracing::debug!(
                "Blocked attempt to connect to reserved IP address: {}",
                addr
            );
            return false;
        }
    }

    true
}

/// Various timeouts for the HTTP fetcher.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the first headers.
    pub head: Duration,
    /// Global timeout for one fetch.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            head: config.head_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(500),
            head: Duration::from_secs(5),
            max_download: Duration::from_secs(60),
        }
    }
}

/// A resolver that drops all reserved addresses from the lookup result.
#[derive(Debug)]
struct ExternalOnlyResolver;

impl Resolve for ExternalOnlyResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(resolve_external(name))
    }
}

async fn resolve_external(name: Name) -> Result<Addrs, Box<dyn std::error::Error + Send + Sync>> {
    let host = format!("{}:0", name.as_str());
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(host)
        .await?
        .filter(|addr| is_external_ip(addr.ip()))
        .collect();
    Ok(Box::new(addrs.into_iter()))
}

/// Creates a [`reqwest::Client`] with the provided options.
///
/// * `timeouts` controls connection and download timeouts.
/// * `connect_to_reserved_ips` determines whether the client is allowed to
///   connect to reserved IPs (as defined in `RESERVED_IP_BLOCKS`).
/// * `user_agent` is sent with every request.
pub fn create_client(
    timeouts: &DownloadTimeouts,
    connect_to_reserved_ips: bool,
    user_agent: &str,
) -> reqwest::Result<reqwest::Client> {
    let mut headers = header::HeaderMap::new();
    if let Ok(value) = header::HeaderValue::from_str(user_agent) {
        headers.insert(header::USER_AGENT, value);
    }

    let mut builder = reqwest::ClientBuilder::new()
        .gzip(true)
        .default_headers(headers)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30));

    if !connect_to_reserved_ips {
        builder = builder.dns_resolver(Arc::new(ExternalOnlyResolver));
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ips() {
        assert!(!is_external_ip("127.0.0.1".parse().unwrap()));
        assert!(!is_external_ip("10.1.2.3".parse().unwrap()));
        assert!(!is_external_ip("192.168.0.10".parse().unwrap()));
        assert!(!is_external_ip("::1".parse().unwrap()));
        assert!(is_external_ip("8.8.8.8".parse().unwrap()));
        assert!(is_external_ip("151.101.1.69".parse().unwrap()));
    }
}
