use async_trait::async_trait;
use klarfunk_proto::config::ConnectivityConfig;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// "Is the network plainly reachable?"
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Opens a TCP connection to each configured host in turn; the first success
/// wins.  A disabled probe always reports reachable.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    enabled: bool,
    hosts: Vec<String>,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn from_config(config: &ConnectivityConfig) -> Self {
        Self {
            enabled: config.enabled,
            hosts: config.hosts.clone(),
            port: config.port,
            timeout: config.timeout(),
        }
    }
}

#[async_trait]
impl Reachability for TcpProbe {
    async fn is_reachable(&self) -> bool {
        if !self.enabled {
            return true;
        }
        for host in &self.hosts {
            match tokio::time::timeout(self.timeout, TcpStream::connect((host.as_str(), self.port))).await {
                Ok(Ok(_)) => {
                    debug!("connectivity: {}:{} reachable", host, self.port);
                    return true;
                }
                Ok(Err(e)) => debug!("connectivity: {}:{}: {}", host, self.port, e),
                Err(_) => debug!("connectivity: {}:{} timed out", host, self.port),
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn probe(hosts: &[&str], port: u16) -> TcpProbe {
        TcpProbe::from_config(&ConnectivityConfig {
            enabled: true,
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            port,
            timeout_secs: 1.0,
        })
    }

    #[tokio::test]
    async fn test_reachable_when_any_host_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe(&["127.0.0.1"], port).is_reachable().await);
    }

    #[tokio::test]
    async fn test_unreachable_when_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!probe(&["127.0.0.1"], port).is_reachable().await);
    }

    #[tokio::test]
    async fn test_disabled_probe_is_always_reachable() {
        let mut p = probe(&[], 53);
        p.enabled = false;
        assert!(p.is_reachable().await);
    }
}
