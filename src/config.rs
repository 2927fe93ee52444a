use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::listing::ServerAddress;
use crate::orchestrator::OrchestratorConfig;

/// Everything needed to wire up a client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address obtained from the discovery handshake, e.g. `192.168.1.20:8080`.
    pub server: String,
    /// Applies to listing requests and to connecting for downloads.
    pub request_timeout: Option<Duration>,
    /// A download with no progress for this long fails.
    pub idle_timeout: Option<Duration>,
    pub download_dir: PathBuf,
    pub max_concurrent: usize,
    pub history_limit: usize,
    pub journal_path: Option<PathBuf>,
    pub gallery_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            request_timeout: Some(Duration::from_secs(15)),
            idle_timeout: Some(Duration::from_secs(60)),
            download_dir: PathBuf::from("./downloads"),
            max_concurrent: 4,
            history_limit: 50,
            journal_path: None,
            gallery_dir: None,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            return Err(Error::InvalidAddress("no server address configured".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(Error::Unknown("max_concurrent must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn server_address(&self) -> Result<ServerAddress> {
        ServerAddress::parse(&self.server)
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent: self.max_concurrent,
            history_limit: self.history_limit,
            idle_timeout: self.idle_timeout,
            journal_path: self.journal_path.clone(),
        }
    }
}

/// Seconds from the command line or environment; `0` disables the timeout.
pub fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_needs_a_server() {
        let config = ClientConfig::default();
        assert!(config.validate().is_err());

        let config = ClientConfig {
            server: "10.0.0.2:5000".into(),
            ..ClientConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.server_address().unwrap().as_str(), "http://10.0.0.2:5000");
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = ClientConfig {
            server: "10.0.0.2:5000".into(),
            max_concurrent: 0,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn orchestrator_settings_carry_over() {
        let config = ClientConfig {
            history_limit: 7,
            idle_timeout: timeout_from_secs(0),
            ..ClientConfig::default()
        };
        let orchestrator = config.orchestrator();
        assert_eq!(orchestrator.history_limit, 7);
        assert_eq!(orchestrator.idle_timeout, None);
        assert_eq!(timeout_from_secs(3), Some(Duration::from_secs(3)));
    }
}
