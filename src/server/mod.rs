// Server module - Pingora server setup
//
// Binds the listener, installs the proxy service and registers the
// long-lived maintenance tasks (cache janitor, memory monitor, optional
// prefetcher) as background services that receive the server's shutdown
// signal.

use pingora_core::server::Server;
use pingora_core::services::background::background_service;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::error::GatewayError;
use crate::handler::Gateway;
use crate::janitor::CacheJanitor;
use crate::prefetch::Prefetcher;
use crate::proxy::GatewayProxy;
use crate::resources::MemoryMonitor;

/// Listener settings derived from the configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub header_timeout: u64,
}

impl ServerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            address: config.listen_addr(),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            header_timeout: config.header_timeout,
        }
    }
}

pub struct GatewayServer {
    config: Arc<Config>,
    server_config: ServerConfig,
}

impl GatewayServer {
    pub fn new(config: Config) -> Result<Self, GatewayError> {
        config.validate()?;
        let server_config = ServerConfig::from_config(&config);
        Ok(Self {
            config: Arc::new(config),
            server_config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.server_config
    }

    /// Build the pipeline and run until shutdown. Blocks the calling
    /// thread; pingora owns the runtimes.
    pub fn run(self) -> Result<(), GatewayError> {
        let gateway = Arc::new(Gateway::new(Arc::clone(&self.config))?);

        let mut server = Server::new(None)
            .map_err(|e| GatewayError::config(format!("failed to create server: {}", e)))?;
        server.bootstrap();

        let proxy = GatewayProxy::new(Arc::clone(&gateway));
        let mut proxy_service =
            pingora_proxy::http_proxy_service(&server.configuration, proxy);
        proxy_service.add_tcp(&self.server_config.address);
        server.add_service(proxy_service);

        if self.config.max_cache_size > 0 {
            let roots: Vec<PathBuf> = [
                &self.config.remote_raw_path,
                &self.config.exhaust_path,
                &self.config.metadata_path,
            ]
            .iter()
            .map(PathBuf::from)
            .collect();
            let janitor = CacheJanitor::new(roots, self.config.max_cache_size);
            server.add_service(background_service("cache-janitor", janitor));
        }

        server.add_service(background_service("memory-monitor", MemoryMonitor));

        if self.config.prefetch {
            let prefetcher = Prefetcher::new(
                &self.config,
                gateway.metadata_store().clone(),
                gateway.convert_filter().clone(),
            );
            server.add_service(background_service("prefetcher", prefetcher));
        }

        tracing::info!(
            address = %self.server_config.address,
            read_timeout = self.server_config.read_timeout,
            write_timeout = self.server_config.write_timeout,
            header_timeout = self.server_config.header_timeout,
            "Pixelgate is running"
        );

        server.run_forever();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_from_config() {
        let mut config = Config::default();
        config.host = "127.0.0.1".to_string();
        config.port = 8080;
        let server_config = ServerConfig::from_config(&config);
        assert_eq!(server_config.address, "127.0.0.1:8080");
        assert_eq!(server_config.read_timeout, 30);
        assert_eq!(server_config.header_timeout, 10);
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let mut config = Config::default();
        config.quality = 250;
        assert!(GatewayServer::new(config).is_err());
    }
}
