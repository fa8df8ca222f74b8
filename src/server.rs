use std::sync::Arc;

use pingora::prelude::*;
use pingora::server::RunArgs;
use pingora::server::Server as PingoraServer;
use pingora::server::configuration::Opt;
use pingora::services::background::GenBackgroundService;

use crate::configuration::ServerConfig;
use crate::credential::{Credential, CredentialReloader};
use crate::directory::ServiceDirectory;
use crate::directory::nomad::NomadClient;
use crate::lb::Ingress;
use crate::metric::Metrics;
use crate::registry::DomainRegistry;
use crate::sync::{SyncService, Synchronizer};

pub struct Server {
    server: PingoraServer,
}

impl Server {
    pub fn new(opt: Option<Opt>) -> Result<Self> {
        let server = PingoraServer::new(opt)?;
        Ok(Server { server })
    }

    /// Wire the proxy, synchronizer and token reloader against a Nomad
    /// directory. Fails when the configured token cannot be read.
    pub fn bootstrap(
        &mut self,
        server_conf: ServerConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<DomainRegistry>> {
        server_conf.validate().map_err(|e| {
            Error::explain(ErrorType::InternalError, format!("invalid config: {e}"))
        })?;

        let credential = Arc::new(Credential::new(server_conf.nomad.token_path.clone()));
        credential.load().map_err(|e| {
            Error::explain(
                ErrorType::InternalError,
                format!("failed to load directory token: {e}"),
            )
        })?;

        let directory = Arc::new(NomadClient::new(&server_conf.nomad, credential.clone()));
        let registry = self.bootstrap_with(
            directory,
            server_conf.services,
            &server_conf.listen,
            metrics,
        );

        if credential.path().is_some() {
            let reloader = CredentialReloader::new(credential);
            let background =
                GenBackgroundService::new("token reloader".to_string(), Arc::new(reloader));
            self.server.add_service(background);
        }

        Ok(registry)
    }

    /// Wire the proxy and synchronizer against any directory.
    ///
    /// Every task shares the returned registry.
    pub fn bootstrap_with<D: ServiceDirectory + 'static>(
        &mut self,
        directory: Arc<D>,
        services: Vec<String>,
        listen_addr: &str,
        metrics: Arc<Metrics>,
    ) -> Arc<DomainRegistry> {
        self.server.bootstrap();

        let registry = Arc::new(DomainRegistry::new());

        let synchronizer = Synchronizer::new(directory, registry.clone(), services);
        let background = GenBackgroundService::new(
            "directory synchronizer".to_string(),
            Arc::new(SyncService::new(synchronizer)),
        );
        self.server.add_service(background);

        let mut lb_service = http_proxy_service(
            &self.server.configuration,
            Ingress::new(registry.clone(), metrics),
        );
        lb_service.add_tcp(listen_addr);
        self.server.add_service(lb_service);

        registry
    }

    pub fn run_forever(self) {
        self.server.run_forever();
    }

    pub fn run(self, args: RunArgs) {
        self.server.run(args);
    }
}
