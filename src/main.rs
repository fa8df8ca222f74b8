use std::path::Path;
use std::sync::Arc;

use nimby::configuration::ServerConfig;
use nimby::metric::Metrics;
use nimby::server::Server;
use pingora::server::configuration::Opt;

fn main() {
    // NIMBY_LOG_LEVEL takes env_logger filter syntax, e.g. "info" or "nimby=debug".
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("NIMBY_LOG_LEVEL", "info"))
        .init();

    let opt = Opt::parse_args();

    // Our settings live in the same YAML file pingora reads via -c/--conf.
    let server_conf = match opt.conf.as_deref() {
        Some(path) => ServerConfig::load(Path::new(path)),
        None => Ok(ServerConfig::default()),
    };
    let server_conf = match server_conf {
        Ok(conf) => conf.with_env(),
        Err(e) => {
            log::error!("config: {}", e);
            std::process::exit(1);
        }
    };

    let mut server = Server::new(Some(opt)).expect("Failed to create server");

    if let Err(e) = server.bootstrap(server_conf, Arc::new(Metrics::default())) {
        log::error!("bootstrap: {}", e);
        std::process::exit(1);
    }

    server.run_forever();
}
