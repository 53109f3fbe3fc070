//! xmppeeker: an intercepting, TLS-aware proxy for XMPP client-to-server
//! streams. Accepted clients are paired with a connection to a fixed backend;
//! traffic is decoded just enough to mediate STARTTLS on both legs and to
//! notice SASL completing, and every byte of both legs is transcribed into
//! per-connection log files.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod proxy;
mod stream_logger;
mod tls;
mod xmpp;

use config::Config;
use proxy::{Proxy, ProxyConfig};

const APP_ROOT: &str = ".";

const EXIT_BAD_CONFIG: i32 = 1;
const EXIT_FATAL: i32 = 2;

fn absolutize(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

async fn handle_connection(socket: TcpStream, peer: SocketAddr, config: Arc<ProxyConfig>) {
    let server_addr = config.address.clone();
    let proxy = match Proxy::new(socket, peer, config).await {
        Ok(proxy) => proxy,
        Err(err) => {
            error!(
                reason = %err,
                clientAddr = %peer,
                serverAddr = %server_addr,
                "failed to set up proxy"
            );
            return;
        }
    };
    if let Err(err) = proxy.run().await {
        error!(
            reason = %err,
            clientAddr = %peer,
            serverAddr = %server_addr,
            "error while running proxy"
        );
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tls::init_crypto_provider();
    let root = Path::new(APP_ROOT);

    let config = match Config::load(root) {
        Ok(config) => config,
        Err(err) => {
            error!(reason = %err, "failed to load config");
            process::exit(EXIT_BAD_CONFIG);
        }
    };

    let cert_path = absolutize(root, &config.certificate);
    let key_path = absolutize(root, &config.certificate_key);
    let tls_server = match tls::load_or_generate_server_config(root, &cert_path, &key_path) {
        Ok(tls_server) => tls_server,
        Err(err) => {
            error!(reason = %err, "failed to prepare tls certificate");
            process::exit(EXIT_BAD_CONFIG);
        }
    };

    let proxy_config = Arc::new(ProxyConfig {
        address: format!("{}:{}", config.backend_host, config.backend_port),
        domain: config.backend_host.clone(),
        connect_timeout: Duration::from_secs(config.connect_timeout),
        log_path: absolutize(root, &config.log_path),
        log_time_format: config.log_time_format.clone(),
        file_time_format: config.file_time_format.clone(),
        tls_server,
    });

    let listen_addr = format!("{}:{}", config.listen_host, config.listen_port);
    let listener = match TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(reason = %err, addr = %listen_addr, "failed to start listener");
            process::exit(EXIT_FATAL);
        }
    };

    info!(
        ListenHost = %config.listen_host,
        ListenPort = config.listen_port,
        BackendHost = %config.backend_host,
        BackendPort = config.backend_port,
        MaxConnections = config.max_connections,
        "xmppeeker started"
    );

    // Bounds the number of concurrently served clients; accepting pauses
    // while all permits are out.
    let limiter = Arc::new(Semaphore::new(config.max_connections));

    loop {
        let permit = match limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(reason = %err, "error accepting connection");
                process::exit(EXIT_FATAL);
            }
        };
        info!(clientAddr = %peer, "accepted connection");
        let connection_config = proxy_config.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handle_connection(socket, peer, connection_config).await;
        });
    }
    process::exit(EXIT_FATAL);
}
