//! The per-connection proxy state machine.
//!
//! Each accepted client gets one `Proxy`, which dials the backend and then
//! runs two concurrent loops: the client loop decodes elements arriving from
//! the client and forwards them to the server leg, the server loop does the
//! reverse. Routing tables decide per element whether it is forwarded
//! verbatim, rewritten (the client's stream opener), or drives a protocol
//! action (STARTTLS upgrade, SASL bookkeeping).
//!
//! STARTTLS is asymmetric: the client loop blocks after forwarding
//! `<starttls/>` until the server loop has witnessed `<proceed/>` and
//! upgraded its own leg, so plaintext can never trail the negotiation on
//! either side. After SASL succeeds the peers restart their streams and the
//! proxy stops parsing entirely, degrading into a raw byte copy in both
//! directions.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::stream_logger::{self, TeeConfig, TeeReader, TeeWriter};
use crate::tls;
use crate::xmpp::decoder::{DecodeError, ElementDecoder};
use crate::xmpp::element::{Element, StreamHeader};
use crate::xmpp::router::{Matcher, Route, Router, RouterError};
use crate::xmpp::{NS_SASL, NS_STREAM, NS_TLS};

const CLIENT_READ_PREFIX: &[u8] = b" C->P ";
const CLIENT_WRITE_PREFIX: &[u8] = b" P->C ";
const SERVER_READ_PREFIX: &[u8] = b" S->P ";
const SERVER_WRITE_PREFIX: &[u8] = b" P->S ";
const LOG_SUFFIX: &[u8] = b"\n";

const READ_CHUNK: usize = 8192;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("timed out connecting to {address} after {seconds}s")]
    ConnectTimeout { address: String, seconds: u64 },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Route(#[from] RouterError),
    #[error("expected stream element but got: {0}")]
    UnexpectedElement(String),
    #[error("connection leg is closed")]
    LegClosed,
    #[error("starttls negotiation out of order")]
    TlsOutOfOrder,
    #[error("tls proceed signal lost")]
    TlsProceedLost,
    #[error("invalid backend server name: {0}")]
    ServerName(String),
    #[error("proxy task failed: {0}")]
    Task(String),
    #[error("{0}")]
    Close(String),
}

/// Everything a `Proxy` needs to know about its environment.
#[derive(Debug)]
pub struct ProxyConfig {
    /// Backend `host:port` to dial for every accepted client.
    pub address: String,
    /// Domain written into the client stream opener's `to` attribute until
    /// the backend announces its own `from`.
    pub domain: String,
    pub connect_timeout: Duration,
    /// Root under which per-client-IP log directories are created.
    pub log_path: PathBuf,
    pub log_time_format: String,
    pub file_time_format: String,
    /// Certificate configuration presented to clients during STARTTLS.
    pub tls_server: Arc<ServerConfig>,
}

/// Client-loop handlers, one per routing table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientHandler {
    StreamOpen,
    StartTls,
    Forward,
}

/// Server-loop handlers, one per routing table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerHandler {
    StreamOpen,
    StartTls,
    Sasl,
    Forward,
}

/// What a handler did with its element.
enum Outcome {
    /// The element was forwarded (or consumed); keep decoding.
    Forwarded,
    /// A stream opener went through after SASL success: stop decoding this
    /// leg and fall back to a raw byte copy.
    StreamOpened,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToClient,
    ToServer,
}

/// State both loops share.
struct Shared {
    config: Arc<ProxyConfig>,
    client_addr: SocketAddr,
    client_writer: Mutex<Option<TeeWriter>>,
    server_writer: Mutex<Option<TeeWriter>>,
    /// The backend's stream opener, read by the client loop for the `to`
    /// rewrite.
    server_stream: Mutex<Option<StreamHeader>>,
    /// Set once by the server loop on `<success/>`, never cleared.
    sasl_success: AtomicBool,
}

impl Shared {
    async fn send(&self, direction: Direction, payload: &[u8]) -> Result<(), ProxyError> {
        let slot = match direction {
            Direction::ToClient => &self.client_writer,
            Direction::ToServer => &self.server_writer,
        };
        let mut guard = slot.lock().await;
        let writer = guard.as_mut().ok_or(ProxyError::LegClosed)?;
        writer.write(payload).await?;
        Ok(())
    }
}

/// A leg's decode side: the tee-logged read half plus the element decoder
/// feeding off it. The reader is absent only while a TLS upgrade holds both
/// halves of the transport.
struct LegIo {
    reader: Option<TeeReader>,
    decoder: ElementDecoder,
}

impl LegIo {
    fn new(reader: TeeReader) -> Self {
        Self {
            reader: Some(reader),
            decoder: ElementDecoder::new(),
        }
    }

    fn take_reader(&mut self) -> Result<TeeReader, ProxyError> {
        self.reader.take().ok_or(ProxyError::LegClosed)
    }

    fn reinstall(&mut self, reader: TeeReader) {
        self.reader = Some(reader);
        self.decoder = ElementDecoder::new();
    }

    async fn next_element(&mut self) -> Result<Element, ProxyError> {
        loop {
            if let Some(element) = self.decoder.next_element()? {
                return Ok(element);
            }
            let reader = self.reader.as_mut().ok_or(ProxyError::LegClosed)?;
            let mut chunk = [0u8; READ_CHUNK];
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(ProxyError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
            self.decoder.feed(&chunk[..n]);
        }
    }

    /// Raw byte copy into the opposite leg until EOF. Bytes the decoder had
    /// already buffered past the last element are flushed first, so nothing
    /// drained by TLS or SASL buffering is lost.
    async fn copy_to(mut self, shared: &Shared, direction: Direction) -> Result<(), ProxyError> {
        let leftover = self.decoder.take_remaining();
        if !leftover.is_empty() {
            shared.send(direction, &leftover).await?;
        }
        let reader = self.reader.as_mut().ok_or(ProxyError::LegClosed)?;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            shared.send(direction, &chunk[..n]).await?;
        }
    }
}

fn client_router() -> Router<ClientHandler> {
    let mut router = Router::new();
    router.add_route(
        Route::new(ClientHandler::StreamOpen).matcher(Matcher::name(NS_STREAM, "stream")),
    );
    router.add_route(Route::new(ClientHandler::StartTls).matcher(Matcher::space(NS_TLS)));
    router.add_route(Route::new(ClientHandler::Forward).matcher(Matcher::All));
    router
}

fn server_router() -> Router<ServerHandler> {
    let mut router = Router::new();
    router.add_route(
        Route::new(ServerHandler::StreamOpen).matcher(Matcher::name(NS_STREAM, "stream")),
    );
    router.add_route(Route::new(ServerHandler::StartTls).matcher(Matcher::space(NS_TLS)));
    router.add_route(Route::new(ServerHandler::Sasl).matcher(Matcher::space(NS_SASL)));
    router.add_route(Route::new(ServerHandler::Forward).matcher(Matcher::All));
    router
}

/// One proxied connection: owns both legs and their log files for its
/// lifetime.
pub struct Proxy {
    config: Arc<ProxyConfig>,
    shared: Arc<Shared>,
    client_io: LegIo,
    log_base: PathBuf,
}

impl Proxy {
    /// Sets up the client leg and its log file. The backend is not dialed
    /// until [`Proxy::run`].
    pub async fn new(
        client: TcpStream,
        client_addr: SocketAddr,
        config: Arc<ProxyConfig>,
    ) -> Result<Self, ProxyError> {
        let log_base = log_basename(&config, client_addr).await?;
        let sink = open_log_file(&log_base, "C2P").await?;
        let tee_config = Arc::new(TeeConfig {
            time_format: config.log_time_format.clone(),
            read_prefix: CLIENT_READ_PREFIX.to_vec(),
            read_suffix: LOG_SUFFIX.to_vec(),
            write_prefix: CLIENT_WRITE_PREFIX.to_vec(),
            write_suffix: LOG_SUFFIX.to_vec(),
        });
        let (reader, writer) =
            stream_logger::tee(Box::new(client), Arc::new(Mutex::new(sink)), tee_config);
        let shared = Arc::new(Shared {
            config: config.clone(),
            client_addr,
            client_writer: Mutex::new(Some(writer)),
            server_writer: Mutex::new(None),
            server_stream: Mutex::new(None),
            sasl_success: AtomicBool::new(false),
        });
        Ok(Self {
            config,
            shared,
            client_io: LegIo::new(reader),
            log_base,
        })
    }

    /// Dials the backend and forwards between the legs until either side
    /// terminates, then closes both legs.
    pub async fn run(self) -> Result<(), ProxyError> {
        let shared = self.shared.clone();
        let result = self.proxy_streams().await;
        if let Err(close_err) = close_legs(&shared).await {
            warn!(reason = %close_err, "proxy close error");
        }
        result
    }

    async fn proxy_streams(self) -> Result<(), ProxyError> {
        let Proxy {
            config,
            shared,
            client_io,
            log_base,
        } = self;

        let backend = match timeout(config.connect_timeout, TcpStream::connect(&config.address))
            .await
        {
            Err(_) => {
                return Err(ProxyError::ConnectTimeout {
                    address: config.address.clone(),
                    seconds: config.connect_timeout.as_secs(),
                })
            }
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(stream)) => stream,
        };
        debug!(
            clientAddr = %shared.client_addr,
            serverAddr = %config.address,
            "connected to backend"
        );

        let sink = open_log_file(&log_base, "P2S").await?;
        let tee_config = Arc::new(TeeConfig {
            time_format: config.log_time_format.clone(),
            read_prefix: SERVER_READ_PREFIX.to_vec(),
            read_suffix: LOG_SUFFIX.to_vec(),
            write_prefix: SERVER_WRITE_PREFIX.to_vec(),
            write_suffix: LOG_SUFFIX.to_vec(),
        });
        let (server_reader, server_writer) =
            stream_logger::tee(Box::new(backend), Arc::new(Mutex::new(sink)), tee_config);
        *shared.server_writer.lock().await = Some(server_writer);

        let (proceed_tx, proceed_rx) = oneshot::channel();
        let client_loop = ClientLoop {
            shared: shared.clone(),
            io: client_io,
            router: client_router(),
            stream: None,
            tls_proceed: Some(proceed_rx),
        };
        let server_loop = ServerLoop {
            shared: shared.clone(),
            io: LegIo::new(server_reader),
            router: server_router(),
            tls_proceed: Some(proceed_tx),
        };

        let mut client_task = tokio::spawn(client_loop.run());
        let mut server_task = tokio::spawn(server_loop.run());

        // Whichever loop finishes first decides the connection's fate; the
        // other one is torn down with it.
        let finished = tokio::select! {
            res = &mut client_task => {
                server_task.abort();
                let _ = (&mut server_task).await;
                res
            }
            res = &mut server_task => {
                client_task.abort();
                let _ = (&mut client_task).await;
                res
            }
        };
        match finished {
            Ok(result) => result,
            Err(err) => Err(ProxyError::Task(err.to_string())),
        }
    }
}

async fn close_legs(shared: &Shared) -> Result<(), ProxyError> {
    let mut message = String::from("proxy close error");
    let mut failed = false;
    for slot in [&shared.client_writer, &shared.server_writer] {
        let mut guard = slot.lock().await;
        if let Some(writer) = guard.as_mut() {
            if let Err(err) = writer.shutdown().await {
                failed = true;
                message.push_str(": ");
                message.push_str(&err.to_string());
            }
        }
    }
    if failed {
        Err(ProxyError::Close(message))
    } else {
        Ok(())
    }
}

async fn log_basename(
    config: &ProxyConfig,
    client_addr: SocketAddr,
) -> Result<PathBuf, ProxyError> {
    let ip = client_addr.ip().to_string().replace(['.', ':'], "-");
    let dir = config.log_path.join(ip);
    fs::create_dir_all(&dir).await?;
    let stamp = Local::now().format(&config.file_time_format).to_string();
    Ok(dir.join(stamp))
}

async fn open_log_file(base: &Path, direction: &str) -> Result<File, ProxyError> {
    let path = PathBuf::from(format!("{}.{}.log", base.display(), direction));
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .await?;
    Ok(file)
}

/// Decodes client-originated elements and forwards them to the server leg.
struct ClientLoop {
    shared: Arc<Shared>,
    io: LegIo,
    router: Router<ClientHandler>,
    /// The client's most recent stream opener.
    stream: Option<StreamHeader>,
    /// Receiver armed until the server loop witnesses `<proceed/>`.
    tls_proceed: Option<oneshot::Receiver<()>>,
}

impl ClientLoop {
    async fn run(mut self) -> Result<(), ProxyError> {
        loop {
            let element = self.io.next_element().await?;
            let handler = self.router.route(&element)?;
            match self.dispatch(handler, element).await? {
                Outcome::Forwarded => {}
                Outcome::StreamOpened => {
                    return self.io.copy_to(&self.shared, Direction::ToServer).await;
                }
            }
        }
    }

    async fn dispatch(
        &mut self,
        handler: ClientHandler,
        element: Element,
    ) -> Result<Outcome, ProxyError> {
        match handler {
            ClientHandler::StreamOpen => self.handle_stream_open(element).await,
            ClientHandler::StartTls => self.handle_starttls(element).await,
            ClientHandler::Forward => {
                self.shared
                    .send(Direction::ToServer, element.xml().as_bytes())
                    .await?;
                Ok(Outcome::Forwarded)
            }
        }
    }

    async fn handle_stream_open(&mut self, element: Element) -> Result<Outcome, ProxyError> {
        let mut stream = match element {
            Element::Stream(stream) => stream,
            other => return Err(ProxyError::UnexpectedElement(other.xml())),
        };
        // Prefer the identity the backend already announced; fall back to
        // the configured domain until it has.
        {
            let server_stream = self.shared.server_stream.lock().await;
            match server_stream.as_ref() {
                Some(s) if !s.from.is_empty() => stream.to = s.from.clone(),
                _ => stream.to = self.shared.config.domain.clone(),
            }
        }
        let xml = self.stream.insert(stream).xml();
        self.shared.send(Direction::ToServer, xml.as_bytes()).await?;
        // After SASL the peers open a fresh stream on the same connection;
        // there is nothing left worth parsing past this opener.
        if self.shared.sasl_success.load(Ordering::SeqCst) {
            return Ok(Outcome::StreamOpened);
        }
        Ok(Outcome::Forwarded)
    }

    async fn handle_starttls(&mut self, element: Element) -> Result<Outcome, ProxyError> {
        if element.name().local != "starttls" {
            self.shared
                .send(Direction::ToServer, element.xml().as_bytes())
                .await?;
            return Ok(Outcome::Forwarded);
        }
        self.shared
            .send(Direction::ToServer, element.xml().as_bytes())
            .await?;
        // Block this leg until the server loop has upgraded its side and
        // relayed <proceed/>; the client must not be answered before then.
        let proceed = self.tls_proceed.take().ok_or(ProxyError::TlsOutOfOrder)?;
        proceed.await.map_err(|_| ProxyError::TlsProceedLost)?;
        self.upgrade_client_leg().await?;
        Ok(Outcome::Forwarded)
    }

    async fn upgrade_client_leg(&mut self) -> Result<(), ProxyError> {
        let reader = self.io.take_reader()?;
        let writer = {
            let mut slot = self.shared.client_writer.lock().await;
            slot.take().ok_or(ProxyError::LegClosed)?
        };
        let (read_half, sink, tee_config) = reader.into_parts();
        let (write_half, _, _) = writer.into_parts();
        let transport = read_half.unsplit(write_half);

        let acceptor = TlsAcceptor::from(self.shared.config.tls_server.clone());
        let tls_stream = acceptor.accept(transport).await?;

        let (reader, writer) = stream_logger::tee(Box::new(tls_stream), sink, tee_config);
        self.io.reinstall(reader);
        *self.shared.client_writer.lock().await = Some(writer);
        info!(clientAddr = %self.shared.client_addr, "client leg upgraded to TLS");
        Ok(())
    }
}

/// Decodes server-originated elements and forwards them to the client leg.
struct ServerLoop {
    shared: Arc<Shared>,
    io: LegIo,
    router: Router<ServerHandler>,
    /// Fires once, after the server leg's TLS upgrade succeeds.
    tls_proceed: Option<oneshot::Sender<()>>,
}

impl ServerLoop {
    async fn run(mut self) -> Result<(), ProxyError> {
        loop {
            let element = self.io.next_element().await?;
            let handler = self.router.route(&element)?;
            match self.dispatch(handler, element).await? {
                Outcome::Forwarded => {}
                Outcome::StreamOpened => {
                    // The backend pipelines <stream:features> right behind
                    // its opener, and the decoder has usually buffered it
                    // already. Relay it, then stop parsing.
                    let features = match self.io.next_element().await {
                        Ok(element) => element,
                        Err(_) => return Ok(()),
                    };
                    let name = features.name();
                    if name.space != NS_STREAM || name.local != "features" {
                        return Ok(());
                    }
                    self.shared
                        .send(Direction::ToClient, features.xml().as_bytes())
                        .await?;
                    return self.io.copy_to(&self.shared, Direction::ToClient).await;
                }
            }
        }
    }

    async fn dispatch(
        &mut self,
        handler: ServerHandler,
        element: Element,
    ) -> Result<Outcome, ProxyError> {
        match handler {
            ServerHandler::StreamOpen => self.handle_stream_open(element).await,
            ServerHandler::StartTls => self.handle_tls(element).await,
            ServerHandler::Sasl => self.handle_sasl(element).await,
            ServerHandler::Forward => {
                self.shared
                    .send(Direction::ToClient, element.xml().as_bytes())
                    .await?;
                Ok(Outcome::Forwarded)
            }
        }
    }

    async fn handle_stream_open(&mut self, element: Element) -> Result<Outcome, ProxyError> {
        let stream = match element {
            Element::Stream(stream) => stream,
            other => return Err(ProxyError::UnexpectedElement(other.xml())),
        };
        debug!(header = self.io.decoder.header(), "backend stream opened");
        let xml = {
            let mut guard = self.shared.server_stream.lock().await;
            guard.insert(stream).xml()
        };
        self.shared.send(Direction::ToClient, xml.as_bytes()).await?;
        if self.shared.sasl_success.load(Ordering::SeqCst) {
            return Ok(Outcome::StreamOpened);
        }
        Ok(Outcome::Forwarded)
    }

    async fn handle_tls(&mut self, element: Element) -> Result<Outcome, ProxyError> {
        if element.name().local != "proceed" {
            self.shared
                .send(Direction::ToClient, element.xml().as_bytes())
                .await?;
            return Ok(Outcome::Forwarded);
        }
        // Upgrade the backend side first: once the client loop wakes up,
        // plaintext must be impossible on this leg.
        self.upgrade_server_leg().await?;
        self.shared
            .send(Direction::ToClient, element.xml().as_bytes())
            .await?;
        if let Some(tx) = self.tls_proceed.take() {
            // The client loop may already be gone; that ends the connection
            // through its own path.
            let _ = tx.send(());
        }
        Ok(Outcome::Forwarded)
    }

    async fn handle_sasl(&mut self, element: Element) -> Result<Outcome, ProxyError> {
        if element.name().local == "success" {
            self.shared.sasl_success.store(true, Ordering::SeqCst);
        }
        self.shared
            .send(Direction::ToClient, element.xml().as_bytes())
            .await?;
        Ok(Outcome::Forwarded)
    }

    async fn upgrade_server_leg(&mut self) -> Result<(), ProxyError> {
        let reader = self.io.take_reader()?;
        let writer = {
            let mut slot = self.shared.server_writer.lock().await;
            slot.take().ok_or(ProxyError::LegClosed)?
        };
        let (read_half, sink, tee_config) = reader.into_parts();
        let (write_half, _, _) = writer.into_parts();
        let transport = read_half.unsplit(write_half);

        let domain = self.shared.config.domain.clone();
        let server_name = ServerName::try_from(domain.clone())
            .map_err(|_| ProxyError::ServerName(domain))?;
        let connector = tls::insecure_connector();
        let tls_stream = connector.connect(server_name, transport).await?;

        let (reader, writer) = stream_logger::tee(Box::new(tls_stream), sink, tee_config);
        self.io.reinstall(reader);
        *self.shared.server_writer.lock().await = Some(writer);
        info!(serverAddr = %self.shared.config.address, "server leg upgraded to TLS");
        Ok(())
    }
}
