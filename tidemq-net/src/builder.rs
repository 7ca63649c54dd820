use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _};
#[cfg(not(target_os = "windows"))]
use rustls::crypto::aws_lc_rs as provider;
#[cfg(target_os = "windows")]
use rustls::crypto::ring as provider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::ServerConfig;
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};

use crate::stream::MqttStream;
use crate::ws::WsStream;
use crate::{MqttError, Result};

const WS_PROTOCOL: &str = "Sec-WebSocket-Protocol";

/// Settings of one endpoint. Shared by every connection it accepts.
#[derive(Clone, Debug)]
pub struct Builder {
    /// Listener identity, used in logs and statistics.
    pub name: String,
    pub laddr: SocketAddr,
    /// `listen(2)` backlog.
    pub backlog: i32,
    pub nodelay: bool,
    pub reuseaddr: Option<bool>,
    pub reuseport: Option<bool>,
    /// Largest inbound remaining length, 0 for no limit.
    pub max_packet_size: u32,
    /// Bounds the TLS and WebSocket handshakes and the wait for CONNECT.
    pub handshake_timeout: Duration,
    pub send_timeout: Duration,
    /// PEM certificate chain file.
    pub tls_cert: Option<String>,
    /// PEM private key file.
    pub tls_key: Option<String>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            name: String::new(),
            laddr: ([0, 0, 0, 0], 1883).into(),
            backlog: 512,
            nodelay: false,
            reuseaddr: None,
            reuseport: None,
            max_packet_size: 1 << 20,
            handshake_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            tls_cert: None,
            tls_key: None,
        }
    }
}

macro_rules! setters {
    ($($field:ident: $ty:ty),+ $(,)?) => {
        $(
            #[inline]
            pub fn $field(mut self, $field: $ty) -> Self {
                self.$field = $field;
                self
            }
        )+
    };
}

impl Builder {
    #[inline]
    pub fn new() -> Builder {
        Builder::default()
    }

    setters! {
        laddr: SocketAddr,
        backlog: i32,
        nodelay: bool,
        reuseaddr: Option<bool>,
        reuseport: Option<bool>,
        max_packet_size: u32,
        handshake_timeout: Duration,
        send_timeout: Duration,
    }

    pub fn name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = name.into();
        self
    }

    pub fn tls_cert<N: Into<String>>(mut self, tls_cert: Option<N>) -> Self {
        self.tls_cert = tls_cert.map(Into::into);
        self
    }

    pub fn tls_key<N: Into<String>>(mut self, tls_key: Option<N>) -> Self {
        self.tls_key = tls_key.map(Into::into);
        self
    }

    fn socket(&self) -> std::io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(self.laddr), Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        socket.set_linger(Some(Duration::from_secs(10)))?;
        if let Some(on) = self.reuseaddr {
            socket.set_reuse_address(on)?;
        }
        #[cfg(not(windows))]
        if let Some(on) = self.reuseport {
            socket.set_reuse_port(on)?;
        }
        socket.bind(&self.laddr.into())?;
        socket.listen(self.backlog)?;
        Ok(socket)
    }

    /// Binds a plain TCP listener. Any failure here is a configuration error.
    pub fn bind(self) -> Result<Listener> {
        let socket = self.socket().with_context(|| format!("{} bind {} failed", self.name, self.laddr))?;
        let tcp = TcpListener::from_std(socket.into())?;
        let local_addr = tcp.local_addr()?;
        log::info!("{} listening on {}", self.name, local_addr);
        Ok(Listener { typ: ListenerType::TCP, cfg: Arc::new(self), tcp, local_addr, tls: None })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ListenerType {
    TCP,
    TLS,
    WS,
    WSS,
}

impl ListenerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerType::TCP => "tcp",
            ListenerType::TLS => "tls",
            ListenerType::WS => "ws",
            ListenerType::WSS => "wss",
        }
    }

    #[inline]
    fn secure(self) -> bool {
        matches!(self, ListenerType::TLS | ListenerType::WSS)
    }
}

/// A bound socket and the transport its connections are upgraded to. Starts
/// as TCP and is switched with [`tls`](Self::tls), [`ws`](Self::ws) or
/// [`wss`](Self::wss).
pub struct Listener {
    pub typ: ListenerType,
    pub cfg: Arc<Builder>,
    tcp: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn switch(mut self, to: ListenerType) -> Result<Self> {
        let allowed = match to {
            ListenerType::TCP => self.typ == ListenerType::TCP,
            ListenerType::TLS => matches!(self.typ, ListenerType::TCP | ListenerType::TLS),
            ListenerType::WS => matches!(self.typ, ListenerType::TCP | ListenerType::WS),
            ListenerType::WSS => true,
        };
        if !allowed {
            bail!("{} cannot switch from {} to {}", self.cfg.name, self.typ.as_str(), to.as_str());
        }
        if to.secure() && self.tls.is_none() {
            self.tls = Some(tls_acceptor(&self.cfg)?);
        }
        self.typ = to;
        Ok(self)
    }

    #[inline]
    pub fn tcp(self) -> Result<Self> {
        self.switch(ListenerType::TCP)
    }

    #[inline]
    pub fn tls(self) -> Result<Self> {
        self.switch(ListenerType::TLS)
    }

    #[inline]
    pub fn ws(self) -> Result<Self> {
        self.switch(ListenerType::WS)
    }

    #[inline]
    pub fn wss(self) -> Result<Self> {
        self.switch(ListenerType::WSS)
    }

    #[inline]
    pub(crate) fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        self.tls.clone()
    }

    pub(crate) async fn accept_tcp(&self) -> Result<(TcpStream, SocketAddr)> {
        let (socket, remote_addr) = self.tcp.accept().await?;
        socket.set_nodelay(self.cfg.nodelay)?;
        Ok((socket, remote_addr))
    }

    pub async fn accept(&self) -> Result<Acceptor<TcpStream>> {
        let (socket, remote_addr) = self.accept_tcp().await?;
        Ok(Acceptor { socket, remote_addr, tls: self.tls.clone(), cfg: self.cfg.clone(), typ: self.typ })
    }
}

fn tls_acceptor(cfg: &Builder) -> Result<TlsAcceptor> {
    let (Some(cert), Some(key)) = (cfg.tls_cert.as_deref(), cfg.tls_key.as_deref()) else {
        bail!("{} needs both a tls cert and a tls key", cfg.name);
    };
    let chain = CertificateDer::pem_file_iter(cert)
        .and_then(|certs| certs.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| anyhow!("{} bad certificate file {}, {}", cfg.name, cert, e))?;
    let key = PrivateKeyDer::from_pem_file(key).map_err(|e| anyhow!("{} bad key file {}, {}", cfg.name, key, e))?;

    let config = ServerConfig::builder_with_provider(Arc::new(provider::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(WebPkiClientVerifier::no_client_auth())
        .with_single_cert(chain, key)
        .map_err(|e| anyhow!("{} certificate and key rejected, {}", cfg.name, e))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// One accepted socket whose transport handshake has not run yet.
pub struct Acceptor<S> {
    pub(crate) socket: S,
    tls: Option<TlsAcceptor>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
    pub typ: ListenerType,
}

impl<S> Acceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn expect(&self, typ: ListenerType) -> Result<()> {
        if self.typ != typ {
            bail!("{} acceptor asked for {}", self.typ.as_str(), typ.as_str());
        }
        Ok(())
    }

    pub fn tcp(self) -> Result<MqttStream<S>> {
        self.expect(ListenerType::TCP)?;
        Ok(MqttStream::new(self.socket, self.remote_addr, self.cfg))
    }

    pub async fn tls(self) -> Result<MqttStream<TlsStream<S>>> {
        self.expect(ListenerType::TLS)?;
        let tls = self.tls.ok_or(MqttError::ServiceUnavailable)?;
        let io = tls_handshake(&tls, self.socket, self.cfg.handshake_timeout).await?;
        Ok(MqttStream::new(io, self.remote_addr, self.cfg))
    }

    pub async fn ws(self) -> Result<MqttStream<WsStream<S>>> {
        self.expect(ListenerType::WS)?;
        let io = ws_handshake(self.socket, self.cfg.handshake_timeout).await?;
        Ok(MqttStream::new(io, self.remote_addr, self.cfg))
    }

    pub async fn wss(self) -> Result<MqttStream<WsStream<TlsStream<S>>>> {
        self.expect(ListenerType::WSS)?;
        let tls = self.tls.ok_or(MqttError::ServiceUnavailable)?;
        let io = tls_handshake(&tls, self.socket, self.cfg.handshake_timeout).await?;
        let io = ws_handshake(io, self.cfg.handshake_timeout).await?;
        Ok(MqttStream::new(io, self.remote_addr, self.cfg))
    }
}

pub(crate) async fn tls_handshake<S>(acceptor: &TlsAcceptor, socket: S, limit: Duration) -> Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let io = tokio::time::timeout(limit, acceptor.accept(socket)).await.map_err(|_| MqttError::ReadTimeout)??;
    Ok(io)
}

async fn ws_handshake<S>(socket: S, limit: Duration) -> Result<WsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = tokio_tungstenite::accept_hdr_async(socket, negotiate_mqtt);
    let ws = tokio::time::timeout(limit, handshake).await.map_err(|_| MqttError::ReadTimeout)??;
    Ok(WsStream::new(ws))
}

/// Accepts only clients offering the `mqtt` subprotocol and echoes it back.
#[allow(clippy::result_large_err)]
fn negotiate_mqtt(req: &Request, mut resp: Response) -> std::result::Result<Response, ErrorResponse> {
    let offered = req
        .headers()
        .get_all(WS_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == "mqtt");
    if !offered {
        let mut refusal = ErrorResponse::new(Some(format!("{}: mqtt is required", WS_PROTOCOL)));
        *refusal.status_mut() = StatusCode::BAD_REQUEST;
        return Err(refusal);
    }
    resp.headers_mut().insert(WS_PROTOCOL, HeaderValue::from_static("mqtt"));
    Ok(resp)
}
