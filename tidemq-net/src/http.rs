use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use warp::filters::BoxedFilter;
use warp::http::{Method, StatusCode};
use warp::{Filter, Reply};

use crate::builder::{tls_handshake, Listener};
use crate::Result;

type StatsFn = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

enum Endpoint {
    Stats(StatsFn),
    Health,
}

/// Informational endpoint. Reads broker state through a snapshot function and
/// accepts no MQTT intents.
pub struct HttpServer {
    listener: Listener,
    endpoint: Endpoint,
}

impl HttpServer {
    /// `GET /` answers with the JSON produced by `snapshot`.
    pub fn stats<F>(listener: Listener, snapshot: F) -> Self
    where
        F: Fn() -> serde_json::Value + Send + Sync + 'static,
    {
        HttpServer { listener, endpoint: Endpoint::Stats(Arc::new(snapshot)) }
    }

    /// `GET /` answers `200 OK`, any other method `405`.
    pub fn health(listener: Listener) -> Self {
        HttpServer { listener, endpoint: Endpoint::Health }
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.listener.cfg.name
    }

    /// Serves until `shutdown` resolves.
    pub async fn serve<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let routes = match self.endpoint {
            Endpoint::Stats(snapshot) => stats_routes(snapshot),
            Endpoint::Health => health_routes(),
        };
        let name = self.listener.cfg.name.clone();

        let (tx, mut rx) = mpsc::channel::<Box<dyn Io>>(64);
        let acceptor = tokio::spawn(accept_loop(self.listener, tx));

        let incoming = stream::poll_fn(move |cx| rx.poll_recv(cx).map(|io| io.map(Ok::<_, std::io::Error>)));
        warp::serve(routes).serve_incoming_with_graceful_shutdown(incoming, shutdown).await;
        acceptor.abort();
        log::info!("{} http endpoint stopped", name);
        Ok(())
    }
}

async fn accept_loop(listener: Listener, tx: mpsc::Sender<Box<dyn Io>>) {
    let acceptor = listener.tls_acceptor();
    let handshake_timeout = listener.cfg.handshake_timeout;
    loop {
        let (socket, remote_addr) = tokio::select! {
            _ = tx.closed() => break,
            res = listener.accept_tcp() => match res {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("{} accept error, {:?}", listener.cfg.name, e);
                    continue;
                }
            },
        };
        let tx = tx.clone();
        match acceptor.clone() {
            None => {
                let _ = tx.send(Box::new(socket)).await;
            }
            Some(acceptor) => {
                tokio::spawn(async move {
                    match tls_handshake(&acceptor, socket, handshake_timeout).await {
                        Ok(tls_s) => {
                            let _ = tx.send(Box::new(tls_s)).await;
                        }
                        Err(e) => log::debug!("{} tls handshake error, {:?}", remote_addr, e),
                    }
                });
            }
        }
    }
}

fn stats_routes(snapshot: StatsFn) -> BoxedFilter<(Box<dyn Reply>,)> {
    warp::get()
        .and(warp::path::end())
        .map(move || -> Box<dyn Reply> { Box::new(warp::reply::json(&snapshot())) })
        .boxed()
}

fn health_routes() -> BoxedFilter<(Box<dyn Reply>,)> {
    warp::path::end()
        .and(warp::method())
        .map(|method: Method| -> Box<dyn Reply> {
            if method == Method::GET {
                Box::new(warp::reply::with_status("OK", StatusCode::OK))
            } else {
                Box::new(warp::reply::with_status("Method Not Allowed", StatusCode::METHOD_NOT_ALLOWED))
            }
        })
        .boxed()
}
