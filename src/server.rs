//! HTTP server hosting the gate.

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::{Layer, Service, ServiceBuilder};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::gate::{GateLayer, PeerAddr, RequestExtractor};
use crate::ratelimit::{AdmissionControl, RateLimiter};

/// Response body type used by the server.
pub type Body = Full<Bytes>;

/// HTTP/1.1 server that runs every request through the gate.
pub struct GateServer<L: AdmissionControl + 'static = RateLimiter> {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission controller
    limiter: Arc<L>,
    /// How client addresses are resolved
    extractor: RequestExtractor,
}

impl<L: AdmissionControl + 'static> GateServer<L> {
    /// Create a new server.
    pub fn new(addr: SocketAddr, limiter: Arc<L>) -> Self {
        Self {
            addr,
            limiter,
            extractor: RequestExtractor::default(),
        }
    }

    /// Use a specific request extractor.
    pub fn with_extractor(mut self, extractor: RequestExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Bind the listener and serve until `signal` resolves.
    ///
    /// `downstream` receives every admitted request. Connections already in
    /// flight when the signal fires are left to finish on their own tasks.
    pub async fn serve_with_shutdown<S, F>(self, downstream: S, signal: F) -> Result<()>
    where
        S: Service<Request<Incoming>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind listener");
            e
        })?;
        self.serve_listener(listener, downstream, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    pub async fn serve_listener<S, F>(
        self,
        listener: TcpListener,
        downstream: S,
        signal: F,
    ) -> Result<()>
    where
        S: Service<Request<Incoming>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
        F: Future<Output = ()> + Send,
    {
        let gate = GateLayer::new(self.limiter).with_extractor(self.extractor);
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Gate server listening");

        tokio::pin!(signal);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let service = ServiceBuilder::new()
                        .map_request(move |mut request: Request<Incoming>| {
                            request.extensions_mut().insert(PeerAddr(peer));
                            request
                        })
                        .service(gate.layer(downstream.clone()));

                    tokio::spawn(async move {
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), TowerToHyperService::new(service))
                            .await
                        {
                            debug!(peer = %peer, error = %e, "Connection closed with error");
                        }
                    });
                }
                _ = &mut signal => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tower::service_fn;

    async fn ok(_request: Request<Incoming>) -> std::result::Result<Response<Body>, Infallible> {
        Ok(Response::new(Body::from("ok")))
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        raw
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let limiter = Arc::new(RateLimiter::new());
        let _server = GateServer::new(addr, limiter);
    }

    #[tokio::test]
    async fn test_serves_and_gates_requests() {
        let limiter = Arc::new(RateLimiter::with_clock(Arc::new(ManualClock::new())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server = GateServer::new(addr, limiter);
        let handle = tokio::spawn(server.serve_listener(listener, service_fn(ok), async {
            let _ = stop_rx.await;
        }));

        let mut statuses = Vec::new();
        for _ in 0..6 {
            let raw = get(addr, "/api/auth/login").await;
            statuses.push(raw.lines().next().unwrap_or_default().to_string());
        }

        assert!(statuses[..5].iter().all(|s| s.contains("200")));
        assert!(statuses[5].contains("429"));

        let raw = get(addr, "/api/widgets").await;
        assert!(raw.contains("200"));
        assert!(raw.to_ascii_lowercase().contains("x-ratelimit-limit: 100"));

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
