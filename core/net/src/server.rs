//! HTTPS receiver: router, TLS accept loop and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{post, put};
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ReceiverConfig;
use crate::handlers::{self, AppState};
use crate::trust::{display_string, TrustStore};
use lanvault_common::{Error, Result};
use lanvault_protocol::{
    EventSink, PairingHandler, ProtocolEvent, SessionRegistry, TransferService, VaultFileSink,
};
use lanvault_vault::Vault;

/// Build the API router.
pub fn create_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/v1/register", post(handlers::register))
        .route("/api/v1/prepare-upload", post(handlers::prepare_upload))
        .route("/api/v1/upload", put(handlers::upload))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

/// A running listener.
pub struct ServerHandle {
    local_addr: SocketAddr,
    fingerprint: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Stop accepting, let in-flight requests finish within the grace
    /// period, then close what is left.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.task
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))
    }
}

/// Bind and serve `router` over TLS until the handle is stopped.
///
/// # Errors
/// - `Io` if the address cannot be bound
/// - `Tls` if the identity cannot be loaded
pub async fn serve(
    router: Router,
    trust: &TrustStore,
    bind_addr: &str,
    grace: Duration,
) -> Result<ServerHandle> {
    let identity = trust.ensure_identity()?;
    let acceptor = TlsAcceptor::from(Arc::new(identity.server_config()?));

    let listener = TcpListener::bind(bind_addr).await?;
    let local_addr = listener.local_addr()?;
    let cancel = CancellationToken::new();

    let task = tokio::spawn(accept_loop(
        listener,
        acceptor,
        router,
        cancel.clone(),
        grace,
    ));

    info!(addr = %local_addr, "Receiver listening on https://{}", local_addr);
    Ok(ServerHandle {
        local_addr,
        fingerprint: identity.fingerprint(),
        cancel,
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    cancel: CancellationToken,
    grace: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        acceptor.clone(),
                        router.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }
    drop(listener);

    let in_flight = connections.len();
    info!(in_flight, "Receiver shutting down");
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            "Grace period elapsed, closing remaining connections"
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
    info!("Receiver stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    router: Router,
    cancel: CancellationToken,
) {
    let tls = tokio::select! {
        _ = cancel.cancelled() => return,
        accepted = acceptor.accept(stream) => match accepted {
            Ok(tls) => tls,
            Err(e) => {
                debug!(%peer, error = %e, "TLS handshake failed");
                return;
            }
        },
    };

    let service = TowerToHyperService::new(router);
    let conn = http1::Builder::new().serve_connection(TokioIo::new(tls), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        debug!(%peer, error = %e, "Connection closed with error");
    }
}

/// The receiver: pairing and transfer services behind an HTTPS listener
/// that can be started and stopped.
pub struct ReceiverServer {
    config: ReceiverConfig,
    trust: TrustStore,
    pairing: Arc<PairingHandler>,
    transfers: Arc<TransferService>,
    events: Arc<dyn EventSink>,
    running: Mutex<Option<ServerHandle>>,
}

impl ReceiverServer {
    pub fn new(
        config: ReceiverConfig,
        trust: TrustStore,
        pairing: Arc<PairingHandler>,
        transfers: Arc<TransferService>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            trust,
            pairing,
            transfers,
            events,
            running: Mutex::new(None),
        }
    }

    /// Wire a receiver that stores uploads in `vault`, with the TLS
    /// identity kept in the vault's data directory.
    pub fn for_vault(vault: Arc<Vault>, config: ReceiverConfig, events: Arc<dyn EventSink>) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        let pairing = Arc::new(
            PairingHandler::new(sessions.clone(), events.clone())
                .with_timeout(config.registration_timeout()),
        );
        let transfers = Arc::new(
            TransferService::new(
                sessions,
                Arc::new(VaultFileSink::new(vault.clone())),
                events.clone(),
            )
            .with_timeout(config.prepare_timeout())
            .with_default_folder(config.default_folder.clone()),
        );
        let trust = TrustStore::new(vault.paths().tls_dir())
            .with_hostnames(config.extra_hostnames.clone());

        Self::new(config, trust, pairing, transfers, events)
    }

    pub fn pairing(&self) -> &Arc<PairingHandler> {
        &self.pairing
    }

    pub fn transfers(&self) -> &Arc<TransferService> {
        &self.transfers
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Start listening and announce the certificate fingerprint.
    ///
    /// # Errors
    /// - `Conflict` if the server is already running
    /// - `Io`/`Tls` if binding or loading the identity fails
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::Conflict("Server is already running".to_string()));
        }

        let state = AppState {
            pairing: self.pairing.clone(),
            transfers: self.transfers.clone(),
        };
        let router = create_router(state, self.config.max_upload_bytes);
        let handle = serve(
            router,
            &self.trust,
            &self.config.bind_addr(),
            self.config.shutdown_grace(),
        )
        .await?;

        let fingerprint = handle.fingerprint().to_string();
        self.events.emit(ProtocolEvent::CertificateInfo {
            display: display_string(&fingerprint),
            fingerprint,
        });

        let addr = handle.local_addr();
        *running = Some(handle);
        Ok(addr)
    }

    /// Stop the listener. Stopping a stopped server is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let handle = self.running.lock().await.take();
        match handle {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Fingerprint of the certificate being served.
    pub async fn fingerprint(&self) -> Option<String> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|h| h.fingerprint().to_string())
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|h| h.local_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::error::ErrorBody;
    use lanvault_protocol::{FileInfo, NoopSink, PrepareUploadRequest};
    use lanvault_common::{FileId, SessionId};
    use lanvault_vault::VaultPaths;

    const LIMIT: usize = 16;

    struct Fixture {
        _dir: tempfile::TempDir,
        sessions: Arc<SessionRegistry>,
        transfers: Arc<TransferService>,
        router: Router,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(Vault::open(VaultPaths::new(dir.path())).unwrap());
        let sessions = Arc::new(SessionRegistry::new());
        let events: Arc<dyn EventSink> = Arc::new(NoopSink);
        let pairing = Arc::new(PairingHandler::new(sessions.clone(), events.clone()));
        let transfers = Arc::new(TransferService::new(
            sessions.clone(),
            Arc::new(VaultFileSink::new(vault)),
            events,
        ));
        let state = AppState {
            pairing,
            transfers: transfers.clone(),
        };
        Fixture {
            _dir: dir,
            sessions,
            transfers,
            router: create_router(state, LIMIT),
        }
    }

    async fn accepted_transmission(fx: &Fixture, session: &SessionId) -> String {
        let request = PrepareUploadRequest {
            title: String::new(),
            session_id: session.to_string(),
            files: vec![FileInfo {
                id: FileId::new("f1").unwrap(),
                file_name: "big.bin".to_string(),
                size: 4096,
                file_type: String::new(),
                sha256: String::new(),
            }],
        };
        let transfers = fx.transfers.clone();
        let task = tokio::spawn(async move { transfers.prepare_upload(request).await });
        while !fx.transfers.has_pending(session) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        fx.transfers.accept(session).unwrap();
        let response = task.await.unwrap().unwrap();
        response.transmission_for("f1").unwrap().to_string()
    }

    async fn put_upload(router: Router, query: String, body: Vec<u8>) -> (StatusCode, ErrorBody) {
        let request = Request::builder()
            .method("PUT")
            .uri(format!("/api/v1/upload?{}", query))
            .body(Body::from(body))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_unknown_transmission_refused_before_body_is_read() {
        let fx = fixture();
        let session = fx.sessions.create("nonce");

        // Over the body limit: reading it would answer 400 instead.
        let (status, body) = put_upload(
            fx.router.clone(),
            format!("sessionId={}&transmissionId=bogus&fileId=f1", session),
            vec![0u8; 4096],
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, "not_found");
    }

    #[tokio::test]
    async fn test_mismatched_session_refused_before_body_is_read() {
        let fx = fixture();
        let alice = fx.sessions.create("a");
        let bob = fx.sessions.create("b");
        let transmission = accepted_transmission(&fx, &alice).await;

        let (status, body) = put_upload(
            fx.router.clone(),
            format!("sessionId={}&transmissionId={}&fileId=f1", bob, transmission),
            vec![0u8; 4096],
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.code, "invalid_session");
    }

    #[tokio::test]
    async fn test_valid_upload_body_is_bounded() {
        let fx = fixture();
        let session = fx.sessions.create("nonce");
        let transmission = accepted_transmission(&fx, &session).await;

        let (status, body) = put_upload(
            fx.router.clone(),
            format!("sessionId={}&transmissionId={}&fileId=f1", session, transmission),
            vec![0u8; 4096],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code, "invalid_input");
    }
}
