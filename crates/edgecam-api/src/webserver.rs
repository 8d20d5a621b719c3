// ── Ingestion webserver ──
//
// The device uploads artifacts over plain HTTP PUT:
//   PUT /images/{name}      → <upload_root>/images/{name}
//   PUT /inferences/{name}  → <upload_root>/inferences/{name}
// and downloads module binaries from
//   GET /deploy/{name}      ← <serve_dir>/{name}
//
// Every completed upload's path is announced on an mpsc channel; the
// ingestion pipeline takes it from there.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::ports::{PortLease, PortRegistry};

/// Sub-directory (and URL segment) for image uploads.
pub const IMAGES_DIR: &str = "images";
/// Sub-directory (and URL segment) for inference uploads.
pub const INFERENCES_DIR: &str = "inferences";
/// URL segment for deployable module downloads.
pub const DEPLOY_PATH: &str = "deploy";

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WebserverConfig {
    pub bind: IpAddr,
    /// `0` picks an ephemeral port.
    pub port: u16,
    /// Uploads land under `<upload_root>/<kind>/`.
    pub upload_root: PathBuf,
    /// Files served under `/deploy/`.
    pub serve_dir: PathBuf,
}

impl Default for WebserverConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
            upload_root: PathBuf::from("uploads"),
            serve_dir: PathBuf::from("serve"),
        }
    }
}

#[derive(Clone)]
struct AppState {
    upload_root: Arc<PathBuf>,
    serve_dir: Arc<PathBuf>,
    uploads: mpsc::Sender<PathBuf>,
}

/// A bound, not yet serving, ingestion webserver.
pub struct IngestionServer {
    listener: TcpListener,
    router: Router,
    lease: PortLease,
    local_addr: SocketAddr,
}

impl IngestionServer {
    /// Bind the listener and lease its port. Upload and serve directories
    /// are created if missing.
    pub async fn bind(
        config: &WebserverConfig,
        registry: &PortRegistry,
        uploads: mpsc::Sender<PathBuf>,
    ) -> Result<Self, Error> {
        let addr = SocketAddr::new(config.bind, config.port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                if let Some(owner) = registry.owner_of(config.port) {
                    return Err(Error::PortInUse {
                        port: config.port,
                        owner,
                    });
                }
                return Err(Error::WebserverBind {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                return Err(Error::WebserverBind {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        let local_addr = listener.local_addr()?;
        let lease = registry.acquire(local_addr.port(), "ingestion webserver")?;

        for kind in [IMAGES_DIR, INFERENCES_DIR] {
            tokio::fs::create_dir_all(config.upload_root.join(kind)).await?;
        }
        tokio::fs::create_dir_all(&config.serve_dir).await?;

        let state = AppState {
            upload_root: Arc::new(config.upload_root.clone()),
            serve_dir: Arc::new(config.serve_dir.clone()),
            uploads,
        };

        Ok(Self {
            listener,
            router: router(state),
            lease,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    /// Serve until `cancel` fires. In-flight requests are allowed to finish.
    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            listener,
            router,
            lease,
            local_addr,
        } = self;
        tracing::info!(%local_addr, "ingestion webserver listening");

        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "ingestion webserver failed");
        }

        drop(lease);
        tracing::info!(%local_addr, "ingestion webserver stopped");
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/images/:name", put(put_image))
        .route("/inferences/:name", put(put_inference))
        .route("/deploy/:name", get(get_deploy))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn put_image(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
    body: Bytes,
) -> impl IntoResponse {
    store_upload(&state, IMAGES_DIR, &name, &body).await
}

async fn put_inference(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
    body: Bytes,
) -> impl IntoResponse {
    store_upload(&state, INFERENCES_DIR, &name, &body).await
}

async fn get_deploy(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Vec<u8>, StatusCode> {
    if !is_plain_file_name(&name) {
        return Err(StatusCode::BAD_REQUEST);
    }
    tokio::fs::read(state.serve_dir.join(&name))
        .await
        .map_err(|_| StatusCode::NOT_FOUND)
}

async fn store_upload(state: &AppState, kind: &str, name: &str, body: &[u8]) -> StatusCode {
    if !is_plain_file_name(name) {
        tracing::warn!(kind, name, "rejected upload with unsafe file name");
        return StatusCode::BAD_REQUEST;
    }

    let path = state.upload_root.join(kind).join(name);
    if let Err(e) = write_upload(&path, body).await {
        tracing::error!(path = %path.display(), error = %e, "failed to store upload");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    tracing::debug!(kind, name, bytes = body.len(), "upload stored");
    if state.uploads.send(path).await.is_err() {
        tracing::warn!(kind, name, "upload consumer gone, file left in place");
    }
    StatusCode::OK
}

async fn write_upload(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, body).await
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && Path::new(name).components().count() == 1
}
