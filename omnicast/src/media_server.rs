//! Embedded HTTP server that exposes registered payloads to devices on the
//! local network.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MediaServerConfig;
use crate::errors::CastError;
use crate::model::{MediaPayload, PayloadSource};
use crate::payload_store::PayloadStore;

const FILE_STREAM_CHUNK: usize = 256 * 1024;

/// State shared between the HTTP handler, the registry and adapter handles.
/// Outlives server restarts; `base_url` is only set while a server runs.
pub(crate) struct MediaState {
    store: PayloadStore,
    base_url: RwLock<Option<String>>,
}

impl MediaState {
    pub(crate) fn new() -> Self {
        Self {
            store: PayloadStore::new(),
            base_url: RwLock::new(None),
        }
    }

    pub(crate) fn base_url(&self) -> Option<String> {
        self.base_url.read().unwrap().clone()
    }

    fn set_base_url(&self, url: Option<String>) {
        *self.base_url.write().unwrap() = url;
    }

    /// Registers a payload and returns the URL devices fetch it from.
    pub(crate) fn register_url(
        &self,
        hint: Option<&str>,
        payload: MediaPayload,
    ) -> Result<String, CastError> {
        let base = self.base_url().ok_or(CastError::NotStarted)?;
        let id = self.store.register(hint, payload);
        Ok(format!("{base}/{id}"))
    }

    /// Releases a registration early; the id stops resolving immediately.
    pub(crate) fn unregister(&self, id: &str) -> bool {
        let removed = self.store.unregister(id);
        if removed {
            debug!(payload = %id, "Payload unregistered");
        }
        removed
    }

    pub(crate) fn store(&self) -> &PayloadStore {
        &self.store
    }
}

/// The payload-serving HTTP server plus its eviction loop.
pub(crate) struct MediaServer {
    config: MediaServerConfig,
    state: Arc<MediaState>,
    server: Option<omniserver::Server>,
    gc_cancel: Option<CancellationToken>,
    gc_task: Option<JoinHandle<()>>,
}

impl MediaServer {
    pub(crate) fn new(config: MediaServerConfig) -> Self {
        Self {
            config,
            state: Arc::new(MediaState::new()),
            server: None,
            gc_cancel: None,
            gc_task: None,
        }
    }

    pub(crate) fn state(&self) -> Arc<MediaState> {
        self.state.clone()
    }

    /// Binds the listener and returns the advertised base URL.
    pub(crate) async fn start(&mut self) -> Result<String, CastError> {
        let ip = match &self.config.ip {
            Some(ip) => ip.clone(),
            None => omniutils::guess_local_ip(),
        };
        let mut server = omniserver::Server::new("omnicast-media", ip, self.config.port);
        let router = Router::new()
            .route("/{payload_id}", get(serve_payload))
            .with_state(self.state.clone());
        server.add_router("/", router).await;

        let info = server
            .start()
            .await
            .map_err(|e| CastError::MediaServerBindFailure(e.to_string()))?;
        self.state.set_base_url(Some(info.base_url.clone()));
        self.server = Some(server);

        let cancel = CancellationToken::new();
        self.gc_task = Some(tokio::spawn(gc_loop(
            self.state.clone(),
            self.config.payload_idle_timeout,
            self.config.gc_interval,
            cancel.clone(),
        )));
        self.gc_cancel = Some(cancel);

        info!(base_url = %info.base_url, "Media server started");
        Ok(info.base_url)
    }

    /// Registers a payload; fails with `NotStarted` before `start`.
    pub(crate) fn register_payload(
        &self,
        hint: Option<&str>,
        payload: MediaPayload,
    ) -> Result<String, CastError> {
        self.state.register_url(hint, payload)
    }

    pub(crate) async fn stop(&mut self) {
        if let Some(cancel) = self.gc_cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.gc_task.take() {
            let _ = task.await;
        }
        if let Some(mut server) = self.server.take() {
            server.stop().await;
        }
        self.state.set_base_url(None);
        self.state.store.clear();
        info!("Media server stopped");
    }
}

async fn gc_loop(
    state: Arc<MediaState>,
    idle_timeout: Duration,
    gc_interval: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(gc_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let evicted = state.store.sweep_idle(idle_timeout);
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "Evicted idle payloads");
                }
            }
        }
    }
}

async fn serve_payload(
    State(state): State<Arc<MediaState>>,
    Path(payload_id): Path<String>,
) -> Response {
    let Some(payload) = state.store.resolve(&payload_id) else {
        return (StatusCode::NOT_FOUND, "Media not found").into_response();
    };

    let mime = payload
        .mime_type
        .unwrap_or_else(|| "application/octet-stream".to_string());

    match payload.source {
        PayloadSource::Url(url) => {
            (StatusCode::FOUND, [(header::LOCATION, url)]).into_response()
        }
        PayloadSource::Bytes(bytes) => {
            ([(header::CONTENT_TYPE, mime)], bytes).into_response()
        }
        PayloadSource::Path(path) => {
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    warn!(payload = %payload_id, error = %e, "Payload file is unreadable");
                    return (StatusCode::NOT_FOUND, "Media not found").into_response();
                }
            };
            let len = file.metadata().await.ok().map(|m| m.len());
            // TODO: honor Range requests so DLNA renderers can seek in
            // file-backed payloads.
            let stream = ReaderStream::with_capacity(file, FILE_STREAM_CHUNK);
            let body = Body::from_stream(stream);
            match len {
                Some(len) => (
                    [
                        (header::CONTENT_TYPE, mime),
                        (header::CONTENT_LENGTH, len.to_string()),
                    ],
                    body,
                )
                    .into_response(),
                None => ([(header::CONTENT_TYPE, mime)], body).into_response(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_url_requires_a_running_server() {
        let state = MediaState::new();
        let err = state
            .register_url(None, MediaPayload::from_bytes(vec![1u8]))
            .unwrap_err();
        assert!(matches!(err, CastError::NotStarted));

        state.set_base_url(Some("http://192.168.1.5:8080".to_string()));
        let url = state
            .register_url(Some("track"), MediaPayload::from_bytes(vec![1u8]))
            .unwrap();
        assert_eq!(url, "http://192.168.1.5:8080/track");
    }
}
