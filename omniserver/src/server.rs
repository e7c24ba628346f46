//! # Module Server - high level API over Axum
//!
//! Hides router plumbing behind a handful of methods:
//!
//! - 🚀 **JSON routes**: add an endpoint with `add_route()`
//! - 🎯 **Custom handlers**: SSE, streaming bodies, etc. with `add_handler_with_state()`
//! - 🧩 **Whole routers**: mount a prebuilt `Router` with `add_router()`
//! - ⚡ **Clean lifecycle**: bind errors surface in `start()`, `stop()` shuts down gracefully
//!
//! Routes can be added at any time before `start()`. The router is frozen
//! when the serve task is spawned.

use axum::handler::Handler;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::{RwLock, watch},
    task::JoinHandle,
};
use tracing::{error, info};

/// Errors reported by the server lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind HTTP listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Server already started")]
    AlreadyStarted,
}

/// Serializable server description, returned by [`Server::start`].
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub base_url: String,
    pub http_port: u16,
}

/// Embedded HTTP server.
///
/// The listener binds on `0.0.0.0`; `ip` is the address advertised to
/// clients through [`Server::base_url`].
pub struct Server {
    name: String,
    ip: String,
    http_port: u16,
    router: Arc<RwLock<Router>>,
    join_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl Server {
    /// Creates a server that will listen on `http_port`.
    ///
    /// A port of `0` asks the OS for an ephemeral port; the port actually
    /// bound is reported by [`Server::start`].
    ///
    /// # Example
    ///
    /// ```rust
    /// # use omniserver::Server;
    /// let server = Server::new("payload-server", "192.168.1.17", 8404);
    /// ```
    pub fn new(name: impl Into<String>, ip: impl Into<String>, http_port: u16) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            http_port,
            router: Arc::new(RwLock::new(Router::new())),
            join_handle: None,
            shutdown_tx: None,
        }
    }

    /// URL under which clients reach this server.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.http_port)
    }

    /// Adds a GET route answering with JSON.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use omniserver::Server;
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let mut server = Server::new("test", "127.0.0.1", 0);
    /// server.add_route("/status", || async {
    ///     serde_json::json!({ "status": "online" })
    /// }).await;
    /// # }
    /// ```
    pub async fn add_route<F, Fut, T>(&mut self, path: &str, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        let handler = {
            let f = f.clone();
            move || {
                let f = f.clone();
                async move { Json(f().await) }
            }
        };

        let route = Router::new().route("/", get(handler));

        let mut r = self.router.write().await;
        *r = if path == "/" {
            std::mem::take(&mut *r).merge(route)
        } else {
            std::mem::take(&mut *r).nest(path, route)
        };
    }

    /// Adds a plain Axum GET handler.
    pub async fn add_handler<H, T>(&mut self, path: &str, handler: H)
    where
        H: Handler<T, ()> + Clone + 'static,
        T: 'static,
    {
        let route = Router::new().route("/", get(handler.clone()));

        let mut r = self.router.write().await;
        *r = if path == "/" {
            std::mem::take(&mut *r).merge(route)
        } else {
            std::mem::take(&mut *r).nest(path, route)
        };
    }

    /// Adds a GET handler carrying shared state.
    pub async fn add_handler_with_state<H, T, S>(&mut self, path: &str, handler: H, state: S)
    where
        H: Handler<T, S> + Clone + 'static,
        T: 'static,
        S: Clone + Send + Sync + 'static,
    {
        let route = Router::new()
            .route("/", get(handler.clone()))
            .with_state(state.clone());

        let mut r = self.router.write().await;
        *r = if path == "/" {
            std::mem::take(&mut *r).merge(route)
        } else {
            std::mem::take(&mut *r).nest(path, route)
        };
    }

    /// Mounts a prebuilt router under `path`.
    pub async fn add_router(&mut self, path: &str, router: Router) {
        let mut r = self.router.write().await;
        *r = if path == "/" {
            std::mem::take(&mut *r).merge(router)
        } else {
            std::mem::take(&mut *r).nest(path, router)
        };
    }

    /// Binds the listener and spawns the serve task.
    ///
    /// Returns the bound port inside [`ServerInfo`], which matters when the
    /// server was created with port `0`.
    pub async fn start(&mut self) -> Result<ServerInfo, ServerError> {
        if self.join_handle.is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.http_port));
        let listener =
            tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|source| ServerError::Bind {
                    port: self.http_port,
                    source,
                })?;
        if let Ok(local) = listener.local_addr() {
            self.http_port = local.port();
        }

        info!(
            "Server {} listening at http://{}:{}",
            self.name, self.ip, self.http_port
        );

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let router = self.router.clone();
        let name = self.name.clone();
        self.join_handle = Some(tokio::spawn(async move {
            let r = router.read().await.clone();
            let served = axum::serve(listener, r.into_make_service())
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await;
            if let Err(e) = served {
                error!("Server {name} terminated: {e}");
            }
        }));
        self.shutdown_tx = Some(shutdown_tx);

        Ok(self.info())
    }

    /// Signals the serve task to finish and waits for it.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(h) = self.join_handle.take() {
            let _ = h.await;
        }
    }

    /// Waits for the serve task without asking it to stop.
    pub async fn wait(&mut self) {
        if let Some(h) = self.join_handle.take() {
            let _ = h.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.join_handle.is_some()
    }

    /// Server description with the currently bound port.
    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            name: self.name.clone(),
            base_url: self.base_url(),
            http_port: self.http_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_reports_bound_port() {
        let mut server = Server::new("test", "127.0.0.1", 0);
        let info = server.start().await.unwrap();
        assert_ne!(info.http_port, 0);
        assert_eq!(
            info.base_url,
            format!("http://127.0.0.1:{}", info.http_port)
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let mut server = Server::new("test", "127.0.0.1", 0);
        server.start().await.unwrap();
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyStarted));
        server.stop().await;
    }

    #[tokio::test]
    async fn bind_conflict_is_an_error() {
        let mut first = Server::new("first", "127.0.0.1", 0);
        let info = first.start().await.unwrap();

        let mut second = Server::new("second", "127.0.0.1", info.http_port);
        let err = second.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));

        first.stop().await;
    }

    #[tokio::test]
    async fn routes_answer_after_start() {
        let mut server = Server::new("test", "127.0.0.1", 0);
        server
            .add_route("/status", || async { serde_json::json!({ "status": "online" }) })
            .await;
        let info = server.start().await.unwrap();

        let body = reqwest::get(format!("{}/status", info.base_url))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("online"));

        server.stop().await;
        assert!(!server.is_running());
    }
}
