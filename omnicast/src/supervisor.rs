//! Lifecycle supervision for transport adapters.
//!
//! Each adapter runs in its own tokio task. Failures stay contained at this
//! boundary: an error return or panic inside an adapter is logged and marks
//! the adapter stopped, nothing else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterState, MediaAdapter, RegistryHandle, SessionGuard};

pub struct AdapterSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    stop_timeout: Duration,
    base_handle: RegistryHandle,
    entries: Mutex<HashMap<String, AdapterEntry>>,
    next_generation: AtomicU64,
}

struct AdapterEntry {
    adapter: Arc<dyn MediaAdapter>,
    state: AdapterState,
    /// Distinguishes this run from earlier runs of the same adapter, so a
    /// stale monitor cannot mark a restarted adapter stopped.
    generation: u64,
    cancel: CancellationToken,
    run_abort: AbortHandle,
    monitor: Option<JoinHandle<()>>,
    guard: SessionGuard,
}

impl AdapterSupervisor {
    pub(crate) fn new(base_handle: RegistryHandle, stop_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                stop_timeout,
                base_handle,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Starts an adapter in its own task. Starting one that is already
    /// running is a no-op.
    pub fn start(&self, adapter: Arc<dyn MediaAdapter>) {
        let name = adapter.name().to_string();
        // The lock is held across the spawns (no await), so the monitor
        // cannot observe the table before the entry is inserted.
        let mut entries = self.inner.entries.lock().unwrap();
        if let Some(entry) = entries.get(&name) {
            if matches!(entry.state, AdapterState::Running | AdapterState::Starting) {
                debug!(adapter = %name, "Adapter already running, start ignored");
                return;
            }
        }

        let guard = SessionGuard::new();
        let cancel = CancellationToken::new();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = self.inner.base_handle.for_session(guard.clone());

        let run_adapter = adapter.clone();
        let run_cancel = cancel.clone();
        let run_name = name.clone();
        let run = tokio::spawn(async move {
            tokio::select! {
                result = run_adapter.start(handle) => match result {
                    Ok(()) => info!(adapter = %run_name, "Adapter finished"),
                    Err(e) => warn!(adapter = %run_name, error = %format!("{e:#}"), "Adapter failure"),
                },
                _ = run_cancel.cancelled() => debug!(adapter = %run_name, "Adapter cancelled"),
            }
        });
        let run_abort = run.abort_handle();

        // The monitor outlives the run task so a panic inside the adapter is
        // observed here instead of propagating.
        let weak = Arc::downgrade(&self.inner);
        let monitor_name = name.clone();
        let monitor = tokio::spawn(async move {
            if let Err(e) = run.await {
                if e.is_panic() {
                    warn!(adapter = %monitor_name, "Adapter failure: task panicked");
                }
            }
            mark_stopped(&weak, &monitor_name, generation);
        });

        entries.insert(
            name.clone(),
            AdapterEntry {
                adapter,
                state: AdapterState::Running,
                generation,
                cancel,
                run_abort,
                monitor: Some(monitor),
                guard,
            },
        );
        info!(adapter = %name, "Adapter started");
    }

    /// Stops an adapter, waiting at most the stop timeout before abandoning
    /// it. Stopping a stopped adapter is a no-op.
    pub async fn stop(&self, name: &str) {
        let (adapter, cancel, guard, run_abort, monitor) = {
            let mut entries = self.inner.entries.lock().unwrap();
            let Some(entry) = entries.get_mut(name) else {
                return;
            };
            if !matches!(entry.state, AdapterState::Running | AdapterState::Starting) {
                return;
            }
            entry.state = AdapterState::Stopping;
            (
                entry.adapter.clone(),
                entry.cancel.clone(),
                entry.guard.clone(),
                entry.run_abort.clone(),
                entry.monitor.take(),
            )
        };

        guard.revoke();
        cancel.cancel();

        let shutdown = async {
            if let Err(e) = adapter.stop().await {
                warn!(adapter = %name, error = %format!("{e:#}"), "Adapter stop reported an error");
            }
            if let Some(monitor) = monitor {
                let _ = monitor.await;
            }
        };
        let timed_out = tokio::time::timeout(self.inner.stop_timeout, shutdown)
            .await
            .is_err();
        if timed_out {
            run_abort.abort();
            warn!(
                adapter = %name,
                timeout_ms = self.inner.stop_timeout.as_millis() as u64,
                "Adapter did not stop in time, aborted"
            );
        }

        {
            let mut entries = self.inner.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(name) {
                entry.state = AdapterState::Stopped;
            }
        }
        if !timed_out {
            info!(adapter = %name, "Adapter stopped");
        }
    }

    /// Stops every known adapter, one at a time.
    pub async fn stop_all(&self) {
        let names: Vec<String> = {
            let entries = self.inner.entries.lock().unwrap();
            entries.keys().cloned().collect()
        };
        for name in names {
            self.stop(&name).await;
        }
    }

    /// The adapter owning the given transport, when it is running.
    pub fn adapter_for_transport(&self, transport: &str) -> Option<Arc<dyn MediaAdapter>> {
        let entries = self.inner.entries.lock().unwrap();
        entries.get(transport).and_then(|entry| {
            matches!(entry.state, AdapterState::Running).then(|| entry.adapter.clone())
        })
    }

    pub fn state_of(&self, name: &str) -> AdapterState {
        let entries = self.inner.entries.lock().unwrap();
        entries
            .get(name)
            .map(|e| e.state)
            .unwrap_or(AdapterState::Stopped)
    }
}

fn mark_stopped(inner: &Weak<SupervisorInner>, name: &str, generation: u64) {
    if let Some(inner) = inner.upgrade() {
        let mut entries = inner.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(name) {
            if entry.generation == generation {
                entry.state = AdapterState::Stopped;
            }
        }
    }
}
