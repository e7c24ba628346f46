use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::bail;
use async_trait::async_trait;
use futures::StreamExt;
use omnicast::{
    AdapterState, CastError, Device, DeviceEvent, DeviceId, MediaAdapter, MediaController,
    MediaPayload, MediaServerConfig, Registry, RegistryConfig, RegistryHandle, RegistryState,
    SendOptions, SendRequest, SendResult, SessionGuard,
};

/// Scriptable in-memory adapter used to drive the registry end to end.
struct MockAdapter {
    name: String,
    devices: Vec<Device>,
    start_error: Option<String>,
    send_error: Option<String>,
    send_delay: Option<Duration>,
    send_panic: bool,
    churn: bool,
    started: AtomicUsize,
    stopped: AtomicUsize,
    sends: AtomicUsize,
    guard: Mutex<Option<SessionGuard>>,
}

impl MockAdapter {
    fn new() -> Self {
        Self::named("mock")
    }

    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            devices: Vec::new(),
            start_error: None,
            send_error: None,
            send_delay: None,
            send_panic: false,
            churn: false,
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            guard: Mutex::new(None),
        }
    }

    fn with_device(mut self, device: Device) -> Self {
        self.devices.push(device);
        self
    }

    fn with_start_error(mut self, detail: &str) -> Self {
        self.start_error = Some(detail.to_string());
        self
    }

    fn with_send_error(mut self, detail: &str) -> Self {
        self.send_error = Some(detail.to_string());
        self
    }

    fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    fn with_send_panic(mut self) -> Self {
        self.send_panic = true;
        self
    }

    /// After registering, update then drop the first device so subscribers
    /// see an Added/Updated/Removed sequence.
    fn with_churn(mut self) -> Self {
        self.churn = true;
        self
    }
}

#[async_trait]
impl MediaAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, handle: RegistryHandle) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(detail) = &self.start_error {
            bail!("{detail}");
        }
        *self.guard.lock().unwrap() = Some(handle.session_guard());
        for device in &self.devices {
            handle.register_device(device.clone());
        }
        if self.churn {
            let first = self.devices[0].clone();
            handle.register_device(first.clone().with_model("rev2"));
            handle.unregister_device(&first.id, "lost");
        }
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_media(&self, _device: Device, request: SendRequest) -> anyhow::Result<SendResult> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if self.send_panic {
            panic!("mock send panic");
        }
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(detail) = &self.send_error {
            bail!("{detail}");
        }
        let guard = self.guard.lock().unwrap().clone().expect("started");
        Ok(
            SendResult::ok_with_controller(Arc::new(MockController { guard }))
                .with_metadata("url", serde_json::json!(request.url)),
        )
    }
}

struct MockController {
    guard: SessionGuard,
}

#[async_trait]
impl MediaController for MockController {
    async fn play(&self) -> Result<(), CastError> {
        self.guard.ensure_active()
    }

    async fn pause(&self) -> Result<(), CastError> {
        self.guard.ensure_active()
    }

    async fn stop(&self) -> Result<(), CastError> {
        self.guard.ensure_active()
    }

    async fn seek(&self, _position: Duration) -> Result<(), CastError> {
        self.guard.ensure_active()
    }

    async fn set_volume(&self, _level: f32) -> Result<(), CastError> {
        self.guard.ensure_active()
    }

    async fn set_mute(&self, _muted: bool) -> Result<(), CastError> {
        self.guard.ensure_active()
    }
}

fn mock_device(id: &str) -> Device {
    Device::new(id, format!("Mock {id}"), "mock")
}

fn test_config() -> RegistryConfig {
    RegistryConfig::default().with_media_server(MediaServerConfig::default().with_ip("127.0.0.1"))
}

async fn next_event(stream: &mut omnicast::EventStream) -> DeviceEvent {
    tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

fn label(event: &DeviceEvent) -> &'static str {
    match event {
        DeviceEvent::Added { .. } => "added",
        DeviceEvent::Updated { .. } => "updated",
        DeviceEvent::Removed { .. } => "removed",
        DeviceEvent::MediaStatusUpdated { .. } => "media_status",
        DeviceEvent::VolumeUpdated { .. } => "volume",
    }
}

#[tokio::test]
async fn test_send_media_through_adapter() {
    let registry = Registry::new(test_config());
    let adapter = Arc::new(MockAdapter::new().with_device(mock_device("living-room")));
    registry.add_adapter(adapter.clone());

    let mut events = registry.events();
    registry.start().await.unwrap();
    assert_eq!(label(&next_event(&mut events).await), "added");

    let payload = MediaPayload::from_bytes(&b"flac frames"[..]).with_mime_type("audio/flac");
    let result = registry
        .send_media(&DeviceId::new("living-room"), payload, SendOptions::default())
        .await;

    assert!(result.success, "reason: {:?}", result.reason);
    assert!(result.controller.is_some());
    assert_eq!(adapter.sends.load(Ordering::SeqCst), 1);

    // Non-URL payloads reach the adapter as media server URLs.
    let base = registry.media_base_url().unwrap();
    let url = result.metadata["url"].as_str().unwrap();
    assert!(url.starts_with(&base), "{url} not under {base}");

    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_url_payloads_are_passed_through() {
    let registry = Registry::new(test_config());
    let adapter = Arc::new(MockAdapter::new().with_device(mock_device("tv")));
    registry.add_adapter(adapter.clone());

    let mut events = registry.events();
    registry.start().await.unwrap();
    next_event(&mut events).await;

    let result = registry
        .send_media(
            &DeviceId::new("tv"),
            MediaPayload::from_url("http://radio.example/stream.mp3"),
            SendOptions::default(),
        )
        .await;

    assert!(result.success);
    assert_eq!(
        result.metadata["url"].as_str().unwrap(),
        "http://radio.example/stream.mp3"
    );

    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_send_media_to_unknown_device() {
    let registry = Registry::new(test_config());
    let adapter = Arc::new(MockAdapter::new());
    registry.add_adapter(adapter.clone());
    registry.start().await.unwrap();

    let result = registry
        .send_media(
            &DeviceId::new("ghost"),
            MediaPayload::from_url("http://radio.example/stream.mp3"),
            SendOptions::default(),
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.reason.as_deref(), Some("DeviceNotFound"));
    // The adapter is never consulted for a failed lookup.
    assert_eq!(adapter.sends.load(Ordering::SeqCst), 0);

    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_subscribers_observe_the_same_order() {
    let registry = Registry::new(test_config());
    registry.add_adapter(Arc::new(
        MockAdapter::new().with_device(mock_device("tv")).with_churn(),
    ));

    let mut first = registry.events();
    let mut second = registry.events();
    registry.start().await.unwrap();

    let mut seen: Vec<Vec<&'static str>> = Vec::new();
    for stream in [&mut first, &mut second] {
        let mut labels = Vec::new();
        for _ in 0..3 {
            labels.push(label(&next_event(stream).await));
        }
        seen.push(labels);
    }

    assert_eq!(seen[0], ["added", "updated", "removed"]);
    assert_eq!(seen[0], seen[1]);

    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_send_media_timeout_is_bounded() {
    let registry = Registry::new(test_config());
    let adapter = Arc::new(
        MockAdapter::new()
            .with_device(mock_device("slow"))
            .with_send_delay(Duration::from_secs(10)),
    );
    registry.add_adapter(adapter.clone());

    let mut events = registry.events();
    registry.start().await.unwrap();
    next_event(&mut events).await;

    let begin = Instant::now();
    let result = registry
        .send_media(
            &DeviceId::new("slow"),
            MediaPayload::from_url("http://radio.example/stream.mp3"),
            SendOptions::default().with_timeout(Duration::from_millis(250)),
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.reason.as_deref(), Some("Timeout"));
    assert!(
        begin.elapsed() < Duration::from_secs(2),
        "send_media did not honor the caller timeout"
    );
    // A timed-out send does not take the adapter down.
    assert_eq!(registry.adapter_state("mock"), AdapterState::Running);

    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_adapter_errors_become_failed_results() {
    let registry = Registry::new(test_config());
    registry.add_adapter(Arc::new(
        MockAdapter::new()
            .with_device(mock_device("tv"))
            .with_send_error("renderer rejected the URI"),
    ));

    let mut events = registry.events();
    registry.start().await.unwrap();
    next_event(&mut events).await;

    let result = registry
        .send_media(
            &DeviceId::new("tv"),
            MediaPayload::from_url("http://radio.example/stream.mp3"),
            SendOptions::default(),
        )
        .await;

    assert!(!result.success);
    assert_eq!(
        result.reason.as_deref(),
        Some("AdapterFailure: renderer rejected the URI")
    );

    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_adapter_panic_is_contained() {
    let registry = Registry::new(test_config());
    registry.add_adapter(Arc::new(
        MockAdapter::new()
            .with_device(mock_device("flaky"))
            .with_send_panic(),
    ));

    let mut events = registry.events();
    registry.start().await.unwrap();
    next_event(&mut events).await;

    let result = registry
        .send_media(
            &DeviceId::new("flaky"),
            MediaPayload::from_url("http://radio.example/stream.mp3"),
            SendOptions::default(),
        )
        .await;

    assert!(!result.success);
    assert_eq!(
        result.reason.as_deref(),
        Some("AdapterFailure: adapter panicked during send")
    );

    // The registry keeps serving requests afterwards.
    assert_eq!(registry.adapter_state("mock"), AdapterState::Running);
    let after = registry
        .send_media(
            &DeviceId::new("ghost"),
            MediaPayload::from_url("http://radio.example/other.mp3"),
            SendOptions::default(),
        )
        .await;
    assert_eq!(after.reason.as_deref(), Some("DeviceNotFound"));

    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_adapter_start_failure_is_isolated() {
    let registry = Registry::new(test_config());
    let broken = Arc::new(MockAdapter::named("broken").with_start_error("no multicast socket"));
    let healthy = Arc::new(MockAdapter::new().with_device(mock_device("tv")));
    registry.add_adapter(broken.clone());
    registry.add_adapter(healthy.clone());

    registry.start().await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while registry.adapter_state("broken") != AdapterState::Stopped {
        assert!(Instant::now() < deadline, "failed adapter never marked stopped");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(registry.adapter_state("mock"), AdapterState::Running);
    let deadline = Instant::now() + Duration::from_secs(2);
    while registry.get_device(&DeviceId::new("tv")).is_none() {
        assert!(Instant::now() < deadline, "healthy adapter never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_drops_devices_and_is_terminal() {
    let registry = Registry::new(test_config());
    let adapter = Arc::new(
        MockAdapter::new()
            .with_device(mock_device("one"))
            .with_device(mock_device("two")),
    );
    registry.add_adapter(adapter.clone());

    let removed = Arc::new(Mutex::new(Vec::new()));
    let sink = removed.clone();
    let _subscription = registry.subscribe(move |event| {
        if let DeviceEvent::Removed { id, reason, .. } = event {
            sink.lock().unwrap().push((id.to_string(), reason));
        }
    });

    registry.start().await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while registry.list_devices().len() < 2 {
        assert!(Instant::now() < deadline, "devices never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    registry.stop().await.unwrap();

    assert_eq!(adapter.stopped.load(Ordering::SeqCst), 1);
    assert!(registry.list_devices().is_empty());
    assert_eq!(registry.state(), RegistryState::Stopped);

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let seen = removed.lock().unwrap().clone();
        if seen.len() == 2 {
            for (_, reason) in &seen {
                assert_eq!(reason.as_deref(), Some("shutdown"));
            }
            break;
        }
        assert!(Instant::now() < deadline, "expected 2 removals, saw {seen:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Stopping twice is fine; restarting a stopped registry is not.
    registry.stop().await.unwrap();
    assert!(matches!(registry.start().await, Err(CastError::AlreadyStopped)));

    let late = registry
        .send_media(
            &DeviceId::new("one"),
            MediaPayload::from_url("http://radio.example/stream.mp3"),
            SendOptions::default(),
        )
        .await;
    assert_eq!(late.reason.as_deref(), Some("AlreadyStopped"));
}

#[tokio::test]
async fn test_send_media_before_start() {
    let registry = Registry::new(test_config());
    registry.add_adapter(Arc::new(MockAdapter::new().with_device(mock_device("tv"))));

    let early = registry
        .send_media(
            &DeviceId::new("tv"),
            MediaPayload::from_url("http://radio.example/stream.mp3"),
            SendOptions::default(),
        )
        .await;
    assert_eq!(early.reason.as_deref(), Some("NotStarted"));
}

#[tokio::test]
async fn test_controllers_die_with_the_registry() {
    let registry = Registry::new(test_config());
    registry.add_adapter(Arc::new(MockAdapter::new().with_device(mock_device("tv"))));

    let mut events = registry.events();
    registry.start().await.unwrap();
    next_event(&mut events).await;

    let result = registry
        .send_media(
            &DeviceId::new("tv"),
            MediaPayload::from_url("http://radio.example/stream.mp3"),
            SendOptions::default(),
        )
        .await;
    let controller = result.controller.clone().expect("controller");

    controller.play().await.unwrap();
    controller.pause().await.unwrap();

    registry.stop().await.unwrap();

    assert!(matches!(controller.play().await, Err(CastError::SessionEnded)));
    assert!(matches!(
        controller.set_volume(0.5).await,
        Err(CastError::SessionEnded)
    ));
}
