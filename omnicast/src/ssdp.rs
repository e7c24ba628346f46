//! SSDP discovery: periodic M-SEARCH plus NOTIFY parsing.
//!
//! The socket binds an ephemeral port, so multicast NOTIFYs addressed to
//! port 1900 usually do not reach it; byebye handling is best effort and
//! adapters back it up with absence-based expiry.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250";
pub const SSDP_PORT: u16 = 1900;
pub const DEFAULT_MAX_AGE: u64 = 1800;

const SSDP_MULTICAST: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// One parsed SSDP advertisement or search response.
#[derive(Clone, Debug, Default)]
pub struct SsdpMessage {
    pub location: Option<String>,
    pub usn: Option<String>,
    /// ST of a search response, NT of a NOTIFY.
    pub st: Option<String>,
    pub server: Option<String>,
    pub max_age: u64,
    pub headers: HashMap<String, String>,
}

impl SsdpMessage {
    fn from_headers(headers: HashMap<String, String>) -> Self {
        let max_age = headers
            .get("cache-control")
            .and_then(|v| parse_max_age(v))
            .unwrap_or(DEFAULT_MAX_AGE);
        Self {
            location: headers.get("location").cloned(),
            usn: headers.get("usn").cloned(),
            st: headers.get("st").or_else(|| headers.get("nt")).cloned(),
            server: headers.get("server").cloned(),
            max_age,
            headers,
        }
    }
}

#[derive(Clone, Debug)]
pub enum SsdpEvent {
    Alive(SsdpMessage),
    ByeBye { usn: String },
    SearchResponse(SsdpMessage),
}

/// Background SSDP listener for one search target.
pub struct SsdpListener {
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SsdpListener {
    /// Spawns the listener thread. Search responses and advertisements
    /// matching `search_target` are pushed into `tx`; the thread exits when
    /// the receiver closes or [`SsdpListener::stop`] is called.
    pub fn spawn(
        search_target: String,
        search_interval: Duration,
        tx: tokio::sync::mpsc::Sender<SsdpEvent>,
    ) -> std::io::Result<Self> {
        let socket = open_socket()?;
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_flag = stop_flag.clone();
        let thread = std::thread::Builder::new()
            .name("ssdp-listener".to_string())
            .spawn(move || listen_loop(socket, search_target, search_interval, tx, thread_flag))?;
        Ok(Self {
            stop_flag,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SsdpListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    socket.set_read_timeout(Some(READ_TIMEOUT))?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(2)?;

    let mut joined = false;
    for iface in omniutils::local_ipv4_addrs() {
        match socket.join_multicast_v4(&SSDP_MULTICAST, &iface) {
            Ok(()) => joined = true,
            Err(e) => debug!(interface = %iface, error = %e, "Multicast join failed"),
        }
    }
    if !joined {
        // No usable interface; fall back to the default route.
        socket.join_multicast_v4(&SSDP_MULTICAST, &Ipv4Addr::UNSPECIFIED)?;
    }
    Ok(socket.into())
}

fn listen_loop(
    socket: UdpSocket,
    search_target: String,
    search_interval: Duration,
    tx: tokio::sync::mpsc::Sender<SsdpEvent>,
    stop_flag: Arc<AtomicBool>,
) {
    let msearch = build_msearch(&search_target);
    let destination = format!("{SSDP_MULTICAST_ADDR}:{SSDP_PORT}");
    let mut last_search: Option<Instant> = None;
    let mut buf = [0u8; 8192];

    while !stop_flag.load(Ordering::Acquire) {
        if last_search.is_none_or(|t| t.elapsed() >= search_interval) {
            trace!(target = %search_target, "Sending M-SEARCH");
            if let Err(e) = socket.send_to(msearch.as_bytes(), &destination) {
                warn!(error = %e, "M-SEARCH send failed");
            }
            last_search = Some(Instant::now());
        }

        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "SSDP receive failed");
                break;
            }
        };

        let text = String::from_utf8_lossy(&buf[..len]);
        let Some(event) = parse_packet(&text) else {
            continue;
        };
        let forward = match &event {
            SsdpEvent::ByeBye { .. } => true,
            SsdpEvent::Alive(msg) | SsdpEvent::SearchResponse(msg) => {
                msg.st.as_deref() == Some(search_target.as_str())
            }
        };
        if forward {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                    debug!("SSDP event queue full, dropping packet");
                }
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    }
    debug!(target = %search_target, "SSDP listener exiting");
}

fn build_msearch(target: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {SSDP_MULTICAST_ADDR}:{SSDP_PORT}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 2\r\n\
         ST: {target}\r\n\r\n"
    )
}

fn parse_packet(text: &str) -> Option<SsdpEvent> {
    let mut lines = text.lines();
    let start = lines.next()?.trim();
    let headers = parse_headers(lines);

    if start.starts_with("HTTP/1.1 200") || start.starts_with("HTTP/1.0 200") {
        return Some(SsdpEvent::SearchResponse(SsdpMessage::from_headers(headers)));
    }
    if start.starts_with("M-SEARCH") {
        return None;
    }
    if start.starts_with("NOTIFY") {
        return match headers.get("nts").map(String::as_str) {
            Some("ssdp:alive") => Some(SsdpEvent::Alive(SsdpMessage::from_headers(headers))),
            Some("ssdp:byebye") => Some(SsdpEvent::ByeBye {
                usn: headers.get("usn").cloned().unwrap_or_default(),
            }),
            _ => None,
        };
    }
    None
}

/// Header names are lowercased; values keep their case.
fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }
    headers
}

/// Pulls the UDN (`uuid:...`) out of a USN header, lowercased.
pub fn extract_udn_from_usn(usn: &str) -> Option<String> {
    let start = usn.find("uuid:")?;
    let rest = &usn[start..];
    let end = rest.find("::").unwrap_or(rest.len());
    Some(rest[..end].to_lowercase())
}

fn parse_max_age(cache_control: &str) -> Option<u64> {
    let idx = cache_control.to_lowercase().find("max-age")?;
    let rest = &cache_control[idx..];
    let value = rest.split_once('=')?.1.trim();
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
