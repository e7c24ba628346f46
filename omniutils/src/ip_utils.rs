use std::net::{Ipv4Addr, UdpSocket};

use get_if_addrs::get_if_addrs;

/// Guesses the local IP address of the machine.
///
/// Binds a UDP socket to `0.0.0.0:0` and "connects" it to a public DNS
/// server (8.8.8.8). UDP being connectionless, no packet is sent; the
/// kernel simply resolves which interface would carry the traffic, and
/// the socket's local address is that interface's address.
///
/// Returns `"127.0.0.1"` when no route can be determined (offline
/// machine, sandboxed environment).
pub fn guess_local_ip() -> String {
    match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => {
            if socket.connect("8.8.8.8:80").is_ok() {
                if let Ok(local_addr) = socket.local_addr() {
                    return local_addr.ip().to_string();
                }
            }
            "127.0.0.1".to_string()
        }
        Err(_) => "127.0.0.1".to_string(),
    }
}

/// Lists the non-loopback IPv4 addresses of all network interfaces.
///
/// Used to join a multicast group on every interface that could see
/// device announcements. IPv6 and loopback addresses are skipped. An
/// empty vector means interface enumeration failed or the machine only
/// has loopback connectivity.
pub fn local_ipv4_addrs() -> Vec<Ipv4Addr> {
    let mut addrs = Vec::new();

    if let Ok(interfaces) = get_if_addrs() {
        for iface in interfaces {
            if let std::net::IpAddr::V4(ipv4) = iface.ip() {
                if !ipv4.is_loopback() {
                    addrs.push(ipv4);
                }
            }
        }
    }

    addrs
}
