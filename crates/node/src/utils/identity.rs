use std::net::UdpSocket;

/// Stable identifier for this machine, used as the registration UUID on
/// hosts without a GPU. Prefers /etc/machine-id, falls back to hostname.
pub fn machine_id() -> String {
    if let Ok(data) = std::fs::read_to_string("/etc/machine-id") {
        let machine_id = data.trim();
        if machine_id.len() >= 16 {
            return format!("MACHINE-{}", &machine_id[..16]);
        }
    }

    let hostname = std::fs::read_to_string("/etc/hostname")
        .map(|h| h.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("CPU-{hostname}")
}

/// Best-effort probe for this machine's preferred outbound IP. No packet is
/// sent; connecting a UDP socket just selects the route.
pub fn outbound_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };

    probe().unwrap_or_else(|_| "localhost".to_string())
}
