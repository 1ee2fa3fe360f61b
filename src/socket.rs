use std::net::SocketAddr;

use anyhow::{anyhow, Context};
use socket2::Protocol;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_device(socket: &socket2::Socket, device: &str) -> anyhow::Result<()> {
    socket
        .bind_device(Some(device.as_bytes()))
        .with_context(|| format!("bind_device {device}"))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_device(_socket: &socket2::Socket, device: &str) -> anyhow::Result<()> {
    Err(anyhow!("binding to device {device} is not supported on this platform"))
}

fn bind_udp_ops(addr: SocketAddr, device: Option<&str>) -> anyhow::Result<socket2::Socket> {
    let socket = if addr.is_ipv4() {
        socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?
    } else {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket
            .set_only_v6(true)
            .with_context(|| format!("set_only_v6 failed: {}", &addr))?;
        socket
    };
    if let Some(device) = device {
        bind_device(&socket, device)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Bind the relay's external socket. Must run inside a tokio runtime.
pub fn bind_udp(addr: SocketAddr, device: Option<&str>) -> anyhow::Result<tokio::net::UdpSocket> {
    let socket = bind_udp_ops(addr, device).with_context(|| format!("bind_udp {}", addr))?;
    let udp: std::net::UdpSocket = socket.into();
    tokio::net::UdpSocket::from_std(udp).map_err(|e| anyhow!("register {addr}: {e}"))
}
