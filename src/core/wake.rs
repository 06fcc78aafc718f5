//! Wake-on-LAN magic packets.
//!
//! Packet layout: six `0xFF` bytes followed by the target MAC repeated
//! sixteen times, sent as a UDP broadcast to port 9.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::debug;

use crate::core::models::Device;
use crate::error::{Error, Result};

pub const WAKE_PORT: u16 = 9;
pub const PACKET_LEN: usize = 102;

/// Parse `AA:BB:CC:DD:EE:FF` or `AA-BB-CC-DD-EE-FF`.
pub fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = mac.trim().split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(Error::InvalidMacAddress(mac.to_string()));
    }

    let mut bytes = [0u8; 6];
    for (byte, part) in bytes.iter_mut().zip(parts) {
        if part.len() != 2 {
            return Err(Error::InvalidMacAddress(mac.to_string()));
        }
        *byte =
            u8::from_str_radix(part, 16).map_err(|_| Error::InvalidMacAddress(mac.to_string()))?;
    }
    Ok(bytes)
}

pub fn magic_packet(mac: [u8; 6]) -> [u8; PACKET_LEN] {
    let mut packet = [0xFFu8; PACKET_LEN];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac);
    }
    packet
}

pub async fn send_magic_packet(mac: [u8; 6], broadcast: IpAddr) -> Result<()> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        .await
        .map_err(|e| Error::WakeFailed(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| Error::WakeFailed(e.to_string()))?;

    let packet = magic_packet(mac);
    socket
        .send_to(&packet, SocketAddr::new(broadcast, WAKE_PORT))
        .await
        .map_err(|e| Error::WakeFailed(e.to_string()))?;

    Ok(())
}

/// Send the wake packet for a device. Devices without wake-on-LAN are left alone.
pub async fn wake_device(device: &Device, broadcast: IpAddr) -> Result<()> {
    if !device.wake_on_lan {
        return Ok(());
    }

    let mac = device
        .mac_address
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| Error::MissingWakeAddress(device.id.clone()))?;
    let mac = parse_mac(mac)?;

    debug!(device_id = %device.id, %broadcast, "Sending wake-on-LAN packet");
    send_magic_packet(mac, broadcast).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ProtocolType;

    fn device(wake: bool, mac: Option<&str>) -> Device {
        Device {
            id: "nas".into(),
            name: "NAS".into(),
            protocol: ProtocolType::Smb,
            host: "192.0.2.10".into(),
            port: None,
            credentials: None,
            wake_on_lan: wake,
            mac_address: mac.map(String::from),
            schedule: None,
            retention: None,
            filters: None,
            shares: Vec::new(),
        }
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("00:11:22:aa:BB:cc").unwrap(),
            [0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC]
        );
        assert_eq!(
            parse_mac("00-11-22-33-44-55").unwrap(),
            [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]
        );
        assert!(parse_mac("00:11:22:33:44").is_err());
        assert!(parse_mac("00:11:22:33:44:zz").is_err());
        assert!(parse_mac("001:1:22:33:44:55").is_err());
    }

    #[test]
    fn test_magic_packet_layout() {
        let mac = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB];
        let packet = magic_packet(mac);

        assert_eq!(packet.len(), 102);
        assert!(packet[..6].iter().all(|b| *b == 0xFF));
        for i in 0..16 {
            let start = 6 + i * 6;
            assert_eq!(&packet[start..start + 6], &mac);
        }
    }

    #[tokio::test]
    async fn test_missing_mac_is_rejected() {
        let result = wake_device(&device(true, None), Ipv4Addr::BROADCAST.into()).await;
        assert!(matches!(result, Err(Error::MissingWakeAddress(_))));
    }

    #[tokio::test]
    async fn test_wake_disabled_is_noop() {
        let result = wake_device(&device(false, None), Ipv4Addr::BROADCAST.into()).await;
        assert!(result.is_ok());
    }
}
