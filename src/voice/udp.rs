use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use tokio::net::UdpSocket;

use super::{
    constants::{
        DISCOVERY_PACKET_SIZE, IP_DISCOVERY_TIMEOUT_SECS, RTP_TIMESTAMP_STEP,
        UDP_PACKET_BUF_CAPACITY,
    },
    crypto::{CryptoError, PacketCipher},
    rtp::RtpHeader,
};
use crate::common::{errors::map_boxed_err, types::AnyResult};

/// Where finished voice packets go.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn send_packet(&self, packet: &[u8]) -> io::Result<()>;
}

pub struct UdpSink {
    socket: Arc<UdpSocket>,
    address: SocketAddr,
}

impl UdpSink {
    pub fn new(socket: Arc<UdpSocket>, address: SocketAddr) -> Self {
        Self { socket, address }
    }
}

#[async_trait]
impl PacketSink for UdpSink {
    async fn send_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.socket.send_to(packet, self.address).await.map(|_| ())
    }
}

/// Frames Opus payloads as encrypted RTP with wrapping sequence and
/// timestamp counters.
pub struct RtpPacketizer {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    cipher: PacketCipher,
    /// Reused for every packet.
    packet_buf: Vec<u8>,
}

impl RtpPacketizer {
    /// Starts the counters at random offsets.
    pub fn new(ssrc: u32, cipher: PacketCipher) -> Self {
        let mut rng = rand::thread_rng();
        let (sequence, timestamp) = (rng.r#gen(), rng.r#gen());
        Self::with_counters(ssrc, cipher, sequence, timestamp)
    }

    pub fn with_counters(ssrc: u32, cipher: PacketCipher, sequence: u16, timestamp: u32) -> Self {
        Self {
            ssrc,
            sequence,
            timestamp,
            cipher,
            packet_buf: Vec::with_capacity(UDP_PACKET_BUF_CAPACITY),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn packetize(&mut self, opus: &[u8]) -> Result<&[u8], CryptoError> {
        let header = RtpHeader {
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        }
        .to_bytes();
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(RTP_TIMESTAMP_STEP);

        self.packet_buf.clear();
        self.cipher.seal(&header, opus, &mut self.packet_buf)?;
        Ok(&self.packet_buf)
    }
}

pub async fn bind_socket() -> io::Result<UdpSocket> {
    UdpSocket::bind("0.0.0.0:0").await
}

pub fn discovery_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_SIZE] {
    let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
    packet[0..2].copy_from_slice(&1u16.to_be_bytes());
    packet[2..4].copy_from_slice(&70u16.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

/// Extracts our external `(ip, port)` from a discovery response.
pub fn parse_discovery_response(buf: &[u8]) -> Option<(String, u16)> {
    if buf.len() < DISCOVERY_PACKET_SIZE || u16::from_be_bytes([buf[0], buf[1]]) != 2 {
        return None;
    }
    let address = &buf[8..72];
    let end = address.iter().position(|&b| b == 0).unwrap_or(address.len());
    let ip = std::str::from_utf8(&address[..end]).ok()?.to_owned();
    if ip.is_empty() {
        return None;
    }
    let port = u16::from_be_bytes([buf[72], buf[73]]);
    Some((ip, port))
}

pub async fn discover_ip(
    socket: &UdpSocket,
    addr: SocketAddr,
    ssrc: u32,
) -> AnyResult<(String, u16)> {
    socket
        .send_to(&discovery_request(ssrc), addr)
        .await
        .map_err(map_boxed_err)?;

    let mut buf = [0u8; DISCOVERY_PACKET_SIZE];
    let received = tokio::time::timeout(
        Duration::from_secs(IP_DISCOVERY_TIMEOUT_SECS),
        socket.recv(&mut buf),
    )
    .await
    .map_err(|_| map_boxed_err("IP discovery timed out"))?
    .map_err(map_boxed_err)?;

    parse_discovery_response(&buf[..received])
        .ok_or_else(|| map_boxed_err("malformed IP discovery response"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::{crypto::EncryptionMode, rtp::RtpPacket};

    #[test]
    fn counters_wrap() {
        let cipher = PacketCipher::new(EncryptionMode::XSalsa20Poly1305, &[1; 32]);
        let mut packetizer = RtpPacketizer::with_counters(9, cipher, u16::MAX, u32::MAX - 100);

        let first = RtpPacket::parse(packetizer.packetize(b"a").unwrap()).unwrap();
        assert_eq!(first.header.sequence, u16::MAX);
        assert_eq!(first.header.ssrc, 9);

        let second = RtpPacket::parse(packetizer.packetize(b"b").unwrap()).unwrap();
        assert_eq!(second.header.sequence, 0);
        assert_eq!(second.header.timestamp, (u32::MAX - 100).wrapping_add(960));
    }

    #[test]
    fn discovery_response_is_parsed() {
        let mut response = [0u8; DISCOVERY_PACKET_SIZE];
        response[0..2].copy_from_slice(&2u16.to_be_bytes());
        response[2..4].copy_from_slice(&70u16.to_be_bytes());
        response[8..8 + 11].copy_from_slice(b"203.0.113.7");
        response[72..74].copy_from_slice(&50_004u16.to_be_bytes());

        assert_eq!(
            parse_discovery_response(&response),
            Some(("203.0.113.7".to_owned(), 50_004))
        );
        assert_eq!(parse_discovery_response(&response[..40]), None);
    }

    #[test]
    fn discovery_request_layout() {
        let request = discovery_request(0x0102_0304);
        assert_eq!(&request[..8], &[0, 1, 0, 70, 1, 2, 3, 4]);
        assert!(request[8..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn discovery_over_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_port = client.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; DISCOVERY_PACKET_SIZE];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let mut response = [0u8; DISCOVERY_PACKET_SIZE];
            response[0..2].copy_from_slice(&2u16.to_be_bytes());
            response[4..8].copy_from_slice(&buf[4..8]);
            response[8..17].copy_from_slice(b"127.0.0.1");
            response[72..74].copy_from_slice(&from.port().to_be_bytes());
            server.send_to(&response, from).await.unwrap();
        });

        let (ip, port) = discover_ip(&client, server_addr, 42).await.unwrap();
        assert_eq!(ip, "127.0.0.1");
        assert_eq!(port, client_port);
    }
}
