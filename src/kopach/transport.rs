//! Sealed UDP broadcast channel shared by controllers and workers.
//!
//! Packet layout: `magic(4) | nonce(12) | AES-256-GCM ciphertext`. The key
//! is derived from the miner pass-phrase with Argon2 and the magic is bound
//! in as associated data.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use zeroize::Zeroizing;

use super::container::{Magic, Packet};
use crate::error::KopachError;

/// Largest datagram accepted on the channel.
pub const MAX_DATAGRAM_SIZE: usize = 8192;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 4 + NONCE_LEN;
const KEY_SALT: &[u8] = b"kopach broadcast channel";

pub struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    pub fn new(pass: &str) -> Result<Self, KopachError> {
        let mut key = Zeroizing::new([0u8; 32]);
        Argon2::default()
            .hash_password_into(pass.as_bytes(), KEY_SALT, &mut key[..])
            .map_err(|e| KopachError::KeyDerivation(e.to_string()))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        Ok(Self { cipher })
    }

    pub fn seal(&self, magic: Magic, payload: &[u8]) -> Result<Vec<u8>, KopachError> {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: payload,
                    aad: &magic,
                },
            )
            .map_err(|_| KopachError::Decrypt)?;
        let mut packet = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        packet.extend_from_slice(&magic);
        packet.extend_from_slice(&nonce);
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    pub fn open(&self, packet: &[u8]) -> Result<(Magic, Vec<u8>), KopachError> {
        if packet.len() <= HEADER_LEN {
            return Err(KopachError::ShortPacket(packet.len()));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&packet[..4]);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&packet[4..HEADER_LEN]),
                Payload {
                    msg: &packet[HEADER_LEN..],
                    aad: &magic,
                },
            )
            .map_err(|_| KopachError::Decrypt)?;
        Ok((magic, plaintext))
    }

    pub fn seal_packet(&self, packet: &Packet) -> Result<Vec<u8>, KopachError> {
        self.seal(packet.magic(), &packet.encode()?)
    }

    pub fn open_packet(&self, raw: &[u8]) -> Result<Packet, KopachError> {
        let (magic, payload) = self.open(raw)?;
        Packet::decode(magic, &payload)
    }
}

fn broadcast_socket(bind_port: u16) -> Result<UdpSocket, KopachError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, bind_port));
    socket.bind(&addr.into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

pub struct BroadcastChannel {
    socket: UdpSocket,
    sealer: Sealer,
    dest: SocketAddr,
}

impl BroadcastChannel {
    /// Listens on `port` and broadcasts to it.
    pub fn bind(port: u16, pass: &str) -> Result<Self, KopachError> {
        Ok(Self {
            socket: broadcast_socket(port)?,
            sealer: Sealer::new(pass)?,
            dest: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
        })
    }

    /// Send-only channel on an ephemeral port.
    pub fn sender(port: u16, pass: &str) -> Result<Self, KopachError> {
        Ok(Self {
            socket: broadcast_socket(0)?,
            sealer: Sealer::new(pass)?,
            dest: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
        })
    }

    pub async fn send(&self, packet: &Packet) -> Result<(), KopachError> {
        let sealed = self.sealer.seal_packet(packet)?;
        self.socket.send_to(&sealed, self.dest).await?;
        Ok(())
    }

    /// Next packet that opens under our pass-phrase. Others are dropped.
    pub async fn recv(&self) -> Result<(Packet, SocketAddr), KopachError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, src) = self.socket.recv_from(&mut buf).await?;
            match self.sealer.open_packet(&buf[..n]) {
                Ok(packet) => return Ok((packet, src)),
                Err(e) => tracing::debug!("dropping packet from {}: {}", src, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kopach::container::{PauseContainer, PAUSE_MAGIC};

    #[test]
    fn test_seal_open() {
        let sealer = Sealer::new("pa55word").unwrap();
        let packet = sealer.seal(PAUSE_MAGIC, b"payload").unwrap();
        assert_eq!(&packet[..4], b"paus");
        let (magic, plain) = sealer.open(&packet).unwrap();
        assert_eq!(magic, PAUSE_MAGIC);
        assert_eq!(plain, b"payload");
    }

    #[test]
    fn test_wrong_pass_is_rejected() {
        let ours = Sealer::new("right").unwrap();
        let theirs = Sealer::new("wrong").unwrap();
        let packet = theirs
            .seal_packet(&Packet::Pause(PauseContainer { ips: vec![], port: 1 }))
            .unwrap();
        assert!(matches!(ours.open(&packet), Err(KopachError::Decrypt)));
    }

    #[test]
    fn test_tampered_magic_is_rejected() {
        let sealer = Sealer::new("pass").unwrap();
        let mut packet = sealer.seal(PAUSE_MAGIC, b"x").unwrap();
        packet[..4].copy_from_slice(b"jobc");
        assert!(sealer.open(&packet).is_err());
    }

    #[test]
    fn test_short_packet() {
        let sealer = Sealer::new("pass").unwrap();
        assert!(matches!(sealer.open(&[0u8; 10]), Err(KopachError::ShortPacket(10))));
    }
}
