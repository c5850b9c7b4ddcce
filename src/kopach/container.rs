//! Payloads carried by kopach broadcasts.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::chain::{BlockHeader, Hash};
use crate::error::KopachError;

pub type Magic = [u8; 4];

pub const JOB_MAGIC: Magic = *b"jobc";
pub const PAUSE_MAGIC: Magic = *b"paus";
pub const SOL_MAGIC: Magic = *b"solv";

fn controller_addr(ips: &[IpAddr], port: u16) -> Option<String> {
    let ip = ips.first()?;
    Some(match ip {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    })
}

/// Work for the miners: everything needed to rebuild the header except
/// the nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContainer {
    pub ips: Vec<IpAddr>,
    pub port: u16,
    pub height: i32,
    pub version: i32,
    pub prev_block: Hash,
    pub merkle_root: Hash,
    pub bits: u32,
    pub timestamp: i64,
}

impl JobContainer {
    /// `ip:port` identifying the controller that sent the job.
    pub fn controller_addr(&self) -> Option<String> {
        controller_addr(&self.ips, self.port)
    }

    pub fn header(&self, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block: self.prev_block,
            merkle_root: self.merkle_root,
            timestamp: self.timestamp,
            bits: self.bits,
            nonce,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseContainer {
    pub ips: Vec<IpAddr>,
    pub port: u16,
}

impl PauseContainer {
    pub fn controller_addr(&self) -> Option<String> {
        controller_addr(&self.ips, self.port)
    }
}

/// A solved header, addressed to the controller that issued the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolContainer {
    pub ips: Vec<IpAddr>,
    pub port: u16,
    pub header: BlockHeader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Job(JobContainer),
    Pause(PauseContainer),
    Sol(SolContainer),
}

impl Packet {
    pub fn magic(&self) -> Magic {
        match self {
            Packet::Job(_) => JOB_MAGIC,
            Packet::Pause(_) => PAUSE_MAGIC,
            Packet::Sol(_) => SOL_MAGIC,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, KopachError> {
        let payload = match self {
            Packet::Job(job) => bincode::serialize(job)?,
            Packet::Pause(pause) => bincode::serialize(pause)?,
            Packet::Sol(sol) => bincode::serialize(sol)?,
        };
        Ok(payload)
    }

    pub fn decode(magic: Magic, payload: &[u8]) -> Result<Self, KopachError> {
        match magic {
            JOB_MAGIC => Ok(Packet::Job(bincode::deserialize(payload)?)),
            PAUSE_MAGIC => Ok(Packet::Pause(bincode::deserialize(payload)?)),
            SOL_MAGIC => Ok(Packet::Sol(bincode::deserialize(payload)?)),
            other => Err(KopachError::UnknownMagic(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_controller_addr_formats() {
        let pause = PauseContainer {
            ips: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))],
            port: 11047,
        };
        assert_eq!(pause.controller_addr().as_deref(), Some("10.0.0.2:11047"));

        let pause = PauseContainer {
            ips: vec![IpAddr::V6(Ipv6Addr::LOCALHOST)],
            port: 1,
        };
        assert_eq!(pause.controller_addr().as_deref(), Some("[::1]:1"));

        let pause = PauseContainer { ips: vec![], port: 1 };
        assert!(pause.controller_addr().is_none());
    }

    #[test]
    fn test_unknown_magic_rejected() {
        let err = Packet::decode(*b"nope", &[]).unwrap_err();
        assert!(matches!(err, KopachError::UnknownMagic(m) if &m == b"nope"));
    }

    #[test]
    fn test_job_header_carries_nonce() {
        let job = JobContainer {
            ips: vec![],
            port: 0,
            height: 5,
            version: 2,
            prev_block: Hash([1; 32]),
            merkle_root: Hash([2; 32]),
            bits: 0x207fffff,
            timestamp: 1_600_000_000,
        };
        let header = job.header(42);
        assert_eq!(header.nonce, 42);
        assert_eq!(header.merkle_root, job.merkle_root);

        let packet = Packet::Job(job.clone());
        let decoded = Packet::decode(packet.magic(), &packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, Packet::Job(job));
    }
}
