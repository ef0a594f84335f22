//! Guest/host protocol version handshake and versioned command layouts.

use core::fmt;

use crate::error::{Result, RpcError, TransportFault};
use crate::message::{Function, RpcMessage, RESULT_SUCCESS};
use crate::rpc::{RpcEngine, RpcTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}.{:02X}", self.major, self.minor)
    }
}

/// Version this driver speaks natively.
pub const CURRENT_VERSION: ProtocolVersion = ProtocolVersion::new(0x2A, 0x01);
/// Oldest peer the driver still talks to.
pub const MIN_SUPPORTED_VERSION: ProtocolVersion = ProtocolVersion::new(0x03, 0x00);
/// First version whose `UNLOADING_GUEST_DRIVER` carries the target power level.
pub const PM_LEVEL_VERSION: ProtocolVersion = ProtocolVersion::new(0x1F, 0x07);

/// Command layouts selected by the negotiated version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcInterface {
    /// 03.00 up to, not including, 1F.07.
    Base,
    /// 1F.07 and later.
    PmLevel,
}

impl RpcInterface {
    pub fn for_version(version: ProtocolVersion) -> Self {
        if version >= PM_LEVEL_VERSION {
            RpcInterface::PmLevel
        } else {
            RpcInterface::Base
        }
    }

    pub fn unloading_guest_driver(self, req: &UnloadRequest) -> RpcMessage {
        let mut body = Vec::with_capacity(12);
        body.extend_from_slice(&u32::from(req.in_pm_transition).to_le_bytes());
        body.extend_from_slice(&u32::from(req.gc6_entering).to_le_bytes());
        if self == RpcInterface::PmLevel {
            body.extend_from_slice(&req.new_pm_level.to_le_bytes());
        }
        RpcMessage::new(Function::UNLOADING_GUEST_DRIVER, body)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnloadRequest {
    pub in_pm_transition: bool,
    pub gc6_entering: bool,
    pub new_pm_level: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Pending,
    Negotiated {
        version: ProtocolVersion,
        interface: RpcInterface,
    },
    /// The instance stays unusable until detached.
    Failed,
}

impl HandshakeState {
    pub fn is_failed(&self) -> bool {
        matches!(self, HandshakeState::Failed)
    }

    pub fn interface(&self) -> Option<RpcInterface> {
        match self {
            HandshakeState::Negotiated { interface, .. } => Some(*interface),
            _ => None,
        }
    }

    pub fn version(&self) -> Option<ProtocolVersion> {
        match self {
            HandshakeState::Negotiated { version, .. } => Some(*version),
            _ => None,
        }
    }
}

/// Body of `SET_GUEST_SYSTEM_INFO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInfo {
    pub version: ProtocolVersion,
    pub driver_version: String,
}

impl GuestInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(12 + self.driver_version.len());
        body.extend_from_slice(&self.version.major.to_le_bytes());
        body.extend_from_slice(&self.version.minor.to_le_bytes());
        body.extend_from_slice(&(self.driver_version.len() as u32).to_le_bytes());
        body.extend_from_slice(self.driver_version.as_bytes());
        body
    }

    pub fn decode(body: &[u8]) -> core::result::Result<Self, TransportFault> {
        let version = decode_version(body)?;
        let len = read_u32(body, 8).ok_or(TransportFault::Malformed("guest info truncated"))? as usize;
        let text = body
            .get(12..12 + len)
            .ok_or(TransportFault::Malformed("guest info truncated"))?;
        let driver_version = String::from_utf8(text.to_vec())
            .map_err(|_| TransportFault::Malformed("driver version is not UTF-8"))?;
        Ok(Self {
            version,
            driver_version,
        })
    }
}

/// Leading `(major, minor)` pair of a handshake body.
pub fn decode_version(body: &[u8]) -> core::result::Result<ProtocolVersion, TransportFault> {
    match (read_u32(body, 0), read_u32(body, 4)) {
        (Some(major), Some(minor)) => Ok(ProtocolVersion::new(major, minor)),
        _ => Err(TransportFault::Malformed("version body truncated")),
    }
}

pub fn encode_version(version: ProtocolVersion) -> Vec<u8> {
    let mut body = version.major.to_le_bytes().to_vec();
    body.extend_from_slice(&version.minor.to_le_bytes());
    body
}

fn read_u32(body: &[u8], off: usize) -> Option<u32> {
    let bytes = body.get(off..off + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl<T: RpcTransport> RpcEngine<T> {
    /// Agrees on a protocol version with the peer.
    ///
    /// A peer that answers with a different version at or above `min` gets one
    /// retry at its own version. A peer below `min` fails the instance for good.
    pub fn negotiate_version(
        &mut self,
        ours: ProtocolVersion,
        min: ProtocolVersion,
        driver_version: &str,
    ) -> Result<RpcInterface> {
        if self.context().handshake().is_failed() {
            return Err(RpcError::HandshakeFailed);
        }

        let mut requested = ours;
        let mut retried = false;
        let agreed = loop {
            let info = GuestInfo {
                version: requested,
                driver_version: driver_version.to_string(),
            };
            let resp = self.call(RpcMessage::new(Function::SET_GUEST_SYSTEM_INFO, info.encode()))?;
            let peer = decode_version(&resp.body)?;
            if resp.rpc_result_private == RESULT_SUCCESS {
                break requested;
            }
            if peer < min {
                tracing::error!(%peer, %min, "peer protocol version too old");
                self.context_mut().handshake = HandshakeState::Failed;
                return Err(RpcError::VersionTooOld { peer, min });
            }
            if retried || peer == requested {
                tracing::error!(%requested, %peer, "version handshake rejected");
                self.context_mut().handshake = HandshakeState::Failed;
                return Err(RpcError::HandshakeFailed);
            }
            tracing::info!(%requested, %peer, "retrying handshake with the peer's version");
            requested = peer;
            retried = true;
        };

        if let Some(previous) = self.context().handshake().version() {
            if previous != agreed {
                return Err(RpcError::InvalidState("protocol version changed across resume"));
            }
        }
        let interface = RpcInterface::for_version(agreed);
        tracing::debug!(version = %agreed, ?interface, "protocol version negotiated");
        self.context_mut().handshake = HandshakeState::Negotiated {
            version: agreed,
            interface,
        };
        Ok(interface)
    }

    /// Tells the peer the guest driver is going away, in the negotiated layout.
    pub fn unload_guest_driver(&mut self, req: &UnloadRequest) -> Result<()> {
        let interface = self
            .context()
            .handshake()
            .interface()
            .ok_or(RpcError::InvalidState("no negotiated protocol version"))?;
        self.call(interface.unloading_guest_driver(req))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_order_by_major_then_minor() {
        assert!(ProtocolVersion::new(0x1F, 0x07) > ProtocolVersion::new(0x1F, 0x06));
        assert!(ProtocolVersion::new(0x20, 0x00) > ProtocolVersion::new(0x1F, 0xFF));
        assert_eq!(ProtocolVersion::new(0x1F, 0x07).to_string(), "1F.07");
    }

    #[test]
    fn unload_layout_depends_on_interface() {
        let req = UnloadRequest {
            in_pm_transition: true,
            gc6_entering: false,
            new_pm_level: 3,
        };
        let base = RpcInterface::for_version(ProtocolVersion::new(0x1F, 0x06)).unloading_guest_driver(&req);
        let pm = RpcInterface::for_version(PM_LEVEL_VERSION).unloading_guest_driver(&req);
        assert_eq!(base.body, vec![1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(pm.body.len(), 12);
        assert_eq!(&pm.body[8..], &3u32.to_le_bytes());
    }

    #[test]
    fn guest_info_round_trip() {
        let info = GuestInfo {
            version: CURRENT_VERSION,
            driver_version: "570.86".to_string(),
        };
        assert_eq!(GuestInfo::decode(&info.encode()).unwrap(), info);
        assert!(GuestInfo::decode(&info.encode()[..10]).is_err());
    }
}
