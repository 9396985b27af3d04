//! Kernel IPsec plane adapter (C8): the narrow interface the core state
//! machine uses to install/remove SAs and policies. No real netlink/XFRM
//! implementation lives here — that plumbing is out of scope, the same
//! boundary the Python original draws around its functional `xfrm_*` calls
//! (`examples/original_source/ipsec.py`).

use std::net::Ipv4Addr;

use crate::network::ike::child_sa::IpsecMode;
use crate::network::ike::crypto::{EncrAlg, IntegAlg};
use crate::network::ike::message::TrafficSelector;
use crate::network::ike::IKEError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    Fwd,
}

pub struct InstallChildSa<'a> {
    pub inbound: bool,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_selector: &'a TrafficSelector,
    pub dst_selector: &'a TrafficSelector,
    pub protocol_id: u8,
    pub mode: IpsecMode,
    pub spi: u32,
    pub encr_alg: EncrAlg,
    pub encr_key: &'a [u8],
    pub integ_alg: IntegAlg,
    pub integ_key: &'a [u8],
}

pub struct IpsecPolicy<'a> {
    pub my_subnet: &'a TrafficSelector,
    pub peer_subnet: &'a TrafficSelector,
    pub mode: IpsecMode,
    pub index: Option<u32>,
}

/// A kernel-originated lifetime/acquire event. The dispatcher (C10) polls or
/// is notified of these and feeds them into the matching `IkeSa` via
/// `process_acquire`/`process_expire`.
#[derive(Debug, Clone)]
pub enum KernelEvent {
    Acquire {
        tsi: TrafficSelector,
        tsr: TrafficSelector,
        policy_index: u32,
    },
    Expire {
        inbound_spi: u32,
        hard: bool,
    },
}

/// A deferred kernel-plane command produced by the core for the caller to
/// execute. Keeping the core synchronous and I/O-free (§5) means these are
/// returned as data instead of invoked in-line, the one generalization this
/// crate makes over the original's direct `xfrm.create_sa`/`delete_sa` calls.
#[derive(Debug, Clone)]
pub enum KernelCommand {
    InstallChildSa {
        inbound: bool,
        spi: u32,
    },
    RemoveChildSa {
        spi: u32,
        protocol_id: u8,
    },
    InstallPolicies {
        direction: Direction,
        index: Option<u32>,
    },
}

pub trait KernelInterface {
    fn install_child_sa(&self, params: InstallChildSa<'_>) -> Result<(), IKEError>;
    fn remove_child_sa(&self, dst: Ipv4Addr, protocol_id: u8, spi: u32) -> Result<(), IKEError>;
    fn install_policies(&self, direction: Direction, src: Ipv4Addr, dst: Ipv4Addr, conf: &IpsecPolicy<'_>) -> Result<(), IKEError>;
}

/// A no-op kernel used by tests that exercise only the `IkeSa` state machine
/// (mirrors the original test suite's avoidance of any real netlink access).
pub struct NullKernel;

impl KernelInterface for NullKernel {
    fn install_child_sa(&self, _params: InstallChildSa<'_>) -> Result<(), IKEError> {
        Ok(())
    }

    fn remove_child_sa(&self, _dst: Ipv4Addr, _protocol_id: u8, _spi: u32) -> Result<(), IKEError> {
        Ok(())
    }

    fn install_policies(&self, _direction: Direction, _src: Ipv4Addr, _dst: Ipv4Addr, _conf: &IpsecPolicy<'_>) -> Result<(), IKEError> {
        Ok(())
    }
}

/// Like `NullKernel` but logs every call at `debug!`, useful when running the
/// daemon without a real XFRM backend wired up yet.
pub struct LoggingKernel;

impl KernelInterface for LoggingKernel {
    fn install_child_sa(&self, params: InstallChildSa<'_>) -> Result<(), IKEError> {
        tracing::debug!(
            inbound = params.inbound,
            spi = params.spi,
            src = %params.src,
            dst = %params.dst,
            "install_child_sa"
        );
        Ok(())
    }

    fn remove_child_sa(&self, dst: Ipv4Addr, protocol_id: u8, spi: u32) -> Result<(), IKEError> {
        tracing::debug!(%dst, protocol_id, spi, "remove_child_sa");
        Ok(())
    }

    fn install_policies(&self, direction: Direction, src: Ipv4Addr, dst: Ipv4Addr, conf: &IpsecPolicy<'_>) -> Result<(), IKEError> {
        tracing::debug!(?direction, %src, %dst, index = ?conf.index, "install_policies");
        Ok(())
    }
}
