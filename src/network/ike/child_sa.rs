//! Child SA record (C6): the negotiated keying material and selectors for one
//! IPsec SA pair, plus the protocol/mode it was installed under.

use crate::network::ike::crypto::{EncrAlg, IntegAlg};
use crate::network::ike::message::{TrafficSelector, PROTOCOL_ESP};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpsecMode {
    Transport,
    Tunnel,
}

#[derive(Debug, Clone)]
pub struct ChildSa {
    pub inbound_spi: u32,
    pub outbound_spi: u32,
    pub protocol_id: u8,
    pub mode: IpsecMode,
    pub encr_alg: EncrAlg,
    pub integ_alg: IntegAlg,
    pub encr_key_in: Vec<u8>,
    pub integ_key_in: Vec<u8>,
    pub encr_key_out: Vec<u8>,
    pub integ_key_out: Vec<u8>,
    pub tsi: TrafficSelector,
    pub tsr: TrafficSelector,
    pub lifetime_secs: u64,
    /// Monotonic instant (seconds since an arbitrary epoch) after which a soft
    /// expire should be delivered by the kernel plane; owned/tracked by the
    /// caller, not computed here (the core has no clock, per the synchronous
    /// I/O-free design).
    pub soft_expire_at: Option<u64>,
}

impl ChildSa {
    pub fn new_esp_transport(
        inbound_spi: u32,
        outbound_spi: u32,
        encr_alg: EncrAlg,
        integ_alg: IntegAlg,
        encr_key_in: Vec<u8>,
        integ_key_in: Vec<u8>,
        encr_key_out: Vec<u8>,
        integ_key_out: Vec<u8>,
        tsi: TrafficSelector,
        tsr: TrafficSelector,
        lifetime_secs: u64,
    ) -> Self {
        ChildSa {
            inbound_spi,
            outbound_spi,
            protocol_id: PROTOCOL_ESP,
            mode: IpsecMode::Transport,
            encr_alg,
            integ_alg,
            encr_key_in,
            integ_key_in,
            encr_key_out,
            integ_key_out,
            tsi,
            tsr,
            lifetime_secs,
            soft_expire_at: None,
        }
    }
}
