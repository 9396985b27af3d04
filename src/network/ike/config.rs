//! Immutable per-peer configuration (C9), grounded in
//! `examples/original_source/configuration.py`'s `IkeConfiguration`/
//! `IpsecConfiguration` named tuples and their validating loader.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::Deserialize;
use thiserror::Error;

use crate::network::ike::child_sa::IpsecMode;
use crate::network::ike::message::{
    Transform, TRANSFORM_TYPE_DH, TRANSFORM_TYPE_ENCR, TRANSFORM_TYPE_INTEG, TRANSFORM_TYPE_PRF, PROTOCOL_AH,
    PROTOCOL_ESP,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration found for peer {0}")]
    NotFound(Ipv4Addr),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// IKEv2-level settings for one peer, the equivalent of the original's
/// `IkeConfiguration` named tuple.
#[derive(Debug, Clone)]
pub struct IkeConfiguration {
    pub psk: Vec<u8>,
    pub lifetime_secs: u64,
    pub dpd_secs: u64,
    pub local_id: Vec<u8>,
    pub peer_id: Vec<u8>,
    pub encr: Vec<Transform>,
    pub integ: Vec<Transform>,
    pub prf: Vec<Transform>,
    pub dh: Vec<Transform>,
    pub protect: Vec<IpsecConfiguration>,
}

/// One protected-subnet entry, the equivalent of `IpsecConfiguration`.
#[derive(Debug, Clone)]
pub struct IpsecConfiguration {
    pub my_subnet: Ipv4Net,
    pub peer_subnet: Ipv4Net,
    pub index: u32,
    pub my_port: u16,
    pub peer_port: u16,
    pub ip_proto: u8,
    pub mode: IpsecMode,
    pub ipsec_proto: u8,
    pub lifetime_secs: u64,
    pub encr: Vec<Transform>,
    pub integ: Vec<Transform>,
}

const DEFAULT_ID: &str = "https://github.com/alejandro-perez/pyikev2";

/// On-disk representation deserialized by `config`/`serde`/`toml`; validated
/// and converted into `IkeConfiguration` by `PeerConfigurations::load`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawIkeConfig {
    #[serde(default = "default_psk")]
    pub(crate) psk: String,
    #[serde(default = "default_lifetime")]
    pub(crate) lifetime: u64,
    #[serde(default = "default_dpd")]
    pub(crate) dpd: u64,
    #[serde(default)]
    pub(crate) id: Option<String>,
    #[serde(default)]
    pub(crate) peer_id: Option<String>,
    #[serde(default = "default_encr")]
    pub(crate) encr: Vec<String>,
    #[serde(default = "default_integ")]
    pub(crate) integ: Vec<String>,
    #[serde(default = "default_prf")]
    pub(crate) prf: Vec<String>,
    #[serde(default = "default_dh")]
    pub(crate) dh: Vec<String>,
    #[serde(default)]
    pub(crate) protect: Vec<RawIpsecConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawIpsecConfig {
    my_subnet: Option<String>,
    peer_subnet: Option<String>,
    index: Option<u32>,
    #[serde(default)]
    my_port: u16,
    #[serde(default)]
    peer_port: u16,
    #[serde(default = "default_ip_proto")]
    ip_proto: String,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default = "default_ipsec_proto")]
    ipsec_proto: String,
    #[serde(default = "default_ipsec_lifetime")]
    lifetime: u64,
    #[serde(default = "default_encr")]
    encr: Vec<String>,
    #[serde(default = "default_integ")]
    integ: Vec<String>,
}

fn default_psk() -> String {
    "whatever".to_string()
}
fn default_lifetime() -> u64 {
    15 * 60
}
fn default_dpd() -> u64 {
    60
}
fn default_ipsec_lifetime() -> u64 {
    5 * 60
}
fn default_encr() -> Vec<String> {
    vec!["aes256".to_string()]
}
fn default_integ() -> Vec<String> {
    vec!["sha256".to_string()]
}
fn default_prf() -> Vec<String> {
    vec!["sha256".to_string()]
}
fn default_dh() -> Vec<String> {
    vec!["14".to_string()]
}
fn default_ip_proto() -> String {
    "any".to_string()
}
fn default_mode() -> String {
    "transport".to_string()
}
fn default_ipsec_proto() -> String {
    "esp".to_string()
}

/// Map of peer IPv4 address -> `IkeConfiguration`, loaded from a TOML table
/// the way the original loads a peer-keyed dict.
#[derive(Debug, Default)]
pub struct PeerConfigurations {
    peers: HashMap<Ipv4Addr, IkeConfiguration>,
}

impl PeerConfigurations {
    pub(crate) fn load(my_addr: Ipv4Addr, raw_peers: HashMap<String, RawIkeConfig>) -> Result<Self, ConfigError> {
        let mut peers = HashMap::new();
        for (addr_str, raw) in raw_peers {
            let peer_addr: Ipv4Addr = addr_str
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("invalid peer address {addr_str}")))?;
            let conf = load_ike_conf(my_addr, peer_addr, raw)?;
            peers.insert(peer_addr, conf);
        }
        Ok(PeerConfigurations { peers })
    }

    /// Builds a configuration set directly from already-validated entries,
    /// bypassing the file loader — used by tests that construct
    /// `IkeConfiguration` values in-process.
    pub fn from_map(peers: HashMap<Ipv4Addr, IkeConfiguration>) -> Self {
        PeerConfigurations { peers }
    }

    pub fn get(&self, peer_addr: Ipv4Addr) -> Result<&IkeConfiguration, ConfigError> {
        self.peers.get(&peer_addr).ok_or(ConfigError::NotFound(peer_addr))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn load_ike_conf(my_addr: Ipv4Addr, peer_addr: Ipv4Addr, raw: RawIkeConfig) -> Result<IkeConfiguration, ConfigError> {
    let mut protect = Vec::with_capacity(raw.protect.len().max(1));
    if raw.protect.is_empty() {
        protect.push(load_ipsec_conf(my_addr, peer_addr, RawIpsecConfig {
            my_subnet: None,
            peer_subnet: None,
            index: None,
            my_port: 0,
            peer_port: 0,
            ip_proto: default_ip_proto(),
            mode: default_mode(),
            ipsec_proto: default_ipsec_proto(),
            lifetime: default_ipsec_lifetime(),
            encr: default_encr(),
            integ: default_integ(),
        })?);
    } else {
        for raw_protect in raw.protect {
            protect.push(load_ipsec_conf(my_addr, peer_addr, raw_protect)?);
        }
    }

    Ok(IkeConfiguration {
        psk: raw.psk.into_bytes(),
        lifetime_secs: raw.lifetime,
        dpd_secs: raw.dpd,
        local_id: raw.id.unwrap_or_else(|| DEFAULT_ID.to_string()).into_bytes(),
        peer_id: raw.peer_id.unwrap_or_else(|| DEFAULT_ID.to_string()).into_bytes(),
        encr: load_crypto_algs("encr", &raw.encr, encr_transform)?,
        integ: load_crypto_algs("integ", &raw.integ, integ_transform)?,
        prf: load_crypto_algs("prf", &raw.prf, prf_transform)?,
        dh: load_crypto_algs("dh", &raw.dh, dh_transform)?,
        protect,
    })
}

fn load_ipsec_conf(my_addr: Ipv4Addr, peer_addr: Ipv4Addr, raw: RawIpsecConfig) -> Result<IpsecConfiguration, ConfigError> {
    let my_subnet = parse_subnet(raw.my_subnet.as_deref().unwrap_or(&my_addr.to_string()))?;
    let peer_subnet = parse_subnet(raw.peer_subnet.as_deref().unwrap_or(&peer_addr.to_string()))?;
    Ok(IpsecConfiguration {
        my_subnet,
        peer_subnet,
        index: raw.index.unwrap_or_else(random_policy_index),
        my_port: raw.my_port,
        peer_port: raw.peer_port,
        ip_proto: ip_proto_from_name(&raw.ip_proto)?,
        mode: mode_from_name(&raw.mode)?,
        ipsec_proto: ipsec_proto_from_name(&raw.ipsec_proto)?,
        lifetime_secs: raw.lifetime,
        encr: load_crypto_algs("encr", &raw.encr, encr_transform)?,
        integ: load_crypto_algs("integ", &raw.integ, integ_transform)?,
    })
}

fn random_policy_index() -> u32 {
    let bytes = crate::network::ike::crypto::random_bytes(4).unwrap_or_else(|_| vec![0; 4]);
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) % (1 << 20)
}

fn parse_subnet(value: &str) -> Result<Ipv4Net, ConfigError> {
    if let Ok(net) = value.parse::<Ipv4Net>() {
        return Ok(net);
    }
    value
        .parse::<Ipv4Addr>()
        .map(|addr| Ipv4Net::new(addr, 32).expect("/32 is always valid"))
        .map_err(|_| ConfigError::Invalid(format!("invalid subnet/address {value}")))
}

fn load_crypto_algs(
    field: &str,
    names: &[String],
    to_transform: fn(&str) -> Option<Transform>,
) -> Result<Vec<Transform>, ConfigError> {
    if names.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must list at least one algorithm")));
    }
    names
        .iter()
        .map(|name| to_transform(name).ok_or_else(|| ConfigError::Invalid(format!("{field} '{name}' not supported"))))
        .collect()
}

fn encr_transform(name: &str) -> Option<Transform> {
    let (id, bits) = match name {
        "aes128" => (12, 128),
        "aes256" => (12, 256),
        _ => return None,
    };
    Some(Transform {
        transform_type: TRANSFORM_TYPE_ENCR,
        transform_id: id,
        key_length_bits: Some(bits),
    })
}

fn integ_transform(name: &str) -> Option<Transform> {
    let id = match name {
        "sha1" => 2,
        "sha256" => 12,
        "sha512" => 14,
        _ => return None,
    };
    Some(Transform {
        transform_type: TRANSFORM_TYPE_INTEG,
        transform_id: id,
        key_length_bits: None,
    })
}

fn prf_transform(name: &str) -> Option<Transform> {
    let id = match name {
        "sha1" => 2,
        "sha256" => 5,
        "sha512" => 7,
        _ => return None,
    };
    Some(Transform {
        transform_type: TRANSFORM_TYPE_PRF,
        transform_id: id,
        key_length_bits: None,
    })
}

fn dh_transform(name: &str) -> Option<Transform> {
    let id: u16 = match name {
        "1" => 1,
        "2" => 2,
        "5" => 5,
        "14" => 14,
        "15" => 15,
        "16" => 16,
        "17" => 17,
        "18" => 18,
        _ => return None,
    };
    Some(Transform {
        transform_type: TRANSFORM_TYPE_DH,
        transform_id: id,
        key_length_bits: None,
    })
}

fn ip_proto_from_name(name: &str) -> Result<u8, ConfigError> {
    match name {
        "tcp" => Ok(6),
        "udp" => Ok(17),
        "icmp" => Ok(1),
        "any" => Ok(0),
        other => Err(ConfigError::Invalid(format!("ip_proto '{other}' not supported"))),
    }
}

fn mode_from_name(name: &str) -> Result<IpsecMode, ConfigError> {
    match name {
        "transport" => Ok(IpsecMode::Transport),
        "tunnel" => Ok(IpsecMode::Tunnel),
        other => Err(ConfigError::Invalid(format!("mode '{other}' not supported"))),
    }
}

fn ipsec_proto_from_name(name: &str) -> Result<u8, ConfigError> {
    match name {
        "esp" => Ok(PROTOCOL_ESP),
        "ah" => Ok(PROTOCOL_AH),
        other => Err(ConfigError::Invalid(format!("ipsec_proto '{other}' not supported"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_raw() -> RawIkeConfig {
        RawIkeConfig {
            psk: "testing".to_string(),
            lifetime: default_lifetime(),
            dpd: default_dpd(),
            id: None,
            peer_id: None,
            encr: vec!["aes256".to_string(), "aes128".to_string()],
            integ: vec!["sha256".to_string()],
            prf: vec!["sha256".to_string()],
            dh: vec!["14".to_string()],
            protect: vec![],
        }
    }

    #[test]
    fn loads_defaults_for_missing_protect() {
        let conf = load_ike_conf("192.168.0.1".parse().unwrap(), "192.168.0.2".parse().unwrap(), minimal_raw()).unwrap();
        assert_eq!(conf.protect.len(), 1);
        assert_eq!(conf.protect[0].mode, IpsecMode::Transport);
        assert_eq!(conf.psk, b"testing");
    }

    #[test]
    fn rejects_unknown_algorithm_name() {
        let mut raw = minimal_raw();
        raw.encr = vec!["des".to_string()];
        assert!(load_ike_conf("192.168.0.1".parse().unwrap(), "192.168.0.2".parse().unwrap(), raw).is_err());
    }
}
