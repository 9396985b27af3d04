//! End-to-end exercise of the dispatcher against two in-process peers, the
//! way `original_source/test_protocol.py`'s `TestIkeSa` drives a pair of
//! controllers without a real socket in between.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use ikev2d::network::ike::child_sa::IpsecMode;
use ikev2d::network::ike::config::{IkeConfiguration, IpsecConfiguration, PeerConfigurations};
use ikev2d::network::ike::dispatcher::Dispatcher;
use ikev2d::network::ike::kernel::NullKernel;
use ikev2d::network::ike::message::{
    Transform, PROTOCOL_ESP, TRANSFORM_TYPE_DH, TRANSFORM_TYPE_ENCR, TRANSFORM_TYPE_INTEG, TRANSFORM_TYPE_PRF,
};

fn transform(ty: u8, id: u16, bits: Option<u16>) -> Transform {
    Transform { transform_type: ty, transform_id: id, key_length_bits: bits }
}

fn config_for(my_addr: Ipv4Addr, peer_addr: Ipv4Addr) -> IkeConfiguration {
    IkeConfiguration {
        psk: b"shared secret".to_vec(),
        lifetime_secs: 3600,
        dpd_secs: 30,
        local_id: my_addr.to_string().into_bytes(),
        peer_id: peer_addr.to_string().into_bytes(),
        encr: vec![transform(TRANSFORM_TYPE_ENCR, 12, Some(256))],
        integ: vec![transform(TRANSFORM_TYPE_INTEG, 12, None)],
        prf: vec![transform(TRANSFORM_TYPE_PRF, 5, None)],
        dh: vec![transform(TRANSFORM_TYPE_DH, 14, None)],
        protect: vec![IpsecConfiguration {
            my_subnet: format!("{my_addr}/32").parse().unwrap(),
            peer_subnet: format!("{peer_addr}/32").parse().unwrap(),
            index: 1,
            my_port: 0,
            peer_port: 0,
            ip_proto: 0,
            mode: IpsecMode::Transport,
            ipsec_proto: PROTOCOL_ESP,
            lifetime_secs: 600,
            encr: vec![transform(TRANSFORM_TYPE_ENCR, 12, Some(256))],
            integ: vec![transform(TRANSFORM_TYPE_INTEG, 12, None)],
        }],
    }
}

fn dispatcher_for(my_addr: Ipv4Addr, peer_addr: Ipv4Addr) -> Dispatcher<NullKernel> {
    let mut peers = HashMap::new();
    peers.insert(peer_addr, config_for(my_addr, peer_addr));
    Dispatcher::new(my_addr, std::sync::Arc::new(PeerConfigurations::from_map(peers)), NullKernel)
}

#[test]
fn initiate_and_handshake_establishes_a_child_sa_on_both_sides() {
    let addr_a: Ipv4Addr = "10.0.0.1".parse().unwrap();
    let addr_b: Ipv4Addr = "10.0.0.2".parse().unwrap();
    let mut a = dispatcher_for(addr_a, addr_b);
    let mut b = dispatcher_for(addr_b, addr_a);

    let init_req = a.initiate(addr_b).expect("initiator produces IKE_SA_INIT");
    assert_eq!(init_req.to, addr_b);

    let init_res = b.handle_datagram(addr_a, &init_req.bytes).expect("responder answers IKE_SA_INIT");
    assert_eq!(init_res.to, addr_a);

    let auth_req = a.handle_datagram(addr_b, &init_res.bytes).expect("initiator sends IKE_AUTH");
    let auth_res = b.handle_datagram(addr_a, &auth_req.bytes).expect("responder answers IKE_AUTH");

    assert!(a.handle_datagram(addr_b, &auth_res.bytes).is_none());

    assert_eq!(a.session_count(), 1);
    assert_eq!(b.session_count(), 1);
}

#[test]
fn unrecognized_non_init_datagram_is_dropped() {
    let addr_a: Ipv4Addr = "10.0.0.1".parse().unwrap();
    let addr_b: Ipv4Addr = "10.0.0.2".parse().unwrap();
    let mut b = dispatcher_for(addr_b, addr_a);

    // An IKE_AUTH-looking datagram for an SPI pair the responder has never
    // seen must not spin up a new session (only IKE_SA_INIT requests do).
    let mut raw = vec![0u8; 48];
    raw[18] = 35; // exchange_type = IKE_AUTH
    assert!(b.handle_datagram(addr_a, &raw).is_none());
    assert_eq!(b.session_count(), 0);
}
