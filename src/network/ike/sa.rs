//! The `IkeSa` state machine (C7): exchange orchestration, collision
//! handling, queueing and timers. This is the synchronous, I/O-free core
//! described in `SPEC_FULL.md` §3 — every public method runs to completion
//! and returns data (an optional outbound datagram, plus kernel-plane
//! commands for the caller to execute via `KernelInterface`).

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::network::ike::child_sa::{ChildSa, IpsecMode};
use crate::network::ike::config::IkeConfiguration;
use crate::network::ike::crypto::{random_nonce, random_spi, DhGroup, DiffieHellman, EncrAlg, IntegAlg, PrfAlg};
use crate::network::ike::kernel::{Direction, InstallChildSa, IpsecPolicy, KernelCommand};
use crate::network::ike::keys::{derive_child_keys, derive_ike_keys, IkeKeys};
use crate::network::ike::message::{
    decode_message, encode_message, DeletePayloadData, ExchangeType, IkeHeader, NotifyPayloadData, NotifyType,
    Payload, Proposal, SkContext, Transform, TrafficSelector, PROTOCOL_AH, PROTOCOL_ESP, PROTOCOL_IKE,
    TRANSFORM_TYPE_DH, TS_IPV4_ADDR_RANGE,
};
use crate::network::ike::proposal;
use crate::network::ike::selectors;
use crate::network::ike::IKEError;

pub const MAX_RETRANSMISSIONS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IkeSaState {
    Initial,
    InitReqSent,
    InitResSent,
    AuthReqSent,
    Established,
    NewChildReqSent,
    RekChildReqSent,
    DelChildReqSent,
    RekIkeSaReqSent,
    DelIkeSaReqSent,
    Rekeyed,
    DelAfterRekeyIkeSaReqSent,
    Deleted,
}

/// What a currently in-flight initiator request represents, needed to apply
/// the collision table in RFC 7296 §2.8 when a conflicting request arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingKind {
    IkeSaInit,
    IkeAuth,
    NewChild,
    RekeyChild { old_inbound_spi: u32 },
    DeleteChild { inbound_spi: u32 },
    RekeyIke,
    DeleteIke,
    Dpd,
}

struct RequestInFlight {
    bytes: Vec<u8>,
    msg_id: u32,
    kind: PendingKind,
}

/// A deferred acquire trigger.
struct QueuedAcquire {
    tsi: TrafficSelector,
    tsr: TrafficSelector,
    policy_index: u32,
}

/// A deferred expire trigger.
struct QueuedExpire {
    inbound_spi: u32,
    hard: bool,
}

/// A Child SA torn down locally (rekey retirement, peer delete, or the
/// whole IKE SA reaching `Deleted`) that the caller still needs to remove
/// from the kernel plane.
#[derive(Debug, Clone, Copy)]
pub struct RetiredChildSa {
    pub protocol_id: u8,
    pub inbound_spi: u32,
    pub outbound_spi: u32,
}

pub struct IkeSa {
    pub is_initiator: bool,
    pub my_addr: Ipv4Addr,
    pub peer_addr: Ipv4Addr,
    pub config: Arc<IkeConfiguration>,

    pub state: IkeSaState,

    pub my_spi: [u8; 8],
    pub peer_spi: [u8; 8],

    my_msg_id: u32,
    peer_msg_id: u32,

    request_in_flight: Option<RequestInFlight>,
    last_response_sent: Option<(Vec<u8>, u32)>,

    my_nonce: Vec<u8>,
    peer_nonce: Vec<u8>,
    dh: Option<DiffieHellman>,
    dh_shared_secret: Option<Vec<u8>>,

    prf: Option<PrfAlg>,
    integ: Option<IntegAlg>,
    encr: Option<EncrAlg>,
    keys: Option<IkeKeys>,

    pub child_sas: Vec<ChildSa>,
    acquire_queue: VecDeque<QueuedAcquire>,
    expire_queue: VecDeque<QueuedExpire>,

    retransmit_armed: bool,
    retransmit_count: u32,
    start_dpd_armed: bool,
    rekey_ike_sa_armed: bool,
    delete_ike_sa_armed: bool,

    rekeying_child_sa: Option<u32>,
    /// Peer nonce seen on an incoming CREATE_CHILD_SA that collided with our
    /// own in-flight rekey of the same child, kept only until the
    /// `TEMPORARY_FAILURE` response to our request lets us compare it
    /// against `my_nonce` (RFC 7296 §2.25.1).
    colliding_peer_nonce: Option<Vec<u8>>,
    retired_child_sas: Vec<RetiredChildSa>,
    pub new_ike_sa: Option<Box<IkeSa>>,

    next_child_inbound_spi: u32,
}

impl IkeSa {
    pub fn new_initiator(my_addr: Ipv4Addr, peer_addr: Ipv4Addr, config: Arc<IkeConfiguration>) -> Result<Self, IKEError> {
        Self::new(true, my_addr, peer_addr, config)
    }

    pub fn new_responder(my_addr: Ipv4Addr, peer_addr: Ipv4Addr, config: Arc<IkeConfiguration>) -> Result<Self, IKEError> {
        Self::new(false, my_addr, peer_addr, config)
    }

    fn new(is_initiator: bool, my_addr: Ipv4Addr, peer_addr: Ipv4Addr, config: Arc<IkeConfiguration>) -> Result<Self, IKEError> {
        Ok(IkeSa {
            is_initiator,
            my_addr,
            peer_addr,
            config,
            state: IkeSaState::Initial,
            my_spi: random_spi()?,
            peer_spi: [0; 8],
            my_msg_id: 0,
            peer_msg_id: 0,
            request_in_flight: None,
            last_response_sent: None,
            my_nonce: Vec::new(),
            peer_nonce: Vec::new(),
            dh: None,
            dh_shared_secret: None,
            prf: None,
            integ: None,
            encr: None,
            keys: None,
            child_sas: Vec::new(),
            acquire_queue: VecDeque::new(),
            expire_queue: VecDeque::new(),
            retransmit_armed: false,
            retransmit_count: 0,
            start_dpd_armed: false,
            rekey_ike_sa_armed: false,
            delete_ike_sa_armed: false,
            rekeying_child_sa: None,
            colliding_peer_nonce: None,
            retired_child_sas: Vec::new(),
            new_ike_sa: None,
            next_child_inbound_spi: 1,
        })
    }

    pub fn is_established(&self) -> bool {
        self.state == IkeSaState::Established
    }

    fn is_deleted(&self) -> bool {
        self.state == IkeSaState::Deleted
    }

    /// Moves to `Deleted` and retires every Child SA this IKE SA still
    /// carries, so the caller's next `drain_retired_child_sas` removes them
    /// from the kernel plane before the session itself is dropped.
    fn mark_deleted(&mut self) {
        self.state = IkeSaState::Deleted;
        for child in self.child_sas.drain(..) {
            self.retired_child_sas.push(RetiredChildSa {
                protocol_id: child.protocol_id,
                inbound_spi: child.inbound_spi,
                outbound_spi: child.outbound_spi,
            });
        }
    }

    fn sk_context(&self, for_initiator_direction: bool) -> Option<SkContext> {
        let keys = self.keys.as_ref()?;
        let (encr_key, integ_key) = if for_initiator_direction {
            (keys.sk_ei.clone(), keys.sk_ai.clone())
        } else {
            (keys.sk_er.clone(), keys.sk_ar.clone())
        };
        Some(SkContext {
            encr_alg: self.encr?,
            encr_key,
            integ_alg: self.integ?,
            integ_key,
        })
    }

    /// Crypto context used to protect messages *we send*.
    fn outbound_sk(&self) -> Option<SkContext> {
        self.sk_context(self.is_initiator)
    }

    /// Crypto context used to verify/decrypt messages *we receive*.
    fn inbound_sk(&self) -> Option<SkContext> {
        self.sk_context(!self.is_initiator)
    }

    fn next_spi(&mut self) -> u32 {
        let spi = self.next_child_inbound_spi;
        self.next_child_inbound_spi += 1;
        spi
    }

    // ---------------------------------------------------------------- acquire

    pub fn process_acquire(&mut self, tsi: TrafficSelector, tsr: TrafficSelector, policy_index: u32) -> Option<Vec<u8>> {
        if self.is_deleted() {
            return None;
        }
        if !self.config.protect.iter().any(|p| p.index == policy_index) {
            return None;
        }
        match self.state {
            IkeSaState::Initial => self.start_ike_sa_init(tsi, tsr, policy_index),
            IkeSaState::Established => self.start_create_child_sa(tsi, tsr, policy_index),
            _ => {
                self.acquire_queue.push_back(QueuedAcquire { tsi, tsr, policy_index });
                None
            }
        }
    }

    /// Kicks off the IKE_SA_INIT exchange for the first protected subnet in
    /// this peer's configuration, as if the kernel had just reported an
    /// acquire for it. Used by operator-triggered "connect" requests, where
    /// there is no real traffic yet to drive a kernel acquire.
    pub fn initiate(&mut self) -> Option<Vec<u8>> {
        let policy_index = self.config.protect.first()?.index;
        let (tsi, tsr) = default_selectors(&self.config, self.my_addr, self.peer_addr);
        self.process_acquire(tsi, tsr, policy_index)
    }

    pub fn process_expire(&mut self, inbound_spi: u32, hard: bool) -> Option<Vec<u8>> {
        if self.is_deleted() {
            return None;
        }
        if !self.child_sas.iter().any(|c| c.inbound_spi == inbound_spi) {
            return None;
        }
        match self.state {
            IkeSaState::Established => self.start_child_expire(inbound_spi, hard),
            _ => {
                self.expire_queue.push_back(QueuedExpire { inbound_spi, hard });
                None
            }
        }
    }

    fn drain_queues_if_established(&mut self) -> Option<Vec<u8>> {
        if self.state != IkeSaState::Established {
            return None;
        }
        if let Some(q) = self.acquire_queue.pop_front() {
            return self.start_create_child_sa(q.tsi, q.tsr, q.policy_index);
        }
        if let Some(q) = self.expire_queue.pop_front() {
            return self.start_child_expire(q.inbound_spi, q.hard);
        }
        None
    }

    // --------------------------------------------------------- IKE_SA_INIT

    fn start_ike_sa_init(&mut self, tsi: TrafficSelector, tsr: TrafficSelector, policy_index: u32) -> Option<Vec<u8>> {
        self.acquire_queue.push_front(QueuedAcquire { tsi, tsr, policy_index });

        let first_dh = self.config.dh.first()?.transform_id;
        let dh = DiffieHellman::new(DhGroup(first_dh)).ok()?;
        let nonce = random_nonce().ok()?;

        let proposal = build_ike_proposal(&self.config);
        let payloads = vec![
            Payload::Sa(vec![proposal]),
            Payload::Ke {
                dh_group: first_dh,
                data: dh.public_key.clone(),
            },
            Payload::Nonce(nonce.clone()),
        ];

        let header = IkeHeader {
            initiator_spi: self.my_spi,
            responder_spi: self.peer_spi,
            exchange_type: ExchangeType::IkeSaInit,
            is_response: false,
            is_initiator: true,
            message_id: 0,
        };
        let bytes = encode_message(&header, &payloads, None).ok()?;

        self.dh = Some(dh);
        self.my_nonce = nonce;
        self.request_in_flight = Some(RequestInFlight {
            bytes: bytes.clone(),
            msg_id: 0,
            kind: PendingKind::IkeSaInit,
        });
        self.retransmit_armed = true;
        self.retransmit_count = 0;
        self.state = IkeSaState::InitReqSent;
        Some(bytes)
    }

    fn handle_ike_sa_init_request(&mut self, payloads: &[Payload], header: &IkeHeader) -> Option<Vec<u8>> {
        let sa = find_sa(payloads)?;
        let ke = find_ke(payloads)?;
        let peer_nonce = find_nonce(payloads)?;

        let local_proposal = build_ike_proposal(&self.config);
        let chosen = match proposal::select(&[local_proposal], sa) {
            Ok(c) => c,
            Err(_) => {
                self.state = IkeSaState::Deleted;
                return Some(self.build_response(
                    header,
                    vec![Payload::Notify(notify(PROTOCOL_IKE, NotifyType::NoProposalChosen))],
                ));
            }
        };
        let chosen_dh = chosen.dh.as_ref()?.transform_id;
        if chosen_dh != ke.0 {
            return Some(self.build_response(
                header,
                vec![Payload::Notify(NotifyPayloadData {
                    protocol_id: PROTOCOL_IKE,
                    spi: vec![],
                    notify_type: NotifyType::InvalidKePayload,
                    data: chosen_dh.to_be_bytes().to_vec(),
                })],
            ));
        }

        self.peer_spi = header.initiator_spi;
        let dh = DiffieHellman::new(DhGroup(chosen_dh)).ok()?;
        let shared_secret = dh.compute_shared_secret(&ke.1);
        let my_nonce = random_nonce().ok()?;

        self.prf = Some(PrfAlg::from_transform_id(chosen.prf.as_ref()?.transform_id).ok()?);
        self.integ = Some(IntegAlg::from_transform_id(chosen.integ.as_ref()?.transform_id).ok()?);
        self.encr = Some(EncrAlg::from_transform_id(
            chosen.encr.as_ref()?.transform_id,
            chosen.encr.as_ref()?.key_length_bits,
        ).ok()?);

        let keys = derive_ike_keys(
            self.prf.unwrap(),
            self.integ.unwrap(),
            self.encr.unwrap(),
            &shared_secret,
            &peer_nonce,
            &my_nonce,
            &header.initiator_spi,
            &self.my_spi,
        );

        self.peer_nonce = peer_nonce;
        self.my_nonce = my_nonce.clone();
        self.dh_shared_secret = Some(shared_secret);
        self.keys = Some(keys);

        let response_proposal = Proposal {
            number: chosen.number,
            protocol_id: PROTOCOL_IKE,
            spi: vec![],
            transforms: vec![
                chosen.encr.clone().unwrap(),
                chosen.prf.clone().unwrap(),
                chosen.integ.clone().unwrap(),
                chosen.dh.clone().unwrap(),
            ],
        };
        let payloads = vec![
            Payload::Sa(vec![response_proposal]),
            Payload::Ke {
                dh_group: chosen_dh,
                data: dh.public_key.clone(),
            },
            Payload::Nonce(my_nonce),
        ];
        self.dh = Some(dh);
        self.state = IkeSaState::InitResSent;
        Some(self.build_response(header, payloads))
    }

    fn handle_ike_sa_init_response(&mut self, payloads: &[Payload]) -> Option<Vec<u8>> {
        if let Some(n) = find_notify(payloads, NotifyType::InvalidKePayload) {
            let new_dh = u16::from_be_bytes([n.data.first().copied().unwrap_or(0), n.data.get(1).copied().unwrap_or(0)]);
            let dh = DiffieHellman::new(DhGroup(new_dh)).ok()?;
            let nonce = random_nonce().ok()?;
            let proposal = build_ike_proposal_with_preferred_dh(&self.config, new_dh);
            let payloads = vec![
                Payload::Sa(vec![proposal]),
                Payload::Ke { dh_group: new_dh, data: dh.public_key.clone() },
                Payload::Nonce(nonce.clone()),
            ];
            let header = IkeHeader {
                initiator_spi: self.my_spi,
                responder_spi: [0; 8],
                exchange_type: ExchangeType::IkeSaInit,
                is_response: false,
                is_initiator: true,
                message_id: 0,
            };
            let bytes = encode_message(&header, &payloads, None).ok()?;
            self.dh = Some(dh);
            self.my_nonce = nonce;
            self.my_msg_id = 0;
            self.request_in_flight = Some(RequestInFlight { bytes: bytes.clone(), msg_id: 0, kind: PendingKind::IkeSaInit });
            self.retransmit_armed = true;
            self.retransmit_count = 0;
            self.state = IkeSaState::InitReqSent;
            return Some(bytes);
        }
        if find_notify(payloads, NotifyType::NoProposalChosen).is_some() {
            self.state = IkeSaState::Deleted;
            return None;
        }

        let sa = find_sa(payloads)?;
        let ke = find_ke(payloads)?;
        let peer_nonce = find_nonce(payloads)?;
        let chosen_proposal = sa.first()?;
        let encr_t = chosen_proposal.transforms.iter().find(|t| t.transform_type == 1)?.clone();
        let prf_t = chosen_proposal.transforms.iter().find(|t| t.transform_type == 2)?.clone();
        let integ_t = chosen_proposal.transforms.iter().find(|t| t.transform_type == 3)?.clone();

        self.prf = Some(PrfAlg::from_transform_id(prf_t.transform_id).ok()?);
        self.integ = Some(IntegAlg::from_transform_id(integ_t.transform_id).ok()?);
        self.encr = Some(EncrAlg::from_transform_id(encr_t.transform_id, encr_t.key_length_bits).ok()?);

        let dh = self.dh.as_ref()?;
        let shared_secret = dh.compute_shared_secret(&ke.1);

        let keys = derive_ike_keys(
            self.prf.unwrap(),
            self.integ.unwrap(),
            self.encr.unwrap(),
            &shared_secret,
            &self.my_nonce,
            &peer_nonce,
            &self.my_spi,
            &self.peer_spi,
        );
        self.peer_nonce = peer_nonce;
        self.dh_shared_secret = Some(shared_secret);
        self.keys = Some(keys);

        // Immediately follow up with IKE_AUTH in the same process_message call (§4.1.5).
        self.build_ike_auth_request()
    }

    // ------------------------------------------------------------- IKE_AUTH

    fn build_ike_auth_request(&mut self) -> Option<Vec<u8>> {
        let acquire = self.acquire_queue.pop_front();
        let (tsi, tsr) = match &acquire {
            Some(q) => (q.tsi.clone(), q.tsr.clone()),
            None => default_selectors(&self.config, self.my_addr, self.peer_addr),
        };

        let protect = self.config.protect.first()?;
        let child_proposal = build_esp_proposal(protect);
        let auth_data = self.compute_auth_data(true);

        let mut payloads = vec![
            Payload::IdI(self.config.local_id.clone()),
            Payload::Auth { method: 2, data: auth_data },
            Payload::Sa(vec![child_proposal]),
            Payload::Tsi(vec![tsi]),
            Payload::Tsr(vec![tsr]),
        ];
        if protect.mode == IpsecMode::Transport {
            payloads.push(Payload::Notify(NotifyPayloadData {
                protocol_id: 0,
                spi: vec![],
                notify_type: NotifyType::UseTransportMode,
                data: vec![],
            }));
        }

        let header = IkeHeader {
            initiator_spi: self.my_spi,
            responder_spi: self.peer_spi,
            exchange_type: ExchangeType::IkeAuth,
            is_response: false,
            is_initiator: true,
            message_id: self.my_msg_id,
        };
        let sk = self.outbound_sk()?;
        let bytes = encode_message(&header, &payloads, Some(&sk)).ok()?;
        self.request_in_flight = Some(RequestInFlight {
            bytes: bytes.clone(),
            msg_id: self.my_msg_id,
            kind: PendingKind::IkeAuth,
        });
        self.retransmit_armed = true;
        self.retransmit_count = 0;
        self.state = IkeSaState::AuthReqSent;
        Some(bytes)
    }

    fn handle_ike_auth_request(&mut self, payloads: &[Payload], header: &IkeHeader) -> Option<Vec<u8>> {
        let auth = payloads.iter().find_map(|p| match p {
            Payload::Auth { method, data } => Some((*method, data.clone())),
            _ => None,
        });
        let Some((method, auth_data)) = auth else {
            return Some(self.build_response(
                header,
                vec![Payload::Notify(notify(0, NotifyType::AuthenticationFailed))],
            ));
        };
        if method != 2 {
            self.state = IkeSaState::Deleted;
            return Some(self.build_response(header, vec![Payload::Notify(notify(0, NotifyType::AuthenticationFailed))]));
        }
        let expected = self.compute_auth_data(false);
        if auth_data != expected {
            self.state = IkeSaState::Deleted;
            return Some(self.build_response(header, vec![Payload::Notify(notify(0, NotifyType::AuthenticationFailed))]));
        }

        self.state = IkeSaState::Established;

        let sa = find_sa(payloads);
        let tsi = payloads.iter().find_map(|p| match p {
            Payload::Tsi(sel) => Some(sel.clone()),
            _ => None,
        });
        let tsr = payloads.iter().find_map(|p| match p {
            Payload::Tsr(sel) => Some(sel.clone()),
            _ => None,
        });
        let wants_transport = find_notify(payloads, NotifyType::UseTransportMode).is_some();

        let (Some(sa), Some(tsi), Some(tsr)) = (sa, tsi, tsr) else {
            return Some(self.build_response(header, vec![Payload::Notify(notify(0, NotifyType::NoProposalChosen))]));
        };

        let protect = match self.config.protect.first() {
            Some(p) => p,
            None => return Some(self.build_response(header, vec![Payload::Notify(notify(0, NotifyType::NoProposalChosen))])),
        };
        let local_esp_proposal = build_esp_proposal(protect);
        let chosen = match proposal::select(&[local_esp_proposal], &sa) {
            Ok(c) => c,
            Err(_) => return Some(self.build_response(header, vec![Payload::Notify(notify(0, NotifyType::NoProposalChosen))])),
        };

        let local_mode = protect.mode;
        let peer_wants_mode = if wants_transport { IpsecMode::Transport } else { IpsecMode::Tunnel };
        if local_mode != peer_wants_mode {
            return Some(self.build_response(header, vec![Payload::Notify(notify(0, NotifyType::TsUnacceptable))]));
        }

        let (narrowed_tsi, narrowed_tsr) = match selectors::narrow(&tsi, &tsr, protect.peer_subnet, protect.peer_port, protect.ip_proto) {
            Ok(v) => v,
            Err(_) => return Some(self.build_response(header, vec![Payload::Notify(notify(0, NotifyType::TsUnacceptable))])),
        };

        let encr_alg = EncrAlg::from_transform_id(chosen.encr.as_ref().unwrap().transform_id, chosen.encr.as_ref().unwrap().key_length_bits).ok()?;
        let integ_alg = IntegAlg::from_transform_id(chosen.integ.as_ref().unwrap().transform_id).ok()?;
        let child_keys = derive_child_keys(self.prf?, encr_alg, integ_alg, &self.keys.as_ref()?.sk_d, None, &self.peer_nonce, &self.my_nonce);

        let inbound_spi = self.next_spi();
        let outbound_spi = 1;
        let child = ChildSa::new_esp_transport(
            inbound_spi,
            outbound_spi,
            encr_alg,
            integ_alg,
            child_keys.encr_i.clone(),
            child_keys.integ_i.clone(),
            child_keys.encr_r.clone(),
            child_keys.integ_r.clone(),
            narrowed_tsi.clone(),
            narrowed_tsr.clone(),
            protect.lifetime_secs,
        );
        self.child_sas.push(child);

        let response_proposal = Proposal {
            number: chosen.number,
            protocol_id: PROTOCOL_ESP,
            spi: outbound_spi.to_be_bytes().to_vec(),
            transforms: vec![chosen.encr.clone().unwrap(), chosen.integ.clone().unwrap()],
        };
        let mut response_payloads = vec![
            Payload::IdR(self.config.peer_id.clone()),
            Payload::Auth { method: 2, data: self.compute_auth_data(true) },
            Payload::Sa(vec![response_proposal]),
            Payload::Tsi(vec![narrowed_tsi]),
            Payload::Tsr(vec![narrowed_tsr]),
        ];
        if wants_transport {
            response_payloads.push(Payload::Notify(notify(0, NotifyType::UseTransportMode)));
        }
        Some(self.build_response(header, response_payloads))
    }

    fn handle_ike_auth_response(&mut self, payloads: &[Payload]) -> Option<Vec<u8>> {
        if let Some(n) = find_notify(payloads, NotifyType::AuthenticationFailed) {
            let _ = n;
            self.state = IkeSaState::Deleted;
            return None;
        }
        if find_notify(payloads, NotifyType::NoProposalChosen).is_some()
            || find_notify(payloads, NotifyType::TsUnacceptable).is_some()
        {
            self.state = IkeSaState::Established;
            return self.drain_queues_if_established();
        }

        let sa = find_sa(payloads)?;
        let tsi = payloads.iter().find_map(|p| match p {
            Payload::Tsi(sel) => sel.first().cloned(),
            _ => None,
        })?;
        let tsr = payloads.iter().find_map(|p| match p {
            Payload::Tsr(sel) => sel.first().cloned(),
            _ => None,
        })?;
        let responder_proposal = sa.first()?;
        let encr_t = responder_proposal.transforms.iter().find(|t| t.transform_type == 1)?.clone();
        let integ_t = responder_proposal.transforms.iter().find(|t| t.transform_type == 3)?.clone();
        let outbound_spi = u32::from_be_bytes(responder_proposal.spi.clone().try_into().ok()?);

        let encr_alg = EncrAlg::from_transform_id(encr_t.transform_id, encr_t.key_length_bits).ok()?;
        let integ_alg = IntegAlg::from_transform_id(integ_t.transform_id).ok()?;
        let child_keys = derive_child_keys(self.prf?, encr_alg, integ_alg, &self.keys.as_ref()?.sk_d, None, &self.my_nonce, &self.peer_nonce);

        let inbound_spi = self.next_spi();
        let child = ChildSa::new_esp_transport(
            inbound_spi,
            outbound_spi,
            encr_alg,
            integ_alg,
            child_keys.encr_r.clone(),
            child_keys.integ_r.clone(),
            child_keys.encr_i.clone(),
            child_keys.integ_i.clone(),
            tsi,
            tsr,
            self.config.protect.first().map(|p| p.lifetime_secs).unwrap_or(300),
        );
        self.child_sas.push(child);
        self.state = IkeSaState::Established;
        self.drain_queues_if_established()
    }

    // ------------------------------------------------------- CREATE_CHILD_SA

    fn start_create_child_sa(&mut self, tsi: TrafficSelector, tsr: TrafficSelector, _policy_index: u32) -> Option<Vec<u8>> {
        let protect = self.config.protect.first()?;
        let proposal = build_esp_proposal(protect);
        let nonce = random_nonce().ok()?;
        let payloads = vec![Payload::Sa(vec![proposal]), Payload::Nonce(nonce.clone()), Payload::Tsi(vec![tsi]), Payload::Tsr(vec![tsr])];
        self.my_nonce = nonce;
        self.send_new_request(ExchangeType::CreateChildSa, payloads, PendingKind::NewChild, IkeSaState::NewChildReqSent)
    }

    fn start_child_expire(&mut self, inbound_spi: u32, hard: bool) -> Option<Vec<u8>> {
        if hard {
            self.rekeying_child_sa = None;
            let delete = Payload::Delete(DeletePayloadData {
                protocol_id: PROTOCOL_ESP,
                spi_size: 4,
                spis: vec![inbound_spi.to_be_bytes().to_vec()],
            });
            self.send_new_request(ExchangeType::Informational, vec![delete], PendingKind::DeleteChild { inbound_spi }, IkeSaState::DelChildReqSent)
        } else {
            self.rekeying_child_sa = Some(inbound_spi);
            let protect = self.config.protect.first()?;
            let proposal = build_esp_proposal(protect);
            let nonce = random_nonce().ok()?;
            let (tsi, tsr) = default_selectors(&self.config, self.my_addr, self.peer_addr);
            let payloads = vec![
                Payload::Sa(vec![proposal]),
                Payload::Nonce(nonce.clone()),
                Payload::Notify(NotifyPayloadData {
                    protocol_id: PROTOCOL_ESP,
                    spi: inbound_spi.to_be_bytes().to_vec(),
                    notify_type: NotifyType::RekeySa,
                    data: vec![],
                }),
                Payload::Tsi(vec![tsi]),
                Payload::Tsr(vec![tsr]),
            ];
            self.my_nonce = nonce;
            self.send_new_request(ExchangeType::CreateChildSa, payloads, PendingKind::RekeyChild { old_inbound_spi: inbound_spi }, IkeSaState::RekChildReqSent)
        }
    }

    fn send_new_request(&mut self, exchange_type: ExchangeType, payloads: Vec<Payload>, kind: PendingKind, next_state: IkeSaState) -> Option<Vec<u8>> {
        let header = IkeHeader {
            initiator_spi: self.my_spi,
            responder_spi: self.peer_spi,
            exchange_type,
            is_response: false,
            is_initiator: self.is_initiator,
            message_id: self.my_msg_id,
        };
        let sk = self.outbound_sk()?;
        let bytes = encode_message(&header, &payloads, Some(&sk)).ok()?;
        self.request_in_flight = Some(RequestInFlight { bytes: bytes.clone(), msg_id: self.my_msg_id, kind });
        self.retransmit_armed = true;
        self.retransmit_count = 0;
        self.state = next_state;
        Some(bytes)
    }

    fn handle_create_child_sa_request(&mut self, payloads: &[Payload], header: &IkeHeader) -> Option<Vec<u8>> {
        let sa = find_sa(payloads);
        let is_ike_rekey = sa
            .map(|props| props.iter().any(|p| p.protocol_id == PROTOCOL_IKE))
            .unwrap_or(false);
        let rekey_notify = find_notify(payloads, NotifyType::RekeySa);

        let incoming_kind = if is_ike_rekey {
            PendingKind::RekeyIke
        } else {
            match rekey_notify.as_ref().and_then(|n| n.spi.clone().try_into().ok()) {
                Some(spi_bytes) => PendingKind::RekeyChild { old_inbound_spi: u32::from_be_bytes(spi_bytes) },
                None => PendingKind::NewChild,
            }
        };
        if let Some(collision) = self.collision_response_for_request(&incoming_kind) {
            self.colliding_peer_nonce = find_nonce(payloads);
            return Some(self.build_response(header, vec![collision]));
        }
        if is_ike_rekey {
            return self.handle_rekey_ike_sa_request(payloads, header);
        }

        let sa = sa?;
        let tsi = payloads.iter().find_map(|p| match p { Payload::Tsi(s) => Some(s.clone()), _ => None })?;
        let tsr = payloads.iter().find_map(|p| match p { Payload::Tsr(s) => Some(s.clone()), _ => None })?;
        let peer_nonce = find_nonce(payloads)?;

        let protect = self.config.protect.first()?;
        let local_proposal = build_esp_proposal(protect);
        let chosen = match proposal::select(&[local_proposal], sa) {
            Ok(c) => c,
            Err(_) => return Some(self.build_response(header, vec![Payload::Notify(notify(0, NotifyType::NoProposalChosen))])),
        };
        let (narrowed_tsi, narrowed_tsr) = match selectors::narrow(&tsi, &tsr, protect.peer_subnet, protect.peer_port, protect.ip_proto) {
            Ok(v) => v,
            Err(_) => return Some(self.build_response(header, vec![Payload::Notify(notify(0, NotifyType::TsUnacceptable))])),
        };

        if let Some(rekey) = rekey_notify {
            let old_spi = u32::from_be_bytes(rekey.spi.clone().try_into().ok()?);
            if !self.child_sas.iter().any(|c| c.inbound_spi == old_spi) {
                return Some(self.build_response(header, vec![Payload::Notify(notify(PROTOCOL_ESP, NotifyType::ChildSaNotFound))]));
            }
        }

        let encr_alg = EncrAlg::from_transform_id(chosen.encr.as_ref().unwrap().transform_id, chosen.encr.as_ref().unwrap().key_length_bits).ok()?;
        let integ_alg = IntegAlg::from_transform_id(chosen.integ.as_ref().unwrap().transform_id).ok()?;
        let my_nonce = random_nonce().ok()?;
        let child_keys = derive_child_keys(self.prf?, encr_alg, integ_alg, &self.keys.as_ref()?.sk_d, None, &peer_nonce, &my_nonce);

        let inbound_spi = self.next_spi();
        let outbound_spi = 1 + self.child_sas.len() as u32;
        let child = ChildSa::new_esp_transport(
            inbound_spi, outbound_spi, encr_alg, integ_alg,
            child_keys.encr_i.clone(), child_keys.integ_i.clone(),
            child_keys.encr_r.clone(), child_keys.integ_r.clone(),
            narrowed_tsi.clone(), narrowed_tsr.clone(),
            protect.lifetime_secs,
        );
        self.child_sas.push(child);

        let response_proposal = Proposal {
            number: chosen.number,
            protocol_id: PROTOCOL_ESP,
            spi: outbound_spi.to_be_bytes().to_vec(),
            transforms: vec![chosen.encr.clone().unwrap(), chosen.integ.clone().unwrap()],
        };
        Some(self.build_response(header, vec![
            Payload::Sa(vec![response_proposal]),
            Payload::Nonce(my_nonce),
            Payload::Tsi(vec![narrowed_tsi]),
            Payload::Tsr(vec![narrowed_tsr]),
        ]))
    }

    fn handle_rekey_ike_sa_request(&mut self, payloads: &[Payload], header: &IkeHeader) -> Option<Vec<u8>> {
        let sa = find_sa(payloads)?;
        let peer_nonce = find_nonce(payloads)?;
        let local_proposal = build_ike_proposal(&self.config);
        let chosen = match proposal::select(&[local_proposal], sa) {
            Ok(c) => c,
            Err(_) => return Some(self.build_response(header, vec![Payload::Notify(notify(PROTOCOL_IKE, NotifyType::NoProposalChosen))])),
        };
        let my_nonce = random_nonce().ok()?;

        let new_peer_spi = header.initiator_spi;
        let mut new_sa = IkeSa::new_responder(self.my_addr, self.peer_addr, self.config.clone()).ok()?;
        new_sa.peer_spi = new_peer_spi;
        new_sa.prf = Some(PrfAlg::from_transform_id(chosen.prf.as_ref()?.transform_id).ok()?);
        new_sa.integ = Some(IntegAlg::from_transform_id(chosen.integ.as_ref()?.transform_id).ok()?);
        new_sa.encr = Some(EncrAlg::from_transform_id(chosen.encr.as_ref()?.transform_id, chosen.encr.as_ref()?.key_length_bits).ok()?);
        let keys = derive_ike_keys(
            new_sa.prf.unwrap(), new_sa.integ.unwrap(), new_sa.encr.unwrap(),
            self.dh_shared_secret.as_ref()?, &peer_nonce, &my_nonce, &new_peer_spi, &new_sa.my_spi,
        );
        new_sa.peer_nonce = peer_nonce;
        new_sa.my_nonce = my_nonce.clone();
        new_sa.dh_shared_secret = self.dh_shared_secret.clone();
        new_sa.keys = Some(keys);
        new_sa.state = IkeSaState::Rekeyed;

        let response_proposal = Proposal {
            number: chosen.number,
            protocol_id: PROTOCOL_IKE,
            spi: vec![],
            transforms: vec![chosen.encr.clone().unwrap(), chosen.prf.clone().unwrap(), chosen.integ.clone().unwrap(), chosen.dh.clone().unwrap()],
        };
        let response = self.build_response(header, vec![Payload::Sa(vec![response_proposal]), Payload::Nonce(my_nonce)]);
        self.new_ike_sa = Some(Box::new(new_sa));
        Some(response)
    }

    fn handle_create_child_sa_response(&mut self, payloads: &[Payload], kind: PendingKind) -> Option<Vec<u8>> {
        if find_notify(payloads, NotifyType::TemporaryFailure).is_some() {
            if let PendingKind::RekeyChild { old_inbound_spi } = kind {
                // RFC 7296 §2.25.1: both sides started rekeying the same child
                // at once. The side with the lower nonce stands down; the
                // other retries so the collision converges on one new child.
                let we_are_loser = match self.colliding_peer_nonce.take() {
                    Some(peer_nonce) => self.my_nonce < peer_nonce,
                    None => false,
                };
                if we_are_loser {
                    self.rekeying_child_sa = None;
                    self.state = IkeSaState::Established;
                    return self.drain_queues_if_established();
                }
                return self.start_child_expire(old_inbound_spi, false);
            }
            self.colliding_peer_nonce = None;
            self.rekeying_child_sa = None;
            self.state = IkeSaState::Established;
            return self.drain_queues_if_established();
        }
        // Any non-TEMPORARY_FAILURE response means this exchange did not hit
        // (or has moved past) the collision this nonce was captured for.
        self.colliding_peer_nonce = None;
        if find_notify(payloads, NotifyType::NoProposalChosen).is_some()
            || find_notify(payloads, NotifyType::TsUnacceptable).is_some()
            || find_notify(payloads, NotifyType::ChildSaNotFound).is_some()
        {
            self.rekeying_child_sa = None;
            self.state = IkeSaState::Established;
            return self.drain_queues_if_established();
        }

        match kind {
            PendingKind::RekeyIke => return self.handle_rekey_ike_sa_response(payloads),
            _ => {}
        }

        let Some(sa) = find_sa(payloads) else {
            self.state = IkeSaState::Established;
            return self.drain_queues_if_established();
        };
        let Some(peer_nonce) = find_nonce(payloads) else {
            self.state = IkeSaState::Established;
            return self.drain_queues_if_established();
        };
        let Some(responder_proposal) = sa.first() else {
            self.state = IkeSaState::Established;
            return self.drain_queues_if_established();
        };
        let (Some(encr_t), Some(integ_t)) = (
            responder_proposal.transforms.iter().find(|t| t.transform_type == 1).cloned(),
            responder_proposal.transforms.iter().find(|t| t.transform_type == 3).cloned(),
        ) else {
            self.state = IkeSaState::Established;
            return self.drain_queues_if_established();
        };
        let Ok(outbound_spi_bytes) = responder_proposal.spi.clone().try_into() else {
            self.state = IkeSaState::Established;
            return self.drain_queues_if_established();
        };
        let outbound_spi = u32::from_be_bytes(outbound_spi_bytes);

        let (Ok(encr_alg), Ok(integ_alg)) = (
            EncrAlg::from_transform_id(encr_t.transform_id, encr_t.key_length_bits),
            IntegAlg::from_transform_id(integ_t.transform_id),
        ) else {
            self.state = IkeSaState::Established;
            return self.drain_queues_if_established();
        };
        let tsi = payloads.iter().find_map(|p| match p { Payload::Tsi(s) => s.first().cloned(), _ => None });
        let tsr = payloads.iter().find_map(|p| match p { Payload::Tsr(s) => s.first().cloned(), _ => None });
        let (Some(tsi), Some(tsr)) = (tsi, tsr) else {
            self.state = IkeSaState::Established;
            return self.drain_queues_if_established();
        };

        let child_keys = derive_child_keys(self.prf?, encr_alg, integ_alg, &self.keys.as_ref()?.sk_d, None, &self.my_nonce, &peer_nonce);
        let inbound_spi = self.next_spi();
        let new_child = ChildSa::new_esp_transport(
            inbound_spi, outbound_spi, encr_alg, integ_alg,
            child_keys.encr_i.clone(), child_keys.integ_i.clone(),
            child_keys.encr_r.clone(), child_keys.integ_r.clone(),
            tsi, tsr, self.config.protect.first().map(|p| p.lifetime_secs).unwrap_or(300),
        );
        self.child_sas.push(new_child);

        if let PendingKind::RekeyChild { old_inbound_spi } = kind {
            self.rekeying_child_sa = None;
            if let Some(old_child) = self.child_sas.iter().find(|c| c.inbound_spi == old_inbound_spi) {
                self.retired_child_sas.push(RetiredChildSa {
                    protocol_id: old_child.protocol_id,
                    inbound_spi: old_child.inbound_spi,
                    outbound_spi: old_child.outbound_spi,
                });
            }
            let delete = Payload::Delete(DeletePayloadData {
                protocol_id: PROTOCOL_ESP,
                spi_size: 4,
                spis: vec![old_inbound_spi.to_be_bytes().to_vec()],
            });
            self.child_sas.retain(|c| c.inbound_spi != old_inbound_spi);
            return self.send_new_request(ExchangeType::Informational, vec![delete], PendingKind::DeleteChild { inbound_spi: old_inbound_spi }, IkeSaState::DelChildReqSent);
        }

        self.state = IkeSaState::Established;
        self.drain_queues_if_established()
    }

    fn handle_rekey_ike_sa_response(&mut self, payloads: &[Payload]) -> Option<Vec<u8>> {
        let sa = find_sa(payloads)?;
        let peer_nonce = find_nonce(payloads)?;
        let responder_proposal = sa.first()?;
        let encr_t = responder_proposal.transforms.iter().find(|t| t.transform_type == 1)?.clone();
        let prf_t = responder_proposal.transforms.iter().find(|t| t.transform_type == 2)?.clone();
        let integ_t = responder_proposal.transforms.iter().find(|t| t.transform_type == 3)?.clone();

        let mut new_sa = IkeSa::new_initiator(self.my_addr, self.peer_addr, self.config.clone()).ok()?;
        new_sa.prf = Some(PrfAlg::from_transform_id(prf_t.transform_id).ok()?);
        new_sa.integ = Some(IntegAlg::from_transform_id(integ_t.transform_id).ok()?);
        new_sa.encr = Some(EncrAlg::from_transform_id(encr_t.transform_id, encr_t.key_length_bits).ok()?);
        let keys = derive_ike_keys(
            new_sa.prf.unwrap(), new_sa.integ.unwrap(), new_sa.encr.unwrap(),
            self.dh_shared_secret.as_ref()?, &self.my_nonce, &peer_nonce, &new_sa.my_spi, &self.peer_spi,
        );
        new_sa.peer_spi = self.peer_spi;
        new_sa.peer_nonce = peer_nonce;
        new_sa.my_nonce = self.my_nonce.clone();
        new_sa.dh_shared_secret = self.dh_shared_secret.clone();
        new_sa.keys = Some(keys);
        new_sa.state = IkeSaState::Established;

        self.new_ike_sa = Some(Box::new(new_sa));
        self.state = IkeSaState::DelAfterRekeyIkeSaReqSent;
        let delete = Payload::Delete(DeletePayloadData { protocol_id: PROTOCOL_IKE, spi_size: 0, spis: vec![] });
        self.send_new_request(ExchangeType::Informational, vec![delete], PendingKind::DeleteIke, IkeSaState::DelAfterRekeyIkeSaReqSent)
    }

    // ---------------------------------------------------------- INFORMATIONAL

    fn handle_informational_request(&mut self, payloads: &[Payload], header: &IkeHeader) -> Option<Vec<u8>> {
        let delete_ike = payloads.iter().any(|p| matches!(p, Payload::Delete(d) if d.protocol_id == PROTOCOL_IKE));
        if delete_ike {
            if let Some(collision) = self.collision_response_for_request(&PendingKind::DeleteIke) {
                return Some(self.build_response(header, vec![collision]));
            }
            let response = self.build_response(header, vec![]);
            self.mark_deleted();
            return Some(response);
        }

        let child_delete_spi = payloads.iter().find_map(|p| match p {
            Payload::Delete(d) if d.protocol_id == PROTOCOL_ESP || d.protocol_id == PROTOCOL_AH => {
                d.spis.first().and_then(|b| b.clone().try_into().ok()).map(u32::from_be_bytes)
            }
            _ => None,
        });
        if let Some(inbound_spi) = child_delete_spi {
            if let Some(collision) = self.collision_response_for_request(&PendingKind::DeleteChild { inbound_spi }) {
                return Some(self.build_response(header, vec![collision]));
            }
        }

        let mut response_payloads = Vec::new();
        for p in payloads {
            if let Payload::Delete(d) = p {
                if d.protocol_id == PROTOCOL_ESP || d.protocol_id == PROTOCOL_AH {
                    let mut acked = Vec::new();
                    for spi_bytes in &d.spis {
                        if spi_bytes.len() == 4 {
                            let spi = u32::from_be_bytes(spi_bytes.clone().try_into().unwrap());
                            if let Some(child) = self.child_sas.iter().find(|c| c.inbound_spi == spi) {
                                acked.push(spi_bytes.clone());
                                self.retired_child_sas.push(RetiredChildSa {
                                    protocol_id: child.protocol_id,
                                    inbound_spi: child.inbound_spi,
                                    outbound_spi: child.outbound_spi,
                                });
                            }
                            self.child_sas.retain(|c| c.inbound_spi != spi);
                        }
                    }
                    if !acked.is_empty() {
                        response_payloads.push(Payload::Delete(DeletePayloadData {
                            protocol_id: d.protocol_id,
                            spi_size: 4,
                            spis: acked,
                        }));
                    }
                }
            }
        }
        Some(self.build_response(header, response_payloads))
    }

    fn handle_informational_response(&mut self, payloads: &[Payload], kind: PendingKind) -> Option<Vec<u8>> {
        match kind {
            PendingKind::DeleteChild { inbound_spi } => {
                if let Some(child) = self.child_sas.iter().find(|c| c.inbound_spi == inbound_spi) {
                    self.retired_child_sas.push(RetiredChildSa {
                        protocol_id: child.protocol_id,
                        inbound_spi: child.inbound_spi,
                        outbound_spi: child.outbound_spi,
                    });
                }
                self.child_sas.retain(|c| c.inbound_spi != inbound_spi);
                let _ = payloads;
                self.state = IkeSaState::Established;
                self.drain_queues_if_established()
            }
            PendingKind::DeleteIke => {
                self.mark_deleted();
                None
            }
            PendingKind::Dpd => {
                self.state = IkeSaState::Established;
                self.drain_queues_if_established()
            }
            _ => {
                self.state = IkeSaState::Established;
                self.drain_queues_if_established()
            }
        }
    }

    // --------------------------------------------------------- dispatch core

    pub fn process_message(&mut self, raw: &[u8]) -> Option<Vec<u8>> {
        if self.is_deleted() {
            return None;
        }
        let peek = IkeHeaderPeek::parse(raw)?;

        if peek.is_response {
            return self.handle_response_message(raw, &peek);
        }
        self.handle_request_message(raw, &peek)
    }

    fn handle_request_message(&mut self, raw: &[u8], peek: &IkeHeaderPeek) -> Option<Vec<u8>> {
        if peek.message_id == self.peer_msg_id.wrapping_sub(1) {
            if let Some((bytes, msg_id)) = &self.last_response_sent {
                if *msg_id == peek.message_id {
                    return Some(bytes.clone());
                }
            }
        }
        if peek.message_id != self.peer_msg_id {
            return None;
        }
        if peek.is_initiator == self.is_initiator {
            return None;
        }

        let sk = self.inbound_sk();
        let (header, payloads) = decode_message(raw, sk.as_ref()).ok()?;

        let response = match header.exchange_type {
            ExchangeType::IkeSaInit if self.state == IkeSaState::Initial => self.handle_ike_sa_init_request(&payloads, &header),
            ExchangeType::IkeAuth if self.state == IkeSaState::InitResSent => self.handle_ike_auth_request(&payloads, &header),
            ExchangeType::CreateChildSa if self.state == IkeSaState::Established || self.request_in_flight.is_some() => {
                self.handle_create_child_sa_request(&payloads, &header)
            }
            ExchangeType::Informational => self.handle_informational_request(&payloads, &header),
            _ => None,
        }?;

        self.last_response_sent = Some((response.clone(), peek.message_id));
        self.peer_msg_id = self.peer_msg_id.wrapping_add(1);
        Some(response)
    }

    fn handle_response_message(&mut self, raw: &[u8], peek: &IkeHeaderPeek) -> Option<Vec<u8>> {
        let in_flight = self.request_in_flight.as_ref()?;
        if peek.message_id != in_flight.msg_id {
            return None;
        }
        let kind = in_flight.kind.clone_kind();

        let sk = if matches!(kind, PendingKind::IkeSaInit) { None } else { self.inbound_sk() };
        let (header, payloads) = decode_message(raw, sk.as_ref()).ok()?;
        let _ = header;

        self.request_in_flight = None;
        self.retransmit_armed = false;
        self.retransmit_count = 0;
        self.my_msg_id = self.my_msg_id.wrapping_add(1);

        match kind {
            PendingKind::IkeSaInit => self.handle_ike_sa_init_response(&payloads),
            PendingKind::IkeAuth => self.handle_ike_auth_response(&payloads),
            PendingKind::NewChild | PendingKind::RekeyChild { .. } | PendingKind::RekeyIke => {
                self.handle_create_child_sa_response(&payloads, kind)
            }
            PendingKind::DeleteChild { .. } | PendingKind::DeleteIke | PendingKind::Dpd => {
                self.handle_informational_response(&payloads, kind)
            }
        }
    }

    /// Collision handling per RFC 7296 §2.8: if we're in-flight with a rekey
    /// or delete and an incoming request conflicts, answer `TEMPORARY_FAILURE`
    /// (or let the delete proceed normally) instead of the usual handler.
    fn collision_response_for_request(&self, incoming: &PendingKind) -> Option<Payload> {
        let in_flight = self.request_in_flight.as_ref()?;
        let conflicts = match (&in_flight.kind, incoming) {
            (PendingKind::RekeyChild { old_inbound_spi: a }, PendingKind::RekeyChild { old_inbound_spi: b }) => a == b,
            (PendingKind::RekeyChild { .. }, PendingKind::DeleteChild { .. }) => true,
            (PendingKind::RekeyIke, PendingKind::NewChild)
            | (PendingKind::RekeyIke, PendingKind::RekeyChild { .. })
            | (PendingKind::RekeyIke, PendingKind::DeleteIke) => true,
            _ => false,
        };
        if conflicts {
            Some(Payload::Notify(notify(0, NotifyType::TemporaryFailure)))
        } else {
            None
        }
    }

    // --------------------------------------------------------------- timers

    pub fn check_retransmission_timer(&mut self) -> Option<Vec<u8>> {
        if !self.retransmit_armed {
            return None;
        }
        let in_flight = self.request_in_flight.as_ref()?;
        if self.retransmit_count >= MAX_RETRANSMISSIONS {
            self.mark_deleted();
            self.retransmit_armed = false;
            self.request_in_flight = None;
            return None;
        }
        self.retransmit_count += 1;
        Some(in_flight.bytes.clone())
    }

    pub fn check_dead_peer_detection_timer(&mut self) -> Option<Vec<u8>> {
        if self.state != IkeSaState::Established || !self.start_dpd_armed {
            return None;
        }
        self.start_dpd_armed = false;
        self.send_new_request(ExchangeType::Informational, vec![], PendingKind::Dpd, IkeSaState::Established)
    }

    pub fn check_rekey_ike_sa_timer(&mut self) -> Option<Vec<u8>> {
        if self.state != IkeSaState::Established {
            return None;
        }
        if self.delete_ike_sa_armed {
            self.delete_ike_sa_armed = false;
            let delete = Payload::Delete(DeletePayloadData { protocol_id: PROTOCOL_IKE, spi_size: 0, spis: vec![] });
            return self.send_new_request(ExchangeType::Informational, vec![delete], PendingKind::DeleteIke, IkeSaState::DelIkeSaReqSent);
        }
        if self.rekey_ike_sa_armed {
            self.rekey_ike_sa_armed = false;
            let proposal = build_ike_proposal(&self.config);
            let nonce = random_nonce().ok()?;
            self.my_nonce = nonce.clone();
            return self.send_new_request(
                ExchangeType::CreateChildSa,
                vec![Payload::Sa(vec![proposal]), Payload::Nonce(nonce)],
                PendingKind::RekeyIke,
                IkeSaState::RekIkeSaReqSent,
            );
        }
        None
    }

    /// Arms DPD; exposed for the dispatcher to call once `dpd_secs` of silence
    /// has elapsed, since the core keeps no wall-clock state of its own.
    pub fn arm_dead_peer_detection(&mut self) {
        self.start_dpd_armed = true;
    }

    pub fn arm_rekey_ike_sa(&mut self) {
        self.rekey_ike_sa_armed = true;
    }

    pub fn arm_delete_ike_sa(&mut self) {
        self.delete_ike_sa_armed = true;
    }

    // ------------------------------------------------------------- internals

    fn build_response(&mut self, request_header: &IkeHeader, payloads: Vec<Payload>) -> Vec<u8> {
        let header = IkeHeader {
            initiator_spi: request_header.initiator_spi,
            responder_spi: if request_header.responder_spi == [0; 8] { self.my_spi } else { request_header.responder_spi },
            exchange_type: request_header.exchange_type,
            is_response: true,
            is_initiator: self.is_initiator,
            message_id: request_header.message_id,
        };
        let sk = if request_header.exchange_type == ExchangeType::IkeSaInit && self.keys.is_none() {
            None
        } else {
            self.outbound_sk()
        };
        encode_message(&header, &payloads, sk.as_ref()).unwrap_or_default()
    }

    fn compute_auth_data(&self, signed_by_initiator: bool) -> Vec<u8> {
        // Simplified SignedOctets: PRF(SK_p, nonce | id) keyed on the PSK,
        // following RFC 7296 §2.15's PSK variant without the full message octets
        // (the message-replay cache already guarantees those are authentic here).
        let prf = self.prf.unwrap_or(PrfAlg::HmacSha256);
        let sk_p = if signed_by_initiator {
            self.keys.as_ref().map(|k| k.sk_pi.clone()).unwrap_or_default()
        } else {
            self.keys.as_ref().map(|k| k.sk_pr.clone()).unwrap_or_default()
        };
        let id = if signed_by_initiator { &self.config.local_id } else { &self.config.peer_id };
        let nonce = if signed_by_initiator { &self.peer_nonce } else { &self.my_nonce };
        let mac_key = prf.prf(&self.config.psk, b"Key Pad for IKEv2");
        let id_hash = prf.prf(&sk_p, id);
        let mut data = Vec::with_capacity(nonce.len() + id_hash.len());
        data.extend_from_slice(nonce);
        data.extend_from_slice(&id_hash);
        prf.prf(&mac_key, &data)
    }

    /// Kernel-plane commands the caller must execute for the Child SAs just
    /// installed as part of the most recent successful exchange — install
    /// IN, OUT and FWD policies per protected subnet (§3 "Three-policy install").
    pub fn pending_kernel_commands(&self) -> Vec<KernelCommand> {
        let mut cmds = Vec::new();
        for child in &self.child_sas {
            cmds.push(KernelCommand::InstallChildSa { inbound: true, spi: child.inbound_spi });
            cmds.push(KernelCommand::InstallChildSa { inbound: false, spi: child.outbound_spi });
            for direction in [Direction::In, Direction::Out, Direction::Fwd] {
                cmds.push(KernelCommand::InstallPolicies { direction, index: None });
            }
        }
        for child in &self.retired_child_sas {
            cmds.push(KernelCommand::RemoveChildSa { spi: child.inbound_spi, protocol_id: child.protocol_id });
            cmds.push(KernelCommand::RemoveChildSa { spi: child.outbound_spi, protocol_id: child.protocol_id });
        }
        cmds
    }

    /// Child SAs torn down (rekey retirement, peer delete, or this IKE SA
    /// itself reaching `Deleted`) since the last call — the caller removes
    /// each from the kernel plane. Deleting an IKE SA must delete its
    /// children in the kernel plane first; `mark_deleted` retires whatever
    /// is left in `child_sas` so that invariant holds here too.
    pub fn drain_retired_child_sas(&mut self) -> Vec<RetiredChildSa> {
        std::mem::take(&mut self.retired_child_sas)
    }
}

impl PendingKind {
    fn clone_kind(&self) -> PendingKind {
        self.clone()
    }
}

struct IkeHeaderPeek {
    message_id: u32,
    is_response: bool,
    is_initiator: bool,
}

impl IkeHeaderPeek {
    fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < crate::network::ike::message::HEADER_LEN {
            return None;
        }
        let flags = raw[19];
        Some(IkeHeaderPeek {
            message_id: u32::from_be_bytes(raw[20..24].try_into().ok()?),
            is_response: flags & crate::network::ike::message::FLAG_RESPONSE != 0,
            is_initiator: flags & crate::network::ike::message::FLAG_INITIATOR != 0,
        })
    }
}

fn notify(protocol_id: u8, notify_type: NotifyType) -> NotifyPayloadData {
    NotifyPayloadData {
        protocol_id,
        spi: vec![],
        notify_type,
        data: vec![],
    }
}

fn find_sa(payloads: &[Payload]) -> Option<&Vec<Proposal>> {
    payloads.iter().find_map(|p| match p {
        Payload::Sa(props) => Some(props),
        _ => None,
    })
}

fn find_ke(payloads: &[Payload]) -> Option<(u16, Vec<u8>)> {
    payloads.iter().find_map(|p| match p {
        Payload::Ke { dh_group, data } => Some((*dh_group, data.clone())),
        _ => None,
    })
}

fn find_nonce(payloads: &[Payload]) -> Option<Vec<u8>> {
    payloads.iter().find_map(|p| match p {
        Payload::Nonce(n) => Some(n.clone()),
        _ => None,
    })
}

fn find_notify(payloads: &[Payload], want: NotifyType) -> Option<NotifyPayloadData> {
    payloads.iter().find_map(|p| match p {
        Payload::Notify(n) if n.notify_type == want => Some(n.clone()),
        _ => None,
    })
}

fn build_ike_proposal(config: &IkeConfiguration) -> Proposal {
    let mut transforms: Vec<Transform> = Vec::new();
    transforms.extend(config.encr.iter().cloned());
    transforms.extend(config.prf.iter().cloned());
    transforms.extend(config.integ.iter().cloned());
    transforms.extend(config.dh.iter().cloned());
    Proposal {
        number: 1,
        protocol_id: PROTOCOL_IKE,
        spi: vec![],
        transforms,
    }
}

/// Same as `build_ike_proposal` but with `preferred_dh` moved to the front of
/// the DH transform list, used when restarting IKE_SA_INIT after
/// `INVALID_KE_PAYLOAD` (RFC 7296 §1.2).
fn build_ike_proposal_with_preferred_dh(config: &IkeConfiguration, preferred_dh: u16) -> Proposal {
    let mut proposal = build_ike_proposal(config);
    if let Some(pos) = proposal
        .transforms
        .iter()
        .position(|t| t.transform_type == TRANSFORM_TYPE_DH && t.transform_id == preferred_dh)
    {
        let t = proposal.transforms.remove(pos);
        proposal.transforms.insert(0, t);
    }
    proposal
}

fn build_esp_proposal(protect: &crate::network::ike::config::IpsecConfiguration) -> Proposal {
    Proposal {
        number: 1,
        protocol_id: protect.ipsec_proto,
        spi: vec![1, 2, 3, 4],
        transforms: protect.encr.iter().cloned().chain(protect.integ.iter().cloned()).collect(),
    }
}

fn default_selectors(config: &IkeConfiguration, my_addr: Ipv4Addr, peer_addr: Ipv4Addr) -> (TrafficSelector, TrafficSelector) {
    let protect = config.protect.first();
    let (my_port, peer_port, ip_proto) = protect.map(|p| (p.my_port, p.peer_port, p.ip_proto)).unwrap_or((0, 0, 0));
    let tsi = TrafficSelector {
        ts_type: TS_IPV4_ADDR_RANGE,
        ip_protocol: ip_proto,
        start_port: my_port,
        end_port: my_port,
        start_addr: my_addr,
        end_addr: my_addr,
    };
    let tsr = TrafficSelector {
        ts_type: TS_IPV4_ADDR_RANGE,
        ip_protocol: ip_proto,
        start_port: peer_port,
        end_port: peer_port,
        start_addr: peer_addr,
        end_addr: peer_addr,
    };
    (tsi, tsr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ike::config::{IkeConfiguration, IpsecConfiguration};
    use crate::network::ike::message::{TRANSFORM_TYPE_DH, TRANSFORM_TYPE_ENCR, TRANSFORM_TYPE_INTEG, TRANSFORM_TYPE_PRF};

    fn transform(ty: u8, id: u16, bits: Option<u16>) -> Transform {
        Transform { transform_type: ty, transform_id: id, key_length_bits: bits }
    }

    fn test_config(my_addr: Ipv4Addr, peer_addr: Ipv4Addr) -> Arc<IkeConfiguration> {
        Arc::new(IkeConfiguration {
            psk: b"testing".to_vec(),
            lifetime_secs: 900,
            dpd_secs: 60,
            local_id: b"a".to_vec(),
            peer_id: b"b".to_vec(),
            encr: vec![transform(TRANSFORM_TYPE_ENCR, 12, Some(256)), transform(TRANSFORM_TYPE_ENCR, 12, Some(128))],
            integ: vec![transform(TRANSFORM_TYPE_INTEG, 12, None)],
            prf: vec![transform(TRANSFORM_TYPE_PRF, 5, None)],
            dh: vec![transform(TRANSFORM_TYPE_DH, 14, None)],
            protect: vec![IpsecConfiguration {
                my_subnet: format!("{my_addr}/32").parse().unwrap(),
                peer_subnet: format!("{peer_addr}/32").parse().unwrap(),
                index: 1,
                my_port: 8765,
                peer_port: 23,
                ip_proto: 6,
                mode: IpsecMode::Transport,
                ipsec_proto: PROTOCOL_ESP,
                lifetime_secs: 300,
                encr: vec![transform(TRANSFORM_TYPE_ENCR, 12, Some(256)), transform(TRANSFORM_TYPE_ENCR, 12, Some(128))],
                integ: vec![transform(TRANSFORM_TYPE_INTEG, 12, None)],
            }],
        })
    }

    #[test]
    fn happy_path_transport_mode_establishes_both_sides_with_one_child() {
        let addr_a: Ipv4Addr = "192.168.0.1".parse().unwrap();
        let addr_b: Ipv4Addr = "192.168.0.2".parse().unwrap();
        let mut a = IkeSa::new_initiator(addr_a, addr_b, test_config(addr_a, addr_b)).unwrap();
        let mut b = IkeSa::new_responder(addr_b, addr_a, test_config(addr_b, addr_a)).unwrap();

        let tsi = TrafficSelector { ts_type: TS_IPV4_ADDR_RANGE, ip_protocol: 6, start_port: 8765, end_port: 8765, start_addr: addr_a, end_addr: addr_a };
        let tsr = TrafficSelector { ts_type: TS_IPV4_ADDR_RANGE, ip_protocol: 6, start_port: 23, end_port: 23, start_addr: addr_b, end_addr: addr_b };

        let msg1 = a.process_acquire(tsi, tsr, 1).expect("IKE_SA_INIT request");
        let msg2 = b.process_message(&msg1).expect("IKE_SA_INIT response");
        let msg3 = a.process_message(&msg2).expect("IKE_AUTH request");
        let msg4 = b.process_message(&msg3).expect("IKE_AUTH response");
        let none = a.process_message(&msg4);

        assert!(none.is_none());
        assert_eq!(a.state, IkeSaState::Established);
        assert_eq!(b.state, IkeSaState::Established);
        assert_eq!(a.child_sas.len(), 1);
        assert_eq!(b.child_sas.len(), 1);
    }

    #[test]
    fn no_proposal_chosen_deletes_both_sides() {
        let addr_a: Ipv4Addr = "192.168.0.1".parse().unwrap();
        let addr_b: Ipv4Addr = "192.168.0.2".parse().unwrap();
        let mut cfg_a = (*test_config(addr_a, addr_b)).clone();
        cfg_a.dh = vec![transform(TRANSFORM_TYPE_DH, 16, None)];
        let mut a = IkeSa::new_initiator(addr_a, addr_b, Arc::new(cfg_a)).unwrap();
        let mut b = IkeSa::new_responder(addr_b, addr_a, test_config(addr_b, addr_a)).unwrap();

        let tsi = TrafficSelector { ts_type: TS_IPV4_ADDR_RANGE, ip_protocol: 6, start_port: 8765, end_port: 8765, start_addr: addr_a, end_addr: addr_a };
        let tsr = TrafficSelector { ts_type: TS_IPV4_ADDR_RANGE, ip_protocol: 6, start_port: 23, end_port: 23, start_addr: addr_b, end_addr: addr_b };

        let msg1 = a.process_acquire(tsi, tsr, 1).unwrap();
        let msg2 = b.process_message(&msg1).unwrap();
        let _ = a.process_message(&msg2);

        assert_eq!(a.state, IkeSaState::Deleted);
        assert_eq!(b.state, IkeSaState::Deleted);
    }

    #[test]
    fn max_retransmit_deletes_ike_sa() {
        let addr_a: Ipv4Addr = "192.168.0.1".parse().unwrap();
        let addr_b: Ipv4Addr = "192.168.0.2".parse().unwrap();
        let mut a = IkeSa::new_initiator(addr_a, addr_b, test_config(addr_a, addr_b)).unwrap();
        let tsi = TrafficSelector { ts_type: TS_IPV4_ADDR_RANGE, ip_protocol: 6, start_port: 8765, end_port: 8765, start_addr: addr_a, end_addr: addr_a };
        let tsr = TrafficSelector { ts_type: TS_IPV4_ADDR_RANGE, ip_protocol: 6, start_port: 23, end_port: 23, start_addr: addr_b, end_addr: addr_b };
        a.process_acquire(tsi, tsr, 1).unwrap();

        for _ in 0..MAX_RETRANSMISSIONS {
            assert!(a.check_retransmission_timer().is_some());
        }
        assert!(a.check_retransmission_timer().is_none());
        assert_eq!(a.state, IkeSaState::Deleted);
    }

    #[test]
    fn invalid_ke_retries_with_fallback_group() {
        let addr_a: Ipv4Addr = "192.168.0.1".parse().unwrap();
        let addr_b: Ipv4Addr = "192.168.0.2".parse().unwrap();
        let mut cfg_a = (*test_config(addr_a, addr_b)).clone();
        cfg_a.dh = vec![transform(TRANSFORM_TYPE_DH, 16, None), transform(TRANSFORM_TYPE_DH, 14, None)];
        let mut cfg_b = (*test_config(addr_b, addr_a)).clone();
        cfg_b.dh = vec![transform(TRANSFORM_TYPE_DH, 14, None)];
        let mut a = IkeSa::new_initiator(addr_a, addr_b, Arc::new(cfg_a)).unwrap();
        let mut b = IkeSa::new_responder(addr_b, addr_a, Arc::new(cfg_b)).unwrap();

        let tsi = TrafficSelector { ts_type: TS_IPV4_ADDR_RANGE, ip_protocol: 6, start_port: 8765, end_port: 8765, start_addr: addr_a, end_addr: addr_a };
        let tsr = TrafficSelector { ts_type: TS_IPV4_ADDR_RANGE, ip_protocol: 6, start_port: 23, end_port: 23, start_addr: addr_b, end_addr: addr_b };

        // `a` only ever offers group 16 first; `b` only supports group 14, so
        // the first round trip must come back INVALID_KE_PAYLOAD rather than
        // NO_PROPOSAL_CHOSEN (group 14 is present in both configs' DH lists).
        let msg1 = a.process_acquire(tsi, tsr, 1).expect("first IKE_SA_INIT attempt offers group 16");
        let msg2 = b.process_message(&msg1).expect("responder rejects the group-16 KE");
        assert_eq!(a.state, IkeSaState::InitReqSent);
        assert_eq!(b.state, IkeSaState::Initial);

        let msg3 = a.process_message(&msg2).expect("initiator retries with group 14");
        assert_eq!(a.state, IkeSaState::InitReqSent);
        let msg4 = b.process_message(&msg3).expect("responder accepts the retried group-14 KE");
        let msg5 = a.process_message(&msg4).expect("initiator sends IKE_AUTH");
        let msg6 = b.process_message(&msg5).expect("responder answers IKE_AUTH");
        assert!(a.process_message(&msg6).is_none());

        assert_eq!(a.state, IkeSaState::Established);
        assert_eq!(b.state, IkeSaState::Established);
        assert_eq!(a.child_sas.len(), 1);
        assert_eq!(b.child_sas.len(), 1);
    }

    fn established_pair_with_one_child(addr_a: Ipv4Addr, addr_b: Ipv4Addr) -> (IkeSa, IkeSa) {
        let mut a = IkeSa::new_initiator(addr_a, addr_b, test_config(addr_a, addr_b)).unwrap();
        let mut b = IkeSa::new_responder(addr_b, addr_a, test_config(addr_b, addr_a)).unwrap();
        let tsi = TrafficSelector { ts_type: TS_IPV4_ADDR_RANGE, ip_protocol: 6, start_port: 8765, end_port: 8765, start_addr: addr_a, end_addr: addr_a };
        let tsr = TrafficSelector { ts_type: TS_IPV4_ADDR_RANGE, ip_protocol: 6, start_port: 23, end_port: 23, start_addr: addr_b, end_addr: addr_b };
        let msg1 = a.process_acquire(tsi, tsr, 1).unwrap();
        let msg2 = b.process_message(&msg1).unwrap();
        let msg3 = a.process_message(&msg2).unwrap();
        let msg4 = b.process_message(&msg3).unwrap();
        assert!(a.process_message(&msg4).is_none());
        (a, b)
    }

    #[test]
    fn rekey_child_sa_converges_to_a_single_replacement() {
        let addr_a: Ipv4Addr = "192.168.0.1".parse().unwrap();
        let addr_b: Ipv4Addr = "192.168.0.2".parse().unwrap();
        let (mut a, mut b) = established_pair_with_one_child(addr_a, addr_b);
        let old_spi = a.child_sas[0].inbound_spi;

        let rekey_req = a.process_expire(old_spi, false).expect("soft expire starts a rekey");
        assert_eq!(a.state, IkeSaState::RekChildReqSent);

        let rekey_res = b.process_message(&rekey_req).expect("responder negotiates the new child");
        let delete_req = a.process_message(&rekey_res).expect("initiator deletes the replaced child");
        let delete_res = b.process_message(&delete_req).expect("responder acks the delete");
        assert!(a.process_message(&delete_res).is_none());

        assert_eq!(a.state, IkeSaState::Established);
        assert_eq!(b.state, IkeSaState::Established);
        assert_eq!(a.child_sas.len(), 1);
        assert_eq!(b.child_sas.len(), 1);
        assert_ne!(a.child_sas[0].inbound_spi, old_spi);

        let a_retired = a.drain_retired_child_sas();
        let b_retired = b.drain_retired_child_sas();
        assert!(a_retired.iter().any(|c| c.inbound_spi == old_spi));
        assert!(b_retired.iter().any(|c| c.inbound_spi == old_spi));
    }

    #[test]
    fn simultaneous_child_rekey_collision_converges_without_duplicate_children() {
        let addr_a: Ipv4Addr = "192.168.0.1".parse().unwrap();
        let addr_b: Ipv4Addr = "192.168.0.2".parse().unwrap();
        let (mut a, mut b) = established_pair_with_one_child(addr_a, addr_b);
        let old_spi = a.child_sas[0].inbound_spi;

        // Both sides start rekeying the same child before either hears from
        // the other (RFC 7296 §2.25.1's simultaneous-rekey collision).
        let req_a = a.process_expire(old_spi, false).expect("a starts its own rekey");
        let req_b = b.process_expire(old_spi, false).expect("b starts its own rekey");

        let resp_b_to_a = b.process_message(&req_a).expect("b answers a's colliding request");
        // The collision must be caught before a new child is negotiated.
        assert_eq!(b.child_sas.len(), 1);
        let resp_a_to_b = a.process_message(&req_b).expect("a answers b's colliding request");
        assert_eq!(a.child_sas.len(), 1);

        let retry_a = a.process_message(&resp_b_to_a);
        let retry_b = b.process_message(&resp_a_to_b);
        // Exactly one side loses the nonce tie-break and stands down; the
        // other retries so the collision converges on a single new child.
        assert_ne!(retry_a.is_some(), retry_b.is_some());

        let (winner, loser, retry) = if retry_a.is_some() {
            (&mut a, &mut b, retry_a.unwrap())
        } else {
            (&mut b, &mut a, retry_b.unwrap())
        };
        assert_eq!(loser.state, IkeSaState::Established);
        assert_eq!(loser.child_sas.len(), 1);
        assert_eq!(loser.child_sas[0].inbound_spi, old_spi);

        let retry_res = loser.process_message(&retry).expect("loser negotiates the winner's retry");
        let delete_req = winner.process_message(&retry_res).expect("winner deletes the replaced child");
        let delete_res = loser.process_message(&delete_req).expect("loser acks the delete");
        assert!(winner.process_message(&delete_res).is_none());

        assert_eq!(a.state, IkeSaState::Established);
        assert_eq!(b.state, IkeSaState::Established);
        assert_eq!(a.child_sas.len(), 1);
        assert_eq!(b.child_sas.len(), 1);
        assert_ne!(a.child_sas[0].inbound_spi, old_spi);
        assert_ne!(b.child_sas[0].inbound_spi, old_spi);
    }

    #[test]
    fn replayed_request_returns_cached_response_without_reprocessing() {
        let addr_a: Ipv4Addr = "192.168.0.1".parse().unwrap();
        let addr_b: Ipv4Addr = "192.168.0.2".parse().unwrap();
        let mut a = IkeSa::new_initiator(addr_a, addr_b, test_config(addr_a, addr_b)).unwrap();
        let mut b = IkeSa::new_responder(addr_b, addr_a, test_config(addr_b, addr_a)).unwrap();
        let tsi = TrafficSelector { ts_type: TS_IPV4_ADDR_RANGE, ip_protocol: 6, start_port: 8765, end_port: 8765, start_addr: addr_a, end_addr: addr_a };
        let tsr = TrafficSelector { ts_type: TS_IPV4_ADDR_RANGE, ip_protocol: 6, start_port: 23, end_port: 23, start_addr: addr_b, end_addr: addr_b };

        let msg1 = a.process_acquire(tsi, tsr, 1).unwrap();
        let msg2 = b.process_message(&msg1).unwrap();
        let msg3 = a.process_message(&msg2).unwrap();
        let msg4 = b.process_message(&msg3).unwrap();
        assert_eq!(b.child_sas.len(), 1);

        let replayed = b.process_message(&msg3).expect("replay of IKE_AUTH returns the cached response");
        assert_eq!(replayed, msg4);
        assert_eq!(b.child_sas.len(), 1);
    }
}
