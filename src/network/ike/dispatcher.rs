//! SPI-keyed demultiplexer (C10): routes inbound datagrams to the `IkeSa`
//! they belong to, creates new responder state machines for IKE_SA_INIT
//! requests, drives every session's timers, and pushes newly negotiated
//! Child SAs down to the kernel plane.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::network::ike::config::PeerConfigurations;
use crate::network::ike::kernel::{Direction, InstallChildSa, IpsecPolicy, KernelInterface};
use crate::network::ike::message::ExchangeType;
use crate::network::ike::sa::{IkeSa, IkeSaState};

/// Removes a retired Child SA's inbound and outbound installs from the
/// kernel plane, logging (not failing the caller) on error — kernel-plane
/// teardown is best-effort and must never block the IKE state transition
/// that triggered it.
fn remove_child_sa_pair<K: KernelInterface>(kernel: &K, my_addr: Ipv4Addr, peer: Ipv4Addr, retired: crate::network::ike::sa::RetiredChildSa) {
    if let Err(e) = kernel.remove_child_sa(my_addr, retired.protocol_id, retired.inbound_spi) {
        tracing::warn!(spi = retired.inbound_spi, protocol_id = retired.protocol_id, error = %e, "remove_child_sa (inbound) failed");
    }
    if let Err(e) = kernel.remove_child_sa(peer, retired.protocol_id, retired.outbound_spi) {
        tracing::warn!(spi = retired.outbound_spi, protocol_id = retired.protocol_id, error = %e, "remove_child_sa (outbound) failed");
    }
}

/// A message the dispatcher produced for the caller to send.
pub struct Outbound {
    pub to: Ipv4Addr,
    pub bytes: Vec<u8>,
}

/// Keys an `IkeSa` by the peer address and the local SPI we assigned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SaKey {
    peer: Ipv4Addr,
    my_spi: [u8; 8],
}

pub struct Dispatcher<K: KernelInterface> {
    my_addr: Ipv4Addr,
    configurations: Arc<PeerConfigurations>,
    kernel: K,
    sessions: HashMap<SaKey, IkeSa>,
    installed_spis: HashMap<SaKey, HashSet<u32>>,
}

impl<K: KernelInterface> Dispatcher<K> {
    pub fn new(my_addr: Ipv4Addr, configurations: Arc<PeerConfigurations>, kernel: K) -> Self {
        Dispatcher {
            my_addr,
            configurations,
            kernel,
            sessions: HashMap::new(),
            installed_spis: HashMap::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Starts a new initiator session toward `peer` for its first protected
    /// subnet, e.g. in response to an operator "connect" command.
    pub fn initiate(&mut self, peer: Ipv4Addr) -> Option<Outbound> {
        let config = self.configurations.get(peer).ok()?;
        let mut sa = IkeSa::new_initiator(self.my_addr, peer, Arc::new(config.clone())).ok()?;
        let request = sa.initiate()?;
        let key = SaKey { peer, my_spi: sa.my_spi };
        self.sessions.insert(key, sa);
        Some(Outbound { to: peer, bytes: request })
    }

    /// Arms IKE SA deletion for every established session toward `peer` and
    /// immediately fires the resulting `INFORMATIONAL` delete request.
    pub fn disconnect(&mut self, peer: Ipv4Addr) -> Option<Outbound> {
        let key = self
            .sessions
            .iter()
            .find(|(k, sa)| k.peer == peer && sa.is_established())
            .map(|(k, _)| *k)?;
        let sa = self.sessions.get_mut(&key)?;
        sa.arm_delete_ike_sa();
        let bytes = sa.check_rekey_ike_sa_timer()?;
        Some(Outbound { to: peer, bytes })
    }

    /// Feeds one inbound UDP datagram into the matching `IkeSa`, creating a
    /// fresh responder session for an unknown initiator SPI if the message is
    /// an IKE_SA_INIT request.
    pub fn handle_datagram(&mut self, peer: Ipv4Addr, raw: &[u8]) -> Option<Outbound> {
        let initiator_spi = peek_spi(raw, 0)?;
        let responder_spi = peek_spi(raw, 8)?;
        let exchange_type = raw.get(18).copied().and_then(ExchangeType::from_u8);
        let is_response = raw.get(19).copied().map(|f| f & 0x20 != 0).unwrap_or(false);

        let known_key = self
            .sessions
            .keys()
            .find(|k| k.peer == peer && (k.my_spi == responder_spi || k.my_spi == initiator_spi))
            .copied();

        let key = match known_key {
            Some(k) => k,
            None => {
                if is_response || exchange_type != Some(ExchangeType::IkeSaInit) {
                    return None;
                }
                let config = self.configurations.get(peer).ok()?;
                let mut sa = IkeSa::new_responder(self.my_addr, peer, Arc::new(config.clone())).ok()?;
                sa.peer_spi = initiator_spi;
                let key = SaKey { peer, my_spi: sa.my_spi };
                self.sessions.insert(key, sa);
                key
            }
        };

        let sa = self.sessions.get_mut(&key)?;
        let response = sa.process_message(raw)?;
        self.install_new_child_sas(key);
        self.remove_retired_child_sas(key);
        if self.sessions.get(&key).map(|s| s.state == IkeSaState::Deleted).unwrap_or(false) {
            self.sessions.remove(&key);
            self.installed_spis.remove(&key);
        }
        Some(Outbound { to: peer, bytes: response })
    }

    /// Runs the retransmission/DPD/rekey timers for every live session,
    /// installs any Child SAs those exchanges just produced, and drops
    /// sessions that deleted themselves (e.g. after `MAX_RETRANSMISSIONS`).
    pub fn tick(&mut self) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        let mut dead = Vec::new();
        let mut promoted = Vec::new();
        let keys: Vec<SaKey> = self.sessions.keys().copied().collect();

        for key in &keys {
            let sa = match self.sessions.get_mut(key) {
                Some(sa) => sa,
                None => continue,
            };
            if let Some(bytes) = sa.check_retransmission_timer() {
                outbound.push(Outbound { to: key.peer, bytes });
            }
            if let Some(bytes) = sa.check_dead_peer_detection_timer() {
                outbound.push(Outbound { to: key.peer, bytes });
            }
            if let Some(bytes) = sa.check_rekey_ike_sa_timer() {
                outbound.push(Outbound { to: key.peer, bytes });
            }
            if let Some(new_sa) = sa.new_ike_sa.take() {
                promoted.push((SaKey { peer: key.peer, my_spi: new_sa.my_spi }, *new_sa));
            }
            if sa.state == IkeSaState::Deleted {
                dead.push(*key);
            }
        }
        for (key, new_sa) in promoted {
            self.sessions.insert(key, new_sa);
        }
        for key in &keys {
            self.install_new_child_sas(*key);
            self.remove_retired_child_sas(*key);
        }
        for key in dead {
            self.sessions.remove(&key);
            self.installed_spis.remove(&key);
        }
        outbound
    }

    /// Installs every Child SA that has not already been installed for this
    /// session: both SA directions plus the in/out/forward policy triple
    /// (§3 "three-policy install"). `IkeSa::pending_kernel_commands` names
    /// the same set of effects as data; this reads straight off `child_sas`
    /// because the kernel call additionally needs the negotiated keys and
    /// selectors that a bare `KernelCommand` doesn't carry.
    fn install_new_child_sas(&mut self, key: SaKey) {
        let Some(sa) = self.sessions.get(&key) else { return };
        let seen = self.installed_spis.entry(key).or_default();
        let my_addr = self.my_addr;
        for child in &sa.child_sas {
            if !seen.insert(child.inbound_spi) {
                continue;
            }
            if let Err(e) = self.kernel.install_child_sa(InstallChildSa {
                inbound: true,
                src: key.peer,
                dst: my_addr,
                src_selector: &child.tsr,
                dst_selector: &child.tsi,
                protocol_id: child.protocol_id,
                mode: child.mode,
                spi: child.inbound_spi,
                encr_alg: child.encr_alg,
                encr_key: &child.encr_key_in,
                integ_alg: child.integ_alg,
                integ_key: &child.integ_key_in,
            }) {
                tracing::warn!(spi = child.inbound_spi, error = %e, "install_child_sa (inbound) failed");
            }
            if let Err(e) = self.kernel.install_child_sa(InstallChildSa {
                inbound: false,
                src: my_addr,
                dst: key.peer,
                src_selector: &child.tsi,
                dst_selector: &child.tsr,
                protocol_id: child.protocol_id,
                mode: child.mode,
                spi: child.outbound_spi,
                encr_alg: child.encr_alg,
                encr_key: &child.encr_key_out,
                integ_alg: child.integ_alg,
                integ_key: &child.integ_key_out,
            }) {
                tracing::warn!(spi = child.outbound_spi, error = %e, "install_child_sa (outbound) failed");
            }
            for direction in [Direction::In, Direction::Out, Direction::Fwd] {
                if let Err(e) = self.kernel.install_policies(
                    direction,
                    my_addr,
                    key.peer,
                    &IpsecPolicy { my_subnet: &child.tsi, peer_subnet: &child.tsr, mode: child.mode, index: None },
                ) {
                    tracing::warn!(?direction, error = %e, "install_policies failed");
                }
            }
        }
    }

    /// Removes every Child SA the session has retired (rekey replaced it,
    /// the peer deleted it, or the whole IKE SA reached `Deleted`) from the
    /// kernel plane. Deleting an IKE SA deletes its children in the kernel
    /// plane first — `IkeSa::mark_deleted` already moved any still-installed
    /// children into this drain, so this call covers that case too.
    fn remove_retired_child_sas(&mut self, key: SaKey) {
        let my_addr = self.my_addr;
        let Some(sa) = self.sessions.get_mut(&key) else { return };
        for retired in sa.drain_retired_child_sas() {
            remove_child_sa_pair(&self.kernel, my_addr, key.peer, retired);
        }
    }
}

fn peek_spi(raw: &[u8], offset: usize) -> Option<[u8; 8]> {
    raw.get(offset..offset + 8)?.try_into().ok()
}
