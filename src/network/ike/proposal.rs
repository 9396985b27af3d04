//! Proposal/transform intersection (RFC 7296 §3.3, this crate's §4.3 contract).

use crate::network::ike::message::{
    Proposal, Transform, TRANSFORM_TYPE_DH, TRANSFORM_TYPE_ENCR, TRANSFORM_TYPE_ESN, TRANSFORM_TYPE_INTEG,
    TRANSFORM_TYPE_PRF,
};

/// A chosen transform for one transform type, after intersection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChosenProposal {
    pub number: u8,
    pub protocol_id: u8,
    pub encr: Option<Transform>,
    pub prf: Option<Transform>,
    pub integ: Option<Transform>,
    pub dh: Option<Transform>,
    pub esn: Option<Transform>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoMatch;

/// For each local proposal, in order, checks whether every transform type it
/// carries has at least one match in the peer's proposal for the same
/// protocol. The peer's *first* (most preferred) matching value is selected.
pub fn select(local: &[Proposal], peer: &[Proposal]) -> Result<ChosenProposal, NoMatch> {
    for local_prop in local {
        for peer_prop in peer.iter().filter(|p| p.protocol_id == local_prop.protocol_id) {
            if let Some(chosen) = try_intersect(local_prop, peer_prop) {
                return Ok(chosen);
            }
        }
    }
    Err(NoMatch)
}

fn try_intersect(local: &Proposal, peer: &Proposal) -> Option<ChosenProposal> {
    let required_types = required_transform_types(local);
    let mut chosen = ChosenProposal {
        number: peer.number,
        protocol_id: local.protocol_id,
        encr: None,
        prf: None,
        integ: None,
        dh: None,
        esn: None,
    };
    for transform_type in required_types {
        let local_values: Vec<&Transform> = local
            .transforms
            .iter()
            .filter(|t| t.transform_type == transform_type)
            .collect();
        let match_ = peer
            .transforms
            .iter()
            .find(|pt| pt.transform_type == transform_type && local_values.iter().any(|lt| transforms_match(lt, pt)))?;
        assign(&mut chosen, transform_type, match_.clone());
    }
    Some(chosen)
}

fn transforms_match(a: &Transform, b: &Transform) -> bool {
    a.transform_type == b.transform_type && a.transform_id == b.transform_id && a.key_length_bits == b.key_length_bits
}

fn assign(chosen: &mut ChosenProposal, transform_type: u8, t: Transform) {
    match transform_type {
        TRANSFORM_TYPE_ENCR => chosen.encr = Some(t),
        TRANSFORM_TYPE_PRF => chosen.prf = Some(t),
        TRANSFORM_TYPE_INTEG => chosen.integ = Some(t),
        TRANSFORM_TYPE_DH => chosen.dh = Some(t),
        TRANSFORM_TYPE_ESN => chosen.esn = Some(t),
        _ => {}
    }
}

/// The set of transform types a proposal requires a match for: whatever types
/// it actually carries transforms of. An IKE proposal carries ENCR/PRF/INTEG/DH;
/// an ESP proposal carries ENCR/INTEG/ESN (and AH INTEG/ESN only).
fn required_transform_types(p: &Proposal) -> Vec<u8> {
    let mut types: Vec<u8> = p.transforms.iter().map(|t| t.transform_type).collect();
    types.sort_unstable();
    types.dedup();
    types
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ike::message::PROTOCOL_IKE;

    fn transform(ty: u8, id: u16) -> Transform {
        Transform {
            transform_type: ty,
            transform_id: id,
            key_length_bits: None,
        }
    }

    #[test]
    fn selects_first_matching_local_proposal() {
        let local = vec![
            Proposal {
                number: 1,
                protocol_id: PROTOCOL_IKE,
                spi: vec![],
                transforms: vec![transform(TRANSFORM_TYPE_ENCR, 99), transform(TRANSFORM_TYPE_DH, 14)],
            },
            Proposal {
                number: 2,
                protocol_id: PROTOCOL_IKE,
                spi: vec![],
                transforms: vec![transform(TRANSFORM_TYPE_ENCR, 12), transform(TRANSFORM_TYPE_DH, 14)],
            },
        ];
        let peer = vec![Proposal {
            number: 1,
            protocol_id: PROTOCOL_IKE,
            spi: vec![],
            transforms: vec![transform(TRANSFORM_TYPE_ENCR, 12), transform(TRANSFORM_TYPE_DH, 14)],
        }];
        let chosen = select(&local, &peer).unwrap();
        assert_eq!(chosen.encr.unwrap().transform_id, 12);
        assert_eq!(chosen.dh.unwrap().transform_id, 14);
    }

    #[test]
    fn no_match_when_dh_groups_disjoint() {
        let local = vec![Proposal {
            number: 1,
            protocol_id: PROTOCOL_IKE,
            spi: vec![],
            transforms: vec![transform(TRANSFORM_TYPE_ENCR, 12), transform(TRANSFORM_TYPE_DH, 16)],
        }];
        let peer = vec![Proposal {
            number: 1,
            protocol_id: PROTOCOL_IKE,
            spi: vec![],
            transforms: vec![transform(TRANSFORM_TYPE_ENCR, 12), transform(TRANSFORM_TYPE_DH, 14)],
        }];
        assert_eq!(select(&local, &peer), Err(NoMatch));
    }
}
