//! Key schedule: IKE SA key derivation and per-Child-SA KEYMAT (RFC 7296 §2.14-2.17,
//! this crate's §4.5 contract).

use crate::network::ike::crypto::{EncrAlg, IntegAlg, PrfAlg};

/// The seven keys derived once per IKE SA from SKEYSEED.
#[derive(Debug, Clone)]
pub struct IkeKeys {
    pub sk_d: Vec<u8>,
    pub sk_ai: Vec<u8>,
    pub sk_ar: Vec<u8>,
    pub sk_ei: Vec<u8>,
    pub sk_er: Vec<u8>,
    pub sk_pi: Vec<u8>,
    pub sk_pr: Vec<u8>,
}

/// `SKEYSEED = prf(Ni | Nr, g^ir)` followed by
/// `{SK_d, SK_ai, SK_ar, SK_ei, SK_er, SK_pi, SK_pr} = prf+(SKEYSEED, Ni | Nr | SPIi | SPIr)`.
pub fn derive_ike_keys(
    prf: PrfAlg,
    integ: IntegAlg,
    encr: EncrAlg,
    shared_secret: &[u8],
    ni: &[u8],
    nr: &[u8],
    spi_i: &[u8; 8],
    spi_r: &[u8; 8],
) -> IkeKeys {
    let mut nonce_concat = Vec::with_capacity(ni.len() + nr.len());
    nonce_concat.extend_from_slice(ni);
    nonce_concat.extend_from_slice(nr);

    let skeyseed = prf.prf(&nonce_concat, shared_secret);

    let mut seed_input = nonce_concat;
    seed_input.extend_from_slice(spi_i);
    seed_input.extend_from_slice(spi_r);

    let prf_len = prf.output_len();
    let integ_len = integ.key_len();
    let encr_len = encr.key_len();
    let total = prf_len + 2 * integ_len + 2 * encr_len + 2 * prf_len;

    let keymat = prf.prf_plus(&skeyseed, &seed_input, total);

    let mut off = 0;
    let take = |off: &mut usize, len: usize| -> Vec<u8> {
        let slice = keymat[*off..*off + len].to_vec();
        *off += len;
        slice
    };

    IkeKeys {
        sk_d: take(&mut off, prf_len),
        sk_ai: take(&mut off, integ_len),
        sk_ar: take(&mut off, integ_len),
        sk_ei: take(&mut off, encr_len),
        sk_er: take(&mut off, encr_len),
        sk_pi: take(&mut off, prf_len),
        sk_pr: take(&mut off, prf_len),
    }
}

/// KEYMAT for a Child SA negotiation: `prf+(SK_d, [g^ir |] Ni | Nr)`, split into
/// `SK_ei_child, SK_ai_child, SK_er_child, SK_ar_child` in that order.
#[derive(Debug, Clone)]
pub struct ChildKeys {
    pub encr_i: Vec<u8>,
    pub integ_i: Vec<u8>,
    pub encr_r: Vec<u8>,
    pub integ_r: Vec<u8>,
}

pub fn derive_child_keys(
    prf: PrfAlg,
    encr: EncrAlg,
    integ: IntegAlg,
    sk_d: &[u8],
    dh_shared_secret: Option<&[u8]>,
    ni: &[u8],
    nr: &[u8],
) -> ChildKeys {
    let mut seed = Vec::new();
    if let Some(g_ir) = dh_shared_secret {
        seed.extend_from_slice(g_ir);
    }
    seed.extend_from_slice(ni);
    seed.extend_from_slice(nr);

    let encr_len = encr.key_len();
    let integ_len = integ.key_len();
    let total = 2 * encr_len + 2 * integ_len;
    let keymat = prf.prf_plus(sk_d, &seed, total);

    let mut off = 0;
    let take = |off: &mut usize, len: usize| -> Vec<u8> {
        let slice = keymat[*off..*off + len].to_vec();
        *off += len;
        slice
    };

    ChildKeys {
        encr_i: take(&mut off, encr_len),
        integ_i: take(&mut off, integ_len),
        encr_r: take(&mut off, encr_len),
        integ_r: take(&mut off, integ_len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ike_key_derivation_is_symmetric_given_same_inputs() {
        let secret = vec![0x11u8; 32];
        let ni = vec![1u8; 32];
        let nr = vec![2u8; 32];
        let spi_i = [3u8; 8];
        let spi_r = [4u8; 8];
        let a = derive_ike_keys(PrfAlg::HmacSha256, IntegAlg::HmacSha256_128, EncrAlg::Aes256Cbc, &secret, &ni, &nr, &spi_i, &spi_r);
        let b = derive_ike_keys(PrfAlg::HmacSha256, IntegAlg::HmacSha256_128, EncrAlg::Aes256Cbc, &secret, &ni, &nr, &spi_i, &spi_r);
        assert_eq!(a.sk_d, b.sk_d);
        assert_eq!(a.sk_ei, b.sk_ei);
        assert_eq!(a.sk_pr, b.sk_pr);
    }

    #[test]
    fn child_keys_without_dh_derive_from_sk_d_and_nonces() {
        let sk_d = vec![9u8; 32];
        let ni = vec![1u8; 16];
        let nr = vec![2u8; 16];
        let keys = derive_child_keys(PrfAlg::HmacSha256, EncrAlg::Aes256Cbc, IntegAlg::HmacSha256_128, &sk_d, None, &ni, &nr);
        assert_eq!(keys.encr_i.len(), 32);
        assert_eq!(keys.integ_r.len(), 32);
        assert_ne!(keys.encr_i, keys.encr_r);
    }
}
