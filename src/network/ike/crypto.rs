//! Cryptographic primitives for IKEv2: ciphers, PRF/PRF+, integrity checks and
//! MODP Diffie-Hellman groups (RFC 7296 §3.3.2, RFC 3526).

use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use num_bigint::BigUint;
use num_traits::One;
use ring::rand::SecureRandom;
use ring::{hmac, rand};

use crate::network::ike::IKEError;

/// Symmetric encryption algorithm negotiated for SK payloads and Child SAs.
/// RFC 7296's core profile is AES-CBC; GCM/ChaCha20 are AEAD transforms that
/// replace the separate integrity algorithm, out of scope here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncrAlg {
    Aes128Cbc,
    Aes256Cbc,
}

impl EncrAlg {
    pub fn key_len(self) -> usize {
        match self {
            EncrAlg::Aes128Cbc => 16,
            EncrAlg::Aes256Cbc => 32,
        }
    }

    pub const fn iv_len(self) -> usize {
        16
    }

    pub fn from_transform_id(id: u16, key_bits: Option<u16>) -> Result<Self, IKEError> {
        match (id, key_bits) {
            (12, Some(128)) | (12, None) => Ok(EncrAlg::Aes128Cbc),
            (12, Some(256)) => Ok(EncrAlg::Aes256Cbc),
            _ => Err(IKEError::Crypto(format!(
                "unsupported ENCR transform {id}/{key_bits:?}"
            ))),
        }
    }
}

/// Pseudo-random function used for key derivation (RFC 7296 §2.13).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfAlg {
    HmacSha1,
    HmacSha256,
    HmacSha512,
}

impl PrfAlg {
    fn algorithm(self) -> hmac::Algorithm {
        match self {
            PrfAlg::HmacSha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            PrfAlg::HmacSha256 => hmac::HMAC_SHA256,
            PrfAlg::HmacSha512 => hmac::HMAC_SHA512,
        }
    }

    pub fn output_len(self) -> usize {
        match self {
            PrfAlg::HmacSha1 => 20,
            PrfAlg::HmacSha256 => 32,
            PrfAlg::HmacSha512 => 64,
        }
    }

    pub fn from_transform_id(id: u16) -> Result<Self, IKEError> {
        match id {
            2 => Ok(PrfAlg::HmacSha1),
            5 => Ok(PrfAlg::HmacSha256),
            7 => Ok(PrfAlg::HmacSha512),
            _ => Err(IKEError::Crypto(format!("unsupported PRF transform {id}"))),
        }
    }

    /// `prf(key, data)`, a single keyed-hash application.
    pub fn prf(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let hmac_key = hmac::Key::new(self.algorithm(), key);
        hmac::sign(&hmac_key, data).as_ref().to_vec()
    }

    /// `prf+(key, data, len)` per RFC 7296 §2.13:
    /// `T1 = prf(key, data | 0x01)`, `Tn = prf(key, T(n-1) | data | n)`.
    pub fn prf_plus(self, key: &[u8], data: &[u8], len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len + self.output_len());
        let mut prev: Vec<u8> = Vec::new();
        let mut counter: u8 = 1;
        while out.len() < len {
            let mut input = Vec::with_capacity(prev.len() + data.len() + 1);
            input.extend_from_slice(&prev);
            input.extend_from_slice(data);
            input.push(counter);
            let t = self.prf(key, &input);
            out.extend_from_slice(&t);
            prev = t;
            counter = counter.checked_add(1).expect("prf+ exhausted counter space");
        }
        out.truncate(len);
        out
    }
}

/// Integrity (authentication) algorithm for the SK payload's ICV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegAlg {
    HmacSha1_96,
    HmacSha256_128,
    HmacSha512_256,
}

impl IntegAlg {
    fn algorithm(self) -> hmac::Algorithm {
        match self {
            IntegAlg::HmacSha1_96 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            IntegAlg::HmacSha256_128 => hmac::HMAC_SHA256,
            IntegAlg::HmacSha512_256 => hmac::HMAC_SHA512,
        }
    }

    /// Truncated ICV length actually carried on the wire.
    pub fn icv_len(self) -> usize {
        match self {
            IntegAlg::HmacSha1_96 => 12,
            IntegAlg::HmacSha256_128 => 16,
            IntegAlg::HmacSha512_256 => 32,
        }
    }

    /// Full key length consumed from the key schedule (independent of truncation).
    pub fn key_len(self) -> usize {
        match self {
            IntegAlg::HmacSha1_96 => 20,
            IntegAlg::HmacSha256_128 => 32,
            IntegAlg::HmacSha512_256 => 64,
        }
    }

    pub fn from_transform_id(id: u16) -> Result<Self, IKEError> {
        match id {
            2 => Ok(IntegAlg::HmacSha1_96),
            12 => Ok(IntegAlg::HmacSha256_128),
            14 => Ok(IntegAlg::HmacSha512_256),
            _ => Err(IKEError::Crypto(format!("unsupported INTEG transform {id}"))),
        }
    }

    pub fn compute(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let hmac_key = hmac::Key::new(self.algorithm(), key);
        let full = hmac::sign(&hmac_key, data);
        full.as_ref()[..self.icv_len()].to_vec()
    }

    pub fn verify(self, key: &[u8], data: &[u8], icv: &[u8]) -> bool {
        self.compute(key, data).as_slice() == icv
    }
}

pub fn aes_cbc_encrypt(alg: EncrAlg, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, IKEError> {
    if key.len() != alg.key_len() {
        return Err(IKEError::Crypto("invalid ENCR key length".into()));
    }
    match alg {
        EncrAlg::Aes128Cbc => {
            let enc = cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
                .map_err(|_| IKEError::Crypto("bad AES-128 key/iv".into()))?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        }
        EncrAlg::Aes256Cbc => {
            let enc = cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
                .map_err(|_| IKEError::Crypto("bad AES-256 key/iv".into()))?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        }
    }
}

pub fn aes_cbc_decrypt(alg: EncrAlg, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, IKEError> {
    if key.len() != alg.key_len() {
        return Err(IKEError::Crypto("invalid ENCR key length".into()));
    }
    let result = match alg {
        EncrAlg::Aes128Cbc => {
            let dec = cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
                .map_err(|_| IKEError::Crypto("bad AES-128 key/iv".into()))?;
            dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        }
        EncrAlg::Aes256Cbc => {
            let dec = cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
                .map_err(|_| IKEError::Crypto("bad AES-256 key/iv".into()))?;
            dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        }
    };
    result.map_err(|_| IKEError::InvalidMac)
}

pub fn random_bytes(len: usize) -> Result<Vec<u8>, IKEError> {
    let rng = rand::SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf).map_err(|_| IKEError::Crypto("RNG failure".into()))?;
    Ok(buf)
}

pub fn random_nonce() -> Result<Vec<u8>, IKEError> {
    random_bytes(32)
}

pub fn random_spi() -> Result<[u8; 8], IKEError> {
    let bytes = random_bytes(8)?;
    let mut spi = [0u8; 8];
    spi.copy_from_slice(&bytes);
    // my_spi must never be the all-zero sentinel used for "unknown peer".
    if spi == [0u8; 8] {
        spi[7] = 1;
    }
    Ok(spi)
}

/// MODP Diffie-Hellman groups (RFC 2409 §6.1-6.2, RFC 3526).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhGroup(pub u16);

impl DhGroup {
    fn params(self) -> Result<(BigUint, BigUint), IKEError> {
        let prime_hex: &str = match self.0 {
            1 => MODP_768,
            2 => MODP_1024,
            5 => MODP_1536,
            14 => MODP_2048,
            15 => MODP_3072,
            16 => MODP_4096,
            17 => MODP_6144,
            18 => MODP_8192,
            other => return Err(IKEError::Crypto(format!("unsupported DH group {other}"))),
        };
        let prime = BigUint::parse_bytes(prime_hex.as_bytes(), 16)
            .expect("static MODP prime constants are well-formed hex");
        Ok((prime, BigUint::from(2u32)))
    }

    pub fn public_key_len(self) -> Result<usize, IKEError> {
        Ok((self.params()?.0.bits() as usize + 7) / 8)
    }
}

/// One side's ephemeral Diffie-Hellman exchange.
pub struct DiffieHellman {
    group: DhGroup,
    prime: BigUint,
    private_key: BigUint,
    pub public_key: Vec<u8>,
}

impl DiffieHellman {
    pub fn new(group: DhGroup) -> Result<Self, IKEError> {
        let (prime, generator) = group.params()?;
        let priv_bytes = random_bytes(prime.bits() as usize / 8)?;
        let private_key = BigUint::from_bytes_be(&priv_bytes) % (&prime - BigUint::one());
        let public_key_int = generator.modpow(&private_key, &prime);
        let len = group.public_key_len()?;
        let public_key = pad_left(&public_key_int.to_bytes_be(), len);
        Ok(DiffieHellman {
            group,
            prime,
            private_key,
            public_key,
        })
    }

    pub fn group(&self) -> DhGroup {
        self.group
    }

    /// Computes `g^ir`, the shared secret, given the peer's public value.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> Vec<u8> {
        let peer_int = BigUint::from_bytes_be(peer_public);
        let shared = peer_int.modpow(&self.private_key, &self.prime);
        let len = self.group.public_key_len().unwrap_or(peer_public.len());
        pad_left(&shared.to_bytes_be(), len)
    }
}

fn pad_left(bytes: &[u8], len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes[bytes.len() - len..].to_vec();
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(bytes);
    out
}

// RFC 2409 Oakley Group 1/2 and RFC 3526 MODP group primes (generator = 2 for all of them).
const MODP_768: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A63A3620FFFFFFFFFFFFFFFF"
);
const MODP_1024: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF"
);
const MODP_1536: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF"
);
const MODP_2048: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF"
);
const MODP_3072: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF"
);
const MODP_4096: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7",
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8",
    "DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2",
    "233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9",
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C934063199FFFFFFFFFFFFFFFF"
);
const MODP_6144: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7",
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8",
    "DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2",
    "233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9",
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C93402849236C3FAB4D27C7026",
    "C1D4DCB2602646DEC9751E763DBA37BDF8FF9406AD9E530EE5DB382F413001AE",
    "B06A53ED9027D831179727B0865A8918DA3EDBEBCF9B14ED44CE6CBACED4BB1B",
    "DB7F1447E6CC254B332051512BD7AF426FB8F401378CD2BF5983CA01C64B92EC",
    "F032EA15D1721D03F482D7CE6E74FEF6D55E702F46980C82B5A84031900B1C9E",
    "59E7C97FBEC7E8F323A97A7E36CC88BE0F1D45B7FF585AC54BD407B22B4154AA",
    "CC8F6D7EBF48E1D814CC5ED20F8037E0A79715EEF29BE32806A1D58BB7C5DA76",
    "F550AA3D8A1FBFF0EB19CCB1A313D55CDA56C9EC2EF29632387FE8D76E3C0468",
    "043E8F663F4860EE12BF2D5B0B7474D6E694F91E6DCC4024FFFFFFFFFFFFFFFF"
);
const MODP_8192: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7",
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8",
    "DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2",
    "233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9",
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C93402849236C3FAB4D27C7026",
    "C1D4DCB2602646DEC9751E763DBA37BDF8FF9406AD9E530EE5DB382F413001AE",
    "B06A53ED9027D831179727B0865A8918DA3EDBEBCF9B14ED44CE6CBACED4BB1B",
    "DB7F1447E6CC254B332051512BD7AF426FB8F401378CD2BF5983CA01C64B92EC",
    "F032EA15D1721D03F482D7CE6E74FEF6D55E702F46980C82B5A84031900B1C9E",
    "59E7C97FBEC7E8F323A97A7E36CC88BE0F1D45B7FF585AC54BD407B22B4154AA",
    "CC8F6D7EBF48E1D814CC5ED20F8037E0A79715EEF29BE32806A1D58BB7C5DA76",
    "F550AA3D8A1FBFF0EB19CCB1A313D55CDA56C9EC2EF29632387FE8D76E3C0468",
    "043E8F663F4860EE12BF2D5B0B7474D6E694F91E6DBE115974A3926F12FEE5E4",
    "38777CB6A932DF8CD8BEC4D073B931BA3BC832B68D9DD300741FA7BF8AFC47ED",
    "2576F6936BA424663AAB639C5AE4F5683423B4742BF1C978238F16CBE39D652D",
    "E3FDB8BEFC848AD922222E04A4037C0713EB57A81A23F0C73473FC646CEA306B",
    "4BCBC8862F8385DDFA9D4B7FA2C087E879683303ED5BDD3A062B3CF5B3A278A6",
    "6D2A13F83F44F82DDF310EE074AB6A364597E899A0255DC164F31CC50846851D",
    "F9AB48195DED7EA1B1D510BD7EE74D73FAF36BC31ECFA268359046F4EB879F92",
    "4009438B481C6CD7889A002ED5EE382BC9190DA6FC026E479558E4475677E9AA",
    "9E3050E2765694DFC81F56E880B96E7160C980DD98EDD3DFFFFFFFFFFFFFFFFF"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_agreement_matches() {
        let a = DiffieHellman::new(DhGroup(14)).unwrap();
        let b = DiffieHellman::new(DhGroup(14)).unwrap();
        let secret_a = a.compute_shared_secret(&b.public_key);
        let secret_b = b.compute_shared_secret(&a.public_key);
        assert_eq!(secret_a, secret_b);
    }

    #[test]
    fn prf_plus_expands_to_requested_length() {
        let out = PrfAlg::HmacSha256.prf_plus(b"key", b"data", 100);
        assert_eq!(out.len(), 100);
    }

    #[test]
    fn aes_cbc_round_trips() {
        let key = vec![0x11u8; 32];
        let iv = vec![0x22u8; 16];
        let pt = b"some plaintext of arbitrary length".to_vec();
        let ct = aes_cbc_encrypt(EncrAlg::Aes256Cbc, &key, &iv, &pt).unwrap();
        let back = aes_cbc_decrypt(EncrAlg::Aes256Cbc, &key, &iv, &ct).unwrap();
        assert_eq!(back, pt);
    }

    #[test]
    fn integrity_verifies() {
        let key = b"supersecret-key-32-bytes-long!!!";
        let data = b"payload";
        let icv = IntegAlg::HmacSha256_128.compute(key, data);
        assert!(IntegAlg::HmacSha256_128.verify(key, data, &icv));
    }
}
