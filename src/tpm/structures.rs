//! TPM 2.0 wire structures used by quotes (all big-endian).

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::EcKey;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, Id, PKey, PKeyRef, Public};
use openssl::rsa::Rsa;
use openssl::sign::Verifier;

use crate::common::binary::{pad_to, read_tpm2b, write_tpm2b};
use crate::common::cert::{ec_key_from_raw_point, ecdsa_sig_from_be};
use crate::common::hash::sha256;
use crate::error::{self, Result};
use crate::options::KeyAlgo;

pub const TPM_ALG_RSA: u16 = 0x0001;
pub const TPM_ALG_SHA256: u16 = 0x000B;
pub const TPM_ALG_NULL: u16 = 0x0010;
pub const TPM_ALG_RSASSA: u16 = 0x0014;
pub const TPM_ALG_ECDSA: u16 = 0x0018;
pub const TPM_ALG_ECC: u16 = 0x0023;

pub const TPM_ECC_NIST_P256: u16 = 0x0003;

pub const TPM_GENERATED_VALUE: u32 = 0xff544347;
pub const TPM_ST_ATTEST_QUOTE: u16 = 0x8018;

/// fixedTPM | fixedParent | sensitiveDataOrigin | userWithAuth | restricted | sign
pub const AK_OBJECT_ATTRIBUTES: u32 = 0x00050072;

const RSA_KEY_BITS: u16 = 2048;
const RSA_DEFAULT_EXPONENT: u32 = 65537;
const P256_COORDINATE_BYTES: usize = 32;

/// Number of bytes in a PCR selection bitmap (PCRs 0..=23).
pub const PCR_SELECT_BYTES: usize = 3;

/// Public area of a signing key (TPMT_PUBLIC).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AkPublic {
    pub name_alg: u16,
    pub object_attributes: u32,
    pub key: AkPublicKey,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AkPublicKey {
    /// RSASSA-SHA256 key. An exponent of zero means 65537.
    Rsa { modulus: Vec<u8>, exponent: u32 },
    /// ECDSA-SHA256 key on NIST P-256.
    Ecc { x: Vec<u8>, y: Vec<u8> },
}

impl AkPublic {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut rdr = Cursor::new(bytes);
        let public = Self::from_reader(&mut rdr)?;

        if rdr.position() as usize != bytes.len() {
            return Err(error::decode("trailing bytes after TPMT_PUBLIC",
                                     Some("failed to decode attestation key".into())));
        }

        Ok(public)
    }

    pub fn from_reader(rdr: &mut impl Read) -> Result<Self> {
        let alg = rdr.read_u16::<BigEndian>().map_err(error::map_decode_err)?;
        let name_alg = rdr.read_u16::<BigEndian>().map_err(error::map_decode_err)?;
        let object_attributes = rdr.read_u32::<BigEndian>().map_err(error::map_decode_err)?;
        let _auth_policy = read_tpm2b(rdr)?;

        let symmetric = rdr.read_u16::<BigEndian>().map_err(error::map_decode_err)?;
        if symmetric != TPM_ALG_NULL {
            return Err(error::decode(format!("unexpected symmetric algorithm 0x{:04x}", symmetric),
                                     Some("signing keys carry no symmetric parameters".into())));
        }

        let key = match alg {
            TPM_ALG_RSA => {
                expect_scheme(rdr, TPM_ALG_RSASSA)?;
                let _key_bits = rdr.read_u16::<BigEndian>().map_err(error::map_decode_err)?;
                let exponent = rdr.read_u32::<BigEndian>().map_err(error::map_decode_err)?;
                let modulus = read_tpm2b(rdr)?;

                AkPublicKey::Rsa { modulus, exponent }
            }
            TPM_ALG_ECC => {
                expect_scheme(rdr, TPM_ALG_ECDSA)?;
                let curve = rdr.read_u16::<BigEndian>().map_err(error::map_decode_err)?;
                if curve != TPM_ECC_NIST_P256 {
                    return Err(error::decode(format!("unsupported ECC curve 0x{:04x}", curve), None));
                }
                let _kdf = rdr.read_u16::<BigEndian>().map_err(error::map_decode_err)?;
                let x = read_tpm2b(rdr)?;
                let y = read_tpm2b(rdr)?;

                AkPublicKey::Ecc { x, y }
            }
            _ => {
                return Err(error::decode(format!("unsupported key algorithm 0x{:04x}", alg), None));
            }
        };

        Ok(Self { name_alg, object_attributes, key })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        let alg = match &self.key {
            AkPublicKey::Rsa { .. } => TPM_ALG_RSA,
            AkPublicKey::Ecc { .. } => TPM_ALG_ECC,
        };

        out.write_u16::<BigEndian>(alg).map_err(error::map_io_err)?;
        out.write_u16::<BigEndian>(self.name_alg).map_err(error::map_io_err)?;
        out.write_u32::<BigEndian>(self.object_attributes).map_err(error::map_io_err)?;
        write_tpm2b(&mut out, &[])?;
        out.write_u16::<BigEndian>(TPM_ALG_NULL).map_err(error::map_io_err)?;

        match &self.key {
            AkPublicKey::Rsa { modulus, exponent } => {
                out.write_u16::<BigEndian>(TPM_ALG_RSASSA).map_err(error::map_io_err)?;
                out.write_u16::<BigEndian>(TPM_ALG_SHA256).map_err(error::map_io_err)?;
                out.write_u16::<BigEndian>(RSA_KEY_BITS).map_err(error::map_io_err)?;
                out.write_u32::<BigEndian>(*exponent).map_err(error::map_io_err)?;
                write_tpm2b(&mut out, modulus)?;
            }
            AkPublicKey::Ecc { x, y } => {
                out.write_u16::<BigEndian>(TPM_ALG_ECDSA).map_err(error::map_io_err)?;
                out.write_u16::<BigEndian>(TPM_ALG_SHA256).map_err(error::map_io_err)?;
                out.write_u16::<BigEndian>(TPM_ECC_NIST_P256).map_err(error::map_io_err)?;
                out.write_u16::<BigEndian>(TPM_ALG_NULL).map_err(error::map_io_err)?;
                write_tpm2b(&mut out, x)?;
                write_tpm2b(&mut out, y)?;
            }
        }

        Ok(out)
    }

    /// TCG default attestation key template. The unique field is zero-filled
    /// so the endorsement hierarchy always derives the same key.
    pub fn template(algo: KeyAlgo) -> Self {
        let key = match algo {
            KeyAlgo::Rsa => AkPublicKey::Rsa {
                modulus: vec![0; RSA_KEY_BITS as usize / 8],
                exponent: 0,
            },
            KeyAlgo::Ecc => AkPublicKey::Ecc {
                x: vec![0; P256_COORDINATE_BYTES],
                y: vec![0; P256_COORDINATE_BYTES],
            },
        };

        Self { name_alg: TPM_ALG_SHA256, object_attributes: AK_OBJECT_ATTRIBUTES, key }
    }

    /// Converts the public area to an OpenSSL key usable for signature checks.
    pub fn to_pkey(&self) -> Result<PKey<Public>> {
        let map_err = |e| error::decode(e, Some("invalid attestation key material".into()));

        match &self.key {
            AkPublicKey::Rsa { modulus, exponent } => {
                let exponent = if *exponent == 0 { RSA_DEFAULT_EXPONENT } else { *exponent };
                let rsa = Rsa::from_public_components(
                    BigNum::from_slice(modulus).map_err(map_err)?,
                    BigNum::from_u32(exponent).map_err(map_err)?,
                ).map_err(map_err)?;

                PKey::from_rsa(rsa).map_err(map_err)
            }
            AkPublicKey::Ecc { x, y } => {
                let mut xy = pad_to(x, P256_COORDINATE_BYTES)
                    .ok_or_else(|| error::decode("ECC x coordinate too long", None))?;
                xy.extend(pad_to(y, P256_COORDINATE_BYTES)
                    .ok_or_else(|| error::decode("ECC y coordinate too long", None))?);

                let ec_key = ec_key_from_raw_point(Nid::X9_62_PRIME256V1, &xy).map_err(map_err)?;

                PKey::from_ec_key(ec_key).map_err(map_err)
            }
        }
    }

    /// Builds the public area of an attestation key from an OpenSSL key.
    pub fn from_pkey<T: HasPublic>(pkey: &PKeyRef<T>) -> Result<Self> {
        let map_err = |e| error::conversion(e, Some("unsupported attestation key".into()));

        let key = if let Ok(rsa) = pkey.rsa() {
            let exponent = rsa.e().to_vec();
            let exponent = exponent.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32);

            AkPublicKey::Rsa {
                modulus: rsa.n().to_vec(),
                exponent: if exponent == RSA_DEFAULT_EXPONENT { 0 } else { exponent },
            }
        } else {
            let ec_key = pkey.ec_key().map_err(map_err)?;
            let mut ctx = BigNumContext::new().map_err(map_err)?;
            let mut x = BigNum::new().map_err(map_err)?;
            let mut y = BigNum::new().map_err(map_err)?;
            ec_key.public_key()
                .affine_coordinates_gfp(ec_key.group(), &mut x, &mut y, &mut ctx)
                .map_err(map_err)?;

            AkPublicKey::Ecc {
                x: x.to_vec_padded(P256_COORDINATE_BYTES as i32).map_err(map_err)?,
                y: y.to_vec_padded(P256_COORDINATE_BYTES as i32).map_err(map_err)?,
            }
        };

        Ok(Self {
            name_alg: TPM_ALG_SHA256,
            object_attributes: AK_OBJECT_ATTRIBUTES,
            key,
        })
    }
}

fn expect_scheme(rdr: &mut impl Read, scheme: u16) -> Result<()> {
    let got = rdr.read_u16::<BigEndian>().map_err(error::map_decode_err)?;
    let hash = rdr.read_u16::<BigEndian>().map_err(error::map_decode_err)?;

    if got != scheme || hash != TPM_ALG_SHA256 {
        return Err(error::decode(
            format!("unexpected signing scheme 0x{:04x}/0x{:04x}", got, hash), None));
    }

    Ok(())
}

/// One bank of a TPML_PCR_SELECTION.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PcrSelection {
    pub hash_alg: u16,
    pub pcrs: Vec<u32>,
}

impl PcrSelection {
    pub fn sha256(pcrs: impl IntoIterator<Item = u32>) -> Self {
        let mut pcrs: Vec<u32> = pcrs.into_iter().collect();
        pcrs.sort_unstable();
        pcrs.dedup();

        Self { hash_alg: TPM_ALG_SHA256, pcrs }
    }

    fn from_reader(rdr: &mut impl Read) -> Result<Self> {
        let hash_alg = rdr.read_u16::<BigEndian>().map_err(error::map_decode_err)?;
        let size = rdr.read_u8().map_err(error::map_decode_err)?;
        let mut bitmap = vec![0; size as usize];
        rdr.read_exact(&mut bitmap).map_err(error::map_decode_err)?;

        let pcrs = bitmap.iter().enumerate()
            .flat_map(|(i, byte)| (0..8)
                .filter(move |bit| byte & (1 << bit) != 0)
                .map(move |bit| (i * 8 + bit) as u32))
            .collect();

        Ok(Self { hash_alg, pcrs })
    }

    fn write(&self, wtr: &mut impl Write) -> Result<()> {
        let mut bitmap = [0u8; PCR_SELECT_BYTES];
        for pcr in &self.pcrs {
            let byte = bitmap.get_mut(*pcr as usize / 8)
                .ok_or_else(|| error::invalid_argument(format!("PCR {} out of range", pcr)))?;
            *byte |= 1 << (pcr % 8);
        }

        wtr.write_u16::<BigEndian>(self.hash_alg).map_err(error::map_io_err)?;
        wtr.write_u8(PCR_SELECT_BYTES as u8).map_err(error::map_io_err)?;
        wtr.write_all(&bitmap).map_err(error::map_io_err)
    }
}

/// Digest over the concatenation of the selected PCR values, in index order.
pub fn pcr_digest<'a>(values: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let concatenated: Vec<u8> = values.into_iter().flatten().copied().collect();
    sha256(concatenated).to_vec()
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
}

/// Quote body (TPMS_ATTEST with TPMS_QUOTE_INFO).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QuoteInfo {
    pub magic: u32,
    pub attest_type: u16,
    pub qualified_signer: Vec<u8>,
    /// Caller nonce.
    pub extra_data: Vec<u8>,
    pub clock_info: ClockInfo,
    pub firmware_version: u64,
    pub pcr_selections: Vec<PcrSelection>,
    pub pcr_digest: Vec<u8>,
}

impl QuoteInfo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut rdr = Cursor::new(bytes);

        let magic = rdr.read_u32::<BigEndian>().map_err(error::map_decode_err)?;
        let attest_type = rdr.read_u16::<BigEndian>().map_err(error::map_decode_err)?;
        let qualified_signer = read_tpm2b(&mut rdr)?;
        let extra_data = read_tpm2b(&mut rdr)?;
        let clock_info = ClockInfo {
            clock: rdr.read_u64::<BigEndian>().map_err(error::map_decode_err)?,
            reset_count: rdr.read_u32::<BigEndian>().map_err(error::map_decode_err)?,
            restart_count: rdr.read_u32::<BigEndian>().map_err(error::map_decode_err)?,
            safe: rdr.read_u8().map_err(error::map_decode_err)? != 0,
        };
        let firmware_version = rdr.read_u64::<BigEndian>().map_err(error::map_decode_err)?;

        let count = rdr.read_u32::<BigEndian>().map_err(error::map_decode_err)?;
        let mut pcr_selections = Vec::new();
        for _ in 0..count {
            pcr_selections.push(PcrSelection::from_reader(&mut rdr)?);
        }
        let pcr_digest = read_tpm2b(&mut rdr)?;

        Ok(Self {
            magic,
            attest_type,
            qualified_signer,
            extra_data,
            clock_info,
            firmware_version,
            pcr_selections,
            pcr_digest,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        out.write_u32::<BigEndian>(self.magic).map_err(error::map_io_err)?;
        out.write_u16::<BigEndian>(self.attest_type).map_err(error::map_io_err)?;
        write_tpm2b(&mut out, &self.qualified_signer)?;
        write_tpm2b(&mut out, &self.extra_data)?;
        out.write_u64::<BigEndian>(self.clock_info.clock).map_err(error::map_io_err)?;
        out.write_u32::<BigEndian>(self.clock_info.reset_count).map_err(error::map_io_err)?;
        out.write_u32::<BigEndian>(self.clock_info.restart_count).map_err(error::map_io_err)?;
        out.write_u8(self.clock_info.safe as u8).map_err(error::map_io_err)?;
        out.write_u64::<BigEndian>(self.firmware_version).map_err(error::map_io_err)?;
        out.write_u32::<BigEndian>(self.pcr_selections.len() as u32).map_err(error::map_io_err)?;
        for selection in &self.pcr_selections {
            selection.write(&mut out)?;
        }
        write_tpm2b(&mut out, &self.pcr_digest)?;

        Ok(out)
    }
}

/// Quote signature (TPMT_SIGNATURE), SHA-256 schemes only.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TpmSignature {
    RsaSsa { sig: Vec<u8> },
    Ecdsa { r: Vec<u8>, s: Vec<u8> },
}

impl TpmSignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut rdr = Cursor::new(bytes);

        let sig_alg = rdr.read_u16::<BigEndian>().map_err(error::map_decode_err)?;
        let hash_alg = rdr.read_u16::<BigEndian>().map_err(error::map_decode_err)?;
        if hash_alg != TPM_ALG_SHA256 {
            return Err(error::decode(format!("unsupported signature hash 0x{:04x}", hash_alg), None));
        }

        match sig_alg {
            TPM_ALG_RSASSA => Ok(TpmSignature::RsaSsa { sig: read_tpm2b(&mut rdr)? }),
            TPM_ALG_ECDSA => Ok(TpmSignature::Ecdsa {
                r: read_tpm2b(&mut rdr)?,
                s: read_tpm2b(&mut rdr)?,
            }),
            _ => Err(error::decode(format!("unsupported signature algorithm 0x{:04x}", sig_alg), None)),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        match self {
            TpmSignature::RsaSsa { sig } => {
                out.write_u16::<BigEndian>(TPM_ALG_RSASSA).map_err(error::map_io_err)?;
                out.write_u16::<BigEndian>(TPM_ALG_SHA256).map_err(error::map_io_err)?;
                write_tpm2b(&mut out, sig)?;
            }
            TpmSignature::Ecdsa { r, s } => {
                out.write_u16::<BigEndian>(TPM_ALG_ECDSA).map_err(error::map_io_err)?;
                out.write_u16::<BigEndian>(TPM_ALG_SHA256).map_err(error::map_io_err)?;
                write_tpm2b(&mut out, r)?;
                write_tpm2b(&mut out, s)?;
            }
        }

        Ok(out)
    }

    /// Returns whether the signature over `message` verifies under `key`.
    pub fn verify(&self, key: &PKey<Public>, message: &[u8]) -> Result<bool> {
        let map_err = |e| error::verification(format!("quote signature check failed: {}", e));

        match self {
            TpmSignature::RsaSsa { sig } => {
                if key.id() != Id::RSA {
                    return Err(error::verification("RSASSA signature with a non-RSA key"));
                }
                let mut verifier = Verifier::new(MessageDigest::sha256(), key).map_err(map_err)?;
                verifier.update(message).map_err(map_err)?;

                Ok(verifier.verify(sig).unwrap_or(false))
            }
            TpmSignature::Ecdsa { r, s } => {
                let ec_key: EcKey<Public> = key.ec_key()
                    .map_err(|_| error::verification("ECDSA signature with a non-ECC key"))?;
                let sig = ecdsa_sig_from_be(r, s).map_err(map_err)?;

                Ok(sig.verify(&sha256(message), &ec_key).unwrap_or(false))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use openssl::ec::{EcGroup, EcKey};
    use openssl::nid::Nid;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;

    use crate::error::Kind;
    use crate::options::KeyAlgo;

    use super::{AkPublic, AkPublicKey, ClockInfo, PcrSelection, QuoteInfo, TpmSignature,
                TPM_GENERATED_VALUE, TPM_ST_ATTEST_QUOTE};

    #[test]
    fn ak_public_rsa_layout() {
        let rsa = Rsa::generate(2048).unwrap();
        let pkey = PKey::from_rsa(rsa).unwrap();

        let public = AkPublic::from_pkey(&pkey).unwrap();
        let bytes = public.to_bytes().unwrap();

        // type, nameAlg, attributes
        assert_eq!(&bytes[..8], &[0x00, 0x01, 0x00, 0x0b, 0x00, 0x05, 0x00, 0x72]);
        assert_eq!(AkPublic::from_bytes(&bytes).unwrap(), public);

        let decoded = public.to_pkey().unwrap();
        assert!(decoded.public_eq(&pkey));
    }

    #[test]
    fn ak_public_ecc_to_pkey() {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let pkey = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

        let public = AkPublic::from_pkey(&pkey).unwrap();

        match &public.key {
            AkPublicKey::Ecc { x, y } => {
                assert_eq!(x.len(), 32);
                assert_eq!(y.len(), 32);
            }
            other => panic!("expected ECC key, got {:?}", other),
        }

        let bytes = public.to_bytes().unwrap();
        assert!(AkPublic::from_bytes(&bytes).unwrap().to_pkey().unwrap().public_eq(&pkey));
    }

    #[test]
    fn default_templates() {
        let rsa = AkPublic::template(KeyAlgo::Rsa).to_bytes().unwrap();
        // TPM_ALG_RSA, SHA-256, restricted signing attributes, empty policy
        assert_eq!(&rsa[..10], &[0x00, 0x01, 0x00, 0x0b, 0x00, 0x05, 0x00, 0x72, 0x00, 0x00]);
        assert_eq!(rsa.len(), 24 + 256);

        let ecc = AkPublic::template(KeyAlgo::Ecc);
        assert_eq!(AkPublic::from_bytes(&ecc.to_bytes().unwrap()).unwrap(), ecc);
    }

    #[test]
    fn ak_public_malformed() {
        assert_eq!(AkPublic::from_bytes(&[0x00, 0x01, 0x00]).unwrap_err().kind(), Kind::Decode);
        // keyedHash objects cannot sign quotes
        assert_eq!(AkPublic::from_bytes(&[0x00, 0x08, 0x00, 0x0b, 0, 0, 0, 0, 0, 0, 0x00, 0x10])
                       .unwrap_err().kind(), Kind::Decode);
    }

    #[test]
    fn quote_info_parses_selection_bitmap() {
        let info = QuoteInfo {
            magic: TPM_GENERATED_VALUE,
            attest_type: TPM_ST_ATTEST_QUOTE,
            qualified_signer: vec![],
            extra_data: b"nonce".to_vec(),
            clock_info: ClockInfo { clock: 10, reset_count: 1, restart_count: 0, safe: true },
            firmware_version: 0x2020_0101,
            pcr_selections: vec![PcrSelection::sha256([7, 0, 9, 23])],
            pcr_digest: vec![0xab; 32],
        };

        let bytes = info.to_bytes().unwrap();
        let decoded = QuoteInfo::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.pcr_selections[0].pcrs, vec![0, 7, 9, 23]);
        assert_eq!(decoded, info);
    }

    #[test]
    fn pcr_out_of_range() {
        let info = QuoteInfo {
            magic: TPM_GENERATED_VALUE,
            attest_type: TPM_ST_ATTEST_QUOTE,
            qualified_signer: vec![],
            extra_data: vec![],
            clock_info: ClockInfo::default(),
            firmware_version: 0,
            pcr_selections: vec![PcrSelection::sha256([24])],
            pcr_digest: vec![],
        };

        assert_eq!(info.to_bytes().unwrap_err().kind(), Kind::InvalidArgument);
    }

    #[test]
    fn signature_rejects_wrong_key_type() {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let ec = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        let ec_public = PKey::public_key_from_der(&ec.public_key_to_der().unwrap()).unwrap();

        let sig = TpmSignature::RsaSsa { sig: vec![0; 256] };
        let decoded = TpmSignature::from_bytes(&sig.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, sig);
        assert_eq!(decoded.verify(&ec_public, b"msg").unwrap_err().kind(), Kind::Verification);
    }
}
