use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;

use crate::common::binary::{bin_vec_reverse_bytes, fmt_bin_vec_to_hex, read_exact_to_bin_vec};
use crate::common::hash::sha384;
use crate::error::{self, Result};

const POLICY_DEBUG_SHIFT: u64 = 19;
const POLICY_MIGRATE_MA_SHIFT: u64 = 18;
const POLICY_SMT_SHIFT: u64 = 16;

const POLICY_DEBUG_MASK: u64 = 1 << (POLICY_DEBUG_SHIFT);
const POLICY_MIGRATE_MA_MASK: u64 = 1 << (POLICY_MIGRATE_MA_SHIFT);
const POLICY_SMT_MASK: u64 = 1 << (POLICY_SMT_SHIFT);

pub const SIG_ALGO_ECDSA_P384_SHA384: u32 = 0x1;

pub const REPORT_BYTES: usize = 0x4A0;
/// Bytes covered by the report signature.
pub const SIGNED_BYTES: usize = 0x2A0;

const SIGNATURE_COMPONENT_BYTES: usize = 72;
const SIGNATURE_RESERVED_BYTES: usize = 512 - 2 * SIGNATURE_COMPONENT_BYTES;

/*
reference: https://github.com/AMDESE/sev-guest/blob/main/include/attestation.h

struct attestation_report {
	uint32_t          version;			/* 0x000 */
	uint32_t          guest_svn;			/* 0x004 */
	uint64_t          policy;			/* 0x008 */
	uint8_t           family_id[16];		/* 0x010 */
	uint8_t           image_id[16];			/* 0x020 */
	uint32_t          vmpl;				/* 0x030 */
	uint32_t          signature_algo;		/* 0x034 */
	union tcb_version platform_version;		/* 0x038 */
	uint64_t          platform_info;		/* 0x040 */
	uint32_t          flags;			/* 0x048 */
	uint32_t          reserved0;			/* 0x04C */
	uint8_t           report_data[64];		/* 0x050 */
	uint8_t           measurement[48];		/* 0x090 */
	uint8_t           host_data[32];		/* 0x0C0 */
	uint8_t           id_key_digest[48];		/* 0x0E0 */
	uint8_t           author_key_digest[48];	/* 0x110 */
	uint8_t           report_id[32];		/* 0x140 */
	uint8_t           report_id_ma[32];		/* 0x160 */
	union tcb_version reported_tcb;			/* 0x180 */
	uint8_t           reserved1[24];		/* 0x188 */
	uint8_t           chip_id[64];			/* 0x1A0 */
	union tcb_version committed_tcb;		/* 0x1E0 */
	struct build      current_build;		/* 0x1E8 */
	struct build      committed_build;		/* 0x1EC */
	union tcb_version launch_tcb;			/* 0x1F0 */
	uint8_t           reserved2[168];		/* 0x1F8 */
	struct signature  signature;			/* 0x2A0 */
};
 */

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TcbVersion {
    pub boot_loader: u8,
    pub tee: u8,
    pub reserved: [u8; 4],
    pub snp: u8,
    pub microcode: u8,
}

impl TcbVersion {
    fn from_reader(mut rdr: impl Read) -> Result<Self> {
        let boot_loader = rdr.read_u8().map_err(error::map_decode_err)?;
        let tee = rdr.read_u8().map_err(error::map_decode_err)?;
        let mut reserved = [0; 4];
        rdr.read_exact(&mut reserved).map_err(error::map_decode_err)?;
        let snp = rdr.read_u8().map_err(error::map_decode_err)?;
        let microcode = rdr.read_u8().map_err(error::map_decode_err)?;

        Ok(TcbVersion { boot_loader, tee, reserved, snp, microcode })
    }

    fn write(&self, wtr: &mut impl Write) -> std::io::Result<()> {
        wtr.write_all(&[self.boot_loader, self.tee])?;
        wtr.write_all(&self.reserved)?;
        wtr.write_all(&[self.snp, self.microcode])
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BuildVersion {
    pub build: u8,
    pub minor: u8,
    pub major: u8,
    pub reserved: u8,
}

impl BuildVersion {
    fn from_reader(mut rdr: impl Read) -> Result<Self> {
        let mut raw = [0; 4];
        rdr.read_exact(&mut raw).map_err(error::map_decode_err)?;

        Ok(BuildVersion { build: raw[0], minor: raw[1], major: raw[2], reserved: raw[3] })
    }

    fn write(&self, wtr: &mut impl Write) -> std::io::Result<()> {
        wtr.write_all(&[self.build, self.minor, self.major, self.reserved])
    }
}

/// ECDSA P-384 signature with little-endian, zero-extended components.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Signature {
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

impl Signature {
    fn from_reader(mut rdr: impl Read) -> Result<Self> {
        let r = read_exact_to_bin_vec(&mut rdr, SIGNATURE_COMPONENT_BYTES)?;
        let s = read_exact_to_bin_vec(&mut rdr, SIGNATURE_COMPONENT_BYTES)?;
        let _reserved = read_exact_to_bin_vec(&mut rdr, SIGNATURE_RESERVED_BYTES)?;

        Ok(Signature { r, s })
    }

    /// Builds the report signature from an OpenSSL signature.
    pub fn from_ecdsa_sig(sig: &EcdsaSig) -> std::result::Result<Self, ErrorStack> {
        let component = |value: &openssl::bn::BigNumRef| -> std::result::Result<Vec<u8>, ErrorStack> {
            Ok(bin_vec_reverse_bytes(&value.to_vec_padded(SIGNATURE_COMPONENT_BYTES as i32)?))
        };

        Ok(Signature { r: component(sig.r())?, s: component(sig.s())? })
    }

    pub fn to_ecdsa_sig(&self) -> std::result::Result<EcdsaSig, ErrorStack> {
        let r = BigNum::from_slice(&bin_vec_reverse_bytes(&self.r))?;
        let s = BigNum::from_slice(&bin_vec_reverse_bytes(&self.s))?;

        EcdsaSig::from_private_components(r, s)
    }

    pub fn r_hex(&self) -> String {
        fmt_bin_vec_to_hex(self.r.as_ref())
    }

    pub fn s_hex(&self) -> String {
        fmt_bin_vec_to_hex(self.s.as_ref())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttestationReport {
    pub version: u32,
    pub guest_svn: u32,
    pub policy: u64,
    pub family_id: Vec<u8>,
    pub image_id: Vec<u8>,
    pub vmpl: u32,
    pub signature_algo: u32,
    pub platform_version: TcbVersion,
    pub platform_info: u64,
    pub flags: u32,
    pub report_data: Vec<u8>,
    pub measurement: Vec<u8>,
    pub host_data: Vec<u8>,
    pub id_key_digest: Vec<u8>,
    pub author_key_digest: Vec<u8>,
    pub report_id: Vec<u8>,
    pub report_id_ma: Vec<u8>,
    pub reported_tcb: TcbVersion,
    pub chip_id: Vec<u8>,
    pub committed_tcb: TcbVersion,
    pub current_build: BuildVersion,
    pub committed_build: BuildVersion,
    pub launch_tcb: TcbVersion,
    pub signature: Signature,
}

impl AttestationReport {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != REPORT_BYTES {
            return Err(error::decode(format!("expected {} bytes, got {}", REPORT_BYTES, bytes.len()),
                                     Some("invalid SEV-SNP attestation report".into())));
        }

        Self::from_reader(Cursor::new(bytes))
    }

    pub fn from_reader(mut rdr: impl Read) -> Result<Self> {
        let version = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;
        let guest_svn = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;
        let policy = rdr.read_u64::<LittleEndian>().map_err(error::map_decode_err)?;
        let family_id = read_exact_to_bin_vec(&mut rdr, 16)?;
        let image_id = read_exact_to_bin_vec(&mut rdr, 16)?;
        let vmpl = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;
        let signature_algo = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;
        let platform_version = TcbVersion::from_reader(&mut rdr)?;
        let platform_info = rdr.read_u64::<LittleEndian>().map_err(error::map_decode_err)?;
        let flags = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;
        let _reserved0 = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;
        let report_data = read_exact_to_bin_vec(&mut rdr, 64)?;
        let measurement = read_exact_to_bin_vec(&mut rdr, 48)?;
        let host_data = read_exact_to_bin_vec(&mut rdr, 32)?;
        let id_key_digest = read_exact_to_bin_vec(&mut rdr, 48)?;
        let author_key_digest = read_exact_to_bin_vec(&mut rdr, 48)?;
        let report_id = read_exact_to_bin_vec(&mut rdr, 32)?;
        let report_id_ma = read_exact_to_bin_vec(&mut rdr, 32)?;
        let reported_tcb = TcbVersion::from_reader(&mut rdr)?;
        let _reserved1 = read_exact_to_bin_vec(&mut rdr, 24)?;
        let chip_id = read_exact_to_bin_vec(&mut rdr, 64)?;
        let committed_tcb = TcbVersion::from_reader(&mut rdr)?;
        let current_build = BuildVersion::from_reader(&mut rdr)?;
        let committed_build = BuildVersion::from_reader(&mut rdr)?;
        let launch_tcb = TcbVersion::from_reader(&mut rdr)?;
        let _reserved2 = read_exact_to_bin_vec(&mut rdr, 168)?;
        let signature = Signature::from_reader(&mut rdr)?;

        Ok(AttestationReport {
            version,
            guest_svn,
            policy,
            family_id,
            image_id,
            vmpl,
            signature_algo,
            platform_version,
            platform_info,
            flags,
            report_data,
            measurement,
            host_data,
            id_key_digest,
            author_key_digest,
            report_id,
            report_id_ma,
            reported_tcb,
            chip_id,
            committed_tcb,
            current_build,
            committed_build,
            launch_tcb,
            signature,
        })
    }

    /// Serializes the report; reserved fields are zero.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(REPORT_BYTES);
        self.write(&mut out).map_err(error::map_io_err)?;

        if out.len() != REPORT_BYTES {
            return Err(error::conversion(format!("report serialized to {} bytes", out.len()),
                                         Some("report field has an invalid length".into())));
        }

        Ok(out)
    }

    fn write(&self, out: &mut Vec<u8>) -> std::io::Result<()> {
        out.write_u32::<LittleEndian>(self.version)?;
        out.write_u32::<LittleEndian>(self.guest_svn)?;
        out.write_u64::<LittleEndian>(self.policy)?;
        out.write_all(&self.family_id)?;
        out.write_all(&self.image_id)?;
        out.write_u32::<LittleEndian>(self.vmpl)?;
        out.write_u32::<LittleEndian>(self.signature_algo)?;
        self.platform_version.write(out)?;
        out.write_u64::<LittleEndian>(self.platform_info)?;
        out.write_u32::<LittleEndian>(self.flags)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_all(&self.report_data)?;
        out.write_all(&self.measurement)?;
        out.write_all(&self.host_data)?;
        out.write_all(&self.id_key_digest)?;
        out.write_all(&self.author_key_digest)?;
        out.write_all(&self.report_id)?;
        out.write_all(&self.report_id_ma)?;
        self.reported_tcb.write(out)?;
        out.write_all(&[0; 24])?;
        out.write_all(&self.chip_id)?;
        self.committed_tcb.write(out)?;
        self.current_build.write(out)?;
        self.committed_build.write(out)?;
        self.launch_tcb.write(out)?;
        out.write_all(&[0; 168])?;
        out.write_all(&self.signature.r)?;
        out.write_all(&self.signature.s)?;
        out.write_all(&[0; SIGNATURE_RESERVED_BYTES])
    }

    /// SHA-384 over the signed portion of a raw report.
    pub fn signed_digest(raw: &[u8]) -> Result<Vec<u8>> {
        let signed = raw.get(..SIGNED_BYTES)
            .ok_or_else(|| error::decode("report shorter than its signed portion", None))?;

        Ok(sha384(signed).to_vec())
    }

    pub fn policy_debug_allowed(&self) -> bool {
        self.policy & POLICY_DEBUG_MASK > 0
    }

    pub fn policy_ma_allowed(&self) -> bool {
        self.policy & POLICY_MIGRATE_MA_MASK > 0
    }

    pub fn policy_smt_allowed(&self) -> bool {
        self.policy & POLICY_SMT_MASK > 0
    }

    pub fn signature_algo_is_ecdsa_p384_sha384(&self) -> bool {
        self.signature_algo == SIG_ALGO_ECDSA_P384_SHA384
    }

    pub fn report_data_hex(&self) -> String {
        fmt_bin_vec_to_hex(self.report_data.as_ref())
    }

    pub fn measurement_hex(&self) -> String {
        fmt_bin_vec_to_hex(self.measurement.as_ref())
    }

    pub fn chip_id_hex(&self) -> String {
        fmt_bin_vec_to_hex(self.chip_id.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use openssl::bn::BigNum;
    use openssl::ecdsa::EcdsaSig;

    use crate::error::Kind;

    use super::{AttestationReport, BuildVersion, Signature, TcbVersion, REPORT_BYTES};

    fn sample() -> AttestationReport {
        let tcb = TcbVersion { boot_loader: 2, tee: 0, reserved: [0; 4], snp: 6, microcode: 115 };

        AttestationReport {
            version: 2,
            guest_svn: 0,
            policy: 0x30000,
            family_id: vec![0; 16],
            image_id: vec![0; 16],
            vmpl: 0,
            signature_algo: 1,
            platform_version: tcb,
            platform_info: 0x1,
            flags: 0,
            report_data: vec![0xe1; 64],
            measurement: vec![0x76; 48],
            host_data: vec![0; 32],
            id_key_digest: vec![0; 48],
            author_key_digest: vec![0; 48],
            report_id: vec![0xd1; 32],
            report_id_ma: vec![0xff; 32],
            reported_tcb: TcbVersion { snp: 5, ..tcb },
            chip_id: vec![0x9e; 64],
            committed_tcb: TcbVersion { snp: 5, ..tcb },
            current_build: BuildVersion { build: 3, minor: 51, major: 1, reserved: 0 },
            committed_build: BuildVersion { build: 6, minor: 49, major: 1, reserved: 0 },
            launch_tcb: TcbVersion { snp: 5, ..tcb },
            signature: Signature { r: vec![0xad; 72], s: vec![0x02; 72] },
        }
    }

    #[test]
    fn report_layout() {
        let report = sample();
        let bytes = report.to_bytes().unwrap();

        assert_eq!(bytes.len(), REPORT_BYTES);
        assert_eq!(&bytes[0x50..0x90], &[0xe1; 64][..]);
        assert_eq!(&bytes[0x1A0..0x1E0], &[0x9e; 64][..]);
        assert_eq!(bytes[0x180 + 6], 5);
        assert_eq!(&bytes[0x2A0..0x2A0 + 72], &[0xad; 72][..]);

        let parsed = AttestationReport::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, report);
        assert!(parsed.policy_smt_allowed());
        assert!(!parsed.policy_debug_allowed());
        assert!(!parsed.policy_ma_allowed());
        assert!(parsed.signature_algo_is_ecdsa_p384_sha384());
    }

    #[test]
    fn report_wrong_size() {
        let err = AttestationReport::from_bytes(&[0; 1000]).unwrap_err();

        assert_eq!(err.kind(), Kind::Decode);
    }

    #[test]
    fn signature_components_are_little_endian() {
        let sig = EcdsaSig::from_private_components(
            BigNum::from_u32(0x0102).unwrap(), BigNum::from_u32(0x0304).unwrap()).unwrap();

        let report_sig = Signature::from_ecdsa_sig(&sig).unwrap();

        assert_eq!(&report_sig.r[..2], &[0x02, 0x01]);
        assert!(report_sig.r[2..].iter().all(|b| *b == 0));
        assert_eq!(report_sig.s_hex()[..4].to_string(), "0403");

        let back = report_sig.to_ecdsa_sig().unwrap();
        assert_eq!(back.r().to_vec(), vec![0x01, 0x02]);
        assert_eq!(back.s().to_vec(), vec![0x03, 0x04]);
    }
}
