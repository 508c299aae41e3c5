//! Intel TDX version 4 quotes.
//!
//! ```text
//! header (48) | td report body (584) | signed data size (4) | signed data
//! signed data = signature (64) | attestation key (64) | certification data
//! certification data (type 6) = qe report (384) | qe report signature (64)
//!                               | qe auth data | certification data (type 5, PEM)
//! ```

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::common::binary::read_exact_to_bin_vec;
use crate::error::{self, Result};

pub const QUOTE_VERSION_4: u16 = 4;
pub const ATTESTATION_KEY_TYPE_ECDSA_P256: u16 = 2;
pub const TEE_TYPE_TDX: u32 = 0x81;

pub const HEADER_BYTES: usize = 48;
pub const TD_REPORT_BODY_BYTES: usize = 584;
pub const QE_REPORT_BYTES: usize = 384;
/// Offset of report data inside the QE (SGX) report body.
pub const QE_REPORT_DATA_OFFSET: usize = 320;

const SIGNATURE_BYTES: usize = 64;
const ATTESTATION_KEY_BYTES: usize = 64;
const MEASUREMENT_BYTES: usize = 48;

pub const CERT_DATA_TYPE_PCK_CHAIN: u16 = 5;
pub const CERT_DATA_TYPE_QE_REPORT: u16 = 6;

/// Intel's QE vendor id.
pub const INTEL_QE_VENDOR_ID: [u8; 16] = [
    0x93, 0x9a, 0x72, 0x33, 0xf7, 0x9c, 0x4c, 0xa9, 0x94, 0x0a, 0x0d, 0xb3, 0x95, 0x7f, 0x06, 0x07,
];

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QuoteHeader {
    pub version: u16,
    pub attestation_key_type: u16,
    pub tee_type: u32,
    pub qe_svn: u16,
    pub pce_svn: u16,
    pub qe_vendor_id: [u8; 16],
    pub user_data: [u8; 20],
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TdReportBody {
    pub tee_tcb_svn: [u8; 16],
    pub mr_seam: Vec<u8>,
    pub mr_signer_seam: Vec<u8>,
    pub seam_attributes: u64,
    pub td_attributes: u64,
    pub xfam: u64,
    pub mr_td: Vec<u8>,
    pub mr_config_id: Vec<u8>,
    pub mr_owner: Vec<u8>,
    pub mr_owner_config: Vec<u8>,
    pub rtmrs: [Vec<u8>; 4],
    pub report_data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QuoteV4 {
    pub header: QuoteHeader,
    pub body: TdReportBody,
    /// ECDSA P-256 `r || s` over header and body.
    pub signature: Vec<u8>,
    /// Raw P-256 `x || y` attestation key.
    pub attestation_key: Vec<u8>,
    pub qe_report: Vec<u8>,
    pub qe_report_signature: Vec<u8>,
    pub qe_auth_data: Vec<u8>,
    /// Concatenated PEM certificates: PCK, intermediate, root.
    pub pck_chain: Vec<u8>,
}

fn read_array<const N: usize>(rdr: &mut impl Read) -> Result<[u8; N]> {
    let mut out = [0; N];
    rdr.read_exact(&mut out).map_err(error::map_decode_err)?;
    Ok(out)
}

impl QuoteHeader {
    fn from_reader(rdr: &mut impl Read) -> Result<Self> {
        Ok(Self {
            version: rdr.read_u16::<LittleEndian>().map_err(error::map_decode_err)?,
            attestation_key_type: rdr.read_u16::<LittleEndian>().map_err(error::map_decode_err)?,
            tee_type: rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?,
            qe_svn: rdr.read_u16::<LittleEndian>().map_err(error::map_decode_err)?,
            pce_svn: rdr.read_u16::<LittleEndian>().map_err(error::map_decode_err)?,
            qe_vendor_id: read_array(rdr)?,
            user_data: read_array(rdr)?,
        })
    }

    fn write(&self, wtr: &mut impl Write) -> std::io::Result<()> {
        wtr.write_u16::<LittleEndian>(self.version)?;
        wtr.write_u16::<LittleEndian>(self.attestation_key_type)?;
        wtr.write_u32::<LittleEndian>(self.tee_type)?;
        wtr.write_u16::<LittleEndian>(self.qe_svn)?;
        wtr.write_u16::<LittleEndian>(self.pce_svn)?;
        wtr.write_all(&self.qe_vendor_id)?;
        wtr.write_all(&self.user_data)
    }
}

impl TdReportBody {
    fn from_reader(rdr: &mut impl Read) -> Result<Self> {
        Ok(Self {
            tee_tcb_svn: read_array(rdr)?,
            mr_seam: read_exact_to_bin_vec(rdr, MEASUREMENT_BYTES)?,
            mr_signer_seam: read_exact_to_bin_vec(rdr, MEASUREMENT_BYTES)?,
            seam_attributes: rdr.read_u64::<LittleEndian>().map_err(error::map_decode_err)?,
            td_attributes: rdr.read_u64::<LittleEndian>().map_err(error::map_decode_err)?,
            xfam: rdr.read_u64::<LittleEndian>().map_err(error::map_decode_err)?,
            mr_td: read_exact_to_bin_vec(rdr, MEASUREMENT_BYTES)?,
            mr_config_id: read_exact_to_bin_vec(rdr, MEASUREMENT_BYTES)?,
            mr_owner: read_exact_to_bin_vec(rdr, MEASUREMENT_BYTES)?,
            mr_owner_config: read_exact_to_bin_vec(rdr, MEASUREMENT_BYTES)?,
            rtmrs: [
                read_exact_to_bin_vec(rdr, MEASUREMENT_BYTES)?,
                read_exact_to_bin_vec(rdr, MEASUREMENT_BYTES)?,
                read_exact_to_bin_vec(rdr, MEASUREMENT_BYTES)?,
                read_exact_to_bin_vec(rdr, MEASUREMENT_BYTES)?,
            ],
            report_data: read_exact_to_bin_vec(rdr, 64)?,
        })
    }

    fn write(&self, wtr: &mut impl Write) -> std::io::Result<()> {
        wtr.write_all(&self.tee_tcb_svn)?;
        wtr.write_all(&self.mr_seam)?;
        wtr.write_all(&self.mr_signer_seam)?;
        wtr.write_u64::<LittleEndian>(self.seam_attributes)?;
        wtr.write_u64::<LittleEndian>(self.td_attributes)?;
        wtr.write_u64::<LittleEndian>(self.xfam)?;
        wtr.write_all(&self.mr_td)?;
        wtr.write_all(&self.mr_config_id)?;
        wtr.write_all(&self.mr_owner)?;
        wtr.write_all(&self.mr_owner_config)?;
        for rtmr in &self.rtmrs {
            wtr.write_all(rtmr)?;
        }
        wtr.write_all(&self.report_data)
    }
}

impl QuoteV4 {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut rdr = Cursor::new(bytes);

        let header = QuoteHeader::from_reader(&mut rdr)?;
        if header.version != QUOTE_VERSION_4 {
            return Err(error::decode(format!("quote version {}", header.version),
                                     Some("only version 4 TD quotes are supported".into())));
        }
        let body = TdReportBody::from_reader(&mut rdr)?;

        let signed_data_size = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;
        let signed_data = read_exact_to_bin_vec(&mut rdr, signed_data_size as usize)?;
        let mut rdr = Cursor::new(signed_data.as_slice());

        let signature = read_exact_to_bin_vec(&mut rdr, SIGNATURE_BYTES)?;
        let attestation_key = read_exact_to_bin_vec(&mut rdr, ATTESTATION_KEY_BYTES)?;

        let qe_cert_data = read_certification_data(&mut rdr, CERT_DATA_TYPE_QE_REPORT)?;
        let mut rdr = Cursor::new(qe_cert_data.as_slice());

        let qe_report = read_exact_to_bin_vec(&mut rdr, QE_REPORT_BYTES)?;
        let qe_report_signature = read_exact_to_bin_vec(&mut rdr, SIGNATURE_BYTES)?;
        let auth_size = rdr.read_u16::<LittleEndian>().map_err(error::map_decode_err)?;
        let qe_auth_data = read_exact_to_bin_vec(&mut rdr, auth_size as usize)?;
        let pck_chain = read_certification_data(&mut rdr, CERT_DATA_TYPE_PCK_CHAIN)?;

        Ok(Self {
            header,
            body,
            signature,
            attestation_key,
            qe_report,
            qe_report_signature,
            qe_auth_data,
            pck_chain,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut inner = Vec::new();
        inner.write_all(&self.qe_report).map_err(error::map_io_err)?;
        inner.write_all(&self.qe_report_signature).map_err(error::map_io_err)?;
        inner.write_u16::<LittleEndian>(self.qe_auth_data.len() as u16).map_err(error::map_io_err)?;
        inner.write_all(&self.qe_auth_data).map_err(error::map_io_err)?;
        write_certification_data(&mut inner, CERT_DATA_TYPE_PCK_CHAIN, &self.pck_chain)?;

        let mut signed_data = Vec::new();
        signed_data.write_all(&self.signature).map_err(error::map_io_err)?;
        signed_data.write_all(&self.attestation_key).map_err(error::map_io_err)?;
        write_certification_data(&mut signed_data, CERT_DATA_TYPE_QE_REPORT, &inner)?;

        let mut out = self.signed_message()?;
        out.write_u32::<LittleEndian>(signed_data.len() as u32).map_err(error::map_io_err)?;
        out.write_all(&signed_data).map_err(error::map_io_err)?;

        Ok(out)
    }

    /// Header and TD report body, the bytes covered by the quote signature.
    pub fn signed_message(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_BYTES + TD_REPORT_BODY_BYTES);
        self.header.write(&mut out).map_err(error::map_io_err)?;
        self.body.write(&mut out).map_err(error::map_io_err)?;

        if out.len() != HEADER_BYTES + TD_REPORT_BODY_BYTES {
            return Err(error::conversion(format!("quote header and body are {} bytes", out.len()),
                                         Some("TD report field has an invalid length".into())));
        }

        Ok(out)
    }

    /// The report data field of the QE report.
    pub fn qe_report_data(&self) -> Result<&[u8]> {
        self.qe_report.get(QE_REPORT_DATA_OFFSET..QE_REPORT_BYTES)
            .ok_or_else(|| error::decode("QE report too short", None))
    }
}

fn read_certification_data(rdr: &mut impl Read, expected_type: u16) -> Result<Vec<u8>> {
    let cert_type = rdr.read_u16::<LittleEndian>().map_err(error::map_decode_err)?;
    let size = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;

    if cert_type != expected_type {
        return Err(error::decode(format!("certification data type {}, expected {}", cert_type, expected_type),
                                 Some("unexpected quote certification data".into())));
    }

    read_exact_to_bin_vec(rdr, size as usize)
}

fn write_certification_data(wtr: &mut Vec<u8>, cert_type: u16, data: &[u8]) -> Result<()> {
    wtr.write_u16::<LittleEndian>(cert_type).map_err(error::map_io_err)?;
    wtr.write_u32::<LittleEndian>(data.len() as u32).map_err(error::map_io_err)?;
    wtr.write_all(data).map_err(error::map_io_err)
}
