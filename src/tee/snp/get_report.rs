use std::fs::File;
use std::io::{Cursor, Read};
use std::os::fd::AsRawFd;

use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;

use crate::common::binary::read_exact_to_bin_vec;
use crate::error::{self, Result};
use crate::options::TeeTechnology;
use crate::record::{SevSnpAttestation, TeeAttestation};
use crate::tee::snp::ioctl::{snp_get_report, SnpGuestRequestIoctl, SEV_GUEST_DEVICE,
                             SNP_REPORT_MSG_RESP_RESERVED_BYTES};
use crate::tee::snp::report::REPORT_BYTES;
use crate::tee::{ReportData, TeeProvider};

#[derive(Debug)]
pub struct GetAttestationReportMsgResp {
    pub status: u32,
    pub report_size: u32,
    pub report: Vec<u8>,
}

impl GetAttestationReportMsgResp {
    pub fn from_reader(mut rdr: impl Read) -> Result<Self> {
        let status = rdr.read_u32::<LittleEndian>()
            .map_err(error::map_decode_err)?;
        let report_size = rdr.read_u32::<LittleEndian>()
            .map_err(error::map_decode_err)?;
        let _reserved = read_exact_to_bin_vec(&mut rdr, SNP_REPORT_MSG_RESP_RESERVED_BYTES)?;

        if report_size as usize != REPORT_BYTES {
            return Err(error::decode(format!("firmware returned a {} byte report", report_size),
                                     Some(format!("expected {} bytes", REPORT_BYTES))));
        }
        let report = read_exact_to_bin_vec(&mut rdr, REPORT_BYTES)?;

        Ok(GetAttestationReportMsgResp { status, report_size, report })
    }
}

/// SEV-SNP guest device, held open for the duration of a call.
pub struct SevGuestDevice {
    file: File,
}

impl SevGuestDevice {
    pub fn open() -> Result<Self> {
        let file = File::options().read(true).write(true).open(SEV_GUEST_DEVICE)
            .map_err(|e| error::device(e, Some(format!("failed to open {}", SEV_GUEST_DEVICE))))?;

        Ok(Self { file })
    }

    pub fn get_report(&self, report_data: &ReportData) -> Result<Vec<u8>> {
        let mut request = SnpGuestRequestIoctl::new_with_user_data(*report_data);

        debug!("Issuing the guest request IOCTL");
        unsafe {
            let ret_code = snp_get_report(self.file.as_raw_fd(), &mut request)
                .map_err(|e| error::device(e, Some("Error sending IOCTL".into())))?;
            if ret_code == -1 {
                return Err(error::device(format!("Firmware error: {}", request.fw_err), None));
            }
        }

        let resp = GetAttestationReportMsgResp::from_reader(Cursor::new(&request.resp_data.data[..]))?;
        if resp.status != 0 {
            return Err(error::device(
                format!("Non-zero status code {:?} with the following firmware error {:?}",
                        resp.status, request.fw_err), None));
        }

        Ok(resp.report)
    }
}

impl TeeProvider for SevGuestDevice {
    fn technology(&self) -> TeeTechnology {
        TeeTechnology::SevSnp
    }

    fn get_evidence(&self, report_data: &ReportData) -> Result<TeeAttestation> {
        let report = self.get_report(report_data)?;

        Ok(TeeAttestation::SevSnpAttestation(SevSnpAttestation {
            report,
            certificate_chain: Vec::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use byteorder::{LittleEndian, WriteBytesExt};

    use crate::error::Kind;
    use crate::tee::snp::ioctl::SNP_REPORT_MSG_RESP_RESERVED_BYTES;

    use super::GetAttestationReportMsgResp;

    fn msg_resp(status: u32, report_size: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(status).unwrap();
        buf.write_u32::<LittleEndian>(report_size).unwrap();
        buf.extend_from_slice(&[0; SNP_REPORT_MSG_RESP_RESERVED_BYTES]);
        buf.extend_from_slice(&[0x42; 1184]);
        buf.resize(4000, 0);
        buf
    }

    #[test]
    fn test_snp_report_msg_resp_from_reader() {
        let resp = GetAttestationReportMsgResp::from_reader(Cursor::new(msg_resp(0, 1184))).unwrap();

        assert_eq!(resp.status, 0);
        assert_eq!(resp.report_size, 1184);
        assert_eq!(resp.report, vec![0x42; 1184]);
    }

    #[test]
    fn test_snp_report_msg_resp_bad_size() {
        let err = GetAttestationReportMsgResp::from_reader(Cursor::new(msg_resp(0, 1000))).unwrap_err();

        assert_eq!(err.kind(), Kind::Decode);
    }
}
