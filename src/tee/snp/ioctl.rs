use nix::ioctl_readwrite;

pub const SEV_GUEST_DEVICE: &str = "/dev/sev-guest";

// ref: https://github.com/torvalds/linux/blob/d6ecaa0024485effd065124fe774de2e22095f2d/include/uapi/linux/sev-guest.h
const SNP_GET_REPORT_IOC_SEQUENCE_NUMBER: u8 = 0;
const SNP_GUEST_REQ_IOC_TYPE: u8 = b'S';

pub const SNP_REPORT_USER_DATA_MAX_BYTES: usize = 64;
pub const SNP_REPORT_MSG_RESP_RESERVED_BYTES: usize = 0x20 - 0x8;
pub const SNP_REPORT_REQ_RESERVED_BYTES: usize = 28;
pub const SNP_REPORT_RESP_DATA_BYTES: usize = 4000;

#[repr(C)]
#[derive(Debug)]
pub struct SnpReportReq {
    pub user_data: [u8; SNP_REPORT_USER_DATA_MAX_BYTES],
    pub vmpl: u32,
    pub rsvd: [u8; SNP_REPORT_REQ_RESERVED_BYTES],
}

#[repr(C)]
#[derive(Debug)]
pub struct SnpReportResp {
    pub data: [u8; SNP_REPORT_RESP_DATA_BYTES],
}

#[repr(C)]
#[derive(Debug)]
pub struct SnpGuestRequestIoctl {
    pub msg_version: u8,
    pub req_data: Box<SnpReportReq>,
    pub resp_data: Box<SnpReportResp>,
    pub fw_err: u64,
}

impl SnpGuestRequestIoctl {
    pub fn new_with_user_data(user_data: [u8; SNP_REPORT_USER_DATA_MAX_BYTES]) -> Self {
        SnpGuestRequestIoctl {
            msg_version: 1,
            req_data: Box::new(SnpReportReq {
                user_data,
                vmpl: 0,
                rsvd: [0; SNP_REPORT_REQ_RESERVED_BYTES],
            }),
            resp_data: Box::new(SnpReportResp {
                data: [0; SNP_REPORT_RESP_DATA_BYTES],
            }),
            fw_err: 0,
        }
    }
}

ioctl_readwrite!(snp_get_report, SNP_GUEST_REQ_IOC_TYPE, SNP_GET_REPORT_IOC_SEQUENCE_NUMBER, SnpGuestRequestIoctl);

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::{SnpGuestRequestIoctl, SnpReportReq, SnpReportResp};

    #[test]
    fn kernel_abi_sizes() {
        assert_eq!(size_of::<SnpReportReq>(), 96);
        assert_eq!(size_of::<SnpReportResp>(), 4000);
        assert_eq!(size_of::<SnpGuestRequestIoctl>(), 32);
    }
}
