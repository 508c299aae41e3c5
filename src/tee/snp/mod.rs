//! AMD SEV-SNP guest reports.

pub mod certs;
pub mod get_report;
pub mod ioctl;
pub mod report;
pub mod verify;

pub use get_report::SevGuestDevice;
pub use report::AttestationReport;
pub use verify::SnpReportVerifier;

/// Oldest report format carrying the fields checked here.
pub const MINIMUM_REPORT_VERSION: u32 = 2;
