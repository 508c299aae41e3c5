//! Hardware TEE evidence: providers that produce it, verifiers that check it.

use async_trait::async_trait;
use openssl::x509::X509;

use crate::error::{self, invalid_argument, Result};
use crate::options::TeeTechnology;
use crate::record::TeeAttestation;

pub mod simulated;
pub mod snp;
pub mod tdx;

/// Size of the caller-controlled report data field in SEV-SNP reports and TD quotes.
pub const REPORT_DATA_BYTES: usize = 64;

pub type ReportData = [u8; REPORT_DATA_BYTES];

/// Zero-pads a nonce into report data.
pub fn report_data_from_nonce(nonce: &[u8]) -> Result<ReportData> {
    if nonce.len() > REPORT_DATA_BYTES {
        return Err(invalid_argument(format!("report data must be at most {} bytes, got {}",
                                            REPORT_DATA_BYTES, nonce.len())));
    }

    let mut report_data = [0; REPORT_DATA_BYTES];
    report_data[..nonce.len()].copy_from_slice(nonce);

    Ok(report_data)
}

/// An open hardware evidence provider.
pub trait TeeProvider: Send {
    fn technology(&self) -> TeeTechnology;

    fn get_evidence(&self, report_data: &ReportData) -> Result<TeeAttestation>;
}

pub trait TeeProviderFactory: Send + Sync {
    fn open_sev_snp(&self) -> Result<Box<dyn TeeProvider>>;

    fn open_tdx(&self) -> Result<Box<dyn TeeProvider>>;
}

/// Opens the guest devices of the running confidential VM.
#[derive(Clone, Copy, Debug, Default)]
pub struct HardwareTeeProviders;

impl TeeProviderFactory for HardwareTeeProviders {
    fn open_sev_snp(&self) -> Result<Box<dyn TeeProvider>> {
        Ok(Box::new(snp::SevGuestDevice::open()?))
    }

    fn open_tdx(&self) -> Result<Box<dyn TeeProvider>> {
        Ok(Box::new(tdx::TsmReportProvider::open()?))
    }
}

/// Checks on evidence contents, independent of its signatures.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationOptions {
    pub report_data: ReportData,
    pub minimum_version: u32,
}

impl ValidationOptions {
    pub fn sev_snp(nonce: &[u8]) -> Result<Self> {
        Ok(Self {
            report_data: report_data_from_nonce(nonce)?,
            minimum_version: snp::MINIMUM_REPORT_VERSION,
        })
    }

    pub fn tdx(nonce: &[u8]) -> Result<Self> {
        Ok(Self {
            report_data: report_data_from_nonce(nonce)?,
            minimum_version: tdx::QUOTE_VERSION_4 as u32,
        })
    }
}

/// Chain-of-trust settings.
#[derive(Clone, Debug)]
pub struct VerificationOptions {
    /// Root certificates the chain must end in. When empty the vendor root is
    /// fetched from the vendor's public endpoint.
    pub trusted_roots: Vec<X509>,
    /// Whether missing certificates may be fetched from the vendor.
    pub get_collateral: bool,
}

impl Default for VerificationOptions {
    fn default() -> Self {
        Self {
            trusted_roots: Vec::new(),
            get_collateral: true,
        }
    }
}

impl VerificationOptions {
    pub fn with_trusted_roots(trusted_roots: Vec<X509>) -> Self {
        Self {
            trusted_roots,
            get_collateral: false,
        }
    }

    /// Whether `cert` is one of the configured roots.
    pub(crate) fn is_trusted_root(&self, cert: &X509) -> Result<bool> {
        let der = cert.to_der()
            .map_err(|e| error::cert(Some(format!("failed to encode root certificate: {:?}", e))))?;

        for root in &self.trusted_roots {
            let root_der = root.to_der()
                .map_err(|e| error::cert(Some(format!("failed to encode trusted root: {:?}", e))))?;
            if root_der == der {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// Technology-specific evidence checks.
#[async_trait]
pub trait EvidenceVerifier<E: Sync>: Send + Sync {
    fn validate(&self, evidence: &E, options: &ValidationOptions) -> Result<()>;

    async fn verify_chain_of_trust(&self, evidence: &E, options: &VerificationOptions) -> Result<()>;
}
