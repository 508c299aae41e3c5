//! Software TEEs: SEV-SNP and TDX evidence signed by locally generated
//! certificate chains, for tests and development hosts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey, PointConversionForm};
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509, X509Builder, X509NameBuilder};

use crate::common::hash::sha256;
use crate::error::{self, Result};
use crate::options::TeeTechnology;
use crate::record::{SevSnpAttestation, TdxAttestation, TeeAttestation};
use crate::tee::snp::report::{AttestationReport, BuildVersion, Signature, TcbVersion,
                              SIG_ALGO_ECDSA_P384_SHA384};
use crate::tee::snp::MINIMUM_REPORT_VERSION;
use crate::tee::tdx::quote::{QuoteHeader, QuoteV4, TdReportBody, ATTESTATION_KEY_TYPE_ECDSA_P256,
                             INTEL_QE_VENDOR_ID, QE_REPORT_BYTES, QE_REPORT_DATA_OFFSET, QUOTE_VERSION_4,
                             TEE_TYPE_TDX};
use crate::tee::{ReportData, TeeProvider, TeeProviderFactory};

const NOT_BEFORE: &str = "20240101000000Z";
const VALIDITY_DAYS: u32 = 365;
const P256_COORDINATE_BYTES: i32 = 32;

fn simulation_err(e: ErrorStack) -> error::Error {
    error::device(e, Some("simulated TEE failure".into()))
}

struct Issuer<'a> {
    cert: &'a X509,
    key: &'a PKey<Private>,
}

fn ec_key(curve: Nid) -> std::result::Result<PKey<Private>, ErrorStack> {
    let group = EcGroup::from_curve_name(curve)?;
    PKey::from_ec_key(EcKey::generate(&group)?)
}

/// Issues a certificate for `key`, self-signed when `issuer` is `None`.
fn issue(common_name: &str, serial: u32, key: &PKey<Private>, issuer: Option<Issuer<'_>>,
         ca: bool, digest: MessageDigest) -> std::result::Result<X509, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "cvm-attestation simulator")?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    let name = name.build();

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = BigNum::from_u32(serial)?;
    let serial = Asn1Integer::from_bn(&serial)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    match &issuer {
        Some(issuer) => builder.set_issuer_name(issuer.cert.subject_name())?,
        None => builder.set_issuer_name(&name)?,
    }
    builder.set_pubkey(key)?;
    let not_before = Asn1Time::from_str(NOT_BEFORE)?;
    let not_after = Asn1Time::days_from_now(VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    if ca {
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?)?;
    } else {
        builder.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
    }

    match issuer {
        Some(issuer) => builder.sign(issuer.key, digest)?,
        None => builder.sign(key, digest)?,
    }

    Ok(builder.build())
}

/// A SEV-SNP guest whose reports are signed by a generated ARK → ASK → VCEK chain.
#[derive(Clone)]
pub struct SimulatedSevSnp {
    ark: X509,
    ask: X509,
    vcek: X509,
    vcek_key: EcKey<Private>,
    chip_id: Vec<u8>,
    measurement: Vec<u8>,
}

impl SimulatedSevSnp {
    pub fn new() -> Result<Self> {
        Self::generate().map_err(simulation_err)
    }

    fn generate() -> std::result::Result<Self, ErrorStack> {
        let ark_key = ec_key(Nid::SECP384R1)?;
        let ask_key = ec_key(Nid::SECP384R1)?;
        let vcek_key = ec_key(Nid::SECP384R1)?;

        let ark = issue("ARK-Milan", 1, &ark_key, None, true, MessageDigest::sha384())?;
        let ask = issue("SEV-Milan", 2, &ask_key, Some(Issuer { cert: &ark, key: &ark_key }),
                        true, MessageDigest::sha384())?;
        let vcek = issue("SEV-VCEK", 3, &vcek_key, Some(Issuer { cert: &ask, key: &ask_key }),
                         false, MessageDigest::sha384())?;

        let chip_id = sha256(vcek.to_der()?).iter().chain(sha256(b"chip").iter()).copied().collect();

        Ok(Self {
            ark,
            ask,
            vcek,
            vcek_key: vcek_key.ec_key()?,
            chip_id,
            measurement: vec![0x5a; 48],
        })
    }

    /// ARK, ASK and VCEK.
    pub fn certificates(&self) -> (&X509, &X509, &X509) {
        (&self.ark, &self.ask, &self.vcek)
    }

    pub fn trusted_roots(&self) -> Vec<X509> {
        vec![self.ark.clone()]
    }

    /// Signs a report over `report_data`.
    pub fn get_report(&self, report_data: &ReportData) -> Result<Vec<u8>> {
        let tcb = TcbVersion { boot_loader: 3, tee: 0, reserved: [0; 4], snp: 8, microcode: 115 };

        let mut report = AttestationReport {
            version: MINIMUM_REPORT_VERSION,
            guest_svn: 1,
            policy: 0x30000,
            family_id: vec![0; 16],
            image_id: vec![0; 16],
            vmpl: 0,
            signature_algo: SIG_ALGO_ECDSA_P384_SHA384,
            platform_version: tcb,
            platform_info: 0x3,
            flags: 0,
            report_data: report_data.to_vec(),
            measurement: self.measurement.clone(),
            host_data: vec![0; 32],
            id_key_digest: vec![0; 48],
            author_key_digest: vec![0; 48],
            report_id: sha256(report_data).to_vec(),
            report_id_ma: vec![0xff; 32],
            reported_tcb: tcb,
            chip_id: self.chip_id.clone(),
            committed_tcb: tcb,
            current_build: BuildVersion { build: 21, minor: 55, major: 1, reserved: 0 },
            committed_build: BuildVersion { build: 21, minor: 55, major: 1, reserved: 0 },
            launch_tcb: tcb,
            signature: Signature { r: vec![0; 72], s: vec![0; 72] },
        };

        let digest = AttestationReport::signed_digest(&report.to_bytes()?)?;
        let sig = EcdsaSig::sign(&digest, &self.vcek_key).map_err(simulation_err)?;
        report.signature = Signature::from_ecdsa_sig(&sig).map_err(simulation_err)?;

        report.to_bytes()
    }
}

impl TeeProvider for SimulatedSevSnp {
    fn technology(&self) -> TeeTechnology {
        TeeTechnology::SevSnp
    }

    fn get_evidence(&self, report_data: &ReportData) -> Result<TeeAttestation> {
        let certificate_chain = [&self.vcek, &self.ask, &self.ark].iter()
            .map(|cert| cert.to_der())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(simulation_err)?;

        Ok(TeeAttestation::SevSnpAttestation(SevSnpAttestation {
            report: self.get_report(report_data)?,
            certificate_chain,
        }))
    }
}

/// A TD whose quotes come from a generated quoting enclave and PCK chain.
#[derive(Clone)]
pub struct SimulatedTdx {
    root: X509,
    intermediate: X509,
    pck: X509,
    pck_key: EcKey<Private>,
    attestation_key: EcKey<Private>,
    mr_td: Vec<u8>,
}

fn raw_p256_signature(message: &[u8], key: &EcKey<Private>) -> std::result::Result<Vec<u8>, ErrorStack> {
    let sig = EcdsaSig::sign(&sha256(message), key)?;

    let mut raw = sig.r().to_vec_padded(P256_COORDINATE_BYTES)?;
    raw.extend(sig.s().to_vec_padded(P256_COORDINATE_BYTES)?);

    Ok(raw)
}

impl SimulatedTdx {
    pub fn new() -> Result<Self> {
        Self::generate().map_err(simulation_err)
    }

    fn generate() -> std::result::Result<Self, ErrorStack> {
        let root_key = ec_key(Nid::X9_62_PRIME256V1)?;
        let intermediate_key = ec_key(Nid::X9_62_PRIME256V1)?;
        let pck_key = ec_key(Nid::X9_62_PRIME256V1)?;

        let root = issue("Intel SGX Root CA", 1, &root_key, None, true, MessageDigest::sha256())?;
        let intermediate = issue("Intel SGX PCK Platform CA", 2, &intermediate_key,
                                 Some(Issuer { cert: &root, key: &root_key }), true, MessageDigest::sha256())?;
        let pck = issue("Intel SGX PCK Certificate", 3, &pck_key,
                        Some(Issuer { cert: &intermediate, key: &intermediate_key }), false,
                        MessageDigest::sha256())?;

        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;

        Ok(Self {
            root,
            intermediate,
            pck,
            pck_key: pck_key.ec_key()?,
            attestation_key: EcKey::generate(&group)?,
            mr_td: vec![0xa7; 48],
        })
    }

    pub fn trusted_roots(&self) -> Vec<X509> {
        vec![self.root.clone()]
    }

    /// Produces a signed version 4 quote over `report_data`.
    pub fn get_quote(&self, report_data: &ReportData) -> Result<Vec<u8>> {
        self.build_quote(report_data)?.to_bytes()
    }

    fn raw_attestation_key(&self) -> std::result::Result<Vec<u8>, ErrorStack> {
        let mut ctx = BigNumContext::new()?;
        let point = self.attestation_key.public_key()
            .to_bytes(self.attestation_key.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)?;

        Ok(point[1..].to_vec())
    }

    fn pck_chain(&self) -> std::result::Result<Vec<u8>, ErrorStack> {
        let mut pck_chain = self.pck.to_pem()?;
        pck_chain.extend(self.intermediate.to_pem()?);
        pck_chain.extend(self.root.to_pem()?);

        Ok(pck_chain)
    }

    fn build_quote(&self, report_data: &ReportData) -> Result<QuoteV4> {
        let attestation_key = self.raw_attestation_key().map_err(simulation_err)?;

        let qe_auth_data: Vec<u8> = (0..32).collect();

        let mut binding = attestation_key.clone();
        binding.extend_from_slice(&qe_auth_data);
        let mut qe_report = vec![0; QE_REPORT_BYTES];
        qe_report[QE_REPORT_DATA_OFFSET..QE_REPORT_DATA_OFFSET + 32].copy_from_slice(&sha256(&binding));
        let qe_report_signature = raw_p256_signature(&qe_report, &self.pck_key).map_err(simulation_err)?;
        let pck_chain = self.pck_chain().map_err(simulation_err)?;

        let mut quote = QuoteV4 {
            header: QuoteHeader {
                version: QUOTE_VERSION_4,
                attestation_key_type: ATTESTATION_KEY_TYPE_ECDSA_P256,
                tee_type: TEE_TYPE_TDX,
                qe_svn: 8,
                pce_svn: 13,
                qe_vendor_id: INTEL_QE_VENDOR_ID,
                user_data: [0; 20],
            },
            body: TdReportBody {
                tee_tcb_svn: [0x03, 0x01, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
                mr_seam: vec![0x1c; 48],
                mr_signer_seam: vec![0; 48],
                seam_attributes: 0,
                td_attributes: 0x1000_0000,
                xfam: 0xe71e7,
                mr_td: self.mr_td.clone(),
                mr_config_id: vec![0; 48],
                mr_owner: vec![0; 48],
                mr_owner_config: vec![0; 48],
                rtmrs: [vec![0x11; 48], vec![0x22; 48], vec![0; 48], vec![0; 48]],
                report_data: report_data.to_vec(),
            },
            signature: Vec::new(),
            attestation_key,
            qe_report,
            qe_report_signature,
            qe_auth_data,
            pck_chain,
        };

        let message = quote.signed_message()?;
        quote.signature = raw_p256_signature(&message, &self.attestation_key).map_err(simulation_err)?;

        Ok(quote)
    }
}

impl TeeProvider for SimulatedTdx {
    fn technology(&self) -> TeeTechnology {
        TeeTechnology::Tdx
    }

    fn get_evidence(&self, report_data: &ReportData) -> Result<TeeAttestation> {
        Ok(TeeAttestation::TdxAttestation(TdxAttestation {
            quote: self.get_quote(report_data)?,
        }))
    }
}

/// Hands out the configured simulated TEEs; an absent one fails to open.
#[derive(Clone, Default)]
pub struct SimulatedTeeProviders {
    sev_snp: Option<SimulatedSevSnp>,
    tdx: Option<SimulatedTdx>,
    opens: Arc<AtomicUsize>,
}

impl SimulatedTeeProviders {
    pub fn with_sev_snp(mut self, sev_snp: SimulatedSevSnp) -> Self {
        self.sev_snp = Some(sev_snp);
        self
    }

    pub fn with_tdx(mut self, tdx: SimulatedTdx) -> Self {
        self.tdx = Some(tdx);
        self
    }

    /// Number of successful opens across all technologies.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn open<P: TeeProvider + Clone + 'static>(&self, provider: &Option<P>, name: &str)
                                                -> Result<Box<dyn TeeProvider>> {
        match provider {
            Some(provider) => {
                self.opens.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(provider.clone()))
            }
            None => Err(error::device(format!("no {} device present", name), None)),
        }
    }
}

impl TeeProviderFactory for SimulatedTeeProviders {
    fn open_sev_snp(&self) -> Result<Box<dyn TeeProvider>> {
        self.open(&self.sev_snp, "SEV-SNP guest")
    }

    fn open_tdx(&self) -> Result<Box<dyn TeeProvider>> {
        self.open(&self.tdx, "TDX guest")
    }
}
