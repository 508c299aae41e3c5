use async_trait::async_trait;
use openssl::x509::X509;

#[cfg(not(test))]
use tracing::{debug, warn};

#[cfg(test)]
use std::{println as debug, println as warn};

use crate::common::cert::x509_to_ec_key;
use crate::error::{self, Result};
use crate::record::SevSnpAttestation;
use crate::tee::snp::certs::{get_kds_ark_ask_certs, get_kds_vcek_cert, product_name,
                             validate_ark_ask_vcek_certs};
use crate::tee::snp::report::AttestationReport;
use crate::tee::{EvidenceVerifier, ValidationOptions, VerificationOptions};

/// Verifies SEV-SNP reports against the AMD ARK → ASK → VCEK chain.
#[derive(Clone, Copy, Debug, Default)]
pub struct SnpReportVerifier;

#[async_trait]
impl EvidenceVerifier<SevSnpAttestation> for SnpReportVerifier {
    fn validate(&self, evidence: &SevSnpAttestation, options: &ValidationOptions) -> Result<()> {
        let report = AttestationReport::from_bytes(&evidence.report)?;

        if report.version < options.minimum_version {
            return Err(error::verification(format!("report version {} is below the minimum {}",
                                                   report.version, options.minimum_version)));
        }
        if !report.signature_algo_is_ecdsa_p384_sha384() {
            return Err(error::verification(format!("unsupported report signature algorithm {}",
                                                   report.signature_algo)));
        }
        if report.report_data != options.report_data {
            warn!("report data mismatch: got {}", report.report_data_hex());
            return Err(error::verification("report data does not match the expected nonce"));
        }

        Ok(())
    }

    async fn verify_chain_of_trust(&self, evidence: &SevSnpAttestation, options: &VerificationOptions) -> Result<()> {
        let report = AttestationReport::from_bytes(&evidence.report)?;

        let (ark_cert, ask_cert, vcek_cert) = resolve_certificates(&report, evidence, options).await?;

        validate_ark_ask_vcek_certs(&ark_cert, &ask_cert, Some(&vcek_cert))?;

        let vcek_ec = x509_to_ec_key(vcek_cert)
            .map_err(|e| error::cert(Some(format!("failed to extract EC Key from VCEK key: {:?}", e))))?;
        let sig = report.signature.to_ecdsa_sig()
            .map_err(|e| error::verification(format!("failed to extract ECDSA sig: {:?}", e)))?;
        let digest = AttestationReport::signed_digest(&evidence.report)?;

        if !sig.verify(&digest, &vcek_ec).unwrap_or(false) {
            warn!("report ECDSA signature verification failed");
            return Err(error::verification("SEV-SNP report signature verification failed"));
        }

        debug!("SEV-SNP report for chip {} verified", report.chip_id_hex());

        Ok(())
    }
}

/// Picks ARK, ASK and VCEK from the evidence, falling back to AMD KDS, and
/// anchors the ARK in a trusted root.
async fn resolve_certificates(report: &AttestationReport, evidence: &SevSnpAttestation,
                              options: &VerificationOptions) -> Result<(X509, X509, X509)> {
    let mut chain = Vec::with_capacity(evidence.certificate_chain.len());
    for der in &evidence.certificate_chain {
        chain.push(X509::from_der(der)
            .map_err(|e| error::verification(format!("invalid certificate in evidence: {:?}", e)))?);
    }

    let mut chain = chain.into_iter();
    let vcek = chain.next();
    let ask = chain.next();
    let ark = chain.next();

    let vcek = match vcek {
        Some(vcek) => vcek,
        None if options.get_collateral => get_kds_vcek_cert(&product_name(), report).await?,
        None => return Err(error::verification("evidence carries no VCEK and collateral fetching is disabled")),
    };

    let (ark, ask) = match (ark, ask) {
        (Some(ark), Some(ask)) => (ark, ask),
        _ if options.get_collateral => get_kds_ark_ask_certs(&product_name()).await?,
        _ => return Err(error::verification("evidence carries no ARK/ASK and collateral fetching is disabled")),
    };

    if !options.trusted_roots.is_empty() {
        if !options.is_trusted_root(&ark)? {
            return Err(error::verification("ARK is not one of the trusted roots"));
        }
    } else if options.get_collateral {
        let (kds_ark, _) = get_kds_ark_ask_certs(&product_name()).await?;
        let pinned = VerificationOptions::with_trusted_roots(vec![kds_ark]);
        if !pinned.is_trusted_root(&ark)? {
            return Err(error::verification("ARK does not match the AMD KDS root"));
        }
    } else {
        return Err(error::verification("no trusted AMD root configured"));
    }

    Ok((ark, ask, vcek))
}

#[cfg(test)]
mod tests {
    use crate::error::Kind;
    use crate::record::{SevSnpAttestation, TeeAttestation};
    use crate::tee::simulated::SimulatedSevSnp;
    use crate::tee::{EvidenceVerifier, TeeProvider, ValidationOptions, VerificationOptions};

    use super::SnpReportVerifier;

    fn evidence(snp: &SimulatedSevSnp, nonce: &[u8]) -> SevSnpAttestation {
        let report_data = crate::tee::report_data_from_nonce(nonce).unwrap();
        match snp.get_evidence(&report_data).unwrap() {
            TeeAttestation::SevSnpAttestation(evidence) => evidence,
            other => panic!("unexpected evidence {}", other.variant_name()),
        }
    }

    #[tokio::test]
    async fn verify_test() {
        let snp = SimulatedSevSnp::new().unwrap();
        let evidence = evidence(&snp, b"nonce");

        let verifier = SnpReportVerifier;
        verifier.validate(&evidence, &ValidationOptions::sev_snp(b"nonce").unwrap()).unwrap();
        verifier.verify_chain_of_trust(&evidence, &VerificationOptions::with_trusted_roots(snp.trusted_roots()))
            .await.unwrap();
    }

    #[test]
    fn validate_wrong_report_data() {
        let snp = SimulatedSevSnp::new().unwrap();
        let evidence = evidence(&snp, b"nonce");

        let err = SnpReportVerifier.validate(&evidence, &ValidationOptions::sev_snp(b"other").unwrap())
            .unwrap_err();

        assert_eq!(err.kind(), Kind::Verification);
    }

    #[tokio::test]
    async fn verify_bad_sig_test() {
        let snp = SimulatedSevSnp::new().unwrap();
        let mut evidence = evidence(&snp, b"nonce");
        // measurement
        evidence.report[0x90] ^= 0x01;

        let err = SnpReportVerifier
            .verify_chain_of_trust(&evidence, &VerificationOptions::with_trusted_roots(snp.trusted_roots()))
            .await.unwrap_err();

        assert_eq!(err.kind(), Kind::Verification);
    }

    #[tokio::test]
    async fn untrusted_root() {
        let snp = SimulatedSevSnp::new().unwrap();
        let other = SimulatedSevSnp::new().unwrap();
        let evidence = evidence(&snp, b"nonce");

        let err = SnpReportVerifier
            .verify_chain_of_trust(&evidence, &VerificationOptions::with_trusted_roots(other.trusted_roots()))
            .await.unwrap_err();

        assert_eq!(err.kind(), Kind::Verification);
    }

    #[tokio::test]
    async fn missing_certificates_without_collateral() {
        let snp = SimulatedSevSnp::new().unwrap();
        let mut evidence = evidence(&snp, b"nonce");
        evidence.certificate_chain.clear();

        let err = SnpReportVerifier
            .verify_chain_of_trust(&evidence, &VerificationOptions::with_trusted_roots(snp.trusted_roots()))
            .await.unwrap_err();

        assert_eq!(err.kind(), Kind::Verification);
    }
}
