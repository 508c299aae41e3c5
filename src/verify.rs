//! Attestation verification: the TPM quote first, then the TEE evidence the
//! verified platform says must be present.

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{self, Result};
use crate::options::Format;
use crate::record::{self, describe_tee_attestation, Attestation, SevSnpAttestation, TdxAttestation,
                    TeeAttestation};
use crate::tee::snp::SnpReportVerifier;
use crate::tee::tdx::TdxQuoteVerifier;
use crate::tee::{EvidenceVerifier, ValidationOptions, VerificationOptions};
use crate::tpm::platform::{ConfidentialTechnology, PlatformState};
use crate::tpm::structures::AkPublic;
use crate::tpm::verify::{QuoteVerifier, TpmQuoteVerifier};

/// Verified platform facts plus the verified TEE evidence, if any.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MachineState {
    pub platform: PlatformState,
    pub tee_attestation: Option<TeeAttestation>,
}

pub struct Verifier {
    quotes: Box<dyn QuoteVerifier>,
    sev_snp: Box<dyn EvidenceVerifier<SevSnpAttestation>>,
    tdx: Box<dyn EvidenceVerifier<TdxAttestation>>,
    sev_snp_options: VerificationOptions,
    tdx_options: VerificationOptions,
}

impl Default for Verifier {
    fn default() -> Self {
        Self {
            quotes: Box::new(TpmQuoteVerifier),
            sev_snp: Box::new(SnpReportVerifier),
            tdx: Box::new(TdxQuoteVerifier),
            sev_snp_options: VerificationOptions::default(),
            tdx_options: VerificationOptions::default(),
        }
    }
}

impl Verifier {
    pub fn with_quote_verifier(mut self, quotes: Box<dyn QuoteVerifier>) -> Self {
        self.quotes = quotes;
        self
    }

    pub fn with_sev_snp_verifier(mut self, verifier: Box<dyn EvidenceVerifier<SevSnpAttestation>>) -> Self {
        self.sev_snp = verifier;
        self
    }

    pub fn with_tdx_verifier(mut self, verifier: Box<dyn EvidenceVerifier<TdxAttestation>>) -> Self {
        self.tdx = verifier;
        self
    }

    /// Chain-of-trust settings for SEV-SNP evidence.
    pub fn with_sev_snp_options(mut self, options: VerificationOptions) -> Self {
        self.sev_snp_options = options;
        self
    }

    /// Chain-of-trust settings for TDX evidence.
    pub fn with_tdx_options(mut self, options: VerificationOptions) -> Self {
        self.tdx_options = options;
        self
    }

    /// Verifies serialized evidence. `nonce` must match the quote; the TEE
    /// report data must match `tee_nonce`, or `nonce` when `tee_nonce` is empty.
    pub async fn verify_attestation(&self, bytes: &[u8], format: Format,
                                    nonce: &[u8], tee_nonce: &[u8]) -> Result<MachineState> {
        let attestation = record::decode(bytes, format)?;

        let ak = AkPublic::from_bytes(&attestation.ak_pub)
            .and_then(|public| public.to_pkey())
            .map_err(|e| error::decode(e, Some("failed to decode attestation key".into())))?;

        let platform = self.quotes.verify_quote(&attestation, nonce, &[ak])
            .map_err(|e| e.context("verifying TPM attestation"))?;

        let expected_nonce = if tee_nonce.is_empty() { nonce } else { tee_nonce };
        let tee_attestation = self.verify_tee_attestation(&platform, &attestation, expected_nonce).await?;

        debug!(technology = ?platform.technology,
               evidence = describe_tee_attestation(tee_attestation.as_ref()),
               "attestation verified");

        Ok(MachineState { platform, tee_attestation })
    }

    /// Dispatches on the technology established by the quote, never on the
    /// record's own evidence tag.
    async fn verify_tee_attestation(&self, platform: &PlatformState, attestation: &Attestation,
                                    expected_nonce: &[u8]) -> Result<Option<TeeAttestation>> {
        let evidence = attestation.tee_attestation.as_ref();

        match platform.technology {
            ConfidentialTechnology::None => Ok(None),
            ConfidentialTechnology::AmdSevSnp => match evidence {
                Some(TeeAttestation::SevSnpAttestation(snp)) => {
                    let validation = ValidationOptions::sev_snp(expected_nonce)?;
                    verify_evidence(self.sev_snp.as_ref(), snp, &validation, &self.sev_snp_options).await
                        .map_err(|e| e.context("verifying SEV-SNP attestation"))?;

                    Ok(Some(TeeAttestation::SevSnpAttestation(snp.clone())))
                }
                other => Err(mismatch(platform.technology, other)),
            },
            ConfidentialTechnology::IntelTdx => match evidence {
                Some(TeeAttestation::TdxAttestation(tdx)) => {
                    let validation = ValidationOptions::tdx(expected_nonce)?;
                    verify_evidence(self.tdx.as_ref(), tdx, &validation, &self.tdx_options).await
                        .map_err(|e| e.context("verifying TDX attestation"))?;

                    Ok(Some(TeeAttestation::TdxAttestation(tdx.clone())))
                }
                other => Err(mismatch(platform.technology, other)),
            },
            other => Err(error::unsupported_technology(format!("unknown confidential technology {:?}", other))),
        }
    }
}

async fn verify_evidence<E: Sync>(verifier: &dyn EvidenceVerifier<E>, evidence: &E,
                                  validation: &ValidationOptions,
                                  options: &VerificationOptions) -> Result<()> {
    verifier.validate(evidence, validation)?;
    verifier.verify_chain_of_trust(evidence, &options.clone()).await
}

fn mismatch(technology: ConfidentialTechnology, evidence: Option<&TeeAttestation>) -> error::Error {
    warn!(?technology, evidence = describe_tee_attestation(evidence), "TEE evidence does not match platform");

    error::type_mismatch(format!("platform reports {:?} but the attestation carries {}",
                                 technology, describe_tee_attestation(evidence)))
}

/// Verifies with default verifiers and vendor roots. `format` is
/// `"binarypb"` or `"textproto"`.
pub async fn verify_attestation(bytes: &[u8], format: &str,
                                nonce: &[u8], tee_nonce: &[u8]) -> Result<MachineState> {
    let format = format.parse::<Format>()
        .map_err(|e| error::decode(e, Some("unknown attestation format".into())))?;

    Verifier::default().verify_attestation(bytes, format, nonce, tee_nonce).await
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use openssl::pkey::{PKey, Public};

    use crate::attest::Attester;
    use crate::error::{self, Kind, Result};
    use crate::metadata::fake::FakeMetadata;
    use crate::options::{AttestOptions, Format, KeyAlgo, KeyType, TeeTechnology};
    use crate::record::{self, Attestation, SevSnpAttestation, TeeAttestation};
    use crate::tee::simulated::{SimulatedSevSnp, SimulatedTdx, SimulatedTeeProviders};
    use crate::tee::{EvidenceVerifier, ValidationOptions, VerificationOptions};
    use crate::tpm::platform::{ConfidentialTechnology, PlatformState};
    use crate::tpm::simulated::SimulatedTpm;
    use crate::tpm::verify::QuoteVerifier;

    use super::{verify_attestation, Verifier};

    struct Fixture {
        tpm: SimulatedTpm,
        snp: SimulatedSevSnp,
        tdx: SimulatedTdx,
    }

    impl Fixture {
        fn new(technology: ConfidentialTechnology) -> Self {
            Self {
                tpm: SimulatedTpm::new(technology),
                snp: SimulatedSevSnp::new().unwrap(),
                tdx: SimulatedTdx::new().unwrap(),
            }
        }

        async fn attest(&self, opts: &AttestOptions) -> Vec<u8> {
            let providers = SimulatedTeeProviders::default()
                .with_sev_snp(self.snp.clone())
                .with_tdx(self.tdx.clone());
            let attester = Attester::new(Box::new(self.tpm.clone()), Box::new(providers),
                                         Box::new(FakeMetadata::default()));

            attester.attest(opts).await.unwrap()
        }

        fn verifier(&self) -> Verifier {
            Verifier::default()
                .with_sev_snp_options(VerificationOptions::with_trusted_roots(self.snp.trusted_roots()))
                .with_tdx_options(VerificationOptions::with_trusted_roots(self.tdx.trusted_roots()))
        }
    }

    fn opts(technology: TeeTechnology, nonce: &[u8], tee_nonce: &[u8]) -> AttestOptions {
        AttestOptions {
            nonce: nonce.to_vec(),
            tee_technology: technology,
            tee_nonce: tee_nonce.to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn round_trip_sev_snp() {
        let fixture = Fixture::new(ConfidentialTechnology::AmdSevSnp);
        let bytes = fixture.attest(&opts(TeeTechnology::SevSnp, b"nonce", b"")).await;

        let state = fixture.verifier().verify_attestation(&bytes, Format::Binary, b"nonce", b"").await.unwrap();

        let produced = record::decode(&bytes, Format::Binary).unwrap();
        assert_eq!(state.platform.technology, ConfidentialTechnology::AmdSevSnp);
        assert_eq!(state.tee_attestation, produced.tee_attestation);
        assert!(!state.platform.events.is_empty());
    }

    #[tokio::test]
    async fn round_trip_tdx_with_text_format() {
        let fixture = Fixture::new(ConfidentialTechnology::IntelTdx);
        let opts = AttestOptions {
            key: KeyType::GceAk,
            key_algo: KeyAlgo::Ecc,
            format: Format::Text,
            ..opts(TeeTechnology::Tdx, b"nonce", b"")
        };
        let bytes = fixture.attest(&opts).await;

        let state = fixture.verifier().verify_attestation(&bytes, Format::Text, b"nonce", b"").await.unwrap();

        assert_eq!(state.platform.technology, ConfidentialTechnology::IntelTdx);
        assert!(matches!(state.tee_attestation, Some(TeeAttestation::TdxAttestation(_))));
    }

    #[tokio::test]
    async fn round_trip_without_tee() {
        let fixture = Fixture::new(ConfidentialTechnology::None);
        let bytes = fixture.attest(&opts(TeeTechnology::None, b"nonce", b"")).await;

        let state = fixture.verifier().verify_attestation(&bytes, Format::Binary, b"nonce", b"").await.unwrap();

        assert_eq!(state.platform.technology, ConfidentialTechnology::None);
        assert!(state.tee_attestation.is_none());
    }

    #[tokio::test]
    async fn technology_none_ignores_evidence() {
        let fixture = Fixture::new(ConfidentialTechnology::None);
        let bytes = fixture.attest(&opts(TeeTechnology::SevSnp, b"nonce", b"")).await;

        let state = fixture.verifier().verify_attestation(&bytes, Format::Binary, b"nonce", b"").await.unwrap();

        assert!(state.tee_attestation.is_none());
    }

    #[tokio::test]
    async fn verification_is_idempotent() {
        let fixture = Fixture::new(ConfidentialTechnology::AmdSevSnp);
        let bytes = fixture.attest(&opts(TeeTechnology::SevSnp, b"nonce", b"")).await;
        let verifier = fixture.verifier();

        let first = verifier.verify_attestation(&bytes, Format::Binary, b"nonce", b"").await.unwrap();
        let second = verifier.verify_attestation(&bytes, Format::Binary, b"nonce", b"").await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn nonce_mismatch() {
        let fixture = Fixture::new(ConfidentialTechnology::AmdSevSnp);
        let bytes = fixture.attest(&opts(TeeTechnology::SevSnp, b"nonce", b"")).await;

        let err = fixture.verifier().verify_attestation(&bytes, Format::Binary, b"other", b"").await.unwrap_err();

        assert_eq!(err.kind(), Kind::Verification);
    }

    #[tokio::test]
    async fn tee_nonce_binding() {
        let fixture = Fixture::new(ConfidentialTechnology::IntelTdx);
        let bytes = fixture.attest(&opts(TeeTechnology::Tdx, b"tpm", b"tee")).await;
        let verifier = fixture.verifier();

        verifier.verify_attestation(&bytes, Format::Binary, b"tpm", b"tee").await.unwrap();

        // The TD quote is bound to the TEE nonce, not the TPM nonce.
        let err = verifier.verify_attestation(&bytes, Format::Binary, b"tpm", b"").await.unwrap_err();
        assert_eq!(err.kind(), Kind::Verification);

        let err = verifier.verify_attestation(&bytes, Format::Binary, b"tpm", b"other").await.unwrap_err();
        assert_eq!(err.kind(), Kind::Verification);
    }

    #[tokio::test]
    async fn tampered_tee_evidence() {
        let fixture = Fixture::new(ConfidentialTechnology::AmdSevSnp);
        let bytes = fixture.attest(&opts(TeeTechnology::SevSnp, b"nonce", b"")).await;

        let mut attestation = record::decode(&bytes, Format::Binary).unwrap();
        match attestation.tee_attestation.as_mut() {
            // measurement
            Some(TeeAttestation::SevSnpAttestation(snp)) => snp.report[0x90] ^= 0x01,
            other => panic!("unexpected evidence {:?}", other),
        }
        let bytes = record::encode(&attestation, Format::Binary).unwrap();

        let err = fixture.verifier().verify_attestation(&bytes, Format::Binary, b"nonce", b"").await.unwrap_err();

        assert_eq!(err.kind(), Kind::Verification);
    }

    #[tokio::test]
    async fn sev_snp_platform_with_tdx_evidence() {
        let fixture = Fixture::new(ConfidentialTechnology::AmdSevSnp);
        let bytes = fixture.attest(&opts(TeeTechnology::Tdx, b"nonce", b"")).await;

        let err = fixture.verifier().verify_attestation(&bytes, Format::Binary, b"nonce", b"").await.unwrap_err();

        assert_eq!(err.kind(), Kind::TypeMismatch);
    }

    #[tokio::test]
    async fn tdx_platform_without_evidence() {
        let fixture = Fixture::new(ConfidentialTechnology::IntelTdx);
        let bytes = fixture.attest(&opts(TeeTechnology::None, b"nonce", b"")).await;

        let err = fixture.verifier().verify_attestation(&bytes, Format::Binary, b"nonce", b"").await.unwrap_err();

        assert_eq!(err.kind(), Kind::TypeMismatch);
    }

    #[tokio::test]
    async fn unsupported_technology() {
        for technology in [ConfidentialTechnology::AmdSevEs, ConfidentialTechnology::Unknown(9)] {
            let fixture = Fixture::new(technology);
            let bytes = fixture.attest(&opts(TeeTechnology::None, b"nonce", b"")).await;

            let err = fixture.verifier().verify_attestation(&bytes, Format::Binary, b"nonce", b"").await.unwrap_err();

            assert_eq!(err.kind(), Kind::UnsupportedTechnology, "technology {:?}", technology);
        }
    }

    #[tokio::test]
    async fn malformed_inputs() {
        let fixture = Fixture::new(ConfidentialTechnology::None);
        let bytes = fixture.attest(&opts(TeeTechnology::None, b"nonce", b"")).await;

        let err = verify_attestation(&bytes, "json", b"nonce", b"").await.unwrap_err();
        assert_eq!(err.kind(), Kind::Decode);

        let err = verify_attestation(b"\xff\xff\xff", "binarypb", b"nonce", b"").await.unwrap_err();
        assert_eq!(err.kind(), Kind::Decode);

        let mut attestation = record::decode(&bytes, Format::Binary).unwrap();
        attestation.ak_pub.truncate(10);
        let bytes = record::encode(&attestation, Format::Binary).unwrap();
        let err = fixture.verifier().verify_attestation(&bytes, Format::Binary, b"nonce", b"").await.unwrap_err();
        assert_eq!(err.kind(), Kind::Decode);
    }

    struct FixedPlatform(ConfidentialTechnology);

    impl QuoteVerifier for FixedPlatform {
        fn verify_quote(&self, _: &Attestation, _: &[u8], _: &[PKey<Public>]) -> Result<PlatformState> {
            Ok(PlatformState { technology: self.0, ..Default::default() })
        }
    }

    struct ExpectReportData(Vec<u8>);

    #[async_trait]
    impl EvidenceVerifier<SevSnpAttestation> for ExpectReportData {
        fn validate(&self, _: &SevSnpAttestation, options: &ValidationOptions) -> Result<()> {
            if options.report_data[..self.0.len()] != self.0[..] {
                return Err(error::verification("unexpected report data"));
            }
            Ok(())
        }

        async fn verify_chain_of_trust(&self, _: &SevSnpAttestation, _: &VerificationOptions) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_uses_verified_technology() {
        let fixture = Fixture::new(ConfidentialTechnology::None);
        let bytes = fixture.attest(&opts(TeeTechnology::SevSnp, b"tpm", b"tee")).await;

        let verifier = Verifier::default()
            .with_quote_verifier(Box::new(FixedPlatform(ConfidentialTechnology::AmdSevSnp)))
            .with_sev_snp_verifier(Box::new(ExpectReportData(b"tee".to_vec())));

        let state = verifier.verify_attestation(&bytes, Format::Binary, b"tpm", b"tee").await.unwrap();
        assert!(matches!(state.tee_attestation, Some(TeeAttestation::SevSnpAttestation(_))));

        let err = verifier.verify_attestation(&bytes, Format::Binary, b"tpm", b"").await.unwrap_err();
        assert_eq!(err.kind(), Kind::Verification);
    }
}
