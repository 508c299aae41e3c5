//! Attestation production: one TPM quote, the measurement log and optional TEE
//! evidence, collected under a single device session.

use log::debug;

use crate::error::Result;
use crate::metadata::{instance_info, InstanceMetadata};
use crate::options::{AttestOptions, KeyType, TeeTechnology};
use crate::record::{self, Attestation, TeeAttestation};
use crate::tee::{report_data_from_nonce, TeeProvider, TeeProviderFactory};
use crate::tpm::device::{DeviceGuard, DeviceOpener, KeyGuard};
use crate::tpm::keys::{DeriveKeyFn, KeyRegistry};
use crate::tpm::structures::PcrSelection;

/// PCRs measured by platform firmware, all covered by the measurement log.
const FIRMWARE_PCRS: std::ops::RangeInclusive<u32> = 0..=7;

pub struct Attester {
    devices: Box<dyn DeviceOpener>,
    tee_providers: Box<dyn TeeProviderFactory>,
    metadata: Box<dyn InstanceMetadata>,
    keys: KeyRegistry,
    pcr_selection: PcrSelection,
}

impl Attester {
    pub fn new(devices: Box<dyn DeviceOpener>,
               tee_providers: Box<dyn TeeProviderFactory>,
               metadata: Box<dyn InstanceMetadata>) -> Self {
        Self {
            devices,
            tee_providers,
            metadata,
            keys: KeyRegistry::default(),
            pcr_selection: PcrSelection::sha256(FIRMWARE_PCRS),
        }
    }

    /// Attester for the running confidential VM: the platform TPM, the guest
    /// TEE devices and the GCE metadata server.
    #[cfg(feature = "hardware-tpm")]
    pub fn for_platform() -> Result<Self> {
        Ok(Self::new(Box::new(crate::tpm::hardware::HardwareTpmOpener::new()),
                     Box::new(crate::tee::HardwareTeeProviders),
                     Box::new(crate::metadata::GceMetadataClient::new()?)))
    }

    pub fn with_key_registry(mut self, keys: KeyRegistry) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_pcr_selection(mut self, pcr_selection: PcrSelection) -> Self {
        self.pcr_selection = pcr_selection;
        self
    }

    /// Produces a serialized attestation in `opts.format`.
    pub async fn attest(&self, opts: &AttestOptions) -> Result<Vec<u8>> {
        let attestation = self.get_attestation(opts).await?;

        record::encode(&attestation, opts.format)
    }

    /// Produces the attestation record without serializing it.
    pub async fn get_attestation(&self, opts: &AttestOptions) -> Result<Attestation> {
        opts.validate()?;
        let derive = self.keys.resolve(opts.key, opts.key_algo)
            .map_err(|e| e.context("resolving attestation key"))?;

        let mut attestation = self.collect(opts, derive)?;

        if opts.key == KeyType::GceAk {
            let info = instance_info(self.metadata.as_ref()).await
                .map_err(|e| e.context("fetching instance identity"))?;
            attestation.instance_info = Some(info);
        }

        Ok(attestation)
    }

    /// Everything that needs the device. The key is flushed and the device
    /// closed before this returns, on every path.
    fn collect(&self, opts: &AttestOptions, derive: DeriveKeyFn) -> Result<Attestation> {
        let device = DeviceGuard::acquire(self.devices.as_ref())?;
        let key = derive(&*device)
            .map_err(|e| e.context(format!("failed to derive {} {} attestation key", opts.key, opts.key_algo)))?;
        let key = KeyGuard::new(&*device, key);

        let provider = self.open_tee_provider(opts.tee_technology)?;
        let tee_attestation = match provider {
            Some(provider) => Some(self.tee_evidence(provider.as_ref(), opts)?),
            None => None,
        };

        let event_log = device.event_log()
            .map_err(|e| e.context("failed to retrieve TCG Event Log"))?;
        let quote = key.quote(&opts.nonce, &self.pcr_selection)
            .map_err(|e| e.context("failed to quote"))?;

        debug!("collected {} attestation ({})", opts.tee_technology,
               record::describe_tee_attestation(tee_attestation.as_ref()));

        Ok(Attestation {
            ak_pub: key.public().to_bytes()?,
            quote: Some(quote),
            event_log,
            instance_info: None,
            tee_attestation,
        })
    }

    fn open_tee_provider(&self, technology: TeeTechnology) -> Result<Option<Box<dyn TeeProvider>>> {
        match technology {
            TeeTechnology::None => Ok(None),
            TeeTechnology::SevSnp => self.tee_providers.open_sev_snp()
                .map(Some)
                .map_err(|e| e.context("failed to open SEV-SNP guest device")),
            TeeTechnology::Tdx => self.tee_providers.open_tdx()
                .map(Some)
                .map_err(|e| e.context("failed to open TDX guest device")),
        }
    }

    fn tee_evidence(&self, provider: &dyn TeeProvider, opts: &AttestOptions) -> Result<TeeAttestation> {
        let report_data = report_data_from_nonce(opts.tee_report_nonce())?;

        provider.get_evidence(&report_data)
            .map_err(|e| e.context(format!("failed to get {} attestation", provider.technology())))
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Kind;
    use crate::metadata::fake::FakeMetadata;
    use crate::options::{AttestOptions, Format, KeyAlgo, KeyType, TeeTechnology};
    use crate::record::{self, TeeAttestation};
    use crate::tee::simulated::{SimulatedSevSnp, SimulatedTdx, SimulatedTeeProviders};
    use crate::tee::snp::report::AttestationReport;
    use crate::tpm::keys::{attestation_key_rsa, KeyRegistry};
    use crate::tpm::platform::ConfidentialTechnology;
    use crate::tpm::simulated::SimulatedTpm;

    use super::Attester;

    struct Fixture {
        tpm: SimulatedTpm,
        providers: SimulatedTeeProviders,
        metadata: FakeMetadata,
    }

    impl Fixture {
        fn new(technology: ConfidentialTechnology) -> Self {
            Self {
                tpm: SimulatedTpm::new(technology),
                providers: SimulatedTeeProviders::default()
                    .with_sev_snp(SimulatedSevSnp::new().unwrap())
                    .with_tdx(SimulatedTdx::new().unwrap()),
                metadata: FakeMetadata::default(),
            }
        }

        fn attester(&self) -> Attester {
            Attester::new(Box::new(self.tpm.clone()),
                          Box::new(self.providers.clone()),
                          Box::new(self.metadata.clone()))
        }

        fn assert_released(&self) {
            assert!(!self.tpm.is_open());
            assert_eq!(self.tpm.loaded_keys(), 0);
        }
    }

    #[tokio::test]
    async fn attest_without_tee() {
        let fixture = Fixture::new(ConfidentialTechnology::None);
        let opts = AttestOptions { nonce: b"nonce".to_vec(), ..Default::default() };

        let bytes = fixture.attester().attest(&opts).await.unwrap();
        let attestation = record::decode(&bytes, Format::Binary).unwrap();

        assert!(!attestation.ak_pub.is_empty());
        assert!(!attestation.event_log.is_empty());
        assert_eq!(attestation.quote.unwrap().pcrs.len(), 8);
        assert!(attestation.instance_info.is_none());
        assert!(attestation.tee_attestation.is_none());
        assert_eq!(fixture.providers.opens(), 0);
        assert_eq!(fixture.metadata.calls(), 0);
        fixture.assert_released();
    }

    #[tokio::test]
    async fn tee_nonce_falls_back_to_nonce() {
        let fixture = Fixture::new(ConfidentialTechnology::AmdSevSnp);
        let opts = AttestOptions {
            nonce: b"tpm nonce".to_vec(),
            tee_technology: TeeTechnology::SevSnp,
            ..Default::default()
        };

        let attestation = fixture.attester().get_attestation(&opts).await.unwrap();

        match attestation.tee_attestation {
            Some(TeeAttestation::SevSnpAttestation(evidence)) => {
                let report = AttestationReport::from_bytes(&evidence.report).unwrap();
                assert_eq!(&report.report_data[..9], b"tpm nonce");
            }
            other => panic!("unexpected evidence {:?}", other),
        }
        assert_eq!(fixture.providers.opens(), 1);
        fixture.assert_released();
    }

    #[tokio::test]
    async fn tee_nonce_without_technology_fails_fast() {
        let fixture = Fixture::new(ConfidentialTechnology::None);
        let opts = AttestOptions { tee_nonce: b"tee".to_vec(), ..Default::default() };

        let err = fixture.attester().attest(&opts).await.unwrap_err();

        assert_eq!(err.kind(), Kind::InvalidArgument);
        assert_eq!(fixture.tpm.opens(), 0);
        assert_eq!(fixture.providers.opens(), 0);
    }

    #[tokio::test]
    async fn unregistered_algorithm_fails_fast() {
        let fixture = Fixture::new(ConfidentialTechnology::None);
        let attester = fixture.attester()
            .with_key_registry(KeyRegistry::empty().register(KeyType::Ak, KeyAlgo::Rsa, attestation_key_rsa));
        let opts = AttestOptions { key_algo: KeyAlgo::Ecc, ..Default::default() };

        let err = attester.attest(&opts).await.unwrap_err();

        assert_eq!(err.kind(), Kind::InvalidArgument);
        assert_eq!(fixture.tpm.opens(), 0);
    }

    #[tokio::test]
    async fn missing_tee_device_releases_tpm() {
        let fixture = Fixture {
            providers: SimulatedTeeProviders::default(),
            ..Fixture::new(ConfidentialTechnology::IntelTdx)
        };
        let opts = AttestOptions { tee_technology: TeeTechnology::Tdx, ..Default::default() };

        let err = fixture.attester().attest(&opts).await.unwrap_err();

        assert_eq!(err.kind(), Kind::Device);
        assert_eq!(fixture.tpm.opens(), 1);
        fixture.assert_released();
    }

    #[tokio::test]
    async fn gce_key_without_templates() {
        let fixture = Fixture {
            tpm: SimulatedTpm::new(ConfidentialTechnology::None).without_gce_templates(),
            ..Fixture::new(ConfidentialTechnology::None)
        };
        let opts = AttestOptions { key: KeyType::GceAk, ..Default::default() };

        let err = fixture.attester().attest(&opts).await.unwrap_err();

        assert_eq!(err.kind(), Kind::Device);
        fixture.assert_released();
    }

    #[tokio::test]
    async fn gce_key_adds_instance_info() {
        let fixture = Fixture::new(ConfidentialTechnology::None);
        let opts = AttestOptions { key: KeyType::GceAk, key_algo: KeyAlgo::Ecc, ..Default::default() };

        let attestation = fixture.attester().get_attestation(&opts).await.unwrap();

        let info = attestation.instance_info.unwrap();
        assert_eq!(info.project_id, "confidential-project");
        assert_eq!(info.instance_id, 4242424242);
        fixture.assert_released();
    }

    #[tokio::test]
    async fn instance_info_failure_aborts() {
        let fixture = Fixture {
            metadata: FakeMetadata { fail: Some("zone"), ..Default::default() },
            ..Fixture::new(ConfidentialTechnology::None)
        };
        let opts = AttestOptions { key: KeyType::GceAk, ..Default::default() };

        let err = fixture.attester().attest(&opts).await.unwrap_err();

        assert_eq!(err.kind(), Kind::Fetch);
        fixture.assert_released();
    }

    #[tokio::test]
    async fn text_format() {
        let fixture = Fixture::new(ConfidentialTechnology::IntelTdx);
        let opts = AttestOptions {
            nonce: b"nonce".to_vec(),
            tee_technology: TeeTechnology::Tdx,
            format: Format::Text,
            ..Default::default()
        };

        let bytes = fixture.attester().attest(&opts).await.unwrap();

        assert!(bytes.starts_with(b"{\n  \""));
        let attestation = record::decode(&bytes, Format::Text).unwrap();
        assert!(matches!(attestation.tee_attestation, Some(TeeAttestation::TdxAttestation(_))));
    }
}
