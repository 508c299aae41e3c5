use std::collections::BTreeSet;

use openssl::pkey::{PKey, Public};
use tracing::{debug, warn};

use crate::error::{self, Result};
use crate::record::Attestation;
use crate::tpm::event_log;
use crate::tpm::platform::PlatformState;
use crate::tpm::structures::{pcr_digest, QuoteInfo, TpmSignature, TPM_ALG_SHA256,
                             TPM_GENERATED_VALUE, TPM_ST_ATTEST_QUOTE};

/// Verifies the root-of-trust quote of a record.
pub trait QuoteVerifier: Send + Sync {
    fn verify_quote(&self, record: &Attestation, nonce: &[u8], trusted_aks: &[PKey<Public>]) -> Result<PlatformState>;
}

/// Checks a TPM 2.0 quote and replays the measurement log against it.
#[derive(Clone, Copy, Debug, Default)]
pub struct TpmQuoteVerifier;

impl QuoteVerifier for TpmQuoteVerifier {
    fn verify_quote(&self, record: &Attestation, nonce: &[u8], trusted_aks: &[PKey<Public>]) -> Result<PlatformState> {
        let quote = record.quote.as_ref()
            .ok_or_else(|| error::verification("attestation contains no quote"))?;

        let signature = TpmSignature::from_bytes(&quote.raw_sig)?;
        let mut signed = false;
        for ak in trusted_aks {
            if signature.verify(ak, &quote.quote)? {
                signed = true;
                break;
            }
        }
        if !signed {
            warn!("quote signature did not verify under any of {} trusted keys", trusted_aks.len());
            return Err(error::verification("quote signature does not match a trusted attestation key"));
        }

        let info = QuoteInfo::from_bytes(&quote.quote)?;
        if info.magic != TPM_GENERATED_VALUE || info.attest_type != TPM_ST_ATTEST_QUOTE {
            return Err(error::verification("signed data is not a TPM-generated quote"));
        }
        if info.extra_data != nonce {
            return Err(error::verification("quote nonce does not match the expected nonce"));
        }

        let selection = match info.pcr_selections.as_slice() {
            [selection] if selection.hash_alg == TPM_ALG_SHA256 => selection,
            _ => return Err(error::verification("quote must cover exactly one SHA-256 PCR bank")),
        };
        if quote.hash_alg != TPM_ALG_SHA256 as u32 {
            return Err(error::verification(format!("unexpected PCR bank 0x{:04x}", quote.hash_alg)));
        }

        let selected: BTreeSet<u32> = selection.pcrs.iter().copied().collect();
        let provided: BTreeSet<u32> = quote.pcrs.keys().copied().collect();
        if selected != provided {
            return Err(error::verification("PCR values do not match the quoted selection"));
        }
        if pcr_digest(quote.pcrs.values().map(|v| v.as_slice())) != info.pcr_digest {
            return Err(error::verification("PCR values do not match the quoted digest"));
        }

        let events = event_log::parse(&record.event_log)?;
        let replayed = event_log::replay(&events, &selection.pcrs);
        for (pcr, value) in &quote.pcrs {
            if replayed.get(pcr).map(|r| r.as_slice()) != Some(value.as_slice()) {
                return Err(error::verification(format!("PCR {} does not match the replayed event log", pcr)));
            }
        }

        let events: Vec<_> = events.into_iter()
            .filter(|e| selected.contains(&e.index))
            .collect();
        let technology = event_log::nonhost_technology(&events)?;

        debug!(?technology, pcrs = selected.len(), events = events.len(), "TPM quote verified");

        Ok(PlatformState {
            technology,
            firmware_version: info.firmware_version,
            pcrs: quote.pcrs.clone(),
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use openssl::pkey::{PKey, Public};

    use crate::error::Kind;
    use crate::options::KeyAlgo;
    use crate::record::Attestation;
    use crate::tpm::device::{DeviceGuard, KeyGuard, KeyTemplate};
    use crate::tpm::platform::ConfidentialTechnology;
    use crate::tpm::simulated::SimulatedTpm;
    use crate::tpm::structures::PcrSelection;

    use super::{QuoteVerifier, TpmQuoteVerifier};

    fn attest(tpm: &SimulatedTpm, algo: KeyAlgo, nonce: &[u8]) -> (Attestation, PKey<Public>) {
        let device = DeviceGuard::acquire(tpm).unwrap();
        let key = device.create_attestation_key(&KeyTemplate::Default(algo)).unwrap();
        let key = KeyGuard::new(&*device, key);

        let quote = key.quote(nonce, &PcrSelection::sha256(0..=7)).unwrap();
        let record = Attestation {
            ak_pub: key.public().to_bytes().unwrap(),
            quote: Some(quote),
            event_log: device.event_log().unwrap(),
            ..Default::default()
        };
        let ak = key.public().to_pkey().unwrap();

        (record, ak)
    }

    #[test]
    fn verifies_rsa_and_ecc_quotes() {
        let tpm = SimulatedTpm::new(ConfidentialTechnology::IntelTdx);

        for algo in [KeyAlgo::Rsa, KeyAlgo::Ecc] {
            let (record, ak) = attest(&tpm, algo, b"nonce");

            let state = TpmQuoteVerifier.verify_quote(&record, b"nonce", &[ak]).unwrap();

            assert_eq!(state.technology, ConfidentialTechnology::IntelTdx);
            assert_eq!(state.pcrs.len(), 8);
            assert!(!state.events.is_empty());
        }

        assert_eq!(tpm.loaded_keys(), 0);
    }

    #[test]
    fn wrong_nonce() {
        let tpm = SimulatedTpm::new(ConfidentialTechnology::None);
        let (record, ak) = attest(&tpm, KeyAlgo::Ecc, b"nonce");

        let err = TpmQuoteVerifier.verify_quote(&record, b"other", &[ak]).unwrap_err();

        assert_eq!(err.kind(), Kind::Verification);
    }

    #[test]
    fn untrusted_key() {
        let tpm = SimulatedTpm::new(ConfidentialTechnology::None);
        let (record, _) = attest(&tpm, KeyAlgo::Ecc, b"nonce");
        let (_, other_ak) = attest(&SimulatedTpm::new(ConfidentialTechnology::None), KeyAlgo::Ecc, b"nonce");

        let err = TpmQuoteVerifier.verify_quote(&record, b"nonce", &[other_ak]).unwrap_err();

        assert_eq!(err.kind(), Kind::Verification);
    }

    #[test]
    fn tampered_pcr_value() {
        let tpm = SimulatedTpm::new(ConfidentialTechnology::None);
        let (mut record, ak) = attest(&tpm, KeyAlgo::Ecc, b"nonce");

        if let Some(quote) = record.quote.as_mut() {
            quote.pcrs.insert(3, vec![0xff; 32]);
        }

        let err = TpmQuoteVerifier.verify_quote(&record, b"nonce", &[ak]).unwrap_err();

        assert_eq!(err.kind(), Kind::Verification);
    }

    #[test]
    fn unlogged_measurement_fails_replay() {
        let tpm = SimulatedTpm::new(ConfidentialTechnology::None);
        tpm.extend_unlogged(2, b"hidden driver").unwrap();
        let (record, ak) = attest(&tpm, KeyAlgo::Ecc, b"nonce");

        let err = TpmQuoteVerifier.verify_quote(&record, b"nonce", &[ak]).unwrap_err();

        assert_eq!(err.kind(), Kind::Verification);
        assert!(err.to_string().contains("PCR 2"));
    }

    #[test]
    fn missing_quote() {
        let err = TpmQuoteVerifier.verify_quote(&Attestation::default(), b"", &[]).unwrap_err();

        assert_eq!(err.kind(), Kind::Verification);
    }
}
