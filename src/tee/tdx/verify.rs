use async_std::sync::Mutex;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use openssl::ecdsa::EcdsaSig;
use openssl::nid::Nid;
use openssl::x509::X509;
use pem::parse_many;
use tracing::{debug, warn};

use crate::common::cert::{ec_key_from_raw_point, ecdsa_sig_from_be, x509_to_ec_key, x509_validate_signature};
use crate::common::fetch::{fetch_url_cached, RetryPolicy};
use crate::common::hash::sha256;
use crate::error::{self, Result};
use crate::record::TdxAttestation;
use crate::tee::tdx::quote::{QuoteV4, ATTESTATION_KEY_TYPE_ECDSA_P256, TEE_TYPE_TDX};
use crate::tee::{EvidenceVerifier, ValidationOptions, VerificationOptions};

const INTEL_ROOT_CA_URL: &str =
    "https://certificates.trustedservices.intel.com/Intel_SGX_Provisioning_Certification_RootCA.der";
const INTEL_ROOT_CA_CACHE_PATH: &str = "certs/intel/Intel_SGX_Provisioning_Certification_RootCA.der";

const PCS_RETRY: RetryPolicy = RetryPolicy::new(3, 2000);

static INTEL_ROOT_CA: Lazy<Mutex<Option<X509>>> = Lazy::new(|| Mutex::new(None));

async fn intel_root_ca() -> Result<X509> {
    let mut cached = INTEL_ROOT_CA.lock().await;
    if let Some(root) = cached.as_ref() {
        return Ok(root.clone());
    }

    let der = fetch_url_cached(INTEL_ROOT_CA_URL, INTEL_ROOT_CA_CACHE_PATH, &PCS_RETRY).await?;
    let root = X509::from_der(der.as_ref())
        .map_err(|e| error::cert(Some(format!("failed to parse Intel root CA: {:?}", e))))?;

    *cached = Some(root.clone());

    Ok(root)
}

/// Verifies TD quotes: PCK chain, QE report and quote signatures.
#[derive(Clone, Copy, Debug, Default)]
pub struct TdxQuoteVerifier;

#[async_trait]
impl EvidenceVerifier<TdxAttestation> for TdxQuoteVerifier {
    fn validate(&self, evidence: &TdxAttestation, options: &ValidationOptions) -> Result<()> {
        let quote = QuoteV4::from_bytes(&evidence.quote)?;

        if (quote.header.version as u32) < options.minimum_version {
            return Err(error::verification(format!("quote version {} is below the minimum {}",
                                                   quote.header.version, options.minimum_version)));
        }
        if quote.header.tee_type != TEE_TYPE_TDX {
            return Err(error::verification(format!("quote TEE type 0x{:x} is not TDX", quote.header.tee_type)));
        }
        if quote.header.attestation_key_type != ATTESTATION_KEY_TYPE_ECDSA_P256 {
            return Err(error::verification(format!("unsupported attestation key type {}",
                                                   quote.header.attestation_key_type)));
        }
        if quote.body.report_data != options.report_data {
            warn!(report_data = %hex::encode(&quote.body.report_data), "TD report data mismatch");
            return Err(error::verification("TD report data does not match the expected nonce"));
        }

        Ok(())
    }

    async fn verify_chain_of_trust(&self, evidence: &TdxAttestation, options: &VerificationOptions) -> Result<()> {
        let quote = QuoteV4::from_bytes(&evidence.quote)?;

        let (pck, intermediate, root) = parse_pck_chain(&quote.pck_chain)?;

        if !options.trusted_roots.is_empty() {
            if !options.is_trusted_root(&root)? {
                return Err(error::verification("PCK chain root is not one of the trusted roots"));
            }
        } else if options.get_collateral {
            let pinned = VerificationOptions::with_trusted_roots(vec![intel_root_ca().await?]);
            if !pinned.is_trusted_root(&root)? {
                return Err(error::verification("PCK chain root is not the Intel SGX root CA"));
            }
        } else {
            return Err(error::verification("no trusted Intel root configured"));
        }

        match x509_validate_signature(root, Some(intermediate), pck.clone()) {
            Ok(true) => {}
            Ok(false) => return Err(error::verification("PCK certificate chain does not validate")),
            Err(e) => return Err(error::verification(format!("PCK certificate chain check failed: {:?}", e))),
        }

        let pck_key = x509_to_ec_key(pck)
            .map_err(|e| error::verification(format!("PCK certificate has no EC key: {:?}", e)))?;
        if !verify_p256(&quote.qe_report_signature, &quote.qe_report, |sig, digest| sig.verify(digest, &pck_key))? {
            return Err(error::verification("QE report signature verification failed"));
        }

        let mut binding = quote.attestation_key.clone();
        binding.extend_from_slice(&quote.qe_auth_data);
        let expected = sha256(&binding);
        let qe_report_data = quote.qe_report_data()?;
        if &qe_report_data[..32] != expected.as_slice() || qe_report_data[32..].iter().any(|b| *b != 0) {
            return Err(error::verification("QE report does not bind the attestation key"));
        }

        let attestation_key = ec_key_from_raw_point(Nid::X9_62_PRIME256V1, &quote.attestation_key)
            .map_err(|e| error::verification(format!("invalid attestation key: {:?}", e)))?;
        let message = quote.signed_message()?;
        if !verify_p256(&quote.signature, &message, |sig, digest| sig.verify(digest, &attestation_key))? {
            return Err(error::verification("TD quote signature verification failed"));
        }

        debug!(mr_td = %hex::encode(&quote.body.mr_td), "TD quote verified");

        Ok(())
    }
}

fn parse_pck_chain(pem_chain: &[u8]) -> Result<(X509, X509, X509)> {
    let pems = parse_many(pem_chain)
        .map_err(|e| error::verification(format!("failed to parse PCK chain: {:?}", e)))?;
    if pems.len() != 3 {
        return Err(error::verification(format!("PCK chain has {} certificates, expected 3", pems.len())));
    }

    let mut certs = Vec::with_capacity(3);
    for pem in &pems {
        certs.push(X509::from_der(&pem.contents)
            .map_err(|e| error::verification(format!("invalid certificate in PCK chain: {:?}", e)))?);
    }

    let root = certs.pop();
    let intermediate = certs.pop();
    let pck = certs.pop();

    match (pck, intermediate, root) {
        (Some(pck), Some(intermediate), Some(root)) => Ok((pck, intermediate, root)),
        _ => Err(error::verification("incomplete PCK chain")),
    }
}

/// Checks a raw `r || s` P-256 signature over SHA-256 of `message`.
fn verify_p256<F>(raw_sig: &[u8], message: &[u8], verify: F) -> Result<bool>
    where
        F: FnOnce(&EcdsaSig, &[u8]) -> std::result::Result<bool, openssl::error::ErrorStack>,
{
    if raw_sig.len() != 64 {
        return Err(error::verification(format!("signature is {} bytes, expected 64", raw_sig.len())));
    }

    let sig = ecdsa_sig_from_be(&raw_sig[..32], &raw_sig[32..])
        .map_err(|e| error::verification(format!("invalid signature: {:?}", e)))?;

    Ok(verify(&sig, &sha256(message)).unwrap_or(false))
}
