//! Software root of trust: a SHA-256 PCR bank, a boot measurement log and
//! OpenSSL-backed attestation keys.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use openssl::bn::BigNumRef;
use openssl::ec::{EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;

use crate::common::hash::{sha256, sha256_extend};
use crate::error::{self, Result};
use crate::options::{KeyAlgo, MAX_NONCE_BYTES};
use crate::tpm::device::{closed_device, AttestationKey, DeviceOpener, KeyHandle, KeyTemplate,
                         RawQuote, RotDevice, GCE_AK_TEMPLATE_NV_INDEX_ECC, GCE_AK_TEMPLATE_NV_INDEX_RSA};
use crate::tpm::event_log::{self, GceNonHostInfo, PcrEvent, EV_NONHOST_INFO, EV_POST_CODE,
                            EV_SEPARATOR, EV_S_CRTM_VERSION};
use crate::tpm::platform::ConfidentialTechnology;
use crate::tpm::structures::{pcr_digest, AkPublic, ClockInfo, PcrSelection, QuoteInfo, TpmSignature,
                             PCR_SELECT_BYTES, TPM_ALG_SHA256, TPM_GENERATED_VALUE, TPM_ST_ATTEST_QUOTE};

const PCR_COUNT: u32 = (PCR_SELECT_BYTES * 8) as u32;
const FIRST_TRANSIENT_HANDLE: KeyHandle = 0x8000_0000;
const FIRMWARE_VERSION: u64 = 0x2020_0917_0011_0000;
const P256_COORDINATE_BYTES: i32 = 32;

struct TpmState {
    open: bool,
    opens: usize,
    pcrs: BTreeMap<u32, [u8; 32]>,
    events: Vec<PcrEvent>,
    gce_provisioned: bool,
    keys: HashMap<KeyTemplate, PKey<Private>>,
    loaded: HashMap<KeyHandle, KeyTemplate>,
    next_handle: KeyHandle,
    clock: u64,
}

/// Cloning shares the device, as two handles to one TPM would.
#[derive(Clone)]
pub struct SimulatedTpm {
    state: Arc<Mutex<TpmState>>,
}

impl SimulatedTpm {
    /// A freshly booted TPM whose firmware reported `technology`.
    pub fn new(technology: ConfidentialTechnology) -> Self {
        let mut state = TpmState {
            open: false,
            opens: 0,
            pcrs: (0..PCR_COUNT).map(|pcr| (pcr, [0; 32])).collect(),
            events: Vec::new(),
            gce_provisioned: true,
            keys: HashMap::new(),
            loaded: HashMap::new(),
            next_handle: FIRST_TRANSIENT_HANDLE,
            clock: 0,
        };

        let boot = [
            PcrEvent::measure(0, EV_S_CRTM_VERSION, b"GCE Virtual Firmware v2\0".to_vec()),
            PcrEvent::measure(0, EV_NONHOST_INFO, GceNonHostInfo::new(technology).to_bytes()),
            PcrEvent::measure(4, EV_POST_CODE, b"UEFI boot manager".to_vec()),
        ];
        for event in boot {
            state.measure(event);
        }
        for pcr in 0..=7 {
            state.measure(PcrEvent::measure(pcr, EV_SEPARATOR, vec![0; 4]));
        }

        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Without the GCE NV templates, `gceAK` keys cannot be created.
    pub fn without_gce_templates(self) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.gce_provisioned = false;
        }
        self
    }

    /// Records and extends a measurement, as firmware or the OS would.
    pub fn measure(&self, event: PcrEvent) -> Result<()> {
        self.lock()?.measure(event);
        Ok(())
    }

    /// Extends a PCR without logging it, so the log no longer replays.
    pub fn extend_unlogged(&self, pcr: u32, data: &[u8]) -> Result<()> {
        let mut state = self.lock()?;
        let value = state.pcrs.get_mut(&pcr)
            .ok_or_else(|| error::invalid_argument(format!("PCR {} out of range", pcr)))?;
        *value = sha256_extend(value, &sha256(data));
        Ok(())
    }

    /// Number of sessions opened so far.
    pub fn opens(&self) -> usize {
        self.state.lock().map(|s| s.opens).unwrap_or_default()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().map(|s| s.open).unwrap_or_default()
    }

    /// Number of keys currently loaded.
    pub fn loaded_keys(&self) -> usize {
        self.state.lock().map(|s| s.loaded.len()).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, TpmState>> {
        self.state.lock()
            .map_err(|_| error::device("simulated TPM state poisoned", None))
    }

    fn session(&self) -> Result<MutexGuard<'_, TpmState>> {
        let state = self.lock()?;
        if !state.open {
            return Err(closed_device());
        }
        Ok(state)
    }
}

impl TpmState {
    fn measure(&mut self, event: PcrEvent) {
        if let Some(value) = self.pcrs.get_mut(&event.index) {
            *value = sha256_extend(value, &event.digest);
        }
        self.events.push(event);
    }
}

impl DeviceOpener for SimulatedTpm {
    fn open(&self) -> Result<Box<dyn RotDevice>> {
        let mut state = self.lock()?;
        if state.open {
            return Err(error::device("TPM is already in use", None));
        }
        state.open = true;
        state.opens += 1;

        Ok(Box::new(self.clone()))
    }
}

impl RotDevice for SimulatedTpm {
    fn create_attestation_key(&self, template: &KeyTemplate) -> Result<AttestationKey> {
        let mut state = self.session()?;

        if let KeyTemplate::Nv { index, .. } = template {
            let known = *index == GCE_AK_TEMPLATE_NV_INDEX_RSA || *index == GCE_AK_TEMPLATE_NV_INDEX_ECC;
            if !state.gce_provisioned || !known {
                return Err(error::device(format!("NV index 0x{:08x} is not defined", index),
                                         Some("failed to read key template".into())));
            }
        }

        if !state.keys.contains_key(template) {
            let key = generate_key(template.algo())
                .map_err(|e| error::device(e, Some("failed to create attestation key".into())))?;
            state.keys.insert(template.clone(), key);
        }
        let public = match state.keys.get(template) {
            Some(key) => AkPublic::from_pkey(key)?,
            None => return Err(error::device("key vanished", None)),
        };

        let handle = state.next_handle;
        state.next_handle += 1;
        state.loaded.insert(handle, template.clone());

        Ok(AttestationKey { handle, public })
    }

    fn flush_key(&self, handle: KeyHandle) -> Result<()> {
        let mut state = self.session()?;

        state.loaded.remove(&handle)
            .map(|_| ())
            .ok_or_else(|| error::device(format!("handle 0x{:08x} is not loaded", handle), None))
    }

    fn read_pcrs(&self, selection: &PcrSelection) -> Result<BTreeMap<u32, Vec<u8>>> {
        let state = self.session()?;
        check_selection(selection)?;

        Ok(selection.pcrs.iter()
            .filter_map(|pcr| state.pcrs.get(pcr).map(|v| (*pcr, v.to_vec())))
            .collect())
    }

    fn quote(&self, handle: KeyHandle, nonce: &[u8], selection: &PcrSelection) -> Result<RawQuote> {
        let mut state = self.session()?;
        check_selection(selection)?;

        if nonce.len() > MAX_NONCE_BYTES {
            return Err(error::device(format!("qualifying data of {} bytes exceeds TPM2B_DATA", nonce.len()), None));
        }

        let key = state.loaded.get(&handle)
            .and_then(|template| state.keys.get(template))
            .cloned()
            .ok_or_else(|| error::device(format!("handle 0x{:08x} is not loaded", handle), None))?;

        state.clock += 1;

        let values: Vec<&[u8]> = selection.pcrs.iter()
            .filter_map(|pcr| state.pcrs.get(pcr).map(|v| v.as_slice()))
            .collect();

        let info = QuoteInfo {
            magic: TPM_GENERATED_VALUE,
            attest_type: TPM_ST_ATTEST_QUOTE,
            qualified_signer: Vec::new(),
            extra_data: nonce.to_vec(),
            clock_info: ClockInfo { clock: state.clock, reset_count: 0, restart_count: 0, safe: true },
            firmware_version: FIRMWARE_VERSION,
            pcr_selections: vec![selection.clone()],
            pcr_digest: pcr_digest(values),
        };
        let attest = info.to_bytes()?;

        let signature = sign(&key, &attest)
            .map_err(|e| error::device(e, Some("failed to sign quote".into())))?;

        Ok(RawQuote { attest, signature: signature.to_bytes()? })
    }

    fn event_log(&self) -> Result<Vec<u8>> {
        let state = self.session()?;

        event_log::encode(&state.events)
    }

    fn close(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.open = false;
        Ok(())
    }
}

fn check_selection(selection: &PcrSelection) -> Result<()> {
    if selection.hash_alg != TPM_ALG_SHA256 {
        return Err(error::device(format!("PCR bank 0x{:04x} is not allocated", selection.hash_alg), None));
    }
    if selection.pcrs.iter().any(|pcr| *pcr >= PCR_COUNT) {
        return Err(error::device("PCR selection out of range", None));
    }
    Ok(())
}

fn generate_key(algo: KeyAlgo) -> std::result::Result<PKey<Private>, ErrorStack> {
    match algo {
        KeyAlgo::Rsa => PKey::from_rsa(Rsa::generate(2048)?),
        KeyAlgo::Ecc => {
            let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
            PKey::from_ec_key(EcKey::generate(&group)?)
        }
    }
}

fn sign(key: &PKey<Private>, message: &[u8]) -> std::result::Result<TpmSignature, ErrorStack> {
    match key.ec_key() {
        Ok(ec_key) => {
            let sig = EcdsaSig::sign(&sha256(message), &ec_key)?;
            Ok(TpmSignature::Ecdsa {
                r: to_coordinate(sig.r())?,
                s: to_coordinate(sig.s())?,
            })
        }
        Err(_) => {
            let mut signer = Signer::new(MessageDigest::sha256(), key)?;
            signer.update(message)?;
            Ok(TpmSignature::RsaSsa { sig: signer.sign_to_vec()? })
        }
    }
}

fn to_coordinate(value: &BigNumRef) -> std::result::Result<Vec<u8>, ErrorStack> {
    value.to_vec_padded(P256_COORDINATE_BYTES)
}

#[cfg(test)]
mod tests {
    use crate::error::Kind;
    use crate::options::KeyAlgo;
    use crate::tpm::device::{DeviceGuard, DeviceOpener, KeyTemplate, GCE_AK_TEMPLATE_NV_INDEX_RSA};
    use crate::tpm::event_log;
    use crate::tpm::platform::ConfidentialTechnology;
    use crate::tpm::structures::PcrSelection;

    use super::SimulatedTpm;

    #[test]
    fn exclusive_sessions() {
        let tpm = SimulatedTpm::new(ConfidentialTechnology::None);

        {
            let _guard = DeviceGuard::acquire(&tpm).unwrap();
            assert!(tpm.is_open());
            assert_eq!(tpm.open().err().unwrap().kind(), Kind::Device);
        }

        assert!(!tpm.is_open());
        assert!(DeviceGuard::acquire(&tpm).is_ok());
        assert_eq!(tpm.opens(), 2);
    }

    #[test]
    fn operations_require_open_session() {
        let tpm = SimulatedTpm::new(ConfidentialTechnology::None);

        let err = crate::tpm::device::RotDevice::event_log(&tpm).unwrap_err();

        assert_eq!(err.kind(), Kind::Device);
    }

    #[test]
    fn boot_log_replays_to_pcrs() {
        let tpm = SimulatedTpm::new(ConfidentialTechnology::AmdSevSnp);
        let device = DeviceGuard::acquire(&tpm).unwrap();

        let selection = PcrSelection::sha256(0..=7);
        let pcrs = device.read_pcrs(&selection).unwrap();
        let events = event_log::parse(&device.event_log().unwrap()).unwrap();
        let replayed = event_log::replay(&events, &selection.pcrs);

        for (pcr, value) in pcrs {
            assert_eq!(replayed[&pcr].to_vec(), value, "PCR {}", pcr);
        }
        assert_eq!(event_log::nonhost_technology(&events).unwrap(), ConfidentialTechnology::AmdSevSnp);
    }

    #[test]
    fn keys_are_stable_per_template() {
        let tpm = SimulatedTpm::new(ConfidentialTechnology::None);
        let device = DeviceGuard::acquire(&tpm).unwrap();

        let first = device.create_attestation_key(&KeyTemplate::Default(KeyAlgo::Ecc)).unwrap();
        let second = device.create_attestation_key(&KeyTemplate::Default(KeyAlgo::Ecc)).unwrap();

        assert_eq!(first.public, second.public);
        assert_ne!(first.handle, second.handle);
        assert_eq!(tpm.loaded_keys(), 2);

        device.flush_key(first.handle).unwrap();
        device.flush_key(second.handle).unwrap();
        assert_eq!(device.flush_key(second.handle).unwrap_err().kind(), Kind::Device);
    }

    #[test]
    fn gce_templates_must_be_provisioned() {
        let tpm = SimulatedTpm::new(ConfidentialTechnology::None).without_gce_templates();
        let device = DeviceGuard::acquire(&tpm).unwrap();

        let template = KeyTemplate::Nv { algo: KeyAlgo::Ecc, index: GCE_AK_TEMPLATE_NV_INDEX_RSA };

        assert_eq!(device.create_attestation_key(&template).unwrap_err().kind(), Kind::Device);
    }
}
