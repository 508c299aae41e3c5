//! Root of trust backed by the platform TPM through the TSS2 ESAPI.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::debug;
use tss_esapi::handles::{KeyHandle as EsysKeyHandle, NvIndexHandle, NvIndexTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::resource_handles::{Hierarchy, NvAuth};
use tss_esapi::structures::{Data, PcrSelectionList, PcrSlot, Public, SignatureScheme};
use tss_esapi::tcti_ldr::{DeviceConfig, TctiNameConf};
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::Context;

use crate::common::env::{ENV_TPM_DEVICE_PATH_DEFAULT, ENV_TPM_DEVICE_PATH_KEY,
                         ENV_TPM_EVENT_LOG_PATH_DEFAULT, ENV_TPM_EVENT_LOG_PATH_KEY};
use crate::error::{self, Result};
use crate::tpm::device::{closed_device, AttestationKey, DeviceOpener, KeyHandle, KeyTemplate,
                         RawQuote, RotDevice};
use crate::tpm::structures::{AkPublic, PcrSelection, TPM_ALG_SHA256};

/// TPM2_PCR_Read returns at most eight digests per call.
const PCR_READ_BATCH: usize = 8;
const NV_READ_CHUNK: usize = 512;
const FIRST_KEY_HANDLE: KeyHandle = 1;

const PCR_SLOTS: [PcrSlot; 24] = [
    PcrSlot::Slot0,
    PcrSlot::Slot1,
    PcrSlot::Slot2,
    PcrSlot::Slot3,
    PcrSlot::Slot4,
    PcrSlot::Slot5,
    PcrSlot::Slot6,
    PcrSlot::Slot7,
    PcrSlot::Slot8,
    PcrSlot::Slot9,
    PcrSlot::Slot10,
    PcrSlot::Slot11,
    PcrSlot::Slot12,
    PcrSlot::Slot13,
    PcrSlot::Slot14,
    PcrSlot::Slot15,
    PcrSlot::Slot16,
    PcrSlot::Slot17,
    PcrSlot::Slot18,
    PcrSlot::Slot19,
    PcrSlot::Slot20,
    PcrSlot::Slot21,
    PcrSlot::Slot22,
    PcrSlot::Slot23,
];

fn tpm_err(msg: &'static str) -> impl Fn(tss_esapi::Error) -> error::Error {
    move |e| error::device(e.to_string(), Some(msg.into()))
}

/// Opens sessions with the TPM character device.
#[derive(Clone, Debug)]
pub struct HardwareTpmOpener {
    device_path: PathBuf,
    event_log_path: PathBuf,
}

impl HardwareTpmOpener {
    /// Uses `CVM_TPM_DEVICE_PATH` and `CVM_TPM_EVENT_LOG_PATH`, or the kernel
    /// resource manager and securityfs defaults.
    pub fn new() -> Self {
        let device_path = env::var(ENV_TPM_DEVICE_PATH_KEY)
            .unwrap_or(ENV_TPM_DEVICE_PATH_DEFAULT.to_string());
        let event_log_path = env::var(ENV_TPM_EVENT_LOG_PATH_KEY)
            .unwrap_or(ENV_TPM_EVENT_LOG_PATH_DEFAULT.to_string());

        Self::with_paths(device_path, event_log_path)
    }

    pub fn with_paths(device_path: impl Into<PathBuf>, event_log_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
            event_log_path: event_log_path.into(),
        }
    }
}

impl Default for HardwareTpmOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceOpener for HardwareTpmOpener {
    fn open(&self) -> Result<Box<dyn RotDevice>> {
        let path = self.device_path.to_str()
            .ok_or_else(|| error::invalid_argument(format!("TPM path {} is not UTF-8", self.device_path.display())))?;

        let config = DeviceConfig::from_str(path)
            .map_err(tpm_err("invalid TPM device path"))?;
        let context = Context::new(TctiNameConf::Device(config))
            .map_err(|e| error::device(e.to_string(), Some(format!("failed to open {}", path))))?;

        debug!("opened TPM at {}", path);

        Ok(Box::new(HardwareTpm {
            session: RefCell::new(Some(Session {
                context,
                keys: HashMap::new(),
                next_handle: FIRST_KEY_HANDLE,
            })),
            event_log_path: self.event_log_path.clone(),
        }))
    }
}

struct Session {
    context: Context,
    keys: HashMap<KeyHandle, EsysKeyHandle>,
    next_handle: KeyHandle,
}

/// One ESAPI session. The context is dropped on `close`.
pub struct HardwareTpm {
    session: RefCell<Option<Session>>,
    event_log_path: PathBuf,
}

impl HardwareTpm {
    fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let mut session = self.session.try_borrow_mut()
            .map_err(|_| error::device("TPM session is busy", None))?;
        let session = session.as_mut().ok_or_else(closed_device)?;

        f(session)
    }
}

impl RotDevice for HardwareTpm {
    fn create_attestation_key(&self, template: &KeyTemplate) -> Result<AttestationKey> {
        self.with_session(|session| {
            let template = match template {
                KeyTemplate::Default(algo) => AkPublic::template(*algo).to_bytes()?,
                KeyTemplate::Nv { index, .. } => read_nv(&mut session.context, *index)
                    .map_err(|e| e.context("failed to read key template"))?,
            };
            let public = Public::unmarshall(&template)
                .map_err(tpm_err("invalid key template"))?;

            let created = session.context
                .execute_with_nullauth_session(|ctx| {
                    ctx.create_primary(Hierarchy::Endorsement, public, None, None, None, None)
                })
                .map_err(tpm_err("failed to create attestation key"))?;

            let out_public = created.out_public.marshall()
                .map_err(tpm_err("failed to marshal attestation key"))?;
            let public = AkPublic::from_bytes(&out_public)
                .map_err(|e| e.context("TPM returned an unsupported attestation key"))?;

            let handle = session.next_handle;
            session.next_handle += 1;
            session.keys.insert(handle, created.key_handle);

            Ok(AttestationKey { handle, public })
        })
    }

    fn flush_key(&self, handle: KeyHandle) -> Result<()> {
        self.with_session(|session| {
            let key = session.keys.remove(&handle)
                .ok_or_else(|| error::device(format!("handle 0x{:08x} is not loaded", handle), None))?;

            session.context.flush_context(key.into())
                .map_err(tpm_err("failed to flush attestation key"))
        })
    }

    fn read_pcrs(&self, selection: &PcrSelection) -> Result<BTreeMap<u32, Vec<u8>>> {
        check_bank(selection)?;

        self.with_session(|session| {
            let mut values = BTreeMap::new();

            for batch in selection.pcrs.chunks(PCR_READ_BATCH) {
                let (_, _, digests) = session.context.pcr_read(selection_list(batch)?)
                    .map_err(tpm_err("failed to read PCRs"))?;

                let digests = digests.value();
                if digests.len() != batch.len() {
                    return Err(error::device(format!("read {} of {} PCRs", digests.len(), batch.len()),
                                             Some("PCR bank is not fully allocated".into())));
                }
                for (pcr, digest) in batch.iter().zip(digests) {
                    values.insert(*pcr, digest.value().to_vec());
                }
            }

            Ok(values)
        })
    }

    fn quote(&self, handle: KeyHandle, nonce: &[u8], selection: &PcrSelection) -> Result<RawQuote> {
        check_bank(selection)?;
        let pcrs = selection_list(&selection.pcrs)?;
        let nonce = Data::try_from(nonce.to_vec())
            .map_err(tpm_err("nonce does not fit a TPM2B_DATA"))?;

        self.with_session(|session| {
            let key = *session.keys.get(&handle)
                .ok_or_else(|| error::device(format!("handle 0x{:08x} is not loaded", handle), None))?;

            let (attest, signature) = session.context
                .execute_with_nullauth_session(|ctx| ctx.quote(key, nonce, SignatureScheme::Null, pcrs))
                .map_err(tpm_err("failed to quote"))?;

            Ok(RawQuote {
                attest: attest.marshall().map_err(tpm_err("failed to marshal quote"))?,
                signature: signature.marshall().map_err(tpm_err("failed to marshal quote signature"))?,
            })
        })
    }

    fn event_log(&self) -> Result<Vec<u8>> {
        read_event_log(&self.event_log_path)
    }

    fn close(&self) -> Result<()> {
        let mut session = self.session.try_borrow_mut()
            .map_err(|_| error::device("TPM session is busy", None))?;

        if session.take().is_some() {
            debug!("closed TPM session");
        }

        Ok(())
    }
}

fn check_bank(selection: &PcrSelection) -> Result<()> {
    if selection.hash_alg != TPM_ALG_SHA256 {
        return Err(error::device(format!("PCR bank 0x{:04x} is not supported", selection.hash_alg), None));
    }
    Ok(())
}

fn pcr_slots(pcrs: &[u32]) -> Result<Vec<PcrSlot>> {
    pcrs.iter()
        .map(|pcr| PCR_SLOTS.get(*pcr as usize).copied()
            .ok_or_else(|| error::device(format!("PCR {} out of range", pcr), None)))
        .collect()
}

fn selection_list(pcrs: &[u32]) -> Result<PcrSelectionList> {
    PcrSelectionList::builder()
        .with_selection(HashingAlgorithm::Sha256, &pcr_slots(pcrs)?)
        .build()
        .map_err(tpm_err("invalid PCR selection"))
}

/// Reads a whole NV index, authorizing with the index itself.
fn read_nv(context: &mut Context, index: u32) -> Result<Vec<u8>> {
    let nv_index = NvIndexTpmHandle::new(index)
        .map_err(tpm_err("invalid NV index"))?;
    let handle: NvIndexHandle = context.tr_from_tpm_public(TpmHandle::NvIndex(nv_index))
        .map_err(|e| error::device(e.to_string(), Some(format!("NV index 0x{:08x} is not defined", index))))?
        .into();

    let (public, _) = context.nv_read_public(handle)
        .map_err(tpm_err("failed to read NV public area"))?;
    let size = public.data_size();

    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        let chunk = (size - data.len()).min(NV_READ_CHUNK) as u16;
        let offset = data.len() as u16;

        let buffer = context
            .execute_with_nullauth_session(|ctx| ctx.nv_read(NvAuth::NvIndex(handle), handle, chunk, offset))
            .map_err(tpm_err("failed to read NV index"))?;
        if buffer.value().is_empty() {
            return Err(error::device(format!("NV index 0x{:08x} returned no data", index), None));
        }
        data.extend_from_slice(buffer.value());
    }

    Ok(data)
}

fn read_event_log(path: &Path) -> Result<Vec<u8>> {
    fs::read(path)
        .map_err(|e| error::device(e, Some(format!("failed to read {}", path.display()))))
}
