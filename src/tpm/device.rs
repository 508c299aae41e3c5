//! Root-of-trust device capability and its scoped guards.

use std::collections::BTreeMap;
use std::ops::Deref;

use log::{debug, warn};

use crate::error::{self, Result};
use crate::options::KeyAlgo;
use crate::record::Quote;
use crate::tpm::structures::{AkPublic, PcrSelection};

pub type KeyHandle = u32;

/// NV indices where GCE provisions attestation key templates.
pub const GCE_AK_TEMPLATE_NV_INDEX_RSA: u32 = 0x01c10001;
pub const GCE_AK_TEMPLATE_NV_INDEX_ECC: u32 = 0x01c10003;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum KeyTemplate {
    /// TCG default attestation key template.
    Default(KeyAlgo),
    /// Template read from a platform-provisioned NV index.
    Nv { algo: KeyAlgo, index: u32 },
}

impl KeyTemplate {
    pub fn algo(&self) -> KeyAlgo {
        match self {
            KeyTemplate::Default(algo) => *algo,
            KeyTemplate::Nv { algo, .. } => *algo,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttestationKey {
    pub handle: KeyHandle,
    pub public: AkPublic,
}

/// Marshalled TPMS_ATTEST and the TPMT_SIGNATURE over it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawQuote {
    pub attest: Vec<u8>,
    pub signature: Vec<u8>,
}

/// An open session with a root-of-trust device.
pub trait RotDevice {
    fn create_attestation_key(&self, template: &KeyTemplate) -> Result<AttestationKey>;

    fn flush_key(&self, handle: KeyHandle) -> Result<()>;

    fn read_pcrs(&self, selection: &PcrSelection) -> Result<BTreeMap<u32, Vec<u8>>>;

    fn quote(&self, handle: KeyHandle, nonce: &[u8], selection: &PcrSelection) -> Result<RawQuote>;

    /// The raw TCG measurement log.
    fn event_log(&self) -> Result<Vec<u8>>;

    fn close(&self) -> Result<()>;
}

pub trait DeviceOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn RotDevice>>;
}

/// Exclusive, call-scoped ownership of a device. Closed on drop.
pub struct DeviceGuard {
    device: Box<dyn RotDevice>,
}

impl DeviceGuard {
    pub fn acquire(opener: &dyn DeviceOpener) -> Result<Self> {
        let device = opener.open()
            .map_err(|e| e.context("failed to open TPM"))?;

        debug!("root-of-trust device acquired");

        Ok(Self { device })
    }
}

impl Deref for DeviceGuard {
    type Target = dyn RotDevice;

    fn deref(&self) -> &Self::Target {
        self.device.as_ref()
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if let Err(err) = self.device.close() {
            warn!("failed to close root-of-trust device: {:?}", err);
        }
    }
}

/// A loaded attestation key, flushed from the device on drop.
pub struct KeyGuard<'a> {
    device: &'a dyn RotDevice,
    key: AttestationKey,
}

impl<'a> KeyGuard<'a> {
    pub fn new(device: &'a dyn RotDevice, key: AttestationKey) -> Self {
        Self { device, key }
    }

    pub fn public(&self) -> &AkPublic {
        &self.key.public
    }

    /// Quotes `selection` under `nonce` together with the quoted PCR values.
    pub fn quote(&self, nonce: &[u8], selection: &PcrSelection) -> Result<Quote> {
        let pcrs = self.device.read_pcrs(selection)?;
        let raw = self.device.quote(self.key.handle, nonce, selection)?;

        Ok(Quote {
            hash_alg: selection.hash_alg as u32,
            pcrs,
            quote: raw.attest,
            raw_sig: raw.signature,
        })
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.device.flush_key(self.key.handle) {
            warn!("failed to flush attestation key 0x{:08x}: {:?}", self.key.handle, err);
        }
    }
}

pub(crate) fn closed_device() -> error::Error {
    error::device("device is closed", None)
}
