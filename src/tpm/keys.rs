use std::collections::HashMap;

use crate::error::{invalid_argument, Result};
use crate::options::{KeyAlgo, KeyType};
use crate::tpm::device::{AttestationKey, KeyTemplate, RotDevice,
                         GCE_AK_TEMPLATE_NV_INDEX_ECC, GCE_AK_TEMPLATE_NV_INDEX_RSA};

pub type DeriveKeyFn = fn(&dyn RotDevice) -> Result<AttestationKey>;

pub fn attestation_key_rsa(device: &dyn RotDevice) -> Result<AttestationKey> {
    device.create_attestation_key(&KeyTemplate::Default(KeyAlgo::Rsa))
}

pub fn attestation_key_ecc(device: &dyn RotDevice) -> Result<AttestationKey> {
    device.create_attestation_key(&KeyTemplate::Default(KeyAlgo::Ecc))
}

pub fn gce_attestation_key_rsa(device: &dyn RotDevice) -> Result<AttestationKey> {
    device.create_attestation_key(&KeyTemplate::Nv { algo: KeyAlgo::Rsa, index: GCE_AK_TEMPLATE_NV_INDEX_RSA })
}

pub fn gce_attestation_key_ecc(device: &dyn RotDevice) -> Result<AttestationKey> {
    device.create_attestation_key(&KeyTemplate::Nv { algo: KeyAlgo::Ecc, index: GCE_AK_TEMPLATE_NV_INDEX_ECC })
}

/// `(KeyType, KeyAlgo)` to key derivation. Both axes must be present to resolve.
#[derive(Clone)]
pub struct KeyRegistry {
    table: HashMap<KeyType, HashMap<KeyAlgo, DeriveKeyFn>>,
}

impl KeyRegistry {
    pub fn empty() -> Self {
        Self { table: HashMap::new() }
    }

    pub fn register(mut self, key: KeyType, algo: KeyAlgo, derive: DeriveKeyFn) -> Self {
        self.table.entry(key).or_default().insert(algo, derive);
        self
    }

    pub fn resolve(&self, key: KeyType, algo: KeyAlgo) -> Result<DeriveKeyFn> {
        let by_algo = self.table.get(&key)
            .ok_or_else(|| invalid_argument(format!("no attestation key registered for key type {}", key)))?;

        by_algo.get(&algo)
            .copied()
            .ok_or_else(|| invalid_argument(format!("key type {} does not support algorithm {}", key, algo)))
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::empty()
            .register(KeyType::Ak, KeyAlgo::Rsa, attestation_key_rsa)
            .register(KeyType::Ak, KeyAlgo::Ecc, attestation_key_ecc)
            .register(KeyType::GceAk, KeyAlgo::Rsa, gce_attestation_key_rsa)
            .register(KeyType::GceAk, KeyAlgo::Ecc, gce_attestation_key_ecc)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Kind;
    use crate::options::{KeyAlgo, KeyType};

    use super::{attestation_key_rsa, KeyRegistry};

    #[test]
    fn default_covers_every_combination() {
        let registry = KeyRegistry::default();

        for key in [KeyType::Ak, KeyType::GceAk] {
            for algo in [KeyAlgo::Rsa, KeyAlgo::Ecc] {
                assert!(registry.resolve(key, algo).is_ok(), "{} / {}", key, algo);
            }
        }
    }

    #[test]
    fn missing_key_type() {
        let err = KeyRegistry::empty().resolve(KeyType::Ak, KeyAlgo::Rsa).unwrap_err();

        assert_eq!(err.kind(), Kind::InvalidArgument);
    }

    #[test]
    fn missing_algorithm_for_known_key_type() {
        let registry = KeyRegistry::empty()
            .register(KeyType::Ak, KeyAlgo::Rsa, attestation_key_rsa);

        assert!(registry.resolve(KeyType::Ak, KeyAlgo::Rsa).is_ok());
        assert_eq!(registry.resolve(KeyType::Ak, KeyAlgo::Ecc).unwrap_err().kind(), Kind::InvalidArgument);
    }
}
