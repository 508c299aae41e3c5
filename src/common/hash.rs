use sha2::{Digest, Sha384, Sha256};
use sha2::digest::Output;

pub fn sha384(data: impl AsRef<[u8]>) -> Output<Sha384> {
    let mut hasher = Sha384::new();
    hasher.update(data);
    hasher.finalize()
}

pub fn sha256(data: impl AsRef<[u8]>) -> Output<Sha256> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize()
}

/// TPM2_PCR_Extend semantics for the SHA-256 bank.
pub fn sha256_extend(pcr: &[u8], digest: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(pcr);
    hasher.update(digest);
    hasher.finalize().into()
}
