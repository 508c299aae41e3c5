pub mod error;
pub mod common;
pub mod options;
pub mod record;
pub mod tpm;
pub mod tee;
pub mod metadata;
pub mod attest;
pub mod verify;
pub mod ffi;

pub use error::{Error, Kind as ErrorKind, Result};
pub use options::{AttestOptions, Format, KeyAlgo, KeyType, TeeTechnology};
pub use record::{Attestation, TeeAttestation};
pub use attest::Attester;
pub use verify::{verify_attestation, MachineState, Verifier};
