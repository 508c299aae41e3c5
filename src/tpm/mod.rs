//! Root-of-trust layer: TPM 2.0 quotes over a measured boot log.

pub mod device;
pub mod event_log;
#[cfg(feature = "hardware-tpm")]
pub mod hardware;
pub mod keys;
pub mod platform;
pub mod simulated;
pub mod structures;
pub mod verify;

pub use device::{AttestationKey, DeviceGuard, DeviceOpener, KeyGuard, KeyTemplate, RotDevice};
#[cfg(feature = "hardware-tpm")]
pub use hardware::{HardwareTpm, HardwareTpmOpener};
pub use keys::{DeriveKeyFn, KeyRegistry};
pub use platform::{ConfidentialTechnology, PlatformState};
pub use simulated::SimulatedTpm;
pub use structures::{AkPublic, PcrSelection};
pub use verify::{QuoteVerifier, TpmQuoteVerifier};
