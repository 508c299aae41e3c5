use std::collections::BTreeMap;

use serde::Serialize;

use crate::common::hex_serde;
use crate::tpm::event_log::PcrEvent;

/// Confidential-computing technology reported by the platform firmware.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidentialTechnology {
    #[default]
    None,
    AmdSev,
    AmdSevEs,
    IntelTdx,
    AmdSevSnp,
    Unknown(u8),
}

impl From<u8> for ConfidentialTechnology {
    fn from(value: u8) -> Self {
        match value {
            0 => ConfidentialTechnology::None,
            1 => ConfidentialTechnology::AmdSev,
            2 => ConfidentialTechnology::AmdSevEs,
            3 => ConfidentialTechnology::IntelTdx,
            4 => ConfidentialTechnology::AmdSevSnp,
            other => ConfidentialTechnology::Unknown(other),
        }
    }
}

impl From<ConfidentialTechnology> for u8 {
    fn from(value: ConfidentialTechnology) -> Self {
        match value {
            ConfidentialTechnology::None => 0,
            ConfidentialTechnology::AmdSev => 1,
            ConfidentialTechnology::AmdSevEs => 2,
            ConfidentialTechnology::IntelTdx => 3,
            ConfidentialTechnology::AmdSevSnp => 4,
            ConfidentialTechnology::Unknown(other) => other,
        }
    }
}

/// Platform facts established by a verified quote and its replayed log.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PlatformState {
    pub technology: ConfidentialTechnology,
    pub firmware_version: u64,
    /// Quoted SHA-256 PCR values.
    #[serde(with = "hex_serde::map")]
    pub pcrs: BTreeMap<u32, Vec<u8>>,
    /// Log entries whose PCRs are covered by the quote.
    pub events: Vec<PcrEvent>,
}
