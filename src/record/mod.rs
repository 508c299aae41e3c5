//! The attestation record that crosses the untrusted channel.
//!
//! Messages are protobuf (`prost`) for the binary encoding and `serde` for the
//! text encoding. Byte fields are hex in text form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::hex_serde;
use crate::options::TeeTechnology;

pub mod codec;

pub use codec::{decode, encode};

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Attestation {
    /// Attestation key public area (TPMT_PUBLIC).
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "hex::serde")]
    pub ak_pub: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub quote: Option<Quote>,
    /// TCG crypto-agile measurement log.
    #[prost(bytes = "vec", tag = "3")]
    #[serde(with = "hex::serde")]
    pub event_log: Vec<u8>,
    #[prost(message, optional, tag = "4")]
    pub instance_info: Option<GceInstanceInfo>,
    #[prost(oneof = "TeeAttestation", tags = "5, 6")]
    pub tee_attestation: Option<TeeAttestation>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Quote {
    /// TPM_ALG_ID of the quoted PCR bank.
    #[prost(uint32, tag = "1")]
    pub hash_alg: u32,
    #[prost(btree_map = "uint32, bytes", tag = "2")]
    #[serde(with = "hex_serde::map")]
    pub pcrs: BTreeMap<u32, Vec<u8>>,
    /// Marshalled TPMS_ATTEST.
    #[prost(bytes = "vec", tag = "3")]
    #[serde(with = "hex::serde")]
    pub quote: Vec<u8>,
    /// Marshalled TPMT_SIGNATURE over `quote`.
    #[prost(bytes = "vec", tag = "4")]
    #[serde(with = "hex::serde")]
    pub raw_sig: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GceInstanceInfo {
    #[prost(string, tag = "1")]
    pub zone: String,
    #[prost(string, tag = "2")]
    pub project_id: String,
    #[prost(uint64, tag = "3")]
    pub project_number: u64,
    #[prost(string, tag = "4")]
    pub instance_name: String,
    #[prost(uint64, tag = "5")]
    pub instance_id: u64,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct SevSnpAttestation {
    /// Raw 1184-byte attestation report.
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "hex::serde")]
    pub report: Vec<u8>,
    /// DER certificates, leaf first: VCEK, ASK, ARK. May be empty.
    #[prost(bytes = "vec", repeated, tag = "2")]
    #[serde(with = "hex_serde::seq")]
    pub certificate_chain: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct TdxAttestation {
    /// Raw version 4 TD quote.
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "hex::serde")]
    pub quote: Vec<u8>,
}

/// Hardware evidence carried next to the TPM quote.
#[derive(Clone, PartialEq, Eq, ::prost::Oneof, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeeAttestation {
    #[prost(message, tag = "5")]
    SevSnpAttestation(SevSnpAttestation),
    #[prost(message, tag = "6")]
    TdxAttestation(TdxAttestation),
}

impl TeeAttestation {
    /// The technology that produces this kind of evidence.
    pub fn technology(&self) -> TeeTechnology {
        match self {
            TeeAttestation::SevSnpAttestation(_) => TeeTechnology::SevSnp,
            TeeAttestation::TdxAttestation(_) => TeeTechnology::Tdx,
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            TeeAttestation::SevSnpAttestation(_) => "SevSnpAttestation",
            TeeAttestation::TdxAttestation(_) => "TdxAttestation",
        }
    }
}

pub(crate) fn describe_tee_attestation(tee: Option<&TeeAttestation>) -> &'static str {
    tee.map(TeeAttestation::variant_name).unwrap_or("no TEE attestation")
}
