use prost::Message;

use crate::error::{self, Result};
use crate::options::Format;
use crate::record::Attestation;

/// Serializes `record` in the requested format. Identical records always yield
/// identical bytes. [`Format::Text`] is pretty JSON, not protobuf text format.
pub fn encode(record: &Attestation, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Binary => Ok(record.encode_to_vec()),
        Format::Text => serde_json::to_vec_pretty(record)
            .map_err(|e| error::conversion(e, Some("failed to marshal attestation record".into()))),
    }
}

pub fn decode(bytes: &[u8], format: Format) -> Result<Attestation> {
    match format {
        Format::Binary => Attestation::decode(bytes)
            .map_err(|e| error::decode(e, Some("fail to unmarshal attestation report".into()))),
        Format::Text => serde_json::from_slice(bytes)
            .map_err(|e| error::decode(e, Some("fail to unmarshal attestation report".into()))),
    }
}
