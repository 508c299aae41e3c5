//! Closed configuration for producing and verifying an attestation.

use std::fmt;
use std::str::FromStr;

use crate::error::{invalid_argument, Error, Result};
use crate::tee::REPORT_DATA_BYTES;

/// Device name for [`TeeTechnology::SevSnp`].
pub const SEV_SNP: &str = "sev-snp";
/// Device name for [`TeeTechnology::Tdx`].
pub const TDX: &str = "tdx";

/// Largest nonce a TPM accepts as quote qualifying data (TPM2B_DATA).
pub const MAX_NONCE_BYTES: usize = 64;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KeyType {
    /// TCG default attestation key template.
    Ak,
    /// Attestation key provisioned by GCE in TPM NV storage.
    GceAk,
}

impl FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "AK" => Ok(KeyType::Ak),
            "gceAK" => Ok(KeyType::GceAk),
            _ => Err(invalid_argument(format!("key should be either AK or gceAK, got '{}'", s))),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Ak => f.write_str("AK"),
            KeyType::GceAk => f.write_str("gceAK"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KeyAlgo {
    Rsa,
    Ecc,
}

impl FromStr for KeyAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RSA" => Ok(KeyAlgo::Rsa),
            "ECC" => Ok(KeyAlgo::Ecc),
            _ => Err(invalid_argument(format!("key algorithm should be either RSA or ECC, got '{}'", s))),
        }
    }
}

impl fmt::Display for KeyAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgo::Rsa => f.write_str("RSA"),
            KeyAlgo::Ecc => f.write_str("ECC"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum TeeTechnology {
    #[default]
    None,
    SevSnp,
    Tdx,
}

impl FromStr for TeeTechnology {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Ok(TeeTechnology::None),
            SEV_SNP => Ok(TeeTechnology::SevSnp),
            TDX => Ok(TeeTechnology::Tdx),
            _ => Err(invalid_argument(format!(
                "tee-technology should be either empty or should have values {} or {}, got '{}'",
                SEV_SNP, TDX, s))),
        }
    }
}

impl fmt::Display for TeeTechnology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeeTechnology::None => f.write_str("none"),
            TeeTechnology::SevSnp => f.write_str(SEV_SNP),
            TeeTechnology::Tdx => f.write_str(TDX),
        }
    }
}

/// Serialization of the attestation record.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Format {
    /// Canonical protobuf binary encoding, for transport.
    #[default]
    Binary,
    /// Canonical multi-line text encoding with a fixed two-space indent.
    ///
    /// Selected by the `textproto` configuration string, but the encoding is
    /// pretty-printed JSON with hex byte fields, not protobuf text format.
    Text,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Binary => "binarypb",
            Format::Text => "textproto",
        }
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "binarypb" => Ok(Format::Binary),
            "textproto" => Ok(Format::Text),
            _ => Err(invalid_argument(format!("format should be either binarypb or textproto, got '{}'", s))),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for a single [`crate::attest::Attester::attest`] call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttestOptions {
    pub key: KeyType,
    pub key_algo: KeyAlgo,
    /// Freshness challenge bound into the TPM quote.
    pub nonce: Vec<u8>,
    pub tee_technology: TeeTechnology,
    /// Challenge bound into the TEE report data; the TPM nonce is used when empty.
    pub tee_nonce: Vec<u8>,
    pub format: Format,
}

impl Default for AttestOptions {
    fn default() -> Self {
        Self {
            key: KeyType::Ak,
            key_algo: KeyAlgo::Rsa,
            nonce: Vec::new(),
            tee_technology: TeeTechnology::None,
            tee_nonce: Vec::new(),
            format: Format::Binary,
        }
    }
}

impl AttestOptions {
    /// Checks the cross-field invariants. Runs before any device is touched.
    pub fn validate(&self) -> Result<()> {
        if self.nonce.len() > MAX_NONCE_BYTES {
            return Err(invalid_argument(format!("nonce must be at most {} bytes, got {}",
                                                MAX_NONCE_BYTES, self.nonce.len())));
        }

        match self.tee_technology {
            TeeTechnology::None => {
                if !self.tee_nonce.is_empty() {
                    return Err(invalid_argument(
                        "use of TeeNonce requires specifying TEE hardware type with TeeTechnology"));
                }
            }
            TeeTechnology::SevSnp | TeeTechnology::Tdx => {
                if self.tee_report_nonce().len() > REPORT_DATA_BYTES {
                    return Err(invalid_argument(format!("TEE nonce must be at most {} bytes, got {}",
                                                        REPORT_DATA_BYTES, self.tee_report_nonce().len())));
                }
            }
        }

        Ok(())
    }

    /// The value bound into the TEE report data.
    pub fn tee_report_nonce(&self) -> &[u8] {
        if self.tee_nonce.is_empty() {
            &self.nonce
        } else {
            &self.tee_nonce
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Kind;

    use super::{AttestOptions, Format, KeyAlgo, KeyType, TeeTechnology};

    #[test]
    fn parse_configuration_strings() {
        assert_eq!("AK".parse::<KeyType>().unwrap(), KeyType::Ak);
        assert_eq!("gceAK".parse::<KeyType>().unwrap(), KeyType::GceAk);
        assert_eq!("ecc".parse::<KeyAlgo>().unwrap(), KeyAlgo::Ecc);
        assert_eq!("".parse::<TeeTechnology>().unwrap(), TeeTechnology::None);
        assert_eq!("sev-snp".parse::<TeeTechnology>().unwrap(), TeeTechnology::SevSnp);
        assert_eq!("tdx".parse::<TeeTechnology>().unwrap(), TeeTechnology::Tdx);
        assert_eq!("textproto".parse::<Format>().unwrap(), Format::Text);
        assert_eq!(Format::Binary.to_string(), "binarypb");
    }

    #[test]
    fn reject_unknown_values() {
        assert_eq!("foo".parse::<KeyType>().unwrap_err().kind(), Kind::InvalidArgument);
        assert_eq!("DSA".parse::<KeyAlgo>().unwrap_err().kind(), Kind::InvalidArgument);
        assert_eq!("sev".parse::<TeeTechnology>().unwrap_err().kind(), Kind::InvalidArgument);
        assert_eq!("json".parse::<Format>().unwrap_err().kind(), Kind::InvalidArgument);
    }

    #[test]
    fn defaults() {
        let opts = AttestOptions::default();

        assert_eq!(opts.key, KeyType::Ak);
        assert_eq!(opts.key_algo, KeyAlgo::Rsa);
        assert_eq!(opts.tee_technology, TeeTechnology::None);
        assert_eq!(opts.format, Format::Binary);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn tee_nonce_requires_technology() {
        let opts = AttestOptions {
            tee_nonce: b"tee".to_vec(),
            ..Default::default()
        };

        assert_eq!(opts.validate().unwrap_err().kind(), Kind::InvalidArgument);

        let opts = AttestOptions {
            tee_technology: TeeTechnology::Tdx,
            ..opts
        };

        assert!(opts.validate().is_ok());
    }

    #[test]
    fn tee_report_nonce_falls_back_to_nonce() {
        let mut opts = AttestOptions {
            nonce: b"tpm".to_vec(),
            tee_technology: TeeTechnology::SevSnp,
            ..Default::default()
        };

        assert_eq!(opts.tee_report_nonce(), b"tpm");

        opts.tee_nonce = b"tee".to_vec();

        assert_eq!(opts.tee_report_nonce(), b"tee");
    }

    #[test]
    fn oversized_nonces() {
        let opts = AttestOptions {
            nonce: vec![1; 65],
            ..Default::default()
        };

        assert_eq!(opts.validate().unwrap_err().kind(), Kind::InvalidArgument);

        let opts = AttestOptions {
            tee_technology: TeeTechnology::SevSnp,
            tee_nonce: vec![1; 65],
            ..Default::default()
        };

        assert_eq!(opts.validate().unwrap_err().kind(), Kind::InvalidArgument);
    }
}
