#![cfg_attr(target_arch = "wasm32", allow(unused))]
use std::error::Error as StdError;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

pub struct Error {
    inner: Box<Inner>,
}

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

struct Inner {
    kind: Kind,
    msg: Option<String>,
    source: Option<BoxError>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, msg: Option<String>, source: Option<E>) -> Error
        where
            E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                msg,
                source: source.map(Into::into),
            }),
        }
    }

    pub(crate) fn new_msg(kind: Kind, msg: Option<String>) -> Error
    {
        Error {
            inner: Box::new(Inner {
                kind,
                msg,
                source: None
            }),
        }
    }

    /// The failure class this error belongs to.
    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    /// Prefixes the message with the stage that produced the failure, keeping
    /// the kind and source intact.
    pub(crate) fn context(mut self, stage: impl Into<String>) -> Error {
        let stage = stage.into();
        self.inner.msg = Some(match self.inner.msg.take() {
            Some(msg) => format!("{}: {}", stage, msg),
            None => stage,
        });
        self
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("cvm_attestation::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref msg) = self.inner.msg {
            builder.field("msg", msg);
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::InvalidArgument => f.write_str("invalid argument")?,
            Kind::Device => f.write_str("device error")?,
            Kind::Decode => f.write_str("decode error")?,
            Kind::Verification => f.write_str("verification error")?,
            Kind::TypeMismatch => f.write_str("type mismatch")?,
            Kind::UnsupportedTechnology => f.write_str("unsupported technology")?,
            Kind::Fetch => f.write_str("fetch error")?,
            Kind::Io => f.write_str("io error")?,
            Kind::Conversion => f.write_str("conversion error")?,
            Kind::Cert => f.write_str("cert error")?,
        };

        if let Some(msg) = &self.inner.msg {
            write!(f, ": {}", msg)?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {}", e)?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Kind {
    /// Rejected caller input: format, key type, algorithm, technology, nonce.
    InvalidArgument,
    /// Root-of-trust or TEE device access failed.
    Device,
    /// Malformed wire bytes or embedded structures.
    Decode,
    /// Signature, freshness or chain-of-trust check failed.
    Verification,
    /// Evidence variant disagrees with the verified technology.
    TypeMismatch,
    UnsupportedTechnology,
    Fetch,
    Io,
    Conversion,
    Cert,
}

// constructors

pub(crate) fn invalid_argument(msg: impl Into<String>) -> Error {
    Error::new_msg(Kind::InvalidArgument, Some(msg.into()))
}

pub(crate) fn device<E: Into<BoxError>>(e: E, msg: Option<String>) -> Error {
    Error::new(Kind::Device, msg, Some(e))
}

pub(crate) fn decode<E: Into<BoxError>>(e: E, msg: Option<String>) -> Error {
    Error::new(Kind::Decode, msg, Some(e))
}

pub(crate) fn map_decode_err<E: Into<BoxError>>(e: E) -> Error {
    decode(e, None)
}

pub(crate) fn verification(msg: impl Into<String>) -> Error {
    Error::new_msg(Kind::Verification, Some(msg.into()))
}

pub(crate) fn type_mismatch(msg: impl Into<String>) -> Error {
    Error::new_msg(Kind::TypeMismatch, Some(msg.into()))
}

pub(crate) fn unsupported_technology(msg: impl Into<String>) -> Error {
    Error::new_msg(Kind::UnsupportedTechnology, Some(msg.into()))
}

pub(crate) fn conversion<E: Into<BoxError>>(e: E, msg: Option<String>) -> Error {
    Error::new(Kind::Conversion, msg, Some(e))
}

pub(crate) fn fetch<E: Into<BoxError>>(e: E, msg: Option<String>) -> Error {
    Error::new(Kind::Fetch, msg, Some(e))
}

pub(crate) fn io<E: Into<BoxError>>(e: E, msg: Option<String>) -> Error {
    Error::new(Kind::Io, msg, Some(e))
}

pub(crate) fn map_io_err<E: Into<BoxError>>(e: E) -> Error {
    io(e, None)
}

pub(crate) fn cert(msg: Option<String>) -> Error {
    Error::new_msg(Kind::Cert, msg)
}

pub(crate) fn map_conversion_err<E: Into<BoxError>>(e: E) -> Error {
    conversion(e, None)
}
