//! Intel TDX quotes.

pub mod quote;
pub mod tsm;
pub mod verify;

pub use quote::{QuoteV4, QUOTE_VERSION_4};
pub use tsm::TsmReportProvider;
pub use verify::TdxQuoteVerifier;
