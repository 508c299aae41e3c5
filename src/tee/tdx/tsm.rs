//! TD quotes through the kernel's configfs-tsm report interface.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};

use crate::common::env::{ENV_TSM_REPORT_PATH_DEFAULT, ENV_TSM_REPORT_PATH_KEY};
use crate::error::{self, Result};
use crate::options::TeeTechnology;
use crate::record::{TdxAttestation, TeeAttestation};
use crate::tee::{ReportData, TeeProvider};

const TDX_PROVIDER: &str = "tdx_guest";

static ENTRY_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct TsmReportProvider {
    root: PathBuf,
}

impl TsmReportProvider {
    /// Opens the report interface at `CVM_TSM_REPORT_PATH` or the kernel default.
    pub fn open() -> Result<Self> {
        let root = env::var(ENV_TSM_REPORT_PATH_KEY)
            .unwrap_or(ENV_TSM_REPORT_PATH_DEFAULT.to_string());

        Self::open_at(root)
    }

    pub fn open_at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        if !root.is_dir() {
            return Err(error::device(format!("{} is not a directory", root.display()),
                                     Some("configfs-tsm report interface not available".into())));
        }

        Ok(Self { root })
    }

    pub fn get_quote(&self, report_data: &ReportData) -> Result<Vec<u8>> {
        let entry = ReportEntry::create(&self.root)?;

        let provider = entry.read_string("provider")?;
        if provider.trim() != TDX_PROVIDER {
            return Err(error::device(format!("report provider is '{}'", provider.trim()),
                                     Some(format!("expected {}", TDX_PROVIDER))));
        }

        let generation = entry.read_string("generation")?;
        entry.write("inblob", report_data)?;
        let quote = entry.read("outblob")?;

        // Another writer to the same entry invalidates the quote.
        let expected: u64 = generation.trim().parse::<u64>().map_err(error::map_conversion_err)? + 1;
        let actual: u64 = entry.read_string("generation")?.trim().parse().map_err(error::map_conversion_err)?;
        if actual != expected {
            return Err(error::device(format!("report generation {} != {}", actual, expected),
                                     Some("concurrent use of the TSM report entry".into())));
        }

        debug!("retrieved {} byte TD quote", quote.len());

        Ok(quote)
    }
}

impl TeeProvider for TsmReportProvider {
    fn technology(&self) -> TeeTechnology {
        TeeTechnology::Tdx
    }

    fn get_evidence(&self, report_data: &ReportData) -> Result<TeeAttestation> {
        Ok(TeeAttestation::TdxAttestation(TdxAttestation {
            quote: self.get_quote(report_data)?,
        }))
    }
}

/// A report directory, removed on drop.
struct ReportEntry {
    path: PathBuf,
}

impl ReportEntry {
    fn create(root: &Path) -> Result<Self> {
        let name = format!("cvm-attestation-{}-{}", std::process::id(),
                           ENTRY_COUNTER.fetch_add(1, Ordering::Relaxed));
        let path = root.join(name);

        fs::create_dir(&path)
            .map_err(|e| error::device(e, Some(format!("failed to create {}", path.display()))))?;

        Ok(Self { path })
    }

    fn read(&self, attribute: &str) -> Result<Vec<u8>> {
        let path = self.path.join(attribute);
        fs::read(&path)
            .map_err(|e| error::device(e, Some(format!("failed to read {}", path.display()))))
    }

    fn read_string(&self, attribute: &str) -> Result<String> {
        String::from_utf8(self.read(attribute)?).map_err(error::map_conversion_err)
    }

    fn write(&self, attribute: &str, data: &[u8]) -> Result<()> {
        let path = self.path.join(attribute);
        fs::write(&path, data)
            .map_err(|e| error::device(e, Some(format!("failed to write {}", path.display()))))
    }
}

impl Drop for ReportEntry {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir(&self.path) {
            warn!("failed to remove {}: {:?}", self.path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Kind;

    use super::TsmReportProvider;

    #[test]
    fn missing_report_interface() {
        let err = TsmReportProvider::open_at("/nonexistent/config/tsm/report").err().unwrap();

        assert_eq!(err.kind(), Kind::Device);
    }
}
