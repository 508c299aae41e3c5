use std::env;

use async_std::fs;
use async_std::path::Path;
use async_std::sync::Mutex;
use bytes::Bytes;
use cached::{Cached, SizedCache};
use log::warn;
use once_cell::sync::Lazy;
use openssl::x509::X509;
use pem::parse_many;

use crate::common::cache::{cache_dir_path, cache_file_path};
use crate::common::cert::x509_validate_signature;
use crate::common::env::{ENV_CACHE_MEM_CERT_LEN_DEFAULT, ENV_CACHE_MEM_CERT_LEN_KEY,
                         ENV_SNP_PRODUCT_DEFAULT, ENV_SNP_PRODUCT_KEY};
use crate::common::fetch::{fetch_url_cached, RetryPolicy};
use crate::common::file::{write_bytes_atomic, FileLock};
use crate::error::{self, Result};
use crate::tee::snp::report::{AttestationReport, TcbVersion};

pub(crate) const CACHE_PREFIX: &str = "certs";

const KDS_RETRY: RetryPolicy = RetryPolicy::new(10, 4000);

const KDS_CERT_SITE: &str = "https://kdsintf.amd.com";
const KDS_VCEK: &str = "/vcek/v1/";               // KDS_VCEK/{product_name}/{hwid}?{tcb parameter list}
const KDS_VCEK_CERT_CHAIN: &str = "cert_chain";   // KDS_VCEK/{product_name}/cert_chain

const ASK_DER_FILENAME: &str = "ask.der";
const ARK_DER_FILENAME: &str = "ark.der";

const KDS_FETCH_LOCK_FILE: &str = "kds_fetch.lock";

static ARK_CERT_CACHE: Lazy<Mutex<SizedCache<String, (X509, X509)>>> = Lazy::new(||
    Mutex::new(SizedCache::with_size(10)));
static VCEK_CERT_CACHE: Lazy<Mutex<SizedCache<String, X509>>> = Lazy::new(|| {
    let cache_size = env::var(ENV_CACHE_MEM_CERT_LEN_KEY)
        .ok()
        .and_then(|v| match v.parse::<usize>() {
            Ok(size) if size > 0 => Some(size),
            _ => {
                warn!("ignoring invalid '{}' value '{}'", ENV_CACHE_MEM_CERT_LEN_KEY, v);
                None
            }
        })
        .unwrap_or_else(|| ENV_CACHE_MEM_CERT_LEN_DEFAULT.parse().unwrap_or(100));

    Mutex::new(SizedCache::with_size(cache_size))
});

/// The SEV-SNP product line whose KDS endpoints are queried.
pub fn product_name() -> String {
    env::var(ENV_SNP_PRODUCT_KEY)
        .unwrap_or(ENV_SNP_PRODUCT_DEFAULT.to_string())
}

pub fn get_kds_vcek_cert_chain_url(product_name: &str) -> String {
    format!("{}{}{}/{}",
            KDS_CERT_SITE, KDS_VCEK, product_name, KDS_VCEK_CERT_CHAIN)
}

fn get_vcek_cache_suffix(product_name: &str) -> String {
    format!("{}/{}", CACHE_PREFIX, product_name)
}

pub async fn fetch_kds_vcek_cert_chain_pem(product_name: &str) -> Result<Bytes> {
    let save_path = format!("{}/{}.pem", get_vcek_cache_suffix(product_name),
                            KDS_VCEK_CERT_CHAIN
    );
    fetch_url_cached(
        get_kds_vcek_cert_chain_url(product_name).as_str(),
        save_path.as_str(), &KDS_RETRY,
    ).await
}

async fn read_cached(file: &Path, what: &str) -> Result<Bytes> {
    let bytes = fs::read(file).await
        .map_err(|e| error::io(e, Some(format!("failed to read {} file: {}", what, file.display()))))?;

    Ok(Bytes::from(bytes))
}

/// ARK and ASK DER bytes, in that order.
pub async fn get_kds_ark_ask_certs_bytes(product_name: &str) -> Result<(Bytes, Bytes)> {
    let cache_path = cache_dir_path(&get_vcek_cache_suffix(product_name), true).await?;

    let mut ask_file = cache_path.clone();
    ask_file.push(ASK_DER_FILENAME);

    let mut ark_file = cache_path.clone();
    ark_file.push(ARK_DER_FILENAME);

    {
        // Try read lock first and check if exists.
        let _guard = kds_fetch_lock(false).await?;

        if ask_file.exists().await && ark_file.exists().await {
            return Ok((read_cached(&ark_file, "ARK").await?, read_cached(&ask_file, "ASK").await?));
        }
    }

    // Not found, get a write lock.
    let _guard = kds_fetch_lock(true).await?;

    // Check one last time.
    if ask_file.exists().await && ark_file.exists().await {
        return Ok((read_cached(&ark_file, "ARK").await?, read_cached(&ask_file, "ASK").await?));
    }

    let body = fetch_kds_vcek_cert_chain_pem(product_name).await?;

    // The KDS chain lists the ASK first, then the ARK.
    let pems = parse_many(body)
        .map_err(|e| error::cert(Some(format!("failed to parse ARK cert chain into PEMs: {:?}", e))))?;
    if pems.len() != 2 {
        return Err(error::cert(Some(format!("failed to parse ARK cert chain - PEM count {} != 2", pems.len()))));
    }

    let ask_der_bytes = Bytes::from(pems[0].contents.clone());
    let ark_der_bytes = Bytes::from(pems[1].contents.clone());

    write_bytes_atomic(ask_file.as_path(), &ask_der_bytes).await?;
    write_bytes_atomic(ark_file.as_path(), &ark_der_bytes).await?;

    Ok((ark_der_bytes, ask_der_bytes))
}

/// ARK and ASK certificates, in that order.
pub async fn get_kds_ark_ask_certs(product_name: &str) -> Result<(X509, X509)> {
    let cache_key = product_name.to_string();

    {
        let mut cache = ARK_CERT_CACHE.lock().await;

        if let Some((ark_cert, ask_cert)) = cache.cache_get(&cache_key) {
            return Ok((ark_cert.clone(), ask_cert.clone()));
        }
    }

    let (ark_bytes, ask_bytes) = get_kds_ark_ask_certs_bytes(product_name).await?;

    let ark_cert = X509::from_der(ark_bytes.as_ref())
        .map_err(|e| error::cert(Some(format!("failed to parse ARK cert: {:?}", e))))?;
    let ask_cert = X509::from_der(ask_bytes.as_ref())
        .map_err(|e| error::cert(Some(format!("failed to parse ASK cert: {:?}", e))))?;

    let mut cache = ARK_CERT_CACHE.lock().await;

    cache.cache_set(cache_key, (ark_cert.clone(), ask_cert.clone()));

    Ok((ark_cert, ask_cert))
}

/// Checks ARK self-signed, ASK signed by ARK and VCEK signed by ASK.
pub fn validate_ark_ask_vcek_certs(ark_cert: &X509, ask_cert: &X509, vcek_cert: Option<&X509>) -> Result<()> {
    let checked = |ok: std::result::Result<bool, openssl::error::ErrorStack>, what: &str| -> Result<()> {
        match ok {
            Ok(true) => Ok(()),
            Ok(false) => Err(error::verification(format!("failed to verify {}", what))),
            Err(e) => Err(error::verification(format!("failed to verify {}: {:?}", what, e))),
        }
    };

    checked(x509_validate_signature(ark_cert.clone(), None, ark_cert.clone()),
            "ARK cert as self-signed")?;
    checked(x509_validate_signature(ark_cert.clone(), None, ask_cert.clone()),
            "ASK cert signed by ARK")?;

    if let Some(vcek_cert) = vcek_cert {
        checked(x509_validate_signature(ark_cert.clone(), Some(ask_cert.clone()), vcek_cert.clone()),
                "VCEK cert signed by ASK")?;
    }

    Ok(())
}

fn get_vcek_chip_cache_suffix(product_name: &str, chip_id: &str) -> String {
    format!("{}/{}/{}", CACHE_PREFIX, product_name, chip_id)
}

fn get_vcek_cert_name_prefix(tcb: &TcbVersion) -> String {
    format!("{:0>2}{:0>2}{:0>2}{:0>2}", tcb.boot_loader, tcb.tee, tcb.snp, tcb.microcode)
}

pub fn get_kds_vcek_der_url(product_name: &str, chip_id: &str, tcb: &TcbVersion) -> String {
    format!("{}{}{}/{}?blSPL={:0>2}&teeSPL={:0>2}&snpSPL={:0>2}&ucodeSPL={:0>2}",
            KDS_CERT_SITE, KDS_VCEK, product_name, chip_id,
            tcb.boot_loader, tcb.tee, tcb.snp, tcb.microcode)
}

pub async fn fetch_kds_vcek_der(product_name: &str, chip_id: &str, tcb: &TcbVersion) -> Result<Bytes> {
    let save_path = format!("{}/{}.der",
                            get_vcek_chip_cache_suffix(product_name, chip_id),
                            get_vcek_cert_name_prefix(tcb)
    );
    fetch_url_cached(
        get_kds_vcek_der_url(product_name, chip_id, tcb).as_str(),
        save_path.as_str(), &KDS_RETRY,
    ).await
}

/// The VCEK for the chip and reported TCB of `report`.
pub async fn get_kds_vcek_cert(product_name: &str, report: &AttestationReport) -> Result<X509> {
    let chip_id = report.chip_id_hex();
    let tcb = &report.reported_tcb;
    let cache_key = format!("{}-{}-{}", product_name, chip_id, get_vcek_cert_name_prefix(tcb));

    {
        let mut cache = VCEK_CERT_CACHE.lock().await;

        if let Some(cert) = cache.cache_get(&cache_key) {
            return Ok(cert.clone());
        }
    }

    let vcek_bytes = {
        let _guard = kds_fetch_lock(true).await?;
        fetch_kds_vcek_der(product_name, &chip_id, tcb).await?
    };
    let vcek_cert = X509::from_der(vcek_bytes.as_ref())
        .map_err(|e| error::cert(Some(format!("failed to parse VCEK cert: {:?}", e))))?;

    let mut cache = VCEK_CERT_CACHE.lock().await;

    cache.cache_set(cache_key, vcek_cert.clone());

    Ok(vcek_cert)
}

async fn kds_fetch_lock(exclusive: bool) -> Result<FileLock> {
    let path = cache_file_path(format!("{}/{}", CACHE_PREFIX, KDS_FETCH_LOCK_FILE).as_str(), true).await?;

    if exclusive {
        FileLock::exclusive(path.as_path()).await
    } else {
        FileLock::shared(path.as_path()).await
    }
}
