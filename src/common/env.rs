pub const ENV_CACHE_PATH_KEY: &str = "CVM_ATTESTATION_CACHE_PATH";
pub const ENV_CACHE_PATH_DEFAULT: &str = "/var/cache/cvm-attestation";

pub const ENV_CACHE_MEM_CERT_LEN_KEY: &str = "CVM_ATTESTATION_CACHE_MEM_LEN";
pub const ENV_CACHE_MEM_CERT_LEN_DEFAULT: &str = "100";

pub const ENV_SNP_PRODUCT_KEY: &str = "CVM_ATTESTATION_SNP_PRODUCT";
pub const ENV_SNP_PRODUCT_DEFAULT: &str = "Milan";

pub const ENV_TSM_REPORT_PATH_KEY: &str = "CVM_TSM_REPORT_PATH";
pub const ENV_TSM_REPORT_PATH_DEFAULT: &str = "/sys/kernel/config/tsm/report";

pub const ENV_GCE_METADATA_HOST_KEY: &str = "GCE_METADATA_HOST";
pub const ENV_GCE_METADATA_HOST_DEFAULT: &str = "169.254.169.254";

pub const ENV_TPM_DEVICE_PATH_KEY: &str = "CVM_TPM_DEVICE_PATH";
pub const ENV_TPM_DEVICE_PATH_DEFAULT: &str = "/dev/tpmrm0";

pub const ENV_TPM_EVENT_LOG_PATH_KEY: &str = "CVM_TPM_EVENT_LOG_PATH";
pub const ENV_TPM_EVENT_LOG_PATH_DEFAULT: &str = "/sys/kernel/security/tpm0/binary_bios_measurements";
