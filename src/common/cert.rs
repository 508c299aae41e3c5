use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey, EcPoint};
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::pkey::Public;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509, X509StoreContext};

/// Returns whether `child_cert` chains to `root_cert` (through `intermediate_cert`
/// when given).
pub fn x509_validate_signature(root_cert: X509, intermediate_cert: Option<X509>, child_cert: X509) -> Result<bool, ErrorStack> {
    let mut store_builder = X509StoreBuilder::new()?;

    store_builder.add_cert(root_cert)?;

    if let Some(intermediate_cert) = intermediate_cert {
        store_builder.add_cert(intermediate_cert)?;
    }

    let store = store_builder.build();

    let chain: Stack<X509> = Stack::new()?;

    let mut store_ctx = X509StoreContext::new()?;

    store_ctx.init(&store, &child_cert, &chain,
                   |c| c.verify_cert())
}

pub fn x509_to_ec_key(cert: X509) -> Result<EcKey<Public>, ErrorStack> {
    cert.public_key()?.ec_key()
}

/// Builds an ECDSA signature from big-endian `r` and `s` components.
pub fn ecdsa_sig_from_be(r: &[u8], s: &[u8]) -> Result<EcdsaSig, ErrorStack> {
    EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)
}

/// Builds a public key from a raw, uncompressed `x || y` point on `curve`.
pub fn ec_key_from_raw_point(curve: Nid, xy: &[u8]) -> Result<EcKey<Public>, ErrorStack> {
    let group = EcGroup::from_curve_name(curve)?;
    let mut ctx = BigNumContext::new()?;

    let mut uncompressed = vec![0x04u8];
    uncompressed.extend_from_slice(xy);

    let point = EcPoint::from_bytes(&group, &uncompressed, &mut ctx)?;

    EcKey::from_public_key(&group, &point)
}
