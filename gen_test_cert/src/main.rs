use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

/// Mint the self-signed server certificate and private key baked into
/// the TLS tests and benchmarks, dumped as Rust source ready to paste
/// over the existing constants.  Valid until 2099
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut params = CertificateParams::new(vec!["example.com".into()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "bytebuf_openssl test cert");
    params.distinguished_name = dn;
    params.not_after = params.not_after.replace_year(2099)?;

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    print!(
        "const CERT_PEM: &str = r\"\n{}\";\nconst KEY_PEM: &str = r\"\n{}\";\n",
        cert.pem(),
        key_pair.serialize_pem(),
    );
    Ok(())
}
