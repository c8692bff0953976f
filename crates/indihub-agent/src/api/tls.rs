//! Self-signed TLS material
//!
//! When the control API serves HTTPS it uses a self-signed chain kept
//! under `./.indihub-agent/tls/`: an ECDSA P-256 root CA valid for ten
//! years signing a server leaf whose SANs cover the host's names. The
//! files are generated once and reused; the Web-UI user marks the root as
//! trusted on their desktop.

use std::path::{Path, PathBuf};

use indihub_core::error::{AgentError, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use time::{Duration, OffsetDateTime};
use tracing::info;

const TLS_DIR: &str = "./.indihub-agent/tls";

const ROOT_KEY: &str = "root_CA.key";
const ROOT_CERT: &str = "root_CA.pem";
const SERVER_KEY: &str = "server.key";
const SERVER_CERT: &str = "server.pem";

const VALIDITY_DAYS: i64 = 10 * 365;

/// Return `(key, cert)` paths for the API server, generating the chain on
/// first use.
pub fn get_self_signed_cert(dev: bool) -> Result<(PathBuf, PathBuf)> {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let mut hosts = vec![hostname.clone(), format!("{hostname}.local")];
    if dev {
        hosts.push("localhost".to_string());
    }
    generate_into(Path::new(TLS_DIR), &hosts)
}

/// Generate the chain under `dir` unless it already exists. SAN entries
/// that parse as IP literals become IP addresses rather than DNS names.
pub fn generate_into(dir: &Path, hosts: &[String]) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;

    let server_key_path = dir.join(SERVER_KEY);
    let server_cert_path = dir.join(SERVER_CERT);
    if dir.join(ROOT_KEY).exists() {
        return Ok((server_key_path, server_cert_path));
    }

    info!("generating self-signed certificate for {hosts:?}");

    let not_before = OffsetDateTime::now_utc();
    let not_after = not_before + Duration::days(VALIDITY_DAYS);

    // root CA
    let root_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|err| AgentError::Config(format!("TLS key generation failed: {err}")))?;
    let mut root_params = CertificateParams::default();
    let mut root_dn = DistinguishedName::new();
    root_dn.push(DnType::OrganizationName, "INDIHUB");
    root_dn.push(DnType::CommonName, "Root CA");
    root_params.distinguished_name = root_dn;
    root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    root_params.key_usages = vec![KeyUsagePurpose::KeyCertSign];
    root_params.not_before = not_before;
    root_params.not_after = not_after;
    let root_cert = root_params
        .self_signed(&root_key)
        .map_err(|err| AgentError::Config(format!("root certificate failed: {err}")))?;

    // server leaf
    let server_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|err| AgentError::Config(format!("TLS key generation failed: {err}")))?;
    let mut server_params = CertificateParams::new(hosts.to_vec())
        .map_err(|err| AgentError::Config(format!("bad certificate hosts: {err}")))?;
    let mut server_dn = DistinguishedName::new();
    server_dn.push(DnType::OrganizationName, "INDIHUB");
    server_dn.push(DnType::CommonName, "indihub-agent");
    server_params.distinguished_name = server_dn;
    server_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    server_params.not_before = not_before;
    server_params.not_after = not_after;
    let server_cert = server_params
        .signed_by(&server_key, &root_cert, &root_key)
        .map_err(|err| AgentError::Config(format!("server certificate failed: {err}")))?;

    write_key(&dir.join(ROOT_KEY), &root_key.serialize_pem())?;
    std::fs::write(dir.join(ROOT_CERT), root_cert.pem())?;
    write_key(&server_key_path, &server_key.serialize_pem())?;
    std::fs::write(&server_cert_path, server_cert.pem())?;

    Ok((server_key_path, server_cert_path))
}

fn write_key(path: &Path, pem: &str) -> Result<()> {
    std::fs::write(path, pem)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
