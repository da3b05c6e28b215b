//! ACME certificate issuance over HTTP-01.
//!
//! Certificates and the account backing them are persisted as file
//! parameters under the well-known `TLS_CERTIFICATE` and `TLS_ACCOUNT` keys.
//! A stored certificate that still covers the requested domains and is not
//! close to expiry short-circuits issuance.

use std::time::Duration;

use instant_acme::{
    AuthorizationStatus, ChallengeType, Identifier, NewOrder, OrderStatus,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::discovery::service::TlsSpec;
use crate::errors::{Result, TlsError};
use crate::parameter::{ParameterSource, WellKnown};

use super::account::TlsAccount;
use super::http01::Http01Provider;

/// ACME staging directory, used unless the spec or configuration overrides it.
pub const LETS_ENCRYPT_STAGING_DIRECTORY: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";

const DEFAULT_KEY_TYPE: &str = "RSA4096";
const DEFAULT_CERTIFICATE_TIMEOUT: Duration = Duration::from_secs(30);
const RENEWAL_THRESHOLD: Duration = Duration::from_secs(30 * 24 * 3600);

/// Certificate material persisted in the `TLS_CERTIFICATE` file parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCertificate {
    pub domains: Vec<String>,
    pub certificate_chain: String,
    pub private_key: String,
}

/// Dependencies of certificate issuance.
pub struct TlsOptions {
    http01: Http01Provider,
    directory_url: Option<String>,
}

impl TlsOptions {
    pub fn new(http01: Http01Provider) -> Self {
        Self { http01, directory_url: None }
    }

    /// Override the ACME directory for every issuance (specs may still set
    /// their own).
    pub fn with_directory_url(mut self, directory_url: impl Into<String>) -> Self {
        self.directory_url = Some(directory_url.into());
        self
    }

    /// Issue or renew the certificate described by `tls`, persisting the
    /// resulting chain and key through the source's well-known parameters.
    pub async fn obtain_certificate(
        &self,
        source: &mut ParameterSource,
        tls: &TlsSpec,
    ) -> Result<()> {
        let directory_url = tls
            .ca_dir_url
            .clone()
            .or_else(|| self.directory_url.clone())
            .unwrap_or_else(|| LETS_ENCRYPT_STAGING_DIRECTORY.to_string());

        let key_type = tls.key_type.as_deref().unwrap_or(DEFAULT_KEY_TYPE);

        if !source.has_well_known(WellKnown::TlsAccount) {
            return Err(TlsError::MissingWellKnownTlsAccount.into());
        }

        let Some(certificate_parameter) = source.get_well_known(WellKnown::TlsCertificate)
        else {
            return Err(TlsError::MissingWellKnownTlsCertificate.into());
        };
        let mut certificate_parameter = certificate_parameter.clone();

        if let Ok(()) = certificate_parameter.load().await {
            if let Ok(stored) =
                serde_json::from_slice::<StoredCertificate>(certificate_parameter.file())
            {
                if covers_domains(&stored, &tls.domains)
                    && !needs_renewal(&stored.certificate_chain)?
                {
                    debug!(
                        domains = ?tls.domains,
                        "Stored certificate still valid, skipping issuance"
                    );
                    return Ok(());
                }
            }
        }

        let account_parameter = source
            .get_well_known(WellKnown::TlsAccount)
            .cloned()
            .ok_or(TlsError::MissingWellKnownTlsAccount)?;

        let account =
            TlsAccount::load_or_register(account_parameter, &tls.account_email, &directory_url)
                .await?;

        info!(domains = ?tls.domains, directory_url = %directory_url, "Ordering certificate");

        let mut presented_tokens = Vec::new();
        let result = self
            .issue(&account, tls, key_type, &mut presented_tokens)
            .await;

        for token in &presented_tokens {
            self.http01.clean_up(token);
        }

        let stored = result?;

        let payload = serde_json::to_vec(&stored)?;
        let file = certificate_parameter.file_mut();
        file.clear();
        file.extend_from_slice(&payload);
        certificate_parameter.push().await?;

        info!(domains = ?tls.domains, "Certificate persisted");

        Ok(())
    }

    async fn issue(
        &self,
        account: &TlsAccount,
        tls: &TlsSpec,
        key_type: &str,
        presented_tokens: &mut Vec<String>,
    ) -> Result<StoredCertificate> {
        let identifiers: Vec<Identifier> =
            tls.domains.iter().map(|domain| Identifier::Dns(domain.clone())).collect();

        let mut order = account
            .account()
            .new_order(&NewOrder { identifiers: &identifiers })
            .await
            .map_err(|e| TlsError::acme("Failed to create ACME order", e))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| TlsError::acme("Failed to fetch order authorizations", e))?;

        for authorization in &authorizations {
            match authorization.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                _ => {}
            }

            let domain = match &authorization.identifier {
                Identifier::Dns(domain) => domain.clone(),
                _ => continue,
            };

            let challenge = authorization
                .challenges
                .iter()
                .find(|challenge| challenge.r#type == ChallengeType::Http01)
                .ok_or_else(|| TlsError::MissingHttp01Challenge { domain: domain.clone() })?;

            let key_authorization = order.key_authorization(challenge);
            self.http01.present(&domain, &challenge.token, key_authorization.as_str());
            presented_tokens.push(challenge.token.clone());

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| TlsError::acme("Failed to mark challenge ready", e))?;
        }

        let deadline = tokio::time::Instant::now() + DEFAULT_CERTIFICATE_TIMEOUT;
        let mut delay = Duration::from_millis(500);

        let status = loop {
            tokio::time::sleep(delay).await;

            let state = order
                .refresh()
                .await
                .map_err(|e| TlsError::acme("Failed to refresh ACME order", e))?;

            match state.status {
                OrderStatus::Ready | OrderStatus::Valid | OrderStatus::Invalid => {
                    break state.status;
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(TlsError::OrderTimeout {
                    domains: tls.domains.clone(),
                    timeout_secs: DEFAULT_CERTIFICATE_TIMEOUT.as_secs(),
                }
                .into());
            }

            delay = (delay * 2).min(Duration::from_secs(5));
        };

        if status == OrderStatus::Invalid {
            return Err(TlsError::OrderInvalid { domains: tls.domains.clone() }.into());
        }

        let key_pair = generate_key_pair(key_type)?;

        let mut params = rcgen::CertificateParams::new(tls.domains.clone())
            .map_err(|e| TlsError::key_generation("Invalid certificate domains", Box::new(e)))?;
        params.distinguished_name = rcgen::DistinguishedName::new();

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| TlsError::key_generation("Failed to build CSR", Box::new(e)))?;

        order
            .finalize(csr.der().as_ref())
            .await
            .map_err(|e| TlsError::acme("Failed to finalize ACME order", e))?;

        let certificate_chain = loop {
            match order
                .certificate()
                .await
                .map_err(|e| TlsError::acme("Failed to download certificate", e))?
            {
                Some(chain) => break chain,
                None => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(TlsError::OrderTimeout {
                            domains: tls.domains.clone(),
                            timeout_secs: DEFAULT_CERTIFICATE_TIMEOUT.as_secs(),
                        }
                        .into());
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        Ok(StoredCertificate {
            domains: tls.domains.clone(),
            certificate_chain,
            private_key: key_pair.serialize_pem(),
        })
    }
}

/// Generate the leaf key pair for the configured algorithm name.
fn generate_key_pair(key_type: &str) -> Result<rcgen::KeyPair> {
    match key_type.to_uppercase().as_str() {
        "EC256" => rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| TlsError::key_generation("EC256 key generation failed", Box::new(e)).into()),
        "EC384" => rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| TlsError::key_generation("EC384 key generation failed", Box::new(e)).into()),
        "RSA2048" => generate_rsa_key_pair(2048),
        "RSA4096" => generate_rsa_key_pair(4096),
        "RSA8192" => generate_rsa_key_pair(8192),
        other => Err(TlsError::UnknownPrivateKeyType { key_type: other.to_string() }.into()),
    }
}

/// rcgen's ring backend can only import RSA keys, so generation goes through
/// the `rsa` crate and round-trips as PKCS#8.
fn generate_rsa_key_pair(bits: usize) -> Result<rcgen::KeyPair> {
    use rsa::pkcs8::EncodePrivateKey;

    let mut rng = rand::thread_rng();

    let private_key = rsa::RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| TlsError::key_generation("RSA key generation failed", Box::new(e)))?;

    let pem = private_key
        .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| TlsError::key_generation("RSA key encoding failed", Box::new(e)))?;

    rcgen::KeyPair::from_pem(&pem)
        .map_err(|e| TlsError::key_generation("RSA key import failed", Box::new(e)).into())
}

fn covers_domains(stored: &StoredCertificate, requested: &[String]) -> bool {
    requested.iter().all(|domain| stored.domains.contains(domain))
}

/// A certificate within the renewal threshold of its expiry needs to be
/// re-issued.
fn needs_renewal(certificate_chain: &str) -> Result<bool> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(certificate_chain.as_bytes()).map_err(
        |e| TlsError::CertificateParse { context: format!("invalid PEM: {}", e) },
    )?;

    let certificate = pem.parse_x509().map_err(|e| TlsError::CertificateParse {
        context: format!("invalid certificate: {}", e),
    })?;

    let not_after = certificate.validity().not_after.timestamp();
    let now = time::OffsetDateTime::now_utc().unix_timestamp();

    Ok(not_after < now + RENEWAL_THRESHOLD.as_secs() as i64)
}
