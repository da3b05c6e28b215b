//! ACME account persistence.
//!
//! The account lives in the well-known `TLS_ACCOUNT` file parameter as the
//! serialized account credentials (registration URL plus private key). A
//! missing file triggers on-the-fly registration and save.

use instant_acme::{Account, AccountCredentials, NewAccount};
use tracing::info;

use crate::errors::{MeshplaneError, Result, TlsError};
use crate::parameter::Parameter;

/// A restored or freshly registered ACME account bound to its backing
/// parameter.
pub struct TlsAccount {
    parameter: Parameter,
    account: Account,
}

impl TlsAccount {
    /// Load the account from the parameter file; when the file does not
    /// exist, register a new account with the directory and persist its
    /// credentials.
    pub async fn load_or_register(
        mut parameter: Parameter,
        contact_email: &str,
        directory_url: &str,
    ) -> Result<Self> {
        match parameter.load().await {
            Ok(()) => {
                let credentials: AccountCredentials = serde_json::from_slice(parameter.file())?;

                let account = Account::from_credentials(credentials)
                    .await
                    .map_err(|e| TlsError::acme("Failed to restore ACME account", e))?;

                Ok(Self { parameter, account })
            }
            Err(MeshplaneError::FileNotFound { .. }) => {
                info!(directory_url = %directory_url, "No ACME account on file, registering");

                let contact = format!("mailto:{}", contact_email);
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &[contact.as_str()],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    directory_url,
                    None,
                )
                .await
                .map_err(|e| TlsError::acme("Failed to register ACME account", e))?;

                let payload = serde_json::to_vec(&credentials)?;

                let file = parameter.file_mut();
                file.clear();
                file.extend_from_slice(&payload);
                parameter.push().await?;

                Ok(Self { parameter, account })
            }
            Err(err) => Err(err),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn parameter(&self) -> &Parameter {
        &self.parameter
    }
}
