use thiserror::Error;

/// TLS-specific error variants surfaced during ACME account setup and
/// certificate issuance.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The parameter source does not carry the well-known TLS account entry.
    #[error("Missing well known tls account key in the parameter source")]
    MissingWellKnownTlsAccount,

    /// The parameter source does not carry the well-known TLS certificate entry.
    #[error("Missing well known tls certificate key in the parameter source")]
    MissingWellKnownTlsCertificate,

    /// The configured private key algorithm name is not supported.
    #[error("Unknown private key type '{key_type}'")]
    UnknownPrivateKeyType { key_type: String },

    /// The ACME directory refused or failed an account/order operation.
    #[error("ACME protocol error: {context}")]
    Acme {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The order never left the pending/processing state within the timeout.
    #[error("ACME order for {domains:?} did not become ready within {timeout_secs}s")]
    OrderTimeout { domains: Vec<String>, timeout_secs: u64 },

    /// The ACME server rejected the order outright.
    #[error("ACME order for {domains:?} is invalid")]
    OrderInvalid { domains: Vec<String> },

    /// An authorization offered no HTTP-01 challenge to solve.
    #[error("No HTTP-01 challenge offered for domain '{domain}'")]
    MissingHttp01Challenge { domain: String },

    /// Key or CSR generation failed.
    #[error("Failed to generate certificate key material: {context}")]
    KeyGeneration {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The issued or stored certificate PEM could not be parsed.
    #[error("Failed to parse certificate: {context}")]
    CertificateParse { context: String },

    /// A PEM file backing the xDS listener's TLS identity could not be read.
    #[error("Cannot read xDS listener {kind} at '{path}'")]
    ListenerMaterial {
        kind: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Client certificate verification was requested without a CA bundle to
    /// verify against.
    #[error("Client certificate verification requires a client CA bundle")]
    ClientCaMissing,
}

impl TlsError {
    pub fn acme<S: Into<String>>(context: S, source: instant_acme::Error) -> Self {
        Self::Acme { context: context.into(), source: Box::new(source) }
    }

    pub fn key_generation<S: Into<String>>(
        context: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::KeyGeneration { context: context.into(), source }
    }
}
