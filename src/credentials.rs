//! The `Credentials` collaborator.
//!
//! Acquiring credentials -- walking an environment-variable chain,
//! talking to a metadata server, refreshing an OAuth token -- is
//! explicitly out of scope for this crate. Adapters instead depend on
//! this narrow trait, which exposes only what a request-signing or
//! bearer-auth call site needs at the moment it builds a request.
//! Callers own concrete implementations (or bring their own, e.g. one
//! backed by an SDK's credential provider) and hand them to the
//! factory through [`crate::config`].

use std::future::Future;
use std::pin::Pin;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, ErrorKind, Result};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A key/secret pair as used by the AWS-style backend's request
/// signing (SigV4) and, optionally, by custom S3-compatible gateways.
#[derive(Debug, Clone)]
pub struct AccessKeyPair {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// Credentials a provider adapter can use to authenticate its
/// requests, without this crate ever knowing how they were obtained.
pub trait Credentials: Send + Sync {
    /// Return a static access-key pair, for backends that sign
    /// requests with a long-lived or pre-refreshed key (AWS SigV4,
    /// S3-compatible gateways). `None` if this credential source does
    /// not carry one.
    fn access_key_pair(&self) -> Option<AccessKeyPair> {
        None
    }

    /// Return a bearer token to attach as `Authorization: Bearer
    /// <token>`, for backends that use OAuth-style auth (GCS, OCI
    /// registries, GitHub). Async because a real implementation may
    /// need to refresh an expiring token; this trait does not mandate
    /// how.
    fn bearer_token(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async {
            Err(Error::not_supported("bearer_token", "credentials"))
        })
    }

    /// Sign `string_to_sign` and return the base64-encoded HMAC-SHA256
    /// signature, for Azure's Shared Key scheme. `None` if this
    /// credential source cannot sign (e.g. it only carries a bearer
    /// token or a pre-built SAS token).
    fn sign_hmac_sha256(&self, string_to_sign: &str) -> Result<String> {
        let _ = string_to_sign;
        Err(Error::not_supported("sign_hmac_sha256", "credentials"))
    }

    /// The account or identity name this credential source
    /// authenticates as, when the wire protocol needs it inline (e.g.
    /// Azure's account name in the Authorization header, or a GitHub
    /// App's installation owner).
    fn account_name(&self) -> Option<&str> {
        None
    }
}

/// A fixed, already-resolved set of credentials. This is the
/// credential source used throughout this crate's own tests, and a
/// reasonable starting point for callers who already hold resolved
/// values (e.g. read from their own secret store) and don't need
/// refresh behavior.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    pub access_key_pair: Option<AccessKeyPair>,
    pub bearer_token: Option<String>,
    pub shared_key: Option<Vec<u8>>,
    pub account_name: Option<String>,
}

impl StaticCredentials {
    pub fn from_access_key(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_pair: Some(AccessKeyPair {
                access_key_id: access_key_id.into(),
                secret_access_key: secret_access_key.into(),
                session_token: None,
            }),
            ..Default::default()
        }
    }

    pub fn from_bearer_token(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
            ..Default::default()
        }
    }

    pub fn from_shared_key(account_name: impl Into<String>, key_base64: &str) -> Result<Self> {
        let key = BASE64
            .decode(key_base64)
            .map_err(|e| Error::invalid_config("from_shared_key", "shared_key").with_source(e))?;
        Ok(Self {
            account_name: Some(account_name.into()),
            shared_key: Some(key),
            ..Default::default()
        })
    }
}

impl Credentials for StaticCredentials {
    fn access_key_pair(&self) -> Option<AccessKeyPair> {
        self.access_key_pair.clone()
    }

    fn bearer_token(&self) -> BoxFuture<'_, Result<String>> {
        let token = self.bearer_token.clone();
        Box::pin(async move {
            token.ok_or_else(|| Error::new(ErrorKind::InvalidConfig, "bearer_token", "credentials"))
        })
    }

    fn sign_hmac_sha256(&self, string_to_sign: &str) -> Result<String> {
        let key = self
            .shared_key
            .as_ref()
            .ok_or_else(|| Error::invalid_config("sign_hmac_sha256", "shared_key"))?;
        let mut mac = Hmac::<Sha256>::new_from_slice(key)
            .map_err(|e| Error::invalid_config("sign_hmac_sha256", "shared_key").with_source(e))?;
        mac.update(string_to_sign.as_bytes());
        let sig = mac.finalize().into_bytes();
        Ok(BASE64.encode(sig))
    }

    fn account_name(&self) -> Option<&str> {
        self.account_name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bearer_token_roundtrips() {
        let creds = StaticCredentials::from_bearer_token("tok-123");
        assert_eq!(creds.bearer_token().await.unwrap(), "tok-123");
    }

    #[test]
    fn shared_key_signs_deterministically() {
        let creds = StaticCredentials::from_shared_key("acct", "c2VjcmV0a2V5").unwrap();
        let a = creds.sign_hmac_sha256("string-to-sign").unwrap();
        let b = creds.sign_hmac_sha256("string-to-sign").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_credential_kind_is_not_supported() {
        let creds = StaticCredentials::from_bearer_token("tok");
        let err = creds.sign_hmac_sha256("x").unwrap_err();
        assert!(err.is(ErrorKind::InvalidConfig));
    }
}
