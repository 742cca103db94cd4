//! The digest authentication scheme: credential extraction, validation and challenges.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::DigestConfig;
use crate::digest::{parse_tokens, DigestCredential};
use crate::handler::{CredentialHandler, CredentialStatus, Credentials};
use crate::nonce::{NonceCache, NonceSweeper};
use crate::store::Account;
use crate::transport::{HttpRequest, HttpResponse, WWW_AUTHENTICATE};
use crate::utils::QuoteForDigest;
use crate::{Error, Result};

/// Where a request stands in the digest protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum DigestState {
    NO_CREDENTIALS,
    CREDENTIALS_PRESENT,
    NONCE_VALID,
    NONCE_STALE,
    VALIDATED,
}

/// Result of credential extraction
#[derive(Debug)]
pub enum Extraction {
    /// No digest header, or nothing usable in it
    NoCredentials,
    /// Credentials present but the nonce is unknown, expired or replayed
    NonceStale(DigestCredential),
    /// Credentials with a fresh nonce, status `IN_PROGRESS`
    NonceValid(DigestCredential),
}

impl Extraction {
    pub fn state(&self) -> DigestState {
        match self {
            Extraction::NoCredentials => DigestState::NO_CREDENTIALS,
            Extraction::NonceStale(_) => DigestState::NONCE_STALE,
            Extraction::NonceValid(_) => DigestState::NONCE_VALID,
        }
    }
}

/// Result of [`DigestAuthenticationScheme::authenticate`]
#[derive(Debug)]
pub enum AuthOutcome {
    /// The request may proceed as `account`
    Authenticated {
        account: Arc<dyn Account>,
        credential: DigestCredential,
    },
    /// A challenge was written to the response
    Challenged {
        /// Protocol state that led to the challenge
        state: DigestState,
        /// Pipeline status, when the credential got that far
        status: Option<CredentialStatus>,
        stale: bool,
    },
}

impl AuthOutcome {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthOutcome::Authenticated { .. })
    }
}

/// HTTP Digest authentication (RFC 2617) with a server-side nonce cache.
///
/// Each scheme owns its nonce cache. [`initialize`](Self::initialize) starts the
/// background sweep; it stops on [`shutdown`](Self::shutdown) or drop.
pub struct DigestAuthenticationScheme<H> {
    config: DigestConfig,
    nonce_cache: Arc<NonceCache>,
    handler: H,
    sweeper: Option<NonceSweeper>,
}

impl<H> DigestAuthenticationScheme<H>
where
    H: CredentialHandler<DigestCredential>,
{
    /// The handler's login-name attribute is taken from `config`.
    pub fn new(config: DigestConfig, mut handler: H) -> Self {
        handler.set_login_name_attribute(&config.login_name_attribute);

        let nonce_cache = NonceCache::new(config.nonce_max_valid)
            .with_replay_detection(config.replay_detection);

        Self {
            config,
            nonce_cache: Arc::new(nonce_cache),
            handler,
            sweeper: None,
        }
    }

    /// Start sweeping expired nonces every `nonce_max_valid`, first sweep after one
    /// period. Calling it again restarts the sweep.
    ///
    /// # Errors
    /// Outside a tokio runtime, or with a zero `nonce_max_valid`.
    pub fn initialize(&mut self) -> Result<()> {
        self.sweeper = None;
        self.sweeper = Some(NonceSweeper::start(Arc::clone(&self.nonce_cache))?);

        info!(
            realm = %self.config.realm,
            nonce_max_valid = ?self.config.nonce_max_valid,
            "digest authentication initialized"
        );
        Ok(())
    }

    /// Stop the background sweep
    pub fn shutdown(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.as_ref().map_or(false, NonceSweeper::is_running)
    }

    pub fn realm(&self) -> &str {
        &self.config.realm
    }

    pub fn config(&self) -> &DigestConfig {
        &self.config
    }

    pub fn nonce_cache(&self) -> &NonceCache {
        &self.nonce_cache
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Read digest credentials from the request and check their nonce.
    ///
    /// A malformed header is treated as no credentials at all.
    pub fn extract_credential(&self, request: &impl HttpRequest) -> Extraction {
        let header = match request.authorization() {
            Some(h) if h.starts_with(crate::digest::DIGEST_PREFIX) => h,
            _ => return Extraction::NoCredentials,
        };

        let tokens = match parse_tokens(header) {
            Ok(tokens) if !tokens.is_empty() => tokens,
            Ok(_) => return Extraction::NoCredentials,
            Err(e) => {
                debug!(error = %e, "ignoring malformed digest header");
                return Extraction::NoCredentials;
            }
        };

        let credential = DigestCredential::from_tokens(&tokens, request.method());
        debug!(
            state = ?DigestState::CREDENTIALS_PRESENT,
            username = ?credential.username,
            "digest credentials present"
        );

        if self.nonce_cache.has_valid_nonce(&credential) {
            Extraction::NonceValid(credential)
        } else {
            Extraction::NonceStale(credential)
        }
    }

    /// Value of the `WWW-Authenticate` header for a fresh challenge.
    pub fn challenge_header(&self, request: &impl HttpRequest, stale: bool) -> String {
        let domain = match request.context_path() {
            Some(path) if !path.is_empty() => path,
            _ => "/",
        };

        let nonce = self.nonce_cache.generate_and_cache();

        format!(
            "Digest realm=\"{realm}\",domain=\"{domain}\",nonce=\"{nonce}\",algorithm=MD5,qop=auth,stale=\"{stale}\"",
            realm = self.config.realm.quote_for_digest(),
            domain = domain.quote_for_digest(),
            nonce = nonce,
            stale = stale
        )
    }

    /// Write a challenge with a new nonce: 403 for scripted requests, 401 otherwise.
    ///
    /// # Errors
    /// `Challenge` if the response cannot be written. The request must not proceed.
    pub fn challenge_client(
        &self,
        request: &impl HttpRequest,
        response: &mut impl HttpResponse,
        stale: bool,
    ) -> Result<()> {
        let header = self.challenge_header(request, stale);
        let status = if request.is_xml_http_request() { 403 } else { 401 };

        response
            .set_header(WWW_AUTHENTICATE, &header)
            .and_then(|_| response.send_error(status))
            .map_err(|e| match e {
                Error::Challenge(_) => e,
                other => Error::Challenge(other.to_string()),
            })?;

        info!(realm = %self.config.realm, status, stale, "issued digest challenge");
        Ok(())
    }

    /// Drive one request through the protocol.
    ///
    /// Validated requests get nothing written to the response. Everything else is
    /// challenged, with `stale=true` only when the nonce was the problem.
    ///
    /// # Errors
    /// Identity store integrity faults and challenge write failures.
    pub fn authenticate(
        &self,
        request: &impl HttpRequest,
        response: &mut impl HttpResponse,
    ) -> Result<AuthOutcome> {
        let mut credential = match self.extract_credential(request) {
            Extraction::NonceValid(credential) => credential,
            extraction => {
                let state = extraction.state();
                let stale = state == DigestState::NONCE_STALE;
                self.challenge_client(request, response, stale)?;

                return Ok(AuthOutcome::Challenged {
                    state,
                    status: None,
                    stale,
                });
            }
        };

        self.handler.validate(&mut credential)?;

        let status = credential.status();
        match credential.validated_account().cloned() {
            Some(account) if status == CredentialStatus::VALID => {
                debug!(state = ?DigestState::VALIDATED, account = account.id(), "digest authentication succeeded");
                Ok(AuthOutcome::Authenticated {
                    account,
                    credential,
                })
            }
            _ => {
                debug!(%status, "digest credentials rejected");
                self.challenge_client(request, response, false)?;

                Ok(AuthOutcome::Challenged {
                    state: DigestState::NONCE_VALID,
                    status: Some(status),
                    stale: false,
                })
            }
        }
    }
}

impl<H> Drop for DigestAuthenticationScheme<H> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DigestSecret;
    use crate::handler::{DigestCredentialHandler, DIGEST_CREDENTIAL_KIND};
    use crate::store::{
        DigestCredentialStorage, IdentityType, MemoryCredentialStore, MemoryIdentityStore,
        SimpleAccount,
    };
    use crate::transport::ContextPath;
    use http::StatusCode;
    use std::time::Duration;

    const REALM: &str = "testrealm@host.com";
    const PASSWORD: &str = "Circle Of Life";

    type Scheme = DigestAuthenticationScheme<
        DigestCredentialHandler<MemoryIdentityStore, MemoryCredentialStore>,
    >;

    fn scheme_with(account: SimpleAccount) -> Scheme {
        scheme_from(DigestConfig::default().with_realm(REALM), account)
    }

    fn scheme_from(config: DigestConfig, account: SimpleAccount) -> Scheme {
        let identities = MemoryIdentityStore::new();
        let id = account.id.clone();
        identities.add_account(account);

        let credentials = MemoryCredentialStore::new();
        credentials.store(
            &id,
            DIGEST_CREDENTIAL_KIND,
            DigestCredentialStorage::new(REALM, DigestSecret::Password(PASSWORD.into())),
        );

        DigestAuthenticationScheme::new(config, DigestCredentialHandler::new(identities, credentials))
    }

    fn scheme() -> Scheme {
        scheme_with(SimpleAccount::new("1", "Mufasa"))
    }

    /// Parameter of a challenge header, quotes stripped
    fn challenge_param(header: &str, name: &str) -> Option<String> {
        parse_tokens(header)
            .unwrap()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Answer a challenge the way a browser would
    fn answer(nonce: &str, password: &str) -> String {
        let mut credential = DigestCredential {
            username: Some("Mufasa".into()),
            realm: Some(REALM.into()),
            nonce: Some(nonce.into()),
            uri: Some("/dir/index.html".into()),
            qop: Some("auth".into()),
            nc: Some("00000001".into()),
            cnonce: Some("0a4f113b".into()),
            algorithm: Some("MD5".into()),
            method: "GET".into(),
            ..Default::default()
        };
        credential.response = Some(
            credential
                .compute_expected_response(&DigestSecret::Password(password.into()))
                .unwrap(),
        );
        credential.to_string()
    }

    fn request(authorization: Option<&str>) -> http::Request<()> {
        let mut builder = http::Request::builder().method("GET").uri("/dir/index.html");
        if let Some(authorization) = authorization {
            builder = builder.header("Authorization", authorization);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_no_credentials_challenged() {
        let scheme = scheme();
        let mut response = http::Response::new(());

        let outcome = scheme.authenticate(&request(None), &mut response).unwrap();

        assert!(matches!(
            outcome,
            AuthOutcome::Challenged {
                state: DigestState::NO_CREDENTIALS,
                stale: false,
                ..
            }
        ));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let header = response.headers().get("WWW-Authenticate").unwrap().to_str().unwrap();
        assert!(header.starts_with(&format!("Digest realm=\"{}\",domain=\"/\",nonce=\"", REALM)));
        assert!(header.ends_with(",algorithm=MD5,qop=auth,stale=\"false\""));

        let nonce = challenge_param(header, "nonce").unwrap();
        assert!(scheme.nonce_cache().contains(&nonce));
    }

    #[test]
    fn test_other_scheme_is_no_credentials() {
        let scheme = scheme();

        let basic = request(Some("Basic TXVmYXNhOkNpcmNsZSBPZiBMaWZl"));
        assert_eq!(scheme.extract_credential(&basic).state(), DigestState::NO_CREDENTIALS);

        let empty = request(Some("Digest  , ,"));
        assert_eq!(scheme.extract_credential(&empty).state(), DigestState::NO_CREDENTIALS);

        let broken = request(Some("Digest username=\"unterminated"));
        assert_eq!(scheme.extract_credential(&broken).state(), DigestState::NO_CREDENTIALS);
    }

    #[test]
    fn test_ajax_gets_forbidden_and_domain() {
        let scheme = scheme();
        let mut request = http::Request::builder()
            .uri("/app/data")
            .header("X-Requested-With", "XMLHttpRequest")
            .body(())
            .unwrap();
        request
            .extensions_mut()
            .insert(ContextPath("/app".to_string()));
        let mut response = http::Response::new(());

        scheme.challenge_client(&request, &mut response, false).unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let header = response.headers().get("WWW-Authenticate").unwrap().to_str().unwrap();
        assert_eq!(challenge_param(header, "domain").as_deref(), Some("/app"));
    }

    #[test]
    fn test_valid_credentials_proceed() {
        let scheme = scheme();
        let nonce = scheme.nonce_cache().generate_and_cache();
        let mut response = http::Response::new(());

        let outcome = scheme
            .authenticate(&request(Some(&answer(&nonce, PASSWORD))), &mut response)
            .unwrap();

        match outcome {
            AuthOutcome::Authenticated {
                account,
                credential,
            } => {
                assert_eq!(account.id(), "1");
                assert_eq!(credential.status(), CredentialStatus::VALID);
                assert_eq!(credential.validated_account().map(|a| a.id()), Some("1"));
            }
            other => panic!("expected authentication, got {:?}", other),
        }
        assert!(response.headers().get("WWW-Authenticate").is_none());
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_wrong_password_challenged_not_stale() {
        let scheme = scheme();
        let nonce = scheme.nonce_cache().generate_and_cache();
        let mut response = http::Response::new(());

        let outcome = scheme
            .authenticate(&request(Some(&answer(&nonce, "wrong"))), &mut response)
            .unwrap();

        assert!(matches!(
            outcome,
            AuthOutcome::Challenged {
                state: DigestState::NONCE_VALID,
                status: Some(CredentialStatus::INVALID),
                stale: false,
            }
        ));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_disabled_account_challenged_not_stale() {
        let scheme = scheme_with(SimpleAccount::new("1", "Mufasa").disabled());
        let nonce = scheme.nonce_cache().generate_and_cache();
        let mut response = http::Response::new(());

        let outcome = scheme
            .authenticate(&request(Some(&answer(&nonce, PASSWORD))), &mut response)
            .unwrap();

        assert!(matches!(
            outcome,
            AuthOutcome::Challenged {
                status: Some(CredentialStatus::ACCOUNT_DISABLED),
                stale: false,
                ..
            }
        ));
        let header = response.headers().get("WWW-Authenticate").unwrap().to_str().unwrap();
        assert_eq!(challenge_param(header, "stale").as_deref(), Some("false"));
    }

    #[test]
    fn test_expired_nonce_challenged_stale() {
        let scheme = scheme();
        let nonce = scheme.nonce_cache().generate_and_cache();
        scheme
            .nonce_cache()
            .backdate(&nonce, scheme.config().nonce_max_valid + Duration::from_secs(1));
        let mut response = http::Response::new(());

        let outcome = scheme
            .authenticate(&request(Some(&answer(&nonce, PASSWORD))), &mut response)
            .unwrap();

        assert!(matches!(
            outcome,
            AuthOutcome::Challenged {
                state: DigestState::NONCE_STALE,
                status: None,
                stale: true,
            }
        ));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let header = response.headers().get("WWW-Authenticate").unwrap().to_str().unwrap();
        assert_eq!(challenge_param(header, "stale").as_deref(), Some("true"));
        assert_ne!(challenge_param(header, "nonce").as_deref(), Some(nonce.as_str()));
    }

    #[test]
    fn test_unknown_nonce_challenged_stale() {
        let scheme = scheme();
        let mut response = http::Response::new(());

        let outcome = scheme
            .authenticate(&request(Some(&answer("forged", PASSWORD))), &mut response)
            .unwrap();

        assert!(matches!(outcome, AuthOutcome::Challenged { stale: true, .. }));
    }

    #[test]
    fn test_full_challenge_response_cycle() {
        let scheme = scheme();

        let mut first = http::Response::new(());
        scheme.authenticate(&request(None), &mut first).unwrap();
        let header = first.headers().get("WWW-Authenticate").unwrap().to_str().unwrap();
        let nonce = challenge_param(header, "nonce").unwrap();

        let mut second = http::Response::new(());
        let outcome = scheme
            .authenticate(&request(Some(&answer(&nonce, PASSWORD))), &mut second)
            .unwrap();

        assert!(outcome.is_authenticated());
    }

    #[test]
    fn test_login_name_attribute_from_config() {
        let scheme = scheme_from(
            DigestConfig::default()
                .with_realm(REALM)
                .with_login_name_attribute("email"),
            SimpleAccount::new("1", "someone-else").with_attribute("email", "Mufasa"),
        );
        assert_eq!(scheme.handler().login_name_attribute(), "email");

        let nonce = scheme.nonce_cache().generate_and_cache();
        let mut response = http::Response::new(());
        let outcome = scheme
            .authenticate(&request(Some(&answer(&nonce, PASSWORD))), &mut response)
            .unwrap();

        assert!(outcome.is_authenticated());
    }

    #[test]
    fn test_default_login_name_attribute_ignores_other_attributes() {
        let scheme = scheme_with(SimpleAccount::new("1", "someone-else").with_attribute("email", "Mufasa"));
        let nonce = scheme.nonce_cache().generate_and_cache();
        let mut response = http::Response::new(());

        let outcome = scheme
            .authenticate(&request(Some(&answer(&nonce, PASSWORD))), &mut response)
            .unwrap();

        assert!(matches!(
            outcome,
            AuthOutcome::Challenged {
                status: Some(CredentialStatus::INVALID),
                ..
            }
        ));
    }

    #[test]
    fn test_replayed_nonce_count_challenged_stale() {
        let scheme = scheme_from(
            DigestConfig::default()
                .with_realm(REALM)
                .with_replay_detection(true),
            SimpleAccount::new("1", "Mufasa"),
        );
        assert!(scheme.nonce_cache().replay_detection());

        let nonce = scheme.nonce_cache().generate_and_cache();
        let authorization = answer(&nonce, PASSWORD);

        let mut first = http::Response::new(());
        let outcome = scheme
            .authenticate(&request(Some(&authorization)), &mut first)
            .unwrap();
        assert!(outcome.is_authenticated());

        let mut second = http::Response::new(());
        let outcome = scheme
            .authenticate(&request(Some(&authorization)), &mut second)
            .unwrap();

        assert!(matches!(
            outcome,
            AuthOutcome::Challenged {
                state: DigestState::NONCE_STALE,
                status: None,
                stale: true,
            }
        ));
        assert_eq!(second.status(), StatusCode::UNAUTHORIZED);
        let header = second.headers().get("WWW-Authenticate").unwrap().to_str().unwrap();
        assert_eq!(challenge_param(header, "stale").as_deref(), Some("true"));
    }

    #[test]
    fn test_reuse_tolerated_without_replay_detection() {
        let scheme = scheme();
        let nonce = scheme.nonce_cache().generate_and_cache();
        let authorization = answer(&nonce, PASSWORD);

        for _ in 0..2 {
            let mut response = http::Response::new(());
            let outcome = scheme
                .authenticate(&request(Some(&authorization)), &mut response)
                .unwrap();
            assert!(outcome.is_authenticated());
        }
    }

    #[test]
    fn test_integrity_fault_propagates() {
        let identities = MemoryIdentityStore::new();
        identities.add_account(SimpleAccount::new("1", "Mufasa"));
        identities.add(IdentityType::Account(Arc::new(SimpleAccount::new("2", "Mufasa"))));
        let scheme = DigestAuthenticationScheme::new(
            DigestConfig::default().with_realm(REALM),
            DigestCredentialHandler::new(identities, MemoryCredentialStore::new()),
        );
        let nonce = scheme.nonce_cache().generate_and_cache();
        let mut response = http::Response::new(());

        let result = scheme.authenticate(&request(Some(&answer(&nonce, PASSWORD))), &mut response);

        assert!(matches!(result, Err(Error::Integrity(_))));
    }

    struct BrokenResponse;

    impl HttpResponse for BrokenResponse {
        fn set_header(&mut self, _name: &str, _value: &str) -> Result<()> {
            Err(Error::Store("connection reset".into()))
        }

        fn send_error(&mut self, _status: u16) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_challenge_failure_is_fatal() {
        let scheme = scheme();

        let result = scheme.authenticate(&request(None), &mut BrokenResponse);

        assert!(matches!(result, Err(Error::Challenge(_))));
    }

    #[test]
    fn test_initialize_outside_runtime_fails() {
        let mut scheme = scheme();
        assert_eq!(scheme.initialize(), Err(Error::NoRuntime));
        assert!(!scheme.is_sweeping());
    }

    #[tokio::test]
    async fn test_lifecycle_sweeps_and_stops() {
        let identities = MemoryIdentityStore::new();
        let mut scheme = DigestAuthenticationScheme::new(
            DigestConfig::default().with_nonce_max_valid(Duration::from_millis(100)),
            DigestCredentialHandler::new(identities, MemoryCredentialStore::new()),
        );
        scheme.initialize().unwrap();
        assert!(scheme.is_sweeping());

        let nonce = scheme.nonce_cache().generate_and_cache();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!scheme.nonce_cache().contains(&nonce));

        scheme.shutdown();
        assert!(!scheme.is_sweeping());
    }
}
