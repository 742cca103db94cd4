//! This crate implements the server side of HTTP Digest authentication (RFC 2617).
//!
//! It parses `Authorization: Digest ...` headers, keeps a cache of issued nonces that
//! is swept in the background, writes `WWW-Authenticate` challenges and validates the
//! presented credentials against pluggable identity and credential stores.
//!
//! Validation outcomes are reported as a [`CredentialStatus`]; only faults of the
//! stores themselves (e.g. two accounts with the same login name) and failures to
//! write a challenge are returned as errors.
//!
//! # Examples
//!
//! Basic usage:
//!
//! ```
//! use digest_auth_engine::*;
//!
//! let identities = MemoryIdentityStore::new();
//! identities.add_account(SimpleAccount::new("1", "Mufasa"));
//!
//! let credentials = MemoryCredentialStore::new();
//! credentials.store(
//!     "1",
//!     DIGEST_CREDENTIAL_KIND,
//!     DigestCredentialStorage::new("testrealm@host.com", DigestSecret::Password("Circle Of Life".into())),
//! );
//!
//! let scheme = DigestAuthenticationScheme::new(
//!     DigestConfig::default().with_realm("testrealm@host.com"),
//!     DigestCredentialHandler::new(identities, credentials),
//! );
//!
//! // The first request carries no credentials and gets challenged
//! let request = http::Request::builder().uri("/dir/index.html").body(()).unwrap();
//! let mut response = http::Response::new(());
//! let outcome = scheme.authenticate(&request, &mut response).unwrap();
//!
//! assert!(!outcome.is_authenticated());
//! assert_eq!(response.status(), 401);
//! assert!(response.headers()["WWW-Authenticate"]
//!     .to_str()
//!     .unwrap()
//!     .starts_with(r#"Digest realm="testrealm@host.com",domain="/",nonce=""#));
//! ```
//!
//! In a server, call [`DigestAuthenticationScheme::initialize`] from within the tokio
//! runtime so that expired nonces get swept.

mod config;
mod digest;
mod enums;
mod error;
mod handler;
mod nonce;
mod scheme;
mod store;
mod transport;
mod utils;

pub use error::{Error, Result};

pub use crate::config::{
    DigestConfig, DEFAULT_LOGIN_NAME_ATTRIBUTE, DEFAULT_NONCE_MAX_VALID, DEFAULT_REALM_NAME,
};
pub use crate::digest::{parse_tokens, DigestCredential, DigestSecret, DIGEST_PREFIX};
pub use crate::enums::*;
pub use crate::handler::{
    find_account, CredentialHandler, CredentialState, CredentialStatus, Credentials,
    DigestCredentialHandler, DIGEST_CREDENTIAL_KIND,
};
pub use crate::nonce::{Nonce, NonceCache, NonceSweeper};
pub use crate::scheme::{AuthOutcome, DigestAuthenticationScheme, DigestState, Extraction};
pub use crate::store::{
    Account, CredentialStorage, CredentialStore, DigestCredentialStorage, IdentityStore,
    IdentityType, MemoryCredentialStore, MemoryIdentityStore, SimpleAccount,
};
pub use crate::transport::{
    ContextPath, HttpRequest, HttpResponse, AUTHORIZATION, WWW_AUTHENTICATE, X_REQUESTED_WITH,
};

/// Parse the value of an `Authorization` header sent with a `method` request.
/// It's just a convenience method to call [`DigestCredential::parse()`](struct.DigestCredential.html#method.parse).
pub fn parse(authorization: &str, method: &str) -> Result<DigestCredential> {
    DigestCredential::parse(authorization, method)
}

#[test]
fn test_parse_verify() {
    let src = r#"Digest username="Mufasa",
       realm="http-auth@example.org",
       nonce="7ypf/xlj9XXwfDPEoM4URrv/xwf94BcCAzFZH4GiTo0v",
       uri="/dir/index.html",
       qop=auth,
       nc=00000001,
       cnonce="f2/wE4q74E6zIJEtWaHKaf5wv/H5QzzpXusqGemxURZJ",
       response="8ca523f5e9506fed4657c9700eebdbec",
       opaque="FQhe/qaU925kfnzjCev0ciny7QMkPqMAFRtzCUYo5tdS",
       algorithm=MD5"#;

    let credential = crate::parse(src, "GET").unwrap();

    assert_eq!(credential.status(), CredentialStatus::IN_PROGRESS);
    assert!(credential.matches(&DigestSecret::Password("Circle of Life".into())));
    assert!(!credential.matches(&DigestSecret::Password("Circle of Death".into())));

    let str = credential.to_string().replace(", ", ",\n  ");
    assert_eq!(
        str,
        r#"
Digest username="Mufasa",
  realm="http-auth@example.org",
  nonce="7ypf/xlj9XXwfDPEoM4URrv/xwf94BcCAzFZH4GiTo0v",
  uri="/dir/index.html",
  qop=auth,
  nc=00000001,
  cnonce="f2/wE4q74E6zIJEtWaHKaf5wv/H5QzzpXusqGemxURZJ",
  response="8ca523f5e9506fed4657c9700eebdbec",
  opaque="FQhe/qaU925kfnzjCev0ciny7QMkPqMAFRtzCUYo5tdS",
  algorithm=MD5
"#
        .trim()
    );
}
