//! Credential validation pipeline.
//!
//! A [`CredentialHandler`] supplies three capabilities for one credential type:
//! account lookup, retrieval of the stored credential and the comparison itself.
//! The provided [`CredentialHandler::validate`] turns them into exactly one
//! terminal [`CredentialStatus`].

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::DEFAULT_LOGIN_NAME_ATTRIBUTE;
use crate::digest::DigestCredential;
use crate::store::{
    Account, CredentialStorage, CredentialStore, DigestCredentialStorage, IdentityStore,
    IdentityType,
};
use crate::{Error, Result};

/// Outcome of a validation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum CredentialStatus {
    IN_PROGRESS,
    VALID,
    INVALID,
    EXPIRED,
    ACCOUNT_DISABLED,
}

impl Default for CredentialStatus {
    fn default() -> Self {
        CredentialStatus::IN_PROGRESS
    }
}

impl Display for CredentialStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CredentialStatus::IN_PROGRESS => "IN_PROGRESS",
            CredentialStatus::VALID => "VALID",
            CredentialStatus::INVALID => "INVALID",
            CredentialStatus::EXPIRED => "EXPIRED",
            CredentialStatus::ACCOUNT_DISABLED => "ACCOUNT_DISABLED",
        })
    }
}

/// Validation state carried by a credential
#[derive(Debug, Clone, Default)]
pub struct CredentialState {
    pub status: CredentialStatus,
    /// Set only when `status` is `VALID`
    pub validated_account: Option<Arc<dyn Account>>,
}

/// Anything a handler can validate.
pub trait Credentials: Debug {
    fn state(&self) -> &CredentialState;
    fn state_mut(&mut self) -> &mut CredentialState;

    fn status(&self) -> CredentialStatus {
        self.state().status
    }

    fn set_status(&mut self, status: CredentialStatus) {
        self.state_mut().status = status;
    }

    fn validated_account(&self) -> Option<&Arc<dyn Account>> {
        self.state().validated_account.as_ref()
    }

    fn set_validated_account(&mut self, account: Option<Arc<dyn Account>>) {
        self.state_mut().validated_account = account;
    }
}

/// Validates one kind of credentials against an identity store.
pub trait CredentialHandler<C: Credentials> {
    type Storage: CredentialStorage + Debug;

    /// Account owning `credentials`, `None` if there is none.
    ///
    /// # Errors
    /// Integrity faults of the identity store (see [`find_account`]).
    fn account(&self, credentials: &C) -> Result<Option<Arc<dyn Account>>>;

    /// Storage currently in effect for the account, if any was enrolled
    fn credential_storage(
        &self,
        account: &dyn Account,
        credentials: &C,
    ) -> Result<Option<Self::Storage>>;

    /// Whether `credentials` match the stored credential
    fn validate_credential(&self, storage: Option<&Self::Storage>, credentials: &C) -> bool;

    /// Identity attribute the login name is matched against. Handlers that do not
    /// look accounts up by login name ignore it.
    fn set_login_name_attribute(&mut self, _attribute: &str) {}

    /// Run the pipeline and leave a terminal status in `credentials`.
    ///
    /// Credential failures are reported through the status. Only store faults
    /// (ambiguous lookup, wrong identity kind, store errors) are returned as `Err`.
    fn validate(&self, credentials: &mut C) -> Result<()> {
        credentials.set_status(CredentialStatus::IN_PROGRESS);

        debug!(?credentials, "starting credential validation");

        let account = self.account(credentials)?;

        match &account {
            Some(account) if account.is_enabled() => {
                debug!(account = account.id(), "account found and enabled");

                let storage = self.credential_storage(account.as_ref(), credentials)?;

                debug!(account = account.id(), ?storage, "current credential storage");

                if self.validate_credential(storage.as_ref(), credentials) {
                    if storage.as_ref().map_or(false, |s| s.is_expired()) {
                        credentials.set_status(CredentialStatus::EXPIRED);
                    } else if credentials.status() == CredentialStatus::IN_PROGRESS {
                        credentials.set_status(CredentialStatus::VALID);
                    }
                }
            }
            Some(account) => {
                debug!(account = account.id(), "account is disabled");
                credentials.set_status(CredentialStatus::ACCOUNT_DISABLED);
            }
            None => {
                debug!("account not found");
            }
        }

        credentials.set_validated_account(None);

        match credentials.status() {
            CredentialStatus::VALID => credentials.set_validated_account(account),
            CredentialStatus::IN_PROGRESS => credentials.set_status(CredentialStatus::INVALID),
            _ => {}
        }

        debug!(
            status = %credentials.status(),
            validated_account = ?credentials.validated_account().map(|a| a.id()),
            "finished credential validation"
        );

        Ok(())
    }
}

/// Look up the single account whose `attribute` equals `login_name`.
///
/// # Errors
/// `Integrity` when more than one identity matches or the match is not an account.
pub fn find_account(
    store: &dyn IdentityStore,
    attribute: &str,
    login_name: &str,
) -> Result<Option<Arc<dyn Account>>> {
    debug!(attribute, login_name, "looking up account");

    let mut found = store.find_by_attribute(attribute, login_name)?;

    match found.len() {
        0 => Ok(None),
        1 => match found.remove(0) {
            IdentityType::Account(account) => Ok(Some(account)),
            IdentityType::Other { kind, id } => {
                warn!(attribute, login_name, kind = %kind, "lookup returned a non-account identity");
                Err(Error::Integrity(format!(
                    "identity returned for {}={} is not an account: {} {}",
                    attribute, login_name, kind, id
                )))
            }
        },
        n => {
            warn!(attribute, login_name, matches = n, "ambiguous account lookup");
            Err(Error::Integrity(format!(
                "{} accounts found with {}={}",
                n, attribute, login_name
            )))
        }
    }
}

/// Credential kind under which digest secrets are stored
pub const DIGEST_CREDENTIAL_KIND: &str = "digest";

/// Handler for [`DigestCredential`]s.
///
/// The account is looked up by the digest username, the stored secret must have been
/// enrolled for the realm the client answered for.
pub struct DigestCredentialHandler<I, S> {
    identities: I,
    credentials: S,
    login_name_attribute: String,
}

impl<I, S> DigestCredentialHandler<I, S>
where
    I: IdentityStore,
    S: CredentialStore<Storage = DigestCredentialStorage>,
{
    pub fn new(identities: I, credentials: S) -> Self {
        Self {
            identities,
            credentials,
            login_name_attribute: DEFAULT_LOGIN_NAME_ATTRIBUTE.to_string(),
        }
    }

    pub fn login_name_attribute(&self) -> &str {
        &self.login_name_attribute
    }
}

impl<I, S> CredentialHandler<DigestCredential> for DigestCredentialHandler<I, S>
where
    I: IdentityStore,
    S: CredentialStore<Storage = DigestCredentialStorage>,
{
    type Storage = DigestCredentialStorage;

    fn account(&self, credentials: &DigestCredential) -> Result<Option<Arc<dyn Account>>> {
        match &credentials.username {
            Some(username) => find_account(&self.identities, &self.login_name_attribute, username),
            None => Ok(None),
        }
    }

    fn credential_storage(
        &self,
        account: &dyn Account,
        _credentials: &DigestCredential,
    ) -> Result<Option<DigestCredentialStorage>> {
        self.credentials
            .retrieve_current(account, DIGEST_CREDENTIAL_KIND)
    }

    fn validate_credential(
        &self,
        storage: Option<&DigestCredentialStorage>,
        credentials: &DigestCredential,
    ) -> bool {
        match storage {
            Some(storage) if credentials.realm.as_deref() == Some(storage.realm.as_str()) => {
                credentials.matches(&storage.secret)
            }
            _ => false,
        }
    }

    fn set_login_name_attribute(&mut self, attribute: &str) {
        self.login_name_attribute = attribute.to_string();
    }
}
