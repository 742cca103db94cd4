//! Identity and credential storage collaborators.
//!
//! The engine only reads from these. The in-memory implementations are meant for
//! tests and small deployments.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::digest::DigestSecret;
use crate::Result;

/// An account that can authenticate.
pub trait Account: fmt::Debug + Send + Sync {
    /// Stable identifier of the account in its store
    fn id(&self) -> &str;
    /// Value of the attribute `name`, if the account has it
    fn attribute(&self, name: &str) -> Option<&str>;
    fn is_enabled(&self) -> bool;
}

/// What an identity query may return. Only accounts can own credentials.
#[derive(Debug, Clone)]
pub enum IdentityType {
    Account(Arc<dyn Account>),
    /// Groups, roles and the like
    Other { kind: String, id: String },
}

/// Query side of the identity store.
pub trait IdentityStore: Send + Sync {
    /// All identities whose attribute `attribute` equals `value`
    fn find_by_attribute(&self, attribute: &str, value: &str) -> Result<Vec<IdentityType>>;
}

/// A persisted credential (password hash, digest secret...).
pub trait CredentialStorage {
    fn effective_date(&self) -> SystemTime;
    fn expiry_date(&self) -> Option<SystemTime>;

    /// Expired once the expiry date is reached. Unrelated to nonce expiry.
    fn is_expired(&self) -> bool {
        match self.expiry_date() {
            Some(expiry) => expiry <= SystemTime::now(),
            None => false,
        }
    }
}

/// Lookup of the current credential storage of an account.
pub trait CredentialStore: Send + Sync {
    type Storage: CredentialStorage;

    /// The storage currently in effect for `account` and credential `kind`
    fn retrieve_current(&self, account: &dyn Account, kind: &str)
        -> Result<Option<Self::Storage>>;
}

/// Stored secret used to verify digest responses.
#[derive(Debug, Clone)]
pub struct DigestCredentialStorage {
    /// Realm the secret was enrolled for
    pub realm: String,
    pub secret: DigestSecret,
    pub effective_date: SystemTime,
    pub expiry_date: Option<SystemTime>,
}

impl DigestCredentialStorage {
    pub fn new(realm: impl Into<String>, secret: DigestSecret) -> Self {
        Self {
            realm: realm.into(),
            secret,
            effective_date: SystemTime::now(),
            expiry_date: None,
        }
    }

    pub fn with_expiry(mut self, expiry: SystemTime) -> Self {
        self.expiry_date = Some(expiry);
        self
    }
}

impl CredentialStorage for DigestCredentialStorage {
    fn effective_date(&self) -> SystemTime {
        self.effective_date
    }

    fn expiry_date(&self) -> Option<SystemTime> {
        self.expiry_date
    }
}

/// Plain account with an attribute map.
#[derive(Debug, Clone)]
pub struct SimpleAccount {
    pub id: String,
    pub enabled: bool,
    pub attributes: HashMap<String, String>,
}

impl SimpleAccount {
    /// Enabled account with the default login-name attribute set
    pub fn new(id: impl Into<String>, login_name: impl Into<String>) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(
            crate::config::DEFAULT_LOGIN_NAME_ATTRIBUTE.to_string(),
            login_name.into(),
        );

        Self {
            id: id.into(),
            enabled: true,
            attributes,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl Account for SimpleAccount {
    fn id(&self) -> &str {
        &self.id
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// In-memory identity store.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identities: RwLock<Vec<IdentityType>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, identity: IdentityType) {
        self.identities.write().push(identity);
    }

    pub fn add_account(&self, account: impl Account + 'static) {
        self.add(IdentityType::Account(Arc::new(account)));
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn find_by_attribute(&self, attribute: &str, value: &str) -> Result<Vec<IdentityType>> {
        let identities = self.identities.read();

        Ok(identities
            .iter()
            .filter(|identity| match identity {
                IdentityType::Account(account) => account.attribute(attribute) == Some(value),
                IdentityType::Other { id, .. } => attribute == "id" && id == value,
            })
            .cloned()
            .collect())
    }
}

/// In-memory credential store keyed by account id and credential kind.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    storages: RwLock<HashMap<(String, String), DigestCredentialStorage>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current storage of `account_id` for `kind`
    pub fn store(&self, account_id: &str, kind: &str, storage: DigestCredentialStorage) {
        self.storages
            .write()
            .insert((account_id.to_string(), kind.to_string()), storage);
    }
}

impl CredentialStore for MemoryCredentialStore {
    type Storage = DigestCredentialStorage;

    fn retrieve_current(
        &self,
        account: &dyn Account,
        kind: &str,
    ) -> Result<Option<DigestCredentialStorage>> {
        Ok(self
            .storages
            .read()
            .get(&(account.id().to_string(), kind.to_string()))
            .cloned())
    }
}
