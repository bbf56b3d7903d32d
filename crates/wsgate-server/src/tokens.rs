//! Opaque connection tokens scoped to a (tenant, user) pair.
//!
//! A token is issued once per pair and reused until the process exits.
//! Both directions are kept: pair → token for idempotent issuance and
//! token → pair for authentication on connect.

use std::fmt;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use rand::distr::Alphanumeric;

/// Number of alphanumeric characters in a generated token.
pub const TOKEN_LENGTH: usize = 32;

/// Identifier of an authenticated principal, opaque to the gateway.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
    /// Wrap an identifier from the host identity system.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A bearer token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    fn generate() -> Self {
        let value: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect();
        Self(value)
    }

    /// The secret value, for handing to the client.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `candidate` has the shape of an issued token.
    pub fn is_well_formed(candidate: &str) -> bool {
        candidate.len() == TOKEN_LENGTH && candidate.bytes().all(|b| b.is_ascii_alphanumeric())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

/// Collision-free encoding of a (tenant, user) pair.
///
/// Both parts are length-prefixed, so `("ab", "c")` and `("a", "bc")` differ.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TenantUserKey(String);

impl TenantUserKey {
    /// Encode a pair.
    pub fn new(tenant: &str, user: &UserId) -> Self {
        let user = user.as_str();
        Self(format!("{}:{tenant}{}:{user}", tenant.len(), user.len()))
    }

    /// Encoded form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug)]
struct Grant {
    tenant: String,
    user: UserId,
}

/// Concurrent, append-only token store.
#[derive(Default)]
pub struct TokenRegistry {
    by_pair: DashMap<TenantUserKey, Token>,
    by_token: DashMap<String, Grant>,
}

impl TokenRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `(tenant, user)`, issuing one if none exists yet.
    ///
    /// Concurrent callers for the same pair all receive the same token. The
    /// reverse mapping is stored before the token is returned to anyone.
    pub fn get_token(&self, tenant: &str, user: &UserId) -> Token {
        let key = TenantUserKey::new(tenant, user);
        if let Some(existing) = self.by_pair.get(&key) {
            return existing.clone();
        }
        self.by_pair
            .entry(key)
            .or_insert_with(|| self.issue(tenant, user))
            .clone()
    }

    fn issue(&self, tenant: &str, user: &UserId) -> Token {
        loop {
            let token = Token::generate();
            if let Entry::Vacant(slot) = self.by_token.entry(token.0.clone()) {
                let _ = slot.insert(Grant {
                    tenant: tenant.to_owned(),
                    user: user.clone(),
                });
                tracing::debug!(tenant, user = %user, "issued connection token");
                return token;
            }
        }
    }

    /// User the token was issued to, if it was issued for `tenant`.
    pub fn resolve_user(&self, tenant: &str, token: &str) -> Option<UserId> {
        if !Token::is_well_formed(token) {
            return None;
        }
        let grant = self.by_token.get(token)?;
        (grant.tenant == tenant).then(|| grant.user.clone())
    }

    /// Number of issued tokens.
    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    /// Whether no token has been issued.
    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
