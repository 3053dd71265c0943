//! Capability checks for the RPC surface.
//!
//! Capabilities are hierarchical colon-separated tokens (`axon:get`,
//! `axon:has`, `axon:upload`). A grant is a token prefix: granting `axon`
//! covers all three. The [Authorizer] trait is the seam towards whatever
//! actually stores grants; [StaticAuthorizer] is the built-in table-backed
//! implementation, [AllowAll] the permissive one for tests and development.

use std::collections::HashMap;

pub const PERM_GET: &str = "axon:get";
pub const PERM_HAS: &str = "axon:has";
pub const PERM_UPLOAD: &str = "axon:upload";

fn segments(token: &str) -> Vec<String> {
    token.split(':').map(str::to_string).collect()
}

/// A set of grant rules for a single identity.
#[derive(Debug, Clone, Default)]
pub struct Grants {
    rules: Vec<Vec<String>>,
}

impl Grants {
    pub fn grant(&mut self, rule: &str) {
        self.rules.push(segments(rule));
    }

    /// Whether any grant rule is a segment-wise prefix of the given
    /// capability token.
    pub fn allows(&self, perm: &str) -> bool {
        let perm = segments(perm);
        self.rules
            .iter()
            .any(|rule| rule.len() <= perm.len() && rule.iter().zip(perm.iter()).all(|(a, b)| a == b))
    }
}

impl<S: AsRef<str>> FromIterator<S> for Grants {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut grants = Grants::default();
        for rule in iter {
            grants.grant(rule.as_ref());
        }
        grants
    }
}

/// Decides whether a given identity holds a given capability.
pub trait Authorizer: Send + Sync {
    fn allowed(&self, user: &str, perm: &str) -> bool;
}

/// Grants every capability to every identity.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn allowed(&self, _user: &str, _perm: &str) -> bool {
        true
    }
}

/// A fixed user → grants table. Unknown users hold nothing.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    users: HashMap<String, Grants>,
}

impl StaticAuthorizer {
    pub fn new(users: HashMap<String, Vec<String>>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|(user, rules)| (user, rules.into_iter().collect()))
                .collect(),
        }
    }

    pub fn grant(&mut self, user: &str, rule: &str) {
        self.users.entry(user.to_string()).or_default().grant(rule);
    }
}

impl Authorizer for StaticAuthorizer {
    fn allowed(&self, user: &str, perm: &str) -> bool {
        self.users.get(user).map(|g| g.allows(perm)).unwrap_or(false)
    }
}
