//! Validated assertion data extracted from a SAML Response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered attribute mapping from a SAML attribute statement.
///
/// Names map to ordered sequences of values; both insertion order of names
/// and the order of values within a name are preserved exactly as they
/// appeared in the assertion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeBag(Vec<(String, Vec<String>)>);

impl AttributeBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `name`, creating the entry if absent.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if let Some((_, values)) = self.0.iter_mut().find(|(n, _)| *n == name) {
            values.push(value.into());
        } else {
            self.0.push((name, vec![value.into()]));
        }
    }

    /// Insert a complete value sequence under `name`, replacing any
    /// existing entry.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<String>) {
        let name = name.into();
        if let Some((_, existing)) = self.0.iter_mut().find(|(n, _)| *n == name) {
            *existing = values;
        } else {
            self.0.push((name, values));
        }
    }

    /// All values for `name`, in assertion order.
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// The first value for `name`.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Vec<String>)> for AttributeBag {
    fn from_iter<T: IntoIterator<Item = (String, Vec<String>)>>(iter: T) -> Self {
        let mut bag = Self::new();
        for (name, values) in iter {
            bag.insert(name, values);
        }
        bag
    }
}

/// A validated SAML assertion.
///
/// Instances are only produced by the response validator after signature,
/// status, replay, time-window, and audience checks have all passed.
#[derive(Debug, Clone)]
pub struct Assertion {
    /// Assertion ID as issued by the IdP.
    pub id: String,

    /// Entity ID of the issuing IdP.
    pub issuer: String,

    /// Subject NameID value.
    pub subject: String,

    /// NameID format URN, if the IdP declared one.
    pub name_id_format: Option<String>,

    /// SessionIndex from the AuthnStatement, used for Single Logout.
    pub session_index: Option<String>,

    /// Start of the validity window.
    pub not_before: Option<DateTime<Utc>>,

    /// End of the validity window.
    pub not_on_or_after: Option<DateTime<Utc>>,

    /// Audience restriction entity IDs.
    pub audiences: Vec<String>,

    /// Attribute statement contents, verbatim.
    pub attributes: AttributeBag,
}
