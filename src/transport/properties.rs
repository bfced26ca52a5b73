//! Transport properties: string key/value pairs a transport plugin uses to
//! reach a contact (an onion address, a Bluetooth MAC, a LAN socket address).

use std::collections::BTreeMap;

/// Properties of one transport for one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportProperties(BTreeMap<String, String>);

impl TransportProperties {
    /// Create an empty property set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Get a property.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Overwrite our entries with `other`'s.
    pub fn merge(&mut self, other: &TransportProperties) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Whether there are no properties.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the properties in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TransportProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
