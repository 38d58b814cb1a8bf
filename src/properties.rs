//! User and device property bags.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Two independent `string -> string` maps available to rule conditions.
///
/// The distinguished device key `country` is populated from the rules-fetch
/// response when the server reports one.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct PropertyStore {
    user: HashMap<String, String>,
    device: HashMap<String, String>,
}

pub(crate) const COUNTRY_PROPERTY: &str = "country";

impl PropertyStore {
    pub fn set_user(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.user.insert(key.into(), value.into());
    }

    pub fn remove_user(&mut self, key: &str) {
        self.user.remove(key);
    }

    pub fn set_device(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.device.insert(key.into(), value.into());
    }

    pub fn remove_device(&mut self, key: &str) {
        self.device.remove(key);
    }

    pub fn user(&self) -> &HashMap<String, String> {
        &self.user
    }

    pub fn device(&self) -> &HashMap<String, String> {
        &self.device
    }
}
