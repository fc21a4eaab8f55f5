//! Windows `Internet Settings` proxy values, read by the Windows shell.

use super::bypass;

/// Per-user key holding the WinINet proxy configuration.
pub const INTERNET_SETTINGS: &str = r"Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// Service key value naming the SID of the user who installed the service.
pub const INSTALLED_BY_VALUE: &str = "_InstalledBy";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryProxySettings {
    pub enabled: bool,
    pub server: Option<String>,
    pub overrides: Option<String>,
}

impl RegistryProxySettings {
    pub fn url(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        self.server.clone().filter(|s| !s.trim().is_empty())
    }

    pub fn should_bypass(&self, host: &str) -> bool {
        self.overrides
            .as_deref()
            .is_some_and(|list| bypass::windows_matches(list, host))
    }
}

/// First `HKEY_USERS` subkey that is a user's SID rather than a well-known
/// account (`S-1-5-18`) or a `_Classes` companion hive.
pub fn pick_user_hive<S: AsRef<str>>(subkeys: &[S]) -> Option<String> {
    subkeys
        .iter()
        .map(AsRef::as_ref)
        .find(|key| key.split('-').count() > 5 && !key.ends_with("_Classes"))
        .map(str::to_string)
}
