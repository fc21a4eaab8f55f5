//! WinINet proxy settings from the user's registry hive.

use hostshim_core::error::{Result, ShimError};
use hostshim_core::platform::ProxyDetector;
use hostshim_core::proxy::registry::{
    INSTALLED_BY_VALUE, INTERNET_SETTINGS, RegistryProxySettings, pick_user_hive,
};
use hostshim_core::proxy::{ProxySource, ProxyUrl, first_match};
use log::{debug, warn};
use winapi::um::winnt::KEY_READ;
use winapi::um::winreg::{HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, HKEY_USERS};

use crate::registry::RegKey;
use crate::win32;

/// Service key whose `_InstalledBy` value names the installing user.
pub fn service_key_path(service: &str) -> String {
    format!(r"SYSTEM\CurrentControlSet\Services\{service}")
}

pub struct RegistryProxyDetector {
    service_name: String,
}

impl RegistryProxyDetector {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn installed_by(&self) -> Option<String> {
        let path = service_key_path(&self.service_name);
        let key = RegKey::open(HKEY_LOCAL_MACHINE, &path, KEY_READ).ok()?;
        key.string(INSTALLED_BY_VALUE).ok().flatten()
    }

    fn first_user_hive() -> Option<String> {
        let users = RegKey::open(HKEY_USERS, "", KEY_READ).ok()?;
        pick_user_hive(&users.subkeys().ok()?)
    }

    /// An interactive process reads its own hive. A service has no useful
    /// HKCU, so it looks for the installing user, then the console user,
    /// then any loaded user hive.
    fn internet_settings(&self) -> Result<RegKey> {
        if win32::own_session_id()? != 0 {
            return RegKey::open(HKEY_CURRENT_USER, INTERNET_SETTINGS, KEY_READ);
        }

        let sid = self
            .installed_by()
            .or_else(|| {
                win32::console_session_id()
                    .and_then(win32::session_user_sid)
                    .map_err(|e| debug!("No console user SID: {e}"))
                    .ok()
            })
            .or_else(Self::first_user_hive)
            .ok_or_else(|| {
                ShimError::NotDetected("which user proxy setting to query".to_string())
            })?;

        debug!("Reading proxy settings of {sid}");
        RegKey::open(HKEY_USERS, &format!(r"{sid}\{INTERNET_SETTINGS}"), KEY_READ)
    }

    fn settings(&self) -> Result<RegistryProxySettings> {
        let key = self.internet_settings()?;
        let enabled = key.dword("ProxyEnable").unwrap_or_else(|e| {
            warn!("Unreadable ProxyEnable: {e}");
            None
        });
        Ok(RegistryProxySettings {
            enabled: enabled == Some(1),
            server: key.string("ProxyServer")?,
            overrides: key.string("ProxyOverride")?,
        })
    }
}

impl ProxyDetector for RegistryProxyDetector {
    fn detect_proxy(&self) -> Result<ProxyUrl> {
        first_match(&[ProxySource::Registry], |_| Ok(self.settings()?.url()))
    }

    fn should_bypass(&self, host: &str) -> Result<bool> {
        Ok(self.settings()?.should_bypass(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_key_lives_under_current_control_set() {
        assert_eq!(
            service_key_path("hostshim"),
            r"SYSTEM\CurrentControlSet\Services\hostshim"
        );
    }
}
