//! Proxy detection.
//!
//! Each platform walks a fixed list of configuration sources and stops at
//! the first one that yields a proxy URL. The file grammars live in
//! [`sources`], GNOME settings in [`gnome`], macOS `scutil` output in
//! [`scutil`], Windows registry values in [`registry`] and host exception
//! matching in [`bypass`].

pub mod bypass;
pub mod gnome;
pub mod registry;
pub mod scutil;
pub mod sources;

use std::fmt;
use std::fs;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{Result, ShimError};
use crate::platform::{ProxyDetector, SessionProvider};
use crate::shell::CommandRunner;

use self::gnome::GnomeProxySettings;

/// Where a proxy setting was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProxySource {
    Environment,
    ProfileD,
    AptProxyConf,
    AptConf,
    Yum,
    Sysconfig,
    LoginConf,
    GSettings,
    Scutil,
    Registry,
}

impl ProxySource {
    /// Linux/FreeBSD lookup order, highest priority first.
    pub const POSIX_ORDER: [ProxySource; 8] = [
        ProxySource::Environment,
        ProxySource::ProfileD,
        ProxySource::AptProxyConf,
        ProxySource::AptConf,
        ProxySource::Yum,
        ProxySource::Sysconfig,
        ProxySource::LoginConf,
        ProxySource::GSettings,
    ];

    pub fn describe(&self) -> &'static str {
        match self {
            ProxySource::Environment => "global environment settings",
            ProxySource::ProfileD => "profile.d",
            ProxySource::AptProxyConf => "apt package manager settings [proxy.conf]",
            ProxySource::AptConf => "apt package manager settings [apt.conf]",
            ProxySource::Yum => "yum package manager settings",
            ProxySource::Sysconfig => "sysconfig settings",
            ProxySource::LoginConf => "login.conf settings",
            ProxySource::GSettings => "gsettings",
            ProxySource::Scutil => "scutil",
            ProxySource::Registry => "Internet Settings registry key",
        }
    }
}

/// A detected proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyUrl {
    pub url: String,
    pub source: ProxySource,
}

impl fmt::Display for ProxyUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// WPAD auto-proxy settings, from config or the `--autoproxy` argument.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AutoProxy {
    setting: Option<String>,
}

impl AutoProxy {
    /// The configured value wins over the command line.
    pub fn resolve(configured: Option<&str>, requested: Option<&str>) -> Self {
        let setting = configured
            .or(requested)
            .map(|v| v.trim_matches('"').to_string())
            .filter(|v| !v.is_empty());
        Self { setting }
    }

    /// A value containing a dot names the DNS suffix to search.
    pub fn domain(&self) -> Option<String> {
        let value = self.setting.as_deref()?;
        if !value.contains('.') {
            return None;
        }
        Some(if value.starts_with('.') {
            value.to_string()
        } else {
            format!(".{value}")
        })
    }

    pub fn enabled(&self) -> bool {
        match self.setting.as_deref() {
            Some(value) => value == "1" || value.contains('.'),
            None => false,
        }
    }

    pub fn wpad_host(&self) -> String {
        format!("wpad{}", self.domain().unwrap_or_default())
    }

    /// True when auto-proxy is enabled and the WPAD host resolves.
    pub fn available(&self) -> bool {
        if !self.enabled() {
            return false;
        }
        let host = self.wpad_host();
        match (host.as_str(), 80).to_socket_addrs() {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                debug!("{host} does not resolve: {e}");
                false
            }
        }
    }
}

/// File- and gsettings-based detector for Linux and FreeBSD.
pub struct PosixProxyDetector {
    runner: Arc<dyn CommandRunner>,
    sessions: Arc<dyn SessionProvider>,
    installed_by: Option<u32>,
    root: PathBuf,
}

impl PosixProxyDetector {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        sessions: Arc<dyn SessionProvider>,
        installed_by: Option<u32>,
    ) -> Self {
        Self::with_root(runner, sessions, installed_by, "/")
    }

    /// Resolves every configuration file under `root` instead of `/`.
    pub fn with_root(
        runner: Arc<dyn CommandRunner>,
        sessions: Arc<dyn SessionProvider>,
        installed_by: Option<u32>,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            sessions,
            installed_by,
            root: root.into(),
        }
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn read(&self, path: &str) -> Option<String> {
        let full = self.host_path(path);
        if !full.exists() {
            return None;
        }
        match fs::read_to_string(&full) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Failed to read {}: {e}", full.display());
                None
            }
        }
    }

    fn gsettings_available(&self) -> bool {
        self.host_path("/usr/bin/gsettings").exists()
    }

    /// The user whose desktop settings apply: ourselves, or when running as
    /// root the installing user, else whoever owns the console.
    fn settings_uid(&self) -> u32 {
        let own = self.sessions.own_uid();
        if own != 0 {
            return own;
        }
        if let Some(uid) = self.installed_by {
            return uid;
        }
        match self.sessions.console_uid() {
            Ok(uid) => uid,
            Err(e) => {
                debug!("Unable to determine whose settings to read: {e}");
                0
            }
        }
    }

    fn gnome_settings(&self) -> Result<GnomeProxySettings> {
        let uid = self.settings_uid();
        debug!("Checking gsettings with UID: {uid}");
        GnomeProxySettings::fetch(self.runner.as_ref(), uid, self.sessions.own_uid())
    }

    /// Runs a single source. `Ok(None)` means the source had nothing to say.
    pub fn check_source(&self, source: ProxySource) -> Result<Option<String>> {
        let found = match source {
            ProxySource::Environment => self
                .read("/etc/environment")
                .and_then(|t| sources::parse_etc_environment(&t)),
            ProxySource::ProfileD => self
                .read("/etc/profile.d/proxy_setup")
                .and_then(|t| sources::parse_profile_d(&t)),
            ProxySource::AptProxyConf => self
                .read("/etc/apt/apt.conf.d/proxy.conf")
                .and_then(|t| sources::parse_apt_conf(&t)),
            ProxySource::AptConf => self
                .read("/etc/apt/apt.conf")
                .and_then(|t| sources::parse_apt_conf(&t)),
            ProxySource::Yum => self
                .read("/etc/yum.conf")
                .and_then(|t| sources::parse_yum_conf(&t)),
            ProxySource::Sysconfig => self.read("/etc/sysconfig/proxy").and_then(|t| {
                let curlrc = self.read("/root/.curlrc").unwrap_or_default();
                sources::parse_sysconfig_proxy(&t, &curlrc)
            }),
            ProxySource::LoginConf => self
                .read("/etc/login.conf")
                .and_then(|t| sources::parse_login_conf(&t)),
            ProxySource::GSettings => {
                if !self.gsettings_available() {
                    return Ok(None);
                }
                self.gnome_settings()?.manual_url()
            }
            ProxySource::Scutil | ProxySource::Registry => {
                return Err(ShimError::unsupported(source.describe()));
            }
        };
        Ok(found)
    }

    fn exceptions(&self) -> Vec<String> {
        if self.gsettings_available() {
            match self.gnome_settings() {
                Ok(settings) if settings.mode != "none" => return settings.exceptions,
                Ok(_) => {}
                Err(e) => debug!("gsettings unavailable: {e}"),
            }
        }
        std::env::var("no_proxy")
            .or_else(|_| std::env::var("NO_PROXY"))
            .map(|v| bypass::split_no_proxy(&v))
            .unwrap_or_default()
    }
}

impl ProxyDetector for PosixProxyDetector {
    fn detect_proxy(&self) -> Result<ProxyUrl> {
        info!("Checking Proxies [{}]", std::env::consts::OS);
        first_match(&ProxySource::POSIX_ORDER, |source| self.check_source(source))
    }

    fn should_bypass(&self, host: &str) -> Result<bool> {
        Ok(bypass::posix_matches(&self.exceptions(), host))
    }
}

/// Walks `order`, returning the first source that yields a URL. A source
/// that fails is logged and skipped.
pub fn first_match<F>(order: &[ProxySource], mut check: F) -> Result<ProxyUrl>
where
    F: FnMut(ProxySource) -> Result<Option<String>>,
{
    for &source in order {
        debug!("Checking {}", source.describe());
        match check(source) {
            Ok(Some(url)) => {
                info!(" => FOUND: {url}");
                return Ok(ProxyUrl { url, source });
            }
            Ok(None) => {}
            Err(e) => warn!("Checking {} failed: {e}", source.describe()),
        }
    }
    info!("NO PROXIES settings detected");
    Err(ShimError::NotDetected("proxy".to_string()))
}

/// Detector backed by macOS `scutil --proxy`.
pub struct ScutilProxyDetector {
    runner: Arc<dyn CommandRunner>,
}

impl ScutilProxyDetector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn settings(&self) -> Result<scutil::ScutilProxy> {
        let output = self
            .runner
            .output("scutil", &["--proxy"])?
            .checked_stdout("scutil")?;
        Ok(scutil::ScutilProxy::parse(&output))
    }
}

impl ProxyDetector for ScutilProxyDetector {
    fn detect_proxy(&self) -> Result<ProxyUrl> {
        first_match(&[ProxySource::Scutil], |_| Ok(self.settings()?.http_url()))
    }

    fn should_bypass(&self, host: &str) -> Result<bool> {
        Ok(bypass::posix_matches(&self.settings()?.exceptions, host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::fake::FakeRunner;

    #[test]
    fn autoproxy_domain_gets_leading_dot() {
        let auto = AutoProxy::resolve(Some("corp.example"), Some("1"));
        assert!(auto.enabled());
        assert_eq!(auto.domain().as_deref(), Some(".corp.example"));
        assert_eq!(auto.wpad_host(), "wpad.corp.example");
    }

    #[test]
    fn autoproxy_one_enables_without_domain() {
        let auto = AutoProxy::resolve(None, Some("\"1\""));
        assert!(auto.enabled());
        assert_eq!(auto.domain(), None);
        assert_eq!(auto.wpad_host(), "wpad");
    }

    #[test]
    fn autoproxy_absent_is_disabled() {
        let auto = AutoProxy::resolve(None, None);
        assert!(!auto.enabled());
        assert!(!auto.available());
    }

    #[test]
    fn first_match_skips_failing_sources() {
        let found = first_match(
            &[ProxySource::Environment, ProxySource::Yum, ProxySource::LoginConf],
            |source| match source {
                ProxySource::Environment => Err(ShimError::NotDetected("x".into())),
                ProxySource::Yum => Ok(Some("http://yum:8080".to_string())),
                _ => panic!("checked past the first hit"),
            },
        )
        .unwrap();
        assert_eq!(found.source, ProxySource::Yum);
        assert_eq!(found.to_string(), "http://yum:8080");
    }

    #[test]
    fn first_match_with_nothing_is_not_detected() {
        let err = first_match(&ProxySource::POSIX_ORDER, |_| Ok(None)).unwrap_err();
        assert!(matches!(err, ShimError::NotDetected(_)));
    }

    struct RootHost;

    impl SessionProvider for RootHost {
        fn own_uid(&self) -> u32 {
            0
        }

        fn console_uid(&self) -> Result<u32> {
            Ok(2000)
        }

        fn username(&self, uid: u32) -> Result<String> {
            Ok(format!("user{uid}"))
        }

        fn user_env(&self, _uid: u32, _key: &str) -> Option<String> {
            None
        }

        fn x_info(&self, _uid: u32) -> Result<crate::session::XInfo> {
            Ok(crate::session::XInfo::default())
        }
    }

    #[test]
    fn root_reads_the_installing_users_gsettings() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("usr/bin")).unwrap();
        fs::write(root.path().join("usr/bin/gsettings"), "").unwrap();
        let runner = Arc::new(
            FakeRunner::default()
                .reply("gsettings get org.gnome.system.proxy mode", "'manual'\n")
                .reply("gsettings get org.gnome.system.proxy.http host", "'desk.corp'\n")
                .reply("gsettings get org.gnome.system.proxy.http port", "3128\n")
                .reply("gsettings get org.gnome.system.proxy.http use-authentication", "false\n")
                .reply("gsettings get org.gnome.system.proxy.http authentication-user", "''\n")
                .reply("gsettings get org.gnome.system.proxy.http authentication-password", "''\n")
                .reply("gsettings get org.gnome.system.proxy ignore-hosts", "@as []\n"),
        );
        let detector =
            PosixProxyDetector::with_root(runner.clone(), Arc::new(RootHost), Some(1000), root.path());

        assert_eq!(detector.detect_proxy().unwrap().url, "http://desk.corp:3128");
        let calls = runner.calls();
        assert!(!calls.is_empty());
        for call in calls {
            assert_eq!(call.uid, Some(1000));
            assert!(call.env.contains(&(
                "DBUS_SESSION_BUS_ADDRESS".to_string(),
                "unix:path=/run/user/1000/bus".to_string()
            )));
        }
    }
}
