//! GNOME desktop proxy settings, read through `gsettings`.

use log::debug;

use crate::error::Result;
use crate::shell::{CommandRunner, CommandSpec};

const SCHEMA: &str = "org.gnome.system.proxy";
const HTTP_SCHEMA: &str = "org.gnome.system.proxy.http";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GnomeProxySettings {
    /// `none`, `manual` or `auto`.
    pub mode: String,
    pub host: String,
    pub port: u16,
    pub auth_enabled: bool,
    pub username: String,
    pub password: String,
    pub exceptions: Vec<String>,
}

impl GnomeProxySettings {
    /// Reads the settings of `uid`. When that is not us, `gsettings` runs as
    /// that user against their session bus.
    pub fn fetch(runner: &dyn CommandRunner, uid: u32, own_uid: u32) -> Result<Self> {
        let get = |schema: &str, key: &str| -> Result<String> {
            let mut spec = CommandSpec::new("gsettings").args(["get", schema, key]);
            if uid != own_uid {
                spec = spec
                    .uid(Some(uid))
                    .env("DBUS_SESSION_BUS_ADDRESS", format!("unix:path=/run/user/{uid}/bus"));
            }
            runner.run(&spec)?.checked_stdout("gsettings")
        };

        let settings = Self {
            mode: unquote_gvariant(&get(SCHEMA, "mode")?),
            host: unquote_gvariant(&get(HTTP_SCHEMA, "host")?),
            port: parse_gvariant_int(&get(HTTP_SCHEMA, "port")?).unwrap_or(0),
            auth_enabled: get(HTTP_SCHEMA, "use-authentication")?.trim() == "true",
            username: unquote_gvariant(&get(HTTP_SCHEMA, "authentication-user")?),
            password: unquote_gvariant(&get(HTTP_SCHEMA, "authentication-password")?),
            exceptions: parse_gvariant_string_list(&get(SCHEMA, "ignore-hosts")?),
        };
        debug!("gsettings proxy mode for uid {uid}: {}", settings.mode);
        Ok(settings)
    }

    /// The proxy URL when the desktop is configured manually.
    pub fn manual_url(&self) -> Option<String> {
        if self.mode != "manual" || self.host.is_empty() {
            return None;
        }
        if self.auth_enabled {
            Some(format!(
                "http://{}:{}@{}:{}",
                self.username, self.password, self.host, self.port
            ))
        } else {
            Some(format!("http://{}:{}", self.host, self.port))
        }
    }
}

/// `'value'` -> `value`.
pub fn unquote_gvariant(raw: &str) -> String {
    let raw = raw.trim();
    raw.strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(raw)
        .to_string()
}

/// `8080` or `uint32 8080`.
pub fn parse_gvariant_int(raw: &str) -> Option<u16> {
    raw.split_whitespace().last()?.parse().ok()
}

/// `['localhost', '127.0.0.0/8']`, or `@as []` when empty.
pub fn parse_gvariant_string_list(raw: &str) -> Vec<String> {
    let raw = raw.trim().trim_start_matches("@as").trim();
    let inner = raw
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .unwrap_or("");
    inner
        .split(',')
        .map(unquote_gvariant)
        .filter(|v| !v.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::fake::FakeRunner;

    fn gnome_runner(mode: &str, auth: &str) -> FakeRunner {
        FakeRunner::default()
            .reply("gsettings get org.gnome.system.proxy mode", &format!("'{mode}'\n"))
            .reply("gsettings get org.gnome.system.proxy.http host", "'proxy.corp'\n")
            .reply("gsettings get org.gnome.system.proxy.http port", "3128\n")
            .reply(
                "gsettings get org.gnome.system.proxy.http use-authentication",
                &format!("{auth}\n"),
            )
            .reply(
                "gsettings get org.gnome.system.proxy.http authentication-user",
                "'bob'\n",
            )
            .reply(
                "gsettings get org.gnome.system.proxy.http authentication-password",
                "'pw'\n",
            )
            .reply(
                "gsettings get org.gnome.system.proxy ignore-hosts",
                "['localhost', '127.0.0.0/8', '::1']\n",
            )
    }

    #[test]
    fn manual_mode_builds_url() {
        let runner = gnome_runner("manual", "false");
        let settings = GnomeProxySettings::fetch(&runner, 1000, 1000).unwrap();
        assert_eq!(settings.manual_url().as_deref(), Some("http://proxy.corp:3128"));
        assert_eq!(settings.exceptions, vec!["localhost", "127.0.0.0/8", "::1"]);
    }

    #[test]
    fn authentication_adds_credentials() {
        let runner = gnome_runner("manual", "true");
        let settings = GnomeProxySettings::fetch(&runner, 1000, 1000).unwrap();
        assert_eq!(
            settings.manual_url().as_deref(),
            Some("http://bob:pw@proxy.corp:3128")
        );
    }

    #[test]
    fn other_modes_yield_nothing() {
        let runner = gnome_runner("auto", "false");
        let settings = GnomeProxySettings::fetch(&runner, 1000, 1000).unwrap();
        assert_eq!(settings.manual_url(), None);
    }

    #[test]
    fn probing_another_user_switches_uid() {
        let runner = gnome_runner("none", "false");
        GnomeProxySettings::fetch(&runner, 1000, 0).unwrap();
        let calls = runner.calls();
        assert!(calls.iter().all(|c| c.uid == Some(1000)));
        assert!(calls[0].env.contains(&(
            "DBUS_SESSION_BUS_ADDRESS".to_string(),
            "unix:path=/run/user/1000/bus".to_string()
        )));
    }

    #[test]
    fn gvariant_helpers() {
        assert_eq!(parse_gvariant_int("uint32 8080"), Some(8080));
        assert!(parse_gvariant_string_list("@as []").is_empty());
    }
}
