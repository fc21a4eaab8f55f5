//! Grammars of the system-wide proxy configuration files.
//! Each parser returns `None` when the file carries no usable setting.

use std::collections::BTreeMap;

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value)
}

fn with_scheme(value: &str) -> String {
    if value.contains("://") {
        value.to_string()
    } else {
        format!("http://{value}")
    }
}

/// `/etc/environment`: `HTTP_PROXY=host:port`.
pub fn parse_etc_environment(text: &str) -> Option<String> {
    text.lines()
        .filter(|line| !is_comment(line))
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == "HTTP_PROXY")
        .map(|(_, value)| unquote(value))
        .filter(|value| !value.is_empty())
        .map(with_scheme)
}

/// `/etc/profile.d/proxy_setup`: `export http_proxy=<url>`.
pub fn parse_profile_d(text: &str) -> Option<String> {
    text.lines()
        .filter(|line| !is_comment(line))
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|assignment| assignment.split_once('='))
        .find(|(key, _)| *key == "http_proxy")
        .map(|(_, value)| unquote(value).to_string())
        .filter(|value| !value.is_empty())
}

/// apt configuration: `Acquire::http::proxy "http://host:port/";`.
pub fn parse_apt_conf(text: &str) -> Option<String> {
    const DIRECTIVE: &str = "acquire::http::proxy ";
    text.lines()
        .map(str::trim_start)
        .filter(|line| !is_comment(line))
        .find(|line| {
            line.get(..DIRECTIVE.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(DIRECTIVE))
        })
        .map(|line| {
            let value = line[DIRECTIVE.len()..].trim().trim_end_matches(';');
            unquote(value).to_string()
        })
        .filter(|value| !value.is_empty())
}

/// yum configuration: `proxy=<scheme>://host[:port]` with optional
/// `proxy_username` / `proxy_password`. The port defaults to 8080.
pub fn parse_yum_conf(text: &str) -> Option<String> {
    let mut host = String::new();
    let mut port = String::new();
    let mut username = String::new();
    let mut password = String::new();

    for line in text.lines().filter(|l| !is_comment(l)) {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "proxy" => {
                let location = value.split_once("://").map(|(_, rest)| rest).unwrap_or("");
                let location = location.trim_end_matches('/');
                let (h, p) = location.split_once(':').unwrap_or((location, ""));
                host = h.to_string();
                port = if p.is_empty() {
                    "8080".to_string()
                } else {
                    p.to_string()
                };
            }
            "proxy_username" => username = value.to_string(),
            "proxy_password" => password = value.to_string(),
            _ => {}
        }
    }

    if host.is_empty() {
        return None;
    }
    if !username.is_empty() && !password.is_empty() {
        Some(format!("http://{username}:{password}@{host}:{port}"))
    } else {
        Some(format!("http://{host}:{port}"))
    }
}

/// openSUSE `/etc/sysconfig/proxy`, with credentials optionally taken from
/// root's `.curlrc` (`proxy-user = "user:pass"`).
pub fn parse_sysconfig_proxy(sysconfig: &str, curlrc: &str) -> Option<String> {
    let mut enabled = false;
    let mut proxy = String::new();
    let mut credentials: Option<(String, String)> = None;

    for line in sysconfig.lines().chain(curlrc.lines()) {
        if is_comment(line) {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = unquote(value);
        if key == "PROXY_ENABLED" {
            enabled = value == "yes";
        } else if key == "HTTP_PROXY" {
            proxy = value.to_string();
        } else if key.starts_with("proxy-user") {
            credentials = value
                .split_once(':')
                .map(|(user, pass)| (user.to_string(), pass.to_string()));
        }
    }

    if !enabled || proxy.is_empty() {
        return None;
    }
    match credentials {
        Some((user, pass)) if !user.is_empty() && !pass.is_empty() => {
            let (scheme, rest) = proxy.split_once("://").unwrap_or(("http", proxy.as_str()));
            Some(format!("{scheme}://{user}:{pass}@{rest}"))
        }
        _ => Some(proxy),
    }
}

/// Capabilities of each class in a `login.conf` capability database,
/// keyed by the class's primary name.
pub fn parse_login_classes(text: &str) -> BTreeMap<String, BTreeMap<String, Option<String>>> {
    let mut classes: BTreeMap<String, BTreeMap<String, Option<String>>> = BTreeMap::new();
    let mut current: Option<String> = None;

    for raw in text.lines() {
        if raw.trim().is_empty() || is_comment(raw) {
            continue;
        }
        let mut fields = raw.trim().trim_end_matches('\\').split(':');
        let starts_class = !raw.starts_with(char::is_whitespace) && !raw.starts_with(':');
        if starts_class {
            let names = fields.next().unwrap_or_default();
            let name = names.split('|').next().unwrap_or_default().trim().to_string();
            classes.entry(name.clone()).or_default();
            current = Some(name);
        }

        let Some(class) = current.as_ref() else {
            continue;
        };
        let entry = classes.entry(class.clone()).or_default();
        for field in fields {
            let capability = field.trim().replace("\\c", ":");
            if capability.is_empty() {
                continue;
            }
            match capability.split_once('=') {
                Some((key, value)) => entry.insert(key.to_string(), Some(value.to_string())),
                None => entry.insert(capability, None),
            };
        }
    }
    classes
}

/// `/etc/login.conf`: the `setenv` capability of the `root` class, then of
/// `default`, may export `http_proxy` or `https_proxy`.
pub fn parse_login_conf(text: &str) -> Option<String> {
    let classes = parse_login_classes(text);
    ["root", "default"].iter().find_map(|class| {
        let setenv = classes.get(*class)?.get("setenv")?.as_deref()?;
        setenv
            .split(',')
            .filter_map(|item| item.split_once('='))
            .find(|(key, _)| matches!(key.trim(), "https_proxy" | "http_proxy"))
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}
