//! `scutil --proxy` output, as printed on macOS:
//!
//! ```text
//! <dictionary> {
//!   ExceptionsList : <array> {
//!     0 : *.local
//!   }
//!   HTTPEnable : 1
//!   HTTPPort : 8080
//!   HTTPProxy : proxy.example.com
//! }
//! ```

use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScutilProxy {
    pub values: BTreeMap<String, String>,
    pub exceptions: Vec<String>,
}

impl ScutilProxy {
    pub fn parse(output: &str) -> Self {
        let mut parsed = Self::default();
        let mut in_exceptions = false;

        for line in output.lines().map(str::trim) {
            if in_exceptions {
                if line.starts_with('}') {
                    in_exceptions = false;
                } else if let Some((_, value)) = line.split_once(" : ") {
                    parsed.exceptions.push(value.trim().to_string());
                }
                continue;
            }
            if line.starts_with("ExceptionsList ") {
                in_exceptions = true;
                continue;
            }
            if let Some((key, value)) = line.split_once(" : ") {
                let key = key.split_whitespace().next().unwrap_or(key);
                parsed.values.insert(key.to_string(), value.trim().to_string());
            }
        }
        parsed
    }

    pub fn http_url(&self) -> Option<String> {
        if self.values.get("HTTPEnable").map(String::as_str) != Some("1") {
            return None;
        }
        let host = self.values.get("HTTPProxy")?;
        let port = self.values.get("HTTPPort")?;
        Some(format!("http://{host}:{port}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENABLED: &str = "\
<dictionary> {
  ExceptionsList : <array> {
    0 : *.local
    1 : 169.254/16
  }
  FTPPassive : 1
  HTTPEnable : 1
  HTTPPort : 8080
  HTTPProxy : proxy.example.com
}
";

    #[test]
    fn enabled_http_proxy() {
        let proxy = ScutilProxy::parse(ENABLED);
        assert_eq!(proxy.http_url().as_deref(), Some("http://proxy.example.com:8080"));
        assert_eq!(proxy.exceptions, vec!["*.local", "169.254/16"]);
        assert_eq!(proxy.values["FTPPassive"], "1");
    }

    #[test]
    fn disabled_http_proxy() {
        let proxy = ScutilProxy::parse("<dictionary> {\n  HTTPEnable : 0\n  HTTPProxy : p\n}\n");
        assert_eq!(proxy.http_url(), None);
        assert!(proxy.exceptions.is_empty());
    }
}
