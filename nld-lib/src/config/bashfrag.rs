//! Quote-stripping parser for the bash-fragment configuration files nodes
//! already ship (`/etc/ganeti/nbma/*.conf`-style key=value snippets), grounded
//! on `config.py::BashFragmentConfigParser` and its `_QUOTE_RE`.

use regex::Regex;
use std::sync::OnceLock;

fn quote_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^(['"])(.*)\1$"#).expect("static regex is valid"))
}

/// Parses the `KEY=value` lines of a single bash fragment, stripping a single
/// layer of matching quotes from the value as a shell would. Blank lines and
/// `#`-comments are skipped; lines without an `=` are ignored, matching the
/// original's tolerant treatment of a file that is first and foremost a bash
/// snippet, not a strict config format.
pub fn parse(content: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        out.push((key.to_string(), unquote(value.trim())));
    }
    out
}

fn unquote(value: &str) -> String {
    match quote_re().captures(value) {
        Some(caps) => caps[2].to_string(),
        None => value.to_string(),
    }
}
