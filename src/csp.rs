//! Content-Security-Policy helpers for proxied HTML.
//!
//! The proxied page is framed by the host surface and receives injected
//! scripts, so its policy has to drop `frame-ancestors` and allow inline/eval
//! scripts. Everything else in the policy is preserved byte for byte.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Tokens appended to the script directive.
const RELAXED_SCRIPT_TOKENS: [&str; 2] = ["'unsafe-inline'", "'unsafe-eval'"];

/// The directive name must be followed by whitespace, so `script-src-elem`
/// and `script-src-attr` never supply the nonce.
static NONCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:script-src|default-src)\s[^;]*'nonce-([^']+)'").expect("valid nonce regex")
});

static FRAME_ANCESTORS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bframe-ancestors\b[^;]*;?\s*").expect("valid frame-ancestors regex"));

static SCRIPT_SRC_RE: Lazy<Regex> = Lazy::new(|| directive_regex("script-src"));
static DEFAULT_SRC_RE: Lazy<Regex> = Lazy::new(|| directive_regex("default-src"));

/// Matches a whole directive: name, optional source list, terminator.
/// Requiring `;` or end of input after the value keeps `script-src-elem`
/// from matching `script-src`.
fn directive_regex(name: &str) -> Regex {
    Regex::new(&format!(r"\b({name})(\s[^;]*)?(;|$)")).expect("valid directive regex")
}

/// Extract the inline-script nonce from a `script-src` or `default-src` directive.
pub fn extract_nonce(csp: Option<&str>) -> Option<String> {
    let caps = NONCE_RE.captures(csp?)?;
    caps.get(1).map(|m| m.as_str().to_string())
}

/// Relax a policy so the proxied page can be framed and run the injected scripts.
///
/// `frame-ancestors` is removed outright. `'unsafe-inline' 'unsafe-eval'` is
/// added to `script-src` when present, else to `default-src`. Tokens already
/// present are not added again, so relaxing twice is a no-op.
pub fn relax_csp(csp: &str) -> String {
    let stripped = FRAME_ANCESTORS_RE.replace_all(csp, "");
    let directive = if SCRIPT_SRC_RE.is_match(&stripped) {
        &*SCRIPT_SRC_RE
    } else if DEFAULT_SRC_RE.is_match(&stripped) {
        &*DEFAULT_SRC_RE
    } else {
        return stripped.into_owned();
    };
    directive
        .replace(&stripped, |caps: &Captures<'_>| {
            let value = caps.get(2).map_or("", |m| m.as_str());
            let trimmed = value.trim_end();
            let trailing = &value[trimmed.len()..];
            let present: Vec<&str> = trimmed.split_whitespace().collect();
            let mut out = format!("{}{}", &caps[1], trimmed);
            for token in RELAXED_SCRIPT_TOKENS {
                if !present.contains(&token) {
                    out.push(' ');
                    out.push_str(token);
                }
            }
            out.push_str(trailing);
            out.push_str(&caps[3]);
            out
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_ignores_elem_and_attr_directives() {
        let csp = "script-src-elem 'nonce-elem'; script-src-attr 'nonce-attr'";
        assert_eq!(extract_nonce(Some(csp)), None);

        let csp = "script-src-elem 'nonce-elem'; script-src 'self' 'nonce-main'";
        assert_eq!(extract_nonce(Some(csp)).as_deref(), Some("main"));
    }

    #[test]
    fn nonce_from_script_src() {
        let csp = "default-src 'self'; script-src 'self' 'nonce-abc123' https:";
        assert_eq!(extract_nonce(Some(csp)).as_deref(), Some("abc123"));
    }

    #[test]
    fn nonce_from_default_src() {
        let csp = "default-src 'self' 'nonce-r4nd0m=='";
        assert_eq!(extract_nonce(Some(csp)).as_deref(), Some("r4nd0m=="));
    }

    #[test]
    fn nonce_outside_script_directives_is_ignored() {
        assert_eq!(extract_nonce(Some("style-src 'nonce-css'")), None);
        assert_eq!(extract_nonce(Some("default-src 'self'")), None);
        assert_eq!(extract_nonce(None), None);
    }

    #[test]
    fn default_src_with_frame_ancestors() {
        assert_eq!(
            relax_csp("default-src 'self'; frame-ancestors 'none'"),
            "default-src 'self' 'unsafe-inline' 'unsafe-eval'; "
        );
    }

    #[test]
    fn frame_ancestors_first() {
        assert_eq!(
            relax_csp("frame-ancestors 'self' https://a.example; default-src 'self'"),
            "default-src 'self' 'unsafe-inline' 'unsafe-eval'"
        );
    }

    #[test]
    fn script_src_preferred_over_default_src() {
        let out = relax_csp("default-src 'none'; script-src 'self'; img-src *");
        assert_eq!(
            out,
            "default-src 'none'; script-src 'self' 'unsafe-inline' 'unsafe-eval'; img-src *"
        );
    }

    #[test]
    fn script_src_elem_is_not_script_src() {
        let out = relax_csp("script-src-elem 'self'; default-src 'self'");
        assert_eq!(
            out,
            "script-src-elem 'self'; default-src 'self' 'unsafe-inline' 'unsafe-eval'"
        );
    }

    #[test]
    fn relaxing_twice_does_not_duplicate_tokens() {
        let once = relax_csp("script-src 'self' 'unsafe-eval'; frame-ancestors 'none';");
        assert_eq!(once, "script-src 'self' 'unsafe-eval' 'unsafe-inline'; ");
        assert_eq!(relax_csp(&once), once);
    }

    #[test]
    fn policy_without_script_directives_only_loses_frame_ancestors() {
        assert_eq!(
            relax_csp("img-src *; frame-ancestors 'none'"),
            "img-src *; "
        );
    }
}
