//! Native-load strategy helpers: document probing and the in-sandbox fetch
//! script.

use crate::core::error::SandboxError;
use crate::sandbox::Sandbox;
use aho_corasick::AhoCorasick;
use serde::Deserialize;
use std::sync::OnceLock;
use url::Url;

/// Form fields whose value, once filled, IS the response token — either by
/// the page's own challenge logic or by the user solving in place.
pub const RESPONSE_FIELD_NAMES: &[&str] = &[
    "captcha-response",
    "t-response",
    "g-recaptcha-response",
    "h-captcha-response",
];

/// Prefix the in-sandbox fetch script uses to smuggle an error through its
/// string-typed return value.
pub(crate) const FETCH_ERROR_PREFIX: &str = "__postgate_fetch_error:";

/// Markers of a recognized long-running challenge page: these legitimately
/// take many poll cycles, so they get the higher retry ceiling.
const KNOWN_CHALLENGE_MARKERS: &[&str] = &[
    "challenges.cloudflare.com",
    "cf-turnstile",
    "_cf_chl_opt",
    "g-recaptcha",
    "h-captcha",
    "twister",
];

static KNOWN_PAGE_MATCHER: OnceLock<AhoCorasick> = OnceLock::new();

pub(crate) fn is_known_challenge_page(body: &str) -> bool {
    KNOWN_PAGE_MATCHER
        .get_or_init(|| AhoCorasick::new(KNOWN_CHALLENGE_MARKERS).expect("valid page markers"))
        .is_match(body)
}

/// Same-origin fetch executed by the hosted document itself, so cookies and
/// session storage match exactly what the document sees.
pub(crate) fn same_origin_fetch_script(url: &Url) -> String {
    let url_js = serde_json::to_string(url.as_str()).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"(async () => {{
  try {{
    const r = await fetch({url}, {{ credentials: 'include' }});
    return await r.text();
  }} catch (e) {{
    return '{prefix}' + (e && e.message ? e.message : String(e));
  }}
}})()"#,
        url = url_js,
        prefix = FETCH_ERROR_PREFIX,
    )
}

/// Snapshot of the rendered native document, taken once per poll cycle.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct PageProbe {
    /// Value of the first recognized response field, when filled.
    #[serde(default)]
    pub response: Option<String>,
    /// Text of a visible blocking message, when present.
    #[serde(default)]
    pub blocking: Option<String>,
    /// Full serialized document for payload extraction.
    #[serde(default)]
    pub body: String,
}

fn probe_script() -> String {
    let field_selector = RESPONSE_FIELD_NAMES
        .iter()
        .map(|name| format!("input[name=\"{0}\"], textarea[name=\"{0}\"]", name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"(() => {{
  const field = document.querySelector('{fields}');
  const blocking = document.querySelector('.ban-message, .error-message, #error, [data-blocking-message]');
  return JSON.stringify({{
    response: field && field.value ? field.value : null,
    blocking: blocking && blocking.textContent.trim() ? blocking.textContent : null,
    body: document.documentElement ? document.documentElement.outerHTML : ''
  }});
}})()"#,
        fields = field_selector,
    )
}

/// Evaluate the probe in the current document.
pub(crate) async fn probe_document(sandbox: &dyn Sandbox) -> Result<PageProbe, SandboxError> {
    let value = sandbox.evaluate_script(&probe_script()).await?;
    let raw = value
        .as_str()
        .ok_or_else(|| SandboxError::Evaluation("probe returned a non-string".into()))?;
    serde_json::from_str(raw).map_err(|e| SandboxError::Evaluation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_script_embeds_url_as_json_string() {
        let url = Url::parse("https://testchan.org/twister.php?board=b").unwrap();
        let script = same_origin_fetch_script(&url);
        assert!(script.contains(r#"fetch("https://testchan.org/twister.php?board=b""#));
        assert!(script.contains("credentials: 'include'"));
    }

    #[test]
    fn known_page_detection() {
        assert!(is_known_challenge_page(
            "<html><script src=\"https://challenges.cloudflare.com/x.js\"></script></html>"
        ));
        assert!(!is_known_challenge_page("<html><h1>404</h1></html>"));
    }

    #[test]
    fn probe_script_covers_every_response_field() {
        let script = probe_script();
        for name in RESPONSE_FIELD_NAMES {
            assert!(script.contains(name), "missing field {name}");
        }
    }
}
