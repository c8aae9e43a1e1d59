//! Raw challenge-response classification.
//!
//! Challenge endpoints answer with whatever their era of server software
//! produces: a bare JSON object, the same object wrapped in an HTML `<pre>`,
//! a full HTML page whose inline script posts the object through
//! `postMessage`, or a third-party verification widget. `extract` folds all
//! of that into the closed [`Payload`] union; nothing else in the crate
//! probes response fields.

use crate::core::types::{ChallengeAssets, ChallengeData, ChallengeKind, GateFields, Payload};
use aho_corasick::AhoCorasick;
use base64::Engine;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

/// Markers of a live third-party verification widget. When any of these is
/// present the blob must classify as `Empty`: synthesizing a payload from a
/// stale JSON fragment would mask the widget the server is waiting on.
const WIDGET_MARKERS: &[&str] = &[
    "challenges.cloudflare.com",
    "cf-turnstile",
    "_cf_chl_opt",
    "g-recaptcha",
    "h-captcha",
    "hcaptcha.com",
];

/// Phrases marking a script-execution gate: the server wants client-side
/// fingerprinting to finish before it issues further state.
const FINGERPRINT_MARKERS: &[&str] = &[
    "checking your browser",
    "verifying your connection",
    "browser verification",
    "javascript is required",
    "bot protection",
];

/// Named sub-objects the known server families wrap the payload in.
const WRAPPER_KEYS: &[&str] = &["twister", "captcha", "data"];

static WIDGET_MATCHER: OnceLock<AhoCorasick> = OnceLock::new();
static FINGERPRINT_MATCHER: OnceLock<AhoCorasick> = OnceLock::new();
static MESSAGE_CALL_RE: OnceLock<Regex> = OnceLock::new();

fn widget_matcher() -> &'static AhoCorasick {
    WIDGET_MATCHER
        .get_or_init(|| AhoCorasick::new(WIDGET_MARKERS).expect("valid widget markers"))
}

fn fingerprint_matcher() -> &'static AhoCorasick {
    FINGERPRINT_MATCHER.get_or_init(|| {
        AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(FINGERPRINT_MARKERS)
            .expect("valid fingerprint markers")
    })
}

fn message_call_re() -> &'static Regex {
    MESSAGE_CALL_RE
        .get_or_init(|| Regex::new(r"postMessage\s*\(").expect("valid message-call pattern"))
}

/// Classify one raw server response.
pub fn extract(raw: &str) -> Payload {
    if raw.trim().is_empty() {
        return Payload::Empty;
    }

    if widget_matcher().is_match(raw) {
        debug!("verification widget markers present, not synthesizing a payload");
        return Payload::Empty;
    }

    // Pass 1: message-send call sites with a balanced object argument.
    let mut candidates: Vec<GateFields> = Vec::new();
    for m in message_call_re().find_iter(raw) {
        if let Some(block) = balanced_object_after(raw, m.end()) {
            if let Some(fields) = parse_candidate(block) {
                candidates.push(fields);
            }
        }
    }

    // Pass 2: the input itself may be a direct JSON payload, possibly inside
    // an HTML <pre> wrapper.
    if candidates.is_empty() {
        let direct = strip_pre_wrapper(raw);
        let trimmed = direct.trim();
        if trimmed.starts_with('{') {
            if let Some(fields) = parse_candidate(trimmed) {
                candidates.push(fields);
            }
        }
    }

    match pick_candidate(candidates) {
        Some(fields) => classify(&fields),
        None => Payload::Empty,
    }
}

/// Does this message read as a script-execution gate rather than a real
/// rejection? Used both during classification and when probing a rendered
/// native document for blocking text.
pub(crate) fn is_fingerprint_message(message: &str) -> bool {
    fingerprint_matcher().is_match(message)
}

/// Strip HTML from a server-provided message before it becomes user-visible.
pub fn strip_markup(message: &str) -> String {
    if !message.contains('<') {
        return message.trim().to_string();
    }
    let fragment = Html::parse_fragment(message);
    fragment
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Candidate collection ─────────────────────────────────────────────────────

/// Slice out the first balanced `{...}` block starting at or shortly after
/// `from`, honoring string literals and escapes. Returns `None` when the call
/// site's argument is not an object literal (e.g. a quoted string).
fn balanced_object_after(raw: &str, from: usize) -> Option<&str> {
    let bytes = raw.as_bytes();
    let mut start = None;
    // The object must open within a few characters of the call site; anything
    // further away belongs to different code.
    for (offset, &b) in bytes.iter().enumerate().skip(from).take(16) {
        match b {
            b'{' => {
                start = Some(offset);
                break;
            }
            b' ' | b'\t' | b'\r' | b'\n' => continue,
            _ => return None,
        }
    }
    let start = start?;

    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut escaped = false;
    for (offset, &b) in bytes.iter().enumerate().skip(start) {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == quote {
                in_string = None;
            }
            continue;
        }
        match b {
            b'"' | b'\'' => in_string = Some(b),
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Strict-parse one candidate block. Accepts only real JSON objects exposing
/// at least one recognized signal; unwraps one level of named sub-object.
fn parse_candidate(block: &str) -> Option<GateFields> {
    let value: Value = serde_json::from_str(block).ok()?;
    let obj = value.as_object()?;

    let inner = WRAPPER_KEYS
        .iter()
        .find_map(|k| obj.get(*k).filter(|v| v.is_object()))
        .cloned()
        .unwrap_or(value);

    let fields: GateFields = serde_json::from_value(inner).ok()?;
    fields.is_usable().then_some(fields)
}

/// Among accepted candidates prefer the one carrying assets, then a ticket;
/// within the same specificity the later candidate supersedes earlier ones
/// (a late challenge issue outranks an earlier "still on cooldown" ping).
fn pick_candidate(candidates: Vec<GateFields>) -> Option<GateFields> {
    let mut best: Option<GateFields> = None;
    for candidate in candidates {
        let replace = match best.as_ref() {
            Some(current) => candidate.specificity() >= current.specificity(),
            None => true,
        };
        if replace {
            best = Some(candidate);
        }
    }
    best
}

// ── Classification ───────────────────────────────────────────────────────────

fn classify(fields: &GateFields) -> Payload {
    if let Some(error) = &fields.error {
        let message = strip_markup(error);
        if let Some(cd) = fields.cd.filter(|c| *c > 0) {
            return Payload::RateLimited {
                seconds: clamp_seconds(cd),
                message,
            };
        }
        let fingerprint_gate = fingerprint_matcher().is_match(&message);
        return Payload::SiteError {
            message,
            fingerprint_gate,
        };
    }

    if fields.has_assets() {
        if let Some(data) = challenge_data(fields) {
            return Payload::Challenge(data);
        }
        // Assets that fail to decode are garbage, not a challenge.
        debug!("challenge assets failed base64 validation, treating as empty");
        return Payload::Empty;
    }

    if fields.verified == Some(true) {
        return Payload::VerifiedNone;
    }

    match fields.pcd {
        Some(seconds) if seconds > 0 => Payload::Cooldown {
            seconds: clamp_seconds(seconds),
        },
        // `0` is ambiguous (cooldown just elapsed vs nothing to show) and
        // `-1` is the observed no-payload shape; both mean "needs a
        // follow-up fetch", never an error.
        _ => Payload::Empty,
    }
}

fn challenge_data(fields: &GateFields) -> Option<ChallengeData> {
    let image = match &fields.img {
        Some(b64) => {
            valid_base64(b64)?;
            Some(b64.clone())
        }
        None => None,
    };
    let background = match &fields.bg {
        Some(b64) if valid_base64(b64).is_some() => Some(b64.clone()),
        _ => None,
    };
    let tasks = fields.tasks.clone().unwrap_or_default();

    let kind = if image.is_some() {
        ChallengeKind::Image
    } else if !tasks.is_empty() {
        ChallengeKind::TaskSet
    } else {
        return None;
    };

    Some(ChallengeData {
        kind,
        assets: ChallengeAssets {
            image,
            background,
            tasks,
        },
        id: fields.id.clone(),
        ticket: fields.ticket.clone(),
    })
}

fn valid_base64(b64: &str) -> Option<()> {
    let compact: String = b64.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .ok()
        .map(|_| ())
}

fn clamp_seconds(raw: i64) -> u32 {
    raw.clamp(0, i64::from(u32::MAX)) as u32
}

/// Unwrap `<pre>…</pre>` around a direct JSON error payload; servers that
/// answer API calls with their HTML error page do this.
fn strip_pre_wrapper(raw: &str) -> String {
    if !raw.contains("<pre") {
        return raw.to_string();
    }
    static PRE: OnceLock<Selector> = OnceLock::new();
    let selector = PRE.get_or_init(|| Selector::parse("pre").expect("valid selector"));
    let document = Html::parse_document(raw);
    document
        .select(selector)
        .next()
        .map(|pre| pre.text().collect::<String>())
        .unwrap_or_else(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    // "foo" in base64 — a decodable stand-in for captcha image bytes.
    const B64: &str = "Zm9v";

    #[test]
    fn direct_cooldown_object() {
        assert_eq!(
            extract(r#"{"twister":{"pcd":30}}"#),
            Payload::Cooldown { seconds: 30 }
        );
    }

    #[test]
    fn unwrapped_cooldown_object() {
        assert_eq!(extract(r#"{"pcd":45}"#), Payload::Cooldown { seconds: 45 });
    }

    #[test]
    fn challenge_with_ticket() {
        let payload = extract(&format!(r#"{{"twister":{{"img":"{B64}","ticket":"abc"}}}}"#));
        match payload {
            Payload::Challenge(data) => {
                assert_eq!(data.kind, ChallengeKind::Image);
                assert_eq!(data.assets.image.as_deref(), Some(B64));
                assert_eq!(data.ticket.as_deref(), Some("abc"));
            }
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn error_with_countdown_is_rate_limited() {
        assert_eq!(
            extract(r#"{"error":"You have to wait","cd":26}"#),
            Payload::RateLimited {
                seconds: 26,
                message: "You have to wait".into()
            }
        );
    }

    #[test]
    fn bare_error_is_site_error() {
        match extract(r#"{"error":"You are <b>banned</b>."}"#) {
            Payload::SiteError {
                message,
                fingerprint_gate,
            } => {
                assert_eq!(message, "You are banned.");
                assert!(!fingerprint_gate);
            }
            other => panic!("expected site error, got {other:?}"),
        }
    }

    #[test]
    fn fingerprint_phrases_set_the_gate_flag() {
        match extract(r#"{"error":"Checking your browser before accessing the site."}"#) {
            Payload::SiteError {
                fingerprint_gate, ..
            } => assert!(fingerprint_gate),
            other => panic!("expected site error, got {other:?}"),
        }
    }

    /// Two candidates in one blob: one carries only a cooldown field, the
    /// other cooldown + assets. The one with assets must win regardless of
    /// order.
    #[test]
    fn candidate_with_assets_supersedes_bare_cooldown() {
        let blob = format!(
            r#"<script>
               parent.postMessage({{"twister":{{"pcd":15}}}}, '*');
               parent.postMessage({{"twister":{{"pcd":0,"img":"{B64}","ticket":"t9"}}}}, '*');
               </script>"#
        );
        match extract(&blob) {
            Payload::Challenge(data) => assert_eq!(data.ticket.as_deref(), Some("t9")),
            other => panic!("expected challenge, got {other:?}"),
        }

        // Reversed order: assets still win.
        let reversed = format!(
            r#"<script>
               parent.postMessage({{"twister":{{"img":"{B64}"}}}}, '*');
               parent.postMessage({{"twister":{{"pcd":15}}}}, '*');
               </script>"#
        );
        assert!(matches!(extract(&reversed), Payload::Challenge(_)));
    }

    #[test]
    fn later_candidate_wins_at_equal_specificity() {
        let blob = r#"postMessage({"pcd":60}); postMessage({"pcd":5});"#;
        assert_eq!(extract(blob), Payload::Cooldown { seconds: 5 });
    }

    #[test]
    fn widget_markers_short_circuit_to_empty() {
        let blob = r#"<iframe src="https://challenges.cloudflare.com/turnstile"></iframe>
                      <script>postMessage({"pcd":30});</script>"#;
        assert_eq!(extract(blob), Payload::Empty);
    }

    #[test]
    fn verified_flag_reports_none_required() {
        assert_eq!(extract(r#"{"twister":{"pcd":0,"verified":true}}"#), Payload::VerifiedNone);
    }

    #[test]
    fn ambiguous_zero_and_negative_cooldowns_are_empty() {
        assert_eq!(extract(r#"{"twister":{"pcd":0}}"#), Payload::Empty);
        assert_eq!(extract(r#"{"twister":{"pcd":-1}}"#), Payload::Empty);
    }

    #[test]
    fn pre_wrapped_direct_error() {
        let blob = "<html><body><pre>{\"error\":\"Board locked\"}</pre></body></html>";
        match extract(blob) {
            Payload::SiteError { message, .. } => assert_eq!(message, "Board locked"),
            other => panic!("expected site error, got {other:?}"),
        }
    }

    #[test]
    fn loose_js_object_literal_is_rejected() {
        // Single-quoted keys are not strict JSON; the candidate must not parse.
        assert_eq!(extract(r#"postMessage({'pcd': 30});"#), Payload::Empty);
    }

    #[test]
    fn unrelated_html_is_empty() {
        assert_eq!(extract("<html><body><h1>Catalog</h1></body></html>"), Payload::Empty);
    }

    #[test]
    fn garbage_assets_do_not_become_a_challenge() {
        assert_eq!(extract(r#"{"img":"not@base64!!"}"#), Payload::Empty);
    }

    #[test]
    fn task_set_challenge() {
        let blob = r#"{"twister":{"tasks":["Select every image with a cat"],"ticket":"tk"}}"#;
        match extract(blob) {
            Payload::Challenge(data) => {
                assert_eq!(data.kind, ChallengeKind::TaskSet);
                assert_eq!(data.assets.tasks.len(), 1);
            }
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn strings_with_braces_do_not_break_balancing() {
        let blob = r#"postMessage({"error":"wait {5} minutes","cd":300});"#;
        assert_eq!(
            extract(blob),
            Payload::RateLimited {
                seconds: 300,
                message: "wait {5} minutes".into()
            }
        );
    }
}
