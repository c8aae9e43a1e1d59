use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use url::Url;

/// Capabilities and endpoints of one target site, as declared by the caller.
///
/// `roots` is ordered: the first entry is the preferred mirror, the rest are
/// failover candidates consumed by [`crate::net::MirrorRotator`].
#[derive(Debug, Clone)]
pub struct SiteDescriptor {
    /// Stable identity string, e.g. `"wizchan"`. Used for log correlation and
    /// as the namespace for ticket / pacing state.
    pub identity: String,
    /// Root URLs, preferred mirror first.
    pub roots: Vec<Url>,
    /// `true` when the site enforces one site-wide posting cooldown instead
    /// of per-thread cooldowns.
    pub global_rate_limit: bool,
    /// Path of the challenge endpoint relative to a root, e.g. `"/twister.php"`.
    pub challenge_path: String,
    /// Verification window: how long a ticket / verified state stays usable.
    pub session_ttl_secs: u64,
}

impl SiteDescriptor {
    /// Build the challenge endpoint URL against a concrete root.
    ///
    /// Board codes come from user-controlled catalogs on some engines, so the
    /// query value is percent-encoded rather than spliced raw.
    pub fn challenge_url(
        &self,
        root: &Url,
        board: &str,
        thread_id: u64,
        ticket: Option<&str>,
    ) -> Result<Url, url::ParseError> {
        let board_enc = utf8_percent_encode(board, NON_ALPHANUMERIC);
        let mut query = format!("board={}&thread={}", board_enc, thread_id);
        if let Some(t) = ticket.filter(|t| !t.is_empty()) {
            let t_enc = utf8_percent_encode(t, NON_ALPHANUMERIC);
            query.push_str(&format!("&ticket={}", t_enc));
        }
        let mut url = root.join(&self.challenge_path)?;
        url.set_query(Some(&query));
        Ok(url)
    }
}

/// What kind of puzzle the server handed us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// Classic distorted-text or slider image.
    Image,
    /// A set of tap-to-answer task prompts.
    TaskSet,
}

/// Raw solvable material extracted from a challenge response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChallengeAssets {
    /// Base64-encoded foreground image, when present.
    pub image: Option<String>,
    /// Base64-encoded background layer (slider-style challenges).
    pub background: Option<String>,
    /// Task prompts for task-set challenges.
    pub tasks: Vec<String>,
}

impl ChallengeAssets {
    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.background.is_none() && self.tasks.is_empty()
    }
}

/// An actual solvable puzzle plus the continuation state that came with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeData {
    pub kind: ChallengeKind,
    pub assets: ChallengeAssets,
    /// Server-issued challenge id, when the response carries one.
    pub id: Option<String>,
    /// Continuation token to replay on subsequent challenge requests.
    pub ticket: Option<String>,
}

/// The closed classification of everything a challenge endpoint can say back.
///
/// Built exclusively by [`crate::verification::extract::extract`]; call sites
/// match on this instead of probing fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Must wait before another attempt.
    Cooldown { seconds: u32 },
    /// Cooldown delivered through an explicit error+countdown shape.
    RateLimited { seconds: u32, message: String },
    /// An actual solvable puzzle.
    Challenge(ChallengeData),
    /// Server states no challenge is currently required.
    VerifiedNone,
    /// Explicit rejection that is not a timed cooldown.
    SiteError {
        message: String,
        fingerprint_gate: bool,
    },
    /// No usable data extracted; retry or escalate.
    Empty,
}

impl Payload {
    /// Short tag for log lines; never contains server-controlled text.
    pub fn tag(&self) -> &'static str {
        match self {
            Payload::Cooldown { .. } => "cooldown",
            Payload::RateLimited { .. } => "rate_limited",
            Payload::Challenge(_) => "challenge",
            Payload::VerifiedNone => "verified_none",
            Payload::SiteError {
                fingerprint_gate: true,
                ..
            } => "fingerprint_gate",
            Payload::SiteError { .. } => "site_error",
            Payload::Empty => "empty",
        }
    }
}

/// The pair the caller ultimately wants: proof the server will accept.
///
/// Both fields are empty for the "verification not required" completion path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Solution {
    pub challenge_id: String,
    pub response_token: String,
}

impl Solution {
    pub fn new(challenge_id: impl Into<String>, response_token: impl Into<String>) -> Self {
        Self {
            challenge_id: challenge_id.into(),
            response_token: response_token.into(),
        }
    }

    /// Completion for servers that answered "no challenge required".
    pub fn not_required() -> Self {
        Self::default()
    }

    pub fn is_not_required(&self) -> bool {
        self.challenge_id.is_empty() && self.response_token.is_empty()
    }
}

/// Flat view of one gate message candidate, tolerant of every known family
/// shape. Unknown fields are ignored; absent fields default to `None`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GateFields {
    /// Posting cooldown in seconds. `0` and `-1` are ambiguous, see extractor.
    pub pcd: Option<i64>,
    /// Base64 challenge image.
    pub img: Option<String>,
    /// Base64 background layer.
    pub bg: Option<String>,
    /// Continuation token.
    pub ticket: Option<String>,
    /// Task prompts (task-set engines).
    pub tasks: Option<Vec<String>>,
    /// Explicit "already verified" flag.
    pub verified: Option<bool>,
    /// Error text (ban, ToS block, or rate-limit message).
    pub error: Option<String>,
    /// Countdown seconds accompanying `error` in the rate-limit shape.
    pub cd: Option<i64>,
    /// Server-issued challenge id.
    pub id: Option<String>,
}

impl GateFields {
    /// A candidate is usable when it exposes at least one recognized signal:
    /// a cooldown field, a ticket, challenge assets, or an error.
    pub fn is_usable(&self) -> bool {
        self.pcd.is_some()
            || self.ticket.is_some()
            || self.has_assets()
            || self.error.is_some()
            || self.verified.is_some()
    }

    pub fn has_assets(&self) -> bool {
        self.img.is_some() || self.tasks.as_ref().is_some_and(|t| !t.is_empty())
    }

    /// Candidates carrying assets or a ticket supersede bare cooldown pings.
    pub fn specificity(&self) -> u8 {
        if self.has_assets() {
            2
        } else if self.ticket.is_some() {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> SiteDescriptor {
        SiteDescriptor {
            identity: "testchan".into(),
            roots: vec![Url::parse("https://testchan.org").unwrap()],
            global_rate_limit: false,
            challenge_path: "/twister.php".into(),
            session_ttl_secs: 120,
        }
    }

    #[test]
    fn challenge_url_encodes_board_and_ticket() {
        let s = site();
        let root = &s.roots[0];
        let url = s.challenge_url(root, "v/rc", 123, Some("a+b")).unwrap();
        let q = url.query().unwrap();
        assert!(q.contains("board=v%2Frc"), "query was {q}");
        assert!(q.contains("thread=123"));
        assert!(q.contains("ticket=a%2Bb"));
    }

    #[test]
    fn challenge_url_omits_empty_ticket() {
        let s = site();
        let url = s.challenge_url(&s.roots[0], "b", 0, Some("")).unwrap();
        assert!(!url.query().unwrap().contains("ticket"));
    }

    #[test]
    fn specificity_prefers_assets_over_ticket() {
        let bare = GateFields {
            pcd: Some(30),
            ..Default::default()
        };
        let ticketed = GateFields {
            ticket: Some("t".into()),
            ..Default::default()
        };
        let full = GateFields {
            img: Some("Zm9v".into()),
            ticket: Some("t".into()),
            ..Default::default()
        };
        assert!(full.specificity() > ticketed.specificity());
        assert!(ticketed.specificity() > bare.specificity());
    }
}
