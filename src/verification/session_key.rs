use crate::core::types::SiteDescriptor;

/// Key under which cooldown state is tracked for sites that enforce one
/// site-wide posting limit.
pub const GLOBAL_SESSION_KEY: &str = "global";

/// Derive the identity under which cooldown/ticket state is tracked.
///
/// Sites declaring `global_rate_limit` collapse every board and thread onto
/// one key; everything else is tracked per board+thread, with `thread_id == 0`
/// standing for the new-thread context. Pure function, no side effects.
pub fn session_key(site: &SiteDescriptor, board: &str, thread_id: u64) -> String {
    if site.global_rate_limit {
        GLOBAL_SESSION_KEY.to_string()
    } else {
        format!("{}_{}", board, thread_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn site(global: bool) -> SiteDescriptor {
        SiteDescriptor {
            identity: "testchan".into(),
            roots: vec![Url::parse("https://testchan.org").unwrap()],
            global_rate_limit: global,
            challenge_path: "/twister.php".into(),
            session_ttl_secs: 120,
        }
    }

    #[test]
    fn per_thread_key_concatenates_board_and_thread() {
        assert_eq!(session_key(&site(false), "b", 0), "b_0");
        assert_eq!(session_key(&site(false), "v", 12345), "v_12345");
    }

    #[test]
    fn global_site_ignores_board_and_thread() {
        assert_eq!(session_key(&site(true), "b", 0), GLOBAL_SESSION_KEY);
        assert_eq!(session_key(&site(true), "v", 12345), GLOBAL_SESSION_KEY);
    }
}
