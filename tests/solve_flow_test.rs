//! End-to-end session flows against a scripted sandbox.
//!
//! The fake site root points at a closed local port, so background fetches
//! fail at the transport level; scenarios are driven by injecting sandbox
//! events, exactly as a real challenge page would produce them.

use postgate::sandbox::fake::FakeSandbox;
use postgate::types::ChallengeKind;
use postgate::{
    EngineConfig, SandboxEvent, SiteDescriptor, SolveError, UiEvent, VerificationEngine,
};
use url::Url;

// "foo" as base64 — stands in for captcha image bytes.
const B64: &str = "Zm9v";

fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("postgate=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn test_site() -> SiteDescriptor {
    SiteDescriptor {
        identity: "testchan".into(),
        roots: vec![Url::parse("http://127.0.0.1:9/").unwrap()],
        global_rate_limit: false,
        challenge_path: "/twister.php".into(),
        session_ttl_secs: 120,
    }
}

fn test_engine() -> VerificationEngine {
    let mut cfg = EngineConfig::default();
    cfg.transport_retry_max_elapsed_secs = 1;
    cfg.min_request_interval_ms = 0;
    cfg.request_jitter_ms = 0;
    VerificationEngine::new(cfg).expect("engine")
}

fn script_message(json: &str) -> SandboxEvent {
    SandboxEvent::ScriptMessage { json: json.into() }
}

/// Step virtual time until `cond` holds, bounded so a broken flow fails
/// instead of hanging. Sleeping (rather than yielding) lets the paused
/// clock auto-advance through the session's own timers.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

/// Let queued messages drain through the session task.
async fn settle() {
    for _ in 0..20 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn cooldown_ping_arms_key_and_counts_down() {
    init_logger();
    let engine = test_engine();
    let site = test_site();
    let sandbox = FakeSandbox::new();

    let mut handle = engine.begin(sandbox.clone(), &site, "b", 0);
    sandbox.emit(script_message(r#"{"twister":{"pcd":30}}"#));

    assert_eq!(
        handle.next_ui_event().await,
        Some(UiEvent::CooldownStarted { seconds: 30 })
    );
    assert!(engine.is_on_cooldown(&site, "b", 0));
    let remaining = engine.remaining_cooldown_seconds(&site, "b", 0);
    assert!((29..=30).contains(&remaining), "remaining was {remaining}");

    // Another reply form for the same thread sees the same record.
    assert!(engine.is_on_cooldown(&site, "b", 0));

    // Virtual clock runs the cooldown out; the affordance re-enables and the
    // record is gone.
    assert_eq!(handle.next_ui_event().await, Some(UiEvent::CooldownFinished));
    assert!(!engine.is_on_cooldown(&site, "b", 0));

    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn challenge_issue_renders_and_caches_ticket() {
    init_logger();
    let engine = test_engine();
    let site = test_site();
    let sandbox = FakeSandbox::new();

    let mut handle = engine.begin(sandbox.clone(), &site, "b", 0);
    sandbox.emit(script_message(&format!(
        r#"{{"twister":{{"img":"{B64}","ticket":"abc"}}}}"#
    )));

    assert_eq!(handle.next_ui_event().await, Some(UiEvent::HideSoftInput));
    assert_eq!(
        handle.next_ui_event().await,
        Some(UiEvent::ChallengeShown {
            kind: ChallengeKind::Image
        })
    );

    // No cooldown armed, ticket cached, synthetic document carries the real
    // server's base origin.
    assert!(!engine.is_on_cooldown(&site, "b", 0));
    assert_eq!(engine.cached_ticket(&site).as_deref(), Some("abc"));
    let docs = sandbox.synthetic_documents();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].1, "http://127.0.0.1:9/");

    // Asset bytes are served through interception, not inlined.
    let asset = sandbox
        .drive_interceptor("http://127.0.0.1:9/postgate/challenge.png")
        .expect("challenge image should be intercepted");
    assert_eq!(asset.body, b"foo");

    // The user solves; the session completes with the posted pair.
    sandbox.emit(script_message(r#"{"id":"c7","response":"tok"}"#));
    let solution = handle.solution().await.expect("solution");
    assert_eq!(solution.challenge_id, "c7");
    assert_eq!(solution.response_token, "tok");
}

#[tokio::test(start_paused = true)]
async fn rate_limit_error_shape_takes_the_cooldown_path() {
    let engine = test_engine();
    let site = test_site();
    let sandbox = FakeSandbox::new();

    let mut handle = engine.begin(sandbox.clone(), &site, "b", 0);
    sandbox.emit(script_message(r#"{"error":"You have to wait","cd":26}"#));

    // Same UI path as a plain cooldown, message shown as a passive overlay,
    // never as a terminal error.
    assert_eq!(
        handle.next_ui_event().await,
        Some(UiEvent::StatusOverlay {
            text: "You have to wait".into(),
            tappable: false
        })
    );
    assert_eq!(
        handle.next_ui_event().await,
        Some(UiEvent::CooldownStarted { seconds: 26 })
    );
    assert!(engine.is_on_cooldown(&site, "b", 0));

    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn fingerprint_gate_escalates_without_terminal_error() {
    let engine = test_engine();
    let site = test_site();
    let sandbox = FakeSandbox::new();

    let mut handle = engine.begin(sandbox.clone(), &site, "b", 0);
    sandbox.emit(script_message(
        r#"{"error":"Checking your browser before posting"}"#,
    ));

    // A fingerprint gate over a data channel forces a native load: only real
    // script execution can satisfy it.
    wait_until(|| !sandbox.loads().is_empty()).await;
    let loads = sandbox.loads();
    assert!(loads[0].contains("/twister.php"), "loaded {}", loads[0]);
    assert!(loads[0].contains("board=b"));

    while let Some(event) = handle.try_ui_event() {
        assert!(
            !matches!(event, UiEvent::TerminalError { .. }),
            "fingerprint gate must never be terminal"
        );
    }
    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn fingerprint_gate_keeps_a_live_challenge_document() {
    let engine = test_engine();
    let site = test_site();
    let sandbox = FakeSandbox::new();

    let mut handle = engine.begin(sandbox.clone(), &site, "b", 0);
    sandbox.emit(script_message(&format!(r#"{{"img":"{B64}","ticket":"t1"}}"#)));
    wait_until(|| sandbox.synthetic_documents().len() == 1).await;

    // Gate arrives while the user is solving: the document stays, no
    // navigation, no terminal error.
    sandbox.emit(script_message(r#"{"error":"Checking your browser"}"#));
    sandbox.emit(script_message(r#"{"twister":{"pcd":-1}}"#)); // ambiguous ping: discarded
    settle().await;

    assert_eq!(sandbox.synthetic_documents().len(), 1);
    assert!(sandbox.loads().is_empty(), "must not navigate away");
    assert!(!engine.is_on_cooldown(&site, "b", 0));

    // Solving still works.
    sandbox.emit(script_message(r#"{"response":"tok2"}"#));
    let solution = handle.solution().await.expect("solution");
    assert_eq!(solution.response_token, "tok2");
    // Challenge carried no id; the ticket stands in.
    assert_eq!(solution.challenge_id, "t1");
}

#[tokio::test(start_paused = true)]
async fn verified_none_completes_with_empty_pair() {
    let engine = test_engine();
    let site = test_site();
    let sandbox = FakeSandbox::new();

    let mut handle = engine.begin(sandbox.clone(), &site, "b", 0);
    sandbox.emit(script_message(r#"{"twister":{"pcd":0,"verified":true}}"#));

    let solution = handle.solution().await.expect("solution");
    assert!(solution.is_not_required());
}

#[tokio::test(start_paused = true)]
async fn duplicate_solve_messages_deliver_once() {
    let engine = test_engine();
    let site = test_site();
    let sandbox = FakeSandbox::new();

    let mut handle = engine.begin(sandbox.clone(), &site, "b", 0);
    sandbox.emit(script_message(&format!(r#"{{"img":"{B64}"}}"#)));
    sandbox.emit(script_message(r#"{"id":"c1","response":"first"}"#));
    sandbox.emit(script_message(r#"{"id":"c1","response":"second"}"#));

    let solution = handle.solution().await.expect("solution");
    assert_eq!(solution.response_token, "first");
}

#[tokio::test(start_paused = true)]
async fn terminal_rejection_surfaces_server_text() {
    let engine = test_engine();
    let site = test_site();
    let sandbox = FakeSandbox::new();

    let mut handle = engine.begin(sandbox.clone(), &site, "b", 0);
    sandbox.emit(script_message(
        r#"{"error":"You are <b>banned</b> from this board."}"#,
    ));

    let mut saw_terminal = false;
    while let Some(event) = handle.next_ui_event().await {
        if let UiEvent::TerminalError { message } = event {
            assert_eq!(message, "You are banned from this board.");
            saw_terminal = true;
            break;
        }
    }
    assert!(saw_terminal);

    match handle.solution().await {
        Err(SolveError::SiteRejection { message }) => {
            assert_eq!(message, "You are banned from this board.")
        }
        other => panic!("expected site rejection, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_session_reports_closed_and_stays_quiet() {
    let engine = test_engine();
    let site = test_site();
    let sandbox = FakeSandbox::new();

    let mut handle = engine.begin(sandbox.clone(), &site, "b", 0);
    handle.cancel();

    match handle.solution().await {
        Err(SolveError::SessionClosed) => {}
        other => panic!("expected session-closed, got {other:?}"),
    }

    // Late events into a destroyed session go nowhere.
    sandbox.emit(script_message(r#"{"twister":{"pcd":30}}"#));
    settle().await;
    assert!(!engine.is_on_cooldown(&site, "b", 0));
}

#[tokio::test(start_paused = true)]
async fn transport_misses_escalate_to_native_then_exhaust() {
    let engine = test_engine();
    let site = test_site();
    let sandbox = FakeSandbox::new();

    // Nothing answers the site root: five consecutive background misses
    // escalate to a native load; the blank page polls out at the
    // unrecognized-page ceiling and the chain exhausts with a manual retry
    // affordance.
    let mut handle = engine.begin(sandbox.clone(), &site, "b", 0);

    match handle.solution().await {
        Err(SolveError::Exhausted { attempts }) => assert!(attempts >= 5, "attempts {attempts}"),
        other => panic!("expected exhaustion, got {other:?}"),
    }

    let loads = sandbox.loads();
    assert!(!loads.is_empty(), "native escalation should have navigated");
    assert!(loads[0].contains("/twister.php?board=b&thread=0"));

    let mut saw_retry_affordance = false;
    while let Some(event) = handle.try_ui_event() {
        if matches!(event, UiEvent::ManualRetryAvailable) {
            saw_retry_affordance = true;
        }
    }
    assert!(saw_retry_affordance);
}

#[tokio::test(start_paused = true)]
async fn native_page_auto_triggers_one_sandbox_fetch() {
    let engine = test_engine();
    let site = test_site();
    let sandbox = FakeSandbox::new();

    let mut handle = engine.begin(sandbox.clone(), &site, "b", 0);

    // The document probe finds a recognized challenge page with no payload
    // yet; the chain gets one same-origin fetch, which delivers the
    // challenge.
    let probe = serde_json::json!({
        "response": null,
        "blocking": null,
        "body": "<html>twister shell</html>"
    });
    sandbox.push_eval_result(serde_json::Value::String(probe.to_string()));
    sandbox.push_eval_result(serde_json::Value::String(format!(
        r#"{{"twister":{{"img":"{B64}","ticket":"t5"}}}}"#
    )));

    // Force the native path via a fingerprint gate.
    sandbox.emit(script_message(r#"{"error":"Checking your browser"}"#));

    wait_until(|| sandbox.synthetic_documents().len() == 1).await;
    let fetches = sandbox
        .evaluated_scripts()
        .iter()
        .filter(|s| s.contains("credentials: 'include'"))
        .count();
    assert_eq!(fetches, 1, "exactly one in-sandbox fetch per native load");
    assert_eq!(engine.cached_ticket(&site).as_deref(), Some("t5"));

    sandbox.emit(script_message(r#"{"response":"solved"}"#));
    let solution = handle.solution().await.expect("solution");
    assert_eq!(solution.response_token, "solved");
    assert_eq!(solution.challenge_id, "t5");
}

#[tokio::test(start_paused = true)]
async fn form_field_value_counts_as_solved() {
    let engine = test_engine();
    let site = test_site();
    let sandbox = FakeSandbox::new();

    let mut handle = engine.begin(sandbox.clone(), &site, "b", 0);
    sandbox.emit(script_message(&format!(r#"{{"img":"{B64}","id":"ch9"}}"#)));
    sandbox.emit(SandboxEvent::FormFieldValue {
        name: "captcha-response".into(),
        value: "filled-by-page".into(),
    });

    let solution = handle.solution().await.expect("solution");
    assert_eq!(solution.challenge_id, "ch9");
    assert_eq!(solution.response_token, "filled-by-page");
}

#[tokio::test(start_paused = true)]
async fn global_rate_limit_sites_share_one_key() {
    let engine = test_engine();
    let mut site = test_site();
    site.global_rate_limit = true;
    let sandbox = FakeSandbox::new();

    let mut handle = engine.begin(sandbox.clone(), &site, "b", 0);
    sandbox.emit(script_message(r#"{"twister":{"pcd":60}}"#));
    assert_eq!(
        handle.next_ui_event().await,
        Some(UiEvent::CooldownStarted { seconds: 60 })
    );

    // A different board and thread observe the same global cooldown.
    assert!(engine.is_on_cooldown(&site, "v", 12345));
    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn session_starting_under_cooldown_short_circuits() {
    let engine = test_engine();
    let site = test_site();
    let sandbox = FakeSandbox::new();

    let mut first = engine.begin(sandbox.clone(), &site, "b", 0);
    sandbox.emit(script_message(r#"{"twister":{"pcd":45}}"#));
    assert_eq!(
        first.next_ui_event().await,
        Some(UiEvent::CooldownStarted { seconds: 45 })
    );

    // A second reply form for the same thread starts straight into the
    // countdown, without fetching anything.
    let sandbox2 = FakeSandbox::new();
    let mut second = engine.begin(sandbox2.clone(), &site, "b", 0);
    match second.next_ui_event().await {
        Some(UiEvent::CooldownStarted { seconds }) => {
            assert!((43..=45).contains(&seconds), "seconds {seconds}")
        }
        other => panic!("expected countdown, got {other:?}"),
    }

    first.cancel();
    second.cancel();
}
