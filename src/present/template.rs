//! Synthetic challenge document assembly.
//!
//! When a challenge arrives through a data channel (background or in-sandbox
//! fetch) there is no server page to show, so the controller builds one: a
//! minimal tap-only document that renders the puzzle assets and posts the
//! user's answer back through the engine's message binding, falling back to
//! `postMessage` for hosts without the binding.
//!
//! Asset bytes are not inlined; the document references fixed asset paths
//! that the session serves through request interception, keeping the
//! document small and the base origin real.

use crate::core::types::{ChallengeData, ChallengeKind};

/// Path the foreground image is served under via interception.
pub const IMAGE_ASSET_PATH: &str = "/postgate/challenge.png";
/// Path the background layer is served under via interception.
pub const BACKGROUND_ASSET_PATH: &str = "/postgate/background.png";

/// Field name the document stores the answer in before posting it. Kept in
/// sync with the response-field probe used on native pages.
pub const RESPONSE_FIELD: &str = "captcha-response";

pub fn challenge_document(data: &ChallengeData) -> String {
    let body = match data.kind {
        ChallengeKind::Image => image_body(data),
        ChallengeKind::TaskSet => task_body(data),
    };
    let id = serde_json::to_string(data.id.as_deref().unwrap_or_default())
        .unwrap_or_else(|_| "\"\"".to_string());

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1, user-scalable=no">
<style>
  body {{ margin: 0; background: #1d1f21; color: #c5c8c6; font-family: sans-serif;
         display: flex; flex-direction: column; align-items: center; gap: 12px; padding: 16px; }}
  .stage {{ position: relative; }}
  .stage img {{ display: block; max-width: 100%; }}
  .stage img.bg {{ position: absolute; top: 0; left: 0; }}
  input[type=range] {{ width: 100%; }}
  button {{ font-size: 18px; padding: 10px 24px; }}
  .task button {{ margin: 4px; }}
</style>
</head>
<body>
{body}
<input type="hidden" name="{field}" id="{field}">
<script>
  var CHALLENGE_ID = {id};
  function deliver(value) {{
    document.getElementById('{field}').value = value;
    var msg = JSON.stringify({{ id: CHALLENGE_ID, response: String(value) }});
    if (window.__postgate_emit) {{ window.__postgate_emit(msg); }}
    else if (window.parent) {{ window.parent.postMessage(msg, '*'); }}
  }}
</script>
</body>
</html>"#,
        body = body,
        field = RESPONSE_FIELD,
        id = id,
    )
}

fn image_body(data: &ChallengeData) -> String {
    let slider = if data.assets.background.is_some() {
        format!(
            r#"<img class="bg" src="{bg}" alt="">
<input type="range" min="0" max="100" value="0" id="slide"
       oninput="document.querySelector('.stage img.bg').style.left = (this.value - 50) + 'px'">
<button onclick="deliver(document.getElementById('slide').value)">Confirm</button>"#,
            bg = BACKGROUND_ASSET_PATH
        )
    } else {
        r#"<input type="range" min="0" max="100" value="0" id="slide">
<button onclick="deliver(document.getElementById('slide').value)">Confirm</button>"#
            .to_string()
    };
    format!(
        r#"<div class="stage"><img src="{img}" alt="challenge"></div>
{slider}"#,
        img = IMAGE_ASSET_PATH,
        slider = slider
    )
}

fn task_body(data: &ChallengeData) -> String {
    let mut out = String::from(r#"<div class="task">"#);
    for (idx, prompt) in data.assets.tasks.iter().enumerate() {
        let prompt_html = html_escape(prompt);
        out.push_str(&format!(
            r#"<p>{prompt}</p>
<button onclick="answer({idx}, true)">Yes</button>
<button onclick="answer({idx}, false)">No</button>"#,
            prompt = prompt_html,
            idx = idx
        ));
    }
    out.push_str(&format!(
        r#"</div>
<script>
  var ANSWERS = new Array({count}).fill(null);
  function answer(idx, value) {{
    ANSWERS[idx] = value ? '1' : '0';
    if (ANSWERS.every(function(a) {{ return a !== null; }})) {{
      deliver(ANSWERS.join(''));
    }}
  }}
</script>"#,
        count = data.assets.tasks.len()
    ));
    out
}

/// Non-destructive status overlay script. Creates or updates a single fixed
/// element; never replaces the live document, so an in-flight verification
/// widget on the page survives it.
pub fn overlay_script(text: &str, tappable: bool) -> String {
    let text_js = serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"(() => {{
  var id = '__postgate_status_overlay__';
  var el = document.getElementById(id);
  if (!el) {{
    el = document.createElement('div');
    el.id = id;
    el.style.cssText = 'position:fixed;top:0;left:0;right:0;z-index:2147483647;' +
      'background:rgba(29,31,33,0.92);color:#c5c8c6;padding:10px 14px;' +
      'font:14px sans-serif;text-align:center;';
    (document.body || document.documentElement).appendChild(el);
  }}
  el.textContent = {text};
  el.style.pointerEvents = {pointer};
  return true;
}})()"#,
        text = text_js,
        pointer = if tappable { "'auto'" } else { "'none'" },
    )
}

/// Remove the status overlay, if present.
pub fn clear_overlay_script() -> &'static str {
    r#"(() => {
  var el = document.getElementById('__postgate_status_overlay__');
  if (el && el.parentNode) { el.parentNode.removeChild(el); }
  return true;
})()"#
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ChallengeAssets, ChallengeKind};

    #[test]
    fn image_document_references_intercepted_assets() {
        let data = ChallengeData {
            kind: ChallengeKind::Image,
            assets: ChallengeAssets {
                image: Some("Zm9v".into()),
                background: Some("YmFy".into()),
                tasks: vec![],
            },
            id: Some("c1".into()),
            ticket: None,
        };
        let html = challenge_document(&data);
        assert!(html.contains(IMAGE_ASSET_PATH));
        assert!(html.contains(BACKGROUND_ASSET_PATH));
        assert!(html.contains("CHALLENGE_ID = \"c1\""));
        assert!(html.contains(RESPONSE_FIELD));
    }

    #[test]
    fn task_document_escapes_prompts() {
        let data = ChallengeData {
            kind: ChallengeKind::TaskSet,
            assets: ChallengeAssets {
                image: None,
                background: None,
                tasks: vec!["<b>pick</b> the cat".into()],
            },
            id: None,
            ticket: None,
        };
        let html = challenge_document(&data);
        assert!(html.contains("&lt;b&gt;pick&lt;/b&gt;"));
        assert!(!html.contains("<b>pick</b>"));
    }

    #[test]
    fn overlay_script_embeds_text_safely() {
        let script = overlay_script("tap to \"retry\"", true);
        assert!(script.contains("tap to \\\"retry\\\""));
        assert!(script.contains("'auto'"));
    }
}
