//! Native Chromium sandbox adapter.
//!
//! Hosts challenge pages in a real headless Chromium over CDP so the
//! server's own scripts (fingerprinting, widget bootstrap) actually run.
//! This module owns:
//! * Finding a usable browser executable (env override → PATH → well-known
//!   install paths).
//! * A mobile-profile headless config — the posting client presents itself
//!   as a phone, and challenge pages are tap-only.
//! * Fetch-domain request interception, which doubles as the synthetic
//!   document loader: navigating to the base origin while a prepared
//!   response is staged yields a page whose origin and cookie scope match
//!   the real server.
//! * A script binding (`__postgate_emit`) that pages use to post messages
//!   back to the engine.

use crate::core::error::SandboxError;
use crate::sandbox::{OverrideResponse, RequestInterceptor, Sandbox, SandboxEvent};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, ContinueRequestParams, EventRequestPaused, FulfillRequestParams, HeaderEntry,
};
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use chromiumoxide::cdp::js_protocol::runtime::{AddBindingParams, EventBindingCalled};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

/// Name of the binding challenge documents call to reach the engine.
pub const EMIT_BINDING: &str = "__postgate_emit";

const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Mobile Safari/537.36";

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `POSTGATE_BROWSER` env var (explicit override)
/// 2. PATH scan
/// 3. OS-specific well-known install paths
pub fn find_browser_executable() -> Option<String> {
    if let Ok(p) = std::env::var("POSTGATE_BROWSER") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = ["chromium", "chromium-browser", "google-chrome", "chrome", "brave-browser"];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/bin/google-chrome",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

/// Headless config with a phone profile and automation fingerprint
/// suppressed — challenge servers special-case `navigator.webdriver`.
fn build_sandbox_config(exe: &str) -> Result<BrowserConfig> {
    BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width: 393,
            height: 851,
            device_scale_factor: Some(2.75),
            emulating_mobile: true,
            is_landscape: false,
            has_touch: true,
        })
        .window_size(393, 851)
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--hide-scrollbars")
        .arg("--mute-audio")
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", MOBILE_USER_AGENT))
        .build()
        .map_err(|e| anyhow!("failed to build browser config: {}", e))
}

struct InterceptState {
    interceptor: Mutex<Option<Arc<dyn RequestInterceptor>>>,
    /// base-origin URL → staged HTML, consumed by the next request for it.
    synthetic: Mutex<HashMap<String, String>>,
}

impl InterceptState {
    fn override_for(&self, url: &str) -> Option<OverrideResponse> {
        if let Some(html) = self.synthetic.lock().expect("intercept state poisoned").remove(url) {
            return Some(OverrideResponse {
                status: 200,
                content_type: "text/html; charset=utf-8".to_string(),
                body: html.into_bytes(),
            });
        }
        let guard = self.interceptor.lock().expect("intercept state poisoned");
        guard.as_ref().and_then(|i| i.intercept(url))
    }
}

pub struct CdpSandbox {
    page: Page,
    browser: tokio::sync::Mutex<Option<Browser>>,
    events_tx: broadcast::Sender<SandboxEvent>,
    shared: Arc<InterceptState>,
}

impl CdpSandbox {
    /// Launch a fresh headless browser and wire up interception and the
    /// message binding. Fails when no browser executable is installed.
    pub async fn launch() -> Result<Arc<Self>> {
        let exe = find_browser_executable().ok_or_else(|| {
            anyhow!("no browser found — install Chromium or Chrome, or set POSTGATE_BROWSER")
        })?;
        info!("launching sandbox browser ({})", exe);

        let config = build_sandbox_config(&exe)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| anyhow!("failed to launch browser ({}): {}", exe, e))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("CDP handler error: {}", e);
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| anyhow!("failed to open sandbox page: {}", e))?;

        let (events_tx, _) = broadcast::channel(64);
        let shared = Arc::new(InterceptState {
            interceptor: Mutex::new(None),
            synthetic: Mutex::new(HashMap::new()),
        });

        let sandbox = Arc::new(Self {
            page: page.clone(),
            browser: tokio::sync::Mutex::new(Some(browser)),
            events_tx,
            shared,
        });

        sandbox.wire_message_binding(&page).await?;
        sandbox.wire_interception(&page).await?;

        Ok(sandbox)
    }

    async fn wire_message_binding(&self, page: &Page) -> Result<()> {
        page.execute(AddBindingParams::new(EMIT_BINDING))
            .await
            .map_err(|e| anyhow!("failed to add message binding: {}", e))?;

        let mut bindings = page
            .event_listener::<EventBindingCalled>()
            .await
            .map_err(|e| anyhow!("failed to listen for binding calls: {}", e))?;

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = bindings.next().await {
                if event.name != EMIT_BINDING {
                    continue;
                }
                debug!("sandbox page posted {} bytes", event.payload.len());
                let _ = events_tx.send(SandboxEvent::ScriptMessage {
                    json: event.payload.clone(),
                });
            }
        });
        Ok(())
    }

    async fn wire_interception(&self, page: &Page) -> Result<()> {
        let mut paused = page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(|e| anyhow!("failed to listen for paused requests: {}", e))?;

        page.execute(fetch::EnableParams::default())
            .await
            .map_err(|e| anyhow!("failed to enable request interception: {}", e))?;

        let shared = Arc::clone(&self.shared);
        let page = page.clone();
        tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let url = event.request.url.clone();
                match shared.override_for(&url) {
                    Some(response) => {
                        debug!(%url, "serving substituted response");
                        let body = base64::engine::general_purpose::STANDARD.encode(&response.body);
                        let content_type = HeaderEntry {
                            name: "Content-Type".to_string(),
                            value: response.content_type.clone(),
                        };
                        let params = FulfillRequestParams::builder()
                            .request_id(event.request_id.clone())
                            .response_code(i64::from(response.status))
                            .response_headers(vec![content_type])
                            .body(body)
                            .build();
                        match params {
                            Ok(params) => {
                                if let Err(e) = page.execute(params).await {
                                    warn!("failed to fulfill intercepted request: {}", e);
                                }
                            }
                            Err(e) => warn!("bad fulfill params: {}", e),
                        }
                    }
                    None => {
                        let params = ContinueRequestParams::new(event.request_id.clone());
                        if let Err(e) = page.execute(params).await {
                            warn!("failed to continue request: {}", e);
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Poll `document.readyState` until the document settles or `timeout_ms`
    /// elapses. Challenge pages keep loading sub-resources long after the
    /// navigation promise resolves.
    async fn wait_document_complete(&self, timeout_ms: u64) {
        let poll = Duration::from_millis(250);
        let mut waited = 0u64;
        loop {
            let complete = self
                .page
                .evaluate("document.readyState")
                .await
                .ok()
                .and_then(|v| v.into_value::<serde_json::Value>().ok())
                .and_then(|j| j.as_str().map(|s| s == "complete"))
                .unwrap_or(false);
            if complete || waited >= timeout_ms {
                break;
            }
            tokio::time::sleep(poll).await;
            waited += 250;
        }
    }

    /// Gracefully close the browser process.
    pub async fn shutdown(&self) {
        let mut guard = self.browser.lock().await;
        if let Some(mut browser) = guard.take() {
            let _ = browser.close().await;
            info!("sandbox browser shut down");
        }
    }
}

#[async_trait]
impl Sandbox for CdpSandbox {
    async fn load_url(&self, url: &Url, headers: &[(String, String)]) -> Result<(), SandboxError> {
        if !headers.is_empty() {
            let map: serde_json::Map<String, serde_json::Value> = headers
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect();
            self.page
                .execute(SetExtraHttpHeadersParams::new(Headers::new(
                    serde_json::Value::Object(map),
                )))
                .await
                .map_err(|e| SandboxError::Navigation(e.to_string()))?;
        }

        self.page
            .goto(url.as_str())
            .await
            .map_err(|e| SandboxError::Navigation(e.to_string()))?;
        self.wait_document_complete(10_000).await;

        let _ = self.events_tx.send(SandboxEvent::LoadFinished {
            url: url.as_str().to_string(),
        });
        Ok(())
    }

    async fn load_synthetic_document(
        &self,
        html: &str,
        base_url: &Url,
    ) -> Result<(), SandboxError> {
        // Stage the document, then navigate to its base origin; the
        // interception task serves the staged HTML, so the resulting page
        // has the real server's origin and cookie scope.
        self.shared
            .synthetic
            .lock()
            .expect("intercept state poisoned")
            .insert(base_url.as_str().to_string(), html.to_string());

        self.page
            .goto(base_url.as_str())
            .await
            .map_err(|e| SandboxError::SyntheticLoad(e.to_string()))?;
        self.wait_document_complete(5_000).await;

        let _ = self.events_tx.send(SandboxEvent::LoadFinished {
            url: base_url.as_str().to_string(),
        });
        Ok(())
    }

    async fn evaluate_script(&self, code: &str) -> Result<serde_json::Value, SandboxError> {
        let result = self
            .page
            .evaluate(code)
            .await
            .map_err(|e| SandboxError::Evaluation(e.to_string()))?;
        result
            .into_value::<serde_json::Value>()
            .map_err(|e| SandboxError::Evaluation(e.to_string()))
    }

    fn set_interceptor(&self, interceptor: Option<Arc<dyn RequestInterceptor>>) {
        *self
            .shared
            .interceptor
            .lock()
            .expect("intercept state poisoned") = interceptor;
    }

    fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events_tx.subscribe()
    }

    async fn cookie_header(&self, url: &Url) -> Result<Option<String>, SandboxError> {
        let host = url.host_str().unwrap_or_default().to_string();
        let cookies = self
            .page
            .get_cookies()
            .await
            .map_err(|e| SandboxError::Evaluation(e.to_string()))?;

        let header = cookies
            .iter()
            .filter(|c| {
                let domain = c.domain.trim_start_matches('.');
                host == domain || host.ends_with(&format!(".{}", domain))
            })
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");

        Ok((!header.is_empty()).then_some(header))
    }
}
