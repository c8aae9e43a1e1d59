//! Scripted sandbox for tests and development.
//!
//! Records every call, answers `evaluate_script` from a queue, and lets the
//! test inject inbound events at will. `load_url` optionally auto-emits
//! `LoadFinished` so native-load flows run without a real renderer.

use crate::core::error::SandboxError;
use crate::sandbox::{OverrideResponse, RequestInterceptor, Sandbox, SandboxEvent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use url::Url;

#[derive(Default)]
struct Recorded {
    loads: Vec<String>,
    synthetic: Vec<(String, String)>, // (html, base_url)
    scripts: Vec<String>,
}

pub struct FakeSandbox {
    recorded: Mutex<Recorded>,
    eval_results: Mutex<VecDeque<serde_json::Value>>,
    cookie: Mutex<Option<String>>,
    interceptor: Mutex<Option<Arc<dyn RequestInterceptor>>>,
    events_tx: broadcast::Sender<SandboxEvent>,
    auto_load_finished: bool,
    fail_navigation: Mutex<bool>,
}

impl FakeSandbox {
    pub fn new() -> Arc<Self> {
        Self::with_auto_load(true)
    }

    /// `auto_load_finished = false` gives the test manual control over when
    /// `LoadFinished` fires.
    pub fn with_auto_load(auto_load_finished: bool) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            recorded: Mutex::new(Recorded::default()),
            eval_results: Mutex::new(VecDeque::new()),
            cookie: Mutex::new(None),
            interceptor: Mutex::new(None),
            events_tx,
            auto_load_finished,
            fail_navigation: Mutex::new(false),
        })
    }

    /// Queue the result of the next `evaluate_script` call.
    pub fn push_eval_result(&self, value: serde_json::Value) {
        self.eval_results.lock().unwrap().push_back(value);
    }

    /// Inject an inbound event as if the hosted page produced it.
    pub fn emit(&self, event: SandboxEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn set_cookie_header(&self, header: &str) {
        *self.cookie.lock().unwrap() = Some(header.to_string());
    }

    pub fn set_fail_navigation(&self, fail: bool) {
        *self.fail_navigation.lock().unwrap() = fail;
    }

    pub fn loads(&self) -> Vec<String> {
        self.recorded.lock().unwrap().loads.clone()
    }

    pub fn synthetic_documents(&self) -> Vec<(String, String)> {
        self.recorded.lock().unwrap().synthetic.clone()
    }

    pub fn evaluated_scripts(&self) -> Vec<String> {
        self.recorded.lock().unwrap().scripts.clone()
    }

    /// Run the installed interceptor against a URL, as the renderer would.
    pub fn drive_interceptor(&self, url: &str) -> Option<OverrideResponse> {
        let guard = self.interceptor.lock().unwrap();
        guard.as_ref().and_then(|i| i.intercept(url))
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn load_url(&self, url: &Url, _headers: &[(String, String)]) -> Result<(), SandboxError> {
        if *self.fail_navigation.lock().unwrap() {
            return Err(SandboxError::Navigation("scripted failure".into()));
        }
        self.recorded
            .lock()
            .unwrap()
            .loads
            .push(url.as_str().to_string());
        if self.auto_load_finished {
            let _ = self.events_tx.send(SandboxEvent::LoadFinished {
                url: url.as_str().to_string(),
            });
        }
        Ok(())
    }

    async fn load_synthetic_document(
        &self,
        html: &str,
        base_url: &Url,
    ) -> Result<(), SandboxError> {
        self.recorded
            .lock()
            .unwrap()
            .synthetic
            .push((html.to_string(), base_url.as_str().to_string()));
        if self.auto_load_finished {
            let _ = self.events_tx.send(SandboxEvent::LoadFinished {
                url: base_url.as_str().to_string(),
            });
        }
        Ok(())
    }

    async fn evaluate_script(&self, code: &str) -> Result<serde_json::Value, SandboxError> {
        self.recorded
            .lock()
            .unwrap()
            .scripts
            .push(code.to_string());
        Ok(self
            .eval_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(serde_json::Value::Null))
    }

    fn set_interceptor(&self, interceptor: Option<Arc<dyn RequestInterceptor>>) {
        *self.interceptor.lock().unwrap() = interceptor;
    }

    fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events_tx.subscribe()
    }

    async fn cookie_header(&self, _url: &Url) -> Result<Option<String>, SandboxError> {
        Ok(self.cookie.lock().unwrap().clone())
    }
}
