//! Background fetch strategy — out-of-sandbox authenticated challenge
//! requests.
//!
//! One short-lived worker per attempt. Workers never touch session state:
//! they deliver their result by posting a message back to the session task,
//! and a failed send means the session is gone — that is the alive check.

use crate::acquire::{FetchOrigin, SessionMsg};
use crate::core::types::SiteDescriptor;
use crate::net::{MirrorRotator, RequestPacer};
use crate::sandbox::Sandbox;
use backoff::ExponentialBackoffBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub(crate) struct FetchJob {
    pub http: reqwest::Client,
    pub site: SiteDescriptor,
    pub board: String,
    pub thread_id: u64,
    pub ticket: Option<String>,
    pub pacer: Arc<RequestPacer>,
    pub rotator: Arc<MirrorRotator>,
    pub sandbox: Arc<dyn Sandbox>,
    pub msg_tx: mpsc::Sender<SessionMsg>,
    pub retry_max_elapsed: Duration,
}

pub(crate) fn spawn(job: FetchJob) {
    tokio::spawn(async move {
        job.pacer.wait_for_next_request().await;

        let root = job.rotator.active_root();
        let url = match job.site.challenge_url(
            &root,
            &job.board,
            job.thread_id,
            job.ticket.as_deref(),
        ) {
            Ok(url) => url,
            Err(e) => {
                let _ = job
                    .msg_tx
                    .send(SessionMsg::FetchResult {
                        origin: FetchOrigin::Background,
                        result: Err(format!("bad challenge endpoint: {}", e)),
                    })
                    .await;
                return;
            }
        };

        // Reuse the sandbox's cookie jar so the server sees the same session
        // it has been fingerprinting.
        let cookie = job.sandbox.cookie_header(&url).await.ok().flatten();
        debug!(%url, has_cookie = cookie.is_some(), "background challenge fetch");

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(250))
            .with_max_elapsed_time(Some(job.retry_max_elapsed))
            .build();

        let http = job.http.clone();
        let referer = root.as_str().to_string();
        let result = backoff::future::retry(policy, || {
            let http = http.clone();
            let url = url.clone();
            let cookie = cookie.clone();
            let referer = referer.clone();
            async move {
                let mut request = http
                    .get(url)
                    .header(
                        reqwest::header::ACCEPT,
                        "application/json, text/html;q=0.9, */*;q=0.5",
                    )
                    .header("X-Requested-With", "XMLHttpRequest")
                    .header(reqwest::header::REFERER, referer);
                if let Some(cookie) = &cookie {
                    request = request.header(reqwest::header::COOKIE, cookie.clone());
                }
                let response = request.send().await.map_err(backoff::Error::transient)?;
                // Error statuses still carry payloads — bans and rate limits
                // arrive as 4xx JSON. Only transport-level failure retries.
                response.text().await.map_err(backoff::Error::transient)
            }
        })
        .await;

        job.rotator.record_result(&root, result.is_ok());
        if let Err(e) = &result {
            warn!("background fetch transport failure: {}", e);
        }

        let _ = job
            .msg_tx
            .send(SessionMsg::FetchResult {
                origin: FetchOrigin::Background,
                result: result.map_err(|e| e.to_string()),
            })
            .await;
    });
}
