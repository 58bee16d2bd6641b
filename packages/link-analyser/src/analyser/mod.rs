//! Link Analyser (C3): `Analyse(source_url, target_domain) -> Verdict` (spec §4.3).

pub mod extract;
pub mod indexability;
pub mod proxy;
pub mod render;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::domain::{LinkClass, LinkState, Verdict};
use crate::error::AnalyserError;
use extract::{extract_dom_candidates, extract_dom_free, Candidate};
use indexability::{compute_indexability, is_canonicalised};
use proxy::RenderProxy;
use render::{RenderEngine, RenderedPage, USER_AGENT_PROFILES};

/// Tunables from spec §6 (defaults match the table there).
#[derive(Debug, Clone)]
pub struct AnalyserConfig {
    pub render_timeout: Duration,
    pub render_settle: Duration,
    pub reload_settle: Duration,
    pub proxy_retry_attempts: u32,
    pub proxy_timeout: Duration,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            render_timeout: Duration::from_millis(60_000),
            render_settle: Duration::from_millis(3_000),
            reload_settle: Duration::from_millis(5_000),
            proxy_retry_attempts: 2,
            proxy_timeout: Duration::from_millis(60_000),
        }
    }
}

pub struct Analyser {
    render_engine: Arc<dyn RenderEngine>,
    render_proxy: Option<Arc<dyn RenderProxy>>,
    config: AnalyserConfig,
}

impl Analyser {
    pub fn new(
        render_engine: Arc<dyn RenderEngine>,
        render_proxy: Option<Arc<dyn RenderProxy>>,
        config: AnalyserConfig,
    ) -> Self {
        Self {
            render_engine,
            render_proxy,
            config,
        }
    }

    /// Run the full pipeline. Deterministic with respect to observable page content and the
    /// internal retry schedule, modulo `load_time_ms`/timestamps (spec §4.3, §8).
    pub async fn analyse(&self, source_url: &str, target_domain: &str) -> Verdict {
        let start = std::time::Instant::now();

        match self.run_direct_and_proxy(source_url, target_domain).await {
            Ok(outcome) => {
                let load_time_ms = start.elapsed().as_millis() as i64;
                self.assemble_verdict(outcome, load_time_ms)
            }
            Err(err) => {
                info!(url = source_url, target_domain, error = %err, "analyser pipeline failed");
                Verdict {
                    state: LinkState::Problem,
                    response_code: err.response_code(),
                    indexable: true,
                    link_class: LinkClass::Absent,
                    canonical_url: None,
                    load_time_ms: start.elapsed().as_millis() as i64,
                    matched_anchor_html: None,
                    non_indexable_reason: Some(err.reason().to_string()),
                }
            }
        }
    }

    async fn run_direct_and_proxy(
        &self,
        source_url: &str,
        target_domain: &str,
    ) -> Result<PipelineOutcome, AnalyserError> {
        let direct_ua = USER_AGENT_PROFILES[0].1;
        let direct_result = self
            .render_engine
            .render(source_url, direct_ua, self.config.render_timeout)
            .await;

        let page = match direct_result {
            Ok(page) => page,
            Err(err @ AnalyserError::Blocked403) => {
                warn!(url = source_url, "direct fetch returned 403, falling back to proxy");
                // Spec §4.3 step 7 / §8 scenario 5: a proxy-recovered verdict still records the
                // *primary document's* status (403 here), not the proxy's own response code.
                return self
                    .proxy_fallback(source_url, target_domain, Some(err), 403)
                    .await;
            }
            Err(err @ AnalyserError::TransientFetch(_)) => {
                warn!(url = source_url, error = %err, "direct fetch failed, falling back to proxy");
                // No primary document was ever captured (navigation error): spec §4.3 step 7
                // says the response code is "0 when fabricated by fallback success".
                return self
                    .proxy_fallback(source_url, target_domain, Some(err), 0)
                    .await;
            }
            Err(err @ AnalyserError::HttpError(_)) => {
                // Non-403 HTTP error: no fallback (spec §7).
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let base = Url::parse(&page.final_url)
            .map_err(|e| AnalyserError::TransientFetch(format!("bad final url: {e}")))?;

        let mut candidates = extract_dom_candidates(&page.html, &base, target_domain);

        if candidates.is_empty() {
            debug!(url = source_url, "dom pass found nothing, running reload-and-scroll retry");
            // Reload-and-scroll retry: one retry, not a loop. A JS-rendering engine would wait
            // out `reload_settle` here before re-extracting; a static-HTML engine has nothing
            // to wait for, so the settle window is a no-op for `HttpRenderEngine`.
            if let Ok(reloaded) = self
                .render_engine
                .render(&page.final_url, direct_ua, self.config.render_timeout)
                .await
            {
                candidates = extract_dom_candidates(&reloaded.html, &base, target_domain);
            }
        }

        if candidates.is_empty() {
            debug!(url = source_url, "still absent after reload, falling back to proxy");
            return self.proxy_fallback_or_absent(source_url, target_domain, page).await;
        }

        Ok(PipelineOutcome::from_direct(page, candidates))
    }

    async fn proxy_fallback_or_absent(
        &self,
        source_url: &str,
        target_domain: &str,
        direct_page: RenderedPage,
    ) -> Result<PipelineOutcome, AnalyserError> {
        let primary_status = direct_page.primary_status as i32;
        match self
            .proxy_fallback(source_url, target_domain, None, primary_status)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(_) => Ok(PipelineOutcome::from_direct(direct_page, Vec::new())),
        }
    }

    /// Retry through the proxy with up to `R` strategies, each swapping UA/header profile.
    /// `prior_error` distinguishes "direct fetch failed outright" (every strategy attempted)
    /// from "direct succeeded but found nothing" (caller already tried one DOM pass).
    /// `primary_status` is the primary document's response code to record on proxy success
    /// (spec §4.3 step 7, §8 scenario 5) — the proxy's own status is never surfaced.
    async fn proxy_fallback(
        &self,
        source_url: &str,
        target_domain: &str,
        prior_error: Option<AnalyserError>,
        primary_status: i32,
    ) -> Result<PipelineOutcome, AnalyserError> {
        let Some(proxy) = self.render_proxy.clone().filter(|p| p.enabled()) else {
            return Err(prior_error.unwrap_or(AnalyserError::Inconclusive));
        };

        let base = Url::parse(source_url)
            .map_err(|e| AnalyserError::TransientFetch(format!("bad source url: {e}")))?;

        let mut last_err = prior_error;
        for (attempt, (profile_name, _)) in USER_AGENT_PROFILES
            .iter()
            .cycle()
            .take(self.config.proxy_retry_attempts as usize)
            .enumerate()
        {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(attempt as u64 * 3)).await;
            }

            match proxy
                .fetch(source_url, profile_name, true, self.config.proxy_timeout)
                .await
            {
                Ok(page) => {
                    let candidates = extract_dom_free(&page.html, &base, target_domain);
                    return Ok(PipelineOutcome::from_proxy(page, candidates, primary_status));
                }
                Err(e) => {
                    warn!(url = source_url, attempt, error = %e, "proxy strategy failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(AnalyserError::Inconclusive))
    }

    fn assemble_verdict(&self, outcome: PipelineOutcome, load_time_ms: i64) -> Verdict {
        let link_class = if outcome.candidates.is_empty() {
            LinkClass::Absent
        } else {
            LinkClass::from_rel_tokens(
                outcome
                    .candidates
                    .iter()
                    .flat_map(|c| c.rel_tokens.iter())
                    .map(String::as_str),
            )
        };

        let matched_anchor_html = outcome.candidates.first().map(|c| c.outer_html.clone());

        let indexability = outcome
            .html
            .as_deref()
            .zip(outcome.final_url.as_deref())
            .and_then(|(html, final_url)| {
                Url::parse(final_url)
                    .ok()
                    .map(|u| compute_indexability(html, outcome.x_robots_tag.as_deref(), &u))
            });

        let (indexable, mut non_indexable_reason, canonical_url) = match indexability {
            Some(signals) => (signals.indexable, signals.reason, signals.canonical_url),
            None => (true, None, None),
        };

        let canonicalised = outcome
            .final_url
            .as_deref()
            .is_some_and(|final_url| is_canonicalised(canonical_url.as_deref(), final_url));

        let is_absent = matches!(link_class, LinkClass::Absent);
        let is_non_indexable = !indexable;

        // Final status (spec §4.3 step 7): problem iff absent OR non-indexable by noindex.
        let state = if is_absent || is_non_indexable {
            LinkState::Problem
        } else {
            if canonicalised {
                non_indexable_reason = Some("canonicalised".to_string());
            }
            LinkState::Ok
        };

        Verdict {
            state,
            response_code: outcome.response_code,
            indexable,
            link_class,
            canonical_url,
            load_time_ms,
            matched_anchor_html,
            non_indexable_reason,
        }
    }
}

/// Intermediate result before classification/indexability are folded into a `Verdict`.
struct PipelineOutcome {
    response_code: i32,
    html: Option<String>,
    final_url: Option<String>,
    x_robots_tag: Option<String>,
    candidates: Vec<Candidate>,
}

impl PipelineOutcome {
    fn from_direct(page: RenderedPage, candidates: Vec<Candidate>) -> Self {
        Self {
            response_code: page.primary_status as i32,
            html: Some(page.html),
            final_url: Some(page.final_url),
            x_robots_tag: page.x_robots_tag,
            candidates,
        }
    }

    fn from_proxy(page: proxy::ProxyPage, candidates: Vec<Candidate>, primary_status: i32) -> Self {
        Self {
            response_code: primary_status,
            html: Some(page.html),
            final_url: None,
            x_robots_tag: None,
            candidates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StaticRenderEngine {
        pages: Mutex<Vec<Result<RenderedPage, AnalyserError>>>,
    }

    #[async_trait]
    impl RenderEngine for StaticRenderEngine {
        async fn render(
            &self,
            _url: &str,
            _user_agent: &str,
            _timeout: Duration,
        ) -> Result<RenderedPage, AnalyserError> {
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                Err(AnalyserError::Inconclusive)
            } else {
                pages.remove(0)
            }
        }
    }

    fn page(html: &str, status: u16, x_robots_tag: Option<&str>) -> RenderedPage {
        RenderedPage {
            primary_status: status,
            final_url: "https://src.example.com/page".to_string(),
            x_robots_tag: x_robots_tag.map(str::to_string),
            html: html.to_string(),
            load_time_ms: 10,
        }
    }

    fn analyser_with(pages: Vec<Result<RenderedPage, AnalyserError>>) -> Analyser {
        Analyser::new(
            Arc::new(StaticRenderEngine {
                pages: Mutex::new(pages),
            }),
            None,
            AnalyserConfig::default(),
        )
    }

    struct StaticRenderProxy {
        pages: Mutex<Vec<Result<proxy::ProxyPage, AnalyserError>>>,
    }

    #[async_trait]
    impl proxy::RenderProxy for StaticRenderProxy {
        fn enabled(&self) -> bool {
            true
        }

        async fn fetch(
            &self,
            _url: &str,
            _user_agent_profile: &str,
            _render: bool,
            _timeout: Duration,
        ) -> Result<proxy::ProxyPage, AnalyserError> {
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                Err(AnalyserError::Inconclusive)
            } else {
                pages.remove(0)
            }
        }
    }

    fn analyser_with_proxy(
        direct_pages: Vec<Result<RenderedPage, AnalyserError>>,
        proxy_pages: Vec<Result<proxy::ProxyPage, AnalyserError>>,
    ) -> Analyser {
        Analyser::new(
            Arc::new(StaticRenderEngine {
                pages: Mutex::new(direct_pages),
            }),
            Some(Arc::new(StaticRenderProxy {
                pages: Mutex::new(proxy_pages),
            })),
            AnalyserConfig::default(),
        )
    }

    #[tokio::test]
    async fn dofollow_hit() {
        let html = r#"<html><body><a href="https://target.com/x">x</a></body></html>"#;
        let analyser = analyser_with(vec![Ok(page(html, 200, None))]);
        let verdict = analyser.analyse("https://src.example.com/page", "target.com").await;
        assert_eq!(verdict.state, LinkState::Ok);
        assert_eq!(verdict.response_code, 200);
        assert!(verdict.indexable);
        assert_eq!(verdict.link_class, LinkClass::Dofollow);
        assert!(verdict.matched_anchor_html.unwrap().contains("href"));
    }

    #[tokio::test]
    async fn nofollow_ugc_hit_classifies_as_ugc() {
        let html = r#"<html><body><a rel="nofollow ugc" href="https://target.com/x">x</a></body></html>"#;
        let analyser = analyser_with(vec![Ok(page(html, 200, None))]);
        let verdict = analyser.analyse("https://src.example.com/page", "target.com").await;
        assert_eq!(verdict.link_class, LinkClass::Ugc);
    }

    #[tokio::test]
    async fn noindex_header_marks_problem() {
        let html = r#"<html><body><a href="https://target.com/x">x</a></body></html>"#;
        let analyser = analyser_with(vec![Ok(page(html, 200, Some("noindex")))]);
        let verdict = analyser.analyse("https://src.example.com/page", "target.com").await;
        assert_eq!(verdict.state, LinkState::Problem);
        assert!(!verdict.indexable);
        assert!(verdict
            .non_indexable_reason
            .unwrap()
            .starts_with("X-Robots-Tag"));
    }

    #[tokio::test]
    async fn canonicalised_is_ok_not_a_failure() {
        let html = r#"<html><head><link rel="canonical" href="https://src.example.com/other"></head>
            <body><a href="https://target.com/x">x</a></body></html>"#;
        let analyser = analyser_with(vec![Ok(page(html, 200, None))]);
        let verdict = analyser.analyse("https://src.example.com/page", "target.com").await;
        assert_eq!(verdict.state, LinkState::Ok);
        assert_eq!(verdict.non_indexable_reason.as_deref(), Some("canonicalised"));
    }

    #[tokio::test]
    async fn empty_candidates_after_reload_is_absent() {
        let html = r#"<html><body>no links here</body></html>"#;
        let analyser = analyser_with(vec![Ok(page(html, 200, None)), Ok(page(html, 200, None))]);
        let verdict = analyser.analyse("https://src.example.com/page", "target.com").await;
        assert_eq!(verdict.link_class, LinkClass::Absent);
        assert_eq!(verdict.state, LinkState::Problem);
    }

    #[tokio::test]
    async fn http_4xx_no_fallback_preserves_code() {
        let analyser = analyser_with(vec![Err(AnalyserError::HttpError(500))]);
        let verdict = analyser.analyse("https://src.example.com/page", "target.com").await;
        assert_eq!(verdict.state, LinkState::Problem);
        assert_eq!(verdict.response_code, 500);
        assert_eq!(verdict.link_class, LinkClass::Absent);
    }

    #[tokio::test]
    async fn blocked_403_with_proxy_disabled_reports_blocked() {
        let analyser = analyser_with(vec![Err(AnalyserError::Blocked403)]);
        let verdict = analyser.analyse("https://src.example.com/page", "target.com").await;
        assert_eq!(verdict.state, LinkState::Problem);
        assert_eq!(verdict.non_indexable_reason.as_deref(), Some("blocked"));
        assert_eq!(verdict.response_code, 403);
    }

    #[tokio::test]
    async fn blocked_403_recovered_by_proxy_keeps_the_primary_403_as_response_code() {
        // Spec §8 scenario 5: "Direct 403, proxy returns HTML containing anchor. Verdict:
        // status=ok, responseCode=403, linkClass=dofollow." The proxy's own (likely 200)
        // status must never leak into the verdict.
        let html = r#"<html><body><a href="https://target.com/x">x</a></body></html>"#;
        let analyser = analyser_with_proxy(
            vec![Err(AnalyserError::Blocked403)],
            vec![Ok(proxy::ProxyPage {
                status: 200,
                html: html.to_string(),
                response_time_ms: 20,
            })],
        );
        let verdict = analyser.analyse("https://src.example.com/page", "target.com").await;
        assert_eq!(verdict.state, LinkState::Ok);
        assert_eq!(verdict.response_code, 403);
        assert_eq!(verdict.link_class, LinkClass::Dofollow);
    }

    #[tokio::test]
    async fn absent_after_reload_recovered_by_proxy_keeps_the_direct_pages_status() {
        let empty = r#"<html><body>no links here</body></html>"#;
        let recovered = r#"<html><body><a href="https://target.com/x">x</a></body></html>"#;
        let analyser = analyser_with_proxy(
            vec![Ok(page(empty, 200, None)), Ok(page(empty, 200, None))],
            vec![Ok(proxy::ProxyPage {
                status: 200,
                html: recovered.to_string(),
                response_time_ms: 20,
            })],
        );
        let verdict = analyser.analyse("https://src.example.com/page", "target.com").await;
        assert_eq!(verdict.state, LinkState::Ok);
        assert_eq!(verdict.response_code, 200);
        assert_eq!(verdict.link_class, LinkClass::Dofollow);
    }

    #[tokio::test]
    async fn transient_fetch_error_recovered_by_proxy_fabricates_zero_response_code() {
        let recovered = r#"<html><body><a href="https://target.com/x">x</a></body></html>"#;
        let analyser = analyser_with_proxy(
            vec![Err(AnalyserError::TransientFetch("connection reset".into()))],
            vec![Ok(proxy::ProxyPage {
                status: 200,
                html: recovered.to_string(),
                response_time_ms: 20,
            })],
        );
        let verdict = analyser.analyse("https://src.example.com/page", "target.com").await;
        assert_eq!(verdict.state, LinkState::Ok);
        assert_eq!(verdict.response_code, 0);
        assert_eq!(verdict.link_class, LinkClass::Dofollow);
    }
}
