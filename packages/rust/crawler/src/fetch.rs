//! HTTP plumbing: client construction, SSRF guard, page fetching and link
//! harvesting.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use batchscout_shared::{BatchScoutError, Result};

/// User-Agent string for research requests.
const USER_AGENT: &str = concat!("BatchScout/", env!("CARGO_PKG_VERSION"));

/// Maximum redirects followed per request.
const MAX_REDIRECTS: usize = 5;

/// Build the HTTP client owned by one research session. Unless
/// `allow_private_hosts` is set, redirects into private hosts are refused.
pub(crate) fn build_client(timeout: Duration, allow_private_hosts: bool) -> Result<Client> {
    let policy = reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else if !allow_private_hosts && is_ssrf_target(attempt.url()) {
            let blocked = format!("redirect to {} blocked by SSRF protection", attempt.url());
            attempt.error(blocked)
        } else {
            attempt.follow()
        }
    });

    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(policy)
        .timeout(timeout)
        .build()
        .map_err(|e| BatchScoutError::resource_creation(format!("failed to build HTTP client: {e}")))
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

/// A successfully fetched HTML document.
#[derive(Debug, Clone)]
pub(crate) struct FetchedPage {
    pub url: Url,
    pub status: u16,
    pub body: String,
}

/// GET `url`, failing on transport errors and non-2xx responses.
pub(crate) async fn fetch_page(client: &Client, url: &Url) -> Result<FetchedPage> {
    debug!(%url, "fetching page");

    let response = client
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| BatchScoutError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(BatchScoutError::Network(format!("{url}: HTTP {status}")));
    }

    // Redirects may land elsewhere; links resolve against the final URL.
    let final_url = response.url().clone();
    let body = response
        .text()
        .await
        .map_err(|e| BatchScoutError::Network(format!("{url}: body read failed: {e}")))?;

    Ok(FetchedPage {
        url: final_url,
        status: status.as_u16(),
        body,
    })
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub(crate) fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// Collect distinct same-host http(s) links from `doc`, in document order,
/// excluding `base` itself. At most `limit` links are returned.
pub(crate) fn same_host_links(doc: &Html, base: &Url, limit: usize) -> Vec<Url> {
    let Ok(link_sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut seen = HashSet::from([normalize_url(base)]);
    let mut links = Vec::new();

    for el in doc.select(&link_sel) {
        if links.len() >= limit {
            break;
        }
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
            continue;
        }
        let Ok(mut resolved) = base.join(href) else {
            continue;
        };
        resolved.set_fragment(None);

        if !matches!(resolved.scheme(), "http" | "https") || resolved.host_str() != base.host_str() {
            continue;
        }
        if seen.insert(normalize_url(&resolved)) {
            links.push(resolved);
        }
    }

    links
}

/// Normalize a URL for deduplication (strip fragment and trailing slash).
pub(crate) fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    if s.ends_with('/') && s.matches('/').count() > 3 {
        s.pop();
    }
    s
}

/// Compute SHA-256 hash of content.
pub(crate) fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_fragment_and_trailing_slash() {
        let url = Url::parse("https://acme.example.com/about/#team").unwrap();
        assert_eq!(normalize_url(&url), "https://acme.example.com/about");

        let root = Url::parse("https://acme.example.com/").unwrap();
        assert_eq!(normalize_url(&root), "https://acme.example.com/");
    }

    #[test]
    fn hash_is_sha256_hex() {
        let hash = compute_hash("hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn ssrf_blocks_non_http_and_private_hosts() {
        for blocked in [
            "file:///etc/passwd",
            "http://192.168.1.1/admin",
            "http://10.0.0.1/",
            "http://127.0.0.1:8080/",
            "http://100.64.0.1/",
            "http://[::1]/",
            "http://[fd00::1]/",
            "http://localhost:3000/api",
            "http://printer.local/",
        ] {
            let url = Url::parse(blocked).unwrap();
            assert!(is_ssrf_target(&url), "{blocked} should be blocked");
        }
    }

    #[test]
    fn ssrf_allows_public_hosts() {
        let url = Url::parse("https://acme.example.com/about").unwrap();
        assert!(!is_ssrf_target(&url));
        let url = Url::parse("http://93.184.216.34/").unwrap();
        assert!(!is_ssrf_target(&url));
    }

    #[tokio::test]
    async fn redirects_into_private_hosts_are_refused() {
        use wiremock::matchers::path;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(path("/hop"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", format!("{}/inner", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(path("/inner"))
            .respond_with(ResponseTemplate::new(200).set_body_string("internal"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/hop", server.uri())).unwrap();

        let guarded = build_client(Duration::from_secs(5), false).unwrap();
        assert!(fetch_page(&guarded, &url).await.is_err());
        let requested: Vec<String> = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|r| r.url.path().to_string())
            .collect();
        assert_eq!(requested, vec!["/hop"]);

        let open = build_client(Duration::from_secs(5), true).unwrap();
        let page = fetch_page(&open, &url).await.unwrap();
        assert_eq!(page.url.path(), "/inner");
        assert_eq!(page.body, "internal");
    }

    #[test]
    fn links_are_same_host_deduplicated_and_capped() {
        let html = r##"<html><body>
            <a href="/about">About</a>
            <a href="/about#history">About again</a>
            <a href="https://other.example.com/team">External</a>
            <a href="#top">Anchor</a>
            <a href="mailto:hi@acme.example.com">Mail</a>
            <a href="/">Home</a>
            <a href="team">Team</a>
            <a href="/pricing">Pricing</a>
        </body></html>"##;
        let doc = Html::parse_document(html);
        let base = Url::parse("https://acme.example.com/").unwrap();

        let links: Vec<String> = same_host_links(&doc, &base, 10)
            .iter()
            .map(Url::to_string)
            .collect();
        assert_eq!(
            links,
            vec![
                "https://acme.example.com/about",
                "https://acme.example.com/team",
                "https://acme.example.com/pricing",
            ]
        );

        assert_eq!(same_host_links(&doc, &base, 2).len(), 2);
    }
}
