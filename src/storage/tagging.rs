//! Fire-and-forget notifications to the graphite tag index.
//!
//! Every created or written series may be POSTed to
//! `${graphite_url}/tags/tagSeries` as a `path=<metric>` form body so the
//! web app can index its tags. Failures of any kind are logged and
//! swallowed; tagging never affects the writer path.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{header, Method, Request, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error};

pub(crate) async fn tag_series(graphite_url: &str, metric: &str) {
    let endpoint = format!("{}/tags/tagSeries", graphite_url.trim_end_matches('/'));
    let uri: Uri = match endpoint.parse() {
        Ok(uri) => uri,
        Err(err) => {
            error!("invalid tag endpoint {}: {}", endpoint, err);
            return;
        }
    };

    let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let body = format!("path={}", form_urlencode(metric));
    let request = match Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Full::from(body))
    {
        Ok(request) => request,
        Err(err) => {
            error!("failed to build tag request for {}: {}", metric, err);
            return;
        }
    };

    match client.request(request).await {
        Ok(response) if response.status().is_success() => debug!("tagged {}", metric),
        Ok(response) => error!(
            "unexpected status {} tagging {}",
            response.status(),
            metric
        ),
        Err(err) => error!("error tagging {}: {}", metric, err),
    }
}

/// Minimal application/x-www-form-urlencoded value encoding.
fn form_urlencode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            b' ' => encoded.push('+'),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
