use std::collections::BTreeMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};

use crate::request::Endpoint;

/// Client headers never forwarded upstream in proxy mode, on top of the
/// deployment's `CUSTOM_HEADERS_TO_IGNORE` list.
const ALWAYS_IGNORED_PROXY_HEADERS: &[&str] = &["expect", "content-length"];

fn insert_str(headers: &mut HeaderMap, name: &str, value: &str) {
    let Ok(name) = HeaderName::try_from(name.to_ascii_lowercase()) else {
        return;
    };
    let Ok(value) = HeaderValue::from_str(value) else {
        return;
    };
    headers.insert(name, value);
}

/// Composes the headers for one upstream call: base defaults, then the
/// provider-mapped set, then the forward list, then (proxy only) the client
/// passthrough. Later layers overwrite earlier ones.
pub fn build_final_headers(
    provider_headers: &BTreeMap<String, String>,
    client_headers: &HeaderMap,
    forward_headers: &[String],
    endpoint: &Endpoint,
    method: &Method,
    proxy_ignore_headers: &[String],
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_static("application/json"),
    );
    if let Some(encoding) = client_headers.get("accept-encoding") {
        headers.insert("accept-encoding", encoding.clone());
    }

    for (name, value) in provider_headers {
        insert_str(&mut headers, name, value);
    }

    for name in forward_headers {
        let lowered = name.to_ascii_lowercase();
        if let Some(value) = client_headers.get(lowered.as_str()) {
            let value = value.clone();
            if let Ok(name) = HeaderName::try_from(lowered) {
                headers.insert(name, value);
            }
        }
    }

    if endpoint.is_proxy() {
        for (name, value) in client_headers {
            let name_str = name.as_str();
            if name_str.starts_with("x-portkey-") {
                continue;
            }
            if ALWAYS_IGNORED_PROXY_HEADERS.contains(&name_str) {
                continue;
            }
            if proxy_ignore_headers
                .iter()
                .any(|ignored| ignored.eq_ignore_ascii_case(name_str))
            {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }
    }

    post_process_headers(&mut headers, client_headers, endpoint, method);
    headers
}

/// Method/content-type post-rules. Idempotent: applying it to its own
/// output changes nothing.
pub fn post_process_headers(
    headers: &mut HeaderMap,
    client_headers: &HeaderMap,
    endpoint: &Endpoint,
    method: &Method,
) {
    let is_multipart = headers
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("multipart/form-data"))
        .unwrap_or(false);
    if method == Method::GET || is_multipart {
        headers.remove("content-type");
    }

    if endpoint.is_upload_file() {
        if let Some(content_type) = client_headers.get("content-type") {
            headers.insert("content-type", content_type.clone());
        }
        if let Some(purpose) = client_headers.get("x-portkey-file-purpose") {
            headers.insert("x-portkey-file-purpose", purpose.clone());
        }
    }
}
