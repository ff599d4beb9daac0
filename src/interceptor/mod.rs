//! HTML response interception.
//!
//! Completed upstream responses are inspected here. HTML documents get the
//! DevTools loader and the navigation bridge appended to `<head>`; anything
//! else, and any document that cannot be decoded or rewritten, is handed back
//! exactly as received.

pub mod scripts;

use crate::csp::{extract_nonce, relax_csp};
use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use hyper::header::{
    HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_SECURITY_POLICY,
    CONTENT_TYPE, TRANSFER_ENCODING,
};
use lol_html::errors::RewritingError;
use lol_html::html_content::ContentType;
use lol_html::{element, rewrite_str, RewriteStrSettings};
use std::io::{self, Read};
use tracing::{debug, warn};

const BROTLI_BUFFER_SIZE: usize = 4096;

/// Where the injected loader fetches the DevTools bridge from.
#[derive(Debug, Clone)]
pub struct InjectionOptions {
    pub backend_host: String,
    pub backend_port: u16,
}

/// What the interceptor did with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not HTML; untouched.
    NotHtml,
    /// Scripts were injected and headers fixed up.
    Injected,
    /// HTML already carries the injected scripts; untouched.
    AlreadyInjected,
    /// HTML that could not be decoded, parsed or lacks `<html>`/`<head>`; untouched.
    FailedOpen,
}

/// Headers and body to send downstream.
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub headers: HeaderMap,
    pub body: Bytes,
    pub outcome: Outcome,
}

impl InterceptedResponse {
    fn unchanged(headers: &HeaderMap, body: Bytes, outcome: Outcome) -> Self {
        Self {
            headers: headers.clone(),
            body,
            outcome,
        }
    }
}

/// Whether a response carries an HTML document.
pub fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

/// Rewrite a fully buffered upstream response.
pub fn intercept_response(
    headers: &HeaderMap,
    body: Bytes,
    options: &InjectionOptions,
) -> InterceptedResponse {
    if !is_html(headers) {
        return InterceptedResponse::unchanged(headers, body, Outcome::NotHtml);
    }

    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let decoded = match decompress(encoding, &body) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(encoding = %encoding, error = %e, "Failed to decompress HTML response, passing through");
            return InterceptedResponse::unchanged(headers, body, Outcome::FailedOpen);
        }
    };
    let html = match std::str::from_utf8(&decoded) {
        Ok(html) => html,
        Err(e) => {
            warn!(error = %e, "HTML response is not valid UTF-8, passing through");
            return InterceptedResponse::unchanged(headers, body, Outcome::FailedOpen);
        }
    };

    let csp = joined_csp(headers);
    let nonce = extract_nonce(csp.as_deref());
    let markup = scripts::injected_markup(
        &options.backend_host,
        options.backend_port,
        nonce.as_deref(),
    );

    let rewritten = match inject(html, &markup) {
        Ok(Injection::Injected(rewritten)) => rewritten,
        Ok(Injection::AlreadyInjected) => {
            debug!("HTML already contains devtools scripts, skipping injection");
            return InterceptedResponse::unchanged(headers, body, Outcome::AlreadyInjected);
        }
        Ok(Injection::MissingHtml) => {
            debug!("No <html> element found, passing through");
            return InterceptedResponse::unchanged(headers, body, Outcome::FailedOpen);
        }
        Ok(Injection::MissingHead) => {
            debug!("No <head> element found, passing through");
            return InterceptedResponse::unchanged(headers, body, Outcome::FailedOpen);
        }
        Err(e) => {
            warn!(error = %e, "Failed to rewrite HTML response, passing through");
            return InterceptedResponse::unchanged(headers, body, Outcome::FailedOpen);
        }
    };

    let body = Bytes::from(rewritten);
    let mut headers = headers.clone();
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONTENT_ENCODING);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    if let Some(csp) = csp {
        match HeaderValue::from_str(&relax_csp(&csp)) {
            Ok(relaxed) => {
                headers.insert(CONTENT_SECURITY_POLICY, relaxed);
            }
            Err(e) => warn!(error = %e, "Relaxed CSP is not a valid header value, keeping original"),
        }
    }

    InterceptedResponse {
        headers,
        body,
        outcome: Outcome::Injected,
    }
}

/// All CSP header values joined with `; `, or `None` when absent.
fn joined_csp(headers: &HeaderMap) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(CONTENT_SECURITY_POLICY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join("; "))
    }
}

fn decompress(encoding: &str, body: &[u8]) -> io::Result<Vec<u8>> {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "" | "identity" => Ok(body.to_vec()),
        "gzip" | "x-gzip" => read_all(GzDecoder::new(body)),
        // Some servers send raw deflate streams without the zlib wrapper.
        "deflate" => read_all(ZlibDecoder::new(body)).or_else(|_| read_all(DeflateDecoder::new(body))),
        "br" => read_all(brotli::Decompressor::new(body, BROTLI_BUFFER_SIZE)),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported content-encoding: {other}"),
        )),
    }
}

fn read_all(mut reader: impl Read) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

enum Injection {
    Injected(String),
    AlreadyInjected,
    MissingHtml,
    MissingHead,
}

#[derive(Default)]
struct Scan {
    html: bool,
    head: bool,
    marker: bool,
}

/// Append `markup` to the first `<head>` of `html`.
fn inject(html: &str, markup: &str) -> Result<Injection, RewritingError> {
    let mut scan = Scan::default();
    let marker_selector = format!("[{}]", scripts::MARKER_ATTRIBUTE);
    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("html", |_el| {
                    scan.html = true;
                    Ok(())
                }),
                element!("head", |_el| {
                    scan.head = true;
                    Ok(())
                }),
                element!(marker_selector, |_el| {
                    scan.marker = true;
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )?;

    if !scan.html {
        return Ok(Injection::MissingHtml);
    }
    if !scan.head {
        return Ok(Injection::MissingHead);
    }
    if scan.marker {
        return Ok(Injection::AlreadyInjected);
    }

    let mut appended = false;
    let rewritten = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("head", |el| {
                if !appended {
                    el.append(markup, ContentType::Html);
                    appended = true;
                }
                Ok(())
            })],
            ..RewriteStrSettings::default()
        },
    )?;
    Ok(Injection::Injected(rewritten))
}
