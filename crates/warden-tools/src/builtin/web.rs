use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use regex::Regex;
use reqwest::redirect;
use serde_json::{Value, json};
use url::Url;

use crate::{CapabilityClass, Tool, ToolContext, required_str};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_MAX_CHARS: u64 = 20_000;
const MAX_REDIRECTS: usize = 5;

static SCRIPT_OR_STYLE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").ok());
static TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"<[^>]+>").ok());
static WHITESPACE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s+").ok());

pub struct WebFetchTool {
    timeout: Duration,
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a public HTTPS page and return its readable text."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "HTTPS URL to fetch."},
                "max_chars": {"type": "integer", "description": "Maximum characters of text to return (default 20000)."}
            },
            "required": ["url"]
        })
    }

    fn capability(&self) -> CapabilityClass {
        CapabilityClass::Net
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String> {
        let url = validate_public_https(required_str(&args, "url")?)?;
        let max_chars = args
            .get("max_chars")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_CHARS) as usize;
        tracing::info!(session = %ctx.session_key, url = %url, "web_fetch");

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .redirect(redirect::Policy::custom(|attempt| {
                if attempt.previous().len() >= MAX_REDIRECTS {
                    attempt.error("too many redirects")
                } else if validate_public_https(attempt.url().as_str()).is_err() {
                    attempt.stop()
                } else {
                    attempt.follow()
                }
            }))
            .build()?;
        let mut response = client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status();
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("html"))
            .unwrap_or(false);

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            body.extend_from_slice(&chunk);
            if body.len() >= MAX_BODY_BYTES {
                body.truncate(MAX_BODY_BYTES);
                break;
            }
        }
        let raw = String::from_utf8_lossy(&body);
        let text = if is_html {
            strip_html(&raw)
        } else {
            raw.to_string()
        };
        Ok(format!(
            "status: {}\n{}",
            status.as_u16(),
            warden_core::truncate_chars(&text, max_chars)
        ))
    }
}

/// Accepts only `https` URLs whose host is not loopback, private or link-local.
pub fn validate_public_https(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid URL '{raw}'"))?;
    if url.scheme() != "https" {
        bail!("only https URLs are allowed");
    }
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("URL must include a host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_lowercase();
    if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".local") {
        bail!("local network hosts are not allowed");
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        let private = match ip {
            IpAddr::V4(v4) => {
                v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_unspecified()
                    || v4.is_broadcast()
            }
            IpAddr::V6(v6) => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    || v6.is_unique_local()
                    || v6.is_unicast_link_local()
            }
        };
        if private {
            bail!("private or loopback addresses are not allowed");
        }
    }
    Ok(url)
}

fn strip_html(html: &str) -> String {
    let mut text = html.to_string();
    if let Some(re) = SCRIPT_OR_STYLE.as_ref() {
        text = re.replace_all(&text, "").into_owned();
    }
    if let Some(re) = TAG.as_ref() {
        text = re.replace_all(&text, " ").into_owned();
    }
    text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&");
    if let Some(re) = WHITESPACE.as_ref() {
        text = re.replace_all(&text, " ").into_owned();
    }
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_https_and_private_hosts() {
        for bad in [
            "http://example.com",
            "https://localhost/admin",
            "https://127.0.0.1/",
            "https://10.0.0.8/x",
            "https://192.168.1.1",
            "https://[::1]/",
            "https://printer.local/",
            "file:///etc/passwd",
        ] {
            assert!(validate_public_https(bad).is_err(), "{bad} should be rejected");
        }
        assert!(validate_public_https("https://example.com/docs?q=1").is_ok());
    }

    #[test]
    fn html_is_reduced_to_text() {
        let html = "<html><head><style>p{}</style><script>alert(1)</script></head>\
                    <body><p>Hello&nbsp;<b>world</b> &amp; friends</p></body></html>";
        assert_eq!(strip_html(html), "Hello world & friends");
    }
}
