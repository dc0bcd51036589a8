//! Web fetch tool (the other half of C4): validates and runs via C3.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Method;

use cagebox_fetch::{FetchError, FetchOptions};

use crate::{Tool, ToolContext, ToolOutput, ToolParam, ToolResultMeta, ToolSpec};

pub struct WebFetchTool {
    pub opts: FetchOptions,
}

#[async_trait]
impl Tool for WebFetchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web-fetch".to_string(),
            description: "Fetch an http(s) URL from the host, outside the sandbox container. \
                Requests to private, loopback, link-local, and multicast address ranges are \
                rejected, as are redirects into them."
                .to_string(),
            params: vec![
                ToolParam {
                    name: "url".to_string(),
                    description: "Absolute http:// or https:// URL.".to_string(),
                    required: true,
                },
                ToolParam {
                    name: "method".to_string(),
                    description: "HTTP method, default GET.".to_string(),
                    required: false,
                },
            ],
        }
    }

    async fn run(&self, args: &HashMap<String, String>, _ctx: &ToolContext) -> Result<ToolOutput> {
        let url = args
            .get("url")
            .ok_or_else(|| anyhow::anyhow!("missing required param: url"))?;

        let method = match args.get("method") {
            Some(m) => match Method::from_str(&m.to_ascii_uppercase()) {
                Ok(m) => m,
                Err(_) => {
                    return Ok(ToolOutput::error(
                        "BadMethod",
                        format!("unrecognized HTTP method: {m}"),
                    ))
                }
            },
            None => Method::GET,
        };

        match cagebox_fetch::fetch(url, method, None, None, &self.opts).await {
            Ok(result) => {
                let output = String::from_utf8_lossy(&result.body).to_string();
                Ok(ToolOutput {
                    success: true,
                    output,
                    error_kind: None,
                    meta: ToolResultMeta {
                        exit_code: Some(result.status as i32),
                        duration_ms: None,
                        truncated: result.truncated,
                    },
                })
            }
            Err(err) => Ok(ToolOutput::error(fetch_error_kind(&err), err.to_string())),
        }
    }
}

fn fetch_error_kind(err: &FetchError) -> &'static str {
    match err {
        FetchError::BadScheme => "BadScheme",
        FetchError::BadUrl => "BadUrl",
        FetchError::DnsFailed => "DnsFailed",
        FetchError::BlockedAddress => "BlockedAddress",
        FetchError::RedirectBlocked(_) => "RedirectBlocked",
        FetchError::FetchTimeout => "FetchTimeout",
        FetchError::HttpError(_) => "HttpError",
    }
}
