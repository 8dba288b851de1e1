//! Tools exposed to the model: web search and page reading.
//!
//! Both tools return JSON values that are fed back to the model verbatim, so
//! every field is length-bounded.

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use scout_protocol::ToolArgs;
use scout_protocol::tools::{PARSE_WEBSITE, WEB_SEARCH};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";

const MAX_TITLE_CHARS: usize = 200;
const MAX_SECTION_CHARS: usize = 1000;
const MAX_SUMMARY_CHARS: usize = 1000;
const MAX_LINKS: usize = 20;
const MIN_TEXT_CHARS: usize = 10;
const MIN_LINK_TEXT_CHARS: usize = 5;

static RESULT_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\b([^>]*\bclass="[^"]*\bresult__a\b[^"]*"[^>]*)>(.*?)</a>"#)
        .expect("valid result link regex")
});
static RESULT_SNIPPET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<(?:a|div|td)\b[^>]*\bclass="[^"]*\bresult__snippet\b[^"]*"[^>]*>(.*?)</(?:a|div|td)>"#)
        .expect("valid snippet regex")
});
static HREF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bhref\s*=\s*"([^"]*)""#).expect("valid href regex"));
static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title>").expect("valid title regex"));
static BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(h[1-3]|p|li)\b[^>]*>(.*?)</(?:h[1-3]|p|li)\s*>").expect("valid block regex")
});
static ANCHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<a\b([^>]*)>(.*?)</a>").expect("valid anchor regex"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid ws regex"));

/// Elements whose content is never useful to the model.
static NOISE_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        "script", "style", "nav", "footer", "header", "aside", "iframe", "noscript", "form",
        "button",
    ]
    .iter()
    .map(|tag| {
        Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>")).expect("valid noise regex")
    })
    .collect()
});

/// Tool execution failures.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
}

/// One web search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub snippet: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageSection {
    pub heading: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageLink {
    pub url: String,
    pub text: String,
}

/// Condensed representation of a fetched page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageSummary {
    pub url: String,
    pub title: String,
    pub summary: String,
    pub content: Vec<PageSection>,
    pub links: Vec<PageLink>,
}

/// HTTP-backed implementations of the model's tools.
#[derive(Debug, Clone)]
pub struct ToolBox {
    client: reqwest::Client,
    search_endpoint: String,
    default_max_results: usize,
}

impl ToolBox {
    pub fn new(timeout: Duration, default_max_results: usize) -> Result<Self, ToolError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            search_endpoint: SEARCH_ENDPOINT.to_string(),
            default_max_results,
        })
    }

    /// Point searches at another HTML endpoint.
    pub fn with_search_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.search_endpoint = endpoint.into();
        self
    }

    /// Tool definitions in OpenAI function-calling format.
    pub fn definitions() -> Value {
        json!([
            {
                "type": "function",
                "function": {
                    "name": WEB_SEARCH,
                    "description": "Search the web for information about a topic. Returns a list of relevant results with titles, snippets, and links.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "query": {"type": "string", "description": "Search terms"},
                            "max_results": {"type": "integer", "description": "Maximum number of results", "default": 5}
                        },
                        "required": ["query"]
                    }
                }
            },
            {
                "type": "function",
                "function": {
                    "name": PARSE_WEBSITE,
                    "description": "Read the content of a website. Input must be a valid URL. Returns the title, a summary, content sections and links.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "url": {"type": "string", "description": "Absolute http(s) URL"}
                        },
                        "required": ["url"]
                    }
                }
            }
        ])
    }

    /// Run a tool by name.
    pub async fn invoke(&self, name: &str, args: &ToolArgs) -> Result<Value, ToolError> {
        match name {
            WEB_SEARCH => {
                let query = required_str(args, "query")?;
                let max_results = args
                    .get("max_results")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(self.default_max_results)
                    .clamp(1, 20);
                let results = self.web_search(query, max_results).await?;
                Ok(serde_json::to_value(results).unwrap_or(Value::Null))
            }
            PARSE_WEBSITE => {
                let url = required_str(args, "url")?;
                let page = self.parse_website(url).await?;
                Ok(serde_json::to_value(page).unwrap_or(Value::Null))
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    pub async fn web_search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, ToolError> {
        debug!("web_search: {query:?} (max {max_results})");
        let response = self
            .client
            .get(&self.search_endpoint)
            .query(&[("q", query)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Status {
                url: self.search_endpoint.clone(),
                status: status.as_u16(),
            });
        }
        let html = response.text().await?;
        let results = parse_search_results(&html, max_results);
        if results.is_empty() {
            warn!("web_search returned no parseable results for {query:?}");
        }
        Ok(results)
    }

    pub async fn parse_website(&self, url: &str) -> Result<PageSummary, ToolError> {
        let parsed = Url::parse(url).map_err(|e| ToolError::InvalidArgs(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ToolError::InvalidArgs(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }

        debug!("parse_website: {url}");
        let response = self.client.get(parsed.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let html = response.text().await?;
        Ok(parse_page(&parsed, &html))
    }
}

fn required_str<'a>(args: &'a ToolArgs, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidArgs(format!("missing string argument '{key}'")))
}

/// Extract results from a DuckDuckGo HTML results page.
///
/// Each result link owns the markup up to the next result link; its snippet
/// is searched for only there.
pub fn parse_search_results(html: &str, max_results: usize) -> Vec<SearchResult> {
    let links: Vec<_> = RESULT_LINK_RE.captures_iter(html).collect();

    links
        .iter()
        .enumerate()
        .filter_map(|(idx, caps)| {
            let href = HREF_RE.captures(&caps[1])?.get(1)?.as_str();
            let link = resolve_redirect(&decode_entities(href))?;
            let block_start = caps.get(0)?.end();
            let block_end = links
                .get(idx + 1)
                .and_then(|next| next.get(0))
                .map_or(html.len(), |m| m.start());
            let snippet = RESULT_SNIPPET_RE
                .captures(&html[block_start..block_end])
                .map(|snippet| clean_text(&snippet[1]))
                .unwrap_or_default();
            Some(SearchResult {
                title: clean_text(&caps[2]),
                snippet,
                link,
            })
        })
        .take(max_results)
        .collect()
}

/// Unwrap `//duckduckgo.com/l/?uddg=<target>` redirect links.
fn resolve_redirect(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let url = Url::parse(&absolute).ok()?;
    if let Some((_, target)) = url.query_pairs().find(|(key, _)| key == "uddg") {
        return Some(target.into_owned());
    }
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// Condense a page into title, sections, summary and links.
pub fn parse_page(url: &Url, html: &str) -> PageSummary {
    let title = TITLE_RE
        .captures(html)
        .map(|caps| truncate_chars(&clean_text(&caps[1]), MAX_TITLE_CHARS))
        .unwrap_or_default();

    let mut body = html.to_string();
    for noise in NOISE_RES.iter() {
        body = noise.replace_all(&body, " ").into_owned();
    }

    let content = collect_sections(&body);
    let links = collect_links(url, &body);

    let all_text: Vec<&str> = content.iter().map(|s| s.content.as_str()).collect();
    let summary_source = all_text.join(" ");
    let summary = summary_source
        .split('.')
        .map(str::trim)
        .filter(|sentence| sentence.chars().count() > 20 && !sentence.contains('?'))
        .collect::<Vec<_>>()
        .join(". ");

    PageSummary {
        url: url.to_string(),
        title,
        summary: truncate_chars(&summary, MAX_SUMMARY_CHARS),
        content,
        links,
    }
}

fn collect_sections(body: &str) -> Vec<PageSection> {
    let mut sections: Vec<PageSection> = Vec::new();
    let mut seen = HashSet::new();

    for caps in BLOCK_RE.captures_iter(body) {
        let text = clean_text(&caps[2]);
        let is_heading = caps[1].to_ascii_lowercase().starts_with('h');
        if text.is_empty()
            || (!is_heading && text.chars().count() < MIN_TEXT_CHARS)
            || !seen.insert(text.clone())
        {
            continue;
        }

        if is_heading {
            sections.push(PageSection {
                heading: text,
                content: String::new(),
            });
            continue;
        }

        if sections.is_empty() {
            sections.push(PageSection {
                heading: "Main Content".to_string(),
                content: String::new(),
            });
        }
        if let Some(section) = sections.last_mut()
            && section.content.chars().count() < MAX_SECTION_CHARS
        {
            if !section.content.is_empty() {
                section.content.push(' ');
            }
            section.content.push_str(&text);
        }
    }

    sections.retain(|s| !s.content.is_empty());
    for section in &mut sections {
        section.content = truncate_chars(&section.content, MAX_SECTION_CHARS);
    }
    sections
}

fn collect_links(base: &Url, body: &str) -> Vec<PageLink> {
    let mut links = Vec::new();
    for caps in ANCHOR_RE.captures_iter(body) {
        let Some(href) = HREF_RE
            .captures(&caps[1])
            .and_then(|h| h.get(1))
            .map(|m| decode_entities(m.as_str()))
        else {
            continue;
        };
        if href.is_empty()
            || ["#", "javascript:", "mailto:", "tel:"]
                .iter()
                .any(|prefix| href.starts_with(prefix))
        {
            continue;
        }
        let text = clean_text(&caps[2]);
        if text.chars().count() < MIN_LINK_TEXT_CHARS {
            continue;
        }
        let Ok(resolved) = base.join(&href) else {
            continue;
        };
        links.push(PageLink {
            url: resolved.to_string(),
            text: truncate_chars(&text, MAX_TITLE_CHARS),
        });
        if links.len() >= MAX_LINKS {
            break;
        }
    }
    links
}

/// Strip tags, decode common entities and collapse whitespace.
fn clean_text(fragment: &str) -> String {
    let stripped = TAG_RE.replace_all(fragment, " ");
    let decoded = decode_entities(&stripped);
    WHITESPACE_RE.replace_all(decoded.trim(), " ").into_owned()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
