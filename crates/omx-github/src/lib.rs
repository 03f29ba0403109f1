//! GitHub REST pagination and GraphQL search on top of the retrying client.

use std::collections::BTreeMap;

use async_trait::async_trait;
use omx_storage::{FetchError, HttpRequest, RetryClient};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "omx-github";

pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_GRAPHQL_URL: &str = "https://api.github.com/graphql";

/// Query parameters applied to every REST page request.
const STANDARD_QUERY: [(&str, &str); 2] = [("per_page", "100"), ("format", "json")];

/// Pull requests in `%ORG%` updated at or after `%SINCE%`, oldest update first.
pub const PR_SEARCH_QUERY: &str = r#"
query prs($cursor: String) {
  search(
    query: "org:%ORG% is:pr sort:updated-asc updated:>=%SINCE%"
    type: ISSUE
    first: 100
    after: $cursor
  ) {
    nodes {
      ... on PullRequest {
        repository {
          name
        }
        number
        author {
          login
        }
        createdAt
        updatedAt
        closedAt
        mergedAt
        isDraft
      }
    }
    pageInfo {
      endCursor
      hasNextPage
    }
  }
}
"#;

pub fn pull_request_search_query(org: &str, since: &str) -> String {
    PR_SEARCH_QUERY
        .replace("%ORG%", org)
        .replace("%SINCE%", since)
}

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected page from {url}: expected {expected}")]
    PageShape { url: String, expected: String },
    #[error("GraphQL query failed\n\nQuery: {query}\nResponse:\n{response}")]
    QueryFailed { query: String, response: String },
    #[error("no token configured for organization {0}")]
    MissingToken(String),
    #[error("search pagination stalled at cursor {0:?}")]
    StalledCursor(Option<String>),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Where the resources live inside a page payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageShape {
    Array,
    Envelope(&'static str),
}

impl PageShape {
    pub fn extract(&self, url: &str, page: JsonValue) -> Result<Vec<JsonValue>, GitHubError> {
        let items = match (self, page) {
            (PageShape::Array, JsonValue::Array(items)) => Some(items),
            (PageShape::Envelope(key), JsonValue::Object(mut object)) => match object.remove(*key) {
                Some(JsonValue::Array(items)) => Some(items),
                _ => None,
            },
            _ => None,
        };
        items.ok_or_else(|| GitHubError::PageShape {
            url: url.to_string(),
            expected: match self {
                PageShape::Array => "a JSON array".to_string(),
                PageShape::Envelope(key) => format!("an object with a `{key}` array"),
            },
        })
    }
}

/// Extracts the `rel="next"` target from an RFC 8288 `Link` header.
pub fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|link| {
        let mut parts = link.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|param| {
            let param = param.trim();
            param == r#"rel="next""# || param == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')?
            .strip_suffix('>')
            .map(str::to_string)
    })
}

fn url_has_param(url: &str, name: &str) -> bool {
    url.split_once('?')
        .map(|(_, query)| query.split('&').any(|pair| pair.split('=').next() == Some(name)))
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct RestClient {
    http: RetryClient,
    api_base_url: String,
    token: Option<String>,
}

impl RestClient {
    pub fn new(http: RetryClient, api_base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn repos(&self, org: &str) -> PageStream<'_> {
        self.pages(
            format!("{}/orgs/{org}/repos", self.api_base_url),
            &[],
            PageShape::Array,
        )
    }

    pub fn workflow_runs(&self, org: &str, repo: &str) -> PageStream<'_> {
        self.pages(
            format!("{}/repos/{org}/{repo}/actions/runs", self.api_base_url),
            &[],
            PageShape::Envelope("workflow_runs"),
        )
    }

    pub fn pulls(&self, org: &str, repo: &str) -> PageStream<'_> {
        self.pages(
            format!("{}/repos/{org}/{repo}/pulls", self.api_base_url),
            &[("state", "all")],
            PageShape::Array,
        )
    }

    /// Starts a fresh forward traversal at `first_url`. Nothing is fetched
    /// until [`PageStream::next_page`] is awaited.
    pub fn pages(
        &self,
        first_url: String,
        extra_query: &[(&str, &str)],
        shape: PageShape,
    ) -> PageStream<'_> {
        PageStream {
            client: self,
            next_url: Some(first_url),
            extra_query: extra_query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            shape,
            pages_fetched: 0,
        }
    }

    fn request(&self, url: &str, extra_query: &[(String, String)]) -> HttpRequest {
        let mut request = HttpRequest::get(url).header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let params = STANDARD_QUERY
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .chain(extra_query.iter().cloned());
        for (name, value) in params {
            // next-page links already carry the original query string
            if !url_has_param(url, &name) {
                request = request.query(name, value);
            }
        }
        request
    }
}

/// Lazy, single forward traversal of a `Link`-paginated listing.
pub struct PageStream<'a> {
    client: &'a RestClient,
    next_url: Option<String>,
    extra_query: Vec<(String, String)>,
    shape: PageShape,
    pages_fetched: usize,
}

impl PageStream<'_> {
    /// Fetches the next page's resources, or `None` once the previous page
    /// carried no `rel="next"` link.
    pub async fn next_page(&mut self) -> Result<Option<Vec<JsonValue>>, GitHubError> {
        let Some(url) = self.next_url.take() else {
            return Ok(None);
        };
        let request = self.client.request(&url, &self.extra_query);
        let response = self.client.http.fetch_with_retry(&request).await?;
        self.next_url = response.header("link").and_then(parse_next_link);
        let page: JsonValue = response.json()?;
        self.pages_fetched += 1;
        debug!(
            url = %url,
            page = self.pages_fetched,
            has_next = self.next_url.is_some(),
            "fetched page"
        );
        self.shape.extract(&url, page).map(Some)
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub async fn collect_all(mut self) -> Result<Vec<JsonValue>, GitHubError> {
        let mut all = Vec::new();
        while let Some(items) = self.next_page().await? {
            all.extend(items);
        }
        Ok(all)
    }
}

/// Runs an organization-scoped search and returns every node it yields.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, org: &str, query: &str) -> anyhow::Result<Vec<JsonValue>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPage {
    nodes: Vec<JsonValue>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

/// GitHub signals GraphQL failure in several ways, not all of which involve
/// the HTTP status.
pub fn check_results(results: &JsonValue, query: &str) -> Result<(), GitHubError> {
    let search_missing = results
        .pointer("/data/search")
        .map_or(true, JsonValue::is_null);
    let has_errors = match results.get("errors") {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::Array(errors)) => !errors.is_empty(),
        Some(_) => true,
    };
    if search_missing || has_errors {
        return Err(GitHubError::QueryFailed {
            query: query.to_string(),
            response: serde_json::to_string_pretty(results)?,
        });
    }
    Ok(())
}

#[derive(Clone)]
pub struct GraphQlClient {
    http: RetryClient,
    url: String,
    tokens: BTreeMap<String, String>,
    user_agent: String,
}

impl GraphQlClient {
    pub fn new(
        http: RetryClient,
        url: impl Into<String>,
        tokens: BTreeMap<String, String>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            tokens,
            user_agent: user_agent.into(),
        }
    }

    async fn query_page(
        &self,
        org: &str,
        query: &str,
        cursor: Option<&str>,
    ) -> Result<SearchPage, GitHubError> {
        let token = self
            .tokens
            .get(org)
            .ok_or_else(|| GitHubError::MissingToken(org.to_string()))?;
        let request = HttpRequest::post_json(
            &self.url,
            &json!({"query": query, "variables": {"cursor": cursor}}),
        )?
        .header("Authorization", format!("bearer {token}"))
        .header("User-Agent", self.user_agent.clone());

        let response = self.http.fetch_with_retry(&request).await?;
        let mut results: JsonValue = response.json()?;
        check_results(&results, query)?;
        let search = results
            .pointer_mut("/data/search")
            .map(JsonValue::take)
            .unwrap_or_default();
        Ok(serde_json::from_value(search)?)
    }
}

#[async_trait]
impl SearchClient for GraphQlClient {
    async fn search(&self, org: &str, query: &str) -> anyhow::Result<Vec<JsonValue>> {
        let mut nodes = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.query_page(org, query, cursor.as_deref()).await?;
            nodes.extend(page.nodes);
            if !page.page_info.has_next_page {
                break;
            }
            if page.page_info.end_cursor.is_none() || page.page_info.end_cursor == cursor {
                return Err(GitHubError::StalledCursor(page.page_info.end_cursor).into());
            }
            cursor = page.page_info.end_cursor;
        }
        debug!(org, nodes = nodes.len(), "search drained");
        Ok(nodes)
    }
}
