#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use omx_storage::{FetchError, HttpRequest, HttpResponse, HttpTransport, Sleeper};
use omx_sync::{SyncConfig, SyncPipeline, TaskConfig, TaskKind, TaskRegistry};
use serde_json::Value as JsonValue;

pub const API: &str = "https://api.test";
pub const GRAPHQL: &str = "https://graphql.test";

/// Serves queued responses per exact URL; unrouted URLs answer 404.
#[derive(Default)]
pub struct RoutedTransport {
    routes: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl RoutedTransport {
    pub fn route(&self, url: &str, body: JsonValue, next: Option<&str>) {
        let headers = next
            .map(|n| vec![("Link".to_string(), format!(r#"<{n}>; rel="next""#))])
            .unwrap_or_default();
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(HttpResponse {
                status: 200,
                url: url.to_string(),
                headers,
                body: serde_json::to_vec(&body).unwrap(),
            });
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for RoutedTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        self.requests.lock().unwrap().push(request.clone());
        let response = self
            .routes
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(VecDeque::pop_front);
        Ok(response.unwrap_or(HttpResponse {
            status: 404,
            url: request.url.clone(),
            headers: Vec::new(),
            body: Vec::new(),
        }))
    }
}

pub struct NoSleep;

#[async_trait]
impl Sleeper for NoSleep {
    async fn sleep(&self, _duration: Duration) {}
}

pub fn at(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).unwrap()
}

pub fn task(name: &str, kind: TaskKind, orgs: &[&str]) -> TaskConfig {
    TaskConfig {
        name: name.to_string(),
        kind,
        orgs: orgs.iter().map(|o| o.to_string()).collect(),
        enabled: true,
        cron: None,
    }
}

pub fn pipeline(
    data_dir: &Path,
    tasks: Vec<TaskConfig>,
    transport: Arc<RoutedTransport>,
) -> SyncPipeline {
    let config = SyncConfig {
        data_dir: data_dir.to_path_buf(),
        api_base_url: API.to_string(),
        graphql_url: GRAPHQL.to_string(),
        default_token: Some("test_token".to_string()),
        ..SyncConfig::default()
    };
    SyncPipeline::with_transport(config, TaskRegistry { tasks }, transport)
        .with_sleeper(Arc::new(NoSleep))
}
