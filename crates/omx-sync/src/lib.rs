//! Sync orchestration: full re-fetch extraction with snapshot merge, and the
//! watermarked pull-request search drain.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use omx_core::{
    project_pull_request, project_search_pull_request, project_workflow_run, ProjectionError,
    PullRequest, PullRequestKey, TabularRecord, EARLY_DATE,
};
use omx_github::{
    pull_request_search_query, GitHubError, GraphQlClient, PageStream, RestClient, SearchClient,
    DEFAULT_API_URL, DEFAULT_GRAPHQL_URL,
};
use omx_storage::{
    decode_csv, latest_snapshot_paths, read_json, write_records, BackoffPolicy, FetchError,
    FormatError, HttpClientConfig, HttpTransport, ReqwestTransport, RetryClient, Sleeper,
    SnapshotStore, StoredSnapshot,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "omx-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub api_base_url: String,
    pub graphql_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub backoff: BackoffPolicy,
    pub default_token: Option<String>,
    /// Keyed by [`token_env_suffix`] of the organization.
    pub org_tokens: BTreeMap<String, String>,
    pub tasks_file: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            api_base_url: DEFAULT_API_URL.to_string(),
            graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
            user_agent: "omx-sync/0.1".to_string(),
            http_timeout_secs: 20,
            backoff: BackoffPolicy::default(),
            default_token: None,
            org_tokens: BTreeMap::new(),
            tasks_file: PathBuf::from("./tasks.yaml"),
        }
    }
}

/// `opensafely-core` -> `OPENSAFELY_CORE`, as used in `GITHUB_TOKEN_<ORG>`.
pub fn token_env_suffix(org: &str) -> String {
    org.to_ascii_uppercase().replace('-', "_")
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let org_tokens = std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix("GITHUB_TOKEN_")
                    .filter(|suffix| !suffix.is_empty())
                    .map(|suffix| (suffix.to_string(), value))
            })
            .collect();

        Self {
            data_dir: std::env::var("OMX_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            api_base_url: std::env::var("OMX_GITHUB_API_URL").unwrap_or(defaults.api_base_url),
            graphql_url: std::env::var("OMX_GITHUB_GRAPHQL_URL").unwrap_or(defaults.graphql_url),
            user_agent: std::env::var("OMX_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("OMX_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            backoff: defaults.backoff,
            default_token: std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()),
            org_tokens,
            tasks_file: std::env::var("OMX_TASKS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.tasks_file),
        }
    }

    pub fn token_for(&self, org: &str) -> Option<String> {
        self.org_tokens
            .get(&token_env_suffix(org))
            .cloned()
            .or_else(|| self.default_token.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    WorkflowRuns,
    PullRequests,
    PullRequestSearch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub kind: TaskKind,
    pub orgs: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Six-field cron expression (seconds first) for `omx schedule`.
    #[serde(default)]
    pub cron: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRegistry {
    pub tasks: Vec<TaskConfig>,
}

impl TaskRegistry {
    pub fn builtin() -> Self {
        let task = |name: &str, kind, orgs: &[&str], cron: &str| TaskConfig {
            name: name.to_string(),
            kind,
            orgs: orgs.iter().map(|o| o.to_string()).collect(),
            enabled: true,
            cron: Some(cron.to_string()),
        };
        Self {
            tasks: vec![
                task("workflow_runs", TaskKind::WorkflowRuns, &["opensafely"], "0 0 5 * * *"),
                task(
                    "prs",
                    TaskKind::PullRequests,
                    &["opensafely", "opensafely-core", "ebmdatalab", "bennettoxford"],
                    "0 30 5 * * *",
                ),
                task(
                    "github",
                    TaskKind::PullRequestSearch,
                    &["opensafely-core"],
                    "0 0 * * * *",
                ),
            ],
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing task registry")?;
        let mut seen = HashSet::new();
        for task in &registry.tasks {
            if !seen.insert(task.name.as_str()) {
                bail!("duplicate task name {}", task.name);
            }
            if task.orgs.is_empty() {
                bail!("task {} lists no organizations", task.name);
            }
        }
        Ok(registry)
    }

    pub async fn load_or_builtin(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(text) => {
                Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no task registry file, using built-in tasks");
                Ok(Self::builtin())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|task| task.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// Resource families extracted by full re-fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    WorkflowRuns,
    PullRequests,
}

impl ResourceKind {
    pub fn snapshot_dir(self) -> &'static str {
        match self {
            ResourceKind::WorkflowRuns => "runs",
            ResourceKind::PullRequests => "prs",
        }
    }

    pub fn output_file(self) -> &'static str {
        match self {
            ResourceKind::WorkflowRuns => "workflow_runs.csv",
            ResourceKind::PullRequests => "prs.csv",
        }
    }

    fn listing<'a>(self, rest: &'a RestClient, org: &str, repo: &str) -> PageStream<'a> {
        match self {
            ResourceKind::WorkflowRuns => rest.workflow_runs(org, repo),
            ResourceKind::PullRequests => rest.pulls(org, repo),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractStats {
    pub repos: usize,
    pub resources: usize,
    pub snapshots_written: usize,
    pub snapshots_deduplicated: usize,
    pub failed_repos: Vec<String>,
}

impl ExtractStats {
    fn record(&mut self, stored: &StoredSnapshot) {
        if stored.deduplicated {
            self.snapshots_deduplicated += 1;
        } else {
            self.snapshots_written += 1;
        }
    }
}

/// Fetches every repository of an organization and every resource of each
/// repository, snapshotting all of it under one fetch timestamp.
pub struct FullResync<'a> {
    rest: &'a RestClient,
    store: SnapshotStore,
    kind: ResourceKind,
}

impl<'a> FullResync<'a> {
    pub fn new(rest: &'a RestClient, output_dir: impl Into<PathBuf>, kind: ResourceKind) -> Self {
        Self {
            rest,
            store: SnapshotStore::new(output_dir),
            kind,
        }
    }

    /// A repository whose resources cannot be fetched after all retries is
    /// logged and recorded in `stats`. Any other failure, including a
    /// malformed payload or a failed repository listing, aborts the extract.
    pub async fn extract(
        &self,
        org: &str,
        fetched_at: DateTime<Utc>,
        stats: &mut ExtractStats,
    ) -> Result<()> {
        let timestamp = SnapshotStore::timestamp(fetched_at);
        let mut repo_pages = self.rest.repos(org);

        while let Some(repos) = repo_pages
            .next_page()
            .await
            .with_context(|| format!("listing repositories of {org}"))?
        {
            for repo in repos {
                let name = repo
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| anyhow!("repository without a name in {org} listing"))?
                    .to_string();
                let stored = self
                    .store
                    .write_json(
                        PathBuf::from("repos")
                            .join(org)
                            .join(&timestamp)
                            .join(format!("{name}.json")),
                        &repo,
                    )
                    .await?;
                stats.record(&stored);
                stats.repos += 1;

                match self.extract_repo(org, &name, &timestamp, stats).await {
                    Ok(()) => {}
                    Err(err) if retries_exhausted(&err) => {
                        warn!(
                            org,
                            repo = %name,
                            error = %format!("{err:#}"),
                            "skipping repository after fetch failure"
                        );
                        stats.failed_repos.push(format!("{org}/{name}"));
                    }
                    Err(err) => {
                        return Err(err).with_context(|| format!("extracting {org}/{name}"));
                    }
                }
            }
        }
        Ok(())
    }

    async fn extract_repo(
        &self,
        org: &str,
        repo: &str,
        timestamp: &str,
        stats: &mut ExtractStats,
    ) -> Result<()> {
        let mut pages = self.kind.listing(self.rest, org, repo);
        while let Some(items) = pages.next_page().await? {
            for item in items {
                let id = item
                    .get("id")
                    .and_then(JsonValue::as_u64)
                    .ok_or_else(|| anyhow!("resource in {org}/{repo} has no numeric id"))?;
                let relative = PathBuf::from(self.kind.snapshot_dir())
                    .join(repo)
                    .join(timestamp)
                    .join(format!("{id}.json"));
                let stored = self.store.write_json(relative, &item).await?;
                stats.record(&stored);
                stats.resources += 1;
            }
        }
        Ok(())
    }
}

fn retries_exhausted(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<GitHubError>(),
        Some(GitHubError::Fetch(FetchError::RetriesExhausted { .. }))
    )
}

async fn export_records<R: TabularRecord>(
    paths: &[PathBuf],
    output: &Path,
    project: fn(&JsonValue) -> Result<R, ProjectionError>,
) -> Result<usize> {
    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        let raw: JsonValue = read_json(path).await?;
        records.push(project(&raw).with_context(|| format!("projecting {}", path.display()))?);
    }
    write_records(output, &records).await?;
    Ok(records.len())
}

/// Merges every historical snapshot under `output_dir` down to the latest
/// version per resource and overwrites the flat output file. Returns the
/// output path and row count.
pub async fn export_latest(output_dir: &Path, kind: ResourceKind) -> Result<(PathBuf, usize)> {
    let paths = latest_snapshot_paths(&output_dir.join(kind.snapshot_dir()))?;
    let output = output_dir.join(kind.output_file());
    let rows = match kind {
        ResourceKind::WorkflowRuns => export_records(&paths, &output, project_workflow_run).await?,
        ResourceKind::PullRequests => export_records(&paths, &output, project_pull_request).await?,
    };
    Ok((output, rows))
}

/// Ordered keyed cache. Re-inserting an existing key moves it to the end, so
/// iteration order is last-update order.
#[derive(Debug, Default)]
pub struct Aggregate {
    order: BTreeMap<u64, PullRequest>,
    positions: HashMap<PullRequestKey, u64>,
    next_seq: u64,
}

impl Aggregate {
    pub fn from_records(records: impl IntoIterator<Item = PullRequest>) -> Self {
        let mut aggregate = Self::default();
        for record in records {
            aggregate.upsert(record);
        }
        aggregate
    }

    pub fn get(&self, key: &PullRequestKey) -> Option<&PullRequest> {
        self.positions.get(key).and_then(|seq| self.order.get(seq))
    }

    pub fn upsert(&mut self, pr: PullRequest) {
        let key = pr.key();
        if let Some(seq) = self.positions.remove(&key) {
            self.order.remove(&seq);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, pr);
        self.positions.insert(key, seq);
    }

    pub fn last(&self) -> Option<&PullRequest> {
        self.order.values().next_back()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn records(&self) -> Vec<PullRequest> {
        self.order.values().cloned().collect()
    }
}

/// Reads the on-disk aggregate. A missing file is empty; a file whose columns
/// no longer match [`PullRequest`] is deleted and treated as empty, since it
/// can always be rebuilt from upstream.
pub async fn read_local_data(path: &Path) -> Result<Vec<PullRequest>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };

    match decode_csv::<PullRequest>(&bytes) {
        Ok(records) => Ok(records),
        Err(err @ (FormatError::HeaderMismatch { .. } | FormatError::Csv(_))) => {
            warn!(path = %path.display(), error = %err, "discarding local cache with stale schema");
            fs::remove_file(path)
                .await
                .with_context(|| format!("removing {}", path.display()))?;
            Ok(Vec::new())
        }
        Err(err) => Err(err).with_context(|| format!("decoding {}", path.display())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainOutcome {
    pub queries: usize,
    pub changes: usize,
    pub written: bool,
    pub watermark: String,
    pub records: usize,
}

/// Incremental pull-request sync against a search API.
///
/// The local file is ordered by update time, oldest first. Each query asks for
/// pull requests updated at or after the watermark (the last record's
/// `updated_at`), so it re-returns the tail of the previous batch; those exact
/// repeats are skipped. Queries repeat with the advancing watermark until a
/// batch changes nothing, which drains past the API's result cap. The file is
/// replaced atomically only when something changed.
pub struct PullRequestDrain<'a, C: SearchClient + ?Sized> {
    client: &'a C,
}

impl<'a, C: SearchClient + ?Sized> PullRequestDrain<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    pub async fn sync(&self, org: &str, file: &Path) -> Result<DrainOutcome> {
        let existing = read_local_data(file).await?;
        let mut since = existing
            .last()
            .map(|pr| pr.updated_at.clone())
            .unwrap_or_else(|| EARLY_DATE.to_string());
        let mut aggregate = Aggregate::from_records(existing);

        let mut queries = 0usize;
        let mut changes = 0usize;
        loop {
            let query = pull_request_search_query(org, &since);
            queries += 1;
            let nodes = self
                .client
                .search(org, &query)
                .await
                .with_context(|| {
                    format!("searching pull requests in {org} updated since {since}")
                })?;

            let mut batch_changes = 0usize;
            for node in &nodes {
                let pr = project_search_pull_request(org, node)?;
                if aggregate.get(&pr.key()) == Some(&pr) {
                    if pr.updated_at != since {
                        warn!(
                            org,
                            number = pr.number,
                            updated_at = %pr.updated_at,
                            %since,
                            "unchanged pull request outside the watermark instant"
                        );
                    }
                    continue;
                }
                since = pr.updated_at.clone();
                aggregate.upsert(pr);
                batch_changes += 1;
            }

            info!(
                org,
                query = queries,
                fetched = nodes.len(),
                changed = batch_changes,
                watermark = %since,
                "search batch merged"
            );
            changes += batch_changes;
            if batch_changes == 0 {
                break;
            }
        }

        let written = changes > 0;
        if written {
            write_records(file, &aggregate.records()).await?;
        }

        Ok(DrainOutcome {
            queries,
            changes,
            written,
            watermark: since,
            records: aggregate.len(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub task: String,
    pub kind: TaskKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resources_fetched: usize,
    pub snapshots_written: usize,
    pub records_exported: usize,
    pub failed_repos: Vec<String>,
    /// Full re-fetch: at least one snapshot had new content. Search drain: an
    /// aggregate file was rewritten.
    pub changed: bool,
    pub outputs: Vec<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: TaskRegistry,
    http: RetryClient,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, registry: TaskRegistry) -> Result<Self> {
        let transport = ReqwestTransport::new(&HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self::with_transport(config, registry, Arc::new(transport)))
    }

    pub fn with_transport(
        config: SyncConfig,
        registry: TaskRegistry,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let http = RetryClient::new(transport, config.backoff);
        Self {
            config,
            registry,
            http,
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.http = self.http.with_sleeper(sleeper);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn task_dir(&self, task: &TaskConfig) -> PathBuf {
        self.config.data_dir.join(&task.name)
    }

    pub async fn run_task(&self, name: &str) -> Result<SyncRunSummary> {
        self.run_task_at(name, Utc::now()).await
    }

    /// Runs one task with `now` as the snapshot timestamp. Runs are serialized
    /// so two never target the same output at once.
    pub async fn run_task_at(&self, name: &str, now: DateTime<Utc>) -> Result<SyncRunSummary> {
        let task = self
            .registry
            .get(name)
            .cloned()
            .with_context(|| format!("unknown task {name}"))?;
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, task = %task.name);

        async move {
            info!(kind = ?task.kind, orgs = ?task.orgs, "starting sync");
            let summary = match task.kind {
                TaskKind::WorkflowRuns => {
                    self.run_full_resync(&task, ResourceKind::WorkflowRuns, run_id, now).await
                }
                TaskKind::PullRequests => {
                    self.run_full_resync(&task, ResourceKind::PullRequests, run_id, now).await
                }
                TaskKind::PullRequestSearch => self.run_search_drain(&task, run_id, now).await,
            }?;
            info!(
                records = summary.records_exported,
                snapshots = summary.snapshots_written,
                failed_repos = summary.failed_repos.len(),
                changed = summary.changed,
                "sync complete"
            );
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    /// Runs every enabled task in registry order. A failing task does not stop
    /// the others; the call fails afterwards if any did.
    pub async fn run_enabled(&self) -> Result<Vec<SyncRunSummary>> {
        let mut summaries = Vec::new();
        let mut failed = Vec::new();
        for task in self.registry.tasks.iter().filter(|t| t.enabled) {
            match self.run_task(&task.name).await {
                Ok(summary) => summaries.push(summary),
                Err(err) => {
                    error!(task = %task.name, error = %format!("{err:#}"), "sync task failed");
                    failed.push(task.name.clone());
                }
            }
        }
        if !failed.is_empty() {
            bail!("tasks failed: {}", failed.join(", "));
        }
        Ok(summaries)
    }

    async fn run_full_resync(
        &self,
        task: &TaskConfig,
        kind: ResourceKind,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SyncRunSummary> {
        let output_dir = self.task_dir(task);
        let mut stats = ExtractStats::default();

        for org in &task.orgs {
            let rest = RestClient::new(
                self.http.clone(),
                self.config.api_base_url.clone(),
                self.config.token_for(org),
            );
            FullResync::new(&rest, &output_dir, kind)
                .extract(org, now, &mut stats)
                .instrument(info_span!("extract", org = %org))
                .await?;
        }

        let (output, rows) = export_latest(&output_dir, kind).await?;
        Ok(SyncRunSummary {
            run_id,
            task: task.name.clone(),
            kind: task.kind,
            started_at: now,
            finished_at: Utc::now(),
            resources_fetched: stats.resources,
            snapshots_written: stats.snapshots_written,
            records_exported: rows,
            changed: stats.snapshots_written > 0,
            failed_repos: stats.failed_repos,
            outputs: vec![output.display().to_string()],
        })
    }

    async fn run_search_drain(
        &self,
        task: &TaskConfig,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SyncRunSummary> {
        let tokens = task
            .orgs
            .iter()
            .filter_map(|org| self.config.token_for(org).map(|token| (org.clone(), token)))
            .collect();
        let client = GraphQlClient::new(
            self.http.clone(),
            self.config.graphql_url.clone(),
            tokens,
            self.config.user_agent.clone(),
        );

        let mut summary = SyncRunSummary {
            run_id,
            task: task.name.clone(),
            kind: task.kind,
            started_at: now,
            finished_at: now,
            resources_fetched: 0,
            snapshots_written: 0,
            records_exported: 0,
            failed_repos: Vec::new(),
            changed: false,
            outputs: Vec::new(),
        };

        for org in &task.orgs {
            let file = self.task_dir(task).join(org).join("prs.csv");
            let outcome = PullRequestDrain::new(&client)
                .sync(org, &file)
                .instrument(info_span!("drain", org = %org))
                .await?;
            summary.resources_fetched += outcome.changes;
            summary.records_exported += outcome.records;
            summary.changed |= outcome.written;
            summary.outputs.push(file.display().to_string());
        }
        summary.finished_at = Utc::now();
        Ok(summary)
    }
}

/// Builds a scheduler with one job per enabled task that carries a cron
/// expression, or `None` when there are none.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    let scheduled: Vec<(String, String)> = pipeline
        .registry()
        .tasks
        .iter()
        .filter(|task| task.enabled)
        .filter_map(|task| task.cron.clone().map(|cron| (task.name.clone(), cron)))
        .collect();
    if scheduled.is_empty() {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (name, cron) in scheduled {
        let job_pipeline = pipeline.clone();
        let job_task = name.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = job_pipeline.clone();
            let task = job_task.clone();
            Box::pin(async move {
                if let Err(err) = pipeline.run_task(&task).await {
                    error!(task = %task, error = %format!("{err:#}"), "scheduled sync failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for {name} ({cron})"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(task = %name, %cron, "scheduled task");
    }
    Ok(Some(sched))
}
