mod common;

use std::sync::Arc;

use common::{at, pipeline, task, RoutedTransport, API};
use omx_core::WorkflowRunRecord;
use omx_storage::decode_csv;
use omx_sync::TaskKind;
use serde_json::{json, Value as JsonValue};
use tempfile::tempdir;

fn run(id: u64, repo: &str, conclusion: &str) -> JsonValue {
    json!({
        "id": id,
        "name": "Tests",
        "head_sha": format!("sha{id}"),
        "status": "completed",
        "conclusion": conclusion,
        "created_at": "2025-01-01T00:00:00Z",
        "updated_at": "2025-01-01T00:10:00Z",
        "run_started_at": "2025-01-01T00:01:00Z",
        "repository": {"name": repo},
    })
}

fn route_repos(transport: &RoutedTransport) {
    let page2 = format!("{API}/orgs/test-org/repos?per_page=100&format=json&page=2");
    transport.route(
        &format!("{API}/orgs/test-org/repos"),
        json!([{"name": "repo_1"}]),
        Some(&page2),
    );
    transport.route(&page2, json!([{"name": "repo_2"}]), None);
}

#[tokio::test]
async fn workflow_runs_are_snapshotted_and_exported() {
    let dir = tempdir().expect("tempdir");
    let transport = Arc::new(RoutedTransport::default());
    route_repos(&transport);
    let runs_page2 =
        format!("{API}/repos/test-org/repo_1/actions/runs?per_page=100&format=json&page=2");
    transport.route(
        &format!("{API}/repos/test-org/repo_1/actions/runs"),
        json!({"total_count": 2, "workflow_runs": [run(1, "repo_1", "success")]}),
        Some(&runs_page2),
    );
    transport.route(
        &runs_page2,
        json!({"total_count": 2, "workflow_runs": [run(2, "repo_1", "failure")]}),
        None,
    );
    transport.route(
        &format!("{API}/repos/test-org/repo_2/actions/runs"),
        json!({"total_count": 0, "workflow_runs": []}),
        None,
    );

    let pipeline = pipeline(
        dir.path(),
        vec![task("workflow_runs", TaskKind::WorkflowRuns, &["test-org"])],
        transport.clone(),
    );
    let summary = pipeline
        .run_task_at("workflow_runs", at(2025, 1, 1))
        .await
        .expect("sync succeeds");

    let out = dir.path().join("workflow_runs");
    assert!(out.join("repos/test-org/20250101-000000/repo_1.json").exists());
    assert!(out.join("repos/test-org/20250101-000000/repo_2.json").exists());
    assert!(out.join("runs/repo_1/20250101-000000/1.json").exists());
    assert!(out.join("runs/repo_1/20250101-000000/2.json").exists());
    assert!(!out.join("runs/repo_2").exists());

    let csv = std::fs::read_to_string(out.join("workflow_runs.csv")).unwrap();
    assert!(csv.starts_with(
        "id,repo,name,head_sha,status,conclusion,created_at,updated_at,run_started_at\n"
    ));
    let rows: Vec<WorkflowRunRecord> = decode_csv(csv.as_bytes()).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.repo == "repo_1"));

    assert_eq!(summary.resources_fetched, 2);
    assert_eq!(summary.records_exported, 2);
    assert!(summary.failed_repos.is_empty());
    assert!(summary.changed);

    let first = &transport.requests()[0];
    assert!(first.query.contains(&("per_page".to_string(), "100".to_string())));
    assert!(first
        .headers
        .contains(&("Authorization".to_string(), "Bearer test_token".to_string())));
}

#[tokio::test]
async fn later_snapshots_replace_earlier_rows() {
    let dir = tempdir().expect("tempdir");
    let transport = Arc::new(RoutedTransport::default());
    let runs_url = format!("{API}/repos/test-org/repo_1/actions/runs");
    for conclusion in ["failure", "success"] {
        transport.route(&format!("{API}/orgs/test-org/repos"), json!([{"name": "repo_1"}]), None);
        transport.route(&runs_url, json!({"workflow_runs": [run(7, "repo_1", conclusion)]}), None);
    }

    let pipeline = pipeline(
        dir.path(),
        vec![task("runs", TaskKind::WorkflowRuns, &["test-org"])],
        transport,
    );
    pipeline.run_task_at("runs", at(2025, 1, 1)).await.unwrap();
    pipeline.run_task_at("runs", at(2025, 1, 2)).await.unwrap();

    let out = dir.path().join("runs");
    assert!(out.join("runs/repo_1/20250101-000000/7.json").exists());
    assert!(out.join("runs/repo_1/20250102-000000/7.json").exists());

    let rows: Vec<WorkflowRunRecord> =
        decode_csv(&std::fs::read(out.join("workflow_runs.csv")).unwrap()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].conclusion, "success");
}

#[tokio::test]
async fn rest_pull_requests_export_with_empty_nulls() {
    let dir = tempdir().expect("tempdir");
    let transport = Arc::new(RoutedTransport::default());
    transport.route(&format!("{API}/orgs/test-org/repos"), json!([{"name": "repo_1"}]), None);
    transport.route(
        &format!("{API}/repos/test-org/repo_1/pulls"),
        json!([{
            "id": 7,
            "base": {"repo": {"name": "repo_1"}},
            "user": {"login": "alice"},
            "created_at": "2025-01-01T00:00:00Z",
            "merged_at": null,
            "updated_at": "2025-01-02T00:00:00Z",
            "closed_at": null,
            "state": "open",
            "draft": false,
        }]),
        None,
    );

    let pipeline = pipeline(
        dir.path(),
        vec![task("prs", TaskKind::PullRequests, &["test-org"])],
        transport.clone(),
    );
    pipeline.run_task_at("prs", at(2025, 1, 3)).await.unwrap();

    let out = dir.path().join("prs");
    assert!(out.join("prs/repo_1/20250103-000000/7.json").exists());
    assert_eq!(
        std::fs::read_to_string(out.join("prs.csv")).unwrap(),
        "id,repo,author,created_at,merged_at,updated_at,closed_at,state,draft\n\
         7,repo_1,alice,2025-01-01T00:00:00Z,,2025-01-02T00:00:00Z,,open,false\n"
    );

    let pulls = transport
        .requests()
        .into_iter()
        .find(|r| r.url.ends_with("/pulls"))
        .unwrap();
    assert!(pulls.query.contains(&("state".to_string(), "all".to_string())));
}

#[tokio::test]
async fn failing_repository_is_skipped() {
    let dir = tempdir().expect("tempdir");
    let transport = Arc::new(RoutedTransport::default());
    route_repos(&transport);
    transport.route(
        &format!("{API}/repos/test-org/repo_1/actions/runs"),
        json!({"workflow_runs": [run(1, "repo_1", "success")]}),
        None,
    );
    // repo_2 is unrouted and answers 404 on every attempt

    let pipeline = pipeline(
        dir.path(),
        vec![task("workflow_runs", TaskKind::WorkflowRuns, &["test-org"])],
        transport.clone(),
    );
    let summary = pipeline
        .run_task_at("workflow_runs", at(2025, 1, 1))
        .await
        .expect("per-repo failures do not abort the run");

    assert_eq!(summary.failed_repos, vec!["test-org/repo_2".to_string()]);
    assert_eq!(summary.records_exported, 1);
    let attempts = transport
        .requests()
        .iter()
        .filter(|r| r.url.ends_with("repo_2/actions/runs"))
        .count();
    assert_eq!(attempts, 4);
}

#[tokio::test]
async fn repository_listing_failure_fails_the_run() {
    let dir = tempdir().expect("tempdir");
    let pipeline = pipeline(
        dir.path(),
        vec![task("workflow_runs", TaskKind::WorkflowRuns, &["test-org"])],
        Arc::new(RoutedTransport::default()),
    );
    assert!(pipeline.run_task_at("workflow_runs", at(2025, 1, 1)).await.is_err());
    assert!(!dir.path().join("workflow_runs/workflow_runs.csv").exists());
}

#[tokio::test]
async fn unknown_task_is_an_error() {
    let dir = tempdir().expect("tempdir");
    let pipeline = pipeline(dir.path(), Vec::new(), Arc::new(RoutedTransport::default()));
    assert!(pipeline.run_task("missing").await.is_err());
}

fn pull(id: u64, repo: &str) -> JsonValue {
    json!({
        "id": id,
        "base": {"repo": {"name": repo}},
        "user": {"login": "alice"},
        "created_at": "2025-01-01T00:00:00Z",
        "merged_at": null,
        "updated_at": "2025-01-02T00:00:00Z",
        "closed_at": null,
        "state": "open",
        "draft": false,
    })
}

#[tokio::test]
async fn wrong_page_shape_fails_the_run() {
    let dir = tempdir().expect("tempdir");
    let transport = Arc::new(RoutedTransport::default());
    transport.route(&format!("{API}/orgs/test-org/repos"), json!([{"name": "repo_1"}]), None);
    transport.route(
        &format!("{API}/repos/test-org/repo_1/actions/runs"),
        json!([{"id": 1}]),
        None,
    );

    let pipeline = pipeline(
        dir.path(),
        vec![task("workflow_runs", TaskKind::WorkflowRuns, &["test-org"])],
        transport,
    );
    assert!(pipeline.run_task_at("workflow_runs", at(2025, 1, 1)).await.is_err());
    assert!(!dir.path().join("workflow_runs/workflow_runs.csv").exists());
}

#[tokio::test]
async fn resource_without_id_fails_the_run() {
    let dir = tempdir().expect("tempdir");
    let transport = Arc::new(RoutedTransport::default());
    transport.route(&format!("{API}/orgs/test-org/repos"), json!([{"name": "repo_1"}]), None);
    let mut unkeyed = run(1, "repo_1", "success");
    unkeyed.as_object_mut().unwrap().remove("id");
    transport.route(
        &format!("{API}/repos/test-org/repo_1/actions/runs"),
        json!({"workflow_runs": [unkeyed]}),
        None,
    );

    let pipeline = pipeline(
        dir.path(),
        vec![task("workflow_runs", TaskKind::WorkflowRuns, &["test-org"])],
        transport,
    );
    assert!(pipeline.run_task_at("workflow_runs", at(2025, 1, 1)).await.is_err());
    assert!(!dir.path().join("workflow_runs/workflow_runs.csv").exists());
}

#[tokio::test]
async fn same_repo_name_in_two_orgs_keeps_both_snapshots() {
    let dir = tempdir().expect("tempdir");
    let transport = Arc::new(RoutedTransport::default());
    for (org, id) in [("org-a", 1), ("org-b", 2)] {
        transport.route(
            &format!("{API}/orgs/{org}/repos"),
            json!([{"name": ".github", "owner": {"login": org}}]),
            None,
        );
        transport.route(
            &format!("{API}/repos/{org}/.github/pulls"),
            json!([pull(id, ".github")]),
            None,
        );
    }

    let pipeline = pipeline(
        dir.path(),
        vec![task("prs", TaskKind::PullRequests, &["org-a", "org-b"])],
        transport,
    );
    let summary = pipeline.run_task_at("prs", at(2025, 1, 1)).await.unwrap();

    let out = dir.path().join("prs");
    for org in ["org-a", "org-b"] {
        let path = out.join("repos").join(org).join("20250101-000000/.github.json");
        let snapshot: JsonValue = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(snapshot["owner"]["login"], org);
    }
    assert_eq!(summary.snapshots_written, 4);
    assert_eq!(summary.records_exported, 2);
}

#[tokio::test]
async fn identical_rerun_reports_no_change() {
    let dir = tempdir().expect("tempdir");
    let transport = Arc::new(RoutedTransport::default());
    for _ in 0..2 {
        transport.route(&format!("{API}/orgs/test-org/repos"), json!([{"name": "repo_1"}]), None);
        transport.route(
            &format!("{API}/repos/test-org/repo_1/pulls"),
            json!([pull(7, "repo_1")]),
            None,
        );
    }

    let pipeline = pipeline(
        dir.path(),
        vec![task("prs", TaskKind::PullRequests, &["test-org"])],
        transport,
    );
    let first = pipeline.run_task_at("prs", at(2025, 1, 1)).await.unwrap();
    let second = pipeline.run_task_at("prs", at(2025, 1, 1)).await.unwrap();

    assert!(first.changed);
    assert!(!second.changed);
    assert_eq!(second.snapshots_written, 0);
    assert_eq!(second.records_exported, 1);
}
