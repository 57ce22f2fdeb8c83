//! End-to-end routing against fake upstreams.
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use {
    bundler_catalog::namespace::wrap_resource_uri,
    bundler_config::VisibilityRule,
    bundler_mcp::types::{McpPromptDef, McpResourceDef, McpToolDef},
    bundler_router::{RouterError, RouterSettings},
    serde_json::json,
};

use common::{FakeConnector, FakeServer, Failure, local, started_router, tool_names};

fn github_and_jira(connector: &FakeConnector) {
    connector.serve("github", FakeServer::with_tools(&["create_issue", "search"]));
    connector.serve("jira", FakeServer::with_tools(&["create_issue"]));
}

#[tokio::test]
async fn tools_are_namespaced_and_forwarded_by_original_name() {
    let connector = FakeConnector::new();
    github_and_jira(&connector);
    let router = started_router(&connector, &["github", "jira"], RouterSettings::default()).await;

    let tools = router.list_tools(None).await;
    assert_eq!(tool_names(&tools), vec![
        "github__create_issue",
        "github__search",
        "jira__create_issue",
        "fetch_large_response",
    ]);

    let result = router
        .call_tool(None, "jira__create_issue", json!({"title": "x"}))
        .await
        .unwrap();
    assert_eq!(result.joined_text(), r#"jira:create_issue:{"title":"x"}"#);
    assert_eq!(connector.calls().len(), 1);
    assert_eq!(connector.calls()[0].1, "create_issue");
}

#[tokio::test]
async fn unknown_tool_is_rejected_without_dispatch() {
    let connector = FakeConnector::new();
    github_and_jira(&connector);
    let router = started_router(&connector, &["github", "jira"], RouterSettings::default()).await;

    let err = router
        .call_tool(None, "gitlab__create_issue", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::UnknownTarget { .. }));
    assert_eq!(err.code(), -32602);

    // Meta tools are not routable when the meta-tool surface is off.
    let err = router
        .call_tool(None, "search_capabilities", json!({"query": "x"}))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::UnknownTarget { .. }));
    assert!(connector.calls().is_empty());
}

#[tokio::test]
async fn hidden_aliases_are_neither_listed_nor_callable() {
    let connector = FakeConnector::new();
    github_and_jira(&connector);
    let settings = RouterSettings {
        visibility: vec![VisibilityRule {
            client: "Claude Desktop".into(),
            hide_aliases: vec!["jira".into()],
        }],
        ..RouterSettings::default()
    };
    let router = started_router(&connector, &["github", "jira"], settings).await;

    let tools = router.list_tools(Some("claudedesktop")).await;
    assert!(!tool_names(&tools).contains(&"jira__create_issue"));
    assert!(tool_names(&tools).contains(&"github__search"));

    let err = router
        .call_tool(Some("claudedesktop"), "jira__create_issue", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::UnknownTarget { .. }));

    // Other clients still see everything.
    assert!(
        router
            .call_tool(Some("cursor"), "jira__create_issue", json!({}))
            .await
            .is_ok()
    );
    assert_eq!(router.list_tools(None).await.len(), 4);
}

#[tokio::test]
async fn hidden_prompts_and_resources_are_neither_listed_nor_readable() {
    let connector = FakeConnector::new();
    connector.serve("github", FakeServer::with_tools(&["search"]));
    connector.serve("jira", FakeServer {
        prompts: Some(vec![McpPromptDef {
            name: "standup".into(),
            description: None,
            arguments: None,
        }]),
        resources: Some(vec![McpResourceDef {
            uri: "jira://board".into(),
            name: "Board".into(),
            description: None,
            mime_type: None,
        }]),
        ..FakeServer::with_tools(&["create_issue"])
    });
    let settings = RouterSettings {
        visibility: vec![VisibilityRule {
            client: "Claude Desktop".into(),
            hide_aliases: vec!["jira".into()],
        }],
        ..RouterSettings::default()
    };
    let router = started_router(&connector, &["github", "jira"], settings).await;
    let hidden_from = Some("claudedesktop");
    let board = wrap_resource_uri("jira", "jira://board");

    assert!(router.list_prompts(hidden_from).await.is_empty());
    assert!(router.list_resources(hidden_from).await.is_empty());

    let err = router
        .get_prompt(hidden_from, "jira__standup", None)
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::UnknownTarget { .. }));
    let err = router.read_resource(hidden_from, &board).await.unwrap_err();
    assert!(matches!(err, RouterError::UnknownTarget { .. }));

    assert_eq!(router.list_prompts(Some("cursor")).await.len(), 1);
    assert_eq!(router.list_resources(Some("cursor")).await.len(), 1);
    assert!(router.get_prompt(Some("cursor"), "jira__standup", None).await.is_ok());
    assert!(router.read_resource(Some("cursor"), &board).await.is_ok());
}

#[tokio::test]
async fn prompts_and_resources_route_to_their_upstream() {
    let connector = FakeConnector::new();
    connector.serve("github", FakeServer {
        tools: vec![McpToolDef::named("search")],
        prompts: Some(vec![McpPromptDef {
            name: "triage".into(),
            description: None,
            arguments: None,
        }]),
        resources: Some(vec![McpResourceDef {
            uri: "repo://readme".into(),
            name: "README".into(),
            description: None,
            mime_type: Some("text/markdown".into()),
        }]),
        dump_bytes: 0,
    });
    let router = started_router(&connector, &["github"], RouterSettings::default()).await;

    let prompts = router.list_prompts(None).await;
    assert_eq!(prompts[0].name, "github__triage");
    let prompt = router
        .get_prompt(None, "github__triage", None)
        .await
        .unwrap();
    assert_eq!(prompt.description.as_deref(), Some("github:triage"));

    let wrapped = wrap_resource_uri("github", "repo://readme");
    let resources = router.list_resources(None).await;
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].uri, wrapped);

    let read = router.read_resource(None, &wrapped).await.unwrap();
    assert_eq!(read.contents[0].uri, wrapped);
    assert_eq!(read.contents[0].text.as_deref(), Some("github:repo://readme"));

    let err = router
        .read_resource(None, "repo://readme")
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::UnknownTarget { .. }));
}

#[tokio::test]
async fn large_responses_spill_and_page_back() {
    let dir = tempfile::tempdir().unwrap();
    let connector = FakeConnector::new();
    connector.serve("github", FakeServer {
        dump_bytes: 500,
        ..FakeServer::with_tools(&["dump"])
    });
    let settings = RouterSettings {
        large_response_threshold: 100,
        spill_dir: dir.path().to_path_buf(),
        ..RouterSettings::default()
    };
    let router = started_router(&connector, &["github"], settings).await;

    let pointer = router
        .call_tool(None, "github__dump", json!({}))
        .await
        .unwrap();
    assert!(pointer.joined_text().starts_with("Response too large"));

    let entries = router.spillover().entries().await;
    assert_eq!(entries.len(), 1);
    let path = entries[0].path.to_string_lossy().into_owned();
    assert!(pointer.joined_text().contains(&path));

    let first = router
        .call_tool(
            None,
            "fetch_large_response",
            json!({"path": &path, "offset": 0, "length": 200}),
        )
        .await
        .unwrap();
    assert_eq!(first.joined_text().len(), 200);
    assert_eq!(first.structured_content.as_ref().unwrap()["eof"], false);

    let rest = router
        .call_tool(None, "fetch_large_response", json!({"path": &path, "offset": 400}))
        .await
        .unwrap();
    assert_eq!(rest.joined_text().len(), 100);
    assert_eq!(rest.structured_content.as_ref().unwrap()["eof"], true);
    assert_eq!(rest.structured_content.as_ref().unwrap()["totalBytes"], 500);

    // Spilled files are listed and readable as resources.
    let resources = router.list_resources(None).await;
    let uri = entries[0].uri();
    assert!(resources.iter().any(|r| r.uri == uri));
    let read = router.read_resource(None, &uri).await.unwrap();
    assert_eq!(read.contents[0].text.as_ref().unwrap().len(), 500);
}

#[tokio::test]
async fn response_at_threshold_stays_inline() {
    let dir = tempfile::tempdir().unwrap();
    let connector = FakeConnector::new();
    connector.serve("github", FakeServer {
        dump_bytes: 100,
        ..FakeServer::with_tools(&["dump"])
    });
    let settings = RouterSettings {
        large_response_threshold: 100,
        spill_dir: dir.path().to_path_buf(),
        ..RouterSettings::default()
    };
    let router = started_router(&connector, &["github"], settings).await;

    let result = router
        .call_tool(None, "github__dump", json!({}))
        .await
        .unwrap();
    assert_eq!(result.joined_text(), "x".repeat(100));
    assert!(router.spillover().entries().await.is_empty());
}

#[tokio::test]
async fn fetch_outside_temp_roots_is_refused() {
    let connector = FakeConnector::new();
    let router = started_router(&connector, &[], RouterSettings::default()).await;

    let err = router
        .call_tool(None, "fetch_large_response", json!({"path": "/etc"}))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::PathNotAllowed { .. }));

    let err = router
        .call_tool(None, "fetch_large_response", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::InvalidParams(_)));
}

#[tokio::test]
async fn meta_tools_replace_the_flat_listing() {
    let connector = FakeConnector::new();
    github_and_jira(&connector);
    let settings = RouterSettings {
        meta_tools: true,
        ..RouterSettings::default()
    };
    let router = started_router(&connector, &["github", "jira"], settings).await;

    assert_eq!(tool_names(&router.list_tools(None).await), vec![
        "search_capabilities",
        "call_capability",
        "fetch_large_response",
    ]);

    let found = router
        .call_tool(None, "search_capabilities", json!({"query": "create issue"}))
        .await
        .unwrap();
    let body = found.structured_content.unwrap();
    assert_eq!(body["total"], 2);
    assert_eq!(body["tools"][0]["name"], "github__create_issue");

    let limited = router
        .call_tool(None, "search_capabilities", json!({"query": "", "limit": 1}))
        .await
        .unwrap();
    let body = limited.structured_content.unwrap();
    assert_eq!(body["total"], 3);
    assert_eq!(body["tools"].as_array().unwrap().len(), 1);

    let called = router
        .call_tool(
            None,
            "call_capability",
            json!({"name": "jira__create_issue", "arguments": {"title": "t"}}),
        )
        .await
        .unwrap();
    assert_eq!(called.joined_text(), r#"jira:create_issue:{"title":"t"}"#);

    let err = router
        .call_tool(
            None,
            "call_capability",
            json!({"name": "search_capabilities"}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::InvalidParams(_)));
}

#[tokio::test]
async fn stale_session_reconnects_and_retries_once() {
    let connector = FakeConnector::new();
    github_and_jira(&connector);
    let router = started_router(&connector, &["github"], RouterSettings::default()).await;
    assert_eq!(connector.connects("github"), 1);

    connector.fail_next("github", Failure::StaleSession);
    let result = router
        .call_tool(None, "github__search", json!({"q": "bug"}))
        .await
        .unwrap();
    assert_eq!(result.joined_text(), r#"github:search:{"q":"bug"}"#);
    assert_eq!(connector.connects("github"), 2);
    assert_eq!(connector.calls().len(), 1);
    assert!(!router.statuses().await[0].restarting);
}

#[tokio::test]
async fn repeated_stale_session_marks_alias_restarting() {
    let connector = FakeConnector::new();
    github_and_jira(&connector);
    let router = started_router(&connector, &["github"], RouterSettings::default()).await;

    connector.fail_next("github", Failure::StaleSession);
    connector.fail_next("github", Failure::StaleSession);
    let err = router
        .call_tool(None, "github__search", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Connection { .. }));
    assert_eq!(connector.connects("github"), 2);
    assert!(router.statuses().await[0].restarting);

    // The next successful call clears the mark.
    router
        .call_tool(None, "github__search", json!({}))
        .await
        .unwrap();
    assert!(!router.statuses().await[0].restarting);
}

#[tokio::test]
async fn calls_during_restart_report_restarting() {
    let connector = FakeConnector::new();
    github_and_jira(&connector);
    let router = started_router(&connector, &["github", "jira"], RouterSettings::default()).await;

    connector.fail_next("github", Failure::Disconnected);
    let err = router
        .call_tool(None, "github__search", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Connection { .. }));

    connector.refuse("github");
    let err = router
        .call_tool(None, "github__search", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Restarting { .. }));
    assert_eq!(err.code(), -32001);

    // Other upstreams are unaffected.
    router
        .call_tool(None, "jira__create_issue", json!({}))
        .await
        .unwrap();

    connector.accept("github");
    router
        .call_tool(None, "github__search", json!({}))
        .await
        .unwrap();
    let statuses = router.statuses().await;
    assert!(statuses.iter().all(|s| !s.restarting));
}

#[tokio::test]
async fn upstream_rpc_errors_keep_the_connection() {
    let connector = FakeConnector::new();
    github_and_jira(&connector);
    let router = started_router(&connector, &["github"], RouterSettings::default()).await;

    connector.fail_next("github", Failure::Rpc);
    let err = router
        .call_tool(None, "github__search", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Upstream { .. }));
    assert!(err.to_string().contains("rate limited"));
    assert!(!router.statuses().await[0].restarting);

    router
        .call_tool(None, "github__search", json!({}))
        .await
        .unwrap();
    assert_eq!(connector.connects("github"), 1);
}

#[tokio::test]
async fn failing_upstream_is_left_out_of_the_snapshot() {
    let connector = FakeConnector::new();
    github_and_jira(&connector);
    connector.refuse("jira");
    let router = started_router(&connector, &["github", "jira"], RouterSettings::default()).await;

    let tools = router.list_tools(None).await;
    assert_eq!(tool_names(&tools), vec![
        "github__create_issue",
        "github__search",
        "fetch_large_response",
    ]);

    connector.accept("jira");
    let outcome = router.refresh().await.unwrap();
    assert!(outcome.failed_upstreams.is_empty());
    assert_eq!(router.list_tools(None).await.len(), 4);
}

#[tokio::test]
async fn left_out_upstream_rejoins_once_reachable() {
    let connector = FakeConnector::new();
    github_and_jira(&connector);
    connector.refuse("jira");
    let settings = RouterSettings {
        recovery_backoff: vec![Duration::from_millis(20)],
        ..RouterSettings::default()
    };
    let router = started_router(&connector, &["github", "jira"], settings).await;
    assert_eq!(router.missing_upstreams(), vec!["jira".to_string()]);
    let mut revisions = router.subscribe_revisions();
    let before = router.revision();

    // Still refused: probing goes on without rebuilding.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(router.revision(), before);
    assert!(connector.connects("jira") > 1);

    connector.accept("jira");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !router.missing_upstreams().is_empty() {
            revisions.changed().await.unwrap();
        }
    })
    .await
    .expect("jira rejoins the snapshot");

    assert!(router.revision() > before);
    assert!(
        tool_names(&router.list_tools(None).await).contains(&"jira__create_issue")
    );
    router.shutdown().await;
}

#[tokio::test]
async fn project_edits_rebuild_and_bump_the_revision() {
    let connector = FakeConnector::new();
    github_and_jira(&connector);
    let router = started_router(&connector, &["github"], RouterSettings::default()).await;
    let revisions = router.subscribe_revisions();
    let before = router.revision();

    let outcome = router.add_upstream(local("jira")).await.unwrap();
    assert!(outcome.rebuilt);
    assert!(router.revision() > before);
    assert!(revisions.has_changed().unwrap());
    assert!(
        tool_names(&router.list_tools(None).await).contains(&"jira__create_issue")
    );

    let err = router.add_upstream(local("jira")).await.unwrap_err();
    assert!(matches!(err, RouterError::Catalog(_)));

    router.remove_upstream("jira").await.unwrap();
    assert!(
        !tool_names(&router.list_tools(None).await).contains(&"jira__create_issue")
    );
    assert_eq!(router.statuses().await.len(), 1);
}
