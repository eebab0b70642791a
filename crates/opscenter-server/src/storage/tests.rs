//! Storage layer tests for the fleet database.

use opscenter_core::db::unix_timestamp;

use super::db::{DatabaseError, FleetDatabase};
use super::models::{
    ClusterStatus, ClusterUpdate, InventoryFilter, NewArtifact, NewArtifactFile, NewCluster,
    NewInventoryRecord, NewServer, ProbedFacts, SelfUpdate, ServerFilter, ServerStatus,
    ServerType, TokenState,
};

async fn test_db() -> FleetDatabase {
    FleetDatabase::open_in_memory().await.unwrap()
}

fn new_server<'a>(name: &'a str, fingerprint: &'a str) -> NewServer<'a> {
    NewServer {
        name,
        server_type: ServerType::FleetMember,
        connection_url: "https://10.0.0.1:8443",
        certificate: "-----BEGIN CERTIFICATE-----",
        certificate_fingerprint: fingerprint,
    }
}

fn facts() -> ProbedFacts<'static> {
    ProbedFacts {
        hardware_data: r#"{"cpu":8}"#,
        os_data: r#"{"name":"linux"}"#,
        version_data: r#"{"version":"1.0"}"#,
    }
}

/// Register a server through a fresh token and mark it `Ready`.
async fn ready_server(db: &FleetDatabase, name: &str) {
    let now = unix_timestamp();
    let token = format!("tok-{name}");
    db.create_token(&token, 1, now + 3600, "").await.unwrap();
    db.register_server(&token, &new_server(name, &format!("fp-{name}")), now)
        .await
        .unwrap();
    db.record_probe_success(name, &facts(), now).await.unwrap();
}

fn new_cluster(name: &str) -> NewCluster<'_> {
    NewCluster {
        name,
        connection_url: "https://cluster:8443",
        channel: "stable",
        certificate: "",
        fingerprint: "",
        services_config: "{}",
        application_seed_config: "{}",
        status: ClusterStatus::Ready,
    }
}

// === Token tests ===

#[tokio::test]
async fn create_and_get_token() {
    let db = test_db().await;
    let expire = unix_timestamp() + 3600;
    let token = db.create_token("t1", 2, expire, "rack 4").await.unwrap();

    assert_eq!(token.uses_remaining, 2);
    assert_eq!(token.description, "rack 4");
    assert_eq!(token.state_at(unix_timestamp()), TokenState::Active);
    assert_eq!(db.get_token("t1").await.unwrap().etag, token.etag);
}

#[tokio::test]
async fn redeem_decrements_until_exhausted() {
    let db = test_db().await;
    let now = unix_timestamp();
    db.create_token("t1", 1, now + 3600, "").await.unwrap();

    assert!(db.redeem_token("t1", now).await.unwrap());
    assert!(!db.redeem_token("t1", now).await.unwrap());

    let token = db.get_token("t1").await.unwrap();
    assert_eq!(token.uses_remaining, 0);
    assert_eq!(token.state_at(now), TokenState::Exhausted);
}

#[tokio::test]
async fn expired_token_not_redeemable() {
    let db = test_db().await;
    let now = unix_timestamp();
    db.create_token("t1", 5, now - 1, "").await.unwrap();

    assert!(!db.redeem_token("t1", now).await.unwrap());
    assert_eq!(db.get_token("t1").await.unwrap().uses_remaining, 5);
}

#[tokio::test]
async fn redeem_refreshes_etag() {
    let db = test_db().await;
    let now = unix_timestamp();
    let before = db.create_token("t1", 2, now + 3600, "").await.unwrap();
    db.redeem_token("t1", now).await.unwrap();
    assert_ne!(db.get_token("t1").await.unwrap().etag, before.etag);
}

#[tokio::test]
async fn update_token_with_stale_etag_conflicts() {
    let db = test_db().await;
    let expire = unix_timestamp() + 3600;
    let token = db.create_token("t1", 1, expire, "").await.unwrap();

    let updated = db
        .update_token("t1", 3, expire, "more", Some(&token.etag))
        .await
        .unwrap();
    assert_eq!(updated.uses_remaining, 3);

    let err = db
        .update_token("t1", 4, expire, "stale", Some(&token.etag))
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Conflict(_)));
}

#[tokio::test]
async fn delete_token_reports_absence() {
    let db = test_db().await;
    db.create_token("t1", 1, unix_timestamp() + 60, "")
        .await
        .unwrap();
    assert!(db.delete_token("t1").await.unwrap());
    assert!(!db.delete_token("t1").await.unwrap());
}

// === Server tests ===

#[tokio::test]
async fn register_consumes_token_and_creates_pending_server() {
    let db = test_db().await;
    let now = unix_timestamp();
    db.create_token("t1", 1, now + 3600, "").await.unwrap();

    let server = db
        .register_server("t1", &new_server("m1", "fp1"), now)
        .await
        .unwrap();

    assert_eq!(server.status(), ServerStatus::Pending);
    assert_eq!(server.cluster, None);
    assert_eq!(db.get_token("t1").await.unwrap().uses_remaining, 0);
}

#[tokio::test]
async fn duplicate_name_does_not_consume_token() {
    let db = test_db().await;
    let now = unix_timestamp();
    db.create_token("t1", 1, now + 3600, "").await.unwrap();
    db.create_token("t2", 1, now + 3600, "").await.unwrap();
    db.register_server("t1", &new_server("m1", "fp1"), now)
        .await
        .unwrap();

    let err = db
        .register_server("t2", &new_server("m1", "fp2"), now)
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Conflict(_)), "got {err:?}");
    assert_eq!(db.get_token("t2").await.unwrap().uses_remaining, 1);
}

#[tokio::test]
async fn duplicate_certificate_rejected() {
    let db = test_db().await;
    let now = unix_timestamp();
    db.create_token("t1", 2, now + 3600, "").await.unwrap();
    db.register_server("t1", &new_server("m1", "fp1"), now)
        .await
        .unwrap();

    let err = db
        .register_server("t1", &new_server("m2", "fp1"), now)
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Conflict(_)));
}

#[tokio::test]
async fn probe_failure_leaves_pending_alone() {
    let db = test_db().await;
    let now = unix_timestamp();
    db.create_token("t1", 1, now + 3600, "").await.unwrap();
    db.register_server("t1", &new_server("m1", "fp1"), now)
        .await
        .unwrap();

    assert!(!db.record_probe_failure("m1", now).await.unwrap());
    assert_eq!(
        db.get_server("m1").await.unwrap().status(),
        ServerStatus::Pending
    );
}

#[tokio::test]
async fn probe_transitions_ready_unreachable_ready() {
    let db = test_db().await;
    ready_server(&db, "m1").await;
    let now = unix_timestamp();

    assert!(db.record_probe_failure("m1", now).await.unwrap());
    assert_eq!(
        db.get_server("m1").await.unwrap().status(),
        ServerStatus::Unreachable
    );

    db.record_probe_success("m1", &facts(), now).await.unwrap();
    let server = db.get_server("m1").await.unwrap();
    assert_eq!(server.status(), ServerStatus::Ready);
    assert_eq!(server.hardware_data, r#"{"cpu":8}"#);
    assert_eq!(server.last_seen, now);
}

#[tokio::test]
async fn probe_writes_do_not_change_etag() {
    let db = test_db().await;
    ready_server(&db, "m1").await;
    let before = db.get_server("m1").await.unwrap().etag;
    db.record_probe_failure("m1", unix_timestamp()).await.unwrap();
    assert_eq!(db.get_server("m1").await.unwrap().etag, before);
}

#[tokio::test]
async fn self_update_keeps_status_and_certificate() {
    let db = test_db().await;
    ready_server(&db, "m1").await;
    let before = db.get_server("m1").await.unwrap();

    let after = db
        .update_server_self(
            "m1",
            &SelfUpdate {
                connection_url: Some("https://10.0.0.9:8443"),
                os_data: Some(r#"{"name":"other"}"#),
                ..SelfUpdate::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(after.connection_url, "https://10.0.0.9:8443");
    assert_eq!(after.os_data, r#"{"name":"other"}"#);
    assert_eq!(after.hardware_data, before.hardware_data);
    assert_eq!(after.status, before.status);
    assert_eq!(after.certificate, before.certificate);
    assert_ne!(after.etag, before.etag);
}

#[tokio::test]
async fn rename_server_guarded_and_moves_inventory() {
    let db = test_db().await;
    ready_server(&db, "m1").await;
    ready_server(&db, "m2").await;
    let etag = db.get_server("m1").await.unwrap().etag;

    db.create_cluster(&new_cluster("x"), &["m1".to_string()])
        .await
        .unwrap();
    db.replace_inventory(
        "x",
        &[NewInventoryRecord {
            server: Some("m1".into()),
            project: "default".into(),
            kind: "instance".into(),
            name: "vm1".into(),
            object: serde_json::json!({}),
        }],
    )
    .await
    .unwrap();

    // clustering changed the etag
    let err = db.rename_server("m1", "m9", Some(&etag)).await.unwrap_err();
    assert!(matches!(err, DatabaseError::Conflict(_)));

    let current = db.get_server("m1").await.unwrap().etag;
    let err = db
        .rename_server("m1", "m2", Some(&current))
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Conflict(_)));

    let renamed = db.rename_server("m1", "m9", Some(&current)).await.unwrap();
    assert_eq!(renamed.name, "m9");
    assert_eq!(renamed.cluster.as_deref(), Some("x"));

    let rows = db
        .list_inventory(&InventoryFilter {
            server: Some("m9".into()),
            ..InventoryFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn delete_clustered_server_conflicts() {
    let db = test_db().await;
    ready_server(&db, "m1").await;
    ready_server(&db, "m2").await;
    db.create_cluster(&new_cluster("x"), &["m1".to_string()])
        .await
        .unwrap();

    assert!(matches!(
        db.delete_unclustered_server("m1").await.unwrap_err(),
        DatabaseError::Conflict(_)
    ));
    db.delete_unclustered_server("m2").await.unwrap();
    assert!(matches!(
        db.get_server("m2").await.unwrap_err(),
        DatabaseError::NotFound(_)
    ));
}

#[tokio::test]
async fn list_servers_filters() {
    let db = test_db().await;
    ready_server(&db, "a").await;
    ready_server(&db, "b").await;
    let now = unix_timestamp();
    db.create_token("t", 1, now + 60, "").await.unwrap();
    db.register_server("t", &new_server("c", "fp-c"), now)
        .await
        .unwrap();
    db.create_cluster(&new_cluster("x"), &["a".to_string()])
        .await
        .unwrap();

    let all = db.list_servers(&ServerFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);

    let ready = db
        .list_servers(&ServerFilter {
            status: Some(ServerStatus::Ready),
            ..ServerFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(
        ready.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        ["a", "b"]
    );

    let in_x = db
        .list_servers(&ServerFilter {
            cluster: Some("x".into()),
            ..ServerFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(in_x.len(), 1);
}

// === Cluster tests ===

#[tokio::test]
async fn create_cluster_claims_members() {
    let db = test_db().await;
    for name in ["a", "b", "c"] {
        ready_server(&db, name).await;
    }
    let members: Vec<String> = ["a", "b", "c"].iter().map(ToString::to_string).collect();

    let detail = db.create_cluster(&new_cluster("x"), &members).await.unwrap();
    assert_eq!(detail.members, members);
    assert_eq!(detail.cluster.status(), ClusterStatus::Ready);

    for name in ["a", "b", "c"] {
        assert_eq!(
            db.get_server(name).await.unwrap().cluster.as_deref(),
            Some("x")
        );
    }
}

#[tokio::test]
async fn create_cluster_rolls_back_on_claimed_member() {
    let db = test_db().await;
    ready_server(&db, "a").await;
    ready_server(&db, "b").await;
    db.create_cluster(&new_cluster("x"), &["a".to_string()])
        .await
        .unwrap();

    let err = db
        .create_cluster(&new_cluster("y"), &["b".to_string(), "a".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Conflict(_)));

    assert!(db.get_cluster("y").await.is_err());
    assert_eq!(db.get_server("b").await.unwrap().cluster, None);
}

#[tokio::test]
async fn delete_if_unused_rejects_ready_and_populated() {
    let db = test_db().await;
    ready_server(&db, "a").await;
    db.create_cluster(&new_cluster("x"), &["a".to_string()])
        .await
        .unwrap();
    db.create_cluster(&new_cluster("empty"), &[]).await.unwrap();

    assert!(matches!(
        db.delete_cluster_if_unused("x").await.unwrap_err(),
        DatabaseError::Conflict(_)
    ));
    // Ready with zero members is still not removable this way
    assert!(matches!(
        db.delete_cluster_if_unused("empty").await.unwrap_err(),
        DatabaseError::Conflict(_)
    ));

    db.set_cluster_status("empty", ClusterStatus::Unknown)
        .await
        .unwrap();
    db.delete_cluster_if_unused("empty").await.unwrap();
    assert!(db.get_cluster("empty").await.is_err());
}

#[tokio::test]
async fn delete_with_members_removes_everything() {
    let db = test_db().await;
    ready_server(&db, "a").await;
    ready_server(&db, "b").await;
    db.create_cluster(&new_cluster("x"), &["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    db.replace_artifact(
        "x",
        &NewArtifact {
            name: "terraform".into(),
            description: String::new(),
            properties: std::collections::BTreeMap::new(),
            files: vec![NewArtifactFile {
                name: "main.tf.json".into(),
                mime_type: "application/json".into(),
                content: b"{}".to_vec(),
            }],
        },
    )
    .await
    .unwrap();

    let removed = db.delete_cluster_with_members("x").await.unwrap();
    assert_eq!(
        removed.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        ["a", "b"]
    );
    assert!(db.get_server("a").await.is_err());
    assert!(db.list_artifacts("x").await.unwrap().is_empty());
}

#[tokio::test]
async fn rename_cluster_moves_members_and_artifacts() {
    let db = test_db().await;
    ready_server(&db, "a").await;
    let detail = db
        .create_cluster(&new_cluster("x"), &["a".to_string()])
        .await
        .unwrap();
    db.replace_artifact(
        "x",
        &NewArtifact {
            name: "terraform".into(),
            description: String::new(),
            properties: std::collections::BTreeMap::new(),
            files: vec![NewArtifactFile {
                name: "main.tf.json".into(),
                mime_type: "application/json".into(),
                content: b"{}".to_vec(),
            }],
        },
    )
    .await
    .unwrap();

    let renamed = db
        .rename_cluster("x", "y", Some(&detail.cluster.etag))
        .await
        .unwrap();
    assert_eq!(renamed.members, ["a"]);
    assert_eq!(db.get_server("a").await.unwrap().cluster.as_deref(), Some("y"));
    let file = db
        .get_artifact_file("y", "terraform", "main.tf.json")
        .await
        .unwrap();
    assert_eq!(file.content, b"{}");
}

#[tokio::test]
async fn update_cluster_stale_etag_conflicts() {
    let db = test_db().await;
    let detail = db.create_cluster(&new_cluster("x"), &[]).await.unwrap();

    let updated = db
        .update_cluster(
            "x",
            &ClusterUpdate {
                channel: Some("beta"),
                ..ClusterUpdate::default()
            },
            Some(&detail.cluster.etag),
        )
        .await
        .unwrap();
    assert_eq!(updated.cluster.channel, "beta");

    let err = db
        .update_cluster("x", &ClusterUpdate::default(), Some(&detail.cluster.etag))
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Conflict(_)));
}

#[tokio::test]
async fn replace_artifact_overwrites_files() {
    let db = test_db().await;
    db.create_cluster(&new_cluster("x"), &[]).await.unwrap();
    let artifact = |content: &[u8]| NewArtifact {
        name: "terraform".into(),
        description: "IaC".into(),
        properties: std::collections::BTreeMap::new(),
        files: vec![NewArtifactFile {
            name: "main.tf.json".into(),
            mime_type: "application/json".into(),
            content: content.to_vec(),
        }],
    };

    db.replace_artifact("x", &artifact(b"{}")).await.unwrap();
    db.replace_artifact("x", &artifact(b"{\"a\":1}")).await.unwrap();

    let listed = db.list_artifacts("x").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].files[0].size, 7);
}

#[tokio::test]
async fn replace_artifact_requires_cluster() {
    let db = test_db().await;
    let artifact = NewArtifact {
        name: "terraform".into(),
        description: "IaC".into(),
        properties: std::collections::BTreeMap::new(),
        files: Vec::new(),
    };

    let err = db.replace_artifact("gone", &artifact).await.unwrap_err();
    assert!(matches!(err, DatabaseError::NotFound(_)), "got {err:?}");
    assert!(db.list_artifacts("gone").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stale_cluster_updates_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let db = FleetDatabase::open(&dir.path().join("fleet.db")).await.unwrap();
    let etag = db
        .create_cluster(&new_cluster("x"), &[])
        .await
        .unwrap()
        .cluster
        .etag;

    let writers: Vec<_> = (0..16)
        .map(|i| {
            let db = db.clone();
            let etag = etag.clone();
            tokio::spawn(async move {
                let channel = format!("channel-{i}");
                let update = ClusterUpdate {
                    channel: Some(&channel),
                    ..ClusterUpdate::default()
                };
                db.update_cluster("x", &update, Some(&etag)).await.map(drop)
            })
        })
        .collect();

    let mut applied = 0;
    for writer in writers {
        match writer.await.unwrap() {
            Ok(()) => applied += 1,
            Err(DatabaseError::Conflict(_)) => {}
            Err(e) => panic!("expected Conflict, got {e:?}"),
        }
    }
    assert_eq!(applied, 1);
}

// === Inventory tests ===

#[tokio::test]
async fn replace_inventory_requires_cluster() {
    let db = test_db().await;
    let record = NewInventoryRecord {
        server: None,
        project: "default".into(),
        kind: "instance".into(),
        name: "web-1".into(),
        object: serde_json::json!({}),
    };

    let err = db.replace_inventory("gone", &[record]).await.unwrap_err();
    assert!(matches!(err, DatabaseError::NotFound(_)), "got {err:?}");
    assert!(
        db.list_inventory(&InventoryFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn replace_inventory_is_idempotent() {
    let db = test_db().await;
    let records = vec![
        NewInventoryRecord {
            server: None,
            project: "default".into(),
            kind: "network".into(),
            name: "br0".into(),
            object: serde_json::json!({"mtu": 1500}),
        },
        NewInventoryRecord {
            server: Some("a".into()),
            project: "default".into(),
            kind: "instance".into(),
            name: "web_1".into(),
            object: serde_json::json!({}),
        },
    ];
    db.create_cluster(&new_cluster("x"), &[]).await.unwrap();

    db.replace_inventory("x", &records).await.unwrap();
    let first: Vec<_> = db
        .list_inventory(&InventoryFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.cluster, r.kind, r.name, r.object))
        .collect();

    db.replace_inventory("x", &records).await.unwrap();
    let second: Vec<_> = db
        .list_inventory(&InventoryFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.cluster, r.kind, r.name, r.object))
        .collect();

    assert_eq!(first, second);
    assert_eq!(first[0].1, "instance");
}

#[tokio::test]
async fn inventory_name_filter_escapes_wildcards() {
    let db = test_db().await;
    let record = |name: &str| NewInventoryRecord {
        server: None,
        project: "default".into(),
        kind: "instance".into(),
        name: name.into(),
        object: serde_json::json!({}),
    };
    db.create_cluster(&new_cluster("x"), &[]).await.unwrap();
    db.replace_inventory("x", &[record("web_1"), record("webX1")])
        .await
        .unwrap();

    let rows = db
        .list_inventory(&InventoryFilter {
            name_contains: Some("b_".into()),
            ..InventoryFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "web_1");
}
