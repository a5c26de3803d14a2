//! End-to-end scaling scenarios against the in-memory provider.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use dropscale_cloud::fake::FakeCloud;
use dropscale_cloud::{Droplet, DropletStatus, Networks};
use dropscale_cloudinit::{emit_archive, ArchivePart};
use dropscale_target::{
    DropletTarget, StaticClusterHost, TargetError, DEFAULT_INTRODUCTION_FILENAME,
};
use dropscale_vault::binder::{tag_poll_script, write_credential_script};
use dropscale_vault::MockIssuer;

fn base_config() -> HashMap<String, String> {
    [
        ("name", "mydropletname"),
        ("region", "lon1"),
        ("size", "s-1vcpu-1gb"),
        ("vpc_uuid", "vpc-1234"),
        ("snapshot_id", "12345"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn make_target() -> (Arc<FakeCloud>, Arc<StaticClusterHost>, DropletTarget) {
    let cloud = Arc::new(FakeCloud::new());
    let cluster = Arc::new(StaticClusterHost::ready());
    let target = DropletTarget::with_provider(
        Arc::new(MockIssuer),
        cluster.clone(),
        cloud.clone(),
    );
    (cloud, cluster, target)
}

#[tokio::test]
async fn scale_out_creates_plain_workers() {
    let (cloud, _, target) = make_target();
    let mut config = base_config();
    config.insert("tags".to_string(), "foo,bar,baz".to_string());

    target.scale(3, &config).await.unwrap();

    let droplets = cloud.droplets_with_tag("mydropletname");
    assert_eq!(droplets.len(), 3);
    for droplet in &droplets {
        assert!(droplet.name.starts_with("mydropletname-"));
        for tag in ["mydropletname", "foo", "bar", "baz"] {
            assert!(droplet.tags.iter().any(|t| t == tag), "missing tag {tag}");
        }
        assert!(droplet.user_data.is_none());
    }

    // Names carry distinct random suffixes.
    let names: HashSet<&String> = droplets.iter().map(|d| &d.name).collect();
    assert_eq!(names.len(), 3);
}

#[tokio::test]
async fn scale_out_with_tag_channel_delivers_credentials() {
    let (cloud, _, target) = make_target();
    let mut config = base_config();
    config.insert(
        "secure_introduction_approle".to_string(),
        "droplet-approle".to_string(),
    );
    config.insert(
        "secure_introduction_tag_prefix".to_string(),
        "banana-".to_string(),
    );

    target.scale(3, &config).await.unwrap();

    let script = tag_poll_script("banana-", DEFAULT_INTRODUCTION_FILENAME);
    let expected_user_data = emit_archive(&[ArchivePart::shell(&script)]);

    let droplets = cloud.droplets_with_tag("mydropletname");
    assert_eq!(droplets.len(), 3);
    for droplet in &droplets {
        assert_eq!(droplet.user_data.as_deref(), Some(expected_user_data.as_str()));

        // Every worker acquired a credential tag bound to its own
        // address (the mock issuer encodes the address in the token).
        let ipv4 = droplet.networks.v4[0].ip_address.replace('.', "_");
        let tag = droplet
            .tags
            .iter()
            .find(|t| t.starts_with("banana-"))
            .expect("credential tag missing");
        assert_eq!(tag, &format!("banana-mock-wrapped-token-for-{ipv4}-and-"));
    }
}

#[tokio::test]
async fn scale_out_with_reservations_prefers_the_preboot_channel() {
    let (cloud, _, target) = make_target();
    let mut config = base_config();
    config.insert("reserve_ipv4_addresses".to_string(), "true".to_string());
    config.insert("create_reserved_addresses".to_string(), "true".to_string());
    config.insert(
        "secure_introduction_approle".to_string(),
        "droplet-approle".to_string(),
    );
    config.insert(
        "secure_introduction_tag_prefix".to_string(),
        "banana-".to_string(),
    );

    target.scale(2, &config).await.unwrap();

    let droplets = cloud.droplets_with_tag("mydropletname");
    assert_eq!(droplets.len(), 2);
    for droplet in &droplets {
        // A reserved address was bound to each worker...
        let reserved = cloud
            .reserved_v4_of(droplet.id)
            .expect("no reserved address assigned");

        // ...and the credential for that address rode in user-data.
        let script = write_credential_script(
            &format!(
                "mock-wrapped-token-for-{}-and-",
                reserved.replace('.', "_")
            ),
            DEFAULT_INTRODUCTION_FILENAME,
        );
        let expected = emit_archive(&[ArchivePart::shell(&script)]);
        assert_eq!(droplet.user_data.as_deref(), Some(expected.as_str()));

        // The tag channel stayed quiet for these workers.
        assert!(!droplet.tags.iter().any(|t| t.starts_with("banana-")));
    }
}

#[tokio::test]
async fn scale_out_aggregates_partial_failures() {
    let (cloud, _, target) = make_target();
    cloud.fail_next_droplet_creates(1);

    let err = target.scale(3, &base_config()).await.unwrap_err();
    match err {
        TargetError::ScaleOut(failures) => assert_eq!(failures.len(), 1),
        other => panic!("expected ScaleOut aggregate, got {other:?}"),
    }

    // The two workers whose tasks succeeded remain at the provider.
    assert_eq!(cloud.droplets_with_tag("mydropletname").len(), 2);
}

#[tokio::test]
async fn scale_is_a_noop_at_the_desired_count() {
    let (cloud, _, target) = make_target();
    target.scale(2, &base_config()).await.unwrap();
    let before: HashSet<String> = cloud
        .droplets_with_tag("mydropletname")
        .into_iter()
        .map(|d| d.name)
        .collect();

    target.scale(2, &base_config()).await.unwrap();

    let after: HashSet<String> = cloud
        .droplets_with_tag("mydropletname")
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn negative_count_is_a_dry_run() {
    let (cloud, _, target) = make_target();
    target.scale(-1, &base_config()).await.unwrap();
    assert!(cloud.droplets_with_tag("mydropletname").is_empty());
}

#[tokio::test]
async fn scale_in_drains_and_deletes_selected_workers() {
    let (cloud, cluster, target) = make_target();
    target.scale(5, &base_config()).await.unwrap();

    let mut names: Vec<String> = cloud
        .droplets_with_tag("mydropletname")
        .into_iter()
        .map(|d| d.name)
        .collect();
    names.sort();
    let to_drain: Vec<String> = names[..3].to_vec();
    cluster.set_drain_names(to_drain.clone());

    target.scale(2, &base_config()).await.unwrap();

    let survivors: HashSet<String> = cloud
        .droplets_with_tag("mydropletname")
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(survivors.len(), 2);
    for name in &to_drain {
        assert!(!survivors.contains(name), "{name} should have been deleted");
    }

    // The post-hook ran once, for exactly the drained nodes.
    let posted = cluster.post_calls();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0], to_drain);
}

#[tokio::test]
async fn scale_in_walks_every_page_of_the_listing() {
    let (cloud, cluster, target) = make_target();
    target.scale(6, &base_config()).await.unwrap();
    cloud.set_droplets_per_page(2);

    let names: Vec<String> = cloud
        .droplets_with_tag("mydropletname")
        .into_iter()
        .map(|d| d.name)
        .collect();
    // Drain the last-listed workers so earlier pages cannot satisfy
    // the deletion count.
    cluster.set_drain_names(names[names.len() - 2..].to_vec());

    target.scale(4, &base_config()).await.unwrap();
    assert_eq!(cloud.droplets_with_tag("mydropletname").len(), 4);
}

#[tokio::test(start_paused = true)]
async fn tag_sweeper_removes_only_stale_snapshotted_tags() {
    let (cloud, cluster, target) = make_target();
    let mut config = base_config();
    config.insert(
        "secure_introduction_approle".to_string(),
        "droplet-approle".to_string(),
    );
    config.insert(
        "secure_introduction_tag_prefix".to_string(),
        "banana-".to_string(),
    );

    target.scale(3, &config).await.unwrap();

    // A leftover credential tag with no owner, as a crashed scale-out
    // would leave behind.
    use dropscale_cloud::Tags;
    Tags::create(&*cloud, "banana-stale-leftover").await.unwrap();

    let names: Vec<String> = cloud
        .droplets_with_tag("mydropletname")
        .into_iter()
        .map(|d| d.name)
        .collect();
    cluster.set_drain_names(names[..1].to_vec());
    target.scale(2, &config).await.unwrap();

    // Let the detached sweeper take its snapshot, then ride past its
    // 60-second comparison window.
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    tokio::time::advance(Duration::from_secs(61)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    let tags = cloud.tag_names();
    assert!(!tags.contains(&"banana-stale-leftover".to_string()));
    // Tags still referencing live droplets survive the sweep.
    let live_credential_tags = tags
        .iter()
        .filter(|t| t.starts_with("banana-"))
        .count();
    assert_eq!(live_credential_tags, 2);
}

#[tokio::test]
async fn orphan_sweep_respects_grace_and_whitelist() {
    let (cloud, _, target) = make_target();

    let old = |id: u64, name: &str| Droplet {
        id,
        name: name.to_string(),
        status: DropletStatus::Active,
        tags: vec!["mydropletname".to_string()],
        created_at: Utc::now() - chrono::Duration::hours(1),
        networks: Networks::default(),
        user_data: None,
    };
    // A worker booted one second ago, not yet registered anywhere.
    let young = Droplet {
        created_at: Utc::now() - chrono::Duration::seconds(1),
        ..old(3, "mydropletname-young")
    };

    cloud.insert_droplet(old(1, "mydropletname-listed"));
    cloud.insert_droplet(old(2, "mydropletname-forgotten"));
    cloud.insert_droplet(young);

    let whitelist: HashSet<String> = ["mydropletname-listed".to_string()].into();
    let deleted = target
        .delete_orphaned_workers(&base_config(), &whitelist, Duration::from_secs(600))
        .await
        .unwrap();

    assert_eq!(deleted, 1);
    let remaining: HashSet<String> = cloud
        .droplets_with_tag("mydropletname")
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert!(remaining.contains("mydropletname-listed"));
    assert!(remaining.contains("mydropletname-young"));
    assert!(!remaining.contains("mydropletname-forgotten"));
}

#[tokio::test]
async fn shutdown_aborts_address_assignment() {
    let (cloud, _, target) = make_target();
    let mut config = base_config();
    config.insert("reserve_ipv4_addresses".to_string(), "true".to_string());
    config.insert("create_reserved_addresses".to_string(), "true".to_string());

    target.shutdown();

    // Creation itself proceeds (tokens are still banked), but the
    // assignment retry loop refuses to start once cancelled.
    let err = target.scale(1, &config).await.unwrap_err();
    assert!(matches!(err, TargetError::ScaleOut(_)));

    let droplets = cloud.droplets_with_tag("mydropletname");
    assert_eq!(droplets.len(), 1);
    assert!(cloud.reserved_v4_of(droplets[0].id).is_none());
}

#[tokio::test]
async fn status_reports_counts_once_the_pool_is_ready() {
    let (_, _, target) = make_target();
    target.scale(2, &base_config()).await.unwrap();

    let status = target.status(&base_config()).await.unwrap();
    assert!(status.ready);
    assert_eq!(status.count, 2);
    assert!(status.meta.is_empty());
}

#[tokio::test]
async fn status_short_circuits_on_an_unready_pool() {
    let cloud = Arc::new(FakeCloud::new());
    let target = DropletTarget::with_provider(
        Arc::new(MockIssuer),
        Arc::new(StaticClusterHost::not_ready()),
        cloud.clone(),
    );

    // No template keys at all: the readiness gate answers before the
    // config is even inspected.
    let status = target.status(&HashMap::new()).await.unwrap();
    assert!(!status.ready);
    assert_eq!(status.count, 0);
}
