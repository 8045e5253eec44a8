//! End-to-end tests for the mux against a mock cluster.
//!
//! These tests verify:
//! - Key and replica routing over vbucket maps and ketama rings
//! - Requests queued before the first topology are redispatched
//! - Topology swaps keep surviving connections and lose no requests
//! - Not-my-vbucket redirection and config-only refreshes
//! - Overload, forced reconnect and shutdown

#[cfg(test)]
mod tests {
    use crate::config::PipelineConfig;
    use crate::error::{Error, RoutingError};
    use crate::memd::{Command, Status};
    use crate::mux::{ConnectionSettings, KvMux};
    use crate::pipeline::{Request, RequestResult, Response};
    use crate::retry::{FailFastRetryStrategy, RetryReason, StandardRetryOrchestrator};
    use crate::testing::{kv_addr, wait_until, ConfigBuilder, MockCluster};
    use crate::topology::{BucketConfig, ConfigRefresher, RouteConfig, TopologyManager};
    use crate::types::{BucketType, PasswordAuth};
    use async_trait::async_trait;
    use futures::future::join_all;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;

    const HOSTS: [&str; 3] = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];
    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        cluster: Arc<MockCluster>,
        topology: Arc<TopologyManager>,
        mux: Arc<KvMux>,
    }

    impl Harness {
        fn new(bucket: &str, cluster: Arc<MockCluster>, pipeline: PipelineConfig) -> Self {
            let seeds = vec![kv_addr(HOSTS[0])];
            let initial = Arc::new(RouteConfig::bootstrap(bucket, &seeds, &[]));
            let topology = Arc::new(TopologyManager::new(bucket, None, seeds, initial));
            let settings = ConnectionSettings {
                use_tls: false,
                no_tls_seed_node: false,
                tls: None,
                auth: Arc::new(PasswordAuth::new("user", "pass")),
                mechanisms: Vec::new(),
            };
            let mux = KvMux::new(
                topology.clone(),
                cluster.provider(),
                settings,
                pipeline,
                Arc::new(StandardRetryOrchestrator),
            );
            mux.start();
            topology.add_watcher(mux.watcher());
            Self {
                cluster,
                topology,
                mux,
            }
        }

        fn apply(&self, builder: &ConfigBuilder) -> bool {
            let cfg = BucketConfig::parse(&builder.bytes(), HOSTS[0]).unwrap();
            self.topology.propose_topology(&cfg)
        }

        async fn get(&self, key: &str, replica: i32) -> RequestResult {
            let (req, pending) = Request::builder(Command::Get)
                .key(key.to_string())
                .replica_index(replica)
                .timeout(WAIT)
                .build();
            self.mux.dispatch(req).unwrap();
            pending.await
        }

        fn owner(&self, builder: &ConfigBuilder, key: &str, replica: usize) -> String {
            let vb = self.mux.key_to_vbucket(key.as_bytes()).unwrap();
            let idx = builder.vbucket_map()[vb as usize][replica];
            kv_addr(HOSTS[idx as usize])
        }

        async fn wait_connected(&self, hosts: &[&str]) {
            let cluster = self.cluster.clone();
            let addrs: Vec<String> = hosts.iter().map(|h| kv_addr(h)).collect();
            assert!(
                wait_until(
                    || addrs.iter().all(|a| cluster.open_connections(a) == 1),
                    WAIT
                )
                .await,
                "connections to {:?} not established",
                addrs
            );
        }
    }

    fn served_by(resp: &Response) -> String {
        String::from_utf8_lossy(&resp.packet.value).into_owned()
    }

    #[derive(Default)]
    struct CountingRefresher {
        refreshes: AtomicUsize,
        notifications: Mutex<Vec<(i64, i64)>>,
    }

    #[async_trait]
    impl ConfigRefresher for CountingRefresher {
        async fn refresh(&self) {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_change_notification(&self, epoch: i64, rev: i64) {
            self.notifications.lock().push((epoch, rev));
        }
    }

    #[test(tokio::test)]
    async fn test_routes_by_vbucket_and_replica() {
        let builder = ConfigBuilder::partitioned("default", &HOSTS).vbuckets(1024, 1);
        let h = Harness::new(
            "default",
            MockCluster::new(builder.build()),
            PipelineConfig::default(),
        );
        assert!(h.apply(&builder));
        assert_eq!(h.mux.bucket_type().unwrap(), BucketType::Partitioned);
        assert_eq!(h.mux.num_replicas().unwrap(), 1);

        let primary = h.owner(&builder, "foo", 0);
        let replica = h.owner(&builder, "foo", 1);
        assert_ne!(primary, replica);

        for _ in 0..3 {
            let resp = h.get("foo", 0).await.unwrap();
            assert_eq!(served_by(&resp), primary);
        }
        let resp = h.get("foo", 1).await.unwrap();
        assert_eq!(served_by(&resp), replica);

        let (req, _pending) = Request::builder(Command::Get)
            .key("foo")
            .replica_index(2)
            .build();
        match h.mux.dispatch(req) {
            Err(Error::Routing(RoutingError::InvalidReplica { index: 2, .. })) => {}
            other => panic!("expected invalid replica, got {:?}", other),
        }

        let vb = h.mux.key_to_vbucket(b"foo").unwrap();
        assert!(h
            .cluster
            .requests_for(Command::Get)
            .iter()
            .all(|r| r.vbucket == vb));
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_ring_hashed_routing() {
        let builder = ConfigBuilder::ring_hashed("memcached", &HOSTS);
        let h = Harness::new(
            "memcached",
            MockCluster::new(builder.build()),
            PipelineConfig::default(),
        );
        assert!(h.apply(&builder));
        assert_eq!(h.mux.bucket_type().unwrap(), BucketType::RingHashed);

        let first = served_by(&h.get("foo", 0).await.unwrap());
        for _ in 0..3 {
            assert_eq!(served_by(&h.get("foo", 0).await.unwrap()), first);
        }

        let (req, _pending) = Request::builder(Command::Get)
            .key("foo")
            .replica_index(1)
            .build();
        assert!(matches!(
            h.mux.dispatch(req),
            Err(Error::Routing(RoutingError::InvalidReplica { .. }))
        ));
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_requests_before_first_topology_are_redispatched() {
        let builder = ConfigBuilder::partitioned("default", &HOSTS).vbuckets(64, 1);
        let h = Harness::new(
            "default",
            MockCluster::new(builder.build()),
            PipelineConfig::default(),
        );

        let keys: Vec<String> = (0..20).map(|i| format!("key-{}", i)).collect();
        let mut pending = Vec::new();
        for key in &keys {
            let (req, p) = Request::builder(Command::Get)
                .key(key.clone())
                .timeout(WAIT)
                .build();
            h.mux.dispatch(req).unwrap();
            pending.push(p);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.cluster.requests_for(Command::Get).is_empty());

        assert!(h.apply(&builder));
        for (key, p) in keys.iter().zip(pending) {
            let resp = p.await.unwrap();
            assert_eq!(served_by(&resp), h.owner(&builder, key, 0));
        }
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_stale_topologies_are_ignored() {
        let builder = ConfigBuilder::partitioned("default", &HOSTS).vbuckets(64, 1);
        let h = Harness::new(
            "default",
            MockCluster::new(builder.build()),
            PipelineConfig::default(),
        );

        assert!(h.apply(&builder.clone().rev(5)));
        assert!(!h.apply(&builder.clone().rev(4)));
        assert!(!h.apply(&builder.clone().rev(5)));
        assert_eq!(h.mux.config_rev().unwrap(), 5);

        assert!(h.apply(&builder.clone().rev_epoch(2).rev(1)));
        assert!(!h.apply(&builder.clone().rev_epoch(1).rev(100)));
        assert_eq!(h.mux.config_rev().unwrap(), 1);
        assert_eq!(h.mux.config_snapshot().unwrap().rev_epoch, 2);
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_ownership_change_applies_once() {
        let first = ConfigBuilder::partitioned("default", &HOSTS).vbuckets(1024, 1);
        let h = Harness::new(
            "default",
            MockCluster::new(first.build()),
            PipelineConfig::default(),
        );
        assert!(h.apply(&first));

        let vb = h.mux.key_to_vbucket(b"foo").unwrap() as usize;
        let mut map = first.vbucket_map();
        let old_owner = map[vb][0];
        let new_owner = (old_owner + 2) % 3;
        map[vb] = vec![new_owner, old_owner];
        let second = first.clone().rev(2).map(map);

        assert!(h.apply(&second));
        assert_eq!(
            served_by(&h.get("foo", 0).await.unwrap()),
            kv_addr(HOSTS[new_owner as usize])
        );
        assert!(!h.apply(&second));
        assert_eq!(h.mux.config_rev().unwrap(), 2);
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_takeover_preserves_surviving_connections() {
        let hosts = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"];
        let first = ConfigBuilder::partitioned("default", &hosts[..3]);
        let cluster = MockCluster::new(first.build());
        let h = Harness::new("default", cluster.clone(), PipelineConfig::default());
        assert!(h.apply(&first));
        h.wait_connected(&hosts[..3]).await;

        let second = ConfigBuilder::partitioned("default", &[hosts[0], hosts[1], hosts[3]]).rev(2);
        cluster.set_config(second.build());
        assert!(h.apply(&second));

        let removed = kv_addr(hosts[2]);
        let added = kv_addr(hosts[3]);
        assert!(
            wait_until(
                || cluster.open_connections(&removed) == 0 && cluster.open_connections(&added) == 1,
                WAIT
            )
            .await
        );
        for host in &hosts[..2] {
            assert_eq!(cluster.dial_count(&kv_addr(host)), 1, "{} was redialed", host);
            assert_eq!(cluster.open_connections(&kv_addr(host)), 1);
        }
        assert_eq!(h.mux.num_pipelines().unwrap(), 3);
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_removed_node_cancels_config_fetch_and_requeues_rest() {
        let first = ConfigBuilder::partitioned("default", &HOSTS).vbuckets(64, 0);
        let cluster = MockCluster::new(first.build());
        let h = Harness::new("default", cluster.clone(), PipelineConfig::default());
        assert!(h.apply(&first));
        h.wait_connected(&HOSTS).await;

        let removed = kv_addr(HOSTS[2]);
        let key = (0..1000)
            .map(|i| format!("key-{}", i))
            .find(|key| h.owner(&first, key, 0) == removed)
            .unwrap();

        cluster.set_node_down(&removed, true);
        let c = cluster.clone();
        assert!(wait_until(|| c.open_connections(&removed) == 0, WAIT).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (fetch, fetch_pending) = Request::builder(Command::GetClusterConfig)
            .timeout(WAIT)
            .build();
        h.mux.dispatch_to_address(fetch, &removed).unwrap();
        let (get, get_pending) = Request::builder(Command::Get)
            .key(key.clone())
            .timeout(WAIT)
            .build();
        h.mux.dispatch(get).unwrap();

        let second = ConfigBuilder::partitioned("default", &HOSTS[..2])
            .vbuckets(64, 0)
            .rev(2);
        cluster.set_config(second.build());
        assert!(h.apply(&second));

        assert_eq!(fetch_pending.await.unwrap_err().source, Error::Cancelled);
        let resp = get_pending.await.unwrap();
        assert_eq!(served_by(&resp), h.owner(&second, &key, 0));
        assert_ne!(served_by(&resp), removed);
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_no_request_loss_across_topology_swaps() {
        let hosts = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"];
        let layouts: Vec<Vec<&str>> = vec![
            vec![hosts[0], hosts[1], hosts[2]],
            vec![hosts[0], hosts[1]],
            vec![hosts[1], hosts[2], hosts[3]],
            vec![hosts[0], hosts[3]],
            vec![hosts[0], hosts[1], hosts[2], hosts[3]],
        ];
        let cluster = MockCluster::new(ConfigBuilder::partitioned("default", &layouts[0]).build());
        cluster.set_response_delay(Duration::from_millis(2));
        let h = Harness::new("default", cluster.clone(), PipelineConfig::default());

        let mut pending = Vec::new();
        for (rev, layout) in layouts.iter().enumerate() {
            for i in 0..40 {
                let (req, p) = Request::builder(Command::Get)
                    .key(format!("key-{}-{}", rev, i))
                    .timeout(Duration::from_secs(10))
                    .build();
                h.mux.dispatch(req).unwrap();
                pending.push(p);
            }
            let builder = ConfigBuilder::partitioned("default", layout).rev(rev as i64 + 1);
            cluster.set_config(builder.build());
            assert!(h.apply(&builder));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let results = tokio::time::timeout(Duration::from_secs(15), join_all(pending))
            .await
            .expect("requests did not complete");
        assert_eq!(results.len(), 200);
        for result in results {
            assert!(result.is_ok(), "request failed: {:?}", result);
        }
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_not_my_vbucket_redirects_to_new_owner() {
        let first = ConfigBuilder::partitioned("default", &HOSTS).vbuckets(64, 1);
        let cluster = MockCluster::new(first.build());
        let h = Harness::new("default", cluster.clone(), PipelineConfig::default());
        assert!(h.apply(&first));

        let vb = h.mux.key_to_vbucket(b"foo").unwrap() as usize;
        let mut map = first.vbucket_map();
        let old_owner = map[vb][0];
        let new_owner = (old_owner + 1) % 3;
        map[vb] = vec![new_owner, old_owner];
        let second = first.clone().rev(2).map(map);
        cluster.set_config(second.build());
        cluster.enforce_ownership(true);

        let (req, pending) = Request::builder(Command::Get)
            .key("foo")
            .timeout(WAIT)
            .build();
        h.mux.dispatch(req.clone()).unwrap();
        let resp = pending.await.unwrap();

        assert_eq!(served_by(&resp), kv_addr(HOSTS[new_owner as usize]));
        assert_eq!(h.mux.config_rev().unwrap(), 2);
        assert_eq!(req.retry_attempts(), 0);

        let addresses: Vec<String> = cluster
            .requests_for(Command::Get)
            .into_iter()
            .map(|r| r.address)
            .collect();
        assert_eq!(
            addresses,
            vec![
                kv_addr(HOSTS[old_owner as usize]),
                kv_addr(HOSTS[new_owner as usize])
            ]
        );
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_config_only_triggers_refresh_and_retry() {
        let builder = ConfigBuilder::partitioned("default", &HOSTS).vbuckets(64, 1);
        let cluster = MockCluster::new(builder.build());
        let h = Harness::new("default", cluster.clone(), PipelineConfig::default());
        let refresher = Arc::new(CountingRefresher::default());
        let dyn_refresher: Arc<dyn ConfigRefresher> = refresher.clone();
        h.topology.set_refresher(Arc::downgrade(&dyn_refresher));
        assert!(h.apply(&builder));

        let owner = h.owner(&builder, "foo", 0);
        cluster.push_status(&owner, Status::ConfigOnly);

        let (req, pending) = Request::builder(Command::Get)
            .key("foo")
            .timeout(WAIT)
            .build();
        h.mux.dispatch(req.clone()).unwrap();
        let resp = pending.await.unwrap();
        assert_eq!(served_by(&resp), owner);
        assert_eq!(req.retry_attempts(), 1);
        assert_eq!(
            req.retry_reasons(),
            vec![RetryReason::ServiceResponseCodeIndicated]
        );
        assert!(wait_until(|| refresher.refreshes.load(Ordering::SeqCst) >= 1, WAIT).await);
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_busy_is_retried() {
        let builder = ConfigBuilder::partitioned("default", &HOSTS).vbuckets(64, 1);
        let cluster = MockCluster::new(builder.build());
        let h = Harness::new("default", cluster.clone(), PipelineConfig::default());
        assert!(h.apply(&builder));

        let owner = h.owner(&builder, "foo", 0);
        cluster.push_status(&owner, Status::Busy);
        cluster.push_status(&owner, Status::Busy);

        let (req, pending) = Request::builder(Command::Get)
            .key("foo")
            .timeout(WAIT)
            .build();
        h.mux.dispatch(req.clone()).unwrap();
        pending.await.unwrap();
        assert_eq!(
            req.retry_reasons(),
            vec![RetryReason::KvErrMapRetry, RetryReason::KvErrMapRetry]
        );

        cluster.push_status(&owner, Status::KeyExists);
        let err = h.get("foo", 0).await.unwrap_err();
        assert_eq!(err.source, Error::Status(Status::KeyExists));
        assert_eq!(err.retry_attempts, 0);
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_cluster_level_config_rejects_key_operations() {
        let builder = ConfigBuilder::cluster(&HOSTS);
        let cluster = MockCluster::new(builder.build());
        let h = Harness::new("", cluster.clone(), PipelineConfig::default());
        assert!(h.apply(&builder));
        assert_eq!(h.mux.bucket_type().unwrap(), BucketType::None);
        assert!(h.mux.supports_gcccp().unwrap());

        let (req, _pending) = Request::builder(Command::Get).key("foo").build();
        assert!(matches!(
            h.mux.dispatch(req),
            Err(Error::Routing(RoutingError::GcccpInUse))
        ));

        let (req, pending) = Request::builder(Command::GetClusterConfig)
            .timeout(WAIT)
            .build();
        h.mux.dispatch_to_address(req, &kv_addr(HOSTS[1])).unwrap();
        pending.await.unwrap();

        let (req, pending) = Request::builder(Command::Noop)
            .pinned_node(2)
            .timeout(WAIT)
            .build();
        h.mux.dispatch(req).unwrap();
        assert_eq!(served_by(&pending.await.unwrap()), kv_addr(HOSTS[2]));

        let (req, _pending) = Request::builder(Command::Noop).pinned_node(7).build();
        assert!(matches!(
            h.mux.dispatch(req),
            Err(Error::Routing(RoutingError::InvalidServer(_)))
        ));
        let (req, _pending) = Request::builder(Command::Noop).build();
        assert!(matches!(
            h.mux.dispatch_to_address(req, "10.9.9.9:11210"),
            Err(Error::Routing(RoutingError::InvalidServer(_)))
        ));
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_server_group_routing() {
        let builder = ConfigBuilder::partitioned("default", &HOSTS)
            .vbuckets(64, 1)
            .server_groups(&["g1", "g2", "g3"]);
        let h = Harness::new(
            "default",
            MockCluster::new(builder.build()),
            PipelineConfig::default(),
        );
        assert!(h.apply(&builder));

        let vb = h.mux.key_to_vbucket(b"foo").unwrap() as usize;
        let owner_idx = builder.vbucket_map()[vb][0] as usize;
        let group = format!("g{}", owner_idx + 1);
        let wrong = format!("g{}", (owner_idx + 1) % 3 + 1);

        let (req, pending) = Request::builder(Command::Get)
            .key("foo")
            .server_group(group)
            .timeout(WAIT)
            .build();
        h.mux.dispatch(req).unwrap();
        assert_eq!(served_by(&pending.await.unwrap()), kv_addr(HOSTS[owner_idx]));

        let (req, _pending) = Request::builder(Command::Get)
            .key("foo")
            .server_group(wrong)
            .build();
        assert!(matches!(
            h.mux.dispatch(req),
            Err(Error::Routing(RoutingError::ServerGroupMismatch { .. }))
        ));
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_full_queue_overloads() {
        let builder = ConfigBuilder::partitioned("default", &HOSTS);
        let h = Harness::new(
            "default",
            MockCluster::new(builder.build()),
            PipelineConfig::default().with_max_queue_size(2),
        );

        let mut pending = Vec::new();
        for i in 0..2 {
            let (req, p) = Request::builder(Command::Get)
                .key(format!("k{}", i))
                .retry_strategy(Arc::new(FailFastRetryStrategy))
                .build();
            h.mux.dispatch(req).unwrap();
            pending.push(p);
        }
        let (req, _p) = Request::builder(Command::Get)
            .key("k3")
            .retry_strategy(Arc::new(FailFastRetryStrategy))
            .build();
        assert_eq!(h.mux.dispatch(req), Err(Error::Overload));

        h.mux.close().await.unwrap();
        for p in pending {
            assert_eq!(p.await.unwrap_err().source, Error::Shutdown);
        }
    }

    #[test(tokio::test)]
    async fn test_force_reconnect_replaces_connections() {
        let builder = ConfigBuilder::partitioned("default", &HOSTS);
        let cluster = MockCluster::new(builder.build());
        let h = Harness::new("default", cluster.clone(), PipelineConfig::default());
        assert!(h.apply(&builder));
        h.wait_connected(&HOSTS).await;

        h.mux
            .force_reconnect(None, Arc::new(PasswordAuth::new("rotated", "pw")), Vec::new());

        let c = cluster.clone();
        assert!(
            wait_until(
                || {
                    let rotated = c.dials().iter().filter(|d| d.username == "rotated").count();
                    rotated == 3 && HOSTS.iter().all(|host| c.open_connections(&kv_addr(host)) == 1)
                },
                WAIT
            )
            .await
        );
        for host in HOSTS {
            assert_eq!(cluster.dial_count(&kv_addr(host)), 2);
        }
        assert_eq!(h.mux.config_rev().unwrap(), 1);
        h.get("foo", 0).await.unwrap();
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_close_fails_queued_requests() {
        let builder = ConfigBuilder::partitioned("default", &HOSTS);
        let cluster = MockCluster::new(builder.build());
        let h = Harness::new("default", cluster.clone(), PipelineConfig::default());

        let (req, pending) = Request::builder(Command::Get).key("foo").build();
        h.mux.dispatch(req).unwrap();

        h.mux.close().await.unwrap();
        assert!(h.mux.is_closed());
        assert_eq!(pending.await.unwrap_err().source, Error::Shutdown);
        assert_eq!(cluster.open_connections(&kv_addr(HOSTS[0])), 0);

        let (req, _pending) = Request::builder(Command::Get).key("foo").build();
        assert_eq!(h.mux.dispatch(req), Err(Error::Shutdown));
        assert_eq!(h.mux.close().await, Err(Error::Shutdown));
    }

    #[test(tokio::test)]
    async fn test_change_notifications_reach_refresher() {
        let builder = ConfigBuilder::partitioned("default", &HOSTS).rev(3);
        let cluster = MockCluster::new(builder.build());
        let h = Harness::new("default", cluster.clone(), PipelineConfig::default());
        let refresher = Arc::new(CountingRefresher::default());
        let dyn_refresher: Arc<dyn ConfigRefresher> = refresher.clone();
        h.topology.set_refresher(Arc::downgrade(&dyn_refresher));
        assert!(h.apply(&builder));
        h.wait_connected(&HOSTS).await;

        cluster.notify_cluster_map_change(1, 2);
        cluster.notify_cluster_map_change(1, 4);
        assert!(wait_until(|| refresher.notifications.lock().len() == 3, WAIT).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let notifications = refresher.notifications.lock().clone();
        assert_eq!(notifications.len(), 3);
        assert!(notifications.iter().all(|n| *n == (1, 4)));
        h.mux.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_wait_for_config() {
        let builder = ConfigBuilder::partitioned("default", &HOSTS);
        let h = Harness::new(
            "default",
            MockCluster::new(builder.build()),
            PipelineConfig::default(),
        );

        let deadline = std::time::Instant::now() + Duration::from_millis(30);
        assert_eq!(
            h.mux.wait_for_config(deadline).await.err(),
            Some(Error::Timeout { ambiguous: false })
        );

        assert!(h.apply(&builder));
        let snapshot = h
            .mux
            .wait_for_config(std::time::Instant::now() + WAIT)
            .await
            .unwrap();
        assert_eq!(snapshot.rev_id(), 1);
        assert_eq!(snapshot.num_pipelines(), 3);
        h.mux.close().await.unwrap();
    }
}
