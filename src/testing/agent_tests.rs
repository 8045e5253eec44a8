//! End-to-end tests for the routing agent.

#[cfg(test)]
mod tests {
    use crate::config::{AgentConfig, PollerConfig};
    use crate::error::Error;
    use crate::memd::Command;
    use crate::pipeline::Request;
    use crate::testing::{kv_addr, mgmt_endpoint, wait_until, ConfigBuilder, MockCluster, MockConfigStreamer};
    use crate::types::{BucketType, PasswordAuth};
    use crate::RoutingAgent;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use test_log::test;

    const HOSTS: [&str; 3] = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];
    const WAIT: Duration = Duration::from_secs(5);

    fn agent_config(bucket: &str) -> AgentConfig {
        AgentConfig::new(bucket, vec![kv_addr(HOSTS[0])])
            .with_seed_mgmt_endpoints(vec![mgmt_endpoint(HOSTS[0])])
            .with_auth(Arc::new(PasswordAuth::new("app", "secret")))
            .with_poller_config(
                PollerConfig::default()
                    .with_cccp_poll_period(Duration::from_millis(50))
                    .with_cccp_max_wait(Duration::from_millis(500))
                    .with_http_retry_delay(Duration::from_millis(50)),
            )
    }

    #[test(tokio::test)]
    async fn test_connect_requires_seeds() {
        let cluster = MockCluster::new(ConfigBuilder::partitioned("default", &HOSTS).build());
        let result = RoutingAgent::connect(
            AgentConfig::new("default", Vec::new()),
            cluster.provider(),
            MockConfigStreamer::new(),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_agent_lifecycle() {
        let builder = ConfigBuilder::partitioned("default", &HOSTS).vbuckets(1024, 2);
        let cluster = MockCluster::new(builder.build());
        let agent = RoutingAgent::connect(
            agent_config("default"),
            cluster.provider(),
            MockConfigStreamer::new(),
        )
        .await
        .unwrap();

        let (req, pending) = Request::builder(Command::Get)
            .key("early")
            .timeout(WAIT)
            .build();
        agent.dispatch(req).unwrap();

        agent.wait_until_ready(Instant::now() + WAIT).await.unwrap();
        pending.await.unwrap();

        let mux = agent.mux();
        assert_eq!(mux.bucket_type().unwrap(), BucketType::Partitioned);
        assert_eq!(mux.num_replicas().unwrap(), 2);
        assert_eq!(mux.config_uuid().unwrap(), "default-uuid");
        assert_eq!(mux.num_pipelines().unwrap(), 3);

        let vb = mux.key_to_vbucket(b"doc").unwrap() as usize;
        let owners = &builder.vbucket_map()[vb];
        for replica in 0..3 {
            let (req, pending) = Request::builder(Command::Get)
                .key("doc")
                .replica_index(replica)
                .timeout(WAIT)
                .build();
            agent.dispatch(req).unwrap();
            let resp = pending.await.unwrap();
            assert_eq!(resp.source_addr, kv_addr(HOSTS[owners[replica as usize] as usize]));
        }

        let (req, pending) = Request::builder(Command::Noop).timeout(WAIT).build();
        agent.dispatch_to_address(req, &kv_addr(HOSTS[2])).unwrap();
        assert_eq!(pending.await.unwrap().source_addr, kv_addr(HOSTS[2]));

        assert!(cluster
            .dials()
            .iter()
            .all(|d| d.username == "app" && !d.tls));

        agent.force_reconnect(None, Arc::new(PasswordAuth::new("app2", "secret2")), Vec::new());
        let c = cluster.clone();
        assert!(
            wait_until(
                || c.dials().iter().filter(|d| d.username == "app2").count() == 3,
                WAIT
            )
            .await
        );

        let (req, pending) = Request::builder(Command::Get)
            .key("after-reconnect")
            .timeout(WAIT)
            .build();
        agent.dispatch(req).unwrap();
        pending.await.unwrap();

        agent.close().await.unwrap();
        assert!(mux.is_closed());
        for host in HOSTS {
            assert_eq!(cluster.open_connections(&kv_addr(host)), 0);
        }
        let (req, _pending) = Request::builder(Command::Get).key("late").build();
        assert_eq!(agent.dispatch(req), Err(Error::Shutdown));
    }

    #[test(tokio::test)]
    async fn test_cluster_level_agent() {
        let cluster = MockCluster::new(ConfigBuilder::cluster(&HOSTS).build());
        let agent = RoutingAgent::connect(
            agent_config(""),
            cluster.provider(),
            MockConfigStreamer::new(),
        )
        .await
        .unwrap();

        agent.wait_until_ready(Instant::now() + WAIT).await.unwrap();
        assert_eq!(agent.mux().bucket_type().unwrap(), BucketType::None);
        assert!(agent.mux().supports_gcccp().unwrap());
        assert_eq!(agent.mux().num_pipelines().unwrap(), 3);
        agent.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_survives_node_failure() {
        let builder = ConfigBuilder::partitioned("default", &HOSTS);
        let cluster = MockCluster::new(builder.build());
        let agent = RoutingAgent::connect(
            agent_config("default"),
            cluster.provider(),
            MockConfigStreamer::new(),
        )
        .await
        .unwrap();
        agent.wait_until_ready(Instant::now() + WAIT).await.unwrap();

        let failed = kv_addr(HOSTS[1]);
        let c = cluster.clone();
        assert!(wait_until(|| c.open_connections(&failed) == 1, WAIT).await);
        cluster.set_node_down(&failed, true);

        let shrunk = ConfigBuilder::partitioned("default", &[HOSTS[0], HOSTS[2]]).rev(2);
        cluster.set_config(shrunk.build());
        let mux = agent.mux().clone();
        assert!(wait_until(|| mux.config_rev().ok() == Some(2), WAIT).await);
        assert_eq!(mux.num_pipelines().unwrap(), 2);

        for i in 0..20 {
            let (req, pending) = Request::builder(Command::Get)
                .key(format!("key-{}", i))
                .timeout(WAIT)
                .build();
            agent.dispatch(req).unwrap();
            assert_ne!(pending.await.unwrap().source_addr, failed);
        }
        agent.close().await.unwrap();
    }
}
