//! Tests for a single KV connection against a mock node.

#[cfg(test)]
mod tests {
    use crate::error::{Error, NetworkError};
    use crate::memd::{Command, ConnectionProvider, Disposition, KvClient, Packet, ResponseHandler, Status};
    use crate::pipeline::{Request, Response};
    use crate::testing::{kv_addr, ConfigBuilder, MockCluster};
    use crate::types::{PasswordAuth, RouteEndpoint};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;

    #[derive(Default)]
    struct RecordingHandler {
        errors: Mutex<Vec<Error>>,
        server_requests: Mutex<Vec<(Command, String)>>,
    }

    impl ResponseHandler for RecordingHandler {
        fn handle_error(&self, _resp: Option<&Response>, _req: &Arc<Request>, err: Error) -> Disposition {
            self.errors.lock().push(err.clone());
            Disposition::Fail(err)
        }

        fn handle_server_request(&self, packet: Packet, source_addr: &str) {
            self.server_requests
                .lock()
                .push((packet.command, source_addr.to_string()));
        }
    }

    async fn connect(cluster: &Arc<MockCluster>) -> (Arc<KvClient>, Arc<RecordingHandler>) {
        let address = kv_addr("10.0.0.1");
        let conn = cluster
            .provider()
            .dial(
                &RouteEndpoint::new(address.clone()),
                None,
                &PasswordAuth::new("user", "pass"),
                &[],
            )
            .await
            .unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let client = KvClient::start(address, conn, handler.clone());
        (client, handler)
    }

    fn cluster() -> Arc<MockCluster> {
        MockCluster::new(ConfigBuilder::partitioned("default", &["10.0.0.1"]).build())
    }

    #[test(tokio::test)]
    async fn test_response_resolves_request() {
        let cluster = cluster();
        let (client, _handler) = connect(&cluster).await;

        let (req, pending) = Request::builder(Command::Get).key("doc").vbucket(7).build();
        client.send_request(req.clone()).await.unwrap();
        let resp = pending.await.unwrap();

        assert_eq!(resp.source_addr, kv_addr("10.0.0.1"));
        assert_eq!(&resp.packet.key[..], b"doc");
        assert_eq!(client.in_flight(), 0);
        assert_eq!(req.last_dispatched_to().as_deref(), Some(kv_addr("10.0.0.1").as_str()));

        let recorded = cluster.requests_for(Command::Get);
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].vbucket, 7);
        client.close().await;
    }

    #[test(tokio::test)]
    async fn test_error_status_goes_to_handler() {
        let cluster = cluster();
        let (client, handler) = connect(&cluster).await;
        cluster.push_status(&kv_addr("10.0.0.1"), Status::KeyNotFound);

        let (req, pending) = Request::builder(Command::Get).key("missing").build();
        client.send_request(req).await.unwrap();
        let err = pending.await.unwrap_err();

        assert_eq!(err.source, Error::Status(Status::KeyNotFound));
        assert_eq!(err.status, Some(Status::KeyNotFound));
        assert_eq!(*handler.errors.lock(), vec![Error::Status(Status::KeyNotFound)]);
        client.close().await;
    }

    #[test(tokio::test)]
    async fn test_connection_drop_fails_in_flight() {
        let cluster = cluster();
        cluster.set_response_delay(Duration::from_secs(5));
        let (client, handler) = connect(&cluster).await;

        let (req, pending) = Request::builder(Command::Get).key("doc").build();
        client.send_request(req).await.unwrap();
        assert_eq!(client.in_flight(), 1);

        cluster.drop_connections(&kv_addr("10.0.0.1"));
        let err = pending.await.unwrap_err();
        assert_eq!(err.source, Error::Network(NetworkError::ConnectionClosed));
        assert_eq!(
            *handler.errors.lock(),
            vec![Error::Network(NetworkError::ConnectionClosed)]
        );

        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .unwrap();
        let (req, _pending) = Request::builder(Command::Get).key("doc").build();
        assert_eq!(
            client.send_request(req).await,
            Err(Error::Network(NetworkError::ClientClosed))
        );
    }

    #[test(tokio::test)]
    async fn test_graceful_close_waits_for_in_flight() {
        let cluster = cluster();
        cluster.set_response_delay(Duration::from_millis(100));
        let (client, handler) = connect(&cluster).await;

        let (req, pending) = Request::builder(Command::Get).key("doc").build();
        client.send_request(req).await.unwrap();
        client.graceful_close(None);
        assert!(client.is_closing());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!client.is_closed());

        pending.await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .unwrap();
        assert!(handler.errors.lock().is_empty());
        assert_eq!(cluster.open_connections(&kv_addr("10.0.0.1")), 0);
    }

    #[test(tokio::test)]
    async fn test_cluster_map_notification_forwarded() {
        let cluster = cluster();
        let (client, handler) = connect(&cluster).await;

        cluster.notify_cluster_map_change(1, 9);
        let forwarded = crate::testing::wait_until(
            || !handler.server_requests.lock().is_empty(),
            Duration::from_secs(1),
        )
        .await;
        assert!(forwarded);
        assert_eq!(
            handler.server_requests.lock()[0],
            (Command::Set, kv_addr("10.0.0.1"))
        );
        client.close().await;
    }
}
