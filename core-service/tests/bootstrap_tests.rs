//! Bootstrap wiring with injected bridges.

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use bridge_traits::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkType};
use core_service::{CoreConfig, CoreService, DrainOutcome, Operation, SyncSettings, SyncState};
use mockall::mock;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

mock! {
    Http {}

    #[async_trait]
    impl HttpClient for Http {
        async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse>;
    }
}

struct FixedNetwork {
    online: bool,
}

struct SilentStream;

#[async_trait]
impl NetworkChangeStream for SilentStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        std::future::pending().await
    }
}

#[async_trait]
impl NetworkMonitor for FixedNetwork {
    async fn get_network_info(&self) -> BridgeResult<NetworkInfo> {
        Ok(if self.online {
            NetworkInfo::connected(NetworkType::Ethernet)
        } else {
            NetworkInfo::disconnected()
        })
    }

    async fn subscribe_changes(&self) -> BridgeResult<Box<dyn NetworkChangeStream>> {
        Ok(Box::new(SilentStream))
    }
}

fn temp_db() -> PathBuf {
    std::env::temp_dir().join(format!("household-queue-{}.db", uuid::Uuid::new_v4()))
}

fn config(db: &PathBuf, http: MockHttp, online: bool) -> CoreConfig {
    CoreConfig::builder()
        .database_path(db)
        .remote_base_url("https://sync.example.com/v1")
        .http_client(Arc::new(http))
        .network_monitor(Arc::new(FixedNetwork { online }))
        .device_label("test-device")
        .sync_settings(
            SyncSettings::default()
                .with_sync_interval(None)
                .with_purge_synced(false),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_queue_survives_restart_while_offline() {
    let db = temp_db();

    {
        let core = CoreService::bootstrap(config(&db, MockHttp::new(), false))
            .await
            .unwrap();
        let outcome = core.start_session("hh", "user").await.unwrap();
        assert_eq!(outcome, DrainOutcome::SkippedOffline);
        assert_eq!(core.engine().state(), SyncState::Offline);

        core.engine()
            .enqueue("transaction", "T1", Operation::Create, json!({ "amount": 3 }), None)
            .await
            .unwrap();
        core.end_session().await;
    }

    let core = CoreService::bootstrap(config(&db, MockHttp::new(), false))
        .await
        .unwrap();
    let pending = core.engine().get_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entity_id, "T1");

    let _ = std::fs::remove_file(&db);
}

#[tokio::test]
async fn test_drain_goes_through_rest_store() {
    let db = temp_db();

    let mut http = MockHttp::new();
    http.expect_execute().times(1).returning(|req| {
        assert_eq!(req.method, HttpMethod::Put);
        assert_eq!(
            req.url,
            "https://sync.example.com/v1/households/hh/transaction/T9"
        );
        Ok(HttpResponse {
            status: 201,
            headers: Default::default(),
            body: r#"{"version":1}"#.into(),
        })
    });

    let core = CoreService::bootstrap(config(&db, http, true)).await.unwrap();
    core.start_session("hh", "user").await.unwrap();
    let observer = core.observer().await.unwrap();

    let queued = core
        .engine()
        .enqueue("transaction", "T9", Operation::Create, json!({ "amount": 9 }), None)
        .await
        .unwrap();

    match observer.sync_now().await.unwrap() {
        DrainOutcome::Completed(report) => assert_eq!(report.synced, 1),
        other => panic!("expected completed drain, got {:?}", other),
    }

    let entry = core.engine().queue().get(queued.id).await.unwrap().unwrap();
    assert_eq!(entry.status, core_service::ChangeStatus::Synced);
    assert_eq!(observer.refresh().await.unwrap().pending_count, 0);

    core.end_session().await;
    let _ = std::fs::remove_file(&db);
}
