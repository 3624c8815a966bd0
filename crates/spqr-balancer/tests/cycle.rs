//! One full balancer cycle against an in-process coordinator and
//! scripted shards: the hot shard's range must move to the cold one
//! through a lock, move, unlock sequence.

use spqr_balancer::{Balancer, CoordinatorClient, RANGE_STATS_QUERY};
use spqr_common::proto::balancer_service_server::BalancerServiceServer;
use spqr_common::proto::key_range_service_server::KeyRangeServiceServer;
use spqr_common::proto::operation_service_server::OperationServiceServer;
use spqr_common::proto::shard_service_server::ShardServiceServer;
use spqr_common::{BackendRule, BalancerSettings, MemKv, SslMode};
use spqr_coordinator::{OperationRegistry, SpqrCoordinator};
use spqr_qrouter::{KeyRange, RoutingMap, Shard};
use spqr_router::pg_wire::protocol::{
    read_frame, read_startup_frame, write_backend, BackendMessage, FieldDescription,
    FrontendMessage,
};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Shard that answers the range_stats query with fixed rows.
async fn spawn_stats_shard(rows: Vec<[&'static str; 6]>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let rows = rows.clone();
            tokio::spawn(async move {
                if read_startup_frame(&mut socket).await.is_err() {
                    return;
                }
                write_backend(&mut socket, &BackendMessage::AuthenticationOk)
                    .await
                    .unwrap();
                write_backend(&mut socket, &BackendMessage::ReadyForQuery { status: b'I' })
                    .await
                    .unwrap();

                while let Ok(Some((tag, body))) = read_frame(&mut socket).await {
                    if tag != b'Q' {
                        continue;
                    }
                    let sql = match FrontendMessage::decode(tag, &body).unwrap() {
                        FrontendMessage::Query(sql) => sql,
                        _ => continue,
                    };
                    assert_eq!(sql, RANGE_STATS_QUERY);

                    let fields = ["lower", "upper", "rows", "bytes", "reads", "writes"]
                        .map(FieldDescription::text)
                        .to_vec();
                    write_backend(&mut socket, &BackendMessage::RowDescription { fields })
                        .await
                        .unwrap();
                    for row in &rows {
                        write_backend(
                            &mut socket,
                            &BackendMessage::DataRow {
                                values: row.iter().map(|c| Some(c.as_bytes().to_vec())).collect(),
                            },
                        )
                        .await
                        .unwrap();
                    }
                    write_backend(
                        &mut socket,
                        &BackendMessage::CommandComplete {
                            tag: format!("SELECT {}", rows.len()),
                        },
                    )
                    .await
                    .unwrap();
                    write_backend(&mut socket, &BackendMessage::ReadyForQuery { status: b'I' })
                        .await
                        .unwrap();
                }
            });
        }
    });

    addr
}

#[tokio::test]
async fn test_cycle_moves_hot_range_to_cold_shard() {
    // Shard 1 carries all the load, shard 2 is idle.
    let shard1 = spawn_stats_shard(vec![["0x00", "0x80", "1000", "65536", "90", "10"]]).await;
    let shard2 = spawn_stats_shard(vec![["0x80", "0xff", "10", "4096", "0", "0"]]).await;

    let kv = Arc::new(MemKv::new());
    let map = Arc::new(RoutingMap::load(kv.clone(), false).await.unwrap());
    map.add_shard(Shard {
        id: "sh1".into(),
        hosts: vec![shard1],
        world: false,
    })
    .await
    .unwrap();
    map.add_shard(Shard {
        id: "sh2".into(),
        hosts: vec![shard2],
        world: false,
    })
    .await
    .unwrap();
    map.add_key_range(KeyRange::new("r1".into(), "sh1".into(), vec![0x00], vec![0x80]).unwrap())
        .await
        .unwrap();
    map.add_key_range(KeyRange::new("r2".into(), "sh2".into(), vec![0x80], vec![0xff]).unwrap())
        .await
        .unwrap();

    let registry = Arc::new(OperationRegistry::load(kv).await.unwrap());
    let coordinator = SpqrCoordinator::new(map.clone(), registry);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let coordinator_addr = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(KeyRangeServiceServer::new(coordinator.clone()))
            .add_service(ShardServiceServer::new(coordinator.clone()))
            .add_service(OperationServiceServer::new(coordinator.clone()))
            .add_service(BalancerServiceServer::new(coordinator))
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    let client = CoordinatorClient::connect(&coordinator_addr, 3).await.unwrap();
    let settings = BalancerSettings {
        period_secs: 30,
        epsilon: 0.1,
        theta: 0.0,
        max_retries: 3,
    };
    let stats_rule = BackendRule {
        user: "spqr".into(),
        database: "postgres".into(),
        password: None,
        ssl_mode: SslMode::Disable,
    };

    let mut balancer = Balancer::new(client, settings, stats_rule);
    balancer.cycle().await.unwrap();

    // Exactly one move: r1 now lives on sh2 and the lock is gone.
    let snapshot = map.snapshot();
    let r1 = snapshot.ranges.iter().find(|r| r.id == "r1").unwrap();
    assert_eq!(r1.shard_id, "sh2");
    assert!(!r1.locked);
    let r2 = snapshot.ranges.iter().find(|r| r.id == "r2").unwrap();
    assert_eq!(r2.shard_id, "sh2");

    // A second cycle re-reads the same canned statistics; whatever it
    // proposes must leave the map converged and no lock behind.
    balancer.cycle().await.unwrap();
    let snapshot = map.snapshot();
    assert!(snapshot.ranges.iter().all(|r| r.shard_id == "sh2"));
    assert_eq!(snapshot.ranges.iter().filter(|r| r.locked).count(), 0);
}
