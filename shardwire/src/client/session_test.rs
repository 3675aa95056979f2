use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use futures::TryStreamExt;
use shardwire_cql::frame::response::result::Row;
use shardwire_cql::value::{CqlValue, SerializedValues};
use tokio::time::Instant;
use uuid::Uuid;

use super::session::Session;
use super::session_builder::SessionBuilder;
use crate::errors::{
    BadQuery, DbError, ExecutionError, RequestAttemptError, SchemaAgreementError,
    UseKeyspaceError,
};
use crate::policies::load_balancing::RoundRobinPolicy;
use crate::policies::speculative_execution::SimpleSpeculativeExecutionPolicy;
use crate::response::{PagingState, PagingStateResponse};
use crate::routing::Token;
use crate::statement::batch::{Batch, BatchType};
use crate::statement::Statement;
use crate::test_utils::mock_server::{int_rows, MockCluster, MockNodeConfig};
use crate::test_utils::setup_tracing;

const SELECT: &str = "SELECT v FROM ks.t";
const INSERT: &str = "INSERT INTO ks.t (v) VALUES (1)";

fn builder_for(mock: &MockCluster) -> SessionBuilder {
    SessionBuilder::new()
        .known_node_addr(mock.known_node())
        .schema_agreement_interval(Duration::from_millis(20))
}

async fn start(nodes: usize) -> (MockCluster, Session) {
    let mock = MockCluster::start(vec![MockNodeConfig::default(); nodes]).await;
    let session = builder_for(&mock).build().await.unwrap();
    (mock, session)
}

fn ints(rows: &[Row]) -> Vec<i32> {
    rows.iter()
        .map(|row| match row.columns.as_slice() {
            [Some(CqlValue::Int(v))] => *v,
            other => panic!("unexpected row {other:?}"),
        })
        .collect()
}

fn idempotent(text: &str) -> Statement {
    let mut statement = Statement::new(text);
    statement.set_is_idempotent(true);
    statement
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn discovers_cluster_and_queries() {
    setup_tracing();
    let (mock, session) = start(3).await;
    mock.set_rows(SELECT, int_rows(10));

    let state = session.get_cluster_state();
    assert_eq!(state.get_nodes_info().len(), 3);
    assert!(state.get_keyspace("ks").is_some());

    let result = session
        .query_unpaged(SELECT, &SerializedValues::new())
        .await
        .unwrap();
    assert_eq!(result.rows_num(), Some(10));
    assert_eq!(ints(result.rows().unwrap()), (0..10).collect::<Vec<_>>());
    assert!(result.request_coordinator().is_some());

    let result = session
        .query_unpaged(INSERT, &SerializedValues::new())
        .await
        .unwrap();
    assert!(!result.is_rows());
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn query_iter_follows_pages() {
    setup_tracing();
    let (mock, session) = start(2).await;
    mock.set_rows(SELECT, int_rows(10));

    let before = mock.total_user_queries();
    let pager = session
        .query_iter(Statement::new(SELECT).with_page_size(3), SerializedValues::new())
        .await
        .unwrap();
    assert_eq!(pager.column_specs().len(), 1);
    let rows: Vec<Row> = pager.try_collect().await.unwrap();

    assert_eq!(ints(&rows), (0..10).collect::<Vec<_>>());
    assert_eq!(mock.total_user_queries() - before, 4);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn query_single_page_resumes_from_paging_state() {
    setup_tracing();
    let (mock, session) = start(1).await;
    mock.set_rows(SELECT, int_rows(5));
    let statement = Statement::new(SELECT).with_page_size(3);

    let (first, paging_state_response) = session
        .query_single_page(statement.clone(), &SerializedValues::new(), PagingState::start())
        .await
        .unwrap();
    assert_eq!(ints(first.rows().unwrap()), vec![0, 1, 2]);
    let PagingStateResponse::HasMorePages { state } = paging_state_response else {
        panic!("expected more pages");
    };

    let (second, paging_state_response) = session
        .query_single_page(statement, &SerializedValues::new(), state)
        .await
        .unwrap();
    assert_eq!(ints(second.rows().unwrap()), vec![3, 4]);
    assert!(paging_state_response.finished());
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn use_keyspace_sets_and_validates() {
    setup_tracing();
    let mock = MockCluster::start(vec![MockNodeConfig::default(); 2]).await;
    let session = builder_for(&mock)
        .use_keyspace("ks", false)
        .build()
        .await
        .unwrap();
    assert_eq!(session.get_keyspace().as_deref().map(String::as_str), Some("ks"));

    assert_matches!(
        session.use_keyspace("not a keyspace!", false).await,
        Err(UseKeyspaceError::BadKeyspaceName(_))
    );
    assert_eq!(session.get_keyspace().as_deref().map(String::as_str), Some("ks"));

    session
        .query_unpaged("USE other_ks", &SerializedValues::new())
        .await
        .unwrap();
    assert_eq!(
        session.get_keyspace().as_deref().map(String::as_str),
        Some("other_ks")
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn retries_follow_idempotence() {
    setup_tracing();
    let (mock, session) = start(3).await;
    mock.set_query_error(INSERT, DbError::Overloaded);

    let error = session
        .query_unpaged(idempotent(INSERT), &SerializedValues::new())
        .await
        .unwrap_err();
    assert_matches!(
        error,
        ExecutionError::AllAttemptsFailed {
            last_error: RequestAttemptError::DbError(DbError::Overloaded, _),
            ref attempts,
        } if attempts.len() == 3
    );

    let before = mock.total_user_queries();
    assert_matches!(
        session
            .query_unpaged(INSERT, &SerializedValues::new())
            .await,
        Err(ExecutionError::LastAttemptError(RequestAttemptError::DbError(
            DbError::Overloaded,
            _
        )))
    );
    assert_eq!(mock.total_user_queries() - before, 1);

    mock.clear_query_error(INSERT);
    session
        .query_unpaged(INSERT, &SerializedValues::new())
        .await
        .unwrap();
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn token_aware_routing_targets_the_replica() {
    setup_tracing();
    let (mock, session) = start(3).await;

    // Node tokens are 1000, 2000 and 3000, so 1500 belongs to the second node.
    let mut statement = Statement::new(INSERT);
    statement.set_token(Some("ks".to_owned()), Token::new(1500));

    let before = mock.nodes()[1].user_queries();
    for _ in 0..5 {
        let result = session
            .query_unpaged(statement.clone(), &SerializedValues::new())
            .await
            .unwrap();
        let coordinator = result.request_coordinator().unwrap();
        assert_eq!(coordinator.host().host_id, mock.nodes()[1].host_id());
        assert_eq!(
            coordinator.connection_address().ip(),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2))
        );
    }
    assert_eq!(mock.nodes()[1].user_queries() - before, 5);

    // With two replicas per datacenter the next node on the ring joins in.
    mock.add_keyspace(
        "nts",
        &[("class", "NetworkTopologyStrategy"), ("dc1", "2")],
    );
    session.refresh_metadata().await.unwrap();
    assert!(session.get_cluster_state().get_keyspace("nts").is_some());

    statement.set_token(Some("nts".to_owned()), Token::new(1500));
    let first_node_before = mock.nodes()[0].user_queries();
    for _ in 0..10 {
        let result = session
            .query_unpaged(statement.clone(), &SerializedValues::new())
            .await
            .unwrap();
        let host_id = result.request_coordinator().unwrap().host().host_id;
        assert!(host_id == mock.nodes()[1].host_id() || host_id == mock.nodes()[2].host_id());
    }
    assert_eq!(mock.nodes()[0].user_queries(), first_node_before);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn schema_change_waits_for_agreement() {
    setup_tracing();
    let mock = MockCluster::start(vec![MockNodeConfig::default(); 2]).await;
    let session = builder_for(&mock)
        .schema_agreement_timeout(Duration::from_millis(300))
        .build()
        .await
        .unwrap();

    session
        .query_unpaged("CREATE TABLE ks.t2 (a int PRIMARY KEY)", &SerializedValues::new())
        .await
        .unwrap();
    assert_eq!(
        session.check_schema_agreement().await.unwrap(),
        Some(mock.schema_version())
    );

    mock.nodes()[1].set_schema_version(Uuid::new_v4());
    assert_matches!(
        session
            .query_unpaged("DROP TABLE ks.t2", &SerializedValues::new())
            .await,
        Err(ExecutionError::SchemaAgreementError(
            SchemaAgreementError::Timeout(_)
        ))
    );
    assert_eq!(session.check_schema_agreement().await.unwrap(), None);

    let session = builder_for(&mock)
        .auto_await_schema_agreement(false)
        .build()
        .await
        .unwrap();
    session
        .query_unpaged("DROP TABLE ks.t2", &SerializedValues::new())
        .await
        .unwrap();
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn schema_agreement_can_be_canceled() {
    setup_tracing();
    let (mock, session) = start(2).await;

    assert_matches!(
        session
            .await_schema_agreement_with_cancel(std::future::ready(()))
            .await,
        Err(SchemaAgreementError::Canceled)
    );

    assert_eq!(
        session.await_schema_agreement().await.unwrap(),
        mock.schema_version()
    );

    mock.nodes()[0].set_schema_version(Uuid::new_v4());
    assert_matches!(
        session
            .await_schema_agreement_with_cancel(tokio::time::sleep(Duration::from_millis(100)))
            .await,
        Err(SchemaAgreementError::Canceled)
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn closed_session_refuses_everything() {
    setup_tracing();
    let (mock, session) = start(2).await;
    let session = Arc::new(session);

    for node in mock.nodes() {
        node.set_delay(Duration::from_secs(5));
    }
    let pending = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .query_unpaged(SELECT, &SerializedValues::new())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    session.close();
    session.close();
    assert!(session.is_closed());
    assert_matches!(pending.await.unwrap(), Err(ExecutionError::SessionClosed));

    assert_matches!(
        session
            .query_unpaged(SELECT, &SerializedValues::new())
            .await,
        Err(ExecutionError::SessionClosed)
    );
    assert_matches!(
        session.await_schema_agreement().await,
        Err(SchemaAgreementError::SessionClosed)
    );
    assert_matches!(
        session.check_schema_agreement().await,
        Err(SchemaAgreementError::SessionClosed)
    );
    assert_matches!(
        session.use_keyspace("ks", false).await,
        Err(UseKeyspaceError::SessionClosed)
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn request_timeout_covers_all_attempts() {
    setup_tracing();
    let mock = MockCluster::start(vec![MockNodeConfig::default(); 2]).await;
    let session = builder_for(&mock)
        .request_timeout(Some(Duration::from_millis(200)))
        .build()
        .await
        .unwrap();
    for node in mock.nodes() {
        node.set_delay(Duration::from_secs(5));
    }

    assert_matches!(
        session
            .query_unpaged(SELECT, &SerializedValues::new())
            .await,
        Err(ExecutionError::RequestTimeout(timeout)) if timeout == Duration::from_millis(200)
    );

    let mut statement = Statement::new(SELECT);
    statement.set_request_timeout(Some(Duration::from_millis(50)));
    assert_matches!(
        session
            .query_unpaged(statement, &SerializedValues::new())
            .await,
        Err(ExecutionError::RequestTimeout(timeout)) if timeout == Duration::from_millis(50)
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn speculative_execution_outruns_slow_nodes() {
    setup_tracing();
    let mock = MockCluster::start(vec![MockNodeConfig::default(); 3]).await;
    let session = builder_for(&mock)
        .load_balancing(Arc::new(RoundRobinPolicy::new()))
        .speculative_execution(Arc::new(SimpleSpeculativeExecutionPolicy {
            max_retry_count: 2,
            retry_interval: Duration::from_millis(50),
        }))
        .build()
        .await
        .unwrap();
    mock.nodes()[0].set_delay(Duration::from_secs(3));
    mock.nodes()[1].set_delay(Duration::from_secs(3));

    // Whichever node the plan starts with, the fast one is tried in time.
    for _ in 0..3 {
        let started = Instant::now();
        let result = session
            .query_unpaged(idempotent(SELECT), &SerializedValues::new())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(
            result.request_coordinator().unwrap().host().host_id,
            mock.nodes()[2].host_id()
        );
    }
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn batches() {
    setup_tracing();
    let (mock, session) = start(2).await;

    let mut batch = Batch::new(BatchType::Logged);
    assert_matches!(
        session.batch(&batch).await,
        Err(ExecutionError::BadQuery(BadQuery::EmptyBatch))
    );

    batch.append_statement(INSERT, SerializedValues::new());
    batch.append_statement("INSERT INTO ks.t (v) VALUES (2)", SerializedValues::new());
    let before = mock.total_user_queries();
    let result = session.batch(&batch).await.unwrap();
    assert!(!result.is_rows());
    assert_eq!(mock.total_user_queries() - before, 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn custom_payload_round_trips() {
    setup_tracing();
    let (mock, session) = start(1).await;
    mock.set_rows(SELECT, int_rows(1));

    let result = session
        .query_unpaged(SELECT, &SerializedValues::new())
        .await
        .unwrap();
    assert_eq!(result.custom_payload(), None);

    let payload: HashMap<String, Option<Bytes>> = [
        ("tenant".to_owned(), Some(Bytes::from_static(b"blue"))),
        ("empty".to_owned(), Some(Bytes::new())),
        ("cleared".to_owned(), None),
    ]
    .into_iter()
    .collect();

    let mut statement = Statement::new(SELECT);
    statement.set_custom_payload(Some(payload.clone()));
    let result = session
        .query_unpaged(statement, &SerializedValues::new())
        .await
        .unwrap();
    assert_eq!(result.custom_payload(), Some(&payload));
    assert_eq!(ints(result.rows().unwrap()), vec![0]);

    let mut batch = Batch::new(BatchType::Unlogged);
    batch.append_statement(INSERT, SerializedValues::new());
    batch.set_custom_payload(Some(payload.clone()));
    let result = session.batch(&batch).await.unwrap();
    assert_eq!(result.custom_payload(), Some(&payload));
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn password_authentication() {
    setup_tracing();
    let config = MockNodeConfig {
        credentials: Some(("cassandra".to_owned(), "secret".to_owned())),
        ..Default::default()
    };
    let mock = MockCluster::start(vec![config; 2]).await;

    let session = builder_for(&mock)
        .user("cassandra", "secret")
        .build()
        .await
        .unwrap();
    session
        .query_unpaged(SELECT, &SerializedValues::new())
        .await
        .unwrap();

    assert!(builder_for(&mock)
        .user("cassandra", "wrong")
        .build()
        .await
        .is_err());
    assert!(builder_for(&mock).build().await.is_err());
}
