//! Execution of one logical request: the load balancing plan, a connection
//! per attempt, retry decisions and speculative fibers, and the follow-ups
//! that some results call for (keyspace changes and schema agreement).

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, trace_span, warn, Instrument};
use uuid::Uuid;

use crate::cluster::host::HostInfo;
use crate::cluster::worker::Cluster;
use crate::cluster::ClusterState;
use crate::errors::{
    BadQuery, ConnectionPoolError, ExecutionError, MetadataError, RequestAttemptError,
    SchemaAgreementError, UseKeyspaceError,
};
use crate::network::{Connection, VerifiedKeyspaceName};
use crate::policies::load_balancing::{LoadBalancingPolicy, Plan, RoutingInfo};
use crate::policies::retry::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};
use crate::policies::speculative_execution::{self, SpeculativeExecutionPolicy};
use crate::response::query_result::QueryResult;
use crate::response::{Coordinator, PagingState, PagingStateResponse, QueryResponse};
use crate::routing::Shard;
use crate::statement::batch::Batch;
use crate::statement::{
    Consistency, PageSize, SerialConsistency, Statement, StatementConfig, StatementRouting,
};
use shardwire_cql::value::SerializedValues;

/// Session-wide defaults, used where a statement does not override them.
#[derive(Debug, Clone)]
pub(crate) struct ExecutorConfig {
    pub(crate) default_consistency: Consistency,
    pub(crate) default_serial_consistency: Option<SerialConsistency>,
    pub(crate) request_timeout: Option<Duration>,

    pub(crate) load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
    pub(crate) speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,

    pub(crate) schema_agreement_interval: Duration,
    pub(crate) schema_agreement_timeout: Duration,
    pub(crate) schema_agreement_automatic_waiting: bool,
    pub(crate) refresh_metadata_on_auto_schema_agreement: bool,
}

/// Where one fiber of a request is at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecutorState {
    NotStarted,
    Attempting { host: SocketAddr, attempt: usize },
    Succeeded,
    Failed,
}

/// Bookkeeping of one fiber of a request.
pub(crate) struct QueryContext<'a> {
    routing_info: &'a RoutingInfo<'a>,
    is_idempotent: bool,
    /// Consistency of the next attempt; a retry decision may lower it.
    consistency: Consistency,
    retry_session: Box<dyn RetrySession>,
    retry_count: usize,
    deadline: Option<Instant>,

    /// Hosts tried so far, in order, with the error each returned.
    attempts: Vec<(SocketAddr, RequestAttemptError)>,
    /// Why the last host without a usable connection was skipped.
    pool_error: Option<ConnectionPoolError>,
    state: ExecutorState,
}

impl<'a> QueryContext<'a> {
    fn new(
        routing_info: &'a RoutingInfo<'a>,
        is_idempotent: bool,
        retry_session: Box<dyn RetrySession>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            routing_info,
            is_idempotent,
            consistency: routing_info.consistency,
            retry_session,
            retry_count: 0,
            deadline,
            attempts: Vec::new(),
            pool_error: None,
            state: ExecutorState::NotStarted,
        }
    }

    fn transition(&mut self, next: ExecutorState) {
        trace!(from = ?self.state, to = ?next, "Request state changed");
        self.state = next;
    }

    fn remaining_time(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn decide(&mut self, error: &RequestAttemptError) -> RetryDecision {
        self.retry_session.decide_should_retry(RequestInfo {
            error,
            is_idempotent: self.is_idempotent,
            consistency: self.consistency,
            attempt: self.retry_count,
        })
    }

    fn prepare_retry(&mut self, consistency: Option<Consistency>) {
        self.retry_count += 1;
        self.consistency = consistency.unwrap_or(self.consistency);
    }

    /// The error to report once the plan ran out of hosts. `None` if no
    /// host was even considered.
    fn into_exhausted_error(mut self) -> Option<ExecutionError> {
        self.transition(ExecutorState::Failed);
        match self.attempts.last() {
            Some((_, last_error)) => Some(ExecutionError::AllAttemptsFailed {
                last_error: last_error.clone(),
                attempts: self.attempts,
            }),
            None => self.pool_error.map(ExecutionError::ConnectionPoolError),
        }
    }
}

/// Outcome of a request that did not fail.
#[derive(Debug)]
pub(crate) enum RunRequestResult {
    /// The retry policy chose to treat a write error as success.
    IgnoredWriteError,
    Completed(QueryResponse),
}

/// A plan shared by the speculative fibers of one request; each host is
/// handed to exactly one of them.
struct SharedPlan<'a> {
    iter: Mutex<Plan<'a>>,
}

impl Iterator for &SharedPlan<'_> {
    type Item = Arc<HostInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next()
    }
}

/// Runs requests against the cluster. Shared by the session and the
/// pagers it created.
pub(crate) struct RequestExecutor {
    cluster: Cluster,
    config: ExecutorConfig,
    keyspace: ArcSwapOption<String>,
    closed: watch::Sender<bool>,
}

impl RequestExecutor {
    pub(crate) fn new(cluster: Cluster, config: ExecutorConfig) -> Self {
        Self {
            cluster,
            config,
            keyspace: ArcSwapOption::empty(),
            closed: watch::channel(false).0,
        }
    }

    pub(crate) fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub(crate) fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub(crate) fn keyspace(&self) -> Option<Arc<String>> {
        self.keyspace.load_full()
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`Self::close`] was called.
    async fn wait_closed(&self) {
        let mut receiver = self.closed.subscribe();
        // The sender lives in `self`, so this only fails on drop.
        let _ = receiver.wait_for(|closed| *closed).await;
    }

    /// Marks the executor closed, wakes up everything waiting on it and
    /// shuts the cluster down. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        debug!("Closing the session");
        self.cluster.close();
    }

    /// Fetches one page of `statement`, or all rows if `page_size` is `None`.
    pub(crate) async fn query_page(
        &self,
        statement: &Statement,
        values: &SerializedValues,
        page_size: Option<PageSize>,
        paging_state: PagingState,
    ) -> Result<(QueryResult, PagingStateResponse), ExecutionError> {
        let (result, coordinator) = self
            .run(
                &statement.config,
                &statement.routing,
                |connection: Arc<Connection>, consistency, serial_consistency| {
                    let paging_state = paging_state.clone();
                    async move {
                        connection
                            .query_raw_with_consistency(
                                statement,
                                values,
                                consistency,
                                serial_consistency,
                                page_size,
                                paging_state,
                            )
                            .await
                    }
                },
            )
            .await?;

        match result {
            RunRequestResult::Completed(response) => Ok(response
                .into_query_result_and_paging_state(Some(coordinator))?),
            RunRequestResult::IgnoredWriteError => Ok((
                QueryResult::new(Some(coordinator), None, None, Vec::new(), None),
                PagingStateResponse::NoMorePages,
            )),
        }
    }

    pub(crate) async fn batch(&self, batch: &Batch) -> Result<QueryResult, ExecutionError> {
        if batch.is_empty() {
            return Err(BadQuery::EmptyBatch.into());
        }

        let (result, coordinator) = self
            .run(
                &batch.config,
                batch.effective_routing(),
                |connection: Arc<Connection>, consistency, serial_consistency| async move {
                    connection
                        .batch_with_consistency(batch, consistency, serial_consistency)
                        .await
                },
            )
            .await?;

        match result {
            RunRequestResult::Completed(response) => Ok(response
                .into_query_result_and_paging_state(Some(coordinator))?
                .0),
            RunRequestResult::IgnoredWriteError => Ok(QueryResult::new(
                Some(coordinator),
                None,
                None,
                Vec::new(),
                None,
            )),
        }
    }

    fn routing_info<'a>(
        &self,
        cluster_state: &ClusterState,
        config: &StatementConfig,
        routing: &StatementRouting,
        session_keyspace: Option<&'a str>,
        keyspace: Option<&'a str>,
    ) -> Result<RoutingInfo<'a>, ExecutionError> {
        let token = match (routing.token, &routing.partition_key) {
            (Some(token), _) => Some(token),
            (None, Some(partition_key)) => Some(
                cluster_state
                    .compute_token(partition_key)
                    .map_err(BadQuery::from)?,
            ),
            (None, None) => None,
        };

        Ok(RoutingInfo {
            consistency: config.determine_consistency(self.config.default_consistency),
            serial_consistency: config
                .serial_consistency
                .unwrap_or(self.config.default_serial_consistency),
            token,
            keyspace: keyspace.or(session_keyspace),
        })
    }

    /// Runs `run_once` against hosts of the plan until it succeeds or the
    /// retry policy gives up, then applies the result's side effects.
    pub(crate) async fn run<'a, F, Fut>(
        &'a self,
        config: &'a StatementConfig,
        routing: &'a StatementRouting,
        run_once: F,
    ) -> Result<(RunRequestResult, Coordinator), ExecutionError>
    where
        F: Fn(Arc<Connection>, Consistency, Option<SerialConsistency>) -> Fut,
        Fut: Future<Output = Result<QueryResponse, RequestAttemptError>>,
    {
        if self.is_closed() {
            return Err(ExecutionError::SessionClosed);
        }

        let cluster_state = self.cluster.get_state();
        let session_keyspace = self.keyspace();
        let routing_info = self.routing_info(
            &cluster_state,
            config,
            routing,
            session_keyspace.as_deref().map(String::as_str),
            routing.keyspace.as_deref(),
        )?;

        let retry_policy = config
            .retry_policy
            .as_deref()
            .unwrap_or(&*self.config.retry_policy);
        let speculative_policy = config
            .speculative_execution_policy
            .as_ref()
            .or(self.config.speculative_execution_policy.as_ref());
        let timeout = config.request_timeout.or(self.config.request_timeout);
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let new_context = || {
            QueryContext::new(
                &routing_info,
                config.is_idempotent,
                retry_policy.new_session(),
                deadline,
            )
        };

        let runner = async {
            let plan = self.config.load_balancing.plan(&routing_info);
            match speculative_policy {
                Some(speculative) if config.is_idempotent => {
                    let shared_plan = SharedPlan {
                        iter: Mutex::new(plan),
                    };
                    speculative_execution::execute(speculative.as_ref(), |is_speculative| {
                        if is_speculative {
                            trace!("Starting a speculative fiber");
                        }
                        self.run_fiber(&shared_plan, &run_once, new_context())
                    })
                    .await
                }
                _ => self
                    .run_fiber(plan, &run_once, new_context())
                    .await
                    .unwrap_or(Err(ExecutionError::EmptyPlan)),
            }
        };

        let runner = async {
            tokio::select! {
                biased;
                () = self.wait_closed() => Err(ExecutionError::SessionClosed),
                result = runner => result,
            }
        };

        let result = match (timeout, deadline) {
            (Some(timeout), Some(deadline)) => tokio::time::timeout_at(deadline, runner)
                .await
                .unwrap_or(Err(ExecutionError::RequestTimeout(timeout))),
            _ => runner.await,
        };

        if let Ok((RunRequestResult::Completed(response), _)) = &result {
            self.handle_set_keyspace_response(response).await?;
            self.handle_auto_await_schema_agreement(response).await?;
        }

        result
    }

    /// Tries the hosts of `plan` in order. Returns `None` if the plan was
    /// empty from the start.
    async fn run_fiber<F, Fut>(
        &self,
        plan: impl Iterator<Item = Arc<HostInfo>>,
        run_once: &F,
        mut context: QueryContext<'_>,
    ) -> Option<Result<(RunRequestResult, Coordinator), ExecutionError>>
    where
        F: Fn(Arc<Connection>, Consistency, Option<SerialConsistency>) -> Fut,
        Fut: Future<Output = Result<QueryResponse, RequestAttemptError>>,
    {
        'hosts: for host in plan {
            let span = trace_span!("Executing request", node = %host.address);
            'same_host: loop {
                let connection = match self.connection_for(&host, &context) {
                    Ok(connection) => connection,
                    Err(error) => {
                        trace!(parent: &span, error = %error, "Choosing connection failed");
                        context.pool_error = Some(error);
                        continue 'hosts;
                    }
                };

                let connect_address = connection.get_connect_address();
                context.transition(ExecutorState::Attempting {
                    host: connect_address,
                    attempt: context.retry_count,
                });
                trace!(
                    parent: &span,
                    consistency = %context.consistency,
                    remaining_time = ?context.remaining_time(),
                    "Sending"
                );

                let shard = connection
                    .get_shard_info()
                    .as_ref()
                    .map(|info| Shard::from(info.shard));
                let coordinator = Coordinator::new(host.clone(), shard, connect_address);

                let error = match run_once(
                    connection,
                    context.consistency,
                    context.routing_info.serial_consistency,
                )
                .instrument(span.clone())
                .await
                .and_then(QueryResponse::into_non_error_query_response)
                {
                    Ok(response) => {
                        trace!(parent: &span, "Request succeeded");
                        context.transition(ExecutorState::Succeeded);
                        return Some(Ok((RunRequestResult::Completed(response), coordinator)));
                    }
                    Err(error) => error,
                };

                let decision = context.decide(&error);
                trace!(parent: &span, error = %error, decision = ?decision, "Request failed");

                match decision {
                    RetryDecision::RetrySameTarget(consistency) => {
                        context.attempts.push((connect_address, error));
                        context.prepare_retry(consistency);
                        continue 'same_host;
                    }
                    RetryDecision::RetryNextTarget(consistency) => {
                        context.attempts.push((connect_address, error));
                        context.prepare_retry(consistency);
                        continue 'hosts;
                    }
                    RetryDecision::DontRetry => {
                        context.transition(ExecutorState::Failed);
                        return Some(Err(ExecutionError::LastAttemptError(error)));
                    }
                    RetryDecision::IgnoreWriteError => {
                        context.transition(ExecutorState::Succeeded);
                        return Some(Ok((RunRequestResult::IgnoredWriteError, coordinator)));
                    }
                }
            }
        }

        context.into_exhausted_error().map(Err)
    }

    fn connection_for(
        &self,
        host: &HostInfo,
        context: &QueryContext<'_>,
    ) -> Result<Arc<Connection>, ConnectionPoolError> {
        let pool = self
            .cluster
            .pool_for(&host.host_id)
            .ok_or(ConnectionPoolError::NodeDisabled)?;
        match context.routing_info.token {
            Some(token) => pool.connection_for_token(token),
            None => pool.random_connection(),
        }
    }

    async fn handle_set_keyspace_response(
        &self,
        response: &QueryResponse,
    ) -> Result<(), UseKeyspaceError> {
        if let Some(set_keyspace) = response.as_set_keyspace() {
            debug!(
                "Detected USE KEYSPACE query, setting session's keyspace to {}",
                set_keyspace.keyspace_name
            );
            self.use_keyspace(set_keyspace.keyspace_name.clone(), true)
                .await?;
        }
        Ok(())
    }

    async fn handle_auto_await_schema_agreement(
        &self,
        response: &QueryResponse,
    ) -> Result<(), ExecutionError> {
        if !self.config.schema_agreement_automatic_waiting
            || response.as_schema_change().is_none()
        {
            return Ok(());
        }

        let version = self.await_schema_agreement(std::future::pending()).await?;
        debug!(schema_version = %version, "Schema agreed after a schema change");

        if self.config.refresh_metadata_on_auto_schema_agreement {
            if let Err(error) = self.cluster.refresh_metadata().await {
                warn!(error = %error, "Failed to refresh metadata after a schema change");
            }
        }
        Ok(())
    }

    /// Sets the keyspace on every connection and remembers it for the ones
    /// opened later and for routing.
    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), UseKeyspaceError> {
        if self.is_closed() {
            return Err(UseKeyspaceError::SessionClosed);
        }
        let keyspace_name = keyspace_name.into();
        let verified = VerifiedKeyspaceName::new(keyspace_name.clone(), case_sensitive)?;

        tokio::select! {
            biased;
            () = self.wait_closed() => return Err(UseKeyspaceError::SessionClosed),
            result = self.cluster.use_keyspace(verified) => result?,
        }

        self.keyspace.store(Some(Arc::new(keyspace_name)));
        Ok(())
    }

    pub(crate) async fn check_schema_agreement(
        &self,
    ) -> Result<Option<Uuid>, SchemaAgreementError> {
        if self.is_closed() {
            return Err(SchemaAgreementError::SessionClosed);
        }
        self.cluster.check_schema_agreement().await
    }

    /// Waits for schema agreement with the configured interval and timeout.
    /// Returns early with an error once `cancel` resolves or the session is
    /// closed.
    pub(crate) async fn await_schema_agreement(
        &self,
        cancel: impl Future<Output = ()>,
    ) -> Result<Uuid, SchemaAgreementError> {
        if self.is_closed() {
            return Err(SchemaAgreementError::SessionClosed);
        }
        tokio::select! {
            biased;
            () = self.wait_closed() => Err(SchemaAgreementError::SessionClosed),
            result = self.cluster.await_schema_agreement(
                self.config.schema_agreement_interval,
                self.config.schema_agreement_timeout,
                cancel,
            ) => result,
        }
    }

    pub(crate) async fn refresh_metadata(&self) -> Result<(), MetadataError> {
        self.cluster.refresh_metadata().await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::errors::DbError;
    use crate::policies::retry::DefaultRetryPolicy;

    fn overloaded() -> RequestAttemptError {
        RequestAttemptError::DbError(DbError::Overloaded, "busy".to_owned())
    }

    #[test]
    fn exhausted_plan_reports_every_attempt() {
        let routing_info = RoutingInfo::default();
        let mut context = QueryContext::new(
            &routing_info,
            true,
            DefaultRetryPolicy::new().new_session(),
            None,
        );
        let first: SocketAddr = "127.0.0.1:9042".parse().unwrap();
        let second: SocketAddr = "127.0.0.2:9042".parse().unwrap();
        context.attempts.push((first, overloaded()));
        context.attempts.push((
            second,
            RequestAttemptError::UnableToAllocStreamId,
        ));

        assert_matches!(
            context.into_exhausted_error(),
            Some(ExecutionError::AllAttemptsFailed {
                last_error: RequestAttemptError::UnableToAllocStreamId,
                attempts,
            }) if attempts.iter().map(|(addr, _)| *addr).collect::<Vec<_>>() == vec![first, second]
        );
    }

    #[test]
    fn skipped_hosts_report_pool_error() {
        let routing_info = RoutingInfo::default();
        let new_context = || {
            QueryContext::new(
                &routing_info,
                false,
                DefaultRetryPolicy::new().new_session(),
                None,
            )
        };
        assert_matches!(new_context().into_exhausted_error(), None);

        let mut context = new_context();
        context.pool_error = Some(ConnectionPoolError::NodeDisabled);
        assert_matches!(
            context.into_exhausted_error(),
            Some(ExecutionError::ConnectionPoolError(
                ConnectionPoolError::NodeDisabled
            ))
        );
    }

    #[test]
    fn retries_count_attempts_and_keep_lowered_consistency() {
        let routing_info = RoutingInfo {
            consistency: Consistency::Quorum,
            ..Default::default()
        };
        let mut context = QueryContext::new(
            &routing_info,
            true,
            DefaultRetryPolicy::new().new_session(),
            Some(Instant::now() + Duration::from_secs(60)),
        );
        assert_eq!(context.state, ExecutorState::NotStarted);
        assert!(context.remaining_time().unwrap() <= Duration::from_secs(60));

        assert_eq!(
            context.decide(&overloaded()),
            RetryDecision::RetryNextTarget(None)
        );
        context.prepare_retry(None);
        context.prepare_retry(Some(Consistency::One));
        context.prepare_retry(None);
        assert_eq!(context.retry_count, 3);
        assert_eq!(context.consistency, Consistency::One);
    }
}
