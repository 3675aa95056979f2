//! Transparent paging of a query: rows of all pages as a single stream.
//!
//! Pages are fetched by a background task one page ahead of the consumer.
//! Dropping the [`QueryPager`] stops the task.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures::future::RemoteHandle;
use futures::{FutureExt, Stream};
use shardwire_cql::frame::response::result::{ColumnSpec, Row};
use shardwire_cql::value::SerializedValues;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use super::executor::RequestExecutor;
use crate::errors::ExecutionError;
use crate::response::query_result::QueryResult;
use crate::response::{Coordinator, PagingState};
use crate::statement::Statement;

type PageResult = Result<QueryResult, ExecutionError>;

/// Fetches consecutive pages of one statement and hands them to the pager.
struct PagerWorker {
    executor: Arc<RequestExecutor>,
    statement: Statement,
    values: SerializedValues,
    sender: mpsc::Sender<PageResult>,
}

impl PagerWorker {
    async fn work(self) {
        let page_size = self.statement.get_validated_page_size();
        let mut paging_state = PagingState::start();
        let mut pages_fetched = 0usize;

        loop {
            let result = self
                .executor
                .query_page(&self.statement, &self.values, Some(page_size), paging_state)
                .await;

            let (page, paging_state_response) = match result {
                Ok(fetched) => fetched,
                Err(error) => {
                    // Nobody to report to if the pager is gone.
                    let _ = self.sender.send(Err(error)).await;
                    return;
                }
            };
            pages_fetched += 1;

            if self.sender.send(Ok(page)).await.is_err() {
                trace!(pages_fetched, "Pager dropped, stopping");
                return;
            }

            match paging_state_response.into_paging_control_flow() {
                std::ops::ControlFlow::Continue(next) => paging_state = next,
                std::ops::ControlFlow::Break(()) => {
                    trace!(pages_fetched, "Last page fetched");
                    return;
                }
            }
        }
    }
}

/// A stream over the rows of a paged query.
///
/// Created by [`Session::query_iter`](crate::client::session::Session::query_iter).
/// An error ends the stream.
pub struct QueryPager {
    current_page: std::vec::IntoIter<Row>,
    column_specs: Vec<ColumnSpec>,
    page_receiver: mpsc::Receiver<PageResult>,
    tracing_ids: Vec<Uuid>,
    request_coordinators: Vec<Coordinator>,
    _worker: RemoteHandle<()>,
}

impl QueryPager {
    pub(crate) async fn new(
        executor: Arc<RequestExecutor>,
        statement: Statement,
        values: SerializedValues,
    ) -> Result<Self, ExecutionError> {
        // One page in flight while the consumer reads the current one.
        let (sender, receiver) = mpsc::channel(1);
        let worker = PagerWorker {
            executor,
            statement,
            values,
            sender,
        };
        Self::new_from_worker_future(worker.work(), receiver).await
    }

    /// Starts the worker and waits for the first page, so that a request
    /// that fails right away fails here.
    async fn new_from_worker_future(
        worker: impl Future<Output = ()> + Send + 'static,
        mut receiver: mpsc::Receiver<PageResult>,
    ) -> Result<Self, ExecutionError> {
        let (worker, handle) = worker.remote_handle();
        tokio::spawn(worker);

        let mut pager = Self {
            current_page: Vec::new().into_iter(),
            column_specs: Vec::new(),
            page_receiver: receiver,
            tracing_ids: Vec::new(),
            request_coordinators: Vec::new(),
            _worker: handle,
        };
        if let Some(first_page) = pager.page_receiver.recv().await {
            pager.install_page(first_page?);
        }
        Ok(pager)
    }

    fn install_page(&mut self, page: QueryResult) {
        self.tracing_ids.extend(page.tracing_id());
        self.request_coordinators
            .extend(page.request_coordinator().cloned());
        if let Ok(rows) = page.into_rows_result() {
            self.column_specs = rows.metadata.col_specs;
            self.current_page = rows.rows.into_iter();
        }
    }

    /// Tracing ids of all pages fetched so far, if tracing was enabled.
    #[inline]
    pub fn tracing_ids(&self) -> &[Uuid] {
        &self.tracing_ids
    }

    /// The targets that served the pages fetched so far, in order.
    #[inline]
    pub fn request_coordinators(&self) -> impl Iterator<Item = &Coordinator> {
        self.request_coordinators.iter()
    }

    #[inline]
    pub fn column_specs(&self) -> &[ColumnSpec] {
        &self.column_specs
    }
}

impl Stream for QueryPager {
    type Item = Result<Row, ExecutionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(row) = self.current_page.next() {
                return Poll::Ready(Some(Ok(row)));
            }
            // Empty pages are skipped.
            match ready!(self.page_receiver.poll_recv(cx)) {
                Some(Ok(page)) => self.install_page(page),
                Some(Err(error)) => return Poll::Ready(Some(Err(error))),
                None => return Poll::Ready(None),
            }
        }
    }
}

impl std::fmt::Debug for QueryPager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPager")
            .field("rows_in_current_page", &self.current_page.len())
            .field("tracing_ids", &self.tracing_ids)
            .field("request_coordinators", &self.request_coordinators)
            .finish_non_exhaustive()
    }
}
