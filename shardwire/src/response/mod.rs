//! Results of requests, as seen by users and by the driver internals.

mod coordinator;
pub mod query_result;
mod request_response;

pub use coordinator::Coordinator;
pub(crate) use request_response::{NonErrorAuthResponse, NonErrorStartupResponse, QueryResponse};

use std::ops::ControlFlow;

use bytes::Bytes;

/// Opaque position in a paged result, sent back to the server to get the
/// next page. An empty state starts from the first page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagingState(Option<Bytes>);

impl PagingState {
    /// A state requesting the first page.
    #[inline]
    pub fn start() -> Self {
        Self(None)
    }

    pub fn new_from_raw_bytes(raw: impl Into<Bytes>) -> Self {
        Self(Some(raw.into()))
    }

    pub fn as_bytes_slice(&self) -> Option<&Bytes> {
        self.0.as_ref()
    }

    pub(crate) fn into_raw(self) -> Option<Bytes> {
        self.0
    }
}

/// Whether the server has more pages after the one just received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagingStateResponse {
    HasMorePages { state: PagingState },
    NoMorePages,
}

impl PagingStateResponse {
    pub(crate) fn new_from_raw_bytes(raw: Option<Bytes>) -> Self {
        match raw {
            Some(raw) => Self::HasMorePages {
                state: PagingState::new_from_raw_bytes(raw),
            },
            None => Self::NoMorePages,
        }
    }

    #[inline]
    pub fn finished(&self) -> bool {
        matches!(self, Self::NoMorePages)
    }

    /// `Continue` with the state to fetch the next page with, or `Break`
    /// if this was the last page.
    #[inline]
    pub fn into_paging_control_flow(self) -> ControlFlow<(), PagingState> {
        match self {
            Self::HasMorePages { state } => ControlFlow::Continue(state),
            Self::NoMorePages => ControlFlow::Break(()),
        }
    }
}
