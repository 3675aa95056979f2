use std::collections::HashMap;

use bytes::Bytes;
use shardwire_cql::frame::response::event::SchemaChangeEvent;
use shardwire_cql::frame::response::result::{self, Rows};
use shardwire_cql::frame::response::{authenticate, Response};
use uuid::Uuid;

use super::query_result::QueryResult;
use super::{Coordinator, PagingStateResponse};
use crate::errors::RequestAttemptError;

/// A parsed response together with its frame body extensions.
#[derive(Debug)]
pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
    pub(crate) custom_payload: Option<HashMap<String, Option<Bytes>>>,
}

impl QueryResponse {
    /// Turns an ERROR response into the matching attempt error.
    pub(crate) fn into_non_error_query_response(self) -> Result<QueryResponse, RequestAttemptError> {
        match self.response {
            Response::Error(err) => Err(err.into()),
            _ => Ok(self),
        }
    }

    pub(crate) fn as_set_keyspace(&self) -> Option<&result::SetKeyspace> {
        match &self.response {
            Response::Result(result::Result::SetKeyspace(sk)) => Some(sk),
            _ => None,
        }
    }

    pub(crate) fn as_schema_change(&self) -> Option<&SchemaChangeEvent> {
        match &self.response {
            Response::Result(result::Result::SchemaChange(sc)) => Some(&sc.event),
            _ => None,
        }
    }

    /// Rows of a RESULT/Rows response; any other non-error response is unexpected.
    pub(crate) fn into_rows(self) -> Result<Rows, RequestAttemptError> {
        match self.into_non_error_query_response()?.response {
            Response::Result(result::Result::Rows(rows)) => Ok(rows),
            other => Err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    pub(crate) fn into_query_result_and_paging_state(
        self,
        coordinator: Option<Coordinator>,
    ) -> Result<(QueryResult, PagingStateResponse), RequestAttemptError> {
        let Self {
            response,
            tracing_id,
            warnings,
            custom_payload,
        } = self.into_non_error_query_response()?;

        let (rows, paging_state) = match response {
            Response::Result(result::Result::Rows(mut rows)) => {
                let paging_state = rows.metadata.paging_state.take();
                (Some(rows), PagingStateResponse::new_from_raw_bytes(paging_state))
            }
            Response::Result(_) => (None, PagingStateResponse::NoMorePages),
            _ => {
                return Err(RequestAttemptError::UnexpectedResponse(
                    response.to_response_kind(),
                ))
            }
        };

        Ok((
            QueryResult::new(coordinator, rows, tracing_id, warnings, custom_payload),
            paging_state,
        ))
    }
}

pub(crate) enum NonErrorStartupResponse {
    Ready,
    Authenticate(authenticate::Authenticate),
}

pub(crate) enum NonErrorAuthResponse {
    AuthChallenge(authenticate::AuthChallenge),
    AuthSuccess(authenticate::AuthSuccess),
}
