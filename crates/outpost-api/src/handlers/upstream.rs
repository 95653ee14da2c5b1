//! Endpoints agents push to and reconcile against.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use outpost_core::{Error, PaginateRequest, PaginateResponse, PushData};

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiQuery};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    #[serde(default)]
    pub agent_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PushResponse {
    pub saved: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub agent_id: Uuid,
}

/// The query parameter names the agent; a body name is only a fallback.
fn resolve_agent(query: AgentQuery, data: &mut PushData) -> Result<(), ApiError> {
    if !query.agent_name.is_empty() {
        data.agent_name = query.agent_name;
    }
    if data.agent_name.is_empty() {
        return Err(ApiError::BadRequest("agent_name is required".into()));
    }
    Ok(())
}

/// `POST /upstream/push`
pub async fn push(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<AgentQuery>,
    ApiJson(mut data): ApiJson<PushData>,
) -> Result<Json<PushResponse>, ApiError> {
    resolve_agent(query, &mut data)?;
    debug!(
        subsystem = "api",
        op = "push",
        agent = %data.agent_name,
        rows = data.count(),
        "Push received"
    );
    let saved = state.db.upstream.insert_push_data(data).await?;
    Ok(Json(PushResponse { saved }))
}

/// `DELETE /upstream/push`
pub async fn delete(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<AgentQuery>,
    ApiJson(mut data): ApiJson<PushData>,
) -> Result<Json<DeleteResponse>, ApiError> {
    resolve_agent(query, &mut data)?;
    let deleted = state.db.upstream.delete_push_data(&data).await?;
    Ok(Json(DeleteResponse { deleted }))
}

/// `GET /upstream/ping`
pub async fn ping(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<AgentQuery>,
) -> Result<Json<PingResponse>, ApiError> {
    let agent_id = state.db.upstream.touch_agent(&query.agent_name).await?;
    Ok(Json(PingResponse { agent_id }))
}

/// `GET /upstream/status/:agent_name`
///
/// An agent upstream has never seen owns nothing, so it gets an empty digest.
pub async fn status(
    State(state): State<AppState>,
    Path(agent_name): Path<String>,
    ApiQuery(req): ApiQuery<PaginateRequest>,
) -> Result<Json<PaginateResponse>, ApiError> {
    match state.db.upstream.page_digest(&agent_name, &req).await {
        Ok(resp) => Ok(Json(resp)),
        Err(Error::NotFound(_)) => Ok(Json(PaginateResponse::default())),
        Err(e) => Err(e.into()),
    }
}

/// `GET /upstream/pull/:agent_name`
pub async fn pull(
    State(state): State<AppState>,
    Path(agent_name): Path<String>,
    ApiQuery(req): ApiQuery<PaginateRequest>,
) -> Result<Json<Vec<String>>, ApiError> {
    match state.db.upstream.ids_in_window(&agent_name, &req).await {
        Ok(ids) => Ok(Json(ids)),
        Err(Error::NotFound(_)) => Ok(Json(Vec::new())),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_agent_name_wins() {
        let mut data = PushData::new("from-body");
        resolve_agent(
            AgentQuery {
                agent_name: "from-query".into(),
            },
            &mut data,
        )
        .unwrap();
        assert_eq!(data.agent_name, "from-query");
    }

    #[test]
    fn test_body_agent_name_is_fallback() {
        let mut data = PushData::new("from-body");
        resolve_agent(AgentQuery { agent_name: String::new() }, &mut data).unwrap();
        assert_eq!(data.agent_name, "from-body");

        let mut anonymous = PushData::default();
        let err = resolve_agent(AgentQuery { agent_name: String::new() }, &mut anonymous);
        assert!(matches!(err, Err(ApiError::BadRequest(_))));
    }
}
