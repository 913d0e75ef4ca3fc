use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use speckle_hash::ContentHasher;
use speckle_remote::api::{self, DiffResponse, IdList};
use speckle_transport::ObjectStore;
use speckle_types::{wire, Fragment, ObjectId};
use tracing::debug;

use crate::error::{ServerError, ServerResult};
use crate::state::ServerState;

type AppState = State<Arc<ServerState>>;

fn parse_id(raw: &str) -> ServerResult<ObjectId> {
    ObjectId::from_hex(raw).map_err(|e| ServerError::BadRequest(format!("bad id {raw}: {e}")))
}

fn ids_of(body: &IdList) -> ServerResult<Vec<ObjectId>> {
    body.ids().map_err(ServerError::BadRequest)
}

/// Blob fragments take their id from file bytes, not from their body.
fn is_blob(fragment: &Fragment) -> bool {
    fragment.speckle_type.rsplit(wire::TYPE_CHAIN_SEPARATOR).next() == Some(wire::BLOB_TYPE)
}

pub async fn ping() -> &'static str {
    api::PONG
}

/// Stream the requested fragments as `id\tjson` lines; unknown ids are left
/// out.
pub async fn get_objects(
    State(state): AppState,
    Path(stream): Path<String>,
    Json(body): Json<IdList>,
) -> ServerResult<Response> {
    let ids = ids_of(&body)?;
    let mut out = String::new();
    if let Some(data) = state.stream(&stream) {
        let found = data.objects.get_batch(&ids).await?;
        for id in &ids {
            if let Some(json) = found.get(id) {
                api::write_object_line(&mut out, id, json);
            }
        }
    }
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], out).into_response())
}

pub async fn diff(
    State(state): AppState,
    Path(stream): Path<String>,
    Json(body): Json<IdList>,
) -> ServerResult<Json<DiffResponse>> {
    let ids = ids_of(&body)?;
    let present = match state.stream(&stream) {
        Some(data) => data.objects.has_batch(&ids).await?,
        None => Default::default(),
    };
    Ok(Json(ids.iter().map(|id| (id.to_hex(), present.contains(id))).collect()))
}

/// Accept multipart object batches. Each part is a JSON array of fragment
/// bodies, plain or gzip-compressed.
pub async fn upload(
    State(state): AppState,
    Path(stream): Path<String>,
    mut multipart: Multipart,
) -> ServerResult<StatusCode> {
    state.count_upload();
    let mut fragments: Vec<Fragment> = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(e.to_string()))?
    {
        let bytes = field.bytes().await.map_err(|e| ServerError::BadRequest(e.to_string()))?;
        fragments.extend(api::decode_batch(&bytes).map_err(ServerError::BadRequest)?);
    }

    if state.config().verify_uploads {
        for fragment in fragments.iter().filter(|f| !is_blob(f)) {
            let ok = ContentHasher::verify_fragment(&fragment.json, &fragment.id)
                .map_err(|e| ServerError::BadRequest(e.to_string()))?;
            if !ok {
                return Err(ServerError::HashMismatch {
                    id: fragment.id.to_hex(),
                });
            }
        }
    }

    debug!(%stream, count = fragments.len(), "storing uploaded fragments");
    state.stream_or_create(&stream).objects.put_batch(&fragments).await?;
    Ok(StatusCode::CREATED)
}

pub async fn single(
    State(state): AppState,
    Path((stream, id)): Path<(String, String)>,
) -> ServerResult<Response> {
    let id = parse_id(&id)?;
    let json = match state.stream(&stream) {
        Some(data) => data.objects.get(&id).await?,
        None => None,
    };
    Ok(match json {
        Some(json) => ([(header::CONTENT_TYPE, api::JSON_MIME)], json).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}

/// Accept blob files; each part is named `hash:<id>`.
pub async fn blob_upload(
    State(state): AppState,
    Path(stream): Path<String>,
    mut multipart: Multipart,
) -> ServerResult<(StatusCode, Json<Vec<ObjectId>>)> {
    let data = state.stream_or_create(&stream);
    let mut stored = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let id = name
            .strip_prefix(api::BLOB_PART_PREFIX)
            .ok_or_else(|| ServerError::BadRequest(format!("unexpected part {name:?}")))
            .and_then(parse_id)?;
        let bytes = field.bytes().await.map_err(|e| ServerError::BadRequest(e.to_string()))?;
        if state.config().verify_uploads && ContentHasher::hash(&bytes) != id {
            return Err(ServerError::HashMismatch { id: id.to_hex() });
        }
        data.insert_blob(id, bytes);
        stored.push(id);
    }
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn blob_diff(
    State(state): AppState,
    Path(stream): Path<String>,
    Json(ids): Json<Vec<ObjectId>>,
) -> Json<Vec<ObjectId>> {
    let data = state.stream(&stream);
    let missing = ids
        .into_iter()
        .filter(|id| !data.as_ref().is_some_and(|d| d.has_blob(id)))
        .collect();
    Json(missing)
}

pub async fn blob_download(
    State(state): AppState,
    Path((stream, id)): Path<(String, String)>,
) -> ServerResult<Response> {
    let id = parse_id(&id)?;
    Ok(match state.stream(&stream).and_then(|d| d.blob(&id)) {
        Some(bytes) => ([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}
