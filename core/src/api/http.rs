//! Management HTTP API routes: path-configuration CRUD plus
//! read-only path introspection. All handlers are thin and delegate to
//! [`crate::config::ConfigWatcher`] / [`crate::path_manager::PathManager`];
//! errors flow through `PathmuxError`'s `IntoResponse` impl so every
//! failure mode is a consistent `{error, message, status}` JSON body.

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};

use crate::api::AppState;
use crate::config::{validate_path_name, PathConfig};
use crate::error::PathmuxError;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v3/config/paths/get/{name}", get(get_path_config))
        .route("/v3/config/paths/add/{name}", post(add_path_config))
        .route("/v3/config/paths/patch/{name}", patch(patch_path_config))
        .route("/v3/config/paths/replace/{name}", post(replace_path_config))
        .route("/v3/paths/list", get(list_paths))
        .route("/v3/paths/get/{name}", get(get_path))
        .with_state(state)
}

/// `GET /v3/config/paths/get/:name` — returns the configured entry as
/// stored, or 404 if no such entry exists.
async fn get_path_config(State(state): State<AppState>, AxumPath(name): AxumPath<String>) -> Response {
    let config = state.config_watcher.current();
    match config.paths.get(&name) {
        Some(path_config) => Json(path_config).into_response(),
        None => PathmuxError::PathNotConfigured(name).into_response(),
    }
}

/// `POST /v3/config/paths/add/:name` — adds a new entry; fails with 400 if
/// one already exists under that name (use `replace` for that).
async fn add_path_config(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    body: Json<serde_json::Value>,
) -> Response {
    let mut config = (*state.config_watcher.current()).clone();
    if config.paths.contains_key(&name) {
        return PathmuxError::ConfigInvalid(format!("path {name:?} already exists")).into_response();
    }
    if let Err(e) = validate_path_name(&name) {
        return e.into_response();
    }
    let path_config: PathConfig = match serde_json::from_value(body.0) {
        Ok(p) => p,
        Err(e) => {
            return PathmuxError::ConfigInvalid(format!("invalid path configuration: {e}"))
                .into_response()
        }
    };
    config.paths.insert(name, path_config);
    apply_and_respond(&state, config)
}

/// `PATCH /v3/config/paths/patch/:name` — partial update: only the fields
/// present in the request body are changed, the rest of the existing entry
/// is preserved.
async fn patch_path_config(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    body: Json<serde_json::Value>,
) -> Response {
    let mut config = (*state.config_watcher.current()).clone();
    let Some(existing) = config.paths.get(&name) else {
        return PathmuxError::PathNotConfigured(name).into_response();
    };

    let mut merged = match serde_json::to_value(existing) {
        Ok(v) => v,
        Err(e) => return PathmuxError::ConfigInvalid(format!("internal: {e}")).into_response(),
    };
    let Some(merged_obj) = merged.as_object_mut() else {
        return PathmuxError::ConfigInvalid("internal: path config is not an object".into())
            .into_response();
    };
    if let Some(patch_obj) = body.0.as_object() {
        for (key, value) in patch_obj {
            merged_obj.insert(key.clone(), value.clone());
        }
    }

    let path_config: PathConfig = match serde_json::from_value(merged) {
        Ok(p) => p,
        Err(e) => {
            return PathmuxError::ConfigInvalid(format!("invalid path configuration: {e}"))
                .into_response()
        }
    };
    config.paths.insert(name, path_config);
    apply_and_respond(&state, config)
}

/// `POST /v3/config/paths/replace/:name` — full replace of an existing
/// entry; 404 if no entry exists under that name (use `add` to create one).
async fn replace_path_config(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    body: Json<serde_json::Value>,
) -> Response {
    let mut config = (*state.config_watcher.current()).clone();
    if !config.paths.contains_key(&name) {
        return PathmuxError::PathNotConfigured(name).into_response();
    }
    if let Err(e) = validate_path_name(&name) {
        return e.into_response();
    }
    let path_config: PathConfig = match serde_json::from_value(body.0) {
        Ok(p) => p,
        Err(e) => {
            return PathmuxError::ConfigInvalid(format!("invalid path configuration: {e}"))
                .into_response()
        }
    };
    config.paths.insert(name, path_config);
    apply_and_respond(&state, config)
}

fn apply_and_respond(state: &AppState, new_config: crate::config::PathmuxConfig) -> Response {
    match state.config_watcher.apply(new_config) {
        Ok(diff) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "removed": diff.removed,
                "restarted": diff.restarted,
            })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// `GET /v3/paths/list` — live-path introspection snapshot for every
/// currently-instantiated path.
async fn list_paths(State(state): State<AppState>) -> Response {
    Json(state.path_manager.describe_all()).into_response()
}

/// `GET /v3/paths/get/:name` — introspection snapshot for one live path, or
/// 404 if it has not been instantiated (note: distinct from
/// `/v3/config/paths/get`, which reads the configuration table rather than
/// live state).
async fn get_path(State(state): State<AppState>, AxumPath(name): AxumPath<String>) -> Response {
    match state.path_manager.find(&name) {
        Some(path) => Json(path.describe()).into_response(),
        None => PathmuxError::PathNotConfigured(name).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigWatcher, PathmuxConfig};
    use crate::path_manager::PathManager;
    use crate::runtime::TokioSpawner;
    use std::sync::Arc;

    fn test_state() -> AppState {
        let spawner = Arc::new(TokioSpawner::current());
        let path_manager = PathManager::new(PathmuxConfig::default(), spawner);
        let config_watcher = ConfigWatcher::new(PathmuxConfig::default(), Arc::clone(&path_manager));
        AppState::new(config_watcher, path_manager)
    }

    #[tokio::test]
    async fn replace_rejects_nonexistent_path_with_404() {
        let state = test_state();
        let response = replace_path_config(
            State(state),
            AxumPath("cam1".into()),
            Json(serde_json::json!({})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn replace_overwrites_an_existing_path() {
        let state = test_state();
        add_path_config(
            State(state.clone()),
            AxumPath("cam1".into()),
            Json(serde_json::json!({})),
        )
        .await;
        let response = replace_path_config(
            State(state.clone()),
            AxumPath("cam1".into()),
            Json(serde_json::json!({ "sourceOnDemand": true })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.config_watcher.current().paths["cam1"].source_on_demand);
    }

    #[tokio::test]
    async fn get_path_config_404s_for_unconfigured_name() {
        let state = test_state();
        let response = get_path_config(State(state), AxumPath("cam1".into())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
