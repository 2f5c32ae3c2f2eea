#![cfg(unix)]

use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use botdock_agent::AgentConfig;
use botdock_control::{auth::make_access_jwt, build_state, connect_and_migrate, state::AppState};
use botdock_db::entities::{audit_events, bots, users};
use botdock_process::{BotId, TenantRole};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, Set};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

const LONG_RUNNING: &str = "echo ready\nwhile true; do sleep 1; done\n";
const BOUNDARY: &str = "botdock-test-boundary";

struct Harness {
    dir: tempfile::TempDir,
    state: AppState,
    app: Router,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    async fn with_config(tweak: impl FnOnce(&mut AgentConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, tweak).await;
        let app = botdock_control::router(state.clone());
        Self { dir, state, app }
    }

    async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn create_bot(&self, token: &str, name: &str) -> String {
        let (status, body) = self
            .send(post_json("/bot/create", token, json!({ "bot_name": name })))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["bot_id"].as_str().unwrap().to_string()
    }

    async fn upload_script(&self, token: &str, bot_id: &str, script: &str) {
        let (status, body) = self
            .send(upload(token, bot_id, &[("bot.py", script)]))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }
}

async fn state_for(dir: &tempfile::TempDir) -> AppState {
    state_with(dir, |_| {}).await
}

async fn state_with(dir: &tempfile::TempDir, tweak: impl FnOnce(&mut AgentConfig)) -> AppState {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("botdock.db").display());
    let db = connect_and_migrate(&url).await.unwrap();
    let mut config = AgentConfig {
        data_root: dir.path().join("data"),
        interpreter: "sh".to_string(),
        installer: Vec::new(),
        stop_grace: Duration::from_secs(3),
        kill_wait: Duration::from_secs(3),
        startup_grace: Duration::from_millis(200),
        transition_wait: Duration::from_secs(20),
        sample_interval: Duration::from_millis(100),
        ..AgentConfig::default()
    };
    tweak(&mut config);
    build_state(db, config).await.unwrap()
}

fn token(user_id: Uuid, username: &str, role: TenantRole) -> String {
    make_access_jwt(user_id, username, role, chrono::TimeDelta::minutes(5)).unwrap()
}

fn user_token(username: &str) -> (Uuid, String) {
    let id = Uuid::new_v4();
    (id, token(id, username, TenantRole::User))
}

fn get(path: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

fn post_json(path: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn upload(token: &str, bot_id: &str, files: &[(&str, &str)]) -> Request<Body> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"bot_id\"\r\n\r\n{bot_id}\r\n"
    );
    for (name, content) in files {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: text/plain\r\n\r\n{content}\r\n"
        ));
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));

    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn healthz_echoes_request_id() {
    let h = Harness::new().await;
    let req = Request::builder()
        .uri("/healthz")
        .header("x-request-id", "trace-1")
        .body(Body::empty())
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-request-id"], "trace-1");
}

#[tokio::test]
async fn missing_or_bad_token_is_unauthorized() {
    let h = Harness::new().await;
    let req = Request::builder()
        .uri("/my/bots")
        .body(Body::empty())
        .unwrap();
    let (status, body) = h.send(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
    assert!(!body["request_id"].as_str().unwrap().is_empty());

    let (status, _) = h.send(get("/my/bots", "not-a-token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn first_request_provisions_a_free_tenant() {
    let h = Harness::new().await;
    let (id, tok) = user_token("dave");
    let (status, body) = h.send(get("/auth/whoami", &tok)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan"], "FREE");
    assert_eq!(body["role"], "USER");

    let row = users::Entity::find_by_id(id)
        .one(&*h.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.username, "dave");
}

#[tokio::test]
async fn create_lists_persists_and_audits() {
    let h = Harness::new().await;
    let (user_id, tok) = user_token("erin");
    let bot_id = h.create_bot(&tok, "weather").await;

    let (status, body) = h.send(get("/my/bots", &tok)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], bot_id.as_str());
    assert_eq!(body[0]["bot_name"], "weather");
    assert_eq!(body[0]["status"], "STOPPED");

    let row = bots::Entity::find_by_id(bot_id.clone())
        .one(&*h.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.user_id, user_id);

    let audited = audit_events::Entity::find()
        .filter(audit_events::Column::Action.eq("bot.create"))
        .all(&*h.state.db)
        .await
        .unwrap();
    assert_eq!(audited.len(), 1);
    let event = &audited[0];
    assert_eq!(event.actor_id, user_id);
    assert_eq!(event.actor_role, "USER");
    assert_eq!(event.bot_id.as_deref(), Some(bot_id.as_str()));
    assert_eq!(event.account_id, Some(user_id));

    let for_bot = audit_events::Entity::find()
        .filter(audit_events::Column::BotId.eq(bot_id.as_str()))
        .count(&*h.state.db)
        .await
        .unwrap();
    assert_eq!(for_bot, 1);
}

#[tokio::test]
async fn free_plan_caps_owned_bots() {
    let h = Harness::new().await;
    let (_, tok) = user_token("frank");
    for i in 0..3 {
        h.create_bot(&tok, &format!("bot-{i}")).await;
    }
    let (status, body) = h
        .send(post_json("/bot/create", &tok, json!({ "bot_name": "one-too-many" })))
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "quota_exceeded");
}

#[tokio::test]
async fn foreign_bots_look_missing() {
    let h = Harness::new().await;
    let (_, owner) = user_token("grace");
    let (_, other) = user_token("heidi");
    let bot_id = h.create_bot(&owner, "private").await;

    let (status, body) = h
        .send(get(&format!("/bot/status?bot_id={bot_id}"), &other))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, _) = h
        .send(post_json("/bot/start", &other, json!({ "bot_id": bot_id })))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_rejects_unknown_file_names() {
    let h = Harness::new().await;
    let (_, tok) = user_token("ivan");
    let bot_id = h.create_bot(&tok, "uploader").await;

    let (status, body) = h
        .send(upload(&tok, &bot_id, &[("run.sh", "echo hi")]))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "invalid_param");

    h.upload_script(&tok, &bot_id, LONG_RUNNING).await;
    let on_disk = h
        .dir
        .path()
        .join("data")
        .join("bots")
        .join(&bot_id)
        .join("bot.py");
    assert_eq!(std::fs::read_to_string(on_disk).unwrap(), LONG_RUNNING);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lifecycle_over_http() {
    let h = Harness::new().await;
    let (_, tok) = user_token("judy");
    let bot_id = h.create_bot(&tok, "echoer").await;
    h.upload_script(
        &tok,
        &bot_id,
        "echo ready\nwhile read line; do echo \"got $line\"; done\n",
    )
    .await;

    let (status, body) = h
        .send(post_json("/bot/start", &tok, json!({ "bot_id": bot_id })))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["message"], "Bot started");

    let (_, body) = h
        .send(get(&format!("/bot/status?bot_id={bot_id}"), &tok))
        .await;
    assert_eq!(body["status"], "RUNNING");
    assert!(body["start_time"].is_string());
    assert!(body["pid"].is_u64());

    let (status, _) = h
        .send(post_json(
            "/bot/command",
            &tok,
            json!({ "bot_id": bot_id, "command": "ping" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let mut echoed = false;
    for _ in 0..40 {
        let (_, body) = h
            .send(get(&format!("/bot/logs?bot_id={bot_id}"), &tok))
            .await;
        echoed = body["logs"]
            .as_array()
            .unwrap()
            .iter()
            .any(|entry| entry[1] == "got ping");
        if echoed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(echoed, "bot never answered the command");

    let (status, body) = h
        .send(post_json("/bot/start", &tok, json!({ "bot_id": bot_id })))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_transition");

    let (status, body) = h
        .send(post_json("/bot/delete", &tok, json!({ "bot_id": bot_id })))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "bot_active");

    let (status, _) = h
        .send(post_json("/bot/stop", &tok, json!({ "bot_id": bot_id })))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = h
        .send(get(&format!("/bot/status?bot_id={bot_id}"), &tok))
        .await;
    assert_eq!(body["status"], "STOPPED");
    assert!(body["start_time"].is_null());

    let (_, body) = h
        .send(get(&format!("/bot/resources?bot_id={bot_id}"), &tok))
        .await;
    assert_eq!(body["cpu"], 0.0);
    assert_eq!(body["ram"], 0);

    let resp = h
        .app
        .clone()
        .oneshot(get(&format!("/bot/logs/download?bot_id={bot_id}"), &tok))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let disposition = resp.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains(&format!("bot_{bot_id}_logs.txt")));
    let text = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&text).contains("> ping"));

    let (status, _) = h
        .send(post_json("/bot/delete", &tok, json!({ "bot_id": bot_id })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        bots::Entity::find_by_id(bot_id)
            .one(&*h.state.db)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn command_to_stopped_bot_conflicts() {
    let h = Harness::new().await;
    let (_, tok) = user_token("ken");
    let bot_id = h.create_bot(&tok, "idle").await;
    let (status, body) = h
        .send(post_json(
            "/bot/command",
            &tok,
            json!({ "bot_id": bot_id, "command": "ping" }),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "not_running");
}

#[tokio::test]
async fn admin_routes_require_admin_role() {
    let h = Harness::new().await;
    let (_, tok) = user_token("leo");
    let (status, body) = h.send(get("/admin/users", &tok)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");
}

#[tokio::test]
async fn admin_changes_plan() {
    let h = Harness::new().await;
    let admin = token(Uuid::new_v4(), "root", TenantRole::Admin);
    let (user_id, tok) = user_token("mallory");
    h.send(get("/auth/whoami", &tok)).await;

    let (status, _) = h
        .send(post_json(
            "/admin/user/change-plan",
            &admin,
            json!({ "user_id": user_id.to_string(), "plan": "pro" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = h.send(get("/plan/info", &tok)).await;
    assert_eq!(body["plan"], "PRO");
    assert_eq!(body["limits"]["max_running"], 3);

    let (status, body) = h
        .send(post_json(
            "/admin/user/change-plan",
            &admin,
            json!({ "user_id": user_id.to_string(), "plan": "gold" }),
        ))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "invalid_param");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn suspension_stops_bots_and_blocks_starts() {
    let h = Harness::new().await;
    let admin = token(Uuid::new_v4(), "root", TenantRole::Admin);
    let (user_id, tok) = user_token("niaj");
    let bot_id = h.create_bot(&tok, "worker").await;
    h.upload_script(&tok, &bot_id, LONG_RUNNING).await;
    let (status, _) = h
        .send(post_json("/bot/start", &tok, json!({ "bot_id": bot_id })))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = h.send(get("/admin/bots", &admin)).await;
    assert_eq!(body[0]["running"], true);
    assert_eq!(body[0]["owner_username"], "niaj");

    let (status, body) = h
        .send(post_json(
            "/admin/user/suspend",
            &admin,
            json!({ "user_id": user_id.to_string(), "suspend": true }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped_bots"], 1);
    assert_eq!(body["failed_bots"], json!([]));

    let (_, body) = h
        .send(get(&format!("/bot/status?bot_id={bot_id}"), &tok))
        .await;
    assert_eq!(body["status"], "STOPPED");
    assert_eq!(body["error_reason"], "account suspended");

    let (status, body) = h
        .send(post_json("/bot/start", &tok, json!({ "bot_id": bot_id })))
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "quota_exceeded");

    let (status, _) = h
        .send(post_json(
            "/admin/user/suspend",
            &admin,
            json!({ "user_id": user_id.to_string(), "suspend": false }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = h
        .send(post_json("/bot/start", &tok, json!({ "bot_id": bot_id })))
        .await;
    assert_eq!(status, StatusCode::OK);

    h.state.orchestrator.shutdown().await;
}

#[tokio::test]
async fn admin_deletes_user_with_bots() {
    let h = Harness::new().await;
    let admin_id = Uuid::new_v4();
    let admin = token(admin_id, "root", TenantRole::Admin);
    let (user_id, tok) = user_token("olivia");
    let bot_id = h.create_bot(&tok, "doomed").await;
    let workspace = h.dir.path().join("data").join("bots").join(&bot_id);
    assert!(workspace.exists());

    let (status, body) = h
        .send(post_json(
            "/admin/user/delete",
            &admin,
            json!({ "user_id": admin_id.to_string() }),
        ))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");

    let (status, body) = h
        .send(post_json(
            "/admin/user/delete",
            &admin,
            json!({ "user_id": user_id.to_string() }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["deleted_bots"], 1);

    assert!(!workspace.exists());
    assert!(
        users::Entity::find_by_id(user_id)
            .one(&*h.state.db)
            .await
            .unwrap()
            .is_none()
    );
    let (_, body) = h.send(get("/admin/system-stats", &admin)).await;
    assert_eq!(body["total_bots"], 0);
    assert_eq!(body["running_bots"], 0);
    assert_eq!(body["total_users"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn user_delete_keeps_the_account_while_a_bot_cannot_be_removed() {
    let h = Harness::with_config(|cfg| cfg.transition_wait = Duration::from_millis(500)).await;
    let admin = token(Uuid::new_v4(), "root", TenantRole::Admin);
    let (user_id, tok) = user_token("quinn");
    let idle = h.create_bot(&tok, "idle").await;
    let busy = h.create_bot(&tok, "busy").await;

    let held = h
        .state
        .orchestrator
        .registry()
        .get(&BotId::from(busy.as_str()))
        .unwrap()
        .lock_transition()
        .await
        .unwrap();
    let (status, body) = h
        .send(post_json(
            "/admin/user/delete",
            &admin,
            json!({ "user_id": user_id.to_string() }),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
    assert_eq!(body["code"], "bots_remaining");

    assert!(
        users::Entity::find_by_id(user_id)
            .one(&*h.state.db)
            .await
            .unwrap()
            .is_some()
    );
    let rows: Vec<String> = bots::Entity::find()
        .filter(bots::Column::UserId.eq(user_id))
        .all(&*h.state.db)
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(rows, vec![busy.clone()]);
    assert!(h.state.orchestrator.get_status(&BotId::from(idle.as_str())).is_err());

    drop(held);
    let (status, body) = h
        .send(post_json(
            "/admin/user/delete",
            &admin,
            json!({ "user_id": user_id.to_string() }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["deleted_bots"], 1);
}

#[tokio::test]
async fn persisted_bots_are_restored_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let user_id = Uuid::new_v4();
    {
        let state = state_for(&dir).await;
        users::Entity::insert(users::ActiveModel {
            id: Set(user_id),
            username: Set("peggy".to_string()),
            role: Set("USER".to_string()),
            plan: Set("FREE".to_string()),
            suspended: Set(false),
            created_at: Set(chrono::Utc::now().into()),
        })
        .exec(&*state.db)
        .await
        .unwrap();
        bots::Entity::insert(bots::ActiveModel {
            id: Set("restored-bot".to_string()),
            user_id: Set(user_id),
            bot_name: Set("survivor".to_string()),
            created_at: Set(chrono::Utc::now().into()),
        })
        .exec(&*state.db)
        .await
        .unwrap();
    }

    let state = state_for(&dir).await;
    let app = botdock_control::router(state);
    let tok = token(user_id, "peggy", TenantRole::User);
    let resp = app.oneshot(get("/my/bots", &tok)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body[0]["id"], "restored-bot");
    assert_eq!(body[0]["status"], "STOPPED");
}
