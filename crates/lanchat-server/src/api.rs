use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, State},
    http::{header, request::Parts, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use lanchat_shared::transfer::sanitize_name;
use lanchat_store::{Attachment, RegisteredUser, Room};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::blob_store::BlobStore;
use crate::error::{HubError, ServerError};
use crate::hub::Hub;
use crate::persist::{lock_db, SharedDb};
use crate::retention::{prune_blocking, RetentionPolicy};

pub const ADMIN_COOKIE: &str = "lanchat_admin";

/// Lifetime of an admin login.
const ADMIN_SESSION_TTL: Duration = Duration::from_secs(12 * 3600);

/// Room for multipart framing on top of the attachment itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub db: SharedDb,
    pub blob_store: Arc<BlobStore>,
    pub retention: Arc<RetentionPolicy>,
    pub admin: Arc<AdminSessions>,
}

// ---------------------------------------------------------------------------
// Admin sessions
// ---------------------------------------------------------------------------

/// Cookie-backed admin logins, kept in memory.
pub struct AdminSessions {
    password: Option<String>,
    ttl: Duration,
    sessions: Mutex<HashMap<String, Instant>>,
}

impl AdminSessions {
    pub fn new(password: Option<String>) -> Self {
        Self::with_ttl(password, ADMIN_SESSION_TTL)
    }

    pub fn with_ttl(password: Option<String>, ttl: Duration) -> Self {
        Self {
            password,
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Check the password and mint a session token.
    pub fn login(&self, presented: &str) -> Result<String, ServerError> {
        let Some(expected) = &self.password else {
            return Err(ServerError::Forbidden(
                "Admin API is disabled (no ADMIN_PASSWORD configured)".into(),
            ));
        };
        let presented = presented.as_bytes();
        let expected = expected.as_bytes();
        if presented.len() != expected.len() || presented.ct_eq(expected).unwrap_u8() != 1 {
            return Err(ServerError::Unauthorized);
        }

        let token = hex::encode(rand::random::<[u8; 32]>());
        let now = Instant::now();
        let mut sessions = self.sessions();
        sessions.retain(|_, expires| *expires > now);
        sessions.insert(token.clone(), now + self.ttl);
        Ok(token)
    }

    pub fn is_valid(&self, token: &str) -> bool {
        let mut sessions = self.sessions();
        match sessions.get(token) {
            Some(expires) if *expires > Instant::now() => true,
            Some(_) => {
                sessions.remove(token);
                false
            }
            None => false,
        }
    }

    pub fn revoke(&self, token: &str) {
        self.sessions().remove(token);
    }
}

/// A request carrying a live admin cookie.
pub struct Admin {
    token: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Admin {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar.get(ADMIN_COOKIE).map(Cookie::value).unwrap_or_default();
        if token.is_empty() || !state.admin.is_valid(token) {
            return Err(ServerError::Unauthorized);
        }
        Ok(Self {
            token: token.to_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let body_limit = state.blob_store.max_size() + MULTIPART_OVERHEAD;

    Router::new()
        .route("/health", get(health_check))
        .route("/admin/login", post(admin_login))
        .route("/admin/logout", post(admin_logout))
        .route("/admin/rooms", get(list_rooms).post(create_room))
        .route("/admin/rooms/:id", put(rename_room).delete(delete_room))
        .route("/admin/rooms/:id/members", put(set_room_members))
        .route("/admin/retention", get(get_retention).put(set_retention))
        .route("/admin/users", get(list_users))
        .route("/admin/users/:name", axum::routing::delete(delete_user))
        .route("/files", post(upload_file))
        .route("/files/:id", get(download_file))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP control plane");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    default_room: String,
    online: usize,
}

#[derive(Deserialize)]
struct LoginRequest {
    password: String,
}

#[derive(Serialize)]
struct RoomView {
    id: String,
    name: String,
    members: Option<Vec<String>>,
    online: usize,
}

#[derive(Deserialize)]
struct CreateRoomRequest {
    id: String,
    name: Option<String>,
    #[serde(default)]
    members: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct RenameRoomRequest {
    name: String,
}

#[derive(Deserialize)]
struct MembersRequest {
    members: Option<Vec<String>>,
}

#[derive(Serialize)]
struct EvictionResponse {
    evicted: usize,
}

#[derive(Serialize, Deserialize)]
struct RetentionBody {
    days: u32,
}

#[derive(Serialize)]
struct RetentionResponse {
    days: u32,
    pruned: usize,
}

#[derive(Serialize)]
struct UploadResponse {
    id: String,
    name: String,
    mime: String,
    size: u64,
    deduplicated: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let default_room = state.hub.default_room().to_string();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        online: state.hub.online_count(&default_room),
        default_room,
    })
}

async fn admin_login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let token = match state.admin.login(&req.password) {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, "admin login refused");
            return Err(e);
        }
    };
    let cookie = Cookie::build((ADMIN_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict);

    info!("admin logged in");
    Ok((jar.add(cookie), Json(serde_json::json!({ "ok": true }))))
}

async fn admin_logout(
    State(state): State<AppState>,
    admin: Admin,
    jar: CookieJar,
) -> impl IntoResponse {
    state.admin.revoke(&admin.token);
    let jar = jar.remove(Cookie::build((ADMIN_COOKIE, "")).path("/"));
    (jar, StatusCode::NO_CONTENT)
}

fn room_view(hub: &Hub, room: Room) -> RoomView {
    RoomView {
        online: hub.online_count(&room.id),
        id: room.id,
        name: room.name,
        members: room.members,
    }
}

fn reject_default(state: &AppState, id: &str) -> Result<(), ServerError> {
    if id == state.hub.default_room() {
        return Err(HubError::ProtectedRoom(id.to_string()).into());
    }
    Ok(())
}

fn valid_room_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(char::is_whitespace) && !id.contains(':')
}

async fn list_rooms(
    _admin: Admin,
    State(state): State<AppState>,
) -> Result<Json<Vec<RoomView>>, ServerError> {
    let rooms = lock_db(&state.db).list_rooms()?;
    let default_room = state.hub.default_room();

    let mut views = Vec::with_capacity(rooms.len() + 1);
    if !rooms.iter().any(|r| r.id == default_room) {
        views.push(room_view(
            &state.hub,
            Room {
                id: default_room.to_string(),
                name: default_room.to_string(),
                members: None,
            },
        ));
    }
    views.extend(rooms.into_iter().map(|r| room_view(&state.hub, r)));
    Ok(Json(views))
}

async fn create_room(
    _admin: Admin,
    State(state): State<AppState>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse, ServerError> {
    if !valid_room_id(&req.id) {
        return Err(ServerError::BadRequest(format!("Invalid room id: {:?}", req.id)));
    }
    reject_default(&state, &req.id)?;

    let room = Room {
        name: req.name.unwrap_or_else(|| req.id.clone()),
        id: req.id,
        members: req.members,
    };
    state
        .hub
        .define_room(&room.id, &room.name, room.members.clone())?;
    lock_db(&state.db).upsert_room(&room)?;

    info!(room = %room.id, restricted = room.members.is_some(), "room created");
    Ok((StatusCode::CREATED, Json(room_view(&state.hub, room))))
}

async fn rename_room(
    _admin: Admin,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RenameRoomRequest>,
) -> Result<Json<RoomView>, ServerError> {
    reject_default(&state, &id)?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ServerError::BadRequest("Room name is empty".into()));
    }
    lock_db(&state.db).get_room(&id)?;

    state.hub.rename_room(&id, name)?;
    let room = {
        let db = lock_db(&state.db);
        db.rename_room(&id, name)?;
        db.get_room(&id)?
    };
    Ok(Json(room_view(&state.hub, room)))
}

async fn set_room_members(
    _admin: Admin,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MembersRequest>,
) -> Result<Json<EvictionResponse>, ServerError> {
    reject_default(&state, &id)?;
    lock_db(&state.db).get_room(&id)?;

    let evicted = state.hub.set_room_members(&id, req.members.clone())?;
    lock_db(&state.db).set_room_members(&id, req.members.as_deref())?;
    Ok(Json(EvictionResponse { evicted }))
}

async fn delete_room(
    _admin: Admin,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EvictionResponse>, ServerError> {
    reject_default(&state, &id)?;
    lock_db(&state.db).get_room(&id)?;

    let evicted = state.hub.delete_room(&id)?;
    lock_db(&state.db).delete_room(&id)?;
    Ok(Json(EvictionResponse { evicted }))
}

async fn get_retention(_admin: Admin, State(state): State<AppState>) -> Json<RetentionBody> {
    Json(RetentionBody {
        days: state.retention.days(),
    })
}

async fn set_retention(
    _admin: Admin,
    State(state): State<AppState>,
    Json(req): Json<RetentionBody>,
) -> Result<Json<RetentionResponse>, ServerError> {
    lock_db(&state.db).set_retention_days(req.days)?;
    state.retention.set(req.days);
    let pruned = prune_blocking(state.db.clone(), req.days).await?;

    info!(days = req.days, pruned, "retention updated");
    Ok(Json(RetentionResponse {
        days: req.days,
        pruned,
    }))
}

async fn list_users(
    _admin: Admin,
    State(state): State<AppState>,
) -> Result<Json<Vec<RegisteredUser>>, ServerError> {
    Ok(Json(lock_db(&state.db).list_users()?))
}

async fn delete_user(
    _admin: Admin,
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<EvictionResponse>, ServerError> {
    if !lock_db(&state.db).delete_user(&name)? {
        return Err(ServerError::NotFound(format!("user {name}")));
    }
    let evicted = state.hub.evict_user(&name);
    Ok(Json(EvictionResponse { evicted }))
}

async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServerError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = sanitize_name(field.file_name().unwrap_or("file"));
        let mime = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;

        let (id, created) = state.blob_store.store(&data).await?;
        let attachment = Attachment {
            hash: id.clone(),
            name,
            mime,
            size: data.len() as u64,
            created_at: Utc::now(),
        };
        lock_db(&state.db).insert_attachment(&attachment)?;

        info!(id = %id, size = data.len(), deduplicated = !created, "Attachment uploaded");
        return Ok(Json(UploadResponse {
            id,
            name: attachment.name,
            mime: attachment.mime,
            size: attachment.size,
            deduplicated: !created,
        }));
    }

    Err(ServerError::BadRequest(
        "Missing 'file' field in multipart form".to_string(),
    ))
}

async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let data = state.blob_store.read(&id).await?;
    let meta = lock_db(&state.db).get_attachment(&id)?;
    let (name, mime) = match meta {
        Some(a) => (a.name, a.mime),
        None => (id.clone(), "application/octet-stream".to_string()),
    };

    Ok((
        [
            (header::CONTENT_TYPE, mime),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ),
        ],
        data,
    ))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{HeaderValue, Request, Response};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::hub::{ConnHandle, ConnId};
    use crate::persist::Persistence;
    use crate::unread::UnreadTracker;

    struct Harness {
        app: Router,
        state: AppState,
        _dir: TempDir,
    }

    async fn harness(password: Option<&str>) -> Harness {
        let dir = TempDir::new().unwrap();
        let db: SharedDb = Arc::new(Mutex::new(
            lanchat_store::Database::open_in_memory().unwrap(),
        ));
        let persist = Persistence::spawn(db.clone(), 1024);
        let hub = Arc::new(Hub::new(
            "general",
            persist,
            Arc::new(UnreadTracker::in_memory()),
        ));
        let blob_store = Arc::new(
            BlobStore::new(dir.path().join("attachments"), 1024 * 1024)
                .await
                .unwrap(),
        );
        let state = AppState {
            hub,
            db: db.clone(),
            blob_store,
            retention: Arc::new(RetentionPolicy::new(0)),
            admin: Arc::new(AdminSessions::new(password.map(str::to_string))),
        };
        Harness {
            app: build_router(state.clone()),
            state,
            _dir: dir,
        }
    }

    async fn call(app: &Router, req: Request<Body>) -> Response<Body> {
        app.clone().oneshot(req).await.unwrap()
    }

    async fn body_json(resp: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, cookie: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_request(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn login(app: &Router) -> String {
        let resp = call(
            app,
            json_request("POST", "/admin/login", None, serde_json::json!({ "password": "hunter2" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let set_cookie = resp
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v: &HeaderValue| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(set_cookie.contains("HttpOnly"));
        set_cookie.split(';').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(None).await;
        let resp = call(&h.app, get_request("/health", None)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["default_room"], "general");
    }

    #[tokio::test]
    async fn test_admin_requires_login() {
        let h = harness(Some("hunter2")).await;
        let resp = call(&h.app, get_request("/admin/rooms", None)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = call(
            &h.app,
            json_request("POST", "/admin/login", None, serde_json::json!({ "password": "wrong" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = call(&h.app, get_request("/admin/rooms", Some("lanchat_admin=forged"))).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_admin_disabled_without_password() {
        let h = harness(None).await;
        let resp = call(
            &h.app,
            json_request("POST", "/admin/login", None, serde_json::json!({ "password": "" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_logout_revokes_session() {
        let h = harness(Some("hunter2")).await;
        let cookie = login(&h.app).await;

        let req = Request::builder()
            .method("POST")
            .uri("/admin/logout")
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap();
        assert_eq!(call(&h.app, req).await.status(), StatusCode::NO_CONTENT);

        let resp = call(&h.app, get_request("/admin/rooms", Some(&cookie))).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let h = harness(Some("hunter2")).await;
        let cookie = login(&h.app).await;

        let resp = call(
            &h.app,
            json_request(
                "POST",
                "/admin/rooms",
                Some(&cookie),
                serde_json::json!({ "id": "ops", "name": "Operations", "members": ["alice"] }),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(!h.state.hub.admits("ops", "bob"));

        let resp = call(&h.app, get_request("/admin/rooms", Some(&cookie))).await;
        let rooms = body_json(resp).await;
        let ids: Vec<&str> = rooms
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["general", "ops"]);

        let resp = call(
            &h.app,
            json_request("PUT", "/admin/rooms/ops", Some(&cookie), serde_json::json!({ "name": "Ops Team" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["name"], "Ops Team");

        let resp = call(
            &h.app,
            json_request("PUT", "/admin/rooms/ops/members", Some(&cookie), serde_json::json!({ "members": null })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(h.state.hub.admits("ops", "bob"));
        assert_eq!(lock_db(&h.state.db).get_room("ops").unwrap().members, None);

        let req = Request::builder()
            .method("DELETE")
            .uri("/admin/rooms/ops")
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap();
        assert_eq!(call(&h.app, req).await.status(), StatusCode::OK);
        assert!(lock_db(&h.state.db).list_rooms().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_default_room_is_protected() {
        let h = harness(Some("hunter2")).await;
        let cookie = login(&h.app).await;

        let resp = call(
            &h.app,
            json_request("PUT", "/admin/rooms/general", Some(&cookie), serde_json::json!({ "name": "x" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let req = Request::builder()
            .method("DELETE")
            .uri("/admin/rooms/general")
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap();
        assert_eq!(call(&h.app, req).await.status(), StatusCode::FORBIDDEN);

        let req = Request::builder()
            .method("DELETE")
            .uri("/admin/rooms/nowhere")
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap();
        assert_eq!(call(&h.app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_retention_update() {
        let h = harness(Some("hunter2")).await;
        let cookie = login(&h.app).await;

        let resp = call(
            &h.app,
            json_request("PUT", "/admin/retention", Some(&cookie), serde_json::json!({ "days": 14 })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(h.state.retention.days(), 14);
        assert_eq!(lock_db(&h.state.db).retention_days().unwrap(), Some(14));

        let resp = call(&h.app, get_request("/admin/retention", Some(&cookie))).await;
        assert_eq!(body_json(resp).await["days"], 14);
    }

    #[tokio::test]
    async fn test_delete_user_disconnects_sessions() {
        let h = harness(Some("hunter2")).await;
        let cookie = login(&h.app).await;

        let (handle, mut rx) = ConnHandle::new(ConnId(1), "127.0.0.1:9".parse().unwrap());
        h.state.hub.join(&handle, "mallory", "general", None, false).unwrap();
        lock_db(&h.state.db).touch_user("mallory", Utc::now()).unwrap();

        let req = Request::builder()
            .method("DELETE")
            .uri("/admin/users/mallory")
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap();
        let resp = call(&h.app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["evicted"], 1);
        assert_eq!(h.state.hub.online_count("general"), 0);

        let mut saw_notice = false;
        while let Ok(item) = rx.try_recv() {
            if let crate::hub::Outbound::Line(line) = item {
                saw_notice |= line == "[SYS] ERROR USER_DELETED";
            }
        }
        assert!(saw_notice);

        let req = Request::builder()
            .method("DELETE")
            .uri("/admin/users/mallory")
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap();
        assert_eq!(call(&h.app, req).await.status(), StatusCode::NOT_FOUND);
    }

    fn multipart_upload(name: &str, bytes: &[u8]) -> Request<Body> {
        let boundary = "lanchat-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: text/plain\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/files")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let h = harness(None).await;

        let resp = call(&h.app, multipart_upload("notes.txt", b"meeting at noon")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let uploaded = body_json(resp).await;
        let id = uploaded["id"].as_str().unwrap().to_string();
        assert_eq!(uploaded["deduplicated"], false);
        assert_eq!(uploaded["mime"], "text/plain");

        let resp = call(&h.app, multipart_upload("copy.txt", b"meeting at noon")).await;
        let again = body_json(resp).await;
        assert_eq!(again["id"], id.as_str());
        assert_eq!(again["deduplicated"], true);

        let resp = call(&h.app, get_request(&format!("/files/{id}"), None)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let disposition = resp
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains("notes.txt"), "{disposition}");
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"meeting at noon");

        let resp = call(&h.app, get_request("/files/not-a-hash", None)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
