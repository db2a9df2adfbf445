//! End-to-end tests for the client and api pipelines, driven through
//! `Orchestrator::build_with` and a hand-built registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tower::ServiceExt;

use svckit::bootstrap::{ApiModuleConfig, AppConfig, ClientModuleConfig, JwtConfig, SessionConfig};
use svckit::mail::LogMailClient;
use svckit::store::MemoryStore;
use svckit::{
    async_trait, Collaborators, Family, Filter, Mailer, Operation, Orchestrator, PersistenceComponent,
    PersistenceInit, RegistryBuilder, RequestError, RouteComponent, RouteComponentBase, RouteComponentConfig,
    RouteComponentInit, RouteDescriptor, SchemaBuilder, TaskHandler, TaskInput, GENERIC_ERROR_MESSAGE,
};

const SESSION_SECRET: &str = "0123456789abcdef0123456789abcdef-test";

// ---------- persistence ----------

#[derive(Default)]
struct Accounts {
    rows: Mutex<Vec<Value>>,
    calls: AtomicUsize,
}

#[async_trait]
impl PersistenceComponent for Accounts {
    fn name(&self) -> &str {
        "accounts"
    }

    async fn create(&self, body: Value) -> Result<Value, RequestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Value::Object(mut fields) = body else {
            return Err(RequestError::bad_request("Expected an object."));
        };
        let mut rows = self.rows.lock();
        fields.insert("id".into(), json!(rows.len() + 1));
        let row = Value::Object(fields);
        rows.push(row.clone());
        Ok(row)
    }

    async fn read(&self, filter: Filter) -> Result<Value, RequestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let rows = self.rows.lock();
        let Some(id) = filter.get("id").and_then(Value::as_str) else {
            return Ok(Value::Array(rows.clone()));
        };
        rows.iter()
            .find(|row| row["id"].to_string() == id)
            .cloned()
            .ok_or_else(|| RequestError::safe(StatusCode::NOT_FOUND, "Account not found."))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn accounts_factory(_: &mut SchemaBuilder, _: &PersistenceInit) -> anyhow::Result<Arc<dyn PersistenceComponent>> {
    Ok(Arc::new(Accounts::default()))
}

// ---------- route components ----------

struct Component {
    base: RouteComponentBase,
    custom: HashMap<&'static str, TaskHandler>,
}

impl Component {
    fn new(name: &str, singular: &str, routes: Vec<RouteDescriptor>, defaults: Vec<Operation>) -> Self {
        Self {
            base: RouteComponentBase::new(RouteComponentConfig {
                component_name: name.into(),
                component_name_singular: singular.into(),
                routes,
                add_default_routes: defaults,
                route_prefix: String::new(),
            }),
            custom: HashMap::new(),
        }
    }

    fn handler<F, Fut>(mut self, name: &'static str, f: F) -> Self
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, RequestError>> + Send + 'static,
    {
        self.custom.insert(name, TaskHandler::new(f));
        self
    }
}

impl RouteComponent for Component {
    fn base(&self) -> &RouteComponentBase {
        &self.base
    }

    fn custom_handler(&self, name: &str) -> Option<TaskHandler> {
        self.custom.get(name).cloned()
    }
}

async fn page(input: TaskInput) -> Result<Response, RequestError> {
    Ok(input.ctx.original_url.clone().into_response())
}

async fn login(input: TaskInput) -> Result<Response, RequestError> {
    let session = input
        .session()
        .ok_or_else(|| RequestError::new(anyhow::anyhow!("no session")))?;
    session.login(json!({ "id": 1 }));
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn echo(input: TaskInput) -> Result<Response, RequestError> {
    Ok(Json(input.body).into_response())
}

async fn slow(_: TaskInput) -> Result<Response, RequestError> {
    tokio::time::sleep(Duration::from_secs(10)).await;
    Ok("late".into_response())
}

async fn boom(_: TaskInput) -> Result<Response, RequestError> {
    Err(RequestError::new(anyhow::anyhow!("connection refused: postgres://admin:hunter2@db")))
}

async fn reject(_: TaskInput) -> Result<Response, RequestError> {
    Err(RequestError::safe(StatusCode::CONFLICT, "Already taken."))
}

async fn issue(input: TaskInput) -> Result<Response, RequestError> {
    let token = input.ctx.issue_token("1", json!({}))?;
    Ok(Json(json!({ "token": token })).into_response())
}

async fn whoami(input: TaskInput) -> Result<Response, RequestError> {
    let claims = input
        .claims()
        .ok_or_else(|| RequestError::new(anyhow::anyhow!("no claims")))?;
    Ok(Json(json!({ "sub": claims.sub })).into_response())
}

fn accounts_routes(_: &RouteComponentInit<'_>) -> anyhow::Result<Arc<dyn RouteComponent>> {
    Ok(Arc::new(Component::new(
        "accounts",
        "account",
        Vec::new(),
        vec![Operation::Create, Operation::Read],
    )))
}

fn site_pages(_: &RouteComponentInit<'_>) -> anyhow::Result<Arc<dyn RouteComponent>> {
    let component = Component::new(
        "pages",
        "page",
        vec![
            RouteDescriptor::get(["/login", "/home"], Operation::custom("page")),
            RouteDescriptor::get("/open", Operation::custom("page")),
            RouteDescriptor::post("/session/login", Operation::custom("login")),
            RouteDescriptor::post("/echo", Operation::custom("echo")),
            RouteDescriptor::get("/slow", Operation::custom("slow")),
            RouteDescriptor::post("/boom", Operation::custom("boom")),
            RouteDescriptor::post("/reject", Operation::custom("reject")),
        ],
        Vec::new(),
    )
    .handler("page", page)
    .handler("login", login)
    .handler("echo", echo)
    .handler("slow", slow)
    .handler("boom", boom)
    .handler("reject", reject);
    Ok(Arc::new(component))
}

fn mobile_auth(_: &RouteComponentInit<'_>) -> anyhow::Result<Arc<dyn RouteComponent>> {
    let component = Component::new(
        "auth",
        "auth",
        vec![
            RouteDescriptor::post("/auth/token", Operation::custom("issue")),
            RouteDescriptor::get("/whoami", Operation::custom("whoami")),
        ],
        Vec::new(),
    )
    .handler("issue", issue)
    .handler("whoami", whoami);
    Ok(Arc::new(component))
}

fn site_settings() -> Value {
    json!({
        "anonymous_access_routes": [
            "/login", "/open", "/echo", "/slow", "/boom", "/reject",
            "/session/login", "/accounts/create", "/accounts/read"
        ],
        "unauthorized_redirect_route": "/login",
        "not_found_redirect_routes": { "default": "/login", "authenticated": "/home" },
    })
}

fn mobile_settings() -> Value {
    json!({ "anonymous_access_routes": ["/auth/token"] })
}

// ---------- harness ----------

fn registry() -> svckit::Registry {
    let mut b = RegistryBuilder::default();
    b.register_persistence("accounts", accounts_factory)
        .register_module(Family::Client, "site", Some(site_settings))
        .register_route_component(Family::Client, "site", "accounts", accounts_routes)
        .register_route_component(Family::Client, "site", "pages", site_pages)
        .register_module(Family::Api, "mobile", Some(mobile_settings))
        .register_route_component(Family::Api, "mobile", "accounts", accounts_routes)
        .register_route_component(Family::Api, "mobile", "auth", mobile_auth);
    b.build().unwrap()
}

fn config(dir: &std::path::Path) -> AppConfig {
    let mut cfg = AppConfig {
        logging: None,
        ..AppConfig::default()
    };
    cfg.server.base_dir = dir.to_string_lossy().into_owned();
    cfg.server.request_timeout_sec = 1;
    cfg.clients.insert(
        "site".into(),
        ClientModuleConfig {
            port: 0,
            public_path: "public/site".into(),
            session: SessionConfig {
                secret: SESSION_SECRET.into(),
                key: "sid".into(),
                ttl_sec: 60,
            },
        },
    );
    cfg.apis.insert(
        "mobile".into(),
        ApiModuleConfig {
            port: 0,
            jwt: JwtConfig {
                secret: "mobile-secret".into(),
                ttl_sec: 60,
            },
        },
    );
    cfg
}

fn collaborators(dir: &std::path::Path) -> Collaborators {
    Collaborators::new(
        Mailer::new(Arc::new(LogMailClient), dir.join("templates")),
        Arc::new(MemoryStore::new()),
    )
}

struct Harness {
    orch: Orchestrator,
    dir: tempfile::TempDir,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::build_with(config(dir.path()), &registry(), collaborators(dir.path()))
            .await
            .unwrap();
        Self { orch, dir }
    }

    fn site(&self) -> Router {
        self.orch.client_router("site").unwrap()
    }

    fn mobile(&self) -> Router {
        self.orch.api_router("mobile").unwrap()
    }

    fn account_calls(&self) -> usize {
        self.orch
            .db()
            .component_as::<Accounts>("accounts")
            .unwrap()
            .calls
            .load(Ordering::SeqCst)
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(router: &Router, req: Request<Body>) -> Response {
    router.clone().oneshot(req).await.unwrap()
}

async fn json_of(res: Response) -> Value {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn text_of(res: Response) -> String {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn location(res: &Response) -> &str {
    res.headers().get(header::LOCATION).unwrap().to_str().unwrap()
}

// ---------- default routes ----------

#[tokio::test]
async fn create_then_read_round_trip() {
    let h = Harness::new().await;
    let site = h.site();

    let res = send(&site, post_json("/accounts/create", json!({"name": "a"}))).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_of(res).await, json!({"account": {"id": 1, "name": "a"}}));

    let res = send(&site, get("/accounts/read?id=1")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_of(res).await, json!({"account": {"id": 1, "name": "a"}}));
}

#[tokio::test]
async fn list_valued_query_params_are_dropped() {
    let h = Harness::new().await;
    let site = h.site();
    send(&site, post_json("/accounts/create", json!({"name": "a"}))).await;
    send(&site, post_json("/accounts/create", json!({"name": "b"}))).await;

    let res = send(&site, get("/accounts/read?id[]=1&id[]=2")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        json_of(res).await,
        json!({"account": [{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]})
    );
}

#[tokio::test]
async fn safe_business_failure_reaches_the_caller() {
    let h = Harness::new().await;
    let res = send(&h.site(), get("/accounts/read?id=42")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_of(res).await, json!({"error": "Account not found."}));
}

// ---------- error funnel ----------

#[tokio::test]
async fn internal_errors_render_the_generic_message() {
    let h = Harness::new().await;
    let res = send(&h.site(), post_json("/boom", json!({}))).await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_of(res).await;
    assert_eq!(body, json!({"error": GENERIC_ERROR_MESSAGE}));
    assert!(!body.to_string().contains("hunter2"));
}

#[tokio::test]
async fn safe_errors_render_their_message() {
    let h = Harness::new().await;
    let res = send(&h.site(), post_json("/reject", json!({}))).await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_eq!(
        res.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    assert_eq!(json_of(res).await, json!({"error": "Already taken."}));
}

#[tokio::test]
async fn malformed_json_is_a_400() {
    let h = Harness::new().await;
    let req = Request::builder()
        .method("POST")
        .uri("/echo")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let res = send(&h.site(), req).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_of(res).await, json!({"error": "Request body could not be parsed."}));
}

#[tokio::test]
async fn slow_tasks_time_out_with_504() {
    let h = Harness::new().await;
    let res = send(&h.site(), get("/slow")).await;
    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(
        json_of(res).await,
        json!({"error": "The request timed out. Please try again."})
    );
}

// ---------- body parsing ----------

#[tokio::test]
async fn multipart_files_land_in_the_upload_dir() {
    let h = Harness::new().await;
    let boundary = "svckit-boundary";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"title\"\r\n\r\n\
         Quarterly\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"report\"; filename=\"q3.csv\"\r\n\
         Content-Type: text/csv\r\n\r\n\
         a,b\n1,2\r\n\
         --{boundary}--\r\n"
    );
    let req = Request::builder()
        .method("POST")
        .uri("/echo")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
        .body(Body::from(body))
        .unwrap();

    let res = send(&h.site(), req).await;
    assert_eq!(res.status(), StatusCode::OK);
    let echoed = json_of(res).await;
    assert_eq!(echoed["title"], "Quarterly");

    let report = &echoed["report"];
    assert_eq!(report["originalFilename"], "q3.csv");
    assert_eq!(report["contentType"], "text/csv");
    assert_eq!(report["size"], 7);
    let path = std::path::PathBuf::from(report["path"].as_str().unwrap());
    assert!(path.starts_with(h.dir.path().join("storage/tmp")), "{path:?}");
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("csv"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "a,b\n1,2");
}

#[tokio::test]
async fn form_bodies_collect_repeated_keys() {
    let h = Harness::new().await;
    let req = Request::builder()
        .method("POST")
        .uri("/echo")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("a=1&b=2&b=3"))
        .unwrap();
    let res = send(&h.site(), req).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_of(res).await, json!({"a": "1", "b": ["2", "3"]}));
}

#[tokio::test]
async fn missing_body_is_an_empty_object() {
    let h = Harness::new().await;
    let req = Request::builder().method("POST").uri("/echo").body(Body::empty()).unwrap();
    let res = send(&h.site(), req).await;
    assert_eq!(json_of(res).await, json!({}));
}

// ---------- client redirects ----------

#[tokio::test]
async fn anonymous_routes_are_served_without_redirect() {
    let h = Harness::new().await;
    let res = send(&h.site(), get("/open")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(text_of(res).await, "/open");
}

#[tokio::test]
async fn unauthenticated_requests_redirect_to_login() {
    let h = Harness::new().await;
    let site = h.site();

    let res = send(&site, get("/home")).await;
    assert_eq!(res.status(), StatusCode::FOUND);
    assert_eq!(location(&res), "/login");

    // the redirect target itself is always reachable
    let res = send(&site, get("/login")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(text_of(res).await, "/login");
}

#[tokio::test]
async fn unmatched_client_paths_redirect_by_auth_state() {
    let h = Harness::new().await;
    let site = h.site();

    let res = send(&site, get("/nowhere")).await;
    assert_eq!(res.status(), StatusCode::FOUND);
    assert_eq!(location(&res), "/login");

    let res = send(&site, post_json("/session/login", json!({}))).await;
    assert_eq!(res.status(), StatusCode::OK);
    let cookie = res
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let req = Request::builder()
        .uri("/nowhere")
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .unwrap();
    let res = send(&site, req).await;
    assert_eq!(res.status(), StatusCode::FOUND);
    assert_eq!(location(&res), "/home");

    let req = Request::builder()
        .uri("/home")
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .unwrap();
    let res = send(&site, req).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(text_of(res).await, "/home");
}

#[tokio::test]
async fn static_files_are_served_from_the_public_dir() {
    let h = Harness::new().await;
    let public = h.orch.config().resolve_path("public/site");
    std::fs::create_dir_all(&public).unwrap();
    std::fs::write(public.join("app.css"), "body {}").unwrap();

    let res = send(&h.site(), get("/app.css")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(text_of(res).await, "body {}");
}

// ---------- api ----------

#[tokio::test]
async fn unmatched_api_paths_are_json_404() {
    let h = Harness::new().await;
    let mobile = h.mobile();

    let res = send(&mobile, get("/nowhere")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_of(res).await, json!({"error": "Not found."}));

    // wrong method on a mounted path behaves like an unknown path
    let res = send(&mobile, get("/auth/token")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_of(res).await, json!({"error": "Not found."}));
}

#[tokio::test]
async fn gated_api_routes_reject_before_persistence() {
    let h = Harness::new().await;
    let mobile = h.mobile();

    let res = send(&mobile, get("/accounts/read?id=1")).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_of(res).await, json!({"error": "Unauthorized."}));

    let req = Request::builder()
        .uri("/accounts/read?id=1")
        .header(header::AUTHORIZATION, "Bearer not-a-token")
        .body(Body::empty())
        .unwrap();
    let res = send(&mobile, req).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(h.account_calls(), 0);
}

#[tokio::test]
async fn issued_tokens_open_the_gate() {
    let h = Harness::new().await;
    let mobile = h.mobile();

    let res = send(&mobile, post_json("/auth/token", json!({}))).await;
    assert_eq!(res.status(), StatusCode::OK);
    let token = json_of(res).await["token"].as_str().unwrap().to_string();

    let req = Request::builder()
        .uri("/whoami")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let res = send(&mobile, req).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_of(res).await, json!({"sub": "1"}));
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let h = Harness::new().await;
    let res = send(&h.mobile(), get("/nowhere")).await;
    assert!(res.headers().contains_key("x-request-id"));

    let req = Request::builder()
        .uri("/nowhere")
        .header("x-request-id", "abc-123")
        .body(Body::empty())
        .unwrap();
    let res = send(&h.mobile(), req).await;
    assert_eq!(res.headers().get("x-request-id").unwrap(), "abc-123");
}

// ---------- bootstrap ----------

#[tokio::test]
async fn registered_module_without_server_config_fails_the_build() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.apis.clear();
    let err = Orchestrator::build_with(cfg, &registry(), collaborators(dir.path()))
        .await
        .unwrap_err();
    assert!(
        matches!(err, svckit::OrchestratorError::MissingServerConfig { ref module, family: Family::Api } if module == "mobile"),
        "{err:?}"
    );
}

#[tokio::test]
async fn configured_settings_override_registered_ones() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.modules.insert(
        "site".into(),
        json!({ "not_found_redirect_routes": { "default": "/welcome", "authenticated": "/home" } }),
    );
    let orch = Orchestrator::build_with(cfg, &registry(), collaborators(dir.path()))
        .await
        .unwrap();

    let site = orch.module(Family::Client, "site").unwrap();
    assert_eq!(site.settings.not_found_redirect_routes.default, "/welcome");
    assert_eq!(site.settings.unauthorized_redirect_route.as_deref(), Some("/login"));

    let res = send(&orch.client_router("site").unwrap(), get("/nowhere")).await;
    assert_eq!(location(&res), "/welcome");
}

#[tokio::test]
async fn listen_renders_shells_and_serves_every_module() {
    let dir = tempfile::tempdir().unwrap();
    let sources = dir.path().join("clients/site");
    std::fs::create_dir_all(&sources).unwrap();
    std::fs::write(
        sources.join("layout_local.html"),
        "<title>{{ module_name }} / {{ profile }}</title>",
    )
    .unwrap();

    let orch = Orchestrator::build_with(config(dir.path()), &registry(), collaborators(dir.path()))
        .await
        .unwrap();
    let cancel = tokio_util::sync::CancellationToken::new();
    let running = orch.listen(cancel.clone()).await.unwrap();
    assert_eq!(running.len(), 2);

    let shell = std::fs::read_to_string(dir.path().join("public/site/layout.html")).unwrap();
    assert_eq!(shell, "<title>site / local</title>");

    let api = running.iter().find(|s| s.family == Family::Api).unwrap();
    let res = reqwest::get(format!("http://{}/nowhere", api.local_addr)).await.unwrap();
    assert_eq!(res.status().as_u16(), 404);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body, json!({"error": "Not found."}));

    cancel.cancel();
    for service in running {
        service.handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn missing_shell_template_aborts_listen() {
    let dir = tempfile::tempdir().unwrap();
    let orch = Orchestrator::build_with(config(dir.path()), &registry(), collaborators(dir.path()))
        .await
        .unwrap();
    let err = orch
        .listen(tokio_util::sync::CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, svckit::OrchestratorError::Shell { .. }), "{err:?}");
}

#[tokio::test]
async fn mounted_tasks_write_exactly_one_response() {
    let h = Harness::new().await;
    let site = h.site();
    for uri in ["/boom", "/reject", "/echo"] {
        let res = send(&site, post_json(uri, json!({"k": "v"}))).await;
        assert_eq!(res.headers().get_all(header::CONTENT_TYPE).iter().count(), 1, "{uri}");
        let body = json_of(res).await;
        assert!(body.is_object(), "{uri}: {body}");
    }
}
