use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;

use hyper::header::HeaderValue;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::admin::{AdminError, SubnetAdmin};
use crate::limiter::LimiterError;
use crate::policy::RateLimitService;
use crate::subnets::ListKind;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Dependencies injected into the request handlers. A missing dependency is
/// a deployment mistake and surfaces to callers as a service error rather
/// than a panic.
pub struct ApiContext {
    pub rate_limiter: Option<Arc<RateLimitService>>,
    pub subnet_admin: Option<Arc<SubnetAdmin>>,
    pub log: slog::Logger,
}

#[derive(Debug, Deserialize)]
struct CheckRequest {
    login: String,
    password: String,
    ip: String,
}

#[derive(Debug, Serialize)]
struct CheckResponse {
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct ResetRequest {
    login: String,
    ip: String,
}

#[derive(Debug, Deserialize)]
struct CidrRequest {
    cidr: String,
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotConfigured(&'static str),
    Internal(String),
}

impl ApiError {
    fn into_response(self) -> Response<Body> {
        let (status, message) = match &self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.as_str()),
            ApiError::NotConfigured(message) => (StatusCode::SERVICE_UNAVAILABLE, *message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message.as_str()),
        };
        json_response(status, &serde_json::json!({ "error": message }))
    }
}

impl From<AdminError> for ApiError {
    fn from(err: AdminError) -> ApiError {
        match err {
            AdminError::EmptyCidr | AdminError::InvalidCidr { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            AdminError::StoreError(_) | AdminError::PublishError(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<LimiterError> for ApiError {
    fn from(err: LimiterError) -> ApiError {
        ApiError::Internal(err.to_string())
    }
}

/// Entry point for every RPC. Policy denials are ordinary `{"ok": false}`
/// responses; only validation and backend failures map to error statuses.
/// Every response carries the caller's `x-request-id` or a freshly minted
/// one.
pub async fn handle_request(
    req: Request<Body>,
    ctx: Arc<ApiContext>,
    remote_addr: Option<std::net::SocketAddr>,
) -> Result<Response<Body>, Infallible> {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = std::time::Instant::now();

    let mut response = match route(req, &ctx).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    slog::info!(ctx.log, "Handled request";
        "method" => method.as_str(),
        "path" => path.as_str(),
        "status" => response.status().as_u16(),
        "duration" => format!("{:?}", start.elapsed()),
        "remote_addr" => remote_addr.map(|addr| addr.to_string()).unwrap_or_else(|| "-".to_owned()),
        "request_id" => request_id.as_str());

    Ok(response)
}

async fn route(req: Request<Body>, ctx: &ApiContext) -> Result<Response<Body>, ApiError> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    match (&method, path.as_str()) {
        (&Method::POST, "/v1/check") => handle_check(req, ctx).await,
        (&Method::POST, "/v1/reset") => handle_reset(req, ctx).await,
        (&Method::POST, "/v1/allowlist/add") => handle_cidr(req, ctx, ListKind::Allow, CidrOp::Add).await,
        (&Method::POST, "/v1/allowlist/remove") => {
            handle_cidr(req, ctx, ListKind::Allow, CidrOp::Remove).await
        }
        (&Method::POST, "/v1/denylist/add") => handle_cidr(req, ctx, ListKind::Deny, CidrOp::Add).await,
        (&Method::POST, "/v1/denylist/remove") => {
            handle_cidr(req, ctx, ListKind::Deny, CidrOp::Remove).await
        }
        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            &serde_json::json!({ "error": "not found" }),
        )),
    }
}

async fn handle_check(req: Request<Body>, ctx: &ApiContext) -> Result<Response<Body>, ApiError> {
    let rate_limiter = ctx
        .rate_limiter
        .as_ref()
        .ok_or(ApiError::NotConfigured("rate limiter not configured"))?;
    let body: CheckRequest = read_json(req).await?;
    let ip = parse_ip(&body.ip)?;

    let ok = rate_limiter.check(&body.login, &body.password, ip).await?;
    Ok(json_response(StatusCode::OK, &CheckResponse { ok }))
}

async fn handle_reset(req: Request<Body>, ctx: &ApiContext) -> Result<Response<Body>, ApiError> {
    let rate_limiter = ctx
        .rate_limiter
        .as_ref()
        .ok_or(ApiError::NotConfigured("rate limiter not configured"))?;
    let body: ResetRequest = read_json(req).await?;
    let ip = parse_ip(&body.ip)?;

    // The wire request carries no password, so the password dimension is
    // reset for the empty string alongside the other two.
    rate_limiter.reset(&body.login, "", ip).await?;
    Ok(json_response(StatusCode::OK, &serde_json::json!({})))
}

enum CidrOp {
    Add,
    Remove,
}

async fn handle_cidr(
    req: Request<Body>,
    ctx: &ApiContext,
    kind: ListKind,
    op: CidrOp,
) -> Result<Response<Body>, ApiError> {
    let subnet_admin = ctx
        .subnet_admin
        .as_ref()
        .ok_or(ApiError::NotConfigured("subnet list not configured"))?;
    let body: CidrRequest = read_json(req).await?;

    match op {
        CidrOp::Add => subnet_admin.add(kind, &body.cidr).await?,
        CidrOp::Remove => subnet_admin.remove(kind, &body.cidr).await?,
    }
    Ok(json_response(StatusCode::OK, &serde_json::json!({})))
}

fn parse_ip(raw: &str) -> Result<IpAddr, ApiError> {
    raw.parse::<IpAddr>()
        .map_err(|_| ApiError::BadRequest("invalid IP address".to_owned()))
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Body>) -> Result<T, ApiError> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|err| ApiError::BadRequest(format!("unreadable request body: {}", err)))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| ApiError::BadRequest(format!("invalid request body: {}", err)))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let payload = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_owned());
    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::MemBucketStore;
    use crate::policy::{Dimension, LimitChecker, LimitRules, Rule};
    use crate::subnet_store::MemSubnetStore;
    use crate::subnets::SubnetHolder;
    use crate::updates::LocalPublisher;
    use std::time::Duration;

    fn test_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    async fn test_context(login_limit: u32) -> Arc<ApiContext> {
        let subnet_store = Arc::new(MemSubnetStore::new());
        let holder = Arc::new(SubnetHolder::new(subnet_store.clone(), test_log()));
        holder.reload().await.unwrap();

        let mut rules = LimitRules::new();
        let window = Duration::from_secs(60);
        rules.insert(Dimension::Login, Rule { limit: login_limit, window });
        rules.insert(Dimension::Password, Rule { limit: 100, window });
        rules.insert(Dimension::Ip, Rule { limit: 100, window });

        let checker = LimitChecker::new(Arc::new(MemBucketStore::new()), rules);
        let rate_limiter = Arc::new(RateLimitService::new(holder.clone(), checker));

        let publisher = Arc::new(LocalPublisher::new(holder));
        let subnet_admin = Arc::new(SubnetAdmin::new(subnet_store, publisher, test_log()));

        Arc::new(ApiContext {
            rate_limiter: Some(rate_limiter),
            subnet_admin: Some(subnet_admin),
            log: test_log(),
        })
    }

    fn post(path: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn response_json(response: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn check_body(login: &str, password: &str, ip: &str) -> serde_json::Value {
        serde_json::json!({ "login": login, "password": password, "ip": ip })
    }

    #[tokio::test]
    async fn check_allows_until_login_limit_and_reset_restores() {
        let ctx = test_context(3).await;

        for _ in 0..3 {
            let response = handle_request(post("/v1/check", check_body("u", "p", "1.2.3.4")), ctx.clone(), None)
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response_json(response).await["ok"], true);
        }

        let response = handle_request(post("/v1/check", check_body("u", "p", "1.2.3.4")), ctx.clone(), None)
            .await
            .unwrap();
        assert_eq!(response_json(response).await["ok"], false);

        let response = handle_request(
            post("/v1/reset", serde_json::json!({ "login": "u", "ip": "1.2.3.4" })),
            ctx.clone(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = handle_request(post("/v1/check", check_body("u", "p", "1.2.3.4")), ctx, None)
            .await
            .unwrap();
        assert_eq!(response_json(response).await["ok"], true);
    }

    #[tokio::test]
    async fn invalid_ip_is_rejected_without_touching_counters() {
        let ctx = test_context(1).await;

        let response = handle_request(post("/v1/check", check_body("u", "p", "not-an-ip")), ctx.clone(), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response_json(response).await["error"],
            "invalid IP address"
        );

        // The failed request consumed nothing: one valid attempt still fits
        // a limit of one.
        let response = handle_request(post("/v1/check", check_body("u", "p", "1.2.3.4")), ctx, None)
            .await
            .unwrap();
        assert_eq!(response_json(response).await["ok"], true);
    }

    #[tokio::test]
    async fn denylist_add_blocks_following_checks() {
        let ctx = test_context(100).await;

        let response = handle_request(
            post("/v1/denylist/add", serde_json::json!({ "cidr": "10.0.0.0/8" })),
            ctx.clone(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = handle_request(post("/v1/check", check_body("u", "p", "10.5.6.7")), ctx, None)
            .await
            .unwrap();
        assert_eq!(response_json(response).await["ok"], false);
    }

    #[tokio::test]
    async fn allowlist_add_admits_following_checks() {
        let ctx = test_context(0).await;

        let response = handle_request(post("/v1/check", check_body("u", "p", "192.168.2.10")), ctx.clone(), None)
            .await
            .unwrap();
        assert_eq!(response_json(response).await["ok"], false);

        let response = handle_request(
            post("/v1/allowlist/add", serde_json::json!({ "cidr": "192.168.2.0/24" })),
            ctx.clone(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = handle_request(post("/v1/check", check_body("u", "p", "192.168.2.10")), ctx, None)
            .await
            .unwrap();
        assert_eq!(response_json(response).await["ok"], true);
    }

    #[tokio::test]
    async fn malformed_cidr_is_a_bad_request() {
        let ctx = test_context(10).await;

        let response = handle_request(
            post("/v1/allowlist/add", serde_json::json!({ "cidr": "nonsense" })),
            ctx,
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn request_id_is_echoed_when_supplied() {
        let ctx = test_context(10).await;

        let req = Request::builder()
            .method(Method::POST)
            .uri("/v1/check")
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(Body::from(check_body("u", "p", "1.2.3.4").to_string()))
            .unwrap();

        let response = handle_request(req, ctx, None).await.unwrap();
        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).unwrap(),
            "abc-123"
        );
    }

    #[tokio::test]
    async fn request_id_is_generated_when_absent() {
        let ctx = test_context(10).await;

        let response = handle_request(post("/v1/check", check_body("u", "p", "1.2.3.4")), ctx, None)
            .await
            .unwrap();
        let value = response.headers().get(REQUEST_ID_HEADER).unwrap();
        assert!(!value.to_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let ctx = test_context(10).await;
        let response = handle_request(post("/v1/bogus", serde_json::json!({})), ctx, None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let ctx = test_context(10).await;
        let req = Request::builder()
            .method(Method::POST)
            .uri("/v1/check")
            .body(Body::from("not json"))
            .unwrap();
        let response = handle_request(req, ctx, None).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_dependencies_are_service_errors() {
        let ctx = Arc::new(ApiContext {
            rate_limiter: None,
            subnet_admin: None,
            log: test_log(),
        });

        let response = handle_request(post("/v1/check", check_body("u", "p", "1.2.3.4")), ctx.clone(), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = handle_request(
            post("/v1/denylist/add", serde_json::json!({ "cidr": "10.0.0.0/8" })),
            ctx,
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
