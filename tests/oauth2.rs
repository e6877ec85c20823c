use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use request_agent::{
    mock::{MockReply, MockTransport},
    AuthAgent, AuthContext, Method, OAuth2Agent, OAuth2Params, OAuth2Tokens, RequestClient,
    RequestConfig, RequestOptions, RequestSpec, Response, Transport, TransportError,
};
use serde_json::json;

const TOKEN_URL: &str = "http://auth.example.com/token";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_millis() as u64
}

fn base_params() -> OAuth2Params {
    OAuth2Params::new("i-am-client", TOKEN_URL)
}

fn agent(params: OAuth2Params, transport: &Arc<MockTransport>) -> OAuth2Agent {
    OAuth2Agent::new(params)
        .with_transport(transport.clone())
        .with_token_request_config(
            RequestConfig::default().with_retry_delay(Duration::ZERO, Duration::ZERO),
        )
}

async fn header(agent: &OAuth2Agent) -> Option<String> {
    let method = Method::GET;
    agent
        .header(&AuthContext {
            method: &method,
            url: "http://api.example.com/",
            body: None,
        })
        .await
        .expect("oauth2 agent never fails")
}

fn token_reply(access_token: &str, refresh_token: Option<&str>) -> MockReply {
    let mut body = json!({"access_token": access_token, "expires_in": 3600});
    if let Some(refresh_token) = refresh_token {
        body["refresh_token"] = json!(refresh_token);
    }
    MockReply::json(200, body)
}

fn form_body(transport: &MockTransport, index: usize) -> String {
    let call = &transport.calls()[index];
    String::from_utf8(call.body.clone().expect("token call has a body").to_vec()).unwrap()
}

#[tokio::test]
async fn returns_cached_access_token_without_network() {
    let transport = Arc::new(MockTransport::always(MockReply::status(500)));
    let agent = agent(
        base_params()
            .with_access_token("hello-token", Some(now_ms() + 10_000))
            .with_min_validity_seconds(0),
        &transport,
    );

    assert_eq!(header(&agent).await.as_deref(), Some("Bearer hello-token"));
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn cached_token_within_margin_is_kept() {
    let transport = Arc::new(MockTransport::always(MockReply::status(500)));
    let agent = agent(
        base_params()
            .with_access_token("hello-token", Some(now_ms() + 10_000))
            .with_min_validity_seconds(5),
        &transport,
    );
    assert_eq!(header(&agent).await.as_deref(), Some("Bearer hello-token"));
}

#[tokio::test]
async fn expired_token_is_replaced_via_client_credentials() {
    let transport = Arc::new(MockTransport::always(token_reply("new-token", None)));
    let agent = agent(
        base_params()
            .with_client_secret("i-am-secret")
            .with_access_token("hello-token", Some(now_ms() - 10_000))
            .with_min_validity_seconds(0),
        &transport,
    );

    assert_eq!(header(&agent).await.as_deref(), Some("Bearer new-token"));
    assert_eq!(transport.call_count(), 1);

    let call = transport.last_call().unwrap();
    assert_eq!(call.method, "POST");
    assert_eq!(call.url, TOKEN_URL);
    assert_eq!(
        call.headers["content-type"],
        "application/x-www-form-urlencoded"
    );
    assert_eq!(
        form_body(&transport, 0),
        "grant_type=client_credentials&client_id=i-am-client&client_secret=i-am-secret"
    );

    let params = agent.params();
    assert_eq!(params.access_token.as_deref(), Some("new-token"));
    let expires_at = params.expires_at.expect("expiry recorded");
    assert!(expires_at > now_ms() + 3_500_000);
}

#[tokio::test]
async fn token_inside_margin_triggers_refresh() {
    let transport = Arc::new(MockTransport::always(token_reply("new-token", None)));
    let agent = agent(
        base_params()
            .with_client_secret("i-am-secret")
            .with_access_token("hello-token", Some(now_ms() + 10_000))
            .with_min_validity_seconds(15),
        &transport,
    );
    assert_eq!(header(&agent).await.as_deref(), Some("Bearer new-token"));
}

#[tokio::test]
async fn refresh_token_grant_updates_all_tokens() {
    let transport = Arc::new(MockTransport::always(token_reply(
        "refreshed-token",
        Some("new-refresh-token"),
    )));
    let agent = agent(base_params().with_refresh_token("i-am-refresh-token"), &transport);

    assert_eq!(header(&agent).await.as_deref(), Some("Bearer refreshed-token"));
    assert_eq!(
        form_body(&transport, 0),
        "grant_type=refresh_token&client_id=i-am-client&refresh_token=i-am-refresh-token"
    );

    let params = agent.params();
    assert_eq!(params.access_token.as_deref(), Some("refreshed-token"));
    assert!(params.expires_at.is_some());
    assert_eq!(params.refresh_token.as_deref(), Some("new-refresh-token"));
}

#[tokio::test]
async fn refresh_keeps_old_refresh_token_when_none_returned() {
    let transport = Arc::new(MockTransport::always(token_reply("refreshed-token", None)));
    let agent = agent(base_params().with_refresh_token("i-am-refresh-token"), &transport);

    header(&agent).await;
    assert_eq!(
        agent.params().refresh_token.as_deref(),
        Some("i-am-refresh-token")
    );
}

#[tokio::test]
async fn failed_refresh_falls_back_to_client_credentials() {
    let transport = Arc::new(MockTransport::sequence(
        vec![MockReply::json(400, json!({"error": "invalid_grant"}))],
        token_reply("from-secret", None),
    ));
    let agent = agent(
        base_params()
            .with_refresh_token("revoked")
            .with_client_secret("i-am-secret"),
        &transport,
    );

    assert_eq!(header(&agent).await.as_deref(), Some("Bearer from-secret"));
    assert_eq!(transport.call_count(), 2);
    assert!(form_body(&transport, 0).starts_with("grant_type=refresh_token"));
    assert!(form_body(&transport, 1).starts_with("grant_type=client_credentials"));
    assert_eq!(agent.params().refresh_token, None);

    // The revoked refresh token is not offered again.
    agent.invalidate();
    assert_eq!(header(&agent).await.as_deref(), Some("Bearer from-secret"));
    assert_eq!(transport.call_count(), 3);
    assert!(form_body(&transport, 2).starts_with("grant_type=client_credentials"));
}

#[tokio::test]
async fn empty_access_token_falls_through_to_client_credentials() {
    let transport = Arc::new(MockTransport::sequence(
        vec![token_reply("", None)],
        token_reply("from-secret", None),
    ));
    let agent = agent(
        base_params()
            .with_refresh_token("i-am-refresh-token")
            .with_client_secret("i-am-secret"),
        &transport,
    );

    assert_eq!(header(&agent).await.as_deref(), Some("Bearer from-secret"));
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn empty_access_token_yields_no_header() {
    let transport = Arc::new(MockTransport::always(token_reply("", None)));
    let agent = agent(base_params().with_client_secret("i-am-secret"), &transport);
    assert_eq!(header(&agent).await, None);
}

#[tokio::test]
async fn malformed_token_response_yields_no_header() {
    let transport = Arc::new(MockTransport::always(MockReply::json(
        200,
        json!({"token": "wrong-field"}),
    )));
    let agent = agent(
        base_params()
            .with_refresh_token("i-am-refresh-token")
            .with_access_token("stale", Some(now_ms() - 1)),
        &transport,
    );

    assert_eq!(header(&agent).await, None);
    let params = agent.params();
    assert_eq!(params.access_token, None);
    assert_eq!(params.expires_at, None);
    assert_eq!(params.refresh_token, None);
}

#[tokio::test]
async fn no_credentials_yields_no_header() {
    let transport = Arc::new(MockTransport::always(MockReply::status(500)));
    let agent = agent(base_params(), &transport);
    assert_eq!(header(&agent).await, None);
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn invalidate_clears_access_token_only() {
    let transport = Arc::new(MockTransport::always(MockReply::status(500)));
    let agent = agent(
        base_params()
            .with_client_secret("i-am-secret")
            .with_refresh_token("r")
            .with_access_token("a", None),
        &transport,
    );

    agent.invalidate();
    let params = agent.params();
    assert_eq!(params.access_token, None);
    assert_eq!(params.expires_at, None);
    assert_eq!(params.refresh_token.as_deref(), Some("r"));
    assert_eq!(params.client_secret.as_deref(), Some("i-am-secret"));
}

#[tokio::test]
async fn set_tokens_computes_expiry() {
    let transport = Arc::new(MockTransport::always(MockReply::status(500)));
    let agent = agent(base_params(), &transport);

    agent.set_tokens(OAuth2Tokens {
        access_token: "manual".to_owned(),
        access_expires_in: Some(60.0),
        refresh_token: Some("r2".to_owned()),
    });

    let params = agent.params();
    let expires_at = params.expires_at.unwrap();
    assert!(expires_at >= now_ms() + 59_000 && expires_at <= now_ms() + 60_000);
    assert_eq!(params.refresh_token.as_deref(), Some("r2"));
}

#[tokio::test]
async fn concurrent_callers_share_one_token_request() {
    let transport = Arc::new(MockTransport::always(token_reply("shared-token", None)));
    let agent = Arc::new(agent(
        base_params().with_client_secret("i-am-secret"),
        &transport,
    ));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let agent = agent.clone();
            tokio::spawn(async move { agent.access_token().await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().as_deref(), Some("shared-token"));
    }
    assert_eq!(transport.call_count(), 1);
}

/// Sends token endpoint calls and API calls to separate scripted mocks.
#[derive(Debug)]
struct SplitTransport {
    token: Arc<MockTransport>,
    api: Arc<MockTransport>,
}

#[async_trait]
impl Transport for SplitTransport {
    async fn fetch(&self, spec: &RequestSpec) -> Result<Response, TransportError> {
        if spec.url == TOKEN_URL {
            self.token.fetch(spec).await
        } else {
            self.api.fetch(spec).await
        }
    }
}

#[tokio::test]
async fn rejected_token_is_reacquired_by_the_retry_loop() {
    let token = Arc::new(MockTransport::always(token_reply("fresh", None)));
    let api = Arc::new(MockTransport::sequence(
        vec![MockReply::status(401)],
        MockReply::json(200, json!({"ok": true})),
    ));
    let transport: Arc<dyn Transport> = Arc::new(SplitTransport {
        token: token.clone(),
        api: api.clone(),
    });

    let agent = OAuth2Agent::new(
        base_params()
            .with_client_secret("i-am-secret")
            .with_access_token("stale", None),
    )
    .with_transport(transport.clone());
    let config = RequestConfig::default()
        .with_base_url("http://api.example.com")
        .with_retry_delay(Duration::ZERO, Duration::ZERO)
        .with_auth(agent);
    let client = RequestClient::new(config).with_shared_transport(transport);

    let body: Option<serde_json::Value> = client
        .get("/me", RequestOptions::new())
        .await
        .expect("second attempt must succeed");
    assert_eq!(body, Some(json!({"ok": true})));

    let authorizations: Vec<String> = api
        .calls()
        .into_iter()
        .map(|call| call.headers["authorization"].clone())
        .collect();
    assert_eq!(authorizations, vec!["Bearer stale", "Bearer fresh"]);
    assert_eq!(token.call_count(), 1);
}
