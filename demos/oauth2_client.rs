use std::sync::Arc;

use request_agent::{
    AuthAgent, OAuth2Agent, OAuth2Params, RequestClient, RequestConfig, RequestOptions,
};
use serde_json::Value;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let client_id = std::env::var("OAUTH2_CLIENT_ID")?;
    let client_secret = std::env::var("OAUTH2_CLIENT_SECRET")?;
    let token_url = std::env::var("OAUTH2_TOKEN_URL")?;

    let agent = Arc::new(OAuth2Agent::new(
        OAuth2Params::new(client_id, token_url).with_client_secret(client_secret),
    ));
    let config = RequestConfig::from_env()?.with_shared_auth(agent.clone() as Arc<dyn AuthAgent>);
    let client = RequestClient::new(config);

    let me: Option<Value> = client.get("/me", RequestOptions::new()).await?;
    println!("{me:?}");

    // Persist the refreshed state so the next run can skip the token endpoint.
    println!("{}", serde_json::to_string_pretty(&agent.params())?);

    Ok(())
}
