use request_agent::{BearerAuth, RequestClient, RequestConfig, RequestOptions};
use serde_json::Value;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let token = std::env::var("API_TOKEN")?;

    let config = RequestConfig::from_env()?
        .with_auth(BearerAuth::new(token))
        .with_header("accept", "application/json");
    let client = RequestClient::new(config);

    let items: Option<Value> = client
        .get("/items", RequestOptions::new().query("limit", 10))
        .await?;

    match items {
        Some(items) => println!("{items:#}"),
        None => println!("no content"),
    }

    Ok(())
}
