use openapi_client_core::{ApiClient, ApiError};
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads OPENAPI_BASE_URL and OPENAPI_API_KEY (env, ./.env or ~/.netrc).
    let client = ApiClient::from_env("OPENAPI")?;
    let collection = std::env::var("OPENAPI_COLLECTION").unwrap_or_else(|_| "items".to_owned());

    let all: Value = client.get_json(&collection).await?;
    println!("{all:#}");

    let created: Value = client
        .post_json(&collection, &json!({"name": "Kit"}))
        .await?;
    println!("created: {created}");

    match client.get_json::<Value>(&format!("{collection}/does-not-exist")).await {
        Ok(value) => println!("unexpected payload: {value}"),
        Err(ApiError::NotFound { message, .. }) => println!("not found: {message}"),
        Err(err) => return Err(err.into()),
    }

    Ok(())
}
