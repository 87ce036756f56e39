use std::{path::PathBuf, time::Duration};

use rmcp::{
    ServiceExt,
    model::{CallToolRequestParams, CallToolResult},
    service::{RoleClient, RunningService},
    transport::{ConfigureCommandExt, TokioChildProcess},
};
use serde_json::{Value, json};

type Client = RunningService<RoleClient, ()>;

async fn call(
    client: &Client,
    name: &'static str,
    args: Value,
) -> Result<CallToolResult, Box<dyn std::error::Error>> {
    let result = client
        .peer()
        .call_tool({
            let mut params = CallToolRequestParams::new(name);
            params.arguments = args.as_object().cloned();
            params
        })
        .await?;
    Ok(result)
}

#[tokio::test]
async fn mcp_stdio_status_search_and_build()
-> Result<(), Box<dyn std::error::Error>> {
    let tempdir = tempfile::tempdir()?;
    let corpus = tempdir.path().join("memory.jsonl");
    std::fs::write(
        &corpus,
        "{\"title\": \"Trip\", \"content\": \"Book the train tickets to Lisbon before the prices go up in March.\"}\n",
    )?;

    let bin = memdex_bin()?;
    let data_dir = tempdir.path().join("data");
    let transport = TokioChildProcess::new(
        tokio::process::Command::new(bin).configure(|cmd| {
            cmd.arg("mcp")
                .env("MEMDEX_DATA_DIR", &data_dir)
                .env("MEMDEX_LOG", "warn")
                .env_remove("OPENAI_API_KEY");
        }),
    )?;

    let client = ().serve(transport).await?;

    let status = call(&client, "memdex_status", json!({})).await?;
    let structured = status.structured_content.expect("structured content");
    assert_eq!(structured["status"], "not_started");
    assert_eq!(structured["ready"], false);

    let search =
        call(&client, "memdex_search", json!({ "query": "Lisbon", "limit": 3 }))
            .await?;
    let structured = search.structured_content.expect("structured content");
    let results = structured
        .get("results")
        .and_then(|v| v.as_array())
        .expect("results array");
    assert!(results.is_empty());

    let build = call(
        &client,
        "memdex_build",
        json!({ "corpus": corpus.to_string_lossy() }),
    )
    .await?;
    assert_eq!(build.is_error, Some(false));

    // Without an API key the embedding build fails before any batch work.
    let mut phase = Value::Null;
    for _ in 0..100 {
        let status = call(&client, "memdex_status", json!({})).await?;
        let structured = status.structured_content.expect("structured content");
        phase = structured["status"].clone();
        if phase == "failed" {
            let error = structured["error"].as_str().unwrap_or_default();
            assert!(error.contains("OPENAI_API_KEY"));
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(phase, "failed");

    client.cancel().await?;
    Ok(())
}

fn memdex_bin() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(bin) = option_env!("CARGO_BIN_EXE_memdex") {
        return Ok(PathBuf::from(bin));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("memdex");

    if cfg!(windows) {
        path.set_extension("exe");
    }

    Ok(path)
}
