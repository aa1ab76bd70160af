use anyhow::Context;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const BANNER: &str = "choo shell. Commands: SET <key> <value>, GET <key>, DELETE <key>, INFO. \
                      Type `exit` to quit.";
const PROMPT: &str = "choo> ";

/// Read query lines from stdin until EOF or `exit`, send each to `server`, print the result.
pub async fn run(server: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/query", server.trim_end_matches('/'));

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    stdout
        .write_all(format!("{BANNER}\nconnected to {server}\n").as_bytes())
        .await?;
    loop {
        stdout.write_all(PROMPT.as_bytes()).await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await.context("read stdin")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("exit") {
            break;
        }

        let out = match send(&client, &url, line).await {
            Ok(body) => render_fields(&body).join("\n"),
            Err(err) => format!("error: {err:#}"),
        };
        stdout.write_all(format!("{out}\n").as_bytes()).await?;
    }
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

async fn send(client: &reqwest::Client, url: &str, line: &str) -> anyhow::Result<Value> {
    // Error statuses still carry a JSON body worth printing.
    client
        .post(url)
        .json(&json!({ "q": line }))
        .send()
        .await
        .with_context(|| format!("POST {url}"))?
        .json::<Value>()
        .await
        .context("decode response")
}

/// One `key: value` line per leaf, nested objects joined with `.`.
pub fn render_fields(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    push_fields(&mut out, None, value);
    out
}

fn push_fields(out: &mut Vec<String>, prefix: Option<&str>, value: &Value) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, value) in map {
                let path = match prefix {
                    Some(prefix) => format!("{prefix}.{key}"),
                    None => key.clone(),
                };
                push_fields(out, Some(&path), value);
            }
        }
        leaf => {
            let text = match leaf {
                Value::String(s) => s.clone(),
                Value::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", "),
                other => other.to_string(),
            };
            match prefix {
                Some(prefix) => out.push(format!("{prefix}: {text}")),
                None => out.push(text),
            }
        }
    }
}
