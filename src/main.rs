use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Method;
use serde_json::{json, Map, Value};

use brightspace_client::config::{Config, Settings};
use brightspace_client::http_client::ApiRequest;
use brightspace_client::paginator::PageOptions;
use brightspace_client::resources::ListParams;
use brightspace_client::{BrightspaceClient, BrightspaceError};

/// Direct CLI over the Brightspace client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the authenticated user
    Whoami,

    /// List courses with optional paging
    ListCourses {
        #[arg(long, default_value = "10")]
        page_size: u32,
        #[arg(long)]
        bookmark: Option<String>,
    },

    /// Create a course announcement
    CreateAnnouncement {
        org_unit_id: u64,
        title: String,
        html: String,
    },

    /// Generic API call: method + path + optional JSON strings
    ApiCall {
        method: String,
        path: String,
        /// JSON object of query parameters
        #[arg(long)]
        params: Option<String>,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
        /// JSON object of extra headers
        #[arg(long)]
        headers: Option<String>,
    },

    /// Follow bookmarks on a full API path and print every item
    Paginate {
        path: String,
        #[arg(long, default_value = "100")]
        page_size: u32,
        #[arg(long, default_value = "10")]
        max_pages: u32,
    },

    /// whoami plus the first five courses
    Selftest,
}

/// Parse a JSON object into string pairs, stringifying non-string values
fn json_pairs(raw: Option<&str>, what: &str) -> Result<Vec<(String, String)>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let map: Map<String, Value> =
        serde_json::from_str(raw).with_context(|| format!("--{} must be a JSON object", what))?;
    Ok(map
        .into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}

fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

fn error_json(e: &BrightspaceError) -> Value {
    json!({
        "error": e.to_string(),
        "status": e.status(),
        "data": e.body(),
    })
}

async fn run(client: &BrightspaceClient, command: Command) -> Result<i32> {
    match command {
        Command::Whoami => {
            print_json(&client.whoami().await?);
        }
        Command::ListCourses {
            page_size,
            bookmark,
        } => {
            let list = ListParams {
                page_size: Some(page_size),
                bookmark,
            };
            print_json(&client.list_courses(&list).await?);
        }
        Command::CreateAnnouncement {
            org_unit_id,
            title,
            html,
        } => {
            print_json(&client.create_announcement(org_unit_id, &title, &html).await?);
        }
        Command::ApiCall {
            method,
            path,
            params,
            body,
            headers,
        } => {
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("invalid HTTP method: {}", method))?;
            let mut req = ApiRequest::new(method, path);
            req.params = json_pairs(params.as_deref(), "params")?;
            req.headers = json_pairs(headers.as_deref(), "headers")?;
            if let Some(raw) = body {
                req = req.json(serde_json::from_str(&raw).context("--body must be valid JSON")?);
            }

            match client.request(&req).await {
                Ok(outcome) => print_json(&json!({
                    "status": outcome.status,
                    "data": outcome.body,
                    "headers": outcome.headers,
                })),
                Err(e) => {
                    print_json(&error_json(&e));
                    return Ok(1);
                }
            }
        }
        Command::Paginate {
            path,
            page_size,
            max_pages,
        } => {
            let result = client
                .paginate_all(
                    ApiRequest::get(path),
                    PageOptions {
                        page_size,
                        max_pages,
                    },
                )
                .await?;
            print_json(&json!({
                "items": result.items,
                "bookmarks": result.bookmarks,
                "next_bookmark": result.next_bookmark,
            }));
        }
        Command::Selftest => {
            let outcome = async {
                let who = client.whoami().await?;
                let courses = client.list_courses(&ListParams::page(5)).await?;
                Ok::<_, BrightspaceError>((who, courses))
            }
            .await;

            match outcome {
                Ok((who, courses)) => {
                    println!("whoami:");
                    print_json(&who);
                    println!("\nlist_courses (first 5):");
                    print_json(&courses);
                }
                Err(e) => {
                    tracing::error!("Self-test failed: {}", e);
                    print_json(&error_json(&e));
                    return Ok(1);
                }
            }
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::from_settings(cli.settings)?;

    // Logs go to stderr; stdout carries JSON only
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!(
        base_url = %config.credentials.base_url,
        lp = %config.versions.lp.default_version(),
        le = %config.versions.le.default_version(),
        "Configuration loaded"
    );

    let client = BrightspaceClient::from_config(&config).context("Failed to create client")?;
    let code = run(&client, cli.command).await?;

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
