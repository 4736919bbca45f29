use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "health-cli")]
#[command(about = "Management CLI for the dual-health engine", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "DUAL_HEALTH_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Engine status and in-flight checks
    Status,
    /// Breaker state and latest result of every server
    Servers,
    /// Details of one server
    Server { name: String },
    /// Metrics snapshot with cache, pool and admission stats
    Metrics,
    /// Queue checks through the batch scheduler
    Check {
        #[arg(required = true)]
        names: Vec<String>,
        #[arg(short, long, default_value_t = 0)]
        priority: u32,
    },
    /// Run one server's check immediately and print the result
    Run { name: String },
    /// Cancel a server's in-flight checks
    Cancel { name: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let request = match &cli.command {
        Commands::Status => client.get(format!("{base}/admin/status")),
        Commands::Servers => client.get(format!("{base}/admin/servers")),
        Commands::Server { name } => client.get(format!("{base}/admin/servers/{name}")),
        Commands::Metrics => client.get(format!("{base}/admin/metrics")),
        Commands::Check { names, priority } => client
            .post(format!("{base}/admin/checks"))
            .json(&json!({ "servers": names, "priority": priority })),
        Commands::Run { name } => client.post(format!("{base}/admin/servers/{name}/check")),
        Commands::Cancel { name } => client.delete(format!("{base}/admin/servers/{name}/check")),
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
