use callgate::{Client, ClientConfig, Value};
use clap::Parser;
use std::time::Duration;

#[derive(Parser)]
#[command(about = "Calls a callgate server")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 4848)]
    port: u16,

    /// Per-call deadline in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Method to call.
    #[arg(default_value = "echo")]
    method: String,

    /// JSON body.
    #[arg(default_value = "\"hi\"")]
    body: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let body: serde_json::Value = match serde_json::from_str(&args.body) {
        Ok(body) => body,
        Err(e) => {
            eprintln!("body is not JSON: {e}");
            std::process::exit(2);
        }
    };

    let config = ClientConfig {
        call_timeout: Some(Duration::from_millis(args.timeout_ms)),
        ..ClientConfig::default()
    };
    let client = match Client::connect_with((args.host.as_str(), args.port), config).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("connect failed: {e}");
            std::process::exit(1);
        }
    };

    match client.send(&args.method, Value::from(body)).await {
        Ok(result) => println!("{result}"),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
    client.close();
}
