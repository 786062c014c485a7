use callgate::{invoke, Method, MethodError, Server, ServerConfig, Value};
use clap::Parser;
use std::time::Duration;

#[derive(Parser)]
#[command(about = "Serves a few demo methods")]
struct Args {
    #[arg(long, default_value_t = 4848)]
    port: u16,

    /// Worker pool size; defaults to the number of CPUs.
    #[arg(long)]
    workers: Option<usize>,
}

struct Echo;

impl Method for Echo {
    invoke! {
        async fn invoke(&self, _channel, _request, body: Value) -> Value {
            Ok(body)
        }
    }
}

struct Fail;

impl Method for Fail {
    invoke! {
        async fn invoke(&self, _channel, _request, _body: Value) -> Value {
            Err(MethodError::new("boom"))
        }
    }
}

struct Sleep;

impl Method for Sleep {
    invoke! {
        async fn invoke(&self, _channel, _request, millis: i64) -> i64 {
            tokio::time::sleep(Duration::from_millis(millis.max(0) as u64)).await;
            Ok(millis)
        }
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callgate=debug".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::default();
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    let mut server = Server::with_config(config);
    server.register("echo", Echo).expect("unique name");
    server.register("fail", Fail).expect("unique name");
    server.register("sleep", Sleep).expect("unique name");
    server.serve_tcp(args.port).await
}
