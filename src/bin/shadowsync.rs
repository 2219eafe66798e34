use clap::Parser;
use shadowsync::config::BackendType;
use shadowsync::{SyncConfig, SyncEngine};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shadowsync", about = "Run cache commands mirrored into SQL", version)]
struct Args {
  #[arg(short, long)]
  config: Option<String>,
  #[arg(long, env = "SHADOWSYNC_PG_URL")]
  pg_url: Option<String>,
  #[arg(long, env = "SHADOWSYNC_SQLITE_PATH")]
  sqlite: Option<String>,
  #[arg(long)]
  log_level: Option<String>,
  /// Command name, e.g. ZADD
  command: String,
  /// Command arguments
  args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Load config: explicit path > auto-detect > defaults
  let mut config = if let Some(path) = &args.config {
    SyncConfig::from_file(path)?
  } else {
    SyncConfig::find_and_load()?.unwrap_or_default()
  };

  if let Some(url) = args.pg_url {
    config.durable.postgres.url = url;
    config.durable.backend = BackendType::Postgres;
  }
  if let Some(path) = args.sqlite {
    config.durable.sqlite.path = path;
    config.durable.backend = BackendType::Sqlite;
  }
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .init();

  let engine = SyncEngine::from_config(&config).await?;
  let mut failures = engine.subscribe_failures();

  let outcome = engine.execute(&args.command, &args.args).await;
  engine.settle().await;

  let mut failed = false;
  while let Ok(failure) = failures.try_recv() {
    eprintln!("{}", serde_json::to_string(&failure)?);
    failed = true;
  }

  match outcome {
    Ok(reply) => println!("{}", reply),
    Err(err) => {
      eprintln!("(error) {}", err);
      std::process::exit(1);
    }
  }
  if failed {
    std::process::exit(2);
  }
  Ok(())
}
