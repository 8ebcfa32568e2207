use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use offline_http::{
  default_transport, install_default, CachedResponse, Config, OfflineTransport, SqliteStorage,
  Transport,
};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Method, Request};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "offline-http")]
#[command(about = "Fetch URLs through a persistent offline cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-http/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Directory holding the cache database
  #[arg(long, global = true)]
  store_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Perform a request, recording the response for offline use
  Fetch {
    #[command(flatten)]
    request: RequestArgs,

    /// Answer from the cache without contacting the network when possible
    #[arg(long)]
    prefer_cache: bool,

    /// Only cache responses with this status code
    #[arg(long)]
    cache_status: Option<u16>,

    /// Print the status line and headers before the body
    #[arg(short, long)]
    include: bool,
  },
  /// Print the cached response for a request without using the network
  Show {
    #[command(flatten)]
    request: RequestArgs,
  },
  /// List cached responses
  List {
    /// Print entries as JSON
    #[arg(long)]
    json: bool,
  },
}

#[derive(clap::Args, Debug)]
struct RequestArgs {
  url: Url,

  /// HTTP method
  #[arg(short = 'X', long, default_value = "GET")]
  method: Method,

  /// Request body
  #[arg(short, long)]
  data: Option<String>,

  /// Extra request header, as 'Name: value'
  #[arg(short = 'H', long = "header")]
  headers: Vec<String>,
}

impl RequestArgs {
  fn into_request(self) -> Result<Request> {
    let mut request = Request::new(self.method, self.url);

    for header in &self.headers {
      let (name, value) = header
        .split_once(':')
        .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
      request.headers_mut().append(
        HeaderName::from_bytes(name.trim().as_bytes())?,
        HeaderValue::from_str(value.trim())?,
      );
    }

    if let Some(data) = self.data {
      *request.body_mut() = Some(data.into());
    }

    Ok(request)
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing();

  let config = Config::load(args.config.as_deref())?;

  // Override store directory if specified on command line
  let config = if let Some(store_dir) = args.store_dir {
    Config {
      store_dir: Some(store_dir),
      ..config
    }
  } else {
    config
  };

  match args.command {
    Command::Fetch {
      request,
      prefer_cache,
      cache_status,
      include,
    } => {
      let config = Config {
        prefer_cache: config.prefer_cache || prefer_cache,
        cache_status: cache_status.or(config.cache_status),
        ..config
      };
      fetch(&config, request, include).await
    }
    Command::Show { request } => show(&config, request).await,
    Command::List { json } => list(&config, json),
  }
}

/// Log to stderr, filtered by RUST_LOG (default: warn).
fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
  let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .with_writer(writer)
    .init();
  guard
}

async fn fetch(config: &Config, request: RequestArgs, include: bool) -> Result<()> {
  let mut client = reqwest::Client::builder();
  if let Some(timeout) = config.timeout() {
    client = client.timeout(timeout);
  }

  let transport = OfflineTransport::open(client.build()?, &config.store_dir(), config.options()?)?;
  install_default(transport)?;
  let transport = default_transport().ok_or_else(|| eyre!("No default transport installed"))?;

  let response = transport
    .execute(request.into_request()?)
    .await
    .map_err(|e| eyre!(e))?;

  let cached = CachedResponse::from_response(response).await?;
  print_response(&cached, include)
}

async fn show(config: &Config, request: RequestArgs) -> Result<()> {
  let transport = OfflineTransport::open(
    reqwest::Client::new(),
    &config.store_dir(),
    config.options()?,
  )?;

  let mut request = request.into_request()?;
  let cached = transport
    .lookup(&mut request)
    .await?
    .ok_or_else(|| eyre!("No cached response for {} {}", request.method(), request.url()))?;

  print_response(&cached, true)
}

fn list(config: &Config, json: bool) -> Result<()> {
  let storage = SqliteStorage::open(&config.store_dir())?;
  let entries = storage.entries()?;

  if json {
    println!("{}", serde_json::to_string_pretty(&entries)?);
    return Ok(());
  }

  for entry in entries {
    println!(
      "{}  {:>10}  {}",
      entry.stored_at.format("%Y-%m-%d %H:%M:%S"),
      entry.size,
      entry.description
    );
  }

  Ok(())
}

fn print_response(response: &CachedResponse, include: bool) -> Result<()> {
  let mut stdout = std::io::stdout().lock();

  if include {
    writeln!(stdout, "{:?} {}", response.version(), response.status())?;
    for (name, value) in response.headers() {
      write!(stdout, "{}: ", name)?;
      stdout.write_all(value.as_bytes())?;
      writeln!(stdout)?;
    }
    writeln!(stdout)?;
  }

  stdout.write_all(response.body())?;
  stdout.flush()?;
  Ok(())
}
