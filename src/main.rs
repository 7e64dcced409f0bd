use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use crmdash::auth::LogRedirect;
use crmdash::cache::{CacheOptions, Params};
use crmdash::{ApiClient, ApiRequest, Config};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "crmdash")]
#[command(about = "Command-line client for the CRM dashboard API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/crmdash/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Sign in (password is read from CRMDASH_PASSWORD)
  Login {
    #[arg(short, long)]
    email: String,
  },
  /// Forget the stored session
  Logout,
  /// Read a resource
  Get {
    path: String,
    /// Query parameter as key=value; values are parsed as JSON when possible
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,
    /// Ignore any cached response
    #[arg(long)]
    force: bool,
  },
  /// Create a resource
  Post {
    path: String,
    #[arg(short, long)]
    data: String,
  },
  /// Replace a resource
  Put {
    path: String,
    #[arg(short, long)]
    data: String,
  },
  /// Update part of a resource
  Patch {
    path: String,
    #[arg(short, long)]
    data: String,
  },
  /// Delete a resource
  Delete { path: String },
}

fn parse_param(s: &str) -> Result<(String, Value), String> {
  let (key, value) = s
    .split_once('=')
    .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
  if key.is_empty() {
    return Err(format!("missing parameter name in '{}'", s));
  }
  let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
  Ok((key.to_string(), value))
}

fn parse_body(data: &str) -> Result<Value> {
  serde_json::from_str(data).map_err(|e| eyre!("--data is not valid JSON: {}", e))
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crmdash=info"));

  match log_file {
    Some(path) => {
      let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));

      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
      Ok(None)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let at_login = matches!(args.command, Command::Login { .. });
  let boundary = Arc::new(LogRedirect::new(config.auth.login_route.clone()).at_login(at_login));
  let client = ApiClient::open(&config, boundary)?;

  let output = match args.command {
    Command::Login { email } => {
      let password = Config::get_password()?;
      client.login(&email, &password).await?;
      println!("Signed in as {}", email);
      return Ok(());
    }
    Command::Logout => {
      client.logout();
      println!("Signed out");
      return Ok(());
    }
    Command::Get {
      path,
      params,
      force,
    } => {
      let mut request = ApiRequest::get(path);
      if !params.is_empty() {
        request = request.query(params.into_iter().collect::<Params>());
      }
      let options = CacheOptions {
        force_refresh: force,
        ..CacheOptions::default()
      };
      client.fetch(request, options).await?
    }
    Command::Post { path, data } => client.post(&path, parse_body(&data)?).await?,
    Command::Put { path, data } => client.put(&path, parse_body(&data)?).await?,
    Command::Patch { path, data } => client.patch(&path, parse_body(&data)?).await?,
    Command::Delete { path } => client.delete(&path).await?,
  };

  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_param_json_value() {
    assert_eq!(parse_param("page=2"), Ok(("page".to_string(), json!(2))));
    assert_eq!(
      parse_param("filters={\"city\":\"Lyon\"}"),
      Ok(("filters".to_string(), json!({"city": "Lyon"})))
    );
  }

  #[test]
  fn test_parse_param_plain_string() {
    assert_eq!(parse_param("search=acme"), Ok(("search".to_string(), json!("acme"))));
    assert_eq!(parse_param("q=a=b"), Ok(("q".to_string(), json!("a=b"))));
  }

  #[test]
  fn test_parse_param_errors() {
    assert!(parse_param("page").is_err());
    assert!(parse_param("=2").is_err());
  }

  #[test]
  fn test_cli_parses_get() {
    let args = Args::try_parse_from(["crmdash", "get", "/clients", "-p", "page=1", "--force"]).unwrap();
    match args.command {
      Command::Get { path, params, force } => {
        assert_eq!(path, "/clients");
        assert_eq!(params, vec![("page".to_string(), json!(1))]);
        assert!(force);
      }
      other => panic!("unexpected command {:?}", other),
    }
  }
}
