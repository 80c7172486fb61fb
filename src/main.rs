pub mod models {
    pub mod printer;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod models;
}
pub mod profiles;
pub mod schema;
pub mod utils;
pub mod services {
    pub mod collect;
    pub mod fake_data;
    pub mod forecast;
    pub mod ledger;
    pub mod pass;
    pub mod reconcile;
    pub mod registry;
}

use crate::client::HttpConnector;
use crate::config::Config;
use crate::profiles::ProfileSet;
use crate::services::collect::CollectSettings;
use crate::services::forecast::ForecastSettings;
use crate::services::pass::{self, PassContext};
use crate::services::fake_data;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{error, info};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

fn load_profiles(cfg: &Config) -> Result<ProfileSet, String> {
    match cfg.profiles_file.as_deref() {
        Some(path) => ProfileSet::from_file(path).map_err(|e| format!("PROFILES_FILE {}: {}", path.display(), e)),
        None => Ok(ProfileSet::builtin()),
    }
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (pass_interval={}s, run_once={}, workers={}, page_timeout={}s, wait_timeout={}s, status_path={:?}, ema_span={}, max_forecast_days={}, zero_level_policy={:?}, forecast_output={})",
        cfg.pass_interval.as_secs(),
        cfg.run_once,
        cfg.collect_workers.get(),
        cfg.page_timeout.as_secs(),
        cfg.wait_timeout.as_secs(),
        cfg.status_path,
        cfg.ema_span,
        cfg.max_forecast_days,
        cfg.zero_level_policy,
        cfg.forecast_output
    );

    // 2) Extraction profiles
    let profiles = load_profiles(&cfg)?;
    info!("Extraction profiles: {}", profiles.names().join(", "));

    // 3) Connect DB
    let mut conn = PgConnection::establish(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 4) Apply pending database migrations
    apply_database_migrations(&mut conn)?;

    // 5) Optional demo history
    if cfg.fake_data {
        info!("FAKE_DATA enabled; seeding demo printers and history");
        fake_data::run(&mut conn)?;
    }

    // 6) Pass loop (steady cadence)
    let connector = HttpConnector::new(cfg.page_timeout);
    let collect = CollectSettings {
        workers: cfg.collect_workers,
        status_path: cfg.status_path.clone(),
        wait_timeout: cfg.wait_timeout,
        poll_interval: cfg.wait_poll,
    };
    let forecast = ForecastSettings {
        ema_span: cfg.ema_span,
        max_days: f64::from(cfg.max_forecast_days),
        zero_policy: cfg.zero_level_policy,
    };
    let ctx = PassContext {
        connector: &connector,
        profiles: &profiles,
        collect: &collect,
        forecast: &forecast,
        forecast_output: &cfg.forecast_output,
    };
    info!(
        "Starting pass loop: interval={}s, run_once={}",
        cfg.pass_interval.as_secs(),
        cfg.run_once
    );
    pass::run_loop(&mut conn, &ctx, cfg.pass_interval, cfg.run_once)
}

#[derive(Debug, Default, PartialEq)]
struct Cli {
    env_file: Option<PathBuf>,
    once: bool,
}

fn parse_args<I: IntoIterator<Item = OsString>>(args: I) -> Result<Cli, String> {
    let mut cli = Cli::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let Some(arg) = arg.to_str().map(str::to_string) else {
            return Err("argument contains invalid UTF-8".to_string());
        };
        let env_path = match arg.as_str() {
            "--once" => {
                cli.once = true;
                continue;
            }
            "--env-file" => args
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            "--" => break,
            other => match other.strip_prefix("--env-file=") {
                Some("") => return Err("`--env-file` requires a path argument".to_string()),
                Some(path) => PathBuf::from(path),
                None => return Err(format!("unrecognised argument: {}", other)),
            },
        };
        if cli.env_file.replace(env_path).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }
    Ok(cli)
}

fn load_env(cli: &Cli) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = cli.env_file.clone() {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(&path)?;
        return Ok(Some(LoadedEnvFile { path, explicit: true }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let path = cwd.join(".env");
    if !path.is_file() {
        return Ok(None);
    }
    load_env_file(&path)?;
    Ok(Some(LoadedEnvFile { path, explicit: false }))
}

fn load_env_file(path: &Path) -> Result<(), String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;

    for (index, line) in text.lines().enumerate() {
        let parsed = parse_env_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?;
        let Some((key, value)) = parsed else { continue };
        // the process environment wins over the file
        if std::env::var_os(&key).is_none() {
            // Updating process-level environment variables is unsafe on some targets.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// `KEY=value`, `export KEY="va\"lue" # note`, `KEY='raw'`; blank and `#` lines are skipped.
fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

    let (key, raw) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.contains(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    let raw = raw.trim();
    let value = match raw.chars().next() {
        Some(quote @ ('"' | '\'')) => unquote(&raw[1..], quote)?,
        _ => raw.split('#').next().unwrap_or_default().trim_end().to_string(),
    };
    Ok(Some((key.to_string(), value)))
}

/// Read up to the closing `quote`; escapes apply inside double quotes only.
fn unquote(input: &str, quote: char) -> Result<String, String> {
    let mut value = String::new();
    let mut chars = input.char_indices();

    while let Some((i, ch)) = chars.next() {
        if ch == quote {
            let rest = input[i + ch.len_utf8()..].trim();
            if rest.is_empty() || rest.starts_with('#') {
                return Ok(value);
            }
            return Err(format!("unexpected characters after closing {} quote", quote));
        }
        if ch == '\\' && quote == '"' {
            let Some((_, escaped)) = chars.next() else { break };
            value.push(match escaped {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
            continue;
        }
        value.push(ch);
    }
    Err(format!("unterminated {} quoted value", quote))
}

fn main() {
    let cli = match parse_args(std::env::args_os().skip(1)) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };
    let loaded_env = match load_env(&cli) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };
    if cli.once {
        // Single-threaded at this point.
        unsafe {
            std::env::set_var("RUN_ONCE", "1");
        }
    }

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "toner-watch {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
