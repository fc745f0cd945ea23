// CLI tool for applying or reverting the thread history schema.
// Run with: cargo run --bin threadline-migrate -- --help

use anyhow::{bail, Context, Result};
use std::env;
use threadline_storage::Database;

#[derive(Debug, PartialEq)]
enum Direction {
    Up,
    Down { target: i64 },
}

#[derive(Debug)]
struct Args {
    dsn: Option<String>,
    direction: Direction,
}

impl Args {
    fn parse() -> Result<Self> {
        let args: Vec<String> = env::args().skip(1).collect();
        match Self::parse_from(&args)? {
            Some(args) => Ok(args),
            None => {
                print_help();
                std::process::exit(0);
            }
        }
    }

    /// Parse arguments; None means help was requested
    fn parse_from(args: &[String]) -> Result<Option<Self>> {
        let mut dsn = None;
        let mut command = None;
        let mut target = None;
        let mut i = 0;

        while i < args.len() {
            match args[i].as_str() {
                "--dsn" | "-d" => {
                    i += 1;
                    dsn = Some(args.get(i).context("--dsn requires a value")?.to_string());
                }
                "--target" | "-t" => {
                    i += 1;
                    target = Some(
                        args.get(i)
                            .context("--target requires a value")?
                            .parse::<i64>()
                            .context("Invalid target version")?,
                    );
                }
                "--help" | "-h" => return Ok(None),
                "up" | "down" if command.is_none() => command = Some(args[i].clone()),
                arg => bail!("Unknown argument: {}", arg),
            }
            i += 1;
        }

        let direction = match command.as_deref() {
            Some("down") => Direction::Down {
                target: target.unwrap_or(0),
            },
            _ if target.is_some() => bail!("--target only applies to down"),
            _ => Direction::Up,
        };

        Ok(Some(Self { dsn, direction }))
    }
}

fn print_help() {
    eprintln!(
        r#"
threadline-migrate - Apply or revert the thread history schema

USAGE:
    threadline-migrate [OPTIONS] [up|down]

COMMANDS:
    up                      Apply all pending migrations (default)
    down                    Revert migrations newer than the target version

OPTIONS:
    -d, --dsn <DSN>         History database (default: THREADS_DSN)
    -t, --target <VERSION>  Version to revert to with down (default: 0, everything)
    -h, --help              Show this help message

EXAMPLES:
    threadline-migrate --dsn sqlite://threads.db
    threadline-migrate --dsn postgres://localhost/threads down
"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "threadline_migrate=info,threadline_storage=info".into()),
        )
        .init();

    let args = match Args::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{:#}", e);
            print_help();
            std::process::exit(1);
        }
    };

    // Load environment
    if let Ok(path) = dotenvy::dotenv() {
        tracing::info!("Loaded .env from {:?}", path);
    }

    let dsn = match args.dsn {
        Some(dsn) => dsn,
        None => env::var("THREADS_DSN").context("Neither --dsn nor THREADS_DSN is set")?,
    };

    let db = Database::connect(&dsn)
        .await
        .context("Failed to connect to database")?;
    tracing::info!(backend = ?db.backend(), "Connected to database");

    match args.direction {
        Direction::Up => {
            db.migrate().await.context("Failed to apply migrations")?;
            tracing::info!("Migrations applied");
        }
        Direction::Down { target } => {
            db.revert(target)
                .await
                .context("Failed to revert migrations")?;
            tracing::info!(target, "Migrations reverted");
        }
    }

    db.close().await;
    Ok(())
}
