use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use claude_usage_lib::accounts::{account_from_secret, AccountRow};
use claude_usage_lib::usage::{format_reset, UsageClient, UsageSnapshot};
use claude_usage_lib::{init_logging, Account, AccountRegistry, AppConfig};
use serde::Serialize;

const SECRET_ENV: &str = "CLAUDE_SESSION_KEY";
const WATCH_TICK: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug)]
struct CliArgs {
    command: String,
    positionals: Vec<String>,
    format: OutputFormat,
    pretty: bool,
    secret: Option<String>,
    alias: Option<String>,
    primary: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryPayload<'a> {
    menu_bar: &'a str,
    accounts: &'a [AccountRow],
}

#[tokio::main]
async fn main() {
    let args = parse_args(std::env::args().skip(1).collect());
    if args.command == "--help" || args.command == "-h" {
        print_help();
        return;
    }
    if args.command == "--version" || args.command == "-V" {
        println!("claude-usage {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    init_logging();

    if let Err(err) = run(args).await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(args: CliArgs) -> Result<()> {
    let config = AppConfig::from_env().context("Invalid configuration")?;
    let registry = AccountRegistry::from_config(&config);
    registry.restore().await;

    match args.command.as_str() {
        "list" => run_list(&registry, &args).await,
        "add" => run_add(&registry, &config, &args).await,
        "remove" => run_remove(&registry, &args).await,
        "rename" => run_rename(&registry, &args).await,
        "update-secret" => run_update_secret(&registry, &args).await,
        "watch" => run_watch(&registry, &args).await,
        "bridge" => run_bridge(&registry, &args).await,
        "reset" => {
            registry.clear().await;
            println!("Removed all stored accounts");
            Ok(())
        }
        other => bail!("Unknown command: {other}. Use --help for usage."),
    }
}

fn parse_args(mut argv: Vec<String>) -> CliArgs {
    let mut format = OutputFormat::Text;
    let mut pretty = false;
    let mut command = String::new();
    let mut positionals = Vec::new();
    let mut secret = None;
    let mut alias = None;
    let mut primary = None;

    if let Some(first) = argv.first() {
        if !first.starts_with('-') {
            command = argv.remove(0);
        }
    }

    if command.is_empty() {
        command = "list".to_string();
    }

    let mut iter = argv.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--format" => {
                if let Some(value) = iter.next() {
                    if value == "json" {
                        format = OutputFormat::Json;
                    } else if value == "text" {
                        format = OutputFormat::Text;
                    }
                }
            }
            "--json" => format = OutputFormat::Json,
            "--pretty" => pretty = true,
            "--secret" => secret = iter.next(),
            "--alias" => alias = iter.next(),
            "--primary" => primary = iter.next(),
            "--help" | "-h" | "--version" | "-V" => {
                command = arg;
                break;
            }
            _ if arg.starts_with("--") => {}
            _ => positionals.push(arg),
        }
    }

    CliArgs {
        command,
        positionals,
        format,
        pretty,
        secret,
        alias,
        primary,
    }
}

fn secret_arg(args: &CliArgs) -> Result<String> {
    args.secret
        .clone()
        .or_else(|| std::env::var(SECRET_ENV).ok())
        .map(|secret| secret.trim().to_string())
        .filter(|secret| !secret.is_empty())
        .ok_or_else(|| anyhow!("Missing session key: pass --secret <key> or set {SECRET_ENV}"))
}

async fn account_arg(registry: &AccountRegistry, args: &CliArgs) -> Result<Account> {
    let query = args
        .positionals
        .first()
        .ok_or_else(|| anyhow!("Missing <account> argument"))?;
    resolve(registry, query).await
}

async fn resolve(registry: &AccountRegistry, query: &str) -> Result<Account> {
    registry
        .find(query)
        .await
        .ok_or_else(|| anyhow!("No account matches '{query}'. Run `claude-usage list` to see accounts."))
}

async fn run_list(registry: &AccountRegistry, args: &CliArgs) -> Result<()> {
    registry.refresh_all().await;
    print_summary(registry, args).await
}

async fn run_add(registry: &AccountRegistry, config: &AppConfig, args: &CliArgs) -> Result<()> {
    let secret = secret_arg(args)?;
    let client = UsageClient::new(config.api_base_url.clone());
    let account = account_from_secret(&client, &secret, args.alias.clone())
        .await
        .context("Could not validate session key")?;

    let name = account.display_name().to_string();
    let organization = account.organization_name.clone();
    registry.add(account).await?;
    registry.stop_polling();

    println!("Added {name} ({organization})");
    Ok(())
}

async fn run_remove(registry: &AccountRegistry, args: &CliArgs) -> Result<()> {
    let account = account_arg(registry, args).await?;
    let removed = registry.remove(account.id).await?;
    println!("Removed {}", removed.display_name());
    Ok(())
}

async fn run_rename(registry: &AccountRegistry, args: &CliArgs) -> Result<()> {
    let account = account_arg(registry, args).await?;
    let alias = args.positionals.get(1).cloned().or_else(|| args.alias.clone());
    registry.rename(account.id, alias).await?;

    let renamed = registry
        .account(account.id)
        .await
        .ok_or_else(|| anyhow!("Account disappeared while renaming"))?;
    println!("{} is now shown as {}", renamed.organization_name, renamed.display_name());
    Ok(())
}

async fn run_update_secret(registry: &AccountRegistry, args: &CliArgs) -> Result<()> {
    let account = account_arg(registry, args).await?;
    let secret = secret_arg(args)?;
    let refresh = registry.update_secret(account.id, &secret).await?;
    refresh.await.context("Usage refresh did not finish")?;

    match registry.error(account.id).await {
        Some(error) => bail!("Session key saved, but fetching usage failed: {}", error.message),
        None => {
            println!("Updated session key for {}", account.display_name());
            Ok(())
        }
    }
}

async fn run_bridge(registry: &AccountRegistry, args: &CliArgs) -> Result<()> {
    let account = account_arg(registry, args).await?;
    registry
        .switch_credential_bridge(account.id)
        .await
        .with_context(|| format!("Could not bridge {} into Claude Code", account.display_name()))?;
    println!("Claude Code now uses {}", account.display_name());
    Ok(())
}

async fn run_watch(registry: &AccountRegistry, args: &CliArgs) -> Result<()> {
    if registry.accounts().await.is_empty() {
        bail!("No accounts yet. Add one with `claude-usage add --secret <key>`.");
    }
    if let Some(query) = &args.primary {
        let account = resolve(registry, query).await?;
        registry.set_primary(account.id).await?;
    }

    registry.start_polling();
    let mut last_printed = None;
    let mut ticker = tokio::time::interval(WATCH_TICK);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if registry.is_loading() {
                    continue;
                }
                let rows = registry.rows().await;
                if rows.iter().all(|row| row.usage.is_none() && row.error.is_none()) {
                    continue;
                }
                let rendered = serde_json::to_string(&rows)?;
                if last_printed.as_ref() == Some(&rendered) {
                    continue;
                }
                print_summary_rows(registry, &rows, args).await?;
                last_printed = Some(rendered);
            }
        }
    }

    registry.stop_polling();
    Ok(())
}

async fn print_summary(registry: &AccountRegistry, args: &CliArgs) -> Result<()> {
    let rows = registry.rows().await;
    print_summary_rows(registry, &rows, args).await
}

async fn print_summary_rows(registry: &AccountRegistry, rows: &[AccountRow], args: &CliArgs) -> Result<()> {
    let menu_bar = registry.menu_bar_text().await;

    if args.format == OutputFormat::Json {
        return print_json(
            &SummaryPayload {
                menu_bar: &menu_bar,
                accounts: rows,
            },
            args.pretty,
        );
    }

    if rows.is_empty() {
        println!("No accounts yet. Add one with `claude-usage add --secret <key>`.");
        return Ok(());
    }

    println!("{}  {}", Utc::now().format("%H:%M:%S"), menu_bar);
    for row in rows {
        println!("{}", format_row(row));
    }
    Ok(())
}

fn format_row(row: &AccountRow) -> String {
    let marker = if row.is_primary { "*" } else { " " };
    let bridged = if row.is_bridged { " [Claude Code]" } else { "" };
    let mut line = format!("{marker} {} ({}){bridged}", row.name, row.organization);

    if let Some(usage) = &row.usage {
        line.push_str(&format!("  {}", format_usage(usage)));
    }
    if let Some(error) = &row.error {
        line.push_str(&format!("  error: {}", error.message));
        if error.session_expired {
            line.push_str(&format!(
                " (run `claude-usage update-secret {} --secret <key>`)",
                row.id
            ));
        }
    }
    line
}

fn format_usage(usage: &UsageSnapshot) -> String {
    let now = Utc::now();
    usage
        .buckets()
        .into_iter()
        .map(|(kind, bucket)| {
            match format_reset(bucket.resets_at_time(), now) {
                Some(reset) => format!("{} {}% (resets {})", kind.label(), bucket.percentage(), reset),
                None => format!("{} {}%", kind.label(), bucket.percentage()),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_json<T: Serialize>(payload: &T, pretty: bool) -> Result<()> {
    let output = if pretty {
        serde_json::to_string_pretty(payload)
    } else {
        serde_json::to_string(payload)
    }?;
    println!("{output}");
    Ok(())
}

fn print_help() {
    println!(
        "claude-usage {}\n\nUsage:\n  claude-usage [list]\n  claude-usage add --secret <key> [--alias <name>]\n  claude-usage remove <account>\n  claude-usage rename <account> [<alias>]\n  claude-usage update-secret <account> --secret <key>\n  claude-usage watch [--primary <account>]\n  claude-usage bridge <account>\n  claude-usage reset\n\nCommands:\n  list           Refresh every account once and print usage\n  add            Track the account behind a claude.ai session key\n  remove         Stop tracking an account\n  rename         Set or clear an account's alias\n  update-secret  Replace an account's session key\n  watch          Poll until Ctrl-C, printing changes\n  bridge         Sign Claude Code in as an account\n  reset          Delete every stored account\n\n<account> is an id, an id prefix, or a display name.\n--secret falls back to ${}.\n\nFlags:\n  --format <text|json>  Output format\n  --json                Shortcut for --format json\n  --pretty              Pretty-print JSON output\n  -h, --help            Show help\n  -V, --version         Show version",
        env!("CARGO_PKG_VERSION"),
        SECRET_ENV
    );
}
