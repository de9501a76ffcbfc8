//! mailtun-server: the responder side of the tunnel.
//!
//! Usage: mailtun-server <command> [options]
//!
//! Commands:
//!   run       Start the tunnel server
//!   init      Write a commented default config file
//!   adduser   Add a principal to the config
//!   deluser   Remove a principal from the config
//!   users     List configured principals
//!   version   Show version

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mailtun::config::{Config, Principal, DEFAULT_CONFIG};
use mailtun::crypto::generate_secret;
use mailtun::tls;
use mailtun::tunnel::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "run" => run(&config_path(&args[2..])).await,
        "init" => init(&config_path(&args[2..])),
        "adduser" => adduser(&args[2..]),
        "deluser" => deluser(&args[2..]),
        "users" => users(&config_path(&args[2..])),
        "version" => {
            println!("mailtun-server {}", mailtun::VERSION);
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}\n");
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"mailtun-server {} - tunnel server

USAGE:
    mailtun-server <command> [options]

COMMANDS:
    run [-c FILE]                 Start the server (default config.toml)
    init [-c FILE]                Write a default configuration file
    adduser <name> [-c FILE]      Add a principal (secret auto-generated)
            [--secret S] [--whitelist CIDR[,CIDR...]] [--no-log]
    deluser <name> [-c FILE]      Remove a principal
    users [-c FILE]               List configured principals
    version                       Show version

The server needs a TLS certificate and key (server.cert_file /
server.key_file) and at least one [[server.users]] entry.
"#,
        mailtun::VERSION
    );
}

/// Extract `-c <path>` from the arguments, defaulting to config.toml.
fn config_path(args: &[String]) -> PathBuf {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-c" {
            if let Some(path) = iter.next() {
                return PathBuf::from(path);
            }
        }
    }
    PathBuf::from("config.toml")
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    config.validate_server()?;
    init_tracing(&config.server.log_level);

    let acceptor = tls::acceptor_from_pem(
        Path::new(&config.server.cert_file),
        Path::new(&config.server.key_file),
        &config.server.tls.min_version,
    )?;

    tracing::info!("mailtun server {} starting", mailtun::VERSION);
    let server = Server::new(Arc::new(config), acceptor);
    server.run().await?;
    Ok(())
}

fn init(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists, refusing to overwrite", path.display());
    }
    std::fs::write(path, DEFAULT_CONFIG)?;
    println!("Wrote {}", path.display());
    println!("Next: add a user with `mailtun-server adduser <name> -c {}`", path.display());
    Ok(())
}

fn adduser(args: &[String]) -> anyhow::Result<()> {
    let mut username = None;
    let mut path = PathBuf::from("config.toml");
    let mut secret = None;
    let mut whitelist = None;
    let mut logging = true;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" => {
                path = PathBuf::from(
                    iter.next().ok_or_else(|| anyhow::anyhow!("-c needs a value"))?,
                )
            }
            "--secret" => {
                secret = Some(
                    iter.next()
                        .ok_or_else(|| anyhow::anyhow!("--secret needs a value"))?
                        .clone(),
                )
            }
            "--whitelist" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--whitelist needs a value"))?;
                whitelist = Some(value.split(',').map(|s| s.trim().to_string()).collect());
            }
            "--no-log" => logging = false,
            other if username.is_none() && !other.starts_with('-') => {
                username = Some(other.to_string())
            }
            other => anyhow::bail!("unexpected argument: {other}"),
        }
    }

    let username = username.ok_or_else(|| anyhow::anyhow!("adduser needs a <name>"))?;

    let mut config = if path.exists() {
        Config::load(&path)?
    } else {
        Config::default()
    };

    if config.find_user(&username).is_some() {
        anyhow::bail!("user {username:?} already exists");
    }

    let secret = secret.unwrap_or_else(generate_secret);
    config.server.users.push(Principal {
        username: username.clone(),
        secret: secret.clone(),
        whitelist: whitelist.unwrap_or_else(|| vec!["0.0.0.0/0".to_string()]),
        logging,
    });

    std::fs::write(&path, toml::to_string_pretty(&config)?)?;

    println!("Added user {username:?} to {}", path.display());
    println!();
    println!("Client-side settings:");
    println!("  [client]");
    println!("  username = {username:?}");
    println!("  secret = {secret:?}");
    Ok(())
}

fn deluser(args: &[String]) -> anyhow::Result<()> {
    let mut username = None;
    let mut path = PathBuf::from("config.toml");

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" => {
                path = PathBuf::from(
                    iter.next().ok_or_else(|| anyhow::anyhow!("-c needs a value"))?,
                )
            }
            other if username.is_none() && !other.starts_with('-') => {
                username = Some(other.to_string())
            }
            other => anyhow::bail!("unexpected argument: {other}"),
        }
    }

    let username = username.ok_or_else(|| anyhow::anyhow!("deluser needs a <name>"))?;

    let mut config = Config::load(&path)?;
    let before = config.server.users.len();
    config.server.users.retain(|u| u.username != username);
    if config.server.users.len() == before {
        anyhow::bail!("user {username:?} not found");
    }

    std::fs::write(&path, toml::to_string_pretty(&config)?)?;
    println!("Removed user {username:?} from {}", path.display());
    Ok(())
}

fn users(path: &Path) -> anyhow::Result<()> {
    let config = Config::load(path)?;

    if config.server.users.is_empty() {
        println!("No users configured.");
        println!("Use `mailtun-server adduser <name>` to add users.");
        return Ok(());
    }

    println!("Users ({}):", config.server.users.len());
    println!("{}", "-".repeat(60));
    for user in &config.server.users {
        let mut extras = String::new();
        let default_whitelist =
            user.whitelist.len() == 1 && user.whitelist[0] == "0.0.0.0/0";
        if !default_whitelist {
            extras.push_str(&format!(" [{} ranges]", user.whitelist.len()));
        }
        if !user.logging {
            extras.push_str(" [no-log]");
        }
        println!("  {}{extras}", user.username);
    }
    Ok(())
}
