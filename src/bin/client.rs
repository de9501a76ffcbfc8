//! mailtun-client: the initiator side of the tunnel.
//!
//! Usage: mailtun-client <command> [options]
//!
//! Commands:
//!   run           Connect and start the configured ingress listeners
//!   ping          Measure round-trip latency to the server
//!   check-config  Validate the configuration file
//!   version       Show version

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mailtun::config::Config;
use mailtun::supervisor::{self, Supervisor};
use mailtun::tls;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "run" => run(&config_path(&args[2..])).await,
        "ping" => ping(&config_path(&args[2..]), probe_count(&args[2..])).await,
        "check-config" => check_config(&config_path(&args[2..])),
        "version" => {
            println!("mailtun-client {}", mailtun::VERSION);
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
        r#"mailtun-client {} - tunnel client

USAGE:
    mailtun-client <command> [options]

COMMANDS:
    run [-c FILE]            Connect and start SOCKS/forward listeners
    ping [-c FILE] [-n N]    Measure tunnel round-trip latency (default 4 probes)
    check-config [-c FILE]   Validate the configuration file
    version                  Show version

The default config file is config.toml.
"#,
        mailtun::VERSION
    );
}

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

fn probe_count(args: &[String]) -> u32 {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-n" {
            if let Some(value) = iter.next() {
                if let Ok(n) = value.parse() {
                    return n;
                }
            }
        }
    }
    4
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    config.validate_client()?;
    init_tracing();

    tracing::info!("mailtun client {} starting", mailtun::VERSION);
    let supervisor = Supervisor::new(Arc::new(config))?;
    supervisor.run().await;
    Ok(())
}

async fn ping(path: &Path, count: u32) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    if config.client.server.is_empty()
        || config.client.username.is_empty()
        || config.client.secret.is_empty()
    {
        anyhow::bail!("client.server, client.username and client.secret are required");
    }

    let connector = tls::connector(
        config.client.ca_cert.as_deref(),
        config.client.insecure_skip_verify,
    )?;

    let (tunnel, reader) = supervisor::establish(&config, &connector).await?;
    let receiver = tokio::spawn(Arc::clone(&tunnel).run_receiver(reader));

    println!("PING {} ({} probes)", config.client.server, count);
    let mut times = Vec::new();
    for i in 1..=count {
        match tunnel.ping().await {
            Ok(rtt) => {
                println!("probe {i}: {:.2} ms", rtt.as_secs_f64() * 1000.0);
                times.push(rtt);
            }
            Err(e) => println!("probe {i}: {e}"),
        }
        if i < count {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    if !times.is_empty() {
        let min = times.iter().min().unwrap();
        let max = times.iter().max().unwrap();
        let avg = times.iter().sum::<Duration>() / times.len() as u32;
        println!();
        println!(
            "{}/{} probes answered, min/avg/max = {:.2}/{:.2}/{:.2} ms",
            times.len(),
            count,
            min.as_secs_f64() * 1000.0,
            avg.as_secs_f64() * 1000.0,
            max.as_secs_f64() * 1000.0,
        );
    }

    tunnel.disconnect();
    receiver.abort();
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    config.validate_client()?;

    println!("{}: OK", path.display());
    println!("  server: {}", config.client.server);
    println!("  username: {}", config.client.username);
    println!(
        "  tls verification: {}",
        if config.client.insecure_skip_verify {
            "DISABLED".to_string()
        } else {
            match &config.client.ca_cert {
                Some(ca) => format!("CA {}", ca.display()),
                None => "no CA configured (set ca_cert)".to_string(),
            }
        }
    );
    println!("  socks listeners: {}", config.client.socks.len());
    println!("  forward rules: {}", config.client.forward.len());
    println!(
        "  reconnect: {}s initial, {}s max",
        config.client.reconnect_delay_secs, config.client.max_reconnect_delay_secs
    );
    Ok(())
}
