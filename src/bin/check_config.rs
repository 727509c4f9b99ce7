//! CLI tool for validating a proxy configuration
//!
//! Usage:
//!   sniproxy-check [--config <path>] [--json]
//!
//! Loads every certificate, verifies each key against its certificate and
//! builds the route table exactly as the server would, then prints the result.

use anyhow::{Context, Result};
use clap::Parser;
use sniproxy::{ProxyConfig, ProxyServer, RouteRule};
use std::path::PathBuf;

/// Validate a sniproxy configuration file
#[derive(Parser, Debug)]
#[command(name = "sniproxy-check")]
#[command(author = "sniproxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Validate a sniproxy configuration and print its routing")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "SNIPROXY_CONFIG", default_value = "./sniproxy.json")]
    config: PathBuf,

    /// Output routes as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = ProxyConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let base_dir = args
        .config
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_default();
    let source = config
        .certificate_source(&base_dir)
        .context("Failed to open certificate source")?;
    let server = ProxyServer::from_config(&config, source.as_ref()).context("Configuration is invalid")?;

    let rules = server.routes().rules();

    if args.json {
        let json_output: Vec<serde_json::Value> = rules
            .iter()
            .enumerate()
            .map(|(order, rule)| {
                serde_json::json!({
                    "order": order,
                    "host": rule.host,
                    "path_prefix": rule.path_prefix,
                    "kind": rule.backend.kind(),
                    "target": rule.backend.url().as_str(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json_output)?);
        return Ok(());
    }

    println!("Listen:       {}", config.listen);
    if let Some(redirect) = config.redirect_listen {
        println!("Redirect:     {}", redirect);
    }
    println!("Protocols:    {}", config.next_protocols.join(", "));
    if let Some(archive) = &config.certificate_archive {
        println!("Archive:      {}", archive.display());
    }

    println!("\nCertificates (first is default):");
    for name in server.certificates().hostnames() {
        println!("  {}", name);
    }

    println!("\n{:<6} {:<30} {:<30} {:<10} {:<30}", "ORDER", "HOST", "PATH_PREFIX", "KIND", "TARGET");
    println!("{}", "-".repeat(108));
    for (order, rule) in rules.iter().enumerate() {
        print_rule(order, rule);
    }

    println!("\nTotal: {} route(s)", rules.len());

    Ok(())
}

fn print_rule(order: usize, rule: &RouteRule) {
    println!(
        "{:<6} {:<30} {:<30} {:<10} {:<30}",
        order,
        rule.host,
        rule.path_prefix,
        rule.backend.kind(),
        rule.backend.url().as_str()
    );
}
