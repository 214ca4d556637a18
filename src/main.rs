//! agi - Linux chroot jail manager
//!
//! Operator front end: loads the TOML configuration, wires logging and the
//! jail registry together, and runs one lifecycle command.

mod cli;

use agi::error::{Error, Result};
use agi::jail::Backend;
use agi::logging::{self, LogFacade};
use agi::manifest::{self, AgiConfig, DEFAULT_MANIFEST, JailSettings};
use agi::{JailManager, JailRegistry, JailRuntimeInfo};
use cli::{Cli, Commands};
use nix::unistd::geteuid;
use std::fs;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, UNIX_EPOCH};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    // Commands that don't require config
    match &cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(*shell);
            return Ok(());
        }
        Commands::Init { force } => return init_config(&cli, *force),
        _ => {}
    }

    let config = manifest::load(&cli.config)?;
    logging::init(
        cli.verbose,
        &config.global.log_level,
        Some(config.global.log_path.as_path()),
    );

    if let Commands::Validate = cli.command {
        return validate(&config);
    }

    if cli.command.needs_root() && !geteuid().is_root() {
        eprintln!("Error: this command must be run as root");
        std::process::exit(1);
    }

    let registry = JailRegistry::new(
        JailSettings::from(&config.global),
        Backend::system(),
        Arc::new(LogFacade),
    );
    for env in config.environments.iter().filter(|e| e.enabled) {
        registry.add(env.clone());
    }

    match cli.command {
        Commands::Create { name } => {
            let jail = lookup(&registry, &name)?;
            jail.create()?;
            println!("Jail '{}' created at {}", name, jail.path().display());
        }
        Commands::Start { name } => {
            let jail = lookup(&registry, &name)?;
            jail.start()?;
            println!(
                "Jail '{}' started (SSH on {}:{})",
                name,
                jail.config().ssh.listen_address,
                jail.config().ssh.port
            );
        }
        Commands::Stop { name } => {
            lookup(&registry, &name)?.stop()?;
            println!("Jail '{}' stopped", name);
        }
        Commands::Restart { name } => {
            let jail = lookup(&registry, &name)?;
            jail.stop()?;
            thread::sleep(Duration::from_secs(1));
            jail.start()?;
            println!("Jail '{}' restarted", name);
        }
        Commands::Status { name, json } => {
            let info = lookup(&registry, &name)?.runtime_info();
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print_status(&info);
            }
        }
        Commands::List { json } => {
            let infos = registry.runtime_info_all();
            if json {
                println!("{}", serde_json::to_string_pretty(&infos)?);
            } else {
                print_table(&infos);
            }
        }
        Commands::Exec { name, command } => {
            let jail = lookup(&registry, &name)?;
            let outcome = jail.execute(&command.join(" "))?;
            if !outcome.success() {
                eprintln!("{}", outcome);
            }
            std::process::exit(outcome.code());
        }
        Commands::Remove { name, yes } => {
            let jail = lookup(&registry, &name)?;
            if !yes && !confirm(&format!(
                "Remove jail '{}' and delete {}? [y/N] ",
                name,
                jail.path().display()
            ))? {
                println!("Aborted.");
                return Ok(());
            }
            jail.destroy()?;
            registry.remove(&name);
            println!("Jail '{}' removed", name);
        }
        // Already handled above
        Commands::Init { .. } | Commands::Validate | Commands::Completion { .. } => {
            unreachable!()
        }
    }

    Ok(())
}

fn init_config(cli: &Cli, force: bool) -> Result<()> {
    let path = &cli.config;
    if path.exists() && !force {
        eprintln!(
            "Error: {} already exists. Use -y/--force to overwrite.",
            path.display()
        );
        std::process::exit(1);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, DEFAULT_MANIFEST)?;
    println!("Created {}", path.display());
    Ok(())
}

fn validate(config: &AgiConfig) -> Result<()> {
    // Configuration was already validated on load
    println!("Configuration is valid.");
    println!("Base path: {}", config.global.base_path.display());
    for env in &config.environments {
        println!(
            "  {:<20} port {:<6} {}",
            env.name,
            env.ssh.port,
            if env.enabled { "" } else { "(disabled)" }
        );
    }
    Ok(())
}

fn lookup(registry: &JailRegistry, name: &str) -> Result<Arc<JailManager>> {
    registry
        .get(name)
        .ok_or_else(|| Error::JailNotFound(name.to_string()))
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn print_status(info: &JailRuntimeInfo) {
    println!("Name:      {}", info.name);
    println!("Status:    {}", info.status);
    println!("Path:      {}", info.path.display());
    println!("SSH:       {}:{}", info.listen_address, info.ssh_port);
    if let Some(pid) = info.pid {
        println!("PID:       {}", pid);
    }
    if let Some(started) = info.started_at {
        let secs = started
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        println!(
            "Started:   {} (up {}s)",
            secs,
            info.uptime_secs().unwrap_or_default()
        );
    }
    if !info.mounts.is_empty() {
        println!("Mounts:");
        for mount in &info.mounts {
            println!("  {}", mount);
        }
    }
    if let Some(err) = &info.last_error {
        println!("Error:     {}", err);
    }
}

fn print_table(infos: &[JailRuntimeInfo]) {
    println!("{:<20} {:<10} {:<8} {:<22} {:<10}", "NAME", "STATUS", "PID", "SSH", "UPTIME");
    println!("{}", "-".repeat(72));

    for info in infos {
        let pid = info.pid.map(|p| p.to_string()).unwrap_or_default();
        let uptime = info
            .uptime_secs()
            .map(|s| format!("{}s", s))
            .unwrap_or_default();
        println!(
            "{:<20} {:<10} {:<8} {:<22} {:<10}",
            info.name,
            info.status,
            pid,
            format!("{}:{}", info.listen_address, info.ssh_port),
            uptime
        );
    }
}
