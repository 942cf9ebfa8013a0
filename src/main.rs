//! vmfw - VM Firewall
//!
//! Command-line front end for the enforcement compilers.
//!
//! # Usage
//!
//! ```bash
//! vmfw render --policy policy.json                 # Dry run against empty tables
//! vmfw render --policy policy.json --saved-v4 v4.dump --filters
//! vmfw diff --policy policy.json                   # Live tables vs compiled result
//! vmfw apply --policy policy.json                  # Enforce on this host
//! vmfw refresh-provider --policy policy.json
//! vmfw snapshots                                   # List pre-apply snapshots
//! vmfw restore-snapshot --family ipv4
//! ```
//!
//! Logs go to `<state dir>/vmfw.log`; set `RUST_LOG` for the level.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vmfw::audit::AuditLog;
use vmfw::config::{FirewallConfig, load_config, load_config_from};
use vmfw::core::driver::Firewall;
use vmfw::core::error::ToolErrorPattern;
use vmfw::core::filter_backend::{FilterBackend, MemoryFilters, VirshFilters};
use vmfw::core::nwfilter::NwFilter;
use vmfw::core::packet_filter::PacketFilter;
use vmfw::core::policy::{InstanceRecord, StaticPolicy};
use vmfw::core::rules::enabled_families;
use vmfw::core::snapshot::{SnapshotStore, restore_latest_snapshot};
use vmfw::core::table_backend::{IptablesCommand, MemoryTables, TableBackend};
use vmfw::{Error, IpFamily};

#[derive(Parser)]
#[command(name = "vmfw")]
#[command(about = "VM Firewall - security groups to iptables and libvirt nwfilters", long_about = None)]
struct Cli {
    /// Configuration file (default: <data dir>/config.json)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a policy against in-memory tables and print the restore text
    Render {
        #[arg(long, value_name = "FILE")]
        policy: PathBuf,
        /// Existing iptables-save -c output to merge into
        #[arg(long, value_name = "FILE")]
        saved_v4: Option<PathBuf>,
        /// Existing ip6tables-save -c output to merge into
        #[arg(long, value_name = "FILE")]
        saved_v6: Option<PathBuf>,
        /// Also print the interface filter XML
        #[arg(long)]
        filters: bool,
    },
    /// Show what apply would change in the live tables
    Diff {
        #[arg(long, value_name = "FILE")]
        policy: PathBuf,
    },
    /// Enforce a policy on this host
    Apply {
        #[arg(long, value_name = "FILE")]
        policy: PathBuf,
    },
    /// Rebuild only the provider chain
    RefreshProvider {
        #[arg(long, value_name = "FILE")]
        policy: PathBuf,
    },
    /// List pre-apply snapshots
    Snapshots,
    /// Reload the newest snapshot of one family into the live tables
    RestoreSnapshot {
        /// ipv4 or ipv6
        #[arg(long)]
        family: String,
    },
}

fn main() -> ExitCode {
    let _ = vmfw::utils::ensure_dirs();
    init_logging();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            let detail = e.tool_output().map_or_else(|| e.to_string(), str::to_string);
            let translation = ToolErrorPattern::match_error(&detail);
            eprintln!("  {}", translation.user_message);
            for suggestion in &translation.suggestions {
                eprintln!("  - {suggestion}");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(mut log_path) = vmfw::utils::get_state_dir() {
        log_path.push("vmfw.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(file)
                .init();
            return;
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn read_config(path: Option<&Path>) -> vmfw::Result<FirewallConfig> {
    match path {
        Some(path) => load_config_from(path).await,
        None => Ok(load_config().await),
    }
}

async fn read_optional(path: Option<&Path>) -> vmfw::Result<String> {
    match path {
        Some(path) => Ok(tokio::fs::read_to_string(path).await?),
        None => Ok(String::new()),
    }
}

fn live_instances(policy: &StaticPolicy) -> vmfw::Result<Vec<InstanceRecord>> {
    Ok(policy
        .snapshot()?
        .instances
        .into_iter()
        .filter(|r| !r.deleted)
        .collect())
}

/// Firewall against the real host, with audit log and snapshots as configured
fn host_firewall(
    policy: Arc<StaticPolicy>,
    config: FirewallConfig,
) -> vmfw::Result<Firewall<Arc<StaticPolicy>, IptablesCommand, VirshFilters>> {
    let mut packet = PacketFilter::new(policy, IptablesCommand, config.clone())?;
    let mut hypervisor = NwFilter::new(VirshFilters::new(), config.clone())?;

    if config.audit_enabled {
        let audit = AuditLog::new()?;
        packet = packet.with_audit(audit.clone());
        hypervisor = hypervisor.with_audit(audit);
    }
    if config.snapshot_before_apply {
        packet = packet.with_snapshots(SnapshotStore::in_state_dir()?);
    }
    Ok(Firewall::from_parts(packet, hypervisor))
}

/// Stages every live instance without touching the host
fn stage_all<B: TableBackend, F: FilterBackend>(
    firewall: &Firewall<Arc<StaticPolicy>, B, F>,
    records: &[InstanceRecord],
) -> vmfw::Result<()> {
    for record in records {
        firewall.prepare_instance_filter(&record.instance, &record.network)?;
    }
    Ok(())
}

async fn handle_cli(cli: Cli) -> vmfw::Result<()> {
    let config = read_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Render {
            policy,
            saved_v4,
            saved_v6,
            filters,
        } => {
            let policy = Arc::new(StaticPolicy::load(&policy).await?);
            let tables = MemoryTables::with_tables(
                read_optional(saved_v4.as_deref()).await?,
                read_optional(saved_v6.as_deref()).await?,
            );
            let firewall = Firewall::new(
                Arc::clone(&policy),
                tables,
                MemoryFilters::with_base_filters(),
                config.clone(),
            )?;

            let records = live_instances(&policy)?;
            for record in &records {
                firewall
                    .ensure_filtering_rules_for_instance(&record.instance, &record.network)
                    .await?;
            }
            if records.is_empty() {
                firewall.refresh_provider_fw_rules().await?;
            }

            for &family in enabled_families(config.use_ipv6) {
                println!("# {family}");
                print!("{}", firewall.packet_filter().backend().dump(family));
            }

            if filters {
                let backend = firewall.nwfilter().backend();
                for name in backend.names() {
                    if name.starts_with(&format!("{}-", config.filter_prefix))
                        && let Some(doc) = backend.get(&name)
                    {
                        println!();
                        print!("{}", doc.to_xml());
                    }
                }
            }
        }
        Commands::Diff { policy } => {
            let policy = Arc::new(StaticPolicy::load(&policy).await?);
            let firewall = Firewall::new(
                Arc::clone(&policy),
                IptablesCommand,
                VirshFilters::new(),
                config.clone(),
            )?;
            stage_all(&firewall, &live_instances(&policy)?)?;

            let mut changed = false;
            for &family in enabled_families(config.use_ipv6) {
                let (live, merged) = firewall.packet_filter().render(family).await?;
                if live == merged {
                    continue;
                }
                changed = true;
                let diff = similar::TextDiff::from_lines(&live, &merged);
                print!(
                    "{}",
                    diff.unified_diff()
                        .context_radius(3)
                        .header(&format!("live {family}"), &format!("compiled {family}"))
                );
            }
            if !changed {
                println!("Live tables already match the compiled policy.");
            }
        }
        Commands::Apply { policy } => {
            let policy = Arc::new(StaticPolicy::load(&policy).await?);
            let records = live_instances(&policy)?;

            if !nix::unistd::getuid().is_root() {
                println!("Note: Not running as root. Will use sudo/run0 for iptables and virsh.");
            }

            let firewall = host_firewall(Arc::clone(&policy), config)?;
            for record in &records {
                firewall.setup_basic_filtering(&record.instance, &record.network).await?;
            }
            stage_all(&firewall, &records)?;
            firewall.refresh_provider_fw_rules().await?;
            println!("✓ {} instance(s) filtered.", records.len());
        }
        Commands::RefreshProvider { policy } => {
            let policy = Arc::new(StaticPolicy::load(&policy).await?);
            let firewall = host_firewall(policy, config)?;
            let count = firewall.refresh_provider_fw_rules().await?;
            println!("✓ Provider chain rebuilt with {count} rule(s).");
        }
        Commands::Snapshots => {
            let store = SnapshotStore::in_state_dir()?;
            for family in [IpFamily::V4, IpFamily::V6] {
                println!("{family}:");
                for path in store.list(family).await? {
                    match store.load(&path).await {
                        Ok(snapshot) => println!(
                            "  {}  {}  {}",
                            snapshot.taken_at.format("%Y-%m-%d %H:%M:%S"),
                            &snapshot.checksum[..12],
                            path.display()
                        ),
                        Err(e) => println!("  (invalid: {e})  {}", path.display()),
                    }
                }
            }
        }
        Commands::RestoreSnapshot { family } => {
            let family = IpFamily::from_str(&family)
                .map_err(|_| Error::validation("family", "expected ipv4 or ipv6"))?;
            let store = SnapshotStore::in_state_dir()?;
            let result = restore_latest_snapshot(&store, &IptablesCommand, family).await;

            if config.audit_enabled
                && let Ok(audit) = AuditLog::new()
            {
                vmfw::audit::log_restore_snapshot(
                    &audit,
                    family,
                    result.is_ok(),
                    result.as_ref().err().map(ToString::to_string),
                )
                .await;
            }

            let snapshot = result?;
            println!(
                "✓ Restored {family} snapshot taken at {}.",
                snapshot.taken_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}
