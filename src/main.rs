// Client Identity Resolution - CLI
//
//   client-identity [--config <file>] init
//   client-identity [--config <file>] import <clients.csv>
//   client-identity [--config <file>] matches first=Maria last=Garcia phone=4045551234
//   client-identity [--config <file>] merge <primary-id> <duplicate-id>... [field=value...]
//   client-identity [--config <file>] history <client-id>

use anyhow::{anyhow, bail, Context, Result};
use client_identity::{
    load_clients_csv, ClientField, ClientId, ClientStore, IdentityResolutionService, MergeError,
    PartialClientProfile, Recovery, ResolutionConfig, SearchStatus, SqliteStore,
};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let config_path = take_flag(&mut args, "--config")?;
    let config = ResolutionConfig::load(config_path.as_deref())?;

    let command = match args.first() {
        Some(command) => command.clone(),
        None => {
            print_usage();
            return Ok(());
        }
    };
    let rest = &args[1..];

    match command.as_str() {
        "init" => run_init(&config),
        "import" => {
            let csv_path = rest.first().ok_or_else(|| anyhow!("import needs a CSV path"))?;
            run_import(&config, Path::new(csv_path))
        }
        "matches" => run_matches(&config, rest),
        "merge" => run_merge(&config, rest),
        "history" => {
            let id = rest.first().ok_or_else(|| anyhow!("history needs a client id"))?;
            run_history(&config, &ClientId::from(id.as_str()))
        }
        _ => {
            print_usage();
            bail!("Unknown command: {}", command)
        }
    }
}

fn print_usage() {
    println!("client-identity {}", client_identity::VERSION);
    println!();
    println!("Commands:");
    println!("  init                                     Create the database");
    println!("  import <clients.csv>                     Load client records");
    println!("  matches field=value...                   Propose possible duplicates");
    println!("  merge <primary> <dup>... [field=value]   Merge duplicates into primary");
    println!("  history <client-id>                      Show dependent records and merge history");
    println!();
    println!("Options:");
    println!("  --config <file>                          JSON config (env: CLIENT_IDENTITY_*)");
}

/// Remove `flag <value>` from the argument list
fn take_flag(args: &mut Vec<String>, flag: &str) -> Result<Option<PathBuf>> {
    match args.iter().position(|a| a == flag) {
        Some(i) => {
            if i + 1 >= args.len() {
                bail!("{} needs a value", flag);
            }
            let value = args.remove(i + 1);
            args.remove(i);
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn open_store(config: &ResolutionConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))
}

/// Split `field=value` pairs from bare arguments
fn parse_assignments(args: &[String]) -> Result<(Vec<String>, BTreeMap<ClientField, String>)> {
    let mut bare = Vec::new();
    let mut fields = BTreeMap::new();

    for arg in args {
        match arg.split_once('=') {
            Some((key, value)) => {
                let field: ClientField = key.parse().map_err(|e: String| anyhow!(e))?;
                fields.insert(field, value.to_string());
            }
            None => bare.push(arg.clone()),
        }
    }

    Ok((bare, fields))
}

// ============================================================================
// Commands
// ============================================================================

fn run_init(config: &ResolutionConfig) -> Result<()> {
    println!("🗄️  Client Identity - Database Setup");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let store = open_store(config)?;
    println!("✓ Database ready at {} (WAL mode)", config.database_path.display());
    println!("✓ {} clients on file", store.count_clients()?);

    Ok(())
}

fn run_import(config: &ResolutionConfig, csv_path: &Path) -> Result<()> {
    println!("📂 Importing clients from {}", csv_path.display());

    let (clients, skipped) = load_clients_csv(csv_path)?;
    println!("✓ Parsed {} clients ({} rows without a name skipped)", clients.len(), skipped);

    let store = open_store(config)?;
    let mut inserted = 0;
    for client in &clients {
        match store.insert_client(client) {
            Ok(()) => inserted += 1,
            Err(e) => eprintln!("⚠️  Skipping {}: {}", client.display_name(), e),
        }
    }

    println!("✓ Inserted {} clients", inserted);
    println!("✓ Database contains {} clients", store.count_clients()?);

    Ok(())
}

fn run_matches(config: &ResolutionConfig, args: &[String]) -> Result<()> {
    let (_, fields) = parse_assignments(args)?;
    let mut profile = PartialClientProfile::new();
    for (field, value) in fields {
        profile.set(field, Some(value));
    }
    if profile.is_empty() {
        bail!("matches needs at least one field=value pair");
    }

    let store = open_store(config)?;
    let service = IdentityResolutionService::new(&store, config.clone());
    let results = service.propose_matches(&profile, &HashSet::new());

    match &results.status {
        SearchStatus::Failed { message } => bail!("Search failed (not the same as no matches): {}", message),
        SearchStatus::InsufficientInput => {
            println!("Not enough input to search: names need 3+ characters, phones 10+ digits, emails 6+ characters");
            return Ok(());
        }
        SearchStatus::Searched => {}
    }

    if results.candidates.is_empty() {
        println!("No matching clients found");
        return Ok(());
    }

    println!("🔍 {} possible matches", results.candidates.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for candidate in &results.candidates {
        let rules: Vec<&str> = candidate
            .breakdown
            .matched
            .iter()
            .map(|rule| rule.field().as_str())
            .collect();
        println!(
            "{:>3}%  {:<30} {}  [{}]",
            candidate.percentage(),
            candidate.client.display_name(),
            candidate.client.id,
            rules.join(", ")
        );
    }

    Ok(())
}

fn run_merge(config: &ResolutionConfig, args: &[String]) -> Result<()> {
    let (ids, overrides) = parse_assignments(args)?;
    if ids.len() < 2 {
        bail!("merge needs a primary id and at least one duplicate id");
    }
    let ids: Vec<ClientId> = ids.iter().map(|id| ClientId::from(id.as_str())).collect();

    let store = open_store(config)?;
    let service = IdentityResolutionService::new(&store, config.clone());

    // A rerun after a partial failure may find some duplicates already gone
    let mut pending = vec![ids[0].clone()];
    for id in &ids[1..] {
        match store.merged_into(id)? {
            Some(target) if target == ids[0] => println!("✓ {} already merged", id),
            _ => pending.push(id.clone()),
        }
    }
    if pending.len() < 2 {
        println!("✓ Already merged, nothing to do");
        return Ok(());
    }

    let records = service.load_clients(&pending)?;
    let plan = service.create_merge_plan(&records, &ids[0], &overrides)?;

    println!("🧩 Merge plan {}", &plan.fingerprint()[..12]);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Keep:   {}", plan.primary_id);
    for id in &plan.duplicate_ids {
        println!("Delete: {}", id);
    }
    for (field, value) in &plan.canonical_fields {
        println!("  {:<12} {}", field.as_str(), value);
    }

    match service.execute_merge(&plan) {
        Ok(result) if result.already_merged => {
            println!("\n✓ Already merged, nothing to do");
            Ok(())
        }
        Ok(result) => {
            println!("\n✅ Merged {} clients into {}", result.deleted_ids.len(), result.primary_id);
            for (kind, count) in &result.reassigned_counts {
                println!("   {:<20} {} moved", kind.to_string(), count);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("\n❌ {}", e);
            eprintln!("   {}", recovery_hint(&e));
            Err(e.into())
        }
    }
}

fn recovery_hint(error: &MergeError) -> &'static str {
    match error.recovery() {
        Recovery::FixInput => "Nothing was changed. Fix the ids or field values and try again.",
        Recovery::Repropose => "Nothing was changed. Another merge touched these clients; search again.",
        Recovery::ResubmitSamePlan => "The merge was partially applied. Run the exact same command again to finish it.",
        Recovery::RetryNow => "Nothing was changed. It is safe to retry right away.",
    }
}

fn run_history(config: &ResolutionConfig, id: &ClientId) -> Result<()> {
    let store = open_store(config)?;

    // Merge events are recorded against the surviving client
    let subject = if let Some(target) = store.merged_into(id)? {
        println!("{} was merged into {}", id, target);
        target
    } else if let Some(client) = store.get_client(id)? {
        println!("{} ({})", client.display_name(), client.id);
        client.id
    } else {
        println!("Client {} not found", id);
        return Ok(());
    };

    let service = IdentityResolutionService::new(&store, config.clone());
    for (kind, ids) in service.dependent_records(&subject)? {
        println!("   {:<20} {}", kind.to_string(), ids.len());
    }

    let events = store.events_for_client(&subject)?;
    if events.is_empty() {
        println!("No merge history");
    }
    for event in events {
        println!(
            "{}  {}  by {}  {}",
            event.timestamp.format("%Y-%m-%d %H:%M"),
            event.event_type,
            event.actor,
            event.data
        );
    }

    Ok(())
}
