//! S3 Manager
//!
//! Headless driver for the engine: lists profiles, opens a session, lists
//! buckets and optionally one folder level.
//!
//! Usage: s3-manager [PROFILE] [BUCKET[/PREFIX] | s3://BUCKET/PREFIX]

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use s3_manager::cache::ListingCache;
use s3_manager::navigator::{Lister, Navigator};
use s3_manager::s3::{list_buckets, ListingEntry, ProfileManager};
use s3_manager::settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Starting S3 Manager v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::load().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings, using defaults: {:#}", e);
        Settings::default()
    });

    let mut args = std::env::args().skip(1);
    let profile_arg = args.next();
    let location_arg = args.next();

    let mut profiles = ProfileManager::new().context("Failed to read AWS configuration")?;
    let names = profiles.list_profiles().context("Failed to read AWS profiles")?;
    if names.is_empty() {
        anyhow::bail!("No AWS profiles configured");
    }
    for profile in profiles.invalid_profiles() {
        tracing::warn!(
            "Profile '{}' is unusable: {}",
            profile.name,
            profile.problem.as_deref().unwrap_or("unknown problem")
        );
    }

    let profile_id = profile_arg
        .or_else(|| settings.last_profile.clone().filter(|p| names.contains(p)))
        .unwrap_or_else(|| names[0].clone());

    println!("Profiles:");
    for name in &names {
        let marker = if *name == profile_id { "*" } else { " " };
        println!(" {} {}", marker, name);
    }

    let session = profiles
        .open_session(&profile_id)
        .await
        .with_context(|| format!("Failed to open session for profile '{}'", profile_id))?;
    settings.set_profile(Some(&profile_id));

    let buckets = list_buckets(&session).await.context("Failed to list buckets")?;
    println!("\nBuckets ({}):", session.region());
    for bucket in &buckets {
        println!("  {}", bucket.name);
    }

    let location = location_arg.or_else(|| {
        settings.last_bucket.as_ref().map(|bucket| {
            format!("s3://{}/{}", bucket, settings.last_prefix.as_deref().unwrap_or(""))
        })
    });

    if let Some(location) = location {
        let lister = Lister::new(ListingCache::new(), &settings.engine);
        let mut navigator = Navigator::new(session, lister);
        navigator
            .navigate_to_location(&location)
            .with_context(|| format!("Invalid location '{}'", location))?;

        let entries = navigator.list_current_level().await.with_context(|| {
            format!("Failed to list {}", navigator.state().url().unwrap_or_default())
        })?;

        println!("\n{}", navigator.state().url().unwrap_or_default());
        for entry in entries.iter() {
            match entry {
                ListingEntry::Folder(folder) => println!("  {:>12}  {}/", "", folder.name),
                ListingEntry::File(file) => println!("  {:>12}  {}", file.size_string(), file.name),
            }
        }

        settings.set_location(
            navigator.bucket(),
            Some(navigator.prefix().as_str()).filter(|p| !p.is_empty()),
        );
    }

    if let Err(e) = settings.save() {
        tracing::warn!("Failed to save settings: {:#}", e);
    }

    Ok(())
}
