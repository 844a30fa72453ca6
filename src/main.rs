// Copyright 2026 Lotpilot Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use lotpilot::automation::{AutomationTask, Driver, FieldAssignment, FieldKind, SubmitAction};
use lotpilot::backend::{Collaborator, HttpCollaborator};
use lotpilot::browser::{BrowserEngine, PageHandle};
use lotpilot::config::PacingConfig;
use lotpilot::convo::MonitorSession;
use lotpilot::events::{EventBus, LotEvent};
use lotpilot::extract::normalize::normalize_batch;
use lotpilot::extract::{extract_many, VehicleListing};
use lotpilot::monitor::{classify_batch, MonitorGate, MutationMonitor};
use lotpilot::profiles;

#[derive(Parser)]
#[command(
    name = "lotpilot",
    about = "Lotpilot — dealership listing automation",
    version,
    after_help = "Run 'lotpilot <command> --help' for details on each command."
)]
struct Cli {
    /// Output results as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape vehicle listings from a marketplace page
    Scrape {
        /// Listing or search-results URL
        url: String,
        /// Force a site profile instead of auto-detection
        #[arg(long)]
        site: Option<String>,
        /// Write valid listings to this file as JSON
        #[arg(long)]
        out: Option<String>,
        /// Upload valid listings to the backend after scraping
        #[arg(long)]
        upload: bool,
        /// Backend base URL
        #[arg(long, env = "LOTPILOT_BACKEND")]
        backend: Option<String>,
        /// Navigation timeout in milliseconds
        #[arg(long, default_value = "30000")]
        timeout: u64,
    },
    /// Run an automation task (form fill, photos, submit) against a page
    Publish {
        /// Page holding the destination form
        url: String,
        /// Task file: JSON with form_selector, assignments, image_manifest
        #[arg(long)]
        task: String,
        /// Ask the backend for SEO text and pricing before filling the form
        #[arg(long, requires = "listing")]
        enhance: bool,
        /// Listing file (JSON, as written by `scrape --out`) to enhance from
        #[arg(long)]
        listing: Option<String>,
        /// Backend base URL
        #[arg(long, env = "LOTPILOT_BACKEND")]
        backend: Option<String>,
        /// Navigation timeout in milliseconds
        #[arg(long, default_value = "30000")]
        timeout: u64,
    },
    /// Watch a conversation page and answer buyer messages
    Monitor {
        /// Conversation/inbox URL
        url: String,
        /// Selector of the container holding the message thread
        #[arg(long, default_value = "[role='main']")]
        container: String,
        /// Selector of the reply input control
        #[arg(long, default_value = "[contenteditable='true'], textarea")]
        reply_input: String,
        /// Send AI replies automatically instead of printing them for approval
        #[arg(long)]
        auto_send: bool,
        /// Backend base URL
        #[arg(long, env = "LOTPILOT_BACKEND")]
        backend: String,
        /// Navigation timeout in milliseconds
        #[arg(long, default_value = "30000")]
        timeout: u64,
    },
    /// Check environment and diagnose issues
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "lotpilot=debug"
    } else {
        "lotpilot=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    if cli.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let result = match cli.command {
        Commands::Scrape {
            url,
            site,
            out,
            upload,
            backend,
            timeout,
        } => {
            run_scrape(
                &url,
                site.as_deref(),
                out.as_deref(),
                upload,
                backend.as_deref(),
                timeout,
                cli.json,
            )
            .await
        }
        Commands::Publish {
            url,
            task,
            enhance,
            listing,
            backend,
            timeout,
        } => {
            run_publish(
                &url,
                &task,
                enhance,
                listing.as_deref(),
                backend.as_deref(),
                timeout,
                cli.json,
            )
            .await
        }
        Commands::Monitor {
            url,
            container,
            reply_input,
            auto_send,
            backend,
            timeout,
        } => run_monitor(&url, &container, &reply_input, auto_send, &backend, timeout).await,
        Commands::Doctor => run_doctor().await,
    };

    if let Err(e) = &result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    result
}

async fn run_scrape(
    url: &str,
    site: Option<&str>,
    out: Option<&str>,
    upload: bool,
    backend: Option<&str>,
    timeout: u64,
    json: bool,
) -> Result<()> {
    let engine = lotpilot::browser::default_engine().await;
    let mut page = engine.new_page().await?;

    let start = std::time::Instant::now();
    let nav = page.navigate(url, timeout).await?;
    let html = page.html().await?;
    page.close().await?;

    let registry = profiles::registry();
    let profile = match site {
        Some(id) => registry
            .by_id(id)
            .with_context(|| format!("unknown site profile {id:?}"))?,
        None => registry
            .detect(&nav.final_url, &html)
            .unwrap_or_else(|| registry.generic()),
    };
    tracing::info!(site = %profile.id, url = %nav.final_url, "scraping");

    let bus = EventBus::new(64);
    log_events(&bus);
    bus.emit(LotEvent::ScrapeStarted {
        site: profile.id.clone(),
        url: nav.final_url.clone(),
    });

    let raws = extract_many(&html, &nav.final_url, profile);
    let raw_count = raws.len();
    let (listings, stats) = normalize_batch(raws, &nav.final_url, &profile.id);

    for _ in 0..stats.rejected_missing_title {
        bus.emit(LotEvent::ListingRejected {
            site: profile.id.clone(),
            reason: "missing title".to_string(),
        });
    }
    for _ in 0..stats.rejected_missing_price {
        bus.emit(LotEvent::ListingRejected {
            site: profile.id.clone(),
            reason: "missing price".to_string(),
        });
    }

    bus.emit(LotEvent::ScrapeComplete {
        site: profile.id.clone(),
        raw_records: raw_count,
        valid_listings: listings.len(),
        elapsed_ms: start.elapsed().as_millis() as u64,
    });

    if json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
    } else {
        println!(
            "Scraped {} raw record(s), {} valid, {} rejected ({} no title, {} no price)",
            raw_count,
            stats.accepted,
            stats.rejected(),
            stats.rejected_missing_title,
            stats.rejected_missing_price,
        );
        for listing in &listings {
            println!(
                "  {} — ${} ({} photos)",
                listing.title,
                listing.price,
                listing.images.len()
            );
        }
    }

    if let Some(path) = out {
        std::fs::write(path, serde_json::to_vec_pretty(&listings)?)
            .with_context(|| format!("failed to write {path}"))?;
        tracing::info!(path, count = listings.len(), "listings written");
    }

    if upload {
        let base = backend.context("--upload requires --backend or LOTPILOT_BACKEND")?;
        let client = HttpCollaborator::new(base);
        client
            .upload_listings(&listings, &profile.id, &nav.final_url)
            .await?;
        tracing::info!(count = listings.len(), "listings uploaded");
    }

    Ok(())
}

async fn run_publish(
    url: &str,
    task_path: &str,
    enhance: bool,
    listing_path: Option<&str>,
    backend: Option<&str>,
    timeout: u64,
    json: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(task_path)
        .with_context(|| format!("failed to read task file {task_path}"))?;
    let mut task: AutomationTask =
        serde_json::from_str(&raw).with_context(|| format!("malformed task file {task_path}"))?;

    if enhance {
        let listing_path = listing_path.context("--enhance requires --listing")?;
        let base = backend.context("--enhance requires --backend or LOTPILOT_BACKEND")?;
        let listing = read_listing(listing_path)?;
        let enhancement = HttpCollaborator::new(base).enhance_listing(&listing).await?;
        tracing::info!(
            recommended_price = %enhancement.recommended_price,
            keywords = enhancement.keywords.len(),
            "applying listing enhancement"
        );
        task.apply_enhancement(&enhancement);
    }

    let engine = lotpilot::browser::default_engine().await;
    let mut page = engine.new_page().await?;
    page.navigate(url, timeout).await?;

    let driver = Driver::new(PacingConfig::default());
    let report = driver.run(page.as_mut(), &mut task).await?;
    page.close().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Filled {} field(s), skipped {}, attached {} photo(s), submitted: {}",
            report.filled.len(),
            report.skipped.len(),
            report.images_attached,
            report.submitted,
        );
        for field in &report.skipped {
            println!("  skipped: {field}");
        }
    }
    Ok(())
}

async fn run_monitor(
    url: &str,
    container: &str,
    reply_input: &str,
    auto_send: bool,
    backend: &str,
    timeout: u64,
) -> Result<()> {
    let engine = lotpilot::browser::default_engine().await;
    let mut page = engine.new_page().await?;
    page.navigate(url, timeout).await?;
    let page: Arc<Mutex<Box<dyn PageHandle>>> = Arc::new(Mutex::new(page));

    let bus = Arc::new(EventBus::new(256));
    log_events(&bus);
    let gate = MonitorGate::new();
    let monitor = MutationMonitor::new(gate.clone()).with_events(Arc::clone(&bus));
    let mut batches = monitor.watch(Arc::clone(&page), container).await?;

    let collaborator = HttpCollaborator::new(backend);
    let mut session = MonitorSession::new(auto_send).with_events(Arc::clone(&bus));
    let driver = Driver::new(PacingConfig::default())
        .with_events(Arc::clone(&bus))
        .with_monitor_gate(gate);

    tracing::info!(url, container, auto_send, "monitoring conversation");
    let mut seen = HashSet::new();

    loop {
        let batch = tokio::select! {
            batch = batches.recv() => match batch {
                Some(Ok(batch)) => batch,
                // The monitor gave up on the page; that is a failure, not
                // a clean stop.
                Some(Err(e)) => return Err(e),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, stopping monitor");
                break;
            }
        };

        for message in classify_batch(&batch, &mut seen) {
            let counterpart = if message.sender.is_empty() {
                "buyer"
            } else {
                message.sender.as_str()
            };
            tracing::info!(counterpart, text = %message.text, "inbound message");
            let Some(decision) = session
                .on_inbound_message(&collaborator, counterpart, &message.text)
                .await
            else {
                continue;
            };

            if decision.suggest_appointment {
                println!("[suggestion] propose an appointment: {}", decision.text);
            }
            if !decision.auto_send {
                println!("[draft] {}", decision.text);
                continue;
            }

            let mut task = reply_task(reply_input, &decision.text);
            let mut guard = page.lock().await;
            match driver.run(guard.as_mut(), &mut task).await {
                Ok(report) if report.submitted => {
                    session.record_outbound(counterpart, &decision.text);
                }
                Ok(_) => tracing::warn!("reply typed but not sent, leaving as draft"),
                Err(e) => tracing::warn!(error = %e, "reply task failed"),
            }
        }
    }

    Ok(())
}

/// Read one listing from disk. `scrape --out` writes an array, so a bare
/// object and a single-element array are both accepted.
fn read_listing(path: &str) -> Result<VehicleListing> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read listing file {path}"))?;
    if let Ok(listing) = serde_json::from_str::<VehicleListing>(&raw) {
        return Ok(listing);
    }
    let mut batch: Vec<VehicleListing> = serde_json::from_str(&raw)
        .with_context(|| format!("malformed listing file {path}"))?;
    match batch.len() {
        1 => Ok(batch.remove(0)),
        n => anyhow::bail!("listing file {path} holds {n} listings, expected exactly one"),
    }
}

/// A chat reply is a one-field task: type into the composer, click send.
fn reply_task(reply_input: &str, text: &str) -> AutomationTask {
    let mut task = AutomationTask::new(reply_input);
    task.assignments.push(FieldAssignment {
        field_key: "reply".to_string(),
        selectors: vec![reply_input.to_string()],
        value: text.to_string(),
        kind: FieldKind::Text,
    });
    task.submit = SubmitAction {
        labels: vec!["send".to_string(), "reply".to_string()],
    };
    task
}

/// Mirror every bus event into the debug log as one JSON line.
fn log_events(bus: &EventBus) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                tracing::debug!(event = %json, "bus");
            }
        }
    });
}

async fn run_doctor() -> Result<()> {
    println!("Lotpilot Doctor");
    println!("===============");
    println!();

    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    println!("OS:   {os}");
    println!("Arch: {arch}");
    println!();

    let chromium = lotpilot::browser::chromium::find_chromium();
    match &chromium {
        Some(path) => println!("[OK] Chromium found: {}", path.display()),
        None => println!(
            "[!!] Chromium NOT found. Install Chrome or set LOTPILOT_CHROMIUM_PATH."
        ),
    }

    match std::env::var("LOTPILOT_BACKEND") {
        Ok(base) => println!("[OK] Backend configured: {base}"),
        Err(_) => println!("[??] LOTPILOT_BACKEND not set; --backend required for upload/monitor"),
    }

    println!();
    if chromium.is_some() {
        println!("Status: READY");
    } else {
        println!("Status: NOT READY");
    }
    Ok(())
}
