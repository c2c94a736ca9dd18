use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

mod api;
mod capture;
mod client_id;
mod config;
mod crm;
mod error;
mod models;
mod phone;
mod processor;
mod reengagement;
mod resolver;
mod sanitize;
mod store;
mod whatsapp;

use config::{AppArgs, Command, Config};
use crm::BrevoClient;
use models::{ContactIdentifier, PageContext, ReengagementSource, WhatsAppLead};
use reengagement::{HttpReengagementSink, ReengagementTracker};
use store::{AttributionStore, StoreKey};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = AppArgs::parse();
    let config = config::build_config(&args)?;
    let store = AttributionStore::open(&config.state_dir);

    match args.command {
        Command::Capture {
            url,
            referrer,
            cookies,
        } => {
            let page = PageContext::parse(&url, referrer, cookies)?;
            let record = capture::capture_from_location(&store, &page, config.max_value_length, Utc::now());
            print_json(&record)?;
        }
        Command::Resolve { url, referrer } => {
            let page = url
                .as_deref()
                .map(|u| PageContext::parse(u, referrer, None))
                .transpose()?;
            let payload = resolver::enrich(&resolver::resolve_for_submission(&store), page.as_ref());
            print_json(&payload)?;
        }
        Command::EndSession { forget_visitor } => {
            store.clear_session();
            info!("Session attribution cleared");
            if forget_visitor {
                store.clear_durable();
                info!("Visitor attribution cleared");
            }
        }
        Command::Whatsapp {
            first_name,
            last_name,
            phone,
            course,
            email,
            message,
        } => {
            let client = BrevoClient::new(&config)?;
            let lead = WhatsAppLead {
                first_name,
                last_name,
                email,
                phone,
                course_name: course,
                message,
            };
            let outcome = whatsapp::process_whatsapp_lead(&lead, &client, &config, Utc::now()).await?;
            print_json(&outcome)?;
        }
        Command::Reengage {
            source,
            email,
            phone,
            contact_id,
            cookies,
            url,
            referrer,
        } => {
            let page = match url.as_deref() {
                Some(url) => Some(PageContext::parse(url, referrer, cookies)?),
                None => {
                    // No page to carry the cookies; remember the id they hold instead.
                    if let Some(id) = cookies.as_deref().and_then(client_id::client_id_from_cookies) {
                        store.set(StoreKey::GaClientId, &id);
                    }
                    None
                }
            };
            let tracker = ReengagementTracker::new(store, HttpReengagementSink::new(&config)?, &config);
            let now = Utc::now();
            let outcome = match (source, email.as_deref()) {
                (ReengagementSource::Form, Some(email)) => {
                    tracker.on_form_submission(email, page.as_ref(), now).await?
                }
                (ReengagementSource::Chat, email) if phone.is_none() && contact_id.is_none() => tracker
                    .on_chat_interaction(email, page.as_ref(), now)
                    .await
                    .context("No email is known for this visitor")??,
                _ => {
                    if let Some(email) = email.as_deref() {
                        tracker.store_email(email);
                    }
                    let identifier = ContactIdentifier {
                        email: email.clone(),
                        phone,
                        contact_id,
                    };
                    tracker.track_if_due(&identifier, source, page.as_ref(), now).await?
                }
            };
            print_json(&outcome)?;
        }
        Command::Backfill { input, output, .. } => {
            info!("Processing leads from {} to {}", input.display(), output.display());
            process_file(&input, &output, config).await?;
        }
        Command::Serve { .. } => {
            let client = Arc::new(BrevoClient::new(&config)?);
            api::start_api_server(client, Arc::new(config)).await?;
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn process_file(input: &Path, output: &Path, config: Config) -> Result<()> {
    let input_data = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read input file {}", input.display()))?;
    let leads: Vec<WhatsAppLead> = serde_json::from_str(&input_data)
        .with_context(|| format!("Failed to parse leads from {}", input.display()))?;

    info!("Loaded {} leads from {}", leads.len(), input.display());

    let client = Arc::new(BrevoClient::new(&config)?);
    let semaphore = Arc::new(tokio::sync::Semaphore::new(config.max_concurrency));
    let config = Arc::new(config);

    let progress_bar = indicatif::ProgressBar::new(leads.len() as u64);
    progress_bar.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("##-"),
    );

    let tasks: Vec<_> = leads
        .into_iter()
        .map(|lead| {
            let client = client.clone();
            let semaphore = semaphore.clone();
            let config = config.clone();
            let progress_bar = progress_bar.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await?;
                let result = processor::process_lead(client, lead, config).await;
                progress_bar.inc(1);
                anyhow::Ok(result)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(tasks.len());
    for joined in futures::future::join_all(tasks).await {
        results.push(joined??);
    }

    progress_bar.finish_with_message("Processing complete");

    let failed = results.iter().filter(|r| r.error.is_some()).count();
    let output_data = serde_json::to_string_pretty(&results)?;
    std::fs::write(output, output_data)
        .with_context(|| format!("Failed to write results to {}", output.display()))?;

    info!(
        "Wrote {} results to {} ({} failed)",
        results.len(),
        output.display(),
        failed
    );

    Ok(())
}
