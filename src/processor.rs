//! Functions for processing individual lead records during a backfill.

use crate::config::{Config, get_random_sleep_duration};
use crate::crm::ContactDirectory;
use crate::models::{LeadProcessingResult, WhatsAppLead};
use crate::whatsapp::process_whatsapp_lead;
use chrono::Utc;
use std::sync::Arc;

/// Processes a single WhatsApp lead against the CRM.
///
/// Never fails: validation and CRM errors are recorded on the returned row so
/// one bad lead does not abort the batch.
pub(crate) async fn process_lead<D: ContactDirectory>(
    directory: Arc<D>,
    lead: WhatsAppLead,
    config: Arc<Config>,
) -> LeadProcessingResult {
    let task_id = format!(
        "Lead: {} {} | Thread: {:?}",
        lead.first_name.trim(),
        lead.last_name.trim(),
        std::thread::current().id()
    );
    tracing::info!(target: "backfill_task", "[{}] Starting processing.", task_id);

    let pause = get_random_sleep_duration(&config);
    tracing::debug!(target: "backfill_task", "[{}] Sleeping {:.2?} before CRM calls", task_id, pause);
    tokio::time::sleep(pause).await;

    match process_whatsapp_lead(&lead, directory.as_ref(), &config, Utc::now()).await {
        Ok(outcome) => {
            tracing::info!(target: "backfill_task",
                "[{}] ✓ {} (contact {:?})", task_id, outcome.message, outcome.contact_id
            );
            LeadProcessingResult {
                lead,
                outcome: Some(outcome),
                error: None,
            }
        }
        Err(e) => {
            tracing::error!(target: "backfill_task", "[{}] ✗ Lead failed: {}", task_id, e);
            LeadProcessingResult {
                lead,
                outcome: None,
                error: Some(e.to_string()),
            }
        }
    }
}
