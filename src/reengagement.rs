//! Re-engagement tracking for returning visitors.
//!
//! The client half runs where the attribution store lives: it notices a known
//! visitor coming back through chat or a page view and pushes their current
//! client id and UTM state to the tracking endpoint, at most once a day per
//! email. The server half applies such a push to the CRM contact.

use crate::client_id::{client_id_from_cookies, is_valid_client_id};
use crate::config::Config;
use crate::crm::ContactDirectory;
use crate::error::{AttributionError, Result};
use crate::models::{
    ContactIdentifier, ContactRef, CrmContact, PageContext, ReengagedContact,
    ReengagementRequest, ReengagementResponse, ReengagementSource, TrackOutcome, iso_timestamp,
};
use crate::phone::normalize_phone_with;
use crate::resolver::{enrich, resolve_for_submission};
use crate::store::{AttributionStore, StoreKey};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use url::Url;

/// Destination of re-engagement pushes.
pub(crate) trait ReengagementSink: Send + Sync {
    fn push(
        &self,
        request: &ReengagementRequest,
    ) -> impl Future<Output = Result<ReengagementResponse>> + Send;
}

/// Posts re-engagement requests to the HTTP tracking endpoint.
#[derive(Debug, Clone)]
pub(crate) struct HttpReengagementSink {
    http_client: Client,
    endpoint: Url,
}

impl HttpReengagementSink {
    pub(crate) fn new(config: &Config) -> Result<Self> {
        let endpoint = Url::parse(&config.reengagement_endpoint)?;
        let http_client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AttributionError::Generic(anyhow::anyhow!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http_client, endpoint })
    }
}

impl ReengagementSink for HttpReengagementSink {
    async fn push(&self, request: &ReengagementRequest) -> Result<ReengagementResponse> {
        tracing::debug!(target: "reengagement_task", "POST {}", self.endpoint);
        let response = self
            .http_client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        let parsed = serde_json::from_str::<ReengagementResponse>(&body);
        if status.is_success() {
            return Ok(parsed?);
        }
        // Error responses from the API still carry `{ success, message }`.
        match parsed {
            Ok(parsed) if !parsed.success => Ok(parsed),
            _ => Err(AttributionError::Crm {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            }),
        }
    }
}

/// Email → last-tracked time (epoch millis), persisted as JSON in the durable tier.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct DedupLog {
    entries: BTreeMap<String, i64>,
}

impl DedupLog {
    /// Loads the log; a missing or corrupt entry yields an empty log.
    pub(crate) fn load(store: &AttributionStore) -> Self {
        let Some(raw) = store.get(StoreKey::ReengagementTracked) else {
            return Self::default();
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => Self { entries },
            Err(e) => {
                tracing::warn!(target: "reengagement_task", "Discarding unreadable de-duplication log: {}", e);
                Self::default()
            }
        }
    }

    pub(crate) fn save(&self, store: &AttributionStore) -> bool {
        match serde_json::to_string(&self.entries) {
            Ok(raw) => store.set(StoreKey::ReengagementTracked, &raw),
            Err(e) => {
                tracing::warn!(target: "reengagement_task", "Could not serialize de-duplication log: {}", e);
                false
            }
        }
    }

    pub(crate) fn tracked_within(&self, email: &str, now: DateTime<Utc>, window: Duration) -> bool {
        self.entries
            .get(email)
            .is_some_and(|&at| now.timestamp_millis() - at < window.num_milliseconds())
    }

    /// Records `email` at `now` and drops entries older than `retention`.
    pub(crate) fn record(&mut self, email: &str, now: DateTime<Utc>, retention: Duration) {
        let now_ms = now.timestamp_millis();
        let cutoff = now_ms - retention.num_milliseconds();
        self.entries.retain(|_, at| *at >= cutoff);
        self.entries.insert(email.to_string(), now_ms);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim().to_lowercase();
    (!email.is_empty()).then_some(email)
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

/// Client-side tracker bound to one visitor's attribution store.
pub(crate) struct ReengagementTracker<S> {
    store: AttributionStore,
    sink: S,
    dedup_window: Duration,
    dedup_retention: Duration,
}

impl<S: ReengagementSink> ReengagementTracker<S> {
    pub(crate) fn new(store: AttributionStore, sink: S, config: &Config) -> Self {
        Self {
            store,
            sink,
            dedup_window: config.dedup_window,
            dedup_retention: config.dedup_retention,
        }
    }

    /// Remembers the visitor's email for later interactions.
    pub(crate) fn store_email(&self, email: &str) -> bool {
        match normalize_email(email) {
            Some(email) => self.store.set(StoreKey::UserEmail, &email),
            None => false,
        }
    }

    pub(crate) fn stored_email(&self) -> Option<String> {
        self.store.get(StoreKey::UserEmail)
    }

    /// Cookie id first, then the id captured on an earlier page.
    fn client_id(&self, page: Option<&PageContext>) -> Option<String> {
        page.and_then(|p| client_id_from_cookies(&p.cookie_header))
            .or_else(|| self.store.get(StoreKey::GaClientId))
            .filter(|id| is_valid_client_id(id))
    }

    /// Pushes the visitor's current attribution unless the same email was
    /// already tracked within the de-duplication window.
    ///
    /// A suppressed call is `Ok` with `tracked == false`. Failures leave the
    /// de-duplication log untouched so the next interaction retries.
    pub(crate) async fn track_if_due(
        &self,
        identifier: &ContactIdentifier,
        source: ReengagementSource,
        page: Option<&PageContext>,
        now: DateTime<Utc>,
    ) -> Result<TrackOutcome> {
        if identifier.is_empty() {
            return Err(AttributionError::MissingIdentifier);
        }
        let ga_client_id = self.client_id(page).ok_or_else(|| {
            AttributionError::NotFound("Google Analytics client ID not available".to_string())
        })?;

        let email = identifier.email.as_deref().and_then(normalize_email);
        let mut log = DedupLog::load(&self.store);
        if let Some(email) = &email {
            if log.tracked_within(email, now, self.dedup_window) {
                tracing::debug!(target: "reengagement_task", "Re-engagement for {} already tracked recently", email);
                return Ok(TrackOutcome {
                    tracked: false,
                    message: "Already tracked within the last 24 hours".to_string(),
                    attribution_updated: None,
                });
            }
        }

        let payload = enrich(&resolve_for_submission(&self.store), page);
        let request = ReengagementRequest {
            identifier: ContactIdentifier {
                email: email.clone(),
                ..identifier.clone()
            },
            ga_client_id: Some(ga_client_id),
            utm_source: non_empty(payload.utm_source),
            utm_medium: non_empty(payload.utm_medium),
            utm_campaign: non_empty(payload.utm_campaign),
            utm_term: non_empty(payload.utm_term),
            utm_content: non_empty(payload.utm_content),
            reengagement_source: Some(source.as_str().to_string()),
            landing_page: non_empty(payload.landing_page),
            referrer: non_empty(payload.referrer),
        };

        let response = self.sink.push(&request).await.inspect_err(|e| {
            tracing::warn!(target: "reengagement_task", "Re-engagement push failed: {}", e);
        })?;
        if !response.success {
            tracing::warn!(target: "reengagement_task", "Re-engagement rejected: {}", response.message);
            return Err(AttributionError::Rejected(response.message));
        }

        if let Some(email) = &email {
            log.record(email, now, self.dedup_retention);
            log.save(&self.store);
        }
        self.store.set(StoreKey::LastReengagement, &iso_timestamp(now));
        tracing::info!(target: "reengagement_task", "Tracked {} re-engagement", source);

        Ok(TrackOutcome {
            tracked: true,
            message: response.message,
            attribution_updated: response.contact.map(|c| c.attribution_updated),
        })
    }

    /// Tracks using the stored email. `None` when no email is known.
    pub(crate) async fn check_and_track(
        &self,
        source: ReengagementSource,
        page: Option<&PageContext>,
        now: DateTime<Utc>,
    ) -> Option<Result<TrackOutcome>> {
        let email = self.stored_email()?;
        Some(
            self.track_if_due(&ContactIdentifier::email(&email), source, page, now)
                .await,
        )
    }

    /// Chat widget opened. A newly given email is stored before tracking.
    pub(crate) async fn on_chat_interaction(
        &self,
        email: Option<&str>,
        page: Option<&PageContext>,
        now: DateTime<Utc>,
    ) -> Option<Result<TrackOutcome>> {
        if let Some(email) = email {
            self.store_email(email);
        }
        self.check_and_track(ReengagementSource::Chat, page, now).await
    }

    /// Form submitted: the email is stored and the submission tracked.
    pub(crate) async fn on_form_submission(
        &self,
        email: &str,
        page: Option<&PageContext>,
        now: DateTime<Utc>,
    ) -> Result<TrackOutcome> {
        self.store_email(email);
        let identifier = ContactIdentifier::email(email);
        self.track_if_due(&identifier, ReengagementSource::Form, page, now).await
    }
}

/// Validates a re-engagement request and returns the parsed source.
fn validate_request(request: &ReengagementRequest) -> Result<(String, ReengagementSource)> {
    if request.identifier.is_empty() {
        return Err(AttributionError::MissingIdentifier);
    }
    let ga_client_id = request
        .ga_client_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AttributionError::Malformed("ga_client_id is required".to_string()))?;
    if !is_valid_client_id(ga_client_id) {
        return Err(AttributionError::Malformed(
            "Invalid ga_client_id format. Expected format: 1234567890.1234567890".to_string(),
        ));
    }
    let source = match request.reengagement_source.as_deref() {
        Some(s) => s.parse()?,
        None => ReengagementSource::Other,
    };
    Ok((ga_client_id.to_string(), source))
}

async fn find_contact<D: ContactDirectory>(
    directory: &D,
    identifier: &ContactIdentifier,
    country_code: &str,
) -> Result<Option<(ContactRef, CrmContact)>> {
    if let Some(email) = identifier.email.as_deref().and_then(normalize_email) {
        let target = ContactRef::Email(email);
        return Ok(directory.get_contact(&target).await?.map(|c| (target, c)));
    }
    if let Some(id) = identifier.contact_id {
        let target = ContactRef::Id(id);
        return Ok(directory.get_contact(&target).await?.map(|c| (target, c)));
    }
    let phone = identifier
        .phone
        .as_deref()
        .map(|p| normalize_phone_with(p, country_code))
        .unwrap_or_default();
    Ok(directory
        .find_by_phone(&phone)
        .await?
        .map(|c| (ContactRef::Id(c.id), c)))
}

/// Applies a re-engagement push to the CRM contact it identifies.
///
/// The client id is only replaced when the CRM has none or holds one that is
/// not in `digits.digits` form; a valid stored id belongs to the first device
/// and is kept.
pub(crate) async fn apply_reengagement<D: ContactDirectory>(
    directory: &D,
    request: &ReengagementRequest,
    country_code: &str,
    now: DateTime<Utc>,
) -> Result<ReengagementResponse> {
    let (ga_client_id, source) = validate_request(request)?;
    let (target, contact) = find_contact(directory, &request.identifier, country_code)
        .await?
        .ok_or_else(|| AttributionError::NotFound("Contact not found".to_string()))?;

    let previous = contact
        .attributes
        .get("GA_CLIENT_ID")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    let needs_update = previous.as_deref().is_none_or(|id| !is_valid_client_id(id));

    let mut attributes = Map::new();
    attributes.insert("REENGAGEMENT_DATE".to_string(), Value::from(iso_timestamp(now)));
    attributes.insert("REENGAGEMENT_SOURCE".to_string(), Value::from(source.as_str()));
    if needs_update {
        attributes.insert("GA_CLIENT_ID".to_string(), Value::from(ga_client_id.as_str()));
        attributes.insert("ATTRIBUTION_UPDATED".to_string(), Value::Bool(true));
        attributes.insert("NEEDS_ATTRIBUTION_UPDATE".to_string(), Value::Bool(false));
    }
    let optional = [
        ("UTM_SOURCE", &request.utm_source),
        ("UTM_MEDIUM", &request.utm_medium),
        ("UTM_CAMPAIGN", &request.utm_campaign),
        ("UTM_TERM", &request.utm_term),
        ("UTM_CONTENT", &request.utm_content),
        ("LANDING_PAGE", &request.landing_page),
        ("REFERRER", &request.referrer),
    ];
    for (key, value) in optional {
        if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
            attributes.insert(key.to_string(), Value::from(value));
        }
    }

    directory.update_contact(&target, attributes).await?;
    tracing::info!(target: "reengagement_task",
        "Recorded {} re-engagement for contact #{} (client id updated: {})",
        source, contact.id, needs_update
    );

    Ok(ReengagementResponse {
        success: true,
        message: if needs_update {
            "Re-engagement tracked and attribution updated".to_string()
        } else {
            "Re-engagement tracked".to_string()
        },
        contact: Some(ReengagedContact {
            email: contact.email.clone(),
            id: Some(contact.id),
            attribution_updated: needs_update,
            previous_ga_client_id: previous,
            new_ga_client_id: needs_update.then_some(ga_client_id),
        }),
    })
}
