//! CRM contact API client and the attribute names it stores attribution under.

use crate::config::Config;
use crate::error::{AttributionError, Result};
use crate::models::{AttributionPayload, ContactRef, CrmContact};
use crate::phone::same_identity;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use url::Url;

/// Finds an existing contact by normalized phone number.
pub(crate) trait ContactLookup: Send + Sync {
    fn find_by_phone(
        &self,
        normalized_phone: &str,
    ) -> impl Future<Output = Result<Option<CrmContact>>> + Send;
}

/// Read and write access to CRM contacts.
pub(crate) trait ContactDirectory: ContactLookup {
    fn get_contact(&self, contact: &ContactRef) -> impl Future<Output = Result<Option<CrmContact>>> + Send;

    fn update_contact(
        &self,
        contact: &ContactRef,
        attributes: Map<String, Value>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Creates a contact and returns its id.
    fn create_contact(
        &self,
        email: &str,
        attributes: Map<String, Value>,
    ) -> impl Future<Output = Result<i64>> + Send;
}

/// Maps an attribution payload onto the CRM's upper-case attribute names.
///
/// Empty last-touch term/content are left out so they do not blank values the
/// CRM already holds.
pub(crate) fn attribution_attributes(payload: &AttributionPayload) -> Map<String, Value> {
    let mut attributes = Map::new();
    let mut put = |key: &str, value: &str| {
        attributes.insert(key.to_string(), Value::String(value.to_string()));
    };

    put("UTM_SOURCE", &payload.utm_source);
    put("UTM_MEDIUM", &payload.utm_medium);
    put("UTM_CAMPAIGN", &payload.utm_campaign);
    if !payload.utm_term.is_empty() {
        put("UTM_TERM", &payload.utm_term);
    }
    if !payload.utm_content.is_empty() {
        put("UTM_CONTENT", &payload.utm_content);
    }
    put("FIRST_TOUCH_SOURCE", &payload.first_touch_source);
    put("FIRST_TOUCH_MEDIUM", &payload.first_touch_medium);
    put("FIRST_TOUCH_CAMPAIGN", &payload.first_touch_campaign);
    put("FIRST_TOUCH_TERM", &payload.first_touch_term);
    put("FIRST_TOUCH_CONTENT", &payload.first_touch_content);
    put("FIRST_TOUCH_TIMESTAMP", &payload.first_touch_timestamp);
    put("FIRST_TOUCH_REFERRER", &payload.first_touch_referrer);
    put("GA_CLIENT_ID", &payload.ga_client_id);
    put("LANDING_PAGE", &payload.landing_page);
    put("REFERRER", &payload.referrer);
    attributes
}

#[derive(Deserialize, Debug, Default)]
struct ContactList {
    #[serde(default)]
    contacts: Vec<CrmContact>,
}

#[derive(Deserialize, Debug)]
struct CreatedContact {
    id: i64,
}

#[derive(Deserialize, Debug, Default)]
struct CrmErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// Brevo v3 contacts client.
#[derive(Debug, Clone)]
pub(crate) struct BrevoClient {
    http_client: Arc<Client>,
    base_url: Url,
    api_key: String,
    scan_limit: u32,
    country_code: String,
}

impl BrevoClient {
    /// Creates a client with the configured timeout. Fails without an API key.
    pub(crate) fn new(config: &Config) -> Result<Self> {
        let api_key = config
            .crm_api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AttributionError::Config("CRM API key is not configured".to_string()))?;

        let http_client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AttributionError::Generic(anyhow::anyhow!("Failed to build HTTP client: {}", e)))?;

        Self::with_client(http_client, &config.crm_base_url, api_key, config)
    }

    fn with_client(http_client: Client, base_url: &str, api_key: String, config: &Config) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(AttributionError::Config(format!(
                "CRM base URL cannot be a base: {}",
                base_url
            )));
        }
        Ok(Self {
            http_client: Arc::new(http_client),
            base_url,
            api_key,
            scan_limit: config.contact_scan_limit,
            country_code: config.country_code.clone(),
        })
    }

    /// Builds `<base>/<segments...>`, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AttributionError::Config(format!("CRM base URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn contact_endpoint(&self, contact: &ContactRef) -> Result<Url> {
        match contact {
            ContactRef::Email(email) => self.endpoint(&["contacts", email.as_str()]),
            ContactRef::Id(id) => self.endpoint(&["contacts", &id.to_string()]),
        }
    }

    /// Turns a non-success response into `AttributionError::Crm`.
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let parsed: CrmErrorBody = serde_json::from_str(&body).unwrap_or_default();
        let message = parsed
            .message
            .or(parsed.code)
            .unwrap_or_else(|| body.chars().take(200).collect());
        Err(AttributionError::Crm {
            status: status.as_u16(),
            message,
        })
    }
}

impl ContactLookup for BrevoClient {
    async fn find_by_phone(&self, normalized_phone: &str) -> Result<Option<CrmContact>> {
        if normalized_phone.is_empty() {
            return Ok(None);
        }

        let mut url = self.endpoint(&["contacts"])?;
        url.query_pairs_mut()
            .append_pair("limit", &self.scan_limit.to_string())
            .append_pair("sort", "id:desc");

        tracing::debug!(target: "crm_task", "Scanning {} recent contacts for phone {}", self.scan_limit, normalized_phone);
        let response = self
            .http_client
            .get(url)
            .header("api-key", &self.api_key)
            .header("accept", "application/json")
            .send()
            .await?;
        let list: ContactList = Self::check(response).await?.json().await?;

        let found = list.contacts.into_iter().find(|contact| {
            contact
                .attributes
                .get("SMS")
                .and_then(Value::as_str)
                .is_some_and(|sms| same_identity(sms, normalized_phone, &self.country_code))
        });

        match &found {
            Some(contact) => {
                tracing::info!(target: "crm_task", "Matched phone {} to contact #{}", normalized_phone, contact.id)
            }
            None => tracing::debug!(target: "crm_task", "No contact matched phone {}", normalized_phone),
        }
        Ok(found)
    }
}

impl ContactDirectory for BrevoClient {
    async fn get_contact(&self, contact: &ContactRef) -> Result<Option<CrmContact>> {
        let response = self
            .http_client
            .get(self.contact_endpoint(contact)?)
            .header("api-key", &self.api_key)
            .header("accept", "application/json")
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(target: "crm_task", "Contact {} not found", contact);
            return Ok(None);
        }
        let found: CrmContact = Self::check(response).await?.json().await?;
        Ok(Some(found))
    }

    async fn update_contact(&self, contact: &ContactRef, attributes: Map<String, Value>) -> Result<()> {
        let body = serde_json::json!({ "attributes": attributes });
        let response = self
            .http_client
            .put(self.contact_endpoint(contact)?)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await.inspect_err(|e| {
            tracing::error!(target: "crm_task", "Updating contact {} failed: {}", contact, e);
        })?;
        tracing::info!(target: "crm_task", "Updated contact {}", contact);
        Ok(())
    }

    async fn create_contact(&self, email: &str, attributes: Map<String, Value>) -> Result<i64> {
        let body = serde_json::json!({
            "email": email,
            "attributes": attributes,
            "updateEnabled": false,
        });
        let response = self
            .http_client
            .post(self.endpoint(&["contacts"])?)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = Self::check(response).await.inspect_err(|e| {
            tracing::error!(target: "crm_task", "Creating contact {} failed: {}", email, e);
        })?;
        let created: CreatedContact = response.json().await?;
        tracing::info!(target: "crm_task", "Created contact #{} for {}", created.id, email);
        Ok(created.id)
    }
}
