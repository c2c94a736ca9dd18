//! Defines the core data structures used in the lead-attribution application.

use crate::error::AttributionError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Referrer recorded when a session starts without an HTTP referrer.
pub(crate) const DIRECT_REFERRER: &str = "Direct";

/// Formats a timestamp the way browsers render `Date.toISOString()`.
pub(crate) fn iso_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The journey of a single visitor: last-touch marketing parameters for the
/// current session plus the write-once first-touch parameters.
///
/// Every field is optional; absence means nothing was captured. Serialized
/// with the field names used on outbound lead payloads.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct AttributionRecord {
    #[serde(rename = "utm_source", skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "utm_medium", skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    #[serde(rename = "utm_campaign", skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
    #[serde(rename = "utm_term", skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
    #[serde(rename = "utm_content", skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// First URL of the current session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landing_page: Option<String>,
    /// HTTP referrer of the current session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    /// Start of the current session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_visit: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_touch_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_touch_medium: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_touch_campaign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_touch_term: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_touch_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_touch_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_touch_referrer: Option<String>,

    /// Durable analytics client id used to stitch sessions together.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ga_client_id: Option<String>,
}

impl AttributionRecord {
    /// Flattens the record into the outbound payload, leaving absent fields empty.
    ///
    /// No defaults are applied here; see `resolver::enrich` for that.
    pub(crate) fn to_payload(&self) -> AttributionPayload {
        let text = |value: &Option<String>| value.clone().unwrap_or_default();
        AttributionPayload {
            utm_source: text(&self.source),
            utm_medium: text(&self.medium),
            utm_campaign: text(&self.campaign),
            utm_term: text(&self.term),
            utm_content: text(&self.content),
            first_touch_source: text(&self.first_touch_source),
            first_touch_medium: text(&self.first_touch_medium),
            first_touch_campaign: text(&self.first_touch_campaign),
            first_touch_term: text(&self.first_touch_term),
            first_touch_content: text(&self.first_touch_content),
            first_touch_timestamp: text(&self.first_touch_timestamp),
            first_touch_referrer: text(&self.first_touch_referrer),
            ga_client_id: text(&self.ga_client_id),
            landing_page: text(&self.landing_page),
            referrer: text(&self.referrer),
        }
    }
}

/// The complete attribution block attached to lead-creation calls.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct AttributionPayload {
    pub utm_source: String,
    pub utm_medium: String,
    pub utm_campaign: String,
    pub utm_term: String,
    pub utm_content: String,
    pub first_touch_source: String,
    pub first_touch_medium: String,
    pub first_touch_campaign: String,
    pub first_touch_term: String,
    pub first_touch_content: String,
    pub first_touch_timestamp: String,
    pub first_touch_referrer: String,
    pub ga_client_id: String,
    pub landing_page: String,
    pub referrer: String,
}

/// What the browser exposes about the page being viewed.
#[derive(Debug, Clone)]
pub(crate) struct PageContext {
    /// The current page URL, query string included.
    pub url: Url,
    /// The HTTP referrer; `None` when the visit was direct.
    pub referrer: Option<String>,
    /// Raw `Cookie` header (`name=value; name2=value2`).
    pub cookie_header: String,
}

impl PageContext {
    pub(crate) fn new(url: Url, referrer: Option<String>, cookie_header: Option<String>) -> Self {
        Self {
            url,
            referrer: referrer.filter(|r| !r.trim().is_empty()),
            cookie_header: cookie_header.unwrap_or_default(),
        }
    }

    /// Parses a page URL given on the command line or in a request body.
    pub(crate) fn parse(
        url: &str,
        referrer: Option<String>,
        cookie_header: Option<String>,
    ) -> crate::error::Result<Self> {
        let url = Url::parse(url)?;
        Ok(Self::new(url, referrer, cookie_header))
    }

    pub(crate) fn has_referrer(&self) -> bool {
        self.referrer.is_some()
    }

    /// The referrer as recorded for a session, `"Direct"` when there was none.
    pub(crate) fn referrer_or_direct(&self) -> String {
        self.referrer
            .clone()
            .unwrap_or_else(|| DIRECT_REFERRER.to_string())
    }
}

/// A contact as returned by the CRM. Attributes are a loosely typed bag whose
/// keys vary with the age of the contact.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub(crate) struct CrmContact {
    pub id: i64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

/// How to address a contact in the CRM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ContactRef {
    Email(String),
    Id(i64),
}

impl fmt::Display for ContactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContactRef::Email(email) => write!(f, "{}", email),
            ContactRef::Id(id) => write!(f, "ID:{}", id),
        }
    }
}

/// A lead that arrived over WhatsApp.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WhatsAppLead {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub course_name: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// The attribution decided for a WhatsApp lead.
#[derive(Debug)]
pub(crate) struct WhatsAppAttribution {
    /// True when no existing contact matched the phone number.
    pub is_new: bool,
    pub attribution: AttributionRecord,
    pub existing_contact_id: Option<i64>,
    /// Set when the contact lookup failed and the lead was treated as new.
    pub lookup_error: Option<AttributionError>,
}

/// Result of pushing a WhatsApp lead into the CRM.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WhatsAppLeadOutcome {
    pub success: bool,
    pub is_new: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<i64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribution_data: Option<AttributionPayload>,
}

/// Output row of the backfill command, combining the input lead and its outcome.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct LeadProcessingResult {
    #[serde(flatten)]
    pub lead: WhatsAppLead,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WhatsAppLeadOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The interaction that signalled a returning visitor.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ReengagementSource {
    Chat,
    Form,
    Whatsapp,
    PageView,
    Other,
}

impl ReengagementSource {
    pub(crate) const ALL: [ReengagementSource; 5] = [
        ReengagementSource::Chat,
        ReengagementSource::Form,
        ReengagementSource::Whatsapp,
        ReengagementSource::PageView,
        ReengagementSource::Other,
    ];

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ReengagementSource::Chat => "chat",
            ReengagementSource::Form => "form",
            ReengagementSource::Whatsapp => "whatsapp",
            ReengagementSource::PageView => "page_view",
            ReengagementSource::Other => "other",
        }
    }
}

impl fmt::Display for ReengagementSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReengagementSource {
    type Err = AttributionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReengagementSource::ALL
            .iter()
            .copied()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = ReengagementSource::ALL.iter().map(|s| s.as_str()).collect();
                AttributionError::Malformed(format!(
                    "Invalid reengagement_source '{}'. Must be one of: {}",
                    s,
                    valid.join(", ")
                ))
            })
    }
}

/// Identifies a contact for re-engagement. At least one field must be set.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ContactIdentifier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, rename = "contactId", skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<i64>,
}

impl ContactIdentifier {
    pub(crate) fn email(email: &str) -> Self {
        Self {
            email: Some(email.to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.email.as_deref().is_none_or(str::is_empty)
            && self.phone.as_deref().is_none_or(str::is_empty)
            && self.contact_id.is_none()
    }
}

/// Body of the "track re-engagement" call.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct ReengagementRequest {
    #[serde(flatten)]
    pub identifier: ContactIdentifier,
    #[serde(default)]
    pub ga_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_term: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_content: Option<String>,
    /// Kept as text so the server can report an invalid value instead of
    /// failing body deserialization.
    #[serde(default)]
    pub reengagement_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landing_page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
}

/// Response of the "track re-engagement" call.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct ReengagementResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ReengagedContact>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReengagedContact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub attribution_updated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_ga_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_ga_client_id: Option<String>,
}

/// Outcome of a successful `track_if_due` call.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct TrackOutcome {
    /// False when the call was suppressed by the 24 hour de-duplication.
    pub tracked: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribution_updated: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_with_payload_field_names() {
        let record = AttributionRecord {
            source: Some("google".to_string()),
            first_touch_medium: Some("cpc".to_string()),
            ..AttributionRecord::default()
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["utm_source"], "google");
        assert_eq!(json["first_touch_medium"], "cpc");
        assert!(json.get("utm_medium").is_none());
    }

    #[test]
    fn test_to_payload_leaves_absent_fields_empty() {
        let payload = AttributionRecord::default().to_payload();
        assert_eq!(payload, AttributionPayload::default());
    }

    #[test]
    fn test_reengagement_source_parsing() {
        assert_eq!(
            "page_view".parse::<ReengagementSource>().unwrap(),
            ReengagementSource::PageView
        );
        assert!("sms".parse::<ReengagementSource>().is_err());
        assert_eq!(ReengagementSource::Whatsapp.to_string(), "whatsapp");
    }

    #[test]
    fn test_contact_identifier_emptiness() {
        assert!(ContactIdentifier::default().is_empty());
        assert!(
            ContactIdentifier {
                email: Some(String::new()),
                ..ContactIdentifier::default()
            }
            .is_empty()
        );
        assert!(!ContactIdentifier::email("a@b.com").is_empty());
        assert!(
            !ContactIdentifier {
                contact_id: Some(7),
                ..ContactIdentifier::default()
            }
            .is_empty()
        );
    }

    #[test]
    fn test_reengagement_request_wire_format() {
        let body = r#"{"email":"a@b.com","contactId":12,"ga_client_id":"1.2","reengagement_source":"chat"}"#;
        let request: ReengagementRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.identifier.email.as_deref(), Some("a@b.com"));
        assert_eq!(request.identifier.contact_id, Some(12));
        assert_eq!(request.reengagement_source.as_deref(), Some("chat"));
    }

    #[test]
    fn test_page_context_drops_blank_referrer() {
        let page = PageContext::parse("https://example.com/", Some("  ".to_string()), None).unwrap();
        assert!(!page.has_referrer());
        assert_eq!(page.referrer_or_direct(), "Direct");
    }
}
