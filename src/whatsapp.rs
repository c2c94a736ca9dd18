//! Multi-touch attribution for leads that arrive over WhatsApp.
//!
//! A WhatsApp message is always the last touch. When the sender already exists
//! in the CRM (matched by normalized phone), whatever first touch the CRM holds
//! for them is carried over untouched: a paid campaign that first brought the
//! visitor in keeps the credit even when the conversion happens in a chat.

use crate::config::Config;
use crate::crm::{ContactDirectory, ContactLookup, attribution_attributes};
use crate::error::{AttributionError, Result};
use crate::models::{
    AttributionRecord, ContactRef, CrmContact, WhatsAppAttribution, WhatsAppLead,
    WhatsAppLeadOutcome, iso_timestamp,
};
use crate::phone::normalize_phone_with;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

pub(crate) const WHATSAPP_SOURCE: &str = "whatsapp";
pub(crate) const WHATSAPP_MEDIUM: &str = "messaging";
pub(crate) const WHATSAPP_CAMPAIGN: &str = "whatsapp-organic";
pub(crate) const WHATSAPP_LANDING_PAGE: &str = "WhatsApp Chat";
pub(crate) const WHATSAPP_REFERRER: &str = "WhatsApp Business";

/// Read access to a CRM attribute bag whose key names vary by contact age.
struct AttributeBag<'a>(&'a HashMap<String, Value>);

impl AttributeBag<'_> {
    /// First non-empty value among `keys`, in order.
    fn first_present(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| match self.0.get(*key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    fn text(&self, keys: &[&str]) -> String {
        self.first_present(keys).unwrap_or_default()
    }
}

// Precedence for each preserved field. Explicit first-touch attributes win;
// contacts created before first-touch tracking only carry last-touch UTM
// attributes, which are then the best record of how they arrived.

pub(crate) fn resolve_first_touch_source(attrs: &HashMap<String, Value>) -> String {
    AttributeBag(attrs).text(&["FIRST_TOUCH_SOURCE", "UTM_SOURCE"])
}

pub(crate) fn resolve_first_touch_medium(attrs: &HashMap<String, Value>) -> String {
    AttributeBag(attrs).text(&["FIRST_TOUCH_MEDIUM", "UTM_MEDIUM"])
}

pub(crate) fn resolve_first_touch_campaign(attrs: &HashMap<String, Value>) -> String {
    AttributeBag(attrs).text(&["FIRST_TOUCH_CAMPAIGN", "UTM_CAMPAIGN"])
}

pub(crate) fn resolve_first_touch_term(attrs: &HashMap<String, Value>) -> String {
    AttributeBag(attrs).text(&["FIRST_TOUCH_TERM", "UTM_TERM"])
}

pub(crate) fn resolve_first_touch_content(attrs: &HashMap<String, Value>) -> String {
    AttributeBag(attrs).text(&["FIRST_TOUCH_CONTENT", "UTM_CONTENT"])
}

/// No fallback: a last-touch time says nothing about the first visit.
pub(crate) fn resolve_first_touch_timestamp(attrs: &HashMap<String, Value>) -> String {
    AttributeBag(attrs).text(&["FIRST_TOUCH_TIMESTAMP"])
}

/// Legacy contacts only have the plain `REFERRER` from their original visit.
pub(crate) fn resolve_first_touch_referrer(attrs: &HashMap<String, Value>) -> String {
    AttributeBag(attrs).text(&["FIRST_TOUCH_REFERRER", "REFERRER"])
}

pub(crate) fn resolve_ga_client_id(attrs: &HashMap<String, Value>) -> String {
    AttributeBag(attrs).text(&["GA_CLIENT_ID"])
}

pub(crate) fn resolve_landing_page(attrs: &HashMap<String, Value>) -> String {
    AttributeBag(attrs)
        .first_present(&["LANDING_PAGE"])
        .unwrap_or_else(|| WHATSAPP_LANDING_PAGE.to_string())
}

/// Attribution for a contact the CRM has never seen: WhatsApp is the last
/// touch, and the first-touch fields stay empty.
pub(crate) fn new_contact_attribution() -> AttributionRecord {
    AttributionRecord {
        source: Some(WHATSAPP_SOURCE.to_string()),
        medium: Some(WHATSAPP_MEDIUM.to_string()),
        campaign: Some(WHATSAPP_CAMPAIGN.to_string()),
        landing_page: Some(WHATSAPP_LANDING_PAGE.to_string()),
        referrer: Some(WHATSAPP_REFERRER.to_string()),
        ..AttributionRecord::default()
    }
}

/// Attribution for a returning contact: WhatsApp as last touch, everything
/// the CRM knows about the first touch and the client id preserved verbatim.
pub(crate) fn returning_contact_attribution(contact: &CrmContact) -> AttributionRecord {
    let attrs = &contact.attributes;
    AttributionRecord {
        first_touch_source: Some(resolve_first_touch_source(attrs)),
        first_touch_medium: Some(resolve_first_touch_medium(attrs)),
        first_touch_campaign: Some(resolve_first_touch_campaign(attrs)),
        first_touch_term: Some(resolve_first_touch_term(attrs)),
        first_touch_content: Some(resolve_first_touch_content(attrs)),
        first_touch_timestamp: Some(resolve_first_touch_timestamp(attrs)),
        first_touch_referrer: Some(resolve_first_touch_referrer(attrs)),
        ga_client_id: Some(resolve_ga_client_id(attrs)),
        landing_page: Some(resolve_landing_page(attrs)),
        ..new_contact_attribution()
    }
}

/// Decides the attribution for a WhatsApp lead by looking the sender up by phone.
///
/// A failed lookup never fails the lead: it is treated as a new contact and
/// the error is handed back in `lookup_error` for the caller to log.
pub(crate) async fn attribute_whatsapp_lead<L: ContactLookup>(
    lead: &WhatsAppLead,
    lookup: &L,
    country_code: &str,
) -> WhatsAppAttribution {
    let phone = normalize_phone_with(&lead.phone, country_code);
    if phone.is_empty() {
        tracing::warn!(target: "whatsapp_task", "Lead has no usable phone number; treating as new contact.");
        return WhatsAppAttribution {
            is_new: true,
            attribution: new_contact_attribution(),
            existing_contact_id: None,
            lookup_error: None,
        };
    }

    match lookup.find_by_phone(&phone).await {
        Ok(Some(contact)) => {
            tracing::info!(target: "whatsapp_task",
                "Returning contact #{} for {}; preserving first touch.", contact.id, phone
            );
            WhatsAppAttribution {
                is_new: false,
                attribution: returning_contact_attribution(&contact),
                existing_contact_id: Some(contact.id),
                lookup_error: None,
            }
        }
        Ok(None) => {
            tracing::info!(target: "whatsapp_task", "New WhatsApp contact {}.", phone);
            WhatsAppAttribution {
                is_new: true,
                attribution: new_contact_attribution(),
                existing_contact_id: None,
                lookup_error: None,
            }
        }
        Err(e) => {
            tracing::debug!(target: "whatsapp_task", "Contact lookup for {} failed: {}", phone, e);
            WhatsAppAttribution {
                is_new: true,
                attribution: new_contact_attribution(),
                existing_contact_id: None,
                lookup_error: Some(e),
            }
        }
    }
}

/// Checks required lead fields and returns the normalized phone.
pub(crate) fn validate_lead(lead: &WhatsAppLead, country_code: &str) -> Result<String> {
    let mut missing = Vec::new();
    if lead.first_name.trim().is_empty() {
        missing.push("firstName");
    }
    if lead.last_name.trim().is_empty() {
        missing.push("lastName");
    }
    if lead.phone.trim().is_empty() {
        missing.push("phone");
    }
    if lead.course_name.trim().is_empty() {
        missing.push("courseName");
    }
    if !missing.is_empty() {
        return Err(AttributionError::Malformed(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )));
    }

    let phone = normalize_phone_with(&lead.phone, country_code);
    if phone.is_empty() {
        return Err(AttributionError::Malformed("Invalid phone number format".to_string()));
    }
    Ok(phone)
}

fn contact_attributes(
    lead: &WhatsAppLead,
    phone: &str,
    attribution: &AttributionRecord,
) -> serde_json::Map<String, Value> {
    let mut attributes = attribution_attributes(&attribution.to_payload());
    attributes.insert("FIRSTNAME".to_string(), Value::from(lead.first_name.trim()));
    attributes.insert("LASTNAME".to_string(), Value::from(lead.last_name.trim()));
    attributes.insert("SMS".to_string(), Value::from(phone));
    attributes.insert("PREFERRED_COURSE".to_string(), Value::from(lead.course_name.trim()));
    attributes
}

/// Full WhatsApp lead flow: attribute the lead, then either update the
/// existing contact or create a new one whose first touch is WhatsApp.
///
/// Validation failures and CRM write failures are returned as errors; a
/// failed lookup only downgrades the lead to "new".
pub(crate) async fn process_whatsapp_lead<D: ContactDirectory>(
    lead: &WhatsAppLead,
    directory: &D,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<WhatsAppLeadOutcome> {
    let phone = validate_lead(lead, &config.country_code)?;
    let decided = attribute_whatsapp_lead(lead, directory, &config.country_code).await;
    if let Some(e) = &decided.lookup_error {
        tracing::warn!(target: "whatsapp_task", "Treating {} as a new contact after failed lookup: {}", phone, e);
    }

    if let Some(contact_id) = decided.existing_contact_id.filter(|_| !decided.is_new) {
        let attributes = contact_attributes(lead, &phone, &decided.attribution);
        directory
            .update_contact(&ContactRef::Id(contact_id), attributes)
            .await?;
        return Ok(WhatsAppLeadOutcome {
            success: true,
            is_new: false,
            contact_id: Some(contact_id),
            message: format!("Contact #{} updated with WhatsApp attribution", contact_id),
            attribution_data: Some(decided.attribution.to_payload()),
        });
    }

    // No prior visit on record, so this message is also the first touch.
    let attribution = AttributionRecord {
        first_touch_source: Some(WHATSAPP_SOURCE.to_string()),
        first_touch_medium: Some(WHATSAPP_MEDIUM.to_string()),
        first_touch_campaign: Some(WHATSAPP_CAMPAIGN.to_string()),
        first_touch_timestamp: Some(iso_timestamp(now)),
        ..decided.attribution
    };
    let mut attributes = contact_attributes(lead, &phone, &attribution);
    attributes.insert("SOURCE".to_string(), Value::from(WHATSAPP_SOURCE));
    attributes.insert("CONTACT_STATUS".to_string(), Value::from("lead"));

    let email = lead
        .email
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("whatsapp-{}@{}", phone, config.whatsapp_email_domain));

    let contact_id = directory.create_contact(&email, attributes).await?;
    Ok(WhatsAppLeadOutcome {
        success: true,
        is_new: true,
        contact_id: Some(contact_id),
        message: "New WhatsApp contact created successfully".to_string(),
        attribution_data: Some(attribution.to_payload()),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::phone::{DEFAULT_COUNTRY_CODE, same_identity};
    use chrono::TimeZone;
    use serde_json::{Map, json};
    use std::sync::Mutex;

    /// In-memory CRM used by the WhatsApp and API tests.
    #[derive(Default)]
    pub(crate) struct FakeDirectory {
        pub contacts: Mutex<Vec<CrmContact>>,
        pub updates: Mutex<Vec<(ContactRef, Map<String, Value>)>>,
        pub created: Mutex<Vec<(String, Map<String, Value>)>>,
        pub lookups: Mutex<Vec<String>>,
        pub fail_lookup: bool,
        pub fail_writes: bool,
    }

    fn write_error() -> AttributionError {
        AttributionError::Crm {
            status: 500,
            message: "write failed".to_string(),
        }
    }

    impl FakeDirectory {
        pub(crate) fn with_contact(contact: CrmContact) -> Self {
            Self {
                contacts: Mutex::new(vec![contact]),
                ..Self::default()
            }
        }
    }

    impl ContactLookup for FakeDirectory {
        async fn find_by_phone(&self, normalized_phone: &str) -> Result<Option<CrmContact>> {
            self.lookups.lock().unwrap().push(normalized_phone.to_string());
            if self.fail_lookup {
                return Err(AttributionError::Crm {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            let contacts = self.contacts.lock().unwrap();
            Ok(contacts
                .iter()
                .find(|c| {
                    c.attributes
                        .get("SMS")
                        .and_then(Value::as_str)
                        .is_some_and(|sms| same_identity(sms, normalized_phone, DEFAULT_COUNTRY_CODE))
                })
                .cloned())
        }
    }

    impl ContactDirectory for FakeDirectory {
        async fn get_contact(&self, contact: &ContactRef) -> Result<Option<CrmContact>> {
            let contacts = self.contacts.lock().unwrap();
            Ok(contacts
                .iter()
                .find(|c| match contact {
                    ContactRef::Email(email) => c.email.as_deref() == Some(email.as_str()),
                    ContactRef::Id(id) => c.id == *id,
                })
                .cloned())
        }

        async fn update_contact(&self, contact: &ContactRef, attributes: Map<String, Value>) -> Result<()> {
            if self.fail_writes {
                return Err(write_error());
            }
            self.updates.lock().unwrap().push((contact.clone(), attributes));
            Ok(())
        }

        async fn create_contact(&self, email: &str, attributes: Map<String, Value>) -> Result<i64> {
            if self.fail_writes {
                return Err(write_error());
            }
            let mut created = self.created.lock().unwrap();
            created.push((email.to_string(), attributes));
            Ok(1000 + created.len() as i64)
        }
    }

    pub(crate) fn contact(id: i64, attributes: Value) -> CrmContact {
        let attributes = match attributes {
            Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        };
        CrmContact {
            id,
            email: Some(format!("contact{}@example.com", id)),
            attributes,
        }
    }

    fn lead(phone: &str) -> WhatsAppLead {
        WhatsAppLead {
            first_name: "Jane".to_string(),
            last_name: "Wanjiru".to_string(),
            email: None,
            phone: phone.to_string(),
            course_name: "Music Production Diploma".to_string(),
            message: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_new_contact_attribution() {
        let directory = FakeDirectory::default();
        let result = attribute_whatsapp_lead(&lead("0711486581"), &directory, DEFAULT_COUNTRY_CODE).await;

        assert!(result.is_new);
        assert_eq!(result.existing_contact_id, None);
        assert_eq!(*directory.lookups.lock().unwrap(), vec!["254711486581".to_string()]);
        let payload = result.attribution.to_payload();
        assert_eq!(payload.utm_source, "whatsapp");
        assert_eq!(payload.utm_medium, "messaging");
        assert_eq!(payload.utm_campaign, "whatsapp-organic");
        assert_eq!(payload.landing_page, "WhatsApp Chat");
        assert_eq!(payload.referrer, "WhatsApp Business");
        assert_eq!(payload.first_touch_source, "");
        assert_eq!(payload.first_touch_timestamp, "");
    }

    #[tokio::test]
    async fn test_returning_contact_keeps_paid_first_touch() {
        let directory = FakeDirectory::with_contact(contact(
            77,
            json!({
                "SMS": "+254 711 486 581",
                "FIRST_TOUCH_SOURCE": "google",
                "FIRST_TOUCH_MEDIUM": "cpc",
                "FIRST_TOUCH_CAMPAIGN": "diploma-2026",
                "GA_CLIENT_ID": "1234567890.9876543210",
                "UTM_SOURCE": "facebook",
            }),
        ));

        let result = attribute_whatsapp_lead(&lead("0711486581"), &directory, DEFAULT_COUNTRY_CODE).await;

        assert!(!result.is_new);
        assert_eq!(result.existing_contact_id, Some(77));
        let payload = result.attribution.to_payload();
        assert_eq!(payload.utm_source, "whatsapp");
        assert_eq!(payload.first_touch_source, "google");
        assert_eq!(payload.first_touch_medium, "cpc");
        assert_eq!(payload.first_touch_campaign, "diploma-2026");
        assert_eq!(payload.ga_client_id, "1234567890.9876543210");
        assert_eq!(payload.referrer, "WhatsApp Business");
        assert_eq!(payload.landing_page, "WhatsApp Chat");
    }

    #[test]
    fn test_legacy_contact_falls_back_to_last_touch_fields() {
        let legacy = contact(
            5,
            json!({
                "UTM_SOURCE": "google",
                "UTM_MEDIUM": "cpc",
                "UTM_CAMPAIGN": "intake-jan",
                "REFERRER": "https://www.google.com/",
                "LANDING_PAGE": "https://example.com/diploma",
                "FIRST_TOUCH_TERM": "",
            }),
        );
        let record = returning_contact_attribution(&legacy);
        assert_eq!(record.first_touch_source.as_deref(), Some("google"));
        assert_eq!(record.first_touch_medium.as_deref(), Some("cpc"));
        assert_eq!(record.first_touch_campaign.as_deref(), Some("intake-jan"));
        assert_eq!(record.first_touch_term.as_deref(), Some(""));
        assert_eq!(record.first_touch_timestamp.as_deref(), Some(""));
        assert_eq!(
            record.first_touch_referrer.as_deref(),
            Some("https://www.google.com/")
        );
        assert_eq!(record.referrer.as_deref(), Some("WhatsApp Business"));
        assert_eq!(
            record.landing_page.as_deref(),
            Some("https://example.com/diploma")
        );
    }

    #[test]
    fn test_explicit_first_touch_referrer_wins() {
        let attrs: HashMap<String, Value> = [
            ("FIRST_TOUCH_REFERRER".to_string(), json!("https://ads.example/")),
            ("REFERRER".to_string(), json!("WhatsApp Business")),
        ]
        .into_iter()
        .collect();
        assert_eq!(resolve_first_touch_referrer(&attrs), "https://ads.example/");
    }

    #[tokio::test]
    async fn test_lookup_failure_degrades_to_new_contact() {
        let directory = FakeDirectory {
            fail_lookup: true,
            ..FakeDirectory::default()
        };
        let result = attribute_whatsapp_lead(&lead("0711486581"), &directory, DEFAULT_COUNTRY_CODE).await;
        assert!(result.is_new);
        assert!(matches!(result.lookup_error, Some(AttributionError::Crm { status: 503, .. })));
        assert_eq!(result.attribution.source.as_deref(), Some("whatsapp"));
    }

    #[tokio::test]
    async fn test_process_updates_returning_contact() {
        let directory = FakeDirectory::with_contact(contact(
            9,
            json!({ "SMS": "254711486581", "FIRST_TOUCH_SOURCE": "google", "FIRST_TOUCH_MEDIUM": "cpc" }),
        ));
        let outcome = process_whatsapp_lead(&lead("+254711486581"), &directory, &Config::default(), now())
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(!outcome.is_new);
        assert_eq!(outcome.contact_id, Some(9));
        let updates = directory.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        let (target, attributes) = &updates[0];
        assert_eq!(target, &ContactRef::Id(9));
        assert_eq!(attributes["UTM_SOURCE"], "whatsapp");
        assert_eq!(attributes["FIRST_TOUCH_SOURCE"], "google");
        assert_eq!(attributes["FIRST_TOUCH_MEDIUM"], "cpc");
        assert_eq!(attributes["SMS"], "254711486581");
        assert_eq!(attributes["PREFERRED_COURSE"], "Music Production Diploma");
        assert!(directory.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_process_creates_new_contact_with_whatsapp_first_touch() {
        let directory = FakeDirectory::default();
        let outcome = process_whatsapp_lead(&lead("0711486581"), &directory, &Config::default(), now())
            .await
            .unwrap();

        assert!(outcome.is_new);
        assert_eq!(outcome.contact_id, Some(1001));
        let created = directory.created.lock().unwrap();
        let (email, attributes) = &created[0];
        assert_eq!(email, "whatsapp-254711486581@admi.africa");
        assert_eq!(attributes["FIRST_TOUCH_SOURCE"], "whatsapp");
        assert_eq!(attributes["FIRST_TOUCH_CAMPAIGN"], "whatsapp-organic");
        assert_eq!(attributes["FIRST_TOUCH_TIMESTAMP"], "2026-03-02T10:00:00.000Z");
        assert_eq!(attributes["SOURCE"], "whatsapp");
        assert_eq!(attributes["CONTACT_STATUS"], "lead");
    }

    #[tokio::test]
    async fn test_process_rejects_incomplete_lead() {
        let directory = FakeDirectory::default();
        let mut incomplete = lead("0711486581");
        incomplete.course_name = "  ".to_string();
        let err = process_whatsapp_lead(&incomplete, &directory, &Config::default(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, AttributionError::Malformed(ref m) if m.contains("courseName")));

        let err = process_whatsapp_lead(&lead("call me"), &directory, &Config::default(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, AttributionError::Malformed(_)));
    }
}
