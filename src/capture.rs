//! Captures marketing parameters from each page load into the attribution store.

use crate::client_id::client_id_from_cookies;
use crate::models::{AttributionRecord, PageContext, iso_timestamp};
use crate::sanitize::{sanitize_optional, sanitize_value};
use crate::store::{AttributionStore, StoreKey};
use chrono::{DateTime, Utc};
use std::borrow::Cow;

/// The only marketing parameters recognized, in source/medium/campaign/term/content order.
pub(crate) const UTM_PARAMS: [&str; 5] = [
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
];

pub(crate) const DEFAULT_SOURCE: &str = "direct";
pub(crate) const DEFAULT_CAMPAIGN: &str = "organic";
pub(crate) const NO_MEDIUM: &str = "none";
pub(crate) const REFERRAL_MEDIUM: &str = "referral";

/// Whether this browser has ever had first-touch data recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VisitorState {
    New,
    Returning,
}

impl VisitorState {
    /// A browser is new until its first-touch timestamp has been written.
    pub(crate) fn detect(store: &AttributionStore) -> Self {
        match store.get(StoreKey::FirstTouchTimestamp) {
            Some(_) => VisitorState::Returning,
            None => VisitorState::New,
        }
    }
}

/// Last-touch marketing parameters read from one URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct UtmParams {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub term: Option<String>,
    pub content: Option<String>,
}

impl UtmParams {
    /// Reads and sanitizes the five marketing parameters from a page URL.
    /// The first occurrence of a repeated parameter wins.
    pub(crate) fn from_url(url: &url::Url, max_len: usize) -> Self {
        let [source, medium, campaign, term, content] = UTM_PARAMS.map(|name| {
            let raw: Option<Cow<'_, str>> = url
                .query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value);
            sanitize_optional(raw.as_deref(), max_len)
        });

        Self {
            source,
            medium,
            campaign,
            term,
            content,
        }
    }

    fn entries(&self) -> [(StoreKey, Option<&str>); 5] {
        [
            (StoreKey::UtmSource, self.source.as_deref()),
            (StoreKey::UtmMedium, self.medium.as_deref()),
            (StoreKey::UtmCampaign, self.campaign.as_deref()),
            (StoreKey::UtmTerm, self.term.as_deref()),
            (StoreKey::UtmContent, self.content.as_deref()),
        ]
    }
}

/// Runs on every page load: refreshes last-touch parameters, records
/// first-touch data once per browser, and keeps the client id current.
///
/// Returns what this call wrote. Safe to call repeatedly and with an
/// unavailable store, in which case nothing is persisted.
pub(crate) fn capture_from_location(
    store: &AttributionStore,
    page: &PageContext,
    max_len: usize,
    now: DateTime<Utc>,
) -> AttributionRecord {
    let params = UtmParams::from_url(&page.url, max_len);
    let timestamp = iso_timestamp(now);

    let mut record = AttributionRecord {
        source: params.source.clone(),
        medium: params.medium.clone(),
        campaign: params.campaign.clone(),
        term: params.term.clone(),
        content: params.content.clone(),
        ..AttributionRecord::default()
    };

    for (key, value) in params.entries() {
        if let Some(value) = value {
            store.set(key, value);
        }
    }

    match VisitorState::detect(store) {
        VisitorState::New => {
            record_first_touch(store, page, &params, &timestamp, max_len, &mut record);
        }
        VisitorState::Returning => {
            tracing::debug!(target: "capture_task", "Returning visitor; first-touch left untouched.");
        }
    }

    if let Some(client_id) = client_id_from_cookies(&page.cookie_header) {
        store.set(StoreKey::GaClientId, &client_id);
        record.ga_client_id = Some(client_id);
    }

    let landing_page = sanitize_value(page.url.as_str(), max_len);
    if store.set_if_absent(StoreKey::LandingPage, &landing_page) {
        record.landing_page = Some(landing_page);
    }

    let referrer = sanitize_value(&page.referrer_or_direct(), max_len);
    if store.set_if_absent(StoreKey::Referrer, &referrer) {
        record.referrer = Some(referrer);
    }

    if store.set_if_absent(StoreKey::FirstVisit, &timestamp) {
        record.first_visit = Some(timestamp);
    }

    if record != AttributionRecord::default() {
        tracing::info!(target: "capture_task", "Attribution captured: {:?}", record);
    }
    record
}

fn record_first_touch(
    store: &AttributionStore,
    page: &PageContext,
    params: &UtmParams,
    timestamp: &str,
    max_len: usize,
    record: &mut AttributionRecord,
) {
    let source = params.source.as_deref().unwrap_or(DEFAULT_SOURCE);
    let medium = params.medium.as_deref().unwrap_or(if page.has_referrer() {
        REFERRAL_MEDIUM
    } else {
        NO_MEDIUM
    });
    let campaign = params.campaign.as_deref().unwrap_or(DEFAULT_CAMPAIGN);
    let referrer = page.referrer.as_deref().map(|r| sanitize_value(r, max_len));

    let fields = [
        (StoreKey::FirstTouchSource, Some(source), &mut record.first_touch_source),
        (StoreKey::FirstTouchMedium, Some(medium), &mut record.first_touch_medium),
        (StoreKey::FirstTouchCampaign, Some(campaign), &mut record.first_touch_campaign),
        (StoreKey::FirstTouchTerm, params.term.as_deref(), &mut record.first_touch_term),
        (StoreKey::FirstTouchContent, params.content.as_deref(), &mut record.first_touch_content),
        (StoreKey::FirstTouchReferrer, referrer.as_deref(), &mut record.first_touch_referrer),
        // Written last: its presence is what marks the visitor as returning.
        (StoreKey::FirstTouchTimestamp, Some(timestamp), &mut record.first_touch_timestamp),
    ];

    for (key, value, slot) in fields {
        let Some(value) = value else { continue };
        if !store.set_if_absent(key, value) {
            continue;
        }
        *slot = Some(value.to_string());
    }

    tracing::info!(target: "capture_task",
        "First touch recorded: source={}, medium={}, campaign={}",
        source, medium, campaign
    );
}
