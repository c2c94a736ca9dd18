//! Reads attribution back out of the store at submission time.

use crate::capture::{DEFAULT_CAMPAIGN, DEFAULT_SOURCE, NO_MEDIUM};
use crate::models::{AttributionPayload, AttributionRecord, PageContext};
use crate::store::{AttributionStore, StoreKey};

/// Collects everything the store holds about this visitor. No defaults are
/// applied; a field that was never captured stays `None`.
pub(crate) fn resolve_for_submission(store: &AttributionStore) -> AttributionRecord {
    AttributionRecord {
        source: store.get(StoreKey::UtmSource),
        medium: store.get(StoreKey::UtmMedium),
        campaign: store.get(StoreKey::UtmCampaign),
        term: store.get(StoreKey::UtmTerm),
        content: store.get(StoreKey::UtmContent),
        landing_page: store.get(StoreKey::LandingPage),
        referrer: store.get(StoreKey::Referrer),
        first_visit: store.get(StoreKey::FirstVisit),
        first_touch_source: store.get(StoreKey::FirstTouchSource),
        first_touch_medium: store.get(StoreKey::FirstTouchMedium),
        first_touch_campaign: store.get(StoreKey::FirstTouchCampaign),
        first_touch_term: store.get(StoreKey::FirstTouchTerm),
        first_touch_content: store.get(StoreKey::FirstTouchContent),
        first_touch_timestamp: store.get(StoreKey::FirstTouchTimestamp),
        first_touch_referrer: store.get(StoreKey::FirstTouchReferrer),
        ga_client_id: store.get(StoreKey::GaClientId),
    }
}

/// Fills a sparse record for submission.
///
/// Last-touch fields get fixed defaults (`direct`/`none`/`organic`), landing
/// page and referrer fall back to the submitting page. First-touch fields and
/// the client id are left empty when absent: no prior data is a meaningful
/// answer and must not be dressed up as a `direct` first touch.
pub(crate) fn enrich(record: &AttributionRecord, page: Option<&PageContext>) -> AttributionPayload {
    let or_default = |value: &Option<String>, default: &str| {
        value.clone().unwrap_or_else(|| default.to_string())
    };
    let current_page = page.map(|p| p.url.to_string()).unwrap_or_default();
    let current_referrer = page.map(PageContext::referrer_or_direct).unwrap_or_default();

    AttributionPayload {
        utm_source: or_default(&record.source, DEFAULT_SOURCE),
        utm_medium: or_default(&record.medium, NO_MEDIUM),
        utm_campaign: or_default(&record.campaign, DEFAULT_CAMPAIGN),
        utm_term: or_default(&record.term, ""),
        utm_content: or_default(&record.content, ""),
        landing_page: or_default(&record.landing_page, &current_page),
        referrer: or_default(&record.referrer, &current_referrer),
        ..record.to_payload()
    }
}
