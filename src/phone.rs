//! Normalizes phone numbers into the international key used to match contacts.

/// Calling code of the deployment's home country.
pub(crate) const DEFAULT_COUNTRY_CODE: &str = "254";

/// Digits in a national subscriber number, without trunk prefix or country code.
const SUBSCRIBER_DIGITS: usize = 9;

/// Converts any common rendering of a phone number into `<country code><subscriber>`.
///
/// Handles `+254 711 486 581`, `254711486581`, `0711486581` and `711486581`.
/// Input that fits none of these shapes is returned as its bare digits, and
/// input without digits yields an empty string.
pub(crate) fn normalize_phone_with(phone: &str, country_code: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.len() == SUBSCRIBER_DIGITS + 1 && digits.starts_with('0') {
        format!("{}{}", country_code, &digits[1..])
    } else if digits.len() == SUBSCRIBER_DIGITS {
        format!("{}{}", country_code, digits)
    } else {
        // Already international, or not something we know how to fix.
        digits
    }
}

/// Two phone strings belong to the same identity iff they normalize to the same key.
pub(crate) fn same_identity(a: &str, b: &str, country_code: &str) -> bool {
    let a = normalize_phone_with(a, country_code);
    !a.is_empty() && a == normalize_phone_with(b, country_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize_phone(phone: &str) -> String {
        normalize_phone_with(phone, DEFAULT_COUNTRY_CODE)
    }

    #[test]
    fn test_normalize_equivalent_formats() {
        for input in [
            "+254711486581",
            "0711486581",
            "254711486581",
            "+254 711 486 581",
            "711486581",
            "(0711) 486-581",
        ] {
            assert_eq!(normalize_phone(input), "254711486581", "input: {}", input);
        }
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for input in ["+254711486581", "0711486581", "711486581", "+1 (415) 555-0100", "12", ""] {
            let once = normalize_phone(input);
            assert_eq!(normalize_phone(&once), once, "input: {}", input);
        }
    }

    #[test]
    fn test_normalize_fallbacks() {
        assert_eq!(normalize_phone(""), "");
        assert_eq!(normalize_phone("not a number"), "");
        assert_eq!(normalize_phone("+1 415 555 0100"), "14155550100");
        assert_eq!(normalize_phone("12345"), "12345");
    }

    #[test]
    fn test_other_country_code() {
        assert_eq!(normalize_phone_with("0803123456", "234"), "234803123456");
    }

    #[test]
    fn test_same_identity() {
        assert!(same_identity("0711486581", "+254 711 486 581", DEFAULT_COUNTRY_CODE));
        assert!(!same_identity("0711486581", "0711486582", DEFAULT_COUNTRY_CODE));
        assert!(!same_identity("", "", DEFAULT_COUNTRY_CODE));
    }
}
