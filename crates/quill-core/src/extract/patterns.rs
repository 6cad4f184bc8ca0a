//! Shared detection patterns.
//!
//! Reference formats recovered by the heuristic extractor (dates, billing
//! codes, citations, amounts) and the PII patterns the validator's
//! `no_pii` check uses. Patterns with a capture group yield group 1;
//! others yield the whole match.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // =========================================================================
    // REFERENCE FORMATS
    // =========================================================================

    /// 2024-03-15
    pub static ref ISO_DATE_PATTERN: Regex = Regex::new(
        r"\b\d{4}-(?:0[1-9]|1[0-2])-(?:0[1-9]|[12]\d|3[01])\b"
    ).unwrap();

    /// 03/15/2024
    pub static ref US_DATE_PATTERN: Regex = Regex::new(
        r"\b(?:0?[1-9]|1[0-2])/(?:0?[1-9]|[12]\d|3[01])/\d{4}\b"
    ).unwrap();

    /// March 15, 2024
    pub static ref LONG_DATE_PATTERN: Regex = Regex::new(
        r"\b(?:January|February|March|April|May|June|July|August|September|October|November|December)\s+\d{1,2},\s+\d{4}\b"
    ).unwrap();

    /// CPT: 99213
    pub static ref CPT_CODE_PATTERN: Regex = Regex::new(
        r"(?i)\bCPT\s*(?:code)?\s*:?\s*(\d{5})\b"
    ).unwrap();

    /// ICD-10: M54.5
    pub static ref ICD10_CODE_PATTERN: Regex = Regex::new(
        r"(?i)\bICD[-\s]*10(?:-CM)?\s*(?:code)?\s*:?\s*([A-TV-Z]\d{2}(?:\.\d{1,4})?)\b"
    ).unwrap();

    /// Claim adjustment reason codes: CO-50, PR-204
    pub static ref DENIAL_CODE_PATTERN: Regex = Regex::new(
        r"\b(?:CO|PR|OA|PI)-\d{1,3}\b"
    ).unwrap();

    /// Claim #: CLM-2024-0042
    pub static ref CLAIM_NUMBER_PATTERN: Regex = Regex::new(
        r"(?i)\bclaim\s*(?:number|no\.?|#)\s*:?\s*([A-Z0-9][A-Z0-9-]{3,})"
    ).unwrap();

    /// Smith et al., 2021 / Smith & Jones, 2019
    pub static ref CITATION_PATTERN: Regex = Regex::new(
        r"\b[A-Z][a-z]+(?: et al\.| & [A-Z][a-z]+), \d{4}\b"
    ).unwrap();

    /// 12 CFR 1002.9
    pub static ref CFR_CITATION_PATTERN: Regex = Regex::new(
        r"\b\d{1,2}\s+C\.?F\.?R\.?\s+(?:§\s*)?\d+(?:\.\d+)*"
    ).unwrap();

    /// 15 U.S.C. 1691
    pub static ref USC_CITATION_PATTERN: Regex = Regex::new(
        r"\b\d{1,2}\s+U\.S\.C\.?\s+(?:§\s*)?\d+[a-z]?"
    ).unwrap();

    /// $1,250.00
    pub static ref MONEY_PATTERN: Regex = Regex::new(
        r"\$\d{1,3}(?:,\d{3})*(?:\.\d{2})?\b"
    ).unwrap();

    // =========================================================================
    // PII DETECTION PATTERNS
    // =========================================================================

    /// Email address pattern (RFC 5322 simplified)
    pub static ref EMAIL_PATTERN: Regex = Regex::new(
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}"
    ).unwrap();

    /// US phone number pattern (with optional country code)
    pub static ref PHONE_PATTERN: Regex = Regex::new(
        r"(?:\+?1[-.\s]?)?(?:\([0-9]{3}\)|[0-9]{3})[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}"
    ).unwrap();

    /// Social Security Number pattern (XXX-XX-XXXX or XXXXXXXXX)
    pub static ref SSN_PATTERN: Regex = Regex::new(
        r"\b\d{3}[-\s]?\d{2}[-\s]?\d{4}\b"
    ).unwrap();

    /// Credit card number pattern (16 digits with optional separators)
    pub static ref CREDIT_CARD_PATTERN: Regex = Regex::new(
        r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b"
    ).unwrap();
}

/// Look up a built-in pattern by name.
pub fn builtin(name: &str) -> Option<&'static Regex> {
    let pattern: &'static Regex = match name {
        "iso_date" => &ISO_DATE_PATTERN,
        "us_date" => &US_DATE_PATTERN,
        "long_date" => &LONG_DATE_PATTERN,
        "cpt_code" => &CPT_CODE_PATTERN,
        "icd10_code" => &ICD10_CODE_PATTERN,
        "denial_code" => &DENIAL_CODE_PATTERN,
        "claim_number" => &CLAIM_NUMBER_PATTERN,
        "citation" => &CITATION_PATTERN,
        "cfr_citation" => &CFR_CITATION_PATTERN,
        "usc_citation" => &USC_CITATION_PATTERN,
        "money" => &MONEY_PATTERN,
        "email" => &EMAIL_PATTERN,
        "phone" => &PHONE_PATTERN,
        _ => return None,
    };
    Some(pattern)
}

/// First match in `text`: capture group 1 when the pattern has one.
pub fn first_match(pattern: &Regex, text: &str) -> Option<String> {
    let caps = pattern.captures(text)?;
    let m = caps.get(1).or_else(|| caps.get(0))?;
    Some(m.as_str().trim().to_string())
}

/// Every distinct match in `text`, in order of appearance.
pub fn all_matches(pattern: &Regex, text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for caps in pattern.captures_iter(text) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(0)) {
            let value = m.as_str().trim().to_string();
            if !found.contains(&value) {
                found.push(value);
            }
        }
    }
    found
}

/// Check if content contains any email addresses.
pub fn contains_email(content: &str) -> bool {
    EMAIL_PATTERN.is_match(content)
}

/// Check if content contains any phone numbers.
pub fn contains_phone(content: &str) -> bool {
    PHONE_PATTERN.is_match(content)
}

/// Check if content contains any SSN patterns.
pub fn contains_ssn(content: &str) -> bool {
    SSN_PATTERN.is_match(content)
}

/// Check if content contains any credit card numbers.
pub fn contains_credit_card(content: &str) -> bool {
    CREDIT_CARD_PATTERN.is_match(content)
}

/// Names of the PII kinds present in `content`.
pub fn pii_kinds(content: &str) -> Vec<&'static str> {
    let mut kinds = Vec::new();
    if contains_email(content) {
        kinds.push("email");
    }
    if contains_phone(content) {
        kinds.push("phone");
    }
    if contains_ssn(content) {
        kinds.push("ssn");
    }
    if contains_credit_card(content) {
        kinds.push("credit_card");
    }
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dates() {
        assert_eq!(
            first_match(&ISO_DATE_PATTERN, "Denied on 2024-03-15."),
            Some("2024-03-15".to_string())
        );
        assert!(US_DATE_PATTERN.is_match("Service date 3/5/2024"));
        assert!(LONG_DATE_PATTERN.is_match("Dated March 15, 2024"));
        assert!(!ISO_DATE_PATTERN.is_match("2024-13-01"));
    }

    #[test]
    fn test_billing_codes() {
        assert_eq!(
            first_match(&CPT_CODE_PATTERN, "Procedure (CPT: 72148) was denied"),
            Some("72148".to_string())
        );
        assert_eq!(
            first_match(&ICD10_CODE_PATTERN, "Diagnosis ICD-10: M54.5 lumbar pain"),
            Some("M54.5".to_string())
        );
        assert_eq!(
            all_matches(&DENIAL_CODE_PATTERN, "Codes CO-50 and PR-204, again CO-50"),
            vec!["CO-50".to_string(), "PR-204".to_string()]
        );
        assert_eq!(
            first_match(&CLAIM_NUMBER_PATTERN, "Claim #: CLM-2024-0042 was"),
            Some("CLM-2024-0042".to_string())
        );
    }

    #[test]
    fn test_citations() {
        assert_eq!(
            all_matches(&CITATION_PATTERN, "See Smith et al., 2021 and Lee & Park, 2019."),
            vec!["Smith et al., 2021".to_string(), "Lee & Park, 2019".to_string()]
        );
        assert!(CFR_CITATION_PATTERN.is_match("as required by 12 CFR 1002.9"));
        assert!(USC_CITATION_PATTERN.is_match("under 15 U.S.C. 1691"));
    }

    #[test]
    fn test_money() {
        assert_eq!(
            first_match(&MONEY_PATTERN, "billed $1,250.00 in total"),
            Some("$1,250.00".to_string())
        );
    }

    #[test]
    fn test_builtin_lookup() {
        assert!(builtin("icd10_code").is_some());
        assert!(builtin("nonexistent").is_none());
    }

    #[test]
    fn test_email_detection() {
        assert!(contains_email("Contact john@example.com for help"));
        assert!(!contains_email("No email here"));
    }

    #[test]
    fn test_phone_detection() {
        assert!(contains_phone("Call us at 555-123-4567"));
        assert!(contains_phone("Phone: (555) 123-4567"));
        assert!(!contains_phone("No phone here"));
    }

    #[test]
    fn test_ssn_and_card_detection() {
        assert!(contains_ssn("SSN: 123-45-6789"));
        assert!(contains_credit_card("Card: 4111-1111-1111-1111"));
        assert!(!contains_credit_card("Not a card: 411111111111"));
    }

    #[test]
    fn test_pii_kinds() {
        assert_eq!(pii_kinds("Reach me at a@b.io"), vec!["email"]);
        assert!(pii_kinds("Nothing personal in this letter.").is_empty());
    }
}
