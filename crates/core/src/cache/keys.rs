//! Query normalization and tier key derivation.
//!
//! L1 keys bind the exact normalized text to one conversation. L2 keys bind a
//! variable-stripped pattern to one contact, so the same question asked in a new
//! session still hits.

use sha2::{Digest, Sha256};

use crate::domain::session::{ContactId, SessionId, TenantId};

const KEY_SEPARATOR: &str = "\u{1f}";

pub const EMAIL_PLACEHOLDER: &str = "<email>";
pub const PHONE_PLACEHOLDER: &str = "<phone>";
pub const MONEY_PLACEHOLDER: &str = "<money>";
pub const NUMBER_PLACEHOLDER: &str = "<num>";

/// Lowercases, collapses whitespace and drops surrounding punctuation.
pub fn normalize_exact(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    collapsed.trim_matches(|ch: char| ch.is_ascii_punctuation() && ch != '$').to_string()
}

/// Exact normalization with conversation-specific values replaced by placeholders.
pub fn normalize_pattern(text: &str) -> String {
    normalize_exact(text).split(' ').filter_map(pattern_token).collect::<Vec<_>>().join(" ")
}

fn pattern_token(raw: &str) -> Option<String> {
    let token = raw.trim_matches(|ch: char| {
        !(ch.is_alphanumeric() || ch == '$' || ch == '@' || ch == '\'' || ch == '+')
    });
    if token.is_empty() {
        return None;
    }

    let digits = token.chars().filter(char::is_ascii_digit).count();
    let placeholder = if is_email(token) {
        EMAIL_PLACEHOLDER
    } else if is_money(token, digits) {
        MONEY_PLACEHOLDER
    } else if is_phone(token, digits) {
        PHONE_PLACEHOLDER
    } else if digits > 0 {
        NUMBER_PLACEHOLDER
    } else {
        return Some(token.to_string());
    };
    Some(placeholder.to_string())
}

fn is_email(token: &str) -> bool {
    match token.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

fn is_money(token: &str, digits: usize) -> bool {
    if digits == 0 {
        return false;
    }
    if token.starts_with('$') {
        return true;
    }
    let Some(last) = token.chars().last() else {
        return false;
    };
    matches!(last, 'k' | 'm')
        && token[..token.len() - 1].chars().all(|ch| ch.is_ascii_digit() || ch == '.' || ch == ',')
}

fn is_phone(token: &str, digits: usize) -> bool {
    digits >= 7
        && token.chars().all(|ch| ch.is_ascii_digit() || matches!(ch, '-' | '.' | '(' | ')' | '+'))
}

/// Marks text that should not be replayed from cache: contact details and
/// time-relative wording.
pub fn has_volatile_content(text: &str) -> bool {
    const TIME_WORDS: [&str; 7] =
        ["today", "tonight", "tomorrow", "yesterday", "this morning", "this afternoon", "right now"];

    let normalized = normalize_exact(text);
    if TIME_WORDS.iter().any(|word| normalized.contains(word)) {
        return true;
    }
    normalize_pattern(text)
        .split(' ')
        .any(|token| token == EMAIL_PLACEHOLDER || token == PHONE_PLACEHOLDER)
}

pub fn l1_key(normalized: &str, tenant_id: &TenantId, conversation_id: &SessionId) -> String {
    digest(&[normalized, &tenant_id.0, &conversation_id.0])
}

pub fn l2_key(pattern: &str, tenant_id: &TenantId, contact_id: &ContactId) -> String {
    digest(&[pattern, &tenant_id.0, &contact_id.0])
}

pub fn l3_key(normalized: &str, tenant_id: &TenantId) -> String {
    digest(&[normalized, &tenant_id.0])
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            hasher.update(KEY_SEPARATOR.as_bytes());
        }
        hasher.update(part.as_bytes());
    }
    hasher.finalize().iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::{has_volatile_content, l1_key, l2_key, normalize_exact, normalize_pattern};
    use crate::domain::session::{ContactId, SessionId, TenantId};

    #[test]
    fn exact_normalization_ignores_case_spacing_and_trailing_punctuation() {
        assert_eq!(normalize_exact("  What's your   RETURN policy?? "), "what's your return policy");
        assert_eq!(normalize_exact("$500k budget"), "$500k budget");
    }

    #[test]
    fn pattern_normalization_replaces_conversation_values() {
        let pattern = normalize_pattern(
            "Call me at 555-867-5309 or jo@example.com about the $450,000 offer for 3 beds",
        );
        assert_eq!(
            pattern,
            "call me at <phone> or <email> about the <money> offer for <num> beds"
        );
        assert_eq!(normalize_pattern("budget is 500k"), "budget is <money>");
    }

    #[test]
    fn keys_are_scoped_and_stable() {
        let tenant = TenantId("acme".to_owned());
        let first = l1_key("hello", &tenant, &SessionId("S-1".to_owned()));
        let second = l1_key("hello", &tenant, &SessionId("S-2".to_owned()));

        assert_eq!(first.len(), 64);
        assert_ne!(first, second);
        assert_eq!(first, l1_key("hello", &tenant, &SessionId("S-1".to_owned())));
        assert_ne!(
            l2_key("hello", &tenant, &ContactId("C-1".to_owned())),
            l2_key("hello", &TenantId("other".to_owned()), &ContactId("C-1".to_owned()))
        );
    }

    #[test]
    fn volatile_content_detection() {
        assert!(has_volatile_content("I can show it tomorrow at 4"));
        assert!(has_volatile_content("Email me at sam@example.com"));
        assert!(!has_volatile_content("Our return policy allows 30 days."));
    }
}
