//! Secret redaction (§7). Applied to `ServiceError` display and to log lines
//! before either reaches an external surface.

use regex::Regex;
use std::sync::OnceLock;

struct Patterns {
    key_like: Regex,
    jwt: Regex,
    email: Regex,
    ipv4: Regex,
    password_field: Regex,
}

fn patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        // sk-... style API keys, and bare 32+ char hex tokens.
        key_like: Regex::new(r"(?i)\b(sk-[a-zA-Z0-9_-]{10,}|[a-f0-9]{32,})\b").unwrap(),
        jwt: Regex::new(r"\b[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\b").unwrap(),
        email: Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap(),
        ipv4: Regex::new(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b").unwrap(),
        password_field: Regex::new(r#"(?i)(password|passwd|secret|token|api[_-]?key)\s*[:=]\s*"?[^"\s,}]+"?"#).unwrap(),
    })
}

/// Blocklist of front-matter keys dropped outright rather than redacted
/// in place (§4.2 security).
pub const FRONT_MATTER_KEY_BLOCKLIST: &[&str] = &["password", "token", "apikey", "secret", "email"];

pub fn is_blocklisted_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    let normalized: String = lower.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    FRONT_MATTER_KEY_BLOCKLIST.iter().any(|b| normalized == *b)
        || normalized.contains("secret")
        || normalized.contains("password")
        || normalized.contains("apikey")
        || normalized.contains("email")
        || (normalized.contains("key") && normalized != "key")
}

pub fn redact(input: &str) -> String {
    let p = patterns();
    let out = p.password_field.replace_all(input, "$1: [REDACTED]");
    let out = p.jwt.replace_all(&out, "[REDACTED_JWT]");
    let out = p.key_like.replace_all(&out, "[REDACTED_KEY]");
    let out = p.email.replace_all(&out, "[REDACTED_EMAIL]");
    let out = p.ipv4.replace_all(&out, "[REDACTED_IP]");
    out.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_api_key() {
        let s = redact("error calling sk-abcdefghijklmnopqrstuvwxyz0123");
        assert!(s.contains("[REDACTED_KEY]"));
        assert!(!s.contains("sk-abcdefghijklmnopqrstuvwxyz0123"));
    }

    #[test]
    fn redacts_password_field() {
        let s = redact(r#"config: password: "hunter2""#);
        assert!(s.contains("[REDACTED]"));
        assert!(!s.contains("hunter2"));
    }

    #[test]
    fn redacts_email_and_ip() {
        let s = redact("contact admin@example.com at 10.0.0.5");
        assert!(s.contains("[REDACTED_EMAIL]"));
        assert!(s.contains("[REDACTED_IP]"));
    }

    #[test]
    fn blocklist_matches_case_and_punctuation_insensitively() {
        assert!(is_blocklisted_key("API-Key"));
        assert!(is_blocklisted_key("apiKey"));
        assert!(is_blocklisted_key("Password"));
        assert!(!is_blocklisted_key("category"));
        assert!(!is_blocklisted_key("key")); // bare "key" is preserved (too common a front-matter field)
    }
}
