/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

/// Number of leading characters of a secret kept visible by [`redact`]
const REDACT_VISIBLE_CHARS: usize = 4;

/// Mask a secret for Debug output and logs, keeping only a short prefix
pub fn redact(secret: &str) -> String {
    let total = secret.chars().count();
    if total <= REDACT_VISIBLE_CHARS * 2 {
        return "***".to_string();
    }
    let prefix: String = secret.chars().take(REDACT_VISIBLE_CHARS).collect();
    format!("{}*** ({} chars)", prefix, total)
}
