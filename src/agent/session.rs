//! Session-id extraction from agent CLI output.
//!
//! The agent CLI reports its session in several shapes depending on version
//! and flags; all of them embed a UUID. Matching is centralized here so
//! every caller recognizes the same set.

use once_cell::sync::Lazy;
use regex::Regex;

const UUID: &str = "[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}";

static PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(&format!(r"(?i)session[ _-]?id\s*[:=]\s*({UUID})")).unwrap(),
        Regex::new(&format!(r"(?i)resume\s+(?:with\s+)?--resume[= ]({UUID})")).unwrap(),
        Regex::new(&format!(r"/share/({UUID})")).unwrap(),
        Regex::new(&format!(r"(?i)\bsession\b[^\n]*?({UUID})")).unwrap(),
    ]
});

/// First UUID-shaped session id found in `text`, trying the known output
/// shapes in order of specificity.
pub fn try_extract_session_id(text: &str) -> Option<String> {
    for pattern in PATTERNS.iter() {
        if let Some(captures) = pattern.captures(text) {
            return Some(captures[1].to_lowercase());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "0b5c4f1e-9a2d-4e8b-b7c3-1f2a3b4c5d6e";

    #[test]
    fn labeled_session_id() {
        let text = format!("Starting up...\nSession ID: {ID}\nworking...");
        assert_eq!(try_extract_session_id(&text), Some(ID.to_string()));
    }

    #[test]
    fn resume_hint() {
        let text = format!("Done. Resume with --resume {ID}");
        assert_eq!(try_extract_session_id(&text), Some(ID.to_string()));
    }

    #[test]
    fn share_url() {
        let text = format!("View this run at https://example.com/share/{ID}?tab=log");
        assert_eq!(try_extract_session_id(&text), Some(ID.to_string()));
    }

    #[test]
    fn loose_session_mention() {
        let text = format!("session {ID} established");
        assert_eq!(try_extract_session_id(&text), Some(ID.to_string()));
    }

    #[test]
    fn uppercase_is_normalized() {
        let text = format!("SESSION-ID={}", ID.to_uppercase());
        assert_eq!(try_extract_session_id(&text), Some(ID.to_string()));
    }

    #[test]
    fn no_uuid_no_match() {
        assert_eq!(try_extract_session_id("session id: none yet"), None);
        assert_eq!(try_extract_session_id(""), None);
    }

    #[test]
    fn unrelated_uuid_without_context_is_ignored() {
        let text = format!("checksum {ID} verified");
        assert_eq!(try_extract_session_id(&text), None);
    }
}
