use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Github,
    Google,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Github => "github",
            Provider::Google => "google",
        }
    }

    /// Userinfo field holding the provider's stable account id.
    pub fn subject_field(&self) -> &'static str {
        match self {
            Provider::Github => "id",
            Provider::Google => "sub",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "github" => Some(Provider::Github),
            "google" => Some(Provider::Google),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub provider: Provider,
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

/// A saved link. `id`, `user_id` and `created_at` are assigned by the backend
/// and never change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: String,
    pub title: String,
    pub url: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBookmark {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateBookmark {
    pub title: String,
    pub url: String,
}

/// Rejects a blank title or url. The url is not checked for well-formedness.
pub fn validate(title: &str, url: &str) -> Result<(), String> {
    if title.trim().is_empty() {
        return Err("title must not be empty".to_string());
    }
    if url.trim().is_empty() {
        return Err("url must not be empty".to_string());
    }
    Ok(())
}

impl NewBookmark {
    pub fn validate(&self) -> Result<(), String> {
        validate(&self.title, &self.url)
    }
}

impl UpdateBookmark {
    pub fn validate(&self) -> Result<(), String> {
        validate(&self.title, &self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_roundtrip() {
        assert_eq!(Provider::from_str("GitHub"), Some(Provider::Github));
        assert_eq!(Provider::from_str("google"), Some(Provider::Google));
        assert_eq!(Provider::from_str("gitlab"), None);
        assert_eq!(Provider::Github.as_str(), "github");
    }

    #[test]
    fn test_validate_rejects_blank_fields() {
        assert!(validate("Rust", "https://rust-lang.org").is_ok());
        assert!(validate("", "https://rust-lang.org").is_err());
        assert!(validate("Rust", "   ").is_err());
    }

    #[test]
    fn test_bookmark_serializes_created_at_as_rfc3339() {
        let created_at = DateTime::parse_from_rfc3339("2026-01-02T10:00:00.000Z")
            .unwrap()
            .with_timezone(&Utc);
        let bookmark = Bookmark {
            id: "a".to_string(),
            title: "t".to_string(),
            url: "u".to_string(),
            user_id: "owner".to_string(),
            created_at,
        };

        let json = serde_json::to_value(&bookmark).unwrap();
        assert_eq!(json["created_at"], "2026-01-02T10:00:00Z");

        let back: Bookmark = serde_json::from_value(json).unwrap();
        assert_eq!(back, bookmark);
    }
}
