use serde::{Deserialize, Serialize};
use std::fmt;

/// Comma-separated API keys used when the config file lists none.
pub const API_KEYS_ENV: &str = "KEYPOOL_API_KEYS";

/// One `[[credentials]]` entry. The key comes either inline or from an
/// environment variable, never both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialConfig {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_env: Option<String>,
}

impl CredentialConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.index == 0 {
            anyhow::bail!("credential index must start at 1");
        }
        match (&self.key, &self.key_env) {
            (Some(_), Some(_)) => {
                anyhow::bail!("credential #{} sets both key and key_env", self.index)
            }
            (None, None) => anyhow::bail!("credential #{} needs key or key_env", self.index),
            _ => Ok(()),
        }
    }

    /// Resolves the raw key, reading `key_env` through `lookup`.
    pub fn resolve_with<F>(&self, lookup: F) -> anyhow::Result<ResolvedCredential>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = match (&self.key, &self.key_env) {
            (Some(key), _) => key.clone(),
            (None, Some(var)) => lookup(var).ok_or_else(|| {
                anyhow::anyhow!(
                    "credential #{}: environment variable {} is not set",
                    self.index,
                    var
                )
            })?,
            (None, None) => anyhow::bail!("credential #{} needs key or key_env", self.index),
        };
        let key = key.trim().to_string();
        if key.is_empty() {
            anyhow::bail!("credential #{} has an empty key", self.index);
        }
        Ok(ResolvedCredential {
            index: self.index,
            key,
        })
    }
}

/// A credential index paired with its raw key material.
#[derive(Clone, PartialEq)]
pub struct ResolvedCredential {
    pub index: u32,
    pub key: String,
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("index", &self.index)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Splits a comma-separated key list into credentials numbered from 1.
pub fn parse_key_list(raw: &str) -> Vec<ResolvedCredential> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .enumerate()
        .map(|(i, key)| ResolvedCredential {
            index: i as u32 + 1,
            key: key.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inline(index: u32, key: &str) -> CredentialConfig {
        CredentialConfig {
            index,
            key: Some(key.to_string()),
            key_env: None,
        }
    }

    #[test]
    fn validate_requires_exactly_one_source() {
        assert!(inline(1, "k").validate().is_ok());

        let both = CredentialConfig {
            key_env: Some("X".into()),
            ..inline(1, "k")
        };
        assert!(both.validate().is_err());

        let neither = CredentialConfig {
            index: 1,
            key: None,
            key_env: None,
        };
        assert!(neither.validate().is_err());

        assert!(inline(0, "k").validate().is_err());
    }

    #[test]
    fn resolve_reads_env_through_lookup() {
        let cfg = CredentialConfig {
            index: 2,
            key: None,
            key_env: Some("YT_KEY_2".into()),
        };
        let resolved = cfg
            .resolve_with(|name| (name == "YT_KEY_2").then(|| " secret-2 ".to_string()))
            .unwrap();
        assert_eq!(resolved.index, 2);
        assert_eq!(resolved.key, "secret-2");

        assert!(cfg.resolve_with(|_| None).is_err());
    }

    #[test]
    fn resolve_rejects_blank_key() {
        assert!(inline(1, "   ").resolve_with(|_| None).is_err());
    }

    #[test]
    fn parse_key_list_numbers_from_one() {
        let keys = parse_key_list("a, b,,c ");
        let pairs: Vec<(u32, &str)> = keys.iter().map(|k| (k.index, k.key.as_str())).collect();
        assert_eq!(pairs, vec![(1, "a"), (2, "b"), (3, "c")]);
        assert!(parse_key_list(" , ").is_empty());
    }

    #[test]
    fn debug_redacts_key() {
        let resolved = inline(1, "super-secret").resolve_with(|_| None).unwrap();
        assert!(!format!("{:?}", resolved).contains("super-secret"));
    }
}
