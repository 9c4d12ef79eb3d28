//! Role policy records
//!
//! A role is the declarative issuance policy the router stores per endpoint.
//! It is read-only at issuance time; every toggle here is consumed by name
//! admission, the creation-bundle builder, or key generation.

use serde::{Deserialize, Serialize};

use crate::{
    bundle::PathLength,
    error::{Error, Result},
};

/// Issuance policy for a single role.
///
/// `ttl` and `max_ttl` are duration strings ("1h", "30m"); empty means
/// "inherit the system default". `key_type` is `"rsa"` or `"ec"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleEntry {
    pub ttl: String,
    pub max_ttl: String,
    pub allow_localhost: bool,
    pub allowed_base_domain: String,
    pub allow_base_domain: bool,
    pub allow_token_display_name: bool,
    pub allow_subdomains: bool,
    pub allow_any_name: bool,
    pub enforce_hostnames: bool,
    pub allow_ip_sans: bool,
    pub server_flag: bool,
    pub client_flag: bool,
    pub code_signing_flag: bool,
    pub email_protection_flag: bool,
    pub use_csr_common_name: bool,
    pub key_type: String,
    pub key_bits: u32,
    /// When absent, path length is derived from the signing CA (or left
    /// unconstrained for a self-signed root).
    pub max_path_length: Option<PathLength>,
}

/// Checks a key type / bit length combination before any key generation
/// begins. Rejections are always the requestor's fault.
pub fn validate_key_type_length(key_type: &str, key_bits: u32) -> Result<()> {
    match key_type {
        "rsa" => match key_bits {
            1024 | 2048 | 4096 | 8192 => Ok(()),
            _ => Err(Error::user(format!(
                "unsupported bit length for RSA key: {key_bits}"
            ))),
        },
        "ec" => match key_bits {
            224 | 256 | 384 | 521 => Ok(()),
            _ => Err(Error::user(format!(
                "unsupported bit length for EC key: {key_bits}"
            ))),
        },
        _ => Err(Error::user(format!("unknown key type {key_type}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_key_type_length_accepts_known_combinations() {
        for bits in [1024, 2048, 4096, 8192] {
            validate_key_type_length("rsa", bits).unwrap();
        }
        for bits in [224, 256, 384, 521] {
            validate_key_type_length("ec", bits).unwrap();
        }
    }

    #[test]
    fn test_key_type_length_rejections_are_user_errors() {
        let err = validate_key_type_length("rsa", 512).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
        assert!(err.to_string().contains("unsupported bit length for RSA key"));

        let err = validate_key_type_length("ec", 192).unwrap_err();
        assert!(err.to_string().contains("unsupported bit length for EC key"));

        let err = validate_key_type_length("dsa", 1024).unwrap_err();
        assert!(err.to_string().contains("unknown key type dsa"));
    }

    #[test]
    fn test_sparse_role_deserializes_with_defaults() {
        let role: RoleEntry =
            serde_json::from_str(r#"{"key_type":"ec","key_bits":256,"server_flag":true}"#).unwrap();
        assert!(role.server_flag);
        assert!(!role.allow_any_name);
        assert!(role.ttl.is_empty());
        assert!(role.max_path_length.is_none());
    }
}
