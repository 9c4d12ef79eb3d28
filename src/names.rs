//! Name admission
//!
//! Evaluates requested subject names against a role policy. Admission is
//! order-sensitive: the first name that no rule admits is returned to the
//! caller, which turns it into a user-facing rejection.

use std::sync::LazyLock;

use regex::Regex;

use crate::role::RoleEntry;

/// LDH hostname grammar: dot-separated labels of alphanumerics with interior
/// hyphens. Never matches the empty string.
static HOSTNAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$",
    )
    .expect("hostname pattern should compile")
});

/// Verifies each requested name against the role's toggles, in input order.
///
/// Returns the first name that fails, or `None` when every name is admitted.
/// Email addresses are admitted on the strength of their domain part;
/// a leading `*.` is stripped before grammar checks and subdomain matching.
pub fn validate_names(display_name: &str, names: &[String], role: &RoleEntry) -> Option<String> {
    for name in names {
        let mut sanitized: &str = name;
        let mut email_domain: &str = name;
        let mut is_email = false;
        let mut is_wildcard = false;

        if name.contains('@') {
            if !role.email_protection_flag && !role.allow_any_name {
                return Some(name.clone());
            }
            let split_email: Vec<&str> = name.split('@').collect();
            if split_email.len() != 2 {
                return Some(name.clone());
            }
            sanitized = split_email[1];
            email_domain = split_email[1];
            is_email = true;
        }

        if let Some(stripped) = sanitized.strip_prefix("*.") {
            sanitized = stripped;
            is_wildcard = true;
        }

        if role.enforce_hostnames && !HOSTNAME_REGEX.is_match(sanitized) {
            return Some(name.clone());
        }

        if role.allow_any_name {
            continue;
        }

        if role.allow_localhost {
            if name == "localhost" || (is_email && email_domain == "localhost") {
                continue;
            }

            if role.allow_subdomains {
                // The grammar never matches the empty string, so a bare
                // ".<display_name>" cannot sneak through as a subdomain.
                if let Some(trimmed) = sanitized.strip_suffix(&format!(".{display_name}")) {
                    if HOSTNAME_REGEX.is_match(trimmed) {
                        continue;
                    }
                }

                // The stripped "*." prefix is the one case where the left
                // side is allowed to be empty: a wildcard over the base
                // domain itself.
                if is_wildcard && sanitized == role.allowed_base_domain {
                    continue;
                }
            }
        }

        if role.allow_token_display_name {
            // Exact match against the raw name, not the sanitized form.
            if name == display_name || (is_email && email_domain == display_name) {
                continue;
            }

            if role.allow_subdomains {
                if let Some(trimmed) = sanitized.strip_suffix(&format!(".{display_name}")) {
                    if HOSTNAME_REGEX.is_match(trimmed) {
                        continue;
                    }
                }

                if is_wildcard && sanitized == role.allowed_base_domain {
                    continue;
                }
            }
        }

        if !role.allowed_base_domain.is_empty() {
            if role.allow_base_domain
                && (*name == role.allowed_base_domain
                    || (is_email && email_domain == role.allowed_base_domain))
            {
                continue;
            }

            if role.allow_subdomains {
                if let Some(trimmed) =
                    sanitized.strip_suffix(&format!(".{}", role.allowed_base_domain))
                {
                    if HOSTNAME_REGEX.is_match(trimmed) {
                        continue;
                    }
                }

                if is_wildcard && sanitized == role.allowed_base_domain {
                    continue;
                }
            }
        }

        return Some(name.clone());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn base_role() -> RoleEntry {
        RoleEntry {
            enforce_hostnames: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_list_admits_trivially() {
        let role = RoleEntry::default();
        assert_eq!(validate_names("token", &[], &role), None);
    }

    #[test]
    fn test_allow_any_name_admits_everything_within_grammar() {
        let role = RoleEntry {
            allow_any_name: true,
            ..base_role()
        };
        assert_eq!(
            validate_names("token", &names(&["svc.internal", "a.b.c.d", "x-1.y"]), &role),
            None
        );
        // Hostname enforcement still applies before the any-name rule.
        assert_eq!(
            validate_names("token", &names(&["under_score.example.com"]), &role),
            Some("under_score.example.com".to_string())
        );
    }

    #[test]
    fn test_any_name_without_hostname_enforcement() {
        let role = RoleEntry {
            allow_any_name: true,
            enforce_hostnames: false,
            ..Default::default()
        };
        assert_eq!(validate_names("token", &names(&["any thing at all"]), &role), None);
    }

    #[test]
    fn test_email_rejected_before_any_allow_list() {
        // An email with neither email protection nor any-name set is rejected
        // immediately, even when the domain would otherwise be admitted.
        let role = RoleEntry {
            allowed_base_domain: "example.com".to_string(),
            allow_base_domain: true,
            allow_subdomains: true,
            ..base_role()
        };
        assert_eq!(
            validate_names("token", &names(&["user@example.com"]), &role),
            Some("user@example.com".to_string())
        );
    }

    #[test]
    fn test_email_domain_admission() {
        let role = RoleEntry {
            email_protection_flag: true,
            allowed_base_domain: "example.com".to_string(),
            allow_base_domain: true,
            ..base_role()
        };
        assert_eq!(validate_names("token", &names(&["user@example.com"]), &role), None);
        assert_eq!(
            validate_names("token", &names(&["user@other.com"]), &role),
            Some("user@other.com".to_string())
        );
        // Multiple @ signs never split cleanly.
        assert_eq!(
            validate_names("token", &names(&["a@b@example.com"]), &role),
            Some("a@b@example.com".to_string())
        );
    }

    #[test]
    fn test_localhost_admission() {
        let role = RoleEntry {
            allow_localhost: true,
            ..base_role()
        };
        assert_eq!(validate_names("token", &names(&["localhost"]), &role), None);
        assert_eq!(
            validate_names("token", &names(&["notlocalhost"]), &role),
            Some("notlocalhost".to_string())
        );
    }

    #[test]
    fn test_token_display_name_admission() {
        let role = RoleEntry {
            allow_token_display_name: true,
            ..base_role()
        };
        assert_eq!(validate_names("token-abc", &names(&["token-abc"]), &role), None);
        assert_eq!(
            validate_names("token-abc", &names(&["sub.token-abc"]), &role),
            Some("sub.token-abc".to_string())
        );

        let role = RoleEntry {
            allow_token_display_name: true,
            allow_subdomains: true,
            ..base_role()
        };
        assert_eq!(validate_names("token-abc", &names(&["sub.token-abc"]), &role), None);
    }

    #[test]
    fn test_base_domain_and_subdomains() {
        let role = RoleEntry {
            allowed_base_domain: "example.com".to_string(),
            allow_base_domain: true,
            ..base_role()
        };
        assert_eq!(validate_names("token", &names(&["example.com"]), &role), None);
        assert_eq!(
            validate_names("token", &names(&["host.example.com"]), &role),
            Some("host.example.com".to_string())
        );

        let role = RoleEntry {
            allowed_base_domain: "example.com".to_string(),
            allow_subdomains: true,
            ..base_role()
        };
        assert_eq!(validate_names("token", &names(&["host.example.com"]), &role), None);
        // Subdomains alone do not admit the bare base domain.
        assert_eq!(
            validate_names("token", &names(&["example.com"]), &role),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn test_first_offender_is_reported() {
        let role = RoleEntry {
            allowed_base_domain: "example.com".to_string(),
            allow_subdomains: true,
            ..base_role()
        };
        assert_eq!(
            validate_names(
                "token",
                &names(&["a.example.com", "bad.other.com", "c.other.com"]),
                &role
            ),
            Some("bad.other.com".to_string())
        );
    }

    #[test]
    fn test_wildcard_admission() {
        // "*.example.com" is admitted iff the stripped form equals the
        // allowed base domain and base-domain or subdomain issuance is on,
        // or the role allows any name.
        let admitted = |role: &RoleEntry| {
            validate_names("token", &names(&["*.example.com"]), role).is_none()
        };

        let mut role = RoleEntry {
            allowed_base_domain: "example.com".to_string(),
            allow_subdomains: true,
            ..base_role()
        };
        assert!(admitted(&role));

        role.allow_subdomains = false;
        role.allow_base_domain = true;
        // A wildcard is not the base domain itself: after stripping, the
        // raw name "*.example.com" matches neither the exact check nor the
        // subdomain suffix check.
        assert!(!admitted(&role));

        role.allow_base_domain = false;
        assert!(!admitted(&role));

        role.allow_any_name = true;
        assert!(admitted(&role));

        let other = RoleEntry {
            allowed_base_domain: "other.com".to_string(),
            allow_subdomains: true,
            ..base_role()
        };
        assert!(validate_names("token", &names(&["*.example.com"]), &other).is_some());
    }

    #[test]
    fn test_double_wildcard_rejected_under_hostname_enforcement() {
        let role = RoleEntry {
            allowed_base_domain: "example.com".to_string(),
            allow_subdomains: true,
            ..base_role()
        };
        assert_eq!(
            validate_names("token", &names(&["*.*.example.com"]), &role),
            Some("*.*.example.com".to_string())
        );
    }

    #[test]
    fn test_hostname_grammar_edges() {
        let role = RoleEntry {
            allow_any_name: true,
            ..base_role()
        };
        // Leading/trailing hyphens in a label fail the grammar.
        for bad in ["-host.example.com", "host-.example.com", "", "host..example.com"] {
            assert!(
                validate_names("token", &names(&[bad]), &role).is_some(),
                "expected rejection of {bad:?}"
            );
        }
        for good in ["a", "a-b", "0.example.com", "xn--e1afmkfd.example"] {
            assert!(
                validate_names("token", &names(&[good]), &role).is_none(),
                "expected admission of {good:?}"
            );
        }
    }

    #[test]
    fn test_widening_allow_flags_is_monotonic() {
        // Widening any allow flag from false to true never turns an admitted
        // name into a rejected one. Exhaustively checks the six admission
        // toggles against a mixed name list, with hostname enforcement held
        // fixed on both settings.
        let samples = names(&[
            "localhost",
            "example.com",
            "host.example.com",
            "*.example.com",
            "token-abc",
            "sub.token-abc",
            "user@example.com",
            "user@localhost",
            "unrelated.net",
        ]);

        let build = |mask: u32, enforce: bool| RoleEntry {
            allow_any_name: mask & 1 != 0,
            allow_localhost: mask & 2 != 0,
            allow_subdomains: mask & 4 != 0,
            allow_token_display_name: mask & 8 != 0,
            allow_base_domain: mask & 16 != 0,
            email_protection_flag: mask & 32 != 0,
            enforce_hostnames: enforce,
            allowed_base_domain: "example.com".to_string(),
            ..Default::default()
        };

        for enforce in [false, true] {
            for narrow in 0u32..64 {
                for bit in 0..6 {
                    let wide = narrow | (1 << bit);
                    if wide == narrow {
                        continue;
                    }
                    let narrow_role = build(narrow, enforce);
                    let wide_role = build(wide, enforce);
                    for name in &samples {
                        let one = std::slice::from_ref(name);
                        let was_admitted =
                            validate_names("token-abc", one, &narrow_role).is_none();
                        let still_admitted =
                            validate_names("token-abc", one, &wide_role).is_none();
                        assert!(
                            !was_admitted || still_admitted,
                            "widening bit {bit} rejected previously admitted {name} (mask {narrow:#b}, enforce {enforce})"
                        );
                    }
                }
            }
        }
    }
}
