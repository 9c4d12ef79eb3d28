//! Issuance operations
//!
//! The three entry points (`generate_cert`, `sign_cert`,
//! `generate_intermediate_csr`) all funnel through the creation-bundle
//! builder, which merges user input, role defaults, optional CSR-derived
//! values, TTL bounds, and the signing bundle into one immutable descriptor
//! for the template constructor.

use std::net::IpAddr;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use der::Decode;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use x509_cert::request::CertReq;

use crate::{
    bundle::{
        common_name_from_name, CaInfoBundle, ParsedCertBundle, ParsedCsrBundle, PathLength,
        UrlEntries,
    },
    error::{Error, Result},
    names::validate_names,
    role::RoleEntry,
    store::{fetch_url_entries, RequestContext},
    template::{create_certificate, create_csr, sign_certificate},
};

/// Set of certificate usages a role grants, kept as a small bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CertUsage(u8);

impl CertUsage {
    pub const SERVER: CertUsage = CertUsage(1);
    pub const CLIENT: CertUsage = CertUsage(1 << 1);
    pub const CODE_SIGNING: CertUsage = CertUsage(1 << 2);
    pub const EMAIL_PROTECTION: CertUsage = CertUsage(1 << 3);

    pub fn contains(self, other: CertUsage) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for CertUsage {
    type Output = CertUsage;

    fn bitor(self, rhs: CertUsage) -> CertUsage {
        CertUsage(self.0 | rhs.0)
    }
}

impl BitOrAssign for CertUsage {
    fn bitor_assign(&mut self, rhs: CertUsage) {
        self.0 |= rhs.0;
    }
}

/// Requested output encoding. Anything unrecognized collapses to
/// `Unspecified` rather than failing the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertFormat {
    Pem,
    Der,
    Unspecified,
}

/// User-supplied fields of an issuance request. Empty strings stand for
/// absent fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueInput {
    pub common_name: String,
    /// Comma-separated DNS or email subject alternative names.
    pub alt_names: String,
    /// Comma-separated IP subject alternative names.
    pub ip_sans: String,
    /// Requested TTL as a duration string.
    pub ttl: String,
    /// PEM-encoded PKCS#10 request; only consulted by `sign_cert`.
    pub csr: String,
    pub format: String,
}

impl IssueInput {
    pub fn format(&self) -> CertFormat {
        match self.format.as_str() {
            "pem" => CertFormat::Pem,
            "der" => CertFormat::Der,
            _ => CertFormat::Unspecified,
        }
    }
}

/// The immutable issuance descriptor handed to the template constructor.
#[derive(Debug)]
pub struct CreationBundle<'a> {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub email_addresses: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub is_ca: bool,
    pub key_type: String,
    pub key_bits: u32,
    pub signing_bundle: Option<&'a CaInfoBundle>,
    pub ttl: Duration,
    pub usage: CertUsage,

    /// Only used when signing a CA certificate from a CSR.
    pub use_csr_values: bool,

    /// URLs to encode into the certificate.
    pub urls: UrlEntries,

    /// The path length to encode when the template is a CA.
    pub max_path_length: PathLength,
}

/// Generates a key and issues a certificate: a leaf or intermediate under
/// the signing bundle, or a self-signed root when no bundle is given.
pub fn generate_cert(
    role: &RoleEntry,
    signing_bundle: Option<&CaInfoBundle>,
    is_ca: bool,
    ctx: &RequestContext<'_>,
    data: &IssueInput,
) -> Result<ParsedCertBundle> {
    let mut creation = generate_creation_bundle(role, signing_bundle, None, ctx, data)?;

    if is_ca {
        creation.is_ca = true;

        if signing_bundle.is_none() {
            // Self-signed root: URLs come fresh from storage and the path
            // length is whatever the role pins, if anything.
            creation.urls = fetch_url_entries(ctx)?.unwrap_or_default();
            creation.max_path_length = role
                .max_path_length
                .unwrap_or(PathLength::Unconstrained);
        }
    }

    create_certificate(&creation)
}

/// Generates a key and a certification request for an intermediate whose
/// certificate will be signed by some other authority. Skips the sanity
/// checks issuance proper would apply.
pub fn generate_intermediate_csr(
    role: &RoleEntry,
    signing_bundle: Option<&CaInfoBundle>,
    ctx: &RequestContext<'_>,
    data: &IssueInput,
) -> Result<ParsedCsrBundle> {
    let creation = generate_creation_bundle(role, signing_bundle, None, ctx, data)?;
    create_csr(&creation)
}

/// Signs a PEM-encoded PKCS#10 request under the signing bundle.
pub fn sign_cert(
    role: &RoleEntry,
    signing_bundle: &CaInfoBundle,
    is_ca: bool,
    use_csr_values: bool,
    ctx: &RequestContext<'_>,
    data: &IssueInput,
) -> Result<ParsedCertBundle> {
    if data.csr.is_empty() {
        return Err(Error::user("\"csr\" is empty"));
    }

    let block = pem::parse(&data.csr).map_err(|_| Error::user("csr contains no data"))?;
    if block.tag() != "CERTIFICATE REQUEST" && block.tag() != "NEW CERTIFICATE REQUEST" {
        return Err(Error::user("certificate request could not be parsed"));
    }
    let csr = CertReq::from_der(block.contents())
        .map_err(|_| Error::user("certificate request could not be parsed"))?;

    let mut creation = generate_creation_bundle(role, Some(signing_bundle), Some(&csr), ctx, data)?;
    creation.is_ca = is_ca;
    creation.use_csr_values = use_csr_values;

    sign_certificate(&creation, &csr)
}

/// Merges role, request data, and the optional CSR and signing bundle into a
/// creation bundle. Order matters: names are classified before IP SANs are
/// gated, TTLs are resolved before the CA expiry guard, and admission runs
/// once over DNS names and once over email addresses.
pub fn generate_creation_bundle<'a>(
    role: &RoleEntry,
    signing_bundle: Option<&'a CaInfoBundle>,
    csr: Option<&CertReq>,
    ctx: &RequestContext<'_>,
    data: &IssueInput,
) -> Result<CreationBundle<'a>> {
    // Get the common name(s).
    let mut common_name = String::new();
    if let Some(csr) = csr {
        if role.use_csr_common_name {
            common_name = common_name_from_name(&csr.info.subject).unwrap_or_default();
        }
    }
    if common_name.is_empty() {
        common_name = data.common_name.clone();
        if common_name.is_empty() {
            return Err(Error::user(
                "the common_name field is required, or must be provided in a CSR with \"use_csr_common_name\" set to true",
            ));
        }
    }

    let mut dns_names = Vec::new();
    let mut email_addresses = Vec::new();
    if common_name.contains('@') {
        email_addresses.push(common_name.clone());
    } else {
        dns_names.push(common_name.clone());
    }
    if !data.alt_names.is_empty() {
        for value in data.alt_names.split(',') {
            if value.contains('@') {
                email_addresses.push(common_name.clone());
            } else {
                dns_names.push(value.to_string());
            }
        }
    }

    // Get any IP SANs.
    let mut ip_addresses: Vec<IpAddr> = Vec::new();
    if !data.ip_sans.is_empty() {
        if !role.allow_ip_sans {
            return Err(Error::user(format!(
                "IP Subject Alternative Names are not allowed in this role, but was provided {}",
                data.ip_sans
            )));
        }
        for value in data.ip_sans.split(',') {
            let parsed: IpAddr = value.parse().map_err(|_| {
                Error::user(format!("the value '{value}' is not a valid IP address"))
            })?;
            ip_addresses.push(parsed);
        }
    }

    let user_supplied_ttl = !data.ttl.is_empty();
    let ttl_field = if user_supplied_ttl {
        data.ttl.as_str()
    } else {
        role.ttl.as_str()
    };

    let mut ttl = if ttl_field.is_empty() {
        ctx.system.default_lease_ttl
    } else {
        humantime::parse_duration(ttl_field)
            .map_err(|e| Error::user(format!("invalid requested ttl: {e}")))?
    };

    let max_ttl = if role.max_ttl.is_empty() {
        ctx.system.max_lease_ttl
    } else {
        humantime::parse_duration(&role.max_ttl)
            .map_err(|e| Error::user(format!("invalid ttl: {e}")))?
    };

    if ttl > max_ttl {
        // Only error when the requestor chose the TTL; inherited values are
        // clamped quietly.
        if user_supplied_ttl {
            return Err(Error::user(format!(
                "ttl is larger than maximum allowed ({}s)",
                max_ttl.as_secs()
            )));
        }
        ttl = max_ttl;
    }

    if let Some(signing) = signing_bundle {
        if OffsetDateTime::now_utc() + ttl > signing.not_after()? {
            return Err(Error::user(
                "cannot satisfy request, as TTL is beyond the expiration of the CA certificate",
            ));
        }
    }

    if let Some(bad_name) = validate_names(&ctx.display_name, &dns_names, role) {
        return Err(Error::user(format!(
            "name {bad_name} not allowed by this role"
        )));
    }
    if let Some(bad_name) = validate_names(&ctx.display_name, &email_addresses, role) {
        return Err(Error::user(format!(
            "email {bad_name} not allowed by this role"
        )));
    }

    let mut usage = CertUsage::default();
    if role.server_flag {
        usage |= CertUsage::SERVER;
    }
    if role.client_flag {
        usage |= CertUsage::CLIENT;
    }
    if role.code_signing_flag {
        usage |= CertUsage::CODE_SIGNING;
    }
    if role.email_protection_flag {
        usage |= CertUsage::EMAIL_PROTECTION;
    }

    let mut creation = CreationBundle {
        common_name,
        dns_names,
        email_addresses,
        ip_addresses,
        is_ca: false,
        key_type: role.key_type.clone(),
        key_bits: role.key_bits,
        signing_bundle,
        ttl,
        usage,
        use_csr_values: false,
        urls: UrlEntries::default(),
        max_path_length: PathLength::Unconstrained,
    };

    let Some(signing) = signing_bundle else {
        return Ok(creation);
    };

    creation.urls = signing.urls.clone();
    creation.max_path_length = match role.max_path_length {
        Some(path_length) => path_length,
        None => match signing.max_path_length() {
            PathLength::Unconstrained => PathLength::Unconstrained,
            // The signing function refuses to issue a CA under an explicit
            // zero; the value is carried through untouched.
            PathLength::Limited(0) => PathLength::Limited(0),
            PathLength::Limited(n) => PathLength::Limited(n - 1),
        },
    };

    Ok(creation)
}
