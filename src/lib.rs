//! Bastion PKI - certificate issuance core
//!
//! The issuance core of the Bastion PKI secrets backend: role-driven name
//! admission, creation-bundle construction, X.509 template building, and
//! DER-level signing for leaves, intermediates, and self-signed roots. The
//! surrounding router owns storage and transport; this crate only consumes
//! a request context and produces parsed bundles.

pub mod bundle;
pub mod error;
pub mod issue;
pub mod key;
pub mod names;
pub mod role;
pub mod store;
pub mod template;

pub use bundle::{
    certificate_from_pem, certificate_path_length, format_serial, CaInfoBundle, CertBundle,
    CsrBundle, ParsedCertBundle, ParsedCsrBundle, PathLength, UrlEntries,
};
pub use error::{Error, ErrorKind, Result};
pub use issue::{
    generate_cert, generate_creation_bundle, generate_intermediate_csr, sign_cert, CertFormat,
    CertUsage, CreationBundle, IssueInput,
};
pub use key::{KeyPair, PrivateKeyType};
pub use names::validate_names;
pub use role::{validate_key_type_length, RoleEntry};
pub use store::{
    fetch_ca_info, fetch_cert_by_serial, fetch_url_entries, normalize_serial, MemoryStorage,
    RequestContext, Storage, StorageEntry, SystemDefaults, CA_BUNDLE_STORAGE_KEY,
    URLS_STORAGE_KEY,
};
pub use template::{create_certificate, create_csr, sign_certificate};

/// The most commonly used types and operations in one import.
pub mod prelude {
    pub use crate::{
        bundle::{CaInfoBundle, CertBundle, ParsedCertBundle, PathLength, UrlEntries},
        error::{Error, ErrorKind, Result},
        issue::{generate_cert, generate_intermediate_csr, sign_cert, IssueInput},
        key::{KeyPair, PrivateKeyType},
        role::RoleEntry,
        store::{fetch_ca_info, MemoryStorage, RequestContext, SystemDefaults},
    };
}
