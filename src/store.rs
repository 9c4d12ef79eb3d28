//! Storage collaborator
//!
//! The router owns persistence; the core only reads from it. The CA bundle
//! sits at a well-known key, the published URL entries at another, and
//! issued certificates are resolved by serial for the revocation paths.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use crate::{
    bundle::{CaInfoBundle, CertBundle, UrlEntries},
    error::{Error, Result},
};

/// Storage key holding the CA's own certificate and private key.
pub const CA_BUNDLE_STORAGE_KEY: &str = "config/ca_bundle";

/// Storage key holding the URL entries the CA publishes.
pub const URLS_STORAGE_KEY: &str = "config/urls";

/// One opaque entry in the router's storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub key: String,
    pub value: Vec<u8>,
}

/// Read access to the router's storage. Reads are synchronous and are the
/// only points where the core may block.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StorageEntry>>;
}

/// In-memory storage, for embedding the core and for tests.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, value: Vec<u8>) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::internal("failed to acquire storage write lock"))?;
        entries.insert(key.into(), value);
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<StorageEntry>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::internal("failed to acquire storage read lock"))?;
        Ok(entries.get(key).map(|value| StorageEntry {
            key: key.to_string(),
            value: value.clone(),
        }))
    }
}

/// Lease TTL bounds the surrounding system supplies for roles that do not
/// pin their own.
#[derive(Debug, Clone, Copy)]
pub struct SystemDefaults {
    pub default_lease_ttl: Duration,
    pub max_lease_ttl: Duration,
}

impl Default for SystemDefaults {
    fn default() -> Self {
        // 32 days, the backend's customary lease ceiling.
        SystemDefaults {
            default_lease_ttl: Duration::from_secs(768 * 3600),
            max_lease_ttl: Duration::from_secs(768 * 3600),
        }
    }
}

/// Per-request context handed in by the router.
pub struct RequestContext<'a> {
    pub storage: &'a dyn Storage,
    /// Display name of the requesting token, used by name admission.
    pub display_name: String,
    pub system: SystemDefaults,
}

/// Fetches the signing bundle. The CA is stored as a full bundle because its
/// private key lives alongside the certificate.
pub fn fetch_ca_info(ctx: &RequestContext<'_>) -> Result<CaInfoBundle> {
    let entry = ctx
        .storage
        .get(CA_BUNDLE_STORAGE_KEY)
        .map_err(|e| Error::internal(format!("unable to fetch local CA certificate/key: {e}")))?
        .ok_or_else(|| Error::user("backend must be configured with a CA certificate/key"))?;

    let bundle: CertBundle = serde_json::from_slice(&entry.value)
        .map_err(|e| Error::internal(format!("unable to decode local CA certificate/key: {e}")))?;

    let parsed = bundle
        .to_parsed_cert_bundle()
        .map_err(|e| Error::internal(e.to_string()))?;

    let urls = fetch_url_entries(ctx)?.unwrap_or_default();
    CaInfoBundle::from_parsed(parsed, urls)
}

/// Reads the URL-entries record. A missing record is not an error; the
/// caller substitutes empty entries.
pub fn fetch_url_entries(ctx: &RequestContext<'_>) -> Result<Option<UrlEntries>> {
    let entry = ctx
        .storage
        .get(URLS_STORAGE_KEY)
        .map_err(|e| Error::internal(format!("unable to fetch URL information: {e}")))?;
    match entry {
        None => Ok(None),
        Some(entry) => {
            let urls: UrlEntries = serde_json::from_slice(&entry.value)
                .map_err(|e| Error::internal(format!("unable to fetch URL information: {e}")))?;
            Ok(Some(urls))
        }
    }
}

/// Resolves a certificate entry by serial, handling the separate pathing for
/// the CA certificate, the CRL, and revoked entries.
pub fn fetch_cert_by_serial(
    ctx: &RequestContext<'_>,
    prefix: &str,
    serial: &str,
) -> Result<StorageEntry> {
    let path = match serial {
        "ca" => "ca".to_string(),
        "crl" => "crl".to_string(),
        _ if prefix.starts_with("revoked/") => format!("revoked/{}", normalize_serial(serial)),
        _ => format!("certs/{}", normalize_serial(serial)),
    };

    let entry = ctx
        .storage
        .get(&path)
        .ok()
        .flatten()
        .ok_or_else(|| {
            Error::internal(format!("certificate with serial number {serial} not found"))
        })?;

    if entry.value.is_empty() {
        return Err(Error::internal(format!(
            "returned certificate bytes for serial {serial} were empty"
        )));
    }

    Ok(entry)
}

/// Serials are stored lowercase with colon separators.
pub fn normalize_serial(serial: &str) -> String {
    serial.to_lowercase().replace('-', ":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn ctx(storage: &MemoryStorage) -> RequestContext<'_> {
        RequestContext {
            storage,
            display_name: "token".to_string(),
            system: SystemDefaults::default(),
        }
    }

    #[test]
    fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("missing").unwrap(), None);
        storage.put("a", b"one".to_vec()).unwrap();
        assert_eq!(storage.get("a").unwrap().unwrap().value, b"one".to_vec());
    }

    #[test]
    fn test_fetch_ca_info_requires_configuration() {
        let storage = MemoryStorage::new();
        let err = fetch_ca_info(&ctx(&storage)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::User);
        assert!(err.to_string().contains("must be configured"));
    }

    #[test]
    fn test_fetch_ca_info_garbage_is_internal() {
        let storage = MemoryStorage::new();
        storage
            .put(CA_BUNDLE_STORAGE_KEY, b"not json".to_vec())
            .unwrap();
        let err = fetch_ca_info(&ctx(&storage)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_fetch_url_entries_absent_is_none() {
        let storage = MemoryStorage::new();
        assert_eq!(fetch_url_entries(&ctx(&storage)).unwrap(), None);

        let urls = UrlEntries {
            issuing_certificates: vec!["http://ca.example.com/ca.der".to_string()],
            ..Default::default()
        };
        storage
            .put(URLS_STORAGE_KEY, serde_json::to_vec(&urls).unwrap())
            .unwrap();
        assert_eq!(fetch_url_entries(&ctx(&storage)).unwrap(), Some(urls));
    }

    #[test]
    fn test_fetch_cert_by_serial_paths() {
        let storage = MemoryStorage::new();
        storage.put("ca", b"ca der".to_vec()).unwrap();
        storage.put("crl", b"crl der".to_vec()).unwrap();
        storage.put("certs/aa:bb", b"cert der".to_vec()).unwrap();
        storage
            .put("revoked/aa:bb", b"revoked der".to_vec())
            .unwrap();
        let context = ctx(&storage);

        assert_eq!(
            fetch_cert_by_serial(&context, "certs/", "ca").unwrap().key,
            "ca"
        );
        assert_eq!(
            fetch_cert_by_serial(&context, "certs/", "crl").unwrap().key,
            "crl"
        );
        assert_eq!(
            fetch_cert_by_serial(&context, "certs/", "AA-BB").unwrap().key,
            "certs/aa:bb"
        );
        assert_eq!(
            fetch_cert_by_serial(&context, "revoked/", "AA-BB").unwrap().key,
            "revoked/aa:bb"
        );
        assert!(fetch_cert_by_serial(&context, "certs/", "00-11").is_err());
    }

    #[test]
    fn test_empty_cert_entry_is_an_error() {
        let storage = MemoryStorage::new();
        storage.put("certs/aa", Vec::new()).unwrap();
        let err = fetch_cert_by_serial(&ctx(&storage), "certs/", "aa")
            .err()
            .unwrap();
        assert!(err.to_string().contains("were empty"));
    }
}
