//! Certificate bundle types
//!
//! The storage collaborator hands us an opaque JSON record (`CertBundle`);
//! everything the signer works with is the parsed form. Conversions between
//! the two live here, together with the small pieces of X.509 bookkeeping
//! the rest of the crate leans on: common-name handling, path-length
//! extraction, serial formatting.

use const_oid::AssociatedOid;
use der::{
    asn1::{ObjectIdentifier, PrintableStringRef, SetOfVec, Utf8StringRef},
    Decode,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use x509_cert::{
    attr::AttributeTypeAndValue,
    ext::pkix::BasicConstraints,
    name::{Name, RdnSequence, RelativeDistinguishedName},
    request::CertReq,
    time::Time,
    Certificate,
};

use crate::{
    error::{Error, Result},
    key::{KeyPair, PrivateKeyType},
};

const COMMON_NAME_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

/// Path-length constraint of a CA certificate.
///
/// Zero is meaningful ("no further CAs below this one") and must stay
/// distinguishable from "no constraint", so this is a tagged variant rather
/// than an integer with a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathLength {
    Unconstrained,
    Limited(u8),
}

/// URLs a CA publishes into the certificates it issues. Absent records are
/// represented by empty sequences, never by a missing field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlEntries {
    pub issuing_certificates: Vec<String>,
    pub crl_distribution_points: Vec<String>,
    pub ocsp_servers: Vec<String>,
}

/// Storage form of a certificate bundle: PEM blocks plus bookkeeping tags,
/// JSON-encoded at rest by the router.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CertBundle {
    pub certificate: String,
    pub issuing_ca: String,
    pub private_key: String,
    pub private_key_type: String,
    pub serial_number: String,
}

impl CertBundle {
    /// Parses the PEM blocks into usable structures. An empty certificate
    /// field is an error; issuing CA and private key are optional.
    pub fn to_parsed_cert_bundle(&self) -> Result<ParsedCertBundle> {
        if self.certificate.is_empty() {
            return Err(Error::user("bundle contains no certificate".to_string()));
        }
        let (certificate_bytes, certificate) = certificate_from_pem(&self.certificate)?;

        let (issuing_ca_bytes, issuing_ca) = if self.issuing_ca.is_empty() {
            (Vec::new(), None)
        } else {
            let (der, parsed) = certificate_from_pem(&self.issuing_ca)?;
            (der, Some(parsed))
        };

        let private_key = if self.private_key.is_empty() {
            None
        } else {
            Some(KeyPair::from_pem(&self.private_key)?)
        };

        Ok(ParsedCertBundle {
            certificate_bytes,
            certificate,
            issuing_ca_bytes,
            issuing_ca,
            private_key,
        })
    }
}

/// A fully parsed certificate bundle: the issued certificate, the CA that
/// signed it, and (when one was generated here) the private key.
#[derive(Debug)]
pub struct ParsedCertBundle {
    pub certificate_bytes: Vec<u8>,
    pub certificate: Certificate,
    pub issuing_ca_bytes: Vec<u8>,
    pub issuing_ca: Option<Certificate>,
    pub private_key: Option<KeyPair>,
}

impl ParsedCertBundle {
    pub fn private_key_type(&self) -> Option<PrivateKeyType> {
        self.private_key.as_ref().map(KeyPair::private_key_type)
    }

    /// Colon-separated lowercase hex form of the certificate serial.
    pub fn serial_number(&self) -> String {
        format_serial(self.certificate.tbs_certificate.serial_number.as_bytes())
    }

    /// Re-encodes the bundle into its PEM storage form.
    pub fn to_cert_bundle(&self) -> Result<CertBundle> {
        let certificate = pem::encode(&pem::Pem::new(
            "CERTIFICATE",
            self.certificate_bytes.clone(),
        ));
        let issuing_ca = if self.issuing_ca_bytes.is_empty() {
            String::new()
        } else {
            pem::encode(&pem::Pem::new("CERTIFICATE", self.issuing_ca_bytes.clone()))
        };
        let private_key = match &self.private_key {
            Some(key) => key.to_pkcs8_pem()?,
            None => String::new(),
        };
        let private_key_type = self
            .private_key_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default();

        Ok(CertBundle {
            certificate,
            issuing_ca,
            private_key,
            private_key_type,
            serial_number: self.serial_number(),
        })
    }
}

/// The signing bundle: the CA certificate, its private key, and the URL
/// entries it publishes. Borrowed read-only for the duration of a request.
#[derive(Debug)]
pub struct CaInfoBundle {
    pub certificate_bytes: Vec<u8>,
    pub certificate: Certificate,
    pub private_key: KeyPair,
    pub urls: UrlEntries,
}

impl CaInfoBundle {
    /// Promotes a parsed bundle into a signing bundle. The certificate and
    /// private key are both required to sign anything.
    pub fn from_parsed(parsed: ParsedCertBundle, urls: UrlEntries) -> Result<Self> {
        let private_key = parsed
            .private_key
            .ok_or_else(|| Error::internal("stored CA information not able to be parsed"))?;
        Ok(CaInfoBundle {
            certificate_bytes: parsed.certificate_bytes,
            certificate: parsed.certificate,
            private_key,
            urls,
        })
    }

    /// Path-length constraint of this CA's own certificate.
    pub fn max_path_length(&self) -> PathLength {
        certificate_path_length(&self.certificate)
    }

    pub fn not_after(&self) -> Result<OffsetDateTime> {
        time_to_offset(&self.certificate.tbs_certificate.validity.not_after)
    }
}

/// Storage form of a generated CSR bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrBundle {
    pub csr: String,
    pub private_key: String,
    pub private_key_type: String,
}

/// A generated certification request plus the key that backs it.
#[derive(Debug)]
pub struct ParsedCsrBundle {
    pub private_key: KeyPair,
    pub csr_bytes: Vec<u8>,
    pub csr: CertReq,
}

impl ParsedCsrBundle {
    pub fn to_csr_bundle(&self) -> Result<CsrBundle> {
        Ok(CsrBundle {
            csr: pem::encode(&pem::Pem::new("CERTIFICATE REQUEST", self.csr_bytes.clone())),
            private_key: self.private_key.to_pkcs8_pem()?,
            private_key_type: self.private_key.private_key_type().as_str().to_string(),
        })
    }
}

/// Decodes a single PEM "CERTIFICATE" block into DER bytes plus parsed form.
pub fn certificate_from_pem(pem_block: &str) -> Result<(Vec<u8>, Certificate)> {
    let block = pem::parse(pem_block)
        .map_err(|e| Error::user(format!("error decoding certificate PEM: {e}")))?;
    if block.tag() != "CERTIFICATE" {
        return Err(Error::user(format!(
            "expected a CERTIFICATE PEM block, got \"{}\"",
            block.tag()
        )));
    }
    let certificate = Certificate::from_der(block.contents())
        .map_err(|e| Error::user(format!("error parsing certificate: {e}")))?;
    Ok((block.contents().to_vec(), certificate))
}

/// Reads the path-length constraint out of a certificate's BasicConstraints
/// extension. Certificates without the extension (or without the optional
/// constraint) are unconstrained.
pub fn certificate_path_length(certificate: &Certificate) -> PathLength {
    let Some(extensions) = &certificate.tbs_certificate.extensions else {
        return PathLength::Unconstrained;
    };
    for ext in extensions.iter() {
        if ext.extn_id == BasicConstraints::OID {
            if let Ok(bc) = BasicConstraints::from_der(ext.extn_value.as_bytes()) {
                return match bc.path_len_constraint {
                    Some(n) => PathLength::Limited(n),
                    None => PathLength::Unconstrained,
                };
            }
        }
    }
    PathLength::Unconstrained
}

/// Builds a CN-only subject name.
pub fn common_name_to_name(common_name: &str) -> Result<Name> {
    let cn_value = Utf8StringRef::new(common_name)
        .map_err(|e| Error::user(format!("invalid common name: {e}")))?;
    let mut cn_set = SetOfVec::new();
    cn_set
        .insert(AttributeTypeAndValue {
            oid: COMMON_NAME_OID,
            value: der::Any::from(cn_value),
        })
        .map_err(|e| Error::internal(format!("error building subject: {e}")))?;
    let rdns = vec![RelativeDistinguishedName(cn_set)];
    Ok(Name::from(RdnSequence::from(rdns)))
}

/// Extracts the common name from a distinguished name, if present.
pub fn common_name_from_name(name: &Name) -> Option<String> {
    for rdn in name.0.iter() {
        for attr in rdn.0.iter() {
            if attr.oid != COMMON_NAME_OID {
                continue;
            }
            if let Ok(value) = Utf8StringRef::try_from(&attr.value) {
                return Some(value.as_str().to_string());
            }
            if let Ok(value) = PrintableStringRef::try_from(&attr.value) {
                return Some(value.as_str().to_string());
            }
        }
    }
    None
}

/// Converts an X.509 validity time into an `OffsetDateTime`.
pub(crate) fn time_to_offset(time: &Time) -> Result<OffsetDateTime> {
    let unix = match time {
        Time::UtcTime(t) => t.to_unix_duration(),
        Time::GeneralTime(t) => t.to_unix_duration(),
    };
    OffsetDateTime::from_unix_timestamp(unix.as_secs() as i64)
        .map_err(|e| Error::internal(format!("error converting certificate time: {e}")))
}

/// Colon-separated lowercase hex, the display form for serial numbers.
pub fn format_serial(serial: &[u8]) -> String {
    let hex = hex::encode(serial);
    let mut out = String::with_capacity(hex.len() + hex.len() / 2);
    for (i, ch) in hex.chars().enumerate() {
        if i > 0 && i % 2 == 0 {
            out.push(':');
        }
        out.push(ch);
    }
    out
}
