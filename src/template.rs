//! Template construction and signing
//!
//! Certificates and certification requests are assembled at the DER level:
//! build the to-be-signed structure, encode it, sign with the issuing key,
//! then wrap the signature into the outer SEQUENCE. Freshly signed bytes are
//! parsed back before they leave this module; a parse failure at that point
//! means we produced garbage and is reported as an internal error.

use std::net::IpAddr;
use std::time::Duration;

use const_oid::AssociatedOid;
use der::{
    asn1::{BitString, Ia5String, ObjectIdentifier, OctetString, SetOfVec},
    Any, Decode, Encode,
};
use x509_cert::{
    attr::{Attribute, Attributes},
    certificate::{TbsCertificate, Version},
    ext::{
        pkix::{
            crl::dp::DistributionPoint,
            name::{DistributionPointName, GeneralName},
            AccessDescription, AuthorityInfoAccessSyntax, AuthorityKeyIdentifier,
            BasicConstraints, CrlDistributionPoints, ExtendedKeyUsage, KeyUsage, KeyUsages,
            SubjectAltName, SubjectKeyIdentifier,
        },
        Extension, Extensions,
    },
    request::{CertReq, CertReqInfo},
    serial_number::SerialNumber,
    time::Validity,
    Certificate,
};

use crate::{
    bundle::{common_name_to_name, ParsedCertBundle, ParsedCsrBundle, PathLength},
    error::{Error, Result},
    issue::{CertUsage, CreationBundle},
    key::{subject_key_id_from_spki, verify_csr_signature, KeyPair},
};

const ID_KP_SERVER_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.1");
const ID_KP_CLIENT_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.2");
const ID_KP_CODE_SIGNING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.3");
const ID_KP_EMAIL_PROTECTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.4");
const ID_KP_OCSP_SIGNING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.9");
const ID_AD_OCSP: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.1");
const ID_AD_CA_ISSUERS: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.2");
const EXTENSION_REQUEST_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");

/// Performs the heavy lifting of creating a certificate: generates the key,
/// fills in the template, and signs with either the signing bundle's key or
/// the fresh key itself (self-signed root).
pub fn create_certificate(creation: &CreationBundle<'_>) -> Result<ParsedCertBundle> {
    if creation.is_ca {
        if let Some(signing) = creation.signing_bundle {
            if signing.max_path_length() == PathLength::Limited(0) {
                return Err(Error::user(
                    "signing certificate has a max path length of zero, and cannot issue further CA certificates",
                ));
            }
        }
    }

    let serial_number = generate_serial_number()?;
    let key_pair = KeyPair::generate(&creation.key_type, creation.key_bits)?;
    let subject_key_id = key_pair.subject_key_id()?;

    let subject = common_name_to_name(&creation.common_name)?;

    let mut key_usage =
        KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment | KeyUsages::KeyAgreement;
    if creation.is_ca {
        key_usage |= KeyUsages::KeyCertSign;
        key_usage |= KeyUsages::CRLSign;
    }

    let mut extensions: Extensions = Vec::new();
    extensions.push(extension(&KeyUsage(key_usage), true)?);

    let eku = extended_key_usages(creation.usage, creation.is_ca);
    if !eku.is_empty() {
        extensions.push(extension(&ExtendedKeyUsage(eku), false)?);
    }

    if creation.is_ca {
        extensions.push(basic_constraints_extension(creation.max_path_length)?);
    }

    extensions.push(subject_key_id_extension(subject_key_id.clone())?);

    let authority_key_id = match creation.signing_bundle {
        Some(signing) => subject_key_id_of(&signing.certificate),
        None => Some(subject_key_id),
    };
    if let Some(key_id) = authority_key_id {
        extensions.push(authority_key_id_extension(key_id)?);
    }

    if let Some(san) = subject_alt_name(
        &creation.dns_names,
        &creation.email_addresses,
        &creation.ip_addresses,
    )? {
        extensions.push(extension(&san, false)?);
    }

    if let Some(aia) = authority_info_access(
        &creation.urls.ocsp_servers,
        &creation.urls.issuing_certificates,
    )? {
        extensions.push(aia);
    }
    if let Some(crldp) = crl_distribution_points(&creation.urls.crl_distribution_points)? {
        extensions.push(crldp);
    }

    let (issuer, signature_algorithm) = match creation.signing_bundle {
        Some(signing) => (
            signing.certificate.tbs_certificate.subject.clone(),
            signing.private_key.signature_algorithm(),
        ),
        None => (subject.clone(), key_pair.signature_algorithm()),
    };

    let tbs = TbsCertificate {
        version: Version::V3,
        serial_number,
        signature: signature_algorithm,
        issuer,
        validity: validity_for_ttl(creation.ttl)?,
        subject,
        subject_public_key_info: key_pair.subject_public_key_info()?,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(extensions),
    };

    let certificate = match creation.signing_bundle {
        Some(signing) => sign_tbs(tbs, &signing.private_key)?,
        None => sign_tbs(tbs, &key_pair)?,
    };

    let certificate_bytes = certificate
        .to_der()
        .map_err(|e| Error::internal(format!("unable to create certificate: {e}")))?;
    let parsed = Certificate::from_der(&certificate_bytes)
        .map_err(|e| Error::internal(format!("unable to parse created certificate: {e}")))?;

    let (issuing_ca_bytes, issuing_ca) = match creation.signing_bundle {
        Some(signing) => (
            signing.certificate_bytes.clone(),
            signing.certificate.clone(),
        ),
        None => (certificate_bytes.clone(), parsed.clone()),
    };

    Ok(ParsedCertBundle {
        certificate_bytes,
        certificate: parsed,
        issuing_ca_bytes,
        issuing_ca: Some(issuing_ca),
        private_key: Some(key_pair),
    })
}

/// Creates a certification request. Only used when generating an
/// intermediate whose certificate will be signed elsewhere.
pub fn create_csr(creation: &CreationBundle<'_>) -> Result<ParsedCsrBundle> {
    let key_pair = KeyPair::generate(&creation.key_type, creation.key_bits)?;

    // Like many root CAs, subject information beyond the CN is ignored.
    let subject = common_name_to_name(&creation.common_name)?;

    let mut attributes = Attributes::default();
    if let Some(san) = subject_alt_name(
        &creation.dns_names,
        &creation.email_addresses,
        &creation.ip_addresses,
    )? {
        let requested: Extensions = vec![extension(&san, false)?];
        let value = Any::encode_from(&requested)
            .map_err(|e| Error::internal(format!("unable to create certificate request: {e}")))?;
        let mut values = SetOfVec::new();
        values
            .insert(value)
            .map_err(|e| Error::internal(format!("unable to create certificate request: {e}")))?;
        attributes
            .insert(Attribute {
                oid: EXTENSION_REQUEST_OID,
                values,
            })
            .map_err(|e| Error::internal(format!("unable to create certificate request: {e}")))?;
    }

    let info = CertReqInfo {
        version: x509_cert::request::Version::V1,
        subject,
        public_key: key_pair.subject_public_key_info()?,
        attributes,
    };

    let message = info
        .to_der()
        .map_err(|e| Error::internal(format!("unable to create certificate request: {e}")))?;
    let signature = key_pair.sign(&message)?;
    let algorithm = key_pair.signature_algorithm();

    let csr = CertReq {
        info,
        algorithm,
        signature: BitString::from_bytes(&signature)
            .map_err(|e| Error::internal(format!("unable to create certificate request: {e}")))?,
    };

    let csr_bytes = csr
        .to_der()
        .map_err(|e| Error::internal(format!("unable to create certificate request: {e}")))?;
    let parsed = CertReq::from_der(&csr_bytes).map_err(|e| {
        Error::internal(format!("unable to parse created certificate request: {e}"))
    })?;

    Ok(ParsedCsrBundle {
        private_key: key_pair,
        csr_bytes,
        csr: parsed,
    })
}

/// Signs a certificate from a verified CSR. Returns a bundle without a
/// private key; the requestor kept theirs.
pub fn sign_certificate(creation: &CreationBundle<'_>, csr: &CertReq) -> Result<ParsedCertBundle> {
    let signing = creation.signing_bundle.ok_or_else(|| {
        Error::user("no signing bundle given to the certificate signing operation")
    })?;

    verify_csr_signature(csr)?;

    let serial_number = generate_serial_number()?;
    let spki_der = csr
        .info
        .public_key
        .to_der()
        .map_err(|e| Error::internal(format!("error marshalling public key: {e}")))?;
    let subject_key_id = subject_key_id_from_spki(&spki_der);

    let mut subject = common_name_to_name(&creation.common_name)?;
    let mut extensions: Extensions = Vec::new();
    let mut extra_extensions: Extensions = Vec::new();
    let mut dns_names = creation.dns_names.clone();
    let mut email_addresses = creation.email_addresses.clone();
    let mut ip_addresses = creation.ip_addresses.clone();

    if creation.use_csr_values {
        subject = csr.info.subject.clone();

        let requested = csr_requested_extensions(csr)?;
        // Refuse CA rights requested through a non-CA endpoint before any
        // bytes are produced.
        if !creation.is_ca
            && requested
                .iter()
                .any(|ext| ext.extn_id == BasicConstraints::OID)
        {
            return Err(Error::user(
                "will not sign a CSR asking for CA rights through this endpoint",
            ));
        }

        (dns_names, email_addresses, ip_addresses) = san_from_extensions(&requested)?;
        extra_extensions = requested;
    } else {
        let mut key_usage =
            KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment | KeyUsages::KeyAgreement;
        if creation.is_ca {
            key_usage |= KeyUsages::KeyCertSign;
            key_usage |= KeyUsages::CRLSign;
        }
        extensions.push(extension(&KeyUsage(key_usage), true)?);

        let eku = extended_key_usages(creation.usage, creation.is_ca);
        if !eku.is_empty() {
            extensions.push(extension(&ExtendedKeyUsage(eku), false)?);
        }
    }

    if creation.is_ca {
        if signing.max_path_length() == PathLength::Limited(0) {
            return Err(Error::user(
                "signing certificate has a max path length of zero, and cannot issue further CA certificates",
            ));
        }
        extensions.push(basic_constraints_extension(creation.max_path_length)?);
    }

    extensions.push(subject_key_id_extension(subject_key_id)?);
    if let Some(key_id) = subject_key_id_of(&signing.certificate) {
        extensions.push(authority_key_id_extension(key_id)?);
    }

    if let Some(san) = subject_alt_name(&dns_names, &email_addresses, &ip_addresses)? {
        extensions.push(extension(&san, false)?);
    }

    // Sign-from-CSR publishes the signing CA's OCSP servers; the other two
    // URL sets come from the creation bundle.
    if let Some(aia) = authority_info_access(
        &signing.urls.ocsp_servers,
        &creation.urls.issuing_certificates,
    )? {
        extensions.push(aia);
    }
    if let Some(crldp) = crl_distribution_points(&creation.urls.crl_distribution_points)? {
        extensions.push(crldp);
    }

    // Requested extensions ride along, except where this template already
    // produced the same OID.
    for ext in extra_extensions {
        if extensions.iter().all(|have| have.extn_id != ext.extn_id) {
            extensions.push(ext);
        }
    }

    let tbs = TbsCertificate {
        version: Version::V3,
        serial_number,
        signature: signing.private_key.signature_algorithm(),
        issuer: signing.certificate.tbs_certificate.subject.clone(),
        validity: validity_for_ttl(creation.ttl)?,
        subject,
        subject_public_key_info: csr.info.public_key.clone(),
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(extensions),
    };

    let certificate = sign_tbs(tbs, &signing.private_key)?;
    let certificate_bytes = certificate
        .to_der()
        .map_err(|e| Error::internal(format!("unable to create certificate: {e}")))?;
    let parsed = Certificate::from_der(&certificate_bytes)
        .map_err(|e| Error::internal(format!("unable to parse created certificate: {e}")))?;

    Ok(ParsedCertBundle {
        certificate_bytes,
        certificate: parsed,
        issuing_ca_bytes: signing.certificate_bytes.clone(),
        issuing_ca: Some(signing.certificate.clone()),
        private_key: None,
    })
}

/// A random positive serial. Kept at a fixed 20-octet magnitude so every
/// serial carries well over 128 bits of entropy.
pub(crate) fn generate_serial_number() -> Result<SerialNumber> {
    let mut bytes = [0u8; 20];
    getrandom::fill(&mut bytes)
        .map_err(|e| Error::internal(format!("unable to generate serial number: {e}")))?;
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    SerialNumber::new(&bytes)
        .map_err(|e| Error::internal(format!("unable to generate serial number: {e}")))
}

fn validity_for_ttl(ttl: Duration) -> Result<Validity> {
    Validity::from_now(ttl)
        .map_err(|e| Error::internal(format!("unable to compute certificate validity: {e}")))
}

fn extension<T: AssociatedOid + Encode>(value: &T, critical: bool) -> Result<Extension> {
    let body = value
        .to_der()
        .map_err(|e| Error::internal(format!("error encoding extension: {e}")))?;
    Ok(Extension {
        extn_id: T::OID,
        critical,
        extn_value: OctetString::new(body)
            .map_err(|e| Error::internal(format!("error encoding extension: {e}")))?,
    })
}

fn basic_constraints_extension(max_path_length: PathLength) -> Result<Extension> {
    let path_len_constraint = match max_path_length {
        PathLength::Unconstrained => None,
        // An explicit zero is encoded so parsers can tell it apart from an
        // absent constraint.
        PathLength::Limited(n) => Some(n),
    };
    extension(
        &BasicConstraints {
            ca: true,
            path_len_constraint,
        },
        true,
    )
}

fn subject_key_id_extension(key_id: Vec<u8>) -> Result<Extension> {
    let ski = SubjectKeyIdentifier(
        OctetString::new(key_id)
            .map_err(|e| Error::internal(format!("error getting subject key ID: {e}")))?,
    );
    extension(&ski, false)
}

fn authority_key_id_extension(key_id: Vec<u8>) -> Result<Extension> {
    let aki = AuthorityKeyIdentifier {
        key_identifier: Some(
            OctetString::new(key_id)
                .map_err(|e| Error::internal(format!("error encoding extension: {e}")))?,
        ),
        authority_cert_issuer: None,
        authority_cert_serial_number: None,
    };
    extension(&aki, false)
}

fn subject_key_id_of(certificate: &Certificate) -> Option<Vec<u8>> {
    let extensions = certificate.tbs_certificate.extensions.as_ref()?;
    for ext in extensions {
        if ext.extn_id == SubjectKeyIdentifier::OID {
            if let Ok(ski) = SubjectKeyIdentifier::from_der(ext.extn_value.as_bytes()) {
                return Some(ski.0.as_bytes().to_vec());
            }
        }
    }
    None
}

fn uri(url: &str) -> Result<Ia5String> {
    Ia5String::new(url).map_err(|e| Error::user(format!("invalid URL \"{url}\": {e}")))
}

fn subject_alt_name(
    dns_names: &[String],
    email_addresses: &[String],
    ip_addresses: &[IpAddr],
) -> Result<Option<SubjectAltName>> {
    let mut names = Vec::new();
    for name in dns_names {
        names.push(GeneralName::DnsName(Ia5String::new(name).map_err(|e| {
            Error::user(format!("invalid DNS name \"{name}\": {e}"))
        })?));
    }
    for email in email_addresses {
        names.push(GeneralName::Rfc822Name(Ia5String::new(email).map_err(
            |e| Error::user(format!("invalid email address \"{email}\": {e}")),
        )?));
    }
    for ip in ip_addresses {
        let octets = match ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        names.push(GeneralName::IpAddress(OctetString::new(octets).map_err(
            |e| Error::internal(format!("error encoding extension: {e}")),
        )?));
    }

    if names.is_empty() {
        Ok(None)
    } else {
        Ok(Some(SubjectAltName(names)))
    }
}

fn extended_key_usages(usage: CertUsage, is_ca: bool) -> Vec<ObjectIdentifier> {
    let mut out = Vec::new();
    if usage.contains(CertUsage::SERVER) {
        out.push(ID_KP_SERVER_AUTH);
    }
    if usage.contains(CertUsage::CLIENT) {
        out.push(ID_KP_CLIENT_AUTH);
    }
    if usage.contains(CertUsage::CODE_SIGNING) {
        out.push(ID_KP_CODE_SIGNING);
    }
    if usage.contains(CertUsage::EMAIL_PROTECTION) {
        out.push(ID_KP_EMAIL_PROTECTION);
    }
    if is_ca {
        out.push(ID_KP_OCSP_SIGNING);
    }
    out
}

fn authority_info_access(
    ocsp_servers: &[String],
    issuing_certificates: &[String],
) -> Result<Option<Extension>> {
    let mut descriptions = Vec::new();
    for url in ocsp_servers {
        descriptions.push(AccessDescription {
            access_method: ID_AD_OCSP,
            access_location: GeneralName::UniformResourceIdentifier(uri(url)?),
        });
    }
    for url in issuing_certificates {
        descriptions.push(AccessDescription {
            access_method: ID_AD_CA_ISSUERS,
            access_location: GeneralName::UniformResourceIdentifier(uri(url)?),
        });
    }

    if descriptions.is_empty() {
        return Ok(None);
    }
    Ok(Some(extension(
        &AuthorityInfoAccessSyntax(descriptions),
        false,
    )?))
}

fn crl_distribution_points(urls: &[String]) -> Result<Option<Extension>> {
    if urls.is_empty() {
        return Ok(None);
    }
    let mut points = Vec::new();
    for url in urls {
        points.push(DistributionPoint {
            distribution_point: Some(DistributionPointName::FullName(vec![
                GeneralName::UniformResourceIdentifier(uri(url)?),
            ])),
            reasons: None,
            crl_issuer: None,
        });
    }
    Ok(Some(extension(&CrlDistributionPoints(points), false)?))
}

fn sign_tbs(tbs: TbsCertificate, key: &KeyPair) -> Result<Certificate> {
    let signature_algorithm = tbs.signature.clone();
    let message = tbs
        .to_der()
        .map_err(|e| Error::internal(format!("unable to create certificate: {e}")))?;
    let signature = key.sign(&message)?;
    Ok(Certificate {
        tbs_certificate: tbs,
        signature_algorithm,
        signature: BitString::from_bytes(&signature)
            .map_err(|e| Error::internal(format!("unable to create certificate: {e}")))?,
    })
}

/// Extensions carried in the CSR's extensionRequest attribute, if any.
fn csr_requested_extensions(csr: &CertReq) -> Result<Extensions> {
    for attr in csr.info.attributes.iter() {
        if attr.oid != EXTENSION_REQUEST_OID {
            continue;
        }
        if let Some(value) = attr.values.iter().next() {
            return value
                .decode_as::<Extensions>()
                .map_err(|_| Error::user("certificate request could not be parsed"));
        }
    }
    Ok(Vec::new())
}

/// Splits a requested SubjectAltName extension back into DNS, email, and IP
/// lists. Unrecognized general-name forms are ignored.
fn san_from_extensions(extensions: &Extensions) -> Result<(Vec<String>, Vec<String>, Vec<IpAddr>)> {
    let mut dns_names = Vec::new();
    let mut email_addresses = Vec::new();
    let mut ip_addresses = Vec::new();

    for ext in extensions {
        if ext.extn_id != SubjectAltName::OID {
            continue;
        }
        let san = SubjectAltName::from_der(ext.extn_value.as_bytes())
            .map_err(|_| Error::user("certificate request could not be parsed"))?;
        for name in san.0 {
            match name {
                GeneralName::DnsName(value) => dns_names.push(value.to_string()),
                GeneralName::Rfc822Name(value) => email_addresses.push(value.to_string()),
                GeneralName::IpAddress(value) => {
                    let bytes = value.as_bytes();
                    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
                        ip_addresses.push(IpAddr::from(octets));
                    } else if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
                        ip_addresses.push(IpAddr::from(octets));
                    }
                }
                _ => {}
            }
        }
    }

    Ok((dns_names, email_addresses, ip_addresses))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_serial_numbers_are_unique_and_large() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let serial = generate_serial_number().unwrap();
            let bytes = serial.as_bytes().to_vec();
            // Fixed 20-octet magnitude, positive, leading octet nonzero.
            assert_eq!(bytes.len(), 20);
            assert!(bytes[0] & 0x80 == 0);
            assert!(bytes[0] != 0);
            assert!(seen.insert(bytes), "serial collision");
        }
    }

    #[test]
    fn test_extended_key_usages_mask() {
        let usage = CertUsage::SERVER | CertUsage::EMAIL_PROTECTION;
        let ekus = extended_key_usages(usage, false);
        assert_eq!(ekus, vec![ID_KP_SERVER_AUTH, ID_KP_EMAIL_PROTECTION]);

        let ekus = extended_key_usages(CertUsage::default(), true);
        assert_eq!(ekus, vec![ID_KP_OCSP_SIGNING]);
    }

    #[test]
    fn test_subject_alt_name_empty_is_none() {
        assert!(subject_alt_name(&[], &[], &[]).unwrap().is_none());
    }

    #[test]
    fn test_san_roundtrip_through_extension() {
        let dns = vec!["svc.internal".to_string()];
        let emails = vec!["ops@example.com".to_string()];
        let ips = vec!["10.0.0.1".parse().unwrap(), "::1".parse().unwrap()];
        let san = subject_alt_name(&dns, &emails, &ips).unwrap().unwrap();
        let ext = extension(&san, false).unwrap();

        let (dns2, emails2, ips2) = san_from_extensions(&vec![ext]).unwrap();
        assert_eq!(dns2, dns);
        assert_eq!(emails2, emails);
        assert_eq!(ips2, ips);
    }

    #[test]
    fn test_url_extensions_absent_when_empty() {
        assert!(authority_info_access(&[], &[]).unwrap().is_none());
        assert!(crl_distribution_points(&[]).unwrap().is_none());
    }
}
