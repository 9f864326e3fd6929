use crate::time::datetime_to_millis;
use anyhow::{Context, Error, anyhow, bail};
use rcgen::CertificateSigningRequest;
use std::io::{BufRead, Cursor, Seek};
use tracing::warn;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::num_bigint::BigUint;
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;

/// The maximum number of certificates we will parse in a PEM-array of certificates by default
const DEFAULT_MAX_CERTIFICATE_CHAIN_LENGTH: usize = 100;

pub fn create_and_sign_csr(
    cert_key: &rcgen::KeyPair,
    domains: &[String],
) -> Result<CertificateSigningRequest, Error> {
    let mut cert_params =
        rcgen::CertificateParams::new(domains.to_vec()).context("CSR generation failed")?;
    // Ensure the DN is empty
    cert_params.distinguished_name = rcgen::DistinguishedName::default();
    let csr = cert_params
        .serialize_request(cert_key)
        .context("Signing CSR failed")?;
    Ok(csr)
}

pub fn load_certificates_from_memory<B: AsRef<[u8]>>(
    pem_bytes: B,
    limit: Option<usize>,
) -> anyhow::Result<Vec<ParsedX509Certificate>> {
    let reader = Cursor::new(pem_bytes);
    load_certificates_from_reader(reader, limit)
}

fn load_certificates_from_reader<R: BufRead + Seek>(
    reader: R,
    limit: Option<usize>,
) -> anyhow::Result<Vec<ParsedX509Certificate>> {
    let mut certificates = Vec::new();
    for pem in
        Pem::iter_from_reader(reader).take(limit.unwrap_or(DEFAULT_MAX_CERTIFICATE_CHAIN_LENGTH))
    {
        let pem = pem.context("Reading PEM block failed")?;
        let parsed_x509 = ParsedX509Certificate::try_from(pem.contents)?;
        certificates.push(parsed_x509);
    }
    Ok(certificates)
}

/// Parses the leaf of a PEM chain and checks that `private_key_pem` belongs to it.
///
/// This is the validity source for everything we persist: a chain that fails here is treated as
/// expired by the renewal sweep.
pub fn parse_leaf(
    certificate_pem: &[u8],
    private_key_pem: &[u8],
) -> anyhow::Result<ParsedX509Certificate> {
    let leaf = load_certificates_from_memory(certificate_pem, Some(1))?
        .into_iter()
        .next()
        .ok_or(anyhow!("Certificate chain does not contain any X.509 certificate"))?;
    let private_key_pem =
        std::str::from_utf8(private_key_pem).context("Private key is not valid PEM text")?;
    let key = rcgen::KeyPair::from_pem(private_key_pem).context("Parsing private key failed")?;
    if key.public_key_raw() != leaf.public_key_raw.as_slice() {
        bail!("Private key does not match the certificate's public key");
    }
    Ok(leaf)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedX509Certificate {
    pub serial: BigUint,
    pub subject: String,
    pub issuer: String,
    pub validity: Validity,
    pub subject_alternative_names: Vec<String>,
    pub public_key_raw: Vec<u8>,
}

impl TryFrom<Vec<u8>> for ParsedX509Certificate {
    type Error = Error;

    fn try_from(der_bytes: Vec<u8>) -> anyhow::Result<ParsedX509Certificate> {
        let (_extra_bytes, cert) = x509_parser::certificate::X509Certificate::from_der(&der_bytes)
            .context("Reading X.509 structure: Decoding DER failed")?;
        let serial = cert.serial.clone();
        let subject = cert.subject.to_string();
        let issuer = cert.issuer.to_string();
        let validity = (&cert.validity).into();
        let public_key_raw = cert.public_key().subject_public_key.data.to_vec();
        let mut subject_alternative_names = Vec::new();
        for extension in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension() {
                for general_name in &san.general_names {
                    match general_name {
                        GeneralName::DNSName(dns_name) => {
                            subject_alternative_names.push((*dns_name).to_string());
                        }
                        unsupported => {
                            warn!("Ignoring unsupported general name {unsupported} in certificate");
                        }
                    }
                }
            }
        }
        Ok(Self {
            serial,
            subject,
            issuer,
            validity,
            subject_alternative_names,
            public_key_raw,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Validity {
    pub not_before: time::OffsetDateTime,
    pub not_after: time::OffsetDateTime,
}

impl Validity {
    pub fn not_before_millis(&self) -> i64 {
        datetime_to_millis(self.not_before)
    }

    pub fn not_after_millis(&self) -> i64 {
        datetime_to_millis(self.not_after)
    }
}

impl From<&x509_parser::certificate::Validity> for Validity {
    fn from(value: &x509_parser::certificate::Validity) -> Self {
        Self {
            not_before: value.not_before.to_datetime(),
            not_after: value.not_after.to_datetime(),
        }
    }
}
