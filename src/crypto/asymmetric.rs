use crate::crypto::SignatureError;
use crate::crypto::jws::{Algorithm, JsonWebKeyEcdsa, JsonWebKeyParameters, JsonWebKeyRsa};
use anyhow::{Context, anyhow, bail};
use aws_lc_rs::encoding::AsBigEndian;
use aws_lc_rs::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, ECDSA_P384_SHA384_FIXED_SIGNING};
use aws_lc_rs::{encoding, encoding::AsDer, rand::SystemRandom, rsa, signature};
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use pem::Pem;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::OnceLock;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyType {
    Ecdsa(Curve),
    Rsa(rsa::KeySize),
}

impl Display for KeyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self {
            KeyType::Ecdsa(curve) => write!(f, "ECDSA with {curve}"),
            KeyType::Rsa(size) => write!(f, "RSA-{}", size.len() * 8),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Curve {
    #[serde(rename = "P-256")]
    P256,
    #[serde(rename = "P-384")]
    P384,
}

impl Curve {
    pub fn get_jws_signing_algorithm(&self) -> &'static signature::EcdsaSigningAlgorithm {
        // JOSE wants raw fixed-size r||s signatures, not the ASN.1 DER form
        match self {
            Curve::P256 => &ECDSA_P256_SHA256_FIXED_SIGNING,
            Curve::P384 => &ECDSA_P384_SHA384_FIXED_SIGNING,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Curve::P256 => "P-256",
            Curve::P384 => "P-384",
        }
    }

    fn point_length(self) -> usize {
        match self {
            Curve::P256 => 32,
            Curve::P384 => 48,
        }
    }
}

impl Display for Curve {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let str = self.as_str();
        write!(f, "{str}")
    }
}

/// A private key usable both as an ACME account key and as a certificate key.
#[derive(Debug)]
pub enum KeyPair {
    Ecdsa(EcdsaKeyPair),
    Rsa(RsaKeyPair),
}

impl KeyPair {
    pub fn get_jws_algorithm(&self) -> Algorithm {
        match self {
            KeyPair::Ecdsa(keypair) => match keypair.curve {
                Curve::P256 => Algorithm::EcdsaP256Sha256,
                Curve::P384 => Algorithm::EcdsaP384Sha384,
            },
            KeyPair::Rsa(_) => Algorithm::RsaPkcs1Sha256,
        }
    }

    pub fn from_pem(pem: &str) -> anyhow::Result<Self> {
        // rcgen accepts PKCS#1, PKCS#8 and SEC1 and tells us the algorithm, so let it do the
        // format detection and hand the normalized PKCS#8 to aws-lc-rs.
        let rcgen_keypair =
            rcgen::KeyPair::from_pem(pem).context("reading private key from pem failed")?;
        let pkcs8_der = rcgen_keypair.serialized_der();
        Ok(match rcgen_keypair.algorithm() {
            alg if alg == &rcgen::PKCS_ECDSA_P256_SHA256 => {
                KeyPair::Ecdsa(EcdsaKeyPair::from_pkcs8(Curve::P256, pkcs8_der)?)
            }
            alg if alg == &rcgen::PKCS_ECDSA_P384_SHA384 => {
                KeyPair::Ecdsa(EcdsaKeyPair::from_pkcs8(Curve::P384, pkcs8_der)?)
            }
            alg if alg == &rcgen::PKCS_RSA_SHA256
                || alg == &rcgen::PKCS_RSA_SHA384
                || alg == &rcgen::PKCS_RSA_SHA512 =>
            {
                KeyPair::Rsa(RsaKeyPair::from_pkcs8(pkcs8_der)?)
            }
            _ => bail!("unsupported algorithm in PEM"),
        })
    }

    pub fn from_pem_bytes(pem: &[u8]) -> anyhow::Result<Self> {
        let pem = std::str::from_utf8(pem).context("private key is not valid PEM text")?;
        Self::from_pem(pem)
    }

    pub fn to_pem_string(&self) -> anyhow::Result<String> {
        Ok(self.to_pem()?.to_string())
    }

    pub fn to_rcgen_keypair(&self) -> anyhow::Result<rcgen::KeyPair> {
        let pem = self.to_pem()?;
        Ok(rcgen::KeyPair::from_pem(&pem.to_string())?)
    }
}

#[derive(Debug)]
pub struct EcdsaKeyPair {
    curve: Curve,
    keypair: signature::EcdsaKeyPair,
    parameters: OnceLock<JsonWebKeyParameters>,
}

impl EcdsaKeyPair {
    fn new(curve: Curve, keypair: signature::EcdsaKeyPair) -> Self {
        Self {
            curve,
            keypair,
            parameters: OnceLock::new(),
        }
    }

    fn from_pkcs8(curve: Curve, der: &[u8]) -> anyhow::Result<Self> {
        let algorithm = curve.get_jws_signing_algorithm();
        let keypair = signature::EcdsaKeyPair::from_pkcs8(algorithm, der)
            .map_err(|_| anyhow!("ECDSA private key is corrupted or invalid"))?;
        Ok(Self::new(curve, keypair))
    }
}

#[derive(Debug)]
pub struct RsaKeyPair {
    keypair: signature::RsaKeyPair,
}

impl RsaKeyPair {
    fn new(keypair: signature::RsaKeyPair) -> Self {
        Self { keypair }
    }

    pub fn from_pkcs8(der: &[u8]) -> anyhow::Result<Self> {
        let keypair = signature::RsaKeyPair::from_pkcs8(der)
            .map_err(|_| anyhow!("RSA private key is corrupted or invalid"))?;
        Ok(Self::new(keypair))
    }
}

#[allow(clippy::module_name_repetitions)]
pub trait AsymmetricKeyOperation
where
    Self: Sized,
{
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError>;
    fn to_pem(&self) -> Result<Pem, SignatureError>;
    fn to_jwk_parameters(&self) -> JsonWebKeyParameters;
}

impl AsymmetricKeyOperation for KeyPair {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        match self {
            KeyPair::Ecdsa(keypair) => keypair.sign(message),
            KeyPair::Rsa(keypair) => keypair.sign(message),
        }
    }

    fn to_pem(&self) -> Result<Pem, SignatureError> {
        match self {
            KeyPair::Ecdsa(keypair) => keypair.to_pem(),
            KeyPair::Rsa(keypair) => keypair.to_pem(),
        }
    }

    fn to_jwk_parameters(&self) -> JsonWebKeyParameters {
        match self {
            KeyPair::Ecdsa(keypair) => keypair.to_jwk_parameters(),
            KeyPair::Rsa(keypair) => keypair.to_jwk_parameters(),
        }
    }
}

impl AsymmetricKeyOperation for EcdsaKeyPair {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let random = SystemRandom::new();
        let signature = self
            .keypair
            .sign(&random, message)
            .map_err(|_| SignatureError::SignatureGeneration("ECDSA signing failed"))?;
        Ok(signature.as_ref().to_vec())
    }

    fn to_pem(&self) -> Result<Pem, SignatureError> {
        let data = self
            .keypair
            .to_pkcs8v1()
            .map_err(|_| SignatureError::EncodingFailed("Serializing ECDSA keypair failed"))?;
        Ok(Pem::new("PRIVATE KEY", data.as_ref()))
    }

    fn to_jwk_parameters(&self) -> JsonWebKeyParameters {
        self.parameters
            .get_or_init(|| {
                // X9.62 uncompressed form: 0x04 || x || y
                let pub_key = signature::KeyPair::public_key(&self.keypair);
                let pub_key_uncompressed_binary =
                    AsBigEndian::<encoding::EcPublicKeyUncompressedBin>::as_be_bytes(pub_key)
                        .expect(
                            "BUG: Crypto engine failed to provide public key in uncompressed form",
                        );
                let pub_key_bytes = pub_key_uncompressed_binary.as_ref();
                assert_eq!(pub_key_bytes[0], 0x04);
                let point_len = self.curve.point_length();
                let x = BASE64_URL_SAFE_NO_PAD.encode(&pub_key_bytes[1..=point_len]);
                let y = BASE64_URL_SAFE_NO_PAD.encode(&pub_key_bytes[(1 + point_len)..]);
                JsonWebKeyParameters::Ecdsa(JsonWebKeyEcdsa::new(self.curve, x, y))
            })
            .clone()
    }
}

impl AsymmetricKeyOperation for RsaKeyPair {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let random = SystemRandom::new();
        let mut signature = vec![0; self.keypair.public_modulus_len()];
        self.keypair
            .sign(
                &signature::RSA_PKCS1_SHA256,
                &random,
                message,
                &mut signature,
            )
            .map_err(|_| SignatureError::SignatureGeneration("RSA signing failed"))?;
        Ok(signature)
    }

    fn to_pem(&self) -> Result<Pem, SignatureError> {
        let data = self
            .keypair
            .as_der()
            .map_err(|_| SignatureError::EncodingFailed("Serializing RSA keypair failed"))?;
        Ok(Pem::new("PRIVATE KEY", data.as_ref()))
    }

    fn to_jwk_parameters(&self) -> JsonWebKeyParameters {
        let public_key = signature::KeyPair::public_key(&self.keypair);
        let modulus = BASE64_URL_SAFE_NO_PAD
            .encode(public_key.modulus().big_endian_without_leading_zero());
        let exponent = BASE64_URL_SAFE_NO_PAD
            .encode(public_key.exponent().big_endian_without_leading_zero());
        JsonWebKeyParameters::Rsa(JsonWebKeyRsa::new(modulus, exponent))
    }
}

pub fn new_key(typ: KeyType) -> anyhow::Result<KeyPair> {
    Ok(match typ {
        KeyType::Ecdsa(curve) => {
            let algorithm = curve.get_jws_signing_algorithm();
            let keypair = signature::EcdsaKeyPair::generate(algorithm)
                .map_err(|_| anyhow!("Could not generate {typ} key"))?;
            KeyPair::Ecdsa(EcdsaKeyPair::new(curve, keypair))
        }
        KeyType::Rsa(size) => {
            let keypair = signature::RsaKeyPair::generate(size)
                .map_err(|_| anyhow!("Could not generate {typ} key"))?;
            KeyPair::Rsa(RsaKeyPair::new(keypair))
        }
    })
}
