//! HTTP Signatures (draft-cavage) for federation
//!
//! Outbound requests are signed over (request-target), host, date and,
//! when a body is present, digest. Inbound verification reconstructs the
//! signing string from the same headers and checks it against the
//! sender's cached or freshly fetched public key. Verification happens
//! before any state is mutated.

use std::net::IpAddr;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};

/// Maximum allowed skew between the Date header and local time
const DATE_SKEW_SECONDS: i64 = 300;

/// Headers produced for a signed outbound request
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub signature: String,
    pub date: String,
    pub digest: Option<String>,
}

/// Sign an outbound request with the local actor's RSA key
///
/// `key_id` is the fragment URI remote servers resolve to find the
/// matching public key (actor URI plus `#main-key`).
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key: &RsaPrivateKey,
    key_id: &str,
) -> Result<SignedHeaders> {
    let parsed =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("invalid URL: {}", e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("URL has no host".to_string()))?;

    let path_and_query = match parsed.query() {
        Some(query) => format!("{}?{}", parsed.path(), query),
        None => parsed.path().to_string(),
    };

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(body_digest);

    let request_target = format!("{} {}", method.to_lowercase(), path_and_query);
    let mut signing_parts = vec![
        format!("(request-target): {}", request_target),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    let mut signed_header_names = vec!["(request-target)", "host", "date"];
    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        signed_header_names.push("digest");
    }
    let signing_string = signing_parts.join("\n");

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key.clone());
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        signed_header_names.join(" "),
        BASE64.encode(signature.to_bytes())
    );

    Ok(SignedHeaders {
        signature: signature_header,
        date,
        digest,
    })
}

/// Verify the signature on an inbound request
///
/// The signing string is rebuilt from the headers the sender declared,
/// the Date header is checked against the skew window, and the Digest
/// header is recomputed from the body. Any mismatch fails closed.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<()> {
    let parsed = parse_signature_header(required_header(headers, "signature")?)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::Validation(format!(
            "unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::Validation(format!(
                "signed headers must include {}",
                required
            )));
        }
    }
    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::Validation(
            "signed headers must include digest".to_string(),
        ));
    }

    let date = DateTime::parse_from_rfc2822(required_header(headers, "date")?)
        .map_err(|_| AppError::Validation("malformed Date header".to_string()))?;
    if (Utc::now().timestamp() - date.timestamp()).abs() > DATE_SKEW_SECONDS {
        return Err(AppError::InvalidSignature);
    }

    if let Some(body_bytes) = body {
        let presented = required_header(headers, "digest")?;
        if presented != body_digest(body_bytes) {
            return Err(AppError::InvalidSignature);
        }
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for name in &parsed.headers {
        let value = match name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            "host" | "date" | "digest" => required_header(headers, name)?.to_string(),
            other => {
                return Err(AppError::Validation(format!(
                    "unsupported signed header: {}",
                    other
                )));
            }
        };
        signing_parts.push(format!("{}: {}", name, value));
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::Validation("signature is not valid base64".to_string()))?;
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::Validation(format!("invalid public key: {}", e)))?;
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| AppError::InvalidSignature)?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature)
}

fn required_header<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Validation(format!("missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::Validation(format!("invalid {} header", name)))
}

/// Parsed Signature header fields
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub key_id: String,
    pub algorithm: String,
    pub headers: Vec<String>,
    pub signature: String,
}

/// Parse a `keyId="...",algorithm="...",headers="...",signature="..."` value
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Validation("missing keyId".to_string()))?,
        algorithm: algorithm
            .ok_or_else(|| AppError::Validation("missing algorithm".to_string()))?,
        headers: headers.ok_or_else(|| AppError::Validation("missing headers".to_string()))?,
        signature: signature
            .ok_or_else(|| AppError::Validation("missing signature".to_string()))?,
    })
}

/// Extract the keyId from a request's Signature header
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String> {
    Ok(parse_signature_header(required_header(headers, "signature")?)?.key_id)
}

/// Whether a keyId belongs to the given actor URI
///
/// Both sides are compared with their fragment stripped.
pub fn key_id_matches_actor(key_id: &str, actor_uri: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_uri.split('#').next().unwrap_or(actor_uri);
    key_actor == actor
}

/// SHA-256 body digest in `SHA-256=base64(hash)` form
pub fn body_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("SHA-256={}", BASE64.encode(hasher.finalize()))
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }
    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Extract and validate the remote domain from an actor or keyId URL
///
/// Rejects non-HTTP(S) schemes and obvious local or private hosts, so
/// keyIds cannot be used to steer fetches at internal services.
pub fn extract_actor_domain(actor_or_key_id: &str) -> Result<String> {
    let actor_url = actor_or_key_id.split('#').next().unwrap_or(actor_or_key_id);
    let parsed = url::Url::parse(actor_url)
        .map_err(|e| AppError::Validation(format!("invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("actor URL has no host".to_string()))?
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }

    Ok(host)
}
