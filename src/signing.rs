/// HMAC-SHA256 authentication of command envelopes.
///
/// A command is signed once by its issuer over the envelope
/// `{id, project_id, node_id, command, created_at, payload}`. The worker
/// recomputes the MAC from the row's own stored fields, so any change to
/// the row after insertion is detected.
///
/// Several encodings have been used by issuers over time. They are kept
/// as an ordered list of `SignatureScheme` values and tried in priority
/// order; retiring a legacy signer is a matter of removing its entry.
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::canonical::canonicalize_payload;
use crate::model::Envelope;

type HmacSha256 = Hmac<Sha256>;
const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Position of `created_at` relative to the canonical payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOrder {
    CreatedAtThenPayload,
    PayloadThenCreatedAt,
}

/// Text encoding of the 32-byte MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestEncoding {
    Hex,
    Base64,
}

/// One way of turning an envelope into a signature string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureScheme {
    pub name: &'static str,
    pub order: FieldOrder,
    pub separator: &'static str,
    pub encoding: DigestEncoding,
}

/// Current issuer format.
pub const V2: SignatureScheme = SignatureScheme {
    name: "v2",
    order: FieldOrder::CreatedAtThenPayload,
    separator: "\n",
    encoding: DigestEncoding::Hex,
};

/// Same message as `v2`, base64 output.
pub const V2_BASE64: SignatureScheme = SignatureScheme {
    name: "v2-b64",
    order: FieldOrder::CreatedAtThenPayload,
    separator: "\n",
    encoding: DigestEncoding::Base64,
};

/// Legacy pipe-joined format with the payload before the timestamp.
pub const V1: SignatureScheme = SignatureScheme {
    name: "v1",
    order: FieldOrder::PayloadThenCreatedAt,
    separator: "|",
    encoding: DigestEncoding::Hex,
};

/// All known schemes, highest priority first.
pub const DEFAULT_SCHEMES: [SignatureScheme; 3] = [V2, V2_BASE64, V1];

impl SignatureScheme {
    pub fn by_name(name: &str) -> Option<Self> {
        DEFAULT_SCHEMES.iter().copied().find(|s| s.name == name)
    }

    /// Builds the signing input for this scheme.
    pub fn message(&self, envelope: &Envelope<'_>, created_at: &str) -> String {
        let payload = canonicalize_payload(envelope.payload);
        let fields: [&str; 6] = match self.order {
            FieldOrder::CreatedAtThenPayload => [
                envelope.id,
                envelope.project_id,
                envelope.node_id,
                envelope.command,
                created_at,
                &payload,
            ],
            FieldOrder::PayloadThenCreatedAt => [
                envelope.id,
                envelope.project_id,
                envelope.node_id,
                envelope.command,
                &payload,
                created_at,
            ],
        };
        fields.join(self.separator)
    }

    /// Signs the envelope as stored.
    pub fn sign(&self, secret: &[u8], envelope: &Envelope<'_>) -> String {
        let mac = mac_for(secret, &self.message(envelope, envelope.created_at));
        let digest = mac.finalize().into_bytes();
        match self.encoding {
            DigestEncoding::Hex => hex::encode(digest),
            DigestEncoding::Base64 => B64.encode(digest),
        }
    }

    /// Constant-time check of `provided` against this scheme.
    fn matches(&self, secret: &[u8], envelope: &Envelope<'_>, created_at: &str, provided: &str) -> bool {
        let decoded = match self.encoding {
            DigestEncoding::Hex => hex::decode(provided).ok(),
            DigestEncoding::Base64 => B64.decode(provided).ok(),
        };
        let Some(expected) = decoded else {
            return false;
        };
        // verify_slice rejects a length mismatch, then compares in constant time
        mac_for(secret, &self.message(envelope, created_at))
            .verify_slice(&expected)
            .is_ok()
    }
}

fn mac_for(secret: &[u8], message: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    mac
}

/// Equivalent textual renderings of the stored timestamp.
///
/// Table stores often re-render `2024-01-01T00:00:00Z` as
/// `2024-01-01T00:00:00+00:00`. Only renderings of the exact same
/// instant are produced, so a changed timestamp still fails.
fn created_at_variants(raw: &str) -> Vec<String> {
    let mut variants = vec![raw.to_string()];
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        let utc = ts.with_timezone(&Utc);
        let mut forms = vec![utc.to_rfc3339_opts(SecondsFormat::AutoSi, true)];
        if utc.timestamp_subsec_nanos() % 1_000_000 == 0 {
            forms.push(utc.to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        for form in forms {
            if !variants.contains(&form) {
                variants.push(form);
            }
        }
    }
    variants
}

/// Verifies command signatures against an ordered list of schemes.
#[derive(Clone)]
pub struct Verifier {
    secret: Vec<u8>,
    schemes: Vec<SignatureScheme>,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("secret", &"<redacted>")
            .field("schemes", &self.schemes.iter().map(|s| s.name).collect::<Vec<_>>())
            .finish()
    }
}

impl Verifier {
    pub fn new(secret: &str, schemes: Vec<SignatureScheme>) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            schemes,
        }
    }

    pub fn with_default_schemes(secret: &str) -> Self {
        Self::new(secret, DEFAULT_SCHEMES.to_vec())
    }

    /// Name of the first scheme the signature matches, if any.
    pub fn matching_scheme(&self, envelope: &Envelope<'_>, signature: Option<&str>) -> Option<&'static str> {
        let provided = signature.map(str::trim).filter(|s| !s.is_empty())?;
        let timestamps = created_at_variants(envelope.created_at);
        self.schemes
            .iter()
            .find(|scheme| {
                timestamps
                    .iter()
                    .any(|ts| scheme.matches(&self.secret, envelope, ts, provided))
            })
            .map(|scheme| scheme.name)
    }

    /// True when the signature matches any configured scheme.
    /// An absent or empty signature never verifies.
    pub fn verify(&self, envelope: &Envelope<'_>, signature: Option<&str>) -> bool {
        self.matching_scheme(envelope, signature).is_some()
    }
}

/// Signs with the current issuer scheme.
pub fn sign(secret: &str, envelope: &Envelope<'_>) -> String {
    V2.sign(secret.as_bytes(), envelope)
}

/// Verifies with every known scheme.
pub fn verify(secret: &str, envelope: &Envelope<'_>, signature: Option<&str>) -> bool {
    Verifier::with_default_schemes(secret).verify(envelope, signature)
}
