//! Job envelope: the versioned binary representation of a job.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! version(1) | flags(1)
//! | tenant_len(2) | tenant_id
//! | job_id_len(2) | job_id
//! | header_len(4) | header_cbor
//! | payload_len(4) | payload
//! ```
//!
//! `flags` bit 0 marks an encrypted payload, bit 1 a zstd-compressed one.
//! The header is a CBOR map with keys emitted in sorted order, so equal
//! logical jobs encode to byte-equal envelopes (modulo encryption nonces).
//!
//! Encrypted payload section:
//!
//! ```text
//! wrapped_dek_len(2) | wrapped_dek | nonce(12) | ciphertext
//! ```
//!
//! with AEAD associated data `tenant_id | 0x00 | job_id | 0x00 | version`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, Kms, NONCE_LEN};
use crate::errors::{CoreError, CoreResult};

pub const ENVELOPE_VERSION: u8 = 1;

const FLAG_ENCRYPTED: u8 = 0b0000_0001;
const FLAG_COMPRESSED: u8 = 0b0000_0010;

/// Compressed payloads prepend the raw length so decompression is bounded.
const MAX_DECOMPRESSED: usize = 64 * 1024 * 1024;

/// Retry policy snapshot frozen into the envelope at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySnapshot {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub cap_ms: u64,
    pub multiplier: f64,
    pub jitter_fraction: f64,
}

/// Job metadata carried inside the envelope header.
///
/// Timestamps are epoch milliseconds so the CBOR encoding stays free of
/// string formatting concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub queue: String,
    pub job_type: String,
    pub priority: u8,
    pub enqueued_at_ms: i64,
    pub not_before_ms: Option<i64>,
    pub deadline_ms: Option<i64>,
    pub retry: RetrySnapshot,
    pub idempotency_key: Option<String>,
    pub trace_id: Option<String>,
}

/// A decoded job envelope. `payload` is always plaintext here; sealing
/// and opening happen in [`EnvelopeCodec`].
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub tenant_id: String,
    pub job_id: String,
    pub header: EnvelopeHeader,
    pub payload: Vec<u8>,
}

/// Encodes and decodes envelopes, performing compression and envelope
/// encryption as requested.
#[derive(Clone)]
pub struct EnvelopeCodec {
    kms: Option<Arc<dyn Kms>>,
    compress_min: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            kms: None,
            compress_min: 4096,
        }
    }

    pub fn with_kms(mut self, kms: Arc<dyn Kms>) -> Self {
        self.kms = Some(kms);
        self
    }

    /// Payloads at or above this size are candidates for compression.
    pub fn with_compress_min(mut self, bytes: usize) -> Self {
        self.compress_min = bytes;
        self
    }

    /// Encode an envelope. When `encrypt` is set the tenant's current KEK
    /// is fetched from the KMS and the payload is sealed under a fresh DEK.
    pub async fn encode(&self, env: &Envelope, encrypt: bool) -> CoreResult<Vec<u8>> {
        let mut flags = 0u8;
        let mut body = env.payload.clone();

        if body.len() >= self.compress_min {
            let compressed = zstd::bulk::compress(&body, 3)
                .map_err(|e| CoreError::internal(format!("compress: {e}")).into_anyhow())?;
            if compressed.len() + 4 < body.len() {
                let mut framed = Vec::with_capacity(4 + compressed.len());
                framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
                framed.extend_from_slice(&compressed);
                body = framed;
                flags |= FLAG_COMPRESSED;
            }
        }

        if encrypt {
            let kms = self.kms.as_ref().ok_or_else(|| {
                CoreError::kms_unavailable("no KMS configured for encrypted tenant").into_anyhow()
            })?;
            let kek = kms.get_kek(&env.tenant_id).await?;
            let dek = crypto::random_key();
            let aad = associated_data(&env.tenant_id, &env.job_id);
            let (nonce, ct) = crypto::seal(&dek, &body, &aad)?;
            let wrapped = kms.wrap(&kek, &dek).await?;
            if wrapped.len() > u16::MAX as usize {
                return Err(CoreError::internal("wrapped DEK too long").into_anyhow());
            }

            let mut sealed = Vec::with_capacity(2 + wrapped.len() + NONCE_LEN + ct.len());
            sealed.extend_from_slice(&(wrapped.len() as u16).to_be_bytes());
            sealed.extend_from_slice(&wrapped);
            sealed.extend_from_slice(&nonce);
            sealed.extend_from_slice(&ct);
            body = sealed;
            flags |= FLAG_ENCRYPTED;
        }

        let header = canonical_cbor(&env.header)?;
        let tenant = env.tenant_id.as_bytes();
        let job_id = env.job_id.as_bytes();
        if tenant.len() > u16::MAX as usize || job_id.len() > u16::MAX as usize {
            return Err(CoreError::validation("tenant or job id too long").into_anyhow());
        }

        let mut out =
            Vec::with_capacity(2 + 2 + tenant.len() + 2 + job_id.len() + 4 + header.len() + 4 + body.len());
        out.push(ENVELOPE_VERSION);
        out.push(flags);
        out.extend_from_slice(&(tenant.len() as u16).to_be_bytes());
        out.extend_from_slice(tenant);
        out.extend_from_slice(&(job_id.len() as u16).to_be_bytes());
        out.extend_from_slice(job_id);
        out.extend_from_slice(&(header.len() as u32).to_be_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode an envelope, opening encryption and compression as flagged.
    pub async fn decode(&self, bytes: &[u8]) -> CoreResult<Envelope> {
        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        if version != ENVELOPE_VERSION {
            return Err(
                CoreError::bad_envelope(format!("unknown envelope version {version}")).into_anyhow()
            );
        }
        let flags = r.u8()?;
        let tenant_len = r.u16()? as usize;
        let tenant_id = String::from_utf8(r.take(tenant_len)?.to_vec())
            .map_err(|_| CoreError::bad_envelope("tenant id not utf-8").into_anyhow())?;
        let job_len = r.u16()? as usize;
        let job_id = String::from_utf8(r.take(job_len)?.to_vec())
            .map_err(|_| CoreError::bad_envelope("job id not utf-8").into_anyhow())?;
        let header_len = r.u32()? as usize;
        let header_bytes = r.take(header_len)?;
        let payload_len = r.u32()? as usize;
        let mut body = r.take(payload_len)?.to_vec();
        if !r.is_empty() {
            return Err(CoreError::bad_envelope("trailing bytes after payload").into_anyhow());
        }

        let header: EnvelopeHeader = ciborium::de::from_reader(header_bytes)
            .map_err(|e| CoreError::bad_envelope(format!("header: {e}")).into_anyhow())?;

        if flags & FLAG_ENCRYPTED != 0 {
            let kms = self.kms.as_ref().ok_or_else(|| {
                CoreError::kms_unavailable("no KMS configured to decrypt payload").into_anyhow()
            })?;
            let mut s = Reader::new(&body);
            let wrapped_len = s.u16()? as usize;
            let wrapped = s.take(wrapped_len)?.to_vec();
            let nonce = s.take(NONCE_LEN)?.to_vec();
            let ct = s.rest();

            let kek = kms.get_kek(&tenant_id).await?;
            let dek_bytes = kms.unwrap_key(&kek, &wrapped).await?;
            let dek: [u8; crypto::DEK_LEN] = dek_bytes
                .try_into()
                .map_err(|_| CoreError::bad_envelope("bad DEK length").into_anyhow())?;
            let aad = associated_data(&tenant_id, &job_id);
            body = crypto::open(&dek, &nonce, &ct, &aad)?;
        }

        if flags & FLAG_COMPRESSED != 0 {
            let mut s = Reader::new(&body);
            let raw_len = s.u32()? as usize;
            if raw_len > MAX_DECOMPRESSED {
                return Err(CoreError::bad_envelope("declared payload too large").into_anyhow());
            }
            body = zstd::bulk::decompress(&s.rest(), raw_len)
                .map_err(|_| CoreError::bad_envelope("decompress failed").into_anyhow())?;
        }

        Ok(Envelope {
            tenant_id,
            job_id,
            header,
            payload: body,
        })
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn associated_data(tenant_id: &str, job_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(tenant_id.len() + job_id.len() + 3);
    aad.extend_from_slice(tenant_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(job_id.as_bytes());
    aad.push(0);
    aad.push(ENVELOPE_VERSION);
    aad
}

/// Serialize to CBOR with map keys in sorted order.
///
/// Serde structs emit fields in declaration order; routing through
/// `serde_json::Value` first gives sorted maps (its object type is a
/// BTreeMap), which is what makes the encoding canonical.
fn canonical_cbor<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let json = serde_json::to_value(value)
        .map_err(|e| CoreError::internal(format!("header to json: {e}")).into_anyhow())?;
    let cbor = json_to_cbor(&json)?;
    let mut out = Vec::new();
    ciborium::ser::into_writer(&cbor, &mut out)
        .map_err(|e| CoreError::internal(format!("header to cbor: {e}")).into_anyhow())?;
    Ok(out)
}

fn json_to_cbor(value: &serde_json::Value) -> CoreResult<ciborium::Value> {
    use ciborium::Value as C;
    use serde_json::Value as J;

    Ok(match value {
        J::Null => C::Null,
        J::Bool(b) => C::Bool(*b),
        J::Number(n) => {
            if let Some(i) = n.as_i64() {
                C::Integer(i.into())
            } else if let Some(u) = n.as_u64() {
                C::Integer(u.into())
            } else {
                C::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        J::String(s) => C::Text(s.clone()),
        J::Array(items) => C::Array(items.iter().map(json_to_cbor).collect::<CoreResult<_>>()?),
        J::Object(map) => {
            // serde_json's map iterates keys in sorted order.
            let mut entries = Vec::with_capacity(map.len());
            for (k, v) in map {
                entries.push((C::Text(k.clone()), json_to_cbor(v)?));
            }
            C::Map(entries)
        }
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(CoreError::bad_envelope("truncated envelope").into_anyhow());
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn rest(&mut self) -> Vec<u8> {
        let out = self.bytes[self.pos..].to_vec();
        self.pos = self.bytes.len();
        out
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKms;
    use crate::errors::ErrorKind;

    fn sample_envelope(payload: Vec<u8>) -> Envelope {
        Envelope {
            tenant_id: "t1".to_string(),
            job_id: "job-1".to_string(),
            header: EnvelopeHeader {
                queue: "payments".to_string(),
                job_type: "charge".to_string(),
                priority: 5,
                enqueued_at_ms: 1_700_000_000_000,
                not_before_ms: None,
                deadline_ms: Some(1_700_000_600_000),
                retry: RetrySnapshot {
                    max_attempts: 3,
                    base_ms: 100,
                    cap_ms: 60_000,
                    multiplier: 2.0,
                    jitter_fraction: 0.0,
                },
                idempotency_key: Some("k1".to_string()),
                trace_id: None,
            },
            payload,
        }
    }

    #[tokio::test]
    async fn roundtrip_plain() {
        let codec = EnvelopeCodec::new();
        let env = sample_envelope(b"{\"amount\":42}".to_vec());
        let bytes = codec.encode(&env, false).await.unwrap();
        let back = codec.decode(&bytes).await.unwrap();
        assert_eq!(back, env);
    }

    #[tokio::test]
    async fn equal_jobs_encode_identically() {
        let codec = EnvelopeCodec::new();
        let env = sample_envelope(b"payload".to_vec());
        let a = codec.encode(&env, false).await.unwrap();
        let b = codec.encode(&env, false).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn roundtrip_compressed() {
        let codec = EnvelopeCodec::new().with_compress_min(64);
        let env = sample_envelope(vec![b'x'; 10_000]);
        let bytes = codec.encode(&env, false).await.unwrap();
        assert!(bytes.len() < 10_000);
        assert_eq!(bytes[1] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        let back = codec.decode(&bytes).await.unwrap();
        assert_eq!(back.payload, env.payload);
    }

    #[tokio::test]
    async fn roundtrip_encrypted() {
        let kms = Arc::new(LocalKms::new());
        kms.register("t1");
        let codec = EnvelopeCodec::new().with_kms(kms);

        let env = sample_envelope(b"secret".to_vec());
        let bytes = codec.encode(&env, true).await.unwrap();
        assert_eq!(bytes[1] & FLAG_ENCRYPTED, FLAG_ENCRYPTED);
        // Ciphertext must not contain the plaintext.
        assert!(!bytes.windows(6).any(|w| w == b"secret"));

        let back = codec.decode(&bytes).await.unwrap();
        assert_eq!(back, env);
    }

    #[tokio::test]
    async fn rejects_unknown_version() {
        let codec = EnvelopeCodec::new();
        let env = sample_envelope(b"p".to_vec());
        let mut bytes = codec.encode(&env, false).await.unwrap();
        bytes[0] = 9;
        let err = codec.decode(&bytes).await.unwrap_err();
        assert_eq!(CoreError::from_anyhow(&err).unwrap().kind, ErrorKind::BadEnvelope);
    }

    #[tokio::test]
    async fn rejects_truncation() {
        let codec = EnvelopeCodec::new();
        let env = sample_envelope(b"payload".to_vec());
        let bytes = codec.encode(&env, false).await.unwrap();
        for cut in [1, bytes.len() / 2, bytes.len() - 1] {
            let err = codec.decode(&bytes[..cut]).await.unwrap_err();
            assert_eq!(CoreError::from_anyhow(&err).unwrap().kind, ErrorKind::BadEnvelope);
        }
    }

    #[tokio::test]
    async fn rejects_flipped_ciphertext() {
        let kms = Arc::new(LocalKms::new());
        kms.register("t1");
        let codec = EnvelopeCodec::new().with_kms(kms);
        let env = sample_envelope(b"secret".to_vec());
        let mut bytes = codec.encode(&env, true).await.unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(codec.decode(&bytes).await.is_err());
    }
}
