// Transaction and data item models
// Only what the signing modules need: the signable fields, the signature
// message and the id derivation. Field names follow the gateway JSON format.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::chunks::{Payload, Tag};
use crate::services::keystore::verify_signature;
use crate::services::storage::Winston;

pub const TRANSACTION_FORMAT: u8 = 2;

/// Signature type of ed25519 data items
pub const ED25519_SIGNATURE_TYPE: u16 = 2;
const ED25519_SIGNATURE_LEN: usize = 64;
const ED25519_OWNER_LEN: usize = 32;

pub fn b64(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64_decode(text: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(text.trim_end_matches('='))
        .with_context(|| format!("Invalid base64url value {:?}", text))
}

mod base64url {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&b64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        b64_decode(&text).map_err(serde::de::Error::custom)
    }
}

/// Raw bytes given either as a byte array or as a UTF-8 string
pub fn bytes_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Bytes(Vec<u8>),
        Text(String),
    }
    Ok(match Repr::deserialize(deserializer)? {
        Repr::Bytes(bytes) => bytes,
        Repr::Text(text) => text.into_bytes(),
    })
}

fn push_field(message: &mut Vec<u8>, field: &[u8]) {
    message.extend_from_slice(&(field.len() as u64).to_le_bytes());
    message.extend_from_slice(field);
}

fn push_tags(message: &mut Vec<u8>, tags: &[Tag]) {
    message.extend_from_slice(&(tags.len() as u64).to_le_bytes());
    for tag in tags {
        push_field(message, tag.name.as_bytes());
        push_field(message, tag.value.as_bytes());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default = "default_format")]
    pub format: u8,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub last_tx: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub quantity: Winston,
    #[serde(default)]
    pub reward: Winston,
    #[serde(default, with = "base64url")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub data_size: String,
    #[serde(default)]
    pub data_root: String,
    #[serde(default)]
    pub signature: String,
}

fn default_format() -> u8 {
    TRANSACTION_FORMAT
}

impl Transaction {
    /// Split off data and tags so they can travel as chunks
    pub fn strip(&self) -> (Transaction, Payload) {
        let mut stripped = self.clone();
        let payload = Payload::new(
            std::mem::take(&mut stripped.tags),
            std::mem::take(&mut stripped.data),
        );
        (stripped, payload)
    }

    /// Put chunked data and tags back into a stripped transaction
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.tags = payload.tags;
        self.data = payload.data;
        self
    }

    /// Sum of transferred quantity and fee
    pub fn cost(&self) -> Option<Winston> {
        self.quantity.checked_add(self.reward)
    }

    /// Fill in the owner and the data commitments
    pub fn prepare_for_signing(&mut self, owner: &str) {
        self.owner = owner.to_string();
        self.data_size = self.data.len().to_string();
        self.data_root = if self.data.is_empty() {
            String::new()
        } else {
            b64(&Sha256::digest(&self.data))
        };
    }

    /// Digest covered by the signature
    pub fn signature_data(&self) -> Result<Vec<u8>> {
        let mut message = Vec::new();
        push_field(&mut message, self.format.to_string().as_bytes());
        push_field(&mut message, &b64_decode(&self.owner).context("Invalid owner")?);
        push_field(&mut message, &b64_decode(&self.target).context("Invalid target")?);
        push_field(&mut message, self.quantity.to_string().as_bytes());
        push_field(&mut message, self.reward.to_string().as_bytes());
        push_field(&mut message, &b64_decode(&self.last_tx).context("Invalid last_tx")?);
        push_tags(&mut message, &self.tags);
        push_field(&mut message, self.data_size.as_bytes());
        push_field(&mut message, &b64_decode(&self.data_root).context("Invalid data_root")?);
        Ok(Sha256::digest(&message).to_vec())
    }

    /// Attach a signature; the id is derived from it
    pub fn set_signature(&mut self, signature: &[u8]) {
        self.signature = b64(signature);
        self.id = b64(&Sha256::digest(signature));
    }

    pub fn verify(&self) -> Result<bool> {
        let signature = b64_decode(&self.signature)?;
        if self.id != b64(&Sha256::digest(&signature)) {
            return Ok(false);
        }
        verify_signature(&self.owner, &self.signature_data()?, &signature)
    }
}

/// Fields a page supplies for a data item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItemParams {
    #[serde(default, deserialize_with = "bytes_or_string")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
}

impl DataItemParams {
    pub fn strip(&self) -> (DataItemParams, Payload) {
        let mut stripped = self.clone();
        let payload = Payload::new(
            std::mem::take(&mut stripped.tags),
            std::mem::take(&mut stripped.data),
        );
        (stripped, payload)
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.tags = payload.tags;
        self.data = payload.data;
        self
    }
}

/// A binary-encoded, ed25519-signed data item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    pub signature: Vec<u8>,
    pub owner: Vec<u8>,
    pub target: Option<[u8; 32]>,
    pub anchor: Option<[u8; 32]>,
    pub tags: Vec<Tag>,
    pub data: Vec<u8>,
}

fn fixed_32(text: &str, name: &str) -> Result<[u8; 32]> {
    b64_decode(text)?
        .as_slice()
        .try_into()
        .with_context(|| format!("Data item {} must be 32 bytes", name))
}

impl DataItem {
    /// Unsigned item for `owner` (raw public key bytes)
    pub fn new(params: DataItemParams, owner: Vec<u8>) -> Result<Self> {
        if owner.len() != ED25519_OWNER_LEN {
            bail!("Data item owner must be {} bytes", ED25519_OWNER_LEN);
        }
        Ok(Self {
            signature: Vec::new(),
            owner,
            target: params.target.as_deref().map(|t| fixed_32(t, "target")).transpose()?,
            anchor: params.anchor.as_deref().map(|a| fixed_32(a, "anchor")).transpose()?,
            tags: params.tags,
            data: params.data,
        })
    }

    pub fn signing_message(&self) -> Vec<u8> {
        let mut message = Vec::new();
        push_field(&mut message, b"dataitem");
        push_field(&mut message, b"1");
        push_field(&mut message, ED25519_SIGNATURE_TYPE.to_string().as_bytes());
        push_field(&mut message, &self.owner);
        push_field(&mut message, self.target.as_ref().map(|t| t.as_slice()).unwrap_or_default());
        push_field(&mut message, self.anchor.as_ref().map(|a| a.as_slice()).unwrap_or_default());
        push_tags(&mut message, &self.tags);
        push_field(&mut message, &self.data);
        Sha256::digest(&message).to_vec()
    }

    pub fn set_signature(&mut self, signature: Vec<u8>) -> Result<()> {
        if signature.len() != ED25519_SIGNATURE_LEN {
            bail!("Signature must be {} bytes", ED25519_SIGNATURE_LEN);
        }
        self.signature = signature;
        Ok(())
    }

    pub fn id(&self) -> String {
        b64(&Sha256::digest(&self.signature))
    }

    pub fn verify(&self) -> Result<bool> {
        verify_signature(&b64(&self.owner), &self.signing_message(), &self.signature)
    }

    /// Binary layout: signature type, signature, owner, optional target and
    /// anchor (presence byte + 32 bytes), tag count, tag bytes length, tag
    /// bytes, data.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.signature.len() != ED25519_SIGNATURE_LEN {
            bail!("Data item is not signed");
        }
        let mut tag_bytes = Vec::new();
        for tag in &self.tags {
            push_field(&mut tag_bytes, tag.name.as_bytes());
            push_field(&mut tag_bytes, tag.value.as_bytes());
        }

        let mut out = Vec::with_capacity(2 + 64 + 32 + 66 + 16 + tag_bytes.len() + self.data.len());
        out.extend_from_slice(&ED25519_SIGNATURE_TYPE.to_le_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.owner);
        for optional in [&self.target, &self.anchor] {
            match optional {
                Some(bytes) => {
                    out.push(1);
                    out.extend_from_slice(bytes);
                }
                None => out.push(0),
            }
        }
        out.extend_from_slice(&(self.tags.len() as u64).to_le_bytes());
        out.extend_from_slice(&(tag_bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&tag_bytes);
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { bytes, offset: 0 };

        let signature_type = u16::from_le_bytes(reader.array()?);
        if signature_type != ED25519_SIGNATURE_TYPE {
            bail!("Unsupported signature type {}", signature_type);
        }
        let signature = reader.take(ED25519_SIGNATURE_LEN)?.to_vec();
        let owner = reader.take(ED25519_OWNER_LEN)?.to_vec();
        let target = reader.optional_32()?;
        let anchor = reader.optional_32()?;
        let tag_count = u64::from_le_bytes(reader.array()?);
        let tag_len = u64::from_le_bytes(reader.array()?) as usize;

        let mut tag_reader = Reader {
            bytes: reader.take(tag_len)?,
            offset: 0,
        };
        let mut tags = Vec::new();
        for _ in 0..tag_count {
            let name = tag_reader.string()?;
            let value = tag_reader.string()?;
            tags.push(Tag { name, value });
        }

        Ok(Self {
            signature,
            owner,
            target,
            anchor,
            tags,
            data: reader.rest().to_vec(),
        })
    }
}

#[cfg(test)]
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

#[cfg(test)]
impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .context("Data item is truncated")?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        slice.try_into().context("Data item is truncated")
    }

    fn optional_32(&mut self) -> Result<Option<[u8; 32]>> {
        match self.take(1)?[0] {
            0 => Ok(None),
            1 => Ok(Some(self.array()?)),
            other => bail!("Invalid presence byte {}", other),
        }
    }

    fn string(&mut self) -> Result<String> {
        let len = u64::from_le_bytes(self.array()?) as usize;
        String::from_utf8(self.take(len)?.to_vec()).context("Tag is not UTF-8")
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.offset..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn strip_and_merge_restore_transaction() {
        let transaction = Transaction {
            tags: vec![Tag::new("Content-Type", "text/plain")],
            data: b"hello".to_vec(),
            quantity: Winston(10),
            ..Default::default()
        };
        let (stripped, payload) = transaction.strip();
        assert!(stripped.data.is_empty());
        assert!(stripped.tags.is_empty());
        assert_eq!(stripped.with_payload(payload), transaction);
    }

    #[test]
    fn signed_transaction_verifies() {
        let key = key();
        let mut transaction = Transaction {
            data: b"payload".to_vec(),
            reward: Winston(5),
            ..Default::default()
        };
        transaction.prepare_for_signing(&b64(key.verifying_key().as_bytes()));
        assert_eq!(transaction.data_size, "7");

        let signature = key.sign(&transaction.signature_data().unwrap());
        transaction.set_signature(&signature.to_bytes());
        assert!(transaction.verify().unwrap());

        transaction.reward = Winston(6);
        assert!(!transaction.verify().unwrap());
    }

    #[test]
    fn cost_adds_quantity_and_reward() {
        let transaction = Transaction {
            quantity: Winston(7),
            reward: Winston(3),
            ..Default::default()
        };
        assert_eq!(transaction.cost(), Some(Winston(10)));
    }

    #[test]
    fn data_item_binary_layout_decodes() {
        let key = key();
        let params = DataItemParams {
            data: b"item".to_vec(),
            tags: vec![Tag::new("App-Name", "test")],
            target: Some(b64(&[1u8; 32])),
            anchor: None,
        };
        let mut item = DataItem::new(params, key.verifying_key().to_bytes().to_vec()).unwrap();
        let signature = key.sign(&item.signing_message());
        item.set_signature(signature.to_bytes().to_vec()).unwrap();

        let decoded = DataItem::from_bytes(&item.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, item);
        assert!(decoded.verify().unwrap());
        assert_eq!(decoded.target, Some([1u8; 32]));
        assert_eq!(decoded.anchor, None);
    }

    #[test]
    fn data_item_rejects_bad_input() {
        let owner = key().verifying_key().to_bytes().to_vec();
        let params = DataItemParams {
            target: Some(b64(&[1u8; 5])),
            ..Default::default()
        };
        assert!(DataItem::new(params, owner.clone()).is_err());

        let unsigned = DataItem::new(DataItemParams::default(), owner).unwrap();
        assert!(unsigned.to_bytes().is_err());
        assert!(DataItem::from_bytes(&[2, 0, 1]).is_err());
    }

    #[test]
    fn data_item_params_accept_string_data() {
        let params: DataItemParams = serde_json::from_str(r#"{"data": "abc"}"#).unwrap();
        assert_eq!(params.data, b"abc");
        let params: DataItemParams = serde_json::from_str(r#"{"data": [1, 2]}"#).unwrap();
        assert_eq!(params.data, vec![1, 2]);
    }
}
