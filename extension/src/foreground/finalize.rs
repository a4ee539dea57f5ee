// Per-method foreground work
// Before a call: move large binary arguments out of the call into a chunk
// upload. After it: turn the background's answer into what the page expects.

use serde_json::{json, Value};

use crate::chunks::Payload;
use crate::protocol::{ApiFunction, CollectionId};
use crate::transaction::{DataItemParams, Transaction};

/// Call arguments after foreground processing
pub struct Prepared {
    pub params: Vec<Value>,
    /// Stripped payload that has to be uploaded first
    pub upload: Option<Payload>,
}

fn param(params: &[Value], index: usize) -> Value {
    params.get(index).cloned().unwrap_or(Value::Null)
}

fn required<T: serde::de::DeserializeOwned>(params: &[Value], index: usize, name: &str) -> Result<T, String> {
    match params.get(index) {
        None | Some(Value::Null) => Err(format!("Missing {} argument", name)),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| format!("Invalid {} argument: {}", name, e)),
    }
}

/// Split off the chunked part of the arguments. The collection ID slot is
/// filled in by [`with_collection`] once the upload is done.
pub fn prepare(function: ApiFunction, params: &[Value]) -> Result<Prepared, String> {
    match function {
        ApiFunction::Sign | ApiFunction::Dispatch => {
            let transaction: Transaction = required(params, 0, "transaction")?;
            let (stripped, payload) = transaction.strip();
            Ok(Prepared {
                params: vec![json!(stripped), param(params, 1)],
                upload: Some(payload),
            })
        }
        ApiFunction::SignDataItem => {
            let item: DataItemParams = required(params, 0, "dataItem")?;
            let (stripped, payload) = item.strip();
            Ok(Prepared {
                params: vec![json!(stripped)],
                upload: Some(payload),
            })
        }
        ApiFunction::Signature => {
            let data = normalize_bytes(params.first().unwrap_or(&Value::Null))
                .map_err(|e| format!("Invalid data argument: {}", e))?;
            Ok(Prepared {
                params: vec![Value::Null, param(params, 1)],
                upload: Some(Payload::new(Vec::new(), data)),
            })
        }
        _ => Ok(Prepared {
            params: params.to_vec(),
            upload: None,
        }),
    }
}

/// Append the uploaded collection's ID as the last argument
pub fn with_collection(mut params: Vec<Value>, collection: &CollectionId) -> Vec<Value> {
    params.push(json!(collection));
    params
}

/// Turn the background's answer into the method's result.
///
/// `None` keeps the answer as it is.
pub fn finalize(function: ApiFunction, data: &Value, upload: Option<&Payload>) -> Result<Option<Value>, String> {
    match function {
        ApiFunction::Sign => {
            let signed: Transaction = serde_json::from_value(data.clone())
                .map_err(|e| format!("Invalid signed transaction: {}", e))?;
            let merged = match upload {
                Some(payload) => signed.with_payload(payload.clone()),
                None => signed,
            };
            Ok(Some(json!(merged)))
        }
        ApiFunction::Signature
        | ApiFunction::SignMessage
        | ApiFunction::Encrypt
        | ApiFunction::Decrypt
        | ApiFunction::SignDataItem => Ok(Some(json!(normalize_bytes(data)?))),
        ApiFunction::BatchSignDataItem => {
            let items = data
                .as_array()
                .ok_or_else(|| "Expected a list of data items".to_string())?;
            let normalized = items
                .iter()
                .map(normalize_bytes)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(json!(normalized)))
        }
        _ => Ok(None),
    }
}

/// Byte arrays survive structured cloning either as number arrays or as
/// index-keyed objects (`{"0": 1, "1": 2}`)
pub fn normalize_bytes(value: &Value) -> Result<Vec<u8>, String> {
    let byte = |value: &Value| {
        value
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| format!("{} is not a byte", value))
    };

    match value {
        Value::Array(items) => items.iter().map(byte).collect(),
        Value::Object(entries) => {
            let mut indexed = entries
                .iter()
                .map(|(key, value)| {
                    let index: usize = key.parse().map_err(|_| format!("Unexpected key {:?} in binary data", key))?;
                    Ok((index, byte(value)?))
                })
                .collect::<Result<Vec<_>, String>>()?;
            indexed.sort_unstable_by_key(|(index, _)| *index);
            if indexed.iter().enumerate().any(|(position, (index, _))| position != *index) {
                return Err("Binary data has gaps".to_string());
            }
            Ok(indexed.into_iter().map(|(_, byte)| byte).collect())
        }
        other => Err(format!("Expected binary data, got {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::Tag;

    #[test]
    fn normalizes_both_binary_shapes() {
        assert_eq!(normalize_bytes(&json!([1, 2, 255])).unwrap(), vec![1, 2, 255]);
        assert_eq!(normalize_bytes(&json!({"1": 20, "0": 10})).unwrap(), vec![10, 20]);
        assert!(normalize_bytes(&json!([256])).is_err());
        assert!(normalize_bytes(&json!({"0": 1, "2": 3})).is_err());
        assert!(normalize_bytes(&json!("abc")).is_err());
    }

    #[test]
    fn sign_moves_data_and_tags_into_upload() {
        let transaction = Transaction {
            data: vec![1, 2, 3],
            tags: vec![Tag::new("A", "b")],
            ..Default::default()
        };
        let prepared = prepare(ApiFunction::Sign, &[json!(transaction)]).unwrap();

        let upload = prepared.upload.unwrap();
        assert_eq!(upload.data, vec![1, 2, 3]);
        assert_eq!(upload.tags, vec![Tag::new("A", "b")]);
        assert_eq!(prepared.params.len(), 2);
        assert_eq!(prepared.params[0]["data"], "");
        assert_eq!(prepared.params[0]["tags"], json!([]));
    }

    #[test]
    fn sign_finalizer_merges_upload_back() {
        let upload = Payload::new(vec![Tag::new("A", "b")], vec![9, 9]);
        let signed = Transaction {
            id: "id".into(),
            signature: "sig".into(),
            ..Default::default()
        };

        let result = finalize(ApiFunction::Sign, &json!(signed), Some(&upload)).unwrap().unwrap();
        let merged: Transaction = serde_json::from_value(result).unwrap();
        assert_eq!(merged.data, vec![9, 9]);
        assert_eq!(merged.tags, vec![Tag::new("A", "b")]);
        assert_eq!(merged.id, "id");
    }

    #[test]
    fn plain_functions_pass_through() {
        let prepared = prepare(ApiFunction::GetPermissions, &[json!(1)]).unwrap();
        assert!(prepared.upload.is_none());
        assert_eq!(prepared.params, vec![json!(1)]);
        assert_eq!(finalize(ApiFunction::GetActiveAddress, &json!("addr"), None).unwrap(), None);
    }

    #[test]
    fn missing_transaction_is_rejected_before_posting() {
        let err = prepare(ApiFunction::Sign, &[]).err().unwrap();
        assert_eq!(err, "Missing transaction argument");
    }
}
