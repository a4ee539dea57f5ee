// Wallet API wire protocol
// Call/response envelopes, correlation IDs, the closed set of API functions
// and the permission names they require

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Tag carried by every call the injected API posts to the page window.
/// The content script ignores window messages without it.
pub const WALLET_EXT: &str = "arweave-wallet";

/// Prefix of every API call type (`api_sign`, `api_connect`, ...)
pub const CALL_TYPE_PREFIX: &str = "api_";

/// Call type used for page-to-background chunk uploads
pub const CHUNK_CALL_TYPE: &str = "chunk";

/// Window message type used by the content script to forward pushed events
pub const EVENT_MESSAGE_TYPE: &str = "arweave_wallet_event";

/// Logical channel names on the message bus
pub mod channels {
    pub const API_CALL: &str = "api_call";
    pub const CHUNK: &str = "chunk";
    pub const EVENT: &str = "event";
    pub const SWITCH_WALLET_EVENT: &str = "switch_wallet_event";
    pub const COPY_ADDRESS: &str = "copy_address";
    pub const AUTH_PARAMS: &str = "auth_params";
    pub const AUTH_LISTENING: &str = "auth_listening";
    pub const AUTH_CHUNK: &str = "auth_chunk";
    pub const AUTH_RESULT: &str = "auth_result";
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh random identifier (UUID v4)
            pub fn random() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Correlates one outstanding API call with its response
    CallId
);
opaque_id!(
    /// Groups all chunks of one logical payload
    CollectionId
);
opaque_id!(
    /// Correlates one authorization popup session
    AuthId
);

/// Arguments of a call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallData {
    #[serde(default)]
    pub params: Vec<Value>,
}

/// A call posted by the injected API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCall {
    #[serde(rename = "type")]
    pub call_type: String,
    #[serde(rename = "callID")]
    pub call_id: CallId,
    #[serde(default)]
    pub data: CallData,
    pub ext: String,
}

impl ApiCall {
    pub fn new(call_type: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            call_type: call_type.into(),
            call_id: CallId::random(),
            data: CallData { params },
            ext: WALLET_EXT.to_string(),
        }
    }

    /// Type of the response that answers this call
    pub fn result_type(&self) -> String {
        result_type(&self.call_type)
    }

    /// Parse an untrusted value into a call.
    ///
    /// Only `type` and `callID` are mandatory; everything else defaults.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let call_type = object.get("type")?.as_str()?;
        let call_id = object.get("callID")?.as_str()?;
        if call_type.is_empty() || call_id.is_empty() {
            return None;
        }

        let params = match object.get("data").and_then(|d| d.get("params")) {
            Some(Value::Array(params)) => params.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return None,
        };

        Some(Self {
            call_type: call_type.to_string(),
            call_id: CallId::from(call_id),
            data: CallData { params },
            ext: object
                .get("ext")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

pub fn result_type(call_type: &str) -> String {
    format!("{}_result", call_type)
}

/// The answer to an [`ApiCall`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(rename = "type")]
    pub response_type: String,
    #[serde(rename = "callID")]
    pub call_id: CallId,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub data: Value,
}

impl ApiResponse {
    pub fn success(call_type: &str, call_id: CallId, data: Value) -> Self {
        Self {
            response_type: result_type(call_type),
            call_id,
            error: false,
            data,
        }
    }

    pub fn failure(call_type: &str, call_id: CallId, message: impl Into<String>) -> Self {
        Self {
            response_type: result_type(call_type),
            call_id,
            error: true,
            data: Value::String(message.into()),
        }
    }

    /// Error message carried by a failed response
    pub fn error_message(&self) -> String {
        match &self.data {
            Value::String(message) => message.clone(),
            Value::Null => "Unknown error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Positional call arguments with `null` treated as absent
#[derive(Debug, Clone, Default)]
pub struct Params(Vec<Option<Value>>);

impl Params {
    pub fn new(values: Vec<Value>) -> Self {
        Self(
            values
                .into_iter()
                .map(|value| if value.is_null() { None } else { Some(value) })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw value at `index`, `None` when missing or null
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index).and_then(Option::as_ref)
    }

    pub fn optional<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<Option<T>, String> {
        match self.get(index) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| format!("Invalid {} argument: {}", name, e)),
        }
    }

    pub fn required<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, String> {
        self.optional(index, name)?
            .ok_or_else(|| format!("Missing {} argument", name))
    }
}

/// Capability names an application can be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    AccessAddress,
    AccessPublicKey,
    AccessAllAddresses,
    SignTransaction,
    Encrypt,
    Decrypt,
    Signature,
    AccessArweaveConfig,
    Dispatch,
    AccessTokens,
}

impl Permission {
    pub const ALL: [Permission; 10] = [
        Permission::AccessAddress,
        Permission::AccessPublicKey,
        Permission::AccessAllAddresses,
        Permission::SignTransaction,
        Permission::Encrypt,
        Permission::Decrypt,
        Permission::Signature,
        Permission::AccessArweaveConfig,
        Permission::Dispatch,
        Permission::AccessTokens,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::AccessAddress => "ACCESS_ADDRESS",
            Permission::AccessPublicKey => "ACCESS_PUBLIC_KEY",
            Permission::AccessAllAddresses => "ACCESS_ALL_ADDRESSES",
            Permission::SignTransaction => "SIGN_TRANSACTION",
            Permission::Encrypt => "ENCRYPT",
            Permission::Decrypt => "DECRYPT",
            Permission::Signature => "SIGNATURE",
            Permission::AccessArweaveConfig => "ACCESS_ARWEAVE_CONFIG",
            Permission::Dispatch => "DISPATCH",
            Permission::AccessTokens => "ACCESS_TOKENS",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every operation the injected API exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiFunction {
    Connect,
    Disconnect,
    GetActiveAddress,
    GetActivePublicKey,
    GetAllAddresses,
    GetWalletNames,
    GetPermissions,
    GetArweaveConfig,
    Sign,
    SignDataItem,
    BatchSignDataItem,
    Dispatch,
    Signature,
    SignMessage,
    VerifyMessage,
    Encrypt,
    Decrypt,
    AddToken,
    IsTokenAdded,
}

impl ApiFunction {
    pub const ALL: [ApiFunction; 19] = [
        ApiFunction::Connect,
        ApiFunction::Disconnect,
        ApiFunction::GetActiveAddress,
        ApiFunction::GetActivePublicKey,
        ApiFunction::GetAllAddresses,
        ApiFunction::GetWalletNames,
        ApiFunction::GetPermissions,
        ApiFunction::GetArweaveConfig,
        ApiFunction::Sign,
        ApiFunction::SignDataItem,
        ApiFunction::BatchSignDataItem,
        ApiFunction::Dispatch,
        ApiFunction::Signature,
        ApiFunction::SignMessage,
        ApiFunction::VerifyMessage,
        ApiFunction::Encrypt,
        ApiFunction::Decrypt,
        ApiFunction::AddToken,
        ApiFunction::IsTokenAdded,
    ];

    /// Method name on the injected object
    pub fn name(&self) -> &'static str {
        match self {
            ApiFunction::Connect => "connect",
            ApiFunction::Disconnect => "disconnect",
            ApiFunction::GetActiveAddress => "getActiveAddress",
            ApiFunction::GetActivePublicKey => "getActivePublicKey",
            ApiFunction::GetAllAddresses => "getAllAddresses",
            ApiFunction::GetWalletNames => "getWalletNames",
            ApiFunction::GetPermissions => "getPermissions",
            ApiFunction::GetArweaveConfig => "getArweaveConfig",
            ApiFunction::Sign => "sign",
            ApiFunction::SignDataItem => "signDataItem",
            ApiFunction::BatchSignDataItem => "batchSignDataItem",
            ApiFunction::Dispatch => "dispatch",
            ApiFunction::Signature => "signature",
            ApiFunction::SignMessage => "signMessage",
            ApiFunction::VerifyMessage => "verifyMessage",
            ApiFunction::Encrypt => "encrypt",
            ApiFunction::Decrypt => "decrypt",
            ApiFunction::AddToken => "addToken",
            ApiFunction::IsTokenAdded => "isTokenAdded",
        }
    }

    pub fn call_type(&self) -> String {
        format!("{}{}", CALL_TYPE_PREFIX, self.name())
    }

    /// Resolve a call type such as `api_sign`
    pub fn from_call_type(call_type: &str) -> Option<Self> {
        let name = call_type.strip_prefix(CALL_TYPE_PREFIX)?;
        Self::ALL.into_iter().find(|function| function.name() == name)
    }

    pub fn required_permissions(&self) -> &'static [Permission] {
        match self {
            ApiFunction::Connect | ApiFunction::Disconnect | ApiFunction::GetPermissions => &[],
            ApiFunction::GetActiveAddress => &[Permission::AccessAddress],
            ApiFunction::GetActivePublicKey => &[Permission::AccessPublicKey],
            ApiFunction::GetAllAddresses | ApiFunction::GetWalletNames => {
                &[Permission::AccessAllAddresses]
            }
            ApiFunction::GetArweaveConfig => &[Permission::AccessArweaveConfig],
            ApiFunction::Sign | ApiFunction::SignDataItem | ApiFunction::BatchSignDataItem => {
                &[Permission::SignTransaction]
            }
            ApiFunction::Dispatch => &[Permission::Dispatch],
            ApiFunction::Signature | ApiFunction::SignMessage | ApiFunction::VerifyMessage => {
                &[Permission::Signature]
            }
            ApiFunction::Encrypt => &[Permission::Encrypt],
            ApiFunction::Decrypt => &[Permission::Decrypt],
            ApiFunction::AddToken | ApiFunction::IsTokenAdded => &[Permission::AccessTokens],
        }
    }
}

impl fmt::Display for ApiFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Name and logo an application presents when connecting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
}

/// Notification pushed from the background to connected pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletEvent {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

impl WalletEvent {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_types_resolve_to_functions() {
        for function in ApiFunction::ALL {
            assert_eq!(ApiFunction::from_call_type(&function.call_type()), Some(function));
        }
        assert_eq!(ApiFunction::from_call_type("api_stealKeys"), None);
        assert_eq!(ApiFunction::from_call_type("sign"), None);
    }

    #[test]
    fn call_wire_format_uses_original_field_names() {
        let call = ApiCall::new("api_sign", vec![json!(1)]);
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["type"], "api_sign");
        assert_eq!(value["callID"], call.call_id.as_str());
        assert_eq!(value["data"]["params"], json!([1]));
        assert_eq!(value["ext"], WALLET_EXT);
    }

    #[test]
    fn from_value_rejects_malformed_calls() {
        assert!(ApiCall::from_value(&json!({"type": "api_sign"})).is_none());
        assert!(ApiCall::from_value(&json!({"type": 5, "callID": "a"})).is_none());
        assert!(ApiCall::from_value(&json!({"type": "api_sign", "callID": ""})).is_none());
        assert!(ApiCall::from_value(&json!({"type": "api_sign", "callID": "a", "data": {"params": 3}})).is_none());

        let call = ApiCall::from_value(&json!({"type": "api_sign", "callID": "a"})).unwrap();
        assert!(call.data.params.is_empty());
    }

    #[test]
    fn null_params_are_absent() {
        let params = Params::new(vec![json!("x"), Value::Null]);
        assert_eq!(params.len(), 2);
        assert_eq!(params.optional::<String>(1, "options").unwrap(), None);
        assert_eq!(params.required::<String>(0, "data").unwrap(), "x");
        assert_eq!(
            params.required::<String>(1, "options").unwrap_err(),
            "Missing options argument"
        );
    }

    #[test]
    fn permissions_use_screaming_names() {
        for permission in Permission::ALL {
            let value = serde_json::to_value(permission).unwrap();
            assert_eq!(value, json!(permission.as_str()));
        }
    }

    #[test]
    fn random_ids_do_not_collide() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| CallId::random()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
