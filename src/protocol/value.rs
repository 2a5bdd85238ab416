//! Values and their wire encoding.
//!
//! A [`Value`] is either plain JSON data or an object reference, possibly
//! nested inside lists and maps. The wire form is plain JSON where every
//! object reference is replaced by a tagged proxy value:
//!
//! ```json
//! { "wise_typecode": "Proxy", "repr": "<identity> -w <ws> -h <host> -p <port>" }
//! ```
//!
//! # Encoding Contract
//!
//! | Kind | Encode | Decode |
//! |------|--------|--------|
//! | [`Value::Data`] | JSON unchanged | any JSON tree without a proxy tag |
//! | [`Value::Proxy`] | tagged proxy value | tagged proxy value, resolved into a live proxy |
//! | [`Value::List`] | JSON array | array with a proxy tag somewhere inside |
//! | [`Value::Map`] | JSON object | object (not itself a tag) with a proxy tag inside |
//!
//! Decoding is asynchronous because resolving a reference connects to its
//! endpoint and asks the remote object for its methods.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};

use crate::error::{Error, Result};
use crate::proxy::ObjectPrx;

// ============================================================================
// Constants
// ============================================================================

/// Key holding the value kind of a tagged value.
pub const TYPECODE_KEY: &str = "wise_typecode";

/// Typecode of an object reference.
pub const PROXY_TYPECODE: &str = "Proxy";

/// Key holding the stringified reference.
pub const REPR_KEY: &str = "repr";

// ============================================================================
// ProxyResolver
// ============================================================================

/// Turns a stringified reference into a live proxy.
///
/// Implemented by the communicator; transceivers use it to unmarshal
/// references found in inbound params and results.
#[async_trait]
pub trait ProxyResolver: Send + Sync {
    /// Resolves `"<identity> <endpoint>"` into a proxy.
    async fn resolve_proxy(&self, repr: &str) -> Result<ObjectPrx>;
}

// ============================================================================
// Value
// ============================================================================

/// A parameter or result value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Plain JSON data containing no object references.
    Data(JsonValue),
    /// A reference to a remote object.
    Proxy(ObjectPrx),
    /// A list containing at least one object reference.
    List(Vec<Value>),
    /// A map containing at least one object reference.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the JSON `null` value.
    #[inline]
    #[must_use]
    pub const fn null() -> Self {
        Self::Data(JsonValue::Null)
    }

    /// Returns `true` for JSON `null`.
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Data(JsonValue::Null))
    }

    /// Returns the proxy if this value is an object reference.
    #[inline]
    #[must_use]
    pub fn as_proxy(&self) -> Option<&ObjectPrx> {
        match self {
            Self::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// Returns the JSON data if this value holds no references.
    #[inline]
    #[must_use]
    pub fn as_data(&self) -> Option<&JsonValue> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the wire encoding of this value.
    #[inline]
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        marshal(self)
    }

    /// Deserializes the wire encoding into `T`.
    ///
    /// Object references deserialize as their tagged proxy form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the value does not match `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.to_json())
            .map_err(|e| Error::invalid_argument(format!("unexpected value {self:?}: {e}")))
    }

    /// Returns `true` if an object reference occurs anywhere in this value.
    #[must_use]
    pub fn contains_proxy(&self) -> bool {
        match self {
            Self::Data(_) => false,
            Self::Proxy(_) => true,
            Self::List(items) => items.iter().any(Self::contains_proxy),
            Self::Map(entries) => entries.values().any(Self::contains_proxy),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::null()
    }
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        Self::Data(value)
    }
}

impl From<ObjectPrx> for Value {
    fn from(proxy: ObjectPrx) -> Self {
        Self::Proxy(proxy)
    }
}

impl From<&ObjectPrx> for Value {
    fn from(proxy: &ObjectPrx) -> Self {
        Self::Proxy(proxy.clone())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        if items.iter().any(Self::contains_proxy) {
            Self::List(items)
        } else {
            Self::Data(JsonValue::Array(items.iter().map(marshal).collect()))
        }
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Self::null()
    }
}

macro_rules! impl_from_data {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::Data(JsonValue::from(value))
                }
            }
        )*
    };
}

impl_from_data!(bool, i32, i64, u32, u64, f64, String, &str);

// ============================================================================
// Args
// ============================================================================

/// Positional arguments of an invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    /// Creates an argument list.
    #[inline]
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Returns the number of arguments.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no arguments.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the argument at `index`, if present.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Returns the argument at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if there are fewer arguments.
    pub fn value(&self, index: usize) -> Result<&Value> {
        self.0.get(index).ok_or_else(|| {
            Error::invalid_argument(format!(
                "missing argument {index} (got {})",
                self.0.len()
            ))
        })
    }

    /// Deserializes the argument at `index` into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the argument is missing or has
    /// the wrong type.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        self.value(index)?.deserialize()
    }

    /// Returns the object reference passed at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the argument is missing or not
    /// a proxy.
    pub fn proxy(&self, index: usize) -> Result<ObjectPrx> {
        self.value(index)?
            .as_proxy()
            .cloned()
            .ok_or_else(|| Error::invalid_argument(format!("argument {index} is not a proxy")))
    }

    /// Returns an iterator over the arguments.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    /// Consumes the list, returning the values.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl FromIterator<Value> for Args {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ============================================================================
// Marshalling
// ============================================================================

/// Encodes a value into its wire form.
#[must_use]
pub fn marshal(value: &Value) -> JsonValue {
    match value {
        Value::Data(data) => data.clone(),
        Value::Proxy(proxy) => json!({
            TYPECODE_KEY: PROXY_TYPECODE,
            REPR_KEY: proxy.to_string(),
        }),
        Value::List(items) => JsonValue::Array(items.iter().map(marshal).collect()),
        Value::Map(entries) => JsonValue::Object(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), marshal(value)))
                .collect(),
        ),
    }
}

/// Encodes positional params into their wire form.
#[must_use]
pub fn marshal_all(values: &[Value]) -> Vec<JsonValue> {
    values.iter().map(marshal).collect()
}

/// Returns the reference string if `json` is a tagged proxy value.
#[must_use]
pub fn proxy_repr(json: &JsonValue) -> Option<&str> {
    let fields = json.as_object()?;
    if fields.get(TYPECODE_KEY)?.as_str()? != PROXY_TYPECODE {
        return None;
    }
    fields.get(REPR_KEY)?.as_str()
}

/// Returns `true` if a tagged proxy value occurs anywhere in `json`.
#[must_use]
pub fn contains_reference(json: &JsonValue) -> bool {
    if proxy_repr(json).is_some() {
        return true;
    }
    match json {
        JsonValue::Array(items) => items.iter().any(contains_reference),
        JsonValue::Object(fields) => fields.values().any(contains_reference),
        _ => false,
    }
}

/// Decodes a wire value, resolving every object reference it contains.
///
/// # Errors
///
/// Propagates the resolver's error for the first reference that fails.
pub fn unmarshal(json: JsonValue, resolver: &dyn ProxyResolver) -> BoxFuture<'_, Result<Value>> {
    Box::pin(async move {
        if let Some(repr) = proxy_repr(&json) {
            return resolver.resolve_proxy(repr).await.map(Value::Proxy);
        }

        if !contains_reference(&json) {
            return Ok(Value::Data(json));
        }

        match json {
            JsonValue::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(unmarshal(item, resolver).await?);
                }
                Ok(Value::List(values))
            }
            JsonValue::Object(fields) => {
                let mut entries = BTreeMap::new();
                for (key, item) in fields {
                    entries.insert(key, unmarshal(item, resolver).await?);
                }
                Ok(Value::Map(entries))
            }
            other => Ok(Value::Data(other)),
        }
    })
}

/// Decodes positional params.
///
/// # Errors
///
/// Propagates the first resolution failure.
pub async fn unmarshal_all(params: Vec<JsonValue>, resolver: &dyn ProxyResolver) -> Result<Args> {
    let mut values = Vec::with_capacity(params.len());
    for param in params {
        values.push(unmarshal(param, resolver).await?);
    }
    Ok(Args::new(values))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::endpoint::EndpointInfo;
    use crate::transport::Transceiver;

    /// Resolver that builds detached proxies without any network traffic.
    struct OfflineResolver;

    #[async_trait]
    impl ProxyResolver for OfflineResolver {
        async fn resolve_proxy(&self, repr: &str) -> Result<ObjectPrx> {
            let (identity, endpoint) = ObjectPrx::split_repr(repr, &Default::default())?;
            let transceiver = Transceiver::detached(endpoint.clone());
            Ok(ObjectPrx::bootstrap(identity, endpoint, transceiver))
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl ProxyResolver for FailingResolver {
        async fn resolve_proxy(&self, repr: &str) -> Result<ObjectPrx> {
            Err(Error::object_not_exist(repr))
        }
    }

    fn sample_proxy() -> ObjectPrx {
        let endpoint = EndpointInfo::new("calc", "localhost", 9000);
        ObjectPrx::bootstrap("X", endpoint.clone(), Transceiver::detached(endpoint))
    }

    #[test]
    fn test_marshal_proxy() {
        let json = marshal(&Value::Proxy(sample_proxy()));
        assert_eq!(
            json,
            json!({"wise_typecode": "Proxy", "repr": "X -w calc -h localhost -p 9000"})
        );
        assert_eq!(proxy_repr(&json), Some("X -w calc -h localhost -p 9000"));
    }

    #[test]
    fn test_marshal_nested_proxy() {
        let value = Value::from(vec![Value::from(1), Value::Proxy(sample_proxy())]);
        assert!(matches!(value, Value::List(_)));
        assert!(value.contains_proxy());

        let json = marshal(&value);
        assert_eq!(json[0], json!(1));
        assert!(contains_reference(&json));
    }

    #[test]
    fn test_plain_list_stays_data() {
        let value = Value::from(vec![Value::from(1), Value::from("two")]);
        assert_eq!(value, Value::Data(json!([1, "two"])));
    }

    #[test]
    fn test_wrong_typecode_is_not_a_reference() {
        let json = json!({"wise_typecode": "Other", "repr": "X -w calc"});
        assert!(proxy_repr(&json).is_none());
        assert!(!contains_reference(&json));
    }

    #[test]
    fn test_deserialize_data() {
        let value = Value::from(json!({"a": 1}));
        let parsed: BTreeMap<String, i64> = value.deserialize().expect("map");
        assert_eq!(parsed.get("a"), Some(&1));

        let err = Value::from("text").deserialize::<i64>().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_args_access() {
        let args = Args::new(vec![Value::from(2), Value::Proxy(sample_proxy())]);

        assert_eq!(args.arg::<i64>(0).expect("int"), 2);
        assert_eq!(args.proxy(1).expect("proxy").identity(), "X");
        assert!(args.proxy(0).is_err());
        assert!(matches!(args.value(5), Err(Error::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn test_unmarshal_plain_data() {
        let value = unmarshal(json!({"a": [1, 2]}), &OfflineResolver)
            .await
            .expect("decode");
        assert_eq!(value, Value::Data(json!({"a": [1, 2]})));
    }

    #[tokio::test]
    async fn test_unmarshal_resolves_nested_references() {
        let json = json!({
            "owner": {"wise_typecode": "Proxy", "repr": "X -w calc -h localhost -p 9000"},
            "count": 3
        });

        let value = unmarshal(json, &OfflineResolver).await.expect("decode");
        let Value::Map(entries) = value else {
            panic!("expected map");
        };
        assert_eq!(entries["count"], Value::from(3));
        let owner = entries["owner"].as_proxy().expect("proxy");
        assert_eq!(owner.identity(), "X");
        assert_eq!(owner.endpoint().ws_name(), "calc");
    }

    #[tokio::test]
    async fn test_unmarshal_propagates_resolution_failure() {
        let params = vec![json!(1), json!({"wise_typecode": "Proxy", "repr": "Y -w gone"})];
        let err = unmarshal_all(params, &FailingResolver).await.unwrap_err();
        assert!(matches!(err, Error::ObjectNotExist { .. }));
    }
}
