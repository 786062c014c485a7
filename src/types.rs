use serde::{
    de::{self, DeserializeSeed, EnumAccess, MapAccess, SeqAccess, VariantAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};
use std::{collections::BTreeMap, error::Error, fmt};

/// A self-describing document tree. Call bodies and reply results are `Value`s.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        use Value::*;
        match self {
            Nil => "Nil",
            Bool(_) => "Bool",
            Int(_) => "Int",
            Float(_) => "Float",
            String(_) => "String",
            List(_) => "List",
            Map(_) => "Map",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Field lookup on a `Map`. Anything else has no fields.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Builds a `Map` from key/value pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Encode,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), V::encode(v)))
                .collect(),
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let json = serde_json::Value::from(self.clone());
        write!(f, "{json}")
    }
}

/// Lists and maps nested deeper than this are refused when decoding.
pub const MAX_DEPTH: usize = 128;

const VARIANTS: &[&str] = &["Nil", "Bool", "Int", "Float", "String", "List", "Map"];

#[derive(Deserialize)]
#[serde(variant_identifier)]
enum Kind {
    Nil,
    Bool,
    Int,
    Float,
    String,
    List,
    Map,
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Nested { depth: 0 }.deserialize(deserializer)
    }
}

/// Decodes one value sitting `depth` containers below the root.
#[derive(Clone, Copy)]
struct Nested {
    depth: usize,
}

impl Nested {
    fn child<E: de::Error>(self) -> Result<Self, E> {
        if self.depth >= MAX_DEPTH {
            return Err(E::custom(format_args!(
                "value nested deeper than {MAX_DEPTH} levels"
            )));
        }
        Ok(Nested {
            depth: self.depth + 1,
        })
    }
}

impl<'de> DeserializeSeed<'de> for Nested {
    type Value = Value;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_enum("Value", VARIANTS, self)
    }
}

impl<'de> Visitor<'de> for Nested {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a Value")
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<Value, A::Error> {
        let (kind, variant) = data.variant::<Kind>()?;
        Ok(match kind {
            Kind::Nil => {
                variant.unit_variant()?;
                Value::Nil
            }
            Kind::Bool => Value::Bool(variant.newtype_variant()?),
            Kind::Int => Value::Int(variant.newtype_variant()?),
            Kind::Float => Value::Float(variant.newtype_variant()?),
            Kind::String => Value::String(variant.newtype_variant()?),
            Kind::List => Value::List(variant.newtype_variant_seed(Items(self.child()?))?),
            Kind::Map => Value::Map(variant.newtype_variant_seed(Entries(self.child()?))?),
        })
    }
}

struct Items(Nested);

impl<'de> DeserializeSeed<'de> for Items {
    type Value = Vec<Value>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for Items {
    type Value = Vec<Value>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a list of Values")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        // the length hint comes off the wire
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
        while let Some(item) = seq.next_element_seed(self.0)? {
            items.push(item);
        }
        Ok(items)
    }
}

struct Entries(Nested);

impl<'de> DeserializeSeed<'de> for Entries {
    type Value = BTreeMap<String, Value>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for Entries {
    type Value = BTreeMap<String, Value>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of Values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some(key) = map.next_key::<String>()? {
            let value = map.next_value_seed(self.0)?;
            entries.insert(key, value);
        }
        Ok(entries)
    }
}

pub trait Encode {
    fn encode(val: Self) -> Value;
}

pub trait Decode: Sized {
    fn decode(val: Value) -> Result<Self, TypeMismatch>;
}

macro_rules! impl_encode_decode {
    ($rust_type:ty, $kind:expr, $encode_name:pat => $encode_expr:expr, $($from_rpc_arm:tt)*) => {
        impl Encode for $rust_type {
            fn encode($encode_name: $rust_type) -> Value {
                $encode_expr
            }
        }

        impl Decode for $rust_type {
            fn decode(val: Value) -> Result<Self, TypeMismatch> {
                Ok(match val {
                    $($from_rpc_arm)*,
                    _ => return Err(TypeMismatch::new($kind, &val)),
                })
            }
        }
    };
}

impl_encode_decode!((), "Nil", () => Value::Nil, Value::Nil => ());
impl_encode_decode!(bool, "Bool", b => Value::Bool(b), Value::Bool(b) => b);
impl_encode_decode!(i64, "Int", n => Value::Int(n), Value::Int(n) => n);
impl_encode_decode!(f64, "Float", x => Value::Float(x), Value::Float(x) => x, Value::Int(n) => n as f64);
impl_encode_decode!(String, "String", s => Value::String(s), Value::String(s) => s);

impl Encode for &str {
    fn encode(s: Self) -> Value {
        Value::String(s.to_owned())
    }
}

impl Encode for Value {
    fn encode(val: Value) -> Value {
        val
    }
}

impl Decode for Value {
    fn decode(val: Value) -> Result<Self, TypeMismatch> {
        Ok(val)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(val: Option<T>) -> Value {
        val.map_or(Value::Nil, T::encode)
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(val: Value) -> Result<Self, TypeMismatch> {
        match val {
            Value::Nil => Ok(None),
            other => T::decode(other).map(Some),
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(val: Vec<T>) -> Value {
        Value::List(val.into_iter().map(T::encode).collect())
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(val: Value) -> Result<Self, TypeMismatch> {
        match val {
            Value::List(items) => items.into_iter().map(T::decode).collect(),
            other => Err(TypeMismatch::new("List", &other)),
        }
    }
}

impl<T: Encode> Encode for BTreeMap<String, T> {
    fn encode(val: BTreeMap<String, T>) -> Value {
        Value::Map(val.into_iter().map(|(k, v)| (k, T::encode(v))).collect())
    }
}

impl<T: Decode> Decode for BTreeMap<String, T> {
    fn decode(val: Value) -> Result<Self, TypeMismatch> {
        match val {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| Ok((k, T::decode(v)?)))
                .collect(),
            other => Err(TypeMismatch::new("Map", &other)),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Nil,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Json::Object(fields) => {
                Value::Map(fields.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(val: Value) -> Self {
        use serde_json::Value as Json;
        match val {
            Value::Nil => Json::Null,
            Value::Bool(b) => Json::Bool(b),
            Value::Int(n) => Json::from(n),
            // non-finite floats have no JSON form
            Value::Float(x) => serde_json::Number::from_f64(x).map_or(Json::Null, Json::Number),
            Value::String(s) => Json::String(s),
            Value::List(items) => Json::Array(items.into_iter().map(Json::from).collect()),
            Value::Map(fields) => {
                Json::Object(fields.into_iter().map(|(k, v)| (k, Json::from(v))).collect())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeMismatch {
    expected: &'static str,
    found: &'static str,
}

impl TypeMismatch {
    fn new(expected: &'static str, value: &Value) -> Self {
        Self {
            expected,
            found: value.kind(),
        }
    }
}

impl fmt::Display for TypeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "expected {}, found {}", self.expected, self.found)
    }
}

impl Error for TypeMismatch {}

#[cfg(test)]
mod tests {
    use super::*;
    use bincode::Options;

    #[test]
    fn decode_rejects_wrong_shape() {
        let err = String::decode(Value::Int(3)).unwrap_err();
        assert_eq!(err.to_string(), "expected String, found Int");

        let err = Vec::<i64>::decode(Value::List(vec![Value::Int(1), Value::Nil])).unwrap_err();
        assert_eq!(err.to_string(), "expected Int, found Nil");
    }

    #[test]
    fn option_treats_nil_as_none() {
        assert_eq!(Option::<String>::decode(Value::Nil).unwrap(), None);
        assert_eq!(
            Option::<String>::decode(Value::from("x")).unwrap(),
            Some("x".to_owned())
        );
        assert_eq!(Option::<i64>::encode(None), Value::Nil);
    }

    #[test]
    fn map_lookup() {
        let v = Value::map([("name", Value::from("echo")), ("body", Value::Int(4))]);
        assert_eq!(v.get("name").and_then(Value::as_str), Some("echo"));
        assert_eq!(v.get("body").and_then(Value::as_int), Some(4));
        assert!(v.get("missing").is_none());
        assert!(Value::Int(1).get("name").is_none());
    }

    #[test]
    fn json_conversion_keeps_structure() {
        let json = serde_json::json!({
            "column3": { "name1": "valuechild", "name2": 1000 },
            "column4": 100,
            "ratio": 0.5,
            "tags": ["a", null, true],
        });
        let value = Value::from(json.clone());
        assert_eq!(
            value.get("column3").and_then(|c| c.get("name2")),
            Some(&Value::Int(1000))
        );
        assert_eq!(value.get("ratio"), Some(&Value::Float(0.5)));
        assert_eq!(serde_json::Value::from(value), json);
    }

    fn nested_lists(depth: usize) -> Value {
        (0..depth).fold(Value::Nil, |inner, _| Value::List(vec![inner]))
    }

    #[test]
    fn decoding_survives_the_wire_format() {
        let value = Value::map([
            ("name", Value::from("echo")),
            ("body", Value::List(vec![Value::Float(1.5), Value::Bool(true), Value::Nil])),
        ]);
        let bytes = bincode::options().serialize(&value).unwrap();
        let decoded: Value = bincode::options().deserialize(&bytes).unwrap();
        assert_eq!(decoded, value);

        let from_json: Value = serde_json::from_str(r#"{"List":[{"Int":3},"Nil"]}"#).unwrap();
        assert_eq!(from_json, Value::List(vec![Value::Int(3), Value::Nil]));
    }

    #[test]
    fn nesting_is_bounded_when_decoding() {
        let shallow = nested_lists(MAX_DEPTH);
        let bytes = bincode::options().serialize(&shallow).unwrap();
        let decoded: Value = bincode::options().deserialize(&bytes).unwrap();
        assert_eq!(decoded, shallow);

        let deep = nested_lists(MAX_DEPTH + 1);
        let bytes = bincode::options().serialize(&deep).unwrap();
        let err = bincode::options().deserialize::<Value>(&bytes).unwrap_err();
        assert!(err.to_string().contains("nested deeper than"), "{err}");

        // far past anything the stack could recurse through
        let mut bytes = Vec::new();
        for _ in 0..200_000 {
            bytes.extend_from_slice(&[5, 1]);
        }
        bytes.push(0);
        assert!(bincode::options().deserialize::<Value>(&bytes).is_err());
    }

    #[test]
    fn non_finite_float_becomes_null() {
        assert_eq!(
            serde_json::Value::from(Value::Float(f64::INFINITY)),
            serde_json::Value::Null
        );
    }
}
