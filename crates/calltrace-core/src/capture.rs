//! Total conversion of arbitrary values into storable JSON.
//!
//! [`to_storable`] drives a value's `Serialize` impl through a lenient
//! serializer that never gives up on the whole value: any subtree that fails
//! to serialize becomes a placeholder string and its siblings are kept.

use std::fmt::{Debug, Write as _};

use serde::ser::{self, Serialize, SerializeMap as _, Serializer};
use serde_json::{Map, Number, Value};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub(crate) struct CaptureError(String);

impl ser::Error for CaptureError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

/// Converts any serializable value into a JSON value. Never fails.
pub fn to_storable<T>(value: &T) -> Value
where
    T: Serialize + ?Sized,
{
    match value.serialize(Lenient) {
        Ok(captured) => captured,
        Err(err) => Value::String(format!("<unserializable: {err}>")),
    }
}

/// JSON text of a captured value, as written to storage.
#[must_use]
pub fn to_storable_text(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|err| {
        Value::String(format!("<unserializable: {err}>")).to_string()
    })
}

/// Decodes stored JSON text. Text that is not valid JSON comes back as a
/// JSON string; empty text is null.
#[must_use]
pub fn from_storable_text(text: &str) -> Value {
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()))
}

/// `Debug` text of a value, or `<unrepresentable: type>` when its `Debug`
/// impl reports an error.
pub fn debug_text<T: Debug + ?Sized>(value: &T) -> String {
    let mut out = String::new();
    match write!(out, "{value:?}") {
        Ok(()) => out,
        Err(_) => format!("<unrepresentable: {}>", std::any::type_name::<T>()),
    }
}

fn bytes_to_value(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(text) => Value::String(text.to_owned()),
        Err(_) => Value::String(format!("<bytes: {} bytes>", bytes.len())),
    }
}

fn key_text(key: Value) -> String {
    match key {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

/// A conversational message: role/kind, content, optional extras.
pub trait MessageLike {
    fn kind(&self) -> &str;
    fn content(&self) -> Value;

    fn additional(&self) -> Option<Value> {
        None
    }

    fn tool_calls(&self) -> Option<Value> {
        None
    }
}

/// Captures a [`MessageLike`] as `{type, content, additional_kwargs, tool_calls?}`.
pub struct Message<'a, M: ?Sized>(pub &'a M);

impl<M: MessageLike + ?Sized> Serialize for Message<'_, M> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.0.kind())?;
        map.serialize_entry("content", &self.0.content())?;
        map.serialize_entry(
            "additional_kwargs",
            &self
                .0
                .additional()
                .unwrap_or_else(|| Value::Object(Map::new())),
        )?;
        if let Some(calls) = self.0.tool_calls() {
            map.serialize_entry("tool_calls", &calls)?;
        }
        map.end()
    }
}

/// A structured model that knows how to dump itself into a plain mapping.
pub trait ModelDump: Debug {
    /// # Errors
    /// Returns a description of why the model could not be dumped.
    fn dump(&self) -> Result<Value, String>;
}

/// Captures a [`ModelDump`], falling back to its `Debug` text.
pub struct Model<'a, M: ?Sized>(pub &'a M);

impl<M: ModelDump + ?Sized> Serialize for Model<'_, M> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.dump() {
            Ok(dumped) => dumped.serialize(serializer),
            Err(_) => serializer.serialize_str(&debug_text(self.0)),
        }
    }
}

/// Raw bytes: UTF-8 text when decodable, otherwise a size placeholder.
pub struct Bytes<'a>(pub &'a [u8]);

impl Serialize for Bytes<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

/// Anything with a `Debug` impl, captured as that text.
pub struct Opaque<'a, T: ?Sized>(pub &'a T);

impl<T: Debug + ?Sized> Serialize for Opaque<'_, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&debug_text(self.0))
    }
}

struct Lenient;

pub(crate) struct SeqCapture {
    items: Vec<Value>,
}

pub(crate) struct VariantSeqCapture {
    variant: &'static str,
    items: Vec<Value>,
}

pub(crate) struct MapCapture {
    entries: Map<String, Value>,
    pending_key: Option<String>,
}

pub(crate) struct VariantMapCapture {
    variant: &'static str,
    entries: Map<String, Value>,
}

fn tagged(variant: &'static str, inner: Value) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(variant.to_owned(), inner);
    Value::Object(map)
}

impl Serializer for Lenient {
    type Ok = Value;
    type Error = CaptureError;
    type SerializeSeq = SeqCapture;
    type SerializeTuple = SeqCapture;
    type SerializeTupleStruct = SeqCapture;
    type SerializeTupleVariant = VariantSeqCapture;
    type SerializeMap = MapCapture;
    type SerializeStruct = MapCapture;
    type SerializeStructVariant = VariantMapCapture;

    fn serialize_bool(self, v: bool) -> Result<Value, CaptureError> {
        Ok(Value::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<Value, CaptureError> {
        Ok(Value::from(v))
    }

    fn serialize_i16(self, v: i16) -> Result<Value, CaptureError> {
        Ok(Value::from(v))
    }

    fn serialize_i32(self, v: i32) -> Result<Value, CaptureError> {
        Ok(Value::from(v))
    }

    fn serialize_i64(self, v: i64) -> Result<Value, CaptureError> {
        Ok(Value::from(v))
    }

    fn serialize_i128(self, v: i128) -> Result<Value, CaptureError> {
        Ok(i64::try_from(v).map_or_else(|_| Value::String(v.to_string()), Value::from))
    }

    fn serialize_u8(self, v: u8) -> Result<Value, CaptureError> {
        Ok(Value::from(v))
    }

    fn serialize_u16(self, v: u16) -> Result<Value, CaptureError> {
        Ok(Value::from(v))
    }

    fn serialize_u32(self, v: u32) -> Result<Value, CaptureError> {
        Ok(Value::from(v))
    }

    fn serialize_u64(self, v: u64) -> Result<Value, CaptureError> {
        Ok(Value::from(v))
    }

    fn serialize_u128(self, v: u128) -> Result<Value, CaptureError> {
        Ok(u64::try_from(v).map_or_else(|_| Value::String(v.to_string()), Value::from))
    }

    fn serialize_f32(self, v: f32) -> Result<Value, CaptureError> {
        self.serialize_f64(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<Value, CaptureError> {
        Ok(Number::from_f64(v).map_or_else(|| Value::String(v.to_string()), Value::Number))
    }

    fn serialize_char(self, v: char) -> Result<Value, CaptureError> {
        Ok(Value::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<Value, CaptureError> {
        Ok(Value::String(v.to_owned()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Value, CaptureError> {
        Ok(bytes_to_value(v))
    }

    fn serialize_none(self) -> Result<Value, CaptureError> {
        Ok(Value::Null)
    }

    fn serialize_some<T>(self, value: &T) -> Result<Value, CaptureError>
    where
        T: ?Sized + Serialize,
    {
        Ok(to_storable(value))
    }

    fn serialize_unit(self) -> Result<Value, CaptureError> {
        Ok(Value::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Value, CaptureError> {
        Ok(Value::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<Value, CaptureError> {
        Ok(Value::String(variant.to_owned()))
    }

    fn serialize_newtype_struct<T>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Value, CaptureError>
    where
        T: ?Sized + Serialize,
    {
        Ok(to_storable(value))
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value, CaptureError>
    where
        T: ?Sized + Serialize,
    {
        Ok(tagged(variant, to_storable(value)))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqCapture, CaptureError> {
        Ok(SeqCapture {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqCapture, CaptureError> {
        Ok(SeqCapture {
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqCapture, CaptureError> {
        self.serialize_tuple(len)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantSeqCapture, CaptureError> {
        Ok(VariantSeqCapture {
            variant,
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, len: Option<usize>) -> Result<MapCapture, CaptureError> {
        Ok(MapCapture {
            entries: Map::with_capacity(len.unwrap_or(0)),
            pending_key: None,
        })
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<MapCapture, CaptureError> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantMapCapture, CaptureError> {
        Ok(VariantMapCapture {
            variant,
            entries: Map::with_capacity(len),
        })
    }
}

impl ser::SerializeSeq for SeqCapture {
    type Ok = Value;
    type Error = CaptureError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), CaptureError>
    where
        T: ?Sized + Serialize,
    {
        self.items.push(to_storable(value));
        Ok(())
    }

    fn end(self) -> Result<Value, CaptureError> {
        Ok(Value::Array(self.items))
    }
}

impl ser::SerializeTuple for SeqCapture {
    type Ok = Value;
    type Error = CaptureError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), CaptureError>
    where
        T: ?Sized + Serialize,
    {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Value, CaptureError> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for SeqCapture {
    type Ok = Value;
    type Error = CaptureError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), CaptureError>
    where
        T: ?Sized + Serialize,
    {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Value, CaptureError> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleVariant for VariantSeqCapture {
    type Ok = Value;
    type Error = CaptureError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), CaptureError>
    where
        T: ?Sized + Serialize,
    {
        self.items.push(to_storable(value));
        Ok(())
    }

    fn end(self) -> Result<Value, CaptureError> {
        Ok(tagged(self.variant, Value::Array(self.items)))
    }
}

impl ser::SerializeMap for MapCapture {
    type Ok = Value;
    type Error = CaptureError;

    fn serialize_key<T>(&mut self, key: &T) -> Result<(), CaptureError>
    where
        T: ?Sized + Serialize,
    {
        self.pending_key = Some(key_text(to_storable(key)));
        Ok(())
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<(), CaptureError>
    where
        T: ?Sized + Serialize,
    {
        let key = self.pending_key.take().unwrap_or_default();
        self.entries.insert(key, to_storable(value));
        Ok(())
    }

    fn end(self) -> Result<Value, CaptureError> {
        Ok(Value::Object(self.entries))
    }
}

impl ser::SerializeStruct for MapCapture {
    type Ok = Value;
    type Error = CaptureError;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<(), CaptureError>
    where
        T: ?Sized + Serialize,
    {
        self.entries.insert(key.to_owned(), to_storable(value));
        Ok(())
    }

    fn end(self) -> Result<Value, CaptureError> {
        Ok(Value::Object(self.entries))
    }
}

impl ser::SerializeStructVariant for VariantMapCapture {
    type Ok = Value;
    type Error = CaptureError;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<(), CaptureError>
    where
        T: ?Sized + Serialize,
    {
        self.entries.insert(key.to_owned(), to_storable(value));
        Ok(())
    }

    fn end(self) -> Result<Value, CaptureError> {
        Ok(tagged(self.variant, Value::Object(self.entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::{BTreeMap, HashSet};

    struct Refuses;

    impl Serialize for Refuses {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(ser::Error::custom("socket handles cannot be captured"))
        }
    }

    #[derive(Serialize)]
    struct Order {
        id: u32,
        items: Vec<&'static str>,
        handle: Refuses,
    }

    #[derive(Serialize)]
    enum Shape {
        Point,
        Circle(f64),
        Rect { w: u32, h: u32 },
        Pair(u8, u8),
    }

    struct Human(&'static str);

    impl MessageLike for Human {
        fn kind(&self) -> &str {
            "human"
        }

        fn content(&self) -> Value {
            json!(self.0)
        }
    }

    #[derive(Debug)]
    struct Ai;

    impl MessageLike for Ai {
        fn kind(&self) -> &str {
            "ai"
        }

        fn content(&self) -> Value {
            json!("")
        }

        fn tool_calls(&self) -> Option<Value> {
            Some(json!([{"name": "lookup", "args": {"q": "x"}}]))
        }
    }

    #[derive(Debug)]
    struct Customer {
        name: String,
        broken: bool,
    }

    impl ModelDump for Customer {
        fn dump(&self) -> Result<Value, String> {
            if self.broken {
                Err("validator rejected".to_owned())
            } else {
                Ok(json!({"name": self.name}))
            }
        }
    }

    #[test]
    fn primitives_pass_through() {
        assert_eq!(to_storable(&5), json!(5));
        assert_eq!(to_storable("hi"), json!("hi"));
        assert_eq!(to_storable(&true), json!(true));
        assert_eq!(to_storable(&Option::<u8>::None), Value::Null);
        assert_eq!(to_storable(&2.5_f64), json!(2.5));
    }

    #[test]
    fn non_finite_floats_and_wide_integers_become_text() {
        assert_eq!(to_storable(&f64::NAN), json!("NaN"));
        assert_eq!(to_storable(&f64::INFINITY), json!("inf"));
        assert_eq!(to_storable(&u128::MAX), json!(u128::MAX.to_string()));
        assert_eq!(to_storable(&7_i128), json!(7));
    }

    #[test]
    fn failing_subtree_is_replaced_and_siblings_survive() {
        let order = Order {
            id: 9,
            items: vec!["a", "b"],
            handle: Refuses,
        };
        let captured = to_storable(&order);
        assert_eq!(captured["id"], json!(9));
        assert_eq!(captured["items"], json!(["a", "b"]));
        assert_eq!(
            captured["handle"],
            json!("<unserializable: socket handles cannot be captured>")
        );
    }

    #[test]
    fn top_level_failure_yields_placeholder_text() {
        let captured = to_storable(&Refuses);
        assert!(captured
            .as_str()
            .is_some_and(|text| text.starts_with("<unserializable")));
    }

    #[test]
    fn non_string_map_keys_are_stringified() {
        let mut map = BTreeMap::new();
        map.insert((1, "x"), "tuple key");
        map.insert((2, "y"), "other");
        let captured = to_storable(&map);
        assert_eq!(captured["[1,\"x\"]"], json!("tuple key"));

        let mut numeric = BTreeMap::new();
        numeric.insert(3_u8, "three");
        assert_eq!(to_storable(&numeric), json!({"3": "three"}));
    }

    #[test]
    fn sets_and_tuples_become_arrays() {
        let set: HashSet<u8> = [4].into_iter().collect();
        assert_eq!(to_storable(&set), json!([4]));
        assert_eq!(to_storable(&(1, "a", false)), json!([1, "a", false]));
    }

    #[test]
    fn enums_are_externally_tagged() {
        assert_eq!(to_storable(&Shape::Point), json!("Point"));
        assert_eq!(to_storable(&Shape::Circle(1.5)), json!({"Circle": 1.5}));
        assert_eq!(
            to_storable(&Shape::Rect { w: 2, h: 3 }),
            json!({"Rect": {"w": 2, "h": 3}})
        );
        assert_eq!(to_storable(&Shape::Pair(1, 2)), json!({"Pair": [1, 2]}));
    }

    #[test]
    fn messages_capture_kind_content_and_extras() {
        assert_eq!(
            to_storable(&Message(&Human("hello"))),
            json!({"type": "human", "content": "hello", "additional_kwargs": {}})
        );
        let ai = to_storable(&Message(&Ai));
        assert_eq!(ai["type"], json!("ai"));
        assert_eq!(ai["tool_calls"][0]["name"], json!("lookup"));
    }

    #[test]
    fn models_dump_or_fall_back_to_debug_text() {
        let good = Customer {
            name: "Ada".to_owned(),
            broken: false,
        };
        assert_eq!(to_storable(&Model(&good)), json!({"name": "Ada"}));

        let bad = Customer {
            name: "Bob".to_owned(),
            broken: true,
        };
        let captured = to_storable(&Model(&bad));
        assert!(captured
            .as_str()
            .is_some_and(|text| text.contains("Customer") && text.contains("Bob")));
    }

    #[test]
    fn bytes_decode_as_text_or_size_placeholder() {
        assert_eq!(to_storable(&Bytes(b"plain")), json!("plain"));
        assert_eq!(
            to_storable(&Bytes(&[0xff, 0xfe, 0x00])),
            json!("<bytes: 3 bytes>")
        );
    }

    #[test]
    fn opaque_values_use_debug_text() {
        let thread = std::thread::current().id();
        let captured = to_storable(&Opaque(&thread));
        assert!(captured
            .as_str()
            .is_some_and(|text| text.starts_with("ThreadId")));
    }

    #[test]
    fn storable_text_decodes_leniently() {
        assert_eq!(from_storable_text("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(from_storable_text("not json"), json!("not json"));
        assert_eq!(from_storable_text(""), Value::Null);
        assert_eq!(to_storable_text(&json!([1, "x"])), "[1,\"x\"]");
    }

    proptest! {
        #[test]
        fn capture_is_total_and_storable(
            floats in proptest::collection::vec(any::<f64>(), 0..8),
            bytes in proptest::collection::vec(any::<u8>(), 0..32),
            wide in any::<i128>(),
            keyed in proptest::collection::btree_map((any::<i32>(), ".{0,6}"), any::<u64>(), 0..6),
        ) {
            let captured = to_storable(&(floats, Bytes(&bytes), wide, keyed));
            let text = to_storable_text(&captured);
            prop_assert!(serde_json::from_str::<Value>(&text).is_ok());
            prop_assert!(captured.is_array());
        }
    }
}
