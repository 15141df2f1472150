//! Optional serde support for [`Value`].
//!
//! Serialization snapshots composites through raw (untracked) reads;
//! deserialization builds raw composites and therefore requires an active
//! root. Opaque payloads and composite map keys serialize as unit.

use std::cell::Cell;

use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::object::ObjectKind;
use crate::value::{Key, MapKey, Value};

thread_local! {
    /// Guards against cyclic object graphs during serialization.
    static SER_DEPTH: Cell<usize> = const { Cell::new(0) };
}

const MAX_SER_DEPTH: usize = 128;

struct DepthGuard;

impl DepthGuard {
    fn enter<E: serde::ser::Error>() -> Result<DepthGuard, E> {
        let depth = SER_DEPTH.with(|d| d.get());
        if depth >= MAX_SER_DEPTH {
            return Err(E::custom("value graph is cyclic or too deep to serialize"));
        }
        SER_DEPTH.with(|d| d.set(depth + 1));
        Ok(DepthGuard)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        SER_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Unit => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(n) => serializer.serialize_f64(*n),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Opaque(_) => serializer.serialize_unit(),
            Value::Obj(o) => {
                let _guard = DepthGuard::enter::<S::Error>()?;
                let entries = o.as_raw().entries();
                match o.kind() {
                    ObjectKind::Record | ObjectKind::Map => {
                        let mut map = serializer.serialize_map(Some(entries.len()))?;
                        for (key, value) in entries {
                            match key {
                                Key::Prop(name) => map.serialize_entry(&*name, &value)?,
                                Key::Entry(MapKey::Str(name)) => {
                                    map.serialize_entry(&*name, &value)?
                                }
                                Key::Entry(MapKey::Int(n)) => map.serialize_entry(&n, &value)?,
                                Key::Entry(MapKey::Bool(b)) => map.serialize_entry(&b, &value)?,
                                Key::Entry(_) => map.serialize_entry(&(), &value)?,
                                _ => {}
                            }
                        }
                        map.end()
                    }
                    ObjectKind::List | ObjectKind::Set => {
                        let mut seq = serializer.serialize_seq(Some(entries.len()))?;
                        for (_, value) in entries {
                            seq.serialize_element(&value)?;
                        }
                        seq.end()
                    }
                }
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("a unit, bool, number, string, sequence, or map")
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::Unit)
    }
    fn visit_none<E>(self) -> Result<Value, E> {
        Ok(Value::Unit)
    }
    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
    fn visit_bool<E>(self, b: bool) -> Result<Value, E> {
        Ok(Value::Bool(b))
    }
    fn visit_i64<E>(self, n: i64) -> Result<Value, E> {
        Ok(Value::Int(n))
    }
    fn visit_u64<E: serde::de::Error>(self, n: u64) -> Result<Value, E> {
        i64::try_from(n)
            .map(Value::Int)
            .map_err(|_| E::custom("integer out of range"))
    }
    fn visit_f64<E>(self, n: f64) -> Result<Value, E> {
        Ok(Value::Float(n))
    }
    fn visit_str<E>(self, s: &str) -> Result<Value, E> {
        Ok(Value::str(s))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let list = crate::create_list();
        while let Some(value) = seq.next_element::<Value>()? {
            list.push_silent(value);
        }
        Ok(Value::Obj(list))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let record = crate::create_record();
        while let Some((key, value)) = map.next_entry::<String, Value>()? {
            record.set_silent(key.as_str(), value);
        }
        Ok(Value::Obj(record))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}
