//! Terse construction of raw composite values.

/// Builds a raw record: `record! { name: "ada", age: 36 }`.
///
/// Values go through [`Value::from`](crate::Value), so primitives, strings,
/// and nested `record!`/`list!` composites all work. The result is a raw
/// handle; pass it through [`reactive`](crate::reactive) (or
/// [`reactive_obj`](crate::reactive_obj)) to obtain the tracked view.
#[macro_export]
macro_rules! record {
    () => { $crate::create_record() };
    ($($key:ident : $value:expr),+ $(,)?) => {{
        let o = $crate::create_record();
        $(
            o.set_silent(stringify!($key), $crate::Value::from($value));
        )+
        o
    }};
}

/// Builds a raw list: `list![1, 2, 3]`.
#[macro_export]
macro_rules! list {
    () => { $crate::create_list() };
    ($($value:expr),+ $(,)?) => {{
        let o = $crate::create_list();
        $(
            o.push_silent($crate::Value::from($value));
        )+
        o
    }};
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn record_macro_builds_nested_raw_values() {
        let _ = create_root(|| {
            let o = record! {
                name: "ada",
                age: 36,
                tags: list!["math", "engines"],
                address: record! { city: "london" },
            };
            assert!(reactive(o.into()).is_composite());
            assert_eq!(o.get("name"), Value::str("ada"));
            assert_eq!(o.get("age"), Value::Int(36));
            let tags = o.get("tags").as_obj().unwrap();
            assert_eq!(tags.len(), 2);
            let address = o.get("address").as_obj().unwrap();
            assert_eq!(address.get("city"), Value::str("london"));
        });
    }

    #[test]
    fn empty_macros_build_empty_composites() {
        let _ = create_root(|| {
            assert_eq!(record! {}.len(), 0);
            assert_eq!(list![].len(), 0);
        });
    }
}
