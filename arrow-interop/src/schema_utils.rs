use std::collections::HashMap;

use arrow_schema::{DataType, Field};

/// Field is nullable.
pub const FLAG_NULLABLE: i64 = 1;
/// Dictionary values are ordered.
pub const FLAG_DICTIONARY_ORDERED: i64 = 2;
/// Map keys are sorted within each entry.
pub const FLAG_MAP_KEYS_SORTED: i64 = 4;

/// Node flags for a value of `data_type`.
pub fn node_flags(data_type: &DataType, nullable: bool, dict_is_ordered: bool) -> i64 {
    let mut flags = 0;
    if nullable {
        flags |= FLAG_NULLABLE;
    }
    if dict_is_ordered && matches!(data_type, DataType::Dictionary(_, _)) {
        flags |= FLAG_DICTIONARY_ORDERED;
    }
    if matches!(data_type, DataType::Map(_, true)) {
        flags |= FLAG_MAP_KEYS_SORTED;
    }
    flags
}

pub trait FieldExt {
    /// Flags describing this field on an exported node.
    fn export_flags(&self) -> i64;

    /// Rebuild a field from the name, flags and metadata of an imported node.
    fn from_node(
        name: &str,
        data_type: DataType,
        flags: i64,
        metadata: HashMap<String, String>,
    ) -> Self;
}

impl FieldExt for Field {
    fn export_flags(&self) -> i64 {
        node_flags(
            self.data_type(),
            self.is_nullable(),
            self.dict_is_ordered().unwrap_or(false),
        )
    }

    fn from_node(
        name: &str,
        data_type: DataType,
        flags: i64,
        metadata: HashMap<String, String>,
    ) -> Self {
        let nullable = flags & FLAG_NULLABLE != 0;
        let field = match data_type {
            DataType::Dictionary(_, _) => Field::new_dict(
                name,
                data_type,
                nullable,
                0,
                flags & FLAG_DICTIONARY_ORDERED != 0,
            ),
            other => Field::new(name, other, nullable),
        };
        field.with_metadata(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_export_flags() {
        assert_eq!(Field::new("a", DataType::Int64, false).export_flags(), 0);
        assert_eq!(Field::new("a", DataType::Int64, true).export_flags(), FLAG_NULLABLE);

        let dict = DataType::Dictionary(Box::new(DataType::Int8), Box::new(DataType::Utf8));
        let ordered = Field::new_dict("d", dict.clone(), false, 0, true);
        assert_eq!(ordered.export_flags(), FLAG_DICTIONARY_ORDERED);
        let unordered = Field::new_dict("d", dict, true, 0, false);
        assert_eq!(unordered.export_flags(), FLAG_NULLABLE);
    }

    #[test]
    fn test_map_keys_sorted_flag() {
        let entries = Arc::new(Field::new(
            "entries",
            DataType::Struct(
                vec![
                    Field::new("key", DataType::Utf8, false),
                    Field::new("value", DataType::Int32, true),
                ]
                .into(),
            ),
            false,
        ));
        let sorted = DataType::Map(entries.clone(), true);
        assert_eq!(node_flags(&sorted, false, false), FLAG_MAP_KEYS_SORTED);
        assert_eq!(node_flags(&DataType::Map(entries, false), false, false), 0);
    }

    #[test]
    fn test_from_node() {
        let metadata = HashMap::from([("k".to_string(), "v".to_string())]);
        let dict = DataType::Dictionary(Box::new(DataType::UInt16), Box::new(DataType::Utf8));
        let field = Field::from_node(
            "col",
            dict.clone(),
            FLAG_NULLABLE | FLAG_DICTIONARY_ORDERED,
            metadata.clone(),
        );
        assert_eq!(field.name(), "col");
        assert_eq!(field.data_type(), &dict);
        assert!(field.is_nullable());
        assert_eq!(field.dict_is_ordered(), Some(true));
        assert_eq!(field.metadata(), &metadata);

        let plain = Field::from_node("", DataType::Int8, 0, HashMap::new());
        assert!(!plain.is_nullable());
        assert_eq!(plain.dict_is_ordered(), None);
    }
}
