//! Exporter: Arrow array data to an exchange node tree.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::ptr;

use arrow_buffer::bit_mask::set_bits;
use arrow_buffer::{Buffer, MutableBuffer};
use arrow_data::ArrayData;
use arrow_schema::{DataType, Field, FieldRef};
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::ffi::FFI_ArrowArray;
use crate::format::Format;
use crate::layout::{Category, Layout};
use crate::metadata;
use crate::release::{ExportedPrivateData, NodeHeader};
use crate::schema_utils::{node_flags, FieldExt, FLAG_NULLABLE};

pub(crate) struct Exporter<'a> {
    config: &'a BridgeConfig,
}

impl<'a> Exporter<'a> {
    pub fn new(config: &'a BridgeConfig) -> Self {
        Self { config }
    }

    /// Export `data` as an unnamed, nullable node.
    pub fn export_array(&self, data: &ArrayData) -> Result<FFI_ArrowArray> {
        let flags = node_flags(data.data_type(), true, false);
        self.export_node("", flags, &HashMap::new(), data, 0)
    }

    /// Export `data` under the name, nullability, dictionary ordering and
    /// metadata of `field`.
    pub fn export_field(&self, field: &Field, data: &ArrayData) -> Result<FFI_ArrowArray> {
        if field.data_type() != data.data_type() {
            return Err(BridgeError::invalid(format!(
                "field '{}' has type {} but the array has type {}",
                field.name(),
                field.data_type(),
                data.data_type()
            )));
        }
        self.export_node(field.name(), field.export_flags(), field.metadata(), data, 0)
    }

    pub(crate) fn export_node(
        &self,
        name: &str,
        flags: i64,
        metadata: &HashMap<String, String>,
        data: &ArrayData,
        depth: usize,
    ) -> Result<FFI_ArrowArray> {
        if depth > self.config.max_nesting_depth {
            return Err(BridgeError::invalid(format!(
                "type nesting exceeds the maximum depth of {}",
                self.config.max_nesting_depth
            )));
        }

        let rebased;
        let data = match data.data_type() {
            DataType::Struct(_) if data.offset() != 0 => {
                rebased = rebase_struct(data);
                &rebased
            }
            _ => data,
        };

        let format = Format::try_from_data_type(data.data_type())?;
        let layout = Layout::of(&format);

        // Children first: if any fails, the ones already built are released
        // when `children` drops.
        let children = child_fields(data.data_type())
            .map(|fields| self.export_children(&fields, data, depth))
            .transpose()?
            .unwrap_or_default();
        if !layout.children.accepts(children.len()) {
            return Err(BridgeError::invalid(format!(
                "array of type {} has {} children, format '{format}' does not allow that",
                data.data_type(),
                children.len()
            )));
        }

        let dictionary = match data.data_type() {
            DataType::Dictionary(_, value_type) => {
                let values = single_child(data)?;
                let flags = node_flags(value_type, true, false);
                Some(self.export_node("", flags, &HashMap::new(), values, depth + 1)?)
            }
            _ => None,
        };

        let (buffers, realigned_validity) = self.buffer_table(&layout, data)?;
        if buffers.len() != layout.n_buffers() {
            return Err(BridgeError::invalid(format!(
                "array of type {} has {} buffers, expected {}",
                data.data_type(),
                buffers.len(),
                layout.n_buffers()
            )));
        }

        let null_count = match layout.category {
            Category::Null => data.len(),
            _ => data.null_count(),
        };
        let header = NodeHeader {
            flags,
            length: data.len() as i64,
            null_count: null_count as i64,
            offset: data.offset() as i64,
        };

        let format_string = format.to_string();
        debug!(
            "Exporting node '{}' format={} length={} children={} dictionary={}",
            name,
            format_string,
            data.len(),
            children.len(),
            dictionary.is_some()
        );
        let private = ExportedPrivateData::new(
            c_string(format_string, "format")?,
            c_string(name.to_string(), "name")?,
            metadata::encode(metadata),
            buffers,
            children,
            dictionary,
            realigned_validity,
            data.clone(),
        );
        Ok(private.into_node(header))
    }

    fn export_children(
        &self,
        fields: &[FieldRef],
        data: &ArrayData,
        depth: usize,
    ) -> Result<Vec<FFI_ArrowArray>> {
        if fields.len() != data.child_data().len() {
            return Err(BridgeError::invalid(format!(
                "array of type {} has {} child arrays, expected {}",
                data.data_type(),
                data.child_data().len(),
                fields.len()
            )));
        }
        fields
            .iter()
            .zip(data.child_data())
            .map(|(field, child)| {
                self.export_node(
                    field.name(),
                    field.export_flags(),
                    field.metadata(),
                    child,
                    depth + 1,
                )
            })
            .collect()
    }

    /// Buffer pointers in exchange order, plus the re-materialised validity
    /// bitmap when the source bitmap could not be shared.
    fn buffer_table(
        &self,
        layout: &Layout,
        data: &ArrayData,
    ) -> Result<(Vec<*const c_void>, Option<Buffer>)> {
        let buffers = data.buffers();
        match layout.category {
            Category::Null => Ok((vec![ptr::null()], None)),
            Category::SparseUnion | Category::DenseUnion => {
                let mut table = vec![ptr::null()];
                table.extend(buffers.iter().map(|b| b.as_ptr() as *const c_void));
                if layout.category == Category::SparseUnion {
                    table.push(ptr::null());
                }
                Ok((table, None))
            }
            _ => {
                let (validity, realigned) = self.validity_pointer(data)?;
                let mut table = vec![validity];
                table.extend(buffers.iter().map(|b| b.as_ptr() as *const c_void));
                Ok((table, realigned))
            }
        }
    }

    /// Address of a bitmap whose bit `offset + i` is the validity of element `i`.
    fn validity_pointer(&self, data: &ArrayData) -> Result<(*const c_void, Option<Buffer>)> {
        let Some(nulls) = data.nulls() else {
            return Ok((ptr::null(), None));
        };
        let bit_offset = nulls.offset();
        let offset = data.offset();
        if bit_offset >= offset && (bit_offset - offset) % 8 == 0 {
            let bytes = &nulls.buffer().as_slice()[(bit_offset - offset) / 8..];
            return Ok((bytes.as_ptr() as *const c_void, None));
        }

        if !self.config.realign_validity {
            return Err(BridgeError::not_implemented(format!(
                "validity bitmap at bit offset {bit_offset} cannot be shared for array offset {offset}"
            )));
        }
        warn!(
            "Re-materialising validity bitmap of {} bits (bit offset {}, array offset {})",
            data.len(),
            bit_offset,
            offset
        );
        let mut bitmap = MutableBuffer::new_null(offset + data.len());
        set_bits(
            bitmap.as_slice_mut(),
            nulls.buffer().as_slice(),
            offset,
            bit_offset,
            data.len(),
        );
        let bitmap: Buffer = bitmap.into();
        Ok((bitmap.as_ptr() as *const c_void, Some(bitmap)))
    }
}

/// Fields describing the children of a nested type, `None` for leaves and
/// dictionaries.
fn child_fields(data_type: &DataType) -> Option<Vec<FieldRef>> {
    match data_type {
        DataType::List(field)
        | DataType::LargeList(field)
        | DataType::FixedSizeList(field, _)
        | DataType::Map(field, _) => Some(vec![field.clone()]),
        DataType::Struct(fields) => Some(fields.iter().cloned().collect()),
        DataType::Union(fields, _) => Some(fields.iter().map(|(_, f)| f.clone()).collect()),
        _ => None,
    }
}

/// Struct data at offset `k` comes in two shapes: children already sliced
/// to the struct's elements (`ArrayData::slice`), or full children indexed
/// from `k`. Either way the struct goes out at offset 0 with children holding
/// exactly its elements; its validity bits are addressed by `nulls.offset()`.
fn rebase_struct(data: &ArrayData) -> ArrayData {
    let (offset, len) = (data.offset(), data.len());
    let children = data
        .child_data()
        .iter()
        .map(|child| {
            if child.len() >= offset + len {
                child.slice(offset, len)
            } else {
                child.clone()
            }
        })
        .collect();
    let builder = ArrayData::builder(data.data_type().clone())
        .len(len)
        .nulls(data.nulls().cloned())
        .child_data(children);
    // SAFETY: same elements as `data`, which is valid, with the offset moved
    // into the children.
    unsafe { builder.build_unchecked() }
}

fn single_child(data: &ArrayData) -> Result<&ArrayData> {
    match data.child_data() {
        [values] => Ok(values),
        other => Err(BridgeError::invalid(format!(
            "dictionary array has {} value arrays, expected 1",
            other.len()
        ))),
    }
}

fn c_string(value: String, what: &str) -> Result<CString> {
    CString::new(value).map_err(|_| BridgeError::invalid(format!("{what} contains a NUL byte")))
}

/// Export `data` as an unnamed, nullable node using the default configuration.
pub fn export_array(data: &ArrayData) -> Result<FFI_ArrowArray> {
    Exporter::new(&BridgeConfig::default()).export_array(data)
}

/// Export `data` described by `field` using the default configuration.
pub fn export_field(field: &Field, data: &ArrayData) -> Result<FFI_ArrowArray> {
    Exporter::new(&BridgeConfig::default()).export_field(field, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_utils::FLAG_DICTIONARY_ORDERED;
    use arrow_array::types::Int8Type;
    use arrow_array::{
        Array, ArrayRef, DictionaryArray, Int32Array, Int8Array, NullArray, StringArray,
        StringViewArray, StructArray,
    };
    use std::sync::Arc;

    #[test]
    fn test_export_primitive_shares_buffers() {
        let array = Int8Array::from(vec![Some(1), Some(2), None, Some(-3)]);
        let data = array.to_data();
        let node = export_array(&data).unwrap();

        assert_eq!(node.format().unwrap().to_str().unwrap(), "c");
        assert_eq!(node.n_buffers, 2);
        assert_eq!(node.n_children, 0);
        assert_eq!(node.length, 4);
        assert_eq!(node.null_count, 1);
        assert_eq!(node.offset, 0);
        assert_eq!(node.flags, FLAG_NULLABLE);
        assert_eq!(node.buffer(1) as *const u8, array.values().inner().as_ptr());
        assert_eq!(
            node.buffer(0) as *const u8,
            array.nulls().unwrap().buffer().as_ptr()
        );
        assert!(node.dictionary.is_null());
    }

    #[test]
    fn test_export_string_buffers() {
        let data = StringArray::from(vec!["foo", "bar"]).to_data();
        let node = export_array(&data).unwrap();
        assert_eq!(node.format().unwrap().to_str().unwrap(), "u");
        assert_eq!(node.n_buffers, 3);
        assert!(node.buffer(0).is_null());
        assert_eq!(node.null_count, 0);
    }

    #[test]
    fn test_export_null_type() {
        let data = NullArray::new(5).to_data();
        let node = export_array(&data).unwrap();
        assert_eq!(node.format().unwrap().to_str().unwrap(), "n");
        assert_eq!(node.n_buffers, 1);
        assert!(node.buffer(0).is_null());
        assert_eq!(node.null_count, 5);
    }

    #[test]
    fn test_export_keeps_offset() {
        let data = Int32Array::from(vec![Some(1), None, Some(3), Some(4)])
            .to_data()
            .slice(1, 3);
        let node = export_array(&data).unwrap();
        assert_eq!(node.offset, 1);
        assert_eq!(node.length, 3);
        assert_eq!(node.null_count, 1);
    }

    #[test]
    fn test_validity_bitmap_shifted_by_whole_bytes() {
        let values: Vec<Option<i32>> = (0..20).map(|i| (i % 3 != 0).then_some(i)).collect();
        let array = Int32Array::from(values).slice(8, 10);
        let data = array.to_data();
        assert_eq!(data.offset(), 0);
        assert_eq!(data.nulls().unwrap().offset(), 8);

        let node = export_array(&data).unwrap();
        let expected = unsafe { array.nulls().unwrap().buffer().as_ptr().add(1) };
        assert_eq!(node.buffer(0) as *const u8, expected);
    }

    #[test]
    fn test_validity_bitmap_realigned() {
        let array = Int32Array::from(vec![Some(1), None, Some(3), None]).slice(1, 3);
        let data = array.to_data();
        let node = export_array(&data).unwrap();
        let bitmap = unsafe { *(node.buffer(0) as *const u8) };
        // elements: null, 3, null
        assert_eq!(bitmap & 0b111, 0b010);
        assert_ne!(
            node.buffer(0) as *const u8,
            array.nulls().unwrap().buffer().as_ptr()
        );

        let strict = BridgeConfig {
            realign_validity: false,
            ..Default::default()
        };
        let err = Exporter::new(&strict).export_array(&data).unwrap_err();
        assert!(err.is_not_implemented());
    }

    #[test]
    fn test_export_dictionary() {
        let dict: DictionaryArray<Int8Type> = vec!["a", "b", "a"].into_iter().collect();
        let field = Field::new_dict("d", dict.data_type().clone(), false, 0, true);
        let node = export_field(&field, &dict.to_data()).unwrap();

        assert_eq!(node.format().unwrap().to_str().unwrap(), "c");
        assert_eq!(node.flags, FLAG_DICTIONARY_ORDERED);
        assert_eq!(node.n_children, 0);
        let values = node.dictionary().unwrap();
        assert_eq!(values.format().unwrap().to_str().unwrap(), "u");
        assert_eq!(values.length, 2);
        assert_eq!(values.flags, FLAG_NULLABLE);
    }

    #[test]
    fn test_export_field_metadata_and_name() {
        let field = Field::new("col", DataType::Int32, false)
            .with_metadata(HashMap::from([("k".to_string(), "v".to_string())]));
        let node = export_field(&field, &Int32Array::from(vec![1]).to_data()).unwrap();
        assert_eq!(node.name().unwrap().to_str().unwrap(), "col");
        assert_eq!(node.flags, 0);
        let decoded = unsafe { metadata::decode(node.metadata) }.unwrap();
        assert_eq!(decoded, field.metadata().clone());
    }

    #[test]
    fn test_export_field_type_mismatch() {
        let field = Field::new("col", DataType::Int64, true);
        let err = export_field(&field, &Int32Array::from(vec![1]).to_data()).unwrap_err();
        assert!(err.is_invalid());
    }

    #[test]
    fn test_export_name_with_nul() {
        let field = Field::new("a\0b", DataType::Int32, true);
        let err = export_field(&field, &Int32Array::from(vec![1]).to_data()).unwrap_err();
        assert!(err.is_invalid());
    }

    #[test]
    fn test_unsupported_type() {
        let data = StringViewArray::from(vec!["a"]).to_data();
        assert!(export_array(&data).unwrap_err().is_not_implemented());
    }

    #[test]
    fn test_nesting_depth_limit() {
        let mut data = Int32Array::from(vec![1]).to_data();
        for _ in 0..3 {
            let field = Arc::new(Field::new("item", data.data_type().clone(), true));
            data = ArrayData::builder(DataType::List(field))
                .len(1)
                .add_buffer(Buffer::from_slice_ref([0i32, 1]))
                .add_child_data(data)
                .build()
                .unwrap();
        }
        let shallow = BridgeConfig {
            max_nesting_depth: 2,
            ..Default::default()
        };
        assert!(Exporter::new(&shallow).export_array(&data).unwrap_err().is_invalid());
        assert!(export_array(&data).is_ok());
    }

    fn int_struct(values: Vec<Option<i32>>, validity: Option<Vec<bool>>) -> StructArray {
        StructArray::try_new(
            vec![Field::new("a", DataType::Int32, true)].into(),
            vec![Arc::new(Int32Array::from(values)) as ArrayRef],
            validity.map(Into::into),
        )
        .unwrap()
    }

    #[test]
    fn test_sliced_struct_data_exports_at_offset_zero() {
        let source = int_struct(
            vec![Some(1), None, Some(3), Some(4)],
            Some(vec![true, true, false, true]),
        );
        let data = source.to_data().slice(1, 2);
        assert_eq!(data.offset(), 1);
        assert_eq!(data.child_data()[0].len(), 2);

        let mut node = export_array(&data).unwrap();
        assert_eq!(node.offset, 0);
        assert_eq!(node.length, 2);
        assert_eq!(node.null_count, 1);
        let child = node.child(0).unwrap();
        assert_eq!((child.offset, child.length), (1, 2));

        let imported = crate::import::import_array(&mut node).unwrap();
        let expected = int_struct(vec![None, Some(3)], Some(vec![true, false]));
        assert_eq!(imported.data, expected.to_data());
    }

    #[test]
    fn test_struct_offset_over_full_children() {
        let child = Int32Array::from(vec![1, 2, 3, 4]).to_data();
        let data = ArrayData::builder(DataType::Struct(
            vec![Field::new("a", DataType::Int32, true)].into(),
        ))
        .len(2)
        .offset(1)
        .add_child_data(child)
        .build()
        .unwrap();

        let mut node = export_array(&data).unwrap();
        assert_eq!(node.offset, 0);
        assert_eq!(node.child(0).unwrap().length, 2);

        let imported = crate::import::import_array(&mut node).unwrap();
        let expected = int_struct(vec![Some(2), Some(3)], None);
        assert_eq!(imported.data, expected.to_data());
    }
}
