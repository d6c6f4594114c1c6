//! Importer: exchange node tree to Arrow array data.
//!
//! Imported buffers alias the producer's memory. Each one holds a reference
//! to the top-level node, so the producer's release callback fires once the
//! last buffer, slice or clone derived from the import goes away.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use arrow_array::{make_array, ArrayRef};
use arrow_buffer::alloc::Allocation;
use arrow_buffer::{BooleanBuffer, Buffer, MutableBuffer, NullBuffer};
use arrow_data::ArrayData;
use arrow_schema::{DataType, Field, UnionFields, UnionMode};
use tracing::{debug, trace};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::ffi::FFI_ArrowArray;
use crate::format::Format;
use crate::layout::{BufferKind, Category, Layout};
use crate::metadata;
use crate::schema_utils::{FieldExt, FLAG_MAP_KEYS_SORTED};

/// An imported array with the field its top-level node described.
#[derive(Debug, Clone)]
pub struct ImportedArray {
    pub field: Field,
    pub data: ArrayData,
}

impl ImportedArray {
    pub fn into_array(self) -> ArrayRef {
        make_array(self.data)
    }
}

/// Scalar fields of a node, checked and converted.
#[derive(Debug, Clone, Copy)]
struct NodeExtent {
    length: usize,
    offset: usize,
    /// `offset + length`
    end: usize,
    /// `None` when the producer did not compute it.
    null_count: Option<usize>,
}

impl NodeExtent {
    fn of(node: &FFI_ArrowArray) -> Result<Self> {
        let length = usize::try_from(node.length)
            .map_err(|_| BridgeError::invalid(format!("negative length {}", node.length)))?;
        let offset = usize::try_from(node.offset)
            .map_err(|_| BridgeError::invalid(format!("negative offset {}", node.offset)))?;
        let end = length
            .checked_add(offset)
            .ok_or_else(|| BridgeError::invalid("offset + length overflows"))?;
        let null_count = match node.null_count {
            -1 => None,
            n if (0..=node.length).contains(&n) => Some(n as usize),
            n => {
                return Err(BridgeError::invalid(format!(
                    "null count {n} out of range for length {length}"
                )))
            }
        };
        Ok(Self {
            length,
            offset,
            end,
            null_count,
        })
    }
}

pub(crate) struct Importer<'a> {
    config: &'a BridgeConfig,
}

impl<'a> Importer<'a> {
    pub fn new(config: &'a BridgeConfig) -> Self {
        Self { config }
    }

    /// Import the node in `array`, leaving the slot Released.
    ///
    /// The node is consumed even on error: it is released before the error
    /// is returned.
    pub fn import_array(&self, array: &mut FFI_ArrowArray) -> Result<ImportedArray> {
        let node = array.take();
        if node.is_released() {
            return Err(BridgeError::invalid("cannot import a released array"));
        }
        let owner = Arc::new(node);
        let (field, data) = self.import_node(&owner, &owner, 0).inspect_err(|e| {
            debug!("Import failed, releasing input: {}", e);
        })?;
        Ok(ImportedArray { field, data })
    }

    /// Import and check the result against the type the caller expects.
    pub fn import_array_with_type(
        &self,
        array: &mut FFI_ArrowArray,
        expected: &DataType,
    ) -> Result<ImportedArray> {
        let imported = self.import_array(array)?;
        if imported.data.data_type() != expected {
            return Err(BridgeError::invalid(format!(
                "imported array has type {}, expected {}",
                imported.data.data_type(),
                expected
            )));
        }
        Ok(imported)
    }

    fn import_node(
        &self,
        node: &FFI_ArrowArray,
        owner: &Arc<FFI_ArrowArray>,
        depth: usize,
    ) -> Result<(Field, ArrayData)> {
        if depth > self.config.max_nesting_depth {
            return Err(BridgeError::invalid(format!(
                "type nesting exceeds the maximum depth of {}",
                self.config.max_nesting_depth
            )));
        }
        if node.is_released() {
            return Err(BridgeError::invalid(format!(
                "array node at depth {depth} is released"
            )));
        }

        let format = node
            .format()
            .and_then(|f| f.to_str().ok())
            .ok_or_else(|| BridgeError::invalid("format string is not valid UTF-8"))?;
        let format = Format::parse(format)?;
        let name = match node.name() {
            Some(name) => name
                .to_str()
                .map_err(|_| BridgeError::invalid("array name is not valid UTF-8"))?,
            None => "",
        };
        // SAFETY: a Live node's metadata is null or a block in the documented layout.
        let metadata = unsafe { metadata::decode(node.metadata) }?;
        let extent = NodeExtent::of(node)?;

        let layout = Layout::of(&format);
        if node.n_buffers != layout.n_buffers() as i64 {
            return Err(BridgeError::invalid(format!(
                "format '{format}' expects {} buffers, got {}",
                layout.n_buffers(),
                node.n_buffers
            )));
        }
        if node.n_children < 0 || !layout.children.accepts(node.n_children()) {
            return Err(BridgeError::invalid(format!(
                "format '{format}' does not allow {} children",
                node.n_children
            )));
        }
        if let Format::Union { type_ids, .. } = &format {
            if type_ids.len() != node.n_children() {
                return Err(BridgeError::invalid(format!(
                    "union '{format}' lists {} type codes for {} children",
                    type_ids.len(),
                    node.n_children
                )));
            }
        }
        if !node.dictionary.is_null() && !format.is_dictionary_index() {
            return Err(BridgeError::invalid(format!(
                "dictionary present on a node of format '{format}', which is not an integer index"
            )));
        }

        let children = (0..node.n_children())
            .map(|i| {
                let child = node
                    .child(i)
                    .ok_or_else(|| BridgeError::invalid(format!("child {i} is a null pointer")))?;
                self.import_node(child, owner, depth + 1)
            })
            .collect::<Result<Vec<_>>>()?;
        let dictionary = node
            .dictionary()
            .map(|values| self.import_node(values, owner, depth + 1))
            .transpose()?;

        let data_type = logical_type(&format, &children, dictionary.as_ref(), node.flags)?;
        let child_data = children.into_iter().map(|(_, data)| data).collect();
        let values = dictionary.map(|(_, data)| data);
        let data = self.build_data(node, &layout, extent, data_type, child_data, values, owner)?;

        debug!(
            "Imported node '{}' format={} length={} offset={} null_count={}",
            name,
            format,
            extent.length,
            extent.offset,
            data.null_count()
        );
        let field = Field::from_node(name, data.data_type().clone(), node.flags, metadata);
        Ok((field, data))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_data(
        &self,
        node: &FFI_ArrowArray,
        layout: &Layout,
        extent: NodeExtent,
        data_type: DataType,
        mut child_data: Vec<ArrayData>,
        dictionary_values: Option<ArrayData>,
        owner: &Arc<FFI_ArrowArray>,
    ) -> Result<ArrayData> {
        if layout.category == Category::Null {
            return self.finish(ArrayData::builder(DataType::Null).len(extent.length));
        }

        let nulls = if layout.has_validity() {
            self.import_validity(node, extent, owner)?
        } else {
            if extent.null_count.is_some_and(|n| n > 0) {
                return Err(BridgeError::invalid(format!(
                    "null count {} on a union, which has no validity bitmap",
                    node.null_count
                )));
            }
            None
        };

        let mut buffers = Vec::with_capacity(layout.n_buffers());
        let mut offset_width = 0;
        for (index, kind) in layout.buffers.iter().enumerate().skip(1) {
            let len = match kind {
                BufferKind::Unused => continue,
                BufferKind::VariableData => match buffers.last() {
                    Some(offsets) => last_offset(offsets, offset_width, extent.end)?,
                    None => 0,
                },
                BufferKind::Offsets { width } => {
                    offset_width = *width;
                    overflow_checked(kind.byte_len(extent.end))?
                }
                _ => overflow_checked(kind.byte_len(extent.end))?,
            };
            buffers.push(self.foreign_buffer(node.buffer(index), len, extent.end, index, owner)?);
        }

        // Unions and structs are rebased to offset 0 so the arrays built
        // from them need not apply the offset to their children.
        let mut offset = extent.offset;
        match layout.category {
            Category::Struct | Category::SparseUnion => {
                child_data = slice_children(child_data, extent)?;
                if layout.category == Category::SparseUnion {
                    buffers[0] = buffers[0].slice(extent.offset);
                }
                offset = 0;
            }
            Category::DenseUnion => {
                buffers[0] = buffers[0].slice(extent.offset);
                buffers[1] = buffers[1].slice(extent.offset * 4);
                offset = 0;
            }
            _ => {}
        }
        child_data.extend(dictionary_values);

        let builder = ArrayData::builder(data_type)
            .len(extent.length)
            .offset(offset)
            .nulls(nulls)
            .buffers(buffers)
            .child_data(child_data);
        self.finish(builder)
    }

    fn finish(&self, builder: arrow_data::ArrayDataBuilder) -> Result<ArrayData> {
        let validated = if self.config.full_validation {
            builder.build()
        } else {
            // SAFETY: structural validation runs immediately below.
            let data = unsafe { builder.build_unchecked() };
            data.validate().and_then(|_| data.validate_nulls()).map(|_| data)
        };
        validated.map_err(|e| BridgeError::invalid(format!("imported array is malformed: {e}")))
    }

    fn import_validity(
        &self,
        node: &FFI_ArrowArray,
        extent: NodeExtent,
        owner: &Arc<FFI_ArrowArray>,
    ) -> Result<Option<NullBuffer>> {
        let ptr = node.buffer(0);
        match extent.null_count {
            Some(0) => return Ok(None),
            Some(n) if ptr.is_null() => {
                return Err(BridgeError::invalid(format!(
                    "null count {n} but no validity bitmap"
                )))
            }
            None if ptr.is_null() => return Ok(None),
            _ => {}
        }

        let len = overflow_checked(BufferKind::Validity.byte_len(extent.end))?;
        let bitmap = self.foreign_buffer(ptr, len, extent.end, 0, owner)?;
        let nulls = NullBuffer::new(BooleanBuffer::new(bitmap, extent.offset, extent.length));
        if let Some(declared) = extent.null_count {
            if nulls.null_count() != declared {
                return Err(BridgeError::invalid(format!(
                    "declared null count {declared} but the validity bitmap has {} nulls",
                    nulls.null_count()
                )));
            }
        }
        Ok(Some(nulls).filter(|n| n.null_count() > 0))
    }

    /// Wrap `len` bytes at `ptr` without copying. The buffer keeps `owner`
    /// alive.
    fn foreign_buffer(
        &self,
        ptr: *const c_void,
        len: usize,
        end: usize,
        index: usize,
        owner: &Arc<FFI_ArrowArray>,
    ) -> Result<Buffer> {
        let Some(ptr) = NonNull::new(ptr as *mut u8) else {
            if len == 0 || end == 0 {
                return Ok(MutableBuffer::new(0).into());
            }
            return Err(BridgeError::invalid(format!(
                "buffer {index} is null but {len} bytes are required"
            )));
        };
        if len == 0 {
            return Ok(MutableBuffer::new(0).into());
        }
        trace!("Wrapping foreign buffer {} ({} bytes at {:p})", index, len, ptr);
        let allocation: Arc<dyn Allocation> = owner.clone();
        // SAFETY: the producer guarantees `len` readable bytes at `ptr` until
        // the top-level node is released, which `allocation` defers.
        Ok(unsafe { Buffer::from_custom_allocation(ptr, len, allocation) })
    }
}

fn overflow_checked(len: Option<usize>) -> Result<usize> {
    len.ok_or_else(|| BridgeError::invalid("buffer length overflows"))
}

/// Value of the offset at slot `end`, i.e. the byte length of the data buffer.
fn last_offset(offsets: &Buffer, width: usize, end: usize) -> Result<usize> {
    if offsets.is_empty() {
        return Ok(0);
    }
    let start = end * width;
    let bytes = offsets
        .as_slice()
        .get(start..start + width)
        .ok_or_else(|| BridgeError::invalid("offsets buffer is too short"))?;
    let value = match width {
        4 => i32::from_ne_bytes(bytes.try_into().map_err(|_| bad_offset_width(width))?) as i64,
        8 => i64::from_ne_bytes(bytes.try_into().map_err(|_| bad_offset_width(width))?),
        _ => return Err(bad_offset_width(width)),
    };
    usize::try_from(value).map_err(|_| BridgeError::invalid(format!("negative offset {value}")))
}

fn bad_offset_width(width: usize) -> BridgeError {
    BridgeError::invalid(format!("unsupported offset width {width}"))
}

fn slice_children(children: Vec<ArrayData>, extent: NodeExtent) -> Result<Vec<ArrayData>> {
    children
        .into_iter()
        .enumerate()
        .map(|(i, child)| {
            if child.len() < extent.end {
                return Err(BridgeError::invalid(format!(
                    "child {i} has {} elements, parent needs {}",
                    child.len(),
                    extent.end
                )));
            }
            if extent.offset == 0 && child.len() == extent.length {
                return Ok(child);
            }
            slice_data(&child, extent.offset, extent.length)
        })
        .collect()
}

/// Slice imported data to `offset..offset + len`.
///
/// Structs and unions are rebuilt at offset 0 with their children sliced,
/// matching how imported nodes of those types are laid out.
fn slice_data(data: &ArrayData, offset: usize, len: usize) -> Result<ArrayData> {
    let (buffers, children) = match data.data_type() {
        DataType::Struct(_) => (
            data.buffers().to_vec(),
            slice_all(data.child_data(), offset, len)?,
        ),
        DataType::Union(_, UnionMode::Sparse) => (
            vec![data.buffers()[0].slice(offset)],
            slice_all(data.child_data(), offset, len)?,
        ),
        DataType::Union(_, UnionMode::Dense) => (
            vec![
                data.buffers()[0].slice(offset),
                data.buffers()[1].slice(offset * 4),
            ],
            data.child_data().to_vec(),
        ),
        _ => return Ok(data.slice(offset, len)),
    };
    data.clone()
        .into_builder()
        .len(len)
        .offset(0)
        .nulls(data.nulls().map(|n| n.slice(offset, len)))
        .buffers(buffers)
        .child_data(children)
        .build()
        .map_err(|e| BridgeError::invalid(format!("slicing imported child failed: {e}")))
}

fn slice_all(children: &[ArrayData], offset: usize, len: usize) -> Result<Vec<ArrayData>> {
    children
        .iter()
        .map(|child| slice_data(child, offset, len))
        .collect()
}

fn logical_type(
    format: &Format,
    children: &[(Field, ArrayData)],
    dictionary: Option<&(Field, ArrayData)>,
    flags: i64,
) -> Result<DataType> {
    let child_field = |i: usize| Arc::new(children[i].0.clone());
    let data_type = match format {
        Format::List => DataType::List(child_field(0)),
        Format::LargeList => DataType::LargeList(child_field(0)),
        Format::FixedSizeList(size) => DataType::FixedSizeList(child_field(0), *size),
        Format::Struct => DataType::Struct(children.iter().map(|(f, _)| f.clone()).collect()),
        Format::Map => {
            let entries = &children[0].0;
            if !matches!(entries.data_type(), DataType::Struct(fields) if fields.len() == 2) {
                return Err(BridgeError::invalid(format!(
                    "map entries must be a struct of two fields, got {}",
                    entries.data_type()
                )));
            }
            DataType::Map(child_field(0), flags & FLAG_MAP_KEYS_SORTED != 0)
        }
        Format::Union { mode, type_ids } => DataType::Union(
            UnionFields::new(
                type_ids.iter().copied(),
                children.iter().map(|(f, _)| f.clone()),
            ),
            *mode,
        ),
        leaf => leaf.primitive_data_type().ok_or_else(|| {
            BridgeError::invalid(format!("format '{leaf}' has no logical type"))
        })?,
    };

    Ok(match dictionary {
        Some((_, values)) => {
            DataType::Dictionary(Box::new(data_type), Box::new(values.data_type().clone()))
        }
        None => data_type,
    })
}

/// Import the node in `array` using the default configuration.
pub fn import_array(array: &mut FFI_ArrowArray) -> Result<ImportedArray> {
    Importer::new(&BridgeConfig::default()).import_array(array)
}

/// Import the node in `array` and require its type to be `expected`.
pub fn import_array_with_type(
    array: &mut FFI_ArrowArray,
    expected: &DataType,
) -> Result<ImportedArray> {
    Importer::new(&BridgeConfig::default()).import_array_with_type(array, expected)
}

/// Import the node behind a raw pointer handed over by C code.
///
/// # Safety
///
/// `array` must be null or point at a valid node; on return it is Released.
pub unsafe fn import_array_from_raw(array: *mut FFI_ArrowArray) -> Result<ImportedArray> {
    match array.as_mut() {
        Some(array) => import_array(array),
        None => Err(BridgeError::invalid("null array pointer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::export_array;
    use arrow_array::types::Int16Type;
    use arrow_array::{Array, DictionaryArray, Int32Array, StringArray};

    #[test]
    fn test_round_trip_primitive() {
        let array = Int32Array::from(vec![Some(1), None, Some(3)]);
        let mut node = export_array(&array.to_data()).unwrap();
        let imported = import_array(&mut node).unwrap();
        assert!(node.is_released());
        assert_eq!(imported.field.name(), "");
        assert!(imported.field.is_nullable());
        assert_eq!(imported.data.data_type(), &DataType::Int32);
        assert_eq!(Int32Array::from(imported.data), array);
    }

    #[test]
    fn test_round_trip_keeps_offset() {
        let data = StringArray::from(vec![Some("a"), None, Some("ccc"), Some("dd")])
            .to_data()
            .slice(1, 3);
        let mut node = export_array(&data).unwrap();
        let imported = import_array(&mut node).unwrap();
        assert_eq!(imported.data.offset(), 1);
        assert_eq!(
            StringArray::from(imported.data),
            StringArray::from(vec![None, Some("ccc"), Some("dd")])
        );
    }

    #[test]
    fn test_round_trip_dictionary() {
        let dict: DictionaryArray<Int16Type> = vec!["x", "y", "x", "z"].into_iter().collect();
        let mut node = export_array(&dict.to_data()).unwrap();
        let imported = import_array(&mut node).unwrap();
        assert_eq!(imported.data.data_type(), dict.data_type());
        assert_eq!(imported.field.dict_is_ordered(), Some(false));
        assert_eq!(DictionaryArray::<Int16Type>::from(imported.data), dict);
    }

    #[test]
    fn test_released_input_rejected() {
        let mut node = FFI_ArrowArray::empty();
        assert!(import_array(&mut node).unwrap_err().is_invalid());
    }

    #[test]
    fn test_wrong_buffer_count_releases_input() {
        let mut node = export_array(&Int32Array::from(vec![1, 2]).to_data()).unwrap();
        node.n_buffers = 3;
        let err = import_array(&mut node).unwrap_err();
        assert!(err.is_invalid());
        assert!(node.is_released());
    }

    #[test]
    fn test_inconsistent_null_count() {
        for null_count in [2, 5, -2] {
            let mut node =
                export_array(&Int32Array::from(vec![Some(1), None, Some(3)]).to_data()).unwrap();
            node.null_count = null_count;
            assert!(import_array(&mut node).unwrap_err().is_invalid(), "{null_count}");
        }
    }

    #[test]
    fn test_unknown_null_count_is_computed() {
        let mut node =
            export_array(&Int32Array::from(vec![Some(1), None, None]).to_data()).unwrap();
        node.null_count = -1;
        let imported = import_array(&mut node).unwrap();
        assert_eq!(imported.data.null_count(), 2);
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut node = export_array(&Int32Array::from(vec![1]).to_data()).unwrap();
        node.length = -1;
        assert!(import_array(&mut node).unwrap_err().is_invalid());
    }

    #[test]
    fn test_dictionary_on_non_integer_rejected() {
        let mut values = export_array(&StringArray::from(vec!["a"]).to_data()).unwrap();
        let mut node = export_array(&StringArray::from(vec!["b"]).to_data()).unwrap();
        node.dictionary = &mut values;
        assert!(import_array(&mut node).unwrap_err().is_invalid());
        // the exported capsule never owned `values`
        assert!(!values.is_released());
    }

    #[test]
    fn test_expected_type_mismatch() {
        let mut node = export_array(&Int32Array::from(vec![1]).to_data()).unwrap();
        let err = import_array_with_type(&mut node, &DataType::Int64).unwrap_err();
        assert!(err.is_invalid());
        assert!(node.is_released());

        let mut node = export_array(&Int32Array::from(vec![1]).to_data()).unwrap();
        assert!(import_array_with_type(&mut node, &DataType::Int32).is_ok());
    }

    #[test]
    fn test_null_raw_pointer() {
        let err = unsafe { import_array_from_raw(std::ptr::null_mut()) }.unwrap_err();
        assert!(err.is_invalid());
    }

    #[test]
    fn test_import_depth_limit() {
        let item = Arc::new(Field::new("item", DataType::Int32, true));
        let list = ArrayData::builder(DataType::List(item))
            .len(1)
            .add_buffer(Buffer::from_slice_ref([0i32, 2]))
            .add_child_data(Int32Array::from(vec![1, 2]).to_data())
            .build()
            .unwrap();
        let mut node = export_array(&list).unwrap();
        let flat = BridgeConfig {
            max_nesting_depth: 0,
            ..Default::default()
        };
        assert!(Importer::new(&flat).import_array(&mut node).unwrap_err().is_invalid());
        assert!(node.is_released());
    }
}
