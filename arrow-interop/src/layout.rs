//! Buffer and child layout of each format category.
//!
//! Both sides of the bridge agree on how many buffers and children a node of
//! a given category carries. The importer also needs the byte length of each
//! foreign buffer, which the exchange structure does not record.

use crate::format::Format;
use arrow_schema::UnionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Null,
    FixedWidth,
    FixedWidthBinary,
    VariableBinary,
    List,
    FixedSizeList,
    Struct,
    SparseUnion,
    DenseUnion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildArity {
    Exact(usize),
    /// One child per field, any number.
    Any,
}

impl ChildArity {
    pub fn accepts(self, n_children: usize) -> bool {
        match self {
            ChildArity::Exact(n) => n == n_children,
            ChildArity::Any => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Slot exists in the table but is never read.
    Unused,
    Validity,
    /// Packed values of `bits` each.
    FixedWidth { bits: usize },
    /// `offset + length + 1` integer offsets.
    Offsets { width: usize },
    /// Bytes addressed by the preceding offsets buffer.
    VariableData,
}

impl BufferKind {
    /// Byte length of a buffer covering `end` (array offset + length) slots.
    ///
    /// Returns `None` on overflow and for [`BufferKind::VariableData`], whose
    /// length is only known from the offsets.
    pub fn byte_len(self, end: usize) -> Option<usize> {
        match self {
            BufferKind::Unused | BufferKind::VariableData => None,
            BufferKind::Validity => Some(end.div_ceil(8)),
            BufferKind::FixedWidth { bits } => Some(end.checked_mul(bits)?.div_ceil(8)),
            BufferKind::Offsets { width } => end.checked_add(1)?.checked_mul(width),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub category: Category,
    pub buffers: Vec<BufferKind>,
    pub children: ChildArity,
}

impl Layout {
    pub fn of(format: &Format) -> Self {
        use BufferKind::*;

        let (category, buffers, children) = match format {
            Format::Null => (Category::Null, vec![Unused], ChildArity::Exact(0)),
            Format::Utf8 | Format::Binary => (
                Category::VariableBinary,
                vec![Validity, Offsets { width: 4 }, VariableData],
                ChildArity::Exact(0),
            ),
            Format::LargeUtf8 | Format::LargeBinary => (
                Category::VariableBinary,
                vec![Validity, Offsets { width: 8 }, VariableData],
                ChildArity::Exact(0),
            ),
            Format::FixedSizeBinary(width) => (
                Category::FixedWidthBinary,
                vec![Validity, FixedWidth { bits: *width as usize * 8 }],
                ChildArity::Exact(0),
            ),
            Format::List | Format::Map => (
                Category::List,
                vec![Validity, Offsets { width: 4 }],
                ChildArity::Exact(1),
            ),
            Format::LargeList => (
                Category::List,
                vec![Validity, Offsets { width: 8 }],
                ChildArity::Exact(1),
            ),
            Format::FixedSizeList(_) => {
                (Category::FixedSizeList, vec![Validity], ChildArity::Exact(1))
            }
            Format::Struct => (Category::Struct, vec![Validity], ChildArity::Any),
            Format::Union {
                mode: UnionMode::Sparse,
                ..
            } => (
                Category::SparseUnion,
                vec![Unused, FixedWidth { bits: 8 }, Unused],
                ChildArity::Any,
            ),
            Format::Union {
                mode: UnionMode::Dense,
                ..
            } => (
                Category::DenseUnion,
                vec![Unused, FixedWidth { bits: 8 }, FixedWidth { bits: 32 }],
                ChildArity::Any,
            ),
            primitive => (
                Category::FixedWidth,
                vec![Validity, FixedWidth { bits: primitive_bit_width(primitive) }],
                ChildArity::Exact(0),
            ),
        };
        Layout {
            category,
            buffers,
            children,
        }
    }

    pub fn n_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Whether `buffers[0]` carries a validity bitmap.
    pub fn has_validity(&self) -> bool {
        self.buffers.first() == Some(&BufferKind::Validity)
    }
}

fn primitive_bit_width(format: &Format) -> usize {
    match format {
        Format::Boolean => 1,
        Format::Int8 | Format::UInt8 => 8,
        Format::Int16 | Format::UInt16 | Format::Float16 => 16,
        Format::Int32
        | Format::UInt32
        | Format::Float32
        | Format::Date32
        | Format::Time32(_) => 32,
        Format::Decimal { bit_width, .. } => *bit_width as usize,
        _ => 64,
    }
}
