//! Format descriptor codec.
//!
//! Every exchanged node carries a short string describing its physical
//! layout: single-letter primitive codes (`c`, `L`, `u`, ...), parametrised
//! codes (`w:16`, `d:15,4`) and nested prefixes (`+l`, `+s`, `+ud:1,2`).
//! [`Format`] is the parsed form. Nested descriptors say nothing about their
//! children; those come from the node's child pointers.

use arrow_schema::{DataType, TimeUnit, UnionMode};
use std::fmt;
use std::sync::Arc;

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    Null,
    Boolean,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float16,
    Float32,
    Float64,
    Utf8,
    LargeUtf8,
    Binary,
    LargeBinary,
    /// `w:<bytes>`
    FixedSizeBinary(i32),
    /// `d:<precision>,<scale>[,<bit width>]`
    Decimal {
        precision: u8,
        scale: i8,
        bit_width: u16,
    },
    Date32,
    Date64,
    Time32(TimeUnit),
    Time64(TimeUnit),
    Timestamp(TimeUnit, Option<Arc<str>>),
    Duration(TimeUnit),
    List,
    LargeList,
    /// `+w:<list size>`
    FixedSizeList(i32),
    Struct,
    Map,
    /// `+us:<codes>` / `+ud:<codes>`
    Union {
        mode: UnionMode,
        type_ids: Vec<i8>,
    },
}

impl Format {
    /// Parse a format string. Anything that is not exactly one of the known
    /// codes (trailing characters, bad parameters) is `Invalid`.
    pub fn parse(format: &str) -> Result<Self> {
        let parsed = match format {
            "n" => Format::Null,
            "b" => Format::Boolean,
            "c" => Format::Int8,
            "C" => Format::UInt8,
            "s" => Format::Int16,
            "S" => Format::UInt16,
            "i" => Format::Int32,
            "I" => Format::UInt32,
            "l" => Format::Int64,
            "L" => Format::UInt64,
            "e" => Format::Float16,
            "f" => Format::Float32,
            "g" => Format::Float64,
            "u" => Format::Utf8,
            "U" => Format::LargeUtf8,
            "z" => Format::Binary,
            "Z" => Format::LargeBinary,
            "tdD" => Format::Date32,
            "tdm" => Format::Date64,
            "tts" => Format::Time32(TimeUnit::Second),
            "ttm" => Format::Time32(TimeUnit::Millisecond),
            "ttu" => Format::Time64(TimeUnit::Microsecond),
            "ttn" => Format::Time64(TimeUnit::Nanosecond),
            "tDs" => Format::Duration(TimeUnit::Second),
            "tDm" => Format::Duration(TimeUnit::Millisecond),
            "tDu" => Format::Duration(TimeUnit::Microsecond),
            "tDn" => Format::Duration(TimeUnit::Nanosecond),
            "+l" => Format::List,
            "+L" => Format::LargeList,
            "+s" => Format::Struct,
            "+m" => Format::Map,
            other => Self::parse_parametrized(other).ok_or_else(|| {
                BridgeError::invalid(format!("invalid or unsupported format string '{format}'"))
            })?,
        };
        Ok(parsed)
    }

    fn parse_parametrized(format: &str) -> Option<Self> {
        if let Some(width) = format.strip_prefix("w:") {
            return parse_positive_i32(width).map(Format::FixedSizeBinary);
        }
        if let Some(size) = format.strip_prefix("+w:") {
            return parse_positive_i32(size).map(Format::FixedSizeList);
        }
        if let Some(params) = format.strip_prefix("d:") {
            return parse_decimal(params);
        }
        if let Some(codes) = format.strip_prefix("+us:") {
            return parse_union(UnionMode::Sparse, codes);
        }
        if let Some(codes) = format.strip_prefix("+ud:") {
            return parse_union(UnionMode::Dense, codes);
        }
        if let Some(rest) = format.strip_prefix("ts") {
            let mut chars = rest.chars();
            let unit = parse_time_unit(chars.next()?)?;
            let timezone = chars.as_str().strip_prefix(':')?;
            let timezone = (!timezone.is_empty()).then(|| Arc::from(timezone));
            return Some(Format::Timestamp(unit, timezone));
        }
        None
    }

    /// Descriptor of a logical type. Dictionary types map to their index
    /// type: the values travel in the node's dictionary pointer.
    pub fn try_from_data_type(data_type: &DataType) -> Result<Self> {
        let format = match data_type {
            DataType::Null => Format::Null,
            DataType::Boolean => Format::Boolean,
            DataType::Int8 => Format::Int8,
            DataType::UInt8 => Format::UInt8,
            DataType::Int16 => Format::Int16,
            DataType::UInt16 => Format::UInt16,
            DataType::Int32 => Format::Int32,
            DataType::UInt32 => Format::UInt32,
            DataType::Int64 => Format::Int64,
            DataType::UInt64 => Format::UInt64,
            DataType::Float16 => Format::Float16,
            DataType::Float32 => Format::Float32,
            DataType::Float64 => Format::Float64,
            DataType::Utf8 => Format::Utf8,
            DataType::LargeUtf8 => Format::LargeUtf8,
            DataType::Binary => Format::Binary,
            DataType::LargeBinary => Format::LargeBinary,
            DataType::FixedSizeBinary(width) => Format::FixedSizeBinary(*width),
            DataType::Decimal128(precision, scale) => Format::Decimal {
                precision: *precision,
                scale: *scale,
                bit_width: 128,
            },
            DataType::Decimal256(precision, scale) => Format::Decimal {
                precision: *precision,
                scale: *scale,
                bit_width: 256,
            },
            DataType::Date32 => Format::Date32,
            DataType::Date64 => Format::Date64,
            DataType::Time32(unit @ (TimeUnit::Second | TimeUnit::Millisecond)) => {
                Format::Time32(*unit)
            }
            DataType::Time64(unit @ (TimeUnit::Microsecond | TimeUnit::Nanosecond)) => {
                Format::Time64(*unit)
            }
            DataType::Timestamp(unit, timezone) => Format::Timestamp(*unit, timezone.clone()),
            DataType::Duration(unit) => Format::Duration(*unit),
            DataType::List(_) => Format::List,
            DataType::LargeList(_) => Format::LargeList,
            DataType::FixedSizeList(_, size) => Format::FixedSizeList(*size),
            DataType::Struct(_) => Format::Struct,
            DataType::Map(_, _) => Format::Map,
            DataType::Union(fields, mode) => Format::Union {
                mode: *mode,
                type_ids: fields.iter().map(|(type_id, _)| type_id).collect(),
            },
            DataType::Dictionary(key, _) => {
                let index = Self::try_from_data_type(key)?;
                if !index.is_dictionary_index() {
                    return Err(BridgeError::not_implemented(format!(
                        "dictionary index type {key} is not an integer type"
                    )));
                }
                index
            }
            other => {
                return Err(BridgeError::not_implemented(format!(
                    "exporting arrays of type {other} is not supported"
                )))
            }
        };
        Ok(format)
    }

    /// Logical type of a descriptor without children, `None` for nested ones.
    pub fn primitive_data_type(&self) -> Option<DataType> {
        let data_type = match self {
            Format::Null => DataType::Null,
            Format::Boolean => DataType::Boolean,
            Format::Int8 => DataType::Int8,
            Format::UInt8 => DataType::UInt8,
            Format::Int16 => DataType::Int16,
            Format::UInt16 => DataType::UInt16,
            Format::Int32 => DataType::Int32,
            Format::UInt32 => DataType::UInt32,
            Format::Int64 => DataType::Int64,
            Format::UInt64 => DataType::UInt64,
            Format::Float16 => DataType::Float16,
            Format::Float32 => DataType::Float32,
            Format::Float64 => DataType::Float64,
            Format::Utf8 => DataType::Utf8,
            Format::LargeUtf8 => DataType::LargeUtf8,
            Format::Binary => DataType::Binary,
            Format::LargeBinary => DataType::LargeBinary,
            Format::FixedSizeBinary(width) => DataType::FixedSizeBinary(*width),
            Format::Decimal {
                precision,
                scale,
                bit_width: 128,
            } => DataType::Decimal128(*precision, *scale),
            Format::Decimal {
                precision, scale, ..
            } => DataType::Decimal256(*precision, *scale),
            Format::Date32 => DataType::Date32,
            Format::Date64 => DataType::Date64,
            Format::Time32(unit) => DataType::Time32(*unit),
            Format::Time64(unit) => DataType::Time64(*unit),
            Format::Timestamp(unit, timezone) => DataType::Timestamp(*unit, timezone.clone()),
            Format::Duration(unit) => DataType::Duration(*unit),
            Format::List
            | Format::LargeList
            | Format::FixedSizeList(_)
            | Format::Struct
            | Format::Map
            | Format::Union { .. } => return None,
        };
        Some(data_type)
    }

    /// Integer types are the only valid dictionary indices.
    pub fn is_dictionary_index(&self) -> bool {
        matches!(
            self,
            Format::Int8
                | Format::UInt8
                | Format::Int16
                | Format::UInt16
                | Format::Int32
                | Format::UInt32
                | Format::Int64
                | Format::UInt64
        )
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Format::Null => "n",
            Format::Boolean => "b",
            Format::Int8 => "c",
            Format::UInt8 => "C",
            Format::Int16 => "s",
            Format::UInt16 => "S",
            Format::Int32 => "i",
            Format::UInt32 => "I",
            Format::Int64 => "l",
            Format::UInt64 => "L",
            Format::Float16 => "e",
            Format::Float32 => "f",
            Format::Float64 => "g",
            Format::Utf8 => "u",
            Format::LargeUtf8 => "U",
            Format::Binary => "z",
            Format::LargeBinary => "Z",
            Format::FixedSizeBinary(width) => return write!(f, "w:{width}"),
            Format::Decimal {
                precision,
                scale,
                bit_width: 128,
            } => return write!(f, "d:{precision},{scale}"),
            Format::Decimal {
                precision,
                scale,
                bit_width,
            } => return write!(f, "d:{precision},{scale},{bit_width}"),
            Format::Date32 => "tdD",
            Format::Date64 => "tdm",
            Format::Time32(TimeUnit::Second) => "tts",
            Format::Time32(_) => "ttm",
            Format::Time64(TimeUnit::Microsecond) => "ttu",
            Format::Time64(_) => "ttn",
            Format::Timestamp(unit, timezone) => {
                return write!(
                    f,
                    "ts{}:{}",
                    time_unit_code(*unit),
                    timezone.as_deref().unwrap_or("")
                )
            }
            Format::Duration(unit) => return write!(f, "tD{}", time_unit_code(*unit)),
            Format::List => "+l",
            Format::LargeList => "+L",
            Format::FixedSizeList(size) => return write!(f, "+w:{size}"),
            Format::Struct => "+s",
            Format::Map => "+m",
            Format::Union { mode, type_ids } => {
                let prefix = match mode {
                    UnionMode::Sparse => "+us:",
                    UnionMode::Dense => "+ud:",
                };
                f.write_str(prefix)?;
                for (i, type_id) in type_ids.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{type_id}")?;
                }
                return Ok(());
            }
        };
        f.write_str(code)
    }
}

fn time_unit_code(unit: TimeUnit) -> char {
    match unit {
        TimeUnit::Second => 's',
        TimeUnit::Millisecond => 'm',
        TimeUnit::Microsecond => 'u',
        TimeUnit::Nanosecond => 'n',
    }
}

fn parse_time_unit(code: char) -> Option<TimeUnit> {
    match code {
        's' => Some(TimeUnit::Second),
        'm' => Some(TimeUnit::Millisecond),
        'u' => Some(TimeUnit::Microsecond),
        'n' => Some(TimeUnit::Nanosecond),
        _ => None,
    }
}

/// Plain decimal digits only: no sign, no whitespace, no separators.
fn parse_digits<T: std::str::FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_positive_i32(s: &str) -> Option<i32> {
    parse_digits::<i32>(s).filter(|v| *v > 0)
}

fn parse_decimal(params: &str) -> Option<Format> {
    let parts: Vec<&str> = params.split(',').collect();
    let (precision, scale, bit_width) = match parts.as_slice() {
        [precision, scale] => (*precision, *scale, 128),
        [precision, scale, bit_width] => (*precision, *scale, parse_digits::<u16>(bit_width)?),
        _ => return None,
    };
    let precision = parse_digits::<u8>(precision)?;
    let scale = match scale.strip_prefix('-') {
        Some(magnitude) => -parse_digits::<i8>(magnitude)?,
        None => parse_digits::<i8>(scale)?,
    };
    let max_precision = match bit_width {
        128 => 38,
        256 => 76,
        _ => return None,
    };
    if precision == 0 || precision > max_precision || i16::from(scale) > i16::from(precision) {
        return None;
    }
    Some(Format::Decimal {
        precision,
        scale,
        bit_width,
    })
}

fn parse_union(mode: UnionMode, codes: &str) -> Option<Format> {
    let mut type_ids: Vec<i8> = Vec::new();
    if !codes.is_empty() {
        for code in codes.split(',') {
            let type_id = parse_digits::<i8>(code)?;
            if type_ids.contains(&type_id) {
                return None;
            }
            type_ids.push(type_id);
        }
    }
    Some(Format::Union { mode, type_ids })
}
