use thiserror::Error;

/// Errors raised while exporting or importing arrays.
///
/// None of these are transient: they describe the shape of the input, so
/// retrying the same operation yields the same error.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The exchange structure (or the array being exported) is malformed:
    /// bad format string, wrong buffer or child count, inconsistent null count,
    /// misplaced dictionary, released input, or data that fails Arrow
    /// validation once imported.
    #[error("Invalid: {0}")]
    Invalid(String),

    /// The logical type has no representation in the exchange format.
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl BridgeError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        BridgeError::Invalid(msg.into())
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        BridgeError::NotImplemented(msg.into())
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, BridgeError::Invalid(_))
    }

    pub fn is_not_implemented(&self) -> bool {
        matches!(self, BridgeError::NotImplemented(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let invalid = BridgeError::invalid("bad format 'cc'");
        assert!(invalid.is_invalid());
        assert!(!invalid.is_not_implemented());
        assert_eq!(invalid.to_string(), "Invalid: bad format 'cc'");

        let unsupported = BridgeError::not_implemented("Utf8View");
        assert!(unsupported.is_not_implemented());
        assert!(!unsupported.is_invalid());
        assert_eq!(unsupported.to_string(), "Not implemented: Utf8View");
    }
}
