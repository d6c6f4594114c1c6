/// Knobs shared by the exporter and the importer.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Maximum depth of the type tree walked on export or import.
    pub max_nesting_depth: usize,
    /// Re-materialise a validity bitmap whose bit offset does not line up with
    /// the array offset. When disabled such arrays fail to export.
    pub realign_validity: bool,
    /// Run full Arrow validation (offsets, UTF-8, dictionary keys) on
    /// imported data instead of the structural checks only.
    pub full_validation: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: 64,
            realign_validity: true,
            full_validation: true,
        }
    }
}
