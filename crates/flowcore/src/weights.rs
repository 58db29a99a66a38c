//! Relative cost units per node type, used for progress and critical-path
//! estimation. Only ratios matter; these are not milliseconds.

use std::collections::HashMap;

pub const DEFAULT_WEIGHT: u64 = 100;

const BUILTIN_WEIGHTS: &[(&str, u64)] = &[
    ("http.request", 500),
    ("shell.exec", 400),
    ("code.eval", 300),
    ("spreadsheet.parse", 300),
    ("csv.parse", 250),
    ("file.read", 200),
    ("file.write", 200),
    ("flow.parallel", 200),
    ("time.delay", 100),
    ("transform.json_parse", 50),
    ("transform.json_stringify", 50),
    ("transform.constant", 20),
    ("debug.log", 10),
];

#[derive(Debug, Clone)]
pub struct WeightTable {
    weights: HashMap<String, u64>,
    default_weight: u64,
}

impl WeightTable {
    /// An empty table where every type weighs `DEFAULT_WEIGHT`.
    pub fn new() -> Self {
        Self {
            weights: HashMap::new(),
            default_weight: DEFAULT_WEIGHT,
        }
    }

    pub fn with_weight(mut self, node_type: impl Into<String>, weight: u64) -> Self {
        self.weights.insert(node_type.into(), weight);
        self
    }

    pub fn with_default(mut self, weight: u64) -> Self {
        self.default_weight = weight;
        self
    }

    pub fn weight_of(&self, node_type: &str) -> u64 {
        self.weights
            .get(node_type)
            .copied()
            .unwrap_or(self.default_weight)
    }
}

impl Default for WeightTable {
    fn default() -> Self {
        BUILTIN_WEIGHTS
            .iter()
            .fold(Self::new(), |table, (node_type, weight)| {
                table.with_weight(*node_type, *weight)
            })
    }
}
