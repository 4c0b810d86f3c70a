//! The physical graph data model.
//!
//! A physical graph is an ordered list of [`DropSpec`]s, each describing one
//! drop (a unit of data or computation) together with the oids of the drops
//! it consumes and produces. Graph files on disk are bare JSON arrays of
//! drops; the pipeline name is derived from the file name.

use std::{
    collections::{HashMap, HashSet},
    fs,
    io,
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::errors::ClusterError;

// Public submodules
pub mod assembler;
pub mod modifiers;
pub mod partition;

// Public exports
pub use assembler::{assemble, derive_graph, map_resources};
pub use modifiers::{apply_pipeline, parse_pipeline, ModifierSpec};
pub use partition::{partitioner_for, AlgoParams, GraphPartitioner};

/// One drop of a physical graph.
///
/// Only the fields the orchestration logic reads are typed; everything else a
/// graph file carries is preserved verbatim in `extra` and round-trips
/// untouched through load, partitioning and resource mapping.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DropSpec {
    /// Unique object id within the graph.
    pub oid: String,
    #[serde(default)]
    pub name: String,
    /// Drop category, e.g. `"app"` or `"data"`.
    #[serde(default)]
    pub app_type: String,
    /// Command executed by application drops; may be empty.
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    /// Node manager host, or a `#<index>` partition tag before mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Island manager host, or a `#<index>` partition tag before mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub island: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl DropSpec {
    /// A minimal drop with the given oid; used when expanding graphs.
    pub fn new(oid: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            name: String::new(),
            app_type: String::new(),
            command: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            node: None,
            island: None,
            extra: HashMap::new(),
        }
    }
}

/// An ordered physical graph with the pipeline name it was derived under.
#[derive(Clone, Debug)]
pub struct PhysicalGraph {
    pub pipeline_name: String,
    pub drops: Vec<DropSpec>,
}

impl PhysicalGraph {
    /// Loads a graph from a JSON file holding a bare array of drops.
    pub fn load(path: &Path) -> Result<Self, ClusterError> {
        let contents = fs::read_to_string(path)?;
        let drops: Vec<DropSpec> = serde_json::from_str(&contents).map_err(|e| {
            ClusterError::Configuration(format!(
                "cannot parse graph file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self {
            pipeline_name: pipeline_name_from(path),
            drops,
        })
    }

    /// Writes the graph to `path` as a bare JSON array of drops.
    pub fn save(&self, path: &Path) -> Result<(), ClusterError> {
        let contents = serde_json::to_vec(&self.drops)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Checks that oids are unique and every input/output reference resolves
    /// to a drop in this graph.
    pub fn validate(&self) -> Result<(), ClusterError> {
        let mut oids = HashSet::with_capacity(self.drops.len());
        for drop in &self.drops {
            if !oids.insert(drop.oid.as_str()) {
                return Err(ClusterError::Configuration(format!(
                    "duplicate drop oid '{}' in pipeline '{}'",
                    drop.oid, self.pipeline_name
                )));
            }
        }
        for drop in &self.drops {
            for reference in drop.inputs.iter().chain(drop.outputs.iter()) {
                if !oids.contains(reference.as_str()) {
                    return Err(ClusterError::Configuration(format!(
                        "drop '{}' references unknown oid '{}' in pipeline '{}'",
                        drop.oid, reference, self.pipeline_name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The pipeline name implied by a graph file path (its file stem).
pub fn pipeline_name_from(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "graph".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked_pair() -> Vec<DropSpec> {
        let mut producer = DropSpec::new("a");
        producer.app_type = "app".to_string();
        producer.outputs.push("b".to_string());
        let mut consumer = DropSpec::new("b");
        consumer.app_type = "data".to_string();
        consumer.inputs.push("a".to_string());
        vec![producer, consumer]
    }

    #[test]
    fn test_validate_accepts_closed_graph() {
        let graph = PhysicalGraph {
            pipeline_name: "test".to_string(),
            drops: linked_pair(),
        };
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_oids() {
        let graph = PhysicalGraph {
            pipeline_name: "test".to_string(),
            drops: vec![DropSpec::new("a"), DropSpec::new("a")],
        };
        let message = format!("{}", graph.validate().unwrap_err());
        assert!(message.contains("duplicate drop oid 'a'"), "{}", message);
    }

    #[test]
    fn test_validate_rejects_dangling_references() {
        let mut orphan = DropSpec::new("a");
        orphan.inputs.push("missing".to_string());
        let graph = PhysicalGraph {
            pipeline_name: "test".to_string(),
            drops: vec![orphan],
        };
        let message = format!("{}", graph.validate().unwrap_err());
        assert!(message.contains("unknown oid 'missing'"), "{}", message);
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let raw = serde_json::json!({
            "oid": "a",
            "app_type": "data",
            "data_volume": 1024,
            "group": "scatter_0"
        });
        let drop: DropSpec = serde_json::from_value(raw).unwrap();
        assert_eq!(drop.extra["data_volume"], serde_json::json!(1024));

        let back = serde_json::to_value(&drop).unwrap();
        assert_eq!(back["data_volume"], serde_json::json!(1024));
        assert_eq!(back["group"], serde_json::json!("scatter_0"));
        // Untouched optional fields stay out of the serialized form.
        assert!(back.get("node").is_none());
    }

    #[test]
    fn test_pipeline_name_from_file_stem() {
        assert_eq!(pipeline_name_from(Path::new("/tmp/lofar_std.json")), "lofar_std");
        assert_eq!(pipeline_name_from(Path::new("pg.json")), "pg");
    }
}
