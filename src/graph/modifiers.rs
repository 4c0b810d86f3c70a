//! Named graph modifiers applied between assembly and submission.
//!
//! A modifier pipeline is given on the command line as colon-separated
//! specs, each of the form `name[,arg][,key=val]...`. All names are resolved
//! against the registry before any modifier runs, so a typo in the last spec
//! cannot leave the graph half-modified.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::{errors::ClusterError, graph::PhysicalGraph};

/// A graph transformation: consumes the graph, positional arguments and
/// `key=val` parameters, and produces the modified graph.
pub type ModifierFn =
    fn(PhysicalGraph, &[String], &HashMap<String, String>) -> Result<PhysicalGraph, ClusterError>;

static REGISTRY: Lazy<HashMap<&'static str, ModifierFn>> = Lazy::new(|| {
    let mut registry: HashMap<&'static str, ModifierFn> = HashMap::new();
    registry.insert("noop", noop);
    registry.insert("zerorun", zerorun);
    registry.insert("prefix_oids", prefix_oids);
    registry
});

/// One parsed modifier spec, with its function already resolved.
#[derive(Clone, Debug)]
pub struct ModifierSpec {
    name: String,
    args: Vec<String>,
    params: HashMap<String, String>,
    func: ModifierFn,
}

impl ModifierSpec {
    /// Parses `name[,arg][,key=val]...`; unknown names fail here.
    pub fn parse(spec: &str) -> Result<Self, ClusterError> {
        let mut parts = spec.split(',').map(str::trim);
        let name = match parts.next() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                return Err(ClusterError::Configuration(format!(
                    "empty graph modifier name in '{}'",
                    spec
                )))
            }
        };
        let func = *REGISTRY.get(name.as_str()).ok_or_else(|| {
            ClusterError::Configuration(format!("unknown graph modifier '{}'", name))
        })?;

        let mut args = Vec::new();
        let mut params = HashMap::new();
        for part in parts {
            if let Some(idx) = part.find('=') {
                let key = &part[..idx];
                if key.is_empty() {
                    return Err(ClusterError::Configuration(format!(
                        "malformed parameter '{}' for graph modifier '{}'",
                        part, name
                    )));
                }
                params.insert(key.to_string(), part[idx + 1..].to_string());
            } else {
                args.push(part.to_string());
            }
        }
        Ok(Self {
            name,
            args,
            params,
            func,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, graph: PhysicalGraph) -> Result<PhysicalGraph, ClusterError> {
        (self.func)(graph, &self.args, &self.params)
    }
}

/// Parses a colon-separated modifier pipeline; empty segments are ignored.
/// Every name is resolved before this returns, so an unknown modifier
/// anywhere in the pipeline fails the whole parse.
pub fn parse_pipeline(specs: &str) -> Result<Vec<ModifierSpec>, ClusterError> {
    specs
        .split(':')
        .filter(|segment| !segment.trim().is_empty())
        .map(ModifierSpec::parse)
        .collect()
}

/// Applies the parsed modifiers strictly in order, each consuming the output
/// of the previous one.
pub fn apply_pipeline(
    mut graph: PhysicalGraph,
    specs: &[ModifierSpec],
) -> Result<PhysicalGraph, ClusterError> {
    for spec in specs {
        tracing::info!("Applying graph modifier '{}'", spec.name());
        graph = spec.apply(graph)?;
    }
    Ok(graph)
}

fn noop(
    graph: PhysicalGraph,
    _args: &[String],
    _params: &HashMap<String, String>,
) -> Result<PhysicalGraph, ClusterError> {
    Ok(graph)
}

/// Zeroes out the sleep time of every application drop so the pipeline runs
/// its plumbing without doing real work.
fn zerorun(
    mut graph: PhysicalGraph,
    _args: &[String],
    _params: &HashMap<String, String>,
) -> Result<PhysicalGraph, ClusterError> {
    for drop in &mut graph.drops {
        if drop.app_type == "app" {
            drop.extra
                .insert("sleep_time".to_string(), serde_json::json!(0));
        }
    }
    Ok(graph)
}

/// Prepends `<prefix>_` to every oid and reference in the graph.
fn prefix_oids(
    mut graph: PhysicalGraph,
    args: &[String],
    _params: &HashMap<String, String>,
) -> Result<PhysicalGraph, ClusterError> {
    let prefix = args.first().ok_or_else(|| {
        ClusterError::Configuration(
            "graph modifier 'prefix_oids' requires a prefix argument".to_string(),
        )
    })?;
    for drop in &mut graph.drops {
        drop.oid = format!("{}_{}", prefix, drop.oid);
        for reference in drop.inputs.iter_mut().chain(drop.outputs.iter_mut()) {
            *reference = format!("{}_{}", prefix, reference);
        }
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DropSpec;

    fn one_app_graph() -> PhysicalGraph {
        let mut drop = DropSpec::new("a");
        drop.app_type = "app".to_string();
        PhysicalGraph {
            pipeline_name: "test".to_string(),
            drops: vec![drop],
        }
    }

    #[test]
    fn test_unknown_modifier_fails_the_whole_pipeline() {
        let err = parse_pipeline("noop:does_not_exist:zerorun").unwrap_err();
        assert!(format!("{}", err).contains("unknown graph modifier 'does_not_exist'"));
    }

    #[test]
    fn test_spec_parsing_splits_args_and_params() {
        let spec = ModifierSpec::parse("noop,alpha,threshold=3").unwrap();
        assert_eq!(spec.name(), "noop");
        assert_eq!(spec.args, vec!["alpha".to_string()]);
        assert_eq!(spec.params.get("threshold"), Some(&"3".to_string()));
    }

    #[test]
    fn test_modifiers_apply_in_order() {
        let specs = parse_pipeline("prefix_oids,x:prefix_oids,y").unwrap();
        let graph = apply_pipeline(one_app_graph(), &specs).unwrap();
        assert_eq!(graph.drops[0].oid, "y_x_a");
    }

    #[test]
    fn test_zerorun_only_touches_app_drops() {
        let mut graph = one_app_graph();
        let mut data = DropSpec::new("b");
        data.app_type = "data".to_string();
        graph.drops.push(data);

        let graph = apply_pipeline(graph, &parse_pipeline("zerorun").unwrap()).unwrap();
        assert_eq!(graph.drops[0].extra["sleep_time"], serde_json::json!(0));
        assert!(graph.drops[1].extra.get("sleep_time").is_none());
    }

    #[test]
    fn test_empty_segments_are_ignored() {
        let specs = parse_pipeline("noop::zerorun:").unwrap();
        assert_eq!(specs.len(), 2);
    }
}
