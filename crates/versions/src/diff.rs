//! Field-by-field textual diff of two deployment specs.
//!
//! Containers and services are keyed by name so reordering or inserting one
//! entry does not cascade into updates on every later entry.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use keel_core::{DeploymentSpec, SemVer};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionDiff {
    pub from: SemVer,
    pub to: SemVer,
    pub summary: DiffSummary,
    pub lines: Vec<String>,
}

impl VersionDiff {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl fmt::Display for VersionDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- {}", self.from)?;
        writeln!(f, "+++ {}", self.to)?;
        for l in &self.lines {
            writeln!(f, "{}", l)?;
        }
        Ok(())
    }
}

fn keyed(items: &Json) -> Json {
    let mut m = Map::new();
    if let Json::Array(arr) = items {
        for item in arr {
            let name = item.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
            let mut body = item.clone();
            if let Some(o) = body.as_object_mut() {
                o.remove("name");
            }
            m.insert(name, body);
        }
    }
    Json::Object(m)
}

/// JSON view of a spec with named lists turned into maps.
fn normalized(spec: &DeploymentSpec) -> Json {
    let mut v = serde_json::to_value(spec).unwrap_or(Json::Null);
    if let Some(o) = v.as_object_mut() {
        for key in ["containers", "services"] {
            let list = o.remove(key).unwrap_or(Json::Array(vec![]));
            o.insert(key.to_string(), keyed(&list));
        }
    }
    v
}

fn render(v: &Json) -> String {
    serde_json::to_string(v).unwrap_or_default()
}

/// Deterministic diff from `a` (at version `from`) to `b` (at `to`).
pub fn diff_specs(from: SemVer, a: &DeploymentSpec, to: SemVer, b: &DeploymentSpec) -> VersionDiff {
    fn walk(path: &str, a: &Json, b: &Json, out: &mut Vec<String>, s: &mut DiffSummary) {
        let join = |k: &str| if path.is_empty() { k.to_string() } else { format!("{}.{}", path, k) };
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                let mut keys: Vec<&String> = ao.keys().chain(bo.keys().filter(|k| !ao.contains_key(*k))).collect();
                keys.sort();
                for k in keys {
                    let (Some(av), bv) = (ao.get(k), bo.get(k)) else {
                        if let Some(bv) = bo.get(k) {
                            s.adds += 1;
                            out.push(format!("+ {}: {}", join(k), render(bv)));
                        }
                        continue;
                    };
                    match bv {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(&join(k), av, bv, out, s),
                        None => {
                            s.removes += 1;
                            out.push(format!("- {}: {}", join(k), render(av)));
                        }
                    }
                }
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len {
                    if aa[i] != bb[i] {
                        s.updates += 1;
                        out.push(format!("~ {}[{}]: {} -> {}", path, i, render(&aa[i]), render(&bb[i])));
                    }
                }
                for (i, v) in aa.iter().enumerate().skip(min_len) {
                    s.removes += 1;
                    out.push(format!("- {}[{}]: {}", path, i, render(v)));
                }
                for (i, v) in bb.iter().enumerate().skip(min_len) {
                    s.adds += 1;
                    out.push(format!("+ {}[{}]: {}", path, i, render(v)));
                }
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                    out.push(format!("~ {}: {} -> {}", path, render(av), render(bv)));
                }
            }
        }
    }
    let mut lines = Vec::new();
    let mut summary = DiffSummary::default();
    walk("", &normalized(a), &normalized(b), &mut lines, &mut summary);
    VersionDiff { from, to, summary, lines }
}
