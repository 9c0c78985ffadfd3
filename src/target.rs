use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MusterError, Result};

/// How a target expression is matched against agent identifiers.
///
/// Glob, regex, grain, and pillar matching happen agent-side (or in the
/// control plane's membership cache); this layer only normalizes input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Glob,
    List,
    Pcre,
    Grain,
    GrainPcre,
    Pillar,
    Nodegroup,
    Range,
    Compound,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Glob => "glob",
            TargetType::List => "list",
            TargetType::Pcre => "pcre",
            TargetType::Grain => "grain",
            TargetType::GrainPcre => "grain_pcre",
            TargetType::Pillar => "pillar",
            TargetType::Nodegroup => "nodegroup",
            TargetType::Range => "range",
            TargetType::Compound => "compound",
        }
    }
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A target expression: a single string or an explicit agent list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Expr(String),
    List(Vec<String>),
}

impl Target {
    pub fn expr(s: impl Into<String>) -> Self {
        Target::Expr(s.into())
    }

    pub fn list<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Target::List(agents.into_iter().map(Into::into).collect())
    }

    /// Wire form: a string or an array of strings.
    pub fn to_value(&self) -> Value {
        match self {
            Target::Expr(s) => Value::String(s.clone()),
            Target::List(l) => Value::Array(l.iter().cloned().map(Value::String).collect()),
        }
    }
}

/// Expansion service for range expressions. The real service lives behind a
/// network hop; tests substitute their own.
pub trait RangeService: Send + Sync {
    fn expand(&self, expr: &str) -> std::result::Result<Vec<String>, String>;
}

/// Normalize a target expression before publishing.
///
/// Nodegroups expand to compound expressions, ranges expand to explicit
/// lists, everything else passes through unchanged. Matching itself is
/// delegated to the agents or the control plane.
pub fn resolve(
    target: Target,
    target_type: TargetType,
    nodegroups: &HashMap<String, String>,
    range_service: Option<&dyn RangeService>,
) -> Result<(Target, TargetType)> {
    match target_type {
        TargetType::Nodegroup => {
            let name = match &target {
                Target::Expr(s) => s.clone(),
                Target::List(_) => {
                    return Err(MusterError::InvalidTarget(
                        "nodegroup target must be a single name".to_string(),
                    ))
                }
            };
            if !nodegroups.contains_key(&name) {
                return Err(MusterError::UnknownNodegroup(name));
            }
            let mut seen = HashSet::new();
            let expanded = expand_nodegroup(&name, nodegroups, &mut seen)?;
            Ok((Target::Expr(expanded), TargetType::Compound))
        }
        TargetType::Range => {
            let expr = match &target {
                Target::Expr(s) => s.as_str(),
                Target::List(_) => {
                    return Err(MusterError::InvalidTarget(
                        "range target must be an expression".to_string(),
                    ))
                }
            };
            let expanded = match range_service {
                Some(svc) => match svc.expand(expr) {
                    Ok(agents) => agents,
                    Err(err) => {
                        // Fail open to "no targets": an unreachable range
                        // service must never broadcast to everything.
                        tracing::warn!(range = expr, error = %err, "Range expansion failed");
                        Vec::new()
                    }
                },
                None => {
                    tracing::warn!(range = expr, "No range service configured");
                    Vec::new()
                }
            };
            Ok((Target::List(expanded), TargetType::List))
        }
        TargetType::Compound => {
            if let Target::Expr(s) = &target {
                if s.trim().is_empty() {
                    return Err(MusterError::InvalidTarget(
                        "compound expression is empty".to_string(),
                    ));
                }
            }
            Ok((target, TargetType::Compound))
        }
        _ => Ok((target, target_type)),
    }
}

/// Expand one nodegroup definition, following nested `N@name` references.
/// A reference back into the expansion chain or to a missing group rejects
/// the whole nodegroup.
fn expand_nodegroup(
    name: &str,
    nodegroups: &HashMap<String, String>,
    seen: &mut HashSet<String>,
) -> Result<String> {
    if !seen.insert(name.to_string()) {
        return Err(MusterError::InvalidNodegroup {
            name: name.to_string(),
            reason: "self-referential nodegroup cycle".to_string(),
        });
    }
    let def = nodegroups
        .get(name)
        .ok_or_else(|| MusterError::InvalidNodegroup {
            name: name.to_string(),
            reason: "referenced nodegroup does not exist".to_string(),
        })?;

    let mut parts = Vec::new();
    for token in def.split_whitespace() {
        if let Some(inner) = token.strip_prefix("N@") {
            let expanded = expand_nodegroup(inner, nodegroups, seen)?;
            parts.push(format!("( {} )", expanded));
        } else {
            parts.push(token.to_string());
        }
    }
    seen.remove(name);
    Ok(parts.join(" "))
}
