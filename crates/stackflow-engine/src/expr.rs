//! Attribute expressions
//!
//! Attribute values are a tagged union instead of untyped strings: literals,
//! references to other resources' attributes, iteration bindings and calls to
//! pure functions. References are therefore visible without scanning text,
//! which is what the graph builder relies on.

use crate::resource::{DataValues, InstanceKey, IterationContext, ResourceId};
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// An attribute expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Literal(Value),
    Reference(Reference),
    Iteration(IterationRef),
    Call { function: Function, args: Vec<Expr> },
    List(Vec<Expr>),
    Map(BTreeMap<String, Expr>),
}

/// `<type>.<name>[<key>].<attribute>`, or `data.<type>.<name>.<attribute>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reference {
    #[serde(default)]
    pub data: bool,
    pub resource: ResourceId,
    #[serde(default)]
    pub key: Option<InstanceKey>,
    pub attribute: String,
}

impl Reference {
    pub fn new(resource: ResourceId, attribute: impl Into<String>) -> Self {
        Self {
            data: false,
            resource,
            key: None,
            attribute: attribute.into(),
        }
    }

    pub fn to(resource_type: &str, name: &str, attribute: &str) -> Self {
        Self::new(ResourceId::new(resource_type, name), attribute)
    }

    pub fn with_key(mut self, key: InstanceKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn data(resource_type: &str, name: &str, attribute: &str) -> Self {
        Self {
            data: true,
            ..Self::to(resource_type, name, attribute)
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.data {
            write!(f, "data.")?;
        }
        write!(f, "{}", self.resource)?;
        if let Some(key) = &self.key {
            write!(f, "{}", key)?;
        }
        write!(f, ".{}", self.attribute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationRef {
    CountIndex,
    EachKey,
    EachValue,
}

impl fmt::Display for IterationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IterationRef::CountIndex => write!(f, "count.index"),
            IterationRef::EachKey => write!(f, "each.key"),
            IterationRef::EachValue => write!(f, "each.value"),
        }
    }
}

/// Pure functions available in expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Function {
    Concat,
    Upper,
    Lower,
    Join,
    Length,
    Coalesce,
}

impl Function {
    pub fn name(&self) -> &'static str {
        match self {
            Function::Concat => "concat",
            Function::Upper => "upper",
            Function::Lower => "lower",
            Function::Join => "join",
            Function::Length => "length",
            Function::Coalesce => "coalesce",
        }
    }

    fn arity(&self) -> Option<usize> {
        match self {
            Function::Upper | Function::Lower | Function::Length => Some(1),
            Function::Join => Some(2),
            Function::Concat | Function::Coalesce => None,
        }
    }

    /// Apply to evaluated arguments. Unknown arguments make the result unknown,
    /// except for `coalesce`, which only needs the arguments up to the first
    /// usable known one.
    pub fn apply(&self, args: &[PlannedValue]) -> Result<PlannedValue, String> {
        if let Some(arity) = self.arity()
            && args.len() != arity
        {
            return Err(format!(
                "{}() takes {} argument(s), got {}",
                self.name(),
                arity,
                args.len()
            ));
        }

        if *self == Function::Coalesce {
            for arg in args {
                match arg {
                    PlannedValue::Unknown => return Ok(PlannedValue::Unknown),
                    PlannedValue::Known(Value::Null) => {}
                    PlannedValue::Known(Value::String(s)) if s.is_empty() => {}
                    PlannedValue::Known(v) => return Ok(PlannedValue::Known(v.clone())),
                }
            }
            return Ok(PlannedValue::Known(Value::Null));
        }

        let mut known = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                PlannedValue::Known(v) => known.push(v),
                PlannedValue::Unknown => return Ok(PlannedValue::Unknown),
            }
        }

        let value = match self {
            Function::Concat => {
                let mut out = String::new();
                for v in known {
                    out.push_str(&scalar_to_string(v, self)?);
                }
                Value::String(out)
            }
            Function::Upper => Value::String(expect_str(known[0], self)?.to_uppercase()),
            Function::Lower => Value::String(expect_str(known[0], self)?.to_lowercase()),
            Function::Join => {
                let separator = expect_str(known[0], self)?;
                let items = known[1]
                    .as_array()
                    .ok_or_else(|| "join() expects a list as its second argument".to_string())?;
                let parts = items
                    .iter()
                    .map(|v| scalar_to_string(v, self))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::String(parts.join(separator))
            }
            Function::Length => match known[0] {
                Value::String(s) => Value::from(s.chars().count()),
                Value::Array(items) => Value::from(items.len()),
                Value::Object(map) => Value::from(map.len()),
                other => return Err(format!("length() cannot measure {}", other)),
            },
            Function::Coalesce => unreachable!("handled above"),
        };
        Ok(PlannedValue::Known(value))
    }
}

impl FromStr for Function {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concat" => Ok(Function::Concat),
            "upper" => Ok(Function::Upper),
            "lower" => Ok(Function::Lower),
            "join" => Ok(Function::Join),
            "length" => Ok(Function::Length),
            "coalesce" => Ok(Function::Coalesce),
            other => Err(format!("unknown function '{}'", other)),
        }
    }
}

fn expect_str<'v>(value: &'v Value, function: &Function) -> Result<&'v str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("{}() expects a string, got {}", function.name(), value))
}

fn scalar_to_string(value: &Value, function: &Function) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(format!(
            "{}() cannot convert {} to a string",
            function.name(),
            other
        )),
    }
}

/// A value as known at plan time
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedValue {
    Known(Value),
    /// Only determinable once the apply has run
    Unknown,
}

impl PlannedValue {
    pub fn is_known(&self) -> bool {
        matches!(self, PlannedValue::Known(_))
    }

    pub fn as_known(&self) -> Option<&Value> {
        match self {
            PlannedValue::Known(v) => Some(v),
            PlannedValue::Unknown => None,
        }
    }
}

impl From<Value> for PlannedValue {
    fn from(value: Value) -> Self {
        PlannedValue::Known(value)
    }
}

impl fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannedValue::Known(v) => write!(f, "{}", v),
            PlannedValue::Unknown => write!(f, "(known after apply)"),
        }
    }
}

// Unknown values are persisted as `{"unknown": true}`.
impl Serialize for PlannedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PlannedValue::Known(v) => v.serialize(serializer),
            PlannedValue::Unknown => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("unknown", &true)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for PlannedValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let is_marker = value
            .as_object()
            .is_some_and(|m| m.len() == 1 && m.get("unknown") == Some(&Value::Bool(true)));
        Ok(if is_marker {
            PlannedValue::Unknown
        } else {
            PlannedValue::Known(value)
        })
    }
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn reference(reference: Reference) -> Self {
        Expr::Reference(reference)
    }

    pub fn call(function: Function, args: Vec<Expr>) -> Self {
        Expr::Call { function, args }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Expr::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// All references contained in this expression, in source order
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.visit(&mut |expr| {
            if let Expr::Reference(r) = expr {
                out.push(r);
            }
        });
        out
    }

    /// All iteration bindings used by this expression
    pub fn iterations(&self) -> Vec<IterationRef> {
        let mut out = Vec::new();
        self.visit(&mut |expr| {
            if let Expr::Iteration(it) = expr
                && !out.contains(it)
            {
                out.push(*it);
            }
        });
        out
    }

    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Call { args, .. } => args.iter().for_each(|a| a.visit(f)),
            Expr::List(items) => items.iter().for_each(|i| i.visit(f)),
            Expr::Map(entries) => entries.values().for_each(|e| e.visit(f)),
            Expr::Literal(_) | Expr::Reference(_) | Expr::Iteration(_) => {}
        }
    }

    /// Replace iteration bindings with literals. Fails with the first binding
    /// the context does not provide.
    pub fn bind_iteration(&self, ctx: &IterationContext) -> Result<Expr, IterationRef> {
        self.rewrite(&mut |expr| match expr {
            Expr::Iteration(it) => {
                let value = match it {
                    IterationRef::CountIndex => ctx.index.map(Value::from),
                    IterationRef::EachKey => ctx.each_key.clone().map(Value::from),
                    IterationRef::EachValue => ctx.each_value.clone(),
                };
                value.map(|v| Some(Expr::Literal(v))).ok_or(*it)
            }
            _ => Ok(None),
        })
    }

    /// Replace `data.*` references with the looked-up values.
    pub fn bind_data(&self, data: &DataValues) -> Result<Expr, Reference> {
        self.rewrite(&mut |expr| match expr {
            Expr::Reference(r) if r.data => {
                if r.key.is_some() {
                    return Err(r.clone());
                }
                data.get(&r.resource)
                    .and_then(|attrs| attrs.get(&r.attribute))
                    .map(|v| Some(Expr::Literal(v.clone())))
                    .ok_or_else(|| r.clone())
            }
            _ => Ok(None),
        })
    }

    fn rewrite<E>(
        &self,
        f: &mut dyn FnMut(&Expr) -> Result<Option<Expr>, E>,
    ) -> Result<Expr, E> {
        if let Some(replacement) = f(self)? {
            return Ok(replacement);
        }
        Ok(match self {
            Expr::Call { function, args } => Expr::Call {
                function: *function,
                args: args
                    .iter()
                    .map(|a| a.rewrite(f))
                    .collect::<Result<_, _>>()?,
            },
            Expr::List(items) => Expr::List(
                items
                    .iter()
                    .map(|i| i.rewrite(f))
                    .collect::<Result<_, _>>()?,
            ),
            Expr::Map(entries) => Expr::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.rewrite(f)?)))
                    .collect::<Result<_, E>>()?,
            ),
            other => other.clone(),
        })
    }

    /// Evaluate, resolving references through `resolve`.
    pub fn evaluate(
        &self,
        resolve: &mut dyn FnMut(&Reference) -> PlannedValue,
    ) -> Result<PlannedValue, String> {
        match self {
            Expr::Literal(v) => Ok(PlannedValue::Known(v.clone())),
            Expr::Reference(r) => Ok(resolve(r)),
            Expr::Iteration(it) => Err(format!("{} is not available here", it)),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                let mut unknown = false;
                for item in items {
                    match item.evaluate(resolve)? {
                        PlannedValue::Known(v) => out.push(v),
                        PlannedValue::Unknown => unknown = true,
                    }
                }
                Ok(if unknown {
                    PlannedValue::Unknown
                } else {
                    PlannedValue::Known(Value::Array(out))
                })
            }
            Expr::Map(entries) => {
                let mut out = serde_json::Map::new();
                let mut unknown = false;
                for (key, item) in entries {
                    match item.evaluate(resolve)? {
                        PlannedValue::Known(v) => {
                            out.insert(key.clone(), v);
                        }
                        PlannedValue::Unknown => unknown = true,
                    }
                }
                Ok(if unknown {
                    PlannedValue::Unknown
                } else {
                    PlannedValue::Known(Value::Object(out))
                })
            }
            Expr::Call { function, args } => {
                let values = args
                    .iter()
                    .map(|a| a.evaluate(resolve))
                    .collect::<Result<Vec<_>, _>>()?;
                function.apply(&values)
            }
        }
    }
}
