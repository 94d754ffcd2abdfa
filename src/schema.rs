//! Expression types and tuple schemas.
//!
//! An [`ExprType`] is the mutable typing record attached to every expression
//! node and schema field: a scalar type and a nullability flag, each possibly
//! still unknown. Only the inference engine mutates them. A [`TupleSchema`]
//! is an ordered set of named fields; once `finished` the field set is frozen
//! and late references to missing fields become errors.

use crate::error::{Result, WeirError};
use crate::value::{can_cast, larger_type, ScalarType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Typing record of one expression or schema field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExprType {
    /// Human label used in diagnostics ("constant", "field in.value", ...)
    pub name: String,
    pub scalar: Option<ScalarType>,
    pub nullable: Option<bool>,
}

impl ExprType {
    pub fn unknown(name: impl Into<String>) -> Self {
        ExprType {
            name: name.into(),
            scalar: None,
            nullable: None,
        }
    }

    /// Create with whatever hints are already known.
    pub fn with_hints(
        name: impl Into<String>,
        scalar: Option<ScalarType>,
        nullable: Option<bool>,
    ) -> Self {
        ExprType {
            name: name.into(),
            scalar,
            nullable,
        }
    }

    pub fn typed(name: impl Into<String>, scalar: ScalarType, nullable: bool) -> Self {
        Self::with_hints(name, Some(scalar), Some(nullable))
    }

    /// Both the scalar type and the nullability are known.
    pub fn is_complete(&self) -> bool {
        self.scalar.is_some() && self.nullable.is_some()
    }

    /// Set or widen the scalar type. Returns true when something changed,
    /// fails when the types cannot be unified.
    pub fn unify_scalar(&mut self, t: ScalarType) -> Result<bool> {
        match self.scalar {
            None => {
                self.scalar = Some(t);
                Ok(true)
            }
            Some(cur) if cur == t => Ok(false),
            Some(cur) => match larger_type(cur, t) {
                Some(wider) if wider == cur => Ok(false),
                Some(wider) => {
                    self.scalar = Some(wider);
                    Ok(true)
                }
                None => Err(WeirError::syntax(
                    "",
                    format!("cannot unify type of {} ({cur}) with {t}", self.name),
                )),
            },
        }
    }

    /// Set the nullability flag. Fails when already set to the opposite.
    pub fn set_nullable(&mut self, n: bool) -> Result<bool> {
        match self.nullable {
            None => {
                self.nullable = Some(n);
                Ok(true)
            }
            Some(cur) if cur == n => Ok(false),
            Some(cur) => Err(WeirError::syntax(
                "",
                format!(
                    "{} is {} but must be {}",
                    self.name,
                    if cur { "nullable" } else { "not nullable" },
                    if n { "nullable" } else { "not nullable" }
                ),
            )),
        }
    }

    /// Copy scalar and nullability from another record, keeping our name.
    pub fn copy_from(&mut self, other: &ExprType) {
        self.scalar = other.scalar;
        self.nullable = other.nullable;
    }

    /// Same scalar type and nullability (names are not compared).
    pub fn same_as(&self, other: &ExprType) -> bool {
        self.scalar == other.scalar && self.nullable == other.nullable
    }

    /// Can a value of this type be used where `to` is expected?
    pub fn fits(&self, to: &ExprType) -> bool {
        match (self.scalar, to.scalar) {
            (Some(a), Some(b)) => can_cast(a, b),
            _ => true,
        }
    }
}

impl fmt::Display for ExprType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.scalar, self.nullable) {
            (Some(t), Some(true)) => write!(f, "{t} null"),
            (Some(t), Some(false)) => write!(f, "{t}"),
            (Some(t), None) => write!(f, "{t}?"),
            (None, _) => write!(f, "?"),
        }
    }
}

/// One named field of a tuple schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub typ: ExprType,
}

/// Ordered mapping from field name to type. Field order is the wire order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TupleSchema {
    fields: Vec<SchemaField>,
    finished: bool,
}

impl TupleSchema {
    pub fn new() -> Self {
        TupleSchema::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Freeze the field set.
    pub fn set_finished(&mut self) {
        self.finished = true;
    }

    pub fn get(&self, name: &str) -> Option<&ExprType> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.typ)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ExprType> {
        self.fields
            .iter_mut()
            .find(|f| f.name == name)
            .map(|f| &mut f.typ)
    }

    /// Position of a field in the tuple, if present.
    pub fn rank(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rank(name).is_some()
    }

    /// Append a field. Fails on duplicates and on finished schemas.
    pub fn push(&mut self, name: impl Into<String>, typ: ExprType) -> Result<()> {
        let name = name.into();
        if self.finished {
            return Err(WeirError::syntax(
                "",
                format!("field '{name}' added to a finished schema"),
            ));
        }
        if self.contains(&name) {
            return Err(WeirError::syntax("", format!("duplicate field '{name}'")));
        }
        self.fields.push(SchemaField { name, typ });
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaField> {
        self.fields.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SchemaField> {
        self.fields.iter_mut()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// All fields carry a complete type.
    pub fn fully_typed(&self) -> bool {
        self.fields.iter().all(|f| f.typ.is_complete())
    }
}

impl fmt::Display for TupleSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", field.name, field.typ)?;
        }
        write!(f, ")")
    }
}
