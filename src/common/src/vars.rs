//! Arena of scratch variables.
//!
//! Condition operands and per-column null defaults live in a `VarArena` owned by
//! the query that uses them. Everything else refers to them through `VarId`
//! handles, so nothing outside the arena owns variable memory.

use crate::{DbError, Field};

/// Opaque handle into a `VarArena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(usize);

/// A variable: a single scalar, or a list of scalars (the operand of `In`).
#[derive(Debug, Clone, PartialEq)]
pub enum Var {
    Scalar(Field),
    List(Vec<Field>),
}

impl Var {
    /// Returns the scalar, or an error for lists.
    pub fn scalar(&self) -> Result<&Field, DbError> {
        match self {
            Var::Scalar(f) => Ok(f),
            Var::List(_) => Err(DbError::CannotConvertType(String::from(
                "expected a scalar value, got a list",
            ))),
        }
    }

    /// Returns the list, or an error for scalars.
    pub fn list(&self) -> Result<&[Field], DbError> {
        match self {
            Var::List(l) => Ok(l),
            Var::Scalar(f) => Err(DbError::CannotConvertType(format!(
                "expected a list, got {} value",
                f.dtype()
            ))),
        }
    }
}

/// Slot-based arena. Freed slots are reused by later allocations.
#[derive(Debug, Clone, Default)]
pub struct VarArena {
    slots: Vec<Option<Var>>,
    free: Vec<usize>,
}

impl VarArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Store a variable and return its handle.
    pub fn alloc(&mut self, var: Var) -> VarId {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(var);
                VarId(slot)
            }
            None => {
                self.slots.push(Some(var));
                VarId(self.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, id: VarId) -> Result<&Var, DbError> {
        self.slots
            .get(id.0)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| DbError::InternalError(format!("variable {} does not exist", id.0)))
    }

    /// Replace the contents behind a live handle.
    pub fn replace(&mut self, id: VarId, var: Var) -> Result<Var, DbError> {
        match self.slots.get_mut(id.0) {
            Some(Some(slot)) => Ok(std::mem::replace(slot, var)),
            _ => Err(DbError::InternalError(format!(
                "variable {} does not exist",
                id.0
            ))),
        }
    }

    /// Release a handle. Releasing twice is an error.
    pub fn free(&mut self, id: VarId) -> Result<Var, DbError> {
        match self.slots.get_mut(id.0).and_then(|s| s.take()) {
            Some(var) => {
                self.free.push(id.0);
                Ok(var)
            }
            None => Err(DbError::InternalError(format!(
                "variable {} released twice",
                id.0
            ))),
        }
    }

    /// Number of live variables.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Release everything.
    pub fn clear(&mut self) {
        if self.live() > 0 {
            debug!("releasing {} scratch variables", self.live());
        }
        self.slots.clear();
        self.free.clear();
    }
}
