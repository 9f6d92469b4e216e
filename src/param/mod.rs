mod grad;
mod storage;

use std::fmt;

pub use grad::{Grad, SparseGrad};
pub use storage::{ParamStorage, Precision};

use crate::error::{OptimErr, Result};

/// A stable handle to a parameter inside a `ParamStore`.
///
/// Optimizer state is keyed by this handle, never by the parameter's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(usize);

impl ParamId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A parameter together with its (optional) gradient.
#[derive(Debug, Clone)]
pub struct Param {
    pub storage: ParamStorage,
    pub grad: Option<Grad>,
}

/// The owner of every trainable parameter.
///
/// Parameters are never removed, so a `ParamId` stays valid for the lifetime of
/// the store.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    params: Vec<Param>,
}

impl ParamStore {
    /// Creates a new empty `ParamStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter to the store.
    ///
    /// # Arguments
    /// * `storage` - The parameter values.
    ///
    /// # Returns
    /// The handle of the new parameter.
    pub fn insert(&mut self, storage: ParamStorage) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(Param {
            storage,
            grad: None,
        });
        id
    }

    /// Returns the amount of parameters in the store.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Returns every handle in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = ParamId> + '_ {
        (0..self.params.len()).map(ParamId)
    }

    pub fn get(&self, id: ParamId) -> Result<&Param> {
        self.params.get(id.0).ok_or(OptimErr::UnknownParam(id))
    }

    pub fn get_mut(&mut self, id: ParamId) -> Result<&mut Param> {
        self.params.get_mut(id.0).ok_or(OptimErr::UnknownParam(id))
    }

    /// Returns the storage of a parameter.
    pub fn storage(&self, id: ParamId) -> Result<&ParamStorage> {
        Ok(&self.get(id)?.storage)
    }

    /// Attaches a gradient to a parameter, replacing the previous one.
    ///
    /// # Arguments
    /// * `id` - The handle of the parameter.
    /// * `grad` - The new gradient.
    ///
    /// # Returns
    /// An error if the handle is unknown or the gradient's shape doesn't match the
    /// parameter's.
    pub fn set_grad(&mut self, id: ParamId, grad: impl Into<Grad>) -> Result<()> {
        let grad = grad.into();
        let param = self.get_mut(id)?;
        param.storage.check_shape("grad", grad.shape())?;
        param.grad = Some(grad);
        Ok(())
    }

    /// Detaches the gradient of every parameter.
    pub fn zero_grad(&mut self) {
        self.params.iter_mut().for_each(|p| p.grad = None);
    }
}
