//! Parameter lists and explicit parameter threading.
//!
//! A model function never owns hidden state: it either creates its
//! parameters through a [`ParamBuilder`] (the "params omitted" form) or
//! consumes a caller-supplied list through a [`ParamCursor`]. Both go
//! through [`ParamSource`], so the creation order and the consumption order
//! are the same code path.
//!
//! ## Lifecycle
//!
//! ```text
//! ParamBuilder ──create──▶ ParamList (Vars, persistent, in a VarMap)
//!                              │
//!                              ▼ initial_weights()
//!                          FastWeights (snapshot 0) ──inner step──▶ FastWeights (k)
//! ```

use std::fmt;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use maml_core::{MamlError, NameCounters, Result, SimpleRng};

/// Initialization scheme for a freshly created parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// Xavier/Glorot uniform: `U(-a, a)` with `a = sqrt(6 / (fan_in + fan_out))`.
    XavierUniform { fan_in: usize, fan_out: usize },
    /// All zeros (biases).
    Zeros,
}

/// One named trainable parameter.
#[derive(Clone)]
pub struct NamedParam {
    /// Full scoped name, e.g. `maml_0/mlp_0/dense_1/W`.
    pub name: String,
    /// The trainable variable.
    pub var: Var,
}

/// The initial (meta) parameters of one model instantiation.
///
/// Ordered exactly as the model consumes them. Every variable is also
/// registered by name in a [`VarMap`] so the list can be checkpointed.
/// Cloning is cheap and shares the underlying storage.
#[derive(Clone)]
pub struct ParamList {
    entries: Vec<NamedParam>,
    var_map: VarMap,
    device: Device,
}

impl fmt::Debug for ParamList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ParamList({} tensors, {} values, device={:?})",
            self.entries.len(),
            self.param_count(),
            self.device
        )
    }
}

impl ParamList {
    /// Number of tensors in the list.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` for a model without parameters.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn param_count(&self) -> usize {
        self.entries.iter().map(|p| p.var.elem_count()).sum()
    }

    /// Named entries in consumption order.
    pub fn entries(&self) -> &[NamedParam] {
        &self.entries
    }

    /// Names in consumption order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|p| p.name.as_str()).collect()
    }

    /// The variables in consumption order.
    pub fn vars(&self) -> Vec<Var> {
        self.entries.iter().map(|p| p.var.clone()).collect()
    }

    /// Shapes in consumption order.
    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.entries.iter().map(|p| p.var.dims().to_vec()).collect()
    }

    /// The name-keyed map backing checkpoints.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Device the parameters live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Snapshot 0 of an inner loop: the variables themselves, so gradients
    /// taken through any later snapshot reach them.
    pub fn initial_weights(&self) -> FastWeights {
        FastWeights(
            self.entries
                .iter()
                .map(|p| p.var.as_tensor().clone())
                .collect(),
        )
    }

    /// Copies the current values out as detached host vectors.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::Internal`] if a tensor cannot be read.
    pub fn to_host(&self) -> Result<Vec<Vec<f32>>> {
        let map_err = |e: candle_core::Error| MamlError::Internal {
            message: format!("ParamList to_host: {e}"),
        };
        self.entries
            .iter()
            .map(|p| {
                p.var
                    .as_tensor()
                    .flatten_all()
                    .and_then(|t| t.to_vec1::<f32>())
                    .map_err(map_err)
            })
            .collect()
    }

    /// Checks that `tensors` has this list's count and shapes, in order.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::StructureMismatch`] naming the first difference.
    pub fn check_aligned(&self, tensors: &[Tensor], what: &str) -> Result<()> {
        check_structure(&self.shapes(), tensors, what)
    }
}

/// Checks that `tensors` matches `expected` shapes, index by index.
///
/// # Errors
///
/// Returns [`MamlError::StructureMismatch`] on a count or shape difference.
pub fn check_structure(expected: &[Vec<usize>], tensors: &[Tensor], what: &str) -> Result<()> {
    if expected.len() != tensors.len() {
        return Err(MamlError::StructureMismatch {
            message: format!(
                "{what}: {} tensors, parameter list has {}",
                tensors.len(),
                expected.len()
            ),
        });
    }
    for (i, (shape, t)) in expected.iter().zip(tensors).enumerate() {
        if t.dims() != shape.as_slice() {
            return Err(MamlError::StructureMismatch {
                message: format!(
                    "{what}: tensor {i} has shape {:?}, expected {:?}",
                    t.dims(),
                    shape
                ),
            });
        }
    }
    Ok(())
}

/// A per-task, per-step parameter snapshot (fast weights).
///
/// Never persisted; lives only inside one inner-loop unroll.
#[derive(Debug, Clone)]
pub struct FastWeights(Vec<Tensor>);

impl FastWeights {
    /// Wraps an ordered list of tensors.
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self(tensors)
    }

    /// The tensors in consumption order.
    pub fn tensors(&self) -> &[Tensor] {
        &self.0
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the snapshot holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Shapes in order.
    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.0.iter().map(|t| t.dims().to_vec()).collect()
    }

    /// Unwraps into the tensor list.
    pub fn into_inner(self) -> Vec<Tensor> {
        self.0
    }
}

/// Creates parameters for the "params omitted" form of a model function.
///
/// Names come from the explicitly passed [`NameCounters`]; values from a
/// seeded [`SimpleRng`], so the same seed and counters give the same list.
pub struct ParamBuilder<'a> {
    counters: &'a mut NameCounters,
    rng: SimpleRng,
    device: Device,
    scope: Vec<String>,
    created: Vec<NamedParam>,
}

impl<'a> ParamBuilder<'a> {
    /// Creates a builder rooted at no scope.
    pub fn new(counters: &'a mut NameCounters, seed: u64, device: &Device) -> Self {
        Self {
            counters,
            rng: SimpleRng::new(seed),
            device: device.clone(),
            scope: Vec::new(),
            created: Vec::new(),
        }
    }

    /// Opens a uniquely numbered scope (`{prefix}_{n}`) and returns its name.
    pub fn enter(&mut self, prefix: &str) -> String {
        let name = self.counters.next_name(prefix);
        self.scope.push(name.clone());
        name
    }

    /// Closes the innermost scope.
    pub fn exit(&mut self) {
        self.scope.pop();
    }

    /// Creates a new trainable parameter under the current scope.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::Internal`] if the variable cannot be allocated.
    pub fn create(&mut self, name: &str, shape: &[usize], init: Init) -> Result<Tensor> {
        let map_err = |e: candle_core::Error| MamlError::Internal {
            message: format!("ParamBuilder create {name}: {e}"),
        };
        let count: usize = shape.iter().product();
        let data: Vec<f32> = match init {
            Init::Zeros => vec![0.0; count],
            Init::XavierUniform { fan_in, fan_out } => {
                let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                (0..count)
                    .map(|_| self.rng.next_f32_range(-limit, limit))
                    .collect()
            }
        };
        let var = Var::from_vec(data, shape, &self.device).map_err(map_err)?;
        let full_name = if self.scope.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.scope.join("/"))
        };
        let tensor = var.as_tensor().clone();
        self.created.push(NamedParam {
            name: full_name,
            var,
        });
        Ok(tensor)
    }

    /// Finalizes the created parameters into a [`ParamList`].
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::Internal`] if the var map lock is poisoned, or
    /// [`MamlError::StructureMismatch`] if two parameters share a name.
    pub fn finish(self) -> Result<ParamList> {
        let var_map = VarMap::new();
        {
            let mut data = var_map.data().lock().map_err(|e| MamlError::Internal {
                message: format!("ParamBuilder finish: var map lock poisoned: {e}"),
            })?;
            for p in &self.created {
                if data.insert(p.name.clone(), p.var.clone()).is_some() {
                    return Err(MamlError::StructureMismatch {
                        message: format!("duplicate parameter name {}", p.name),
                    });
                }
            }
        }
        tracing::debug!(
            tensors = self.created.len(),
            scope = ?self.scope,
            "parameter list created"
        );
        Ok(ParamList {
            entries: self.created,
            var_map,
            device: self.device,
        })
    }
}

/// Consumes a caller-supplied parameter list in order.
///
/// Each [`next`](Self::next) checks the shape the layer expects, so a
/// structural bug fails at the layer that hit it rather than deep inside
/// a matmul. [`finish`](Self::finish) checks nothing was left over.
pub struct ParamCursor<'a> {
    owner: String,
    params: &'a [Tensor],
    pos: usize,
}

impl<'a> ParamCursor<'a> {
    /// Creates a cursor over `params` for the model named `owner`.
    pub fn new(owner: impl Into<String>, params: &'a [Tensor]) -> Self {
        Self {
            owner: owner.into(),
            params,
            pos: 0,
        }
    }

    /// Takes the next parameter, checking its shape.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ParamsExhausted`] if the list is used up, or
    /// [`MamlError::ShapeMismatch`] if the shape differs.
    pub fn next(&mut self, shape: &[usize]) -> Result<Tensor> {
        let Some(t) = self.params.get(self.pos) else {
            return Err(MamlError::ParamsExhausted {
                owner: self.owner.clone(),
                consumed: self.pos,
            });
        };
        if t.dims() != shape {
            return Err(MamlError::ShapeMismatch {
                owner: self.owner.clone(),
                index: self.pos,
                expected: shape.to_vec(),
                found: t.dims().to_vec(),
            });
        }
        self.pos += 1;
        Ok(t.clone())
    }

    /// Number of parameters consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Checks that every parameter was consumed.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ParamsUnconsumed`] if any remain.
    pub fn finish(self) -> Result<()> {
        let remaining = self.params.len() - self.pos;
        if remaining != 0 {
            return Err(MamlError::ParamsUnconsumed {
                owner: self.owner,
                remaining,
            });
        }
        Ok(())
    }
}

/// Where a layer gets its parameters from.
pub enum ParamSource<'a> {
    /// Create new trainable parameters.
    Create(ParamBuilder<'a>),
    /// Consume a supplied list.
    Consume(ParamCursor<'a>),
}

impl ParamSource<'_> {
    /// Returns a parameter of `shape`, either freshly created or the next
    /// one in the supplied list.
    ///
    /// # Errors
    ///
    /// See [`ParamBuilder::create`] and [`ParamCursor::next`].
    pub fn take(&mut self, name: &str, shape: &[usize], init: Init) -> Result<Tensor> {
        match self {
            Self::Create(builder) => builder.create(name, shape, init),
            Self::Consume(cursor) => cursor.next(shape),
        }
    }

    /// Opens a naming scope; a no-op when consuming.
    pub fn enter(&mut self, prefix: &str) {
        if let Self::Create(builder) = self {
            builder.enter(prefix);
        }
    }

    /// Closes a naming scope; a no-op when consuming.
    pub fn exit(&mut self) {
        if let Self::Create(builder) = self {
            builder.exit();
        }
    }
}

/// The dtype every parameter is created with.
pub const PARAM_DTYPE: DType = DType::F32;

#[cfg(test)]
mod tests {
    use super::*;

    fn tensors(shapes: &[&[usize]]) -> Vec<Tensor> {
        shapes
            .iter()
            .map(|s| Tensor::zeros(*s, PARAM_DTYPE, &Device::Cpu).unwrap())
            .collect()
    }

    #[test]
    fn builder_names_are_scoped_and_unique() {
        let mut counters = NameCounters::new();
        let mut builder = ParamBuilder::new(&mut counters, 0, &Device::Cpu);
        builder.enter("mlp");
        builder.enter("dense");
        builder.create("W", &[2, 3], Init::Zeros).unwrap();
        builder.exit();
        builder.enter("dense");
        builder.create("W", &[3, 1], Init::Zeros).unwrap();
        builder.exit();
        builder.exit();
        let list = builder.finish().unwrap();
        assert_eq!(list.names(), vec!["mlp_0/dense_0/W", "mlp_0/dense_1/W"]);
        assert_eq!(list.param_count(), 9);
    }

    #[test]
    fn xavier_respects_limit() {
        let mut counters = NameCounters::new();
        let mut builder = ParamBuilder::new(&mut counters, 3, &Device::Cpu);
        let t = builder
            .create("W", &[10, 20], Init::XavierUniform { fan_in: 10, fan_out: 20 })
            .unwrap();
        let limit = (6.0f32 / 30.0).sqrt();
        let vals = t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(vals.iter().all(|v| v.abs() <= limit));
        assert!(vals.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn cursor_exhaustion_is_reported() {
        let params = tensors(&[&[2, 2]]);
        let mut cursor = ParamCursor::new("toy", &params);
        cursor.next(&[2, 2]).unwrap();
        let err = cursor.next(&[2]).unwrap_err();
        assert!(matches!(err, MamlError::ParamsExhausted { consumed: 1, .. }));
    }

    #[test]
    fn cursor_leftovers_are_reported() {
        let params = tensors(&[&[2, 2], &[2]]);
        let mut cursor = ParamCursor::new("toy", &params);
        cursor.next(&[2, 2]).unwrap();
        let err = cursor.finish().unwrap_err();
        assert!(matches!(err, MamlError::ParamsUnconsumed { remaining: 1, .. }));
    }

    #[test]
    fn cursor_checks_shapes_at_consumption() {
        let params = tensors(&[&[2, 3]]);
        let mut cursor = ParamCursor::new("toy", &params);
        let err = cursor.next(&[3, 2]).unwrap_err();
        match err {
            MamlError::ShapeMismatch { index, expected, found, .. } => {
                assert_eq!(index, 0);
                assert_eq!(expected, vec![3, 2]);
                assert_eq!(found, vec![2, 3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn check_structure_catches_count_and_shape() {
        let expected = vec![vec![2, 2], vec![2]];
        assert!(check_structure(&expected, &tensors(&[&[2, 2], &[2]]), "ok").is_ok());
        assert!(check_structure(&expected, &tensors(&[&[2, 2]]), "short").is_err());
        assert!(check_structure(&expected, &tensors(&[&[2, 2], &[3]]), "shape").is_err());
    }
}
