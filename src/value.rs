use faer::Mat;
use thiserror::Error;

/// A flat buffer did not have the number of elements a value needs.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("expected {expected} elements, got {found}")]
pub struct SizeMismatch {
    pub expected: usize,
    pub found: usize,
}

/// The shape of a node value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Scalar,
    Matrix { rows: usize, cols: usize },
}

impl ValueType {
    /// Number of scalars needed to store a value of this type.
    pub fn element_count(&self) -> usize {
        match *self {
            ValueType::Scalar => 1,
            ValueType::Matrix { rows, cols } => rows * cols,
        }
    }
}

/// The value of a node, either a single real or a dense matrix.
///
/// Matrix elements are enumerated in column-major order everywhere a value
/// is flattened into or read back from a slice.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Scalar(f64),
    Matrix(Mat<f64>),
}

impl From<f64> for NodeValue {
    fn from(value: f64) -> Self {
        NodeValue::Scalar(value)
    }
}

impl From<Mat<f64>> for NodeValue {
    fn from(value: Mat<f64>) -> Self {
        NodeValue::Matrix(value)
    }
}

impl NodeValue {
    pub fn zeros(value_type: ValueType) -> Self {
        Self::filled(value_type, 0f64)
    }

    pub fn filled(value_type: ValueType, val: f64) -> Self {
        match value_type {
            ValueType::Scalar => NodeValue::Scalar(val),
            ValueType::Matrix { rows, cols } => NodeValue::Matrix(Mat::from_fn(rows, cols, |_, _| val)),
        }
    }

    /// Build a value of the given type whose elements are produced by `f`
    /// in column-major order.
    pub fn from_fn(value_type: ValueType, mut f: impl FnMut() -> f64) -> Self {
        match value_type {
            ValueType::Scalar => NodeValue::Scalar(f()),
            ValueType::Matrix { rows, cols } => {
                let mut mat = Mat::<f64>::zeros(rows, cols);
                for j in 0..cols {
                    for i in 0..rows {
                        mat[(i, j)] = f();
                    }
                }
                NodeValue::Matrix(mat)
            }
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            NodeValue::Scalar(_) => ValueType::Scalar,
            NodeValue::Matrix(mat) => ValueType::Matrix {
                rows: mat.nrows(),
                cols: mat.ncols(),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.value_type().element_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            NodeValue::Scalar(val) => Some(*val),
            NodeValue::Matrix(_) => None,
        }
    }

    /// Write all elements into `out`, which must have exactly `len()` entries.
    pub fn write_to_slice(&self, out: &mut [f64]) -> Result<(), SizeMismatch> {
        self.check_len(out.len())?;
        match self {
            NodeValue::Scalar(val) => out[0] = *val,
            NodeValue::Matrix(mat) => {
                let rows = mat.nrows();
                for j in 0..mat.ncols() {
                    for i in 0..rows {
                        out[j * rows + i] = mat[(i, j)];
                    }
                }
            }
        }
        Ok(())
    }

    /// Overwrite all elements from `source`, keeping the current shape.
    pub fn read_from_slice(&mut self, source: &[f64]) -> Result<(), SizeMismatch> {
        self.check_len(source.len())?;
        match self {
            NodeValue::Scalar(val) => *val = source[0],
            NodeValue::Matrix(mat) => {
                let rows = mat.nrows();
                for j in 0..mat.ncols() {
                    for i in 0..rows {
                        mat[(i, j)] = source[j * rows + i];
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply `f` to every element.
    pub fn map(&self, mut f: impl FnMut(f64) -> f64) -> NodeValue {
        match self {
            NodeValue::Scalar(val) => NodeValue::Scalar(f(*val)),
            NodeValue::Matrix(mat) => {
                NodeValue::Matrix(Mat::from_fn(mat.nrows(), mat.ncols(), |i, j| f(mat[(i, j)])))
            }
        }
    }

    /// Combine two values of the same shape elementwise.
    ///
    /// Panics if the shapes differ. Callers only pair a node's value with
    /// its own gradient or transform, which share the node's declared type.
    pub fn zip_map(&self, other: &NodeValue, mut f: impl FnMut(f64, f64) -> f64) -> NodeValue {
        match (self, other) {
            (NodeValue::Scalar(a), NodeValue::Scalar(b)) => NodeValue::Scalar(f(*a, *b)),
            (NodeValue::Matrix(a), NodeValue::Matrix(b)) => {
                assert!(a.nrows() == b.nrows() && a.ncols() == b.ncols());
                NodeValue::Matrix(Mat::from_fn(a.nrows(), a.ncols(), |i, j| f(a[(i, j)], b[(i, j)])))
            }
            _ => panic!("zip_map on values of different shape"),
        }
    }

    /// Fold over the elements in column-major order.
    pub fn fold<B>(&self, init: B, mut f: impl FnMut(B, f64) -> B) -> B {
        match self {
            NodeValue::Scalar(val) => f(init, *val),
            NodeValue::Matrix(mat) => {
                let mut acc = init;
                for j in 0..mat.ncols() {
                    for i in 0..mat.nrows() {
                        acc = f(acc, mat[(i, j)]);
                    }
                }
                acc
            }
        }
    }

    pub fn sum(&self) -> f64 {
        self.fold(0f64, |acc, x| acc + x)
    }

    fn check_len(&self, found: usize) -> Result<(), SizeMismatch> {
        let expected = self.len();
        if expected != found {
            return Err(SizeMismatch { expected, found });
        }
        Ok(())
    }
}
